use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::domain::ProviderKind;
use crate::error::{BitorError, Result};
use crate::ports::PricingApi;

pub const DEFAULT_API_BASE: &str = "https://api.digitalocean.com";

const PAGE_SIZE: u32 = 200;
/// Upper bound on followed pages, in case `next` links loop.
const MAX_PAGES: usize = 50;

#[derive(Debug, Deserialize)]
struct SizesPage {
    #[serde(default)]
    sizes: Vec<Size>,
    #[serde(default)]
    links: Links,
}

#[derive(Debug, Deserialize)]
struct Size {
    slug: String,
    price_hourly: f64,
    #[serde(default)]
    regions: Vec<String>,
    #[serde(default = "available_by_default")]
    available: bool,
}

fn available_by_default() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    #[serde(default)]
    pages: Pages,
}

#[derive(Debug, Default, Deserialize)]
struct Pages {
    #[serde(default)]
    next: Option<String>,
}

impl SizesPage {
    fn price_of(&self, region: &str, slug: &str) -> Option<f64> {
        self.sizes
            .iter()
            .filter(|size| size.available)
            .filter(|size| size.regions.iter().any(|r| r == region))
            .find(|size| size.slug == slug)
            .map(|size| size.price_hourly)
    }
}

/// Hourly droplet prices from the DigitalOcean sizes listing.
#[derive(Debug, Clone)]
pub struct DigitalOceanPricing {
    http_client: reqwest::Client,
    base_url: Url,
}

impl DigitalOceanPricing {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| {
            BitorError::validation(format!("invalid pricing API url {base_url}: {e}"))
        })?;
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                BitorError::Pricing(format!("Failed to create HTTP client: {e}"))
            })?;
        Ok(Self {
            http_client,
            base_url,
        })
    }

    fn first_page(&self) -> Result<Url> {
        let mut url = self.base_url.join("/v2/sizes").map_err(|e| {
            BitorError::Pricing(format!("Failed to build sizes url: {e}"))
        })?;
        url.query_pairs_mut()
            .append_pair("page", "1")
            .append_pair("per_page", &PAGE_SIZE.to_string());
        Ok(url)
    }

    async fn fetch_page(&self, url: &str, api_key: &str) -> Result<SizesPage> {
        let response = self
            .http_client
            .get(url)
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|e| {
                BitorError::Pricing(format!("Failed to fetch sizes: {e}"))
            })?;

        if !response.status().is_success() {
            return Err(BitorError::Pricing(format!(
                "Failed to fetch sizes: HTTP {}",
                response.status()
            )));
        }

        response.json::<SizesPage>().await.map_err(|e| {
            BitorError::Pricing(format!("Failed to decode sizes: {e}"))
        })
    }
}

#[async_trait]
impl PricingApi for DigitalOceanPricing {
    async fn hourly_price(
        &self,
        kind: ProviderKind,
        api_key: &str,
        region: &str,
        size: &str,
    ) -> Result<Decimal> {
        if kind != ProviderKind::Digitalocean {
            return Err(BitorError::Pricing(format!(
                "pricing is not available for {kind} providers"
            )));
        }

        let mut next = Some(self.first_page()?.to_string());
        let mut pages = 0;
        while let Some(url) = next.take() {
            pages += 1;
            if pages > MAX_PAGES {
                break;
            }
            let page = self.fetch_page(&url, api_key).await?;
            if let Some(price) = page.price_of(region, size) {
                debug!(region, size, price, "resolved hourly price");
                return hourly_decimal(price);
            }
            next = page.links.pages.next;
        }

        Err(BitorError::Pricing(format!(
            "size {size} is not available in region {region}"
        )))
    }
}

/// Converts through the shortest decimal form of the float so `0.1` stays
/// `0.1` rather than its binary expansion.
fn hourly_decimal(price: f64) -> Result<Decimal> {
    Decimal::from_str(&price.to_string()).map_err(|e| {
        BitorError::Pricing(format!("invalid hourly price {price}: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> SizesPage {
        serde_json::from_value(serde_json::json!({
            "sizes": [
                {
                    "slug": "s-1vcpu-1gb",
                    "price_hourly": 0.00893,
                    "regions": ["nyc1", "nyc3"],
                    "available": true
                },
                {
                    "slug": "s-2vcpu-4gb",
                    "price_hourly": 0.03571,
                    "regions": ["ams3"],
                    "available": true
                },
                {
                    "slug": "c-4",
                    "price_hourly": 0.125,
                    "regions": ["nyc3"],
                    "available": false
                }
            ],
            "links": {"pages": {"next": "https://api.digitalocean.com/v2/sizes?page=2&per_page=200"}}
        }))
        .expect("page")
    }

    #[test]
    fn price_requires_matching_region_and_availability() {
        let page = page();
        assert_eq!(page.price_of("nyc3", "s-1vcpu-1gb"), Some(0.00893));
        assert_eq!(page.price_of("nyc3", "s-2vcpu-4gb"), None);
        assert_eq!(page.price_of("nyc3", "c-4"), None);
        assert!(page.links.pages.next.is_some());
    }

    #[test]
    fn hourly_price_keeps_its_decimal_form() {
        assert_eq!(hourly_decimal(0.1).expect("decimal"), Decimal::new(1, 1));
        assert_eq!(
            hourly_decimal(0.00893).expect("decimal"),
            Decimal::new(893, 5)
        );
    }

    #[test]
    fn first_page_asks_for_large_pages() {
        let pricing =
            DigitalOceanPricing::new("https://api.example.test").expect("client");
        let url = pricing.first_page().expect("url");
        assert_eq!(url.path(), "/v2/sizes");
        assert_eq!(url.query(), Some("page=1&per_page=200"));
    }

    #[tokio::test]
    async fn other_providers_are_rejected() {
        let pricing =
            DigitalOceanPricing::new(DEFAULT_API_BASE).expect("client");
        let err = pricing
            .hourly_price(ProviderKind::Aws, "token", "us-east-1", "t3.micro")
            .await
            .expect_err("aws pricing");
        assert!(matches!(err, BitorError::Pricing(_)));
    }
}
