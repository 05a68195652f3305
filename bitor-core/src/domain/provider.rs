use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    S3,
    Digitalocean,
    Aws,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::S3 => "s3",
            ProviderKind::Digitalocean => "digitalocean",
            ProviderKind::Aws => "aws",
        };
        f.write_str(name)
    }
}

/// What a provider record may be used for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderUse {
    Compute,
    TerraformStorage,
    ScanStorage,
}

/// Provider settings. Every field is optional because each provider kind
/// only reads its own subset.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub use_path_style: bool,
    #[serde(default)]
    pub statefile_path: Option<String>,
    #[serde(default)]
    pub scans_path: Option<String>,
    #[serde(default, alias = "project")]
    pub do_project: Option<String>,
    #[serde(default, deserialize_with = "tags::deserialize")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    /// Fallback VM size when a job carries none.
    #[serde(default)]
    pub size: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub uses: Vec<ProviderUse>,
    #[serde(default)]
    pub settings: ProviderSettings,
}

impl Provider {
    pub fn has_use(&self, wanted: ProviderUse) -> bool {
        self.uses.contains(&wanted)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    ApiKey,
    AccessKey,
    SecretKey,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::ApiKey => "api_key",
            KeyType::AccessKey => "access_key",
            KeyType::SecretKey => "secret_key",
        }
    }
}

/// A provider credential as stored: ciphertext under the master key.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderCredential {
    pub provider_id: String,
    pub key_type: KeyType,
    pub ciphertext: String,
}

impl fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredential")
            .field("provider_id", &self.provider_id)
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}

mod tags {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Tags {
        Joined(String),
        List(Vec<String>),
    }

    /// Tags arrive either as a comma separated string or as a list.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let tags = match Option::<Tags>::deserialize(deserializer)? {
            None => Vec::new(),
            Some(Tags::List(list)) => list,
            Some(Tags::Joined(joined)) => joined
                .split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(str::to_string)
                .collect(),
        };
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_accept_comma_separated_tags() {
        let settings: ProviderSettings = serde_json::from_value(
            serde_json::json!({"region": "nyc3", "tags": "scan, bitor,"}),
        )
        .unwrap();
        assert_eq!(settings.tags, vec!["scan", "bitor"]);
        assert_eq!(settings.region.as_deref(), Some("nyc3"));
    }

    #[test]
    fn credential_debug_hides_ciphertext() {
        let credential = ProviderCredential {
            provider_id: "p1".into(),
            key_type: KeyType::ApiKey,
            ciphertext: "c2VjcmV0".into(),
        };
        assert!(!format!("{credential:?}").contains("c2VjcmV0"));
    }
}
