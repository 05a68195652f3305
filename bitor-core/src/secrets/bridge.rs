//! Builds the job's configuration document with credentials re-encrypted
//! under the job's own vault password.

use std::fmt::{self, Write as _};
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::domain::{
    EphemeralSecret, Job, KeyType, Provider, ProviderKind, ScanProfile,
};
use crate::error::{BitorError, Result};
use crate::ports::{RecordStore, VaultEncryptor};

use super::master_key::MasterKeyCipher;
use super::vault::indent_vault_block;

/// Decrypted credentials of one provider, held only for the duration of a
/// render or signing call.
#[derive(Default)]
pub struct ProviderKeys {
    pub api_key: Option<Zeroizing<String>>,
    pub access_key: Option<Zeroizing<String>>,
    pub secret_key: Option<Zeroizing<String>>,
}

impl fmt::Debug for ProviderKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderKeys")
            .field("api_key", &self.api_key.is_some())
            .field("access_key", &self.access_key.is_some())
            .field("secret_key", &self.secret_key.is_some())
            .finish()
    }
}

impl ProviderKeys {
    fn require(
        key: &Option<Zeroizing<String>>,
        key_type: KeyType,
        provider: &Provider,
    ) -> Result<Zeroizing<String>> {
        key.clone().ok_or_else(|| {
            BitorError::validation(format!(
                "{} not found for provider {}",
                key_type.as_str(),
                provider.id
            ))
        })
    }

    pub fn require_access(&self, provider: &Provider) -> Result<Zeroizing<String>> {
        Self::require(&self.access_key, KeyType::AccessKey, provider)
    }

    pub fn require_secret(&self, provider: &Provider) -> Result<Zeroizing<String>> {
        Self::require(&self.secret_key, KeyType::SecretKey, provider)
    }

    pub fn require_api(&self, provider: &Provider) -> Result<Zeroizing<String>> {
        Self::require(&self.api_key, KeyType::ApiKey, provider)
    }
}

pub struct SecretVaultBridge {
    records: Arc<dyn RecordStore>,
    cipher: MasterKeyCipher,
    vault: Arc<dyn VaultEncryptor>,
}

impl fmt::Debug for SecretVaultBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretVaultBridge").finish_non_exhaustive()
    }
}

impl SecretVaultBridge {
    pub fn new(
        records: Arc<dyn RecordStore>,
        cipher: MasterKeyCipher,
        vault: Arc<dyn VaultEncryptor>,
    ) -> Self {
        Self {
            records,
            cipher,
            vault,
        }
    }

    pub fn cipher(&self) -> &MasterKeyCipher {
        &self.cipher
    }

    /// Decrypts every stored credential of `provider` and checks the ones
    /// its kind requires.
    pub async fn decrypt_credentials(
        &self,
        provider: &Provider,
    ) -> Result<ProviderKeys> {
        let credentials = self.records.provider_credentials(&provider.id).await?;
        tracing::debug!(
            provider_id = %provider.id,
            count = credentials.len(),
            "decrypting provider credentials"
        );

        let mut keys = ProviderKeys::default();
        for credential in credentials {
            let plaintext = match self.cipher.decrypt_string(&credential.ciphertext)
            {
                Ok(plaintext) => plaintext,
                Err(err) => {
                    tracing::warn!(
                        provider_id = %provider.id,
                        key_type = credential.key_type.as_str(),
                        "skipping credential that failed to decrypt: {err}"
                    );
                    continue;
                }
            };
            match (provider.kind, credential.key_type) {
                // Compute providers authenticate with a single token.
                (ProviderKind::Digitalocean, _) => keys.api_key = Some(plaintext),
                (_, KeyType::AccessKey) => keys.access_key = Some(plaintext),
                (_, KeyType::SecretKey) => keys.secret_key = Some(plaintext),
                (_, KeyType::ApiKey) => keys.api_key = Some(plaintext),
            }
        }

        match provider.kind {
            ProviderKind::S3 | ProviderKind::Aws => {
                keys.require_access(provider)?;
                keys.require_secret(provider)?;
            }
            ProviderKind::Digitalocean => {
                keys.require_api(provider)?;
            }
        }
        Ok(keys)
    }

    async fn vaulted(
        &self,
        name: &str,
        plaintext: &str,
        secret: &EphemeralSecret,
    ) -> Result<String> {
        let payload = self
            .vault
            .encrypt_string(name, plaintext, secret.expose())
            .await?;
        Ok(indent_vault_block(&payload))
    }

    /// Renders `scan.yaml` for `job`.
    pub async fn render_scan_config(
        &self,
        job: &Job,
        profile: &ScanProfile,
        secret: &EphemeralSecret,
    ) -> Result<String> {
        let client = self.records.get_client(&job.client_id).await?;
        let (interact_url, interact_token) = match job.interact_id.as_deref() {
            Some(id) => {
                let interact = self.records.get_interact(id).await?;
                (interact.url, interact.token)
            }
            None => (String::new(), String::new()),
        };

        let mut doc = String::from("---\n");
        writeln!(doc, "client: {}", quote(&client.name))?;
        writeln!(doc, "client_hidden_name: {}", quote(&client.hidden_name))?;
        writeln!(doc, "client_id: {}", quote(&client.id))?;
        writeln!(doc, "interact_url: {}", quote(&interact_url))?;
        writeln!(doc, "interact_token: {}", quote(&interact_token))?;
        writeln!(doc, "api_key: {}", quote(secret.expose()))?;

        let mut storage = String::new();
        for (block, provider_id) in [
            ("state", profile.state_bucket.as_deref()),
            ("scan", profile.scan_bucket.as_deref()),
        ] {
            let Some(provider_id) = provider_id else {
                continue;
            };
            let provider = self.records.get_provider(provider_id).await?;
            if provider.kind != ProviderKind::S3 {
                tracing::debug!(
                    provider_id,
                    kind = %provider.kind,
                    "{block} bucket provider is not s3 storage, skipping"
                );
                continue;
            }
            storage.push_str(
                &self.render_bucket(block, &provider, secret).await?,
            );
        }
        if !storage.is_empty() {
            doc.push_str("s3:\n");
            doc.push_str(&storage);
        }

        let vm_provider = self.records.get_provider(&profile.vm_provider).await?;
        doc.push_str(
            &self
                .render_compute(job, profile, &vm_provider, secret)
                .await?,
        );
        Ok(doc)
    }

    async fn render_bucket(
        &self,
        block: &str,
        provider: &Provider,
        secret: &EphemeralSecret,
    ) -> Result<String> {
        let keys = self.decrypt_credentials(provider).await?;
        let settings = &provider.settings;
        let path = if block == "state" {
            settings.statefile_path.as_deref()
        } else {
            settings.scans_path.as_deref()
        };

        let mut out = String::new();
        writeln!(out, "  {block}:")?;
        writeln!(out, "    bucket: {}", quote_opt(settings.bucket.as_deref()))?;
        writeln!(
            out,
            "    endpoint: {}",
            quote_opt(settings.endpoint.as_deref())
        )?;
        writeln!(out, "    region: {}", quote_opt(settings.region.as_deref()))?;
        writeln!(out, "    use_path_style: {}", settings.use_path_style)?;
        writeln!(out, "    path: {}", quote_opt(path))?;
        writeln!(out, "    provider_id: {}", quote(&provider.id))?;
        let access = keys.require_access(provider)?;
        let secret_key = keys.require_secret(provider)?;
        writeln!(out, "    access_key: !vault |")?;
        writeln!(out, "{}", self.vaulted("access_key", &access, secret).await?)?;
        writeln!(out, "    secret_key: !vault |")?;
        writeln!(
            out,
            "{}",
            self.vaulted("secret_key", &secret_key, secret).await?
        )?;
        Ok(out)
    }

    async fn render_compute(
        &self,
        job: &Job,
        profile: &ScanProfile,
        provider: &Provider,
        secret: &EphemeralSecret,
    ) -> Result<String> {
        let keys = self.decrypt_credentials(provider).await?;
        let settings = &provider.settings;
        let mut out = String::new();

        match provider.kind {
            ProviderKind::Digitalocean => {
                let size = job
                    .vm_size
                    .as_deref()
                    .or(profile.vm_size.as_deref())
                    .filter(|size| !size.is_empty())
                    .ok_or_else(|| {
                        BitorError::validation("vm_size not found in scan profile")
                    })?;
                let api_key = keys.require_api(provider)?;
                writeln!(out, "vm:")?;
                writeln!(out, "  provider_service: \"DigitalOcean\"")?;
                writeln!(out, "  provider_key: !vault |")?;
                writeln!(
                    out,
                    "{}",
                    self.vaulted("provider_key", &api_key, secret).await?
                )?;
                writeln!(
                    out,
                    "  do_project: {}",
                    quote_opt(settings.do_project.as_deref())
                )?;
                writeln!(
                    out,
                    "  do_region: {}",
                    quote_opt(settings.region.as_deref())
                )?;
                writeln!(out, "  tags: {}", quote(&settings.tags.join(",")))?;
                writeln!(out, "  do_size: {}", quote(size))?;
            }
            ProviderKind::Aws => {
                let access = keys.require_access(provider)?;
                let secret_key = keys.require_secret(provider)?;
                writeln!(out, "vm:")?;
                writeln!(out, "  provider_service: \"AWS\"")?;
                writeln!(
                    out,
                    "  account_id: {}",
                    quote_opt(settings.account_id.as_deref())
                )?;
                writeln!(out, "provider:")?;
                writeln!(out, "  name: \"aws\"")?;
                writeln!(out, "  region: {}", quote_opt(settings.region.as_deref()))?;
                writeln!(out, "  api_key: !vault |")?;
                writeln!(out, "{}", self.vaulted("api_key", &access, secret).await?)?;
                writeln!(out, "  secret_key: !vault |")?;
                writeln!(
                    out,
                    "{}",
                    self.vaulted("secret_key", &secret_key, secret).await?
                )?;
            }
            ProviderKind::S3 => {
                return Err(BitorError::validation(format!(
                    "provider {} cannot provision compute",
                    provider.id
                )));
            }
        }
        Ok(out)
    }
}

fn quote(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn quote_opt(value: Option<&str>) -> String {
    quote(value.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryStore;
    use crate::domain::{
        Client, ProviderCredential, ProviderSettings, ProviderUse,
    };
    use async_trait::async_trait;

    const MASTER_KEY: &str = "unit-test-master-key";

    /// Stands in for `ansible-vault`, hex encoding instead of encrypting.
    struct HexVault;

    #[async_trait]
    impl VaultEncryptor for HexVault {
        async fn encrypt_string(
            &self,
            _name: &str,
            plaintext: &str,
            vault_password: &str,
        ) -> Result<String> {
            assert!(!vault_password.is_empty());
            Ok(format!(
                "$ANSIBLE_VAULT;1.1;AES256\n{}",
                hex::encode(plaintext)
            ))
        }
    }

    fn provider(id: &str, kind: ProviderKind, uses: Vec<ProviderUse>) -> Provider {
        Provider {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            uses,
            settings: ProviderSettings {
                region: Some("nyc3".to_string()),
                endpoint: Some("https://nyc3.digitaloceanspaces.com".to_string()),
                bucket: Some("bitor-scans".to_string()),
                scans_path: Some("scans/".to_string()),
                do_project: Some("bitor".to_string()),
                tags: vec!["scan".to_string(), "bitor".to_string()],
                ..ProviderSettings::default()
            },
        }
    }

    async fn seal(
        store: &InMemoryStore,
        cipher: &MasterKeyCipher,
        provider_id: &str,
        key_type: KeyType,
        value: &str,
    ) {
        store
            .put_credential(ProviderCredential {
                provider_id: provider_id.to_string(),
                key_type,
                ciphertext: cipher.encrypt(value.as_bytes()).expect("seal"),
            })
            .await;
    }

    async fn fixture() -> (InMemoryStore, SecretVaultBridge) {
        let store = InMemoryStore::new();
        let cipher = MasterKeyCipher::new(MASTER_KEY).expect("cipher");
        store
            .put_client(Client {
                id: "client-1".to_string(),
                name: "Acme".to_string(),
                hidden_name: "Client A".to_string(),
            })
            .await;
        store
            .put_provider(provider("do-1", ProviderKind::Digitalocean, vec![ProviderUse::Compute]))
            .await;
        store
            .put_provider(provider("s3-1", ProviderKind::S3, vec![ProviderUse::ScanStorage]))
            .await;
        seal(&store, &cipher, "do-1", KeyType::ApiKey, "dop_v1_secret_token").await;
        seal(&store, &cipher, "s3-1", KeyType::AccessKey, "AKIAEXAMPLE").await;
        seal(&store, &cipher, "s3-1", KeyType::SecretKey, "s3-secret-value").await;

        let bridge = SecretVaultBridge::new(
            Arc::new(store.clone()),
            cipher,
            Arc::new(HexVault),
        );
        (store, bridge)
    }

    fn profile() -> ScanProfile {
        ScanProfile {
            id: "profile-1".to_string(),
            vm_size: Some("s-1vcpu-1gb".to_string()),
            vm_provider: "do-1".to_string(),
            state_bucket: None,
            scan_bucket: Some("s3-1".to_string()),
            nuclei_profile: serde_json::json!({"severity": ["high"]}),
        }
    }

    #[tokio::test]
    async fn rendered_config_vaults_every_credential() {
        let (_store, bridge) = fixture().await;
        let job = Job::new("weekly", "client-1");
        let secret = EphemeralSecret::from_string("job-secret");

        let doc = bridge
            .render_scan_config(&job, &profile(), &secret)
            .await
            .expect("render");

        assert!(doc.starts_with("---\nclient: \"Acme\"\n"));
        assert!(doc.contains("client_hidden_name: \"Client A\""));
        assert!(doc.contains("api_key: \"job-secret\""));
        assert!(doc.contains("  scan:\n    bucket: \"bitor-scans\""));
        assert!(doc.contains("provider_service: \"DigitalOcean\""));
        assert!(doc.contains("do_size: \"s-1vcpu-1gb\""));
        assert!(doc.contains("tags: \"scan,bitor\""));
        assert!(doc.contains("provider_key: !vault |\n      $ANSIBLE_VAULT;1.1;AES256"));
        for plaintext in ["dop_v1_secret_token", "AKIAEXAMPLE", "s3-secret-value"] {
            assert!(!doc.contains(plaintext), "{plaintext} leaked");
        }
    }

    #[tokio::test]
    async fn storage_without_secret_key_fails_before_rendering() {
        let (store, bridge) = fixture().await;
        store
            .put_provider(provider("s3-2", ProviderKind::S3, vec![ProviderUse::ScanStorage]))
            .await;
        seal(&store, bridge.cipher(), "s3-2", KeyType::AccessKey, "AKIAONLY").await;

        let mut profile = profile();
        profile.scan_bucket = Some("s3-2".to_string());
        let err = bridge
            .render_scan_config(
                &Job::new("weekly", "client-1"),
                &profile,
                &EphemeralSecret::from_string("job-secret"),
            )
            .await
            .expect_err("missing secret key");
        assert!(
            matches!(&err, BitorError::Validation(msg) if msg == "secret_key not found for provider s3-2"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn digitalocean_keys_are_api_tokens() {
        let (store, bridge) = fixture().await;
        seal(&store, bridge.cipher(), "do-1", KeyType::AccessKey, "dop_v1_other").await;
        let provider = provider("do-1", ProviderKind::Digitalocean, vec![]);

        let keys = bridge.decrypt_credentials(&provider).await.expect("keys");
        assert!(keys.api_key.is_some());
        assert!(keys.access_key.is_none());
        assert!(!format!("{keys:?}").contains("dop_v1"));
    }

    #[tokio::test]
    async fn missing_vm_size_is_a_validation_error() {
        let (_store, bridge) = fixture().await;
        let mut profile = profile();
        profile.vm_size = None;
        let err = bridge
            .render_scan_config(
                &Job::new("weekly", "client-1"),
                &profile,
                &EphemeralSecret::from_string("job-secret"),
            )
            .await
            .expect_err("no size");
        assert!(matches!(err, BitorError::Validation(_)));
    }
}
