//! Shared fixtures for server HTTP tests.

#![allow(dead_code)]

use async_trait::async_trait;
use axum_test::TestServer;
use bitor_core::clock::{TimeProvider, VirtualTimeProvider};
use bitor_core::database::InMemoryStore;
use bitor_core::domain::{
    Client, EphemeralSecret, Job, JobStatus, KeyType, Provider,
    ProviderCredential, ProviderKind, ProviderSettings, ProviderUse,
    ScanProfile, TargetSet,
};
use bitor_core::error::Result;
use bitor_core::ports::{JobStore, PricingApi, TracingNotifier, VaultEncryptor};
use bitor_core::secrets::MasterKeyCipher;
use bitor_server::infra::app_state::{AppState, StateParts};
use bitor_server::infra::config::Config;
use bitor_server::routes::create_router;
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

pub const API_TOKEN: &str = "operator-token";
pub const CALLBACK_SECRET: &str = "workload-secret";
pub const MASTER_KEY: &str = "server-test-master-key";
pub const CLIENT_ID: &str = "client-1";
pub const PROFILE_ID: &str = "profile-1";
pub const TARGETS_ID: &str = "targets-1";
pub const COMPUTE_ID: &str = "do-1";
pub const STORAGE_ID: &str = "spaces-1";

pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

#[derive(Debug, Default)]
pub struct HexVault;

#[async_trait]
impl VaultEncryptor for HexVault {
    async fn encrypt_string(
        &self,
        _name: &str,
        plaintext: &str,
        _vault_password: &str,
    ) -> Result<String> {
        Ok(format!("$ANSIBLE_VAULT;1.1;AES256\n{}", hex::encode(plaintext)))
    }
}

#[derive(Debug)]
pub struct FixedPricing(pub Decimal);

#[async_trait]
impl PricingApi for FixedPricing {
    async fn hourly_price(
        &self,
        _kind: ProviderKind,
        _api_key: &str,
        _region: &str,
        _size: &str,
    ) -> Result<Decimal> {
        Ok(self.0)
    }
}

pub struct TestApp {
    pub dir: tempfile::TempDir,
    pub store: InMemoryStore,
    pub clock: VirtualTimeProvider,
    pub state: AppState,
    pub server: TestServer,
}

impl TestApp {
    /// Inserts a job in `status` whose callbacks accept [`CALLBACK_SECRET`].
    pub async fn job_in(&self, status: JobStatus) -> Job {
        let mut job = Job::new("http scan", CLIENT_ID);
        job.profile_id = Some(PROFILE_ID.to_string());
        job.targets_id = Some(TARGETS_ID.to_string());
        job.vm_provider_id = Some(COMPUTE_ID.to_string());
        job.vm_size = Some("s-1vcpu-1gb".to_string());
        job.status = status;
        job.created_at = self.clock.utc_now();
        if status != JobStatus::Created {
            job.ephemeral_secret = Some(EphemeralSecret::from_string(CALLBACK_SECRET));
            job.start_time = Some(self.clock.utc_now());
        }
        self.store.insert_job(&job).await.expect("insert job");
        job
    }

    pub async fn job(&self, job: &Job) -> Job {
        self.store.get_job(job.id).await.expect("job")
    }
}

async fn seed(store: &InMemoryStore, cipher: &MasterKeyCipher) {
    store
        .put_client(Client {
            id: CLIENT_ID.to_string(),
            name: "Acme".to_string(),
            hidden_name: "Client A".to_string(),
        })
        .await;
    store
        .put_targets(TargetSet {
            id: TARGETS_ID.to_string(),
            targets: serde_json::json!({"domains": ["example.com"]}),
        })
        .await;
    store
        .put_profile(ScanProfile {
            id: PROFILE_ID.to_string(),
            vm_size: Some("s-1vcpu-1gb".to_string()),
            vm_provider: COMPUTE_ID.to_string(),
            state_bucket: None,
            scan_bucket: Some(STORAGE_ID.to_string()),
            nuclei_profile: serde_json::json!({"severity": ["high"]}),
        })
        .await;
    store
        .put_provider(Provider {
            id: COMPUTE_ID.to_string(),
            name: "DigitalOcean".to_string(),
            kind: ProviderKind::Digitalocean,
            uses: vec![ProviderUse::Compute],
            settings: ProviderSettings {
                region: Some("nyc3".to_string()),
                ..ProviderSettings::default()
            },
        })
        .await;
    store
        .put_provider(Provider {
            id: STORAGE_ID.to_string(),
            name: "Spaces".to_string(),
            kind: ProviderKind::S3,
            uses: vec![ProviderUse::ScanStorage],
            settings: ProviderSettings {
                region: Some("nyc3".to_string()),
                endpoint: Some("https://nyc3.digitaloceanspaces.com".to_string()),
                bucket: Some("bitor-scans".to_string()),
                use_path_style: true,
                ..ProviderSettings::default()
            },
        })
        .await;
    for (provider_id, key_type, value) in [
        (COMPUTE_ID, KeyType::ApiKey, "dop_v1_token"),
        (STORAGE_ID, KeyType::AccessKey, "SPACES_ACCESS"),
        (STORAGE_ID, KeyType::SecretKey, "spaces-secret"),
    ] {
        store
            .put_credential(ProviderCredential {
                provider_id: provider_id.to_string(),
                key_type,
                ciphertext: cipher.encrypt(value.as_bytes()).expect("seal"),
            })
            .await;
    }
}

pub fn test_config(base: &Path) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        ansible_base_path: base.to_path_buf(),
        master_key: Zeroizing::new(MASTER_KEY.to_string()),
        show_ansible_logs: false,
        api_token: Zeroizing::new(API_TOKEN.to_string()),
        playbook_bin: base.join("bin/ansible-playbook"),
        vault_bin: base.join("bin/ansible-vault"),
        automation_timeout: Duration::from_secs(20),
        cost_sweep_interval: None,
        database_url: None,
        seed_file: None,
        digitalocean_api_base: "http://127.0.0.1:9".to_string(),
    }
}

pub async fn test_app() -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = InMemoryStore::new();
    let cipher = MasterKeyCipher::new(MASTER_KEY).expect("cipher");
    seed(&store, &cipher).await;

    let clock = VirtualTimeProvider::new();
    let shared = Arc::new(store.clone());
    let state = AppState::new(
        test_config(dir.path()),
        StateParts {
            jobs: shared.clone(),
            records: shared,
            cipher,
            vault: Arc::new(HexVault),
            pricing: Arc::new(FixedPricing(Decimal::new(10, 2))),
            notifier: Arc::new(TracingNotifier),
            clock: Arc::new(clock.clone()),
        },
    );
    let server = TestServer::new(create_router(state.clone())).expect("test server");

    TestApp {
        dir,
        store,
        clock,
        state,
        server,
    }
}
