//! Shared fixtures for core integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bitor_core::automation::{AutomationConfig, AutomationExecutor, FlushPolicy};
use bitor_core::clock::{TimeProvider, VirtualTimeProvider};
use bitor_core::cost::CostAccountant;
use bitor_core::database::InMemoryStore;
use bitor_core::domain::{
    Client, Job, JobId, KeyType, Provider, ProviderCredential, ProviderKind,
    ProviderSettings, ProviderUse, ScanProfile, TargetSet,
};
use bitor_core::error::Result;
use bitor_core::lifecycle::{LifecycleDeps, ScanLifecycleController};
use bitor_core::locks::JobLocks;
use bitor_core::ports::{
    JobEvent, JobStore, NotificationDispatcher, PricingApi, VaultEncryptor,
};
use bitor_core::registry::{AsyncJobRegistry, RegistryConfig};
use bitor_core::secrets::{MasterKeyCipher, SecretVaultBridge};
use bitor_core::workspace::ScanWorkspace;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const MASTER_KEY: &str = "integration-master-key";
pub const CLIENT_ID: &str = "client-1";
pub const PROFILE_ID: &str = "profile-1";
pub const TARGETS_ID: &str = "targets-1";
pub const COMPUTE_ID: &str = "do-1";
pub const STORAGE_ID: &str = "spaces-1";

/// `ansible-playbook` stand-in. Missing playbooks fail like the real tool,
/// syntax checks fail on `SYNTAX_ERROR`, runs of `generate.yml` copy the
/// deploy and destroy templates into the scan directory, `PAUSE_RUN` and
/// `SLEEP_RUN` delay the run, and playbooks containing `FAIL_RUN` exit
/// non-zero.
const FAKE_PLAYBOOK: &str = r#"#!/bin/sh
if [ "$1" = "--syntax-check" ]; then
  [ -f "$2" ] || { echo "ERROR! the playbook: $2 could not be found" >&2; exit 1; }
  if grep -q SYNTAX_ERROR "$2"; then
    echo "ERROR! We were unable to read either as JSON nor YAML: $2" >&2
    exit 4
  fi
  exit 0
fi
playbook="$1"
shift
[ -f "$playbook" ] || { echo "ERROR! the playbook: $playbook could not be found" >&2; exit 1; }
vars=""
pass=""
while [ $# -gt 0 ]; do
  case "$1" in
    --extra-vars) vars="${2#@}"; shift 2 ;;
    --vault-password-file) pass="$2"; shift 2 ;;
    *) shift ;;
  esac
done
scan_dir=$(dirname "$vars")
echo "PLAY [$(basename "$playbook")]"
if [ -s "$pass" ]; then
  echo "vault password available"
fi
if [ "$(basename "$playbook")" = "generate.yml" ]; then
  cp "$(dirname "$playbook")/templates/deploy.yml" "$scan_dir/deploy.yml"
  cp "$(dirname "$playbook")/templates/destroy.yml" "$scan_dir/destroy.yml"
fi
if grep -q PAUSE_RUN "$playbook"; then
  sleep 1
fi
if grep -q SLEEP_RUN "$playbook"; then
  sleep 30
fi
if grep -q FAIL_RUN "$playbook"; then
  echo "fatal: [scanner]: UNREACHABLE!" >&2
  exit 2
fi
echo "PLAY RECAP"
"#;

pub const VALID_PLAYBOOK: &str = "- hosts: localhost\n  gather_facts: false\n";

/// Hex encodes instead of encrypting; output looks like vault output.
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

/// Constant hourly price for every size.
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

/// Records every dispatched event.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<JobEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn dispatch(&self, event: JobEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Flush policy with short retry delays.
pub fn fast_flush() -> FlushPolicy {
    FlushPolicy {
        retry_base: Duration::from_millis(10),
        ..FlushPolicy::default()
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: InMemoryStore,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: VirtualTimeProvider,
    pub locks: JobLocks,
    pub controller: Arc<ScanLifecycleController>,
}

impl Harness {
    pub fn base(&self) -> &Path {
        self.dir.path()
    }

    /// Overwrites the deploy template copied in by `generate.yml`.
    pub fn set_deploy_template(&self, content: &str) {
        std::fs::write(self.base().join("templates/deploy.yml"), content)
            .expect("deploy template");
    }

    pub fn set_destroy_template(&self, content: &str) {
        std::fs::write(self.base().join("templates/destroy.yml"), content)
            .expect("destroy template");
    }

    pub fn set_generate_playbook(&self, content: &str) {
        std::fs::write(self.base().join("generate.yml"), content)
            .expect("generate playbook");
    }

    /// Inserts a fresh job referencing the seeded profile and targets.
    pub async fn new_job(&self, name: &str) -> Job {
        let mut job = Job::new(name, CLIENT_ID);
        job.profile_id = Some(PROFILE_ID.to_string());
        job.targets_id = Some(TARGETS_ID.to_string());
        job.created_at = self.clock.utc_now();
        self.store.insert_job(&job).await.expect("insert job");
        job
    }

    pub async fn log_lines(&self, id: JobId) -> Vec<String> {
        self.store
            .load_log(id)
            .await
            .expect("log")
            .iter()
            .map(|entry| entry.content.clone())
            .collect()
    }
}

fn write_executable(path: &Path, content: &str) {
    std::fs::write(path, content).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");
    }
}

pub fn fake_playbook_bin(dir: &Path) -> PathBuf {
    let bin = dir.join("bin");
    std::fs::create_dir_all(&bin).expect("bin dir");
    let path = bin.join("ansible-playbook");
    write_executable(&path, FAKE_PLAYBOOK);
    path
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
            nuclei_profile: serde_json::json!({"severity": ["critical"]}),
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
                do_project: Some("bitor".to_string()),
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
                scans_path: Some("scans/".to_string()),
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

/// A controller over an in-memory store and a temp automation tree driven
/// by the fake playbook binary.
pub async fn harness() -> Harness {
    harness_with_timeout(Duration::from_secs(20)).await
}

/// Like [`harness`], with a custom automation deadline.
pub async fn harness_with_timeout(timeout: Duration) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let playbook_bin = fake_playbook_bin(dir.path());
    std::fs::create_dir_all(dir.path().join("templates")).expect("templates");

    let store = InMemoryStore::new();
    let cipher = MasterKeyCipher::new(MASTER_KEY).expect("cipher");
    seed(&store, &cipher).await;

    let clock = VirtualTimeProvider::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let jobs = Arc::new(store.clone());
    let locks = JobLocks::new();
    let bridge = Arc::new(SecretVaultBridge::new(
        jobs.clone(),
        cipher,
        Arc::new(HexVault),
    ));
    let accountant = Arc::new(CostAccountant::new(
        jobs.clone(),
        jobs.clone(),
        Arc::clone(&bridge),
        Arc::new(FixedPricing(Decimal::new(10, 2))),
        Arc::new(clock.clone()),
        locks.clone(),
    ));
    let executor = AutomationExecutor::new(AutomationConfig {
        base_path: dir.path().to_path_buf(),
        playbook_bin,
        timeout,
        ..AutomationConfig::default()
    });

    let controller = ScanLifecycleController::new(LifecycleDeps {
        jobs: jobs.clone(),
        records: jobs,
        bridge,
        executor,
        workspace: ScanWorkspace::new(dir.path()),
        accountant,
        registry: AsyncJobRegistry::new(
            RegistryConfig::default(),
            Arc::new(clock.clone()),
        ),
        notifier: notifier.clone(),
        locks: locks.clone(),
        clock: Arc::new(clock.clone()),
        flush_policy: fast_flush(),
    });

    let harness = Harness {
        dir,
        store,
        notifier,
        clock,
        locks,
        controller,
    };
    harness.set_generate_playbook(VALID_PLAYBOOK);
    harness.set_deploy_template(VALID_PLAYBOOK);
    harness.set_destroy_template(VALID_PLAYBOOK);
    harness
}

/// Polls a background job until it leaves `running`.
pub async fn wait_for_progress(
    controller: &ScanLifecycleController,
    id: bitor_core::registry::ProgressId,
) -> bitor_core::registry::JobProgress {
    use bitor_core::registry::ProgressStatus;

    for _ in 0..200 {
        let progress = controller.registry().get_progress(id).expect("progress");
        if progress.status != ProgressStatus::Running {
            return progress;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("background job {id} did not finish");
}
