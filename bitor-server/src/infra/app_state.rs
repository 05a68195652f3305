use std::{fmt, sync::Arc};

use bitor_core::automation::{AutomationExecutor, FlushPolicy};
use bitor_core::clock::TimeProvider;
use bitor_core::cost::CostAccountant;
use bitor_core::lifecycle::{LifecycleDeps, ScanLifecycleController};
use bitor_core::locks::JobLocks;
use bitor_core::ports::{
    JobStore, NotificationDispatcher, PricingApi, RecordStore, VaultEncryptor,
};
use bitor_core::registry::{AsyncJobRegistry, RegistryConfig};
use bitor_core::secrets::{MasterKeyCipher, SecretVaultBridge};
use bitor_core::workspace::ScanWorkspace;

use crate::infra::config::Config;
use crate::storage::ArchivePresigner;

/// External collaborators the server is assembled from. `main` wires the
/// production implementations; tests substitute fakes.
pub struct StateParts {
    pub jobs: Arc<dyn JobStore>,
    pub records: Arc<dyn RecordStore>,
    pub cipher: MasterKeyCipher,
    pub vault: Arc<dyn VaultEncryptor>,
    pub pricing: Arc<dyn PricingApi>,
    pub notifier: Arc<dyn NotificationDispatcher>,
    pub clock: Arc<dyn TimeProvider>,
}

impl fmt::Debug for StateParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateParts").finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub controller: Arc<ScanLifecycleController>,
    pub accountant: Arc<CostAccountant>,
    pub presigner: Arc<ArchivePresigner>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(config: Config, parts: StateParts) -> Self {
        let locks = JobLocks::new();
        let bridge = Arc::new(SecretVaultBridge::new(
            Arc::clone(&parts.records),
            parts.cipher,
            parts.vault,
        ));
        let accountant = Arc::new(CostAccountant::new(
            Arc::clone(&parts.jobs),
            Arc::clone(&parts.records),
            Arc::clone(&bridge),
            parts.pricing,
            Arc::clone(&parts.clock),
            locks.clone(),
        ));

        let controller = ScanLifecycleController::new(LifecycleDeps {
            jobs: parts.jobs,
            records: parts.records,
            bridge,
            executor: AutomationExecutor::new(config.automation()),
            workspace: ScanWorkspace::new(&config.ansible_base_path),
            accountant: Arc::clone(&accountant),
            registry: AsyncJobRegistry::new(
                RegistryConfig::default(),
                Arc::clone(&parts.clock),
            ),
            notifier: parts.notifier,
            locks,
            clock: parts.clock,
            flush_policy: FlushPolicy::default(),
        });

        Self {
            config: Arc::new(config),
            controller,
            accountant,
            presigner: Arc::new(ArchivePresigner::default()),
        }
    }
}
