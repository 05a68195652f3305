//! Credential handling: the master key cipher for values at rest and the
//! bridge that re-encrypts them per job.

pub mod bridge;
pub mod master_key;
pub mod vault;

pub use bridge::{ProviderKeys, SecretVaultBridge};
pub use master_key::{MasterKeyCipher, verify_master_key};
pub use vault::{AnsibleVault, clean_vault_output, indent_vault_block};
