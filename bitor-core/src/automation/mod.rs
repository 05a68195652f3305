pub mod checkpointer;
pub mod executor;

pub use checkpointer::{FlushPolicy, LogCheckpointer};
pub use executor::{
    AUTOMATION_LOG_FILE, AutomationConfig, AutomationExecutor, PlaybookRun,
    VAULT_PASSWORD_FILE,
};
