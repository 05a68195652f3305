//! Process configuration, read from the environment (and `.env`) with
//! command line overrides.

use clap::{Args as ClapArgs, Parser};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use zeroize::Zeroizing;

use bitor_core::automation::AutomationConfig;
use bitor_core::pricing::DEFAULT_API_BASE;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("API_ENCRYPTION_KEY is required")]
    MissingMasterKey,
    #[error("BITOR_API_TOKEN is required")]
    MissingApiToken,
    #[error("invalid listen address {0}")]
    InvalidAddress(String),
    #[error("failed to resolve ansible base path {}: {source}", path.display())]
    BasePath {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "bitor-server")]
#[command(about = "Control plane for ephemeral Nuclei scan infrastructure")]
pub struct Cli {
    #[command(flatten)]
    pub serve: ServeArgs,
}

/// Flags accepted by `bitor-server`; each falls back to its environment
/// variable.
#[derive(ClapArgs, Clone)]
pub struct ServeArgs {
    /// Server host
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value_t = 8090)]
    pub port: u16,

    /// Root of the automation tree (generate.yml, scans/)
    #[arg(long, env = "ANSIBLE_BASE_PATH", default_value = "./ansible")]
    pub ansible_base_path: PathBuf,

    /// Master key for credentials stored at rest
    #[arg(long, env = "API_ENCRYPTION_KEY", hide_env_values = true)]
    pub api_encryption_key: Option<String>,

    /// Mirror automation output to this process's stdout/stderr
    #[arg(long, env = "SHOW_ANSIBLE_LOGS")]
    pub show_ansible_logs: bool,

    /// Bearer token for job-control endpoints
    #[arg(long, env = "BITOR_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    #[arg(long, env = "ANSIBLE_PLAYBOOK_BIN", default_value = "ansible-playbook")]
    pub playbook_bin: PathBuf,

    #[arg(long, env = "ANSIBLE_VAULT_BIN", default_value = "ansible-vault")]
    pub vault_bin: PathBuf,

    /// Deadline for one playbook run, in seconds
    #[arg(long, env = "AUTOMATION_TIMEOUT_SECS", default_value_t = 7200)]
    pub automation_timeout_secs: u64,

    /// Interval of the unpriced-job sweep, in seconds; 0 disables it
    #[arg(long, env = "COST_SWEEP_INTERVAL_SECS", default_value_t = 300)]
    pub cost_sweep_interval_secs: u64,

    /// PostgreSQL connection string (requires the `database` feature)
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// JSON records loaded into the in-memory store
    #[arg(long, env = "BITOR_SEED_FILE")]
    pub seed_file: Option<PathBuf>,

    #[arg(long, env = "DIGITALOCEAN_API_BASE", default_value = DEFAULT_API_BASE)]
    pub digitalocean_api_base: String,
}

impl fmt::Debug for ServeArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServeArgs")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("ansible_base_path", &self.ansible_base_path)
            .field("show_ansible_logs", &self.show_ansible_logs)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Absolute path of the automation tree.
    pub ansible_base_path: PathBuf,
    pub master_key: Zeroizing<String>,
    pub show_ansible_logs: bool,
    pub api_token: Zeroizing<String>,
    pub playbook_bin: PathBuf,
    pub vault_bin: PathBuf,
    pub automation_timeout: Duration,
    pub cost_sweep_interval: Option<Duration>,
    pub database_url: Option<String>,
    pub seed_file: Option<PathBuf>,
    pub digitalocean_api_base: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("ansible_base_path", &self.ansible_base_path)
            .field("show_ansible_logs", &self.show_ansible_logs)
            .field("playbook_bin", &self.playbook_bin)
            .field("vault_bin", &self.vault_bin)
            .field("automation_timeout", &self.automation_timeout)
            .field("cost_sweep_interval", &self.cost_sweep_interval)
            .field("database", &self.database_url.is_some())
            .field("seed_file", &self.seed_file)
            .finish_non_exhaustive()
    }
}

fn required(value: Option<String>, missing: ConfigError) -> Result<Zeroizing<String>, ConfigError> {
    value
        .filter(|value| !value.trim().is_empty())
        .map(Zeroizing::new)
        .ok_or(missing)
}

impl Config {
    pub fn from_args(args: ServeArgs) -> Result<Self, ConfigError> {
        let master_key = required(args.api_encryption_key, ConfigError::MissingMasterKey)?;
        let api_token = required(args.api_token, ConfigError::MissingApiToken)?;
        let ansible_base_path = std::path::absolute(&args.ansible_base_path)
            .map_err(|source| ConfigError::BasePath {
                path: args.ansible_base_path.clone(),
                source,
            })?;

        Ok(Self {
            host: args.host,
            port: args.port,
            ansible_base_path,
            master_key,
            show_ansible_logs: args.show_ansible_logs,
            api_token,
            playbook_bin: args.playbook_bin,
            vault_bin: args.vault_bin,
            automation_timeout: Duration::from_secs(args.automation_timeout_secs),
            cost_sweep_interval: (args.cost_sweep_interval_secs > 0)
                .then(|| Duration::from_secs(args.cost_sweep_interval_secs)),
            database_url: args.database_url.filter(|url| !url.trim().is_empty()),
            seed_file: args.seed_file,
            digitalocean_api_base: args.digitalocean_api_base,
        })
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.parse().map_err(|_| ConfigError::InvalidAddress(raw))
    }

    pub fn automation(&self) -> AutomationConfig {
        AutomationConfig {
            base_path: self.ansible_base_path.clone(),
            playbook_bin: self.playbook_bin.clone(),
            timeout: self.automation_timeout,
            show_output: self.show_ansible_logs,
            ..AutomationConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServeArgs {
        Cli::try_parse_from(std::iter::once("bitor-server").chain(args.iter().copied()))
            .expect("args")
            .serve
    }

    #[test]
    fn flags_build_a_config() {
        let config = Config::from_args(parse(&[
            "--api-encryption-key",
            "master",
            "--api-token",
            "admin-token",
            "--port",
            "9000",
            "--cost-sweep-interval-secs",
            "0",
        ]))
        .expect("config");

        assert_eq!(config.port, 9000);
        assert!(config.ansible_base_path.is_absolute());
        assert!(config.cost_sweep_interval.is_none());
        assert_eq!(config.socket_addr().expect("addr").port(), 9000);
        assert_eq!(config.automation().timeout, Duration::from_secs(7200));
    }

    #[test]
    fn master_key_is_required() {
        let err = Config::from_args(parse(&["--api-token", "admin-token"]))
            .expect_err("missing key");
        assert!(matches!(err, ConfigError::MissingMasterKey));
    }

    #[test]
    fn debug_output_omits_secrets() {
        let config = Config::from_args(parse(&[
            "--api-encryption-key",
            "very-secret-master",
            "--api-token",
            "very-secret-token",
        ]))
        .expect("config");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("very-secret"));
    }
}
