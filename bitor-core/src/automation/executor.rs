//! Runs playbooks with an explicit working directory and environment, and
//! tees their output to disk, the job log and optionally our own console.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::domain::{EphemeralSecret, JobId, LogStream};
use crate::error::{BitorError, Result};

use super::checkpointer::LogCheckpointer;

/// Name prefix of the per-run vault password files in a job's log directory.
pub const VAULT_PASSWORD_FILE: &str = ".vault_pass";
pub const AUTOMATION_LOG_FILE: &str = "ansible.log";

#[derive(Clone, Debug)]
pub struct AutomationConfig {
    /// Root of the automation tree; every run executes from here.
    pub base_path: PathBuf,
    pub playbook_bin: PathBuf,
    pub forks: u32,
    pub timeout: Duration,
    /// Mirror automation output to this process's stdout/stderr.
    pub show_output: bool,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./ansible"),
            playbook_bin: PathBuf::from("ansible-playbook"),
            forks: 10,
            timeout: Duration::from_secs(2 * 60 * 60),
            show_output: false,
        }
    }
}

/// One playbook invocation for a job.
#[derive(Debug)]
pub struct PlaybookRun<'a> {
    pub job_id: JobId,
    pub playbook: PathBuf,
    pub inventory: PathBuf,
    pub extra_vars: PathBuf,
    pub log_dir: PathBuf,
    pub secret: &'a EphemeralSecret,
}

/// Owner-only vault password file, unique per run and removed when dropped.
#[derive(Debug)]
struct VaultPasswordFile {
    file: NamedTempFile,
}

impl VaultPasswordFile {
    async fn create(dir: &Path, secret: &EphemeralSecret) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let mut file = tempfile::Builder::new()
            .prefix(VAULT_PASSWORD_FILE)
            .tempfile_in(dir)?;
        file.write_all(secret.expose().as_bytes())?;
        file.flush()?;
        Ok(Self { file })
    }

    fn path(&self) -> &Path {
        self.file.path()
    }
}

#[derive(Clone, Debug)]
pub struct AutomationExecutor {
    config: AutomationConfig,
}

impl AutomationExecutor {
    pub fn new(config: AutomationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AutomationConfig {
        &self.config
    }

    fn command(&self, inventory: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.config.playbook_bin);
        cmd.current_dir(&self.config.base_path)
            .env("ANSIBLE_HOST_KEY_CHECKING", "false")
            .env("ANSIBLE_FORCE_COLOR", "true")
            .env("ANSIBLE_ACTION_WARNINGS", "false")
            .env("ANSIBLE_STDOUT_CALLBACK", "default")
            .env("ANSIBLE_RETRY_FILES_ENABLED", "false")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(inventory) = inventory {
            cmd.env("ANSIBLE_INVENTORY", inventory);
        }
        cmd
    }

    /// Parses `playbook` without executing it. The tool's error output is
    /// returned inside [`BitorError::ArtifactValidation`].
    pub async fn syntax_check(&self, playbook: &Path) -> Result<()> {
        let playbook = std::path::absolute(playbook)?;
        let output = self
            .command(None)
            .arg("--syntax-check")
            .arg(&playbook)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| {
                BitorError::ArtifactValidation(format!(
                    "failed to launch syntax check for {}: {err}",
                    playbook.display()
                ))
            })?;

        if output.status.success() {
            return Ok(());
        }

        let mut detail = String::from_utf8_lossy(&output.stderr).into_owned();
        if detail.trim().is_empty() {
            detail = String::from_utf8_lossy(&output.stdout).into_owned();
        }
        Err(BitorError::ArtifactValidation(format!(
            "{}: {}",
            playbook.display(),
            detail.trim()
        )))
    }

    /// Runs one playbook to completion, bounded by the configured deadline.
    pub async fn run(
        &self,
        run: PlaybookRun<'_>,
        checkpointer: Arc<LogCheckpointer>,
    ) -> Result<()> {
        let playbook = std::path::absolute(&run.playbook)?;
        let inventory = std::path::absolute(&run.inventory)?;
        let extra_vars = std::path::absolute(&run.extra_vars)?;
        let log_dir = std::path::absolute(&run.log_dir)?;

        let password = VaultPasswordFile::create(&log_dir, run.secret).await?;
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(AUTOMATION_LOG_FILE))
            .await?;
        let log_file = Arc::new(Mutex::new(log_file));

        info!(
            job_id = %run.job_id,
            playbook = %playbook.display(),
            "starting automation run"
        );

        let mut child = self
            .command(Some(&inventory))
            .arg(&playbook)
            .arg("-i")
            .arg(&inventory)
            .arg("--forks")
            .arg(self.config.forks.to_string())
            .arg("--vault-password-file")
            .arg(password.path())
            .arg("--extra-vars")
            .arg(format!("@{}", extra_vars.display()))
            .arg("-e")
            .arg(format!("scan_id={}", run.job_id))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| BitorError::Execution {
                message: format!(
                    "failed to spawn {}: {err}",
                    self.config.playbook_bin.display()
                ),
                stderr: String::new(),
            })?;

        let error_output = Arc::new(RwLock::new(String::new()));
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(self.spawn_pump(
                stdout,
                LogStream::Stdout,
                Arc::clone(&checkpointer),
                Arc::clone(&log_file),
                None,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(self.spawn_pump(
                stderr,
                LogStream::Stderr,
                Arc::clone(&checkpointer),
                Arc::clone(&log_file),
                Some(Arc::clone(&error_output)),
            ));
        }
        let ticker = checkpointer.spawn_ticker();

        let waited = tokio::time::timeout(self.config.timeout, child.wait()).await;
        if waited.is_err() {
            if let Err(err) = child.kill().await {
                warn!(job_id = %run.job_id, "failed to kill timed out run: {err}");
            }
            // Grandchildren may still hold the pipes open.
            pumps.iter().for_each(JoinHandle::abort);
        }

        for pump in pumps {
            if let Err(err) = pump.await
                && !err.is_cancelled()
            {
                warn!(job_id = %run.job_id, "output pump ended abnormally: {err}");
            }
        }
        ticker.abort();
        if let Err(err) = checkpointer.finish().await {
            error!(job_id = %run.job_id, "final log checkpoint failed: {err}");
        }
        drop(password);

        let status = match waited {
            Ok(status) => status?,
            Err(_) => {
                error!(
                    job_id = %run.job_id,
                    timeout = ?self.config.timeout,
                    "automation run exceeded its deadline"
                );
                return Err(BitorError::Timeout(self.config.timeout));
            }
        };

        if !status.success() {
            let stderr = error_output.read().await.clone();
            let code = status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string());
            error!(job_id = %run.job_id, %code, "automation run failed");
            return Err(BitorError::Execution {
                message: format!(
                    "{} exited with status {code}",
                    playbook.display()
                ),
                stderr,
            });
        }

        info!(job_id = %run.job_id, playbook = %playbook.display(), "automation run finished");
        Ok(())
    }

    fn spawn_pump<R>(
        &self,
        mut reader: R,
        stream: LogStream,
        checkpointer: Arc<LogCheckpointer>,
        log_file: Arc<Mutex<tokio::fs::File>>,
        capture: Option<Arc<RwLock<String>>>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mirror = self.config.show_output;
        tokio::spawn(async move {
            let mut chunk = vec![0u8; 8 * 1024];
            loop {
                let read = match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(read) => read,
                    Err(err) => {
                        warn!(?stream, "failed to read automation output: {err}");
                        break;
                    }
                };
                let bytes = &chunk[..read];

                if let Err(err) = log_file.lock().await.write_all(bytes).await {
                    warn!(?stream, "failed to write automation log file: {err}");
                }
                if mirror {
                    let written = match stream {
                        LogStream::Stdout => {
                            tokio::io::stdout().write_all(bytes).await
                        }
                        LogStream::Stderr => {
                            tokio::io::stderr().write_all(bytes).await
                        }
                    };
                    if let Err(err) = written {
                        tracing::debug!("failed to mirror automation output: {err}");
                    }
                }
                if let Some(capture) = &capture {
                    capture
                        .write()
                        .await
                        .push_str(&String::from_utf8_lossy(bytes));
                }
                checkpointer.ingest(stream, bytes).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_runs_get_their_own_password_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_dir = dir.path().join("logs");
        let deploy_secret = EphemeralSecret::from_string("deploy-secret");
        let teardown_secret = EphemeralSecret::from_string("teardown-secret");

        let deploy = VaultPasswordFile::create(&log_dir, &deploy_secret)
            .await
            .expect("deploy password");
        let teardown = VaultPasswordFile::create(&log_dir, &teardown_secret)
            .await
            .expect("teardown password");
        assert_ne!(deploy.path(), teardown.path());
        assert!(
            deploy
                .path()
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(VAULT_PASSWORD_FILE))
        );

        let teardown_path = teardown.path().to_path_buf();
        drop(teardown);
        assert!(!teardown_path.exists());
        assert_eq!(
            std::fs::read_to_string(deploy.path()).expect("deploy file"),
            "deploy-secret"
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(deploy.path())
                .expect("metadata")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
