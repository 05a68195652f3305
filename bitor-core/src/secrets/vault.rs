//! Re-encryption of credentials with the automation tool's vault.

use async_trait::async_trait;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{BitorError, Result};
use crate::ports::VaultEncryptor;

const DEBUG_MARKERS: [&str; 7] = [
    "ansible-vault",
    "config file",
    "python version",
    "jinja version",
    "libyaml",
    "No config file found",
    "encrypt_vault_id",
];

/// `ansible-vault encrypt_string` driven through a short-lived password file.
#[derive(Clone, Debug)]
pub struct AnsibleVault {
    binary: PathBuf,
}

impl Default for AnsibleVault {
    fn default() -> Self {
        Self::new("ansible-vault")
    }
}

impl AnsibleVault {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl VaultEncryptor for AnsibleVault {
    async fn encrypt_string(
        &self,
        name: &str,
        plaintext: &str,
        vault_password: &str,
    ) -> Result<String> {
        // Removed when dropped, on every return path.
        let mut password_file = tempfile::Builder::new()
            .prefix("vault-pass-")
            .tempfile()?;
        password_file.write_all(vault_password.as_bytes())?;
        password_file.flush()?;

        let mut child = Command::new(&self.binary)
            .arg("encrypt_string")
            .arg("--vault-password-file")
            .arg(password_file.path())
            .arg("--stdin-name")
            .arg(name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| BitorError::Execution {
                message: format!("failed to spawn ansible-vault: {err}"),
                stderr: String::new(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(plaintext.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(BitorError::Execution {
                message: format!("failed to encrypt {name}"),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let cleaned = clean_vault_output(&String::from_utf8_lossy(&output.stdout));
        if cleaned.is_empty() {
            return Err(BitorError::Crypto(format!(
                "ansible-vault produced no payload for {name}"
            )));
        }
        Ok(cleaned)
    }
}

/// Keeps only the `$ANSIBLE_VAULT` payload of the tool's output, dropping
/// debug chatter and blank lines.
pub fn clean_vault_output(output: &str) -> String {
    let mut in_vault = false;
    let mut kept = Vec::new();

    for line in output.lines() {
        if line.trim().is_empty()
            || DEBUG_MARKERS.iter().any(|marker| line.contains(marker))
        {
            continue;
        }
        if line.contains("$ANSIBLE_VAULT") {
            in_vault = true;
        }
        if in_vault {
            kept.push(line);
        }
    }

    kept.join("\n")
}

/// Re-indents a vault payload so it nests under a `key: !vault |` line.
pub fn indent_vault_block(payload: &str) -> String {
    payload
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains("!vault |"))
        .map(|line| format!("      {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "Using /etc/ansible/ansible.cfg as config file\n\
        access_key: !vault |\n          $ANSIBLE_VAULT;1.1;AES256\n          \
        3961646233\n\n          6238316562\n";

    #[test]
    fn cleaning_keeps_only_the_vault_payload() {
        let cleaned = clean_vault_output(RAW);
        let lines: Vec<&str> = cleaned.lines().collect();
        assert_eq!(lines[0].trim(), "$ANSIBLE_VAULT;1.1;AES256");
        assert_eq!(lines[1].trim(), "3961646233");
        assert_eq!(lines[2].trim(), "6238316562");
        assert!(!cleaned.contains("config file"));
    }

    #[test]
    fn output_without_a_header_is_empty() {
        assert!(clean_vault_output("No config file found\n\n").is_empty());
    }

    #[test]
    fn indentation_uses_six_spaces_and_drops_the_tag_line() {
        let indented =
            indent_vault_block("key: !vault |\n  $ANSIBLE_VAULT;1.1;AES256\n  abcd");
        assert_eq!(indented, "      $ANSIBLE_VAULT;1.1;AES256\n      abcd");
    }
}
