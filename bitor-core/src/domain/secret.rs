use constant_time_eq::constant_time_eq;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

const SECRET_BYTES: usize = 32;

/// Per-job symmetric secret.
///
/// It is the vault password for the job's generated artifacts and the bearer
/// token the running workload presents on callbacks.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct EphemeralSecret(String);

impl EphemeralSecret {
    /// Mints 32 random bytes, hex encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        let secret = Self(hex::encode(bytes));
        bytes.zeroize();
        secret
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a presented token.
    pub fn matches(&self, presented: &str) -> bool {
        !self.0.is_empty()
            && constant_time_eq(self.0.as_bytes(), presented.as_bytes())
    }
}

impl fmt::Debug for EphemeralSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EphemeralSecret(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secret_is_64_hex_chars() {
        let secret = EphemeralSecret::generate();
        assert_eq!(secret.expose().len(), 64);
        assert!(secret.expose().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(secret, EphemeralSecret::generate());
    }

    #[test]
    fn matches_only_the_exact_token() {
        let secret = EphemeralSecret::from_string("abc123");
        assert!(secret.matches("abc123"));
        assert!(!secret.matches("abc12"));
        assert!(!EphemeralSecret::from_string("").matches(""));
    }

    #[test]
    fn debug_output_is_redacted() {
        let secret = EphemeralSecret::from_string("super-secret");
        assert!(!format!("{secret:?}").contains("super-secret"));
    }
}
