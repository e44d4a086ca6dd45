//! Password policy enforced on registration and reset.

use std::collections::HashSet;
use std::path::Path;

use crate::config::PasswordPolicyConfig;
use crate::utils::HashParams;

/// First policy violation found in a candidate password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    TooShort { min_length: usize, actual_length: usize },
    MissingUppercase,
    MissingLowercase,
    MissingDigit,
    MissingSymbol,
    Blacklisted,
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyError::TooShort {
                min_length,
                actual_length,
            } => write!(
                f,
                "Password must be at least {} characters (got {})",
                min_length, actual_length
            ),
            PolicyError::MissingUppercase => {
                write!(f, "Password must contain at least one uppercase letter")
            }
            PolicyError::MissingLowercase => {
                write!(f, "Password must contain at least one lowercase letter")
            }
            PolicyError::MissingDigit => write!(f, "Password must contain at least one number"),
            PolicyError::MissingSymbol => {
                write!(f, "Password must contain at least one special character")
            }
            PolicyError::Blacklisted => write!(f, "Password is too common"),
        }
    }
}

impl std::error::Error for PolicyError {}

#[derive(Debug, Clone)]
pub struct PasswordPolicy {
    min_length: usize,
    require_upper: bool,
    require_lower: bool,
    require_digit: bool,
    require_symbol: bool,
    blacklist: HashSet<String>,
    hash_params: HashParams,
}

impl PasswordPolicy {
    /// Loads the blacklist file when one is configured. One password per line,
    /// compared case-insensitively; blank lines and `#` comments are skipped.
    pub fn from_config(config: &PasswordPolicyConfig) -> Result<Self, std::io::Error> {
        let blacklist = match &config.blacklist_path {
            Some(path) => load_blacklist(path)?,
            None => HashSet::new(),
        };
        if !blacklist.is_empty() {
            tracing::info!(entries = blacklist.len(), "password blacklist loaded");
        }
        Ok(Self {
            min_length: config.min_length,
            require_upper: config.require_upper,
            require_lower: config.require_lower,
            require_digit: config.require_digit,
            require_symbol: config.require_symbol,
            blacklist,
            hash_params: HashParams {
                memory_kib: config.argon2_memory_kib,
                iterations: config.argon2_iterations,
                parallelism: config.argon2_parallelism,
            },
        })
    }

    pub fn with_hash_params(mut self, params: HashParams) -> Self {
        self.hash_params = params;
        self
    }

    pub fn hash_params(&self) -> &HashParams {
        &self.hash_params
    }

    /// Length is counted in characters, not bytes.
    pub fn validate(&self, password: &str) -> Result<(), PolicyError> {
        let length = password.chars().count();
        if length < self.min_length {
            return Err(PolicyError::TooShort {
                min_length: self.min_length,
                actual_length: length,
            });
        }

        if self.require_upper && !password.chars().any(char::is_uppercase) {
            return Err(PolicyError::MissingUppercase);
        }

        if self.require_lower && !password.chars().any(char::is_lowercase) {
            return Err(PolicyError::MissingLowercase);
        }

        if self.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            return Err(PolicyError::MissingDigit);
        }

        if self.require_symbol && !password.chars().any(is_symbol) {
            return Err(PolicyError::MissingSymbol);
        }

        if self.blacklist.contains(&password.to_lowercase()) {
            return Err(PolicyError::Blacklisted);
        }

        Ok(())
    }
}

fn is_symbol(c: char) -> bool {
    !c.is_alphanumeric() && !c.is_whitespace()
}

fn load_blacklist(path: &Path) -> Result<HashSet<String>, std::io::Error> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_lowercase)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config() -> PasswordPolicyConfig {
        PasswordPolicyConfig {
            min_length: 8,
            require_upper: true,
            require_lower: true,
            require_digit: true,
            require_symbol: true,
            blacklist_path: None,
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
        }
    }

    #[test]
    fn test_password_too_short() {
        let policy = PasswordPolicy::from_config(&config()).unwrap();
        assert!(matches!(
            policy.validate("P@s1"),
            Err(PolicyError::TooShort { actual_length: 4, .. })
        ));
    }

    #[test]
    fn test_each_class_is_required() {
        let policy = PasswordPolicy::from_config(&config()).unwrap();
        assert_eq!(policy.validate("p@ssw0rd!"), Err(PolicyError::MissingUppercase));
        assert_eq!(policy.validate("P@SSW0RD!"), Err(PolicyError::MissingLowercase));
        assert_eq!(policy.validate("P@ssword!"), Err(PolicyError::MissingDigit));
        assert_eq!(policy.validate("Passw0rdX"), Err(PolicyError::MissingSymbol));
        assert!(policy.validate("P@ssw0rd!").is_ok());
    }

    #[test]
    fn test_length_counts_characters() {
        let mut cfg = config();
        cfg.require_symbol = false;
        cfg.min_length = 6;
        let policy = PasswordPolicy::from_config(&cfg).unwrap();
        // Six characters, twelve bytes.
        assert!(policy.validate("Ääää1a").is_ok());
    }

    #[test]
    fn test_blacklist_is_case_insensitive() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# common passwords").unwrap();
        writeln!(file, "P@ssw0rd!").unwrap();
        let mut cfg = config();
        cfg.blacklist_path = Some(file.path().to_path_buf());

        let policy = PasswordPolicy::from_config(&cfg).unwrap();
        assert_eq!(policy.validate("p@SSW0RD!"), Err(PolicyError::Blacklisted));
        assert_eq!(policy.validate("P@SSw0rd!"), Err(PolicyError::Blacklisted));
        assert!(policy.validate("Tr0ub4dor&3").is_ok());
    }
}
