use std::fmt;

use hearth::HearthError;

/// Error shown to the operator, optionally followed by what to try next
#[derive(Debug)]
pub struct CliError {
    pub message: String,
    pub hint: Option<&'static str>,
}

impl CliError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(hint) = self.hint {
            write!(f, "\n  hint: {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CliError {}

impl From<String> for CliError {
    fn from(message: String) -> Self {
        CliError::new(message)
    }
}

impl From<HearthError> for CliError {
    fn from(e: HearthError) -> Self {
        let hint = match &e {
            HearthError::Timeout { .. } => {
                Some("raise backend.timeout_ms / backend.long_timeout_ms or HEARTH_LONG_TIMEOUT_MS")
            }
            HearthError::InvalidKeyFormat(_) => {
                Some("the key must be 64 hex characters (32 bytes)")
            }
            HearthError::TamperedOrWrongKey => {
                Some("the record was written under a different key; `hearth-cli vault check` lists them")
            }
            _ => None,
        };
        Self {
            message: e.to_string(),
            hint,
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::new(format!("JSON error: {e}"))
    }
}

impl From<toml::ser::Error> for CliError {
    fn from(e: toml::ser::Error) -> Self {
        CliError::new(format!("TOML error: {e}"))
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::new(format!("IO error: {e}"))
    }
}

pub type CliResult<T> = Result<T, CliError>;
