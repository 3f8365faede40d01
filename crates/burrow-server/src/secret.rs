use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// Errors that can occur during secret resolution
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Invalid secret URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Failed to read file '{path}': {message}")]
    FileError { path: PathBuf, message: String },

    #[error("Environment variable '{var}' not set")]
    EnvNotSet { var: String },
}

/// Where a secret value comes from.
///
/// Supports the following forms:
/// - `env://VAR_NAME` - Environment variable
/// - `file:///path/to/file` - File content
/// - Plain string - Literal value
#[derive(Debug, Clone, PartialEq)]
pub enum SecretSource {
    Plain(String),
    Env { var_name: String },
    File { path: PathBuf },
}

impl SecretSource {
    pub fn backend_name(&self) -> &'static str {
        match self {
            SecretSource::Plain(_) => "plain",
            SecretSource::Env { .. } => "env",
            SecretSource::File { .. } => "file",
        }
    }

    /// Fetch the value, trimming surrounding whitespace
    pub fn resolve(&self) -> Result<String, SecretError> {
        let value = match self {
            SecretSource::Plain(value) => value.clone(),
            SecretSource::Env { var_name } => {
                env::var(var_name).map_err(|_| SecretError::EnvNotSet {
                    var: var_name.clone(),
                })?
            }
            SecretSource::File { path } => {
                std::fs::read_to_string(path).map_err(|e| SecretError::FileError {
                    path: path.clone(),
                    message: e.to_string(),
                })?
            }
        };
        Ok(value.trim().to_string())
    }
}

impl FromStr for SecretSource {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(var_name) = s.strip_prefix("env://") {
            if var_name.is_empty() {
                return Err(SecretError::InvalidUri {
                    uri: s.to_string(),
                    reason: "env URI must be env://VAR_NAME".to_string(),
                });
            }
            Ok(SecretSource::Env {
                var_name: var_name.to_string(),
            })
        } else if let Some(path) = s.strip_prefix("file://") {
            if path.is_empty() {
                return Err(SecretError::InvalidUri {
                    uri: s.to_string(),
                    reason: "file URI must be file:///path/to/file".to_string(),
                });
            }
            Ok(SecretSource::File {
                path: PathBuf::from(path),
            })
        } else {
            Ok(SecretSource::Plain(s.to_string()))
        }
    }
}
