//! Error types for E2E verification

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Build step `{command}` failed with {status}")]
    BuildFailure {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("Server exited before becoming ready ({status})")]
    ServerExited { status: String, output: String },

    #[error("Server readiness check failed after {attempts} attempts")]
    ReadinessTimeout { attempts: u32, output: String },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Scenario '{scenario}' expected {expected}, observed {observed}: {text:?}")]
    VerdictMismatch {
        scenario: String,
        expected: String,
        observed: String,
        text: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type E2eResult<T> = Result<T, E2eError>;

/// Failure of a single browser operation
#[derive(Error, Debug, Clone)]
#[error("{op} on '{target}' failed ({kind}): {cause}")]
pub struct DriverError {
    pub op: &'static str,
    pub target: String,
    pub kind: DriverErrorKind,
    pub cause: String,
}

impl DriverError {
    pub fn new(
        op: &'static str,
        target: impl Into<String>,
        kind: DriverErrorKind,
        cause: impl Into<String>,
    ) -> Self {
        Self {
            op,
            target: target.into(),
            kind,
            cause: cause.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == DriverErrorKind::Timeout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The page did not respond within the operation timeout
    Timeout,
    /// The browser reported an error for the operation
    Browser,
    /// The automation bridge sent something unexpected
    Protocol,
    /// The session is gone
    Closed,
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Browser => "browser",
            DriverErrorKind::Protocol => "protocol",
            DriverErrorKind::Closed => "closed",
        };
        f.write_str(s)
    }
}
