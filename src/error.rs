//! Crate error type.
//!
//! Gate violations and "not enough data" are *not* errors: they are ordinary
//! decision values ([`crate::GateOutcome`], `Option<f64>` statistics). Errors are
//! reserved for inputs we refuse to guess about.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can make an engine step fail.
#[derive(Debug, Error)]
pub enum Error {
    /// A router was asked to allocate over zero arms.
    #[error("no arms configured")]
    EmptyArms,

    /// A configuration value is out of range or unparseable.
    #[error("invalid config `{field}`: {reason}")]
    InvalidConfig { field: String, reason: String },

    /// A persisted state file exists but cannot be decoded.
    #[error("malformed state file {}: {reason}", path.display())]
    MalformedState { path: PathBuf, reason: String },

    /// Filesystem failure, tagged with the step and path that failed.
    #[error("io error during {step} on {}: {source}", path.display())]
    Io {
        step: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization of an outgoing record failed.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// An external command could not be started at all.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An external command ran but its output could not be interpreted.
    #[error("unexpected output from `{program}`: {reason}")]
    CommandOutput { program: String, reason: String },

    /// A promotion bundle failed verification.
    #[error("bundle {tag} failed verification: {reason}")]
    BundleIntegrity { tag: String, reason: String },
}

impl Error {
    pub fn io(step: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            step,
            path: path.into(),
            source,
        }
    }

    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Process exit code under the CLI convention.
    ///
    /// `1` is generic failure; `3` is a hard failure (I/O, malformed state,
    /// integrity). `0` and `2` are never produced by errors.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Io { .. } | Self::MalformedState { .. } | Self::BundleIntegrity { .. } => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_failures_map_to_exit_three() {
        let e = Error::MalformedState {
            path: PathBuf::from("/tmp/x.json"),
            reason: "eof".into(),
        };
        assert_eq!(e.exit_code(), 3);
        assert!(e.to_string().contains("/tmp/x.json"));
        assert_eq!(Error::EmptyArms.exit_code(), 1);
    }
}
