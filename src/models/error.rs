//! Error types for poisonset.
//!
//! Taxonomy:
//! - Configuration: the requested run can never succeed as configured
//! - Data: the input dataset is unusable
//! - Precondition: the output already exists, nothing was written
//! - External phase: a subprocess failed or hung
//! - Internal: an invariant was broken (bug)

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for poisonset.
#[derive(Debug, Error)]
pub enum PoisonsetError {
    // ═══════════════════════════════════════════════════════════════════
    // CONFIGURATION: fatal, retrying cannot help
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Attack '{variant}' is not supported for dataset '{dataset}'")]
    UnsupportedCombination { dataset: String, variant: String },

    #[error("Missing {what} at {}: {remedy}", .path.display())]
    MissingPrerequisite {
        what: String,
        path: PathBuf,
        remedy: String,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // ═══════════════════════════════════════════════════════════════════
    // DATA: the dataset cannot be processed
    // ═══════════════════════════════════════════════════════════════════

    #[error("Data error: {0}")]
    Data(String),

    #[error("Artifact decode error: {0}")]
    Codec(String),

    #[error("Poisoned set directory {} is incomplete; remove it and rerun", .0.display())]
    IncompleteArtifact(PathBuf),

    // ═══════════════════════════════════════════════════════════════════
    // PRECONDITION: graceful abort, nothing written
    // ═══════════════════════════════════════════════════════════════════

    #[error("Poisoned set directory already exists: {}", .0.display())]
    ArtifactExists(PathBuf),

    // ═══════════════════════════════════════════════════════════════════
    // EXTERNAL PHASE: subprocess failures, propagated without retry
    // ═══════════════════════════════════════════════════════════════════

    #[error("Phase '{phase}' exited with status {}", exit_status(.code))]
    ExternalPhase { phase: String, code: Option<i32> },

    #[error("Phase '{phase}' timed out after {after:?}")]
    PhaseTimeout { phase: String, after: Duration },

    #[error("Failed to launch phase '{phase}': {source}")]
    PhaseSpawn {
        phase: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE / INTERNAL
    // ═══════════════════════════════════════════════════════════════════

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

fn exit_status(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

/// Coarse classification of a [`PoisonsetError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Data,
    Precondition,
    ExternalPhase,
    Io,
    Internal,
}

impl PoisonsetError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a missing-prerequisite error.
    pub fn missing(
        what: impl Into<String>,
        path: impl Into<PathBuf>,
        remedy: impl Into<String>,
    ) -> Self {
        Self::MissingPrerequisite {
            what: what.into(),
            path: path.into(),
            remedy: remedy.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_)
            | Self::UnsupportedCombination { .. }
            | Self::MissingPrerequisite { .. }
            | Self::InvalidParameter(_) => ErrorKind::Configuration,
            Self::Data(_) | Self::Codec(_) | Self::IncompleteArtifact(_) => ErrorKind::Data,
            Self::ArtifactExists(_) => ErrorKind::Precondition,
            Self::ExternalPhase { .. } | Self::PhaseTimeout { .. } | Self::PhaseSpawn { .. } => {
                ErrorKind::ExternalPhase
            }
            Self::Io { .. } => ErrorKind::Io,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when the failure left the filesystem untouched because the
    /// output already existed.
    pub fn is_precondition(&self) -> bool {
        self.kind() == ErrorKind::Precondition
    }
}

/// Result type alias for poisonset.
pub type Result<T> = std::result::Result<T, PoisonsetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err = PoisonsetError::ArtifactExists(PathBuf::from("/tmp/x"));
        assert!(err.is_precondition());

        let err = PoisonsetError::IncompleteArtifact(PathBuf::from("/tmp/x"));
        assert_eq!(err.kind(), ErrorKind::Data);
        assert!(!err.is_precondition());

        let err = PoisonsetError::missing(
            "pretrained generator",
            "models/all2one_cifar10_ckpt.pth.tar",
            "download it first",
        );
        assert_eq!(err.kind(), ErrorKind::Configuration);
        let msg = err.to_string();
        assert!(msg.contains("pretrained generator"));
        assert!(msg.contains("all2one_cifar10_ckpt.pth.tar"));
        assert!(msg.contains("download it first"));

        let err = PoisonsetError::ExternalPhase {
            phase: "train".to_string(),
            code: Some(2),
        };
        assert_eq!(err.kind(), ErrorKind::ExternalPhase);
        assert!(err.to_string().contains("status 2"));
    }
}
