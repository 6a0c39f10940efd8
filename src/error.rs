//! Error taxonomy for a backup run
//!
//! Most code propagates `anyhow::Error` with context. The variants here are the
//! failures the binary has to tell apart when choosing an exit code or deciding
//! whether the rest of the run may continue.

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for configuration, git and authentication failures
pub const EXIT_FATAL: u8 = 1;

/// Exit code for a run that finished with at least one failed account
pub const EXIT_PARTIAL: u8 = 2;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Required settings are missing (credentials or account list)
    #[error("configuration is missing or incomplete: {}", missing.join(", "))]
    IncompleteConfig { missing: Vec<&'static str> },

    /// The git executable could not be run
    #[error("git is not installed or not in PATH ({program})")]
    GitUnavailable { program: String },

    /// The token endpoint did not hand out an access token
    #[error("access denied: {reason}")]
    AccessDenied { reason: String },

    /// A listing page could not be fetched or parsed
    #[error("failed to list repositories for {account} (page {page})")]
    Enumeration {
        account: String,
        page: u64,
        #[source]
        source: reqwest::Error,
    },

    /// A directory under the repositories root could not be created or written
    #[error("filesystem error at {}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BackupError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::IncompleteConfig { .. }
            | BackupError::GitUnavailable { .. }
            | BackupError::AccessDenied { .. }
            | BackupError::Filesystem { .. } => EXIT_FATAL,
            BackupError::Enumeration { .. } => EXIT_PARTIAL,
        }
    }
}

/// Pick the exit code for an error that escaped to `main`
pub fn exit_code_for(error: &anyhow::Error) -> u8 {
    error
        .downcast_ref::<BackupError>()
        .map(BackupError::exit_code)
        .unwrap_or(EXIT_FATAL)
}
