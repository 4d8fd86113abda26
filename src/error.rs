//! Error types for conditions callers must tell apart

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Persistent store failures
#[derive(Error, Debug)]
pub enum StoreError {
    /// The file exists but does not decode; a backup copy was attempted
    #[error("store file {} is corrupt (backup: {}): {source}", path.display(), backup_label(backup))]
    Corrupt {
        path: PathBuf,
        backup: Option<PathBuf>,
        #[source]
        source: serde_json::Error,
    },

    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode store: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("record name must not be empty")]
    EmptyKey,
}

fn backup_label(backup: &Option<PathBuf>) -> String {
    match backup {
        Some(path) => path.display().to_string(),
        None => "none".into(),
    }
}

/// Registration outcomes that stop the agent
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistrationError {
    /// Another device holds this MAC/secret pair
    #[error("duplicate MAC address {0}: stamp does not match")]
    DuplicateMac(String),

    /// Shutdown was signalled while waiting
    #[error("registration cancelled by shutdown")]
    Cancelled,
}
