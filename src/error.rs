//! Error types for linearcast

use std::path::{Path, PathBuf};

/// Everything that can go wrong while building or persisting channels
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("Source produced no usable items: {0}")]
    EmptySource(String),

    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error("Invalid channel state: {0}")]
    InvalidChannelState(String),

    #[error("Lock held by another writer: {0}")]
    LockContention(String),

    #[error("I/O failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Channel {channel} has no schedulable items")]
    ScheduleExhausted { channel: u32 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Errors that only disqualify one source, never the whole channel
    pub fn is_source_level(&self) -> bool {
        matches!(
            self,
            Error::CatalogUnavailable(_) | Error::EmptySource(_) | Error::InvalidSource(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
