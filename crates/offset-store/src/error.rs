use std::path::PathBuf;
use stream_types::StreamPosition;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OffsetError {
    #[error("offset for stream '{stream}' cannot move backwards from {stored} to {attempted}")]
    Regression {
        stream: String,
        stored: StreamPosition,
        attempted: StreamPosition,
    },

    #[error("I/O error on offset file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt offset record at {location}: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("PostgreSQL offset store error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("offset store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, OffsetError>;
