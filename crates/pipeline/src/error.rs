use offset_store::OffsetError;
use pgoutput::DecodeError;
use std::fmt;
use stream_types::{StreamPosition, ValueError};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to decode replication message at {position}: {source}")]
    Decode {
        position: StreamPosition,
        #[source]
        source: DecodeError,
    },

    #[error("protocol violation at {position}: {reason}")]
    Protocol {
        position: StreamPosition,
        reason: String,
    },

    #[error("invalid value for column '{column}' of {relation}: {source}")]
    InvalidValue {
        relation: String,
        column: String,
        #[source]
        source: ValueError,
    },

    #[error(
        "tuple for {relation} (schema version {version}) has {actual} columns, schema has {expected}"
    )]
    SchemaMismatch {
        relation: String,
        version: u32,
        expected: usize,
        actual: usize,
    },

    #[error("change references unknown relation id {0}")]
    UnknownRelation(u32),

    #[error("delivery to topic '{topic}' failed after {attempts} attempts: {source}")]
    Delivery {
        topic: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },

    #[error("offset for stream '{stream}' would move backwards from {confirmed} to {attempted}")]
    OffsetRegression {
        stream: String,
        confirmed: StreamPosition,
        attempted: StreamPosition,
    },

    #[error("offset store failed: {0}")]
    OffsetStore(#[source] OffsetError),

    #[error("replication transport failed: {0}")]
    Transport(#[source] BoxError),

    #[error("dispatcher stopped before the consumer finished")]
    DispatcherStopped,
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Stable names for reporting fatal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ProtocolError,
    SchemaMismatchError,
    UnknownRelationError,
    DeliveryError,
    OffsetRegressionError,
    OffsetStoreError,
    TransportError,
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl PipelineError {
    pub fn transport(error: impl Into<BoxError>) -> Self {
        PipelineError::Transport(error.into())
    }

    pub fn protocol(position: StreamPosition, reason: impl Into<String>) -> Self {
        PipelineError::Protocol {
            position,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Decode { .. }
            | PipelineError::Protocol { .. }
            | PipelineError::InvalidValue { .. } => ErrorKind::ProtocolError,
            PipelineError::SchemaMismatch { .. } => ErrorKind::SchemaMismatchError,
            PipelineError::UnknownRelation(_) => ErrorKind::UnknownRelationError,
            PipelineError::Delivery { .. } => ErrorKind::DeliveryError,
            PipelineError::OffsetRegression { .. } => ErrorKind::OffsetRegressionError,
            PipelineError::OffsetStore(_) => ErrorKind::OffsetStoreError,
            PipelineError::Transport(_) => ErrorKind::TransportError,
            PipelineError::DispatcherStopped => ErrorKind::InternalError,
        }
    }

    /// Only a lost connection to the source is worth reconnecting for;
    /// everything else would fail the same way again.
    pub fn is_reconnectable(&self) -> bool {
        matches!(self, PipelineError::Transport(_))
    }
}

impl From<OffsetError> for PipelineError {
    fn from(error: OffsetError) -> Self {
        match error {
            OffsetError::Regression {
                stream,
                stored,
                attempted,
            } => PipelineError::OffsetRegression {
                stream,
                confirmed: stored,
                attempted,
            },
            other => PipelineError::OffsetStore(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_and_reconnectability() {
        let transport = PipelineError::transport(anyhow::anyhow!("connection reset"));
        assert_eq!(transport.kind(), ErrorKind::TransportError);
        assert!(transport.is_reconnectable());
        assert_eq!(
            transport.to_string(),
            "replication transport failed: connection reset"
        );

        let protocol = PipelineError::protocol(StreamPosition::new(5), "BEGIN inside transaction");
        assert_eq!(protocol.kind().to_string(), "ProtocolError");
        assert!(!protocol.is_reconnectable());

        assert_eq!(
            PipelineError::UnknownRelation(7).kind(),
            ErrorKind::UnknownRelationError
        );
    }

    #[test]
    fn test_offset_regression_is_mapped() {
        let err: PipelineError = OffsetError::Regression {
            stream: "s".to_string(),
            stored: StreamPosition::new(10),
            attempted: StreamPosition::new(5),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::OffsetRegressionError);

        let err: PipelineError = OffsetError::Unavailable("down".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::OffsetStoreError);
    }
}
