use crate::types::{ErrorType, FrameDecodeError, StreamId};
use std::time::Duration;

/// Connection-scoped protocol failure. Any of these takes the whole
/// connection down: the engine sends a GOAWAY carrying [`error_type`] and
/// fails every in-flight request.
///
/// [`error_type`]: ConnectionError::error_type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    #[error("frame size error: {0}")]
    FrameSize(&'static str),
    #[error("flow control error: {0}")]
    FlowControl(&'static str),
    #[error("compression error: {0}")]
    Compression(&'static str),
    #[error("peer is generating excessive load: {0}")]
    EnhanceYourCalm(&'static str),
    #[error("timed out waiting for the peer's SETTINGS")]
    SettingsTimeout,
    #[error("{0}")]
    FrameDecode(#[from] FrameDecodeError),
}

impl ConnectionError {
    /// GOAWAY error code for this failure.
    #[must_use]
    pub fn error_type(&self) -> ErrorType {
        match self {
            ConnectionError::Protocol(_) => ErrorType::ProtocolError,
            ConnectionError::FrameSize(_) => ErrorType::FrameSizeError,
            ConnectionError::FlowControl(_) => ErrorType::FlowControlError,
            ConnectionError::Compression(_) => ErrorType::CompressionError,
            ConnectionError::EnhanceYourCalm(_) => ErrorType::EnhanceYourCalm,
            ConnectionError::SettingsTimeout => ErrorType::SettingsTimeout,
            ConnectionError::FrameDecode(err) => match err {
                FrameDecodeError::FrameTooLarge(..)
                | FrameDecodeError::WrongPayloadLength { .. }
                | FrameDecodeError::NonEmptySettingsAck => ErrorType::FrameSizeError,
                _ => ErrorType::ProtocolError,
            },
        }
    }
}

/// Stream-scoped failure. Terminates a single stream with an RST_STREAM
/// carrying [`error_type`]; the rest of the connection keeps going.
///
/// [`error_type`]: StreamError::error_type
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("frame received on closed stream")]
    Closed,
    #[error("flow control window exceeded")]
    FlowControl,
    #[error("stream depends on itself")]
    SelfDependency,
    #[error("zero window update increment")]
    ZeroWindowIncrement,
    #[error("payload length does not match content-length header")]
    WrongContentLength,
    #[error("invalid header block on stream")]
    InvalidHeaders,
}

impl StreamError {
    /// RST_STREAM error code for this failure.
    #[must_use]
    pub fn error_type(&self) -> ErrorType {
        match self {
            StreamError::Closed => ErrorType::StreamClosed,
            StreamError::FlowControl => ErrorType::FlowControlError,
            StreamError::SelfDependency
            | StreamError::ZeroWindowIncrement
            | StreamError::WrongContentLength
            | StreamError::InvalidHeaders => ErrorType::ProtocolError,
        }
    }
}

/// Remediation category of an [`Error`], as coarse-grained as a caller needs
/// to decide what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// TCP/TLS level failure; retry on a new connection.
    Transport,
    /// HTTP/2 violation by either side; the connection is gone, do not retry.
    Protocol,
    /// Failure scoped to one stream.
    Stream,
    /// Window accounting violation.
    FlowControl,
    /// Request or handshake deadline expired.
    Timeout,
    /// User-initiated cancellation.
    Cancellation,
    /// The peer sent GOAWAY; streams above its last id were refused.
    PeerGoAway,
}

/// Everything a request can fail with. Every variant carries a category and
/// a one-line reason; success is never represented as an `Error`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("stream {id} failed: {error:?}")]
    Stream { id: StreamId, error: ErrorType },
    #[error("flow control violated on stream {0}")]
    FlowControl(StreamId),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("request cancelled")]
    Cancelled,
    #[error("peer is going away (last accepted stream {last_stream})")]
    GoAway { last_stream: StreamId, error: ErrorType },
    #[error("connection closed while the request was in flight")]
    ConnectionClosed,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("circuit breaker is open for this origin")]
    CircuitOpen,
}

impl Error {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Transport(_) | Error::Tls(_) | Error::ConnectionClosed => {
                ErrorCategory::Transport
            }
            Error::Connection(_) | Error::InvalidRequest(_) | Error::InvalidResponse(_) => {
                ErrorCategory::Protocol
            }
            Error::Stream { .. } => ErrorCategory::Stream,
            Error::FlowControl(_) => ErrorCategory::FlowControl,
            Error::Timeout(_) => ErrorCategory::Timeout,
            Error::Cancelled | Error::CircuitOpen => ErrorCategory::Cancellation,
            Error::GoAway { .. } => ErrorCategory::PeerGoAway,
        }
    }

    /// Whether retrying the same request on a fresh connection can succeed.
    /// Stream errors qualify only when the peer refused the stream without
    /// processing it.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Tls(_) | Error::ConnectionClosed => true,
            Error::Stream { error, .. } => *error == ErrorType::RefusedStream,
            Error::GoAway { .. } => true,
            _ => false,
        }
    }

    /// Status code carried by the failure, if the exchange got far enough to
    /// have one. Present for none of the current variants; kept as the seam
    /// for typed HTTP-level failures.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        None
    }
}

pub type Result<T> = std::result::Result<T, Error>;
