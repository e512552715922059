use num_derive::{FromPrimitive, ToPrimitive};
use std::num::NonZeroU32;

/// Highest value that fits in 31 bits: the ceiling for stream ids, window
/// sizes and SETTINGS_INITIAL_WINDOW_SIZE.
pub const U31_MAX: u32 = u32::MAX >> 1;

pub type StreamId = u32;
pub type NonZeroStreamId = NonZeroU32;

/// Ordered request header list. Order matters to HPACK (pseudo-headers first)
/// so this is not a map.
pub type Headers = Vec<(String, String)>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("payload is shorter than expected")]
    PayloadTooShort,
    #[error("frame of {0} bytes exceeds maximum frame size {1}")]
    FrameTooLarge(u32, u32),
    #[error("wrong payload length {got} for {ty:?} (expected {expected})")]
    WrongPayloadLength {
        ty: FrameType,
        got: u32,
        expected: &'static str,
    },
    #[error("unexpected 0 stream ID")]
    ZeroStreamId,
    #[error("unexpected non-0 stream ID for {0:?}")]
    NonZeroStreamId(FrameType),
    #[error("unexpected 0 window increment")]
    ZeroWindowIncrement,
    #[error("padding length exceeds payload")]
    PaddingTooLong,
    #[error("unknown error type: {0}")]
    UnknownErrorType(u32),
    #[error("settings frame with ACK flag must be empty")]
    NonEmptySettingsAck,
}

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorType {
    /// The associated condition is not a result of an error. For example, a GOAWAY might include this code to indicate graceful shutdown of a connection.
    NoError = 0x0,
    /// The endpoint detected an unspecific protocol error. This error is for use when a more specific error code is not available.
    ProtocolError = 0x1,
    /// The endpoint encountered an unexpected internal error.
    InternalError = 0x2,
    /// The endpoint detected that its peer violated the flow-control protocol.
    FlowControlError = 0x3,
    /// The endpoint sent a SETTINGS frame but did not receive a response in a timely manner. See Section 6.5.3 ("Settings Synchronization").
    SettingsTimeout = 0x4,
    /// The endpoint received a frame after a stream was half-closed.
    StreamClosed = 0x5,
    /// The endpoint received a frame with an invalid size.
    FrameSizeError = 0x6,
    /// The endpoint refused the stream prior to performing any application processing (see Section 8.1.4 for details).
    RefusedStream = 0x7,
    /// Used by the endpoint to indicate that the stream is no longer needed.
    Cancel = 0x8,
    /// The endpoint is unable to maintain the header compression context for the connection.
    CompressionError = 0x9,
    /// The connection established in response to a CONNECT request (Section 8.3) was reset or abnormally closed.
    ConnectError = 0xa,
    /// The endpoint detected that its peer is exhibiting a behavior that might be generating excessive load.
    EnhanceYourCalm = 0xb,
    /// The underlying transport has properties that do not meet minimum security requirements (see Section 9.2).
    InadequateSecurity = 0xc,
    /// The endpoint requires that HTTP/1.1 be used instead of HTTP/2.
    Http11Required = 0xd,
}

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    enum_map::Enum,
)]
#[repr(u16)]
#[non_exhaustive]
pub enum SettingsParameter {
    /// Allows the sender to inform the remote endpoint of the maximum size of the header compression table used to decode header blocks, in octets. The encoder can select any size equal to or less than this value by using signaling specific to the header compression format inside a header block (see [COMPRESSION]). The initial value is 4,096 octets.
    HeaderTableSize = 0x1,
    /// This setting can be used to disable server push (Section 8.2). An endpoint MUST NOT send a PUSH_PROMISE frame if it receives this parameter set to a value of 0. An endpoint that has both set this parameter to 0 and had it acknowledged MUST treat the receipt of a PUSH_PROMISE frame as a connection error (Section 5.4.1) of type PROTOCOL_ERROR.
    /// The initial value is 1, which indicates that server push is permitted. Any value other than 0 or 1 MUST be treated as a connection error (Section 5.4.1) of type PROTOCOL_ERROR.
    EnablePush = 0x2,
    /// Indicates the maximum number of concurrent streams that the sender will allow. This limit is directional: it applies to the number of streams that the sender permits the receiver to create. Initially, there is no limit to this value. It is recommended that this value be no smaller than 100, so as to not unnecessarily limit parallelism.
    MaxConcurrentStreams = 0x3,
    /// Indicates the sender's initial window size (in octets) for stream-level flow control. The initial value is 2^16-1 (65,535) octets.
    /// This setting affects the window size of all streams (see Section 6.9.2).
    /// Values above the maximum flow-control window size of 2^31-1 MUST be treated as a connection error (Section 5.4.1) of type FLOW_CONTROL_ERROR.
    InitialWindowSize = 0x4,
    /// Indicates the size of the largest frame payload that the sender is willing to receive, in octets.
    /// The initial value is 2^14 (16,384) octets. The value advertised by an endpoint MUST be between this initial value and the maximum allowed frame size (2^24-1 or 16,777,215 octets), inclusive. Values outside this range MUST be treated as a connection error (Section 5.4.1) of type PROTOCOL_ERROR.
    MaxFrameSize = 0x5,
    /// This advisory setting informs a peer of the maximum size of header list that the sender is prepared to accept, in octets. The value is based on the uncompressed size of header fields, including the length of the name and value in octets plus an overhead of 32 octets for each header field.
    MaxHeaderListSize = 0x6,
}

/// Application protocol spoken on a transport, from ALPN or cleartext
/// defaulting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Protocol {
    #[display(fmt = "HTTP/2")]
    Http2,
    #[display(fmt = "HTTP/1.1")]
    Http11,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::{FromPrimitive, ToPrimitive};

    #[test]
    fn frame_type_round_trip() {
        for ty in 0x0..=0x9u8 {
            let parsed = FrameType::from_u8(ty).unwrap();
            assert_eq!(parsed.to_u8(), Some(ty));
        }
        assert_eq!(FrameType::from_u8(0xa), None);
    }

    #[test]
    fn error_type_bounds() {
        assert_eq!(ErrorType::from_u32(0x0), Some(ErrorType::NoError));
        assert_eq!(ErrorType::from_u32(0xd), Some(ErrorType::Http11Required));
        assert_eq!(ErrorType::from_u32(0xe), None);
    }

    #[test]
    fn u31_max() {
        assert_eq!(U31_MAX, 2_147_483_647);
    }
}
