use crate::flags::*;
use crate::types::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_traits::{FromPrimitive, ToPrimitive};
use std::num::NonZeroU32;

/// The 24-byte client connection preface, sent before the first SETTINGS.
/// https://httpwg.org/specs/rfc7540.html#ConnectionHeader
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FRAME_HEADER_LEN: usize = 9;

/// Priority fields carried by PRIORITY frames and the HEADERS priority flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub dependency: StreamId,
    pub exclusive: bool,
    pub weight: u8,
}

impl Default for Priority {
    fn default() -> Self {
        Self {
            dependency: 0,
            exclusive: false,
            weight: 15, // RFC default weight 16, stored minus one
        }
    }
}

/// A parsed HTTP/2 frame. Payload slices reference the read buffer they were
/// parsed out of; a frame never changes once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream: NonZeroStreamId,
        flags: DataFlags,
        /// Padding octets (including the pad-length byte) stripped during
        /// parsing. They still count against flow-control windows.
        pad: u16,
        data: Bytes,
    },
    Headers {
        stream: NonZeroStreamId,
        flags: HeadersFlags,
        priority: Option<Priority>,
        fragment: Bytes,
    },
    Priority {
        stream: NonZeroStreamId,
        priority: Priority,
    },
    ResetStream {
        stream: NonZeroStreamId,
        error: ErrorType,
    },
    Settings {
        flags: SettingsFlags,
        params: Vec<(SettingsParameter, u32)>,
    },
    PushPromise {
        stream: NonZeroStreamId,
        flags: PushPromiseFlags,
        promised: NonZeroStreamId,
        fragment: Bytes,
    },
    Ping {
        flags: PingFlags,
        data: [u8; 8],
    },
    GoAway {
        last_stream: StreamId,
        error: ErrorType,
        debug: Bytes,
    },
    WindowUpdate {
        stream: StreamId,
        increment: NonZeroU32,
    },
    Continuation {
        stream: NonZeroStreamId,
        flags: ContinuationFlags,
        fragment: Bytes,
    },
    /// Frame of a type this implementation does not know. Kept so the
    /// dispatcher can notice it arrived (CONTINUATION interleaving) and then
    /// discard it, per RFC forward compatibility.
    Unknown {
        ty: u8,
        stream: StreamId,
        flags: u8,
        len: u32,
    },
}

impl Frame {
    /// Try to parse one frame out of `buf`, consuming its bytes on success.
    /// `Ok(None)` means more bytes are needed. The length check against
    /// `max_frame_size` happens as soon as the 9-byte header is in, before
    /// waiting for the payload.
    pub fn parse(
        buf: &mut BytesMut,
        max_frame_size: u32,
    ) -> Result<Option<Frame>, FrameDecodeError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from(buf[0]) << 16 | u32::from(buf[1]) << 8 | u32::from(buf[2]);
        if length > max_frame_size {
            return Err(FrameDecodeError::FrameTooLarge(length, max_frame_size));
        }
        if buf.len() < FRAME_HEADER_LEN + length as usize {
            buf.reserve(FRAME_HEADER_LEN + length as usize - buf.len());
            return Ok(None);
        }

        let header = buf.split_to(FRAME_HEADER_LEN);
        let ty = header[3];
        let flags = header[4];
        // top bit of the stream id is reserved and cleared on read
        let stream_id = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & U31_MAX;
        let payload = buf.split_to(length as usize).freeze();

        let Some(ty) = FrameType::from_u8(ty) else {
            // unknown types are skipped, not errored
            return Ok(Some(Frame::Unknown {
                ty,
                stream: stream_id,
                flags,
                len: length,
            }));
        };
        Self::parse_payload(ty, flags, stream_id, payload).map(Some)
    }

    fn parse_payload(
        ty: FrameType,
        raw_flags: u8,
        stream_id: StreamId,
        payload: Bytes,
    ) -> Result<Frame, FrameDecodeError> {
        let stream = NonZeroU32::new(stream_id);
        let require_stream = || stream.ok_or(FrameDecodeError::ZeroStreamId);
        let require_conn = || {
            if stream_id == 0 {
                Ok(())
            } else {
                Err(FrameDecodeError::NonZeroStreamId(ty))
            }
        };

        Ok(match ty {
            FrameType::Data => {
                let stream = require_stream()?;
                let flags = DataFlags::from_bits_truncate(raw_flags);
                let (data, pad) = if flags.contains(DataFlags::PADDED) {
                    strip_padding(payload)?
                } else {
                    (payload, 0)
                };
                Frame::Data {
                    stream,
                    flags,
                    pad,
                    data,
                }
            }
            FrameType::Headers => {
                let stream = require_stream()?;
                let flags = HeadersFlags::from_bits_truncate(raw_flags);
                let mut fragment = if flags.contains(HeadersFlags::PADDED) {
                    strip_padding(payload)?.0
                } else {
                    payload
                };
                let priority = if flags.contains(HeadersFlags::PRIORITY) {
                    if fragment.len() < 5 {
                        return Err(FrameDecodeError::PayloadTooShort);
                    }
                    let word = fragment.get_u32();
                    let weight = fragment.get_u8();
                    Some(Priority {
                        dependency: word & U31_MAX,
                        exclusive: word & !U31_MAX != 0,
                        weight,
                    })
                } else {
                    None
                };
                Frame::Headers {
                    stream,
                    flags,
                    priority,
                    fragment,
                }
            }
            FrameType::Priority => {
                let stream = require_stream()?;
                if payload.len() != 5 {
                    return Err(FrameDecodeError::WrongPayloadLength {
                        ty,
                        got: payload.len() as u32,
                        expected: "5",
                    });
                }
                let mut payload = payload;
                let word = payload.get_u32();
                let weight = payload.get_u8();
                Frame::Priority {
                    stream,
                    priority: Priority {
                        dependency: word & U31_MAX,
                        exclusive: word & !U31_MAX != 0,
                        weight,
                    },
                }
            }
            FrameType::ResetStream => {
                let stream = require_stream()?;
                if payload.len() != 4 {
                    return Err(FrameDecodeError::WrongPayloadLength {
                        ty,
                        got: payload.len() as u32,
                        expected: "4",
                    });
                }
                let mut payload = payload;
                let code = payload.get_u32();
                Frame::ResetStream {
                    stream,
                    error: ErrorType::from_u32(code)
                        .ok_or(FrameDecodeError::UnknownErrorType(code))?,
                }
            }
            FrameType::Settings => {
                require_conn()?;
                let flags = SettingsFlags::from_bits_truncate(raw_flags);
                if flags.contains(SettingsFlags::ACK) && !payload.is_empty() {
                    return Err(FrameDecodeError::NonEmptySettingsAck);
                }
                if payload.len() % 6 != 0 {
                    return Err(FrameDecodeError::WrongPayloadLength {
                        ty,
                        got: payload.len() as u32,
                        expected: "a multiple of 6",
                    });
                }
                let mut params = Vec::with_capacity(payload.len() / 6);
                for chunk in payload.chunks(6) {
                    // unknown identifiers are ignored, per spec
                    if let Some(param) = SettingsParameter::from_u16(u16::from_be_bytes([
                        chunk[0], chunk[1],
                    ])) {
                        params.push((
                            param,
                            u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
                        ));
                    }
                }
                Frame::Settings { flags, params }
            }
            FrameType::PushPromise => {
                let stream = require_stream()?;
                let flags = PushPromiseFlags::from_bits_truncate(raw_flags);
                let mut fragment = if flags.contains(PushPromiseFlags::PADDED) {
                    strip_padding(payload)?.0
                } else {
                    payload
                };
                if fragment.len() < 4 {
                    return Err(FrameDecodeError::PayloadTooShort);
                }
                let promised = NonZeroU32::new(fragment.get_u32() & U31_MAX)
                    .ok_or(FrameDecodeError::ZeroStreamId)?;
                Frame::PushPromise {
                    stream,
                    flags,
                    promised,
                    fragment,
                }
            }
            FrameType::Ping => {
                require_conn()?;
                if payload.len() != 8 {
                    return Err(FrameDecodeError::WrongPayloadLength {
                        ty,
                        got: payload.len() as u32,
                        expected: "8",
                    });
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Frame::Ping {
                    flags: PingFlags::from_bits_truncate(raw_flags),
                    data,
                }
            }
            FrameType::GoAway => {
                require_conn()?;
                if payload.len() < 8 {
                    return Err(FrameDecodeError::WrongPayloadLength {
                        ty,
                        got: payload.len() as u32,
                        expected: "at least 8",
                    });
                }
                let mut payload = payload;
                let last_stream = payload.get_u32() & U31_MAX;
                let code = payload.get_u32();
                Frame::GoAway {
                    last_stream,
                    error: ErrorType::from_u32(code)
                        .ok_or(FrameDecodeError::UnknownErrorType(code))?,
                    debug: payload,
                }
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(FrameDecodeError::WrongPayloadLength {
                        ty,
                        got: payload.len() as u32,
                        expected: "4",
                    });
                }
                let mut payload = payload;
                let increment = NonZeroU32::new(payload.get_u32() & U31_MAX)
                    .ok_or(FrameDecodeError::ZeroWindowIncrement)?;
                Frame::WindowUpdate {
                    stream: stream_id,
                    increment,
                }
            }
            FrameType::Continuation => {
                let stream = require_stream()?;
                Frame::Continuation {
                    stream,
                    flags: ContinuationFlags::from_bits_truncate(raw_flags),
                    fragment: payload,
                }
            }
        })
    }

    /// Serialize into `dst`. Callers split anything that would exceed the
    /// peer's MAX_FRAME_SIZE before it gets here.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Data {
                stream,
                flags,
                data,
                ..
            } => {
                // we never emit padding; the flag would promise a pad-length
                // byte that is not there
                let flags = *flags - DataFlags::PADDED;
                encode_header(dst, data.len(), FrameType::Data, flags.bits(), stream.get());
                dst.put_slice(data);
            }
            Frame::Headers {
                stream,
                flags,
                priority,
                fragment,
            } => {
                let priority_len = if priority.is_some() { 5 } else { 0 };
                let mut flags = *flags;
                if priority.is_some() {
                    flags |= HeadersFlags::PRIORITY;
                }
                encode_header(
                    dst,
                    fragment.len() + priority_len,
                    FrameType::Headers,
                    flags.bits(),
                    stream.get(),
                );
                if let Some(priority) = priority {
                    put_priority(dst, priority);
                }
                dst.put_slice(fragment);
            }
            Frame::Priority { stream, priority } => {
                encode_header(dst, 5, FrameType::Priority, 0, stream.get());
                put_priority(dst, priority);
            }
            Frame::ResetStream { stream, error } => {
                encode_header(dst, 4, FrameType::ResetStream, 0, stream.get());
                // unwrap: ErrorType is repr(u32)
                dst.put_u32(error.to_u32().unwrap());
            }
            Frame::Settings { flags, params } => {
                encode_header(
                    dst,
                    params.len() * 6,
                    FrameType::Settings,
                    flags.bits(),
                    0,
                );
                for (param, value) in params {
                    // unwrap: SettingsParameter is repr(u16)
                    dst.put_u16(param.to_u16().unwrap());
                    dst.put_u32(*value);
                }
            }
            Frame::PushPromise {
                stream,
                flags,
                promised,
                fragment,
            } => {
                encode_header(
                    dst,
                    fragment.len() + 4,
                    FrameType::PushPromise,
                    flags.bits(),
                    stream.get(),
                );
                dst.put_u32(promised.get());
                dst.put_slice(fragment);
            }
            Frame::Ping { flags, data } => {
                encode_header(dst, 8, FrameType::Ping, flags.bits(), 0);
                dst.put_slice(data);
            }
            Frame::GoAway {
                last_stream,
                error,
                debug,
            } => {
                encode_header(dst, 8 + debug.len(), FrameType::GoAway, 0, 0);
                dst.put_u32(*last_stream);
                // unwrap: ErrorType is repr(u32)
                dst.put_u32(error.to_u32().unwrap());
                dst.put_slice(debug);
            }
            Frame::WindowUpdate { stream, increment } => {
                encode_header(dst, 4, FrameType::WindowUpdate, 0, *stream);
                dst.put_u32(increment.get());
            }
            Frame::Continuation {
                stream,
                flags,
                fragment,
            } => {
                encode_header(
                    dst,
                    fragment.len(),
                    FrameType::Continuation,
                    flags.bits(),
                    stream.get(),
                );
                dst.put_slice(fragment);
            }
            Frame::Unknown { .. } => unreachable!("unknown frames are never sent"),
        }
    }
}

fn encode_header(dst: &mut BytesMut, len: usize, ty: FrameType, flags: u8, stream_id: StreamId) {
    dst.reserve(FRAME_HEADER_LEN + len);
    dst.put_slice(&(len as u32).to_be_bytes()[1..]);
    // unwrap: FrameType is repr(u8)
    dst.put_u8(ty.to_u8().unwrap());
    dst.put_u8(flags);
    dst.put_u32(stream_id & U31_MAX);
}

fn put_priority(dst: &mut BytesMut, priority: &Priority) {
    let word = priority.dependency & U31_MAX | if priority.exclusive { !U31_MAX } else { 0 };
    dst.put_u32(word);
    dst.put_u8(priority.weight);
}

/// Drop the pad-length byte and trailing padding of a PADDED payload,
/// reporting how many octets went to padding overall.
fn strip_padding(payload: Bytes) -> Result<(Bytes, u16), FrameDecodeError> {
    let mut payload = payload;
    if payload.is_empty() {
        return Err(FrameDecodeError::PayloadTooShort);
    }
    let pad_length = payload.get_u8() as usize;
    if pad_length >= payload.len() + 1 {
        // pad length must be strictly less than the remaining payload plus
        // its own byte
        return Err(FrameDecodeError::PaddingTooLong);
    }
    payload.truncate(payload.len() - pad_length);
    Ok((payload, pad_length as u16 + 1))
}
