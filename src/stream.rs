use crate::error::{ConnectionError, Error, Result, StreamError};
use crate::flow_control::{RecvWindow, SendWindow};
use crate::frame::Priority;
use crate::types::{NonZeroStreamId, Protocol};
use bytes::BytesMut;
use derivative::Derivative;
use log::trace;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::oneshot;

/// https://httpwg.org/specs/rfc7540.html#StreamStates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Send,
    Recv,
}

/// Stream-affecting events, reduced to what drives the state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Headers { end_stream: bool },
    Data { end_stream: bool },
    Reset,
    PushPromise,
}

/// Scope of a state-machine violation: connection-fatal when the event is
/// impossible for a known live stream, stream-scoped when the stream is
/// simply done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    Connection(ConnectionError),
    Stream(StreamError),
}

/// Pure transition function for the legal-event table. Returns the state
/// after the event.
pub fn transition(
    state: StreamState,
    dir: Dir,
    event: Event,
) -> std::result::Result<StreamState, TransitionError> {
    use StreamState::*;

    match event {
        Event::Reset => match state {
            Idle => Err(TransitionError::Connection(ConnectionError::Protocol(
                "RST_STREAM on an idle stream",
            ))),
            _ => Ok(Closed),
        },
        Event::PushPromise => match (state, dir) {
            (Idle, Dir::Recv) => Ok(ReservedRemote),
            _ => Err(TransitionError::Connection(ConnectionError::Protocol(
                "PUSH_PROMISE outside an idle stream",
            ))),
        },
        Event::Headers { end_stream } => match (state, dir) {
            (Idle, Dir::Send) => Ok(if end_stream { HalfClosedLocal } else { Open }),
            (Idle, Dir::Recv) => Ok(if end_stream { HalfClosedRemote } else { Open }),
            (ReservedRemote, Dir::Recv) => Ok(if end_stream { Closed } else { HalfClosedLocal }),
            (Open, _) | (HalfClosedLocal, Dir::Recv) | (HalfClosedRemote, Dir::Send) => {
                end_stream_transition(state, dir, end_stream)
            }
            (HalfClosedRemote, Dir::Recv) | (Closed, Dir::Recv) => {
                Err(TransitionError::Stream(StreamError::Closed))
            }
            _ => Err(TransitionError::Connection(ConnectionError::Protocol(
                "HEADERS in an impossible stream state",
            ))),
        },
        Event::Data { end_stream } => match (state, dir) {
            (Open, _) | (HalfClosedLocal, Dir::Recv) | (HalfClosedRemote, Dir::Send) => {
                end_stream_transition(state, dir, end_stream)
            }
            (Idle, _) => Err(TransitionError::Connection(ConnectionError::Protocol(
                "DATA on an idle stream",
            ))),
            _ => Err(TransitionError::Stream(StreamError::Closed)),
        },
    }
}

fn end_stream_transition(
    state: StreamState,
    dir: Dir,
    end_stream: bool,
) -> std::result::Result<StreamState, TransitionError> {
    use StreamState::*;
    if !end_stream {
        return Ok(state);
    }
    Ok(match (state, dir) {
        (Open, Dir::Send) => HalfClosedLocal,
        (Open, Dir::Recv) => HalfClosedRemote,
        (HalfClosedLocal, Dir::Recv) | (HalfClosedRemote, Dir::Send) => Closed,
        // callers matched the legal combinations already
        _ => unreachable!("end_stream_transition on {state:?}/{dir:?}"),
    })
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Stream {
    pub id: NonZeroStreamId,
    #[derivative(Debug = "ignore")]
    pub response_tx: Option<oneshot::Sender<Result<crate::response::Response>>>,
    state: StreamState,
    /// Bytes we may still send on this stream (peer's grant).
    pub send_window: SendWindow,
    /// Bytes the peer may still send us.
    pub recv_window: RecvWindow,
    pub priority: Priority,
    pub created_at: Instant,
    pub closed_at: Option<Instant>,
    /// HEAD responses legitimately carry a content-length with no body.
    pub head_request: bool,
    body_buffer: BytesMut,
    response_headers: HashMap<String, String>,
    status: Option<u16>,
    content_length: Option<u64>,
}

impl Stream {
    #[must_use]
    pub fn new(
        id: NonZeroStreamId,
        send_initial: i32,
        recv_initial: i32,
        created_at: Instant,
    ) -> Self {
        Self {
            id,
            response_tx: None,
            state: StreamState::Idle,
            send_window: SendWindow::new(send_initial),
            recv_window: RecvWindow::new(recv_initial),
            priority: Priority::default(),
            created_at,
            closed_at: None,
            head_request: false,
            body_buffer: BytesMut::new(),
            response_headers: HashMap::new(),
            status: None,
            content_length: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// A stream counts against MAX_CONCURRENT_STREAMS until fully closed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self.state, StreamState::Idle | StreamState::Closed)
    }

    /// Whether the final response headers arrived; a later header block is a
    /// trailer block. Informational (1xx) statuses do not count.
    #[must_use]
    pub fn has_final_status(&self) -> bool {
        matches!(self.status, Some(status) if status >= 200)
    }

    /// Run one event through the state table, recording close time.
    pub fn apply(
        &mut self,
        dir: Dir,
        event: Event,
    ) -> std::result::Result<(), TransitionError> {
        let next = transition(self.state, dir, event)?;
        if next != self.state {
            trace!("stream {} {:?} -> {:?}", self.id, self.state, next);
            if next == StreamState::Closed {
                self.closed_at = Some(Instant::now());
            }
            self.state = next;
        }
        Ok(())
    }

    /// Update priority from a PRIORITY frame or HEADERS priority fields.
    pub fn reprioritize(&mut self, priority: Priority) -> std::result::Result<(), StreamError> {
        if priority.dependency == self.id.get() {
            return Err(StreamError::SelfDependency);
        }
        self.priority = priority;
        Ok(())
    }

    /// Fold a decoded response header list into the pending response.
    pub fn on_response_headers(
        &mut self,
        headers: Vec<(String, String)>,
        status: Option<u16>,
        content_length: Option<u64>,
    ) {
        if let Some(status) = status {
            self.status = Some(status);
        }
        self.content_length = content_length.or(self.content_length);
        for (name, value) in headers {
            if !name.starts_with(':') {
                self.response_headers.insert(name, value);
            }
        }
    }

    pub fn on_data(&mut self, data: &[u8]) {
        self.body_buffer.extend_from_slice(data);
    }

    /// END_STREAM arrived: check the body against content-length and deliver
    /// the response.
    pub fn finalize(&mut self) -> std::result::Result<(), StreamError> {
        if let Some(declared) = self.content_length {
            if !self.head_request && declared != self.body_buffer.len() as u64 {
                return Err(StreamError::WrongContentLength);
            }
        }
        let Some(status) = self.status else {
            return Err(StreamError::InvalidHeaders);
        };
        let response = crate::response::Response {
            status,
            headers: std::mem::take(&mut self.response_headers),
            body: std::mem::take(&mut self.body_buffer).freeze(),
            protocol: Protocol::Http2,
        };
        if let Some(tx) = self.response_tx.take() {
            // the requester may have stopped waiting, which is fine
            tx.send(Ok(response)).ok();
        }
        Ok(())
    }

    /// Fail the pending request, if anyone is still waiting on it.
    pub fn fail(&mut self, error: Error) {
        if let Some(tx) = self.response_tx.take() {
            tx.send(Err(error)).ok();
        }
    }

    /// Streams torn down within 100ms of creation are counted as
    /// rapid resets (CVE-2023-44487 accounting).
    #[must_use]
    pub fn lifetime_was_rapid(&self) -> bool {
        match self.closed_at {
            Some(closed_at) => closed_at.duration_since(self.created_at).as_millis() < 100,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StreamState::*;

    fn headers(end_stream: bool) -> Event {
        Event::Headers { end_stream }
    }

    fn data(end_stream: bool) -> Event {
        Event::Data { end_stream }
    }

    #[test]
    fn request_response_lifecycle() {
        // send request headers, receive response headers then data
        let mut state = Idle;
        state = transition(state, Dir::Send, headers(false)).unwrap();
        assert_eq!(state, Open);
        state = transition(state, Dir::Send, data(true)).unwrap();
        assert_eq!(state, HalfClosedLocal);
        state = transition(state, Dir::Recv, headers(false)).unwrap();
        assert_eq!(state, HalfClosedLocal);
        state = transition(state, Dir::Recv, data(true)).unwrap();
        assert_eq!(state, Closed);
    }

    #[test]
    fn headers_with_end_stream_half_closes() {
        assert_eq!(
            transition(Idle, Dir::Send, headers(true)).unwrap(),
            HalfClosedLocal
        );
        assert_eq!(
            transition(Idle, Dir::Recv, headers(true)).unwrap(),
            HalfClosedRemote
        );
    }

    #[test]
    fn reset_closes_everywhere_but_idle() {
        for state in [Open, HalfClosedLocal, HalfClosedRemote, Closed] {
            assert_eq!(transition(state, Dir::Recv, Event::Reset).unwrap(), Closed);
            assert_eq!(transition(state, Dir::Send, Event::Reset).unwrap(), Closed);
        }
        assert!(matches!(
            transition(Idle, Dir::Recv, Event::Reset),
            Err(TransitionError::Connection(_))
        ));
    }

    #[test]
    fn data_on_idle_is_connection_fatal() {
        assert!(matches!(
            transition(Idle, Dir::Recv, data(false)),
            Err(TransitionError::Connection(_))
        ));
    }

    #[test]
    fn recv_after_remote_close_is_stream_scoped() {
        assert_eq!(
            transition(HalfClosedRemote, Dir::Recv, data(false)),
            Err(TransitionError::Stream(StreamError::Closed))
        );
        assert_eq!(
            transition(Closed, Dir::Recv, headers(false)),
            Err(TransitionError::Stream(StreamError::Closed))
        );
    }

    #[test]
    fn replay_is_deterministic() {
        // the same legal event sequence always lands in the same state
        let script = [
            (Dir::Send, headers(false)),
            (Dir::Recv, headers(false)),
            (Dir::Recv, data(false)),
            (Dir::Send, data(true)),
            (Dir::Recv, data(true)),
        ];
        let run = || {
            let mut state = Idle;
            for (dir, event) in script {
                state = transition(state, dir, event).unwrap();
            }
            state
        };
        assert_eq!(run(), run());
        assert_eq!(run(), Closed);
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut stream = Stream::new(
            NonZeroStreamId::new(5).unwrap(),
            65_535,
            65_535,
            Instant::now(),
        );
        assert_eq!(
            stream.reprioritize(Priority {
                dependency: 5,
                exclusive: false,
                weight: 10,
            }),
            Err(StreamError::SelfDependency)
        );
        assert!(stream
            .reprioritize(Priority {
                dependency: 3,
                exclusive: true,
                weight: 10,
            })
            .is_ok());
    }

    #[test]
    fn content_length_mismatch_fails_finalize() {
        let mut stream = Stream::new(
            NonZeroStreamId::new(1).unwrap(),
            65_535,
            65_535,
            Instant::now(),
        );
        stream.on_response_headers(
            vec![("content-length".to_owned(), "5".to_owned())],
            Some(200),
            Some(5),
        );
        stream.on_data(b"abc");
        assert_eq!(stream.finalize(), Err(StreamError::WrongContentLength));
    }

    #[test]
    fn zero_content_length_with_no_body_is_fine() {
        let mut stream = Stream::new(
            NonZeroStreamId::new(1).unwrap(),
            65_535,
            65_535,
            Instant::now(),
        );
        stream.on_response_headers(vec![], Some(204), Some(0));
        assert!(stream.finalize().is_ok());
    }
}
