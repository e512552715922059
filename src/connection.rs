//! The per-connection protocol engine: preface and SETTINGS handshake, a
//! reader task that demultiplexes inbound frames, a writer task that owns the
//! HPACK encoder and the outbound windows, and the dispatch surface requests
//! enter through.
//!
//! Ownership is partitioned instead of locked where possible: the reader owns
//! the HPACK decoder and inbound windows, the writer owns the HPACK encoder
//! and consumes outbound windows, and the stream map takes short critical
//! sections only.

use crate::buffer::BufferPool;
use crate::error::{ConnectionError, Error, Result, StreamError};
use crate::flags::*;
use crate::flow_control::{RecvWindow, SendWindow, UpdateRateLimiter, DEFAULT_WINDOW_SIZE};
use crate::frame::{Frame, Priority, PREFACE};
use crate::hpack;
use crate::settings::Settings;
use crate::socket::BoxedTransport;
use crate::stream::{Dir, Event, StreamState, TransitionError};
use crate::stream_coordinator::{AllocError, ResetVerdict, StreamCoordinator};
use crate::types::*;
use bytes::{Bytes, BytesMut};
use log::{debug, error, trace, warn};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Notify};

/// CONTINUATION flood ceilings for one header block.
const MAX_CONTINUATION_FRAMES: usize = 10;
const MAX_CONTINUATION_BYTES: usize = 16 * 1024;
/// Outstanding dispatches the writer will buffer before `send_request`
/// backpressures.
const DISPATCH_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for the SETTINGS exchange after the preface.
    pub handshake_timeout: Duration,
    /// Local cap on concurrent streams; the effective cap is the minimum of
    /// this and the peer's MAX_CONCURRENT_STREAMS.
    pub max_concurrent_streams: u32,
    /// Rapid-reset mitigation thresholds.
    pub max_created_per_sec: usize,
    pub max_resets_per_min: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_concurrent_streams: crate::settings::DEFAULT_MAX_CONCURRENT_STREAMS,
            max_created_per_sec: crate::stream_coordinator::MAX_CREATED_PER_SEC,
            max_resets_per_min: crate::stream_coordinator::MAX_RESETS_PER_MIN,
        }
    }
}

/// A request handed to the writer task. The stream entry and its completion
/// channel already exist by the time this is queued.
struct Dispatch {
    stream: NonZeroStreamId,
    headers: Headers,
    body: Bytes,
    priority: Option<Priority>,
}

/// Reader-to-writer messages. Control frames jump the dispatch queue.
enum Control {
    Frame(Frame),
    /// Write a GOAWAY, flush, and wind the writer down.
    GoAway {
        last_stream: StreamId,
        error: ErrorType,
        debug: Bytes,
    },
}

struct Shared {
    streams: StreamCoordinator,
    local_settings: RwLock<Settings>,
    remote_settings: RwLock<Settings>,
    /// Connection-scope send window; stream windows live on the streams.
    conn_send_window: Mutex<SendWindow>,
    /// Wakes the writer when any send window grows.
    window_notify: Notify,
    closing: AtomicBool,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    /// Serializes id allocation with dispatch queueing so stream ids hit the
    /// wire strictly increasing.
    dispatch_lock: tokio::sync::Mutex<()>,
    /// Outstanding PING probes by opaque payload.
    pings: Mutex<HashMap<[u8; 8], (Instant, oneshot::Sender<Duration>)>>,
    /// Highest peer-initiated stream id seen (push promises); our GOAWAY
    /// carries it.
    last_peer_stream: AtomicU32,
    /// Peer HEADER_TABLE_SIZE waiting to be applied by the writer's encoder.
    /// `u64::MAX` means nothing pending.
    pending_encoder_resize: AtomicU64,
    created_at: Instant,
    last_activity_ms: AtomicU64,
}

impl Shared {
    fn touch(&self) {
        self.last_activity_ms.store(
            self.created_at.elapsed().as_millis() as u64,
            Ordering::Relaxed,
        );
    }

    fn idle_time(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn begin_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.window_notify.notify_waiters();
    }

    fn take_pending_encoder_resize(&self) -> Option<usize> {
        let pending = self.pending_encoder_resize.swap(u64::MAX, Ordering::SeqCst);
        (pending != u64::MAX).then(|| pending as usize)
    }

    fn fail_in_flight(&self, make_error: impl Fn(StreamId) -> Error) {
        self.streams.fail_all(make_error);
        let mut pings = self.pings.lock().expect("pings lock");
        pings.clear();
    }
}

/// One live HTTP/2 connection. Cheap to share; the pool hands out clones of
/// an `Arc<Connection>`.
pub struct Connection {
    shared: Arc<Shared>,
    request_tx: mpsc::Sender<Dispatch>,
    control_tx: mpsc::UnboundedSender<Control>,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl Connection {
    /// Drive the preface + SETTINGS handshake over `transport` and return the
    /// live engine. Fails if the peer's SETTINGS does not arrive within the
    /// handshake timeout.
    pub async fn handshake(
        transport: BoxedTransport,
        config: ConnectionConfig,
        buffers: Arc<BufferPool>,
    ) -> Result<Self> {
        let (read_half, write_half) = tokio::io::split(transport);
        let (ready_tx, ready_rx) = watch::channel(false);
        let mut local_settings = Settings::default();
        local_settings
            .apply(&Settings::client_initial())
            .expect("initial client settings are valid");
        let shared = Arc::new(Shared {
            streams: StreamCoordinator::with_reset_thresholds(
                config.max_concurrent_streams,
                config.max_created_per_sec,
                config.max_resets_per_min,
            ),
            local_settings: RwLock::new(local_settings),
            remote_settings: RwLock::new(Settings::default()),
            conn_send_window: Mutex::new(SendWindow::new(DEFAULT_WINDOW_SIZE)),
            window_notify: Notify::new(),
            closing: AtomicBool::new(false),
            ready_tx,
            ready_rx,
            dispatch_lock: tokio::sync::Mutex::new(()),
            pings: Mutex::new(HashMap::new()),
            last_peer_stream: AtomicU32::new(0),
            pending_encoder_resize: AtomicU64::new(u64::MAX),
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        });

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);

        let writer = Writer {
            io: write_half,
            encoder: hpack::Encoder::default(),
            control_rx,
            request_rx,
            shared: shared.clone(),
            wire: BytesMut::with_capacity(16 * 1024),
            uploads: Vec::new(),
            shutting_down: false,
        };
        let reader = Reader {
            io: read_half,
            decoder: hpack::Decoder::default(),
            conn_recv_window: RecvWindow::new(DEFAULT_WINDOW_SIZE),
            continuation: None,
            update_limiter: UpdateRateLimiter::default(),
            saw_settings: false,
            shared: shared.clone(),
            control_tx: control_tx.clone(),
            buffers,
        };

        let local_max_concurrent = config.max_concurrent_streams;
        let writer_handle = tokio::spawn(writer.run());
        let reader_handle = tokio::spawn(reader.run(local_max_concurrent));

        let connection = Self {
            shared,
            request_tx,
            control_tx,
            reader_handle,
            writer_handle,
        };

        let mut ready = connection.shared.ready_rx.clone();
        let wait = async {
            loop {
                if *ready.borrow() {
                    return Ok(());
                }
                if ready.changed().await.is_err() {
                    return Err(Error::ConnectionClosed);
                }
            }
        };
        match tokio::time::timeout(config.handshake_timeout, wait).await {
            Ok(Ok(())) => Ok(connection),
            Ok(Err(err)) => {
                connection.abort();
                Err(err)
            }
            Err(_) => {
                connection.abort();
                Err(Error::Connection(ConnectionError::SettingsTimeout))
            }
        }
    }

    /// Send one request and wait for its response. The caller owns timeout
    /// policy; dropping the returned future resets the stream (CANCEL).
    pub async fn send_request(
        &self,
        headers: Headers,
        body: Bytes,
        priority: Option<Priority>,
    ) -> Result<crate::response::Response> {
        if self.shared.is_closing() {
            return Err(Error::ConnectionClosed);
        }
        hpack::validate_header_list(&headers, hpack::ListKind::Request)
            .map_err(|err| Error::InvalidRequest(err.to_string()))?;

        // ids are allocated under a lock held across the queue insert, so
        // HEADERS reach the wire in id order
        let dispatch_slot = self.shared.dispatch_lock.lock().await;

        let (send_initial, recv_initial) = {
            let remote = self.shared.remote_settings.read().expect("settings lock");
            let local = self.shared.local_settings.read().expect("settings lock");
            (
                remote.initial_window_size() as i32,
                local.initial_window_size() as i32,
            )
        };
        let (stream_id, verdict) = match self.shared.streams.allocate(send_initial, recv_initial) {
            Ok(allocated) => allocated,
            Err(AllocError::AtCapacity | AllocError::IdsExhausted) => {
                // the pool treats this as "connection full": retryable elsewhere
                return Err(Error::Stream {
                    id: 0,
                    error: ErrorType::RefusedStream,
                });
            }
        };
        if verdict == ResetVerdict::EnhanceYourCalm {
            self.shutdown(ErrorType::EnhanceYourCalm, "stream churn");
            return Err(Error::Connection(ConnectionError::EnhanceYourCalm(
                "stream creation rate",
            )));
        }

        let head_request = headers
            .iter()
            .any(|(name, value)| name == ":method" && value == "HEAD");
        let (response_tx, response_rx) = oneshot::channel();
        self.shared.streams.with_stream(stream_id, |stream| {
            stream.response_tx = Some(response_tx);
            stream.head_request = head_request;
        });

        let mut guard = CancelGuard {
            shared: self.shared.clone(),
            control_tx: self.control_tx.clone(),
            stream: stream_id,
            armed: true,
        };

        self.request_tx
            .send(Dispatch {
                stream: stream_id,
                headers,
                body,
                priority,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        drop(dispatch_slot);

        // teardown between registration and here may have missed this
        // stream's completion channel in its failure sweep
        if self.shared.is_closing() {
            self.shared.streams.with_stream(stream_id, |stream| {
                stream.fail(Error::ConnectionClosed);
            });
        }

        let result = match response_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        };
        guard.armed = false;
        result
    }

    /// Measure round-trip time with a PING probe.
    pub async fn ping(&self) -> Result<Duration> {
        if self.shared.is_closing() {
            return Err(Error::ConnectionClosed);
        }
        let payload: [u8; 8] = rand::random();
        let (tx, rx) = oneshot::channel();
        self.shared
            .pings
            .lock()
            .expect("pings lock")
            .insert(payload, (Instant::now(), tx));
        self.control_tx
            .send(Control::Frame(Frame::Ping {
                flags: PingFlags::empty(),
                data: payload,
            }))
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Graceful close: GOAWAY(NO_ERROR), no new requests, streams in flight
    /// drain.
    pub fn close(&self) {
        self.shutdown(ErrorType::NoError, "client going away");
    }

    fn shutdown(&self, error: ErrorType, reason: &'static str) {
        if self.shared.is_closing() {
            return;
        }
        self.shared.begin_close();
        self.control_tx
            .send(Control::GoAway {
                last_stream: self.shared.last_peer_stream.load(Ordering::SeqCst),
                error,
                debug: Bytes::from_static(reason.as_bytes()),
            })
            .ok();
    }

    fn abort(&self) {
        self.shared.begin_close();
        self.reader_handle.abort();
        self.writer_handle.abort();
    }

    /// Whether the pool may route another request here.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !self.shared.is_closing() && *self.shared.ready_rx.borrow() && self.has_stream_capacity()
    }

    #[must_use]
    pub fn has_stream_capacity(&self) -> bool {
        // shed long-closed stream entries before counting
        self.shared.streams.cleanup_closed();
        self.shared.streams.has_capacity()
    }

    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.shared.streams.active_count()
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.shared.created_at.elapsed()
    }

    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.shared.idle_time()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closing()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

/// Resets the stream if the request future is dropped before a result
/// arrived (per-request timeout or user cancellation).
struct CancelGuard {
    shared: Arc<Shared>,
    control_tx: mpsc::UnboundedSender<Control>,
    stream: NonZeroStreamId,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        trace!("cancelling stream {}", self.stream);
        // close the stream and learn whether HEADERS ever went out, in one
        // critical section; an RST for a still-idle stream would itself be a
        // protocol violation
        let had_started = self
            .shared
            .streams
            .with_stream(self.stream, |stream| {
                let started = stream.state() != StreamState::Idle;
                stream.fail(Error::Cancelled);
                let _ = stream.apply(Dir::Send, Event::Reset);
                started
            })
            .unwrap_or(false);
        if had_started {
            self.control_tx
                .send(Control::Frame(Frame::ResetStream {
                    stream: self.stream,
                    error: ErrorType::Cancel,
                }))
                .ok();
        }
        self.shared.streams.record_reset(self.stream);
    }
}

// ---------------------------------------------------------------------------
// writer task

/// A request body being streamed out. Uploads progress one chunk per pump
/// round so DATA from concurrent streams interleaves on the wire.
struct Upload {
    stream: NonZeroStreamId,
    body: Bytes,
    offset: usize,
    /// Priority weight, used as the ordering hint for the send queue.
    weight: u8,
}

struct Writer {
    io: WriteHalf<BoxedTransport>,
    encoder: hpack::Encoder,
    control_rx: mpsc::UnboundedReceiver<Control>,
    request_rx: mpsc::Receiver<Dispatch>,
    shared: Arc<Shared>,
    wire: BytesMut,
    uploads: Vec<Upload>,
    shutting_down: bool,
}

impl Writer {
    async fn run(mut self) {
        if let Err(err) = self.run_inner().await {
            debug!("writer stopped: {err}");
        }
        self.shared.begin_close();
        self.shared.fail_in_flight(|_| Error::ConnectionClosed);
    }

    async fn run_inner(&mut self) -> std::io::Result<()> {
        // client connection preface, then our SETTINGS, before anything else
        self.io.write_all(PREFACE).await?;
        self.write_frame(&Frame::Settings {
            flags: SettingsFlags::empty(),
            params: Settings::client_initial(),
        })
        .await?;

        loop {
            // drain whatever is ready without blocking, then push data
            while let Ok(control) = self.control_rx.try_recv() {
                self.handle_control(control).await?;
            }
            if self.shutting_down || self.shared.is_closing() {
                break;
            }
            while let Ok(dispatch) = self.request_rx.try_recv() {
                self.start_dispatch(dispatch).await?;
            }
            if self.pump_uploads().await? {
                continue;
            }

            // nothing writable right now: wait for work or window credit
            tokio::select! {
                biased;
                control = self.control_rx.recv() => match control {
                    Some(control) => self.handle_control(control).await?,
                    None => break,
                },
                dispatch = self.request_rx.recv() => match dispatch {
                    Some(dispatch) => self.start_dispatch(dispatch).await?,
                    None => break,
                },
                _ = self.shared.window_notify.notified(), if !self.uploads.is_empty() => {}
            }
        }
        self.io.flush().await?;
        Ok(())
    }

    async fn write_frame(&mut self, frame: &Frame) -> std::io::Result<()> {
        self.wire.clear();
        frame.encode(&mut self.wire);
        self.io.write_all(&self.wire).await?;
        self.io.flush().await?;
        self.shared.touch();
        Ok(())
    }

    async fn handle_control(&mut self, control: Control) -> std::io::Result<()> {
        match control {
            Control::Frame(frame) => self.write_frame(&frame).await,
            Control::GoAway {
                last_stream,
                error,
                debug,
            } => {
                debug!("sending GOAWAY {error:?}");
                self.write_frame(&Frame::GoAway {
                    last_stream,
                    error,
                    debug,
                })
                .await?;
                self.shutting_down = true;
                Ok(())
            }
        }
    }

    /// Encode and emit a request's header block, then queue its body (if
    /// any) as an upload.
    async fn start_dispatch(&mut self, dispatch: Dispatch) -> std::io::Result<()> {
        let Dispatch {
            stream: stream_id,
            headers,
            body,
            priority,
        } = dispatch;

        // cancelled before we got to it
        let pending = self
            .shared
            .streams
            .with_stream(stream_id, |stream| stream.state() == StreamState::Idle)
            .unwrap_or(false);
        if !pending {
            return Ok(());
        }

        if let Some(size) = self.shared.take_pending_encoder_resize() {
            self.encoder.set_max_table_size(size);
        }

        let (max_frame, max_list) = {
            let remote = self.shared.remote_settings.read().expect("settings lock");
            (
                remote.max_frame_size() as usize,
                remote.max_header_list_size() as usize,
            )
        };
        let list_size: usize = headers
            .iter()
            .map(|(name, value)| name.len() + value.len() + 32)
            .sum();
        if list_size > max_list {
            self.shared.streams.with_stream(stream_id, |stream| {
                stream.fail(Error::InvalidRequest(format!(
                    "header list of {list_size} bytes exceeds the peer's limit of {max_list}"
                )));
            });
            return Ok(());
        }

        let fragment = match self.encoder.encode(
            headers
                .iter()
                .map(|(name, value)| (name.as_bytes(), value.as_bytes())),
        ) {
            Ok(fragment) => fragment,
            Err(err) => {
                self.shared.streams.with_stream(stream_id, |stream| {
                    stream.fail(Error::InvalidRequest(err.to_string()));
                });
                return Ok(());
            }
        };

        let end_stream = body.is_empty();
        self.shared.streams.with_stream(stream_id, |stream| {
            let _ = stream.apply(Dir::Send, Event::Headers { end_stream });
        });

        self.write_header_block(stream_id, fragment, end_stream, priority, max_frame)
            .await?;
        if !end_stream {
            self.uploads.push(Upload {
                stream: stream_id,
                body,
                offset: 0,
                weight: priority.map_or(Priority::default().weight, |p| p.weight),
            });
        }
        Ok(())
    }

    /// Emit HEADERS plus any CONTINUATIONs back to back; nothing may
    /// interleave with them on this connection.
    async fn write_header_block(
        &mut self,
        stream: NonZeroStreamId,
        fragment: Bytes,
        end_stream: bool,
        priority: Option<Priority>,
        max_frame: usize,
    ) -> std::io::Result<()> {
        let mut flags = if end_stream {
            HeadersFlags::END_STREAM
        } else {
            HeadersFlags::empty()
        };
        if fragment.len() <= max_frame {
            flags |= HeadersFlags::END_HEADERS;
            return self
                .write_frame(&Frame::Headers {
                    stream,
                    flags,
                    priority,
                    fragment,
                })
                .await;
        }

        self.wire.clear();
        let mut offset = max_frame;
        Frame::Headers {
            stream,
            flags,
            priority,
            fragment: fragment.slice(..offset),
        }
        .encode(&mut self.wire);
        while offset < fragment.len() {
            let end = (offset + max_frame).min(fragment.len());
            let continuation_flags = if end == fragment.len() {
                ContinuationFlags::END_HEADERS
            } else {
                ContinuationFlags::empty()
            };
            Frame::Continuation {
                stream,
                flags: continuation_flags,
                fragment: fragment.slice(offset..end),
            }
            .encode(&mut self.wire);
            offset = end;
        }
        let block = self.wire.split();
        self.io.write_all(&block).await?;
        self.io.flush().await?;
        self.shared.touch();
        Ok(())
    }

    /// Push at most one DATA chunk per active upload, heaviest weight first.
    /// Streams that cannot progress (window empty) are skipped; streams that
    /// were reset are dropped. Returns whether anything was written.
    async fn pump_uploads(&mut self) -> std::io::Result<bool> {
        if self.uploads.is_empty() {
            return Ok(false);
        }
        // the application's priority weights order the send queue
        self.uploads.sort_by(|a, b| b.weight.cmp(&a.weight));

        let max_frame = self
            .shared
            .remote_settings
            .read()
            .expect("settings lock")
            .max_frame_size() as usize;

        let mut wrote = false;
        let mut index = 0;
        while index < self.uploads.len() {
            let stream_id = self.uploads[index].stream;
            let offset = self.uploads[index].offset;
            let total = self.uploads[index].body.len();

            let stream_available = self.shared.streams.with_stream(stream_id, |stream| {
                (stream.state() == StreamState::Open
                    || stream.state() == StreamState::HalfClosedRemote)
                    .then(|| stream.send_window.available())
            });
            let Some(Some(stream_available)) = stream_available else {
                // reset or gone under us; nothing more to send
                self.uploads.swap_remove(index);
                continue;
            };
            let connection_available = self
                .shared
                .conn_send_window
                .lock()
                .expect("window lock")
                .available();

            let chunk = (total - offset)
                .min(stream_available)
                .min(connection_available)
                .min(max_frame);
            if chunk == 0 {
                index += 1;
                continue;
            }

            self.shared
                .conn_send_window
                .lock()
                .expect("window lock")
                .consume(chunk);
            self.shared.streams.with_stream(stream_id, |stream| {
                stream.send_window.consume(chunk);
            });

            let end_stream = offset + chunk == total;
            let data = self.uploads[index].body.slice(offset..offset + chunk);
            self.write_frame(&Frame::Data {
                stream: stream_id,
                flags: if end_stream {
                    DataFlags::END_STREAM
                } else {
                    DataFlags::empty()
                },
                pad: 0,
                data,
            })
            .await?;
            wrote = true;

            if end_stream {
                self.shared.streams.with_stream(stream_id, |stream| {
                    let _ = stream.apply(Dir::Send, Event::Data { end_stream: true });
                });
                self.uploads.swap_remove(index);
            } else {
                self.uploads[index].offset += chunk;
                index += 1;
            }
        }
        Ok(wrote)
    }
}

// ---------------------------------------------------------------------------
// reader task

struct ContinuationState {
    stream: NonZeroStreamId,
    end_stream: bool,
    /// Set when the block came in on a PUSH_PROMISE: the promised stream to
    /// refuse once the block has fed the decoder.
    promised: Option<NonZeroStreamId>,
    fragments: BytesMut,
    frames: usize,
}

enum ReaderExit {
    Io(std::io::Error),
    Connection(ConnectionError),
    /// Clean EOF from the peer.
    Eof,
}

struct Reader {
    io: ReadHalf<BoxedTransport>,
    decoder: hpack::Decoder,
    conn_recv_window: RecvWindow,
    continuation: Option<ContinuationState>,
    update_limiter: UpdateRateLimiter,
    saw_settings: bool,
    shared: Arc<Shared>,
    control_tx: mpsc::UnboundedSender<Control>,
    buffers: Arc<BufferPool>,
}

impl Reader {
    async fn run(mut self, local_max_concurrent: u32) {
        {
            let local = self.shared.local_settings.read().expect("settings lock");
            let mut limits = hpack::Limits::default();
            limits.max_header_list_size = (local.max_header_list_size() as usize)
                .min(hpack::DEFAULT_MAX_HEADER_LIST_SIZE);
            self.decoder.set_limits(limits);
        }

        let mut buf = self.buffers.acquire();
        let exit = self.run_inner(&mut buf, local_max_concurrent).await;
        // closing must be visible before the failure sweep, so a request
        // racing with teardown either sees the flag or gets swept
        self.shared.begin_close();
        match exit {
            ReaderExit::Eof => {
                debug!("peer closed the transport");
                self.shared
                    .fail_in_flight(|_| Error::ConnectionClosed);
            }
            ReaderExit::Io(err) => {
                debug!("transport error: {err}");
                self.shared.fail_in_flight(|_| Error::ConnectionClosed);
            }
            ReaderExit::Connection(err) => {
                error!("connection error: {err}");
                self.control_tx
                    .send(Control::GoAway {
                        last_stream: self.shared.last_peer_stream.load(Ordering::SeqCst),
                        error: err.error_type(),
                        debug: Bytes::copy_from_slice(err.to_string().as_bytes()),
                    })
                    .ok();
                let failure = err.clone();
                self.shared
                    .fail_in_flight(move |_| Error::Connection(failure.clone()));
            }
        }
        self.buffers.release(buf);
    }

    async fn run_inner(&mut self, buf: &mut BytesMut, local_max_concurrent: u32) -> ReaderExit {
        loop {
            loop {
                let max_frame = self
                    .shared
                    .local_settings
                    .read()
                    .expect("settings lock")
                    .max_frame_size();
                match Frame::parse(buf, max_frame) {
                    Ok(Some(frame)) => {
                        self.shared.touch();
                        if let Err(err) = self.handle_frame(frame, local_max_concurrent) {
                            return ReaderExit::Connection(err);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => return ReaderExit::Connection(err.into()),
                }
            }
            match self.io.read_buf(buf).await {
                Ok(0) => return ReaderExit::Eof,
                Ok(_) => {}
                Err(err) => return ReaderExit::Io(err),
            }
        }
    }

    fn handle_frame(
        &mut self,
        frame: Frame,
        local_max_concurrent: u32,
    ) -> std::result::Result<(), ConnectionError> {
        trace!("recv {frame:?}");

        // the peer's first frame must be a non-ACK SETTINGS
        if !self.saw_settings {
            match &frame {
                Frame::Settings { flags, .. } if !flags.contains(SettingsFlags::ACK) => {}
                _ => {
                    return Err(ConnectionError::Protocol(
                        "the first frame from the peer must be SETTINGS",
                    ))
                }
            }
        }

        // an open header block admits only its own CONTINUATIONs
        if let Some(continuation) = &self.continuation {
            match &frame {
                Frame::Continuation { stream, .. } if *stream == continuation.stream => {}
                _ => {
                    return Err(ConnectionError::Protocol(
                        "frame interleaved into a header block",
                    ))
                }
            }
        }

        match frame {
            Frame::Settings { flags, params } => self.on_settings(flags, &params, local_max_concurrent),
            Frame::Ping { flags, data } => self.on_ping(flags, data),
            Frame::GoAway {
                last_stream,
                error,
                debug,
            } => self.on_goaway(last_stream, error, &debug),
            Frame::WindowUpdate { stream, increment } => self.on_window_update(stream, increment),
            Frame::Data {
                stream,
                flags,
                pad,
                data,
            } => self.on_data(stream, flags, pad, &data),
            Frame::Headers {
                stream,
                flags,
                priority,
                fragment,
            } => self.on_headers(stream, flags, priority, fragment),
            Frame::Continuation {
                stream,
                flags,
                fragment,
            } => self.on_continuation(stream, flags, &fragment),
            Frame::PushPromise {
                stream,
                flags,
                promised,
                fragment,
            } => self.on_push_promise(stream, flags, promised, fragment),
            Frame::ResetStream { stream, error } => self.on_reset(stream, error),
            Frame::Priority { stream, priority } => {
                let self_dependency = self
                    .shared
                    .streams
                    .with_stream(stream, |entry| entry.reprioritize(priority).is_err())
                    .unwrap_or(false);
                if self_dependency {
                    self.send_stream_error(stream, StreamError::SelfDependency);
                }
                Ok(())
            }
            Frame::Unknown { ty, .. } => {
                trace!("ignoring unknown frame type {ty:#x}");
                Ok(())
            }
        }
    }

    fn on_settings(
        &mut self,
        flags: SettingsFlags,
        params: &[(SettingsParameter, u32)],
        local_max_concurrent: u32,
    ) -> std::result::Result<(), ConnectionError> {
        if flags.contains(SettingsFlags::ACK) {
            trace!("peer acked our settings");
            return Ok(());
        }
        self.saw_settings = true;

        let window_delta = {
            let mut remote = self.shared.remote_settings.write().expect("settings lock");
            let delta = remote.apply(params)?;
            trace!("peer settings now {remote:?}");
            delta
        };

        for &(param, value) in params {
            match param {
                SettingsParameter::MaxConcurrentStreams => {
                    self.shared
                        .streams
                        .set_max_concurrent(value.min(local_max_concurrent));
                }
                SettingsParameter::HeaderTableSize => {
                    self.shared
                        .pending_encoder_resize
                        .store(u64::from(value), Ordering::SeqCst);
                }
                _ => {}
            }
        }

        if let Some(delta) = window_delta {
            if delta != 0 {
                self.shared.streams.adjust_send_windows(delta)?;
                self.shared.window_notify.notify_waiters();
            }
        }

        self.control_tx
            .send(Control::Frame(Frame::Settings {
                flags: SettingsFlags::ACK,
                params: Vec::new(),
            }))
            .ok();

        // the handshake completes on the first SETTINGS round-trip
        self.shared.ready_tx.send(true).ok();
        Ok(())
    }

    fn on_ping(
        &mut self,
        flags: PingFlags,
        data: [u8; 8],
    ) -> std::result::Result<(), ConnectionError> {
        if flags.contains(PingFlags::ACK) {
            if let Some((sent_at, tx)) = self.shared.pings.lock().expect("pings lock").remove(&data)
            {
                tx.send(sent_at.elapsed()).ok();
            }
            return Ok(());
        }
        self.control_tx
            .send(Control::Frame(Frame::Ping {
                flags: PingFlags::ACK,
                data,
            }))
            .ok();
        Ok(())
    }

    fn on_goaway(
        &mut self,
        last_stream: StreamId,
        error: ErrorType,
        debug_payload: &Bytes,
    ) -> std::result::Result<(), ConnectionError> {
        if error == ErrorType::NoError {
            debug!("peer going away gracefully, last stream {last_stream}");
        } else {
            error!("peer going away: {error:?}");
            if !debug_payload.is_empty() {
                if let Ok(text) = std::str::from_utf8(debug_payload) {
                    debug!("goaway debug data: {text}");
                }
            }
        }
        self.shared.closing.store(true, Ordering::SeqCst);
        // streams the peer never processed are refused and safe to retry
        self.shared
            .streams
            .fail_streams_above(last_stream, ErrorType::NoError);
        if error != ErrorType::NoError {
            self.shared
                .fail_in_flight(|_| Error::GoAway { last_stream, error });
        }
        Ok(())
    }

    fn on_window_update(
        &mut self,
        stream: StreamId,
        increment: NonZeroU32,
    ) -> std::result::Result<(), ConnectionError> {
        if !self.update_limiter.record(Instant::now()) {
            return Err(ConnectionError::EnhanceYourCalm(
                "WINDOW_UPDATE flood",
            ));
        }
        if stream == 0 {
            self.shared
                .conn_send_window
                .lock()
                .expect("window lock")
                .grow(increment.get())
                .map_err(|_| {
                    ConnectionError::FlowControl("connection window grew past 2^31-1")
                })?;
            self.shared.window_notify.notify_waiters();
            return Ok(());
        }
        // unwrap: stream != 0 here
        let id = NonZeroU32::new(stream).unwrap();
        let result = self
            .shared
            .streams
            .with_stream(id, |entry| entry.send_window.grow(increment.get()));
        match result {
            Some(Ok(())) => {
                self.shared.window_notify.notify_waiters();
                Ok(())
            }
            Some(Err(err)) => {
                self.send_stream_error(id, err);
                Ok(())
            }
            None if self.shared.streams.is_known_id(stream) => Ok(()), // closed, tolerated
            None => Err(ConnectionError::Protocol(
                "WINDOW_UPDATE for a stream that never existed",
            )),
        }
    }

    fn on_data(
        &mut self,
        stream: NonZeroStreamId,
        flags: DataFlags,
        pad: u16,
        data: &Bytes,
    ) -> std::result::Result<(), ConnectionError> {
        // padding counts against flow control even though it was stripped
        let flow_len = data.len() + pad as usize;
        // connection-scope accounting happens whatever the stream's fate
        self.conn_recv_window
            .consume(flow_len)
            .map_err(|_| ConnectionError::FlowControl("connection receive window exceeded"))?;
        if let Some(increment) = self.conn_recv_window.maybe_update() {
            // unwrap: increment is nonzero when returned
            self.control_tx
                .send(Control::Frame(Frame::WindowUpdate {
                    stream: 0,
                    increment: NonZeroU32::new(increment).unwrap(),
                }))
                .ok();
        }

        let end_stream = flags.contains(DataFlags::END_STREAM);
        let outcome = self.shared.streams.with_stream(stream, |entry| {
            if let Err(err) = entry.recv_window.consume(flow_len) {
                return Err(err);
            }
            entry
                .apply(Dir::Recv, Event::Data { end_stream })
                .map_err(|err| match err {
                    TransitionError::Stream(err) => err,
                    TransitionError::Connection(_) => StreamError::Closed,
                })?;
            entry.on_data(data);
            let update = if end_stream {
                entry.finalize()?;
                None
            } else {
                entry.recv_window.maybe_update()
            };
            Ok(update)
        });

        match outcome {
            Some(Ok(update)) => {
                if let Some(increment) = update {
                    // unwrap: increment is nonzero when returned
                    self.control_tx
                        .send(Control::Frame(Frame::WindowUpdate {
                            stream: stream.get(),
                            increment: NonZeroU32::new(increment).unwrap(),
                        }))
                        .ok();
                }
                Ok(())
            }
            Some(Err(err)) => {
                self.send_stream_error(stream, err);
                Ok(())
            }
            None if self.shared.streams.is_known_id(stream.get()) => Ok(()),
            None => Err(ConnectionError::Protocol(
                "DATA on a stream that never existed",
            )),
        }
    }

    fn on_headers(
        &mut self,
        stream: NonZeroStreamId,
        flags: HeadersFlags,
        priority: Option<Priority>,
        fragment: Bytes,
    ) -> std::result::Result<(), ConnectionError> {
        if !self.shared.streams.is_known_id(stream.get()) {
            // the peer may not open streams toward a client
            return Err(ConnectionError::Protocol(
                "HEADERS on a stream we never opened",
            ));
        }
        if let Some(priority) = priority {
            let self_dependency = self
                .shared
                .streams
                .with_stream(stream, |entry| entry.reprioritize(priority).is_err())
                .unwrap_or(false);
            if self_dependency {
                self.send_stream_error(stream, StreamError::SelfDependency);
                return Ok(());
            }
        }
        let end_stream = flags.contains(HeadersFlags::END_STREAM);
        if flags.contains(HeadersFlags::END_HEADERS) {
            self.finish_header_block(stream, end_stream, &fragment)
        } else {
            let mut fragments = BytesMut::with_capacity(fragment.len() * 2);
            fragments.extend_from_slice(&fragment);
            self.continuation = Some(ContinuationState {
                stream,
                end_stream,
                promised: None,
                fragments,
                frames: 0,
            });
            Ok(())
        }
    }

    fn on_continuation(
        &mut self,
        stream: NonZeroStreamId,
        flags: ContinuationFlags,
        fragment: &Bytes,
    ) -> std::result::Result<(), ConnectionError> {
        let Some(continuation) = &mut self.continuation else {
            return Err(ConnectionError::Protocol(
                "CONTINUATION without an open header block",
            ));
        };
        debug_assert_eq!(continuation.stream, stream);
        continuation.frames += 1;
        continuation.fragments.extend_from_slice(fragment);
        if continuation.frames > MAX_CONTINUATION_FRAMES
            || continuation.fragments.len() > MAX_CONTINUATION_BYTES
        {
            return Err(ConnectionError::EnhanceYourCalm("CONTINUATION flood"));
        }
        if flags.contains(ContinuationFlags::END_HEADERS) {
            // take ownership of the assembled block
            let state = self.continuation.take().expect("continuation state");
            let block = state.fragments.freeze();
            if let Some(promised) = state.promised {
                self.decoder
                    .decode(&block)
                    .map_err(decode_to_connection_error)?;
                self.refuse_push(promised);
                Ok(())
            } else {
                self.finish_header_block(state.stream, state.end_stream, &block)
            }
        } else {
            Ok(())
        }
    }

    fn on_push_promise(
        &mut self,
        stream: NonZeroStreamId,
        flags: PushPromiseFlags,
        promised: NonZeroStreamId,
        fragment: Bytes,
    ) -> std::result::Result<(), ConnectionError> {
        // we always negotiate push off, but a block may still arrive; its
        // fragment must run through the decoder to keep table state in sync,
        // and the promised stream is refused
        debug!("refusing pushed stream {promised}");
        self.shared
            .last_peer_stream
            .fetch_max(promised.get(), Ordering::SeqCst);
        if flags.contains(PushPromiseFlags::END_HEADERS) {
            self.decoder
                .decode(&fragment)
                .map_err(decode_to_connection_error)?;
            self.refuse_push(promised);
            Ok(())
        } else {
            let mut fragments = BytesMut::with_capacity(fragment.len() * 2);
            fragments.extend_from_slice(&fragment);
            self.continuation = Some(ContinuationState {
                stream,
                end_stream: false,
                promised: Some(promised),
                fragments,
                frames: 0,
            });
            Ok(())
        }
    }

    fn refuse_push(&self, promised: NonZeroStreamId) {
        self.control_tx
            .send(Control::Frame(Frame::ResetStream {
                stream: promised,
                error: ErrorType::RefusedStream,
            }))
            .ok();
    }

    fn on_reset(
        &mut self,
        stream: NonZeroStreamId,
        error: ErrorType,
    ) -> std::result::Result<(), ConnectionError> {
        let known = self
            .shared
            .streams
            .with_stream(stream, |entry| {
                entry.fail(Error::Stream {
                    id: stream.get(),
                    error,
                });
                let _ = entry.apply(Dir::Recv, Event::Reset);
            })
            .is_some();
        if !known && !self.shared.streams.is_known_id(stream.get()) {
            return Err(ConnectionError::Protocol(
                "RST_STREAM for a stream that never existed",
            ));
        }
        if self.shared.streams.record_reset(stream) == ResetVerdict::EnhanceYourCalm {
            return Err(ConnectionError::EnhanceYourCalm("RST_STREAM flood"));
        }
        Ok(())
    }

    /// Decode a completed response header block and feed it to its stream.
    fn finish_header_block(
        &mut self,
        stream: NonZeroStreamId,
        end_stream: bool,
        block: &[u8],
    ) -> std::result::Result<(), ConnectionError> {
        let decoded = self
            .decoder
            .decode(block)
            .map_err(decode_to_connection_error)?;

        let headers: Vec<(String, String)> = decoded
            .iter()
            .map(|(name, value)| {
                (
                    String::from_utf8_lossy(name).into_owned(),
                    String::from_utf8_lossy(value).into_owned(),
                )
            })
            .collect();

        // a second block on a stream that already has its status is trailers
        let kind = if self
            .shared
            .streams
            .with_stream(stream, |entry| entry.has_final_status())
            .unwrap_or(false)
        {
            hpack::ListKind::Trailers
        } else {
            hpack::ListKind::Response
        };
        let validated = match hpack::validate_header_list(&headers, kind) {
            Ok(validated) => validated,
            Err(err) => {
                warn!("invalid response header list on stream {stream}: {err}");
                self.send_stream_error(stream, StreamError::InvalidHeaders);
                return Ok(());
            }
        };

        let outcome = self.shared.streams.with_stream(stream, |entry| {
            entry
                .apply(Dir::Recv, Event::Headers { end_stream })
                .map_err(|err| match err {
                    TransitionError::Stream(err) => err,
                    TransitionError::Connection(_) => StreamError::Closed,
                })?;
            entry.on_response_headers(headers, validated.status, validated.content_length);
            if end_stream {
                entry.finalize()?;
            }
            Ok::<(), StreamError>(())
        });

        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(err)) => {
                self.send_stream_error(stream, err);
                Ok(())
            }
            None if self.shared.streams.is_known_id(stream.get()) => Ok(()),
            None => Err(ConnectionError::Protocol(
                "HEADERS on a stream that never existed",
            )),
        }
    }

    /// Stream-scoped failure: RST the stream, fail its request, keep the
    /// connection alive.
    fn send_stream_error(&self, stream: NonZeroStreamId, error: StreamError) {
        debug!("stream {stream} failed: {error}");
        self.control_tx
            .send(Control::Frame(Frame::ResetStream {
                stream,
                error: error.error_type(),
            }))
            .ok();
        self.shared.streams.reset_stream(stream, error);
        self.shared.streams.record_reset(stream);
    }
}

fn decode_to_connection_error(err: hpack::DecodeError) -> ConnectionError {
    match err {
        hpack::DecodeError::ListTooLarge(_)
        | hpack::DecodeError::TooManyHeaders(_)
        | hpack::DecodeError::CompressionBomb => {
            ConnectionError::EnhanceYourCalm("oversized header block")
        }
        _ => ConnectionError::Compression("header block did not decode"),
    }
}
