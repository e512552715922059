use crate::error::{Error, StreamError};
use crate::stream::Stream;
use crate::types::{ErrorType, NonZeroStreamId, StreamId, U31_MAX};
use dashmap::DashMap;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Why a new stream cannot be opened right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// Client ids ran past 2^31-1; only a fresh connection can continue.
    #[error("client stream ids exhausted")]
    IdsExhausted,
    /// Peer's MAX_CONCURRENT_STREAMS (or our own cap) is fully used.
    #[error("stream capacity exhausted")]
    AtCapacity,
}

/// Verdict of the rapid-reset accounting after an event is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetVerdict {
    Ok,
    /// Creation or reset rate crossed the mitigation threshold.
    EnhanceYourCalm,
}

/// Default mitigation thresholds (CVE-2023-44487): streams created per
/// second, streams reset per minute.
pub const MAX_CREATED_PER_SEC: usize = 100;
pub const MAX_RESETS_PER_MIN: usize = 1000;
/// How long a closed stream's id is remembered for PRIORITY frames and
/// reset-rate accounting before cleanup.
const CLOSED_RETENTION: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct ResetTracker {
    created: VecDeque<Instant>,
    resets: VecDeque<Instant>,
    rapid_resets: usize,
}

impl ResetTracker {
    fn trim(queue: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(&front) = queue.front() {
            if now.duration_since(front) > window {
                queue.pop_front();
            } else {
                break;
            }
        }
    }

    fn record_created(&mut self, now: Instant, max_per_sec: usize) -> ResetVerdict {
        Self::trim(&mut self.created, now, Duration::from_secs(1));
        self.created.push_back(now);
        if self.created.len() > max_per_sec {
            ResetVerdict::EnhanceYourCalm
        } else {
            ResetVerdict::Ok
        }
    }

    fn record_reset(&mut self, now: Instant, rapid: bool, max_per_min: usize) -> ResetVerdict {
        Self::trim(&mut self.resets, now, Duration::from_secs(60));
        self.resets.push_back(now);
        if rapid {
            self.rapid_resets += 1;
        }
        if self.resets.len() > max_per_min {
            ResetVerdict::EnhanceYourCalm
        } else {
            ResetVerdict::Ok
        }
    }
}

/// Owns every stream of one connection: id allocation, the id→stream table,
/// the concurrency cap and the reset-rate accounting.
pub struct StreamCoordinator {
    next_id: AtomicU32,
    streams: DashMap<NonZeroStreamId, Stream>,
    /// min(peer MAX_CONCURRENT_STREAMS, local per-connection cap)
    max_concurrent: AtomicU32,
    tracker: Mutex<ResetTracker>,
    max_created_per_sec: usize,
    max_resets_per_min: usize,
}

impl StreamCoordinator {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            next_id: AtomicU32::new(1),
            streams: DashMap::new(),
            max_concurrent: AtomicU32::new(max_concurrent),
            tracker: Mutex::new(ResetTracker::default()),
            max_created_per_sec: MAX_CREATED_PER_SEC,
            max_resets_per_min: MAX_RESETS_PER_MIN,
        }
    }

    /// Same as [`new`] with non-default mitigation thresholds.
    ///
    /// [`new`]: StreamCoordinator::new
    #[must_use]
    pub fn with_reset_thresholds(
        max_concurrent: u32,
        max_created_per_sec: usize,
        max_resets_per_min: usize,
    ) -> Self {
        let mut coordinator = Self::new(max_concurrent);
        coordinator.max_created_per_sec = max_created_per_sec;
        coordinator.max_resets_per_min = max_resets_per_min;
        coordinator
    }

    pub fn set_max_concurrent(&self, max: u32) {
        self.max_concurrent.store(max, Ordering::SeqCst);
    }

    /// Streams currently counting against MAX_CONCURRENT_STREAMS.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.streams
            .iter()
            .filter(|entry| entry.value().is_active())
            .count()
    }

    /// Whether a new request could be dispatched right now.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.next_id.load(Ordering::SeqCst) <= U31_MAX
            && self.active_count() < self.max_concurrent.load(Ordering::SeqCst) as usize
    }

    /// Reserve the next odd client stream id and create its stream entry.
    /// The verdict reports whether the creation rate crossed the mitigation
    /// threshold.
    pub fn allocate(
        &self,
        send_initial: i32,
        recv_initial: i32,
    ) -> Result<(NonZeroStreamId, ResetVerdict), AllocError> {
        if self.active_count() >= self.max_concurrent.load(Ordering::SeqCst) as usize {
            return Err(AllocError::AtCapacity);
        }
        let id = self.next_id.fetch_add(2, Ordering::SeqCst);
        if id > U31_MAX {
            // leave the counter wedged so every later attempt fails too
            self.next_id.store(u32::MAX - 1, Ordering::SeqCst);
            return Err(AllocError::IdsExhausted);
        }
        // unwrap: ids start at 1 and only grow
        let id = NonZeroStreamId::new(id).unwrap();
        let now = Instant::now();
        self.streams
            .insert(id, Stream::new(id, send_initial, recv_initial, now));
        let verdict = self
            .tracker
            .lock()
            .expect("reset tracker lock")
            .record_created(now, self.max_created_per_sec);
        if verdict == ResetVerdict::EnhanceYourCalm {
            warn!("stream creation rate over {}/s", self.max_created_per_sec);
        }
        Ok((id, verdict))
    }

    /// Run `f` against an existing stream. `None` if the id is unknown
    /// (never opened, or already cleaned up).
    pub fn with_stream<T, F>(&self, id: NonZeroStreamId, f: F) -> Option<T>
    where
        F: FnOnce(&mut Stream) -> T,
    {
        self.streams.get_mut(&id).map(|mut entry| f(entry.value_mut()))
    }

    /// True if the id was ever opened by us (lower than the allocation
    /// cursor). Distinguishes STREAM_CLOSED from PROTOCOL_ERROR handling.
    #[must_use]
    pub fn is_known_id(&self, id: StreamId) -> bool {
        id % 2 == 1 && id < self.next_id.load(Ordering::SeqCst)
    }

    /// Record a reset (sent or received) of a stream for the mitigation
    /// accounting and drop its entry from the active set.
    pub fn record_reset(&self, id: NonZeroStreamId) -> ResetVerdict {
        let rapid = self
            .with_stream(id, |stream| stream.lifetime_was_rapid())
            .unwrap_or(false);
        if rapid {
            debug!("stream {id} was reset within 100ms of creation");
        }
        self.tracker
            .lock()
            .expect("reset tracker lock")
            .record_reset(Instant::now(), rapid, self.max_resets_per_min)
    }

    #[must_use]
    pub fn rapid_reset_count(&self) -> usize {
        self.tracker.lock().expect("reset tracker lock").rapid_resets
    }

    /// Apply a SETTINGS_INITIAL_WINDOW_SIZE delta to every live stream's
    /// send window. An overflow anywhere is connection-fatal.
    pub fn adjust_send_windows(&self, delta: i64) -> Result<(), crate::error::ConnectionError> {
        for mut entry in self.streams.iter_mut() {
            if entry.value().is_active() {
                entry.value_mut().send_window.adjust(delta)?;
            }
        }
        Ok(())
    }

    /// GOAWAY: fail every stream above `last_stream` as refused (retryable),
    /// leave the rest to finish.
    pub fn fail_streams_above(&self, last_stream: StreamId, error: ErrorType) {
        for mut entry in self.streams.iter_mut() {
            let stream = entry.value_mut();
            if stream.id.get() > last_stream && stream.is_active() {
                stream.fail(Error::Stream {
                    id: stream.id.get(),
                    error: if error == ErrorType::NoError {
                        ErrorType::RefusedStream
                    } else {
                        error
                    },
                });
                let _ = stream.apply(crate::stream::Dir::Recv, crate::stream::Event::Reset);
            }
        }
    }

    /// Connection teardown: fail everything still waiting.
    pub fn fail_all(&self, make_error: impl Fn(StreamId) -> Error) {
        for mut entry in self.streams.iter_mut() {
            let stream = entry.value_mut();
            if stream.response_tx.is_some() {
                let id = stream.id.get();
                stream.fail(make_error(id));
            }
        }
    }

    /// Drop closed streams older than the retention window. Their ids stay
    /// implicitly known through the allocation cursor.
    pub fn cleanup_closed(&self) {
        let now = Instant::now();
        self.streams.retain(|_, stream| match stream.closed_at {
            Some(closed_at) => now.duration_since(closed_at) < CLOSED_RETENTION,
            None => true,
        });
    }

    /// Stream-scoped failure: surface to the waiting request and mark closed.
    pub fn reset_stream(&self, id: NonZeroStreamId, error: StreamError) {
        self.with_stream(id, |stream| {
            stream.fail(Error::Stream {
                id: id.get(),
                error: error.error_type(),
            });
            let _ = stream.apply(crate::stream::Dir::Send, crate::stream::Event::Reset);
        });
    }
}

impl Default for StreamCoordinator {
    fn default() -> Self {
        Self::new(crate::settings::DEFAULT_MAX_CONCURRENT_STREAMS)
    }
}
