//! Window arithmetic for both flow-control scopes.
//!
//! Connection and stream windows share the same signed arithmetic: a window
//! may go negative on the send side when the peer shrinks
//! SETTINGS_INITIAL_WINDOW_SIZE underneath in-flight data, and must never be
//! grown past 2^31-1.

use crate::error::{ConnectionError, StreamError};
use crate::types::U31_MAX;
use log::warn;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const DEFAULT_WINDOW_SIZE: i32 = 65_535;
/// Consumption past `min(this, initial/2)` triggers a batched WINDOW_UPDATE.
const UPDATE_THRESHOLD_CAP: i32 = 32 * 1024;

/// Bytes we may still send before the peer must grant more.
#[derive(Debug, Clone, Copy)]
pub struct SendWindow {
    available: i64,
}

impl SendWindow {
    #[must_use]
    pub fn new(initial: i32) -> Self {
        Self {
            available: i64::from(initial),
        }
    }

    /// Bytes currently spendable; zero when the peer owes us credit.
    #[must_use]
    pub fn available(&self) -> usize {
        self.available.max(0) as usize
    }

    /// Spend `n` bytes. The caller checks `available()` first; spending past
    /// it is a local accounting bug, not peer misbehavior.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.available -= n as i64;
    }

    /// Credit from a WINDOW_UPDATE. Growing past 2^31-1 is the peer's
    /// FLOW_CONTROL_ERROR.
    pub fn grow(&mut self, increment: u32) -> Result<(), StreamError> {
        self.available += i64::from(increment);
        if self.available > i64::from(U31_MAX) {
            return Err(StreamError::FlowControl);
        }
        Ok(())
    }

    /// Shift by a SETTINGS_INITIAL_WINDOW_SIZE delta. May legally go
    /// negative; exceeding 2^31-1 is a connection error.
    pub fn adjust(&mut self, delta: i64) -> Result<(), ConnectionError> {
        self.available += delta;
        if self.available > i64::from(U31_MAX) {
            return Err(ConnectionError::FlowControl(
                "INITIAL_WINDOW_SIZE change overflows a stream window",
            ));
        }
        Ok(())
    }
}

/// Bytes the peer may still send us, plus the batching bookkeeping for
/// WINDOW_UPDATE emission.
#[derive(Debug, Clone, Copy)]
pub struct RecvWindow {
    initial: i32,
    available: i64,
    threshold: i32,
}

impl RecvWindow {
    #[must_use]
    pub fn new(initial: i32) -> Self {
        Self {
            initial,
            available: i64::from(initial),
            threshold: UPDATE_THRESHOLD_CAP.min(initial / 2),
        }
    }

    /// Account an inbound DATA payload of `n` bytes. Going negative means the
    /// peer overshot the window it was granted.
    pub fn consume(&mut self, n: usize) -> Result<(), StreamError> {
        self.available -= n as i64;
        if self.available < 0 {
            return Err(StreamError::FlowControl);
        }
        Ok(())
    }

    /// Batched restore: once consumption passes the threshold, hand back one
    /// increment that returns the window to its initial size.
    pub fn maybe_update(&mut self) -> Option<u32> {
        let consumed = i64::from(self.initial) - self.available;
        if consumed >= i64::from(self.threshold) && consumed > 0 {
            self.available = i64::from(self.initial);
            Some(consumed as u32)
        } else {
            None
        }
    }

    #[must_use]
    pub fn available(&self) -> i64 {
        self.available
    }
}

/// Detects peers spraying WINDOW_UPDATE frames faster than any sane sender
/// would.
#[derive(Debug)]
pub struct UpdateRateLimiter {
    window: Duration,
    max_updates: usize,
    times: VecDeque<Instant>,
}

impl UpdateRateLimiter {
    #[must_use]
    pub fn new(window: Duration, max_updates: usize) -> Self {
        Self {
            window,
            max_updates,
            times: VecDeque::with_capacity(max_updates + 1),
        }
    }

    /// Record one update at `now`; false means the peer crossed the line.
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(&front) = self.times.front() {
            if now.duration_since(front) > self.window {
                self.times.pop_front();
            } else {
                break;
            }
        }
        self.times.push_back(now);
        if self.times.len() > self.max_updates {
            warn!(
                "{} WINDOW_UPDATE frames within {:?}",
                self.times.len(),
                self.window
            );
            return false;
        }
        true
    }
}

impl Default for UpdateRateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(10), 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_window_accounting() {
        let mut window = SendWindow::new(DEFAULT_WINDOW_SIZE);
        assert_eq!(window.available(), 65_535);
        window.consume(65_535);
        assert_eq!(window.available(), 0);
        window.grow(1000).unwrap();
        assert_eq!(window.available(), 1000);
    }

    #[test]
    fn send_window_overflow() {
        let mut window = SendWindow::new(DEFAULT_WINDOW_SIZE);
        assert_eq!(
            window.grow(U31_MAX - 65_534),
            Err(StreamError::FlowControl)
        );
    }

    #[test]
    fn settings_delta_can_go_negative() {
        let mut window = SendWindow::new(DEFAULT_WINDOW_SIZE);
        window.consume(60_000);
        window.adjust(-65_535 + 1000).unwrap();
        assert_eq!(window.available(), 0);
        // credit brings it back above water
        window.grow(70_000).unwrap();
        assert!(window.available() > 0);
    }

    #[test]
    fn recv_window_violation() {
        let mut window = RecvWindow::new(100);
        window.consume(100).unwrap();
        assert_eq!(window.consume(1), Err(StreamError::FlowControl));
    }

    #[test]
    fn recv_window_batches_updates() {
        let mut window = RecvWindow::new(DEFAULT_WINDOW_SIZE);
        window.consume(1000).unwrap();
        assert_eq!(window.maybe_update(), None, "below threshold");

        window.consume(31_768).unwrap();
        assert_eq!(window.maybe_update(), Some(32_768));
        assert_eq!(window.available(), i64::from(DEFAULT_WINDOW_SIZE));
    }

    #[test]
    fn recv_window_ledger_matches_recomputation() {
        // local view == initial + increments - consumed, over a mixed history
        let initial = 50_000i64;
        let mut window = RecvWindow::new(initial as i32);
        let mut consumed_total = 0i64;
        let mut restored_total = 0i64;
        for chunk in [10_000usize, 20_000, 5_000, 12_000, 3_000] {
            window.consume(chunk).unwrap();
            consumed_total += chunk as i64;
            if let Some(increment) = window.maybe_update() {
                restored_total += i64::from(increment);
            }
        }
        assert_eq!(
            window.available(),
            initial - consumed_total + restored_total
        );
    }

    #[test]
    fn update_rate_limiter_trips() {
        let mut limiter = UpdateRateLimiter::new(Duration::from_millis(10), 3);
        let now = Instant::now();
        assert!(limiter.record(now));
        assert!(limiter.record(now));
        assert!(limiter.record(now));
        assert!(!limiter.record(now));
    }

    #[test]
    fn update_rate_limiter_forgets_old_updates() {
        let mut limiter = UpdateRateLimiter::new(Duration::from_millis(10), 2);
        let start = Instant::now();
        assert!(limiter.record(start));
        assert!(limiter.record(start));
        assert!(limiter.record(start + Duration::from_millis(50)));
    }
}
