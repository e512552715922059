//! Stream state machine conformance against the full legal-transition table,
//! plus flow-control ledger properties.

use h2client::error::StreamError;
use h2client::flow_control::{RecvWindow, SendWindow};
use h2client::stream::{transition, Dir, Event, StreamState, TransitionError};
use h2client::types::U31_MAX;

use StreamState::*;

fn headers(end_stream: bool) -> Event {
    Event::Headers { end_stream }
}

fn data(end_stream: bool) -> Event {
    Event::Data { end_stream }
}

/// The legal-transition table, row by row.
#[test]
fn legal_transition_table() {
    let rows: &[(StreamState, Dir, Event, StreamState)] = &[
        (Idle, Dir::Send, headers(false), Open),
        (Idle, Dir::Send, headers(true), HalfClosedLocal),
        (Idle, Dir::Recv, headers(false), Open),
        (Idle, Dir::Recv, headers(true), HalfClosedRemote),
        (Open, Dir::Send, data(true), HalfClosedLocal),
        (Open, Dir::Recv, data(true), HalfClosedRemote),
        (Open, Dir::Send, data(false), Open),
        (Open, Dir::Recv, data(false), Open),
        (Open, Dir::Send, Event::Reset, Closed),
        (Open, Dir::Recv, Event::Reset, Closed),
        (HalfClosedLocal, Dir::Send, Event::Reset, Closed),
        (HalfClosedLocal, Dir::Recv, Event::Reset, Closed),
        (HalfClosedRemote, Dir::Send, Event::Reset, Closed),
        (HalfClosedRemote, Dir::Recv, Event::Reset, Closed),
        (HalfClosedLocal, Dir::Recv, data(true), Closed),
        (HalfClosedLocal, Dir::Recv, headers(true), Closed),
        (HalfClosedRemote, Dir::Send, data(true), Closed),
        (HalfClosedLocal, Dir::Recv, data(false), HalfClosedLocal),
        (HalfClosedRemote, Dir::Send, data(false), HalfClosedRemote),
    ];
    for &(from, dir, event, to) in rows {
        assert_eq!(
            transition(from, dir, event),
            Ok(to),
            "{from:?} --{dir:?} {event:?}--> {to:?}"
        );
    }
}

/// Everything outside the table errors, with the scope the table prescribes.
#[test]
fn illegal_events_have_the_right_scope() {
    // connection-fatal: events impossible for any live stream
    let connection_fatal: &[(StreamState, Dir, Event)] = &[
        (Idle, Dir::Recv, Event::Reset),
        (Idle, Dir::Send, Event::Reset),
        (Idle, Dir::Recv, data(false)),
        (Idle, Dir::Send, data(false)),
    ];
    for &(from, dir, event) in connection_fatal {
        assert!(
            matches!(
                transition(from, dir, event),
                Err(TransitionError::Connection(_))
            ),
            "{from:?}/{dir:?}/{event:?} must be connection-fatal"
        );
    }

    // stream-scoped: the stream is simply done
    let stream_scoped: &[(StreamState, Dir, Event)] = &[
        (Closed, Dir::Recv, data(false)),
        (Closed, Dir::Recv, headers(false)),
        (HalfClosedRemote, Dir::Recv, data(false)),
        (HalfClosedRemote, Dir::Recv, headers(true)),
    ];
    for &(from, dir, event) in stream_scoped {
        assert_eq!(
            transition(from, dir, event),
            Err(TransitionError::Stream(StreamError::Closed)),
            "{from:?}/{dir:?}/{event:?} must be stream-scoped"
        );
    }
}

/// Encoder and decoder replaying the same event sequence always agree.
#[test]
fn both_sides_replay_to_the_same_state() {
    let exchanges: &[&[(Dir, Event)]] = &[
        // GET without body
        &[
            (Dir::Send, headers(true)),
            (Dir::Recv, headers(false)),
            (Dir::Recv, data(true)),
        ],
        // POST with request and response bodies
        &[
            (Dir::Send, headers(false)),
            (Dir::Send, data(false)),
            (Dir::Send, data(true)),
            (Dir::Recv, headers(false)),
            (Dir::Recv, data(true)),
        ],
        // reset mid-flight
        &[
            (Dir::Send, headers(false)),
            (Dir::Recv, Event::Reset),
        ],
    ];
    for script in exchanges {
        let replay = || {
            let mut state = Idle;
            for &(dir, event) in *script {
                state = transition(state, dir, event).unwrap();
            }
            state
        };
        assert_eq!(replay(), replay());
        assert_eq!(replay(), Closed);
    }
}

/// After any in-range sequence of sends and grants, the window equals
/// initial + grants − sends.
#[test]
fn send_window_ledger() {
    let initial = 65_535i64;
    let mut window = SendWindow::new(initial as i32);
    let mut granted = 0i64;
    let mut sent = 0i64;

    let script: &[(i64, u32)] = &[
        (10_000, 0),
        (0, 5_000),
        (30_000, 0),
        (20_000, 40_000),
        (5_535, 0),
        (0, 100),
    ];
    for &(send, grant) in script {
        if send > 0 {
            assert!(send as usize <= window.available());
            window.consume(send as usize);
            sent += send;
        }
        if grant > 0 {
            window.grow(grant).unwrap();
            granted += i64::from(grant);
        }
    }
    assert_eq!(window.available() as i64, initial + granted - sent);
}

#[test]
fn send_window_never_grows_past_u31_max() {
    let mut window = SendWindow::new(0);
    window.grow(U31_MAX).unwrap();
    assert_eq!(window.grow(1), Err(StreamError::FlowControl));
}

#[test]
fn recv_window_update_restores_initial_exactly() {
    let mut window = RecvWindow::new(65_535);
    let mut consumed_since_update = 0i64;
    for chunk in [16_384usize, 16_384, 1_000, 16_384, 10_000] {
        window.consume(chunk).unwrap();
        consumed_since_update += chunk as i64;
        if let Some(increment) = window.maybe_update() {
            assert_eq!(i64::from(increment), consumed_since_update);
            assert_eq!(window.available(), 65_535);
            consumed_since_update = 0;
        }
    }
}

#[test]
fn recv_window_exhaustion_is_flow_control_error() {
    let mut window = RecvWindow::new(10);
    window.consume(10).unwrap();
    assert_eq!(window.consume(1), Err(StreamError::FlowControl));
}

/// A shrinking INITIAL_WINDOW_SIZE drives live windows negative without
/// tripping an error; only 2^31−1 overflow errors.
#[test]
fn settings_delta_bounds() {
    let mut window = SendWindow::new(65_535);
    window.consume(65_535);
    window.adjust(-65_535).unwrap();
    assert_eq!(window.available(), 0, "negative window spends nothing");

    window.grow(70_000).unwrap();
    assert!(window.available() > 0);

    let mut window = SendWindow::new(65_535);
    assert!(window.adjust(i64::from(U31_MAX)).is_err());
}
