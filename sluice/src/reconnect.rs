//! Reconnect supervisor: a pipe that owns a dialler closure and
//! transparently re-establishes the inner pipe across transport
//! failures.
//!
//! One worker thread drives the dial loop with exponential backoff and
//! jitter. Callers' `send`/`recv` wait for a live inner pipe, operate on
//! a snapshot taken under the lock (released before the blocking call),
//! and report disconnects back with a compare-and-clear so stale errors
//! from a replaced connection never fire a transition.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sluice_types::{
    ConnectionState, Message, Pipe, RecvOptions, ReconnectPolicy, Result, SendOptions,
    StateCallback, Status, StatusCode,
};

/// Factory invoked for every connection attempt.
pub type DialFn = Box<dyn Fn() -> Result<Box<dyn Pipe>> + Send + Sync>;

fn is_disconnect(st: &Status) -> bool {
    matches!(st.code(), StatusCode::Closed | StatusCode::IoError)
}

struct State {
    closed: bool,
    permanently_failed: bool,
    ever_connected: bool,
    conn_state: ConnectionState,
    last_error: String,
    inner: Option<Arc<dyn Pipe>>,
}

struct Supervisor {
    dial_once: DialFn,
    policy: ReconnectPolicy,
    on_state_change: Option<StateCallback>,
    state: Mutex<State>,
    cond: Condvar,
}

impl Supervisor {
    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn set_state(&self, next: ConnectionState, reason: &str) {
        {
            let mut state = self.state.lock();
            if state.conn_state == next {
                return;
            }
            state.conn_state = next;
        }
        tracing::debug!(state = %next, reason, "reconnect state change");
        if let Some(cb) = &self.on_state_change {
            cb(next, reason);
        }
    }

    fn snapshot(&self) -> Option<Arc<dyn Pipe>> {
        self.state.lock().inner.clone()
    }

    /// Wait until a pipe is installed, the supervisor closes, or failure
    /// is latched. The optional timeout bounds the wait.
    fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let pred =
            |s: &mut State| !s.closed && !s.permanently_failed && s.inner.is_none();
        if timeout.is_zero() {
            self.cond.wait_while(&mut state, pred);
        } else if self.cond.wait_while_for(&mut state, pred, timeout).timed_out() {
            return Err(Status::timeout("connect timed out"));
        }

        if state.closed {
            return Err(Status::closed("pipe closed"));
        }
        if state.permanently_failed {
            return Err(Status::io_error(format!(
                "reconnect attempts exhausted: {}",
                state.last_error
            )));
        }
        Ok(())
    }

    /// Clear the inner pipe after a disconnect-class error, but only if
    /// `which` is still the installed pipe.
    fn mark_disconnected(&self, which: &Arc<dyn Pipe>, reason: String) {
        let stale;
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            match &state.inner {
                Some(current) if Arc::ptr_eq(current, which) => {
                    stale = state.inner.take();
                    state.last_error = reason.clone();
                    self.cond.notify_all();
                }
                // A different (or no) pipe is installed: stale error.
                _ => return,
            }
        }
        self.set_state(ConnectionState::Disconnected, &reason);
        if let Some(pipe) = stale {
            pipe.close();
        }
    }

    fn worker_loop(&self) {
        loop {
            if self.is_closed() {
                return;
            }

            // While connected, sleep until the pipe is cleared or the
            // supervisor closes.
            {
                let mut state = self.state.lock();
                if state.inner.is_some() {
                    self.cond
                        .wait_while(&mut state, |s| !s.closed && s.inner.is_some());
                    continue;
                }
                if state.permanently_failed {
                    return;
                }
            }

            let (ever_connected, last_error) = {
                let state = self.state.lock();
                (state.ever_connected, state.last_error.clone())
            };
            let announce = if ever_connected {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            };
            let reason = if last_error.is_empty() {
                "connecting".to_string()
            } else {
                last_error
            };
            self.set_state(announce, &reason);

            if !self.dial_until_connected() {
                return;
            }
        }
    }

    /// Run one dial sequence. Returns false when the worker must exit
    /// (closed or permanently failed).
    fn dial_until_connected(&self) -> bool {
        let mut attempts: u32 = 0;
        let mut delay = self.policy.initial_delay;

        loop {
            if self.is_closed() {
                return false;
            }
            if self.policy.max_attempts != 0 && attempts >= self.policy.max_attempts {
                let last_error;
                {
                    let mut state = self.state.lock();
                    state.permanently_failed = true;
                    last_error = state.last_error.clone();
                    self.cond.notify_all();
                }
                tracing::warn!(attempts, "reconnect attempts exhausted");
                let reason = if last_error.is_empty() {
                    "reconnect attempts exhausted".to_string()
                } else {
                    last_error
                };
                self.set_state(ConnectionState::Disconnected, &reason);
                return false;
            }

            match (self.dial_once)() {
                Ok(pipe) => {
                    {
                        let mut state = self.state.lock();
                        if state.closed {
                            drop(state);
                            pipe.close();
                            return false;
                        }
                        state.inner = Some(Arc::from(pipe));
                        state.ever_connected = true;
                        state.last_error.clear();
                        self.cond.notify_all();
                    }
                    self.set_state(ConnectionState::Connected, "connected");
                    return true;
                }
                Err(st) => {
                    attempts += 1;
                    self.state.lock().last_error = st.to_string();
                    tracing::debug!(attempt = attempts, error = %st, "dial attempt failed");

                    // Backoff with jitter in [0, delay/2], interruptible
                    // by close.
                    let half_ms = delay.as_millis() as u64 / 2;
                    let jitter = if half_ms > 0 {
                        Duration::from_millis(rand::random_range(0..=half_ms))
                    } else {
                        Duration::ZERO
                    };
                    {
                        let mut state = self.state.lock();
                        self.cond.wait_while_for(
                            &mut state,
                            |s| !s.closed && s.inner.is_none(),
                            delay + jitter,
                        );
                    }
                    delay = next_delay(delay, &self.policy);
                }
            }
        }
    }
}

fn next_delay(delay: Duration, policy: &ReconnectPolicy) -> Duration {
    delay.mul_f64(policy.backoff_multiplier.max(0.0)).min(policy.max_delay)
}

/// Absolute deadline for a caller timeout; `None` blocks forever.
fn op_deadline(timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + timeout)
    }
}

/// Remaining wait before `deadline` (zero means unbounded), or
/// `Timeout` once it has passed. The operation's connect wait is
/// bounded by one deadline no matter how many reconnect rounds it
/// spans.
fn remaining_wait(deadline: Option<Instant>) -> Result<Duration> {
    match deadline {
        None => Ok(Duration::ZERO),
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                Err(Status::timeout("connect timed out"))
            } else {
                Ok(left)
            }
        }
    }
}

/// The reconnecting pipe handed to callers.
pub struct ReconnectPipe {
    sup: Arc<Supervisor>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ReconnectPipe {
    pub fn new(
        dial_once: DialFn,
        policy: ReconnectPolicy,
        on_state_change: Option<StateCallback>,
    ) -> Self {
        let sup = Arc::new(Supervisor {
            dial_once,
            policy,
            on_state_change,
            state: Mutex::new(State {
                closed: false,
                permanently_failed: false,
                ever_connected: false,
                conn_state: ConnectionState::Disconnected,
                last_error: String::new(),
                inner: None,
            }),
            cond: Condvar::new(),
        });

        sup.set_state(ConnectionState::Connecting, "initial connect");

        let worker = {
            let sup = Arc::clone(&sup);
            thread::Builder::new()
                .name("sluice-reconnect".to_string())
                .spawn(move || sup.worker_loop())
                .expect("spawn reconnect worker")
        };

        Self {
            sup,
            worker: Mutex::new(Some(worker)),
        }
    }
}

impl Pipe for ReconnectPipe {
    fn send(&self, msg: &Message, opts: &SendOptions) -> Result<()> {
        let deadline = op_deadline(opts.timeout);
        loop {
            self.sup.wait_connected(remaining_wait(deadline)?)?;
            let Some(inner) = self.sup.snapshot() else {
                continue;
            };

            match inner.send(msg, opts) {
                Ok(()) => return Ok(()),
                Err(st) if st.code() == StatusCode::Timeout => return Err(st),
                Err(st) if is_disconnect(&st) => {
                    self.sup
                        .mark_disconnected(&inner, format!("send: {}", st.message()));
                    continue;
                }
                Err(st) => return Err(st),
            }
        }
    }

    fn recv(&self, opts: &RecvOptions) -> Result<Message> {
        let deadline = op_deadline(opts.timeout);
        loop {
            self.sup.wait_connected(remaining_wait(deadline)?)?;
            let Some(inner) = self.sup.snapshot() else {
                continue;
            };

            match inner.recv(opts) {
                Ok(msg) => return Ok(msg),
                Err(st) if st.code() == StatusCode::Timeout => return Err(st),
                Err(st) if is_disconnect(&st) => {
                    self.sup
                        .mark_disconnected(&inner, format!("recv: {}", st.message()));
                    continue;
                }
                Err(st) => return Err(st),
            }
        }
    }

    fn close(&self) {
        let inner_to_close;
        {
            let mut state = self.sup.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            inner_to_close = state.inner.take();
            self.sup.cond.notify_all();
        }

        self.sup.set_state(ConnectionState::Closed, "closed");
        if let Some(pipe) = inner_to_close {
            pipe.close();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReconnectPipe {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Instant;

    /// An inner pipe whose failures are scripted per instance.
    struct FlakyPipe {
        fail_sends: AtomicBool,
        closed: AtomicBool,
    }

    impl FlakyPipe {
        fn healthy() -> Arc<Self> {
            Arc::new(Self {
                fail_sends: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl Pipe for FlakyPipe {
        fn send(&self, _msg: &Message, _opts: &SendOptions) -> Result<()> {
            if self.fail_sends.load(Ordering::Acquire) {
                return Err(Status::io_error("connection reset"));
            }
            Ok(())
        }

        fn recv(&self, _opts: &RecvOptions) -> Result<Message> {
            Ok(Message::from_string("pong"))
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    struct ArcPipe(Arc<FlakyPipe>);

    impl Pipe for ArcPipe {
        fn send(&self, msg: &Message, opts: &SendOptions) -> Result<()> {
            self.0.send(msg, opts)
        }
        fn recv(&self, opts: &RecvOptions) -> Result<Message> {
            self.0.recv(opts)
        }
        fn close(&self) {
            self.0.close();
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            max_attempts: 0,
            heartbeat_interval: Duration::ZERO,
        }
    }

    #[test]
    fn first_send_blocks_until_connected() {
        // The dialler fails twice, then succeeds.
        let attempts = Arc::new(AtomicU32::new(0));
        let dial: DialFn = {
            let attempts = Arc::clone(&attempts);
            Box::new(move || {
                let n = attempts.fetch_add(1, Ordering::AcqRel);
                if n < 2 {
                    Err(Status::io_error("listener not up yet"))
                } else {
                    Ok(Box::new(ArcPipe(FlakyPipe::healthy())) as Box<dyn Pipe>)
                }
            })
        };

        let events: Arc<PlMutex<Vec<ConnectionState>>> = Arc::new(PlMutex::new(Vec::new()));
        let callback: StateCallback = {
            let events = Arc::clone(&events);
            Arc::new(move |state, _reason| events.lock().push(state))
        };

        let pipe = ReconnectPipe::new(dial, fast_policy(), Some(callback));
        pipe.send(&Message::from_string("hello"), &SendOptions::default())
            .expect("delivered after the supervisor connects");
        assert!(attempts.load(Ordering::Acquire) >= 3);

        // Connecting first, Connected last; only reconnect states
        // in between.
        let seen = events.lock().clone();
        assert_eq!(seen.first(), Some(&ConnectionState::Connecting));
        assert_eq!(seen.last(), Some(&ConnectionState::Connected));
        for state in &seen[1..seen.len() - 1] {
            assert!(
                matches!(
                    state,
                    ConnectionState::Disconnected | ConnectionState::Reconnecting
                ),
                "unexpected intermediate state {state:?}"
            );
        }

        pipe.close();
    }

    #[test]
    fn disconnect_triggers_transparent_reconnect() {
        let current: Arc<PlMutex<Option<Arc<FlakyPipe>>>> = Arc::new(PlMutex::new(None));
        let dial: DialFn = {
            let current = Arc::clone(&current);
            Box::new(move || {
                let pipe = FlakyPipe::healthy();
                *current.lock() = Some(Arc::clone(&pipe));
                Ok(Box::new(ArcPipe(pipe)) as Box<dyn Pipe>)
            })
        };

        let pipe = ReconnectPipe::new(dial, fast_policy(), None);
        pipe.send(&Message::from_string("one"), &SendOptions::default())
            .expect("first send");

        let first = current.lock().clone().expect("first connection");
        first.fail_sends.store(true, Ordering::Release);

        // The failing send is retried on a fresh connection.
        pipe.send(&Message::from_string("two"), &SendOptions::default())
            .expect("resent after reconnect");
        let second = current.lock().clone().expect("second connection");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.closed.load(Ordering::Acquire));

        pipe.close();
    }

    #[test]
    fn attempts_exhausted_latches_permanent_failure() {
        let dial: DialFn = Box::new(|| Err(Status::io_error("nobody home")));
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..fast_policy()
        };
        let pipe = ReconnectPipe::new(dial, policy, None);

        let err = pipe
            .send(&Message::from_string("x"), &SendOptions::default())
            .expect_err("permanent failure");
        assert_eq!(err.code(), StatusCode::IoError);
        assert!(err.message().contains("exhausted"));
        pipe.close();
    }

    #[test]
    fn caller_timeout_bounds_the_connect_wait() {
        let dial: DialFn = Box::new(|| Err(Status::io_error("never connects")));
        let pipe = ReconnectPipe::new(dial, fast_policy(), None);

        let start = Instant::now();
        let err = pipe
            .send(
                &Message::from_string("x"),
                &SendOptions::with_timeout(Duration::from_millis(80)),
            )
            .expect_err("timeout");
        assert_eq!(err.code(), StatusCode::Timeout);
        assert!(start.elapsed() < Duration::from_secs(2));
        pipe.close();
    }

    #[test]
    fn flapping_connection_still_honours_the_caller_timeout() {
        // Every dial succeeds instantly, every operation disconnects:
        // the send loop keeps landing on a fresh pipe that fails.
        struct AlwaysFailing;

        impl Pipe for AlwaysFailing {
            fn send(&self, _msg: &Message, _opts: &SendOptions) -> Result<()> {
                Err(Status::io_error("connection reset"))
            }
            fn recv(&self, _opts: &RecvOptions) -> Result<Message> {
                Err(Status::io_error("connection reset"))
            }
            fn close(&self) {}
        }

        let dial: DialFn = Box::new(|| Ok(Box::new(AlwaysFailing) as Box<dyn Pipe>));
        let pipe = ReconnectPipe::new(dial, fast_policy(), None);

        let start = Instant::now();
        let err = pipe
            .send(
                &Message::from_string("x"),
                &SendOptions::with_timeout(Duration::from_millis(100)),
            )
            .expect_err("one deadline bounds the whole operation");
        assert_eq!(err.code(), StatusCode::Timeout);
        assert!(start.elapsed() < Duration::from_secs(5));
        pipe.close();
    }

    #[test]
    fn close_is_idempotent_and_emits_closed_once() {
        let events: Arc<PlMutex<Vec<ConnectionState>>> = Arc::new(PlMutex::new(Vec::new()));
        let callback: StateCallback = {
            let events = Arc::clone(&events);
            Arc::new(move |state, _| events.lock().push(state))
        };
        let dial: DialFn = Box::new(|| Ok(Box::new(ArcPipe(FlakyPipe::healthy())) as Box<dyn Pipe>));
        let pipe = ReconnectPipe::new(dial, fast_policy(), Some(callback));

        pipe.send(&Message::from_string("x"), &SendOptions::default())
            .expect("send");
        pipe.close();
        pipe.close();

        let closed_events = events
            .lock()
            .iter()
            .filter(|s| **s == ConnectionState::Closed)
            .count();
        assert_eq!(closed_events, 1);

        let err = pipe
            .recv(&RecvOptions::default())
            .expect_err("closed pipe");
        assert_eq!(err.code(), StatusCode::Closed);
    }

    #[test]
    fn stale_error_does_not_clear_a_new_pipe() {
        let dial: DialFn = Box::new(|| Ok(Box::new(ArcPipe(FlakyPipe::healthy())) as Box<dyn Pipe>));
        let pipe = ReconnectPipe::new(dial, fast_policy(), None);
        pipe.send(&Message::from_string("x"), &SendOptions::default())
            .expect("send");

        let old = pipe.sup.snapshot().expect("connected");

        // Report a disconnect for the current pipe: it is replaced.
        pipe.sup.mark_disconnected(&old, "recv: reset".to_string());
        pipe.send(&Message::from_string("y"), &SendOptions::default())
            .expect("reconnected");
        let fresh = pipe.sup.snapshot().expect("new pipe");
        assert!(!Arc::ptr_eq(&old, &fresh));

        // Reporting the same stale pipe again must not disturb the
        // fresh connection.
        pipe.sup.mark_disconnected(&old, "recv: late reset".to_string());
        assert!(Arc::ptr_eq(
            &fresh,
            &pipe.sup.snapshot().expect("still connected")
        ));
        pipe.close();
    }
}
