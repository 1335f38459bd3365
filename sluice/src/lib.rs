//! sluice: one pipe abstraction over three latency-minded transports.
//!
//! A [`Pipe`] is a bidirectional, ordered, message-oriented channel.
//! [`listen`] and [`dial`] route a scheme-qualified address to the
//! matching transport:
//!
//! - `shm://NAME`: shared-memory rings for co-located processes
//! - `uds://PATH`: unix-domain stream sockets for same-host IPC
//! - `tcp://HOST:PORT`: TCP for remote peers
//!
//! On top of the raw transport, `dial` composes two optional wrappers:
//! a QoS layer (bounded send queue with backpressure policies and
//! per-message TTL) and a reconnect supervisor (exponential backoff with
//! jitter, observable connection state, transparent re-issue of
//! operations across reconnects).
//!
//! ```no_run
//! use sluice::{DialOptions, ListenOptions, Message, RecvOptions, SendOptions};
//!
//! let listener = sluice::listen("shm://gamebus", &ListenOptions::default())?;
//! std::thread::spawn(move || {
//!     let pipe = listener.accept().expect("accept");
//!     let msg = pipe.recv(&RecvOptions::default()).expect("recv");
//!     pipe.send(&msg, &SendOptions::default()).expect("echo");
//! });
//!
//! let pipe = sluice::dial("shm://gamebus", &DialOptions::default())?;
//! pipe.send(&Message::from_string("hello"), &SendOptions::default())?;
//! let echoed = pipe.recv(&RecvOptions::default())?;
//! assert_eq!(echoed.as_slice(), b"hello");
//! # Ok::<(), sluice::Status>(())
//! ```

mod address;
mod callback;
mod qos;
mod queue;
mod reconnect;

pub use address::Address;
pub use callback::StateCallbackPipe;
pub use qos::QosPipe;
pub use queue::MessageQueue;
pub use reconnect::{DialFn, ReconnectPipe};

pub use sluice_types::{
    BackpressurePolicy, ConnectionState, DialOptions, ListenOptions, Listener, Message, Pipe,
    QosOptions, RecvOptions, Reliability, ReconnectPolicy, Result, SendOptions, StateCallback,
    Status, StatusCode,
};

/// Wire-level constants and the framing codec, for tooling and tests.
pub use sluice_wire as wire;

/// Remove a shared-memory bus's stale bootstrap socket (crash
/// recovery).
pub use sluice_shm::cleanup_bus;

use std::time::Duration;

/// Dial timeout substituted when a reconnect-enabled dial passes zero,
/// so the supervisor worker never blocks in `connect` past a `close`.
const RECONNECT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind a listener for `address`.
pub fn listen(address: &str, opts: &ListenOptions) -> Result<Box<dyn Listener>> {
    match Address::parse(address)? {
        Address::Tcp { host, port } => {
            Ok(Box::new(sluice_stream::tcp_listen(&host, port, opts)?))
        }
        Address::Uds { path } => Ok(Box::new(sluice_stream::uds_listen(&path, opts)?)),
        Address::Shm { name } => Ok(Box::new(sluice_shm::shm_listen(&name, opts)?)),
        Address::Pipe { .. } => Err(Status::not_supported(
            "pipe:// is for hosts without unix sockets; use uds:// here",
        )),
    }
}

/// Connect to `address`, composing wrappers per `opts`:
/// raw transport → QoS (if enabled) → reconnect supervisor (if
/// enabled) → state-callback observer (callback without reconnect).
pub fn dial(address: &str, opts: &DialOptions) -> Result<Box<dyn Pipe>> {
    let addr = Address::parse(address)?;

    // Reserved features are refused, never silently accepted.
    if opts.qos.reliability == Reliability::AtLeastOnce {
        return Err(Status::not_supported(
            "at-least-once delivery is reserved and not implemented",
        ));
    }

    if opts.reconnect.enabled {
        let mut inner_opts = opts.clone();
        inner_opts.reconnect.enabled = false;
        inner_opts.on_state_change = None;
        if inner_opts.timeout.is_zero() {
            inner_opts.timeout = RECONNECT_DIAL_TIMEOUT;
        }

        let dial_once: DialFn = Box::new(move || {
            let pipe = dial_raw(&addr, &inner_opts)?;
            Ok(apply_qos(pipe, &inner_opts.qos))
        });
        return Ok(Box::new(ReconnectPipe::new(
            dial_once,
            opts.reconnect.clone(),
            opts.on_state_change.clone(),
        )));
    }

    let pipe = dial_raw(&addr, opts)?;
    let pipe = apply_qos(pipe, &opts.qos);
    match &opts.on_state_change {
        Some(cb) => Ok(Box::new(StateCallbackPipe::new(pipe, cb.clone()))),
        None => Ok(pipe),
    }
}

fn dial_raw(addr: &Address, opts: &DialOptions) -> Result<Box<dyn Pipe>> {
    match addr {
        Address::Tcp { host, port } => {
            Ok(Box::new(sluice_stream::tcp_dial(host, *port, opts)?))
        }
        Address::Uds { path } => Ok(Box::new(sluice_stream::uds_dial(path, opts)?)),
        Address::Shm { name } => Ok(Box::new(sluice_shm::shm_dial(name, opts)?)),
        Address::Pipe { .. } => Err(Status::not_supported(
            "pipe:// is for hosts without unix sockets; use uds:// here",
        )),
    }
}

fn apply_qos(pipe: Box<dyn Pipe>, qos: &QosOptions) -> Box<dyn Pipe> {
    if qos.is_enabled() {
        Box::new(QosPipe::new(pipe, qos.clone()))
    } else {
        pipe
    }
}
