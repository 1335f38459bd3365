//! Shared data model for the sluice pipe stack.
//!
//! This crate holds everything the transports and wrappers agree on:
//! [`Message`] payloads, the [`Status`]/[`Result`] error pair, the
//! [`Pipe`]/[`Listener`] traits every transport implements, and the option
//! structs accepted by `listen`/`dial`/`send`/`recv`. It performs no I/O.

mod message;
mod options;
mod pipe;
mod status;

pub use message::Message;
pub use options::{
    BackpressurePolicy, ConnectionState, DialOptions, ListenOptions, QosOptions, RecvOptions,
    Reliability, ReconnectPolicy, SendOptions, StateCallback,
};
pub use pipe::{Listener, Pipe};
pub use status::{Result, Status, StatusCode};
