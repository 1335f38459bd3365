//! Byte-stream transports: TCP for remote peers, unix-domain stream
//! sockets for same-host IPC.
//!
//! Both are thin adapters over the framing codec in `sluice-wire`: one
//! [`StreamPipe`] generic handles the pipe contract, and the per-scheme
//! modules only deal with connecting, listening, and socket options.

#![cfg(unix)]

mod pipe;
mod readiness;
mod tcp;
mod uds;

pub use pipe::{StreamPipe, StreamSocket};
pub use tcp::{TcpPipeListener, tcp_dial, tcp_listen};
pub use uds::{UdsListener, uds_dial, uds_listen};
