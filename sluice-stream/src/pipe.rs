//! The shared pipe adapter over any framed byte stream.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

use sluice_types::{Message, Pipe, RecvOptions, Result, SendOptions, Status};

use crate::readiness::{wait_readable, wait_writable};

/// A connected stream socket usable behind [`StreamPipe`].
pub trait StreamSocket: AsRawFd + Send + Sync {
    /// Shut down both directions so blocked peers and local reads
    /// observe end-of-stream.
    fn shutdown_both(&self) -> std::io::Result<()>;
}

impl StreamSocket for TcpStream {
    fn shutdown_both(&self) -> std::io::Result<()> {
        self.shutdown(std::net::Shutdown::Both)
    }
}

impl StreamSocket for UnixStream {
    fn shutdown_both(&self) -> std::io::Result<()> {
        self.shutdown(std::net::Shutdown::Both)
    }
}

/// A pipe over an open bidirectional byte stream.
///
/// `send` and `recv` delegate framing to `sluice-wire`; an optional
/// per-call timeout waits for socket readiness before the blocking I/O.
pub struct StreamPipe<S> {
    stream: S,
    closed: AtomicBool,
}

impl<S> StreamPipe<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            closed: AtomicBool::new(false),
        }
    }
}

impl<S> Pipe for StreamPipe<S>
where
    S: StreamSocket,
    for<'a> &'a S: Read + Write,
{
    fn send(&self, msg: &Message, opts: &SendOptions) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        if !opts.timeout.is_zero() {
            wait_writable(self.stream.as_raw_fd(), opts.timeout)?;
        }
        sluice_wire::write_frame(&mut &self.stream, msg, 0)
    }

    fn recv(&self, opts: &RecvOptions) -> Result<Message> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        if !opts.timeout.is_zero() {
            wait_readable(self.stream.as_raw_fd(), opts.timeout)?;
        }
        sluice_wire::read_frame(&mut &self.stream)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stream.shutdown_both();
    }
}

impl<S> Drop for StreamPipe<S> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn pair() -> (StreamPipe<UnixStream>, StreamPipe<UnixStream>) {
        let (a, b) = UnixStream::pair().expect("socketpair");
        (StreamPipe::new(a), StreamPipe::new(b))
    }

    #[test]
    fn frames_roundtrip_in_order() {
        let (a, b) = pair();
        let writer = std::thread::spawn(move || {
            a.send(&Message::from_string("one"), &SendOptions::default())
                .expect("send one");
            a.send(&Message::from_string("two"), &SendOptions::default())
                .expect("send two");
            let big = Message::from_vec(vec![b'x'; sluice_wire::MAX_FRAME_PAYLOAD]);
            a.send(&big, &SendOptions::default()).expect("send big");
            a.close();
        });

        let r1 = b.recv(&RecvOptions::default()).expect("recv one");
        assert_eq!(r1.as_slice(), b"one");
        assert_eq!(r1.len(), 3);
        let r2 = b.recv(&RecvOptions::default()).expect("recv two");
        assert_eq!(r2.as_slice(), b"two");
        assert_eq!(r2.len(), 3);
        let r3 = b.recv(&RecvOptions::default()).expect("recv big");
        assert_eq!(r3.len(), sluice_wire::MAX_FRAME_PAYLOAD);
        assert!(r3.as_slice().iter().all(|&c| c == b'x'));

        let err = b.recv(&RecvOptions::default()).expect_err("eof");
        assert_eq!(err.code(), sluice_types::StatusCode::Closed);
        writer.join().expect("writer");
    }

    #[test]
    fn zero_length_roundtrip() {
        let (a, b) = pair();
        a.send(&Message::new(), &SendOptions::default())
            .expect("send");
        let got = b.recv(&RecvOptions::default()).expect("recv");
        assert!(got.is_empty());
    }

    #[test]
    fn recv_timeout_on_idle_stream() {
        let (_a, b) = pair();
        let err = b
            .recv(&RecvOptions::with_timeout(Duration::from_millis(40)))
            .expect_err("idle");
        assert_eq!(err.code(), sluice_types::StatusCode::Timeout);
    }

    #[test]
    fn close_unblocks_peer_and_is_idempotent() {
        let (a, b) = pair();
        let b = Arc::new(b);
        let waiter = {
            let b = Arc::clone(&b);
            std::thread::spawn(move || b.recv(&RecvOptions::default()))
        };
        std::thread::sleep(Duration::from_millis(30));
        a.close();
        a.close();

        let err = waiter.join().expect("join").expect_err("peer closed");
        assert_eq!(err.code(), sluice_types::StatusCode::Closed);

        let err = a
            .send(&Message::from_string("x"), &SendOptions::default())
            .expect_err("closed locally");
        assert_eq!(err.code(), sluice_types::StatusCode::Closed);
    }
}
