//! TCP listen/dial.

use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use sluice_types::{DialOptions, ListenOptions, Listener, Pipe, Result, Status};

use crate::pipe::StreamPipe;

/// Listener for `tcp://` addresses.
pub struct TcpPipeListener {
    inner: TcpListener,
    closed: AtomicBool,
}

impl Listener for TcpPipeListener {
    fn accept(&self) -> Result<Box<dyn Pipe>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("listener closed"));
        }
        let (stream, peer) = self.inner.accept().map_err(|e| {
            if self.closed.load(Ordering::Acquire) {
                Status::closed("listener closed")
            } else {
                Status::io_error(format!("accept() failed: {e}"))
            }
        })?;
        let _ = stream.set_nodelay(true);
        tracing::debug!(peer = %peer, "tcp connection accepted");
        Ok(Box::new(StreamPipe::new(stream)))
    }

    fn local_address(&self) -> Result<String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("listener closed"));
        }
        let addr = self
            .inner
            .local_addr()
            .map_err(|e| Status::io_error(format!("getsockname() failed: {e}")))?;
        Ok(format!("tcp://{addr}"))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Unblock any accept sleeping in the kernel.
        // SAFETY: the descriptor stays open until the listener drops.
        unsafe { libc::shutdown(self.inner.as_raw_fd(), libc::SHUT_RDWR) };
    }
}

impl Drop for TcpPipeListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bind a TCP listener. An empty host binds loopback; port 0 asks the OS
/// for an ephemeral port (reported by `local_address`).
pub fn tcp_listen(host: &str, port: u16, opts: &ListenOptions) -> Result<TcpPipeListener> {
    let host = if host.is_empty() { "127.0.0.1" } else { host };
    let inner = TcpListener::bind((host, port))
        .map_err(|e| Status::io_error(format!("bind/listen failed for {host}:{port}: {e}")))?;

    if opts.backlog > 0 {
        // Re-arm listen to apply the requested backlog depth.
        // SAFETY: the descriptor is a live listening socket.
        unsafe { libc::listen(inner.as_raw_fd(), opts.backlog) };
    }

    Ok(TcpPipeListener {
        inner,
        closed: AtomicBool::new(false),
    })
}

/// Connect to a TCP peer. A non-zero dial timeout bounds each address
/// attempt; zero uses the OS connect timeout.
pub fn tcp_dial(host: &str, port: u16, opts: &DialOptions) -> Result<StreamPipe<TcpStream>> {
    let host = if host.is_empty() { "127.0.0.1" } else { host };

    let stream = if opts.timeout.is_zero() {
        TcpStream::connect((host, port))
            .map_err(|e| Status::io_error(format!("connect() failed for {host}:{port}: {e}")))?
    } else {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| Status::io_error(format!("address resolution failed for {host}: {e}")))?;
        let mut last_err = None;
        let mut connected = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, opts.timeout) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        connected.ok_or_else(|| match last_err {
            Some(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Status::timeout(format!("connect to {host}:{port} timed out"))
            }
            Some(e) => Status::io_error(format!("connect() failed for {host}:{port}: {e}")),
            None => Status::io_error(format!("no addresses resolved for {host}:{port}")),
        })?
    };

    let _ = stream.set_nodelay(true);
    if !opts.reconnect.heartbeat_interval.is_zero() {
        enable_keepalive(&stream, opts.reconnect.heartbeat_interval);
    }
    Ok(StreamPipe::new(stream))
}

/// Map the reconnect policy's heartbeat interval onto OS TCP keepalive.
fn enable_keepalive(stream: &TcpStream, interval: std::time::Duration) {
    let fd = stream.as_raw_fd();
    let one: libc::c_int = 1;
    // SAFETY: setsockopt reads `one` for the provided length.
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            (&one as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let secs = interval.as_secs().clamp(1, i32::MAX as u64) as libc::c_int;
        for opt in [libc::TCP_KEEPIDLE, libc::TCP_KEEPINTVL] {
            // SAFETY: setsockopt reads `secs` for the provided length.
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_TCP,
                    opt,
                    (&secs as *const libc::c_int).cast(),
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = interval;
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_types::{Message, RecvOptions, SendOptions};
    use std::time::Duration;

    #[test]
    fn ephemeral_port_is_reported() {
        let listener = tcp_listen("127.0.0.1", 0, &ListenOptions::default()).expect("listen");
        let addr = listener.local_address().expect("local_address");
        assert!(addr.starts_with("tcp://127.0.0.1:"));
        let port: u16 = addr.rsplit(':').next().unwrap().parse().expect("port");
        assert_ne!(port, 0);
    }

    #[test]
    fn dial_and_echo() {
        let listener = tcp_listen("127.0.0.1", 0, &ListenOptions::default()).expect("listen");
        let addr = listener.local_address().expect("addr");
        let port: u16 = addr.rsplit(':').next().unwrap().parse().expect("port");

        let server = std::thread::spawn(move || {
            let pipe = listener.accept().expect("accept");
            let msg = pipe.recv(&RecvOptions::default()).expect("recv");
            pipe.send(&msg, &SendOptions::default()).expect("echo");
        });

        let client = tcp_dial("127.0.0.1", port, &DialOptions::default()).expect("dial");
        client
            .send(&Message::from_string("over tcp"), &SendOptions::default())
            .expect("send");
        let got = client
            .recv(&RecvOptions::with_timeout(Duration::from_secs(5)))
            .expect("recv");
        assert_eq!(got.as_slice(), b"over tcp");
        server.join().expect("server");
    }

    #[test]
    fn closed_listener_rejects_accept() {
        let listener = tcp_listen("127.0.0.1", 0, &ListenOptions::default()).expect("listen");
        listener.close();
        let err = listener.accept().expect_err("closed");
        assert_eq!(err.code(), sluice_types::StatusCode::Closed);
    }
}
