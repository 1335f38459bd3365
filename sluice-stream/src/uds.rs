//! Unix-domain stream socket listen/dial.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sluice_types::{DialOptions, ListenOptions, Listener, Pipe, Result, Status};

use crate::pipe::StreamPipe;
use crate::readiness::wait_writable;

/// Listener for `uds://` addresses. Unlinks its socket path on close.
#[derive(Debug)]
pub struct UdsListener {
    inner: UnixListener,
    path: PathBuf,
    closed: AtomicBool,
}

impl Listener for UdsListener {
    fn accept(&self) -> Result<Box<dyn Pipe>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("listener closed"));
        }
        let (stream, _) = self.inner.accept().map_err(|e| {
            if self.closed.load(Ordering::Acquire) {
                Status::closed("listener closed")
            } else {
                Status::io_error(format!("accept() failed: {e}"))
            }
        })?;
        Ok(Box::new(StreamPipe::new(stream)))
    }

    fn local_address(&self) -> Result<String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("listener closed"));
        }
        Ok(format!("uds://{}", self.path.display()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Unblock any accept sleeping in the kernel, then free the path
        // for the next bind.
        // SAFETY: the descriptor stays open until the listener drops.
        unsafe { libc::shutdown(self.inner.as_raw_fd(), libc::SHUT_RDWR) };
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for UdsListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bind a unix-domain listener at `path`, replacing any stale socket
/// file.
pub fn uds_listen(path: &Path, opts: &ListenOptions) -> Result<UdsListener> {
    check_path_len(path)?;

    // Remove a stale socket from a previous run; a live listener would
    // have to be closed first anyway.
    let _ = fs::remove_file(path);

    let inner = UnixListener::bind(path)
        .map_err(|e| Status::io_error(format!("bind failed for {}: {e}", path.display())))?;

    if opts.backlog > 0 {
        // Re-arm listen to apply the requested backlog depth.
        // SAFETY: the descriptor is a live listening socket.
        unsafe { libc::listen(inner.as_raw_fd(), opts.backlog) };
    }

    Ok(UdsListener {
        inner,
        path: path.to_path_buf(),
        closed: AtomicBool::new(false),
    })
}

/// Connect to a unix-domain listener at `path`. A non-zero dial timeout
/// uses a non-blocking connect bounded by a writability wait.
pub fn uds_dial(path: &Path, opts: &DialOptions) -> Result<StreamPipe<UnixStream>> {
    check_path_len(path)?;

    let stream = if opts.timeout.is_zero() {
        UnixStream::connect(path)
            .map_err(|e| Status::io_error(format!("connect failed for {}: {e}", path.display())))?
    } else {
        connect_with_timeout(path, opts.timeout)?
    };
    Ok(StreamPipe::new(stream))
}

fn check_path_len(path: &Path) -> Result<()> {
    // sun_path must hold the path plus a trailing NUL.
    let max = {
        let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        addr.sun_path.len()
    };
    if path.as_os_str().as_bytes().len() >= max {
        return Err(Status::invalid_argument(format!(
            "uds path too long ({} bytes, limit {})",
            path.as_os_str().as_bytes().len(),
            max - 1
        )));
    }
    Ok(())
}

/// Non-blocking connect, then wait for writability and check SO_ERROR.
fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<UnixStream> {
    // SAFETY: plain socket creation.
    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(Status::io_error(format!(
            "socket(AF_UNIX) failed: {}",
            io::Error::last_os_error()
        )));
    }
    // SAFETY: raw is a freshly created descriptor we own.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    set_nonblocking(&fd, true)?;

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    for (dst, &src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = src as libc::c_char;
    }

    // SAFETY: addr is a fully initialised sockaddr_un.
    let rc = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(Status::io_error(format!(
                "connect failed for {}: {err}",
                path.display()
            )));
        }
        wait_writable(fd.as_raw_fd(), timeout)?;

        let mut so_error: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: so_error/len are valid out-pointers.
        let rc = unsafe {
            libc::getsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut so_error as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 || so_error != 0 {
            return Err(Status::io_error(format!(
                "connect failed for {}: {}",
                path.display(),
                io::Error::from_raw_os_error(if rc != 0 {
                    io::Error::last_os_error().raw_os_error().unwrap_or(0)
                } else {
                    so_error
                })
            )));
        }
    }

    set_nonblocking(&fd, false)?;
    Ok(UnixStream::from(fd))
}

fn set_nonblocking(fd: &OwnedFd, nonblocking: bool) -> Result<()> {
    // SAFETY: fd is a live descriptor.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(Status::io_error(format!(
            "fcntl(F_GETFL) failed: {}",
            io::Error::last_os_error()
        )));
    }
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    // SAFETY: fd is a live descriptor.
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags) } < 0 {
        return Err(Status::io_error(format!(
            "fcntl(F_SETFL) failed: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_types::{Message, RecvOptions, SendOptions};

    #[test]
    fn listen_dial_echo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("echo.sock");

        let listener = uds_listen(&path, &ListenOptions::default()).expect("listen");
        assert_eq!(
            listener.local_address().expect("addr"),
            format!("uds://{}", path.display())
        );

        let server = std::thread::spawn(move || {
            let pipe = listener.accept().expect("accept");
            let msg = pipe.recv(&RecvOptions::default()).expect("recv");
            pipe.send(&msg, &SendOptions::default()).expect("echo");
        });

        let client = uds_dial(&path, &DialOptions::default()).expect("dial");
        client
            .send(&Message::from_string("over uds"), &SendOptions::default())
            .expect("send");
        let got = client.recv(&RecvOptions::default()).expect("recv");
        assert_eq!(got.as_slice(), b"over uds");
        server.join().expect("server");
    }

    #[test]
    fn dial_with_timeout_connects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("timed.sock");
        let listener = uds_listen(&path, &ListenOptions::default()).expect("listen");

        let opts = DialOptions {
            timeout: Duration::from_millis(500),
            ..DialOptions::default()
        };
        let _client = uds_dial(&path, &opts).expect("dial");
        drop(listener);
    }

    #[test]
    fn overlong_path_is_invalid_argument() {
        let long = PathBuf::from(format!("/tmp/{}", "x".repeat(200)));
        let err = uds_listen(&long, &ListenOptions::default()).expect_err("too long");
        assert_eq!(err.code(), sluice_types::StatusCode::InvalidArgument);
    }

    #[test]
    fn close_unlinks_socket_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("unlink.sock");
        let listener = uds_listen(&path, &ListenOptions::default()).expect("listen");
        assert!(path.exists());
        listener.close();
        assert!(!path.exists());
    }
}
