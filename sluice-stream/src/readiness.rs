//! Readiness waits for per-call stream timeouts.

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use sluice_types::{Result, Status};

pub(crate) fn wait_readable(fd: RawFd, timeout: Duration) -> Result<()> {
    wait_ready(fd, libc::POLLIN, timeout, "readable")
}

pub(crate) fn wait_writable(fd: RawFd, timeout: Duration) -> Result<()> {
    wait_ready(fd, libc::POLLOUT, timeout, "writable")
}

fn wait_ready(fd: RawFd, events: libc::c_short, timeout: Duration, what: &str) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Status::timeout(format!("socket not {what} in time")));
        }

        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let millis = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;
        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc > 0 {
            // Error/hangup conditions are surfaced by the I/O call itself.
            return Ok(());
        }
        if rc == 0 {
            return Err(Status::timeout(format!("socket not {what} in time")));
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(Status::io_error(format!("poll() failed: {err}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn unready_socket_times_out() {
        let (a, _b) = UnixStream::pair().expect("pair");
        let err = wait_readable(a.as_raw_fd(), Duration::from_millis(30)).expect_err("no data");
        assert_eq!(err.code(), sluice_types::StatusCode::Timeout);
    }

    #[test]
    fn ready_socket_returns_immediately() {
        use std::io::Write;
        let (a, mut b) = UnixStream::pair().expect("pair");
        b.write_all(b"wake").expect("write");
        wait_readable(a.as_raw_fd(), Duration::from_millis(500)).expect("readable");
    }
}
