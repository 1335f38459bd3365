//! Named POSIX counting semaphores.
//!
//! Counting semaphores are mandatory for the ring protocol: an auto-reset
//! event primitive would degrade ring capacity to one and lose items
//! under bursts. Hosts without `sem_timedwait` (macOS) fall back to a
//! try-wait/nanosleep loop bounded by a monotonic deadline.

use std::ffi::CString;
use std::io;
use std::time::Duration;

use sluice_types::{Result, Status};

/// A named, cross-process counting semaphore.
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
}

// SAFETY: sem_t operations are async-signal/thread-safe per POSIX; the
// handle itself is only closed on drop, which requires exclusive access.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create a new semaphore with the given initial count.
    ///
    /// Fails with `IoError` if the name already exists (`O_EXCL`).
    pub fn create(name: &str, initial: u32) -> Result<Self> {
        let c_name = sem_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string; mode and value
        // follow the variadic sem_open(O_CREAT) contract.
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(Status::io_error(format!(
                "sem_open(create) failed for {name}: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(Self {
            sem,
            name: name.to_string(),
        })
    }

    /// Open an existing named semaphore.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = sem_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(Status::io_error(format!(
                "sem_open failed for {name}: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(Self {
            sem,
            name: name.to_string(),
        })
    }

    /// Increment the count, waking one waiter if any.
    pub fn post(&self) -> Result<()> {
        // SAFETY: self.sem is a live semaphore handle.
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(Status::io_error(format!(
                "sem_post failed for {}: {}",
                self.name,
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Decrement the count, blocking until it is positive.
    ///
    /// A zero `timeout` blocks forever. Returns `Timeout` when the bound
    /// elapses. Interrupted waits retry transparently.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            loop {
                // SAFETY: self.sem is a live semaphore handle.
                if unsafe { libc::sem_wait(self.sem) } == 0 {
                    return Ok(());
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(Status::io_error(format!(
                    "sem_wait failed for {}: {err}",
                    self.name
                )));
            }
        }
        self.wait_timed(timeout)
    }

    /// Decrement the count without blocking. Returns `Ok(true)` on
    /// success, `Ok(false)` if the count was zero.
    pub fn try_wait(&self) -> Result<bool> {
        loop {
            // SAFETY: self.sem is a live semaphore handle.
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(false),
                _ => {
                    return Err(Status::io_error(format!(
                        "sem_trywait failed for {}: {err}",
                        self.name
                    )));
                }
            }
        }
    }

    #[cfg(not(target_os = "macos"))]
    fn wait_timed(&self, timeout: Duration) -> Result<()> {
        let deadline = realtime_deadline(timeout);
        loop {
            // SAFETY: self.sem is live; deadline is a valid timespec.
            if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => {
                    return Err(Status::timeout("semaphore wait timed out"));
                }
                _ => {
                    return Err(Status::io_error(format!(
                        "sem_timedwait failed for {}: {err}",
                        self.name
                    )));
                }
            }
        }
    }

    // macOS never gained sem_timedwait; poll with a short nanosleep
    // bounded by a monotonic deadline instead.
    #[cfg(target_os = "macos")]
    fn wait_timed(&self, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.try_wait()? {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(Status::timeout("semaphore wait timed out"));
            }
            let nap = libc::timespec {
                tv_sec: 0,
                tv_nsec: 1_000_000, // 1ms
            };
            // SAFETY: nap is a valid timespec.
            unsafe { libc::nanosleep(&nap, std::ptr::null_mut()) };
        }
    }

    /// Remove the name from the system (best effort). Open handles stay
    /// usable until closed.
    pub fn unlink(name: &str) {
        if let Ok(c_name) = sem_name(name) {
            // SAFETY: c_name is a valid NUL-terminated string.
            unsafe { libc::sem_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: self.sem is a live semaphore handle, closed exactly once.
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

fn sem_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Status::invalid_argument("semaphore name contains NUL"))
}

#[cfg(not(target_os = "macos"))]
fn realtime_deadline(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: now is a valid out-pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}
