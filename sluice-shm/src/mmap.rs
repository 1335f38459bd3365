//! POSIX shared-memory regions (`shm_open` + `mmap` with `MAP_SHARED`).

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use sluice_types::{Result, Status};

/// A mapped POSIX shared-memory object.
///
/// Created with `O_CREAT | O_EXCL` by the owning side and opened
/// read-write by the peer. The mapping stays valid until drop; unlinking
/// the name is a separate, explicit step so the unlink/unmap order is
/// controlled by the caller.
#[derive(Debug)]
pub struct ShmRegion {
    ptr: *mut u8,
    len: usize,
    name: String,
    // Kept open for the lifetime of the mapping.
    #[allow(dead_code)]
    fd: OwnedFd,
}

// SAFETY: the mapping is process-shared memory; synchronisation of its
// contents is the responsibility of the ring protocol built on top.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create a new shared-memory object of `len` bytes and map it.
    ///
    /// Fails with `IoError` if an object of the same name already exists
    /// (`O_EXCL`); callers treat a collision as a hard error rather than
    /// retrying. The region is zero-filled.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let c_name = shm_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let raw = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::c_uint,
            )
        };
        if raw < 0 {
            return Err(Status::io_error(format!(
                "shm_open(create) failed for {name}: {}",
                io::Error::last_os_error()
            )));
        }
        // SAFETY: raw is a freshly opened descriptor we own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: fd is a valid shm descriptor.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            Self::unlink(name);
            return Err(Status::io_error(format!("ftruncate({name}) failed: {err}")));
        }

        let ptr = match map(&fd, len) {
            Ok(ptr) => ptr,
            Err(st) => {
                Self::unlink(name);
                return Err(st);
            }
        };

        // ftruncate zero-fills, but make initialisation explicit.
        // SAFETY: ptr maps len writable bytes.
        unsafe { std::ptr::write_bytes(ptr, 0, len) };

        tracing::debug!(name, len, "shm region created");
        Ok(Self {
            ptr,
            len,
            name: name.to_string(),
            fd,
        })
    }

    /// Open and map an existing shared-memory object of `len` bytes.
    pub fn open(name: &str, len: usize) -> Result<Self> {
        let c_name = shm_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let raw = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o600 as libc::c_uint) };
        if raw < 0 {
            return Err(Status::io_error(format!(
                "shm_open failed for {name}: {}",
                io::Error::last_os_error()
            )));
        }
        // SAFETY: raw is a freshly opened descriptor we own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let ptr = map(&fd, len)?;

        Ok(Self {
            ptr,
            len,
            name: name.to_string(),
            fd,
        })
    }

    /// Remove the name from the system (best effort). Existing mappings
    /// stay valid until unmapped.
    pub fn unlink(name: &str) {
        if let Ok(c_name) = shm_name(name) {
            // SAFETY: c_name is a valid NUL-terminated string.
            let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
            if rc != 0 {
                tracing::debug!(
                    name,
                    error = %io::Error::last_os_error(),
                    "shm_unlink failed"
                );
            }
        }
    }

    /// Base pointer of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Mapping length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true for a zero-length mapping (never constructed here).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The `shm_open` name backing this region.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in new/open.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

fn map(fd: &OwnedFd, len: usize) -> Result<*mut u8> {
    // SAFETY: fd is a valid descriptor and len is the object size.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Status::io_error(format!(
            "mmap failed: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(ptr.cast())
}

fn shm_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Status::invalid_argument("shm name contains NUL"))
}
