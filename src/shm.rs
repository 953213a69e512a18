// src/shm.rs

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;

/// A shared memory segment holding one or more packets.
///
/// Both processes map the same file; each mapping is unmapped when its
/// `SharedMemory` is dropped.
#[derive(Debug)]
pub struct SharedMemory {
    ptr: NonNull<u8>,
    len: usize,
    fd: OwnedFd,
}

// Safety: the mapping is plain shared memory; all cross-thread access to the
// connection state goes through atomics.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create a new anonymous shared memory segment of `size` bytes.
    ///
    /// On Linux, uses memfd_create.
    /// Elsewhere, uses shm_open with a unique name, then shm_unlink.
    pub fn create(name: &str, size: usize) -> io::Result<Self> {
        let fd = Self::create_fd(name)?;

        let result = unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        let shm = Self::map(fd, size)?;
        tracing::debug!(name, size, fd = shm.as_raw_fd(), "created shared memory segment");
        Ok(shm)
    }

    /// Map an existing shared memory segment received from the peer.
    pub fn from_fd(fd: OwnedFd, size: usize) -> io::Result<Self> {
        let shm = Self::map(fd, size)?;
        tracing::debug!(size, fd = shm.as_raw_fd(), "mapped shared memory segment");
        Ok(shm)
    }

    fn map(fd: OwnedFd, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty segment",
            ));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

        Ok(SharedMemory { ptr, len: size, fd })
    }

    #[cfg(target_os = "linux")]
    fn create_fd(name: &str) -> io::Result<OwnedFd> {
        let c_name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid name"))?;

        let fd = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    #[cfg(not(target_os = "linux"))]
    fn create_fd(name: &str) -> io::Result<OwnedFd> {
        use std::sync::atomic::{AtomicU64, Ordering};

        static NEXT_ID: AtomicU64 = AtomicU64::new(0);

        // shm_open names must be unique per process and short on macOS.
        let unique_name = format!(
            "/handoff-{}-{}-{}",
            std::process::id(),
            NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name
        );
        let c_name = CString::new(unique_name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid name"))?;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o600,
            )
        };

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // Immediately unlink so it's anonymous
        unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }

        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Get a pointer to the start of the shared memory.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Get the length of the shared memory region.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the file descriptor (for passing to the peer process).
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Duplicate the file descriptor, e.g. to hand it to a child process.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        let new_fd = unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
        if new_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}
