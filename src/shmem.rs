#![allow(unsafe_code)]
//! POSIX shared memory + a process-shared, robust, error-checking mutex.
//!
//! This is the one concrete primitive both the [`crate::endpoint`] regions
//! and the [`crate::pio::batch_server`] signal/control regions build on
//! (`SPEC_FULL.md` §2, component C0) — per the "cyclic object graph" design
//! note in `spec.md` §9, ownership flows strictly downward: a [`SharedRegion`]
//! owns its mapped bytes, the mutex lives inside the region's header, and
//! nothing holds a back-pointer to the region.
//!
//! This module uses `unsafe` for the FFI calls into `shm_open`/`mmap`/
//! `pthread_mutex_*`, mirroring the teacher crate's convention of scoping
//! `#[allow(unsafe_code)]` to individual modules that must cross into raw
//! OS primitives (e.g. its Unix-domain-socket `peek` implementation) while
//! the crate otherwise denies unsafe code by default.

use std::ffi::CString;
use std::mem::MaybeUninit;
use std::ptr;

use crate::error::{Error, Result};

/// A shared-memory region with a process-shared robust mutex guarding its
/// payload.
///
/// The region is laid out as `[pthread_mutex_t][payload bytes...]`. Callers
/// access the payload only through [`SharedRegion::with_lock`] /
/// [`SharedRegion::with_lock_mut`], which acquire the mutex for the
/// shortest window needed to copy the payload (`spec.md` §3's "no
/// user-visible API blocks while holding it longer than a bounded copy of
/// ≤ 4 KiB" invariant).
pub struct SharedRegion {
    name: String,
    ptr: *mut u8,
    total_len: usize,
    owner: bool,
}

// SAFETY: the region is backed by `mmap`'d memory shared across processes;
// access is always mediated by the internal mutex.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

const MUTEX_SIZE: usize = std::mem::size_of::<libc::pthread_mutex_t>();

impl SharedRegion {
    /// Creates a new shared-memory region named `name` (must start with
    /// `/`) holding `payload_len` bytes of payload, initializing the header
    /// mutex as process-shared, robust, and error-checking.
    ///
    /// Fails with [`crate::error::Kind::Runtime`] if a region of that name
    /// already exists.
    pub fn create(name: &str, payload_len: usize) -> Result<Self> {
        let total_len = MUTEX_SIZE + payload_len;
        let cname =
            CString::new(name).map_err(|_| Error::invalid("shm name contains a NUL byte"))?;

        // SAFETY: `cname` is a valid NUL-terminated C string for the
        // duration of this call; `shm_open` either returns a valid fd or
        // -1 with `errno` set, both handled below.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(Self::errno_error("shm_open (create)"));
        }

        // SAFETY: `fd` is a valid, just-opened descriptor.
        let truncated = unsafe { libc::ftruncate(fd, total_len as libc::off_t) };
        if truncated != 0 {
            let err = Self::errno_error("ftruncate");
            unsafe {
                libc::close(fd);
            }
            return Err(err);
        }

        let ptr = Self::map(fd, total_len)?;
        // SAFETY: `fd` is no longer needed once mapped.
        unsafe {
            libc::close(fd);
        }

        // SAFETY: `ptr` points to `total_len` freshly-zeroed (via
        // `ftruncate` on a new shm object) bytes we just mapped; the mutex
        // header occupies the first `MUTEX_SIZE` bytes.
        unsafe {
            Self::init_mutex(ptr.cast::<libc::pthread_mutex_t>())?;
        }

        Ok(Self {
            name: name.to_string(),
            ptr,
            total_len,
            owner: true,
        })
    }

    /// Attaches to an existing shared-memory region created by another
    /// process via [`SharedRegion::create`].
    pub fn attach(name: &str, payload_len: usize) -> Result<Self> {
        let total_len = MUTEX_SIZE + payload_len;
        let cname =
            CString::new(name).map_err(|_| Error::invalid("shm name contains a NUL byte"))?;

        // SAFETY: see `create`; here we open without `O_CREAT`.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(Self::errno_error("shm_open (attach)"));
        }

        let ptr = Self::map(fd, total_len)?;
        unsafe {
            libc::close(fd);
        }

        Ok(Self {
            name: name.to_string(),
            ptr,
            total_len,
            owner: false,
        })
    }

    fn map(fd: libc::c_int, total_len: usize) -> Result<*mut u8> {
        // SAFETY: `fd` refers to a shared-memory object at least
        // `total_len` bytes long (ensured by `create`'s `ftruncate`, or by
        // the original creator for `attach`).
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Self::errno_error("mmap"));
        }
        Ok(addr.cast::<u8>())
    }

    /// # Safety
    ///
    /// `mutex` must point to `MUTEX_SIZE` bytes of freshly allocated,
    /// exclusively-owned memory.
    unsafe fn init_mutex(mutex: *mut libc::pthread_mutex_t) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        unsafe {
            if libc::pthread_mutexattr_init(attr.as_mut_ptr()) != 0 {
                return Err(Error::runtime("pthread_mutexattr_init failed"));
            }
            let mut attr = attr.assume_init();
            libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_ERRORCHECK);
            libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
            let rc = libc::pthread_mutex_init(mutex, &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if rc != 0 {
                return Err(Error::runtime("pthread_mutex_init failed"));
            }
        }
        Ok(())
    }

    fn mutex_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.ptr.cast::<libc::pthread_mutex_t>()
    }

    /// Payload bytes, immediately after the mutex header.
    fn payload_ptr(&self) -> *mut u8 {
        // SAFETY: `self.ptr` was mapped with at least `MUTEX_SIZE` bytes
        // reserved for the header.
        unsafe { self.ptr.add(MUTEX_SIZE) }
    }

    /// Length of the payload region (total mapping minus the mutex header).
    #[must_use]
    pub const fn payload_len(&self) -> usize {
        self.total_len - MUTEX_SIZE
    }

    /// Acquires the mutex, runs `f` with read access to the payload, then
    /// releases it. If the previous owner died mid-critical-section
    /// (`EOWNERDEAD`), the mutex is made consistent and the region is
    /// treated as if freshly empty — it is the caller's responsibility to
    /// interpret all-zero/`count == 0` payload bytes as "not yet
    /// populated" per `spec.md` §3.
    pub fn with_lock<T>(&self, f: impl FnOnce(&[u8]) -> T) -> Result<T> {
        self.with_lock_mut(|buf| f(buf))
    }

    /// Like [`SharedRegion::with_lock`] but grants mutable access, for
    /// writers.
    pub fn with_lock_mut<T>(&self, f: impl FnOnce(&mut [u8]) -> T) -> Result<T> {
        self.lock()?;
        // SAFETY: `payload_ptr()` is valid for `payload_len()` bytes for
        // the lifetime of `self`, and the mutex we just acquired
        // serializes all other accessors.
        let slice = unsafe { std::slice::from_raw_parts_mut(self.payload_ptr(), self.payload_len()) };
        let result = f(slice);
        self.unlock()?;
        Ok(result)
    }

    fn lock(&self) -> Result<()> {
        // SAFETY: `mutex_ptr()` points at a mutex initialized by `create`
        // (or by the process that created this region, for `attach`).
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex_ptr()) };
        match rc {
            0 => Ok(()),
            libc::EOWNERDEAD => {
                // SAFETY: same mutex; making it consistent is required
                // before the next lock/unlock succeeds on a robust mutex.
                let made_consistent = unsafe { libc::pthread_mutex_consistent(self.mutex_ptr()) };
                if made_consistent != 0 {
                    return Err(Error::runtime("pthread_mutex_consistent failed"));
                }
                Ok(())
            }
            other => Err(Error::runtime(format!("pthread_mutex_lock failed: {other}"))),
        }
    }

    fn unlock(&self) -> Result<()> {
        // SAFETY: caller holds the lock (invariant of `with_lock_mut`).
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex_ptr()) };
        if rc != 0 {
            return Err(Error::runtime(format!("pthread_mutex_unlock failed: {rc}")));
        }
        Ok(())
    }

    fn errno_error(context: &str) -> Error {
        let errno = std::io::Error::last_os_error();
        let code = errno.raw_os_error().unwrap_or(0);
        Error::runtime(format!("{context}: {errno}")).with_errno(code)
    }

    /// Removes the shared-memory object's name from the filesystem. Only
    /// the owning (creating) side should call this, typically on process
    /// exit.
    pub fn unlink(&self) -> Result<()> {
        let cname =
            CString::new(self.name.as_str()).map_err(|_| Error::invalid("shm name had NUL"))?;
        // SAFETY: `cname` is a valid C string; failure just means the
        // object was already unlinked, which is fine to ignore.
        unsafe {
            libc::shm_unlink(cname.as_ptr());
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: `self.ptr`/`self.total_len` describe the active mapping;
        // nothing else holds a reference after `self` is dropped.
        unsafe {
            libc::munmap(self.ptr.cast(), self.total_len);
        }
        if self.owner {
            let _ = self.unlink();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/geopm-shmem-test-{tag}-{}", std::process::id())
    }

    #[test]
    fn create_then_attach_round_trips_payload() {
        let name = unique_name("roundtrip");
        let region = SharedRegion::create(&name, 64).unwrap();
        region
            .with_lock_mut(|buf| {
                buf[..5].copy_from_slice(b"hello");
            })
            .unwrap();

        let attached = SharedRegion::attach(&name, 64).unwrap();
        let copied = attached.with_lock(|buf| buf[..5].to_vec()).unwrap();
        assert_eq!(&copied, b"hello");
    }

    #[test]
    fn duplicate_create_fails() {
        let name = unique_name("dup");
        let _first = SharedRegion::create(&name, 16).unwrap();
        let second = SharedRegion::create(&name, 16);
        assert!(second.is_err());
    }

    #[test]
    fn payload_len_excludes_mutex_header() {
        let name = unique_name("len");
        let region = SharedRegion::create(&name, 128).unwrap();
        assert_eq!(region.payload_len(), 128);
    }
}
