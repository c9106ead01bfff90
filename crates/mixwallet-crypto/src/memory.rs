//! Memory hardening for seed and private-key material.
//!
//! Two best-effort measures, both failures logged (not panicking) since
//! some environments (containers, unprivileged users) forbid them:
//!
//! 1. Core dump prevention via `setrlimit(RLIMIT_CORE, 0)`.
//! 2. Memory locking via `mlock`/`munlock` so swap never sees key material.

use std::sync::atomic::{AtomicBool, Ordering};

static CORE_DUMPS_DISABLED: AtomicBool = AtomicBool::new(false);

/// Disable core dumps for the current process. Idempotent.
pub fn disable_core_dumps() -> bool {
    if CORE_DUMPS_DISABLED.swap(true, Ordering::SeqCst) {
        return true;
    }

    #[cfg(unix)]
    {
        unix::disable_core_dumps_impl()
    }

    #[cfg(not(unix))]
    {
        false
    }
}

/// Lock a memory region so the OS will not swap it to disk.
///
/// # Safety
/// `ptr` must point to a valid allocation of at least `len` bytes that
/// outlives the lock, and the caller must `munlock` it (or let the
/// process exit) before freeing.
pub unsafe fn mlock(ptr: *const u8, len: usize) -> bool {
    if len == 0 {
        return true;
    }
    #[cfg(unix)]
    {
        unix::mlock_impl(ptr, len)
    }
    #[cfg(not(unix))]
    {
        let _ = (ptr, len);
        false
    }
}

/// # Safety
/// `ptr`/`len` must match a prior successful `mlock` call.
pub unsafe fn munlock(ptr: *const u8, len: usize) -> bool {
    if len == 0 {
        return true;
    }
    #[cfg(unix)]
    {
        unix::munlock_impl(ptr, len)
    }
    #[cfg(not(unix))]
    {
        let _ = (ptr, len);
        true
    }
}

/// A zero-filled buffer locked in memory on creation, zeroized and
/// unlocked on drop. Used to hold derived private keys and seeds.
pub struct LockedBuffer {
    data: Vec<u8>,
    locked: bool,
}

impl LockedBuffer {
    pub fn new(len: usize) -> Self {
        let data = vec![0u8; len];
        let locked = if data.is_empty() {
            true
        } else {
            unsafe { mlock(data.as_ptr(), data.len()) }
        };
        Self { data, locked }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for LockedBuffer {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.data.zeroize();
        if self.locked && !self.data.is_empty() {
            unsafe {
                munlock(self.data.as_ptr(), self.data.len());
            }
        }
    }
}

#[cfg(unix)]
mod unix {
    pub fn disable_core_dumps_impl() -> bool {
        unsafe {
            let rlim = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            libc::setrlimit(libc::RLIMIT_CORE, &rlim) == 0
        }
    }

    pub unsafe fn mlock_impl(ptr: *const u8, len: usize) -> bool {
        libc::mlock(ptr as *const libc::c_void, len) == 0
    }

    pub unsafe fn munlock_impl(ptr: *const u8, len: usize) -> bool {
        libc::munlock(ptr as *const libc::c_void, len) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disable_core_dumps_is_idempotent() {
        disable_core_dumps();
        assert!(disable_core_dumps());
    }

    #[test]
    fn locked_buffer_zero_length() {
        let buf = LockedBuffer::new(0);
        assert!(buf.as_slice().is_empty());
    }

    #[test]
    fn locked_buffer_holds_written_bytes() {
        let mut buf = LockedBuffer::new(8);
        buf.as_mut_slice()[0] = 0xAB;
        assert_eq!(buf.as_slice()[0], 0xAB);
    }
}
