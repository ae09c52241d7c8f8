// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 rsa-shm contributors
//
// Process-shared pthread mutex and condition variable cells.
// Unlike a named mutex in its own segment, these live at fixed offsets
// inside the message control block of a pooled shared segment, so they are
// initialised in place by whichever side creates the channel.

use std::cell::UnsafeCell;
use std::io;
use std::time::Duration;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

/// A `pthread_mutex_t` living inside a shared segment.
///
/// Initialised with `PTHREAD_PROCESS_SHARED` (and `PTHREAD_MUTEX_ROBUST`
/// where available, so a lock holder dying in another process does not wedge
/// the slot forever).
#[repr(C)]
pub struct SharedMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

// Safety: the pthread mutex is designed for concurrent access, including
// from other processes.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Initialise the mutex in place.
    ///
    /// # Safety
    /// `this` must point to writable memory inside a mapped shared segment,
    /// properly aligned for `SharedMutex`, and must not be initialised twice
    /// without an intervening teardown of the segment.
    pub unsafe fn init(this: *mut SharedMutex) -> io::Result<()> {
        let mtx_ptr = (*this).raw.get();
        std::ptr::write_bytes(mtx_ptr, 0, 1);

        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let mut eno = libc::pthread_mutexattr_init(&mut attr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if eno != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(eno));
        }
        #[cfg(not(target_os = "macos"))]
        {
            eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
            if eno != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(io::Error::from_raw_os_error(eno));
            }
        }
        eno = libc::pthread_mutex_init(mtx_ptr, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    fn mtx_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.raw.get()
    }

    /// Lock the mutex, returning an RAII guard that unlocks on drop.
    ///
    /// `EOWNERDEAD` from a robust mutex (previous owner died) is recovered
    /// with `pthread_mutex_consistent` and reported as success.
    pub fn lock(&self) -> io::Result<SharedMutexGuard<'_>> {
        let eno = unsafe { libc::pthread_mutex_lock(self.mtx_ptr()) };
        match eno {
            0 => Ok(SharedMutexGuard { mtx: self }),
            #[cfg(not(target_os = "macos"))]
            libc::EOWNERDEAD => {
                let eno2 = unsafe { pthread_mutex_consistent(self.mtx_ptr()) };
                if eno2 != 0 {
                    return Err(io::Error::from_raw_os_error(eno2));
                }
                Ok(SharedMutexGuard { mtx: self })
            }
            _ => Err(io::Error::from_raw_os_error(eno)),
        }
    }
}

/// RAII guard: holds the shared mutex locked for its lifetime.
pub struct SharedMutexGuard<'a> {
    mtx: &'a SharedMutex,
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        unsafe { libc::pthread_mutex_unlock(self.mtx.mtx_ptr()) };
    }
}

/// A `pthread_cond_t` living inside a shared segment, initialised with
/// `PTHREAD_PROCESS_SHARED`.
#[repr(C)]
pub struct SharedCond {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

// Safety: same as SharedMutex.
unsafe impl Send for SharedCond {}
unsafe impl Sync for SharedCond {}

impl SharedCond {
    /// Initialise the condition variable in place.
    ///
    /// # Safety
    /// Same contract as [`SharedMutex::init`].
    pub unsafe fn init(this: *mut SharedCond) -> io::Result<()> {
        let cond_ptr = (*this).raw.get();
        std::ptr::write_bytes(cond_ptr, 0, 1);

        let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
        let mut eno = libc::pthread_condattr_init(&mut attr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        eno = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if eno != 0 {
            libc::pthread_condattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(eno));
        }
        eno = libc::pthread_cond_init(cond_ptr, &attr);
        libc::pthread_condattr_destroy(&mut attr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    fn cond_ptr(&self) -> *mut libc::pthread_cond_t {
        self.raw.get()
    }

    /// Wait on the condition while holding `guard`. The mutex is atomically
    /// released and re-acquired around the wait.
    ///
    /// With `timeout = None` blocks indefinitely. Returns `Ok(true)` when
    /// signalled, `Ok(false)` on timeout.
    pub fn wait(&self, guard: &SharedMutexGuard<'_>, timeout: Option<Duration>) -> io::Result<bool> {
        let mtx_ptr = guard.mtx.mtx_ptr();
        match timeout {
            None => {
                let eno = unsafe { libc::pthread_cond_wait(self.cond_ptr(), mtx_ptr) };
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }
                Ok(true)
            }
            Some(tm) => {
                let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
                unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
                let ns_total = ts.tv_nsec as u64 + tm.subsec_nanos() as u64;
                ts.tv_sec += tm.as_secs() as libc::time_t
                    + (ns_total / 1_000_000_000) as libc::time_t;
                ts.tv_nsec = (ns_total % 1_000_000_000) as libc::c_long;
                loop {
                    let eno =
                        unsafe { libc::pthread_cond_timedwait(self.cond_ptr(), mtx_ptr, &ts) };
                    match eno {
                        0 => return Ok(true),
                        libc::ETIMEDOUT => return Ok(false),
                        libc::EINTR => continue,
                        _ => return Err(io::Error::from_raw_os_error(eno)),
                    }
                }
            }
        }
    }

    /// Wake one waiter.
    pub fn signal(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_cond_signal(self.cond_ptr()) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }
}
