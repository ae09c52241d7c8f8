// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 rsa-shm contributors
//
// Named POSIX shared-memory segment backing one message channel.
// The creating side owns the segment lifetime and unlinks it on drop;
// attaching sides only map and unmap.

use std::ffi::CString;
use std::io;
use std::ptr;

/// Open mode for a shared segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create exclusively — fail if the segment already exists.
    Create,
    /// Attach to an existing segment — fail if it does not exist.
    Open,
}

/// A named, inter-process shared memory region.
#[derive(Debug)]
pub struct ShmSegment {
    mem: *mut u8,
    size: usize,
    name: String, // POSIX name (with leading '/')
    owner: bool,  // creator unlinks on drop
}

// Safety: the mapping is process-shared by design; all mutable state inside
// it is accessed through atomics or the in-segment pthread primitives.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Acquire a named shared memory region.
    ///
    /// In `Create` mode the segment is created exclusively and sized to
    /// `size` bytes. In `Open` mode `size` is ignored — the existing
    /// segment's size is taken from the backing object.
    pub fn acquire(name: &str, size: usize, mode: ShmOpenMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if mode == ShmOpenMode::Create && size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let perms: libc::mode_t = 0o666;

        let (fd, size) = match mode {
            ShmOpenMode::Create => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                // ftruncate only on the segment we just created; truncating an
                // already-sized object can zero its contents on some platforms.
                let ret = unsafe { libc::ftruncate(f, size as libc::off_t) };
                if ret != 0 {
                    let err = io::Error::last_os_error();
                    unsafe {
                        libc::close(f);
                        libc::shm_unlink(c_name.as_ptr());
                    }
                    return Err(err);
                }
                (f, size)
            }
            ShmOpenMode::Open => {
                let f =
                    unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                let mut st: libc::stat = unsafe { std::mem::zeroed() };
                if unsafe { libc::fstat(f, &mut st) } != 0 {
                    let err = io::Error::last_os_error();
                    unsafe { libc::close(f) };
                    return Err(err);
                }
                (f, st.st_size as usize)
            }
        };

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            if mode == ShmOpenMode::Create {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
            return Err(err);
        }

        Ok(Self {
            mem: mem as *mut u8,
            size,
            name: posix_name,
            owner: mode == ShmOpenMode::Create,
        })
    }

    /// Pointer to the start of the mapped region.
    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    /// Mutable pointer to the start of the mapped region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// POSIX name (with leading '/').
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove a named segment by name without needing an open handle.
    pub fn unlink_by_name(name: &str) {
        let posix_name = make_shm_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if self.owner {
            if let Ok(c_name) = CString::new(self.name.as_bytes()) {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
        }
    }
}

/// Produce a POSIX shm-safe name (with leading '/').
pub fn make_shm_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

/// FNV-1a 64-bit hash; used to derive the segment id embedded in the
/// segment header and in every message descriptor.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_value() {
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
    }

    #[test]
    fn make_shm_name_prepends_slash() {
        assert_eq!(make_shm_name("foo"), "/foo");
        assert_eq!(make_shm_name("/bar"), "/bar");
    }
}
