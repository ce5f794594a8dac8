//! Low-level POSIX shared memory operations

use crate::error::{Result, ShmError};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;

/// Prefix of every shared memory object name
pub const SHM_PREFIX: &str = "/psm_";

/// Longest prefixed object name accepted (macOS caps shm names at 31)
pub const MAX_OBJECT_NAME_LEN: usize = 31;

/// Longest logical name accepted
pub const MAX_NAME_LEN: usize = MAX_OBJECT_NAME_LEN - SHM_PREFIX.len();

const MODE: Mode = Mode::RUSR
    .union(Mode::WUSR)
    .union(Mode::RGRP)
    .union(Mode::WGRP)
    .union(Mode::ROTH)
    .union(Mode::WOTH);

/// Reject names that would not survive prefixing.
pub fn check_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(ShmError::NameTooLong {
            max: MAX_NAME_LEN,
            got: name.len(),
        });
    }
    Ok(())
}

fn object_name(name: &str) -> Result<CString> {
    check_name(name)?;
    CString::new(format!("{}{}", SHM_PREFIX, name)).map_err(|_| ShmError::ShmOpen {
        name: name.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "name contains NUL"),
    })
}

/// Round `size` up to a whole number of pages.
pub fn round_to_page(size: usize) -> usize {
    let page = rustix::param::page_size();
    size.max(1).div_ceil(page) * page
}

/// Unlink the object behind `name`; a missing object is not an error.
///
/// Returns whether something was unlinked.
pub fn unlink(name: &str) -> Result<bool> {
    let c_name = object_name(name)?;
    match shm_unlink(c_name.as_c_str()) {
        Ok(()) => Ok(true),
        Err(e) if e == Errno::NOENT => Ok(false),
        Err(e) => Err(ShmError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        }),
    }
}

/// Mapping of one named shared memory object
pub struct ShmRegion {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
}

// SAFETY: the region is only touched through &self/&mut self, and cross-process
// access is serialised by the segment's semaphore
unsafe impl Send for ShmRegion {}

impl ShmRegion {
    /// Create a new shared memory object of `size` bytes.
    ///
    /// Fails with [`ShmError::AlreadyExists`] if the name is taken; `size`
    /// is used as given, round it with [`round_to_page`] first.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = object_name(name)?;

        let fd = match shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            MODE,
        ) {
            Ok(fd) => fd,
            Err(e) if e == Errno::EXIST => {
                return Err(ShmError::AlreadyExists {
                    name: name.to_string(),
                })
            }
            Err(e) => {
                return Err(ShmError::ShmCreate {
                    name: name.to_string(),
                    source: e.into(),
                })
            }
        };

        if let Err(e) = ftruncate(&fd, size as u64) {
            let _ = shm_unlink(c_name.as_c_str());
            return Err(ShmError::Truncate(e.into()));
        }

        Self::map(fd, name, size)
    }

    /// Open an existing shared memory object, mapping all of it.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = object_name(name)?;

        let fd = match shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(e) if e == Errno::NOENT => {
                return Err(ShmError::NotFound {
                    name: name.to_string(),
                })
            }
            Err(e) => {
                return Err(ShmError::ShmOpen {
                    name: name.to_string(),
                    source: e.into(),
                })
            }
        };

        let stat = rustix::fs::fstat(&fd).map_err(|e| ShmError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;
        if size == 0 {
            // creator has not sized it yet
            return Err(ShmError::NotFound {
                name: name.to_string(),
            });
        }

        Self::map(fd, name, size)
    }

    fn map(fd: OwnedFd, name: &str, size: usize) -> Result<Self> {
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|e| ShmError::Mmap(e.into()))?
        };

        let addr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| ShmError::Mmap(std::io::Error::other("mmap returned null")))?;

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
        })
    }

    /// Mapped bytes
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: addr..addr+size is mapped for the lifetime of self
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.size) }
    }

    /// Mapped bytes, writable
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; &mut self keeps this process to one writer
        unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr(), self.size) }
    }

    /// Get size of shared memory region
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the logical name of shared memory
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // Unlinking is an explicit lifecycle step, never a side effect of drop
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("{}{}", tag, std::process::id() % 100_000)
    }

    #[test]
    fn test_create_and_open() {
        let name = unique("rg");
        let size = round_to_page(100);

        let mut shm1 = ShmRegion::create(&name, size).unwrap();
        assert_eq!(shm1.size(), size);
        shm1.as_mut_slice()[0] = 42;

        let shm2 = ShmRegion::open(&name).unwrap();
        assert_eq!(shm2.size(), size);
        assert_eq!(shm2.as_slice()[0], 42);

        assert!(matches!(
            ShmRegion::create(&name, size),
            Err(ShmError::AlreadyExists { .. })
        ));

        drop(shm2);
        drop(shm1);
        assert!(unlink(&name).unwrap());
        assert!(!unlink(&name).unwrap());
    }

    #[test]
    fn test_open_missing() {
        assert!(matches!(
            ShmRegion::open(&unique("missing")),
            Err(ShmError::NotFound { .. })
        ));
    }

    #[test]
    fn test_name_limit() {
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            ShmRegion::open(&long),
            Err(ShmError::NameTooLong { .. })
        ));
        assert!(check_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[test]
    fn test_round_to_page() {
        let page = rustix::param::page_size();
        assert_eq!(round_to_page(1), page);
        assert_eq!(round_to_page(page), page);
        assert_eq!(round_to_page(page + 1), 2 * page);
        assert_eq!(round_to_page(0), page);
    }
}
