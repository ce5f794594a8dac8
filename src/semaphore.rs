//! Named POSIX semaphore used as a cross-process mutex

use crate::error::{Result, ShmError};
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::time::Duration;
use tracing::warn;

/// Prefix of every semaphore name
pub const SEM_PREFIX: &str = "/sem_";

const SEM_MODE: libc::c_uint = 0o666;

fn sem_name(name: &str) -> Result<CString> {
    CString::new(format!("{}{}", SEM_PREFIX, name)).map_err(|_| ShmError::Semaphore {
        name: name.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"),
    })
}

/// Handle to a named semaphore
pub struct NamedSemaphore {
    sem: NonNull<libc::sem_t>,
    name: String,
}

// SAFETY: sem_t handles from sem_open are process-wide and usable from any thread
unsafe impl Send for NamedSemaphore {}

impl NamedSemaphore {
    /// Open the semaphore, creating it with `initial` permits if absent.
    pub fn open_or_create(name: &str, initial: u32) -> Result<Self> {
        let c_name = sem_name(name)?;
        // SAFETY: c_name is NUL terminated; variadic args are promoted to c_uint
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT,
                SEM_MODE,
                initial as libc::c_uint,
            )
        };
        Self::from_raw(sem, name)
    }

    /// Open an existing semaphore.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = sem_name(name)?;
        // SAFETY: c_name is NUL terminated
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        Self::from_raw(sem, name)
    }

    fn from_raw(sem: *mut libc::sem_t, name: &str) -> Result<Self> {
        if sem == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Err(ShmError::NotFound {
                    name: name.to_string(),
                });
            }
            return Err(ShmError::Semaphore {
                name: name.to_string(),
                source: err,
            });
        }
        let sem = NonNull::new(sem).ok_or_else(|| ShmError::Semaphore {
            name: name.to_string(),
            source: io::Error::other("sem_open returned null"),
        })?;
        Ok(Self {
            sem,
            name: name.to_string(),
        })
    }

    /// Take one permit. `None` waits forever.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<bool> {
        match timeout {
            None => loop {
                // SAFETY: self.sem is a live handle from sem_open
                if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                    return Ok(true);
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(self.error(err));
                }
            },
            Some(timeout) => self.acquire_timeout(timeout),
        }
    }

    #[cfg(target_os = "linux")]
    fn acquire_timeout(&self, timeout: Duration) -> Result<bool> {
        // SAFETY: timespec is plain data
        let mut deadline: libc::timespec = unsafe { std::mem::zeroed() };
        // SAFETY: deadline is a valid out pointer
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline) } != 0 {
            return Err(self.error(io::Error::last_os_error()));
        }
        let nanos = deadline.tv_nsec as u64 + timeout.subsec_nanos() as u64;
        deadline.tv_sec += (timeout.as_secs() + nanos / 1_000_000_000) as libc::time_t;
        deadline.tv_nsec = (nanos % 1_000_000_000) as libc::c_long;

        loop {
            // SAFETY: live handle, valid timespec
            if unsafe { libc::sem_timedwait(self.sem.as_ptr(), &deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(self.error(err)),
            }
        }
    }

    // No sem_timedwait outside Linux; poll sem_trywait instead
    #[cfg(not(target_os = "linux"))]
    fn acquire_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.try_acquire()? {
                return Ok(true);
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Take a permit if one is free right now.
    pub fn try_acquire(&self) -> Result<bool> {
        loop {
            // SAFETY: live handle
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(self.error(err)),
            }
        }
    }

    /// Give one permit back.
    pub fn release(&self) -> Result<()> {
        // SAFETY: live handle
        if unsafe { libc::sem_post(self.sem.as_ptr()) } != 0 {
            return Err(self.error(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Acquire and get a guard that releases on drop.
    ///
    /// `Ok(None)` means the timeout elapsed.
    pub fn lock(&self, timeout: Option<Duration>) -> Result<Option<SemaphoreGuard<'_>>> {
        if self.acquire(timeout)? {
            Ok(Some(SemaphoreGuard { sem: self }))
        } else {
            Ok(None)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn error(&self, source: io::Error) -> ShmError {
        ShmError::Semaphore {
            name: self.name.clone(),
            source,
        }
    }
}

/// Remove the semaphore name; a missing semaphore is not an error.
pub fn unlink(name: &str) -> Result<bool> {
    let c_name = sem_name(name)?;
    // SAFETY: c_name is NUL terminated
    if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENOENT) {
        return Ok(false);
    }
    Err(ShmError::Semaphore {
        name: name.to_string(),
        source: err,
    })
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: handle came from sem_open and is closed exactly once
        unsafe {
            libc::sem_close(self.sem.as_ptr());
        }
    }
}

/// Held permit of a [`NamedSemaphore`]
pub struct SemaphoreGuard<'a> {
    sem: &'a NamedSemaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.sem.release() {
            warn!(target: "shmem_value::semaphore", name = %self.sem.name, error = %e, "failed to release lock");
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
    fn test_mutex_semantics() {
        let name = unique("sm");
        let a = NamedSemaphore::open_or_create(&name, 1).unwrap();
        let b = NamedSemaphore::open(&name).unwrap();

        {
            let _held = a.lock(None).unwrap().unwrap();
            assert!(!b.try_acquire().unwrap());
            assert!(!b.acquire(Some(Duration::from_millis(20))).unwrap());
        }

        assert!(b.acquire(Some(Duration::from_millis(20))).unwrap());
        b.release().unwrap();

        drop(b);
        drop(a);
        assert!(unlink(&name).unwrap());
        assert!(!unlink(&name).unwrap());
    }

    #[test]
    fn test_open_missing() {
        assert!(matches!(
            NamedSemaphore::open(&unique("nosem")),
            Err(ShmError::NotFound { .. })
        ));
    }
}
