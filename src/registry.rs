//! Directory of live segments
//!
//! Linux exposes POSIX shared memory objects as files under `/dev/shm`, so
//! the OS namespace itself is the registry. Platforms without such a
//! listing keep the names in a meta-segment that is itself a
//! [`SharedSegment`] holding a List of Str, opened with a detached
//! [`RegistryContext`] so it never registers itself.

use crate::error::{Result, ShmError};
use crate::segment::SharedSegment;
use crate::semaphore::{self, NamedSemaphore};
use crate::shm::{self, SHM_PREFIX};
use crate::value::Value;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the meta-segment used by [`SegmentRegistry`]
pub const MANAGER_NAME: &str = "man";

/// Capacity of the meta-segment
pub const MANAGER_CAPACITY: usize = 10 * 1024;

/// Name directory for segments
pub trait Registry: Send + Sync {
    /// Logical names of the segments currently known.
    fn list(&self) -> Result<Vec<String>>;

    fn register(&self, name: &str) -> Result<()>;

    fn unregister(&self, name: &str) -> Result<()>;

    /// Name this registry keeps for itself, if any.
    fn reserved_name(&self) -> Option<&str> {
        None
    }
}

/// Registry handed to each segment at construction
#[derive(Clone)]
pub struct RegistryContext {
    registry: Option<Arc<dyn Registry>>,
}

impl RegistryContext {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry: Some(registry),
        }
    }

    /// Context that records nothing.
    pub fn detached() -> Self {
        Self { registry: None }
    }

    /// `/dev/shm` listing on Linux, a meta-segment elsewhere.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "linux") {
            Self::new(Arc::new(DevShmRegistry::default()))
        } else {
            Self::new(Arc::new(SegmentRegistry::default()))
        }
    }

    pub fn is_detached(&self) -> bool {
        self.registry.is_none()
    }

    pub fn list(&self) -> Result<Vec<String>> {
        match &self.registry {
            Some(registry) => registry.list(),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn register(&self, name: &str) -> Result<()> {
        match &self.registry {
            Some(registry) => registry.register(name),
            None => Ok(()),
        }
    }

    pub(crate) fn unregister(&self, name: &str) -> Result<()> {
        match &self.registry {
            Some(registry) => registry.unregister(name),
            None => Ok(()),
        }
    }

    pub(crate) fn check_name(&self, name: &str) -> Result<()> {
        let reserved = self.registry.as_ref().and_then(|r| r.reserved_name());
        if reserved == Some(name) {
            return Err(ShmError::ReservedName {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn reserved_name(&self) -> Option<&str> {
        self.registry.as_ref().and_then(|r| r.reserved_name())
    }
}

impl Default for RegistryContext {
    fn default() -> Self {
        Self::platform_default()
    }
}

impl fmt::Debug for RegistryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.registry {
            Some(_) => f.write_str("RegistryContext(attached)"),
            None => f.write_str("RegistryContext(detached)"),
        }
    }
}

/// Registry backed by the `/dev/shm` directory listing
#[derive(Debug, Clone)]
pub struct DevShmRegistry {
    dir: PathBuf,
}

impl DevShmRegistry {
    /// List another directory laid out like `/dev/shm`.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Default for DevShmRegistry {
    fn default() -> Self {
        Self::with_dir("/dev/shm")
    }
}

impl Registry for DevShmRegistry {
    fn list(&self) -> Result<Vec<String>> {
        let prefix = SHM_PREFIX.trim_start_matches('/');
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let file_name = entry?.file_name();
            if let Some(name) = file_name.to_str().and_then(|n| n.strip_prefix(prefix)) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    // The OS namespace is the source of truth
    fn register(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn unregister(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// Registry kept in a meta-segment holding a List of names
#[derive(Debug, Clone)]
pub struct SegmentRegistry {
    name: String,
}

impl SegmentRegistry {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Open the meta-segment, creating it when missing or closed.
    fn manager(&self) -> Result<SharedSegment> {
        let mut man = SharedSegment::builder(&self.name)
            .registry(RegistryContext::detached())
            .open()?;
        if man.availability() {
            return Ok(man);
        }
        man.close()?;

        match SharedSegment::builder(&self.name)
            .value(Value::List(Vec::new()))
            .capacity(MANAGER_CAPACITY)
            .registry(RegistryContext::detached())
            .create()
        {
            Ok(man) => {
                debug!(target: "shmem_value::registry", name = %self.name, "registry segment created");
                Ok(man)
            }
            // Another process created it first
            Err(ShmError::AlreadyExists { .. }) => {
                let mut man = SharedSegment::builder(&self.name)
                    .registry(RegistryContext::detached())
                    .open()?;
                man.connect()?;
                Ok(man)
            }
            Err(e) => Err(e),
        }
    }

    /// Close the meta-segment itself.
    pub fn destroy(&self) -> Result<bool> {
        self.manager()?.close()
    }
}

impl Default for SegmentRegistry {
    fn default() -> Self {
        Self::new(MANAGER_NAME)
    }
}

impl Registry for SegmentRegistry {
    fn list(&self) -> Result<Vec<String>> {
        let names = match self.manager()?.get_value()? {
            Some(Value::List(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Str(s) => Some(s),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(names)
    }

    fn register(&self, name: &str) -> Result<()> {
        let entry = Value::from(name);
        self.manager()?.update(|names| {
            if let Value::List(items) = names {
                if !items.contains(&entry) {
                    items.push(entry);
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    fn unregister(&self, name: &str) -> Result<()> {
        let entry = Value::from(name);
        self.manager()?.update(|names| {
            if let Value::List(items) = names {
                items.retain(|item| *item != entry);
            }
            Ok(())
        })?;
        Ok(())
    }

    fn reserved_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// Forcibly remove one segment's region and semaphore.
///
/// Waiters on the semaphore are woken first. Missing objects are ignored;
/// returns whether the region existed.
pub fn kill_segment(name: &str) -> Result<bool> {
    let existed = shm::unlink(name)?;
    if let Ok(sem) = NamedSemaphore::open(name) {
        let _ = sem.release();
    }
    semaphore::unlink(name)?;
    debug!(target: "shmem_value::registry", name = %name, existed, "segment killed");
    Ok(existed)
}

/// Kill every registered segment except the registry's own.
///
/// Returns how many regions were removed.
pub fn clean_all(ctx: &RegistryContext) -> Result<usize> {
    let mut killed = 0;
    for name in ctx.list()? {
        if ctx.reserved_name() == Some(name.as_str()) {
            continue;
        }
        if kill_segment(&name)? {
            killed += 1;
        }
        ctx.unregister(&name)?;
    }
    info!(target: "shmem_value::registry", killed, "shared memory spaces cleaned");
    Ok(killed)
}
