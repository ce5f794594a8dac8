//! Owner and reader handles on a named shared value
//!
//! A segment is one shared memory region holding a single encoded
//! [`Value`] frame, plus a named semaphore that every access takes first.
//! The owner creates both and fixes the value's kind and the capacity;
//! readers attach by name.
//!
//! ```text
//! Unattached --attach--> Attached --close--> Closed
//!      ^                    |                  |
//!      +---- reconnect -----+---- restart -----+
//! ```
//!
//! Transient unavailability (nobody created the segment yet, it carries
//! the CLOSED sentinel, the lock timed out) is reported as `None` / `false`
//! plus a `tracing` event, never as an error, so polling stays cheap.

use crate::codec::{self, CLOSED_FRAME};
use crate::error::{FrameFault, Result, ShmError};
use crate::json;
use crate::registry::RegistryContext;
use crate::semaphore::{self, NamedSemaphore, SemaphoreGuard};
use crate::shm::{self, ShmRegion};
use crate::value::{Kind, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lock timeout used when none is configured
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Segment configuration
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Requested capacity in bytes, rounded up to the page size.
    /// `None` sizes the segment to the initial value.
    pub capacity: Option<usize>,
    /// How long to wait for the lock; `None` waits forever
    pub lock_timeout: Option<Duration>,
    /// Let an owner adopt a live segment of the same name
    pub reattach: bool,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            lock_timeout: Some(DEFAULT_LOCK_TIMEOUT),
            reattach: false,
        }
    }
}

/// Which side of a segment a handle is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Reader,
}

enum Side {
    Owner { initial: Value },
    Reader,
}

struct Attachment {
    region: ShmRegion,
    sem: NamedSemaphore,
    kind: Kind,
}

/// Builder for [`SharedSegment`]
pub struct SegmentBuilder {
    name: String,
    value: Option<Value>,
    json_path: Option<PathBuf>,
    config: SegmentConfig,
    registry: RegistryContext,
}

impl SegmentBuilder {
    /// Initial value published by an owner
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// JSON document holding the owner's initial value
    pub fn json_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.json_path = Some(path.into());
        self
    }

    pub fn capacity(mut self, bytes: usize) -> Self {
        self.config.capacity = Some(bytes);
        self
    }

    pub fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    pub fn reattach(mut self, reattach: bool) -> Self {
        self.config.reattach = reattach;
        self
    }

    pub fn config(mut self, config: SegmentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: RegistryContext) -> Self {
        self.registry = registry;
        self
    }

    /// Create the segment as its owner and publish the initial value.
    pub fn create(self) -> Result<SharedSegment> {
        let initial = match (self.value, self.json_path) {
            (Some(value), None) => value.materialize()?,
            (None, Some(path)) => json::load(&path)?,
            _ => return Err(ShmError::MultiInput),
        };
        shm::check_name(&self.name)?;
        self.registry.check_name(&self.name)?;

        let mut segment = SharedSegment {
            name: self.name,
            side: Side::Owner { initial },
            config: self.config,
            registry: self.registry,
            attachment: None,
        };
        segment.attach()?;
        if let Err(e) = segment.registry.register(&segment.name) {
            warn!(target: "shmem_value::segment", name = %segment.name, error = %e, "registration failed, releasing shared memory");
            if let Err(cleanup) = segment.close() {
                warn!(target: "shmem_value::segment", name = %segment.name, error = %cleanup, "release after failed registration failed");
            }
            return Err(e);
        }
        info!(target: "shmem_value::segment", name = %segment.name, capacity = segment.capacity().unwrap_or(0), "shared memory created");
        Ok(segment)
    }

    /// Attach as a reader.
    ///
    /// A missing segment is not an error: the handle stays unattached and
    /// retries lazily on the next access, or on [`SharedSegment::reconnect`].
    pub fn open(self) -> Result<SharedSegment> {
        if self.value.is_some() || self.json_path.is_some() {
            return Err(ShmError::MultiInput);
        }
        shm::check_name(&self.name)?;
        self.registry.check_name(&self.name)?;

        let mut segment = SharedSegment {
            name: self.name,
            side: Side::Reader,
            config: self.config,
            registry: self.registry,
            attachment: None,
        };
        segment.try_attach()?;
        Ok(segment)
    }
}

/// Handle on one named shared value
pub struct SharedSegment {
    name: String,
    side: Side,
    config: SegmentConfig,
    registry: RegistryContext,
    attachment: Option<Attachment>,
}

impl SharedSegment {
    pub fn builder(name: impl Into<String>) -> SegmentBuilder {
        SegmentBuilder {
            name: name.into(),
            value: None,
            json_path: None,
            config: SegmentConfig::default(),
            registry: RegistryContext::default(),
        }
    }

    /// Owner with default configuration.
    pub fn create(name: &str, value: impl Into<Value>) -> Result<Self> {
        Self::builder(name).value(value).create()
    }

    /// Reader with default configuration.
    pub fn open(name: &str) -> Result<Self> {
        Self::builder(name).open()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        match self.side {
            Side::Owner { .. } => Role::Owner,
            Side::Reader => Role::Reader,
        }
    }

    pub fn is_owner(&self) -> bool {
        self.role() == Role::Owner
    }

    /// Declared kind of the shared value, if known yet
    pub fn kind(&self) -> Option<Kind> {
        match (&self.attachment, &self.side) {
            (Some(att), _) => Some(att.kind),
            (None, Side::Owner { initial }) => Some(initial.kind()),
            (None, Side::Reader) => None,
        }
    }

    /// Capacity of the mapped region in bytes
    pub fn capacity(&self) -> Option<usize> {
        self.attachment.as_ref().map(|att| att.region.size())
    }

    /// Attach now, surfacing [`ShmError::NotFound`] instead of deferring.
    pub fn connect(&mut self) -> Result<()> {
        if self.attachment.is_some() {
            return Ok(());
        }
        self.attach()
    }

    /// Whether the segment exists and has not been closed.
    ///
    /// An unattached reader tries to attach first.
    pub fn availability(&mut self) -> bool {
        if self.attachment.is_none() && !self.is_owner() {
            if let Err(e) = self.try_attach() {
                debug!(target: "shmem_value::segment", name = %self.name, error = %e, "attach failed");
                return false;
            }
        }
        match &self.attachment {
            Some(att) => !codec::is_closed(att.region.as_slice()),
            None => false,
        }
    }

    /// Take the lock for a compound operation.
    ///
    /// `None` when the segment is unavailable or the lock timed out; both
    /// are logged.
    pub fn lock(&mut self) -> Result<Option<SegmentGuard<'_>>> {
        if !self.availability() {
            warn!(target: "shmem_value::segment", name = %self.name, "shared memory space doesn't exist");
            return Ok(None);
        }
        let timeout = self.config.lock_timeout;
        let Some(att) = self.attachment.as_mut() else {
            return Ok(None);
        };

        let Some(lock) = att.sem.lock(timeout)? else {
            warn!(target: "shmem_value::segment", name = %self.name, timeout = ?timeout, "lock timed out, nothing changed");
            return Ok(None);
        };
        if codec::is_closed(att.region.as_slice()) {
            drop(lock);
            warn!(target: "shmem_value::segment", name = %self.name, "shared memory closed while waiting for the lock");
            return Ok(None);
        }

        Ok(Some(SegmentGuard {
            region: &mut att.region,
            kind: att.kind,
            _lock: lock,
        }))
    }

    /// Current value, or `None` if unavailable.
    pub fn get_value(&mut self) -> Result<Option<Value>> {
        match self.lock()? {
            Some(guard) => guard.value().map(Some),
            None => Ok(None),
        }
    }

    /// Replace the value. Returns `false` if nothing was written because
    /// the segment is unavailable.
    pub fn set_value(&mut self, value: impl Into<Value>) -> Result<bool> {
        match self.lock()? {
            Some(mut guard) => {
                guard.set_value(value.into())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Read-modify-write under one critical section.
    ///
    /// The new value is written back only if `f` succeeds.
    pub fn update<R, F>(&mut self, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut Value) -> Result<R>,
    {
        let Some(mut guard) = self.lock()? else {
            return Ok(None);
        };
        let mut value = guard.value()?;
        let out = f(&mut value)?;
        guard.set_value(value)?;
        Ok(Some(out))
    }

    /// Element at `key` (mapping key or integer index).
    pub fn get_item(&mut self, key: &Value) -> Result<Option<Value>> {
        match self.lock()? {
            Some(guard) => guard.value()?.get_item(key).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_item(&mut self, key: impl Into<Value>, value: impl Into<Value>) -> Result<bool> {
        let (key, value) = (key.into(), value.into());
        self.update(move |current| current.set_item(key, value))
            .map(|done| done.is_some())
    }

    /// Delete the element at `key`, returning it.
    pub fn remove_item(&mut self, key: &Value) -> Result<Option<Value>> {
        self.update(|current| current.remove_item(key))
    }

    pub fn len(&mut self) -> Result<Option<usize>> {
        match self.lock()? {
            Some(guard) => guard.value()?.len().map(Some),
            None => Ok(None),
        }
    }

    pub fn is_empty(&mut self) -> Result<Option<bool>> {
        self.len().map(|len| len.map(|n| n == 0))
    }

    pub fn contains(&mut self, item: &Value) -> Result<Option<bool>> {
        match self.lock()? {
            Some(guard) => guard.value()?.contains(item).map(Some),
            None => Ok(None),
        }
    }

    /// Write a Mapping-typed value to a JSON file.
    pub fn export_json(&mut self, path: impl AsRef<Path>) -> Result<bool> {
        if let Some(kind) = self.kind() {
            if kind != Kind::Mapping {
                return Err(ShmError::TypeMismatch {
                    expected: Kind::Mapping,
                    got: kind,
                });
            }
        }
        match self.get_value()? {
            Some(value) => {
                json::export(path.as_ref(), &value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Release the segment: write CLOSED, unlink the region and semaphore.
    ///
    /// Returns `false` if it was already stopped.
    pub fn close(&mut self) -> Result<bool> {
        if !self.availability() {
            info!(target: "shmem_value::segment", name = %self.name, "shared memory already stopped");
            self.attachment = None;
            self.registry.unregister(&self.name)?;
            return Ok(false);
        }

        let timeout = self.config.lock_timeout;
        let Some(mut att) = self.attachment.take() else {
            return Ok(false);
        };
        match att.sem.acquire(timeout) {
            Ok(true) => {}
            Ok(false) => {
                self.attachment = Some(att);
                return Err(self.lock_timeout());
            }
            Err(e) => {
                self.attachment = Some(att);
                return Err(e);
            }
        }
        if codec::is_closed(att.region.as_slice()) {
            if let Err(e) = att.sem.release() {
                warn!(target: "shmem_value::segment", name = %self.name, error = %e, "semaphore release failed");
            }
            info!(target: "shmem_value::segment", name = %self.name, "shared memory closed while waiting for the lock");
            self.registry.unregister(&self.name)?;
            return Ok(false);
        }

        att.region.as_mut_slice()[..CLOSED_FRAME.len()].copy_from_slice(&CLOSED_FRAME);
        let Attachment { region, sem, .. } = att;
        drop(region);

        if let Err(e) = shm::unlink(&self.name) {
            warn!(target: "shmem_value::segment", name = %self.name, error = %e, "unlink failed");
        }
        if let Err(e) = sem.release() {
            warn!(target: "shmem_value::segment", name = %self.name, error = %e, "semaphore release failed");
        }
        if let Err(e) = semaphore::unlink(&self.name) {
            warn!(target: "shmem_value::segment", name = %self.name, error = %e, "semaphore unlink failed");
        }
        drop(sem);

        self.registry.unregister(&self.name)?;
        info!(target: "shmem_value::segment", name = %self.name, "shared memory closed");
        Ok(true)
    }

    /// Recreate a closed segment with its initial value. Owner only.
    ///
    /// Returns whether a new segment was created.
    pub fn restart(&mut self) -> Result<bool> {
        if !self.is_owner() {
            warn!(target: "shmem_value::segment", name = %self.name, "only the owner can restart a shared memory space");
            return Ok(false);
        }
        if self.availability() {
            info!(target: "shmem_value::segment", name = %self.name, "shared memory already running");
            return Ok(false);
        }
        self.attachment = None;
        self.attach()?;
        self.registry.register(&self.name)?;
        info!(target: "shmem_value::segment", name = %self.name, "shared memory restarted");
        Ok(true)
    }

    /// Drop stale mappings and attach again after the peer went away.
    ///
    /// A live segment is left alone. Returns whether the handle is
    /// attached afterwards.
    pub fn reconnect(&mut self) -> Result<bool> {
        if self.availability() {
            return Ok(true);
        }
        self.attachment = None;
        match self.side {
            Side::Owner { .. } => self.restart(),
            Side::Reader => {
                self.try_attach()?;
                Ok(self.availability())
            }
        }
    }

    /// Attach, turning "not there yet" into a logged `false`.
    fn try_attach(&mut self) -> Result<bool> {
        match self.attach() {
            Ok(()) => Ok(true),
            Err(e) if e.is_transient() || is_closed_fault(&e) => {
                warn!(target: "shmem_value::segment", name = %self.name, reason = %e, "memory space not yet created");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn attach(&mut self) -> Result<()> {
        let attachment = match &self.side {
            Side::Owner { initial } => self.attach_owner(initial)?,
            Side::Reader => self.attach_reader()?,
        };
        debug!(target: "shmem_value::segment", name = %self.name, role = ?self.role(), size = attachment.region.size(), kind = %attachment.kind, "attached");
        self.attachment = Some(attachment);
        Ok(())
    }

    fn attach_owner(&self, initial: &Value) -> Result<Attachment> {
        let frame = codec::encode(initial)?;
        let capacity = shm::round_to_page(self.config.capacity.unwrap_or(frame.len()));
        if frame.len() > capacity {
            return Err(ShmError::CapacityExceeded {
                capacity,
                required: frame.len(),
            });
        }

        let sem = NamedSemaphore::open_or_create(&self.name, 1)?;
        // Held while the region is created so readers never see it unwritten
        if !sem.acquire(self.config.lock_timeout)? {
            return Err(self.lock_timeout());
        }
        let placed = self.place_region(capacity, &frame);
        sem.release()?;

        Ok(Attachment {
            region: placed?,
            sem,
            kind: initial.kind(),
        })
    }

    fn place_region(&self, capacity: usize, frame: &[u8]) -> Result<ShmRegion> {
        let mut region = match ShmRegion::create(&self.name, capacity) {
            Ok(region) => region,
            Err(ShmError::AlreadyExists { .. }) => {
                let existing = ShmRegion::open(&self.name)?;
                let live = codec::decode_prefix(existing.as_slice()).is_ok();
                if live && !self.config.reattach {
                    return Err(ShmError::AlreadyExists {
                        name: self.name.clone(),
                    });
                }
                if live {
                    if existing.size() < frame.len() {
                        return Err(ShmError::CapacityExceeded {
                            capacity: existing.size(),
                            required: frame.len(),
                        });
                    }
                    info!(target: "shmem_value::segment", name = %self.name, "reattaching to live shared memory");
                    existing
                } else {
                    debug!(target: "shmem_value::segment", name = %self.name, "replacing stale shared memory");
                    drop(existing);
                    shm::unlink(&self.name)?;
                    ShmRegion::create(&self.name, capacity)?
                }
            }
            Err(e) => return Err(e),
        };
        region.as_mut_slice()[..frame.len()].copy_from_slice(frame);
        Ok(region)
    }

    fn attach_reader(&self) -> Result<Attachment> {
        let region = ShmRegion::open(&self.name)?;
        let sem = NamedSemaphore::open(&self.name)?;

        let kind = {
            let Some(_lock) = sem.lock(self.config.lock_timeout)? else {
                return Err(self.lock_timeout());
            };
            codec::decode_prefix(region.as_slice())?.0.kind()
        };

        Ok(Attachment { region, sem, kind })
    }

    fn lock_timeout(&self) -> ShmError {
        ShmError::LockTimeout {
            name: self.name.clone(),
            timeout: self.config.lock_timeout.unwrap_or_default(),
        }
    }
}

fn is_closed_fault(e: &ShmError) -> bool {
    matches!(
        e,
        ShmError::FrameFormat {
            fault: FrameFault::Closed,
            ..
        }
    )
}

impl fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("role", &self.role())
            .field("kind", &self.kind())
            .field("capacity", &self.capacity())
            .field("registry", &self.registry)
            .finish()
    }
}

/// Held lock on a segment
///
/// Reads and writes through the guard happen inside one critical section;
/// the semaphore is released when the guard drops.
pub struct SegmentGuard<'a> {
    region: &'a mut ShmRegion,
    kind: Kind,
    _lock: SemaphoreGuard<'a>,
}

impl SegmentGuard<'_> {
    /// Decode the committed frame.
    pub fn value(&self) -> Result<Value> {
        let bytes = self.region.as_slice();
        let extent = codec::frame_extent(bytes)?;
        codec::decode(&bytes[..extent])
    }

    /// Overwrite the committed frame.
    ///
    /// The kind must match the segment's and the frame must fit; on error
    /// the old frame is untouched.
    pub fn set_value(&mut self, value: Value) -> Result<()> {
        let value = value.materialize()?;
        if value.kind() != self.kind {
            return Err(ShmError::TypeMismatch {
                expected: self.kind,
                got: value.kind(),
            });
        }
        let frame = codec::encode(&value)?;
        let capacity = self.region.size();
        if frame.len() > capacity {
            return Err(ShmError::CapacityExceeded {
                capacity,
                required: frame.len(),
            });
        }
        self.region.as_mut_slice()[..frame.len()].copy_from_slice(&frame);
        Ok(())
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.region.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("{}{}", tag, std::process::id() % 100_000)
    }

    fn detached(name: &str) -> SegmentBuilder {
        SharedSegment::builder(name).registry(RegistryContext::detached())
    }

    #[test]
    fn test_multi_input() {
        assert!(matches!(
            detached("mi").create(),
            Err(ShmError::MultiInput)
        ));
        assert!(matches!(
            detached("mi").value(1).json_path("x.json").create(),
            Err(ShmError::MultiInput)
        ));
        assert!(matches!(
            detached("mi").value(1).open(),
            Err(ShmError::MultiInput)
        ));
    }

    #[test]
    fn test_guard_compound_update() {
        let name = unique("sg");
        let mut owner = detached(&name).value(vec![Value::Integer(1)]).create().unwrap();

        {
            let mut guard = owner.lock().unwrap().unwrap();
            let mut v = guard.value().unwrap();
            if let Value::List(items) = &mut v {
                items.push(Value::Integer(2));
            }
            guard.set_value(v).unwrap();
            assert!(matches!(
                guard.set_value(Value::Integer(3)),
                Err(ShmError::TypeMismatch { expected: Kind::List, got: Kind::Integer })
            ));
        }

        assert_eq!(
            owner.get_value().unwrap(),
            Some(Value::List(vec![Value::Integer(1), Value::Integer(2)]))
        );
        assert!(owner.close().unwrap());
    }

    #[test]
    fn test_live_name_collision() {
        let name = unique("sc");
        let mut owner = detached(&name).value(1).create().unwrap();

        assert!(matches!(
            detached(&name).value(2).create(),
            Err(ShmError::AlreadyExists { .. })
        ));

        let mut again = detached(&name).value(2).reattach(true).create().unwrap();
        assert_eq!(owner.get_value().unwrap(), Some(Value::Integer(2)));
        assert!(again.close().unwrap());
        assert!(!owner.availability());
        assert!(!owner.close().unwrap());
    }

    #[test]
    fn test_failed_update_leaves_value() {
        let name = unique("sf");
        let mut owner = detached(&name)
            .value(Value::mapping([("a", 1)]))
            .create()
            .unwrap();

        assert!(matches!(
            owner.remove_item(&"missing".into()),
            Err(ShmError::KeyNotFound)
        ));
        assert_eq!(owner.len().unwrap(), Some(1));
        assert!(owner.close().unwrap());
    }

    /// Registry with no room left
    struct FullRegistry;

    impl crate::registry::Registry for FullRegistry {
        fn list(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn register(&self, _name: &str) -> Result<()> {
            Err(ShmError::CapacityExceeded {
                capacity: 0,
                required: 1,
            })
        }

        fn unregister(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_registration_releases_objects() {
        let name = unique("sr");
        let full = RegistryContext::new(std::sync::Arc::new(FullRegistry));

        let err = SharedSegment::builder(name.as_str())
            .value(1)
            .registry(full)
            .create()
            .unwrap_err();
        assert!(matches!(err, ShmError::CapacityExceeded { .. }));
        assert!(matches!(
            ShmRegion::open(&name),
            Err(ShmError::NotFound { .. })
        ));
        assert!(matches!(
            NamedSemaphore::open(&name),
            Err(ShmError::NotFound { .. })
        ));

        let mut retry = detached(&name).value(2).create().unwrap();
        assert_eq!(retry.get_value().unwrap(), Some(Value::Integer(2)));
        assert!(retry.close().unwrap());
    }

    #[test]
    fn test_close_after_peer_closed_while_waiting() {
        let name = unique("sw");
        let mut owner = detached(&name).value(1).create().unwrap();
        let mut reader = detached(&name).open().unwrap();
        assert!(reader.availability());

        let waiter = {
            let guard = owner.lock().unwrap().unwrap();
            let closer = std::thread::spawn(move || reader.close());
            std::thread::sleep(Duration::from_millis(50));

            // another handle releases the segment while the lock is held
            let mut peer = ShmRegion::open(&name).unwrap();
            peer.as_mut_slice()[..CLOSED_FRAME.len()].copy_from_slice(&CLOSED_FRAME);
            drop(guard);
            closer
        };

        assert!(!waiter.join().unwrap().unwrap());
        // the late closer left the OS objects alone
        assert!(ShmRegion::open(&name).is_ok());
        assert!(NamedSemaphore::open(&name).is_ok());

        assert!(!owner.close().unwrap());
        shm::unlink(&name).unwrap();
        semaphore::unlink(&name).unwrap();
    }
}
