//! shmem_value - typed values shared between processes
//!
//! One process (the owner) publishes a [`Value`] into a named POSIX shared
//! memory segment; other processes (readers) attach by name and read or
//! replace it. Every access goes through a named semaphore, so readers only
//! ever see complete frames.
//!
//! # Architecture
//!
//! - **Codec**: self-describing, length-prefixed binary frames ([`codec`])
//! - **Segment**: region + semaphore lifecycle and access ([`SharedSegment`])
//! - **Registry**: enumeration and cleanup of live segments ([`registry`])
//!
//! ```no_run
//! use shmem_value::{SharedSegment, Value};
//!
//! let mut owner = SharedSegment::builder("beta").value(-125).capacity(1024).create()?;
//! let mut reader = SharedSegment::open("beta")?;
//! assert_eq!(reader.get_value()?, Some(Value::Integer(-125)));
//!
//! owner.set_value(200_000)?;
//! assert_eq!(reader.get_value()?, Some(Value::Integer(200_000)));
//! owner.close()?;
//! # Ok::<(), shmem_value::ShmError>(())
//! ```

pub mod codec;
pub mod error;
pub mod json;
pub mod registry;
pub mod segment;
pub mod semaphore;
pub mod shm;
pub mod value;

pub use error::{FrameFault, Result, ShmError};
pub use registry::{DevShmRegistry, Registry, RegistryContext, SegmentRegistry};
pub use segment::{Role, SegmentBuilder, SegmentConfig, SegmentGuard, SharedSegment};
pub use value::{DType, DefaultValueSpec, Element, Kind, NumericArray, Value};
