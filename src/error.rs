//! Error types for shmem_value

use crate::value::Kind;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for shmem_value operations
pub type Result<T> = std::result::Result<T, ShmError>;

/// Errors that can occur in shmem_value operations
#[derive(Debug, Error)]
pub enum ShmError {
    /// Both or neither of an explicit value and a JSON source were given
    #[error("exactly one of an initial value or a JSON path must be given to an owner, and neither to a reader")]
    MultiInput,

    /// Write of a value whose kind differs from the segment's declared kind
    #[error("type mismatch: segment holds {expected}, got {got}")]
    TypeMismatch { expected: Kind, got: Kind },

    /// Encoded value does not fit in the segment
    #[error("capacity exceeded: segment holds {capacity} bytes, value needs {required} bytes")]
    CapacityExceeded { capacity: usize, required: usize },

    /// Malformed frame in a buffer or mapped region
    #[error("malformed frame at byte {offset}: {fault}")]
    FrameFormat { offset: usize, fault: FrameFault },

    /// Value cannot be represented in the wire format
    #[error("cannot encode value: {0}")]
    EncodingType(String),

    /// Owner creation collided with a live segment
    #[error("shared memory '{name}' already exists")]
    AlreadyExists { name: String },

    /// Reader attach to a segment nobody created
    #[error("shared memory '{name}' is not defined")]
    NotFound { name: String },

    /// Prefixed OS object name is over the portable limit
    #[error("name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Name reserved for the registry meta-segment
    #[error("shared memory name '{name}' is reserved for the segment registry")]
    ReservedName { name: String },

    /// Semaphore not acquired in time; nothing was changed
    #[error("timed out after {timeout:?} waiting for the lock of '{name}'")]
    LockTimeout { name: String, timeout: Duration },

    /// Indexed access on a value that has no elements
    #[error("values of kind {kind} cannot be indexed")]
    NotIndexable { kind: Kind },

    /// Mapping lookup missed
    #[error("key not found")]
    KeyNotFound,

    /// List/tuple/string index outside the value
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Named semaphore operation failed
    #[error("semaphore '{name}' failed: {source}")]
    Semaphore {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ShmError {
    /// Errors a polling caller can simply retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, ShmError::LockTimeout { .. } | ShmError::NotFound { .. })
    }

    pub(crate) fn frame(offset: usize, fault: FrameFault) -> Self {
        ShmError::FrameFormat { offset, fault }
    }
}

/// What exactly was wrong with a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameFault {
    MissingBegin,
    MissingEnd,
    /// The CLOSED sentinel sits where a live value was expected
    Closed,
    UnknownTag(u8),
    /// A declared length runs past the available bytes
    Truncated { needed: usize, available: usize },
    BadScalarLength { expected: usize, got: usize },
    InvalidBool(u8),
    InvalidUtf8,
    /// A complex payload whose parts are not float frames
    BadComplex(u8),
    BadArray(String),
    DuplicateKey,
    NonScalarKey(u8),
    TooDeep,
    TrailingBytes(usize),
}

impl fmt::Display for FrameFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameFault::MissingBegin => write!(f, "missing BEGIN marker"),
            FrameFault::MissingEnd => write!(f, "missing END marker"),
            FrameFault::Closed => write!(f, "segment carries the CLOSED sentinel"),
            FrameFault::UnknownTag(tag) => write!(f, "unknown type tag 0x{tag:02X}"),
            FrameFault::Truncated { needed, available } => {
                write!(f, "declared length needs {needed} bytes, {available} available")
            }
            FrameFault::BadScalarLength { expected, got } => {
                write!(f, "scalar payload must be {expected} bytes, got {got}")
            }
            FrameFault::InvalidBool(b) => write!(f, "invalid bool byte 0x{b:02X}"),
            FrameFault::InvalidUtf8 => write!(f, "string payload is not UTF-8"),
            FrameFault::BadComplex(tag) => {
                write!(f, "complex part has tag 0x{tag:02X}, expected a float frame")
            }
            FrameFault::BadArray(why) => write!(f, "bad numeric array: {why}"),
            FrameFault::DuplicateKey => write!(f, "duplicate mapping key"),
            FrameFault::NonScalarKey(tag) => {
                write!(f, "mapping key with non-scalar tag 0x{tag:02X}")
            }
            FrameFault::TooDeep => write!(f, "nesting too deep"),
            FrameFault::TrailingBytes(n) => write!(f, "{n} bytes after END marker"),
        }
    }
}
