//! Error types shared across the crate.
//!
//! Configuration-time errors carry names so diagnostics can point at the
//! offending class or signal. Errors produced on the real-time path are
//! `Copy` and carry no heap data.

use thiserror::Error;

/// Failures of the `ReferenceContainer` structural operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContainerError {
    #[error("timed out waiting for the container lock")]
    LockTimeout,
    #[error("attempted to insert an invalid reference")]
    InvalidReference,
    #[error("path `{0}` not found")]
    PathNotFound(String),
    #[error("`{0}` exists but is not a container")]
    NotAContainer(String),
    #[error("index {index} out of range (size {size})")]
    IndexOutOfRange { index: usize, size: usize },
    #[error("a path search needs a single occurrence")]
    AmbiguousPath,
}

/// Fatal setup errors. Raised before any real-time execution begins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("{owner}: signal `{signal}` not found in data source `{data_source}`")]
    UnresolvedSignal {
        owner: String,
        signal: String,
        data_source: String,
    },
    #[error("unknown type `{0}`")]
    UnknownType(String),
    #[error("signal `{signal}`: type `{gam_type}` does not match data source type `{data_source_type}`")]
    TypeMismatch {
        signal: String,
        gam_type: String,
        data_source_type: String,
    },
    #[error("signal `{signal}`: expected {expected} bytes but resolved {actual}")]
    SizeMismatch {
        signal: String,
        expected: usize,
        actual: usize,
    },
    #[error("broker {owner}: `{signal}` cannot synchronise, `{existing}` already does")]
    DuplicateSynchronisingSignal {
        owner: String,
        signal: String,
        existing: String,
    },
    #[error("signal `{signal}`: invalid sample geometry: {reason}")]
    InvalidSampleGeometry { signal: String, reason: String },
    #[error("signal `{signal}`: invalid block geometry: {reason}")]
    InvalidBlockGeometry { signal: String, reason: String },
    #[error("class `{0}` is not registered")]
    UnknownClass(String),
    #[error("{object}: missing parameter `{parameter}`")]
    MissingParameter { object: String, parameter: String },
    #[error("{object}: {reason}")]
    InvalidParameter { object: String, reason: String },
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("duplicate name `{0}`")]
    DuplicateName(String),
    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// Failure of a single bounds-checked byte copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CopyError {
    #[error("copy of {len} bytes at offset {offset} exceeds buffer of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
}

/// Runtime broker failures. Returned from `read`/`write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker used before finalise")]
    NotFinalised,
    #[error("synchronising wait timed out")]
    SyncTimeout,
    #[error("no memory for buffer index {0}")]
    BufferIndex(usize),
    #[error("no free asynchronous output buffer")]
    Overrun,
    #[error("output broker is in use by another thread")]
    Busy,
    #[error(transparent)]
    Copy(#[from] CopyError),
}

/// What went wrong inside one executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("broker failed: {0}")]
    Broker(#[from] BrokerError),
    #[error("GAM logic reported failure")]
    Logic,
}

/// First failure of a cycle, tagged with the executable slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("executable {slot} failed: {cause}")]
pub struct ExecutionError {
    pub slot: usize,
    pub cause: StepError,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("scheduler not configured for buffer {0}")]
    NotConfigured(usize),
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("buffer index {0} is out of range")]
    InvalidBuffer(usize),
    #[error("buffer {0} is in use by the running state")]
    BufferInUse(usize),
    #[error("scheduler is not running")]
    NotRunning,
    #[error("unknown state `{0}`")]
    UnknownState(String),
    #[error("failed to spawn thread `{thread}`: {reason}")]
    Spawn { thread: String, reason: String },
    #[error("thread `{0}` panicked")]
    ThreadPanicked(String),
    #[error("threads did not stop within {0} ms")]
    StopTimeout(u64),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplicationError {
    #[error("unknown state `{0}`")]
    UnknownState(String),
    #[error("application `{0}` has no scheduler")]
    NotConfigured(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
