//! Error types.

use thiserror::Error;

/// An error reported by a [`MemoryDevice`](crate::MemoryDevice).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum DeviceError {
    /// The host ran out of memory while servicing the request.
    #[error("out of host memory")]
    OutOfHostMemory,

    /// The device ran out of memory.
    #[error("out of device memory")]
    OutOfDeviceMemory,

    /// The device refuses to create more memory objects.
    #[error("too many device memory objects exist already")]
    TooManyObjects,

    /// Mapping the memory into the host address space failed.
    #[error("failed to map device memory")]
    MemoryMapFailed,
}

/// Error returned when an allocation cannot be made.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum AllocationError {
    /// There is not enough memory on the host.
    #[error("out of host memory")]
    OutOfHostMemory,

    /// No placement was found and no new memory could be obtained. Also
    /// returned for requests too large for the block list's blocks.
    #[error("out of device memory")]
    OutOfDeviceMemory,

    /// The eviction pass gave up after its bounded number of attempts, or the
    /// device refuses to create more memory objects.
    #[error("too many objects")]
    TooManyObjects,

    /// The allocation asked to be mapped and mapping failed.
    #[error("failed to map memory")]
    MemoryMapFailed,

    /// More than one placement strategy flag was set.
    #[error("more than one allocation strategy was requested")]
    InvalidStrategy,

    /// A request parameter or flag combination is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No memory type satisfies the requirements.
    #[error("no memory type satisfies the requirements")]
    NoSuitableMemoryType,

    /// The pool does not exist (anymore).
    #[error("unknown memory pool")]
    UnknownPool,

    /// The operation is not supported by this allocator.
    #[error("{0} is not supported")]
    FeatureNotPresent(&'static str),
}

impl From<DeviceError> for AllocationError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::OutOfHostMemory => AllocationError::OutOfHostMemory,
            DeviceError::OutOfDeviceMemory => AllocationError::OutOfDeviceMemory,
            DeviceError::TooManyObjects => AllocationError::TooManyObjects,
            DeviceError::MemoryMapFailed => AllocationError::MemoryMapFailed,
        }
    }
}

/// Error returned by map and unmap operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum MapError {
    /// The device failed to map the memory.
    #[error("device failed to map memory: {0}")]
    Device(#[from] DeviceError),

    /// Allocations that can become lost may be evicted at any time and cannot
    /// be mapped.
    #[error("allocations that can become lost cannot be mapped")]
    EvictableAllocation,

    /// The allocation has been evicted.
    #[error("the allocation is lost")]
    Lost,

    /// Unmap was called more times than map.
    #[error("memory is not mapped")]
    NotMapped,

    /// The map reference count would overflow.
    #[error("too many outstanding mappings")]
    TooManyMappings,

    /// The pool that owns the allocation no longer exists.
    #[error("unknown memory pool")]
    UnknownPool,
}

/// An internal consistency check failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
#[error("validation failed: {reason}")]
pub struct ValidationError {
    /// What was found to be inconsistent.
    pub reason: &'static str,
}

/// Returns a [`ValidationError`] from the enclosing function when `$cond`
/// does not hold.
macro_rules! ensure {
    ( $cond:expr , $reason:expr $(,)? ) => {{
        if !$cond {
            log::error!("check failed: `{}`: {}", stringify!($cond), $reason);
            return Err($crate::error::ValidationError { reason: $reason });
        }
    }};
}
pub(crate) use ensure;
