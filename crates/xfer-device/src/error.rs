use thiserror::Error;

use crate::{DeviceId, DevicePtr};

pub type Result<T> = std::result::Result<T, DeviceError>;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("invalid device id {device} (platform exposes {device_count} device(s))")]
    InvalidDevice { device: DeviceId, device_count: u32 },

    #[error("device {device} out of memory allocating {requested} bytes ({available} bytes free)")]
    OutOfMemory {
        device: DeviceId,
        requested: u64,
        available: u64,
    },

    #[error("zero-sized allocation requested on device {0}")]
    ZeroSizedAllocation(DeviceId),

    #[error("device range {ptr}+{len} is not backed by a live allocation on device {device}")]
    InvalidAddress {
        device: DeviceId,
        ptr: DevicePtr,
        len: usize,
    },

    #[error("failed to create {what}: {reason}")]
    ResourceCreation { what: String, reason: String },

    #[error("queue `{0}` is no longer accepting commands")]
    QueueClosed(String),

    #[error("marker `{0}` was never recorded")]
    MarkerNotRecorded(String),
}
