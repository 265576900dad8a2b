//! Device-side primitives for the transfer engine.
//!
//! This crate models the accelerator that transfers run against:
//! - [`Platform`] / [`DeviceContext`]: the configured devices and per-device shared state.
//! - [`DeviceMemory`]: device allocations addressed by [`DevicePtr`].
//! - [`Queue`]: an ordered command stream run by an independent engine (a worker thread per
//!   queue, or inline execution on host-only platforms).
//! - [`Marker`]: a completion marker recorded on a queue and waited on by the host or by
//!   another queue.
//!
//! Nothing here knows about transfer directions or element types; see `xfer-engine`.

#![warn(unsafe_op_in_unsafe_fn)]

mod config;
mod context;
mod error;
mod marker;
mod memory;
mod platform;
mod queue;
mod types;

pub use config::{
    BackendKind, ConfigError, PlatformConfig, BACKEND_ENV, DEFAULT_DEVICE_MEMORY_BYTES,
    DEVICE_COUNT_ENV, DEVICE_MEMORY_MB_ENV, FORCE_BLOCKING_ENV, MAX_DEVICE_COUNT,
};
pub use context::{DeviceContext, SharedQueueKey};
pub use error::{DeviceError, Result};
pub use marker::Marker;
pub use memory::{DeviceAllocation, DeviceMemory, ALLOCATION_ALIGNMENT};
pub use platform::Platform;
pub use queue::{Queue, QueueRole};
pub use types::{DeviceId, DevicePtr};
