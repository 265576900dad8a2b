//! Asynchronous host ↔ device bulk transfers.
//!
//! Three channel kinds share one protocol: per direction, issue copies, record a completion
//! marker, then wait for it before touching the buffers.
//!
//! - [`GranularTransferChannel`]: byte-oriented copies on two private queues (fetch:
//!   device → host, assign: host → device). Copy, record and wait are separate calls.
//! - [`TypedTransfer`]: copies of one [`Element`] type, each ordered after the work already
//!   enqueued on that type's compute queue.
//! - [`PrefetchChannel`]: copies on the device's dedicated prefetch queue, isolated from
//!   compute and from other transfers.
//!
//! Device primitives (platform, memory, queues, markers) come from [`xfer_device`].

#![warn(unsafe_op_in_unsafe_fn)]

mod channel;
mod direction;
mod element;
mod error;
mod facade;
mod prefetch;
mod stats;

pub use channel::{DataTransferer, GranularTransferChannel};
pub use direction::{ChannelState, Direction, ProtocolViolation};
pub use element::Element;
pub use error::{Result, TransferError};
pub use facade::TypedTransfer;
pub use prefetch::PrefetchChannel;
pub use stats::{TransferStats, TransferStatsSnapshot};

pub use xfer_device as device;
