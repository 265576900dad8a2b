use thiserror::Error;
use xfer_device::{DeviceError, DeviceId};

use crate::direction::{Direction, ProtocolViolation};

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Error)]
pub enum TransferError {
    /// The channel could not be created; nothing was allocated.
    #[error("failed to create transfer channel on device {device}")]
    Construction {
        device: DeviceId,
        #[source]
        source: DeviceError,
    },

    /// The copy → record → wait sequence was not respected. Nothing was submitted.
    #[error("{direction}: {violation}")]
    Protocol {
        direction: Direction,
        violation: ProtocolViolation,
    },

    /// The copy (or its record/wait) could not be issued. Destination contents are undefined.
    #[error("{direction} copy failed")]
    CopyFailed {
        direction: Direction,
        #[source]
        source: DeviceError,
    },

    #[error("{direction}: null {side} buffer")]
    NullBuffer {
        direction: Direction,
        side: &'static str,
    },

    #[error("{direction}: empty transfer ({num_elements} elements of {element_size} bytes)")]
    EmptyTransfer {
        direction: Direction,
        num_elements: usize,
        element_size: usize,
    },

    #[error("{direction}: {num_elements} elements of {element_size} bytes overflows usize")]
    SizeOverflow {
        direction: Direction,
        num_elements: usize,
        element_size: usize,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),
}
