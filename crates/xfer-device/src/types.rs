use std::fmt;

/// Names one accelerator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub i32);

impl DeviceId {
    /// The host. Never a valid accelerator id.
    pub const CPU: DeviceId = DeviceId(-1);

    pub fn index(self) -> Option<u32> {
        u32::try_from(self.0).ok()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::CPU {
            f.write_str("cpu")
        } else {
            write!(f, "gpu{}", self.0)
        }
    }
}

/// An address in a device's memory space.
///
/// Device pointers are plain addresses; they are only resolved against live allocations when a
/// command is issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub const fn from_addr(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer `bytes` past `self`. Saturates; an out-of-range result fails when resolved.
    pub const fn byte_add(self, bytes: u64) -> Self {
        Self(self.0.saturating_add(bytes))
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}
