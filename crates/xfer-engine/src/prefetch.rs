use std::sync::Arc;

use xfer_device::{DeviceId, DevicePtr, Platform, Queue, QueueRole, SharedQueueKey};

use crate::channel::{DataTransferer, GranularTransferChannel};
use crate::direction::{ChannelState, Direction};
use crate::error::{Result, TransferError};
use crate::stats::TransferStats;

const PREFETCH_QUEUE: SharedQueueKey = SharedQueueKey::new("prefetch", QueueRole::Prefetch);

/// A transfer channel on the device's prefetch queue.
///
/// Both directions share that one queue, so prefetch traffic stays ordered with itself and
/// never waits behind compute or other channels' copies.
#[derive(Debug)]
pub struct PrefetchChannel {
    channel: GranularTransferChannel,
}

impl PrefetchChannel {
    pub fn new(platform: &Platform, device: DeviceId) -> Result<Self> {
        let construction = |source| TransferError::Construction { device, source };
        let ctx = platform.device(device).map_err(construction)?;
        let queue = ctx.shared_queue(PREFETCH_QUEUE).map_err(construction)?;
        Ok(Self {
            channel: GranularTransferChannel::with_queues(ctx, Arc::clone(&queue), queue, false),
        })
    }

    /// The prefetch queue of `device`, created on first use.
    pub fn shared_queue(platform: &Platform, device: DeviceId) -> Result<Arc<Queue>> {
        let construction = |source| TransferError::Construction { device, source };
        platform
            .device(device)
            .map_err(construction)?
            .shared_queue(PREFETCH_QUEUE)
            .map_err(construction)
    }

    pub fn device_id(&self) -> DeviceId {
        self.channel.device_id()
    }

    pub fn state(&self, direction: Direction) -> ChannelState {
        self.channel.state(direction)
    }

    pub fn stats(&self) -> &TransferStats {
        self.channel.stats()
    }
}

impl DataTransferer for PrefetchChannel {
    unsafe fn copy_device_to_host_async(
        &mut self,
        src: DevicePtr,
        num_elements: usize,
        element_size: usize,
        dst: *mut u8,
    ) -> Result<()> {
        // SAFETY: same contract.
        unsafe {
            self.channel
                .copy_device_to_host_async(src, num_elements, element_size, dst)
        }
    }

    fn record_device_to_host_copy(&mut self) -> Result<()> {
        self.channel.record_device_to_host_copy()
    }

    fn wait_for_device_to_host_copy(&mut self) -> Result<()> {
        self.channel.wait_for_device_to_host_copy()
    }

    unsafe fn copy_host_to_device_async(
        &mut self,
        src: *const u8,
        num_elements: usize,
        element_size: usize,
        dst: DevicePtr,
    ) -> Result<()> {
        // SAFETY: same contract.
        unsafe {
            self.channel
                .copy_host_to_device_async(src, num_elements, element_size, dst)
        }
    }

    fn record_host_to_device_copy(&mut self) -> Result<()> {
        self.channel.record_host_to_device_copy()
    }

    fn wait_for_host_to_device_copy(&mut self) -> Result<()> {
        self.channel.wait_for_host_to_device_copy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefetch_channels_share_one_queue_per_device() {
        let platform = Platform::host_only();
        let a = PrefetchChannel::new(&platform, DeviceId(0)).unwrap();
        let b = PrefetchChannel::new(&platform, DeviceId(0)).unwrap();

        let fetch = a.channel.queue(Direction::Fetch);
        assert!(Arc::ptr_eq(fetch, a.channel.queue(Direction::Assign)));
        assert!(Arc::ptr_eq(fetch, b.channel.queue(Direction::Fetch)));
        assert_eq!(fetch.role(), QueueRole::Prefetch);
        assert!(Arc::ptr_eq(
            fetch,
            &PrefetchChannel::shared_queue(&platform, DeviceId(0)).unwrap()
        ));
    }

    #[test]
    fn cpu_is_not_a_prefetch_device() {
        let platform = Platform::host_only();
        assert!(matches!(
            PrefetchChannel::new(&platform, DeviceId::CPU),
            Err(TransferError::Construction { .. })
        ));
    }
}
