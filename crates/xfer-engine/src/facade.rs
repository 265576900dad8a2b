//! Element-typed transfers ordered against the per-type compute queue.

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

use tracing::trace;
use xfer_device::{DeviceId, DevicePtr, Marker, Platform, Queue, QueueRole, SharedQueueKey};

use crate::channel::{transfer_len, GranularTransferChannel};
use crate::direction::{ChannelState, Direction, ProtocolViolation};
use crate::element::Element;
use crate::error::{Result, TransferError};
use crate::stats::TransferStats;

fn shared_queue<T: Element>(
    platform: &Platform,
    device: DeviceId,
    role: QueueRole,
) -> Result<Arc<Queue>> {
    let construction = |source| TransferError::Construction { device, source };
    platform
        .device(device)
        .map_err(construction)?
        .shared_queue(SharedQueueKey::new(T::NAME, role))
        .map_err(construction)
}

/// Typed transfers of `T` elements, each copy a complete copy → record pair.
///
/// Every copy first waits, on the device, for all work enqueued on `T`'s compute queue so
/// far. Completion is observed with [`TypedTransfer::wait_for_device_to_host_async`] /
/// [`TypedTransfer::wait_for_host_to_device_async`], or handed back to the compute queue with
/// [`TypedTransfer::order_compute_after_host_to_device`].
///
/// With `use_concurrent_streams`, copies run on the fetch and assign queues shared by every
/// `TypedTransfer<T>` on the device. Without it they run on the compute queue itself.
pub struct TypedTransfer<T: Element> {
    channel: GranularTransferChannel,
    compute: Arc<Queue>,
    compute_fence: Marker,
    _element: PhantomData<fn() -> T>,
}

impl<T: Element> TypedTransfer<T> {
    pub fn new(
        platform: &Platform,
        device: DeviceId,
        use_concurrent_streams: bool,
    ) -> Result<Self> {
        let construction = |source| TransferError::Construction { device, source };
        let ctx = platform.device(device).map_err(construction)?;
        let compute = ctx
            .shared_queue(SharedQueueKey::new(T::NAME, QueueRole::Compute))
            .map_err(construction)?;
        let (fetch, assign) = if use_concurrent_streams {
            (
                ctx.shared_queue(SharedQueueKey::new(T::NAME, QueueRole::Fetch))
                    .map_err(construction)?,
                ctx.shared_queue(SharedQueueKey::new(T::NAME, QueueRole::Assign))
                    .map_err(construction)?,
            )
        } else {
            (Arc::clone(&compute), Arc::clone(&compute))
        };

        let compute_fence = Marker::new(format!("{device}/{}/compute-fence", T::NAME));
        Ok(Self {
            channel: GranularTransferChannel::with_queues(ctx, fetch, assign, false),
            compute,
            compute_fence,
            _element: PhantomData,
        })
    }

    /// The compute queue `T`'s transfers are ordered against.
    pub fn compute_queue(platform: &Platform, device: DeviceId) -> Result<Arc<Queue>> {
        shared_queue::<T>(platform, device, QueueRole::Compute)
    }

    /// The device → host queue shared by concurrent-mode `TypedTransfer<T>`s on `device`.
    pub fn fetch_queue(platform: &Platform, device: DeviceId) -> Result<Arc<Queue>> {
        shared_queue::<T>(platform, device, QueueRole::Fetch)
    }

    /// The host → device queue shared by concurrent-mode `TypedTransfer<T>`s on `device`.
    pub fn assign_queue(platform: &Platform, device: DeviceId) -> Result<Arc<Queue>> {
        shared_queue::<T>(platform, device, QueueRole::Assign)
    }

    pub fn device_id(&self) -> DeviceId {
        self.channel.device_id()
    }

    /// Whether copies run on dedicated queues rather than the compute queue.
    pub fn is_concurrent(&self) -> bool {
        !Arc::ptr_eq(self.channel.queue(Direction::Fetch), &self.compute)
    }

    pub fn state(&self, direction: Direction) -> ChannelState {
        self.channel.state(direction)
    }

    pub fn stats(&self) -> &TransferStats {
        self.channel.stats()
    }

    fn fence_against_compute(&mut self, direction: Direction) -> Result<()> {
        let queue = self.channel.queue(direction);
        if Arc::ptr_eq(queue, &self.compute) {
            return Ok(());
        }
        let failed = |source| TransferError::CopyFailed { direction, source };
        self.compute.record(&self.compute_fence).map_err(failed)?;
        queue.wait_marker(&self.compute_fence).map_err(failed)?;
        trace!(queue = queue.label(), %direction, "copy ordered after compute");
        Ok(())
    }

    /// Copy `num_elements` elements from `src` on the device into `dst`, after all compute
    /// work enqueued so far.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `num_elements` writes of `T` and must not be accessed or freed
    /// until [`TypedTransfer::wait_for_device_to_host_async`] has returned.
    pub unsafe fn copy_device_to_host_async(
        &mut self,
        src: DevicePtr,
        num_elements: usize,
        dst: *mut T,
    ) -> Result<()> {
        let direction = Direction::Fetch;
        transfer_len(direction, src, dst.is_null(), num_elements, size_of::<T>())?;
        self.fence_against_compute(direction)?;
        // SAFETY: forwarded from the caller; `T` is `Pod`, so any byte pattern is a valid `T`.
        unsafe {
            self.channel
                .copy_device_to_host_async(src, num_elements, size_of::<T>(), dst.cast())
        }?;
        self.channel.record_device_to_host_copy()
    }

    /// Copy `num_elements` elements from `src` into device memory at `dst`, after all compute
    /// work enqueued so far.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `num_elements` reads of `T` and must not be written or freed
    /// until [`TypedTransfer::wait_for_host_to_device_async`] has returned.
    pub unsafe fn copy_host_to_device_async(
        &mut self,
        src: *const T,
        num_elements: usize,
        dst: DevicePtr,
    ) -> Result<()> {
        let direction = Direction::Assign;
        transfer_len(direction, dst, src.is_null(), num_elements, size_of::<T>())?;
        self.fence_against_compute(direction)?;
        // SAFETY: forwarded from the caller.
        unsafe {
            self.channel
                .copy_host_to_device_async(src.cast(), num_elements, size_of::<T>(), dst)
        }?;
        self.channel.record_host_to_device_copy()
    }

    /// Copy `src` into device memory at `dst`.
    ///
    /// The borrow ends when this returns, so the call also waits for the copy; use
    /// [`TypedTransfer::copy_host_to_device_async`] to overlap.
    pub fn copy_from_slice(&mut self, src: &[T], dst: DevicePtr) -> Result<()> {
        // SAFETY: `src` outlives the wait below.
        unsafe { self.copy_host_to_device_async(src.as_ptr(), src.len(), dst) }?;
        self.wait_for_host_to_device_async()
    }

    /// Copy device memory at `src` into `dst` and wait for it.
    pub fn copy_to_slice(&mut self, src: DevicePtr, dst: &mut [T]) -> Result<()> {
        // SAFETY: `dst` is exclusively borrowed until the wait below returns.
        unsafe { self.copy_device_to_host_async(src, dst.len(), dst.as_mut_ptr()) }?;
        self.wait_for_device_to_host_async()
    }

    /// Block until the last device → host copy has completed.
    pub fn wait_for_device_to_host_async(&mut self) -> Result<()> {
        self.channel.wait_for_device_to_host_copy()
    }

    /// Block until the last host → device copy has completed.
    pub fn wait_for_host_to_device_async(&mut self) -> Result<()> {
        self.channel.wait_for_host_to_device_copy()
    }

    /// Make later compute work wait, on the device, for the last host → device copy.
    ///
    /// Does not block the caller and does not change the assign direction's state. Returns
    /// at once when the copy has already completed.
    pub fn order_compute_after_host_to_device(&mut self) -> Result<()> {
        let direction = Direction::Assign;
        if !self.channel.ever_recorded(direction) {
            return Err(self
                .channel
                .protocol_error(direction, ProtocolViolation::WaitWithoutRecord));
        }

        let marker = self.channel.marker(direction);
        if marker.query() || !self.is_concurrent() {
            return Ok(());
        }
        self.compute
            .wait_marker(marker)
            .map_err(|source| TransferError::CopyFailed { direction, source })?;
        trace!(compute = self.compute.label(), "compute ordered after assign");
        Ok(())
    }
}

impl<T: Element> fmt::Debug for TypedTransfer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedTransfer")
            .field("element", &T::NAME)
            .field("compute", &self.compute.label())
            .field("channel", &self.channel)
            .finish()
    }
}
