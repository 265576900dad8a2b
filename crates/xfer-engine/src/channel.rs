//! The granular (untyped, byte-oriented) transfer channel.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};
use xfer_device::{DeviceContext, DeviceId, DevicePtr, Marker, Platform, Queue, QueueRole};

use crate::direction::{ChannelState, Direction, DirectionTracker, ProtocolViolation};
use crate::error::{Result, TransferError};
use crate::stats::TransferStats;

/// The six-call transfer contract shared by every channel kind.
///
/// Per direction the caller issues one or more copies, records once, then waits before
/// touching the buffers. Violations of that order are reported as
/// [`TransferError::Protocol`].
pub trait DataTransferer {
    /// Enqueue a copy of `num_elements * element_size` bytes from device memory at `src` to
    /// host memory at `dst`. Returns without waiting for the copy.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for that many byte writes and must not be read, written or freed
    /// until [`DataTransferer::wait_for_device_to_host_copy`] has returned after a record that
    /// follows this copy.
    unsafe fn copy_device_to_host_async(
        &mut self,
        src: DevicePtr,
        num_elements: usize,
        element_size: usize,
        dst: *mut u8,
    ) -> Result<()>;

    /// Record the fetch marker after the most recent fetch copy.
    fn record_device_to_host_copy(&mut self) -> Result<()>;

    /// Block until the fetch marker has been reached.
    fn wait_for_device_to_host_copy(&mut self) -> Result<()>;

    /// Enqueue a copy of `num_elements * element_size` bytes from host memory at `src` to
    /// device memory at `dst`. Returns without waiting for the copy.
    ///
    /// # Safety
    ///
    /// `src` must be valid for that many byte reads and must not be written or freed until
    /// [`DataTransferer::wait_for_host_to_device_copy`] has returned after a record that
    /// follows this copy.
    unsafe fn copy_host_to_device_async(
        &mut self,
        src: *const u8,
        num_elements: usize,
        element_size: usize,
        dst: DevicePtr,
    ) -> Result<()>;

    /// Record the assign marker after the most recent assign copy.
    fn record_host_to_device_copy(&mut self) -> Result<()>;

    /// Block until the assign marker has been reached.
    fn wait_for_host_to_device_copy(&mut self) -> Result<()>;
}

/// Validate a copy request and return its length in bytes.
pub(crate) fn transfer_len(
    direction: Direction,
    device_ptr: DevicePtr,
    host_is_null: bool,
    num_elements: usize,
    element_size: usize,
) -> Result<usize> {
    if num_elements == 0 || element_size == 0 {
        return Err(TransferError::EmptyTransfer {
            direction,
            num_elements,
            element_size,
        });
    }
    if device_ptr.is_null() {
        return Err(TransferError::NullBuffer {
            direction,
            side: "device",
        });
    }
    if host_is_null {
        return Err(TransferError::NullBuffer {
            direction,
            side: "host",
        });
    }
    num_elements
        .checked_mul(element_size)
        .ok_or(TransferError::SizeOverflow {
            direction,
            num_elements,
            element_size,
        })
}

struct Lane {
    queue: Arc<Queue>,
    marker: Marker,
    tracker: DirectionTracker,
}

impl Lane {
    fn new(device: DeviceId, direction: Direction, queue: Arc<Queue>) -> Self {
        let marker = Marker::new(format!(
            "{device}/{}/{}-complete",
            queue.label(),
            direction.as_str()
        ));
        Self {
            queue,
            marker,
            tracker: DirectionTracker::default(),
        }
    }
}

/// Moves raw bytes between host and device on two copy queues, one per direction, each with
/// its own completion marker.
///
/// With `blocking` set every copy returns only after its data has moved, and waits return
/// immediately; the copy → record → wait protocol is still enforced.
///
/// Operations take `&mut self`: a channel is driven by one thread at a time.
pub struct GranularTransferChannel {
    device: Arc<DeviceContext>,
    blocking: bool,
    fetch: Lane,
    assign: Lane,
    stats: TransferStats,
}

impl GranularTransferChannel {
    /// Open a channel on `device` with two private copy queues.
    pub fn new(platform: &Platform, device: DeviceId, blocking: bool) -> Result<Self> {
        let construction = |source| TransferError::Construction { device, source };
        let ctx = platform.device(device).map_err(construction)?;
        let fetch = ctx.create_queue(QueueRole::Fetch).map_err(construction)?;
        let assign = ctx.create_queue(QueueRole::Assign).map_err(construction)?;
        Ok(Self::with_queues(ctx, Arc::new(fetch), Arc::new(assign), blocking))
    }

    /// A channel whose directions run on the given (possibly shared, possibly identical)
    /// queues. The platform's `force_blocking` overrides `blocking`.
    pub(crate) fn with_queues(
        device: Arc<DeviceContext>,
        fetch: Arc<Queue>,
        assign: Arc<Queue>,
        blocking: bool,
    ) -> Self {
        let blocking = blocking || device.force_blocking();
        let id = device.id();
        debug!(
            device = %id,
            blocking,
            fetch_queue = fetch.label(),
            assign_queue = assign.label(),
            "transfer channel created"
        );
        Self {
            device,
            blocking,
            fetch: Lane::new(id, Direction::Fetch, fetch),
            assign: Lane::new(id, Direction::Assign, assign),
            stats: TransferStats::new(),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device.id()
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn state(&self, direction: Direction) -> ChannelState {
        self.lane(direction).tracker.state()
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    fn lane(&self, direction: Direction) -> &Lane {
        match direction {
            Direction::Fetch => &self.fetch,
            Direction::Assign => &self.assign,
        }
    }

    pub(crate) fn queue(&self, direction: Direction) -> &Arc<Queue> {
        &self.lane(direction).queue
    }

    pub(crate) fn marker(&self, direction: Direction) -> &Marker {
        &self.lane(direction).marker
    }

    pub(crate) fn ever_recorded(&self, direction: Direction) -> bool {
        self.lane(direction).tracker.ever_recorded()
    }

    pub(crate) fn protocol_error(
        &self,
        direction: Direction,
        violation: ProtocolViolation,
    ) -> TransferError {
        warn!(device = %self.device.id(), %direction, %violation, "transfer protocol violation");
        self.stats.inc_protocol_violations();
        TransferError::Protocol {
            direction,
            violation,
        }
    }

    fn after_copy(&mut self, direction: Direction, bytes: usize) -> Result<()> {
        self.stats.record_copy(direction, bytes);
        let blocking = self.blocking;
        let lane = match direction {
            Direction::Fetch => &mut self.fetch,
            Direction::Assign => &mut self.assign,
        };
        lane.tracker.on_copy();

        if blocking {
            let failed = |source| TransferError::CopyFailed { direction, source };
            lane.queue.record(&lane.marker).map_err(failed)?;
            lane.marker.wait().map_err(failed)?;
        }
        Ok(())
    }

    /// See [`DataTransferer::copy_device_to_host_async`].
    ///
    /// # Safety
    ///
    /// See [`DataTransferer::copy_device_to_host_async`].
    pub unsafe fn copy_device_to_host_async(
        &mut self,
        src: DevicePtr,
        num_elements: usize,
        element_size: usize,
        dst: *mut u8,
    ) -> Result<()> {
        let direction = Direction::Fetch;
        let len = transfer_len(direction, src, dst.is_null(), num_elements, element_size)?;
        // SAFETY: forwarded from the caller.
        unsafe { self.fetch.queue.copy_device_to_host(src, len, dst) }
            .map_err(|source| TransferError::CopyFailed { direction, source })?;
        self.after_copy(direction, len)
    }

    /// See [`DataTransferer::copy_host_to_device_async`].
    ///
    /// # Safety
    ///
    /// See [`DataTransferer::copy_host_to_device_async`].
    pub unsafe fn copy_host_to_device_async(
        &mut self,
        src: *const u8,
        num_elements: usize,
        element_size: usize,
        dst: DevicePtr,
    ) -> Result<()> {
        let direction = Direction::Assign;
        let len = transfer_len(direction, dst, src.is_null(), num_elements, element_size)?;
        // SAFETY: forwarded from the caller.
        unsafe { self.assign.queue.copy_host_to_device(src, len, dst) }
            .map_err(|source| TransferError::CopyFailed { direction, source })?;
        self.after_copy(direction, len)
    }

    fn record(&mut self, direction: Direction) -> Result<()> {
        if let Err(violation) = self.lane(direction).tracker.check_record() {
            return Err(self.protocol_error(direction, violation));
        }

        let lane = match direction {
            Direction::Fetch => &mut self.fetch,
            Direction::Assign => &mut self.assign,
        };
        lane.queue
            .record(&lane.marker)
            .map_err(|source| TransferError::CopyFailed { direction, source })?;
        lane.tracker.on_record();
        trace!(queue = lane.queue.label(), %direction, "recorded completion marker");
        Ok(())
    }

    fn wait(&mut self, direction: Direction) -> Result<()> {
        if let Err(violation) = self.lane(direction).tracker.check_wait() {
            return Err(self.protocol_error(direction, violation));
        }

        let lane = match direction {
            Direction::Fetch => &mut self.fetch,
            Direction::Assign => &mut self.assign,
        };
        lane.marker
            .wait()
            .map_err(|source| TransferError::CopyFailed { direction, source })?;
        lane.tracker.on_wait();
        self.stats.inc_waits();
        trace!(%direction, "completion marker reached");
        Ok(())
    }

    pub fn record_device_to_host_copy(&mut self) -> Result<()> {
        self.record(Direction::Fetch)
    }

    pub fn wait_for_device_to_host_copy(&mut self) -> Result<()> {
        self.wait(Direction::Fetch)
    }

    pub fn record_host_to_device_copy(&mut self) -> Result<()> {
        self.record(Direction::Assign)
    }

    pub fn wait_for_host_to_device_copy(&mut self) -> Result<()> {
        self.wait(Direction::Assign)
    }
}

impl DataTransferer for GranularTransferChannel {
    unsafe fn copy_device_to_host_async(
        &mut self,
        src: DevicePtr,
        num_elements: usize,
        element_size: usize,
        dst: *mut u8,
    ) -> Result<()> {
        // SAFETY: same contract.
        unsafe {
            GranularTransferChannel::copy_device_to_host_async(
                self,
                src,
                num_elements,
                element_size,
                dst,
            )
        }
    }

    fn record_device_to_host_copy(&mut self) -> Result<()> {
        GranularTransferChannel::record_device_to_host_copy(self)
    }

    fn wait_for_device_to_host_copy(&mut self) -> Result<()> {
        GranularTransferChannel::wait_for_device_to_host_copy(self)
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
            GranularTransferChannel::copy_host_to_device_async(
                self,
                src,
                num_elements,
                element_size,
                dst,
            )
        }
    }

    fn record_host_to_device_copy(&mut self) -> Result<()> {
        GranularTransferChannel::record_host_to_device_copy(self)
    }

    fn wait_for_host_to_device_copy(&mut self) -> Result<()> {
        GranularTransferChannel::wait_for_host_to_device_copy(self)
    }
}

impl fmt::Debug for GranularTransferChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GranularTransferChannel")
            .field("device", &self.device.id())
            .field("blocking", &self.blocking)
            .field("fetch_queue", &self.fetch.queue.label())
            .field("fetch_state", &self.fetch.tracker.state())
            .field("assign_queue", &self.assign.queue.label())
            .field("assign_state", &self.assign.tracker.state())
            .finish()
    }
}
