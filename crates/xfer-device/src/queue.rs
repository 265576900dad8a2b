//! Command queues.
//!
//! A [`Queue`] is an ordered stream of commands executed by an engine that is independent of
//! the submitting thread. Commands on one queue run in submission order; commands on different
//! queues are unordered unless one queue waits on a [`Marker`] recorded on another.
//!
//! Two engines implement the queue capability:
//! - `ThreadedEngine`: a dedicated worker thread per queue, standing in for a hardware copy
//!   engine. Submission never blocks on execution.
//! - `InlineEngine`: runs every command to completion on the submitting thread (host-only
//!   platforms).

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, trace};

use crate::config::BackendKind;
use crate::error::{DeviceError, Result};
use crate::marker::{Marker, MarkerInner};
use crate::memory::{DeviceMemory, Region};
use crate::{DeviceId, DevicePtr};

/// What a queue is used for. Only affects labels and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Compute,
    Fetch,
    Assign,
    Prefetch,
}

impl QueueRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::Fetch => "fetch",
            Self::Assign => "assign",
            Self::Prefetch => "prefetch",
        }
    }
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) struct HostPtr(*const u8);
pub(crate) struct HostPtrMut(*mut u8);

// SAFETY: host pointers only travel to the worker that performs the copy; keeping the pointee
// alive and untouched until the copy's marker is reached is the submitter's `unsafe` contract.
unsafe impl Send for HostPtr {}
unsafe impl Send for HostPtrMut {}

pub(crate) enum Command {
    CopyToHost {
        region: Arc<Region>,
        offset: usize,
        dst: HostPtrMut,
        len: usize,
    },
    CopyFromHost {
        src: HostPtr,
        region: Arc<Region>,
        offset: usize,
        len: usize,
    },
    Signal {
        marker: Arc<MarkerInner>,
        ticket: u64,
    },
    WaitMarker {
        marker: Arc<MarkerInner>,
        ticket: u64,
    },
    Task(Box<dyn FnOnce() + Send + 'static>),
}

impl Command {
    fn execute(self, queue: &str) {
        match self {
            Command::CopyToHost {
                region,
                offset,
                dst,
                len,
            } => {
                // SAFETY: range validated at issue; host pointer per the submit contract.
                unsafe { region.copy_to_host(offset, dst.0, len) };
            }
            Command::CopyFromHost {
                src,
                region,
                offset,
                len,
            } => {
                // SAFETY: as above.
                unsafe { region.copy_from_host(offset, src.0, len) };
            }
            Command::Signal { marker, ticket } => marker.signal(ticket),
            Command::WaitMarker { marker, ticket } => marker.wait_ticket(ticket),
            Command::Task(task) => {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!(queue, "queued task panicked; continuing with the next command");
                }
            }
        }
    }
}

/// Executes queue commands.
pub(crate) trait Engine: Send + Sync {
    fn submit(&self, command: Command) -> Result<()>;
}

pub(crate) struct InlineEngine {
    label: String,
}

impl Engine for InlineEngine {
    fn submit(&self, command: Command) -> Result<()> {
        command.execute(&self.label);
        Ok(())
    }
}

pub(crate) struct ThreadedEngine {
    label: String,
    sender: Option<mpsc::Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedEngine {
    fn spawn(thread_name: String, label: String) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let worker_label = label.clone();
        let worker = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                for command in receiver {
                    command.execute(&worker_label);
                }
            })
            .map_err(|err| DeviceError::ResourceCreation {
                what: format!("queue `{label}`"),
                reason: err.to_string(),
            })?;

        Ok(Self {
            label,
            sender: Some(sender),
            worker: Some(worker),
        })
    }
}

impl Engine for ThreadedEngine {
    fn submit(&self, command: Command) -> Result<()> {
        let closed = || DeviceError::QueueClosed(self.label.clone());
        self.sender
            .as_ref()
            .ok_or_else(closed)?
            .send(command)
            .map_err(|_| closed())
    }
}

impl Drop for ThreadedEngine {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is already queued and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(queue = %self.label, "queue worker panicked");
            }
        }
    }
}

/// An ordered command queue on one device.
///
/// Dropping the last handle drains the queue before its resources are released.
pub struct Queue {
    device: DeviceId,
    role: QueueRole,
    label: String,
    memory: Arc<DeviceMemory>,
    engine: Box<dyn Engine>,
}

impl Queue {
    pub(crate) fn new(
        backend: BackendKind,
        memory: Arc<DeviceMemory>,
        role: QueueRole,
        label: String,
    ) -> Result<Self> {
        let device = memory.device();
        let engine: Box<dyn Engine> = match backend {
            BackendKind::Emulated => Box::new(ThreadedEngine::spawn(
                format!("xfer-{device}-{label}"),
                label.clone(),
            )?),
            BackendKind::HostOnly => Box::new(InlineEngine {
                label: label.clone(),
            }),
        };
        Ok(Self {
            device,
            role,
            label,
            memory,
            engine,
        })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Enqueue a copy of `len` bytes from device memory at `src` to host memory at `dst`.
    ///
    /// The device range is resolved now; an unbacked range fails here and nothing is queued.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `len` byte writes, and must not be read, written or freed by
    /// anything else until a marker recorded after this copy has been reached.
    pub unsafe fn copy_device_to_host(
        &self,
        src: DevicePtr,
        len: usize,
        dst: *mut u8,
    ) -> Result<()> {
        let (region, offset) = self.memory.resolve(src, len)?;
        trace!(queue = %self.label, %src, len, "enqueue device->host copy");
        self.engine.submit(Command::CopyToHost {
            region,
            offset,
            dst: HostPtrMut(dst),
            len,
        })
    }

    /// Enqueue a copy of `len` bytes from host memory at `src` to device memory at `dst`.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `len` byte reads and must not be written or freed until a
    /// marker recorded after this copy has been reached.
    pub unsafe fn copy_host_to_device(
        &self,
        src: *const u8,
        len: usize,
        dst: DevicePtr,
    ) -> Result<()> {
        let (region, offset) = self.memory.resolve(dst, len)?;
        trace!(queue = %self.label, %dst, len, "enqueue host->device copy");
        self.engine.submit(Command::CopyFromHost {
            src: HostPtr(src),
            region,
            offset,
            len,
        })
    }

    /// Record `marker` after everything currently enqueued.
    ///
    /// If the queue no longer accepts commands the ticket is signalled at once, so nothing that
    /// already targets it (a host wait or another queue's `wait_marker`) blocks forever.
    pub fn record(&self, marker: &Marker) -> Result<()> {
        let inner = Arc::clone(marker.inner());
        let ticket = inner.arm();
        trace!(queue = %self.label, marker = marker.label(), ticket, "record marker");
        let submitted = self.engine.submit(Command::Signal {
            marker: Arc::clone(&inner),
            ticket,
        });
        if submitted.is_err() {
            inner.signal(ticket);
        }
        submitted
    }

    /// Make every later command on this queue wait until `marker`'s latest recording (which
    /// may live on another queue) has been reached. The calling thread does not block.
    pub fn wait_marker(&self, marker: &Marker) -> Result<()> {
        let inner = marker.inner();
        let ticket = inner
            .current_target()
            .ok_or_else(|| DeviceError::MarkerNotRecorded(marker.label().to_owned()))?;
        trace!(queue = %self.label, marker = marker.label(), ticket, "queue waits on marker");
        self.engine.submit(Command::WaitMarker {
            marker: Arc::clone(inner),
            ticket,
        })
    }

    /// Run `task` on the queue, in order with the queue's other commands.
    ///
    /// This is how compute work is modelled: a "kernel" is a closure that reads and writes
    /// [`DeviceMemory`].
    pub fn enqueue<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.engine.submit(Command::Task(Box::new(task)))
    }

    /// Block until everything enqueued so far has finished.
    pub fn synchronize(&self) -> Result<()> {
        let marker = Marker::new(format!("{}/sync", self.label));
        self.record(&marker)?;
        marker.wait()
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("device", &self.device)
            .field("role", &self.role)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn queue(backend: BackendKind, memory: &Arc<DeviceMemory>) -> Queue {
        Queue::new(backend, Arc::clone(memory), QueueRole::Fetch, "q".into()).unwrap()
    }

    fn memory() -> Arc<DeviceMemory> {
        Arc::new(DeviceMemory::new(DeviceId(0), 0, 1 << 20))
    }

    #[test]
    fn tasks_run_in_submission_order() {
        for backend in [BackendKind::Emulated, BackendKind::HostOnly] {
            let mem = memory();
            let q = queue(backend, &mem);
            let log = Arc::new(Mutex::new(Vec::new()));
            for i in 0..64 {
                let log = Arc::clone(&log);
                q.enqueue(move || log.lock().unwrap().push(i)).unwrap();
            }
            q.synchronize().unwrap();
            assert_eq!(*log.lock().unwrap(), (0..64).collect::<Vec<_>>(), "{backend}");
        }
    }

    #[test]
    fn inline_engine_completes_before_returning() {
        let mem = memory();
        let alloc = mem.allocate(4).unwrap();
        let q = queue(BackendKind::HostOnly, &mem);

        let src = [1u8, 2, 3, 4];
        unsafe { q.copy_host_to_device(src.as_ptr(), 4, alloc.ptr()).unwrap() };
        assert_eq!(alloc.to_vec().unwrap(), src);
    }

    #[test]
    fn copies_resolve_device_ranges_at_issue() {
        let mem = memory();
        let alloc = mem.allocate(4).unwrap();
        let q = queue(BackendKind::Emulated, &mem);

        let mut dst = [0u8; 8];
        let err = unsafe { q.copy_device_to_host(alloc.ptr(), 8, dst.as_mut_ptr()) }.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidAddress { len: 8, .. }));
    }

    #[test]
    fn wait_marker_orders_across_queues() {
        let mem = memory();
        let producer = queue(BackendKind::Emulated, &mem);
        let consumer = queue(BackendKind::Emulated, &mem);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let log = Arc::new(Mutex::new(Vec::new()));

        {
            let log = Arc::clone(&log);
            producer
                .enqueue(move || {
                    gate_rx.recv().unwrap();
                    log.lock().unwrap().push("produce");
                })
                .unwrap();
        }
        let marker = Marker::new("produced");
        producer.record(&marker).unwrap();
        consumer.wait_marker(&marker).unwrap();
        {
            let log = Arc::clone(&log);
            consumer.enqueue(move || log.lock().unwrap().push("consume")).unwrap();
        }

        gate_tx.send(()).unwrap();
        consumer.synchronize().unwrap();
        assert_eq!(*log.lock().unwrap(), ["produce", "consume"]);
    }

    #[test]
    fn wait_marker_requires_a_recording() {
        let mem = memory();
        let q = queue(BackendKind::Emulated, &mem);
        let marker = Marker::new("never");
        assert!(matches!(
            q.wait_marker(&marker),
            Err(DeviceError::MarkerNotRecorded(_))
        ));
    }

    #[test]
    fn panicking_task_does_not_kill_the_queue() {
        let mem = memory();
        let q = queue(BackendKind::Emulated, &mem);
        q.enqueue(|| panic!("kernel fault")).unwrap();
        q.synchronize().unwrap();
    }

    #[test]
    fn dropping_a_queue_drains_pending_commands() {
        let mem = memory();
        let alloc = mem.allocate(3).unwrap();
        let src = Box::new([7u8, 8, 9]);
        {
            let q = queue(BackendKind::Emulated, &mem);
            q.enqueue(|| std::thread::sleep(std::time::Duration::from_millis(10)))
                .unwrap();
            unsafe { q.copy_host_to_device(src.as_ptr(), 3, alloc.ptr()).unwrap() };
        }
        assert_eq!(alloc.to_vec().unwrap(), [7, 8, 9]);
    }

    struct ClosedEngine;

    impl Engine for ClosedEngine {
        fn submit(&self, _command: Command) -> Result<()> {
            Err(DeviceError::QueueClosed("closed".into()))
        }
    }

    #[test]
    fn failed_record_does_not_strand_waiters() {
        let mem = memory();
        let closed = Queue {
            device: DeviceId(0),
            role: QueueRole::Assign,
            label: "closed".into(),
            memory: Arc::clone(&mem),
            engine: Box::new(ClosedEngine),
        };
        let marker = Marker::new("assign-complete");

        assert!(matches!(closed.record(&marker), Err(DeviceError::QueueClosed(_))));

        // A queue told to wait on the marker still makes progress.
        let compute = queue(BackendKind::Emulated, &mem);
        compute.wait_marker(&marker).unwrap();
        compute.synchronize().unwrap();
        marker.wait().unwrap();
    }
}
