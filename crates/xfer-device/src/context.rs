use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::config::BackendKind;
use crate::error::Result;
use crate::memory::{DeviceAllocation, DeviceMemory};
use crate::queue::{Queue, QueueRole};
use crate::DeviceId;

/// Key of a lazily created queue shared by every user on one device.
///
/// `scope` groups users: an element type name for per-type compute/fetch/assign queues,
/// `"prefetch"` for the prefetch queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SharedQueueKey {
    pub scope: &'static str,
    pub role: QueueRole,
}

impl SharedQueueKey {
    pub const fn new(scope: &'static str, role: QueueRole) -> Self {
        Self { scope, role }
    }
}

/// One accelerator: its memory, and the queues shared by everything that runs on it.
///
/// Obtained from [`crate::Platform::device`]; the caller owns it.
pub struct DeviceContext {
    id: DeviceId,
    backend: BackendKind,
    force_blocking: bool,
    memory: Arc<DeviceMemory>,
    shared: Mutex<HashMap<SharedQueueKey, Arc<Queue>>>,
    next_queue: AtomicU64,
}

impl DeviceContext {
    pub(crate) fn new(
        id: DeviceId,
        window: u32,
        backend: BackendKind,
        memory_bytes: u64,
        force_blocking: bool,
    ) -> Self {
        debug!(device = %id, %backend, memory_bytes, "opening device");
        Self {
            id,
            backend,
            force_blocking,
            memory: Arc::new(DeviceMemory::new(id, window, memory_bytes)),
            shared: Mutex::new(HashMap::new()),
            next_queue: AtomicU64::new(0),
        }
    }

    fn lock_shared(&self) -> MutexGuard<'_, HashMap<SharedQueueKey, Arc<Queue>>> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Whether the platform asked for every channel on this device to block.
    pub fn force_blocking(&self) -> bool {
        self.force_blocking
    }

    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }

    pub fn allocate(&self, len: u64) -> Result<DeviceAllocation> {
        self.memory.allocate(len)
    }

    /// Create a queue owned by the caller.
    pub fn create_queue(&self, role: QueueRole) -> Result<Queue> {
        let n = self.next_queue.fetch_add(1, Ordering::Relaxed);
        let label = format!("{role}#{n}");
        debug!(device = %self.id, queue = %label, "creating queue");
        Queue::new(self.backend, Arc::clone(&self.memory), role, label)
    }

    /// The queue registered under `key`, created on first use.
    ///
    /// Creation happens under the registry lock: the first caller creates the queue, every
    /// later caller (on any thread) gets the same one. Shared queues live as long as the
    /// context.
    pub fn shared_queue(&self, key: SharedQueueKey) -> Result<Arc<Queue>> {
        let mut shared = self.lock_shared();
        if let Some(queue) = shared.get(&key) {
            return Ok(Arc::clone(queue));
        }

        let label = format!("{}/{}", key.scope, key.role);
        debug!(device = %self.id, queue = %label, "creating shared queue");
        let queue = Arc::new(Queue::new(
            self.backend,
            Arc::clone(&self.memory),
            key.role,
            label,
        )?);
        shared.insert(key, Arc::clone(&queue));
        Ok(queue)
    }

    pub fn shared_queue_count(&self) -> usize {
        self.lock_shared().len()
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::thread;

    fn context(backend: BackendKind) -> Arc<DeviceContext> {
        Arc::new(DeviceContext::new(DeviceId(0), 0, backend, 1 << 20, false))
    }

    #[test]
    fn shared_queue_is_created_once() {
        let ctx = context(BackendKind::Emulated);
        let key = SharedQueueKey::new("float", QueueRole::Compute);
        let a = ctx.shared_queue(key).unwrap();
        let b = ctx.shared_queue(key).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.label(), "float/compute");
        assert_eq!(ctx.shared_queue_count(), 1);
    }

    #[test]
    fn shared_queue_keys_are_distinct_per_scope_and_role() {
        let ctx = context(BackendKind::HostOnly);
        let compute = ctx
            .shared_queue(SharedQueueKey::new("float", QueueRole::Compute))
            .unwrap();
        let fetch = ctx
            .shared_queue(SharedQueueKey::new("float", QueueRole::Fetch))
            .unwrap();
        let other = ctx
            .shared_queue(SharedQueueKey::new("double", QueueRole::Compute))
            .unwrap();
        assert!(!Arc::ptr_eq(&compute, &fetch));
        assert!(!Arc::ptr_eq(&compute, &other));
        assert_eq!(ctx.shared_queue_count(), 3);
    }

    #[test]
    fn concurrent_first_use_yields_one_queue() {
        let ctx = context(BackendKind::Emulated);
        let key = SharedQueueKey::new("prefetch", QueueRole::Prefetch);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                thread::spawn(move || ctx.shared_queue(key).unwrap())
            })
            .collect();
        let queues: Vec<Arc<Queue>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(queues.iter().all(|q| Arc::ptr_eq(q, &queues[0])));
        assert_eq!(ctx.shared_queue_count(), 1);
    }

    #[test]
    fn private_queues_get_unique_labels() {
        let ctx = context(BackendKind::HostOnly);
        let a = ctx.create_queue(QueueRole::Fetch).unwrap();
        let b = ctx.create_queue(QueueRole::Fetch).unwrap();
        assert_ne!(a.label(), b.label());
        assert_eq!(a.role(), QueueRole::Fetch);
    }
}
