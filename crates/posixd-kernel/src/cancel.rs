//! Cancellation registry.
//!
//! Long-running waits (clock waits, descriptor polls) register a
//! [`CancelHandler`] with the [`CancelRegistry`] and receive an [`AsyncId`].
//! Any component holding that id can later abort the wait with
//! [`CancelRegistry::cancel`], without holding a reference to the waiter.
//!
//! # Two-phase protocol
//!
//! 1. **Under the shard lock**: the registry removes the node and calls
//!    [`CancelHandler::handle_cancellation`].  The handler only flips state
//!    (typically cancelling a [`CancellationToken`]); it receives no registry
//!    handle, so it cannot re-enter the registry.
//! 2. **Outside the lock**: the cancelled operation observes the flipped
//!    state on its own continuation and performs its cleanup there.
//!
//! # Locking
//!
//! Cancellation is serialised by a fixed array of shard locks indexed by the
//! async id.  The shard lock is always taken *before* the node table's own
//! locks (the [`DashMap`] shards), both by [`CancelRegistry::cancel`] and by
//! [`CancelNode::unregister`].  Once `unregister` returns, no handler for that
//! node is running or will ever run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::utils::CachePadded;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Identifier of a cancellable operation.  Never reused within a registry.
pub type AsyncId = u64;

/// Default number of cancel-lock shards.
pub const DEFAULT_LOCK_SHARDS: usize = 4;

/// Callback invoked when a registered operation is cancelled.
///
/// Runs under a lock shared with unrelated operations: it must return
/// promptly, must not block, and must not panic.  A panic is caught and
/// logged, but the operation it belonged to may then never unblock.
pub trait CancelHandler: Send + Sync + 'static {
    fn handle_cancellation(&self);
}

impl CancelHandler for CancellationToken {
    fn handle_cancellation(&self) {
        self.cancel();
    }
}

struct NodeState {
    cancel_requested: AtomicBool,
    handler: Box<dyn CancelHandler>,
}

struct RegistryInner {
    /// Serialises cancel and unregister per async id.  Taken before `nodes`.
    cancel_locks: Box<[CachePadded<Mutex<()>>]>,
    nodes: DashMap<AsyncId, Arc<NodeState>>,
    next_async_id: AtomicU64,
}

/// Process-wide table of cancellable operations.
///
/// Cheaply cloneable (`Arc`-backed); pass a clone to every component that
/// starts cancellable waits.
#[derive(Clone)]
pub struct CancelRegistry {
    inner: Arc<RegistryInner>,
}

impl CancelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_LOCK_SHARDS)
    }

    /// Create a registry with `shards` cancel locks (at least one).
    #[must_use]
    pub fn with_shards(shards: usize) -> Self {
        let shards = shards.max(1);
        let cancel_locks = (0..shards)
            .map(|_| CachePadded::new(Mutex::new(())))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            inner: Arc::new(RegistryInner {
                cancel_locks,
                nodes: DashMap::new(),
                next_async_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `handler` and return the node guarding its lifetime.
    ///
    /// Dropping the returned [`CancelNode`] unregisters it.
    pub fn register(&self, handler: impl CancelHandler) -> CancelNode {
        let async_id = self.inner.next_async_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(NodeState {
            cancel_requested: AtomicBool::new(false),
            handler: Box::new(handler),
        });
        self.inner.nodes.insert(async_id, Arc::clone(&state));

        tracing::trace!(async_id, "cancel node registered");

        CancelNode {
            registry: self.clone(),
            async_id,
            state,
        }
    }

    /// Cancel the operation registered under `async_id`.
    ///
    /// Returns `true` if a handler ran.  Cancelling an id that already
    /// completed, was unregistered, or was already cancelled is a no-op.
    pub fn cancel(&self, async_id: AsyncId) -> bool {
        let _guard = self
            .shard(async_id)
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let Some((_, state)) = self.inner.nodes.remove(&async_id) else {
            tracing::trace!(async_id, "cancel of finished operation ignored");
            return false;
        };

        state.cancel_requested.store(true, Ordering::Release);
        if catch_unwind(AssertUnwindSafe(|| state.handler.handle_cancellation())).is_err() {
            tracing::error!(async_id, "cancel handler panicked");
        }

        tracing::debug!(async_id, "operation cancelled");
        true
    }

    /// Whether `async_id` is still registered.
    pub fn is_registered(&self, async_id: AsyncId) -> bool {
        self.inner.nodes.contains_key(&async_id)
    }

    /// Number of currently registered nodes.
    pub fn len(&self) -> usize {
        self.inner.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.nodes.is_empty()
    }

    /// Number of cancel-lock shards.
    pub fn shard_count(&self) -> usize {
        self.inner.cancel_locks.len()
    }

    fn unregister(&self, async_id: AsyncId) {
        let _guard = self
            .shard(async_id)
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if self.inner.nodes.remove(&async_id).is_some() {
            tracing::trace!(async_id, "cancel node unregistered");
        }
    }

    fn shard(&self, async_id: AsyncId) -> &Mutex<()> {
        let index = (async_id % self.inner.cancel_locks.len() as u64) as usize;
        &self.inner.cancel_locks[index]
    }
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration of one cancellable operation.
///
/// Unregisters itself on drop; unregistering after a cancellation (or twice)
/// is a no-op.
pub struct CancelNode {
    registry: CancelRegistry,
    async_id: AsyncId,
    state: Arc<NodeState>,
}

impl CancelNode {
    pub fn async_id(&self) -> AsyncId {
        self.async_id
    }

    /// Whether the registry has invoked this node's handler.
    pub fn cancel_requested(&self) -> bool {
        self.state.cancel_requested.load(Ordering::Acquire)
    }

    /// Remove the node from the registry.
    ///
    /// After this returns the handler is guaranteed not to be running and
    /// will never be invoked.
    pub fn unregister(self) {
        drop(self);
    }
}

impl Drop for CancelNode {
    fn drop(&mut self) {
        self.registry.unregister(self.async_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
