//! The epoll-equivalent readiness multiplexer.
//!
//! A [`Multiplexer`] watches a set of [`Pollable`] objects, each with an
//! interest mask and an opaque cookie.  Every watched object gets one
//! background watch task that polls it and enqueues the item once its active
//! events intersect the mask.  Consumers block in
//! [`Multiplexer::wait_for_events`] until the pending queue is non-empty.
//!
//! # Item lifecycle
//!
//! ```text
//!            poll matches              re-validation: no match
//!   Idle  ---------------->  Pending  ------------------------->  Idle
//!    ^                          |
//!    |  edge-triggered report   |  level-triggered report
//!    +--------------------------+----------------------------->  Pending
//!
//!   any state  --delete_item-->  Closed
//! ```
//!
//! - **Idle**: the watch task is suspended inside `poll`.
//! - **Pending**: the item sits in the queue and its watch task has exited;
//!   the consumer re-validates it with a fresh `poll(0)` before reporting.
//! - **Level-triggered** items are put back in the queue after being
//!   reported, so a still-true condition is seen by the next wait.
//! - **Edge-triggered** items go back to Idle after being reported, with a
//!   new watch task starting from the reported sequence: only a later change
//!   reports them again.
//!
//! Items live in a [`Slab`] arena owned by the multiplexer and are referenced
//! by generation-checked handles, so a watch task outliving its item can never
//! touch a successor occupying the same slot.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use slab::Slab;
use tokio_util::sync::CancellationToken;

use crate::bell::Bell;
use crate::error::{KernelError, Result};
use crate::readiness::{Events, INITIAL_SEQUENCE, NEVER_OBSERVED, ObjectKey, PollResult, Pollable};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One event reported by [`Multiplexer::wait_for_events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    /// Active events intersected with the item's interest mask.
    pub events: Events,
    /// The cookie registered with the item.
    pub cookie: u64,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ItemHandle {
    index: usize,
    generation: u64,
}

struct WatchItem {
    generation: u64,
    key: ObjectKey,
    object: Arc<dyn Pollable>,
    mask: Events,
    cookie: u64,
    /// True while the item is queued or being re-validated by a consumer.
    pending: bool,
    /// Aborts the watch task's in-flight poll when the item is closed.
    cancel: CancellationToken,
}

struct MuxState {
    items: Slab<WatchItem>,
    by_object: HashMap<ObjectKey, ItemHandle>,
    pending: VecDeque<ItemHandle>,
    sequence: u64,
    next_generation: u64,
}

impl MuxState {
    fn item(&self, handle: ItemHandle) -> Option<&WatchItem> {
        self.items
            .get(handle.index)
            .filter(|item| item.generation == handle.generation)
    }

    fn item_mut(&mut self, handle: ItemHandle) -> Option<&mut WatchItem> {
        self.items
            .get_mut(handle.index)
            .filter(|item| item.generation == handle.generation)
    }

    fn active(&self) -> Events {
        if self.pending.is_empty() {
            Events::empty()
        } else {
            Events::IN
        }
    }
}

struct MuxInner {
    state: Mutex<MuxState>,
    bell: Bell,
    /// Parent of every item's cancellation token.
    shutdown: CancellationToken,
}

/// Outcome of a watch task observing one poll result.
enum Observed {
    /// Nothing to do; keep polling from the new sequence.
    Idle,
    /// The item was enqueued; the watch task goes dormant.
    Enqueued,
    /// The item is already pending or no longer exists.
    Dormant,
}

/// Outcome of re-validating a pending item.
enum Revalidation {
    Ready { event: ReadyEvent, level: bool },
    /// The item no longer matches and went back to Idle.
    Idle,
    /// The item was deleted while being re-validated.
    Gone,
}

// ---------------------------------------------------------------------------
// Multiplexer
// ---------------------------------------------------------------------------

/// Readiness multiplexer (the `epoll` equivalent).
///
/// Cheaply cloneable (`Arc`-backed).  Watch tasks are spawned onto the
/// ambient tokio runtime and only hold a weak reference to the multiplexer;
/// once the last handle is dropped they all terminate and release their
/// objects.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MuxInner {
                state: Mutex::new(MuxState {
                    items: Slab::new(),
                    by_object: HashMap::new(),
                    pending: VecDeque::new(),
                    sequence: INITIAL_SEQUENCE,
                    next_generation: 1,
                }),
                bell: Bell::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// This multiplexer as a pollable object, for nesting inside another
    /// multiplexer.  It reports [`Events::IN`] while events are pending.
    pub fn as_pollable(&self) -> Arc<dyn Pollable> {
        Arc::clone(&self.inner) as Arc<dyn Pollable>
    }

    /// Start watching `object` for the events in `mask`.
    ///
    /// Fails with [`KernelError::AlreadyWatched`] if the object is already
    /// watched, and with [`KernelError::InvalidArgument`] if the object is
    /// this multiplexer itself.
    pub fn add_item(&self, object: Arc<dyn Pollable>, mask: Events, cookie: u64) -> Result<()> {
        let key = ObjectKey::of(&object);
        if key == ObjectKey::of(&self.as_pollable()) {
            return Err(KernelError::InvalidArgument {
                reason: "a multiplexer cannot watch itself".into(),
            });
        }

        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.by_object.contains_key(&key) {
            return Err(KernelError::AlreadyWatched {
                object: format!("{} {key}", object.kind()),
            });
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let cancel = self.inner.shutdown.child_token();
        let index = state.items.insert(WatchItem {
            generation,
            key,
            object: Arc::clone(&object),
            mask,
            cookie,
            pending: false,
            cancel: cancel.clone(),
        });
        let handle = ItemHandle { index, generation };
        state.by_object.insert(key, handle);
        drop(state);

        tracing::debug!(object = %key, kind = object.kind(), ?mask, cookie, "item added");
        self.inner.spawn_watch(handle, object, cancel, NEVER_OBSERVED);
        Ok(())
    }

    /// Replace the interest mask and cookie of an already-watched object.
    ///
    /// The watch task's in-flight poll is not restarted; the new mask applies
    /// from its next observation on.
    pub fn modify_item(&self, object: &Arc<dyn Pollable>, mask: Events, cookie: u64) -> Result<()> {
        let key = ObjectKey::of(object);
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let handle = state
            .by_object
            .get(&key)
            .copied()
            .ok_or_else(|| KernelError::NotWatched {
                object: format!("{} {key}", object.kind()),
            })?;

        if let Some(item) = state.item_mut(handle) {
            item.mask = mask;
            item.cookie = cookie;
        }

        tracing::debug!(object = %key, ?mask, cookie, "item modified");
        Ok(())
    }

    /// Stop watching `object`.
    ///
    /// Returns `false` if the object was not watched (a no-op).
    pub fn delete_item(&self, object: &Arc<dyn Pollable>) -> bool {
        let key = ObjectKey::of(object);
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(handle) = state.by_object.remove(&key) else {
            return false;
        };
        let Some(item) = state.items.try_remove(handle.index) else {
            return false;
        };

        let was_queued = !state.pending.is_empty();
        state.pending.retain(|queued| *queued != handle);
        let emptied = was_queued && state.pending.is_empty();
        if emptied {
            state.sequence += 1;
        }
        drop(state);

        // Aborts the watch task's poll; the task exits and drops its reference.
        item.cancel.cancel();
        if emptied {
            self.inner.bell.ring();
        }

        tracing::debug!(object = %item.key, kind = item.object.kind(), "item deleted");
        true
    }

    /// Whether `object` is currently watched.
    pub fn is_watched(&self, object: &Arc<dyn Pollable>) -> bool {
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.by_object.contains_key(&ObjectKey::of(object))
    }

    /// Number of watched objects.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items currently sitting in the pending queue.
    pub fn pending_len(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }

    /// Wait until at least one watched item is ready, then report up to
    /// `max_events` of them.
    ///
    /// Every pending item is re-validated with a fresh poll before it is
    /// reported.  No item is reported twice within one call.  If `cancel`
    /// fires before anything was collected the call fails with
    /// [`KernelError::Cancelled`]; every item taken off the queue is put back.
    pub async fn wait_for_events(
        &self,
        max_events: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReadyEvent>> {
        if max_events == 0 {
            return Err(KernelError::InvalidArgument {
                reason: "max_events must be positive".into(),
            });
        }

        let mut events = Vec::new();
        // Handles reported during this call.
        let mut reported: Vec<ItemHandle> = Vec::new();
        // Level-triggered reports and deferred duplicates, re-queued on exit.
        let mut requeue: Vec<ItemHandle> = Vec::new();

        while events.is_empty() {
            if let Err(err) = self.inner.await_pending(cancel).await {
                self.inner.requeue(requeue);
                return Err(err);
            }

            while events.len() < max_events {
                let Some((handle, object)) = self.inner.pop_pending() else {
                    break;
                };
                if reported.contains(&handle) {
                    requeue.push(handle);
                    continue;
                }

                let result = match object.poll(NEVER_OBSERVED, cancel).await {
                    Ok(result) => result,
                    Err(KernelError::Cancelled) => {
                        requeue.push(handle);
                        self.inner.requeue(requeue);
                        return if events.is_empty() {
                            Err(KernelError::Cancelled)
                        } else {
                            Ok(events)
                        };
                    }
                    Err(err) => {
                        self.inner.abandon(handle, &err);
                        continue;
                    }
                };

                match self.inner.revalidate(handle, &result) {
                    Revalidation::Ready { event, level } => {
                        events.push(event);
                        reported.push(handle);
                        if level {
                            requeue.push(handle);
                        }
                    }
                    Revalidation::Idle | Revalidation::Gone => {}
                }
            }
        }

        self.inner.requeue(requeue);
        tracing::trace!(count = events.len(), "events reported");
        Ok(events)
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

impl MuxInner {
    fn spawn_watch(
        self: &Arc<Self>,
        handle: ItemHandle,
        object: Arc<dyn Pollable>,
        cancel: CancellationToken,
        from_seq: u64,
    ) {
        tokio::spawn(watch(Arc::downgrade(self), handle, object, cancel, from_seq));
    }

    /// Apply one poll result observed by a watch task.
    fn observe(&self, handle: ItemHandle, result: &PollResult) -> Observed {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(item) = state.item_mut(handle) else {
            return Observed::Dormant;
        };
        if item.pending {
            return Observed::Dormant;
        }

        let matching = result.matching(item.mask);
        if matching.is_empty() {
            tracing::trace!(
                object = %item.key,
                mask = ?item.mask,
                active = ?result.active,
                "item still not pending after poll"
            );
            return Observed::Idle;
        }

        item.pending = true;
        tracing::trace!(object = %item.key, ?matching, "item becomes pending");
        state.pending.push_back(handle);
        state.sequence += 1;
        drop(state);

        self.bell.ring();
        Observed::Enqueued
    }

    async fn await_pending(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let listener = self.bell.listen();
            {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if !state.pending.is_empty() {
                    return Ok(());
                }
            }
            listener.wait(cancel).await?;
        }
    }

    /// Take the next pending item off the queue.
    ///
    /// Draining the queue is a readiness change of the multiplexer itself:
    /// the sequence advances and the bell rings so nested observers see it.
    fn pop_pending(&self) -> Option<(ItemHandle, Arc<dyn Pollable>)> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut emptied = false;
        let mut popped = None;
        while let Some(handle) = state.pending.pop_front() {
            if state.pending.is_empty() {
                state.sequence += 1;
                emptied = true;
            }
            if let Some(item) = state.item(handle) {
                popped = Some((handle, Arc::clone(&item.object)));
                break;
            }
        }
        drop(state);

        if emptied {
            self.bell.ring();
        }
        popped
    }

    /// Decide what to do with a pending item after its re-validation poll.
    fn revalidate(self: &Arc<Self>, handle: ItemHandle, result: &PollResult) -> Revalidation {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(item) = state.item_mut(handle) else {
            return Revalidation::Gone;
        };

        let matching = result.matching(item.mask);
        let level = !item.mask.is_edge_triggered();
        if !matching.is_empty() && level {
            return Revalidation::Ready {
                event: ReadyEvent {
                    events: matching,
                    cookie: item.cookie,
                },
                level,
            };
        }

        // Either the state changed since enqueue, or an edge-triggered item
        // was just reported: resume watching from the observed sequence.
        item.pending = false;
        let object = Arc::clone(&item.object);
        let cancel = item.cancel.clone();
        let cookie = item.cookie;
        drop(state);
        self.spawn_watch(handle, object, cancel, result.sequence);

        if matching.is_empty() {
            Revalidation::Idle
        } else {
            Revalidation::Ready {
                event: ReadyEvent {
                    events: matching,
                    cookie,
                },
                level,
            }
        }
    }

    /// Drop a pending item whose object failed to poll (e.g. it was closed).
    fn abandon(&self, handle: ItemHandle, err: &KernelError) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(item) = state.item_mut(handle) {
            item.pending = false;
            tracing::debug!(object = %item.key, error = %err, "watched object failed, watch stopped");
        }
    }

    /// Put still-pending items back at the tail of the queue.
    fn requeue(&self, handles: Vec<ItemHandle>) {
        if handles.is_empty() {
            return;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut requeued = 0usize;
        for handle in handles {
            let still_pending = state.item(handle).is_some_and(|item| item.pending);
            if still_pending && !state.pending.contains(&handle) {
                state.pending.push_back(handle);
                requeued += 1;
            }
        }
        if requeued == 0 {
            return;
        }
        // Concurrent waiters may have seen an empty queue meanwhile.
        state.sequence += 1;
        drop(state);

        self.bell.ring();
        tracing::trace!(requeued, "pending items re-armed");
    }
}

impl Drop for MuxInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Pollable for MuxInner {
    fn kind(&self) -> &'static str {
        "epoll"
    }

    async fn poll(&self, past_seq: u64, cancel: &CancellationToken) -> Result<PollResult> {
        loop {
            let listener = self.bell.listen();
            {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.sequence != past_seq {
                    return Ok(PollResult {
                        sequence: state.sequence,
                        supported: Events::IN,
                        active: state.active(),
                    });
                }
            }
            listener.wait(cancel).await?;
        }
    }
}

/// Background watch task for one item.
async fn watch(
    mux: Weak<MuxInner>,
    handle: ItemHandle,
    object: Arc<dyn Pollable>,
    cancel: CancellationToken,
    mut seq: u64,
) {
    loop {
        let result = match object.poll(seq, &cancel).await {
            Ok(result) => result,
            Err(KernelError::Cancelled) => {
                tracing::trace!(kind = object.kind(), "watch task closed");
                return;
            }
            Err(err) => {
                tracing::debug!(kind = object.kind(), error = %err, "watched object failed, watch stopped");
                return;
            }
        };

        let Some(mux) = mux.upgrade() else {
            return;
        };
        match mux.observe(handle, &result) {
            Observed::Idle => seq = result.sequence,
            Observed::Enqueued | Observed::Dormant => return,
        }
        drop(mux);

        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
