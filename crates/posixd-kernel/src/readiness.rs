//! The readiness protocol.
//!
//! Every watchable object implements [`Pollable`]:
//!
//! ```text
//! poll(past_seq, cancel) -> PollResult { sequence, supported, active }
//! ```
//!
//! - If the object's current sequence differs from `past_seq`, `poll` returns
//!   immediately with the current state.
//! - Otherwise it suspends until the sequence changes or `cancel` fires.
//!
//! Sequences start at 1; `0` is the "never observed" sentinel, so a fresh
//! observer polling with `past_seq == 0` always receives the current state.
//! Objects must bump their sequence in the same critical section that changes
//! their active events.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Sequence value meaning "never observed".
pub const NEVER_OBSERVED: u64 = 0;

/// Sequence value every object starts at.
pub const INITIAL_SEQUENCE: u64 = 1;

bitflags::bitflags! {
    /// Event kinds, bit-compatible with Linux `EPOLL*` constants.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct Events: u32 {
        /// `EPOLLIN`: data is available to read.
        const IN = 0x0001;
        /// `EPOLLPRI`: an exceptional condition is pending.
        const PRI = 0x0002;
        /// `EPOLLOUT`: writing will not block.
        const OUT = 0x0004;
        /// `EPOLLERR`: error condition.
        const ERR = 0x0008;
        /// `EPOLLHUP`: hang up.
        const HUP = 0x0010;
        /// `EPOLLRDHUP`: the peer shut down its writing half.
        const RDHUP = 0x2000;

        /// `EPOLLET`: deliver once per edge instead of on every check.
        const EDGE_TRIGGERED = 1 << 31;

        /// <https://docs.rs/bitflags/*/bitflags/#externally-defined-flags>
        const _ = !0;
    }
}

impl Events {
    /// Bits that only control delivery and never appear in a poll result.
    pub const CONTROL: Events = Events::EDGE_TRIGGERED;

    /// Strip control bits, leaving only event kinds.
    pub fn kinds(self) -> Events {
        self.difference(Self::CONTROL)
    }

    /// Whether this interest mask requests edge-triggered delivery.
    pub fn is_edge_triggered(self) -> bool {
        self.contains(Events::EDGE_TRIGGERED)
    }
}

/// Result of a single [`Pollable::poll`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollResult {
    /// The object's sequence at the time of the poll.
    pub sequence: u64,
    /// Every event kind this object type can ever report.
    pub supported: Events,
    /// The subset of `supported` that is currently true.
    pub active: Events,
}

impl PollResult {
    /// Events from this result that an interest `mask` cares about.
    ///
    /// Only kinds that are both supported and active count; control bits in
    /// the mask are ignored.
    pub fn matching(&self, mask: Events) -> Events {
        self.supported & self.active & mask.kinds()
    }
}

/// The polling contract every watchable object implements.
#[async_trait]
pub trait Pollable: Send + Sync + 'static {
    /// Short, human-readable name of the object type (e.g. `"timerfd"`).
    fn kind(&self) -> &'static str;

    /// Wait until the object's sequence differs from `past_seq`, then report
    /// its current readiness.
    ///
    /// Fails with [`KernelError::Cancelled`](crate::KernelError::Cancelled)
    /// when `cancel` fires first.
    async fn poll(&self, past_seq: u64, cancel: &CancellationToken) -> Result<PollResult>;
}

/// Identity of a watched object, derived from its allocation address.
///
/// Only meaningful while a strong reference keeps the allocation alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey(usize);

impl ObjectKey {
    pub fn of(object: &Arc<dyn Pollable>) -> Self {
        Self(Arc::as_ptr(object) as *const () as usize)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
