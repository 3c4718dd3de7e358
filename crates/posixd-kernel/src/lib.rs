//! posixd readiness core.
//!
//! This crate provides the event-readiness services behind the posixd
//! personality layer's `epoll` and `timerfd` support:
//!
//! - **[`bell`]** -- Broadcast wakeup primitive over [`tokio::sync::Notify`].
//! - **[`readiness`]** -- The sequence-numbered readiness protocol
//!   ([`Pollable`], [`PollResult`]) and the [`Events`] bit set.
//! - **[`pollee`]** -- Reusable readiness state for implementing [`Pollable`].
//! - **[`cancel`]** -- Sharded cancellation registry keyed by [`AsyncId`].
//! - **[`clock`]** -- Monotonic nanosecond clock with cancellable waits.
//! - **[`multiplexer`]** -- The epoll equivalent: watch items, pending queue,
//!   level- and edge-triggered delivery.
//! - **[`timer`]** -- The timerfd equivalent: one-shot and periodic timers.
//! - **[`syscall`]** -- POSIX-shaped `epoll_*` / `timerfd_*` entry points.
//! - **[`config`]** -- TOML configuration.
//! - **[`error`]** -- Unified kernel error type via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod bell;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod multiplexer;
pub mod pollee;
pub mod readiness;
pub mod syscall;
pub mod timer;

// Re-export the most commonly used types at the crate root for convenience.
pub use bell::Bell;
pub use cancel::{AsyncId, CancelHandler, CancelNode, CancelRegistry};
pub use clock::{AwaitClock, Clock};
pub use config::{DemoConfig, KernelConfig};
pub use error::{KernelError, Result};
pub use multiplexer::{Multiplexer, ReadyEvent};
pub use pollee::Pollee;
pub use readiness::{Events, INITIAL_SEQUENCE, NEVER_OBSERVED, PollResult, Pollable};
pub use syscall::{EpollEvent, EpollOp, ITimerSpec, Subsystem, Timespec};
pub use timer::TimerFd;
