//! Monotonic clock and cancellable clock waits.
//!
//! Time is measured in nanosecond ticks since the clock's origin, the same
//! unit the timerfd interface uses.  Waits are built on [`tokio::time`], so
//! tests can pause and advance time deterministically.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cancel::{AsyncId, CancelNode, CancelRegistry};
use crate::error::{KernelError, Result};

/// Monotonic nanosecond clock.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    /// Create a clock whose tick `0` is the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Nanoseconds elapsed since the clock's origin.
    pub fn now(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// The tick `nanos` after `base`, failing instead of wrapping.
    ///
    /// The result is also checked against the range of the underlying
    /// instant type, so a deadline accepted here can always be waited on.
    pub fn deadline_after(&self, base: u64, nanos: u64) -> Result<u64> {
        let deadline = base.checked_add(nanos).ok_or(KernelError::Overflow {
            context: "clock deadline",
        })?;
        self.instant(deadline)?;
        Ok(deadline)
    }

    /// Submit a wait for `deadline` (a tick), registered with `registry`.
    ///
    /// The wait's async id is available before it is awaited, so another
    /// component can cancel it through the registry at any time.
    pub fn await_clock(&self, deadline: u64, registry: &CancelRegistry) -> Result<AwaitClock> {
        let instant = self.instant(deadline)?;

        let token = CancellationToken::new();
        let node = registry.register(token.clone());
        tracing::trace!(async_id = node.async_id(), deadline, "clock wait submitted");

        Ok(AwaitClock {
            node,
            token,
            deadline: instant,
        })
    }

    fn instant(&self, tick: u64) -> Result<Instant> {
        self.origin
            .checked_add(Duration::from_nanos(tick))
            .ok_or(KernelError::Overflow {
                context: "clock deadline",
            })
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-flight clock wait that can be cancelled by async id.
pub struct AwaitClock {
    node: CancelNode,
    token: CancellationToken,
    deadline: Instant,
}

impl AwaitClock {
    pub fn async_id(&self) -> AsyncId {
        self.node.async_id()
    }

    /// Wait for the deadline.
    ///
    /// Fails with [`KernelError::Cancelled`] if the registry cancelled the
    /// wait first.  Either way the node is unregistered on return.
    pub async fn wait(self) -> Result<()> {
        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(KernelError::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Ok(()),
        };
        self.node.unregister();
        outcome
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
