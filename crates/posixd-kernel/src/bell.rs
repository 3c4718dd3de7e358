//! Broadcast wakeup primitive.
//!
//! A [`Bell`] is a single-slot condition signal.  Components that own a
//! sequence counter ring their bell every time the counter advances; waiters
//! suspend on the bell and re-check their condition once it rings.
//!
//! A ring that happens strictly before a wait begins is **not** observed by
//! that wait.  Callers must therefore follow the listen-then-check pattern:
//!
//! ```rust
//! # use posixd_kernel::bell::Bell;
//! # use tokio_util::sync::CancellationToken;
//! # async fn example(bell: &Bell, ready: impl Fn() -> bool) -> posixd_kernel::Result<()> {
//! let cancel = CancellationToken::new();
//! loop {
//!     let listener = bell.listen();
//!     if ready() {
//!         return Ok(());
//!     }
//!     listener.wait(&cancel).await?;
//! }
//! # }
//! ```
//!
//! Because the listener is registered before the condition is checked, a ring
//! racing with the check is always delivered.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio_util::sync::CancellationToken;

use crate::error::{KernelError, Result};

/// Broadcast wakeup primitive backed by [`tokio::sync::Notify`].
#[derive(Debug, Default)]
pub struct Bell {
    /// Number of times the bell has rung.
    epoch: AtomicU64,
    notify: Notify,
}

impl Bell {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every current waiter.  Never blocks.
    pub fn ring(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.notify.notify_waiters();
        tracing::trace!(epoch, "bell rung");
    }

    /// Number of rings so far.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Register interest in the next ring.
    ///
    /// Every ring after this call is delivered to the returned listener, even
    /// if it happens before [`Listener::wait`] is polled.
    pub fn listen(&self) -> Listener<'_> {
        let mut notified = Box::pin(self.notify.notified());
        notified.as_mut().enable();
        Listener { notified }
    }

    /// Suspend until the next ring after this call, or until `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        self.listen().wait(cancel).await
    }

    /// Suspend until the epoch differs from `seen`, returning the new epoch.
    ///
    /// Returns immediately if the bell already rang past `seen`.
    pub async fn wait_past(&self, seen: u64, cancel: &CancellationToken) -> Result<u64> {
        loop {
            let listener = self.listen();
            let epoch = self.epoch();
            if epoch != seen {
                return Ok(epoch);
            }
            listener.wait(cancel).await?;
        }
    }
}

/// A registered interest in the next ring of a [`Bell`].
pub struct Listener<'a> {
    notified: Pin<Box<Notified<'a>>>,
}

impl Listener<'_> {
    /// Suspend until the bell rings or `cancel` fires.
    pub async fn wait(self, cancel: &CancellationToken) -> Result<()> {
        let notified = self.notified;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KernelError::Cancelled),
            _ = notified => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
