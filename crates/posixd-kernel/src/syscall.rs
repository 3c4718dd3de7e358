//! POSIX-shaped entry points over the readiness core.
//!
//! [`Subsystem`] owns the process-wide [`CancelRegistry`] and [`Clock`] and
//! exposes `epoll_*` / `timerfd_*` calls with Linux argument conventions:
//! raw op codes and flag words, `timespec` pairs, millisecond timeouts.
//! Errors keep their [`KernelError`] variant; [`KernelError::errno`] gives the
//! value a syscall would return.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cancel::{AsyncId, CancelRegistry};
use crate::clock::Clock;
use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::multiplexer::Multiplexer;
use crate::readiness::{Events, Pollable};
use crate::timer::TimerFd;

pub const EPOLL_CTL_ADD: i32 = 1;
pub const EPOLL_CTL_DEL: i32 = 2;
pub const EPOLL_CTL_MOD: i32 = 3;

/// `EPOLLEXCLUSIVE`, rejected.
pub const EPOLLEXCLUSIVE: u32 = 1 << 28;
/// `EPOLLONESHOT`, rejected.
pub const EPOLLONESHOT: u32 = 1 << 30;

pub const CLOCK_REALTIME: i32 = 0;
pub const CLOCK_MONOTONIC: i32 = 1;

pub const TFD_NONBLOCK: i32 = 0o4000;
pub const TFD_CLOEXEC: i32 = 0o2000000;

const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_MILLI: u64 = 1_000_000;

// ---------------------------------------------------------------------------
// Argument types
// ---------------------------------------------------------------------------

/// `epoll_ctl` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpollOp {
    Add,
    Modify,
    Delete,
}

impl TryFrom<i32> for EpollOp {
    type Error = KernelError;

    fn try_from(op: i32) -> Result<Self> {
        match op {
            EPOLL_CTL_ADD => Ok(Self::Add),
            EPOLL_CTL_MOD => Ok(Self::Modify),
            EPOLL_CTL_DEL => Ok(Self::Delete),
            other => Err(KernelError::InvalidArgument {
                reason: format!("unknown epoll_ctl op {other}"),
            }),
        }
    }
}

/// `struct epoll_event`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpollEvent {
    pub events: u32,
    pub data: u64,
}

/// `struct timespec`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl Timespec {
    pub fn from_millis(millis: u64) -> Self {
        Self {
            tv_sec: (millis / 1_000) as i64,
            tv_nsec: ((millis % 1_000) * NANOS_PER_MILLI) as i64,
        }
    }

    /// Total nanoseconds.
    ///
    /// Negative fields or `tv_nsec >= 1e9` are [`KernelError::InvalidArgument`];
    /// a total that does not fit in `u64` is [`KernelError::Overflow`].
    pub fn to_nanos(&self) -> Result<u64> {
        if self.tv_sec < 0 || !(0..NANOS_PER_SEC).contains(&self.tv_nsec) {
            return Err(KernelError::InvalidArgument {
                reason: format!("malformed timespec {{ {}, {} }}", self.tv_sec, self.tv_nsec),
            });
        }

        let overflow = KernelError::Overflow {
            context: "timespec conversion",
        };
        (self.tv_sec as u64)
            .checked_mul(NANOS_PER_SEC as u64)
            .and_then(|nanos| nanos.checked_add(self.tv_nsec as u64))
            .ok_or(overflow)
    }
}

/// `struct itimerspec`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ITimerSpec {
    pub it_interval: Timespec,
    pub it_value: Timespec,
}

// ---------------------------------------------------------------------------
// Subsystem
// ---------------------------------------------------------------------------

/// Process-wide readiness subsystem.
#[derive(Clone)]
pub struct Subsystem {
    registry: CancelRegistry,
    clock: Clock,
}

impl Subsystem {
    pub fn new(config: &KernelConfig) -> Self {
        let registry = CancelRegistry::with_shards(config.cancel_lock_shards);
        tracing::info!(shards = registry.shard_count(), "readiness subsystem started");
        Self {
            registry,
            clock: Clock::new(),
        }
    }

    pub fn registry(&self) -> &CancelRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    // -- epoll ----------------------------------------------------------------

    pub fn epoll_create(&self) -> Multiplexer {
        Multiplexer::new()
    }

    /// `epoll_ctl(2)`.  `event` is ignored for [`EPOLL_CTL_DEL`].
    pub fn epoll_ctl(
        &self,
        epoll: &Multiplexer,
        op: i32,
        file: &Arc<dyn Pollable>,
        event: &EpollEvent,
    ) -> Result<()> {
        let op = EpollOp::try_from(op)?;
        if op == EpollOp::Delete {
            return if epoll.delete_item(file) {
                Ok(())
            } else {
                Err(KernelError::NotWatched {
                    object: file.kind().to_string(),
                })
            };
        }

        if event.events & (EPOLLONESHOT | EPOLLEXCLUSIVE) != 0 {
            return Err(KernelError::InvalidArgument {
                reason: "EPOLLONESHOT and EPOLLEXCLUSIVE are not supported".into(),
            });
        }
        let mask = Events::from_bits_retain(event.events);
        match op {
            EpollOp::Add => epoll.add_item(Arc::clone(file), mask, event.data),
            EpollOp::Modify => epoll.modify_item(file, mask, event.data),
            EpollOp::Delete => Ok(()),
        }
    }

    /// `epoll_wait(2)`.
    ///
    /// Fills `events` from the front and returns how many were written.  A
    /// negative `timeout_ms` waits indefinitely, `0` only drains what is
    /// already pending, and an expired timeout returns `0`.  Cancelling
    /// `cancel` (a signal) fails with [`KernelError::Cancelled`].
    pub async fn epoll_wait(
        &self,
        epoll: &Multiplexer,
        events: &mut [EpollEvent],
        timeout_ms: i32,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let wait_token = cancel.child_token();
        let _timeout = match u64::try_from(timeout_ms) {
            Err(_) => None,
            Ok(0) => {
                wait_token.cancel();
                None
            }
            Ok(millis) => Some(self.arm_timeout(millis, &wait_token)?),
        };

        match epoll.wait_for_events(events.len(), &wait_token).await {
            Ok(ready) => {
                for (slot, event) in events.iter_mut().zip(&ready) {
                    *slot = EpollEvent {
                        events: event.events.bits(),
                        data: event.cookie,
                    };
                }
                Ok(ready.len())
            }
            Err(KernelError::Cancelled) if !cancel.is_cancelled() => {
                tracing::trace!(timeout_ms, "epoll_wait timed out");
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    /// Cancel `token` after `millis`, through a registered clock wait.
    fn arm_timeout(&self, millis: u64, token: &CancellationToken) -> Result<TimeoutGuard> {
        let nanos = millis.saturating_mul(NANOS_PER_MILLI);
        let deadline = self.clock.deadline_after(self.clock.now(), nanos)?;
        let wait = self.clock.await_clock(deadline, &self.registry)?;
        let async_id = wait.async_id();

        let token = token.clone();
        tokio::spawn(async move {
            if wait.wait().await.is_ok() {
                token.cancel();
            }
        });

        Ok(TimeoutGuard {
            registry: self.registry.clone(),
            async_id,
        })
    }

    // -- timerfd --------------------------------------------------------------

    /// `timerfd_create(2)`.  Both clocks are served by the monotonic clock.
    pub fn timerfd_create(&self, clock_id: i32, flags: i32) -> Result<Arc<TimerFd>> {
        if clock_id != CLOCK_MONOTONIC && clock_id != CLOCK_REALTIME {
            return Err(KernelError::InvalidArgument {
                reason: format!("unsupported clock id {clock_id}"),
            });
        }
        if flags & !(TFD_NONBLOCK | TFD_CLOEXEC) != 0 {
            return Err(KernelError::InvalidArgument {
                reason: format!("unknown timerfd flags {flags:#o}"),
            });
        }

        let non_blocking = flags & TFD_NONBLOCK != 0;
        tracing::debug!(clock_id, non_blocking, "timerfd created");
        Ok(TimerFd::new(self.clock, self.registry.clone(), non_blocking))
    }

    /// `timerfd_settime(2)` with relative times.
    pub fn timerfd_settime(&self, timer: &Arc<TimerFd>, new_value: &ITimerSpec) -> Result<()> {
        let initial = new_value.it_value.to_nanos()?;
        let interval = new_value.it_interval.to_nanos()?;
        timer.set_time(initial, interval)
    }

    /// `read(2)` on a timerfd: the number of expirations since the last read.
    pub async fn timerfd_read(&self, timer: &TimerFd, cancel: &CancellationToken) -> Result<u64> {
        timer.read(cancel).await
    }
}

/// Cancels a pending `epoll_wait` timeout when the call returns.
struct TimeoutGuard {
    registry: CancelRegistry,
    async_id: AsyncId,
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        self.registry.cancel(self.async_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
