//! The timerfd-equivalent timer service.
//!
//! A [`TimerFd`] turns clock deadlines into readiness.  Every expiration
//! increments a counter, bumps the timer's sequence and rings its bell; the
//! timer reports [`Events::IN`] while the counter is non-zero.
//!
//! # Rearming
//!
//! Each [`TimerFd::set_time`] replaces the armed timer wholesale.  The old
//! timer's in-flight clock wait is cancelled through the
//! [`CancelRegistry`], and its arming task notices it was superseded the next
//! time it wakes, so it never contributes an expiration.
//!
//! ```text
//!   set_time(initial, interval)
//!        |
//!        v
//!   wait(now + initial) --fire--> wait(+interval) --fire--> wait(+interval) ...
//!        |                              |
//!        +--- superseded / cancelled ---+---> task exits
//! ```

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cancel::{AsyncId, CancelRegistry};
use crate::clock::{AwaitClock, Clock};
use crate::error::{KernelError, Result};
use crate::pollee::Pollee;
use crate::readiness::{Events, NEVER_OBSERVED, PollResult, Pollable};

/// The currently armed timer.
#[derive(Debug)]
struct ArmedTimer {
    id: u64,
    initial: u64,
    interval: u64,
    /// Async id of the in-flight clock wait, if one is submitted.
    async_id: Option<AsyncId>,
}

#[derive(Debug)]
struct TimerState {
    active: Option<ArmedTimer>,
    /// Number of expirations since the last read.
    expirations: u64,
    next_timer_id: u64,
    closed: bool,
}

/// Pollable one-shot / periodic timer.
///
/// Created behind an [`Arc`] so it can be handed to a
/// [`Multiplexer`](crate::Multiplexer) as an `Arc<dyn Pollable>`.  Arming
/// tasks only hold a weak reference; dropping the last handle closes the
/// timer and cancels its pending wait.
pub struct TimerFd {
    clock: Clock,
    registry: CancelRegistry,
    non_blocking: bool,
    state: Mutex<TimerState>,
    pollee: Pollee,
}

impl TimerFd {
    /// Create a disarmed timer.
    ///
    /// With `non_blocking`, [`TimerFd::read`] fails with
    /// [`KernelError::WouldBlock`] instead of waiting for an expiration.
    #[must_use]
    pub fn new(clock: Clock, registry: CancelRegistry, non_blocking: bool) -> Arc<Self> {
        Arc::new(Self {
            clock,
            registry,
            non_blocking,
            state: Mutex::new(TimerState {
                active: None,
                expirations: 0,
                next_timer_id: 1,
                closed: false,
            }),
            pollee: Pollee::new(Events::IN),
        })
    }

    pub fn is_non_blocking(&self) -> bool {
        self.non_blocking
    }

    /// Arm (or disarm) the timer.
    ///
    /// `initial` and `interval` are nanoseconds.  `(0, 0)` disarms; a zero
    /// `initial` with a non-zero `interval` starts directly in the periodic
    /// phase.  Fails with [`KernelError::Overflow`] before touching any state
    /// if the first deadline is not representable.
    pub fn set_time(self: &Arc<Self>, initial: u64, interval: u64) -> Result<()> {
        let now = self.clock.now();
        let first_delay = if initial != 0 { initial } else { interval };
        let first_deadline = self.clock.deadline_after(now, first_delay)?;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(KernelError::FileClosed);
        }

        if let Some(old) = state.active.take() {
            tracing::debug!(
                timer_id = old.id,
                initial = old.initial,
                interval = old.interval,
                "timer superseded"
            );
            if let Some(async_id) = old.async_id {
                self.registry.cancel(async_id);
            }
        }

        if initial == 0 && interval == 0 {
            tracing::debug!("timer disarmed");
            return Ok(());
        }

        let id = state.next_timer_id;
        state.next_timer_id += 1;
        state.active = Some(ArmedTimer {
            id,
            initial,
            interval,
            async_id: None,
        });
        drop(state);

        tracing::debug!(timer_id = id, initial, interval, "timer armed");
        tokio::spawn(arm(Arc::downgrade(self), id, first_deadline, interval));
        Ok(())
    }

    /// Whether a timer is currently armed.
    pub fn is_armed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active
            .is_some()
    }

    /// Return the expiration count and reset it to zero.
    ///
    /// Fails with [`KernelError::WouldBlock`] if nothing expired since the
    /// last read.
    pub fn read_and_clear(&self) -> Result<u64> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.expirations == 0 {
            return Err(KernelError::WouldBlock);
        }
        let count = std::mem::take(&mut state.expirations);
        self.pollee.set_active(Events::empty());
        drop(state);

        tracing::trace!(count, "timer expirations read");
        Ok(count)
    }

    /// `read(2)` on the timer.
    ///
    /// Blocking timers wait through the readiness protocol until an
    /// expiration is available; non-blocking timers fail with
    /// [`KernelError::WouldBlock`].
    pub async fn read(&self, cancel: &CancellationToken) -> Result<u64> {
        let mut seq = NEVER_OBSERVED;
        loop {
            let result = self.pollee.poll(seq, cancel).await?;
            if result.active.contains(Events::IN) {
                match self.read_and_clear() {
                    Ok(count) => return Ok(count),
                    // Another reader drained it first.
                    Err(KernelError::WouldBlock) => {}
                    Err(err) => return Err(err),
                }
            }
            if self.non_blocking {
                return Err(KernelError::WouldBlock);
            }
            seq = result.sequence;
        }
    }

    /// Disarm the timer and fail every up-to-date poller with
    /// [`KernelError::FileClosed`].  Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(old) = state.active.take()
            && let Some(async_id) = old.async_id
        {
            self.registry.cancel(async_id);
        }
        drop(state);

        self.pollee.close();
        tracing::debug!("timer closed");
    }

    // -- Arming task helpers ------------------------------------------------

    /// Submit the clock wait for `deadline` if timer `id` is still active.
    fn submit_wait(&self, id: u64, deadline: u64) -> Option<AwaitClock> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let armed = state.active.as_mut().filter(|armed| armed.id == id)?;

        match self.clock.await_clock(deadline, &self.registry) {
            Ok(wait) => {
                armed.async_id = Some(wait.async_id());
                Some(wait)
            }
            Err(err) => {
                tracing::warn!(timer_id = id, deadline, error = %err, "timer stopped");
                state.active = None;
                None
            }
        }
    }

    /// Record the outcome of timer `id`'s clock wait.
    ///
    /// Returns `false` if the timer was superseded or cancelled and the
    /// arming task must exit.
    fn fire(&self, id: u64, outcome: Result<()>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(armed) = state.active.as_mut().filter(|armed| armed.id == id) else {
            tracing::trace!(timer_id = id, "superseded timer exits");
            return false;
        };
        armed.async_id = None;

        if let Err(err) = outcome {
            tracing::debug!(timer_id = id, error = %err, "timer wait aborted");
            state.active = None;
            return false;
        }

        state.expirations = state.expirations.saturating_add(1);
        let expirations = state.expirations;
        self.pollee.notify(Events::IN);
        drop(state);

        tracing::trace!(timer_id = id, expirations, "timer fired");
        true
    }

    /// Retire timer `id` after its last firing.
    fn finish(&self, id: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.active.as_ref().is_some_and(|armed| armed.id == id) {
            state.active = None;
        }
    }
}

impl Drop for TimerFd {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Pollable for TimerFd {
    fn kind(&self) -> &'static str {
        "timerfd"
    }

    async fn poll(&self, past_seq: u64, cancel: &CancellationToken) -> Result<PollResult> {
        self.pollee.poll(past_seq, cancel).await
    }
}

/// Arming task: one clock wait per expiration until superseded.
async fn arm(timer: Weak<TimerFd>, id: u64, mut deadline: u64, interval: u64) {
    loop {
        let wait = {
            let Some(timer) = timer.upgrade() else {
                return;
            };
            let Some(wait) = timer.submit_wait(id, deadline) else {
                return;
            };
            wait
        };

        let outcome = wait.wait().await;

        let Some(timer) = timer.upgrade() else {
            return;
        };
        if !timer.fire(id, outcome) {
            return;
        }
        if interval == 0 {
            timer.finish(id);
            return;
        }
        deadline = match timer.clock.deadline_after(deadline, interval) {
            Ok(next) => next,
            Err(err) => {
                tracing::warn!(timer_id = id, error = %err, "periodic timer stopped");
                timer.finish(id);
                return;
            }
        };
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MS: u64 = 1_000_000;

    fn timer(non_blocking: bool) -> (Arc<TimerFd>, CancelRegistry) {
        let registry = CancelRegistry::new();
        let timer = TimerFd::new(Clock::new(), registry.clone(), non_blocking);
        (timer, registry)
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn oneshot_fires_once() {
        let (timer, registry) = timer(true);
        timer.set_time(100 * MS, 0).expect("arm");

        sleep_ms(50).await;
        assert!(matches!(timer.read_and_clear(), Err(KernelError::WouldBlock)));

        sleep_ms(100).await;
        assert_eq!(timer.read_and_clear().expect("expired"), 1);
        assert!(matches!(timer.read_and_clear(), Err(KernelError::WouldBlock)));
        assert!(!timer.is_armed());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_accumulates_expirations() {
        let (timer, _registry) = timer(true);
        timer.set_time(50 * MS, 50 * MS).expect("arm");

        sleep_ms(175).await;
        assert_eq!(timer.read_and_clear().expect("expired"), 3);

        sleep_ms(50).await;
        assert_eq!(timer.read_and_clear().expect("expired"), 1);
        assert!(timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_initial_starts_periodic_phase() {
        let (timer, _registry) = timer(true);
        timer.set_time(0, 40 * MS).expect("arm");

        sleep_ms(90).await;
        assert_eq!(timer.read_and_clear().expect("expired"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_cancels_previous_timer() {
        let (timer, registry) = timer(true);
        timer.set_time(100 * MS, 0).expect("first");
        timer.set_time(200 * MS, 0).expect("second");

        sleep_ms(150).await;
        assert!(matches!(timer.read_and_clear(), Err(KernelError::WouldBlock)));

        sleep_ms(100).await;
        assert_eq!(timer.read_and_clear().expect("second fired"), 1);

        sleep_ms(500).await;
        assert!(matches!(timer.read_and_clear(), Err(KernelError::WouldBlock)));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_before_first_firing() {
        let (timer, registry) = timer(true);
        timer.set_time(50 * MS, 50 * MS).expect("arm");
        timer.set_time(0, 0).expect("disarm");

        sleep_ms(500).await;
        assert!(matches!(timer.read_and_clear(), Err(KernelError::WouldBlock)));
        assert!(!timer.is_armed());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_leaves_timer_untouched() {
        let (timer, _registry) = timer(true);
        timer.set_time(100 * MS, 0).expect("arm");
        sleep_ms(1).await;

        let result = timer.set_time(u64::MAX, 0);
        assert!(matches!(result, Err(KernelError::Overflow { .. })));
        assert!(timer.is_armed());

        sleep_ms(150).await;
        assert_eq!(timer.read_and_clear().expect("original still fires"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_reports_readable_after_expiration() {
        let (timer, _registry) = timer(true);
        let cancel = CancellationToken::new();

        let initial = timer.poll(NEVER_OBSERVED, &cancel).await.expect("poll");
        assert_eq!(initial.supported, Events::IN);
        assert!(initial.active.is_empty());

        timer.set_time(10 * MS, 0).expect("arm");
        let fired = timer.poll(initial.sequence, &cancel).await.expect("poll");
        assert!(fired.sequence > initial.sequence);
        assert_eq!(fired.active, Events::IN);

        timer.read_and_clear().expect("read");
        let cleared = timer.poll(fired.sequence, &cancel).await.expect("poll");
        assert!(cleared.active.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_read_waits_for_expiration() {
        let (timer, _registry) = timer(false);
        timer.set_time(30 * MS, 0).expect("arm");

        let count = timer.read(&CancellationToken::new()).await.expect("read");
        assert_eq!(count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_blocking_read_fails_fast() {
        let (timer, _registry) = timer(true);
        timer.set_time(30 * MS, 0).expect("arm");

        let result = timer.read(&CancellationToken::new()).await;
        assert!(matches!(result, Err(KernelError::WouldBlock)));
    }

    #[tokio::test(start_paused = true)]
    async fn close_fails_pollers_and_disarms() {
        let (timer, registry) = timer(false);
        timer.set_time(1_000 * MS, 0).expect("arm");
        sleep_ms(1).await;
        assert_eq!(registry.len(), 1);

        let cancel = CancellationToken::new();
        let seq = timer.poll(NEVER_OBSERVED, &cancel).await.expect("poll").sequence;

        timer.close();
        let result = timer.poll(seq, &cancel).await;
        assert!(matches!(result, Err(KernelError::FileClosed)));
        assert!(matches!(timer.set_time(MS, 0), Err(KernelError::FileClosed)));

        sleep_ms(1).await;
        assert!(registry.is_empty());
    }
}
