//! Reusable readiness state for pollable objects.
//!
//! A [`Pollee`] bundles the three pieces every [`Pollable`](crate::Pollable)
//! needs: a sequence counter, the currently active events, and a [`Bell`]
//! rung on every change.  Sequence and active events live under one lock, so
//! a poll can never observe a new event set paired with a stale sequence.

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::bell::Bell;
use crate::error::{KernelError, Result};
use crate::readiness::{Events, INITIAL_SEQUENCE, PollResult};

#[derive(Debug)]
struct PolleeState {
    sequence: u64,
    active: Events,
    closed: bool,
}

/// Sequence-numbered readiness state with a wakeup bell.
#[derive(Debug)]
pub struct Pollee {
    supported: Events,
    state: Mutex<PolleeState>,
    bell: Bell,
}

impl Pollee {
    /// Create a pollee that can report the event kinds in `supported`.
    #[must_use]
    pub fn new(supported: Events) -> Self {
        Self {
            supported: supported.kinds(),
            state: Mutex::new(PolleeState {
                sequence: INITIAL_SEQUENCE,
                active: Events::empty(),
                closed: false,
            }),
            bell: Bell::new(),
        }
    }

    pub fn supported(&self) -> Events {
        self.supported
    }

    /// Replace the active event set.
    ///
    /// The sequence only advances if the set actually changed.  Returns the
    /// sequence after the update.
    pub fn set_active(&self, active: Events) -> u64 {
        let active = self.clamp(active);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.active == active {
            return state.sequence;
        }
        state.active = active;
        state.sequence += 1;
        let sequence = state.sequence;
        drop(state);

        self.bell.ring();
        sequence
    }

    /// Record that an event happened, even if the active set is unchanged.
    ///
    /// Use this for "more of the same" notifications (another expiration,
    /// more bytes arriving) so edge-triggered observers see a new edge.
    pub fn notify(&self, active: Events) -> u64 {
        let active = self.clamp(active);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active = active;
        state.sequence += 1;
        let sequence = state.sequence;
        drop(state);

        self.bell.ring();
        sequence
    }

    /// Mark the object closed and wake every poller.
    ///
    /// Pollers already up to date fail with [`KernelError::FileClosed`].
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);

        self.bell.ring();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    /// Snapshot of the current readiness without waiting.
    pub fn current(&self) -> PollResult {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        PollResult {
            sequence: state.sequence,
            supported: self.supported,
            active: state.active,
        }
    }

    /// The readiness protocol: wait for a sequence other than `past_seq`.
    pub async fn poll(&self, past_seq: u64, cancel: &CancellationToken) -> Result<PollResult> {
        loop {
            let listener = self.bell.listen();
            {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                debug_assert!(past_seq <= state.sequence, "poll from the future");
                if state.sequence != past_seq {
                    return Ok(PollResult {
                        sequence: state.sequence,
                        supported: self.supported,
                        active: state.active,
                    });
                }
                if state.closed {
                    return Err(KernelError::FileClosed);
                }
            }
            listener.wait(cancel).await?;
        }
    }

    fn clamp(&self, active: Events) -> Events {
        let clamped = active & self.supported;
        if clamped != active {
            tracing::warn!(
                requested = ?active,
                supported = ?self.supported,
                "dropping unsupported events from active set"
            );
        }
        clamped
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
