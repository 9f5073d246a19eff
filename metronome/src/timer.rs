/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! One-shot absolute timers in the monotonic clock domain.
//!
//! The queue stands in for the high-resolution timer subsystem: callers arm
//! absolute events, the driver advances the timer clock and collects what
//! came due, then dispatches each callback with **no locks held** — the
//! callback acquires the runqueue lock it needs, exactly like an hrtimer
//! handler running in IRQ context.
//!
//! Cancellation is by generation counter: the owning entity bumps its
//! generation, and a collected event carrying a stale generation is dropped
//! by the dispatcher. With the single-threaded driver this is synchronous
//! cancel-and-wait; nothing can be mid-callback while the canceller runs.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use crate::params::CpuId;
use crate::task::TaskId;
use crate::time::Ns;

// ── Events ────────────────────────────────────────────────────────────────────

/// What an expired timer asks the dispatcher to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Per-entity replenishment timer. `gen` must match the entity's
    /// current timer generation or the event is stale.
    Replenish { task: TaskId, gen: u64 },
    /// High-resolution tick requested by `task_tick` for precise budget
    /// exhaustion on the given CPU.
    HrTick { cpu: CpuId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    at: Ns,
    seq: u64,
    kind: TimerKind,
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// ── Queue ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Inner {
    now: Ns,
    seq: u64,
    heap: BinaryHeap<Reverse<Pending>>,
}

/// Shared timer queue. Its lock is a leaf: never held while a runqueue or
/// entity lock is taken.
#[derive(Debug, Default)]
pub struct TimerQueue {
    inner: Mutex<Inner>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current timer-subsystem clock. May differ from a runqueue clock;
    /// the arming path compensates for the skew.
    pub fn now(&self) -> Ns {
        self.inner.lock().expect("timer lock poisoned").now
    }

    /// Arm a one-shot event at absolute instant `at`.
    pub fn arm(&self, at: Ns, kind: TimerKind) {
        let mut inner = self.inner.lock().expect("timer lock poisoned");
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(Reverse(Pending { at, seq, kind }));
    }

    /// Earliest pending expiry, if any.
    pub fn next_expiry(&self) -> Option<Ns> {
        let inner = self.inner.lock().expect("timer lock poisoned");
        inner.heap.peek().map(|Reverse(p)| p.at)
    }

    /// Advance the timer clock to `now` and collect every event that came
    /// due, in firing order. The caller dispatches them lock-free.
    pub fn take_due(&self, now: Ns) -> Vec<TimerKind> {
        let mut inner = self.inner.lock().expect("timer lock poisoned");
        inner.now = now;
        let mut due = Vec::new();
        while let Some(Reverse(p)) = inner.heap.peek() {
            if p.at > now {
                break;
            }
            let Reverse(p) = inner.heap.pop().expect("peeked entry vanished");
            due.push(p.kind);
        }
        due
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
