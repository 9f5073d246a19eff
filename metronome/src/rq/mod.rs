/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Per-CPU runqueue state for the deadline class.
//!
//! [`DlRq`] owns the two ordered trees (ready and pushable), the migratory
//! accounting that feeds overload tracking, and the incrementally-maintained
//! `earliest` pair that is mirrored into the root domain for lock-free
//! remote reads. [`Rq`] wraps it with the clock, the current task, and the
//! reschedule flag; one `Mutex<Rq>` per CPU lives in the system.

pub mod tree;

use tracing::trace;

use crate::domain::RootDomain;
use crate::params::CpuId;
use crate::task::TaskId;
use crate::time::{dl_time_before, Ns};
use tree::{EdfKey, EdfTree};

// ── Statistics ────────────────────────────────────────────────────────────────

/// Observable per-runqueue counters. Never consulted by scheduling
/// decisions. `*_cycles` accumulate wall nanoseconds spent in the
/// corresponding operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct DlRqStats {
    pub nr_enqueue: u64,
    pub nr_dequeue: u64,
    pub nr_push: u64,
    pub nr_retry_push: u64,
    pub nr_pushed_away: u64,
    pub nr_pull: u64,
    pub nr_pulled_here: u64,
    pub enqueue_cycles: u64,
    pub dequeue_cycles: u64,
    pub push_cycles: u64,
    pub pull_cycles: u64,
    /// Total runtime charged to deadline tasks on this CPU, ns.
    pub exec_clock: u64,
}

// ── Earliest pair ─────────────────────────────────────────────────────────────

/// Deadlines of the first and second-earliest ready tasks. `0` is the
/// "none" sentinel (absolute deadlines are never 0 in practice).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EarliestDl {
    pub curr: Ns,
    pub next: Ns,
}

// ── Deadline runqueue ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct DlRq {
    /// Ready entities, EDF order.
    pub tree: EdfTree,
    /// Cardinality of `tree`.
    pub nr_running: usize,
    /// Ready entities whose affinity allows more than one CPU.
    pub nr_migratory: usize,
    /// True iff `nr_migratory >= 1 && nr_running >= 2`.
    pub overloaded: bool,
    pub earliest: EarliestDl,
    /// Migratable, non-running entities, deadline order.
    pub pushable: EdfTree,
    pub stats: DlRqStats,
}

impl DlRq {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit an entity to the ready tree and update every derived counter.
    pub fn enqueue(
        &mut self,
        key: EdfKey,
        migratable: bool,
        rd: &RootDomain,
        cpu: CpuId,
        online: bool,
    ) {
        let inserted = self.tree.insert(key);
        debug_assert!(inserted, "entity {} already in ready tree", key.task);

        self.nr_running += 1;
        if migratable {
            self.nr_migratory += 1;
        }
        self.inc_deadline(key.deadline, rd, cpu);
        self.update_overload(rd, cpu, online);
        self.stats.nr_enqueue += 1;
        trace!(cpu, task = %key.task, deadline = key.deadline, "dl enqueue");
    }

    /// Remove an entity from the ready tree and update every derived
    /// counter.
    pub fn dequeue(
        &mut self,
        key: &EdfKey,
        migratable: bool,
        rd: &RootDomain,
        cpu: CpuId,
        online: bool,
    ) {
        let removed = self.tree.remove(key);
        debug_assert!(removed, "entity {} not in ready tree", key.task);

        self.nr_running -= 1;
        if migratable {
            debug_assert!(self.nr_migratory > 0);
            self.nr_migratory -= 1;
        }
        self.dec_deadline(rd, cpu);
        self.update_overload(rd, cpu, online);
        self.stats.nr_dequeue += 1;
        trace!(cpu, task = %key.task, "dl dequeue");
    }

    /// Adjust `nr_migratory` when a queued entity's affinity changes
    /// between pinned and migratable.
    pub fn migratory_changed(
        &mut self,
        now_migratable: bool,
        rd: &RootDomain,
        cpu: CpuId,
        online: bool,
    ) {
        if now_migratable {
            self.nr_migratory += 1;
        } else {
            debug_assert!(self.nr_migratory > 0);
            self.nr_migratory -= 1;
        }
        self.update_overload(rd, cpu, online);
    }

    // ── Pushable tree ─────────────────────────────────────────────────────────

    pub fn enqueue_pushable(&mut self, key: EdfKey) {
        let inserted = self.pushable.insert(key);
        debug_assert!(inserted, "entity {} already pushable", key.task);
    }

    pub fn dequeue_pushable(&mut self, key: &EdfKey) {
        let removed = self.pushable.remove(key);
        debug_assert!(removed, "entity {} not pushable", key.task);
    }

    pub fn has_pushable(&self) -> bool {
        !self.pushable.is_empty()
    }

    pub fn pushable_leftmost(&self) -> Option<EdfKey> {
        self.pushable.leftmost()
    }

    // ── Derived state maintenance ─────────────────────────────────────────────

    /// Overload transition per the invariant
    /// `overloaded <-> (nr_migratory >= 1 && nr_running >= 2)`. The root
    /// domain bit is only touched while the runqueue is online; the online
    /// transition replays it.
    fn update_overload(&mut self, rd: &RootDomain, cpu: CpuId, online: bool) {
        let want = self.nr_migratory >= 1 && self.nr_running >= 2;
        if want == self.overloaded {
            return;
        }
        self.overloaded = want;
        if !online {
            return;
        }
        if want {
            rd.set_overload(cpu);
        } else {
            rd.clear_overload(cpu);
        }
    }

    /// Incremental `earliest` update on insert.
    fn inc_deadline(&mut self, deadline: Ns, rd: &RootDomain, cpu: CpuId) {
        if self.earliest.curr == 0 || dl_time_before(deadline, self.earliest.curr) {
            self.earliest.next = self.earliest.curr;
            self.earliest.curr = deadline;
        } else if self.earliest.next == 0 || dl_time_before(deadline, self.earliest.next) {
            self.earliest.next = deadline;
        }
        rd.cpudl_set(cpu, self.earliest.curr, self.earliest.next);
    }

    /// `earliest` recomputation on remove: read back from the tree.
    fn dec_deadline(&mut self, rd: &RootDomain, cpu: CpuId) {
        if self.nr_running == 0 {
            self.earliest = EarliestDl::default();
        } else {
            self.earliest.curr = self.tree.leftmost().map(|k| k.deadline).unwrap_or(0);
            self.earliest.next = self.tree.second().map(|k| k.deadline).unwrap_or(0);
        }
        rd.cpudl_set(cpu, self.earliest.curr, self.earliest.next);
    }
}

// ── Runqueue wrapper ──────────────────────────────────────────────────────────

/// One CPU's runqueue: clock, current task, reschedule flag, and the
/// deadline sub-queue. The generic driver owns the non-deadline classes.
#[derive(Debug)]
pub struct Rq {
    pub cpu: CpuId,
    /// Monotonic runqueue clock, ns, advanced by the driver before any hook
    /// runs.
    pub clock: Ns,
    pub online: bool,
    /// Task currently on this CPU, any class. `None` means idle.
    pub curr: Option<TaskId>,
    pub need_resched: bool,
    pub dl: DlRq,
}

impl Rq {
    pub fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            clock: 0,
            online: true,
            curr: None,
            need_resched: false,
            dl: DlRq::new(),
        }
    }

    /// Request a reschedule on this CPU.
    pub fn resched(&mut self) {
        self.need_resched = true;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn key(deadline: Ns, task: u32) -> EdfKey {
        EdfKey {
            head: false,
            deadline,
            task: TaskId(task),
        }
    }

    // ── counters & earliest ───────────────────────────────────────────────────

    #[test]
    fn enqueue_maintains_counts_and_earliest() {
        let rd = RootDomain::new(2);
        let mut dl = DlRq::new();

        dl.enqueue(key(30, 1), true, &rd, 0, true);
        assert_eq!(dl.nr_running, 1);
        assert_eq!(dl.earliest, EarliestDl { curr: 30, next: 0 });
        assert_eq!(rd.cpudl_curr(0), 30);

        dl.enqueue(key(10, 2), true, &rd, 0, true);
        assert_eq!(dl.earliest, EarliestDl { curr: 10, next: 30 });

        dl.enqueue(key(20, 3), false, &rd, 0, true);
        assert_eq!(dl.earliest, EarliestDl { curr: 10, next: 20 });
        assert_eq!(dl.nr_migratory, 2);
        assert_eq!(rd.cpudl_curr(0), 10);
        assert_eq!(rd.cpudl_next(0), 20);
    }

    #[test]
    fn dequeue_recomputes_earliest_from_tree() {
        let rd = RootDomain::new(1);
        let mut dl = DlRq::new();
        dl.enqueue(key(10, 1), true, &rd, 0, true);
        dl.enqueue(key(20, 2), true, &rd, 0, true);
        dl.enqueue(key(30, 3), true, &rd, 0, true);

        dl.dequeue(&key(10, 1), true, &rd, 0, true);
        assert_eq!(dl.earliest, EarliestDl { curr: 20, next: 30 });

        dl.dequeue(&key(30, 3), true, &rd, 0, true);
        assert_eq!(dl.earliest, EarliestDl { curr: 20, next: 0 });

        dl.dequeue(&key(20, 2), true, &rd, 0, true);
        assert_eq!(dl.earliest, EarliestDl::default());
        assert_eq!(rd.cpudl_curr(0), 0);
    }

    // ── overload ──────────────────────────────────────────────────────────────

    #[test]
    fn overload_requires_two_tasks_and_a_migratable_one() {
        let rd = RootDomain::new(1);
        let mut dl = DlRq::new();

        dl.enqueue(key(10, 1), true, &rd, 0, true);
        assert!(!dl.overloaded, "one task is never overload");

        dl.enqueue(key(20, 2), false, &rd, 0, true);
        assert!(dl.overloaded);
        assert!(rd.is_overloaded(0));
        assert_eq!(rd.dlo_count(), 1);

        dl.dequeue(&key(10, 1), true, &rd, 0, true);
        assert!(!dl.overloaded, "pinned leftover cannot be overload");
        assert!(!rd.is_overloaded(0));
        assert_eq!(rd.dlo_count(), 0);
    }

    #[test]
    fn two_pinned_tasks_are_not_overload() {
        let rd = RootDomain::new(1);
        let mut dl = DlRq::new();
        dl.enqueue(key(10, 1), false, &rd, 0, true);
        dl.enqueue(key(20, 2), false, &rd, 0, true);
        assert!(!dl.overloaded);
    }

    #[test]
    fn offline_rq_never_touches_domain_bit() {
        let rd = RootDomain::new(1);
        let mut dl = DlRq::new();
        dl.enqueue(key(10, 1), true, &rd, 0, false);
        dl.enqueue(key(20, 2), true, &rd, 0, false);
        assert!(dl.overloaded, "local flag still tracks the condition");
        assert!(!rd.is_overloaded(0), "domain bit untouched while offline");
    }

    #[test]
    fn affinity_change_flips_overload() {
        let rd = RootDomain::new(1);
        let mut dl = DlRq::new();
        dl.enqueue(key(10, 1), false, &rd, 0, true);
        dl.enqueue(key(20, 2), false, &rd, 0, true);
        assert!(!dl.overloaded);

        // Task 1 becomes migratable.
        dl.migratory_changed(true, &rd, 0, true);
        assert!(dl.overloaded);

        dl.migratory_changed(false, &rd, 0, true);
        assert!(!dl.overloaded);
    }

    // ── pushable ──────────────────────────────────────────────────────────────

    #[test]
    fn pushable_leftmost_is_earliest() {
        let mut dl = DlRq::new();
        dl.enqueue_pushable(key(20, 1));
        dl.enqueue_pushable(key(10, 2));
        assert_eq!(dl.pushable_leftmost(), Some(key(10, 2)));
        dl.dequeue_pushable(&key(10, 2));
        assert_eq!(dl.pushable_leftmost(), Some(key(20, 1)));
        dl.dequeue_pushable(&key(20, 1));
        assert!(!dl.has_pushable());
    }
}
