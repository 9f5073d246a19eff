/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Cross-CPU balancing: wake placement, push and pull.
//!
//! Push relocates the earliest pushable task of an overloaded runqueue to a
//! CPU whose earliest deadline is later; pull steals an earlier-deadline
//! task from an overloaded remote when the local runqueue may have just
//! lost its earliest. Both walk lock-free snapshots first (the root
//! domain's `cpudl` mirrors and overload mask) and re-verify everything
//! that matters after taking the remote lock, because
//! [`double_lock_balance`] may have released the holder's lock to respect
//! the canonical ordering.

use std::sync::{Arc, MutexGuard};
use std::time::Instant;

use tracing::{debug, trace};

use crate::class::{DlSystem, EnqueueFlags};
use crate::params::{CpuId, CpuMask, DlFlags};
use crate::rq::tree::EdfKey;
use crate::rq::Rq;
use crate::task::{DlTask, TaskId};
use crate::time::{dl_time_before, dl_time_max, Ns};

/// Attempts to find-and-lock a push target before giving up on a task.
pub const DL_MAX_TRIES: u32 = 3;

// ── Snapshots ─────────────────────────────────────────────────────────────────

/// Copied-out view of one task's placement-relevant state, taken under its
/// entity lock so no two entity locks are ever held together.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskSnapshot {
    pub id: TaskId,
    pub deadline: Ns,
    pub head: bool,
    pub nr_cpus_allowed: u32,
    pub mask: CpuMask,
    pub last_cpu: CpuId,
}

impl TaskSnapshot {
    pub fn key(&self) -> EdfKey {
        EdfKey {
            head: self.head,
            deadline: self.deadline,
            task: self.id,
        }
    }
}

/// Snapshot a task, or `None` if it is not in the deadline class.
pub(crate) fn snapshot(sys: &DlSystem, task: &Arc<DlTask>) -> Option<TaskSnapshot> {
    let ent = task.entity();
    if !ent.class.is_deadline() {
        return None;
    }
    Some(TaskSnapshot {
        id: task.id,
        deadline: ent.deadline,
        head: ent.flags.contains(DlFlags::HEAD),
        nr_cpus_allowed: ent.nr_cpus_allowed,
        mask: ent.cpus_allowed,
        last_cpu: task.cpu(),
    })
}

// ── Wake placement ────────────────────────────────────────────────────────────

/// Find a CPU whose running deadline (if any) is later than the task's.
///
/// Candidates are online CPUs in the task's affinity where either no
/// deadline task is queued or the earliest one has a later deadline. Among
/// them, the cache-hot last CPU wins, then the waking CPU, then the best of
/// the scan: an empty CPU if one exists, otherwise the CPU with the latest
/// earliest deadline (most headroom).
pub(crate) fn find_later_rq(
    sys: &DlSystem,
    p: &TaskSnapshot,
    this_cpu: CpuId,
) -> Option<CpuId> {
    if p.nr_cpus_allowed == 1 {
        return None;
    }

    let rd = sys.domain();
    let mut later = Vec::new();
    let mut first_empty: Option<CpuId> = None;
    let mut latest: Option<(CpuId, Ns)> = None;

    for cpu in rd.cpus() {
        if !rd.is_online(cpu) || !p.mask.contains(cpu) {
            continue;
        }
        let curr = rd.cpudl_curr(cpu);
        if curr == 0 {
            later.push(cpu);
            first_empty.get_or_insert(cpu);
        } else if dl_time_before(p.deadline, curr) {
            later.push(cpu);
            if latest.map_or(true, |(_, d)| dl_time_before(d, curr)) {
                latest = Some((cpu, curr));
            }
        }
    }

    if later.is_empty() {
        return None;
    }
    if later.contains(&p.last_cpu) {
        return Some(p.last_cpu);
    }
    if later.contains(&this_cpu) {
        return Some(this_cpu);
    }
    first_empty.or(latest.map(|(cpu, _)| cpu))
}

// ── Double locking ────────────────────────────────────────────────────────────

/// Acquire `that_cpu`'s lock while holding `this`, respecting the canonical
/// ascending-CPU order. The fast path is a trylock; on contention against a
/// lower-numbered CPU the holder's lock is released and both are re-taken
/// in order. The returned flag tells the caller its preconditions may have
/// been invalidated and must be re-verified.
pub(crate) fn double_lock_balance<'a>(
    sys: &'a DlSystem,
    this: MutexGuard<'a, Rq>,
    that_cpu: CpuId,
) -> (MutexGuard<'a, Rq>, MutexGuard<'a, Rq>, bool) {
    let this_cpu = this.cpu;
    debug_assert_ne!(this_cpu, that_cpu);

    if let Ok(that) = sys.rq_mutex(that_cpu).try_lock() {
        return (this, that, false);
    }

    if that_cpu < this_cpu {
        drop(this);
        let that = sys.rq_mutex(that_cpu).lock().expect("rq lock poisoned");
        let this = sys.rq_mutex(this_cpu).lock().expect("rq lock poisoned");
        (this, that, true)
    } else {
        let that = sys.rq_mutex(that_cpu).lock().expect("rq lock poisoned");
        (this, that, false)
    }
}

// ── Migration ─────────────────────────────────────────────────────────────────

/// Move a queued, non-running task between two locked runqueues:
/// deactivate, reassign the CPU, activate through the regular enqueue path
/// (which re-validates the CBS pair against the destination clock).
fn migrate(sys: &DlSystem, task: &Arc<DlTask>, src: &mut Rq, dst: &mut Rq) {
    {
        let mut ent = task.entity();
        let key = ent.queued_key.take().expect("migrating unqueued task");
        let migratable = ent.is_migratable();
        let (cpu, online) = (src.cpu, src.online);
        src.dl.dequeue(&key, migratable, sys.domain(), cpu, online);
        if let Some(pk) = ent.pushable_key.take() {
            src.dl.dequeue_pushable(&pk);
        }
    }
    task.set_cpu(dst.cpu);
    dst.clock = dl_time_max(dst.clock, src.clock);
    sys.enqueue_task_rq(dst, task, EnqueueFlags::empty());
    debug!(task = %task.id, from = src.cpu, to = dst.cpu, "migrated deadline task");
}

// ── Push engine ───────────────────────────────────────────────────────────────

/// Locate-and-lock a later runqueue for `task`, retrying up to
/// [`DL_MAX_TRIES`] times. Every retry re-verifies that the task is still
/// ours to push and that the target is still later, since the lock dance
/// may have let the world move.
fn find_lock_later_rq<'a>(
    sys: &'a DlSystem,
    task: &Arc<DlTask>,
    mut this: MutexGuard<'a, Rq>,
) -> (MutexGuard<'a, Rq>, Option<(CpuId, MutexGuard<'a, Rq>)>) {
    for _ in 0..DL_MAX_TRIES {
        let Some(p) = snapshot(sys, task) else { break };
        let Some(target) = find_later_rq(sys, &p, this.cpu) else { break };

        let (this2, that, _released) = double_lock_balance(sys, this, target);
        this = this2;

        // The lock dance may have released our lock: re-read everything.
        let (still_ours, deadline) = {
            let ent = task.entity();
            (
                task.cpu() == this.cpu
                    && ent.queued_key.is_some()
                    && this.curr != Some(task.id)
                    && ent.is_migratable()
                    && ent.cpus_allowed.contains(target),
                ent.deadline,
            )
        };
        let still_later =
            that.dl.nr_running == 0 || dl_time_before(deadline, that.dl.earliest.curr);

        if still_ours && still_later {
            return (this, Some((target, that)));
        }
        drop(that);
        this.dl.stats.nr_retry_push += 1;
        trace!(task = %task.id, target, "push target invalidated, retrying");
    }
    (this, None)
}

/// One push step. Returns `true` if a task was relocated and another
/// attempt is worthwhile.
fn push_dl_task<'a>(
    sys: &'a DlSystem,
    mut this: MutexGuard<'a, Rq>,
) -> (MutexGuard<'a, Rq>, bool) {
    if !this.dl.overloaded || !this.dl.has_pushable() {
        return (this, false);
    }

    let Some(next_key) = this.dl.pushable_leftmost() else {
        return (this, false);
    };
    if this.curr == Some(next_key.task) {
        debug_assert!(false, "running task {} found pushable", next_key.task);
        return (this, false);
    }
    let Some(task) = sys.task(next_key.task) else {
        return (this, false);
    };

    // If the candidate would preempt a movable current task, rescheduling
    // here is cheaper than a migration.
    if let Some(curr_id) = this.curr {
        if let Some(curr) = sys.task(curr_id) {
            if let (Some(p), Some(c)) = (snapshot(sys, &task), snapshot(sys, &curr)) {
                if p.key().preempts(&c.key()) && c.nr_cpus_allowed > 1 {
                    this.resched();
                    return (this, false);
                }
            }
        }
    }

    let (mut this, target) = find_lock_later_rq(sys, &task, this);
    let Some((_target_cpu, mut that)) = target else {
        // No home found after the retries: drop it from pushable and count
        // on some under-loaded CPU pulling it instead.
        let mut ent = task.entity();
        if let Some(pk) = ent.pushable_key.take() {
            this.dl.dequeue_pushable(&pk);
        }
        return (this, false);
    };

    migrate(sys, &task, &mut this, &mut that);
    that.resched();
    this.dl.stats.nr_push += 1;
    this.dl.stats.nr_pushed_away += 1;
    drop(that);
    (this, true)
}

/// Push until nothing moves any more.
pub(crate) fn push_dl_tasks<'a>(
    sys: &'a DlSystem,
    mut this: MutexGuard<'a, Rq>,
) -> MutexGuard<'a, Rq> {
    let t0 = Instant::now();
    loop {
        let (guard, pushed) = push_dl_task(sys, this);
        this = guard;
        if !pushed {
            break;
        }
    }
    this.dl.stats.push_cycles += t0.elapsed().as_nanos() as u64;
    this
}

// ── Pull engine ───────────────────────────────────────────────────────────────

/// Second-earliest candidate on `src` that may run on `for_cpu`. The
/// leftmost is deliberately skipped: it is the task `src` will run itself.
fn pick_next_earliest_dl_task(
    sys: &DlSystem,
    src: &Rq,
    for_cpu: CpuId,
) -> Option<(TaskId, Ns)> {
    let mut iter = src.dl.tree.iter();
    iter.next()?;
    for key in iter {
        let Some(task) = sys.task(key.task) else { continue };
        let ent = task.entity();
        if ent.cpus_allowed.contains(for_cpu) && src.curr != Some(key.task) {
            return Some((key.task, key.deadline));
        }
    }
    None
}

/// Steal earlier-deadline work from overloaded remotes. Called before
/// picking a new task when the previous one was deadline-class.
pub(crate) fn pull_dl_task<'a>(
    sys: &'a DlSystem,
    mut this: MutexGuard<'a, Rq>,
) -> (MutexGuard<'a, Rq>, bool) {
    if sys.domain().dlo_count() == 0 {
        return (this, false);
    }

    let t0 = Instant::now();
    let this_cpu = this.cpu;
    let overloaded = sys.domain().overloaded_mask();
    let mut dmin: Option<Ns> = None;
    let mut pulled = false;
    this.dl.stats.nr_pull += 1;

    for src_cpu in sys.domain().cpus() {
        if src_cpu == this_cpu || (overloaded >> src_cpu) & 1 == 0 {
            continue;
        }

        // The best we could steal is the remote's second-earliest; if ours
        // is already earlier there is nothing to gain.
        let remote_next = sys.domain().cpudl_next(src_cpu);
        if this.dl.nr_running > 0
            && remote_next != 0
            && dl_time_before(this.dl.earliest.curr, remote_next)
        {
            continue;
        }

        let (this2, mut src, _released) = double_lock_balance(sys, this, src_cpu);
        this = this2;

        // Never take the remote's last task.
        if src.dl.nr_running < 2 {
            drop(src);
            continue;
        }

        let Some((cand_id, cand_deadline)) = pick_next_earliest_dl_task(sys, &src, this_cpu)
        else {
            drop(src);
            continue;
        };

        let earlier_than_ours =
            this.dl.nr_running == 0 || dl_time_before(cand_deadline, this.dl.earliest.curr);
        let earlier_than_prev_pull = dmin.map_or(true, |d| dl_time_before(cand_deadline, d));
        if !(earlier_than_ours && earlier_than_prev_pull) {
            drop(src);
            continue;
        }

        // Only worth taking if the remote would not run it next anyway.
        if let Some(rcurr_id) = src.curr {
            if let Some(rcurr) = sys.task(rcurr_id) {
                if let Some(rc) = snapshot(sys, &rcurr) {
                    if !dl_time_before(cand_deadline, rc.deadline) {
                        drop(src);
                        continue;
                    }
                }
            }
        }

        let Some(cand) = sys.task(cand_id) else {
            drop(src);
            continue;
        };
        migrate(sys, &cand, &mut src, &mut this);
        this.dl.stats.nr_pulled_here += 1;
        dmin = Some(cand_deadline);
        pulled = true;
        this.resched();
        drop(src);
        // Keep scanning: another remote may hold something even earlier.
    }

    this.dl.stats.pull_cycles += t0.elapsed().as_nanos() as u64;
    (this, pulled)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::DlFlags;

    const MS: u64 = 1_000_000;

    fn dl_task(sys: &DlSystem, name: &str, cpu: CpuId, deadline_ms: u64) -> TaskId {
        let id = sys.task_fork(name, cpu);
        sys.set_dl_params(id, 1 * MS, deadline_ms * MS, deadline_ms * MS, DlFlags::empty(), 0)
            .unwrap();
        id
    }

    fn wake_on(sys: &DlSystem, id: TaskId, cpu: CpuId) {
        let task = sys.task(id).unwrap();
        task.set_cpu(cpu);
        task.entity().runnable = true;
        sys.enqueue_task(cpu, id, EnqueueFlags::WAKEUP);
    }

    // ── find_later_rq ─────────────────────────────────────────────────────────

    #[test]
    fn later_rq_prefers_idle_cpu() {
        let sys = DlSystem::new(2);
        let busy = dl_task(&sys, "busy", 0, 10);
        wake_on(&sys, busy, 0);

        let p = TaskSnapshot {
            id: TaskId(99),
            deadline: 100 * MS,
            head: false,
            nr_cpus_allowed: 2,
            mask: CpuMask::all(2),
            last_cpu: 0,
        };
        // CPU0 has an earlier deadline queued, CPU1 is empty.
        assert_eq!(find_later_rq(&sys, &p, 0), Some(1));
    }

    #[test]
    fn later_rq_prefers_cache_hot_last_cpu() {
        let sys = DlSystem::new(3);
        // Every CPU is a candidate (all empty); the last CPU wins.
        let p = TaskSnapshot {
            id: TaskId(99),
            deadline: 10 * MS,
            head: false,
            nr_cpus_allowed: 3,
            mask: CpuMask::all(3),
            last_cpu: 2,
        };
        assert_eq!(find_later_rq(&sys, &p, 0), Some(2));
    }

    #[test]
    fn later_rq_none_for_pinned_task() {
        let sys = DlSystem::new(2);
        let p = TaskSnapshot {
            id: TaskId(99),
            deadline: 10 * MS,
            head: false,
            nr_cpus_allowed: 1,
            mask: CpuMask::single(0),
            last_cpu: 0,
        };
        assert_eq!(find_later_rq(&sys, &p, 0), None);
    }

    #[test]
    fn later_rq_none_when_everyone_is_earlier() {
        let sys = DlSystem::new(2);
        let a = dl_task(&sys, "a", 0, 5);
        let b = dl_task(&sys, "b", 1, 5);
        wake_on(&sys, a, 0);
        wake_on(&sys, b, 1);

        let p = TaskSnapshot {
            id: TaskId(99),
            deadline: 100 * MS,
            head: false,
            nr_cpus_allowed: 2,
            mask: CpuMask::all(2),
            last_cpu: 0,
        };
        assert_eq!(find_later_rq(&sys, &p, 0), None);
    }

    #[test]
    fn later_rq_picks_latest_headroom_among_busy() {
        let sys = DlSystem::new(3);
        let a = dl_task(&sys, "a", 1, 20);
        let b = dl_task(&sys, "b", 2, 50);
        wake_on(&sys, a, 1);
        wake_on(&sys, b, 2);
        // CPU0: the waking CPU; candidate set is {1, 2}; p last ran on a
        // CPU outside the set; CPU2 has the most headroom.
        let mut p = TaskSnapshot {
            id: TaskId(99),
            deadline: 10 * MS,
            head: false,
            nr_cpus_allowed: 2,
            mask: CpuMask(0b110),
            last_cpu: 0,
        };
        assert_eq!(find_later_rq(&sys, &p, 0), Some(2));
        // With the last CPU inside the candidate set, cache wins.
        p.last_cpu = 1;
        assert_eq!(find_later_rq(&sys, &p, 0), Some(1));
    }

    #[test]
    fn later_rq_skips_offline_cpus() {
        let sys = DlSystem::new(2);
        sys.rq_offline(1);
        let p = TaskSnapshot {
            id: TaskId(99),
            deadline: 10 * MS,
            head: false,
            nr_cpus_allowed: 2,
            mask: CpuMask::all(2),
            last_cpu: 1,
        };
        assert_eq!(find_later_rq(&sys, &p, 0), Some(0));
    }

    // ── double_lock_balance ───────────────────────────────────────────────────

    #[test]
    fn double_lock_uncontended_keeps_holder() {
        let sys = DlSystem::new(2);
        let this = sys.lock_rq(0);
        let (this, that, released) = double_lock_balance(&sys, this, 1);
        assert!(!released);
        assert_eq!(this.cpu, 0);
        assert_eq!(that.cpu, 1);
    }

    // ── push ──────────────────────────────────────────────────────────────────

    #[test]
    fn push_moves_surplus_task_to_idle_cpu() {
        let sys = DlSystem::new(2);
        let a = dl_task(&sys, "a", 0, 10);
        let b = dl_task(&sys, "b", 0, 30);
        wake_on(&sys, a, 0);
        wake_on(&sys, b, 0);

        // a runs on CPU0; b is pushable; CPU1 is idle.
        let picked = sys.pick_next_task(0).unwrap();
        assert_eq!(picked, a);
        sys.lock_rq(0).curr = Some(a);

        let this = sys.lock_rq(0);
        let this = push_dl_tasks(&sys, this);
        drop(this);

        assert_eq!(sys.task(b).unwrap().cpu(), 1);
        let rq1 = sys.lock_rq(1);
        assert_eq!(rq1.dl.nr_running, 1);
        assert!(rq1.need_resched);
        drop(rq1);
        assert_eq!(sys.lock_rq(0).dl.nr_running, 1);
        assert_eq!(sys.lock_rq(0).dl.stats.nr_pushed_away, 1);
    }

    #[test]
    fn push_stops_when_not_overloaded() {
        let sys = DlSystem::new(2);
        let a = dl_task(&sys, "a", 0, 10);
        wake_on(&sys, a, 0);

        let this = sys.lock_rq(0);
        let this = push_dl_tasks(&sys, this);
        assert_eq!(this.dl.nr_running, 1, "single task is never pushed");
    }

    #[test]
    fn push_prefers_resched_over_migrating_an_earlier_task() {
        let sys = DlSystem::new(2);
        // Current task has a LATER deadline than the pushable one, and is
        // migratable itself: cheaper to reschedule locally.
        let late = dl_task(&sys, "late", 0, 50);
        let early = dl_task(&sys, "early", 0, 10);
        wake_on(&sys, late, 0);
        wake_on(&sys, early, 0);
        {
            let mut rq = sys.lock_rq(0);
            rq.curr = Some(late);
            rq.need_resched = false;
        }
        // Make "early" pushable (it is not running).
        let this = sys.lock_rq(0);
        let this = push_dl_tasks(&sys, this);
        assert!(this.need_resched);
        assert_eq!(this.dl.nr_running, 2, "nothing migrated");
    }

    #[test]
    fn push_gives_up_when_no_later_cpu_exists() {
        let sys = DlSystem::new(2);
        let a = dl_task(&sys, "a", 0, 10);
        let b = dl_task(&sys, "b", 0, 30);
        let remote = dl_task(&sys, "remote", 1, 5);
        wake_on(&sys, a, 0);
        wake_on(&sys, b, 0);
        wake_on(&sys, remote, 1);
        let picked = sys.pick_next_task(0);
        assert_eq!(picked, Some(a));
        sys.lock_rq(0).curr = picked;

        let this = sys.lock_rq(0);
        let this = push_dl_tasks(&sys, this);
        // b stays, and is dropped from pushable so the loop terminates.
        assert_eq!(this.dl.nr_running, 2);
        assert!(!this.dl.has_pushable());
    }

    // ── pull ──────────────────────────────────────────────────────────────────

    /// CPU0 is still running a 30ms-deadline task when two earlier ones
    /// arrive; the remote will switch to the 10ms one itself, so an idle
    /// CPU1 pulls the 20ms one (the second-earliest).
    fn overloaded_cpu0(sys: &DlSystem) -> (TaskId, TaskId, TaskId) {
        let c = dl_task(sys, "c", 0, 30);
        wake_on(sys, c, 0);
        let picked = sys.pick_next_task(0);
        assert_eq!(picked, Some(c));
        sys.lock_rq(0).curr = picked;

        let a = dl_task(sys, "a", 0, 10);
        let b = dl_task(sys, "b", 0, 20);
        wake_on(sys, a, 0);
        wake_on(sys, b, 0);
        (a, b, c)
    }

    #[test]
    fn pull_steals_second_earliest_from_overloaded_remote() {
        let sys = DlSystem::new(2);
        let (_a, b, _c) = overloaded_cpu0(&sys);

        // CPU1 idle, previous task was deadline-class: pull b over.
        let this = sys.lock_rq(1);
        let (this, pulled) = pull_dl_task(&sys, this);
        assert!(pulled);
        assert_eq!(this.dl.nr_running, 1);
        assert_eq!(this.dl.stats.nr_pulled_here, 1);
        drop(this);
        assert_eq!(sys.task(b).unwrap().cpu(), 1);
        assert_eq!(sys.lock_rq(0).dl.nr_running, 2);
    }

    #[test]
    fn pull_skips_when_nothing_is_overloaded() {
        let sys = DlSystem::new(2);
        let a = dl_task(&sys, "a", 0, 10);
        wake_on(&sys, a, 0);

        let this = sys.lock_rq(1);
        let (this, pulled) = pull_dl_task(&sys, this);
        assert!(!pulled);
        assert_eq!(this.dl.nr_running, 0);
    }

    #[test]
    fn pull_never_takes_the_leftmost() {
        let sys = DlSystem::new(2);
        let (a, _b, _c) = overloaded_cpu0(&sys);

        let this = sys.lock_rq(1);
        let (this, _) = pull_dl_task(&sys, this);
        drop(this);
        // a (the leftmost, the remote's own next pick) stays home.
        assert_eq!(sys.task(a).unwrap().cpu(), 0);
    }

    #[test]
    fn pull_leaves_remote_alone_when_it_runs_its_earliest() {
        let sys = DlSystem::new(2);
        let a = dl_task(&sys, "a", 0, 10);
        let b = dl_task(&sys, "b", 0, 20);
        wake_on(&sys, a, 0);
        wake_on(&sys, b, 0);
        let picked = sys.pick_next_task(0);
        assert_eq!(picked, Some(a));
        sys.lock_rq(0).curr = picked;

        let this = sys.lock_rq(1);
        let (_rq_guard, pulled) = pull_dl_task(&sys, this);
        // The only candidate (b, 20ms) is later than what the remote is
        // running (a, 10ms): the remote is doing fine, leave it be.
        assert!(!pulled);
    }

    #[test]
    fn pull_respects_affinity_of_candidates() {
        let sys = DlSystem::new(2);
        let (_a, b, _c) = overloaded_cpu0(&sys);
        sys.set_cpus_allowed(b, CpuMask::single(0));
        // The other candidate (a) is what the remote runs next; b is
        // pinned: nothing to take.
        let this = sys.lock_rq(1);
        let (_rq_guard, pulled) = pull_dl_task(&sys, this);
        assert!(!pulled, "pinned candidate cannot be pulled");
    }

    #[test]
    fn pull_skips_remote_whose_candidate_is_later_than_ours() {
        let sys = DlSystem::new(2);
        let (_a, _b, _c) = overloaded_cpu0(&sys);
        let mine = dl_task(&sys, "mine", 1, 15);
        wake_on(&sys, mine, 1);

        let this = sys.lock_rq(1);
        let (_rq_guard, pulled) = pull_dl_task(&sys, this);
        // Remote's second-earliest (20ms) is later than our earliest
        // (15ms): nothing gained.
        assert!(!pulled);
    }

    // ── pick_next_earliest_dl_task ────────────────────────────────────────────

    #[test]
    fn second_candidate_skips_leftmost_even_when_it_matches() {
        let sys = DlSystem::new(2);
        let a = dl_task(&sys, "a", 0, 10);
        let b = dl_task(&sys, "b", 0, 20);
        wake_on(&sys, a, 0);
        wake_on(&sys, b, 0);

        let src = sys.lock_rq(0);
        let got = pick_next_earliest_dl_task(&sys, &src, 1);
        assert_eq!(got, Some((b, src.dl.tree.second().unwrap().deadline)));
    }
}
