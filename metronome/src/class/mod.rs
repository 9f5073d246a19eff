/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The deadline scheduling class: dispatch hooks and CBS enforcement.
//!
//! [`DlSystem`] owns one locked runqueue per CPU, the shared root domain,
//! the task table, and the timer queue, and exposes the hook table the
//! generic scheduler core consumes:
//!
//! ```text
//! enqueue_task / dequeue_task        admission to / removal from the ready tree
//! yield_task                         give up the rest of this instance
//! check_preempt_curr                 EDF preemption decision
//! pick_next_task / put_prev_task     dispatch edge
//! set_curr_task / task_tick          running-task bookkeeping
//! select_task_rq / set_cpus_allowed  placement and affinity
//! rq_online / rq_offline             hotplug
//! pre_schedule / post_schedule       pull / push balancing entry points
//! task_woken                         push after a remote wakeup
//! task_fork / task_dead              lifecycle
//! switched_from / switched_to / prio_changed
//! ```
//!
//! Lock order, everywhere: runqueue locks in ascending CPU index, then at
//! most one entity lock, with the timer queue lock only taken on its own.

pub mod balance;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, trace};

use crate::domain::RootDomain;
use crate::entity::DlEntity;
use crate::params::{CpuId, CpuMask, DlFlags, DlParams, DlParamsError, MAX_RT_PRIO};
use crate::rq::Rq;
use crate::task::{DlTask, SchedClass, TaskId};
use crate::timer::{TimerKind, TimerQueue};
use crate::time::{dl_time_before, dl_time_max, Ns};

// ── Hook flags ────────────────────────────────────────────────────────────────

bitflags::bitflags! {
    /// Hints passed to [`DlSystem::enqueue_task`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnqueueFlags: u32 {
        /// The task is being woken up.
        const WAKEUP = 0x1;
        /// Force the replenishment path (the timer callback's enqueue).
        const REPLENISH = 0x2;
    }
}

bitflags::bitflags! {
    /// Hints passed to [`DlSystem::dequeue_task`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DequeueFlags: u32 {
        /// The task is going to sleep (voluntary block).
        const SLEEP = 0x1;
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failures of the parameter installer. Scheduling itself never fails
/// visibly; only the configuration boundary does.
#[derive(Debug, Error)]
pub enum DlInstallError {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
    #[error(transparent)]
    Params(#[from] DlParamsError),
}

// ── System ────────────────────────────────────────────────────────────────────

/// The deadline class instance for one root domain: per-CPU runqueues,
/// shared overload state, task table and timers.
pub struct DlSystem {
    rqs: Vec<Mutex<Rq>>,
    rd: Arc<RootDomain>,
    tasks: RwLock<BTreeMap<TaskId, Arc<DlTask>>>,
    timers: TimerQueue,
    next_id: AtomicU32,
}

impl DlSystem {
    pub fn new(nr_cpus: u32) -> Self {
        Self {
            rqs: (0..nr_cpus).map(|c| Mutex::new(Rq::new(c))).collect(),
            rd: Arc::new(RootDomain::new(nr_cpus)),
            tasks: RwLock::new(BTreeMap::new()),
            timers: TimerQueue::new(),
            next_id: AtomicU32::new(0),
        }
    }

    pub fn nr_cpus(&self) -> u32 {
        self.rqs.len() as u32
    }

    pub fn domain(&self) -> &RootDomain {
        &self.rd
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    /// Look a task up by id. The `Arc` is cloned out so no table lock is
    /// held while runqueue or entity locks are taken.
    pub fn task(&self, id: TaskId) -> Option<Arc<DlTask>> {
        self.tasks.read().expect("task table poisoned").get(&id).cloned()
    }

    /// All live tasks, in id order. For drivers and diagnostics.
    pub fn all_tasks(&self) -> Vec<Arc<DlTask>> {
        self.tasks
            .read()
            .expect("task table poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn lock_rq(&self, cpu: CpuId) -> MutexGuard<'_, Rq> {
        self.rqs[cpu as usize].lock().expect("rq lock poisoned")
    }

    pub(crate) fn rq_mutex(&self, cpu: CpuId) -> &Mutex<Rq> {
        &self.rqs[cpu as usize]
    }

    /// Advance one runqueue clock. Clocks never go backwards.
    pub fn update_rq_clock(&self, cpu: CpuId, now: Ns) {
        let mut rq = self.lock_rq(cpu);
        rq.clock = dl_time_max(rq.clock, now);
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Create a task in the forked state: throttled, not a new instance,
    /// off every tree. It cannot run in this class until parameters are
    /// installed.
    pub fn task_fork(&self, name: impl Into<String>, cpu: CpuId) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = Arc::new(DlTask::new(id, name, cpu));
        // DlEntity::new() is exactly the fork state.
        self.tasks
            .write()
            .expect("task table poisoned")
            .insert(id, task);
        id
    }

    /// Install deadline parameters, moving the task into the class (or
    /// re-parameterising it in place). Contributes `dl_bw` to the domain
    /// total, withdraws the previous contribution first when
    /// re-parameterising.
    pub fn set_dl_params(
        &self,
        id: TaskId,
        runtime: Ns,
        deadline: Ns,
        period: Ns,
        flags: DlFlags,
        rt_priority: u32,
    ) -> Result<(), DlInstallError> {
        let params = DlParams::new(runtime, deadline, period)?;
        let task = self.task(id).ok_or(DlInstallError::UnknownTask(id))?;

        let mut rq = self.lock_rq(task.cpu());
        let (was_dl, was_queued, was_running, old_bw) = {
            let ent = task.entity();
            (
                ent.class.is_deadline(),
                ent.queued_key.is_some(),
                rq.curr == Some(id),
                ent.params.dl_bw,
            )
        };

        if was_queued {
            self.dequeue_task_rq(&mut rq, &task, DequeueFlags::empty());
        }

        {
            let mut ent = task.entity();
            ent.params = params;
            ent.flags = flags;
            ent.rt_priority = rt_priority.min(MAX_RT_PRIO - 1);
            ent.class = SchedClass::Deadline;
            ent.dl_new = true;
            // A pending replenishment belongs to the old parameters.
            ent.dl_throttled = false;
            ent.timer_gen += 1;
            ent.timer_armed = false;
        }

        if was_dl {
            self.rd.sub_bw(old_bw);
        }
        self.rd.add_bw(params.dl_bw);

        if was_queued {
            self.enqueue_task_rq(&mut rq, &task, EnqueueFlags::empty());
        }
        if was_dl {
            rq = self.prio_changed_rq(rq, &task, was_running);
        } else {
            self.switched_to_rq(&mut rq, &task);
        }
        drop(rq);

        debug!(task = %id, runtime, deadline, period, "deadline parameters installed");
        Ok(())
    }

    /// Move a task out of the deadline class (e.g. back to fair). The
    /// replenishment timer is cancelled and the bandwidth withdrawn.
    pub fn set_sched_class(&self, id: TaskId, class: SchedClass) {
        let Some(task) = self.task(id) else { return };
        if class.is_deadline() {
            debug_assert!(false, "use set_dl_params to join the deadline class");
            return;
        }

        let mut rq = self.lock_rq(task.cpu());
        let (was_dl, was_queued, bw) = {
            let ent = task.entity();
            (ent.class.is_deadline(), ent.queued_key.is_some(), ent.params.dl_bw)
        };
        if !was_dl {
            task.entity().class = class;
            return;
        }

        if was_queued {
            self.dequeue_task_rq(&mut rq, &task, DequeueFlags::empty());
        }
        task.entity().class = class;
        let rq = self.switched_from_rq(rq, &task);
        drop(rq);

        self.rd.sub_bw(bw);
    }

    /// Task exit: withdraw bandwidth and cancel the replenishment timer.
    /// Called with no runqueue lock held; the generation bump synchronises
    /// with any in-flight callback.
    pub fn task_dead(&self, id: TaskId) {
        let Some(task) = self.task(id) else { return };
        {
            let mut ent = task.entity();
            debug_assert!(ent.queued_key.is_none(), "dead task still queued");
            if ent.class.is_deadline() {
                self.rd.sub_bw(ent.params.dl_bw);
            }
            ent.timer_gen += 1;
            ent.timer_armed = false;
            ent.runnable = false;
        }
        self.tasks.write().expect("task table poisoned").remove(&id);
        debug!(task = %id, "deadline task dead");
    }

    // ── Hook table ────────────────────────────────────────────────────────────

    pub fn enqueue_task(&self, cpu: CpuId, id: TaskId, flags: EnqueueFlags) {
        let Some(task) = self.task(id) else { return };
        let mut rq = self.lock_rq(cpu);
        self.enqueue_task_rq(&mut rq, &task, flags);
    }

    pub fn dequeue_task(&self, cpu: CpuId, id: TaskId, flags: DequeueFlags) {
        let Some(task) = self.task(id) else { return };
        let mut rq = self.lock_rq(cpu);
        self.dequeue_task_rq(&mut rq, &task, flags);
    }

    /// Voluntary yield: surrender the rest of the instance and sleep until
    /// the next replenishment produces a fresh one.
    pub fn yield_task(&self, cpu: CpuId) {
        let mut rq = self.lock_rq(cpu);
        let Some(id) = rq.curr else { return };
        let Some(task) = self.task(id) else { return };
        {
            let mut ent = task.entity();
            if !ent.class.is_deadline() {
                return;
            }
            ent.dl_new = true;
            ent.runtime = 0;
        }
        // Zero runtime makes the accounting below throttle the task and arm
        // the timer at its current deadline.
        self.update_curr(&mut rq);
    }

    pub fn check_preempt_curr(&self, cpu: CpuId, id: TaskId) {
        let Some(task) = self.task(id) else { return };
        let mut rq = self.lock_rq(cpu);
        self.check_preempt_curr_rq(&mut rq, &task);
    }

    /// EDF choice: the leftmost ready entity, if any. Sets its dispatch
    /// timestamp and removes it from the pushable tree; the caller makes it
    /// the running task.
    pub fn pick_next_task(&self, cpu: CpuId) -> Option<TaskId> {
        let mut rq = self.lock_rq(cpu);
        self.pick_next_task_rq(&mut rq)
    }

    pub fn put_prev_task(&self, cpu: CpuId, id: TaskId) {
        let Some(task) = self.task(id) else { return };
        let mut rq = self.lock_rq(cpu);
        self.put_prev_task_rq(&mut rq, &task);
    }

    /// Running-task tick: charge runtime, and report the delay at which a
    /// high-resolution tick would hit budget exhaustion precisely (only
    /// when it is more than 10us away, same as the dispatch path).
    pub fn task_tick(&self, cpu: CpuId, queued: bool) -> Option<u64> {
        let mut rq = self.lock_rq(cpu);
        self.update_curr(&mut rq);

        let id = rq.curr?;
        let task = self.task(id)?;
        let ent = task.entity();
        if !ent.class.is_deadline() || ent.queued_key.is_none() {
            return None;
        }
        let declared = ent.ref_params().dl_runtime as i64;
        if queued && ent.runtime > 0 && declared - ent.runtime > 10_000 {
            Some(ent.runtime as u64)
        } else {
            None
        }
    }

    /// The task just became the running one by some path other than
    /// `pick_next_task`.
    pub fn set_curr_task(&self, cpu: CpuId) {
        let mut rq = self.lock_rq(cpu);
        let Some(id) = rq.curr else { return };
        let Some(task) = self.task(id) else { return };
        let mut ent = task.entity();
        if !ent.class.is_deadline() {
            return;
        }
        ent.exec_start = rq.clock;
        if let Some(pk) = ent.pushable_key.take() {
            rq.dl.dequeue_pushable(&pk);
        }
    }

    /// Wake-time CPU selection. Only the wakeup path gets a say; everything
    /// else stays where it is.
    pub fn select_task_rq(&self, id: TaskId, wake: bool) -> CpuId {
        let Some(task) = self.task(id) else { return 0 };
        let cpu = task.cpu();
        if !wake {
            return cpu;
        }

        let p = match balance::snapshot(self, &task) {
            Some(p) => p,
            None => return cpu,
        };
        if p.nr_cpus_allowed <= 1 {
            return cpu;
        }

        // If the task running here is a deadline task that either cannot
        // move or would not be preempted by us, look for a CPU whose
        // earliest deadline is later than ours.
        let curr_id = {
            let rq = self.lock_rq(cpu);
            rq.curr
        };
        let Some(curr_id) = curr_id else { return cpu };
        let Some(curr) = self.task(curr_id) else { return cpu };
        let Some(c) = balance::snapshot(self, &curr) else { return cpu };

        if c.nr_cpus_allowed < 2 || c.key().preempts(&p.key()) {
            if let Some(target) = balance::find_later_rq(self, &p, cpu) {
                trace!(task = %id, from = cpu, to = target, "wake placement moved");
                return target;
            }
        }
        cpu
    }

    /// Affinity update: adjusts migratory accounting, pushable membership
    /// and overload state of the runqueue the task is queued on.
    pub fn set_cpus_allowed(&self, id: TaskId, mask: CpuMask) {
        let Some(task) = self.task(id) else { return };
        let mut rq = self.lock_rq(task.cpu());
        let mut ent = task.entity();

        let was_migratable = ent.is_migratable();
        ent.set_affinity(mask);
        let now_migratable = ent.is_migratable();

        if ent.queued_key.is_none() || was_migratable == now_migratable {
            return;
        }

        let (cpu, online) = (rq.cpu, rq.online);
        rq.dl.migratory_changed(now_migratable, &self.rd, cpu, online);
        if !now_migratable {
            if let Some(pk) = ent.pushable_key.take() {
                rq.dl.dequeue_pushable(&pk);
            }
        } else if rq.curr != Some(id) && ent.pushable_key.is_none() {
            let key = ent.queued_key.expect("checked queued above");
            rq.dl.enqueue_pushable(key);
            ent.pushable_key = Some(key);
        }
    }

    /// Runqueue joins the domain: replay its overload bit and earliest
    /// snapshot.
    pub fn rq_online(&self, cpu: CpuId) {
        let mut rq = self.lock_rq(cpu);
        rq.online = true;
        self.rd.set_online(cpu, true);
        if rq.dl.overloaded {
            self.rd.set_overload(cpu);
        }
        self.rd
            .cpudl_set(cpu, rq.dl.earliest.curr, rq.dl.earliest.next);
    }

    /// Runqueue leaves the domain: withdraw its overload bit and hide it
    /// from placement scans.
    pub fn rq_offline(&self, cpu: CpuId) {
        let mut rq = self.lock_rq(cpu);
        if rq.dl.overloaded {
            self.rd.clear_overload(cpu);
        }
        rq.online = false;
        self.rd.set_online(cpu, false);
        self.rd.cpudl_set(cpu, 0, 0);
    }

    /// Before picking a new task: if the previous one was deadline-class we
    /// may have lost our earliest, try to pull a better one.
    pub fn pre_schedule<'a>(
        &'a self,
        rq: MutexGuard<'a, Rq>,
        prev: Option<TaskId>,
    ) -> MutexGuard<'a, Rq> {
        let prev_was_dl = prev
            .and_then(|id| self.task(id))
            .map(|t| t.entity().class.is_deadline())
            .unwrap_or(false);
        if !prev_was_dl {
            return rq;
        }
        let (rq, _) = balance::pull_dl_task(self, rq);
        rq
    }

    /// After a context switch: push surplus tasks somewhere better.
    pub fn post_schedule<'a>(&'a self, rq: MutexGuard<'a, Rq>) -> MutexGuard<'a, Rq> {
        if !rq.dl.has_pushable() {
            return rq;
        }
        balance::push_dl_tasks(self, rq)
    }

    /// A task was woken onto this runqueue but is not running: if pushing
    /// helps (we will not reschedule for it and the current task is an
    /// immovable-or-earlier deadline task), run the push loop.
    pub fn task_woken(&self, cpu: CpuId, id: TaskId) {
        let Some(task) = self.task(id) else { return };
        let Some(p) = balance::snapshot(self, &task) else { return };

        let rq = self.lock_rq(cpu);
        if rq.curr == Some(id) || rq.need_resched || !rq.dl.has_pushable() {
            return;
        }
        if p.nr_cpus_allowed <= 1 {
            return;
        }
        let Some(curr_id) = rq.curr else { return };
        let Some(curr) = self.task(curr_id) else { return };
        let Some(c) = balance::snapshot(self, &curr) else { return };
        if c.nr_cpus_allowed < 2 || c.key().preempts(&p.key()) {
            let _rq = balance::push_dl_tasks(self, rq);
        }
    }

    /// The task left the deadline class. Cancel its timer; if it was our
    /// last deadline task, this is the right moment to pull.
    pub fn switched_from(&self, id: TaskId) {
        let Some(task) = self.task(id) else { return };
        let rq = self.lock_rq(task.cpu());
        let rq = self.switched_from_rq(rq, &task);
        drop(rq);
    }

    /// The task joined the deadline class.
    pub fn switched_to(&self, id: TaskId) {
        let Some(task) = self.task(id) else { return };
        let mut rq = self.lock_rq(task.cpu());
        self.switched_to_rq(&mut rq, &task);
    }

    /// Deadline parameters of a queued task changed in place.
    pub fn prio_changed(&self, id: TaskId) {
        let Some(task) = self.task(id) else { return };
        let rq = self.lock_rq(task.cpu());
        let running = rq.curr == Some(id);
        let rq = self.prio_changed_rq(rq, &task, running);
        drop(rq);
    }

    /// Deepest sleep instant for a periodic task that wants to wake into a
    /// fresh instance (optionally no earlier than `t`). Marks the next
    /// activation as a new instance.
    pub fn wait_interval(&self, id: TaskId, t: Option<Ns>) -> Ns {
        let Some(task) = self.task(id) else { return t.unwrap_or(0) };
        let _rq = self.lock_rq(task.cpu());
        let wake = task.entity().next_instance_wake(t);
        wake
    }

    // ── Priority inheritance interface ────────────────────────────────────────

    /// Boost: CBS decisions for this task now use the donor's parameters
    /// and exhaustion no longer throttles. The ready-tree key keeps the
    /// task's own deadline.
    pub fn pi_boost(&self, id: TaskId, donor: DlParams) {
        let Some(task) = self.task(id) else { return };
        let _rq = self.lock_rq(task.cpu());
        task.entity().boosted = Some(donor);
    }

    /// Drop a boost.
    pub fn pi_unboost(&self, id: TaskId) {
        let Some(task) = self.task(id) else { return };
        let _rq = self.lock_rq(task.cpu());
        task.entity().boosted = None;
    }

    // ── Timer dispatch ────────────────────────────────────────────────────────

    /// Advance the timer clock, firing replenishment callbacks. Returns the
    /// CPUs whose high-resolution tick expired; the driver runs their tick
    /// hook.
    pub fn advance_timers(&self, now: Ns) -> Vec<CpuId> {
        let mut hrtick = Vec::new();
        for kind in self.timers.take_due(now) {
            match kind {
                TimerKind::Replenish { task, gen } => self.dl_task_timer(task, gen),
                TimerKind::HrTick { cpu } => hrtick.push(cpu),
            }
        }
        hrtick
    }

    /// Arm a high-resolution tick for `cpu` at absolute instant `at`.
    pub fn arm_hrtick(&self, cpu: CpuId, at: Ns) {
        self.timers.arm(at, TimerKind::HrTick { cpu });
    }

    /// Replenishment timer callback. Runs with no locks held and acquires
    /// the task's runqueue lock itself; a stale generation means the timer
    /// was cancelled. Never re-arms itself.
    fn dl_task_timer(&self, id: TaskId, gen: u64) {
        let Some(task) = self.task(id) else { return };
        loop {
            let cpu = task.cpu();
            let mut rq = self.lock_rq(cpu);
            if task.cpu() != cpu {
                // Migrated between the load and the lock; retry on the
                // new runqueue.
                drop(rq);
                continue;
            }

            let runnable = {
                let mut ent = task.entity();
                if !ent.timer_armed || ent.timer_gen != gen {
                    return;
                }
                ent.timer_armed = false;
                if !ent.dl_throttled {
                    return;
                }
                // Undo a BWRECL_* downgrade; a genuine class departure
                // cancels the timer, so reaching here means the task is
                // still ours.
                if ent.flags.reclaims_outside_class() {
                    ent.class = SchedClass::Deadline;
                }
                if !ent.class.is_deadline() {
                    ent.dl_throttled = false;
                    return;
                }
                ent.dl_throttled = false;
                ent.runnable
            };

            if runnable {
                self.enqueue_task_rq(&mut rq, &task, EnqueueFlags::REPLENISH);
                self.check_preempt_curr_rq(&mut rq, &task);
            }
            trace!(task = %id, cpu, runnable, "replenishment timer fired");
            return;
        }
    }

    // ── Locked internals ──────────────────────────────────────────────────────

    pub(crate) fn enqueue_task_rq(&self, rq: &mut Rq, task: &Arc<DlTask>, flags: EnqueueFlags) {
        let t0 = Instant::now();
        let mut ent = task.entity();

        // A throttled task waits for its timer; admission is a no-op. (It
        // may even carry a BWRECL_* downgraded class right now.)
        if ent.dl_throttled && !flags.contains(EnqueueFlags::REPLENISH) {
            return;
        }
        debug_assert!(ent.class.is_deadline());

        if !ent.dl_new && flags.contains(EnqueueFlags::REPLENISH) {
            ent.replenish(rq.clock, &task.name);
        } else {
            ent.update_on_enqueue(rq.clock);
        }

        let key = ent.key(task.id);
        let migratable = ent.is_migratable();
        debug_assert!(ent.queued_key.is_none(), "double enqueue of {}", task.id);
        let (cpu, online) = (rq.cpu, rq.online);
        rq.dl.enqueue(key, migratable, &self.rd, cpu, online);
        ent.queued_key = Some(key);

        if rq.curr != Some(task.id) && migratable {
            rq.dl.enqueue_pushable(key);
            ent.pushable_key = Some(key);
        }
        rq.dl.stats.enqueue_cycles += t0.elapsed().as_nanos() as u64;
    }

    pub(crate) fn dequeue_task_rq(&self, rq: &mut Rq, task: &Arc<DlTask>, flags: DequeueFlags) {
        let t0 = Instant::now();
        // Charge whatever the running task consumed up to now. This may
        // throttle it, in which case it is already off the tree below.
        self.update_curr(rq);

        let mut ent = task.entity();
        if let Some(key) = ent.queued_key.take() {
            let migratable = ent.is_migratable();
            let (cpu, online) = (rq.cpu, rq.online);
            rq.dl.dequeue(&key, migratable, &self.rd, cpu, online);
        }
        if let Some(pk) = ent.pushable_key.take() {
            rq.dl.dequeue_pushable(&pk);
        }
        if flags.contains(DequeueFlags::SLEEP) {
            ent.runnable = false;
        }
        rq.dl.stats.dequeue_cycles += t0.elapsed().as_nanos() as u64;
    }

    pub(crate) fn pick_next_task_rq(&self, rq: &mut Rq) -> Option<TaskId> {
        let key = rq.dl.tree.leftmost()?;
        let task = self.task(key.task)?;
        let mut ent = task.entity();
        ent.exec_start = rq.clock;
        if let Some(pk) = ent.pushable_key.take() {
            rq.dl.dequeue_pushable(&pk);
        }
        Some(key.task)
    }

    pub(crate) fn put_prev_task_rq(&self, rq: &mut Rq, task: &Arc<DlTask>) {
        self.update_curr(rq);

        let mut ent = task.entity();
        if let (Some(key), true, None) = (ent.queued_key, ent.is_migratable(), ent.pushable_key) {
            rq.dl.enqueue_pushable(key);
            ent.pushable_key = Some(key);
        }
    }

    /// Preemption decision for a task that just became runnable on this
    /// runqueue.
    pub(crate) fn check_preempt_curr_rq(&self, rq: &mut Rq, task: &Arc<DlTask>) {
        let Some(p) = balance::snapshot(self, task) else { return };

        let Some(curr_id) = rq.curr else {
            rq.resched();
            return;
        };
        if curr_id == task.id {
            return;
        }
        let Some(curr) = self.task(curr_id) else {
            rq.resched();
            return;
        };
        let c = match balance::snapshot(self, &curr) {
            // The running task is not deadline-class: we always win.
            None => {
                rq.resched();
                return;
            }
            Some(c) => c,
        };

        if p.key().preempts(&c.key()) {
            rq.resched();
        } else if p.head == c.head && p.deadline == c.deadline {
            self.check_preempt_equal(rq, &p, &c);
        }
    }

    /// Tie on the comparator: decide between rescheduling and trusting
    /// push/pull, based on who can migrate.
    fn check_preempt_equal(
        &self,
        rq: &mut Rq,
        p: &balance::TaskSnapshot,
        c: &balance::TaskSnapshot,
    ) {
        // The current task cannot go anywhere: rescheduling is useless,
        // hope the waker moves out instead.
        if c.nr_cpus_allowed == 1 || balance::find_later_rq(self, c, rq.cpu).is_none() {
            return;
        }
        // The wakee can move: let push/pull place it.
        if p.nr_cpus_allowed != 1 && balance::find_later_rq(self, p, rq.cpu).is_some() {
            return;
        }
        rq.resched();
    }

    /// Bandwidth accounting for the running task. Runs on every tick, on
    /// yield, on dequeue and on put-prev; throttles on exhaustion.
    pub(crate) fn update_curr(&self, rq: &mut Rq) {
        let Some(id) = rq.curr else { return };
        let Some(task) = self.task(id) else { return };
        let mut ent = task.entity();
        if !ent.class.is_deadline() || ent.dl_throttled {
            return;
        }

        let now = rq.clock;
        let delta = (now.wrapping_sub(ent.exec_start) as i64).max(0);
        ent.exec_start = now;
        ent.stats.tot_rtime += delta as u64;
        rq.dl.stats.exec_clock += delta as u64;
        ent.runtime -= delta;

        // HEAD entities are never throttled by the scheduler.
        if ent.flags.contains(DlFlags::HEAD) {
            return;
        }

        let dmiss = dl_time_before(ent.deadline, now);
        if ent.runtime > 0 && !dmiss {
            return;
        }

        if ent.runtime < 0 {
            let rorun = (-ent.runtime) as u64;
            ent.stats.record_rorun(rorun);
        }
        if dmiss {
            // Past the deadline: the overrun is charged to the next
            // instance.
            let lateness = now.wrapping_sub(ent.deadline);
            ent.stats.record_dmiss(lateness);
            ent.runtime = ent.runtime.min(0) - lateness as i64;
        }

        // A boosted task holds a lock somebody with an earlier deadline
        // wants; letting it run is the lesser evil.
        if ent.boosted.is_some() {
            return;
        }

        if ent.flags.contains(DlFlags::BWRECL_DL) {
            // Reclaim inside the class: replenish in place and re-key the
            // ready tree with the postponed deadline.
            if let Some(key) = ent.queued_key.take() {
                let migratable = ent.is_migratable();
                let (cpu, online) = (rq.cpu, rq.online);
                rq.dl.dequeue(&key, migratable, &self.rd, cpu, online);
                ent.replenish(now, &task.name);
                let key = ent.key(task.id);
                rq.dl.enqueue(key, migratable, &self.rd, cpu, online);
                ent.queued_key = Some(key);
            }
            rq.resched();
            return;
        }

        // Throttle: off the tree until the replenishment instant.
        if let Some(key) = ent.queued_key.take() {
            let migratable = ent.is_migratable();
            let (cpu, online) = (rq.cpu, rq.online);
            rq.dl.dequeue(&key, migratable, &self.rd, cpu, online);
        }
        if let Some(pk) = ent.pushable_key.take() {
            rq.dl.dequeue_pushable(&pk);
        }

        if self.start_dl_timer(&mut ent, task.id, rq.clock) {
            ent.dl_throttled = true;
            if ent.flags.contains(DlFlags::BWRECL_RT) {
                ent.class = SchedClass::RealTime(MAX_RT_PRIO - 1 - ent.rt_priority);
            } else if ent.flags.contains(DlFlags::BWRECL_NR) {
                ent.class = SchedClass::Fair;
            }
            trace!(task = %id, deadline = ent.deadline, "throttled");
        } else {
            // The replenishment instant is already behind us: refill and
            // requeue immediately.
            ent.replenish(now, &task.name);
            let key = ent.key(task.id);
            let migratable = ent.is_migratable();
            let (cpu, online) = (rq.cpu, rq.online);
            rq.dl.enqueue(key, migratable, &self.rd, cpu, online);
            ent.queued_key = Some(key);
        }
        rq.resched();
    }

    /// Arm the replenishment timer at the entity's deadline, compensated
    /// for the skew between the timer clock and this runqueue's clock.
    /// Returns `false` (not armed) when the instant has already passed.
    fn start_dl_timer(&self, ent: &mut DlEntity, id: TaskId, rq_clock: Ns) -> bool {
        let timer_now = self.timers.now();
        let skew = timer_now.wrapping_sub(rq_clock);
        let act = ent.deadline.wrapping_add(skew);

        if !dl_time_before(timer_now, act) {
            return false;
        }
        ent.timer_gen += 1;
        ent.timer_armed = true;
        self.timers.arm(
            act,
            TimerKind::Replenish {
                task: id,
                gen: ent.timer_gen,
            },
        );
        true
    }

    fn switched_from_rq<'a>(
        &'a self,
        rq: MutexGuard<'a, Rq>,
        task: &Arc<DlTask>,
    ) -> MutexGuard<'a, Rq> {
        {
            let mut ent = task.entity();
            ent.timer_gen += 1;
            ent.timer_armed = false;
            ent.dl_throttled = false;
            ent.boosted = None;
        }
        // This may have been the last deadline task here; a pull is the
        // cheapest way to refill.
        if rq.dl.nr_running == 0 {
            let (rq, _) = balance::pull_dl_task(self, rq);
            return rq;
        }
        rq
    }

    fn switched_to_rq(&self, rq: &mut Rq, task: &Arc<DlTask>) {
        let (queued, running) = {
            let ent = task.entity();
            (ent.queued_key.is_some(), rq.curr == Some(task.id))
        };
        if queued && !running {
            self.check_preempt_curr_rq(rq, task);
        }
    }

    fn prio_changed_rq<'a>(
        &'a self,
        mut rq: MutexGuard<'a, Rq>,
        task: &Arc<DlTask>,
        running: bool,
    ) -> MutexGuard<'a, Rq> {
        if running {
            // We cannot tell whether the deadline moved earlier or later;
            // pulling is the conservative answer, then reschedule if the
            // queue now holds something earlier than us.
            if !rq.dl.overloaded {
                let (r, _) = balance::pull_dl_task(self, rq);
                rq = r;
            }
            let deadline = task.entity().deadline;
            if rq.dl.earliest.curr != 0 && dl_time_before(rq.dl.earliest.curr, deadline) {
                rq.resched();
            }
            rq
        } else {
            self.switched_to_rq(&mut rq, task);
            rq
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    /// One-CPU system with a single installed task.
    fn system_with_task(runtime_ms: u64, deadline_ms: u64, period_ms: u64) -> (DlSystem, TaskId) {
        let sys = DlSystem::new(1);
        let id = sys.task_fork("t0", 0);
        sys.set_dl_params(
            id,
            runtime_ms * MS,
            deadline_ms * MS,
            period_ms * MS,
            DlFlags::empty(),
            0,
        )
        .unwrap();
        (sys, id)
    }

    fn wake(sys: &DlSystem, id: TaskId, cpu: CpuId) {
        sys.task(id).unwrap().entity().runnable = true;
        sys.enqueue_task(cpu, id, EnqueueFlags::WAKEUP);
    }

    // ── lifecycle ─────────────────────────────────────────────────────────────

    #[test]
    fn forked_task_is_throttled_and_unqueued() {
        let sys = DlSystem::new(1);
        let id = sys.task_fork("child", 0);
        let task = sys.task(id).unwrap();
        let ent = task.entity();
        assert!(ent.dl_throttled);
        assert!(!ent.dl_new);
        assert!(ent.queued_key.is_none());
    }

    #[test]
    fn installer_contributes_bandwidth() {
        let (sys, _) = system_with_task(4, 10, 10);
        assert_eq!(
            sys.domain().total_bw(),
            (4 * MS << crate::params::BW_SHIFT) / (10 * MS)
        );
    }

    #[test]
    fn installer_rejects_bad_triple() {
        let sys = DlSystem::new(1);
        let id = sys.task_fork("t", 0);
        let err = sys
            .set_dl_params(id, 20 * MS, 10 * MS, 10 * MS, DlFlags::empty(), 0)
            .unwrap_err();
        assert!(matches!(err, DlInstallError::Params(_)));
        assert_eq!(sys.domain().total_bw(), 0);
    }

    #[test]
    fn reinstall_swaps_bandwidth_contribution() {
        let (sys, id) = system_with_task(4, 10, 10);
        sys.set_dl_params(id, 2 * MS, 10 * MS, 10 * MS, DlFlags::empty(), 0)
            .unwrap();
        assert_eq!(
            sys.domain().total_bw(),
            (2 * MS << crate::params::BW_SHIFT) / (10 * MS)
        );
    }

    #[test]
    fn task_dead_withdraws_bandwidth() {
        let (sys, id) = system_with_task(4, 10, 10);
        sys.task_dead(id);
        assert_eq!(sys.domain().total_bw(), 0);
        assert!(sys.task(id).is_none());
    }

    // ── enqueue / pick / preempt ──────────────────────────────────────────────

    #[test]
    fn first_enqueue_starts_a_fresh_instance() {
        let (sys, id) = system_with_task(4, 10, 10);
        sys.update_rq_clock(0, 100 * MS);
        wake(&sys, id, 0);

        let task = sys.task(id).unwrap();
        let ent = task.entity();
        assert_eq!(ent.deadline, 110 * MS);
        assert_eq!(ent.runtime, (4 * MS) as i64);
        assert!(ent.queued_key.is_some());
    }

    #[test]
    fn pick_returns_earliest_deadline() {
        let sys = DlSystem::new(1);
        let a = sys.task_fork("a", 0);
        let b = sys.task_fork("b", 0);
        sys.set_dl_params(a, 2 * MS, 50 * MS, 50 * MS, DlFlags::empty(), 0)
            .unwrap();
        sys.set_dl_params(b, 2 * MS, 5 * MS, 5 * MS, DlFlags::empty(), 0)
            .unwrap();
        wake(&sys, a, 0);
        wake(&sys, b, 0);

        assert_eq!(sys.pick_next_task(0), Some(b));
    }

    #[test]
    fn empty_rq_picks_nothing() {
        let sys = DlSystem::new(1);
        assert_eq!(sys.pick_next_task(0), None);
    }

    #[test]
    fn earlier_wakeup_preempts_running_task() {
        let sys = DlSystem::new(1);
        let a = sys.task_fork("a", 0);
        let b = sys.task_fork("b", 0);
        sys.set_dl_params(a, 5 * MS, 50 * MS, 50 * MS, DlFlags::empty(), 0)
            .unwrap();
        sys.set_dl_params(b, 2 * MS, 5 * MS, 5 * MS, DlFlags::empty(), 0)
            .unwrap();

        wake(&sys, a, 0);
        let picked = sys.pick_next_task(0).unwrap();
        {
            let mut rq = sys.lock_rq(0);
            rq.curr = Some(picked);
            rq.need_resched = false;
        }

        wake(&sys, b, 0);
        sys.check_preempt_curr(0, b);
        assert!(sys.lock_rq(0).need_resched);
    }

    #[test]
    fn later_wakeup_does_not_preempt() {
        let sys = DlSystem::new(1);
        let a = sys.task_fork("a", 0);
        let b = sys.task_fork("b", 0);
        sys.set_dl_params(a, 2 * MS, 5 * MS, 5 * MS, DlFlags::empty(), 0)
            .unwrap();
        sys.set_dl_params(b, 5 * MS, 50 * MS, 50 * MS, DlFlags::empty(), 0)
            .unwrap();

        wake(&sys, a, 0);
        let picked = sys.pick_next_task(0).unwrap();
        {
            let mut rq = sys.lock_rq(0);
            rq.curr = Some(picked);
            rq.need_resched = false;
        }

        wake(&sys, b, 0);
        sys.check_preempt_curr(0, b);
        assert!(!sys.lock_rq(0).need_resched);
    }

    // ── CBS enforcement ───────────────────────────────────────────────────────

    #[test]
    fn exhausted_budget_throttles_and_arms_timer() {
        let (sys, id) = system_with_task(4, 10, 10);
        wake(&sys, id, 0);
        let picked = sys.pick_next_task(0).unwrap();
        sys.lock_rq(0).curr = Some(picked);

        // Run 5ms: one ms past the 4ms budget. (The timer clock is kept in
        // step with the rq clock, as the driver does.)
        sys.update_rq_clock(0, 5 * MS);
        sys.advance_timers(5 * MS);
        sys.task_tick(0, true);

        let task = sys.task(id).unwrap();
        let ent = task.entity();
        assert!(ent.dl_throttled);
        assert!(ent.timer_armed);
        assert!(ent.queued_key.is_none());
        assert_eq!(ent.stats.last_rorun, 1 * MS);
        assert_eq!(sys.timers().next_expiry(), Some(10 * MS));
        drop(ent);
        assert!(sys.lock_rq(0).need_resched);
    }

    #[test]
    fn replenishment_timer_requeues_runnable_task() {
        let (sys, id) = system_with_task(4, 10, 10);
        wake(&sys, id, 0);
        let picked = sys.pick_next_task(0).unwrap();
        sys.lock_rq(0).curr = Some(picked);

        sys.update_rq_clock(0, 5 * MS);
        sys.advance_timers(5 * MS);
        sys.task_tick(0, true);
        // Simulate the context switch away.
        sys.lock_rq(0).curr = None;

        sys.update_rq_clock(0, 10 * MS);
        sys.advance_timers(10 * MS);

        let task = sys.task(id).unwrap();
        let ent = task.entity();
        assert!(!ent.dl_throttled);
        assert!(ent.queued_key.is_some());
        // One period forward, budget refilled minus the 1ms overrun charge.
        assert_eq!(ent.deadline, 20 * MS);
        assert_eq!(ent.runtime, (3 * MS) as i64);
    }

    #[test]
    fn head_task_is_never_throttled() {
        let sys = DlSystem::new(1);
        let id = sys.task_fork("head", 0);
        sys.set_dl_params(id, 4 * MS, 10 * MS, 10 * MS, DlFlags::HEAD, 0)
            .unwrap();
        wake(&sys, id, 0);
        let picked = sys.pick_next_task(0).unwrap();
        sys.lock_rq(0).curr = Some(picked);

        sys.update_rq_clock(0, 50 * MS);
        sys.task_tick(0, true);

        let task = sys.task(id).unwrap();
        let ent = task.entity();
        assert!(!ent.dl_throttled);
        assert!(ent.queued_key.is_some());
    }

    #[test]
    fn boosted_task_is_not_throttled_on_exhaustion() {
        let (sys, id) = system_with_task(4, 10, 10);
        sys.pi_boost(id, DlParams::new(1 * MS, 2 * MS, 2 * MS).unwrap());
        wake(&sys, id, 0);
        let picked = sys.pick_next_task(0).unwrap();
        sys.lock_rq(0).curr = Some(picked);

        sys.update_rq_clock(0, 5 * MS);
        sys.task_tick(0, true);

        let task = sys.task(id).unwrap();
        let ent = task.entity();
        assert!(!ent.dl_throttled);
        assert!(ent.queued_key.is_some());
    }

    #[test]
    fn bwrecl_dl_replenishes_in_place() {
        let sys = DlSystem::new(1);
        let id = sys.task_fork("greedy", 0);
        sys.set_dl_params(id, 4 * MS, 10 * MS, 10 * MS, DlFlags::BWRECL_DL, 0)
            .unwrap();
        wake(&sys, id, 0);
        let picked = sys.pick_next_task(0).unwrap();
        sys.lock_rq(0).curr = Some(picked);

        sys.update_rq_clock(0, 4 * MS);
        sys.task_tick(0, true);

        let task = sys.task(id).unwrap();
        let ent = task.entity();
        assert!(!ent.dl_throttled);
        assert!(ent.queued_key.is_some());
        assert_eq!(ent.deadline, 20 * MS);
        assert_eq!(ent.runtime, (4 * MS) as i64);
    }

    #[test]
    fn bwrecl_rt_downgrades_class_until_replenishment() {
        let sys = DlSystem::new(1);
        let id = sys.task_fork("recl", 0);
        sys.set_dl_params(id, 4 * MS, 10 * MS, 10 * MS, DlFlags::BWRECL_RT, 7)
            .unwrap();
        wake(&sys, id, 0);
        let picked = sys.pick_next_task(0).unwrap();
        sys.lock_rq(0).curr = Some(picked);

        sys.update_rq_clock(0, 5 * MS);
        sys.task_tick(0, true);

        {
            let task = sys.task(id).unwrap();
            let ent = task.entity();
            assert!(ent.dl_throttled);
            assert_eq!(ent.class, SchedClass::RealTime(MAX_RT_PRIO - 1 - 7));
        }

        sys.lock_rq(0).curr = None;
        sys.update_rq_clock(0, 10 * MS);
        sys.advance_timers(10 * MS);

        let task = sys.task(id).unwrap();
        let ent = task.entity();
        assert_eq!(ent.class, SchedClass::Deadline);
        assert!(!ent.dl_throttled);
        assert!(ent.queued_key.is_some());
    }

    // ── yield ─────────────────────────────────────────────────────────────────

    #[test]
    fn yield_sleeps_until_next_instance_with_fresh_budget() {
        let (sys, id) = system_with_task(3, 10, 10);
        wake(&sys, id, 0);
        let picked = sys.pick_next_task(0).unwrap();
        sys.lock_rq(0).curr = Some(picked);

        // Run 1ms, then give up the instance.
        sys.update_rq_clock(0, 1 * MS);
        sys.advance_timers(1 * MS);
        sys.yield_task(0);

        {
            let task = sys.task(id).unwrap();
            let ent = task.entity();
            assert!(ent.dl_throttled);
            assert!(ent.dl_new);
            assert!(ent.timer_armed);
        }
        assert_eq!(sys.timers().next_expiry(), Some(10 * MS));

        sys.lock_rq(0).curr = None;
        sys.update_rq_clock(0, 10 * MS);
        sys.advance_timers(10 * MS);

        let task = sys.task(id).unwrap();
        let ent = task.entity();
        assert_eq!(ent.runtime, (3 * MS) as i64);
        assert_eq!(ent.deadline, 20 * MS);
    }

    // ── class changes ─────────────────────────────────────────────────────────

    #[test]
    fn leaving_the_class_cancels_timer_and_bandwidth() {
        let (sys, id) = system_with_task(4, 10, 10);
        wake(&sys, id, 0);
        let picked = sys.pick_next_task(0).unwrap();
        sys.lock_rq(0).curr = Some(picked);

        sys.update_rq_clock(0, 5 * MS);
        sys.task_tick(0, true);
        assert!(sys.task(id).unwrap().entity().timer_armed);
        sys.lock_rq(0).curr = None;

        sys.set_sched_class(id, SchedClass::Fair);
        assert_eq!(sys.domain().total_bw(), 0);

        // The armed event still fires, but the stale generation makes it a
        // no-op: the task never re-enters the ready tree.
        sys.advance_timers(10 * MS);
        let task = sys.task(id).unwrap();
        let ent = task.entity();
        assert!(ent.queued_key.is_none());
        assert_eq!(ent.class, SchedClass::Fair);
    }

    // ── wait-until-next-instance ──────────────────────────────────────────────

    #[test]
    fn wait_interval_returns_next_period_start() {
        let (sys, id) = system_with_task(3, 10, 10);
        wake(&sys, id, 0);
        let wake_at = sys.wait_interval(id, None);
        // deadline 10ms + period - relative deadline
        assert_eq!(wake_at, 10 * MS);
        assert!(sys.task(id).unwrap().entity().dl_new);
    }
}
