/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Deterministic multi-CPU driver: the stand-in for the generic scheduler
//! core.
//!
//! The simulator owns a [`DlSystem`] and advances a virtual clock from
//! event to event: millisecond ticks, timer expiries, task wakeups and
//! instance completions. At each event it runs the same choreography the
//! kernel core would — charge the running task, fire replenishments, wake
//! sleepers through `select_task_rq`, and reschedule every CPU whose
//! `need_resched` is set with the `put_prev` → `pre_schedule` (pull) →
//! `pick_next` → `post_schedule` (push) sequence.
//!
//! Everything is single-threaded and ordered, so identical workloads
//! produce identical schedules; the tests rely on that.

pub mod config;

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use tracing::{debug, info, trace};

use crate::class::{DequeueFlags, DlSystem, EnqueueFlags};
use crate::params::CpuId;
use crate::task::TaskId;
use crate::time::{dl_time_before, Ns};
use config::{Behavior, SimConfig};

/// Driver tick period: 1ms, i.e. HZ = 1000.
pub const TICK_NS: Ns = 1_000_000;

const MS: Ns = 1_000_000;

// ── Observability ─────────────────────────────────────────────────────────────

/// One completed task instance, for post-run analysis. Never consulted by
/// scheduling.
#[derive(Debug, Clone, Copy)]
pub struct InstanceRecord {
    pub task: TaskId,
    pub completed_at: Ns,
    /// Absolute deadline the instance was running against.
    pub deadline: Ns,
    pub cpu: CpuId,
}

impl InstanceRecord {
    pub fn met_deadline(&self) -> bool {
        !dl_time_before(self.deadline, self.completed_at)
    }
}

// ── Per-task driver state ─────────────────────────────────────────────────────

#[derive(Debug)]
struct SimTask {
    name: String,
    behavior: Behavior,
    exec_ns: Ns,
    /// Remaining CPU demand of the current instance. `u64::MAX` for busy
    /// tasks.
    work_left: Ns,
}

impl SimTask {
    fn fresh_work(&self) -> Ns {
        match self.behavior {
            Behavior::Busy => u64::MAX,
            _ => self.exec_ns,
        }
    }
}

// ── Simulator ─────────────────────────────────────────────────────────────────

pub struct Simulator {
    sys: DlSystem,
    now: Ns,
    end: Ns,
    hrtick: bool,
    tasks: BTreeMap<TaskId, SimTask>,
    by_name: BTreeMap<String, TaskId>,
    /// Pending sleep wakeups and initial releases: (instant, task).
    wakes: BinaryHeap<Reverse<(Ns, TaskId)>>,
    records: Vec<InstanceRecord>,
    wake_log: BTreeMap<TaskId, Vec<Ns>>,
}

impl Simulator {
    pub fn new(cfg: &SimConfig) -> Self {
        let sys = DlSystem::new(cfg.cpus);
        let mut tasks = BTreeMap::new();
        let mut by_name = BTreeMap::new();
        let mut wakes = BinaryHeap::new();

        for spec in &cfg.tasks {
            let id = sys.task_fork(spec.name.clone(), 0);
            sys.set_dl_params(
                id,
                spec.runtime_ms * MS,
                spec.deadline_ms * MS,
                spec.period_ms * MS,
                spec.flags,
                spec.rt_priority,
            )
            .expect("workload configuration was validated");
            sys.set_cpus_allowed(id, spec.affinity);

            wakes.push(Reverse((spec.start_ms * MS, id)));
            by_name.insert(spec.name.clone(), id);
            tasks.insert(
                id,
                SimTask {
                    name: spec.name.clone(),
                    behavior: spec.behavior,
                    exec_ns: spec.exec_ms * MS,
                    work_left: 0,
                },
            );
        }

        Self {
            sys,
            now: 0,
            end: cfg.duration_ms * MS,
            hrtick: cfg.hrtick,
            tasks,
            by_name,
            wakes,
            records: Vec::new(),
            wake_log: BTreeMap::new(),
        }
    }

    // ── Read-side API ─────────────────────────────────────────────────────────

    pub fn sys(&self) -> &DlSystem {
        &self.sys
    }

    pub fn now(&self) -> Ns {
        self.now
    }

    pub fn task_id(&self, name: &str) -> Option<TaskId> {
        self.by_name.get(name).copied()
    }

    pub fn records(&self) -> &[InstanceRecord] {
        &self.records
    }

    pub fn completions(&self, id: TaskId) -> usize {
        self.records.iter().filter(|r| r.task == id).count()
    }

    pub fn missed_deadlines(&self, id: TaskId) -> usize {
        self.records
            .iter()
            .filter(|r| r.task == id && !r.met_deadline())
            .count()
    }

    /// Instants at which the task's wakeups were delivered.
    pub fn wake_times(&self, id: TaskId) -> &[Ns] {
        self.wake_log.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    // ── Main loop ─────────────────────────────────────────────────────────────

    /// Run the workload to the configured horizon.
    pub fn run(&mut self) {
        info!(
            cpus = self.sys.nr_cpus(),
            duration_ms = self.end / MS,
            tasks = self.tasks.len(),
            "simulation start"
        );
        loop {
            self.process_events();
            self.settle();

            let next = self.next_event_time();
            if next > self.end {
                break;
            }
            self.consume_cpu(next);
            self.now = next;
        }
        self.report();
    }

    /// Everything that happens at the current instant, in kernel order:
    /// expired timers (replenishments and hr-ticks), due wakeups, then the
    /// periodic tick.
    fn process_events(&mut self) {
        let hrticks = self.sys.advance_timers(self.now);
        for cpu in hrticks {
            self.tick(cpu);
        }

        while let Some(&Reverse((at, id))) = self.wakes.peek() {
            if at > self.now {
                break;
            }
            self.wakes.pop();
            self.wake_task(id);
        }

        // Retire finished instances before the tick can charge them: a task
        // whose demand equals its budget blocks at the boundary, it does
        // not overrun.
        for cpu in 0..self.sys.nr_cpus() {
            self.check_completion(cpu);
        }

        if self.now != 0 && self.now % TICK_NS == 0 {
            for cpu in 0..self.sys.nr_cpus() {
                self.tick(cpu);
            }
        }
    }

    /// Alternate context switches and instance retirements until every CPU
    /// is quiescent: a completion vacates a CPU, the switch may expose
    /// another finished instance, and so on.
    fn settle(&mut self) {
        loop {
            self.run_schedulers();
            let mut any = false;
            for cpu in 0..self.sys.nr_cpus() {
                any |= self.check_completion(cpu);
            }
            if !any {
                break;
            }
        }
    }

    fn tick(&mut self, cpu: CpuId) {
        if let Some(delay) = self.sys.task_tick(cpu, true) {
            if self.hrtick {
                self.sys.arm_hrtick(cpu, self.now + delay);
            }
        }
    }

    /// Deliver a wakeup: fresh instance work, CPU selection, enqueue,
    /// preemption check, and the woken-push hook.
    fn wake_task(&mut self, id: TaskId) {
        let Some(st) = self.tasks.get_mut(&id) else { return };
        st.work_left = st.fresh_work();
        self.wake_log.entry(id).or_default().push(self.now);

        let target = self.sys.select_task_rq(id, true);
        if let Some(task) = self.sys.task(id) {
            task.set_cpu(target);
            task.entity().runnable = true;
        }
        trace!(task = %id, cpu = target, now_ms = self.now / MS, "wakeup");
        self.sys.enqueue_task(target, id, EnqueueFlags::WAKEUP);
        self.sys.check_preempt_curr(target, id);
        self.sys.task_woken(target, id);
    }

    /// If the task running on `cpu` has finished its instance work, retire
    /// the instance per its behaviour. Returns `true` if one was retired.
    fn check_completion(&mut self, cpu: CpuId) -> bool {
        let curr = { self.sys.lock_rq(cpu).curr };
        let Some(id) = curr else { return false };
        let (behavior, fresh) = match self.tasks.get(&id) {
            Some(st) if st.work_left == 0 => (st.behavior, st.fresh_work()),
            _ => return false,
        };

        let deadline = match self.sys.task(id) {
            Some(t) => t.entity().deadline,
            None => return false,
        };
        self.records.push(InstanceRecord {
            task: id,
            completed_at: self.now,
            deadline,
            cpu,
        });
        debug!(
            task = %id,
            now_ms = self.now / MS,
            met = !dl_time_before(deadline, self.now),
            "instance complete"
        );

        match behavior {
            // A busy task's demand is bottomless; keep it that way.
            Behavior::Busy => {
                if let Some(st) = self.tasks.get_mut(&id) {
                    st.work_left = u64::MAX;
                }
            }
            Behavior::Yielding => {
                if let Some(st) = self.tasks.get_mut(&id) {
                    st.work_left = fresh;
                }
                self.sys.yield_task(cpu);
            }
            Behavior::Periodic => {
                let wake_at = self.sys.wait_interval(id, None);
                self.sys.dequeue_task(cpu, id, DequeueFlags::SLEEP);
                if wake_at <= self.now {
                    // Already past the next instance start (deep overrun):
                    // wake straight away.
                    self.wake_task(id);
                } else {
                    self.wakes.push(Reverse((wake_at, id)));
                }
            }
        }
        self.sys.lock_rq(cpu).resched();
        true
    }

    /// Reschedule every CPU that asked for it, repeating until the fleet is
    /// quiescent (a push can mark a remote CPU).
    fn run_schedulers(&mut self) {
        loop {
            let mut any = false;
            for cpu in 0..self.sys.nr_cpus() {
                if self.needs_schedule(cpu) {
                    self.schedule(cpu);
                    any = true;
                }
            }
            if !any {
                break;
            }
        }
    }

    fn needs_schedule(&self, cpu: CpuId) -> bool {
        let (need, idle, dl_pending) = {
            let rq = self.sys.lock_rq(cpu);
            (rq.need_resched, rq.curr.is_none(), rq.dl.nr_running > 0)
        };
        need || (idle && (dl_pending || self.pick_background(cpu).is_some()))
    }

    /// One pass of the core schedule() choreography on `cpu`.
    fn schedule(&mut self, cpu: CpuId) {
        let mut rq = self.sys.lock_rq(cpu);
        let prev = rq.curr;

        if let Some(pid) = prev {
            if let Some(task) = self.sys.task(pid) {
                if task.entity().class.is_deadline() {
                    self.sys.put_prev_task_rq(&mut rq, &task);
                }
            }
        }

        let mut rq = self.sys.pre_schedule(rq, prev);

        let next = match self.sys.pick_next_task_rq(&mut rq) {
            Some(id) => Some(id),
            None => self.pick_background(cpu),
        };
        rq.curr = next;
        rq.need_resched = false;

        if next != prev {
            trace!(
                cpu,
                now_ms = self.now / MS,
                from = ?prev,
                to = ?next,
                "context switch"
            );
        }

        let rq = self.sys.post_schedule(rq);
        drop(rq);
    }

    /// The non-deadline classes, reduced to what the scenarios need: any
    /// runnable task assigned here that is not deadline-class runs when the
    /// deadline queue is empty. Real-time before fair, lower priority value
    /// first.
    fn pick_background(&self, cpu: CpuId) -> Option<TaskId> {
        use crate::task::SchedClass;

        let mut best: Option<(u32, TaskId)> = None;
        for task in self.sys.all_tasks() {
            if task.cpu() != cpu {
                continue;
            }
            let ent = task.entity();
            if !ent.runnable {
                continue;
            }
            let rank = match ent.class {
                SchedClass::Deadline | SchedClass::Idle => continue,
                SchedClass::RealTime(prio) => prio,
                SchedClass::Fair => u32::MAX - 1,
            };
            if best.map_or(true, |(r, _)| rank < r) {
                best = Some((rank, task.id));
            }
        }
        best.map(|(_, id)| id)
    }

    /// Burn CPU time on every runqueue up to `next` and advance the clocks.
    fn consume_cpu(&mut self, next: Ns) {
        let dt = next - self.now;
        for cpu in 0..self.sys.nr_cpus() {
            let curr = { self.sys.lock_rq(cpu).curr };
            if let Some(id) = curr {
                if let Some(st) = self.tasks.get_mut(&id) {
                    st.work_left = st.work_left.saturating_sub(dt);
                }
            }
            self.sys.update_rq_clock(cpu, next);
        }
    }

    /// Earliest upcoming event: tick boundary, timer expiry, wakeup, or a
    /// running instance finishing.
    fn next_event_time(&self) -> Ns {
        let mut next = (self.now / TICK_NS + 1) * TICK_NS;

        if let Some(t) = self.sys.timers().next_expiry() {
            if t > self.now && t < next {
                next = t;
            }
        }
        if let Some(&Reverse((t, _))) = self.wakes.peek() {
            if t > self.now && t < next {
                next = t;
            }
        }
        for cpu in 0..self.sys.nr_cpus() {
            let curr = { self.sys.lock_rq(cpu).curr };
            if let Some(id) = curr {
                if let Some(st) = self.tasks.get(&id) {
                    if st.work_left != 0 && st.work_left != u64::MAX {
                        let done = self.now + st.work_left;
                        if done < next {
                            next = done;
                        }
                    }
                }
            }
        }
        next
    }

    /// Post-run summary, log-only.
    fn report(&self) {
        for (id, st) in &self.tasks {
            let done = self.completions(*id);
            let missed = self.missed_deadlines(*id);
            let (tot_rtime, dmiss_max) = match self.sys.task(*id) {
                Some(t) => {
                    let e = t.entity();
                    (e.stats.tot_rtime, e.stats.dmiss_max)
                }
                None => (0, 0),
            };
            info!(
                task = %st.name,
                completions = done,
                missed,
                tot_rtime_ms = tot_rtime / MS,
                dmiss_max_us = dmiss_max / 1_000,
                "task summary"
            );
        }
        for cpu in 0..self.sys.nr_cpus() {
            let rq = self.sys.lock_rq(cpu);
            let s = rq.dl.stats;
            info!(
                cpu,
                nr_enqueue = s.nr_enqueue,
                nr_dequeue = s.nr_dequeue,
                pushed_away = s.nr_pushed_away,
                pulled_here = s.nr_pulled_here,
                retry_push = s.nr_retry_push,
                exec_clock_ms = s.exec_clock / MS,
                "rq summary"
            );
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
