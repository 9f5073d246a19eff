/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Per-task CBS state: the budget/deadline pair and everything that mutates
//! it.
//!
//! Three entry points change an entity's timing, all called with the task's
//! runqueue lock held:
//!
//! * **instance start** — a brand-new instance gets `deadline = now +
//!   dl_deadline` and a full budget;
//! * **enqueue update** — a waking task keeps its `(deadline, runtime)` pair
//!   unless the deadline passed or the residual bandwidth would exceed the
//!   declared one (the CBS wake rule);
//! * **replenish** — an exhausted budget is refilled in whole periods,
//!   advancing the deadline accordingly.
//!
//! When the entity is boosted by a priority-inheritance donor, the donor's
//! parameters drive these decisions; the entity's own deadline still keys
//! the ready tree.

use tracing::warn;

use crate::params::{CpuMask, DlFlags, DlParams};
use crate::rq::tree::EdfKey;
use crate::task::{SchedClass, TaskId};
use crate::time::{dl_entity_overflow, dl_time_before, Ns};

// ── Statistics ────────────────────────────────────────────────────────────────

/// Observable per-entity counters. Never consulted by scheduling decisions.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntityStats {
    /// Total runtime consumed, ns.
    pub tot_rtime: u64,
    /// Lateness of the most recent deadline miss, ns.
    pub last_dmiss: u64,
    /// Worst deadline miss observed, ns.
    pub dmiss_max: u64,
    /// Most recent runtime overrun, ns.
    pub last_rorun: u64,
    /// Worst runtime overrun observed, ns.
    pub rorun_max: u64,
}

impl EntityStats {
    pub fn record_dmiss(&mut self, lateness: u64) {
        self.last_dmiss = lateness;
        self.dmiss_max = self.dmiss_max.max(lateness);
    }

    pub fn record_rorun(&mut self, overrun: u64) {
        self.last_rorun = overrun;
        self.rorun_max = self.rorun_max.max(overrun);
    }
}

// ── Entity ────────────────────────────────────────────────────────────────────

/// The deadline entity embedded in every task handle.
///
/// Guarded by the task's entity mutex; every field is read and written under
/// it, with the runqueue lock of the task's CPU held around the combination.
#[derive(Debug)]
pub struct DlEntity {
    /// Declared parameters. Meaningless until the installer has run; the
    /// entity is created throttled and off every tree, so nothing reads
    /// them before then.
    pub params: DlParams,
    pub flags: DlFlags,

    /// Remaining budget for the current instance, ns. Goes negative
    /// transiently when accounting granularity overshoots.
    pub runtime: i64,
    /// Current absolute deadline, ns.
    pub deadline: Ns,

    /// A brand-new instance is being activated; the next enqueue resets
    /// deadline and budget unconditionally.
    pub dl_new: bool,
    /// Suspended awaiting replenishment. While set, the entity is in no
    /// ready tree and the replenishment timer is armed.
    pub dl_throttled: bool,
    /// Core-level runnable state: true from wake to block. Orthogonal to
    /// throttling.
    pub runnable: bool,

    pub class: SchedClass,
    /// Real-time priority consumed by the `BWRECL_RT` downgrade formula.
    pub rt_priority: u32,

    pub cpus_allowed: CpuMask,
    /// Cached cardinality of `cpus_allowed`.
    pub nr_cpus_allowed: u32,

    /// Parameters of the top priority-inheritance waiter, when boosted.
    pub boosted: Option<DlParams>,

    /// Runqueue clock at last dispatch, for runtime accounting.
    pub exec_start: Ns,

    /// Exact key under which the entity sits in the ready tree, if queued.
    pub queued_key: Option<EdfKey>,
    /// Exact key under which the entity sits in the pushable tree, if there.
    pub pushable_key: Option<EdfKey>,

    /// Replenishment timer bookkeeping: armed flag plus a generation
    /// counter. Cancellation bumps the generation; a callback carrying a
    /// stale generation is a no-op.
    pub timer_armed: bool,
    pub timer_gen: u64,

    lag_warned: bool,

    pub stats: EntityStats,
}

impl DlEntity {
    /// A freshly forked entity: throttled, not a new instance, not runnable.
    /// It stays in this state until parameters are installed.
    pub fn new() -> Self {
        Self {
            params: DlParams {
                dl_runtime: 0,
                dl_deadline: 0,
                dl_period: 0,
                dl_bw: 0,
            },
            flags: DlFlags::empty(),
            runtime: 0,
            deadline: 0,
            dl_new: false,
            dl_throttled: true,
            runnable: false,
            class: SchedClass::Fair,
            rt_priority: 0,
            cpus_allowed: CpuMask::default(),
            nr_cpus_allowed: 64,
            boosted: None,
            exec_start: 0,
            queued_key: None,
            pushable_key: None,
            timer_armed: false,
            timer_gen: 0,
            lag_warned: false,
            stats: EntityStats::default(),
        }
    }

    /// Parameters driving CBS decisions: the boost donor's while boosted,
    /// the entity's own otherwise.
    pub fn ref_params(&self) -> DlParams {
        self.boosted.unwrap_or(self.params)
    }

    pub fn is_migratable(&self) -> bool {
        self.nr_cpus_allowed > 1
    }

    /// Ready-tree key. Always the entity's own deadline, boosted or not.
    pub fn key(&self, task: TaskId) -> EdfKey {
        EdfKey {
            head: self.flags.contains(DlFlags::HEAD),
            deadline: self.deadline,
            task,
        }
    }

    pub fn set_affinity(&mut self, mask: CpuMask) {
        self.cpus_allowed = mask;
        self.nr_cpus_allowed = mask.weight();
    }

    /// Residual-bandwidth check at time `t` against the given declared
    /// parameters (the caller picks own vs donor parameters).
    pub fn overflows(&self, params: &DlParams, t: Ns) -> bool {
        dl_entity_overflow(
            self.runtime,
            self.deadline,
            params.dl_runtime,
            params.dl_deadline,
            t,
        )
    }

    // ── CBS mutations ─────────────────────────────────────────────────────────

    /// Instance start: fresh deadline and full budget.
    pub fn setup_new_instance(&mut self, now: Ns) {
        let p = self.ref_params();
        self.deadline = now.wrapping_add(p.dl_deadline);
        self.runtime = p.dl_runtime as i64;
        self.dl_new = false;
    }

    /// Enqueue update for a task that is neither new nor replenishing.
    ///
    /// Keeps the `(deadline, runtime)` pair when it is still worth keeping;
    /// resets it like an instance start when the deadline has passed or the
    /// residual density would overflow the declared bandwidth.
    pub fn update_on_enqueue(&mut self, now: Ns) {
        if self.dl_new {
            self.setup_new_instance(now);
            return;
        }

        let p = self.ref_params();
        if dl_time_before(self.deadline, now) || self.overflows(&p, now) {
            self.deadline = now.wrapping_add(p.dl_deadline);
            self.runtime = p.dl_runtime as i64;
        }
    }

    /// Refill an exhausted budget, advancing the deadline by whole periods.
    ///
    /// The loop absorbs overruns longer than one period. If the advanced
    /// deadline is still in the past the entity has lagged beyond recovery:
    /// log once and reset to a fresh instance.
    pub fn replenish(&mut self, now: Ns, name: &str) {
        if self.dl_new {
            self.setup_new_instance(now);
            return;
        }

        let p = self.ref_params();
        debug_assert!(p.dl_runtime > 0);

        while self.runtime <= 0 {
            self.deadline = self.deadline.wrapping_add(p.dl_period);
            self.runtime += p.dl_runtime as i64;
        }

        if dl_time_before(self.deadline, now) {
            if !self.lag_warned {
                self.lag_warned = true;
                warn!(
                    task = name,
                    deadline = self.deadline,
                    now,
                    "replenished deadline still in the past, resetting to a fresh instance"
                );
            }
            self.deadline = now.wrapping_add(p.dl_deadline);
            self.runtime = p.dl_runtime as i64;
        }
    }

    /// Deepest sleep instant compatible with waking into a fresh instance.
    ///
    /// With no target, sleep to the start of the next period. With a target
    /// `t` earlier than the current deadline, if the pair would still be
    /// usable at `t`, postpone the wake to the latest moment at which a
    /// replenishment becomes unavoidable. Marks the next activation as a
    /// new instance either way.
    pub fn next_instance_wake(&mut self, t: Option<Ns>) -> Ns {
        let p = self.params;
        let wake = match t {
            None => self
                .deadline
                .wrapping_add(p.dl_period)
                .wrapping_sub(p.dl_deadline),
            Some(t) => {
                if dl_time_before(t, self.deadline) && !self.overflows(&p, t) {
                    // runtime > 0 here, the overflow check short-circuits
                    // non-positive budgets.
                    let postpone = (self.runtime as u64 * p.dl_period) / p.dl_runtime;
                    self.deadline.wrapping_sub(postpone)
                } else {
                    t
                }
            }
        };
        self.dl_new = true;
        wake
    }
}

impl Default for DlEntity {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
