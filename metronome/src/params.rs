/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Declared deadline parameters, entity flags, and CPU affinity masks.
//!
//! [`DlParams`] is the immutable triple a task advertises when it joins the
//! deadline class; everything the CBS machinery mutates at runtime lives in
//! [`DlEntity`](crate::entity::DlEntity) instead. Parameters are validated
//! once, at installation, and never checked again on the hot paths.

use thiserror::Error;

use crate::time::Ns;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Fixed-point shift for bandwidth values: `dl_bw` is a Q44.20 fraction,
/// `1 << BW_SHIFT` meaning 100% of one CPU.
pub const BW_SHIFT: u32 = 20;

/// One full CPU of bandwidth in `dl_bw` fixed-point units.
pub const BW_UNIT: u64 = 1 << BW_SHIFT;

/// Number of real-time priority levels in the (collaborating) rt class.
/// A `BWRECL_RT` downgrade lands at `MAX_RT_PRIO - 1 - rt_priority`.
pub const MAX_RT_PRIO: u32 = 100;

/// Minimum accepted value for each timing parameter. Rejecting sub-1024ns
/// values keeps the bandwidth fixed-point math meaningful.
const DL_PARAM_MIN_NS: u64 = 1024;

// ── Entity flags ──────────────────────────────────────────────────────────────

bitflags::bitflags! {
    /// Behaviour flags carried by a deadline entity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DlFlags: u32 {
        /// Strict priority over every non-HEAD deadline entity; exempt from
        /// CBS throttling. Reserved for system-critical work.
        const HEAD      = 0x01;
        /// Never throttle: on budget exhaustion the entity is replenished in
        /// place, reclaiming bandwidth inside the deadline class.
        const BWRECL_DL = 0x02;
        /// On throttle, downgrade the task to the real-time class at
        /// priority `MAX_RT_PRIO - 1 - rt_priority` until replenishment.
        const BWRECL_RT = 0x04;
        /// On throttle, downgrade the task to the fair class at default
        /// priority until replenishment.
        const BWRECL_NR = 0x08;
    }
}

impl DlFlags {
    /// True if any of the bandwidth-reclaiming downgrade modes is set.
    pub fn reclaims_outside_class(self) -> bool {
        self.intersects(DlFlags::BWRECL_RT | DlFlags::BWRECL_NR)
    }
}

// ── Declared parameters ───────────────────────────────────────────────────────

/// The `(runtime, deadline, period)` triple a deadline task declares, plus
/// its pre-computed reserved bandwidth.
///
/// Immutable between parameter updates. `period` is used only to displace
/// replenishments; the reserved bandwidth is `runtime / deadline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlParams {
    /// Worst-case runtime budget per instance, in ns.
    pub dl_runtime: u64,
    /// Relative deadline, in ns.
    pub dl_deadline: u64,
    /// Period, in ns. Replenishments advance the absolute deadline by whole
    /// multiples of this.
    pub dl_period: u64,
    /// Reserved bandwidth `(dl_runtime << BW_SHIFT) / dl_deadline`,
    /// contributed to the root domain's `total_bw` on activation.
    pub dl_bw: u64,
}

impl DlParams {
    /// Validate and build a parameter set.
    ///
    /// The accepted shape is `0 < runtime <= deadline <= period`, each at
    /// least [`DL_PARAM_MIN_NS`]. This is the same sanity gate the parameter
    /// installer applies at the user boundary; scheduling code trusts it.
    pub fn new(runtime: Ns, deadline: Ns, period: Ns) -> Result<Self, DlParamsError> {
        if runtime < DL_PARAM_MIN_NS || deadline < DL_PARAM_MIN_NS || period < DL_PARAM_MIN_NS {
            return Err(DlParamsError::BelowMinimum {
                runtime,
                deadline,
                period,
                min: DL_PARAM_MIN_NS,
            });
        }
        if !(runtime <= deadline && deadline <= period) {
            return Err(DlParamsError::NotOrdered {
                runtime,
                deadline,
                period,
            });
        }

        Ok(Self {
            dl_runtime: runtime,
            dl_deadline: deadline,
            dl_period: period,
            dl_bw: to_ratio(deadline, runtime),
        })
    }

    /// Utilisation as a plain fraction, for logs and reports.
    pub fn utilization(&self) -> f64 {
        self.dl_bw as f64 / BW_UNIT as f64
    }
}

/// Fixed-point ratio `value / base`, shifted by [`BW_SHIFT`].
pub fn to_ratio(base: u64, value: u64) -> u64 {
    if base == 0 {
        return 0;
    }
    (value << BW_SHIFT) / base
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Rejection reasons for a deadline parameter set.
///
/// Every variant carries the offending values so the caller can log them
/// without re-deriving anything.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DlParamsError {
    /// The triple violates `runtime <= deadline <= period`.
    #[error(
        "deadline parameters not ordered: require runtime ({runtime}ns) <= \
         deadline ({deadline}ns) <= period ({period}ns)"
    )]
    NotOrdered { runtime: u64, deadline: u64, period: u64 },

    /// One of the values is below the minimum granularity.
    #[error(
        "deadline parameters too small: ({runtime}, {deadline}, {period})ns, \
         each must be at least {min}ns"
    )]
    BelowMinimum {
        runtime: u64,
        deadline: u64,
        period: u64,
        min: u64,
    },
}

// ── CPU masks ─────────────────────────────────────────────────────────────────

/// CPU identifier. CPUs are dense indices into the per-CPU runqueue array.
pub type CpuId = u32;

/// Affinity set expressed as a bitmask: bit N set means CPU N is allowed.
/// Supports up to 64 CPUs, which covers every domain we target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMask(pub u64);

impl CpuMask {
    /// Mask allowing the first `nr_cpus` CPUs.
    pub fn all(nr_cpus: u32) -> Self {
        if nr_cpus >= 64 {
            CpuMask(u64::MAX)
        } else {
            CpuMask((1u64 << nr_cpus) - 1)
        }
    }

    /// Mask allowing exactly one CPU.
    pub fn single(cpu: CpuId) -> Self {
        CpuMask(1u64 << cpu)
    }

    /// Returns `true` if `cpu` is in the set.
    pub fn contains(&self, cpu: CpuId) -> bool {
        cpu < 64 && (self.0 >> cpu) & 1 == 1
    }

    /// Cardinality of the set.
    pub fn weight(&self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate the CPUs in the set, lowest first.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        (0..64u32).filter(move |&c| self.contains(c))
    }
}

impl Default for CpuMask {
    fn default() -> Self {
        CpuMask(u64::MAX)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
