/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Deadline clock arithmetic.
//!
//! All absolute instants in this crate are 64-bit monotonic **nanoseconds**.
//! Comparisons use the wrap-safe signed difference so the clock can be
//! treated modulo 2^64: a scheduler that runs for centuries keeps working,
//! as long as any two live deadlines are within 2^63 ns of each other
//! (about 292 years, which every sane task set satisfies).

/// Absolute monotonic time in nanoseconds.
pub type Ns = u64;

/// Wrap-safe "a is earlier than b".
///
/// `(a - b)` interpreted as signed: negative means `a` precedes `b` even
/// when the raw values have wrapped around `u64::MAX`.
#[inline]
pub fn dl_time_before(a: Ns, b: Ns) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

/// Wrap-safe max of two instants.
#[inline]
pub fn dl_time_max(a: Ns, b: Ns) -> Ns {
    if dl_time_before(a, b) {
        b
    } else {
        a
    }
}

/// CBS overflow predicate: would the entity's residual bandwidth, if kept,
/// exceed its declared bandwidth at time `t`?
///
/// Tests `runtime / (deadline - t) >= dl_runtime / dl_deadline` by
/// cross-multiplying, so no division is involved:
///
/// ```text
/// (deadline - t) * dl_runtime <= dl_deadline * runtime
/// ```
///
/// A non-positive `runtime` short-circuits to `true`: there is no residual
/// bandwidth to keep. Operands are unsigned 64-bit; with runtimes bounded by
/// seconds and bandwidths by one, the products stay far below `u64::MAX`.
#[inline]
pub fn dl_entity_overflow(
    runtime: i64,
    deadline: Ns,
    dl_runtime: u64,
    dl_deadline: u64,
    t: Ns,
) -> bool {
    if runtime <= 0 {
        return true;
    }
    if !dl_time_before(t, deadline) {
        return true;
    }

    let left = deadline.wrapping_sub(t) * dl_runtime;
    let right = dl_deadline * runtime as u64;

    left <= right
}

// ── Tests ─────────────────────────────────────────────────────────────────────
