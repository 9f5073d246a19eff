/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Task identity and the per-task handle shared across CPUs.
//!
//! Back-pointer cycles (entity <-> task <-> runqueue <-> domain) are resolved
//! by indexing: tasks are looked up by [`TaskId`] in the system table,
//! runqueues by CPU index. The only piece of task state readable without the
//! entity lock is the assigned CPU, kept in an atomic so the replenishment
//! timer callback can find the right runqueue lock first and re-verify after
//! acquiring it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::entity::DlEntity;
use crate::params::CpuId;

// ── Identity ──────────────────────────────────────────────────────────────────

/// Dense task identifier, unique for the lifetime of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task{}", self.0)
    }
}

// ── Scheduling class ──────────────────────────────────────────────────────────

/// The closed set of scheduling classes the dispatch core knows about.
///
/// Only `Deadline` is implemented by this crate; the other variants exist so
/// class changes (explicit, or `BWRECL_*` downgrades) have somewhere to go
/// and so the driver can run downgraded tasks as background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedClass {
    Deadline,
    /// Real-time class at the given priority (0 = highest).
    RealTime(u32),
    Fair,
    Idle,
}

impl SchedClass {
    pub fn is_deadline(&self) -> bool {
        matches!(self, SchedClass::Deadline)
    }
}

// ── Task handle ───────────────────────────────────────────────────────────────

/// Shared per-task handle: identity plus the lock-guarded deadline entity.
#[derive(Debug)]
pub struct DlTask {
    pub id: TaskId,
    /// Human-readable name, for logs only.
    pub name: String,
    /// CPU this task is currently assigned to. Written under the runqueue
    /// lock of the destination; read lock-free by the timer callback and the
    /// wake path, which re-verify under the lock.
    cpu: AtomicU32,
    entity: Mutex<DlEntity>,
}

impl DlTask {
    pub fn new(id: TaskId, name: impl Into<String>, cpu: CpuId) -> Self {
        Self {
            id,
            name: name.into(),
            cpu: AtomicU32::new(cpu),
            entity: Mutex::new(DlEntity::new()),
        }
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu.load(Ordering::Acquire)
    }

    pub fn set_cpu(&self, cpu: CpuId) {
        self.cpu.store(cpu, Ordering::Release);
    }

    /// Lock the entity. Always acquired after any runqueue locks, never
    /// while another task's entity is held.
    pub fn entity(&self) -> MutexGuard<'_, DlEntity> {
        self.entity.lock().expect("entity lock poisoned")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
