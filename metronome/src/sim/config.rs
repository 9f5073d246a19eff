/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Workload configuration for the simulator.
//!
//! The expected YAML structure is:
//! ```yaml
//! cpus: 2
//! duration_ms: 200
//! tasks:
//!   camera:
//!     runtime_ms: 4
//!     deadline_ms: 10      # optional, defaults to period_ms
//!     period_ms: 10
//!     exec_ms: 3           # actual CPU demand per instance
//!     start_ms: 0
//!     behavior: periodic   # periodic | busy | yielding
//!     affinity: [0, 1]     # optional, defaults to every CPU
//!     flags: [bwrecl_dl]   # optional
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::params::{CpuMask, DlFlags};

// ── Private YAML deserialization types ────────────────────────────────────────

/// Top-level wrapper that maps directly onto the YAML file layout. Kept
/// private; callers work with [`SimConfig`].
#[derive(Debug, Deserialize)]
struct SimConfigFile {
    #[serde(default = "default_cpus")]
    cpus: u32,
    #[serde(default = "default_duration_ms")]
    duration_ms: u64,
    #[serde(default)]
    hrtick: bool,
    #[serde(default)]
    tasks: BTreeMap<String, SimTaskEntry>,
}

#[derive(Debug, Deserialize)]
struct SimTaskEntry {
    runtime_ms: u64,
    deadline_ms: Option<u64>,
    period_ms: u64,
    exec_ms: Option<u64>,
    #[serde(default)]
    start_ms: u64,
    #[serde(default)]
    behavior: Behavior,
    affinity: Option<Vec<u32>>,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    rt_priority: u32,
}

fn default_cpus() -> u32 {
    2
}

fn default_duration_ms() -> u64 {
    200
}

// ── Public data structures ────────────────────────────────────────────────────

/// What a task does with its CPU time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    /// Execute `exec_ms`, then sleep until the next instance.
    #[default]
    Periodic,
    /// Never block; consumes whatever the scheduler allows.
    Busy,
    /// Execute `exec_ms`, then yield the rest of the instance.
    Yielding,
}

/// One workload task, validated and unit-converted.
#[derive(Debug, Clone)]
pub struct SimTaskSpec {
    pub name: String,
    pub runtime_ms: u64,
    pub deadline_ms: u64,
    pub period_ms: u64,
    /// Actual CPU demand per instance, ms. Irrelevant for `Busy`.
    pub exec_ms: u64,
    /// Release offset from simulation start, ms.
    pub start_ms: u64,
    pub behavior: Behavior,
    pub affinity: CpuMask,
    pub flags: DlFlags,
    pub rt_priority: u32,
}

/// A fully validated simulation setup.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub cpus: u32,
    pub duration_ms: u64,
    pub hrtick: bool,
    pub tasks: Vec<SimTaskSpec>,
}

impl SimConfig {
    /// Parse `path` and build the workload.
    ///
    /// * An empty `tasks` section gets a single default demo task, so a
    ///   bare config still produces a visible run.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened, the YAML is
    /// structurally invalid, a flag name is unknown, or `cpus` is out of
    /// the supported 1..=64 range.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading workload configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;

        let file: SimConfigFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML file: {}", path.display()))?;

        if file.cpus == 0 || file.cpus > 64 {
            bail!("cpus must be within 1..=64, got {}", file.cpus);
        }

        let mut tasks = Vec::new();
        for (name, entry) in file.tasks {
            let spec = Self::build_task(&name, entry, file.cpus)
                .with_context(|| format!("invalid task '{name}'"))?;
            debug!(
                task = %spec.name,
                runtime_ms = spec.runtime_ms,
                deadline_ms = spec.deadline_ms,
                period_ms = spec.period_ms,
                exec_ms = spec.exec_ms,
                "  task loaded"
            );
            tasks.push(spec);
        }

        // Fallback: no tasks parsed, insert a default demo task.
        if tasks.is_empty() {
            warn!("No tasks found in configuration file, using a default demo task");
            tasks.push(SimTaskSpec {
                name: "default_task".to_string(),
                runtime_ms: 2,
                deadline_ms: 10,
                period_ms: 10,
                exec_ms: 1,
                start_ms: 0,
                behavior: Behavior::Periodic,
                affinity: CpuMask::all(file.cpus),
                flags: DlFlags::empty(),
                rt_priority: 0,
            });
        }

        info!(
            cpus = file.cpus,
            duration_ms = file.duration_ms,
            task_count = tasks.len(),
            "Workload configuration loaded"
        );

        Ok(SimConfig {
            cpus: file.cpus,
            duration_ms: file.duration_ms,
            hrtick: file.hrtick,
            tasks,
        })
    }

    fn build_task(name: &str, entry: SimTaskEntry, cpus: u32) -> Result<SimTaskSpec> {
        let affinity = match &entry.affinity {
            None => CpuMask::all(cpus),
            Some(list) => {
                let mut mask = CpuMask(0);
                for &cpu in list {
                    if cpu >= cpus {
                        bail!("affinity CPU {cpu} is outside 0..{cpus}");
                    }
                    mask.0 |= 1 << cpu;
                }
                mask
            }
        };

        let mut flags = DlFlags::empty();
        for f in &entry.flags {
            flags |= match f.as_str() {
                "head" => DlFlags::HEAD,
                "bwrecl_dl" => DlFlags::BWRECL_DL,
                "bwrecl_rt" => DlFlags::BWRECL_RT,
                "bwrecl_nr" => DlFlags::BWRECL_NR,
                other => bail!("unknown flag '{other}'"),
            };
        }

        Ok(SimTaskSpec {
            name: name.to_string(),
            runtime_ms: entry.runtime_ms,
            deadline_ms: entry.deadline_ms.unwrap_or(entry.period_ms),
            period_ms: entry.period_ms,
            exec_ms: entry.exec_ms.unwrap_or(entry.runtime_ms),
            start_ms: entry.start_ms,
            behavior: entry.behavior,
            affinity,
            flags,
            rt_priority: entry.rt_priority,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
