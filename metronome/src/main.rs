/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! CLI front end: run a workload YAML on the simulator.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use metronome::sim::config::SimConfig;
use metronome::sim::Simulator;

#[derive(Parser, Debug)]
#[command(
    name = "metronome",
    about = "Simulate a deadline-scheduling workload (EDF + CBS + push/pull)"
)]
struct Cli {
    /// Workload configuration file (CPU count, duration, tasks).
    #[arg(short, long)]
    config: PathBuf,

    /// Override the simulated duration, in milliseconds.
    #[arg(long)]
    duration_ms: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = SimConfig::load_from_file(&cli.config)?;
    if let Some(d) = cli.duration_ms {
        cfg.duration_ms = d;
    }

    let mut sim = Simulator::new(&cfg);
    sim.run();
    Ok(())
}
