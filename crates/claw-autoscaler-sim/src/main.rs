//! Simulator binary entrypoint.
//!
//! Loads an autoscaler configuration and a cluster description, then runs
//! autoscaler iterations against the in-memory provider.

mod cli;
mod cluster;
mod sim;

use std::io::{self, Write};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use claw_autoscaler::status::ClusterAutoscalerStatus;
use claw_autoscaler::AutoscalingOptions;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, RunArgs};
use crate::cluster::ClusterDescription;
use crate::sim::{IterationReport, Simulation};

const DEFAULT_FILTER: &str = "claw_autoscaler=info,claw_autoscaler_sim=info";

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut stdout = io::stdout().lock();
    match cli.command {
        Commands::Run(args) => run_simulation(&mut stdout, &args).await,
        Commands::CheckConfig { config } => {
            let options = AutoscalingOptions::from_file(&config)?;
            writeln!(
                stdout,
                "{}: ok (expanders {}, scan interval {}s)",
                config.display(),
                options.scale_up.expander_names.join(","),
                options.scan_interval.as_secs()
            )?;
            Ok(())
        }
        Commands::DefaultConfig => {
            write!(stdout, "{}", AutoscalingOptions::default().to_toml()?)?;
            Ok(())
        }
    }
}

async fn run_simulation(out: &mut impl Write, args: &RunArgs) -> Result<()> {
    let options = match &args.config {
        Some(path) => AutoscalingOptions::from_file(path)?,
        None => AutoscalingOptions::default(),
    };
    let description = ClusterDescription::from_file(&args.cluster)?;
    let mut sim = Simulation::new(options, &description, Utc::now())?;

    let reports = sim.run(args.iterations).await?;
    sim.finish().context("cleanup failed")?;

    if args.json {
        let status = sim.status().context("no iteration produced a status")?;
        serde_json::to_writer_pretty(&mut *out, status)?;
        writeln!(out)?;
    } else {
        write_reports(out, &reports)?;
        if let Some(status) = sim.status() {
            write_status(out, status)?;
        }
    }
    if args.metrics {
        write!(out, "{}", sim.metrics().encode())?;
    }
    Ok(())
}

fn write_reports(out: &mut impl Write, reports: &[IterationReport]) -> Result<()> {
    writeln!(
        out,
        "{:<5} {:<20} {:<22} {:>6} {:>8} {:>6}",
        "ITER", "SCALE UP", "SCALE DOWN", "NODES", "PENDING", "BOUND"
    )?;
    for r in reports {
        writeln!(
            out,
            "{:<5} {:<20} {:<22} {:>6} {:>8} {:>6}",
            r.iteration,
            format!("{:?}", r.scale_up),
            format!("{:?}", r.scale_down),
            r.nodes,
            r.pending_pods,
            r.bound_pods
        )?;
    }
    Ok(())
}

fn write_status(out: &mut impl Write, status: &ClusterAutoscalerStatus) -> Result<()> {
    writeln!(out)?;
    writeln!(
        out,
        "cluster {:?}: {} ready, {} unready, {} not started",
        status.cluster_health,
        status.readiness.ready,
        status.readiness.unready,
        status.readiness.not_started
    )?;
    for group in &status.node_groups {
        writeln!(
            out,
            "  {:<16} {:?} target={} min={} max={} ready={}",
            group.id.to_string(),
            group.health,
            group.target_size,
            group.min_size,
            group.max_size,
            group.readiness.ready
        )?;
    }
    if !status.scale_down_candidates.is_empty() {
        writeln!(
            out,
            "scale-down candidates: {}",
            status.scale_down_candidates.join(", ")
        )?;
    }
    Ok(())
}
