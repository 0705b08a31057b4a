//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Runs the cluster autoscaler against a simulated cluster.
#[derive(Parser, Debug, Clone)]
#[command(name = "claw-autoscaler-sim")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run autoscaler iterations against a cluster description.
    Run(RunArgs),

    /// Load and validate a configuration file.
    CheckConfig {
        /// Path to the TOML configuration.
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print the default configuration as TOML.
    DefaultConfig,
}

/// Arguments for `run`.
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to the TOML configuration. Defaults apply when omitted.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path to the JSON cluster description.
    #[arg(long)]
    pub cluster: PathBuf,

    /// Number of iterations to run.
    #[arg(short = 'n', long, default_value_t = 10)]
    pub iterations: u32,

    /// Print the final status document as JSON.
    #[arg(long)]
    pub json: bool,

    /// Print the metrics in text exposition format after the run.
    #[arg(long)]
    pub metrics: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run() {
        let cli = Cli::parse_from([
            "claw-autoscaler-sim",
            "run",
            "--cluster",
            "cluster.json",
            "-n",
            "3",
            "--json",
        ]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.cluster, PathBuf::from("cluster.json"));
                assert_eq!(args.iterations, 3);
                assert!(args.json);
                assert!(args.config.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(!cli.json_logs);
    }

    #[test]
    fn parse_check_config() {
        let cli = Cli::parse_from([
            "claw-autoscaler-sim",
            "--json-logs",
            "check-config",
            "--config",
            "autoscaler.toml",
        ]);
        assert!(cli.json_logs);
        assert!(matches!(cli.command, Commands::CheckConfig { .. }));
    }

    #[test]
    fn cluster_is_required_for_run() {
        assert!(Cli::try_parse_from(["claw-autoscaler-sim", "run"]).is_err());
    }
}
