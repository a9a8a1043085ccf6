// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `fleetcast`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "fleetcast",
    version,
    about = "Schedule and run OS image deployments, multicast sessions and post-deployment tasks.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Fleetcast.toml")]
    pub config: String,

    /// Exit once nothing is in flight and nothing is due.
    #[arg(long)]
    pub once: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FLEETCAST_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the plan, but don't run anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Seconds between scheduler ticks; overrides `[scheduler].tick_interval_secs`.
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub tick_interval: Option<u64>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = CliArgs::try_parse_from(["fleetcast"]).unwrap();
        assert_eq!(args.config, "Fleetcast.toml");
        assert!(!args.once);
        assert!(!args.dry_run);
        assert!(args.tick_interval.is_none());
    }

    #[test]
    fn zero_tick_interval_is_rejected() {
        assert!(CliArgs::try_parse_from(["fleetcast", "--tick-interval", "0"]).is_err());
        let args = CliArgs::try_parse_from(["fleetcast", "--tick-interval", "2", "--once"]).unwrap();
        assert_eq!(args.tick_interval, Some(2));
        assert!(args.once);
    }
}
