//! CLI argument parsing for fleetpace.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::LazyLock;

fn generate_after_help() -> String {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fleetpace")
        .join("logs");
    format!(
        "Logs are written to: {} (override data_dir in fleetpace.yml)",
        log_dir.join("fleetpace.log").display()
    )
}

static AFTER_HELP: LazyLock<String> = LazyLock::new(generate_after_help);

#[derive(Parser)]
#[command(
    name = "fleetpace",
    about = "Paced action orchestration for identity fleets",
    version,
    after_help = AFTER_HELP.as_str()
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the effective configuration
    Config,

    /// List active rate-limit blocks
    #[command(alias = "ls")]
    Limits {
        /// Only show blocks on this identity
        #[arg(short, long)]
        identity: Option<String>,
    },

    /// Lift every rate-limit block on an identity
    Unblock {
        /// Identity ID
        identity: String,
    },

    /// Rewrite the ledger file keeping only active blocks
    Compact,

    /// Run a reconciliation pass and a post schedule against an in-memory fleet
    Simulate {
        /// Number of identities in the simulated fleet
        #[arg(short, long, default_value = "10")]
        identities: usize,

        /// Participation target of the simulated campaign
        #[arg(short, long, default_value = "5")]
        target: u32,

        /// Reconcile in sync mode (trim above target)
        #[arg(long)]
        sync: bool,
    },

    /// Serve JSON-line control requests on stdin with periodic sweeps
    Serve {
        /// Number of identities in the simulated fleet
        #[arg(short, long, default_value = "10")]
        identities: usize,

        /// Participation target of the simulated campaign
        #[arg(short, long, default_value = "5")]
        target: u32,

        /// Sweep in sync mode (trim above target)
        #[arg(long)]
        sync: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unblock() {
        let cli = Cli::try_parse_from(["fleetpace", "-v", "unblock", "acc-3"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Some(Command::Unblock { identity }) => assert_eq!(identity, "acc-3"),
            _ => panic!("expected unblock"),
        }
    }

    #[test]
    fn test_parse_simulate_defaults() {
        let cli = Cli::try_parse_from(["fleetpace", "simulate"]).unwrap();
        match cli.command {
            Some(Command::Simulate {
                identities,
                target,
                sync,
            }) => {
                assert_eq!(identities, 10);
                assert_eq!(target, 5);
                assert!(!sync);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_parse_serve() {
        let cli = Cli::try_parse_from(["fleetpace", "serve", "-i", "3", "--sync"]).unwrap();
        match cli.command {
            Some(Command::Serve {
                identities,
                target,
                sync,
            }) => {
                assert_eq!(identities, 3);
                assert_eq!(target, 5);
                assert!(sync);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["fleetpace", "limits", "--config", "/tmp/f.yml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/f.yml")));
    }
}
