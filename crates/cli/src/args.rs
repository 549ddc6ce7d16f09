//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use workerman_core::AccountId;
use workerman_infra::QueueBackend;

#[derive(Parser, Debug)]
#[command(name = "workerman", version, about = "Background job queue and scheduler")]
pub struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "WORKERMAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Queue transport (overrides config): memory or redis.
    #[arg(long, global = true)]
    pub queue: Option<QueueBackend>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the job processor until the runtime window closes or Ctrl-C.
    Process {
        /// Seconds before the processor returns (overrides config).
        #[arg(long)]
        runtime: Option<u64>,

        /// Log the summary instead of printing it.
        #[arg(long, default_value_t = false)]
        daemon: bool,
    },

    /// Run the schedule loop for one account.
    Schedule {
        #[arg(long)]
        account: AccountId,

        /// Seconds between passes (overrides config).
        #[arg(long)]
        tick: Option<u64>,
    },

    /// Enqueue a background job.
    Enqueue {
        worker: String,

        /// Workload as a JSON object.
        #[arg(default_value = "{}")]
        workload: String,
    },

    /// Discard every pending job for a worker.
    Clear { worker: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_process_flags() {
        let cli = Cli::parse_from(["workerman", "--queue", "redis", "process", "--runtime", "10", "--daemon"]);
        assert_eq!(cli.queue, Some(QueueBackend::Redis));
        match cli.command {
            Command::Process { runtime, daemon } => {
                assert_eq!(runtime, Some(10));
                assert!(daemon);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_schedule_account() {
        let account = AccountId::new();
        let cli = Cli::parse_from(["workerman", "schedule", "--account", &account.to_string()]);
        match cli.command {
            Command::Schedule { account: parsed, tick } => {
                assert_eq!(parsed, account);
                assert_eq!(tick, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_backend() {
        assert!(Cli::try_parse_from(["workerman", "--queue", "kafka", "clear", "Test"]).is_err());
    }
}
