//! CLI argument parsing definitions

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "piper-worker",
    author,
    version,
    about = "Persistent worker that runs tasks sent over named pipes",
    long_about = None,
    args_conflicts_with_subcommands = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Worker arguments as passed by the orchestrator: tmp dir, debug,
    /// storage flag, tracing level, storage conf, stream backend, stream
    /// host, stream port, cpu affinity, gpu affinity, executors, cache spec,
    /// then the executor pipe pairs and the control pipe pair
    #[arg(value_name = "ARGS", allow_hyphen_values = true)]
    pub args: Vec<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one executor (internal use)
    #[command(hide = true)]
    Executor {
        /// Executor settings as JSON
        #[arg(long, value_name = "JSON")]
        settings: String,
    },

    /// Run the shared cache manager (internal use)
    #[command(hide = true)]
    CacheManager {
        /// Manager configuration as JSON
        #[arg(long, value_name = "JSON")]
        config: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_positional_worker_args() {
        let cli = Cli::try_parse_from([
            "piper-worker", "/tmp/w", "false", "false", "0", "null", "NONE", "localhost", "0",
            "-", "-", "1", "false", "/tmp/e.in", "/tmp/e.out", "/tmp/c.in", "/tmp/c.out",
        ])
        .unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.args.len(), 16);
        assert_eq!(cli.args[8], "-");
    }

    #[test]
    fn test_hidden_subcommands() {
        let cli = Cli::try_parse_from(["piper-worker", "executor", "--settings", "{}"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Executor { settings }) if settings == "{}"));

        let cli =
            Cli::try_parse_from(["piper-worker", "cache-manager", "--config", "{\"a\":1}"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::CacheManager { .. })));
        assert!(cli.args.is_empty());
    }

    #[test]
    fn test_nothing_to_do_is_an_error() {
        assert!(Cli::try_parse_from(["piper-worker"]).is_err());
    }
}
