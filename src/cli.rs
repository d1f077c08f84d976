//! Command line front end.
//!
//! ```text
//! roost start [-c FILE] [-f]   validate, detach and serve
//! roost stop [-c FILE]         SIGTERM the daemon and wait for it to exit
//! roost reload [-c FILE]       SIGUSR2 the daemon
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use crate::http::ServerInstance;
use crate::lifecycle::{Supervisor, SupervisorError};

#[derive(Debug, Parser)]
#[command(name = "roost")]
#[command(about = "Embeddable HTTP server runtime", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start serving (in the background unless --foreground)
    Start {
        #[command(flatten)]
        conf: ConfArg,

        /// Stay attached to the terminal
        #[arg(short, long)]
        foreground: bool,
    },
    /// Gracefully stop the running daemon
    Stop {
        #[command(flatten)]
        conf: ConfArg,
    },
    /// Reload configuration without dropping connections
    Reload {
        #[command(flatten)]
        conf: ConfArg,
    },
}

#[derive(Debug, Args)]
struct ConfArg {
    /// Configuration file [default: <binary dir>/conf/roost.yaml]
    #[arg(short, long = "conf", value_name = "FILE")]
    conf: Option<PathBuf>,
}

impl ConfArg {
    fn resolve(&self, supervisor: &Supervisor) -> PathBuf {
        match &self.conf {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.clone()),
            None => supervisor.default_conf_file(),
        }
    }
}

/// Parse process arguments and run the command against `servers`.
pub fn run(servers: Vec<ServerInstance>) -> ExitCode {
    run_with(Cli::parse(), Supervisor::new(servers))
}

/// Run an already parsed command.
pub fn run_with(cli: Cli, mut supervisor: Supervisor) -> ExitCode {
    match execute(cli, &mut supervisor) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: Cli, supervisor: &mut Supervisor) -> Result<(), SupervisorError> {
    match cli.command {
        Command::Start { conf, foreground } => {
            let conf = conf.resolve(supervisor);
            supervisor.start(&conf, foreground)
        }
        Command::Stop { conf } => {
            let pid = supervisor.stop(&conf.resolve(supervisor))?;
            println!("Stopped process {pid}");
            Ok(())
        }
        Command::Reload { conf } => {
            let pid = supervisor.reload(&conf.resolve(supervisor))?;
            println!("Reload signal sent to process {pid}");
            Ok(())
        }
    }
}
