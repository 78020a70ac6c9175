//! CLI argument definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "skyhost")]
#[command(version, about = "Control the skyhost game server daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Daemon config file; also handed to a daemon started by the CLI
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Daemon socket, overriding the config
    #[arg(short, long, global = true)]
    pub socket: Option<PathBuf>,

    /// Output in JSON format instead of tables
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check daemon health
    Ping,

    /// List servers
    #[command(alias = "ls")]
    List,

    /// Register a server from a JSON definition file
    Create(CreateArgs),

    /// Uninstall a server and remove its files
    Delete {
        /// Server id
        id: String,
    },

    /// Start a server
    Start {
        /// Server id
        id: String,
    },

    /// Ask a server to stop
    Stop {
        /// Server id
        id: String,

        /// Wait until the server exited
        #[arg(short, long)]
        wait: bool,
    },

    /// Kill a server
    Kill {
        /// Server id
        id: String,
    },

    /// Run a server's install steps
    Install {
        /// Server id
        id: String,
    },

    /// Show CPU and memory usage of a running server
    Stats {
        /// Server id
        id: String,
    },

    /// Show whether a server runs or installs
    Status {
        /// Server id
        id: String,
    },

    /// Print a server's console output
    Console(ConsoleArgs),

    /// Send a line to a server's console
    Send {
        /// Server id
        id: String,

        /// Command line to send
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Show a server's variables
    Data {
        /// Server id
        id: String,
    },

    /// Set server variables
    Set(SetArgs),

    /// Back up a server
    Backup {
        /// Server id
        id: String,
    },

    /// List a server's backups
    Backups {
        /// Server id
        id: String,
    },

    /// Replace a server's files with a backup
    Restore {
        /// Server id
        id: String,

        /// Backup file name, as listed by `backups`
        file: String,
    },

    /// Manage scheduled tasks
    Task(TaskArgs),

    /// Stop every server and the daemon
    Shutdown,
}

#[derive(Args)]
pub struct CreateArgs {
    /// Path to the server definition (JSON)
    pub file: PathBuf,

    /// Server id, overriding the one in the file
    #[arg(long)]
    pub id: Option<String>,

    /// Install right after creating
    #[arg(short, long)]
    pub install: bool,
}

#[derive(Args)]
pub struct ConsoleArgs {
    /// Server id
    pub id: String,

    /// Keep printing new output
    #[arg(short, long)]
    pub follow: bool,

    /// Poll interval in milliseconds when following
    #[arg(long, default_value = "500")]
    pub interval: u64,
}

#[derive(Args)]
pub struct SetArgs {
    /// Server id
    pub id: String,

    /// Assignments as key=value; values that parse as JSON are sent as JSON
    #[arg(required = true)]
    pub values: Vec<String>,

    /// Change any variable and allow new ones
    #[arg(long)]
    pub admin: bool,
}

#[derive(Args)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub command: TaskCommand,
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// List a server's tasks
    List {
        /// Server id
        id: String,
    },

    /// Add or replace a task from a JSON file
    Add {
        /// Server id
        id: String,

        /// Task name
        name: String,

        /// Path to the task definition (JSON)
        file: PathBuf,
    },

    /// Remove a task
    Remove {
        /// Server id
        id: String,

        /// Task name
        name: String,
    },

    /// Run a task now
    Run {
        /// Server id
        id: String,

        /// Task name
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_send_keeps_the_whole_line() {
        let cli = Cli::parse_from(["skyhost", "send", "lobby", "say", "hello", "--there"]);
        match cli.command {
            Commands::Send { id, command } => {
                assert_eq!(id, "lobby");
                assert_eq!(command, vec!["say", "hello", "--there"]);
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_parse_task_add() {
        let cli = Cli::parse_from(["skyhost", "--json", "task", "add", "lobby", "restart", "t.json"]);
        assert!(cli.json);
        match cli.command {
            Commands::Task(TaskArgs {
                command: TaskCommand::Add { id, name, file },
            }) => {
                assert_eq!(id, "lobby");
                assert_eq!(name, "restart");
                assert_eq!(file, PathBuf::from("t.json"));
            }
            _ => panic!("expected task add"),
        }
    }
}
