use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "appforge")]
#[command(about = "Install, run and supervise script-defined AI applications")]
#[command(version)]
pub struct Cli {
    /// Managed root directory (defaults to $APPFORGE_ROOT, then ~/appforge)
    #[arg(short, long, env = "APPFORGE_ROOT")]
    pub root: Option<PathBuf>,

    /// Only print errors
    #[arg(short, long)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install an application from a git URL or a local directory
    Install {
        /// Application name
        name: String,

        /// Git URL or directory holding the install/start scripts
        source: String,
    },
    /// Run an installed application in the foreground (Ctrl-C stops it)
    Run {
        /// Application name
        name: String,
    },
    /// Stop a running application
    Stop {
        /// Application name
        name: String,
    },
    /// Remove an application, its environment and its files
    Uninstall {
        /// Application name
        name: String,
    },
    /// Show registered applications
    Status {
        /// Only this application
        name: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print running applications (PID and ports) as JSON
    Facts,
    /// Show captured output of an application's daemon
    Logs {
        /// Application name
        name: String,

        /// Number of lines to show from the end
        #[arg(short = 'n', long)]
        tail: Option<usize>,

        /// Keep printing new output until Ctrl+C
        #[arg(short, long)]
        follow: bool,
    },
    /// Execute a script document against a scratch context
    Exec {
        /// Script file (JSON, YAML or object literal)
        script: PathBuf,
    },
}
