use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "scrat", version, about = "Encrypted, compressed, versioned file backups")]
pub struct Cli {
    /// Path to the configuration file (default: ./scrat.json or $SCRAT_CONFIG)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum KindArg {
    Auto,
    Full,
    Incremental,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum HookPhase {
    Startup,
    Shutdown,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a backup now
    Backup {
        /// Destination id from the registry
        #[arg(long)]
        destination: String,
        #[arg(long, value_enum, default_value = "auto")]
        kind: KindArg,
        /// Restrict to these sources (default: all enabled)
        #[arg(long)]
        source: Vec<String>,
    },

    /// List restorable points on a destination
    List {
        #[arg(long)]
        destination: String,
    },

    /// Restore files as they were at a point in time
    Restore {
        #[arg(long)]
        destination: String,
        /// Backup id, RFC3339 timestamp, or "latest" (default)
        #[arg(long, default_value = "latest")]
        at: String,
        /// Directory to restore into
        #[arg(long)]
        target: PathBuf,
        /// Restrict to these relative paths (files or directories)
        #[arg(long)]
        path: Vec<String>,
    },

    /// Search captured files across completed backups
    Find {
        pattern: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show catalog statistics
    Status,

    /// Round-trip a probe object against a destination
    TestDestination { id: String },

    /// Manage backup sources
    Source {
        #[command(subcommand)]
        command: SourceCmd,
    },

    /// Manage backup destinations
    Destination {
        #[command(subcommand)]
        command: DestinationCmd,
    },

    /// Manage schedules
    Schedule {
        #[command(subcommand)]
        command: ScheduleCmd,
    },

    /// Fire due schedules immediately and run them to completion
    RunDue,

    /// Run schedules bound to an OS lifecycle hook (invoked by the host's
    /// autostart or session glue)
    RunHook {
        #[arg(value_enum)]
        phase: HookPhase,
    },

    /// Run the scheduler in the foreground until interrupted
    Daemon,

    /// Write a starter configuration file
    Config {
        /// Where to write it (default: ./scrat.json)
        dest: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum SourceCmd {
    /// Add or update a source directory
    Add {
        name: String,
        root_path: PathBuf,
        /// Extra exclude patterns beyond the built-ins
        #[arg(long)]
        exclude: Vec<String>,
    },
    Remove { name: String },
    List,
}

#[derive(Subcommand)]
pub enum DestinationCmd {
    /// Add or update a local-directory destination
    AddLocal { id: String, root_path: PathBuf },
    /// Add or update a destination from a JSON definition
    AddJson { json: String },
    Remove { id: String },
    List,
}

#[derive(Subcommand)]
pub enum ScheduleCmd {
    /// Install or update a schedule from a JSON definition
    Install { json: String },
    Remove { id: String },
    List,
}
