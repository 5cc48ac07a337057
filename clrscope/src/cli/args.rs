//! CLI argument definitions

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::attach::PresenceCheck;

#[derive(Parser)]
#[command(
    name = "clrscope",
    about = "Attach a runtime event sink to a running managed process",
    after_help = "\
EXAMPLES:
    clrscope runtimes                                    List installed runtimes
    clrscope runtimes my-app                             Runtimes loaded in a process
    clrscope version ./MyApp.dll                         Runtime an assembly targets
    clrscope attach --pid 1234 --runtime 8.0.4 --path /opt/clrscope/libclrscope.so
    clrscope replay trace.json --strict                  Replay a recorded trace"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// List installed runtimes, or the runtimes loaded in a process
    Runtimes {
        #[command(flatten)]
        target: TargetArgs,

        /// Runtime install root (defaults to $DOTNET_ROOT, then the usual locations)
        #[arg(long, value_name = "DIR")]
        root: Option<PathBuf>,
    },

    /// Print the runtime version a managed executable was built against
    Version {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Ask the runtime inside a process to load the event sink
    Attach {
        #[command(flatten)]
        target: TargetArgs,

        /// Exact runtime version string (see `clrscope runtimes`)
        #[arg(short, long, value_name = "VERSION")]
        runtime: String,

        /// Absolute path to the event sink library
        #[arg(long, value_name = "FILE")]
        path: PathBuf,

        /// Component id to load (defaults to the clrscope sink)
        #[arg(long, value_name = "GUID")]
        component: Option<String>,

        /// How long the target may take to load the sink, in milliseconds
        #[arg(long, default_value = "10000", value_name = "MS")]
        timeout: u64,

        /// Check that the runtime is loaded in the target before attaching
        #[arg(long, default_value = "warn", value_name = "POLICY")]
        presence: PresenceCheck,

        /// Opaque data handed to the sink on attach
        #[arg(long, value_name = "STR")]
        client_data: Option<String>,

        /// Runtime install root (defaults to $DOTNET_ROOT, then the usual locations)
        #[arg(long, value_name = "DIR")]
        root: Option<PathBuf>,
    },

    /// Replay a recorded event trace through an in-process sink
    Replay {
        #[arg(value_name = "TRACE")]
        trace: PathBuf,

        /// Fail events that break start/finish ordering instead of counting them
        #[arg(long)]
        strict: bool,

        /// Write the sink's log as JSON lines to FILE
        #[arg(long, value_name = "FILE")]
        log_file: Option<PathBuf>,
    },
}

/// Target process, by name or pid
#[derive(ClapArgs)]
pub struct TargetArgs {
    /// Process name (command name or executable basename)
    #[arg(value_name = "PROCESS", conflicts_with = "pid")]
    pub process: Option<String>,

    /// Process ID
    #[arg(short, long)]
    pub pid: Option<u32>,
}
