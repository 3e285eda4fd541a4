use std::ffi::OsString;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "timeslicer",
    version,
    about = "Sampling profiler that records annotated time-slices of an unmodified executable"
)]
pub struct Opt {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Launch a command under the profiler and write the result stream.
    ///
    /// Configuration comes from the COLLECTOR_* environment variables:
    /// COLLECTOR_PERIOD, COLLECTOR_EVENTS, COLLECTOR_PRESETS,
    /// COLLECTOR_RESULT_FILE, COLLECTOR_SOURCE_SCOPE, COLLECTOR_PRELOAD,
    /// COLLECTOR_NOTIFY_START.
    Record(RecordArgs),

    /// List the event names the encoder understands on this machine.
    ListEvents,

    /// List the presets and whether each is usable on this machine.
    ListPresets,
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    /// The command to profile.
    pub command: OsString,

    /// Arguments passed through to the command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<OsString>,
}
