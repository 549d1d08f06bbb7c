use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use daqstream_core::protocol::{BatchMode, CommsMode, DEFAULT_BAUD_RATE};

#[derive(Parser, Debug)]
#[command(name = "daqstream", version, about = "DaqStream front-end acquisition runner")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Configure the front-end and run a batch acquisition
    Run(RunOpts),
    /// Parse a captured binary dump back into frames
    Parse(ParseOpts),
    /// Print the command catalog as CSV
    Commands,
    /// List available serial ports
    Ports,
}

#[derive(Args, Debug)]
pub struct RunOpts {
    /// Serial port of the front-end (e.g. /dev/ttyUSB0)
    #[arg(long, required_unless_present = "tcp", conflicts_with = "tcp")]
    pub port: Option<String>,

    /// Connect through a serial-to-TCP bridge instead (host:port)
    #[arg(long)]
    pub tcp: Option<String>,

    /// Baud rate to use during acquisition
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    pub baud: u32,

    /// Seconds without data before a read is considered timed out
    #[arg(long, default_value_t = 10.0)]
    pub timeout: f64,

    /// Maximum acquisition time in seconds; zero or negative disables the limit
    #[arg(long, default_value_t = 5.0)]
    pub runtime: f64,

    /// Output file for captured data
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Comms mode for the whole run
    #[arg(long, value_enum, default_value_t = ModeArg::Ascii)]
    pub mode: ModeArg,

    /// Binary streaming strategy
    #[arg(long, value_enum, default_value_t = BatchModeArg::Legacy)]
    pub batch_mode: BatchModeArg,

    /// Setup command script executed before the batch
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// Hits to request; negative requests all currently buffered hits
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub count: i32,

    /// Keep the device waiting for future hits until the count is satisfied
    #[arg(long)]
    pub no_stop: bool,

    /// Ask the device for verbose binary readbacks
    #[arg(long)]
    pub device_verbose: bool,
}

#[derive(Args, Debug)]
pub struct ParseOpts {
    /// Captured batch dump
    pub file: PathBuf,

    /// The dump was captured in sync-delimited mode
    #[arg(long)]
    pub sync: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Ascii,
    Binary,
}

impl From<ModeArg> for CommsMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Ascii => CommsMode::Ascii,
            ModeArg::Binary => CommsMode::Binary,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchModeArg {
    /// Raw dump, no framing parsed
    Bulk,
    /// Sync-byte delimited frames
    Sync,
    /// Bare sample-count prefix (historical firmware)
    Legacy,
}

impl From<BatchModeArg> for BatchMode {
    fn from(mode: BatchModeArg) -> Self {
        match mode {
            BatchModeArg::Bulk => BatchMode::Bulk,
            BatchModeArg::Sync => BatchMode::SyncDelimited,
            BatchModeArg::Legacy => BatchMode::LegacyPrefix,
        }
    }
}
