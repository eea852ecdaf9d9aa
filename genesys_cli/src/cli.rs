//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "genesys", version, about = "Genesys GLxxx scanner control (simulated ASIC)")]
pub struct Cli {
    /// Path to settings TOML; built-in defaults when omitted
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Scanner model id (overrides [device] model)
    #[arg(long, value_name = "ID")]
    pub model: Option<String>,

    /// Print results and errors as JSON lines instead of text
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Mode {
    Lineart,
    Gray,
    Color,
}

/// Overrides of the `[scan]` settings section.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ScanArgs {
    /// Resolution in dpi
    #[arg(long, value_name = "DPI")]
    pub resolution: Option<u32>,
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,
    /// Bits per sample (1, 8 or 16)
    #[arg(long)]
    pub depth: Option<u8>,
    #[arg(long, value_name = "MM")]
    pub width_mm: Option<f32>,
    #[arg(long, value_name = "MM")]
    pub height_mm: Option<f32>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the scanner models in the device database
    Models,
    /// Show the scan geometry the settings produce
    Session {
        #[command(flatten)]
        scan: ScanArgs,
    },
    /// Generate a motor acceleration table for the model's motor
    Slope {
        /// Exposure (line period) in pixel clocks
        #[arg(long, default_value_t = 4608)]
        exposure: u32,
        /// Vertical resolution in dpi
        #[arg(long, default_value_t = 300)]
        yres: u32,
        /// 0 = full step, 1 = half, 2 = quarter
        #[arg(long, default_value_t = 0)]
        step_type: u8,
        /// Print the whole table instead of the ramp
        #[arg(long, action = ArgAction::SetTrue)]
        full: bool,
    },
    /// Measure offsets, gains and LED exposure
    Calibrate {
        #[command(flatten)]
        scan: ScanArgs,
        /// Write the result as calibration CSV
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Run a complete scan
    Scan {
        #[command(flatten)]
        scan: ScanArgs,
        /// Calibration CSV to use instead of measuring
        #[arg(long, value_name = "FILE")]
        calibration: Option<PathBuf>,
        /// Write the raw image data to this file
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Park the scan head
    Home,
    /// Boot the scanner and read its buttons
    SelfCheck,
}
