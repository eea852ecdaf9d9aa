#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod cli;
mod commands;
mod error_fmt;
mod logging;

use clap::Parser;

use crate::cli::{Cli, Commands, JSON_MODE};
use crate::commands::Context;
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};

fn run(cli: Cli) -> eyre::Result<()> {
    let settings = commands::load_settings(cli.config.as_deref())?;
    let level = settings
        .logging
        .level
        .clone()
        .filter(|_| cli.log_level == "warn")
        .unwrap_or_else(|| cli.log_level.clone());
    logging::init(cli.json, &level, &settings.logging)?;

    let ctx = Context::new(settings, cli.model, cli.json)?;
    tracing::debug!(model = %ctx.model, "selected model");
    match &cli.cmd {
        Commands::Models => commands::models(&ctx),
        Commands::Session { scan } => commands::session(&ctx, scan),
        Commands::Slope {
            exposure,
            yres,
            step_type,
            full,
        } => commands::slope(&ctx, *exposure, *yres, *step_type, *full),
        Commands::Calibrate { scan, out } => commands::calibrate(&ctx, scan, out.as_deref()),
        Commands::Scan {
            scan,
            calibration,
            out,
        } => commands::scan(&ctx, scan, calibration.as_deref(), out.as_deref()),
        Commands::Home => commands::home(&ctx),
        Commands::SelfCheck => commands::self_check(&ctx),
    }
}

fn main() {
    if let Err(e) = color_eyre::install() {
        eprintln!("warning: cannot install error report handler: {e}");
    }
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);

    if let Err(err) = run(cli) {
        tracing::error!(error = %err, "command failed");
        if JSON_MODE.get().copied().unwrap_or(false) {
            eprintln!("{}", format_error_json(&err));
        } else {
            eprintln!("{}", humanize(&err));
        }
        std::process::exit(exit_code_for_error(&err));
    }
}
