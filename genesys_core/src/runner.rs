//! End-to-end scan: park, calibrate, upload shading, acquire, park again.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;
use genesys_config::CalibrationValues;

use crate::builder::Scanner;
use crate::calibration::{self, Frame};
use crate::command_set::CommandSet;
use crate::device::{CalibrationCache, Device};
use crate::error::{GenesysError, Result};
use crate::frontend::FrontendAction;
use crate::register::RegisterSet;
use crate::session::ScanSession;

/// White level the shading coefficients aim for, 16-bit scale.
const SHADING_TARGET: u32 = 0xfa00;

/// Steps of a scan, in the order `run_scan` performs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Home,
    Offset,
    CoarseGain,
    Led,
    Shading,
    Scan,
    Park,
}

/// Progress notifications sent while a scan runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Stage(Stage),
    /// Calibration was taken from the cache instead of being measured.
    CalibrationReused,
    Calibrated(CalibrationValues),
    Data { offset: u64, bytes: Vec<u8> },
    Finished { bytes_read: u64 },
}

/// What a completed scan produced.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub session: ScanSession,
    pub calibration: CalibrationValues,
    pub reused_calibration: bool,
    pub bytes_read: u64,
}

fn notify(events: Option<&Sender<ScanEvent>>, event: ScanEvent) {
    if let Some(tx) = events {
        // a dropped receiver only means nobody is listening
        let _ = tx.send(event);
    }
}

fn check_cancel(dev: &mut Device, cs: &dyn CommandSet, cancel: &AtomicBool) -> Result<()> {
    if !cancel.load(Ordering::Relaxed) {
        return Ok(());
    }
    tracing::info!("scan cancelled");
    if let Err(e) = cs.stop_action(dev) {
        tracing::warn!(error = %e, "stop after cancel");
    }
    Err(GenesysError::Cancelled.into())
}

fn values_of(dev: &Device) -> CalibrationValues {
    CalibrationValues {
        gain: dev.frontend.gains(),
        offset: dev.frontend.offsets(),
        exposure: dev.exposure,
    }
}

/// Reuse a compatible cached calibration; true when one was applied.
fn apply_cached(dev: &mut Device, cs: &dyn CommandSet) -> Result<bool> {
    let entries = dev.calibration_cache.clone();
    for entry in &entries {
        if cs.is_compatible_calibration(dev, entry, false)? {
            dev.frontend = entry.frontend.clone();
            dev.exposure = entry.exposure;
            cs.set_fe(dev, FrontendAction::Set)?;
            tracing::debug!(exposure = ?entry.exposure, "calibration cache hit");
            return Ok(true);
        }
    }
    Ok(false)
}

/// Store the current calibration, replacing entries it supersedes.
fn store_calibration(dev: &mut Device, cs: &dyn CommandSet) -> Result<()> {
    let setup = cs.calculate_current_setup(dev)?;
    let entries = std::mem::take(&mut dev.calibration_cache);
    let mut kept = Vec::with_capacity(entries.len() + 1);
    for entry in entries {
        if !cs.is_compatible_calibration(dev, &entry, true)? {
            kept.push(entry);
        }
    }
    kept.push(CalibrationCache {
        setup,
        frontend: dev.frontend.clone(),
        exposure: dev.exposure,
        created: dev.now(),
    });
    dev.calibration_cache = kept;
    Ok(())
}

fn calibrate(
    dev: &mut Device,
    cs: &dyn CommandSet,
    cancel: &AtomicBool,
    events: Option<&Sender<ScanEvent>>,
) -> Result<()> {
    let mut regs = RegisterSet::new();
    notify(events, ScanEvent::Stage(Stage::Offset));
    cs.offset_calibration(dev, &mut regs)?;
    check_cancel(dev, cs, cancel)?;

    notify(events, ScanEvent::Stage(Stage::CoarseGain));
    let dpi = dev.settings.xres;
    cs.coarse_gain_calibration(dev, &mut regs, dpi)?;
    check_cancel(dev, cs, cancel)?;

    notify(events, ScanEvent::Stage(Stage::Led));
    cs.led_calibration(dev, &mut regs)?;
    check_cancel(dev, cs, cancel)?;

    store_calibration(dev, cs)
}

/// Park the head and measure offsets, gains and LED exposure for the current
/// settings. The result is cached for later scans.
pub fn calibrate_scanner(scanner: &mut Scanner, cancel: &AtomicBool) -> Result<CalibrationValues> {
    let (dev, cs) = scanner.parts();
    cs.slow_back_home(dev, true)?;
    check_cancel(dev, cs, cancel)?;
    if dev.tables.model.no_calibration {
        return Err(GenesysError::NotSupported {
            operation: "calibration",
            asic: cs.asic(),
        }
        .into());
    }
    calibrate(dev, cs, cancel, None)?;
    Ok(values_of(dev))
}

/// Cache the frontend and exposure currently programmed, e.g. after
/// [`Scanner::apply_calibration`], so the next scan with the same setup
/// skips calibration.
pub fn remember_calibration(scanner: &mut Scanner) -> Result<()> {
    let (dev, cs) = scanner.parts();
    store_calibration(dev, cs)
}

/// Scan the white strip and upload the coefficients it yields.
fn shading(dev: &mut Device, cs: &dyn CommandSet) -> Result<()> {
    let mut regs = RegisterSet::new();
    let session = cs.init_regs_for_shading(dev, &mut regs)?;
    let size = usize::try_from(session.total_bytes_to_read)
        .map_err(|_| GenesysError::invalid("shading scan does not fit in memory"))?;
    let data = calibration::scan_frame(dev, cs, &mut regs, size)?;
    let frame = Frame {
        data: &data,
        pixels: session.output_pixels as usize,
        channels: session.params.channels as usize,
        depth: session.params.depth,
        planar: dev.tables.model.is_cis,
    };
    let coefficients = calibration::shading_coefficients(&frame, SHADING_TARGET);
    cs.send_shading_data(dev, &coefficients)?;
    cs.slow_back_home(dev, true)
}

fn acquire(
    dev: &mut Device,
    cs: &dyn CommandSet,
    cancel: &AtomicBool,
    events: Option<&Sender<ScanEvent>>,
    chunk: u64,
) -> Result<u64> {
    let mut regs = dev.reg.clone();
    dev.write_registers(&regs)?;
    cs.begin_scan(dev, &mut regs, true)?;

    let sheetfed = dev.tables.model.is_sheetfed;
    while dev.total_bytes_read < dev.total_bytes_to_read {
        check_cancel(dev, cs, cancel)?;
        let offset = dev.total_bytes_read;
        let size = (dev.total_bytes_to_read - offset).min(chunk);
        let bytes = dev.read_data_from_scanner(cs.layout(), size as usize)?;
        tracing::trace!(offset, size, "scan data");
        notify(events, ScanEvent::Data { offset, bytes });
        if sheetfed && cs.detect_document_end(dev)? {
            tracing::debug!(total = dev.total_bytes_to_read, "document end");
        }
    }
    cs.end_scan(dev, &mut regs, true)?;
    Ok(dev.total_bytes_read)
}

/// Run a complete scan with the scanner's current settings.
///
/// Calibration is reused from the device cache when a compatible entry
/// exists, skipped for models without calibration and measured otherwise.
/// `cancel` is checked between calibration steps and between reads; a
/// cancelled scan stops the motor and fails with [`GenesysError::Cancelled`].
pub fn run_scan(
    scanner: &mut Scanner,
    cancel: &AtomicBool,
    events: Option<&Sender<ScanEvent>>,
) -> Result<ScanReport> {
    let (dev, cs) = scanner.parts();
    let rules = cs.session_rules();

    notify(events, ScanEvent::Stage(Stage::Home));
    cs.slow_back_home(dev, true)?;
    check_cancel(dev, cs, cancel)?;

    let no_calibration = dev.tables.model.no_calibration;
    let reused = !no_calibration && apply_cached(dev, cs)?;
    if reused {
        notify(events, ScanEvent::CalibrationReused);
    } else if !no_calibration {
        calibrate(dev, cs, cancel, events)?;
    }
    let values = values_of(dev);
    notify(events, ScanEvent::Calibrated(values));

    if !no_calibration {
        notify(events, ScanEvent::Stage(Stage::Shading));
        shading(dev, cs)?;
        check_cancel(dev, cs, cancel)?;
    }

    notify(events, ScanEvent::Stage(Stage::Scan));
    let session = cs.init_regs_for_scan(dev)?;
    tracing::info!(
        xres = session.output_resolution,
        pixels = session.output_pixels,
        lines = session.output_line_count,
        bytes = session.total_bytes_to_read,
        "scan start"
    );
    let bytes_read = acquire(dev, cs, cancel, events, rules.bulk_max.max(1))?;

    notify(events, ScanEvent::Stage(Stage::Park));
    if dev.tables.model.is_sheetfed {
        cs.eject_document(dev)?;
    } else {
        cs.slow_back_home(dev, true)?;
    }
    notify(events, ScanEvent::Finished { bytes_read });
    tracing::info!(bytes_read, "scan complete");

    Ok(ScanReport {
        session,
        calibration: values,
        reused_calibration: reused,
        bytes_read,
    })
}
