//! Subcommand implementations: settings mapping, scanner assembly, output.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::WrapErr;
use genesys_config::{AsicType, Database, ScanCfg, ScanModeCfg, Settings};
use genesys_core::slope::{self, SLOPE_TABLE_SIZE};
use genesys_core::{
    ScanEvent, ScanFlags, ScanReport, ScanSessionParams, ScanSettings, Scanner, runner,
};
use genesys_hardware::{SimProfile, SimulatedAsic};
use serde_json::json;

use crate::cli::{Mode, ScanArgs};

/// Model used when neither `--model` nor `[device] model` names one.
const DEFAULT_MODEL: &str = "canon-lide-110";

/// Everything a command needs besides its own arguments.
pub struct Context {
    pub settings: Settings,
    pub db: Database,
    pub model: String,
    pub json: bool,
}

pub fn load_settings(path: Option<&Path>) -> eyre::Result<Settings> {
    let Some(path) = path else {
        return Ok(Settings::default());
    };
    let text = std::fs::read_to_string(path).wrap_err_with(|| format!("read settings {path:?}"))?;
    let settings: Settings =
        toml::from_str(&text).map_err(|e| eyre::eyre!("parse settings {:?}: {}", path, e))?;
    settings.validate()?;
    Ok(settings)
}

impl Context {
    pub fn new(settings: Settings, model: Option<String>, json: bool) -> eyre::Result<Self> {
        let db = settings.load_database()?;
        let model = model
            .or_else(|| settings.device.model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Ok(Self {
            settings,
            db,
            model,
            json,
        })
    }

    fn scan_cfg(&self, args: &ScanArgs) -> eyre::Result<ScanCfg> {
        let mut cfg = self.settings.scan;
        if let Some(r) = args.resolution {
            cfg.resolution = r;
        }
        if let Some(m) = args.mode {
            cfg.mode = match m {
                Mode::Lineart => ScanModeCfg::Lineart,
                Mode::Gray => ScanModeCfg::Gray,
                Mode::Color => ScanModeCfg::Color,
            };
            if m == Mode::Lineart && args.depth.is_none() {
                cfg.depth = 1;
            }
        }
        if let Some(d) = args.depth {
            cfg.depth = d;
        }
        if let Some(w) = args.width_mm {
            cfg.width_mm = w;
        }
        if let Some(h) = args.height_mm {
            cfg.height_mm = h;
        }
        if cfg.resolution == 0 || !(cfg.width_mm > 0.0 && cfg.height_mm > 0.0) {
            eyre::bail!("resolution and scan area must be > 0");
        }
        Ok(cfg)
    }

    /// A scanner for the selected model wired to a simulated ASIC.
    fn scanner(&self, scan: Option<&ScanCfg>) -> eyre::Result<(Scanner, SimulatedAsic)> {
        let asic = self
            .db
            .model(&self.model)
            .map(|m| m.asic)
            .ok_or_else(|| genesys_core::BuildError::UnknownModel(self.model.clone()))?;
        let sim = SimulatedAsic::new(match asic {
            AsicType::Gl124 => SimProfile::gl124(),
            AsicType::Gl841 => SimProfile::gl841(),
            AsicType::Gl847 => SimProfile::gl847(),
        });
        let mut builder = Scanner::builder()
            .with_transport(sim.clone())
            .with_model(self.model.clone())
            .with_database(self.db.clone())
            .with_settings(&self.settings);
        if let Some(cfg) = scan {
            builder = builder.with_scan_settings(ScanSettings::from_cfg(cfg));
        }
        Ok((builder.build()?, sim))
    }

    fn emit(&self, value: serde_json::Value, text: impl FnOnce() -> String) {
        if self.json {
            println!("{value}");
        } else {
            println!("{}", text());
        }
    }
}

pub fn models(ctx: &Context) -> eyre::Result<()> {
    for m in &ctx.db.models {
        ctx.emit(
            json!({
                "id": m.id,
                "name": format!("{} {}", m.vendor, m.name),
                "asic": m.asic.name(),
                "xdpi": m.xdpi_values,
                "sheetfed": m.is_sheetfed,
            }),
            || {
                let dpi: Vec<String> = m.xdpi_values.iter().map(ToString::to_string).collect();
                format!(
                    "{:<16} {:<6} {} {} ({} dpi)",
                    m.id,
                    m.asic.name(),
                    m.vendor,
                    m.name,
                    dpi.join("/")
                )
            },
        );
    }
    Ok(())
}

pub fn session(ctx: &Context, args: &ScanArgs) -> eyre::Result<()> {
    let cfg = ctx.scan_cfg(args)?;
    let (scanner, _sim) = ctx.scanner(Some(&cfg))?;
    let s = scanner.device().settings;
    let params = ScanSessionParams {
        xres: s.xres,
        yres: s.yres,
        startx: 0,
        starty: 0,
        pixels: s.pixels,
        lines: s.lines,
        depth: s.depth,
        channels: s.channels(),
        scan_mode: s.scan_mode,
        color_filter: s.color_filter,
        flags: ScanFlags::empty(),
    };
    let session = scanner.command_set().compute_session(scanner.device(), &params)?;
    ctx.emit(
        json!({
            "model": ctx.model,
            "optical_resolution": session.optical_resolution,
            "output_resolution": session.output_resolution,
            "optical_pixels": session.optical_pixels,
            "output_pixels": session.output_pixels,
            "output_line_count": session.output_line_count,
            "output_line_bytes": session.output_line_bytes,
            "ccd_size_divisor": session.ccd_size_divisor,
            "hwdpi": session.hwdpi,
            "segments": session.segment_count,
            "max_shift": session.max_shift(),
            "total_bytes": session.total_bytes_to_read,
            "buffers": {
                "read": session.buffers.read,
                "lines": session.buffers.lines,
                "shrink": session.buffers.shrink,
                "out": session.buffers.out,
            },
        }),
        || {
            format!(
                "{} at {} dpi (optical {} dpi, hw {} dpi, divisor {})\n\
                 pixels: {} optical / {} output, lines: {}, line bytes: {}\n\
                 total bytes: {}, read buffer: {}, max shift: {}",
                ctx.model,
                session.output_resolution,
                session.optical_resolution,
                session.hwdpi,
                session.ccd_size_divisor,
                session.optical_pixels,
                session.output_pixels,
                session.output_line_count,
                session.output_line_bytes,
                session.total_bytes_to_read,
                session.buffers.read,
                session.max_shift(),
            )
        },
    );
    Ok(())
}

pub fn slope(ctx: &Context, exposure: u32, yres: u32, step_type: u8, full: bool) -> eyre::Result<()> {
    let model = ctx
        .db
        .model(&ctx.model)
        .ok_or_else(|| genesys_core::BuildError::UnknownModel(ctx.model.clone()))?;
    let motor = ctx.db.motor(&model.motor).ok_or_else(|| {
        genesys_core::BuildError::UnknownReference {
            kind: "motor",
            id: model.motor.clone(),
        }
    })?;
    let table = slope::create_slope_table3(
        motor,
        SLOPE_TABLE_SIZE,
        SLOPE_TABLE_SIZE as u32 - 1,
        step_type,
        exposure,
        yres,
    )?;
    let shown = if full {
        &table.table[..]
    } else {
        &table.table[..table.used_steps as usize]
    };
    ctx.emit(
        json!({
            "motor": motor.id,
            "used_steps": table.used_steps,
            "final_exposure": table.final_exposure,
            "time": table.time,
            "table": shown,
        }),
        || {
            let values: Vec<String> = shown.iter().map(ToString::to_string).collect();
            format!(
                "motor {}: {} steps, final exposure {}, ramp time {}\n{}",
                motor.id,
                table.used_steps,
                table.final_exposure,
                table.time,
                values.join(" ")
            )
        },
    );
    Ok(())
}

fn cancel_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    if let Err(e) = ctrlc::set_handler(move || handler_flag.store(true, Ordering::Relaxed)) {
        tracing::warn!(error = %e, "cannot install Ctrl-C handler");
    }
    flag
}

pub fn calibrate(ctx: &Context, args: &ScanArgs, out: Option<&Path>) -> eyre::Result<()> {
    let cfg = ctx.scan_cfg(args)?;
    let (mut scanner, _sim) = ctx.scanner(Some(&cfg))?;
    scanner.init()?;
    let cancel = cancel_flag();
    let values = runner::calibrate_scanner(&mut scanner, &cancel)?;
    if let Some(path) = out {
        genesys_config::write_calibration_csv(path, &values)?;
        tracing::info!(path = %path.display(), "calibration written");
    }
    ctx.emit(
        json!({
            "gain": values.gain,
            "offset": values.offset,
            "exposure": values.exposure,
        }),
        || {
            format!(
                "gain {:?}, offset {:?}, exposure {:?}",
                values.gain, values.offset, values.exposure
            )
        },
    );
    Ok(())
}

/// Drain scan events on a worker thread, writing image data to `out`.
fn spawn_writer(
    rx: crossbeam_channel::Receiver<ScanEvent>,
    out: Option<File>,
) -> std::thread::JoinHandle<std::io::Result<u64>> {
    std::thread::spawn(move || {
        let mut out = out.map(BufWriter::new);
        let mut written = 0u64;
        for event in rx {
            match event {
                ScanEvent::Stage(stage) => tracing::info!(?stage, "scan stage"),
                ScanEvent::CalibrationReused => tracing::info!("using cached calibration"),
                ScanEvent::Calibrated(values) => tracing::debug!(?values, "calibrated"),
                ScanEvent::Data { bytes, .. } => {
                    if let Some(w) = out.as_mut() {
                        w.write_all(&bytes)?;
                    }
                    written += bytes.len() as u64;
                }
                ScanEvent::Finished { bytes_read } => tracing::debug!(bytes_read, "scan finished"),
            }
        }
        if let Some(mut w) = out {
            w.flush()?;
        }
        Ok(written)
    })
}

pub fn scan(ctx: &Context, args: &ScanArgs, calibration: Option<&Path>, out: Option<&Path>) -> eyre::Result<()> {
    let cfg = ctx.scan_cfg(args)?;
    let (mut scanner, _sim) = ctx.scanner(Some(&cfg))?;
    scanner.init()?;
    if let Some(path) = calibration {
        let values = genesys_config::load_calibration_csv(path)?;
        scanner.apply_calibration(&values)?;
        runner::remember_calibration(&mut scanner)?;
    }

    let file = match out {
        Some(path) => Some(File::create(path).wrap_err_with(|| format!("create {path:?}"))?),
        None => None,
    };
    let (tx, rx) = crossbeam_channel::unbounded();
    let writer = spawn_writer(rx, file);
    let cancel = cancel_flag();
    let result = runner::run_scan(&mut scanner, &cancel, Some(&tx));
    drop(tx);
    let written = writer
        .join()
        .map_err(|_| eyre::eyre!("scan writer thread panicked"))?
        .wrap_err("write scan data")?;
    let report: ScanReport = result?;

    let s = &report.session;
    ctx.emit(
        json!({
            "model": ctx.model,
            "bytes_read": report.bytes_read,
            "bytes_written": written,
            "pixels": s.params.pixels,
            "lines": s.params.lines,
            "channels": s.params.channels,
            "depth": s.params.depth,
            "resolution": s.output_resolution,
            "read_buffer": s.buffers.read,
            "reused_calibration": report.reused_calibration,
            "calibration": {
                "gain": report.calibration.gain,
                "offset": report.calibration.offset,
                "exposure": report.calibration.exposure,
            },
        }),
        || {
            format!(
                "scan complete: {} bytes ({} x {} pixels, {} channel(s), {} bit) at {} dpi, read buffer {} bytes",
                report.bytes_read,
                s.params.pixels,
                s.params.lines,
                s.params.channels,
                s.params.depth,
                s.output_resolution,
                s.buffers.read,
            )
        },
    );
    Ok(())
}

pub fn home(ctx: &Context) -> eyre::Result<()> {
    let (mut scanner, sim) = ctx.scanner(None)?;
    scanner.init()?;
    scanner.home(true)?;
    let parked = sim.is_at_home();
    ctx.emit(json!({ "model": ctx.model, "parked": parked }), || {
        format!("{}: head parked", ctx.model)
    });
    Ok(())
}

pub fn self_check(ctx: &Context) -> eyre::Result<()> {
    let (mut scanner, _sim) = ctx.scanner(None)?;
    scanner.init()?;
    let sensors = scanner.hardware_sensors()?;
    let asic = scanner.command_set().name();
    ctx.emit(
        json!({
            "model": ctx.model,
            "asic": asic,
            "ok": true,
            "buttons": {
                "scan": sensors.scan,
                "file": sensors.file,
                "email": sensors.email,
                "copy": sensors.copy,
                "extra": sensors.extra,
            },
            "paper_present": sensors.paper_present,
        }),
        || format!("{} ({asic}): ok", ctx.model),
    );
    Ok(())
}
