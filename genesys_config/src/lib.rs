#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas, device tables and calibration CSV handling for the scanner backend.
//!
//! - `Settings` and sub-structs are deserialized from TOML and validated.
//! - `Database` holds the static model/sensor/motor tables (see [`database`]).
//! - Calibration CSV import/export enforces the exact header row.
use serde::{Deserialize, Serialize};

pub mod database;

pub use database::{
    AsicType, ButtonMap, Database, Exposure, FrontendDef, FrontendKind, FrontendReg, Layout, Model, Motor,
    MotorProfile, MotorSlope, RegisterOverlay, Sensor, SensorProfile, builtin, load_database,
};

/// Calibration CSV schema.
///
/// Expected headers:
/// channel,gain,offset,exposure
///
/// Example:
/// channel,gain,offset,exposure
/// red,130,118,1180
/// green,128,120,1040
/// blue,127,121,900
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct CalibrationRow {
    pub channel: String,
    pub gain: u8,
    pub offset: u8,
    pub exposure: u16,
}

const CALIBRATION_HEADERS: [&str; 4] = ["channel", "gain", "offset", "exposure"];
const CHANNELS: [&str; 3] = ["red", "green", "blue"];

/// Per-channel AFE and LED settings as persisted between runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalibrationValues {
    pub gain: [u8; 3],
    pub offset: [u8; 3],
    pub exposure: [u16; 3],
}

impl CalibrationValues {
    pub fn from_rows(rows: &[CalibrationRow]) -> eyre::Result<Self> {
        if rows.len() != 3 {
            eyre::bail!("calibration requires exactly three rows, got {}", rows.len());
        }
        let mut out = Self::default();
        let mut seen = [false; 3];
        for row in rows {
            let Some(i) = CHANNELS.iter().position(|c| *c == row.channel) else {
                eyre::bail!(
                    "calibration channel must be one of red, green, blue, got '{}'",
                    row.channel
                );
            };
            if seen[i] {
                eyre::bail!("calibration channel '{}' appears twice", row.channel);
            }
            seen[i] = true;
            out.gain[i] = row.gain;
            out.offset[i] = row.offset;
            out.exposure[i] = row.exposure;
        }
        Ok(out)
    }

    pub fn to_rows(&self) -> Vec<CalibrationRow> {
        CHANNELS
            .iter()
            .enumerate()
            .map(|(i, c)| CalibrationRow {
                channel: (*c).to_string(),
                gain: self.gain[i],
                offset: self.offset[i],
                exposure: self.exposure[i],
            })
            .collect()
    }
}

pub fn load_calibration_csv(path: &std::path::Path) -> eyre::Result<CalibrationValues> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open calibration CSV {:?}: {}", path, e))?;

    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let actual: Vec<String> = headers.iter().map(|s| s.to_string()).collect();
    if actual != CALIBRATION_HEADERS {
        eyre::bail!(
            "calibration CSV must have headers 'channel,gain,offset,exposure', got: {}",
            actual.join(",")
        );
    }

    let mut rows = Vec::new();
    for (idx, rec) in rdr.deserialize::<CalibrationRow>().enumerate() {
        match rec {
            Ok(row) => rows.push(row),
            Err(e) => {
                eyre::bail!("invalid CSV row {}: {}", idx + 2, e);
            }
        }
    }

    CalibrationValues::from_rows(&rows)
}

pub fn write_calibration_csv(path: &std::path::Path, values: &CalibrationValues) -> eyre::Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .map_err(|e| eyre::eyre!("create calibration CSV {:?}: {}", path, e))?;
    for row in values.to_rows() {
        wtr.serialize(&row)
            .map_err(|e| eyre::eyre!("write calibration CSV {:?}: {}", path, e))?;
    }
    wtr.flush()
        .map_err(|e| eyre::eyre!("flush calibration CSV {:?}: {}", path, e))?;
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DeviceCfg {
    /// Model id from the device database, e.g. "canon-lide-110".
    pub model: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanModeCfg {
    Lineart,
    Gray,
    #[default]
    Color,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct ScanCfg {
    pub resolution: u32,
    pub mode: ScanModeCfg,
    pub depth: u8,
    /// Scan area in millimetres, relative to the model's origin.
    pub tl_x_mm: f32,
    pub tl_y_mm: f32,
    pub width_mm: f32,
    pub height_mm: f32,
}

impl Default for ScanCfg {
    fn default() -> Self {
        Self {
            resolution: 300,
            mode: ScanModeCfg::Color,
            depth: 8,
            tl_x_mm: 0.0,
            tl_y_mm: 0.0,
            width_mm: 50.0,
            height_mm: 50.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct Timeouts {
    /// Status polls before a motor move is declared failed.
    pub poll_retries: u32,
    /// Sleep between status polls (ms).
    pub poll_interval_ms: u64,
    /// Status polls after requesting a motor stop.
    pub stop_retries: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_retries: 300,
            poll_interval_ms: 100,
            stop_retries: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct CalibrationTuning {
    pub led_max_iterations: u32,
    pub offset_max_passes: u32,
    /// LED loop accepts |avg - target| <= target / divisor.
    pub led_tolerance_divisor: u32,
    /// Cached calibration expires after this many seconds on flatbed models.
    pub cache_expiry_s: u64,
}

impl Default for CalibrationTuning {
    fn default() -> Self {
        Self {
            led_max_iterations: 100,
            offset_max_passes: 32,
            led_tolerance_divisor: 50,
            cache_expiry_s: 30 * 60,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseCfg {
    /// Replace the built-in device tables with this TOML file.
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub device: DeviceCfg,
    pub scan: ScanCfg,
    pub timeouts: Timeouts,
    pub calibration: CalibrationTuning,
    pub logging: Logging,
    pub database: DatabaseCfg,
}

pub fn load_toml(s: &str) -> Result<Settings, toml::de::Error> {
    toml::from_str::<Settings>(s)
}

impl Settings {
    pub fn validate(&self) -> eyre::Result<()> {
        // Scan
        if self.scan.resolution == 0 {
            eyre::bail!("scan.resolution must be > 0");
        }
        if ![1, 8, 16].contains(&self.scan.depth) {
            eyre::bail!("scan.depth must be 1, 8 or 16");
        }
        if self.scan.mode == ScanModeCfg::Lineart && self.scan.depth != 1 {
            eyre::bail!("scan.depth must be 1 for lineart mode");
        }
        if self.scan.tl_x_mm < 0.0 || self.scan.tl_y_mm < 0.0 {
            eyre::bail!("scan.tl_x_mm and scan.tl_y_mm must be >= 0");
        }
        if !(self.scan.width_mm > 0.0 && self.scan.height_mm > 0.0) {
            eyre::bail!("scan.width_mm and scan.height_mm must be > 0");
        }

        // Timeouts
        if self.timeouts.poll_retries == 0 {
            eyre::bail!("timeouts.poll_retries must be >= 1");
        }
        if self.timeouts.poll_interval_ms > 10_000 {
            eyre::bail!("timeouts.poll_interval_ms is unreasonably large (>10s)");
        }
        if self.timeouts.stop_retries == 0 {
            eyre::bail!("timeouts.stop_retries must be >= 1");
        }

        // Calibration
        if self.calibration.led_max_iterations == 0 {
            eyre::bail!("calibration.led_max_iterations must be >= 1");
        }
        if self.calibration.offset_max_passes == 0 {
            eyre::bail!("calibration.offset_max_passes must be >= 1");
        }
        if self.calibration.led_tolerance_divisor == 0 {
            eyre::bail!("calibration.led_tolerance_divisor must be >= 1");
        }

        // Logging
        if let Some(r) = self.logging.rotation.as_deref()
            && !matches!(r, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never, daily, hourly");
        }

        Ok(())
    }

    /// Device tables to use: the configured database file, or the built-in one.
    pub fn load_database(&self) -> eyre::Result<Database> {
        let Some(path) = self.database.path.as_deref() else {
            return builtin();
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("read database {:?}: {}", path, e))?;
        let db = load_database(&text).map_err(|e| eyre::eyre!("parse database {:?}: {}", path, e))?;
        db.validate()?;
        Ok(db)
    }
}
