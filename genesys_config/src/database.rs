//! Device database: models, sensors, motors and their timing tables.
//!
//! The tables are plain data. They are loaded once, validated, and then handed
//! to the core as an immutable value; nothing here is mutated after load.

use serde::Deserialize;

/// ASIC generation driving a model.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AsicType {
    Gl124,
    Gl841,
    Gl847,
}

impl AsicType {
    pub fn name(self) -> &'static str {
        match self {
            AsicType::Gl124 => "gl124",
            AsicType::Gl841 => "gl841",
            AsicType::Gl847 => "gl847",
        }
    }
}

impl std::fmt::Display for AsicType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-channel exposure in pixel-clock units.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct Exposure {
    pub red: u16,
    pub green: u16,
    pub blue: u16,
}

impl Exposure {
    pub fn as_array(self) -> [u16; 3] {
        [self.red, self.green, self.blue]
    }

    pub fn from_array(v: [u16; 3]) -> Self {
        Self {
            red: v[0],
            green: v[1],
            blue: v[2],
        }
    }

    pub fn is_zero(self) -> bool {
        self.red == 0 && self.green == 0 && self.blue == 0
    }
}

/// A fixed register value applied on top of a register set.
///
/// `width` is the number of consecutive byte registers the value spans
/// (1, 2 or 3); multi-byte values are stored most significant byte first.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOverlay {
    pub address: u16,
    pub value: u32,
    #[serde(default = "default_width")]
    pub width: u8,
}

fn default_width() -> u8 {
    1
}

fn default_one() -> u32 {
    1
}

fn default_hwdpi() -> Vec<u32> {
    vec![600, 1200, 2400, 4800]
}

/// Static sensor description.
#[derive(Debug, Deserialize, Clone)]
pub struct Sensor {
    pub id: String,
    pub optical_res: u32,
    /// How many CCD pixels are binned per output pixel in half-CCD mode.
    #[serde(default = "default_one")]
    pub ccd_size_divisor: u32,
    #[serde(default = "default_one")]
    pub ccd_pixels_per_system_pixel: u32,
    pub black_pixels: u32,
    pub dummy_pixel: u32,
    pub ccd_start_xoffset: u32,
    pub sensor_pixels: u32,
    /// White target for gain calibration, 8-bit scale.
    pub gain_white_ref: u32,
    pub exposure: Exposure,
    #[serde(default)]
    pub exposure_lperiod: u32,
    /// Register overlays applied by sensor setup (timing generator etc).
    #[serde(default)]
    pub custom_regs: Vec<RegisterOverlay>,
    /// Hardware DPI values the timing generator supports, ascending.
    #[serde(default = "default_hwdpi")]
    pub hwdpi: Vec<u32>,
}

impl Sensor {
    /// Smallest supported hardware DPI at or above `xres`, capped by the optical resolution.
    pub fn register_hwdpi(&self, xres: u32) -> u32 {
        let capped = xres.min(self.optical_res);
        self.hwdpi
            .iter()
            .copied()
            .find(|&d| d >= capped)
            .unwrap_or(self.optical_res)
    }
}

/// Timing profile for a sensor at one hardware DPI / CCD divisor pair.
#[derive(Debug, Deserialize, Clone)]
pub struct SensorProfile {
    pub sensor: String,
    pub dpi: u32,
    #[serde(default = "default_one")]
    pub ccd_size_divisor: u32,
    /// Line period used as scan exposure time.
    pub exposure_lperiod: u32,
    /// Default LED exposure per channel.
    pub exposure: Exposure,
    /// Physical segment read-out order; empty means a single segment.
    #[serde(default)]
    pub segment_order: Vec<usize>,
    #[serde(default)]
    pub registers: Vec<RegisterOverlay>,
}

impl SensorProfile {
    pub fn segment_count(&self) -> usize {
        self.segment_order.len().max(1)
    }
}

/// Acceleration parameters for one step type.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct MotorSlope {
    /// Interval of the first step (slowest speed), in pixel-clock units.
    pub maximum_start_speed: u32,
    /// Shortest interval the motor can sustain.
    pub maximum_speed: u32,
    pub minimum_steps: u32,
    /// Ramp shape exponent.
    pub g: f32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Motor {
    pub id: String,
    pub base_ydpi: u32,
    pub optical_ydpi: u32,
    pub max_step_type: u8,
    /// One entry per step type, index 0 = full step.
    pub slopes: Vec<MotorSlope>,
}

/// Base step-interval table for a motor at a given exposure.
#[derive(Debug, Deserialize, Clone)]
pub struct MotorProfile {
    pub motor: String,
    pub exposure: u32,
    pub step_type: u8,
    /// Full-step intervals, slowest first.
    pub table: Vec<u32>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrontendKind {
    Wolfson,
    AnalogDevices,
    Ti,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct FrontendReg {
    pub address: u8,
    pub value: u16,
}

/// Boot values of an analog frontend.
#[derive(Debug, Deserialize, Clone)]
pub struct FrontendDef {
    pub id: String,
    pub kind: FrontendKind,
    #[serde(default)]
    pub regs: Vec<FrontendReg>,
    #[serde(default)]
    pub reg2: [u8; 3],
    /// Value written to AFE register 0 to close a TI write sequence.
    #[serde(default)]
    pub close_value: Option<u16>,
}

/// Panel button wiring: bits of `address` that read low while a button is held.
///
/// A zero mask means the model has no such button.
#[derive(Debug, Deserialize, Clone, Copy, Default)]
pub struct ButtonMap {
    pub address: u16,
    #[serde(default)]
    pub scan: u8,
    #[serde(default)]
    pub file: u8,
    #[serde(default)]
    pub email: u8,
    #[serde(default)]
    pub copy: u8,
    #[serde(default)]
    pub extra: u8,
}

/// Register overlays applied at boot (GPIO or memory layout).
#[derive(Debug, Deserialize, Clone)]
pub struct Layout {
    pub id: String,
    pub registers: Vec<RegisterOverlay>,
}

/// One scanner model.
#[derive(Debug, Deserialize, Clone)]
pub struct Model {
    pub id: String,
    pub vendor: String,
    pub name: String,
    pub asic: AsicType,
    pub sensor: String,
    pub motor: String,
    pub frontend: String,
    #[serde(default)]
    pub gpio: Option<String>,
    #[serde(default)]
    pub memory_layout: Option<String>,
    #[serde(default)]
    pub buttons: Option<ButtonMap>,
    pub xdpi_values: Vec<u32>,
    pub ydpi_values: Vec<u32>,
    pub x_offset_mm: f32,
    pub y_offset_mm: f32,
    #[serde(default)]
    pub y_offset_calib_white_mm: f32,
    pub x_size_mm: f32,
    pub y_size_mm: f32,
    #[serde(default)]
    pub post_scan_mm: f32,
    #[serde(default)]
    pub eject_feed_mm: f32,
    #[serde(default)]
    pub ld_shift_r: u32,
    #[serde(default)]
    pub ld_shift_g: u32,
    #[serde(default)]
    pub ld_shift_b: u32,
    pub is_cis: bool,
    #[serde(default)]
    pub is_sheetfed: bool,
    /// Pixel columns are shifted vertically at full CCD resolution.
    #[serde(default)]
    pub staggered_line: bool,
    /// The model cannot use the two-table fast feed.
    #[serde(default)]
    pub disable_fast_feed: bool,
    /// Skip shading calibration entirely.
    #[serde(default)]
    pub no_calibration: bool,
    #[serde(default = "default_search_lines")]
    pub search_lines: u32,
    #[serde(default = "default_shading_lines")]
    pub shading_lines: u32,
}

fn default_search_lines() -> u32 {
    200
}

fn default_shading_lines() -> u32 {
    100
}

impl Model {
    pub fn lowest_ydpi(&self) -> u32 {
        self.ydpi_values.iter().copied().min().unwrap_or(0)
    }

    pub fn lowest_dpi(&self) -> u32 {
        let x = self.xdpi_values.iter().copied().min().unwrap_or(0);
        x.min(self.lowest_ydpi())
    }
}

/// All static tables known to the backend.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Database {
    #[serde(default)]
    pub models: Vec<Model>,
    #[serde(default)]
    pub sensors: Vec<Sensor>,
    #[serde(default)]
    pub sensor_profiles: Vec<SensorProfile>,
    #[serde(default)]
    pub motors: Vec<Motor>,
    #[serde(default)]
    pub motor_profiles: Vec<MotorProfile>,
    #[serde(default)]
    pub frontends: Vec<FrontendDef>,
    #[serde(default)]
    pub gpios: Vec<Layout>,
    #[serde(default)]
    pub memory_layouts: Vec<Layout>,
}

pub fn load_database(s: &str) -> Result<Database, toml::de::Error> {
    toml::from_str::<Database>(s)
}

const BUILTIN: &str = include_str!("../data/devices.toml");

/// The bundled database, parsed and validated.
pub fn builtin() -> eyre::Result<Database> {
    let db = load_database(BUILTIN).map_err(|e| eyre::eyre!("built-in database: {e}"))?;
    db.validate()?;
    Ok(db)
}

impl Database {
    pub fn model(&self, id: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn sensor(&self, id: &str) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.id == id)
    }

    pub fn motor(&self, id: &str) -> Option<&Motor> {
        self.motors.iter().find(|m| m.id == id)
    }

    pub fn frontend(&self, id: &str) -> Option<&FrontendDef> {
        self.frontends.iter().find(|f| f.id == id)
    }

    pub fn gpio(&self, id: &str) -> Option<&Layout> {
        self.gpios.iter().find(|g| g.id == id)
    }

    pub fn memory_layout(&self, id: &str) -> Option<&Layout> {
        self.memory_layouts.iter().find(|l| l.id == id)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        for m in &self.models {
            if self.sensor(&m.sensor).is_none() {
                eyre::bail!("models.{}: unknown sensor '{}'", m.id, m.sensor);
            }
            if self.motor(&m.motor).is_none() {
                eyre::bail!("models.{}: unknown motor '{}'", m.id, m.motor);
            }
            if self.frontend(&m.frontend).is_none() {
                eyre::bail!("models.{}: unknown frontend '{}'", m.id, m.frontend);
            }
            if let Some(g) = &m.gpio
                && self.gpio(g).is_none()
            {
                eyre::bail!("models.{}: unknown gpio layout '{}'", m.id, g);
            }
            if let Some(l) = &m.memory_layout
                && self.memory_layout(l).is_none()
            {
                eyre::bail!("models.{}: unknown memory layout '{}'", m.id, l);
            }
            if m.xdpi_values.is_empty() || m.ydpi_values.is_empty() {
                eyre::bail!("models.{}: resolution lists must not be empty", m.id);
            }
            if !self.sensor_profiles.iter().any(|p| p.sensor == m.sensor) {
                eyre::bail!("models.{}: sensor '{}' has no sensor profile", m.id, m.sensor);
            }
        }

        for s in &self.sensors {
            if s.optical_res == 0 {
                eyre::bail!("sensors.{}: optical_res must be > 0", s.id);
            }
            if s.ccd_size_divisor == 0 || s.ccd_pixels_per_system_pixel == 0 {
                eyre::bail!("sensors.{}: divisors must be >= 1", s.id);
            }
            if s.hwdpi.windows(2).any(|w| w[0] >= w[1]) {
                eyre::bail!("sensors.{}: hwdpi must be strictly ascending", s.id);
            }
            validate_overlays(&format!("sensors.{}", s.id), &s.custom_regs)?;
        }

        for (i, p) in self.sensor_profiles.iter().enumerate() {
            if p.dpi == 0 || p.ccd_size_divisor == 0 {
                eyre::bail!("sensor_profiles[{i}]: dpi and ccd_size_divisor must be > 0");
            }
            if p.exposure_lperiod == 0 {
                eyre::bail!("sensor_profiles[{i}]: exposure_lperiod must be > 0");
            }
            let n = p.segment_order.len();
            if n > 0 {
                let mut seen = vec![false; n];
                for &o in &p.segment_order {
                    if o >= n || seen[o] {
                        eyre::bail!("sensor_profiles[{i}]: segment_order must be a permutation");
                    }
                    seen[o] = true;
                }
            }
            validate_overlays(&format!("sensor_profiles[{i}]"), &p.registers)?;
        }

        for m in &self.motors {
            if m.base_ydpi == 0 {
                eyre::bail!("motors.{}: base_ydpi must be > 0", m.id);
            }
            if m.max_step_type > 3 {
                eyre::bail!("motors.{}: max_step_type must be <= 3", m.id);
            }
            if m.slopes.is_empty() {
                eyre::bail!("motors.{}: at least one slope is required", m.id);
            }
            for s in &m.slopes {
                if s.maximum_speed == 0 || s.maximum_start_speed < s.maximum_speed {
                    eyre::bail!(
                        "motors.{}: maximum_start_speed must be >= maximum_speed > 0",
                        m.id
                    );
                }
                if !(s.g.is_finite() && s.g > 0.0) {
                    eyre::bail!("motors.{}: slope exponent g must be > 0", m.id);
                }
            }
        }

        for (i, p) in self.motor_profiles.iter().enumerate() {
            if self.motor(&p.motor).is_none() {
                eyre::bail!("motor_profiles[{i}]: unknown motor '{}'", p.motor);
            }
            if p.exposure == 0 {
                eyre::bail!("motor_profiles[{i}]: exposure must be > 0");
            }
            if p.step_type > 3 {
                eyre::bail!("motor_profiles[{i}]: step_type must be <= 3");
            }
            if p.table.is_empty() || p.table.contains(&0) {
                eyre::bail!("motor_profiles[{i}]: table must be non-empty without zeros");
            }
            if p.table.windows(2).any(|w| w[1] > w[0]) {
                eyre::bail!("motor_profiles[{i}]: table must be non-increasing");
            }
        }

        Ok(())
    }
}

fn validate_overlays(ctx: &str, regs: &[RegisterOverlay]) -> eyre::Result<()> {
    for r in regs {
        if !(1..=3).contains(&r.width) {
            eyre::bail!("{ctx}: register 0x{:02x} width must be 1..=3", r.address);
        }
        let max = (1u64 << (8 * u32::from(r.width))) - 1;
        if u64::from(r.value) > max {
            eyre::bail!(
                "{ctx}: register 0x{:02x} value {} does not fit in {} byte(s)",
                r.address,
                r.value,
                r.width
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_database_is_valid() {
        let db = builtin().unwrap();
        assert!(db.model("canon-lide-110").is_some());
        assert!(db.model("canon-lide-100").is_some());
        assert!(db.model("canon-lide-35").is_some());
    }

    #[test]
    fn register_hwdpi_picks_smallest_at_or_above() {
        let db = builtin().unwrap();
        let s = db.sensor("cis-canon-lide-110").unwrap();
        assert_eq!(s.register_hwdpi(75), 600);
        assert_eq!(s.register_hwdpi(600), 600);
        assert_eq!(s.register_hwdpi(601), 1200);
        assert_eq!(s.register_hwdpi(2400), 2400);
        assert_eq!(s.register_hwdpi(9600), 2400);
    }

    #[test]
    fn overlay_width_out_of_range_is_rejected() {
        let err = validate_overlays(
            "x",
            &[RegisterOverlay {
                address: 0x10,
                value: 0x1_0000,
                width: 2,
            }],
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not fit"));
    }
}
