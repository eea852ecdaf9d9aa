//! Motor acceleration tables.
//!
//! A slope table is a list of step intervals in pixel-clock units. The first
//! entry is the slowest step; the motor accelerates along the table until it
//! reaches the scan speed and then stays at the last entry. Two generators are
//! provided:
//!
//! - [`slope_table`] copies a measured base table from the motor profile
//!   database (gl124, gl847).
//! - [`create_slope_table3`] synthesises a ramp from the motor's start speed,
//!   maximum speed and shape exponent (gl841).

use genesys_config::{Motor, MotorProfile};

use crate::error::{GenesysError, Result};

/// Maximum number of entries in any slope table.
pub const SLOPE_TABLE_SIZE: usize = 1024;

/// Hardware slots for slope tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlopeSlot {
    Scan = 0,
    Backtrack = 1,
    Stop = 2,
    Fast = 3,
    Home = 4,
}

impl SlopeSlot {
    pub fn index(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlopeTable {
    /// Step intervals; entries past `steps * factor` repeat the cruise speed.
    pub table: Vec<u16>,
    /// Acceleration steps, in units of the step multiplier.
    pub steps: u32,
    /// Sum of the intervals of the used entries.
    pub sum: u64,
}

impl SlopeTable {
    /// The first `n` entries, bounded by the table length.
    pub fn head(&self, n: usize) -> &[u16] {
        &self.table[..n.min(self.table.len())]
    }
}

/// Encode intervals as the little-endian words the ASICs expect.
pub fn to_le_bytes(table: &[u16]) -> Vec<u8> {
    table.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Motor profile for `motor` at `exposure`.
///
/// An exact exposure match wins; otherwise the profile with the lowest
/// exposure still at or above the request. When every profile of the motor is
/// faster than the request, the slowest one is used; a motor without any
/// profile falls back to the first entry of the database.
pub fn motor_profile<'a>(
    profiles: &'a [MotorProfile],
    motor: &str,
    exposure: u32,
) -> Result<&'a MotorProfile> {
    let mut closest: Option<&MotorProfile> = None;
    let mut slowest: Option<&MotorProfile> = None;
    for p in profiles.iter().filter(|p| p.motor == motor) {
        if p.exposure == exposure {
            return Ok(p);
        }
        if p.exposure >= exposure && closest.is_none_or(|c| p.exposure < c.exposure) {
            closest = Some(p);
        }
        if slowest.is_none_or(|s| p.exposure > s.exposure) {
            slowest = Some(p);
        }
    }
    if let Some(p) = closest {
        return Ok(p);
    }
    tracing::warn!(motor, exposure, "no motor profile at or above exposure, using default");
    slowest
        .or_else(|| profiles.first())
        .ok_or_else(|| GenesysError::invalid(format!("no motor profiles for motor '{motor}'")).into())
}

/// Step type the motor database recommends at `exposure`.
pub fn compute_step_type(profiles: &[MotorProfile], motor: &str, exposure: u32) -> Result<u8> {
    Ok(motor_profile(profiles, motor, exposure)?.step_type)
}

/// Build a slope table from the motor profile database.
///
/// The profile's base table is copied (the first entry as-is, later entries
/// shifted by `step_type`) for as long as it is not faster than the target
/// interval `((exposure * dpi) / base_dpi) >> step_type`. The table is then
/// padded with the target interval to a multiple of `factor`, and to at least
/// `2 * factor` entries.
#[allow(clippy::too_many_arguments)]
pub fn slope_table(
    dpi: u32,
    exposure: u32,
    base_dpi: u32,
    step_type: u8,
    factor: u32,
    motor: &str,
    profiles: &[MotorProfile],
) -> Result<SlopeTable> {
    if exposure == 0 || dpi == 0 || base_dpi == 0 {
        return Err(GenesysError::invalid(format!(
            "slope table needs non-zero exposure and resolution (exposure={exposure}, dpi={dpi}, base={base_dpi})"
        ))
        .into());
    }
    let factor = factor.max(1) as usize;
    let target = (((u64::from(exposure) * u64::from(dpi)) / u64::from(base_dpi)) >> step_type)
        .min(u64::from(u16::MAX)) as u16;

    let profile = motor_profile(profiles, motor, exposure)?;
    let base = &profile.table;

    let mut table = vec![target; SLOPE_TABLE_SIZE];
    let mut sum = 0u64;
    let mut i = 0usize;

    let mut current = base.first().copied().unwrap_or(0);
    while i < base.len() && i < SLOPE_TABLE_SIZE && current >= u32::from(target) {
        let v = current.min(u32::from(u16::MAX)) as u16;
        table[i] = v;
        sum += u64::from(v);
        i += 1;
        current = base.get(i).copied().unwrap_or(0) >> step_type;
    }

    if i >= base.len() && current > u32::from(target) {
        tracing::warn!(target, "short slope table, failed to reach target, target too low?");
    }
    if i < 3 {
        tracing::warn!(target, steps = i, "short slope table, target too high?");
    }

    // Remaining entries already hold the target interval.
    while i % factor != 0 && i < SLOPE_TABLE_SIZE {
        sum += u64::from(table[i]);
        i += 1;
    }
    while i < 2 * factor && i < SLOPE_TABLE_SIZE {
        sum += u64::from(table[i]);
        i += 1;
    }

    tracing::trace!(target, steps = i / factor, sum, "slope table");
    Ok(SlopeTable {
        table,
        steps: (i / factor) as u32,
        sum,
    })
}

/// Result of a synthesised ramp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSlope {
    pub table: Vec<u16>,
    /// Ramp entries plus the final cruise entry.
    pub used_steps: u32,
    /// Interval actually reached.
    pub vfinal: u16,
    pub sum: u64,
}

/// Generate a ramp from `vstart` toward `vend`, stopping at `stop_at`.
///
/// Entry `i` is `vstart * (1 - t) + vend * t` with `t = (i / (steps - 1))^g`.
/// The ramp ends early once an entry would be faster than `stop_at`; the rest
/// of the `max_steps` table holds the final interval.
#[allow(clippy::too_many_arguments)]
pub fn generate_slope_table(
    max_steps: usize,
    use_steps: u32,
    stop_at: u16,
    vstart: u16,
    vend: u16,
    steps: u32,
    g: f32,
) -> GeneratedSlope {
    let max_steps = max_steps.clamp(1, SLOPE_TABLE_SIZE);
    let use_steps = use_steps.max(1) as usize;
    let steps = steps.max(2);
    let stop_at = stop_at.max(vend);

    let mut table = Vec::with_capacity(max_steps);
    let mut sum = 0u64;
    if stop_at < vstart {
        let mut t2 = vstart;
        let mut i = 0usize;
        while i < steps as usize && i + 1 < use_steps && i < max_steps {
            let t = (i as f64 / f64::from(steps - 1)).powf(f64::from(g));
            t2 = (f64::from(vstart) * (1.0 - t) + t * f64::from(vend)) as u16;
            if t2 < stop_at {
                break;
            }
            table.push(t2);
            sum += u64::from(t2);
            i += 1;
        }
        if t2 > stop_at {
            tracing::warn!(stop_at, reached = t2, "slope ramp cannot reach target speed");
        }
    }
    let vfinal = stop_at;

    let used_steps = table.len() as u32 + 1;
    sum += u64::from(vfinal);
    table.resize(max_steps, vfinal);

    GeneratedSlope {
        table,
        used_steps,
        vfinal,
        sum,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slope3 {
    pub table: Vec<u16>,
    pub used_steps: u32,
    /// Exposure the final interval corresponds to at `yres`.
    pub final_exposure: u32,
    /// Time spent on the ramp, in pixel-clock units.
    pub time: u64,
}

/// Ramp from the motor's physical limits toward `exposure` at `yres`.
#[allow(clippy::too_many_arguments)]
pub fn create_slope_table3(
    motor: &Motor,
    max_steps: usize,
    use_steps: u32,
    step_type: u8,
    exposure: u32,
    yres: u32,
) -> Result<Slope3> {
    let slope = motor.slopes.get(usize::from(step_type)).ok_or_else(|| {
        GenesysError::invalid(format!(
            "motor '{}' has no slope for step type {step_type}",
            motor.id
        ))
    })?;
    if yres == 0 || motor.base_ydpi == 0 {
        return Err(GenesysError::invalid("slope table needs a non-zero resolution").into());
    }
    let clamp = |v: u64| v.min(u64::from(u16::MAX)) as u16;
    let vtarget = clamp((u64::from(exposure) * u64::from(yres) / u64::from(motor.base_ydpi)) >> step_type);
    let vstart = clamp(u64::from(slope.maximum_start_speed) >> step_type);
    let vend = clamp(u64::from(slope.maximum_speed) >> step_type);

    let generated = generate_slope_table(
        max_steps,
        use_steps,
        vtarget,
        vstart,
        vend,
        slope.minimum_steps << step_type,
        slope.g,
    );
    let final_exposure =
        (u64::from(generated.vfinal) * u64::from(motor.base_ydpi) / u64::from(yres)) as u32;
    tracing::trace!(vtarget, vstart, vend, final_exposure, used = generated.used_steps, "slope table 3");
    Ok(Slope3 {
        table: generated.table,
        used_steps: generated.used_steps,
        final_exposure,
        time: generated.sum,
    })
}

/// Z1MOD/Z2MOD phase correction words.
///
/// `accel_steps` is the value written to STEPNO, `move_steps` the FEEDL value
/// and `buffer_steps` the FWDSTEP value.
pub fn zmod(
    two_table: bool,
    exposure: u32,
    table: &[u16],
    accel_steps: u32,
    move_steps: u32,
    buffer_steps: u32,
) -> (u32, u32) {
    if exposure == 0 || table.is_empty() {
        return (0, 0);
    }
    let accel = (accel_steps as usize).clamp(1, table.len());
    let sum: u64 = table[..accel].iter().map(|&v| u64::from(v)).sum();
    let last = u64::from(table[accel - 1]);
    let exposure = u64::from(exposure);
    let z1 = (sum + u64::from(buffer_steps) * last) % exposure;
    let z2 = if two_table {
        (sum + last) % exposure
    } else {
        (sum + u64::from(move_steps) * last) % exposure
    };
    (z1 as u32, z2 as u32)
}
