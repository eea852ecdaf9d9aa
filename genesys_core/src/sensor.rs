//! Sensor timing profile resolution.

use genesys_config::{Sensor, SensorProfile};

use crate::error::{GenesysError, Result};

/// Timing profile for `sensor` at hardware resolution `dpi` and CCD divisor.
///
/// Preference order:
/// 1. exact `(sensor, dpi, divisor)` match;
/// 2. among profiles of the same sensor and divisor, the lowest DPI at or
///    above the request;
/// 3. among those, the highest DPI (request above every entry);
/// 4. any profile of the sensor, then the first profile of the table, with a
///    warning.
///
/// Only an empty table is an error.
pub fn get_sensor_profile<'a>(
    profiles: &'a [SensorProfile],
    sensor: &Sensor,
    dpi: u32,
    ccd_size_divisor: u32,
) -> Result<&'a SensorProfile> {
    let mut above: Option<&SensorProfile> = None;
    let mut highest: Option<&SensorProfile> = None;

    for p in profiles
        .iter()
        .filter(|p| p.sensor == sensor.id && p.ccd_size_divisor == ccd_size_divisor)
    {
        if p.dpi == dpi {
            return Ok(p);
        }
        if p.dpi >= dpi && above.is_none_or(|b| p.dpi < b.dpi) {
            above = Some(p);
        }
        if highest.is_none_or(|h| p.dpi > h.dpi) {
            highest = Some(p);
        }
    }

    if let Some(p) = above.or(highest) {
        tracing::debug!(sensor = %sensor.id, dpi, picked = p.dpi, "closest sensor profile");
        return Ok(p);
    }

    tracing::warn!(
        sensor = %sensor.id,
        dpi,
        ccd_size_divisor,
        "no matching sensor profile, using default"
    );
    profiles
        .iter()
        .find(|p| p.sensor == sensor.id)
        .or_else(|| profiles.first())
        .ok_or_else(|| GenesysError::invalid("sensor profile table is empty").into())
}
