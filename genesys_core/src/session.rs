//! Scan session geometry.
//!
//! A [`ScanSessionParams`] describes what the caller asked for. A
//! [`ScanSession`] holds the derived geometry and buffer sizes and can only be
//! obtained from [`ScanSession::compute`], so register synthesis never sees an
//! uncomputed session.

use genesys_config::{AsicType, Sensor};

use crate::error::{GenesysError, Result};
use crate::sensor::get_sensor_profile;
use crate::status::ScanFlags;
use crate::tables::DeviceTables;
use crate::util::multiply_by_depth_ceil;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    Lineart,
    Gray,
    #[default]
    Color,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorFilter {
    Red,
    #[default]
    Green,
    Blue,
    None,
}

/// Requested scan, in sensor pixel units at `xres` and motor lines at `yres`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSessionParams {
    pub xres: u32,
    pub yres: u32,
    pub startx: u32,
    pub starty: u32,
    pub pixels: u32,
    pub lines: u32,
    pub depth: u32,
    pub channels: u32,
    pub scan_mode: ScanMode,
    pub color_filter: ColorFilter,
    pub flags: ScanFlags,
}

impl ScanSessionParams {
    pub fn validate(&self) -> Result<()> {
        if self.xres == 0 || self.yres == 0 {
            return Err(GenesysError::invalid("resolution must be > 0").into());
        }
        if self.pixels == 0 || self.lines == 0 {
            return Err(GenesysError::invalid("scan area must not be empty").into());
        }
        if ![1, 8, 16].contains(&self.depth) {
            return Err(GenesysError::invalid(format!("unsupported depth {}", self.depth)).into());
        }
        if ![1, 3].contains(&self.channels) {
            return Err(
                GenesysError::invalid(format!("unsupported channel count {}", self.channels))
                    .into(),
            );
        }
        Ok(())
    }
}

/// Per-ASIC rules feeding the generic session computation.
#[derive(Debug, Clone, Copy)]
pub struct SessionRules {
    pub asic: AsicType,
    /// Half/quarter CCD mode for a given sensor and xres.
    pub ccd_size_divisor: fn(&Sensor, u32) -> u32,
    /// Round the optical pixel count up to an even number.
    pub even_optical_pixels: bool,
    /// Lines fetched per bulk read.
    pub lines_per_read: u32,
    /// Largest bulk transfer the ASIC accepts.
    pub bulk_max: u64,
    /// The gamma tables have no 16-bit mode.
    pub no_16bit_gamma: bool,
}

/// Divisor used by most generations: the largest of 4 and 2 the sensor
/// supports that still covers `xres`.
pub fn default_ccd_size_divisor(sensor: &Sensor, xres: u32) -> u32 {
    if sensor.ccd_size_divisor >= 4 && xres * 4 <= sensor.optical_res {
        4
    } else if sensor.ccd_size_divisor >= 2 && xres * 2 <= sensor.optical_res {
        2
    } else {
        1
    }
}

/// Staging buffer sizes, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferSizes {
    pub read: u64,
    pub lines: u64,
    pub shrink: u64,
    pub out: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Computed;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSession {
    pub params: ScanSessionParams,
    pub ccd_size_divisor: u32,
    /// Hardware DPI programmed into the timing generator.
    pub hwdpi: u32,
    /// `optical_res / hwdpi`, at least 1.
    pub hwdpi_divisor: u32,
    pub optical_resolution: u32,
    pub optical_pixels: u32,
    pub output_resolution: u32,
    pub output_pixels: u32,
    pub output_line_bytes: u64,
    pub output_line_count: u32,
    pub optical_line_bytes: u64,
    pub num_staggered_lines: u32,
    pub color_shift_lines: [u32; 3],
    pub max_color_shift_lines: u32,
    pub segment_count: u32,
    pub enable_ledadd: bool,
    pub buffers: BufferSizes,
    /// Bytes the frontend receives for the requested area.
    pub total_bytes_to_read: u64,
    _computed: Computed,
}

impl ScanSession {
    pub fn compute(
        params: &ScanSessionParams,
        tables: &DeviceTables,
        rules: &SessionRules,
    ) -> Result<Self> {
        params.validate()?;
        let sensor = &tables.sensor;
        let model = &tables.model;
        let motor = &tables.motor;

        let mut params = params.clone();
        // Dynamic lineart is an 8-bit gray scan thresholded on the host.
        if params.flags.contains(ScanFlags::DYNAMIC_LINEART) {
            params.depth = 8;
        }
        if rules.no_16bit_gamma && params.depth == 16 {
            params.flags |= ScanFlags::DISABLE_GAMMA;
        }

        let ccd_size_divisor = (rules.ccd_size_divisor)(sensor, params.xres).max(1);
        let optical_resolution = sensor.optical_res / ccd_size_divisor;
        let output_resolution = params.xres;
        if output_resolution > optical_resolution {
            return Err(GenesysError::UnsupportedResolution {
                resolution: output_resolution,
                optical: optical_resolution,
            }
            .into());
        }

        let hwdpi = sensor.register_hwdpi(params.xres * sensor.ccd_pixels_per_system_pixel);
        let hwdpi_divisor = (sensor.optical_res / hwdpi.max(1)).max(1);

        let wide = u64::from(params.pixels) * u64::from(optical_resolution);
        let mut optical_pixels = wide.div_ceil(u64::from(output_resolution)) as u32;
        if rules.even_optical_pixels && optical_pixels % 2 == 1 {
            optical_pixels += 1;
        }
        let output_pixels = ((u64::from(optical_pixels) * u64::from(output_resolution))
            / u64::from(optical_resolution)) as u32;

        let ignore_ld = params.flags.contains(ScanFlags::IGNORE_LINE_DISTANCE);
        let base_ydpi = motor.base_ydpi.max(1);
        let num_staggered_lines = if !ignore_ld && ccd_size_divisor == 1 && model.staggered_line {
            (4 * params.yres) / base_ydpi
        } else {
            0
        };
        let color_shift_lines = [model.ld_shift_r, model.ld_shift_g, model.ld_shift_b]
            .map(|s| (s * params.yres) / base_ydpi);
        let max_color_shift_lines = if params.channels > 1 && !ignore_ld {
            color_shift_lines.into_iter().max().unwrap_or(0)
        } else {
            0
        };
        let output_line_count = params.lines + max_color_shift_lines + num_staggered_lines;

        let depth = params.depth;
        let channels = u64::from(params.channels);
        let output_line_bytes = multiply_by_depth_ceil(u64::from(output_pixels), depth) * channels;
        let optical_line_bytes =
            multiply_by_depth_ceil(u64::from(optical_pixels), depth) * channels;

        let segment_count = get_sensor_profile(
            &tables.sensor_profiles,
            sensor,
            hwdpi,
            ccd_size_divisor,
        )
        .map(|p| p.segment_count() as u32)
        .unwrap_or(1);

        let buffers = buffer_sizes(
            rules,
            optical_line_bytes,
            output_line_bytes,
            max_color_shift_lines + num_staggered_lines,
        );

        let requested = u64::from(params.pixels)
            .checked_mul(u64::from(params.lines))
            .ok_or_else(|| GenesysError::invalid("scan area overflows the byte counter"))?;
        let total_bytes_to_read = if depth == 1 {
            Some(requested.div_ceil(8))
        } else {
            requested.checked_mul(u64::from(depth / 8))
        }
        .and_then(|b| b.checked_mul(channels))
        .ok_or_else(|| GenesysError::invalid("scan area overflows the byte counter"))?;

        let enable_ledadd = params.channels == 1
            && model.is_cis
            && params.flags.contains(ScanFlags::ENABLE_LEDADD);

        let session = ScanSession {
            params,
            ccd_size_divisor,
            hwdpi,
            hwdpi_divisor,
            optical_resolution,
            optical_pixels,
            output_resolution,
            output_pixels,
            output_line_bytes,
            output_line_count,
            optical_line_bytes,
            num_staggered_lines,
            color_shift_lines,
            max_color_shift_lines,
            segment_count,
            enable_ledadd,
            buffers,
            total_bytes_to_read,
            _computed: Computed,
        };
        tracing::debug!(
            asic = %rules.asic,
            xres = session.params.xres,
            yres = session.params.yres,
            optical_resolution,
            optical_pixels,
            output_pixels,
            output_line_count,
            hwdpi,
            ccd_size_divisor,
            "computed session"
        );
        Ok(session)
    }

    /// Lines of shift plus stagger that the host must buffer.
    pub fn max_shift(&self) -> u32 {
        self.max_color_shift_lines + self.num_staggered_lines
    }
}

fn buffer_sizes(
    rules: &SessionRules,
    optical_line_bytes: u64,
    output_line_bytes: u64,
    shift_lines: u32,
) -> BufferSizes {
    let line = optical_line_bytes.max(1);
    let mut chunk = u64::from(rules.lines_per_read) * line;
    if rules.bulk_max > 0 && chunk > rules.bulk_max {
        chunk = ((rules.bulk_max / line) * line).max(line);
    }
    let read = 2 * chunk + u64::from(shift_lines) * line;
    BufferSizes {
        read,
        lines: read,
        shrink: chunk,
        out: 8 * output_line_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> DeviceTables {
        let db = genesys_config::builtin().unwrap();
        DeviceTables::from_database(&db, "canon-lide-35").unwrap()
    }

    fn rules() -> SessionRules {
        SessionRules {
            asic: AsicType::Gl841,
            ccd_size_divisor: default_ccd_size_divisor,
            even_optical_pixels: true,
            lines_per_read: 8,
            bulk_max: 0xf000,
            no_16bit_gamma: true,
        }
    }

    fn params() -> ScanSessionParams {
        ScanSessionParams {
            xres: 300,
            yres: 300,
            startx: 0,
            starty: 0,
            pixels: 101,
            lines: 10,
            depth: 8,
            channels: 3,
            scan_mode: ScanMode::Color,
            color_filter: ColorFilter::None,
            flags: ScanFlags::empty(),
        }
    }

    #[test]
    fn optical_pixels_round_up_and_even() {
        let s = ScanSession::compute(&params(), &tables(), &rules()).unwrap();
        assert_eq!(s.optical_resolution, 1200);
        // 101 * 1200 / 300 = 404, already even
        assert_eq!(s.optical_pixels, 404);
        assert_eq!(s.output_pixels, 101);
        assert_eq!(s.output_line_bytes, 303);
        assert_eq!(s.total_bytes_to_read, 101 * 10 * 3);
    }

    #[test]
    fn sixteen_bit_disables_gamma_where_required() {
        let mut p = params();
        p.depth = 16;
        let s = ScanSession::compute(&p, &tables(), &rules()).unwrap();
        assert!(s.params.flags.contains(ScanFlags::DISABLE_GAMMA));
    }

    #[test]
    fn read_buffer_is_two_chunks_plus_shift() {
        let s = ScanSession::compute(&params(), &tables(), &rules()).unwrap();
        let line = s.optical_line_bytes;
        assert_eq!(s.buffers.shrink, 8 * line);
        assert_eq!(s.buffers.read, 2 * 8 * line + u64::from(s.max_shift()) * line);
    }

    #[test]
    fn lineart_totals_round_up_to_bytes() {
        let mut p = params();
        p.depth = 1;
        p.channels = 1;
        p.pixels = 9;
        p.lines = 1;
        let s = ScanSession::compute(&p, &tables(), &rules()).unwrap();
        assert_eq!(s.total_bytes_to_read, 2);
    }

    #[test]
    fn resolution_above_optical_is_rejected() {
        let mut p = params();
        p.xres = 2400;
        let err = ScanSession::compute(&p, &tables(), &rules()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<GenesysError>(),
            Some(&GenesysError::UnsupportedResolution {
                resolution: 2400,
                optical: 1200
            })
        );
    }

    #[test]
    fn dynamic_lineart_scans_eight_bit() {
        let mut p = params();
        p.depth = 1;
        p.channels = 1;
        p.flags = ScanFlags::DYNAMIC_LINEART;
        let s = ScanSession::compute(&p, &tables(), &rules()).unwrap();
        assert_eq!(s.params.depth, 8);
    }
}
