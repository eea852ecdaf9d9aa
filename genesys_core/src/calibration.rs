//! Closed-loop calibration searches.
//!
//! The searches are numeric loops over a `measure` callback: the command sets
//! supply the scan, the loops only see the statistic. [`Frame`] turns the raw
//! bytes of a calibration scan into those statistics.

use std::ops::Range;
use std::time::Duration;

use genesys_config::{CalibrationTuning, Sensor};

use crate::command_set::CommandSet;
use crate::device::{CalibrationCache, CurrentSetup, Device, ReferencePoint};
use crate::error::{GenesysError, Result};
use crate::frontend::FrontendAction;
use crate::register::RegisterSet;
use crate::scan;
use crate::session::{ScanSession, ScanSessionParams};

/// Dark level the offset search aims for, 8-bit scale.
pub const DARK_TARGET: u32 = 10;

/// Gains above this mean the strip is not lit: the head is not moving.
pub const MAX_PLAUSIBLE_GAIN: f32 = 10.0;

/// Bounds of the LED balance loop when the sensor has no white target.
const BALANCE_MIN_EXPOSURE: u32 = 500;
const BALANCE_MIN_WHITE: u32 = 20_000;

// ── sample access ──────────────────────────────────────────────────────────

/// Raw lines from a calibration scan.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub data: &'a [u8],
    pub pixels: usize,
    pub channels: usize,
    /// 8 or 16; 16-bit samples are little endian.
    pub depth: u32,
    /// Lines hold every red sample, then green, then blue (CIS read-out).
    pub planar: bool,
}

impl Frame<'_> {
    fn bytes_per_sample(&self) -> usize {
        if self.depth == 16 { 2 } else { 1 }
    }

    pub fn line_bytes(&self) -> usize {
        self.pixels * self.channels * self.bytes_per_sample()
    }

    pub fn lines(&self) -> usize {
        match self.line_bytes() {
            0 => 0,
            n => self.data.len() / n,
        }
    }

    /// Sample number `index` of `line` in read-out order; 0 past the data.
    fn raw(&self, line: usize, index: usize) -> u32 {
        let bps = self.bytes_per_sample();
        let at = line * self.line_bytes() + index * bps;
        if bps == 2 {
            self.data
                .get(at..at + 2)
                .map_or(0, |b| u32::from(u16::from_le_bytes([b[0], b[1]])))
        } else {
            self.data.get(at).copied().map_or(0, u32::from)
        }
    }

    pub fn sample(&self, line: usize, pixel: usize, channel: usize) -> u32 {
        let index = if self.planar {
            channel * self.pixels + pixel
        } else {
            pixel * self.channels + channel
        };
        self.raw(line, index)
    }

    /// Mean of `channel` over `pixels` of the first line.
    pub fn channel_mean(&self, channel: usize, pixels: Range<usize>) -> u32 {
        let n = pixels.len() as u64;
        if n == 0 {
            return 0;
        }
        let sum: u64 = pixels
            .map(|p| u64::from(self.sample(0, p, channel)))
            .sum();
        (sum / n) as u32
    }

    pub fn channel_max(&self, channel: usize) -> u32 {
        (0..self.pixels)
            .map(|p| self.sample(0, p, channel))
            .max()
            .unwrap_or(0)
    }

    /// Per-channel statistic; a single-channel frame repeats its only value.
    pub fn per_channel(&self, stat: impl Fn(&Self, usize) -> u32) -> [u32; 3] {
        [0, 1, 2].map(|ch| stat(self, ch.min(self.channels.saturating_sub(1))))
    }

    /// Full-line channel means.
    pub fn means(&self) -> [u32; 3] {
        self.per_channel(|f, ch| f.channel_mean(ch, 0..f.pixels))
    }

    /// Channel means over the central half of the line.
    pub fn central_means(&self) -> [u32; 3] {
        let range = self.pixels / 4..(self.pixels * 3) / 4;
        self.per_channel(|f, ch| f.channel_mean(ch, range.clone()))
    }
}

/// Average over the leading `black` samples of every line, all channels.
///
/// Each channel averages the samples starting at its own index, so the
/// channels see overlapping windows of the black margin.
pub fn dark_average(frame: &Frame<'_>, black: usize) -> u32 {
    let lines = frame.lines().max(1);
    let mut avg = [0u64; 3];
    let channels = frame.channels.clamp(1, 3);
    for (k, slot) in avg.iter_mut().enumerate().take(channels) {
        let mut count = 0u64;
        for line in 0..lines {
            for j in 0..black {
                *slot += u64::from(frame.raw(line, j + k));
                count += 1;
            }
        }
        if count > 0 {
            *slot /= count;
        }
    }
    let total: u64 = avg.iter().take(channels).sum();
    (total / channels as u64) as u32
}

// ── offset ─────────────────────────────────────────────────────────────────

/// Bisect the AFE offset so the dark level just reaches `target`.
///
/// `measure(offset)` programs the offset, scans and returns the dark level;
/// it must grow with the offset. The bracket keeps `measure(bottom) < target
/// <= measure(top)` and the search returns `top` once the bracket is one code
/// wide or `max_passes` probes were spent.
pub fn offset_search<F>(bottom: u8, top: u8, target: u32, max_passes: u32, mut measure: F) -> Result<u8>
where
    F: FnMut(u8) -> Result<u32>,
{
    let (mut bottom, mut top) = (bottom.min(top), bottom.max(top));
    let bottom_avg = measure(bottom)?;
    let top_avg = measure(top)?;
    tracing::debug!(bottom, bottom_avg, top, top_avg, target, "offset bracket");

    if bottom_avg == top_avg {
        tracing::warn!(
            average = bottom_avg,
            "dark level does not depend on the offset, using the top of the range"
        );
        return Ok(top);
    }
    if bottom_avg >= target {
        return Ok(bottom);
    }
    if top_avg < target {
        tracing::warn!(top_avg, target, "dark level stays below target, using the top of the range");
        return Ok(top);
    }

    let mut passes = 0;
    while passes < max_passes && top - bottom > 1 {
        passes += 1;
        let mid = bottom + (top - bottom) / 2;
        let avg = measure(mid)?;
        tracing::trace!(pass = passes, offset = mid, avg, "offset probe");
        if avg >= target {
            top = mid;
        } else {
            bottom = mid;
        }
    }
    tracing::debug!(offset = top, passes, "offset search done");
    Ok(top)
}

// ── coarse gain ────────────────────────────────────────────────────────────

/// AFE gain code for a linear gain: `283 - 208 / gain`, clamped to a byte.
pub fn gain_code(gain: f32) -> u8 {
    (283.0 - 208.0 / gain).clamp(0.0, 255.0) as u8
}

/// Gain codes that bring each channel's `levels` up to `target`.
///
/// CIS sensors share one lamp, so every channel takes the smallest code; a
/// gray scan copies the green code. A level too dark for any plausible gain
/// (zero included) means the head is parked or locked and is reported as
/// [`GenesysError::Jammed`].
pub fn coarse_gains(levels: [u32; 3], target: f32, channels: u32, is_cis: bool) -> Result<[u8; 3]> {
    let mut codes = [0u8; 3];
    for (ch, &level) in levels.iter().enumerate() {
        let gain = target / level as f32;
        if !gain.is_finite() || gain > MAX_PLAUSIBLE_GAIN {
            tracing::warn!(channel = ch, level, "extremely low brightness");
            return Err(GenesysError::Jammed(
                "extremely low brightness, check that the scanning head is unlocked".into(),
            )
            .into());
        }
        codes[ch] = gain_code(gain);
        tracing::debug!(channel = ch, level, gain, code = codes[ch], "coarse gain");
    }
    if is_cis {
        let min = codes.iter().copied().min().unwrap_or(0);
        codes = [min; 3];
    }
    if channels == 1 {
        codes = [codes[1]; 3];
    }
    Ok(codes)
}

// ── LED exposure ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedPolicy {
    /// Drive every channel to `target` within `target / tolerance_divisor`.
    Target { target: u32, tolerance_divisor: u32 },
    /// Bring the channels within 5 % of each other, mean exposure kept in
    /// `min_exposure..=max_exposure`.
    Balance { min_exposure: u32, max_exposure: u32 },
    /// Keep each channel between its `bottom` and `top` level.
    Window { bottom: [u32; 3], top: [u32; 3] },
}

impl LedPolicy {
    pub fn for_sensor(sensor: &Sensor, initial: [u16; 3], tuning: &CalibrationTuning) -> Self {
        if sensor.gain_white_ref > 0 {
            LedPolicy::Target {
                target: sensor.gain_white_ref * 256,
                tolerance_divisor: tuning.led_tolerance_divisor.max(1),
            }
        } else {
            let mean = initial.iter().map(|&e| u32::from(e)).sum::<u32>() / 3;
            LedPolicy::Balance {
                min_exposure: BALANCE_MIN_EXPOSURE,
                max_exposure: (mean * 2).max(BALANCE_MIN_EXPOSURE),
            }
        }
    }

    /// True when `avg` is acceptable; otherwise rescale `exposure` for the
    /// next pass.
    pub fn adjust(&self, exposure: &mut [u16; 3], avg: [u32; 3]) -> bool {
        match *self {
            LedPolicy::Target {
                target,
                tolerance_divisor,
            } => {
                let mut acceptable = true;
                for (exp, &a) in exposure.iter_mut().zip(avg.iter()) {
                    if a.abs_diff(target) > target / tolerance_divisor {
                        *exp = scale(*exp, target, a);
                        acceptable = false;
                    }
                }
                acceptable
            }
            LedPolicy::Balance {
                min_exposure,
                max_exposure,
            } => {
                let balanced = avg.iter().all(|&a| {
                    avg.iter()
                        .all(|&b| u64::from(a) * 100 >= u64::from(b) * 95)
                });
                if balanced && avg.iter().all(|&a| a >= BALANCE_MIN_WHITE) {
                    return true;
                }
                let mean = avg.iter().sum::<u32>() / 3;
                for (exp, &a) in exposure.iter_mut().zip(avg.iter()) {
                    *exp = scale(*exp, mean, a);
                }
                let mean_exp = exposure.iter().map(|&e| u32::from(e)).sum::<u32>() / 3;
                if mean_exp > max_exposure {
                    exposure.iter_mut().for_each(|e| *e = scale(*e, max_exposure, mean_exp));
                }
                if mean_exp < min_exposure {
                    exposure.iter_mut().for_each(|e| *e = scale(*e, min_exposure, mean_exp));
                }
                false
            }
            LedPolicy::Window { bottom, top } => {
                let mut acceptable = true;
                for ch in 0..3 {
                    if avg[ch] < bottom[ch] {
                        exposure[ch] = scale(exposure[ch], bottom[ch], avg[ch]);
                        acceptable = false;
                    } else if avg[ch] > top[ch] {
                        exposure[ch] = scale(exposure[ch], top[ch], avg[ch]);
                        acceptable = false;
                    }
                }
                acceptable
            }
        }
    }
}

/// `value * num / den` in 64-bit, kept within `1..=u16::MAX`.
fn scale(value: u16, num: u32, den: u32) -> u16 {
    let v = u64::from(value) * u64::from(num) / u64::from(den.max(1));
    v.clamp(1, u64::from(u16::MAX)) as u16
}

/// Iterate LED exposures until `policy` accepts the measured levels.
///
/// Never fails on non-convergence: after `max_iterations` the last measured
/// exposure is returned and shading absorbs the residual imbalance.
pub fn led_search<F>(initial: [u16; 3], policy: LedPolicy, max_iterations: u32, mut measure: F) -> Result<[u16; 3]>
where
    F: FnMut([u16; 3]) -> Result<[u32; 3]>,
{
    let mut exposure = initial;
    let mut measured = initial;
    for turn in 0..max_iterations.max(1) {
        measured = exposure;
        let avg = measure(measured)?;
        tracing::trace!(turn, ?measured, ?avg, "LED pass");
        if policy.adjust(&mut exposure, avg) {
            tracing::info!(turns = turn + 1, exposure = ?measured, "LED exposure calibrated");
            return Ok(measured);
        }
    }
    tracing::warn!(max_iterations, exposure = ?measured, "LED calibration did not converge, keeping last exposure");
    Ok(measured)
}

// ── scans ──────────────────────────────────────────────────────────────────

/// Write `regs`, acquire `size` bytes with the motor running, then stop.
pub fn scan_frame(dev: &mut Device, cs: &dyn CommandSet, regs: &mut RegisterSet, size: usize) -> Result<Vec<u8>> {
    dev.write_registers(regs)?;
    cs.begin_scan(dev, regs, true)?;
    match dev.read_raw_data(cs.layout(), size) {
        Ok(data) => {
            cs.stop_action(dev)?;
            Ok(data)
        }
        Err(e) => {
            if let Err(stop) = cs.stop_action(dev) {
                tracing::warn!(error = %stop, "stop after failed calibration read");
            }
            Err(e)
        }
    }
}

/// Program `regs` for a motionless calibration scan of `params`.
pub fn prepare_static_scan(
    dev: &mut Device,
    cs: &dyn CommandSet,
    regs: &mut RegisterSet,
    params: &ScanSessionParams,
) -> Result<ScanSession> {
    let session = cs.compute_session(dev, params)?;
    cs.init_scan_regs(dev, regs, &session)?;
    scan::set_motor_power(regs, false)?;
    Ok(session)
}

fn frame_size(session: &ScanSession) -> usize {
    session.total_bytes_to_read as usize
}

/// Offset calibration over the black margin of a dark, motionless scan.
///
/// Gains are zeroed first; the chosen offset is left programmed in
/// `dev.frontend` and returned.
pub fn calibrate_offset(
    dev: &mut Device,
    cs: &dyn CommandSet,
    regs: &mut RegisterSet,
    params: &ScanSessionParams,
    black_pixels: usize,
) -> Result<u8> {
    let session = prepare_static_scan(dev, cs, regs, params)?;
    let size = frame_size(&session);
    let p = &session.params;
    let (pixels, channels, depth) = (p.pixels as usize, p.channels as usize, p.depth);
    let planar = dev.tables.model.is_cis;
    let target = if depth == 16 { DARK_TARGET * 256 } else { DARK_TARGET };
    let max_passes = dev.tuning.offset_max_passes;

    dev.frontend.set_gains([0; 3]);
    let offset = offset_search(10, 255, target, max_passes, |offset| {
        dev.frontend.set_offsets([offset; 3]);
        cs.set_fe(dev, FrontendAction::Set)?;
        let data = scan_frame(dev, cs, regs, size)?;
        let frame = Frame { data: &data, pixels, channels, depth, planar };
        Ok(dark_average(&frame, black_pixels))
    })?;
    dev.frontend.set_offsets([offset; 3]);
    tracing::info!(offset, "offset calibrated");
    Ok(offset)
}

/// Coarse gain from one motionless scan of the white strip.
///
/// `stat` reduces the frame to per-channel levels; `target` is the level the
/// gain should bring them to, on the same scale. The codes are left in
/// `dev.frontend` and returned.
pub fn calibrate_coarse_gain(
    dev: &mut Device,
    cs: &dyn CommandSet,
    regs: &mut RegisterSet,
    params: &ScanSessionParams,
    target: f32,
    stat: impl Fn(&Frame<'_>) -> [u32; 3],
) -> Result<[u8; 3]> {
    let session = prepare_static_scan(dev, cs, regs, params)?;
    let size = frame_size(&session);
    cs.set_fe(dev, FrontendAction::Set)?;
    let data = scan_frame(dev, cs, regs, size)?;
    let p = &session.params;
    let frame = Frame {
        data: &data,
        pixels: p.pixels as usize,
        channels: p.channels as usize,
        depth: p.depth,
        planar: dev.tables.model.is_cis,
    };
    let levels = stat(&frame);
    let codes = coarse_gains(levels, target, dev.settings.channels(), dev.tables.model.is_cis)?;
    dev.frontend.set_gains(codes);
    tracing::info!(?levels, ?codes, "coarse gain calibrated");
    Ok(codes)
}

/// LED exposure search on motionless single-line scans.
pub fn calibrate_led(
    dev: &mut Device,
    cs: &dyn CommandSet,
    regs: &mut RegisterSet,
    params: &ScanSessionParams,
    initial: [u16; 3],
    policy: LedPolicy,
) -> Result<[u16; 3]> {
    let session = prepare_static_scan(dev, cs, regs, params)?;
    let size = frame_size(&session);
    let p = &session.params;
    let (pixels, channels, depth) = (p.pixels as usize, p.channels as usize, p.depth);
    let planar = dev.tables.model.is_cis;
    let layout = cs.layout();
    let max_iterations = dev.tuning.led_max_iterations;

    led_search(initial, policy, max_iterations, |exposure| {
        regs.set_exposure(layout, exposure)?;
        let data = scan_frame(dev, cs, regs, size)?;
        let frame = Frame { data: &data, pixels, channels, depth, planar };
        Ok(frame.means())
    })
}

/// Locate the top-left corner of the bright area in an 8-bit gray search
/// scan: the first column and the first line whose mean crosses halfway
/// between the darkest and brightest ones.
pub fn search_reference_point(data: &[u8], pixels: usize, lines: usize, dpi: u32) -> ReferencePoint {
    let pixels = pixels.max(1);
    let lines = lines.min(data.len() / pixels);
    let first_crossing = |means: &[u32]| {
        let lo = means.iter().copied().min().unwrap_or(0);
        let hi = means.iter().copied().max().unwrap_or(0);
        let mid = lo + (hi - lo) / 2;
        if hi == lo {
            return 0;
        }
        means.iter().position(|&m| m > mid).unwrap_or(0) as u32
    };

    let column_means: Vec<u32> = (0..pixels)
        .map(|x| {
            let sum: u64 = (0..lines).map(|y| u64::from(data[y * pixels + x])).sum();
            (sum / lines.max(1) as u64) as u32
        })
        .collect();
    let line_means: Vec<u32> = (0..lines)
        .map(|y| {
            let row = &data[y * pixels..(y + 1) * pixels];
            (row.iter().map(|&v| u64::from(v)).sum::<u64>() / pixels as u64) as u32
        })
        .collect();

    let point = ReferencePoint {
        dpi,
        x: first_crossing(&column_means),
        y: first_crossing(&line_means),
    };
    tracing::debug!(?point, "reference point");
    point
}

// ── shading ────────────────────────────────────────────────────────────────

/// Coefficient word that leaves a sample unchanged.
pub const SHADING_UNITY: u32 = 0x4000;

/// Per-pixel shading coefficients from a white frame.
///
/// Each channel gets one block of `pixels` entries; an entry is two
/// little-endian words, the dark level followed by the gain that brings the
/// pixel's white level to `target`. No dark frame is taken, so the dark word
/// is zero.
pub fn shading_coefficients(white: &Frame<'_>, target: u32) -> Vec<u8> {
    let lines = white.lines().max(1);
    let mut out = Vec::with_capacity(3 * white.pixels * 4);
    for ch in 0..3 {
        let ch = ch.min(white.channels.saturating_sub(1));
        for x in 0..white.pixels {
            let sum: u64 = (0..lines).map(|y| u64::from(white.sample(y, x, ch))).sum();
            let level = (sum / lines as u64).max(1);
            let gain = (u64::from(SHADING_UNITY) * u64::from(target) / level).min(0xffff) as u16;
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(&gain.to_le_bytes());
        }
    }
    out
}

// ── cache ──────────────────────────────────────────────────────────────────

/// Whether `cache` was taken with a setup compatible with `setup`.
///
/// Flatbed entries also expire after the configured age unless the caller is
/// about to overwrite them.
pub fn cache_matches(dev: &Device, setup: &CurrentSetup, cache: &CalibrationCache, for_overwrite: bool) -> bool {
    let used = &cache.setup;
    if used.ccd_size_divisor != setup.ccd_size_divisor
        || used.xres != setup.xres
        || used.exposure_time != setup.exposure_time
        || used.channels != setup.channels
    {
        tracing::debug!(?used, ?setup, "calibration cache entry does not match");
        return false;
    }
    if !for_overwrite && !dev.tables.model.is_sheetfed {
        let age = dev.now().saturating_duration_since(cache.created);
        if age > Duration::from_secs(dev.tuning.cache_expiry_s) {
            tracing::debug!(age_s = age.as_secs(), "calibration cache entry expired");
            return false;
        }
    }
    true
}
