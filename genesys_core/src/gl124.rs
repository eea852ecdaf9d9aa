//! GL124 command set (Canon LiDE 110/120/210/220).
//!
//! Registers above 0xff (scan state, status, gray threshold) are reached
//! with 16-bit addresses. The frontend is a TI part selected by REG0A
//! SIFSEL; the CIS sensor is split into segments whose shading
//! coefficients are uploaded one bank per channel.

use std::sync::Arc;

use genesys_config::{AsicType, FrontendKind, Sensor};

use crate::calibration::{self, Frame, LedPolicy};
use crate::command_set::CommandSet;
use crate::device::{CurrentSetup, Device};
use crate::error::{GenesysError, Result};
use crate::frontend::{FrontendAction, expect_kind};
use crate::layout::{Field, RegisterLayout, loc};
use crate::register::RegisterSet;
use crate::scan::{self, REG01, REG01_DVDSET, REG01_SCAN, REG02, REG03, REG03_AVEENB, REG05, REG05_GMMENB};
use crate::sensor::get_sensor_profile;
use crate::session::{ColorFilter, ScanMode, ScanSession, ScanSessionParams, SessionRules};
use crate::slope::{self, SlopeSlot};
use crate::status::{MotorFlags, ScanFlags, ScanStateBits};
use crate::tables::DeviceTables;
use crate::util::{mm_to_units, multiply_by_depth_ceil};

const REG01_TRUEGRAY: u8 = 0x04;
const REG03_LAMPTIM: u8 = 0x0f;
const REG04: u16 = 0x04;
const REG04_LINEART: u8 = 0x80;
const REG04_BITSET: u8 = 0x40;
const REG04_FILTER: u8 = 0x30;
const REG06: u16 = 0x06;
const REG06_GAIN4: u8 = 0x08;
const REG08: u16 = 0x08;
const REG08_CIS_LINE: u8 = 0x10;
const REG0A: u16 = 0x0a;
const REG0A_SIFSEL: u8 = 0xc0;
const REG0A_SIFSEL_SHIFT: u8 = 6;
/// SIFSEL value of the TI frontend.
const SIFSEL_TI: u8 = 3;
const REG0B: u16 = 0x0b;
const REG0B_30MHZ: u8 = 0x20;
const REG0B_ENBDRAM: u8 = 0x08;
const REG0B_64M: u8 = 0x02;
const REG0E: u16 = 0x0e;
const REG1D: u16 = 0x1d;
const REG1D_LINESEL: u8 = 0x1f;
const REG32: u16 = 0x32;
const REG32_GPIO10: u8 = 0x02;
const REG33: u16 = 0x33;
const REG36: u16 = 0x36;
const REG60: u16 = 0x60;
const REG60_LEDADD: u8 = 0x04;
const REG98: u16 = 0x98;
const REGA0: u16 = 0xa0;
const REGA0_FSTPSEL_SHIFT: u8 = 3;
const REG100_CHKVER: u8 = 0x10;
const REG_TRUER: u16 = 0x110;
const REG_TRUEG: u16 = 0x111;
const REG_TRUEB: u16 = 0x112;
const REG_THRESHOLD_HI: u16 = 0x114;
const REG_THRESHOLD_LO: u16 = 0x115;
const REGF8: u16 = 0xf8;

const REG_SHADING_BANK: u16 = 0xd0;
const AHB_BASE: u32 = 0x1000_0000;
const AHB_SLOPE_STRIDE: u32 = 0x4000;
const AHB_SHADING_UNIT: u32 = 8192;

/// Line period used for pure moves.
const MOVE_EXPOSURE: u32 = 2304;

static LAYOUT: RegisterLayout = RegisterLayout {
    asic: AsicType::Gl124,
    status: 0x101,
    scan_state: 0x100,
    fields: &[
        (Field::Lincnt, loc(0x25, 3)),
        (Field::Maxwd, loc(0x28, 3)),
        (Field::Dpiset, loc(0x2c, 2)),
        (Field::Feedl, loc(0x3d, 3)),
        (Field::Lperiod, loc(0x7d, 3)),
        (Field::Dummy, loc(0x80, 2)),
        (Field::Strpixel, loc(0x82, 3)),
        (Field::Endpixel, loc(0x85, 3)),
        (Field::Expdmy, loc(0x88, 2)),
        (Field::ExpR, loc(0x8a, 3)),
        (Field::ExpG, loc(0x8d, 3)),
        (Field::ExpB, loc(0x90, 3)),
        (Field::Segcnt, loc(0x93, 3)),
        (Field::Tg0cnt, loc(0x96, 2)),
        (Field::Scanfed, loc(0xa2, 2)),
        (Field::Stepno, loc(0xa4, 2)),
        (Field::Fwdstep, loc(0xa6, 2)),
        (Field::Bwdstep, loc(0xa8, 2)),
        (Field::Fastno, loc(0xaa, 2)),
        (Field::Fshdec, loc(0xac, 2)),
        (Field::Fmovno, loc(0xae, 2)),
        (Field::Fmovdec, loc(0xb0, 2)),
        (Field::Z1mod, loc(0xb2, 3)),
        (Field::Z2mod, loc(0xb5, 3)),
    ],
};

/// Power-on register defaults.
const BOOT_REGISTERS: &[(u16, u8)] = &[
    (0x01, 0xa2), (0x02, 0x90), (0x03, 0x10), (0x04, 0x03), (0x05, 0x00), (0x06, 0x58),
    (0x09, 0x00), (0x0a, 0xc0), (0x0b, 0x2a), (0x0c, 0x12),
    (0x11, 0x00), (0x12, 0x00), (0x13, 0x0f), (0x14, 0x00), (0x15, 0x80), (0x16, 0x10),
    (0x17, 0x04), (0x18, 0x00), (0x19, 0x01), (0x1a, 0x30), (0x1b, 0x00), (0x1c, 0x00),
    (0x1d, 0x01), (0x1e, 0x10), (0x1f, 0x00),
    (0x20, 0x15), (0x21, 0x00), (0x22, 0x02), (0x23, 0x00), (0x24, 0x00), (0x25, 0x00),
    (0x26, 0x0d), (0x27, 0x48), (0x28, 0x00), (0x29, 0x56), (0x2a, 0x5e), (0x2b, 0x02),
    (0x2c, 0x02), (0x2d, 0x58),
    (0x3b, 0x00), (0x3c, 0x00), (0x3d, 0x00), (0x3e, 0x00), (0x3f, 0x02),
    (0x40, 0x00), (0x41, 0x00), (0x42, 0x00), (0x43, 0x00), (0x44, 0x00), (0x45, 0x00),
    (0x46, 0x00), (0x47, 0x00), (0x48, 0x00), (0x49, 0x00), (0x4f, 0x00),
    (0x52, 0x00), (0x53, 0x02), (0x54, 0x04), (0x55, 0x06), (0x56, 0x04), (0x57, 0x04),
    (0x58, 0x04), (0x59, 0x04), (0x5a, 0x1a), (0x5b, 0x00), (0x5c, 0xc0), (0x5f, 0x00),
    (0x60, 0x02), (0x61, 0x00), (0x62, 0x00), (0x63, 0x00), (0x64, 0x00), (0x65, 0x00),
    (0x66, 0x00), (0x67, 0x00), (0x68, 0x00), (0x69, 0x00), (0x6a, 0x00), (0x6b, 0x00),
    (0x6c, 0x00), (0x6d, 0xd0), (0x6e, 0x00), (0x6f, 0x00),
    (0x70, 0x00), (0x71, 0x08), (0x72, 0x08), (0x73, 0x0a),
    (0x74, 0x00), (0x75, 0x00), (0x76, 0x3c), (0x77, 0x00), (0x78, 0x00), (0x79, 0x9f),
    (0x7a, 0x00), (0x7b, 0x00), (0x7c, 0x55), (0x7d, 0x00), (0x7e, 0x08), (0x7f, 0x58),
    (0x80, 0x00), (0x81, 0x14), (0x82, 0x00), (0x83, 0x00), (0x84, 0x00), (0x85, 0x00),
    (0x86, 0x00), (0x87, 0x00), (0x88, 0x00), (0x89, 0x65), (0x8a, 0x00), (0x8b, 0x00),
    (0x8c, 0x00), (0x8d, 0x00), (0x8e, 0x00), (0x8f, 0x00), (0x90, 0x00), (0x91, 0x00),
    (0x92, 0x00), (0x93, 0x00), (0x94, 0x14), (0x95, 0x30), (0x96, 0x00), (0x97, 0x90),
    (0x98, 0x01), (0x99, 0x1f), (0x9a, 0x00), (0x9b, 0x80), (0x9c, 0x80), (0x9d, 0x3f),
    (0x9e, 0x00), (0x9f, 0x00),
    (0xa0, 0x20), (0xa1, 0x30), (0xa2, 0x00), (0xa3, 0x20), (0xa4, 0x01), (0xa5, 0x00),
    (0xa6, 0x00), (0xa7, 0x08), (0xa8, 0x00), (0xa9, 0x08), (0xaa, 0x01), (0xab, 0x00),
    (0xac, 0x00), (0xad, 0x40), (0xae, 0x01), (0xaf, 0x00),
    (0xb0, 0x00), (0xb1, 0x40), (0xb2, 0x00), (0xb3, 0x09), (0xb4, 0x5b), (0xb5, 0x00),
    (0xb6, 0x10), (0xb7, 0x3f), (0xb8, 0x00), (0xbb, 0x00), (0xbc, 0xff), (0xbd, 0x00),
    (0xbe, 0x07),
    (0xc3, 0x00), (0xc4, 0x00),
    (0xd3, 0x00), (0xd4, 0x00), (0xd5, 0x00), (0xd6, 0x00), (0xd7, 0x00), (0xd8, 0x00),
    (0xd9, 0x00),
    (0xf8, 0x01), (0xf9, 0x00), (0xfa, 0x00), (0xfb, 0x00), (0xfc, 0x00), (0xff, 0x00),
];

/// Sensor timing registers copied from the sensor table.
const SENSOR_TIMING: [std::ops::RangeInclusive<u16>; 2] = [0x16..=0x1d, 0x52..=0x5c];

const CALIBRATION_FLAGS: ScanFlags = ScanFlags::DISABLE_SHADING
    .union(ScanFlags::DISABLE_GAMMA)
    .union(ScanFlags::SINGLE_LINE)
    .union(ScanFlags::IGNORE_LINE_DISTANCE);

const MOVE_FLAGS: ScanFlags = ScanFlags::DISABLE_SHADING
    .union(ScanFlags::DISABLE_GAMMA)
    .union(ScanFlags::IGNORE_LINE_DISTANCE);

#[derive(Debug, Clone, Copy, Default)]
pub struct Gl124;

/// Half the sensor clock below 300 dpi when the sensor allows it.
fn ccd_size_divisor(sensor: &Sensor, xres: u32) -> u32 {
    if sensor.ccd_size_divisor > 1 && xres <= 300 { 2 } else { 1 }
}

/// The LiDE 120 wires its motor and AVEENB differently from the rest.
fn is_lide120(tables: &DeviceTables) -> bool {
    tables.sensor.id == "cis-canon-lide-120"
}

/// Release GPIO10 so the home sensor reads through.
fn homsnr_gpio(dev: &mut Device) -> Result<()> {
    let v = dev.read_register(REG32)?;
    dev.write_register(REG32, v & !REG32_GPIO10)
}

/// Motor current selection on REG32 for a scan at `resolution`.
fn setup_scan_gpio(dev: &mut Device, resolution: u32) -> Result<()> {
    let mut v = dev.read_register(REG32)?;
    if is_lide120(&dev.tables) {
        v = match resolution {
            0..=300 => v & 0xf7,
            301..=600 => v | 0x08,
            601..=1200 => (v & 0xef) | 0x08,
            _ => v & 0xf7,
        };
    } else {
        let base = dev.tables.motor.base_ydpi;
        if resolution >= base / 2 {
            v &= 0xf7;
        } else if resolution >= base / 4 {
            v &= 0xef;
        } else {
            v |= 0x10;
        }
    }
    dev.write_register(REG32, v | REG32_GPIO10)
}

/// Interleave one channel's coefficients into a bank: each sensor segment
/// gets `pixels` bytes, filled from the source segment `order` maps it to.
fn segment_coefficients(
    data: &[u8],
    base: usize,
    pixels: usize,
    factor: usize,
    segcnt: usize,
    order: &[usize],
) -> Vec<u8> {
    let mut out = vec![0u8; pixels * order.len()];
    for (slot, x) in (0..pixels).step_by(4 * factor.max(1)).enumerate() {
        for (dst_seg, &src_seg) in order.iter().enumerate() {
            let src = base + x + segcnt * src_seg;
            let dst = slot * 4 + pixels * dst_seg;
            if let (Some(bytes), Some(target)) = (data.get(src..src + 4), out.get_mut(dst..dst + 4)) {
                target.copy_from_slice(bytes);
            }
        }
    }
    out
}

fn calibration_params(xres: u32, pixels: u32, lines: u32, depth: u32) -> ScanSessionParams {
    ScanSessionParams {
        xres,
        yres: xres,
        startx: 0,
        starty: 0,
        pixels,
        lines,
        depth,
        channels: 3,
        scan_mode: ScanMode::Color,
        color_filter: ColorFilter::Red,
        flags: CALIBRATION_FLAGS,
    }
}

impl Gl124 {
    fn frontend_is_ti(dev: &mut Device) -> Result<bool> {
        Ok((dev.read_register(REG0A)? & REG0A_SIFSEL) >> REG0A_SIFSEL_SHIFT == SIFSEL_TI)
    }

    fn setup_sensor(dev: &mut Device, regs: &mut RegisterSet, dpihw: u32, divisor: u32) -> Result<()> {
        let tables = Arc::clone(&dev.tables);
        let sensor = &tables.sensor;
        for reg in &sensor.custom_regs {
            if SENSOR_TIMING.iter().any(|r| r.contains(&reg.address)) {
                regs.apply(reg)?;
            }
        }
        let profile = get_sensor_profile(&tables.sensor_profiles, sensor, dpihw, divisor)?;
        for reg in &profile.registers {
            regs.apply(reg)?;
        }
        let exposure = if dev.exposure.iter().all(|&e| e == 0) {
            profile.exposure.as_array()
        } else {
            dev.exposure
        };
        regs.set_exposure(&LAYOUT, exposure)?;
        dev.segment_order.clone_from(&profile.segment_order);
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn init_optical_regs(
        &self,
        dev: &mut Device,
        regs: &mut RegisterSet,
        exposure_time: u32,
        used_res: u32,
        session: &ScanSession,
    ) -> Result<()> {
        let tables = Arc::clone(&dev.tables);
        let sensor = &tables.sensor;
        let p = &session.params;
        let cpp = sensor.ccd_pixels_per_system_pixel.max(1);
        let divisor = session.ccd_size_divisor.max(1);

        let dpihw = sensor.register_hwdpi(used_res * cpp);
        let factor = (sensor.optical_res / dpihw).max(1);
        Self::setup_sensor(dev, regs, dpihw, divisor)?;

        let dpiset = used_res * cpp;
        let startx = p.startx / cpp;
        let endx = startx + session.optical_pixels / cpp;
        let (startx, endx) = (startx / factor, endx / factor);
        let used_pixels = endx - startx;

        self.set_fe(dev, FrontendAction::Set)?;

        regs.clear_bits(REG01, REG01_SCAN)?;
        if p.flags.contains(ScanFlags::DISABLE_SHADING) || tables.model.no_calibration {
            regs.clear_bits(REG01, REG01_DVDSET)?;
        } else {
            regs.set_bits(REG01, REG01_DVDSET)?;
        }

        if !is_lide120(&tables) && used_res >= 600 {
            regs.clear_bits(REG03, REG03_AVEENB)?;
        } else {
            regs.set_bits(REG03, REG03_AVEENB)?;
        }
        let lamp_on = !p.flags.contains(ScanFlags::DISABLE_LAMP);
        let exposure = regs.get_exposure(&LAYOUT)?;
        scan::set_lamp_power(regs, &LAYOUT, lamp_on, exposure)?;

        let threshold = dev.settings.threshold;
        dev.write_register(REG_THRESHOLD_HI, threshold)?;
        dev.write_register(REG_THRESHOLD_LO, threshold)?;

        let mut r04 = regs.get8(REG04)?;
        match p.depth {
            1 => r04 = (r04 & !REG04_BITSET) | REG04_LINEART,
            8 => r04 &= !(REG04_LINEART | REG04_BITSET),
            _ => r04 = (r04 & !REG04_LINEART) | REG04_BITSET,
        }
        r04 &= !REG04_FILTER;
        if p.channels == 1 {
            r04 |= match p.color_filter {
                ColorFilter::Red => 0x10,
                ColorFilter::Blue => 0x30,
                ColorFilter::Green | ColorFilter::None => 0x20,
            };
        }
        regs.set8(REG04, r04)?;

        scan::set_dpihw(regs, dpihw)?;
        if p.flags.contains(ScanFlags::DISABLE_GAMMA) {
            regs.clear_bits(REG05, REG05_GMMENB)?;
        } else {
            regs.set_bits(REG05, REG05_GMMENB)?;
        }

        regs.set_field(&LAYOUT, Field::Dpiset, dpiset * divisor)?;
        regs.set_bits(REG06, REG06_GAIN4)?;

        if tables.model.is_cis {
            regs.clear_bits(REG60, REG60_LEDADD)?;
            regs.clear_bits(REG01, REG01_TRUEGRAY)?;
            if session.enable_ledadd {
                regs.set_bits(REG60, REG60_LEDADD)?;
                let max = regs.get_exposure(&LAYOUT)?.into_iter().max().unwrap_or(0);
                regs.set_exposure(&LAYOUT, [max; 3])?;
                regs.set_bits(REG01, REG01_TRUEGRAY)?;
                for reg in [REG_TRUER, REG_TRUEG, REG_TRUEB] {
                    dev.write_register(reg, 0x80)?;
                }
            }
        }

        let segnb = u32::from(regs.get8(REG98)? & 0x0f).max(1);
        let segcnt = regs.get_field(&LAYOUT, Field::Segcnt)?;
        regs.set_field(&LAYOUT, Field::Strpixel, startx / segnb)?;
        let endpixel = if endx / segnb == segcnt { 0 } else { endx / segnb };
        regs.set_field(&LAYOUT, Field::Endpixel, endpixel)?;

        let channel_bytes = multiply_by_depth_ceil(u64::from(used_pixels) * u64::from(dpiset) / u64::from(dpihw), p.depth);
        let words_per_line = channel_bytes * u64::from(p.channels);
        regs.set_field(&LAYOUT, Field::Maxwd, words_per_line as u32)?;
        regs.set_field(&LAYOUT, Field::Lperiod, exposure_time)?;
        regs.set_field(&LAYOUT, Field::Dummy, sensor.dummy_pixel)?;
        tracing::debug!(dpihw, dpiset, startx, endx, segnb, words_per_line, "optical registers");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn init_motor_regs(
        &self,
        dev: &mut Device,
        regs: &mut RegisterSet,
        exposure: u32,
        scan_yres: u32,
        step_type: u8,
        scan_lines: u32,
        feed_steps: u32,
        color: bool,
        flags: MotorFlags,
    ) -> Result<()> {
        let tables = Arc::clone(&dev.tables);
        let motor = &tables.motor;
        let factor = 1;

        // the motor stalls below this speed; skip lines instead
        let min_speed = if !color && motor.id == "canon-lide-110-motor" { 600 } else { 900 };
        let mut yres = scan_yres.max(1);
        let mut linesel = 0;
        if yres < min_speed {
            linesel = min_speed / yres - 1;
            yres = min_speed;
            if linesel == 0 {
                linesel = 1;
                yres = scan_yres * 2;
            }
        }
        regs.set_field(&LAYOUT, Field::Lincnt, scan_lines * (linesel + 1))?;

        let mut r02 = scan::REG02_NOTHOME;
        if flags.contains(MotorFlags::AUTO_GO_HOME) {
            r02 |= scan::REG02_AGOHOME;
        }
        if flags.contains(MotorFlags::DISABLE_BUFFER_FULL_MOVE) || yres >= tables.sensor.optical_res {
            r02 |= scan::REG02_ACDCDIS;
        }
        regs.set8(REG02, r02)?;
        scan::set_motor_power(regs, true)?;
        regs.set_field(&LAYOUT, Field::Scanfed, 4)?;

        let scan_table = slope::slope_table(
            yres,
            exposure,
            motor.base_ydpi,
            step_type,
            factor,
            &motor.id,
            &tables.motor_profiles,
        )?;
        let scan_entries = scan_table.steps as usize;
        self.send_slope_table(dev, SlopeSlot::Scan, scan_table.head(scan_entries))?;
        self.send_slope_table(dev, SlopeSlot::Backtrack, scan_table.head(scan_entries))?;
        regs.set_field(&LAYOUT, Field::Stepno, scan_table.steps)?;

        let fast_table = slope::slope_table(
            yres,
            exposure,
            motor.base_ydpi,
            step_type,
            factor,
            &motor.id,
            &tables.motor_profiles,
        )?;
        let fast_entries = fast_table.steps as usize;
        self.send_slope_table(dev, SlopeSlot::Stop, fast_table.head(fast_entries))?;
        self.send_slope_table(dev, SlopeSlot::Fast, fast_table.head(fast_entries))?;
        regs.set_field(&LAYOUT, Field::Fastno, fast_table.steps)?;
        regs.set_field(&LAYOUT, Field::Fshdec, fast_table.steps)?;
        regs.set_field(&LAYOUT, Field::Fmovno, fast_table.steps)?;

        let mut dist = scan_table.steps;
        if flags.contains(MotorFlags::FEED) {
            dist *= 2;
        }
        let feedl = (feed_steps << step_type).saturating_sub(dist);
        regs.set_field(&LAYOUT, Field::Feedl, feedl)?;

        let (z1, z2) = slope::zmod(false, exposure, &scan_table.table, scan_table.steps, feedl, scan_table.steps);
        regs.set_field(&LAYOUT, Field::Z1mod, z1)?;
        regs.set_field(&LAYOUT, Field::Z2mod, z2)?;

        regs.set8_mask(REG1D, linesel as u8, REG1D_LINESEL)?;
        regs.set8(REGA0, step_type | (step_type << REGA0_FSTPSEL_SHIFT))?;
        regs.set_field(&LAYOUT, Field::Fmovdec, fast_table.steps)?;
        tracing::debug!(
            yres,
            linesel,
            step_type,
            scan_steps = scan_table.steps,
            feedl,
            z1,
            z2,
            "motor registers"
        );
        Ok(())
    }

    /// Registers for a move at the lowest resolution.
    fn move_regs(
        &self,
        dev: &mut Device,
        dpi: u32,
        startx: u32,
        starty: u32,
        lines: u32,
        channels: u32,
        flags: ScanFlags,
    ) -> Result<RegisterSet> {
        let params = ScanSessionParams {
            xres: dpi,
            yres: dpi,
            startx,
            starty,
            pixels: 100,
            lines,
            depth: 8,
            channels,
            scan_mode: if channels == 1 { ScanMode::Gray } else { ScanMode::Color },
            color_filter: ColorFilter::Red,
            flags,
        };
        let session = self.compute_session(dev, &params)?;
        let mut regs = dev.reg.clone();
        self.init_scan_regs(dev, &mut regs, &session)?;
        Ok(regs)
    }
}

impl CommandSet for Gl124 {
    fn name(&self) -> &'static str {
        "gl124"
    }

    fn asic(&self) -> AsicType {
        AsicType::Gl124
    }

    fn layout(&self) -> &'static RegisterLayout {
        &LAYOUT
    }

    fn session_rules(&self) -> SessionRules {
        SessionRules {
            asic: AsicType::Gl124,
            ccd_size_divisor,
            even_optical_pixels: true,
            lines_per_read: 16,
            bulk_max: 0xeff0,
            no_16bit_gamma: false,
        }
    }

    // ── boot ──────────────────────────────────────────────────────────────

    fn init_registers(&self, dev: &mut Device) -> Result<()> {
        let mut regs = RegisterSet::new();
        for &(address, value) in BOOT_REGISTERS {
            regs.init(address, value)?;
        }
        if is_lide120(&dev.tables) {
            regs.set8(0x0c, 0x12)?;
            regs.set8(0x71, 0x00)?;
        }
        scan::set_dpihw(&mut regs, dev.tables.sensor.optical_res)?;
        dev.calib_reg = regs.clone();
        dev.reg = regs;
        Ok(())
    }

    fn asic_boot(&self, dev: &mut Device, cold: bool) -> Result<()> {
        if cold {
            dev.write_register(REG0E, 0x01)?;
            dev.write_register(REG0E, 0x00)?;
        }
        // USB side power and clock
        dev.write_register(REG36, 0x01)?;
        let v = dev.read_register(REG33)?;
        dev.write_register(REG33, v | 0x01)?;

        if dev.read_register(LAYOUT.scan_state)? & REG100_CHKVER != 0 {
            let version = dev.read_register(0x00)?;
            tracing::debug!(version, "ASIC version");
        }

        self.init_registers(dev)?;
        dev.restore_registers()?;

        dev.write_register(REG0B, REG0B_30MHZ | REG0B_ENBDRAM | REG0B_64M)?;
        dev.reg.remove(REG0B);

        dev.reg.init_or_set(REG08, REG08_CIS_LINE);
        dev.write_register(REG08, REG08_CIS_LINE)?;

        let tables = Arc::clone(&dev.tables);
        if let Some(gpio) = &tables.gpio {
            for reg in &gpio.registers {
                dev.write_overlay(reg)?;
            }
        }
        if let Some(layout) = &tables.memory_layout {
            for reg in &layout.registers {
                dev.write_overlay(reg)?;
            }
        }
        dev.write_register(REGF8, 0x01)?;
        tracing::debug!(cold, "gl124 booted");
        Ok(())
    }

    fn set_fe(&self, dev: &mut Device, action: FrontendAction) -> Result<()> {
        if !Self::frontend_is_ti(dev)? {
            return Err(GenesysError::NotSupported {
                operation: "set_fe",
                asic: AsicType::Gl124,
            }
            .into());
        }
        expect_kind(&dev.frontend, FrontendKind::Ti, AsicType::Gl124)?;
        if action == FrontendAction::PowerSave {
            tracing::debug!("frontend power save not supported");
            return Ok(());
        }
        if action == FrontendAction::Init {
            dev.frontend = dev.frontend_initial.clone();
        }

        let fe = dev.frontend.clone();
        // open the DAC for writing
        dev.write_fe_data(0x00, 0x80)?;
        for address in 1..4u8 {
            dev.write_fe_data(address, fe.value(address))?;
        }
        dev.write_fe_data(0x04, 0x00)?;
        for ch in 0..3u8 {
            dev.write_fe_data(0x05 + ch, fe.value(0x24 + ch))?;
        }
        dev.write_fe_data(0x00, fe.close_value.unwrap_or(0x11))
    }

    fn set_powersaving(&self, dev: &mut Device, minutes: u32) -> Result<()> {
        tracing::debug!(minutes, "power saving delay");
        let delay = minutes.min(u32::from(REG03_LAMPTIM)) as u8;
        dev.reg.set8_mask(REG03, delay, REG03_LAMPTIM)
    }

    // ── scan registers ────────────────────────────────────────────────────

    fn send_slope_table(&self, dev: &mut Device, slot: SlopeSlot, table: &[u16]) -> Result<()> {
        let address = AHB_BASE + AHB_SLOPE_STRIDE * u32::from(slot.index());
        tracing::trace!(?slot, entries = table.len(), address = format_args!("{address:#x}"), "slope table");
        dev.write_ahb(address, &slope::to_le_bytes(table))
    }

    fn init_scan_regs(&self, dev: &mut Device, regs: &mut RegisterSet, session: &ScanSession) -> Result<()> {
        let p = &session.params;
        let tables = Arc::clone(&dev.tables);
        let sensor = &tables.sensor;
        let is_cis = tables.model.is_cis;
        let divisor = session.ccd_size_divisor.max(1);

        let used_res = if p.flags.contains(ScanFlags::USE_OPTICAL_RES) || p.xres > sensor.optical_res {
            sensor.optical_res / divisor
        } else {
            p.xres
        };
        let slope_dpi = if is_cis { p.yres * p.channels } else { p.yres };

        let (exposure_time, step_type) = if p.flags.contains(ScanFlags::FEEDING) {
            (MOVE_EXPOSURE, 0)
        } else {
            let dpihw = sensor.register_hwdpi(used_res);
            let lperiod = get_sensor_profile(&tables.sensor_profiles, sensor, dpihw, divisor)?.exposure_lperiod;
            let step = slope::compute_step_type(&tables.motor_profiles, &tables.motor.id, lperiod)?;
            (lperiod, step)
        };

        self.init_optical_regs(dev, regs, exposure_time, used_res, session)?;

        let mut mflags = MotorFlags::empty();
        if p.flags.contains(ScanFlags::DISABLE_BUFFER_FULL_MOVE) {
            mflags |= MotorFlags::DISABLE_BUFFER_FULL_MOVE;
        }
        if p.flags.contains(ScanFlags::FEEDING) {
            mflags |= MotorFlags::FEED;
        }
        let scan_lines = if is_cis {
            session.output_line_count * p.channels
        } else {
            session.output_line_count
        };
        self.init_motor_regs(
            dev,
            regs,
            exposure_time,
            slope_dpi,
            step_type,
            scan_lines,
            p.starty,
            p.channels == 3,
            mflags,
        )?;

        dev.current_setup = CurrentSetup {
            pixels: session.output_pixels,
            lines: session.output_line_count,
            depth: p.depth,
            channels: p.channels,
            exposure_time,
            xres: used_res,
            yres: p.yres,
            ccd_size_divisor: divisor,
            stagger: session.num_staggered_lines,
            max_shift: session.max_shift(),
        };
        dev.total_bytes_read = 0;
        dev.total_bytes_to_read = session.total_bytes_to_read;
        Ok(())
    }

    fn calculate_current_setup(&self, dev: &mut Device) -> Result<CurrentSetup> {
        let tables = Arc::clone(&dev.tables);
        let sensor = &tables.sensor;
        let s = dev.settings;
        let divisor = ccd_size_divisor(sensor, s.xres);
        let start = mm_to_units(tables.model.x_offset_mm + s.tl_x_mm, sensor.optical_res) / divisor;
        let params = ScanSessionParams {
            xres: s.xres,
            yres: s.yres,
            startx: start,
            starty: 0,
            pixels: s.pixels,
            lines: s.lines,
            depth: s.depth,
            channels: s.channels(),
            scan_mode: s.scan_mode,
            color_filter: s.color_filter,
            flags: ScanFlags::empty(),
        };
        let session = self.compute_session(dev, &params)?;
        let used_res = s.xres.min(sensor.optical_res / divisor);
        let dpihw = sensor.register_hwdpi(used_res);
        let setup = CurrentSetup {
            pixels: session.output_pixels,
            lines: session.output_line_count,
            depth: s.depth,
            channels: s.channels(),
            exposure_time: get_sensor_profile(&tables.sensor_profiles, sensor, dpihw, divisor)?.exposure_lperiod,
            xres: used_res,
            yres: s.yres,
            ccd_size_divisor: divisor,
            stagger: session.num_staggered_lines,
            max_shift: session.max_shift(),
        };
        dev.current_setup = setup;
        Ok(setup)
    }

    fn init_regs_for_coarse_calibration(&self, dev: &mut Device, regs: &mut RegisterSet) -> Result<()> {
        let sensor = &dev.tables.sensor;
        let s = dev.settings;
        let params = ScanSessionParams {
            xres: s.xres,
            yres: s.yres,
            startx: 0,
            starty: 0,
            pixels: sensor.optical_res / sensor.ccd_pixels_per_system_pixel.max(1),
            lines: 20,
            depth: 16,
            channels: s.channels(),
            scan_mode: s.scan_mode,
            color_filter: s.color_filter,
            flags: CALIBRATION_FLAGS | ScanFlags::FEEDING,
        };
        let session = self.compute_session(dev, &params)?;
        self.init_scan_regs(dev, regs, &session)?;
        scan::set_motor_power(regs, false)?;
        dev.write_registers(regs)
    }

    fn init_regs_for_shading(&self, dev: &mut Device, regs: &mut RegisterSet) -> Result<ScanSession> {
        *regs = dev.reg.clone();
        let tables = Arc::clone(&dev.tables);
        let sensor = &tables.sensor;
        let dpihw = sensor.register_hwdpi(dev.settings.xres);
        let divisor = ccd_size_divisor(sensor, dev.settings.xres);
        let mut lines = tables.model.shading_lines;
        if dpihw >= 2400 {
            lines *= 2;
        }
        let resolution = dpihw / divisor;
        let lines = lines / divisor;
        let pixels = sensor.sensor_pixels / (sensor.optical_res / resolution).max(1);
        let travel = if dev.settings.yres >= 1200 {
            mm_to_units(tables.model.y_offset_calib_white_mm, tables.motor.base_ydpi / 4)
        } else {
            0
        };
        let params = ScanSessionParams {
            xres: resolution,
            yres: resolution,
            startx: 0,
            starty: travel,
            pixels,
            lines,
            depth: 16,
            channels: 3,
            scan_mode: ScanMode::Color,
            color_filter: ColorFilter::Red,
            flags: ScanFlags::DISABLE_SHADING
                | ScanFlags::DISABLE_GAMMA
                | ScanFlags::DISABLE_BUFFER_FULL_MOVE
                | ScanFlags::IGNORE_LINE_DISTANCE,
        };
        let session = self.compute_session(dev, &params)?;
        self.init_scan_regs(dev, regs, &session)?;
        scan::set_motor_power(regs, false)?;
        dev.write_registers(regs)?;
        dev.scanhead_position_in_steps += lines + travel;
        Ok(session)
    }

    fn init_regs_for_scan(&self, dev: &mut Device) -> Result<ScanSession> {
        let tables = Arc::clone(&dev.tables);
        let sensor = &tables.sensor;
        let s = dev.settings;
        let move_dpi = tables.motor.base_ydpi / 4;
        let mut travel = mm_to_units(tables.model.y_offset_mm + s.tl_y_mm, move_dpi);

        if s.channels() * s.yres >= 600 && travel > 700 {
            self.feed(dev, travel - 500)?;
            travel = 500;
        }

        let divisor = ccd_size_divisor(sensor, s.xres);
        let start = mm_to_units(tables.model.x_offset_mm + s.tl_x_mm, sensor.optical_res) / divisor;
        let mut flags = ScanFlags::empty();
        if s.scan_mode == ScanMode::Lineart {
            flags |= ScanFlags::DYNAMIC_LINEART;
        }
        let params = ScanSessionParams {
            xres: s.xres,
            yres: s.yres,
            startx: start,
            starty: travel,
            pixels: s.pixels,
            lines: s.lines,
            depth: s.depth,
            channels: s.channels(),
            scan_mode: s.scan_mode,
            color_filter: s.color_filter,
            flags,
        };
        let session = self.compute_session(dev, &params)?;
        let mut regs = std::mem::take(&mut dev.reg);
        let result = self.init_scan_regs(dev, &mut regs, &session);
        dev.reg = regs;
        result?;
        dev.session = Some(session.clone());
        Ok(session)
    }

    fn send_shading_data(&self, dev: &mut Device, data: &[u8]) -> Result<()> {
        let sensor = &dev.tables.sensor;
        let length = data.len() / 3;
        let strpixel = dev.reg.get_field(&LAYOUT, Field::Strpixel)?;
        let segcnt = dev.reg.get_field(&LAYOUT, Field::Segcnt)?;
        let mut endpixel = dev.reg.get_field(&LAYOUT, Field::Endpixel)?;
        if endpixel == 0 {
            endpixel = segcnt;
        }
        let dpiset = dev.reg.get_field(&LAYOUT, Field::Dpiset)?.max(1);
        let factor = (sensor.register_hwdpi(dpiset) / dpiset).max(1) as usize;
        let segnb = usize::from(dev.reg.get8(REG98)? & 0x0f).max(1);
        let order: Vec<usize> = if dev.segment_order.len() == segnb {
            dev.segment_order.clone()
        } else {
            (0..segnb).collect()
        };

        // two 16-bit words per pixel
        let (strpixel, endpixel, segcnt) = (strpixel as usize * 4, endpixel as usize * 4, segcnt as usize * 4);
        let pixels = endpixel.saturating_sub(strpixel);

        for ch in 0..3usize {
            let buffer = segment_coefficients(data, strpixel + ch * length, pixels, factor, segcnt, &order);
            let bank = dev.read_register(REG_SHADING_BANK + ch as u16)?;
            let address = u32::from(bank) * AHB_SHADING_UNIT + AHB_BASE;
            dev.write_ahb(address, &buffer)?;
        }
        tracing::debug!(pixels, factor, segnb, "shading data sent");
        Ok(())
    }

    // ── motion ────────────────────────────────────────────────────────────

    fn begin_scan(&self, dev: &mut Device, regs: &mut RegisterSet, start_motor: bool) -> Result<()> {
        let yres = dev.settings.yres;
        setup_scan_gpio(dev, yres)?;
        scan::begin_acquisition(dev, regs, start_motor)
    }

    fn stop_action(&self, dev: &mut Device) -> Result<()> {
        homsnr_gpio(dev)?;
        scan::stop_motor(dev, &LAYOUT)
    }

    fn slow_back_home(&self, dev: &mut Device, wait_until_home: bool) -> Result<()> {
        homsnr_gpio(dev)?;
        if scan::head_at_home(dev, &LAYOUT)? {
            dev.scanhead_position_in_steps = 0;
            return Ok(());
        }
        let dpi = dev.tables.model.lowest_dpi();
        let regs = self.move_regs(dev, dpi, 100, 30_000, 100, 1, MOVE_FLAGS)?;
        setup_scan_gpio(dev, dpi)?;
        scan::run_home_move(dev, self, regs, wait_until_home)
    }

    fn feed(&self, dev: &mut Device, steps: u32) -> Result<()> {
        tracing::debug!(steps, "feed");
        let dpi = dev.tables.model.lowest_ydpi();
        let flags = MOVE_FLAGS | ScanFlags::FEEDING | ScanFlags::DISABLE_BUFFER_FULL_MOVE;
        let mut regs = self.move_regs(dev, dpi, 0, steps, 3, 3, flags)?;
        regs.set_exposure(&LAYOUT, [0; 3])?;
        scan::run_feed_move(dev, self, regs)?;
        dev.scanhead_position_in_steps += steps;
        Ok(())
    }

    fn search_start_position(&self, dev: &mut Device) -> Result<()> {
        let dpi = 300;
        let pixels = 600;
        let lines = dev.tables.model.search_lines;
        let params = ScanSessionParams {
            xres: dpi,
            yres: dpi,
            startx: 0,
            starty: 0,
            pixels,
            lines,
            depth: 8,
            channels: 1,
            scan_mode: ScanMode::Gray,
            color_filter: ColorFilter::Green,
            flags: MOVE_FLAGS | ScanFlags::DISABLE_BUFFER_FULL_MOVE,
        };
        let session = self.compute_session(dev, &params)?;
        let mut regs = dev.reg.clone();
        self.init_scan_regs(dev, &mut regs, &session)?;
        let data = calibration::scan_frame(dev, self, &mut regs, (pixels * lines) as usize)?;
        dev.reg = regs;
        dev.reference_point = Some(calibration::search_reference_point(
            &data,
            pixels as usize,
            lines as usize,
            dpi,
        ));
        Ok(())
    }

    /// Reverse until the motor flag drops.
    fn rewind(&self, dev: &mut Device) -> Result<()> {
        let r02 = dev.read_register(REG02)?;
        dev.write_register(REG02, r02 | scan::REG02_MTRREV)?;
        dev.reg.init_or_set(REG02, r02 | scan::REG02_MTRREV);

        let mut regs = dev.reg.clone();
        self.begin_scan(dev, &mut regs, true)?;
        let mut stopped = false;
        for _ in 0..dev.timeouts.poll_retries {
            dev.sleep_ms(dev.timeouts.poll_interval_ms);
            dev.read_status(&LAYOUT)?;
            if !dev.read_scan_state(&LAYOUT)?.contains(ScanStateBits::MOTMFLG) {
                stopped = true;
                break;
            }
        }
        self.end_scan(dev, &mut regs, true)?;

        let r02 = dev.read_register(REG02)? & !scan::REG02_MTRREV;
        dev.write_register(REG02, r02)?;
        dev.reg.init_or_set(REG02, r02);
        if stopped {
            Ok(())
        } else {
            Err(GenesysError::io("timeout while rewinding").into())
        }
    }

    /// Scan a single line at 600 dpi to settle the head over the white strip.
    fn move_to_calibration_area(&self, dev: &mut Device) -> Result<()> {
        let sensor = &dev.tables.sensor;
        let resolution = 600;
        let pixels = sensor.sensor_pixels * resolution / sensor.optical_res;
        let params = calibration_params(resolution, pixels, 1, 8);
        let mut regs = dev.reg.clone();
        let session = self.compute_session(dev, &params)?;
        self.init_scan_regs(dev, &mut regs, &session)?;
        let size = (pixels * 3) as usize;
        calibration::scan_frame(dev, self, &mut regs, size)?;
        Ok(())
    }

    // ── calibration ───────────────────────────────────────────────────────

    fn offset_calibration(&self, dev: &mut Device, regs: &mut RegisterSet) -> Result<()> {
        if Self::frontend_is_ti(dev)? {
            tracing::debug!("TI frontend, skipping offset calibration");
            return Ok(());
        }
        let sensor = &dev.tables.sensor;
        let params = calibration_params(sensor.optical_res, sensor.sensor_pixels, 1, 8);
        let black = sensor.black_pixels as usize;
        calibration::calibrate_offset(dev, self, regs, &params, black)?;
        Ok(())
    }

    fn coarse_gain_calibration(&self, dev: &mut Device, regs: &mut RegisterSet, _dpi: u32) -> Result<()> {
        if Self::frontend_is_ti(dev)? {
            tracing::debug!("TI frontend, skipping coarse gain calibration");
            return Ok(());
        }
        let sensor = &dev.tables.sensor;
        let coeff = if dev.settings.xres < sensor.optical_res { 0.9 } else { 1.0 };
        let target = sensor.gain_white_ref as f32 * coeff;
        let params = calibration_params(sensor.optical_res, sensor.sensor_pixels, 1, 8);
        calibration::calibrate_coarse_gain(dev, self, regs, &params, target, |f: &Frame<'_>| f.central_means())?;
        self.slow_back_home(dev, true)
    }

    fn led_calibration(&self, dev: &mut Device, regs: &mut RegisterSet) -> Result<[u16; 3]> {
        self.move_to_calibration_area(dev)?;

        let tables = Arc::clone(&dev.tables);
        let sensor = &tables.sensor;
        let dpihw = sensor.register_hwdpi(dev.settings.xres);
        let divisor = ccd_size_divisor(sensor, dev.settings.xres);
        let resolution = dpihw / divisor;
        let profile = get_sensor_profile(&tables.sensor_profiles, sensor, dpihw, divisor)?;
        let pixels = sensor.sensor_pixels * resolution / sensor.optical_res;
        *regs = dev.reg.clone();
        let params = calibration_params(resolution, pixels, 1, 16);
        let policy = LedPolicy::Target {
            target: sensor.gain_white_ref * 256,
            tolerance_divisor: dev.tuning.led_tolerance_divisor,
        };
        let exposure = calibration::calibrate_led(dev, self, regs, &params, profile.exposure.as_array(), policy)?;

        dev.reg.set_exposure(&LAYOUT, exposure)?;
        dev.exposure = exposure;
        Ok(exposure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{FakeClock, MockTransport, device_for};
    use genesys_hardware::{SimProfile, SimulatedAsic};
    use rstest::rstest;

    fn booted_sim() -> (SimulatedAsic, Device) {
        let sim = SimulatedAsic::new(SimProfile::gl124());
        let mut dev = device_for("canon-lide-110", sim.clone(), &FakeClock::new()).unwrap();
        Gl124.asic_boot(&mut dev, true).unwrap();
        (sim, dev)
    }

    fn color_session(dev: &Device, xres: u32) -> ScanSession {
        let params = ScanSessionParams {
            xres,
            yres: xres,
            startx: 0,
            starty: 100,
            pixels: 2550,
            lines: 100,
            depth: 8,
            channels: 3,
            scan_mode: ScanMode::Color,
            color_filter: ColorFilter::Green,
            flags: ScanFlags::empty(),
        };
        Gl124.compute_session(dev, &params).unwrap()
    }

    #[test]
    fn boot_tunes_the_dram_clock_and_forgets_it() {
        let mock = MockTransport::new();
        let mut dev = device_for("canon-lide-110", mock.clone(), &FakeClock::new()).unwrap();
        Gl124.asic_boot(&mut dev, true).unwrap();

        let writes = mock.writes();
        assert_eq!(&writes[..2], &[(REG0E, 0x01), (REG0E, 0x00)]);
        assert!(writes.contains(&(REG0B, 0x2a)));
        assert!(!dev.reg.has(REG0B));
        assert_eq!(mock.register(0xd0), Some(0x0a));
        assert_eq!(mock.register(REG32), Some(0x59));
        assert_eq!(dev.reg.get8(REG08).unwrap(), REG08_CIS_LINE);
        // boot defaults disable averaging
        assert_eq!(dev.reg.get8(REG03).unwrap() & REG03_AVEENB, 0);
    }

    #[test]
    fn half_clock_below_300_dpi() {
        let db = genesys_config::builtin().unwrap();
        let sensor = db.sensor("cis-canon-lide-110").unwrap();
        assert_eq!(ccd_size_divisor(sensor, 150), 2);
        assert_eq!(ccd_size_divisor(sensor, 300), 2);
        assert_eq!(ccd_size_divisor(sensor, 600), 1);
    }

    #[test]
    fn scan_registers_match_the_session() {
        let (sim, mut dev) = booted_sim();
        let session = color_session(&dev, 300);
        let mut regs = dev.reg.clone();
        Gl124.init_scan_regs(&mut dev, &mut regs, &session).unwrap();

        // the DPISET register counts the full sensor clock
        assert_eq!(regs.get_field(&LAYOUT, Field::Dpiset).unwrap(), 600);
        assert_eq!(regs.get_field(&LAYOUT, Field::Lperiod).unwrap(), 2768);
        assert_eq!(regs.get8(REG05).unwrap() & scan::REG05_DPIHW, 0x00);
        assert_eq!(regs.get_exposure(&LAYOUT).unwrap(), [388, 574, 393]);
        assert_ne!(regs.get8(REG06).unwrap() & REG06_GAIN4, 0);
        assert_ne!(regs.get8(REG03).unwrap() & REG03_AVEENB, 0);
        assert_ne!(regs.get8(REG02).unwrap() & scan::REG02_NOTHOME, 0);
        assert_eq!(regs.get_field(&LAYOUT, Field::Scanfed).unwrap(), 4);
        assert_eq!(dev.current_setup.exposure_time, 2768);

        let uploads: Vec<u32> = sim.ahb_writes().iter().map(|(a, _)| *a).collect();
        assert_eq!(uploads, vec![0x1000_0000, 0x1000_4000, 0x1000_8000, 0x1000_c000]);
        assert_eq!(sim.register(REG_THRESHOLD_HI), dev.settings.threshold);
    }

    #[rstest]
    #[case(600, 0x00)]
    #[case(1200, 0x40)]
    #[case(2400, 0x80)]
    fn hardware_dpi_follows_the_resolution(#[case] xres: u32, #[case] bits: u8) {
        let (_sim, mut dev) = booted_sim();
        let session = color_session(&dev, xres);
        let mut regs = dev.reg.clone();
        Gl124.init_scan_regs(&mut dev, &mut regs, &session).unwrap();
        assert_eq!(regs.get8(REG05).unwrap() & scan::REG05_DPIHW, bits);
    }

    #[test]
    fn slow_moves_select_lines() {
        let (_sim, mut dev) = booted_sim();
        let params = ScanSessionParams {
            scan_mode: ScanMode::Gray,
            channels: 1,
            ..color_session(&dev, 150).params
        };
        let session = Gl124.compute_session(&dev, &params).unwrap();
        let mut regs = dev.reg.clone();
        Gl124.init_scan_regs(&mut dev, &mut regs, &session).unwrap();
        // 150 dpi times one CIS pass is below the 600 dpi floor of this motor
        assert_eq!(regs.get8(REG1D).unwrap() & REG1D_LINESEL, 3);
        assert_eq!(
            regs.get_field(&LAYOUT, Field::Lincnt).unwrap(),
            session.output_line_count * 4
        );
    }

    #[test]
    fn frontend_writes_close_with_the_model_value() {
        let (sim, mut dev) = booted_sim();
        Gl124.set_fe(&mut dev, FrontendAction::Init).unwrap();
        assert_eq!(sim.afe_register(0x00), Some(0x11));
        assert_eq!(sim.afe_register(0x02), Some(0x2f));
        assert_eq!(sim.afe_register(0x04), Some(0x00));
    }

    #[test]
    fn frontend_other_than_ti_is_rejected() {
        let mock = MockTransport::new();
        mock.set_register(REG0A, 0x40);
        let mut dev = device_for("canon-lide-110", mock, &FakeClock::new()).unwrap();
        let err = Gl124.set_fe(&mut dev, FrontendAction::Set).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GenesysError>(),
            Some(GenesysError::NotSupported { operation: "set_fe", .. })
        ));
    }

    #[test]
    fn offset_and_gain_are_skipped_on_ti_frontend() {
        let (sim, mut dev) = booted_sim();
        let before = sim.register_log().len();
        let mut regs = dev.reg.clone();
        Gl124.offset_calibration(&mut dev, &mut regs).unwrap();
        Gl124.coarse_gain_calibration(&mut dev, &mut regs, 300).unwrap();
        assert_eq!(sim.register_log().len(), before);
    }

    #[test]
    fn led_calibration_stores_the_exposure() {
        let (_sim, mut dev) = booted_sim();
        dev.settings.xres = 300;
        dev.settings.yres = 300;
        let mut regs = RegisterSet::new();
        let exposure = Gl124.led_calibration(&mut dev, &mut regs).unwrap();
        assert!(exposure.iter().all(|&e| e > 0));
        assert_eq!(dev.reg.get_exposure(&LAYOUT).unwrap(), exposure);
        assert_eq!(dev.exposure, exposure);
    }

    #[test]
    fn home_move_reaches_the_sensor() {
        let (sim, mut dev) = booted_sim();
        sim.move_head_away();
        Gl124.slow_back_home(&mut dev, true).unwrap();
        assert!(sim.is_at_home());
        assert_eq!(sim.motor_starts(), 1);
        assert_eq!(dev.scanhead_position_in_steps, 0);
        assert_ne!(sim.register(REG02) & scan::REG02_MTRREV, 0);
        // home sensor released after the move
        assert_eq!(sim.register(REG32) & REG32_GPIO10, 0);
    }

    #[test]
    fn feed_moves_forward_without_light() {
        let (sim, mut dev) = booted_sim();
        Gl124.feed(&mut dev, 1000).unwrap();
        assert_eq!(sim.motor_starts(), 1);
        assert!(!sim.is_at_home());
        assert_eq!(dev.scanhead_position_in_steps, 1000);
        assert_eq!(sim.register(REG01) & REG01_SCAN, 0);
        assert_eq!(sim.register(0x8a), 0);
    }

    #[test]
    fn rewind_runs_until_the_motor_stops() {
        let (sim, mut dev) = booted_sim();
        sim.move_head_away();
        Gl124.rewind(&mut dev).unwrap();
        assert!(sim.is_at_home());
        assert_eq!(sim.register(REG02) & scan::REG02_MTRREV, 0);
    }

    #[test]
    fn rewind_gives_up_on_a_stuck_motor() {
        let (sim, mut dev) = booted_sim();
        sim.move_head_away();
        sim.set_stuck_motor(true);
        dev.timeouts.poll_retries = 5;
        dev.timeouts.stop_retries = 2;
        assert!(Gl124.rewind(&mut dev).is_err());
    }

    #[test]
    fn power_saving_programs_the_lamp_timer() {
        let (_sim, mut dev) = booted_sim();
        Gl124.set_powersaving(&mut dev, 40).unwrap();
        assert_eq!(dev.reg.get8(REG03).unwrap() & REG03_LAMPTIM, 0x0f);
        Gl124.set_powersaving(&mut dev, 3).unwrap();
        assert_eq!(dev.reg.get8(REG03).unwrap() & REG03_LAMPTIM, 3);
    }

    #[test]
    fn shading_banks_follow_the_segment_order() {
        // four segments of 8 bytes, tagged with their index
        let segcnt = 8;
        let data: Vec<u8> = (0..4u8).flat_map(|s| [s; 8]).collect();
        let out = segment_coefficients(&data, 0, 8, 1, segcnt, &[0, 2, 1, 3]);
        assert_eq!(out.len(), 32);
        assert_eq!(&out[0..8], &[0; 8]);
        assert_eq!(&out[8..16], &[2; 8]);
        assert_eq!(&out[16..24], &[1; 8]);
        assert_eq!(&out[24..32], &[3; 8]);
    }

    #[test]
    fn reduced_coefficients_leave_the_tail_empty() {
        let data = vec![0xaa; 16];
        let out = segment_coefficients(&data, 0, 16, 2, 16, &[0]);
        assert_eq!(&out[0..8], &[0xaa; 8]);
        assert_eq!(&out[8..16], &[0; 8]);
    }

    #[test]
    fn shading_data_goes_to_the_channel_banks() {
        let (sim, mut dev) = booted_sim();
        dev.settings.xres = 600;
        dev.settings.yres = 600;
        dev.settings.pixels = 600;
        dev.settings.lines = 10;
        dev.settings.depth = 8;
        dev.settings.scan_mode = ScanMode::Color;
        Gl124.init_regs_for_scan(&mut dev).unwrap();
        let data = vec![0x11u8; 3 * 21000 * 4];
        let before = sim.ahb_writes().len();
        Gl124.send_shading_data(&mut dev, &data).unwrap();

        let writes = &sim.ahb_writes()[before..];
        let addresses: Vec<u32> = writes.iter().map(|(a, _)| *a).collect();
        assert_eq!(addresses, vec![0x1000_0000 + 0x0a * 8192, 0x1000_0000 + 0x15 * 8192, 0x1000_0000 + 0x20 * 8192]);
        assert!(writes.iter().all(|(_, d)| !d.is_empty()));
    }
}
