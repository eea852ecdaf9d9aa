//! GL847 command set (Canon LiDE 100/200).
//!
//! Slope tables and shading data go through the AHB window; the analog
//! frontend is an Analog Devices part selected by REG04 FESET.

use std::sync::Arc;

use genesys_config::{AsicType, FrontendKind};

use crate::calibration::{self, Frame, LedPolicy};
use crate::command_set::CommandSet;
use crate::device::{CurrentSetup, Device};
use crate::error::{GenesysError, Result};
use crate::frontend::{FrontendAction, expect_kind};
use crate::layout::{Field, RegisterLayout, loc};
use crate::register::RegisterSet;
use crate::scan::{self, REG01, REG01_DVDSET, REG01_SCAN, REG01_SHDAREA, REG02, REG03, REG03_AVEENB, REG05, REG05_GMMENB};
use crate::sensor::get_sensor_profile;
use crate::session::{ColorFilter, ScanMode, ScanSession, ScanSessionParams, SessionRules, default_ccd_size_divisor};
use crate::slope::{self, SlopeSlot};
use crate::status::{MotorFlags, ScanFlags, StatusBits};
use crate::tables::DeviceTables;
use crate::util::{mm_to_units, multiply_by_depth_ceil};

const REG04: u16 = 0x04;
const REG04_LINEART: u8 = 0x80;
const REG04_BITSET: u8 = 0x40;
const REG04_AFEMOD: u8 = 0x30;
const REG04_FILTER: u8 = 0x0c;
const REG04_FESET: u8 = 0x03;
/// FESET value of the Analog Devices frontend.
const FESET_AD: u8 = 0x02;

const REG08: u16 = 0x08;
const REG08_CIS_LINE: u8 = 0x10;
const REG0B: u16 = 0x0b;
const REG0B_DRAMSEL: u8 = 0x07;
const REG0B_ENBDRAM: u8 = 0x08;
const REG0C: u16 = 0x0c;
const REG0C_CCDLMT: u8 = 0x0f;
const REG0E: u16 = 0x0e;
const REG1C: u16 = 0x1c;
const REG1C_TGTIME: u8 = 0x07;
const REG1E: u16 = 0x1e;
const REG1E_LINESEL: u8 = 0x0f;
const REG40_CHKVER: u8 = 0x10;
const REG60: u16 = 0x60;
const REG63: u16 = 0x63;
const STEPSEL_SHIFT: u32 = 16 + 5;
const REG67: u16 = 0x67;
const REG67_MTRPWM: u8 = 0x80;
const REG68: u16 = 0x68;
const REG68_FASTPWM: u8 = 0x80;
const REG6C: u16 = 0x6c;
const REG6C_GPIO13: u8 = 0x10;
const REG6C_GPIO10: u8 = 0x02;
const REG87: u16 = 0x87;
const REG87_LEDADD: u8 = 0x04;
const REG9D: u16 = 0x9d;
const REGF8: u16 = 0xf8;

/// Shading bank base registers, in 8 KiB units of AHB space.
const REG_SHADING_BANK: u16 = 0xd0;
const AHB_BASE: u32 = 0x1000_0000;
const AHB_SLOPE_STRIDE: u32 = 0x4000;
const AHB_SHADING_UNIT: u32 = 8192;

static LAYOUT: RegisterLayout = RegisterLayout {
    asic: AsicType::Gl847,
    status: 0x41,
    scan_state: 0x40,
    fields: &[
        (Field::ExpR, loc(0x10, 2)),
        (Field::ExpG, loc(0x12, 2)),
        (Field::ExpB, loc(0x14, 2)),
        (Field::Stepno, loc(0x21, 1)),
        (Field::Fwdstep, loc(0x22, 1)),
        (Field::Bwdstep, loc(0x23, 1)),
        (Field::Fastno, loc(0x24, 1)),
        (Field::Lincnt, loc(0x25, 3)),
        (Field::Dpiset, loc(0x2c, 2)),
        (Field::Strpixel, loc(0x30, 2)),
        (Field::Endpixel, loc(0x32, 2)),
        (Field::Dummy, loc(0x34, 1)),
        (Field::Maxwd, loc(0x35, 3)),
        (Field::Lperiod, loc(0x38, 2)),
        (Field::Feedl, loc(0x3d, 3)),
        (Field::Fmovdec, loc(0x5f, 1)),
        (Field::Z1mod, loc(0x60, 3)),
        (Field::Z2mod, loc(0x63, 3)),
        (Field::Fshdec, loc(0x69, 1)),
        (Field::Fmovno, loc(0x6a, 1)),
    ],
};

/// Power-on register defaults.
const BOOT_REGISTERS: &[(u16, u8)] = &[
    (0x01, 0x82), (0x02, 0x18), (0x03, 0x50), (0x04, 0x12), (0x05, 0x80), (0x06, 0x50),
    (0x08, 0x10), (0x09, 0x01), (0x0a, 0x00), (0x0b, 0x01), (0x0c, 0x02),
    (0x10, 0x00), (0x11, 0x00), (0x12, 0x00), (0x13, 0x00), (0x14, 0x00), (0x15, 0x00),
    (0x16, 0x10), (0x17, 0x08), (0x18, 0x00), (0x19, 0x50), (0x1a, 0x34), (0x1b, 0x00),
    (0x1c, 0x02), (0x1d, 0x04), (0x1e, 0x10), (0x1f, 0x04),
    (0x20, 0x02), (0x21, 0x10), (0x22, 0x7f), (0x23, 0x7f), (0x24, 0x10),
    (0x25, 0x00), (0x26, 0x00), (0x27, 0x00), (0x2c, 0x09), (0x2d, 0x60), (0x2e, 0x80), (0x2f, 0x80),
    (0x30, 0x00), (0x31, 0x10), (0x32, 0x15), (0x33, 0x0e), (0x34, 0x40), (0x35, 0x00),
    (0x36, 0x2a), (0x37, 0x30), (0x38, 0x2a), (0x39, 0xf8), (0x3d, 0x00), (0x3e, 0x00), (0x3f, 0x00),
    (0x52, 0x03), (0x53, 0x07), (0x54, 0x00), (0x55, 0x00), (0x56, 0x00), (0x57, 0x00),
    (0x58, 0x2a), (0x59, 0xe1), (0x5a, 0x55), (0x5e, 0x41), (0x5f, 0x40),
    (0x60, 0x00), (0x61, 0x21), (0x62, 0x40), (0x63, 0x00), (0x64, 0x21), (0x65, 0x40),
    (0x67, 0x80), (0x68, 0x80), (0x69, 0x20), (0x6a, 0x20),
    (0x74, 0x00), (0x75, 0x00), (0x76, 0x3c), (0x77, 0x00), (0x78, 0x00), (0x79, 0x9f),
    (0x7a, 0x00), (0x7b, 0x00), (0x7c, 0x55), (0x7d, 0x00),
    (0x87, 0x02), (0x9d, 0x06), (0xa2, 0x0f), (0xbd, 0x18), (0xbe, 0x00), (0xfe, 0x08),
    (0xc5, 0x00), (0xc6, 0x00), (0xc7, 0x00), (0xc8, 0x00), (0xc9, 0x00), (0xca, 0x00),
];

/// Sensor timing registers copied from the sensor table.
const SENSOR_TIMING: [std::ops::RangeInclusive<u16>; 2] = [0x16..=0x1d, 0x52..=0x5a];

const CALIBRATION_FLAGS: ScanFlags = ScanFlags::DISABLE_SHADING
    .union(ScanFlags::DISABLE_GAMMA)
    .union(ScanFlags::SINGLE_LINE)
    .union(ScanFlags::IGNORE_LINE_DISTANCE);

const MOVE_FLAGS: ScanFlags = ScanFlags::DISABLE_SHADING
    .union(ScanFlags::DISABLE_GAMMA)
    .union(ScanFlags::IGNORE_LINE_DISTANCE);

/// LED windows, 16-bit levels.
const LED_BOTTOM: [u32; 3] = [29_000; 3];
const LED_TOP: [u32; 3] = [41_000, 51_000, 51_000];

#[derive(Debug, Clone, Copy, Default)]
pub struct Gl847;

/// Motor step multiplier programmed in REG9D.
fn step_multiplier(regs: &RegisterSet) -> u32 {
    regs.get8(REG9D)
        .map_or(1, |v| 1 << ((v & 0x0f) >> 1))
}

/// Line period of the sensor profile serving `xres`.
fn exposure_lperiod(tables: &DeviceTables, xres: u32) -> Result<u32> {
    Ok(get_sensor_profile(&tables.sensor_profiles, &tables.sensor, xres, 1)?.exposure_lperiod)
}

/// Keep the home sensor readable after a move.
fn homsnr_gpio(dev: &mut Device) -> Result<()> {
    let v = dev.read_register(REG6C)?;
    dev.write_register(REG6C, v | REG6C_GPIO10)
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
        color_filter: ColorFilter::Green,
        flags: CALIBRATION_FLAGS,
    }
}

impl Gl847 {
    fn frontend_is_ad(dev: &mut Device) -> Result<bool> {
        Ok(dev.read_register(REG04)? & REG04_FESET == FESET_AD)
    }

    /// Copy sensor timing and the profile overlay into `regs`.
    fn setup_sensor(dev: &mut Device, regs: &mut RegisterSet, dpihw: u32) -> Result<()> {
        let tables = Arc::clone(&dev.tables);
        let sensor = &tables.sensor;
        for reg in &sensor.custom_regs {
            if SENSOR_TIMING.iter().any(|r| r.contains(&reg.address)) {
                regs.apply(reg)?;
            }
        }
        let profile = get_sensor_profile(&tables.sensor_profiles, sensor, dpihw, 1)?;
        for reg in &profile.registers {
            regs.apply(reg)?;
        }
        if dev.exposure.iter().all(|&e| e == 0) {
            dev.exposure = profile.exposure.as_array();
        }
        regs.set_exposure(&LAYOUT, dev.exposure)?;
        dev.segment_order.clone_from(&profile.segment_order);
        Ok(())
    }

    fn init_optical_regs(
        &self,
        dev: &mut Device,
        regs: &mut RegisterSet,
        exposure_time: u32,
        session: &ScanSession,
    ) -> Result<()> {
        let tables = Arc::clone(&dev.tables);
        let sensor = &tables.sensor;
        let p = &session.params;
        let cpp = sensor.ccd_pixels_per_system_pixel.max(1);

        let dpihw = sensor.register_hwdpi(p.xres * cpp);
        Self::setup_sensor(dev, regs, dpihw)?;

        let mut start = p.startx;
        if session.num_staggered_lines > 0 {
            start |= 1;
        }
        let startx = start + sensor.ccd_start_xoffset * cpp;
        let endx = startx + session.optical_pixels;
        let divisor = (session.hwdpi_divisor * session.segment_count).max(1);
        let (startx, endx) = (startx / divisor, endx / divisor);

        self.set_fe(dev, FrontendAction::Set)?;

        regs.clear_bits(REG01, REG01_SCAN)?;
        regs.set_bits(REG01, REG01_SHDAREA)?;
        if p.flags.contains(ScanFlags::DISABLE_SHADING) || tables.model.no_calibration {
            regs.clear_bits(REG01, REG01_DVDSET)?;
        } else {
            regs.set_bits(REG01, REG01_DVDSET)?;
        }

        regs.clear_bits(REG03, REG03_AVEENB)?;
        let lamp_on = !p.flags.contains(ScanFlags::DISABLE_LAMP);
        scan::set_lamp_power(regs, &LAYOUT, lamp_on, dev.exposure)?;

        regs.set8(0x2e, dev.settings.threshold)?;
        regs.set8(0x2f, dev.settings.threshold)?;

        let mut r04 = regs.get8(REG04)?;
        match p.depth {
            1 => r04 = (r04 & !REG04_BITSET) | REG04_LINEART,
            8 => r04 &= !(REG04_LINEART | REG04_BITSET),
            _ => r04 = (r04 & !REG04_LINEART) | REG04_BITSET,
        }
        r04 &= !(REG04_FILTER | REG04_AFEMOD);
        r04 |= if p.channels == 1 {
            match p.color_filter {
                ColorFilter::Red => 0x14,
                ColorFilter::Blue => 0x1c,
                ColorFilter::Green | ColorFilter::None => 0x18,
            }
        } else {
            0x10
        };
        regs.set8(REG04, r04)?;

        scan::set_dpihw(regs, dpihw)?;
        if p.flags.contains(ScanFlags::DISABLE_GAMMA) {
            regs.clear_bits(REG05, REG05_GMMENB)?;
        } else {
            regs.set_bits(REG05, REG05_GMMENB)?;
        }
        if tables.model.is_cis {
            regs.clear_bits(REG87, REG87_LEDADD)?;
            if session.enable_ledadd {
                regs.set_bits(REG87, REG87_LEDADD)?;
            }
        }

        let raw_channel_bytes =
            multiply_by_depth_ceil(u64::from(endx - startx) * u64::from(p.xres) / u64::from(dpihw), p.depth);
        let raw_line_bytes = raw_channel_bytes * u64::from(p.channels);

        regs.set_field(&LAYOUT, Field::Dpiset, p.xres * cpp)?;
        regs.set_field(&LAYOUT, Field::Strpixel, startx / cpp)?;
        regs.set_field(&LAYOUT, Field::Endpixel, endx / cpp)?;
        // MAXWD counts 4-byte words
        regs.set_field(&LAYOUT, Field::Maxwd, (raw_line_bytes >> 2) as u32)?;
        regs.set_field(&LAYOUT, Field::Lperiod, exposure_time)?;
        regs.set_field(&LAYOUT, Field::Dummy, sensor.dummy_pixel)?;
        tracing::debug!(dpihw, startx, endx, raw_line_bytes, "optical registers");
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
        scan_dummy: u32,
        feed_steps: u32,
        flags: MotorFlags,
    ) -> Result<()> {
        let tables = Arc::clone(&dev.tables);
        let motor = &tables.motor;
        let factor = step_multiplier(regs);

        regs.set_field(&LAYOUT, Field::Lincnt, scan_lines)?;

        let mut r02 = 0u8;
        if flags.contains(MotorFlags::AUTO_GO_HOME) {
            r02 |= scan::REG02_AGOHOME | scan::REG02_NOTHOME;
        }
        if flags.contains(MotorFlags::DISABLE_BUFFER_FULL_MOVE) || scan_yres >= tables.sensor.optical_res {
            r02 |= scan::REG02_ACDCDIS;
        }
        regs.set8(REG02, r02)?;
        scan::set_motor_power(regs, true)?;

        let scan_table = slope::slope_table(
            scan_yres,
            exposure,
            motor.base_ydpi,
            step_type,
            factor,
            &motor.id,
            &tables.motor_profiles,
        )?;
        let scan_entries = (scan_table.steps * factor) as usize;
        self.send_slope_table(dev, SlopeSlot::Scan, scan_table.head(scan_entries))?;
        self.send_slope_table(dev, SlopeSlot::Backtrack, scan_table.head(scan_entries))?;

        let fast_step_type = step_type.min(2);
        let mut fast_table = slope::slope_table(
            tables.model.lowest_ydpi(),
            exposure,
            motor.base_ydpi,
            fast_step_type,
            factor,
            &motor.id,
            &tables.motor_profiles,
        )?;
        // the first entry is too slow to start from
        fast_table.table[0] = fast_table.table[1];
        let fast_entries = (fast_table.steps * factor) as usize;
        for slot in [SlopeSlot::Stop, SlopeSlot::Fast, SlopeSlot::Home] {
            self.send_slope_table(dev, slot, fast_table.head(fast_entries))?;
        }

        let feedl = feed_steps << step_type;
        let mut dist = scan_table.steps * factor;
        if flags.contains(MotorFlags::FEED) {
            dist *= 2;
        }
        let feedl = feedl.saturating_sub(dist);
        regs.set_field(&LAYOUT, Field::Feedl, feedl)?;

        let ccdlmt = u32::from(regs.get8(REG0C)? & REG0C_CCDLMT) + 1;
        let tgtime = 1u32 << (regs.get8(REG1C)? & REG1C_TGTIME);

        // quarter step needs bipolar Vref2
        let effective = dev.read_register(REG6C)?;
        let val = match step_type {
            0 | 1 => effective,
            2 => effective & !REG6C_GPIO13,
            _ => effective | REG6C_GPIO13,
        };
        dev.write_register(REG6C, val)?;
        homsnr_gpio(dev)?;

        let min_restep = (scan_table.steps / 2).saturating_sub(1).max(1);
        regs.set_field(&LAYOUT, Field::Fwdstep, min_restep)?;
        regs.set_field(&LAYOUT, Field::Bwdstep, min_restep)?;

        let (z1, z2) = slope::zmod(
            false,
            exposure * ccdlmt * tgtime,
            &scan_table.table,
            scan_table.steps * factor,
            feedl,
            min_restep * factor,
        );
        regs.set24(REG60, z1 | (u32::from(step_type) << STEPSEL_SHIFT))?;
        regs.set24(REG63, z2 | (u32::from(step_type) << STEPSEL_SHIFT))?;

        regs.set8_mask(REG1E, scan_dummy as u8, REG1E_LINESEL)?;
        regs.set8(REG67, REG67_MTRPWM)?;
        regs.set8(REG68, REG68_FASTPWM)?;

        regs.set_field(&LAYOUT, Field::Stepno, scan_table.steps)?;
        regs.set_field(&LAYOUT, Field::Fastno, scan_table.steps)?;
        regs.set_field(&LAYOUT, Field::Fshdec, scan_table.steps)?;
        regs.set_field(&LAYOUT, Field::Fmovno, fast_table.steps)?;
        regs.set_field(&LAYOUT, Field::Fmovdec, fast_table.steps)?;
        tracing::debug!(
            step_type,
            factor,
            scan_steps = scan_table.steps,
            fast_steps = fast_table.steps,
            feedl,
            z1,
            z2,
            "motor registers"
        );
        Ok(())
    }

    /// Registers for a motionless move at the lowest resolution.
    fn move_regs(&self, dev: &mut Device, starty: u32, lines: u32, channels: u32, flags: ScanFlags) -> Result<RegisterSet> {
        let dpi = dev.tables.model.lowest_ydpi();
        let params = ScanSessionParams {
            xres: dpi,
            yres: dpi,
            startx: if channels == 1 { 100 } else { 0 },
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

impl CommandSet for Gl847 {
    fn name(&self) -> &'static str {
        "gl847"
    }

    fn asic(&self) -> AsicType {
        AsicType::Gl847
    }

    fn layout(&self) -> &'static RegisterLayout {
        &LAYOUT
    }

    fn session_rules(&self) -> SessionRules {
        SessionRules {
            asic: AsicType::Gl847,
            ccd_size_divisor: default_ccd_size_divisor,
            even_optical_pixels: false,
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
        if dev.read_register(LAYOUT.scan_state)? & REG40_CHKVER != 0 {
            let version = dev.read_register(0x00)?;
            tracing::debug!(version, "ASIC version");
        }

        self.init_registers(dev)?;
        dev.restore_registers()?;

        // rising edge on ENBDRAM
        let val = (dev.reg.get8(REG0B)? & REG0B_DRAMSEL) | REG0B_ENBDRAM;
        dev.write_register(REG0B, val)?;
        dev.reg.set8(REG0B, val)?;

        dev.reg.set8(REG08, REG08_CIS_LINE)?;
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
            // the clock/DRAM setting must not be rewritten by full writes
            dev.reg.remove(REG0B);
        }

        dev.reg.init_or_set(REGF8, 0x01);
        dev.write_register(REGF8, 0x01)?;
        tracing::debug!(cold, "gl847 booted");
        Ok(())
    }

    fn set_fe(&self, dev: &mut Device, action: FrontendAction) -> Result<()> {
        if !Self::frontend_is_ad(dev)? {
            return Err(GenesysError::NotSupported {
                operation: "set_fe",
                asic: AsicType::Gl847,
            }
            .into());
        }
        expect_kind(&dev.frontend, FrontendKind::AnalogDevices, AsicType::Gl847)?;
        if action == FrontendAction::PowerSave {
            tracing::debug!("frontend power save not supported");
            return Ok(());
        }
        if action == FrontendAction::Init {
            dev.frontend = dev.frontend_initial.clone();
        }

        let mut ready = false;
        for _ in 0..dev.timeouts.poll_retries {
            if !dev.read_status(&LAYOUT)?.contains(StatusBits::FEBUSY) {
                ready = true;
                break;
            }
            dev.sleep_ms(10);
        }
        if !ready {
            return Err(GenesysError::io("analog frontend stays busy").into());
        }

        dev.write_fe_data(0x00, 0x80)?;
        let fe = dev.frontend.clone();
        dev.write_fe_data(0x00, fe.value(0x00))?;
        dev.write_fe_data(0x01, fe.value(0x01))?;
        for ch in 0..3u8 {
            dev.write_fe_data(0x02 + ch, u16::from(fe.gain(usize::from(ch))))?;
        }
        for ch in 0..3u8 {
            dev.write_fe_data(0x05 + ch, u16::from(fe.offset(usize::from(ch))))?;
        }
        Ok(())
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
        let is_cis = tables.model.is_cis;

        // a CIS color line is three gray lines with the filter off
        let dummy = 3 - p.channels;
        let slope_dpi = if is_cis { p.yres * p.channels } else { p.yres } * (1 + dummy);

        let exposure_time = exposure_lperiod(&tables, p.xres)?;
        let step_type = slope::compute_step_type(&tables.motor_profiles, &tables.motor.id, exposure_time)?;

        self.init_optical_regs(dev, regs, exposure_time, session)?;

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
        self.init_motor_regs(dev, regs, exposure_time, slope_dpi, step_type, scan_lines, dummy, p.starty, mflags)?;

        dev.current_setup = CurrentSetup {
            pixels: session.output_pixels,
            lines: session.output_line_count,
            depth: p.depth,
            channels: p.channels,
            exposure_time,
            xres: p.xres,
            yres: p.yres,
            ccd_size_divisor: session.ccd_size_divisor,
            stagger: session.num_staggered_lines,
            max_shift: session.max_shift(),
        };
        dev.total_bytes_read = 0;
        dev.total_bytes_to_read = session.total_bytes_to_read;
        Ok(())
    }

    fn calculate_current_setup(&self, dev: &mut Device) -> Result<CurrentSetup> {
        let tables = Arc::clone(&dev.tables);
        let s = dev.settings;
        let start = mm_to_units(tables.model.x_offset_mm + s.tl_x_mm, tables.sensor.optical_res);
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
        let setup = CurrentSetup {
            pixels: session.output_pixels,
            lines: session.output_line_count,
            depth: s.depth,
            channels: s.channels(),
            exposure_time: exposure_lperiod(&tables, s.xres)?,
            xres: s.xres,
            yres: s.yres,
            ccd_size_divisor: session.ccd_size_divisor,
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
            flags: CALIBRATION_FLAGS,
        };
        let session = self.compute_session(dev, &params)?;
        self.init_scan_regs(dev, regs, &session)?;
        dev.write_registers(regs)
    }

    fn init_regs_for_shading(&self, dev: &mut Device, regs: &mut RegisterSet) -> Result<ScanSession> {
        *regs = dev.reg.clone();
        let tables = Arc::clone(&dev.tables);
        let sensor = &tables.sensor;
        let resolution = sensor.register_hwdpi(dev.settings.xres);
        let mut lines = tables.model.shading_lines;
        if resolution == 4800 {
            lines *= 2;
        }
        // short moves leave the motor no room to accelerate
        let starty = if resolution < 1200 { 40 } else { 1 };
        let params = ScanSessionParams {
            xres: resolution,
            yres: resolution,
            startx: 0,
            starty,
            pixels: sensor.sensor_pixels * resolution / sensor.optical_res,
            lines,
            depth: 16,
            channels: 3,
            scan_mode: ScanMode::Color,
            color_filter: dev.settings.color_filter,
            flags: ScanFlags::DISABLE_SHADING
                | ScanFlags::DISABLE_GAMMA
                | ScanFlags::DISABLE_BUFFER_FULL_MOVE
                | ScanFlags::IGNORE_LINE_DISTANCE,
        };
        let session = self.compute_session(dev, &params)?;
        self.init_scan_regs(dev, regs, &session)?;
        dev.write_registers(regs)?;
        // the head parks again after shading
        dev.scanhead_position_in_steps = 0;
        Ok(session)
    }

    fn init_regs_for_scan(&self, dev: &mut Device) -> Result<ScanSession> {
        let tables = Arc::clone(&dev.tables);
        let s = dev.settings;
        let move_dpi = tables.motor.base_ydpi;
        let mut travel = mm_to_units(tables.model.y_offset_mm + s.tl_y_mm, move_dpi)
            .saturating_sub(dev.scanhead_position_in_steps);

        // fast-feed most of a long move; the scan ramp covers the rest
        if s.channels() * s.yres >= 600 && travel > 700 {
            self.feed(dev, travel - 500)?;
            travel = 500;
        }

        let start = mm_to_units(tables.model.x_offset_mm + s.tl_x_mm, tables.sensor.optical_res);
        let mut flags = ScanFlags::DISABLE_BUFFER_FULL_MOVE;
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
        let endpixel = dev.reg.get_field(&LAYOUT, Field::Endpixel)?;
        let dpiset = dev.reg.get_field(&LAYOUT, Field::Dpiset)?.max(1);
        let dpihw = sensor.register_hwdpi(dpiset);
        let factor = (dpihw / dpiset).max(1) as usize;

        let pixels = endpixel.saturating_sub(strpixel) as usize;
        // SHDAREA: coefficients start at the sensor's first active pixel
        let strpixel = strpixel.saturating_sub(sensor.ccd_start_xoffset * 600 / sensor.optical_res) as usize;
        // two 16-bit words per pixel
        let (strpixel, bytes) = (strpixel * 4, pixels * 4);

        for ch in 0..3usize {
            let mut buffer = vec![0u8; bytes];
            let base = strpixel + ch * length;
            for (slot, x) in (0..bytes).step_by(4 * factor).enumerate() {
                if let Some(src) = data.get(base + x..base + x + 4) {
                    buffer[slot * 4..slot * 4 + 4].copy_from_slice(src);
                }
            }
            let bank = dev.read_register(REG_SHADING_BANK + ch as u16)?;
            let address = u32::from(bank) * AHB_SHADING_UNIT + AHB_BASE;
            dev.write_ahb(address, &buffer)?;
        }
        tracing::debug!(pixels, factor, "shading data sent");
        Ok(())
    }

    // ── motion ────────────────────────────────────────────────────────────

    fn begin_scan(&self, dev: &mut Device, regs: &mut RegisterSet, start_motor: bool) -> Result<()> {
        let v = dev.read_register(REG6C)?;
        dev.write_register(REG6C, v & !REG6C_GPIO10)?;
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
        let regs = self.move_regs(dev, 30_000, 100, 1, MOVE_FLAGS)?;
        scan::run_home_move(dev, self, regs, wait_until_home)
    }

    fn feed(&self, dev: &mut Device, steps: u32) -> Result<()> {
        tracing::debug!(steps, "feed");
        let mut regs = self.move_regs(dev, steps, 3, 3, MOVE_FLAGS | ScanFlags::FEEDING)?;
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
            flags: MOVE_FLAGS,
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

    // ── calibration ───────────────────────────────────────────────────────

    fn offset_calibration(&self, dev: &mut Device, regs: &mut RegisterSet) -> Result<()> {
        if Self::frontend_is_ad(dev)? {
            tracing::debug!("frontend has no programmable offset, skipping offset calibration");
            return Ok(());
        }
        let sensor = &dev.tables.sensor;
        let params = calibration_params(sensor.optical_res, sensor.sensor_pixels, 1, 8);
        let black = sensor.black_pixels as usize;
        calibration::calibrate_offset(dev, self, regs, &params, black)?;
        Ok(())
    }

    fn coarse_gain_calibration(&self, dev: &mut Device, regs: &mut RegisterSet, _dpi: u32) -> Result<()> {
        if Self::frontend_is_ad(dev)? {
            tracing::debug!("frontend has no programmable gain, skipping coarse gain calibration");
            return Ok(());
        }
        let sensor = &dev.tables.sensor;
        let coeff = if dev.settings.xres < sensor.optical_res { 0.9 } else { 1.0 };
        let target = sensor.gain_white_ref as f32 * coeff;
        let params = calibration_params(sensor.optical_res, sensor.sensor_pixels, 10, 8);
        calibration::calibrate_coarse_gain(dev, self, regs, &params, target, |f: &Frame<'_>| f.central_means())?;
        self.slow_back_home(dev, true)
    }

    fn led_calibration(&self, dev: &mut Device, regs: &mut RegisterSet) -> Result<[u16; 3]> {
        let tables = Arc::clone(&dev.tables);
        let sensor = &tables.sensor;
        let travel = mm_to_units(tables.model.y_offset_calib_white_mm, tables.motor.base_ydpi / 4);
        if travel > 20 {
            self.feed(dev, travel)?;
        }

        let resolution = sensor.register_hwdpi(dev.settings.xres);
        let profile = get_sensor_profile(&tables.sensor_profiles, sensor, resolution, 1)?;
        let pixels = sensor.sensor_pixels * resolution / sensor.optical_res;
        *regs = dev.reg.clone();
        let params = calibration_params(resolution, pixels, 1, 16);
        let policy = LedPolicy::Window {
            bottom: LED_BOTTOM,
            top: LED_TOP,
        };
        let exposure = calibration::calibrate_led(dev, self, regs, &params, profile.exposure.as_array(), policy)?;

        dev.reg.set_exposure(&LAYOUT, exposure)?;
        dev.exposure = exposure;
        if travel > 20 {
            self.slow_back_home(dev, true)?;
        }
        Ok(exposure)
    }
}
