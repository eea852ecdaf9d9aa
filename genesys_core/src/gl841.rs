//! GL841 command set (Canon LiDE 35/40/50 and relatives).
//!
//! Slope and shading tables go to ASIC RAM through the buffer address
//! registers and bulk endpoint 0x3c. The frontend is a Wolfson part unless
//! REG04 FESET selects Analog Devices.

use std::sync::Arc;

use genesys_config::{AsicType, FrontendKind, Motor, Sensor};

use crate::calibration::{self, DARK_TARGET, Frame, LedPolicy};
use crate::command_set::{self, CommandSet, HardwareSensors};
use crate::device::{CurrentSetup, Device};
use crate::error::{GenesysError, Result};
use crate::frontend::{FrontendAction, expect_kind};
use crate::layout::{Field, RegisterLayout, loc};
use crate::register::RegisterSet;
use crate::scan::{
    self, REG01, REG01_CISSET, REG01_DVDSET, REG01_SCAN, REG01_SHDAREA, REG02, REG02_ACDCDIS, REG02_AGOHOME,
    REG02_FASTFED, REG02_MTRPWR, REG02_MTRREV, REG02_NOTHOME, REG03, REG03_AVEENB, REG03_LAMPPWR, REG05,
    REG05_GMMENB,
};
use crate::session::{ColorFilter, ScanMode, ScanSession, ScanSessionParams, SessionRules, default_ccd_size_divisor};
use crate::slope::{self, SlopeSlot};
use crate::status::{MotorFlags, ScanFlags, ScanState, ScanStateBits, StatusBits};
use crate::tables::DeviceTables;
use crate::util::{mean, mm_to_units};

const REG02_LONGCURV: u8 = 0x01;
const REG02_HOMENEG: u8 = 0x02;
const REG03_LAMPTIM: u8 = 0x07;

const REG04: u16 = 0x04;
const REG04_LINEART: u8 = 0x80;
const REG04_BITSET: u8 = 0x40;
const REG04_AFEMOD: u8 = 0x30;
const REG04_FILTER: u8 = 0x0c;
const REG04_FESET: u8 = 0x03;
const FESET_AD: u8 = 0x02;

const REG06: u16 = 0x06;
const REG06_PWRBIT: u8 = 0x10;
const REG06_GAIN4: u8 = 0x08;
const REG09: u16 = 0x09;
const REG0E: u16 = 0x0e;
const REG19: u16 = 0x19;
const REG1C: u16 = 0x1c;
const REG1C_TGTIME: u8 = 0x07;
const REG1E: u16 = 0x1e;
const REG1E_WDTIME: u8 = 0xf0;
const REG5E: u16 = 0x5e;
const REG5E_DECSEL: u8 = 0xe0;
const REG67: u16 = 0x67;
const REG68: u16 = 0x68;
const REG6B: u16 = 0x6b;
const REG6B_GPO17: u8 = 0x01;
const REG6B_GPO18: u8 = 0x02;
const REG6C: u16 = 0x6c;
const REG6C_GPIO9: u8 = 0x01;
const REG6C_GPIO10: u8 = 0x02;
/// Full CCD width on the LiDE 35.
const REG6C_GPIO16: u8 = 0x80;
const REG6D: u16 = 0x6d;
const REG6D_GPIO8: u8 = 0x80;
const REG87: u16 = 0x87;
const REG87_LEDADD: u8 = 0x04;

/// Feed and line counters, 20 bits each.
const REG_FEDCNT: u16 = 0x48;
const REG_SCANCNT: u16 = 0x4b;

/// Buffer address, in 16-byte units.
const REG_BUFFER_ADDR_HI: u16 = 0x2a;
const REG_BUFFER_ADDR_LO: u16 = 0x2b;
const BULK_RAM: u8 = 0x3c;
const SHADING_CHANNEL_STRIDE: u32 = 0x5400;

const SLOPE_ENTRIES: usize = 256;
const SLOPE_SLOT_STRIDE: u32 = 0x200;
const HOME_STEPS: u32 = 65_536;

const GPIO_LIDE35: &str = "gpio-canon-lide-35";

/// Output resolutions are the optical one divided by one of these.
const RESOLUTION_FACTORS: [u32; 10] = [1, 2, 3, 4, 5, 6, 8, 10, 12, 15];

static LAYOUT: RegisterLayout = RegisterLayout {
    asic: AsicType::Gl841,
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
        (Field::Z1mod, loc(0x60, 2)),
        (Field::Z2mod, loc(0x62, 2)),
        (Field::Fshdec, loc(0x69, 1)),
        (Field::Fmovno, loc(0x6a, 1)),
    ],
};

/// Registers that exist on the GL841, all zero at power-on.
const BOOT_RANGES: [std::ops::RangeInclusive<u16>; 7] = [
    0x01..=0x0a,
    0x10..=0x27,
    0x29..=0x29,
    0x2c..=0x39,
    0x3d..=0x3f,
    0x52..=0x5a,
    0x5d..=0x87,
];

/// Sensor timing registers copied from the sensor table.
const SENSOR_TIMING: [std::ops::RangeInclusive<u16>; 2] = [0x16..=0x1d, 0x52..=0x5a];

const CALIBRATION_FLAGS: ScanFlags = ScanFlags::DISABLE_SHADING
    .union(ScanFlags::DISABLE_GAMMA)
    .union(ScanFlags::SINGLE_LINE)
    .union(ScanFlags::IGNORE_LINE_DISTANCE);

const SEARCH_FLAGS: ScanFlags = ScanFlags::DISABLE_SHADING
    .union(ScanFlags::DISABLE_GAMMA)
    .union(ScanFlags::IGNORE_LINE_DISTANCE);

/// Dark level the Analog Devices offset search aims for, 16-bit scale.
const AD_DARK_TARGET: u32 = 24 * 256;

/// White level the coarse gain brings the brightest pixel to.
const COARSE_TARGET: f32 = 65_535.0 * 0.69;

#[derive(Debug, Clone, Copy, Default)]
pub struct Gl841;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveAction {
    Feed,
    GoHome,
}

/// Horizontal geometry and timing of a scan.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    used_res: u32,
    /// First pixel, optical units.
    start: u32,
    used_pixels: u32,
    slope_dpi: u32,
    step_type: u8,
    exposure: u32,
}

/// Shape of the frames read during calibration.
#[derive(Debug, Clone, Copy)]
struct FrameShape {
    size: usize,
    pixels: usize,
    channels: usize,
    depth: u32,
    black: usize,
    planar: bool,
}

impl FrameShape {
    fn of(dev: &Device) -> Self {
        let setup = &dev.current_setup;
        let sensor = &dev.tables.sensor;
        let pixels = setup.pixels as usize;
        let channels = setup.channels as usize;
        let bytes = if setup.depth == 16 { 2 } else { 1 };
        Self {
            size: pixels * channels * bytes * setup.lines.max(1) as usize,
            pixels,
            channels,
            depth: setup.depth,
            black: (sensor.black_pixels * setup.xres / sensor.optical_res.max(1)) as usize,
            planar: dev.tables.model.is_cis,
        }
    }

    fn frame<'a>(&self, data: &'a [u8]) -> Frame<'a> {
        Frame {
            data,
            pixels: self.pixels,
            channels: self.channels,
            depth: self.depth,
            planar: self.planar,
        }
    }
}

fn is_lide35(tables: &DeviceTables) -> bool {
    tables.gpio.as_ref().is_some_and(|g| g.id == GPIO_LIDE35)
}

fn gpio_value(tables: &DeviceTables, address: u16) -> Option<u8> {
    let gpio = tables.gpio.as_ref()?;
    gpio.registers
        .iter()
        .find(|r| r.address == address)
        .map(|r| r.value as u8)
}

fn set_buffer_address(dev: &mut Device, address: u32) -> Result<()> {
    let address = address >> 4;
    dev.write_register(REG_BUFFER_ADDR_LO, (address & 0xff) as u8)?;
    dev.write_register(REG_BUFFER_ADDR_HI, ((address >> 8) & 0xff) as u8)
}

fn dpihw_of(regs: &RegisterSet) -> Result<u32> {
    match regs.get8(REG05)? & scan::REG05_DPIHW {
        0x00 => Ok(600),
        0x40 => Ok(1200),
        0x80 => Ok(2400),
        other => Err(GenesysError::invalid(format!("unsupported hardware dpi bits {other:#04x}")).into()),
    }
}

/// Step type giving at least four steps per line, within what the motor can do.
fn scan_step_type(motor: &Motor, yres: u32) -> u8 {
    if yres * 4 < motor.base_ydpi || motor.max_step_type == 0 {
        0
    } else if yres * 4 < motor.base_ydpi * 2 || motor.max_step_type <= 1 {
        1
    } else {
        2
    }
}

/// Line period long enough for the CCD read-out, the motor and the LEDs.
/// FWDSTEP and BWDSTEP for the given scan and backtrack table lengths.
///
/// The chip requires `2 * scan_steps + FWDSTEP == 2 * back_steps + BWDSTEP`,
/// with at least 0x20 steps of restep room.
fn restep_counts(scan_steps: u32, back_steps: u32) -> (u32, u32) {
    let min_restep = 0x20u32.max(scan_steps * 2 + 2).max(back_steps * 2 + 2);
    (min_restep - scan_steps * 2, min_restep - back_steps * 2)
}

fn exposure_time(dev: &Device, slope_dpi: u32, step_type: u8, endpixel: u32) -> Result<u32> {
    let tables = &dev.tables;
    let motor = &tables.motor;
    let slope = motor.slopes.get(usize::from(step_type)).ok_or_else(|| {
        GenesysError::invalid(format!("motor '{}' has no slope for step type {step_type}", motor.id))
    })?;
    let by_ccd = endpixel + 32;
    let by_motor = (u64::from(slope.maximum_speed) * u64::from(motor.base_ydpi) / u64::from(slope_dpi.max(1))) as u32;
    let by_led = if tables.model.is_cis {
        let brightest = tables.sensor.exposure.as_array().into_iter().max().unwrap_or(0);
        u32::from(brightest) + u32::from(dev.reg.get8(REG19).unwrap_or(0))
    } else {
        0
    };
    Ok(by_ccd.max(by_motor).max(by_led))
}

fn geometry(dev: &Device, session: &ScanSession) -> Result<Geometry> {
    let tables = &dev.tables;
    let sensor = &tables.sensor;
    let p = &session.params;
    let optical = session.optical_resolution;

    let used_res = if p.flags.contains(ScanFlags::USE_OPTICAL_RES) {
        optical
    } else {
        p.xres
    };

    let mut start = (sensor.ccd_start_xoffset + p.startx) * used_res / sensor.optical_res;
    start = start * optical / used_res;
    start += sensor.dummy_pixel + 1;
    if session.num_staggered_lines > 0 {
        start |= 1;
    }
    // shading coefficients cover whole averaging groups
    if dev.reg.get8(REG01).is_ok_and(|v| v & REG01_SHDAREA != 0) {
        let avg = (optical / used_res).max(1);
        start = start / avg * avg;
    }

    let used_pixels = (u64::from(p.pixels) * u64::from(optical)).div_ceil(u64::from(p.xres)) as u32;
    let slope_dpi = if tables.model.is_cis { p.yres * p.channels } else { p.yres };
    let step_type = scan_step_type(&tables.motor, p.yres);
    let exposure = exposure_time(dev, slope_dpi, step_type, start + used_pixels)?;
    Ok(Geometry {
        used_res,
        start,
        used_pixels,
        slope_dpi,
        step_type,
        exposure,
    })
}

fn read_counter(dev: &mut Device, address: u16) -> Result<u32> {
    let hi = u32::from(dev.read_register(address)? & 0x0f);
    let mid = u32::from(dev.read_register(address + 1)?);
    let lo = u32::from(dev.read_register(address + 2)?);
    Ok((hi << 16) | (mid << 8) | lo)
}

/// The paper sensor pulls its line low while a sheet is present.
fn paper_loaded(dev: &mut Device) -> Result<bool> {
    Ok(dev.read_register(REG6D)? & 0x01 == 0)
}

fn update_register(dev: &mut Device, address: u16, f: impl FnOnce(u8) -> u8) -> Result<u8> {
    let v = f(dev.read_register(address)?);
    dev.write_register(address, v)?;
    Ok(v)
}

/// Keep the register shadows in line with a GPO change made on the ASIC.
fn shadow_gpo(dev: &mut Device, value: u8) {
    for regs in [&mut dev.reg, &mut dev.calib_reg] {
        if regs.has(REG6B) {
            regs.init_or_set(REG6B, value);
        }
    }
}

/// Copy the sensor timing from the table into `regs`.
fn setup_sensor(regs: &mut RegisterSet, sensor: &Sensor) -> Result<()> {
    for reg in &sensor.custom_regs {
        match reg.address {
            // CCD clock phases live at 0x70.. on this ASIC
            0x08..=0x0b => regs.set8(0x70 + reg.address - 0x08, reg.value as u8)?,
            a if SENSOR_TIMING.iter().any(|r| r.contains(&a)) => regs.apply(reg)?,
            _ => {}
        }
    }
    Ok(())
}

/// Registers of a motor that stays put for `scan_lines` lines.
fn motor_off(regs: &mut RegisterSet, scan_lines: u32) -> Result<()> {
    regs.set_field(&LAYOUT, Field::Feedl, 2)?;
    regs.clear_bits(REG5E, REG5E_DECSEL)?;
    regs.set_field(&LAYOUT, Field::Lincnt, scan_lines)?;
    regs.clear_bits(
        REG02,
        REG02_LONGCURV
            | REG02_NOTHOME
            | REG02_MTRPWR
            | REG02_MTRREV
            | REG02_HOMENEG
            | REG02_FASTFED
            | REG02_AGOHOME
            | REG02_ACDCDIS,
    )?;
    regs.set8(REG67, 0x3f)?;
    regs.set8(REG68, 0x3f)?;
    for field in [Field::Stepno, Field::Fastno, Field::Fshdec, Field::Fmovno, Field::Fmovdec] {
        regs.set_field(&LAYOUT, field, 0)?;
    }
    Ok(())
}

fn calibration_params(sensor: &Sensor, flags: ScanFlags) -> ScanSessionParams {
    ScanSessionParams {
        xres: sensor.optical_res,
        yres: sensor.optical_res,
        startx: 0,
        starty: 0,
        pixels: sensor.sensor_pixels,
        lines: 1,
        depth: 16,
        channels: 3,
        scan_mode: ScanMode::Color,
        color_filter: ColorFilter::Red,
        flags,
    }
}

impl Gl841 {
    fn frontend_select(dev: &mut Device) -> Result<u8> {
        let r04 = match dev.reg.get8(REG04) {
            Ok(v) => v,
            Err(_) => dev.read_register(REG04)?,
        };
        Ok(r04 & REG04_FESET)
    }

    fn set_wolfson_fe(dev: &mut Device, action: FrontendAction) -> Result<()> {
        expect_kind(&dev.frontend, FrontendKind::Wolfson, AsicType::Gl841)?;
        match action {
            FrontendAction::Init => {
                dev.frontend = dev.frontend_initial.clone();
                dev.write_fe_data(0x04, 0x80)?;
            }
            FrontendAction::PowerSave => return dev.write_fe_data(0x01, 0x02),
            FrontendAction::Set => {}
        }
        let fe = dev.frontend.clone();
        for addr in [0x00, 0x02, 0x01, 0x03] {
            dev.write_fe_data(addr, fe.value(addr))?;
        }
        for (addr, value) in [0x06u8, 0x08, 0x09].into_iter().zip(fe.reg2) {
            dev.write_fe_data(addr, u16::from(value))?;
        }
        for ch in 0..3u8 {
            dev.write_fe_data(0x24 + ch, fe.value(0x24 + ch))?;
            dev.write_fe_data(0x28 + ch, u16::from(fe.gain(usize::from(ch))))?;
            dev.write_fe_data(0x20 + ch, u16::from(fe.offset(usize::from(ch))))?;
        }
        Ok(())
    }

    fn set_ad_fe(dev: &mut Device, action: FrontendAction) -> Result<()> {
        match action {
            FrontendAction::PowerSave => {
                tracing::debug!("frontend power save not supported");
                Ok(())
            }
            FrontendAction::Init => {
                dev.frontend = dev.frontend_initial.clone();
                let fe = dev.frontend.clone();
                dev.write_fe_data(0x00, fe.value(0x00))?;
                dev.write_fe_data(0x01, fe.value(0x01))?;
                for addr in 0x02..=0x07 {
                    dev.write_fe_data(addr, 0)?;
                }
                Ok(())
            }
            FrontendAction::Set => {
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
        }
    }

    fn send_blank_tables(&self, dev: &mut Device) -> Result<()> {
        let blank = [0xffffu16; SLOPE_ENTRIES];
        for slot in [SlopeSlot::Scan, SlopeSlot::Backtrack, SlopeSlot::Stop, SlopeSlot::Fast, SlopeSlot::Home] {
            self.send_slope_table(dev, slot, &blank)?;
        }
        Ok(())
    }

    /// Motor registers for a plain move of `feed_steps` full steps.
    fn motor_move_regs(
        &self,
        dev: &mut Device,
        regs: &mut RegisterSet,
        feed_steps: u32,
        action: MoveAction,
        flags: MotorFlags,
    ) -> Result<()> {
        let tables = Arc::clone(&dev.tables);
        let motor = &tables.motor;
        self.send_blank_tables(dev)?;

        let fast_dpi = (motor.base_ydpi / 4).max(1);
        let fast_exposure = exposure_time(dev, fast_dpi, 0, 0)?;
        let fast = slope::create_slope_table3(motor, SLOPE_ENTRIES, SLOPE_ENTRIES as u32, 0, fast_exposure, fast_dpi)?;

        let feedl = feed_steps.saturating_sub(fast.used_steps * 2);
        regs.set_field(&LAYOUT, Field::Feedl, feedl)?;
        regs.set_field(&LAYOUT, Field::Lincnt, 0)?;

        let mut r02 = regs.get8(REG02)?
            & !(REG02_LONGCURV | REG02_NOTHOME | REG02_MTRREV | REG02_HOMENEG | REG02_AGOHOME | REG02_ACDCDIS);
        r02 |= REG02_MTRPWR | REG02_FASTFED;
        if action == MoveAction::GoHome {
            r02 |= REG02_MTRREV;
        }
        if flags.contains(MotorFlags::AUTO_GO_HOME) {
            r02 |= REG02_AGOHOME | REG02_NOTHOME;
        }
        if flags.contains(MotorFlags::DISABLE_BUFFER_FULL_MOVE) {
            r02 |= REG02_ACDCDIS;
        }
        regs.set8(REG02, r02)?;
        self.send_slope_table(dev, SlopeSlot::Fast, &fast.table)?;

        regs.set8(REG67, 0x3f)?;
        regs.set8(REG68, 0x3f)?;
        regs.set_field(&LAYOUT, Field::Stepno, 0)?;
        regs.set_field(&LAYOUT, Field::Fastno, 0)?;
        regs.set_field(&LAYOUT, Field::Fshdec, 0)?;
        regs.set_field(&LAYOUT, Field::Fmovno, fast.used_steps.div_ceil(2))?;
        regs.set_field(&LAYOUT, Field::Fmovdec, fast.used_steps.div_ceil(2))?;
        tracing::debug!(?action, feed_steps, feedl, fast_steps = fast.used_steps, "move registers");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn motor_scan_regs(
        &self,
        dev: &mut Device,
        regs: &mut RegisterSet,
        exposure: u32,
        slope_dpi: u32,
        step_type: u8,
        scan_lines: u32,
        scan_dummy: u32,
        feed_steps: u32,
        flags: MotorFlags,
    ) -> Result<()> {
        let tables = Arc::clone(&dev.tables);
        let motor = &tables.motor;
        self.send_blank_tables(dev)?;

        let slow = slope::create_slope_table3(motor, SLOPE_ENTRIES, 256, step_type, exposure, slope_dpi)?;
        let back = slope::create_slope_table3(motor, SLOPE_ENTRIES, 256, step_type, 0, slope_dpi)?;

        // ramp length in full steps
        let slow_full = slow.used_steps >> step_type;
        let feed_steps = feed_steps.max(slow_full);
        let fast_use = if feed_steps > 512u32.saturating_sub(slow_full) {
            256
        } else {
            (feed_steps - slow_full) / 2
        };
        let fast_dpi = (motor.base_ydpi / 4).max(1);
        let fast_exposure = exposure_time(dev, fast_dpi, 0, 0)?;
        let fast = slope::create_slope_table3(motor, SLOPE_ENTRIES, fast_use, 0, fast_exposure, fast_dpi)?;

        let use_fast = if tables.model.disable_fast_feed || feed_steps < fast.used_steps * 2 + slow_full {
            false
        } else {
            let cruise = u64::from(feed_steps - fast.used_steps * 2 - slow_full);
            let fast_time = u64::from(fast.final_exposure) / 4 * cruise + fast.time * 2 + slow.time;
            let slow_time = u64::from(exposure) * u64::from(slope_dpi) / u64::from(motor.base_ydpi.max(1))
                * u64::from(feed_steps - slow_full)
                + slow.time;
            fast_time < slow_time
        };

        let feedl = if use_fast {
            feed_steps - fast.used_steps * 2 - slow_full
        } else {
            (feed_steps << step_type).saturating_sub(slow.used_steps)
        };
        regs.set_field(&LAYOUT, Field::Feedl, feedl)?;
        regs.set_field(&LAYOUT, Field::Lincnt, scan_lines)?;

        let mut r02 = regs.get8(REG02)?
            & !(REG02_LONGCURV
                | REG02_NOTHOME
                | REG02_FASTFED
                | REG02_AGOHOME
                | REG02_ACDCDIS
                | REG02_MTRREV
                | REG02_HOMENEG);
        r02 |= REG02_MTRPWR;
        if use_fast {
            r02 |= REG02_FASTFED;
        }
        if flags.contains(MotorFlags::AUTO_GO_HOME) {
            r02 |= REG02_AGOHOME | REG02_NOTHOME;
        }
        if flags.contains(MotorFlags::DISABLE_BUFFER_FULL_MOVE) {
            r02 |= REG02_ACDCDIS;
        }
        regs.set8(REG02, r02)?;

        self.send_slope_table(dev, SlopeSlot::Scan, &slow.table)?;
        self.send_slope_table(dev, SlopeSlot::Backtrack, &back.table)?;
        self.send_slope_table(dev, SlopeSlot::Stop, &slow.table)?;
        if use_fast {
            self.send_slope_table(dev, SlopeSlot::Fast, &fast.table)?;
        }
        if r02 & REG02_AGOHOME != 0 {
            self.send_slope_table(dev, SlopeSlot::Home, &fast.table)?;
        }

        let (fwdstep, bwdstep) = restep_counts(slow.used_steps, back.used_steps);
        regs.set_field(&LAYOUT, Field::Fwdstep, fwdstep)?;
        regs.set_field(&LAYOUT, Field::Bwdstep, bwdstep)?;
        regs.set_field(&LAYOUT, Field::Z1mod, 0)?;
        regs.set_field(&LAYOUT, Field::Z2mod, 0)?;

        regs.set8_mask(REG1E, scan_dummy as u8, !REG1E_WDTIME)?;
        regs.set8(REG67, 0x3f | (step_type << 6))?;
        regs.set8(REG68, 0x3f)?;

        regs.set_field(&LAYOUT, Field::Stepno, slow.used_steps.div_ceil(2))?;
        regs.set_field(&LAYOUT, Field::Fastno, back.used_steps.div_ceil(2))?;
        regs.set_field(&LAYOUT, Field::Fshdec, slow.used_steps.div_ceil(2))?;
        regs.set_field(&LAYOUT, Field::Fmovno, fast.used_steps.div_ceil(2))?;
        regs.set_field(&LAYOUT, Field::Fmovdec, fast.used_steps.div_ceil(2))?;
        tracing::debug!(
            step_type,
            slow_steps = slow.used_steps,
            back_steps = back.used_steps,
            fast_steps = fast.used_steps,
            use_fast,
            feedl,
            "motor registers"
        );
        Ok(())
    }

    fn init_optical_regs(
        &self,
        dev: &mut Device,
        regs: &mut RegisterSet,
        g: &Geometry,
        session: &ScanSession,
    ) -> Result<()> {
        let tables = Arc::clone(&dev.tables);
        let sensor = &tables.sensor;
        let p = &session.params;

        self.set_fe(dev, FrontendAction::Set)?;

        let dpihw = dpihw_of(regs)?;
        let used_res = g.used_res * dpihw / sensor.optical_res;
        let dpiset = used_res * session.ccd_size_divisor;

        if is_lide35(&tables) {
            if session.ccd_size_divisor > 1 {
                regs.clear_bits(REG6C, REG6C_GPIO16)?;
            } else {
                regs.set_bits(REG6C, REG6C_GPIO16)?;
            }
        }

        regs.set_bits(REG01, REG01_SCAN)?;
        if p.flags.contains(ScanFlags::DISABLE_SHADING) || tables.model.no_calibration {
            regs.clear_bits(REG01, REG01_DVDSET)?;
        } else {
            regs.set_bits(REG01, REG01_DVDSET)?;
        }
        regs.set_bits(REG03, REG03_AVEENB)?;
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
        r04 |= if session.enable_ledadd || p.channels != 1 {
            0x10
        } else {
            match p.color_filter {
                ColorFilter::Red => 0x14,
                ColorFilter::Green => 0x18,
                ColorFilter::Blue => 0x1c,
                ColorFilter::None => 0x10,
            }
        };
        regs.set8(REG04, r04)?;

        // all three LEDs at once need matching, shortest exposures
        regs.clear_bits(REG87, REG87_LEDADD)?;
        if session.enable_ledadd {
            regs.set_bits(REG87, REG87_LEDADD)?;
            let shortest = regs.get_exposure(&LAYOUT)?.into_iter().min().unwrap_or(0);
            regs.set_exposure(&LAYOUT, [shortest; 3])?;
        }

        if p.flags.contains(ScanFlags::DISABLE_GAMMA) {
            regs.clear_bits(REG05, REG05_GMMENB)?;
        } else {
            regs.set_bits(REG05, REG05_GMMENB)?;
        }

        setup_sensor(regs, sensor)?;
        regs.set8(0x29, 0xff)?;

        regs.set_field(&LAYOUT, Field::Dpiset, dpiset)?;
        regs.set_field(&LAYOUT, Field::Strpixel, g.start)?;
        regs.set_field(&LAYOUT, Field::Endpixel, g.start + g.used_pixels)?;

        let samples = u64::from(g.used_pixels) * u64::from(dpiset) / u64::from(dpihw) * u64::from(p.channels);
        let words = if p.depth == 1 {
            samples.div_ceil(8)
        } else {
            samples * u64::from(p.depth / 8)
        };
        regs.set_field(&LAYOUT, Field::Maxwd, words as u32)?;
        regs.set_field(&LAYOUT, Field::Lperiod, g.exposure)?;
        regs.set_field(&LAYOUT, Field::Dummy, sensor.dummy_pixel)?;
        tracing::debug!(dpihw, dpiset, start = g.start, pixels = g.used_pixels, words, "optical registers");
        Ok(())
    }

    fn dark_levels(
        &self,
        dev: &mut Device,
        regs: &mut RegisterSet,
        offsets: [u8; 3],
        shape: &FrameShape,
    ) -> Result<[u32; 3]> {
        dev.frontend.set_offsets(offsets);
        self.set_fe(dev, FrontendAction::Set)?;
        let data = calibration::scan_frame(dev, self, regs, shape.size)?;
        let black = shape.black.max(1);
        Ok(shape.frame(&data).per_channel(|f, ch| f.channel_mean(ch, 0..black)))
    }

    /// Per-channel offset bisection for the Wolfson frontend.
    fn wolfson_offsets(&self, dev: &mut Device, regs: &mut RegisterSet, shape: &FrameShape) -> Result<[u8; 3]> {
        let target = DARK_TARGET * 256;
        let mut bottom = [0u8; 3];
        let mut top = [255u8; 3];
        let mut done = [false; 3];

        let low = self.dark_levels(dev, regs, bottom, shape)?;
        let high = self.dark_levels(dev, regs, top, shape)?;
        for ch in 0..3 {
            if low[ch] >= target {
                top[ch] = 0;
                done[ch] = true;
            } else if high[ch] < target {
                tracing::warn!(channel = ch, level = high[ch], target, "dark level stays below target");
                done[ch] = true;
            }
        }

        for pass in 0..dev.tuning.offset_max_passes {
            if (0..3).all(|ch| done[ch] || top[ch] - bottom[ch] <= 1) {
                break;
            }
            let mid: [u8; 3] = std::array::from_fn(|ch| {
                if done[ch] {
                    top[ch]
                } else {
                    bottom[ch] + (top[ch] - bottom[ch]) / 2
                }
            });
            let avg = self.dark_levels(dev, regs, mid, shape)?;
            tracing::trace!(pass, ?mid, ?avg, "offset probe");
            for ch in 0..3 {
                if done[ch] {
                    continue;
                }
                if avg[ch] >= target {
                    top[ch] = mid[ch];
                } else {
                    bottom[ch] = mid[ch];
                }
            }
        }
        Ok(top)
    }

    fn travel_to_white(dev: &Device) -> u32 {
        mm_to_units(dev.tables.model.y_offset_calib_white_mm, dev.tables.motor.base_ydpi)
    }
}

impl CommandSet for Gl841 {
    fn name(&self) -> &'static str {
        "gl841"
    }

    fn asic(&self) -> AsicType {
        AsicType::Gl841
    }

    fn layout(&self) -> &'static RegisterLayout {
        &LAYOUT
    }

    fn session_rules(&self) -> SessionRules {
        SessionRules {
            asic: AsicType::Gl841,
            ccd_size_divisor: default_ccd_size_divisor,
            even_optical_pixels: true,
            lines_per_read: 8,
            bulk_max: 0xf000,
            no_16bit_gamma: true,
        }
    }

    fn compute_session(&self, dev: &Device, params: &ScanSessionParams) -> Result<ScanSession> {
        let session = ScanSession::compute(params, &dev.tables, &self.session_rules())?;
        let optical = session.optical_resolution;
        if !RESOLUTION_FACTORS.iter().any(|&f| optical / f == session.output_resolution) {
            return Err(GenesysError::UnsupportedResolution {
                resolution: session.output_resolution,
                optical,
            }
            .into());
        }
        Ok(session)
    }

    // ── boot ──────────────────────────────────────────────────────────────

    fn init_registers(&self, dev: &mut Device) -> Result<()> {
        let tables = Arc::clone(&dev.tables);
        let sensor = &tables.sensor;
        let mut regs = RegisterSet::new();
        for range in BOOT_RANGES {
            for address in range {
                regs.init(address, 0)?;
            }
        }

        let mut r01 = REG01_DVDSET;
        if tables.model.is_cis {
            r01 |= REG01_CISSET;
        }
        regs.set8(REG01, r01)?;
        regs.set8(REG02, REG02_AGOHOME | REG02_MTRPWR | REG02_FASTFED)?;
        // lamp on, lamp dog with the longest lamp time
        regs.set8(REG03, 0x5f)?;
        regs.set8(REG04, if tables.frontend.kind == FrontendKind::AnalogDevices { 0x20 | FESET_AD } else { 0x10 })?;

        let dpihw = match sensor.sensor_pixels {
            n if n < 0x1500 => 600,
            n if n < 0x2a80 => 1200,
            n if n < 0x5400 => 2400,
            n => return Err(GenesysError::invalid(format!("sensor width of {n} pixels is out of range")).into()),
        };
        scan::set_dpihw(&mut regs, dpihw)?;

        regs.set_bits(REG06, REG06_PWRBIT | REG06_GAIN4)?;
        regs.set_bits(REG09, 0x10)?;
        regs.set8(REG1E, 0xf0)?;
        regs.set8(0x1f, 0x01)?;
        regs.set8(0x20, 0x20)?;
        regs.set8(0x29, 0xff)?;
        regs.set8(0x2e, 0x80)?;
        regs.set8(0x2f, 0x80)?;
        regs.set16(0x38, 0x4fc1)?;
        regs.set_bits(REG5E, 0x02)?;

        setup_sensor(&mut regs, sensor)?;
        if let Some(gpio) = &tables.gpio {
            for reg in &gpio.registers {
                regs.apply_or_init(reg);
            }
        }
        if is_lide35(&tables) {
            regs.set_bits(REG6B, REG6B_GPO18)?;
            regs.clear_bits(REG6B, REG6B_GPO17)?;
        }
        regs.set_exposure(&LAYOUT, dev.exposure)?;

        dev.calib_reg = regs.clone();
        dev.reg = regs;
        Ok(())
    }

    fn asic_boot(&self, dev: &mut Device, cold: bool) -> Result<()> {
        if cold {
            dev.write_register(REG0E, 0x01)?;
            dev.write_register(REG0E, 0x00)?;
        }
        self.init_registers(dev)?;
        dev.restore_registers()?;
        tracing::debug!(cold, "gl841 booted");
        Ok(())
    }

    fn init(&self, dev: &mut Device) -> Result<()> {
        dev.scanhead_position_in_steps = 0;
        if dev.already_initialized && dev.read_status(&LAYOUT)?.contains(StatusBits::PWRBIT) {
            tracing::debug!("already initialized");
            return Ok(());
        }
        dev.settings.color_filter = ColorFilter::Red;

        self.asic_boot(dev, true)?;
        self.set_fe(dev, FrontendAction::Init)?;
        self.slow_back_home(dev, true)?;

        // one dummy line settles the frontend
        let optical = dev.tables.sensor.optical_res;
        let params = ScanSessionParams {
            xres: 300,
            yres: 300,
            startx: 0,
            starty: 0,
            pixels: (16 * 300 / optical.max(1)).max(1),
            lines: 1,
            depth: 16,
            channels: 3,
            scan_mode: ScanMode::Color,
            color_filter: ColorFilter::Red,
            flags: CALIBRATION_FLAGS | ScanFlags::USE_OPTICAL_RES,
        };
        let session = self.compute_session(dev, &params)?;
        let mut regs = dev.reg.clone();
        self.init_scan_regs(dev, &mut regs, &session)?;
        let size = dev.current_setup.pixels as usize * 6;
        calibration::scan_frame(dev, self, &mut regs, size)?;
        self.end_scan(dev, &mut regs, true)?;
        dev.calib_reg = regs;

        self.set_powersaving(dev, 15)?;
        dev.already_initialized = true;
        Ok(())
    }

    fn set_fe(&self, dev: &mut Device, action: FrontendAction) -> Result<()> {
        match Self::frontend_select(dev)? {
            0 => Self::set_wolfson_fe(dev, action),
            FESET_AD => Self::set_ad_fe(dev, action),
            _ => Err(GenesysError::NotSupported {
                operation: "set_fe",
                asic: AsicType::Gl841,
            }
            .into()),
        }
    }

    fn set_powersaving(&self, dev: &mut Device, minutes: u32) -> Result<()> {
        tracing::debug!(minutes, "power saving delay");
        let mut local = RegisterSet::new();
        local.init(REG01, dev.reg.get8(REG01)?)?;
        local.init(REG05, dev.reg.get8(REG05)?)?;
        local.init(0x18, 0x00)?;
        local.init(0x38, 0x00)?;
        local.init(0x39, 0x00)?;

        let r03 = dev.reg.get8(REG03)? & 0xf0;
        let r03 = match minutes {
            0 => r03,
            1..=19 => r03 | 0x09,
            _ => r03 | 0x0f,
        };
        local.init(REG03, r03)?;

        // lamp timer ticks, scaled down until they fit the 16-bit counter
        let lamptim = f64::from(r03 & REG03_LAMPTIM);
        let ticks = if lamptim == 0.0 {
            0
        } else {
            (f64::from(minutes) * 60_000.0 * 32_000.0 / (24.0 * 64.0 * lamptim * 1024.0) + 0.5) as u32
        };
        let rate = (ticks + 65_536) / 65_536;
        let (rate, tgtime) = match rate {
            r if r > 4 => (8, 3),
            r if r > 2 => (4, 2),
            2 => (2, 1),
            _ => (1, 0),
        };
        let ticks = (ticks / rate).min(65_535);
        local.init(REG1C, (dev.reg.get8(REG1C)? & !REG1C_TGTIME) | tgtime)?;
        local.set16(0x38, ticks as u16)?;
        dev.write_registers(&local)
    }

    fn save_power(&self, dev: &mut Device, enable: bool) -> Result<()> {
        tracing::debug!(enable, "save power");
        let lide35 = is_lide35(&dev.tables);
        if enable {
            if lide35 {
                // GPIO17 on, GPIO9 off, GPIO8 low
                update_register(dev, REG6D, |v| v | REG6D_GPIO8)?;
                dev.sleep_ms(1);
                update_register(dev, REG6C, |v| v | REG6C_GPIO9)?;
                let gpo = update_register(dev, REG6B, |v| v & !(REG6B_GPO17 | REG6B_GPO18))?;
                shadow_gpo(dev, gpo);
                dev.sleep_ms(1);
                update_register(dev, REG6D, |v| v & !REG6D_GPIO8)?;
            }
            self.set_fe(dev, FrontendAction::PowerSave)
        } else {
            if lide35 {
                update_register(dev, REG6D, |v| v | REG6D_GPIO8)?;
                dev.sleep_ms(10);
                update_register(dev, REG6C, |v| (v & !REG6C_GPIO9) | REG6C_GPIO10)?;
                let gpo = update_register(dev, REG6B, |v| v | REG6B_GPO17 | REG6B_GPO18)?;
                shadow_gpo(dev, gpo);
            }
            Ok(())
        }
    }

    // ── scan registers ────────────────────────────────────────────────────

    fn send_slope_table(&self, dev: &mut Device, slot: SlopeSlot, table: &[u16]) -> Result<()> {
        let base: u32 = match dev.reg.get8(REG05).map_or(0, |v| v >> 6) {
            0 => 0x08000,
            1 => 0x10000,
            _ => 0x20000,
        };
        let address = base + u32::from(slot.index()) * SLOPE_SLOT_STRIDE;
        tracing::trace!(?slot, entries = table.len(), address = format_args!("{address:#x}"), "slope table");
        set_buffer_address(dev, address)?;
        dev.bulk_write(BULK_RAM, &slope::to_le_bytes(table))
    }

    fn init_scan_regs(&self, dev: &mut Device, regs: &mut RegisterSet, session: &ScanSession) -> Result<()> {
        let p = &session.params;
        let is_cis = dev.tables.model.is_cis;
        let g = geometry(dev, session)?;
        tracing::debug!(exposure = g.exposure, step_type = g.step_type, slope_dpi = g.slope_dpi, "scan timing");

        self.init_optical_regs(dev, regs, &g, session)?;

        let lincnt = session.output_line_count;
        let scan_lines = if is_cis { lincnt * p.channels } else { lincnt };
        if p.flags.contains(ScanFlags::SINGLE_LINE) {
            motor_off(regs, scan_lines)?;
        } else {
            let mut mflags = MotorFlags::empty();
            if p.flags.contains(ScanFlags::DISABLE_BUFFER_FULL_MOVE) {
                mflags |= MotorFlags::DISABLE_BUFFER_FULL_MOVE;
            }
            let feed = p.starty.saturating_sub(dev.scanhead_position_in_steps);
            self.motor_scan_regs(dev, regs, g.exposure, g.slope_dpi, g.step_type, scan_lines, 0, feed, mflags)?;
        }

        dev.current_setup = CurrentSetup {
            pixels: g.used_pixels * g.used_res / session.optical_resolution,
            lines: lincnt,
            depth: p.depth,
            channels: p.channels,
            exposure_time: g.exposure,
            xres: g.used_res,
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
        let params = ScanSessionParams {
            xres: s.xres,
            yres: s.yres,
            startx: mm_to_units(tables.model.x_offset_mm + s.tl_x_mm, tables.sensor.optical_res),
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
        let g = geometry(dev, &session)?;
        let setup = CurrentSetup {
            pixels: g.used_pixels * g.used_res / session.optical_resolution,
            lines: session.output_line_count,
            depth: session.params.depth,
            channels: s.channels(),
            exposure_time: g.exposure,
            xres: g.used_res,
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
        let xres = dev.settings.xres;
        let lines = tables.model.shading_lines;
        let params = ScanSessionParams {
            xres,
            yres: tables.motor.base_ydpi,
            startx: 0,
            starty: 0,
            pixels: sensor.sensor_pixels * xres / sensor.optical_res,
            lines,
            depth: 16,
            channels: 3,
            scan_mode: ScanMode::Color,
            color_filter: dev.settings.color_filter,
            flags: ScanFlags::DISABLE_SHADING
                | ScanFlags::DISABLE_GAMMA
                | ScanFlags::USE_OPTICAL_RES
                | ScanFlags::IGNORE_LINE_DISTANCE,
        };
        let session = self.compute_session(dev, &params)?;
        self.init_scan_regs(dev, regs, &session)?;
        dev.write_registers(regs)?;
        dev.scanhead_position_in_steps += lines;
        Ok(session)
    }

    fn init_regs_for_scan(&self, dev: &mut Device) -> Result<ScanSession> {
        let tables = Arc::clone(&dev.tables);
        let s = dev.settings;
        let starty = mm_to_units(tables.model.y_offset_mm + s.tl_y_mm, tables.motor.base_ydpi);
        let startx = mm_to_units(tables.model.x_offset_mm + s.tl_x_mm, tables.sensor.optical_res);
        let mut flags = ScanFlags::empty();
        if s.scan_mode == ScanMode::Lineart {
            flags |= ScanFlags::DYNAMIC_LINEART;
        }
        let params = ScanSessionParams {
            xres: s.xres,
            yres: s.yres,
            startx,
            starty,
            pixels: s.pixels,
            lines: s.lines,
            depth: s.depth,
            channels: s.channels(),
            scan_mode: s.scan_mode,
            color_filter: s.color_filter,
            flags,
        };
        let session = self.compute_session(dev, &params)?;
        let mut regs = dev.reg.clone();
        self.init_scan_regs(dev, &mut regs, &session)?;
        dev.reg = regs;
        dev.session = Some(session.clone());
        Ok(session)
    }

    fn send_shading_data(&self, dev: &mut Device, data: &[u8]) -> Result<()> {
        if !dev.reg.get8(REG01).is_ok_and(|v| v & REG01_SHDAREA != 0) {
            // coefficients for the whole sensor line, loaded as is
            set_buffer_address(dev, 0)?;
            tracing::debug!(bytes = data.len(), "shading data sent");
            return dev.bulk_write(BULK_RAM, data);
        }

        let tables = Arc::clone(&dev.tables);
        let sensor = &tables.sensor;
        let length = data.len() / 3;
        let strpixel = dev.reg.get_field(&LAYOUT, Field::Strpixel)? as usize;
        let endpixel = dev.reg.get_field(&LAYOUT, Field::Endpixel)? as usize;
        let divisor = dev.current_setup.ccd_size_divisor.max(1);
        // two 16-bit words per pixel
        let bytes = endpixel.saturating_sub(strpixel) * 4;
        let first = (sensor.ccd_start_xoffset / divisor + sensor.dummy_pixel + 1) as usize * 4;
        let begin = (strpixel * 4).saturating_sub(first);

        for ch in 0..3usize {
            let mut buffer = vec![0u8; bytes];
            let src = data.get(begin + ch * length..).unwrap_or(&[]);
            let n = src.len().min(bytes);
            buffer[..n].copy_from_slice(&src[..n]);
            set_buffer_address(dev, SHADING_CHANNEL_STRIDE * ch as u32)?;
            dev.bulk_write(BULK_RAM, &buffer)?;
        }
        tracing::debug!(bytes, begin, "shading data sent");
        Ok(())
    }

    // ── motion ────────────────────────────────────────────────────────────

    fn begin_scan(&self, dev: &mut Device, regs: &mut RegisterSet, start_motor: bool) -> Result<()> {
        let r03 = regs.get8(REG03)? | REG03_LAMPPWR;
        let r01 = regs.get8(REG01)? | REG01_SCAN;
        dev.write_register(REG03, r03)?;
        dev.write_register(REG01, r01)?;
        dev.write_register(scan::REG0D, scan::REG0D_CLRLNCNT)?;
        dev.write_register(scan::REG0F, u8::from(start_motor))?;
        dev.state = ScanState::Scanning;
        Ok(())
    }

    fn stop_action(&self, dev: &mut Device) -> Result<()> {
        let status = dev.read_status(&LAYOUT)?;
        let state = dev.read_scan_state(&LAYOUT)?;
        if !state.intersects(ScanStateBits::DATAENB | ScanStateBits::MOTMFLG) {
            tracing::debug!(status = %status.describe(), "already stopped");
            dev.state = ScanState::Idle;
            return Ok(());
        }
        if !dev.reg.has(REG01) {
            return scan::stop_motor(dev, &LAYOUT);
        }
        dev.state = ScanState::Stopping;

        let mut local = dev.reg.clone();
        local.clear_bits(REG01, REG01_SCAN)?;
        motor_off(&mut local, 0)?;
        dev.write_registers(&local)?;
        dev.sleep_ms(100);

        for _ in 0..dev.timeouts.stop_retries {
            let status = dev.read_status(&LAYOUT)?;
            let state = dev.read_scan_state(&LAYOUT)?;
            if !state.intersects(ScanStateBits::DATAENB | ScanStateBits::MOTMFLG)
                && !status.contains(StatusBits::MOTORENB)
            {
                dev.state = ScanState::Idle;
                return Ok(());
            }
            dev.sleep_ms(100);
        }
        Err(GenesysError::io("could not stop motor").into())
    }

    fn slow_back_home(&self, dev: &mut Device, wait_until_home: bool) -> Result<()> {
        let tables = Arc::clone(&dev.tables);
        if tables.model.is_sheetfed {
            tracing::debug!("no home position on a sheet-fed scanner");
            return Ok(());
        }
        // the home sensor is only readable with the GPIOs at their boot values
        if is_lide35(&tables)
            && let Some(v) = gpio_value(&tables, REG6C)
        {
            dev.write_register(REG6C, v)?;
        }
        self.save_power(dev, false)?;

        if scan::head_at_home(dev, &LAYOUT)? {
            dev.scanhead_position_in_steps = 0;
            return Ok(());
        }

        dev.reg.clear_bits(REG01, REG01_SCAN)?;
        let r01 = dev.reg.get8(REG01)?;
        dev.write_register(REG01, r01)?;
        if dev.read_status(&LAYOUT)?.contains(StatusBits::MOTORENB) {
            self.stop_action(dev)?;
        }

        let mut regs = dev.reg.clone();
        self.motor_move_regs(dev, &mut regs, HOME_STEPS, MoveAction::GoHome, MotorFlags::empty())?;
        regs.clear_bits(REG01, REG01_SCAN)?;
        scan::run_home_move(dev, self, regs, wait_until_home)
    }

    fn feed(&self, dev: &mut Device, steps: u32) -> Result<()> {
        tracing::debug!(steps, "feed");
        self.stop_action(dev)?;

        let mut regs = dev.reg.clone();
        regs.clear_bits(REG01, REG01_SCAN)?;
        self.motor_move_regs(dev, &mut regs, steps, MoveAction::Feed, MotorFlags::empty())?;
        dev.write_registers(&regs)?;
        dev.state = ScanState::Feeding;
        scan::start_motor(dev, self)?;

        for _ in 0..dev.timeouts.poll_retries {
            if !dev.read_status(&LAYOUT)?.contains(StatusBits::MOTORENB) {
                dev.scanhead_position_in_steps += steps;
                dev.state = ScanState::Idle;
                return Ok(());
            }
            dev.sleep_ms(dev.timeouts.poll_interval_ms);
        }
        if let Err(e) = self.stop_action(dev) {
            tracing::warn!(error = %e, "stop after feed timeout");
        }
        Err(GenesysError::io("timeout while waiting for feed to complete").into())
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
            flags: SEARCH_FLAGS,
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
        self.slow_back_home(dev, true)
    }

    fn eject_document(&self, dev: &mut Device) -> Result<()> {
        let tables = Arc::clone(&dev.tables);
        if !tables.model.is_sheetfed {
            tracing::debug!("nothing to eject on a flatbed");
            return Ok(());
        }
        self.stop_action(dev)?;

        let mut regs = dev.reg.clone();
        regs.clear_bits(REG01, REG01_SCAN)?;
        self.motor_move_regs(dev, &mut regs, HOME_STEPS, MoveAction::Feed, MotorFlags::empty())?;
        dev.write_registers(&regs)?;
        scan::start_motor(dev, self)?;

        if paper_loaded(dev)? {
            tracing::debug!("paper still loaded");
            dev.document = true;
            dev.scanhead_position_in_steps = 0;
            let mut gone = false;
            for _ in 0..dev.timeouts.poll_retries {
                if !paper_loaded(dev)? {
                    gone = true;
                    break;
                }
                dev.sleep_ms(dev.timeouts.poll_interval_ms);
            }
            if !gone {
                if let Err(e) = self.stop_action(dev) {
                    tracing::warn!(error = %e, "stop after eject timeout");
                }
                return Err(GenesysError::io("timeout while waiting for the document to leave").into());
            }
        }

        let mut feed_mm = tables.model.eject_feed_mm;
        if dev.document {
            feed_mm += tables.model.post_scan_mm;
        }
        let target = read_counter(dev, REG_FEDCNT)? + mm_to_units(feed_mm, tables.motor.base_ydpi);
        for _ in 0..dev.timeouts.poll_retries {
            let steps = read_counter(dev, REG_FEDCNT)?;
            tracing::trace!(steps, target, "eject feed");
            if steps > target {
                break;
            }
            dev.sleep_ms(dev.timeouts.poll_interval_ms);
        }
        self.stop_action(dev)?;
        dev.document = false;
        Ok(())
    }

    fn load_document(&self, dev: &mut Device) -> Result<()> {
        for _ in 0..dev.timeouts.poll_retries {
            if paper_loaded(dev)? {
                tracing::debug!("document inserted");
                dev.document = true;
                // time to place the sheet
                dev.sleep_ms(1000);
                return Ok(());
            }
            dev.sleep_ms(dev.timeouts.poll_interval_ms);
        }
        Err(GenesysError::io("timeout while waiting for document").into())
    }

    fn detect_document_end(&self, dev: &mut Device) -> Result<bool> {
        if !dev.document || paper_loaded(dev)? {
            return Ok(false);
        }
        tracing::debug!("no more document");
        dev.document = false;

        let mut scancnt = match read_counter(dev, REG_SCANCNT) {
            Ok(v) => v,
            Err(e) => {
                dev.total_bytes_to_read = dev.total_bytes_read;
                return Err(e);
            }
        };
        if dev.settings.scan_mode == ScanMode::Color && dev.tables.model.is_cis {
            scancnt /= 3;
        }
        let postcnt = mm_to_units(dev.tables.model.post_scan_mm, dev.settings.yres);
        let line_bytes = dev.reg.get_field(&LAYOUT, Field::Maxwd)?;
        let total = u64::from(scancnt + postcnt) * u64::from(line_bytes);
        tracing::debug!(scancnt, postcnt, old = dev.total_bytes_to_read, new = total, "document end");
        if dev.total_bytes_to_read > total {
            dev.total_bytes_to_read = total;
        }
        Ok(true)
    }

    // ── calibration ───────────────────────────────────────────────────────

    fn offset_calibration(&self, dev: &mut Device, regs: &mut RegisterSet) -> Result<()> {
        let params = calibration_params(
            &dev.tables.sensor,
            CALIBRATION_FLAGS | ScanFlags::USE_OPTICAL_RES | ScanFlags::DISABLE_LAMP,
        );
        *regs = dev.reg.clone();
        calibration::prepare_static_scan(dev, self, regs, &params)?;
        let shape = FrameShape::of(dev);

        let offsets = if Self::frontend_select(dev)? == FESET_AD {
            let max_passes = dev.tuning.offset_max_passes;
            let offset = calibration::offset_search(0, 255, AD_DARK_TARGET, max_passes, |offset| {
                let levels = self.dark_levels(dev, regs, [offset; 3], &shape)?;
                Ok(mean(&levels))
            })?;
            [offset; 3]
        } else {
            self.wolfson_offsets(dev, regs, &shape)?
        };
        dev.frontend.set_offsets(offsets);
        self.set_fe(dev, FrontendAction::Set)?;
        tracing::info!(?offsets, "offset calibrated");
        Ok(())
    }

    fn coarse_gain_calibration(&self, dev: &mut Device, regs: &mut RegisterSet, _dpi: u32) -> Result<()> {
        let travel = Self::travel_to_white(dev);
        if travel > 0 {
            self.feed(dev, travel)?;
        }
        let params = calibration_params(&dev.tables.sensor, CALIBRATION_FLAGS | ScanFlags::USE_OPTICAL_RES);
        *regs = dev.reg.clone();
        calibration::prepare_static_scan(dev, self, regs, &params)?;
        let shape = FrameShape::of(dev);

        let data = calibration::scan_frame(dev, self, regs, shape.size)?;
        let levels = shape.frame(&data).per_channel(|f, ch| f.channel_max(ch));
        let codes = calibration::coarse_gains(levels, COARSE_TARGET, dev.settings.channels(), dev.tables.model.is_cis)?;
        dev.frontend.set_gains(codes);
        self.set_fe(dev, FrontendAction::Set)?;
        tracing::info!(?levels, ?codes, "coarse gain calibrated");
        self.slow_back_home(dev, true)
    }

    fn led_calibration(&self, dev: &mut Device, regs: &mut RegisterSet) -> Result<[u16; 3]> {
        let travel = Self::travel_to_white(dev);
        if travel > 0 {
            self.feed(dev, travel)?;
        }
        let tables = Arc::clone(&dev.tables);
        let params = calibration_params(&tables.sensor, CALIBRATION_FLAGS | ScanFlags::USE_OPTICAL_RES);
        *regs = dev.reg.clone();
        calibration::prepare_static_scan(dev, self, regs, &params)?;
        let shape = FrameShape::of(dev);

        let initial = dev.exposure;
        let tuning = dev.tuning;
        let policy = LedPolicy::for_sensor(&tables.sensor, initial, &tuning);
        let exposure = calibration::led_search(initial, policy, tuning.led_max_iterations, |exposure| {
            regs.set_exposure(&LAYOUT, exposure)?;
            let data = calibration::scan_frame(dev, self, regs, shape.size)?;
            Ok(shape.frame(&data).means())
        })?;

        dev.exposure = exposure;
        dev.reg.set_exposure(&LAYOUT, exposure)?;
        if travel > 0 {
            self.slow_back_home(dev, true)?;
        }
        Ok(exposure)
    }

    fn update_hardware_sensors(&self, dev: &mut Device) -> Result<HardwareSensors> {
        let tables = Arc::clone(&dev.tables);
        if is_lide35(&tables) {
            let v = dev.read_register(REG6D)?;
            return Ok(HardwareSensors {
                scan: v & 0x01 == 0,
                file: v & 0x02 == 0,
                email: v & 0x04 == 0,
                copy: v & 0x08 == 0,
                ..HardwareSensors::default()
            });
        }
        if tables.model.is_sheetfed {
            let v = dev.read_register(REG6D)?;
            return Ok(HardwareSensors {
                paper_present: v & 0x01 == 0,
                scan: v & 0x02 == 0,
                ..HardwareSensors::default()
            });
        }
        command_set::read_button_map(dev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{FakeClock, MockTransport, device_for};
    use genesys_config::{CalibrationTuning, Timeouts};
    use genesys_hardware::{SimProfile, SimulatedAsic};
    use rstest::rstest;

    fn booted_sim() -> (SimulatedAsic, Device) {
        let sim = SimulatedAsic::new(SimProfile::gl841());
        let mut dev = device_for("canon-lide-35", sim.clone(), &FakeClock::new()).unwrap();
        Gl841.asic_boot(&mut dev, true).unwrap();
        (sim, dev)
    }

    /// A booted LiDE 35 turned into a sheet-fed model without the LiDE GPIOs.
    fn sheetfed(mock: &MockTransport) -> Device {
        let db = genesys_config::builtin().unwrap();
        let mut tables = DeviceTables::from_database(&db, "canon-lide-35").unwrap();
        tables.model.is_sheetfed = true;
        tables.model.eject_feed_mm = 1.0;
        tables.gpio = None;
        let mut dev = Device::new(
            Box::new(mock.clone()),
            Box::new(FakeClock::new()),
            Arc::new(tables),
            Timeouts::default(),
            CalibrationTuning::default(),
        );
        Gl841.asic_boot(&mut dev, true).unwrap();
        mock.set_register(REG6D, 0x01);
        dev
    }

    fn color_session(dev: &Device, xres: u32) -> ScanSession {
        let params = ScanSessionParams {
            xres,
            yres: xres,
            startx: 0,
            starty: 100,
            pixels: 2550 * xres / 300,
            lines: 100,
            depth: 8,
            channels: 3,
            scan_mode: ScanMode::Color,
            color_filter: ColorFilter::Green,
            flags: ScanFlags::empty(),
        };
        Gl841.compute_session(dev, &params).unwrap()
    }

    #[test]
    fn boot_loads_the_register_defaults() {
        let mock = MockTransport::new();
        let mut dev = device_for("canon-lide-35", mock.clone(), &FakeClock::new()).unwrap();
        Gl841.asic_boot(&mut dev, true).unwrap();

        assert_eq!(&mock.writes()[..2], &[(REG0E, 0x01), (REG0E, 0x00)]);
        assert_eq!(dev.reg.get8(REG01).unwrap(), REG01_DVDSET | REG01_CISSET);
        assert_eq!(dev.reg.get8(REG02).unwrap(), 0x38);
        assert_eq!(dev.reg.get8(REG05).unwrap() & scan::REG05_DPIHW, 0x40);
        // sensor clock phases moved to 0x70.., GPO18 on, GPO17 off
        assert_eq!(dev.reg.get8(0x19).unwrap(), 0x50);
        assert_eq!(dev.reg.get8(REG6B).unwrap() & (REG6B_GPO17 | REG6B_GPO18), REG6B_GPO18);
        assert_eq!(dev.reg.get_exposure(&LAYOUT).unwrap(), [0x0e00, 0x0c00, 0x0a00]);
        assert_eq!(mock.register(REG6C), Some(0x81));
        assert_eq!(dev.calib_reg, dev.reg);
    }

    #[test]
    fn scan_registers_match_the_session() {
        let (sim, mut dev) = booted_sim();
        let session = color_session(&dev, 300);
        let mut regs = dev.reg.clone();
        Gl841.init_scan_regs(&mut dev, &mut regs, &session).unwrap();

        assert_eq!(regs.get_field(&LAYOUT, Field::Dpiset).unwrap(), 300);
        assert_eq!(regs.get_field(&LAYOUT, Field::Strpixel).unwrap(), 88);
        assert_eq!(regs.get_field(&LAYOUT, Field::Endpixel).unwrap(), 88 + 10_200);
        assert_eq!(regs.get_field(&LAYOUT, Field::Maxwd).unwrap(), 7650);
        // CCD read-out dominates the LED and motor limits
        assert_eq!(regs.get_field(&LAYOUT, Field::Lperiod).unwrap(), 10_320);
        // a CIS color line is three gray lines
        assert_eq!(regs.get_field(&LAYOUT, Field::Lincnt).unwrap(), 300);
        assert_eq!(regs.get8(REG04).unwrap() & (REG04_BITSET | REG04_LINEART), 0);
        assert_ne!(regs.get8(REG02).unwrap() & REG02_MTRPWR, 0);
        assert_ne!(regs.get8(REG6C).unwrap() & REG6C_GPIO16, 0);
        assert_eq!(regs.get_exposure(&LAYOUT).unwrap(), [0x0e00, 0x0c00, 0x0a00]);
        assert_eq!(dev.current_setup.pixels, 2550);
        assert_eq!(dev.current_setup.exposure_time, 10_320);

        let uploads = sim.bulk_writes();
        assert!(uploads.len() >= 8);
        assert!(uploads.iter().all(|(ep, d)| *ep == BULK_RAM && d.len() == 2 * SLOPE_ENTRIES));
    }

    #[rstest]
    #[case(1, 61)]
    #[case(2, 62)]
    #[case(5, 5)]
    #[case(40, 61)]
    #[case(100, 3)]
    fn restep_counts_balance_both_tables(#[case] scan: u32, #[case] back: u32) {
        let (fwd, bwd) = restep_counts(scan, back);
        assert_eq!(2 * scan + fwd, 2 * back + bwd);
        assert!(2 * scan + fwd >= 0x20);
        assert!(fwd >= 2 && bwd >= 2);
    }

    #[rstest]
    #[case(150)]
    #[case(300)]
    #[case(600)]
    #[case(1200)]
    fn scan_and_backtrack_restep_agree(#[case] xres: u32) {
        let (_sim, mut dev) = booted_sim();
        let session = color_session(&dev, xres);
        let mut regs = dev.reg.clone();
        Gl841.init_scan_regs(&mut dev, &mut regs, &session).unwrap();

        let g = geometry(&dev, &session).unwrap();
        let motor = &dev.tables.motor;
        let slow = slope::create_slope_table3(motor, SLOPE_ENTRIES, 256, g.step_type, g.exposure, g.slope_dpi).unwrap();
        let back = slope::create_slope_table3(motor, SLOPE_ENTRIES, 256, g.step_type, 0, g.slope_dpi).unwrap();

        let fwdstep = regs.get_field(&LAYOUT, Field::Fwdstep).unwrap();
        let bwdstep = regs.get_field(&LAYOUT, Field::Bwdstep).unwrap();
        assert_eq!(2 * slow.used_steps + fwdstep, 2 * back.used_steps + bwdstep);
        assert_eq!(regs.get_field(&LAYOUT, Field::Stepno).unwrap(), slow.used_steps.div_ceil(2));
        assert_eq!(regs.get_field(&LAYOUT, Field::Fastno).unwrap(), back.used_steps.div_ceil(2));
    }

    #[rstest]
    #[case(1200)]
    #[case(600)]
    #[case(400)]
    #[case(150)]
    #[case(100)]
    fn resolutions_dividing_the_optical_one_are_accepted(#[case] xres: u32) {
        let (_sim, dev) = booted_sim();
        let session = color_session(&dev, xres);
        assert_eq!(session.output_resolution, xres);
    }

    #[test]
    fn other_resolutions_are_rejected() {
        let (_sim, dev) = booted_sim();
        let params = ScanSessionParams {
            xres: 75,
            yres: 75,
            startx: 0,
            starty: 0,
            pixels: 600,
            lines: 10,
            depth: 8,
            channels: 3,
            scan_mode: ScanMode::Color,
            color_filter: ColorFilter::Green,
            flags: ScanFlags::empty(),
        };
        let err = Gl841.compute_session(&dev, &params).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GenesysError>(),
            Some(GenesysError::UnsupportedResolution { resolution: 75, optical: 1200 })
        ));
    }

    #[test]
    fn wolfson_gains_and_offsets_land_in_the_afe() {
        let (sim, mut dev) = booted_sim();
        dev.frontend.set_gains([7, 8, 9]);
        Gl841.set_fe(&mut dev, FrontendAction::Set).unwrap();
        assert_eq!(sim.afe_register(0x28), Some(7));
        assert_eq!(sim.afe_register(0x2a), Some(9));
        assert_eq!(sim.afe_register(0x20), Some(0xe1));
        assert_eq!(sim.afe_register(0x01), Some(0x3d));
    }

    #[test]
    fn analog_devices_init_clears_gain_and_offset() {
        let mock = MockTransport::new();
        mock.set_register(REG04, 0x20 | FESET_AD);
        let mut dev = device_for("canon-lide-35", mock.clone(), &FakeClock::new()).unwrap();
        Gl841.set_fe(&mut dev, FrontendAction::Init).unwrap();

        let addresses: Vec<u8> = mock.writes().iter().filter(|(a, _)| *a == 0x51).map(|(_, v)| *v).collect();
        assert_eq!(addresses, vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(mock.register(0x3b), Some(0));
    }

    #[test]
    fn unknown_frontend_is_rejected() {
        let mock = MockTransport::new();
        mock.set_register(REG04, 0x01);
        let mut dev = device_for("canon-lide-35", mock, &FakeClock::new()).unwrap();
        let err = Gl841.set_fe(&mut dev, FrontendAction::Set).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GenesysError>(),
            Some(GenesysError::NotSupported { operation: "set_fe", .. })
        ));
    }

    #[test]
    fn power_saving_programs_the_lamp_timer() {
        let (sim, mut dev) = booted_sim();
        Gl841.set_powersaving(&mut dev, 15).unwrap();
        assert_eq!(sim.register(REG03), 0x59);
        assert_eq!(sim.register(0x38), 0x47);
        assert_eq!(sim.register(0x39), 0x87);
        assert_eq!(sim.register(REG1C) & REG1C_TGTIME, 0);
    }

    #[test]
    fn power_saving_off_stops_the_lamp_timer() {
        let (sim, mut dev) = booted_sim();
        Gl841.set_powersaving(&mut dev, 0).unwrap();
        assert_eq!(sim.register(REG03), 0x50);
        assert_eq!(sim.register(0x38), 0);
        assert_eq!(sim.register(0x39), 0);
    }

    #[test]
    fn init_settles_once_and_sets_power_saving() {
        let (sim, mut dev) = booted_sim();
        Gl841.init(&mut dev).unwrap();
        assert!(dev.already_initialized);
        assert_eq!(sim.register(REG03), 0x59);
        assert_eq!(sim.motor_starts(), 1);

        let writes = sim.register_log().len();
        Gl841.init(&mut dev).unwrap();
        assert_eq!(sim.register_log().len(), writes);
    }

    #[test]
    fn offset_calibration_reaches_the_dark_target() {
        let (_sim, mut dev) = booted_sim();
        let mut regs = RegisterSet::new();
        Gl841.offset_calibration(&mut dev, &mut regs).unwrap();
        // the simulated dark level is (offset / 2 + 2) * 256
        assert_eq!(dev.frontend.offsets(), [16; 3]);
    }

    #[test]
    fn coarse_gain_is_shared_by_the_cis_channels() {
        let (sim, mut dev) = booted_sim();
        let mut regs = RegisterSet::new();
        Gl841.coarse_gain_calibration(&mut dev, &mut regs, 300).unwrap();
        let gains = dev.frontend.gains();
        assert!(gains.iter().all(|&g| g == gains[0]));
        assert!(sim.is_at_home());
        assert_eq!(dev.scanhead_position_in_steps, 0);
    }

    #[test]
    fn led_calibration_stores_the_exposure() {
        let (_sim, mut dev) = booted_sim();
        let mut regs = RegisterSet::new();
        let exposure = Gl841.led_calibration(&mut dev, &mut regs).unwrap();
        assert!(exposure.iter().all(|&e| e > 0));
        assert!(exposure[0] < 0x0e00);
        assert!(exposure[0] > exposure[2]);
        assert_eq!(dev.exposure, exposure);
        assert_eq!(dev.reg.get_exposure(&LAYOUT).unwrap(), exposure);
    }

    #[test]
    fn home_move_reaches_the_sensor() {
        let (sim, mut dev) = booted_sim();
        sim.move_head_away();
        Gl841.slow_back_home(&mut dev, true).unwrap();
        assert!(sim.is_at_home());
        assert_eq!(sim.motor_starts(), 1);
        assert_eq!(dev.scanhead_position_in_steps, 0);
        assert_ne!(sim.register(REG02) & REG02_MTRREV, 0);
    }

    #[test]
    fn home_is_a_no_op_when_parked() {
        let (sim, mut dev) = booted_sim();
        Gl841.slow_back_home(&mut dev, true).unwrap();
        assert_eq!(sim.motor_starts(), 0);
        // home sensor GPIOs restored first
        assert_eq!(sim.register(REG6C) & REG6C_GPIO9, 0);
    }

    #[test]
    fn feed_moves_forward_and_tracks_the_position() {
        let (sim, mut dev) = booted_sim();
        Gl841.feed(&mut dev, 1000).unwrap();
        assert_eq!(sim.motor_starts(), 1);
        assert!(!sim.is_at_home());
        assert_eq!(dev.scanhead_position_in_steps, 1000);
        assert_eq!(sim.register(REG01) & REG01_SCAN, 0);
        assert_eq!(sim.register(REG02) & REG02_MTRREV, 0);
        assert_eq!(dev.state, ScanState::Idle);
    }

    #[test]
    fn feed_reports_a_motor_that_never_stops() {
        let (sim, mut dev) = booted_sim();
        sim.set_stuck_motor(true);
        let err = Gl841.feed(&mut dev, 1000).unwrap_err();
        assert!(matches!(err.downcast_ref::<GenesysError>(), Some(GenesysError::Io { .. })));
    }

    #[test]
    fn whole_line_shading_is_one_upload() {
        let (sim, mut dev) = booted_sim();
        let data = vec![0x5au8; 3 * 10_400 * 4];
        let before = sim.bulk_writes().len();
        Gl841.send_shading_data(&mut dev, &data).unwrap();

        let uploads = &sim.bulk_writes()[before..];
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0], (BULK_RAM, data));
        assert_eq!(sim.register(REG_BUFFER_ADDR_LO), 0);
        assert_eq!(sim.register(REG_BUFFER_ADDR_HI), 0);
    }

    #[test]
    fn shading_area_uploads_one_window_per_channel() {
        let (sim, mut dev) = booted_sim();
        dev.reg.set_bits(REG01, REG01_SHDAREA).unwrap();
        dev.reg.set_field(&LAYOUT, Field::Strpixel, 88).unwrap();
        dev.reg.set_field(&LAYOUT, Field::Endpixel, 88 + 100).unwrap();
        let data = vec![0x11u8; 3 * 10_400 * 4];
        let before = sim.bulk_writes().len();
        Gl841.send_shading_data(&mut dev, &data).unwrap();

        let uploads = &sim.bulk_writes()[before..];
        assert_eq!(uploads.len(), 3);
        assert!(uploads.iter().all(|(_, d)| d.len() == 400));
        // last channel at 3 * 0x5400 >> 4
        assert_eq!(sim.register(REG_BUFFER_ADDR_LO), 0x80);
        assert_eq!(sim.register(REG_BUFFER_ADDR_HI), 0x0a);
    }

    #[test]
    fn lide35_buttons_read_active_low() {
        let mock = MockTransport::new();
        mock.set_register(REG6D, 0x0a);
        let mut dev = device_for("canon-lide-35", mock, &FakeClock::new()).unwrap();
        let sensors = Gl841.update_hardware_sensors(&mut dev).unwrap();
        assert!(sensors.scan);
        assert!(!sensors.file);
        assert!(sensors.email);
        assert!(!sensors.copy);
        assert!(!sensors.paper_present);
    }

    #[test]
    fn sheetfed_paper_sensor_is_reported() {
        let mock = MockTransport::new();
        let mut dev = sheetfed(&mock);
        mock.set_register(REG6D, 0x02);
        let sensors = Gl841.update_hardware_sensors(&mut dev).unwrap();
        assert!(sensors.paper_present);
        assert!(!sensors.scan);
    }

    #[test]
    fn load_waits_for_the_sheet() {
        let mock = MockTransport::new();
        let mut dev = sheetfed(&mock);
        mock.script_reads(REG6D, [0x01, 0x01, 0x00]);
        Gl841.load_document(&mut dev).unwrap();
        assert!(dev.document);
    }

    #[test]
    fn load_times_out_without_a_sheet() {
        let mock = MockTransport::new();
        let mut dev = sheetfed(&mock);
        let err = Gl841.load_document(&mut dev).unwrap_err();
        assert!(matches!(err.downcast_ref::<GenesysError>(), Some(GenesysError::Io { .. })));
        assert!(!dev.document);
    }

    #[test]
    fn eject_feeds_until_the_sheet_is_out() {
        let mock = MockTransport::new();
        let mut dev = sheetfed(&mock);
        mock.script_reads(REG6D, [0x00, 0x00, 0x01]);
        mock.script_reads(REG_FEDCNT + 2, [0, 10, 60]);
        Gl841.eject_document(&mut dev).unwrap();
        assert!(!dev.document);
        assert!(mock.writes().contains(&(scan::REG0F, 0x01)));
    }

    #[test]
    fn eject_is_a_no_op_on_flatbeds() {
        let (sim, mut dev) = booted_sim();
        let before = sim.register_log().len();
        Gl841.eject_document(&mut dev).unwrap();
        assert_eq!(sim.register_log().len(), before);
    }

    #[test]
    fn document_end_shortens_the_transfer() {
        let mock = MockTransport::new();
        let mut dev = sheetfed(&mock);
        dev.document = true;
        dev.settings.scan_mode = ScanMode::Color;
        dev.reg.set_field(&LAYOUT, Field::Maxwd, 1000).unwrap();
        dev.total_bytes_to_read = 1_000_000;
        // 300 CIS lines, three per color line
        mock.set_register(REG_SCANCNT + 1, 0x01);
        mock.set_register(REG_SCANCNT + 2, 0x2c);

        assert!(Gl841.detect_document_end(&mut dev).unwrap());
        assert!(!dev.document);
        assert_eq!(dev.total_bytes_to_read, 100_000);
        assert!(!Gl841.detect_document_end(&mut dev).unwrap());
    }
}
