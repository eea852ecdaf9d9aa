//! Device state: the transport, the register shadows and everything the
//! command sets mutate between operations.

use std::sync::Arc;
use std::time::Instant;

use genesys_config::{CalibrationTuning, RegisterOverlay, ScanCfg, ScanModeCfg, Timeouts};
use genesys_traits::{Clock, Transport};

use crate::error::{GenesysError, Result};
use crate::frontend::{self, Frontend};
use crate::hw_error::HwResultExt;
use crate::layout::RegisterLayout;
use crate::register::RegisterSet;
use crate::session::{ColorFilter, ScanMode, ScanSession};
use crate::status::{ScanState, ScanStateBits, StatusBits};
use crate::tables::DeviceTables;
use crate::util::mm_to_units;

/// Bulk endpoint register for image data.
pub const BULK_DATA: u8 = 0x45;

/// User scan request, in device units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanSettings {
    pub xres: u32,
    pub yres: u32,
    pub tl_x_mm: f32,
    pub tl_y_mm: f32,
    /// Output pixels per line.
    pub pixels: u32,
    pub lines: u32,
    pub depth: u32,
    pub scan_mode: ScanMode,
    pub color_filter: ColorFilter,
    /// Lineart threshold, 0..=255.
    pub threshold: u8,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::from_cfg(&ScanCfg::default())
    }
}

impl ScanSettings {
    pub fn from_cfg(cfg: &ScanCfg) -> Self {
        let scan_mode = match cfg.mode {
            ScanModeCfg::Lineart => ScanMode::Lineart,
            ScanModeCfg::Gray => ScanMode::Gray,
            ScanModeCfg::Color => ScanMode::Color,
        };
        Self {
            xres: cfg.resolution,
            yres: cfg.resolution,
            tl_x_mm: cfg.tl_x_mm,
            tl_y_mm: cfg.tl_y_mm,
            pixels: mm_to_units(cfg.width_mm, cfg.resolution).max(1),
            lines: mm_to_units(cfg.height_mm, cfg.resolution).max(1),
            depth: u32::from(cfg.depth),
            scan_mode,
            color_filter: ColorFilter::Green,
            threshold: 128,
        }
    }

    pub fn channels(&self) -> u32 {
        if self.scan_mode == ScanMode::Color { 3 } else { 1 }
    }
}

/// Key outputs of the last computed scan setup, compared to decide whether
/// a cached calibration still applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CurrentSetup {
    pub pixels: u32,
    pub lines: u32,
    pub depth: u32,
    pub channels: u32,
    pub exposure_time: u32,
    pub xres: u32,
    pub yres: u32,
    pub ccd_size_divisor: u32,
    pub stagger: u32,
    pub max_shift: u32,
}

/// Corner of the document area found by a start position search, in
/// pixels and lines at `dpi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferencePoint {
    pub dpi: u32,
    pub x: u32,
    pub y: u32,
}

/// A stored calibration result.
#[derive(Debug, Clone)]
pub struct CalibrationCache {
    pub setup: CurrentSetup,
    pub frontend: Frontend,
    pub exposure: [u16; 3],
    pub created: Instant,
}

pub struct Device {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) clock: Box<dyn Clock + Send + Sync>,
    pub tables: Arc<DeviceTables>,
    /// Live register shadow; what the ASIC holds outside of transient moves.
    pub reg: RegisterSet,
    /// Registers used by the last calibration scan.
    pub calib_reg: RegisterSet,
    pub frontend: Frontend,
    pub frontend_initial: Frontend,
    pub settings: ScanSettings,
    pub session: Option<ScanSession>,
    pub current_setup: CurrentSetup,
    pub scanhead_position_in_steps: u32,
    pub calibration_cache: Vec<CalibrationCache>,
    pub timeouts: Timeouts,
    pub tuning: CalibrationTuning,
    pub state: ScanState,
    /// LED exposure found by calibration, or the sensor default.
    pub exposure: [u16; 3],
    pub total_bytes_read: u64,
    pub total_bytes_to_read: u64,
    pub segment_order: Vec<usize>,
    pub already_initialized: bool,
    /// A sheet is loaded in the document feeder.
    pub document: bool,
    pub reference_point: Option<ReferencePoint>,
    /// Registers last written in full, for diff writes.
    last_written: Option<RegisterSet>,
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("model", &self.tables.model.id)
            .field("state", &self.state)
            .field("registers", &self.reg.len())
            .field("scanhead_position_in_steps", &self.scanhead_position_in_steps)
            .finish()
    }
}

impl Device {
    pub fn new(
        transport: Box<dyn Transport>,
        clock: Box<dyn Clock + Send + Sync>,
        tables: Arc<DeviceTables>,
        timeouts: Timeouts,
        tuning: CalibrationTuning,
    ) -> Self {
        let frontend = Frontend::from_def(&tables.frontend);
        let exposure = tables.sensor.exposure.as_array();
        Self {
            transport,
            clock,
            reg: RegisterSet::new(),
            calib_reg: RegisterSet::new(),
            frontend_initial: frontend.clone(),
            frontend,
            settings: ScanSettings::default(),
            session: None,
            current_setup: CurrentSetup::default(),
            scanhead_position_in_steps: 0,
            calibration_cache: Vec::new(),
            timeouts,
            tuning,
            state: ScanState::Idle,
            exposure,
            total_bytes_read: 0,
            total_bytes_to_read: 0,
            segment_order: Vec::new(),
            already_initialized: false,
            document: false,
            reference_point: None,
            last_written: None,
            tables,
        }
    }

    // ── register I/O ──────────────────────────────────────────────────────

    pub fn read_register(&mut self, address: u16) -> Result<u8> {
        self.transport.read_register(address).hw("register read")
    }

    pub fn write_register(&mut self, address: u16, value: u8) -> Result<()> {
        tracing::trace!(address = format_args!("{address:#05x}"), value = format_args!("{value:#04x}"), "write register");
        self.transport
            .write_register(address, value)
            .hw("register write")
    }

    /// Write every register of `regs`.
    pub fn write_registers(&mut self, regs: &RegisterSet) -> Result<()> {
        let entries = regs.entries();
        tracing::trace!(count = entries.len(), "write registers");
        self.transport
            .write_registers(&entries)
            .hw("bulk register write")?;
        self.last_written = Some(regs.clone());
        Ok(())
    }

    /// Write only the registers that differ from the last full write.
    pub fn write_registers_diff(&mut self, regs: &RegisterSet) -> Result<()> {
        let Some(previous) = self.last_written.as_ref() else {
            return self.write_registers(regs);
        };
        let changed = regs.diff(previous);
        tracing::trace!(count = changed.len(), "write changed registers");
        if !changed.is_empty() {
            self.transport
                .write_registers(&changed)
                .hw("bulk register write")?;
        }
        self.last_written = Some(regs.clone());
        Ok(())
    }

    /// Write the live register shadow back in full.
    pub fn restore_registers(&mut self) -> Result<()> {
        let regs = self.reg.clone();
        self.write_registers(&regs)
    }

    /// Write a table entry straight to the ASIC, most significant byte first.
    pub fn write_overlay(&mut self, overlay: &RegisterOverlay) -> Result<()> {
        for i in 0..u16::from(overlay.width) {
            let shift = 8 * (u16::from(overlay.width) - 1 - i);
            self.write_register(overlay.address + i, (overlay.value >> shift) as u8)?;
        }
        Ok(())
    }

    /// Program one analog frontend register.
    pub fn write_fe_data(&mut self, address: u8, value: u16) -> Result<()> {
        frontend::write_fe_data(self.transport.as_mut(), address, value)
    }

    pub fn read_status(&mut self, layout: &RegisterLayout) -> Result<StatusBits> {
        let v = self.read_register(layout.status)?;
        let bits = StatusBits::from_bits_retain(v);
        tracing::trace!(status = %bits.describe(), "status");
        Ok(bits)
    }

    pub fn read_scan_state(&mut self, layout: &RegisterLayout) -> Result<ScanStateBits> {
        Ok(ScanStateBits::from_bits_retain(
            self.read_register(layout.scan_state)?,
        ))
    }

    // ── data ──────────────────────────────────────────────────────────────

    pub fn bulk_write(&mut self, address: u8, data: &[u8]) -> Result<()> {
        self.transport.bulk_write(address, data).hw("bulk write")
    }

    pub fn write_ahb(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.transport.write_ahb(address, data).hw("AHB write")
    }

    /// Poll until the ASIC buffer holds data.
    pub fn wait_until_buffer_non_empty(&mut self, layout: &RegisterLayout) -> Result<()> {
        for _ in 0..self.timeouts.poll_retries {
            if !self.read_status(layout)?.contains(StatusBits::BUFEMPTY) {
                return Ok(());
            }
            self.sleep_ms(self.timeouts.poll_interval_ms);
        }
        Err(GenesysError::io("timeout waiting for scanner data").into())
    }

    /// Wait for data, then read `size` bytes in one transfer. Calibration
    /// and dummy-line reads use this directly and leave the scan counter alone.
    pub fn read_raw_data(&mut self, layout: &RegisterLayout, size: usize) -> Result<Vec<u8>> {
        self.wait_until_buffer_non_empty(layout)?;
        let mut buf = vec![0u8; size];
        self.transport
            .bulk_read(BULK_DATA, &mut buf)
            .hw("bulk data read")?;
        Ok(buf)
    }

    /// Read `size` bytes of the current scan and count them in `total_bytes_read`.
    pub fn read_data_from_scanner(&mut self, layout: &RegisterLayout, size: usize) -> Result<Vec<u8>> {
        let buf = self.read_raw_data(layout, size)?;
        self.total_bytes_read += size as u64;
        Ok(buf)
    }

    // ── time ──────────────────────────────────────────────────────────────

    pub fn sleep_ms(&self, ms: u64) {
        self.clock.sleep_ms(ms);
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }
}
