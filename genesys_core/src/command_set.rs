//! Per-ASIC operation set.
//!
//! One implementation per ASIC generation. Operations a generation cannot
//! perform return [`GenesysError::NotSupported`] through the default bodies.

use genesys_config::AsicType;

use crate::device::{CalibrationCache, CurrentSetup, Device};
use crate::error::{GenesysError, Result};
use crate::frontend::FrontendAction;
use crate::layout::RegisterLayout;
use crate::register::RegisterSet;
use crate::scan;
use crate::session::{ScanSession, ScanSessionParams, SessionRules};
use crate::slope::SlopeSlot;

/// State of the panel buttons and paper sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwareSensors {
    pub scan: bool,
    pub file: bool,
    pub email: bool,
    pub copy: bool,
    pub extra: bool,
    pub paper_present: bool,
}

fn unsupported(operation: &'static str, asic: AsicType) -> eyre::Report {
    eyre::Report::new(GenesysError::NotSupported { operation, asic })
}

pub trait CommandSet {
    fn name(&self) -> &'static str;

    fn asic(&self) -> AsicType;

    fn layout(&self) -> &'static RegisterLayout;

    fn session_rules(&self) -> SessionRules;

    fn compute_session(&self, dev: &Device, params: &ScanSessionParams) -> Result<ScanSession> {
        ScanSession::compute(params, &dev.tables, &self.session_rules())
    }

    // ── boot ──────────────────────────────────────────────────────────────

    /// Load the boot defaults into `dev.reg` and `dev.calib_reg`.
    fn init_registers(&self, dev: &mut Device) -> Result<()>;

    fn asic_boot(&self, dev: &mut Device, cold: bool) -> Result<()>;

    /// Boot the ASIC and park the head.
    fn init(&self, dev: &mut Device) -> Result<()> {
        if dev.already_initialized {
            return Ok(());
        }
        self.asic_boot(dev, true)?;
        self.set_fe(dev, FrontendAction::Init)?;
        self.slow_back_home(dev, true)?;
        dev.already_initialized = true;
        Ok(())
    }

    fn set_fe(&self, dev: &mut Device, action: FrontendAction) -> Result<()>;

    fn set_powersaving(&self, _dev: &mut Device, minutes: u32) -> Result<()> {
        tracing::debug!(minutes, asic = %self.asic(), "power saving not programmable");
        Ok(())
    }

    fn save_power(&self, _dev: &mut Device, enable: bool) -> Result<()> {
        tracing::debug!(enable, asic = %self.asic(), "save power");
        Ok(())
    }

    // ── scan registers ────────────────────────────────────────────────────

    fn send_slope_table(&self, dev: &mut Device, slot: SlopeSlot, table: &[u16]) -> Result<()>;

    /// Program `regs` for `session`; also uploads the slope tables.
    fn init_scan_regs(
        &self,
        dev: &mut Device,
        regs: &mut RegisterSet,
        session: &ScanSession,
    ) -> Result<()>;

    /// Derive the setup the current user settings would produce.
    fn calculate_current_setup(&self, dev: &mut Device) -> Result<CurrentSetup>;

    fn init_regs_for_coarse_calibration(&self, dev: &mut Device, regs: &mut RegisterSet) -> Result<()>;

    fn init_regs_for_shading(&self, dev: &mut Device, regs: &mut RegisterSet) -> Result<ScanSession>;

    fn init_regs_for_scan(&self, dev: &mut Device) -> Result<ScanSession>;

    fn send_shading_data(&self, dev: &mut Device, data: &[u8]) -> Result<()>;

    // ── motion ────────────────────────────────────────────────────────────

    fn begin_scan(&self, dev: &mut Device, regs: &mut RegisterSet, start_motor: bool) -> Result<()>;

    fn end_scan(&self, dev: &mut Device, _regs: &mut RegisterSet, check_stop: bool) -> Result<()> {
        tracing::debug!(check_stop, "end scan");
        if dev.tables.model.is_sheetfed {
            return Ok(());
        }
        self.stop_action(dev)
    }

    fn start_action(&self, dev: &mut Device) -> Result<()> {
        dev.write_register(scan::REG0F, 0x01)
    }

    fn stop_action(&self, dev: &mut Device) -> Result<()> {
        scan::stop_motor(dev, self.layout())
    }

    fn slow_back_home(&self, dev: &mut Device, wait_until_home: bool) -> Result<()>;

    fn feed(&self, dev: &mut Device, steps: u32) -> Result<()>;

    fn search_start_position(&self, dev: &mut Device) -> Result<()>;

    fn wait_for_motor_stop(&self, dev: &mut Device) -> Result<()> {
        scan::wait_for_motor_stop(dev, self.layout())
    }

    fn rewind(&self, _dev: &mut Device) -> Result<()> {
        Err(unsupported("rewind", self.asic()))
    }

    fn move_to_calibration_area(&self, _dev: &mut Device) -> Result<()> {
        Err(unsupported("move_to_calibration_area", self.asic()))
    }

    fn eject_document(&self, _dev: &mut Device) -> Result<()> {
        Err(unsupported("eject_document", self.asic()))
    }

    fn load_document(&self, _dev: &mut Device) -> Result<()> {
        Err(unsupported("load_document", self.asic()))
    }

    fn detect_document_end(&self, _dev: &mut Device) -> Result<bool> {
        Err(unsupported("detect_document_end", self.asic()))
    }

    // ── calibration ───────────────────────────────────────────────────────

    fn offset_calibration(&self, dev: &mut Device, regs: &mut RegisterSet) -> Result<()>;

    fn coarse_gain_calibration(&self, dev: &mut Device, regs: &mut RegisterSet, dpi: u32) -> Result<()>;

    /// Returns the LED exposure found.
    fn led_calibration(&self, dev: &mut Device, regs: &mut RegisterSet) -> Result<[u16; 3]>;

    fn is_compatible_calibration(
        &self,
        dev: &mut Device,
        cache: &CalibrationCache,
        for_overwrite: bool,
    ) -> Result<bool> {
        let setup = self.calculate_current_setup(dev)?;
        Ok(crate::calibration::cache_matches(dev, &setup, cache, for_overwrite))
    }

    fn update_hardware_sensors(&self, dev: &mut Device) -> Result<HardwareSensors> {
        read_button_map(dev)
    }
}

/// Panel buttons as described by the model's button map.
pub fn read_button_map(dev: &mut Device) -> Result<HardwareSensors> {
    let Some(map) = dev.tables.model.buttons else {
        return Ok(HardwareSensors::default());
    };
    let v = dev.read_register(map.address)?;
    // buttons pull their line low while held
    let held = |mask: u8| mask != 0 && v & mask == 0;
    Ok(HardwareSensors {
        scan: held(map.scan),
        file: held(map.file),
        email: held(map.email),
        copy: held(map.copy),
        extra: held(map.extra),
        paper_present: false,
    })
}

/// The command set for an ASIC generation.
pub fn for_asic(asic: AsicType) -> Box<dyn CommandSet> {
    match asic {
        AsicType::Gl124 => Box::new(crate::gl124::Gl124),
        AsicType::Gl841 => Box::new(crate::gl841::Gl841),
        AsicType::Gl847 => Box::new(crate::gl847::Gl847),
    }
}
