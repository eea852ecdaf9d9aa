//! Scan control: motor start with cleanup, stop, and the bounded polling
//! loops shared by every ASIC generation.

use crate::command_set::CommandSet;
use crate::device::Device;
use crate::error::{GenesysError, Result};
use crate::layout::RegisterLayout;
use crate::register::RegisterSet;
use crate::status::{ScanState, ScanStateBits, StatusBits};

pub const REG01: u16 = 0x01;
pub const REG01_CISSET: u8 = 0x80;
pub const REG01_DVDSET: u8 = 0x20;
pub const REG01_STAGGER: u8 = 0x10;
pub const REG01_SHDAREA: u8 = 0x02;
pub const REG01_SCAN: u8 = 0x01;

pub const REG02: u16 = 0x02;
pub const REG02_NOTHOME: u8 = 0x80;
pub const REG02_ACDCDIS: u8 = 0x40;
pub const REG02_AGOHOME: u8 = 0x20;
pub const REG02_MTRPWR: u8 = 0x10;
pub const REG02_FASTFED: u8 = 0x08;
pub const REG02_MTRREV: u8 = 0x04;

pub const REG03: u16 = 0x03;
pub const REG03_AVEENB: u8 = 0x40;
pub const REG03_LAMPPWR: u8 = 0x10;

pub const REG05: u16 = 0x05;
pub const REG05_DPIHW: u8 = 0xc0;
pub const REG05_GMMENB: u8 = 0x08;

pub const REG0D: u16 = 0x0d;
pub const REG0D_CLRMCNT: u8 = 0x04;
pub const REG0D_CLRLNCNT: u8 = 0x01;

pub const REG0F: u16 = 0x0f;

/// Delay between the stop request and the first stop poll.
const STOP_SETTLE_MS: u64 = 100;

pub fn set_motor_power(regs: &mut RegisterSet, on: bool) -> Result<()> {
    if on {
        regs.set_bits(REG02, REG02_MTRPWR)
    } else {
        regs.clear_bits(REG02, REG02_MTRPWR)
    }
}

/// Select the timing generator resolution in REG05.
pub fn set_dpihw(regs: &mut RegisterSet, dpihw: u32) -> Result<()> {
    let bits = match dpihw {
        600 => 0x00,
        1200 => 0x40,
        2400 => 0x80,
        4800 => 0xc0,
        other => {
            return Err(GenesysError::invalid(format!("no hardware dpi setting for {other}")).into());
        }
    };
    regs.set8_mask(REG05, bits, REG05_DPIHW)
}

/// Lamp on or off. CIS sensors light through the LED exposure registers, so
/// switching off also zeroes them.
pub fn set_lamp_power(regs: &mut RegisterSet, layout: &RegisterLayout, on: bool, exposure: [u16; 3]) -> Result<()> {
    if on {
        regs.set_bits(REG03, REG03_LAMPPWR)?;
        regs.set_exposure(layout, exposure)
    } else {
        regs.clear_bits(REG03, REG03_LAMPPWR)?;
        regs.set_exposure(layout, [0; 3])
    }
}

/// Cleanup for a motor start.
///
/// While armed, dropping the guard stops the motor and writes the device's
/// live registers back. Failures during cleanup are logged and swallowed, so
/// the error that made the caller bail out is the one it returns.
pub struct StartGuard<'a> {
    dev: &'a mut Device,
    cs: &'a dyn CommandSet,
    armed: bool,
}

impl<'a> StartGuard<'a> {
    pub fn new(dev: &'a mut Device, cs: &'a dyn CommandSet) -> Self {
        Self {
            dev,
            cs,
            armed: true,
        }
    }

    pub fn device(&mut self) -> &mut Device {
        self.dev
    }

    /// The start went through; keep the new registers.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!("motor start failed, cleaning up");
        if let Err(e) = self.cs.stop_action(self.dev) {
            tracing::warn!(error = %e, "stop after failed start");
        }
        if let Err(e) = self.dev.restore_registers() {
            tracing::warn!(error = %e, "register restore after failed start");
        }
        self.dev.state = ScanState::Idle;
    }
}

/// Start the motor; on failure stop it and restore the live registers.
pub fn start_motor(dev: &mut Device, cs: &dyn CommandSet) -> Result<()> {
    let mut guard = StartGuard::new(dev, cs);
    cs.start_action(guard.device())?;
    guard.disarm();
    Ok(())
}

/// Request a stop and poll until data and motor flags clear.
pub fn stop_motor(dev: &mut Device, layout: &RegisterLayout) -> Result<()> {
    let status = dev.read_status(layout)?;
    let state = dev.read_scan_state(layout)?;
    if !state.intersects(ScanStateBits::DATAENB | ScanStateBits::MOTMFLG) {
        tracing::debug!(status = %status.describe(), "already stopped");
        dev.state = ScanState::Idle;
        return Ok(());
    }
    dev.state = ScanState::Stopping;

    let current = match dev.reg.get8(REG01) {
        Ok(v) => v,
        Err(_) => dev.read_register(REG01)?,
    };
    let val = current & !REG01_SCAN;
    if dev.reg.has(REG01) {
        dev.reg.set8(REG01, val)?;
    }
    dev.write_register(REG01, val)?;
    dev.sleep_ms(STOP_SETTLE_MS);

    for _ in 0..dev.timeouts.stop_retries {
        let status = dev.read_status(layout)?;
        let state = dev.read_scan_state(layout)?;
        if !state.intersects(ScanStateBits::DATAENB | ScanStateBits::MOTMFLG)
            && !status.contains(StatusBits::MOTORENB)
        {
            dev.state = ScanState::Idle;
            return Ok(());
        }
        dev.sleep_ms(STOP_SETTLE_MS);
    }
    Err(GenesysError::io("could not stop motor").into())
}

/// True when the head sits on the home sensor. The first status read after a
/// move is unreliable, so the second one decides.
pub fn head_at_home(dev: &mut Device, layout: &RegisterLayout) -> Result<bool> {
    let first = dev.read_status(layout)?;
    tracing::trace!(status = %first.describe(), "home check");
    dev.sleep_ms(dev.timeouts.poll_interval_ms);
    Ok(dev.read_status(layout)?.contains(StatusBits::HOMESNR))
}

/// Poll the home sensor; stop the motor once it trips.
pub fn wait_for_home(dev: &mut Device, cs: &dyn CommandSet) -> Result<()> {
    let layout = cs.layout();
    for attempt in 0..dev.timeouts.poll_retries {
        if dev.read_status(layout)?.contains(StatusBits::HOMESNR) {
            tracing::debug!(attempt, "reached home position");
            cs.stop_action(dev)?;
            dev.scanhead_position_in_steps = 0;
            dev.state = ScanState::Idle;
            return Ok(());
        }
        dev.sleep_ms(dev.timeouts.poll_interval_ms);
    }
    if let Err(e) = cs.stop_action(dev) {
        tracing::warn!(error = %e, "stop after home timeout");
    }
    Err(GenesysError::io("timeout while waiting for scanhead to go home").into())
}

/// Poll until a feed completes, then stop.
pub fn wait_for_feed(dev: &mut Device, cs: &dyn CommandSet) -> Result<()> {
    let layout = cs.layout();
    for _ in 0..dev.timeouts.poll_retries {
        if dev.read_status(layout)?.contains(StatusBits::FEEDFSH) {
            return cs.stop_action(dev);
        }
        dev.sleep_ms(dev.timeouts.poll_interval_ms);
    }
    if let Err(e) = cs.stop_action(dev) {
        tracing::warn!(error = %e, "stop after feed timeout");
    }
    Err(GenesysError::io("timeout while waiting for feed to complete").into())
}

pub fn wait_for_motor_stop(dev: &mut Device, layout: &RegisterLayout) -> Result<()> {
    for _ in 0..dev.timeouts.poll_retries {
        let status = dev.read_status(layout)?;
        let state = dev.read_scan_state(layout)?;
        if !status.contains(StatusBits::MOTORENB) && !state.contains(ScanStateBits::MOTMFLG) {
            return Ok(());
        }
        dev.sleep_ms(dev.timeouts.poll_interval_ms);
    }
    Err(GenesysError::io("timeout while waiting for motor to stop").into())
}

fn clear_counters(dev: &mut Device) -> Result<()> {
    dev.write_register(REG0D, REG0D_CLRLNCNT | REG0D_CLRMCNT)
}

/// Drive the head backwards with `regs` (already programmed for a move).
pub fn run_home_move(
    dev: &mut Device,
    cs: &dyn CommandSet,
    mut regs: RegisterSet,
    wait_until_home: bool,
) -> Result<()> {
    clear_counters(dev)?;
    regs.set_bits(REG02, REG02_MTRREV)?;
    dev.write_registers(&regs)?;
    dev.state = ScanState::Homing;
    start_motor(dev, cs)?;
    if wait_until_home {
        wait_for_home(dev, cs)
    } else {
        tracing::debug!("scanhead is still moving");
        Ok(())
    }
}

/// Move forward with `regs` without acquiring data.
pub fn run_feed_move(dev: &mut Device, cs: &dyn CommandSet, mut regs: RegisterSet) -> Result<()> {
    clear_counters(dev)?;
    regs.clear_bits(REG01, REG01_SCAN)?;
    dev.write_registers(&regs)?;
    dev.state = ScanState::Feeding;
    start_motor(dev, cs)?;
    wait_for_feed(dev, cs)
}

/// Clear counters, enable acquisition and optionally start the motor.
pub fn begin_acquisition(dev: &mut Device, regs: &mut RegisterSet, start_motor: bool) -> Result<()> {
    clear_counters(dev)?;
    let val = dev.read_register(REG01)? | REG01_SCAN;
    dev.write_register(REG01, val)?;
    if regs.has(REG01) {
        regs.set8(REG01, val)?;
    }
    dev.write_register(REG0F, u8::from(start_motor))?;
    dev.state = ScanState::Scanning;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_set::for_asic;
    use crate::mocks::{FakeClock, MockTransport};
    use crate::tables::DeviceTables;
    use genesys_config::{CalibrationTuning, Timeouts};
    use std::sync::Arc;

    fn device(mock: &MockTransport, clock: &FakeClock) -> Device {
        let db = genesys_config::builtin().unwrap();
        let tables = DeviceTables::from_database(&db, "canon-lide-100").unwrap();
        Device::new(
            Box::new(mock.clone()),
            Box::new(clock.clone()),
            Arc::new(tables),
            Timeouts::default(),
            CalibrationTuning::default(),
        )
    }

    #[test]
    fn stop_is_a_no_op_when_idle() {
        let mock = MockTransport::new();
        let mut dev = device(&mock, &FakeClock::new());
        let cs = for_asic(genesys_config::AsicType::Gl847);
        stop_motor(&mut dev, cs.layout()).unwrap();
        assert!(mock.writes().is_empty());
    }

    #[test]
    fn stop_fails_after_bounded_retries() {
        let mock = MockTransport::new();
        mock.set_register(0x40, ScanStateBits::MOTMFLG.bits());
        let clock = FakeClock::new();
        let mut dev = device(&mock, &clock);
        let cs = for_asic(genesys_config::AsicType::Gl847);
        let err = stop_motor(&mut dev, cs.layout()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<GenesysError>(),
            Some(&GenesysError::io("could not stop motor"))
        );
        // settle plus one sleep per retry
        assert_eq!(clock.sleeps().len(), 1 + 10);
        assert_eq!(mock.writes(), vec![(REG01, 0x00)]);
    }

    #[test]
    fn home_wait_times_out_after_poll_budget() {
        let mock = MockTransport::new();
        let clock = FakeClock::new();
        let mut dev = device(&mock, &clock);
        dev.timeouts.poll_retries = 300;
        let cs = for_asic(genesys_config::AsicType::Gl847);
        let err = wait_for_home(&mut dev, cs.as_ref()).unwrap_err();
        assert!(err.to_string().contains("go home"));
        assert_eq!(clock.total_slept(), std::time::Duration::from_secs(30));
    }

    #[test]
    fn failed_start_restores_live_registers_once() {
        let mock = MockTransport::new();
        mock.fail_writes_to(REG0F, 1);
        let mut dev = device(&mock, &FakeClock::new());
        dev.reg.init(REG01, 0x82).unwrap();
        dev.reg.init(REG02, 0x10).unwrap();
        let cs = for_asic(genesys_config::AsicType::Gl847);

        let err = start_motor(&mut dev, cs.as_ref()).unwrap_err();
        assert!(err.to_string().contains("register write"));
        assert_eq!(mock.batches(), vec![vec![(REG01, 0x82), (REG02, 0x10)]]);
        assert_eq!(dev.state, ScanState::Idle);
    }
}
