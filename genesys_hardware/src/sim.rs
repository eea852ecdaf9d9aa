//! In-memory model of a GLxxx ASIC.
//!
//! Good enough to drive the control layer end to end: the register file is
//! stored, motor moves complete after a fixed number of status polls, the
//! home sensor trips on reverse moves, and bulk reads return pixel data
//! derived from the programmed AFE offset/gain and LED exposure.
//!
//! The handle is cheap to clone; clones share state, so tests keep one to
//! inspect what the core wrote.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use genesys_traits::{BoxError, Transport};

use crate::error::HwError;

const PWRBIT: u8 = 0x80;
const BUFEMPTY: u8 = 0x40;
const FEEDFSH: u8 = 0x20;
const SCANFSH: u8 = 0x10;
const HOMESNR: u8 = 0x08;
const MOTORENB: u8 = 0x01;

const DATAENB: u8 = 0x01;
const MOTMFLG: u8 = 0x02;

const REG01: u16 = 0x01;
const REG01_SCAN: u8 = 0x01;
const REG02: u16 = 0x02;
const REG02_MTRREV: u8 = 0x04;
const REG04: u16 = 0x04;
const REG04_BITSET: u8 = 0x40;
const REG0D: u16 = 0x0d;
const REG0E: u16 = 0x0e;
const REG0F: u16 = 0x0f;
const REG_LINCNT: u16 = 0x25;

const FE_ADDR: u16 = 0x51;
const FE_DATA_HI: u16 = 0x3a;
const FE_DATA_LO: u16 = 0x3b;

/// Register map details that differ between ASIC generations.
#[derive(Debug, Clone)]
pub struct SimProfile {
    pub name: &'static str,
    pub status: u16,
    pub scan_state: u16,
    /// Per-channel LED exposure registers and their width in bytes.
    pub exposure: [u16; 3],
    pub exposure_width: u8,
    /// First AFE gain/offset register; `None` when the frontend has none.
    pub afe_gain: Option<u8>,
    pub afe_offset: Option<u8>,
    /// Boot value of the frontend-type bits in REG04.
    pub reg04: u8,
}

impl SimProfile {
    pub fn gl124() -> Self {
        Self {
            name: "gl124",
            status: 0x101,
            scan_state: 0x100,
            exposure: [0x8a, 0x8d, 0x90],
            exposure_width: 3,
            afe_gain: None,
            afe_offset: None,
            reg04: 0x03,
        }
    }

    pub fn gl841() -> Self {
        Self {
            name: "gl841",
            status: 0x41,
            scan_state: 0x40,
            exposure: [0x10, 0x12, 0x14],
            exposure_width: 2,
            afe_gain: Some(0x28),
            afe_offset: Some(0x20),
            reg04: 0x00,
        }
    }

    pub fn gl847() -> Self {
        Self {
            name: "gl847",
            status: 0x41,
            scan_state: 0x40,
            exposure: [0x10, 0x12, 0x14],
            exposure_width: 2,
            afe_gain: Some(0x02),
            afe_offset: Some(0x05),
            reg04: 0x02,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Motion {
    Idle,
    Forward,
    Reverse,
}

#[derive(Debug)]
struct SimState {
    profile: SimProfile,
    regs: HashMap<u16, u8>,
    afe: HashMap<u8, u16>,
    motion: Motion,
    at_home: bool,
    feed_done: bool,
    data_enabled: bool,
    polls_left: u32,
    move_polls: u32,
    read_offset: usize,
    line_bytes: Option<usize>,
    black_pixels: usize,
    response: u32,
    fail_starts: u32,
    stuck_motor: bool,
    starts: u32,
    register_log: Vec<(u16, u8)>,
    bulk_writes: Vec<(u8, Vec<u8>)>,
    ahb_writes: Vec<(u32, Vec<u8>)>,
}

/// Shared handle to a simulated ASIC.
#[derive(Debug, Clone)]
pub struct SimulatedAsic {
    inner: Rc<RefCell<SimState>>,
}

impl SimulatedAsic {
    pub fn new(profile: SimProfile) -> Self {
        let mut regs = HashMap::new();
        regs.insert(REG04, profile.reg04);
        Self {
            inner: Rc::new(RefCell::new(SimState {
                profile,
                regs,
                afe: HashMap::new(),
                motion: Motion::Idle,
                at_home: true,
                feed_done: false,
                data_enabled: false,
                polls_left: 0,
                move_polls: 3,
                read_offset: 0,
                line_bytes: None,
                black_pixels: 96,
                response: 128,
                fail_starts: 0,
                stuck_motor: false,
                starts: 0,
                register_log: Vec::new(),
                bulk_writes: Vec::new(),
                ahb_writes: Vec::new(),
            })),
        }
    }

    /// Start with the scan head away from the home sensor.
    pub fn with_head_away(self) -> Self {
        self.inner.borrow_mut().at_home = false;
        self
    }

    /// Status polls a motor move takes to complete.
    pub fn with_move_polls(self, polls: u32) -> Self {
        self.inner.borrow_mut().move_polls = polls.max(1);
        self
    }

    /// Number of dark pixels at the start of every line.
    pub fn with_black_pixels(self, pixels: usize) -> Self {
        self.inner.borrow_mut().black_pixels = pixels;
        self
    }

    /// Fail the next `n` motor start commands.
    pub fn fail_next_starts(&self, n: u32) {
        self.inner.borrow_mut().fail_starts = n;
    }

    /// Ignore stop requests; the motor keeps running.
    pub fn set_stuck_motor(&self, stuck: bool) {
        self.inner.borrow_mut().stuck_motor = stuck;
    }

    /// Move the head off the home sensor.
    pub fn move_head_away(&self) {
        self.inner.borrow_mut().at_home = false;
    }

    pub fn is_at_home(&self) -> bool {
        self.inner.borrow().at_home
    }

    pub fn register(&self, address: u16) -> u8 {
        self.inner.borrow().regs.get(&address).copied().unwrap_or(0)
    }

    /// Preset a register value without logging a write.
    pub fn poke(&self, address: u16, value: u8) {
        self.inner.borrow_mut().regs.insert(address, value);
    }

    pub fn afe_register(&self, address: u8) -> Option<u16> {
        self.inner.borrow().afe.get(&address).copied()
    }

    pub fn motor_starts(&self) -> u32 {
        self.inner.borrow().starts
    }

    pub fn register_log(&self) -> Vec<(u16, u8)> {
        self.inner.borrow().register_log.clone()
    }

    pub fn bulk_writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.inner.borrow().bulk_writes.clone()
    }

    pub fn ahb_writes(&self) -> Vec<(u32, Vec<u8>)> {
        self.inner.borrow().ahb_writes.clone()
    }
}

impl SimState {
    fn reg(&self, address: u16) -> u8 {
        self.regs.get(&address).copied().unwrap_or(0)
    }

    fn reg_wide(&self, address: u16, width: u8) -> u32 {
        (0..u16::from(width)).fold(0u32, |acc, i| (acc << 8) | u32::from(self.reg(address + i)))
    }

    fn start_motor(&mut self) -> Result<(), HwError> {
        if self.fail_starts > 0 {
            self.fail_starts -= 1;
            return Err(HwError::Injected("motor start rejected".to_string()));
        }
        self.starts += 1;
        self.motion = if self.reg(REG02) & REG02_MTRREV != 0 {
            Motion::Reverse
        } else {
            self.at_home = false;
            Motion::Forward
        };
        self.data_enabled = self.reg(REG01) & REG01_SCAN != 0;
        self.feed_done = false;
        self.polls_left = self.move_polls;
        self.read_offset = 0;
        self.line_bytes = None;
        tracing::trace!(motion = ?self.motion, data = self.data_enabled, "sim motor start");
        Ok(())
    }

    fn stop(&mut self) {
        self.data_enabled = false;
        if !self.stuck_motor {
            self.motion = Motion::Idle;
        }
    }

    fn advance(&mut self) {
        if self.motion == Motion::Idle || self.stuck_motor {
            return;
        }
        self.polls_left = self.polls_left.saturating_sub(1);
        if self.polls_left > 0 {
            return;
        }
        match self.motion {
            Motion::Reverse => {
                self.at_home = true;
                self.motion = Motion::Idle;
            }
            Motion::Forward if !self.data_enabled => {
                self.feed_done = true;
                self.motion = Motion::Idle;
            }
            _ => {}
        }
    }

    fn status(&mut self) -> u8 {
        self.advance();
        let mut v = PWRBIT;
        if !self.data_enabled {
            v |= BUFEMPTY;
            if self.motion == Motion::Idle {
                v |= SCANFSH;
            }
        }
        if self.feed_done {
            v |= FEEDFSH;
        }
        if self.at_home {
            v |= HOMESNR;
        }
        if self.motion != Motion::Idle {
            v |= MOTORENB;
        }
        v
    }

    fn scan_state(&self) -> u8 {
        let mut v = self.reg(self.profile.scan_state) & !(DATAENB | MOTMFLG);
        if self.data_enabled {
            v |= DATAENB;
        }
        if self.motion != Motion::Idle {
            v |= MOTMFLG;
        }
        v
    }

    fn afe_mean(&self, base: Option<u8>, default: u16) -> u32 {
        let Some(base) = base else {
            return u32::from(default);
        };
        let sum: u32 = (0..3u8)
            .map(|i| u32::from(self.afe.get(&(base + i)).copied().unwrap_or(default)))
            .sum();
        sum / 3
    }

    fn pixel_levels(&self) -> (u32, u32) {
        let offset = self.afe_mean(self.profile.afe_offset, 128);
        let dark = (offset / 2 + 2).min(64) * 256;

        let gain_factor = match self.profile.afe_gain {
            Some(_) => {
                let code = self.afe_mean(self.profile.afe_gain, 0).min(255);
                208.0 / (283.0 - code as f32)
            }
            None => 1.0,
        };
        let exposure: u32 = self
            .profile
            .exposure
            .iter()
            .map(|&a| self.reg_wide(a, self.profile.exposure_width))
            .sum::<u32>()
            / 3;
        let light = (exposure as f32 * self.response as f32 * gain_factor) as u32;
        let white = (dark + light).min(0xffff);
        (dark, white)
    }

    fn fill(&mut self, buf: &mut [u8]) {
        let bytes_per_sample = if self.reg(REG04) & REG04_BITSET != 0 { 2 } else { 1 };
        let line_bytes = match self.line_bytes {
            Some(n) => n,
            None => {
                let lines = (self.reg_wide(REG_LINCNT, 3) as usize).max(1);
                let n = if buf.len() % lines == 0 && buf.len() >= lines {
                    buf.len() / lines
                } else {
                    buf.len()
                };
                self.line_bytes = Some(n);
                n
            }
        };
        let line_bytes = line_bytes.max(bytes_per_sample);
        let (dark, white) = self.pixel_levels();
        let black_bytes = self.black_pixels * bytes_per_sample;

        let mut pos = self.read_offset;
        let mut i = 0;
        while i < buf.len() {
            let in_line = pos % line_bytes;
            let level = if in_line < black_bytes { dark } else { white };
            if bytes_per_sample == 2 {
                let le = (level as u16).to_le_bytes();
                let byte = in_line % 2;
                buf[i] = le[byte];
            } else {
                buf[i] = (level >> 8) as u8;
            }
            i += 1;
            pos += 1;
        }
        self.read_offset = pos;
    }
}

impl Transport for SimulatedAsic {
    fn read_register(&mut self, address: u16) -> Result<u8, BoxError> {
        let mut s = self.inner.borrow_mut();
        let v = if address == s.profile.status {
            s.status()
        } else if address == s.profile.scan_state {
            s.scan_state()
        } else {
            s.reg(address)
        };
        Ok(v)
    }

    fn write_register(&mut self, address: u16, value: u8) -> Result<(), BoxError> {
        let mut s = self.inner.borrow_mut();
        s.register_log.push((address, value));
        match address {
            REG0E if value & 0x01 != 0 => {
                let reg04 = s.profile.reg04;
                s.regs.clear();
                s.regs.insert(REG04, reg04);
                s.afe.clear();
                return Ok(());
            }
            REG0F if value != 0 => {
                s.regs.insert(address, value);
                s.start_motor()?;
                return Ok(());
            }
            REG01 => {
                if value & REG01_SCAN == 0 {
                    s.stop();
                }
            }
            REG0D => {
                s.read_offset = 0;
                s.line_bytes = None;
                s.feed_done = false;
            }
            FE_DATA_LO => {
                let addr = s.reg(FE_ADDR);
                let data = (u16::from(s.reg(FE_DATA_HI)) << 8) | u16::from(value);
                s.afe.insert(addr, data);
            }
            _ => {}
        }
        s.regs.insert(address, value);
        Ok(())
    }

    fn bulk_read(&mut self, _address: u8, buf: &mut [u8]) -> Result<(), BoxError> {
        self.inner.borrow_mut().fill(buf);
        Ok(())
    }

    fn bulk_write(&mut self, address: u8, data: &[u8]) -> Result<(), BoxError> {
        self.inner
            .borrow_mut()
            .bulk_writes
            .push((address, data.to_vec()));
        Ok(())
    }

    fn write_ahb(&mut self, address: u32, data: &[u8]) -> Result<(), BoxError> {
        self.inner
            .borrow_mut()
            .ahb_writes
            .push((address, data.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_move_reaches_home_after_configured_polls() {
        let mut asic = SimulatedAsic::new(SimProfile::gl847())
            .with_head_away()
            .with_move_polls(2);
        asic.write_register(REG02, REG02_MTRREV).unwrap();
        asic.write_register(REG0F, 1).unwrap();
        let s1 = asic.read_register(0x41).unwrap();
        assert_eq!(s1 & HOMESNR, 0);
        assert_ne!(s1 & MOTORENB, 0);
        let s2 = asic.read_register(0x41).unwrap();
        assert_ne!(s2 & HOMESNR, 0);
        assert_eq!(s2 & MOTORENB, 0);
    }

    #[test]
    fn afe_writes_are_decoded() {
        let mut asic = SimulatedAsic::new(SimProfile::gl841());
        asic.write_registers(&[(FE_ADDR, 0x28), (FE_DATA_HI, 0x00), (FE_DATA_LO, 0x93)])
            .unwrap();
        assert_eq!(asic.afe_register(0x28), Some(0x93));
    }

    #[test]
    fn injected_start_failure_is_reported_once() {
        let mut asic = SimulatedAsic::new(SimProfile::gl124());
        asic.fail_next_starts(1);
        assert!(asic.write_register(REG0F, 1).is_err());
        assert!(asic.write_register(REG0F, 1).is_ok());
        assert_eq!(asic.motor_starts(), 1);
    }
}
