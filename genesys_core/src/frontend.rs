//! Analog frontend (AFE) state.
//!
//! The frontend is programmed indirectly: the ASIC forwards a write of
//! (address, 16-bit value) through three of its own registers.

use std::collections::BTreeMap;

use genesys_config::{FrontendDef, FrontendKind};
use genesys_traits::Transport;

use crate::error::{GenesysError, Result};
use crate::hw_error::HwResultExt;

const FE_ADDR: u16 = 0x51;
const FE_DATA_HI: u16 = 0x3a;
const FE_DATA_LO: u16 = 0x3b;

/// Frontend-space addresses holding the per-channel offset and gain.
const OFFSET_BASE: u8 = 0x20;
const GAIN_BASE: u8 = 0x28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendAction {
    /// Reload the boot values, then program them.
    Init,
    /// Program the current values.
    Set,
    PowerSave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frontend {
    pub kind: FrontendKind,
    pub regs: BTreeMap<u8, u16>,
    pub reg2: [u8; 3],
    pub close_value: Option<u16>,
}

impl Frontend {
    pub fn from_def(def: &FrontendDef) -> Self {
        Self {
            kind: def.kind,
            regs: def.regs.iter().map(|r| (r.address, r.value)).collect(),
            reg2: def.reg2,
            close_value: def.close_value,
        }
    }

    pub fn value(&self, address: u8) -> u16 {
        self.regs.get(&address).copied().unwrap_or(0)
    }

    pub fn gain(&self, channel: usize) -> u8 {
        self.channel_value(GAIN_BASE, channel)
    }

    pub fn offset(&self, channel: usize) -> u8 {
        self.channel_value(OFFSET_BASE, channel)
    }

    pub fn set_gain(&mut self, channel: usize, value: u8) {
        self.set_channel_value(GAIN_BASE, channel, value);
    }

    pub fn set_offset(&mut self, channel: usize, value: u8) {
        self.set_channel_value(OFFSET_BASE, channel, value);
    }

    pub fn set_gains(&mut self, values: [u8; 3]) {
        for (ch, v) in values.into_iter().enumerate() {
            self.set_gain(ch, v);
        }
    }

    pub fn set_offsets(&mut self, values: [u8; 3]) {
        for (ch, v) in values.into_iter().enumerate() {
            self.set_offset(ch, v);
        }
    }

    pub fn gains(&self) -> [u8; 3] {
        [0, 1, 2].map(|ch| self.gain(ch))
    }

    pub fn offsets(&self) -> [u8; 3] {
        [0, 1, 2].map(|ch| self.offset(ch))
    }

    fn channel_value(&self, base: u8, channel: usize) -> u8 {
        (self.value(base + channel as u8) & 0xff) as u8
    }

    fn set_channel_value(&mut self, base: u8, channel: usize, value: u8) {
        if channel < 3 {
            self.regs.insert(base + channel as u8, u16::from(value));
        }
    }
}

/// Write one frontend register through the ASIC.
pub fn write_fe_data<T: Transport + ?Sized>(transport: &mut T, address: u8, value: u16) -> Result<()> {
    tracing::trace!(address = format_args!("{address:#04x}"), value = format_args!("{value:#06x}"), "fe write");
    transport
        .write_registers(&[
            (FE_ADDR, address),
            (FE_DATA_HI, (value >> 8) as u8),
            (FE_DATA_LO, (value & 0xff) as u8),
        ])
        .hw("frontend write")
}

/// Checks the frontend flavour an ASIC routine is about to program.
pub fn expect_kind(frontend: &Frontend, kind: FrontendKind, asic: genesys_config::AsicType) -> Result<()> {
    if frontend.kind == kind {
        Ok(())
    } else {
        Err(GenesysError::NotSupported {
            operation: "set_fe",
            asic,
        }
        .into())
    }
}
