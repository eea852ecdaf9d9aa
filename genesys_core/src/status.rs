//! Status register bits, scan flags and the scan control state.

use bitflags::bitflags;

bitflags! {
    /// Bits of the ASIC status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusBits: u8 {
        const PWRBIT   = 0x80;
        const BUFEMPTY = 0x40;
        const FEEDFSH  = 0x20;
        const SCANFSH  = 0x10;
        const HOMESNR  = 0x08;
        const LAMPSTS  = 0x04;
        const FEBUSY   = 0x02;
        const MOTORENB = 0x01;
    }
}

bitflags! {
    /// Bits of the scan state register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ScanStateBits: u8 {
        const DATAENB = 0x01;
        const MOTMFLG = 0x02;
    }
}

bitflags! {
    /// Behaviour switches for a scan session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct ScanFlags: u32 {
        const SINGLE_LINE              = 0x001;
        const DISABLE_SHADING          = 0x002;
        const DISABLE_GAMMA            = 0x004;
        const DISABLE_BUFFER_FULL_MOVE = 0x008;
        const IGNORE_LINE_DISTANCE     = 0x010;
        /// Program the sensor at its optical resolution regardless of xres.
        const USE_OPTICAL_RES          = 0x020;
        const DISABLE_LAMP             = 0x040;
        const DYNAMIC_LINEART          = 0x080;
        const CALIBRATION              = 0x100;
        const FEEDING                  = 0x200;
        const ENABLE_LEDADD            = 0x800;
    }
}

bitflags! {
    /// Motor register options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MotorFlags: u8 {
        const AUTO_GO_HOME             = 0x01;
        const DISABLE_BUFFER_FULL_MOVE = 0x02;
        const FEED                     = 0x04;
    }
}

impl StatusBits {
    pub fn describe(self) -> String {
        let mut out = Vec::new();
        for (name, _) in self.iter_names() {
            out.push(name);
        }
        out.join(" ")
    }
}

/// Where the scan control state machine is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanState {
    #[default]
    Idle,
    /// Registers for a scan are programmed but the motor is not running.
    Configured,
    Scanning,
    Stopping,
    Homing,
    Feeding,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_lists_set_bits() {
        let s = StatusBits::from_bits_truncate(0x88);
        assert_eq!(s.describe(), "PWRBIT HOMESNR");
    }
}
