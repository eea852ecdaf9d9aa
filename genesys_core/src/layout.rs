//! Named multi-byte register fields and their per-ASIC addresses.

use genesys_config::AsicType;

use crate::error::{GenesysError, Result};
use crate::register::RegisterSet;

/// A logical register field common to the GLxxx generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// Lines to scan.
    Lincnt,
    Dpiset,
    Strpixel,
    Endpixel,
    /// Words per line.
    Maxwd,
    Lperiod,
    /// Feed length in motor steps.
    Feedl,
    Stepno,
    Fastno,
    Fshdec,
    Fmovno,
    Fmovdec,
    ExpR,
    ExpG,
    ExpB,
    Dummy,
    Z1mod,
    Z2mod,
    Segcnt,
    Tg0cnt,
    Expdmy,
    Fwdstep,
    Bwdstep,
    Scanfed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLoc {
    pub address: u16,
    pub width: u8,
}

pub const fn loc(address: u16, width: u8) -> FieldLoc {
    FieldLoc { address, width }
}

/// Address map of one ASIC generation.
#[derive(Debug)]
pub struct RegisterLayout {
    pub asic: AsicType,
    /// Status register (PWRBIT, BUFEMPTY, HOMESNR, ...).
    pub status: u16,
    /// Scan state register (DATAENB, MOTMFLG).
    pub scan_state: u16,
    pub fields: &'static [(Field, FieldLoc)],
}

impl RegisterLayout {
    pub fn loc(&self, field: Field) -> Result<FieldLoc> {
        self.fields
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, l)| *l)
            .ok_or_else(|| {
                eyre::Report::new(GenesysError::NotSupported {
                    operation: field_name(field),
                    asic: self.asic,
                })
            })
    }
}

fn field_name(field: Field) -> &'static str {
    match field {
        Field::Lincnt => "LINCNT",
        Field::Dpiset => "DPISET",
        Field::Strpixel => "STRPIXEL",
        Field::Endpixel => "ENDPIXEL",
        Field::Maxwd => "MAXWD",
        Field::Lperiod => "LPERIOD",
        Field::Feedl => "FEEDL",
        Field::Stepno => "STEPNO",
        Field::Fastno => "FASTNO",
        Field::Fshdec => "FSHDEC",
        Field::Fmovno => "FMOVNO",
        Field::Fmovdec => "FMOVDEC",
        Field::ExpR => "EXPR",
        Field::ExpG => "EXPG",
        Field::ExpB => "EXPB",
        Field::Dummy => "DUMMY",
        Field::Z1mod => "Z1MOD",
        Field::Z2mod => "Z2MOD",
        Field::Segcnt => "SEGCNT",
        Field::Tg0cnt => "TG0CNT",
        Field::Expdmy => "EXPDMY",
        Field::Fwdstep => "FWDSTEP",
        Field::Bwdstep => "BWDSTEP",
        Field::Scanfed => "SCANFED",
    }
}

impl RegisterSet {
    pub fn set_field(&mut self, layout: &RegisterLayout, field: Field, value: u32) -> Result<()> {
        let l = layout.loc(field)?;
        let max = if l.width >= 4 {
            u32::MAX
        } else {
            (1u32 << (8 * u32::from(l.width))) - 1
        };
        if value > max {
            tracing::warn!(?field, value, max, "register field value truncated");
        }
        self.set_wide(l.address, value & max, l.width)
    }

    pub fn get_field(&self, layout: &RegisterLayout, field: Field) -> Result<u32> {
        let l = layout.loc(field)?;
        self.get_wide(l.address, l.width)
    }

    /// Set the three per-channel LED exposure fields.
    pub fn set_exposure(&mut self, layout: &RegisterLayout, exposure: [u16; 3]) -> Result<()> {
        self.set_field(layout, Field::ExpR, u32::from(exposure[0]))?;
        self.set_field(layout, Field::ExpG, u32::from(exposure[1]))?;
        self.set_field(layout, Field::ExpB, u32::from(exposure[2]))
    }

    pub fn get_exposure(&self, layout: &RegisterLayout) -> Result<[u16; 3]> {
        Ok([
            self.get_field(layout, Field::ExpR)? as u16,
            self.get_field(layout, Field::ExpG)? as u16,
            self.get_field(layout, Field::ExpB)? as u16,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_LAYOUT: RegisterLayout = RegisterLayout {
        asic: AsicType::Gl841,
        status: 0x41,
        scan_state: 0x40,
        fields: &[(Field::Lincnt, loc(0x25, 3)), (Field::Dpiset, loc(0x2c, 2))],
    };

    #[test]
    fn fields_follow_the_layout_width() {
        let mut regs = RegisterSet::new();
        for a in [0x25, 0x26, 0x27, 0x2c, 0x2d] {
            regs.init(a, 0).unwrap();
        }
        regs.set_field(&TEST_LAYOUT, Field::Lincnt, 0x01_0203).unwrap();
        regs.set_field(&TEST_LAYOUT, Field::Dpiset, 0x1_2345).unwrap();
        assert_eq!(regs.get8(0x27).unwrap(), 0x03);
        assert_eq!(regs.get_field(&TEST_LAYOUT, Field::Dpiset).unwrap(), 0x2345);
    }

    #[test]
    fn unknown_field_is_not_supported() {
        let regs = RegisterSet::new();
        let err = regs.get_field(&TEST_LAYOUT, Field::Z1mod).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GenesysError>(),
            Some(GenesysError::NotSupported { operation: "Z1MOD", .. })
        ));
    }
}
