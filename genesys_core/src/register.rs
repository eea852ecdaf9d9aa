//! In-memory register file.
//!
//! A `RegisterSet` is an ordered list of byte registers. Every address appears
//! at most once. Multi-byte values occupy adjacent addresses, most significant
//! byte first. Lookups of absent addresses are errors, never panics.

use genesys_config::RegisterOverlay;

use crate::error::{GenesysError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub address: u16,
    pub value: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterSet {
    regs: Vec<Register>,
}

impl RegisterSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, address: u16) -> std::result::Result<usize, usize> {
        self.regs.binary_search_by_key(&address, |r| r.address)
    }

    /// Register a new address with its initial value.
    pub fn init(&mut self, address: u16, value: u8) -> Result<()> {
        match self.position(address) {
            Ok(_) => Err(GenesysError::invalid(format!(
                "register 0x{address:04x} initialised twice"
            ))
            .into()),
            Err(i) => {
                self.regs.insert(i, Register { address, value });
                Ok(())
            }
        }
    }

    /// Register `address` if absent, otherwise overwrite it.
    pub fn init_or_set(&mut self, address: u16, value: u8) {
        match self.position(address) {
            Ok(i) => self.regs[i].value = value,
            Err(i) => self.regs.insert(i, Register { address, value }),
        }
    }

    pub fn has(&self, address: u16) -> bool {
        self.position(address).is_ok()
    }

    pub fn find_mut(&mut self, address: u16) -> Result<&mut Register> {
        match self.position(address) {
            Ok(i) => Ok(&mut self.regs[i]),
            Err(_) => Err(GenesysError::RegisterNotFound(address).into()),
        }
    }

    pub fn get8(&self, address: u16) -> Result<u8> {
        match self.position(address) {
            Ok(i) => Ok(self.regs[i].value),
            Err(_) => Err(GenesysError::RegisterNotFound(address).into()),
        }
    }

    pub fn set8(&mut self, address: u16, value: u8) -> Result<()> {
        self.find_mut(address)?.value = value;
        Ok(())
    }

    /// Replace the bits selected by `mask` with those of `value`.
    pub fn set8_mask(&mut self, address: u16, value: u8, mask: u8) -> Result<()> {
        let r = self.find_mut(address)?;
        r.value = (r.value & !mask) | (value & mask);
        Ok(())
    }

    pub fn set_bits(&mut self, address: u16, bits: u8) -> Result<()> {
        self.find_mut(address)?.value |= bits;
        Ok(())
    }

    pub fn clear_bits(&mut self, address: u16, bits: u8) -> Result<()> {
        self.find_mut(address)?.value &= !bits;
        Ok(())
    }

    pub fn set16(&mut self, address: u16, value: u16) -> Result<()> {
        self.set_wide(address, u32::from(value), 2)
    }

    pub fn set24(&mut self, address: u16, value: u32) -> Result<()> {
        self.set_wide(address, value & 0x00ff_ffff, 3)
    }

    pub fn get16(&self, address: u16) -> Result<u16> {
        Ok(self.get_wide(address, 2)? as u16)
    }

    pub fn get24(&self, address: u16) -> Result<u32> {
        self.get_wide(address, 3)
    }

    /// Write `width` bytes of `value` starting at `address`, MSB first.
    pub fn set_wide(&mut self, address: u16, value: u32, width: u8) -> Result<()> {
        // Validate every byte before touching any so a failure leaves the set unchanged.
        for i in 0..u16::from(width) {
            let a = byte_address(address, i)?;
            if !self.has(a) {
                return Err(GenesysError::RegisterNotFound(a).into());
            }
        }
        for i in 0..u16::from(width) {
            let shift = 8 * (u16::from(width) - 1 - i);
            self.set8(byte_address(address, i)?, (value >> shift) as u8)?;
        }
        Ok(())
    }

    pub fn get_wide(&self, address: u16, width: u8) -> Result<u32> {
        let mut v = 0u32;
        for i in 0..u16::from(width) {
            v = (v << 8) | u32::from(self.get8(byte_address(address, i)?)?);
        }
        Ok(v)
    }

    /// Apply a table overlay; every byte it touches must already exist.
    pub fn apply(&mut self, overlay: &RegisterOverlay) -> Result<()> {
        self.set_wide(overlay.address, overlay.value, overlay.width)
    }

    /// Apply a table overlay, creating missing registers.
    pub fn apply_or_init(&mut self, overlay: &RegisterOverlay) {
        for i in 0..u16::from(overlay.width) {
            let shift = 8 * (u16::from(overlay.width) - 1 - i);
            if let Some(address) = overlay.address.checked_add(i) {
                self.init_or_set(address, (overlay.value >> shift) as u8);
            }
        }
    }

    /// Drop `address` so full writes skip it; true when it was present.
    pub fn remove(&mut self, address: u16) -> bool {
        match self.position(address) {
            Ok(i) => {
                self.regs.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    pub fn clear(&mut self) {
        self.regs.clear();
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Register> {
        self.regs.iter()
    }

    /// All `(address, value)` pairs in address order.
    pub fn entries(&self) -> Vec<(u16, u8)> {
        self.regs.iter().map(|r| (r.address, r.value)).collect()
    }

    /// Entries of `self` that are new or differ from `previous`.
    pub fn diff(&self, previous: &RegisterSet) -> Vec<(u16, u8)> {
        self.regs
            .iter()
            .filter(|r| previous.get8(r.address).ok() != Some(r.value))
            .map(|r| (r.address, r.value))
            .collect()
    }
}

/// Address of byte `i` of a multi-byte register starting at `address`.
fn byte_address(address: u16, i: u16) -> Result<u16> {
    address
        .checked_add(i)
        .ok_or_else(|| GenesysError::RegisterNotFound(address).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::status_of;
    use proptest::prelude::*;

    fn set_with(addrs: &[u16]) -> RegisterSet {
        let mut regs = RegisterSet::new();
        for &a in addrs {
            regs.init(a, 0).unwrap();
        }
        regs
    }

    #[test]
    fn init_rejects_duplicates_and_keeps_order() {
        let mut regs = RegisterSet::new();
        regs.init(0x10, 1).unwrap();
        regs.init(0x02, 2).unwrap();
        assert!(regs.init(0x10, 3).is_err());
        assert_eq!(regs.entries(), vec![(0x02, 2), (0x10, 1)]);
    }

    #[test]
    fn missing_register_is_a_typed_error() {
        let regs = set_with(&[0x01]);
        let err = regs.get8(0x02).unwrap_err();
        assert_eq!(
            err.downcast_ref::<GenesysError>(),
            Some(&GenesysError::RegisterNotFound(0x02))
        );
        assert_eq!(status_of(&err), Some(crate::error::Status::Invalid));
    }

    #[test]
    fn wide_access_past_the_address_space_is_an_error() {
        let mut regs = set_with(&[0xfffe, 0xffff]);
        let err = regs.set_wide(0xffff, 0x1234, 2).unwrap_err();
        assert_eq!(
            err.downcast_ref::<GenesysError>(),
            Some(&GenesysError::RegisterNotFound(0xffff))
        );
        assert!(regs.get_wide(0xffff, 2).is_err());
        assert_eq!(regs.get8(0xffff).unwrap(), 0);
        regs.set_wide(0xfffe, 0x1234, 2).unwrap();
        assert_eq!(regs.get_wide(0xfffe, 2).unwrap(), 0x1234);
    }

    #[test]
    fn partial_wide_write_leaves_set_untouched() {
        let mut regs = set_with(&[0x25, 0x26]);
        regs.set8(0x25, 0xaa).unwrap();
        assert!(regs.set24(0x25, 0x123456).is_err());
        assert_eq!(regs.get8(0x25).unwrap(), 0xaa);
    }

    #[test]
    fn mask_merges_selected_bits() {
        let mut regs = set_with(&[0x04]);
        regs.set8(0x04, 0b1010_1010).unwrap();
        regs.set8_mask(0x04, 0b0101_0101, 0x0f).unwrap();
        assert_eq!(regs.get8(0x04).unwrap(), 0b1010_0101);
    }

    #[test]
    fn diff_reports_only_changes() {
        let old = set_with(&[0x01, 0x02, 0x03]);
        let mut new = old.clone();
        new.set8(0x02, 9).unwrap();
        new.init(0x04, 0).unwrap();
        assert_eq!(new.diff(&old), vec![(0x02, 9), (0x04, 0)]);
    }

    proptest! {
        #[test]
        fn set24_decomposes_into_three_bytes(v in 0u32..(1 << 24), base in 0u16..0x1f0) {
            let mut regs = set_with(&[base, base + 1, base + 2]);
            regs.set24(base, v).unwrap();
            let hi = regs.get8(base).unwrap();
            let mid = regs.get8(base + 1).unwrap();
            let lo = regs.get8(base + 2).unwrap();
            prop_assert_eq!((u32::from(hi) << 16) | (u32::from(mid) << 8) | u32::from(lo), v);
            prop_assert_eq!(regs.get24(base).unwrap(), v);
        }

        #[test]
        fn last_write_wins(writes in proptest::collection::vec((0u16..8, any::<u8>()), 1..32)) {
            let mut regs = set_with(&[0, 1, 2, 3, 4, 5, 6, 7]);
            let mut expected = [0u8; 8];
            for (a, v) in writes {
                regs.set8(a, v).unwrap();
                expected[a as usize] = v;
            }
            for (a, v) in expected.iter().enumerate() {
                prop_assert_eq!(regs.get8(a as u16).unwrap(), *v);
            }
        }
    }
}
