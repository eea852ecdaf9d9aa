//! Test doubles for the transport and clock collaborators.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use genesys_config::{CalibrationTuning, Timeouts};
use genesys_traits::{BoxError, Clock, Transport};

use crate::device::Device;
use crate::tables::DeviceTables;

#[derive(Debug, Default)]
struct MockState {
    regs: HashMap<u16, u8>,
    scripted: HashMap<u16, VecDeque<u8>>,
    writes: Vec<(u16, u8)>,
    batches: Vec<Vec<(u16, u8)>>,
    bulk_writes: Vec<(u8, Vec<u8>)>,
    ahb_writes: Vec<(u32, Vec<u8>)>,
    bulk_fill: u8,
    bulk_reads: usize,
    fail_writes: HashMap<u16, u32>,
}

/// Scriptable in-memory transport.
///
/// Clones share state: keep one handle to inspect what was written after the
/// other has been boxed into a device.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: Rc<RefCell<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset a register without recording a write.
    pub fn set_register(&self, address: u16, value: u8) {
        self.inner.borrow_mut().regs.insert(address, value);
    }

    /// Queue values returned by successive reads of `address`; once drained,
    /// reads fall back to the stored register value.
    pub fn script_reads(&self, address: u16, values: impl IntoIterator<Item = u8>) {
        self.inner
            .borrow_mut()
            .scripted
            .entry(address)
            .or_default()
            .extend(values);
    }

    /// Fail the next `count` writes to `address`.
    pub fn fail_writes_to(&self, address: u16, count: u32) {
        self.inner.borrow_mut().fail_writes.insert(address, count);
    }

    /// Byte returned for every bulk-read sample.
    pub fn set_bulk_fill(&self, value: u8) {
        self.inner.borrow_mut().bulk_fill = value;
    }

    pub fn register(&self, address: u16) -> Option<u8> {
        self.inner.borrow().regs.get(&address).copied()
    }

    /// Every single register write, batches flattened, in order.
    pub fn writes(&self) -> Vec<(u16, u8)> {
        self.inner.borrow().writes.clone()
    }

    /// Register snapshots written through `write_registers`.
    pub fn batches(&self) -> Vec<Vec<(u16, u8)>> {
        self.inner.borrow().batches.clone()
    }

    pub fn bulk_writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.inner.borrow().bulk_writes.clone()
    }

    pub fn ahb_writes(&self) -> Vec<(u32, Vec<u8>)> {
        self.inner.borrow().ahb_writes.clone()
    }

    pub fn bulk_reads(&self) -> usize {
        self.inner.borrow().bulk_reads
    }

    pub fn clear_log(&self) {
        let mut s = self.inner.borrow_mut();
        s.writes.clear();
        s.batches.clear();
        s.bulk_writes.clear();
        s.ahb_writes.clear();
    }
}

impl MockState {
    fn write(&mut self, address: u16, value: u8) -> Result<(), BoxError> {
        if let Some(n) = self.fail_writes.get_mut(&address)
            && *n > 0
        {
            *n -= 1;
            return Err(Box::new(std::io::Error::other(format!(
                "injected write failure at {address:#04x}"
            ))));
        }
        self.writes.push((address, value));
        self.regs.insert(address, value);
        Ok(())
    }
}

impl Transport for MockTransport {
    fn read_register(&mut self, address: u16) -> Result<u8, BoxError> {
        let mut s = self.inner.borrow_mut();
        if let Some(v) = s.scripted.get_mut(&address).and_then(VecDeque::pop_front) {
            return Ok(v);
        }
        Ok(s.regs.get(&address).copied().unwrap_or(0))
    }

    fn write_register(&mut self, address: u16, value: u8) -> Result<(), BoxError> {
        self.inner.borrow_mut().write(address, value)
    }

    fn write_registers(&mut self, registers: &[(u16, u8)]) -> Result<(), BoxError> {
        let mut s = self.inner.borrow_mut();
        s.batches.push(registers.to_vec());
        for &(address, value) in registers {
            s.write(address, value)?;
        }
        Ok(())
    }

    fn bulk_read(&mut self, _address: u8, buf: &mut [u8]) -> Result<(), BoxError> {
        let mut s = self.inner.borrow_mut();
        s.bulk_reads += 1;
        buf.fill(s.bulk_fill);
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

/// Clock that advances only when slept on and records every sleep.
#[derive(Debug, Clone)]
pub struct FakeClock {
    origin: Instant,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.origin + self.total_slept()
    }

    fn sleep(&self, d: Duration) {
        if let Ok(mut s) = self.sleeps.lock() {
            s.push(d);
        }
    }
}

/// A device for `model_id` from the built-in tables, driven by `transport`
/// and `clock`, with default timeouts and tuning.
pub fn device_for(model_id: &str, transport: impl Transport + 'static, clock: &FakeClock) -> crate::Result<Device> {
    let db = genesys_config::builtin()?;
    let tables = DeviceTables::from_database(&db, model_id)?;
    Ok(Device::new(
        Box::new(transport),
        Box::new(clock.clone()),
        Arc::new(tables),
        Timeouts::default(),
        CalibrationTuning::default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_reads_drain_before_stored_value() {
        let mock = MockTransport::new();
        mock.set_register(0x41, 0x08);
        mock.script_reads(0x41, [0x01, 0x02]);
        let mut t = mock.clone();
        assert_eq!(t.read_register(0x41).unwrap(), 0x01);
        assert_eq!(t.read_register(0x41).unwrap(), 0x02);
        assert_eq!(t.read_register(0x41).unwrap(), 0x08);
    }

    #[test]
    fn injected_failure_is_consumed() {
        let mock = MockTransport::new();
        mock.fail_writes_to(0x0f, 1);
        let mut t = mock.clone();
        assert!(t.write_register(0x0f, 1).is_err());
        assert!(t.write_register(0x0f, 1).is_ok());
        assert_eq!(mock.writes(), vec![(0x0f, 1)]);
    }

    #[test]
    fn fake_clock_advances_on_sleep() {
        let clock = FakeClock::new();
        let t0 = clock.now();
        clock.sleep_ms(100);
        clock.sleep_ms(100);
        assert_eq!(clock.ms_since(t0), 200);
        assert_eq!(clock.sleeps().len(), 2);
    }
}
