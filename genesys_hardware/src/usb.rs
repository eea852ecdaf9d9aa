//! Vendor request encoding of the GLxxx USB protocol.
//!
//! Two generations exist:
//! - gl841 selects a register with one control transfer and reads or writes
//!   it with a second one; register batches go out as one bulk transfer.
//! - gl124/gl847 (USB 2.0 parts) carry address and value in a single buffer
//!   request, acknowledge reads with 0x55 and expose an AHB address space.

use genesys_traits::{BoxError, Transport, UsbDevice};

use crate::error::{HwError, Result};

pub const REQUEST_TYPE_IN: u8 = 0xc0;
pub const REQUEST_TYPE_OUT: u8 = 0x40;

pub const REQUEST_REGISTER: u8 = 0x0c;
pub const REQUEST_BUFFER: u8 = 0x04;

pub const VALUE_BUFFER: u16 = 0x82;
pub const VALUE_SET_REGISTER: u16 = 0x83;
pub const VALUE_READ_REGISTER: u16 = 0x84;
pub const VALUE_WRITE_REGISTER: u16 = 0x85;
pub const VALUE_GET_REGISTER: u16 = 0x8e;

pub const INDEX: u16 = 0x00;

pub const BULK_OUT: u8 = 0x01;
pub const BULK_IN: u8 = 0x00;
pub const BULK_RAM: u8 = 0x00;
pub const BULK_REGISTER: u8 = 0x11;

pub const BULKOUT_MAXSIZE: usize = 0xf000;

/// Acknowledge byte returned alongside register reads on USB 2.0 parts.
const READ_ACK: u8 = 0x55;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbProtocol {
    /// gl841 and older: two-step select/read, bulk register writes.
    Gl841,
    /// gl124, gl847: buffer requests with acknowledge byte.
    Usb2,
}

/// [`Transport`] implementation over a raw [`UsbDevice`].
pub struct UsbTransport<D: UsbDevice> {
    dev: D,
    protocol: UsbProtocol,
}

impl<D: UsbDevice> UsbTransport<D> {
    pub fn new(dev: D, protocol: UsbProtocol) -> Self {
        Self { dev, protocol }
    }

    pub fn protocol(&self) -> UsbProtocol {
        self.protocol
    }

    pub fn into_inner(self) -> D {
        self.dev
    }

    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<()> {
        let mut buf = data.to_vec();
        self.dev
            .control_msg(REQUEST_TYPE_OUT, request, value, index, &mut buf)
            .map_err(to_hw)
    }

    fn control_in(&mut self, request: u8, value: u16, index: u16, buf: &mut [u8]) -> Result<()> {
        self.dev
            .control_msg(REQUEST_TYPE_IN, request, value, index, buf)
            .map_err(to_hw)
    }

    /// Eight byte header announcing a bulk transfer: two selector bytes
    /// followed by the little-endian 32-bit size.
    fn bulk_header(&mut self, a: u8, b: u8, c: u8, d: u8, size: usize, index: u16) -> Result<()> {
        let size = u32::try_from(size)
            .map_err(|_| HwError::Usb(format!("transfer of {size} bytes is too large")))?;
        let s = size.to_le_bytes();
        let header = [a, b, c, d, s[0], s[1], s[2], s[3]];
        self.control_out(REQUEST_BUFFER, VALUE_BUFFER, index, &header)
    }

    fn bulk_out_chunked(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(BULKOUT_MAXSIZE) {
            let written = self.dev.bulk_write(chunk).map_err(to_hw)?;
            if written != chunk.len() {
                return Err(HwError::ShortTransfer {
                    expected: chunk.len(),
                    actual: written,
                });
            }
        }
        Ok(())
    }

    fn bulk_in_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.dev.bulk_read(&mut buf[done..]).map_err(to_hw)?;
            if n == 0 {
                return Err(HwError::ShortTransfer {
                    expected: buf.len(),
                    actual: done,
                });
            }
            done += n;
        }
        Ok(())
    }

    fn read_register_impl(&mut self, address: u16) -> Result<u8> {
        match self.protocol {
            UsbProtocol::Gl841 => {
                let reg = low_register(address)?;
                self.control_out(REQUEST_REGISTER, VALUE_SET_REGISTER, INDEX, &[reg])?;
                let mut v = [0u8; 1];
                self.control_in(REQUEST_REGISTER, VALUE_READ_REGISTER, INDEX, &mut v)?;
                Ok(v[0])
            }
            UsbProtocol::Usb2 => {
                let (value, reg) = if address > 0xff {
                    (0x100 | VALUE_GET_REGISTER, (address & 0xff) as u8)
                } else {
                    (VALUE_GET_REGISTER, address as u8)
                };
                let mut v = [0u8; 2];
                self.control_in(REQUEST_BUFFER, value, 0x22 + (u16::from(reg) << 8), &mut v)?;
                if v[1] != READ_ACK {
                    return Err(HwError::InvalidRead {
                        register: address,
                        ack: v[1],
                    });
                }
                Ok(v[0])
            }
        }
    }

    fn write_register_impl(&mut self, address: u16, value: u8) -> Result<()> {
        match self.protocol {
            UsbProtocol::Gl841 => {
                let reg = low_register(address)?;
                self.control_out(REQUEST_REGISTER, VALUE_SET_REGISTER, INDEX, &[reg])?;
                self.control_out(REQUEST_REGISTER, VALUE_WRITE_REGISTER, INDEX, &[value])
            }
            UsbProtocol::Usb2 => {
                let request_value = if address > 0xff {
                    0x100 | VALUE_SET_REGISTER
                } else {
                    VALUE_SET_REGISTER
                };
                let buf = [(address & 0xff) as u8, value];
                self.control_out(REQUEST_BUFFER, request_value, INDEX, &buf)
            }
        }
    }
}

fn low_register(address: u16) -> Result<u8> {
    u8::try_from(address).map_err(|_| HwError::RegisterOutOfRange(address))
}

fn to_hw(e: BoxError) -> HwError {
    match e.downcast::<HwError>() {
        Ok(hw) => *hw,
        Err(other) => HwError::Usb(other.to_string()),
    }
}

impl<D: UsbDevice> Transport for UsbTransport<D> {
    fn read_register(&mut self, address: u16) -> std::result::Result<u8, BoxError> {
        let v = self.read_register_impl(address)?;
        tracing::trace!(register = address, value = v, "read register");
        Ok(v)
    }

    fn write_register(&mut self, address: u16, value: u8) -> std::result::Result<(), BoxError> {
        tracing::trace!(register = address, value, "write register");
        Ok(self.write_register_impl(address, value)?)
    }

    fn write_registers(&mut self, registers: &[(u16, u8)]) -> std::result::Result<(), BoxError> {
        if self.protocol == UsbProtocol::Usb2 || registers.is_empty() {
            for &(address, value) in registers {
                self.write_register_impl(address, value)?;
            }
            return Ok(());
        }
        let mut payload = Vec::with_capacity(registers.len() * 2);
        for &(address, value) in registers {
            payload.push(low_register(address)?);
            payload.push(value);
        }
        tracing::trace!(count = registers.len(), "bulk register write");
        self.bulk_header(BULK_OUT, BULK_REGISTER, 0x00, 0x00, payload.len(), INDEX)?;
        self.bulk_out_chunked(&payload)?;
        Ok(())
    }

    fn bulk_read(&mut self, address: u8, buf: &mut [u8]) -> std::result::Result<(), BoxError> {
        tracing::trace!(address, len = buf.len(), "bulk read");
        match self.protocol {
            UsbProtocol::Gl841 => {
                self.control_out(REQUEST_REGISTER, VALUE_SET_REGISTER, INDEX, &[address])?;
                self.bulk_header(BULK_IN, BULK_RAM, 0x00, 0x00, buf.len(), INDEX)?;
            }
            UsbProtocol::Usb2 => {
                self.bulk_header(0x00, 0x00, 0x00, 0x10, buf.len(), INDEX)?;
            }
        }
        self.bulk_in_exact(buf)?;
        Ok(())
    }

    fn bulk_write(&mut self, address: u8, data: &[u8]) -> std::result::Result<(), BoxError> {
        tracing::trace!(address, len = data.len(), "bulk write");
        self.control_out(REQUEST_REGISTER, VALUE_SET_REGISTER, INDEX, &[address])?;
        self.bulk_header(BULK_OUT, BULK_RAM, 0x00, 0x00, data.len(), INDEX)?;
        self.bulk_out_chunked(data)?;
        Ok(())
    }

    fn write_ahb(&mut self, address: u32, data: &[u8]) -> std::result::Result<(), BoxError> {
        if self.protocol == UsbProtocol::Gl841 {
            return Err(Box::new(HwError::Usb(
                "AHB writes are not available on gl841".to_string(),
            )));
        }
        tracing::trace!(address, len = data.len(), "ahb write");
        let a = address.to_le_bytes();
        self.bulk_header(a[0], a[1], a[2], a[3], data.len(), 0x01)?;
        self.bulk_out_chunked(data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records control transfers and replays a fixed IN payload.
    #[derive(Default)]
    struct Recorder {
        controls: Vec<(u8, u8, u16, u16, Vec<u8>)>,
        bulk_out: Vec<Vec<u8>>,
        reply: Vec<u8>,
    }

    impl UsbDevice for Recorder {
        fn control_msg(
            &mut self,
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            data: &mut [u8],
        ) -> std::result::Result<(), BoxError> {
            if request_type == REQUEST_TYPE_IN {
                let n = data.len().min(self.reply.len());
                data[..n].copy_from_slice(&self.reply[..n]);
            }
            self.controls
                .push((request_type, request, value, index, data.to_vec()));
            Ok(())
        }

        fn bulk_read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, BoxError> {
            buf.fill(0xab);
            Ok(buf.len())
        }

        fn bulk_write(&mut self, data: &[u8]) -> std::result::Result<usize, BoxError> {
            self.bulk_out.push(data.to_vec());
            Ok(data.len())
        }
    }

    #[test]
    fn gl841_register_write_is_select_then_write() {
        let mut t = UsbTransport::new(Recorder::default(), UsbProtocol::Gl841);
        t.write_register(0x2c, 0x12).unwrap();
        let c = &t.dev.controls;
        assert_eq!(c.len(), 2);
        assert_eq!(c[0], (REQUEST_TYPE_OUT, REQUEST_REGISTER, VALUE_SET_REGISTER, 0, vec![0x2c]));
        assert_eq!(c[1], (REQUEST_TYPE_OUT, REQUEST_REGISTER, VALUE_WRITE_REGISTER, 0, vec![0x12]));
    }

    #[test]
    fn gl841_rejects_high_registers() {
        let mut t = UsbTransport::new(Recorder::default(), UsbProtocol::Gl841);
        let err = t.write_register(0x101, 0).unwrap_err();
        assert!(err.to_string().contains("unsupported register number"));
    }

    #[test]
    fn usb2_high_register_sets_bit_8_of_value() {
        let mut t = UsbTransport::new(Recorder::default(), UsbProtocol::Usb2);
        t.write_register(0x101, 0x44).unwrap();
        let c = &t.dev.controls[0];
        assert_eq!(c.2, 0x100 | VALUE_SET_REGISTER);
        assert_eq!(c.4, vec![0x01, 0x44]);
    }

    #[test]
    fn usb2_read_checks_acknowledge() {
        let mut rec = Recorder::default();
        rec.reply = vec![0x3c, 0x55];
        let mut t = UsbTransport::new(rec, UsbProtocol::Usb2);
        assert_eq!(t.read_register(0x41).unwrap(), 0x3c);
        assert_eq!(t.dev.controls[0].3, 0x22 + (0x41 << 8));

        t.dev.reply = vec![0x3c, 0x00];
        let err = t.read_register(0x41).unwrap_err();
        assert!(err.to_string().contains("scanner unplugged"));
    }

    #[test]
    fn ahb_write_sends_address_and_size_header() {
        let mut t = UsbTransport::new(Recorder::default(), UsbProtocol::Usb2);
        t.write_ahb(0x1000_4000, &[1, 2, 3, 4]).unwrap();
        let header = &t.dev.controls[0];
        assert_eq!(header.3, 0x01);
        assert_eq!(header.4, vec![0x00, 0x40, 0x00, 0x10, 4, 0, 0, 0]);
        assert_eq!(t.dev.bulk_out, vec![vec![1, 2, 3, 4]]);
    }

    #[test]
    fn gl841_register_batch_goes_out_as_one_bulk() {
        let mut t = UsbTransport::new(Recorder::default(), UsbProtocol::Gl841);
        t.write_registers(&[(0x01, 0x20), (0x02, 0x30)]).unwrap();
        assert_eq!(t.dev.controls[0].4, vec![BULK_OUT, BULK_REGISTER, 0, 0, 4, 0, 0, 0]);
        assert_eq!(t.dev.bulk_out, vec![vec![0x01, 0x20, 0x02, 0x30]]);
    }

    #[test]
    fn large_bulk_writes_are_chunked() {
        let mut t = UsbTransport::new(Recorder::default(), UsbProtocol::Usb2);
        let data = vec![0u8; BULKOUT_MAXSIZE + 10];
        t.write_ahb(0x1000_0000, &data).unwrap();
        let sizes: Vec<usize> = t.dev.bulk_out.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![BULKOUT_MAXSIZE, 10]);
    }
}
