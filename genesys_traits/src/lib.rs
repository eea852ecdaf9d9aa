//! Collaborator interfaces consumed by the scanner control core.
//!
//! The core never talks to libusb directly. Everything it needs from the
//! outside world is one of:
//!
//! - [`Transport`]: register and bulk I/O against an ASIC, already framed.
//! - [`UsbDevice`]: raw vendor control/bulk primitives, used by transports
//!   that encode the ASIC request protocol themselves.
//! - [`Clock`]: fixed-delay sleeps and a monotonic time source.

pub mod clock;

pub use clock::{Clock, MonotonicClock};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Register and data I/O against a GLxxx ASIC.
///
/// Addresses are the ASIC's native register numbers; gl124 uses addresses
/// above 0xff, older generations only the low byte.
pub trait Transport {
    fn read_register(&mut self, address: u16) -> Result<u8, BoxError>;

    fn write_register(&mut self, address: u16, value: u8) -> Result<(), BoxError>;

    /// Write a batch of registers in order.
    ///
    /// Implementations may use a bulk transfer when the ASIC supports one.
    fn write_registers(&mut self, registers: &[(u16, u8)]) -> Result<(), BoxError> {
        for &(address, value) in registers {
            self.write_register(address, value)?;
        }
        Ok(())
    }

    /// Read `buf.len()` bytes of scanner data from the given bulk endpoint address.
    fn bulk_read(&mut self, address: u8, buf: &mut [u8]) -> Result<(), BoxError>;

    /// Write raw bytes to the given bulk address (slope tables, shading, gamma).
    fn bulk_write(&mut self, address: u8, data: &[u8]) -> Result<(), BoxError>;

    /// Write into the ASIC's AHB address space (gl124/gl847 tables).
    fn write_ahb(&mut self, address: u32, data: &[u8]) -> Result<(), BoxError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_register(&mut self, address: u16) -> Result<u8, BoxError> {
        (**self).read_register(address)
    }
    fn write_register(&mut self, address: u16, value: u8) -> Result<(), BoxError> {
        (**self).write_register(address, value)
    }
    fn write_registers(&mut self, registers: &[(u16, u8)]) -> Result<(), BoxError> {
        (**self).write_registers(registers)
    }
    fn bulk_read(&mut self, address: u8, buf: &mut [u8]) -> Result<(), BoxError> {
        (**self).bulk_read(address, buf)
    }
    fn bulk_write(&mut self, address: u8, data: &[u8]) -> Result<(), BoxError> {
        (**self).bulk_write(address, data)
    }
    fn write_ahb(&mut self, address: u32, data: &[u8]) -> Result<(), BoxError> {
        (**self).write_ahb(address, data)
    }
}

/// Raw USB primitives of an opened scanner.
pub trait UsbDevice {
    /// Issue a control transfer. For IN transfers `data` is filled, for OUT
    /// transfers it is sent.
    fn control_msg(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
    ) -> Result<(), BoxError>;

    /// Bulk IN transfer; returns the number of bytes actually read.
    fn bulk_read(&mut self, buf: &mut [u8]) -> Result<usize, BoxError>;

    /// Bulk OUT transfer; returns the number of bytes actually written.
    fn bulk_write(&mut self, data: &[u8]) -> Result<usize, BoxError>;
}
