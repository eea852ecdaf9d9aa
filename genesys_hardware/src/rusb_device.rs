//! [`UsbDevice`] over libusb, for real scanners.

use std::time::Duration;

use genesys_traits::{BoxError, UsbDevice};
use rusb::UsbContext;

use crate::error::HwError;

const TIMEOUT: Duration = Duration::from_secs(5);
const BULK_IN_ENDPOINT: u8 = 0x81;
const BULK_OUT_ENDPOINT: u8 = 0x02;

pub struct RusbDevice {
    handle: rusb::DeviceHandle<rusb::Context>,
}

impl RusbDevice {
    /// Open the first device matching `vendor:product` and claim interface 0.
    pub fn open(vendor: u16, product: u16) -> Result<Self, HwError> {
        let context = rusb::Context::new().map_err(usb_err)?;
        let mut handle = context
            .open_device_with_vid_pid(vendor, product)
            .ok_or_else(|| HwError::Usb(format!("no device {vendor:04x}:{product:04x}")))?;
        handle.claim_interface(0).map_err(usb_err)?;
        tracing::info!(vendor, product, "opened scanner");
        Ok(Self { handle })
    }
}

fn usb_err(e: rusb::Error) -> HwError {
    match e {
        rusb::Error::Timeout => HwError::Timeout,
        other => HwError::Usb(other.to_string()),
    }
}

impl UsbDevice for RusbDevice {
    fn control_msg(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
    ) -> Result<(), BoxError> {
        let n = if request_type & 0x80 != 0 {
            self.handle
                .read_control(request_type, request, value, index, data, TIMEOUT)
                .map_err(usb_err)?
        } else {
            self.handle
                .write_control(request_type, request, value, index, data, TIMEOUT)
                .map_err(usb_err)?
        };
        if n != data.len() {
            return Err(Box::new(HwError::ShortTransfer {
                expected: data.len(),
                actual: n,
            }));
        }
        Ok(())
    }

    fn bulk_read(&mut self, buf: &mut [u8]) -> Result<usize, BoxError> {
        Ok(self
            .handle
            .read_bulk(BULK_IN_ENDPOINT, buf, TIMEOUT)
            .map_err(usb_err)?)
    }

    fn bulk_write(&mut self, data: &[u8]) -> Result<usize, BoxError> {
        Ok(self
            .handle
            .write_bulk(BULK_OUT_ENDPOINT, data, TIMEOUT)
            .map_err(usb_err)?)
    }
}
