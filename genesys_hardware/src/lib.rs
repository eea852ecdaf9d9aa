//! Transports for GLxxx scanner ASICs.
//!
//! - [`usb::UsbTransport`] encodes the vendor request protocol over any
//!   [`genesys_traits::UsbDevice`].
//! - [`sim::SimulatedAsic`] is an in-memory ASIC used by tests and the CLI.
//! - With the `usb` feature, [`rusb_device::RusbDevice`] opens a real scanner.

pub mod error;
pub mod sim;
pub mod usb;

#[cfg(feature = "usb")]
pub mod rusb_device;

pub use sim::{SimProfile, SimulatedAsic};
pub use usb::{UsbProtocol, UsbTransport};
