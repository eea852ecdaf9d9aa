#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::too_many_lines
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Control layer for Genesys GL124, GL841 and GL847 scanner ASICs
//! (hardware-agnostic).
//!
//! All device access goes through the `genesys_traits::Transport` trait, so
//! the same code drives a USB scanner, the register-level simulator in
//! `genesys_hardware` or the scripted mocks in [`mocks`].
//!
//! ## Architecture
//!
//! - **Registers**: the in-memory register file and named multi-byte fields
//!   (`register`, `layout`, `status`)
//! - **Geometry**: scan sessions derived from a request and the model tables
//!   (`session`, `sensor`, `tables`)
//! - **Motion**: acceleration tables and the start/stop/poll helpers
//!   (`slope`, `scan`)
//! - **Per-ASIC behaviour**: one [`CommandSet`] per chip generation
//!   (`gl124`, `gl841`, `gl847`)
//! - **Calibration**: offset, coarse gain, LED exposure and shading
//!   (`calibration`)
//! - **Orchestration**: [`Scanner`] built through [`ScannerBuilder`], driven
//!   end to end by [`run_scan`]
//!
//! Register addresses are `u16`. Multi-byte values are stored most
//! significant byte first at consecutive addresses.

pub mod builder;
pub mod calibration;
pub mod command_set;
pub mod device;
pub mod error;
pub mod frontend;
pub mod gl124;
pub mod gl841;
pub mod gl847;
pub mod hw_error;
pub mod layout;
pub mod mocks;
pub mod register;
pub mod runner;
pub mod scan;
pub mod sensor;
pub mod session;
pub mod slope;
pub mod status;
pub mod tables;
pub mod util;

pub use builder::{Scanner, ScannerBuilder};
pub use command_set::{CommandSet, HardwareSensors, for_asic};
pub use device::{CalibrationCache, CurrentSetup, Device, ScanSettings};
pub use error::{BuildError, GenesysError, Result, Status, status_of};
pub use frontend::{Frontend, FrontendAction};
pub use register::RegisterSet;
pub use runner::{ScanEvent, ScanReport, Stage, calibrate_scanner, remember_calibration, run_scan};
pub use session::{ScanSession, ScanSessionParams};
pub use status::ScanFlags;
