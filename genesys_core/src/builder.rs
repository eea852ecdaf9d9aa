//! Type-state builder for `Scanner`.
//!
//! The builder enforces at compile time that a transport and a model are
//! provided before `build()` is available. `try_build()` is always available
//! for dynamic checks.

use std::marker::PhantomData;
use std::sync::Arc;

use genesys_config::{CalibrationTuning, CalibrationValues, Database, Settings, Timeouts};
use genesys_traits::{Clock, MonotonicClock, Transport};

use crate::command_set::{self, CommandSet, HardwareSensors};
use crate::device::{Device, ScanSettings};
use crate::error::{BuildError, Result};
use crate::frontend::FrontendAction;
use crate::tables::DeviceTables;

// ── Scanner ──────────────────────────────────────────────────────────────────

/// A device paired with the command set of its ASIC.
pub struct Scanner {
    pub(crate) dev: Device,
    pub(crate) cs: Box<dyn CommandSet>,
}

impl core::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scanner")
            .field("model", &self.dev.tables.model.id)
            .field("asic", &self.cs.name())
            .field("state", &self.dev.state)
            .finish()
    }
}

impl Scanner {
    /// Start building a Scanner.
    pub fn builder() -> ScannerBuilder<Missing, Missing> {
        ScannerBuilder::default()
    }

    pub fn device(&self) -> &Device {
        &self.dev
    }

    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.dev
    }

    pub fn command_set(&self) -> &dyn CommandSet {
        &*self.cs
    }

    /// Device and command set borrowed together, for driving operations
    /// directly.
    pub fn parts(&mut self) -> (&mut Device, &dyn CommandSet) {
        (&mut self.dev, &*self.cs)
    }

    /// Boot the ASIC and park the head.
    pub fn init(&mut self) -> Result<()> {
        self.cs.init(&mut self.dev)
    }

    pub fn home(&mut self, wait: bool) -> Result<()> {
        self.cs.slow_back_home(&mut self.dev, wait)
    }

    pub fn hardware_sensors(&mut self) -> Result<HardwareSensors> {
        self.cs.update_hardware_sensors(&mut self.dev)
    }

    pub fn set_scan_settings(&mut self, settings: ScanSettings) {
        self.dev.settings = settings;
    }

    /// Gains, offsets and LED exposure currently programmed.
    pub fn calibration_values(&self) -> CalibrationValues {
        CalibrationValues {
            gain: self.dev.frontend.gains(),
            offset: self.dev.frontend.offsets(),
            exposure: self.dev.exposure,
        }
    }

    /// Load previously saved calibration into the frontend and LED exposure.
    pub fn apply_calibration(&mut self, values: &CalibrationValues) -> Result<()> {
        self.dev.frontend.set_gains(values.gain);
        self.dev.frontend.set_offsets(values.offset);
        self.dev.exposure = values.exposure;
        self.cs.set_fe(&mut self.dev, FrontendAction::Set)
    }
}

// ── Type-state markers ───────────────────────────────────────────────────────

pub struct Missing;
pub struct Set;

/// Builder for `Scanner`. All fields are validated on `build()`.
pub struct ScannerBuilder<T, M> {
    transport: Option<Box<dyn Transport>>,
    model: Option<String>,
    database: Option<Database>,
    clock: Option<Box<dyn Clock + Send + Sync>>,
    timeouts: Option<Timeouts>,
    tuning: Option<CalibrationTuning>,
    scan: Option<ScanSettings>,
    _t: PhantomData<T>,
    _m: PhantomData<M>,
}

impl Default for ScannerBuilder<Missing, Missing> {
    fn default() -> Self {
        Self {
            transport: None,
            model: None,
            database: None,
            clock: None,
            timeouts: None,
            tuning: None,
            scan: None,
            _t: PhantomData,
            _m: PhantomData,
        }
    }
}

fn validate(timeouts: &Timeouts, tuning: &CalibrationTuning) -> Result<()> {
    if timeouts.poll_retries == 0 {
        return Err(eyre::Report::new(BuildError::InvalidConfig("poll_retries must be >= 1")));
    }
    if timeouts.stop_retries == 0 {
        return Err(eyre::Report::new(BuildError::InvalidConfig("stop_retries must be >= 1")));
    }
    if tuning.led_max_iterations == 0 || tuning.offset_max_passes == 0 {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "calibration iteration limits must be >= 1",
        )));
    }
    if tuning.led_tolerance_divisor == 0 {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "led_tolerance_divisor must be >= 1",
        )));
    }
    Ok(())
}

impl<T, M> ScannerBuilder<T, M> {
    /// Fallible build available in any type-state; returns detailed error for missing pieces.
    pub fn try_build(self) -> Result<Scanner> {
        let transport = self
            .transport
            .ok_or_else(|| eyre::Report::new(BuildError::MissingTransport))?;
        let model = self
            .model
            .ok_or_else(|| eyre::Report::new(BuildError::MissingModel))?;
        let timeouts = self.timeouts.unwrap_or_default();
        let tuning = self.tuning.unwrap_or_default();
        validate(&timeouts, &tuning)?;

        let db = match self.database {
            Some(db) => db,
            None => genesys_config::builtin()?,
        };
        let tables = DeviceTables::from_database(&db, &model)?;
        let cs = command_set::for_asic(tables.model.asic);
        let clock = self
            .clock
            .unwrap_or_else(|| Box::new(MonotonicClock::new()));

        let mut dev = Device::new(transport, clock, Arc::new(tables), timeouts, tuning);
        if let Some(scan) = self.scan {
            dev.settings = scan;
        }
        tracing::debug!(model = %model, asic = cs.name(), "scanner built");
        Ok(Scanner { dev, cs })
    }
}

/// Chainable setters that do not affect type-state.
impl<T, M> ScannerBuilder<T, M> {
    /// Device tables to resolve the model in; the built-in ones otherwise.
    pub fn with_database(mut self, db: Database) -> Self {
        self.database = Some(db);
        self
    }
    /// Provide a custom clock implementation; defaults to `MonotonicClock` when not provided.
    pub fn with_clock(mut self, clock: Box<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = Some(timeouts);
        self
    }
    pub fn with_tuning(mut self, tuning: CalibrationTuning) -> Self {
        self.tuning = Some(tuning);
        self
    }
    pub fn with_scan_settings(mut self, scan: ScanSettings) -> Self {
        self.scan = Some(scan);
        self
    }
    /// Timeouts, tuning and scan defaults from a settings file.
    pub fn with_settings(self, settings: &Settings) -> Self {
        self.with_timeouts(settings.timeouts)
            .with_tuning(settings.calibration)
            .with_scan_settings(ScanSettings::from_cfg(&settings.scan))
    }
}

// Setters that advance type-state
impl<M> ScannerBuilder<Missing, M> {
    pub fn with_transport(self, transport: impl Transport + 'static) -> ScannerBuilder<Set, M> {
        ScannerBuilder {
            transport: Some(Box::new(transport)),
            model: self.model,
            database: self.database,
            clock: self.clock,
            timeouts: self.timeouts,
            tuning: self.tuning,
            scan: self.scan,
            _t: PhantomData,
            _m: PhantomData,
        }
    }
}

impl<T> ScannerBuilder<T, Missing> {
    pub fn with_model(self, model: impl Into<String>) -> ScannerBuilder<T, Set> {
        ScannerBuilder {
            transport: self.transport,
            model: Some(model.into()),
            database: self.database,
            clock: self.clock,
            timeouts: self.timeouts,
            tuning: self.tuning,
            scan: self.scan,
            _t: PhantomData,
            _m: PhantomData,
        }
    }
}

impl ScannerBuilder<Set, Set> {
    /// Validate and build the Scanner. Only available when transport and model are set.
    pub fn build(self) -> Result<Scanner> {
        self.try_build()
    }
}
