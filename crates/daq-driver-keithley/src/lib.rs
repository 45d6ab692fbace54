//! Keithley 6220 differential-conductance driver.
//!
//! This crate drives a Keithley 6220 precision current source through a
//! differential-conductance sweep with a 2182A nanovoltmeter chained to its
//! RS-232 relay port:
//!
//! 1. connect and identify ([`DeviceSession`])
//! 2. validate parameters and program the sweep ([`plan`], [`planner`])
//! 3. arm and poll until the instrument reports armed ([`arming`])
//! 4. trigger, abort, and retrieve the buffer ([`measurement`])
//!
//! [`Keithley6220Controller`] composes these behind one lock and publishes
//! every outcome as a [`SessionEvent`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use daq_core::serial::SerialConnector;
//! use daq_driver_keithley::{ControllerConfig, Keithley6220Controller, SweepParams};
//! use std::sync::Arc;
//!
//! let connector = Arc::new(SerialConnector::new(9600, Duration::from_secs(2)));
//! let controller = Keithley6220Controller::new(connector, ControllerConfig::default());
//! controller.connect("prologix:/dev/ttyUSB0:12").await?;
//! let plan = controller.configure(SweepParams::new(0.0, 0.01, 0.001)).await?;
//! ```

pub mod arming;
pub mod compliance;
pub mod controller;
pub mod error;
pub mod events;
pub mod measurement;
pub mod nanovoltmeter;
pub mod plan;
pub mod planner;
pub mod scpi;
pub mod session;
pub mod status;

pub use arming::{ArmFailure, ArmState, ArmingConfig, ArmingSession, PollOutcome};
pub use controller::{ControllerConfig, Keithley6220Controller};
pub use error::{Field, KeithleyError, Precondition, Result, ValidationError};
pub use events::SessionEvent;
pub use measurement::MeasurementBuffer;
pub use nanovoltmeter::Nanovoltmeter;
pub use plan::{SweepField, SweepParams, SweepPlan};
pub use scpi::DeviceError;
pub use session::{DeviceSession, LastKnownState};
pub use status::{InnerShield, MeasurementUnit, OutputLow, OutputState};
