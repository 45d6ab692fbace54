//! Simulated Keithley 6220 precision current source with a 2182A
//! nanovoltmeter on its relay port.
//!
//! The simulator implements the subset of SCPI that the differential
//! conductance driver uses: sweep parameters, arming with a configurable
//! number of "not yet" polls, buffer generation from a resistive load, output
//! and shield settings, the error queue, and the serial relay.
//!
//! ```rust,ignore
//! use daq_driver_mock::{SimulatedConnector, Simulated6220, SimulatorConfig};
//!
//! let instrument = Simulated6220::new(SimulatorConfig { seed: Some(7), ..Default::default() });
//! let connector = SimulatedConnector::new(instrument.clone());
//! // hand `connector` to the driver, inspect `instrument` afterwards
//! assert!(instrument.commands().contains(&"SOUR:DCON:ARM".to_string()));
//! ```

mod format;
mod instrument;
mod rng;
mod transport;

pub use format::scpi_float;
pub use instrument::{Simulated6220, SimulatorConfig, IDENTITY_2182A, IDENTITY_6220};
pub use rng::NoiseRng;
pub use transport::{SimulatedConnector, SimulatedTransport};
