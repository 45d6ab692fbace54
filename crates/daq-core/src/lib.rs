//! `daq-core`
//!
//! Transport primitives shared by the instrument driver crates.
//!
//! The driver crates talk SCPI: ASCII commands terminated by a line feed, with
//! at most one response line per query. This crate defines that channel as the
//! [`ScpiTransport`] trait and provides the concrete ways of obtaining one.
//!
//! ## Key Types
//!
//! - [`ScpiTransport`]: half-duplex line channel (write, read, query)
//! - [`Connector`]: opens a transport from an address string
//! - [`DaqError`]: transport-layer error type
//! - [`serial::SerialConnector`]: RS-232, direct or through a Prologix GPIB-USB controller
//! - `mock::ScriptedConnector`: canned responses for driver tests (feature `mock`)

pub mod error;
pub mod transport;

#[cfg(feature = "serial")]
pub mod serial;

#[cfg(feature = "mock")]
pub mod mock;

pub use error::DaqError;
pub use transport::{BoxedTransport, Connector, LineTerminator, ScpiTransport};
