//! Driver error taxonomy.
//!
//! `KeithleyError` separates failures by what the caller can do about them:
//!
//! - **Local rejections** (`Validation`, `StopNotAboveStart`, `Capacity`,
//!   `ArmingInProgress`, `NotArmed`, `OutputOn`, `NotConnected`,
//!   `AlreadyConnected`) happen before any device traffic.
//! - **Device-reported** errors (`Protocol`, `EmptyResponse`,
//!   `UnexpectedResponse`, `Verification`, `EmptyData`) leave the session usable.
//! - **Channel** errors (`Transport`, `Connection`) require a reconnect.
//! - **Workflow** errors (`PartialConfiguration`, `Precondition`, `Timeout`)
//!   describe where a multi-step operation stopped.

use daq_core::DaqError;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type Result<T> = std::result::Result<T, KeithleyError>;

/// Sweep and output parameters subject to range validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Sweep start current (A).
    Start,
    /// Sweep stop current (A).
    Stop,
    /// Sweep step current (A).
    Step,
    /// Differential delta current (A).
    Delta,
    /// Source delay per point (s).
    Delay,
    /// Compliance voltage (V).
    ComplianceVoltage,
}

impl Field {
    /// Lower-case field name as it appears in messages.
    pub fn name(&self) -> &'static str {
        match self {
            Field::Start => "start",
            Field::Stop => "stop",
            Field::Step => "step",
            Field::Delta => "delta",
            Field::Delay => "delay",
            Field::ComplianceVoltage => "compliance_voltage",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single out-of-range value.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("{field} = {value} is outside [{min}, {max}]")]
pub struct ValidationError {
    /// Offending field.
    pub field: Field,
    /// Rejected value.
    pub value: f64,
    /// Inclusive lower bound.
    pub min: f64,
    /// Inclusive upper bound.
    pub max: f64,
}

/// Arming preconditions, in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Precondition {
    /// Device parameters do not match the stored plan (or there is no plan).
    ParametersNotVerified,
    /// No 2182A nanovoltmeter is attached to the 6220.
    NanovoltmeterMissing,
    /// The output interlock is open.
    InterlockOpen,
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Precondition::ParametersNotVerified => "sweep parameters not verified",
            Precondition::NanovoltmeterMissing => "nanovoltmeter not detected",
            Precondition::InterlockOpen => "interlock open",
        })
    }
}

/// Errors returned by the Keithley 6220 driver.
#[derive(Error, Debug)]
pub enum KeithleyError {
    /// The transport failed; the channel is unusable until reconnect.
    #[error("transport error: {0}")]
    Transport(#[from] DaqError),

    /// No connection is open.
    #[error("instrument not connected")]
    NotConnected,

    /// `connect` was called on a session that already holds a connection.
    #[error("instrument already connected to {address}")]
    AlreadyConnected {
        /// Address of the live connection.
        address: String,
    },

    /// Opening the connection or identifying the instrument failed.
    #[error("connection to {address} failed: {reason}")]
    Connection {
        /// Address that was tried.
        address: String,
        /// What went wrong.
        reason: String,
    },

    /// The instrument answered with a SCPI error frame.
    #[error("'{command}' returned device error {code}: {message}")]
    Protocol {
        /// Command that produced the frame.
        command: String,
        /// SCPI error code (negative for standard errors).
        code: i32,
        /// Error text with quotes removed.
        message: String,
    },

    /// The instrument answered with an empty line.
    #[error("'{command}' returned an empty response")]
    EmptyResponse {
        /// Command that was sent.
        command: String,
    },

    /// The response did not have the expected shape.
    #[error("'{command}' returned unexpected response '{response}'")]
    UnexpectedResponse {
        /// Command that was sent.
        command: String,
        /// The raw response line.
        response: String,
    },

    /// A parameter was out of range.
    #[error("invalid parameter: {0}")]
    Validation(#[from] ValidationError),

    /// The sweep would not move upward.
    #[error("stop ({stop}) must be greater than start ({start})")]
    StopNotAboveStart {
        /// Requested start current.
        start: f64,
        /// Requested stop current.
        stop: f64,
    },

    /// The sweep has more points than the buffer holds.
    #[error("sweep needs {points} points, buffer holds at most {max}")]
    Capacity {
        /// Points the sweep would produce.
        points: u64,
        /// Buffer capacity.
        max: u32,
    },

    /// A read-back did not match the value written.
    #[error("{what} read back '{actual}', expected '{expected}'")]
    Verification {
        /// Setting being verified.
        what: String,
        /// Value written.
        expected: String,
        /// Value reported by the instrument.
        actual: String,
    },

    /// Parameter push stopped part-way; the device holds a mix of old and new values.
    #[error("configuration interrupted after {sent:?}, not sent {unconfirmed:?}: {reason}")]
    PartialConfiguration {
        /// Fields written successfully, in order.
        sent: Vec<Field>,
        /// Fields not written, starting with the one that failed.
        unconfirmed: Vec<Field>,
        /// Underlying failure.
        reason: String,
    },

    /// An arming precondition does not hold.
    #[error("cannot arm: {0}")]
    Precondition(Precondition),

    /// An arming attempt is already being monitored.
    #[error("arming already in progress")]
    ArmingInProgress,

    /// The operation requires an armed sweep.
    #[error("sweep is not armed")]
    NotArmed,

    /// The arm-status poll gave up.
    #[error("arming timed out after {elapsed:?}")]
    Timeout {
        /// Poll time accumulated when giving up.
        elapsed: Duration,
    },

    /// The buffer held no complete current/voltage readings.
    #[error("no readings found in buffer data")]
    EmptyData,

    /// The setting can only change while the output is off.
    #[error("output is on; turn it off first")]
    OutputOn,
}

impl KeithleyError {
    /// Whether the error was raised without talking to the instrument.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            KeithleyError::NotConnected
                | KeithleyError::AlreadyConnected { .. }
                | KeithleyError::Validation(_)
                | KeithleyError::StopNotAboveStart { .. }
                | KeithleyError::Capacity { .. }
                | KeithleyError::ArmingInProgress
                | KeithleyError::NotArmed
                | KeithleyError::OutputOn
        )
    }

    pub(crate) fn verification(
        what: &str,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        KeithleyError::Verification {
            what: what.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub(crate) fn unexpected(command: &str, response: &str) -> Self {
        KeithleyError::UnexpectedResponse {
            command: command.to_string(),
            response: response.to_string(),
        }
    }
}
