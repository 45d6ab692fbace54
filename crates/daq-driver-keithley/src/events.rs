//! Events published by the controller.

use crate::arming::ArmState;
use crate::status::{InnerShield, OutputState};
use serde::Serialize;

/// Everything the controller reports to its front end.
///
/// Serialized with an `event` tag so a UI can consume the JSON stream directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Connection established.
    Connected {
        /// Address connected to.
        address: String,
        /// `*IDN?` reply.
        identity: String,
    },
    /// Connection attempt failed.
    ConnectionFailed {
        /// Error text.
        reason: String,
    },
    /// Connection released.
    Disconnected,
    /// Result of a nanovoltmeter presence check.
    NanovoltmeterPresence {
        /// Whether a 2182A was detected.
        present: bool,
    },
    /// A sweep plan was written to the instrument.
    ParametersSet {
        /// Buffer points.
        total_points: u32,
        /// Expected sweep duration (s).
        estimated_time_s: f64,
    },
    /// Configuration was rejected or interrupted.
    ConfigurationFailed {
        /// Error text.
        reason: String,
    },
    /// Result of re-reading the sweep parameters.
    ParametersVerified {
        /// Whether they matched the stored plan.
        matched: bool,
    },
    /// A soft failure that did not stop the operation.
    Warning {
        /// Warning text.
        message: String,
    },
    /// Arm command sent; polling started.
    ArmingInitiated,
    /// Still waiting for the instrument to arm.
    ArmingProgress {
        /// Poll time accumulated (s).
        elapsed_s: f64,
    },
    /// The instrument reported the sweep armed.
    Armed,
    /// Arming failed.
    ArmingFailed {
        /// Error text.
        reason: String,
    },
    /// Arming poll reached its ceiling.
    ArmingTimedOut {
        /// Poll time accumulated (s).
        elapsed_s: f64,
    },
    /// An arm request was refused because one is in progress.
    ArmingRejected {
        /// Error text.
        reason: String,
    },
    /// The arming poll was stopped without contacting the instrument.
    ArmingMonitorStopped,
    /// The sweep was aborted.
    Aborted,
    /// Abort requested with nothing to abort.
    AbortNotNeeded {
        /// Arming state at the time.
        state: ArmState,
    },
    /// Sweep triggered.
    MeasurementStarted,
    /// Sweep could not be triggered.
    MeasurementFailed {
        /// Error text.
        reason: String,
    },
    /// Buffer retrieved.
    DataReady {
        /// Number of points.
        points: usize,
    },
    /// Buffer retrieval failed.
    RetrievalFailed {
        /// Error text.
        reason: String,
    },
    /// Output relay state read.
    OutputState {
        /// The state.
        state: OutputState,
    },
    /// Inner shield connection read.
    InnerShield {
        /// The connection.
        shield: InnerShield,
    },
    /// Interlock read.
    Interlock {
        /// Whether it is closed.
        closed: bool,
    },
    /// Arm status read.
    ArmStatus {
        /// Whether the instrument reports armed.
        armed: bool,
    },
    /// An error queue entry.
    DeviceError {
        /// SCPI error code.
        code: i32,
        /// Message text.
        message: String,
    },
    /// The error queue is empty.
    ErrorQueueEmpty,
    /// Any other failed operation.
    Error {
        /// Operation name.
        operation: String,
        /// Error text.
        message: String,
    },
}
