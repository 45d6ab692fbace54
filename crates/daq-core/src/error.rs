//! Transport error types.
//!
//! This module defines `DaqError`, the error type returned by every
//! [`ScpiTransport`](crate::transport::ScpiTransport) and
//! [`Connector`](crate::transport::Connector) implementation. Driver crates wrap
//! it in their own taxonomy; the binary finally folds everything into `anyhow`.
//!
//! ## Error Hierarchy
//!
//! - **`Io`**: Wraps `std::io::Error` from the underlying port.
//! - **`Timeout`**: A read or write did not complete inside the transport timeout.
//! - **`SerialUnexpectedEof`**: The channel is gone.
//! - **`InvalidAddress`**: An address string could not be parsed into a port.
//!
//! By using `#[from]`, `DaqError` can be created from `std::io::Error` with the
//! `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Error type for line-oriented instrument transports.
///
/// # Error Categories
///
/// 1. **Address Errors** - `InvalidAddress`
///    - Occur before any byte is exchanged
///    - Recovery: fix the address and reconnect
///
/// 2. **Channel Errors** - `Io`, `SerialUnexpectedEof`
///    - The channel is unusable
///    - Recovery: disconnect and reconnect
///
/// 3. **Timing Errors** - `Timeout`
///    - The instrument did not answer in time (busy, wrong address, no response
///      to an invalid query)
///    - Recovery: the channel may still be usable; the caller decides
#[derive(Error, Debug)]
pub enum DaqError {
    /// Low-level I/O failure on the port.
    ///
    /// **Error Type**: Usually permanent for the current connection (cable
    /// pulled, device powered off).
    ///
    /// **Recovery Strategy**: Reconnect.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation did not complete within the configured timeout.
    ///
    /// **Error Type**: Transient. SCPI instruments stay silent when they reject
    /// a query, so a timeout is also the visible symptom of an unknown header.
    ///
    /// **Recovery Strategy**: Check the instrument error queue, then retry.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Which transport operation timed out.
        operation: &'static str,
        /// Timeout in effect when the operation was started.
        timeout: Duration,
    },

    /// The port returned end-of-file while a response line was expected.
    ///
    /// **Error Type**: Permanent for this connection.
    ///
    /// **Recovery Strategy**: Reconnect; check the cable and the controller.
    #[error("Unexpected EOF from serial port")]
    SerialUnexpectedEof,

    /// Address string could not be parsed.
    ///
    /// Accepted forms are a bare port path (`/dev/ttyUSB0`, `COM3`) and
    /// `prologix:<port>:<gpib-address>`.
    #[error("Invalid instrument address '{address}': {reason}")]
    InvalidAddress {
        /// The rejected address.
        address: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl DaqError {
    /// Whether the channel can still carry traffic after this error.
    ///
    /// Only timeouts leave the channel usable; everything else requires a
    /// reconnect.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DaqError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Timeout {
            operation: "read_line",
            timeout: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "read_line timed out after 2s");
    }

    #[test]
    fn test_invalid_address_display() {
        let err = DaqError::InvalidAddress {
            address: "prologix:/dev/ttyUSB0:99".into(),
            reason: "GPIB address must be 0-30".into(),
        };
        assert!(err.to_string().contains("prologix:/dev/ttyUSB0:99"));
    }

    #[test]
    fn test_only_timeouts_are_recoverable() {
        let timeout = DaqError::Timeout {
            operation: "write_line",
            timeout: Duration::from_millis(500),
        };
        assert!(timeout.is_recoverable());
        assert!(!DaqError::SerialUnexpectedEof.is_recoverable());
        let io = DaqError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(!io.is_recoverable());
    }
}
