//! The SCPI line channel.
//!
//! Instruments in this workspace speak a half-duplex ASCII protocol: the host
//! writes one command line, and for queries the instrument answers with exactly
//! one line. [`ScpiTransport`] captures that contract without saying anything
//! about the physical link, so drivers can be exercised against scripted or
//! simulated instruments.

use crate::error::DaqError;
use async_trait::async_trait;
use std::time::Duration;

/// Line terminator appended to outgoing commands and expected on responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineTerminator {
    /// `\n` (the SCPI default for RS-232 and GPIB EOS).
    #[default]
    Lf,
    /// `\r\n`
    CrLf,
    /// `\r`
    Cr,
}

impl LineTerminator {
    /// Bytes appended to each outgoing line.
    pub fn as_str(&self) -> &'static str {
        match self {
            LineTerminator::Lf => "\n",
            LineTerminator::CrLf => "\r\n",
            LineTerminator::Cr => "\r",
        }
    }

    /// Final byte of an incoming line.
    pub fn delimiter(&self) -> u8 {
        match self {
            LineTerminator::Lf | LineTerminator::CrLf => b'\n',
            LineTerminator::Cr => b'\r',
        }
    }
}

/// Half-duplex, line-oriented instrument channel.
///
/// Implementations strip the line terminator from everything returned by
/// [`read_line`](ScpiTransport::read_line) but leave other whitespace alone;
/// interpreting the payload is the driver's job.
#[async_trait]
pub trait ScpiTransport: Send {
    /// Write one command line. The terminator is appended by the transport.
    async fn write_line(&mut self, line: &str) -> Result<(), DaqError>;

    /// Read one response line, waiting at most [`timeout`](ScpiTransport::timeout).
    async fn read_line(&mut self) -> Result<String, DaqError>;

    /// Write a query and read its single response line.
    async fn query_line(&mut self, line: &str) -> Result<String, DaqError> {
        self.write_line(line).await?;
        self.read_line().await
    }

    /// Change the terminator used for both directions.
    fn set_line_terminator(&mut self, terminator: LineTerminator);

    /// Current read/write timeout.
    fn timeout(&self) -> Duration;

    /// Replace the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration);

    /// Release the underlying resource. The transport must not be used afterwards.
    async fn close(&mut self) -> Result<(), DaqError> {
        Ok(())
    }
}

/// Type-erased transport owned by a driver session.
pub type BoxedTransport = Box<dyn ScpiTransport>;

/// Opens transports from address strings.
///
/// A driver session holds one connector for its whole life and asks it for a
/// fresh transport on every `connect`.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport for `address`.
    async fn open(&self, address: &str) -> Result<BoxedTransport, DaqError>;
}
