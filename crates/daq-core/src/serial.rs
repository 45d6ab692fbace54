//! Serial Port Transport
//!
//! RS-232 implementation of [`ScpiTransport`], either wired directly to the
//! instrument or routed through a Prologix-style GPIB-USB controller that
//! presents itself as a virtual serial port.
//!
//! # Feature Flag
//!
//! This module requires the `serial` feature to be enabled:
//!
//! ```toml
//! [dependencies]
//! daq-core = { path = "../daq-core", features = ["serial"] }
//! ```
//!
//! # Addresses
//!
//! - `/dev/ttyUSB0`, `COM3`: direct RS-232
//! - `prologix:/dev/ttyUSB0:12`: GPIB primary address 12 behind a Prologix controller
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_core::serial::SerialConnector;
//! use daq_core::Connector;
//!
//! let connector = SerialConnector::new(9600, Duration::from_secs(2));
//! let mut transport = connector.open("prologix:/dev/ttyUSB0:12").await?;
//! let idn = transport.query_line("*IDN?").await?;
//! ```

use crate::error::DaqError;
use crate::transport::{BoxedTransport, Connector, LineTerminator, ScpiTransport};
use async_trait::async_trait;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, trace};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// How long [`SerialTransport::query_line`] spends discarding stale input.
const STALE_DRAIN_MS: u64 = 10;

/// GPIB primary addresses accepted by the controller.
const MAX_GPIB_ADDRESS: u8 = 30;

const PROLOGIX_ESCAPE: u8 = 0x1b;

// =============================================================================
// Addresses
// =============================================================================

/// Parsed serial instrument address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialAddress {
    /// Instrument wired straight to the port.
    Direct {
        /// Port path (`/dev/ttyUSB0`, `COM3`).
        port: String,
    },
    /// Instrument on a GPIB bus behind a Prologix GPIB-USB controller.
    Prologix {
        /// Port path of the controller.
        port: String,
        /// GPIB primary address of the instrument.
        gpib_address: u8,
    },
}

impl SerialAddress {
    /// Port path to open.
    pub fn port(&self) -> &str {
        match self {
            SerialAddress::Direct { port } | SerialAddress::Prologix { port, .. } => port,
        }
    }
}

impl FromStr for SerialAddress {
    type Err = DaqError;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| DaqError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let address_trimmed = address.trim();
        if address_trimmed.is_empty() {
            return Err(invalid("address is empty"));
        }

        let Some(rest) = address_trimmed.strip_prefix("prologix:") else {
            return Ok(SerialAddress::Direct {
                port: address_trimmed.to_string(),
            });
        };

        let (port, gpib) = rest
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected prologix:<port>:<gpib-address>"))?;
        if port.is_empty() {
            return Err(invalid("missing port path"));
        }
        let gpib_address: u8 = gpib
            .parse()
            .map_err(|_| invalid("GPIB address is not a number"))?;
        if gpib_address > MAX_GPIB_ADDRESS {
            return Err(invalid("GPIB address must be 0-30"));
        }

        Ok(SerialAddress::Prologix {
            port: port.to_string(),
            gpib_address,
        })
    }
}

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port asynchronously using spawn_blocking.
///
/// This function wraps the serial port opening in `spawn_blocking` to avoid
/// blocking the async runtime during port initialization. Standard settings
/// are applied: 8N1, no flow control.
///
/// # Errors
///
/// Returns [`DaqError::Io`] if the port cannot be opened or spawn_blocking fails.
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> Result<tokio_serial::SerialStream, DaqError> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                DaqError::Io(std::io::Error::other(format!(
                    "Failed to open {} serial port {}: {}",
                    device_name_owned, port_path_owned, e
                )))
            })
    })
    .await
    .map_err(|e| {
        DaqError::Io(std::io::Error::other(format!(
            "spawn_blocking for serial port opening failed: {}",
            e
        )))
    })?
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards until nothing arrives for the remainder of `timeout_ms`.
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break, // no more immediate data
        }
    }

    total_discarded
}

// =============================================================================
// SerialTransport
// =============================================================================

/// [`ScpiTransport`] over a serial port.
///
/// In Prologix mode the controller is put in controller mode with
/// auto-read-after-write disabled, so every read is explicitly requested with
/// `++read eoi`. Data bytes that the controller would interpret (`+`, ESC,
/// CR, LF) are escaped.
pub struct SerialTransport {
    port: BufReader<DynSerial>,
    terminator: LineTerminator,
    timeout: Duration,
    prologix: bool,
}

impl SerialTransport {
    /// Wrap a port wired directly to the instrument.
    pub fn new(port: DynSerial, timeout: Duration) -> Self {
        Self {
            port: BufReader::new(port),
            terminator: LineTerminator::Lf,
            timeout,
            prologix: false,
        }
    }

    /// Wrap a Prologix controller port and address the instrument at `gpib_address`.
    pub async fn prologix(
        port: DynSerial,
        gpib_address: u8,
        timeout: Duration,
    ) -> Result<Self, DaqError> {
        let mut transport = Self {
            port: BufReader::new(port),
            terminator: LineTerminator::Lf,
            timeout,
            prologix: true,
        };

        let setup = [
            "++mode 1".to_string(),
            format!("++addr {}", gpib_address),
            "++auto 0".to_string(),
            "++eos 2".to_string(),
            "++eoi 1".to_string(),
        ];
        for command in &setup {
            transport.write_raw(format!("{}\n", command).as_bytes()).await?;
        }
        debug!(gpib_address, "Prologix controller configured");

        Ok(transport)
    }

    fn frame(&self, line: &str) -> Vec<u8> {
        if !self.prologix {
            return format!("{}{}", line, self.terminator.as_str()).into_bytes();
        }

        // The controller appends the EOS terminator itself (`++eos 2` = LF).
        let mut framed = Vec::with_capacity(line.len() + 2);
        for &byte in line.as_bytes() {
            if matches!(byte, b'+' | b'\r' | b'\n' | PROLOGIX_ESCAPE) {
                framed.push(PROLOGIX_ESCAPE);
            }
            framed.push(byte);
        }
        framed.push(b'\n');
        framed
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), DaqError> {
        let timeout = self.timeout;
        let port = self.port.get_mut();
        tokio::time::timeout(timeout, async {
            port.write_all(bytes).await?;
            port.flush().await
        })
        .await
        .map_err(|_| DaqError::Timeout {
            operation: "write_line",
            timeout,
        })??;
        Ok(())
    }

    async fn discard_stale_input(&mut self) {
        let buffered = self.port.buffer().len();
        if buffered > 0 {
            self.port.consume(buffered);
        }
        let discarded = drain_serial_buffer(self.port.get_mut(), STALE_DRAIN_MS).await + buffered;
        if discarded > 0 {
            debug!(discarded, "Discarded stale bytes before query");
        }
    }
}

#[async_trait]
impl ScpiTransport for SerialTransport {
    async fn write_line(&mut self, line: &str) -> Result<(), DaqError> {
        trace!(line, "write");
        let framed = self.frame(line);
        self.write_raw(&framed).await
    }

    async fn read_line(&mut self) -> Result<String, DaqError> {
        if self.prologix {
            self.write_raw(b"++read eoi\n").await?;
        }

        let delimiter = self.terminator.delimiter();
        let timeout = self.timeout;
        let mut buf = Vec::new();
        let n = tokio::time::timeout(timeout, self.port.read_until(delimiter, &mut buf))
            .await
            .map_err(|_| DaqError::Timeout {
                operation: "read_line",
                timeout,
            })??;
        if n == 0 {
            return Err(DaqError::SerialUnexpectedEof);
        }

        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(&['\r', '\n'][..])
            .to_string();
        trace!(line = %line, "read");
        Ok(line)
    }

    async fn query_line(&mut self, line: &str) -> Result<String, DaqError> {
        self.discard_stale_input().await;
        self.write_line(line).await?;
        self.read_line().await
    }

    fn set_line_terminator(&mut self, terminator: LineTerminator) {
        self.terminator = terminator;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn close(&mut self) -> Result<(), DaqError> {
        self.port.get_mut().shutdown().await?;
        Ok(())
    }
}

// =============================================================================
// SerialConnector
// =============================================================================

/// [`Connector`] that opens serial ports, direct or through a Prologix controller.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    baud_rate: u32,
    timeout: Duration,
    device_name: String,
}

impl SerialConnector {
    /// Connector with the given line settings.
    pub fn new(baud_rate: u32, timeout: Duration) -> Self {
        Self {
            baud_rate,
            timeout,
            device_name: "instrument".to_string(),
        }
    }

    /// Name used in open-failure messages.
    pub fn with_device_name(mut self, device_name: impl Into<String>) -> Self {
        self.device_name = device_name.into();
        self
    }
}

#[async_trait]
impl Connector for SerialConnector {
    #[instrument(skip(self), fields(baud = self.baud_rate), err)]
    async fn open(&self, address: &str) -> Result<BoxedTransport, DaqError> {
        let parsed: SerialAddress = address.parse()?;
        let stream = open_serial_async(parsed.port(), self.baud_rate, &self.device_name).await?;
        let port: DynSerial = Box::new(stream);

        match parsed {
            SerialAddress::Direct { .. } => Ok(Box::new(SerialTransport::new(port, self.timeout))),
            SerialAddress::Prologix { gpib_address, .. } => Ok(Box::new(
                SerialTransport::prologix(port, gpib_address, self.timeout).await?,
            )),
        }
    }
}
