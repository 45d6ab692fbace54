//! Connection lifecycle and raw SCPI exchange with the 6220.
//!
//! Every interaction with the instrument goes through [`DeviceSession::send`]
//! or one of the query methods, so error frames are detected and logged in a
//! single place. The session owns the transport exclusively; higher layers
//! borrow the session for the duration of one operation.

use crate::error::{KeithleyError, Result};
use crate::scpi::{self, cmd, DeviceError};
use crate::status::{InnerShield, OutputLow, OutputState};
use daq_core::{BoxedTransport, Connector, LineTerminator};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Default timeout for bulk buffer reads.
pub const DEFAULT_DATA_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for a trailing line from the serial relay.
const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Last state the instrument reported. `None` means not yet observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LastKnownState {
    /// Output relay state.
    pub output: Option<OutputState>,
    /// Inner shield connection.
    pub inner_shield: Option<InnerShield>,
    /// Output-low earth connection.
    pub output_low: Option<OutputLow>,
}

/// A connection to one Keithley 6220.
pub struct DeviceSession {
    connector: Arc<dyn Connector>,
    transport: Option<BoxedTransport>,
    address: Option<String>,
    identity: Option<String>,
    last_known: LastKnownState,
    data_timeout: Duration,
}

impl DeviceSession {
    /// Unconnected session that opens transports through `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            transport: None,
            address: None,
            identity: None,
            last_known: LastKnownState::default(),
            data_timeout: DEFAULT_DATA_TIMEOUT,
        }
    }

    /// Use `timeout` for `TRAC:DATA?` instead of the default.
    pub fn with_data_timeout(mut self, timeout: Duration) -> Self {
        self.data_timeout = timeout;
        self
    }

    /// Timeout applied to bulk buffer reads.
    pub fn data_timeout(&self) -> Duration {
        self.data_timeout
    }

    /// Whether a transport is held.
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Address of the live connection.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// `*IDN?` response captured at connect time.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Cached instrument state.
    pub fn last_known(&self) -> LastKnownState {
        self.last_known
    }

    pub(crate) fn last_known_mut(&mut self) -> &mut LastKnownState {
        &mut self.last_known
    }

    /// Open the transport and identify the instrument.
    ///
    /// The identity query doubles as a liveness check: if it fails the
    /// transport is closed again and the session stays disconnected.
    #[instrument(skip(self), err)]
    pub async fn connect(&mut self, address: &str) -> Result<String> {
        if self.transport.is_some() {
            return Err(KeithleyError::AlreadyConnected {
                address: self.address.clone().unwrap_or_default(),
            });
        }

        let connection_error = |reason: String| KeithleyError::Connection {
            address: address.to_string(),
            reason,
        };

        let mut transport = self
            .connector
            .open(address)
            .await
            .map_err(|e| connection_error(e.to_string()))?;
        transport.set_line_terminator(LineTerminator::Lf);

        let identity = match transport.query_line(cmd::IDN).await {
            Ok(line) if !line.trim().is_empty() => line.trim().to_string(),
            outcome => {
                let reason = match outcome {
                    Err(e) => format!("identification failed: {}", e),
                    Ok(_) => "identification returned an empty response".to_string(),
                };
                if let Err(e) = transport.close().await {
                    debug!(error = %e, "Closing transport after failed identification");
                }
                return Err(connection_error(reason));
            }
        };

        info!(address, identity = %identity, "Connected to Keithley 6220");
        self.transport = Some(transport);
        self.address = Some(address.to_string());
        self.identity = Some(identity.clone());
        self.last_known = LastKnownState::default();
        Ok(identity)
    }

    /// Release the transport. Calling this while disconnected does nothing.
    pub async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!(error = %e, "Error closing transport");
            }
            info!(address = ?self.address, "Disconnected");
        }
        self.address = None;
        self.identity = None;
        self.last_known = LastKnownState::default();
    }

    fn transport_mut(&mut self) -> Result<&mut BoxedTransport> {
        self.transport.as_mut().ok_or(KeithleyError::NotConnected)
    }

    /// Write a command without waiting for a response.
    pub async fn send(&mut self, command: &str) -> Result<()> {
        let transport = self.transport_mut()?;
        transport.write_line(command).await.map_err(|e| {
            warn!(command, error = %e, "Write failed");
            KeithleyError::Transport(e)
        })?;
        debug!(command, "sent");
        Ok(())
    }

    /// Query and return the trimmed response, rejecting empty lines only.
    pub async fn query_raw(&mut self, command: &str) -> Result<String> {
        let transport = self.transport_mut()?;
        let line = transport.query_line(command).await.map_err(|e| {
            warn!(command, error = %e, "Query failed");
            KeithleyError::Transport(e)
        })?;

        let line = line.trim();
        if line.is_empty() {
            warn!(command, "Empty response");
            return Err(KeithleyError::EmptyResponse {
                command: command.to_string(),
            });
        }
        debug!(command, response = line, "query");
        Ok(line.to_string())
    }

    /// [`query_raw`](Self::query_raw) with a temporary read timeout.
    pub async fn query_raw_with_timeout(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<String> {
        let transport = self.transport_mut()?;
        let previous = transport.timeout();
        transport.set_timeout(timeout);

        let result = self.query_raw(command).await;

        if let Some(transport) = self.transport.as_mut() {
            transport.set_timeout(previous);
        }
        result
    }

    /// Query and decode SCPI error frames into [`KeithleyError::Protocol`].
    pub async fn query(&mut self, command: &str) -> Result<String> {
        let line = self.query_raw(command).await?;
        if let Some(DeviceError { code, message }) = scpi::parse_error_frame(&line) {
            warn!(command, code, message = %message, "Device reported error");
            return Err(KeithleyError::Protocol {
                command: command.to_string(),
                code,
                message,
            });
        }
        Ok(line)
    }

    /// Query a numeric value.
    pub async fn query_f64(&mut self, command: &str) -> Result<f64> {
        let reply = self.query(command).await?;
        reply
            .parse::<f64>()
            .map_err(|_| KeithleyError::unexpected(command, &reply))
    }

    /// Query a `1`/`0` flag.
    pub async fn query_bool(&mut self, command: &str) -> Result<bool> {
        let reply = self.query(command).await?;
        scpi::parse_bool(&reply).ok_or_else(|| KeithleyError::unexpected(command, &reply))
    }

    /// Query a flag that is set only when the reply is exactly `1`.
    ///
    /// Any other reply, including a device-reported error, reads as unset.
    /// Link failures still propagate.
    pub async fn query_flag(&mut self, command: &str) -> Result<bool> {
        match self.query(command).await {
            Ok(reply) => Ok(reply.trim() == "1"),
            Err(KeithleyError::Protocol { code, .. }) => {
                debug!(command, code, "Flag query refused, treating as unset");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Pop one entry from the error queue. `None` when the queue is empty.
    pub async fn check_error(&mut self) -> Result<Option<DeviceError>> {
        let line = self.query_raw(cmd::SYST_ERR).await?;
        let entry = scpi::parse_error_queue_entry(&line)
            .ok_or_else(|| KeithleyError::unexpected(cmd::SYST_ERR, &line))?;

        if entry.code == 0 {
            Ok(None)
        } else {
            warn!(code = entry.code, message = %entry.message, "Error queue entry");
            Ok(Some(entry))
        }
    }

    /// Re-read the identification string.
    pub async fn identify(&mut self) -> Result<String> {
        let identity = self.query(cmd::IDN).await?;
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Forward a command to the instrument on the 6220's serial relay.
    pub async fn send_aux(&mut self, command: &str) -> Result<()> {
        self.send(&format!("{} {}", cmd::RELAY_SEND, scpi::quote(command)))
            .await
    }

    /// Forward a query through the serial relay and return its answer.
    ///
    /// The relay can leave a trailing line behind, so one extra read is
    /// attempted and its outcome ignored.
    #[instrument(skip(self), err)]
    pub async fn query_aux(&mut self, command: &str) -> Result<String> {
        self.send_aux(command).await?;
        let reply = self.query(cmd::RELAY_ENTER).await?;
        self.drain_relay_line().await;
        Ok(reply)
    }

    async fn drain_relay_line(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let previous = transport.timeout();
        transport.set_timeout(RELAY_DRAIN_TIMEOUT);
        if let Ok(line) = transport.read_line().await {
            debug!(line = %line, "Drained relay line");
        }
        transport.set_timeout(previous);
    }
}
