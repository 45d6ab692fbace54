//! [`ScpiTransport`] and [`Connector`] backed by a [`Simulated6220`].

use crate::instrument::Simulated6220;
use async_trait::async_trait;
use daq_core::{BoxedTransport, Connector, DaqError, LineTerminator, ScpiTransport};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Line channel to a simulated instrument.
///
/// Replies are queued as the commands are written. A read with nothing queued
/// fails with a timeout immediately instead of waiting.
pub struct SimulatedTransport {
    instrument: Simulated6220,
    pending: VecDeque<String>,
    terminator: LineTerminator,
    timeout: Duration,
}

impl SimulatedTransport {
    /// Transport talking to `instrument`.
    pub fn new(instrument: Simulated6220) -> Self {
        Self {
            instrument,
            pending: VecDeque::new(),
            terminator: LineTerminator::Lf,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Terminator most recently configured by the driver.
    pub fn terminator(&self) -> LineTerminator {
        self.terminator
    }
}

#[async_trait]
impl ScpiTransport for SimulatedTransport {
    async fn write_line(&mut self, line: &str) -> Result<(), DaqError> {
        if let Some(reply) = self.instrument.execute(line) {
            self.pending.push_back(reply);
        }
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, DaqError> {
        self.pending.pop_front().ok_or(DaqError::Timeout {
            operation: "read_line",
            timeout: self.timeout,
        })
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
}

/// Opens [`SimulatedTransport`]s onto one shared instrument.
///
/// Any address is accepted unless the connector was made unreachable.
#[derive(Clone, Default)]
pub struct SimulatedConnector {
    instrument: Simulated6220,
    unreachable: Arc<Mutex<bool>>,
}

impl SimulatedConnector {
    /// Connector for `instrument`.
    pub fn new(instrument: Simulated6220) -> Self {
        Self {
            instrument,
            unreachable: Arc::new(Mutex::new(false)),
        }
    }

    /// The instrument behind this connector.
    pub fn handle(&self) -> Simulated6220 {
        self.instrument.clone()
    }

    /// Make subsequent opens fail as if nothing answered.
    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock() = unreachable;
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    #[instrument(skip(self), err)]
    async fn open(&self, address: &str) -> Result<BoxedTransport, DaqError> {
        if *self.unreachable.lock() {
            return Err(DaqError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no simulated instrument at {}", address),
            )));
        }
        debug!("Opening simulated 6220");
        Ok(Box::new(SimulatedTransport::new(self.instrument.clone())))
    }
}
