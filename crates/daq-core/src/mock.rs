//! Scripted transport for driver tests.
//!
//! A [`ScriptedTransport`] answers queries from a table of canned responses
//! and records every line written to it. The table lives behind a shared
//! [`ScriptHandle`], so a test keeps the handle while the transport itself is
//! moved into the driver under test.
//!
//! # Example
//!
//! ```rust,ignore
//! let (connector, script) = daq_core::mock::scripted();
//! script.respond("*IDN?", "KEITHLEY INSTRUMENTS INC.,MODEL 6220");
//! script.respond_sequence("SOUR:DCON:ARM?", ["0", "0", "1"]);
//!
//! // ... drive the session ...
//!
//! assert_eq!(script.count("SOUR:DCON:ARM?"), 3);
//! ```

use crate::error::DaqError;
use crate::transport::{BoxedTransport, Connector, LineTerminator, ScpiTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Script {
    /// Per-command reply queues. The last reply of a queue repeats.
    replies: HashMap<String, VecDeque<String>>,
    /// Lines waiting to be read.
    pending: VecDeque<String>,
    /// Every line written, in order.
    written: Vec<String>,
    /// Commands (by prefix) whose write fails.
    failing_writes: Vec<String>,
    refuse_open: bool,
    opened: usize,
    closed: usize,
}

/// Shared control surface for a scripted instrument.
#[derive(Clone, Default)]
pub struct ScriptHandle {
    inner: Arc<Mutex<Script>>,
}

impl ScriptHandle {
    /// Reply to `command` with `reply` every time it is written.
    ///
    /// A reply containing `\n` produces several response lines.
    pub fn respond(&self, command: &str, reply: &str) {
        let mut script = self.inner.lock();
        script
            .replies
            .insert(command.to_string(), VecDeque::from([reply.to_string()]));
    }

    /// Reply to successive writes of `command` with `replies` in order.
    /// The final reply repeats once the sequence is exhausted.
    pub fn respond_sequence<I, S>(&self, command: &str, replies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut script = self.inner.lock();
        script.replies.insert(
            command.to_string(),
            replies.into_iter().map(Into::into).collect(),
        );
    }

    /// Stop replying to `command`; reads after it will time out.
    pub fn silence(&self, command: &str) {
        self.inner.lock().replies.remove(command);
    }

    /// Make every write starting with `prefix` fail with a broken pipe.
    pub fn fail_writes_starting_with(&self, prefix: &str) {
        self.inner.lock().failing_writes.push(prefix.to_string());
    }

    /// Make the connector refuse to open.
    pub fn refuse_open(&self, refuse: bool) {
        self.inner.lock().refuse_open = refuse;
    }

    /// Every line written so far.
    pub fn written(&self) -> Vec<String> {
        self.inner.lock().written.clone()
    }

    /// Number of writes exactly equal to `command`.
    pub fn count(&self, command: &str) -> usize {
        self.inner
            .lock()
            .written
            .iter()
            .filter(|line| line.as_str() == command)
            .count()
    }

    /// Whether any write starts with `prefix`.
    pub fn was_written(&self, prefix: &str) -> bool {
        self.inner
            .lock()
            .written
            .iter()
            .any(|line| line.starts_with(prefix))
    }

    /// Forget the write log.
    pub fn clear_written(&self) {
        self.inner.lock().written.clear();
    }

    /// How many transports were opened.
    pub fn opened(&self) -> usize {
        self.inner.lock().opened
    }

    /// How many transports were closed.
    pub fn closed(&self) -> usize {
        self.inner.lock().closed
    }
}

/// [`ScpiTransport`] answering from a [`ScriptHandle`].
pub struct ScriptedTransport {
    script: ScriptHandle,
    terminator: LineTerminator,
    timeout: Duration,
}

impl ScriptedTransport {
    /// Transport backed by `script`.
    pub fn new(script: ScriptHandle) -> Self {
        Self {
            script,
            terminator: LineTerminator::Lf,
            timeout: Duration::from_secs(1),
        }
    }

    /// Terminator most recently configured by the driver.
    pub fn terminator(&self) -> LineTerminator {
        self.terminator
    }
}

#[async_trait]
impl ScpiTransport for ScriptedTransport {
    async fn write_line(&mut self, line: &str) -> Result<(), DaqError> {
        let mut script = self.script.inner.lock();
        script.written.push(line.to_string());

        if script
            .failing_writes
            .iter()
            .any(|prefix| line.starts_with(prefix.as_str()))
        {
            return Err(DaqError::Io(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )));
        }

        let reply = match script.replies.get_mut(line) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        if let Some(reply) = reply {
            script
                .pending
                .extend(reply.split('\n').map(str::to_string));
        }
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, DaqError> {
        self.script
            .inner
            .lock()
            .pending
            .pop_front()
            .ok_or(DaqError::Timeout {
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

    async fn close(&mut self) -> Result<(), DaqError> {
        self.script.inner.lock().closed += 1;
        Ok(())
    }
}

/// [`Connector`] handing out [`ScriptedTransport`]s that share one script.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: ScriptHandle,
}

impl ScriptedConnector {
    /// Connector backed by `script`.
    pub fn new(script: ScriptHandle) -> Self {
        Self { script }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, address: &str) -> Result<BoxedTransport, DaqError> {
        {
            let mut script = self.script.inner.lock();
            if script.refuse_open {
                return Err(DaqError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no instrument at {}", address),
                )));
            }
            script.opened += 1;
            script.pending.clear();
        }
        Ok(Box::new(ScriptedTransport::new(self.script.clone())))
    }
}

/// Connector plus the handle controlling it.
pub fn scripted() -> (ScriptedConnector, ScriptHandle) {
    let script = ScriptHandle::default();
    (ScriptedConnector::new(script.clone()), script)
}
