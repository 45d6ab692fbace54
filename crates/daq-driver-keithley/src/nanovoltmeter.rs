//! The 2182A nanovoltmeter, reached through the 6220's serial relay.
//!
//! In delta and differential-conductance modes the 2182A hangs off the 6220's
//! RS-232 port; the host never talks to it directly. Commands are relayed with
//! `SYST:COMM:SER:SEND` and answers collected with `SYST:COMM:SER:ENT?`.

use crate::error::Result;
use crate::scpi::cmd;
use crate::session::DeviceSession;

/// Borrowed view of the nanovoltmeter behind a session.
pub struct Nanovoltmeter<'a> {
    session: &'a mut DeviceSession,
}

impl<'a> Nanovoltmeter<'a> {
    /// View the nanovoltmeter attached to `session`'s 6220.
    pub fn new(session: &'a mut DeviceSession) -> Self {
        Self { session }
    }

    /// Whether the 6220 detects a 2182A on its relay port.
    pub async fn is_present(&mut self) -> Result<bool> {
        self.session.query_flag(cmd::NV_PRESENT).await
    }

    /// Relay a command.
    pub async fn send(&mut self, command: &str) -> Result<()> {
        self.session.send_aux(command).await
    }

    /// Relay a query and return the answer.
    pub async fn query(&mut self, command: &str) -> Result<String> {
        self.session.query_aux(command).await
    }

    /// The 2182A's identification string.
    pub async fn identify(&mut self) -> Result<String> {
        self.query(cmd::IDN).await
    }
}
