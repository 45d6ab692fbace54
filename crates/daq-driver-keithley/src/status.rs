//! Output, shield, earth, interlock and unit settings.
//!
//! Setters write the new value and read it back; a read-back that disagrees
//! is returned as [`KeithleyError::Verification`]. The session's
//! [`LastKnownState`](crate::session::LastKnownState) is updated from every
//! successful read.

use crate::error::{KeithleyError, Result};
use crate::scpi::cmd;
use crate::session::DeviceSession;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, instrument};

/// Output relay state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputState {
    /// Output connected.
    On,
    /// Output disconnected.
    Off,
}

/// Where the triax inner shield is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InnerShield {
    /// Driven guard.
    Guard,
    /// Output low.
    OutputLow,
}

/// Output-low connection to chassis earth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLow {
    /// Output low isolated from earth.
    Floating,
    /// Output low tied to earth.
    Grounded,
}

/// Reading unit reported by the 6220 for delta-mode measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementUnit {
    /// Volts
    #[serde(rename = "V")]
    Volts,
    /// Siemens
    #[serde(rename = "S")]
    Siemens,
    /// Ohms
    #[serde(rename = "O")]
    Ohms,
    /// Watts
    #[serde(rename = "W")]
    Watts,
}

impl MeasurementUnit {
    /// SCPI parameter value.
    pub fn code(&self) -> &'static str {
        match self {
            MeasurementUnit::Volts => "V",
            MeasurementUnit::Siemens => "S",
            MeasurementUnit::Ohms => "O",
            MeasurementUnit::Watts => "W",
        }
    }
}

impl fmt::Display for MeasurementUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for MeasurementUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "V" | "VOLT" => Ok(MeasurementUnit::Volts),
            "S" | "SIEM" => Ok(MeasurementUnit::Siemens),
            "O" | "OHMS" => Ok(MeasurementUnit::Ohms),
            "W" | "WATT" => Ok(MeasurementUnit::Watts),
            other => Err(format!("unknown unit '{}', expected V, S, O or W", other)),
        }
    }
}

impl DeviceSession {
    /// Read the output relay state.
    pub async fn query_output_state(&mut self) -> Result<OutputState> {
        let on = self.query_bool(cmd::OUTPUT_STATE).await?;
        let state = if on { OutputState::On } else { OutputState::Off };
        self.last_known_mut().output = Some(state);
        Ok(state)
    }

    /// Turn the output on and confirm.
    #[instrument(skip(self), err)]
    pub async fn output_on(&mut self) -> Result<()> {
        self.set_output(OutputState::On).await
    }

    /// Turn the output off and confirm.
    #[instrument(skip(self), err)]
    pub async fn output_off(&mut self) -> Result<()> {
        self.set_output(OutputState::Off).await
    }

    async fn set_output(&mut self, target: OutputState) -> Result<()> {
        let command = match target {
            OutputState::On => cmd::OUTPUT_ON,
            OutputState::Off => cmd::OUTPUT_OFF,
        };
        self.send(command).await?;

        let actual = self.query_output_state().await?;
        if actual != target {
            return Err(KeithleyError::verification(
                "output state",
                format!("{target:?}"),
                format!("{actual:?}"),
            ));
        }
        info!(state = ?actual, "Output switched");
        Ok(())
    }

    async fn ensure_output_off(&mut self) -> Result<()> {
        match self.query_output_state().await? {
            OutputState::Off => Ok(()),
            OutputState::On => Err(KeithleyError::OutputOn),
        }
    }

    /// Read the inner shield connection.
    pub async fn query_inner_shield(&mut self) -> Result<InnerShield> {
        let reply = self.query(cmd::INNER_SHIELD).await?;
        let shield = match reply.to_ascii_uppercase().as_str() {
            "GUARD" | "GUAR" => InnerShield::Guard,
            "OLOW" | "OLO" => InnerShield::OutputLow,
            _ => return Err(KeithleyError::unexpected(cmd::INNER_SHIELD, &reply)),
        };
        self.last_known_mut().inner_shield = Some(shield);
        Ok(shield)
    }

    /// Connect the inner shield to guard. Refused while the output is on.
    #[instrument(skip(self), err)]
    pub async fn set_inner_shield_guard(&mut self) -> Result<()> {
        self.ensure_output_off().await?;
        self.send(cmd::INNER_SHIELD_GUARD).await?;

        let actual = self.query_inner_shield().await?;
        if actual != InnerShield::Guard {
            return Err(KeithleyError::verification("inner shield", "GUARD", format!("{actual:?}")));
        }
        info!("Inner shield set to guard");
        Ok(())
    }

    /// Read the output-low earth connection.
    pub async fn query_output_low(&mut self) -> Result<OutputLow> {
        let grounded = self.query_bool(cmd::OUTPUT_LOW).await?;
        let mode = if grounded {
            OutputLow::Grounded
        } else {
            OutputLow::Floating
        };
        self.last_known_mut().output_low = Some(mode);
        Ok(mode)
    }

    /// Float or ground output low. Refused while the output is on.
    #[instrument(skip(self), err)]
    pub async fn set_output_low(&mut self, mode: OutputLow) -> Result<()> {
        self.ensure_output_off().await?;
        let value = match mode {
            OutputLow::Floating => "OFF",
            OutputLow::Grounded => "ON",
        };
        self.send(&format!("{} {}", cmd::OUTPUT_LOW_SET, value)).await?;

        let actual = self.query_output_low().await?;
        if actual != mode {
            return Err(KeithleyError::verification(
                "output low",
                format!("{mode:?}"),
                format!("{actual:?}"),
            ));
        }
        info!(mode = ?mode, "Output low set");
        Ok(())
    }

    /// Whether the output interlock is closed.
    pub async fn query_interlock(&mut self) -> Result<bool> {
        self.query_flag(cmd::INTERLOCK).await
    }

    /// Read the reading unit.
    pub async fn query_unit(&mut self) -> Result<MeasurementUnit> {
        let reply = self.query(cmd::UNIT_QUERY).await?;
        reply
            .parse()
            .map_err(|_| KeithleyError::unexpected(cmd::UNIT_QUERY, &reply))
    }

    /// Change the reading unit and confirm.
    pub async fn set_unit(&mut self, unit: MeasurementUnit) -> Result<()> {
        self.send(&format!("{} {}", cmd::UNIT, unit.code())).await?;
        let actual = self.query_unit().await?;
        if actual != unit {
            return Err(KeithleyError::verification("unit", unit, actual));
        }
        Ok(())
    }

    /// Read the terminator used on the serial relay to the nanovoltmeter.
    pub async fn query_relay_terminator(&mut self) -> Result<String> {
        self.query(cmd::RELAY_TERM_QUERY).await
    }

    /// Use LF on the serial relay and confirm.
    pub async fn set_relay_terminator_lf(&mut self) -> Result<()> {
        self.send(&format!("{} LF", cmd::RELAY_TERM)).await?;
        let actual = self.query_relay_terminator().await?;
        if !actual.eq_ignore_ascii_case("LF") {
            return Err(KeithleyError::verification("relay terminator", "LF", actual));
        }
        Ok(())
    }
}
