//! Sweep execution and buffer retrieval.

use crate::arming::ArmingSession;
use crate::error::{KeithleyError, Result};
use crate::scpi::cmd;
use crate::session::DeviceSession;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

/// `FORM:ELEM?` reply once every element is enabled.
pub const ALL_ELEMENTS: &str = "READ,UNIT,RNUM,TST,COMP,SOUR,AVOL";

#[allow(clippy::expect_used)]
static VOLTAGE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([-+]?\d+\.\d+[eE][-+]?\d+)VDC").expect("Invalid voltage regex"));

#[allow(clippy::expect_used)]
static CURRENT_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([-+]?\d+\.\d+[eE][-+]?\d+)ADC").expect("Invalid current regex"));

/// Readings retrieved from the sweep buffer.
///
/// `currents[i]` and `voltages[i]` always come from the same buffer record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeasurementBuffer {
    #[serde(skip)]
    raw: String,
    currents: Vec<f64>,
    voltages: Vec<f64>,
}

impl MeasurementBuffer {
    /// Parse a `TRAC:DATA?` payload.
    ///
    /// Records are separated by `#`. A record contributes a point only if it
    /// carries both a `...ADC` and a `...VDC` token; the first of each is used.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let mut currents = Vec::new();
        let mut voltages = Vec::new();

        for (index, chunk) in raw.split('#').enumerate() {
            let current = first_value(&CURRENT_TOKEN, chunk);
            let voltage = first_value(&VOLTAGE_TOKEN, chunk);
            match (current, voltage) {
                (Some(i), Some(v)) => {
                    currents.push(i);
                    voltages.push(v);
                }
                _ if chunk.trim_matches(|c: char| c == ',' || c.is_whitespace()).is_empty() => {}
                _ => debug!(index, chunk, "Skipping incomplete buffer record"),
            }
        }

        if currents.is_empty() {
            return Err(KeithleyError::EmptyData);
        }
        Ok(Self {
            raw,
            currents,
            voltages,
        })
    }

    /// The payload as received.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Source currents (A).
    pub fn currents(&self) -> &[f64] {
        &self.currents
    }

    /// Measured voltages (V).
    pub fn voltages(&self) -> &[f64] {
        &self.voltages
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.currents.len()
    }

    /// Whether no points were parsed.
    pub fn is_empty(&self) -> bool {
        self.currents.is_empty()
    }

    /// `(current, voltage)` pairs in buffer order.
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.currents.iter().copied().zip(self.voltages.iter().copied())
    }
}

fn first_value(pattern: &Regex, chunk: &str) -> Option<f64> {
    pattern
        .captures(chunk)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Start an armed sweep. Completion is not awaited.
#[instrument(skip_all, err)]
pub async fn start(session: &mut DeviceSession, arming: &ArmingSession) -> Result<()> {
    if !arming.is_armed() {
        return Err(KeithleyError::NotArmed);
    }
    session.send(cmd::INIT).await?;
    info!("Sweep started");
    Ok(())
}

/// Abort an armed or running sweep.
///
/// Returns `false` without contacting the instrument when there is nothing to
/// abort. An arming attempt still being polled is not aborted here; the poll
/// has to be stopped instead.
#[instrument(skip_all, err)]
pub async fn abort(
    session: &mut DeviceSession,
    arming: &mut ArmingSession,
    measuring: bool,
) -> Result<bool> {
    if !(arming.is_armed() || measuring) {
        debug!(state = ?arming.state(), "Nothing to abort");
        return Ok(false);
    }
    session.send(cmd::SWEEP_ABORT).await?;
    arming.disarm();
    info!("Sweep aborted");
    Ok(true)
}

/// Read and parse the whole sweep buffer.
#[instrument(skip_all, err)]
pub async fn retrieve(session: &mut DeviceSession) -> Result<MeasurementBuffer> {
    let timeout = session.data_timeout();
    let raw = match session.query_raw_with_timeout(cmd::TRACE_DATA, timeout).await {
        Ok(raw) => raw,
        Err(KeithleyError::EmptyResponse { .. }) => return Err(KeithleyError::EmptyData),
        Err(e) => return Err(e),
    };

    let buffer = MeasurementBuffer::parse(raw)?;
    info!(points = buffer.len(), "Buffer retrieved");
    Ok(buffer)
}

/// Enable every reading element and check the instrument agrees.
///
/// A mismatch is logged and reported as `false`.
pub async fn enable_all_data_output(session: &mut DeviceSession) -> Result<bool> {
    session.send(cmd::FORMAT_ALL).await?;
    let reply = session.query(cmd::FORMAT_QUERY).await?;
    if reply != ALL_ELEMENTS {
        warn!(expected = ALL_ELEMENTS, actual = %reply, "Not all data elements enabled");
        return Ok(false);
    }
    Ok(true)
}
