//! Compliance voltage and compliance abort.

use crate::error::{Field, KeithleyError, Result};
use crate::plan::check_range;
use crate::scpi::{self, cmd};
use crate::session::DeviceSession;
use tracing::{info, instrument};

/// Compliance voltage bounds (V).
pub const COMPLIANCE_RANGE: (f64, f64) = (0.1, 105.0);

impl DeviceSession {
    /// Set the compliance voltage and confirm by exact read-back.
    ///
    /// Out-of-range values are rejected without contacting the instrument.
    #[instrument(skip(self), err)]
    pub async fn set_compliance_voltage(&mut self, volts: f64) -> Result<()> {
        check_range(
            Field::ComplianceVoltage,
            volts,
            COMPLIANCE_RANGE.0,
            COMPLIANCE_RANGE.1,
        )?;
        self.send(&format!("{} {}", cmd::COMPLIANCE, scpi::format_value(volts)))
            .await?;

        let actual = self.query_compliance_voltage().await?;
        if actual != volts {
            return Err(KeithleyError::verification("compliance voltage", volts, actual));
        }
        info!(volts, "Compliance voltage set");
        Ok(())
    }

    /// Read the compliance voltage.
    pub async fn query_compliance_voltage(&mut self) -> Result<f64> {
        self.query_f64(cmd::COMPLIANCE_QUERY).await
    }

    /// Enable or disable aborting the sweep on compliance, and confirm.
    pub async fn set_compliance_abort(&mut self, enabled: bool) -> Result<()> {
        let value = if enabled { "ON" } else { "OFF" };
        self.send(&format!("{} {}", cmd::DCON_CAB, value)).await?;

        let actual = self.query_compliance_abort().await?;
        if actual != enabled {
            return Err(KeithleyError::verification("compliance abort", enabled, actual));
        }
        Ok(())
    }

    /// Whether compliance abort is enabled.
    pub async fn query_compliance_abort(&mut self) -> Result<bool> {
        self.query_bool(cmd::DCON_CAB_QUERY).await
    }
}
