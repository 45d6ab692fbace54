//! Programming a sweep plan into the instrument and checking it is still there.

use crate::error::{Field, KeithleyError, Result};
use crate::plan::{SweepParams, SweepPlan};
use crate::scpi::{self, cmd};
use crate::session::DeviceSession;
use tracing::{info, instrument, warn};

/// Outcome of a successful [`configure`].
#[derive(Debug)]
pub struct ConfigureReport {
    /// The plan now held by the instrument.
    pub plan: SweepPlan,
    /// Soft failures that did not stop configuration (buffer-size read-back).
    pub warnings: Vec<KeithleyError>,
}

/// Validate `params`, size the buffer, and write the five sweep parameters.
///
/// Validation and capacity errors are returned before any device traffic.
/// A failed parameter write stops immediately with
/// [`KeithleyError::PartialConfiguration`].
#[instrument(skip(session), err)]
pub async fn configure(
    session: &mut DeviceSession,
    params: &SweepParams,
) -> Result<ConfigureReport> {
    let plan = SweepPlan::new(*params)?;
    if !session.is_connected() {
        return Err(KeithleyError::NotConnected);
    }

    let mut warnings = Vec::new();
    if let Err(e) = program_buffer(session, plan.total_points()).await {
        warn!(error = %e, "Buffer size not confirmed");
        warnings.push(e);
    }

    let fields = plan.fields();
    let mut sent: Vec<Field> = Vec::with_capacity(fields.len());
    for (index, &(field, value)) in fields.iter().enumerate() {
        let command = format!("{} {}", field.header(), scpi::format_value(value));
        if let Err(e) = session.send(&command).await {
            let unconfirmed: Vec<Field> =
                fields[index..].iter().map(|&(f, _)| Field::from(f)).collect();
            warn!(?sent, ?unconfirmed, error = %e, "Sweep configuration interrupted");
            return Err(KeithleyError::PartialConfiguration {
                sent,
                unconfirmed,
                reason: e.to_string(),
            });
        }
        sent.push(field.into());
    }

    info!(
        points = plan.total_points(),
        estimated_s = plan.estimated_time(),
        "Sweep configured"
    );
    Ok(ConfigureReport { plan, warnings })
}

/// Write `TRAC:POIN` and confirm the instrument accepted it.
async fn program_buffer(session: &mut DeviceSession, points: u32) -> Result<()> {
    session
        .send(&format!("{} {}", cmd::TRACE_POINTS, points))
        .await?;
    let reply = session.query(cmd::TRACE_POINTS_QUERY).await?;

    // Integer or NR3 form (`+1.100000E+01`).
    let actual = reply.parse::<f64>().ok();
    if actual != Some(f64::from(points)) {
        return Err(KeithleyError::verification("buffer points", points, reply));
    }
    Ok(())
}

/// Re-read the five sweep parameters and compare them exactly with `plan`.
///
/// Returns `Ok(false)` on any mismatch or unparsable value; query failures
/// propagate.
pub async fn verify(session: &mut DeviceSession, plan: &SweepPlan) -> Result<bool> {
    let mut readings = Vec::with_capacity(5);
    for (field, expected) in plan.fields() {
        let reply = session.query(&format!("{}?", field.header())).await?;
        readings.push((field, expected, reply));
    }

    let mut matched = true;
    for (field, expected, reply) in readings {
        match reply.parse::<f64>() {
            Ok(actual) if actual == expected => {}
            _ => {
                warn!(
                    field = %Field::from(field),
                    expected,
                    actual = %reply,
                    "Sweep parameter mismatch"
                );
                matched = false;
            }
        }
    }

    if matched {
        info!("Sweep parameters verified");
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::mock::{scripted, ScriptHandle};
    use std::sync::Arc;

    async fn connected() -> (DeviceSession, ScriptHandle) {
        let (connector, script) = scripted();
        script.respond("*IDN?", "KEITHLEY INSTRUMENTS INC.,MODEL 6220");
        script.respond("TRAC:POIN?", "11");
        let mut session = DeviceSession::new(Arc::new(connector));
        session.connect("sim").await.unwrap();
        script.clear_written();
        (session, script)
    }

    fn reference() -> SweepParams {
        SweepParams::new(0.0, 0.01, 0.001)
    }

    fn script_readback(script: &ScriptHandle, params: &SweepParams) {
        script.respond("SOUR:DCON:STAR?", &format!("{:E}", params.start));
        script.respond("SOUR:DCON:STOP?", &format!("{:E}", params.stop));
        script.respond("SOUR:DCON:STEP?", &format!("{:E}", params.step));
        script.respond("SOUR:DCON:DELTA?", &format!("{:E}", params.delta));
        script.respond("SOUR:DCON:DELay?", &format!("{:E}", params.delay));
    }

    #[tokio::test]
    async fn test_configure_writes_in_order() {
        let (mut session, script) = connected().await;

        let report = configure(&mut session, &reference()).await.unwrap();

        assert_eq!(report.plan.total_points(), 11);
        assert!(report.warnings.is_empty());
        assert_eq!(
            script.written(),
            vec![
                "TRAC:POIN 11",
                "TRAC:POIN?",
                "SOUR:DCON:STAR 0",
                "SOUR:DCON:STOP 0.01",
                "SOUR:DCON:STEP 0.001",
                "SOUR:DCON:DELTA 0.00001",
                "SOUR:DCON:DELay 0.002",
            ]
        );
    }

    #[tokio::test]
    async fn test_buffer_mismatch_is_a_warning() {
        let (mut session, script) = connected().await;
        script.respond("TRAC:POIN?", "+1.000000E+01");

        let report = configure(&mut session, &reference()).await.unwrap();

        assert_eq!(report.warnings.len(), 1);
        assert!(matches!(report.warnings[0], KeithleyError::Verification { .. }));
        assert!(script.was_written("SOUR:DCON:DELay"));
    }

    #[tokio::test]
    async fn test_capacity_error_sends_nothing() {
        let (mut session, script) = connected().await;

        let err = configure(&mut session, &SweepParams::new(-0.1, 0.1, 1e-7))
            .await
            .unwrap_err();

        assert!(matches!(err, KeithleyError::Capacity { .. }));
        assert!(script.written().is_empty());
    }

    #[tokio::test]
    async fn test_validation_error_sends_nothing() {
        let (mut session, script) = connected().await;

        let err = configure(&mut session, &SweepParams::new(0.2, 0.3, 0.001))
            .await
            .unwrap_err();

        assert!(matches!(err, KeithleyError::Validation(_)));
        assert!(script.written().is_empty());
    }

    #[tokio::test]
    async fn test_partial_configuration_reports_fields() {
        let (mut session, script) = connected().await;
        script.fail_writes_starting_with("SOUR:DCON:STEP");

        let err = configure(&mut session, &reference()).await.unwrap_err();

        match err {
            KeithleyError::PartialConfiguration {
                sent, unconfirmed, ..
            } => {
                assert_eq!(sent, vec![Field::Start, Field::Stop]);
                assert_eq!(unconfirmed, vec![Field::Step, Field::Delta, Field::Delay]);
            }
            other => panic!("expected partial configuration, got {other:?}"),
        }
        assert!(!script.was_written("SOUR:DCON:DELTA"));
    }

    #[tokio::test]
    async fn test_verify_exact_match() {
        let (mut session, script) = connected().await;
        let plan = SweepPlan::new(reference()).unwrap();
        script_readback(&script, &reference());

        assert!(verify(&mut session, &plan).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_detects_mismatch() {
        let (mut session, script) = connected().await;
        let plan = SweepPlan::new(reference()).unwrap();
        script_readback(&script, &reference());
        script.respond("SOUR:DCON:STEP?", "+1.000001E-03");

        assert!(!verify(&mut session, &plan).await.unwrap());
        // All five were read even though the third mismatched.
        assert_eq!(script.count("SOUR:DCON:DELay?"), 1);
    }

    #[tokio::test]
    async fn test_verify_unparsable_is_false() {
        let (mut session, script) = connected().await;
        let plan = SweepPlan::new(reference()).unwrap();
        script_readback(&script, &reference());
        script.respond("SOUR:DCON:DELTA?", "DEF");

        assert!(!verify(&mut session, &plan).await.unwrap());
    }
}
