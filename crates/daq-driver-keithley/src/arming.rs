//! Differential-conductance arming.
//!
//! Arming is a two-part affair. [`arm`] checks the preconditions and sends the
//! arm command; after that the instrument needs a few seconds before it
//! reports itself armed. [`ArmingSession`] tracks that wait as a pure state
//! machine fed one poll reply at a time by [`poll_once`], so the timer that
//! drives it (see the controller) stays out of this module.
//!
//! ```text
//! Unarmed ──arm()──▶ Arming ──"1"──▶ Armed
//!                      │
//!                      ├─"0" past timeout─▶ Failed(Timeout)
//!                      └─other / error────▶ Failed(UnexpectedStatus | QueryFailed)
//! ```
//!
//! `Failed` is left by the next `arm()`, by `cancel()` or by `disarm()`.

use crate::error::{KeithleyError, Precondition, Result};
use crate::nanovoltmeter::Nanovoltmeter;
use crate::plan::SweepPlan;
use crate::planner;
use crate::scpi::cmd;
use crate::session::DeviceSession;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Default ceiling on the arm-status poll.
pub const DEFAULT_ARMING_TIMEOUT: Duration = Duration::from_secs(20);
/// Default arm-status poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll timing for arming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmingConfig {
    /// Give up once this much poll time has accumulated.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Time between arm-status queries.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for ArmingConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_ARMING_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Arming state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmState {
    /// Not armed, nothing pending.
    Unarmed,
    /// Arm command sent; waiting for the instrument.
    Arming,
    /// The instrument reports the sweep armed.
    Armed,
    /// The last arming attempt failed; see [`ArmingSession::last_failure`].
    Failed,
}

/// Why an arming attempt ended without reaching `Armed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ArmFailure {
    /// The instrument kept answering "0" until the ceiling.
    Timeout {
        /// Poll time accumulated.
        #[serde(with = "humantime_serde")]
        elapsed: Duration,
    },
    /// The status query returned something other than "0" or "1".
    UnexpectedStatus {
        /// The reply.
        response: String,
    },
    /// The status query itself failed.
    QueryFailed {
        /// The error text.
        reason: String,
    },
}

impl std::fmt::Display for ArmFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArmFailure::Timeout { elapsed } => write!(f, "timed out after {:?}", elapsed),
            ArmFailure::UnexpectedStatus { response } => {
                write!(f, "unexpected arm status '{}'", response)
            }
            ArmFailure::QueryFailed { reason } => write!(f, "arm status query failed: {}", reason),
        }
    }
}

/// Result of feeding one poll reply to an [`ArmingSession`].
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Not arming; nothing to do.
    Idle,
    /// Still waiting.
    Pending {
        /// Poll time accumulated so far.
        elapsed: Duration,
    },
    /// The instrument reported armed.
    Armed {
        /// Poll time accumulated when it did.
        elapsed: Duration,
    },
    /// Arming failed; polling must stop.
    Failed(ArmFailure),
}

impl PollOutcome {
    /// Whether polling should stop after this outcome.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollOutcome::Pending { .. })
    }
}

/// Arming state machine. Holds no I/O.
#[derive(Debug, Clone)]
pub struct ArmingSession {
    config: ArmingConfig,
    state: ArmState,
    elapsed: Duration,
    last_failure: Option<ArmFailure>,
}

impl ArmingSession {
    /// Unarmed session with the given timing.
    pub fn new(config: ArmingConfig) -> Self {
        Self {
            config,
            state: ArmState::Unarmed,
            elapsed: Duration::ZERO,
            last_failure: None,
        }
    }

    /// Poll timing in effect.
    pub fn config(&self) -> &ArmingConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> ArmState {
        self.state
    }

    /// Poll time accumulated in the current or last attempt.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Why the last attempt failed, if it did.
    pub fn last_failure(&self) -> Option<&ArmFailure> {
        self.last_failure.as_ref()
    }

    /// Whether the instrument reported the sweep armed.
    pub fn is_armed(&self) -> bool {
        self.state == ArmState::Armed
    }

    /// Reject a new attempt while one is being polled.
    pub fn ensure_not_arming(&self) -> Result<()> {
        if self.state == ArmState::Arming {
            return Err(KeithleyError::ArmingInProgress);
        }
        Ok(())
    }

    /// Enter `Arming` after the arm command went out.
    pub fn begin(&mut self) -> Result<()> {
        self.ensure_not_arming()?;
        self.state = ArmState::Arming;
        self.elapsed = Duration::ZERO;
        self.last_failure = None;
        Ok(())
    }

    /// Feed one arm-status reply.
    pub fn observe(&mut self, reply: Result<String>) -> PollOutcome {
        if self.state != ArmState::Arming {
            return PollOutcome::Idle;
        }

        match reply {
            Ok(status) if status == "1" => {
                self.state = ArmState::Armed;
                PollOutcome::Armed {
                    elapsed: self.elapsed,
                }
            }
            Ok(status) if status == "0" => {
                self.elapsed += self.config.interval;
                if self.elapsed >= self.config.timeout {
                    self.fail(ArmFailure::Timeout {
                        elapsed: self.elapsed,
                    })
                } else {
                    PollOutcome::Pending {
                        elapsed: self.elapsed,
                    }
                }
            }
            Ok(response) => self.fail(ArmFailure::UnexpectedStatus { response }),
            Err(e) => self.fail(ArmFailure::QueryFailed {
                reason: e.to_string(),
            }),
        }
    }

    fn fail(&mut self, failure: ArmFailure) -> PollOutcome {
        self.state = ArmState::Failed;
        self.last_failure = Some(failure.clone());
        PollOutcome::Failed(failure)
    }

    /// Stop waiting without touching the instrument.
    ///
    /// Only `Arming` and `Failed` fall back to `Unarmed`; an armed instrument
    /// stays armed and can still be started or aborted.
    pub fn cancel(&mut self) {
        match self.state {
            ArmState::Arming => {
                debug!(elapsed = ?self.elapsed, "Arming monitor cancelled");
                self.state = ArmState::Unarmed;
            }
            ArmState::Failed => self.state = ArmState::Unarmed,
            ArmState::Unarmed | ArmState::Armed => {}
        }
    }

    /// The instrument is no longer armed (abort, reconfiguration, disconnect).
    pub fn disarm(&mut self) {
        self.state = ArmState::Unarmed;
        self.elapsed = Duration::ZERO;
    }
}

impl Default for ArmingSession {
    fn default() -> Self {
        Self::new(ArmingConfig::default())
    }
}

/// Check the arming preconditions in order, stopping at the first failure.
///
/// 1. the instrument holds `plan` exactly
/// 2. a nanovoltmeter is attached
/// 3. the interlock is closed
pub async fn check_preconditions(
    session: &mut DeviceSession,
    plan: Option<&SweepPlan>,
) -> Result<()> {
    let Some(plan) = plan else {
        return Err(KeithleyError::Precondition(Precondition::ParametersNotVerified));
    };
    if !planner::verify(session, plan).await? {
        return Err(KeithleyError::Precondition(Precondition::ParametersNotVerified));
    }
    if !Nanovoltmeter::new(session).is_present().await? {
        return Err(KeithleyError::Precondition(Precondition::NanovoltmeterMissing));
    }
    if !session.query_interlock().await? {
        return Err(KeithleyError::Precondition(Precondition::InterlockOpen));
    }
    Ok(())
}

/// Check preconditions, enable compliance abort, send the arm command and
/// enter `Arming`.
///
/// Returns any soft warnings (compliance-abort read-back). A second call
/// while `Arming` fails with [`KeithleyError::ArmingInProgress`] before any
/// device traffic.
#[instrument(skip_all, err)]
pub async fn arm(
    session: &mut DeviceSession,
    plan: Option<&SweepPlan>,
    arming: &mut ArmingSession,
) -> Result<Vec<KeithleyError>> {
    arming.ensure_not_arming()?;
    if arming.state() == ArmState::Failed {
        arming.disarm();
    }

    check_preconditions(session, plan).await?;

    let mut warnings = Vec::new();
    if let Err(e) = session.set_compliance_abort(true).await {
        warn!(error = %e, "Compliance abort not confirmed");
        warnings.push(e);
    }

    session.send(cmd::DCON_ARM).await?;
    arming.begin()?;
    info!("Arm command sent");
    Ok(warnings)
}

/// Query the arm status once and feed it to `arming`.
pub async fn poll_once(session: &mut DeviceSession, arming: &mut ArmingSession) -> PollOutcome {
    let reply = session.query(cmd::DCON_ARM_STATUS).await;
    let outcome = arming.observe(reply);
    match &outcome {
        PollOutcome::Pending { elapsed } => debug!(?elapsed, "Not armed yet"),
        PollOutcome::Armed { elapsed } => info!(?elapsed, "Sweep armed"),
        PollOutcome::Failed(failure) => warn!(%failure, "Arming failed"),
        PollOutcome::Idle => {}
    }
    outcome
}

impl DeviceSession {
    /// One arm-status query.
    pub async fn query_arm_status(&mut self) -> Result<bool> {
        let reply = self.query(cmd::DCON_ARM_STATUS).await?;
        match reply.as_str() {
            "1" => Ok(true),
            "0" => Ok(false),
            _ => Err(KeithleyError::unexpected(cmd::DCON_ARM_STATUS, &reply)),
        }
    }
}
