//! Front-end facing controller for one 6220.
//!
//! `Keithley6220Controller` owns the session, the stored sweep plan, the
//! arming state machine and the last retrieved buffer behind a single
//! `tokio::sync::Mutex`, so no two operations ever interleave on the
//! transport. Every outcome is returned to the caller and also published as a
//! [`SessionEvent`] on a broadcast channel.
//!
//! # Arming monitor
//!
//! After a successful `arm()` a task polls the arm status once per interval.
//! It takes the lock for one poll and releases it, so other requests are
//! served between ticks. `abort()` and `stop_arming_monitor()` take the same
//! lock before cancelling the task, which therefore can never be mid-query
//! when it is cancelled.
//!
//! ```rust,ignore
//! let controller = Keithley6220Controller::new(connector, ControllerConfig::default());
//! let mut events = controller.subscribe();
//! controller.connect("prologix:/dev/ttyUSB0:12").await?;
//! controller.configure(SweepParams::new(0.0, 0.01, 0.001)).await?;
//! controller.arm().await?;
//! while let Ok(event) = events.recv().await {
//!     if event == SessionEvent::Armed { break; }
//! }
//! controller.start_measurement().await?;
//! ```

use crate::arming::{self, ArmFailure, ArmState, ArmingConfig, ArmingSession, PollOutcome};
use crate::error::{KeithleyError, Result};
use crate::events::SessionEvent;
use crate::measurement::{self, MeasurementBuffer};
use crate::nanovoltmeter::Nanovoltmeter;
use crate::plan::{SweepParams, SweepPlan};
use crate::planner;
use crate::scpi::DeviceError;
use crate::session::{DeviceSession, LastKnownState, DEFAULT_DATA_TIMEOUT};
use crate::status::{InnerShield, OutputState};
use daq_core::Connector;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, MappedMutexGuard, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Controller settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Arming poll timing.
    pub arming: ArmingConfig,
    /// Timeout for buffer retrieval.
    pub data_timeout: Duration,
    /// Events buffered per subscriber before the oldest are dropped.
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            arming: ArmingConfig::default(),
            data_timeout: DEFAULT_DATA_TIMEOUT,
            event_capacity: 64,
        }
    }
}

struct Inner {
    session: DeviceSession,
    plan: Option<SweepPlan>,
    arming: ArmingSession,
    measuring: bool,
    buffer: Option<MeasurementBuffer>,
    monitor: Option<JoinHandle<()>>,
}

impl Inner {
    fn stop_monitor(&mut self) {
        if let Some(handle) = self.monitor.take() {
            handle.abort();
        }
    }

    fn reset(&mut self) {
        self.stop_monitor();
        self.plan = None;
        self.arming.disarm();
        self.measuring = false;
        self.buffer = None;
    }
}

/// Keithley 6220 differential-conductance controller.
///
/// Cloning is cheap; clones share the same instrument and event channel.
#[derive(Clone)]
pub struct Keithley6220Controller {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Keithley6220Controller {
    /// Controller that opens connections through `connector`.
    pub fn new(connector: Arc<dyn Connector>, config: ControllerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let session = DeviceSession::new(connector).with_data_timeout(config.data_timeout);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                session,
                plan: None,
                arming: ArmingSession::new(config.arming),
                measuring: false,
                buffer: None,
                monitor: None,
            })),
            events,
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        publish(&self.events, event);
    }

    fn report<T>(
        &self,
        operation: &str,
        result: Result<T>,
        event: impl FnOnce(&T) -> SessionEvent,
    ) -> Result<T> {
        match &result {
            Ok(value) => self.emit(event(value)),
            Err(e) => self.emit(SessionEvent::Error {
                operation: operation.to_string(),
                message: e.to_string(),
            }),
        }
        result
    }

    /// Direct access to the session for operations without a dedicated method.
    ///
    /// Holding the guard blocks the arming monitor.
    pub async fn session(&self) -> MappedMutexGuard<'_, DeviceSession> {
        MutexGuard::map(self.inner.lock().await, |inner| &mut inner.session)
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect, enable all reading elements and check for the nanovoltmeter.
    pub async fn connect(&self, address: &str) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let identity = match inner.session.connect(address).await {
            Ok(identity) => identity,
            Err(e) => {
                self.emit(SessionEvent::ConnectionFailed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        inner.reset();
        self.emit(SessionEvent::Connected {
            address: address.to_string(),
            identity: identity.clone(),
        });

        match measurement::enable_all_data_output(&mut inner.session).await {
            Ok(true) => {}
            Ok(false) => self.emit(SessionEvent::Warning {
                message: "not all data elements enabled".to_string(),
            }),
            Err(e) => self.emit(SessionEvent::Warning {
                message: format!("data element setup failed: {}", e),
            }),
        }
        match Nanovoltmeter::new(&mut inner.session).is_present().await {
            Ok(present) => self.emit(SessionEvent::NanovoltmeterPresence { present }),
            Err(e) => self.emit(SessionEvent::Warning {
                message: format!("nanovoltmeter check failed: {}", e),
            }),
        }

        Ok(identity)
    }

    /// Stop any monitor, forget the plan and buffer, and release the connection.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        inner.reset();
        inner.session.disconnect().await;
        self.emit(SessionEvent::Disconnected);
    }

    /// Whether a connection is open.
    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.session.is_connected()
    }

    /// Cached instrument state.
    pub async fn last_known(&self) -> LastKnownState {
        self.inner.lock().await.session.last_known()
    }

    // =========================================================================
    // Sweep configuration
    // =========================================================================

    /// Validate and program a sweep. Refused while arming.
    pub async fn configure(&self, params: SweepParams) -> Result<SweepPlan> {
        let mut inner = self.inner.lock().await;
        if let Err(e) = inner.arming.ensure_not_arming() {
            self.emit(SessionEvent::ConfigurationFailed {
                reason: e.to_string(),
            });
            return Err(e);
        }

        match planner::configure(&mut inner.session, &params).await {
            Ok(report) => {
                for warning in &report.warnings {
                    self.emit(SessionEvent::Warning {
                        message: warning.to_string(),
                    });
                }
                // New parameters disarm the instrument.
                inner.arming.disarm();
                inner.plan = Some(report.plan);
                self.emit(SessionEvent::ParametersSet {
                    total_points: report.plan.total_points(),
                    estimated_time_s: report.plan.estimated_time(),
                });
                Ok(report.plan)
            }
            Err(e) => {
                if matches!(e, KeithleyError::PartialConfiguration { .. }) {
                    inner.plan = None;
                }
                self.emit(SessionEvent::ConfigurationFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Compare the instrument's sweep parameters with the stored plan.
    pub async fn verify(&self) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let result = match inner.plan.as_ref() {
            Some(plan) => planner::verify(&mut inner.session, plan).await,
            None => Ok(false),
        };
        self.report("verify", result, |&matched| SessionEvent::ParametersVerified {
            matched,
        })
    }

    /// The stored sweep plan.
    pub async fn plan(&self) -> Option<SweepPlan> {
        self.inner.lock().await.plan
    }

    // =========================================================================
    // Arming
    // =========================================================================

    /// Check preconditions, send the arm command and start the arming monitor.
    ///
    /// Returns once the arm command is sent; the outcome arrives as
    /// [`SessionEvent::Armed`], [`SessionEvent::ArmingFailed`] or
    /// [`SessionEvent::ArmingTimedOut`].
    pub async fn arm(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        match arming::arm(&mut inner.session, inner.plan.as_ref(), &mut inner.arming).await {
            Ok(warnings) => {
                for warning in warnings {
                    self.emit(SessionEvent::Warning {
                        message: warning.to_string(),
                    });
                }
                self.emit(SessionEvent::ArmingInitiated);
                inner.stop_monitor();
                inner.monitor = Some(self.spawn_monitor(inner.arming.config().interval));
                Ok(())
            }
            Err(e @ KeithleyError::ArmingInProgress) => {
                self.emit(SessionEvent::ArmingRejected {
                    reason: e.to_string(),
                });
                Err(e)
            }
            Err(e) => {
                self.emit(SessionEvent::ArmingFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn spawn_monitor(&self, interval: Duration) -> JoinHandle<()> {
        let shared = Arc::clone(&self.inner);
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let mut guard = shared.lock().await;
                let inner = &mut *guard;

                let outcome = arming::poll_once(&mut inner.session, &mut inner.arming).await;
                let event = match &outcome {
                    PollOutcome::Idle => break,
                    PollOutcome::Pending { elapsed } => SessionEvent::ArmingProgress {
                        elapsed_s: elapsed.as_secs_f64(),
                    },
                    PollOutcome::Armed { .. } => SessionEvent::Armed,
                    PollOutcome::Failed(ArmFailure::Timeout { elapsed }) => {
                        SessionEvent::ArmingTimedOut {
                            elapsed_s: elapsed.as_secs_f64(),
                        }
                    }
                    PollOutcome::Failed(failure) => SessionEvent::ArmingFailed {
                        reason: failure.to_string(),
                    },
                };

                if outcome.is_terminal() {
                    if let PollOutcome::Failed(_) = outcome {
                        // Reported through the event; the session settles unarmed.
                        inner.arming.disarm();
                    }
                    // Detach our own handle.
                    inner.monitor = None;
                    publish(&events, event);
                    break;
                }
                publish(&events, event);
            }
            debug!("Arming monitor finished");
        })
    }

    /// Stop polling the arm status without contacting the instrument.
    pub async fn stop_arming_monitor(&self) {
        let mut inner = self.inner.lock().await;
        inner.stop_monitor();
        inner.arming.cancel();
        self.emit(SessionEvent::ArmingMonitorStopped);
    }

    /// Abort an armed or running sweep. Returns `false` if there was nothing to abort.
    pub async fn abort(&self) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        match measurement::abort(&mut inner.session, &mut inner.arming, inner.measuring).await {
            Ok(true) => {
                inner.stop_monitor();
                inner.measuring = false;
                self.emit(SessionEvent::Aborted);
                Ok(true)
            }
            Ok(false) => {
                self.emit(SessionEvent::AbortNotNeeded {
                    state: inner.arming.state(),
                });
                Ok(false)
            }
            Err(e) => {
                self.emit(SessionEvent::Error {
                    operation: "abort".to_string(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Current arming state.
    pub async fn arm_state(&self) -> ArmState {
        self.inner.lock().await.arming.state()
    }

    /// Why the last arming attempt failed.
    pub async fn last_arm_failure(&self) -> Option<ArmFailure> {
        self.inner.lock().await.arming.last_failure().cloned()
    }

    // =========================================================================
    // Measurement
    // =========================================================================

    /// Trigger the armed sweep.
    pub async fn start_measurement(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        match measurement::start(&mut inner.session, &inner.arming).await {
            Ok(()) => {
                inner.measuring = true;
                self.emit(SessionEvent::MeasurementStarted);
                Ok(())
            }
            Err(e) => {
                self.emit(SessionEvent::MeasurementFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Whether a sweep was started and not aborted.
    pub async fn is_measuring(&self) -> bool {
        self.inner.lock().await.measuring
    }

    /// Read the sweep buffer and keep it as the last buffer.
    pub async fn retrieve_data(&self) -> Result<MeasurementBuffer> {
        let mut inner = self.inner.lock().await;
        match measurement::retrieve(&mut inner.session).await {
            Ok(buffer) => {
                inner.buffer = Some(buffer.clone());
                self.emit(SessionEvent::DataReady {
                    points: buffer.len(),
                });
                Ok(buffer)
            }
            Err(e) => {
                self.emit(SessionEvent::RetrievalFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// The last successfully retrieved buffer.
    pub async fn last_buffer(&self) -> Option<MeasurementBuffer> {
        self.inner.lock().await.buffer.clone()
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Read the output relay state.
    pub async fn query_output_state(&self) -> Result<OutputState> {
        let result = self.inner.lock().await.session.query_output_state().await;
        self.report("query_output_state", result, |&state| {
            SessionEvent::OutputState { state }
        })
    }

    /// Read the inner shield connection.
    pub async fn query_inner_shield(&self) -> Result<InnerShield> {
        let result = self.inner.lock().await.session.query_inner_shield().await;
        self.report("query_inner_shield", result, |&shield| {
            SessionEvent::InnerShield { shield }
        })
    }

    /// Connect the inner shield to guard.
    pub async fn set_inner_shield_guard(&self) -> Result<()> {
        let result = {
            let mut inner = self.inner.lock().await;
            match inner.session.set_inner_shield_guard().await {
                Ok(()) => inner.session.query_inner_shield().await,
                Err(e) => Err(e),
            }
        };
        self.report("set_inner_shield_guard", result, |&shield| {
            SessionEvent::InnerShield { shield }
        })
        .map(|_| ())
    }

    /// Whether the output interlock is closed.
    pub async fn query_interlock(&self) -> Result<bool> {
        let result = self.inner.lock().await.session.query_interlock().await;
        self.report("query_interlock", result, |&closed| {
            SessionEvent::Interlock { closed }
        })
    }

    /// One arm-status query, independent of the arming monitor.
    pub async fn query_arm_status(&self) -> Result<bool> {
        let result = self.inner.lock().await.session.query_arm_status().await;
        self.report("query_arm_status", result, |&armed| SessionEvent::ArmStatus {
            armed,
        })
    }

    /// Whether the nanovoltmeter is attached.
    pub async fn query_nanovoltmeter(&self) -> Result<bool> {
        let result = {
            let mut inner = self.inner.lock().await;
            Nanovoltmeter::new(&mut inner.session).is_present().await
        };
        self.report("query_nanovoltmeter", result, |&present| {
            SessionEvent::NanovoltmeterPresence { present }
        })
    }

    /// Pop one entry from the instrument error queue.
    pub async fn check_error(&self) -> Result<Option<DeviceError>> {
        let result = self.inner.lock().await.session.check_error().await;
        self.report("check_error", result, |entry| match entry {
            Some(DeviceError { code, message }) => SessionEvent::DeviceError {
                code: *code,
                message: message.clone(),
            },
            None => SessionEvent::ErrorQueueEmpty,
        })
    }
}

fn publish(events: &broadcast::Sender<SessionEvent>, event: SessionEvent) {
    trace!(?event, "publish");
    if events.send(event).is_err() {
        trace!("No event subscribers");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::mock::{scripted, ScriptHandle};

    const INTERVAL: Duration = Duration::from_secs(1);

    fn ready_script() -> (Keithley6220Controller, ScriptHandle) {
        let (connector, script) = scripted();
        script.respond("*IDN?", "KEITHLEY INSTRUMENTS INC.,MODEL 6220");
        script.respond("FORM:ELEM?", "READ,UNIT,RNUM,TST,COMP,SOUR,AVOL");
        script.respond("TRAC:POIN?", "11");
        script.respond("SOUR:DCON:STAR?", "0");
        script.respond("SOUR:DCON:STOP?", "1E-2");
        script.respond("SOUR:DCON:STEP?", "1E-3");
        script.respond("SOUR:DCON:DELTA?", "1E-5");
        script.respond("SOUR:DCON:DELay?", "2E-3");
        script.respond("SOUR:DELTA:NVPResent?", "1");
        script.respond("OUTP:INT:TRIPped?", "1");
        script.respond("SOUR:DCON:CAB?", "1");
        let config = ControllerConfig {
            arming: ArmingConfig {
                timeout: Duration::from_secs(5),
                interval: INTERVAL,
            },
            ..ControllerConfig::default()
        };
        (Keithley6220Controller::new(Arc::new(connector), config), script)
    }

    async fn configured() -> (Keithley6220Controller, ScriptHandle) {
        let (controller, script) = ready_script();
        controller.connect("sim").await.unwrap();
        controller
            .configure(SweepParams::new(0.0, 0.01, 0.001))
            .await
            .unwrap();
        (controller, script)
    }

    async fn next_terminal(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        loop {
            let event = events.recv().await.unwrap();
            if !matches!(event, SessionEvent::ArmingProgress { .. }) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_publishes_identity_and_presence() {
        let (controller, _script) = ready_script();
        let mut events = controller.subscribe();

        controller.connect("sim").await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Connected { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::NanovoltmeterPresence { present: true }
        );
    }

    #[tokio::test]
    async fn test_configure_publishes_plan() {
        let (controller, _script) = ready_script();
        controller.connect("sim").await.unwrap();
        let mut events = controller.subscribe();

        let plan = controller
            .configure(SweepParams::new(0.0, 0.01, 0.001))
            .await
            .unwrap();

        assert_eq!(plan.total_points(), 11);
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::ParametersSet { total_points: 11, .. }
        ));
        assert_eq!(controller.plan().await, Some(plan));
        assert!(controller.verify().await.unwrap());
    }

    #[tokio::test]
    async fn test_partial_configuration_clears_plan() {
        let (controller, script) = configured().await;
        script.fail_writes_starting_with("SOUR:DCON:STOP");

        let err = controller
            .configure(SweepParams::new(0.0, 0.02, 0.001))
            .await
            .unwrap_err();

        assert!(matches!(err, KeithleyError::PartialConfiguration { .. }));
        assert_eq!(controller.plan().await, None);
        assert!(!controller.verify().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_reaches_armed_after_two_intervals() {
        let (controller, script) = configured().await;
        script.respond_sequence("SOUR:DCON:ARM?", ["0", "0", "1"]);
        let mut events = controller.subscribe();
        let started = Instant::now();

        controller.arm().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), SessionEvent::ArmingInitiated);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::ArmingProgress { elapsed_s: 1.0 }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::ArmingProgress { elapsed_s: 2.0 }
        );
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Armed);
        assert_eq!(started.elapsed(), INTERVAL * 3);
        assert_eq!(controller.arm_state().await, ArmState::Armed);
        assert_eq!(script.count("SOUR:DCON:ARM?"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_times_out_and_stops_polling() {
        let (controller, script) = configured().await;
        script.respond("SOUR:DCON:ARM?", "0");
        let mut events = controller.subscribe();

        controller.arm().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::ArmingInitiated);

        assert_eq!(
            next_terminal(&mut events).await,
            SessionEvent::ArmingTimedOut { elapsed_s: 5.0 }
        );
        assert_eq!(controller.arm_state().await, ArmState::Unarmed);
        assert!(matches!(
            controller.last_arm_failure().await,
            Some(ArmFailure::Timeout { .. })
        ));

        let polls = script.count("SOUR:DCON:ARM?");
        tokio::time::sleep(INTERVAL * 10).await;
        assert_eq!(script.count("SOUR:DCON:ARM?"), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_status_fails_arming() {
        let (controller, script) = configured().await;
        script.respond("SOUR:DCON:ARM?", "-1");
        let mut events = controller.subscribe();

        controller.arm().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), SessionEvent::ArmingInitiated);
        assert!(matches!(
            next_terminal(&mut events).await,
            SessionEvent::ArmingFailed { .. }
        ));
        assert_eq!(script.count("SOUR:DCON:ARM?"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_arm_rejected_without_traffic() {
        let (controller, script) = configured().await;
        script.respond("SOUR:DCON:ARM?", "0");
        controller.arm().await.unwrap();
        script.clear_written();

        let err = controller.arm().await.unwrap_err();

        assert!(matches!(err, KeithleyError::ArmingInProgress));
        assert!(script.written().is_empty());
        controller.stop_arming_monitor().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_arming_monitor_cancels_polling() {
        let (controller, script) = configured().await;
        script.respond("SOUR:DCON:ARM?", "0");
        controller.arm().await.unwrap();
        tokio::time::sleep(INTERVAL * 2 + INTERVAL / 2).await;
        let polls = script.count("SOUR:DCON:ARM?");
        assert_eq!(polls, 2);

        controller.stop_arming_monitor().await;
        tokio::time::sleep(INTERVAL * 5).await;

        assert_eq!(script.count("SOUR:DCON:ARM?"), polls);
        assert_eq!(controller.arm_state().await, ArmState::Unarmed);
        assert!(!script.was_written("SOUR:SWE:ABOR"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_monitor_after_armed_keeps_instrument_armed() {
        let (controller, script) = configured().await;
        script.respond("SOUR:DCON:ARM?", "1");
        let mut events = controller.subscribe();
        controller.arm().await.unwrap();
        while events.recv().await.unwrap() != SessionEvent::Armed {}

        controller.stop_arming_monitor().await;

        assert_eq!(controller.arm_state().await, ArmState::Armed);
        assert!(controller.abort().await.unwrap());
        assert_eq!(script.count("SOUR:SWE:ABOR"), 1);
        assert_eq!(controller.arm_state().await, ArmState::Unarmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_while_arming_not_needed() {
        let (controller, script) = configured().await;
        script.respond("SOUR:DCON:ARM?", "0");
        controller.arm().await.unwrap();

        assert!(!controller.abort().await.unwrap());
        assert!(!script.was_written("SOUR:SWE:ABOR"));
        assert_eq!(controller.arm_state().await, ArmState::Arming);
        controller.stop_arming_monitor().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sweep_cycle() {
        let (controller, script) = configured().await;
        script.respond("SOUR:DCON:ARM?", "1");
        script.respond(
            "TRAC:DATA?",
            "1.0000E-03ADC,2.0000E-03VDC#3.0000E-03ADC,4.0000E-03VDC",
        );
        let mut events = controller.subscribe();

        assert!(matches!(
            controller.start_measurement().await,
            Err(KeithleyError::NotArmed)
        ));

        controller.arm().await.unwrap();
        while events.recv().await.unwrap() != SessionEvent::Armed {}

        controller.start_measurement().await.unwrap();
        assert!(controller.is_measuring().await);
        let buffer = controller.retrieve_data().await.unwrap();
        assert_eq!(buffer.currents(), &[1e-3, 3e-3]);
        assert_eq!(controller.last_buffer().await, Some(buffer));

        assert!(controller.abort().await.unwrap());
        assert_eq!(script.count("SOUR:SWE:ABOR"), 1);
        assert!(!controller.is_measuring().await);
        assert!(!controller.abort().await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_clears_everything() {
        let (controller, script) = configured().await;
        script.respond("TRAC:DATA?", "1.0E-03ADC,2.0E-03VDC");
        controller.retrieve_data().await.unwrap();

        controller.disconnect().await;

        assert!(!controller.is_connected().await);
        assert_eq!(controller.plan().await, None);
        assert_eq!(controller.last_buffer().await, None);
        assert!(matches!(
            controller.query_output_state().await,
            Err(KeithleyError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_status_queries_publish_events() {
        let (controller, script) = configured().await;
        script.respond("OUTP:STATe?", "0");
        script.respond("SYST:ERR?", "-113,\"Undefined header\"");
        let mut events = controller.subscribe();

        assert_eq!(controller.query_output_state().await.unwrap(), OutputState::Off);
        assert!(controller.query_interlock().await.unwrap());
        let entry = controller.check_error().await.unwrap().unwrap();
        assert_eq!(entry.code, -113);

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::OutputState {
                state: OutputState::Off
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Interlock { closed: true }
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::DeviceError { code: -113, .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_query_publishes_error_event() {
        let (controller, script) = configured().await;
        script.respond("OUTP:ISHield?", "BOGUS");
        let mut events = controller.subscribe();

        assert!(controller.query_inner_shield().await.is_err());

        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Error { ref operation, .. } if operation == "query_inner_shield"
        ));
    }
}
