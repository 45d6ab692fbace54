//! End-to-end sweep lifecycle against the simulated 6220.

use daq_driver_keithley::{
    ArmState, ArmingConfig, ControllerConfig, DeviceSession, Field, Keithley6220Controller,
    KeithleyError, Nanovoltmeter, OutputState, Precondition, SessionEvent, SweepParams,
};
use daq_driver_mock::{Simulated6220, SimulatedConnector, SimulatorConfig, IDENTITY_2182A};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const INTERVAL: Duration = Duration::from_secs(1);

fn simulator(config: SimulatorConfig) -> (Keithley6220Controller, Simulated6220) {
    let instrument = Simulated6220::new(SimulatorConfig {
        seed: Some(11),
        ..config
    });
    let connector = SimulatedConnector::new(instrument.clone());
    let controller = Keithley6220Controller::new(
        Arc::new(connector),
        ControllerConfig {
            arming: ArmingConfig {
                timeout: Duration::from_secs(5),
                interval: INTERVAL,
            },
            ..ControllerConfig::default()
        },
    );
    (controller, instrument)
}

async fn wait_for_arming_outcome(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    loop {
        match events.recv().await.unwrap() {
            SessionEvent::ArmingInitiated | SessionEvent::ArmingProgress { .. } => {}
            SessionEvent::Warning { .. } => {}
            other => return other,
        }
    }
}

fn params() -> SweepParams {
    SweepParams::new(0.0, 0.01, 0.001)
        .with_delay(0.002)
        .with_delta(1e-5)
}

#[tokio::test(start_paused = true)]
async fn test_full_sweep_lifecycle() {
    let (controller, instrument) = simulator(SimulatorConfig::default());

    let identity = controller.connect("sim").await.unwrap();
    assert!(identity.contains("MODEL 6220"));

    let plan = controller.configure(params()).await.unwrap();
    assert_eq!(plan.total_points(), 11);
    assert!((plan.estimated_time() - 0.022).abs() < 1e-12);
    assert!(controller.verify().await.unwrap());

    let mut events = controller.subscribe();
    controller.arm().await.unwrap();
    assert_eq!(wait_for_arming_outcome(&mut events).await, SessionEvent::Armed);
    assert_eq!(controller.arm_state().await, ArmState::Armed);
    // Two "0" replies then "1".
    assert_eq!(instrument.count("SOUR:DCON:ARM?"), 3);
    assert_eq!(instrument.count("SOUR:DCON:CAB ON"), 1);

    controller.start_measurement().await.unwrap();
    let buffer = controller.retrieve_data().await.unwrap();

    assert_eq!(buffer.len(), 11);
    assert_eq!(buffer.currents().len(), buffer.voltages().len());
    assert_eq!(buffer.currents()[0], 0.0);
    assert!((buffer.currents()[10] - 0.01).abs() < 1e-12);
    for (current, voltage) in buffer.points() {
        let expected = current * 1000.0;
        assert!((voltage - expected).abs() <= expected.abs() * 1e-5 + 1e-8);
    }

    assert!(controller.abort().await.unwrap());
    controller.disconnect().await;
    assert!(!controller.is_connected().await);
}

#[tokio::test]
async fn test_configure_writes_in_order() {
    let (controller, instrument) = simulator(SimulatorConfig::default());
    controller.connect("sim").await.unwrap();

    controller.configure(params()).await.unwrap();

    let commands = instrument.commands();
    let first = commands
        .iter()
        .position(|c| c == "TRAC:POIN 11")
        .unwrap();
    assert_eq!(
        &commands[first..first + 7],
        [
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
async fn test_rejected_parameters_never_reach_the_instrument() {
    let (controller, instrument) = simulator(SimulatorConfig::default());
    controller.connect("sim").await.unwrap();

    let err = controller
        .configure(SweepParams::new(0.2, 0.3, 0.001))
        .await
        .unwrap_err();
    assert!(matches!(err, KeithleyError::Validation(ref v) if v.field == Field::Start));

    let err = controller
        .configure(SweepParams::new(0.0, 0.1, 1e-6))
        .await
        .unwrap_err();
    assert!(matches!(err, KeithleyError::Capacity { max: 65530, .. }));

    assert!(!instrument
        .commands()
        .iter()
        .any(|c| c.starts_with("SOUR:DCON:") || c.starts_with("TRAC:POIN")));
}

#[tokio::test]
async fn test_arm_requires_verified_parameters() {
    let (controller, instrument) = simulator(SimulatorConfig::default());
    controller.connect("sim").await.unwrap();

    let err = controller.arm().await.unwrap_err();

    assert!(matches!(
        err,
        KeithleyError::Precondition(Precondition::ParametersNotVerified)
    ));
    assert_eq!(instrument.count("SOUR:DCON:ARM"), 0);
}

#[tokio::test]
async fn test_arm_requires_nanovoltmeter_and_interlock() {
    let (controller, instrument) = simulator(SimulatorConfig {
        nanovoltmeter_present: false,
        ..SimulatorConfig::default()
    });
    controller.connect("sim").await.unwrap();
    controller.configure(params()).await.unwrap();

    let err = controller.arm().await.unwrap_err();
    assert!(matches!(
        err,
        KeithleyError::Precondition(Precondition::NanovoltmeterMissing)
    ));

    instrument.set_nanovoltmeter_present(true);
    instrument.set_interlock_closed(false);
    let err = controller.arm().await.unwrap_err();
    assert!(matches!(
        err,
        KeithleyError::Precondition(Precondition::InterlockOpen)
    ));

    assert_eq!(instrument.count("SOUR:DCON:ARM"), 0);
    assert_eq!(controller.arm_state().await, ArmState::Unarmed);
}

#[tokio::test(start_paused = true)]
async fn test_arming_timeout_stops_polling() {
    let (controller, instrument) = simulator(SimulatorConfig {
        arm_polls_required: 1000,
        ..SimulatorConfig::default()
    });
    controller.connect("sim").await.unwrap();
    controller.configure(params()).await.unwrap();
    let mut events = controller.subscribe();

    controller.arm().await.unwrap();

    assert_eq!(
        wait_for_arming_outcome(&mut events).await,
        SessionEvent::ArmingTimedOut { elapsed_s: 5.0 }
    );
    let polls = instrument.count("SOUR:DCON:ARM?");
    assert_eq!(polls, 5);

    tokio::time::sleep(INTERVAL * 10).await;
    assert_eq!(instrument.count("SOUR:DCON:ARM?"), polls);
    assert!(matches!(
        controller.start_measurement().await,
        Err(KeithleyError::NotArmed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_reconfigure_after_armed_disarms() {
    let (controller, instrument) = simulator(SimulatorConfig {
        arm_polls_required: 0,
        ..SimulatorConfig::default()
    });
    controller.connect("sim").await.unwrap();
    controller.configure(params()).await.unwrap();
    let mut events = controller.subscribe();
    controller.arm().await.unwrap();
    assert_eq!(wait_for_arming_outcome(&mut events).await, SessionEvent::Armed);

    controller
        .configure(SweepParams::new(0.0, 0.02, 0.001))
        .await
        .unwrap();

    assert_eq!(controller.arm_state().await, ArmState::Unarmed);
    assert!(!instrument.is_armed());
}

#[tokio::test(start_paused = true)]
async fn test_stopping_monitor_after_armed_still_allows_abort() {
    let (controller, instrument) = simulator(SimulatorConfig::default());
    controller.connect("sim").await.unwrap();
    controller.configure(params()).await.unwrap();
    let mut events = controller.subscribe();
    controller.arm().await.unwrap();
    assert_eq!(wait_for_arming_outcome(&mut events).await, SessionEvent::Armed);

    controller.stop_arming_monitor().await;
    assert_eq!(controller.arm_state().await, ArmState::Armed);
    assert!(instrument.is_armed());

    assert!(controller.abort().await.unwrap());
    assert_eq!(instrument.count("SOUR:SWE:ABOR"), 1);
    assert!(!instrument.is_armed());
}

#[tokio::test]
async fn test_shield_change_refused_while_output_on() {
    let instrument = Simulated6220::default();
    let mut session = DeviceSession::new(Arc::new(SimulatedConnector::new(instrument.clone())));
    session.connect("sim").await.unwrap();

    session.output_on().await.unwrap();
    assert_eq!(session.last_known().output, Some(OutputState::On));

    let err = session.set_inner_shield_guard().await.unwrap_err();
    assert!(matches!(err, KeithleyError::OutputOn));
    assert_eq!(instrument.count("OUTP:ISHield GUARd"), 0);

    session.output_off().await.unwrap();
    session.set_inner_shield_guard().await.unwrap();
}

#[tokio::test]
async fn test_error_queue_and_relay() {
    let instrument = Simulated6220::default();
    let mut session = DeviceSession::new(Arc::new(SimulatedConnector::new(instrument.clone())));
    session.connect("sim").await.unwrap();

    assert_eq!(session.check_error().await.unwrap(), None);
    session.send("SOUR:BOGUS 1").await.unwrap();
    let entry = session.check_error().await.unwrap().unwrap();
    assert_eq!(entry.code, -113);
    assert_eq!(session.check_error().await.unwrap(), None);

    let mut nv = Nanovoltmeter::new(&mut session);
    assert!(nv.is_present().await.unwrap());
    assert_eq!(nv.identify().await.unwrap(), IDENTITY_2182A);
}

#[tokio::test]
async fn test_disconnect_then_commands_fail() {
    let instrument = Simulated6220::default();
    let mut session = DeviceSession::new(Arc::new(SimulatedConnector::new(instrument)));
    session.connect("sim").await.unwrap();
    session.disconnect().await;

    assert!(matches!(
        session.send("OUTP OFF").await,
        Err(KeithleyError::NotConnected)
    ));
    assert!(matches!(
        session.query("*IDN?").await,
        Err(KeithleyError::NotConnected)
    ));
}

#[tokio::test]
async fn test_unreachable_instrument_reports_connection_failure() {
    let connector = SimulatedConnector::default();
    connector.set_unreachable(true);
    let controller = Keithley6220Controller::new(Arc::new(connector), ControllerConfig::default());
    let mut events = controller.subscribe();

    let err = controller.connect("sim").await.unwrap_err();

    assert!(matches!(err, KeithleyError::Connection { .. }));
    assert!(matches!(
        events.recv().await.unwrap(),
        SessionEvent::ConnectionFailed { .. }
    ));
}
