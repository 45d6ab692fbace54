//! `dcon`: differential-conductance sweeps on a Keithley 6220 + 2182A.
//!
//! # Usage
//!
//! ```bash
//! dcon --address sim sweep --start 0 --stop 0.01 --step 0.001
//! dcon --address prologix:/dev/ttyUSB0:12 status
//! dcon --config lab.toml --json sweep > run.json
//! dcon aux "SENS:VOLT:NPLC?"
//! ```
//!
//! Logging goes to stderr and follows `RUST_LOG`, falling back to the
//! configured `log_level`.

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod config;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Settings;
use daq_core::serial::SerialConnector;
use daq_core::Connector;
use daq_driver_keithley::scpi::cmd;
use daq_driver_keithley::{
    ControllerConfig, Keithley6220Controller, MeasurementBuffer, Nanovoltmeter, SessionEvent,
    SweepParams, SweepPlan,
};
use daq_driver_mock::SimulatedConnector;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Address selecting the built-in simulator.
const SIM_ADDRESS: &str = "sim";
/// Extra wait after the estimated sweep time before reading the buffer.
const SWEEP_MARGIN: Duration = Duration::from_secs(1);
/// Upper bound on error-queue entries drained by `errors`.
const MAX_ERROR_ENTRIES: usize = 32;

#[derive(Parser)]
#[command(name = "dcon")]
#[command(about = "Keithley 6220 differential-conductance sweeps", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Instrument address, overriding the configuration ("sim" for the simulator)
    #[arg(long, global = true)]
    address: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the 6220 and the attached nanovoltmeter
    Identify,

    /// Report output, shield, interlock, arm state and error queue
    Status,

    /// Validate and program a sweep without running it
    Configure(SweepArgs),

    /// Configure, arm, run and retrieve a sweep
    Sweep(SweepArgs),

    /// Abort an armed or running sweep
    Abort,

    /// Drain the instrument error queue
    Errors,

    /// Send a query to the 2182A through the relay
    Aux {
        /// Command to forward, e.g. "*IDN?"
        command: String,
    },
}

/// Sweep parameters; unset values come from the configuration.
#[derive(Args, Debug, Default)]
struct SweepArgs {
    /// Start current (A)
    #[arg(long, allow_hyphen_values = true)]
    start: Option<f64>,
    /// Stop current (A)
    #[arg(long, allow_hyphen_values = true)]
    stop: Option<f64>,
    /// Step (A)
    #[arg(long)]
    step: Option<f64>,
    /// Delay between points (s)
    #[arg(long)]
    delay: Option<f64>,
    /// Differential current (A)
    #[arg(long)]
    delta: Option<f64>,
}

impl SweepArgs {
    fn apply(&self, base: SweepParams) -> SweepParams {
        SweepParams {
            start: self.start.unwrap_or(base.start),
            stop: self.stop.unwrap_or(base.stop),
            step: self.step.unwrap_or(base.step),
            delay: self.delay.unwrap_or(base.delay),
            delta: self.delta.unwrap_or(base.delta),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(address) = &cli.address {
        settings.instrument.address = address.clone();
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    debug!(?settings, "Configuration loaded");

    let controller = Keithley6220Controller::new(
        connector(&settings),
        ControllerConfig {
            arming: settings.arming,
            data_timeout: settings.instrument.data_timeout,
            ..ControllerConfig::default()
        },
    );
    log_events(controller.subscribe());

    controller
        .connect(&settings.instrument.address)
        .await
        .with_context(|| format!("Failed to connect to {}", settings.instrument.address))?;

    let outcome = match cli.command {
        Commands::Identify => identify(&controller, cli.json).await,
        Commands::Status => status(&controller, cli.json).await,
        Commands::Configure(args) => configure(&controller, args.apply(settings.sweep), cli.json)
            .await
            .map(|_| ()),
        Commands::Sweep(args) => sweep(&controller, args.apply(settings.sweep), cli.json).await,
        Commands::Abort => abort(&controller, cli.json).await,
        Commands::Errors => errors(&controller, cli.json).await,
        Commands::Aux { command } => aux(&controller, &command, cli.json).await,
    };

    controller.disconnect().await;
    outcome
}

fn connector(settings: &Settings) -> Arc<dyn Connector> {
    if settings.instrument.address == SIM_ADDRESS {
        info!("Using the simulated 6220");
        Arc::new(SimulatedConnector::default())
    } else {
        Arc::new(SerialConnector::new(
            settings.instrument.baud_rate,
            settings.instrument.timeout,
        ))
    }
}

fn log_events(mut events: broadcast::Receiver<SessionEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Warning { message }) => warn!(%message, "Instrument warning"),
                Ok(event) => debug!(?event, "Session event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn identify(controller: &Keithley6220Controller, as_json: bool) -> Result<()> {
    let mut session = controller.session().await;
    let source = session.identify().await?;
    let nanovoltmeter = {
        let mut nv = Nanovoltmeter::new(&mut session);
        if nv.is_present().await? {
            Some(nv.identify().await?)
        } else {
            None
        }
    };

    if as_json {
        return print_json(&json!({ "source": source, "nanovoltmeter": nanovoltmeter }));
    }
    println!("6220:  {}", source);
    println!("2182A: {}", nanovoltmeter.as_deref().unwrap_or("not detected"));
    Ok(())
}

async fn status(controller: &Keithley6220Controller, as_json: bool) -> Result<()> {
    let output = controller.query_output_state().await?;
    let shield = controller.query_inner_shield().await?;
    let output_low = controller.session().await.query_output_low().await?;
    let interlock = controller.query_interlock().await?;
    let armed = controller.query_arm_status().await?;
    let nanovoltmeter = controller.query_nanovoltmeter().await?;
    let error = controller.check_error().await?;

    if as_json {
        return print_json(&json!({
            "output": output,
            "inner_shield": shield,
            "output_low": output_low,
            "interlock_closed": interlock,
            "armed": armed,
            "nanovoltmeter_present": nanovoltmeter,
            "error": error,
        }));
    }
    println!("output:         {:?}", output);
    println!("inner shield:   {:?}", shield);
    println!("output low:     {:?}", output_low);
    println!("interlock:      {}", if interlock { "closed" } else { "open" });
    println!("armed:          {}", armed);
    println!("nanovoltmeter:  {}", if nanovoltmeter { "present" } else { "missing" });
    match error {
        Some(e) => println!("error queue:    {},\"{}\"", e.code, e.message),
        None => println!("error queue:    empty"),
    }
    Ok(())
}

async fn configure(
    controller: &Keithley6220Controller,
    params: SweepParams,
    as_json: bool,
) -> Result<SweepPlan> {
    let plan = controller.configure(params).await?;
    if !controller.verify().await? {
        bail!("Instrument did not accept the sweep parameters");
    }

    if as_json {
        print_json(&serde_json::to_value(plan)?)?;
    } else {
        println!(
            "{} points, estimated {:.3} s",
            plan.total_points(),
            plan.estimated_time()
        );
    }
    Ok(plan)
}

async fn sweep(
    controller: &Keithley6220Controller,
    params: SweepParams,
    as_json: bool,
) -> Result<()> {
    let plan = controller.configure(params).await?;
    info!(
        points = plan.total_points(),
        estimated_s = plan.estimated_time(),
        "Sweep configured"
    );

    let mut events = controller.subscribe();
    controller.arm().await?;
    wait_until_armed(&mut events).await?;

    controller.start_measurement().await?;
    let wait = Duration::from_secs_f64(plan.estimated_time()) + SWEEP_MARGIN;
    info!(?wait, "Sweep running");
    tokio::time::sleep(wait).await;

    let buffer = controller.retrieve_data().await?;
    if as_json {
        print_json(&json!({ "plan": plan, "data": buffer }))
    } else {
        print_csv(&buffer);
        Ok(())
    }
}

async fn wait_until_armed(events: &mut broadcast::Receiver<SessionEvent>) -> Result<()> {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Armed) => return Ok(()),
            Ok(SessionEvent::ArmingProgress { elapsed_s }) => {
                debug!(elapsed_s, "Waiting for arm");
            }
            Ok(SessionEvent::ArmingTimedOut { elapsed_s }) => {
                bail!("Instrument did not arm within {:.1} s", elapsed_s)
            }
            Ok(SessionEvent::ArmingFailed { reason }) => bail!("Arming failed: {}", reason),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => bail!("Controller closed while arming"),
        }
    }
}

fn print_csv(buffer: &MeasurementBuffer) {
    println!("current_a,voltage_v");
    for (current, voltage) in buffer.points() {
        println!("{:e},{:e}", current, voltage);
    }
}

async fn abort(controller: &Keithley6220Controller, as_json: bool) -> Result<()> {
    // A fresh process does not know whether a sweep is running, so the abort
    // is sent unconditionally.
    controller.session().await.send(cmd::SWEEP_ABORT).await?;
    if as_json {
        return print_json(&json!({ "aborted": true }));
    }
    println!("aborted");
    Ok(())
}

async fn errors(controller: &Keithley6220Controller, as_json: bool) -> Result<()> {
    let mut entries = Vec::new();
    while entries.len() < MAX_ERROR_ENTRIES {
        match controller.check_error().await? {
            Some(entry) => entries.push(entry),
            None => break,
        }
    }

    if as_json {
        return print_json(&serde_json::to_value(&entries)?);
    }
    if entries.is_empty() {
        println!("no errors");
    }
    for entry in entries {
        println!("{},\"{}\"", entry.code, entry.message);
    }
    Ok(())
}

async fn aux(controller: &Keithley6220Controller, command: &str, as_json: bool) -> Result<()> {
    let mut session = controller.session().await;
    let mut nv = Nanovoltmeter::new(&mut session);
    if !nv.is_present().await? {
        bail!("No nanovoltmeter detected on the relay port");
    }

    let reply = if command.trim_end().ends_with('?') {
        Some(nv.query(command).await?)
    } else {
        nv.send(command).await?;
        None
    };

    if as_json {
        return print_json(&json!({ "command": command, "reply": reply }));
    }
    if let Some(reply) = reply {
        println!("{}", reply);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_sweep() {
        let cli = Cli::try_parse_from([
            "dcon", "--address", "sim", "--json", "sweep", "--start", "-0.001", "--stop", "0.001",
            "--step", "0.0001",
        ])
        .unwrap();

        assert_eq!(cli.address.as_deref(), Some("sim"));
        assert!(cli.json);
        let params = match cli.command {
            Commands::Sweep(args) => {
                args.apply(SweepParams::new(0.0, 0.01, 0.001).with_delay(0.005))
            }
            _ => unreachable!("expected sweep"),
        };
        assert_eq!(params.start, -0.001);
        assert_eq!(params.step, 0.0001);
        assert_eq!(params.delay, 0.005);
    }

    #[test]
    fn test_cli_aux_takes_command() {
        let cli = Cli::try_parse_from(["dcon", "aux", "*IDN?"]).unwrap();
        assert!(matches!(cli.command, Commands::Aux { ref command } if command == "*IDN?"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_against_simulator() {
        let controller = Keithley6220Controller::new(
            Arc::new(SimulatedConnector::default()),
            ControllerConfig {
                arming: daq_driver_keithley::ArmingConfig {
                    timeout: Duration::from_secs(5),
                    interval: Duration::from_millis(10),
                },
                ..ControllerConfig::default()
            },
        );
        controller.connect(SIM_ADDRESS).await.unwrap();

        sweep(&controller, SweepParams::new(0.0, 0.001, 0.0001), true)
            .await
            .unwrap();

        assert_eq!(controller.last_buffer().await.unwrap().len(), 11);
    }
}
