//! Simulated 6220 state and command interpreter.
//!
//! Command headers are matched case-insensitively against the forms the driver
//! sends (`SOUR:DCON:DELAY`, `OUTP:STATE?`, ...). Short/long SCPI form
//! expansion is not modelled. Unknown headers push `-113` onto the error
//! queue; unknown queries produce no reply, so the host times out as it would
//! against real hardware.

use crate::format::{scpi_float, unquote};
use crate::rng::NoiseRng;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// `*IDN?` reply of the simulated 6220.
pub const IDENTITY_6220: &str = "KEITHLEY INSTRUMENTS INC.,MODEL 6220,4242424,D04 /700x";
/// `*IDN?` reply of the simulated 2182A behind the relay.
pub const IDENTITY_2182A: &str = "KEITHLEY INSTRUMENTS INC.,MODEL 2182A,1234567,C02 /A02";

const ALL_ELEMENTS: &str = "READ,UNIT,RNUM,TST,COMP,SOUR,AVOL";
const BUFFER_CAPACITY: u32 = 65536;
const ERROR_QUEUE_DEPTH: usize = 10;

/// Behaviour knobs for the simulator.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// `SOUR:DCON:ARM?` answers "0" this many times before "1".
    pub arm_polls_required: u32,
    /// Whether a 2182A is attached to the relay port.
    pub nanovoltmeter_present: bool,
    /// Whether the output interlock is closed.
    pub interlock_closed: bool,
    /// Device under test, used to synthesise voltages.
    pub resistance_ohms: f64,
    /// Peak voltage noise (V).
    pub noise_volts: f64,
    /// Noise seed; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            arm_polls_required: 2,
            nanovoltmeter_present: true,
            interlock_closed: true,
            resistance_ohms: 1000.0,
            noise_volts: 1e-9,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DconSettings {
    start: f64,
    stop: f64,
    step: f64,
    delta: f64,
    delay: f64,
    compliance_abort: bool,
}

impl Default for DconSettings {
    fn default() -> Self {
        Self {
            start: -1e-5,
            stop: 1e-5,
            step: 1e-6,
            delta: 1e-6,
            delay: 2e-3,
            compliance_abort: false,
        }
    }
}

#[derive(Debug)]
struct State {
    config: SimulatorConfig,
    output_on: bool,
    shield_guard: bool,
    low_earthed: bool,
    dcon: DconSettings,
    compliance: f64,
    trace_points: u32,
    all_elements: bool,
    unit: &'static str,
    relay_terminator: String,
    relay_reply: Option<String>,
    armed: bool,
    arm_countdown: Option<u32>,
    data: Vec<String>,
    errors: VecDeque<(i32, &'static str)>,
    log: Vec<String>,
}

impl State {
    fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            output_on: false,
            shield_guard: false,
            low_earthed: false,
            dcon: DconSettings::default(),
            compliance: 10.0,
            trace_points: 0,
            all_elements: false,
            unit: "V",
            relay_terminator: "CR".to_string(),
            relay_reply: None,
            armed: false,
            arm_countdown: None,
            data: Vec::new(),
            errors: VecDeque::new(),
            log: Vec::new(),
        }
    }

    fn push_error(&mut self, code: i32, message: &'static str) {
        debug!(code, message, "Simulated error queued");
        if self.errors.len() < ERROR_QUEUE_DEPTH {
            self.errors.push_back((code, message));
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
        self.arm_countdown = None;
    }

    fn set_float(&mut self, arg: &str) -> Option<f64> {
        match arg.parse::<f64>() {
            Ok(v) if v.is_finite() => Some(v),
            _ => {
                self.push_error(-104, "Data type error");
                None
            }
        }
    }

    fn set_bool(&mut self, arg: &str) -> Option<bool> {
        match arg.to_ascii_uppercase().as_str() {
            "ON" | "1" => Some(true),
            "OFF" | "0" => Some(false),
            _ => {
                self.push_error(-224, "Illegal parameter value");
                None
            }
        }
    }

    fn set_dcon(&mut self, arg: &str, apply: impl FnOnce(&mut DconSettings, f64)) {
        if let Some(value) = self.set_float(arg) {
            apply(&mut self.dcon, value);
            // Changing sweep settings cancels an armed sweep.
            self.disarm();
        }
    }

    fn sweep_points(&self) -> u32 {
        if self.trace_points > 0 {
            return self.trace_points;
        }
        let span = (self.dcon.stop - self.dcon.start).abs();
        if self.dcon.step <= 0.0 {
            return 1;
        }
        ((span / self.dcon.step).ceil() as u32).saturating_add(1)
    }

    fn run_sweep(&mut self, noise: &NoiseRng) {
        let points = self.sweep_points();
        let DconSettings {
            start,
            stop,
            step,
            delay,
            ..
        } = self.dcon;
        let resistance = self.config.resistance_ohms;
        let amplitude = self.config.noise_volts;

        self.data = (0..points)
            .map(|k| {
                let current = (start + f64::from(k) * step).min(stop);
                let voltage = current * resistance + noise.noise(amplitude);
                let time = f64::from(k) * delay;
                format!(
                    "{}VDC,{}SECS,{}ADC,{:+.4}RDNG#",
                    scpi_float(voltage),
                    scpi_float(time),
                    scpi_float(current),
                    f64::from(k)
                )
            })
            .collect();
        debug!(points, "Simulated sweep complete");
        self.disarm();
    }

    fn relay(&mut self, command: &str) {
        if !self.config.nanovoltmeter_present {
            return;
        }
        let command = command.trim().to_ascii_uppercase();
        if !command.ends_with('?') {
            return;
        }
        self.relay_reply = match command.as_str() {
            "*IDN?" => Some(IDENTITY_2182A.to_string()),
            "FETC?" | "READ?" => Some(scpi_float(0.0)),
            _ => None,
        };
    }

    /// Apply one command line; returns the reply line for queries.
    fn handle(&mut self, line: &str, noise: &NoiseRng) -> Option<String> {
        let line = line.trim();
        self.log.push(line.to_string());
        let (header, arg) = match line.split_once(char::is_whitespace) {
            Some((header, arg)) => (header.to_ascii_uppercase(), arg.trim()),
            None => (line.to_ascii_uppercase(), ""),
        };
        trace!(%header, arg, "Simulated command");

        let flag = |on: bool| if on { "1" } else { "0" }.to_string();

        match header.as_str() {
            "*IDN?" => Some(IDENTITY_6220.to_string()),
            "*RST" => {
                let config = self.config.clone();
                let log = std::mem::take(&mut self.log);
                *self = State::new(config);
                self.log = log;
                None
            }
            "SYST:ERR?" => Some(match self.errors.pop_front() {
                Some((code, message)) => format!("{},\"{}\"", code, message),
                None => "0,\"No error\"".to_string(),
            }),

            "OUTP" => {
                if let Some(on) = self.set_bool(arg) {
                    self.output_on = on;
                }
                None
            }
            "OUTP:STATE?" => Some(flag(self.output_on)),
            "OUTP:ISHIELD?" => Some(if self.shield_guard { "GUAR" } else { "OLOW" }.to_string()),
            "OUTP:ISHIELD" => {
                if self.output_on {
                    self.push_error(-221, "Settings conflict");
                } else {
                    match arg.to_ascii_uppercase().as_str() {
                        "GUARD" | "GUAR" => self.shield_guard = true,
                        "OLOW" | "OLO" => self.shield_guard = false,
                        _ => self.push_error(-224, "Illegal parameter value"),
                    }
                }
                None
            }
            "OUTP:LTEARTH?" => Some(flag(self.low_earthed)),
            "OUTP:LTEARTH" => {
                if self.output_on {
                    self.push_error(-221, "Settings conflict");
                } else if let Some(on) = self.set_bool(arg) {
                    self.low_earthed = on;
                }
                None
            }
            "OUTP:INT:TRIPPED?" => Some(flag(self.config.interlock_closed)),

            "SOUR:DCON:STAR" => {
                self.set_dcon(arg, |d, v| d.start = v);
                None
            }
            "SOUR:DCON:STOP" => {
                self.set_dcon(arg, |d, v| d.stop = v);
                None
            }
            "SOUR:DCON:STEP" => {
                self.set_dcon(arg, |d, v| d.step = v);
                None
            }
            "SOUR:DCON:DELTA" => {
                self.set_dcon(arg, |d, v| d.delta = v);
                None
            }
            "SOUR:DCON:DELAY" => {
                self.set_dcon(arg, |d, v| d.delay = v);
                None
            }
            "SOUR:DCON:STAR?" => Some(scpi_float(self.dcon.start)),
            "SOUR:DCON:STOP?" => Some(scpi_float(self.dcon.stop)),
            "SOUR:DCON:STEP?" => Some(scpi_float(self.dcon.step)),
            "SOUR:DCON:DELTA?" => Some(scpi_float(self.dcon.delta)),
            "SOUR:DCON:DELAY?" => Some(scpi_float(self.dcon.delay)),
            "SOUR:DCON:CAB" => {
                if let Some(on) = self.set_bool(arg) {
                    self.dcon.compliance_abort = on;
                }
                None
            }
            "SOUR:DCON:CAB?" => Some(flag(self.dcon.compliance_abort)),
            "SOUR:DCON:ARM" => {
                if !self.config.nanovoltmeter_present {
                    self.push_error(-221, "Settings conflict");
                } else {
                    self.armed = false;
                    self.arm_countdown = Some(self.config.arm_polls_required);
                }
                None
            }
            "SOUR:DCON:ARM?" => {
                let armed = match self.arm_countdown {
                    _ if self.armed => true,
                    Some(0) => {
                        self.armed = true;
                        self.arm_countdown = None;
                        true
                    }
                    Some(n) => {
                        self.arm_countdown = Some(n - 1);
                        false
                    }
                    None => false,
                };
                Some(flag(armed))
            }
            "SOUR:SWE:ABOR" => {
                self.disarm();
                None
            }
            "SOUR:CURR:COMP" => {
                if let Some(v) = self.set_float(arg) {
                    if (0.1..=105.0).contains(&v) {
                        self.compliance = v;
                    } else {
                        self.push_error(-222, "Data out of range");
                    }
                }
                None
            }
            "SOUR:CURR:COMP?" => Some(scpi_float(self.compliance)),
            "SOUR:DELTA:NVPRESENT?" => Some(flag(self.config.nanovoltmeter_present)),

            "TRAC:POIN" => {
                match arg.parse::<f64>() {
                    Ok(n) if (1.0..=f64::from(BUFFER_CAPACITY)).contains(&n) => {
                        self.trace_points = n.round() as u32;
                    }
                    Ok(_) => self.push_error(-222, "Data out of range"),
                    Err(_) => self.push_error(-104, "Data type error"),
                }
                None
            }
            "TRAC:POIN?" => Some(self.trace_points.to_string()),
            "TRAC:DATA?" => Some(self.data.join(",")),

            "FORM:ELEM" => {
                self.all_elements = arg.eq_ignore_ascii_case("ALL");
                None
            }
            "FORM:ELEM?" => Some(if self.all_elements { ALL_ELEMENTS } else { "READ" }.to_string()),
            "UNIT" => {
                match arg.to_ascii_uppercase().as_str() {
                    "V" => self.unit = "V",
                    "S" | "SIEM" => self.unit = "S",
                    "O" | "OHMS" => self.unit = "O",
                    "W" | "WATT" => self.unit = "W",
                    _ => self.push_error(-224, "Illegal parameter value"),
                }
                None
            }
            "UNIT?" => Some(self.unit.to_string()),

            "SYST:COMM:SER:TERM" => {
                self.relay_terminator = arg.to_ascii_uppercase();
                None
            }
            "SYST:COMM:SER:TERM?" => Some(self.relay_terminator.clone()),
            "SYST:COMM:SER:SEND" => {
                let command = unquote(arg);
                self.relay(&command);
                None
            }
            "SYST:COMM:SER:ENT?" => Some(self.relay_reply.take().unwrap_or_default()),

            "INIT:IMM" | "INIT" => {
                if self.armed {
                    self.run_sweep(noise);
                } else {
                    self.push_error(-221, "Settings conflict");
                }
                None
            }

            _ => {
                self.push_error(-113, "Undefined header");
                None
            }
        }
    }
}

/// Handle on a simulated 6220 with a 2182A attached.
///
/// Clones share one instrument, so a test can keep a handle while the driver
/// talks to the same state through a [`SimulatedConnector`](crate::SimulatedConnector).
#[derive(Clone)]
pub struct Simulated6220 {
    state: Arc<Mutex<State>>,
    noise: Arc<NoiseRng>,
}

impl Simulated6220 {
    /// Fresh instrument in its power-on state.
    pub fn new(config: SimulatorConfig) -> Self {
        let noise = Arc::new(NoiseRng::new(config.seed));
        Self {
            state: Arc::new(Mutex::new(State::new(config))),
            noise,
        }
    }

    /// Process one command line; returns the reply for queries.
    pub fn execute(&self, line: &str) -> Option<String> {
        self.state.lock().handle(line, &self.noise)
    }

    /// Every command received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Number of commands exactly equal to `command`.
    pub fn count(&self, command: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|line| line.as_str() == command)
            .count()
    }

    /// Whether the sweep is armed.
    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    /// Whether the output relay is closed.
    pub fn output_on(&self) -> bool {
        self.state.lock().output_on
    }

    /// Open or close the interlock.
    pub fn set_interlock_closed(&self, closed: bool) {
        self.state.lock().config.interlock_closed = closed;
    }

    /// Attach or detach the nanovoltmeter.
    pub fn set_nanovoltmeter_present(&self, present: bool) {
        self.state.lock().config.nanovoltmeter_present = present;
    }

    /// Change how many "0" replies precede "1" on the next arm.
    pub fn set_arm_polls_required(&self, polls: u32) {
        self.state.lock().config.arm_polls_required = polls;
    }

    /// Queue an error as if the instrument had raised it.
    pub fn push_error(&self, code: i32, message: &'static str) {
        self.state.lock().push_error(code, message);
    }
}

impl Default for Simulated6220 {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl std::fmt::Debug for Simulated6220 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulated6220")
            .field("armed", &self.is_armed())
            .finish_non_exhaustive()
    }
}
