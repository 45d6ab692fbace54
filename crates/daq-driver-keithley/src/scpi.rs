//! SCPI vocabulary and response grammar for the 6220.

/// Command mnemonics used by the driver.
#[allow(missing_docs)]
pub mod cmd {
    /// Identification query.
    pub const IDN: &str = "*IDN?";
    /// Pop one entry from the error queue.
    pub const SYST_ERR: &str = "SYST:ERR?";

    pub const OUTPUT_STATE: &str = "OUTP:STATe?";
    pub const OUTPUT_ON: &str = "OUTP ON";
    pub const OUTPUT_OFF: &str = "OUTP OFF";
    pub const INNER_SHIELD: &str = "OUTP:ISHield?";
    pub const INNER_SHIELD_GUARD: &str = "OUTP:ISHield GUARd";
    pub const OUTPUT_LOW: &str = "OUTP:LTEarth?";
    pub const OUTPUT_LOW_SET: &str = "OUTP:LTEarth";
    pub const INTERLOCK: &str = "OUTP:INT:TRIPped?";

    pub const DCON_START: &str = "SOUR:DCON:STAR";
    pub const DCON_STOP: &str = "SOUR:DCON:STOP";
    pub const DCON_STEP: &str = "SOUR:DCON:STEP";
    pub const DCON_DELTA: &str = "SOUR:DCON:DELTA";
    pub const DCON_DELAY: &str = "SOUR:DCON:DELay";
    pub const DCON_ARM: &str = "SOUR:DCON:ARM";
    pub const DCON_ARM_STATUS: &str = "SOUR:DCON:ARM?";
    pub const DCON_CAB: &str = "SOUR:DCON:CAB";
    pub const DCON_CAB_QUERY: &str = "SOUR:DCON:CAB?";

    pub const COMPLIANCE: &str = "SOUR:CURR:COMP";
    pub const COMPLIANCE_QUERY: &str = "SOUR:CURR:COMP?";
    pub const NV_PRESENT: &str = "SOUR:DELTA:NVPResent?";
    pub const SWEEP_ABORT: &str = "SOUR:SWE:ABOR";

    pub const TRACE_POINTS: &str = "TRAC:POIN";
    pub const TRACE_POINTS_QUERY: &str = "TRAC:POIN?";
    pub const TRACE_DATA: &str = "TRAC:DATA?";

    pub const FORMAT_ALL: &str = "FORM:ELEM ALL";
    pub const FORMAT_QUERY: &str = "FORM:ELEM?";
    pub const UNIT: &str = "UNIT";
    pub const UNIT_QUERY: &str = "UNIT?";

    pub const RELAY_TERM: &str = "SYST:COMM:SER:TERM";
    pub const RELAY_TERM_QUERY: &str = "SYST:COMM:SER:TERM?";
    pub const RELAY_SEND: &str = "SYST:COMM:SER:SEND";
    pub const RELAY_ENTER: &str = "SYST:COMM:SER:ENT?";

    pub const INIT: &str = "INIT:IMM";
}

/// One entry of the instrument error queue.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeviceError {
    /// SCPI error code; 0 means no error.
    pub code: i32,
    /// Message text without surrounding quotes.
    pub message: String,
}

/// Recognise an error frame in place of a normal response.
///
/// An error frame starts with an explicitly signed integer code followed by a
/// comma (`-221,"Settings conflict"`). Lines whose first field is not an
/// integer are data (`+1.0E-03ADC,...`), and a zero code is not an error.
pub fn parse_error_frame(line: &str) -> Option<DeviceError> {
    let (head, tail) = line.split_once(',')?;
    let head = head.trim();
    if !head.starts_with(&['-', '+'][..]) {
        return None;
    }
    let code: i32 = head.parse().ok()?;
    if code == 0 {
        return None;
    }
    Some(DeviceError {
        code,
        message: unquote(tail),
    })
}

/// Parse a `SYST:ERR?` reply (`0,"No error"`, `-113,"Undefined header"`).
pub fn parse_error_queue_entry(line: &str) -> Option<DeviceError> {
    let (head, tail) = line.split_once(',')?;
    let code: i32 = head.trim().parse().ok()?;
    Some(DeviceError {
        code,
        message: unquote(tail),
    })
}

fn unquote(text: &str) -> String {
    let text = text.trim();
    text.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text)
        .replace("\"\"", "\"")
}

/// Wrap `text` as a SCPI string literal, doubling embedded quotes.
pub fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

/// Interpret a boolean reply (`1`/`0`, `ON`/`OFF`).
pub fn parse_bool(reply: &str) -> Option<bool> {
    match reply.trim().to_ascii_uppercase().as_str() {
        "1" | "ON" => Some(true),
        "0" | "OFF" => Some(false),
        _ => None,
    }
}

/// Numeric argument as written on the wire.
pub fn format_value(value: f64) -> String {
    format!("{}", value)
}
