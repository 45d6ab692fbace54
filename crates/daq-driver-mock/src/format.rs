//! Instrument-style number and string formatting.

/// Format like the 6220 does: signed mantissa with six decimals and a signed
/// two-digit exponent, e.g. `+1.000000E-03`.
pub fn scpi_float(value: f64) -> String {
    let formatted = format!("{:+.6E}", value);
    match formatted.split_once('E') {
        Some((mantissa, exponent)) => match exponent.parse::<i32>() {
            Ok(exp) => format!("{}E{:+03}", mantissa, exp),
            Err(_) => formatted,
        },
        None => formatted,
    }
}

/// Strip one level of SCPI string quoting.
pub fn unquote(arg: &str) -> String {
    let arg = arg.trim();
    match arg
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
    {
        Some(inner) => inner.replace("\"\"", "\""),
        None => arg.to_string(),
    }
}
