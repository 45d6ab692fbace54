//! `dcon` configuration.
//!
//! Settings are layered with figment, later layers overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. a TOML file (`--config`, or `dcon.toml` in the working directory if present)
//! 3. `DCON_`-prefixed environment variables, nested keys split on `__`
//!    (`DCON_INSTRUMENT__ADDRESS=sim`, `DCON_ARMING__TIMEOUT=30s`)

use anyhow::{bail, Context, Result};
use daq_driver_keithley::{ArmingConfig, SweepParams};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::{Figment, Provider};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File picked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "dcon.toml";
/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DCON_";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Fallback tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Where and how to reach the 6220.
    pub instrument: InstrumentSettings,
    /// Arm-status polling.
    pub arming: ArmingConfig,
    /// Default sweep, overridable per command.
    pub sweep: SweepParams,
}

/// Connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentSettings {
    /// `sim`, a serial port path, or `prologix:<port>:<gpib-addr>`.
    pub address: String,
    /// Serial line rate.
    pub baud_rate: u32,
    /// Per-line read timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Read timeout for the sweep buffer.
    #[serde(with = "humantime_serde")]
    pub data_timeout: Duration,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            address: "sim".to_string(),
            baud_rate: 9600,
            timeout: Duration::from_secs(2),
            data_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            instrument: InstrumentSettings::default(),
            arming: ArmingConfig::default(),
            sweep: SweepParams::new(0.0, 0.01, 0.001),
        }
    }
}

impl Provider for Settings {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("dcon defaults")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

impl Settings {
    /// Defaults merged with the TOML file and the environment.
    ///
    /// An explicitly named file must exist; the default file is optional.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        Self::figment(config_path)?
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to extract configuration")
    }

    fn figment(config_path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Settings::default());
        let file: PathBuf = match config_path {
            Some(path) if !path.exists() => {
                bail!("Config file not found: {}", path.display())
            }
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };
        if file.exists() {
            figment = figment.merge(Toml::file(&file));
        }
        Ok(figment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_toml(contents: &str) -> Result<Settings> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        Settings::figment(Some(file.path()))?
            .extract()
            .context("extract")
    }

    #[test]
    fn test_defaults() {
        let settings: Settings = Figment::from(Settings::default()).extract().unwrap();

        assert_eq!(settings, Settings::default());
        assert_eq!(settings.instrument.address, "sim");
        assert_eq!(settings.arming.timeout, Duration::from_secs(20));
        assert_eq!(settings.sweep.delay, 0.002);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let settings = load_toml(
            r#"
            log_level = "debug"

            [instrument]
            address = "prologix:/dev/ttyUSB0:12"
            data_timeout = "1m"

            [arming]
            interval = "500ms"

            [sweep]
            start = -0.001
            stop = 0.001
            step = 0.0001
            "#,
        )
        .unwrap();

        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.instrument.address, "prologix:/dev/ttyUSB0:12");
        assert_eq!(settings.instrument.baud_rate, 9600);
        assert_eq!(settings.instrument.data_timeout, Duration::from_secs(60));
        assert_eq!(settings.arming.interval, Duration::from_millis(500));
        assert_eq!(settings.arming.timeout, Duration::from_secs(20));
        assert_eq!(settings.sweep.start, -0.001);
        // Unset keys keep the built-in defaults.
        assert_eq!(settings.sweep.delta, 1e-5);
    }

    #[test]
    fn test_bad_duration_rejected() {
        assert!(load_toml("[arming]\ntimeout = \"soon\"\n").is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");

        let err = Settings::load(Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
