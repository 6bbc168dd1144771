//! Layered engine settings.
//!
//! Settings are read once at startup and stay read-only while procedures run.
//!
//! # Layers
//!
//! 1. Compiled defaults ([`Settings::default`])
//! 2. Optional TOML file
//! 3. Environment variables prefixed `SCANBOT_`; nested keys are separated by
//!    double underscores, e.g. `SCANBOT_SAFETY__MAX_CURRENT=8e-9`
//!
//! # Example
//!
//! ```toml
//! log_level = "debug"
//!
//! [instrument]
//! host = "192.168.1.20"
//! ports = [6501, 6502]
//! default_basename = "Au111"
//!
//! [safety]
//! max_current = 5e-9
//! retract_voltage = 200.0
//! retract_frequency = 1500.0
//! ```

use crate::error::{ScanbotError, ScanbotResult};
use crate::limits::{CALL_TIMEOUT, DEFAULT_CHANNEL};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::{Figment, Provider};
use scanbot_pool::Endpoint;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Controller connection and naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentSettings {
    /// Controller host
    pub host: String,
    /// Controller ports; each one is a pool endpoint
    pub ports: Vec<u16>,
    /// Basename for saved scans; empty keeps the controller's own
    pub default_basename: String,
    /// Channel grabbed after each acquisition
    pub channel: u32,
    /// Upper bound on any single blocking gateway call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            ports: vec![6501, 6502, 6503, 6504],
            default_basename: String::new(),
            channel: DEFAULT_CHANNEL,
            call_timeout: CALL_TIMEOUT,
        }
    }
}

impl InstrumentSettings {
    /// Pool endpoints in configured order.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.ports
            .iter()
            .map(|port| Endpoint::new(self.host.clone(), *port))
            .collect()
    }

    /// Configured basename, if any.
    pub fn basename(&self) -> Option<&str> {
        let name = self.default_basename.trim();
        (!name.is_empty()).then_some(name)
    }
}

/// Crash detection and retract parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyThresholds {
    /// Current magnitude treated as a crash (A)
    pub max_current: f64,
    /// Motor amplitude while retracting (V)
    pub retract_voltage: f64,
    /// Motor frequency while retracting (Hz)
    pub retract_frequency: f64,
    /// Give up retracting after this many batches
    pub max_retract_batches: usize,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            max_current: 5e-9,
            retract_voltage: 200.0,
            retract_frequency: 1500.0,
            max_retract_batches: 400,
        }
    }
}

/// Voltage and frequency limits of one motor axis group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveEnvelope {
    /// Lowest amplitude (V)
    pub min_voltage: f64,
    /// Highest amplitude (V)
    pub max_voltage: f64,
    /// Lowest frequency (Hz)
    pub min_frequency: f64,
    /// Highest frequency (Hz)
    pub max_frequency: f64,
}

impl Default for DriveEnvelope {
    fn default() -> Self {
        Self {
            min_voltage: 0.0,
            max_voltage: 200.0,
            min_frequency: 500.0,
            max_frequency: 5000.0,
        }
    }
}

impl DriveEnvelope {
    /// Clamp a requested amplitude into the envelope.
    pub fn clamp_voltage(&self, volts: f64) -> f64 {
        volts.clamp(self.min_voltage, self.max_voltage)
    }

    /// Clamp a requested frequency into the envelope.
    pub fn clamp_frequency(&self, hz: f64) -> f64 {
        hz.clamp(self.min_frequency, self.max_frequency)
    }

    fn validate(&self, axis: &str) -> ScanbotResult<()> {
        if !(self.min_voltage <= self.max_voltage && self.min_frequency <= self.max_frequency) {
            return Err(ScanbotError::Configuration(format!(
                "piezo.{axis}: min must not exceed max"
            )));
        }
        if self.min_voltage < 0.0 || self.min_frequency < 0.0 {
            return Err(ScanbotError::Configuration(format!(
                "piezo.{axis}: limits must be non-negative"
            )));
        }
        Ok(())
    }
}

/// Motor drive envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PiezoEnvelope {
    /// Vertical axis
    pub z: DriveEnvelope,
    /// Lateral axes
    pub xy: DriveEnvelope,
}

/// Where processed data is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Directory for stitched surveys
    pub data_dir: PathBuf,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("scanbot_data"),
        }
    }
}

/// All engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Default log filter
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Controller connection
    pub instrument: InstrumentSettings,
    /// Crash thresholds
    pub safety: SafetyThresholds,
    /// Motor envelopes
    pub piezo: PiezoEnvelope,
    /// Output locations
    pub output: OutputSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: LogFormat::default(),
            instrument: InstrumentSettings::default(),
            safety: SafetyThresholds::default(),
            piezo: PiezoEnvelope::default(),
            output: OutputSettings::default(),
        }
    }
}

impl Provider for Settings {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("Library Defaults")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(Settings::default()).data()
    }
}

impl Settings {
    /// Load defaults, then `config_path` when it exists, then `SCANBOT_` env vars.
    pub fn load(config_path: Option<&Path>) -> ScanbotResult<Self> {
        let mut figment = Figment::from(Settings::default());

        if let Some(path) = config_path {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            } else {
                warn!(path = %path.display(), "Config file not found, using defaults");
            }
        }

        figment = figment.merge(Env::prefixed("SCANBOT_").split("__"));

        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string layered over the defaults.
    pub fn from_toml_str(toml: &str) -> ScanbotResult<Self> {
        let settings: Settings = Figment::from(Settings::default())
            .merge(Toml::string(toml))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Render the effective settings as TOML.
    pub fn to_toml_string(&self) -> ScanbotResult<String> {
        toml::to_string_pretty(self).map_err(|e| ScanbotError::Configuration(e.to_string()))
    }

    /// Semantic checks that parsing cannot express.
    pub fn validate(&self) -> ScanbotResult<()> {
        if self.instrument.ports.is_empty() {
            return Err(ScanbotError::Configuration(
                "instrument.ports must list at least one port".into(),
            ));
        }
        if self.instrument.host.trim().is_empty() {
            return Err(ScanbotError::Configuration(
                "instrument.host must not be empty".into(),
            ));
        }
        if self.instrument.call_timeout.is_zero() {
            return Err(ScanbotError::Configuration(
                "instrument.call_timeout must be positive".into(),
            ));
        }
        let safety = &self.safety;
        if !(safety.max_current > 0.0 && safety.retract_voltage > 0.0 && safety.retract_frequency > 0.0)
        {
            return Err(ScanbotError::Configuration(
                "safety thresholds must be positive".into(),
            ));
        }
        if safety.max_retract_batches == 0 {
            return Err(ScanbotError::Configuration(
                "safety.max_retract_batches must be at least 1".into(),
            ));
        }
        self.piezo.z.validate("z")?;
        self.piezo.xy.validate("xy")?;
        Ok(())
    }
}
