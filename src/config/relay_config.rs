//! Configuration loading using Figment
//!
//! One file describes everything a `labrelay` process needs: the relay it
//! serves, the instrument behind it, the client defaults, and optionally an
//! instrument session for `labrelay acquire`.
//!
//! # Example
//!
//! ```no_run
//! use labrelay::config::LabRelayConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LabRelayConfig::load_from("config/labrelay.toml")?;
//!     println!("Relay on {}", config.relay.bind_address());
//!     println!("Log level: {}", config.application.log_level);
//!     Ok(())
//! }
//! ```

use crate::bus::{BusKind, BusSettings};
use crate::instrument::scpi::render_template;
use crate::instrument::{InstrumentKind, InstrumentSettings};
use crate::relay::{ClientSettings, RelaySettings, Route};
use crate::retry::Validity;
use crate::session::{MeasurementOptions, MeasurementProfile};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
    #[error("Configuration serialization error: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::LoadError(Box::new(err))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabRelayConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default = "default_instrument")]
    pub instrument: InstrumentSettings,
    #[serde(default)]
    pub client: ClientSettings,
    /// Only needed by `labrelay acquire`
    #[serde(default)]
    pub session: Option<SessionConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// `[session]`: one configured acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub bus: BusSettings,
    pub profile: MeasurementProfile,
    #[serde(default)]
    pub options: MeasurementOptions,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    /// Sweep parameters embedded in the output file name
    #[serde(default)]
    pub file_params: BTreeMap<String, f64>,
}

fn default_app_name() -> String {
    "labrelay".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_instrument() -> InstrumentSettings {
    InstrumentSettings::mock(&[])
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_file_prefix() -> String {
    "samples".to_string()
}

impl Default for LabRelayConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            relay: RelaySettings::default(),
            instrument: default_instrument(),
            client: ClientSettings::default(),
            session: None,
        }
    }
}

/// Which sections a command relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    /// `[application]` only
    Application,
    /// `[relay]` and `[instrument]`, for serving
    Relay,
    /// `[client]`, for sending requests
    Client,
    /// `[session]`, which must be present
    Session,
    /// Everything present in the file
    Full,
}

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl LabRelayConfig {
    /// Load from `config/labrelay.toml` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/labrelay.toml")
    }

    /// Load configuration from a specific file path, then validate all of it.
    ///
    /// A missing file is not an error; defaults and environment variables
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_scoped(path, ConfigScope::Full)
    }

    /// Load configuration and validate only the sections `scope` uses.
    pub fn load_scoped<P: AsRef<Path>>(path: P, scope: ConfigScope) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABRELAY_").split("__"))
            .extract()?;

        config.validate_for(scope)?;
        Ok(config)
    }

    /// Parse and validate a TOML document, ignoring the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate every section
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - The relay has tokens, unique explicit tokens, and non-zero sizes
    /// - Bus resources are set for every non-mock bus
    /// - SCPI channels are unique, write templates render, and every relay
    ///   route has a matching binding
    /// - The client makes at least one attempt with a sane validity range
    /// - The session, when present, takes at least one sample
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_for(ConfigScope::Full)
    }

    /// Validate the application section plus the sections `scope` uses.
    pub fn validate_for(&self, scope: ConfigScope) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        match scope {
            ConfigScope::Application => Ok(()),
            ConfigScope::Relay => {
                self.validate_relay()?;
                self.validate_instrument()
            }
            ConfigScope::Client => self.validate_client(),
            ConfigScope::Session => {
                let session = self.session.as_ref().ok_or_else(|| {
                    ConfigError::ValidationError("missing [session] section".to_string())
                })?;
                validate_session(session)
            }
            ConfigScope::Full => {
                self.validate_relay()?;
                self.validate_instrument()?;
                self.validate_client()?;
                match &self.session {
                    Some(session) => validate_session(session),
                    None => Ok(()),
                }
            }
        }
    }

    fn validate_relay(&self) -> Result<(), ConfigError> {
        let relay = &self.relay;
        if relay.buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "relay.buffer_size must be > 0".to_string(),
            ));
        }
        if relay.queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "relay.queue_depth must be > 0".to_string(),
            ));
        }

        let mut tokens = HashSet::new();
        for entry in &relay.commands {
            if entry.token.trim().is_empty() || entry.token.contains(char::is_whitespace) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid relay token '{}': must be non-empty without whitespace",
                    entry.token
                )));
            }
            if !tokens.insert(entry.token.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate relay token: '{}'",
                    entry.token
                )));
            }
        }

        if relay.command_table().is_empty() {
            return Err(ConfigError::ValidationError(
                "relay has no command tokens; set relay.preset or relay.commands".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_instrument(&self) -> Result<(), ConfigError> {
        let instrument = &self.instrument;
        if instrument.kind != InstrumentKind::Scpi {
            return Ok(());
        }

        let bus = instrument.bus.as_ref().ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "SCPI instrument '{}' missing 'bus' configuration block",
                instrument.name
            ))
        })?;
        validate_bus("instrument.bus", bus)?;

        let mut names = HashSet::new();
        for binding in &instrument.channels {
            if !names.insert(&binding.name) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate channel '{}' on instrument '{}'",
                    binding.name, instrument.name
                )));
            }
            if let Some(template) = &binding.write {
                render_template(template, 0.0)
                    .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
            }
        }

        let table = self.relay.command_table();
        for token in table.tokens() {
            let Some(route) = table.route(token) else {
                continue;
            };
            let (channel, bound) = match route {
                Route::Read(channel) => (
                    channel,
                    instrument
                        .channels
                        .iter()
                        .any(|b| &b.name == channel && b.query.is_some()),
                ),
                Route::Write(channel) => (
                    channel,
                    instrument
                        .channels
                        .iter()
                        .any(|b| &b.name == channel && b.write.is_some()),
                ),
            };
            if !bound {
                return Err(ConfigError::ValidationError(format!(
                    "Relay token '{token}' needs a binding for channel '{channel}' on instrument '{}'",
                    instrument.name
                )));
            }
        }
        Ok(())
    }

    fn validate_client(&self) -> Result<(), ConfigError> {
        if self.client.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "client.max_attempts must be >= 1".to_string(),
            ));
        }
        if let Validity::Range { min, max } = self.client.validity {
            if min.is_nan() || max.is_nan() || min > max {
                return Err(ConfigError::ValidationError(format!(
                    "client.validity range is empty: min {min} > max {max}"
                )));
            }
        }
        Ok(())
    }
}

fn validate_bus(section: &str, bus: &BusSettings) -> Result<(), ConfigError> {
    if bus.kind != BusKind::Mock && bus.resource.trim().is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "{section}: 'resource' cannot be empty"
        )));
    }
    if bus.kind == BusKind::Serial {
        bus.response_delimiter_byte()
            .map_err(|e| ConfigError::ValidationError(format!("{section}: {e}")))?;
    }
    Ok(())
}

fn validate_session(session: &SessionConfig) -> Result<(), ConfigError> {
    validate_bus("session.bus", &session.bus)?;
    if session.options.sample_count == 0 {
        return Err(ConfigError::ValidationError(
            "session.options.sample_count must be > 0".to_string(),
        ));
    }
    Ok(())
}
