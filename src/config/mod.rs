//! Configuration System
//!
//! Configuration is loaded with Figment from (in order of precedence):
//! 1. Environment variables prefixed with `LABRELAY_`
//! 2. TOML configuration file (default: `config/labrelay.toml`)
//!
//! # Environment Variables
//!
//! Nested keys are separated by a double underscore, since key names
//! themselves contain single underscores:
//!
//! ```text
//! LABRELAY_APPLICATION__LOG_LEVEL=debug
//! LABRELAY_RELAY__PORT=6000
//! LABRELAY_CLIENT__MAX_ATTEMPTS=10
//! ```

pub mod relay_config;

pub use relay_config::{
    ApplicationConfig, ConfigError, ConfigScope, LabRelayConfig, SessionConfig,
};
