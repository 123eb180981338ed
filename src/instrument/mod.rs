//! Instruments exposed by a relay.
//!
//! An [`Instrument`] reads and writes named channels. The relay's dispatcher
//! owns exactly one of them for the lifetime of the process.

use crate::bus::{open_bus, BusSettings};
use crate::error::{RelayError, RelayResult};
use crate::relay::ChannelId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod mock;
pub mod scpi;

pub use mock::MockInstrument;
pub use scpi::{ChannelBinding, ScpiInstrument};

/// Channel-level access to one instrument.
#[async_trait]
pub trait Instrument: Send {
    fn name(&self) -> &str;

    /// Identity string, `*IDN?` for SCPI instruments.
    async fn identify(&mut self) -> RelayResult<String> {
        Ok(self.name().to_string())
    }

    /// Read the current value of `channel`.
    async fn read(&mut self, channel: &ChannelId) -> RelayResult<f32>;

    /// Apply `value` to `channel` and return the applied value.
    async fn write(&mut self, channel: &ChannelId, value: f32) -> RelayResult<f32>;

    /// Release the underlying resource.
    async fn close(&mut self) -> RelayResult<()> {
        Ok(())
    }
}

/// Which instrument implementation the relay builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    Mock,
    Scpi,
}

/// `[instrument]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSettings {
    pub kind: InstrumentKind,
    #[serde(default = "default_instrument_name")]
    pub name: String,
    /// Required for `scpi`
    #[serde(default)]
    pub bus: Option<BusSettings>,
    /// Send `*RST` before the init commands
    #[serde(default = "default_reset_on_open")]
    pub reset_on_open: bool,
    #[serde(default)]
    pub init_commands: Vec<String>,
    #[serde(default)]
    pub channels: Vec<ChannelBinding>,
    /// Initial channel values for `mock`
    #[serde(default)]
    pub mock_values: BTreeMap<ChannelId, f32>,
}

fn default_instrument_name() -> String {
    "instrument".to_string()
}

fn default_reset_on_open() -> bool {
    true
}

impl InstrumentSettings {
    /// Mock instrument settings with the given channel values.
    pub fn mock(values: &[(&str, f32)]) -> Self {
        Self {
            kind: InstrumentKind::Mock,
            name: "mock".to_string(),
            bus: None,
            reset_on_open: true,
            init_commands: Vec::new(),
            channels: Vec::new(),
            mock_values: values
                .iter()
                .map(|(name, value)| (ChannelId::from(*name), *value))
                .collect(),
        }
    }
}

/// Build and open the instrument described by `settings`.
pub async fn build_instrument(settings: &InstrumentSettings) -> RelayResult<Box<dyn Instrument>> {
    match settings.kind {
        InstrumentKind::Mock => {
            let mock = settings
                .mock_values
                .iter()
                .fold(MockInstrument::new(&settings.name), |mock, (channel, value)| {
                    mock.with_value(channel.as_str(), *value)
                });
            Ok(Box::new(mock))
        }
        InstrumentKind::Scpi => {
            let bus_settings = settings.bus.as_ref().ok_or_else(|| {
                RelayError::Configuration(format!(
                    "SCPI instrument '{}' needs an [instrument.bus] section",
                    settings.name
                ))
            })?;
            let bus = open_bus(bus_settings).await?;
            let instrument = ScpiInstrument::open(
                &settings.name,
                bus,
                settings.reset_on_open,
                &settings.init_commands,
                settings.channels.clone(),
            )
            .await?;
            Ok(Box::new(instrument))
        }
    }
}
