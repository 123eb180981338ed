//! Generic SCPI instrument
//!
//! Maps relay channels onto SCPI strings. Each channel may bind a query
//! (`:MEAS:CURR?`) used for reads and a write template (`:SOUR:VOLT {value}`)
//! used for writes. Replies are parsed as the first comma-separated float.
//!
//! ```toml
//! [instrument]
//! kind = "scpi"
//! name = "keithley_2400"
//! init_commands = [":SOUR:FUNC VOLT", ":SENS:FUNC 'CURR'", ":OUTP ON"]
//!
//! [instrument.bus]
//! kind = "visa"
//! resource = "GPIB0::24::INSTR"
//!
//! [[instrument.channels]]
//! name = "current"
//! query = ":MEAS:CURR?"
//!
//! [[instrument.channels]]
//! name = "voltage"
//! query = ":SOUR:VOLT?"
//! write = ":SOUR:VOLT {value}"
//! ```

use super::Instrument;
use crate::bus::{parse_first_value, Bus};
use crate::error::{RelayError, RelayResult};
use crate::relay::ChannelId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// SCPI strings bound to one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub name: ChannelId,
    #[serde(default)]
    pub query: Option<String>,
    /// `strfmt` template; `{value}` is replaced by the value to apply
    #[serde(default)]
    pub write: Option<String>,
}

impl ChannelBinding {
    /// Render the write template for `value`.
    pub fn render_write(&self, value: f32) -> RelayResult<String> {
        let template = self.write.as_ref().ok_or_else(|| {
            RelayError::Unrecognized(format!("channel '{}' is read-only", self.name))
        })?;
        render_template(template, value)
    }
}

/// Substitute `{value}` in a write template.
pub fn render_template(template: &str, value: f32) -> RelayResult<String> {
    let vars = HashMap::from([("value".to_string(), value.to_string())]);
    strfmt::strfmt(template, &vars).map_err(|e| {
        RelayError::Configuration(format!("bad write template '{template}': {e}"))
    })
}

/// An instrument driven by SCPI strings over a [`Bus`].
pub struct ScpiInstrument {
    name: String,
    bus: Box<dyn Bus>,
    channels: HashMap<ChannelId, ChannelBinding>,
    identity: Option<String>,
}

impl ScpiInstrument {
    /// Open the instrument: optional `*RST`, then the init commands in order.
    ///
    /// A failed init write is returned as-is; nothing is retried.
    pub async fn open(
        name: &str,
        mut bus: Box<dyn Bus>,
        reset: bool,
        init_commands: &[String],
        channels: Vec<ChannelBinding>,
    ) -> RelayResult<Self> {
        info!(instrument = name, resource = bus.resource(), "Opening SCPI instrument");

        if reset {
            bus.write("*RST").await?;
        }
        for command in init_commands {
            bus.write(command).await?;
        }

        let mut instrument = Self {
            name: name.to_string(),
            bus,
            channels: channels
                .into_iter()
                .map(|binding| (binding.name.clone(), binding))
                .collect(),
            identity: None,
        };

        match instrument.query_identity().await {
            Ok(idn) => {
                info!(instrument = name, identity = %idn, "SCPI instrument connected");
                instrument.identity = Some(idn);
            }
            Err(e) => warn!(instrument = name, error = %e, "Failed to read identity"),
        }

        Ok(instrument)
    }

    async fn query_identity(&mut self) -> RelayResult<String> {
        self.bus.query("*IDN?").await
    }

    fn binding(&self, channel: &ChannelId) -> RelayResult<&ChannelBinding> {
        self.channels
            .get(channel)
            .ok_or_else(|| RelayError::Unrecognized(format!("no binding for channel '{channel}'")))
    }
}

#[async_trait]
impl Instrument for ScpiInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    async fn identify(&mut self) -> RelayResult<String> {
        if let Some(identity) = &self.identity {
            return Ok(identity.clone());
        }
        let idn = self.query_identity().await?;
        self.identity = Some(idn.clone());
        Ok(idn)
    }

    async fn read(&mut self, channel: &ChannelId) -> RelayResult<f32> {
        let query = self.binding(channel)?.query.clone().ok_or_else(|| {
            RelayError::Unrecognized(format!("channel '{channel}' is write-only"))
        })?;
        let reply = self.bus.query(&query).await?;
        let value = parse_first_value(&reply)? as f32;
        debug!(instrument = %self.name, %channel, value, "Channel read");
        Ok(value)
    }

    async fn write(&mut self, channel: &ChannelId, value: f32) -> RelayResult<f32> {
        let command = self.binding(channel)?.render_write(value)?;
        self.bus.write(&command).await?;
        debug!(instrument = %self.name, %channel, value, "Channel written");
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;

    fn bindings() -> Vec<ChannelBinding> {
        vec![
            ChannelBinding {
                name: "current".into(),
                query: Some(":MEAS:CURR?".to_string()),
                write: None,
            },
            ChannelBinding {
                name: "voltage".into(),
                query: Some(":SOUR:VOLT?".to_string()),
                write: Some(":SOUR:VOLT {value}".to_string()),
            },
            ChannelBinding {
                name: "output".into(),
                query: None,
                write: Some(":OUTP {value}".to_string()),
            },
        ]
    }

    async fn open(bus: &MockBus) -> ScpiInstrument {
        ScpiInstrument::open(
            "keithley",
            Box::new(bus.clone()),
            true,
            &[":SOUR:FUNC VOLT".to_string(), ":OUTP ON".to_string()],
            bindings(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_open_sends_reset_then_init_in_order() {
        let bus = MockBus::new("GPIB0::24::INSTR");
        let _instrument = open(&bus).await;
        assert_eq!(
            bus.call_log(),
            vec!["*RST", ":SOUR:FUNC VOLT", ":OUTP ON", "*IDN?"]
        );
    }

    #[tokio::test]
    async fn test_open_aborts_on_failed_write() {
        let bus = MockBus::new("GPIB0::24::INSTR");
        bus.inject_next_failure();
        let result = ScpiInstrument::open("keithley", Box::new(bus.clone()), true, &[], bindings()).await;
        assert!(matches!(result, Err(RelayError::DeviceFault(_))));
        assert_eq!(bus.call_log(), vec!["*RST"]);
    }

    #[tokio::test]
    async fn test_read_parses_first_field() {
        let bus = MockBus::new("GPIB0::24::INSTR")
            .with_reply(":MEAS:CURR?", "+1.230000E-06,+9.91E+37,+1.0E+00");
        let mut instrument = open(&bus).await;
        let value = instrument.read(&"current".into()).await.unwrap();
        assert!((value - 1.23e-6).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_write_renders_template() {
        let bus = MockBus::new("GPIB0::24::INSTR");
        let mut instrument = open(&bus).await;
        bus.clear_log();
        assert_eq!(instrument.write(&"voltage".into(), 1.5).await.unwrap(), 1.5);
        assert_eq!(bus.call_log(), vec![":SOUR:VOLT 1.5"]);
    }

    #[tokio::test]
    async fn test_missing_bindings_are_unrecognized() {
        let bus = MockBus::new("GPIB0::24::INSTR");
        let mut instrument = open(&bus).await;
        assert!(matches!(
            instrument.read(&"resistance".into()).await,
            Err(RelayError::Unrecognized(_))
        ));
        assert!(matches!(
            instrument.write(&"current".into(), 1.0).await,
            Err(RelayError::Unrecognized(_))
        ));
        assert!(matches!(
            instrument.read(&"output".into()).await,
            Err(RelayError::Unrecognized(_))
        ));
    }

    #[tokio::test]
    async fn test_identity_is_cached() {
        let bus = MockBus::new("GPIB0::24::INSTR").with_reply("*IDN?", "KEITHLEY,2400,1,C30");
        let mut instrument = open(&bus).await;
        bus.clear_log();
        assert_eq!(instrument.identify().await.unwrap(), "KEITHLEY,2400,1,C30");
        assert!(bus.call_log().is_empty());
    }

    #[test]
    fn test_render_template() {
        assert_eq!(render_template("INP1:LEV {value}", 0.25).unwrap(), "INP1:LEV 0.25");
        assert!(matches!(
            render_template("SOUR:VOLT {volts}", 1.0),
            Err(RelayError::Configuration(_))
        ));
    }
}
