//! Relay command tokens and the closed `Command` enum.
//!
//! A relay request is plain text: a short token, optionally followed by a
//! value (`"I"`, `"AI0"`, `"SV 1.5"`). The [`CommandTable`] maps tokens to
//! [`Route`]s and decodes a request into a [`Command`] exactly once, at the
//! socket boundary. Everything downstream matches on `Command`.

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name of an instrument channel (e.g. `current`, `ai0`, `setpoint`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Wrap a channel name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A decoded relay request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Read the current value of a channel.
    Read { channel: ChannelId },
    /// Apply a value to a channel; the reply echoes the applied value.
    Write { channel: ChannelId, value: f32 },
}

impl Command {
    /// The channel the command addresses.
    pub fn channel(&self) -> &ChannelId {
        match self {
            Command::Read { channel } | Command::Write { channel, .. } => channel,
        }
    }
}

/// What a token does in a given relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Read(ChannelId),
    Write(ChannelId),
}

/// Direction of a configured command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    Read,
    Write,
}

/// One `[[relay.commands]]` entry in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub token: String,
    pub route: RouteKind,
    pub channel: ChannelId,
}

impl CommandEntry {
    pub fn to_route(&self) -> Route {
        match self.route {
            RouteKind::Read => Route::Read(self.channel.clone()),
            RouteKind::Write => Route::Write(self.channel.clone()),
        }
    }
}

/// Built-in token tables for the instrument families the relay fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    SourceMeter,
    DaqCard,
    Spectrometer,
    TemperatureController,
    VacuumGauge,
    FrequencyCounter,
}

impl Preset {
    /// The token table for this preset.
    pub fn table(self) -> CommandTable {
        let mut table = CommandTable::new();
        match self {
            Preset::SourceMeter => {
                table.insert("I", Route::Read("current".into()));
                table.insert("V", Route::Read("voltage".into()));
                table.insert("SV", Route::Write("voltage".into()));
                table.insert("SI", Route::Write("current".into()));
            }
            Preset::DaqCard => {
                for idx in 0..4 {
                    table.insert(
                        &format!("AI{idx}"),
                        Route::Read(ChannelId::new(format!("ai{idx}"))),
                    );
                }
                for idx in 0..2 {
                    table.insert(
                        &format!("AO{idx}"),
                        Route::Write(ChannelId::new(format!("ao{idx}"))),
                    );
                }
            }
            Preset::Spectrometer => {
                table.insert("LM", Route::Read("peak_wavelength".into()));
                table.insert("PK", Route::Read("peak_intensity".into()));
            }
            Preset::TemperatureController => {
                table.insert("T", Route::Read("temperature".into()));
                table.insert("ST", Route::Write("setpoint".into()));
            }
            Preset::VacuumGauge => {
                table.insert("P", Route::Read("pressure".into()));
            }
            Preset::FrequencyCounter => {
                table.insert("F", Route::Read("frequency".into()));
            }
        }
        table
    }
}

/// Token → route mapping with longest-prefix decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTable {
    routes: BTreeMap<String, Route>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from a preset (if any) overlaid with explicit entries.
    pub fn from_entries(preset: Option<Preset>, entries: &[CommandEntry]) -> Self {
        let mut table = preset.map(Preset::table).unwrap_or_default();
        for entry in entries {
            table.insert(&entry.token, entry.to_route());
        }
        table
    }

    /// Register a token, replacing any previous route for it.
    pub fn insert(&mut self, token: &str, route: Route) -> Option<Route> {
        self.routes.insert(token.to_string(), route)
    }

    /// Route registered for exactly `token`.
    pub fn route(&self, token: &str) -> Option<&Route> {
        self.routes.get(token)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Decode a request into a `Command`.
    ///
    /// Surrounding whitespace is ignored. The longest token that prefixes the
    /// request wins. A read must have nothing after its token; a write must be
    /// followed by a float.
    pub fn decode(&self, request: &str) -> RelayResult<Command> {
        let request = request.trim();

        let (token, route) = self
            .routes
            .iter()
            .filter(|(token, _)| !token.is_empty() && request.starts_with(token.as_str()))
            .max_by_key(|(token, _)| token.len())
            .ok_or_else(|| RelayError::Unrecognized(request.to_string()))?;

        let remainder = request[token.len()..].trim();

        match route {
            Route::Read(channel) => {
                if !remainder.is_empty() {
                    return Err(RelayError::Unrecognized(request.to_string()));
                }
                Ok(Command::Read {
                    channel: channel.clone(),
                })
            }
            Route::Write(channel) => {
                if remainder.is_empty() {
                    return Err(RelayError::InvalidArgument(format!(
                        "'{token}' requires a value"
                    )));
                }
                let value = remainder.parse::<f32>().map_err(|_| {
                    RelayError::InvalidArgument(format!(
                        "'{remainder}' is not a number for '{token}'"
                    ))
                })?;
                Ok(Command::Write {
                    channel: channel.clone(),
                    value,
                })
            }
        }
    }
}

/// Encode a client request: `TOKEN` or `TOKEN VALUE`.
pub fn encode_request(token: &str, value: Option<f32>) -> String {
    match value {
        Some(value) => format!("{token} {value}"),
        None => token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_preset_token_routes_to_one_command() {
        for preset in [
            Preset::SourceMeter,
            Preset::DaqCard,
            Preset::Spectrometer,
            Preset::TemperatureController,
            Preset::VacuumGauge,
            Preset::FrequencyCounter,
        ] {
            let table = preset.table();
            assert!(!table.is_empty());
            for token in table.tokens() {
                let request = match table.route(token) {
                    Some(Route::Read(_)) => token.to_string(),
                    Some(Route::Write(_)) => format!("{token} 1.0"),
                    None => unreachable!(),
                };
                let command = table.decode(&request).unwrap();
                let expected = match table.route(token).unwrap() {
                    Route::Read(ch) | Route::Write(ch) => ch,
                };
                assert_eq!(command.channel(), expected, "token {token}");
            }
        }
    }

    #[test]
    fn test_decode_read_trims_whitespace() {
        let table = Preset::SourceMeter.table();
        assert_eq!(
            table.decode("  I\r\n").unwrap(),
            Command::Read {
                channel: "current".into()
            }
        );
    }

    #[test]
    fn test_decode_write_with_and_without_space() {
        let table = Preset::DaqCard.table();
        assert_eq!(
            table.decode("AO1 2.5").unwrap(),
            Command::Write {
                channel: "ao1".into(),
                value: 2.5
            }
        );
        assert_eq!(
            table.decode("AO0-0.75").unwrap(),
            Command::Write {
                channel: "ao0".into(),
                value: -0.75
            }
        );
    }

    #[test]
    fn test_longest_token_wins() {
        let table = Preset::SourceMeter.table();
        // "SV" must not be read as "S" + "V" or as "V".
        assert!(matches!(
            table.decode("SV 3").unwrap(),
            Command::Write { value, .. } if value == 3.0
        ));
        assert!(matches!(
            table.decode("V").unwrap(),
            Command::Read { channel } if channel.as_str() == "voltage"
        ));
    }

    #[test]
    fn test_tokens_are_case_sensitive() {
        let table = Preset::Spectrometer.table();
        assert!(matches!(
            table.decode("lm"),
            Err(RelayError::Unrecognized(_))
        ));
    }

    #[test]
    fn test_unknown_token() {
        let table = Preset::SourceMeter.table();
        match table.decode("XYZ") {
            Err(RelayError::Unrecognized(text)) => assert_eq!(text, "XYZ"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(table.decode(""), Err(RelayError::Unrecognized(_))));
    }

    #[test]
    fn test_read_with_trailing_text_is_unrecognized() {
        let table = Preset::VacuumGauge.table();
        assert!(matches!(
            table.decode("P 12"),
            Err(RelayError::Unrecognized(_))
        ));
    }

    #[test]
    fn test_write_without_value() {
        let table = Preset::TemperatureController.table();
        assert!(matches!(
            table.decode("ST"),
            Err(RelayError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.decode("ST warm"),
            Err(RelayError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_entries_override_preset() {
        let entries = vec![
            CommandEntry {
                token: "I".to_string(),
                route: RouteKind::Read,
                channel: "ammeter".into(),
            },
            CommandEntry {
                token: "R".to_string(),
                route: RouteKind::Read,
                channel: "resistance".into(),
            },
        ];
        let table = CommandTable::from_entries(Some(Preset::SourceMeter), &entries);
        assert_eq!(table.len(), 5);
        assert_eq!(table.route("I"), Some(&Route::Read("ammeter".into())));
        assert_eq!(table.route("R"), Some(&Route::Read("resistance".into())));
    }

    #[test]
    fn test_encode_request_round_trips_through_decode() {
        let table = Preset::DaqCard.table();
        let request = encode_request("AO0", Some(1.0e-3));
        assert_eq!(
            table.decode(&request).unwrap(),
            Command::Write {
                channel: "ao0".into(),
                value: 1.0e-3
            }
        );
        assert_eq!(encode_request("AI2", None), "AI2");
    }

    #[test]
    fn test_command_entry_deserializes_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            commands: Vec<CommandEntry>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[commands]]
            token = "LM"
            route = "read"
            channel = "peak_wavelength"

            [[commands]]
            token = "SP"
            route = "write"
            channel = "integration_time"
            "#,
        )
        .unwrap();
        assert_eq!(doc.commands[0].to_route(), Route::Read("peak_wavelength".into()));
        assert_eq!(doc.commands[1].to_route(), Route::Write("integration_time".into()));
    }
}
