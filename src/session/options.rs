//! Measurement options shared by every acquisition profile.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Trigger slope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Slope {
    #[default]
    #[serde(rename = "POS")]
    Positive,
    #[serde(rename = "NEG")]
    Negative,
}

impl fmt::Display for Slope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Slope::Positive => "POS",
            Slope::Negative => "NEG",
        })
    }
}

/// Input coupling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Coupling {
    #[default]
    #[serde(rename = "DC")]
    Dc,
    #[serde(rename = "AC")]
    Ac,
}

impl fmt::Display for Coupling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Coupling::Dc => "DC",
            Coupling::Ac => "AC",
        })
    }
}

/// Input impedance; instruments accept only 50 Ω or 1 MΩ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub enum Impedance {
    #[default]
    Fifty,
    OneMeg,
}

impl Impedance {
    pub fn ohms(self) -> f64 {
        match self {
            Impedance::Fifty => 50.0,
            Impedance::OneMeg => 1.0e6,
        }
    }
}

impl TryFrom<f64> for Impedance {
    type Error = String;

    fn try_from(ohms: f64) -> Result<Self, Self::Error> {
        if ohms == 50.0 {
            Ok(Impedance::Fifty)
        } else if ohms == 1.0e6 {
            Ok(Impedance::OneMeg)
        } else {
            Err(format!("impedance must be 50 or 1e6 ohm, got {ohms}"))
        }
    }
}

impl From<Impedance> for f64 {
    fn from(value: Impedance) -> Self {
        value.ohms()
    }
}

impl fmt::Display for Impedance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Impedance::Fifty => f.write_str("50"),
            Impedance::OneMeg => f.write_str("1E6"),
        }
    }
}

/// Scalar configuration of one acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementOptions {
    #[serde(default)]
    pub slope: Slope,
    /// Trigger threshold in volts
    #[serde(default)]
    pub threshold_v: f64,
    #[serde(default)]
    pub coupling: Coupling,
    #[serde(default)]
    pub impedance_ohm: Impedance,
    /// Upper bound on the wait for an acquisition to complete
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_sample_count")]
    pub sample_count: u32,
    /// Gate time for frequency and totalize profiles
    #[serde(default = "default_gate_time_s")]
    pub gate_time_s: f64,
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_sample_count() -> u32 {
    1
}

fn default_gate_time_s() -> f64 {
    1.0
}

impl Default for MeasurementOptions {
    fn default() -> Self {
        Self {
            slope: Slope::default(),
            threshold_v: 0.0,
            coupling: Coupling::default(),
            impedance_ohm: Impedance::default(),
            timeout_ms: default_timeout_ms(),
            sample_count: default_sample_count(),
            gate_time_s: default_gate_time_s(),
        }
    }
}

impl MeasurementOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
