//! Acquisition profiles and the SCPI each one emits.
//!
//! Counter profiles follow the Keysight 53200-series command set; the DC
//! profiles use the common DMM/source-meter `CONF` subsystem.

use super::options::MeasurementOptions;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reset to power-on defaults.
pub const RESET: &str = "*RST";
/// Start the configured acquisition.
pub const INITIATE: &str = "INIT";
/// Blocks until pending operations finish; replies `1`.
pub const OPERATION_COMPLETE: &str = "*OPC?";
/// Read back the acquired samples.
pub const FETCH: &str = "FETC?";

/// What a session measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementProfile {
    /// Single-period (interarrival) times on channel 1
    TimeInterval,
    Frequency,
    /// Event counts per gate
    Totalize,
    DcVoltage,
    DcCurrent,
}

impl MeasurementProfile {
    /// Whether the profile drives a counter front end (coupling, impedance,
    /// slope, threshold).
    pub fn uses_input_conditioning(self) -> bool {
        matches!(
            self,
            MeasurementProfile::TimeInterval
                | MeasurementProfile::Frequency
                | MeasurementProfile::Totalize
        )
    }

    /// Ordered configuration commands sent after the reset.
    pub fn configure_commands(self, options: &MeasurementOptions) -> Vec<String> {
        let mut commands = vec![match self {
            MeasurementProfile::TimeInterval => "CONF:SPER (@1)".to_string(),
            MeasurementProfile::Frequency => "CONF:FREQ (@1)".to_string(),
            MeasurementProfile::Totalize => {
                format!("CONF:TOT:TIM {},(@1)", options.gate_time_s)
            }
            MeasurementProfile::DcVoltage => "CONF:VOLT:DC".to_string(),
            MeasurementProfile::DcCurrent => "CONF:CURR:DC".to_string(),
        }];

        if self.uses_input_conditioning() {
            commands.push(format!("INP1:COUP {}", options.coupling));
            commands.push(format!("INP1:IMP {}", options.impedance_ohm));
            commands.push(format!("INP1:SLOP {}", options.slope));
            commands.push(format!("INP1:LEV {}", options.threshold_v));
        }

        if self == MeasurementProfile::Frequency {
            commands.push("FREQ:GATE:SOUR TIME".to_string());
            commands.push(format!("FREQ:GATE:TIME {}", options.gate_time_s));
        }

        commands.push(format!("SAMP:COUN {}", options.sample_count));
        commands
    }

    /// Unit of the fetched samples, written into output metadata.
    pub fn unit(self) -> &'static str {
        match self {
            MeasurementProfile::TimeInterval => "s",
            MeasurementProfile::Frequency => "Hz",
            MeasurementProfile::Totalize => "counts",
            MeasurementProfile::DcVoltage => "V",
            MeasurementProfile::DcCurrent => "A",
        }
    }
}

impl fmt::Display for MeasurementProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MeasurementProfile::TimeInterval => "time_interval",
            MeasurementProfile::Frequency => "frequency",
            MeasurementProfile::Totalize => "totalize",
            MeasurementProfile::DcVoltage => "dc_voltage",
            MeasurementProfile::DcCurrent => "dc_current",
        })
    }
}
