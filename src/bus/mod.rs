//! Instrument bus backends
//!
//! A [`Bus`] moves SCPI-style command strings to an instrument and reads its
//! replies. Sessions and SCPI-backed relay instruments only ever talk to
//! hardware through this trait.
//!
//! Backends:
//! - [`MockBus`] - scripted replies and a call log, for tests and dry runs
//! - [`TcpBus`] - raw SCPI socket (LXI instruments, usually port 5025)
//! - [`VisaBus`] - GPIB/USB/LAN via VISA (`instrument_visa` feature)
//! - [`SerialBus`] - RS-232/USB-serial (`instrument_serial` feature)

use crate::error::RelayResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod mock;
pub mod serial;
pub mod tcp;
pub mod visa;

pub use mock::MockBus;
pub use serial::SerialBus;
pub use tcp::TcpBus;
pub use visa::VisaBus;

/// Async command/response transport to one instrument.
#[async_trait]
pub trait Bus: Send {
    /// Resource the bus is attached to (VISA string, `host:port`, port name).
    fn resource(&self) -> &str;

    /// Current timeout applied to each query.
    fn timeout(&self) -> Duration;

    /// Change the timeout applied to subsequent queries.
    fn set_timeout(&mut self, timeout: Duration);

    /// Send a command without reading a reply.
    async fn write(&mut self, command: &str) -> RelayResult<()>;

    /// Send a command and read one reply line (trimmed).
    async fn query(&mut self, command: &str) -> RelayResult<String>;
}

/// Which backend a bus uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    Mock,
    Tcp,
    Visa,
    Serial,
}

/// Bus settings as they appear in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    pub kind: BusKind,
    /// VISA resource string, `host:port` or serial port name
    #[serde(default)]
    pub resource: String,
    /// Per-query timeout
    #[serde(default = "default_bus_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Appended to every command
    #[serde(default = "default_terminator")]
    pub terminator: String,
    /// Serial only
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Serial only: the byte that ends a reply
    #[serde(default = "default_response_delimiter")]
    pub response_delimiter: String,
}

fn default_bus_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_terminator() -> String {
    "\n".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_response_delimiter() -> String {
    "\n".to_string()
}

impl BusSettings {
    /// Settings for a mock bus, mostly useful in tests.
    pub fn mock() -> Self {
        Self {
            kind: BusKind::Mock,
            resource: "MOCK::INSTR".to_string(),
            timeout: default_bus_timeout(),
            terminator: default_terminator(),
            baud_rate: default_baud_rate(),
            response_delimiter: default_response_delimiter(),
        }
    }

    /// The reply delimiter as a single byte.
    pub fn response_delimiter_byte(&self) -> RelayResult<u8> {
        match self.response_delimiter.as_bytes() {
            [byte] => Ok(*byte),
            _ => Err(crate::error::RelayError::Configuration(format!(
                "response_delimiter must be a single byte, got {:?}",
                self.response_delimiter
            ))),
        }
    }
}

/// Open the backend selected by `settings.kind`.
pub async fn open_bus(settings: &BusSettings) -> RelayResult<Box<dyn Bus>> {
    let bus: Box<dyn Bus> = match settings.kind {
        BusKind::Mock => Box::new(
            MockBus::new(settings.resource.clone()).with_timeout(settings.timeout),
        ),
        BusKind::Tcp => Box::new(
            TcpBus::connect(&settings.resource, settings.timeout)
                .await?
                .with_terminator(settings.terminator.clone()),
        ),
        BusKind::Visa => Box::new(
            VisaBus::open(&settings.resource, settings.timeout)
                .await?
                .with_terminator(settings.terminator.clone()),
        ),
        BusKind::Serial => Box::new(
            SerialBus::open(&settings.resource, settings.baud_rate, settings.timeout)
                .await?
                .with_terminator(settings.terminator.clone())
                .with_response_delimiter(settings.response_delimiter_byte()?),
        ),
    };
    tracing::debug!(
        resource = %settings.resource,
        kind = ?settings.kind,
        "Bus opened"
    );
    Ok(bus)
}

/// Parse the first comma-separated field of an instrument reply as a float.
///
/// Instruments commonly answer `+1.234E-06` or `+1.234E-06,+0.000E+00,...`.
pub fn parse_first_value(reply: &str) -> RelayResult<f64> {
    let field = reply.split(',').next().unwrap_or("").trim();
    field.parse::<f64>().map_err(|_| {
        crate::error::RelayError::DeviceFault(format!("non-numeric reply '{}'", reply.trim()))
    })
}
