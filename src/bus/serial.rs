//! Serial bus for RS-232/USB-serial instruments
//!
//! Temperature controllers and vacuum gauges mostly sit on a serial line.
//! The `serialport` crate is blocking, so I/O runs on Tokio's blocking pool.
//! Pending input is discarded before every query, so a reply that arrived
//! after an earlier timeout is never read as the answer to a new command.

use super::Bus;
use crate::error::RelayResult;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use crate::error::RelayError;
#[cfg(feature = "instrument_serial")]
use serialport::{ClearBuffer, SerialPort};
#[cfg(feature = "instrument_serial")]
use std::io::{Read, Write};
#[cfg(feature = "instrument_serial")]
use std::sync::{Arc, Mutex};
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// Serial bus
pub struct SerialBus {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,
    timeout: Duration,
    /// Line terminator for commands (e.g., "\r\n")
    terminator: String,
    /// Response line ending character
    response_delimiter: u8,
    #[cfg(feature = "instrument_serial")]
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl SerialBus {
    /// Set line terminator for commands
    pub fn with_terminator(mut self, terminator: String) -> Self {
        self.terminator = terminator;
        self
    }

    /// Set response delimiter byte
    pub fn with_response_delimiter(mut self, delimiter: u8) -> Self {
        self.response_delimiter = delimiter;
        self
    }
}

#[cfg(feature = "instrument_serial")]
impl SerialBus {
    /// Open `port_name` at `baud_rate`.
    pub async fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> RelayResult<Self> {
        let name = port_name.to_string();
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&name, baud_rate)
                .timeout(timeout)
                .open()
                .map_err(|e| RelayError::DeviceFault(format!("failed to open serial port {name}: {e}")))
        })
        .await
        .map_err(|e| RelayError::DeviceFault(format!("serial open task panicked: {e}")))??;

        debug!(port = port_name, baud_rate, "Serial port opened");
        Ok(Self {
            port_name: port_name.to_string(),
            timeout,
            terminator: "\r\n".to_string(),
            response_delimiter: b'\n',
            port: Arc::new(Mutex::new(port)),
        })
    }

    fn lock_port(
        port: &Arc<Mutex<Box<dyn SerialPort>>>,
    ) -> RelayResult<std::sync::MutexGuard<'_, Box<dyn SerialPort>>> {
        port.lock()
            .map_err(|_| RelayError::DeviceFault("serial port poisoned".to_string()))
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl SerialBus {
    pub async fn open(_port_name: &str, _baud_rate: u32, _timeout: Duration) -> RelayResult<Self> {
        Err(crate::error::RelayError::FeatureNotEnabled(
            "instrument_serial".to_string(),
        ))
    }
}

#[async_trait]
impl Bus for SerialBus {
    fn resource(&self) -> &str {
        &self.port_name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    #[cfg(feature = "instrument_serial")]
    async fn write(&mut self, command: &str) -> RelayResult<()> {
        let port = Arc::clone(&self.port);
        let line = format!("{}{}", command, self.terminator);

        tokio::task::spawn_blocking(move || {
            let mut port = SerialBus::lock_port(&port)?;
            port.write_all(line.as_bytes())?;
            port.flush()?;
            Ok::<(), RelayError>(())
        })
        .await
        .map_err(|e| RelayError::DeviceFault(format!("serial write task panicked: {e}")))??;

        debug!(port = %self.port_name, command, "Serial write");
        Ok(())
    }

    #[cfg(feature = "instrument_serial")]
    async fn query(&mut self, command: &str) -> RelayResult<String> {
        let port = Arc::clone(&self.port);
        let line = format!("{}{}", command, self.terminator);
        let delimiter = self.response_delimiter;
        let timeout = self.timeout;
        let port_name = self.port_name.clone();
        let command_owned = command.to_string();

        let reply = tokio::task::spawn_blocking(move || {
            let mut port = SerialBus::lock_port(&port)?;
            port.set_timeout(timeout)
                .map_err(|e| RelayError::DeviceFault(e.to_string()))?;
            port.clear(ClearBuffer::Input)
                .map_err(|e| RelayError::DeviceFault(e.to_string()))?;
            port.write_all(line.as_bytes())?;
            port.flush()?;

            let mut response = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                match port.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        response.extend_from_slice(&buf[..n]);
                        if buf[..n].contains(&delimiter) {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        return Err(RelayError::Timeout(format!(
                            "'{command_owned}' on {port_name} after {timeout:?}"
                        )));
                    }
                    Err(e) => return Err(RelayError::Io(e)),
                }
            }
            Ok(String::from_utf8_lossy(&response).trim().to_string())
        })
        .await
        .map_err(|e| RelayError::DeviceFault(format!("serial query task panicked: {e}")))??;

        debug!(port = %self.port_name, command, reply = %reply, "Serial query");
        Ok(reply)
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn write(&mut self, _command: &str) -> RelayResult<()> {
        Err(crate::error::RelayError::FeatureNotEnabled(
            "instrument_serial".to_string(),
        ))
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn query(&mut self, _command: &str) -> RelayResult<String> {
        Err(crate::error::RelayError::FeatureNotEnabled(
            "instrument_serial".to_string(),
        ))
    }
}
