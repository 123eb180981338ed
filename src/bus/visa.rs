//! VISA bus for GPIB/USB/Ethernet instruments
//!
//! Wraps the `visa-rs` crate. VISA calls are blocking, so every operation runs
//! on Tokio's blocking pool with the session behind `Arc<Mutex>`. The bus
//! timeout is applied to the VISA session itself before each operation, so a
//! long acquisition wait is not cut short by the session default.
//!
//! Supports resource strings like:
//! - "GPIB0::1::INSTR" (GPIB interface)
//! - "USB0::0x1234::0x5678::SERIAL::INSTR" (USB)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)

use super::Bus;
use crate::error::RelayResult;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use crate::error::RelayError;
#[cfg(feature = "instrument_visa")]
use std::sync::{Arc, Mutex};
#[cfg(feature = "instrument_visa")]
use tracing::debug;

/// VISA bus
pub struct VisaBus {
    resource: String,
    timeout: Duration,
    terminator: String,
    #[cfg(feature = "instrument_visa")]
    instrument: Arc<Mutex<visa_rs::Instrument>>,
}

impl VisaBus {
    /// Set line terminator for commands
    pub fn with_terminator(mut self, terminator: String) -> Self {
        self.terminator = terminator;
        self
    }
}

#[cfg(feature = "instrument_visa")]
impl VisaBus {
    /// Open a VISA resource through the default resource manager.
    pub async fn open(resource: &str, timeout: Duration) -> RelayResult<Self> {
        use std::ffi::CString;
        use visa_rs::prelude::*;

        let resource_owned = resource.to_string();
        let instrument = tokio::task::spawn_blocking(move || {
            let rm = DefaultRM::new().map_err(|e| {
                RelayError::DeviceFault(format!("failed to create VISA resource manager: {e}"))
            })?;
            let c_string = CString::new(resource_owned.clone()).map_err(|_| {
                RelayError::Configuration(format!("invalid VISA resource '{resource_owned}'"))
            })?;
            let visa_string = VisaString::from(c_string);
            let instrument = rm
                .open(&visa_string, AccessMode::NO_LOCK, timeout)
                .map_err(|e| {
                    RelayError::DeviceFault(format!(
                        "failed to open VISA resource {resource_owned}: {e}"
                    ))
                })?;
            apply_session_timeout(&instrument, timeout)?;
            Ok::<_, RelayError>(instrument)
        })
        .await
        .map_err(|e| RelayError::DeviceFault(format!("VISA open task panicked: {e}")))??;

        debug!(resource, "VISA resource opened");
        Ok(Self {
            resource: resource.to_string(),
            timeout,
            terminator: "\n".to_string(),
            instrument: Arc::new(Mutex::new(instrument)),
        })
    }

    async fn run<T, F>(&self, command: &str, op: F) -> RelayResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut visa_rs::Instrument, &str) -> std::io::Result<T> + Send + 'static,
    {
        let instrument = Arc::clone(&self.instrument);
        let line = format!("{}{}", command, self.terminator);
        let timeout = self.timeout;
        let context = format!("'{command}' on {} after {timeout:?}", self.resource);
        let task_context = context.clone();

        let task = tokio::task::spawn_blocking(move || {
            let mut guard = instrument
                .lock()
                .map_err(|_| RelayError::DeviceFault("VISA session poisoned".to_string()))?;
            apply_session_timeout(&guard, timeout)?;
            op(&mut guard, &line).map_err(|e| RelayError::from_io(e, task_context))
        });

        // The VISA timeout bounds the blocking call; this is only a backstop.
        tokio::time::timeout(timeout.saturating_add(VISA_DEADLINE_GRACE), task)
            .await
            .map_err(|_| RelayError::Timeout(context))?
            .map_err(|e| RelayError::DeviceFault(format!("VISA I/O task panicked: {e}")))?
    }
}

#[cfg(feature = "instrument_visa")]
const VISA_DEADLINE_GRACE: Duration = Duration::from_secs(1);

/// `VI_ATTR_TMO_VALUE` for `timeout`. Durations beyond `u32` milliseconds
/// saturate to the infinite timeout.
#[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
fn session_timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

/// Set the session's own I/O timeout.
#[cfg(feature = "instrument_visa")]
fn apply_session_timeout(instrument: &visa_rs::Instrument, timeout: Duration) -> RelayResult<()> {
    use visa_rs::attribute::AttrTmoValue;
    use visa_rs::prelude::*;

    let millis = session_timeout_millis(timeout);
    let attr = AttrTmoValue::new_checked(millis).ok_or_else(|| {
        RelayError::Configuration(format!("VISA timeout of {millis} ms is out of range"))
    })?;
    instrument
        .set_attr(attr)
        .map_err(|e| RelayError::DeviceFault(format!("failed to set VISA timeout: {e}")))
}

#[cfg(not(feature = "instrument_visa"))]
impl VisaBus {
    pub async fn open(_resource: &str, _timeout: Duration) -> RelayResult<Self> {
        Err(crate::error::RelayError::FeatureNotEnabled(
            "instrument_visa".to_string(),
        ))
    }
}

#[async_trait]
impl Bus for VisaBus {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    #[cfg(feature = "instrument_visa")]
    async fn write(&mut self, command: &str) -> RelayResult<()> {
        use std::io::Write;

        self.run(command, |instr, line| {
            instr.write_all(line.as_bytes())?;
            instr.flush()
        })
        .await?;
        debug!(resource = %self.resource, command, "VISA write");
        Ok(())
    }

    #[cfg(feature = "instrument_visa")]
    async fn query(&mut self, command: &str) -> RelayResult<String> {
        use std::io::{BufRead, BufReader, Write};

        let reply = self
            .run(command, |instr, line| {
                instr.write_all(line.as_bytes())?;
                instr.flush()?;
                let mut reply = String::new();
                BufReader::new(&*instr).read_line(&mut reply)?;
                Ok(reply)
            })
            .await?;
        let reply = reply.trim().to_string();
        debug!(resource = %self.resource, command, reply = %reply, "VISA query");
        Ok(reply)
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn write(&mut self, _command: &str) -> RelayResult<()> {
        Err(crate::error::RelayError::FeatureNotEnabled(
            "instrument_visa".to_string(),
        ))
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn query(&mut self, _command: &str) -> RelayResult<String> {
        Err(crate::error::RelayError::FeatureNotEnabled(
            "instrument_visa".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_visa_requires_feature() {
        let result = VisaBus::open("GPIB0::1::INSTR", Duration::from_secs(1)).await;
        match result {
            Err(RelayError::FeatureNotEnabled(feature)) => assert_eq!(feature, "instrument_visa"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("VISA bus opened without the feature"),
        }
    }

    #[test]
    fn test_session_timeout_covers_long_acquisitions() {
        assert_eq!(session_timeout_millis(Duration::from_secs(600)), 600_000);
        assert_eq!(session_timeout_millis(Duration::from_millis(250)), 250);
        assert_eq!(
            session_timeout_millis(Duration::from_secs(u64::MAX)),
            u32::MAX
        );
    }

    #[test]
    fn test_timed_out_read_is_timeout_error() {
        let err = RelayError::from_io(
            std::io::Error::from(std::io::ErrorKind::TimedOut),
            "'*OPC?' on GPIB0::3::INSTR after 600s",
        );
        assert!(matches!(err, RelayError::Timeout(ref msg) if msg.contains("*OPC?")));
    }
}
