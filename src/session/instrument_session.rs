//! One configured instrument performing blocking acquisitions.

use super::options::MeasurementOptions;
use super::profile::{MeasurementProfile, FETCH, INITIATE, OPERATION_COMPLETE, RESET};
use crate::bus::Bus;
use crate::error::{RelayError, RelayResult};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// A bus resource held in a known measurement configuration.
///
/// The bus is released when the session is closed or dropped.
pub struct InstrumentSession {
    bus: Box<dyn Bus>,
    profile: MeasurementProfile,
    options: MeasurementOptions,
}

impl InstrumentSession {
    /// Reset the instrument and push the profile's configuration.
    ///
    /// The first failed write aborts and is returned; nothing already sent is
    /// undone.
    pub async fn open(
        mut bus: Box<dyn Bus>,
        profile: MeasurementProfile,
        options: MeasurementOptions,
    ) -> RelayResult<Self> {
        info!(resource = bus.resource(), %profile, "Opening instrument session");

        bus.write(RESET).await?;
        for command in profile.configure_commands(&options) {
            debug!(resource = bus.resource(), %command, "Configure");
            bus.write(&command).await?;
        }

        Ok(Self {
            bus,
            profile,
            options,
        })
    }

    pub fn profile(&self) -> MeasurementProfile {
        self.profile
    }

    pub fn options(&self) -> &MeasurementOptions {
        &self.options
    }

    pub fn bus(&self) -> &dyn Bus {
        self.bus.as_ref()
    }

    pub async fn identify(&mut self) -> RelayResult<String> {
        self.bus.query("*IDN?").await
    }

    /// Initiate, wait for completion, and fetch the samples.
    ///
    /// The completion wait is bounded by `options.timeout_ms`, not by the
    /// bus's own query timeout.
    #[instrument(skip(self), fields(resource = self.bus.resource(), profile = %self.profile))]
    pub async fn acquire(&mut self) -> RelayResult<Vec<f64>> {
        let started = Instant::now();
        self.bus.write(INITIATE).await?;

        let bus_timeout = self.bus.timeout();
        self.bus.set_timeout(self.options.timeout());
        let completion = self.bus.query(OPERATION_COMPLETE).await;
        self.bus.set_timeout(bus_timeout);

        match completion {
            Ok(reply) if reply.trim() != "1" => {
                warn!(reply = %reply.trim(), "Unexpected operation-complete reply");
            }
            Ok(_) => {}
            Err(RelayError::Timeout(detail)) => {
                return Err(RelayError::Timeout(format!(
                    "acquisition did not complete within {:?}: {detail}",
                    self.options.timeout()
                )));
            }
            Err(e) => return Err(e),
        }

        let reply = self.bus.query(FETCH).await?;
        let samples = parse_samples(&reply)?;
        info!(
            samples = samples.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Acquisition complete"
        );
        Ok(samples)
    }

    /// Release the bus.
    pub fn close(self) {
        info!(resource = self.bus.resource(), "Closing instrument session");
    }
}

/// Parse a comma-separated sample reply.
///
/// An empty reply is an empty list; any non-numeric field is a device fault.
pub fn parse_samples(reply: &str) -> RelayResult<Vec<f64>> {
    let reply = reply.trim();
    if reply.is_empty() {
        return Ok(Vec::new());
    }
    reply
        .split(',')
        .map(|field| {
            let field = field.trim();
            field.parse::<f64>().map_err(|_| {
                RelayError::DeviceFault(format!("non-numeric sample '{field}' in reply"))
            })
        })
        .collect()
}
