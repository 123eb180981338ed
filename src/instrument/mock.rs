//! A mock instrument backed by an in-memory channel store.
//!
//! Reads return the stored channel value, or the next queued reading when one
//! is queued (useful for sentinel/retry scenarios). Writes store and echo the
//! value. Clones share state, so a test can inspect the store after handing
//! the instrument to a relay.

use super::Instrument;
use crate::error::{RelayError, RelayResult};
use crate::relay::ChannelId;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

#[derive(Default)]
struct ChannelStore {
    values: HashMap<ChannelId, f32>,
    queued: HashMap<ChannelId, VecDeque<f32>>,
    reads: HashMap<ChannelId, u32>,
}

/// In-memory instrument for tests and dry runs.
#[derive(Clone)]
pub struct MockInstrument {
    name: String,
    latency: Duration,
    store: Arc<Mutex<ChannelStore>>,
    should_fail_next: Arc<AtomicBool>,
    call_log: Arc<Mutex<Vec<String>>>,
}

impl Default for MockInstrument {
    fn default() -> Self {
        Self::new("mock")
    }
}

impl MockInstrument {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            latency: Duration::ZERO,
            store: Arc::new(Mutex::new(ChannelStore::default())),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_value(self, channel: &str, value: f32) -> Self {
        self.set_value(channel, value);
        self
    }

    /// Simulated device latency per call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_value(&self, channel: &str, value: f32) {
        self.store().values.insert(ChannelId::from(channel), value);
    }

    pub fn value(&self, channel: &str) -> Option<f32> {
        self.store().values.get(&ChannelId::from(channel)).copied()
    }

    /// Queue readings returned (in order) before the stored value.
    pub fn queue_readings(&self, channel: &str, readings: &[f32]) {
        self.store()
            .queued
            .entry(ChannelId::from(channel))
            .or_default()
            .extend(readings.iter().copied());
    }

    /// How many reads `channel` has served.
    pub fn read_count(&self, channel: &str) -> u32 {
        self.store()
            .reads
            .get(&ChannelId::from(channel))
            .copied()
            .unwrap_or(0)
    }

    /// Make the next call fail with a device fault.
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    pub fn call_log(&self) -> Vec<String> {
        self.log().clone()
    }

    fn store(&self) -> MutexGuard<'_, ChannelStore> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn log(&self) -> MutexGuard<'_, Vec<String>> {
        self.call_log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate(&self, call: String) -> RelayResult<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        trace!(instrument = %self.name, call = %call, "Mock instrument call");
        self.log().push(call.clone());
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(RelayError::DeviceFault(format!("injected failure on {call}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Instrument for MockInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    async fn identify(&mut self) -> RelayResult<String> {
        self.simulate("identify".to_string()).await?;
        Ok(format!("Mock Instruments,{},0,1.0", self.name))
    }

    async fn read(&mut self, channel: &ChannelId) -> RelayResult<f32> {
        self.simulate(format!("read {channel}")).await?;

        let mut store = self.store();
        *store.reads.entry(channel.clone()).or_insert(0) += 1;

        if let Some(reading) = store
            .queued
            .get_mut(channel)
            .and_then(|queue| queue.pop_front())
        {
            return Ok(reading);
        }
        store
            .values
            .get(channel)
            .copied()
            .ok_or_else(|| RelayError::DeviceFault(format!("no such channel '{channel}'")))
    }

    async fn write(&mut self, channel: &ChannelId, value: f32) -> RelayResult<f32> {
        self.simulate(format!("write {channel} {value}")).await?;
        self.store().values.insert(channel.clone(), value);
        Ok(value)
    }
}
