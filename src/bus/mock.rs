//! Mock bus for testing
//!
//! Provides a simulated instrument bus without hardware:
//! - Scripted replies per query command (fixed or queued)
//! - Controllable failure and timeout injection
//! - Call log for verifying command order

use super::Bus;
use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct Script {
    fixed: HashMap<String, String>,
    queued: HashMap<String, VecDeque<String>>,
}

/// Mock bus
///
/// Clones share the same script and call log, so a test can keep a clone
/// after handing the bus to a session.
///
/// # Example
///
/// ```
/// use labrelay::bus::MockBus;
///
/// let bus = MockBus::new("MOCK::INSTR").with_reply("*IDN?", "Mock,Counter,0,1.0");
/// assert!(bus.call_log().is_empty());
/// ```
#[derive(Clone)]
pub struct MockBus {
    resource: String,
    timeout: Duration,
    latency: Duration,
    script: Arc<Mutex<Script>>,
    call_log: Arc<Mutex<Vec<String>>>,
    should_fail_next: Arc<AtomicBool>,
    should_time_out_next: Arc<AtomicBool>,
}

impl MockBus {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            timeout: Duration::from_secs(5),
            latency: Duration::ZERO,
            script: Arc::new(Mutex::new(Script::default())),
            call_log: Arc::new(Mutex::new(Vec::new())),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            should_time_out_next: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Simulated latency per operation
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Answer `command` with `reply` every time it is queried.
    pub fn with_reply(self, command: &str, reply: &str) -> Self {
        self.set_reply(command, reply);
        self
    }

    /// Answer `command` with `reply` from now on.
    pub fn set_reply(&self, command: &str, reply: &str) {
        self.script()
            .fixed
            .insert(command.to_string(), reply.to_string());
    }

    /// Queue one-shot replies for `command`; they are used before the fixed reply.
    pub fn queue_replies(&self, command: &str, replies: &[&str]) {
        self.script()
            .queued
            .entry(command.to_string())
            .or_default()
            .extend(replies.iter().map(|r| r.to_string()));
    }

    /// Make the next operation fail with a device fault.
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Make the next query time out.
    pub fn inject_next_timeout(&self) {
        self.should_time_out_next.store(true, Ordering::SeqCst);
    }

    /// Every command written or queried, in order.
    pub fn call_log(&self) -> Vec<String> {
        self.log().clone()
    }

    pub fn clear_log(&self) {
        self.log().clear();
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn log(&self) -> MutexGuard<'_, Vec<String>> {
        self.call_log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate(&self, command: &str) -> RelayResult<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.log().push(command.to_string());
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(RelayError::DeviceFault(format!(
                "injected failure on '{command}'"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Bus for MockBus {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn write(&mut self, command: &str) -> RelayResult<()> {
        self.simulate(command).await
    }

    async fn query(&mut self, command: &str) -> RelayResult<String> {
        self.simulate(command).await?;

        if self.should_time_out_next.swap(false, Ordering::SeqCst) {
            return Err(RelayError::Timeout(format!(
                "'{command}' on {} after {:?}",
                self.resource, self.timeout
            )));
        }

        let mut script = self.script();
        if let Some(reply) = script
            .queued
            .get_mut(command)
            .and_then(|queue| queue.pop_front())
        {
            return Ok(reply);
        }
        if let Some(reply) = script.fixed.get(command) {
            return Ok(reply.clone());
        }
        Ok(match command {
            "*IDN?" => "Mock Instruments,Model 0,SN0,1.0".to_string(),
            "*OPC?" => "1".to_string(),
            _ => String::new(),
        })
    }
}
