//! Single-writer device queue
//!
//! The relay serves every connection on its own task, but the instrument
//! underneath is a single session that must never see interleaved calls.
//! The dispatcher owns the instrument on one task and executes commands
//! FIFO from a bounded queue, answering each over a oneshot channel.
//!
//! ```no_run
//! use labrelay::instrument::MockInstrument;
//! use labrelay::relay::{Command, Dispatcher, DispatcherSettings};
//!
//! # async fn demo() -> labrelay::RelayResult<()> {
//! let instrument = MockInstrument::new("daq").with_value("ai0", 0.5);
//! let handle = Dispatcher::spawn(Box::new(instrument), DispatcherSettings::default());
//!
//! let value = handle.execute(Command::Read { channel: "ai0".into() }).await?;
//! assert_eq!(value, 0.5);
//!
//! let _instrument = handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use super::command::Command;
use crate::error::{RelayError, RelayResult};
use crate::instrument::Instrument;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Queue sizing and per-call device timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// Upper bound on one instrument call
    #[serde(default = "default_device_timeout", with = "humantime_serde")]
    pub device_timeout: Duration,
    /// Commands buffered before senders wait
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_device_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_queue_depth() -> usize {
    64
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            device_timeout: default_device_timeout(),
            queue_depth: default_queue_depth(),
        }
    }
}

enum Request {
    Execute {
        command: Command,
        response_tx: oneshot::Sender<RelayResult<f32>>,
    },
    Shutdown,
}

type DeviceTask = JoinHandle<Box<dyn Instrument>>;

/// Cloneable handle to the dispatcher task.
#[derive(Clone)]
pub struct DispatcherHandle {
    instrument_name: Arc<str>,
    command_tx: mpsc::Sender<Request>,
    task: Arc<Mutex<Option<DeviceTask>>>,
}

/// Spawns the task that owns an instrument.
pub struct Dispatcher;

impl Dispatcher {
    /// Move `instrument` onto a dedicated task and return a handle to it.
    pub fn spawn(instrument: Box<dyn Instrument>, settings: DispatcherSettings) -> DispatcherHandle {
        let instrument_name: Arc<str> = Arc::from(instrument.name());
        let (command_tx, command_rx) = mpsc::channel(settings.queue_depth.max(1));

        info!(
            instrument = %instrument_name,
            queue_depth = settings.queue_depth,
            device_timeout = ?settings.device_timeout,
            "Starting dispatcher"
        );
        let task = tokio::spawn(run_queue(instrument, command_rx, settings.device_timeout));

        DispatcherHandle {
            instrument_name,
            command_tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

impl DispatcherHandle {
    pub fn instrument_name(&self) -> &str {
        &self.instrument_name
    }

    /// Queue `command` and wait for the instrument's answer.
    pub async fn execute(&self, command: Command) -> RelayResult<f32> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(Request::Execute {
                command,
                response_tx,
            })
            .await
            .map_err(|_| RelayError::DispatcherClosed)?;
        response_rx.await.map_err(|_| RelayError::DispatcherClosed)?
    }

    /// Whether the dispatcher task is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.command_tx.is_closed()
    }

    /// Stop accepting commands and hand the instrument back.
    ///
    /// Commands queued before the shutdown are executed first; anything
    /// queued after it fails with [`RelayError::DispatcherClosed`]. Only the
    /// first caller receives the instrument.
    pub async fn shutdown(&self) -> RelayResult<Box<dyn Instrument>> {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(RelayError::DispatcherClosed)?;

        // A closed queue means the task already finished on its own.
        let _ = self.command_tx.send(Request::Shutdown).await;

        task.await.map_err(|e| {
            warn!(instrument = %self.instrument_name, error = %e, "Dispatcher task failed");
            RelayError::DispatcherClosed
        })
    }
}

async fn run_queue(
    mut instrument: Box<dyn Instrument>,
    mut command_rx: mpsc::Receiver<Request>,
    device_timeout: Duration,
) -> Box<dyn Instrument> {
    while let Some(request) = command_rx.recv().await {
        match request {
            Request::Execute {
                command,
                response_tx,
            } => {
                let result = execute_one(instrument.as_mut(), &command, device_timeout).await;
                if response_tx.send(result).is_err() {
                    debug!(?command, "Requester went away before the reply");
                }
            }
            Request::Shutdown => break,
        }
    }

    command_rx.close();
    while let Some(request) = command_rx.recv().await {
        if let Request::Execute { response_tx, .. } = request {
            let _ = response_tx.send(Err(RelayError::DispatcherClosed));
        }
    }

    if let Err(e) = instrument.close().await {
        warn!(instrument = instrument.name(), error = %e, "Instrument close failed");
    }
    info!(instrument = instrument.name(), "Dispatcher stopped");
    instrument
}

async fn execute_one(
    instrument: &mut dyn Instrument,
    command: &Command,
    device_timeout: Duration,
) -> RelayResult<f32> {
    let call = async {
        match command {
            Command::Read { channel } => instrument.read(channel).await,
            Command::Write { channel, value } => instrument.write(channel, *value).await,
        }
    };
    let result = tokio::time::timeout(device_timeout, call)
        .await
        .map_err(|_| {
            RelayError::Timeout(format!(
                "{} on '{}' exceeded {device_timeout:?}",
                command_verb(command),
                command.channel()
            ))
        })?;
    debug!(?command, ok = result.is_ok(), "Command executed");
    result
}

fn command_verb(command: &Command) -> &'static str {
    match command {
        Command::Read { .. } => "read",
        Command::Write { .. } => "write",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MockInstrument;

    fn settings(device_timeout: Duration) -> DispatcherSettings {
        DispatcherSettings {
            device_timeout,
            queue_depth: 8,
        }
    }

    #[tokio::test]
    async fn test_execute_read_and_write() {
        let mock = MockInstrument::new("daq").with_value("ai0", 0.25);
        let handle = Dispatcher::spawn(Box::new(mock.clone()), DispatcherSettings::default());

        let read = handle
            .execute(Command::Read {
                channel: "ai0".into(),
            })
            .await
            .unwrap();
        assert_eq!(read, 0.25);

        let written = handle
            .execute(Command::Write {
                channel: "ao0".into(),
                value: -1.5,
            })
            .await
            .unwrap();
        assert_eq!(written, -1.5);
        assert_eq!(mock.value("ao0"), Some(-1.5));
    }

    #[tokio::test]
    async fn test_commands_execute_in_arrival_order() {
        let mock = MockInstrument::new("daq").with_latency(Duration::from_millis(2));
        let handle = Dispatcher::spawn(Box::new(mock.clone()), settings(Duration::from_secs(1)));

        for value in [1.0, 2.0, 3.0] {
            handle
                .execute(Command::Write {
                    channel: "ao1".into(),
                    value,
                })
                .await
                .unwrap();
        }
        assert_eq!(
            mock.call_log(),
            vec!["write ao1 1", "write ao1 2", "write ao1 3"]
        );
    }

    #[tokio::test]
    async fn test_device_timeout() {
        let mock = MockInstrument::new("slow")
            .with_value("p", 1.0)
            .with_latency(Duration::from_millis(200));
        let handle = Dispatcher::spawn(Box::new(mock), settings(Duration::from_millis(20)));

        let result = handle
            .execute(Command::Read {
                channel: "p".into(),
            })
            .await;
        assert!(matches!(result, Err(RelayError::Timeout(_))));
        // The queue keeps serving after a timeout
        assert!(handle.is_running());
    }

    #[tokio::test]
    async fn test_device_errors_pass_through() {
        let handle = Dispatcher::spawn(
            Box::new(MockInstrument::new("daq")),
            DispatcherSettings::default(),
        );
        assert!(matches!(
            handle
                .execute(Command::Read {
                    channel: "ai9".into()
                })
                .await,
            Err(RelayError::DeviceFault(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_returns_instrument_and_closes_queue() {
        let handle = Dispatcher::spawn(
            Box::new(MockInstrument::new("counter").with_value("frequency", 10.0e6)),
            DispatcherSettings::default(),
        );
        let other = handle.clone();

        let instrument = handle.shutdown().await.unwrap();
        assert_eq!(instrument.name(), "counter");

        assert!(matches!(
            other
                .execute(Command::Read {
                    channel: "frequency".into()
                })
                .await,
            Err(RelayError::DispatcherClosed)
        ));
        assert!(matches!(
            other.shutdown().await,
            Err(RelayError::DispatcherClosed)
        ));
    }
}
