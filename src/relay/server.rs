//! Measurement relay server
//!
//! Exposes one instrument over TCP. Each accepted connection carries exactly
//! one request (`TOKEN` or `TOKEN VALUE`) and receives exactly one reply,
//! after which the server closes it. Connections are served on their own
//! tasks; device access goes through the [`DispatcherHandle`].
//!
//! ```text
//! Stopped ──bind/run──▶ Listening ──accept──▶ [Receive → Dispatch → Reply → Close]
//!    ▲                      │
//!    └──────shutdown────────┘
//! ```

use super::codec::{Framing, Reply};
use super::command::{CommandEntry, CommandTable, Preset};
use super::dispatcher::{DispatcherHandle, DispatcherSettings};
use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// `[relay]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "default_host")]
    pub host: String,
    /// `0` binds an ephemeral port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum request size read from a connection
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub framing: Framing,
    #[serde(default)]
    pub preset: Option<Preset>,
    /// Extra or overriding tokens on top of the preset
    #[serde(default)]
    pub commands: Vec<CommandEntry>,
    /// Upper bound on one instrument call
    #[serde(default = "default_device_timeout", with = "humantime_serde")]
    pub device_timeout: Duration,
    /// Connections idle longer than this are closed without a reply
    #[serde(default = "default_connection_timeout", with = "humantime_serde")]
    pub connection_timeout: Duration,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5050
}

fn default_buffer_size() -> usize {
    1024
}

fn default_device_timeout() -> Duration {
    DispatcherSettings::default().device_timeout
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_queue_depth() -> usize {
    DispatcherSettings::default().queue_depth
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            buffer_size: default_buffer_size(),
            framing: Framing::default(),
            preset: None,
            commands: Vec::new(),
            device_timeout: default_device_timeout(),
            connection_timeout: default_connection_timeout(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl RelaySettings {
    /// Settings for an ephemeral-port relay with the given preset.
    pub fn ephemeral(preset: Preset) -> Self {
        Self {
            port: 0,
            preset: Some(preset),
            ..Self::default()
        }
    }

    /// `host:port` to bind.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Preset tokens overlaid with the configured commands.
    pub fn command_table(&self) -> CommandTable {
        CommandTable::from_entries(self.preset, &self.commands)
    }

    pub fn dispatcher(&self) -> DispatcherSettings {
        DispatcherSettings {
            device_timeout: self.device_timeout,
            queue_depth: self.queue_depth,
        }
    }
}

/// Lifecycle state published by a running server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Stopped,
    Listening,
}

struct ConnectionContext {
    table: CommandTable,
    dispatcher: DispatcherHandle,
    framing: Framing,
    buffer_size: usize,
    connection_timeout: Duration,
}

/// A bound relay listener, ready to run.
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: Arc<ConnectionContext>,
    state_tx: watch::Sender<RelayState>,
}

impl RelayServer {
    /// Bind the listening socket.
    pub async fn bind(settings: &RelaySettings, dispatcher: DispatcherHandle) -> RelayResult<Self> {
        let table = settings.command_table();
        if table.is_empty() {
            return Err(RelayError::Configuration(
                "relay has no command tokens; set relay.preset or relay.commands".to_string(),
            ));
        }

        let listener = TcpListener::bind(settings.bind_address()).await?;
        let local_addr = listener.local_addr()?;
        let (state_tx, _) = watch::channel(RelayState::Stopped);

        info!(
            %local_addr,
            instrument = dispatcher.instrument_name(),
            framing = ?settings.framing,
            tokens = ?table.tokens().collect::<Vec<_>>(),
            "Relay bound"
        );

        Ok(Self {
            listener,
            local_addr,
            context: Arc::new(ConnectionContext {
                table,
                dispatcher,
                framing: settings.framing,
                buffer_size: settings.buffer_size.max(1),
                connection_timeout: settings.connection_timeout,
            }),
            state_tx,
        })
    }

    /// Address actually bound; differs from the settings for port `0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribe to state changes.
    pub fn state(&self) -> watch::Receiver<RelayState> {
        self.state_tx.subscribe()
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Connections already accepted finish on their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> RelayResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        self.state_tx.send_replace(RelayState::Listening);
        info!(local_addr = %self.local_addr, "Relay listening");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let context = Arc::clone(&self.context);
                        tokio::spawn(
                            handle_connection(stream, context)
                                .instrument(info_span!("connection", %peer)),
                        );
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }

        self.state_tx.send_replace(RelayState::Stopped);
        info!(local_addr = %self.local_addr, "Relay stopped");
        Ok(())
    }

    /// Run the accept loop on a background task.
    pub fn spawn(self) -> RelayHandle {
        let local_addr = self.local_addr;
        let state = self.state();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run_until(async move {
            let _ = shutdown_rx.await;
        }));
        RelayHandle {
            local_addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }
}

/// Control handle for a server started with [`RelayServer::spawn`].
pub struct RelayHandle {
    local_addr: SocketAddr,
    state: watch::Receiver<RelayState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<RelayResult<()>>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Wait until the accept loop is running.
    pub async fn listening(&mut self) -> RelayResult<()> {
        self.state
            .wait_for(|state| *state == RelayState::Listening)
            .await
            .map(|_| ())
            .map_err(|_| RelayError::Configuration("relay task ended before listening".to_string()))
    }

    /// Stop accepting and wait for the accept loop to exit.
    pub async fn shutdown(mut self) -> RelayResult<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Relay task panicked");
                Err(RelayError::Io(std::io::Error::other(e.to_string())))
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, context: Arc<ConnectionContext>) {
    if let Err(e) = serve_one(&mut stream, &context).await {
        warn!(error = %e, "Connection ended with an error");
    }
    let _ = stream.shutdown().await;
}

async fn serve_one(stream: &mut TcpStream, context: &ConnectionContext) -> RelayResult<()> {
    let mut buf = vec![0u8; context.buffer_size];
    let read = match tokio::time::timeout(context.connection_timeout, stream.read(&mut buf)).await {
        Ok(read) => read?,
        Err(_) => {
            debug!(timeout = ?context.connection_timeout, "Idle connection closed");
            return Ok(());
        }
    };
    if read == 0 {
        debug!("Peer closed without a request");
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buf[..read]);
    let request = request.trim();

    let result = match context.table.decode(request) {
        Ok(command) => context.dispatcher.execute(command).await,
        Err(e) => Err(e),
    };
    match &result {
        Ok(value) => debug!(request, value, "Request served"),
        Err(e) => warn!(request, error = %e, "Request failed"),
    }

    let reply = Reply::from_result(&result).encode(context.framing);
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MockInstrument;
    use crate::relay::codec::{decode_reply, ReplyStatus};
    use crate::relay::dispatcher::Dispatcher;

    async fn start(settings: RelaySettings, mock: MockInstrument) -> RelayHandle {
        let dispatcher = Dispatcher::spawn(Box::new(mock), settings.dispatcher());
        let mut handle = RelayServer::bind(&settings, dispatcher).await.unwrap().spawn();
        handle.listening().await.unwrap();
        handle
    }

    async fn roundtrip(addr: SocketAddr, request: &str) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_framed_read_reply() {
        let mock = MockInstrument::new("gauge").with_value("pressure", 1.0e-7);
        let handle = start(RelaySettings::ephemeral(Preset::VacuumGauge), mock).await;

        let reply = roundtrip(handle.local_addr(), "P\n").await;
        assert_eq!(decode_reply(&reply, Framing::Framed).unwrap(), Reply::Value(1.0e-7));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_legacy_unknown_token_text() {
        let settings = RelaySettings {
            framing: Framing::Legacy,
            ..RelaySettings::ephemeral(Preset::Spectrometer)
        };
        let handle = start(settings, MockInstrument::new("spec")).await;

        let reply = roundtrip(handle.local_addr(), "XYZ").await;
        assert_eq!(reply, b"ERROR: unrecognized command 'XYZ'");
        assert_eq!(handle.state(), RelayState::Listening);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_keeps_serving_after_unknown_token() {
        let mock = MockInstrument::new("gauge").with_value("pressure", 2.0e-6);
        let handle = start(RelaySettings::ephemeral(Preset::VacuumGauge), mock).await;

        let reply = roundtrip(handle.local_addr(), "PX").await;
        assert!(matches!(
            decode_reply(&reply, Framing::Framed).unwrap(),
            Reply::Error { status: ReplyStatus::Unrecognized, .. }
        ));

        let reply = roundtrip(handle.local_addr(), "P").await;
        assert_eq!(decode_reply(&reply, Framing::Framed).unwrap(), Reply::Value(2.0e-6));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_without_value_is_invalid_argument() {
        let mock = MockInstrument::new("smu");
        let handle = start(RelaySettings::ephemeral(Preset::SourceMeter), mock.clone()).await;

        let reply = roundtrip(handle.local_addr(), "SV").await;
        match decode_reply(&reply, Framing::Framed).unwrap() {
            Reply::Error { status, .. } => assert_eq!(status, ReplyStatus::InvalidArgument),
            other => panic!("expected an error reply, got {other:?}"),
        }
        assert!(mock.call_log().is_empty());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_connection_closed_without_reply() {
        let settings = RelaySettings {
            connection_timeout: Duration::from_millis(50),
            ..RelaySettings::ephemeral(Preset::FrequencyCounter)
        };
        let handle = start(settings, MockInstrument::new("counter")).await;

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_rejects_empty_table() {
        let settings = RelaySettings {
            port: 0,
            ..RelaySettings::default()
        };
        let dispatcher = Dispatcher::spawn(
            Box::new(MockInstrument::new("none")),
            settings.dispatcher(),
        );
        assert!(matches!(
            RelayServer::bind(&settings, dispatcher).await,
            Err(RelayError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let mock = MockInstrument::new("tc").with_value("temperature", 4.2);
        let settings = RelaySettings::ephemeral(Preset::TemperatureController);
        let dispatcher = Dispatcher::spawn(Box::new(mock), settings.dispatcher());
        let server = RelayServer::bind(&settings, dispatcher).await.unwrap();
        let state = server.state();
        assert_eq!(*state.borrow(), RelayState::Stopped);

        let mut handle = server.spawn();
        handle.listening().await.unwrap();
        handle.shutdown().await.unwrap();
        assert_eq!(*state.borrow(), RelayState::Stopped);
    }

    #[test]
    fn test_relay_settings_from_toml() {
        let settings: RelaySettings = toml::from_str(
            r#"
            port = 6000
            framing = "legacy"
            preset = "daq_card"
            connection_timeout = "2s"

            [[commands]]
            token = "AO2"
            route = "write"
            channel = "ao2"
            "#,
        )
        .unwrap();
        assert_eq!(settings.bind_address(), "127.0.0.1:6000");
        assert_eq!(settings.framing, Framing::Legacy);
        assert_eq!(settings.buffer_size, 1024);
        assert_eq!(settings.connection_timeout, Duration::from_secs(2));
        assert_eq!(settings.command_table().len(), 7);
    }
}
