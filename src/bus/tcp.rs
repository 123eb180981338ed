//! Raw SCPI socket bus.
//!
//! Most LAN instruments accept SCPI over a plain TCP socket (port 5025 by
//! convention). Commands are terminated with a newline and every query reply
//! ends with one.
//!
//! A query that times out or is cancelled leaves the instrument's late reply
//! in flight, where the next query would take it for its own answer. The bus
//! marks itself desynchronized for the duration of every exchange and
//! reconnects before the next one if an exchange did not complete.

use super::Bus;
use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// SCPI-over-TCP bus
pub struct TcpBus {
    address: String,
    timeout: Duration,
    terminator: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Set while an exchange is in progress; still set afterwards if it failed
    /// or was dropped.
    desynchronized: bool,
}

impl TcpBus {
    /// Connect to `host:port`, bounded by `timeout`.
    pub async fn connect(address: &str, timeout: Duration) -> RelayResult<Self> {
        let (reader, writer) = Self::open_stream(address, timeout).await?;
        debug!(address, "SCPI socket connected");
        Ok(Self {
            address: address.to_string(),
            timeout,
            terminator: "\n".to_string(),
            reader,
            writer,
            desynchronized: false,
        })
    }

    async fn open_stream(
        address: &str,
        timeout: Duration,
    ) -> RelayResult<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| RelayError::Timeout(format!("connecting to {address}")))??;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok((BufReader::new(read_half), write_half))
    }

    /// Whether the last exchange failed to complete.
    pub fn is_desynchronized(&self) -> bool {
        self.desynchronized
    }

    /// Drop the connection, and any reply still owed on it, then reconnect.
    async fn resynchronize(&mut self) -> RelayResult<()> {
        warn!(address = %self.address, "Reconnecting after an incomplete exchange");
        let (reader, writer) = Self::open_stream(&self.address, self.timeout).await?;
        self.reader = reader;
        self.writer = writer;
        self.desynchronized = false;
        Ok(())
    }

    async fn begin_exchange(&mut self) -> RelayResult<()> {
        if self.desynchronized {
            self.resynchronize().await?;
        }
        self.desynchronized = true;
        Ok(())
    }

    /// Set line terminator for commands
    pub fn with_terminator(mut self, terminator: String) -> Self {
        self.terminator = terminator;
        self
    }

    async fn send(&mut self, command: &str) -> RelayResult<()> {
        let line = format!("{}{}", command, self.terminator);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Bus for TcpBus {
    fn resource(&self) -> &str {
        &self.address
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn write(&mut self, command: &str) -> RelayResult<()> {
        self.begin_exchange().await?;
        self.send(command).await?;
        self.desynchronized = false;
        debug!(address = %self.address, command, "SCPI write");
        Ok(())
    }

    async fn query(&mut self, command: &str) -> RelayResult<String> {
        self.begin_exchange().await?;
        self.send(command).await?;

        let mut line = String::new();
        let read = tokio::time::timeout(self.timeout, self.reader.read_line(&mut line))
            .await
            .map_err(|_| {
                RelayError::Timeout(format!(
                    "'{command}' on {} after {:?}",
                    self.address, self.timeout
                ))
            })??;

        if read == 0 {
            return Err(RelayError::DeviceFault(format!(
                "{} closed the connection during '{command}'",
                self.address
            )));
        }

        self.desynchronized = false;
        let reply = line.trim().to_string();
        debug!(address = %self.address, command, reply = %reply, "SCPI query");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// A one-connection fake instrument answering `*IDN?` and `MEAS?`.
    async fn fake_instrument() -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut buf = vec![0u8; 256];
            let mut pending = String::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                while let Some(pos) = pending.find('\n') {
                    let cmd = pending[..pos].to_string();
                    pending.drain(..=pos);
                    match cmd.as_str() {
                        "*IDN?" => socket.write_all(b"FAKE,53230A,1,2\n").await.unwrap(),
                        "MEAS?" => socket.write_all(b"+1.0E+06\n").await.unwrap(),
                        _ => {}
                    }
                    seen.push(cmd);
                }
            }
            seen
        });
        (address, task)
    }

    #[tokio::test]
    async fn test_tcp_bus_query_and_write() {
        let (address, task) = fake_instrument().await;
        let mut bus = TcpBus::connect(&address, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(bus.resource(), address);

        bus.write("*RST").await.unwrap();
        assert_eq!(bus.query("*IDN?").await.unwrap(), "FAKE,53230A,1,2");
        assert_eq!(bus.query("MEAS?").await.unwrap(), "+1.0E+06");
        drop(bus);

        let seen = task.await.unwrap();
        assert_eq!(seen, vec!["*RST", "*IDN?", "MEAS?"]);
    }

    /// Accepts any number of connections. `SLOW:CURR?` is answered late.
    async fn slow_instrument(delay: Duration) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let connections = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (read_half, mut write_half) = socket.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(cmd)) = lines.next_line().await {
                        let reply: &[u8] = match cmd.as_str() {
                            "SLOW:CURR?" => {
                                tokio::time::sleep(delay).await;
                                b"+1.0E-06\n"
                            }
                            "MEAS:VOLT?" => b"+5.0E+00\n",
                            _ => continue,
                        };
                        if write_half.write_all(reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (address, connections)
    }

    #[tokio::test]
    async fn test_late_reply_not_returned_to_next_query() {
        let (address, connections) = slow_instrument(Duration::from_millis(200)).await;
        let mut bus = TcpBus::connect(&address, Duration::from_millis(100))
            .await
            .unwrap();

        assert!(matches!(
            bus.query("SLOW:CURR?").await,
            Err(RelayError::Timeout(_))
        ));
        assert!(bus.is_desynchronized());

        // Let the late reply arrive before asking again.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(bus.query("MEAS:VOLT?").await.unwrap(), "+5.0E+00");
        assert!(!bus.is_desynchronized());
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_query_resynchronizes() {
        let (address, connections) = slow_instrument(Duration::from_millis(100)).await;
        let mut bus = TcpBus::connect(&address, Duration::from_secs(2))
            .await
            .unwrap();

        // An outer deadline drops the query future mid-read.
        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), bus.query("SLOW:CURR?")).await;
        assert!(cancelled.is_err());
        assert!(bus.is_desynchronized());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(bus.query("MEAS:VOLT?").await.unwrap(), "+5.0E+00");
        assert_eq!(bus.query("MEAS:VOLT?").await.unwrap(), "+5.0E+00");
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tcp_bus_query_timeout() {
        let (address, _task) = fake_instrument().await;
        let mut bus = TcpBus::connect(&address, Duration::from_millis(100))
            .await
            .unwrap();
        // The fake instrument never answers unknown queries.
        assert!(matches!(
            bus.query("SILENT?").await,
            Err(RelayError::Timeout(_))
        ));
    }
}
