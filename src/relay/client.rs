//! Measurement relay client
//!
//! Every attempt opens a fresh connection, sends one request, waits the
//! settle time, reads one reply, and closes. Readings that fail the
//! configured [`Validity`] are re-requested up to `max_attempts` times.
//!
//! ```no_run
//! use labrelay::relay::{ClientSettings, RelayClient};
//!
//! # async fn demo() -> labrelay::RelayResult<()> {
//! let client = RelayClient::new(ClientSettings::default());
//! let current = client.get_i().await?;
//! println!("I = {} A after {} attempt(s)", current.value, current.attempts);
//! # Ok(())
//! # }
//! ```

use super::codec::{decode_header, decode_legacy, decode_payload, Framing, Reply, HEADER_SIZE};
use super::command::encode_request;
use crate::error::{RelayError, RelayResult};
use crate::retry::{retry_until_valid, Measured, RetryPolicy, Validity};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, instrument};

/// `[client]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Sleep between sending a request and reading the reply
    #[serde(default = "default_settle", with = "humantime_serde")]
    pub settle: Duration,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(default)]
    pub validity: Validity,
    #[serde(default)]
    pub framing: Framing,
    /// Largest reply accepted
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Bound on waiting for the reply once the request is sent
    #[serde(default = "default_reply_timeout", with = "humantime_serde")]
    pub reply_timeout: Duration,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5050
}

fn default_settle() -> Duration {
    Duration::from_millis(10)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_buffer_size() -> usize {
    1024
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_reply_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            settle: default_settle(),
            max_attempts: default_max_attempts(),
            retry_delay: default_retry_delay(),
            validity: Validity::default(),
            framing: Framing::default(),
            buffer_size: default_buffer_size(),
            connect_timeout: default_connect_timeout(),
            reply_timeout: default_reply_timeout(),
        }
    }
}

impl ClientSettings {
    /// `host:port` of the relay.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            retry_delay: self.retry_delay,
        }
    }
}

/// Client for one relay; cheap to clone.
#[derive(Debug, Clone)]
pub struct RelayClient {
    settings: ClientSettings,
}

impl RelayClient {
    pub fn new(settings: ClientSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Send `request` with retries until the reply passes the validity check.
    #[instrument(skip(self), fields(relay = %self.settings.address()))]
    pub async fn call(&self, request: &str) -> RelayResult<Measured> {
        self.call_with(request, self.settings.validity).await
    }

    /// Read the channel behind `token`.
    pub async fn read(&self, token: &str) -> RelayResult<Measured> {
        self.call(&encode_request(token, None)).await
    }

    /// Apply `value` through `token`. The reply is the applied value.
    ///
    /// Only transient failures are retried; the echoed value is not checked
    /// against the read validity.
    pub async fn write(&self, token: &str, value: f32) -> RelayResult<Measured> {
        self.call_with(&encode_request(token, Some(value)), Validity::Any)
            .await
    }

    /// Source-meter current (`I`).
    pub async fn get_i(&self) -> RelayResult<Measured> {
        self.read("I").await
    }

    /// Source-meter voltage (`V`).
    pub async fn get_v(&self) -> RelayResult<Measured> {
        self.read("V").await
    }

    /// Set the source-meter voltage (`SV`).
    pub async fn set_v(&self, volts: f32) -> RelayResult<Measured> {
        self.write("SV", volts).await
    }

    async fn call_with(&self, request: &str, validity: Validity) -> RelayResult<Measured> {
        let policy = self.settings.retry_policy();
        retry_until_valid(&policy, validity, |attempt| async move {
            debug!(attempt, request, "Sending request");
            self.attempt_once(request).await
        })
        .await
    }

    /// One connection, one request, one reply.
    async fn attempt_once(&self, request: &str) -> RelayResult<f32> {
        let address = self.settings.address();
        let mut stream = timeout(self.settings.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                RelayError::Timeout(format!(
                    "connect to {address} exceeded {:?}",
                    self.settings.connect_timeout
                ))
            })??;

        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;
        sleep(self.settings.settle).await;

        let reply = timeout(self.settings.reply_timeout, self.read_reply(&mut stream))
            .await
            .map_err(|_| {
                RelayError::Timeout(format!(
                    "reply from {address} exceeded {:?}",
                    self.settings.reply_timeout
                ))
            })??;
        reply.into_result()
    }

    async fn read_reply(&self, stream: &mut TcpStream) -> RelayResult<Reply> {
        match self.settings.framing {
            Framing::Legacy => {
                // The relay closes after replying, so EOF ends the reply.
                let limit = self.settings.buffer_size.max(1) as u64;
                let mut buf = Vec::new();
                (&mut *stream).take(limit).read_to_end(&mut buf).await?;
                decode_legacy(&buf)
            }
            Framing::Framed => {
                let mut header = [0u8; HEADER_SIZE];
                let first = stream.read(&mut header[..1]).await?;
                if first == 0 {
                    return Err(RelayError::EmptyReply);
                }
                stream.read_exact(&mut header[1..]).await?;
                let (status, length) = decode_header(&header)?;
                if length > self.settings.buffer_size {
                    return Err(RelayError::Protocol(format!(
                        "reply payload of {length} bytes exceeds buffer of {}",
                        self.settings.buffer_size
                    )));
                }
                let mut payload = vec![0u8; length];
                stream.read_exact(&mut payload).await?;
                decode_payload(status, &payload)
            }
        }
    }
}
