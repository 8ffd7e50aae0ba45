//! Adapter session state machine.
//!
//! ```text
//! Disconnected -> Initializing -> Ready -> Busy -> Ready
//!       ^               |                    |
//!       +---------------+--------------------+  (fatal error, dead channel, abort)
//! ```
//!
//! `send` takes `&mut self`, so whoever owns the session is the only one who
//! can have a request in flight. Timeouts are retried with exponential
//! backoff; every other failure is surfaced as-is.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::elm::{parse_response, AdapterCommand, AdapterRequest, AdapterResponse, PROMPT};
use crate::error::{ObdError, ObdResult};
use crate::protocol::ObdProtocol;
use crate::transport::Transport;

/// Connection state of the adapter session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Initializing,
    Ready,
    /// A request is awaiting its response
    Busy,
}

impl ConnectionState {
    /// Value exported on the `obd_adapter_state` gauge
    pub fn as_gauge(&self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Initializing => 1.0,
            ConnectionState::Ready => 2.0,
            ConnectionState::Busy => 3.0,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Busy)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Initializing => "Initializing",
            ConnectionState::Ready => "Ready",
            ConnectionState::Busy => "Busy",
        })
    }
}

/// Timing and retry policy of the adapter session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Protocol selected during the handshake (`Auto` searches)
    pub protocol: ObdProtocol,
    /// Wait for the prompt after an OBD request
    pub command_timeout_ms: u64,
    /// Wait for the prompt after each handshake step
    pub handshake_timeout_ms: u64,
    /// Retries after a timeout, on top of the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub retry_backoff_ms: u64,
    /// Multiplier applied to the delay for each further retry
    pub retry_backoff_factor: u32,
    /// The channel counts as dead once consecutive timeouts exceed this
    pub dead_channel_threshold: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            protocol: ObdProtocol::Auto,
            command_timeout_ms: 1000,
            handshake_timeout_ms: 5000,
            max_retries: 2,
            retry_backoff_ms: 100,
            retry_backoff_factor: 2,
            dead_channel_threshold: 5,
        }
    }
}

impl AdapterConfig {
    /// Delay before retry number `retry` (0-based)
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let factor = (self.retry_backoff_factor.max(1) as u64).saturating_pow(retry);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Owns the transport and all request timing.
///
/// Dropping a pending `send` future leaves the session `Busy`; call
/// [`AdapterSession::abort`] to tear it down.
pub struct AdapterSession<T: Transport> {
    transport: T,
    config: AdapterConfig,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    consecutive_timeouts: u32,
    adapter_version: Option<String>,
    protocol: Option<ObdProtocol>,
}

impl<T: Transport> AdapterSession<T> {
    pub fn new(transport: T, config: AdapterConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            config,
            state: ConnectionState::Disconnected,
            state_tx,
            consecutive_timeouts: 0,
            adapter_version: None,
            protocol: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Receiver that observes every state change
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Banner reported during the handshake
    pub fn adapter_version(&self) -> Option<&str> {
        self.adapter_version.as_deref()
    }

    /// Protocol reported by the last [`AdapterSession::describe_protocol`]
    pub fn protocol(&self) -> Option<ObdProtocol> {
        self.protocol
    }

    fn set_state(&mut self, next: ConnectionState) {
        if next == self.state {
            return;
        }
        let previous = std::mem::replace(&mut self.state, next);
        match (previous, next) {
            (ConnectionState::Ready, ConnectionState::Busy)
            | (ConnectionState::Busy, ConnectionState::Ready) => {
                debug!(from = %previous, to = %next, "Adapter state changed")
            }
            _ => info!(from = %previous, to = %next, "Adapter state changed"),
        }
        metrics::gauge!("obd_adapter_state").set(next.as_gauge());
        self.state_tx.send_replace(next);
    }

    fn require(&self, expected: ConnectionState) -> ObdResult<()> {
        if self.state != expected {
            return Err(ObdError::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// Run the handshake: reset, echo off, select protocol.
    ///
    /// Returns the adapter banner. Any failing step leaves the session
    /// `Disconnected` with a `Connection` error.
    pub async fn initialize(&mut self) -> ObdResult<String> {
        self.require(ConnectionState::Disconnected)?;
        self.set_state(ConnectionState::Initializing);
        self.consecutive_timeouts = 0;

        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        let steps = [
            AdapterCommand::Reset,
            AdapterCommand::EchoOff,
            AdapterCommand::SetProtocol(self.config.protocol),
        ];
        let mut banner = String::new();
        for (index, step) in steps.iter().enumerate() {
            let command = step.to_command();
            let reply = match self.exchange(&command, timeout).await {
                Ok(raw) => step.parse_reply(&raw),
                Err(e) => Err(e),
            };
            match reply {
                Ok(text) => {
                    debug!(step = index + 1, %command, reply = %text, "Handshake step done");
                    if index == 0 {
                        banner = text;
                    }
                }
                Err(e) => {
                    warn!(step = index + 1, %command, "Handshake failed: {}", e);
                    self.set_state(ConnectionState::Disconnected);
                    return Err(ObdError::Connection(format!(
                        "handshake step {} ({}) failed: {}",
                        index + 1,
                        command,
                        e
                    )));
                }
            }
        }

        info!("Adapter ready: {}", banner);
        self.adapter_version = Some(banner.clone());
        self.set_state(ConnectionState::Ready);
        Ok(banner)
    }

    /// Ask the adapter which protocol it settled on (`ATDPN`).
    pub async fn describe_protocol(&mut self) -> ObdResult<ObdProtocol> {
        self.require(ConnectionState::Ready)?;
        self.set_state(ConnectionState::Busy);

        let command = AdapterCommand::DescribeProtocolNumber;
        let timeout = Duration::from_millis(self.config.command_timeout_ms);
        let result = match self.exchange(&command.to_command(), timeout).await {
            Ok(raw) => command.parse_reply(&raw).and_then(|number| {
                ObdProtocol::from_describe_reply(&number)
                    .ok_or_else(|| ObdError::Protocol(format!("unknown protocol {}", number)))
            }),
            Err(e) => Err(e),
        };

        self.finish(&result);
        if let Ok(protocol) = result {
            info!("Vehicle protocol: {}", protocol);
            self.protocol = Some(protocol);
        }
        result
    }

    /// Send one OBD request and wait for its response.
    ///
    /// Callable only from `Ready`. Timeouts are retried up to
    /// `max_retries` times; protocol and decode errors are not.
    pub async fn send(&mut self, request: &AdapterRequest) -> ObdResult<AdapterResponse> {
        self.require(ConnectionState::Ready)?;
        self.set_state(ConnectionState::Busy);

        let command = request.to_command();
        let timeout = Duration::from_millis(self.config.command_timeout_ms);
        let mut attempt = 0;
        let result = loop {
            let result = match self.exchange(&command, timeout).await {
                Ok(raw) => parse_response(*request, &raw),
                Err(e) => Err(e),
            };
            match result {
                Err(ObdError::Timeout { .. }) if attempt < self.config.max_retries => {
                    let delay = self.config.retry_delay(attempt);
                    attempt += 1;
                    warn!(
                        %command,
                        attempt,
                        "No response within {}ms, retrying in {}ms",
                        self.config.command_timeout_ms,
                        delay.as_millis()
                    );
                    metrics::counter!("obd_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                }
                other => break other,
            }
        };

        if let Err(e) = &result {
            match e {
                ObdError::Protocol(_) => warn!(%command, "Protocol error: {}", e),
                _ => debug!(%command, "Request failed: {}", e),
            }
        }
        self.finish(&result);
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!("obd_requests_total", "outcome" => outcome).increment(1);

        if self.state == ConnectionState::Disconnected {
            self.transport.close().await;
            if let Err(ObdError::Timeout { .. }) = result {
                return Err(ObdError::Connection(format!(
                    "adapter stopped answering after {} consecutive timeouts",
                    self.consecutive_timeouts
                )));
            }
        }
        result
    }

    /// Settle the state after a request: `Ready`, or `Disconnected` when the
    /// error is fatal or the channel looks dead.
    fn finish<R>(&mut self, result: &ObdResult<R>) {
        match result {
            Err(ObdError::Timeout { .. }) => {}
            _ => self.consecutive_timeouts = 0,
        }
        let dead = self.consecutive_timeouts > self.config.dead_channel_threshold;
        let next = match result {
            Err(e) if e.is_fatal() => ConnectionState::Disconnected,
            Err(ObdError::Timeout { .. }) if dead => {
                warn!(
                    "Channel dead after {} consecutive timeouts",
                    self.consecutive_timeouts
                );
                ConnectionState::Disconnected
            }
            _ => ConnectionState::Ready,
        };
        self.set_state(next);
    }

    /// Write one command and collect the reply up to the prompt.
    async fn exchange(&mut self, command: &str, timeout: Duration) -> ObdResult<String> {
        // A late reply to an earlier command must not answer this one
        self.transport.discard_input().await?;

        debug!(">> {}", command);
        self.transport.write(format!("{}\r", command).as_bytes()).await?;

        let deadline = Instant::now() + timeout;
        let mut buffer = Vec::new();
        while !buffer.contains(&PROMPT) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.consecutive_timeouts += 1;
                return Err(ObdError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            match self.transport.read(remaining).await {
                Ok(bytes) => buffer.extend_from_slice(&bytes),
                Err(ObdError::Timeout { .. }) => {
                    self.consecutive_timeouts += 1;
                    return Err(ObdError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let text: String = String::from_utf8_lossy(&buffer)
            .chars()
            .filter(|c| *c != '\0')
            .collect();
        debug!("<< {:?}", text);
        Ok(text)
    }

    /// Cancel everything: close the transport and go `Disconnected`.
    pub async fn abort(&mut self) {
        self.transport.close().await;
        self.consecutive_timeouts = 0;
        self.set_state(ConnectionState::Disconnected);
    }
}
