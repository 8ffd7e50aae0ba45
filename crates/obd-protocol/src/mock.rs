//! Mock adapter transport for testing.
//!
//! Replays scripted ELM327 replies keyed by command text and records every
//! command written. The clone handed to the session shares state with the
//! one kept by the test, so assertions can inspect the traffic afterwards.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{ObdError, ObdResult};
use crate::transport::Transport;

/// Scripted adapter behaviour for one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Reply immediately with this text (the prompt is appended)
    Text(String),
    /// Never reply; the read times out
    Silence,
    /// Reply after a delay. If the delay exceeds the read timeout the text
    /// stays buffered as stale input.
    Delayed(Duration, String),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Text(text.into())
    }
}

#[derive(Debug, Default)]
struct MockState {
    script: HashMap<String, VecDeque<MockReply>>,
    pending: Option<MockReply>,
    written: Vec<String>,
    in_flight: bool,
    overlaps: usize,
    closed: bool,
}

/// Mock transport with scripted replies and command recording.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

fn with_prompt(text: &str) -> Vec<u8> {
    let mut reply = text.to_string();
    if !reply.ends_with('>') {
        reply.push_str("\r\r>");
    }
    reply.into_bytes()
}

impl MockTransport {
    /// Create a mock with nothing scripted. Unknown commands get `?`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock that completes the handshake on automatic protocol search and
    /// reports protocol 6 (CAN 11/500).
    pub fn with_elm327() -> Self {
        Self::new()
            .on("ATZ", "ATZ\r\r\rELM327 v1.5")
            .on("ATE0", "ATE0\rOK")
            .on("ATSP0", "OK")
            .on("ATDPN", "A6")
            .on("ATI", "ELM327 v1.5")
    }

    /// A small gasoline car: handshake, supported PID bitmaps, live data,
    /// vehicle info and two stored trouble codes.
    pub fn demo_vehicle() -> Self {
        Self::with_elm327()
            .on("0100", "41 00 BE 3F A8 13")
            .on("0120", "41 20 80 00 00 00")
            .on("0103", "41 03 02 00")
            .on("0104", "41 04 3F")
            .on("0105", "41 05 7B")
            .on("0106", "41 06 80")
            .on("0107", "41 07 7E")
            .on("010B", "41 0B 21")
            .on("010C", "41 0C 1A F8")
            .on("010D", "41 0D 32")
            .on("010E", "41 0E 90")
            .on("010F", "41 0F 46")
            .on("0110", "41 10 01 F4")
            .on("0111", "41 11 33")
            .on("011F", "41 1F 00 8C")
            .on("0121", "41 21 00 00")
            .on(
                "0902",
                "014\r0: 49 02 01 31 44 34\r1: 47 50 30 30 52 35 35\r2: 42 31 32 33 34 35 36",
            )
            .on(
                "0904",
                "013\r0: 49 04 01 53 57 2D\r1: 45 43 4D 2D 30 30 34\r2: 32 00 00 00 00 00",
            )
            .on(
                "090A",
                "017\r0: 49 0A 01 45 43 4D\r1: 00 2D 45 6E 67 69 6E\r2: 65 43 6F 6E 74 72 6F\r3: 6C 00 00",
            )
            .on("03", "43 02 01 33 04 01")
            .on("07", "47 00")
            .on("0A", "4A 00")
            .on("04", "44")
            .on("020200", "42 02 00 01 33")
            .on("020C00", "42 0C 00 1A F8")
            .on("020500", "42 05 00 7B")
    }

    /// Script a text reply for `command` (builder style).
    pub fn on(self, command: &str, reply: &str) -> Self {
        self.push(command, MockReply::text(reply));
        self
    }

    /// Script a reply for `command` (builder style).
    pub fn on_reply(self, command: &str, reply: MockReply) -> Self {
        self.push(command, reply);
        self
    }

    /// Queue another reply for `command`.
    ///
    /// Replies are consumed in order; the last one keeps answering.
    pub fn push(&self, command: &str, reply: MockReply) {
        self.lock()
            .script
            .entry(command.to_ascii_uppercase())
            .or_default()
            .push_back(reply);
    }

    /// Replace all scripted replies for `command` with one reply.
    pub fn set(&self, command: &str, reply: MockReply) {
        self.lock()
            .script
            .insert(command.to_ascii_uppercase(), VecDeque::from([reply]));
    }

    /// Every command written so far, without terminators
    pub fn written(&self) -> Vec<String> {
        self.lock().written.clone()
    }

    /// How often a command was written while another was still unanswered
    pub fn overlaps(&self) -> usize {
        self.lock().overlaps
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, bytes: &[u8]) -> ObdResult<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(ObdError::Connection("mock transport closed".to_string()));
        }
        let command = String::from_utf8_lossy(bytes)
            .trim_end_matches(['\r', '\n'])
            .to_ascii_uppercase();

        if state.in_flight {
            state.overlaps += 1;
        }
        state.in_flight = true;
        state.written.push(command.clone());

        let reply = match state.script.get_mut(&command) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        state.pending = Some(reply.unwrap_or_else(|| MockReply::text("?")));
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> ObdResult<Vec<u8>> {
        let pending = self.lock().pending.take();
        let timed_out = ObdError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        };

        match pending {
            Some(MockReply::Text(text)) => {
                self.lock().in_flight = false;
                Ok(with_prompt(&text))
            }
            Some(MockReply::Delayed(delay, text)) if delay <= timeout => {
                tokio::time::sleep(delay).await;
                self.lock().in_flight = false;
                Ok(with_prompt(&text))
            }
            Some(MockReply::Delayed(delay, text)) => {
                tokio::time::sleep(timeout).await;
                let mut state = self.lock();
                state.in_flight = false;
                state.pending = Some(MockReply::Delayed(delay - timeout, text));
                Err(timed_out)
            }
            Some(MockReply::Silence) | None => {
                tokio::time::sleep(timeout).await;
                self.lock().in_flight = false;
                Err(timed_out)
            }
        }
    }

    async fn discard_input(&mut self) -> ObdResult<()> {
        self.lock().pending = None;
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.lock();
        state.closed = true;
        state.pending = None;
        state.in_flight = false;
    }
}
