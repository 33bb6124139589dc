//! Long-lived ntfy stream consumer.
//!
//! Holds one HTTP connection to `{server}/{topic}/json`, persists the cursor
//! for every timestamped event and forwards `message` events to the
//! dispatcher. Disconnects are retried forever with capped exponential
//! backoff; only cancellation ends the loop.

use std::mem;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use taskrelay_core::cursor::CursorStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::ntfy::{StreamEvent, stream_url};

pub const MAX_BACKOFF_SECS: u64 = 60;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Longest stream line kept; longer lines are dropped whole.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Reconnect delay before the `attempt`-th retry (0-based): 1, 2, 4, … 60 seconds.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS))
}

/// How a single connection ended without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Closed,
    Cancelled,
}

/// Splits a byte stream into lines without rescanning buffered bytes.
struct LineBuffer {
    buf: Vec<u8>,
    /// Bytes of `buf` already known not to contain a newline.
    scanned: usize,
    max_len: usize,
    /// Inside a line that already exceeded `max_len`.
    discarding: bool,
}

impl LineBuffer {
    fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_len,
            discarding: false,
        }
    }

    /// Appends `chunk` and returns every line it completed.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            if self.discarding {
                self.discarding = false;
            } else {
                lines.push(String::from_utf8_lossy(&self.buf[start..end]).into_owned());
            }
            start = end + 1;
            self.scanned = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();

        if self.buf.len() > self.max_len {
            if !self.discarding {
                warn!(max_bytes = self.max_len, "Dropping oversized stream line");
            }
            self.discarding = true;
            self.buf.clear();
            self.scanned = 0;
        }
        lines
    }

    /// Returns the trailing unterminated line, if any.
    fn finish(&mut self) -> Option<String> {
        let rest = mem::take(&mut self.buf);
        self.scanned = 0;
        if self.discarding || rest.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

pub struct Subscriber {
    http: reqwest::Client,
    server: String,
    topic: String,
    cursor: CursorStore,
    dispatcher: Dispatcher,
}

impl Subscriber {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        server: impl Into<String>,
        topic: impl Into<String>,
        cursor: CursorStore,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        // No overall request timeout: the response body is an endless stream.
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            server: server.into(),
            topic: topic.into(),
            cursor,
            dispatcher,
        })
    }

    /// Consumes the stream until `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            match self.consume(cancel, &mut attempt).await {
                Ok(StreamEnd::Cancelled) => break,
                Ok(StreamEnd::Closed) => info!("ntfy stream closed by server"),
                Err(err) => warn!("ntfy stream error: {err:#}"),
            }

            let delay = backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            info!(delay_secs = delay.as_secs(), "Reconnecting to ntfy");
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        info!("ntfy subscriber stopped");
    }

    async fn consume(&self, cancel: &CancellationToken, attempt: &mut u32) -> Result<StreamEnd> {
        let since = self.cursor.since();
        let url = stream_url(&self.server, &self.topic, &since)?;
        info!(topic = %self.topic, since = %since, "Connecting to ntfy");

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            response = self.http.get(url).send() => {
                response.context("Failed to connect to ntfy")?
            }
        };
        let response = response
            .error_for_status()
            .context("ntfy rejected the subscription")?;
        info!("Subscribed to ntfy");

        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::new(MAX_LINE_BYTES);
        loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk.context("Failed to read ntfy stream")?;

            for line in lines.push(&chunk) {
                *attempt = 0;
                self.handle_line(&line).await;
            }
        }

        if let Some(line) = lines.finish() {
            *attempt = 0;
            self.handle_line(&line).await;
        }
        Ok(StreamEnd::Closed)
    }

    async fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let event: StreamEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(err) => {
                warn!("Dropping malformed stream line: {err}");
                return;
            }
        };

        // Saved before dispatch; a crash in between replays the message and
        // dedup absorbs it.
        if let Some(time) = event.time
            && let Err(err) = self.cursor.save(time)
        {
            warn!("Failed to save cursor: {err:#}");
        }

        if !event.is_message() {
            debug!(event = %event.event, "Stream event");
            return;
        }
        let Some(notification) = event.into_notification() else {
            warn!("Dropping message without a timestamp");
            return;
        };

        if let Err(err) = self.dispatcher.dispatch(notification).await {
            error!("Dispatch failed: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let delays: Vec<u64> = (0..9).map(|n| backoff_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut lines = LineBuffer::new(1024);
        assert!(lines.push(b"{\"id\":\"a\"").is_empty());
        assert_eq!(lines.push(b"}\n{\"id\":"), vec![r#"{"id":"a"}"#]);
        assert_eq!(lines.push(b"\"b\"}\n\n"), vec![r#"{"id":"b"}"#, ""]);
        assert!(lines.push(b"tail").is_empty());
        assert_eq!(lines.finish().as_deref(), Some("tail"));
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_oversized_line_is_dropped_and_memory_bounded() {
        let mut lines = LineBuffer::new(16);
        for _ in 0..100 {
            assert!(lines.push(&[b'x'; 10]).is_empty());
            assert!(lines.buf.len() <= 16);
        }
        assert_eq!(lines.push(b"xxx\nnext\n"), vec!["next"]);
        assert!(!lines.discarding);
    }

    #[test]
    fn test_oversized_trailing_line_is_not_returned() {
        let mut lines = LineBuffer::new(4);
        assert!(lines.push(b"0123456789").is_empty());
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_backoff_large_attempt_does_not_overflow() {
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(MAX_BACKOFF_SECS));
    }
}
