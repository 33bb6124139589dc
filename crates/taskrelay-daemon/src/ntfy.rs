//! ntfy JSON stream wire types.
//!
//! `GET {server}/{topic}/json?since=…` yields one JSON object per line:
//!
//! ```jsonl
//! {"id":"SLiKI64DOt","time":1700000000,"event":"open","topic":"my-claude-tasks"}
//! {"id":"hwQ2YpKdmg","time":1700000012,"event":"message","topic":"my-claude-tasks","message":"Fix the auth bug"}
//! {"id":"7c6bC8d2ZS","time":1700000047,"event":"keepalive","topic":"my-claude-tasks"}
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

pub const MESSAGE_EVENT: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl StreamEvent {
    pub fn is_message(&self) -> bool {
        self.event == MESSAGE_EVENT
    }

    /// Converts a `message` event into a notification.
    ///
    /// Returns None for other events and for messages without a timestamp.
    pub fn into_notification(self) -> Option<Notification> {
        if !self.is_message() {
            return None;
        }
        Some(Notification {
            id: self.id.filter(|id| !id.trim().is_empty()),
            time: self.time?,
            title: self.title,
            message: self.message.unwrap_or_default(),
        })
    }
}

/// An inbound message as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: Option<String>,
    pub time: i64,
    pub title: Option<String>,
    pub message: String,
}

impl Notification {
    /// Job identity: the notification id, or its timestamp.
    pub fn job_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| self.time.to_string())
    }
}

/// Builds the streaming endpoint for `topic`.
///
/// # Errors
/// Returns an error if `server` is not a valid base URL.
pub fn stream_url(server: &str, topic: &str, since: &str) -> Result<Url> {
    let base = format!("{}/", server.trim_end_matches('/'));
    let mut url = Url::parse(&base)
        .with_context(|| format!("Invalid ntfy server URL '{server}'"))?
        .join(&format!("{}/json", topic.trim_matches('/')))
        .with_context(|| format!("Invalid ntfy topic '{topic}'"))?;
    url.query_pairs_mut().append_pair("since", since);
    Ok(url)
}
