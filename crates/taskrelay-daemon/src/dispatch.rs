//! Notification classification and routing.
//!
//! A notification body is either a JSON task (`{"type":"auto","prompt":"…"}`)
//! or free text, which is always interactive. Dispatch is idempotent per job
//! id, so replays after a reconnect or restart are absorbed here.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use taskrelay_core::job::{Job, JobKind};
use taskrelay_core::store::StoreHandle;
use tracing::{debug, info, warn};

use crate::executor::Executor;
use crate::handoff::Handoff;
use crate::ntfy::Notification;

const AUTO_TYPE: &str = "auto";
const DEFAULT_TYPE: &str = "interactive";

/// Result of reading a notification body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// JSON object with a string `prompt` and an optional `type`.
    Structured { task_type: String, prompt: String },
    /// Anything else; the whole body is the prompt.
    Freeform { prompt: String },
}

impl Classified {
    pub fn kind(&self) -> JobKind {
        match self {
            Classified::Structured { task_type, .. } if task_type.eq_ignore_ascii_case(AUTO_TYPE) => {
                JobKind::Auto
            }
            _ => JobKind::Interactive,
        }
    }

    pub fn prompt(&self) -> &str {
        match self {
            Classified::Structured { prompt, .. } | Classified::Freeform { prompt } => prompt,
        }
    }
}

/// Classifies a notification body.
pub fn classify(body: &str) -> Classified {
    if let Ok(Value::Object(payload)) = serde_json::from_str::<Value>(body)
        && let Some(Value::String(prompt)) = payload.get("prompt")
    {
        let task_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_TYPE);
        return Classified::Structured {
            task_type: task_type.to_string(),
            prompt: prompt.clone(),
        };
    }
    Classified::Freeform {
        prompt: body.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Blank prompt; nothing recorded.
    Ignored,
    /// A job with this id is already in the ledger.
    Duplicate(String),
    /// Auto job recorded as pending and submitted to the executor.
    Queued(String),
    /// Interactive job recorded and handed off.
    HandedOff(String),
}

pub struct Dispatcher {
    store: StoreHandle,
    executor: Executor,
    handoff: Arc<dyn Handoff>,
}

impl Dispatcher {
    pub fn new(store: StoreHandle, executor: Executor, handoff: Arc<dyn Handoff>) -> Self {
        Self {
            store,
            executor,
            handoff,
        }
    }

    /// Turns one notification into at most one job.
    ///
    /// # Errors
    /// Returns an error only if the ledger could not record the new job.
    pub async fn dispatch(&self, notification: Notification) -> Result<Dispatched> {
        let classified = classify(&notification.message);
        let prompt = classified.prompt().trim();
        if prompt.is_empty() {
            debug!(time = notification.time, "Empty prompt, skipping");
            return Ok(Dispatched::Ignored);
        }

        let kind = classified.kind();
        let id = notification.job_id();
        let job = Job::new(&id, notification.time, prompt, kind).with_title(notification.title);

        if !self.store.insert_if_absent(job.clone()).await? {
            debug!(job = %id, "Duplicate notification, skipping");
            return Ok(Dispatched::Duplicate(id));
        }

        info!(job = %id, kind = %kind, label = %job.label(), "New job");

        match kind {
            JobKind::Auto => {
                self.executor.submit(job);
                Ok(Dispatched::Queued(id))
            }
            JobKind::Interactive => {
                if let Err(err) = self.handoff.hand_off(&job) {
                    warn!(job = %id, "Interactive hand-off failed: {err:#}");
                    let mut job = job;
                    job.error = Some(format!("hand-off failed: {err:#}"));
                    if let Err(err) = self.store.update(job).await {
                        warn!(job = %id, "Could not record hand-off failure: {err:#}");
                    }
                }
                Ok(Dispatched::HandedOff(id))
            }
        }
    }
}
