//! Job data model.
//!
//! A job is one unit of work derived from an inbound notification. Jobs are
//! persisted one JSON object per line:
//!
//! ```jsonl
//! {"id":"aBc1","time":1700000000,"prompt":"Fix the auth bug","kind":"interactive","status":"completed"}
//! {"id":"x9Yz","time":1700000100,"prompt":"Summarize README.md","kind":"auto","status":"completed","result":"...","costUsd":0.02,"durationMs":5120,"steps":[{"kind":"text","content":"Reading the file."}]}
//! ```

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Maximum characters of the prompt used for a label when no title is set.
const LABEL_PROMPT_CHARS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Executed by the agent without a human in the loop.
    Auto,
    /// Handed off to an interactive multiplexer pane.
    Interactive,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Auto => "auto",
            JobKind::Interactive => "interactive",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(JobKind::Auto),
            "interactive" => Ok(JobKind::Interactive),
            other => bail!("Unknown job kind '{other}' (expected auto or interactive)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    /// For interactive jobs this means "handed off".
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Returns true if moving from `self` to `next` keeps the lifecycle monotonic.
    ///
    /// Re-writing the same status is allowed so that result fields can be
    /// updated in place.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::{Completed, Failed, Pending, Running};

        match (self, next) {
            (a, b) if a == b => true,
            (Pending, Running | Completed | Failed) | (Running, Completed | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Text,
    ToolUse,
}

/// One parsed fragment of agent activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub kind: StepKind,
    pub content: String,
}

impl Step {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: StepKind::Text,
            content: content.into(),
        }
    }

    pub fn tool_use(content: impl Into<String>) -> Self {
        Self {
            kind: StepKind::ToolUse,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub time: i64,
    pub prompt: String,
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<Step>>,
}

impl Job {
    /// Creates a job in its initial state: pending for auto jobs, completed
    /// (handed off) for interactive ones.
    pub fn new(id: impl Into<String>, time: i64, prompt: impl Into<String>, kind: JobKind) -> Self {
        let status = match kind {
            JobKind::Auto => JobStatus::Pending,
            JobKind::Interactive => JobStatus::Completed,
        };
        Self {
            id: id.into(),
            time,
            prompt: prompt.into(),
            kind,
            status,
            title: None,
            result: None,
            cost_usd: None,
            duration_ms: None,
            error: None,
            steps: None,
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        self
    }

    /// Short human label: the title, or the start of the prompt.
    pub fn label(&self) -> String {
        if let Some(title) = self.title.as_deref() {
            return title.to_string();
        }
        self.prompt.chars().take(LABEL_PROMPT_CHARS).collect()
    }

    /// Moves the job to `next`, rejecting regressions.
    ///
    /// # Errors
    /// Returns an error if the transition is not monotonic.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            bail!(
                "Job {} cannot move from {} to {}",
                self.id,
                self.status,
                next
            );
        }
        self.status = next;
        Ok(())
    }
}
