//! Interactive hand-off to a terminal multiplexer.
//!
//! Interactive jobs are opened as a new zellij pane running the agent with the
//! raw prompt. The daemon only records that the hand-off happened; what the
//! user does in the pane is not tracked.

use std::ffi::OsString;
use std::process::Stdio;

use anyhow::{Context, Result};
use taskrelay_core::job::Job;
use tokio::process::Command;
use tracing::{debug, warn};

const PANE_LABEL_CHARS: usize = 20;

pub trait Handoff: Send + Sync {
    /// Starts an interactive session for `job` without waiting for it.
    ///
    /// # Errors
    /// Returns an error if the session could not be started.
    fn hand_off(&self, job: &Job) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ZellijHandoff {
    session: String,
    agent_bin: String,
}

impl ZellijHandoff {
    pub fn new(session: impl Into<String>, agent_bin: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            agent_bin: agent_bin.into(),
        }
    }
}

impl Handoff for ZellijHandoff {
    fn hand_off(&self, job: &Job) -> Result<()> {
        let args = build_pane_args(&self.session, &self.agent_bin, job);
        let mut child = Command::new("zellij")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn zellij")?;

        let job_id = job.id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(job = %job_id, "zellij pane opened");
                }
                Ok(status) => warn!(job = %job_id, "zellij exited with {status}"),
                Err(err) => warn!(job = %job_id, "Failed to wait for zellij: {err}"),
            }
        });
        Ok(())
    }
}

/// Pane name for a job label, `task:` plus at most 20 characters.
pub fn pane_name(label: &str) -> String {
    let short: String = label.chars().take(PANE_LABEL_CHARS).collect();
    format!("task:{short}")
}

fn build_pane_args(session: &str, agent_bin: &str, job: &Job) -> Vec<OsString> {
    vec![
        OsString::from("--session"),
        OsString::from(session),
        OsString::from("run"),
        OsString::from("--name"),
        OsString::from(pane_name(&job.label())),
        OsString::from("--"),
        OsString::from(agent_bin),
        OsString::from(&job.prompt),
    ]
}
