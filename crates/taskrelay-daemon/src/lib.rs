//! The taskrelay daemon: ntfy subscriber, dispatcher and auto job executor.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use taskrelay_core::config::{Config, paths};
use taskrelay_core::cursor::{CursorStore, SINCE_ALL};
use taskrelay_core::job::{JobKind, JobStatus};
use taskrelay_core::store::{JobStore, StoreHandle, spawn_store_task};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::executor::{AgentSettings, Executor};
use crate::handoff::{Handoff, ZellijHandoff};
use crate::subscriber::Subscriber;

pub mod dispatch;
pub mod executor;
pub mod handoff;
pub mod ntfy;
pub mod subscriber;

const INTERRUPTED_ERROR: &str = "interrupted: daemon stopped before the job finished";

/// Files the daemon reads and writes.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub jobs: PathBuf,
    pub cursor: PathBuf,
}

impl StatePaths {
    /// Paths under `TASKRELAY_HOME`.
    pub fn resolve() -> Self {
        Self {
            jobs: paths::jobs_path(),
            cursor: paths::cursor_path(),
        }
    }
}

/// Runs the daemon until `cancel` fires, handing interactive jobs to zellij.
///
/// # Errors
/// Returns an error only for startup failures (bad config, unusable ledger).
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let handoff = Arc::new(ZellijHandoff::new(
        config.session.clone(),
        config.agent_bin.clone(),
    ));
    run_with(config, StatePaths::resolve(), handoff, cancel).await
}

/// Like [`run`] with explicit state paths and hand-off.
///
/// # Errors
/// Returns an error only for startup failures (bad config, unusable ledger).
pub async fn run_with(
    config: Config,
    state: StatePaths,
    handoff: Arc<dyn Handoff>,
    cancel: CancellationToken,
) -> Result<()> {
    config.validate()?;
    // Surface a bad server URL now instead of retrying it forever.
    ntfy::stream_url(&config.server, &config.topic, SINCE_ALL)?;

    let store = JobStore::open(&state.jobs)
        .with_context(|| format!("Failed to open job ledger {}", state.jobs.display()))?;
    info!(
        jobs = store.len(),
        path = %store.path().display(),
        "Job ledger loaded"
    );
    let (store, store_task) = spawn_store_task(store);

    let executor = Executor::new(
        AgentSettings::from_config(&config),
        store.clone(),
        config.concurrency_limit(),
        cancel.clone(),
    );
    recover_unfinished(&store, &executor).await?;

    let refresh = tokio::spawn(log_revisions(store.subscribe()));

    let dispatcher = Dispatcher::new(store.clone(), executor.clone(), handoff);
    let subscriber = Subscriber::new(
        config.server.clone(),
        config.topic.clone(),
        CursorStore::new(state.cursor),
        dispatcher,
    )?;

    info!(
        server = %config.server,
        topic = %config.topic,
        max_concurrent_jobs = config.max_concurrent_jobs,
        "taskrelay daemon started"
    );
    subscriber.run(&cancel).await;

    let in_flight = executor.in_flight();
    if in_flight > 0 {
        info!(in_flight, "Waiting for running jobs to finish");
    }
    executor.shutdown().await;

    // The store task exits once the last handle is gone, after its final write.
    drop(subscriber);
    drop(executor);
    drop(store);
    let store = store_task.await.context("Job store task panicked")?;
    // The refresh logger follows the store task's revision sender.
    let _ = refresh.await;
    info!(jobs = store.len(), "taskrelay daemon stopped");
    Ok(())
}

/// Settles auto jobs left unfinished by a previous run.
///
/// Running jobs lost their process and are failed; pending jobs never started
/// and are resubmitted oldest first.
async fn recover_unfinished(store: &StoreHandle, executor: &Executor) -> Result<()> {
    let jobs = store.list_by_kind(JobKind::Auto).await?;
    for mut job in jobs.into_iter().rev() {
        match job.status {
            JobStatus::Running => {
                warn!(job = %job.id, "Job was interrupted by a restart");
                job.transition(JobStatus::Failed)?;
                job.error = Some(INTERRUPTED_ERROR.to_string());
                store.update(job).await?;
            }
            JobStatus::Pending => {
                info!(job = %job.id, "Resubmitting pending job");
                executor.submit(job);
            }
            JobStatus::Completed | JobStatus::Failed => {}
        }
    }
    Ok(())
}

async fn log_revisions(mut revisions: watch::Receiver<u64>) {
    while revisions.changed().await.is_ok() {
        let revision = *revisions.borrow_and_update();
        debug!(revision, "Job ledger changed");
    }
}
