//! Single-writer access to the job ledger.
//!
//! One task owns the [`JobStore`]; everything else talks to it through a
//! cloneable [`StoreHandle`]. Commands are applied strictly in arrival order,
//! so concurrent job completions never interleave ledger rewrites. Each
//! applied mutation bumps a revision counter that views can watch.

use anyhow::{Result, anyhow};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{self, JoinHandle};
use tracing::{debug, warn};

use super::JobStore;
use crate::job::{Job, JobKind};

enum StoreCommand {
    InsertIfAbsent {
        job: Job,
        reply: oneshot::Sender<Result<bool>>,
    },
    Update {
        job: Job,
        reply: oneshot::Sender<Result<()>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Option<Job>>,
    },
    List {
        kind: Option<JobKind>,
        reply: oneshot::Sender<Vec<Job>>,
    },
}

#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<StoreCommand>,
    revision: watch::Receiver<u64>,
}

/// Moves `store` onto a blocking-pool thread and returns a handle to it.
///
/// Ledger rewrites (including `fsync`) happen on that thread, never on a
/// runtime worker. The thread exits once every handle has been dropped and
/// hands the store back through the join handle, after all queued commands
/// have been applied.
pub fn spawn_store_task(store: JobStore) -> (StoreHandle, JoinHandle<JobStore>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<StoreCommand>();
    let (revision_tx, revision_rx) = watch::channel(0u64);

    let task = task::spawn_blocking(move || {
        let mut store = store;
        while let Some(command) = rx.blocking_recv() {
            match command {
                StoreCommand::InsertIfAbsent { job, reply } => {
                    let id = job.id.clone();
                    let result = store.insert_if_absent(job);
                    match &result {
                        Ok(true) => bump(&revision_tx),
                        Ok(false) => debug!(job = %id, "Job already in ledger"),
                        Err(err) => warn!(job = %id, "Failed to insert job: {err:#}"),
                    }
                    let _ = reply.send(result);
                }
                StoreCommand::Update { job, reply } => {
                    let id = job.id.clone();
                    let result = store.update(job);
                    match &result {
                        Ok(()) => bump(&revision_tx),
                        Err(err) => warn!(job = %id, "Failed to update job: {err:#}"),
                    }
                    let _ = reply.send(result);
                }
                StoreCommand::Get { id, reply } => {
                    let _ = reply.send(store.get(&id).cloned());
                }
                StoreCommand::List { kind, reply } => {
                    let jobs = match kind {
                        Some(kind) => store.list_by_kind(kind),
                        None => store.list_all(),
                    };
                    let _ = reply.send(jobs);
                }
            }
        }
        debug!("Job store task stopped");
        store
    });

    (
        StoreHandle {
            tx,
            revision: revision_rx,
        },
        task,
    )
}

fn bump(revision: &watch::Sender<u64>) {
    revision.send_modify(|rev| *rev += 1);
}

impl StoreHandle {
    /// Inserts a job unless one with the same id exists. Returns whether it was inserted.
    ///
    /// # Errors
    /// Returns an error if the ledger cannot be written or the store task is gone.
    pub async fn insert_if_absent(&self, job: Job) -> Result<bool> {
        self.request(|reply| StoreCommand::InsertIfAbsent { job, reply })
            .await?
    }

    /// Inserts or overwrites a job.
    ///
    /// # Errors
    /// Returns an error if the update regresses the job status, the ledger
    /// cannot be written, or the store task is gone.
    pub async fn update(&self, job: Job) -> Result<()> {
        self.request(|reply| StoreCommand::Update { job, reply })
            .await?
    }

    /// # Errors
    /// Returns an error if the store task is gone.
    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let id = id.to_string();
        self.request(|reply| StoreCommand::Get { id, reply }).await
    }

    /// # Errors
    /// Returns an error if the store task is gone.
    pub async fn list_all(&self) -> Result<Vec<Job>> {
        self.request(|reply| StoreCommand::List { kind: None, reply })
            .await
    }

    /// # Errors
    /// Returns an error if the store task is gone.
    pub async fn list_by_kind(&self, kind: JobKind) -> Result<Vec<Job>> {
        self.request(|reply| StoreCommand::List {
            kind: Some(kind),
            reply,
        })
        .await
    }

    /// Returns a receiver that changes after every applied mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.clone()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> StoreCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| anyhow!("Job store task has stopped"))?;
        rx.await
            .map_err(|_| anyhow!("Job store task dropped the request"))
    }
}
