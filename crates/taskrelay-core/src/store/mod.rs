//! Durable job ledger.
//!
//! The ledger is a JSONL file with one job per line. Every mutation rewrites
//! the whole file through a temp file and a rename, so readers only ever see
//! a complete ledger. Loading skips lines that fail to parse.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::mem;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::job::{Job, JobKind};

mod handle;

pub use handle::{StoreHandle, spawn_store_task};

#[derive(Debug)]
pub struct JobStore {
    path: PathBuf,
    /// Insertion order, which is also the on-disk order.
    jobs: Vec<Job>,
    index: HashMap<String, usize>,
}

impl JobStore {
    /// Opens the ledger at `path`, creating its parent directory if needed.
    ///
    /// A missing file is an empty ledger. Malformed lines are skipped.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or the file cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }

        let mut store = Self {
            path,
            jobs: Vec::new(),
            index: HashMap::new(),
        };

        if store.path.exists() {
            let bytes = fs::read(&store.path)
                .with_context(|| format!("read job ledger {}", store.path.display()))?;
            let raw = String::from_utf8_lossy(&bytes);
            let mut skipped = 0usize;
            for (line_no, line) in raw.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Job>(line) {
                    Ok(job) => {
                        store.put(job);
                    }
                    Err(err) => {
                        skipped += 1;
                        warn!(
                            ledger = %store.path.display(),
                            line = line_no + 1,
                            "Skipping malformed job record: {err}"
                        );
                    }
                }
            }
            debug!(jobs = store.jobs.len(), skipped, "Loaded job ledger");
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.index.get(id).map(|&i| &self.jobs[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Inserts or overwrites a job, then rewrites the ledger.
    ///
    /// # Errors
    /// Returns an error if the update would regress the job's status or the
    /// ledger cannot be written.
    pub fn add(&mut self, job: Job) -> Result<()> {
        self.update(job)
    }

    /// Inserts or overwrites a job, then rewrites the ledger.
    ///
    /// # Errors
    /// Returns an error if the update would regress the job's status or the
    /// ledger cannot be written.
    pub fn update(&mut self, job: Job) -> Result<()> {
        if let Some(existing) = self.get(&job.id)
            && !existing.status.can_transition_to(job.status)
        {
            bail!(
                "Refusing to move job {} from {} to {}",
                job.id,
                existing.status,
                job.status
            );
        }
        self.put_and_persist(job)
    }

    /// Inserts `job` only when its id is unknown. Returns whether it was inserted.
    ///
    /// # Errors
    /// Returns an error if the ledger cannot be written.
    pub fn insert_if_absent(&mut self, job: Job) -> Result<bool> {
        if self.contains(&job.id) {
            return Ok(false);
        }
        self.put_and_persist(job)?;
        Ok(true)
    }

    /// All jobs, newest first.
    pub fn list_all(&self) -> Vec<Job> {
        self.sorted(|_| true)
    }

    /// Jobs of one kind, newest first.
    pub fn list_by_kind(&self, kind: JobKind) -> Vec<Job> {
        self.sorted(|job| job.kind == kind)
    }

    fn sorted(&self, keep: impl Fn(&Job) -> bool) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().filter(|j| keep(j)).cloned().collect();
        // Stable sort: equal timestamps keep insertion order.
        jobs.sort_by(|a, b| b.time.cmp(&a.time));
        jobs
    }

    /// Replaces or appends `job`, returning the record it displaced.
    fn put(&mut self, job: Job) -> Option<Job> {
        if let Some(&i) = self.index.get(&job.id) {
            Some(mem::replace(&mut self.jobs[i], job))
        } else {
            self.index.insert(job.id.clone(), self.jobs.len());
            self.jobs.push(job);
            None
        }
    }

    /// Applies `job` and rewrites the ledger. Memory is left unchanged when
    /// the write fails, so a retry sees the job as still unknown.
    fn put_and_persist(&mut self, job: Job) -> Result<()> {
        let id = job.id.clone();
        let displaced = self.put(job);
        if let Err(err) = self.persist() {
            match displaced {
                Some(previous) => {
                    if let Some(&i) = self.index.get(&id) {
                        self.jobs[i] = previous;
                    }
                }
                None => {
                    self.jobs.pop();
                    self.index.remove(&id);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let file = File::create(&tmp)
                .with_context(|| format!("create ledger temp file {}", tmp.display()))?;
            let mut writer = BufWriter::new(file);
            for job in &self.jobs {
                serde_json::to_writer(&mut writer, job)
                    .with_context(|| format!("serialize job {}", job.id))?;
                writer.write_all(b"\n").context("write job ledger")?;
            }
            let file = writer.into_inner().context("flush job ledger")?;
            file.sync_all().context("sync job ledger")?;
        }
        fs::rename(&tmp, &self.path).with_context(|| {
            format!(
                "persist job ledger from {} to {}",
                tmp.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }
}
