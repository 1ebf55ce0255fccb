//! The credential job table.
//!
//! One entry per in-flight broadcast, keyed by job id and guarded by one
//! lock. A job remembers which nodes still owe an acknowledgement; when that
//! set drains the job is removed and its requester receives a single
//! `CRED_SUCCESS`, always after the lock is released.

use std::collections::{HashMap, HashSet};

use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use cardkeeper_network::Connection;
use cardkeeper_protocol::{write_status, CredStatus};
use cardkeeper_types::NodeId;

/// Job ids start here so they never collide with small sentinel values a
/// card agent may use.
pub const FIRST_JOB_ID: u32 = 100;

/// Jobs accepted before new requests are refused.
pub const MAX_PENDING_JOBS: usize = 1024;

pub struct CredentialJob {
    pub id: u32,
    pub requester: Connection,
    pub pending: HashSet<NodeId>,
    pub created: Instant,
}

pub struct JobTableInner {
    next_id: u32,
    jobs: HashMap<u32, CredentialJob>,
}

impl JobTableInner {
    /// Allocate the next job id.
    pub fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(FIRST_JOB_ID);
        id
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= MAX_PENDING_JOBS
    }

    pub fn insert(&mut self, job: CredentialJob) {
        self.jobs.insert(job.id, job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Apply one completion. Returns the job if this was its last one.
    fn complete(&mut self, job_id: u32, node: NodeId) -> Option<CredentialJob> {
        let job = self.jobs.get_mut(&job_id)?;
        if !job.pending.remove(&node) || !job.pending.is_empty() {
            return None;
        }
        self.jobs.remove(&job_id)
    }
}

pub struct JobTable {
    inner: Mutex<JobTableInner>,
}

impl JobTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(JobTableInner {
                next_id: FIRST_JOB_ID,
                jobs: HashMap::new(),
            }),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, JobTableInner> {
        self.inner.lock().await
    }

    /// Record an acknowledgement (ACK or NACK) from `node` for `job_id`.
    /// Returns true if the job completed.
    pub async fn complete(&self, job_id: u32, node: NodeId) -> bool {
        let finished = self.lock().await.complete(job_id, node);
        match finished {
            Some(job) => {
                reply_success(job).await;
                true
            }
            None => false,
        }
    }

    /// A node's channel went away: count it as having answered every job
    /// still waiting on it. Returns how many jobs completed.
    pub async fn node_gone(&self, node: NodeId) -> usize {
        let finished: Vec<CredentialJob> = {
            let mut inner = self.lock().await;
            let ids: Vec<u32> = inner
                .jobs
                .values()
                .filter(|job| job.pending.contains(&node))
                .map(|job| job.id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.complete(id, node))
                .collect()
        };
        let count = finished.len();
        for job in finished {
            reply_success(job).await;
        }
        count
    }

    pub async fn pending_jobs(&self) -> usize {
        self.lock().await.len()
    }
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Send the single success status to a job's requester and close it.
pub async fn reply_success(mut job: CredentialJob) {
    let elapsed = job.created.elapsed();
    match write_status(&mut job.requester, CredStatus::Success).await {
        Ok(()) => tracing::debug!(job = job.id, ?elapsed, "credential job complete"),
        Err(e) => tracing::warn!(job = job.id, error = %e, "failed to reply to credential requester"),
    }
    let _ = job.requester.shutdown().await;
}
