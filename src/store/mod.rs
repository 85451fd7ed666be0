//! Durable progress store.
//!
//! Job records, checkpoint lists, stage artifacts and the batch index live in a
//! plain key/value backend under namespaced keys:
//!
//! - `job:<id>`: the [`Job`] record, including its claim token
//! - `checkpoints:<id>`: ordered [`ProgressCheckpoint`] list
//! - `artifact:<id>:<name>`: stage output referenced by a checkpoint
//! - `batch:<id>`: the [`Batch`] record with its job ids
//! - `idem:<key>`: batch id remembered for an idempotency key
//!
//! Every mutation of a job record is a compare-and-swap on its serialized
//! value, and claimed mutations additionally require the caller's claim token,
//! so each job has a single writer. Checkpoint and artifact writes check the
//! token in the same atomic step as the write.

mod memory;
mod redis_kv;

pub use memory::MemoryKv;
pub use redis_kv::RedisKv;

use crate::models::{
    Batch, FailureKind, Job, JobError, JobStage, MappingOverride, ProgressCheckpoint,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const CAS_RETRIES: usize = 16;
const OVERRIDES_ARTIFACT: &str = "overrides";

#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;
    /// Writes `value` only if the current value equals `expected`
    /// (`None` meaning the key must be absent). Returns whether it wrote.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> Result<bool, StoreError>;
    /// [`KvBackend::compare_and_swap`] that also requires the JSON record at
    /// `owner_key` to carry `token` in its `claim_token` field.
    async fn claimed_swap(
        &self,
        owner_key: &str,
        token: &str,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> Result<ClaimedSwap, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimedSwap {
    Swapped,
    /// The value at `key` changed; read again and retry.
    Mismatch,
    /// The owner record is missing or held under another token.
    NotOwner,
}

/// Whether the serialized job record `raw` is claimed with `token`.
fn record_claimed_by(raw: &str, token: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|record| {
            record
                .get("claim_token")
                .and_then(serde_json::Value::as_str)
                .map(|held| held == token)
        })
        .unwrap_or(false)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend failed: {0}")]
    Backend(String),
    #[error("stored value is malformed: {0}")]
    Serde(String),
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("job {job_id} is claimed by {holder:?}")]
    ClaimConflict {
        job_id: String,
        holder: Option<String>,
    },
    #[error("job {job_id} is already {stage}")]
    Terminal { job_id: String, stage: JobStage },
    #[error("job {job_id} cannot change: {reason}")]
    InvalidState {
        job_id: String,
        reason: &'static str,
    },
    #[error("too much contention on `{0}`")]
    Contention(String),
}

#[derive(Clone)]
pub struct ProgressStore {
    kv: Arc<dyn KvBackend>,
}

fn job_key(id: &str) -> String {
    format!("job:{id}")
}

fn checkpoints_key(id: &str) -> String {
    format!("checkpoints:{id}")
}

fn artifact_key(id: &str, name: &str) -> String {
    format!("artifact:{id}:{name}")
}

fn batch_key(id: &str) -> String {
    format!("batch:{id}")
}

fn encode<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|err| StoreError::Serde(err.to_string()))
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|err| StoreError::Serde(err.to_string()))
}

impl ProgressStore {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self { kv }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKv::new()))
    }

    pub async fn job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        match self.kv.get(&job_key(id)).await? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn require_job(&self, id: &str) -> Result<Job, StoreError> {
        self.job(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_key(id)))
    }

    pub async fn jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        for key in self.kv.keys("job:").await? {
            if let Some(raw) = self.kv.get(&key).await? {
                jobs.push(decode::<Job>(&raw)?);
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// Inserts the jobs that do not exist yet, then the batch record.
    pub async fn create_batch(&self, batch: &Batch, jobs: &[Job]) -> Result<(), StoreError> {
        for job in jobs {
            let inserted = self
                .kv
                .compare_and_swap(&job_key(&job.id), None, encode(job)?)
                .await?;
            if !inserted {
                debug!(target = "crosslist.store", job_id = %job.id, "job_already_exists");
            }
        }
        self.kv.put(&batch_key(&batch.id), encode(batch)?).await
    }

    pub async fn batch(&self, id: &str) -> Result<Option<Batch>, StoreError> {
        match self.kv.get(&batch_key(id)).await? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn batches(&self) -> Result<Vec<Batch>, StoreError> {
        let mut batches = Vec::new();
        for key in self.kv.keys("batch:").await? {
            if let Some(raw) = self.kv.get(&key).await? {
                batches.push(decode::<Batch>(&raw)?);
            }
        }
        Ok(batches)
    }

    async fn mutate_job<F>(&self, id: &str, mut apply: F) -> Result<Job, StoreError>
    where
        F: FnMut(&mut Job) -> Result<(), StoreError> + Send,
    {
        let key = job_key(id);
        for _ in 0..CAS_RETRIES {
            let Some(raw) = self.kv.get(&key).await? else {
                return Err(StoreError::NotFound(key));
            };
            let mut job: Job = decode(&raw)?;
            apply(&mut job)?;
            job.updated_at = Utc::now();
            if self
                .kv
                .compare_and_swap(&key, Some(&raw), encode(&job)?)
                .await?
            {
                return Ok(job);
            }
        }
        Err(StoreError::Contention(key))
    }

    /// Takes ownership of an unclaimed, non-terminal job.
    pub async fn claim(&self, id: &str, token: &str) -> Result<Job, StoreError> {
        self.mutate_job(id, |job| {
            if job.stage.is_terminal() {
                return Err(StoreError::Terminal {
                    job_id: job.id.clone(),
                    stage: job.stage,
                });
            }
            if job.claim_token.is_some() {
                return Err(StoreError::ClaimConflict {
                    job_id: job.id.clone(),
                    holder: job.claim_token.clone(),
                });
            }
            if job.awaiting_review() {
                return Err(StoreError::InvalidState {
                    job_id: job.id.clone(),
                    reason: "awaiting manual review",
                });
            }
            job.needs_manual_review = false;
            job.review_resolved = false;
            job.claim_token = Some(token.to_string());
            Ok(())
        })
        .await
    }

    /// Applies `change` only while `token` still owns the job.
    pub async fn update_claimed<F>(&self, id: &str, token: &str, mut change: F) -> Result<Job, StoreError>
    where
        F: FnMut(&mut Job) + Send,
    {
        self.mutate_job(id, |job| {
            if job.claim_token.as_deref() != Some(token) {
                return Err(StoreError::ClaimConflict {
                    job_id: job.id.clone(),
                    holder: job.claim_token.clone(),
                });
            }
            change(job);
            Ok(())
        })
        .await
    }

    /// Clears `stale` if it is still the job's token. Returns whether it did.
    pub async fn clear_stale_claim(&self, id: &str, stale: &str) -> Result<bool, StoreError> {
        match self
            .mutate_job(id, |job| {
                if job.claim_token.as_deref() != Some(stale) {
                    return Err(StoreError::ClaimConflict {
                        job_id: job.id.clone(),
                        holder: job.claim_token.clone(),
                    });
                }
                job.claim_token = None;
                Ok(())
            })
            .await
        {
            Ok(_) => Ok(true),
            Err(StoreError::ClaimConflict { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Moves a non-terminal job to `Aborted` regardless of who holds it.
    /// Returns `None` when the job had already finished.
    pub async fn abort(&self, id: &str) -> Result<Option<Job>, StoreError> {
        match self
            .mutate_job(id, |job| {
                if job.stage.is_terminal() {
                    return Err(StoreError::Terminal {
                        job_id: job.id.clone(),
                        stage: job.stage,
                    });
                }
                job.stage = JobStage::Aborted;
                job.claim_token = None;
                job.needs_manual_review = false;
                job.review_resolved = false;
                Ok(())
            })
            .await
        {
            Ok(job) => Ok(Some(job)),
            Err(StoreError::Terminal { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Moves an unclaimed, non-terminal job to `Failed` with `kind`. Returns
    /// `None` when the job finished or another worker holds it.
    pub async fn fail_unclaimed(
        &self,
        id: &str,
        kind: FailureKind,
        message: &str,
    ) -> Result<Option<Job>, StoreError> {
        match self
            .mutate_job(id, |job| {
                if job.stage.is_terminal() {
                    return Err(StoreError::Terminal {
                        job_id: job.id.clone(),
                        stage: job.stage,
                    });
                }
                if job.claim_token.is_some() {
                    return Err(StoreError::ClaimConflict {
                        job_id: job.id.clone(),
                        holder: job.claim_token.clone(),
                    });
                }
                job.last_error = Some(JobError {
                    kind,
                    stage: job.stage,
                    message: message.to_string(),
                    at: Utc::now(),
                });
                job.stage = JobStage::Failed;
                job.needs_manual_review = false;
                job.review_resolved = false;
                Ok(())
            })
            .await
        {
            Ok(job) => Ok(Some(job)),
            Err(StoreError::Terminal { .. } | StoreError::ClaimConflict { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Records operator mappings for a parked job and makes it claimable again.
    /// The job counts as parked until a worker claims it.
    pub async fn resolve_review(
        &self,
        id: &str,
        overrides: &[MappingOverride],
    ) -> Result<Job, StoreError> {
        let job = self.require_job(id).await?;
        if !job.awaiting_review() {
            return Err(StoreError::InvalidState {
                job_id: id.to_string(),
                reason: "job is not awaiting review",
            });
        }

        let mut merged = self.overrides(id).await?;
        for incoming in overrides {
            merged.retain(|existing| {
                !(existing.axis.eq_ignore_ascii_case(&incoming.axis)
                    && existing
                        .source_label
                        .eq_ignore_ascii_case(&incoming.source_label))
            });
            merged.push(incoming.clone());
        }
        self.kv
            .put(&artifact_key(id, OVERRIDES_ARTIFACT), encode(&merged)?)
            .await?;

        self.mutate_job(id, |job| {
            if !job.awaiting_review() || job.stage.is_terminal() {
                return Err(StoreError::InvalidState {
                    job_id: job.id.clone(),
                    reason: "job is not awaiting review",
                });
            }
            job.review_resolved = true;
            job.attempts = 0;
            Ok(())
        })
        .await
    }

    pub async fn overrides(&self, id: &str) -> Result<Vec<MappingOverride>, StoreError> {
        Ok(self
            .artifact(id, OVERRIDES_ARTIFACT)
            .await?
            .unwrap_or_default())
    }

    async fn claim_conflict(&self, id: &str) -> StoreError {
        let holder = match self.job(id).await {
            Ok(Some(job)) => job.claim_token,
            _ => None,
        };
        StoreError::ClaimConflict {
            job_id: id.to_string(),
            holder,
        }
    }

    /// Read-modify-write of `key` that only lands while `token` owns job `id`.
    async fn claimed_update<F>(
        &self,
        id: &str,
        token: &str,
        key: &str,
        mut next: F,
    ) -> Result<(), StoreError>
    where
        F: FnMut(Option<&str>) -> Result<String, StoreError> + Send,
    {
        let owner = job_key(id);
        for _ in 0..CAS_RETRIES {
            let raw = self.kv.get(key).await?;
            let value = next(raw.as_deref())?;
            match self
                .kv
                .claimed_swap(&owner, token, key, raw.as_deref(), value)
                .await?
            {
                ClaimedSwap::Swapped => return Ok(()),
                ClaimedSwap::Mismatch => continue,
                ClaimedSwap::NotOwner => return Err(self.claim_conflict(id).await),
            }
        }
        Err(StoreError::Contention(key.to_string()))
    }

    pub async fn append_checkpoint(
        &self,
        id: &str,
        token: &str,
        checkpoint: ProgressCheckpoint,
    ) -> Result<(), StoreError> {
        let key = checkpoints_key(id);
        self.claimed_update(id, token, &key, |raw| {
            let mut list: Vec<ProgressCheckpoint> = match raw {
                Some(raw) => decode(raw)?,
                None => Vec::new(),
            };
            list.push(checkpoint.clone());
            encode(&list)
        })
        .await
    }

    pub async fn checkpoints(&self, id: &str) -> Result<Vec<ProgressCheckpoint>, StoreError> {
        match self.kv.get(&checkpoints_key(id)).await? {
            Some(raw) => decode(&raw),
            None => Ok(Vec::new()),
        }
    }

    /// Stores a stage artifact for a claimed job and returns its payload ref.
    pub async fn put_artifact<T: Serialize + Sync>(
        &self,
        id: &str,
        token: &str,
        name: &str,
        value: &T,
    ) -> Result<String, StoreError> {
        let key = artifact_key(id, name);
        let encoded = encode(value)?;
        self.claimed_update(id, token, &key, |_| Ok(encoded.clone()))
            .await?;
        Ok(key)
    }

    pub async fn artifact<T: DeserializeOwned>(
        &self,
        id: &str,
        name: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.kv.get(&artifact_key(id, name)).await? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Binds `key` to `batch_id` unless it is already bound; returns the
    /// previously bound batch id if there was one.
    pub async fn remember_idempotency(
        &self,
        key: &str,
        batch_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let storage_key = format!("idem:{key}");
        if self
            .kv
            .compare_and_swap(&storage_key, None, batch_id.to_string())
            .await?
        {
            return Ok(None);
        }
        self.kv.get(&storage_key).await
    }

    pub async fn forget_idempotency(&self, key: &str) -> Result<(), StoreError> {
        self.kv.delete(&format!("idem:{key}")).await
    }

    /// Drops checkpoints and artifacts of jobs that finished before `retention` ago.
    pub async fn purge_expired(&self, retention: chrono::Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - retention;
        let mut purged = 0;
        for job in self.jobs().await? {
            if !job.stage.is_terminal() || job.updated_at > cutoff {
                continue;
            }
            let artifacts = self.kv.keys(&format!("artifact:{}:", job.id)).await?;
            let checkpoints = checkpoints_key(&job.id);
            if artifacts.is_empty() && self.kv.get(&checkpoints).await?.is_none() {
                continue;
            }
            for key in artifacts {
                self.kv.delete(&key).await?;
            }
            self.kv.delete(&checkpoints).await?;
            purged += 1;
        }
        Ok(purged)
    }
}
