use crate::adapters::{ListingDriver, SourceExtractor};
use crate::events::EventBus;
use crate::models::{
    Batch, FailureKind, Job, JobStage, JobStatus, MappingOverride, MarketplaceId, ProgressEvent,
};
use crate::pricing::{PolicyError, PricingPolicy};
use crate::retry::RetryPolicy;
use crate::runner::{JobRunner, RunControl, RunnerConfig};
use crate::store::{ProgressStore, StoreError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    future::Future,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{Mutex, Semaphore, broadcast, mpsc, watch},
    task::{JoinHandle, JoinSet},
};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("invalid pricing policy: {0}")]
    Policy(#[from] PolicyError),
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Store(StoreError),
    #[error("scheduler is shut down")]
    Closed,
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => SchedulerError::NotFound(key),
            StoreError::ClaimConflict { .. }
            | StoreError::Terminal { .. }
            | StoreError::InvalidState { .. } => SchedulerError::Conflict(err.to_string()),
            other => SchedulerError::Store(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub instance_id: String,
    pub max_concurrency: usize,
    pub checkpoint_retention: chrono::Duration,
    pub purge_interval: Duration,
    /// Re-dispatch budget for runs that end in a store error.
    pub store_retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("engine-{}", Uuid::new_v4().simple()),
            max_concurrency: 8,
            checkpoint_retention: chrono::Duration::days(7),
            purge_interval: Duration::from_secs(3600),
            store_retry: RetryPolicy::new(5, Duration::from_millis(250), Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub links: Vec<String>,
    pub policy: PricingPolicy,
    pub concurrency: usize,
    #[serde(default)]
    pub destination: Option<MarketplaceId>,
    #[serde(skip)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchAccepted {
    pub batch_id: String,
    pub job_ids: Vec<String>,
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub batch_id: String,
    pub destination: MarketplaceId,
    pub concurrency: usize,
    pub counts: BTreeMap<JobStage, usize>,
    pub jobs: Vec<JobStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    pub resumed: usize,
    pub queued: usize,
    pub parked: usize,
}

/// Admits jobs per batch up to the batch's concurrency and runs them through
/// the [`JobRunner`]. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    store: ProgressStore,
    runner: JobRunner,
    events: EventBus,
    config: SchedulerConfig,
    // Claim tokens minted by this process start with this prefix.
    claim_prefix: String,
    paused: watch::Sender<bool>,
    aborts: watch::Sender<u64>,
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    tasks: Mutex<JoinSet<()>>,
    // Consecutive store failures per job since its last clean run.
    store_failures: Mutex<HashMap<String, u32>>,
}

impl Scheduler {
    /// Builds the scheduler and starts its housekeeping loop. Call
    /// [`Scheduler::recover`] afterwards to pick up persisted work.
    pub fn spawn(
        store: ProgressStore,
        source: Arc<dyn SourceExtractor>,
        driver: Arc<dyn ListingDriver>,
        events: EventBus,
        runner_config: RunnerConfig,
        config: SchedulerConfig,
    ) -> (Self, JoinHandle<()>) {
        let (paused, paused_rx) = watch::channel(false);
        let (aborts, aborts_rx) = watch::channel(0u64);
        let runner = JobRunner::new(
            store.clone(),
            source,
            driver,
            events.clone(),
            runner_config,
            RunControl::new(paused_rx, aborts_rx),
        );
        let claim_prefix = format!("{}:{}", config.instance_id, Uuid::new_v4().simple());
        let scheduler = Self {
            inner: Arc::new(Inner {
                store,
                runner,
                events,
                config,
                claim_prefix,
                paused,
                aborts,
                lanes: Mutex::new(HashMap::new()),
                tasks: Mutex::new(JoinSet::new()),
                store_failures: Mutex::new(HashMap::new()),
            }),
        };

        let housekeeping = scheduler.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(housekeeping.inner.config.purge_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = housekeeping.purge_expired().await {
                    warn!(target = "crosslist.scheduler", error = %err, "checkpoint_purge_failed");
                }
            }
        });

        (scheduler, handle)
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.config.instance_id
    }

    pub async fn start_batch(&self, request: BatchRequest) -> Result<BatchAccepted, SchedulerError> {
        let max = self.inner.config.max_concurrency;
        if request.concurrency == 0 || request.concurrency > max {
            return Err(SchedulerError::InvalidRequest(format!(
                "concurrency must be between 1 and {max}"
            )));
        }
        request.policy.validate()?;
        let links = normalize_links(&request.links)?;

        let batch_id = Uuid::new_v4().to_string();
        if let Some(key) = request.idempotency_key.as_deref()
            && let Some(existing) = self.inner.store.remember_idempotency(key, &batch_id).await?
        {
            let batch = self.inner.store.batch(&existing).await?.ok_or_else(|| {
                SchedulerError::Conflict(format!("batch for key `{key}` is still being created"))
            })?;
            info!(target = "crosslist.scheduler", batch_id = %batch.id, "batch_replayed");
            return Ok(BatchAccepted {
                batch_id: batch.id,
                job_ids: batch.job_ids,
                replayed: true,
            });
        }

        let destination = request.destination.unwrap_or_default();
        let mut seen = HashSet::new();
        let jobs: Vec<Job> = links
            .iter()
            .map(|link| Job::queued(&batch_id, link, destination))
            .filter(|job| seen.insert(job.id.clone()))
            .collect();
        let batch = Batch {
            id: batch_id.clone(),
            job_ids: jobs.iter().map(|job| job.id.clone()).collect(),
            policy: request.policy,
            concurrency: request.concurrency,
            destination,
            created_at: Utc::now(),
        };

        if let Err(err) = self.inner.store.create_batch(&batch, &jobs).await {
            if let Some(key) = request.idempotency_key.as_deref()
                && let Err(forget) = self.inner.store.forget_idempotency(key).await
            {
                warn!(target = "crosslist.scheduler", key, error = %forget, "idempotency_key_release_failed");
            }
            return Err(err.into());
        }

        for job in &jobs {
            self.dispatch(job).await?;
        }
        info!(
            target = "crosslist.scheduler",
            batch_id = %batch.id,
            jobs = jobs.len(),
            concurrency = batch.concurrency,
            destination = destination.ebay_code(),
            "batch_started"
        );
        Ok(BatchAccepted {
            batch_id: batch.id,
            job_ids: batch.job_ids,
            replayed: false,
        })
    }

    /// Re-dispatches persisted non-terminal work: in-flight jobs first, then
    /// queued ones. Claims left by other processes are cleared first.
    pub async fn recover(&self) -> Result<RecoverySummary, SchedulerError> {
        let mut summary = RecoverySummary::default();
        let mut in_flight = Vec::new();
        let mut queued = Vec::new();

        for job in self.inner.store.jobs().await? {
            if job.stage.is_terminal() {
                continue;
            }
            if let Some(token) = job.claim_token.as_deref() {
                if self.owns(token) {
                    continue;
                }
                if !self.inner.store.clear_stale_claim(&job.id, token).await? {
                    continue;
                }
                info!(target = "crosslist.scheduler", job_id = %job.id, stale = token, "stale_claim_cleared");
            }
            if job.awaiting_review() {
                summary.parked += 1;
            } else if job.stage == JobStage::Queued {
                queued.push(job);
            } else {
                in_flight.push(job);
            }
        }

        summary.resumed = in_flight.len();
        summary.queued = queued.len();
        for job in in_flight.iter().chain(queued.iter()) {
            self.dispatch(job).await?;
        }
        info!(
            target = "crosslist.scheduler",
            resumed = summary.resumed,
            queued = summary.queued,
            parked = summary.parked,
            "recovery_complete"
        );
        Ok(summary)
    }

    pub fn pause(&self) {
        self.inner.paused.send_replace(true);
        info!(target = "crosslist.scheduler", "paused");
    }

    pub fn resume(&self) {
        self.inner.paused.send_replace(false);
        info!(target = "crosslist.scheduler", "resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    /// Aborts one job, or every non-terminal job when `job_id` is `None`.
    /// Returns the ids that were aborted.
    pub async fn terminate(&self, job_id: Option<&str>) -> Result<Vec<String>, SchedulerError> {
        let targets: Vec<String> = match job_id {
            Some(id) => {
                let job = self.inner.store.require_job(id).await?;
                if job.stage.is_terminal() {
                    return Err(SchedulerError::Conflict(format!(
                        "job {id} is already {}",
                        job.stage
                    )));
                }
                vec![job.id]
            }
            None => self
                .inner
                .store
                .jobs()
                .await?
                .into_iter()
                .filter(|job| !job.stage.is_terminal())
                .map(|job| job.id)
                .collect(),
        };

        let mut aborted = Vec::new();
        for id in targets {
            if let Some(job) = self.inner.store.abort(&id).await? {
                self.inner.events.emit(&job, "aborted by operator");
                aborted.push(job.id);
            }
        }
        self.inner.aborts.send_modify(|generation| *generation += 1);
        info!(target = "crosslist.scheduler", aborted = aborted.len(), "terminate_requested");
        Ok(aborted)
    }

    pub async fn job_status(&self, job_id: &str) -> Result<JobStatus, SchedulerError> {
        let job = self.inner.store.require_job(job_id).await?;
        Ok(JobStatus::from(&job))
    }

    pub async fn jobs(&self) -> Result<Vec<JobStatus>, SchedulerError> {
        Ok(self
            .inner
            .store
            .jobs()
            .await?
            .iter()
            .map(JobStatus::from)
            .collect())
    }

    pub async fn batches(&self) -> Result<Vec<Batch>, SchedulerError> {
        Ok(self.inner.store.batches().await?)
    }

    pub async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus, SchedulerError> {
        let batch = self
            .inner
            .store
            .batch(batch_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("batch:{batch_id}")))?;
        let mut counts = BTreeMap::new();
        let mut jobs = Vec::with_capacity(batch.job_ids.len());
        for id in &batch.job_ids {
            if let Some(job) = self.inner.store.job(id).await? {
                *counts.entry(job.stage).or_insert(0) += 1;
                jobs.push(JobStatus::from(&job));
            }
        }
        Ok(BatchStatus {
            batch_id: batch.id,
            destination: batch.destination,
            concurrency: batch.concurrency,
            counts,
            jobs,
        })
    }

    /// Applies operator mappings to a parked job and puts it back in line.
    pub async fn resolve_review(
        &self,
        job_id: &str,
        overrides: Vec<MappingOverride>,
    ) -> Result<JobStatus, SchedulerError> {
        if overrides.is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "at least one override is required".into(),
            ));
        }
        let job = self.inner.store.resolve_review(job_id, &overrides).await?;
        self.inner
            .events
            .emit(&job, format!("review resolved with {} overrides", overrides.len()));
        self.dispatch(&job).await?;
        Ok(JobStatus::from(&job))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.events.subscribe()
    }

    pub async fn purge_expired(&self) -> Result<usize, SchedulerError> {
        let purged = self
            .inner
            .store
            .purge_expired(self.inner.config.checkpoint_retention)
            .await?;
        if purged > 0 {
            info!(target = "crosslist.scheduler", purged, "checkpoints_purged");
        }
        Ok(purged)
    }

    /// Stops every lane and worker of this process without touching the store.
    pub async fn shutdown(&self) {
        self.inner.lanes.lock().await.clear();
        self.inner.tasks.lock().await.abort_all();
        info!(target = "crosslist.scheduler", "scheduler_stopped");
    }

    fn owns(&self, token: &str) -> bool {
        token
            .strip_prefix(self.inner.claim_prefix.as_str())
            .is_some_and(|rest| rest.starts_with(':'))
    }

    async fn dispatch(&self, job: &Job) -> Result<(), SchedulerError> {
        let lane = self.lane(&job.batch_id).await?;
        lane.send(job.id.clone()).map_err(|_| SchedulerError::Closed)
    }

    async fn lane(&self, batch_id: &str) -> Result<mpsc::UnboundedSender<String>, SchedulerError> {
        let mut lanes = self.inner.lanes.lock().await;
        if let Some(lane) = lanes.get(batch_id)
            && !lane.is_closed()
        {
            return Ok(lane.clone());
        }

        let batch = self
            .inner
            .store
            .batch(batch_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("batch:{batch_id}")))?;
        let gate = Arc::new(Semaphore::new(batch.concurrency.max(1)));
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .spawn(run_lane(self.inner.clone(), gate, rx, tx.downgrade()))
            .await;
        lanes.insert(batch_id.to_string(), tx.clone());
        Ok(tx)
    }
}

impl Inner {
    async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Runs one job. Returns a delay after which the job should be
    /// dispatched again because the run ended in a store error.
    async fn work(&self, job_id: &str) -> Option<Duration> {
        let token = format!("{}:{}", self.claim_prefix, Uuid::new_v4().simple());
        match self.runner.run(job_id, &token).await {
            Ok(outcome) => {
                self.store_failures.lock().await.remove(job_id);
                info!(target = "crosslist.scheduler", job_id, outcome = outcome.label(), "job_run_finished");
                None
            }
            Err(err) => {
                warn!(target = "crosslist.scheduler", job_id, error = %err, "job_run_errored");
                if let Err(release) = self.store.clear_stale_claim(job_id, &token).await {
                    warn!(target = "crosslist.scheduler", job_id, error = %release, "claim_release_failed");
                }
                let failures = {
                    let mut failures = self.store_failures.lock().await;
                    let count = failures.entry(job_id.to_string()).or_insert(0);
                    *count += 1;
                    *count
                };
                if self.config.store_retry.allows_retry(failures) {
                    return Some(self.config.store_retry.backoff_delay(failures));
                }
                self.store_failures.lock().await.remove(job_id);
                self.fail_after_store_errors(job_id, failures, &err.to_string())
                    .await;
                None
            }
        }
    }

    async fn fail_after_store_errors(&self, job_id: &str, failures: u32, detail: &str) {
        let message = format!("store failed {failures} times in a row: {detail}");
        match self
            .store
            .fail_unclaimed(job_id, FailureKind::Internal, &message)
            .await
        {
            Ok(Some(job)) => {
                warn!(target = "crosslist.scheduler", job_id, failures, "job_failed_on_store_errors");
                self.events.emit(&job, message);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(target = "crosslist.scheduler", job_id, error = %err, "job_failure_record_failed");
            }
        }
    }
}

// Admits one batch's jobs in dispatch order; a job starts only while holding
// one of the batch's permits. Jobs whose run hit a store error re-enter the
// lane after a delay, without holding a permit while they wait.
async fn run_lane(
    inner: Arc<Inner>,
    gate: Arc<Semaphore>,
    mut rx: mpsc::UnboundedReceiver<String>,
    requeue: mpsc::WeakUnboundedSender<String>,
) {
    while let Some(job_id) = rx.recv().await {
        let Ok(permit) = gate.clone().acquire_owned().await else {
            break;
        };
        let worker = inner.clone();
        let requeue = requeue.clone();
        inner
            .spawn(async move {
                let retry = {
                    let _permit = permit;
                    worker.work(&job_id).await
                };
                let Some(delay) = retry else {
                    return;
                };
                tokio::time::sleep(delay).await;
                match requeue.upgrade() {
                    Some(lane) if lane.send(job_id.clone()).is_ok() => {
                        info!(target = "crosslist.scheduler", job_id = %job_id, "job_redispatched");
                    }
                    _ => {
                        warn!(target = "crosslist.scheduler", job_id = %job_id, "job_redispatch_dropped");
                    }
                }
            })
            .await;
    }
}

fn normalize_links(links: &[String]) -> Result<Vec<String>, SchedulerError> {
    if links.is_empty() {
        return Err(SchedulerError::InvalidRequest("links must not be empty".into()));
    }
    links
        .iter()
        .map(|raw| {
            let link = raw.trim();
            match reqwest::Url::parse(link) {
                Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {
                    Ok(link.to_string())
                }
                _ => Err(SchedulerError::InvalidRequest(format!(
                    "`{link}` is not an http(s) link"
                ))),
            }
        })
        .collect()
}
