//! Drives one job through its stages, one checkpoint per stage.

use crate::adapters::{
    BasicFields, DriverError, ListingDriver, ListingSession, ScrapeError, SourceExtractor,
    SubmitReceipt, VariantApplyResult,
};
use crate::events::EventBus;
use crate::grid::{GridError, GridLimits, build_grid};
use crate::models::{
    FailureKind, Disposition, Job, JobError, JobStage, ListingResult, ProgressCheckpoint,
    SourceProduct, VariationGridRow,
};
use crate::pricing::{PricingPolicy, compute_destination_price};
use crate::retry::RetryPolicy;
use crate::store::{ProgressStore, StoreError};
use crate::variants::{AxisMappingReport, map_axes, normalize_label};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{Duration, Instant as TokioInstant, sleep_until, timeout},
};
use tracing::{debug, info, warn};

const SOURCE_ARTIFACT: &str = "source_product";
const PRICE_ARTIFACT: &str = "price_quote";
const MAPPING_ARTIFACT: &str = "variant_mapping";
const FORM_ARTIFACT: &str = "form_draft";
const GRID_ARTIFACT: &str = "variation_grid";
const INTENT_ARTIFACT: &str = "submit_intent";
const RECEIPT_ARTIFACT: &str = "submit_receipt";
const RESULT_ARTIFACT: &str = "listing_result";

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub retry: RetryPolicy,
    pub stage_timeout: Duration,
    pub max_variations: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stage_timeout: Duration::from_secs(120),
            max_variations: 250,
        }
    }
}

/// Process-wide switches every worker observes between stages.
#[derive(Clone)]
pub struct RunControl {
    paused: watch::Receiver<bool>,
    aborts: watch::Receiver<u64>,
}

impl RunControl {
    pub fn new(paused: watch::Receiver<bool>, aborts: watch::Receiver<u64>) -> Self {
        Self { paused, aborts }
    }

    /// Abort signals sent after this call wake the waits below.
    fn abort_signals(&self) -> watch::Receiver<u64> {
        let mut aborts = self.aborts.clone();
        aborts.borrow_and_update();
        aborts
    }

    /// Blocks while paused. Returns [`Wake::Abort`] when any job is aborted so
    /// the caller can check whether its own job was among them.
    async fn wait_while_paused(&self, aborts: &mut watch::Receiver<u64>) -> Wake {
        let mut paused = self.paused.clone();
        while *paused.borrow_and_update() {
            tokio::select! {
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Wake::Ready;
                    }
                }
                _ = aborts.changed() => return Wake::Abort,
            }
        }
        Wake::Ready
    }

    /// Sleeps until `deadline`, or until an abort is signalled.
    async fn backoff_until(
        &self,
        deadline: TokioInstant,
        aborts: &mut watch::Receiver<u64>,
    ) -> Wake {
        tokio::select! {
            _ = sleep_until(deadline) => Wake::Ready,
            _ = aborts.changed() => Wake::Abort,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Ready,
    Abort,
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct StageError {
    stage: JobStage,
    message: String,
    kind: FailureKind,
}

impl StageError {
    pub fn new(kind: FailureKind, stage: JobStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn internal(stage: JobStage, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, stage, message)
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn stage(&self) -> JobStage {
        self.stage
    }

    pub fn detail(&self) -> &str {
        &self.message
    }

    fn record(&self) -> JobError {
        JobError {
            kind: self.kind,
            stage: self.stage,
            message: self.message.clone(),
            at: Utc::now(),
        }
    }
}

enum StepError {
    Stage(StageError),
    Store(StoreError),
}

impl From<StageError> for StepError {
    fn from(err: StageError) -> Self {
        StepError::Stage(err)
    }
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        StepError::Store(err)
    }
}

fn scrape_failure(err: ScrapeError) -> StageError {
    match err {
        ScrapeError::Timeout(url) => StageError::new(
            FailureKind::ScrapeTimeout,
            JobStage::Scraping,
            format!("timed out fetching `{url}`"),
        ),
        ScrapeError::Parse(message) => {
            StageError::new(FailureKind::ScrapeParseFailure, JobStage::Scraping, message)
        }
    }
}

fn driver_failure(stage: JobStage, err: DriverError) -> StageError {
    let kind = match (&err, stage) {
        (_, JobStage::Verifying) => FailureKind::VerificationFailure,
        (DriverError::Rejected(_), _) => FailureKind::SubmissionRejected,
        (DriverError::Timeout(_), _) => FailureKind::StageTimeout,
        (DriverError::FormFill(_), _) => FailureKind::FormFillFailure,
        (DriverError::Navigation(_) | DriverError::Unavailable(_), _) => {
            FailureKind::NavigationFailure
        }
    };
    // Rejections carry the destination's own wording.
    let message = match err {
        DriverError::Rejected(message) => message,
        other => other.to_string(),
    };
    StageError::new(kind, stage, message)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub source_price: Decimal,
    pub destination_price: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridArtifact {
    pub rows: Vec<VariationGridRow>,
    pub applied: Option<VariantApplyResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubmitIntent {
    source_url: String,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(ListingResult),
    Failed(JobError),
    Parked,
    Aborted,
    /// Another holder owns the job; nothing was written.
    ClaimLost,
    AlreadyTerminal(JobStage),
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed(_) => "completed",
            RunOutcome::Failed(_) => "failed",
            RunOutcome::Parked => "parked",
            RunOutcome::Aborted => "aborted",
            RunOutcome::ClaimLost => "claim_lost",
            RunOutcome::AlreadyTerminal(_) => "already_terminal",
        }
    }
}

struct LiveSession {
    session: Box<dyn ListingSession>,
    grid_applied: bool,
}

/// Per-run cache of artifacts and the open form, if any.
#[derive(Default)]
struct JobContext {
    product: Option<SourceProduct>,
    policy: Option<PricingPolicy>,
    session: Option<LiveSession>,
    result: Option<ListingResult>,
}

#[derive(Clone)]
pub struct JobRunner {
    store: ProgressStore,
    source: Arc<dyn SourceExtractor>,
    driver: Arc<dyn ListingDriver>,
    events: EventBus,
    config: Arc<RunnerConfig>,
    control: RunControl,
}

impl JobRunner {
    pub fn new(
        store: ProgressStore,
        source: Arc<dyn SourceExtractor>,
        driver: Arc<dyn ListingDriver>,
        events: EventBus,
        config: RunnerConfig,
        control: RunControl,
    ) -> Self {
        Self {
            store,
            source,
            driver,
            events,
            config: Arc::new(config),
            control,
        }
    }

    /// Claims `job_id` with `token` and advances it until it finishes, parks,
    /// or loses the claim. A resumed job continues at its recorded stage.
    pub async fn run(&self, job_id: &str, token: &str) -> Result<RunOutcome, StoreError> {
        match self.store.claim(job_id, token).await {
            Ok(_) => {}
            Err(StoreError::ClaimConflict { .. }) => return Ok(RunOutcome::ClaimLost),
            Err(StoreError::Terminal { stage, .. }) => {
                return Ok(RunOutcome::AlreadyTerminal(stage));
            }
            Err(StoreError::InvalidState { .. }) => return Ok(RunOutcome::Parked),
            Err(err) => return Err(err),
        }

        let mut ctx = JobContext::default();
        let outcome = match self.drive(job_id, token, &mut ctx).await {
            Err(StoreError::ClaimConflict { .. } | StoreError::Terminal { .. }) => {
                self.stopped(job_id).await
            }
            other => other,
        }?;
        crate::metrics::job_finished(outcome.label());
        Ok(outcome)
    }

    async fn stopped(&self, job_id: &str) -> Result<RunOutcome, StoreError> {
        let job = self.store.require_job(job_id).await?;
        info!(target = "crosslist.runner", job_id, stage = %job.stage, "claim_released_elsewhere");
        Ok(if job.stage == JobStage::Aborted {
            RunOutcome::Aborted
        } else {
            RunOutcome::ClaimLost
        })
    }

    async fn holds_claim(&self, job_id: &str, token: &str) -> Result<bool, StoreError> {
        let job = self.store.require_job(job_id).await?;
        Ok(job.claim_token.as_deref() == Some(token))
    }

    async fn drive(
        &self,
        job_id: &str,
        token: &str,
        ctx: &mut JobContext,
    ) -> Result<RunOutcome, StoreError> {
        let mut aborts = self.control.abort_signals();
        loop {
            while self.control.wait_while_paused(&mut aborts).await == Wake::Abort {
                if !self.holds_claim(job_id, token).await? {
                    return self.stopped(job_id).await;
                }
            }

            let job = self.store.require_job(job_id).await?;
            if job.claim_token.as_deref() != Some(token) {
                return self.stopped(job_id).await;
            }

            let stage = job.stage;
            let started = Instant::now();
            debug!(target = "crosslist.runner", job_id, stage = %stage, attempts = job.attempts, "stage_started");

            let step = match timeout(self.config.stage_timeout, self.execute(&job, token, ctx)).await {
                Ok(step) => step,
                Err(_) => Err(StepError::Stage(StageError::new(
                    FailureKind::StageTimeout,
                    stage,
                    format!("no progress within {}s", self.config.stage_timeout.as_secs()),
                ))),
            };

            match step {
                Ok(payload_ref) => {
                    self.store
                        .append_checkpoint(
                            job_id,
                            token,
                            ProgressCheckpoint {
                                stage,
                                timestamp: Utc::now(),
                                payload_ref,
                            },
                        )
                        .await?;
                    let Some(next) = stage.next() else {
                        return Err(StoreError::Terminal {
                            job_id: job_id.to_string(),
                            stage,
                        });
                    };
                    let result = ctx.result.clone();
                    let advanced = self
                        .store
                        .update_claimed(job_id, token, |job| {
                            job.stage = next;
                            job.attempts = 0;
                            job.last_error = None;
                            if next == JobStage::Completed {
                                job.result = result.clone();
                                job.claim_token = None;
                            }
                        })
                        .await?;
                    crate::metrics::stage_elapsed(stage.as_str(), started.elapsed().as_millis());
                    self.events.emit(&advanced, format!("entered {next}"));

                    if next == JobStage::Completed {
                        return match advanced.result {
                            Some(result) => Ok(RunOutcome::Completed(result)),
                            None => Err(StoreError::Serde(format!(
                                "job {job_id} completed without a listing result"
                            ))),
                        };
                    }
                }
                Err(StepError::Store(err)) => return Err(err),
                Err(StepError::Stage(err)) => {
                    if let Some(outcome) = self.handle_failure(&job, token, ctx, err).await? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// Applies the failure's disposition. `None` means retry the stage.
    async fn handle_failure(
        &self,
        job: &Job,
        token: &str,
        ctx: &mut JobContext,
        err: StageError,
    ) -> Result<Option<RunOutcome>, StoreError> {
        // A broken form cannot be trusted on the next attempt.
        ctx.session = None;
        let record = err.record();

        match err.kind().disposition() {
            Disposition::Park => {
                let parked = self
                    .store
                    .update_claimed(&job.id, token, |job| {
                        job.needs_manual_review = true;
                        job.review_resolved = false;
                        job.last_error = Some(record.clone());
                        job.claim_token = None;
                    })
                    .await?;
                warn!(target = "crosslist.runner", job_id = %job.id, error = %err, "job_parked_for_review");
                self.events
                    .emit(&parked, format!("awaiting manual review: {}", err.detail()));
                Ok(Some(RunOutcome::Parked))
            }
            Disposition::Retry if self.config.retry.allows_retry(job.attempts + 1) => {
                let attempts = job.attempts + 1;
                let mut aborts = self.control.abort_signals();
                self.store
                    .update_claimed(&job.id, token, |job| {
                        job.attempts = attempts;
                        job.last_error = Some(record.clone());
                    })
                    .await?;
                let delay = self.config.retry.backoff_delay(attempts);
                warn!(
                    target = "crosslist.runner",
                    job_id = %job.id,
                    stage = %err.stage(),
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "stage_retry_scheduled"
                );
                crate::metrics::stage_retry(err.stage().as_str(), attempts);
                let deadline = TokioInstant::now() + delay;
                while self.control.backoff_until(deadline, &mut aborts).await == Wake::Abort {
                    if !self.holds_claim(&job.id, token).await? {
                        break;
                    }
                }
                Ok(None)
            }
            Disposition::Retry | Disposition::Fatal => {
                let attempts = if err.kind().disposition() == Disposition::Retry {
                    job.attempts + 1
                } else {
                    job.attempts
                };
                let failed = self
                    .store
                    .update_claimed(&job.id, token, |job| {
                        job.stage = JobStage::Failed;
                        job.attempts = attempts;
                        job.last_error = Some(record.clone());
                        job.claim_token = None;
                    })
                    .await?;
                warn!(target = "crosslist.runner", job_id = %job.id, kind = ?err.kind(), error = %err, "job_failed");
                self.events.emit(&failed, err.to_string());
                Ok(Some(RunOutcome::Failed(record)))
            }
        }
    }

    /// Runs the work of `job.stage` and returns the artifact it wrote.
    async fn execute(
        &self,
        job: &Job,
        token: &str,
        ctx: &mut JobContext,
    ) -> Result<Option<String>, StepError> {
        match job.stage {
            JobStage::Queued => Ok(None),
            JobStage::Scraping => self.scrape(job, token, ctx).await.map(Some),
            JobStage::Pricing => self.price(job, token, ctx).await.map(Some),
            JobStage::VariantMatching => self.match_variants(job, token, ctx).await.map(Some),
            JobStage::FormFilling => self.fill_form(job, token, ctx).await.map(Some),
            JobStage::VariationBuilding => self.build_variations(job, token, ctx).await.map(Some),
            JobStage::Submitting => self.submit(job, token, ctx).await.map(Some),
            JobStage::Verifying => self.verify(job, token, ctx).await.map(Some),
            JobStage::Completed | JobStage::Failed | JobStage::Aborted => {
                Err(StoreError::Terminal {
                    job_id: job.id.clone(),
                    stage: job.stage,
                }
                .into())
            }
        }
    }

    async fn scrape(
        &self,
        job: &Job,
        token: &str,
        ctx: &mut JobContext,
    ) -> Result<String, StepError> {
        let product = self
            .source
            .scrape(&job.source_url)
            .await
            .map_err(scrape_failure)?;
        validate_product(&product).map_err(|message| {
            StageError::new(FailureKind::ScrapeParseFailure, JobStage::Scraping, message)
        })?;
        let key = self
            .store
            .put_artifact(&job.id, token, SOURCE_ARTIFACT, &product)
            .await?;
        info!(
            target = "crosslist.runner",
            job_id = %job.id,
            axes = product.variation_axes.len(),
            skus = product.sku_table.len(),
            "source_product_scraped"
        );
        ctx.product = Some(product);
        Ok(key)
    }

    async fn price(&self, job: &Job, token: &str, ctx: &mut JobContext) -> Result<String, StepError> {
        let product = self.product(job, ctx).await?;
        let policy = self.policy(job, ctx).await?;
        let quote = PriceQuote {
            source_price: product.base_price,
            destination_price: compute_destination_price(product.base_price, &policy)
                .map_err(|err| StageError::internal(job.stage, err.to_string()))?,
            currency: product.currency.clone(),
        };
        Ok(self
            .store
            .put_artifact(&job.id, token, PRICE_ARTIFACT, &quote)
            .await?)
    }

    async fn match_variants(
        &self,
        job: &Job,
        token: &str,
        ctx: &mut JobContext,
    ) -> Result<String, StepError> {
        let product = self.product(job, ctx).await?;
        if product.variation_axes.is_empty() {
            return Ok(self
                .store
                .put_artifact(&job.id, token, MAPPING_ARTIFACT, &AxisMappingReport::default())
                .await?);
        }

        let catalog = self
            .driver
            .option_catalog(job.destination_marketplace, &product.axis_names())
            .await
            .map_err(|err| driver_failure(job.stage, err))?;
        let overrides = self.store.overrides(&job.id).await?;
        let report = map_axes(&product.variation_axes, &catalog, &overrides);
        let key = self
            .store
            .put_artifact(&job.id, token, MAPPING_ARTIFACT, &report)
            .await?;

        if !report.unmatched_axes.is_empty() {
            return Err(StageError::new(
                FailureKind::VariantUnmatched,
                job.stage,
                format!(
                    "no destination options for axes: {}",
                    report.unmatched_axes.join(", ")
                ),
            )
            .into());
        }
        Ok(key)
    }

    async fn fill_form(
        &self,
        job: &Job,
        token: &str,
        ctx: &mut JobContext,
    ) -> Result<String, StepError> {
        let product = self.product(job, ctx).await?;
        let quote: PriceQuote = self.required_artifact(job, PRICE_ARTIFACT).await?;
        let fields = BasicFields {
            title: product.title.clone(),
            price: quote.destination_price,
            currency: quote.currency,
            images: product.images.clone(),
            description: product.description.clone(),
        };

        let mut session = self
            .driver
            .navigate(job.destination_marketplace, &job.source_url)
            .await
            .map_err(|err| driver_failure(job.stage, err))?;
        session
            .fill_basic_fields(&fields)
            .await
            .map_err(|err| driver_failure(job.stage, err))?;
        ctx.session = Some(LiveSession {
            session,
            grid_applied: false,
        });

        Ok(self
            .store
            .put_artifact(&job.id, token, FORM_ARTIFACT, &fields)
            .await?)
    }

    async fn build_variations(
        &self,
        job: &Job,
        token: &str,
        ctx: &mut JobContext,
    ) -> Result<String, StepError> {
        let product = self.product(job, ctx).await?;
        let policy = self.policy(job, ctx).await?;
        let mappings: AxisMappingReport = self.required_artifact(job, MAPPING_ARTIFACT).await?;
        let destination = self.driver.limits();
        let limits = GridLimits {
            max_variations: self.config.max_variations.min(destination.max_variations),
            max_quantity: destination.max_quantity,
        };

        let rows = build_grid(&product, &policy, &mappings, &limits).map_err(|err| match err {
            GridError::CapacityExceeded { .. } => {
                StageError::new(FailureKind::GridCapacityExceeded, job.stage, err.to_string())
            }
            GridError::DuplicateAssignment(_) | GridError::Pricing(_) => {
                StageError::internal(job.stage, err.to_string())
            }
        })?;
        if rows.is_empty() && !product.variation_axes.is_empty() {
            return Err(StageError::new(
                FailureKind::OutOfStock,
                job.stage,
                "no variation combination is in stock",
            )
            .into());
        }

        let live = self.ensure_session(job, ctx, false).await?;
        let applied = if rows.is_empty() {
            None
        } else {
            let applied = live
                .session
                .apply_variation_grid(&rows)
                .await
                .map_err(|err| driver_failure(job.stage, err))?;
            for warning in &applied.warnings {
                debug!(target = "crosslist.runner", job_id = %job.id, warning = %warning, "variation_warning");
            }
            Some(applied)
        };
        live.grid_applied = true;

        Ok(self
            .store
            .put_artifact(&job.id, token, GRID_ARTIFACT, &GridArtifact { rows, applied })
            .await?)
    }

    async fn submit(&self, job: &Job, token: &str, ctx: &mut JobContext) -> Result<String, StepError> {
        let intent: Option<SubmitIntent> = self.store.artifact(&job.id, INTENT_ARTIFACT).await?;
        if intent.is_some() {
            let existing = self
                .driver
                .find_listing(&job.source_url)
                .await
                .map_err(|err| driver_failure(job.stage, err))?;
            if let Some(listing_id) = existing {
                info!(target = "crosslist.runner", job_id = %job.id, listing_id = %listing_id, "submit_reconciled");
                return Ok(self
                    .store
                    .put_artifact(&job.id, token, RECEIPT_ARTIFACT, &SubmitReceipt { listing_id })
                    .await?);
            }
        }

        self.store
            .put_artifact(
                &job.id,
                token,
                INTENT_ARTIFACT,
                &SubmitIntent {
                    source_url: job.source_url.clone(),
                    at: Utc::now(),
                },
            )
            .await?;

        let receipt = {
            let live = self.ensure_session(job, ctx, true).await?;
            live.session
                .submit()
                .await
                .map_err(|err| driver_failure(job.stage, err))?
        };
        ctx.session = None;

        Ok(self
            .store
            .put_artifact(&job.id, token, RECEIPT_ARTIFACT, &receipt)
            .await?)
    }

    async fn verify(&self, job: &Job, token: &str, ctx: &mut JobContext) -> Result<String, StepError> {
        let receipt: SubmitReceipt = self.required_artifact(job, RECEIPT_ARTIFACT).await?;
        let confirmed = self
            .driver
            .verify(&receipt.listing_id)
            .await
            .map_err(|err| driver_failure(job.stage, err))?;
        if !confirmed {
            return Err(StageError::new(
                FailureKind::VerificationFailure,
                job.stage,
                format!("listing {} is not visible yet", receipt.listing_id),
            )
            .into());
        }

        let result = ListingResult {
            listing_id: receipt.listing_id,
            verified_at: Utc::now(),
        };
        let key = self
            .store
            .put_artifact(&job.id, token, RESULT_ARTIFACT, &result)
            .await?;
        ctx.result = Some(result);
        Ok(key)
    }

    /// Returns the open form, replaying navigation, basic fields and (with
    /// `with_grid`) the recorded grid when this process has none.
    async fn ensure_session<'a>(
        &self,
        job: &Job,
        ctx: &'a mut JobContext,
        with_grid: bool,
    ) -> Result<&'a mut LiveSession, StepError> {
        if ctx.session.is_none() {
            let fields: BasicFields = self.required_artifact(job, FORM_ARTIFACT).await?;
            let mut session = self
                .driver
                .navigate(job.destination_marketplace, &job.source_url)
                .await
                .map_err(|err| driver_failure(job.stage, err))?;
            session
                .fill_basic_fields(&fields)
                .await
                .map_err(|err| driver_failure(job.stage, err))?;
            info!(target = "crosslist.runner", job_id = %job.id, stage = %job.stage, "form_session_replayed");
            ctx.session = Some(LiveSession {
                session,
                grid_applied: false,
            });
        }

        let Some(live) = ctx.session.as_mut() else {
            return Err(StageError::internal(job.stage, "form session unavailable").into());
        };
        if with_grid && !live.grid_applied {
            let grid: GridArtifact = self.required_artifact(job, GRID_ARTIFACT).await?;
            if !grid.rows.is_empty() {
                live.session
                    .apply_variation_grid(&grid.rows)
                    .await
                    .map_err(|err| driver_failure(job.stage, err))?;
            }
            live.grid_applied = true;
        }
        Ok(live)
    }

    async fn product(&self, job: &Job, ctx: &mut JobContext) -> Result<SourceProduct, StepError> {
        if let Some(product) = &ctx.product {
            return Ok(product.clone());
        }
        let product: SourceProduct = self.required_artifact(job, SOURCE_ARTIFACT).await?;
        ctx.product = Some(product.clone());
        Ok(product)
    }

    async fn policy(&self, job: &Job, ctx: &mut JobContext) -> Result<PricingPolicy, StepError> {
        if let Some(policy) = &ctx.policy {
            return Ok(policy.clone());
        }
        let batch = self.store.batch(&job.batch_id).await?.ok_or_else(|| {
            StageError::internal(job.stage, format!("batch {} is missing", job.batch_id))
        })?;
        ctx.policy = Some(batch.policy.clone());
        Ok(batch.policy)
    }

    async fn required_artifact<T: serde::de::DeserializeOwned>(
        &self,
        job: &Job,
        name: &str,
    ) -> Result<T, StepError> {
        self.store.artifact(&job.id, name).await?.ok_or_else(|| {
            StageError::internal(job.stage, format!("artifact `{name}` is missing")).into()
        })
    }
}

fn validate_product(product: &SourceProduct) -> Result<(), String> {
    if product.title.trim().is_empty() {
        return Err("product has no title".into());
    }
    if product.base_price < Decimal::ZERO {
        return Err(format!("negative base price {}", product.base_price));
    }
    let axes: HashSet<String> = product
        .variation_axes
        .iter()
        .map(|axis| normalize_label(&axis.name))
        .collect();
    for sku in &product.sku_table {
        if sku.price < Decimal::ZERO {
            return Err(format!("negative sku price {}", sku.price));
        }
        if let Some(axis) = sku
            .attribute_assignment
            .keys()
            .find(|axis| !axes.contains(&normalize_label(axis)))
        {
            return Err(format!("sku references unknown axis `{axis}`"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::DestinationLimits;
    use crate::adapters::testing::{ScriptedDriver, ScriptedSource};
    use crate::models::{AxisValue, Batch, MarketplaceId, MatchKind, SkuRow, VariationAxis};
    use std::collections::BTreeMap;

    const URL: &str = "https://shop.example/p/linen-tee";

    struct Harness {
        store: ProgressStore,
        source: ScriptedSource,
        driver: ScriptedDriver,
        events: EventBus,
        paused: watch::Sender<bool>,
        aborts: watch::Sender<u64>,
        job_id: String,
    }

    impl Harness {
        async fn new(driver: ScriptedDriver) -> Self {
            let store = ProgressStore::in_memory();
            let job = Job::queued("batch-1", URL, MarketplaceId::EbayUs);
            let batch = Batch {
                id: "batch-1".into(),
                job_ids: vec![job.id.clone()],
                policy: PricingPolicy::percentage(Decimal::from(30)),
                concurrency: 1,
                destination: MarketplaceId::EbayUs,
                created_at: Utc::now(),
            };
            store.create_batch(&batch, &[job.clone()]).await.unwrap();
            let (paused, _) = watch::channel(false);
            let (aborts, _) = watch::channel(0);
            Self {
                store,
                source: ScriptedSource::new(),
                driver,
                events: EventBus::new(64),
                paused,
                aborts,
                job_id: job.id,
            }
        }

        fn runner(&self) -> JobRunner {
            JobRunner::new(
                self.store.clone(),
                Arc::new(self.source.clone()),
                Arc::new(self.driver.clone()),
                self.events.clone(),
                RunnerConfig {
                    retry: RetryPolicy::new(3, Duration::ZERO, Duration::ZERO),
                    stage_timeout: Duration::from_secs(30),
                    max_variations: 250,
                },
                RunControl::new(self.paused.subscribe(), self.aborts.subscribe()),
            )
        }

        async fn job(&self) -> Job {
            self.store.require_job(&self.job_id).await.unwrap()
        }
    }

    fn product_with(axes: Vec<VariationAxis>, sku_table: Vec<SkuRow>) -> SourceProduct {
        SourceProduct {
            title: "Linen tee".into(),
            description: None,
            base_price: Decimal::from(10),
            currency: "USD".into(),
            images: vec!["https://img.example/tee.jpg".into()],
            variation_axes: axes,
            sku_table,
        }
    }

    fn axis(name: &str, labels: &[&str]) -> VariationAxis {
        VariationAxis {
            name: name.into(),
            values: labels
                .iter()
                .map(|label| AxisValue {
                    label: label.to_string(),
                    image_ref: None,
                    available: true,
                })
                .collect(),
        }
    }

    fn sku(pairs: &[(&str, &str)], stock: u32) -> SkuRow {
        SkuRow {
            attribute_assignment: pairs
                .iter()
                .map(|(axis, label)| (axis.to_string(), label.to_string()))
                .collect::<BTreeMap<_, _>>(),
            price: Decimal::from(10),
            stock,
        }
    }

    #[tokio::test]
    async fn completes_with_one_checkpoint_per_stage() {
        let harness = Harness::new(ScriptedDriver::new()).await;
        let mut rx = harness.events.subscribe();
        let outcome = harness.runner().run(&harness.job_id, "inst:1").await.unwrap();
        let RunOutcome::Completed(result) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };

        let job = harness.job().await;
        assert_eq!(job.stage, JobStage::Completed);
        assert!(job.claim_token.is_none());
        assert_eq!(job.result.as_ref(), Some(&result));

        let stages: Vec<JobStage> = harness
            .store
            .checkpoints(&harness.job_id)
            .await
            .unwrap()
            .into_iter()
            .map(|cp| cp.stage)
            .collect();
        assert_eq!(
            stages,
            vec![
                JobStage::Queued,
                JobStage::Scraping,
                JobStage::Pricing,
                JobStage::VariantMatching,
                JobStage::FormFilling,
                JobStage::VariationBuilding,
                JobStage::Submitting,
                JobStage::Verifying,
            ]
        );

        let listings = harness.driver.inner.listings().await;
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].listing_id, result.listing_id);
        assert_eq!(harness.source.scrapes(), 1);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.stage, JobStage::Scraping);
    }

    #[tokio::test]
    async fn transient_scrape_failures_are_retried() {
        let harness = Harness::new(ScriptedDriver::new()).await;
        harness.source.fail_next(ScrapeError::Timeout(URL.into()));
        harness.source.fail_next(ScrapeError::Timeout(URL.into()));
        let outcome = harness.runner().run(&harness.job_id, "inst:1").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(harness.source.scrapes(), 3);
        assert!(harness.job().await.last_error.is_none());
    }

    #[tokio::test]
    async fn exhausted_budget_fails_the_job() {
        let harness = Harness::new(ScriptedDriver::new()).await;
        for _ in 0..3 {
            harness.source.fail_next(ScrapeError::Parse("no product".into()));
        }
        let outcome = harness.runner().run(&harness.job_id, "inst:1").await.unwrap();
        let RunOutcome::Failed(error) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(error.kind, FailureKind::ScrapeParseFailure);
        let job = harness.job().await;
        assert_eq!(job.stage, JobStage::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.claim_token.is_none());
    }

    #[tokio::test]
    async fn rejection_is_fatal_and_verbatim() {
        let harness = Harness::new(ScriptedDriver::new()).await;
        harness
            .driver
            .fail_next_submit(DriverError::Rejected("Item specifics missing: Brand".into()));
        let outcome = harness.runner().run(&harness.job_id, "inst:1").await.unwrap();
        let RunOutcome::Failed(error) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(error.kind, FailureKind::SubmissionRejected);
        assert_eq!(error.message, "Item specifics missing: Brand");
        assert_eq!(harness.driver.submits(), 1);
    }

    #[tokio::test]
    async fn unmatched_axis_parks_and_overrides_resume() {
        let harness = Harness::new(ScriptedDriver::new()).await;
        harness
            .source
            .insert(
                URL,
                product_with(
                    vec![axis("Color", &["Red"]), axis("Material", &["Hemp"])],
                    vec![sku(&[("Color", "Red"), ("Material", "Hemp")], 3)],
                ),
            )
            .await;

        let outcome = harness.runner().run(&harness.job_id, "inst:1").await.unwrap();
        assert_eq!(outcome, RunOutcome::Parked);
        let job = harness.job().await;
        assert_eq!(job.stage, JobStage::VariantMatching);
        assert!(job.needs_manual_review);
        assert!(job.claim_token.is_none());
        assert_eq!(
            job.last_error.map(|err| err.kind),
            Some(FailureKind::VariantUnmatched)
        );

        harness
            .store
            .resolve_review(
                &harness.job_id,
                &[crate::models::MappingOverride {
                    axis: "Material".into(),
                    source_label: "Hemp".into(),
                    destination_axis: Some("Material".into()),
                    destination_option_id: "material-hemp".into(),
                    destination_label: "Hemp".into(),
                }],
            )
            .await
            .unwrap();
        let outcome = harness.runner().run(&harness.job_id, "inst:2").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(harness.source.scrapes(), 1);

        let report: AxisMappingReport = harness
            .store
            .artifact(&harness.job_id, MAPPING_ARTIFACT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.count(MatchKind::Manual), 1);
    }

    #[tokio::test]
    async fn unpriceable_product_fails_without_retry() {
        let harness = Harness::new(ScriptedDriver::new()).await;
        let mut product = product_with(Vec::new(), Vec::new());
        product.base_price = Decimal::MAX;
        harness.source.insert(URL, product).await;

        let outcome = harness.runner().run(&harness.job_id, "inst:1").await.unwrap();
        let RunOutcome::Failed(error) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(error.kind, FailureKind::Internal);
        assert_eq!(error.stage, JobStage::Pricing);
        let job = harness.job().await;
        assert_eq!(job.stage, JobStage::Failed);
        assert!(job.claim_token.is_none());
        assert_eq!(harness.driver.submits(), 0);
    }

    #[tokio::test]
    async fn losing_claim_does_no_work() {
        let harness = Harness::new(ScriptedDriver::new()).await;
        harness.store.claim(&harness.job_id, "other:1").await.unwrap();
        let outcome = harness.runner().run(&harness.job_id, "inst:1").await.unwrap();
        assert_eq!(outcome, RunOutcome::ClaimLost);
        assert_eq!(harness.source.scrapes(), 0);
        assert!(harness.store.checkpoints(&harness.job_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_replays_the_form_session() {
        let harness = Harness::new(ScriptedDriver::new()).await;
        harness
            .driver
            .fail_next_apply(DriverError::FormFill("grid widget detached".into()));
        let outcome = harness.runner().run(&harness.job_id, "inst:1").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(harness.driver.navigations(), 2);
        assert_eq!(harness.source.scrapes(), 1);
    }

    #[tokio::test]
    async fn empty_grid_is_out_of_stock() {
        let harness = Harness::new(ScriptedDriver::new()).await;
        harness
            .source
            .insert(
                URL,
                product_with(
                    vec![axis("Color", &["Red", "Blue"])],
                    vec![sku(&[("Color", "Red")], 0), sku(&[("Color", "Blue")], 0)],
                ),
            )
            .await;
        let outcome = harness.runner().run(&harness.job_id, "inst:1").await.unwrap();
        let RunOutcome::Failed(error) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(error.kind, FailureKind::OutOfStock);
        assert_eq!(error.stage, JobStage::VariationBuilding);
    }

    #[tokio::test]
    async fn grid_over_destination_limit_is_fatal() {
        let harness = Harness::new(ScriptedDriver::with_limits(DestinationLimits {
            max_variations: 4,
            max_quantity: None,
        }))
        .await;
        let outcome = harness.runner().run(&harness.job_id, "inst:1").await.unwrap();
        let RunOutcome::Failed(error) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(error.kind, FailureKind::GridCapacityExceeded);
    }

    #[tokio::test]
    async fn resume_after_crash_mid_form_filling_skips_scraping() {
        let harness = Harness::new(ScriptedDriver::new()).await;
        harness.driver.hang_navigate(true);
        let crashed = tokio::time::timeout(
            Duration::from_millis(200),
            harness.runner().run(&harness.job_id, "dead:1"),
        )
        .await;
        assert!(crashed.is_err());
        assert_eq!(harness.job().await.stage, JobStage::FormFilling);

        harness.driver.hang_navigate(false);
        assert!(
            harness
                .store
                .clear_stale_claim(&harness.job_id, "dead:1")
                .await
                .unwrap()
        );
        let outcome = harness.runner().run(&harness.job_id, "live:1").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(harness.source.scrapes(), 1);
    }

    #[tokio::test]
    async fn crash_after_submit_reuses_the_listing() {
        let harness = Harness::new(ScriptedDriver::new()).await;
        harness.driver.hang_after_submit(true);
        let crashed = tokio::time::timeout(
            Duration::from_millis(200),
            harness.runner().run(&harness.job_id, "dead:1"),
        )
        .await;
        assert!(crashed.is_err());
        assert_eq!(harness.job().await.stage, JobStage::Submitting);

        harness.driver.hang_after_submit(false);
        harness
            .store
            .clear_stale_claim(&harness.job_id, "dead:1")
            .await
            .unwrap();
        let outcome = harness.runner().run(&harness.job_id, "live:1").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(harness.driver.submits(), 1);
        assert_eq!(harness.driver.inner.listings().await.len(), 1);
    }

    #[tokio::test]
    async fn abort_during_pause_stops_the_worker() {
        let harness = Harness::new(ScriptedDriver::new()).await;
        harness.paused.send_replace(true);
        let runner = harness.runner();
        let job_id = harness.job_id.clone();
        let task = tokio::spawn(async move { runner.run(&job_id, "inst:1").await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.store.abort(&harness.job_id).await.unwrap();
        harness.aborts.send_modify(|generation| *generation += 1);

        let outcome = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("worker stopped")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, RunOutcome::Aborted);
        assert_eq!(harness.source.scrapes(), 0);
    }

    #[tokio::test]
    async fn abort_of_another_job_keeps_the_pause() {
        let harness = Harness::new(ScriptedDriver::new()).await;
        harness.paused.send_replace(true);
        let runner = harness.runner();
        let job_id = harness.job_id.clone();
        let task = tokio::spawn(async move { runner.run(&job_id, "inst:1").await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.aborts.send_modify(|generation| *generation += 1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!task.is_finished());
        assert_eq!(harness.job().await.stage, JobStage::Queued);
        assert_eq!(harness.source.scrapes(), 0);

        harness.paused.send_replace(false);
        let outcome = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("worker resumed")
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(_)));
    }
}
