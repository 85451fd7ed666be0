use crate::pricing::PricingPolicy;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use uuid::Uuid;

/// Ordered stages of a cross-listing job. The last three are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    Scraping,
    Pricing,
    VariantMatching,
    FormFilling,
    VariationBuilding,
    Submitting,
    Verifying,
    Completed,
    Failed,
    Aborted,
}

impl JobStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Stage reached after this one succeeds. Terminal stages have no successor.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Queued => Some(Self::Scraping),
            Self::Scraping => Some(Self::Pricing),
            Self::Pricing => Some(Self::VariantMatching),
            Self::VariantMatching => Some(Self::FormFilling),
            Self::FormFilling => Some(Self::VariationBuilding),
            Self::VariationBuilding => Some(Self::Submitting),
            Self::Submitting => Some(Self::Verifying),
            Self::Verifying => Some(Self::Completed),
            Self::Completed | Self::Failed | Self::Aborted => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Scraping => "scraping",
            Self::Pricing => "pricing",
            Self::VariantMatching => "variant_matching",
            Self::FormFilling => "form_filling",
            Self::VariationBuilding => "variation_building",
            Self::Submitting => "submitting",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(clippy::enum_variant_names)]
pub enum MarketplaceId {
    #[default]
    EbayUs,
    #[serde(alias = "EBAY_GB")]
    EbayUk,
    EbayDe,
}

impl MarketplaceId {
    pub fn ebay_code(&self) -> &'static str {
        match self {
            MarketplaceId::EbayUs => "EBAY_US",
            MarketplaceId::EbayUk => "EBAY_GB",
            MarketplaceId::EbayDe => "EBAY_DE",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_uppercase().as_str() {
            "EBAY_US" => Some(MarketplaceId::EbayUs),
            "EBAY_GB" | "EBAY_UK" => Some(MarketplaceId::EbayUk),
            "EBAY_DE" => Some(MarketplaceId::EbayDe),
            _ => None,
        }
    }
}

/// Failure categories recorded on a job. See [`FailureKind::disposition`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ScrapeTimeout,
    ScrapeParseFailure,
    VariantUnmatched,
    NavigationFailure,
    FormFillFailure,
    StageTimeout,
    VerificationFailure,
    GridCapacityExceeded,
    OutOfStock,
    SubmissionRejected,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry inside the stage until the budget runs out.
    Retry,
    /// Fail the job immediately.
    Fatal,
    /// Stop forward progress until an operator resolves it.
    Park,
}

impl FailureKind {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::ScrapeTimeout
            | Self::ScrapeParseFailure
            | Self::NavigationFailure
            | Self::FormFillFailure
            | Self::StageTimeout
            | Self::VerificationFailure => Disposition::Retry,
            Self::VariantUnmatched => Disposition::Park,
            Self::GridCapacityExceeded
            | Self::OutOfStock
            | Self::SubmissionRejected
            | Self::Internal => Disposition::Fatal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    pub kind: FailureKind,
    pub stage: JobStage,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingResult {
    pub listing_id: String,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub batch_id: String,
    pub source_url: String,
    pub destination_marketplace: MarketplaceId,
    pub stage: JobStage,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub claim_token: Option<String>,
    #[serde(default)]
    pub needs_manual_review: bool,
    /// Overrides were supplied but no worker has claimed the job since.
    #[serde(default)]
    pub review_resolved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<JobError>,
    #[serde(default)]
    pub result: Option<ListingResult>,
}

impl Job {
    pub fn queued(batch_id: &str, source_url: &str, destination: MarketplaceId) -> Self {
        let now = Utc::now();
        Self {
            id: job_id_for(batch_id, source_url),
            batch_id: batch_id.to_string(),
            source_url: source_url.to_string(),
            destination_marketplace: destination,
            stage: JobStage::Queued,
            attempts: 0,
            claim_token: None,
            needs_manual_review: false,
            review_resolved: false,
            created_at: now,
            updated_at: now,
            last_error: None,
            result: None,
        }
    }

    /// Whether a worker currently owns forward progress for this job. A
    /// resolved review stays inactive until a worker claims it.
    pub fn is_active(&self) -> bool {
        !self.stage.is_terminal() && self.stage != JobStage::Queued && !self.needs_manual_review
    }

    /// Parked and still waiting for operator overrides.
    pub fn awaiting_review(&self) -> bool {
        self.needs_manual_review && !self.review_resolved
    }
}

/// Stable id for the job created from `source_url` within `batch_id`.
pub fn job_id_for(batch_id: &str, source_url: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("{batch_id}|{}", source_url.trim()).as_bytes(),
    )
    .to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub job_ids: Vec<String>,
    pub policy: PricingPolicy,
    pub concurrency: usize,
    pub destination: MarketplaceId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AxisValue {
    pub label: String,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default = "default_true")]
    pub available: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariationAxis {
    pub name: String,
    pub values: Vec<AxisValue>,
}

impl VariationAxis {
    pub fn available_values(&self) -> impl Iterator<Item = &AxisValue> {
        self.values.iter().filter(|value| value.available)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkuRow {
    pub attribute_assignment: BTreeMap<String, String>,
    pub price: Decimal,
    pub stock: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceProduct {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub base_price: Decimal,
    pub currency: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub variation_axes: Vec<VariationAxis>,
    #[serde(default)]
    pub sku_table: Vec<SkuRow>,
}

impl SourceProduct {
    pub fn axis_names(&self) -> Vec<String> {
        self.variation_axes
            .iter()
            .map(|axis| axis.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DestinationOption {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DestinationAxis {
    pub name: String,
    pub options: Vec<DestinationOption>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Fuzzy,
    Manual,
    Unmatched,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantMapping {
    pub axis: String,
    #[serde(default)]
    pub destination_axis: Option<String>,
    pub source_label: String,
    #[serde(default)]
    pub destination_option_id: Option<String>,
    #[serde(default)]
    pub destination_label: Option<String>,
    pub match_kind: MatchKind,
}

/// Operator-supplied mapping used to resolve a job parked for review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingOverride {
    pub axis: String,
    pub source_label: String,
    #[serde(default)]
    pub destination_axis: Option<String>,
    pub destination_option_id: String,
    pub destination_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariationGridRow {
    pub attribute_assignment: BTreeMap<String, String>,
    pub destination_price: Decimal,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressCheckpoint {
    pub stage: JobStage,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub batch_id: String,
    pub stage: JobStage,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Read-only projection of a job returned by status queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub batch_id: String,
    pub source_url: String,
    pub stage: JobStage,
    pub attempts: u32,
    pub needs_manual_review: bool,
    pub last_error: Option<JobError>,
    pub result: Option<ListingResult>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobStatus {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            batch_id: job.batch_id.clone(),
            source_url: job.source_url.clone(),
            stage: job.stage,
            attempts: job.attempts,
            needs_manual_review: job.awaiting_review(),
            last_error: job.last_error.clone(),
            result: job.result.clone(),
            updated_at: job.updated_at,
        }
    }
}
