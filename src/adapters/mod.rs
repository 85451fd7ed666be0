//! Collaborator seams: where product data comes from and where listings go.

pub mod demo;
pub mod jsonld;
#[cfg(test)]
pub mod testing;

use crate::models::{DestinationAxis, MarketplaceId, SourceProduct, VariationGridRow};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("timed out fetching `{0}`")]
    Timeout(String),
    #[error("could not read product: {0}")]
    Parse(String),
}

#[async_trait]
pub trait SourceExtractor: Send + Sync {
    async fn scrape(&self, url: &str) -> Result<SourceProduct, ScrapeError>;
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("form fill failed: {0}")]
    FormFill(String),
    #[error("{0}")]
    Rejected(String),
    #[error("destination timed out: {0}")]
    Timeout(String),
    #[error("destination unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationLimits {
    pub max_variations: usize,
    pub max_quantity: Option<u32>,
}

/// Single-variant fields entered before the variation grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicFields {
    pub title: String,
    pub price: Decimal,
    pub currency: String,
    pub images: Vec<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantApplyResult {
    pub matched_axes: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub listing_id: String,
}

/// An open listing form. Lives only in the worker that navigated to it.
#[async_trait]
pub trait ListingSession: Send {
    async fn fill_basic_fields(&mut self, fields: &BasicFields) -> Result<(), DriverError>;
    async fn apply_variation_grid(
        &mut self,
        rows: &[VariationGridRow],
    ) -> Result<VariantApplyResult, DriverError>;
    async fn submit(&mut self) -> Result<SubmitReceipt, DriverError>;
}

#[async_trait]
pub trait ListingDriver: Send + Sync {
    async fn option_catalog(
        &self,
        marketplace: MarketplaceId,
        axes: &[String],
    ) -> Result<Vec<DestinationAxis>, DriverError>;

    fn limits(&self) -> DestinationLimits;

    async fn navigate(
        &self,
        marketplace: MarketplaceId,
        source_url: &str,
    ) -> Result<Box<dyn ListingSession>, DriverError>;

    /// Listing already created for `source_url`, if the destination has one.
    async fn find_listing(&self, source_url: &str) -> Result<Option<String>, DriverError>;

    async fn verify(&self, listing_id: &str) -> Result<bool, DriverError>;
}
