//! Scripted collaborators for engine tests.

use super::demo::{DemoDriver, DemoSource};
use super::{
    BasicFields, DestinationLimits, DriverError, ListingDriver, ListingSession, ScrapeError,
    SourceExtractor, SubmitReceipt, VariantApplyResult,
};
use crate::models::{DestinationAxis, MarketplaceId, SourceProduct, VariationGridRow};
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

#[derive(Clone, Default)]
pub struct ScriptedSource {
    inner: DemoSource,
    scrapes: Arc<AtomicUsize>,
    failures: Arc<Mutex<VecDeque<ScrapeError>>>,
    delay: Duration,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub async fn insert(&self, url: &str, product: SourceProduct) {
        self.inner.insert(url, product).await;
    }

    pub fn fail_next(&self, err: ScrapeError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn scrapes(&self) -> usize {
        self.scrapes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceExtractor for ScriptedSource {
    async fn scrape(&self, url: &str) -> Result<SourceProduct, ScrapeError> {
        self.scrapes.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failure = self.failures.lock().unwrap().pop_front();
        match failure {
            Some(err) => Err(err),
            None => self.inner.scrape(url).await,
        }
    }
}

/// Demo driver with failure injection and hang points.
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    pub inner: DemoDriver,
    hang_navigate: Arc<AtomicBool>,
    hang_after_submit: Arc<AtomicBool>,
    navigations: Arc<AtomicUsize>,
    submits: Arc<AtomicUsize>,
    apply_failures: Arc<Mutex<VecDeque<DriverError>>>,
    submit_failures: Arc<Mutex<VecDeque<DriverError>>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: DestinationLimits) -> Self {
        Self {
            inner: DemoDriver::new(limits),
            ..Self::default()
        }
    }

    pub fn hang_navigate(&self, hang: bool) {
        self.hang_navigate.store(hang, Ordering::SeqCst);
    }

    pub fn hang_after_submit(&self, hang: bool) {
        self.hang_after_submit.store(hang, Ordering::SeqCst);
    }

    pub fn fail_next_apply(&self, err: DriverError) {
        self.apply_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_submit(&self, err: DriverError) {
        self.submit_failures.lock().unwrap().push_back(err);
    }

    pub fn navigations(&self) -> usize {
        self.navigations.load(Ordering::SeqCst)
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ListingDriver for ScriptedDriver {
    async fn option_catalog(
        &self,
        marketplace: MarketplaceId,
        axes: &[String],
    ) -> Result<Vec<DestinationAxis>, DriverError> {
        self.inner.option_catalog(marketplace, axes).await
    }

    fn limits(&self) -> DestinationLimits {
        self.inner.limits()
    }

    async fn navigate(
        &self,
        marketplace: MarketplaceId,
        source_url: &str,
    ) -> Result<Box<dyn ListingSession>, DriverError> {
        self.navigations.fetch_add(1, Ordering::SeqCst);
        if self.hang_navigate.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let inner = self.inner.navigate(marketplace, source_url).await?;
        Ok(Box::new(ScriptedSession {
            inner,
            driver: self.clone(),
        }))
    }

    async fn find_listing(&self, source_url: &str) -> Result<Option<String>, DriverError> {
        self.inner.find_listing(source_url).await
    }

    async fn verify(&self, listing_id: &str) -> Result<bool, DriverError> {
        self.inner.verify(listing_id).await
    }
}

struct ScriptedSession {
    inner: Box<dyn ListingSession>,
    driver: ScriptedDriver,
}

#[async_trait]
impl ListingSession for ScriptedSession {
    async fn fill_basic_fields(&mut self, fields: &BasicFields) -> Result<(), DriverError> {
        self.inner.fill_basic_fields(fields).await
    }

    async fn apply_variation_grid(
        &mut self,
        rows: &[VariationGridRow],
    ) -> Result<VariantApplyResult, DriverError> {
        let failure = self.driver.apply_failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        self.inner.apply_variation_grid(rows).await
    }

    async fn submit(&mut self) -> Result<SubmitReceipt, DriverError> {
        self.driver.submits.fetch_add(1, Ordering::SeqCst);
        let failure = self.driver.submit_failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        let receipt = self.inner.submit().await?;
        if self.driver.hang_after_submit.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(receipt)
    }
}
