use super::{
    BasicFields, DestinationLimits, DriverError, ListingDriver, ListingSession, ScrapeError,
    SourceExtractor, SubmitReceipt, VariantApplyResult,
};
use crate::models::{
    AxisValue, DestinationAxis, DestinationOption, MarketplaceId, SkuRow, SourceProduct,
    VariationAxis, VariationGridRow,
};
use crate::variants::normalize_label;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    sync::Arc,
};
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

const DEMO_COLORS: [&str; 3] = ["Red", "Blue", "Black"];
const DEMO_SIZES: [&str; 4] = ["S", "M", "L", "XL"];

const CATALOG: [(&str, &[&str]); 2] = [
    ("Color", &["Red", "Blue", "Jet Black", "White", "Green"]),
    ("Size", &["XS", "S", "M", "L", "XL", "XXL"]),
];

fn seed_for(url: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    url.trim().hash(&mut hasher);
    hasher.finish()
}

/// Deterministic product source. Registered fixtures win; any other http(s)
/// URL yields a generated two-axis apparel product, or a single-variant one
/// when the last path segment contains `single`.
#[derive(Clone, Default)]
pub struct DemoSource {
    fixtures: Arc<RwLock<HashMap<String, SourceProduct>>>,
}

impl DemoSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, url: &str, product: SourceProduct) {
        self.fixtures
            .write()
            .await
            .insert(url.trim().to_string(), product);
    }

    fn generate(url: &str) -> Result<SourceProduct, ScrapeError> {
        let Some(rest) = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
        else {
            return Err(ScrapeError::Parse(format!("unsupported url `{url}`")));
        };
        let slug = rest
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or("item")
            .to_string();

        let seed = seed_for(url);
        let base_price = Decimal::new(1_000 + (seed % 9_000) as i64, 2);
        let title = format!("Demo {}", slug.replace(['-', '_'], " "));

        if slug.contains("single") {
            return Ok(SourceProduct {
                title,
                description: Some(format!("Generated from {url}")),
                base_price,
                currency: "USD".into(),
                images: vec![format!("https://img.example/{slug}/1.jpg")],
                variation_axes: Vec::new(),
                sku_table: Vec::new(),
            });
        }

        let axis = |name: &str, labels: &[&str]| VariationAxis {
            name: name.to_string(),
            values: labels
                .iter()
                .map(|label| AxisValue {
                    label: label.to_string(),
                    image_ref: None,
                    available: true,
                })
                .collect(),
        };

        let mut sku_table = Vec::new();
        for (ci, color) in DEMO_COLORS.iter().enumerate() {
            for (si, size) in DEMO_SIZES.iter().enumerate() {
                let index = ci * DEMO_SIZES.len() + si;
                let mut stock = ((seed >> (index * 3)) % 6) as u32;
                if index == 0 {
                    stock = stock.max(1);
                }
                let surcharge = if *size == "XL" {
                    Decimal::from(2)
                } else {
                    Decimal::ZERO
                };
                sku_table.push(SkuRow {
                    attribute_assignment: BTreeMap::from([
                        ("Color".to_string(), color.to_string()),
                        ("Size".to_string(), size.to_string()),
                    ]),
                    price: base_price + surcharge,
                    stock,
                });
            }
        }

        Ok(SourceProduct {
            title,
            description: Some(format!("Generated from {url}")),
            base_price,
            currency: "USD".into(),
            images: vec![
                format!("https://img.example/{slug}/1.jpg"),
                format!("https://img.example/{slug}/2.jpg"),
            ],
            variation_axes: vec![axis("Color", &DEMO_COLORS), axis("Size", &DEMO_SIZES)],
            sku_table,
        })
    }
}

#[async_trait]
impl SourceExtractor for DemoSource {
    async fn scrape(&self, url: &str) -> Result<SourceProduct, ScrapeError> {
        if let Some(product) = self.fixtures.read().await.get(url.trim()) {
            return Ok(product.clone());
        }
        Self::generate(url)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DemoListing {
    pub listing_id: String,
    pub source_url: String,
    pub marketplace: MarketplaceId,
    pub fields: BasicFields,
    pub rows: Vec<VariationGridRow>,
}

#[derive(Default)]
struct DemoState {
    listings: HashMap<String, DemoListing>,
    by_source: HashMap<String, String>,
}

/// In-memory destination with a fixed apparel catalog.
#[derive(Clone)]
pub struct DemoDriver {
    state: Arc<Mutex<DemoState>>,
    limits: DestinationLimits,
}

impl Default for DemoDriver {
    fn default() -> Self {
        Self::new(DestinationLimits {
            max_variations: 250,
            max_quantity: None,
        })
    }
}

impl DemoDriver {
    pub fn new(limits: DestinationLimits) -> Self {
        Self {
            state: Arc::new(Mutex::new(DemoState::default())),
            limits,
        }
    }

    pub async fn listings(&self) -> Vec<DemoListing> {
        let mut listings: Vec<DemoListing> =
            self.state.lock().await.listings.values().cloned().collect();
        listings.sort_by(|a, b| a.source_url.cmp(&b.source_url));
        listings
    }

    fn catalog() -> Vec<DestinationAxis> {
        CATALOG
            .iter()
            .map(|(name, labels)| DestinationAxis {
                name: name.to_string(),
                options: labels
                    .iter()
                    .map(|label| DestinationOption {
                        id: format!("{}-{}", name.to_lowercase(), normalize_label(label).replace(' ', "-")),
                        label: label.to_string(),
                    })
                    .collect(),
            })
            .collect()
    }
}

#[async_trait]
impl ListingDriver for DemoDriver {
    async fn option_catalog(
        &self,
        _marketplace: MarketplaceId,
        _axes: &[String],
    ) -> Result<Vec<DestinationAxis>, DriverError> {
        Ok(Self::catalog())
    }

    fn limits(&self) -> DestinationLimits {
        self.limits
    }

    async fn navigate(
        &self,
        marketplace: MarketplaceId,
        source_url: &str,
    ) -> Result<Box<dyn ListingSession>, DriverError> {
        Ok(Box::new(DemoSession {
            driver: self.clone(),
            marketplace,
            source_url: source_url.to_string(),
            fields: None,
            rows: Vec::new(),
        }))
    }

    async fn find_listing(&self, source_url: &str) -> Result<Option<String>, DriverError> {
        Ok(self.state.lock().await.by_source.get(source_url).cloned())
    }

    async fn verify(&self, listing_id: &str) -> Result<bool, DriverError> {
        Ok(self.state.lock().await.listings.contains_key(listing_id))
    }
}

struct DemoSession {
    driver: DemoDriver,
    marketplace: MarketplaceId,
    source_url: String,
    fields: Option<BasicFields>,
    rows: Vec<VariationGridRow>,
}

#[async_trait]
impl ListingSession for DemoSession {
    async fn fill_basic_fields(&mut self, fields: &BasicFields) -> Result<(), DriverError> {
        if fields.title.trim().is_empty() {
            return Err(DriverError::FormFill("title is required".into()));
        }
        self.fields = Some(fields.clone());
        Ok(())
    }

    async fn apply_variation_grid(
        &mut self,
        rows: &[VariationGridRow],
    ) -> Result<VariantApplyResult, DriverError> {
        if rows.len() > self.driver.limits.max_variations {
            return Err(DriverError::FormFill(format!(
                "{} variations exceed the form limit",
                rows.len()
            )));
        }

        let catalog = DemoDriver::catalog();
        let mut result = VariantApplyResult::default();
        for row in rows {
            for (axis, label) in &row.attribute_assignment {
                let known = catalog.iter().find(|candidate| candidate.name == *axis);
                match known {
                    Some(candidate) => {
                        if !result.matched_axes.contains(axis) {
                            result.matched_axes.push(axis.clone());
                        }
                        if !candidate.options.iter().any(|option| option.label == *label) {
                            let warning = format!("`{label}` entered as a custom {axis} value");
                            if !result.warnings.contains(&warning) {
                                result.warnings.push(warning);
                            }
                        }
                    }
                    None => {
                        let warning = format!("axis `{axis}` entered as a custom attribute");
                        if !result.warnings.contains(&warning) {
                            result.warnings.push(warning);
                        }
                    }
                }
            }
        }
        self.rows = rows.to_vec();
        Ok(result)
    }

    async fn submit(&mut self) -> Result<SubmitReceipt, DriverError> {
        let Some(fields) = self.fields.clone() else {
            return Err(DriverError::Rejected("listing has no title".into()));
        };
        let listing_id = format!("demo-{}", Uuid::new_v4().simple());
        let mut state = self.driver.state.lock().await;
        state.listings.insert(
            listing_id.clone(),
            DemoListing {
                listing_id: listing_id.clone(),
                source_url: self.source_url.clone(),
                marketplace: self.marketplace,
                fields,
                rows: self.rows.clone(),
            },
        );
        state
            .by_source
            .insert(self.source_url.clone(), listing_id.clone());
        info!(
            target = "crosslist.demo",
            listing_id = %listing_id,
            marketplace = self.marketplace.ebay_code(),
            variations = self.rows.len(),
            "demo_listing_created"
        );
        Ok(SubmitReceipt { listing_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generated_products_are_deterministic() {
        let source = DemoSource::new();
        let a = source.scrape("https://shop.example/p/tee").await.unwrap();
        let b = source.scrape("https://shop.example/p/tee").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.sku_table.len(), 12);
        assert!(a.sku_table[0].stock > 0);

        let single = source
            .scrape("https://shop.example/p/single-mug")
            .await
            .unwrap();
        assert!(single.variation_axes.is_empty());

        assert!(matches!(
            source.scrape("ftp://shop.example/x").await,
            Err(ScrapeError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn submitted_listings_are_findable() {
        let driver = DemoDriver::default();
        let mut session = driver
            .navigate(MarketplaceId::EbayUs, "https://shop.example/p/tee")
            .await
            .unwrap();
        assert!(matches!(session.submit().await, Err(DriverError::Rejected(_))));

        session
            .fill_basic_fields(&BasicFields {
                title: "Tee".into(),
                price: Decimal::from(12),
                currency: "USD".into(),
                images: vec![],
                description: None,
            })
            .await
            .unwrap();
        let applied = session
            .apply_variation_grid(&[VariationGridRow {
                attribute_assignment: BTreeMap::from([
                    ("Color".to_string(), "Mauve".to_string()),
                    ("Size".to_string(), "M".to_string()),
                ]),
                destination_price: Decimal::from(12),
                quantity: 2,
            }])
            .await
            .unwrap();
        assert_eq!(applied.matched_axes, vec!["Color", "Size"]);
        assert_eq!(applied.warnings.len(), 1);

        let receipt = session.submit().await.unwrap();
        assert_eq!(
            driver
                .find_listing("https://shop.example/p/tee")
                .await
                .unwrap(),
            Some(receipt.listing_id.clone())
        );
        assert!(driver.verify(&receipt.listing_id).await.unwrap());
        assert!(!driver.verify("missing").await.unwrap());
    }
}
