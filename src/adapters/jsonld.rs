//! Source extractor reading schema.org `Product` / `ProductGroup` JSON-LD.

#![allow(non_snake_case)]

use super::{ScrapeError, SourceExtractor};
use crate::models::{AxisValue, SkuRow, SourceProduct, VariationAxis};
use crate::variants::{VariantDescriptor, normalize_label};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::{collections::BTreeMap, str::FromStr};
use tracing::debug;

const KNOWN_AXES: [&str; 4] = ["color", "size", "material", "pattern"];

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T: Clone> OneOrMany<T> {
    fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::Many(values) => values.clone(),
            OneOrMany::One(value) => vec![value.clone()],
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Deserialize, Serialize)]
struct InventoryLevel {
    value: Option<Value>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Deserialize, Serialize)]
struct LdOffer {
    price: Option<Value>,
    lowPrice: Option<Value>,
    priceCurrency: Option<String>,
    availability: Option<String>,
    inventoryLevel: Option<InventoryLevel>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Deserialize, Serialize)]
struct LdProduct {
    name: Option<String>,
    description: Option<String>,
    image: Option<Value>,
    offers: Option<OneOrMany<LdOffer>>,
    color: Option<Value>,
    size: Option<Value>,
    material: Option<Value>,
    pattern: Option<Value>,
    variesBy: Option<OneOrMany<String>>,
    #[serde(default)]
    hasVariant: Vec<LdProduct>,
}

impl LdProduct {
    fn offer(&self) -> Option<LdOffer> {
        self.offers.as_ref().and_then(|offers| offers.to_vec().into_iter().next())
    }

    fn price(&self) -> Option<Decimal> {
        let offer = self.offer()?;
        offer
            .price
            .as_ref()
            .or(offer.lowPrice.as_ref())
            .and_then(decimal_from)
    }

    fn currency(&self) -> Option<String> {
        self.offer().and_then(|offer| offer.priceCurrency)
    }

    fn property(&self, axis: &str) -> Option<String> {
        let raw = match axis {
            "color" => self.color.as_ref(),
            "size" => self.size.as_ref(),
            "material" => self.material.as_ref(),
            "pattern" => self.pattern.as_ref(),
            _ => None,
        }?;
        text_from(raw)
    }
}

fn decimal_from(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(raw) => Decimal::from_str(raw.trim()).ok(),
        Value::Number(number) => Decimal::from_str(&number.to_string()).ok(),
        _ => None,
    }
}

fn text_from(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(raw) => raw.trim().to_string(),
        Value::Number(number) => number.to_string(),
        Value::Object(map) => map
            .get("name")
            .or_else(|| map.get("value"))
            .and_then(text_from)?,
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn images_from(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(url)) => vec![url.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .flat_map(|item| images_from(Some(item)))
            .collect(),
        Some(Value::Object(map)) => map
            .get("url")
            .or_else(|| map.get("contentUrl"))
            .and_then(Value::as_str)
            .map(|url| vec![url.to_string()])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn axis_display_name(raw: &str) -> String {
    let tail = raw.rsplit('/').next().unwrap_or(raw).trim();
    let mut chars = tail.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Scrapes product pages that embed schema.org JSON-LD.
#[derive(Clone)]
pub struct JsonLdSource {
    client: Client,
    assumed_stock: u32,
}

impl JsonLdSource {
    pub fn new(client: Client, assumed_stock: u32) -> Self {
        Self {
            client,
            assumed_stock,
        }
    }
}

fn fetch_error(url: &str, err: reqwest::Error) -> ScrapeError {
    if err.is_timeout() || err.is_connect() {
        ScrapeError::Timeout(url.to_string())
    } else {
        ScrapeError::Parse(err.to_string())
    }
}

#[async_trait]
impl SourceExtractor for JsonLdSource {
    async fn scrape(&self, url: &str) -> Result<SourceProduct, ScrapeError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| fetch_error(url, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Parse(format!("`{url}` returned {status}")));
        }
        let html = response.text().await.map_err(|err| fetch_error(url, err))?;
        parse_product_page(&html, self.assumed_stock)
    }
}

fn type_names(node: &Value) -> Vec<String> {
    match node.get("@type") {
        Some(Value::String(kind)) => vec![kind.clone()],
        Some(Value::Array(kinds)) => kinds
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn collect_nodes(value: Value, nodes: &mut Vec<Value>) {
    match value {
        Value::Array(items) => items.into_iter().for_each(|item| collect_nodes(item, nodes)),
        Value::Object(mut map) => {
            if let Some(graph) = map.remove("@graph") {
                collect_nodes(graph, nodes);
            }
            if !map.is_empty() {
                nodes.push(Value::Object(map));
            }
        }
        _ => {}
    }
}

/// Extracts a [`SourceProduct`] from a page's JSON-LD. A `ProductGroup` wins
/// over a plain `Product`. `assumed_stock` stands in for in-stock variants
/// without an explicit inventory level.
pub fn parse_product_page(html: &str, assumed_stock: u32) -> Result<SourceProduct, ScrapeError> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(r#"script[type="application/ld+json"]"#)
        .map_err(|err| ScrapeError::Parse(err.to_string()))?;

    let mut nodes = Vec::new();
    for script in document.select(&selector) {
        let raw = script.text().collect::<String>();
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => collect_nodes(value, &mut nodes),
            Err(err) => {
                debug!(target = "crosslist.scrape", error = %err, "jsonld_block_skipped");
            }
        }
    }

    let pick = |wanted: &str| {
        nodes
            .iter()
            .find(|node| type_names(node).iter().any(|kind| kind == wanted))
            .cloned()
    };
    let node = pick("ProductGroup")
        .or_else(|| pick("Product"))
        .ok_or_else(|| ScrapeError::Parse("page has no Product JSON-LD".into()))?;

    let product: LdProduct =
        serde_json::from_value(node).map_err(|err| ScrapeError::Parse(err.to_string()))?;
    build_product(product, assumed_stock)
}

fn variant_stock(variant: &LdProduct, assumed_stock: u32) -> u32 {
    let Some(offer) = variant.offer() else {
        return assumed_stock;
    };
    let out_of_stock = offer.availability.as_deref().is_some_and(|availability| {
        let availability = availability.to_lowercase();
        ["outofstock", "soldout", "discontinued"]
            .iter()
            .any(|marker| availability.ends_with(marker))
    });
    if out_of_stock {
        return 0;
    }
    offer
        .inventoryLevel
        .as_ref()
        .and_then(|level| level.value.as_ref())
        .and_then(decimal_from)
        .and_then(|level| level.trunc().to_u32())
        .unwrap_or(assumed_stock)
}

fn build_product(group: LdProduct, assumed_stock: u32) -> Result<SourceProduct, ScrapeError> {
    let title = group
        .name
        .clone()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ScrapeError::Parse("product has no name".into()))?;

    let mut images = images_from(group.image.as_ref());
    let variant_prices: Vec<Decimal> = group.hasVariant.iter().filter_map(LdProduct::price).collect();
    let base_price = group
        .price()
        .or_else(|| variant_prices.iter().min().copied())
        .ok_or_else(|| ScrapeError::Parse("product has no price".into()))?;
    let currency = group
        .currency()
        .or_else(|| group.hasVariant.iter().find_map(LdProduct::currency))
        .unwrap_or_else(|| "USD".to_string());

    if group.hasVariant.is_empty() {
        return Ok(SourceProduct {
            title,
            description: group.description,
            base_price,
            currency,
            images,
            variation_axes: Vec::new(),
            sku_table: Vec::new(),
        });
    }

    let declared: Vec<String> = group
        .variesBy
        .as_ref()
        .map(|axes| axes.to_vec().iter().map(|axis| axis_display_name(axis)).collect())
        .unwrap_or_default();
    let axis_names: Vec<String> = if declared.is_empty() {
        KNOWN_AXES
            .iter()
            .filter(|axis| group.hasVariant.iter().any(|variant| variant.property(axis).is_some()))
            .map(|axis| axis_display_name(axis))
            .collect()
    } else {
        declared
    };

    let mut axes: Vec<VariationAxis> = axis_names
        .iter()
        .map(|name| VariationAxis {
            name: name.clone(),
            values: Vec::new(),
        })
        .collect();
    let mut sku_table = Vec::new();

    for variant in &group.hasVariant {
        let assignment = match variant_assignment(variant, &title, &axis_names) {
            Some(assignment) => assignment,
            None if axis_names.is_empty() => {
                let label = variant_label(variant, &title);
                if axes.is_empty() {
                    axes.push(VariationAxis {
                        name: "Variant".into(),
                        values: Vec::new(),
                    });
                }
                BTreeMap::from([("Variant".to_string(), label)])
            }
            None => {
                debug!(target = "crosslist.scrape", variant = ?variant.name, "variant_skipped_unassignable");
                continue;
            }
        };

        let stock = variant_stock(variant, assumed_stock);
        for axis in axes.iter_mut() {
            let Some(label) = assignment.get(&axis.name) else {
                continue;
            };
            let image_ref = images_from(variant.image.as_ref()).into_iter().next();
            match axis
                .values
                .iter_mut()
                .find(|value| normalize_label(&value.label) == normalize_label(label))
            {
                Some(value) => {
                    value.available |= stock > 0;
                    if value.image_ref.is_none() {
                        value.image_ref = image_ref;
                    }
                }
                None => axis.values.push(AxisValue {
                    label: label.clone(),
                    image_ref,
                    available: stock > 0,
                }),
            }
        }

        sku_table.push(SkuRow {
            attribute_assignment: assignment,
            price: variant.price().unwrap_or(base_price),
            stock,
        });
    }

    for variant in &group.hasVariant {
        for image in images_from(variant.image.as_ref()) {
            if !images.contains(&image) {
                images.push(image);
            }
        }
    }

    Ok(SourceProduct {
        title,
        description: group.description,
        base_price,
        currency,
        images,
        variation_axes: axes,
        sku_table,
    })
}

fn variant_label(variant: &LdProduct, group_title: &str) -> String {
    let name = variant.name.clone().unwrap_or_default();
    let trimmed = name
        .trim()
        .strip_prefix(group_title)
        .unwrap_or(name.trim())
        .trim_start_matches([' ', '-', '–', ':', ','])
        .trim();
    if trimmed.is_empty() {
        name.trim().to_string()
    } else {
        trimmed.to_string()
    }
}

fn variant_assignment(
    variant: &LdProduct,
    group_title: &str,
    axis_names: &[String],
) -> Option<BTreeMap<String, String>> {
    if axis_names.is_empty() {
        return None;
    }
    let from_properties: BTreeMap<String, String> = axis_names
        .iter()
        .filter_map(|axis| {
            variant
                .property(&axis.to_lowercase())
                .map(|label| (axis.clone(), label))
        })
        .collect();
    if from_properties.len() == axis_names.len() {
        return Some(from_properties);
    }
    VariantDescriptor::Delimited(variant_label(variant, group_title)).assignment(axis_names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(jsonld: &str) -> String {
        format!(
            r#"<html><head><title>x</title>
            <script type="application/ld+json">{{"@type": "Organization", "name": "Shop"}}</script>
            <script type="application/ld+json">{jsonld}</script>
            </head><body></body></html>"#
        )
    }

    #[test]
    fn reads_product_group_variants() {
        let html = page(
            r#"{
              "@context": "https://schema.org",
              "@type": "ProductGroup",
              "name": "Linen Shirt",
              "description": "Breathable",
              "image": ["https://img.example/shirt.jpg"],
              "variesBy": ["https://schema.org/color", "https://schema.org/size"],
              "hasVariant": [
                {"@type": "Product", "name": "Linen Shirt Red M", "color": "Red", "size": "M",
                 "image": "https://img.example/red.jpg",
                 "offers": {"price": "24.50", "priceCurrency": "EUR", "availability": "https://schema.org/InStock"}},
                {"@type": "Product", "name": "Linen Shirt Red L", "color": "Red", "size": "L",
                 "offers": {"price": 26, "priceCurrency": "EUR", "availability": "https://schema.org/OutOfStock"}},
                {"@type": "Product", "name": "Linen Shirt Sand L", "color": "Sand", "size": {"name": "L"},
                 "offers": {"price": "26.00", "inventoryLevel": {"value": 4}}}
              ]
            }"#,
        );
        let product = parse_product_page(&html, 2).expect("product");
        assert_eq!(product.title, "Linen Shirt");
        assert_eq!(product.currency, "EUR");
        assert_eq!(product.base_price, "24.50".parse::<Decimal>().unwrap());
        assert_eq!(product.axis_names(), vec!["Color", "Size"]);
        assert_eq!(product.sku_table.len(), 3);
        let stocks: Vec<u32> = product.sku_table.iter().map(|sku| sku.stock).collect();
        assert_eq!(stocks, vec![2, 0, 4]);
        assert_eq!(product.images.len(), 2);
        let size_l = product.variation_axes[1]
            .values
            .iter()
            .find(|value| value.label == "L")
            .unwrap();
        assert!(size_l.available);
    }

    #[test]
    fn plain_product_in_graph_has_no_axes() {
        let html = page(
            r#"{"@graph": [
                {"@type": "WebPage", "name": "Mug page"},
                {"@type": ["Product"], "name": "Enamel Mug", "image": {"url": "https://img.example/mug.jpg"},
                 "offers": [{"price": "9.99", "priceCurrency": "USD"}]}
            ]}"#,
        );
        let product = parse_product_page(&html, 1).expect("product");
        assert_eq!(product.title, "Enamel Mug");
        assert!(product.variation_axes.is_empty());
        assert_eq!(product.images, vec!["https://img.example/mug.jpg"]);
    }

    #[test]
    fn variant_names_are_decomposed_when_properties_are_missing() {
        let html = page(
            r#"{"@type": "ProductGroup", "name": "Hoodie",
                "variesBy": ["color", "size"],
                "offers": {"price": "40.00"},
                "hasVariant": [
                  {"name": "Hoodie - Color: Grey; Size: S", "offers": {"price": "40.00"}},
                  {"name": "Hoodie - Black / XL", "offers": {"price": "42.00"}}
                ]}"#,
        );
        let product = parse_product_page(&html, 1).expect("product");
        assert_eq!(product.sku_table.len(), 2);
        assert_eq!(product.sku_table[0].attribute_assignment["Size"], "S");
        assert_eq!(product.sku_table[1].attribute_assignment["Color"], "Black");
    }

    #[test]
    fn missing_product_is_a_parse_error() {
        let html = page(r#"{"@type": "BreadcrumbList"}"#);
        assert!(matches!(
            parse_product_page(&html, 1),
            Err(ScrapeError::Parse(_))
        ));
        let no_price = page(r#"{"@type": "Product", "name": "Thing"}"#);
        assert!(parse_product_page(&no_price, 1).is_err());
    }
}
