use crate::models::{SourceProduct, VariationGridRow};
use crate::pricing::{PriceOverflow, PricingPolicy, compute_destination_price};
use crate::variants::{AxisMappingReport, normalize_label};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLimits {
    pub max_variations: usize,
    pub max_quantity: Option<u32>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GridError {
    #[error("{combinations} variation combinations exceed the destination limit of {limit}")]
    CapacityExceeded { combinations: usize, limit: usize },
    #[error("variation `{0}` appears more than once")]
    DuplicateAssignment(String),
    #[error(transparent)]
    Pricing(#[from] PriceOverflow),
}

/// Builds one destination row per in-stock source SKU.
///
/// SKUs referencing an unknown axis, an unavailable value, or missing an axis
/// are skipped. Unmatched values keep their source label.
pub fn build_grid(
    product: &SourceProduct,
    policy: &PricingPolicy,
    mappings: &AxisMappingReport,
    limits: &GridLimits,
) -> Result<Vec<VariationGridRow>, GridError> {
    if product.variation_axes.is_empty() {
        return Ok(Vec::new());
    }

    let combinations = product
        .variation_axes
        .iter()
        .map(|axis| axis.available_values().count())
        .fold(1usize, |acc, count| acc.saturating_mul(count));
    if combinations > limits.max_variations {
        return Err(GridError::CapacityExceeded {
            combinations,
            limit: limits.max_variations,
        });
    }

    let available: BTreeMap<String, HashSet<String>> = product
        .variation_axes
        .iter()
        .map(|axis| {
            (
                normalize_label(&axis.name),
                axis.available_values()
                    .map(|value| normalize_label(&value.label))
                    .collect(),
            )
        })
        .collect();

    let mut seen_source = HashSet::new();
    let mut seen_destination = HashSet::new();
    let mut rows = Vec::new();

    for sku in product.sku_table.iter().filter(|sku| sku.stock > 0) {
        if !covers_available_values(&sku.attribute_assignment, &available) {
            warn!(
                target = "crosslist.grid",
                assignment = ?sku.attribute_assignment,
                "sku_skipped_unavailable_combination"
            );
            continue;
        }

        let source_key = assignment_key(&sku.attribute_assignment);
        if !seen_source.insert(source_key.clone()) {
            return Err(GridError::DuplicateAssignment(source_key));
        }

        let translated: BTreeMap<String, String> = sku
            .attribute_assignment
            .iter()
            .map(|(axis, label)| match mappings.lookup(axis, label) {
                Some(mapping) => (
                    mapping
                        .destination_axis
                        .clone()
                        .unwrap_or_else(|| axis.clone()),
                    mapping
                        .destination_label
                        .clone()
                        .unwrap_or_else(|| label.clone()),
                ),
                None => (axis.clone(), label.clone()),
            })
            .collect();

        let destination_key = assignment_key(&translated);
        if translated.len() != sku.attribute_assignment.len()
            || !seen_destination.insert(destination_key.clone())
        {
            return Err(GridError::DuplicateAssignment(destination_key));
        }

        let quantity = match limits.max_quantity {
            Some(max) => sku.stock.min(max),
            None => sku.stock,
        };

        rows.push(VariationGridRow {
            attribute_assignment: translated,
            destination_price: compute_destination_price(sku.price, policy)?,
            quantity,
        });
    }

    Ok(rows)
}

fn covers_available_values(
    assignment: &BTreeMap<String, String>,
    available: &BTreeMap<String, HashSet<String>>,
) -> bool {
    if assignment.len() != available.len() {
        return false;
    }
    assignment.iter().all(|(axis, label)| {
        available
            .get(&normalize_label(axis))
            .is_some_and(|values| values.contains(&normalize_label(label)))
    })
}

fn assignment_key(assignment: &BTreeMap<String, String>) -> String {
    assignment
        .iter()
        .map(|(axis, label)| format!("{}={}", normalize_label(axis), normalize_label(label)))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AxisValue, DestinationAxis, DestinationOption, SkuRow, VariationAxis,
    };
    use crate::pricing::Rounding;
    use crate::variants::map_axes;
    use rust_decimal::Decimal;

    const COLORS: [&str; 3] = ["Red", "Blue", "Black"];
    const SIZES: [&str; 5] = ["XS", "S", "M", "L", "XL"];

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

    fn shirt(out_of_stock: &[(&str, &str)]) -> SourceProduct {
        let mut sku_table = Vec::new();
        for color in COLORS {
            for size in SIZES {
                let stock = if out_of_stock.contains(&(color, size)) {
                    0
                } else {
                    7
                };
                sku_table.push(SkuRow {
                    attribute_assignment: BTreeMap::from([
                        ("Color".to_string(), color.to_string()),
                        ("Size".to_string(), size.to_string()),
                    ]),
                    price: Decimal::from(10),
                    stock,
                });
            }
        }
        SourceProduct {
            title: "Plain tee".into(),
            description: None,
            base_price: Decimal::from(10),
            currency: "USD".into(),
            images: vec![],
            variation_axes: vec![axis("Color", &COLORS), axis("Size", &SIZES)],
            sku_table,
        }
    }

    fn catalog() -> Vec<DestinationAxis> {
        let opts = |labels: &[&str]| {
            labels
                .iter()
                .map(|label| DestinationOption {
                    id: format!("opt-{}", label.to_lowercase()),
                    label: label.to_string(),
                })
                .collect()
        };
        vec![
            DestinationAxis {
                name: "Color".into(),
                options: opts(&["Red", "Blue", "Jet Black"]),
            },
            DestinationAxis {
                name: "Size".into(),
                options: opts(&SIZES),
            },
        ]
    }

    fn limits() -> GridLimits {
        GridLimits {
            max_variations: 250,
            max_quantity: None,
        }
    }

    #[test]
    fn excludes_out_of_stock_combinations() {
        let excluded = [("Red", "XS"), ("Blue", "M"), ("Black", "XL"), ("Black", "S")];
        let product = shirt(&excluded);
        let mappings = map_axes(&product.variation_axes, &catalog(), &[]);
        let policy = PricingPolicy::percentage(Decimal::from(30)).with_rounding(Rounding::EndsIn99);

        let rows = build_grid(&product, &policy, &mappings, &limits()).expect("grid");
        assert_eq!(rows.len(), 11);

        let black_label = |label: &'static str| -> &'static str {
            if label == "Black" { "Jet Black" } else { label }
        };
        for (color, size) in excluded {
            assert!(!rows.iter().any(|row| {
                row.attribute_assignment["Color"] == black_label(color)
                    && row.attribute_assignment["Size"] == size
            }));
        }
        assert!(
            rows.iter()
                .all(|row| row.destination_price == "13.99".parse::<Decimal>().unwrap())
        );
        let keys: HashSet<_> = rows
            .iter()
            .map(|row| assignment_key(&row.attribute_assignment))
            .collect();
        assert_eq!(keys.len(), rows.len());
    }

    #[test]
    fn capacity_is_reported_not_truncated() {
        let product = shirt(&[]);
        let mappings = map_axes(&product.variation_axes, &catalog(), &[]);
        let err = build_grid(
            &product,
            &PricingPolicy::percentage(Decimal::ZERO),
            &mappings,
            &GridLimits {
                max_variations: 10,
                max_quantity: None,
            },
        )
        .unwrap_err();
        assert_eq!(
            err,
            GridError::CapacityExceeded {
                combinations: 15,
                limit: 10
            }
        );
    }

    #[test]
    fn unavailable_values_and_quantity_clamp() {
        let mut product = shirt(&[]);
        product.variation_axes[0].values[2].available = false;
        let mappings = map_axes(&product.variation_axes, &catalog(), &[]);
        let rows = build_grid(
            &product,
            &PricingPolicy::percentage(Decimal::ZERO),
            &mappings,
            &GridLimits {
                max_variations: 250,
                max_quantity: Some(3),
            },
        )
        .expect("grid");
        assert_eq!(rows.len(), 10);
        assert!(rows.iter().all(|row| row.quantity == 3));
    }

    #[test]
    fn duplicate_source_rows_are_rejected() {
        let mut product = shirt(&[]);
        let first = product.sku_table[0].clone();
        product.sku_table.push(first);
        let mappings = map_axes(&product.variation_axes, &catalog(), &[]);
        let err = build_grid(
            &product,
            &PricingPolicy::percentage(Decimal::ZERO),
            &mappings,
            &limits(),
        )
        .unwrap_err();
        assert!(matches!(err, GridError::DuplicateAssignment(_)));
    }

    #[test]
    fn unpriceable_sku_fails_the_grid() {
        let mut product = shirt(&[]);
        product.sku_table[0].price = Decimal::MAX;
        let mappings = map_axes(&product.variation_axes, &catalog(), &[]);
        let err = build_grid(
            &product,
            &PricingPolicy::percentage(Decimal::from(30)),
            &mappings,
            &limits(),
        )
        .unwrap_err();
        assert!(matches!(err, GridError::Pricing(_)));
    }

    #[test]
    fn product_without_axes_has_empty_grid() {
        let mut product = shirt(&[]);
        product.variation_axes.clear();
        product.sku_table.clear();
        let rows = build_grid(
            &product,
            &PricingPolicy::percentage(Decimal::ZERO),
            &AxisMappingReport::default(),
            &limits(),
        )
        .expect("grid");
        assert!(rows.is_empty());
    }
}
