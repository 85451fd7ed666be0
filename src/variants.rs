use crate::models::{
    DestinationAxis, DestinationOption, MappingOverride, MatchKind, VariantMapping, VariationAxis,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Delimiters for combined variant descriptors, highest precedence first.
const DELIMITERS: [char; 4] = [';', '|', '/', ','];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionMatch {
    pub destination_option_id: Option<String>,
    pub destination_label: Option<String>,
    pub match_kind: MatchKind,
}

impl OptionMatch {
    fn unmatched() -> Self {
        Self {
            destination_option_id: None,
            destination_label: None,
            match_kind: MatchKind::Unmatched,
        }
    }

    fn found(option: &DestinationOption, match_kind: MatchKind) -> Self {
        Self {
            destination_option_id: Some(option.id.clone()),
            destination_label: Some(option.label.clone()),
            match_kind,
        }
    }
}

/// Lowercases, trims and collapses inner whitespace.
pub fn normalize_label(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Picks the destination option for `source_label`: an exact (case-insensitive)
/// match first, then the first candidate where either label contains the other.
pub fn match_option(source_label: &str, candidates: &[DestinationOption]) -> OptionMatch {
    let needle = normalize_label(source_label);
    if needle.is_empty() {
        return OptionMatch::unmatched();
    }

    let normalized: Vec<(String, &DestinationOption)> = candidates
        .iter()
        .map(|option| (normalize_label(&option.label), option))
        .filter(|(label, _)| !label.is_empty())
        .collect();

    if let Some((_, option)) = normalized.iter().find(|(label, _)| *label == needle) {
        return OptionMatch::found(option, MatchKind::Exact);
    }

    normalized
        .iter()
        .find(|(label, _)| label.contains(&needle) || needle.contains(label.as_str()))
        .map(|(_, option)| OptionMatch::found(option, MatchKind::Fuzzy))
        .unwrap_or_else(OptionMatch::unmatched)
}

/// A source-side variant descriptor, either a combined string such as
/// `"Color: Red; Size: XL"` / `"Red/XL"` or an attribute map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariantDescriptor {
    Delimited(String),
    Structured(BTreeMap<String, String>),
}

impl VariantDescriptor {
    /// Plain labels, one per axis. Keyed values follow `axis_order`; anything
    /// not named there keeps its original position after the ordered ones.
    pub fn labels(&self, axis_order: &[String]) -> Vec<String> {
        order_by_axes(self.segments(), axis_order)
            .into_iter()
            .map(|(_, label)| label)
            .collect()
    }

    /// Assigns each label to an axis of `axes`. Keyed segments are matched by
    /// name, bare segments by position. `None` when the descriptor does not
    /// cover every axis exactly once.
    pub fn assignment(&self, axes: &[String]) -> Option<BTreeMap<String, String>> {
        let segments = self.segments();
        if segments.len() != axes.len() {
            return None;
        }
        let mut assignment = BTreeMap::new();
        let keyed = segments.iter().all(|(key, _)| key.is_some());
        for (position, (key, label)) in segments.into_iter().enumerate() {
            let axis = if keyed {
                let key = key.unwrap_or_default();
                axes.iter()
                    .find(|axis| normalize_label(axis) == normalize_label(&key))?
            } else {
                axes.get(position)?
            };
            if assignment.insert(axis.clone(), label).is_some() {
                return None;
            }
        }
        Some(assignment)
    }

    fn segments(&self) -> Vec<(Option<String>, String)> {
        match self {
            VariantDescriptor::Structured(map) => map
                .iter()
                .map(|(key, value)| (Some(key.trim().to_string()), value.trim().to_string()))
                .filter(|(_, value)| !value.is_empty())
                .collect(),
            VariantDescriptor::Delimited(raw) => split_delimited(raw),
        }
    }
}

/// Splits a combined descriptor into plain labels, without axis ordering.
pub fn decompose_source_variant_string(raw: &str) -> Vec<String> {
    split_delimited(raw)
        .into_iter()
        .map(|(_, label)| label)
        .collect()
}

fn split_delimited(raw: &str) -> Vec<(Option<String>, String)> {
    let pieces: Vec<&str> = match DELIMITERS.iter().find(|delim| raw.contains(**delim)) {
        Some(delim) => raw.split(*delim).collect(),
        None => vec![raw],
    };
    pieces
        .into_iter()
        .filter_map(|piece| {
            let piece = piece.trim();
            if piece.is_empty() {
                return None;
            }
            match piece.split_once(':') {
                Some((key, value)) => {
                    let value = value.trim();
                    (!value.is_empty()).then(|| (Some(key.trim().to_string()), value.to_string()))
                }
                None => Some((None, piece.to_string())),
            }
        })
        .collect()
}

fn order_by_axes(
    segments: Vec<(Option<String>, String)>,
    axis_order: &[String],
) -> Vec<(Option<String>, String)> {
    if axis_order.is_empty() || segments.iter().all(|(key, _)| key.is_none()) {
        return segments;
    }
    let mut remaining = segments;
    let mut ordered = Vec::with_capacity(remaining.len());
    for axis in axis_order {
        let wanted = normalize_label(axis);
        if let Some(pos) = remaining.iter().position(|(key, _)| {
            key.as_deref()
                .is_some_and(|key| normalize_label(key) == wanted)
        }) {
            ordered.push(remaining.remove(pos));
        }
    }
    ordered.extend(remaining);
    ordered
}

/// Per-axis mapping of a product's available values onto the destination catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisMappingReport {
    pub mappings: Vec<VariantMapping>,
    /// Axes where no available value found a destination option.
    pub unmatched_axes: Vec<String>,
}

impl AxisMappingReport {
    pub fn lookup(&self, axis: &str, source_label: &str) -> Option<&VariantMapping> {
        let axis = normalize_label(axis);
        let label = normalize_label(source_label);
        self.mappings.iter().find(|mapping| {
            normalize_label(&mapping.axis) == axis && normalize_label(&mapping.source_label) == label
        })
    }

    pub fn count(&self, kind: MatchKind) -> usize {
        self.mappings
            .iter()
            .filter(|mapping| mapping.match_kind == kind)
            .count()
    }
}

pub fn map_axes(
    axes: &[VariationAxis],
    catalog: &[DestinationAxis],
    overrides: &[MappingOverride],
) -> AxisMappingReport {
    let axis_candidates: Vec<DestinationOption> = catalog
        .iter()
        .map(|axis| DestinationOption {
            id: axis.name.clone(),
            label: axis.name.clone(),
        })
        .collect();

    let mut report = AxisMappingReport::default();
    for axis in axes {
        let destination = match_option(&axis.name, &axis_candidates)
            .destination_option_id
            .and_then(|name| catalog.iter().find(|candidate| candidate.name == name));

        let mut mappings: Vec<VariantMapping> = axis
            .available_values()
            .map(|value| {
                let manual = overrides.iter().find(|o| {
                    normalize_label(&o.axis) == normalize_label(&axis.name)
                        && normalize_label(&o.source_label) == normalize_label(&value.label)
                });
                if let Some(manual) = manual {
                    return VariantMapping {
                        axis: axis.name.clone(),
                        destination_axis: manual
                            .destination_axis
                            .clone()
                            .or_else(|| destination.map(|d| d.name.clone())),
                        source_label: value.label.clone(),
                        destination_option_id: Some(manual.destination_option_id.clone()),
                        destination_label: Some(manual.destination_label.clone()),
                        match_kind: MatchKind::Manual,
                    };
                }
                let found = destination
                    .map(|d| match_option(&value.label, &d.options))
                    .unwrap_or_else(OptionMatch::unmatched);
                VariantMapping {
                    axis: axis.name.clone(),
                    destination_axis: destination.map(|d| d.name.clone()),
                    source_label: value.label.clone(),
                    destination_option_id: found.destination_option_id,
                    destination_label: found.destination_label,
                    match_kind: found.match_kind,
                }
            })
            .collect();

        release_fuzzy_collisions(&mut mappings);

        let matched = mappings
            .iter()
            .filter(|m| m.match_kind != MatchKind::Unmatched)
            .count();
        if !mappings.is_empty() && matched == 0 {
            report.unmatched_axes.push(axis.name.clone());
        }
        report.mappings.extend(mappings);
    }
    report
}

// Two source values must not land on the same destination option; exact and
// manual matches keep theirs, later fuzzy claims fall back to unmatched.
fn release_fuzzy_collisions(mappings: &mut [VariantMapping]) {
    let mut taken: HashSet<String> = mappings
        .iter()
        .filter(|m| matches!(m.match_kind, MatchKind::Exact | MatchKind::Manual))
        .filter_map(|m| m.destination_option_id.clone())
        .collect();
    for mapping in mappings
        .iter_mut()
        .filter(|m| m.match_kind == MatchKind::Fuzzy)
    {
        let Some(id) = mapping.destination_option_id.clone() else {
            continue;
        };
        if !taken.insert(id) {
            mapping.destination_option_id = None;
            mapping.destination_label = None;
            mapping.match_kind = MatchKind::Unmatched;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AxisValue;

    fn options(labels: &[&str]) -> Vec<DestinationOption> {
        labels
            .iter()
            .map(|label| DestinationOption {
                id: label.to_string(),
                label: label.to_string(),
            })
            .collect()
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

    #[test]
    fn exact_match_wins() {
        let found = match_option("Red", &options(&["Red", "Black"]));
        assert_eq!(found.match_kind, MatchKind::Exact);
        assert_eq!(found.destination_option_id.as_deref(), Some("Red"));
    }

    #[test]
    fn exact_beats_earlier_fuzzy_candidate() {
        let found = match_option("red", &options(&["Dark Red", "RED "]));
        assert_eq!(found.match_kind, MatchKind::Exact);
        assert_eq!(found.destination_option_id.as_deref(), Some("RED "));
    }

    #[test]
    fn substring_is_fuzzy() {
        let found = match_option("red xl", &options(&["Red XL Edition"]));
        assert_eq!(found.match_kind, MatchKind::Fuzzy);
        assert_eq!(found.destination_option_id.as_deref(), Some("Red XL Edition"));

        let reverse = match_option("  Navy   Blue Stripe ", &options(&["navy blue"]));
        assert_eq!(reverse.match_kind, MatchKind::Fuzzy);
    }

    #[test]
    fn no_candidate_is_unmatched() {
        let found = match_option("Purple", &options(&["Red", "Black"]));
        assert_eq!(found.match_kind, MatchKind::Unmatched);
        assert!(found.destination_option_id.is_none());
        assert_eq!(
            match_option("   ", &options(&["Red"])).match_kind,
            MatchKind::Unmatched
        );
    }

    #[test]
    fn decompose_prefers_semicolon_over_slash() {
        assert_eq!(
            decompose_source_variant_string("Color: Red; Size: 1/2 inch"),
            vec!["Red", "1/2 inch"]
        );
        assert_eq!(decompose_source_variant_string("Red / XL"), vec!["Red", "XL"]);
        assert_eq!(
            decompose_source_variant_string("Red, XL, "),
            vec!["Red", "XL"]
        );
        assert_eq!(decompose_source_variant_string("Single"), vec!["Single"]);
    }

    #[test]
    fn keyed_labels_follow_axis_order() {
        let descriptor = VariantDescriptor::Delimited("size: XL | color: Red".into());
        let axes = vec!["Color".to_string(), "Size".to_string()];
        assert_eq!(descriptor.labels(&axes), vec!["Red", "XL"]);

        let structured: VariantDescriptor =
            serde_json::from_value(serde_json::json!({"Size": "M", "Color": "Blue"})).unwrap();
        assert_eq!(structured.labels(&axes), vec!["Blue", "M"]);
        let assignment = structured.assignment(&axes).expect("assignment");
        assert_eq!(assignment["Color"], "Blue");
    }

    #[test]
    fn positional_assignment_requires_every_axis() {
        let axes = vec!["Color".to_string(), "Size".to_string()];
        let descriptor = VariantDescriptor::Delimited("Red/XL".into());
        let assignment = descriptor.assignment(&axes).expect("assignment");
        assert_eq!(assignment["Size"], "XL");
        assert!(
            VariantDescriptor::Delimited("Red".into())
                .assignment(&axes)
                .is_none()
        );
    }

    #[test]
    fn map_axes_flags_fully_unmatched_axis() {
        let axes = vec![axis("Color", &["Red", "Blue"]), axis("Material", &["Hemp"])];
        let catalog = vec![
            DestinationAxis {
                name: "Colour".into(),
                options: options(&["Red", "Navy Blue"]),
            },
            DestinationAxis {
                name: "Material".into(),
                options: options(&["Cotton", "Wool"]),
            },
        ];
        let report = map_axes(&axes, &catalog, &[]);
        // "Color" does not match "Colour" by substring, so the whole axis is unmatched.
        assert_eq!(report.unmatched_axes, vec!["Color", "Material"]);
    }

    #[test]
    fn map_axes_keeps_fuzzy_and_partial_matches() {
        let axes = vec![axis("Color", &["Red", "Blue", "Mauve"])];
        let catalog = vec![DestinationAxis {
            name: "Color".into(),
            options: options(&["Red", "Navy Blue"]),
        }];
        let report = map_axes(&axes, &catalog, &[]);
        assert!(report.unmatched_axes.is_empty());
        assert_eq!(report.count(MatchKind::Exact), 1);
        assert_eq!(report.count(MatchKind::Fuzzy), 1);
        assert_eq!(report.count(MatchKind::Unmatched), 1);
        let blue = report.lookup("color", "blue").expect("blue mapping");
        assert_eq!(blue.destination_label.as_deref(), Some("Navy Blue"));
    }

    #[test]
    fn fuzzy_collision_is_released() {
        let axes = vec![axis("Color", &["Dark Red", "Red"])];
        let catalog = vec![DestinationAxis {
            name: "Color".into(),
            options: options(&["Red"]),
        }];
        let report = map_axes(&axes, &catalog, &[]);
        let dark = report.lookup("Color", "Dark Red").unwrap();
        assert_eq!(dark.match_kind, MatchKind::Unmatched);
        assert_eq!(
            report.lookup("Color", "Red").unwrap().match_kind,
            MatchKind::Exact
        );
    }

    #[test]
    fn overrides_resolve_unmatched_values() {
        let axes = vec![axis("Color", &["Mauve"])];
        let catalog = vec![DestinationAxis {
            name: "Color".into(),
            options: options(&["Purple"]),
        }];
        let override_ = MappingOverride {
            axis: "color".into(),
            source_label: "mauve".into(),
            destination_axis: None,
            destination_option_id: "Purple".into(),
            destination_label: "Purple".into(),
        };
        let report = map_axes(&axes, &catalog, &[override_]);
        assert!(report.unmatched_axes.is_empty());
        let mapping = report.lookup("Color", "Mauve").unwrap();
        assert_eq!(mapping.match_kind, MatchKind::Manual);
        assert_eq!(mapping.destination_axis.as_deref(), Some("Color"));
    }

    #[test]
    fn unavailable_values_are_not_mapped() {
        let mut color = axis("Color", &["Red", "Green"]);
        color.values[1].available = false;
        let catalog = vec![DestinationAxis {
            name: "Color".into(),
            options: options(&["Red"]),
        }];
        let report = map_axes(&[color], &catalog, &[]);
        assert_eq!(report.mappings.len(), 1);
    }
}
