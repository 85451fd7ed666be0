use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MarkupType {
    Percentage,
    Fixed,
    Tiered,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Rounding {
    #[default]
    None,
    #[serde(alias = "ends_in_49")]
    EndsIn49,
    #[serde(alias = "ends_in_95")]
    EndsIn95,
    #[serde(alias = "ends_in_99")]
    EndsIn99,
}

/// Half-open price bracket `[min, max)`. A missing `max` is unbounded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceTier {
    pub min: Decimal,
    #[serde(default)]
    pub max: Option<Decimal>,
    pub markup_percent: Decimal,
}

impl PriceTier {
    fn contains(&self, price: Decimal) -> bool {
        price >= self.min && self.max.is_none_or(|max| price < max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricingPolicy {
    pub markup_type: MarkupType,
    #[serde(default)]
    pub value: Decimal,
    #[serde(default)]
    pub tiers: Vec<PriceTier>,
    /// Markup applied by tiered policies when no tier matches.
    #[serde(default)]
    pub default_markup_percent: Decimal,
    #[serde(default)]
    pub min_profit: Decimal,
    #[serde(default)]
    pub rounding: Rounding,
}

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("markup value must not be negative")]
    NegativeValue,
    #[error("min_profit must not be negative")]
    NegativeMinProfit,
    #[error("tier {index} is invalid: {reason}")]
    InvalidTier { index: usize, reason: &'static str },
    #[error("{field} must not exceed {max}")]
    TooLarge { field: &'static str, max: Decimal },
}

/// Markup percentages above this are rejected (a 1000x multiplier).
const MAX_MARKUP_PERCENT: i64 = 100_000;
/// Fixed markups and profit floors above this are rejected.
const MAX_AMOUNT: i64 = 1_000_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("destination price for source price {source_price} is out of range")]
pub struct PriceOverflow {
    pub source_price: Decimal,
}

impl PricingPolicy {
    pub fn percentage(value: Decimal) -> Self {
        Self {
            markup_type: MarkupType::Percentage,
            value,
            tiers: Vec::new(),
            default_markup_percent: Decimal::ZERO,
            min_profit: Decimal::ZERO,
            rounding: Rounding::None,
        }
    }

    pub fn tiered(tiers: Vec<PriceTier>) -> Self {
        Self {
            markup_type: MarkupType::Tiered,
            tiers,
            ..Self::percentage(Decimal::ZERO)
        }
    }

    pub fn with_min_profit(mut self, min_profit: Decimal) -> Self {
        self.min_profit = min_profit;
        self
    }

    pub fn with_rounding(mut self, rounding: Rounding) -> Self {
        self.rounding = rounding;
        self
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.value < Decimal::ZERO || self.default_markup_percent < Decimal::ZERO {
            return Err(PolicyError::NegativeValue);
        }
        if self.min_profit < Decimal::ZERO {
            return Err(PolicyError::NegativeMinProfit);
        }
        let max_percent = Decimal::from(MAX_MARKUP_PERCENT);
        let max_amount = Decimal::from(MAX_AMOUNT);
        let value_limit = match self.markup_type {
            MarkupType::Fixed => max_amount,
            MarkupType::Percentage | MarkupType::Tiered => max_percent,
        };
        if self.value > value_limit {
            return Err(PolicyError::TooLarge {
                field: "value",
                max: value_limit,
            });
        }
        if self.default_markup_percent > max_percent {
            return Err(PolicyError::TooLarge {
                field: "default_markup_percent",
                max: max_percent,
            });
        }
        if self.min_profit > max_amount {
            return Err(PolicyError::TooLarge {
                field: "min_profit",
                max: max_amount,
            });
        }
        for (index, tier) in self.tiers.iter().enumerate() {
            if tier.min < Decimal::ZERO {
                return Err(PolicyError::InvalidTier {
                    index,
                    reason: "min is negative",
                });
            }
            if tier.markup_percent < Decimal::ZERO {
                return Err(PolicyError::InvalidTier {
                    index,
                    reason: "markup_percent is negative",
                });
            }
            if tier.markup_percent > max_percent {
                return Err(PolicyError::InvalidTier {
                    index,
                    reason: "markup_percent is too large",
                });
            }
            if let Some(max) = tier.max
                && max <= tier.min
            {
                return Err(PolicyError::InvalidTier {
                    index,
                    reason: "max must be greater than min",
                });
            }
        }
        Ok(())
    }

    fn tier_percent(&self, source_price: Decimal) -> Decimal {
        self.tiers
            .iter()
            .find(|tier| tier.contains(source_price))
            .map(|tier| tier.markup_percent)
            .unwrap_or(self.default_markup_percent)
    }
}

/// Destination price for `source_price` under `policy`: markup, profit floor,
/// cosmetic rounding, then two-decimal currency rounding. Fails instead of
/// panicking when an intermediate value leaves the `Decimal` range.
pub fn compute_destination_price(
    source_price: Decimal,
    policy: &PricingPolicy,
) -> Result<Decimal, PriceOverflow> {
    let overflow = || PriceOverflow { source_price };

    let marked_up = match policy.markup_type {
        MarkupType::Percentage => apply_percent(source_price, policy.value),
        MarkupType::Fixed => source_price.checked_add(policy.value),
        MarkupType::Tiered => apply_percent(source_price, policy.tier_percent(source_price)),
    }
    .ok_or_else(overflow)?;

    let margin = marked_up.checked_sub(source_price).ok_or_else(overflow)?;
    let floored = if margin < policy.min_profit {
        source_price
            .checked_add(policy.min_profit)
            .ok_or_else(overflow)?
    } else {
        marked_up
    };

    let ending = match policy.rounding {
        Rounding::None => None,
        Rounding::EndsIn49 => Some(49),
        Rounding::EndsIn95 => Some(95),
        Rounding::EndsIn99 => Some(99),
    };
    let rounded = match ending {
        Some(cents) => floored
            .floor()
            .checked_add(Decimal::new(cents, 2))
            .ok_or_else(overflow)?,
        None => floored,
    };

    Ok(rounded.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}

fn apply_percent(price: Decimal, percent: Decimal) -> Option<Decimal> {
    let factor = Decimal::ONE.checked_add(percent.checked_div(Decimal::ONE_HUNDRED)?)?;
    price.checked_mul(factor)
}
