//! Core domain model for the offerbook catalog: products, vendor offers and price history.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "offerbook-core";

pub const NAME_MAX_LENGTH: usize = 100;
pub const DESCRIPTION_MAX_LENGTH: usize = 200;

/// Rendering used for every timestamp leaving the service.
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const DATETIME_INPUT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Fields a product partial update may touch.
pub const PRODUCT_PATCH_FIELDS: [&str; 2] = ["name", "description"];

/// User-correctable input problems, raised at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error(
        "Parameter {field} should have between 1 and {max} characters, but it has {actual} characters."
    )]
    Length {
        field: &'static str,
        max: usize,
        actual: usize,
    },
    #[error("Attribute {0} is not present in the model.")]
    UnknownField(String),
    #[error("Attribute {0} must be a string.")]
    NotAString(String),
    #[error("Parameter {field} must not be negative, but it is {value}.")]
    Negative { field: &'static str, value: i64 },
    #[error("Could not parse datetime {0:?}; expected e.g. 2024-01-31T12:00:00.000000")]
    Datetime(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub prod_id: i64,
    pub name: String,
    pub description: String,
}

/// A validated, not yet persisted product. Name and description are trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewProduct {
    name: String,
    description: String,
}

impl NewProduct {
    pub fn new(name: &str, description: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            name: bounded_text("name", name, NAME_MAX_LENGTH)?,
            description: bounded_text("description", description, DESCRIPTION_MAX_LENGTH)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Partial product update restricted to [`PRODUCT_PATCH_FIELDS`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductPatch {
    pub name: Option<String>,
    pub description: Option<String>,
}

impl ProductPatch {
    /// Builds a patch from a raw JSON object.
    ///
    /// Every key is checked against the allow-list before any value is looked
    /// at, so a body mixing known and unknown keys is rejected as a whole.
    pub fn from_json(body: &JsonMap<String, JsonValue>) -> Result<Self, ValidationError> {
        if let Some(unknown) = body
            .keys()
            .find(|key| !PRODUCT_PATCH_FIELDS.contains(&key.as_str()))
        {
            return Err(ValidationError::UnknownField(unknown.clone()));
        }

        let text_field = |field: &'static str, max: usize| {
            body.get(field)
                .map(|value| match value.as_str() {
                    Some(text) => bounded_text(field, text, max),
                    None => Err(ValidationError::NotAString(field.to_string())),
                })
                .transpose()
        };

        Ok(Self {
            name: text_field("name", NAME_MAX_LENGTH)?,
            description: text_field("description", DESCRIPTION_MAX_LENGTH)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none()
    }

    pub fn apply_to(&self, product: &Product) -> Product {
        Product {
            prod_id: product.prod_id,
            name: self.name.clone().unwrap_or_else(|| product.name.clone()),
            description: self
                .description
                .clone()
                .unwrap_or_else(|| product.description.clone()),
        }
    }
}

/// Persisted vendor offer. Only `active` ever changes after insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub internal_id: i64,
    pub vendor_id: i64,
    pub price: i64,
    pub items_in_stock: i64,
    pub active: bool,
    #[serde(with = "datetime_format")]
    pub date_created: DateTime<Utc>,
    pub prod_id: i64,
}

/// An offer as reported by the upstream feed, before reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedOffer {
    pub prod_id: i64,
    pub vendor_id: i64,
    pub price: i64,
    pub items_in_stock: i64,
}

impl ObservedOffer {
    pub fn new(
        prod_id: i64,
        vendor_id: i64,
        price: i64,
        items_in_stock: i64,
    ) -> Result<Self, ValidationError> {
        if items_in_stock < 0 {
            return Err(ValidationError::Negative {
                field: "items_in_stock",
                value: items_in_stock,
            });
        }
        Ok(Self {
            prod_id,
            vendor_id,
            price,
            items_in_stock,
        })
    }

    pub fn is_out_of_stock(&self) -> bool {
        self.items_in_stock == 0
    }

    /// True when `offer` quotes exactly this price and stock level.
    pub fn matches(&self, offer: &Offer) -> bool {
        offer.price == self.price && offer.items_in_stock == self.items_in_stock
    }
}

/// Row about to be inserted. New offers are always active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOffer {
    pub prod_id: i64,
    pub vendor_id: i64,
    pub price: i64,
    pub items_in_stock: i64,
    pub date_created: DateTime<Utc>,
}

impl NewOffer {
    pub fn observed_at(observed: &ObservedOffer, date_created: DateTime<Utc>) -> Self {
        Self {
            prod_id: observed.prod_id,
            vendor_id: observed.vendor_id,
            price: observed.price,
            items_in_stock: observed.items_in_stock,
            date_created,
        }
    }
}

/// Inclusive creation-time interval used by history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn parse(start: &str, end: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            start: parse_datetime(start)?,
            end: parse_datetime(end)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: i64,
    #[serde(with = "datetime_format")]
    pub date_created: DateTime<Utc>,
}

/// Ordered price timeline for one (product, vendor) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistory {
    pub prod_id: i64,
    pub vendor_id: i64,
    pub price_change: f64,
    pub history: Vec<PricePoint>,
}

impl PriceHistory {
    /// Assembles the timeline from matching offer rows.
    ///
    /// Rows are re-sorted by creation time (then id) so callers may pass them in
    /// any order. An empty slice yields an empty timeline and a change of zero.
    pub fn from_offers(prod_id: i64, vendor_id: i64, offers: &[Offer]) -> Self {
        let mut rows: Vec<&Offer> = offers.iter().collect();
        rows.sort_by_key(|offer| (offer.date_created, offer.internal_id));

        let price_change = match (rows.first(), rows.last()) {
            (Some(first), Some(last)) => round_hundredths(price_change(first.price, last.price)),
            _ => 0.0,
        };

        Self {
            prod_id,
            vendor_id,
            price_change,
            history: rows
                .into_iter()
                .map(|offer| PricePoint {
                    price: offer.price,
                    date_created: offer.date_created,
                })
                .collect(),
        }
    }
}

/// Percentage change between the earliest and latest price.
///
/// Falling prices are measured against `last`, rising (or flat) prices against
/// `first`. The asymmetry is intentional compatibility with historical reports;
/// see DESIGN.md. A zero reference price yields `0.0`.
pub fn price_change(first: i64, last: i64) -> f64 {
    let (first, last) = (first as f64, last as f64);
    if last < first {
        if last == 0.0 {
            return 0.0;
        }
        -(last - first) / last * 100.0
    } else {
        if first == 0.0 {
            return 0.0;
        }
        (last - first) / first * 100.0
    }
}

fn round_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Accepts `2024-01-31T12:00:00.123456` (read as UTC) or any RFC 3339 timestamp.
pub fn parse_datetime(value: &str) -> Result<DateTime<Utc>, ValidationError> {
    let trimmed = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed, DATETIME_INPUT_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| ValidationError::Datetime(value.to_string()))
}

pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.format(DATETIME_FORMAT).to_string()
}

fn bounded_text(field: &'static str, value: &str, max: usize) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    let actual = trimmed.chars().count();
    if actual == 0 || actual > max {
        return Err(ValidationError::Length { field, max, actual });
    }
    Ok(trimmed.to_string())
}

/// Serde adapter for [`DATETIME_FORMAT`] timestamps.
pub mod datetime_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&super::format_datetime(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_datetime(&raw).map_err(serde::de::Error::custom)
    }
}
