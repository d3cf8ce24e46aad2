use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::record::{ExtractionOrigin, ExtractionOutcome, Record, SkipReason};

/// Listing fields from one source before the sources are merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingFields {
    pub identifier: Option<String>,
    pub title: Option<String>,
    pub price_numeric: Option<f64>,
    pub price_display: Option<String>,
    pub year: Option<i32>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub trim: Option<String>,
    pub mileage_numeric: Option<f64>,
    pub mileage_display: Option<String>,
    pub seller_name: Option<String>,
    pub seller_location: Option<String>,
    pub rating_label: Option<String>,
    pub category: Option<String>,
}

impl ListingFields {
    /// Keeps every field already present and fills the gaps from `fallback`.
    pub fn backfill(self, fallback: ListingFields) -> ListingFields {
        ListingFields {
            identifier: self.identifier.or(fallback.identifier),
            title: self.title.or(fallback.title),
            price_numeric: self.price_numeric.or(fallback.price_numeric),
            price_display: self.price_display.or(fallback.price_display),
            year: self.year.or(fallback.year),
            make: self.make.or(fallback.make),
            model: self.model.or(fallback.model),
            trim: self.trim.or(fallback.trim),
            mileage_numeric: self.mileage_numeric.or(fallback.mileage_numeric),
            mileage_display: self.mileage_display.or(fallback.mileage_display),
            seller_name: self.seller_name.or(fallback.seller_name),
            seller_location: self.seller_location.or(fallback.seller_location),
            rating_label: self.rating_label.or(fallback.rating_label),
            category: self.category.or(fallback.category),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StructuredPayload {
    listing: Option<StructuredListing>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StructuredListing {
    vin: Option<Value>,
    model_year: Option<Value>,
    make_name: Option<Value>,
    model_name: Option<Value>,
    trim_name: Option<Value>,
    expected_price: Option<Value>,
    price: Option<Value>,
    expected_price_string: Option<Value>,
    price_string: Option<Value>,
    mileage: Option<Value>,
    mileage_string: Option<Value>,
    seller_name: Option<Value>,
    seller_city: Option<Value>,
    deal_badge_text: Option<Value>,
    body_type: Option<Value>,
    specifications: Option<Value>,
}

/// Shape returned by [`RENDERED_EXTRACTION_SCRIPT`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RenderedListing {
    vin: Option<Value>,
    specs: Option<Value>,
    title: Option<Value>,
    price: Option<Value>,
    price_string: Option<Value>,
    year: Option<Value>,
    make: Option<Value>,
    model: Option<Value>,
    trim: Option<Value>,
    mileage: Option<Value>,
    mileage_string: Option<Value>,
    dealer_name: Option<Value>,
    dealer_city: Option<Value>,
    deal_rating: Option<Value>,
    body_type: Option<Value>,
}

/// Reads the page's embedded preflight state and heading.
pub const RENDERED_EXTRACTION_SCRIPT: &str = r#"
(() => {
    const preflight = window.__PREFLIGHT__ || {};
    const listing = preflight.listing || {};
    const heading = document.querySelector('h1');
    const headingText = heading ? (heading.textContent || '').trim() : '';
    const specs = Array.isArray(listing.specs)
        ? listing.specs.map(spec => ({
            label: spec && spec.label ? String(spec.label) : null,
            value: spec && spec.value != null ? spec.value : null,
        }))
        : [];
    const pick = (...values) => {
        for (const value of values) {
            if (value !== undefined && value !== null && value !== '') {
                return value;
            }
        }
        return null;
    };
    return {
        vin: pick(listing.vin),
        specs,
        title: pick(headingText, preflight.listingTitle),
        price: pick(preflight.listingPriceValue, listing.price),
        price_string: pick(preflight.listingPriceString, listing.priceString),
        year: pick(listing.year, preflight.listingYear),
        make: pick(listing.make, preflight.listingMake),
        model: pick(listing.model, preflight.listingModel),
        trim: pick(listing.trim),
        mileage: pick(listing.mileage, listing.odometer),
        mileage_string: pick(listing.mileageString),
        dealer_name: pick(listing.dealerName, preflight.listingSellerName),
        dealer_city: pick(listing.dealerCity, preflight.listingSellerCity),
        deal_rating: pick(listing.dealRating, listing.dealBadge),
        body_type: pick(listing.bodyType),
    };
})()
"#;

/// Normalizes structured payloads and rendered documents into [`Record`]s.
#[derive(Debug, Clone)]
pub struct RecordSourceResolver {
    identifier_label: String,
    numeric_noise: Regex,
}

impl RecordSourceResolver {
    pub fn new(identifier_label: impl Into<String>) -> Self {
        let numeric_noise = Regex::new(r"[^0-9.]").expect("valid regex");
        Self {
            identifier_label: identifier_label.into(),
            numeric_noise,
        }
    }

    pub fn rendered_script(&self) -> &'static str {
        RENDERED_EXTRACTION_SCRIPT
    }

    /// `None` when the body is not JSON or carries no `listing` object.
    pub fn parse_structured(&self, body: &str) -> Option<ListingFields> {
        match serde_json::from_str::<StructuredPayload>(body) {
            Ok(StructuredPayload {
                listing: Some(listing),
            }) => Some(self.from_structured(listing)),
            Ok(_) => {
                debug!("structured payload without listing object");
                None
            }
            Err(err) => {
                debug!(error = %err, "structured payload is not valid json");
                None
            }
        }
    }

    pub fn parse_rendered(&self, value: Value) -> Option<ListingFields> {
        match serde_json::from_value::<RenderedListing>(value) {
            Ok(rendered) => Some(self.from_rendered(rendered)),
            Err(err) => {
                debug!(error = %err, "rendered extraction returned unexpected shape");
                None
            }
        }
    }

    fn from_structured(&self, listing: StructuredListing) -> ListingFields {
        let specifications = spec_pairs(&listing.specifications, "displayName", "displayValue");
        let identifier = resolve_identifier(
            text(&listing.vin),
            specifications
                .iter()
                .map(|(name, value)| (name.as_deref(), value.clone())),
            &self.identifier_label,
        );
        let year = integer(&listing.model_year);
        let make = text(&listing.make_name);
        let model = text(&listing.model_name);
        let trim = text(&listing.trim_name);
        let title = compose_title(year, [&make, &model, &trim]);
        let price_display =
            text(&listing.expected_price_string).or_else(|| text(&listing.price_string));
        let price_numeric = self
            .number(&listing.expected_price)
            .or_else(|| self.number(&listing.price))
            .or_else(|| self.parse_display(price_display.as_deref()));
        let mileage_display = text(&listing.mileage_string);
        let mileage_numeric = self
            .number(&listing.mileage)
            .or_else(|| self.parse_display(mileage_display.as_deref()));

        ListingFields {
            identifier,
            title,
            price_numeric,
            price_display,
            year,
            make,
            model,
            trim,
            mileage_numeric,
            mileage_display,
            seller_name: text(&listing.seller_name),
            seller_location: text(&listing.seller_city),
            rating_label: text(&listing.deal_badge_text),
            category: text(&listing.body_type),
        }
    }

    fn from_rendered(&self, rendered: RenderedListing) -> ListingFields {
        let specs = spec_pairs(&rendered.specs, "label", "value");
        let identifier = resolve_identifier(
            text(&rendered.vin),
            specs
                .iter()
                .map(|(name, value)| (name.as_deref(), value.clone())),
            &self.identifier_label,
        );
        let price_display = text(&rendered.price_string);
        let price_numeric = self
            .number(&rendered.price)
            .or_else(|| self.parse_display(price_display.as_deref()));
        let mileage_display = text(&rendered.mileage_string);
        let mileage_numeric = self
            .number(&rendered.mileage)
            .or_else(|| self.parse_display(mileage_display.as_deref()));

        ListingFields {
            identifier,
            title: text(&rendered.title),
            price_numeric,
            price_display,
            year: integer(&rendered.year),
            make: text(&rendered.make),
            model: text(&rendered.model),
            trim: text(&rendered.trim),
            mileage_numeric,
            mileage_display,
            seller_name: text(&rendered.dealer_name),
            seller_location: text(&rendered.dealer_city),
            rating_label: text(&rendered.deal_rating),
            category: text(&rendered.body_type),
        }
    }

    /// Merges both sources (structured wins per field) and applies the
    /// identity gate.
    pub fn resolve(
        &self,
        structured: Option<ListingFields>,
        rendered: Option<ListingFields>,
        source_url: &str,
        page_number: u32,
        extracted_at: DateTime<Utc>,
    ) -> ExtractionOutcome {
        let origin = if structured.is_some() {
            ExtractionOrigin::Structured
        } else {
            ExtractionOrigin::Rendered
        };
        let fields = match (structured, rendered) {
            (Some(primary), Some(fallback)) => primary.backfill(fallback),
            (Some(primary), None) => primary,
            (None, Some(fallback)) => fallback,
            (None, None) => ListingFields::default(),
        };

        let record = Record {
            identifier: fields.identifier,
            title: fields.title,
            price_numeric: fields.price_numeric,
            price_display: fields.price_display,
            year: fields.year,
            make: fields.make,
            model: fields.model,
            trim: fields.trim,
            mileage_numeric: fields.mileage_numeric,
            mileage_display: fields.mileage_display,
            seller_name: fields.seller_name,
            seller_location: fields.seller_location,
            rating_label: fields.rating_label,
            category: fields.category,
            source_url: source_url.to_string(),
            page_number,
            extraction_origin: origin,
            extracted_at,
        };

        if record.has_identity() {
            ExtractionOutcome::Success(record)
        } else {
            ExtractionOutcome::Skipped {
                url: source_url.to_string(),
                reason: SkipReason::NoIdentifierOrTitle,
            }
        }
    }

    fn number(&self, value: &Option<Value>) -> Option<f64> {
        match value {
            Some(Value::Number(number)) => number.as_f64(),
            Some(Value::String(raw)) => self.parse_display(Some(raw)),
            _ => None,
        }
    }

    fn parse_display(&self, raw: Option<&str>) -> Option<f64> {
        let cleaned = self.numeric_noise.replace_all(raw?, "");
        cleaned.parse::<f64>().ok()
    }
}

/// Dedicated field first, then the first spec whose label matches
/// case-insensitively.
pub fn resolve_identifier<'a, I>(dedicated: Option<String>, specs: I, label: &str) -> Option<String>
where
    I: IntoIterator<Item = (Option<&'a str>, Option<String>)>,
{
    dedicated.or_else(|| {
        specs
            .into_iter()
            .find(|(name, _)| {
                name.map(|name| name.trim().eq_ignore_ascii_case(label))
                    .unwrap_or(false)
            })
            .and_then(|(_, value)| value)
    })
}

/// Label/value pairs from a specifications list. Anything that is not an
/// array of objects reads as empty.
fn spec_pairs(
    list: &Option<Value>,
    name_key: &str,
    value_key: &str,
) -> Vec<(Option<String>, Option<String>)> {
    let Some(Value::Array(items)) = list else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_object)
        .map(|spec| {
            (
                text(&spec.get(name_key).cloned()),
                text(&spec.get(value_key).cloned()),
            )
        })
        .collect()
}

fn compose_title(year: Option<i32>, parts: [&Option<String>; 3]) -> Option<String> {
    let mut words = Vec::new();
    if let Some(year) = year {
        words.push(year.to_string());
    }
    words.extend(parts.into_iter().flatten().cloned());
    let title = words.join(" ").trim().to_string();
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

fn text(value: &Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(raw)) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    }
}

fn integer(value: &Option<Value>) -> Option<i32> {
    match value {
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64))
            .and_then(|whole| i32::try_from(whole).ok()),
        Some(Value::String(raw)) => raw.trim().parse().ok(),
        _ => None,
    }
}
