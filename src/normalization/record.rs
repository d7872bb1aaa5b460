//! Structured golden record as returned by a normalization provider, and the
//! validated draft the normalizer actually persists.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::RowError;
use crate::normalization::quantity::{unit_factor, BaseUnitKind, Quantity};
use crate::normalization::season::SeasonWindow;

pub const KEYWORD_COUNT: usize = 8;

/// One retailer's description of a barcode, as handed to the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct RawVariant {
    pub name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub quantity: Option<String>,
    pub unit: Option<String>,
}

/// Stable digest of a barcode's raw inputs. Order of retailers does not matter.
pub fn fingerprint(variants: &[RawVariant]) -> String {
    let mut sorted: Vec<&RawVariant> = variants.iter().collect();
    sorted.sort();
    sorted.dedup();
    let mut hasher = Sha256::new();
    for v in sorted {
        for field in [
            Some(v.name.as_str()),
            v.brand.as_deref(),
            v.category.as_deref(),
            v.quantity.as_deref(),
            v.unit.as_deref(),
        ] {
            hasher.update(field.unwrap_or("\u{0}").as_bytes());
            hasher.update([0x1f]);
        }
        hasher.update([0x1e]);
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageUnit {
    G,
    Ml,
    Kom,
}

impl PackageUnit {
    pub fn kind(self) -> BaseUnitKind {
        match self {
            PackageUnit::G => BaseUnitKind::Weight,
            PackageUnit::Ml => BaseUnitKind::Volume,
            PackageUnit::Kom => BaseUnitKind::Count,
        }
    }

    fn for_kind(kind: BaseUnitKind) -> Self {
        match kind {
            BaseUnitKind::Weight => PackageUnit::G,
            BaseUnitKind::Volume => PackageUnit::Ml,
            BaseUnitKind::Count => PackageUnit::Kom,
        }
    }
}

/// A package size sold under a barcode, in base units. Stored as JSONB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageVariant {
    pub unit: PackageUnit,
    pub value: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub piece_count: Option<u32>,
}

impl PackageVariant {
    pub fn quantity(&self) -> Quantity {
        Quantity::new(self.unit.kind(), self.value)
    }

    /// Amount in the base unit of `kind`. A multipack of grams still has a
    /// piece count, so COUNT can be answered from `piece_count` too.
    pub fn amount_for(&self, kind: BaseUnitKind) -> Option<u32> {
        if self.unit.kind() == kind {
            return Some(self.value);
        }
        match kind {
            BaseUnitKind::Count => self.piece_count,
            _ => None,
        }
    }
}

/// Provider output, parsed leniently: numbers may arrive as strings and
/// optional text may be empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRecord {
    pub canonical_name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub attributes: Vec<String>,
    pub base_unit_type: Option<String>,
    pub variants: Vec<RecordVariant>,
    pub weight_g: Option<f64>,
    pub volume_ml: Option<f64>,
    pub piece_count: Option<f64>,
    pub text_for_embedding: String,
    pub keywords: Vec<String>,
    pub is_generic_product: bool,
    pub seasonal_start_month: Option<f64>,
    pub seasonal_end_month: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordVariant {
    pub unit: String,
    pub value: Option<f64>,
    pub piece_count: Option<f64>,
}

fn value_as_f64(v: &Value) -> Option<f64> {
    if let Some(n) = v.as_f64() {
        return Some(n);
    }
    if let Some(s) = v.as_str() {
        return s.trim().replace(',', ".").parse::<f64>().ok();
    }
    None
}

fn value_as_text(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if s.is_empty() || s.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(s)
    }
}

fn value_as_list(v: Option<&Value>) -> Vec<String> {
    match v {
        Some(Value::Array(items)) => items.iter().filter_map(value_as_text).collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn value_as_bool(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

impl NormalizedRecord {
    pub fn from_value(v: &Value) -> Result<Self, String> {
        let obj = v
            .as_object()
            .ok_or_else(|| "response is not a JSON object".to_string())?;
        let text = |key: &str| obj.get(key).and_then(value_as_text);
        let num = |key: &str| obj.get(key).and_then(value_as_f64);

        let variants = match obj.get("variants") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| {
                    let unit = item.get("unit").and_then(value_as_text)?;
                    Some(RecordVariant {
                        unit,
                        value: item.get("value").and_then(value_as_f64),
                        piece_count: item.get("piece_count").and_then(value_as_f64),
                    })
                })
                .collect(),
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err("variants is not an array".to_string()),
        };

        Ok(Self {
            canonical_name: text("canonical_name").unwrap_or_default(),
            brand: text("brand"),
            category: text("category"),
            attributes: value_as_list(obj.get("attributes")),
            base_unit_type: text("base_unit_type"),
            variants,
            weight_g: num("weight_g"),
            volume_ml: num("volume_ml"),
            piece_count: num("piece_count"),
            text_for_embedding: text("text_for_embedding").unwrap_or_default(),
            keywords: value_as_list(obj.get("keywords")),
            is_generic_product: value_as_bool(obj.get("is_generic_product")),
            seasonal_start_month: num("seasonal_start_month"),
            seasonal_end_month: num("seasonal_end_month"),
        })
    }
}

/// Validated golden record, ready to upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct GoldenDraft {
    pub canonical_name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub attributes: Vec<String>,
    pub base_unit: BaseUnitKind,
    pub variants: Vec<PackageVariant>,
    pub text_for_embedding: String,
    pub keywords: Vec<String>,
    pub is_generic_product: bool,
    pub season: Option<SeasonWindow>,
}

fn whole(n: f64, what: &str) -> Result<u32, RowError> {
    let rounded = n.round();
    if !rounded.is_finite() || rounded <= 0.0 || rounded > f64::from(u32::MAX) {
        return Err(RowError::Malformed(format!("{what} {n} is not a positive amount")));
    }
    Ok(rounded as u32)
}

fn month(n: Option<f64>) -> Result<Option<u32>, RowError> {
    match n {
        None => Ok(None),
        Some(m) if m.fract() == 0.0 && (1.0..=12.0).contains(&m) => Ok(Some(m as u32)),
        Some(m) => Err(RowError::Malformed(format!("month {m} out of range"))),
    }
}

fn convert_variant(v: &RecordVariant) -> Result<PackageVariant, RowError> {
    let (kind, factor) = unit_factor(&v.unit)
        .ok_or_else(|| RowError::UnitAmbiguous(format!("unknown variant unit {:?}", v.unit)))?;
    let value = v
        .value
        .ok_or_else(|| RowError::Malformed(format!("variant {:?} without value", v.unit)))?;
    let piece_count = v
        .piece_count
        .map(|p| whole(p, "piece_count"))
        .transpose()?;
    Ok(PackageVariant {
        unit: PackageUnit::for_kind(kind),
        value: whole(value * f64::from(factor), "variant value")?,
        piece_count,
    })
}

impl GoldenDraft {
    pub fn from_record(record: NormalizedRecord) -> Result<Self, RowError> {
        let canonical_name = record.canonical_name.trim().to_string();
        if canonical_name.is_empty() {
            return Err(RowError::Malformed("empty canonical_name".into()));
        }
        let text_for_embedding = record.text_for_embedding.trim().to_string();
        if text_for_embedding.is_empty() {
            return Err(RowError::Malformed("empty text_for_embedding".into()));
        }

        let keywords: Vec<String> = record
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.len() != KEYWORD_COUNT {
            return Err(RowError::Malformed(format!(
                "expected {KEYWORD_COUNT} keywords, got {}",
                keywords.len()
            )));
        }

        let season = match (
            month(record.seasonal_start_month)?,
            month(record.seasonal_end_month)?,
        ) {
            (Some(s), Some(e)) => SeasonWindow::new(s, e),
            (None, None) => None,
            _ => {
                return Err(RowError::Malformed(
                    "seasonal months must be both set or both null".into(),
                ))
            }
        };

        let mut variants = record
            .variants
            .iter()
            .map(convert_variant)
            .collect::<Result<Vec<_>, _>>()?;
        if variants.is_empty() {
            let top_level = [
                (record.weight_g, PackageUnit::G),
                (record.volume_ml, PackageUnit::Ml),
                (record.piece_count, PackageUnit::Kom),
            ];
            for (amount, unit) in top_level {
                if let Some(a) = amount {
                    variants.push(PackageVariant {
                        unit,
                        value: whole(a, "package amount")?,
                        piece_count: None,
                    });
                }
            }
        }
        let base_unit = infer_base_unit(&variants)?;
        if let Some(declared) = record.base_unit_type.as_deref() {
            let declared: BaseUnitKind = declared.parse().map_err(RowError::Malformed)?;
            if declared != base_unit {
                return Err(RowError::UnitAmbiguous(format!(
                    "declared {declared} but variants say {base_unit}"
                )));
            }
        }
        variants.dedup();

        // Prepackaged goods are never generic, whatever the provider says.
        let bulk_only = variants
            .iter()
            .all(|v| v.unit == PackageUnit::Kom || v.value == 1000);

        Ok(Self {
            canonical_name,
            brand: record.brand,
            category: record.category,
            attributes: record.attributes,
            base_unit,
            variants,
            text_for_embedding,
            keywords,
            is_generic_product: record.is_generic_product && bulk_only,
            season,
        })
    }
}

fn infer_base_unit(variants: &[PackageVariant]) -> Result<BaseUnitKind, RowError> {
    let mut kinds = variants.iter().map(|v| v.unit.kind());
    let first = kinds
        .next()
        .ok_or_else(|| RowError::UnitAmbiguous("no weight, volume or piece count".into()))?;
    if kinds.any(|k| k != first) {
        return Err(RowError::UnitAmbiguous("variants mix dimensions".into()));
    }
    Ok(first)
}
