use itertools::Itertools;
use serde_json::{json, Value};

use super::CapabilityError;
use crate::normalization::record::{RawVariant, KEYWORD_COUNT};

/// System instructions shared by every text provider.
pub fn system_prompt() -> String {
    format!(
        r#"You are a data normalization engine for a Croatian grocery price comparison catalog.
You receive every name variation that different retailers use for ONE product (one barcode),
plus the brands, categories and package units they report. Produce a single canonical
"golden record" as JSON.

Rules:
1. Read all name variations and ignore retailer formatting (capitals, punctuation, word order).
2. "brand": the brand if it is consistent across inputs, otherwise null.
3. "canonical_name": a clean display name. Do not include the brand or the package size
   (no "350g", "1l"). For assortments use a general name such as "Keksi asortiman".
4. "category": a standard grocery category in Croatian, preferring the supplied categories.
5. "variants": one object per package size sold under this barcode.
   Each object is {{"unit": "g" | "ml" | "kom", "value": integer, "piece_count": integer | null}}.
   A multipack such as 4x100g is ONE object for the total: {{"unit": "g", "value": 400, "piece_count": 4}}.
   An assortment of sizes (270g, 276g, 300g) is one object per size.
6. "base_unit_type": "WEIGHT" for g, "VOLUME" for ml, "COUNT" for kom. All variants share it.
7. "attributes": short descriptive attributes (flavour, fat content, packaging), may be empty.
8. "text_for_embedding": one natural Croatian sentence describing the product type, brand,
   category and key attributes, for semantic search. Describe the product, not one package size.
9. "keywords": exactly {KEYWORD_COUNT} lowercase Croatian keywords: synonyms, uses, attributes.
   No marketing words such as "akcija" or "jeftino".
10. "is_generic_product": true only for unbranded staples (fresh fruit, vegetables, bulk goods).
    It MUST be false if any variant is in g or ml with a value other than 1000.
11. "seasonal_start_month" / "seasonal_end_month": months 1-12 of the typical Croatian season
    for seasonal produce, otherwise both null. A season may wrap the year end (11 to 2).

Answer with a single JSON object and nothing else:
{{
  "canonical_name": "string",
  "brand": "string | null",
  "category": "string",
  "base_unit_type": "WEIGHT | VOLUME | COUNT",
  "variants": [{{"unit": "g | ml | kom", "value": 0, "piece_count": null}}],
  "attributes": ["string"],
  "text_for_embedding": "string",
  "keywords": ["string"],
  "is_generic_product": false,
  "seasonal_start_month": null,
  "seasonal_end_month": null
}}"#
    )
}

/// Per-barcode user message: distinct, non-empty values of each raw column.
pub fn product_input(barcode: &str, variants: &[RawVariant]) -> Value {
    fn distinct<'a>(it: impl Iterator<Item = Option<&'a str>>) -> Vec<&'a str> {
        it.flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unique()
            .collect()
    }
    let units = variants.iter().filter_map(|v| {
        let joined = [v.quantity.as_deref(), v.unit.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .join(" ");
        (!joined.is_empty()).then_some(joined)
    });
    json!({
        "barcode": barcode,
        "name_variations": distinct(variants.iter().map(|v| Some(v.name.as_str()))),
        "brands": distinct(variants.iter().map(|v| v.brand.as_deref())),
        "categories": distinct(variants.iter().map(|v| v.category.as_deref())),
        "units": units.unique().collect::<Vec<_>>(),
    })
}

/// Pull the JSON object out of a model reply. Models sometimes wrap it in a
/// markdown fence or add a sentence around it.
pub fn extract_json(text: &str) -> Result<Value, CapabilityError> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Ok(v);
    }
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if s < e => serde_json::from_str(&trimmed[s..=e])
            .map_err(|err| CapabilityError::Malformed(format!("invalid JSON object: {err}"))),
        _ => Err(CapabilityError::Malformed(
            "reply contains no JSON object".to_string(),
        )),
    }
}

/// Input and output token counts from a provider's usage object.
pub fn token_usage(usage: &Value, input: &str, output: &str) -> (Option<u64>, Option<u64>) {
    (
        usage.get(input).and_then(Value::as_u64),
        usage.get(output).and_then(Value::as_u64),
    )
}
