use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Dimensional family used to make prices comparable across package sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BaseUnitKind {
    Weight,
    Volume,
    Count,
}

impl BaseUnitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BaseUnitKind::Weight => "WEIGHT",
            BaseUnitKind::Volume => "VOLUME",
            BaseUnitKind::Count => "COUNT",
        }
    }

    /// `golden_prices` column holding the per-unit price for this kind.
    pub fn price_column(self) -> &'static str {
        match self {
            BaseUnitKind::Weight => "price_per_kg",
            BaseUnitKind::Volume => "price_per_l",
            BaseUnitKind::Count => "price_per_piece",
        }
    }

    /// `best_offers` column holding the best per-unit price for this kind.
    pub fn best_column(self) -> &'static str {
        match self {
            BaseUnitKind::Weight => "best_unit_price_per_kg",
            BaseUnitKind::Volume => "best_unit_price_per_l",
            BaseUnitKind::Count => "best_unit_price_per_piece",
        }
    }

    /// Base amount per priced unit: 1000 g per kg, 1000 ml per l, 1 piece.
    pub fn units_per_priced_unit(self) -> u32 {
        match self {
            BaseUnitKind::Weight | BaseUnitKind::Volume => 1000,
            BaseUnitKind::Count => 1,
        }
    }
}

impl fmt::Display for BaseUnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BaseUnitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "WEIGHT" => Ok(BaseUnitKind::Weight),
            "VOLUME" => Ok(BaseUnitKind::Volume),
            "COUNT" => Ok(BaseUnitKind::Count),
            other => Err(format!("unknown base unit kind {other:?}")),
        }
    }
}

/// A package size expressed in base units (grams, milliliters or pieces).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantity {
    pub kind: BaseUnitKind,
    pub amount: u32,
}

impl Quantity {
    pub fn new(kind: BaseUnitKind, amount: u32) -> Self {
        Self { kind, amount }
    }
}

/// Map a unit token onto its kind and the factor converting it to base units.
///
/// Covers the spellings retailers actually use ("kom", "litra", "dag", ...).
pub fn unit_factor(unit: &str) -> Option<(BaseUnitKind, u32)> {
    let u = unit.trim().trim_end_matches('.').to_lowercase();
    let found = match u.as_str() {
        "g" | "gr" | "gram" | "grama" => (BaseUnitKind::Weight, 1),
        "dag" | "dkg" => (BaseUnitKind::Weight, 10),
        "kg" | "kilogram" | "kilograma" => (BaseUnitKind::Weight, 1000),
        "ml" => (BaseUnitKind::Volume, 1),
        "cl" => (BaseUnitKind::Volume, 10),
        "dl" => (BaseUnitKind::Volume, 100),
        "l" | "lit" | "litra" | "litre" | "litara" | "liter" | "litar" => {
            (BaseUnitKind::Volume, 1000)
        }
        "kom" | "komad" | "komada" | "kos" | "pc" | "pcs" | "kpl" => (BaseUnitKind::Count, 1),
        _ => return None,
    };
    Some(found)
}

fn quantity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:(\d+)\s*[x×]\s*)?(\d+(?:[.,]\d+)?)\s*(komada|komad|kom|kos|kpl|pcs|pc|kilograma|kilogram|kg|dkg|dag|grama|gram|gr|g|ml|cl|dl|litara|litra|litre|liter|litar|lit|l)\b",
        )
        .expect("quantity pattern is valid")
    })
}

/// Parse the first package size mentioned in free text, e.g. "Ulje X 1L",
/// "0,5 kg", "4x100g", "Ulje X 1 litra", "6 kom".
pub fn parse_quantity(text: &str) -> Option<Quantity> {
    let caps = quantity_regex().captures(text)?;
    let multiplier: u32 = match caps.get(1) {
        Some(m) => m.as_str().parse().ok()?,
        None => 1,
    };
    let value = BigDecimal::from_str(&caps.get(2)?.as_str().replace(',', ".")).ok()?;
    let (kind, factor) = unit_factor(caps.get(3)?.as_str())?;
    let amount = (value * BigDecimal::from(factor) * BigDecimal::from(multiplier))
        .with_scale_round(0, RoundingMode::HalfUp)
        .to_u32()?;
    Some(Quantity::new(kind, amount))
}

/// Declared quantity of a retailer SKU from its separate quantity/unit columns,
/// falling back to whatever either column says on its own.
pub fn parse_declared(quantity: Option<&str>, unit: Option<&str>) -> Option<Quantity> {
    let quantity = quantity.map(str::trim).filter(|s| !s.is_empty());
    let unit = unit.map(str::trim).filter(|s| !s.is_empty());
    match (quantity, unit) {
        (Some(q), Some(u)) => parse_quantity(&format!("{q} {u}"))
            .or_else(|| parse_quantity(q))
            .or_else(|| parse_quantity(u)),
        (Some(q), None) => parse_quantity(q),
        (None, Some(u)) => parse_quantity(u),
        (None, None) => None,
    }
}
