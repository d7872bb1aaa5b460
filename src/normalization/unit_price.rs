use bigdecimal::{BigDecimal, RoundingMode, Zero};

use crate::error::RowError;
use crate::normalization::quantity::{BaseUnitKind, Quantity};
use crate::normalization::record::PackageVariant;

/// Decimal places kept on every derived per-unit price.
pub const UNIT_PRICE_SCALE: i64 = 4;

/// Shelf prices of one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedPrice {
    pub regular: Option<BigDecimal>,
    pub special: Option<BigDecimal>,
}

impl ObservedPrice {
    /// The price a shopper actually pays, and whether it is the special one.
    /// A special that is not below the regular price is ignored, as is a
    /// non-positive special (scraper artifact).
    pub fn effective(&self) -> Result<(BigDecimal, bool), RowError> {
        let special = self.special.as_ref().filter(|s| **s > BigDecimal::zero());
        let picked = match (&self.regular, special) {
            (Some(r), Some(s)) if s < r => (s.clone(), true),
            (None, Some(s)) => (s.clone(), true),
            (Some(r), _) => (r.clone(), false),
            (None, None) => {
                return Err(RowError::ArithmeticInvalid(
                    "neither regular nor special price".into(),
                ))
            }
        };
        if picked.0 <= BigDecimal::zero() {
            return Err(RowError::ArithmeticInvalid(format!(
                "non-positive price {}",
                picked.0
            )));
        }
        Ok(picked)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPrice {
    pub kind: BaseUnitKind,
    /// Price per kg, per l or per piece depending on `kind`.
    pub value: BigDecimal,
    pub on_special: bool,
}

/// Price per base unit for a package of `amount` grams / milliliters / pieces.
pub fn compute_unit_price(
    prices: &ObservedPrice,
    kind: BaseUnitKind,
    amount: u32,
) -> Result<UnitPrice, RowError> {
    if amount == 0 {
        return Err(RowError::ArithmeticInvalid("package amount is zero".into()));
    }
    let (effective, on_special) = prices.effective()?;
    let value = (effective * BigDecimal::from(kind.units_per_priced_unit())
        / BigDecimal::from(amount))
    .with_scale_round(UNIT_PRICE_SCALE, RoundingMode::HalfUp);
    Ok(UnitPrice {
        kind,
        value,
        on_special,
    })
}

/// Package amount (in base units of `kind`) that a specific retailer SKU sells.
///
/// One variant is used as is. With several, the SKU's own declared quantity
/// picks the closest variant; without one the observation is unresolvable.
/// A declared quantity of zero is rejected outright.
pub fn resolve_amount(
    kind: BaseUnitKind,
    variants: &[PackageVariant],
    declared: Option<Quantity>,
) -> Result<u32, RowError> {
    if let Some(q) = declared.filter(|q| q.amount == 0) {
        return Err(RowError::ArithmeticInvalid(format!(
            "declared {} quantity is zero",
            q.kind
        )));
    }
    let chosen = match variants {
        [] => return Err(RowError::UnitAmbiguous("golden record has no variants".into())),
        [only] => only,
        many => {
            let declared = declared.ok_or_else(|| {
                RowError::UnitAmbiguous(format!(
                    "{} package variants and no declared quantity",
                    many.len()
                ))
            })?;
            many.iter()
                .filter_map(|v| {
                    v.amount_for(declared.kind)
                        .map(|a| (a.abs_diff(declared.amount), v))
                })
                .min_by_key(|(distance, _)| *distance)
                .map(|(_, v)| v)
                .ok_or_else(|| {
                    RowError::UnitAmbiguous(format!(
                        "declared {} {} matches no variant",
                        declared.amount, declared.kind
                    ))
                })?
        }
    };
    chosen.amount_for(kind).ok_or_else(|| {
        RowError::UnitAmbiguous(format!("variant {:?} has no {kind} amount", chosen.unit))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalization::record::PackageUnit;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn regular(s: &str) -> ObservedPrice {
        ObservedPrice { regular: Some(dec(s)), special: None }
    }

    fn variant(unit: PackageUnit, value: u32) -> PackageVariant {
        PackageVariant { unit, value, piece_count: None }
    }

    #[test]
    fn converts_weight_volume_and_count() {
        let kg = compute_unit_price(&regular("2.50"), BaseUnitKind::Weight, 500).unwrap();
        assert_eq!(kg.value.to_string(), "5.0000");

        let l = compute_unit_price(&regular("1.20"), BaseUnitKind::Volume, 330).unwrap();
        assert_eq!(l.value, dec("3.6364"));

        let piece = compute_unit_price(&regular("3.00"), BaseUnitKind::Count, 6).unwrap();
        assert_eq!(piece.value.to_string(), "0.5000");
        assert!(!piece.on_special);
    }

    #[test]
    fn rounds_half_up() {
        // 0.01 / 8 = 0.00125, 0.03 / 8 = 0.00375
        let p = compute_unit_price(&regular("0.01"), BaseUnitKind::Count, 8).unwrap();
        assert_eq!(p.value, dec("0.0013"));
        let p = compute_unit_price(&regular("0.03"), BaseUnitKind::Count, 8).unwrap();
        assert_eq!(p.value, dec("0.0038"));
        let p = compute_unit_price(&regular("0.01"), BaseUnitKind::Count, 16).unwrap();
        assert_eq!(p.value, dec("0.0006"));
    }

    #[test]
    fn special_price_wins_only_when_lower() {
        let lower = ObservedPrice { regular: Some(dec("4.99")), special: Some(dec("3.99")) };
        assert_eq!(lower.effective().unwrap(), (dec("3.99"), true));

        let higher = ObservedPrice { regular: Some(dec("4.99")), special: Some(dec("5.49")) };
        assert_eq!(higher.effective().unwrap(), (dec("4.99"), false));

        let only_special = ObservedPrice { regular: None, special: Some(dec("2.00")) };
        assert_eq!(only_special.effective().unwrap(), (dec("2.00"), true));

        let zero_special = ObservedPrice { regular: Some(dec("4.99")), special: Some(dec("0")) };
        assert_eq!(zero_special.effective().unwrap(), (dec("4.99"), false));
    }

    #[test]
    fn rejects_missing_or_non_positive_inputs() {
        let none = ObservedPrice { regular: None, special: None };
        assert_eq!(
            compute_unit_price(&none, BaseUnitKind::Weight, 500).unwrap_err().kind(),
            "arithmetic_invalid"
        );
        assert_eq!(
            compute_unit_price(&regular("0.00"), BaseUnitKind::Weight, 500).unwrap_err().kind(),
            "arithmetic_invalid"
        );
        assert_eq!(
            compute_unit_price(&regular("2.50"), BaseUnitKind::Weight, 0).unwrap_err().kind(),
            "arithmetic_invalid"
        );
    }

    #[test]
    fn single_variant_is_used_directly() {
        let variants = [variant(PackageUnit::Ml, 1000)];
        assert_eq!(resolve_amount(BaseUnitKind::Volume, &variants, None).unwrap(), 1000);
        let declared = Some(Quantity::new(BaseUnitKind::Volume, 500));
        assert_eq!(resolve_amount(BaseUnitKind::Volume, &variants, declared).unwrap(), 1000);
    }

    #[test]
    fn multiple_variants_need_a_declared_quantity() {
        let variants = [
            variant(PackageUnit::G, 270),
            variant(PackageUnit::G, 276),
            variant(PackageUnit::G, 300),
        ];
        let err = resolve_amount(BaseUnitKind::Weight, &variants, None).unwrap_err();
        assert_eq!(err.kind(), "unit_ambiguous");

        let declared = Some(Quantity::new(BaseUnitKind::Weight, 290));
        assert_eq!(resolve_amount(BaseUnitKind::Weight, &variants, declared).unwrap(), 300);

        let wrong_kind = Some(Quantity::new(BaseUnitKind::Volume, 290));
        let err = resolve_amount(BaseUnitKind::Weight, &variants, wrong_kind).unwrap_err();
        assert_eq!(err.kind(), "unit_ambiguous");
    }

    #[test]
    fn zero_declared_quantity_is_never_matched() {
        let variants = [variant(PackageUnit::G, 250), variant(PackageUnit::G, 500)];
        let zero = Some(Quantity::new(BaseUnitKind::Weight, 0));
        let err = resolve_amount(BaseUnitKind::Weight, &variants, zero).unwrap_err();
        assert_eq!(err.kind(), "arithmetic_invalid");

        let single = [variant(PackageUnit::G, 250)];
        let err = resolve_amount(BaseUnitKind::Weight, &single, zero).unwrap_err();
        assert_eq!(err.kind(), "arithmetic_invalid");
    }

    #[test]
    fn count_product_reads_multipack_piece_count() {
        let variants = [PackageVariant { unit: PackageUnit::G, value: 400, piece_count: Some(4) }];
        assert_eq!(resolve_amount(BaseUnitKind::Count, &variants, None).unwrap(), 4);
        assert!(resolve_amount(BaseUnitKind::Volume, &variants, None).is_err());
    }
}
