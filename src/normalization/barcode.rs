use std::collections::HashSet;

/// Barcodes the normalizer refuses to touch: explicitly listed ones (bulk
/// produce codes, in-store labels) and anything that is not a plain digit run.
#[derive(Debug, Clone, Default)]
pub struct BarcodeFilter {
    skip: HashSet<String>,
}

impl BarcodeFilter {
    pub fn new<I, S>(skip: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let skip = skip
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self { skip }
    }

    pub fn len(&self) -> usize {
        self.skip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skip.is_empty()
    }

    /// `Err(reason)` when the barcode must not be normalized.
    pub fn check(&self, barcode: &str) -> Result<(), String> {
        let code = barcode.trim();
        if code.is_empty() {
            return Err("empty barcode".to_string());
        }
        if !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("barcode {code:?} is not numeric"));
        }
        if self.skip.contains(code) {
            return Err(format!("barcode {code} is on the skip list"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_listed_and_non_numeric_codes() {
        let filter = BarcodeFilter::new(["2000000000001", " ", "2100000000000 "]);
        assert_eq!(filter.len(), 2);
        assert!(filter.check("3858881234567").is_ok());
        assert!(filter.check("2000000000001").is_err());
        assert!(filter.check("2100000000000").is_err());
        assert!(filter.check("38588-81234").is_err());
        assert!(filter.check("").is_err());
    }
}
