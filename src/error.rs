use thiserror::Error;

use crate::capability::CapabilityError;
use crate::database_ops::db::{is_connectivity_error, is_unique_violation};

/// Why a single unit of work (barcode, price observation, product) could not be
/// processed. Recorded in the row's `last_error`; never aborts the run unless
/// [`RowError::is_fatal`] says the database itself is gone.
#[derive(Debug, Error)]
pub enum RowError {
    #[error("capability response malformed: {0}")]
    Malformed(String),
    #[error("capability unavailable after retries: {0}")]
    Unavailable(String),
    #[error("rejected by provider: {0}")]
    Rejected(String),
    #[error("unit ambiguous: {0}")]
    UnitAmbiguous(String),
    #[error("arithmetic invalid: {0}")]
    ArithmeticInvalid(String),
    #[error("base unit kind conflict: stored {stored}, normalized {incoming}")]
    BaseUnitConflict { stored: String, incoming: String },
    #[error("barcode rejected: {0}")]
    BarcodeRejected(String),
    #[error("missing input: {0}")]
    Missing(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl RowError {
    /// Lost connectivity is the only thing that should stop a whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RowError::Database(e) if is_connectivity_error(e))
    }

    /// A concurrent writer already stored the same key.
    pub fn is_benign_conflict(&self) -> bool {
        matches!(self, RowError::Database(e) if is_unique_violation(e))
    }

    /// Short machine-friendly label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RowError::Malformed(_) => "malformed",
            RowError::Unavailable(_) => "unavailable",
            RowError::Rejected(_) => "rejected",
            RowError::UnitAmbiguous(_) => "unit_ambiguous",
            RowError::ArithmeticInvalid(_) => "arithmetic_invalid",
            RowError::BaseUnitConflict { .. } => "base_unit_conflict",
            RowError::BarcodeRejected(_) => "barcode_rejected",
            RowError::Missing(_) => "missing",
            RowError::Database(_) => "database",
        }
    }
}

impl From<CapabilityError> for RowError {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::Malformed(msg) => RowError::Malformed(msg),
            CapabilityError::Rejected { status, body } => {
                RowError::Rejected(format!("status {status}: {body}"))
            }
            other => RowError::Unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connectivity_loss_is_fatal() {
        assert!(RowError::Database(sqlx::Error::PoolClosed).is_fatal());
        assert!(!RowError::Database(sqlx::Error::RowNotFound).is_fatal());
        assert!(!RowError::UnitAmbiguous("no quantity".into()).is_fatal());
    }

    #[test]
    fn capability_errors_map_onto_row_taxonomy() {
        let malformed: RowError = CapabilityError::Malformed("not json".into()).into();
        assert_eq!(malformed.kind(), "malformed");
        let limited: RowError = CapabilityError::RateLimited { retry_after: None }.into();
        assert_eq!(limited.kind(), "unavailable");
    }

    #[test]
    fn client_errors_are_rejections_not_exhausted_retries() {
        let rejected: RowError = CapabilityError::Rejected {
            status: 400,
            body: "invalid argument".into(),
        }
        .into();
        assert_eq!(rejected.kind(), "rejected");
        let reason = rejected.to_string();
        assert!(reason.starts_with("rejected by provider: status 400"));
        assert!(!reason.contains("after retries"));
    }
}
