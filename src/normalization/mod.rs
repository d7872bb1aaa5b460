//! Pure, database-free normalization logic shared by the three pipelines.
pub mod barcode;
pub mod quantity;
pub mod record;
pub mod season;
pub mod unit_price;

pub use quantity::{parse_declared, parse_quantity, BaseUnitKind, Quantity};
pub use record::{fingerprint, GoldenDraft, NormalizedRecord, PackageUnit, PackageVariant, RawVariant};
pub use season::SeasonWindow;
pub use unit_price::{compute_unit_price, resolve_amount, ObservedPrice, UnitPrice};
