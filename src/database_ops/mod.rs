pub mod best_offers;
pub mod claim;
pub mod db;
pub mod golden_prices;
pub mod golden_products;
pub mod raw_catalog;
