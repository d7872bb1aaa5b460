pub mod capability;
pub mod cli;
pub mod database_ops;
pub mod error;
pub mod normalization;
pub mod pipeline;
pub mod telemetry;

pub mod util {
    pub mod env;
}
