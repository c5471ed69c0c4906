//! Error types shared across the starter crates

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid feature: {0}")]
    InvalidFeature(String),

    #[error("Invalid feature limit: {0}")]
    InvalidLimit(String),
}
