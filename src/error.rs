//! Error types for the pipeline
//!
//! Errors exist only for structural misuse at the API boundary. Data
//! quality problems in the feed (malformed levels, stale sequence numbers)
//! are absorbed and logged, never propagated: a single bad tick must not
//! interrupt the stream.

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid size {size}: must be positive")]
    InvalidSize { size: Decimal },

    #[error("invalid limit price {price}: must be positive")]
    InvalidLimitPrice { price: Decimal },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, MarketError>;
