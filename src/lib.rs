//! L2 Market Data Pipeline
//!
//! Ingests a continuously updating Level-2 order book for a single
//! instrument and derives everything downstream consumers need from one
//! consistent source:
//! - a canonical real-time price signal ([`price::PriceProvider`])
//! - time-bucketed OHLC candles at multiple granularities ([`candle`])
//! - depth-aware execution estimates with slippage ([`sim`])
//! - a market-health monitor with hysteresis alerts ([`analyzer`])
//!
//! Data flows one direction: `OrderBookState` -> `PriceProvider` ->
//! {candles, simulator, analyzer}. The ladder is the only mutable shared
//! state; every derivation works on an immutable snapshot taken under the
//! book lock.

pub mod analyzer;
pub mod book;
pub mod candle;
pub mod config;
pub mod error;
pub mod price;
pub mod sim;
pub mod subscribe;

pub use error::{MarketError, Result};
