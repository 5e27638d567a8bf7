//! Execution simulation
//!
//! Walks the order book ladder to compute realistic fills: average price,
//! worst price touched, slippage against mid, partial-fill shortfall.
//! [`walk_book`] is the single shared fill algorithm; the price provider
//! delegates here so context estimates and simulator results can never
//! diverge. Walks are pure functions of a snapshot, with no side effects
//! on book state.

use crate::book::{Orderbook, OrderBookState, Side};
use crate::config::SimConfig;
use crate::error::{MarketError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Direction of a simulated order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The ladder a taker order consumes: buys lift asks, sells hit bids.
    pub fn consumes(&self) -> Side {
        match self {
            OrderSide::Buy => Side::Ask,
            OrderSide::Sell => Side::Bid,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Result of walking the book for a hypothetical order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEstimate {
    pub side: OrderSide,
    pub requested_size: Decimal,
    pub filled_size: Decimal,
    /// Size-weighted average fill price; None when nothing filled
    pub average_price: Option<Decimal>,
    /// Deepest price level touched; None when nothing filled
    pub worst_price: Option<Decimal>,
    /// Notional cost of the filled portion
    pub total_cost: Decimal,
    /// |average - mid| / mid in basis points; zero when mid is unknown
    /// or nothing filled
    pub slippage_bps: Decimal,
    pub levels_consumed: u32,
    /// False when visible liquidity (or the limit price) cut the fill short
    pub can_fill: bool,
    /// Unfilled remainder when `can_fill` is false
    pub shortfall: Decimal,
}

/// Walk the opposing ladder best-price-first, consuming depth level by
/// level. `limit_price` stops consumption once the ladder crosses it
/// (limit-order semantics); `mid` anchors the slippage calculation.
pub fn walk_book(
    levels: &[crate::book::OrderbookLevel],
    side: OrderSide,
    requested_size: Decimal,
    limit_price: Option<Decimal>,
    mid: Option<Decimal>,
) -> ExecutionEstimate {
    let mut remaining = requested_size;
    let mut total_cost = Decimal::ZERO;
    let mut worst_price = None;
    let mut levels_consumed = 0u32;

    for level in levels {
        if remaining <= Decimal::ZERO {
            break;
        }
        if let Some(limit) = limit_price {
            let crossed = match side {
                OrderSide::Buy => level.price > limit,
                OrderSide::Sell => level.price < limit,
            };
            if crossed {
                break;
            }
        }

        let fill = remaining.min(level.size);
        total_cost += fill * level.price;
        worst_price = Some(level.price);
        remaining -= fill;
        levels_consumed += 1;
    }

    let filled_size = requested_size - remaining;
    let average_price = if filled_size > Decimal::ZERO {
        Some(total_cost / filled_size)
    } else {
        None
    };

    let slippage_bps = match (mid, average_price) {
        (Some(mid), Some(average)) if mid > Decimal::ZERO => {
            (average - mid).abs() / mid * dec!(10000)
        }
        _ => Decimal::ZERO,
    };

    ExecutionEstimate {
        side,
        requested_size,
        filled_size,
        average_price,
        worst_price,
        total_cost,
        slippage_bps,
        levels_consumed,
        can_fill: remaining == Decimal::ZERO,
        shortfall: remaining,
    }
}

/// Estimate a fill against a book snapshot. Shared by the simulator and
/// the price provider's context estimates.
pub fn estimate(
    book: &Orderbook,
    side: OrderSide,
    size: Decimal,
    limit_price: Option<Decimal>,
) -> ExecutionEstimate {
    walk_book(
        book.side(side.consumes()),
        side,
        size,
        limit_price,
        book.mid_price(),
    )
}

/// One recorded simulation, for fill-rate and slippage reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub estimate: ExecutionEstimate,
}

/// Rolled-up statistics over the retained history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub simulations: usize,
    /// Fraction of simulations that filled completely
    pub fill_rate: Decimal,
    /// Mean slippage over fully or partially filled simulations
    pub average_slippage_bps: Decimal,
}

/// Fill simulator over the live book, with a bounded history log.
pub struct ExecutionSimulator {
    book: Arc<OrderBookState>,
    history_limit: usize,
    history: RwLock<VecDeque<ExecutionRecord>>,
}

impl ExecutionSimulator {
    pub fn new(book: Arc<OrderBookState>, config: SimConfig) -> Self {
        Self {
            book,
            history_limit: config.history_limit,
            history: RwLock::new(VecDeque::new()),
        }
    }

    /// Simulate a market order of `size` against current depth.
    pub fn simulate(&self, side: OrderSide, size: Decimal) -> Result<ExecutionEstimate> {
        self.run(side, size, None)
    }

    /// Simulate a limit order: stops consuming levels once the ladder
    /// crosses `limit_price`, possibly leaving a shortfall even when the
    /// book has more depth.
    pub fn simulate_limit(
        &self,
        side: OrderSide,
        size: Decimal,
        limit_price: Decimal,
    ) -> Result<ExecutionEstimate> {
        if limit_price <= Decimal::ZERO {
            return Err(MarketError::InvalidLimitPrice { price: limit_price });
        }
        self.run(side, size, Some(limit_price))
    }

    fn run(
        &self,
        side: OrderSide,
        size: Decimal,
        limit_price: Option<Decimal>,
    ) -> Result<ExecutionEstimate> {
        if size <= Decimal::ZERO {
            return Err(MarketError::InvalidSize { size });
        }

        let book = self.book.snapshot();
        let result = estimate(&book, side, size, limit_price);

        let mut history = self.history.write();
        history.push_back(ExecutionRecord {
            timestamp: Utc::now(),
            estimate: result.clone(),
        });
        while history.len() > self.history_limit {
            history.pop_front();
        }

        Ok(result)
    }

    /// Retained simulation records, oldest first.
    pub fn history(&self) -> Vec<ExecutionRecord> {
        self.history.read().iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.history.write().clear();
    }

    /// Statistics over the retained history; None when nothing recorded.
    pub fn stats(&self) -> Option<ExecutionStats> {
        let history = self.history.read();
        if history.is_empty() {
            return None;
        }

        let total = history.len();
        let filled = history.iter().filter(|r| r.estimate.can_fill).count();
        let slippages: Vec<Decimal> = history
            .iter()
            .filter(|r| r.estimate.filled_size > Decimal::ZERO)
            .map(|r| r.estimate.slippage_bps)
            .collect();
        let average_slippage_bps = if slippages.is_empty() {
            Decimal::ZERO
        } else {
            slippages.iter().sum::<Decimal>() / Decimal::from(slippages.len() as u64)
        };

        Some(ExecutionStats {
            simulations: total,
            fill_rate: Decimal::from(filled as u64) / Decimal::from(total as u64),
            average_slippage_bps,
        })
    }
}
