//! Order book state
//!
//! Authoritative in-memory L2 ladder for one instrument. Replaced
//! wholesale on snapshot receipt, mutated level-by-level on deltas,
//! reset to empty on disconnect. Single writer; readers always work on
//! cloned snapshots, never on live references.

use crate::config::{BookConfig, SequencePolicy};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Bid => write!(f, "bid"),
            Side::Ask => write!(f, "ask"),
        }
    }
}

/// One aggregated price level. A level with `size == 0` is removed,
/// never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderbookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl OrderbookLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// A single level change from the feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LevelUpdate {
    pub side: Side,
    pub price: Decimal,
    /// New aggregate size at `price`; zero removes the level
    pub size: Decimal,
}

/// Immutable L2 snapshot: bids descending, asks ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orderbook {
    pub bids: Vec<OrderbookLevel>,
    pub asks: Vec<OrderbookLevel>,
    pub sequence: u64,
    pub last_update: DateTime<Utc>,
}

impl Default for Orderbook {
    fn default() -> Self {
        Self::empty()
    }
}

impl Orderbook {
    pub fn empty() -> Self {
        Self {
            bids: Vec::new(),
            asks: Vec::new(),
            sequence: 0,
            last_update: Utc::now(),
        }
    }

    pub fn new(
        bids: Vec<OrderbookLevel>,
        asks: Vec<OrderbookLevel>,
        sequence: u64,
        last_update: DateTime<Utc>,
    ) -> Self {
        Self {
            bids,
            asks,
            sequence,
            last_update,
        }
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Mid-price, or None when either side is empty. Never zero as a
    /// stand-in for "no data".
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// A consistent book never has `best_bid >= best_ask`.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Levels for one side, best price first.
    pub fn side(&self, side: Side) -> &[OrderbookLevel] {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }
}

/// Outcome of applying a snapshot or delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Sequence number not greater than the current one
    RejectedStale,
    /// Strict policy and the delta is not `current + 1`; resync required
    RejectedGap,
    /// Snapshot with `best_bid >= best_ask`
    RejectedCrossed,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// Mutable order book state behind a single write lock.
pub struct OrderBookState {
    config: BookConfig,
    book: RwLock<Orderbook>,
}

impl OrderBookState {
    pub fn new(config: BookConfig) -> Self {
        Self {
            config,
            book: RwLock::new(Orderbook::empty()),
        }
    }

    /// Replace the whole book. Crossed or stale snapshots are logged and
    /// discarded; malformed levels are dropped individually.
    pub fn apply_snapshot(&self, incoming: Orderbook) -> ApplyOutcome {
        let mut snapshot = incoming;
        snapshot.bids.retain(|l| keep_level(Side::Bid, l));
        snapshot.asks.retain(|l| keep_level(Side::Ask, l));

        // Sides are stored sorted best-first; incoming order is not trusted.
        snapshot.bids.sort_by(|a, b| b.price.cmp(&a.price));
        snapshot.asks.sort_by(|a, b| a.price.cmp(&b.price));
        snapshot.bids.truncate(self.config.max_depth);
        snapshot.asks.truncate(self.config.max_depth);

        if snapshot.is_crossed() {
            warn!(
                best_bid = %snapshot.best_bid().unwrap_or_default(),
                best_ask = %snapshot.best_ask().unwrap_or_default(),
                "discarding crossed snapshot"
            );
            return ApplyOutcome::RejectedCrossed;
        }

        let mut book = self.book.write();
        if snapshot.sequence <= book.sequence && !book.is_empty() {
            debug!(
                incoming = snapshot.sequence,
                current = book.sequence,
                "discarding stale snapshot"
            );
            return ApplyOutcome::RejectedStale;
        }

        *book = snapshot;
        ApplyOutcome::Applied
    }

    /// Apply a batch of level changes atomically: the whole delta is
    /// accepted or rejected on its sequence number; within an accepted
    /// delta, malformed levels are dropped individually with a warning.
    pub fn apply_delta(&self, updates: &[LevelUpdate], sequence: u64) -> ApplyOutcome {
        let mut book = self.book.write();

        if sequence <= book.sequence {
            debug!(
                incoming = sequence,
                current = book.sequence,
                "discarding stale delta"
            );
            return ApplyOutcome::RejectedStale;
        }
        if self.config.sequence_policy == SequencePolicy::Strict
            && sequence != book.sequence + 1
        {
            warn!(
                incoming = sequence,
                current = book.sequence,
                "sequence gap in strict mode, delta rejected; resync with a snapshot"
            );
            return ApplyOutcome::RejectedGap;
        }

        for update in updates {
            if update.price <= Decimal::ZERO || update.size < Decimal::ZERO {
                warn!(
                    side = %update.side,
                    price = %update.price,
                    size = %update.size,
                    "dropping malformed level update"
                );
                continue;
            }
            let levels = match update.side {
                Side::Bid => &mut book.bids,
                Side::Ask => &mut book.asks,
            };
            if update.size == Decimal::ZERO {
                remove_level(levels, update.price);
            } else {
                upsert_level(levels, update.side, update.price, update.size);
            }
        }

        book.bids.truncate(self.config.max_depth);
        book.asks.truncate(self.config.max_depth);
        book.sequence = sequence;
        book.last_update = Utc::now();

        if book.is_crossed() {
            // A transiently crossed book can happen mid-resync; keep the
            // state and let the next snapshot settle it.
            debug!(sequence, "book crossed after delta");
        }

        ApplyOutcome::Applied
    }

    /// Cloned point-in-time copy for readers.
    pub fn snapshot(&self) -> Orderbook {
        self.book.read().clone()
    }

    /// Clear all state, e.g. on disconnect. The next snapshot rebuilds.
    pub fn reset(&self) {
        let mut book = self.book.write();
        *book = Orderbook::empty();
        debug!("order book reset");
    }

    pub fn sequence(&self) -> u64 {
        self.book.read().sequence
    }

    pub fn is_empty(&self) -> bool {
        self.book.read().is_empty()
    }
}

fn keep_level(side: Side, level: &OrderbookLevel) -> bool {
    if level.price <= Decimal::ZERO || level.size <= Decimal::ZERO {
        warn!(
            side = %side,
            price = %level.price,
            size = %level.size,
            "dropping malformed snapshot level"
        );
        return false;
    }
    true
}

/// Insert or replace a level, keeping the side sorted best-price-first.
fn upsert_level(levels: &mut Vec<OrderbookLevel>, side: Side, price: Decimal, size: Decimal) {
    let idx = match side {
        Side::Bid => levels.partition_point(|l| l.price > price),
        Side::Ask => levels.partition_point(|l| l.price < price),
    };
    if idx < levels.len() && levels[idx].price == price {
        levels[idx].size = size;
    } else {
        levels.insert(idx, OrderbookLevel::new(price, size));
    }
}

fn remove_level(levels: &mut Vec<OrderbookLevel>, price: Decimal) {
    if let Some(idx) = levels.iter().position(|l| l.price == price) {
        levels.remove(idx);
    }
}
