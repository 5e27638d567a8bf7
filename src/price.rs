//! Canonical price signal
//!
//! Single source of truth for everything derived from the order book:
//! mid-price, spread, liquidity-at-distance, imbalance, and reference
//! execution estimates, bundled into an immutable [`MarketContext`]
//! published to subscribers on every accepted book mutation. Replaces
//! ticker price, trade-derived candles and raw book reads with one
//! consistent stream.
//!
//! Every accepted mutation produces exactly one notification; the
//! provider never buffers or coalesces. Throttling, if wanted, belongs
//! to the subscriber.

use crate::book::{ApplyOutcome, LevelUpdate, Orderbook, OrderBookState, Side};
use crate::config::PriceConfig;
use crate::error::{MarketError, Result};
use crate::sim::{self, ExecutionEstimate, OrderSide};
use crate::subscribe::{Subscribers, SubscriptionId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Bid-ask spread in three representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpreadMetrics {
    pub absolute: Decimal,
    pub percent_of_mid: Decimal,
    pub basis_points: Decimal,
}

/// Liquidity available within one percentage band of mid, per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandLiquidity {
    /// Distance from mid in percent (0.5 = 0.5%)
    pub band_pct: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
}

impl BandLiquidity {
    pub fn total(&self) -> Decimal {
        self.bid_size + self.ask_size
    }
}

/// Liquidity at each configured band, tightest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LiquidityMetrics {
    pub bands: Vec<BandLiquidity>,
}

impl LiquidityMetrics {
    /// Combined size at the tightest configured band.
    pub fn near_total(&self) -> Decimal {
        self.bands.first().map(|b| b.total()).unwrap_or(Decimal::ZERO)
    }
}

/// Buy-side execution estimates at the configured reference sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceEstimates {
    pub small: ExecutionEstimate,
    pub medium: ExecutionEstimate,
    pub large: ExecutionEstimate,
}

/// Immutable snapshot of every price-derived fact at one book sequence.
/// Consumers treat it as a value; a fresh one is produced per mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContext {
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    /// None until both sides of the book have data
    pub mid_price: Option<Decimal>,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    /// None when mid is unavailable
    pub spread: Option<SpreadMetrics>,
    pub liquidity: LiquidityMetrics,
    pub estimates: Option<ReferenceEstimates>,
    /// (bid - ask) / (bid + ask) volume skew, scaled to [-100, 100]
    pub imbalance: Decimal,
    pub is_healthy: bool,
}

/// Derives and publishes the canonical price signal.
pub struct PriceProvider {
    config: PriceConfig,
    book: Arc<OrderBookState>,
    subscribers: Subscribers<MarketContext>,
    /// Held across apply + notify: with concurrent ingestion, each
    /// accepted mutation must publish its own context before the next
    /// mutation lands.
    ingest_lock: Mutex<()>,
}

impl PriceProvider {
    pub fn new(book: Arc<OrderBookState>, config: PriceConfig) -> Self {
        Self {
            config,
            book,
            subscribers: Subscribers::new(),
            ingest_lock: Mutex::new(()),
        }
    }

    /// The underlying book state, for wiring up collaborators.
    pub fn book(&self) -> &Arc<OrderBookState> {
        &self.book
    }

    /// Ingestion entry point: apply a snapshot and, if accepted, notify
    /// subscribers with a fresh context.
    pub fn ingest_snapshot(&self, snapshot: Orderbook) -> ApplyOutcome {
        let _ingest = self.ingest_lock.lock();
        let outcome = self.book.apply_snapshot(snapshot);
        if outcome.is_applied() {
            self.publish();
        }
        outcome
    }

    /// Ingestion entry point for deltas. Rejected deltas produce no
    /// notification.
    pub fn ingest_delta(&self, updates: &[LevelUpdate], sequence: u64) -> ApplyOutcome {
        let _ingest = self.ingest_lock.lock();
        let outcome = self.book.apply_delta(updates, sequence);
        if outcome.is_applied() {
            self.publish();
        }
        outcome
    }

    fn publish(&self) {
        let context = self.market_context();
        self.subscribers.notify(&context);
    }

    /// Register a context listener; delivery is synchronous and ordered
    /// per update.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&MarketContext) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// `(best_bid + best_ask) / 2`, or None while either side is empty.
    pub fn mid_price(&self) -> Option<Decimal> {
        self.book.snapshot().mid_price()
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.book.snapshot().best_bid()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.book.snapshot().best_ask()
    }

    /// Spread metrics, or None while mid is unavailable.
    pub fn spread(&self) -> Option<SpreadMetrics> {
        spread_of(&self.book.snapshot())
    }

    /// Total size on `side` within `band_pct` percent of mid. None while
    /// mid is unavailable.
    pub fn liquidity_at_distance(&self, side: Side, band_pct: Decimal) -> Option<Decimal> {
        let book = self.book.snapshot();
        let mid = book.mid_price()?;
        Some(liquidity_within(&book, side, mid, band_pct))
    }

    /// Volume skew over the configured reference depth, in [-100, 100].
    /// Zero when both sides are empty.
    pub fn imbalance(&self) -> Decimal {
        imbalance_of(&self.book.snapshot(), self.config.imbalance_depth)
    }

    /// Depth-aware fill estimate; same walk as the execution simulator.
    pub fn estimate_execution(&self, side: OrderSide, size: Decimal) -> Result<ExecutionEstimate> {
        if size <= Decimal::ZERO {
            return Err(MarketError::InvalidSize { size });
        }
        Ok(sim::estimate(&self.book.snapshot(), side, size, None))
    }

    /// Assemble the full context from one consistent snapshot.
    pub fn market_context(&self) -> MarketContext {
        let book = self.book.snapshot();
        self.context_from(&book)
    }

    fn context_from(&self, book: &Orderbook) -> MarketContext {
        let mid = book.mid_price();
        let spread = spread_of(book);

        let liquidity = match mid {
            Some(mid) => LiquidityMetrics {
                bands: self
                    .config
                    .liquidity_bands
                    .iter()
                    .map(|band| BandLiquidity {
                        band_pct: *band,
                        bid_size: liquidity_within(book, Side::Bid, mid, *band),
                        ask_size: liquidity_within(book, Side::Ask, mid, *band),
                    })
                    .collect(),
            },
            None => LiquidityMetrics::default(),
        };

        let estimates = mid.map(|_| {
            let sizes = &self.config.reference_sizes;
            ReferenceEstimates {
                small: sim::estimate(book, OrderSide::Buy, sizes.small, None),
                medium: sim::estimate(book, OrderSide::Buy, sizes.medium, None),
                large: sim::estimate(book, OrderSide::Buy, sizes.large, None),
            }
        });

        let is_healthy = match (&spread, mid) {
            (Some(spread), Some(_)) => {
                spread.percent_of_mid <= self.config.healthy_max_spread_pct
                    && liquidity.near_total() >= self.config.healthy_min_liquidity
            }
            _ => false,
        };

        MarketContext {
            timestamp: book.last_update,
            sequence: book.sequence,
            mid_price: mid,
            best_bid: book.best_bid(),
            best_ask: book.best_ask(),
            spread,
            liquidity,
            estimates,
            imbalance: imbalance_of(book, self.config.imbalance_depth),
            is_healthy,
        }
    }
}

fn spread_of(book: &Orderbook) -> Option<SpreadMetrics> {
    let bid = book.best_bid()?;
    let ask = book.best_ask()?;
    let mid = (bid + ask) / Decimal::TWO;
    if mid <= Decimal::ZERO {
        return None;
    }
    let absolute = ask - bid;
    let percent_of_mid = absolute / mid * dec!(100);
    Some(SpreadMetrics {
        absolute,
        percent_of_mid,
        basis_points: percent_of_mid * dec!(100),
    })
}

/// Linear scan with early exit: levels are sorted best-first, so the
/// first level outside the band ends the walk.
fn liquidity_within(book: &Orderbook, side: Side, mid: Decimal, band_pct: Decimal) -> Decimal {
    let fraction = band_pct / dec!(100);
    let mut total = Decimal::ZERO;
    match side {
        Side::Bid => {
            let floor = mid * (Decimal::ONE - fraction);
            for level in &book.bids {
                if level.price < floor {
                    break;
                }
                total += level.size;
            }
        }
        Side::Ask => {
            let ceiling = mid * (Decimal::ONE + fraction);
            for level in &book.asks {
                if level.price > ceiling {
                    break;
                }
                total += level.size;
            }
        }
    }
    total
}

fn imbalance_of(book: &Orderbook, depth: usize) -> Decimal {
    let bid_volume: Decimal = book.bids.iter().take(depth).map(|l| l.size).sum();
    let ask_volume: Decimal = book.asks.iter().take(depth).map(|l| l.size).sum();
    let total = bid_volume + ask_volume;
    if total == Decimal::ZERO {
        return Decimal::ZERO;
    }
    (bid_volume - ask_volume) / total * dec!(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::OrderbookLevel;
    use crate::config::BookConfig;
    use parking_lot::Mutex;

    fn make_snapshot(bids: Vec<(f64, f64)>, asks: Vec<(f64, f64)>, sequence: u64) -> Orderbook {
        Orderbook::new(
            bids.into_iter()
                .map(|(p, s)| {
                    OrderbookLevel::new(
                        Decimal::try_from(p).unwrap(),
                        Decimal::try_from(s).unwrap(),
                    )
                })
                .collect(),
            asks.into_iter()
                .map(|(p, s)| {
                    OrderbookLevel::new(
                        Decimal::try_from(p).unwrap(),
                        Decimal::try_from(s).unwrap(),
                    )
                })
                .collect(),
            sequence,
            Utc::now(),
        )
    }

    fn make_provider() -> PriceProvider {
        PriceProvider::new(
            Arc::new(OrderBookState::new(BookConfig::default())),
            PriceConfig::default(),
        )
    }

    fn seeded_provider() -> PriceProvider {
        let provider = make_provider();
        provider.ingest_snapshot(make_snapshot(
            vec![(100.00, 2.0), (99.90, 5.0)],
            vec![(100.10, 1.0), (100.20, 3.0)],
            1,
        ));
        provider
    }

    #[test]
    fn test_mid_price_unavailable_before_data() {
        let provider = make_provider();
        assert_eq!(provider.mid_price(), None);
        assert_eq!(provider.spread(), None);

        let context = provider.market_context();
        assert_eq!(context.mid_price, None);
        assert!(!context.is_healthy);
        assert_eq!(context.imbalance, Decimal::ZERO);
    }

    #[test]
    fn test_mid_and_spread() {
        let provider = seeded_provider();
        assert_eq!(provider.mid_price(), Some(dec!(100.05)));

        let spread = provider.spread().unwrap();
        assert_eq!(spread.absolute, dec!(0.10));
        assert_eq!(spread.percent_of_mid, dec!(0.10) / dec!(100.05) * dec!(100));
        assert_eq!(spread.basis_points, spread.percent_of_mid * dec!(100));
    }

    #[test]
    fn test_mid_with_one_sided_book() {
        let provider = make_provider();
        provider.ingest_snapshot(make_snapshot(vec![(100.0, 1.0)], vec![], 1));
        assert_eq!(provider.mid_price(), None);
        assert_eq!(provider.best_bid(), Some(dec!(100.0)));
        assert_eq!(provider.best_ask(), None);
    }

    #[test]
    fn test_liquidity_at_distance_early_exit() {
        let provider = make_provider();
        provider.ingest_snapshot(make_snapshot(
            vec![(100.0, 2.0), (99.5, 3.0), (90.0, 50.0)],
            vec![(100.2, 1.0), (100.5, 4.0), (110.0, 50.0)],
            1,
        ));
        // mid = 100.1; 0.5% band = [99.5995, 100.6005]
        let bid_liq = provider
            .liquidity_at_distance(Side::Bid, dec!(0.5))
            .unwrap();
        assert_eq!(bid_liq, dec!(2));

        let ask_liq = provider
            .liquidity_at_distance(Side::Ask, dec!(0.5))
            .unwrap();
        assert_eq!(ask_liq, dec!(5));

        // Wide band reaches the deep levels too.
        let wide = provider
            .liquidity_at_distance(Side::Ask, dec!(15))
            .unwrap();
        assert_eq!(wide, dec!(55));
    }

    #[test]
    fn test_imbalance_bounds_and_sign() {
        let provider = make_provider();
        provider.ingest_snapshot(make_snapshot(vec![(100.0, 9.0)], vec![(100.1, 1.0)], 1));
        assert_eq!(provider.imbalance(), dec!(80));

        provider.ingest_snapshot(make_snapshot(vec![(100.0, 1.0)], vec![(100.1, 9.0)], 2));
        assert_eq!(provider.imbalance(), dec!(-80));

        provider.book().reset();
        assert_eq!(provider.imbalance(), Decimal::ZERO);
    }

    #[test]
    fn test_estimate_matches_simulator_walk() {
        let provider = seeded_provider();
        let est = provider
            .estimate_execution(OrderSide::Buy, dec!(2))
            .unwrap();
        assert_eq!(est.average_price, Some(dec!(100.15)));
        assert_eq!(est.worst_price, Some(dec!(100.20)));
        assert_eq!(est.levels_consumed, 2);

        assert!(provider
            .estimate_execution(OrderSide::Buy, dec!(-1))
            .is_err());
    }

    #[test]
    fn test_context_assembly() {
        let provider = seeded_provider();
        let context = provider.market_context();

        assert_eq!(context.sequence, 1);
        assert_eq!(context.mid_price, Some(dec!(100.05)));
        assert_eq!(context.best_bid, Some(dec!(100.00)));
        assert_eq!(context.best_ask, Some(dec!(100.10)));
        assert_eq!(context.liquidity.bands.len(), 3);

        let estimates = context.estimates.as_ref().unwrap();
        assert!(estimates.small.can_fill);
        // Default large reference size (10) exceeds ask depth (4).
        assert!(!estimates.large.can_fill);
        assert_eq!(estimates.large.shortfall, dec!(6));
    }

    #[test]
    fn test_subscribers_notified_per_accepted_update() {
        let provider = make_provider();
        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let id = provider.subscribe(move |ctx: &MarketContext| {
            sink.lock().push(ctx.sequence);
        });

        provider.ingest_snapshot(make_snapshot(vec![(100.0, 1.0)], vec![(100.1, 1.0)], 1));
        provider.ingest_delta(
            &[LevelUpdate {
                side: Side::Bid,
                price: dec!(99.9),
                size: dec!(1),
            }],
            2,
        );
        // Stale delta: no notification.
        provider.ingest_delta(
            &[LevelUpdate {
                side: Side::Bid,
                price: dec!(99.8),
                size: dec!(1),
            }],
            2,
        );
        // Crossed snapshot: no notification.
        provider.ingest_snapshot(make_snapshot(vec![(101.0, 1.0)], vec![(100.5, 1.0)], 3));

        assert_eq!(*seen.lock(), vec![1, 2]);

        provider.unsubscribe(id);
        provider.ingest_snapshot(make_snapshot(vec![(100.0, 1.0)], vec![(100.1, 1.0)], 4));
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_identical_snapshot_idempotent() {
        let provider = make_provider();
        let count = Arc::new(Mutex::new(0usize));

        let sink = Arc::clone(&count);
        provider.subscribe(move |_| {
            *sink.lock() += 1;
        });

        let snapshot = make_snapshot(vec![(100.0, 1.0)], vec![(100.1, 1.0)], 1);
        provider.ingest_snapshot(snapshot.clone());
        // Same sequence again: stale, no second notification.
        provider.ingest_snapshot(snapshot);

        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_concurrent_ingestion_notifies_in_applied_order() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::thread;

        let provider = Arc::new(make_provider());
        provider.ingest_snapshot(make_snapshot(vec![(100.0, 1.0)], vec![(100.1, 1.0)], 1));

        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        provider.subscribe(move |ctx: &MarketContext| sink.lock().push(ctx.sequence));

        let next = Arc::new(AtomicU64::new(2));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let provider = Arc::clone(&provider);
            let next = Arc::clone(&next);
            handles.push(thread::spawn(move || {
                let mut applied = 0usize;
                for _ in 0..50 {
                    let sequence = next.fetch_add(1, Ordering::Relaxed);
                    let update = [LevelUpdate {
                        side: Side::Bid,
                        price: dec!(99.9),
                        size: dec!(1),
                    }];
                    if provider.ingest_delta(&update, sequence).is_applied() {
                        applied += 1;
                    }
                }
                applied
            }));
        }
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        // Exactly one context per accepted mutation, sequences strictly
        // increasing: no duplicated or skipped notifications under
        // concurrent ingestion.
        let seen = seen.lock();
        assert_eq!(seen.len(), accepted);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_health_gate() {
        let provider = make_provider();
        // Tight spread, decent near liquidity.
        provider.ingest_snapshot(make_snapshot(
            vec![(100.00, 2.0)],
            vec![(100.02, 2.0)],
            1,
        ));
        assert!(provider.market_context().is_healthy);

        // Wide spread.
        provider.ingest_snapshot(make_snapshot(
            vec![(100.00, 2.0)],
            vec![(101.00, 2.0)],
            2,
        ));
        assert!(!provider.market_context().is_healthy);
    }
}
