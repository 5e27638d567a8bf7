//! OHLC candle aggregation
//!
//! Folds the mid-price stream into fixed time buckets, one aggregator
//! per granularity. Candles have no volume field: the mid-price is not
//! trade volume, and synthesizing one would be a lie. A trade-feed
//! collaborator owns volume if it is ever needed.

use crate::config::CandleConfig;
use crate::error::{MarketError, Result};
use crate::price::{MarketContext, PriceProvider};
use crate::subscribe::{Subscribers, SubscriptionId};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// One OHLC candle over a fixed time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub period_start: DateTime<Utc>,
    pub granularity_secs: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Absolute spread at the latest update folded in; None when the
    /// book was one-sided at close
    pub spread_at_close: Option<Decimal>,
}

impl Candle {
    fn open_at(
        period_start: DateTime<Utc>,
        granularity_secs: i64,
        price: Decimal,
        spread: Option<Decimal>,
    ) -> Self {
        Self {
            period_start,
            granularity_secs,
            open: price,
            high: price,
            low: price,
            close: price,
            spread_at_close: spread,
        }
    }

    fn fold(&mut self, price: Decimal, spread: Option<Decimal>) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.spread_at_close = spread;
    }

    pub fn period_end(&self) -> DateTime<Utc> {
        self.period_start + chrono::Duration::seconds(self.granularity_secs)
    }
}

/// Floor a timestamp to its bucket start for the given granularity.
fn bucket_start(ts: DateTime<Utc>, granularity_secs: i64) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let start = secs - secs.rem_euclid(granularity_secs);
    Utc.timestamp_opt(start, 0).single().unwrap_or(ts)
}

/// Folds price updates into candles for one granularity.
///
/// Subscribers receive only completed candles; the in-progress one is
/// readable through [`current_candle`](Self::current_candle) as a clone,
/// never as a live reference.
pub struct CandleAggregator {
    granularity_secs: i64,
    emit_gap_fill: bool,
    current: RwLock<Option<Candle>>,
    subscribers: Subscribers<Candle>,
}

impl CandleAggregator {
    pub fn new(granularity_secs: i64, emit_gap_fill: bool) -> Result<Self> {
        if granularity_secs <= 0 {
            return Err(MarketError::InvalidConfig(format!(
                "candle granularity must be positive, got {}",
                granularity_secs
            )));
        }
        Ok(Self {
            granularity_secs,
            emit_gap_fill,
            current: RwLock::new(None),
            subscribers: Subscribers::new(),
        })
    }

    pub fn granularity_secs(&self) -> i64 {
        self.granularity_secs
    }

    /// Fold one price update. Returns the candles completed by this
    /// update (at most one unless gap backfill is enabled), after
    /// delivering them to subscribers.
    pub fn update(
        &self,
        price: Decimal,
        spread: Option<Decimal>,
        timestamp: DateTime<Utc>,
    ) -> Vec<Candle> {
        let bucket = bucket_start(timestamp, self.granularity_secs);
        let mut completed = Vec::new();

        {
            let mut current = self.current.write();
            match current.as_mut() {
                None => {
                    *current = Some(Candle::open_at(
                        bucket,
                        self.granularity_secs,
                        price,
                        spread,
                    ));
                }
                Some(candle) if bucket == candle.period_start => {
                    candle.fold(price, spread);
                }
                Some(candle) if bucket < candle.period_start => {
                    // Input is expected to be monotonic; a tick from an
                    // earlier bucket cannot be folded once that candle
                    // is gone.
                    debug!(
                        granularity = self.granularity_secs,
                        %timestamp,
                        "dropping price update from an earlier bucket"
                    );
                }
                Some(candle) => {
                    let finished = candle.clone();
                    completed.push(finished.clone());

                    if self.emit_gap_fill {
                        // Flat candles at the previous close for every
                        // skipped bucket.
                        let mut start = finished.period_end();
                        while start < bucket {
                            completed.push(Candle::open_at(
                                start,
                                self.granularity_secs,
                                finished.close,
                                finished.spread_at_close,
                            ));
                            start += chrono::Duration::seconds(self.granularity_secs);
                        }
                    }

                    *candle =
                        Candle::open_at(bucket, self.granularity_secs, price, spread);
                }
            }
        }

        for candle in &completed {
            self.subscribers.notify(candle);
        }
        completed
    }

    /// Deliver completed candles only, in completion order.
    pub fn subscribe_to_candles<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Candle) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Clone of the in-progress candle, for display use.
    pub fn current_candle(&self) -> Option<Candle> {
        self.current.read().clone()
    }
}

/// One aggregator per configured granularity, fed off a single price
/// stream in arrival order.
pub struct CandleSet {
    aggregators: Vec<Arc<CandleAggregator>>,
}

impl CandleSet {
    pub fn new(config: &CandleConfig) -> Result<Self> {
        if config.granularities.is_empty() {
            return Err(MarketError::InvalidConfig(
                "at least one candle granularity is required".to_string(),
            ));
        }
        let aggregators = config
            .granularities
            .iter()
            .map(|g| CandleAggregator::new(*g, config.emit_gap_fill).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { aggregators })
    }

    /// Fan one update out to every aggregator, in configured order.
    pub fn update(&self, price: Decimal, spread: Option<Decimal>, timestamp: DateTime<Utc>) {
        for aggregator in &self.aggregators {
            aggregator.update(price, spread, timestamp);
        }
    }

    pub fn get(&self, granularity_secs: i64) -> Option<&Arc<CandleAggregator>> {
        self.aggregators
            .iter()
            .find(|a| a.granularity_secs() == granularity_secs)
    }

    pub fn aggregators(&self) -> &[Arc<CandleAggregator>] {
        &self.aggregators
    }

    /// Feed this set from a provider's context stream. Updates without a
    /// mid-price are skipped: candles track the canonical price, and "no
    /// data" must not fabricate one.
    pub fn attach_to(&self, provider: &PriceProvider) -> SubscriptionId {
        let aggregators = self.aggregators.clone();
        provider.subscribe(move |ctx: &MarketContext| {
            if let Some(mid) = ctx.mid_price {
                let spread = ctx.spread.map(|s| s.absolute);
                for aggregator in &aggregators {
                    aggregator.update(mid, spread, ctx.timestamp);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn agg(granularity: i64) -> CandleAggregator {
        CandleAggregator::new(granularity, false).unwrap()
    }

    #[test]
    fn test_first_update_opens_candle() {
        let aggregator = agg(60);
        assert!(aggregator.current_candle().is_none());

        let completed = aggregator.update(dec!(100), Some(dec!(0.1)), at(1_000_030));
        assert!(completed.is_empty());

        let candle = aggregator.current_candle().unwrap();
        assert_eq!(candle.period_start, at(1_000_020)); // floor to 60s
        assert_eq!(candle.open, dec!(100));
        assert_eq!(candle.high, dec!(100));
        assert_eq!(candle.low, dec!(100));
        assert_eq!(candle.close, dec!(100));
    }

    #[test]
    fn test_updates_within_bucket_fold() {
        let aggregator = agg(60);
        aggregator.update(dec!(100), None, at(60));
        aggregator.update(dec!(103), None, at(70));
        aggregator.update(dec!(99), Some(dec!(0.2)), at(80));
        aggregator.update(dec!(101), Some(dec!(0.3)), at(119));

        let candle = aggregator.current_candle().unwrap();
        assert_eq!(candle.open, dec!(100));
        assert_eq!(candle.high, dec!(103));
        assert_eq!(candle.low, dec!(99));
        assert_eq!(candle.close, dec!(101));
        assert_eq!(candle.spread_at_close, Some(dec!(0.3)));
    }

    #[test]
    fn test_bucket_rollover_emits_completed() {
        let aggregator = agg(60);
        let emitted: Arc<Mutex<Vec<Candle>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&emitted);
        aggregator.subscribe_to_candles(move |c: &Candle| sink.lock().push(c.clone()));

        aggregator.update(dec!(100), None, at(60));
        aggregator.update(dec!(105), None, at(90));
        let completed = aggregator.update(dec!(102), None, at(120));

        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].period_start, at(60));
        assert_eq!(completed[0].high, dec!(105));
        assert_eq!(completed[0].close, dec!(105));

        let delivered = emitted.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0], completed[0]);

        // New bucket opened at the new price.
        let current = aggregator.current_candle().unwrap();
        assert_eq!(current.period_start, at(120));
        assert_eq!(current.open, dec!(102));
    }

    #[test]
    fn test_k_buckets_emit_k_candles() {
        let aggregator = agg(60);
        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        aggregator.subscribe_to_candles(move |_| *sink.lock() += 1);

        // Updates spanning 5 buckets, at least one per bucket; the last
        // bucket stays in progress.
        for i in 0..10 {
            aggregator.update(dec!(100) + Decimal::from(i), None, at(i * 30));
        }
        assert_eq!(*count.lock(), 4);
    }

    #[test]
    fn test_candle_invariants_hold() {
        let aggregator = agg(60);
        let emitted: Arc<Mutex<Vec<Candle>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&emitted);
        aggregator.subscribe_to_candles(move |c: &Candle| sink.lock().push(c.clone()));

        let prices = [100, 104, 98, 103, 101, 99, 105, 97];
        for (i, p) in prices.iter().enumerate() {
            aggregator.update(Decimal::from(*p), None, at(i as i64 * 20));
        }

        for candle in emitted.lock().iter() {
            assert!(candle.high >= candle.open && candle.high >= candle.close);
            assert!(candle.low <= candle.open && candle.low <= candle.close);
        }
    }

    #[test]
    fn test_gap_buckets_not_synthesized_by_default() {
        let aggregator = agg(60);
        aggregator.update(dec!(100), None, at(60));
        // Next update three buckets later.
        let completed = aggregator.update(dec!(101), None, at(240));

        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].period_start, at(60));
        assert_eq!(aggregator.current_candle().unwrap().period_start, at(240));
    }

    #[test]
    fn test_gap_fill_backfills_flat_candles() {
        let aggregator = CandleAggregator::new(60, true).unwrap();
        aggregator.update(dec!(100), Some(dec!(0.1)), at(60));
        let completed = aggregator.update(dec!(101), None, at(240));

        assert_eq!(completed.len(), 3);
        assert_eq!(completed[0].period_start, at(60));
        // Two flat candles at the previous close for buckets 120 and 180.
        for (candle, start) in completed[1..].iter().zip([at(120), at(180)]) {
            assert_eq!(candle.period_start, start);
            assert_eq!(candle.open, dec!(100));
            assert_eq!(candle.high, dec!(100));
            assert_eq!(candle.low, dec!(100));
            assert_eq!(candle.close, dec!(100));
        }
    }

    #[test]
    fn test_late_tick_dropped() {
        let aggregator = agg(60);
        aggregator.update(dec!(100), None, at(120));
        let completed = aggregator.update(dec!(90), None, at(30));

        assert!(completed.is_empty());
        // Current candle untouched by the late tick.
        let candle = aggregator.current_candle().unwrap();
        assert_eq!(candle.low, dec!(100));
    }

    #[test]
    fn test_emitted_candle_not_aliased() {
        let aggregator = agg(60);
        let emitted: Arc<Mutex<Vec<Candle>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&emitted);
        aggregator.subscribe_to_candles(move |c: &Candle| sink.lock().push(c.clone()));

        aggregator.update(dec!(100), None, at(60));
        aggregator.update(dec!(101), None, at(120));
        // Mutate the new bucket; the emitted candle must not move.
        aggregator.update(dec!(150), None, at(130));

        assert_eq!(emitted.lock()[0].close, dec!(100));
    }

    #[test]
    fn test_set_runs_granularities_independently() {
        let set = CandleSet::new(&CandleConfig {
            granularities: vec![60, 300],
            emit_gap_fill: false,
        })
        .unwrap();

        let minute_done = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&minute_done);
        set.get(60)
            .unwrap()
            .subscribe_to_candles(move |_| *sink.lock() += 1);

        for i in 0..6 {
            set.update(dec!(100), None, at(i * 60));
        }

        // Five minute-candles completed; the 300s bucket rolled once.
        assert_eq!(*minute_done.lock(), 5);
        assert_eq!(
            set.get(300).unwrap().current_candle().unwrap().period_start,
            at(300)
        );
        assert!(set.get(999).is_none());
    }

    #[test]
    fn test_set_rejects_bad_config() {
        assert!(CandleSet::new(&CandleConfig {
            granularities: vec![],
            emit_gap_fill: false,
        })
        .is_err());
        assert!(CandleAggregator::new(0, false).is_err());
    }

    #[test]
    fn test_attach_to_provider_feeds_mid() {
        use crate::book::{Orderbook, OrderbookLevel, OrderBookState};
        use crate::config::{BookConfig, PriceConfig};

        let provider = PriceProvider::new(
            Arc::new(OrderBookState::new(BookConfig::default())),
            PriceConfig::default(),
        );
        let set = CandleSet::new(&CandleConfig::default()).unwrap();
        set.attach_to(&provider);

        provider.ingest_snapshot(Orderbook::new(
            vec![OrderbookLevel::new(dec!(100.00), dec!(2))],
            vec![OrderbookLevel::new(dec!(100.10), dec!(1))],
            1,
            Utc::now(),
        ));

        let candle = set.get(60).unwrap().current_candle().unwrap();
        assert_eq!(candle.open, dec!(100.05));
        assert_eq!(candle.spread_at_close, Some(dec!(0.10)));
    }
}
