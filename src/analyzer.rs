//! Market health monitoring
//!
//! Watches the context stream and raises edge-triggered alerts on
//! spread, near-mid liquidity and imbalance, with hysteresis: an alert
//! clears only after the metric passes a separate, less strict recovery
//! threshold, so a metric hovering at the line cannot flap. All
//! thresholds are configuration, not constants.

use crate::config::{AlertThresholds, AnalyzerConfig};
use crate::error::{MarketError, Result};
use crate::price::{MarketContext, PriceProvider};
use crate::sim::OrderSide;
use crate::subscribe::{Subscribers, SubscriptionId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Alert classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    SpreadWide,
    Illiquid,
    Imbalanced,
    /// Conditions for a previously alerting metric returned inside the
    /// recovery threshold
    Recovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Edge-triggered health alert. Emitted once on threshold crossing,
/// re-emitted on Warning->Critical escalation, and followed by exactly
/// one `Recovered` when the metric clears.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityAlert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-metric condition as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricStatus {
    Normal,
    Warning,
    Critical,
    /// The metric cannot currently be computed, e.g. spread on a
    /// one-sided book
    Unknown,
}

impl MetricStatus {
    pub fn is_alerting(&self) -> bool {
        matches!(self, MetricStatus::Warning | MetricStatus::Critical)
    }
}

/// Snapshot of the analyzer's view of the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketCondition {
    pub spread: MetricStatus,
    pub liquidity: MetricStatus,
    pub imbalance: MetricStatus,
}

impl MarketCondition {
    pub fn any_critical(&self) -> bool {
        self.spread == MetricStatus::Critical
            || self.liquidity == MetricStatus::Critical
            || self.imbalance == MetricStatus::Critical
    }

    pub fn all_normal(&self) -> bool {
        self.spread == MetricStatus::Normal
            && self.liquidity == MetricStatus::Normal
            && self.imbalance == MetricStatus::Normal
    }
}

/// Answer from [`LiquidityAnalyzer::can_execute`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanExecute {
    Yes,
    No { reason: String },
}

impl CanExecute {
    pub fn is_allowed(&self) -> bool {
        matches!(self, CanExecute::Yes)
    }
}

/// Which direction makes a metric unhealthy.
#[derive(Clone, Copy, PartialEq)]
enum Worse {
    Higher,
    Lower,
}

/// What a threshold evaluation did to a metric's state.
enum Transition {
    Warn,
    Escalate,
    Recover,
}

fn step(status: &mut MetricStatus, value: Decimal, t: &AlertThresholds, worse: Worse) -> Option<Transition> {
    let breached = |threshold: Decimal| match worse {
        Worse::Higher => value > threshold,
        Worse::Lower => value < threshold,
    };
    let recovered = match worse {
        Worse::Higher => value < t.recovery,
        Worse::Lower => value > t.recovery,
    };

    match *status {
        MetricStatus::Normal | MetricStatus::Unknown if breached(t.critical) => {
            *status = MetricStatus::Critical;
            Some(Transition::Warn)
        }
        MetricStatus::Normal | MetricStatus::Unknown if breached(t.warning) => {
            *status = MetricStatus::Warning;
            Some(Transition::Warn)
        }
        MetricStatus::Unknown => {
            *status = MetricStatus::Normal;
            None
        }
        MetricStatus::Warning if breached(t.critical) => {
            *status = MetricStatus::Critical;
            Some(Transition::Escalate)
        }
        MetricStatus::Warning | MetricStatus::Critical if recovered => {
            *status = MetricStatus::Normal;
            Some(Transition::Recover)
        }
        _ => None,
    }
}

/// Evaluates health thresholds over the context stream and publishes
/// alerts.
pub struct LiquidityAnalyzer {
    config: AnalyzerConfig,
    provider: Arc<PriceProvider>,
    condition: RwLock<MarketCondition>,
    subscribers: Subscribers<LiquidityAlert>,
}

impl LiquidityAnalyzer {
    pub fn new(provider: Arc<PriceProvider>, config: AnalyzerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            provider,
            condition: RwLock::new(MarketCondition {
                spread: MetricStatus::Normal,
                liquidity: MetricStatus::Normal,
                imbalance: MetricStatus::Normal,
            }),
            subscribers: Subscribers::new(),
        })
    }

    /// Evaluate one context. Called per update when attached to a
    /// provider; also callable directly for polling setups.
    pub fn observe(&self, ctx: &MarketContext) {
        let mut alerts = Vec::new();
        {
            let mut condition = self.condition.write();

            // Spread cannot be computed while one side is empty; the
            // status moves to Unknown instead of holding a stale
            // severity. The liquidity metric alerts on the one-sided
            // book itself.
            match &ctx.spread {
                Some(spread) => {
                    let value = spread.percent_of_mid;
                    let transition = step(
                        &mut condition.spread,
                        value,
                        &self.config.spread,
                        Worse::Higher,
                    );
                    if let Some(t) = transition {
                        alerts.push(self.alert_for(
                            t,
                            AlertKind::SpreadWide,
                            condition.spread,
                            format!("spread {:.4}% of mid", value),
                            ctx.timestamp,
                        ));
                    }
                }
                None => condition.spread = MetricStatus::Unknown,
            }

            let near = self.near_liquidity(ctx);
            if let Some(t) = step(
                &mut condition.liquidity,
                near,
                &self.config.liquidity,
                Worse::Lower,
            ) {
                alerts.push(self.alert_for(
                    t,
                    AlertKind::Illiquid,
                    condition.liquidity,
                    format!(
                        "liquidity {} within {}% of mid",
                        near, self.config.liquidity_band
                    ),
                    ctx.timestamp,
                ));
            }

            if let Some(t) = step(
                &mut condition.imbalance,
                ctx.imbalance.abs(),
                &self.config.imbalance,
                Worse::Higher,
            ) {
                alerts.push(self.alert_for(
                    t,
                    AlertKind::Imbalanced,
                    condition.imbalance,
                    format!("book imbalance {:.1}", ctx.imbalance),
                    ctx.timestamp,
                ));
            }
        }

        for alert in &alerts {
            info!(kind = ?alert.kind, severity = ?alert.severity, "{}", alert.message);
            self.subscribers.notify(alert);
        }
    }

    fn alert_for(
        &self,
        transition: Transition,
        kind: AlertKind,
        status: MetricStatus,
        detail: String,
        timestamp: DateTime<Utc>,
    ) -> LiquidityAlert {
        match transition {
            Transition::Warn | Transition::Escalate => LiquidityAlert {
                kind,
                severity: if status == MetricStatus::Critical {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::Warning
                },
                message: detail,
                timestamp,
            },
            Transition::Recover => LiquidityAlert {
                kind: AlertKind::Recovered,
                severity: AlertSeverity::Warning,
                message: format!("recovered: {}", detail),
                timestamp,
            },
        }
    }

    /// Size within the configured band, from the context's band table.
    fn near_liquidity(&self, ctx: &MarketContext) -> Decimal {
        ctx.liquidity
            .bands
            .iter()
            .find(|b| b.band_pct == self.config.liquidity_band)
            .map(|b| b.total())
            .unwrap_or_else(|| ctx.liquidity.near_total())
    }

    /// Feed this analyzer from the provider's context stream.
    pub fn attach_to(self: &Arc<Self>, provider: &PriceProvider) -> SubscriptionId {
        let analyzer = Arc::clone(self);
        provider.subscribe(move |ctx: &MarketContext| analyzer.observe(ctx))
    }

    pub fn subscribe_to_alerts<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&LiquidityAlert) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn current_condition(&self) -> MarketCondition {
        *self.condition.read()
    }

    /// 0-100 health score, a weighted blend of spread tightness, near
    /// liquidity and balance. Zero while no mid-price exists.
    pub fn market_quality(&self) -> Decimal {
        let ctx = self.provider.market_context();
        let spread_pct = match (&ctx.spread, ctx.mid_price) {
            (Some(spread), Some(_)) => spread.percent_of_mid,
            _ => return Decimal::ZERO,
        };

        let spread_score = score_down(spread_pct, self.config.spread.critical);
        let depth_score = (self.near_liquidity(&ctx) / self.config.liquidity.recovery)
            .min(Decimal::ONE)
            * dec!(100);
        let imbalance_score = score_down(ctx.imbalance.abs(), self.config.imbalance.critical);

        let weights = &self.config.weights;
        let quality = spread_score * weights.spread
            + depth_score * weights.depth
            + imbalance_score * weights.imbalance;
        quality.max(Decimal::ZERO).min(dec!(100))
    }

    /// Whether a hypothetical order of `size` could execute acceptably
    /// right now, with the failing reason when it could not.
    pub fn can_execute(&self, side: OrderSide, size: Decimal) -> Result<CanExecute> {
        if size <= Decimal::ZERO {
            return Err(MarketError::InvalidSize { size });
        }

        let estimate = self.provider.estimate_execution(side, size)?;
        if !estimate.can_fill {
            return Ok(CanExecute::No {
                reason: format!(
                    "insufficient depth: {} of {} unfilled",
                    estimate.shortfall, size
                ),
            });
        }
        if estimate.slippage_bps > self.config.max_slippage_bps {
            return Ok(CanExecute::No {
                reason: format!(
                    "estimated slippage {:.1} bps exceeds limit {} bps",
                    estimate.slippage_bps, self.config.max_slippage_bps
                ),
            });
        }
        if self.current_condition().any_critical() {
            return Ok(CanExecute::No {
                reason: "critical market health alert active".to_string(),
            });
        }
        Ok(CanExecute::Yes)
    }
}

/// 100 at zero, falling linearly to 0 at `ceiling`.
fn score_down(value: Decimal, ceiling: Decimal) -> Decimal {
    if ceiling <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (Decimal::ONE - (value / ceiling).min(Decimal::ONE)) * dec!(100)
}
