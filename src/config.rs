//! Configuration management
//!
//! All policy lives here: sequencing mode, depth caps, liquidity bands,
//! reference trade sizes, candle granularities, and every analyzer
//! threshold. Mechanism stays in the component modules; numbers stay in
//! configuration.

use crate::error::{MarketError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How `apply_delta` treats sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencePolicy {
    /// Deltas must arrive exactly in order (`current + 1`); a gap rejects
    /// the delta and the caller is expected to resync with a snapshot.
    Strict,
    /// Any forward jump is accepted; only stale/duplicate sequence numbers
    /// are discarded.
    GapTolerant,
}

/// Order book state configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BookConfig {
    /// Sequence-number handling for deltas
    pub sequence_policy: SequencePolicy,
    /// Maximum retained levels per side; worst levels beyond this are trimmed
    pub max_depth: usize,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            sequence_policy: SequencePolicy::GapTolerant,
            max_depth: 100,
        }
    }
}

/// Reference order sizes used for the execution estimates embedded in
/// every market context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceSizes {
    pub small: Decimal,
    pub medium: Decimal,
    pub large: Decimal,
}

impl Default for ReferenceSizes {
    fn default() -> Self {
        Self {
            small: dec!(0.1),
            medium: dec!(1),
            large: dec!(10),
        }
    }
}

/// Price derivation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceConfig {
    /// Percentage bands from mid for liquidity-at-distance (0.1 = 0.1%)
    pub liquidity_bands: Vec<Decimal>,
    /// Reference sizes for the small/medium/large context estimates
    pub reference_sizes: ReferenceSizes,
    /// Levels per side considered for the imbalance score
    pub imbalance_depth: usize,
    /// Spread (% of mid) above which the context is flagged unhealthy
    pub healthy_max_spread_pct: Decimal,
    /// Minimum combined size inside the tightest band for a healthy context
    pub healthy_min_liquidity: Decimal,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            liquidity_bands: vec![dec!(0.1), dec!(0.5), dec!(1.0)],
            reference_sizes: ReferenceSizes::default(),
            imbalance_depth: 50,
            healthy_max_spread_pct: dec!(0.10),
            healthy_min_liquidity: dec!(0.2),
        }
    }
}

/// Candle aggregation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CandleConfig {
    /// Bucket granularities in seconds, one aggregator per entry
    pub granularities: Vec<i64>,
    /// Synthesize flat candles for buckets that saw no update. Off by
    /// default: skipped buckets are simply absent from the output.
    pub emit_gap_fill: bool,
}

impl Default for CandleConfig {
    fn default() -> Self {
        Self {
            granularities: vec![60, 300, 3600],
            emit_gap_fill: false,
        }
    }
}

/// Execution simulator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Maximum retained execution records for statistics
    pub history_limit: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { history_limit: 256 }
    }
}

/// Warning / critical / recovery levels for one monitored metric.
///
/// `warning` enters the alert state, `critical` escalates it, and the
/// metric must pass `recovery` before the alert clears. The gap between
/// `warning` and `recovery` is the hysteresis band that prevents flapping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub warning: Decimal,
    pub critical: Decimal,
    pub recovery: Decimal,
}

/// Weights for the 0-100 market quality score. Must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub spread: Decimal,
    pub depth: Decimal,
    pub imbalance: Decimal,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            spread: dec!(0.4),
            depth: dec!(0.4),
            imbalance: dec!(0.2),
        }
    }
}

/// Liquidity analyzer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Spread thresholds in percent of mid (higher is worse)
    pub spread: AlertThresholds,
    /// Near-mid liquidity thresholds in size units (lower is worse)
    pub liquidity: AlertThresholds,
    /// Absolute imbalance thresholds on the [-100, 100] score (higher is worse)
    pub imbalance: AlertThresholds,
    /// Band (% from mid) used for the near-liquidity check
    pub liquidity_band: Decimal,
    /// Slippage ceiling for `can_execute`, in basis points
    pub max_slippage_bps: Decimal,
    /// Weights for the market quality score
    pub weights: QualityWeights,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            spread: AlertThresholds {
                warning: dec!(0.10),
                critical: dec!(0.25),
                recovery: dec!(0.08),
            },
            liquidity: AlertThresholds {
                warning: dec!(0.2),
                critical: dec!(0.1),
                recovery: dec!(0.3),
            },
            imbalance: AlertThresholds {
                warning: dec!(30),
                critical: dec!(60),
                recovery: dec!(25),
            },
            liquidity_band: dec!(0.5),
            max_slippage_bps: dec!(50),
            weights: QualityWeights::default(),
        }
    }
}

impl AnalyzerConfig {
    /// Check threshold ordering and weight sums.
    pub fn validate(&self) -> Result<()> {
        // Higher-is-worse metrics: recovery < warning < critical.
        for (name, t) in [("spread", &self.spread), ("imbalance", &self.imbalance)] {
            if !(t.recovery < t.warning && t.warning < t.critical) {
                return Err(MarketError::InvalidConfig(format!(
                    "{} thresholds must satisfy recovery < warning < critical",
                    name
                )));
            }
        }
        // Lower-is-worse: critical < warning < recovery.
        let t = &self.liquidity;
        if !(t.critical < t.warning && t.warning < t.recovery) {
            return Err(MarketError::InvalidConfig(
                "liquidity thresholds must satisfy critical < warning < recovery".to_string(),
            ));
        }
        let sum = self.weights.spread + self.weights.depth + self.weights.imbalance;
        if sum != Decimal::ONE {
            return Err(MarketError::InvalidConfig(format!(
                "quality weights must sum to 1, got {}",
                sum
            )));
        }
        if self.liquidity_band <= Decimal::ZERO {
            return Err(MarketError::InvalidConfig(
                "liquidity_band must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub book: BookConfig,
    pub price: PriceConfig,
    pub candles: CandleConfig,
    pub sim: SimConfig,
    pub analyzer: AnalyzerConfig,
}

impl PipelineConfig {
    /// Load configuration from file, with environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("MARKETPIPE").separator("__"))
            .build()?;

        let cfg: PipelineConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from default locations, falling back to built-in defaults.
    pub fn load_default() -> anyhow::Result<Self> {
        let paths = ["marketpipe.toml", "~/.config/marketpipe/config.toml"];

        for path in paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::load(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Validate all sections that carry invariants.
    pub fn validate(&self) -> Result<()> {
        self.analyzer.validate()?;
        if self.candles.granularities.is_empty() {
            return Err(MarketError::InvalidConfig(
                "at least one candle granularity is required".to_string(),
            ));
        }
        if self.candles.granularities.iter().any(|g| *g <= 0) {
            return Err(MarketError::InvalidConfig(
                "candle granularities must be positive".to_string(),
            ));
        }
        if self.price.liquidity_bands.is_empty() {
            return Err(MarketError::InvalidConfig(
                "at least one liquidity band is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = PipelineConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_bad_weights_rejected() {
        let mut cfg = AnalyzerConfig::default();
        cfg.weights.spread = dec!(0.9);
        assert!(matches!(
            cfg.validate(),
            Err(MarketError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_hysteresis_ordering_enforced() {
        let mut cfg = AnalyzerConfig::default();
        // Recovery above warning removes the hysteresis band.
        cfg.spread.recovery = dec!(0.15);
        assert!(cfg.validate().is_err());

        let mut cfg = AnalyzerConfig::default();
        cfg.liquidity.recovery = dec!(0.05);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_empty_granularities_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.candles.granularities.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_toml() {
        let cfg: PipelineConfig = toml::from_str(
            r#"
            [book]
            sequence_policy = "strict"
            max_depth = 50

            [candles]
            granularities = [60]
            "#,
        )
        .unwrap();

        assert_eq!(cfg.book.sequence_policy, SequencePolicy::Strict);
        assert_eq!(cfg.book.max_depth, 50);
        assert_eq!(cfg.candles.granularities, vec![60]);
        // Untouched sections keep defaults.
        assert_eq!(cfg.sim.history_limit, 256);
    }
}
