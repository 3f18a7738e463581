use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Indicator names the validator reads
pub mod names {
    pub const RSI: &str = "rsi";
    pub const ATR_PERCENT: &str = "atr_percent";
    pub const VOLUME_RATIO: &str = "volume_ratio";
    pub const ADX: &str = "adx";
    pub const BB_WIDTH_PCT: &str = "bb_width_pct";
    pub const MACD: &str = "macd";
}

/// Flat snapshot of named technical indicators for one candle.
///
/// Computed elsewhere and handed to the validator by value. Missing values
/// read as neutral for RSI and as zero for everything else, so an absent
/// volume or trend reading fails the buy-side filters instead of passing them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Indicators {
    values: BTreeMap<String, f64>,
}

impl Indicators {
    pub const NEUTRAL_RSI: f64 = 50.0;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_string(), value);
    }

    /// Raw lookup; NaN and infinities are treated as absent.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied().filter(|v| v.is_finite())
    }

    pub fn rsi(&self) -> f64 {
        self.get(names::RSI).unwrap_or(Self::NEUTRAL_RSI)
    }

    pub fn atr_percent(&self) -> f64 {
        self.get(names::ATR_PERCENT).unwrap_or(0.0)
    }

    pub fn volume_ratio(&self) -> f64 {
        self.get(names::VOLUME_RATIO).unwrap_or(0.0)
    }

    pub fn adx(&self) -> f64 {
        self.get(names::ADX).unwrap_or(0.0)
    }

    pub fn bb_width_pct(&self) -> f64 {
        self.get(names::BB_WIDTH_PCT).unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, f64)> for Indicators {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketRisk {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceType {
    #[default]
    None,
    BearishDivergence,
    BullishDivergence,
}

impl std::fmt::Display for DivergenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DivergenceType::None => write!(f, "none"),
            DivergenceType::BearishDivergence => write!(f, "bearish_divergence"),
            DivergenceType::BullishDivergence => write!(f, "bullish_divergence"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketCorrelation {
    #[serde(default)]
    pub market_risk: MarketRisk,
    /// Free-form correlation figures (e.g. BTC beta), kept for reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlashCrash {
    #[serde(default)]
    pub detected: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RsiDivergence {
    #[serde(rename = "type", default)]
    pub kind: DivergenceType,
    #[serde(default)]
    pub description: Option<String>,
}

/// Wider market context; every part is optional and defaults to "safe".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketConditions {
    #[serde(default)]
    pub market_correlation: Option<MarketCorrelation>,
    #[serde(default)]
    pub flash_crash: Option<FlashCrash>,
    #[serde(default)]
    pub rsi_divergence: Option<RsiDivergence>,
}

impl MarketConditions {
    pub fn market_risk(&self) -> MarketRisk {
        self.market_correlation
            .as_ref()
            .map(|c| c.market_risk)
            .unwrap_or_default()
    }

    pub fn flash_crash_detected(&self) -> bool {
        self.flash_crash.as_ref().is_some_and(|f| f.detected)
    }

    pub fn flash_crash_description(&self) -> Option<&str> {
        self.flash_crash
            .as_ref()
            .and_then(|f| f.description.as_deref())
    }

    pub fn divergence(&self) -> DivergenceType {
        self.rsi_divergence
            .as_ref()
            .map(|d| d.kind)
            .unwrap_or_default()
    }
}
