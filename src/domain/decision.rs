use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trading action proposed by the oracle or applied after validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "buy",
            Action::Sell => "sell",
            Action::Hold => "hold",
        }
    }

    /// Whether acting on this would place an order
    pub fn is_trade(&self) -> bool {
        !matches!(self, Action::Hold)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Action {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(Action::Buy),
            "sell" => Ok(Action::Sell),
            "hold" => Ok(Action::Hold),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// Coarse confidence bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfidenceLevel::Low => write!(f, "low"),
            ConfidenceLevel::Medium => write!(f, "medium"),
            ConfidenceLevel::High => write!(f, "high"),
        }
    }
}

/// Oracle confidence, either a bucket or a 0-100 score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Confidence {
    Level(ConfidenceLevel),
    Score(f64),
}

impl Confidence {
    /// Scores below this are treated as low confidence
    pub const LOW_SCORE_CEILING: f64 = 40.0;
    /// Scores at or above this are treated as high confidence
    pub const HIGH_SCORE_FLOOR: f64 = 70.0;

    /// Bucket a confidence value. Out-of-range or NaN scores count as low.
    pub fn level(&self) -> ConfidenceLevel {
        match *self {
            Confidence::Level(level) => level,
            Confidence::Score(score) => {
                if !score.is_finite() || !(0.0..=100.0).contains(&score) {
                    ConfidenceLevel::Low
                } else if score < Self::LOW_SCORE_CEILING {
                    ConfidenceLevel::Low
                } else if score < Self::HIGH_SCORE_FLOOR {
                    ConfidenceLevel::Medium
                } else {
                    ConfidenceLevel::High
                }
            }
        }
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Confidence::Level(ConfidenceLevel::Low)
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::Level(level) => write!(f, "{}", level),
            Confidence::Score(score) => write!(f, "{:.0} ({})", score, self.level()),
        }
    }
}

/// What the decision looked like before the validator replaced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub original_action: Action,
    pub original_reason: String,
    /// Validator message naming the rule that fired
    pub rule_reason: String,
    pub overridden_at: DateTime<Utc>,
}

/// A trading decision. Never mutated once produced; overriding builds a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub reason: String,
    /// Raw market payload the oracle reasoned over
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overridden: Option<OverrideRecord>,
}

impl Decision {
    pub fn new(action: Action, confidence: Confidence, reason: impl Into<String>) -> Self {
        Self {
            action,
            confidence,
            reason: reason.into(),
            market_data: None,
            overridden: None,
        }
    }

    /// Safe fallback used whenever a cycle cannot produce a decision
    pub fn hold(reason: impl Into<String>) -> Self {
        Self::new(Action::Hold, Confidence::default(), reason)
    }

    pub fn with_market_data(mut self, market_data: serde_json::Value) -> Self {
        self.market_data = Some(market_data);
        self
    }

    /// Build the replacement decision, keeping the original for audit.
    pub fn overridden_to(&self, action: Action, rule_reason: &str) -> Decision {
        Decision {
            action,
            confidence: self.confidence,
            reason: format!("validator override: {}", rule_reason),
            market_data: self.market_data.clone(),
            overridden: Some(OverrideRecord {
                original_action: self.action,
                original_reason: self.reason.clone(),
                rule_reason: rule_reason.to_string(),
                overridden_at: Utc::now(),
            }),
        }
    }

    pub fn is_overridden(&self) -> bool {
        self.overridden.is_some()
    }
}
