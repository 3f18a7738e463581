//! Safety checks for oracle decisions
//!
//! The oracle's proposed action is never trusted on its own. Before an order
//! goes out, the decision is checked against the live indicator snapshot and
//! the wider market context; any failed rule downgrades the action to HOLD.
//!
//! Rules run in a fixed order and stop at the first failure, so the reported
//! reason always names the earliest rule that fired.

use crate::config::ValidatorConfig;
use crate::domain::{Action, ConfidenceLevel, Decision, DivergenceType, Indicators, MarketConditions, MarketRisk};
use serde::Serialize;
use std::fmt::Write;

/// RSI above this contradicts a buy
pub const RSI_OVERBOUGHT: f64 = 70.0;
/// RSI below this contradicts a sell
pub const RSI_OVERSOLD: f64 = 30.0;
/// ATR as % of price above which buys are refused
pub const MAX_BUY_ATR_PERCENT: f64 = 6.0;
/// Fakeout guard: minimum relative volume for a buy breakout
pub const FAKEOUT_MIN_VOLUME_RATIO: f64 = 1.5;
/// Fakeout guard: minimum trend strength for a buy breakout
pub const FAKEOUT_MIN_ADX: f64 = 20.0;

/// The rule that rejected a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    RsiContradiction,
    Volatility,
    MarketEnvironment,
    Fakeout,
    TrendFilter,
    ConfidenceFloor,
}

impl std::fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationRule::RsiContradiction => write!(f, "rsi_contradiction"),
            ValidationRule::Volatility => write!(f, "volatility"),
            ValidationRule::MarketEnvironment => write!(f, "market_environment"),
            ValidationRule::Fakeout => write!(f, "fakeout"),
            ValidationRule::TrendFilter => write!(f, "trend_filter"),
            ValidationRule::ConfidenceFloor => write!(f, "confidence_floor"),
        }
    }
}

/// Verdict on one decision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: String,
    /// Action to use instead of the oracle's, when the decision was rejected
    pub override_action: Option<Action>,
    pub rule: Option<ValidationRule>,
}

impl ValidationResult {
    fn passed(reason: &str) -> Self {
        Self {
            valid: true,
            reason: reason.to_string(),
            override_action: None,
            rule: None,
        }
    }

    fn rejected(rule: ValidationRule, reason: String) -> Self {
        Self {
            valid: false,
            reason,
            override_action: Some(Action::Hold),
            rule: Some(rule),
        }
    }
}

/// Rule engine over (decision, indicators, market conditions).
///
/// Holds only thresholds; `validate` has no side effects.
#[derive(Debug, Clone, Default)]
pub struct DecisionValidator {
    config: ValidatorConfig,
}

impl DecisionValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Check a decision. HOLD always passes untouched.
    pub fn validate(
        &self,
        decision: &Decision,
        indicators: &Indicators,
        conditions: Option<&MarketConditions>,
    ) -> ValidationResult {
        if decision.action == Action::Hold {
            return ValidationResult::passed("hold requires no validation");
        }

        check_rsi(decision.action, indicators)
            .or_else(|| check_volatility(decision.action, indicators))
            .or_else(|| conditions.and_then(|c| check_market_environment(decision.action, c)))
            .or_else(|| check_fakeout(decision.action, indicators))
            .or_else(|| self.check_trend_filter(decision.action, indicators))
            .or_else(|| check_confidence(decision))
            .unwrap_or_else(|| ValidationResult::passed("validation passed"))
    }

    /// The decision to act on: the original, or a HOLD that remembers it
    pub fn apply(&self, decision: &Decision, result: &ValidationResult) -> Decision {
        match result.override_action {
            Some(action) if action != decision.action => decision.overridden_to(action, &result.reason),
            _ => decision.clone(),
        }
    }

    fn check_trend_filter(&self, action: Action, ind: &Indicators) -> Option<ValidationResult> {
        if action != Action::Buy {
            return None;
        }

        let mut failed = Vec::new();
        if ind.adx() < self.config.min_adx {
            failed.push(format!("adx {:.1} < {:.1}", ind.adx(), self.config.min_adx));
        }
        if ind.volume_ratio() < self.config.min_volume_ratio {
            failed.push(format!(
                "volume_ratio {:.2} < {:.2}",
                ind.volume_ratio(),
                self.config.min_volume_ratio
            ));
        }
        if ind.bb_width_pct() < self.config.min_bb_width_pct {
            failed.push(format!(
                "bb_width_pct {:.2} < {:.2}",
                ind.bb_width_pct(),
                self.config.min_bb_width_pct
            ));
        }

        if failed.is_empty() {
            None
        } else {
            Some(ValidationResult::rejected(
                ValidationRule::TrendFilter,
                format!("trend filter failed: {}", failed.join(", ")),
            ))
        }
    }
}

fn check_rsi(action: Action, ind: &Indicators) -> Option<ValidationResult> {
    let rsi = ind.rsi();
    match action {
        Action::Buy if rsi > RSI_OVERBOUGHT => Some(ValidationResult::rejected(
            ValidationRule::RsiContradiction,
            format!("RSI overbought ({:.1} > {:.0}) contradicts buy", rsi, RSI_OVERBOUGHT),
        )),
        Action::Sell if rsi < RSI_OVERSOLD => Some(ValidationResult::rejected(
            ValidationRule::RsiContradiction,
            format!("RSI oversold ({:.1} < {:.0}) contradicts sell", rsi, RSI_OVERSOLD),
        )),
        _ => None,
    }
}

fn check_volatility(action: Action, ind: &Indicators) -> Option<ValidationResult> {
    let atr = ind.atr_percent();
    if action == Action::Buy && atr > MAX_BUY_ATR_PERCENT {
        return Some(ValidationResult::rejected(
            ValidationRule::Volatility,
            format!(
                "volatility too high (atr_percent {:.2} > {:.1})",
                atr, MAX_BUY_ATR_PERCENT
            ),
        ));
    }
    None
}

fn check_market_environment(action: Action, conditions: &MarketConditions) -> Option<ValidationResult> {
    if action != Action::Buy {
        return None;
    }

    let reason = if conditions.market_risk() == MarketRisk::High {
        Some("market risk is high".to_string())
    } else if conditions.flash_crash_detected() {
        Some(match conditions.flash_crash_description() {
            Some(desc) => format!("flash crash detected: {}", desc),
            None => "flash crash detected".to_string(),
        })
    } else if conditions.divergence() == DivergenceType::BearishDivergence {
        Some("bearish RSI divergence".to_string())
    } else {
        None
    };

    reason.map(|r| {
        ValidationResult::rejected(
            ValidationRule::MarketEnvironment,
            format!("market environment unsafe for buy: {}", r),
        )
    })
}

fn check_fakeout(action: Action, ind: &Indicators) -> Option<ValidationResult> {
    if action != Action::Buy {
        return None;
    }

    let mut failed = Vec::new();
    if ind.volume_ratio() < FAKEOUT_MIN_VOLUME_RATIO {
        failed.push(format!(
            "volume_ratio {:.2} < {:.1}",
            ind.volume_ratio(),
            FAKEOUT_MIN_VOLUME_RATIO
        ));
    }
    if ind.adx() < FAKEOUT_MIN_ADX {
        failed.push(format!("adx {:.1} < {:.0}", ind.adx(), FAKEOUT_MIN_ADX));
    }

    if failed.is_empty() {
        None
    } else {
        Some(ValidationResult::rejected(
            ValidationRule::Fakeout,
            format!("possible fakeout: {}", failed.join(", ")),
        ))
    }
}

fn check_confidence(decision: &Decision) -> Option<ValidationResult> {
    if decision.action.is_trade() && decision.confidence.level() == ConfidenceLevel::Low {
        return Some(ValidationResult::rejected(
            ValidationRule::ConfidenceFloor,
            format!("confidence too low for {}", decision.action),
        ));
    }
    None
}

/// Audit text for one verdict: original decision, final decision and the
/// indicator values it was judged on.
pub fn generate_report(result: &ValidationResult, decision: &Decision, indicators: &Indicators) -> String {
    let final_action = result.override_action.unwrap_or(decision.action);
    let mut out = String::new();

    let _ = writeln!(out, "=== DECISION VALIDATION ===");
    let _ = writeln!(
        out,
        "Original: {} (confidence {}) - {}",
        decision.action.as_str().to_uppercase(),
        decision.confidence,
        decision.reason
    );
    let _ = writeln!(out, "Final:    {}", final_action.as_str().to_uppercase());
    let _ = writeln!(
        out,
        "Verdict:  {}{}",
        if result.valid { "PASSED" } else { "OVERRIDDEN" },
        result.rule.map(|r| format!(" [{}]", r)).unwrap_or_default()
    );
    let _ = writeln!(out, "Reason:   {}", result.reason);
    let _ = writeln!(out, "Indicators:");
    if indicators.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for (name, value) in indicators.iter() {
        let _ = writeln!(out, "  {:<14} {:.4}", name, value);
    }
    let _ = write!(out, "===========================");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{names, Confidence, FlashCrash, MarketCorrelation, RsiDivergence};

    fn decision(action: Action, confidence: ConfidenceLevel) -> Decision {
        Decision::new(action, Confidence::Level(confidence), "oracle says so")
    }

    /// Indicators that pass every buy rule under default thresholds
    fn healthy() -> Indicators {
        Indicators::new()
            .with(names::RSI, 55.0)
            .with(names::ATR_PERCENT, 2.5)
            .with(names::VOLUME_RATIO, 1.8)
            .with(names::ADX, 28.0)
            .with(names::BB_WIDTH_PCT, 3.5)
            .with(names::MACD, 0.4)
    }

    fn validator() -> DecisionValidator {
        DecisionValidator::default()
    }

    #[test]
    fn test_healthy_buy_passes() {
        let r = validator().validate(&decision(Action::Buy, ConfidenceLevel::High), &healthy(), None);
        assert!(r.valid);
        assert_eq!(r.reason, "validation passed");
        assert_eq!(r.override_action, None);
    }

    #[test]
    fn test_hold_always_passes() {
        let garbage = Indicators::new()
            .with(names::RSI, 99.0)
            .with(names::ATR_PERCENT, 40.0);
        let dangerous = MarketConditions {
            market_correlation: Some(MarketCorrelation {
                market_risk: MarketRisk::High,
                details: None,
            }),
            flash_crash: Some(FlashCrash {
                detected: true,
                description: None,
            }),
            rsi_divergence: None,
        };

        let r = validator().validate(
            &decision(Action::Hold, ConfidenceLevel::Low),
            &garbage,
            Some(&dangerous),
        );
        assert!(r.valid);
        assert!(r.rule.is_none());
    }

    #[test]
    fn test_rsi_rule_wins_over_volatility() {
        let ind = healthy()
            .with(names::RSI, 78.0)
            .with(names::ATR_PERCENT, 9.0);
        let r = validator().validate(&decision(Action::Buy, ConfidenceLevel::High), &ind, None);

        assert!(!r.valid);
        assert_eq!(r.rule, Some(ValidationRule::RsiContradiction));
        assert!(r.reason.contains("RSI overbought"));
        assert_eq!(r.override_action, Some(Action::Hold));
    }

    #[test]
    fn test_sell_into_oversold_rejected() {
        let ind = healthy().with(names::RSI, 22.0);
        let r = validator().validate(&decision(Action::Sell, ConfidenceLevel::High), &ind, None);
        assert_eq!(r.rule, Some(ValidationRule::RsiContradiction));
        assert!(r.reason.contains("oversold"));
    }

    #[test]
    fn test_sell_ignores_buy_only_rules() {
        let ind = Indicators::new()
            .with(names::RSI, 60.0)
            .with(names::ATR_PERCENT, 12.0);
        let r = validator().validate(&decision(Action::Sell, ConfidenceLevel::Medium), &ind, None);
        assert!(r.valid, "{}", r.reason);
    }

    #[test]
    fn test_high_volatility_blocks_buy() {
        let ind = healthy().with(names::ATR_PERCENT, 6.5);
        let r = validator().validate(&decision(Action::Buy, ConfidenceLevel::High), &ind, None);
        assert_eq!(r.rule, Some(ValidationRule::Volatility));
    }

    #[test]
    fn test_market_environment_only_when_supplied() {
        let conditions = MarketConditions {
            rsi_divergence: Some(RsiDivergence {
                kind: DivergenceType::BearishDivergence,
                description: None,
            }),
            ..Default::default()
        };
        let buy = decision(Action::Buy, ConfidenceLevel::High);

        let with = validator().validate(&buy, &healthy(), Some(&conditions));
        assert_eq!(with.rule, Some(ValidationRule::MarketEnvironment));
        assert!(with.reason.contains("bearish"));

        let without = validator().validate(&buy, &healthy(), None);
        assert!(without.valid);
    }

    #[test]
    fn test_flash_crash_description_in_reason() {
        let conditions = MarketConditions {
            flash_crash: Some(FlashCrash {
                detected: true,
                description: Some("BTC -7% in 3 candles".to_string()),
            }),
            ..Default::default()
        };
        let r = validator().validate(
            &decision(Action::Buy, ConfidenceLevel::High),
            &healthy(),
            Some(&conditions),
        );
        assert!(r.reason.contains("BTC -7% in 3 candles"));
    }

    #[test]
    fn test_fakeout_guard() {
        let ind = healthy().with(names::VOLUME_RATIO, 1.2);
        let r = validator().validate(&decision(Action::Buy, ConfidenceLevel::High), &ind, None);
        assert_eq!(r.rule, Some(ValidationRule::Fakeout));
        assert!(r.reason.contains("volume_ratio"));
    }

    #[test]
    fn test_trend_filter_names_every_failure() {
        let strict = DecisionValidator::new(ValidatorConfig {
            min_adx: 30.0,
            min_volume_ratio: 2.0,
            min_bb_width_pct: 4.0,
        });
        let r = strict.validate(&decision(Action::Buy, ConfidenceLevel::High), &healthy(), None);

        assert_eq!(r.rule, Some(ValidationRule::TrendFilter));
        assert!(r.reason.contains("adx"));
        assert!(r.reason.contains("volume_ratio"));
        assert!(r.reason.contains("bb_width_pct"));
    }

    #[test]
    fn test_low_confidence_blocks_trade() {
        let r = validator().validate(&decision(Action::Buy, ConfidenceLevel::Low), &healthy(), None);
        assert_eq!(r.rule, Some(ValidationRule::ConfidenceFloor));

        let scored = Decision::new(Action::Sell, Confidence::Score(15.0), "weak");
        let r = validator().validate(&scored, &healthy(), None);
        assert_eq!(r.rule, Some(ValidationRule::ConfidenceFloor));
    }

    #[test]
    fn test_missing_indicators_fail_buy() {
        let r = validator().validate(
            &decision(Action::Buy, ConfidenceLevel::High),
            &Indicators::new(),
            None,
        );
        assert_eq!(r.rule, Some(ValidationRule::Fakeout));
    }

    #[test]
    fn test_apply_override_records_original() {
        let v = validator();
        let original = decision(Action::Buy, ConfidenceLevel::High);
        let ind = healthy().with(names::RSI, 80.0);

        let r = v.validate(&original, &ind, None);
        let applied = v.apply(&original, &r);
        assert_eq!(applied.action, Action::Hold);
        assert_eq!(
            applied.overridden.as_ref().map(|o| o.original_reason.as_str()),
            Some("oracle says so")
        );

        let passed = v.validate(&original, &healthy(), None);
        assert_eq!(v.apply(&original, &passed), original);
    }

    #[test]
    fn test_report_contents() {
        let original = decision(Action::Buy, ConfidenceLevel::High);
        let ind = healthy().with(names::RSI, 80.0);
        let r = validator().validate(&original, &ind, None);

        let report = generate_report(&r, &original, &ind);
        assert!(report.contains("Original: BUY"));
        assert!(report.contains("Final:    HOLD"));
        assert!(report.contains("[rsi_contradiction]"));
        assert!(report.contains("rsi"));
        assert!(report.contains("80.0000"));
    }
}
