use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::behavior::{ActionData, BehaviorConfig, BehaviorReport, BehaviorSummary, BehaviorTracker};
use crate::clock::Clock;
use crate::error::GuardError;
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::validator::{ContentValidator, FeedbackInput, ValidationConfig, ValidationResult, ValidationStats};

const BEHAVIOR_WEIGHT: f64 = 0.5;
const INVALID_WEIGHT: f64 = 0.3;
const RATE_LIMIT_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub rate_limit: RateLimitConfig,
    pub validation: ValidationConfig,
    pub behavior: BehaviorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub remaining: u32,
    /// RFC 3339, UTC.
    pub reset_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityStatus {
    pub rate_limit: RateLimitStatus,
    pub validation: ValidationStats,
    pub behavior: BehaviorSummary,
    /// Advisory blend in roughly [0, 1]; not a probability.
    pub overall_risk: f64,
}

/// One rate limiter, content validator and behavior tracker per feedback form.
pub struct SecurityGuard {
    rate_limiter: RateLimiter,
    validator: ContentValidator,
    behavior: BehaviorTracker,
}

impl SecurityGuard {
    pub fn new(config: GuardConfig, clock: Arc<dyn Clock>) -> Result<Self, GuardError> {
        Ok(Self {
            rate_limiter: RateLimiter::new(&config.rate_limit, clock.clone()),
            validator: ContentValidator::new(config.validation)?,
            behavior: BehaviorTracker::new(config.behavior, clock),
        })
    }

    pub fn check_rate_limit(&mut self) -> bool {
        let allowed = self.rate_limiter.check_rate_limit();
        if !allowed {
            debug!(
                retry_after_ms = self.rate_limiter.retry_after_ms(),
                "Rate limit window exhausted"
            );
        }
        allowed
    }

    pub async fn wait_for_rate_limit(&mut self) {
        self.rate_limiter.wait_for_rate_limit().await
    }

    pub fn validate_comment(&mut self, text: &str) -> ValidationResult {
        self.validator.validate_comment(text)
    }

    pub fn validate_rating(&mut self, rating: i32) -> ValidationResult {
        self.validator.validate_rating(rating)
    }

    pub fn validate_feedback(&mut self, input: &FeedbackInput) -> ValidationResult {
        self.validator.validate_feedback(input)
    }

    pub fn record_action(&mut self, action: &str, data: Option<&ActionData>) -> BehaviorReport {
        self.behavior.record_action(action, data)
    }

    pub fn is_suspicious(&self) -> bool {
        self.behavior.is_suspicious()
    }

    pub fn risk_score(&self) -> f64 {
        self.behavior.current_risk_score()
    }

    pub fn retry_after_ms(&self) -> u64 {
        self.rate_limiter.retry_after_ms()
    }

    pub fn security_status(&self) -> SecurityStatus {
        let allowed = self.rate_limiter.would_allow();
        let validation = self.validator.validation_stats();
        let behavior = self.behavior.behavior_summary();

        let invalid_ratio = if validation.total == 0 {
            0.0
        } else {
            validation.invalid as f64 / validation.total as f64
        };
        let rate_penalty = if allowed { 0.0 } else { 1.0 };
        let overall_risk = BEHAVIOR_WEIGHT * (behavior.risk_score / 100.0)
            + INVALID_WEIGHT * invalid_ratio
            + RATE_LIMIT_WEIGHT * rate_penalty;

        SecurityStatus {
            rate_limit: RateLimitStatus {
                allowed,
                remaining: self.rate_limiter.remaining(),
                reset_at: format_timestamp(self.rate_limiter.reset_at()),
            },
            validation,
            behavior,
            overall_risk,
        }
    }

    pub fn reset_security(&mut self) {
        self.rate_limiter.reset_rate_limit();
        self.validator.clear_history();
        self.behavior.reset_behavior();
    }
}

fn format_timestamp(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::RiskLevel;
    use crate::clock::ManualClock;

    fn guard(max_requests: u32) -> (SecurityGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let config = GuardConfig {
            rate_limit: RateLimitConfig {
                max_requests,
                time_window_ms: 1_000,
            },
            ..GuardConfig::default()
        };
        (SecurityGuard::new(config, clock.clone()).unwrap(), clock)
    }

    #[test]
    fn test_fresh_status_is_quiet() {
        let (g, _clock) = guard(3);
        let status = g.security_status();
        assert!(status.rate_limit.allowed);
        assert_eq!(status.rate_limit.remaining, 3);
        assert_eq!(status.rate_limit.reset_at, "1970-01-01T00:00:02.000Z");
        assert_eq!(status.validation.total, 0);
        assert_eq!(status.behavior.risk_level, RiskLevel::Low);
        assert_eq!(status.overall_risk, 0.0);
    }

    #[test]
    fn test_overall_risk_blends_components() {
        let (mut g, _clock) = guard(1);
        assert!(g.check_rate_limit());
        assert!(!g.check_rate_limit());

        g.validate_comment("");
        g.validate_comment("fine comment");

        let status = g.security_status();
        assert!(!status.rate_limit.allowed);
        // 0.3 * 0.5 invalid + 0.2 rate limited
        assert!((status.overall_risk - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_behavior_feeds_overall_risk() {
        let (mut g, clock) = guard(10);
        g.record_action("submit", None);
        clock.advance(10);
        g.record_action("submit", None);

        assert!(g.risk_score() > 24.9);
        assert!(!g.is_suspicious());
        let status = g.security_status();
        assert!((status.overall_risk - 0.5 * status.behavior.risk_score / 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_security_resets_all_components() {
        let (mut g, clock) = guard(1);
        g.check_rate_limit();
        g.validate_rating(0);
        g.record_action("a", None);
        clock.advance(5);
        g.record_action("a", None);

        g.reset_security();
        let status = g.security_status();
        assert!(status.rate_limit.allowed);
        assert_eq!(status.rate_limit.remaining, 1);
        assert_eq!(status.validation.total, 0);
        assert_eq!(status.behavior.action_count, 0);
        assert_eq!(status.overall_risk, 0.0);
    }

    #[test]
    fn test_feedback_through_guard() {
        let (mut g, _clock) = guard(5);
        let result = g.validate_feedback(&FeedbackInput {
            comment: "Lovely patio".into(),
            rating: 5,
            area_id: Some("patio".into()),
        });
        assert!(result.is_valid);
        assert!(!g.validate_rating(6).is_valid);
        assert_eq!(g.security_status().validation.invalid, 1);
    }

    #[test]
    fn test_invalid_allowed_pattern_rejected() {
        let config = GuardConfig {
            validation: ValidationConfig {
                allowed_characters: Some("(".into()),
                ..ValidationConfig::default()
            },
            ..GuardConfig::default()
        };
        assert!(SecurityGuard::new(config, Arc::new(ManualClock::new(0))).is_err());
    }
}
