//! Suspicious-behavior scoring for a single feedback session.
//!
//! Four detectors run on every recorded action (typing speed, repeated
//! action names, inter-action timing, repeated payloads). Each hit adds a
//! fixed number of points to a 0-100 risk score which then decays with the
//! idle time since the previous action.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;

const ACTION_LOG_CAPACITY: usize = 64;
const INTERVAL_LOG_CAPACITY: usize = 2;
const PAYLOAD_LOG_CAPACITY: usize = 3;
const PAYLOAD_PREFIX_CHARS: usize = 50;
const MS_PER_MINUTE: f64 = 60_000.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    pub typing_chars_per_sec: f64,
    pub repeat_window_ms: u64,
    /// Prior occurrences needed before an action counts as repeated.
    pub repeat_threshold: usize,
    pub fast_action_ms: u64,
    pub regular_spread_ms: u64,
    pub rapid_typing_points: f64,
    pub repeated_action_points: f64,
    pub suspicious_timing_points: f64,
    pub pattern_repetition_points: f64,
    pub decay_per_minute: f64,
    pub suspicious_threshold: f64,
    pub history_size: usize,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            typing_chars_per_sec: 50.0,
            repeat_window_ms: 60_000,
            repeat_threshold: 3,
            fast_action_ms: 100,
            regular_spread_ms: 50,
            rapid_typing_points: 20.0,
            repeated_action_points: 15.0,
            suspicious_timing_points: 25.0,
            pattern_repetition_points: 20.0,
            decay_per_minute: 10.0,
            suspicious_threshold: 70.0,
            history_size: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    RapidTyping,
    RepeatedActions,
    SuspiciousTiming,
    PatternRepetition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorPattern {
    #[serde(rename = "type")]
    pub kind: PatternKind,
    pub confidence: f64,
    pub description: String,
    pub observed_at: u64,
}

/// Optional context attached to an action by the form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_elapsed_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorReport {
    pub is_suspicious: bool,
    pub risk_score: f64,
    pub patterns: Vec<BehaviorPattern>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score < 30.0 {
            RiskLevel::Low
        } else if score < 70.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorSummary {
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub action_count: u64,
    pub pattern_count: usize,
    pub last_action_at: Option<u64>,
    /// Times the score rose past the threshold from below.
    pub threshold_crossings: u64,
    pub recommendations: Vec<String>,
}

pub struct BehaviorTracker {
    config: BehaviorConfig,
    clock: Arc<dyn Clock>,
    patterns: VecDeque<BehaviorPattern>,
    risk_score: f64,
    is_suspicious: bool,
    last_action_at: Option<u64>,
    action_count: u64,
    threshold_crossings: u64,
    // Raw observations the detectors compare against
    recent_actions: VecDeque<(String, u64)>,
    recent_intervals: VecDeque<u64>,
    recent_payloads: VecDeque<String>,
}

impl BehaviorTracker {
    pub fn new(config: BehaviorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            patterns: VecDeque::with_capacity(config.history_size),
            config,
            clock,
            risk_score: 0.0,
            is_suspicious: false,
            last_action_at: None,
            action_count: 0,
            threshold_crossings: 0,
            recent_actions: VecDeque::new(),
            recent_intervals: VecDeque::with_capacity(INTERVAL_LOG_CAPACITY),
            recent_payloads: VecDeque::with_capacity(PAYLOAD_LOG_CAPACITY),
        }
    }

    pub fn record_action(&mut self, action: &str, data: Option<&ActionData>) -> BehaviorReport {
        let now = self.clock.now_ms();
        let was_suspicious = self.is_suspicious();
        let gap = self.last_action_at.map(|t| now.saturating_sub(t));
        let payload_prefix = data.and_then(payload_prefix);

        let detections: Vec<(BehaviorPattern, f64)> = [
            data.and_then(|d| self.detect_rapid_typing(d, now)),
            self.detect_repeated_action(action, now),
            gap.and_then(|g| self.detect_timing(g, now)),
            payload_prefix
                .as_deref()
                .and_then(|p| self.detect_payload_repetition(p, now)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let mut points = 0.0;
        for (pattern, score) in detections {
            debug!(
                action,
                kind = ?pattern.kind,
                confidence = pattern.confidence,
                "{}",
                pattern.description
            );
            points += score;
            self.push_pattern(pattern);
        }

        // Increment first, then decay by the idle time before this action
        let idle_minutes = gap.map_or(0.0, |g| g as f64 / MS_PER_MINUTE);
        let raised = (self.risk_score + points).min(100.0);
        self.risk_score = (raised - self.config.decay_per_minute * idle_minutes).clamp(0.0, 100.0);

        self.is_suspicious = self.risk_score > self.config.suspicious_threshold;
        if self.is_suspicious && !was_suspicious {
            self.threshold_crossings += 1;
            warn!(action, risk_score = self.risk_score, "Session crossed suspicious threshold");
        }

        self.remember(action, now, gap, payload_prefix);
        self.last_action_at = Some(now);
        self.action_count += 1;

        BehaviorReport {
            is_suspicious: self.is_suspicious,
            risk_score: self.risk_score,
            patterns: self.patterns.iter().cloned().collect(),
        }
    }

    pub fn reset_behavior(&mut self) {
        self.patterns.clear();
        self.risk_score = 0.0;
        self.is_suspicious = false;
        self.last_action_at = None;
        self.action_count = 0;
        self.threshold_crossings = 0;
        self.recent_actions.clear();
        self.recent_intervals.clear();
        self.recent_payloads.clear();
    }

    /// Risk score with the decay since the last action applied.
    pub fn current_risk_score(&self) -> f64 {
        match self.last_action_at {
            Some(last) => {
                let idle_minutes = self.clock.now_ms().saturating_sub(last) as f64 / MS_PER_MINUTE;
                (self.risk_score - self.config.decay_per_minute * idle_minutes).clamp(0.0, 100.0)
            }
            None => self.risk_score,
        }
    }

    pub fn is_suspicious(&self) -> bool {
        self.current_risk_score() > self.config.suspicious_threshold
    }

    pub fn behavior_summary(&self) -> BehaviorSummary {
        let risk_score = self.current_risk_score();
        let risk_level = RiskLevel::from_score(risk_score);
        let recommendations = if risk_level == RiskLevel::High {
            vec![
                "Require additional verification before accepting submissions".to_string(),
                "Slow down repeated submissions from this session".to_string(),
                "Review recent activity for automated input".to_string(),
            ]
        } else {
            Vec::new()
        };

        BehaviorSummary {
            risk_level,
            risk_score,
            action_count: self.action_count,
            pattern_count: self.patterns.len(),
            last_action_at: self.last_action_at,
            threshold_crossings: self.threshold_crossings,
            recommendations,
        }
    }

    pub fn patterns(&self) -> impl Iterator<Item = &BehaviorPattern> {
        self.patterns.iter()
    }

    fn detect_rapid_typing(&self, data: &ActionData, now: u64) -> Option<(BehaviorPattern, f64)> {
        let text = data.text.as_deref()?;
        let elapsed_ms = data.time_elapsed_ms.filter(|&ms| ms > 0)?;

        let rate = text.chars().count() as f64 / (elapsed_ms as f64 / 1000.0);
        if rate <= self.config.typing_chars_per_sec {
            return None;
        }

        Some((
            BehaviorPattern {
                kind: PatternKind::RapidTyping,
                confidence: (rate / 100.0).min(1.0),
                description: format!("Typing speed of {:.1} chars/sec", rate),
                observed_at: now,
            },
            self.config.rapid_typing_points,
        ))
    }

    fn detect_repeated_action(&self, action: &str, now: u64) -> Option<(BehaviorPattern, f64)> {
        let prior = self
            .recent_actions
            .iter()
            .filter(|(name, at)| name == action && now.saturating_sub(*at) < self.config.repeat_window_ms)
            .count();
        if prior < self.config.repeat_threshold {
            return None;
        }

        Some((
            BehaviorPattern {
                kind: PatternKind::RepeatedActions,
                confidence: (0.5 + 0.1 * prior as f64).min(1.0),
                description: format!(
                    "Action '{}' performed {} times within {}s",
                    action,
                    prior + 1,
                    self.config.repeat_window_ms / 1000
                ),
                observed_at: now,
            },
            self.config.repeated_action_points,
        ))
    }

    fn detect_timing(&self, gap: u64, now: u64) -> Option<(BehaviorPattern, f64)> {
        let (confidence, description) = if gap < self.config.fast_action_ms {
            (0.8, format!("Action {}ms after the previous one", gap))
        } else if self.recent_intervals.len() == INTERVAL_LOG_CAPACITY {
            let intervals = self.recent_intervals.iter().copied().chain(std::iter::once(gap));
            let (min, max) = intervals.fold((u64::MAX, 0), |(lo, hi), i| (lo.min(i), hi.max(i)));
            if max - min >= self.config.regular_spread_ms {
                return None;
            }
            (0.9, format!("Action intervals too regular: {}ms spread around {}ms", max - min, gap))
        } else {
            return None;
        };

        Some((
            BehaviorPattern {
                kind: PatternKind::SuspiciousTiming,
                confidence,
                description,
                observed_at: now,
            },
            self.config.suspicious_timing_points,
        ))
    }

    fn detect_payload_repetition(&self, prefix: &str, now: u64) -> Option<(BehaviorPattern, f64)> {
        if !self.recent_payloads.iter().any(|p| p == prefix) {
            return None;
        }

        Some((
            BehaviorPattern {
                kind: PatternKind::PatternRepetition,
                confidence: 0.7,
                description: format!("Repeated payload: {}", prefix),
                observed_at: now,
            },
            self.config.pattern_repetition_points,
        ))
    }

    fn push_pattern(&mut self, pattern: BehaviorPattern) {
        while self.patterns.len() >= self.config.history_size.max(1) {
            self.patterns.pop_front();
        }
        self.patterns.push_back(pattern);
    }

    fn remember(&mut self, action: &str, now: u64, gap: Option<u64>, payload_prefix: Option<String>) {
        let window = self.config.repeat_window_ms;
        self.recent_actions
            .retain(|(_, at)| now.saturating_sub(*at) < window);
        if self.recent_actions.len() == ACTION_LOG_CAPACITY {
            self.recent_actions.pop_front();
        }
        self.recent_actions.push_back((action.to_string(), now));

        if let Some(gap) = gap {
            if self.recent_intervals.len() == INTERVAL_LOG_CAPACITY {
                self.recent_intervals.pop_front();
            }
            self.recent_intervals.push_back(gap);
        }

        if let Some(prefix) = payload_prefix {
            if self.recent_payloads.len() == PAYLOAD_LOG_CAPACITY {
                self.recent_payloads.pop_front();
            }
            self.recent_payloads.push_back(prefix);
        }
    }
}

fn payload_prefix(data: &ActionData) -> Option<String> {
    serde_json::to_string(data)
        .ok()
        .map(|json| json.chars().take(PAYLOAD_PREFIX_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn tracker() -> (BehaviorTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000_000));
        (BehaviorTracker::new(BehaviorConfig::default(), clock.clone()), clock)
    }

    fn typed(text: &str, elapsed_ms: u64) -> ActionData {
        ActionData {
            text: Some(text.to_string()),
            time_elapsed_ms: Some(elapsed_ms),
            ..ActionData::default()
        }
    }

    #[test]
    fn test_first_action_is_clean() {
        let (mut t, _clock) = tracker();
        let report = t.record_action("focus", None);
        assert!(!report.is_suspicious);
        assert_eq!(report.risk_score, 0.0);
        assert!(report.patterns.is_empty());
        assert_eq!(t.behavior_summary().action_count, 1);
    }

    #[test]
    fn test_fast_second_action_flags_timing() {
        let (mut t, clock) = tracker();
        let before = t.record_action("submit", None).risk_score;
        clock.advance(40);
        let report = t.record_action("submit", None);

        assert!(report.risk_score - before >= 25.0 - 0.01);
        assert_eq!(report.patterns.len(), 1);
        assert_eq!(report.patterns[0].kind, PatternKind::SuspiciousTiming);
        assert_eq!(report.patterns[0].confidence, 0.8);
        assert!(report.patterns[0].description.contains("40ms"));
    }

    #[test]
    fn test_rapid_typing() {
        let (mut t, _clock) = tracker();
        // 150 chars in one second
        let report = t.record_action("type", Some(&typed(&"x".repeat(150), 1_000)));
        assert_eq!(report.risk_score, 20.0);
        assert_eq!(report.patterns[0].kind, PatternKind::RapidTyping);
        assert_eq!(report.patterns[0].confidence, 1.0);

        let (mut t, _clock) = tracker();
        let report = t.record_action("type", Some(&typed("hello there", 5_000)));
        assert!(report.patterns.is_empty());
    }

    #[test]
    fn test_rapid_typing_confidence_scales() {
        let (mut t, _clock) = tracker();
        let report = t.record_action("type", Some(&typed(&"x".repeat(60), 1_000)));
        let pattern = &report.patterns[0];
        assert!((pattern.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_fourth_repeat_within_window_flags() {
        let (mut t, clock) = tracker();
        let gaps = [0, 5_000, 13_000, 21_500];
        let mut last = None;
        for gap in gaps {
            clock.advance(gap);
            last = Some(t.record_action("rate_tap", None));
        }
        let report = last.unwrap();
        let kinds: Vec<PatternKind> = report.patterns.iter().map(|p| p.kind).collect();
        assert_eq!(kinds, vec![PatternKind::RepeatedActions]);
        assert!(report.patterns[0].description.contains("rate_tap"));
        assert!(report.patterns[0].description.contains("4 times"));
    }

    #[test]
    fn test_repeats_outside_window_do_not_count() {
        let (mut t, clock) = tracker();
        for _ in 0..4 {
            t.record_action("rate_tap", None);
            clock.advance(61_000 + 7_000);
        }
        assert!(t.patterns().all(|p| p.kind != PatternKind::RepeatedActions));
    }

    #[test]
    fn test_regular_intervals_flag_with_high_confidence() {
        let (mut t, clock) = tracker();
        t.record_action("a", None);
        clock.advance(500);
        t.record_action("b", None);
        clock.advance(510);
        t.record_action("c", None);
        clock.advance(490);
        let report = t.record_action("d", None);

        assert_eq!(report.patterns.len(), 1);
        assert_eq!(report.patterns[0].kind, PatternKind::SuspiciousTiming);
        assert_eq!(report.patterns[0].confidence, 0.9);
    }

    #[test]
    fn test_irregular_intervals_pass() {
        let (mut t, clock) = tracker();
        for (i, gap) in [0, 800, 2_300, 1_100].into_iter().enumerate() {
            clock.advance(gap);
            t.record_action(&format!("step-{}", i), None);
        }
        assert_eq!(t.patterns().count(), 0);
    }

    #[test]
    fn test_repeated_payload_prefix() {
        let (mut t, clock) = tracker();
        let mut data = ActionData::default();
        data.extra.insert("field".into(), serde_json::json!("comment"));

        t.record_action("change", Some(&data));
        clock.advance(2_000);
        t.record_action("blur", Some(&data));
        assert_eq!(
            t.patterns().map(|p| p.kind).collect::<Vec<_>>(),
            vec![PatternKind::PatternRepetition]
        );
    }

    #[test]
    fn test_payload_prefix_is_truncated() {
        let mut a = ActionData::default();
        a.extra.insert("note".into(), serde_json::json!(format!("{}-one", "x".repeat(80))));
        let mut b = ActionData::default();
        b.extra.insert("note".into(), serde_json::json!(format!("{}-two", "x".repeat(80))));
        assert_eq!(payload_prefix(&a), payload_prefix(&b));
        assert_eq!(payload_prefix(&a).unwrap().chars().count(), 50);
    }

    #[test]
    fn test_score_saturates_and_flags() {
        let (mut t, clock) = tracker();
        let data = typed(&"y".repeat(200), 1_000);
        let mut report = t.record_action("type", Some(&data));
        for _ in 0..6 {
            clock.advance(20);
            report = t.record_action("type", Some(&data));
        }
        assert!(report.is_suspicious);
        assert!(report.risk_score <= 100.0);
        assert!(report.risk_score > 99.0);
        assert!(report.patterns.len() <= 10);

        let summary = t.behavior_summary();
        assert_eq!(summary.risk_level, RiskLevel::High);
        assert_eq!(summary.recommendations.len(), 3);
        assert_eq!(summary.action_count, 7);
    }

    #[test]
    fn test_history_keeps_last_ten() {
        let (mut t, clock) = tracker();
        t.record_action("warmup", None);
        for i in 0..15 {
            clock.advance(10);
            t.record_action(&format!("tap-{}", i), None);
        }
        let patterns: Vec<_> = t.patterns().collect();
        assert_eq!(patterns.len(), 10);
        assert_eq!(patterns.last().unwrap().observed_at, clock.now_ms());
        assert_eq!(patterns.first().unwrap().observed_at, clock.now_ms() - 90);
    }

    #[test]
    fn test_summary_reflects_idle_decay() {
        let (mut t, clock) = tracker();
        t.risk_score = 80.0;
        t.last_action_at = Some(clock.now_ms());

        clock.advance(6 * 60_000);
        let summary = t.behavior_summary();
        assert!((summary.risk_score - 20.0).abs() < 1e-9);
        assert_eq!(summary.risk_level, RiskLevel::Low);
        assert!(summary.recommendations.is_empty());

        let report = t.record_action("return", None);
        assert!((report.risk_score - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_decay_clamps_at_zero() {
        let (mut t, clock) = tracker();
        t.risk_score = 30.0;
        t.last_action_at = Some(clock.now_ms());
        clock.advance(10 * 60_000);
        assert_eq!(t.current_risk_score(), 0.0);
        assert_eq!(t.record_action("return", None).risk_score, 0.0);
    }

    #[test]
    fn test_detection_after_long_idle_is_partly_decayed() {
        // Points land before the idle decay is subtracted, so a burst after a
        // long pause is absorbed by the pause.
        let (mut t, clock) = tracker();
        t.record_action("warmup", None);
        clock.advance(3 * 60_000);
        let report = t.record_action("type", Some(&typed(&"z".repeat(300), 1_000)));
        assert_eq!(report.patterns.len(), 1);
        assert!((report.risk_score - 0.0).abs() < 1e-9);

        let (mut t, clock) = tracker();
        t.record_action("warmup", None);
        clock.advance(60_000);
        let report = t.record_action("type", Some(&typed(&"z".repeat(300), 1_000)));
        assert!((report.risk_score - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_recrossing_after_decay_counts_again() {
        let (mut t, clock) = tracker();
        for _ in 0..4 {
            t.record_action("click", None);
        }
        assert!(t.is_suspicious());
        assert_eq!(t.behavior_summary().threshold_crossings, 1);

        // 90 decays to 65 over 2.5 idle minutes
        clock.advance(150_000);
        assert!(!t.is_suspicious());

        let report = t.record_action("type", Some(&typed(&"q".repeat(120), 1_000)));
        assert!(report.is_suspicious);
        assert!((report.risk_score - 75.0).abs() < 1e-9);
        assert_eq!(t.behavior_summary().threshold_crossings, 2);

        clock.advance(10);
        t.record_action("scroll", None);
        assert_eq!(t.behavior_summary().threshold_crossings, 2);
    }

    #[test]
    fn test_reset_clears_everything() {
        let (mut t, clock) = tracker();
        t.record_action("a", None);
        clock.advance(10);
        t.record_action("a", None);
        assert!(t.current_risk_score() > 0.0);

        t.reset_behavior();
        let summary = t.behavior_summary();
        assert_eq!(summary.risk_score, 0.0);
        assert_eq!(summary.action_count, 0);
        assert_eq!(summary.pattern_count, 0);
        assert_eq!(summary.last_action_at, None);
        assert_eq!(summary.threshold_crossings, 0);

        clock.advance(10);
        assert!(t.record_action("a", None).patterns.is_empty());
    }

    #[test]
    fn test_pattern_serializes_with_type_tag() {
        let pattern = BehaviorPattern {
            kind: PatternKind::SuspiciousTiming,
            confidence: 0.9,
            description: "x".into(),
            observed_at: 1,
        };
        let json = serde_json::to_string(&pattern).unwrap();
        assert!(json.contains("\"type\":\"suspicious_timing\""));
    }
}
