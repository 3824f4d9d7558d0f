use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

use crate::error::GuardError;

const HISTORY_CAPACITY: usize = 10;
const MAX_RATING_STREAK: usize = 5;
const REPETITION_MIN_WORDS: usize = 10;
const REPETITION_MIN_UNIQUE_RATIO: f64 = 0.3;
const REPEATED_CHAR_RUN: usize = 6;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub min_length: usize,
    pub max_length: usize,
    /// Regex the whole comment must match, if set.
    pub allowed_characters: Option<String>,
    pub forbidden_words: Vec<String>,
    pub min_rating: i32,
    pub max_rating: i32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_length: 3,
            max_length: 1000,
            allowed_characters: None,
            forbidden_words: vec!["spam".into(), "bot".into(), "automated".into()],
            min_rating: 1,
            max_rating: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn from_parts(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationStats {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub warning_count: usize,
    /// Percentage of valid results, 0 when there is no history.
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackInput {
    pub comment: String,
    pub rating: i32,
    #[serde(default)]
    pub area_id: Option<String>,
}

enum Detector {
    Pattern(Regex),
    Check(fn(&str) -> bool),
}

struct ContentRule {
    warning: &'static str,
    detector: Detector,
}

impl ContentRule {
    fn pattern(warning: &'static str, re: &str) -> Self {
        Self {
            warning,
            detector: Detector::Pattern(Regex::new(re).expect("Invalid content rule regex")),
        }
    }

    fn matches(&self, text: &str) -> bool {
        match &self.detector {
            Detector::Pattern(re) => re.is_match(text),
            Detector::Check(f) => f(text),
        }
    }
}

/// Independent heuristics; each contributes at most one warning per comment.
static CONTENT_RULES: Lazy<Vec<ContentRule>> = Lazy::new(|| {
    vec![
        ContentRule::pattern(
            "Comment mentions automation vocabulary",
            r"(?i)spam|bot|automated|script",
        ),
        ContentRule::pattern("Comment contains excessive capitalization", r"[A-Z]{5,}"),
        ContentRule::pattern(
            "Comment contains repeated special characters",
            r"[!@#$%^&*]{3,}",
        ),
        ContentRule::pattern("Comment contains a long run of digits", r"\d{10,}"),
        ContentRule {
            warning: "Comment contains a character repeated many times",
            detector: Detector::Check(|text| has_repeated_run(text, REPEATED_CHAR_RUN)),
        },
    ]
});

fn has_repeated_run(text: &str, threshold: usize) -> bool {
    let mut prev = None;
    let mut count = 0;

    for c in text.chars() {
        if Some(c) == prev {
            count += 1;
        } else {
            prev = Some(c);
            count = 1;
        }
        if count >= threshold {
            return true;
        }
    }

    false
}

/// Classifies comment/rating pairs and keeps the last few verdicts for
/// trend checks.
pub struct ContentValidator {
    config: ValidationConfig,
    allowed: Option<Regex>,
    history: VecDeque<ValidationResult>,
}

impl ContentValidator {
    pub fn new(config: ValidationConfig) -> Result<Self, GuardError> {
        let allowed = config
            .allowed_characters
            .as_deref()
            .map(|pattern| {
                Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                    GuardError::Config(format!("Invalid allowed_characters pattern: {}", e))
                })
            })
            .transpose()?;

        Ok(Self {
            config,
            allowed,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        })
    }

    pub fn validate_comment(&mut self, text: &str) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        self.check_comment(text, &mut errors, &mut warnings);

        let result = ValidationResult::from_parts(errors, warnings);
        self.record(result.clone());
        result
    }

    pub fn validate_rating(&mut self, rating: i32) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        self.check_rating(rating, &mut errors, &mut warnings);

        let result = ValidationResult::from_parts(errors, warnings);
        self.record(result.clone());
        result
    }

    /// Comment and rating checks plus the area requirement, recorded as a
    /// single history entry.
    pub fn validate_feedback(&mut self, input: &FeedbackInput) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        self.check_comment(&input.comment, &mut errors, &mut warnings);
        self.check_rating(input.rating, &mut errors, &mut warnings);

        let has_area = input
            .area_id
            .as_deref()
            .map_or(false, |id| !id.trim().is_empty());
        if !has_area {
            errors.push("Area ID is required".to_string());
        }

        let result = ValidationResult::from_parts(errors, warnings);
        self.record(result.clone());
        result
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn validation_stats(&self) -> ValidationStats {
        let total = self.history.len();
        let valid = self.history.iter().filter(|r| r.is_valid).count();
        let warning_count = self.history.iter().map(|r| r.warnings.len()).sum();
        let success_rate = if total == 0 {
            0.0
        } else {
            valid as f64 / total as f64 * 100.0
        };

        ValidationStats {
            total,
            valid,
            invalid: total - valid,
            warning_count,
            success_rate,
        }
    }

    fn check_comment(&self, text: &str, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
        let length = text.chars().count();
        if length < self.config.min_length {
            errors.push(format!(
                "Comment must be at least {} characters long",
                self.config.min_length
            ));
        }
        if length > self.config.max_length {
            errors.push(format!(
                "Comment must be no more than {} characters long",
                self.config.max_length
            ));
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.is_match(text) {
                errors.push("Comment contains invalid characters".to_string());
            }
        }

        let lower = text.to_lowercase();
        let flagged: Vec<&str> = self
            .config
            .forbidden_words
            .iter()
            .filter(|w| !w.is_empty() && lower.contains(&w.to_lowercase()))
            .map(String::as_str)
            .collect();
        if !flagged.is_empty() {
            warnings.push(format!("Comment contains flagged words: {}", flagged.join(", ")));
        }

        for rule in CONTENT_RULES.iter() {
            if rule.matches(text) {
                warnings.push(rule.warning.to_string());
            }
        }

        let words: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();
        if words.len() > REPETITION_MIN_WORDS {
            let unique: HashSet<&String> = words.iter().collect();
            let ratio = unique.len() as f64 / words.len() as f64;
            if ratio < REPETITION_MIN_UNIQUE_RATIO {
                warnings.push("Comment repeats the same words excessively".to_string());
            }
        }
    }

    fn check_rating(&self, rating: i32, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
        if rating < self.config.min_rating || rating > self.config.max_rating {
            errors.push(format!(
                "Rating must be between {} and {}",
                self.config.min_rating, self.config.max_rating
            ));
        }

        if rating == self.config.max_rating
            && self.history.len() >= MAX_RATING_STREAK
            && self.history.iter().rev().take(MAX_RATING_STREAK).all(|r| r.is_valid)
        {
            warnings.push("Multiple consecutive maximum ratings detected".to_string());
        }
    }

    fn record(&mut self, result: ValidationResult) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(result);
    }
}
