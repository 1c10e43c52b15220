//! Per-cell value screening.
//!
//! Ordinary columns take the fast path: a case-insensitive substring scan for
//! a handful of high-confidence payloads plus a length cap. Columns whose name
//! is listed as critical (`query`, `sql`, `command`, ...) additionally run the
//! strict regex set. Rejections never abort anything; they are returned to the
//! caller and appended to an in-memory security event log.

use std::{collections::HashSet, sync::Mutex};

use chrono::{DateTime, Utc};
use log::warn;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ConfigError;

pub const DEFAULT_MAX_VALUE_LENGTH: usize = 5000;
const EVENT_VALUE_PREVIEW: usize = 100;
const RECENT_EVENTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrictPattern {
    pub pattern: String,
    pub label: String,
}

impl StrictPattern {
    fn new(pattern: &str, label: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            label: label.to_string(),
        }
    }
}

/// Sanitizer configuration; all matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizerPolicy {
    #[serde(alias = "criticalFields")]
    pub critical_fields: Vec<String>,
    #[serde(alias = "quickPatterns")]
    pub quick_patterns: Vec<String>,
    #[serde(alias = "strictPatterns")]
    pub strict_patterns: Vec<StrictPattern>,
    #[serde(alias = "maxValueLength")]
    pub max_value_length: usize,
}

impl Default for SanitizerPolicy {
    fn default() -> Self {
        Self {
            critical_fields: ["query", "sql", "command", "script", "code"]
                .iter()
                .map(|f| f.to_string())
                .collect(),
            quick_patterns: [
                "<script",
                "javascript:",
                "; drop table",
                "; delete from",
                "; truncate",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            strict_patterns: vec![
                StrictPattern::new(r";\s*(drop|delete|truncate|alter)\b", "destructive_statement"),
                StrictPattern::new(r"\bunion\s+(all\s+)?select\b", "union_select"),
                StrictPattern::new(r";\s*--", "sql_comment"),
                StrictPattern::new(r"\bupdate\s+\S+\s+set\b", "update_set"),
                StrictPattern::new(r"\b(exec|eval)\s*\(", "code_execution"),
            ],
            max_value_length: DEFAULT_MAX_VALUE_LENGTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SanitizerRejection {
    #[error("value length {length} exceeds the {limit} character limit")]
    TooLong { length: usize, limit: usize },
    #[error("value contains dangerous content '{pattern}'")]
    DangerousContent { pattern: String },
    #[error("value matches strict pattern '{label}'")]
    StrictPattern { label: String },
}

impl SanitizerRejection {
    fn pattern(&self) -> String {
        match self {
            SanitizerRejection::TooLong { .. } => "max_length".to_string(),
            SanitizerRejection::DangerousContent { pattern } => pattern.clone(),
            SanitizerRejection::StrictPattern { label } => label.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    OversizedValue,
    InjectionAttempt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: SecurityEventKind,
    pub field: String,
    /// First 100 characters of the rejected value.
    pub value: String,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecuritySummary {
    pub total_events: usize,
    pub blocked_attempts: usize,
    pub recent_events: Vec<SecurityEvent>,
}

#[derive(Debug)]
pub struct Sanitizer {
    critical_fields: HashSet<String>,
    quick_patterns: Vec<String>,
    strict_patterns: Vec<(Regex, String)>,
    max_value_length: usize,
    events: Mutex<Vec<SecurityEvent>>,
}

impl Sanitizer {
    pub fn new(policy: &SanitizerPolicy) -> Result<Self, ConfigError> {
        if policy.max_value_length == 0 {
            return Err(ConfigError::ZeroValueLength);
        }
        let strict_patterns = policy
            .strict_patterns
            .iter()
            .map(|strict| {
                RegexBuilder::new(&strict.pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|regex| (regex, strict.label.clone()))
                    .map_err(|source| ConfigError::Pattern {
                        label: strict.label.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            critical_fields: policy
                .critical_fields
                .iter()
                .map(|f| f.trim().to_lowercase())
                .collect(),
            quick_patterns: policy
                .quick_patterns
                .iter()
                .filter(|p| !p.is_empty())
                .map(|p| p.to_lowercase())
                .collect(),
            strict_patterns,
            max_value_length: policy.max_value_length,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn is_critical(&self, column: &str) -> bool {
        self.critical_fields.contains(&column.trim().to_lowercase())
    }

    /// Accepts or rejects `value` for `column`. Rejections are recorded as
    /// security events before being returned.
    pub fn check(&self, column: &str, value: &str) -> Result<(), SanitizerRejection> {
        let outcome = self.evaluate(column, value);
        if let Err(rejection) = &outcome {
            self.record(column, value, rejection);
        }
        outcome
    }

    fn evaluate(&self, column: &str, value: &str) -> Result<(), SanitizerRejection> {
        let length = value.chars().count();
        if length > self.max_value_length {
            return Err(SanitizerRejection::TooLong {
                length,
                limit: self.max_value_length,
            });
        }
        let lowered = value.to_lowercase();
        if let Some(pattern) = self.quick_patterns.iter().find(|p| lowered.contains(p.as_str())) {
            return Err(SanitizerRejection::DangerousContent {
                pattern: pattern.clone(),
            });
        }
        if self.is_critical(column) {
            if let Some((_, label)) = self.strict_patterns.iter().find(|(re, _)| re.is_match(value)) {
                return Err(SanitizerRejection::StrictPattern {
                    label: label.clone(),
                });
            }
        }
        Ok(())
    }

    fn record(&self, column: &str, value: &str, rejection: &SanitizerRejection) {
        let kind = match rejection {
            SanitizerRejection::TooLong { .. } => SecurityEventKind::OversizedValue,
            _ => SecurityEventKind::InjectionAttempt,
        };
        let event = SecurityEvent {
            timestamp: Utc::now(),
            kind,
            field: column.to_string(),
            value: value.chars().take(EVENT_VALUE_PREVIEW).collect(),
            pattern: rejection.pattern(),
        };
        warn!(
            "Security event: {:?} in field '{}' ({}): {:?}",
            event.kind, event.field, event.pattern, event.value
        );
        // A poisoned log still holds every event appended before the panic.
        let mut events = self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push(event);
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn summary(&self) -> SecuritySummary {
        let events = self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        SecuritySummary {
            total_events: events.len(),
            blocked_attempts: events
                .iter()
                .filter(|e| e.kind == SecurityEventKind::InjectionAttempt)
                .count(),
            recent_events: events[events.len().saturating_sub(RECENT_EVENTS)..].to_vec(),
        }
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}
