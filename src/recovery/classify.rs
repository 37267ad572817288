//! Rule tables for failure classification and the severity→action policy.
//!
//! Both tables are evaluated top to bottom and the first matching row wins, so
//! row order is the priority order.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Quality,
    Context,
    Timeout,
    Api,
    Corruption,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
    Catastrophic,
}

impl Severity {
    /// Severities at which the orchestrator runs automated recovery.
    pub fn warrants_recovery(self) -> bool {
        self >= Self::High
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    RepairCorruption,
    EmergencyReset,
    RollbackChapter { chapter: u32 },
    RollbackMultipleChapters { from: u32, count: u32 },
    RestoreContext { chapter: u32 },
    RestoreState { chapter: u32 },
}

pub const DEFAULT_ROLLBACK_WINDOW: u32 = 2;

/// First chapter cleared by a rollback of `count` chapters ending at `from`.
pub fn rollback_window_start(from: u32, count: u32) -> u32 {
    from.saturating_sub(count).max(1)
}

#[derive(Debug, Clone, Copy)]
pub struct KeywordRule<T: 'static> {
    pub keywords: &'static [&'static str],
    pub result: T,
}

impl<T: Copy> KeywordRule<T> {
    /// `lowered` must already be lowercase.
    pub fn matches(&self, lowered: &str) -> bool {
        self.keywords.iter().any(|k| lowered.contains(k))
    }
}

pub const FAILURE_TYPE_RULES: &[KeywordRule<FailureType>] = &[
    KeywordRule {
        keywords: &["quality"],
        result: FailureType::Quality,
    },
    KeywordRule {
        keywords: &["context"],
        result: FailureType::Context,
    },
    KeywordRule {
        keywords: &["timeout", "timed out"],
        result: FailureType::Timeout,
    },
    KeywordRule {
        keywords: &["api", "rate limit", "http"],
        result: FailureType::Api,
    },
    KeywordRule {
        keywords: &["corrupt"],
        result: FailureType::Corruption,
    },
];

pub const SEVERITY_RULES: &[KeywordRule<Severity>] = &[
    KeywordRule {
        keywords: &["corruption", "fatal", "system error"],
        result: Severity::Catastrophic,
    },
    KeywordRule {
        keywords: &["critical", "cannot continue", "state lost"],
        result: Severity::Critical,
    },
    KeywordRule {
        keywords: &["context error", "multiple failures", "cascading"],
        result: Severity::High,
    },
    KeywordRule {
        keywords: &["quality gate", "consistency", "timeout"],
        result: Severity::Medium,
    },
];

pub fn first_match<T: Copy>(rules: &[KeywordRule<T>], message: &str, fallback: T) -> T {
    let lowered = message.to_lowercase();
    rules
        .iter()
        .find(|rule| rule.matches(&lowered))
        .map_or(fallback, |rule| rule.result)
}

pub fn classify_failure_type(message: &str) -> FailureType {
    first_match(FAILURE_TYPE_RULES, message, FailureType::Unknown)
}

pub fn classify_severity(message: &str) -> Severity {
    first_match(SEVERITY_RULES, message, Severity::Low)
}

pub fn base_actions(severity: Severity, chapter: u32) -> Vec<RecoveryAction> {
    match severity {
        Severity::Catastrophic => vec![RecoveryAction::EmergencyReset],
        Severity::Critical => vec![
            RecoveryAction::RollbackMultipleChapters {
                from: chapter,
                count: DEFAULT_ROLLBACK_WINDOW,
            },
            // Same point the window rollback restores from.
            RecoveryAction::RestoreState {
                chapter: rollback_window_start(chapter, DEFAULT_ROLLBACK_WINDOW),
            },
        ],
        Severity::High => vec![
            RecoveryAction::RollbackChapter { chapter },
            RecoveryAction::RestoreContext { chapter },
        ],
        Severity::Medium => vec![RecoveryAction::RestoreContext { chapter }],
        Severity::Low => vec![RecoveryAction::RollbackChapter { chapter }],
    }
}

/// Base actions for the severity, with corruption repair first when the message mentions it.
pub fn suggest_actions(severity: Severity, chapter: u32, message: &str) -> Vec<RecoveryAction> {
    let mut actions = Vec::new();
    if message.to_lowercase().contains("corruption") {
        actions.push(RecoveryAction::RepairCorruption);
    }
    actions.extend(base_actions(severity, chapter));
    actions
}
