//! Triage priority for new DLQ entries

use serde::{Deserialize, Serialize};

use super::types::DlqPriority;
use crate::dispatch::JobHints;

/// Rules that turn `(operation, hints)` into a [`DlqPriority`]
///
/// Evaluated in order, first match wins:
/// 1. an explicit priority hint
/// 2. `amount > high_value_threshold` → High
/// 3. a prepaid `submit_order` → High
/// 4. any operation in `high_operations` → High
/// 5. any operation in `medium_operations` → Medium
/// 6. otherwise Low
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityPolicy {
    pub high_value_threshold: f64,
    pub high_operations: Vec<String>,
    pub medium_operations: Vec<String>,
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self {
            high_value_threshold: 500.0,
            high_operations: vec!["cancel_order".to_string()],
            medium_operations: vec!["submit_order".to_string(), "update_status".to_string()],
        }
    }
}

impl PriorityPolicy {
    pub fn with_high_value_threshold(mut self, threshold: f64) -> Self {
        self.high_value_threshold = threshold;
        self
    }

    /// Priority for a job that failed `operation`
    pub fn priority(&self, operation: &str, hints: &JobHints) -> DlqPriority {
        if let Some(priority) = hints.priority {
            return priority;
        }
        if hints.amount.is_some_and(|amount| amount > self.high_value_threshold) {
            return DlqPriority::High;
        }
        if hints.prepaid && operation == "submit_order" {
            return DlqPriority::High;
        }
        if self.high_operations.iter().any(|op| op == operation) {
            return DlqPriority::High;
        }
        if self.medium_operations.iter().any(|op| op == operation) {
            return DlqPriority::Medium;
        }
        DlqPriority::Low
    }
}
