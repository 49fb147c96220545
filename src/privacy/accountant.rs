//! Cumulative privacy budget tracking.
//!
//! The accountant never refuses a query. Callers that want enforcement ask
//! [`PrivacyAccountant::can_execute_query`] before emitting noise. When the
//! ledger is reset is left to the embedding application (typically once per
//! reporting period).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One noise-emitting operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub epsilon: f64,
    pub delta: f64,
    pub timestamp: DateTime<Utc>,
}

/// An (epsilon, delta) pair, used for totals and remaining budget.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Budget {
    pub epsilon: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PrivacyAccountant {
    ledger: Vec<LedgerEntry>,
    total_epsilon: f64,
    total_delta: f64,
}

impl PrivacyAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a query. Always succeeds.
    pub fn add_query(&mut self, epsilon: f64, delta: f64) {
        self.ledger.push(LedgerEntry {
            epsilon,
            delta,
            timestamp: Utc::now(),
        });
        self.total_epsilon += epsilon;
        self.total_delta += delta;
    }

    /// Whether a further `(epsilon, delta)` query stays within the maxima.
    /// Does not modify the ledger.
    pub fn can_execute_query(
        &self,
        epsilon: f64,
        delta: f64,
        max_epsilon: f64,
        max_delta: f64,
    ) -> bool {
        self.total_epsilon + epsilon <= max_epsilon && self.total_delta + delta <= max_delta
    }

    /// Remaining budget, never negative.
    pub fn get_remaining_budget(&self, max_epsilon: f64, max_delta: f64) -> Budget {
        Budget {
            epsilon: (max_epsilon - self.total_epsilon).max(0.0),
            delta: (max_delta - self.total_delta).max(0.0),
        }
    }

    pub fn spent(&self) -> Budget {
        Budget {
            epsilon: self.total_epsilon,
            delta: self.total_delta,
        }
    }

    pub fn ledger(&self) -> &[LedgerEntry] {
        &self.ledger
    }

    pub fn reset(&mut self) {
        self.ledger.clear();
        self.total_epsilon = 0.0;
        self.total_delta = 0.0;
    }
}
