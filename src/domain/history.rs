use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Points;

/// Identity assigned by the store when an entry is first persisted.
pub type HistoryId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Points added to the balance
    Charge,
    /// Points spent from the balance
    Use,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Charge => "charge",
            TransactionKind::Use => "use",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "charge" => Some(TransactionKind::Charge),
            "use" => Some(TransactionKind::Use),
            _ => None,
        }
    }

    /// Signed balance change produced by an entry of this kind.
    pub fn delta(&self, amount: Points) -> Points {
        match self {
            TransactionKind::Charge => amount,
            TransactionKind::Use => -amount,
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable record of a past charge or use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// `None` until the store has persisted the entry
    pub id: Option<HistoryId>,
    pub kind: TransactionKind,
    /// Magnitude of the balance change (always positive)
    pub amount: Points,
    /// Ledger update time at the moment of the mutation
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    /// Create an entry that has not been persisted yet.
    pub fn new(kind: TransactionKind, amount: Points, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: None,
            kind,
            amount,
            timestamp,
        }
    }

    pub fn with_id(mut self, id: HistoryId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}
