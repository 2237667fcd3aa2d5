use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Premium,
    Trial,
}

/// Per-plan file allowance. Kept as a tagged variant instead of a numeric
/// infinity sentinel so comparisons and JSON stay exact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Capacity {
    Unlimited,
    Limited(u32),
}

impl Capacity {
    pub fn permits(&self, used: u64) -> bool {
        match self {
            Capacity::Unlimited => true,
            Capacity::Limited(n) => used < u64::from(*n),
        }
    }

    pub fn remaining(&self, used: u64) -> Option<u64> {
        match self {
            Capacity::Unlimited => None,
            Capacity::Limited(n) => Some(u64::from(*n).saturating_sub(used)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementRecord {
    pub user_id: i64,
    pub kind: PlanKind,
    pub plan_name: String,
    pub files_allowed: Capacity,
    pub purchase_date: DateTime<Utc>,
    /// `None` means the plan never expires.
    pub expiry_date: Option<DateTime<Utc>>,
    pub payment_details: String,
    #[serde(default)]
    pub files_uploaded: u64,
    pub last_updated: DateTime<Utc>,
}

impl EntitlementRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiry_date, Some(expiry) if expiry <= now)
    }

    pub fn remaining_days(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expiry_date.map(|expiry| (expiry - now).num_days())
    }
}
