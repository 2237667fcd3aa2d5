use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: i64,
    pub name: String,
    pub join_date: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub daily_uploads: u32,
    pub last_upload_date: NaiveDate,
    #[serde(default)]
    pub total_uploads: u64,
    #[serde(default)]
    pub is_premium: bool,
}

impl UserAccount {
    pub fn new(id: i64, name: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.to_string(),
            join_date: now,
            last_used: now,
            daily_uploads: 0,
            last_upload_date: now.date_naive(),
            total_uploads: 0,
            is_premium: false,
        }
    }

    /// Daily counter as of `day`; a counter left over from a previous day reads as zero.
    pub fn daily_uploads_on(&self, day: NaiveDate) -> u32 {
        if self.last_upload_date == day {
            self.daily_uploads
        } else {
            0
        }
    }
}

/// Aggregated per-user view served to operator tooling.
#[derive(Debug, Clone, Serialize)]
pub struct UserStats {
    pub user_id: i64,
    pub name: String,
    pub join_date: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub daily_uploads: u32,
    pub total_uploads: u64,
    pub is_premium: bool,
    pub plan_name: Option<String>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub remaining_days: Option<i64>,
}
