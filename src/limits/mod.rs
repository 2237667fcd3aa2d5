use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};

use crate::config::LimitSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitWindow {
    Burst,
    Daily,
}

/// Outcome of a single rate-limit check. On denial, `retry_after` is the time
/// until the governing window rolls over and `denied_by` names that window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitDecision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
    pub denied_by: Option<LimitWindow>,
}

impl LimitDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: None,
            denied_by: None,
        }
    }

    fn deny(window: LimitWindow, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after),
            denied_by: Some(window),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Windows {
    burst_count: u32,
    burst_start: DateTime<Utc>,
    daily_count: u32,
    daily_day: NaiveDate,
}

/// In-memory fixed-window limiter for free-tier uploads. Two independent
/// windows per user: a short burst window and a calendar-day cap. State is
/// volatile by contract and owned by this instance, never a process global.
pub struct RateLimiter {
    settings: LimitSettings,
    counters: Mutex<HashMap<i64, Windows>>,
}

impl RateLimiter {
    pub fn new(settings: LimitSettings) -> Self {
        Self {
            settings,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Check both windows and consume one slot from each on allow. Denial
    /// leaves the counters untouched.
    pub fn check_and_consume(&self, user_id: i64, now: DateTime<Utc>) -> LimitDecision {
        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry(user_id).or_insert(Windows {
            burst_count: 0,
            burst_start: now,
            daily_count: 0,
            daily_day: now.date_naive(),
        });

        if now.date_naive() > entry.daily_day {
            entry.daily_count = 0;
            entry.daily_day = now.date_naive();
        }
        if let Some(retry) = self.daily_retry(entry, now) {
            return LimitDecision::deny(LimitWindow::Daily, retry);
        }

        if self.settings.enable_burst {
            let elapsed = (now - entry.burst_start)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.settings.burst_timeout {
                entry.burst_count = 0;
                entry.burst_start = now;
            } else if entry.burst_count >= self.settings.max_files {
                return LimitDecision::deny(
                    LimitWindow::Burst,
                    self.settings.burst_timeout - elapsed,
                );
            }
            entry.burst_count += 1;
        }

        entry.daily_count += 1;
        LimitDecision::allow()
    }

    /// Free-tier quota left in today's window, without consuming anything.
    pub fn daily_remaining(&self, user_id: i64, now: DateTime<Utc>) -> u32 {
        let counters = self.counters.lock().unwrap();
        match counters.get(&user_id) {
            Some(entry) if entry.daily_day == now.date_naive() => {
                self.settings.daily_cap.saturating_sub(entry.daily_count)
            }
            _ => self.settings.daily_cap,
        }
    }

    /// Drop counters that can no longer influence a decision: the burst
    /// window has elapsed and the daily window belongs to a previous day.
    /// Returns how many users were dropped. The sweeper calls this each
    /// cycle so the map does not grow with every user ever seen.
    pub fn prune_stale(&self, now: DateTime<Utc>) -> usize {
        let settings = self.settings;
        let mut counters = self.counters.lock().unwrap();
        let before = counters.len();
        counters.retain(|_, entry| {
            let burst_live = settings.enable_burst
                && (now - entry.burst_start)
                    .to_std()
                    .map_or(false, |elapsed| elapsed < settings.burst_timeout);
            let daily_live = entry.daily_day == now.date_naive() && entry.daily_count > 0;
            burst_live || daily_live
        });
        before - counters.len()
    }

    fn daily_retry(&self, entry: &Windows, now: DateTime<Utc>) -> Option<Duration> {
        if entry.daily_count < self.settings.daily_cap {
            return None;
        }
        let next_day = entry
            .daily_day
            .succ_opt()?
            .and_hms_opt(0, 0, 0)?
            .and_utc();
        (next_day - now).to_std().ok()
    }
}
