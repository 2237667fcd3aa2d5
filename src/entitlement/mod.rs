use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::info;

use crate::{
    db::EntitlementStore,
    limits::{LimitWindow, RateLimiter},
    model::{
        entitlement::{EntitlementRecord, PlanKind},
        plan::{find_plan, Plan},
    },
    notify::{Notifier, NotificationKind},
};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Trial,
    Premium,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Banned,
    PlanQuotaExceeded,
    RateLimited,
    DailyCapReached,
}

/// Single decision for one inbound file: who the user is right now and
/// whether this upload may proceed.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub tier: Tier,
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    /// Files left under the binding quota; `None` means unlimited.
    pub remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl Evaluation {
    fn deny(tier: Tier, reason: DenyReason, retry_after: Option<Duration>) -> Self {
        Self {
            tier,
            allowed: false,
            reason: Some(reason),
            remaining: Some(0),
            retry_after_secs: retry_after.map(|d| d.as_secs()),
        }
    }
}

/// The one place expiry and tier are decided. Every read path that used to
/// re-check expiry on its own goes through here instead.
pub struct Evaluator {
    store: Arc<EntitlementStore>,
    limiter: Arc<RateLimiter>,
    notifier: Notifier,
}

impl Evaluator {
    pub fn new(store: Arc<EntitlementStore>, limiter: Arc<RateLimiter>, notifier: Notifier) -> Self {
        Self {
            store,
            limiter,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<EntitlementStore> {
        &self.store
    }

    pub async fn evaluate(&self, user_id: i64, now: DateTime<Utc>) -> Result<Evaluation> {
        self.evaluate_with_pending(user_id, now, 0).await
    }

    /// Evaluation with `pending` authorized-but-uncommitted uploads counted
    /// against the plan quota, so in-flight transfers hold their slot.
    pub(crate) async fn evaluate_with_pending(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
        pending: u64,
    ) -> Result<Evaluation> {
        if self.store.is_banned(user_id).await? {
            return Ok(Evaluation::deny(Tier::Free, DenyReason::Banned, None));
        }

        if let Some(record) = self.active_record(user_id, PlanKind::Premium, now).await? {
            return Ok(self.plan_evaluation(Tier::Premium, &record, pending));
        }
        if let Some(record) = self.active_record(user_id, PlanKind::Trial, now).await? {
            return Ok(self.plan_evaluation(Tier::Trial, &record, pending));
        }

        let decision = self.limiter.check_and_consume(user_id, now);
        if decision.allowed {
            return Ok(Evaluation {
                tier: Tier::Free,
                allowed: true,
                reason: None,
                remaining: Some(u64::from(self.limiter.daily_remaining(user_id, now))),
                retry_after_secs: None,
            });
        }
        let reason = match decision.denied_by {
            Some(LimitWindow::Daily) => DenyReason::DailyCapReached,
            _ => DenyReason::RateLimited,
        };
        Ok(Evaluation::deny(Tier::Free, reason, decision.retry_after))
    }

    /// Admin-side grant with plan parameters resolved from the catalog.
    /// The account is upserted first: a grant to an id the bot has never
    /// seen must not leave a record dangling for the orphan sweep to reap.
    pub async fn grant_plan(
        &self,
        user_id: i64,
        plan: &Plan,
        payment_details: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.store.add_user(user_id, "unknown", now).await?;
        let expiry = plan
            .duration_days
            .map(|days| now + ChronoDuration::days(i64::from(days)));
        let kind = if plan.is_trial {
            PlanKind::Trial
        } else {
            PlanKind::Premium
        };
        let granted = self
            .store
            .grant_entitlement(
                user_id,
                plan.display_name,
                plan.files_allowed,
                expiry,
                payment_details,
                kind,
                now,
            )
            .await?;
        if granted {
            info!(user_id, plan = plan.id, "plan granted");
            self.notifier.send(
                user_id,
                NotificationKind::PlanGranted,
                format!("Your {} plan is now active.", plan.display_name),
            );
        }
        Ok(granted)
    }

    /// Grant the one-time self-service trial. False when banned, already on a
    /// plan, or the trial right was consumed before.
    pub async fn activate_trial(&self, user_id: i64, now: DateTime<Utc>) -> Result<bool> {
        if self.store.is_banned(user_id).await?
            || self.active_record(user_id, PlanKind::Premium, now).await?.is_some()
        {
            return Ok(false);
        }
        self.store.add_user(user_id, "unknown", now).await?;
        let plan = find_plan("trial").expect("trial plan present in catalog");
        let expiry = plan
            .duration_days
            .map(|days| now + ChronoDuration::days(i64::from(days)));
        let granted = self
            .store
            .grant_entitlement(
                user_id,
                plan.display_name,
                plan.files_allowed,
                expiry,
                "trial",
                PlanKind::Trial,
                now,
            )
            .await?;
        if granted {
            info!(user_id, "trial activated");
            self.notifier.send(
                user_id,
                NotificationKind::TrialActivated,
                format!("Your {} is active.", plan.display_name),
            );
        }
        Ok(granted)
    }

    /// Load the record of one kind, demoting in-band when it has expired so
    /// the same request immediately sees free-tier limits.
    async fn active_record(
        &self,
        user_id: i64,
        kind: PlanKind,
        now: DateTime<Utc>,
    ) -> Result<Option<EntitlementRecord>> {
        let Some(record) = self.store.query_entitlement_kind(user_id, kind).await? else {
            return Ok(None);
        };
        if !record.is_expired(now) {
            return Ok(Some(record));
        }
        if self.store.revoke_entitlement(user_id).await? {
            info!(user_id, plan = %record.plan_name, "plan expired, demoting");
            self.notifier.send(
                user_id,
                NotificationKind::PlanExpired,
                format!("Your {} plan has expired.", record.plan_name),
            );
        }
        Ok(None)
    }

    fn plan_evaluation(&self, tier: Tier, record: &EntitlementRecord, pending: u64) -> Evaluation {
        let used = record.files_uploaded + pending;
        if record.files_allowed.permits(used) {
            Evaluation {
                tier,
                allowed: true,
                reason: None,
                remaining: record.files_allowed.remaining(used),
                retry_after_secs: None,
            }
        } else {
            Evaluation::deny(tier, DenyReason::PlanQuotaExceeded, None)
        }
    }
}

/// Two-phase admission for one inbound file: `authorize` before the forward,
/// `commit` only after the forward is confirmed, so a failed transfer never
/// burns durable quota. Each plan-tier authorization reserves a slot against
/// the plan cap until its commit (or `release`) lands; together with the
/// per-user lock this keeps N in-flight transfers from outrunning
/// `files_allowed`.
pub struct UploadGate {
    evaluator: Evaluator,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    /// Authorized-but-uncommitted plan uploads, counted against the cap.
    /// Volatile by design, like the rate-limit windows.
    pending: Mutex<HashMap<i64, u64>>,
}

impl UploadGate {
    pub fn new(evaluator: Evaluator) -> Self {
        Self {
            evaluator,
            locks: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub async fn authorize(
        &self,
        user_id: i64,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Evaluation> {
        let lock = self.user_lock(user_id);
        let eval = {
            let _guard = lock.lock().await;

            // First contact creates the account; an existing one is untouched.
            if self.evaluator.store.add_user(user_id, name, now).await? {
                info!(user_id, name, "new user");
            }
            let pending = self.pending_for(user_id);
            let eval = self
                .evaluator
                .evaluate_with_pending(user_id, now, pending)
                .await?;
            if eval.allowed && eval.tier != Tier::Free {
                self.add_pending(user_id);
            }
            eval
        };
        self.prune_lock(user_id, lock);
        Ok(eval)
    }

    /// Record one permitted upload. Call exactly once per authorized file,
    /// after the forward succeeded.
    pub async fn commit(&self, user_id: i64, now: DateTime<Utc>) -> Result<()> {
        let lock = self.user_lock(user_id);
        {
            let _guard = lock.lock().await;
            self.take_pending(user_id);
            self.evaluator.store.increment_plan_usage(user_id, now).await?;
            self.evaluator.store.record_upload(user_id, now).await?;
        }
        self.prune_lock(user_id, lock);
        Ok(())
    }

    /// Abort path for an authorized upload whose transfer failed: hands the
    /// reserved plan slot back without recording anything durable. Burst
    /// slots consumed at authorize are not refunded.
    pub async fn release(&self, user_id: i64) {
        let lock = self.user_lock(user_id);
        {
            let _guard = lock.lock().await;
            self.take_pending(user_id);
        }
        self.prune_lock(user_id, lock);
    }

    fn user_lock(&self, user_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(user_id).or_default().clone()
    }

    /// Drop the map entry once nobody else holds the lock. Cloning only
    /// happens under the map mutex, so a strong count of two (map + ours)
    /// proves the user has no call in flight.
    fn prune_lock(&self, user_id: i64, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap();
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&user_id);
        }
    }

    fn pending_for(&self, user_id: i64) -> u64 {
        self.pending.lock().unwrap().get(&user_id).copied().unwrap_or(0)
    }

    fn add_pending(&self, user_id: i64) {
        *self.pending.lock().unwrap().entry(user_id).or_insert(0) += 1;
    }

    fn take_pending(&self, user_id: i64) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(count) = pending.get_mut(&user_id) {
            *count -= 1;
            if *count == 0 {
                pending.remove(&user_id);
            }
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitSettings;
    use crate::model::entitlement::Capacity;
    use tempfile::TempDir;

    fn gate_with(settings: LimitSettings) -> (TempDir, Arc<UploadGate>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(EntitlementStore::new(dir.path().to_str().unwrap()).unwrap());
        let limiter = Arc::new(RateLimiter::new(settings));
        let (notifier, _rx) = Notifier::channel(64);
        let gate = UploadGate::new(Evaluator::new(store, limiter, notifier));
        (dir, Arc::new(gate))
    }

    fn default_settings() -> LimitSettings {
        LimitSettings {
            enable_burst: true,
            max_files: 5,
            burst_timeout: Duration::from_secs(60),
            daily_cap: 10,
        }
    }

    #[tokio::test]
    async fn fresh_user_starts_free_and_allowed() {
        let (_dir, gate) = gate_with(default_settings());
        let now = Utc::now();

        let eval = gate.authorize(111, "newcomer", now).await.unwrap();
        assert_eq!(eval.tier, Tier::Free);
        assert!(eval.allowed);
        let before = eval.remaining.unwrap();

        gate.commit(111, now).await.unwrap();
        let eval = gate.authorize(111, "newcomer", now).await.unwrap();
        assert_eq!(eval.remaining.unwrap(), before - 1);
    }

    #[tokio::test]
    async fn premium_quota_exhausts_after_allowed_files() {
        let (_dir, gate) = gate_with(default_settings());
        let now = Utc::now();
        let store = gate.evaluator().store().clone();
        store.add_user(222, "payer", now).await.unwrap();
        store
            .grant_entitlement(
                222,
                "bronze",
                Capacity::Limited(2),
                Some(now + ChronoDuration::days(30)),
                "upi:222",
                PlanKind::Premium,
                now,
            )
            .await
            .unwrap();

        for _ in 0..2 {
            let eval = gate.authorize(222, "payer", now).await.unwrap();
            assert!(eval.allowed);
            assert_eq!(eval.tier, Tier::Premium);
            gate.commit(222, now).await.unwrap();
        }

        let eval = gate.authorize(222, "payer", now).await.unwrap();
        assert!(!eval.allowed);
        assert_eq!(eval.reason, Some(DenyReason::PlanQuotaExceeded));
    }

    #[tokio::test]
    async fn ban_overrides_premium() {
        let (_dir, gate) = gate_with(default_settings());
        let now = Utc::now();
        let store = gate.evaluator().store().clone();
        store.add_user(333, "banned", now).await.unwrap();
        store
            .grant_entitlement(
                333,
                "gold",
                Capacity::Unlimited,
                Some(now + ChronoDuration::days(300)),
                "upi:333",
                PlanKind::Premium,
                now,
            )
            .await
            .unwrap();
        store.ban_user(333).await.unwrap();

        let eval = gate.authorize(333, "banned", now).await.unwrap();
        assert!(!eval.allowed);
        assert_eq!(eval.reason, Some(DenyReason::Banned));
    }

    #[tokio::test]
    async fn expired_plan_demotes_on_the_same_request() {
        let (_dir, gate) = gate_with(default_settings());
        let now = Utc::now();
        let store = gate.evaluator().store().clone();
        store.add_user(4, "lapsed", now).await.unwrap();
        store
            .grant_entitlement(
                4,
                "bronze",
                Capacity::Limited(500),
                Some(now - ChronoDuration::hours(1)),
                "upi:4",
                PlanKind::Premium,
                now - ChronoDuration::days(31),
            )
            .await
            .unwrap();

        let eval = gate.authorize(4, "lapsed", now).await.unwrap();
        assert_eq!(eval.tier, Tier::Free);
        assert!(eval.allowed);
        assert!(store.query_entitlement(4).await.unwrap().is_none());
        assert!(!store.load_user(4).await.unwrap().unwrap().is_premium);
    }

    #[tokio::test]
    async fn expired_trial_falls_back_to_free_not_trial() {
        let (_dir, gate) = gate_with(default_settings());
        let now = Utc::now();
        let store = gate.evaluator().store().clone();
        store.add_user(5, "trialist", now).await.unwrap();
        store
            .grant_entitlement(
                5,
                "Free Trial",
                Capacity::Limited(20),
                Some(now - ChronoDuration::minutes(5)),
                "trial",
                PlanKind::Trial,
                now - ChronoDuration::days(3),
            )
            .await
            .unwrap();

        let eval = gate.authorize(5, "trialist", now).await.unwrap();
        assert_eq!(eval.tier, Tier::Free);
        assert!(store.trial_used(5).await.unwrap());
    }

    #[tokio::test]
    async fn trial_cannot_be_activated_twice() {
        let (_dir, gate) = gate_with(default_settings());
        let now = Utc::now();
        let evaluator = gate.evaluator();
        evaluator.store().add_user(6, "trialist", now).await.unwrap();

        assert!(evaluator.activate_trial(6, now).await.unwrap());
        evaluator.store().revoke_entitlement(6).await.unwrap();
        assert!(!evaluator.activate_trial(6, now).await.unwrap());
    }

    #[tokio::test]
    async fn in_flight_authorizations_hold_plan_slots() {
        let (_dir, gate) = gate_with(default_settings());
        let now = Utc::now();
        let store = gate.evaluator().store().clone();
        store.add_user(99, "payer", now).await.unwrap();
        store
            .grant_entitlement(
                99,
                "bronze",
                Capacity::Limited(2),
                Some(now + ChronoDuration::days(30)),
                "upi:99",
                PlanKind::Premium,
                now,
            )
            .await
            .unwrap();

        // All transfers in flight: nothing committed yet.
        let mut allowed = 0;
        for _ in 0..10 {
            let eval = gate.authorize(99, "payer", now).await.unwrap();
            if eval.allowed {
                allowed += 1;
            } else {
                assert_eq!(eval.reason, Some(DenyReason::PlanQuotaExceeded));
            }
        }
        assert_eq!(allowed, 2);

        gate.commit(99, now).await.unwrap();
        gate.commit(99, now).await.unwrap();
        let rec = store.query_entitlement(99).await.unwrap().unwrap();
        assert_eq!(rec.files_uploaded, 2);

        let eval = gate.authorize(99, "payer", now).await.unwrap();
        assert!(!eval.allowed);
    }

    #[tokio::test]
    async fn released_reservation_frees_the_slot() {
        let (_dir, gate) = gate_with(default_settings());
        let now = Utc::now();
        let store = gate.evaluator().store().clone();
        store.add_user(98, "payer", now).await.unwrap();
        store
            .grant_entitlement(
                98,
                "bronze",
                Capacity::Limited(1),
                Some(now + ChronoDuration::days(30)),
                "upi:98",
                PlanKind::Premium,
                now,
            )
            .await
            .unwrap();

        assert!(gate.authorize(98, "payer", now).await.unwrap().allowed);
        assert!(!gate.authorize(98, "payer", now).await.unwrap().allowed);

        // Transfer failed: the slot comes back and no quota was burned.
        gate.release(98).await;
        assert!(gate.authorize(98, "payer", now).await.unwrap().allowed);
        gate.commit(98, now).await.unwrap();

        let rec = store.query_entitlement(98).await.unwrap().unwrap();
        assert_eq!(rec.files_uploaded, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_plan_uploads_cannot_overshoot_files_allowed() {
        let (_dir, gate) = gate_with(default_settings());
        let now = Utc::now();
        let store = gate.evaluator().store().clone();
        store.add_user(97, "payer", now).await.unwrap();
        store
            .grant_entitlement(
                97,
                "bronze",
                Capacity::Limited(3),
                Some(now + ChronoDuration::days(30)),
                "upi:97",
                PlanKind::Premium,
                now,
            )
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                let eval = gate.authorize(97, "payer", now).await.unwrap();
                if eval.allowed {
                    gate.commit(97, now).await.unwrap();
                    true
                } else {
                    false
                }
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
        let rec = store.query_entitlement(97).await.unwrap().unwrap();
        assert_eq!(rec.files_uploaded, 3);
    }

    #[tokio::test]
    async fn idle_user_locks_are_pruned() {
        let (_dir, gate) = gate_with(default_settings());
        let now = Utc::now();

        gate.authorize(96, "drive-by", now).await.unwrap();
        gate.commit(96, now).await.unwrap();
        assert_eq!(gate.lock_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_uploads_cannot_overshoot_the_burst_cap() {
        let (_dir, gate) = gate_with(default_settings());
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                let eval = gate.authorize(7, "racer", now).await.unwrap();
                if eval.allowed {
                    gate.commit(7, now).await.unwrap();
                    true
                } else {
                    false
                }
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);

        let denied = gate.authorize(7, "racer", now).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs.unwrap() > 0);
        assert_eq!(
            gate.evaluator().store().load_user(7).await.unwrap().unwrap().total_uploads,
            5
        );
    }
}
