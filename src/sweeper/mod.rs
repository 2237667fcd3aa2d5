use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    db::EntitlementStore,
    limits::RateLimiter,
    notify::{Notifier, NotificationKind},
};

/// Background loop that demotes expired entitlements without waiting for the
/// user to show up, and prunes dead rate-limit windows while it is at it.
/// One pass every `interval`; shutdown finishes the pass in flight and then
/// exits.
pub struct Sweeper {
    store: Arc<EntitlementStore>,
    limiter: Arc<RateLimiter>,
    notifier: Notifier,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Sweeper {
    pub fn new(
        store: Arc<EntitlementStore>,
        limiter: Arc<RateLimiter>,
        notifier: Notifier,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            limiter,
            notifier,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "expiry sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(0) => {}
                        Ok(n) => info!(demoted = n, "sweep complete"),
                        // Store unreachable: skip this cycle, retry on the next tick.
                        Err(err) => warn!("sweep skipped: {err:#}"),
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!("expiry sweeper stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One pass: revoke every expired or orphaned record. Revocation is
    /// idempotent, so racing the request-path demotion is harmless; a record
    /// someone else already revoked just counts as a no-op here.
    pub async fn sweep_once(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let expired = self.store.list_expired(now).await?;
        let mut demoted = 0;

        for record in expired {
            match self.store.revoke_entitlement(record.user_id).await {
                Ok(true) => {
                    demoted += 1;
                    self.notifier.send(
                        record.user_id,
                        NotificationKind::PlanExpired,
                        format!("Your {} plan has expired.", record.plan_name),
                    );
                }
                Ok(false) => {}
                // One bad record must not stall the rest of the sweep.
                Err(err) => warn!(user_id = record.user_id, "revoke failed: {err:#}"),
            }
        }

        let pruned = self.limiter.prune_stale(now);
        if pruned > 0 {
            debug!(pruned, "dropped idle rate-limit counters");
        }
        Ok(demoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitSettings;
    use crate::entitlement::Evaluator;
    use crate::model::entitlement::{Capacity, PlanKind};
    use crate::model::plan::find_plan;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn test_limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(LimitSettings {
            enable_burst: true,
            max_files: 5,
            burst_timeout: Duration::from_secs(60),
            daily_cap: 10,
        }))
    }

    fn sweeper_with_store() -> (TempDir, Arc<EntitlementStore>, Sweeper, tokio::sync::mpsc::Receiver<crate::notify::Notification>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(EntitlementStore::new(dir.path().to_str().unwrap()).unwrap());
        let (notifier, rx) = Notifier::channel(64);
        let (_tx, shutdown) = watch::channel(false);
        let sweeper = Sweeper::new(
            store.clone(),
            test_limiter(),
            notifier,
            Duration::from_secs(3600),
            shutdown,
        );
        (dir, store, sweeper, rx)
    }

    #[tokio::test]
    async fn sweep_demotes_only_expired_records() {
        let (_dir, store, sweeper, mut rx) = sweeper_with_store();
        let now = Utc::now();

        store.add_user(1, "expired", now).await.unwrap();
        store
            .grant_entitlement(
                1,
                "bronze",
                Capacity::Limited(500),
                Some(now - ChronoDuration::hours(2)),
                "upi:1",
                PlanKind::Premium,
                now - ChronoDuration::days(31),
            )
            .await
            .unwrap();

        store.add_user(2, "active", now).await.unwrap();
        store
            .grant_entitlement(
                2,
                "gold",
                Capacity::Unlimited,
                Some(now + ChronoDuration::days(100)),
                "upi:2",
                PlanKind::Premium,
                now,
            )
            .await
            .unwrap();

        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        assert!(store.query_entitlement(1).await.unwrap().is_none());
        assert!(!store.load_user(1).await.unwrap().unwrap().is_premium);
        assert!(store.query_entitlement(2).await.unwrap().is_some());

        let note = rx.try_recv().unwrap();
        assert_eq!(note.user_id, 1);
        assert_eq!(note.kind, NotificationKind::PlanExpired);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let (_dir, store, sweeper, _rx) = sweeper_with_store();
        let now = Utc::now();
        store.add_user(3, "expired", now).await.unwrap();
        store
            .grant_entitlement(
                3,
                "bronze",
                Capacity::Limited(500),
                Some(now - ChronoDuration::hours(1)),
                "upi:3",
                PlanKind::Premium,
                now - ChronoDuration::days(31),
            )
            .await
            .unwrap();

        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn admin_grant_to_unseen_user_survives_the_sweep() {
        let (_dir, store, sweeper, _rx) = sweeper_with_store();
        let now = Utc::now();
        let limiter = test_limiter();
        let (notifier, _note_rx) = Notifier::channel(64);
        let evaluator = Evaluator::new(store.clone(), limiter, notifier);

        // No prior /start from this user; the grant must create the account.
        let plan = find_plan("gold").unwrap();
        assert!(evaluator.grant_plan(555, plan, "upi:555", now).await.unwrap());
        assert!(store.is_user_exist(555).await.unwrap());

        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
        assert!(store.query_entitlement(555).await.unwrap().is_some());
        assert!(store.load_user(555).await.unwrap().unwrap().is_premium);
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(EntitlementStore::new(dir.path().to_str().unwrap()).unwrap());
        let (notifier, _rx) = Notifier::channel(4);
        let (tx, shutdown) = watch::channel(false);
        let sweeper = Sweeper::new(store, test_limiter(), notifier, Duration::from_secs(3600), shutdown);

        let handle = tokio::spawn(sweeper.run());
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop promptly")
            .unwrap();
    }
}
