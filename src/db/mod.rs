use anyhow::Result;
use chrono::{DateTime, Utc};
use rocksdb::{Direction, IteratorMode, Options, DB};
use tokio::sync::Mutex;

use crate::model::{
    entitlement::{Capacity, EntitlementRecord, PlanKind},
    user::{UserAccount, UserStats},
};

use std::str;

/// Durable store for accounts, entitlements and bans, keyed by user id.
///
/// Read-modify-write mutations are serialized behind `write_lock`; contention
/// is per-user and low, so one coarse lock is enough. Point reads go straight
/// to RocksDB.
pub struct EntitlementStore {
    db: DB,
    write_lock: Mutex<()>,
}

impl EntitlementStore {
    pub fn new(path: &str) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn user_key(id: i64) -> String {
        format!("user:{id}")
    }

    fn ent_key(kind: PlanKind, id: i64) -> String {
        match kind {
            PlanKind::Premium => format!("ent:premium:{id}"),
            PlanKind::Trial => format!("ent:trial:{id}"),
        }
    }

    fn trial_used_key(id: i64) -> String {
        format!("trial_used:{id}")
    }

    fn ban_key(id: i64) -> String {
        format!("ban:{id}")
    }

    // ============================================================
    // ACCOUNTS
    // ============================================================
    /// Insert a fresh account; returns false (and leaves the record untouched)
    /// when the user already exists.
    pub async fn add_user(&self, id: i64, name: &str, now: DateTime<Utc>) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let key = Self::user_key(id);
        if self.db.get(&key)?.is_some() {
            return Ok(false);
        }
        let user = UserAccount::new(id, name, now);
        self.db.put(key, serde_json::to_vec(&user)?)?;
        Ok(true)
    }

    pub async fn is_user_exist(&self, id: i64) -> Result<bool> {
        Ok(self.db.get(Self::user_key(id))?.is_some())
    }

    pub async fn load_user(&self, id: i64) -> Result<Option<UserAccount>> {
        Ok(self
            .db
            .get(Self::user_key(id))?
            .map(|v| serde_json::from_slice(&v))
            .transpose()?)
    }

    pub async fn list_users(&self) -> Result<Vec<UserAccount>> {
        let mut out = Vec::new();
        for value in self.scan_prefix("user:")? {
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    pub async fn total_users_count(&self) -> Result<u64> {
        Ok(self.scan_prefix("user:")?.len() as u64)
    }

    /// Remove the account and everything hanging off it. Every delete is
    /// idempotent, so a retry after a partial failure converges.
    pub async fn delete_user(&self, id: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.db.delete(Self::ent_key(PlanKind::Premium, id))?;
        self.db.delete(Self::ent_key(PlanKind::Trial, id))?;
        self.db.delete(Self::ban_key(id))?;
        self.db.delete(Self::user_key(id))?;
        Ok(())
    }

    // ============================================================
    // BANS
    // ============================================================
    /// Ban and cascade entitlement removal. Returns false if already banned.
    pub async fn ban_user(&self, id: i64) -> Result<bool> {
        {
            let _guard = self.write_lock.lock().await;
            let key = Self::ban_key(id);
            if self.db.get(&key)?.is_some() {
                return Ok(false);
            }
            self.db.put(key, b"1")?;
        }
        self.revoke_entitlement(id).await?;
        Ok(true)
    }

    pub async fn is_banned(&self, id: i64) -> Result<bool> {
        Ok(self.db.get(Self::ban_key(id))?.is_some())
    }

    /// Returns true only if a ban record was actually removed.
    pub async fn unban_user(&self, id: i64) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let key = Self::ban_key(id);
        if self.db.get(&key)?.is_none() {
            return Ok(false);
        }
        self.db.delete(key)?;
        Ok(true)
    }

    // ============================================================
    // ENTITLEMENTS
    // ============================================================
    /// Replace (not merge) the record of the given kind and mark the account
    /// premium. A trial grant is refused once the one-time trial right has
    /// been consumed, even if the trial record itself is long gone.
    #[allow(clippy::too_many_arguments)]
    pub async fn grant_entitlement(
        &self,
        id: i64,
        plan_name: &str,
        files_allowed: Capacity,
        expiry_date: Option<DateTime<Utc>>,
        payment_details: &str,
        kind: PlanKind,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        if kind == PlanKind::Trial {
            if self.db.get(Self::trial_used_key(id))?.is_some() {
                return Ok(false);
            }
            self.db.put(Self::trial_used_key(id), b"1")?;
        }

        let record = EntitlementRecord {
            user_id: id,
            kind,
            plan_name: plan_name.to_string(),
            files_allowed,
            purchase_date: now,
            expiry_date,
            payment_details: payment_details.to_string(),
            files_uploaded: 0,
            last_updated: now,
        };
        self.db
            .put(Self::ent_key(kind, id), serde_json::to_vec(&record)?)?;
        self.set_premium_flag(id, true)?;
        Ok(true)
    }

    pub async fn trial_used(&self, id: i64) -> Result<bool> {
        Ok(self.db.get(Self::trial_used_key(id))?.is_some())
    }

    /// Drop both entitlement kinds and clear the premium flag. Returns false
    /// when there was nothing to revoke, so a concurrent sweep and an in-band
    /// demotion race to a harmless no-op.
    pub async fn revoke_entitlement(&self, id: i64) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let premium_key = Self::ent_key(PlanKind::Premium, id);
        let trial_key = Self::ent_key(PlanKind::Trial, id);
        let had_any =
            self.db.get(&premium_key)?.is_some() || self.db.get(&trial_key)?.is_some();
        self.db.delete(premium_key)?;
        self.db.delete(trial_key)?;
        self.set_premium_flag(id, false)?;
        Ok(had_any)
    }

    /// Raw record read, premium before trial. No expiry logic here; that
    /// lives in the evaluator so the check exists in exactly one place.
    pub async fn query_entitlement(&self, id: i64) -> Result<Option<EntitlementRecord>> {
        if let Some(rec) = self.query_entitlement_kind(id, PlanKind::Premium).await? {
            return Ok(Some(rec));
        }
        self.query_entitlement_kind(id, PlanKind::Trial).await
    }

    pub async fn query_entitlement_kind(
        &self,
        id: i64,
        kind: PlanKind,
    ) -> Result<Option<EntitlementRecord>> {
        Ok(self
            .db
            .get(Self::ent_key(kind, id))?
            .map(|v| serde_json::from_slice(&v))
            .transpose()?)
    }

    pub async fn list_entitlements(
        &self,
        active_only: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<EntitlementRecord>> {
        let mut out = self.all_entitlements()?;
        if active_only {
            out.retain(|rec| !rec.is_expired(now));
        }
        Ok(out)
    }

    /// Sweep input: every record past its expiry, plus orphans whose account
    /// was deleted out from under them (a crashed cascade leaves those).
    pub async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<EntitlementRecord>> {
        let mut out = Vec::new();
        for rec in self.all_entitlements()? {
            if rec.is_expired(now) || self.db.get(Self::user_key(rec.user_id))?.is_none() {
                out.push(rec);
            }
        }
        Ok(out)
    }

    fn all_entitlements(&self) -> Result<Vec<EntitlementRecord>> {
        let mut out = Vec::new();
        for value in self.scan_prefix("ent:premium:")? {
            out.push(serde_json::from_slice(&value)?);
        }
        for value in self.scan_prefix("ent:trial:")? {
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    // ============================================================
    // UPLOAD TRACKING
    // ============================================================
    /// Commit one upload: bump the daily counter (resetting it on a new day),
    /// the lifetime total, and the last-used stamp.
    pub async fn record_upload(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = Self::user_key(id);
        let Some(raw) = self.db.get(&key)? else {
            return Ok(());
        };
        let mut user: UserAccount = serde_json::from_slice(&raw)?;

        let today = now.date_naive();
        if user.last_upload_date == today {
            user.daily_uploads += 1;
        } else {
            user.daily_uploads = 1;
            user.last_upload_date = today;
        }
        user.total_uploads += 1;
        user.last_used = now;

        self.db.put(key, serde_json::to_vec(&user)?)?;
        Ok(())
    }

    /// Bump the per-plan usage counter on whichever record is active.
    /// Returns false when the user holds no entitlement.
    pub async fn increment_plan_usage(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        for kind in [PlanKind::Premium, PlanKind::Trial] {
            let key = Self::ent_key(kind, id);
            if let Some(raw) = self.db.get(&key)? {
                let mut rec: EntitlementRecord = serde_json::from_slice(&raw)?;
                rec.files_uploaded += 1;
                rec.last_updated = now;
                self.db.put(key, serde_json::to_vec(&rec)?)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn user_stats(&self, id: i64, now: DateTime<Utc>) -> Result<Option<UserStats>> {
        let Some(user) = self.load_user(id).await? else {
            return Ok(None);
        };
        let record = self.query_entitlement(id).await?.filter(|r| !r.is_expired(now));

        Ok(Some(UserStats {
            user_id: id,
            name: user.name.clone(),
            join_date: user.join_date,
            last_used: user.last_used,
            daily_uploads: user.daily_uploads_on(now.date_naive()),
            total_uploads: user.total_uploads,
            is_premium: record.is_some(),
            plan_name: record.as_ref().map(|r| r.plan_name.clone()),
            expiry_date: record.as_ref().and_then(|r| r.expiry_date),
            remaining_days: record.as_ref().and_then(|r| r.remaining_days(now)),
        }))
    }

    fn set_premium_flag(&self, id: i64, value: bool) -> Result<()> {
        let key = Self::user_key(id);
        if let Some(raw) = self.db.get(&key)? {
            let mut user: UserAccount = serde_json::from_slice(&raw)?;
            if user.is_premium != value {
                user.is_premium = value;
                self.db.put(key, serde_json::to_vec(&user)?)?;
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward))
        {
            let (key, value) = item?;
            let k = str::from_utf8(&key)?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push(value.to_vec());
        }
        Ok(out)
    }
}
