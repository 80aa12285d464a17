//! SQLite persistence layer.
//!
//! RULE: Only the store module talks to the database.
//! Engine components call store methods and never execute SQL
//! directly. This file owns the connection plus the user and event-log
//! tables; referral, order, and analytics queries live in submodules.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    error::ReferralResult,
    event::EventLogEntry,
    types::{UserId, UserRecord},
};

mod analytics;
mod order;
mod referral;

pub use analytics::{FunnelCounts, LeaderboardRow, ReferralStats, RiskReviewRow};
pub use referral::RewardFlag;

/// Bound on every read so no lookup hangs on a locked database.
const BUSY_TIMEOUT_MS: u64 = 5_000;

pub struct ReferralStore {
    conn: Connection,
}

pub(crate) fn to_ts(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

pub(crate) fn opt_to_ts(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(to_ts)
}

pub(crate) fn from_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

pub(crate) fn opt_from_ts(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.map(from_ts)
}

impl ReferralStore {
    pub fn open(path: &str) -> ReferralResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (:memory: ignores it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> ReferralResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> ReferralResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_users.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_orders.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_referrals.sql"))?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Users ──────────────────────────────────────────────────

    pub fn insert_user(&self, u: &UserRecord) -> ReferralResult<()> {
        self.conn.execute(
            "INSERT INTO users (
                user_id, email, phone, referral_code, referral_tier,
                wallet_balance, is_premium, premium_expires_at,
                created_at, last_login_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &u.user_id,
                u.email.as_deref(),
                u.phone.as_deref(),
                u.referral_code.as_deref(),
                &u.referral_tier,
                u.wallet_balance,
                if u.is_premium { 1i32 } else { 0i32 },
                opt_to_ts(u.premium_expires_at),
                to_ts(u.created_at),
                opt_to_ts(u.last_login_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> ReferralResult<Option<UserRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, email, phone, referral_code, referral_tier,
                        wallet_balance, is_premium, premium_expires_at,
                        created_at, last_login_at
                 FROM users WHERE user_id = ?1",
                params![user_id],
                user_row_mapper,
            )
            .optional()?;
        Ok(row)
    }

    pub fn user_by_referral_code(&self, code: &str) -> ReferralResult<Option<UserRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, email, phone, referral_code, referral_tier,
                        wallet_balance, is_premium, premium_expires_at,
                        created_at, last_login_at
                 FROM users WHERE referral_code = ?1",
                params![code],
                user_row_mapper,
            )
            .optional()?;
        Ok(row)
    }

    pub fn credit_wallet(&self, user_id: &str, amount: f64) -> ReferralResult<()> {
        self.conn.execute(
            "UPDATE users SET wallet_balance = wallet_balance + ?1 WHERE user_id = ?2",
            params![amount, user_id],
        )?;
        Ok(())
    }

    pub fn wallet_balance(&self, user_id: &str) -> ReferralResult<f64> {
        let balance: f64 = self.conn.query_row(
            "SELECT wallet_balance FROM users WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(balance)
    }

    /// Count users created inside the optional range (analytics only).
    pub fn user_count(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> ReferralResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM users
             WHERE (?1 IS NULL OR created_at >= ?1)
               AND (?2 IS NULL OR created_at <= ?2)",
            params![opt_to_ts(start), opt_to_ts(end)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// The tier-upgrade gate: one atomic unit covering the tier CAS,
    /// the coin credit, the premium flag, and the voucher attached to
    /// the referral that triggered the upgrade. Returns false when the
    /// CAS loses, in which case nothing was applied.
    pub fn award_tier_upgrade(
        &self,
        user_id: &str,
        old_tier: &str,
        new_tier: &str,
        tier_bonus: f64,
        lifetime_premium: bool,
        trigger_referral: Option<&str>,
        voucher_code: Option<&str>,
        voucher_type: Option<&str>,
    ) -> ReferralResult<bool> {
        // unchecked_transaction: the store hands out &self only, and the
        // single connection is never used re-entrantly.
        let tx = self.conn.unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE users SET referral_tier = ?1
             WHERE user_id = ?2 AND referral_tier = ?3",
            params![new_tier, user_id, old_tier],
        )?;
        if changed == 0 {
            // Lost the race; a concurrent upgrade already applied.
            return Ok(false);
        }
        tx.execute(
            "UPDATE users SET wallet_balance = wallet_balance + ?1 WHERE user_id = ?2",
            params![tier_bonus, user_id],
        )?;
        if lifetime_premium {
            tx.execute(
                "UPDATE users SET is_premium = 1, premium_expires_at = NULL
                 WHERE user_id = ?1",
                params![user_id],
            )?;
        }
        if let (Some(referral_id), Some(code)) = (trigger_referral, voucher_code) {
            tx.execute(
                "UPDATE referrals SET voucher_code = ?1, voucher_type = ?2
                 WHERE referral_id = ?3",
                params![code, voucher_type, referral_id],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> ReferralResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (referral_id, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.referral_id.as_deref(),
                entry.event_type,
                entry.payload,
                to_ts(entry.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn events_for_referral(&self, referral_id: &str) -> ReferralResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, referral_id, event_type, payload, created_at
             FROM event_log WHERE referral_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![referral_id], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    referral_id: row.get(1)?,
                    event_type: row.get(2)?,
                    payload: row.get(3)?,
                    created_at: from_ts(row.get(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn event_count(&self, event_type: &str) -> ReferralResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE event_type = ?1",
            params![event_type],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn user_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        user_id: row.get::<_, UserId>(0)?,
        email: row.get(1)?,
        phone: row.get(2)?,
        referral_code: row.get(3)?,
        referral_tier: row.get(4)?,
        wallet_balance: row.get(5)?,
        is_premium: row.get::<_, i32>(6)? != 0,
        premium_expires_at: opt_from_ts(row.get(7)?),
        created_at: from_ts(row.get(8)?),
        last_login_at: opt_from_ts(row.get(9)?),
    })
}
