//! Referral table queries: CRUD, the status CAS, the reward-flag CAS,
//! and the history reads the fraud scorer depends on.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{from_ts, opt_from_ts, opt_to_ts, to_ts, ReferralStore};
use crate::{
    error::ReferralResult,
    types::{QualificationCriteria, Referral, ReferralMetadata, ReferralStatus, RewardBundle},
};

/// Which idempotency flag a reward claim targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardFlag {
    Referrer,
    Referee,
    Milestone,
}

impl RewardFlag {
    fn column(&self) -> &'static str {
        match self {
            RewardFlag::Referrer => "referrer_rewarded",
            RewardFlag::Referee => "referee_rewarded",
            RewardFlag::Milestone => "milestone_rewarded",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RewardFlag::Referrer => "referrer_bonus",
            RewardFlag::Referee => "referee_discount",
            RewardFlag::Milestone => "milestone_bonus",
        }
    }
}

const REFERRAL_COLUMNS: &str = "referral_id, referrer_id, referee_id, referral_code, status,
    registered_at, qualified_at, completed_at, expires_at,
    min_orders, min_spend, timeframe_days,
    referrer_amount, referee_discount, milestone_bonus, voucher_code, voucher_type,
    referrer_rewarded, referee_rewarded, milestone_rewarded, tier,
    share_method, device_id, ip_address, user_agent,
    referee_first_order_at, milestone_orders,
    fraud_flag, fraud_reason, flagged_at, created_at";

impl ReferralStore {
    pub fn insert_referral(&self, r: &Referral) -> ReferralResult<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO referrals ({REFERRAL_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28,
                         ?29, ?30, ?31)"
            ),
            params![
                &r.referral_id,
                &r.referrer_id,
                &r.referee_id,
                &r.referral_code,
                r.status.as_str(),
                opt_to_ts(r.registered_at),
                opt_to_ts(r.qualified_at),
                opt_to_ts(r.completed_at),
                opt_to_ts(r.expires_at),
                r.criteria.min_orders,
                r.criteria.min_spend,
                r.criteria.timeframe_days,
                r.rewards.referrer_amount,
                r.rewards.referee_discount,
                r.rewards.milestone_bonus,
                r.rewards.voucher_code.as_deref(),
                r.rewards.voucher_type.as_deref(),
                if r.referrer_rewarded { 1i32 } else { 0i32 },
                if r.referee_rewarded { 1i32 } else { 0i32 },
                if r.milestone_rewarded { 1i32 } else { 0i32 },
                &r.tier,
                r.metadata.share_method.as_deref(),
                r.metadata.device_id.as_deref(),
                r.metadata.ip_address.as_deref(),
                r.metadata.user_agent.as_deref(),
                opt_to_ts(r.metadata.referee_first_order_at),
                r.metadata.milestone_orders,
                if r.metadata.fraud_flag { 1i32 } else { 0i32 },
                r.metadata.fraud_reason.as_deref(),
                opt_to_ts(r.metadata.flagged_at),
                to_ts(r.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_referral(&self, referral_id: &str) -> ReferralResult<Option<Referral>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {REFERRAL_COLUMNS} FROM referrals WHERE referral_id = ?1"),
                params![referral_id],
                referral_row_mapper,
            )
            .optional()?;
        Ok(row)
    }

    /// The referee's referral, if any. At most one exists per referee.
    pub fn referral_by_referee(&self, referee_id: &str) -> ReferralResult<Option<Referral>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {REFERRAL_COLUMNS} FROM referrals WHERE referee_id = ?1"),
                params![referee_id],
                referral_row_mapper,
            )
            .optional()?;
        Ok(row)
    }

    /// Lifetime count of qualified-or-completed referrals, the tier input.
    pub fn qualified_referral_count(&self, referrer_id: &str) -> ReferralResult<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM referrals
             WHERE referrer_id = ?1 AND status IN ('qualified', 'completed')",
            params![referrer_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Status CAS ─────────────────────────────────────────────

    /// Optimistic forward transition: succeeds only when the stored
    /// status still equals `from`. Stamps the lifecycle timestamp for
    /// the target state at most once (COALESCE keeps an earlier stamp).
    pub fn cas_status(
        &self,
        referral_id: &str,
        from: ReferralStatus,
        to: ReferralStatus,
        now: DateTime<Utc>,
    ) -> ReferralResult<bool> {
        let sql = match to {
            ReferralStatus::Registered => {
                "UPDATE referrals SET status = ?1, registered_at = COALESCE(registered_at, ?2)
                 WHERE referral_id = ?3 AND status = ?4"
            }
            ReferralStatus::Qualified => {
                "UPDATE referrals SET status = ?1, qualified_at = COALESCE(qualified_at, ?2)
                 WHERE referral_id = ?3 AND status = ?4"
            }
            ReferralStatus::Completed => {
                "UPDATE referrals SET status = ?1, completed_at = COALESCE(completed_at, ?2)
                 WHERE referral_id = ?3 AND status = ?4"
            }
            _ => {
                "UPDATE referrals SET status = ?1
                 WHERE referral_id = ?3 AND status = ?4 AND ?2 = ?2"
            }
        };
        let changed = self.conn().execute(
            sql,
            params![to.as_str(), to_ts(now), referral_id, from.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// Terminal escape hatch: expire from any non-terminal state,
    /// stamping the fraud annotations when a reason is given.
    pub fn expire_referral(
        &self,
        referral_id: &str,
        fraud_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> ReferralResult<bool> {
        let changed = self.conn().execute(
            "UPDATE referrals SET
                status = 'expired',
                fraud_flag = CASE WHEN ?1 IS NULL THEN fraud_flag ELSE 1 END,
                fraud_reason = COALESCE(?1, fraud_reason),
                flagged_at = CASE WHEN ?1 IS NULL THEN flagged_at ELSE ?2 END
             WHERE referral_id = ?3 AND status NOT IN ('completed', 'expired')",
            params![fraud_reason, to_ts(now), referral_id],
        )?;
        Ok(changed == 1)
    }

    // ── Reward flag CAS ────────────────────────────────────────

    /// Atomic check-and-set on one idempotency flag. True means this
    /// caller won the claim and must perform the crediting action.
    pub fn claim_reward_flag(&self, referral_id: &str, flag: RewardFlag) -> ReferralResult<bool> {
        let sql = format!(
            "UPDATE referrals SET {col} = 1 WHERE referral_id = ?1 AND {col} = 0",
            col = flag.column()
        );
        let changed = self.conn().execute(&sql, params![referral_id])?;
        Ok(changed == 1)
    }

    // ── Metadata updates ───────────────────────────────────────

    /// Stamp the referee's first order. True only for the call that
    /// actually set it.
    pub fn set_referee_first_order(
        &self,
        referral_id: &str,
        at: DateTime<Utc>,
    ) -> ReferralResult<bool> {
        let changed = self.conn().execute(
            "UPDATE referrals SET referee_first_order_at = ?1
             WHERE referral_id = ?2 AND referee_first_order_at IS NULL",
            params![to_ts(at), referral_id],
        )?;
        Ok(changed == 1)
    }

    pub fn set_milestone_orders(&self, referral_id: &str, count: u32) -> ReferralResult<()> {
        self.conn().execute(
            "UPDATE referrals SET milestone_orders = ?1 WHERE referral_id = ?2",
            params![count, referral_id],
        )?;
        Ok(())
    }

    /// Manual fraud stamp for review-flagged referrals. Idempotent.
    pub fn stamp_fraud(
        &self,
        referral_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ReferralResult<()> {
        self.conn().execute(
            "UPDATE referrals SET fraud_flag = 1, fraud_reason = ?1,
                    flagged_at = COALESCE(flagged_at, ?2)
             WHERE referral_id = ?3",
            params![reason, to_ts(now), referral_id],
        )?;
        Ok(())
    }

    // ── Fraud history reads ────────────────────────────────────

    /// Does any prior referral by this referrer carry the same device
    /// fingerprint or IP address?
    pub fn device_or_ip_reused(
        &self,
        referrer_id: &str,
        device_id: Option<&str>,
        ip_address: Option<&str>,
        exclude_referee: &str,
    ) -> ReferralResult<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM referrals
             WHERE referrer_id = ?1 AND referee_id != ?2
               AND ((?3 IS NOT NULL AND device_id = ?3)
                 OR (?4 IS NOT NULL AND ip_address = ?4))",
            params![referrer_id, exclude_referee, device_id, ip_address],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Referrals created by this referrer since `since` (velocity input).
    pub fn referral_count_since(
        &self,
        referrer_id: &str,
        since: DateTime<Utc>,
    ) -> ReferralResult<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM referrals
             WHERE referrer_id = ?1 AND created_at >= ?2",
            params![referrer_id, to_ts(since)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Ring detection: has the referee, directly or one hop removed,
    /// already referred the referrer?
    pub fn circular_referral_exists(
        &self,
        referrer_id: &str,
        referee_id: &str,
    ) -> ReferralResult<bool> {
        let direct: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM referrals
             WHERE referrer_id = ?1 AND referee_id = ?2",
            params![referee_id, referrer_id],
            |row| row.get(0),
        )?;
        if direct > 0 {
            return Ok(true);
        }
        let one_hop: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM referrals a
             JOIN referrals b ON a.referee_id = b.referrer_id
             WHERE a.referrer_id = ?1 AND b.referee_id = ?2",
            params![referee_id, referrer_id],
            |row| row.get(0),
        )?;
        Ok(one_hop > 0)
    }

    // ── Sweep queries ──────────────────────────────────────────

    /// Referrals the periodic fraud sweep re-scores.
    pub fn open_referrals(&self) -> ReferralResult<Vec<Referral>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {REFERRAL_COLUMNS} FROM referrals
             WHERE status IN ('pending', 'registered')
             ORDER BY created_at ASC, referral_id ASC"
        ))?;
        let rows = stmt
            .query_map([], referral_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Referrals whose window closed before qualifying.
    pub fn overdue_referrals(&self, now: DateTime<Utc>) -> ReferralResult<Vec<Referral>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {REFERRAL_COLUMNS} FROM referrals
             WHERE status IN ('pending', 'registered', 'active')
               AND expires_at IS NOT NULL AND expires_at < ?1
             ORDER BY created_at ASC, referral_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![to_ts(now)], referral_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn referral_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Referral> {
    let status_str: String = row.get(4)?;
    let status = ReferralStatus::parse(&status_str).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("bad referral status '{status_str}'").into(),
        )
    })?;
    Ok(Referral {
        referral_id: row.get(0)?,
        referrer_id: row.get(1)?,
        referee_id: row.get(2)?,
        referral_code: row.get(3)?,
        status,
        registered_at: opt_from_ts(row.get(5)?),
        qualified_at: opt_from_ts(row.get(6)?),
        completed_at: opt_from_ts(row.get(7)?),
        expires_at: opt_from_ts(row.get(8)?),
        criteria: QualificationCriteria {
            min_orders: row.get(9)?,
            min_spend: row.get(10)?,
            timeframe_days: row.get(11)?,
        },
        rewards: RewardBundle {
            referrer_amount: row.get(12)?,
            referee_discount: row.get(13)?,
            milestone_bonus: row.get(14)?,
            voucher_code: row.get(15)?,
            voucher_type: row.get(16)?,
        },
        referrer_rewarded: row.get::<_, i32>(17)? != 0,
        referee_rewarded: row.get::<_, i32>(18)? != 0,
        milestone_rewarded: row.get::<_, i32>(19)? != 0,
        tier: row.get(20)?,
        metadata: ReferralMetadata {
            share_method: row.get(21)?,
            device_id: row.get(22)?,
            ip_address: row.get(23)?,
            user_agent: row.get(24)?,
            referee_first_order_at: opt_from_ts(row.get(25)?),
            milestone_orders: row.get(26)?,
            fraud_flag: row.get::<_, i32>(27)? != 0,
            fraud_reason: row.get(28)?,
            flagged_at: opt_from_ts(row.get(29)?),
        },
        created_at: from_ts(row.get(30)?),
    })
}
