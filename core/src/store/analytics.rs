//! Read-side aggregate queries for the analytics report and the
//! persisted risk verdicts. Nothing here mutates state.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use super::{from_ts, opt_to_ts, to_ts, ReferralStore};
use crate::{error::ReferralResult, types::DateRange};

/// Cumulative stage counts. A referral that completed still counts in
/// every earlier stage, so downstream percentages never increase.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FunnelCounts {
    pub created: i64,
    pub registered: i64,
    pub first_order: i64,
    pub qualified: i64,
    pub completed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardRow {
    pub user_id: String,
    pub qualified_referrals: i64,
    pub lifetime_earnings: f64,
    pub tier: String,
}

/// Per-referrer rollup: lifecycle counts plus earned and still-pending
/// referral earnings.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReferralStats {
    pub total: i64,
    pub pending: i64,
    pub active: i64,
    pub qualified: i64,
    pub completed: i64,
    pub expired: i64,
    pub total_earned: f64,
    pub pending_earnings: f64,
}

#[derive(Debug, Clone)]
pub struct RiskReviewRow {
    pub id: Option<i64>,
    pub referral_id: Option<String>,
    pub referrer_id: String,
    pub referee_id: String,
    pub risk_score: u32,
    pub reasons: String,
    pub action: String,
    pub assessed_at: DateTime<Utc>,
}

fn range_params(range: &DateRange) -> (Option<i64>, Option<i64>) {
    (opt_to_ts(range.start), opt_to_ts(range.end))
}

impl ReferralStore {
    pub fn funnel_counts(&self, range: &DateRange) -> ReferralResult<FunnelCounts> {
        let (start, end) = range_params(range);
        let counts = self.conn().query_row(
            "SELECT COUNT(*),
                    COUNT(registered_at),
                    COUNT(referee_first_order_at),
                    COUNT(qualified_at),
                    COUNT(completed_at)
             FROM referrals
             WHERE (?1 IS NULL OR created_at >= ?1)
               AND (?2 IS NULL OR created_at <= ?2)",
            params![start, end],
            |row| {
                Ok(FunnelCounts {
                    created: row.get(0)?,
                    registered: row.get(1)?,
                    first_order: row.get(2)?,
                    qualified: row.get(3)?,
                    completed: row.get(4)?,
                })
            },
        )?;
        Ok(counts)
    }

    /// Referrals that reached qualified or completed, by creation date.
    pub fn qualified_or_completed_count(&self, range: &DateRange) -> ReferralResult<i64> {
        let (start, end) = range_params(range);
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM referrals
             WHERE status IN ('qualified', 'completed')
               AND (?1 IS NULL OR created_at >= ?1)
               AND (?2 IS NULL OR created_at <= ?2)",
            params![start, end],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Total reward cost of qualified/completed referrals (CAC numerator).
    pub fn rewards_paid_total(&self, range: &DateRange) -> ReferralResult<f64> {
        let (start, end) = range_params(range);
        let total: f64 = self.conn().query_row(
            "SELECT COALESCE(SUM(
                        referrer_amount + referee_discount
                        + COALESCE(milestone_bonus, 0)), 0)
             FROM referrals
             WHERE status IN ('qualified', 'completed')
               AND (?1 IS NULL OR created_at >= ?1)
               AND (?2 IS NULL OR created_at <= ?2)",
            params![start, end],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Average countable order value brought in per qualified/completed
    /// referral (LTV). None when no such referral exists.
    pub fn ltv_per_referral(&self, range: &DateRange) -> ReferralResult<Option<f64>> {
        let (start, end) = range_params(range);
        let avg: Option<f64> = self.conn().query_row(
            "SELECT AVG(referee_total) FROM (
                SELECT (SELECT COALESCE(SUM(o.amount), 0) FROM orders o
                        WHERE o.user_id = r.referee_id
                          AND o.status IN ('delivered', 'completed')) AS referee_total
                FROM referrals r
                WHERE r.status IN ('qualified', 'completed')
                  AND (?1 IS NULL OR r.created_at >= ?1)
                  AND (?2 IS NULL OR r.created_at <= ?2)
             )",
            params![start, end],
            |row| row.get(0),
        )?;
        Ok(avg)
    }

    /// Days from registration to qualification, averaged over referrals
    /// that have both stamps.
    pub fn avg_days_to_qualification(&self, range: &DateRange) -> ReferralResult<Option<f64>> {
        let (start, end) = range_params(range);
        let avg: Option<f64> = self.conn().query_row(
            "SELECT AVG((qualified_at - registered_at) / 86400.0)
             FROM referrals
             WHERE qualified_at IS NOT NULL AND registered_at IS NOT NULL
               AND (?1 IS NULL OR created_at >= ?1)
               AND (?2 IS NULL OR created_at <= ?2)",
            params![start, end],
            |row| row.get(0),
        )?;
        Ok(avg)
    }

    /// Referral counts grouped by share method, descending.
    pub fn source_breakdown(&self, range: &DateRange) -> ReferralResult<Vec<(String, i64)>> {
        let (start, end) = range_params(range);
        let mut stmt = self.conn().prepare(
            "SELECT COALESCE(share_method, 'unknown'), COUNT(*)
             FROM referrals
             WHERE (?1 IS NULL OR created_at >= ?1)
               AND (?2 IS NULL OR created_at <= ?2)
             GROUP BY COALESCE(share_method, 'unknown')
             ORDER BY COUNT(*) DESC, 1 ASC",
        )?;
        let rows = stmt
            .query_map(params![start, end], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Top referrers by qualified-referral count. Ties break on
    /// ascending referrer id so the ordering is stable.
    pub fn leaderboard(&self, limit: u32) -> ReferralResult<Vec<LeaderboardRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT r.referrer_id,
                    COUNT(*) AS qualified_count,
                    COALESCE(SUM(
                        CASE WHEN r.referrer_rewarded THEN r.referrer_amount ELSE 0 END
                        + CASE WHEN r.milestone_rewarded
                               THEN COALESCE(r.milestone_bonus, 0) ELSE 0 END), 0),
                    u.referral_tier
             FROM referrals r
             JOIN users u ON u.user_id = r.referrer_id
             WHERE r.status IN ('qualified', 'completed')
             GROUP BY r.referrer_id
             ORDER BY qualified_count DESC, r.referrer_id ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(LeaderboardRow {
                    user_id: row.get(0)?,
                    qualified_referrals: row.get(1)?,
                    lifetime_earnings: row.get(2)?,
                    tier: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// 1-based dense rank: 1 + the number of referrers with strictly
    /// more qualified referrals. A user with zero qualified referrals
    /// still gets a rank.
    pub fn leaderboard_rank(&self, user_id: &str) -> ReferralResult<(i64, i64)> {
        let own: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM referrals
             WHERE referrer_id = ?1 AND status IN ('qualified', 'completed')",
            params![user_id],
            |row| row.get(0),
        )?;
        let ahead: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM (
                SELECT referrer_id FROM referrals
                WHERE status IN ('qualified', 'completed')
                GROUP BY referrer_id
                HAVING COUNT(*) > ?1
             )",
            params![own],
            |row| row.get(0),
        )?;
        Ok((ahead + 1, own))
    }

    /// One referrer's referral counts and earnings. REGISTERED rolls
    /// into `pending` because nothing has been earned from it yet.
    pub fn referral_stats(&self, referrer_id: &str) -> ReferralResult<ReferralStats> {
        let stats = self.conn().query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status IN ('pending', 'registered')), 0),
                    COALESCE(SUM(status = 'active'), 0),
                    COALESCE(SUM(status = 'qualified'), 0),
                    COALESCE(SUM(status = 'completed'), 0),
                    COALESCE(SUM(status = 'expired'), 0),
                    COALESCE(SUM(
                        CASE WHEN referrer_rewarded THEN referrer_amount ELSE 0 END
                        + CASE WHEN milestone_rewarded
                               THEN COALESCE(milestone_bonus, 0) ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status != 'expired' THEN
                        CASE WHEN referrer_rewarded THEN 0 ELSE referrer_amount END
                        + CASE WHEN milestone_rewarded
                               THEN 0 ELSE COALESCE(milestone_bonus, 0) END
                    ELSE 0 END), 0)
             FROM referrals WHERE referrer_id = ?1",
            params![referrer_id],
            |row| {
                Ok(ReferralStats {
                    total: row.get(0)?,
                    pending: row.get(1)?,
                    active: row.get(2)?,
                    qualified: row.get(3)?,
                    completed: row.get(4)?,
                    expired: row.get(5)?,
                    total_earned: row.get(6)?,
                    pending_earnings: row.get(7)?,
                })
            },
        )?;
        Ok(stats)
    }

    // ── Risk verdicts ──────────────────────────────────────────

    pub fn insert_risk_review(&self, row: &RiskReviewRow) -> ReferralResult<()> {
        self.conn().execute(
            "INSERT INTO risk_review
                (referral_id, referrer_id, referee_id, risk_score, reasons, action, assessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.referral_id.as_deref(),
                &row.referrer_id,
                &row.referee_id,
                row.risk_score,
                &row.reasons,
                &row.action,
                to_ts(row.assessed_at),
            ],
        )?;
        Ok(())
    }

    pub fn risk_reviews_by_action(&self, action: &str) -> ReferralResult<Vec<RiskReviewRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, referral_id, referrer_id, referee_id, risk_score,
                    reasons, action, assessed_at
             FROM risk_review WHERE action = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![action], |row| {
                Ok(RiskReviewRow {
                    id: Some(row.get(0)?),
                    referral_id: row.get(1)?,
                    referrer_id: row.get(2)?,
                    referee_id: row.get(3)?,
                    risk_score: row.get(4)?,
                    reasons: row.get(5)?,
                    action: row.get(6)?,
                    assessed_at: from_ts(row.get(7)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn risk_review_count(&self, action: &str) -> ReferralResult<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM risk_review WHERE action = ?1",
            params![action],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
