//! Read-side program metrics. Everything here is computed from store
//! queries; nothing mutates referral or user state.

use serde::Serialize;

use crate::{
    error::ReferralResult,
    store::{FunnelCounts, LeaderboardRow, ReferralStore},
    types::DateRange,
};

/// One funnel stage with its count and its share of the created stage.
#[derive(Debug, Clone, Serialize)]
pub struct FunnelStage {
    pub stage: &'static str,
    pub count: i64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunnelReport {
    pub stages: Vec<FunnelStage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceCount {
    pub share_method: String,
    pub referrals: i64,
}

/// Position of one referrer on the leaderboard.
#[derive(Debug, Clone, Serialize)]
pub struct RankReport {
    pub rank: i64,
    pub qualified_referrals: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsReport {
    pub funnel: FunnelReport,
    pub total_users: i64,
    pub qualified_referrals: i64,
    /// Qualified-or-completed referrals per existing user.
    pub k_factor: f64,
    pub rewards_paid: f64,
    /// Reward payout per qualified referral. None with no qualified referrals.
    pub cac: Option<f64>,
    /// Average countable order value per qualified referral.
    pub ltv: Option<f64>,
    pub avg_days_to_qualification: Option<f64>,
    pub source_breakdown: Vec<SourceCount>,
}

pub struct Analytics<'a> {
    store: &'a ReferralStore,
}

impl<'a> Analytics<'a> {
    pub fn new(store: &'a ReferralStore) -> Self {
        Self { store }
    }

    /// Funnel percentages are relative to the created stage and are
    /// monotone non-increasing because the counts are cumulative.
    pub fn funnel(&self, range: &DateRange) -> ReferralResult<FunnelReport> {
        let counts = self.store.funnel_counts(range)?;
        Ok(FunnelReport {
            stages: build_stages(&counts),
        })
    }

    pub fn metrics(&self, range: &DateRange) -> ReferralResult<AnalyticsReport> {
        let counts = self.store.funnel_counts(range)?;
        let total_users = self.store.user_count(range.start, range.end)?;
        let qualified = self.store.qualified_or_completed_count(range)?;
        let rewards_paid = self.store.rewards_paid_total(range)?;
        let ltv = self.store.ltv_per_referral(range)?;
        let avg_days = self.store.avg_days_to_qualification(range)?;
        let sources = self.store.source_breakdown(range)?;

        let k_factor = if total_users > 0 {
            qualified as f64 / total_users as f64
        } else {
            0.0
        };
        let cac = if qualified > 0 {
            Some(rewards_paid / qualified as f64)
        } else {
            None
        };

        Ok(AnalyticsReport {
            funnel: FunnelReport {
                stages: build_stages(&counts),
            },
            total_users,
            qualified_referrals: qualified,
            k_factor,
            rewards_paid,
            cac,
            ltv,
            avg_days_to_qualification: avg_days,
            source_breakdown: sources
                .into_iter()
                .map(|(share_method, referrals)| SourceCount {
                    share_method,
                    referrals,
                })
                .collect(),
        })
    }

    pub fn leaderboard(&self, limit: u32) -> ReferralResult<Vec<LeaderboardRow>> {
        self.store.leaderboard(limit)
    }

    /// 1 + the number of referrers with strictly more qualified referrals.
    pub fn rank(&self, user_id: &str) -> ReferralResult<RankReport> {
        let (rank, qualified_referrals) = self.store.leaderboard_rank(user_id)?;
        Ok(RankReport {
            rank,
            qualified_referrals,
        })
    }
}

fn build_stages(counts: &FunnelCounts) -> Vec<FunnelStage> {
    let pct = |count: i64| {
        if counts.created > 0 {
            count as f64 / counts.created as f64 * 100.0
        } else {
            0.0
        }
    };
    vec![
        FunnelStage {
            stage: "created",
            count: counts.created,
            percent: pct(counts.created),
        },
        FunnelStage {
            stage: "registered",
            count: counts.registered,
            percent: pct(counts.registered),
        },
        FunnelStage {
            stage: "first_order",
            count: counts.first_order,
            percent: pct(counts.first_order),
        },
        FunnelStage {
            stage: "qualified",
            count: counts.qualified,
            percent: pct(counts.qualified),
        },
        FunnelStage {
            stage: "completed",
            count: counts.completed,
            percent: pct(counts.completed),
        },
    ]
}
