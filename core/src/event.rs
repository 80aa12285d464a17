//! Audit events, the append-only attribution log.
//!
//! Every state change the engine performs is recorded as one of these,
//! serialized into the `event_log` table keyed by referral. Nothing in
//! the engine reads events back to make decisions; they exist for
//! operators, attribution reporting, and tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{OrderId, ReferralId, ReferralStatus, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReferralEvent {
    ReferralRecorded {
        referral_id: ReferralId,
        referrer_id: UserId,
        referee_id: UserId,
        referral_code: String,
    },
    ReferralBlocked {
        referral_id: ReferralId,
        risk_score: u32,
        reasons: Vec<String>,
    },
    ReferralFlagged {
        referral_id: ReferralId,
        risk_score: u32,
        reasons: Vec<String>,
    },
    StatusAdvanced {
        referral_id: ReferralId,
        from: ReferralStatus,
        to: ReferralStatus,
    },
    FirstOrderPlaced {
        referral_id: ReferralId,
        order_id: OrderId,
        amount: f64,
    },
    ReferralQualified {
        referral_id: ReferralId,
        qualified_at: DateTime<Utc>,
    },
    RewardIssued {
        referral_id: ReferralId,
        user_id: UserId,
        kind: String,
        amount: f64,
    },
    MilestoneReached {
        referral_id: ReferralId,
        order_count: u32,
        bonus: f64,
    },
    TierUpgraded {
        user_id: UserId,
        from_tier: String,
        to_tier: String,
        tier_bonus: f64,
        voucher_code: Option<String>,
        voucher_type: Option<String>,
    },
    ReferralExpired {
        referral_id: ReferralId,
        reason: String,
    },
}

impl ReferralEvent {
    /// Referral this event belongs to, if any. Tier upgrades are keyed
    /// by user, not referral.
    pub fn referral_id(&self) -> Option<&str> {
        match self {
            ReferralEvent::ReferralRecorded { referral_id, .. }
            | ReferralEvent::ReferralBlocked { referral_id, .. }
            | ReferralEvent::ReferralFlagged { referral_id, .. }
            | ReferralEvent::StatusAdvanced { referral_id, .. }
            | ReferralEvent::FirstOrderPlaced { referral_id, .. }
            | ReferralEvent::ReferralQualified { referral_id, .. }
            | ReferralEvent::RewardIssued { referral_id, .. }
            | ReferralEvent::MilestoneReached { referral_id, .. }
            | ReferralEvent::ReferralExpired { referral_id, .. } => Some(referral_id),
            ReferralEvent::TierUpgraded { .. } => None,
        }
    }
}

/// Stable string name for the event_type column.
pub fn event_type_name(event: &ReferralEvent) -> &'static str {
    match event {
        ReferralEvent::ReferralRecorded { .. } => "referral_recorded",
        ReferralEvent::ReferralBlocked { .. } => "referral_blocked",
        ReferralEvent::ReferralFlagged { .. } => "referral_flagged",
        ReferralEvent::StatusAdvanced { .. } => "status_advanced",
        ReferralEvent::FirstOrderPlaced { .. } => "first_order_placed",
        ReferralEvent::ReferralQualified { .. } => "referral_qualified",
        ReferralEvent::RewardIssued { .. } => "reward_issued",
        ReferralEvent::MilestoneReached { .. } => "milestone_reached",
        ReferralEvent::TierUpgraded { .. } => "tier_upgraded",
        ReferralEvent::ReferralExpired { .. } => "referral_expired",
    }
}

/// One persisted row of the event log.
#[derive(Debug, Clone)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub referral_id: Option<ReferralId>,
    pub event_type: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}
