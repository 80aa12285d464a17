//! Shared domain types used across the referral engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReferralError, ReferralResult};

/// Stable identifier of a user (referrer or referee).
pub type UserId = String;
/// Stable identifier of a referral record.
pub type ReferralId = String;
/// Stable identifier of an order.
pub type OrderId = String;

/// Lifecycle state of a referral. Transitions are forward-only, with
/// EXPIRED as the terminal escape hatch from any non-terminal state.
/// The canonical model is six states: COMPLETED is distinct from
/// QUALIFIED and is entered once every applicable reward flag settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Pending,
    Registered,
    Active,
    Qualified,
    Completed,
    Expired,
}

impl ReferralStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferralStatus::Pending => "pending",
            ReferralStatus::Registered => "registered",
            ReferralStatus::Active => "active",
            ReferralStatus::Qualified => "qualified",
            ReferralStatus::Completed => "completed",
            ReferralStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> ReferralResult<Self> {
        match s {
            "pending" => Ok(ReferralStatus::Pending),
            "registered" => Ok(ReferralStatus::Registered),
            "active" => Ok(ReferralStatus::Active),
            "qualified" => Ok(ReferralStatus::Qualified),
            "completed" => Ok(ReferralStatus::Completed),
            "expired" => Ok(ReferralStatus::Expired),
            other => Err(ReferralError::Validation(format!(
                "unknown referral status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReferralStatus::Completed | ReferralStatus::Expired)
    }
}

impl std::fmt::Display for ReferralStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order statuses that count toward qualification.
pub const COUNTABLE_ORDER_STATUSES: &[&str] = &["delivered", "completed"];
/// Order statuses that disqualify a whole qualification window.
pub const DISQUALIFYING_ORDER_STATUSES: &[&str] = &["cancelled", "returned", "refunded"];

/// Program criteria a referee must satisfy inside the qualification window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualificationCriteria {
    pub min_orders: u32,
    pub min_spend: f64,
    pub timeframe_days: u32,
}

impl QualificationCriteria {
    pub fn validate(&self) -> ReferralResult<()> {
        if self.timeframe_days == 0 {
            return Err(ReferralError::Validation(
                "qualification timeframe_days must be > 0".into(),
            ));
        }
        if self.min_spend < 0.0 {
            return Err(ReferralError::Validation(
                "qualification min_spend must be >= 0".into(),
            ));
        }
        Ok(())
    }
}

/// Reward amounts attached to a single referral, set from the referrer's
/// tier at creation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardBundle {
    pub referrer_amount: f64,
    pub referee_discount: f64,
    pub milestone_bonus: Option<f64>,
    pub voucher_code: Option<String>,
    pub voucher_type: Option<String>,
}

/// Free-form signal bag attached to a referral event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferralMetadata {
    pub share_method: Option<String>,
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub referee_first_order_at: Option<DateTime<Utc>>,
    pub milestone_orders: u32,
    pub fraud_flag: bool,
    pub fraud_reason: Option<String>,
    pub flagged_at: Option<DateTime<Utc>>,
}

/// The central entity: one referrer/referee relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Referral {
    pub referral_id: ReferralId,
    pub referrer_id: UserId,
    pub referee_id: UserId,
    pub referral_code: String,
    pub status: ReferralStatus,
    pub registered_at: Option<DateTime<Utc>>,
    pub qualified_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub criteria: QualificationCriteria,
    pub rewards: RewardBundle,
    pub referrer_rewarded: bool,
    pub referee_rewarded: bool,
    pub milestone_rewarded: bool,
    /// Tier the referrer held when this referral was created. Advisory
    /// only; the tier manager recomputes authoritatively.
    pub tier: String,
    pub metadata: ReferralMetadata,
    pub created_at: DateTime<Utc>,
}

impl Referral {
    /// True once every reward flag that applies to this referral settled.
    pub fn all_rewards_settled(&self) -> bool {
        self.referrer_rewarded
            && self.referee_rewarded
            && (self.rewards.milestone_bonus.is_none() || self.milestone_rewarded)
    }
}

/// Verdict of the fraud scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskAction {
    Allow,
    Review,
    Block,
}

impl RiskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskAction::Allow => "allow",
            RiskAction::Review => "review",
            RiskAction::Block => "block",
        }
    }
}

/// Additive 0-100 risk estimate with per-signal reasons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_score: u32,
    pub reasons: Vec<String>,
    pub action: RiskAction,
}

impl RiskAssessment {
    pub fn is_fraud(&self) -> bool {
        self.action == RiskAction::Block
    }
}

/// Reward bundle granted once when a tier is first reached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierRewards {
    pub tier_bonus: f64,
    pub voucher: Option<String>,
    #[serde(default)]
    pub lifetime_premium: bool,
}

/// Per-referral reward amounts granted while the referrer holds a tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerReferralRewards {
    pub referrer_amount: f64,
    pub referee_discount: f64,
    pub milestone_bonus: f64,
}

/// One entry of the static tier catalog. `referrals_required` is
/// monotonically increasing across the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierDef {
    pub name: String,
    pub referrals_required: u32,
    pub upgrade: TierRewards,
    pub per_referral: PerReferralRewards,
}

/// Consumed collaborator record: account data the scorer and tier
/// manager read, plus the CAS-written `referral_tier` field.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub user_id: UserId,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub referral_code: Option<String>,
    pub referral_tier: String,
    pub wallet_balance: f64,
    pub is_premium: bool,
    pub premium_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Consumed collaborator record: one order of a referee.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub amount: f64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Optional date range for the analytics aggregator. Both bounds are
/// inclusive; a missing bound leaves that side unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }
}
