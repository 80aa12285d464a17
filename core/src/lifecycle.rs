//! Referral lifecycle state machine.
//!
//! Transitions are forward-only. EXPIRED is reachable from every
//! non-terminal state; nothing leaves COMPLETED or EXPIRED.

use chrono::{DateTime, Utc};

use crate::{
    error::{ReferralError, ReferralResult},
    store::ReferralStore,
    types::ReferralStatus,
};

/// Legal forward transitions. EXPIRED is handled separately by
/// [`expire`] because it is reachable from several states.
pub fn can_transition(from: ReferralStatus, to: ReferralStatus) -> bool {
    use ReferralStatus::*;
    matches!(
        (from, to),
        (Pending, Registered)
            | (Registered, Active)
            | (Active, Qualified)
            | (Qualified, Completed)
    ) || (to == Expired && !from.is_terminal())
}

/// Advance a referral from `from` to `to` with optimistic concurrency:
/// the stored status must still equal `from` or the attempt is rejected
/// as stale. The lifecycle timestamp for `to` is stamped at most once.
pub fn advance(
    store: &ReferralStore,
    referral_id: &str,
    from: ReferralStatus,
    to: ReferralStatus,
    now: DateTime<Utc>,
) -> ReferralResult<()> {
    if !can_transition(from, to) {
        return Err(ReferralError::InvalidTransition {
            referral_id: referral_id.to_string(),
            from,
            to,
        });
    }
    if store.cas_status(referral_id, from, to, now)? {
        Ok(())
    } else {
        // Stored status moved since the caller read it.
        Err(ReferralError::InvalidTransition {
            referral_id: referral_id.to_string(),
            from,
            to,
        })
    }
}

/// Expire a referral from any non-terminal state, stamping fraud
/// annotations when a reason is supplied. Returns false if the referral
/// was already terminal.
pub fn expire(
    store: &ReferralStore,
    referral_id: &str,
    fraud_reason: Option<&str>,
    now: DateTime<Utc>,
) -> ReferralResult<bool> {
    store.expire_referral(referral_id, fraud_reason, now)
}
