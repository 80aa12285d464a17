//! Qualification evaluation over the referee's order window.

use chrono::Duration;

use crate::{
    error::{ReferralError, ReferralResult},
    store::ReferralStore,
    types::Referral,
};

/// Outcome of one evaluation pass. `window_spend` and `window_orders`
/// are reported for diagnostics even when not qualified.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualificationOutcome {
    pub qualified: bool,
    pub window_orders: i64,
    pub window_spend: f64,
    pub disqualifying_orders: i64,
}

/// Check whether the referee's order history satisfies the referral's
/// criteria inside `[registered_at, registered_at + timeframe_days]`.
///
/// Conservative on two fronts: any cancelled, returned, or refunded
/// order inside the window disqualifies the whole window, and errors
/// (missing referee, unregistered referral) never qualify. Idempotent
/// for already-qualified referrals.
pub fn evaluate(store: &ReferralStore, referral: &Referral) -> ReferralResult<QualificationOutcome> {
    // Already past the gate: report qualified without re-reading orders.
    if matches!(
        referral.status,
        crate::types::ReferralStatus::Qualified | crate::types::ReferralStatus::Completed
    ) {
        return Ok(QualificationOutcome {
            qualified: true,
            window_orders: 0,
            window_spend: 0.0,
            disqualifying_orders: 0,
        });
    }

    let registered_at = referral
        .registered_at
        .ok_or_else(|| ReferralError::Validation(format!(
            "referral {} has no registration timestamp",
            referral.referral_id
        )))?;
    referral.criteria.validate()?;

    if store.get_user(&referral.referee_id)?.is_none() {
        return Err(ReferralError::NotFound {
            entity: "user",
            id: referral.referee_id.clone(),
        });
    }

    let window_end = registered_at + Duration::days(i64::from(referral.criteria.timeframe_days));
    let (count, spend) =
        store.countable_orders_in_window(&referral.referee_id, registered_at, window_end)?;
    let disqualifying = store.disqualifying_order_count_in_window(
        &referral.referee_id,
        registered_at,
        window_end,
    )?;

    let qualified = count >= i64::from(referral.criteria.min_orders)
        && spend >= referral.criteria.min_spend
        && disqualifying == 0;

    Ok(QualificationOutcome {
        qualified,
        window_orders: count,
        window_spend: spend,
        disqualifying_orders: disqualifying,
    })
}
