//! Tier computation, progress, and the CAS-gated upgrade path.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    config::ProgramConfig,
    error::ReferralResult,
    event::{event_type_name, EventLogEntry, ReferralEvent},
    store::ReferralStore,
    types::TierDef,
    voucher::VoucherProvider,
};

/// Progress toward the next tier.
#[derive(Debug, Clone, Serialize)]
pub struct TierProgress {
    pub current_tier: String,
    pub next_tier: Option<String>,
    pub qualified_referrals: i64,
    pub referrals_needed: u32,
    pub percent: f64,
}

/// A tier upgrade that was actually applied.
#[derive(Debug, Clone, Serialize)]
pub struct TierUpgrade {
    pub from_tier: String,
    pub to_tier: String,
    pub tier_bonus: f64,
    pub voucher_code: Option<String>,
    pub voucher_type: Option<String>,
    pub lifetime_premium: bool,
}

pub struct TierManager<'a> {
    store: &'a ReferralStore,
    config: &'a ProgramConfig,
}

impl<'a> TierManager<'a> {
    pub fn new(store: &'a ReferralStore, config: &'a ProgramConfig) -> Self {
        Self { store, config }
    }

    /// Highest tier whose requirement the count satisfies. Scanned from
    /// the top because tiers are cumulative thresholds, not buckets.
    pub fn tier_for_count(&self, qualified_count: i64) -> &'a TierDef {
        self.config
            .tiers
            .iter()
            .rev()
            .find(|t| qualified_count >= i64::from(t.referrals_required))
            .unwrap_or_else(|| self.config.lowest_tier())
    }

    /// Effective tier from the lifetime qualified-referral count.
    pub fn current_tier(&self, referrer_id: &str) -> ReferralResult<&'a TierDef> {
        let count = self.store.qualified_referral_count(referrer_id)?;
        Ok(self.tier_for_count(count))
    }

    /// Linear interpolation between the current and next thresholds.
    pub fn progress(&self, referrer_id: &str) -> ReferralResult<TierProgress> {
        let count = self.store.qualified_referral_count(referrer_id)?;
        let current = self.tier_for_count(count);
        let current_idx = self.config.tier_index(&current.name);
        let next = self.config.tiers.get(current_idx + 1);

        let (percent, needed) = match next {
            None => (100.0, 0),
            Some(next) => {
                let floor = f64::from(current.referrals_required);
                let ceil = f64::from(next.referrals_required);
                let pct = ((count as f64 - floor) / (ceil - floor) * 100.0).clamp(0.0, 100.0);
                let needed = i64::from(next.referrals_required) - count;
                (pct, needed.max(0) as u32)
            }
        };

        Ok(TierProgress {
            current_tier: current.name.clone(),
            next_tier: next.map(|t| t.name.clone()),
            qualified_referrals: count,
            referrals_needed: needed,
            percent,
        })
    }

    /// Recompute the tier and, if the stored tier lags, apply the
    /// upgrade. The CAS on `users.referral_tier` is the gate: of two
    /// concurrent calls with the same stale tier, exactly one wins and
    /// issues the reward bundle. Returns None when nothing changed or
    /// this caller lost the race.
    ///
    /// The voucher is minted before the CAS so a provider failure
    /// leaves the stored tier untouched and the upgrade retryable. A
    /// minted code is written onto `trigger_referral` inside the same
    /// transaction as the CAS, so it stays claimable.
    pub fn check_and_upgrade(
        &self,
        referrer_id: &str,
        trigger_referral: Option<&str>,
        voucher: &mut dyn VoucherProvider,
        now: DateTime<Utc>,
    ) -> ReferralResult<Option<TierUpgrade>> {
        let user = match self.store.get_user(referrer_id)? {
            Some(u) => u,
            None => {
                return Err(crate::error::ReferralError::NotFound {
                    entity: "user",
                    id: referrer_id.to_string(),
                })
            }
        };

        let computed = self.current_tier(referrer_id)?;
        let stored_idx = self.config.tier_index(&user.referral_tier);
        let computed_idx = self.config.tier_index(&computed.name);
        if computed_idx <= stored_idx {
            return Ok(None);
        }

        let voucher_type = computed.upgrade.voucher.clone();
        let voucher_code = match &voucher_type {
            Some(vt) => Some(voucher.mint(vt, &user.user_id)?),
            None => None,
        };

        let applied = self.store.award_tier_upgrade(
            referrer_id,
            &user.referral_tier,
            &computed.name,
            computed.upgrade.tier_bonus,
            computed.upgrade.lifetime_premium,
            trigger_referral,
            voucher_code.as_deref(),
            voucher_type.as_deref(),
        )?;
        if !applied {
            // A concurrent call already moved the tier forward.
            return Ok(None);
        }

        let upgrade = TierUpgrade {
            from_tier: user.referral_tier.clone(),
            to_tier: computed.name.clone(),
            tier_bonus: computed.upgrade.tier_bonus,
            voucher_code,
            voucher_type,
            lifetime_premium: computed.upgrade.lifetime_premium,
        };

        let event = ReferralEvent::TierUpgraded {
            user_id: referrer_id.to_string(),
            from_tier: upgrade.from_tier.clone(),
            to_tier: upgrade.to_tier.clone(),
            tier_bonus: upgrade.tier_bonus,
            voucher_code: upgrade.voucher_code.clone(),
            voucher_type: upgrade.voucher_type.clone(),
        };
        self.store.append_event(&EventLogEntry {
            id: None,
            referral_id: None,
            event_type: event_type_name(&event).to_string(),
            payload: serde_json::to_string(&event)?,
            created_at: now,
        })?;

        Ok(Some(upgrade))
    }
}
