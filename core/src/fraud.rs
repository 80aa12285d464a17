//! Additive multi-signal fraud scoring.
//!
//! Each signal is independent evidence of a distinct attack pattern.
//! The score is the sum of triggered weights clamped to [0, 100];
//! thresholds map the score to allow / review / block. The signal
//! table is data so new signals slot in without touching control flow.

use chrono::{DateTime, Duration, Utc};

use crate::{
    config::FraudConfig,
    error::{ReferralError, ReferralResult},
    store::ReferralStore,
    types::{ReferralMetadata, RiskAction, RiskAssessment, UserRecord},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalKind {
    SelfReferral,
    SharedDeviceOrIp,
    SuspiciousNewAccount,
    ReferralVelocity,
    VeryNewAccount,
    CircularReferral,
    CorrelatedEmail,
}

impl SignalKind {
    fn reason(&self) -> &'static str {
        match self {
            SignalKind::SelfReferral => "self_referral",
            SignalKind::SharedDeviceOrIp => "shared_device_or_ip",
            SignalKind::SuspiciousNewAccount => "suspicious_new_account",
            SignalKind::ReferralVelocity => "referral_velocity",
            SignalKind::VeryNewAccount => "very_new_account",
            SignalKind::CircularReferral => "circular_referral",
            SignalKind::CorrelatedEmail => "correlated_email",
        }
    }
}

/// Everything the signal predicates need, gathered in one read pass so
/// scoring itself touches no storage.
struct SignalContext {
    self_referral: bool,
    device_or_ip_reused: bool,
    referee_no_contact_never_logged_in: bool,
    recent_referral_count: i64,
    referee_age_minutes: i64,
    circular: bool,
    correlated_email: bool,
}

pub struct FraudScorer<'a> {
    store: &'a ReferralStore,
    config: &'a FraudConfig,
}

impl<'a> FraudScorer<'a> {
    pub fn new(store: &'a ReferralStore, config: &'a FraudConfig) -> Self {
        Self { store, config }
    }

    /// Score a referral candidate. Pure with respect to storage: the
    /// caller decides what to do with the verdict.
    pub fn assess(
        &self,
        referrer_id: &str,
        referee_id: &str,
        metadata: &ReferralMetadata,
        now: DateTime<Utc>,
    ) -> ReferralResult<RiskAssessment> {
        let ctx = self.gather(referrer_id, referee_id, metadata, now)?;
        let w = &self.config.weights;
        let table: &[(SignalKind, u32)] = &[
            (SignalKind::SelfReferral, w.self_referral),
            (SignalKind::SharedDeviceOrIp, w.shared_device_or_ip),
            (SignalKind::SuspiciousNewAccount, w.suspicious_new_account),
            (SignalKind::ReferralVelocity, w.referral_velocity),
            (SignalKind::VeryNewAccount, w.very_new_account),
            (SignalKind::CircularReferral, w.circular_referral),
            (SignalKind::CorrelatedEmail, w.correlated_email),
        ];

        let mut score: u32 = 0;
        let mut reasons = Vec::new();
        for (kind, weight) in table {
            if self.triggered(*kind, &ctx) {
                score = score.saturating_add(*weight);
                reasons.push(kind.reason().to_string());
            }
        }
        let score = score.min(100);

        let action = if score >= self.config.block_threshold {
            RiskAction::Block
        } else if score >= self.config.review_threshold {
            RiskAction::Review
        } else {
            RiskAction::Allow
        };

        Ok(RiskAssessment {
            risk_score: score,
            reasons,
            action,
        })
    }

    fn triggered(&self, kind: SignalKind, ctx: &SignalContext) -> bool {
        match kind {
            SignalKind::SelfReferral => ctx.self_referral,
            SignalKind::SharedDeviceOrIp => ctx.device_or_ip_reused,
            SignalKind::SuspiciousNewAccount => ctx.referee_no_contact_never_logged_in,
            SignalKind::ReferralVelocity => {
                ctx.recent_referral_count > self.config.velocity_max_referrals
            }
            SignalKind::VeryNewAccount => {
                ctx.referee_age_minutes < self.config.new_account_age_minutes
            }
            SignalKind::CircularReferral => ctx.circular,
            SignalKind::CorrelatedEmail => ctx.correlated_email,
        }
    }

    fn gather(
        &self,
        referrer_id: &str,
        referee_id: &str,
        metadata: &ReferralMetadata,
        now: DateTime<Utc>,
    ) -> ReferralResult<SignalContext> {
        let self_referral = referrer_id == referee_id;

        let referrer = self
            .store
            .get_user(referrer_id)?
            .ok_or_else(|| ReferralError::NotFound {
                entity: "user",
                id: referrer_id.to_string(),
            })?;
        // On self-referral the referee lookup is the same record.
        let referee = if self_referral {
            referrer.clone()
        } else {
            self.store
                .get_user(referee_id)?
                .ok_or_else(|| ReferralError::NotFound {
                    entity: "user",
                    id: referee_id.to_string(),
                })?
        };

        let device_or_ip_reused = if metadata.device_id.is_some() || metadata.ip_address.is_some() {
            self.store.device_or_ip_reused(
                referrer_id,
                metadata.device_id.as_deref(),
                metadata.ip_address.as_deref(),
                referee_id,
            )?
        } else {
            false
        };

        let since = now - Duration::hours(self.config.velocity_window_hours);
        let recent_referral_count = self.store.referral_count_since(referrer_id, since)?;

        let circular = !self_referral
            && self
                .store
                .circular_referral_exists(referrer_id, referee_id)?;

        Ok(SignalContext {
            self_referral,
            device_or_ip_reused,
            referee_no_contact_never_logged_in: referee.email.is_none()
                && referee.phone.is_none()
                && referee.last_login_at.is_none(),
            recent_referral_count,
            referee_age_minutes: (now - referee.created_at).num_minutes(),
            circular,
            correlated_email: !self_referral && self.emails_correlated(&referrer, &referee),
        })
    }

    /// Shared non-public domain, or identical local parts once a
    /// trailing numeric suffix is stripped (alice@x.com vs alice2@y.com).
    fn emails_correlated(&self, referrer: &UserRecord, referee: &UserRecord) -> bool {
        let (Some(a), Some(b)) = (referrer.email.as_deref(), referee.email.as_deref()) else {
            return false;
        };
        let (Some((la, da)), Some((lb, db))) = (split_email(a), split_email(b)) else {
            return false;
        };
        if da == db && !self.is_public_domain(&da) {
            return true;
        }
        let base_a = strip_numeric_suffix(&la);
        let base_b = strip_numeric_suffix(&lb);
        !base_a.is_empty() && base_a == base_b
    }

    fn is_public_domain(&self, domain: &str) -> bool {
        self.config
            .public_email_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
    }
}

fn split_email(email: &str) -> Option<(String, String)> {
    let (local, domain) = email.rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some((local.to_ascii_lowercase(), domain.to_ascii_lowercase()))
}

fn strip_numeric_suffix(local: &str) -> &str {
    local.trim_end_matches(|c: char| c.is_ascii_digit())
}
