//! The referral engine: orchestrates fraud scoring, the lifecycle
//! state machine, qualification, rewards, and tier upgrades against
//! one store. Analytics runs read-only off the same store.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::{
    analytics::{Analytics, AnalyticsReport, FunnelReport, RankReport},
    clock::{Clock, ManualClock, SystemClock},
    config::ProgramConfig,
    error::{ReferralError, ReferralResult},
    event::{event_type_name, EventLogEntry, ReferralEvent},
    fraud::FraudScorer,
    lifecycle,
    qualification,
    store::{LeaderboardRow, ReferralStats, ReferralStore, RiskReviewRow},
    tier::{TierManager, TierProgress},
    types::{
        DateRange, QualificationCriteria, Referral, ReferralId, ReferralMetadata, ReferralStatus,
        RewardBundle, RiskAction, RiskAssessment,
    },
    voucher::{CodeVoucherProvider, VoucherProvider},
};

/// Result of recording a referral: accepted referrals carry their
/// verdict (allow or review), rejected ones were persisted EXPIRED.
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Accepted {
        referral_id: ReferralId,
        assessment: RiskAssessment,
    },
    Rejected {
        referral_id: ReferralId,
        assessment: RiskAssessment,
    },
}

impl RecordOutcome {
    pub fn referral_id(&self) -> &str {
        match self {
            RecordOutcome::Accepted { referral_id, .. }
            | RecordOutcome::Rejected { referral_id, .. } => referral_id,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, RecordOutcome::Accepted { .. })
    }
}

pub struct ReferralEngine {
    pub store: ReferralStore,
    config: ProgramConfig,
    clock: Box<dyn Clock>,
    voucher: Box<dyn VoucherProvider>,
}

impl ReferralEngine {
    pub fn new(store: ReferralStore, config: ProgramConfig) -> Self {
        Self {
            store,
            config,
            clock: Box::new(SystemClock),
            voucher: Box::new(CodeVoucherProvider::new(rand::random())),
        }
    }

    /// Inject the clock and voucher provider (tests, simulations).
    pub fn with_parts(
        store: ReferralStore,
        config: ProgramConfig,
        clock: Box<dyn Clock>,
        voucher: Box<dyn VoucherProvider>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            voucher,
        }
    }

    /// In-memory engine with a deterministic clock and voucher seed.
    pub fn build_test() -> ReferralResult<(Self, ManualClock)> {
        let store = ReferralStore::in_memory()?;
        store.migrate()?;
        let clock = ManualClock::at_test_epoch();
        let engine = Self::with_parts(
            store,
            ProgramConfig::default(),
            Box::new(clock.clone()),
            Box::new(CodeVoucherProvider::new(7)),
        );
        Ok((engine, clock))
    }

    pub fn config(&self) -> &ProgramConfig {
        &self.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn log_event(&self, event: &ReferralEvent) -> ReferralResult<()> {
        self.store.append_event(&EventLogEntry {
            id: None,
            referral_id: event.referral_id().map(|s| s.to_string()),
            event_type: event_type_name(event).to_string(),
            payload: serde_json::to_string(event)?,
            created_at: self.now(),
        })
    }

    fn persist_verdict(
        &self,
        referral_id: Option<&str>,
        referrer_id: &str,
        referee_id: &str,
        assessment: &RiskAssessment,
    ) -> ReferralResult<()> {
        self.store.insert_risk_review(&RiskReviewRow {
            id: None,
            referral_id: referral_id.map(|s| s.to_string()),
            referrer_id: referrer_id.to_string(),
            referee_id: referee_id.to_string(),
            risk_score: assessment.risk_score,
            reasons: serde_json::to_string(&assessment.reasons)?,
            action: assessment.action.as_str().to_string(),
            assessed_at: self.now(),
        })
    }

    // ── Fraud ──────────────────────────────────────────────────

    /// Score a candidate without persisting anything.
    pub fn assess_referral(
        &self,
        referrer_id: &str,
        referee_id: &str,
        metadata: &ReferralMetadata,
    ) -> ReferralResult<RiskAssessment> {
        FraudScorer::new(&self.store, &self.config.fraud).assess(
            referrer_id,
            referee_id,
            metadata,
            self.now(),
        )
    }

    /// Manual fraud override for review-flagged referrals: expires the
    /// referral and stamps the reason.
    pub fn mark_fraud(&self, referral_id: &str, reason: &str) -> ReferralResult<()> {
        let referral = self.referral(referral_id)?;
        if !lifecycle::expire(&self.store, referral_id, Some(reason), self.now())? {
            return Err(ReferralError::InvalidTransition {
                referral_id: referral_id.to_string(),
                from: referral.status,
                to: ReferralStatus::Expired,
            });
        }
        self.log_event(&ReferralEvent::ReferralExpired {
            referral_id: referral_id.to_string(),
            reason: reason.to_string(),
        })?;
        log::info!("referral {referral_id} marked fraudulent: {reason}");
        Ok(())
    }

    /// Re-run the scorer over open referrals to catch patterns that
    /// only emerge later, velocity in particular. Blocks expire the
    /// referral; reviews are persisted for operators. Returns every
    /// non-allow verdict.
    pub fn rescore_open(&mut self) -> ReferralResult<Vec<(ReferralId, RiskAssessment)>> {
        let mut flagged = Vec::new();
        for referral in self.store.open_referrals()? {
            let assessment = self.assess_referral(
                &referral.referrer_id,
                &referral.referee_id,
                &referral.metadata,
            )?;
            match assessment.action {
                RiskAction::Allow => continue,
                RiskAction::Review => {
                    self.store.stamp_fraud(
                        &referral.referral_id,
                        &assessment.reasons.join(","),
                        self.now(),
                    )?;
                    self.persist_verdict(
                        Some(&referral.referral_id),
                        &referral.referrer_id,
                        &referral.referee_id,
                        &assessment,
                    )?;
                    self.log_event(&ReferralEvent::ReferralFlagged {
                        referral_id: referral.referral_id.clone(),
                        risk_score: assessment.risk_score,
                        reasons: assessment.reasons.clone(),
                    })?;
                }
                RiskAction::Block => {
                    let reason = assessment.reasons.join(",");
                    lifecycle::expire(
                        &self.store,
                        &referral.referral_id,
                        Some(&reason),
                        self.now(),
                    )?;
                    self.persist_verdict(
                        Some(&referral.referral_id),
                        &referral.referrer_id,
                        &referral.referee_id,
                        &assessment,
                    )?;
                    self.log_event(&ReferralEvent::ReferralBlocked {
                        referral_id: referral.referral_id.clone(),
                        risk_score: assessment.risk_score,
                        reasons: assessment.reasons.clone(),
                    })?;
                    log::warn!(
                        "referral {} blocked on rescore (score {})",
                        referral.referral_id,
                        assessment.risk_score
                    );
                }
            }
            flagged.push((referral.referral_id, assessment));
        }
        Ok(flagged)
    }

    // ── Recording ──────────────────────────────────────────────

    /// Record a referral for a referee who has completed signup. The
    /// candidate is scored first: a block persists an EXPIRED referral
    /// with fraud stamps and returns the rejection; review and allow
    /// proceed to REGISTERED and credit the referee's welcome bonus.
    pub fn record_referral(
        &mut self,
        referrer_id: &str,
        referee_id: &str,
        referral_code: &str,
        criteria: Option<QualificationCriteria>,
        metadata: ReferralMetadata,
    ) -> ReferralResult<RecordOutcome> {
        let criteria = criteria.unwrap_or(self.config.default_criteria);
        criteria.validate()?;

        match self.store.user_by_referral_code(referral_code)? {
            Some(owner) if owner.user_id == referrer_id => {}
            Some(owner) => {
                return Err(ReferralError::Validation(format!(
                    "referral code {referral_code} belongs to {}, not {referrer_id}",
                    owner.user_id
                )))
            }
            None => {
                return Err(ReferralError::Validation(format!(
                    "unknown referral code {referral_code}"
                )))
            }
        }

        if let Some(existing) = self.store.referral_by_referee(referee_id)? {
            return Err(ReferralError::Validation(format!(
                "referee {referee_id} already has referral {}",
                existing.referral_id
            )));
        }

        let assessment = self.assess_referral(referrer_id, referee_id, &metadata)?;
        let now = self.now();
        let referral_id = Uuid::new_v4().to_string();

        let tier_mgr = TierManager::new(&self.store, &self.config);
        let tier = tier_mgr.current_tier(referrer_id)?;
        let rewards = RewardBundle {
            referrer_amount: tier.per_referral.referrer_amount,
            referee_discount: tier.per_referral.referee_discount,
            milestone_bonus: Some(tier.per_referral.milestone_bonus),
            voucher_code: None,
            voucher_type: None,
        };

        if assessment.action == RiskAction::Block {
            let reason = assessment.reasons.join(",");
            let referral = Referral {
                referral_id: referral_id.clone(),
                referrer_id: referrer_id.to_string(),
                referee_id: referee_id.to_string(),
                referral_code: referral_code.to_string(),
                status: ReferralStatus::Expired,
                registered_at: None,
                qualified_at: None,
                completed_at: None,
                expires_at: None,
                criteria,
                rewards,
                referrer_rewarded: false,
                referee_rewarded: false,
                milestone_rewarded: false,
                tier: tier.name.clone(),
                metadata: ReferralMetadata {
                    fraud_flag: true,
                    fraud_reason: Some(reason),
                    flagged_at: Some(now),
                    ..metadata
                },
                created_at: now,
            };
            self.store.insert_referral(&referral)?;
            self.persist_verdict(Some(&referral_id), referrer_id, referee_id, &assessment)?;
            self.log_event(&ReferralEvent::ReferralBlocked {
                referral_id: referral_id.clone(),
                risk_score: assessment.risk_score,
                reasons: assessment.reasons.clone(),
            })?;
            log::warn!(
                "referral {referral_id} blocked at creation (score {})",
                assessment.risk_score
            );
            return Ok(RecordOutcome::Rejected {
                referral_id,
                assessment,
            });
        }

        let referral = Referral {
            referral_id: referral_id.clone(),
            referrer_id: referrer_id.to_string(),
            referee_id: referee_id.to_string(),
            referral_code: referral_code.to_string(),
            status: ReferralStatus::Pending,
            registered_at: None,
            qualified_at: None,
            completed_at: None,
            expires_at: Some(now + Duration::days(self.config.expiry_days)),
            criteria,
            rewards,
            referrer_rewarded: false,
            referee_rewarded: false,
            milestone_rewarded: false,
            tier: tier.name.clone(),
            metadata,
            created_at: now,
        };
        self.store.insert_referral(&referral)?;
        self.log_event(&ReferralEvent::ReferralRecorded {
            referral_id: referral_id.clone(),
            referrer_id: referrer_id.to_string(),
            referee_id: referee_id.to_string(),
            referral_code: referral_code.to_string(),
        })?;

        // The referee has already signed up, so the referral moves
        // straight through PENDING.
        lifecycle::advance(
            &self.store,
            &referral_id,
            ReferralStatus::Pending,
            ReferralStatus::Registered,
            now,
        )?;
        self.log_event(&ReferralEvent::StatusAdvanced {
            referral_id: referral_id.clone(),
            from: ReferralStatus::Pending,
            to: ReferralStatus::Registered,
        })?;

        if self.config.welcome_bonus > 0.0 {
            self.store.credit_wallet(referee_id, self.config.welcome_bonus)?;
            self.log_event(&ReferralEvent::RewardIssued {
                referral_id: referral_id.clone(),
                user_id: referee_id.to_string(),
                kind: "welcome_bonus".to_string(),
                amount: self.config.welcome_bonus,
            })?;
        }

        if assessment.action == RiskAction::Review {
            self.persist_verdict(Some(&referral_id), referrer_id, referee_id, &assessment)?;
            self.log_event(&ReferralEvent::ReferralFlagged {
                referral_id: referral_id.clone(),
                risk_score: assessment.risk_score,
                reasons: assessment.reasons.clone(),
            })?;
            log::info!(
                "referral {referral_id} accepted under review (score {})",
                assessment.risk_score
            );
        } else {
            log::debug!("referral {referral_id} recorded for referrer {referrer_id}");
        }

        Ok(RecordOutcome::Accepted {
            referral_id,
            assessment,
        })
    }

    // ── Order-driven advancement ───────────────────────────────

    /// React to a referee order: stamps the first order, advances the
    /// lifecycle, pays the milestone, evaluates qualification, and on
    /// qualification pays the referrer and recomputes the tier. Every
    /// reward is gated by its idempotency flag, so replaying an order
    /// event never double-credits.
    pub fn advance_on_order(
        &mut self,
        referee_id: &str,
        order_id: &str,
    ) -> ReferralResult<Option<Referral>> {
        let order = self
            .store
            .get_order(order_id)?
            .ok_or_else(|| ReferralError::NotFound {
                entity: "order",
                id: order_id.to_string(),
            })?;
        if order.user_id != referee_id {
            return Err(ReferralError::Validation(format!(
                "order {order_id} does not belong to user {referee_id}"
            )));
        }

        let Some(referral) = self.store.referral_by_referee(referee_id)? else {
            return Ok(None);
        };
        if referral.status.is_terminal() {
            return Ok(Some(referral));
        }
        let referral_id = referral.referral_id.clone();
        let now = self.now();

        if self
            .store
            .set_referee_first_order(&referral_id, order.created_at)?
        {
            self.log_event(&ReferralEvent::FirstOrderPlaced {
                referral_id: referral_id.clone(),
                order_id: order_id.to_string(),
                amount: order.amount,
            })?;
            // The referee discount rides on the first order.
            if self
                .store
                .claim_reward_flag(&referral_id, crate::store::RewardFlag::Referee)?
            {
                self.store
                    .credit_wallet(referee_id, referral.rewards.referee_discount)?;
                self.log_event(&ReferralEvent::RewardIssued {
                    referral_id: referral_id.clone(),
                    user_id: referee_id.to_string(),
                    kind: crate::store::RewardFlag::Referee.kind().to_string(),
                    amount: referral.rewards.referee_discount,
                })?;
            }
        }

        // A lost CAS means a concurrent event advanced it already and
        // logged the transition; only the winner appends the event.
        if referral.status == ReferralStatus::Registered
            && self
                .store
                .cas_status(&referral_id, ReferralStatus::Registered, ReferralStatus::Active, now)?
        {
            self.log_event(&ReferralEvent::StatusAdvanced {
                referral_id: referral_id.clone(),
                from: ReferralStatus::Registered,
                to: ReferralStatus::Active,
            })?;
        }

        self.settle_milestone(&referral, referee_id)?;
        self.try_qualify(&referral_id)?;
        self.try_complete(&referral_id)?;

        self.store
            .get_referral(&referral_id)?
            .ok_or_else(|| ReferralError::NotFound {
                entity: "referral",
                id: referral_id,
            })
            .map(Some)
    }

    /// Pay the milestone bonus when the referee's countable order count
    /// first reaches the configured threshold.
    fn settle_milestone(&mut self, referral: &Referral, referee_id: &str) -> ReferralResult<()> {
        let count = self.store.countable_order_count(referee_id)?;
        self.store
            .set_milestone_orders(&referral.referral_id, count.max(0) as u32)?;

        let Some(bonus) = referral.rewards.milestone_bonus else {
            return Ok(());
        };
        // Orders can arrive batched, so the count may jump straight
        // past the threshold; the flag below keeps the payout single.
        if count < i64::from(self.config.milestone_order_count) {
            return Ok(());
        }
        if !self
            .store
            .claim_reward_flag(&referral.referral_id, crate::store::RewardFlag::Milestone)?
        {
            return Ok(());
        }
        self.store.credit_wallet(&referral.referrer_id, bonus)?;
        self.log_event(&ReferralEvent::MilestoneReached {
            referral_id: referral.referral_id.clone(),
            order_count: self.config.milestone_order_count,
            bonus,
        })?;
        self.log_event(&ReferralEvent::RewardIssued {
            referral_id: referral.referral_id.clone(),
            user_id: referral.referrer_id.clone(),
            kind: crate::store::RewardFlag::Milestone.kind().to_string(),
            amount: bonus,
        })?;
        Ok(())
    }

    /// Evaluate qualification for an ACTIVE referral and, on success,
    /// transition it, pay the referrer, and recompute the tier.
    fn try_qualify(&mut self, referral_id: &str) -> ReferralResult<()> {
        let referral = self.referral(referral_id)?;
        if referral.status != ReferralStatus::Active {
            return Ok(());
        }
        let outcome = qualification::evaluate(&self.store, &referral)?;
        if !outcome.qualified {
            return Ok(());
        }

        let now = self.now();
        if !self
            .store
            .cas_status(referral_id, ReferralStatus::Active, ReferralStatus::Qualified, now)?
        {
            // Concurrent qualification won; its reward path runs there.
            return Ok(());
        }
        self.log_event(&ReferralEvent::ReferralQualified {
            referral_id: referral_id.to_string(),
            qualified_at: now,
        })?;
        log::info!(
            "referral {referral_id} qualified ({} orders, {:.2} spend)",
            outcome.window_orders,
            outcome.window_spend
        );

        if self
            .store
            .claim_reward_flag(referral_id, crate::store::RewardFlag::Referrer)?
        {
            self.store
                .credit_wallet(&referral.referrer_id, referral.rewards.referrer_amount)?;
            self.log_event(&ReferralEvent::RewardIssued {
                referral_id: referral_id.to_string(),
                user_id: referral.referrer_id.clone(),
                kind: crate::store::RewardFlag::Referrer.kind().to_string(),
                amount: referral.rewards.referrer_amount,
            })?;
        }

        let tier_mgr = TierManager::new(&self.store, &self.config);
        tier_mgr.check_and_upgrade(
            &referral.referrer_id,
            Some(referral_id),
            self.voucher.as_mut(),
            now,
        )?;
        Ok(())
    }

    /// Move QUALIFIED to COMPLETED once every applicable reward flag
    /// settled.
    fn try_complete(&self, referral_id: &str) -> ReferralResult<()> {
        let referral = self.referral(referral_id)?;
        if referral.status != ReferralStatus::Qualified || !referral.all_rewards_settled() {
            return Ok(());
        }
        let now = self.now();
        if self
            .store
            .cas_status(referral_id, ReferralStatus::Qualified, ReferralStatus::Completed, now)?
        {
            self.log_event(&ReferralEvent::StatusAdvanced {
                referral_id: referral_id.to_string(),
                from: ReferralStatus::Qualified,
                to: ReferralStatus::Completed,
            })?;
        }
        Ok(())
    }

    /// Expire referrals whose window closed before qualifying.
    pub fn expire_overdue(&self) -> ReferralResult<u32> {
        let now = self.now();
        let mut expired = 0;
        for referral in self.store.overdue_referrals(now)? {
            if lifecycle::expire(&self.store, &referral.referral_id, None, now)? {
                self.log_event(&ReferralEvent::ReferralExpired {
                    referral_id: referral.referral_id,
                    reason: "qualification_window_elapsed".to_string(),
                })?;
                expired += 1;
            }
        }
        if expired > 0 {
            log::info!("expired {expired} overdue referrals");
        }
        Ok(expired)
    }

    // ── Reads ──────────────────────────────────────────────────

    pub fn referral(&self, referral_id: &str) -> ReferralResult<Referral> {
        self.store
            .get_referral(referral_id)?
            .ok_or_else(|| ReferralError::NotFound {
                entity: "referral",
                id: referral_id.to_string(),
            })
    }

    pub fn get_tier_status(&self, user_id: &str) -> ReferralResult<TierProgress> {
        if self.store.get_user(user_id)?.is_none() {
            return Err(ReferralError::NotFound {
                entity: "user",
                id: user_id.to_string(),
            });
        }
        TierManager::new(&self.store, &self.config).progress(user_id)
    }

    /// Review-scored verdicts awaiting an operator decision.
    pub fn review_queue(&self) -> ReferralResult<Vec<RiskReviewRow>> {
        self.store
            .risk_reviews_by_action(RiskAction::Review.as_str())
    }

    /// Per-referrer lifecycle counts and earnings.
    pub fn referral_stats(&self, referrer_id: &str) -> ReferralResult<ReferralStats> {
        if self.store.get_user(referrer_id)?.is_none() {
            return Err(ReferralError::NotFound {
                entity: "user",
                id: referrer_id.to_string(),
            });
        }
        self.store.referral_stats(referrer_id)
    }

    pub fn get_leaderboard(&self, limit: u32) -> ReferralResult<Vec<LeaderboardRow>> {
        Analytics::new(&self.store).leaderboard(limit)
    }

    pub fn get_rank(&self, user_id: &str) -> ReferralResult<RankReport> {
        Analytics::new(&self.store).rank(user_id)
    }

    pub fn get_metrics(&self, range: &DateRange) -> ReferralResult<AnalyticsReport> {
        Analytics::new(&self.store).metrics(range)
    }

    pub fn get_funnel(&self, range: &DateRange) -> ReferralResult<FunnelReport> {
        Analytics::new(&self.store).funnel(range)
    }
}
