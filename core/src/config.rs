use serde::{Deserialize, Serialize};

use crate::error::{ReferralError, ReferralResult};
use crate::types::{PerReferralRewards, QualificationCriteria, TierDef, TierRewards};

/// Weight each fraud signal contributes to the additive score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudWeights {
    pub self_referral: u32,
    pub shared_device_or_ip: u32,
    pub suspicious_new_account: u32,
    pub referral_velocity: u32,
    pub very_new_account: u32,
    pub circular_referral: u32,
    pub correlated_email: u32,
}

impl Default for FraudWeights {
    fn default() -> Self {
        Self {
            self_referral: 100,
            shared_device_or_ip: 40,
            suspicious_new_account: 30,
            referral_velocity: 25,
            very_new_account: 10,
            circular_referral: 50,
            correlated_email: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudConfig {
    pub weights: FraudWeights,
    /// Score at or above which the referral is blocked.
    pub block_threshold: u32,
    /// Score at or above which the referral is surfaced for review.
    pub review_threshold: u32,
    /// Referrals in the trailing window above which velocity triggers.
    pub velocity_max_referrals: i64,
    pub velocity_window_hours: i64,
    /// Referee account age below which "very new account" triggers.
    pub new_account_age_minutes: i64,
    /// Email domains that never count as a correlated-domain signal.
    pub public_email_domains: Vec<String>,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            weights: FraudWeights::default(),
            block_threshold: 80,
            review_threshold: 60,
            velocity_max_referrals: 10,
            velocity_window_hours: 24,
            new_account_age_minutes: 60,
            public_email_domains: [
                "gmail.com",
                "yahoo.com",
                "hotmail.com",
                "outlook.com",
                "icloud.com",
                "aol.com",
                "live.com",
                "protonmail.com",
                "rediffmail.com",
                "yandex.com",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Full program configuration: fraud tunables, tier catalog, and the
/// reward/qualification defaults applied to new referrals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramConfig {
    pub fraud: FraudConfig,
    /// Ordered by `referrals_required`, strictly increasing.
    pub tiers: Vec<TierDef>,
    pub default_criteria: QualificationCriteria,
    /// Coins credited to the referee when the referral registers.
    pub welcome_bonus: f64,
    /// The referee order count at which the milestone bonus fires.
    pub milestone_order_count: u32,
    /// Days after registration before an unqualified referral expires.
    pub expiry_days: i64,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        let tier = |name: &str,
                    required: u32,
                    bonus: f64,
                    voucher: Option<&str>,
                    premium: bool,
                    per: (f64, f64, f64)| TierDef {
            name: name.to_string(),
            referrals_required: required,
            upgrade: TierRewards {
                tier_bonus: bonus,
                voucher: voucher.map(|v| v.to_string()),
                lifetime_premium: premium,
            },
            per_referral: PerReferralRewards {
                referrer_amount: per.0,
                referee_discount: per.1,
                milestone_bonus: per.2,
            },
        };

        Self {
            fraud: FraudConfig::default(),
            tiers: vec![
                tier("STARTER", 0, 0.0, None, false, (50.0, 50.0, 20.0)),
                tier("BRONZE", 3, 100.0, None, false, (75.0, 60.0, 30.0)),
                tier("SILVER", 10, 250.0, Some("percentage_10"), false, (100.0, 75.0, 40.0)),
                tier("GOLD", 25, 500.0, Some("percentage_15"), false, (150.0, 100.0, 50.0)),
                tier("PLATINUM", 50, 1000.0, Some("percentage_20"), true, (200.0, 125.0, 75.0)),
            ],
            default_criteria: QualificationCriteria {
                min_orders: 1,
                min_spend: 500.0,
                timeframe_days: 30,
            },
            welcome_bonus: 30.0,
            milestone_order_count: 3,
            expiry_days: 90,
        }
    }
}

impl ProgramConfig {
    /// Load from a JSON file. Tests use `ProgramConfig::default()`.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: ProgramConfig = serde_json::from_str(&content)?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid config {path}: {e}"))?;
        Ok(config)
    }

    pub fn validate(&self) -> ReferralResult<()> {
        if self.tiers.is_empty() {
            return Err(ReferralError::Validation("tier catalog is empty".into()));
        }
        if self.tiers[0].referrals_required != 0 {
            return Err(ReferralError::Validation(
                "lowest tier must require 0 referrals".into(),
            ));
        }
        for pair in self.tiers.windows(2) {
            if pair[1].referrals_required <= pair[0].referrals_required {
                return Err(ReferralError::Validation(format!(
                    "tier '{}' does not increase referrals_required over '{}'",
                    pair[1].name, pair[0].name
                )));
            }
        }
        if self.fraud.review_threshold > self.fraud.block_threshold {
            return Err(ReferralError::Validation(
                "review_threshold must not exceed block_threshold".into(),
            ));
        }
        self.default_criteria.validate()?;
        Ok(())
    }

    /// Index of a tier name in the catalog; the lowest tier for unknown
    /// names so a corrupt stored tier never blocks upgrades.
    pub fn tier_index(&self, name: &str) -> usize {
        self.tiers.iter().position(|t| t.name == name).unwrap_or(0)
    }

    pub fn lowest_tier(&self) -> &TierDef {
        &self.tiers[0]
    }
}
