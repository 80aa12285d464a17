//! Tier manager tests: catalog scan, progress interpolation, and the
//! CAS-gated upgrade with its voucher seam.

use chrono::{Duration, Utc};
use referral_core::config::ProgramConfig;
use referral_core::store::ReferralStore;
use referral_core::tier::TierManager;
use referral_core::types::{
    QualificationCriteria, Referral, ReferralMetadata, ReferralStatus, RewardBundle, UserRecord,
};
use referral_core::voucher::{CodeVoucherProvider, FailingVoucherProvider};

fn setup() -> (ReferralStore, ProgramConfig) {
    let store = ReferralStore::in_memory().unwrap();
    store.migrate().unwrap();
    (store, ProgramConfig::default())
}

fn add_user(store: &ReferralStore, id: &str, tier: &str) {
    store
        .insert_user(&UserRecord {
            user_id: id.to_string(),
            email: Some(format!("{id}@example.net")),
            phone: None,
            referral_code: None,
            referral_tier: tier.to_string(),
            wallet_balance: 0.0,
            is_premium: false,
            premium_expires_at: None,
            created_at: Utc::now() - Duration::days(60),
            last_login_at: None,
        })
        .unwrap();
}

/// Insert `count` qualified referrals for a referrer.
fn add_qualified(store: &ReferralStore, referrer: &str, count: usize) {
    let now = Utc::now();
    for i in 0..count {
        let referee = format!("{referrer}-fee-{i:03}");
        add_user(store, &referee, "STARTER");
        store
            .insert_referral(&Referral {
                referral_id: format!("{referrer}-r-{i:03}"),
                referrer_id: referrer.to_string(),
                referee_id: referee,
                referral_code: "CODE".to_string(),
                status: ReferralStatus::Qualified,
                registered_at: Some(now - Duration::days(20)),
                qualified_at: Some(now - Duration::days(10)),
                completed_at: None,
                expires_at: None,
                criteria: QualificationCriteria {
                    min_orders: 1,
                    min_spend: 500.0,
                    timeframe_days: 30,
                },
                rewards: RewardBundle::default(),
                referrer_rewarded: true,
                referee_rewarded: true,
                milestone_rewarded: false,
                tier: "STARTER".to_string(),
                metadata: ReferralMetadata::default(),
                created_at: now - Duration::days(21),
            })
            .unwrap();
    }
}

#[test]
fn tier_for_count_scans_highest_first() {
    let (store, config) = setup();
    let mgr = TierManager::new(&store, &config);

    assert_eq!(mgr.tier_for_count(0).name, "STARTER");
    assert_eq!(mgr.tier_for_count(2).name, "STARTER");
    assert_eq!(mgr.tier_for_count(3).name, "BRONZE");
    assert_eq!(mgr.tier_for_count(9).name, "BRONZE");
    assert_eq!(mgr.tier_for_count(10).name, "SILVER");
    assert_eq!(mgr.tier_for_count(25).name, "GOLD");
    assert_eq!(mgr.tier_for_count(49).name, "GOLD");
    assert_eq!(mgr.tier_for_count(50).name, "PLATINUM");
    assert_eq!(mgr.tier_for_count(5000).name, "PLATINUM");
}

/// Completed referrals count toward the tier alongside qualified ones.
#[test]
fn current_tier_counts_completed_too() {
    let (store, config) = setup();
    add_user(&store, "ref-a", "STARTER");
    add_qualified(&store, "ref-a", 2);

    add_user(&store, "ref-a-fee-done", "STARTER");
    let now = Utc::now();
    store
        .insert_referral(&Referral {
            referral_id: "r-done".to_string(),
            referrer_id: "ref-a".to_string(),
            referee_id: "ref-a-fee-done".to_string(),
            referral_code: "CODE".to_string(),
            status: ReferralStatus::Completed,
            registered_at: Some(now - Duration::days(40)),
            qualified_at: Some(now - Duration::days(30)),
            completed_at: Some(now - Duration::days(5)),
            expires_at: None,
            criteria: QualificationCriteria {
                min_orders: 1,
                min_spend: 500.0,
                timeframe_days: 30,
            },
            rewards: RewardBundle::default(),
            referrer_rewarded: true,
            referee_rewarded: true,
            milestone_rewarded: true,
            tier: "STARTER".to_string(),
            metadata: ReferralMetadata::default(),
            created_at: now - Duration::days(41),
        })
        .unwrap();

    let mgr = TierManager::new(&store, &config);
    assert_eq!(mgr.current_tier("ref-a").unwrap().name, "BRONZE");
}

#[test]
fn progress_interpolates_between_thresholds() {
    let (store, config) = setup();
    add_user(&store, "ref-a", "STARTER");
    // 5 qualified: between BRONZE (3) and SILVER (10).
    add_qualified(&store, "ref-a", 5);

    let mgr = TierManager::new(&store, &config);
    let progress = mgr.progress("ref-a").unwrap();
    assert_eq!(progress.current_tier, "BRONZE");
    assert_eq!(progress.next_tier.as_deref(), Some("SILVER"));
    assert_eq!(progress.qualified_referrals, 5);
    assert_eq!(progress.referrals_needed, 5);
    let expected = (5.0 - 3.0) / (10.0 - 3.0) * 100.0;
    assert!(
        (progress.percent - expected).abs() < 1e-9,
        "percent {} != {expected}",
        progress.percent
    );
}

#[test]
fn progress_at_top_tier_is_complete() {
    let (store, config) = setup();
    add_user(&store, "ref-a", "PLATINUM");
    add_qualified(&store, "ref-a", 60);

    let mgr = TierManager::new(&store, &config);
    let progress = mgr.progress("ref-a").unwrap();
    assert_eq!(progress.current_tier, "PLATINUM");
    assert!(progress.next_tier.is_none());
    assert_eq!(progress.percent, 100.0);
    assert_eq!(progress.referrals_needed, 0);
}

#[test]
fn upgrade_credits_bonus_and_mints_voucher() {
    let (store, config) = setup();
    add_user(&store, "ref-a", "STARTER");
    add_qualified(&store, "ref-a", 10);

    let mgr = TierManager::new(&store, &config);
    let mut voucher = CodeVoucherProvider::new(7);
    let upgrade = mgr
        .check_and_upgrade("ref-a", Some("ref-a-r-009"), &mut voucher, Utc::now())
        .unwrap()
        .expect("upgrade expected");

    assert_eq!(upgrade.from_tier, "STARTER");
    assert_eq!(upgrade.to_tier, "SILVER");
    assert_eq!(upgrade.tier_bonus, 250.0);
    assert!(upgrade.voucher_code.is_some(), "SILVER carries a voucher");
    assert_eq!(upgrade.voucher_type.as_deref(), Some("percentage_10"));
    assert!(!upgrade.lifetime_premium);

    let user = store.get_user("ref-a").unwrap().unwrap();
    assert_eq!(user.referral_tier, "SILVER");
    assert_eq!(user.wallet_balance, 250.0);
    assert_eq!(store.event_count("tier_upgraded").unwrap(), 1);

    // The minted code lands on the triggering referral, so the voucher
    // survives the call and stays claimable.
    let trigger = store.get_referral("ref-a-r-009").unwrap().unwrap();
    assert_eq!(trigger.rewards.voucher_code, upgrade.voucher_code);
    assert_eq!(trigger.rewards.voucher_type.as_deref(), Some("percentage_10"));
}

#[test]
fn no_upgrade_when_tier_is_current() {
    let (store, config) = setup();
    add_user(&store, "ref-a", "BRONZE");
    add_qualified(&store, "ref-a", 4);

    let mgr = TierManager::new(&store, &config);
    let mut voucher = CodeVoucherProvider::new(7);
    let upgrade = mgr
        .check_and_upgrade("ref-a", None, &mut voucher, Utc::now())
        .unwrap();
    assert!(upgrade.is_none());
    assert_eq!(store.wallet_balance("ref-a").unwrap(), 0.0);
}

/// The tier never moves backward even if the stored tier is ahead of
/// the computed one.
#[test]
fn no_downgrade() {
    let (store, config) = setup();
    add_user(&store, "ref-a", "GOLD");
    add_qualified(&store, "ref-a", 3);

    let mgr = TierManager::new(&store, &config);
    let mut voucher = CodeVoucherProvider::new(7);
    assert!(mgr
        .check_and_upgrade("ref-a", None, &mut voucher, Utc::now())
        .unwrap()
        .is_none());
    let user = store.get_user("ref-a").unwrap().unwrap();
    assert_eq!(user.referral_tier, "GOLD");
}

/// PLATINUM flips the premium flag with no expiry.
#[test]
fn platinum_grants_lifetime_premium() {
    let (store, config) = setup();
    add_user(&store, "ref-a", "GOLD");
    add_qualified(&store, "ref-a", 50);

    let mgr = TierManager::new(&store, &config);
    let mut voucher = CodeVoucherProvider::new(7);
    let upgrade = mgr
        .check_and_upgrade("ref-a", Some("ref-a-r-049"), &mut voucher, Utc::now())
        .unwrap()
        .expect("upgrade expected");
    assert!(upgrade.lifetime_premium);

    let user = store.get_user("ref-a").unwrap().unwrap();
    assert!(user.is_premium);
    assert!(user.premium_expires_at.is_none());
}

/// A voucher provider failure aborts before the CAS: the stored tier
/// is untouched and the upgrade stays claimable on retry.
#[test]
fn voucher_failure_leaves_upgrade_retryable() {
    let (store, config) = setup();
    add_user(&store, "ref-a", "STARTER");
    add_qualified(&store, "ref-a", 10);

    let mgr = TierManager::new(&store, &config);
    let mut failing = FailingVoucherProvider;
    assert!(mgr
        .check_and_upgrade("ref-a", Some("ref-a-r-009"), &mut failing, Utc::now())
        .is_err());

    let user = store.get_user("ref-a").unwrap().unwrap();
    assert_eq!(user.referral_tier, "STARTER", "tier moved despite failure");
    assert_eq!(user.wallet_balance, 0.0, "bonus credited despite failure");

    let mut working = CodeVoucherProvider::new(7);
    let upgrade = mgr
        .check_and_upgrade("ref-a", Some("ref-a-r-009"), &mut working, Utc::now())
        .unwrap();
    assert!(upgrade.is_some(), "retry after provider recovery failed");
    let trigger = store.get_referral("ref-a-r-009").unwrap().unwrap();
    assert!(trigger.rewards.voucher_code.is_some(), "retry left no voucher behind");
}

/// An unknown stored tier is treated as the lowest, so a corrupt value
/// never wedges the upgrade path.
#[test]
fn unknown_stored_tier_still_upgrades() {
    let (store, config) = setup();
    add_user(&store, "ref-a", "LEGACY_VIP");
    add_qualified(&store, "ref-a", 3);

    let mgr = TierManager::new(&store, &config);
    let mut voucher = CodeVoucherProvider::new(7);
    let upgrade = mgr
        .check_and_upgrade("ref-a", None, &mut voucher, Utc::now())
        .unwrap()
        .expect("upgrade expected");
    assert_eq!(upgrade.to_tier, "BRONZE");
}
