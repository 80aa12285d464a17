//! Fraud scorer tests: individual signals, additive combination,
//! thresholds, and purity of assessment.

use chrono::{DateTime, Duration, Utc};
use referral_core::clock::Clock;
use referral_core::engine::ReferralEngine;
use referral_core::types::{ReferralMetadata, RiskAction, UserRecord};

fn user(id: &str, email: Option<&str>, phone: Option<&str>, created: DateTime<Utc>) -> UserRecord {
    UserRecord {
        user_id: id.to_string(),
        email: email.map(|s| s.to_string()),
        phone: phone.map(|s| s.to_string()),
        referral_code: Some(format!("CODE-{id}")),
        referral_tier: "STARTER".to_string(),
        wallet_balance: 0.0,
        is_premium: false,
        premium_expires_at: None,
        created_at: created,
        last_login_at: Some(created),
    }
}

fn meta(device: Option<&str>, ip: Option<&str>) -> ReferralMetadata {
    ReferralMetadata {
        device_id: device.map(|s| s.to_string()),
        ip_address: ip.map(|s| s.to_string()),
        ..Default::default()
    }
}

/// Self-referral always blocks on its own.
#[test]
fn self_referral_blocks() {
    let (engine, clock) = ReferralEngine::build_test().unwrap();
    let created = clock.now() - Duration::days(30);
    engine
        .store
        .insert_user(&user("u-1", Some("me@gmail.com"), Some("+15550001"), created))
        .unwrap();

    let assessment = engine
        .assess_referral("u-1", "u-1", &meta(None, None))
        .unwrap();
    assert_eq!(assessment.action, RiskAction::Block);
    assert!(
        assessment.risk_score >= 80,
        "Self-referral score {} below block threshold",
        assessment.risk_score
    );
    assert!(assessment.reasons.contains(&"self_referral".to_string()));
    assert!(assessment.is_fraud());
}

/// A device fingerprint reused across two referrals by the same
/// referrer scores the shared-device weight.
#[test]
fn shared_device_scores() {
    let (mut engine, clock) = ReferralEngine::build_test().unwrap();
    let old = clock.now() - Duration::days(10);
    engine
        .store
        .insert_user(&user("ref-a", Some("a@gmail.com"), Some("+1"), old))
        .unwrap();
    engine
        .store
        .insert_user(&user("fee-b", Some("b@yahoo.com"), Some("+2"), old))
        .unwrap();
    engine
        .store
        .insert_user(&user("fee-c", Some("c@yahoo.com"), Some("+3"), old))
        .unwrap();

    engine
        .record_referral("ref-a", "fee-b", "CODE-ref-a", None, meta(Some("dev-1"), None))
        .unwrap();

    let assessment = engine
        .assess_referral("ref-a", "fee-c", &meta(Some("dev-1"), None))
        .unwrap();
    assert_eq!(assessment.risk_score, 40);
    assert!(assessment
        .reasons
        .contains(&"shared_device_or_ip".to_string()));
}

/// Same check on IP address alone.
#[test]
fn shared_ip_scores() {
    let (mut engine, clock) = ReferralEngine::build_test().unwrap();
    let old = clock.now() - Duration::days(10);
    for (id, email) in [("ref-a", "a@gmail.com"), ("fee-b", "b@yahoo.com"), ("fee-c", "c@yahoo.com")] {
        engine
            .store
            .insert_user(&user(id, Some(email), Some("+1"), old))
            .unwrap();
    }
    engine
        .record_referral("ref-a", "fee-b", "CODE-ref-a", None, meta(None, Some("198.51.100.7")))
        .unwrap();

    let assessment = engine
        .assess_referral("ref-a", "fee-c", &meta(None, Some("198.51.100.7")))
        .unwrap();
    assert!(assessment
        .reasons
        .contains(&"shared_device_or_ip".to_string()));
}

/// A referee with no email, no phone, and no login history scores the
/// suspicious-account weight on top of the new-account weight.
#[test]
fn suspicious_new_account_scores() {
    let (engine, clock) = ReferralEngine::build_test().unwrap();
    engine
        .store
        .insert_user(&user("ref-a", Some("a@gmail.com"), Some("+1"), clock.now() - Duration::days(5)))
        .unwrap();
    let mut ghost = user("ghost", None, None, clock.now() - Duration::minutes(5));
    ghost.last_login_at = None;
    engine.store.insert_user(&ghost).unwrap();

    let assessment = engine
        .assess_referral("ref-a", "ghost", &meta(None, None))
        .unwrap();
    assert!(assessment
        .reasons
        .contains(&"suspicious_new_account".to_string()));
    assert!(assessment.reasons.contains(&"very_new_account".to_string()));
    assert_eq!(assessment.risk_score, 40);
}

/// Account age at or past one hour stops the very-new-account signal.
#[test]
fn hour_old_account_not_very_new() {
    let (engine, clock) = ReferralEngine::build_test().unwrap();
    engine
        .store
        .insert_user(&user("ref-a", Some("a@gmail.com"), Some("+1"), clock.now() - Duration::days(5)))
        .unwrap();
    engine
        .store
        .insert_user(&user("fee-b", Some("b@yahoo.com"), Some("+2"), clock.now() - Duration::minutes(60)))
        .unwrap();

    let assessment = engine
        .assess_referral("ref-a", "fee-b", &meta(None, None))
        .unwrap();
    assert!(!assessment.reasons.contains(&"very_new_account".to_string()));
}

/// More than ten referrals inside the trailing day triggers velocity.
#[test]
fn referral_velocity_scores() {
    let (mut engine, clock) = ReferralEngine::build_test().unwrap();
    let old = clock.now() - Duration::days(10);
    engine
        .store
        .insert_user(&user("ref-a", Some("a@gmail.com"), Some("+1"), old))
        .unwrap();
    for i in 0..11 {
        let id = format!("fee-{i:02}");
        engine
            .store
            .insert_user(&user(&id, Some(&format!("u{i}@yahoo.com")), Some("+9"), old))
            .unwrap();
        engine
            .record_referral("ref-a", &id, "CODE-ref-a", None, meta(None, None))
            .unwrap();
    }
    engine
        .store
        .insert_user(&user("fee-next", Some("next@yahoo.com"), Some("+9"), old))
        .unwrap();

    let assessment = engine
        .assess_referral("ref-a", "fee-next", &meta(None, None))
        .unwrap();
    assert!(assessment
        .reasons
        .contains(&"referral_velocity".to_string()));
    assert_eq!(assessment.risk_score, 25);
}

/// Referrals outside the velocity window do not count.
#[test]
fn velocity_window_excludes_old_referrals() {
    let (mut engine, clock) = ReferralEngine::build_test().unwrap();
    let old = clock.now() - Duration::days(10);
    engine
        .store
        .insert_user(&user("ref-a", Some("a@gmail.com"), Some("+1"), old))
        .unwrap();
    for i in 0..11 {
        let id = format!("fee-{i:02}");
        engine
            .store
            .insert_user(&user(&id, Some(&format!("u{i}@yahoo.com")), Some("+9"), old))
            .unwrap();
        engine
            .record_referral("ref-a", &id, "CODE-ref-a", None, meta(None, None))
            .unwrap();
    }
    clock.advance(Duration::hours(25));
    engine
        .store
        .insert_user(&user("fee-late", Some("late@yahoo.com"), Some("+9"), old))
        .unwrap();

    let assessment = engine
        .assess_referral("ref-a", "fee-late", &meta(None, None))
        .unwrap();
    assert!(!assessment
        .reasons
        .contains(&"referral_velocity".to_string()));
}

/// Direct ring: the referee already referred the referrer.
#[test]
fn direct_circular_referral_scores() {
    let (mut engine, clock) = ReferralEngine::build_test().unwrap();
    let old = clock.now() - Duration::days(10);
    engine
        .store
        .insert_user(&user("alpha", Some("alpha@gmail.com"), Some("+1"), old))
        .unwrap();
    engine
        .store
        .insert_user(&user("beta", Some("beta@yahoo.com"), Some("+2"), old))
        .unwrap();
    engine
        .record_referral("beta", "alpha", "CODE-beta", None, meta(None, None))
        .unwrap();

    let assessment = engine
        .assess_referral("alpha", "beta", &meta(None, None))
        .unwrap();
    assert!(assessment
        .reasons
        .contains(&"circular_referral".to_string()));
    assert_eq!(assessment.risk_score, 50);
}

/// One-hop ring: B referred C, C referred A, then A tries to refer B.
#[test]
fn one_hop_circular_referral_scores() {
    let (mut engine, clock) = ReferralEngine::build_test().unwrap();
    let old = clock.now() - Duration::days(10);
    for (id, email) in [
        ("a", "a@gmail.com"),
        ("b", "b@yahoo.com"),
        ("c", "c@hotmail.com"),
    ] {
        engine
            .store
            .insert_user(&user(id, Some(email), Some("+1"), old))
            .unwrap();
    }
    engine
        .record_referral("b", "c", "CODE-b", None, meta(None, None))
        .unwrap();
    engine
        .record_referral("c", "a", "CODE-c", None, meta(None, None))
        .unwrap();

    let assessment = engine.assess_referral("a", "b", &meta(None, None)).unwrap();
    assert!(assessment
        .reasons
        .contains(&"circular_referral".to_string()));
}

/// Shared non-public email domain correlates.
#[test]
fn correlated_private_domain_scores() {
    let (engine, clock) = ReferralEngine::build_test().unwrap();
    let old = clock.now() - Duration::days(10);
    engine
        .store
        .insert_user(&user("ref-a", Some("alice@corp.example"), Some("+1"), old))
        .unwrap();
    engine
        .store
        .insert_user(&user("fee-b", Some("bob@corp.example"), Some("+2"), old))
        .unwrap();

    let assessment = engine
        .assess_referral("ref-a", "fee-b", &meta(None, None))
        .unwrap();
    assert!(assessment
        .reasons
        .contains(&"correlated_email".to_string()));
    assert_eq!(assessment.risk_score, 20);
}

/// A shared public domain does not correlate, but identical local
/// parts up to a trailing numeric suffix do.
#[test]
fn correlated_local_part_scores() {
    let (engine, clock) = ReferralEngine::build_test().unwrap();
    let old = clock.now() - Duration::days(10);
    engine
        .store
        .insert_user(&user("ref-a", Some("alice@gmail.com"), Some("+1"), old))
        .unwrap();
    engine
        .store
        .insert_user(&user("fee-b", Some("alice27@gmail.com"), Some("+2"), old))
        .unwrap();
    engine
        .store
        .insert_user(&user("fee-c", Some("bob@gmail.com"), Some("+3"), old))
        .unwrap();

    let correlated = engine
        .assess_referral("ref-a", "fee-b", &meta(None, None))
        .unwrap();
    assert!(correlated
        .reasons
        .contains(&"correlated_email".to_string()));

    let unrelated = engine
        .assess_referral("ref-a", "fee-c", &meta(None, None))
        .unwrap();
    assert!(!unrelated
        .reasons
        .contains(&"correlated_email".to_string()));
}

/// Signals add up: shared device plus a contactless brand-new account
/// crosses the block threshold.
#[test]
fn combined_signals_block() {
    let (mut engine, clock) = ReferralEngine::build_test().unwrap();
    let old = clock.now() - Duration::days(10);
    engine
        .store
        .insert_user(&user("ref-a", Some("a@gmail.com"), Some("+1"), old))
        .unwrap();
    engine
        .store
        .insert_user(&user("fee-b", Some("b@yahoo.com"), Some("+2"), old))
        .unwrap();
    engine
        .record_referral("ref-a", "fee-b", "CODE-ref-a", None, meta(Some("dev-x"), None))
        .unwrap();

    let mut ghost = user("ghost", None, None, clock.now() - Duration::minutes(1));
    ghost.last_login_at = None;
    engine.store.insert_user(&ghost).unwrap();

    let assessment = engine
        .assess_referral("ref-a", "ghost", &meta(Some("dev-x"), None))
        .unwrap();
    // 40 (device) + 30 (no contact) + 10 (new) = 80
    assert_eq!(assessment.risk_score, 80);
    assert_eq!(assessment.action, RiskAction::Block);
}

/// A score between the two thresholds lands in review.
#[test]
fn mid_score_lands_in_review() {
    let (mut engine, clock) = ReferralEngine::build_test().unwrap();
    let old = clock.now() - Duration::days(10);
    engine
        .store
        .insert_user(&user("alpha", Some("alice@ring.example"), Some("+1"), old))
        .unwrap();
    engine
        .store
        .insert_user(&user("beta", Some("bob@ring.example"), Some("+2"), old))
        .unwrap();
    engine
        .record_referral("beta", "alpha", "CODE-beta", None, meta(None, None))
        .unwrap();

    // 50 (circular) + 20 (correlated domain) = 70
    let assessment = engine
        .assess_referral("alpha", "beta", &meta(None, None))
        .unwrap();
    assert_eq!(assessment.risk_score, 70);
    assert_eq!(assessment.action, RiskAction::Review);
}

/// The score clamps at 100 even when many signals fire at once.
#[test]
fn score_clamps_at_100() {
    let (engine, clock) = ReferralEngine::build_test().unwrap();
    let mut ghost = user("ghost", None, None, clock.now());
    ghost.last_login_at = None;
    engine.store.insert_user(&ghost).unwrap();

    let assessment = engine
        .assess_referral("ghost", "ghost", &meta(None, None))
        .unwrap();
    assert_eq!(assessment.risk_score, 100);
}

/// Assessment persists nothing; only recording does.
#[test]
fn assessment_is_pure() {
    let (engine, clock) = ReferralEngine::build_test().unwrap();
    let old = clock.now() - Duration::days(10);
    engine
        .store
        .insert_user(&user("ref-a", Some("a@gmail.com"), Some("+1"), old))
        .unwrap();

    engine
        .assess_referral("ref-a", "ref-a", &meta(None, None))
        .unwrap();
    assert_eq!(engine.store.risk_review_count("block").unwrap(), 0);
    assert!(engine.store.referral_by_referee("ref-a").unwrap().is_none());
}

/// A missing referrer or referee is an error, not a verdict.
#[test]
fn missing_user_is_error() {
    let (engine, _clock) = ReferralEngine::build_test().unwrap();
    let result = engine.assess_referral("nobody", "nobody-else", &meta(None, None));
    assert!(result.is_err(), "Expected NotFound for missing users");
}
