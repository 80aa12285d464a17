//! growth-report: seeds a deterministic demo referral population and
//! prints the program analytics (funnel, K-factor, CAC, LTV,
//! leaderboard).
//!
//! Usage: growth-report [--seed N] [--referrers N] [--db PATH]
//!
//! Without --db the report runs against an in-memory database.

use anyhow::Result;
use chrono::Duration;
use rand::Rng;
use rand_pcg::Pcg64;
use referral_core::{
    clock::{Clock, ManualClock},
    config::ProgramConfig,
    engine::ReferralEngine,
    store::ReferralStore,
    types::{DateRange, OrderRecord, ReferralMetadata, UserRecord},
    voucher::CodeVoucherProvider,
};

struct Options {
    seed: u64,
    referrers: usize,
    db_path: Option<String>,
}

fn parse_args() -> Result<Options> {
    let mut opts = Options {
        seed: 42,
        referrers: 8,
        db_path: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--seed" => {
                let v = args.next().ok_or_else(|| anyhow::anyhow!("--seed needs a value"))?;
                opts.seed = v.parse()?;
            }
            "--referrers" => {
                let v = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--referrers needs a value"))?;
                opts.referrers = v.parse()?;
            }
            "--db" => {
                opts.db_path = Some(
                    args.next()
                        .ok_or_else(|| anyhow::anyhow!("--db needs a value"))?,
                );
            }
            "--help" | "-h" => {
                println!("Usage: growth-report [--seed N] [--referrers N] [--db PATH]");
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(opts)
}

fn main() -> Result<()> {
    env_logger::init();
    let opts = parse_args()?;

    let store = match &opts.db_path {
        Some(path) => ReferralStore::open(path)?,
        None => ReferralStore::in_memory()?,
    };
    store.migrate()?;

    let clock = ManualClock::at_test_epoch();
    let mut engine = ReferralEngine::with_parts(
        store,
        ProgramConfig::default(),
        Box::new(clock.clone()),
        Box::new(CodeVoucherProvider::new(opts.seed)),
    );

    seed_population(&mut engine, &clock, opts.seed, opts.referrers)?;

    engine.expire_overdue()?;
    let flagged = engine.rescore_open()?;

    print_report(&engine, flagged.len())?;
    Ok(())
}

fn user(id: &str, email: Option<String>, code: Option<&str>, at: chrono::DateTime<chrono::Utc>) -> UserRecord {
    UserRecord {
        user_id: id.to_string(),
        email,
        phone: Some(format!("+1555{:07}", id.len() * 101)),
        referral_code: code.map(|c| c.to_string()),
        referral_tier: "STARTER".to_string(),
        wallet_balance: 0.0,
        is_premium: false,
        premium_expires_at: None,
        created_at: at,
        last_login_at: Some(at),
    }
}

/// Deterministic demo population: each referrer brings in a random
/// handful of referees who order with varying intensity, plus a couple
/// of deliberately shady referrals for the fraud path.
fn seed_population(
    engine: &mut ReferralEngine,
    clock: &ManualClock,
    seed: u64,
    referrers: usize,
) -> Result<()> {
    let mut rng = Pcg64::new(seed as u128, 0xcafef00dd15ea5e5);
    let share_methods = ["whatsapp", "link", "sms", "qr"];

    for r in 0..referrers {
        let referrer_id = format!("referrer-{r:02}");
        let code = format!("GROW{r:02}");
        engine.store.insert_user(&user(
            &referrer_id,
            Some(format!("host{r}@example.net")),
            Some(&code),
            clock.now(),
        ))?;
        clock.advance(Duration::hours(1));

        let referees = rng.gen_range(1..=6);
        for n in 0..referees {
            let referee_id = format!("referee-{r:02}-{n}");
            // Account ages over an hour so the new-account signal stays quiet.
            let created = clock.now() - Duration::hours(rng.gen_range(2..72));
            engine.store.insert_user(&user(
                &referee_id,
                Some(format!("guest{r}x{n}@mail.example")),
                None,
                created,
            ))?;

            let metadata = ReferralMetadata {
                share_method: Some(share_methods[rng.gen_range(0..share_methods.len())].to_string()),
                device_id: Some(format!("device-{r:02}-{n}")),
                ip_address: Some(format!("10.0.{r}.{n}")),
                user_agent: Some("demo/1.0".to_string()),
                ..Default::default()
            };
            let outcome =
                engine.record_referral(&referrer_id, &referee_id, &code, None, metadata)?;
            if !outcome.is_accepted() {
                continue;
            }

            let orders = rng.gen_range(0..5);
            for o in 0..orders {
                clock.advance(Duration::days(rng.gen_range(1..5)));
                let order = OrderRecord {
                    order_id: format!("order-{r:02}-{n}-{o}"),
                    user_id: referee_id.clone(),
                    amount: rng.gen_range(120.0..900.0),
                    status: if rng.gen_bool(0.92) {
                        "delivered".to_string()
                    } else {
                        "cancelled".to_string()
                    },
                    created_at: clock.now(),
                };
                engine.store.insert_order(&order)?;
                engine.advance_on_order(&referee_id, &order.order_id)?;
            }
        }
        clock.advance(Duration::days(1));
    }

    // One shared-device farm so the report shows fraud activity.
    let farmer = "referrer-farm";
    engine.store.insert_user(&user(farmer, Some("farm@ring.example".into()), Some("FARM01"), clock.now()))?;
    for n in 0..3 {
        let referee_id = format!("farm-referee-{n}");
        let mut shell = user(&referee_id, None, None, clock.now());
        shell.phone = None;
        shell.last_login_at = None;
        engine.store.insert_user(&shell)?;
        let metadata = ReferralMetadata {
            share_method: Some("link".to_string()),
            device_id: Some("device-farm".to_string()),
            ip_address: Some("203.0.113.9".to_string()),
            ..Default::default()
        };
        engine.record_referral(farmer, &referee_id, "FARM01", None, metadata)?;
    }

    Ok(())
}

fn print_report(engine: &ReferralEngine, rescore_hits: usize) -> Result<()> {
    let range = DateRange::all();
    let metrics = engine.get_metrics(&range)?;

    println!("== Conversion funnel ==");
    for stage in &metrics.funnel.stages {
        println!("  {:<12} {:>5}  {:>6.1}%", stage.stage, stage.count, stage.percent);
    }

    println!("\n== Program metrics ==");
    println!("  users                {}", metrics.total_users);
    println!("  qualified referrals  {}", metrics.qualified_referrals);
    println!("  K-factor             {:.3}", metrics.k_factor);
    println!("  rewards paid         {:.2}", metrics.rewards_paid);
    match metrics.cac {
        Some(cac) => println!("  CAC                  {cac:.2}"),
        None => println!("  CAC                  n/a"),
    }
    match metrics.ltv {
        Some(ltv) => println!("  LTV per referral     {ltv:.2}"),
        None => println!("  LTV per referral     n/a"),
    }
    if let Some(days) = metrics.avg_days_to_qualification {
        println!("  avg days to qualify  {days:.1}");
    }
    println!("  rescore flags        {rescore_hits}");
    println!("  review queue         {}", engine.review_queue()?.len());

    println!("\n== Share methods ==");
    for source in &metrics.source_breakdown {
        println!("  {:<10} {}", source.share_method, source.referrals);
    }

    println!("\n== Leaderboard ==");
    for (i, row) in engine.get_leaderboard(10)?.iter().enumerate() {
        println!(
            "  #{:<3} {:<14} {:>3} qualified  {:>8.2} earned  {}",
            i + 1,
            row.user_id,
            row.qualified_referrals,
            row.lifetime_earnings,
            row.tier
        );
    }

    println!("\n== Report JSON ==");
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
