//! Referral growth-program engine: fraud scoring, lifecycle state
//! machine, qualification, tier rewards, and read-side analytics over
//! a SQLite store.

pub mod analytics;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod fraud;
pub mod lifecycle;
pub mod qualification;
pub mod store;
pub mod tier;
pub mod types;
pub mod voucher;

pub use engine::{RecordOutcome, ReferralEngine};
pub use error::{ReferralError, ReferralResult};
pub use store::ReferralStore;
