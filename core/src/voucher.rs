//! Voucher issuance, the external provider seam.
//!
//! Minting a voucher is an external call and must be treated as
//! fallible. The tier manager mints BEFORE flipping the tier CAS so a
//! provider failure leaves the upgrade unclaimed and safely retryable.

use rand::Rng;
use rand_pcg::Pcg64;

use crate::error::{ReferralError, ReferralResult};
use crate::types::UserId;

pub trait VoucherProvider: Send {
    /// Returns a redeemable code for the given voucher type.
    fn mint(&mut self, voucher_type: &str, user_id: &UserId) -> ReferralResult<String>;
}

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 10;

/// Default provider: locally generated codes from a seeded RNG.
/// Deterministic under a fixed seed, which the tests rely on.
pub struct CodeVoucherProvider {
    rng: Pcg64,
}

impl CodeVoucherProvider {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Pcg64::new(seed as u128, 0xa02bdbf7bb3c0a7),
        }
    }
}

impl VoucherProvider for CodeVoucherProvider {
    fn mint(&mut self, voucher_type: &str, _user_id: &UserId) -> ReferralResult<String> {
        let mut code = String::with_capacity(CODE_LEN + 4);
        code.push_str("RZV-");
        for _ in 0..CODE_LEN {
            let i = self.rng.gen_range(0..CODE_ALPHABET.len());
            code.push(CODE_ALPHABET[i] as char);
        }
        log::debug!("minted {voucher_type} voucher");
        Ok(code)
    }
}

/// Test provider that always fails, for exercising retry semantics.
pub struct FailingVoucherProvider;

impl VoucherProvider for FailingVoucherProvider {
    fn mint(&mut self, _voucher_type: &str, _user_id: &UserId) -> ReferralResult<String> {
        Err(ReferralError::ExternalDependency {
            service: "voucher_provider",
            message: "provider unavailable".into(),
        })
    }
}
