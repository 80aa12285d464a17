use thiserror::Error;

use crate::types::ReferralStatus;

#[derive(Error, Debug)]
pub enum ReferralError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid transition {from} -> {to} for referral {referral_id}")]
    InvalidTransition {
        referral_id: String,
        from: ReferralStatus,
        to: ReferralStatus,
    },

    /// Voucher provider or another external collaborator failed. Retryable.
    #[error("External dependency '{service}' failed: {message}")]
    ExternalDependency {
        service: &'static str,
        message: String,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ReferralResult<T> = Result<T, ReferralError>;
