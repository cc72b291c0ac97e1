//! Engine error taxonomy.
//!
//! Offer-level variants fail a single offer and let the run continue;
//! session- and ledger-level variants abort the run.

use std::path::PathBuf;
use std::time::Duration;

use crate::exit_codes;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{provider}: no credentials available and headless mode prevents manual login")]
    AuthenticationUnavailable { provider: String },

    #[error("{provider}: authentication failed: {reason}")]
    AuthenticationFailed { provider: String, reason: String },

    #[error("session lost while processing '{offer_id}' after {attempts} re-authentication attempts")]
    SessionLost { offer_id: String, attempts: u32 },

    #[error("no classification for '{offer_id}' within {timeout:?}")]
    ClassificationTimeout { offer_id: String, timeout: Duration },

    #[error("claim of '{offer_id}' did not complete within {timeout:?}")]
    ClaimTimeout { offer_id: String, timeout: Duration },

    #[error("captcha for '{offer_id}' was not solved within {timeout:?}")]
    CaptchaUnresolved { offer_id: String, timeout: Duration },

    #[error("claim of '{offer_id}' rejected: {reason}")]
    ClaimRejected { offer_id: String, reason: String },

    #[error("ledger {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Offer-level errors mark the offer `failed`; the run continues.
    pub fn is_offer_level(&self) -> bool {
        matches!(
            self,
            EngineError::SessionLost { .. }
                | EngineError::ClassificationTimeout { .. }
                | EngineError::ClaimTimeout { .. }
                | EngineError::CaptchaUnresolved { .. }
                | EngineError::ClaimRejected { .. }
        )
    }

    /// Errors that wanted a diagnostic screenshot of the offer page.
    pub fn wants_screenshot(&self) -> bool {
        matches!(
            self,
            EngineError::ClaimTimeout { .. }
                | EngineError::CaptchaUnresolved { .. }
                | EngineError::ClaimRejected { .. }
        )
    }

    /// The session manager already told a human about this failure.
    pub fn already_notified(&self) -> bool {
        matches!(self, EngineError::AuthenticationUnavailable { .. })
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Interrupted => exit_codes::INTERRUPTED,
            _ => exit_codes::FAILURE,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
