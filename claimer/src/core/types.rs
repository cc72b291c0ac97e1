//! Shared deterministic types for the claim engine.
//!
//! These types define stable contracts between the engine components and the
//! persisted ledger format. They carry no I/O and serialize deterministically.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted outcome of an offer for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimStatus {
    /// Already owned before the engine tried to claim it.
    Existed,
    /// Claimed by the engine.
    Claimed,
    /// Last attempt did not complete.
    Failed,
    /// Previously failed, later observed as owned (resolved outside the engine).
    Manual,
    /// Deliberately not claimed (dry-run or declined confirmation).
    Skipped,
    /// Provider refuses the offer in the account's region.
    UnavailableRegion,
    /// Dependent item whose base game could not be obtained.
    RequiresBaseGame,
}

impl ClaimStatus {
    pub const ALL: [ClaimStatus; 7] = [
        ClaimStatus::Existed,
        ClaimStatus::Claimed,
        ClaimStatus::Failed,
        ClaimStatus::Manual,
        ClaimStatus::Skipped,
        ClaimStatus::UnavailableRegion,
        ClaimStatus::RequiresBaseGame,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ClaimStatus::Existed => "existed",
            ClaimStatus::Claimed => "claimed",
            ClaimStatus::Failed => "failed",
            ClaimStatus::Manual => "manual",
            ClaimStatus::Skipped => "skipped",
            ClaimStatus::UnavailableRegion => "unavailable-region",
            ClaimStatus::RequiresBaseGame => "requires-base-game",
        }
    }

    /// Outcomes that warrant telling a human about the run.
    pub fn is_noteworthy(self) -> bool {
        matches!(self, ClaimStatus::Claimed | ClaimStatus::Failed)
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified UI condition reported by a page driver.
///
/// The vocabulary is closed: drivers translate site-specific markup into these
/// names and the engine reasons only about them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Signal {
    SignedIn,
    SignedOut,
    OtpRequired,
    PinRequired,
    CaptchaShown,
    LoginError,
    InLibrary,
    Purchased,
    RequiresBaseGame,
    UnavailableInRegion,
    Claimable,
    ClaimSucceeded,
    ClaimError,
}

impl Signal {
    /// Signals raced after submitting the login form.
    pub const LOGIN: &'static [Signal] = &[
        Signal::SignedIn,
        Signal::OtpRequired,
        Signal::PinRequired,
        Signal::CaptchaShown,
        Signal::LoginError,
    ];

    /// Mutually exclusive offer classifications (plus session loss).
    pub const CLASSIFY: &'static [Signal] = &[
        Signal::InLibrary,
        Signal::Purchased,
        Signal::RequiresBaseGame,
        Signal::UnavailableInRegion,
        Signal::Claimable,
        Signal::SignedOut,
    ];

    /// Signals raced after invoking the claim action.
    pub const CLAIM: &'static [Signal] = &[
        Signal::ClaimSucceeded,
        Signal::CaptchaShown,
        Signal::PinRequired,
        Signal::ClaimError,
        Signal::SignedOut,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Signal::SignedIn => "signed-in",
            Signal::SignedOut => "signed-out",
            Signal::OtpRequired => "otp-required",
            Signal::PinRequired => "pin-required",
            Signal::CaptchaShown => "captcha-shown",
            Signal::LoginError => "login-error",
            Signal::InLibrary => "in-library",
            Signal::Purchased => "purchased",
            Signal::RequiresBaseGame => "requires-base-game",
            Signal::UnavailableInRegion => "unavailable-in-region",
            Signal::Claimable => "claimable",
            Signal::ClaimSucceeded => "claim-succeeded",
            Signal::ClaimError => "claim-error",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Offer as enumerated by a driver, before canonicalization and filtering.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawOffer {
    pub title: String,
    pub url: String,
    /// Provider tags such as `demo` or `dlc`, used by exclusion rules.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Claimable unit with a provider-stable id derived from its canonical URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Id of the base game this offer was expanded for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_of: Option<String>,
}

/// One ledger entry describing an offer's outcome for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRecord {
    pub title: String,
    pub url: String,
    pub first_seen: DateTime<Utc>,
    /// `None` while the offer is discovered but not yet resolved.
    #[serde(default)]
    pub status: Option<ClaimStatus>,
    pub last_updated: DateTime<Utc>,
}

impl ClaimRecord {
    pub fn discovered(offer: &Offer, now: DateTime<Utc>) -> Self {
        Self {
            title: offer.title.clone(),
            url: offer.url.clone(),
            first_seen: now,
            status: None,
            last_updated: now,
        }
    }
}

/// Per-offer entry collected for the end-of-run notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationEvent {
    pub title: String,
    pub url: String,
    pub status: ClaimStatus,
}

/// Summary of one provider pass, appended to the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub offers_seen: usize,
    pub claimed_count: usize,
    pub failed_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub interrupted: bool,
}

impl Run {
    pub fn started(provider: &str, now: DateTime<Utc>) -> Self {
        Self {
            provider: provider.to_string(),
            user: None,
            start_time: now,
            end_time: None,
            offers_seen: 0,
            claimed_count: 0,
            failed_count: 0,
            error: None,
            interrupted: false,
        }
    }

    /// Count an offer's reported outcome.
    pub fn tally(&mut self, status: ClaimStatus) {
        self.offers_seen += 1;
        match status {
            ClaimStatus::Claimed => self.claimed_count += 1,
            ClaimStatus::Failed => self.failed_count += 1,
            _ => {}
        }
    }

    /// A run succeeds when it completed without error and nothing failed.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.interrupted && self.failed_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_match_serde_names() {
        for status in ClaimStatus::ALL {
            let json = serde_json::to_string(&status).expect("serialize");
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn signal_uses_kebab_case_names() {
        let json = serde_json::to_string(&Signal::UnavailableInRegion).expect("serialize");
        assert_eq!(json, "\"unavailable-in-region\"");
        assert_eq!(Signal::CaptchaShown.to_string(), "captcha-shown");
    }

    #[test]
    fn claim_record_serializes_camel_case_fields() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .expect("parse")
            .with_timezone(&Utc);
        let offer = Offer {
            id: "g1".to_string(),
            title: "Game One".to_string(),
            url: "https://store.example/p/g1".to_string(),
            tags: Vec::new(),
            base_of: None,
        };
        let record = ClaimRecord::discovered(&offer, now);
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["firstSeen"], "2024-05-01T10:00:00Z");
        assert_eq!(value["lastUpdated"], "2024-05-01T10:00:00Z");
        assert!(value["status"].is_null());
    }
}
