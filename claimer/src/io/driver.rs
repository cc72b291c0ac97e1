//! Page driver contract: the only place that touches a storefront's markup.
//!
//! Drivers translate site-specific UI into the closed [`Signal`] vocabulary.
//! The engine never trusts a driver to honour its timeout argument and wraps
//! every call in [`within`].

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::{BoxFuture, select_all};

use crate::core::types::{Offer, RawOffer, Signal};

/// Username + password submitted through a login form.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Which code field a driver should fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    Otp,
    Pin,
}

#[async_trait]
pub trait PageDriver: Send {
    /// Whether the signed-in indicator is visible.
    async fn is_signed_in(&mut self, timeout: Duration) -> Result<bool>;

    /// Display name of the signed-in account, if the site shows one.
    async fn signed_in_user(&mut self) -> Result<Option<String>> {
        Ok(None)
    }

    /// Fill and submit the login form.
    async fn login(&mut self, credentials: &Credentials, timeout: Duration) -> Result<()>;

    async fn submit_code(&mut self, kind: CodeKind, code: &str) -> Result<()>;

    /// Watch `signals` concurrently; the first to appear wins.
    async fn watch_for(&mut self, signals: &[Signal], timeout: Duration)
    -> Result<Option<Signal>>;

    async fn list_candidate_offers(&mut self, timeout: Duration) -> Result<Vec<RawOffer>>;

    /// Open the offer page and report exactly one of [`Signal::CLASSIFY`].
    async fn classify_offer(&mut self, offer: &Offer, timeout: Duration)
    -> Result<Option<Signal>>;

    /// Invoke the claim action. Outcome is observed via [`PageDriver::watch_for`].
    async fn perform_claim(&mut self, offer: &Offer, timeout: Duration) -> Result<()>;

    /// Base game of a dependent offer, if the page links one.
    async fn base_offer(&mut self, offer: &Offer) -> Result<Option<RawOffer>>;

    async fn screenshot(&mut self, path: &Path) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Run `fut` with a hard deadline. `Ok(None)` means the deadline passed.
pub async fn within<T, F>(timeout: Duration, fut: F) -> Result<Option<T>>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map(Some),
        Err(_) => Ok(None),
    }
}

/// One watched condition: resolves `true` when its signal appeared, `false`
/// when the watch gave up.
pub type Watch<'a> = (Signal, BoxFuture<'a, bool>);

/// Race watches; the first to resolve `true` wins and the rest are dropped.
///
/// Helper for driver implementations of [`PageDriver::watch_for`]. Returns
/// `None` when every watch gave up.
pub async fn race_signals(watches: Vec<Watch<'_>>) -> Option<Signal> {
    // select_all swap-removes the finished future; mirror that on `signals`.
    let (mut signals, mut pending): (Vec<Signal>, Vec<BoxFuture<'_, bool>>) =
        watches.into_iter().unzip();
    while !pending.is_empty() {
        let (appeared, index, rest) = select_all(pending).await;
        let signal = signals.swap_remove(index);
        if appeared {
            return Some(signal);
        }
        pending = rest;
    }
    None
}
