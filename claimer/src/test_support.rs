//! Test-only doubles: a scripted page driver, prompter and notification sink.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tempfile::TempDir;

use crate::core::filter::to_offer;
use crate::core::types::{Offer, RawOffer, Signal};
use crate::io::config::{EngineConfig, ProviderConfig};
use crate::io::driver::{CodeKind, Credentials, PageDriver};
use crate::io::notify::{Notification, NotificationSink};
use crate::io::prompt::Prompter;

/// Provider name used by [`test_config`].
pub const TEST_PROVIDER: &str = "store";

#[derive(Debug, Default)]
struct DriverScript {
    signed_in: VecDeque<bool>,
    last_signed_in: bool,
    user: Option<String>,
    login_signals: VecDeque<Option<Signal>>,
    offers: Vec<RawOffer>,
    hang_listing: bool,
    classify: HashMap<String, VecDeque<Option<Signal>>>,
    claim: HashMap<String, VecDeque<Option<Signal>>>,
    bases: HashMap<String, RawOffer>,
    current: Option<String>,
    calls: Vec<String>,
}

/// Page driver that replays scripted answers.
///
/// A `None` entry (or an exhausted script) makes the call hang, so the
/// engine's own timeouts decide what happens next.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDriver {
    script: Arc<Mutex<DriverScript>>,
}

/// Read-side view of a [`ScriptedDriver`] that outlives the boxed driver.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    script: Arc<Mutex<DriverScript>>,
}

impl DriverHandle {
    /// Every call the engine made, in order (`login:<user>`, `classify:<id>`, ...).
    pub fn calls(&self) -> Vec<String> {
        lock(&self.script).calls.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.script)
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> DriverHandle {
        DriverHandle {
            script: self.script.clone(),
        }
    }

    /// Answers to `is_signed_in`; the last answer repeats once exhausted.
    pub fn signed_in(self, answers: &[bool]) -> Self {
        lock(&self.script).signed_in.extend(answers.iter().copied());
        self
    }

    pub fn user(self, user: &str) -> Self {
        lock(&self.script).user = Some(user.to_string());
        self
    }

    /// Signals observed after submitting the login form (or while waiting for a manual login).
    pub fn login_signals(self, signals: Vec<Option<Signal>>) -> Self {
        lock(&self.script).login_signals.extend(signals);
        self
    }

    pub fn offers(self, offers: Vec<RawOffer>) -> Self {
        lock(&self.script).offers = offers;
        self
    }

    pub fn hang_listing(self) -> Self {
        lock(&self.script).hang_listing = true;
        self
    }

    /// Classification answers for `id`, one per visit.
    pub fn classify(self, id: &str, signals: Vec<Option<Signal>>) -> Self {
        lock(&self.script)
            .classify
            .entry(id.to_string())
            .or_default()
            .extend(signals);
        self
    }

    /// Signals observed after clicking claim on `id`.
    pub fn claim_signals(self, id: &str, signals: Vec<Option<Signal>>) -> Self {
        lock(&self.script)
            .claim
            .entry(id.to_string())
            .or_default()
            .extend(signals);
        self
    }

    pub fn base(self, id: &str, base: RawOffer) -> Self {
        lock(&self.script).bases.insert(id.to_string(), base);
        self
    }

    fn record(&self, call: String) {
        lock(&self.script).calls.push(call);
    }
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    async fn is_signed_in(&mut self, _timeout: Duration) -> Result<bool> {
        let mut script = lock(&self.script);
        if let Some(answer) = script.signed_in.pop_front() {
            script.last_signed_in = answer;
        }
        Ok(script.last_signed_in)
    }

    async fn signed_in_user(&mut self) -> Result<Option<String>> {
        Ok(lock(&self.script).user.clone())
    }

    async fn login(&mut self, credentials: &Credentials, _timeout: Duration) -> Result<()> {
        self.record(format!("login:{}", credentials.username));
        Ok(())
    }

    async fn submit_code(&mut self, kind: CodeKind, code: &str) -> Result<()> {
        let kind = match kind {
            CodeKind::Otp => "otp",
            CodeKind::Pin => "pin",
        };
        self.record(format!("submit:{kind}:{code}"));
        Ok(())
    }

    async fn watch_for(&mut self, signals: &[Signal], _timeout: Duration) -> Result<Option<Signal>> {
        let next = {
            let mut script = lock(&self.script);
            if signals.contains(&Signal::ClaimSucceeded) {
                let current = script.current.clone().unwrap_or_default();
                script.claim.get_mut(&current).and_then(VecDeque::pop_front).flatten()
            } else if signals.contains(&Signal::SignedIn) {
                script.login_signals.pop_front().flatten()
            } else {
                None
            }
        };
        match next {
            Some(signal) => Ok(Some(signal)),
            None => std::future::pending().await,
        }
    }

    async fn list_candidate_offers(&mut self, _timeout: Duration) -> Result<Vec<RawOffer>> {
        let (hang, offers) = {
            let script = lock(&self.script);
            (script.hang_listing, script.offers.clone())
        };
        if hang {
            std::future::pending::<()>().await;
        }
        self.record("list".to_string());
        Ok(offers)
    }

    async fn classify_offer(&mut self, offer: &Offer, _timeout: Duration) -> Result<Option<Signal>> {
        let next = {
            let mut script = lock(&self.script);
            script.calls.push(format!("classify:{}", offer.id));
            script.current = Some(offer.id.clone());
            script
                .classify
                .get_mut(&offer.id)
                .and_then(VecDeque::pop_front)
                .flatten()
        };
        match next {
            Some(signal) => Ok(Some(signal)),
            None => std::future::pending().await,
        }
    }

    async fn perform_claim(&mut self, offer: &Offer, _timeout: Duration) -> Result<()> {
        self.record(format!("claim:{}", offer.id));
        Ok(())
    }

    async fn base_offer(&mut self, offer: &Offer) -> Result<Option<RawOffer>> {
        Ok(lock(&self.script).bases.get(&offer.id).cloned())
    }

    async fn screenshot(&mut self, path: &Path) -> Result<()> {
        self.record(format!("screenshot:{}", path.display()));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.record("close".to_string());
        Ok(())
    }
}

/// Sink that keeps every notification; optionally fails after recording.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        lock(&self.sent).push(notification.clone());
        if self.fail {
            return Err(anyhow!("notifier unavailable"));
        }
        Ok(())
    }
}

/// Prompter that replays answers; `None` or an exhausted script is "no answer".
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<Option<String>>>,
    questions: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new(answers: Vec<Option<String>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            questions: Mutex::new(Vec::new()),
        }
    }

    pub fn questions(&self) -> Vec<String> {
        lock(&self.questions).clone()
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn ask(&self, question: &str, _secret: bool, _timeout: Duration) -> Result<Option<String>> {
        lock(&self.questions).push(question.to_string());
        Ok(lock(&self.answers).pop_front().flatten())
    }
}

/// Raw offer at `https://s.example/p/<id>`.
pub fn raw_offer(id: &str, title: &str) -> RawOffer {
    RawOffer {
        title: title.to_string(),
        url: format!("https://s.example/p/{id}"),
        tags: Vec::new(),
    }
}

/// Resolved offer for `id`, titled after it.
pub fn offer(id: &str) -> Offer {
    to_offer(&raw_offer(id, &format!("{id} title")), None)
        .unwrap_or_else(|| panic!("offer id '{id}' must be a url segment"))
}

/// Headless config rooted at `root` with one [`TEST_PROVIDER`] and short timeouts.
pub fn test_config(root: &Path) -> EngineConfig {
    let mut config = EngineConfig {
        data_dir: root.join("data"),
        screenshots_dir: root.join("screenshots"),
        step_timeout_secs: 5,
        login_timeout_secs: 10,
        max_login_attempts: 2,
        max_reauth_attempts: 1,
        ..EngineConfig::default()
    };
    config.providers.insert(
        TEST_PROVIDER.to_string(),
        ProviderConfig {
            base_url: Some("https://s.example".to_string()),
            ..ProviderConfig::default()
        },
    );
    config
}

/// Temporary directory with a [`test_config`] rooted in it.
pub struct TestWorkspace {
    pub dir: TempDir,
    pub config: EngineConfig,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let config = test_config(dir.path());
        Self { dir, config }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.config.ledger_path(TEST_PROVIDER)
    }

    pub fn history_path(&self) -> PathBuf {
        self.config.history_path(TEST_PROVIDER)
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
