//! Session lifecycle: sign-in reuse, credential and code flows, re-authentication.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::core::types::Signal;
use crate::error::{EngineError, EngineResult};
use crate::io::config::{Account, EngineConfig};
use crate::io::driver::{CodeKind, Credentials, PageDriver, within};
use crate::io::notify::Alerts;
use crate::io::otp::OtpSource;
use crate::io::prompt::{Prompter, resolve_credentials};

/// Ledger key used when neither the site nor the account names the user.
pub const DEFAULT_USER: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Closed,
}

/// Live authenticated context for one provider and account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    provider: String,
    user: String,
    state: SessionState,
}

impl Session {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            user: DEFAULT_USER.to_string(),
            state: SessionState::Unauthenticated,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Ledger key for this session's records.
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Close the driver (bounded) and mark the session closed.
    pub async fn close(&mut self, driver: &mut dyn PageDriver, timeout: Duration) {
        if self.state == SessionState::Closed {
            return;
        }
        match within(timeout, driver.close()).await {
            Ok(Some(())) => debug!(provider = %self.provider, "session closed"),
            Ok(None) => warn!(provider = %self.provider, "driver close timed out"),
            Err(err) => warn!(provider = %self.provider, err = %format!("{err:#}"), "driver close failed"),
        }
        self.state = SessionState::Closed;
    }
}

/// Timeouts and limits for the login flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSettings {
    pub headless: bool,
    pub step_timeout: Duration,
    pub login_timeout: Duration,
    pub wait_for_manual_login: bool,
    pub max_login_attempts: u32,
}

impl From<&EngineConfig> for LoginSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            headless: config.headless,
            step_timeout: config.step_timeout(),
            login_timeout: config.login_timeout(),
            wait_for_manual_login: config.wait_for_manual_login,
            max_login_attempts: config.max_login_attempts,
        }
    }
}

pub struct SessionManager {
    provider: String,
    account: Account,
    otp: OtpSource,
    settings: LoginSettings,
    prompter: Option<Arc<dyn Prompter>>,
    alerts: Arc<Alerts>,
}

impl SessionManager {
    /// `prompter` must be `None` in headless mode.
    pub fn new(
        provider: &str,
        account: Account,
        otp_length: usize,
        settings: LoginSettings,
        prompter: Option<Arc<dyn Prompter>>,
        alerts: Arc<Alerts>,
    ) -> Self {
        let otp = OtpSource::new(account.otp_seed.clone(), otp_length);
        Self {
            provider: provider.to_string(),
            account,
            otp,
            settings,
            prompter,
            alerts,
        }
    }

    /// Reuse an existing sign-in or log in with configured/prompted credentials.
    #[instrument(skip_all, fields(provider = %self.provider))]
    pub async fn authenticate(&self, driver: &mut dyn PageDriver) -> EngineResult<Session> {
        let mut session = Session::new(&self.provider);
        session.state = SessionState::Authenticating;

        if self.signed_in(driver).await? {
            info!("already signed in");
            self.finish(driver, &mut session, None).await;
            return Ok(session);
        }

        let prompter = self.prompter();
        let credentials =
            resolve_credentials(&self.account, prompter, self.settings.login_timeout).await?;
        let username = match credentials {
            Some(credentials) => {
                self.login(driver, &credentials).await?;
                Some(credentials.username)
            }
            None if self.settings.headless => {
                warn!("no credentials and headless, cannot log in");
                self.alerts
                    .notice(
                        &self.provider,
                        "not signed in and no credentials configured; headless mode prevents manual login",
                    )
                    .await;
                return Err(EngineError::AuthenticationUnavailable {
                    provider: self.provider.clone(),
                });
            }
            None => {
                self.wait_for_manual_login(driver).await?;
                None
            }
        };

        self.finish(driver, &mut session, username).await;
        Ok(session)
    }

    /// Sign in again after the site dropped the session. The ledger user is kept.
    #[instrument(skip_all, fields(provider = %self.provider, user = %session.user))]
    pub async fn reauthenticate(
        &self,
        driver: &mut dyn PageDriver,
        session: &mut Session,
    ) -> EngineResult<()> {
        session.state = SessionState::Authenticating;
        let fresh = match self.authenticate(driver).await {
            Ok(fresh) => fresh,
            Err(err) => {
                session.state = SessionState::Unauthenticated;
                return Err(err);
            }
        };
        if fresh.user != session.user {
            warn!(signed_in_as = %fresh.user, "re-authenticated as a different user");
        }
        session.state = SessionState::Authenticated;
        info!("re-authenticated");
        Ok(())
    }

    fn prompter(&self) -> Option<&dyn Prompter> {
        if self.settings.headless {
            return None;
        }
        self.prompter.as_deref()
    }

    async fn signed_in(&self, driver: &mut dyn PageDriver) -> EngineResult<bool> {
        let step = self.settings.step_timeout;
        Ok(within(step, driver.is_signed_in(step))
            .await?
            .unwrap_or(false))
    }

    async fn finish(
        &self,
        driver: &mut dyn PageDriver,
        session: &mut Session,
        fallback: Option<String>,
    ) {
        let reported = match within(self.settings.step_timeout, driver.signed_in_user()).await {
            Ok(user) => user.flatten(),
            Err(err) => {
                debug!(err = %format!("{err:#}"), "signed-in user unavailable");
                None
            }
        };
        session.user = [reported, fallback, self.account.email.clone()]
            .into_iter()
            .flatten()
            .map(|user| user.trim().to_string())
            .find(|user| !user.is_empty())
            .unwrap_or_else(|| DEFAULT_USER.to_string());
        session.state = SessionState::Authenticated;
        info!(user = %session.user, "signed in");
    }

    async fn login(&self, driver: &mut dyn PageDriver, credentials: &Credentials) -> EngineResult<()> {
        let deadline = Instant::now() + self.settings.login_timeout;
        let mut code_attempts = 0u32;
        let mut captcha_notified = false;

        for attempt in 1..=self.settings.max_login_attempts {
            let remaining = time_left(deadline).ok_or_else(|| self.window_closed())?;
            debug!(attempt, "submitting login form");
            within(remaining, driver.login(credentials, remaining))
                .await?
                .ok_or_else(|| self.window_closed())?;

            let mut watching: Vec<Signal> = Signal::LOGIN.to_vec();
            loop {
                let remaining = time_left(deadline).ok_or_else(|| self.window_closed())?;
                let signal = within(remaining, driver.watch_for(&watching, remaining))
                    .await?
                    .flatten();
                match signal {
                    Some(Signal::SignedIn) => return Ok(()),
                    Some(Signal::OtpRequired) => {
                        code_attempts += 1;
                        if code_attempts > self.settings.max_login_attempts {
                            return Err(self.failed("one-time code rejected too many times"));
                        }
                        let code = self
                            .otp
                            .code(self.prompter(), remaining)
                            .await?
                            .ok_or_else(|| self.failed("one-time code required but none available"))?;
                        self.submit(driver, CodeKind::Otp, &code).await?;
                    }
                    Some(Signal::PinRequired) => {
                        let pin = self
                            .account
                            .pin
                            .as_deref()
                            .ok_or_else(|| self.failed("pin required but none configured"))?;
                        self.submit(driver, CodeKind::Pin, pin).await?;
                        watching.retain(|s| *s != Signal::PinRequired);
                    }
                    Some(Signal::CaptchaShown) => {
                        if !captcha_notified {
                            warn!("captcha shown during login");
                            self.alerts
                                .notice(
                                    &self.provider,
                                    "captcha during login; solve it in the browser or try again later",
                                )
                                .await;
                            captcha_notified = true;
                        }
                        watching.retain(|s| *s != Signal::CaptchaShown);
                    }
                    Some(Signal::LoginError) => {
                        warn!(attempt, "login rejected");
                        break;
                    }
                    Some(other) => {
                        return Err(self.failed(&format!("unexpected signal '{other}' during login")));
                    }
                    None => return Err(self.window_closed()),
                }
            }
        }
        Err(self.failed(&format!(
            "login rejected after {} attempts",
            self.settings.max_login_attempts
        )))
    }

    async fn submit(&self, driver: &mut dyn PageDriver, kind: CodeKind, code: &str) -> EngineResult<()> {
        within(self.settings.step_timeout, driver.submit_code(kind, code))
            .await?
            .ok_or_else(|| self.failed(&format!("submitting {kind:?} code timed out")))
    }

    async fn wait_for_manual_login(&self, driver: &mut dyn PageDriver) -> EngineResult<()> {
        let step = self.settings.step_timeout;
        if self.settings.wait_for_manual_login {
            info!("waiting for manual sign-in without a deadline");
            loop {
                let signal = within(step, driver.watch_for(&[Signal::SignedIn], step))
                    .await?
                    .flatten();
                if signal == Some(Signal::SignedIn) || self.signed_in(driver).await? {
                    return Ok(());
                }
            }
        }

        let window = self.settings.login_timeout;
        info!(timeout_ms = window.as_millis() as u64, "waiting for manual sign-in");
        let signal = within(window, driver.watch_for(&[Signal::SignedIn], window))
            .await?
            .flatten();
        if signal == Some(Signal::SignedIn) || self.signed_in(driver).await? {
            return Ok(());
        }
        Err(self.failed(&format!("not signed in after waiting {window:?} for manual login")))
    }

    fn window_closed(&self) -> EngineError {
        self.failed(&format!(
            "no sign-in within the {:?} login window",
            self.settings.login_timeout
        ))
    }

    fn failed(&self, reason: &str) -> EngineError {
        EngineError::AuthenticationFailed {
            provider: self.provider.clone(),
            reason: reason.to_string(),
        }
    }
}

fn time_left(deadline: Instant) -> Option<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    (!left.is_zero()).then_some(left)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingNotifier, ScriptedDriver, ScriptedPrompter};

    fn settings(headless: bool) -> LoginSettings {
        LoginSettings {
            headless,
            step_timeout: Duration::from_secs(5),
            login_timeout: Duration::from_secs(30),
            wait_for_manual_login: false,
            max_login_attempts: 2,
        }
    }

    fn manager(
        account: Account,
        settings: LoginSettings,
        prompter: Option<Arc<dyn Prompter>>,
        sink: &RecordingNotifier,
    ) -> SessionManager {
        let alerts = Arc::new(Alerts::new(None, Arc::new(sink.clone())));
        SessionManager::new("store", account, 6, settings, prompter, alerts)
    }

    fn account() -> Account {
        Account {
            email: Some("alice@example.com".to_string()),
            password: Some("pw".to_string()),
            ..Account::default()
        }
    }

    #[tokio::test]
    async fn existing_sign_in_is_reused() {
        let sink = RecordingNotifier::default();
        let mut driver = ScriptedDriver::new().signed_in(&[true]).user("Alice");
        let handle = driver.handle();
        let session = manager(Account::default(), settings(true), None, &sink)
            .authenticate(&mut driver)
            .await
            .expect("session");
        assert_eq!(session.user(), "Alice");
        assert_eq!(session.state(), SessionState::Authenticated);
        assert!(!handle.calls().iter().any(|c| c.starts_with("login")));
    }

    #[tokio::test]
    async fn otp_is_derived_from_seed_and_submitted() {
        let sink = RecordingNotifier::default();
        let mut driver = ScriptedDriver::new()
            .login_signals(vec![Some(Signal::OtpRequired), Some(Signal::SignedIn)]);
        let handle = driver.handle();
        let mut acct = account();
        acct.otp_seed = Some("GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ".to_string());
        let session = manager(acct, settings(true), None, &sink)
            .authenticate(&mut driver)
            .await
            .expect("session");
        assert_eq!(session.user(), "alice@example.com");
        let calls = handle.calls();
        assert!(calls.iter().any(|c| c == "login:alice@example.com"));
        assert!(calls.iter().any(|c| c.starts_with("submit:otp:")));
    }

    #[tokio::test]
    async fn login_error_retries_until_attempts_run_out() {
        let sink = RecordingNotifier::default();
        let mut driver = ScriptedDriver::new()
            .login_signals(vec![Some(Signal::LoginError), Some(Signal::LoginError)]);
        let handle = driver.handle();
        let err = manager(account(), settings(true), None, &sink)
            .authenticate(&mut driver)
            .await
            .expect_err("rejected");
        assert!(matches!(err, EngineError::AuthenticationFailed { .. }));
        let logins = handle.calls().iter().filter(|c| c.starts_with("login:")).count();
        assert_eq!(logins, 2);
    }

    #[tokio::test]
    async fn captcha_notifies_once_and_keeps_waiting() {
        let sink = RecordingNotifier::default();
        let mut driver = ScriptedDriver::new()
            .login_signals(vec![Some(Signal::CaptchaShown), Some(Signal::SignedIn)]);
        manager(account(), settings(true), None, &sink)
            .authenticate(&mut driver)
            .await
            .expect("session");
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].summary.contains("captcha"));
    }

    #[tokio::test]
    async fn headless_without_credentials_notifies_and_fails_fast() {
        let sink = RecordingNotifier::default();
        let mut driver = ScriptedDriver::new();
        let err = manager(Account::default(), settings(true), None, &sink)
            .authenticate(&mut driver)
            .await
            .expect_err("unavailable");
        assert!(matches!(err, EngineError::AuthenticationUnavailable { .. }));
        assert!(err.already_notified());
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interactive_without_credentials_times_out() {
        let sink = RecordingNotifier::default();
        let prompter: Arc<dyn Prompter> = Arc::new(ScriptedPrompter::new(Vec::new()));
        let mut cfg = settings(false);
        cfg.login_timeout = Duration::from_secs(1);
        let mut driver = ScriptedDriver::new();

        let started = Instant::now();
        let err = manager(Account::default(), cfg, Some(prompter), &sink)
            .authenticate(&mut driver)
            .await
            .expect_err("timed out");
        assert!(matches!(err, EngineError::AuthenticationFailed { .. }));
        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(sink.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_login_page_fails_within_window() {
        let sink = RecordingNotifier::default();
        let mut driver = ScriptedDriver::new().login_signals(vec![None]);
        let started = Instant::now();
        let err = manager(account(), settings(true), None, &sink)
            .authenticate(&mut driver)
            .await
            .expect_err("window closed");
        assert!(err.to_string().contains("login window"));
        assert!(started.elapsed() <= Duration::from_secs(31));
    }

    #[tokio::test]
    async fn pin_without_configuration_fails() {
        let sink = RecordingNotifier::default();
        let mut driver = ScriptedDriver::new().login_signals(vec![Some(Signal::PinRequired)]);
        let err = manager(account(), settings(true), None, &sink)
            .authenticate(&mut driver)
            .await
            .expect_err("pin missing");
        assert!(err.to_string().contains("pin"));
    }

    #[tokio::test]
    async fn reauthentication_keeps_ledger_user() {
        let sink = RecordingNotifier::default();
        let mut driver = ScriptedDriver::new().signed_in(&[true, true]).user("Alice");
        let sessions = manager(Account::default(), settings(true), None, &sink);
        let mut session = sessions.authenticate(&mut driver).await.expect("session");
        sessions
            .reauthenticate(&mut driver, &mut session)
            .await
            .expect("reauth");
        assert_eq!(session.user(), "Alice");
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut driver = ScriptedDriver::new();
        let handle = driver.handle();
        let mut session = Session::new("store");
        session.close(&mut driver, Duration::from_secs(1)).await;
        session.close(&mut driver, Duration::from_secs(1)).await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(handle.calls().iter().filter(|c| *c == "close").count(), 1);
    }
}
