//! Per-offer claim state machine.
//!
//! `Discovered → Classifying → (Owned | RegionLocked | NeedsBase | Attempting)`,
//! and `Attempting → (Claimed | Failed | Skipped)`. Every terminal outcome is
//! recorded through the ledger and committed before the next offer starts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::core::transitions::{Observation, Transition};
use crate::core::types::{Offer, Signal};
use crate::error::{EngineError, EngineResult};
use crate::io::config::EngineConfig;
use crate::io::driver::{CodeKind, PageDriver, within};
use crate::io::ledger::Ledger;
use crate::io::notify::Alerts;
use crate::io::prompt::{Prompter, confirm};
use crate::io::screenshots;
use crate::session::{Session, SessionManager};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSettings {
    pub headless: bool,
    pub dry_run: bool,
    pub confirm_claims: bool,
    pub step_timeout: Duration,
    /// How long a human gets to solve a captcha or answer a confirmation.
    pub interaction_timeout: Duration,
    pub max_reauth_attempts: u32,
    pub screenshots_dir: Option<PathBuf>,
}

impl From<&EngineConfig> for ClaimSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            headless: config.headless,
            dry_run: config.dry_run,
            confirm_claims: config.confirm_claims,
            step_timeout: config.step_timeout(),
            interaction_timeout: config.login_timeout(),
            max_reauth_attempts: config.max_reauth_attempts,
            screenshots_dir: config.screenshots_root().map(PathBuf::from),
        }
    }
}

/// What processing one offer produced.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// Terminal status recorded (and committed).
    Resolved {
        transition: Transition,
        error: Option<EngineError>,
    },
    /// Offer needs its base game first; nothing recorded yet.
    NeedsBase,
}

/// Intermediate verdict of one classification + attempt pass.
enum Verdict {
    Observed(Observation),
    NeedsBase,
    SessionLost,
}

pub struct ClaimMachine {
    provider: String,
    settings: ClaimSettings,
    pin: Option<String>,
    prompter: Option<Arc<dyn Prompter>>,
    alerts: Arc<Alerts>,
}

impl ClaimMachine {
    pub fn new(
        provider: &str,
        settings: ClaimSettings,
        pin: Option<String>,
        prompter: Option<Arc<dyn Prompter>>,
        alerts: Arc<Alerts>,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            settings,
            pin,
            prompter,
            alerts,
        }
    }

    /// Drive one offer to a terminal state, or report that it needs its base game.
    ///
    /// Offer-level failures are recorded as `failed` and returned inside the
    /// outcome; only session- and ledger-level errors are returned as `Err`.
    #[instrument(skip_all, fields(provider = %self.provider, offer_id = %offer.id))]
    pub async fn claim(
        &self,
        offer: &Offer,
        session: &mut Session,
        ledger: &mut Ledger,
        driver: &mut dyn PageDriver,
        sessions: &SessionManager,
    ) -> EngineResult<ClaimOutcome> {
        ledger.discover(session.user(), offer, Utc::now());

        let mut reauths = 0u32;
        let resolution = loop {
            match self.classify_and_attempt(offer, driver).await {
                Ok(Verdict::Observed(observation)) => break Ok(observation),
                Ok(Verdict::NeedsBase) => {
                    info!("requires base game");
                    return Ok(ClaimOutcome::NeedsBase);
                }
                Ok(Verdict::SessionLost) if reauths >= self.settings.max_reauth_attempts => {
                    break Err(EngineError::SessionLost {
                        offer_id: offer.id.clone(),
                        attempts: reauths,
                    });
                }
                Ok(Verdict::SessionLost) => {
                    reauths += 1;
                    warn!(attempt = reauths, "session lost, re-authenticating");
                    match sessions.reauthenticate(driver, session).await {
                        Ok(()) => {}
                        Err(
                            err @ (EngineError::AuthenticationFailed { .. }
                            | EngineError::AuthenticationUnavailable { .. }),
                        ) => {
                            warn!(err = %err, attempt = reauths, "re-authentication failed");
                            if reauths >= self.settings.max_reauth_attempts {
                                break Err(EngineError::SessionLost {
                                    offer_id: offer.id.clone(),
                                    attempts: reauths,
                                });
                            }
                        }
                        Err(err) => break Err(err),
                    }
                }
                Err(err) => break Err(err),
            }
        };

        let (observation, error) = match resolution {
            Ok(observation) => (observation, None),
            Err(err) if err.is_offer_level() => {
                warn!(err = %err, "offer failed");
                if err.wants_screenshot() {
                    screenshots::capture(
                        driver,
                        self.settings.screenshots_dir.as_deref(),
                        &self.provider,
                        &offer.id,
                        self.settings.step_timeout,
                    )
                    .await;
                }
                (Observation::Failed, Some(err))
            }
            Err(err) => return Err(err),
        };

        let transition = ledger.record_observation(session.user(), offer, observation, Utc::now());
        ledger.commit()?;
        info!(status = %transition.stored, reported = %transition.reported, "offer resolved");
        Ok(ClaimOutcome::Resolved { transition, error })
    }

    /// Record `requires-base-game` for an offer that cannot be expanded (again).
    pub fn record_base_missing(
        &self,
        offer: &Offer,
        session: &Session,
        ledger: &mut Ledger,
    ) -> EngineResult<Transition> {
        let transition = ledger.record_observation(
            session.user(),
            offer,
            Observation::BaseGameMissing,
            Utc::now(),
        );
        ledger.commit()?;
        Ok(transition)
    }

    async fn classify_and_attempt(
        &self,
        offer: &Offer,
        driver: &mut dyn PageDriver,
    ) -> EngineResult<Verdict> {
        let step = self.settings.step_timeout;
        let signal = within(step, driver.classify_offer(offer, step))
            .await
            .map_err(|err| driver_error(offer, &err))?
            .flatten();
        match signal {
            Some(Signal::InLibrary | Signal::Purchased) => Ok(Verdict::Observed(Observation::Owned)),
            Some(Signal::RequiresBaseGame) => Ok(Verdict::NeedsBase),
            Some(Signal::UnavailableInRegion) => {
                info!("unavailable in this region");
                Ok(Verdict::Observed(Observation::RegionLocked))
            }
            Some(Signal::SignedOut) => Ok(Verdict::SessionLost),
            Some(Signal::Claimable) => self.attempt(offer, driver).await,
            Some(other) => Err(EngineError::ClaimRejected {
                offer_id: offer.id.clone(),
                reason: format!("unexpected classification '{other}'"),
            }),
            None => Err(EngineError::ClassificationTimeout {
                offer_id: offer.id.clone(),
                timeout: step,
            }),
        }
    }

    async fn attempt(&self, offer: &Offer, driver: &mut dyn PageDriver) -> EngineResult<Verdict> {
        if self.settings.confirm_claims && !self.confirmed(offer).await? {
            info!("claim declined");
            return Ok(Verdict::Observed(Observation::Skipped));
        }
        if self.settings.dry_run {
            info!("dry run, not claiming");
            return Ok(Verdict::Observed(Observation::Skipped));
        }

        let step = self.settings.step_timeout;
        within(step, driver.perform_claim(offer, step))
            .await
            .map_err(|err| driver_error(offer, &err))?
            .ok_or_else(|| EngineError::ClaimTimeout {
                offer_id: offer.id.clone(),
                timeout: step,
            })?;

        let mut deadline = Instant::now() + step;
        let mut window = step;
        let mut watching: Vec<Signal> = Signal::CLAIM.to_vec();
        let mut captcha_seen = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let signal = if remaining.is_zero() {
                None
            } else {
                within(remaining, driver.watch_for(&watching, remaining))
                    .await
                    .map_err(|err| driver_error(offer, &err))?
                    .flatten()
            };
            match signal {
                Some(Signal::ClaimSucceeded) => return Ok(Verdict::Observed(Observation::Claimed)),
                Some(Signal::CaptchaShown) => {
                    warn!("captcha shown while claiming");
                    self.alerts
                        .notice(
                            &self.provider,
                            &format!("captcha while claiming '{}'; solve it in the browser", offer.title),
                        )
                        .await;
                    captcha_seen = true;
                    watching.retain(|s| *s != Signal::CaptchaShown);
                    if !self.settings.headless {
                        window = self.settings.interaction_timeout;
                        deadline = deadline.max(Instant::now() + window);
                    }
                }
                Some(Signal::PinRequired) => {
                    let pin = self.pin.as_deref().ok_or_else(|| EngineError::ClaimRejected {
                        offer_id: offer.id.clone(),
                        reason: "pin required but none configured".to_string(),
                    })?;
                    within(step, driver.submit_code(CodeKind::Pin, pin))
                        .await
                        .map_err(|err| driver_error(offer, &err))?;
                    watching.retain(|s| *s != Signal::PinRequired);
                }
                Some(Signal::ClaimError) => {
                    return Err(EngineError::ClaimRejected {
                        offer_id: offer.id.clone(),
                        reason: "provider reported an error".to_string(),
                    });
                }
                Some(Signal::SignedOut) => return Ok(Verdict::SessionLost),
                Some(_) | None if captcha_seen => {
                    return Err(EngineError::CaptchaUnresolved {
                        offer_id: offer.id.clone(),
                        timeout: window,
                    });
                }
                Some(_) | None => {
                    return Err(EngineError::ClaimTimeout {
                        offer_id: offer.id.clone(),
                        timeout: step,
                    });
                }
            }
        }
    }

    async fn confirmed(&self, offer: &Offer) -> EngineResult<bool> {
        let Some(prompter) = self.prompter.as_deref() else {
            return Ok(false);
        };
        let question = format!("Claim '{}' ({})?", offer.title, offer.url);
        Ok(confirm(prompter, &question, self.settings.interaction_timeout).await?)
    }
}

/// Driver failures inside an offer are offer-level: the offer fails, the run goes on.
fn driver_error(offer: &Offer, err: &anyhow::Error) -> EngineError {
    EngineError::ClaimRejected {
        offer_id: offer.id.clone(),
        reason: format!("driver error: {err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ClaimStatus;
    use crate::io::config::Account;
    use crate::session::LoginSettings;
    use crate::test_support::{RecordingNotifier, ScriptedDriver, ScriptedPrompter, offer};

    struct Fixture {
        _temp: tempfile::TempDir,
        ledger: Ledger,
        session: Session,
        sessions: SessionManager,
        sink: RecordingNotifier,
        alerts: Arc<Alerts>,
        shots: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::open(&temp.path().join("store.json")).expect("ledger");
        let sink = RecordingNotifier::default();
        let alerts = Arc::new(Alerts::new(None, Arc::new(sink.clone())));
        let sessions = SessionManager::new(
            "store",
            Account::default(),
            6,
            LoginSettings {
                headless: true,
                step_timeout: Duration::from_secs(5),
                login_timeout: Duration::from_secs(10),
                wait_for_manual_login: false,
                max_login_attempts: 1,
            },
            None,
            alerts.clone(),
        );
        let shots = temp.path().join("shots");
        Fixture {
            _temp: temp,
            ledger,
            session: Session::new("store"),
            sessions,
            sink,
            alerts,
            shots,
        }
    }

    fn settings(fx: &Fixture) -> ClaimSettings {
        ClaimSettings {
            headless: true,
            dry_run: false,
            confirm_claims: false,
            step_timeout: Duration::from_secs(5),
            interaction_timeout: Duration::from_secs(10),
            max_reauth_attempts: 1,
            screenshots_dir: Some(fx.shots.clone()),
        }
    }

    fn machine(fx: &Fixture, settings: ClaimSettings) -> ClaimMachine {
        ClaimMachine::new("store", settings, None, None, fx.alerts.clone())
    }

    async fn run(
        fx: &mut Fixture,
        machine: &ClaimMachine,
        driver: &mut ScriptedDriver,
        id: &str,
    ) -> ClaimOutcome {
        machine
            .claim(&offer(id), &mut fx.session, &mut fx.ledger, driver, &fx.sessions)
            .await
            .expect("claim")
    }

    fn stored(outcome: &ClaimOutcome) -> ClaimStatus {
        match outcome {
            ClaimOutcome::Resolved { transition, .. } => transition.stored,
            ClaimOutcome::NeedsBase => panic!("expected a resolved outcome"),
        }
    }

    #[tokio::test]
    async fn claimable_offer_is_claimed_and_committed() {
        let mut fx = fixture();
        let m = machine(&fx, settings(&fx));
        let mut driver = ScriptedDriver::new()
            .classify("g1", vec![Some(Signal::Claimable)])
            .claim_signals("g1", vec![Some(Signal::ClaimSucceeded)]);
        let outcome = run(&mut fx, &m, &mut driver, "g1").await;
        assert_eq!(stored(&outcome), ClaimStatus::Claimed);
        assert!(!fx.ledger.is_dirty());
        assert!(fx.ledger.path().exists());
    }

    #[tokio::test]
    async fn dry_run_skips_without_claiming() {
        let mut fx = fixture();
        let mut s = settings(&fx);
        s.dry_run = true;
        let m = machine(&fx, s);
        let mut driver = ScriptedDriver::new().classify("g1", vec![Some(Signal::Claimable)]);
        let handle = driver.handle();
        let outcome = run(&mut fx, &m, &mut driver, "g1").await;
        assert_eq!(stored(&outcome), ClaimStatus::Skipped);
        assert!(!handle.calls().iter().any(|c| c.starts_with("claim:")));
    }

    #[tokio::test]
    async fn declined_confirmation_skips() {
        let mut fx = fixture();
        let mut s = settings(&fx);
        s.confirm_claims = true;
        let prompter: Arc<dyn Prompter> = Arc::new(ScriptedPrompter::new(vec![Some("n".to_string())]));
        let m = ClaimMachine::new("store", s, None, Some(prompter), fx.alerts.clone());
        let mut driver = ScriptedDriver::new().classify("g1", vec![Some(Signal::Claimable)]);
        let outcome = run(&mut fx, &m, &mut driver, "g1").await;
        assert_eq!(stored(&outcome), ClaimStatus::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_classification_fails_within_step_timeout() {
        let mut fx = fixture();
        let m = machine(&fx, settings(&fx));
        let mut driver = ScriptedDriver::new().classify("g1", vec![None]);
        let started = Instant::now();
        let outcome = run(&mut fx, &m, &mut driver, "g1").await;
        assert_eq!(stored(&outcome), ClaimStatus::Failed);
        assert!(started.elapsed() <= Duration::from_secs(6));
        match outcome {
            ClaimOutcome::Resolved { error, .. } => {
                assert!(matches!(error, Some(EngineError::ClassificationTimeout { .. })));
            }
            ClaimOutcome::NeedsBase => panic!("unexpected"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn claim_error_fails_and_requests_screenshot() {
        let mut fx = fixture();
        let m = machine(&fx, settings(&fx));
        let mut driver = ScriptedDriver::new()
            .classify("g1", vec![Some(Signal::Claimable)])
            .claim_signals("g1", vec![Some(Signal::ClaimError)]);
        let handle = driver.handle();
        let outcome = run(&mut fx, &m, &mut driver, "g1").await;
        assert_eq!(stored(&outcome), ClaimStatus::Failed);
        assert!(handle.calls().iter().any(|c| c.starts_with("screenshot:")));
    }

    #[tokio::test(start_paused = true)]
    async fn captcha_is_reported_once_then_unresolved() {
        let mut fx = fixture();
        let m = machine(&fx, settings(&fx));
        let mut driver = ScriptedDriver::new()
            .classify("g1", vec![Some(Signal::Claimable)])
            .claim_signals("g1", vec![Some(Signal::CaptchaShown), None]);
        let outcome = run(&mut fx, &m, &mut driver, "g1").await;
        assert_eq!(stored(&outcome), ClaimStatus::Failed);
        match outcome {
            ClaimOutcome::Resolved { error, .. } => {
                assert!(matches!(error, Some(EngineError::CaptchaUnresolved { .. })));
            }
            ClaimOutcome::NeedsBase => panic!("unexpected"),
        }
        assert_eq!(fx.sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn captcha_then_success_still_claims() {
        let mut fx = fixture();
        let m = machine(&fx, settings(&fx));
        let mut driver = ScriptedDriver::new()
            .classify("g1", vec![Some(Signal::Claimable)])
            .claim_signals("g1", vec![Some(Signal::CaptchaShown), Some(Signal::ClaimSucceeded)]);
        let outcome = run(&mut fx, &m, &mut driver, "g1").await;
        assert_eq!(stored(&outcome), ClaimStatus::Claimed);
    }

    #[tokio::test]
    async fn region_lock_and_base_requirement() {
        let mut fx = fixture();
        let m = machine(&fx, settings(&fx));
        let mut driver = ScriptedDriver::new()
            .classify("r", vec![Some(Signal::UnavailableInRegion)])
            .classify("d", vec![Some(Signal::RequiresBaseGame)]);
        let outcome = run(&mut fx, &m, &mut driver, "r").await;
        assert_eq!(stored(&outcome), ClaimStatus::UnavailableRegion);
        let outcome = run(&mut fx, &m, &mut driver, "d").await;
        assert!(matches!(outcome, ClaimOutcome::NeedsBase));
        assert_eq!(fx.ledger.status("default", "d"), None);
    }

    #[tokio::test]
    async fn session_loss_reauthenticates_then_fails_when_exhausted() {
        let mut fx = fixture();
        let m = machine(&fx, settings(&fx));
        let mut driver = ScriptedDriver::new()
            .signed_in(&[true])
            .classify("g1", vec![Some(Signal::SignedOut), Some(Signal::SignedOut)]);
        let outcome = run(&mut fx, &m, &mut driver, "g1").await;
        match outcome {
            ClaimOutcome::Resolved { transition, error } => {
                assert_eq!(transition.stored, ClaimStatus::Failed);
                assert!(matches!(error, Some(EngineError::SessionLost { attempts: 1, .. })));
            }
            ClaimOutcome::NeedsBase => panic!("unexpected"),
        }
    }

    #[tokio::test]
    async fn session_loss_recovers_after_reauthentication() {
        let mut fx = fixture();
        let m = machine(&fx, settings(&fx));
        let mut driver = ScriptedDriver::new()
            .signed_in(&[true])
            .classify("g1", vec![Some(Signal::SignedOut), Some(Signal::InLibrary)]);
        let outcome = run(&mut fx, &m, &mut driver, "g1").await;
        assert_eq!(stored(&outcome), ClaimStatus::Existed);
    }

    #[tokio::test]
    async fn failed_reauthentication_fails_the_offer() {
        let mut fx = fixture();
        let m = machine(&fx, settings(&fx));
        let mut driver = ScriptedDriver::new().classify("g1", vec![Some(Signal::SignedOut)]);
        let handle = driver.handle();
        let outcome = run(&mut fx, &m, &mut driver, "g1").await;
        match outcome {
            ClaimOutcome::Resolved { transition, error } => {
                assert_eq!(transition.stored, ClaimStatus::Failed);
                assert!(matches!(error, Some(EngineError::SessionLost { attempts: 1, .. })));
            }
            ClaimOutcome::NeedsBase => panic!("unexpected"),
        }
        assert!(!fx.ledger.is_dirty());
        assert_eq!(handle.count("classify:g1"), 1);
    }

    #[tokio::test]
    async fn owned_after_failure_becomes_manual() {
        let mut fx = fixture();
        let m = machine(&fx, settings(&fx));
        let mut driver = ScriptedDriver::new()
            .classify("g2", vec![Some(Signal::Claimable), Some(Signal::InLibrary)])
            .claim_signals("g2", vec![Some(Signal::ClaimError)]);
        assert_eq!(stored(&run(&mut fx, &m, &mut driver, "g2").await), ClaimStatus::Failed);
        assert_eq!(stored(&run(&mut fx, &m, &mut driver, "g2").await), ClaimStatus::Manual);
    }
}
