//! Run coordinator: one provider pass from sign-in to notification.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::catalog::Catalog;
use crate::claim::{ClaimMachine, ClaimOutcome, ClaimSettings};
use crate::core::queue::{ClaimQueue, Requeue};
use crate::core::types::{NotificationEvent, Offer, Run};
use crate::error::{EngineError, EngineResult};
use crate::exit_codes;
use crate::io::config::EngineConfig;
use crate::io::driver::PageDriver;
use crate::io::history::append_run;
use crate::io::ledger::Ledger;
use crate::io::notify::{Alerts, NotificationSink};
use crate::io::prompt::Prompter;
use crate::session::{LoginSettings, Session, SessionManager};

/// What a finished (or aborted) pass produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run: Run,
    pub events: Vec<NotificationEvent>,
    pub exit_code: i32,
}

pub struct RunCoordinator {
    provider: String,
    config: EngineConfig,
    driver: Box<dyn PageDriver>,
    sessions: SessionManager,
    catalog: Catalog,
    machine: ClaimMachine,
    alerts: Arc<Alerts>,
}

impl RunCoordinator {
    /// Wire the engine for `provider`. The prompter is ignored in headless mode.
    pub fn new(
        provider: &str,
        config: EngineConfig,
        driver: Box<dyn PageDriver>,
        sink: Arc<dyn NotificationSink>,
        prompter: Option<Arc<dyn Prompter>>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let provider_config = config.provider(provider);
        let prompter = if config.headless { None } else { prompter };
        let alerts = Arc::new(Alerts::new(config.notify.title.clone(), sink));

        let sessions = SessionManager::new(
            provider,
            provider_config.account.clone(),
            provider_config.otp_length,
            LoginSettings::from(&config),
            prompter.clone(),
            alerts.clone(),
        );
        let catalog = Catalog::new(&provider_config, config.step_timeout())?;
        let machine = ClaimMachine::new(
            provider,
            ClaimSettings::from(&config),
            provider_config.account.pin.clone(),
            prompter,
            alerts.clone(),
        );
        Ok(Self {
            provider: provider.to_string(),
            config,
            driver,
            sessions,
            catalog,
            machine,
            alerts,
        })
    }

    /// Run one pass, cancelled by Ctrl-C.
    pub async fn run(self) -> RunReport {
        self.run_until(ctrl_c()).await
    }

    /// Run one pass, cancelled when `shutdown` resolves.
    ///
    /// The ledger is flushed and the session closed however the pass ends.
    #[instrument(skip_all, fields(provider = %self.provider))]
    pub async fn run_until<F>(mut self, shutdown: F) -> RunReport
    where
        F: Future<Output = ()>,
    {
        let mut run = Run::started(&self.provider, Utc::now());
        let mut events = Vec::new();
        let mut session = None;

        let result = match Ledger::open(&self.config.ledger_path(&self.provider)) {
            Ok(mut ledger) => {
                let result = tokio::select! {
                    result = self.pass(&mut ledger, &mut session, &mut run, &mut events) => result,
                    () = shutdown => Err(EngineError::Interrupted),
                };
                match (result, ledger.commit()) {
                    (result, Ok(())) => result,
                    (Ok(()), Err(err)) => Err(err),
                    (Err(err), Err(flush)) => {
                        error!(err = %flush, "ledger flush after abort failed");
                        Err(err)
                    }
                }
            }
            Err(err) => Err(err),
        };

        match &result {
            Ok(()) => {}
            Err(EngineError::Interrupted) => {
                warn!("run interrupted");
                run.interrupted = true;
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(err = %message, "run aborted");
                if !err.already_notified() {
                    self.alerts.failure(&self.provider, &message).await;
                }
                run.error = Some(message);
            }
        }

        let mut session = session.unwrap_or_else(|| Session::new(&self.provider));
        session
            .close(self.driver.as_mut(), self.config.step_timeout())
            .await;

        run.end_time = Some(Utc::now());
        if self.config.write_history {
            let path = self.config.history_path(&self.provider);
            if let Err(err) = append_run(&path, &run) {
                warn!(err = %format!("{err:#}"), path = %path.display(), "run history not written");
            }
        }

        let exit_code = exit_code_for(&run);
        info!(
            offers = run.offers_seen,
            claimed = run.claimed_count,
            failed = run.failed_count,
            exit_code,
            "run finished"
        );
        RunReport {
            run,
            events,
            exit_code,
        }
    }

    async fn pass(
        &mut self,
        ledger: &mut Ledger,
        session: &mut Option<Session>,
        run: &mut Run,
        events: &mut Vec<NotificationEvent>,
    ) -> EngineResult<()> {
        let session = session.insert(self.sessions.authenticate(self.driver.as_mut()).await?);
        run.user = Some(session.user().to_string());

        let offers = self
            .catalog
            .list_offers(self.driver.as_mut(), session, ledger)
            .await?;
        let mut queue = ClaimQueue::new(offers);

        while let Some(offer) = queue.next_offer() {
            let outcome = self
                .machine
                .claim(&offer, session, ledger, self.driver.as_mut(), &self.sessions)
                .await?;
            let transition = match outcome {
                ClaimOutcome::Resolved { transition, .. } => transition,
                ClaimOutcome::NeedsBase => {
                    if self.requeue_after_base(&mut queue, &offer).await {
                        continue;
                    }
                    warn!(offer_id = %offer.id, "base game unavailable, giving up on offer");
                    self.machine.record_base_missing(&offer, session, ledger)?
                }
            };
            queue.mark_resolved(&offer.id);
            run.tally(transition.reported);
            events.push(NotificationEvent {
                title: offer.title.clone(),
                url: offer.url.clone(),
                status: transition.reported,
            });
        }

        ledger.commit()?;
        self.alerts
            .run_summary(&self.provider, session.user(), events)
            .await?;
        Ok(())
    }

    /// Queue the base game ahead of `offer`; false when the offer cannot be expanded.
    async fn requeue_after_base(&mut self, queue: &mut ClaimQueue, offer: &Offer) -> bool {
        if !queue.can_expand(&offer.id) {
            return false;
        }
        let Some([base, dependent]) = self.catalog.expand(self.driver.as_mut(), offer).await else {
            return false;
        };
        info!(offer_id = %offer.id, base_id = %base.id, "claiming base game first");
        queue.requeue_after_base(dependent, base) == Requeue::Queued
    }
}

fn exit_code_for(run: &Run) -> i32 {
    if run.interrupted {
        exit_codes::INTERRUPTED
    } else if run.succeeded() {
        exit_codes::OK
    } else {
        exit_codes::FAILURE
    }
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(err = %err, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> Run {
        Run::started("store", Utc::now())
    }

    #[test]
    fn clean_run_exits_zero() {
        let mut run = run();
        run.tally(crate::core::types::ClaimStatus::Claimed);
        assert_eq!(exit_code_for(&run), exit_codes::OK);
    }

    #[test]
    fn failed_offer_or_error_exits_one() {
        let mut failed = run();
        failed.tally(crate::core::types::ClaimStatus::Failed);
        assert_eq!(exit_code_for(&failed), exit_codes::FAILURE);

        let mut aborted = run();
        aborted.error = Some("login failed".to_string());
        assert_eq!(exit_code_for(&aborted), exit_codes::FAILURE);
    }

    #[test]
    fn interruption_wins() {
        let mut interrupted = run();
        interrupted.tally(crate::core::types::ClaimStatus::Failed);
        interrupted.interrupted = true;
        assert_eq!(exit_code_for(&interrupted), exit_codes::INTERRUPTED);
    }
}
