//! Offer catalog: the ordered list of offers to process in one run.

use std::time::Duration;

use anyhow::anyhow;
use tracing::{debug, info, instrument, warn};

use crate::core::filter::{ExclusionRules, resolve_offers, to_offer};
use crate::core::types::{ClaimStatus, Offer};
use crate::error::EngineResult;
use crate::io::config::ProviderConfig;
use crate::io::driver::{PageDriver, within};
use crate::io::ledger::Ledger;
use crate::session::Session;

pub struct Catalog {
    base_url: Option<String>,
    rules: ExclusionRules,
    skip_resolved: bool,
    step_timeout: Duration,
}

impl Catalog {
    pub fn new(provider: &ProviderConfig, step_timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: provider.base_url.clone(),
            rules: provider.exclusion_rules()?,
            skip_resolved: provider.skip_resolved,
            step_timeout,
        })
    }

    /// Enumerate, canonicalize and filter the provider's current offers.
    ///
    /// A listing that does not answer within the step timeout aborts the run:
    /// without a catalog there is nothing to claim.
    #[instrument(skip_all, fields(provider = %session.provider()))]
    pub async fn list_offers(
        &self,
        driver: &mut dyn PageDriver,
        session: &Session,
        ledger: &Ledger,
    ) -> EngineResult<Vec<Offer>> {
        let step = self.step_timeout;
        let raw = within(step, driver.list_candidate_offers(step))
            .await?
            .ok_or_else(|| anyhow!("offer listing did not answer within {step:?}"))?;

        let resolved = resolve_offers(&raw, self.base_url.as_deref(), &self.rules);
        for rejected in &resolved.rejected {
            debug!(title = %rejected.title, url = %rejected.url, reason = %rejected.reason, "offer dropped");
        }

        let offers: Vec<Offer> = resolved
            .offers
            .into_iter()
            .filter(|offer| {
                let known = ledger.status(session.user(), &offer.id);
                let skip = self.skip_resolved
                    && matches!(known, Some(ClaimStatus::Claimed | ClaimStatus::Existed));
                if skip {
                    debug!(offer_id = %offer.id, status = ?known, "already resolved, skipping");
                }
                !skip
            })
            .collect();
        info!(candidates = raw.len(), offers = offers.len(), "catalog resolved");
        Ok(offers)
    }

    /// `[base, offer]` for a dependent offer, or `None` when no usable base is known.
    #[instrument(skip_all, fields(offer_id = %offer.id))]
    pub async fn expand(&self, driver: &mut dyn PageDriver, offer: &Offer) -> Option<[Offer; 2]> {
        let base = match within(self.step_timeout, driver.base_offer(offer)).await {
            Ok(Some(Some(raw))) => raw,
            Ok(Some(None)) => {
                debug!("driver knows no base offer");
                return None;
            }
            Ok(None) => {
                warn!("base offer lookup timed out");
                return None;
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "base offer lookup failed");
                return None;
            }
        };
        let Some(base) = to_offer(&base, self.base_url.as_deref()) else {
            warn!(url = %base.url, "base offer has no stable id");
            return None;
        };
        if base.id == offer.id {
            warn!("base offer refers to the offer itself");
            return None;
        }
        Some([base, offer.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transitions::Observation;
    use crate::test_support::{ScriptedDriver, raw_offer};
    use chrono::Utc;

    fn session() -> Session {
        Session::new("store")
    }

    #[tokio::test]
    async fn lists_filtered_offers_in_catalog_order() {
        let provider = ProviderConfig {
            exclude_title_suffixes: vec!["Demo".to_string()],
            base_url: Some("https://s.example".to_string()),
            ..ProviderConfig::default()
        };
        let catalog = Catalog::new(&provider, Duration::from_secs(5)).expect("catalog");
        let mut driver = ScriptedDriver::new().offers(vec![
            raw_offer("b", "Beta"),
            raw_offer("a-demo", "Alpha Demo"),
            raw_offer("a", "Alpha"),
        ]);
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::open(&temp.path().join("store.json")).expect("ledger");

        let offers = catalog
            .list_offers(&mut driver, &session(), &ledger)
            .await
            .expect("offers");
        let ids: Vec<&str> = offers.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn skip_resolved_drops_known_offers() {
        let provider = ProviderConfig {
            skip_resolved: true,
            ..ProviderConfig::default()
        };
        let catalog = Catalog::new(&provider, Duration::from_secs(5)).expect("catalog");
        let temp = tempfile::tempdir().expect("tempdir");
        let mut ledger = Ledger::open(&temp.path().join("store.json")).expect("ledger");
        let mut driver = ScriptedDriver::new().offers(vec![raw_offer("a", "A"), raw_offer("b", "B")]);
        let owned = to_offer(&raw_offer("a", "A"), None).expect("offer");
        ledger.record_observation("default", &owned, Observation::Owned, Utc::now());

        let offers = catalog
            .list_offers(&mut driver, &session(), &ledger)
            .await
            .expect("offers");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_listing_is_an_error() {
        let catalog = Catalog::new(&ProviderConfig::default(), Duration::from_secs(5)).expect("catalog");
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::open(&temp.path().join("store.json")).expect("ledger");
        let mut driver = ScriptedDriver::new().hang_listing();
        let err = catalog
            .list_offers(&mut driver, &session(), &ledger)
            .await
            .expect_err("timeout");
        assert!(err.to_string().contains("did not answer"));
    }

    #[tokio::test]
    async fn expand_puts_base_first_and_rejects_self_reference() {
        let catalog = Catalog::new(&ProviderConfig::default(), Duration::from_secs(5)).expect("catalog");
        let dlc = to_offer(&raw_offer("dlc", "DLC"), None).expect("offer");
        let mut driver = ScriptedDriver::new()
            .base("dlc", raw_offer("base", "Base"))
            .base("loop", raw_offer("loop", "Loop"));

        let [base, dependent] = catalog.expand(&mut driver, &dlc).await.expect("expanded");
        assert_eq!(base.id, "base");
        assert_eq!(dependent.id, "dlc");

        let looped = to_offer(&raw_offer("loop", "Loop"), None).expect("offer");
        assert!(catalog.expand(&mut driver, &looped).await.is_none());
        let unknown = to_offer(&raw_offer("x", "X"), None).expect("offer");
        assert!(catalog.expand(&mut driver, &unknown).await.is_none());
    }
}
