//! Per-provider claim ledger (`<data_dir>/<provider>.json`).
//!
//! Loaded once per run (schema + invariants), mutated in memory, and written
//! atomically whenever an offer reaches a terminal state. Records only change
//! through [`crate::core::transitions`], and an unchanged ledger is never
//! rewritten, so idempotent runs leave the file byte-identical.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::invariants::{LedgerData, validate_invariants};
use crate::core::transitions::{Observation, Transition, apply_observation, reset_record};
use crate::core::types::{ClaimRecord, ClaimStatus, Offer};
use crate::error::{EngineError, EngineResult};
use crate::io::atomic::write_atomic;

const LEDGER_SCHEMA: &str = include_str!("../../schemas/ledger.schema.json");

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    data: LedgerData,
    dirty: bool,
}

impl Ledger {
    /// Open the ledger at `path`. A missing file is an empty ledger.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> EngineResult<Self> {
        let data = if path.exists() {
            load_data(path).map_err(|err| persistence(path, &err))?
        } else {
            debug!("ledger missing, starting empty");
            LedgerData::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            data,
            dirty: false,
        })
    }

    /// Empty ledger bound to `path` without reading it.
    pub fn empty(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            data: LedgerData::new(),
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &LedgerData {
        &self.data
    }

    pub fn get(&self, user: &str, offer_id: &str) -> Option<&ClaimRecord> {
        self.data.get(user)?.get(offer_id)
    }

    pub fn status(&self, user: &str, offer_id: &str) -> Option<ClaimStatus> {
        self.get(user, offer_id)?.status
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Create the record on first sight. Existing records are left untouched.
    pub fn discover(&mut self, user: &str, offer: &Offer, now: DateTime<Utc>) -> &ClaimRecord {
        self.entry(user, offer, now)
    }

    /// Apply an observation to the offer's record, discovering it if needed.
    pub fn record_observation(
        &mut self,
        user: &str,
        offer: &Offer,
        observation: Observation,
        now: DateTime<Utc>,
    ) -> Transition {
        let transition = apply_observation(self.entry(user, offer, now), observation, now);
        if transition.changed {
            self.dirty = true;
        }
        transition
    }

    fn entry(&mut self, user: &str, offer: &Offer, now: DateTime<Utc>) -> &mut ClaimRecord {
        let dirty = &mut self.dirty;
        self.data
            .entry(user.to_string())
            .or_default()
            .entry(offer.id.clone())
            .or_insert_with(|| {
                *dirty = true;
                ClaimRecord::discovered(offer, now)
            })
    }

    /// Explicit reset back to Discovered. Returns the previous status, or an
    /// error when the record does not exist.
    pub fn reset(
        &mut self,
        user: &str,
        offer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimStatus>> {
        let record = self
            .data
            .get_mut(user)
            .and_then(|records| records.get_mut(offer_id))
            .ok_or_else(|| anyhow!("no record for user '{user}' and offer '{offer_id}'"))?;
        let prev = reset_record(record, now);
        if prev.is_some() {
            self.dirty = true;
        }
        Ok(prev)
    }

    /// Replace the whole contents (used by migration).
    pub fn replace(&mut self, data: LedgerData) {
        self.data = data;
        self.dirty = true;
    }

    /// Write the ledger if anything changed since the last commit.
    #[instrument(skip_all, fields(path = %self.path.display(), dirty = self.dirty))]
    pub fn commit(&mut self) -> EngineResult<()> {
        if !self.dirty {
            return Ok(());
        }
        check_invariants(&self.data)
            .and_then(|()| write_data(&self.path, &self.data))
            .map_err(|err| persistence(&self.path, &err))?;
        self.dirty = false;
        debug!("ledger committed");
        Ok(())
    }
}

fn persistence(path: &Path, err: &anyhow::Error) -> EngineError {
    EngineError::Persistence {
        path: path.to_path_buf(),
        reason: format!("{err:#}"),
    }
}

fn load_data(path: &Path) -> Result<LedgerData> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read ledger {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse ledger {}", path.display()))?;
    validate_schema(&value)?;
    let data: LedgerData = serde_json::from_value(value)
        .with_context(|| format!("deserialize ledger {}", path.display()))?;
    check_invariants(&data)?;
    Ok(data)
}

fn check_invariants(data: &LedgerData) -> Result<()> {
    let errors = validate_invariants(data);
    if !errors.is_empty() {
        return Err(anyhow!("ledger invariants failed: {}", errors.join("; ")));
    }
    Ok(())
}

/// Validate a parsed ledger document against the bundled schema.
pub fn validate_schema(value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(LEDGER_SCHEMA).context("parse ledger schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "ledger schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn write_data(path: &Path, data: &LedgerData) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(data).context("serialize ledger")?;
    buf.push('\n');
    write_atomic(path, &buf, "json.tmp")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn offer(id: &str) -> Offer {
        Offer {
            id: id.to_string(),
            title: format!("{id} title"),
            url: format!("https://store.example/p/{id}"),
            tags: Vec::new(),
            base_of: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .expect("parse")
            .with_timezone(&Utc)
    }

    #[test]
    fn missing_file_is_empty_and_commits_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("store.json");
        let mut ledger = Ledger::open(&path).expect("open");
        assert!(ledger.data().is_empty());
        ledger.commit().expect("commit");
        assert!(!path.exists());
    }

    #[test]
    fn commit_then_reopen_preserves_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("store.json");
        let mut ledger = Ledger::open(&path).expect("open");
        let t = ledger.record_observation("alice", &offer("g1"), Observation::Claimed, t0());
        assert!(t.changed);
        ledger.commit().expect("commit");

        let reopened = Ledger::open(&path).expect("reopen");
        let record = reopened.get("alice", "g1").expect("record");
        assert_eq!(record.status, Some(ClaimStatus::Claimed));
        assert_eq!(record.first_seen, t0());
    }

    #[test]
    fn unchanged_observation_keeps_file_identical() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("store.json");
        let mut ledger = Ledger::open(&path).expect("open");
        ledger.record_observation("alice", &offer("g1"), Observation::Owned, t0());
        ledger.commit().expect("commit");
        let before = fs::read(&path).expect("read");

        let mut again = Ledger::open(&path).expect("reopen");
        let later = t0() + Duration::days(1);
        let t = again.record_observation("alice", &offer("g1"), Observation::Owned, later);
        assert!(!t.changed);
        assert!(!again.is_dirty());
        again.commit().expect("commit");
        assert_eq!(fs::read(&path).expect("read"), before);
    }

    #[test]
    fn rejects_schema_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("store.json");
        fs::write(
            &path,
            r#"{"alice":{"g1":{"title":"t","url":"u","firstSeen":"2024-01-01T00:00:00Z","lastUpdated":"2024-01-01T00:00:00Z","status":"won"}}}"#,
        )
        .expect("write");
        let err = Ledger::open(&path).expect_err("schema violation");
        assert!(matches!(err, EngineError::Persistence { .. }));
        assert!(err.to_string().contains("schema"));
    }

    #[test]
    fn rejects_invariant_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("store.json");
        fs::write(
            &path,
            r#"{"alice":{"g1":{"title":"t","url":"u","firstSeen":"2024-02-01T00:00:00Z","lastUpdated":"2024-01-01T00:00:00Z"}}}"#,
        )
        .expect("write");
        let err = Ledger::open(&path).expect_err("invariant violation");
        assert!(err.to_string().contains("invariants"));
    }

    #[test]
    fn commit_refuses_records_the_loader_would_reject() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("store.json");
        let mut ledger = Ledger::open(&path).expect("open");
        ledger.record_observation("alice", &offer(" x"), Observation::Claimed, t0());
        let err = ledger.commit().expect_err("untrimmed id");
        assert!(matches!(err, EngineError::Persistence { .. }));
        assert!(err.to_string().contains("trimmed"));
        assert!(!path.exists());
    }

    #[test]
    fn record_after_clock_step_back_reopens() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("store.json");
        let mut ledger = Ledger::open(&path).expect("open");
        ledger.discover("alice", &offer("g1"), t0());
        let earlier = t0() - Duration::seconds(5);
        ledger.record_observation("alice", &offer("g1"), Observation::Failed, earlier);
        ledger.commit().expect("commit");

        let reopened = Ledger::open(&path).expect("reopen");
        let record = reopened.get("alice", "g1").expect("record");
        assert_eq!(record.last_updated, record.first_seen);
    }

    #[test]
    fn reset_clears_status_and_requires_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut ledger = Ledger::open(&temp.path().join("store.json")).expect("open");
        ledger.record_observation("alice", &offer("g1"), Observation::Claimed, t0());
        let prev = ledger.reset("alice", "g1", t0()).expect("reset");
        assert_eq!(prev, Some(ClaimStatus::Claimed));
        assert_eq!(ledger.status("alice", "g1"), None);
        assert!(ledger.reset("alice", "missing", t0()).is_err());
    }

    #[test]
    fn discover_does_not_overwrite_existing_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut ledger = Ledger::open(&temp.path().join("store.json")).expect("open");
        ledger.discover("alice", &offer("g1"), t0());
        let mut renamed = offer("g1");
        renamed.title = "Renamed".to_string();
        let record = ledger.discover("alice", &renamed, t0() + Duration::hours(1));
        assert_eq!(record.title, "g1 title");
        assert_eq!(record.first_seen, t0());
    }
}
