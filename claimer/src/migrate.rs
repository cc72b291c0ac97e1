//! Conversion of legacy ledgers into the current record format.
//!
//! Legacy records carry one `time` field (`YYYY-MM-DD HH:MM:SS.mmm` in local
//! time, or with a trailing `Z` for UTC) instead of `firstSeen`/`lastUpdated`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument};

use crate::core::invariants::{LedgerData, validate_invariants};
use crate::core::types::{ClaimRecord, ClaimStatus};
use crate::io::ledger::{Ledger, validate_schema};

const LEGACY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Debug, Deserialize)]
struct LegacyRecord {
    title: String,
    url: String,
    time: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Migration {
    /// File already in the current format; left untouched.
    Current,
    /// Converted `records` entries; the original was kept at `backup`.
    Converted { records: usize, backup: PathBuf },
}

/// Rewrite the legacy ledger at `path` in place, keeping a `.bak` copy.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn migrate_file(path: &Path) -> Result<Migration> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    if validate_schema(&value).is_ok() {
        info!("already current");
        return Ok(Migration::Current);
    }

    let data = convert(value).with_context(|| format!("convert {}", path.display()))?;
    let errors = validate_invariants(&data);
    if !errors.is_empty() {
        bail!("converted ledger is inconsistent: {}", errors.join("; "));
    }
    let records = data.values().map(BTreeMap::len).sum();

    let backup = backup_path(path);
    fs::copy(path, &backup).with_context(|| format!("back up to {}", backup.display()))?;
    let mut ledger = Ledger::empty(path);
    ledger.replace(data);
    ledger.commit()?;
    info!(records, backup = %backup.display(), "migrated");
    Ok(Migration::Converted { records, backup })
}

fn convert(value: Value) -> Result<LedgerData> {
    let legacy: BTreeMap<String, BTreeMap<String, LegacyRecord>> =
        serde_json::from_value(value).context("legacy ledger shape")?;
    let mut data = LedgerData::new();
    for (user, records) in legacy {
        let converted = records
            .into_iter()
            .map(|(id, record)| {
                let record = convert_record(record).with_context(|| format!("{user}/{id}"))?;
                Ok((id, record))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        data.insert(user, converted);
    }
    Ok(data)
}

fn convert_record(record: LegacyRecord) -> Result<ClaimRecord> {
    let time = parse_legacy_time(&record.time)?;
    Ok(ClaimRecord {
        title: record.title,
        url: record.url,
        first_seen: time,
        status: record.status.as_deref().map(parse_legacy_status).transpose()?,
        last_updated: time,
    })
}

/// Parse a legacy timestamp; without a trailing `Z` it is local time.
pub fn parse_legacy_time(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Some(utc) = raw.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(utc.trim_end(), LEGACY_TIME_FORMAT)
            .with_context(|| format!("invalid timestamp '{raw}'"))?;
        return Ok(Utc.from_utc_datetime(&naive));
    }
    let naive = NaiveDateTime::parse_from_str(raw, LEGACY_TIME_FORMAT)
        .with_context(|| format!("invalid timestamp '{raw}'"))?;
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| anyhow!("timestamp '{raw}' does not exist in the local timezone"))?;
    Ok(local.with_timezone(&Utc))
}

fn parse_legacy_status(raw: &str) -> Result<ClaimStatus> {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "unavailable-in-region" => return Ok(ClaimStatus::UnavailableRegion),
        "requires base game" => return Ok(ClaimStatus::RequiresBaseGame),
        _ => {}
    }
    ClaimStatus::ALL
        .into_iter()
        .find(|status| status.as_str() == normalized)
        .ok_or_else(|| anyhow!("unknown status '{raw}'"))
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}
