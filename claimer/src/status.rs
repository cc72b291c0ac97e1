//! Ledger summaries for `claimer status`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::core::invariants::LedgerData;
use crate::core::types::ClaimStatus;

/// Per-user view of one provider ledger.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserSummary {
    /// Records per status; `None` counts discovered but unresolved offers.
    pub counts: BTreeMap<Option<ClaimStatus>, usize>,
    /// `(offer id, title)` of every `failed` record.
    pub failed: Vec<(String, String)>,
}

pub fn summarize(data: &LedgerData) -> BTreeMap<String, UserSummary> {
    data.iter()
        .map(|(user, records)| {
            let mut summary = UserSummary::default();
            for (id, record) in records {
                *summary.counts.entry(record.status).or_default() += 1;
                if record.status == Some(ClaimStatus::Failed) {
                    summary.failed.push((id.clone(), record.title.clone()));
                }
            }
            (user.clone(), summary)
        })
        .collect()
}

/// Plain-text report, one block per user.
pub fn render(provider: &str, summaries: &BTreeMap<String, UserSummary>) -> String {
    let mut out = String::new();
    if summaries.is_empty() {
        let _ = writeln!(out, "{provider}: no records");
        return out;
    }
    for (user, summary) in summaries {
        let _ = writeln!(out, "{provider} ({user}):");
        for (status, count) in &summary.counts {
            let label = status.map_or("discovered", ClaimStatus::as_str);
            let _ = writeln!(out, "  {label}: {count}");
        }
        for (id, title) in &summary.failed {
            let _ = writeln!(out, "  failed: {id} ({title})");
        }
    }
    out
}
