//! Semantic ledger invariants not expressible via JSON Schema.

use std::collections::BTreeMap;

use crate::core::types::ClaimRecord;

/// Ledger contents: `user → offer id → record`.
pub type LedgerData = BTreeMap<String, BTreeMap<String, ClaimRecord>>;

/// Check semantic invariants of loaded ledger data:
/// - user keys and offer ids are non-empty and trimmed
/// - `lastUpdated >= firstSeen`
/// - records carry a non-empty url
pub fn validate_invariants(data: &LedgerData) -> Vec<String> {
    let mut errors = Vec::new();
    for (user, records) in data {
        if user.is_empty() || user.trim() != user {
            errors.push(format!("user key '{user}' must be non-empty and trimmed"));
        }
        for (id, record) in records {
            let path = format!("{user}/{id}");
            if id.is_empty() || id.trim() != id {
                errors.push(format!("{path}: offer id must be non-empty and trimmed"));
            }
            if record.url.trim().is_empty() {
                errors.push(format!("{path}: url must be non-empty"));
            }
            if record.last_updated < record.first_seen {
                errors.push(format!(
                    "{path}: lastUpdated {} precedes firstSeen {}",
                    record.last_updated.to_rfc3339(),
                    record.first_seen.to_rfc3339()
                ));
            }
        }
    }
    errors
}
