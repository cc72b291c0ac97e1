//! Notification selection rules.
//!
//! Deterministic decisions about what a run reports: which events are worth
//! listing, whether a notification is sent at all, and the summary line.

use crate::core::types::{ClaimStatus, NotificationEvent};

/// Events worth listing (everything except `existed`).
pub fn reportable(events: &[NotificationEvent]) -> Vec<NotificationEvent> {
    events
        .iter()
        .filter(|event| event.status != ClaimStatus::Existed)
        .cloned()
        .collect()
}

/// A run notifies only when something was claimed or failed.
pub fn should_notify(events: &[NotificationEvent]) -> bool {
    events.iter().any(|event| event.status.is_noteworthy())
}

/// One-line summary, e.g. `store (alice): 1 claimed, 0 failed of 3 offers`.
pub fn summary_line(provider: &str, user: Option<&str>, events: &[NotificationEvent]) -> String {
    let claimed = count(events, ClaimStatus::Claimed);
    let failed = count(events, ClaimStatus::Failed);
    format!(
        "{}: {claimed} claimed, {failed} failed of {} offers",
        header(provider, user),
        events.len()
    )
}

/// `provider (user)` or just `provider` when the user is not known yet.
pub fn header(provider: &str, user: Option<&str>) -> String {
    match user {
        Some(user) => format!("{provider} ({user})"),
        None => provider.to_string(),
    }
}

/// Failure message for an aborted run: first line of the error only.
pub fn failure_line(provider: &str, error: &str) -> String {
    let first = error.lines().next().unwrap_or_default().trim();
    format!("{provider} failed: {first}")
}

fn count(events: &[NotificationEvent], status: ClaimStatus) -> usize {
    events.iter().filter(|event| event.status == status).count()
}
