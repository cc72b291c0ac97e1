//! Diagnostic screenshots: `<root>/<provider>/<offer-id> <timestamp>.png`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::io::driver::{PageDriver, within};

/// Replace characters that are unsafe in file names on common filesystems.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn screenshot_path(root: &Path, provider: &str, offer_id: &str, now: DateTime<Utc>) -> PathBuf {
    let stamp = now.format("%Y-%m-%d %H:%M:%S");
    root.join(sanitize_file_name(provider))
        .join(sanitize_file_name(&format!("{offer_id} {stamp}.png")))
}

/// Ask the driver for a screenshot. Failures are logged and ignored.
///
/// Returns the written path, or `None` when screenshots are disabled or the
/// capture did not complete.
pub async fn capture(
    driver: &mut dyn PageDriver,
    root: Option<&Path>,
    provider: &str,
    offer_id: &str,
    timeout: Duration,
) -> Option<PathBuf> {
    let root = root?;
    let path = screenshot_path(root, provider, offer_id, Utc::now());
    if let Some(parent) = path.parent()
        && let Err(err) = tokio::fs::create_dir_all(parent).await
    {
        warn!(err = %err, dir = %parent.display(), "cannot create screenshot dir");
        return None;
    }
    match within(timeout, driver.screenshot(&path)).await {
        Ok(Some(())) => {
            debug!(path = %path.display(), "screenshot saved");
            Some(path)
        }
        Ok(None) => {
            warn!(offer_id, "screenshot timed out");
            None
        }
        Err(err) => {
            warn!(offer_id, err = %format!("{err:#}"), "screenshot failed");
            None
        }
    }
}
