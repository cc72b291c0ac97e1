//! One-time code source: TOTP from a stored seed, else a validated prompt.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::time::Instant;
use tracing::warn;

use crate::core::otp::{is_valid_code, totp};
use crate::io::prompt::Prompter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpSource {
    seed: Option<String>,
    length: usize,
}

impl OtpSource {
    pub fn new(seed: Option<String>, length: usize) -> Self {
        Self {
            seed: seed.filter(|seed| !seed.trim().is_empty()),
            length,
        }
    }

    pub fn has_seed(&self) -> bool {
        self.seed.is_some()
    }

    /// Next code, or `None` when no seed is stored and nobody answered in
    /// time. Prompted answers of the wrong shape are asked again.
    pub async fn code(
        &self,
        prompter: Option<&dyn Prompter>,
        timeout: Duration,
    ) -> Result<Option<String>> {
        if let Some(seed) = &self.seed {
            let now = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
            let code = totp(seed, now, self.length).context("derive otp from seed")?;
            return Ok(Some(code));
        }
        let Some(prompter) = prompter else {
            return Ok(None);
        };

        let deadline = Instant::now() + timeout;
        let question = format!("Enter {}-digit one-time code", self.length);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let Some(answer) = prompter.ask(&question, false, remaining).await? else {
                return Ok(None);
            };
            if is_valid_code(&answer, self.length) {
                return Ok(Some(answer));
            }
            warn!(expected_len = self.length, "one-time code has the wrong shape");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedPrompter;

    const T: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn seed_derives_a_code_of_the_configured_length() {
        let source = OtpSource::new(Some("GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ".to_string()), 6);
        let code = source.code(None, T).await.expect("code").expect("some");
        assert!(is_valid_code(&code, 6));
    }

    #[tokio::test]
    async fn prompt_is_repeated_until_valid() {
        let prompter = ScriptedPrompter::new(vec![
            Some("12".to_string()),
            Some("12ab".to_string()),
            Some("1234".to_string()),
        ]);
        let source = OtpSource::new(None, 4);
        let code = source.code(Some(&prompter), T).await.expect("code");
        assert_eq!(code.as_deref(), Some("1234"));
        assert_eq!(prompter.questions().len(), 3);
    }

    #[tokio::test]
    async fn no_seed_and_no_prompter_is_none() {
        let source = OtpSource::new(Some("  ".to_string()), 6);
        assert!(!source.has_seed());
        assert!(source.code(None, T).await.expect("code").is_none());
    }

    #[tokio::test]
    async fn invalid_seed_is_an_error() {
        let source = OtpSource::new(Some("!!".to_string()), 6);
        assert!(source.code(None, T).await.is_err());
    }
}
