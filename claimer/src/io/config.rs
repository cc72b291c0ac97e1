//! Engine configuration stored in `data/config.toml`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::filter::ExclusionRules;
use crate::io::atomic::write_atomic;

pub const DEFAULT_CONFIG_PATH: &str = "data/config.toml";

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields take the
/// defaults below; unknown providers get [`ProviderConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Root for ledgers (`<provider>.json`) and run history.
    pub data_dir: PathBuf,

    /// Root for diagnostic screenshots. An empty path disables them.
    pub screenshots_dir: PathBuf,

    /// No human can intervene: never prompt, never wait for manual login.
    pub headless: bool,

    /// Stop before the claim action and record `skipped`.
    pub dry_run: bool,

    /// Ask before each claim; anything but yes records `skipped`.
    pub confirm_claims: bool,

    /// Bound for each individual signal wait.
    pub step_timeout_secs: u64,

    /// Login window, also used as the prompt timeout.
    pub login_timeout_secs: u64,

    /// Wait for manual sign-in without a deadline (interactive only).
    pub wait_for_manual_login: bool,

    /// Login form submissions per authentication.
    pub max_login_attempts: u32,

    /// Re-authentications allowed per offer after a session loss.
    pub max_reauth_attempts: u32,

    /// Append a JSON line per run to `<data_dir>/history/<provider>.jsonl`.
    pub write_history: bool,

    pub notify: NotifyConfig,

    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            screenshots_dir: PathBuf::from("data/screenshots"),
            headless: true,
            dry_run: false,
            confirm_claims: false,
            step_timeout_secs: 60,
            login_timeout_secs: 180,
            wait_for_manual_login: false,
            max_login_attempts: 3,
            max_reauth_attempts: 2,
            write_history: true,
            notify: NotifyConfig::default(),
            providers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    /// Apprise target URL(s). `None` disables notifications.
    pub url: Option<String>,
    pub title: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            url: None,
            title: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Expected one-time code length.
    pub otp_length: usize,
    pub exclude_title_suffixes: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub exclude_title_patterns: Vec<String>,
    /// Skip offers the ledger already resolved as `claimed` or `existed`.
    pub skip_resolved: bool,
    /// Prefix for relative offer URLs.
    pub base_url: Option<String>,
    pub account: Account,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            otp_length: 6,
            exclude_title_suffixes: Vec::new(),
            exclude_tags: Vec::new(),
            exclude_title_patterns: Vec::new(),
            skip_resolved: false,
            base_url: None,
            account: Account::default(),
        }
    }
}

impl ProviderConfig {
    pub fn exclusion_rules(&self) -> Result<ExclusionRules> {
        ExclusionRules::new(
            &self.exclude_title_suffixes,
            &self.exclude_tags,
            &self.exclude_title_patterns,
        )
        .context("compile exclude_title_patterns")
    }
}

/// Stored account fields. Each one may be absent and prompted for instead.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Account {
    pub email: Option<String>,
    pub password: Option<String>,
    pub otp_seed: Option<String>,
    pub pin: Option<String>,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "<redacted>");
        f.debug_struct("Account")
            .field("email", &self.email)
            .field("password", &redact(&self.password))
            .field("otp_seed", &redact(&self.otp_seed))
            .field("pin", &redact(&self.pin))
            .finish()
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(anyhow!("data_dir must be non-empty"));
        }
        if self.step_timeout_secs == 0 {
            return Err(anyhow!("step_timeout_secs must be > 0"));
        }
        if self.login_timeout_secs == 0 {
            return Err(anyhow!("login_timeout_secs must be > 0"));
        }
        if self.max_login_attempts == 0 {
            return Err(anyhow!("max_login_attempts must be > 0"));
        }
        if self.notify.timeout_secs == 0 {
            return Err(anyhow!("notify.timeout_secs must be > 0"));
        }
        if self.notify.url.as_deref().is_some_and(|url| url.trim().is_empty()) {
            return Err(anyhow!("notify.url must be non-empty when set"));
        }
        for (name, provider) in &self.providers {
            if name.trim().is_empty() {
                return Err(anyhow!("provider names must be non-empty"));
            }
            if !(4..=8).contains(&provider.otp_length) {
                return Err(anyhow!("providers.{name}.otp_length must be within 4..=8"));
            }
            provider
                .exclusion_rules()
                .with_context(|| format!("providers.{name}"))?;
        }
        Ok(())
    }

    /// Settings for `name`, or defaults when the provider is not configured.
    pub fn provider(&self, name: &str) -> ProviderConfig {
        self.providers.get(name).cloned().unwrap_or_default()
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify.timeout_secs)
    }

    pub fn screenshots_root(&self) -> Option<&Path> {
        if self.screenshots_dir.as_os_str().is_empty() {
            None
        } else {
            Some(&self.screenshots_dir)
        }
    }

    pub fn ledger_path(&self, provider: &str) -> PathBuf {
        self.data_dir.join(format!("{provider}.json"))
    }

    pub fn history_path(&self, provider: &str) -> PathBuf {
        self.data_dir.join("history").join(format!("{provider}.jsonl"))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf, "toml.tmp")
}
