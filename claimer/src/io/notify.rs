//! Notification rendering and delivery.
//!
//! Delivery is best-effort: [`dispatch`] logs a failed send and returns, so a
//! broken notifier never changes a run's outcome.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use minijinja::{Environment, HtmlEscape, context};
use tracing::{debug, info, instrument, warn};

use crate::core::notification::{failure_line, header, reportable, should_notify, summary_line};
use crate::core::types::NotificationEvent;
use crate::io::config::EngineConfig;
use crate::io::process::run_command_with_timeout;

const NOTIFICATION_TEMPLATE: &str = include_str!("templates/notification.html");
const NOTIFY_OUTPUT_LIMIT_BYTES: usize = 16 * 1024;

/// Rendered message handed to a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Configured title, if any.
    pub title: Option<String>,
    /// HTML body.
    pub body: String,
    /// One-line plain-text summary.
    pub summary: String,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Builds notifications for one provider run.
pub struct Notifier {
    env: Environment<'static>,
    title: Option<String>,
}

impl Notifier {
    pub fn new(title: Option<String>) -> Self {
        let mut env = Environment::new();
        // `.html` name turns on HTML auto-escaping for titles and urls.
        env.add_template("notification.html", NOTIFICATION_TEMPLATE)
            .expect("notification template should be valid");
        Self { env, title }
    }

    /// End-of-run notification, or `None` when nothing was claimed or failed.
    pub fn run_summary(
        &self,
        provider: &str,
        user: &str,
        events: &[NotificationEvent],
    ) -> Result<Option<Notification>> {
        if !should_notify(events) {
            return Ok(None);
        }
        let template = self.env.get_template("notification.html")?;
        let body = template.render(context! {
            header => header(provider, Some(user)),
            events => reportable(events),
        })?;
        Ok(Some(Notification {
            title: self.title.clone(),
            body,
            summary: summary_line(provider, Some(user), events),
        }))
    }

    /// Aborted-run notification carrying the first line of the error.
    pub fn failure(&self, provider: &str, error: &str) -> Notification {
        let line = failure_line(provider, error);
        Notification {
            title: self.title.clone(),
            body: HtmlEscape(&line).to_string(),
            summary: line,
        }
    }

    /// Free-form notice (captcha, missing credentials).
    pub fn notice(&self, provider: &str, message: &str) -> Notification {
        let line = format!("{provider}: {message}");
        Notification {
            title: self.title.clone(),
            body: HtmlEscape(&line).to_string(),
            summary: line,
        }
    }
}

/// Notifier plus sink, shared by the session manager, claim machine and coordinator.
pub struct Alerts {
    notifier: Notifier,
    sink: Arc<dyn NotificationSink>,
}

impl Alerts {
    pub fn new(title: Option<String>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            notifier: Notifier::new(title),
            sink,
        }
    }

    pub async fn notice(&self, provider: &str, message: &str) -> bool {
        dispatch(self.sink.as_ref(), &self.notifier.notice(provider, message)).await
    }

    pub async fn failure(&self, provider: &str, error: &str) -> bool {
        dispatch(self.sink.as_ref(), &self.notifier.failure(provider, error)).await
    }

    /// Send the end-of-run summary if the run warrants one.
    ///
    /// Returns whether a notification was dispatched.
    pub async fn run_summary(
        &self,
        provider: &str,
        user: &str,
        events: &[NotificationEvent],
    ) -> Result<bool> {
        match self.notifier.run_summary(provider, user, events)? {
            Some(notification) => Ok(dispatch(self.sink.as_ref(), &notification).await),
            None => {
                debug!(provider, "nothing claimed or failed, staying silent");
                Ok(false)
            }
        }
    }
}

/// Send `notification`, logging instead of failing.
///
/// Returns whether delivery succeeded.
#[instrument(skip_all, fields(summary = %notification.summary))]
pub async fn dispatch(sink: &dyn NotificationSink, notification: &Notification) -> bool {
    match sink.send(notification).await {
        Ok(()) => {
            info!("notification sent");
            true
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "notification delivery failed");
            false
        }
    }
}

/// Sink for the configured notifier: apprise when a URL is set, else no-op.
pub fn sink_from_config(config: &EngineConfig) -> Arc<dyn NotificationSink> {
    match &config.notify.url {
        Some(url) => Arc::new(AppriseNotifier::new(url.clone(), config.notify_timeout())),
        None => Arc::new(NullNotifier),
    }
}

/// Delivers through the `apprise` CLI: `apprise <url> -i html -b <body> [-t <title>]`.
#[derive(Debug, Clone)]
pub struct AppriseNotifier {
    program: String,
    url: String,
    timeout: Duration,
}

impl AppriseNotifier {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self::with_program("apprise", url, timeout)
    }

    /// Use a different executable (tests, wrappers).
    pub fn with_program(program: impl Into<String>, url: String, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            url,
            timeout,
        }
    }

    fn command(&self, notification: &Notification) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.url)
            .args(["-i", "html", "-b"])
            .arg(&notification.body);
        if let Some(title) = &notification.title {
            cmd.args(["-t", title]);
        }
        cmd
    }
}

#[async_trait]
impl NotificationSink for AppriseNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let cmd = self.command(notification);
        let timeout = self.timeout;
        let output = tokio::task::spawn_blocking(move || {
            run_command_with_timeout(cmd, timeout, NOTIFY_OUTPUT_LIMIT_BYTES)
        })
        .await
        .context("join notifier task")??;
        if output.succeeded() {
            return Ok(());
        }
        if output.timed_out {
            return Err(anyhow!("{} timed out after {:?}", self.program, timeout));
        }
        Err(anyhow!(
            "{} exited with {:?}: {}",
            self.program,
            output.status.code(),
            output.first_error_line().unwrap_or_default()
        ))
    }
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl NotificationSink for NullNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        debug!(summary = %notification.summary, "notifications disabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ClaimStatus;
    use crate::test_support::RecordingNotifier;

    fn event(title: &str, id: &str, status: ClaimStatus) -> NotificationEvent {
        NotificationEvent {
            title: title.to_string(),
            url: format!("https://s.example/p/{id}"),
            status,
        }
    }

    #[test]
    fn renders_reportable_events_as_html_list() {
        let notifier = Notifier::new(Some("Free games".to_string()));
        let events = vec![
            event("Alpha", "a", ClaimStatus::Claimed),
            event("Beta", "b", ClaimStatus::Existed),
            event("Gamma", "c", ClaimStatus::Failed),
        ];
        let notification = notifier
            .run_summary("store", "alice", &events)
            .expect("render")
            .expect("notify");
        let lines: Vec<&str> = notification.body.split("<br>").collect();
        assert_eq!(lines.len(), 3, "{}", notification.body);
        assert_eq!(lines[0], "store (alice):");
        assert!(lines[1].starts_with("- <a href=\"https:"));
        assert!(lines[1].ends_with(">Alpha</a> (claimed)"));
        assert!(lines[2].ends_with(">Gamma</a> (failed)"));
        assert!(!notification.body.contains("Beta"));
        assert_eq!(notification.title.as_deref(), Some("Free games"));
        assert_eq!(notification.summary, "store (alice): 1 claimed, 1 failed of 3 offers");
    }

    #[test]
    fn titles_are_escaped() {
        let notifier = Notifier::new(None);
        let events = vec![event("Tom & Jerry <DX>", "tj", ClaimStatus::Claimed)];
        let notification = notifier
            .run_summary("store", "alice", &events)
            .expect("render")
            .expect("notify");
        assert!(notification.body.contains("Tom &amp; Jerry &lt;DX&gt;"));
    }

    #[test]
    fn all_existed_renders_nothing() {
        let notifier = Notifier::new(None);
        let events = vec![event("Alpha", "a", ClaimStatus::Existed)];
        assert!(notifier.run_summary("store", "alice", &events).expect("render").is_none());
    }

    #[test]
    fn failure_uses_first_error_line() {
        let notification = Notifier::new(None).failure("store", "login <failed>\nstack");
        assert_eq!(notification.summary, "store failed: login <failed>");
        assert_eq!(notification.body, "store failed: login &lt;failed&gt;");
    }

    #[test]
    fn notices_are_escaped_like_summaries() {
        let notification = Notifier::new(None).notice("store", "captcha while claiming 'Tom & Jerry'");
        assert_eq!(notification.summary, "store: captcha while claiming 'Tom & Jerry'");
        assert!(notification.body.contains("Tom &amp; Jerry"), "{}", notification.body);
        assert!(!notification.body.contains('\''));
    }

    #[tokio::test]
    async fn dispatch_reports_delivery_errors_without_failing() {
        let sink = RecordingNotifier::failing();
        let notification = Notifier::new(None).notice("store", "captcha");
        assert!(!dispatch(&sink, &notification).await);
        assert_eq!(sink.sent().len(), 1);
    }

    #[test]
    fn apprise_command_line_matches_cli_contract() {
        let notifier = AppriseNotifier::new("tgram://token/chat".to_string(), Duration::from_secs(5));
        let notification = Notification {
            title: Some("T".to_string()),
            body: "<b>hi</b>".to_string(),
            summary: "hi".to_string(),
        };
        let cmd = notifier.command(&notification);
        let args: Vec<String> = cmd
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.get_program(), "apprise");
        assert_eq!(args, vec!["tgram://token/chat", "-i", "html", "-b", "<b>hi</b>", "-t", "T"]);
    }

    #[tokio::test]
    async fn unconfigured_url_drops_notifications() {
        let sink = sink_from_config(&EngineConfig::default());
        let notification = Notifier::new(None).notice("store", "hello");
        assert!(dispatch(sink.as_ref(), &notification).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn apprise_failure_is_an_error() {
        let notifier =
            AppriseNotifier::with_program("false", "x://y".to_string(), Duration::from_secs(5));
        let notification = Notifier::new(None).notice("store", "hello");
        assert!(notifier.send(&notification).await.is_err());
    }
}
