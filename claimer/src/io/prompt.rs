//! Interactive prompts for credentials, codes and claim confirmation.
//!
//! Every prompt is bounded: an unanswered question resolves to `None` after
//! its timeout so a forgotten terminal never blocks a run.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rustyline::Editor;
use rustyline::config::{ColorMode, Configurer};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::history::DefaultHistory;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::io::config::Account;
use crate::io::driver::Credentials;

#[async_trait]
pub trait Prompter: Send + Sync {
    /// Ask `question`. `None` when unanswered within `timeout` or on EOF.
    async fn ask(&self, question: &str, secret: bool, timeout: Duration)
    -> Result<Option<String>>;
}

/// Blocking line reader driven by the prompt input thread.
pub trait LineSource {
    /// Show `prompt` and read one line. `Ok(None)` on EOF.
    fn read_line(&mut self, prompt: &str, secret: bool) -> Result<Option<String>>;
}

struct Request {
    id: u64,
    prompt: String,
    secret: bool,
}

struct Reply {
    id: u64,
    line: Result<Option<String>>,
}

/// Prompts on the terminal from one dedicated input thread.
///
/// The thread owns the reader for the prompter's lifetime, so buffered input
/// is never lost between questions. A question that times out stops waiting;
/// the line that eventually answers it is dropped instead of answering the
/// next question.
pub struct TerminalPrompter {
    requests: std_mpsc::Sender<Request>,
    replies: Mutex<mpsc::UnboundedReceiver<Reply>>,
    next_id: AtomicU64,
}

impl TerminalPrompter {
    /// Read answers from the terminal; secrets are masked while typed.
    pub fn new() -> Result<Self> {
        Self::with_source(EditorSource::new)
    }

    /// Read answers from the source built by `make` on the input thread.
    pub fn with_source<S, F>(make: F) -> Result<Self>
    where
        S: LineSource,
        F: FnOnce() -> Result<S> + Send + 'static,
    {
        let (requests, pending) = std_mpsc::channel::<Request>();
        let (answers, replies) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name("prompt-input".to_string())
            .spawn(move || {
                let mut source = match make() {
                    Ok(source) => source,
                    Err(err) => {
                        warn!(err = %format!("{err:#}"), "prompt input unavailable");
                        return;
                    }
                };
                for request in pending {
                    let line = source.read_line(&request.prompt, request.secret);
                    if answers.send(Reply { id: request.id, line }).is_err() {
                        break;
                    }
                }
            })
            .context("spawn prompt input thread")?;
        Ok(Self {
            requests,
            replies: Mutex::new(replies),
            next_id: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn ask(
        &self,
        question: &str,
        secret: bool,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut replies = self.replies.lock().await;
        self.requests
            .send(Request {
                id,
                prompt: format!("{question}: "),
                secret,
            })
            .map_err(|_| anyhow!("prompt input thread stopped"))?;

        let answer = async {
            while let Some(reply) = replies.recv().await {
                if reply.id == id {
                    return Some(reply.line);
                }
                debug!(prompt_id = reply.id, "dropping answer to an expired prompt");
            }
            None
        };
        match tokio::time::timeout(timeout, answer).await {
            Ok(Some(line)) => Ok(line?
                .map(|answer| answer.trim().to_string())
                .filter(|answer| !answer.is_empty())),
            Ok(None) => Err(anyhow!("prompt input thread stopped")),
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "prompt timed out");
                Ok(None)
            }
        }
    }
}

/// Hides typed characters while `masking` is set.
#[derive(Default, Completer, Helper, Hinter, Validator)]
struct Masking {
    masking: bool,
}

impl Highlighter for Masking {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if self.masking {
            Cow::Owned("*".repeat(line.chars().count()))
        } else {
            Cow::Borrowed(line)
        }
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        self.masking
    }
}

struct EditorSource {
    editor: Editor<Masking, DefaultHistory>,
}

impl EditorSource {
    fn new() -> Result<Self> {
        let mut editor = Editor::new().context("open terminal for prompts")?;
        editor.set_helper(Some(Masking::default()));
        editor.set_color_mode(ColorMode::Forced);
        Ok(Self { editor })
    }
}

impl LineSource for EditorSource {
    fn read_line(&mut self, prompt: &str, secret: bool) -> Result<Option<String>> {
        if let Some(helper) = self.editor.helper_mut() {
            helper.masking = secret;
        }
        match self.editor.readline(prompt) {
            Ok(line) => Ok(Some(line)),
            Err(ReadlineError::Eof | ReadlineError::Interrupted) => Ok(None),
            Err(err) => Err(err).context("read answer"),
        }
    }
}

/// Resolve login credentials: configured fields first, then prompts.
///
/// Returns `None` when either half is still missing.
pub async fn resolve_credentials(
    account: &Account,
    prompter: Option<&dyn Prompter>,
    timeout: Duration,
) -> Result<Option<Credentials>> {
    let username = match non_empty(&account.email) {
        Some(email) => Some(email),
        None => ask(prompter, "Enter email", false, timeout).await?,
    };
    let Some(username) = username else {
        return Ok(None);
    };
    let password = match non_empty(&account.password) {
        Some(password) => Some(password),
        None => ask(prompter, "Enter password", true, timeout).await?,
    };
    Ok(password.map(|password| Credentials { username, password }))
}

/// Yes/no question. Anything but an explicit yes (including timeout) is no.
pub async fn confirm(prompter: &dyn Prompter, question: &str, timeout: Duration) -> Result<bool> {
    let answer = prompter
        .ask(&format!("{question} [y/N]"), false, timeout)
        .await?;
    Ok(answer.is_some_and(|answer| {
        let answer = answer.to_ascii_lowercase();
        answer == "y" || answer == "yes"
    }))
}

async fn ask(
    prompter: Option<&dyn Prompter>,
    question: &str,
    secret: bool,
    timeout: Duration,
) -> Result<Option<String>> {
    match prompter {
        Some(prompter) => prompter.ask(question, secret, timeout).await,
        None => Ok(None),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
