//! Notifier: tell an operator how the run went

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snapback_models::{byte_count_iec, RunOutcome};

/// Telegram rejects messages longer than this
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

const DEFAULT_API_URL: &str = "https://api.telegram.org";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, outcome: &RunOutcome) -> Result<()>;
}

/// Sends the report through the Telegram Bot API
pub struct TelegramNotifier {
    http: reqwest::Client,
    api_url: String,
    bot_token: String,
    chat_id: i64,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    description: Option<String>,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: i64) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: DEFAULT_API_URL.to_string(),
            bot_token,
            chat_id,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Give up on a request that has not completed within `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Point at a different Bot API server
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, outcome: &RunOutcome) -> Result<()> {
        let text = format_report(outcome);
        let url = format!("{}/bot{}/sendMessage", self.api_url.trim_end_matches('/'), self.bot_token);

        let response = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(&SendMessage {
                chat_id: self.chat_id,
                text: &text,
                parse_mode: "HTML",
                disable_web_page_preview: true,
            })
            .send()
            .await
            .context("Failed to reach Telegram")?;

        let status = response.status();
        let body: TelegramResponse = response
            .json()
            .await
            .with_context(|| format!("Unexpected Telegram response ({})", status))?;

        if !body.ok {
            bail!(
                "Telegram refused the message ({}): {}",
                status,
                body.description.unwrap_or_default()
            );
        }
        Ok(())
    }
}

/// Build the HTML report: headline, archive size, error, and as much of the
/// log tail as fits in one message
pub fn format_report(outcome: &RunOutcome) -> String {
    let mut head = String::new();
    if outcome.succeeded {
        head.push_str(&format!("✅ Backup of {} has <b>succeeded</b>\n", escape_html(&outcome.workload)));
    } else {
        head.push_str(&format!("❌ Backup of {} has <b>failed</b>\n", escape_html(&outcome.workload)));
    }

    if let Some(size) = outcome.archive_size_bytes {
        head.push_str(&format!("Tarball size: {}\n", byte_count_iec(size)));
    }

    if let Some(error) = &outcome.error {
        head.push_str(&format!("Error: <code>{}</code>\n", escape_html(error)));
    }

    head.push_str("\nLog output was:\n<pre>");
    let tail = "</pre>";

    let budget = TELEGRAM_MESSAGE_LIMIT.saturating_sub(head.chars().count() + tail.chars().count());
    let log = tail_lines_within(&outcome.captured_log, budget);

    format!("{}{}{}", head, log, tail)
}

/// Escape the log line by line and keep the newest lines that fit in `budget` characters
fn tail_lines_within(log: &str, budget: usize) -> String {
    const MARKER: &str = "…\n";

    let escaped = escape_html(log);
    if escaped.chars().count() <= budget {
        return escaped;
    }

    let budget = budget.saturating_sub(MARKER.chars().count());
    let mut kept: Vec<String> = Vec::new();
    let mut used = 0;
    for line in log.lines().rev() {
        let line = escape_html(line);
        let cost = line.chars().count() + 1;
        if used + cost > budget {
            break;
        }
        used += cost;
        kept.push(line);
    }

    let mut out = String::from(MARKER);
    for line in kept.iter().rev() {
        out.push_str(line);
        out.push('\n');
    }
    out
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
