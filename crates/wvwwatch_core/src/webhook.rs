use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::diff::{DiffResult, WorldPopulationDelta};
use crate::http::build_client;
use crate::monitor::Notifier;
use crate::report::render_full_report;
use crate::worlds::WorldNames;

pub const MAX_EMBED_DESCRIPTION_CHARS: usize = 4096;
pub const MAX_FIELD_CHARS: usize = 1024;
pub const CHANGE_EMBED_TITLE: &str = "World assignment changes";
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const DEFAULT_RETRY_AFTER_SECS: f64 = 1.0;
const MAX_RETRY_AFTER_SECS: u64 = 300;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbedImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedAuthor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedImage {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
}

/// Identity of a message the webhook created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedMessage {
    pub id: String,
    pub channel_id: String,
}

pub trait WebhookApi {
    fn post_embeds(&mut self, embeds: &[Embed]) -> Result<PostedMessage>;
    fn delete_message(&mut self, message_id: &str) -> Result<()>;
}

pub struct WebhookClient {
    client: Client,
    base_url: Url,
    post_url: Url,
}

impl WebhookClient {
    pub fn new(webhook_url: &str, user_agent: &str, timeout_ms: u64) -> Result<Self> {
        let base = webhook_url.trim();
        let base = base.split('?').next().unwrap_or(base).trim_end_matches('/');
        let base_url =
            Url::parse(base).with_context(|| format!("invalid webhook URL: {webhook_url}"))?;
        let post_url = Url::parse(&with_wait(webhook_url.trim()))
            .with_context(|| format!("invalid webhook URL: {webhook_url}"))?;
        Ok(Self {
            client: build_client(user_agent, timeout_ms)?,
            base_url,
            post_url,
        })
    }

    fn message_url(&self, message_id: &str) -> Result<Url> {
        let raw = format!("{}/messages/{message_id}", self.base_url.as_str());
        Url::parse(&raw).with_context(|| format!("invalid message URL: {raw}"))
    }

    fn send_with_rate_limit(&self, build: impl Fn() -> RequestBuilder) -> Result<Response> {
        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = build().send().context("failed to call webhook")?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }
            let body: Value = response.json().unwrap_or(Value::Null);
            let delay = retry_after_delay(&body);
            warn!(
                attempt,
                delay_ms = delay_millis(delay),
                "webhook rate limited"
            );
            sleep(delay);
        }
        bail!("webhook still rate limited after {MAX_RATE_LIMIT_RETRIES} retries")
    }
}

impl WebhookApi for WebhookClient {
    fn post_embeds(&mut self, embeds: &[Embed]) -> Result<PostedMessage> {
        let payload = json!({ "embeds": embeds });
        let response =
            self.send_with_rate_limit(|| self.client.post(self.post_url.clone()).json(&payload))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("webhook post failed with HTTP {status}: {body}");
        }
        let body: Value = response
            .json()
            .context("failed to decode webhook response")?;
        let message = parse_posted_message(&body)?;
        debug!(message_id = %message.id, "posted webhook message");
        Ok(message)
    }

    fn delete_message(&mut self, message_id: &str) -> Result<()> {
        let url = self.message_url(message_id)?;
        let response = self.send_with_rate_limit(|| self.client.delete(url.clone()))?;
        let status = response.status();
        if matches!(
            status,
            StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND
        ) {
            return Ok(());
        }
        let body = response.text().unwrap_or_default();
        bail!("failed to delete message {message_id}: HTTP {status} {body}")
    }
}

/// Append `wait=true` so the webhook answers with the created message.
pub fn with_wait(url: &str) -> String {
    if url.contains("wait=true") {
        url.to_string()
    } else if url.contains('?') {
        format!("{url}&wait=true")
    } else {
        format!("{url}?wait=true")
    }
}

/// Discord reports `retry_after` in seconds; some older responses use
/// milliseconds, so anything above a minute is read as milliseconds.
pub fn retry_after_delay(body: &Value) -> Duration {
    let value = body
        .get("retry_after")
        .and_then(Value::as_f64)
        .filter(|value| value.is_finite() && *value >= 0.0)
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
    let secs = if value > 60.0 { value / 1000.0 } else { value };
    let cap = Duration::from_secs(MAX_RETRY_AFTER_SECS);
    Duration::try_from_secs_f64(secs).map_or(cap, |delay| delay.min(cap))
}

fn delay_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

fn parse_posted_message(body: &Value) -> Result<PostedMessage> {
    let field = |name: &str| -> Result<String> {
        match body.get(name) {
            Some(Value::String(value)) if !value.is_empty() => Ok(value.clone()),
            Some(Value::Number(value)) => Ok(value.to_string()),
            _ => bail!("webhook response is missing `{name}`"),
        }
    };
    Ok(PostedMessage {
        id: field("id")?,
        channel_id: field("channel_id")?,
    })
}

pub fn jump_url(server_id: &str, channel_id: &str, message_id: &str) -> String {
    format!("https://discord.com/channels/{server_id}/{channel_id}/{message_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLink {
    pub server_id: String,
    pub channel_id: String,
    pub message_id: String,
}

pub fn parse_message_link(link: &str) -> Result<MessageLink> {
    let url = Url::parse(link.trim()).with_context(|| format!("invalid message link: {link}"))?;
    let parts = url
        .path()
        .trim_matches('/')
        .split('/')
        .collect::<Vec<_>>();
    match parts.as_slice() {
        ["channels", server, channel, message]
            if !server.is_empty() && !channel.is_empty() && !message.is_empty() =>
        {
            Ok(MessageLink {
                server_id: (*server).to_string(),
                channel_id: (*channel).to_string(),
                message_id: (*message).to_string(),
            })
        }
        _ => bail!("message link path is not channels/<server>/<channel>/<message>: {link}"),
    }
}

/// Cut to at most `max_chars` characters, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(1);
    let mut truncated = text.chars().take(keep).collect::<String>();
    truncated.push('…');
    truncated
}

pub fn change_embed(
    diff: &DiffResult,
    population: &[WorldPopulationDelta],
    names: &WorldNames,
    timestamp: DateTime<Utc>,
) -> Embed {
    let report = render_full_report(diff, population, names);
    Embed {
        title: Some(CHANGE_EMBED_TITLE.to_string()),
        description: Some(truncate_chars(&report, MAX_EMBED_DESCRIPTION_CHARS)),
        timestamp: Some(timestamp),
        ..Embed::default()
    }
}

/// Posts change reports to a webhook.
pub struct WebhookNotifier<W> {
    api: W,
    names: WorldNames,
}

impl<W: WebhookApi> WebhookNotifier<W> {
    pub fn new(api: W, names: WorldNames) -> Self {
        Self { api, names }
    }

    pub fn into_inner(self) -> W {
        self.api
    }
}

impl<W: WebhookApi> Notifier for WebhookNotifier<W> {
    fn notify(&mut self, diff: &DiffResult, population: &[WorldPopulationDelta]) -> Result<()> {
        let embed = change_embed(diff, population, &self.names, Utc::now());
        let message = self
            .api
            .post_embeds(&[embed])
            .context("failed to post change report")?;
        debug!(message_id = %message.id, "change report delivered");
        Ok(())
    }
}
