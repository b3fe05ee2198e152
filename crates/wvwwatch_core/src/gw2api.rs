use anyhow::{Context, Result, bail};
use reqwest::Url;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::http::{build_client, is_retryable_error, is_retryable_status, wait_before_retry};
use crate::mapping::WorldAssignmentMap;
use crate::monitor::AssignmentSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Na,
    Eu,
}

impl Region {
    pub fn parse(value: &str) -> Result<Self> {
        if value.trim().eq_ignore_ascii_case("na") {
            return Ok(Self::Na);
        }
        if value.trim().eq_ignore_ascii_case("eu") {
            return Ok(Self::Eu);
        }
        bail!("unsupported region: {value} (expected na|eu)")
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Na => "na",
            Self::Eu => "eu",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Gw2ApiConfig {
    pub base_url: String,
    pub region: Region,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Gw2ApiConfig {
    pub fn from_config(config: &WatchConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.api_base_url(),
            region: config.region()?,
            user_agent: config.user_agent(),
            timeout_ms: config.timeout_ms(),
            max_retries: config.max_retries(),
            retry_delay_ms: config.retry_delay_ms(),
        })
    }

    pub fn guilds_url(&self) -> Result<Url> {
        let base = self.base_url.trim_end_matches('/');
        let raw = format!("{base}/v2/wvw/guilds/{}", self.region.as_str());
        Url::parse(&raw).with_context(|| format!("invalid GW2 API URL: {raw}"))
    }
}

/// Live guild -> world assignments from the official GW2 API.
pub struct Gw2ApiClient {
    client: Client,
    config: Gw2ApiConfig,
    request_count: usize,
}

impl Gw2ApiClient {
    pub fn new(config: Gw2ApiConfig) -> Result<Self> {
        let client = build_client(&config.user_agent, config.timeout_ms)?;
        Ok(Self {
            client,
            config,
            request_count: 0,
        })
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }

    fn request_json(&mut self, url: &Url) -> Result<Value> {
        for attempt in 0..=self.config.max_retries {
            self.request_count += 1;
            debug!(%url, attempt, "requesting GW2 API");
            match self.client.get(url.clone()).send() {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            warn!(%status, attempt, "GW2 API returned retryable status");
                            wait_before_retry(self.config.retry_delay_ms, attempt);
                            continue;
                        }
                        bail!("GW2 API request failed with HTTP {status}");
                    }
                    return response
                        .json()
                        .context("failed to decode GW2 API JSON response");
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        warn!(%error, attempt, "GW2 API request failed, retrying");
                        wait_before_retry(self.config.retry_delay_ms, attempt);
                        continue;
                    }
                    return Err(error).context("failed to call GW2 API");
                }
            }
        }

        bail!("GW2 API request exhausted retry budget")
    }
}

impl AssignmentSource for Gw2ApiClient {
    fn fetch_current_mapping(&mut self) -> Result<WorldAssignmentMap> {
        let url = self.config.guilds_url()?;
        let payload = self.request_json(&url)?;
        let mapping = WorldAssignmentMap::from_json_value(&payload)
            .context("GW2 API returned malformed guild assignments")?;
        info!(
            region = self.config.region.as_str(),
            guilds = mapping.len(),
            "fetched guild world assignments"
        );
        Ok(mapping)
    }
}
