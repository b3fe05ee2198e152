use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::gw2api::Region;
use crate::mapping::WorldId;
use crate::policy::DEFAULT_REASSIGN_THRESHOLD;
use crate::worlds::WorldNames;

pub const DEFAULT_USER_AGENT: &str = "wvwwatch/0.1";
pub const DEFAULT_API_BASE_URL: &str = "https://api.guildwars2.com";
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HTTP_RETRIES: usize = 2;
pub const DEFAULT_HTTP_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_ROSTER_CACHE_TTL_SECS: u64 = 3_600;
pub const DEFAULT_ROSTER_FETCH_RETRIES: usize = 3;
pub const DEFAULT_ROSTER_RETRY_DELAY_MS: u64 = 2_000;
pub const DEFAULT_POST_DELAY_MS: u64 = 500;
pub const DEFAULT_ALLIANCES_FILE: &str = "WvW Guilds - Alliances.csv";
pub const DEFAULT_SOLO_GUILDS_FILE: &str = "WvW Guilds - SoloGuilds.csv";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WatchConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub webhook: WebhookSection,
    #[serde(default)]
    pub roster: RosterSection,
    /// Extra or overriding world names, keyed by world id.
    #[serde(default)]
    pub worlds: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ApiSection {
    pub base_url: Option<String>,
    pub region: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MonitorSection {
    pub reassign_threshold: Option<usize>,
    pub trigger_downstream: Option<bool>,
    pub archive_keep: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WebhookSection {
    pub url: Option<String>,
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RosterSection {
    pub alliances_csv_url: Option<String>,
    pub solo_guilds_csv_url: Option<String>,
    pub alliances_file: Option<String>,
    pub solo_guilds_file: Option<String>,
    pub cache_ttl_secs: Option<u64>,
    pub fetch_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub post_delay_ms: Option<u64>,
    pub author_name: Option<String>,
    pub author_url: Option<String>,
    pub author_icon_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl WatchConfig {
    /// Resolve the API base URL: env WVWWATCH_API_URL > config > default.
    pub fn api_base_url(&self) -> String {
        env_override("WVWWATCH_API_URL")
            .or_else(|| self.api.base_url.clone())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
    }

    pub fn region(&self) -> Result<Region> {
        match env_override("WVWWATCH_REGION").or_else(|| self.api.region.clone()) {
            Some(value) => Region::parse(&value),
            None => Ok(Region::Na),
        }
    }

    /// Resolve user agent: env WVWWATCH_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("WVWWATCH_USER_AGENT")
            .or_else(|| self.api.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout_ms(&self) -> u64 {
        env_parsed("WVWWATCH_HTTP_TIMEOUT_MS")
            .or(self.api.timeout_ms)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_MS)
    }

    pub fn max_retries(&self) -> usize {
        env_parsed("WVWWATCH_HTTP_RETRIES")
            .or(self.api.max_retries)
            .unwrap_or(DEFAULT_HTTP_RETRIES)
    }

    pub fn retry_delay_ms(&self) -> u64 {
        env_parsed("WVWWATCH_HTTP_RETRY_DELAY_MS")
            .or(self.api.retry_delay_ms)
            .unwrap_or(DEFAULT_HTTP_RETRY_DELAY_MS)
    }

    pub fn reassign_threshold(&self) -> usize {
        self.monitor
            .reassign_threshold
            .unwrap_or(DEFAULT_REASSIGN_THRESHOLD)
    }

    pub fn trigger_downstream(&self) -> bool {
        self.monitor.trigger_downstream.unwrap_or(true)
    }

    pub fn webhook_url(&self) -> Option<String> {
        env_override("WVWWATCH_WEBHOOK_URL").or_else(|| {
            self.webhook
                .url
                .clone()
                .filter(|value| !value.trim().is_empty())
        })
    }

    pub fn server_id(&self) -> Option<String> {
        env_override("WVWWATCH_SERVER_ID").or_else(|| {
            self.webhook
                .server_id
                .clone()
                .filter(|value| !value.trim().is_empty())
        })
    }

    /// Built-in NA names with `[worlds]` entries layered on top.
    pub fn world_names(&self) -> WorldNames {
        let mut names = WorldNames::with_defaults();
        for (id, name) in &self.worlds {
            names.insert(WorldId::parse(id), name.clone());
        }
        names
    }
}

/// Load and parse a WatchConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<WatchConfig> {
    if !config_path.exists() {
        return Ok(WatchConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: WatchConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_override(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_override(key).and_then(|value| value.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{WatchConfig, load_config};
    use crate::mapping::WorldId;

    #[test]
    fn default_config_has_no_webhook() {
        let config = WatchConfig::default();
        assert!(config.webhook.url.is_none());
        assert!(config.api.base_url.is_none());
        assert!(config.worlds.is_empty());
        assert_eq!(config.reassign_threshold(), 1);
        assert!(config.trigger_downstream());
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, WatchConfig::default());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[api]
base_url = "https://api.example.org"
region = "eu"
timeout_ms = 2500

[monitor]
reassign_threshold = 4
trigger_downstream = false
archive_keep = 10

[webhook]
url = "https://discord.com/api/webhooks/1/abc"
server_id = "42"

[roster]
alliances_file = "alliances.csv"
cache_ttl_secs = 60

[worlds]
12001 = "Skrittsburgh"
11001 = "Renamed"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.api.base_url.as_deref(),
            Some("https://api.example.org")
        );
        assert_eq!(config.api.region.as_deref(), Some("eu"));
        assert_eq!(config.api.timeout_ms, Some(2500));
        assert_eq!(config.reassign_threshold(), 4);
        assert!(!config.trigger_downstream());
        assert_eq!(config.monitor.archive_keep, Some(10));
        assert_eq!(config.webhook.server_id.as_deref(), Some("42"));
        assert_eq!(config.roster.alliances_file.as_deref(), Some("alliances.csv"));
        assert_eq!(config.roster.cache_ttl_secs, Some(60));

        let names = config.world_names();
        assert_eq!(names.name(&WorldId::Number(12001)), Some("Skrittsburgh"));
        assert_eq!(names.name(&WorldId::Number(11001)), Some("Renamed"));
        assert_eq!(names.name(&WorldId::Number(11002)), Some("Rall's Rest"));
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[paths]\nproject_root = \"/foo\"\n").expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert!(config.webhook.url.is_none());
        assert!(config.worlds.is_empty());
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[api\nbase_url = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn blank_webhook_url_counts_as_unset() {
        let mut config = WatchConfig::default();
        config.webhook.url = Some("   ".to_string());
        if std::env::var("WVWWATCH_WEBHOOK_URL").is_err() {
            assert!(config.webhook_url().is_none());
        }
    }
}
