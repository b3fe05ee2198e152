use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{DEFAULT_POST_DELAY_MS, WatchConfig};
use crate::roster::{AllianceRow, Roster, SoloGuildRow};
use crate::store::write_json_atomically;
use crate::webhook::{
    Embed, EmbedAuthor, EmbedField, EmbedFooter, EmbedImage, MAX_FIELD_CHARS, WebhookApi,
    jump_url, parse_message_link, truncate_chars,
};

pub const SUMMARY_KEY: &str = "Summary";
pub const SUMMARY_TITLE: &str = "WvW Guild Lists Summary";
const ALLIANCES_FIELD: &str = "__**Alliances**__";
const SOLO_GUILDS_FIELD: &str = "__Solo Guilds__";
const FOOTER_TEXT: &str = "Last Updated:";
const DEFAULT_AUTHOR_NAME: &str = "WvW Teams";

/// Branding shared by every roster embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedStyle {
    pub author_name: String,
    pub author_url: Option<String>,
    pub author_icon_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl Default for EmbedStyle {
    fn default() -> Self {
        Self {
            author_name: DEFAULT_AUTHOR_NAME.to_string(),
            author_url: None,
            author_icon_url: None,
            thumbnail_url: None,
        }
    }
}

impl EmbedStyle {
    pub fn from_config(config: &WatchConfig) -> Self {
        let roster = &config.roster;
        Self {
            author_name: roster
                .author_name
                .clone()
                .unwrap_or_else(|| DEFAULT_AUTHOR_NAME.to_string()),
            author_url: roster.author_url.clone(),
            author_icon_url: roster.author_icon_url.clone(),
            thumbnail_url: roster.thumbnail_url.clone(),
        }
    }

    fn base_embed(&self, title: String, timestamp: DateTime<Utc>) -> Embed {
        Embed {
            author: Some(EmbedAuthor {
                name: self.author_name.clone(),
                url: self.author_url.clone(),
                icon_url: self.author_icon_url.clone(),
            }),
            title: Some(title),
            thumbnail: self
                .thumbnail_url
                .clone()
                .map(|url| EmbedImage { url }),
            footer: Some(EmbedFooter {
                text: FOOTER_TEXT.to_string(),
            }),
            timestamp: Some(timestamp),
            ..Embed::default()
        }
    }
}

fn alliance_block(alliance: &AllianceRow) -> String {
    let mut lines = vec![format!("**{}**", alliance.name)];
    lines.extend(alliance.guilds.iter().map(|guild| format!("-  {guild}")));
    lines.join("\n")
}

/// One or more embeds for a world, splitting alliance blocks across
/// `World (part-N)` embeds so no field exceeds the Discord field limit.
pub fn build_world_embeds(
    world: &str,
    alliances: &[&AllianceRow],
    solo_guilds: &[&SoloGuildRow],
    style: &EmbedStyle,
    timestamp: DateTime<Utc>,
) -> Vec<Embed> {
    let mut chunks: Vec<Vec<String>> = Vec::new();
    let mut current = Vec::new();
    let mut current_len = 0usize;
    for block in alliances.iter().map(|alliance| alliance_block(alliance)) {
        let block_len = block.chars().count() + 2;
        if current_len + block_len > MAX_FIELD_CHARS && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += block_len;
        current.push(block);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    let mut embeds = chunks
        .into_iter()
        .enumerate()
        .map(|(index, blocks)| {
            let title = if index == 0 {
                format!("{world} Guild List")
            } else {
                format!("{world} (part-{}) Guild List", index + 1)
            };
            let mut embed = style.base_embed(title, timestamp);
            embed.fields.push(EmbedField {
                name: ALLIANCES_FIELD.to_string(),
                value: truncate_chars(&blocks.join("\n\n"), MAX_FIELD_CHARS),
            });
            embed
        })
        .collect::<Vec<_>>();

    if let Some(last) = embeds.last_mut() {
        let solo = solo_guilds
            .iter()
            .filter(|guild| guild.world == world)
            .map(|guild| guild.name.as_str())
            .collect::<Vec<_>>();
        let value = if solo.is_empty() {
            "None".to_string()
        } else {
            truncate_chars(&solo.join("\n"), MAX_FIELD_CHARS)
        };
        last.fields.push(EmbedField {
            name: SOLO_GUILDS_FIELD.to_string(),
            value,
        });
    }
    embeds
}

/// Embeds for every roster world, in world order.
pub fn build_roster_embeds(
    roster: &Roster,
    style: &EmbedStyle,
    timestamp: DateTime<Utc>,
) -> Vec<(String, Vec<Embed>)> {
    roster
        .worlds()
        .into_iter()
        .map(|world| {
            let embeds = build_world_embeds(
                world,
                &roster.alliances_on(world),
                &roster.solo_guilds_on(world),
                style,
                timestamp,
            );
            (world.to_string(), embeds)
        })
        .collect()
}

pub fn build_summary_embed(
    world_links: &BTreeMap<String, Vec<String>>,
    timestamp: DateTime<Utc>,
) -> Embed {
    let lines = world_links
        .iter()
        .filter_map(|(world, links)| {
            links
                .first()
                .map(|first| format!("[{world}]({first})"))
        })
        .collect::<Vec<_>>();
    Embed {
        title: Some(SUMMARY_TITLE.to_string()),
        description: Some(lines.join("\n")),
        timestamp: Some(timestamp),
        ..Embed::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum LinkEntry {
    Many(Vec<String>),
    One(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinksRecord {
    #[serde(rename = "_type")]
    kind: String,
    data: BTreeMap<String, LinkEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredLinks {
    Record(LinksRecord),
    Bare(BTreeMap<String, LinkEntry>),
}

/// Jump links of the messages posted by the last publish, keyed by world.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageLinks {
    pub entries: BTreeMap<String, Vec<String>>,
}

impl MessageLinks {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let stored: StoredLinks = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let data = match stored {
            StoredLinks::Record(record) => record.data,
            StoredLinks::Bare(data) => data,
        };
        let entries = data
            .into_iter()
            .map(|(world, entry)| {
                let links = match entry {
                    LinkEntry::Many(links) => links,
                    LinkEntry::One(link) => vec![link],
                };
                (world, links)
            })
            .collect();
        Ok(Some(Self { entries }))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let record = LinksRecord {
            kind: "dict".to_string(),
            data: self
                .entries
                .iter()
                .map(|(world, links)| (world.clone(), LinkEntry::Many(links.clone())))
                .collect(),
        };
        write_json_atomically(path, &record)
    }

    pub fn link_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub server_id: String,
    pub links_path: PathBuf,
    pub post_delay: Duration,
    pub style: EmbedStyle,
    pub timestamp: DateTime<Utc>,
}

impl PublishOptions {
    pub fn from_config(config: &WatchConfig, links_path: &Path) -> Result<Self> {
        let Some(server_id) = config.server_id() else {
            bail!("webhook.server_id (or WVWWATCH_SERVER_ID) is required to build message links");
        };
        Ok(Self {
            server_id,
            links_path: links_path.to_path_buf(),
            post_delay: Duration::from_millis(
                config.roster.post_delay_ms.unwrap_or(DEFAULT_POST_DELAY_MS),
            ),
            style: EmbedStyle::from_config(config),
            timestamp: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub deleted: usize,
    pub delete_failures: usize,
    pub invalid_links: usize,
    pub worlds: Vec<String>,
    pub messages_posted: usize,
    pub summary_link: Option<String>,
}

/// Replace the previously published roster messages with fresh ones.
pub fn publish_roster<W: WebhookApi + ?Sized>(
    api: &mut W,
    roster: &Roster,
    options: &PublishOptions,
) -> Result<PublishReport> {
    let mut report = PublishReport::default();
    delete_previous_messages(api, options, &mut report)?;

    let mut links = MessageLinks::default();
    for (world, embeds) in build_roster_embeds(roster, &options.style, options.timestamp) {
        let mut world_links = Vec::with_capacity(embeds.len());
        for embed in embeds {
            let message = match api.post_embeds(&[embed]) {
                Ok(message) => message,
                Err(error) => {
                    // keep what was posted so the next run can clean it up
                    if !world_links.is_empty() {
                        links.entries.insert(world.clone(), world_links);
                    }
                    links.save(&options.links_path)?;
                    return Err(error).with_context(|| format!("failed to post {world} roster"));
                }
            };
            world_links.push(jump_url(&options.server_id, &message.channel_id, &message.id));
            report.messages_posted += 1;
        }
        info!(world = %world, messages = world_links.len(), "posted world roster");
        links.entries.insert(world.clone(), world_links);
        report.worlds.push(world);
        pause(options.post_delay);
    }

    let summary = build_summary_embed(&links.entries, options.timestamp);
    let posted = api.post_embeds(&[summary]);
    let message = match posted {
        Ok(message) => message,
        Err(error) => {
            links.save(&options.links_path)?;
            return Err(error).context("failed to post roster summary");
        }
    };
    let summary_link = jump_url(&options.server_id, &message.channel_id, &message.id);
    report.messages_posted += 1;
    links
        .entries
        .insert(SUMMARY_KEY.to_string(), vec![summary_link.clone()]);
    report.summary_link = Some(summary_link);

    links.save(&options.links_path)?;
    Ok(report)
}

fn delete_previous_messages<W: WebhookApi + ?Sized>(
    api: &mut W,
    options: &PublishOptions,
    report: &mut PublishReport,
) -> Result<()> {
    let Some(previous) = MessageLinks::load(&options.links_path)? else {
        info!(
            path = %options.links_path.display(),
            "no previous message links; nothing to delete"
        );
        return Ok(());
    };

    for (world, links) in &previous.entries {
        for link in links {
            let parsed = match parse_message_link(link) {
                Ok(parsed) => parsed,
                Err(error) => {
                    warn!(world = %world, link = %link, %error, "skipping invalid message link");
                    report.invalid_links += 1;
                    continue;
                }
            };
            match api.delete_message(&parsed.message_id) {
                Ok(()) => report.deleted += 1,
                Err(error) => {
                    warn!(world = %world, error = %format!("{error:#}"), "failed to delete message");
                    report.delete_failures += 1;
                }
            }
            pause(options.post_delay);
        }
    }
    Ok(())
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::tempdir;

    use super::{
        EmbedStyle, MessageLinks, PublishOptions, SUMMARY_KEY, SUMMARY_TITLE,
        build_summary_embed, build_world_embeds, publish_roster,
    };
    use crate::roster::{AllianceRow, Roster, SoloGuildRow};
    use crate::webhook::tests::MockWebhook;

    fn timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0)
            .single()
            .expect("timestamp")
    }

    fn alliance(name: &str, world: &str, guilds: usize, width: usize) -> AllianceRow {
        AllianceRow {
            name: name.to_string(),
            guilds: (0..guilds)
                .map(|index| format!("{index:0>width$}"))
                .collect(),
            guild_id: format!("{name}-id"),
            world: world.to_string(),
        }
    }

    fn solo(name: &str, world: &str) -> SoloGuildRow {
        SoloGuildRow {
            name: name.to_string(),
            guild_id: format!("{name}-id"),
            world: world.to_string(),
        }
    }

    fn options(links_path: &Path) -> PublishOptions {
        PublishOptions {
            server_id: "900".to_string(),
            links_path: links_path.to_path_buf(),
            post_delay: Duration::ZERO,
            style: EmbedStyle::default(),
            timestamp: timestamp(),
        }
    }

    #[test]
    fn small_world_fits_in_one_embed_with_solo_guilds() {
        let first = alliance("Alpha", "Mosswood", 2, 4);
        let loner = solo("Lone", "Mosswood");
        let elsewhere = solo("Other", "Moogooloo");
        let embeds = build_world_embeds(
            "Mosswood",
            &[&first],
            &[&loner, &elsewhere],
            &EmbedStyle::default(),
            timestamp(),
        );

        assert_eq!(embeds.len(), 1);
        let embed = &embeds[0];
        assert_eq!(embed.title.as_deref(), Some("Mosswood Guild List"));
        assert_eq!(embed.fields[0].value, "**Alpha**\n-  0000\n-  0001");
        assert_eq!(embed.fields[1].name, "__Solo Guilds__");
        assert_eq!(embed.fields[1].value, "Lone");
    }

    #[test]
    fn long_worlds_split_into_parts() {
        // each block is ~300 chars, so three fit per 1024-char field
        let rows = (0..7)
            .map(|index| alliance(&format!("A{index}"), "Mosswood", 10, 25))
            .collect::<Vec<_>>();
        let refs = rows.iter().collect::<Vec<_>>();
        let embeds =
            build_world_embeds("Mosswood", &refs, &[], &EmbedStyle::default(), timestamp());

        assert_eq!(embeds.len(), 3);
        assert_eq!(
            embeds[1].title.as_deref(),
            Some("Mosswood (part-2) Guild List")
        );
        for embed in &embeds {
            assert!(embed.fields[0].value.chars().count() <= 1024);
        }
        assert_eq!(embeds[0].fields.len(), 1);
        assert_eq!(embeds[2].fields[1].value, "None");
    }

    #[test]
    fn summary_links_first_message_per_world() {
        let mut links = BTreeMap::new();
        links.insert(
            "Mosswood".to_string(),
            vec!["https://discord.com/channels/1/2/3".to_string(), "x".to_string()],
        );
        links.insert("Empty".to_string(), Vec::new());
        let embed = build_summary_embed(&links, timestamp());
        assert_eq!(embed.title.as_deref(), Some(SUMMARY_TITLE));
        assert_eq!(
            embed.description.as_deref(),
            Some("[Mosswood](https://discord.com/channels/1/2/3)")
        );
    }

    #[test]
    fn message_links_accept_legacy_single_strings() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("links.json");
        fs::write(
            &path,
            r#"{"_type":"dict","data":{"Mosswood":["https://discord.com/channels/1/2/3"],"Summary":"https://discord.com/channels/1/2/4"}}"#,
        )
        .expect("write links");

        let links = MessageLinks::load(&path).expect("load").expect("links");
        assert_eq!(links.link_count(), 2);
        assert_eq!(
            links.entries.get(SUMMARY_KEY),
            Some(&vec!["https://discord.com/channels/1/2/4".to_string()])
        );

        fs::write(&path, r#"{"Mosswood":"https://discord.com/channels/1/2/9"}"#)
            .expect("write bare links");
        let bare = MessageLinks::load(&path).expect("load").expect("links");
        assert_eq!(bare.link_count(), 1);
        assert!(
            MessageLinks::load(&temp.path().join("missing.json"))
                .expect("load")
                .is_none()
        );
    }

    #[test]
    fn publish_replaces_previous_messages_and_records_links() {
        let temp = tempdir().expect("tempdir");
        let links_path = temp.path().join("links.json");
        fs::write(
            &links_path,
            r#"{"_type":"dict","data":{"Mosswood":["https://discord.com/channels/900/c1/old1","not-a-link"],"Summary":"https://discord.com/channels/900/c1/old2"}}"#,
        )
        .expect("write links");

        let roster = Roster {
            alliances: vec![
                alliance("Alpha", "Moogooloo", 2, 4),
                alliance("Beta", "Mosswood", 2, 4),
            ],
            solo_guilds: vec![solo("Lone", "Mosswood")],
        };
        let mut webhook = MockWebhook::default();

        let report = publish_roster(&mut webhook, &roster, &options(&links_path)).expect("publish");

        assert_eq!(webhook.deleted, vec!["old1".to_string(), "old2".to_string()]);
        assert_eq!(report.deleted, 2);
        assert_eq!(report.invalid_links, 1);
        assert_eq!(report.worlds, vec!["Moogooloo", "Mosswood"]);
        assert_eq!(report.messages_posted, 3);
        assert_eq!(
            report.summary_link.as_deref(),
            Some("https://discord.com/channels/900/c1/m3")
        );
        assert_eq!(
            webhook.posted[2][0].title.as_deref(),
            Some(SUMMARY_TITLE)
        );

        let saved = MessageLinks::load(&links_path).expect("load").expect("links");
        assert_eq!(
            saved.entries.get("Moogooloo"),
            Some(&vec!["https://discord.com/channels/900/c1/m1".to_string()])
        );
        assert_eq!(saved.link_count(), 3);
    }

    #[test]
    fn delete_failures_do_not_stop_publishing() {
        let temp = tempdir().expect("tempdir");
        let links_path = temp.path().join("links.json");
        fs::write(
            &links_path,
            r#"{"Moogooloo":["https://discord.com/channels/900/c1/old1"]}"#,
        )
        .expect("write links");
        let roster = Roster {
            alliances: vec![alliance("Alpha", "Moogooloo", 1, 4)],
            solo_guilds: Vec::new(),
        };
        let mut webhook = MockWebhook {
            fail_deletes: true,
            ..MockWebhook::default()
        };

        let report = publish_roster(&mut webhook, &roster, &options(&links_path)).expect("publish");
        assert_eq!(report.delete_failures, 1);
        assert_eq!(report.messages_posted, 2);
    }

    #[test]
    fn post_failure_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let links_path = temp.path().join("links.json");
        let roster = Roster {
            alliances: vec![alliance("Alpha", "Moogooloo", 1, 4)],
            solo_guilds: Vec::new(),
        };
        let mut webhook = MockWebhook {
            fail_posts: true,
            ..MockWebhook::default()
        };
        let error = publish_roster(&mut webhook, &roster, &options(&links_path))
            .expect_err("must fail");
        assert!(format!("{error:#}").contains("Moogooloo"));
        let saved = MessageLinks::load(&links_path).expect("load").expect("links");
        assert_eq!(saved.link_count(), 0);
    }
}
