use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{
    DEFAULT_ALLIANCES_FILE, DEFAULT_ROSTER_CACHE_TTL_SECS, DEFAULT_ROSTER_FETCH_RETRIES,
    DEFAULT_ROSTER_RETRY_DELAY_MS, DEFAULT_SOLO_GUILDS_FILE, WatchConfig,
};
use crate::http::build_client;
use crate::mapping::WorldAssignmentMap;
use crate::worlds::WorldNames;

pub const ALLIANCES_SHEET: &str = "Alliances";
pub const SOLO_GUILDS_SHEET: &str = "SoloGuilds";

const ALLIANCE_NAME_COLUMN: &str = "Alliance:";
const ALLIANCE_GUILDS_COLUMN: &str = "Guilds";
const ALLIANCE_ID_COLUMN: &str = "Alliance Guild IDs:";
const ALLIANCE_WORLD_COLUMN: &str = "World ID";
const SOLO_NAME_COLUMN: &str = "Solo Guilds";
const SOLO_ID_COLUMN: &str = "Guild API ID";
const SOLO_WORLD_COLUMN: &str = "World";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllianceRow {
    pub name: String,
    /// Member guild display names, one per sheet line.
    pub guilds: Vec<String>,
    pub guild_id: String,
    pub world: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoloGuildRow {
    pub name: String,
    pub guild_id: String,
    pub world: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    pub alliances: Vec<AllianceRow>,
    pub solo_guilds: Vec<SoloGuildRow>,
}

impl Roster {
    pub fn from_csv(alliances_csv: &str, solo_guilds_csv: &str) -> Result<Self> {
        let mut roster = Self {
            alliances: parse_alliances(alliances_csv)?,
            solo_guilds: parse_solo_guilds(solo_guilds_csv)?,
        };
        roster.sort();
        Ok(roster)
    }

    fn sort(&mut self) {
        self.alliances.sort_by(|left, right| {
            (left.world.as_str(), left.name.as_str()).cmp(&(right.world.as_str(), right.name.as_str()))
        });
        self.solo_guilds.sort_by(|left, right| {
            (left.world.as_str(), left.name.as_str()).cmp(&(right.world.as_str(), right.name.as_str()))
        });
    }

    /// Distinct alliance worlds in sorted order.
    pub fn worlds(&self) -> Vec<&str> {
        let mut worlds = self
            .alliances
            .iter()
            .map(|row| row.world.as_str())
            .collect::<Vec<_>>();
        worlds.sort_unstable();
        worlds.dedup();
        worlds
    }

    pub fn alliances_on(&self, world: &str) -> Vec<&AllianceRow> {
        self.alliances
            .iter()
            .filter(|row| row.world == world)
            .collect()
    }

    pub fn solo_guilds_on(&self, world: &str) -> Vec<&SoloGuildRow> {
        self.solo_guilds
            .iter()
            .filter(|row| row.world == world)
            .collect()
    }
}

pub fn parse_alliances(content: &str) -> Result<Vec<AllianceRow>> {
    let rows = parse_csv_rows(strip_bom(content), ',');
    let Some((header, body)) = rows.split_first() else {
        return Ok(Vec::new());
    };
    let columns = header_indices(
        ALLIANCES_SHEET,
        header,
        &[
            ALLIANCE_NAME_COLUMN,
            ALLIANCE_GUILDS_COLUMN,
            ALLIANCE_ID_COLUMN,
            ALLIANCE_WORLD_COLUMN,
        ],
    )?;

    let mut alliances = Vec::new();
    for row in body {
        let Some([name, guilds, guild_id, world]) = required_fields::<4>(row, &columns) else {
            continue;
        };
        let guilds = guilds
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        alliances.push(AllianceRow {
            name,
            guilds,
            guild_id,
            world,
        });
    }
    Ok(alliances)
}

pub fn parse_solo_guilds(content: &str) -> Result<Vec<SoloGuildRow>> {
    let rows = parse_csv_rows(strip_bom(content), ',');
    let Some((header, body)) = rows.split_first() else {
        return Ok(Vec::new());
    };
    let columns = header_indices(
        SOLO_GUILDS_SHEET,
        header,
        &[SOLO_NAME_COLUMN, SOLO_ID_COLUMN, SOLO_WORLD_COLUMN],
    )?;

    Ok(body
        .iter()
        .filter_map(|row| required_fields::<3>(row, &columns))
        .map(|[name, guild_id, world]| SoloGuildRow {
            name,
            guild_id,
            world,
        })
        .collect())
}

fn header_indices(sheet: &str, header: &[String], required: &[&str]) -> Result<Vec<usize>> {
    let mut indices = Vec::with_capacity(required.len());
    let mut missing = Vec::new();
    for column in required {
        match header.iter().position(|value| value.trim() == *column) {
            Some(index) => indices.push(index),
            None => missing.push(*column),
        }
    }
    if !missing.is_empty() {
        bail!(
            "{sheet} sheet is missing required columns: {}",
            missing.join(", ")
        );
    }
    Ok(indices)
}

/// Fields at `columns`, or `None` when any of them is blank.
fn required_fields<const N: usize>(row: &[String], columns: &[usize]) -> Option<[String; N]> {
    let mut values: [String; N] = std::array::from_fn(|_| String::new());
    for (slot, column) in values.iter_mut().zip(columns) {
        let value = row.get(*column)?.trim();
        if value.is_empty() {
            return None;
        }
        *slot = value.to_string();
    }
    Some(values)
}

fn parse_csv_rows(content: &str, delimiter: char) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                // quoted cells carry the multi-line guild lists
                field.push(ch);
            }
            continue;
        }

        match ch {
            '"' => in_quotes = true,
            '\n' | '\r' => {
                if ch == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ if ch == delimiter => row.push(std::mem::take(&mut field)),
            _ => field.push(ch),
        }
    }

    row.push(field);
    if row.len() > 1 || row.first().is_some_and(|value| !value.trim().is_empty()) {
        rows.push(row);
    }
    rows
}

fn strip_bom(content: &str) -> &str {
    content.strip_prefix('\u{feff}').unwrap_or(content)
}

#[derive(Debug, Error)]
pub enum SheetFetchError {
    #[error("sheet export returned HTTP {0}")]
    Status(u16),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Remote CSV export endpoint.
pub trait SheetSource {
    fn fetch_sheet(&mut self, url: &str) -> std::result::Result<String, SheetFetchError>;
}

pub struct HttpSheetSource {
    client: Client,
}

impl HttpSheetSource {
    pub fn new(user_agent: &str, timeout_ms: u64) -> Result<Self> {
        Ok(Self {
            client: build_client(user_agent, timeout_ms)?,
        })
    }
}

impl SheetSource for HttpSheetSource {
    fn fetch_sheet(&mut self, url: &str) -> std::result::Result<String, SheetFetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to fetch {url}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SheetFetchError::Status(status.as_u16()));
        }
        Ok(response
            .text()
            .with_context(|| format!("failed to read body of {url}"))?)
    }
}

#[derive(Debug, Clone)]
pub struct RemoteRosterOptions {
    pub alliances_url: String,
    pub solo_guilds_url: String,
    pub cache_dir: PathBuf,
    pub cache_ttl: Duration,
    pub retries: usize,
    pub retry_delay: Duration,
}

impl RemoteRosterOptions {
    pub fn from_config(config: &WatchConfig, cache_dir: &Path) -> Result<Self> {
        let roster = &config.roster;
        let Some(alliances_url) = roster.alliances_csv_url.clone() else {
            bail!("roster.alliances_csv_url is not configured");
        };
        let Some(solo_guilds_url) = roster.solo_guilds_csv_url.clone() else {
            bail!("roster.solo_guilds_csv_url is not configured");
        };
        Ok(Self {
            alliances_url,
            solo_guilds_url,
            cache_dir: cache_dir.to_path_buf(),
            cache_ttl: Duration::from_secs(
                roster.cache_ttl_secs.unwrap_or(DEFAULT_ROSTER_CACHE_TTL_SECS),
            ),
            retries: roster.fetch_retries.unwrap_or(DEFAULT_ROSTER_FETCH_RETRIES),
            retry_delay: Duration::from_millis(
                roster.retry_delay_ms.unwrap_or(DEFAULT_ROSTER_RETRY_DELAY_MS),
            ),
        })
    }

    pub fn cache_path(&self, sheet: &str) -> PathBuf {
        self.cache_dir.join(format!("{sheet}.csv"))
    }
}

/// Fetch both sheets, reusing cached exports younger than the TTL.
pub fn load_remote_roster<S: SheetSource + ?Sized>(
    source: &mut S,
    options: &RemoteRosterOptions,
) -> Result<Roster> {
    fs::create_dir_all(&options.cache_dir)
        .with_context(|| format!("failed to create {}", options.cache_dir.display()))?;
    let alliances = load_sheet(source, options, ALLIANCES_SHEET, &options.alliances_url)?;
    let solo_guilds = load_sheet(source, options, SOLO_GUILDS_SHEET, &options.solo_guilds_url)?;
    Roster::from_csv(&alliances, &solo_guilds)
}

fn load_sheet<S: SheetSource + ?Sized>(
    source: &mut S,
    options: &RemoteRosterOptions,
    sheet: &str,
    url: &str,
) -> Result<String> {
    let cache_path = options.cache_path(sheet);
    if cache_is_fresh(&cache_path, options.cache_ttl) {
        debug!(sheet, path = %cache_path.display(), "using cached sheet export");
        return fs::read_to_string(&cache_path)
            .with_context(|| format!("failed to read {}", cache_path.display()));
    }

    let attempts = options.retries.max(1);
    for attempt in 1..=attempts {
        match source.fetch_sheet(url) {
            Ok(content) => {
                fs::write(&cache_path, &content)
                    .with_context(|| format!("failed to write {}", cache_path.display()))?;
                info!(sheet, bytes = content.len(), "fetched sheet export");
                return Ok(content);
            }
            Err(SheetFetchError::Status(400)) if attempt < attempts => {
                let delay = options.retry_delay * u32::try_from(attempt).unwrap_or(u32::MAX);
                warn!(sheet, attempt, "sheet export returned HTTP 400, retrying");
                sleep(delay);
            }
            Err(error) => {
                return Err(anyhow::Error::new(error))
                    .with_context(|| format!("failed to fetch {sheet} sheet"));
            }
        }
    }
    bail!("failed to fetch {sheet} sheet after {attempts} attempts")
}

fn cache_is_fresh(path: &Path, ttl: Duration) -> bool {
    if ttl.is_zero() {
        return false;
    }
    let Ok(modified) = fs::metadata(path).and_then(|metadata| metadata.modified()) else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age < ttl)
        .unwrap_or(true)
}

pub fn local_roster_paths(project_root: &Path, config: &WatchConfig) -> (PathBuf, PathBuf) {
    let alliances = config
        .roster
        .alliances_file
        .clone()
        .unwrap_or_else(|| DEFAULT_ALLIANCES_FILE.to_string());
    let solo_guilds = config
        .roster
        .solo_guilds_file
        .clone()
        .unwrap_or_else(|| DEFAULT_SOLO_GUILDS_FILE.to_string());
    (project_root.join(alliances), project_root.join(solo_guilds))
}

pub fn load_local_roster(alliances_path: &Path, solo_guilds_path: &Path) -> Result<Roster> {
    let alliances = fs::read_to_string(alliances_path)
        .with_context(|| format!("failed to read {}", alliances_path.display()))?;
    let solo_guilds = fs::read_to_string(solo_guilds_path)
        .with_context(|| format!("failed to read {}", solo_guilds_path.display()))?;
    Roster::from_csv(&alliances, &solo_guilds)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentUpdate {
    pub roster: Roster,
    /// Keyed by alliance name or solo guild id.
    pub changed: BTreeMap<String, String>,
    pub unchanged: BTreeMap<String, String>,
}

/// Move roster entries to the worlds the live mapping reports for them.
pub fn apply_world_assignments(
    roster: &Roster,
    mapping: &WorldAssignmentMap,
    names: &WorldNames,
) -> AssignmentUpdate {
    let live_worlds = mapping
        .iter()
        .filter_map(|(guild_id, world)| {
            names
                .name(world)
                .map(|name| (guild_id.to_uppercase(), name))
        })
        .collect::<HashMap<_, _>>();

    let mut update = AssignmentUpdate {
        roster: roster.clone(),
        ..AssignmentUpdate::default()
    };

    for alliance in &mut update.roster.alliances {
        alliance.guild_id = alliance.guild_id.to_uppercase();
        let live = live_worlds.get(&alliance.guild_id).copied();
        record_assignment(
            &mut alliance.world,
            live,
            alliance.name.clone(),
            &mut update.changed,
            &mut update.unchanged,
        );
    }
    for guild in &mut update.roster.solo_guilds {
        guild.guild_id = guild.guild_id.to_uppercase();
        let live = live_worlds.get(&guild.guild_id).copied();
        record_assignment(
            &mut guild.world,
            live,
            guild.guild_id.clone(),
            &mut update.changed,
            &mut update.unchanged,
        );
    }

    update.roster.sort();
    info!(
        moved = update.changed.len(),
        remained = update.unchanged.len(),
        "applied live world assignments to roster"
    );
    update
}

fn record_assignment(
    world: &mut String,
    live: Option<&str>,
    key: String,
    changed: &mut BTreeMap<String, String>,
    unchanged: &mut BTreeMap<String, String>,
) {
    match live {
        Some(new_world) if new_world != world.as_str() => {
            changed.insert(key, format!("Moved from {world} to {new_world}"));
            *world = new_world.to_string();
        }
        _ => {
            unchanged.insert(key, format!("Remained on {world}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::fs;
    use std::time::Duration;

    use anyhow::anyhow;
    use tempfile::tempdir;

    use super::{
        ALLIANCES_SHEET, RemoteRosterOptions, Roster, SheetFetchError, SheetSource,
        apply_world_assignments, load_local_roster, load_remote_roster, parse_alliances,
        parse_csv_rows, parse_solo_guilds,
    };
    use crate::mapping::WorldAssignmentMap;
    use crate::worlds::WorldNames;

    const ALLIANCES: &str = "\u{feff}Alliance:,Notes,Guilds,Alliance Guild IDs:,World ID\n\
Zeta Pact,,\"Guild A\nGuild B\",aaaa-1111,Mosswood\n\
Alpha Host,x,\"Guild C\",bbbb-2222,Moogooloo\n\
Broken,,,cccc-3333,Moogooloo\n\
Beta Band,,\"Guild \"\"D\"\"\",dddd-4444,Moogooloo\n";

    const SOLO: &str = "Solo Guilds,Guild API ID,World\r\n\
Lone Wolves,eeee-5555,Mosswood\r\n\
Night Owls,ffff-6666,Moogooloo\r\n\
No World,gggg-7777,\r\n";

    struct ScriptedSheets {
        responses: VecDeque<std::result::Result<String, SheetFetchError>>,
        calls: usize,
    }

    impl SheetSource for ScriptedSheets {
        fn fetch_sheet(&mut self, _url: &str) -> std::result::Result<String, SheetFetchError> {
            self.calls += 1;
            self.responses
                .pop_front()
                .unwrap_or_else(|| Err(SheetFetchError::Transport(anyhow!("exhausted"))))
        }
    }

    fn remote_options(cache_dir: &std::path::Path) -> RemoteRosterOptions {
        RemoteRosterOptions {
            alliances_url: "https://sheets.example/alliances".to_string(),
            solo_guilds_url: "https://sheets.example/solo".to_string(),
            cache_dir: cache_dir.to_path_buf(),
            cache_ttl: Duration::from_secs(3_600),
            retries: 3,
            retry_delay: Duration::ZERO,
        }
    }

    #[test]
    fn csv_parser_handles_quotes_and_newlines() {
        let rows = parse_csv_rows("a,\"b,c\",\"d\ne\"\r\n1,2,3", ',');
        assert_eq!(
            rows,
            vec![
                vec!["a".to_string(), "b,c".to_string(), "d\ne".to_string()],
                vec!["1".to_string(), "2".to_string(), "3".to_string()],
            ]
        );
    }

    #[test]
    fn alliances_locate_columns_by_header_and_drop_blank_rows() {
        let alliances = parse_alliances(ALLIANCES).expect("parse");
        assert_eq!(alliances.len(), 3);
        assert_eq!(alliances[0].name, "Zeta Pact");
        assert_eq!(alliances[0].guilds, vec!["Guild A", "Guild B"]);
        assert_eq!(alliances[0].guild_id, "aaaa-1111");
        assert_eq!(alliances[2].guilds, vec!["Guild \"D\""]);
    }

    #[test]
    fn missing_headers_name_the_sheet() {
        let error = parse_solo_guilds("Solo Guilds,World\nA,B\n").expect_err("must fail");
        let message = error.to_string();
        assert!(message.contains("SoloGuilds"));
        assert!(message.contains("Guild API ID"));
    }

    #[test]
    fn roster_sorts_by_world_then_name() {
        let roster = Roster::from_csv(ALLIANCES, SOLO).expect("roster");
        let names = roster
            .alliances
            .iter()
            .map(|row| row.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Alpha Host", "Beta Band", "Zeta Pact"]);
        assert_eq!(roster.worlds(), vec!["Moogooloo", "Mosswood"]);
        assert_eq!(roster.solo_guilds.len(), 2);
        assert_eq!(roster.solo_guilds_on("Mosswood")[0].name, "Lone Wolves");
    }

    #[test]
    fn local_roster_reads_both_files() {
        let temp = tempdir().expect("tempdir");
        let alliances = temp.path().join("alliances.csv");
        let solo = temp.path().join("solo.csv");
        fs::write(&alliances, ALLIANCES).expect("write alliances");
        fs::write(&solo, SOLO).expect("write solo");

        let roster = load_local_roster(&alliances, &solo).expect("load");
        assert_eq!(roster.alliances.len(), 3);
        assert!(load_local_roster(&temp.path().join("missing.csv"), &solo).is_err());
    }

    #[test]
    fn remote_roster_retries_bad_request_and_caches() {
        let temp = tempdir().expect("tempdir");
        let options = remote_options(temp.path());
        let mut source = ScriptedSheets {
            responses: VecDeque::from(vec![
                Err(SheetFetchError::Status(400)),
                Ok(ALLIANCES.to_string()),
                Ok(SOLO.to_string()),
            ]),
            calls: 0,
        };

        let roster = load_remote_roster(&mut source, &options).expect("load");
        assert_eq!(roster.alliances.len(), 3);
        assert_eq!(source.calls, 3);
        assert!(options.cache_path(ALLIANCES_SHEET).exists());

        let cached = load_remote_roster(&mut source, &options).expect("cached load");
        assert_eq!(cached, roster);
        assert_eq!(source.calls, 3);
    }

    #[test]
    fn remote_roster_fails_fast_on_other_statuses() {
        let temp = tempdir().expect("tempdir");
        let options = remote_options(temp.path());
        let mut source = ScriptedSheets {
            responses: VecDeque::from(vec![Err(SheetFetchError::Status(404))]),
            calls: 0,
        };
        let error = load_remote_roster(&mut source, &options).expect_err("must fail");
        assert!(format!("{error:#}").contains("HTTP 404"));
        assert_eq!(source.calls, 1);
    }

    #[test]
    fn remote_roster_gives_up_after_retry_budget() {
        let temp = tempdir().expect("tempdir");
        let options = remote_options(temp.path());
        let mut source = ScriptedSheets {
            responses: VecDeque::from(vec![
                Err(SheetFetchError::Status(400)),
                Err(SheetFetchError::Status(400)),
                Err(SheetFetchError::Status(400)),
            ]),
            calls: 0,
        };
        assert!(load_remote_roster(&mut source, &options).is_err());
        assert_eq!(source.calls, 3);
    }

    #[test]
    fn expired_cache_is_refetched() {
        let temp = tempdir().expect("tempdir");
        let mut options = remote_options(temp.path());
        options.cache_ttl = Duration::ZERO;
        fs::write(options.cache_path(ALLIANCES_SHEET), "stale").expect("write cache");
        let mut source = ScriptedSheets {
            responses: VecDeque::from(vec![Ok(ALLIANCES.to_string()), Ok(SOLO.to_string())]),
            calls: 0,
        };
        load_remote_roster(&mut source, &options).expect("load");
        assert_eq!(source.calls, 2);
    }

    #[test]
    fn assignments_move_entries_with_known_world_names() {
        let roster = Roster::from_csv(ALLIANCES, SOLO).expect("roster");
        let mapping = WorldAssignmentMap::from_entries([
            ("AAAA-1111", 11001),
            ("BBBB-2222", 11001),
            ("eeee-5555", 99999),
            ("FFFF-6666", 11012),
        ]);

        let update = apply_world_assignments(&roster, &mapping, &WorldNames::with_defaults());

        assert_eq!(
            update.changed.get("Zeta Pact").map(String::as_str),
            Some("Moved from Mosswood to Moogooloo")
        );
        assert_eq!(
            update.changed.get("FFFF-6666").map(String::as_str),
            Some("Moved from Moogooloo to Mosswood")
        );
        assert_eq!(
            update.unchanged.get("Alpha Host").map(String::as_str),
            Some("Remained on Moogooloo")
        );
        assert_eq!(
            update.unchanged.get("EEEE-5555").map(String::as_str),
            Some("Remained on Mosswood")
        );
        assert_eq!(
            update.unchanged.get("Beta Band").map(String::as_str),
            Some("Remained on Moogooloo")
        );
        assert_eq!(update.roster.worlds(), vec!["Moogooloo"]);
        assert_eq!(update.roster.alliances[2].guild_id, "AAAA-1111");
    }
}
