use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fingerprint::{Fingerprint, fingerprint};
use crate::mapping::WorldAssignmentMap;

pub const STORE_FORMAT_VERSION: u32 = 1;
pub const GENERATIONS_FILENAME: &str = "generations.json";
pub const ARCHIVE_DIRNAME: &str = "archive";
const LOCK_FILENAME: &str = ".lock";
const ARCHIVE_PREFIX: &str = "snapshot_";
const ARCHIVE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const ARCHIVE_STAMP_LEN: usize = "YYYYmmdd_HHMMSS".len();
/// A lock older than this is assumed to belong to a crashed run.
const STALE_LOCK_AGE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub mapping: WorldAssignmentMap,
    pub timestamp: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    pub guild_count: usize,
    pub world_count: usize,
}

impl Snapshot {
    pub fn capture(mapping: WorldAssignmentMap, timestamp: DateTime<Utc>) -> Self {
        Self {
            fingerprint: fingerprint(&mapping),
            guild_count: mapping.len(),
            world_count: mapping.world_count(),
            mapping,
            timestamp,
        }
    }

    /// Reject a record whose derived fields disagree with its mapping.
    pub fn validate(&self) -> Result<()> {
        let expected = fingerprint(&self.mapping);
        if expected != self.fingerprint {
            bail!(
                "snapshot fingerprint mismatch: stored {} but mapping hashes to {}",
                self.fingerprint.short(),
                expected.short()
            );
        }
        if self.guild_count != self.mapping.len() {
            bail!(
                "snapshot guild_count {} does not match mapping size {}",
                self.guild_count,
                self.mapping.len()
            );
        }
        if self.world_count != self.mapping.world_count() {
            bail!(
                "snapshot world_count {} does not match mapping worlds {}",
                self.world_count,
                self.mapping.world_count()
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistedRecord {
    Snapshot(Snapshot),
    ArchivedSnapshot {
        archived_at: DateTime<Utc>,
        snapshot: Snapshot,
    },
}

impl PersistedRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot(_) => "snapshot",
            Self::ArchivedSnapshot { .. } => "archived_snapshot",
        }
    }

    fn into_live_snapshot(self, slot: &str) -> Result<Snapshot> {
        match self {
            Self::Snapshot(snapshot) => {
                snapshot
                    .validate()
                    .with_context(|| format!("invalid {slot} snapshot"))?;
                Ok(snapshot)
            }
            other => bail!(
                "{slot} slot holds a `{}` record, expected `snapshot`",
                other.kind()
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GenerationsFile {
    format_version: u32,
    current: PersistedRecord,
    #[serde(default)]
    previous: Option<PersistedRecord>,
    run_count: u64,
    last_run: DateTime<Utc>,
}

/// The two live generations plus run bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generations {
    pub current: Snapshot,
    pub previous: Option<Snapshot>,
    pub run_count: u64,
    pub last_run: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub file_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedSnapshot {
    pub archived_at: DateTime<Utc>,
    pub snapshot: Snapshot,
}

pub trait SnapshotStore {
    fn load_previous(&self) -> Result<Option<Snapshot>>;
    fn load_current(&self) -> Result<Option<Snapshot>>;
    /// Promote current to previous, archive the old previous and install
    /// `mapping` as current, all as one logical step.
    fn commit(&mut self, mapping: WorldAssignmentMap, timestamp: DateTime<Utc>)
    -> Result<Snapshot>;

    /// Drop all but the newest `keep` archived generations.
    fn prune_archives(&mut self, _keep: usize) -> Result<usize> {
        Ok(0)
    }
}

#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generations_path(&self) -> PathBuf {
        self.root.join(GENERATIONS_FILENAME)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE_DIRNAME)
    }

    pub fn load_generations(&self) -> Result<Option<Generations>> {
        let path = self.generations_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file: GenerationsFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        if file.format_version != STORE_FORMAT_VERSION {
            bail!(
                "unsupported snapshot store format_version {} in {} (expected {})",
                file.format_version,
                path.display(),
                STORE_FORMAT_VERSION
            );
        }

        let current = file.current.into_live_snapshot("current")?;
        let previous = file
            .previous
            .map(|record| record.into_live_snapshot("previous"))
            .transpose()?;
        Ok(Some(Generations {
            current,
            previous,
            run_count: file.run_count,
            last_run: file.last_run,
        }))
    }

    /// Archived generations, oldest first.
    pub fn list_archives(&self) -> Result<Vec<ArchiveEntry>> {
        let dir = self.archive_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in
            fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))?
        {
            let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with(ARCHIVE_PREFIX) && file_name.ends_with(".json") {
                entries.push(ArchiveEntry {
                    file_name,
                    path: entry.path(),
                });
            }
        }
        entries.sort_by(|left, right| {
            archive_order(&left.file_name).cmp(&archive_order(&right.file_name))
        });
        Ok(entries)
    }

    pub fn load_archive(&self, path: &Path) -> Result<ArchivedSnapshot> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let record: PersistedRecord = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        match record {
            PersistedRecord::ArchivedSnapshot {
                archived_at,
                snapshot,
            } => {
                snapshot
                    .validate()
                    .with_context(|| format!("invalid archive {}", path.display()))?;
                Ok(ArchivedSnapshot {
                    archived_at,
                    snapshot,
                })
            }
            other => bail!(
                "{} holds a `{}` record, expected `archived_snapshot`",
                path.display(),
                other.kind()
            ),
        }
    }

    fn write_archive(&self, snapshot: &Snapshot, archived_at: DateTime<Utc>) -> Result<PathBuf> {
        let dir = self.archive_dir();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let stem = format!(
            "{ARCHIVE_PREFIX}{}",
            archived_at.format(ARCHIVE_STAMP_FORMAT)
        );
        let mut path = dir.join(format!("{stem}.json"));
        let mut suffix = 1usize;
        while path.exists() {
            path = dir.join(format!("{stem}_{suffix}.json"));
            suffix += 1;
        }

        let record = PersistedRecord::ArchivedSnapshot {
            archived_at,
            snapshot: snapshot.clone(),
        };
        write_json_atomically(&path, &record)?;
        Ok(path)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load_previous(&self) -> Result<Option<Snapshot>> {
        Ok(self
            .load_generations()?
            .and_then(|generations| generations.previous))
    }

    fn load_current(&self) -> Result<Option<Snapshot>> {
        Ok(self
            .load_generations()?
            .map(|generations| generations.current))
    }

    fn commit(
        &mut self,
        mapping: WorldAssignmentMap,
        timestamp: DateTime<Utc>,
    ) -> Result<Snapshot> {
        if mapping.is_empty() {
            bail!("refusing to commit an empty assignment mapping");
        }
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let _lock = StoreLock::acquire(&self.root)?;

        let existing = self
            .load_generations()
            .context("existing snapshot generations are unreadable")?;
        let snapshot = Snapshot::capture(mapping, timestamp);

        let mut archived = None;
        let (previous, run_count) = match existing {
            Some(generations) => {
                if let Some(stale) = &generations.previous {
                    let path = self.write_archive(stale, timestamp)?;
                    debug!(path = %path.display(), "archived previous generation");
                    archived = Some(path);
                }
                (Some(generations.current), generations.run_count + 1)
            }
            None => (None, 1),
        };

        let file = GenerationsFile {
            format_version: STORE_FORMAT_VERSION,
            current: PersistedRecord::Snapshot(snapshot.clone()),
            previous: previous.map(PersistedRecord::Snapshot),
            run_count,
            last_run: timestamp,
        };
        if let Err(error) = write_json_atomically(&self.generations_path(), &file) {
            // The old previous is still live, so its archive copy must not survive.
            if let Some(path) = &archived
                && let Err(cleanup) = fs::remove_file(path)
            {
                warn!(path = %path.display(), error = %cleanup, "failed to remove orphaned archive");
            }
            return Err(error);
        }
        info!(
            guilds = snapshot.guild_count,
            worlds = snapshot.world_count,
            fingerprint = snapshot.fingerprint.short(),
            run_count,
            "committed snapshot generation"
        );
        Ok(snapshot)
    }

    fn prune_archives(&mut self, keep: usize) -> Result<usize> {
        let archives = self.list_archives()?;
        if archives.len() <= keep {
            return Ok(0);
        }
        let excess = archives.len() - keep;
        for entry in archives.iter().take(excess) {
            fs::remove_file(&entry.path)
                .with_context(|| format!("failed to remove {}", entry.path.display()))?;
        }
        Ok(excess)
    }
}

/// Ordering key for archive names: timestamp stem, then numeric collision suffix.
fn archive_order(file_name: &str) -> (&str, usize) {
    let base = file_name.strip_suffix(".json").unwrap_or(file_name);
    let stamp_end = ARCHIVE_PREFIX.len() + ARCHIVE_STAMP_LEN;
    let (Some(stem), Some(rest)) = (base.get(..stamp_end), base.get(stamp_end..)) else {
        return (base, 0);
    };
    if rest.is_empty() {
        return (stem, 0);
    }
    match rest.strip_prefix('_').and_then(|suffix| suffix.parse().ok()) {
        Some(suffix) => (stem, suffix),
        None => (base, 0),
    }
}

/// Exclusive lock file guarding the promote-and-archive step. Holds the
/// owner's PID so a lock left behind by a killed run can be taken over.
struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    fn acquire(root: &Path) -> Result<Self> {
        let path = root.join(LOCK_FILENAME);
        let mut file = match create_lock_file(&path) {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                let Some(reason) = stale_lock_reason(&path) else {
                    bail!(
                        "snapshot store is locked by another run ({}); remove the file if no run is active",
                        path.display()
                    );
                };
                warn!(path = %path.display(), reason, "taking over stale snapshot store lock");
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove stale lock {}", path.display()))?;
                create_lock_file(&path)
                    .with_context(|| format!("failed to create lock {}", path.display()))?
            }
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to create lock {}", path.display()));
            }
        };
        let lock = Self { path };
        writeln!(file, "{}", std::process::id())
            .with_context(|| format!("failed to write lock {}", lock.path.display()))?;
        Ok(lock)
    }
}

fn create_lock_file(path: &Path) -> std::io::Result<fs::File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

fn stale_lock_reason(path: &Path) -> Option<&'static str> {
    let age = fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok());
    if age.is_some_and(|age| age >= STALE_LOCK_AGE) {
        return Some("lock file is older than the stale lock age");
    }
    let holder: u32 = fs::read_to_string(path).ok()?.trim().parse().ok()?;
    if holder != std::process::id() && !process_is_alive(holder) {
        return Some("lock holder process has exited");
    }
    None
}

/// Without procfs there is no portable answer, so the holder counts as alive.
fn process_is_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if !proc_root.join("self").exists() {
        return true;
    }
    proc_root.join(pid.to_string()).exists()
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Write to a sibling temp file, flush it, then rename over the target.
pub(crate) fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;

    let rendered = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    let temp_path = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("failed to create {}", temp_path.display()))?;
        file.write_all(rendered.as_bytes())
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to flush {}", temp_path.display()))?;
    }
    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            temp_path.display(),
            path.display()
        )
    })
}
