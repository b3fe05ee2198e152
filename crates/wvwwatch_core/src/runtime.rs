use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::store::{ARCHIVE_DIRNAME, GENERATIONS_FILENAME};

pub const STATE_DIRNAME: &str = ".wvwwatch";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const MESSAGE_LINKS_FILENAME: &str = "message_links.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub message_links_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ndata_dir={} ({})\nsnapshot_dir={}\ncache_dir={}\nmessage_links_path={}\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.snapshot_dir),
            normalize_for_display(&self.cache_dir),
            normalize_for_display(&self.message_links_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub state_dir_exists: bool,
    pub snapshot_dir_exists: bool,
    pub generations_exists: bool,
    pub generations_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let state_dir_exists = paths.state_dir.exists();
    let snapshot_dir_exists = paths.snapshot_dir.exists();
    let config_exists = paths.config_path.exists();
    let generations_path = paths.snapshot_dir.join(GENERATIONS_FILENAME);
    let generations_exists = generations_path.exists();
    let generations_size_bytes = if generations_exists {
        let metadata = fs::metadata(&generations_path)
            .with_context(|| format!("failed to inspect {}", generations_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };

    let mut warnings = Vec::new();
    if !state_dir_exists {
        warnings.push(format!(
            "{STATE_DIRNAME}/ is missing; run `wvwwatch init` to create the layout"
        ));
    }
    if !generations_exists {
        warnings.push(
            "no snapshots recorded yet; the next `wvwwatch monitor` run sets the baseline"
                .to_string(),
        );
    }

    Ok(RuntimeStatus {
        state_dir_exists,
        snapshot_dir_exists,
        generations_exists,
        generations_size_bytes,
        config_exists,
        warnings,
    })
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);
    let state_dir = project_root.join(STATE_DIRNAME);

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (
            absolutize(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = non_blank(lookup_env("WVWWATCH_DATA_DIR")) {
        (
            absolutize(Path::new(&value), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("data"), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (
            absolutize(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = non_blank(lookup_env("WVWWATCH_CONFIG")) {
        (
            absolutize(Path::new(&value), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join(CONFIG_FILENAME), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        snapshot_dir: data_dir.join("snapshots"),
        cache_dir: state_dir.join("cache"),
        message_links_path: data_dir.join(MESSAGE_LINKS_FILENAME),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();

    let required_dirs = [
        paths.state_dir.clone(),
        paths.data_dir.clone(),
        paths.snapshot_dir.clone(),
        paths.snapshot_dir.join(ARCHIVE_DIRNAME),
        paths.cache_dir.clone(),
    ];
    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if options.materialize_config {
        write_text_file(&paths.config_path, &render_default_config(), options.force)?
    } else {
        false
    };

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_default_config() -> String {
    "# wvwwatch configuration (materialized by `wvwwatch init`)\n\
# Environment variables (WVWWATCH_*) override the values below.\n\
\n\
[api]\n\
# base_url = \"https://api.guildwars2.com\"\n\
region = \"na\"\n\
# user_agent = \"wvwwatch/0.1\"\n\
# timeout_ms = 10000\n\
# max_retries = 2\n\
# retry_delay_ms = 500\n\
\n\
[monitor]\n\
reassign_threshold = 1\n\
trigger_downstream = true\n\
# archive_keep = 50\n\
\n\
[webhook]\n\
# url = \"https://discord.com/api/webhooks/<id>/<token>\"\n\
# server_id = \"<discord server id>\"\n\
\n\
[roster]\n\
# alliances_csv_url = \"https://docs.google.com/spreadsheets/d/<sheet>/export?format=csv&gid=<gid>\"\n\
# solo_guilds_csv_url = \"https://docs.google.com/spreadsheets/d/<sheet>/export?format=csv&gid=<gid>\"\n\
# alliances_file = \"WvW Guilds - Alliances.csv\"\n\
# solo_guilds_file = \"WvW Guilds - SoloGuilds.csv\"\n\
# cache_ttl_secs = 3600\n\
# fetch_retries = 3\n\
# retry_delay_ms = 2000\n\
# post_delay_ms = 500\n\
# author_name = \"WvW Teams\"\n\
\n\
# Extra world names, keyed by world id. NA team names are built in.\n\
[worlds]\n\
# 12001 = \"Skrittsburgh\"\n"
        .to_string()
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }

    if let Some(value) = non_blank(lookup_env("WVWWATCH_PROJECT_ROOT")) {
        return (absolutize(Path::new(&value), &context.cwd), ValueSource::Env);
    }

    let root = detect_project_root_heuristic(&context.cwd, context.executable_dir.as_deref());
    (root, ValueSource::Heuristic)
}

/// Nearest ancestor of the cwd (then of the executable) that holds a
/// `.wvwwatch/` directory; the cwd itself otherwise.
fn detect_project_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> PathBuf {
    let mut seen = HashSet::new();
    let candidates = cwd
        .ancestors()
        .chain(executable_dir.into_iter().flat_map(Path::ancestors));
    for candidate in candidates {
        if !seen.insert(candidate.to_path_buf()) {
            continue;
        }
        if candidate.join(STATE_DIRNAME).is_dir() {
            return candidate.to_path_buf();
        }
    }
    cwd.to_path_buf()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
