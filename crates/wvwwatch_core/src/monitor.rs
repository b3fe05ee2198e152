use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::WatchConfig;
use crate::diff::{DiffResult, WorldPopulationDelta, diff_mappings, population_deltas};
use crate::gw2api::{Gw2ApiClient, Gw2ApiConfig};
use crate::mapping::WorldAssignmentMap;
use crate::policy::{DEFAULT_REASSIGN_THRESHOLD, should_trigger};
use crate::report::{render_change_summary, render_full_report};
use crate::runtime::ResolvedPaths;
use crate::store::{FileSnapshotStore, SnapshotStore};
use crate::webhook::{WebhookClient, WebhookNotifier};
use crate::worlds::WorldNames;

pub trait AssignmentSource {
    fn fetch_current_mapping(&mut self) -> Result<WorldAssignmentMap>;
}

/// Best-effort downstream hook; errors are logged by the caller.
pub trait Notifier {
    fn notify(&mut self, diff: &DiffResult, population: &[WorldPopulationDelta]) -> Result<()>;
}

/// Writes the change report to the log instead of a remote channel.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier {
    names: WorldNames,
}

impl LoggingNotifier {
    pub fn new(names: WorldNames) -> Self {
        Self { names }
    }
}

impl Notifier for LoggingNotifier {
    fn notify(&mut self, diff: &DiffResult, population: &[WorldPopulationDelta]) -> Result<()> {
        info!(
            reassignments = diff.total_reassignments,
            worlds_affected = population.len(),
            "downstream trigger fired"
        );
        for line in render_full_report(diff, population, &self.names).lines() {
            info!("{line}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub reassign_threshold: usize,
    pub trigger_downstream: bool,
    pub archive_keep: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            reassign_threshold: DEFAULT_REASSIGN_THRESHOLD,
            trigger_downstream: true,
            archive_keep: None,
        }
    }
}

impl RunOptions {
    pub fn from_config(config: &WatchConfig) -> Self {
        Self {
            reassign_threshold: config.reassign_threshold(),
            trigger_downstream: config.trigger_downstream(),
            archive_keep: config.monitor.archive_keep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// First run: the fetched mapping became the baseline.
    Baseline,
    Unchanged,
    Changed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Unchanged => "unchanged",
            Self::Changed => "changed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum RunFailure {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("persistence failed: {0}")]
    Persistence(String),
}

/// Everything a scheduled caller needs to know about one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub success: bool,
    pub status: RunStatus,
    pub failure: Option<RunFailure>,
    pub timestamp: DateTime<Utc>,
    pub total_guilds: usize,
    pub unique_worlds: usize,
    pub diff: Option<DiffResult>,
    pub population: Vec<WorldPopulationDelta>,
    pub should_trigger: bool,
    pub notified: bool,
    pub notifier_error: Option<String>,
    pub archives_pruned: usize,
    pub summary: Option<String>,
}

impl RunOutcome {
    fn started(timestamp: DateTime<Utc>) -> Self {
        Self {
            success: false,
            status: RunStatus::Failed,
            failure: None,
            timestamp,
            total_guilds: 0,
            unique_worlds: 0,
            diff: None,
            population: Vec::new(),
            should_trigger: false,
            notified: false,
            notifier_error: None,
            archives_pruned: 0,
            summary: None,
        }
    }

    fn failed(mut self, failure: RunFailure) -> Self {
        error!(%failure, "monitor run aborted");
        self.success = false;
        self.status = RunStatus::Failed;
        self.failure = Some(failure);
        self
    }
}

/// Fetch, commit, compare and notify once. Never returns an error: every
/// exit path is described by the outcome.
pub fn run_monitor_with<S, T, N>(
    source: &mut S,
    store: &mut T,
    notifier: &mut N,
    options: &RunOptions,
    names: &WorldNames,
    timestamp: DateTime<Utc>,
) -> RunOutcome
where
    S: AssignmentSource + ?Sized,
    T: SnapshotStore + ?Sized,
    N: Notifier + ?Sized,
{
    let mut outcome = RunOutcome::started(timestamp);

    info!("fetching current guild world assignments");
    let mapping = match source.fetch_current_mapping() {
        Ok(mapping) if mapping.is_empty() => {
            return outcome.failed(RunFailure::Fetch(
                "data source returned no guild assignments".to_string(),
            ));
        }
        Ok(mapping) => mapping,
        Err(error) => return outcome.failed(RunFailure::Fetch(format!("{error:#}"))),
    };
    outcome.total_guilds = mapping.len();
    outcome.unique_worlds = mapping.world_count();
    info!(
        guilds = outcome.total_guilds,
        worlds = outcome.unique_worlds,
        "fetched assignments"
    );

    let current = match store.commit(mapping, timestamp) {
        Ok(snapshot) => snapshot,
        Err(error) => return outcome.failed(RunFailure::Persistence(format!("{error:#}"))),
    };
    info!(fingerprint = current.fingerprint.short(), "snapshot committed");

    if let Some(keep) = options.archive_keep {
        match store.prune_archives(keep) {
            Ok(removed) => outcome.archives_pruned = removed,
            Err(error) => warn!(error = %format!("{error:#}"), keep, "archive pruning failed"),
        }
    }

    let previous = match store.load_previous() {
        Ok(Some(previous)) => previous,
        Ok(None) => {
            info!("no previous snapshot; baseline established");
            outcome.success = true;
            outcome.status = RunStatus::Baseline;
            return outcome;
        }
        Err(error) => return outcome.failed(RunFailure::Persistence(format!("{error:#}"))),
    };

    if previous.fingerprint == current.fingerprint {
        info!("fingerprint unchanged; no assignment changes");
        outcome.success = true;
        outcome.status = RunStatus::Unchanged;
        return outcome;
    }

    let diff = diff_mappings(&previous.mapping, &current.mapping);
    let population = population_deltas(&previous.mapping, &current.mapping, &diff);
    let trigger = should_trigger(&diff, options.reassign_threshold);
    info!(
        reassigned = diff.total_reassignments,
        added = diff.added.len(),
        removed = diff.removed.len(),
        threshold = options.reassign_threshold,
        trigger,
        "assignment changes detected"
    );

    outcome.success = true;
    outcome.status = RunStatus::Changed;
    outcome.should_trigger = trigger;
    outcome.summary = Some(render_change_summary(&diff, names));

    if trigger && options.trigger_downstream {
        match notifier.notify(&diff, &population) {
            Ok(()) => outcome.notified = true,
            Err(error) => {
                let reason = format!("{error:#}");
                warn!(error = %reason, "notifier failed; run still counts as successful");
                outcome.notifier_error = Some(reason);
            }
        }
    } else if trigger {
        info!("downstream trigger disabled; skipping notification");
    }

    outcome.diff = Some(diff);
    outcome.population = population;
    outcome
}

/// Production wiring: GW2 API source, file store and webhook (or log) notifier.
///
/// Configuration problems surface through the outcome like any other failure:
/// a bad API setting is a fetch failure, a bad webhook setting is a notifier
/// failure.
pub fn run_monitor(
    paths: &ResolvedPaths,
    config: &WatchConfig,
    options: &RunOptions,
) -> RunOutcome {
    let timestamp = Utc::now();
    let mut source = match Gw2ApiConfig::from_config(config).and_then(Gw2ApiClient::new) {
        Ok(source) => source,
        Err(error) => {
            let reason = format!("{:#}", error.context("failed to configure GW2 API client"));
            return RunOutcome::started(timestamp).failed(RunFailure::Fetch(reason));
        }
    };
    let mut store = FileSnapshotStore::new(&paths.snapshot_dir);
    let names = config.world_names();
    let (mut notifier, setup_error) = build_notifier(config, &names);

    let mut outcome = run_monitor_with(
        &mut source,
        &mut store,
        notifier.as_mut(),
        options,
        &names,
        timestamp,
    );
    if let Some(reason) = setup_error {
        outcome.notifier_error.get_or_insert(reason);
    }
    outcome
}

/// Pick the notifier for this config. A webhook that cannot be configured
/// falls back to the log and hands back the reason.
pub fn build_notifier(
    config: &WatchConfig,
    names: &WorldNames,
) -> (Box<dyn Notifier>, Option<String>) {
    let Some(url) = config.webhook_url() else {
        return (Box::new(LoggingNotifier::new(names.clone())), None);
    };
    match WebhookClient::new(&url, &config.user_agent(), config.timeout_ms()) {
        Ok(client) => (Box::new(WebhookNotifier::new(client, names.clone())), None),
        Err(error) => {
            let reason = format!("{:#}", error.context("failed to configure webhook notifier"));
            warn!(error = %reason, "falling back to log notifier");
            (Box::new(LoggingNotifier::new(names.clone())), Some(reason))
        }
    }
}
