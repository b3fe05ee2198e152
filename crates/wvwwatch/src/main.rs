use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wvwwatch_core::config::{WatchConfig, load_config};
use wvwwatch_core::diff::{DiffResult, WorldPopulationDelta, diff_mappings, population_deltas};
use wvwwatch_core::monitor::{RunOptions, RunOutcome, run_monitor};
use wvwwatch_core::publish::{EmbedStyle, PublishOptions, build_roster_embeds, publish_roster};
use wvwwatch_core::report::{render_change_summary, render_population_impact};
use wvwwatch_core::roster::{
    HttpSheetSource, RemoteRosterOptions, Roster, apply_world_assignments, load_local_roster,
    load_remote_roster, local_roster_paths,
};
use wvwwatch_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    resolve_paths,
};
use wvwwatch_core::store::{FileSnapshotStore, SnapshotStore};
use wvwwatch_core::webhook::{Embed, WebhookClient};

#[derive(Debug, Parser)]
#[command(
    name = "wvwwatch",
    version,
    about = "Track guild world assignments for Guild Wars 2 WvW and publish rosters"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Log at debug level unless WVWWATCH_LOG is set")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the runtime layout and a commented config file
    Init(InitArgs),
    /// Fetch assignments, commit a snapshot and report changes
    Monitor(MonitorArgs),
    /// Show stored snapshot generations
    Status,
    /// Diff the stored previous and current generations without fetching
    Diff(DiffArgs),
    Archive(ArchiveArgs),
    Roster(RosterArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .wvwwatch/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct MonitorArgs {
    #[arg(long, value_name = "N", help = "Reassignments needed to notify downstream")]
    threshold: Option<usize>,
    #[arg(long, help = "Report changes without notifying downstream")]
    no_trigger: bool,
    #[arg(long, help = "Print the run outcome as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct DiffArgs {
    #[arg(long, help = "Print the diff as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct ArchiveArgs {
    #[command(subcommand)]
    command: ArchiveSubcommand,
}

#[derive(Debug, Subcommand)]
enum ArchiveSubcommand {
    List,
    Prune {
        #[arg(long, value_name = "N", help = "Number of newest archives to keep")]
        keep: usize,
    },
}

#[derive(Debug, Args)]
struct RosterArgs {
    #[command(subcommand)]
    command: RosterSubcommand,
}

#[derive(Debug, Subcommand)]
enum RosterSubcommand {
    /// Post per-world guild lists and a summary to the webhook
    Publish(PublishArgs),
}

#[derive(Debug, Args)]
struct PublishArgs {
    #[command(flatten)]
    source: RosterSourceArgs,
    #[arg(long, help = "Move roster entries to the worlds in the current snapshot")]
    apply_assignments: bool,
    #[arg(long, help = "Print embeds as JSON instead of posting")]
    dry_run: bool,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct RosterSourceArgs {
    #[arg(long, help = "Read the roster from the configured spreadsheet exports")]
    remote: bool,
    #[arg(long, help = "Read the roster from local CSV files")]
    local: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Monitor(args)) => run_monitor_command(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Diff(args)) => run_diff(&runtime, args),
        Some(Commands::Archive(ArchiveArgs { command })) => match command {
            ArchiveSubcommand::List => run_archive_list(&runtime),
            ArchiveSubcommand::Prune { keep } => run_archive_prune(&runtime, keep),
        },
        Some(Commands::Roster(RosterArgs { command })) => match command {
            RosterSubcommand::Publish(args) => run_roster_publish(&runtime, args),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("WVWWATCH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;

    println!("Initialized wvwwatch runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("snapshot_dir: {}", normalize_path(&paths.snapshot_dir));
    println!("cache_dir: {}", normalize_path(&paths.cache_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_monitor_command(runtime: &RuntimeOptions, args: MonitorArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let mut options = RunOptions::from_config(&config);
    if let Some(threshold) = args.threshold {
        options.reassign_threshold = threshold;
    }
    if args.no_trigger {
        options.trigger_downstream = false;
    }

    let outcome = run_monitor(&paths, &config, &options);
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&outcome).context("failed to render run outcome")?
        );
    } else {
        print_outcome(&outcome, &options, &config);
    }
    print_diagnostics(runtime, &paths);

    if let Some(failure) = &outcome.failure {
        bail!("monitor run failed: {failure}");
    }
    Ok(())
}

fn print_outcome(outcome: &RunOutcome, options: &RunOptions, config: &WatchConfig) {
    println!("status: {}", outcome.status.as_str());
    println!("success: {}", format_flag(outcome.success));
    println!("timestamp: {}", outcome.timestamp.to_rfc3339());
    if let Some(failure) = &outcome.failure {
        println!("failure: {failure}");
        return;
    }
    println!("guilds: {}", outcome.total_guilds);
    println!("worlds: {}", outcome.unique_worlds);
    println!("threshold: {}", options.reassign_threshold);
    println!("trigger_downstream: {}", format_flag(options.trigger_downstream));
    println!("should_trigger: {}", format_flag(outcome.should_trigger));
    println!("notified: {}", format_flag(outcome.notified));
    if let Some(error) = &outcome.notifier_error {
        println!("notifier_error: {error}");
    }
    if options.archive_keep.is_some() {
        println!("archives_pruned: {}", outcome.archives_pruned);
    }
    if let Some(summary) = &outcome.summary {
        println!();
        println!("{summary}");
    }
    let impact = render_population_impact(&outcome.population, &config.world_names());
    if !impact.is_empty() {
        println!();
        println!("{impact}");
    }
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let store = FileSnapshotStore::new(&paths.snapshot_dir);

    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("snapshot_dir: {}", normalize_path(&paths.snapshot_dir));
    println!("config_exists: {}", format_flag(status.config_exists));
    match store.load_generations()? {
        Some(generations) => {
            println!("run_count: {}", generations.run_count);
            println!("last_run: {}", generations.last_run.to_rfc3339());
            println!(
                "current: {} guilds, {} worlds, {} @ {}",
                generations.current.guild_count,
                generations.current.world_count,
                generations.current.fingerprint.short(),
                generations.current.timestamp.to_rfc3339()
            );
            match &generations.previous {
                Some(previous) => println!(
                    "previous: {} guilds, {} worlds, {} @ {}",
                    previous.guild_count,
                    previous.world_count,
                    previous.fingerprint.short(),
                    previous.timestamp.to_rfc3339()
                ),
                None => println!("previous: <none>"),
            }
        }
        None => println!("generations: <none>"),
    }
    println!("archives: {}", store.list_archives()?.len());
    if let Some(bytes) = status.generations_size_bytes {
        println!("generations_size_bytes: {bytes}");
    }
    for warning in &status.warnings {
        println!("warning: {warning}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

#[derive(Serialize)]
struct DiffReport<'a> {
    diff: &'a DiffResult,
    population: &'a [WorldPopulationDelta],
}

fn run_diff(runtime: &RuntimeOptions, args: DiffArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let store = FileSnapshotStore::new(&paths.snapshot_dir);

    let (Some(previous), Some(current)) = (store.load_previous()?, store.load_current()?) else {
        println!("diff: unavailable (fewer than two stored generations)");
        return Ok(());
    };
    let diff = diff_mappings(&previous.mapping, &current.mapping);
    let population = population_deltas(&previous.mapping, &current.mapping, &diff);

    if args.json {
        let report = DiffReport {
            diff: &diff,
            population: &population,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to render diff")?
        );
        return Ok(());
    }

    let names = config.world_names();
    println!("previous: {}", previous.timestamp.to_rfc3339());
    println!("current: {}", current.timestamp.to_rfc3339());
    println!("total_changes: {}", diff.total_changes);
    println!();
    println!("{}", render_change_summary(&diff, &names));
    let impact = render_population_impact(&population, &names);
    if !impact.is_empty() {
        println!();
        println!("{impact}");
    }
    Ok(())
}

fn run_archive_list(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let store = FileSnapshotStore::new(&paths.snapshot_dir);
    let archives = store.list_archives()?;
    println!("archives: {}", archives.len());
    for entry in &archives {
        let archived = store.load_archive(&entry.path)?;
        println!(
            "  {}: {} guilds, {} worlds, captured {}",
            entry.file_name,
            archived.snapshot.guild_count,
            archived.snapshot.world_count,
            archived.snapshot.timestamp.to_rfc3339()
        );
    }
    Ok(())
}

fn run_archive_prune(runtime: &RuntimeOptions, keep: usize) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let mut store = FileSnapshotStore::new(&paths.snapshot_dir);
    let removed = store.prune_archives(keep)?;
    println!("removed: {removed}");
    println!("kept: {}", store.list_archives()?.len());
    Ok(())
}

fn run_roster_publish(runtime: &RuntimeOptions, args: PublishArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;

    let mut roster = load_roster(&paths, &config, &args.source)?;
    if args.apply_assignments {
        roster = apply_current_snapshot(&paths, &config, &roster)?;
    }

    if args.dry_run {
        let embeds = build_roster_embeds(&roster, &EmbedStyle::from_config(&config), Utc::now())
            .into_iter()
            .collect::<BTreeMap<String, Vec<Embed>>>();
        println!(
            "{}",
            serde_json::to_string_pretty(&embeds).context("failed to render embeds")?
        );
        return Ok(());
    }

    let Some(webhook_url) = config.webhook_url() else {
        bail!("webhook.url (or WVWWATCH_WEBHOOK_URL) is required to publish");
    };
    let mut webhook = WebhookClient::new(&webhook_url, &config.user_agent(), config.timeout_ms())?;
    let options = PublishOptions::from_config(&config, &paths.message_links_path)?;
    let report = publish_roster(&mut webhook, &roster, &options)?;

    println!("deleted: {}", report.deleted);
    println!("delete_failures: {}", report.delete_failures);
    println!("invalid_links: {}", report.invalid_links);
    println!("worlds: {}", report.worlds.join(", "));
    println!("messages_posted: {}", report.messages_posted);
    if let Some(link) = &report.summary_link {
        println!("summary: {link}");
    }
    println!(
        "message_links: {}",
        normalize_path(&paths.message_links_path)
    );
    Ok(())
}

fn load_roster(
    paths: &ResolvedPaths,
    config: &WatchConfig,
    source: &RosterSourceArgs,
) -> Result<Roster> {
    if source.remote {
        let options = RemoteRosterOptions::from_config(config, &paths.cache_dir)?;
        let mut sheets = HttpSheetSource::new(&config.user_agent(), config.timeout_ms())?;
        return load_remote_roster(&mut sheets, &options);
    }
    let (alliances, solo_guilds) = local_roster_paths(&paths.project_root, config);
    load_local_roster(&alliances, &solo_guilds)
}

fn apply_current_snapshot(
    paths: &ResolvedPaths,
    config: &WatchConfig,
    roster: &Roster,
) -> Result<Roster> {
    let store = FileSnapshotStore::new(&paths.snapshot_dir);
    let Some(current) = store.load_current()? else {
        bail!("no stored snapshot to apply; run `wvwwatch monitor` first");
    };
    let update = apply_world_assignments(roster, &current.mapping, &config.world_names());
    for (key, change) in &update.changed {
        println!("moved: {key}: {change}");
    }
    info!(
        moved = update.changed.len(),
        remained = update.unchanged.len(),
        "roster updated from snapshot"
    );
    Ok(update.roster)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
