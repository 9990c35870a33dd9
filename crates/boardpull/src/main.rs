use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use boardpull_core::config::{self, BoardConfigPatch};
use boardpull_core::driver::{SessionOptions, WebDriverSession};
use boardpull_core::materialize::materialize;
use boardpull_core::reconcile::reconcile;
use boardpull_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths,
    ensure_runtime_ready_for_materialize, init_layout, inspect_runtime, prepare_scrape_dirs,
    resolve_paths,
};
use boardpull_core::snapshot::{id_index, load_snapshot};
use boardpull_core::traverse::{self, Credentials, ScrapeReport};

#[derive(Debug, Parser)]
#[command(
    name = "boardpull",
    version,
    about = "Pull a project tracker's board into a JSON snapshot and a reviewable file tree"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    output_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            output_dir: cli.output_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the runtime layout and a starter boardpull.toml")]
    Init(InitArgs),
    #[command(about = "Capture the whole board into the snapshot")]
    Scrape(ScrapeArgs),
    #[command(about = "Capture items the snapshot is missing from the current page")]
    Item(ItemArgs),
    #[command(about = "Build the output tree from the snapshot")]
    Materialize(MaterializeArgs),
    #[command(about = "Inspect runtime paths and the captured snapshot")]
    Status(StatusArgs),
    #[command(about = "Show or update boardpull.toml")]
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing boardpull.toml")]
    force: bool,
    #[arg(long, help = "Skip writing boardpull.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct ScrapeArgs {
    #[arg(
        long,
        value_name = "N",
        default_value_t = 0,
        help = "Top-level row to resume from"
    )]
    start_index: usize,
    #[arg(long, value_name = "URL", help = "Backlog URL (overrides config and env)")]
    url: Option<String>,
    #[arg(long, help = "Scrape the unparented bucket instead of the backlog")]
    unparented: bool,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct ItemArgs {
    #[arg(
        long,
        value_name = "URL",
        help = "Query or list page holding the item links (overrides config and env)"
    )]
    url: Option<String>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct MaterializeArgs {
    #[arg(long, help = "Skip the related-work reconcile pass")]
    no_related: bool,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct ConfigArgs {
    #[arg(long, value_name = "URL", help = "Write [board].base_url")]
    set_base_url: Option<String>,
    #[arg(long, value_name = "URL", help = "Write [board].webdriver_url")]
    set_webdriver_url: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Scrape(args)) => run_scrape(&runtime, args),
        Some(Commands::Item(args)) => run_item(&runtime, args),
        Some(Commands::Materialize(args)) => run_materialize(&runtime, args),
        Some(Commands::Status(args)) => run_status(&runtime, args),
        Some(Commands::Config(args)) => run_config(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
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

    println!("Initialized boardpull runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("snapshot_path: {}", normalize_path(&paths.snapshot_path));
    println!("staging_dir: {}", normalize_path(&paths.staging_dir));
    println!("output_dir: {}", normalize_path(&paths.output_dir));
    println!("log_dir: {}", normalize_path(&paths.log_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_scrape(runtime: &RuntimeOptions, args: ScrapeArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    prepare_scrape_dirs(&paths)?;
    init_tracing(&paths.log_dir);

    let board = config::load_config(&paths.config_path)?;
    let mut scrape = board.scrape_config_with_url(args.url)?;
    if args.unparented {
        scrape.unparented = true;
    }

    let credentials = config::credentials_from_env()
        .map(|(email, password)| Credentials { email, password });

    let mut options =
        SessionOptions::new(board.webdriver_url(), &paths.staging_dir).with_scrape_config(&scrape);
    options.browser_binary = board.browser_binary();

    let mut session = WebDriverSession::connect(&options)?;
    let outcome = traverse::run_scrape(
        &mut session,
        &scrape,
        credentials.as_ref(),
        &paths.snapshot_path,
        args.start_index,
    );
    if let Err(error) = session.quit() {
        warn!(%error, "failed to close the browser session");
    }
    let report = outcome?;

    print_scrape_report("scrape report", &report, args.format)?;
    if matches!(args.format, OutputFormat::Text)
        && let Some(index) = report.resume_index
    {
        println!("rerun: boardpull scrape --start-index {index}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_item(runtime: &RuntimeOptions, args: ItemArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    prepare_scrape_dirs(&paths)?;
    init_tracing(&paths.log_dir);

    let board = config::load_config(&paths.config_path)?;
    let scrape = board.scrape_config_with_url(args.url)?;

    let credentials = config::credentials_from_env()
        .map(|(email, password)| Credentials { email, password });

    let mut options =
        SessionOptions::new(board.webdriver_url(), &paths.staging_dir).with_scrape_config(&scrape);
    options.browser_binary = board.browser_binary();

    let mut session = WebDriverSession::connect(&options)?;
    let outcome = traverse::run_single_capture(
        &mut session,
        &scrape,
        credentials.as_ref(),
        &paths.snapshot_path,
    );
    if let Err(error) = session.quit() {
        warn!(%error, "failed to close the browser session");
    }
    let report = outcome?;

    print_scrape_report("item report", &report, args.format)?;
    if matches!(args.format, OutputFormat::Text) && report.resume_index.is_some() {
        println!("rerun: boardpull item");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_materialize(runtime: &RuntimeOptions, args: MaterializeArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready_for_materialize(&paths, &status)?;
    init_tracing(&paths.log_dir);

    let board = config::load_config(&paths.config_path)?;
    // origin.md needs the backlog URL even though no browser is involved.
    let scrape = board.scrape_config()?;
    let items = load_snapshot(&paths.snapshot_path)?;

    let materialized = materialize(&items, &paths.output_dir, &paths.staging_dir, &scrape)?;
    let reconciled = if args.no_related {
        None
    } else {
        Some(reconcile(&items, &paths.output_dir)?)
    };

    match args.format {
        OutputFormat::Json => {
            let combined = serde_json::json!({
                "materialize": materialized,
                "reconcile": reconciled,
            });
            println!("{}", serde_json::to_string_pretty(&combined)?);
        }
        OutputFormat::Text => {
            println!("materialize report");
            println!("output_dir: {}", normalize_path(&paths.output_dir));
            println!("items: {}", materialized.items);
            println!("history_entries: {}", materialized.history_entries);
            println!("discussions: {}", materialized.discussions);
            println!("changesets: {}", materialized.changesets);
            println!("attachments_moved: {}", materialized.attachments_moved);
            println!("attachments_missing: {}", materialized.attachments_missing);
            if let Some(reconciled) = &reconciled {
                println!("related.linked: {}", reconciled.linked);
                println!("related.existing: {}", reconciled.existing);
                println!("related.cross_project: {}", reconciled.cross_project);
                println!("related.missing_items: {}", reconciled.missing_items);
            }
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions, args: StatusArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let items = if status.snapshot_exists {
        load_snapshot(&paths.snapshot_path)?
    } else {
        Vec::new()
    };
    let indexed = id_index(&items);

    match args.format {
        OutputFormat::Json => {
            let combined = serde_json::json!({
                "project_root": normalize_path(&paths.project_root),
                "project_root_exists": status.project_root_exists,
                "data_dir_exists": status.data_dir_exists,
                "snapshot_path": normalize_path(&paths.snapshot_path),
                "snapshot_exists": status.snapshot_exists,
                "snapshot_size_bytes": status.snapshot_size_bytes,
                "staging_exists": status.staging_exists,
                "staged_files": status.staged_file_count,
                "output_exists": status.output_exists,
                "config_exists": status.config_exists,
                "top_level_items": items.len(),
                "indexed_ids": indexed.len(),
                "warnings": status.warnings,
            });
            println!("{}", serde_json::to_string_pretty(&combined)?);
        }
        OutputFormat::Text => {
            println!("runtime status");
            println!("project_root: {}", normalize_path(&paths.project_root));
            println!(
                "project_root_exists: {}",
                format_flag(status.project_root_exists)
            );
            println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
            println!("snapshot_path: {}", normalize_path(&paths.snapshot_path));
            println!("snapshot_exists: {}", format_flag(status.snapshot_exists));
            println!(
                "snapshot_size_bytes: {}",
                status
                    .snapshot_size_bytes
                    .map(|size| size.to_string())
                    .unwrap_or_else(|| "n/a".to_string())
            );
            println!("staging_exists: {}", format_flag(status.staging_exists));
            println!("staged_files: {}", status.staged_file_count);
            println!("output_exists: {}", format_flag(status.output_exists));
            println!("config_exists: {}", format_flag(status.config_exists));
            println!("snapshot.top_level_items: {}", items.len());
            println!("snapshot.indexed_ids: {}", indexed.len());
            if !status.warnings.is_empty() {
                println!("warnings:");
                for warning in &status.warnings {
                    println!("  - {warning}");
                }
            }
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_config(runtime: &RuntimeOptions, args: ConfigArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let patch = BoardConfigPatch {
        set_base_url: args.set_base_url,
        set_webdriver_url: args.set_webdriver_url,
    };
    if config::patch_board_config(&paths.config_path, &patch)? {
        println!("Updated {}", normalize_path(&paths.config_path));
    }

    let board = config::load_config(&paths.config_path)?;
    println!(
        "config_path: {} ({})",
        normalize_path(&paths.config_path),
        if paths.config_path.exists() {
            "found"
        } else {
            "missing"
        }
    );
    println!(
        "base_url: {}",
        board
            .base_url_owned()
            .unwrap_or_else(|| "<unset>".to_string())
    );
    println!("webdriver_url: {}", board.webdriver_url());
    println!("work_item_endpoint: {}", board.work_item_endpoint());
    println!(
        "browser_binary: {}",
        board
            .browser_binary()
            .unwrap_or_else(|| "<default>".to_string())
    );
    println!("on_prem: {}", board.on_prem());
    println!("unparented: {}", board.unparented());
    println!("max_retries: {}", board.max_retries());
    println!("max_wait_time_secs: {}", board.max_wait_time().as_secs());
    println!("poll_interval_ms: {}", board.poll_interval().as_millis());
    println!("retry_delay_ms: {}", board.retry_delay().as_millis());
    println!(
        "capture_changeset_content: {}",
        board.capture_changeset_content()
    );
    println!("timestamp_formats: {}", board.timestamp_formats().join(", "));
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn print_scrape_report(heading: &str, report: &ScrapeReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Text => {
            println!("{heading}");
            println!("total_rows: {}", report.total_rows);
            println!("captured: {}", report.captured);
            println!("skipped: {}", report.skipped);
            println!("appended: {}", report.appended);
            println!("replaced: {}", report.replaced);
            println!("kept: {}", report.kept);
            println!(
                "resume_index: {}",
                report
                    .resume_index
                    .map(|index| index.to_string())
                    .unwrap_or_else(|| "<none>".to_string())
            );
        }
    }
    Ok(())
}

/// Console on stderr plus a non-blocking file layer, so `--format json`
/// output on stdout stays parseable.
fn init_tracing(log_dir: &Path) {
    std::fs::create_dir_all(log_dir).ok();
    let file_appender = tracing_appender::rolling::never(log_dir, "boardpull.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "boardpull=info,boardpull_core=info".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    // The appender flushes on drop; the guard must outlive the whole run.
    std::mem::forget(guard);
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        output_dir: runtime.output_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        eprintln!("[diagnostics]\n{}", paths.diagnostics());
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
