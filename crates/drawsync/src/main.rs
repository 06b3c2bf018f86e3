use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use drawsync_core::config::{
    DrawsyncConfig, RemoteConfigPatch, load_config, parse_space_list, patch_remote_config,
};
use drawsync_core::content_store::ContentStore;
use drawsync_core::crawl::{ExtractOptions, ExtractReport, extract_from_remote};
use drawsync_core::index::{
    IndexMode, IndexSyncReport, SearchField, SearchIndex, SearchQuery, prune_untargeted_spaces,
    sync_index,
};
use drawsync_core::metadata::{DiagramKey, MetadataStore};
use drawsync_core::query::{DEFAULT_SEARCH_LIMIT, QueryService, serve};
use drawsync_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths,
    ensure_runtime_ready_for_extract, init_layout, inspect_runtime, resolve_paths,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "drawsync",
    version,
    about = "Mirror draw.io diagrams from Confluence into a local searchable store"
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
    #[arg(short, long, global = true, help = "Enable debug logging on stderr")]
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
    Init(InitArgs),
    Status,
    Extract(ExtractArgs),
    Index(IndexArgs),
    Search(SearchArgs),
    Spaces,
    List(ListArgs),
    Show(ShowArgs),
    #[command(about = "Answer JSON-lines queries on stdin until EOF")]
    Serve,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, value_name = "URL", help = "Confluence base URL to store in config")]
    url: Option<String>,
    #[arg(long, value_name = "KEYS", help = "Comma-separated space keys to store in config")]
    spaces: Option<String>,
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .drawsync/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct ExtractArgs {
    #[arg(long, value_name = "KEYS", help = "Comma-separated space keys (default: config or all)")]
    spaces: Option<String>,
    #[arg(long, help = "Compare against the store without fetching or writing")]
    dry_run: bool,
    #[arg(long, help = "Skip the incremental index sync after extraction")]
    no_index: bool,
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
    #[arg(long, value_name = "N")]
    batch_size: Option<usize>,
}

#[derive(Debug, Args)]
struct IndexArgs {
    #[arg(long, help = "Rebuild the whole index from a metadata snapshot")]
    rebuild: bool,
    #[arg(
        long,
        requires = "rebuild",
        help = "Remove spaces no longer listed in [remote].spaces before rebuilding"
    )]
    prune: bool,
}

#[derive(Debug, Args)]
struct SearchArgs {
    query: String,
    #[arg(long, value_name = "KEY")]
    space: Option<String>,
    #[arg(long, value_name = "FIELD", help = "Restrict to name, title or content")]
    field: Option<String>,
    #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
    limit: usize,
}

#[derive(Debug, Args)]
struct ListArgs {
    space: String,
}

#[derive(Debug, Args)]
struct ShowArgs {
    space: String,
    page: String,
    diagram: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Extract(args)) => run_extract(&runtime, args),
        Some(Commands::Index(args)) => run_index(&runtime, args),
        Some(Commands::Search(args)) => run_search(&runtime, args),
        Some(Commands::Spaces) => run_spaces(&runtime),
        Some(Commands::List(ListArgs { space })) => run_list(&runtime, &space),
        Some(Commands::Show(args)) => run_show(&runtime, args),
        Some(Commands::Serve) => run_serve(&runtime),
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
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(io::stderr)
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
    let patched = patch_remote_config(
        &paths.config_path,
        &RemoteConfigPatch {
            set_url: args.url,
            set_spaces: args.spaces.as_deref().map(parse_space_list),
        },
    )?;

    println!("Initialized drawsync runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("content_dir: {}", normalize_path(&paths.content_dir));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("index_path: {}", normalize_path(&paths.index_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("patched_remote: {patched}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let config = load_runtime_config(&paths)?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!(
        "project_root_exists: {}",
        format_flag(status.project_root_exists)
    );
    println!("content_dir_exists: {}", format_flag(status.content_dir_exists));
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!(
        "remote.url: {}",
        config.remote.url.as_deref().unwrap_or("<unset>")
    );
    println!("remote.spaces: {}", format_list(&config.remote.spaces));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!("db_size_bytes: {}", format_size(status.db_size_bytes));
    if status.db_exists {
        let pending = drawsync_core::migrate::pending_migration_count(&paths.db_path)?;
        println!("store.pending_migrations: {pending}");
        let store = MetadataStore::open(&paths.db_path)?;
        let stats = store.stats()?;
        println!("store.active: {}", stats.active);
        println!("store.deleted: {}", stats.deleted);
        println!("store.with_errors: {}", stats.with_errors);
        println!("store.spaces: {}", stats.spaces);
        println!("store.change_seq: {}", stats.change_seq);
    }
    println!("index_exists: {}", format_flag(status.index_exists));
    println!("index_size_bytes: {}", format_size(status.index_size_bytes));
    match SearchIndex::open_existing(&paths.index_path)? {
        Some(index) => {
            let stats = index.stats()?;
            println!("index.documents: {}", stats.documents);
            println!("index.watermark: {}", stats.watermark);
        }
        None => println!("index.storage: <not built> (run `drawsync index --rebuild`)"),
    }
    let usage = ContentStore::new(&paths.content_dir).usage()?;
    println!("content.diagram_dirs: {}", usage.diagram_dirs);
    println!("content.files: {}", usage.files);
    println!("content.bytes: {}", usage.bytes);
    print_warnings(&status.warnings);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_extract(runtime: &RuntimeOptions, args: ExtractArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready_for_extract(&paths, &status)?;
    let config = load_runtime_config(&paths)?;

    let mut options =
        ExtractOptions::from_config(&config, args.spaces.as_deref().map(parse_space_list));
    options.dry_run = args.dry_run;
    if let Some(workers) = args.workers {
        options.workers = workers;
    }
    if let Some(batch_size) = args.batch_size {
        options.batch_size = batch_size;
    }

    let report = extract_from_remote(&paths, &config, &options, !args.no_index)?;
    print_extract_report(&report);
    print_diagnostics(runtime, &paths);
    if !report.success {
        bail!(
            "extraction finished with {} failure(s) and {} error(s)",
            report.failures.len(),
            report.errors.len()
        );
    }
    Ok(())
}

fn run_index(runtime: &RuntimeOptions, args: IndexArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let store = MetadataStore::open_existing(&paths.db_path)?;

    println!("index sync");
    println!("index_path: {}", normalize_path(&paths.index_path));
    if args.prune {
        let config = load_runtime_config(&paths)?;
        if config.remote.spaces.is_empty() {
            bail!(
                "--prune needs an explicit space list\nSet [remote].spaces in {}",
                normalize_path(&paths.config_path)
            );
        }
        let pruned = prune_untargeted_spaces(
            &store,
            &ContentStore::new(&paths.content_dir),
            &config.remote.spaces,
        )?;
        println!("prune.targets: {}", format_list(&pruned.targets));
        println!("prune.removed_spaces: {}", format_list(&pruned.removed_spaces));
        println!("prune.removed_records: {}", pruned.removed_records);
        println!("prune.removed_content_dirs: {}", pruned.removed_content_dirs);
    }

    let mode = if args.rebuild {
        IndexMode::Rebuild
    } else {
        IndexMode::Incremental
    };
    let report = sync_index(&paths.index_path, &store, mode)?;
    print_index_report("index", &report);
    print_diagnostics(runtime, &paths);
    if !report.convergence.converged {
        bail!("index does not match the metadata store; run `drawsync index --rebuild`");
    }
    Ok(())
}

fn run_search(runtime: &RuntimeOptions, args: SearchArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let service = QueryService::open(&paths)?;
    let field = args.field.as_deref().map(SearchField::parse).transpose()?;
    let hits = service.search(&SearchQuery {
        text: args.query.clone(),
        field,
        space: args.space,
        limit: args.limit,
    })?;

    println!("search");
    println!("query: {}", args.query);
    println!("hits.count: {}", hits.len());
    for hit in hits {
        println!(
            "hit: {} | {} | {}",
            hit.identity, hit.page_title, hit.diagram_name
        );
        if !hit.snippet.is_empty() {
            println!("  snippet: {}", hit.snippet);
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_spaces(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let service = QueryService::open(&paths)?;
    let spaces = service.spaces()?;

    println!("spaces.count: {}", spaces.len());
    for space in spaces {
        println!("space: {} ({} diagrams)", space.space_key, space.diagrams);
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_list(runtime: &RuntimeOptions, space: &str) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let service = QueryService::open(&paths)?;
    let diagrams = service.list(space)?;

    println!("space: {space}");
    println!("diagrams.count: {}", diagrams.len());
    for diagram in diagrams {
        println!(
            "diagram: {} | {} | {} | rev {}{}",
            diagram.identity,
            diagram.page_title,
            diagram.diagram_name,
            diagram.local_revision,
            if diagram.last_error.is_some() {
                " | error"
            } else {
                ""
            }
        );
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_show(runtime: &RuntimeOptions, args: ShowArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let service = QueryService::open(&paths)?;
    let detail = service.get(&DiagramKey::new(args.space, args.page, args.diagram))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&detail).context("failed to encode diagram")?
    );
    Ok(())
}

fn run_serve(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let service = QueryService::open(&paths)?;
    let stdin = io::stdin();
    let stdout = io::stdout();
    let stats = serve(&service, stdin.lock(), BufWriter::new(stdout.lock()))?;
    tracing::info!(
        requests = stats.requests,
        errors = stats.errors,
        "serve finished"
    );
    Ok(())
}

fn print_extract_report(report: &ExtractReport) {
    println!("extract");
    println!("dry_run: {}", report.dry_run);
    println!("spaces: {}", report.spaces.len());
    let totals = &report.totals;
    println!("listed: {}", totals.listed);
    if report.dry_run {
        println!("would_create: {}", totals.would_create);
        println!("would_update: {}", totals.would_update);
        println!("would_delete: {}", totals.would_delete);
    } else {
        println!("created: {}", totals.created);
        println!("updated: {}", totals.updated);
        println!("revived: {}", totals.revived);
        println!("deleted: {}", totals.deleted);
        println!("vanished: {}", totals.vanished);
    }
    println!("unchanged: {}", totals.unchanged);
    println!("failed: {}", totals.failed);
    println!("cancelled: {}", report.cancelled);
    println!("request_count: {}", report.request_count);
    for space in &report.spaces {
        println!(
            "space.{}: listed={} complete={}",
            space.space_key, space.counts.listed, space.complete
        );
    }
    for failure in &report.failures {
        println!(
            "failure: {} [{}] {}",
            failure.identity,
            failure.kind.as_str(),
            failure.reason
        );
    }
    for error in &report.errors {
        println!("error: {error}");
    }
    match &report.index {
        Some(index) => print_index_report("index", index),
        None => println!("index: skipped"),
    }
}

fn print_index_report(prefix: &str, report: &IndexSyncReport) {
    println!(
        "{prefix}.mode: {}",
        match report.mode {
            IndexMode::Incremental => "incremental",
            IndexMode::Rebuild => "rebuild",
        }
    );
    println!("{prefix}.format_rebuild: {}", report.format_rebuild);
    println!("{prefix}.upserted: {}", report.upserted);
    println!("{prefix}.removed: {}", report.removed);
    println!(
        "{prefix}.watermark: {} -> {}",
        report.watermark_before, report.watermark_after
    );
    println!("{prefix}.documents: {}", report.documents);
    println!("{prefix}.converged: {}", report.convergence.converged);
    for identity in &report.convergence.missing {
        println!("{prefix}.missing: {identity}");
    }
    for identity in &report.convergence.stale {
        println!("{prefix}.stale: {identity}");
    }
}

fn print_warnings(warnings: &[String]) {
    if !warnings.is_empty() {
        println!("warnings:");
        for warning in warnings {
            println!("  - {warning}");
        }
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn load_runtime_config(paths: &ResolvedPaths) -> Result<DrawsyncConfig> {
    Ok(load_config(&paths.config_path)?.with_env_overrides())
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

fn format_size(size: Option<u64>) -> String {
    size.map(|size| size.to_string())
        .unwrap_or_else(|| "n/a".to_string())
}

fn format_list(values: &[String]) -> String {
    if values.is_empty() {
        "<none>".to_string()
    } else {
        values.join(",")
    }
}
