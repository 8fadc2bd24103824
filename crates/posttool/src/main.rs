use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Result, anyhow, bail};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueEnum};
use posttool_core::batch::{RewriteReport, RewriteRequest, rewrite_matching};
use posttool_core::config::load_config;
use posttool_core::migrate::{pending_migration_count, run_migrations};
use posttool_core::renumber::{
    RenumberError, RenumberOptions, RenumberReport, RenumberStatus, renumber_project,
};
use posttool_core::rewrite::SqliteTextRewriter;
use posttool_core::runtime::{
    InitOptions, MIGRATIONS_POLICY_MESSAGE, PathOverrides, ResolutionContext, ResolvedPaths,
    ensure_database_ready, init_layout, inspect_runtime, resolve_paths,
};
use posttool_core::services::MatchKind;
use posttool_core::store::{StoreStats, open_store, store_stats};
use tracing::error;

#[derive(Debug, Parser)]
#[command(
    name = "posttool",
    version,
    about = "Batch maintenance for forum post storage"
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
    #[arg(short, long, global = true, action = ArgAction::Count, help = "Raise log verbosity (-v debug, -vv trace)")]
    verbose: u8,
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
    Db(DbArgs),
    #[command(about = "Reassign sequence numbers in creation order")]
    Renumber(RenumberArgs),
    #[command(about = "Find and replace text in live documents")]
    Replace(ReplaceArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .posttool/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Stats,
    Migrate,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Args)]
struct RenumberArgs {
    #[arg(long, value_name = "ID", help = "Only renumber this collection")]
    collection: Option<i64>,
    #[arg(long, help = "Run the full pass, then roll it back")]
    dry_run: bool,
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct ReplaceArgs {
    pattern: String,
    replacement: String,
    #[arg(long, help = "Treat PATTERN as a regular expression")]
    regex: bool,
    #[arg(long, help = "Print diffs instead of writing")]
    dry_run: bool,
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    let result = match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Stats => run_db_stats(&runtime),
            DbSubcommand::Migrate => run_db_migrate(&runtime),
        },
        Some(Commands::Renumber(args)) => run_renumber(&runtime, args),
        Some(Commands::Replace(args)) => run_replace(&runtime, args),
        None => {
            let mut command = Cli::command();
            match command.print_help() {
                Ok(()) => {
                    println!();
                    Ok(())
                }
                Err(err) => Err(err.into()),
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn setup_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("POSTTOOL_LOG").unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,posttool={default_level},posttool_core={default_level}"
        ))
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
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

    println!("Initialized posttool runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("policy: {MIGRATIONS_POLICY_MESSAGE}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let status = inspect_runtime(&paths)?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("project_root_exists: {}", format_flag(status.project_root_exists));
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("config_exists: {}", format_flag(status.config_exists));
    println!(
        "pending_migrations: {}",
        pending_migration_count(&paths, &config)?
    );
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let report = run_migrations(&paths, &config)?;

    println!("db migrate");
    println!("db_path: {}", normalize_path(&paths.db_path));
    if report.applied.is_empty() {
        println!("applied: <none>");
    } else {
        for migration in &report.applied {
            println!("applied: v{:03}_{}", migration.version, migration.name);
        }
    }
    println!("current_version: {}", report.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let status = inspect_runtime(&paths)?;

    println!("db stats");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("db_exists: {}", format_flag(status.db_exists));
    match open_store(&paths, &config)? {
        Some(connection) => print_store_stats("store", &store_stats(&connection)?),
        None => println!("store: <not migrated> (run `posttool db migrate`)"),
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_renumber(runtime: &RuntimeOptions, args: RenumberArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let status = inspect_runtime(&paths)?;
    ensure_database_ready(&paths, &status)?;
    let options = RenumberOptions::from_config(&config, args.collection, args.dry_run);

    let report = match renumber_project(&paths, &config, &options) {
        Ok(report) => report,
        Err(err) => {
            if let Some(cause) = err.downcast_ref::<RenumberError>() {
                error!(stage = %cause.stage(), retryable = cause.is_retryable(), "renumber aborted");
            }
            println!("status: {}", RenumberStatus::Aborted.as_str());
            print_diagnostics(runtime, &paths);
            return Err(err);
        }
    };

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_renumber_report(&report),
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_replace(runtime: &RuntimeOptions, args: ReplaceArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let status = inspect_runtime(&paths)?;
    ensure_database_ready(&paths, &status)?;
    let connection = open_store(&paths, &config)?
        .ok_or_else(|| anyhow!("store is not migrated; run `posttool db migrate`"))?;
    let mut rewriter = SqliteTextRewriter::new(&connection);

    let report = rewrite_matching(
        &mut rewriter,
        &RewriteRequest {
            pattern: args.pattern,
            replacement: args.replacement,
            kind: if args.regex {
                MatchKind::Regex
            } else {
                MatchKind::Literal
            },
            dry_run: args.dry_run,
        },
        &config,
    )?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_rewrite_report(&report),
    }
    print_diagnostics(runtime, &paths);
    if report.batch.failed > 0 {
        bail!("{} documents could not be rewritten", report.batch.failed);
    }
    Ok(())
}

fn print_renumber_report(report: &RenumberReport) {
    println!("renumber");
    println!(
        "collection: {}",
        report
            .collection_filter
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<all>".to_string())
    );
    println!("dry_run: {}", report.dry_run);
    println!("collections_scanned: {}", report.collections_scanned);
    println!("documents_scanned: {}", report.documents_scanned);
    println!("collections_touched: {}", report.collections_touched);
    println!("documents_moved: {}", report.documents_moved);
    println!("reply_references_updated: {}", report.reply_references_updated);
    for (kind, count) in &report.references_updated {
        println!("references_updated.{kind}: {count}");
    }
    for (kind, count) in &report.dangling_references {
        println!("dangling.{kind}: {count}");
    }
    println!("status: {}", report.status().as_str());
}

fn print_rewrite_report(report: &RewriteReport) {
    println!("replace");
    println!("pattern: {}", report.pattern);
    println!("kind: {}", report.kind.as_str());
    println!("dry_run: {}", report.dry_run);
    println!("matched: {}", report.batch.attempted);
    println!("rewritten: {}", report.batch.succeeded);
    println!("unchanged: {}", report.batch.skipped);
    println!("failed: {}", report.batch.failed);
    for failure in &report.batch.failures {
        println!(
            "failure: {}#{} {}",
            failure.collection_id, failure.sequence_number, failure.message
        );
    }
    for preview in &report.previews {
        print!("{}", preview.diff);
    }
}

fn print_store_stats(prefix: &str, stats: &StoreStats) {
    println!("{prefix}.documents: {}", stats.documents);
    println!("{prefix}.live_documents: {}", stats.live_documents);
    println!("{prefix}.collections: {}", stats.collections);
    for (kind, count) in &stats.references {
        println!("{prefix}.references.{kind}: {count}");
    }
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
