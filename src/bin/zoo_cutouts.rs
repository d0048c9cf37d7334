use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use zoo_cutouts::app::{
    App, ClearResult, DownloadOptions, DownloadResult, FilterResult, ListResult,
    ProgressSinkKind, QueryResult, RunOptions, TrainResult,
};
use zoo_cutouts::catalog::{CatalogClient, Table, TapHttpClient};
use zoo_cutouts::classifier::TrainOptions;
use zoo_cutouts::config::{ConfigLoader, DEFAULT_CONFIG_FILE};
use zoo_cutouts::error::{CutoutError, FetchError};
use zoo_cutouts::fetch::{HttpTransport, PooledHttpClient};
use zoo_cutouts::output::{JsonOutput, OutputMode};
use zoo_cutouts::store::Store;
use zoo_cutouts::tui::Tui;

#[derive(Parser)]
#[command(name = "zoo-cutouts")]
#[command(about = "Galaxy Zoo catalog puller and cutout downloader")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Config file (default: ./zoo-cutouts.json, built-in defaults if absent)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the catalog query against the TAP service")]
    Query(RunArgs),
    #[command(about = "Apply quality cuts and export the filtered catalog")]
    Filter(RunArgs),
    #[command(about = "Download cutouts for the filtered catalog into a tar archive")]
    Download(DownloadArgs),
    #[command(about = "Train the spiral/elliptical classifier on a features CSV")]
    Train(TrainArgs),
    #[command(about = "List catalogs and archives in the local stores")]
    List,
    #[command(about = "Clear the project-local store")]
    Clear(ClearArgs),
    #[command(about = "Write a default zoo-cutouts.json")]
    Init(InitArgs),
}

#[derive(Args, Clone, Default)]
struct RunArgs {
    #[arg(long)]
    force: bool,

    #[arg(long)]
    no_cache: bool,

    #[arg(long)]
    dry_run: bool,
}

impl From<RunArgs> for RunOptions {
    fn from(args: RunArgs) -> Self {
        RunOptions {
            force: args.force,
            no_cache: args.no_cache,
            dry_run: args.dry_run,
        }
    }
}

#[derive(Args, Clone)]
struct DownloadArgs {
    #[command(flatten)]
    run: RunArgs,

    /// Only fetch the first N objects
    #[arg(long)]
    limit: Option<usize>,

    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args, Clone)]
struct TrainArgs {
    /// CSV with PC* feature columns and spiral/elliptical votes
    features: PathBuf,

    #[arg(long, default_value_t = 200)]
    trees: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 0.2)]
    test_fraction: f64,
}

#[derive(Args, Clone)]
struct ClearArgs {
    /// Also remove the shared catalog cache
    #[arg(long)]
    cache: bool,
}

#[derive(Args, Clone)]
struct InitArgs {
    #[arg(long)]
    force: bool,
}

/// Stand-ins for commands that never reach the network.
struct NopCatalog;

impl CatalogClient for NopCatalog {
    fn query(&self, _adql: &str) -> Result<Table, CutoutError> {
        Err(CutoutError::CatalogHttp("catalog client not available".to_string()))
    }
}

struct NopTransport;

impl HttpTransport for NopTransport {
    fn get(&self, _url: &str, _timeout: Duration) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::Connection("cutout client not available".to_string()))
    }
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<CutoutError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CutoutError) -> u8 {
    match error {
        CutoutError::MissingConfig
        | CutoutError::ConfigRead(_)
        | CutoutError::ConfigParse(_)
        | CutoutError::InvalidConfig(_)
        | CutoutError::InvalidObjectId(_)
        | CutoutError::InvalidCatalogName(_)
        | CutoutError::CatalogNotFound(_)
        | CutoutError::TrainingData(_) => 2,
        CutoutError::CatalogHttp(_)
        | CutoutError::CatalogStatus { .. }
        | CutoutError::CutoutClient(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let store = Store::new().into_diagnostic()?;
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Query(args) => {
            let config = ConfigLoader::resolve_or_default(config_path)?;
            let catalog = TapHttpClient::new(&config.catalog.tap_url)?;
            let app = App::new(store, catalog, NopTransport);
            let options = RunOptions::from(args);
            let result = dispatch(output_mode, ProgressSinkKind::Query, move |sink| {
                app.query(&config, options, sink)
            })?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_query(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    print_query_summary(&result);
                    Ok(())
                }
            }
        }
        Commands::Filter(args) => {
            let config = ConfigLoader::resolve_or_default(config_path)?;
            let app = App::new(store, NopCatalog, NopTransport);
            let options = RunOptions::from(args);
            let result = dispatch(output_mode, ProgressSinkKind::Filter, move |sink| {
                app.filter(&config, options, sink)
            })?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_filter(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    print_filter_summary(&result);
                    Ok(())
                }
            }
        }
        Commands::Download(args) => {
            let config = ConfigLoader::resolve_or_default(config_path)?;
            let workers = args.workers.unwrap_or(config.download.workers).max(1);
            let transport = PooledHttpClient::new(workers)?;
            let app = App::new(store, NopCatalog, transport);
            let options = DownloadOptions {
                run: args.run.into(),
                limit: args.limit,
                workers: args.workers,
            };
            let result = dispatch(output_mode, ProgressSinkKind::Download, move |sink| {
                app.download(&config, options, sink)
            })?;
            match output_mode {
                OutputMode::NonInteractive => {
                    JsonOutput::print_download(&result).into_diagnostic()
                }
                OutputMode::Interactive => {
                    print_download_summary(&result);
                    Ok(())
                }
            }
        }
        Commands::Train(args) => {
            let app = App::new(store, NopCatalog, NopTransport);
            let mut options = TrainOptions {
                test_fraction: args.test_fraction,
                seed: args.seed,
                ..TrainOptions::default()
            };
            options.forest.n_trees = args.trees;
            options.forest.seed = args.seed;
            let features = args.features;
            let result = dispatch(output_mode, ProgressSinkKind::Train, move |sink| {
                app.train(&features, options, sink)
            })?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_train(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    print_train_summary(&result);
                    Ok(())
                }
            }
        }
        Commands::List => {
            let app = App::new(store, NopCatalog, NopTransport);
            let result = app.list(&JsonOutput)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_list(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    print_list_summary(&result);
                    Ok(())
                }
            }
        }
        Commands::Clear(args) => {
            let app = App::new(store, NopCatalog, NopTransport);
            let result = app.clear(args.cache, &JsonOutput)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_clear(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    print_clear_summary(&result);
                    Ok(())
                }
            }
        }
        Commands::Init(args) => {
            let app = App::new(store, NopCatalog, NopTransport);
            let path = PathBuf::from(config_path.unwrap_or(DEFAULT_CONFIG_FILE));
            let result = app.init_config(&path, args.force, &JsonOutput)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_init(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    println!("wrote {}", result.path);
                    Ok(())
                }
            }
        }
    }
}

/// Runs `work` under the dashboard in interactive mode, directly otherwise.
fn dispatch<F, R>(mode: OutputMode, kind: ProgressSinkKind, work: F) -> miette::Result<R>
where
    F: FnOnce(&dyn zoo_cutouts::app::ProgressSink) -> Result<R, CutoutError> + Send + 'static,
    R: Send + 'static,
{
    match mode {
        OutputMode::Interactive => Tui::new(kind).run(work),
        OutputMode::NonInteractive => work(&JsonOutput).map_err(miette::Report::new),
    }
}

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

fn print_query_summary(result: &QueryResult) {
    println!("{CYAN}zoo-cutouts query{RESET}");
    let rows = result
        .rows
        .map(|rows| rows.to_string())
        .unwrap_or_else(|| "?".to_string());
    println!(
        "{GREEN}catalog {} ({}): {rows} rows{RESET}",
        result.catalog, result.action
    );
    println!("  {}", result.project_path);
}

fn print_filter_summary(result: &FilterResult) {
    println!("{CYAN}zoo-cutouts filter{RESET}");
    println!(
        "{GREEN}kept {} of {} rows{RESET} {YELLOW}({} rejected){RESET}",
        result.kept_rows, result.input_rows, result.rejected_rows
    );
    if let Some(path) = &result.output_path {
        println!("  {path}");
    }
}

fn print_download_summary(result: &DownloadResult) {
    println!("{CYAN}zoo-cutouts download{RESET}");
    match &result.summary {
        Some(summary) => {
            println!("{GREEN}downloaded: {}{RESET}", summary.succeeded);
            let color = if summary.failed > 0 { RED } else { GREEN };
            println!("{color}failed: {}{RESET}", summary.failed);
            if summary.retried > 0 {
                println!("{YELLOW}needed retries: {}{RESET}", summary.retried);
            }
            for id in &summary.failed_ids {
                println!("{RED}  x {id}{RESET}");
            }
        }
        None => println!(
            "{YELLOW}{} cutouts planned ({}), nothing fetched{RESET}",
            result.requested, result.action
        ),
    }
    println!("  {}", result.archive_path);
}

fn print_train_summary(result: &TrainResult) {
    println!("{CYAN}zoo-cutouts train{RESET}");
    println!(
        "{GREEN}accuracy: {:.4}{RESET} ({} rows, {} features, {} trees)",
        result.report.accuracy,
        result.rows,
        result.feature_columns.len(),
        result.trees
    );
    println!("{}", result.report);
}

fn print_list_summary(result: &ListResult) {
    if result.entries.is_empty() {
        println!("{YELLOW}nothing stored yet{RESET}");
        return;
    }
    for entry in &result.entries {
        let rows = entry
            .rows
            .map(|rows| format!(" {rows} rows"))
            .unwrap_or_default();
        let location = match (&entry.project_path, &entry.cache_path) {
            (Some(_), Some(_)) => "project+cache",
            (Some(_), None) => "project",
            (None, Some(_)) => "cache",
            (None, None) => "?",
        };
        println!(
            "{CYAN}{:<9}{RESET} {}{rows} [{location}]",
            entry.kind, entry.name
        );
    }
}

fn print_clear_summary(result: &ClearResult) {
    if result.cache_cleared {
        println!("{GREEN}cleared project store and shared cache{RESET}");
    } else {
        println!("{GREEN}cleared project store{RESET}");
    }
}
