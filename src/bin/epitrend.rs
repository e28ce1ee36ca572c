use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use epitrend::config::ConfigLoader;
use epitrend::domain::{DateKey, EntityLevel, SaveFormat};
use epitrend::engine::Engine;
use epitrend::error::EpiError;
use epitrend::output::{JsonOutput, SeriesOutput, StderrProgress};
use epitrend::pipeline::{DateWindow, ValueKind};
use epitrend::query::SeriesRequest;
use epitrend::queue::DrainReport;
use epitrend::store::Store;
use epitrend::tree::PopulationRange;
use epitrend::web::HttpTransport;

#[derive(Parser)]
#[command(name = "epitrend")]
#[command(about = "Regional epidemiological time series: import, update, aggregate")]
#[command(version)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Load files into the tree")]
    Load(LoadArgs),
    #[command(about = "Download datasets whose update is due")]
    Update(UpdateArgs),
    #[command(about = "Save the tree in a native format")]
    Save(SaveArgs),
    #[command(about = "Print the aggregated series of one entity")]
    Series(SeriesArgs),
    #[command(about = "Search entities by name")]
    Search(SearchArgs),
    #[command(about = "Rank descendants by their extreme values")]
    Rank(RankArgs),
}

#[derive(Args)]
struct LoadArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,

    #[arg(long, help = "Write the snapshot after loading")]
    save: bool,
}

#[derive(Args)]
struct UpdateArgs {
    #[arg(long, help = "Download every dataset regardless of schedule")]
    all: bool,
}

#[derive(Args)]
struct SaveArgs {
    #[arg(long, value_enum, default_value_t = SaveFormat::Pack)]
    format: SaveFormat,

    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct WindowArgs {
    #[arg(long)]
    from: Option<DateKey>,

    #[arg(long)]
    to: Option<DateKey>,
}

#[derive(Args)]
struct SeriesArgs {
    code: String,

    #[arg(long, value_enum)]
    kind: ValueKind,

    #[command(flatten)]
    window: WindowArgs,

    #[arg(long)]
    min_pop: Option<u64>,

    #[arg(long)]
    max_pop: Option<u64>,
}

#[derive(Args)]
struct SearchArgs {
    text: String,
}

#[derive(Args)]
struct RankArgs {
    code: String,

    #[arg(long, value_enum)]
    level: EntityLevel,

    #[arg(long, default_value_t = 5)]
    highest: usize,

    #[arg(long, default_value_t = 5)]
    lowest: usize,

    #[arg(long, value_enum)]
    kind: ValueKind,

    #[command(flatten)]
    window: WindowArgs,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<EpiError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &EpiError) -> u8 {
    match error {
        EpiError::EntityNotFound(_)
        | EpiError::MissingConfig
        | EpiError::ConfigRead(_)
        | EpiError::ConfigParse(_) => 2,
        EpiError::DownloadHttp(_) | EpiError::DownloadStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = Utf8PathBuf::from(dir);
    }
    let store = Store::new(config.data_dir.clone());
    let transport = Arc::new(HttpTransport::new()?);
    let engine = Engine::start(config, store, transport, Arc::new(StderrProgress))?;

    report_warnings(&engine.load_initial()?);

    match cli.command {
        Commands::Load(args) => {
            let mut report = engine.load_files(&args.files)?;
            if args.save && report.errors.is_empty() {
                let saved = engine.save(None, SaveFormat::Pack)?;
                report.items_run += saved.items_run;
                report.errors.extend(saved.errors);
                report.warnings.extend(saved.warnings);
            }
            finish(&report)
        }
        Commands::Update(args) => finish(&engine.download_update(args.all)?),
        Commands::Save(args) => finish(&engine.save(args.output.as_deref(), args.format)?),
        Commands::Series(args) => {
            let request = SeriesRequest {
                kind: args.kind,
                window: window(&args.window),
                population: PopulationRange {
                    min: args.min_pop,
                    max: args.max_pop,
                },
            };
            let series = engine.series(&args.code, &request)?;
            JsonOutput::print_series(&SeriesOutput::new(&series, args.kind)).into_diagnostic()
        }
        Commands::Search(args) => {
            JsonOutput::print_search(&engine.search(&args.text)?).into_diagnostic()
        }
        Commands::Rank(args) => {
            let request = SeriesRequest {
                window: window(&args.window),
                ..SeriesRequest::new(args.kind)
            };
            let entries =
                engine.ranked(&args.code, args.level, args.highest, args.lowest, &request)?;
            JsonOutput::print_rank(&entries).into_diagnostic()
        }
    }
}

fn window(args: &WindowArgs) -> DateWindow {
    DateWindow::new(args.from, args.to)
}

fn report_warnings(report: &DrainReport) {
    if let Some(message) = report.message() {
        eprintln!("{message}");
    }
}

fn finish(report: &DrainReport) -> miette::Result<()> {
    report_warnings(report);
    JsonOutput::print_report(report).into_diagnostic()?;
    if report.errors.is_empty() {
        Ok(())
    } else {
        Err(miette::Report::msg(format!(
            "{} queue item(s) failed",
            report.errors.len()
        )))
    }
}
