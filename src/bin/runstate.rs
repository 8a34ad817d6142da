//! runstate CLI - replays a run plan and reports the aggregated run status.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use runstate::{
    ConfigurationLoader, DefaultPlanRunner, PlanRunner, Properties, RunConfiguration, RunPlan,
    RunSummary,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Replay a BDD run plan through the variable and status engine.
#[derive(Parser, Debug)]
#[command(name = "runstate", version, about)]
struct Cli {
    /// Run plan file (YAML).
    #[arg(short = 'p', long = "plan", env = "RUNSTATE_PLAN")]
    plan: PathBuf,

    /// Configuration file or directory; may be repeated, later wins.
    #[arg(short = 'c', long = "config", env = "RUNSTATE_CONFIG")]
    config: Vec<PathBuf>,

    /// Folder receiving statistics.json.
    #[arg(short = 's', long = "statistics-dir")]
    statistics_dir: Option<PathBuf>,

    /// Collect failures and list them in the summary.
    #[arg(long = "collect-failures")]
    collect_failures: bool,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Directory to save the run summary.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Run summary format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

/// Log at `info`, or `debug` with `--verbose`; `RUST_LOG` overrides both.
/// Verbose output carries thread ids since stories of a batch run in
/// parallel.
fn init_tracing(verbose: bool) {
    let level = if verbose { "runstate=debug" } else { "runstate=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(verbose)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_properties(paths: &[PathBuf]) -> Result<Properties> {
    let mut loader = ConfigurationLoader::new();
    for path in paths {
        if !path.exists() {
            return Err(anyhow!("Path does not exist: {}", path.display()));
        }
        loader.add_path(path);
    }
    let properties = loader.load_all()?;
    let published = properties.apply_system_properties();
    if published > 0 {
        info!("Published {} system propert(ies)", published);
    }
    Ok(properties)
}

fn run_configuration(args: &Cli, properties: &Properties) -> Result<RunConfiguration> {
    let mut config = RunConfiguration::from_properties(properties)?;
    if let Some(dir) = &args.statistics_dir {
        config.statistics_folder = dir.clone();
    }
    if args.collect_failures {
        config.collect_failures = true;
    }
    Ok(config)
}

fn save_summary(summary: &RunSummary, report_dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let sanitized_name = summary.name.replace([' ', '/'], "_");
    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{sanitized_name}-summary.json"),
            serde_json::to_string_pretty(summary)?,
        ),
        ReportFormat::Yaml => (
            format!("{sanitized_name}-summary.yaml"),
            serde_yaml::to_string(summary)?,
        ),
        ReportFormat::Text => {
            let mut content = String::new();
            content.push_str(&format!("Run: {}\n", summary.name));
            content.push_str(&format!(
                "Status: {}\n",
                summary
                    .status
                    .map_or_else(|| "NO OUTCOME".to_string(), |s| s.to_string())
            ));
            content.push_str(&format!("Exit code: {}\n", summary.exit_code.code()));
            content.push_str(&format!("Duration: {} ms\n\n", summary.duration_ms));
            content.push_str("Stories:\n");
            for story in &summary.stories {
                content.push_str(&format!(
                    "  [{}] {} ({})\n",
                    story.batch,
                    story.title,
                    story.status.map_or_else(|| "-".to_string(), |s| s.to_string())
                ));
            }
            if let Some(failures) = &summary.failures {
                content.push_str("\nFailures:\n");
                for failure in failures {
                    content.push_str(&format!("  {failure}\n"));
                }
            }
            (format!("{sanitized_name}-summary.txt"), content)
        }
    };

    let file_path = report_dir.join(filename);
    fs::write(&file_path, content)
        .context(format!("Failed to write {}", file_path.display()))?;
    Ok(file_path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let properties = load_properties(&args.config)?;
    let config = run_configuration(&args, &properties)?;
    let plan = RunPlan::load(&args.plan)
        .context(format!("Failed to load plan: {}", args.plan.display()))?;

    let runner = DefaultPlanRunner::with_configuration(properties, config);
    let summary = runner.run(&plan).await?;

    if let Some(dir) = &args.report_dir {
        match save_summary(&summary, dir, args.report_format) {
            Ok(path) => info!("Summary saved: {}", path.display()),
            Err(e) => error!("Failed to save summary: {}", e),
        }
    }

    exit(summary.exit_code.code());
}
