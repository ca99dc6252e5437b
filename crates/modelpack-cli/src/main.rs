//! convert-models - batch converter for a modelpack registry.
//!
//! Converts the named registry entries (or all of them) into packages under
//! the output directory and prints one line per entry.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use modelpack_core::config::{default_cache_dir, PathsConfig};
use modelpack_core::{BatchOrchestrator, Registry, RunOptions, RunReport};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "convert-models")]
#[command(about = "Convert pretrained encoder models into on-device packages")]
struct Args {
    /// Registry entries to convert (default: all, in registry order)
    names: Vec<String>,

    /// List registry entries and exit
    #[arg(long)]
    list: bool,

    /// Registry file
    #[arg(long, default_value = PathsConfig::REGISTRY_FILE_NAME)]
    registry: PathBuf,

    /// Directory receiving one package per entry
    #[arg(long, default_value = PathsConfig::OUTPUT_DIR_NAME)]
    output_dir: PathBuf,

    /// Hub snapshot cache (defaults to the user cache directory)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Only use local sources and cached snapshots
    #[arg(long)]
    offline: bool,

    /// Load every written package and run a probe input through it
    #[arg(long)]
    verify: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

const EXIT_SETUP_FAILED: u8 = 1;
const EXIT_ENTRY_FAILED: u8 = 2;

fn main() -> ExitCode {
    let args = Args::parse();

    // Logs go to stderr so the report on stdout stays machine-readable.
    let default_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            return ExitCode::from(EXIT_SETUP_FAILED);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_SETUP_FAILED)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let registry = Registry::load(&args.registry)
        .with_context(|| format!("loading registry {}", args.registry.display()))?;

    if args.list {
        print_listing(&registry);
        return Ok(ExitCode::SUCCESS);
    }

    let mut options = RunOptions::new(&args.output_dir);
    options.cache_dir = args.cache_dir.unwrap_or_else(default_cache_dir);
    options.offline |= args.offline;
    options.verify = args.verify;
    info!(
        "Registry {} ({} entries), output {}",
        args.registry.display(),
        registry.len(),
        options.output_dir.display()
    );

    let mut orchestrator = BatchOrchestrator::new(registry, &options)
        .context("preparing conversion run")?;
    let report = orchestrator.run(&args.names).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(if report.all_converted() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_ENTRY_FAILED)
    })
}

fn print_listing(registry: &Registry) {
    for name in registry.names() {
        match registry.spec(name) {
            Ok(spec) => {
                let bits = spec
                    .quantize_bits
                    .map(|b| format!(", {b}-bit"))
                    .unwrap_or_default();
                println!("{name}: {} ({}{bits}) -> {}", spec.source, spec.kind, spec.output_name);
            }
            Err(e) => println!("{name}: invalid ({e})"),
        }
    }
}

fn print_report(report: &RunReport) {
    for result in &report.results {
        println!("{result}");
    }
    let elapsed = report.finished_at - report.started_at;
    println!(
        "{} converted, {} failed in {:.1}s",
        report.converted(),
        report.failed(),
        elapsed.num_milliseconds() as f64 / 1000.0
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["convert-models"]);
        assert!(args.names.is_empty());
        assert_eq!(args.registry, PathBuf::from("models.yaml"));
        assert_eq!(args.output_dir, PathBuf::from("output"));
        assert!(!args.list && !args.verify && !args.json);
    }

    #[test]
    fn test_names_and_flags() {
        let args = Args::parse_from([
            "convert-models",
            "sentiment",
            "embed",
            "--offline",
            "--json",
            "--output-dir",
            "dist",
        ]);
        assert_eq!(args.names, vec!["sentiment", "embed"]);
        assert!(args.offline && args.json);
        assert_eq!(args.output_dir, PathBuf::from("dist"));
    }

    #[test]
    fn test_missing_registry_is_setup_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let args = Args::parse_from([
            "convert-models".to_string(),
            "--registry".to_string(),
            temp.path().join("absent.yaml").to_string_lossy().into_owned(),
        ]);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        assert!(runtime.block_on(run(args)).is_err());
    }
}
