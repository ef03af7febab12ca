use crate::{
    batch::{discover, Batch, SupportedExtensions},
    config::Config,
    engine::{soffice::SofficeEngine, ConversionRequest, Engine},
    util::ensure_dir,
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "office-batch")]
#[command(about = "Batch-convert Word/PowerPoint/Excel documents to PDF with headless LibreOffice")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./office-batch.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that the configured engine launches.
    Doctor {},
    /// List the files a batch run would convert.
    Scan {
        #[arg(long)]
        input_dir: Option<PathBuf>,
    },
    /// Convert a single document.
    Convert {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Seconds before the engine is killed.
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        timeout: Option<u64>,
    },
    /// Convert every supported document in the input directory.
    Run {
        #[arg(long)]
        input_dir: Option<PathBuf>,
        #[arg(long)]
        out_dir: Option<PathBuf>,
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        timeout: Option<u64>,
    },
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg = match load_config(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            // Install console logging so the caller's error! is not dropped.
            init_logging(&args, &Config::default(), None)?;
            return Err(err);
        }
    };
    let log_path = resolve_log_path(&cfg);
    let _guard = init_logging(&args, &cfg, log_path.as_deref())?;

    match &args.cmd {
        Command::Doctor {} => doctor(&cfg),
        Command::Scan { input_dir } => scan(&cfg, input_dir.as_deref()),
        Command::Convert {
            input,
            out_dir,
            timeout,
        } => convert(&cfg, input, out_dir.as_deref(), *timeout),
        Command::Run {
            input_dir,
            out_dir,
            timeout,
        } => run(&cfg, input_dir.as_deref(), out_dir.as_deref(), *timeout),
    }
}

fn load_config(user: Option<&Path>) -> Result<Config> {
    if let Some(p) = user {
        return Config::load(p);
    }
    let default = PathBuf::from("office-batch.toml");
    if default.exists() {
        Config::load(&default)
    } else {
        Ok(Config::default())
    }
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr; stdout carries the per-file result lines.
    let console_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }

    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }

    Some(PathBuf::from(&cfg.paths.output_dir).join("office-batch.log"))
}

fn timeout_for(cfg: &Config, user: Option<u64>) -> Duration {
    Duration::from_secs(user.unwrap_or(cfg.engine.timeout_seconds))
}

fn doctor(cfg: &Config) -> Result<()> {
    let engine = SofficeEngine::new(cfg);
    let diag = engine.doctor()?;
    println!("{}", serde_json::to_string_pretty(&diag)?);
    Ok(())
}

fn scan(cfg: &Config, input_dir: Option<&Path>) -> Result<()> {
    let input_dir = input_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&cfg.paths.input_dir));
    let exts = SupportedExtensions::new(&cfg.batch.extensions);
    let discovery = discover(&input_dir, &exts)?;
    println!("found {} file(s) to convert", discovery.files.len());
    for file in &discovery.files {
        println!("{}", file.display());
    }
    Ok(())
}

fn convert(cfg: &Config, input: &Path, out_override: Option<&Path>, timeout: Option<u64>) -> Result<()> {
    let out_dir = out_override
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&cfg.paths.output_dir));
    let engine = SofficeEngine::new(cfg);
    let req = ConversionRequest::new(input, &out_dir).with_timeout(timeout_for(cfg, timeout));
    match engine.convert(&req) {
        Ok(pdf) => {
            println!("{}: succeeded ({})", input.display(), pdf.display());
            Ok(())
        }
        Err(err) => {
            // Already logged by the engine.
            println!("{}: failed - {}", input.display(), err);
            Err(anyhow!("conversion failed: {}", input.display()))
        }
    }
}

fn run(
    cfg: &Config,
    in_override: Option<&Path>,
    out_override: Option<&Path>,
    timeout: Option<u64>,
) -> Result<()> {
    let input_dir = in_override
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&cfg.paths.input_dir));
    let out_dir = out_override
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&cfg.paths.output_dir));

    let engine = SofficeEngine::new(cfg);
    let exts = SupportedExtensions::new(&cfg.batch.extensions);
    let batch = Batch::new(&engine, exts, timeout_for(cfg, timeout));

    let discovery = batch.discover(&input_dir)?;
    if discovery.created {
        println!("input directory did not exist, created {}", input_dir.display());
    }
    println!("found {} file(s) to convert", discovery.files.len());

    let report = batch.convert_all(&input_dir, discovery, &out_dir, |outcome| {
        println!("{}", outcome.line())
    });
    info!(
        "batch finished found={} succeeded={} failed={}",
        report.found, report.succeeded, report.failed
    );

    if !cfg.batch.report_path.is_empty() {
        let path = Path::new(&cfg.batch.report_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_dir(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("writing report: {}", path.display()))?;
    }

    if cfg.batch.fail_on_error && report.has_failures() {
        return Err(anyhow!("{} of {} file(s) failed", report.failed, report.found));
    }
    Ok(())
}
