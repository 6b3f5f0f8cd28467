//! # CLI Module
//!
//! Command-line interface for the chain runner.
//!
//! ## Usage
//! ```bash
//! # Run the chain described by a config file
//! run-chain run chain.toml
//!
//! # One month of files, across worker processes
//! run-chain run chain.toml --year 2020 --month 1 -m
//!
//! # A single file, stopping at the first failure
//! run-chain run chain.toml --file CS_LTA__SIR_SIN_1B_20200101T000000_20200101T000500_E001.json --stop-on-error
//!
//! # Registered stages and their context keys
//! run-chain stages
//! ```

use altimetry_chain::config::RunConfig;
use altimetry_chain::core::finder::{FileList, FileSelector, L1bFinder};
use altimetry_chain::core::pipeline::{worker, ChainResult, FileState, Orchestrator};
use altimetry_chain::core::stage::StageRegistry;
use altimetry_chain::error::Result;
use altimetry_chain::events::{ChainEvent, Event, EventChannel, FileEvent};
use altimetry_chain::init_tracing;
use clap::{Parser, Subcommand, ValueEnum};
use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

/// Altimetry chain runner - run processing stages over L1b files
#[derive(Parser, Debug)]
#[command(name = "run-chain")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a chain over a set of input files
    Run(RunArgs),

    /// List registered stages with the context keys they read and write
    Stages {
        /// Output format
        #[arg(short, long, default_value = "pretty")]
        output: OutputFormat,
    },

    /// Worker process entry point (started by `run -m`)
    #[command(hide = true)]
    Worker,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Chain config file (.toml or .json); defaults to the user config dir
    config: Option<PathBuf>,

    /// Replace the configured stage list (comma separated)
    #[arg(long, value_delimiter = ',')]
    stages: Option<Vec<String>>,

    /// Process this single file
    #[arg(short, long, conflicts_with = "dir")]
    file: Option<PathBuf>,

    /// Process the files directly inside this directory
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Only files acquired in these years
    #[arg(short, long)]
    year: Vec<i32>,

    /// Only files acquired in these months (1-12)
    #[arg(long)]
    month: Vec<u32>,

    /// Process at most this many files
    #[arg(long)]
    max_files: Option<usize>,

    /// Distribute files across worker processes
    #[arg(short = 'm', long, conflicts_with = "sequential")]
    multiprocessing: bool,

    /// Process files one at a time in this process
    #[arg(short, long)]
    sequential: bool,

    /// Upper bound on worker processes
    #[arg(long)]
    max_processes: Option<usize>,

    /// Stop dispatching files after the first failure
    #[arg(long)]
    stop_on_error: bool,

    /// Directory for per-worker logs (merged after the run)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(long, conflicts_with = "quiet")]
    debug: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Output format
    #[arg(short, long, default_value = "pretty")]
    output: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable output with colors
    Pretty,
    /// JSON output for scripting
    Json,
}

/// Run the CLI
pub fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_chain(args),
        Commands::Stages { output } => list_stages(output),
        Commands::Worker => run_worker(),
    }
}

fn run_chain(args: RunArgs) -> Result<ExitCode> {
    let term = Term::stderr();
    let config_path = args.config.clone().unwrap_or_else(RunConfig::default_path);
    let mut config = RunConfig::load(&config_path)?;
    apply_overrides(&mut config, &args)?;
    init_tracing(&config.logging, term.is_term())?;

    let selector: Box<dyn FileSelector> = match &args.file {
        Some(file) => Box::new(FileList::new(vec![file.clone()])),
        None => Box::new(L1bFinder::from_settings(&config.finder)?),
    };
    let orchestrator = Orchestrator::builder(config).build()?;

    if matches!(args.output, OutputFormat::Pretty) {
        let stages: Vec<String> = orchestrator
            .stages()
            .into_iter()
            .map(|s| format!("{}:{}", s.index, s.name))
            .collect();
        term.write_line(&format!(
            "{} {}",
            style(format!("Chain {}", orchestrator.config().chain.name)).bold().cyan(),
            style(stages.join(" → ")).dim()
        ))
        .ok();
    }

    let files = orchestrator.select_files(selector.as_ref())?;
    if files.is_empty() {
        term.write_line(&format!("{} No input files matched", style("!").yellow().bold()))
            .ok();
    }

    let (sender, receiver) = EventChannel::new();

    let progress = if matches!(args.output, OutputFormat::Pretty) && !args.quiet {
        let pb = ProgressBar::new(files.len() as u64);
        if let Ok(bar_style) =
            ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(bar_style.progress_chars("█▓░"));
        }
        Some(pb)
    } else {
        None
    };

    let progress_clone = progress.clone();
    let event_thread = thread::spawn(move || {
        for event in receiver.iter() {
            let Some(pb) = progress_clone.as_ref() else {
                continue;
            };
            match event {
                Event::Chain(ChainEvent::Started { workers, .. }) if workers > 0 => {
                    pb.set_message(format!("{workers} workers"));
                }
                Event::File(FileEvent::Finished(p)) => {
                    pb.set_position(p.completed as u64);
                    if p.state.is_error() {
                        pb.println(format!(
                            "{} [f{}] {}",
                            style("✗").red(),
                            p.index,
                            p.state
                        ));
                    }
                }
                Event::Chain(ChainEvent::StopRequested { index }) => {
                    pb.set_message(format!("stopping after file {index}"));
                }
                Event::Chain(ChainEvent::Completed { .. }) => pb.finish_and_clear(),
                _ => {}
            }
        }
    });

    let result = orchestrator.run_with_events(files, &sender);
    drop(sender);
    event_thread.join().ok();
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    let result = result?;

    match args.output {
        OutputFormat::Pretty => print_pretty_results(&term, &result),
        OutputFormat::Json => print_json_results(&result),
    }

    Ok(if result.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Fold command-line flags into the loaded config
fn apply_overrides(config: &mut RunConfig, args: &RunArgs) -> Result<()> {
    if let Some(stages) = &args.stages {
        config.chain.stages = stages.clone();
    }
    if let Some(dir) = &args.dir {
        config.finder.base_dir = Some(dir.clone());
        config.finder.flat = true;
    }
    if !args.year.is_empty() {
        config.finder.years = args.year.clone();
    }
    if !args.month.is_empty() {
        config.finder.months = args.month.clone();
    }
    if args.max_files.is_some() {
        config.finder.max_files = args.max_files;
    }
    if args.multiprocessing {
        config.chain.use_multi_processing = true;
    }
    if args.sequential {
        config.chain.use_multi_processing = false;
    }
    if args.max_processes.is_some() {
        config.chain.max_processes = args.max_processes;
    }
    if args.stop_on_error {
        config.chain.stop_on_error = true;
    }
    if args.log_dir.is_some() {
        config.logging.dir = args.log_dir.clone();
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    }
    if args.quiet {
        config.logging.quiet = true;
    }
    config.validate()?;
    Ok(())
}

fn list_stages(output: OutputFormat) -> Result<ExitCode> {
    let stages = StageRegistry::global().describe();
    match output {
        OutputFormat::Json => match serde_json::to_string_pretty(&stages) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Failed to serialize stages: {e}"),
        },
        OutputFormat::Pretty => {
            for stage in &stages {
                println!("{}", style(&stage.name).bold());
                if !stage.requires.is_empty() {
                    println!("    {} {}", style("reads ").dim(), stage.requires.join(", "));
                }
                if !stage.produces.is_empty() {
                    println!("    {} {}", style("writes").dim(), stage.produces.join(", "));
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_worker() -> Result<ExitCode> {
    let mut input = BufReader::new(std::io::stdin());
    let job = worker::read_job(&mut input)?;
    init_tracing(&job.config.logging, false)?;
    worker::serve_job(job, input, std::io::stdout().lock(), StageRegistry::global())?;
    Ok(ExitCode::SUCCESS)
}

fn print_pretty_results(term: &Term, result: &ChainResult) {
    term.write_line("").ok();
    let headline = if result.success() {
        format!("{} Chain complete", style("✓").green().bold())
    } else if result.stopped_on_error {
        format!("{} Chain stopped on error", style("✗").red().bold())
    } else {
        format!("{} Chain finished with errors", style("✗").red().bold())
    };
    term.write_line(&headline).ok();
    term.write_line("").ok();

    term.write_line(&format!(
        "  {} of {} files processed in {:.1}s",
        style(result.files_processed).cyan(),
        result.files_total,
        result.duration_ms as f64 / 1000.0
    ))
    .ok();
    term.write_line(&format!("  {} skipped", style(result.files_skipped).yellow()))
        .ok();
    term.write_line(&format!("  {} errors", style(result.errors).red())).ok();
    if result.files_lost > 0 {
        term.write_line(&format!(
            "  {} lost with crashed workers",
            style(result.files_lost).red()
        ))
        .ok();
    }

    let failures: Vec<_> = result
        .reports_by_index()
        .into_iter()
        .filter(|r| matches!(r.state, FileState::Failed { .. } | FileState::Lost { .. }))
        .collect();
    if !failures.is_empty() {
        term.write_line("").ok();
        term.write_line(&format!("{}", style("Failed files:").bold().underlined()))
            .ok();
        for report in failures {
            term.write_line(&format!(
                "  [f{}] {} {}",
                report.index,
                report.path.display(),
                style(&report.state).dim()
            ))
            .ok();
        }
    }

    term.write_line("").ok();
    term.write_line(&format!("{}", style("Stage timings:").bold())).ok();
    for timing in &result.stage_timings {
        term.write_line(&format!(
            "  {:<20} {:>6} files {:>10.3}s total {:>8.1}ms mean",
            timing.name,
            timing.calls,
            timing.total().as_secs_f64(),
            timing.mean().as_secs_f64() * 1000.0
        ))
        .ok();
    }
}

fn print_json_results(result: &ChainResult) {
    match serde_json::to_string_pretty(&result.summary()) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Failed to serialize summary: {e}"),
    }
}
