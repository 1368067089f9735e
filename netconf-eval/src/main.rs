//! NetConfEval benchmark CLI

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use netconf_eval::{
    analysis::{code_check::PYTHON_DRIVER, CommandEmulator, ComparisonEngine, EquivalenceChecker, ProcessRunner},
    config::{Config, EvaluationConfig},
    policy::PolicyFilter,
    providers::create_clients,
    reporting::{load_dir, print_console_report, JsonSummary, JsonlResultStore, ResultStore},
    runner::{ConsoleProgress, Executor, ExecutorConfig},
    tasks::{
        load_requirements_from_file, load_scenarios_from_file, loader::load_documents, prompts::RagContext,
        synthetic_requirements, CodeGenerator, ConfigGenerator, ConflictGenerator, Experiment, RagMode,
        Requirement, TaskGenerator, TranslationGenerator,
    },
};

/// Hosts in the generated dataset when no requirement file is given
const SYNTHETIC_HOSTS: usize = 8;

#[derive(Parser)]
#[command(name = "netconf-eval")]
#[command(about = "Benchmark LLMs on network configuration tasks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one experiment against one or more models
    Run(RunArgs),

    /// Replay stored results into metrics and a model ranking
    Summarize {
        /// Results directory written by `run`
        #[arg(short, long)]
        input: PathBuf,

        /// Also write the JSON summary here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List configured models
    ListModels,

    /// Generate sample configuration
    InitConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config/models.toml")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// translation, conflict, code or config
    #[arg(short, long)]
    experiment: Experiment,

    /// Model id from the configuration; repeat for several models
    #[arg(short, long = "model", required = true)]
    models: Vec<String>,

    /// Number of runs per instance
    #[arg(long)]
    runs: Option<u32>,

    /// Comma-separated batch sizes
    #[arg(long, value_delimiter = ',')]
    batch_size: Option<Vec<usize>>,

    /// Comma-separated policy types
    #[arg(long)]
    policy_types: Option<String>,

    /// Retries for transient model errors
    #[arg(long)]
    retries: Option<u32>,

    /// Instances in flight at once
    #[arg(long)]
    parallel: Option<usize>,

    /// Requirement dataset (JSON array or JSON lines)
    #[arg(long)]
    policies: Option<PathBuf>,

    /// Configuration scenarios for the config experiment
    #[arg(long)]
    scenarios: Option<PathBuf>,

    /// Output directory for results
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// How documentation is attached to config prompts
    #[arg(long, default_value = "off")]
    rag_mode: RagMode,

    /// Characters per documentation chunk
    #[arg(long, default_value = "2000")]
    rag_chunk_size: usize,

    /// Documentation file for config prompts
    #[arg(long)]
    docs: Option<PathBuf>,

    /// Score config answers against reference text instead of emulation
    #[arg(long)]
    text_reference: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("netconf_eval=debug,info")
    } else {
        EnvFilter::new("netconf_eval=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load_or_default(),
    };

    match cli.command {
        Commands::Run(args) => {
            run_benchmark(args, config, cli.verbose).await?;
        }

        Commands::Summarize { input, output } => {
            summarize(input, output)?;
        }

        Commands::ListModels => {
            list_models(&config);
        }

        Commands::InitConfig { output } => {
            init_config(output)?;
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, args: &RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let benchmark = &mut config.benchmark;
    if let Some(runs) = args.runs {
        benchmark.n_runs = runs;
    }
    if let Some(sizes) = &args.batch_size {
        benchmark.batch_sizes = sizes.clone();
    }
    if let Some(types) = &args.policy_types {
        benchmark.policy_types = types.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(retries) = args.retries {
        benchmark.retry_count = retries;
    }
    if let Some(parallel) = args.parallel {
        benchmark.parallel_requests = parallel;
    }
    if let Some(output) = &args.output {
        benchmark.results_dir = output.display().to_string();
    }
    config.validate()?;
    Ok(())
}

fn load_dataset(path: &Option<PathBuf>, filter: &PolicyFilter) -> Result<Vec<Requirement>, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let requirements = load_requirements_from_file(path)?;
            println!("Dataset: {} ({} requirements)", path.display(), requirements.len());
            Ok(requirements)
        }
        None => {
            let requirements = synthetic_requirements(filter, SYNTHETIC_HOSTS);
            println!("Dataset: synthetic ({} requirements)", requirements.len());
            Ok(requirements)
        }
    }
}

fn build_generator(args: &RunArgs, config: &Config) -> Result<Box<dyn TaskGenerator>, Box<dyn std::error::Error>> {
    let filter = config.benchmark.policy_filter()?;
    let batch_sizes = config.benchmark.batch_sizes.clone();

    let generator: Box<dyn TaskGenerator> = match args.experiment {
        Experiment::Translation => {
            let dataset = load_dataset(&args.policies, &filter)?;
            Box::new(TranslationGenerator::new(dataset, filter, batch_sizes)?)
        }
        Experiment::Conflict => {
            let dataset = load_dataset(&args.policies, &filter)?;
            Box::new(ConflictGenerator::new(dataset, filter, batch_sizes)?)
        }
        Experiment::Code => Box::new(CodeGenerator::new(filter.iter())),
        Experiment::Config => {
            let path = args
                .scenarios
                .as_ref()
                .ok_or("the config experiment needs --scenarios")?;
            let scenarios = load_scenarios_from_file(path)?;

            let rag = match (args.rag_mode, &args.docs) {
                (RagMode::Off, _) => RagContext::off(),
                (mode, Some(docs)) => RagContext::new(mode, load_documents(docs)?, args.rag_chunk_size),
                (mode, None) => return Err(format!("--rag-mode {} needs --docs", mode.as_str()).into()),
            };

            Box::new(
                ConfigGenerator::new(scenarios)
                    .with_rag(rag)
                    .with_text_reference(args.text_reference),
            )
        }
    };
    Ok(generator)
}

fn build_checker(evaluation: &EvaluationConfig) -> EquivalenceChecker {
    let driver = evaluation
        .driver_suffix
        .clone()
        .unwrap_or_else(|| PYTHON_DRIVER.to_string());
    let runner = ProcessRunner::new(&evaluation.interpreter)
        .with_args(evaluation.interpreter_args.clone())
        .with_driver_suffix(driver);

    let mut checker = EquivalenceChecker::new(Arc::new(runner))
        .with_epsilon(evaluation.epsilon)
        .with_code_timeout(evaluation.code_timeout())
        .with_case_concurrency(evaluation.code_concurrency);

    if !evaluation.emulator_command.is_empty() {
        let emulator = CommandEmulator::new(evaluation.emulator_command.clone(), evaluation.emulator_timeout());
        checker = checker.with_emulator(Arc::new(emulator));
    }
    checker
}

async fn run_benchmark(args: RunArgs, mut config: Config, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let started_at = Utc::now();
    let run_id = started_at.format("%Y%m%d-%H%M%S").to_string();

    apply_overrides(&mut config, &args)?;

    println!("=== NetConfEval ===");
    println!("Run ID:     {}", run_id);
    println!("Experiment: {}", args.experiment);
    println!("Runs:       {}", config.benchmark.n_runs);
    if args.experiment.is_batched() {
        println!("Batches:    {:?}", config.benchmark.batch_sizes);
    }
    println!();

    let clients = create_clients(&args.models, &config)?;
    let model_ids: Vec<&str> = clients.iter().map(|c| c.model_id()).collect();
    println!("Models: {}", model_ids.join(", "));

    let generator = build_generator(&args, &config)?;
    let checker = build_checker(&config.evaluation);

    let results_dir = PathBuf::from(&config.benchmark.results_dir);
    let store = Arc::new(JsonlResultStore::open(&results_dir)?);

    let mut executor = Executor::new(ExecutorConfig::from_benchmark(&config.benchmark), checker, store.clone());
    if verbose {
        executor = executor.with_progress(Arc::new(ConsoleProgress));
    }

    println!("Running benchmark...");
    let report = executor
        .run(generator.as_ref(), &clients, config.benchmark.n_runs)
        .await?;

    for abort in &report.aborted {
        eprintln!(
            "Aborted {} on {}: {} ({} instances not dispatched)",
            abort.experiment, abort.model_id, abort.reason, abort.skipped_instances
        );
    }

    // the store also holds earlier sessions when resuming
    let stored = store.load().await?;
    let aggregated = ComparisonEngine::new().aggregate(&stored);
    print_console_report(&aggregated);

    println!(
        "Session: {} trials, accuracy {:.3}, parse failures {:.3}",
        report.metrics.total(),
        report.metrics.accuracy,
        report.metrics.parse_failure_rate
    );

    let summary = JsonSummary::from_aggregated(&run_id, &aggregated, results_dir.display().to_string());
    let summary_path = results_dir.join(format!("summary-{}.json", run_id));
    summary.write_to_file(&summary_path)?;
    println!("Summary written to: {}", summary_path.display());

    Ok(())
}

fn summarize(input: PathBuf, output: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    println!("Summarizing results from: {}", input.display());
    let results = load_dir(&input)?;
    if results.is_empty() {
        eprintln!("Error: No results under {}", input.display());
        std::process::exit(1);
    }

    let aggregated = ComparisonEngine::new().aggregate(&results);
    print_console_report(&aggregated);

    if let Some(output) = output {
        let run_id = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        JsonSummary::from_aggregated(run_id, &aggregated, input.display().to_string()).write_to_file(&output)?;
        println!("Summary written to: {}", output.display());
    }
    Ok(())
}

fn list_models(config: &Config) {
    println!("Configured Models ({}):", config.models.len());
    println!("{:-<60}", "");

    for (id, model) in &config.models {
        println!(
            "  {} | {} | {}{}",
            id,
            model.provider(),
            model.model_name(),
            if model.native_function_calling() { " | function calling" } else { "" }
        );
    }
}

fn init_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    config.save_toml(&output)?;
    println!("Configuration written to: {}", output.display());
    Ok(())
}
