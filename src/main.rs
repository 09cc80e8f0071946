use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use vichange::config::{
    CONFIG_FILE_NAME, ConfigError, PipelineConfig, default_config_yaml, load_pipeline_config,
};
use vichange::dataset::assemble::{TestSplit, run_assemble};
use vichange::dataset::filter::run_filter;
use vichange::embed::dictionary::{run_dictionary, run_filter_corpus};
use vichange::error::PipelineError;
use vichange::metrics::{SubprocessMetricsTool, run_metrics};
use vichange::report::StageReport;
use vichange::search::{SubprocessClassifier, run_search};
use vichange::store::atomic_write;
use vichange::syntax::corpus::{DEFAULT_N_TARGET, run_flatten};
use vichange::vectorize::{Mode, VectorizeRun, load_dictionary, run_unchanged, run_vectorize};

#[derive(Debug)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<PipelineError> for CliError {
    fn from(value: PipelineError) -> Self {
        Self::new(value.code(), value.to_string())
    }
}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        PipelineError::from(value).into()
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::new("json_error", value.to_string())
    }
}

#[derive(Parser, Debug)]
#[command(name = "vichange")]
#[command(about = "Builds and evaluates datasets of vulnerability-introducing method changes")]
struct Cli {
    /// Config file; defaults to the nearest vichange.yml above the working directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a starter config file.
    Init(InitArgs),
    /// Flatten every method under a source tree into a token corpus.
    Flatten(FlattenArgs),
    /// Build a filtered token dictionary from a corpus.
    Dictionary(DictionaryArgs),
    /// Replace tokens missing from a dictionary with OOV_TOKEN.
    FilterCorpus(FilterCorpusArgs),
    /// Keep the method changes whose file has a relevant score.
    Filter(FilterArgs),
    /// Merge negative and positive pools into one labeled dataset.
    Assemble(AssembleArgs),
    /// Attach a feature vector to every labeled change.
    Vectorize(VectorizeArgs),
    /// List the changes whose flattenings are identical on both sides.
    Unchanged(UnchangedArgs),
    /// Append per-commit static-analysis metrics.
    Metrics(MetricsArgs),
    /// Search classifier hyperparameters on a vectorized dataset.
    Search(SearchArgs),
}

#[derive(Args, Debug)]
struct InitArgs {
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct FlattenArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[arg(long, default_value_t = DEFAULT_N_TARGET)]
    n_target: usize,
}

#[derive(Args, Debug)]
struct DictionaryArgs {
    #[arg(long)]
    corpus: PathBuf,
    #[arg(long)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct FilterCorpusArgs {
    #[arg(long)]
    corpus: PathBuf,
    #[arg(long)]
    dictionary: PathBuf,
    #[arg(long)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct FilterArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    scores: PathBuf,
    #[arg(long)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct AssembleArgs {
    #[arg(long)]
    negatives: PathBuf,
    #[arg(long)]
    positives: PathBuf,
    /// Train set when splitting, otherwise the whole dataset.
    #[arg(long)]
    output: PathBuf,
    /// Positives to sample into the train set; the rest go to --test-output.
    #[arg(long, requires = "test_output")]
    n_positives: Option<usize>,
    #[arg(long, requires = "n_positives")]
    test_output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct VectorizeArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    /// simple | changetree; overrides vectorize.mode.
    #[arg(long)]
    mode: Option<Mode>,
    #[arg(long)]
    ignore_methods: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct UnchangedArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct MetricsArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct SearchArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                }
            });
            eprintln!("{payload}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().map_err(|err| CliError::new("cwd_error", err.to_string()))?;
    if let Command::Init(args) = &cli.command {
        return cmd_init(&cwd, cli.config.as_deref(), args);
    }

    let config = load_pipeline_config(&cwd, cli.config.as_deref())?;
    match &config.source {
        Some(path) => log::info!("using config {}", path.display()),
        None => log::info!("no {CONFIG_FILE_NAME} found; using built-in defaults"),
    }

    let report = match cli.command {
        Command::Init(_) => return Ok(()),
        Command::Flatten(args) => run_flatten(&args.input, &args.output, args.n_target)?,
        Command::Dictionary(args) => run_dictionary(&args.corpus, &args.output, &config.dictionary)?,
        Command::FilterCorpus(args) => {
            run_filter_corpus(&args.corpus, &args.dictionary, &args.output)?
        }
        Command::Filter(args) => run_filter(&args.input, &args.scores, &args.output, &config.scores)?,
        Command::Assemble(args) => {
            let split = match (args.n_positives, args.test_output.as_deref()) {
                (Some(n_positives), Some(output)) => Some(TestSplit {
                    n_positives,
                    output,
                }),
                _ => None,
            };
            run_assemble(
                &args.negatives,
                &args.positives,
                &args.output,
                split.as_ref(),
                &config.dataset,
            )?
        }
        Command::Vectorize(args) => cmd_vectorize(&config, args)?,
        Command::Unchanged(args) => {
            let dictionary = load_dictionary(&config.embedding)?;
            run_unchanged(&args.input, &args.output, dictionary.as_ref())?
        }
        Command::Metrics(args) => {
            let tool = SubprocessMetricsTool::from_config(&config.metrics)?;
            run_metrics(&args.input, &args.output, &tool, &config.metrics)?
        }
        Command::Search(args) => {
            let classifier = SubprocessClassifier::from_config(&config.hyper)?;
            run_search(&args.input, &args.output, &classifier, &config.hyper)?
        }
    };
    finish_stage(&report)
}

fn cmd_init(cwd: &Path, explicit: Option<&Path>, args: &InitArgs) -> Result<(), CliError> {
    let path = match explicit {
        Some(path) if path.is_relative() => cwd.join(path),
        Some(path) => path.to_path_buf(),
        None => cwd.join(CONFIG_FILE_NAME),
    };
    if path.exists() && !args.force {
        return Err(CliError::new(
            "config_error",
            format!("{} already exists; pass --force to overwrite", path.display()),
        ));
    }
    atomic_write(&path, default_config_yaml().as_bytes()).map_err(PipelineError::from)?;
    print_json(&json!({
        "status": "ok",
        "config": path,
    }))
}

fn cmd_vectorize(config: &PipelineConfig, args: VectorizeArgs) -> Result<StageReport, CliError> {
    let run = VectorizeRun {
        input: &args.input,
        output: &args.output,
        mode: args.mode.unwrap_or(config.vectorize.mode),
        ignore_path: args.ignore_methods.as_deref(),
    };
    Ok(run_vectorize(&run, &config.embedding, &config.vectorize)?)
}

fn finish_stage(report: &StageReport) -> Result<(), CliError> {
    report.log_summary();
    print_json(&report.to_json())
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}
