use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::PipelineError;
use crate::vectorize::Mode;

pub const CONFIG_FILE_NAME: &str = "vichange.yml";

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub embedding: EmbeddingConfig,
    pub dictionary: DictionaryConfig,
    pub scores: ScoreConfig,
    pub dataset: DatasetConfig,
    pub vectorize: VectorizeConfig,
    pub metrics: MetricsConfig,
    pub hyper: HyperConfig,
    /// File the config was read from; `None` when running on defaults.
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingConfig {
    pub model_path: Option<PathBuf>,
    pub dictionary_path: Option<PathBuf>,
    pub dimension: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DictionaryConfig {
    pub no_below_percent: f64,
    pub no_above_percent: f64,
    pub keep_n: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreConfig {
    pub threshold: f64,
    pub match_basename: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetConfig {
    pub seed: u64,
    pub shuffle: bool,
    pub p_n_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorizeConfig {
    pub mode: Mode,
    pub max_root_paths: usize,
    pub parallel: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub result_pattern: String,
    pub timeout_secs: u64,
}

pub type SearchSpace = BTreeMap<String, BTreeMap<String, Vec<serde_yaml::Value>>>;

#[derive(Debug, Clone, PartialEq)]
pub struct HyperConfig {
    pub models: Vec<String>,
    pub search_space: SearchSpace,
    pub search_space_path: Option<PathBuf>,
    pub n_candidates: usize,
    pub seed: u64,
    pub shared_params: BTreeMap<String, serde_yaml::Value>,
    pub classifier_command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        // An empty document goes through the same path as a real file so the
        // defaults live in one place.
        let raw = RawConfig::default();
        raw.into_config(None, None)
            .unwrap_or_else(|_| unreachable!("built-in defaults are valid"))
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Yaml(serde_yaml::Error),
    Missing(PathBuf),
    InvalidMode(String),
    InvalidValue { field: &'static str, reason: String },
    MissingField(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(path, err) => write!(f, "{}: {err}", path.display()),
            Self::Yaml(err) => write!(f, "{err}"),
            Self::Missing(path) => write!(f, "config file `{}` not found", path.display()),
            Self::InvalidMode(value) => {
                write!(f, "unknown vectorize mode `{value}` (expected simple|changetree)")
            }
            Self::InvalidValue { field, reason } => write!(f, "invalid `{field}`: {reason}"),
            Self::MissingField(field) => write!(f, "required field `{field}` is not set"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_yaml::Error> for ConfigError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Yaml(value)
    }
}

impl From<ConfigError> for PipelineError {
    fn from(value: ConfigError) -> Self {
        PipelineError::Config(value.to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    embedding: RawEmbedding,
    #[serde(default)]
    dictionary: RawDictionary,
    #[serde(default)]
    scores: RawScores,
    #[serde(default)]
    dataset: RawDataset,
    #[serde(default)]
    vectorize: RawVectorize,
    #[serde(default)]
    metrics: RawMetrics,
    #[serde(default)]
    hyper: RawHyper,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEmbedding {
    model_path: Option<PathBuf>,
    dictionary_path: Option<PathBuf>,
    dimension: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDictionary {
    no_below_percent: Option<f64>,
    no_above_percent: Option<f64>,
    keep_n: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScores {
    threshold: Option<f64>,
    match_basename: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDataset {
    seed: Option<u64>,
    shuffle: Option<bool>,
    p_n_ratio: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVectorize {
    mode: Option<String>,
    max_root_paths: Option<usize>,
    parallel: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMetrics {
    #[serde(default)]
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    input_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    result_pattern: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHyper {
    #[serde(default)]
    models: Vec<String>,
    #[serde(default)]
    search_space: SearchSpace,
    search_space_path: Option<PathBuf>,
    n_candidates: Option<usize>,
    seed: Option<u64>,
    #[serde(default)]
    shared_params: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    classifier_command: Vec<String>,
    timeout_secs: Option<u64>,
}

impl RawConfig {
    fn into_config(
        self,
        base_dir: Option<&Path>,
        source: Option<PathBuf>,
    ) -> Result<PipelineConfig, ConfigError> {
        let resolve = |path: PathBuf| match base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        };

        let embedding = EmbeddingConfig {
            model_path: self.embedding.model_path.map(resolve),
            dictionary_path: self.embedding.dictionary_path.map(resolve),
            dimension: self.embedding.dimension.unwrap_or(100),
        };
        if embedding.dimension == 0 {
            return Err(invalid("embedding.dimension", "must be greater than zero"));
        }

        let dictionary = DictionaryConfig {
            no_below_percent: self.dictionary.no_below_percent.unwrap_or(0.01),
            no_above_percent: self.dictionary.no_above_percent.unwrap_or(1.0),
            keep_n: self.dictionary.keep_n.unwrap_or(500),
        };
        check_fraction("dictionary.no_below_percent", dictionary.no_below_percent, true)?;
        check_fraction("dictionary.no_above_percent", dictionary.no_above_percent, false)?;

        let scores = ScoreConfig {
            threshold: self.scores.threshold.unwrap_or(0.0),
            match_basename: self.scores.match_basename.unwrap_or(false),
        };
        if !scores.threshold.is_finite() {
            return Err(invalid("scores.threshold", "must be a finite number"));
        }

        let dataset = DatasetConfig {
            seed: self.dataset.seed.unwrap_or(1234),
            shuffle: self.dataset.shuffle.unwrap_or(true),
            p_n_ratio: self.dataset.p_n_ratio,
        };
        if let Some(ratio) = dataset.p_n_ratio {
            check_fraction("dataset.p_n_ratio", ratio, false)?;
        }

        let mode = match self.vectorize.mode.as_deref() {
            None => Mode::Simple,
            Some(raw) => raw
                .parse::<Mode>()
                .map_err(|_| ConfigError::InvalidMode(raw.to_string()))?,
        };
        let vectorize = VectorizeConfig {
            mode,
            max_root_paths: self.vectorize.max_root_paths.unwrap_or(1000),
            parallel: self.vectorize.parallel.unwrap_or(true),
        };
        if vectorize.max_root_paths == 0 {
            return Err(invalid("vectorize.max_root_paths", "must be greater than zero"));
        }

        let metrics = MetricsConfig {
            command: self.metrics.command,
            working_dir: self.metrics.working_dir.map(resolve),
            input_dir: resolve(
                self.metrics
                    .input_dir
                    .unwrap_or_else(|| PathBuf::from("metrics/input")),
            ),
            output_dir: resolve(
                self.metrics
                    .output_dir
                    .unwrap_or_else(|| PathBuf::from("metrics/results")),
            ),
            result_pattern: self
                .metrics
                .result_pattern
                .unwrap_or_else(|| "*-Method.csv".to_string()),
            timeout_secs: self.metrics.timeout_secs.unwrap_or(600),
        };
        if metrics.timeout_secs == 0 {
            return Err(invalid("metrics.timeout_secs", "must be greater than zero"));
        }
        glob::Pattern::new(&metrics.result_pattern)
            .map_err(|err| invalid("metrics.result_pattern", err.msg))?;

        let hyper = HyperConfig {
            models: self.hyper.models,
            search_space: self.hyper.search_space,
            search_space_path: self.hyper.search_space_path.map(resolve),
            n_candidates: self.hyper.n_candidates.unwrap_or(10),
            seed: self.hyper.seed.unwrap_or(1337),
            shared_params: self.hyper.shared_params,
            classifier_command: self.hyper.classifier_command,
            timeout_secs: self.hyper.timeout_secs.unwrap_or(3600),
        };
        if hyper.n_candidates == 0 {
            return Err(invalid("hyper.n_candidates", "must be greater than zero"));
        }
        if hyper.timeout_secs == 0 {
            return Err(invalid("hyper.timeout_secs", "must be greater than zero"));
        }

        Ok(PipelineConfig {
            embedding,
            dictionary,
            scores,
            dataset,
            vectorize,
            metrics,
            hyper,
            source,
        })
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

fn check_fraction(field: &'static str, value: f64, allow_zero: bool) -> Result<(), ConfigError> {
    let lower_ok = if allow_zero { value >= 0.0 } else { value > 0.0 };
    if !value.is_finite() || !lower_ok || value > 1.0 {
        let range = if allow_zero { "[0, 1]" } else { "(0, 1]" };
        return Err(invalid(field, format!("{value} is outside {range}")));
    }
    Ok(())
}

impl MetricsConfig {
    pub fn require_command(&self) -> Result<&[String], ConfigError> {
        if self.command.is_empty() {
            return Err(ConfigError::MissingField("metrics.command"));
        }
        Ok(&self.command)
    }
}

impl HyperConfig {
    pub fn require_classifier_command(&self) -> Result<&[String], ConfigError> {
        if self.classifier_command.is_empty() {
            return Err(ConfigError::MissingField("hyper.classifier_command"));
        }
        Ok(&self.classifier_command)
    }

    /// The inline space, or the space file when one is configured.
    pub fn resolved_search_space(&self) -> Result<SearchSpace, ConfigError> {
        match &self.search_space_path {
            Some(path) => {
                let content =
                    fs::read_to_string(path).map_err(|err| ConfigError::Io(path.clone(), err))?;
                Ok(serde_yaml::from_str(&content)?)
            }
            None => Ok(self.search_space.clone()),
        }
    }
}

/// Resolves the config for a run: an explicit path must exist, otherwise the
/// nearest `vichange.yml` above `cwd` is used, otherwise the defaults.
pub fn load_pipeline_config(
    cwd: &Path,
    explicit: Option<&Path>,
) -> Result<PipelineConfig, ConfigError> {
    if let Some(path) = explicit {
        let path = if path.is_relative() {
            cwd.join(path)
        } else {
            path.to_path_buf()
        };
        if !path.is_file() {
            return Err(ConfigError::Missing(path));
        }
        return load_config_file(&path);
    }

    match find_nearest_config(cwd) {
        Some(path) => load_config_file(&path),
        None => Ok(PipelineConfig::default()),
    }
}

pub fn find_nearest_config(start: &Path) -> Option<PathBuf> {
    for dir in start.ancestors() {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

pub fn load_config_file(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;
    parse_config(&content, path.parent(), Some(path.to_path_buf()))
}

fn parse_config(
    content: &str,
    base_dir: Option<&Path>,
    source: Option<PathBuf>,
) -> Result<PipelineConfig, ConfigError> {
    let raw: RawConfig = if content.trim().is_empty() {
        RawConfig::default()
    } else {
        serde_yaml::from_str(content)?
    };
    raw.into_config(base_dir, source)
}

pub fn default_config_yaml() -> String {
    r#"embedding:
  dimension: 100
dictionary:
  no_below_percent: 0.01
  no_above_percent: 1.0
  keep_n: 500
scores:
  threshold: 0.0
dataset:
  seed: 1234
  shuffle: true
vectorize:
  mode: simple
  max_root_paths: 1000
metrics:
  command: ["./sm_analyzer.sh", "-projectBaseDir={input}", "-resultsDir={output}"]
  input_dir: metrics/input
  output_dir: metrics/results
  timeout_secs: 600
hyper:
  models: [forest]
  search_space:
    forest:
      n_estimators: [50, 100, 200]
      max_depth: [5, 7, 10]
  n_candidates: 10
  seed: 1337
"#
    .to_string()
}
