//! Hyperparameter search over an external classifier.
//!
//! Candidates come from a per-model grid. Small grids are enumerated in
//! full; larger ones are sampled with a fixed seed, so a rerun evaluates the
//! same candidates in the same order.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::config::{HyperConfig, SearchSpace};
use crate::error::{PipelineError, Result};
use crate::external::{run_tool, substitute};
use crate::report::StageReport;
use crate::store::atomic_write;
use crate::vectorize::load_meta;

pub type Params = BTreeMap<String, serde_yaml::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub fmes: f64,
    pub precision: f64,
    pub recall: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    pub model: String,
    pub params: Params,
    pub scores: Scores,
}

pub trait Classifier {
    /// Cross-validates `model` with `params` on the vectorized `input`.
    fn evaluate(&self, model: &str, params: &Params, input: &Path) -> Result<Scores>;
}

pub struct SubprocessClassifier {
    command: Vec<String>,
    shared_params: Params,
    timeout: Duration,
}

impl SubprocessClassifier {
    pub fn from_config(config: &HyperConfig) -> Result<Self> {
        Ok(Self {
            command: config.require_classifier_command()?.to_vec(),
            shared_params: config.shared_params.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    fn tool(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("classifier")
    }
}

impl Classifier for SubprocessClassifier {
    fn evaluate(&self, model: &str, params: &Params, input: &Path) -> Result<Scores> {
        let mut merged = self.shared_params.clone();
        merged.extend(params.iter().map(|(key, value)| (key.clone(), value.clone())));
        let params_json = serde_json::to_string(&merged)
            .map_err(|err| PipelineError::external_tool(self.tool(), err.to_string()))?;
        let input = input.to_string_lossy();

        let command = substitute(
            &self.command,
            &[
                ("input", input.as_ref()),
                ("model", model),
                ("params", params_json.as_str()),
            ],
        );
        let output = run_tool(&command, None, self.timeout)?;
        serde_json::from_slice(&output.stdout).map_err(|err| {
            PipelineError::external_tool(
                self.tool(),
                format!(
                    "expected {{\"fmes\",\"precision\",\"recall\"}} on stdout: {err} (got `{}`)",
                    String::from_utf8_lossy(&output.stdout).trim()
                ),
            )
        })
    }
}

/// Decodes `index` as a mixed-radix number over the grid; the last
/// parameter varies fastest.
fn decode(space: &BTreeMap<String, Vec<serde_yaml::Value>>, mut index: usize) -> Params {
    let mut params = Params::new();
    for (name, values) in space.iter().rev() {
        params.insert(name.clone(), values[index % values.len()].clone());
        index /= values.len();
    }
    params
}

/// Candidate parameter sets for one model. A model without parameters has
/// exactly one, empty, candidate.
pub fn candidates(
    model: &str,
    space: &BTreeMap<String, Vec<serde_yaml::Value>>,
    n_candidates: usize,
    seed: u64,
) -> Result<Vec<Params>> {
    let mut total = 1usize;
    for (name, values) in space {
        if values.is_empty() {
            return Err(PipelineError::config(format!(
                "search space for {model}.{name} has no values"
            )));
        }
        total = total.checked_mul(values.len()).ok_or_else(|| {
            PipelineError::config(format!("search space for {model} is too large"))
        })?;
    }

    let indices = if total <= n_candidates {
        (0..total).collect::<Vec<_>>()
    } else {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut picked = rand::seq::index::sample(&mut rng, total, n_candidates).into_vec();
        picked.sort_unstable();
        picked
    };
    Ok(indices.into_iter().map(|index| decode(space, index)).collect())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    pub best_fmes: f64,
    pub best_precision: f64,
    pub best_recall: f64,
    pub best_params: Params,
    pub all_fmes: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<usize>,
    /// Feature width the classifier saw; twice `dimension` for a before/after pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_length: Option<usize>,
}

/// Highest f-measure wins; the earliest candidate wins ties.
pub fn best_of(results: &[EvaluationResult]) -> Option<&EvaluationResult> {
    let mut best: Option<&EvaluationResult> = None;
    for result in results {
        if best.is_none_or(|current| result.scores.fmes > current.scores.fmes) {
            best = Some(result);
        }
    }
    best
}

pub fn search_model(
    classifier: &dyn Classifier,
    model: &str,
    params: &[Params],
    input: &Path,
) -> Result<Vec<EvaluationResult>> {
    params
        .iter()
        .map(|candidate| {
            let scores = classifier.evaluate(model, candidate, input)?;
            log::debug!("search: {model} {candidate:?} -> fmes={:.4}", scores.fmes);
            Ok(EvaluationResult {
                model: model.to_string(),
                params: candidate.clone(),
                scores,
            })
        })
        .collect()
}

fn models_to_search(config: &HyperConfig, space: &SearchSpace) -> Result<Vec<String>> {
    let models = if config.models.is_empty() {
        space.keys().cloned().collect::<Vec<_>>()
    } else {
        config.models.clone()
    };
    if models.is_empty() {
        return Err(PipelineError::config(
            "hyper.models is empty and the search space names no models",
        ));
    }
    Ok(models)
}

pub fn run_search(
    input: &Path,
    output: &Path,
    classifier: &dyn Classifier,
    config: &HyperConfig,
) -> Result<StageReport> {
    let mut report = StageReport::new("search");
    if !input.is_file() {
        return Err(PipelineError::input_format(input, "vectorized dataset not found"));
    }
    let space = config.resolved_search_space()?;
    let models = models_to_search(config, &space)?;

    let layout = match load_meta(input)? {
        Some(meta) => Some((meta.dimension, meta.vector_length)),
        None => {
            report.warn(format!(
                "no vectorizer sidecar next to {}; dimension not recorded",
                input.display()
            ));
            None
        }
    };

    let empty = BTreeMap::new();
    let mut results = BTreeMap::new();
    for model in &models {
        let grid = space.get(model).unwrap_or(&empty);
        let params = candidates(model, grid, config.n_candidates, config.seed)?;
        let evaluations = search_model(classifier, model, &params, input)?;
        report.total += evaluations.len();

        let Some(best) = best_of(&evaluations) else {
            continue;
        };
        log::info!(
            "search: {model} best fmes={:.4} precision={:.4} recall={:.4} over {} candidates",
            best.scores.fmes,
            best.scores.precision,
            best.scores.recall,
            evaluations.len()
        );
        results.insert(
            model.clone(),
            ModelResult {
                best_fmes: best.scores.fmes,
                best_precision: best.scores.precision,
                best_recall: best.scores.recall,
                best_params: best.params.clone(),
                all_fmes: evaluations.iter().map(|result| result.scores.fmes).collect(),
                dimension: layout.map(|(dimension, _)| dimension),
                vector_length: layout.map(|(_, length)| length),
            },
        );
    }

    let yaml = serde_yaml::to_string(&results)
        .map_err(|err| PipelineError::Io(std::io::Error::other(err.to_string())))?;
    atomic_write(output, yaml.as_bytes())?;

    report.written = results.len();
    report.set("models", models);
    report.set("candidates", report.total);
    Ok(report)
}
