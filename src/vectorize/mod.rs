//! Turns labeled method changes into feature vectors.
//!
//! Every row either yields exactly one vector or is skipped with a reason;
//! `written + skipped == total` holds for every run.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{EmbeddingConfig, VectorizeConfig};
use crate::dataset::{
    COMMIT, FILE_PATH, LabeledRow, METHOD, MethodChange, MethodKey, finish, open_reader,
    read_changes, read_labeled, write_row,
};
use crate::embed::{Dictionary, Embedder, build_embedder};
use crate::error::{PipelineError, Result};
use crate::report::{SkipReason, StageReport};
use crate::store::{StagedOutput, atomic_write};
use crate::syntax::change_tree::change_trees;
use crate::syntax::{SyntaxTree, parse_method};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Simple,
    ChangeTree,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::ChangeTree => "changetree",
        }
    }

    pub fn vector_column(self) -> &'static str {
        match self {
            Self::Simple => "embedding",
            Self::ChangeTree => "change_tree",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "changetree" | "change-tree" | "change_tree" => Ok(Self::ChangeTree),
            other => Err(format!("unknown mode `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector(pub Vec<f32>);

impl FeatureVector {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Five decimals, single-space separated.
    pub fn to_field(&self) -> String {
        self.0
            .iter()
            .map(|value| format!("{value:.5}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Written next to every vectorized file as `<output>.meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMeta {
    pub mode: String,
    pub dimension: usize,
    pub vector_length: usize,
    pub vector_column: String,
    pub embedder: String,
    pub total: usize,
    pub written: usize,
    pub skipped: BTreeMap<String, usize>,
    pub generated_at: String,
}

pub fn meta_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".meta.json");
    PathBuf::from(name)
}

pub fn load_meta(data_path: &Path) -> Result<Option<VectorMeta>> {
    let path = meta_path(data_path);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|err| PipelineError::input_format(&path, format!("invalid sidecar: {err}")))
}

pub struct Vectorizer<'a> {
    pub mode: Mode,
    pub embedder: &'a dyn Embedder,
    pub dictionary: Option<&'a Dictionary>,
    pub max_root_paths: usize,
}

impl Vectorizer<'_> {
    pub fn vector_length(&self) -> usize {
        2 * self.embedder.dimension()
    }

    pub fn vectorize(&self, change: &MethodChange) -> std::result::Result<FeatureVector, SkipReason> {
        let before = parse_method(&change.before_text).map_err(|_| SkipReason::ParseError)?;
        let after = parse_method(&change.after_text).map_err(|_| SkipReason::ParseError)?;
        match self.mode {
            Mode::Simple => self.simple(before.as_ref(), after.as_ref()),
            Mode::ChangeTree => match (before, after) {
                (Some(before), Some(after)) => self.change_tree(&before, &after),
                _ => Err(SkipReason::MissingSide),
            },
        }
    }

    fn simple(
        &self,
        before: Option<&SyntaxTree>,
        after: Option<&SyntaxTree>,
    ) -> std::result::Result<FeatureVector, SkipReason> {
        let before = before.map(|tree| self.tokens(tree.flatten()));
        let after = after.map(|tree| self.tokens(tree.flatten()));
        if before == after {
            return Err(SkipReason::Unchanged);
        }
        Ok(self.concat(before.as_deref(), after.as_deref()))
    }

    fn change_tree(
        &self,
        before: &SyntaxTree,
        after: &SyntaxTree,
    ) -> std::result::Result<FeatureVector, SkipReason> {
        let (removed, added) = change_trees(before, after, self.max_root_paths);
        if removed.is_empty() && added.is_empty() {
            return Err(SkipReason::Unchanged);
        }
        let (removed, added) = (self.tokens(removed.flatten()), self.tokens(added.flatten()));
        Ok(self.concat(Some(removed.as_slice()), Some(added.as_slice())))
    }

    fn concat(&self, before: Option<&[String]>, after: Option<&[String]>) -> FeatureVector {
        let mut out = Vec::with_capacity(self.vector_length());
        out.extend(self.embed_side(before));
        out.extend(self.embed_side(after));
        FeatureVector(out)
    }

    /// Tokens as the embedder sees them: out-of-dictionary tokens become
    /// `OOV_TOKEN` before any comparison.
    fn tokens(&self, flattened: Vec<String>) -> Vec<String> {
        filter_with(self.dictionary, flattened)
    }

    fn embed_side(&self, tokens: Option<&[String]>) -> Vec<f32> {
        match tokens {
            None => vec![0.0; self.embedder.dimension()],
            Some(tokens) => self.embedder.embed(tokens),
        }
    }

    fn vectorize_row(
        &self,
        row: &LabeledRow,
        ignore: &HashSet<MethodKey>,
    ) -> std::result::Result<FeatureVector, SkipReason> {
        let change = &row.example.change;
        if ignore.contains(&change.key()) {
            return Err(SkipReason::Ignored);
        }
        self.vectorize(change)
    }
}

fn filter_with(dictionary: Option<&Dictionary>, tokens: Vec<String>) -> Vec<String> {
    match dictionary {
        Some(dictionary) => dictionary.filter_tokens(&tokens),
        None => tokens,
    }
}

pub struct VectorizeRun<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub mode: Mode,
    pub ignore_path: Option<&'a Path>,
}

pub fn run_vectorize(
    run: &VectorizeRun<'_>,
    embedding: &EmbeddingConfig,
    config: &VectorizeConfig,
) -> Result<StageReport> {
    let mut report = StageReport::new("vectorize");
    let embedder = build_embedder(embedding)?;
    let dictionary = load_dictionary(embedding)?;
    let ignore = match run.ignore_path {
        Some(path) => read_keys(path)?,
        None => HashSet::new(),
    };

    let file = read_labeled(run.input, &mut report)?;
    let vectorizer = Vectorizer {
        mode: run.mode,
        embedder: embedder.as_ref(),
        dictionary: dictionary.as_ref(),
        max_root_paths: config.max_root_paths,
    };

    let outcomes = if config.parallel {
        file.rows
            .par_iter()
            .map(|row| vectorizer.vectorize_row(row, &ignore))
            .collect::<Vec<_>>()
    } else {
        file.rows
            .iter()
            .map(|row| vectorizer.vectorize_row(row, &ignore))
            .collect::<Vec<_>>()
    };

    let column = run.mode.vector_column();
    let passthrough = file
        .headers
        .iter()
        .enumerate()
        .filter(|(_, header)| header.trim() != column)
        .map(|(idx, _)| idx)
        .collect::<Vec<_>>();

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = passthrough
        .iter()
        .filter_map(|idx| file.headers.get(*idx))
        .collect::<Vec<_>>();
    header.push(column);
    write_row(&mut writer, header)?;

    for (row, outcome) in file.rows.iter().zip(outcomes) {
        match outcome {
            Ok(vector) => {
                let field = vector.to_field();
                let mut out = passthrough
                    .iter()
                    .map(|idx| row.record.get(*idx).unwrap_or(""))
                    .collect::<Vec<_>>();
                out.push(&field);
                write_row(&mut writer, out)?;
                report.written += 1;
            }
            Err(reason) => {
                log::debug!(
                    "vectorize: skipping {}: {}",
                    row.example.change.key(),
                    reason.as_str()
                );
                report.skip(reason);
            }
        }
    }
    let data = finish(writer)?;

    let meta = VectorMeta {
        mode: run.mode.as_str().to_string(),
        dimension: embedder.dimension(),
        vector_length: vectorizer.vector_length(),
        vector_column: column.to_string(),
        embedder: embedder.kind().to_string(),
        total: report.total,
        written: report.written,
        skipped: report
            .skipped
            .iter()
            .map(|(reason, count)| (reason.to_string(), *count))
            .collect(),
        generated_at: chrono::Utc::now().to_rfc3339(),
    };
    let meta_json = serde_json::to_vec_pretty(&meta).map_err(|err| PipelineError::Io(err.into()))?;

    let mut staged = StagedOutput::new();
    staged.stage(run.output, &data)?;
    staged.stage(&meta_path(run.output), &meta_json)?;
    staged.commit()?;

    report.set("mode", run.mode.as_str());
    report.set("dimension", meta.dimension);
    report.set("vector_column", column);
    report.set("embedder", meta.embedder);
    report.warn_if_empty();
    Ok(report)
}

pub fn load_dictionary(embedding: &EmbeddingConfig) -> Result<Option<Dictionary>> {
    embedding
        .dictionary_path
        .as_deref()
        .map(Dictionary::load)
        .transpose()
}

/// Reads a key list (`file_path,method,commit` columns, as written by
/// `run_unchanged`).
pub fn read_keys(path: &Path) -> Result<HashSet<MethodKey>> {
    let mut reader = open_reader(path)?;
    let headers = reader
        .headers()
        .map_err(|err| PipelineError::csv(path, err))?
        .clone();
    let position = |name: &str| {
        headers
            .iter()
            .position(|header| header.trim() == name)
            .ok_or_else(|| PipelineError::input_format(path, format!("missing column {name}")))
    };
    let (file_idx, method_idx, commit_idx) =
        (position(FILE_PATH)?, position(METHOD)?, position(COMMIT)?);

    let mut keys = HashSet::new();
    for record in reader.records() {
        let record = record.map_err(|err| PipelineError::csv(path, err))?;
        let field = |idx: usize| record.get(idx).unwrap_or("").to_string();
        keys.insert(MethodKey {
            file_path: field(file_idx),
            method: field(method_idx),
            commit: field(commit_idx),
        });
    }
    Ok(keys)
}

/// Lists the changes whose before and after flattenings are identical once
/// both pass through the same dictionary filter `vectorize` applies.
pub fn run_unchanged(
    input: &Path,
    output: &Path,
    dictionary: Option<&Dictionary>,
) -> Result<StageReport> {
    let mut report = StageReport::new("unchanged");
    let changes = read_changes(input, &mut report)?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    write_row(&mut writer, [FILE_PATH, METHOD, COMMIT])?;
    let mut changed = 0usize;
    for change in &changes {
        let parsed = (parse_method(&change.before_text), parse_method(&change.after_text));
        let (Ok(before), Ok(after)) = parsed else {
            log::debug!("unchanged: cannot parse {}", change.key());
            report.skip(SkipReason::ParseError);
            continue;
        };
        let identical = match (before, after) {
            (Some(before), Some(after)) => {
                filter_with(dictionary, before.flatten()) == filter_with(dictionary, after.flatten())
            }
            _ => false,
        };
        if identical {
            write_row(
                &mut writer,
                [
                    change.file_path.as_str(),
                    change.method.as_str(),
                    change.commit.as_str(),
                ],
            )?;
            report.written += 1;
        } else {
            changed += 1;
        }
    }
    atomic_write(output, &finish(writer)?)?;
    report.set("changed", changed);
    Ok(report)
}
