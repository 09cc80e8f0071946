use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::DictionaryConfig;
use crate::error::{PipelineError, Result};
use crate::report::StageReport;
use crate::store::atomic_write;

/// Stands in for every token the dictionary dropped.
pub const OOV_TOKEN: &str = "OOV_TOKEN";

/// Document frequencies over a corpus of flattened methods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dictionary {
    pub num_docs: usize,
    pub document_frequency: BTreeMap<String, usize>,
}

impl Dictionary {
    pub fn from_documents<I>(documents: I) -> Self
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        let mut dictionary = Self::default();
        for document in documents {
            dictionary.num_docs += 1;
            let unique = document.into_iter().collect::<HashSet<_>>();
            for token in unique {
                *dictionary.document_frequency.entry(token).or_insert(0) += 1;
            }
        }
        dictionary
    }

    /// Drops tokens that are too rare or too common, then keeps the `keep_n`
    /// most frequent. Returns how many tokens were removed.
    pub fn filter_extremes(&mut self, config: &DictionaryConfig) -> usize {
        let before = self.document_frequency.len();
        let no_below = (self.num_docs as f64 * config.no_below_percent).round() as usize;
        let no_above = (self.num_docs as f64 * config.no_above_percent).floor() as usize;

        let mut kept = self
            .document_frequency
            .iter()
            .filter(|(_, df)| **df >= no_below && **df <= no_above)
            .map(|(token, df)| (token.clone(), *df))
            .collect::<Vec<_>>();
        kept.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        kept.truncate(config.keep_n);

        self.document_frequency = kept.into_iter().collect();
        before - self.document_frequency.len()
    }

    pub fn len(&self) -> usize {
        self.document_frequency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.document_frequency.is_empty()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.document_frequency.contains_key(token)
    }

    pub fn filter_tokens(&self, tokens: &[String]) -> Vec<String> {
        tokens
            .iter()
            .map(|token| {
                if self.contains(token) {
                    token.clone()
                } else {
                    OOV_TOKEN.to_string()
                }
            })
            .collect()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|err| PipelineError::input_format(path, format!("cannot read: {err}")))?;
        serde_json::from_str(&content)
            .map_err(|err| PipelineError::input_format(path, format!("invalid dictionary: {err}")))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|err| PipelineError::Io(err.into()))
    }
}

/// One corpus line is one document of comma-separated tokens.
pub fn parse_corpus_line(line: &str) -> Vec<String> {
    line.split(',')
        .map(|token| token.trim().to_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

fn read_corpus(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|err| PipelineError::input_format(path, format!("cannot read corpus: {err}")))
}

pub fn run_dictionary(corpus: &Path, output: &Path, config: &DictionaryConfig) -> Result<StageReport> {
    let mut report = StageReport::new("dictionary");
    let content = read_corpus(corpus)?;
    let documents = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_corpus_line)
        .collect::<Vec<_>>();
    report.total = documents.len();

    let mut dictionary = Dictionary::from_documents(documents);
    let seen = dictionary.len();
    let removed = dictionary.filter_extremes(config);
    atomic_write(output, &dictionary.to_json()?)?;

    report.written = dictionary.len();
    report.set("num_docs", dictionary.num_docs);
    report.set("tokens_seen", seen);
    report.set("tokens_removed", removed);
    report.warn_if_empty();
    Ok(report)
}

pub fn run_filter_corpus(corpus: &Path, dictionary_path: &Path, output: &Path) -> Result<StageReport> {
    let mut report = StageReport::new("filter-corpus");
    let dictionary = Dictionary::load(dictionary_path)?;
    let content = read_corpus(corpus)?;

    let mut replaced = 0usize;
    let mut out = String::new();
    for line in content.lines() {
        report.total += 1;
        let filtered = dictionary.filter_tokens(&parse_corpus_line(line));
        replaced += filtered.iter().filter(|token| *token == OOV_TOKEN).count();
        out.push_str(&filtered.join(","));
        out.push('\n');
        report.written += 1;
    }
    atomic_write(output, out.as_bytes())?;

    report.set("oov_replaced", replaced);
    report.set("dictionary_size", dictionary.len());
    Ok(report)
}
