use std::path::Path;

use crate::config::ScoreConfig;
use crate::dataset::scores::ScoreTable;
use crate::dataset::{MethodChange, changes_to_csv, read_changes};
use crate::error::Result;
use crate::report::StageReport;
use crate::store::atomic_write;

#[derive(Debug, Clone)]
pub struct FilterOutcome {
    pub kept: Vec<MethodChange>,
    pub excluded: usize,
}

/// Keeps the changes whose file scores above the threshold. Order follows
/// the input.
pub fn filter_changes(changes: Vec<MethodChange>, scores: &ScoreTable, threshold: f64) -> FilterOutcome {
    let total = changes.len();
    let kept = changes
        .into_iter()
        .filter(|change| scores.is_relevant(&change.file_path, &change.commit, threshold))
        .collect::<Vec<_>>();
    FilterOutcome {
        excluded: total - kept.len(),
        kept,
    }
}

pub fn run_filter(
    input: &Path,
    scores_path: &Path,
    output: &Path,
    config: &ScoreConfig,
) -> Result<StageReport> {
    let mut report = StageReport::new("filter");
    let scores = ScoreTable::load(scores_path, config)?;
    if !scores.malformed_lines.is_empty() {
        report.warn(format!(
            "skipped {} malformed score entries in {} (lines {:?})",
            scores.malformed_lines.len(),
            scores_path.display(),
            scores.malformed_lines
        ));
    }
    if scores.is_empty() {
        report.warn(format!("score table {} has no usable entries", scores_path.display()));
    }

    let changes = read_changes(input, &mut report)?;
    let outcome = filter_changes(changes, &scores, config.threshold);

    atomic_write(output, &changes_to_csv(&outcome.kept)?)?;

    report.written = outcome.kept.len();
    report.set("excluded", outcome.excluded);
    report.set("score_entries", scores.len());
    report.set("threshold", config.threshold);
    report.warn_if_empty();
    Ok(report)
}
