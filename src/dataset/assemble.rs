use std::collections::HashSet;
use std::path::Path;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::config::DatasetConfig;
use crate::dataset::{Label, LabeledExample, MethodChange, examples_to_csv, read_changes};
use crate::error::Result;
use crate::report::StageReport;
use crate::store::StagedOutput;

#[derive(Debug, Clone, Default)]
pub struct Assembly {
    pub examples: Vec<LabeledExample>,
    pub duplicates: usize,
    pub sampled_out: usize,
    pub empty_pool: Option<&'static str>,
}

impl Assembly {
    pub fn positives(&self) -> usize {
        self.examples
            .iter()
            .filter(|example| example.label == Label::Positive)
            .count()
    }
}

/// Pools after labeling and key dedup; positives are taken first.
struct Pools {
    positives: Vec<LabeledExample>,
    negatives: Vec<LabeledExample>,
    duplicates: usize,
}

fn label_pools(negatives: Vec<MethodChange>, positives: Vec<MethodChange>) -> Pools {
    let mut seen = HashSet::new();
    let mut duplicates = 0;
    let mut label = |changes: Vec<MethodChange>, label: Label| {
        let mut out = Vec::with_capacity(changes.len());
        for change in changes {
            if seen.insert(change.key()) {
                out.push(LabeledExample { change, label });
            } else {
                duplicates += 1;
            }
        }
        out
    };
    let positives = label(positives, Label::Positive);
    let negatives = label(negatives, Label::Negative);
    Pools {
        positives,
        negatives,
        duplicates,
    }
}

fn empty_pool(negatives: &[MethodChange], positives: &[MethodChange]) -> Option<&'static str> {
    if positives.is_empty() {
        Some("positive")
    } else if negatives.is_empty() {
        Some("negative")
    } else {
        None
    }
}

/// Picks `wanted` items at random, keeping input order on both sides.
/// Returns `(picked, leftover)`.
fn sample_split<T>(rng: &mut StdRng, items: Vec<T>, wanted: usize) -> (Vec<T>, Vec<T>) {
    if wanted >= items.len() {
        return (items, Vec::new());
    }
    let picked = rand::seq::index::sample(rng, items.len(), wanted)
        .into_vec()
        .into_iter()
        .collect::<HashSet<_>>();
    let mut kept = Vec::with_capacity(wanted);
    let mut rest = Vec::with_capacity(items.len() - wanted);
    for (idx, item) in items.into_iter().enumerate() {
        if picked.contains(&idx) {
            kept.push(item);
        } else {
            rest.push(item);
        }
    }
    (kept, rest)
}

/// Combines one side of the dataset, sampling negatives down to the ratio.
fn combine(
    rng: &mut StdRng,
    positives: Vec<LabeledExample>,
    negatives: Vec<LabeledExample>,
    config: &DatasetConfig,
) -> (Vec<LabeledExample>, Vec<LabeledExample>) {
    let (negatives, leftover) = match config.p_n_ratio {
        Some(ratio) => {
            let wanted = negatives_for_ratio(positives.len(), ratio);
            sample_split(rng, negatives, wanted)
        }
        None => (negatives, Vec::new()),
    };
    let mut examples = positives;
    examples.extend(negatives);
    if config.shuffle {
        examples.shuffle(rng);
    }
    (examples, leftover)
}

/// Merges the pools into one labeled set with unique method keys. A key in
/// both pools comes out once, as a positive.
pub fn assemble(
    negatives: Vec<MethodChange>,
    positives: Vec<MethodChange>,
    config: &DatasetConfig,
) -> Assembly {
    if let Some(pool) = empty_pool(&negatives, &positives) {
        return Assembly {
            empty_pool: Some(pool),
            ..Assembly::default()
        };
    }
    let pools = label_pools(negatives, positives);
    let mut rng = StdRng::seed_from_u64(config.seed);
    let (examples, leftover) = combine(&mut rng, pools.positives, pools.negatives, config);
    Assembly {
        examples,
        duplicates: pools.duplicates,
        sampled_out: leftover.len(),
        empty_pool: None,
    }
}

/// Train/test split: `n_positives` sampled positives (and negatives at the
/// configured ratio) form the train set; the leftover positives and
/// negatives form the test set. Without `p_n_ratio`, negatives are split in
/// the same proportion as positives. No key lands in both sets.
pub fn assemble_train_test(
    negatives: Vec<MethodChange>,
    positives: Vec<MethodChange>,
    n_positives: usize,
    config: &DatasetConfig,
) -> (Assembly, Assembly) {
    if let Some(pool) = empty_pool(&negatives, &positives) {
        let empty = Assembly {
            empty_pool: Some(pool),
            ..Assembly::default()
        };
        return (empty.clone(), empty);
    }
    let pools = label_pools(negatives, positives);
    let mut rng = StdRng::seed_from_u64(config.seed);
    let total_positives = pools.positives.len();
    let (train_pos, test_pos) = sample_split(&mut rng, pools.positives, n_positives);

    let (train, test, sampled_out) = if config.p_n_ratio.is_some() {
        let (train, leftover) = combine(&mut rng, train_pos, pools.negatives, config);
        let (test, dropped) = combine(&mut rng, test_pos, leftover, config);
        (train, test, dropped.len())
    } else {
        let share = train_pos.len() as f64 / total_positives as f64;
        let wanted = (pools.negatives.len() as f64 * share).round() as usize;
        let (train_neg, test_neg) = sample_split(&mut rng, pools.negatives, wanted);
        let (train, _) = combine(&mut rng, train_pos, train_neg, config);
        let (test, _) = combine(&mut rng, test_pos, test_neg, config);
        (train, test, 0)
    };
    (
        Assembly {
            examples: train,
            duplicates: pools.duplicates,
            sampled_out,
            empty_pool: None,
        },
        Assembly {
            examples: test,
            ..Assembly::default()
        },
    )
}

/// Negatives needed so that positives make up `ratio` of the dataset.
pub fn negatives_for_ratio(n_positives: usize, ratio: f64) -> usize {
    let total = (n_positives as f64 / ratio).floor() as usize;
    total.saturating_sub(n_positives)
}

/// Second output of a train/test assembly.
pub struct TestSplit<'a> {
    pub n_positives: usize,
    pub output: &'a Path,
}

pub fn run_assemble(
    negative_path: &Path,
    positive_path: &Path,
    output: &Path,
    split: Option<&TestSplit<'_>>,
    config: &DatasetConfig,
) -> Result<StageReport> {
    let mut report = StageReport::new("assemble");
    let negatives = read_changes(negative_path, &mut report)?;
    let positives = read_changes(positive_path, &mut report)?;
    report.set("negative_pool", negatives.len());
    report.set("positive_pool", positives.len());

    let (assembly, test) = match split {
        Some(split) => {
            if split.n_positives > positives.len() {
                report.warn(format!(
                    "n_positives {} exceeds the {} positives available; the test set gets none",
                    split.n_positives,
                    positives.len()
                ));
            }
            let (train, test) =
                assemble_train_test(negatives, positives, split.n_positives, config);
            (train, Some((split.output, test)))
        }
        None => (assemble(negatives, positives, config), None),
    };
    if let Some(pool) = assembly.empty_pool {
        report.warn(format!("{pool} pool is empty; writing an empty dataset"));
    }

    let mut staged = StagedOutput::new();
    staged.stage(output, &examples_to_csv(&assembly.examples)?)?;
    if let Some((path, test)) = &test {
        staged.stage(path, &examples_to_csv(&test.examples)?)?;
    }
    staged.commit()?;

    let positives_written = assembly.positives();
    report.written = assembly.examples.len();
    report.set("positives", positives_written);
    report.set("negatives", report.written - positives_written);
    report.set("duplicates", assembly.duplicates);
    report.set("sampled_out", assembly.sampled_out);
    if let Some((_, test)) = &test {
        let test_positives = test.positives();
        report.written += test.examples.len();
        report.set("test_written", test.examples.len());
        report.set("test_positives", test_positives);
        report.set("test_negatives", test.examples.len() - test_positives);
    }
    if assembly.empty_pool.is_none() {
        report.warn_if_empty();
    }
    Ok(report)
}
