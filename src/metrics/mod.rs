//! Per-commit static-analysis metrics merged into a labeled dataset.
//!
//! The analysis tool itself is external. For every commit the before-state
//! and after-state methods are staged as Java files in turn, the tool runs
//! once per state, and the mean of the numeric columns it reports becomes
//! that state's metrics.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use walkdir::WalkDir;

use crate::config::MetricsConfig;
use crate::dataset::{LabeledRow, MethodChange, finish, read_labeled, write_row};
use crate::error::{PipelineError, Result};
use crate::external::{run_tool, substitute};
use crate::report::{SkipReason, StageReport};
use crate::store::atomic_write;

pub const METRIC_PREFIX: &str = "metric_";

/// Numeric columns of one tool result file, one row per measured method.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<f64>>>,
}

impl MetricTable {
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|err| PipelineError::csv(path, err))?;
        let headers = reader
            .headers()
            .map_err(|err| PipelineError::csv(path, err))?
            .clone();
        let records = reader
            .records()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| PipelineError::csv(path, err))?;

        let numeric = (0..headers.len())
            .filter(|idx| {
                let mut values = records
                    .iter()
                    .filter_map(|record| record.get(*idx))
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .peekable();
                values.peek().is_some() && values.all(|value| value.parse::<f64>().is_ok())
            })
            .collect::<Vec<_>>();

        Ok(Self {
            columns: numeric
                .iter()
                .filter_map(|idx| headers.get(*idx))
                .map(|name| name.trim().to_string())
                .collect(),
            rows: records
                .iter()
                .map(|record| {
                    numeric
                        .iter()
                        .map(|idx| record.get(*idx).and_then(|value| value.trim().parse().ok()))
                        .collect()
                })
                .collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column means over the values present. `None` for an empty table.
    pub fn means(&self) -> Option<Vec<f64>> {
        if self.rows.is_empty() {
            return None;
        }
        let means = (0..self.columns.len())
            .map(|col| {
                let values = self
                    .rows
                    .iter()
                    .filter_map(|row| row.get(col).copied().flatten())
                    .collect::<Vec<_>>();
                if values.is_empty() {
                    0.0
                } else {
                    values.iter().sum::<f64>() / values.len() as f64
                }
            })
            .collect();
        Some(means)
    }
}

pub trait MetricsTool {
    fn name(&self) -> &str;
    /// Analyzes every source file in `input_dir`, leaving its results under
    /// `output_dir`.
    fn run(&self, input_dir: &Path, output_dir: &Path) -> Result<MetricTable>;
}

pub struct SubprocessMetricsTool {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    result_pattern: glob::Pattern,
    timeout: Duration,
}

impl SubprocessMetricsTool {
    pub fn from_config(config: &MetricsConfig) -> Result<Self> {
        let command = config.require_command()?.to_vec();
        let result_pattern = glob::Pattern::new(&config.result_pattern)
            .map_err(|err| PipelineError::config(format!("metrics.result_pattern: {}", err.msg)))?;
        Ok(Self {
            command,
            working_dir: config.working_dir.clone(),
            result_pattern,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    fn result_file(&self, output_dir: &Path) -> Result<PathBuf> {
        let mut matches = WalkDir::new(output_dir)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                self.result_pattern
                    .matches(&entry.file_name().to_string_lossy())
            })
            .map(|entry| entry.path().to_path_buf())
            .collect::<Vec<_>>();
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(PipelineError::external_tool(
                self.name(),
                format!(
                    "no result file matching `{}` under {}",
                    self.result_pattern,
                    output_dir.display()
                ),
            )),
            n => Err(PipelineError::external_tool(
                self.name(),
                format!("{n} result files match `{}`; expected one", self.result_pattern),
            )),
        }
    }
}

impl MetricsTool for SubprocessMetricsTool {
    fn name(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("metrics")
    }

    fn run(&self, input_dir: &Path, output_dir: &Path) -> Result<MetricTable> {
        let input = input_dir.to_string_lossy();
        let output = output_dir.to_string_lossy();
        let command = substitute(
            &self.command,
            &[("input", input.as_ref()), ("output", output.as_ref())],
        );
        run_tool(&command, self.working_dir.as_deref(), self.timeout)?;
        MetricTable::load(&self.result_file(output_dir)?)
    }
}

/// Which side of a change a tool run measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Before,
    After,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
        }
    }

    fn body(self, change: &MethodChange) -> &str {
        match self {
            Self::Before => &change.before_text,
            Self::After => &change.after_text,
        }
    }
}

/// Mean metrics of one commit. A state with no methods (every method added,
/// or every method deleted) has none.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateMetrics {
    pub before: Option<Vec<f64>>,
    pub after: Option<Vec<f64>>,
}

impl StateMetrics {
    fn slot(&mut self, state: State) -> &mut Option<Vec<f64>> {
        match state {
            State::Before => &mut self.before,
            State::After => &mut self.after,
        }
    }

    fn is_empty(&self) -> bool {
        self.before.is_none() && self.after.is_none()
    }
}

/// Per-commit metrics, with one column layout shared by every run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitMetrics {
    pub columns: Vec<String>,
    pub by_commit: HashMap<String, StateMetrics>,
}

impl CommitMetrics {
    /// `metric_before_<name>` for every column, then `metric_after_<name>`.
    pub fn header(&self) -> Vec<String> {
        [State::Before, State::After]
            .into_iter()
            .flat_map(|state| {
                self.columns
                    .iter()
                    .map(move |name| format!("{METRIC_PREFIX}{}_{name}", state.as_str()))
            })
            .collect()
    }

    /// Fields for a row of `commit`; empty where a state was not measured.
    pub fn fields(&self, commit: &str) -> Option<Vec<String>> {
        let metrics = self.by_commit.get(commit)?;
        let render = |values: &Option<Vec<f64>>| match values {
            Some(values) => values.iter().map(f64::to_string).collect::<Vec<_>>(),
            None => vec![String::new(); self.columns.len()],
        };
        let mut fields = render(&metrics.before);
        fields.extend(render(&metrics.after));
        Some(fields)
    }
}

fn reset_dir(path: &Path) -> Result<()> {
    if path.parent().is_none() {
        return Err(PipelineError::config(format!(
            "refusing to clear {}",
            path.display()
        )));
    }
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    fs::create_dir_all(path)?;
    Ok(())
}

fn staged_source(idx: usize, body: &str) -> String {
    format!("class Method{idx} {{\n{body}\n}}\n")
}

/// Runs the tool once per state of every distinct commit, in first-seen
/// order, before-state first. Any tool failure aborts the whole collection.
pub fn collect_commit_metrics(
    rows: &[LabeledRow],
    tool: &dyn MetricsTool,
    input_dir: &Path,
    output_dir: &Path,
) -> Result<CommitMetrics> {
    let mut commits: Vec<(&str, Vec<&MethodChange>)> = Vec::new();
    let mut positions = HashMap::new();
    for row in rows {
        let change = &row.example.change;
        let slot = *positions.entry(change.commit.as_str()).or_insert_with(|| {
            commits.push((change.commit.as_str(), Vec::new()));
            commits.len() - 1
        });
        commits[slot].1.push(change);
    }

    let mut metrics = CommitMetrics::default();
    let mut layout: Option<Vec<String>> = None;
    for (commit, changes) in commits {
        let mut measured = StateMetrics::default();
        for state in [State::Before, State::After] {
            let bodies = changes
                .iter()
                .map(|change| state.body(change))
                .filter(|body| !body.trim().is_empty())
                .collect::<Vec<_>>();
            if bodies.is_empty() {
                continue;
            }
            reset_dir(input_dir)?;
            reset_dir(output_dir)?;
            for (idx, body) in bodies.iter().enumerate() {
                fs::write(
                    input_dir.join(format!("Method{idx}.java")),
                    staged_source(idx, body),
                )?;
            }

            let table = tool.run(input_dir, output_dir)?;
            let Some(means) = table.means() else {
                log::debug!(
                    "metrics: tool reported nothing for the {} state of commit {commit}",
                    state.as_str()
                );
                continue;
            };
            match &layout {
                Some(columns) if *columns != table.columns => {
                    return Err(PipelineError::external_tool(
                        tool.name(),
                        format!(
                            "metric columns changed at commit {commit}: expected {columns:?}, got {:?}",
                            table.columns
                        ),
                    ));
                }
                Some(_) => {}
                None => layout = Some(table.columns.clone()),
            }
            *measured.slot(state) = Some(means);
        }
        if !measured.is_empty() {
            metrics.by_commit.insert(commit.to_string(), measured);
        }
    }
    metrics.columns = layout.unwrap_or_default();
    Ok(metrics)
}

pub fn run_metrics(
    input: &Path,
    output: &Path,
    tool: &dyn MetricsTool,
    config: &MetricsConfig,
) -> Result<StageReport> {
    let mut report = StageReport::new("metrics");
    let file = read_labeled(input, &mut report)?;
    let metrics = collect_commit_metrics(&file.rows, tool, &config.input_dir, &config.output_dir)?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = file.headers.iter().map(ToOwned::to_owned).collect::<Vec<_>>();
    header.extend(metrics.header());
    write_row(&mut writer, &header)?;

    for row in &file.rows {
        let change = &row.example.change;
        let Some(values) = metrics.fields(&change.commit) else {
            log::debug!("metrics: no metrics for {}", change.key());
            report.skip(SkipReason::NoMetrics);
            continue;
        };
        let mut out = row.record.iter().map(ToOwned::to_owned).collect::<Vec<_>>();
        out.extend(values);
        write_row(&mut writer, &out)?;
        report.written += 1;
    }
    atomic_write(output, &finish(writer)?)?;

    report.set("commits", metrics.by_commit.len());
    report.set("metric_columns", metrics.columns.clone());
    report.warn_if_empty();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::{MetricTable, MetricsTool, run_metrics};
    use crate::config::MetricsConfig;
    use crate::dataset::tests::change;
    use crate::dataset::{Label, LabeledExample, MethodChange, examples_to_csv};
    use crate::error::{PipelineError, Result};
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;

    /// Reports one row per staged file: its line count and its index.
    struct CountingTool {
        staged: RefCell<Vec<Vec<String>>>,
        fail_on_call: Option<usize>,
    }

    impl CountingTool {
        fn new(fail_on_call: Option<usize>) -> Self {
            Self {
                staged: RefCell::new(Vec::new()),
                fail_on_call,
            }
        }
    }

    impl MetricsTool for CountingTool {
        fn name(&self) -> &str {
            "counting"
        }

        fn run(&self, input_dir: &Path, _output_dir: &Path) -> Result<MetricTable> {
            let call = self.staged.borrow().len();
            if self.fail_on_call == Some(call) {
                return Err(PipelineError::external_tool("counting", "exit status 1"));
            }
            let mut names = fs::read_dir(input_dir)?
                .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().to_string()))
                .collect::<std::io::Result<Vec<_>>>()?;
            names.sort();
            let rows = names
                .iter()
                .enumerate()
                .map(|(idx, name)| {
                    let lines = fs::read_to_string(input_dir.join(name))
                        .map(|text| text.lines().count() as f64)
                        .ok();
                    vec![lines, Some(idx as f64)]
                })
                .collect();
            self.staged.borrow_mut().push(names);
            Ok(MetricTable {
                columns: vec!["loc".to_string(), "index".to_string()],
                rows,
            })
        }
    }

    fn config(root: &Path) -> MetricsConfig {
        MetricsConfig {
            command: Vec::new(),
            working_dir: None,
            input_dir: root.join("metrics/input"),
            output_dir: root.join("metrics/results"),
            result_pattern: "*-Method.csv".to_string(),
            timeout_secs: 10,
        }
    }

    fn write_input(root: &Path, changes: Vec<MethodChange>) -> std::path::PathBuf {
        let examples = changes
            .into_iter()
            .map(|change| LabeledExample {
                change,
                label: Label::Negative,
            })
            .collect::<Vec<_>>();
        let path = root.join("xval.csv");
        fs::write(&path, examples_to_csv(&examples).expect("csv")).expect("input");
        path
    }

    #[test]
    fn metric_table_keeps_only_numeric_columns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run-Method.csv");
        fs::write(&path, "file,method,loc,cbo\nA.java,a,10,\nA.java,b,20,3\n").expect("csv");

        let table = MetricTable::load(&path).expect("load");
        assert_eq!(table.columns, vec!["loc", "cbo"]);
        assert_eq!(table.means(), Some(vec![15.0, 3.0]));
    }

    #[test]
    fn merges_mean_metrics_per_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut deleted = change("B.java", "b", "c1");
        deleted.after_text.clear();
        let mut multiline = change("C.java", "c", "c2");
        multiline.after_text = "void c() {\n  x();\n}".to_string();
        let input = write_input(
            dir.path(),
            vec![change("A.java", "a", "c1"), deleted, multiline],
        );
        let output = dir.path().join("xval_metrics.csv");
        let tool = CountingTool::new(None);

        let report = run_metrics(&input, &output, &tool, &config(dir.path())).expect("metrics");
        assert_eq!(report.written, 3);
        let one = |name: &str| vec![name.to_string()];
        assert_eq!(
            *tool.staged.borrow(),
            vec![
                vec!["Method0.java".to_string(), "Method1.java".to_string()],
                one("Method0.java"),
                one("Method0.java"),
                one("Method0.java"),
            ]
        );

        let mut reader = csv::Reader::from_path(&output).expect("reader");
        let headers = reader.headers().expect("headers").clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec![
                "file_path", "method", "commit", "before_text", "after_text", "label",
                "metric_before_loc", "metric_before_index", "metric_after_loc", "metric_after_index"
            ]
        );
        let rows = reader
            .records()
            .map(|record| {
                let record = record.expect("record");
                record.iter().skip(6).map(ToOwned::to_owned).collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        // One-line methods stage as three-line files, three-line ones as five.
        assert_eq!(rows[0], vec!["3", "0.5", "3", "0"]);
        assert_eq!(rows[1], rows[0]);
        assert_eq!(rows[2], vec!["3", "0", "5", "0"]);
    }

    #[test]
    fn commits_that_only_add_methods_leave_before_fields_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut added = change("A.java", "a", "c1");
        added.before_text.clear();
        let input = write_input(dir.path(), vec![added]);
        let output = dir.path().join("xval_metrics.csv");
        let tool = CountingTool::new(None);

        let report = run_metrics(&input, &output, &tool, &config(dir.path())).expect("metrics");
        assert_eq!(report.written, 1);
        assert_eq!(tool.staged.borrow().len(), 1);

        let mut reader = csv::Reader::from_path(&output).expect("reader");
        let record = reader.records().next().expect("row").expect("record");
        let metrics = record.iter().skip(6).collect::<Vec<_>>();
        assert_eq!(metrics, vec!["", "", "3", "0"]);
    }

    #[test]
    fn tool_failure_leaves_no_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(
            dir.path(),
            vec![change("A.java", "a", "c1"), change("B.java", "b", "c2")],
        );
        let output = dir.path().join("xval_metrics.csv");
        let tool = CountingTool::new(Some(1));

        let err = run_metrics(&input, &output, &tool, &config(dir.path())).expect_err("failure");
        assert_eq!(err.code(), "external_tool_error");
        assert!(!output.exists());
    }

    #[test]
    fn commits_without_methods_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut empty = change("B.java", "b", "c2");
        empty.before_text.clear();
        empty.after_text.clear();
        let input = write_input(dir.path(), vec![change("A.java", "a", "c1"), empty]);
        let output = dir.path().join("xval_metrics.csv");

        let report =
            run_metrics(&input, &output, &CountingTool::new(None), &config(dir.path())).expect("run");
        assert_eq!(report.written, 1);
        assert_eq!(report.skipped["no_metrics"], 1);
    }

    #[cfg(unix)]
    #[test]
    fn subprocess_tool_reads_the_single_result_file() {
        use super::SubprocessMetricsTool;

        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = config(dir.path());
        config.command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf 'name,loc\\nm,4\\nn,6\\n' > \"$1/run-Method.csv\"".to_string(),
            "sh".to_string(),
            "{output}".to_string(),
        ];
        fs::create_dir_all(&config.input_dir).expect("input dir");
        fs::create_dir_all(&config.output_dir).expect("output dir");

        let tool = SubprocessMetricsTool::from_config(&config).expect("tool");
        let table = tool.run(&config.input_dir, &config.output_dir).expect("run");
        assert_eq!(table.columns, vec!["loc"]);
        assert_eq!(table.means(), Some(vec![5.0]));
    }

    #[test]
    fn subprocess_tool_requires_a_command() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = super::SubprocessMetricsTool::from_config(&config(dir.path()))
            .err()
            .expect("missing command");
        assert_eq!(err.code(), "config_error");
    }
}
