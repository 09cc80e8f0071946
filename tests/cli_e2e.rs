use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

const CHANGES: &str = concat!(
    "file_path,method,commit,before_text,after_text\n",
    "X.java,a(),c1,\"void a() { int x = 1; }\",\"void a() { int x = 2; }\"\n",
    "Y.java,b(),c1,\"void b() { call(1); }\",\"void b() { call(1, 2); }\"\n",
    "X.java,c(),c2,\"int c() {\n  return 1;\n}\",\n",
);

fn run_cli(repo: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_vichange"))
        .current_dir(repo)
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("command runs")
}

fn run_json(repo: &Path, args: &[&str]) -> Value {
    let output = run_cli(repo, args);
    assert!(
        output.status.success(),
        "command failed: args={args:?}\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("json stdout")
}

fn run_error(repo: &Path, args: &[&str]) -> Value {
    let output = run_cli(repo, args);
    assert_eq!(output.status.code(), Some(1), "args={args:?}");
    let stderr = String::from_utf8_lossy(&output.stderr);
    let last = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .expect("error line");
    serde_json::from_str(last).expect("json error")
}

fn write_config(repo: &Path, extra: &str) {
    fs::write(
        repo.join("vichange.yml"),
        format!(
            "embedding:\n  dimension: 8\ndataset:\n  shuffle: false\n{extra}"
        ),
    )
    .expect("config");
}

fn seed_scenario(repo: &Path) {
    fs::write(repo.join("all_method_changes.csv"), CHANGES).expect("changes");
    fs::write(repo.join("scores.txt"), "X.java -> 1\nY.java -> 0\n").expect("scores");
}

fn csv_rows(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::Reader::from_path(path).expect("reader");
    let headers = reader
        .headers()
        .expect("headers")
        .iter()
        .map(ToOwned::to_owned)
        .collect();
    let rows = reader
        .records()
        .map(|record| {
            record
                .expect("record")
                .iter()
                .map(ToOwned::to_owned)
                .collect()
        })
        .collect();
    (headers, rows)
}

#[test]
fn filter_assemble_vectorize_and_search_pipeline() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();
    write_config(
        repo,
        concat!(
            "hyper:\n",
            "  models: [forest]\n",
            "  search_space:\n",
            "    forest:\n",
            "      depth: [2, 4]\n",
            "  classifier_command: [\"sh\", \"-c\", \"echo '{\\\"fmes\\\":0.5,\\\"precision\\\":0.4,\\\"recall\\\":0.6}'\"]\n",
        ),
    );
    seed_scenario(repo);

    let filter = run_json(
        repo,
        &[
            "filter",
            "--input",
            "all_method_changes.csv",
            "--scores",
            "scores.txt",
            "--output",
            "vulnerabilities.csv",
        ],
    );
    assert_eq!(filter["status"], "ok");
    assert_eq!(filter["total"], 3);
    assert_eq!(filter["written"], 2);
    assert_eq!(filter["excluded"], 1);

    let assemble = run_json(
        repo,
        &[
            "assemble",
            "--negatives",
            "all_method_changes.csv",
            "--positives",
            "vulnerabilities.csv",
            "--output",
            "xval.csv",
        ],
    );
    assert_eq!(assemble["written"], 3);
    assert_eq!(assemble["positives"], 2);
    let (headers, rows) = csv_rows(&repo.join("xval.csv"));
    assert_eq!(headers.last().map(String::as_str), Some("label"));
    let labels = rows
        .iter()
        .map(|row| (row[1].clone(), row[5].clone()))
        .collect::<Vec<_>>();
    assert_eq!(
        labels,
        vec![
            ("a()".to_string(), "1".to_string()),
            ("c()".to_string(), "1".to_string()),
            ("b()".to_string(), "0".to_string()),
        ]
    );

    let vectorize = run_json(
        repo,
        &["vectorize", "--input", "xval.csv", "--output", "xval_vectors.csv"],
    );
    assert_eq!(vectorize["written"], 3);
    assert_eq!(vectorize["skipped_total"], 0);
    assert_eq!(vectorize["mode"], "simple");
    let (headers, rows) = csv_rows(&repo.join("xval_vectors.csv"));
    assert_eq!(headers.last().map(String::as_str), Some("embedding"));
    for row in &rows {
        assert_eq!(row.last().expect("vector").split(' ').count(), 16);
    }
    // c() was deleted: its after half is all zeros.
    let deleted = rows.iter().find(|row| row[1] == "c()").expect("deleted row");
    let values = deleted.last().expect("vector").split(' ').collect::<Vec<_>>();
    assert!(values[8..].iter().all(|value| *value == "0.00000"));

    let meta: Value = serde_json::from_str(
        &fs::read_to_string(repo.join("xval_vectors.csv.meta.json")).expect("sidecar"),
    )
    .expect("sidecar json");
    assert_eq!(meta["dimension"], 8);
    assert_eq!(meta["vector_column"], "embedding");

    let tree = run_json(
        repo,
        &[
            "vectorize",
            "--input",
            "xval.csv",
            "--output",
            "xval_tree.csv",
            "--mode",
            "changetree",
        ],
    );
    assert_eq!(tree["written"], 2);
    assert_eq!(tree["skipped"]["missing_side"], 1);
    assert_eq!(tree["status"], "partial");

    let search = run_json(
        repo,
        &["search", "--input", "xval_vectors.csv", "--output", "hyper.yml"],
    );
    assert_eq!(search["written"], 1);
    assert_eq!(search["candidates"], 2);
    let results: serde_yaml::Value =
        serde_yaml::from_str(&fs::read_to_string(repo.join("hyper.yml")).expect("yaml"))
            .expect("parse yaml");
    assert_eq!(results["forest"]["best_fmes"].as_f64(), Some(0.5));
    assert_eq!(results["forest"]["dimension"].as_u64(), Some(8));
    assert_eq!(results["forest"]["vector_length"].as_u64(), Some(16));
    assert_eq!(results["forest"]["best_params"]["depth"].as_i64(), Some(2));
}

#[test]
fn metrics_stub_tool_appends_metric_columns() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();
    fs::write(
        repo.join("stub.sh"),
        "#!/bin/sh\nn=$(ls \"$1\" | wc -l | tr -d ' ')\nprintf 'method,files\\nm,%s\\n' \"$n\" > \"$2/stub-Method.csv\"\n",
    )
    .expect("stub");
    write_config(
        repo,
        "metrics:\n  command: [\"sh\", \"stub.sh\", \"{input}\", \"{output}\"]\n  working_dir: .\n",
    );
    seed_scenario(repo);
    run_json(
        repo,
        &[
            "assemble",
            "--negatives",
            "all_method_changes.csv",
            "--positives",
            "all_method_changes.csv",
            "--output",
            "xval.csv",
        ],
    );

    let metrics = run_json(
        repo,
        &["metrics", "--input", "xval.csv", "--output", "xval_metrics.csv"],
    );
    assert_eq!(metrics["written"], 3);
    assert_eq!(metrics["commits"], 2);

    let (headers, rows) = csv_rows(&repo.join("xval_metrics.csv"));
    let column = |name: &str| {
        headers
            .iter()
            .position(|header| header == name)
            .expect("metric column")
    };
    let (before, after) = (column("metric_before_files"), column("metric_after_files"));
    assert_eq!(after, headers.len() - 1);
    let by_method = rows
        .iter()
        .map(|row| (row[1].as_str(), row[before].as_str(), row[after].as_str()))
        .collect::<Vec<_>>();
    assert!(by_method.contains(&("a()", "2", "2")));
    // c() was deleted in c2, so that commit has no after state.
    assert!(by_method.contains(&("c()", "1", "")));
}

#[test]
fn failing_metrics_tool_leaves_no_output() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();
    write_config(repo, "metrics:\n  command: [\"sh\", \"-c\", \"echo analyzer crashed >&2; exit 4\"]\n");
    seed_scenario(repo);
    run_json(
        repo,
        &[
            "assemble",
            "--negatives",
            "all_method_changes.csv",
            "--positives",
            "all_method_changes.csv",
            "--output",
            "xval.csv",
        ],
    );

    let error = run_error(
        repo,
        &["metrics", "--input", "xval.csv", "--output", "xval_metrics.csv"],
    );
    assert_eq!(error["error"]["code"], "external_tool_error");
    assert!(
        error["error"]["message"]
            .as_str()
            .expect("message")
            .contains("analyzer crashed")
    );
    assert!(!repo.join("xval_metrics.csv").exists());
}

#[test]
fn metrics_without_a_command_is_a_config_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();
    write_config(repo, "");
    seed_scenario(repo);

    let error = run_error(
        repo,
        &["metrics", "--input", "all_method_changes.csv", "--output", "out.csv"],
    );
    assert_eq!(error["error"]["code"], "config_error");
    assert!(
        error["error"]["message"]
            .as_str()
            .expect("message")
            .contains("metrics.command")
    );
}

#[test]
fn missing_explicit_config_fails_before_any_work() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();
    seed_scenario(repo);

    let error = run_error(
        repo,
        &[
            "--config",
            "nope.yml",
            "filter",
            "--input",
            "all_method_changes.csv",
            "--scores",
            "scores.txt",
            "--output",
            "vulnerabilities.csv",
        ],
    );
    assert_eq!(error["error"]["code"], "config_error");
    assert!(!repo.join("vulnerabilities.csv").exists());
}

#[test]
fn unknown_config_keys_are_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();
    fs::write(repo.join("vichange.yml"), "vectorize:\n  mood: simple\n").expect("config");
    seed_scenario(repo);

    let error = run_error(
        repo,
        &["unchanged", "--input", "all_method_changes.csv", "--output", "same.csv"],
    );
    assert_eq!(error["error"]["code"], "config_error");
}

#[test]
fn missing_columns_are_an_input_format_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();
    write_config(repo, "");
    fs::write(repo.join("bad.csv"), "file_path,method\nX.java,a\n").expect("bad csv");
    fs::write(repo.join("scores.txt"), "X.java -> 1\n").expect("scores");

    let error = run_error(
        repo,
        &[
            "filter",
            "--input",
            "bad.csv",
            "--scores",
            "scores.txt",
            "--output",
            "out.csv",
        ],
    );
    assert_eq!(error["error"]["code"], "input_format_error");
    assert!(!repo.join("out.csv").exists());
}

#[test]
fn init_writes_default_config_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();

    let init = run_json(repo, &["init"]);
    assert_eq!(init["status"], "ok");
    assert!(repo.join("vichange.yml").is_file());

    let error = run_error(repo, &["init"]);
    assert_eq!(error["error"]["code"], "config_error");
    run_json(repo, &["init", "--force"]);
}

#[test]
fn flatten_dictionary_and_filter_corpus_chain() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();
    write_config(repo, "dictionary:\n  no_below_percent: 1.0\n");
    fs::create_dir_all(repo.join("src/pkg")).expect("src");
    fs::write(
        repo.join("src/pkg/A.java"),
        "class A {\n  int one() { return 1; }\n  int two() { return 2; }\n}\n",
    )
    .expect("java");

    let flatten = run_json(repo, &["flatten", "--input", "src", "--output", "corpus.txt"]);
    assert_eq!(flatten["written"], 2);

    let dictionary = run_json(
        repo,
        &["dictionary", "--corpus", "corpus.txt", "--output", "dict.json"],
    );
    assert_eq!(dictionary["num_docs"], 2);

    let filtered = run_json(
        repo,
        &[
            "filter-corpus",
            "--corpus",
            "corpus.txt",
            "--dictionary",
            "dict.json",
            "--output",
            "filtered.txt",
        ],
    );
    assert_eq!(filtered["written"], 2);
    let content = fs::read_to_string(repo.join("filtered.txt")).expect("filtered");
    // Only tokens shared by both methods survive; `one`/`two` do not.
    assert!(content.contains("method_declaration"));
    assert!(content.contains("OOV_TOKEN"));
    assert!(!content.contains("one"));
}

#[test]
fn assemble_splits_train_and_test_sets() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();
    write_config(repo, "");
    seed_scenario(repo);
    run_json(
        repo,
        &[
            "filter",
            "--input",
            "all_method_changes.csv",
            "--scores",
            "scores.txt",
            "--output",
            "vulnerabilities.csv",
        ],
    );

    let assemble = run_json(
        repo,
        &[
            "assemble",
            "--negatives",
            "all_method_changes.csv",
            "--positives",
            "vulnerabilities.csv",
            "--output",
            "train.csv",
            "--n-positives",
            "1",
            "--test-output",
            "test.csv",
        ],
    );
    assert_eq!(assemble["written"], 3);
    assert_eq!(assemble["positives"], 1);
    assert_eq!(assemble["test_positives"], 1);

    let (_, train) = csv_rows(&repo.join("train.csv"));
    let (_, test) = csv_rows(&repo.join("test.csv"));
    assert_eq!(train.len() + test.len(), 3);
    for row in &test {
        assert!(train.iter().all(|other| other[..3] != row[..3]));
    }

    let output = run_cli(
        repo,
        &[
            "assemble",
            "--negatives",
            "all_method_changes.csv",
            "--positives",
            "vulnerabilities.csv",
            "--output",
            "train.csv",
            "--n-positives",
            "1",
        ],
    );
    assert!(!output.status.success(), "--n-positives needs --test-output");
}
