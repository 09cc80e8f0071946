use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{PipelineError, Result};
use crate::report::{SkipReason, StageReport};
use crate::store::atomic_write;
use crate::syntax::parse_file_methods;

pub const DEFAULT_N_TARGET: usize = 2_000_000;

/// Java sources under `input`, in a stable order. A single file is taken as
/// is whatever its extension.
pub fn java_sources(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    if !input.is_dir() {
        return Err(PipelineError::input_format(input, "not a file or directory"));
    }
    let mut out = WalkDir::new(input)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path().to_path_buf())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().is_some_and(|ext| ext == "java"))
        .collect::<Vec<_>>();
    out.sort();
    Ok(out)
}

/// Writes one comma-joined token line per method found under `input`.
///
/// `total` counts methods seen, `written` the lines emitted. Files that
/// cannot be read are listed as warnings.
pub fn run_flatten(input: &Path, output: &Path, n_target: usize) -> Result<StageReport> {
    let mut report = StageReport::new("flatten");
    let sources = java_sources(input)?;
    report.set("files", sources.len());

    let mut lines = String::new();
    'files: for path in &sources {
        let source = match fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                report.warn(format!("cannot read {}: {err}", path.display()));
                continue;
            }
        };
        let methods = match parse_file_methods(&source) {
            Ok(methods) => methods,
            Err(err) => {
                report.warn(format!("cannot parse {}: {err}", path.display()));
                continue;
            }
        };
        for method in methods {
            if report.written >= n_target {
                break 'files;
            }
            report.total += 1;
            match method {
                Ok(tree) => {
                    lines.push_str(&tree.flatten().join(","));
                    lines.push('\n');
                    report.written += 1;
                }
                Err(err) => {
                    log::debug!("{}: skipping method: {err}", path.display());
                    report.skip(SkipReason::ParseError);
                }
            }
        }
    }

    atomic_write(output, lines.as_bytes())?;
    report.set("n_target", n_target);
    report.warn_if_empty();
    Ok(report)
}
