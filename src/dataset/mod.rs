//! Method-change datasets: the flat CSV files passed between stages.
//!
//! Every change file carries the same five columns; labeled files add
//! `label`. Extra columns are tolerated on read so that later stages can
//! pass through what earlier ones appended.

pub mod assemble;
pub mod filter;
pub mod scores;

use std::fs::File;
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::report::{SkipReason, StageReport};

pub const FILE_PATH: &str = "file_path";
pub const METHOD: &str = "method";
pub const COMMIT: &str = "commit";
pub const BEFORE_TEXT: &str = "before_text";
pub const AFTER_TEXT: &str = "after_text";
pub const LABEL: &str = "label";

pub const CHANGE_COLUMNS: [&str; 5] = [FILE_PATH, METHOD, COMMIT, BEFORE_TEXT, AFTER_TEXT];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodKey {
    pub file_path: String,
    pub method: String,
    pub commit: String,
}

impl std::fmt::Display for MethodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.file_path, self.method, self.commit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodChange {
    pub file_path: String,
    pub method: String,
    pub commit: String,
    pub before_text: String,
    pub after_text: String,
}

impl MethodChange {
    pub fn key(&self) -> MethodKey {
        MethodKey {
            file_path: self.file_path.clone(),
            method: self.method.clone(),
            commit: self.commit.clone(),
        }
    }

    fn fields(&self) -> [&str; 5] {
        [
            &self.file_path,
            &self.method,
            &self.commit,
            &self.before_text,
            &self.after_text,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Positive,
    Negative,
}

impl Label {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "1",
            Self::Negative => "0",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "1" => Some(Self::Positive),
            "0" => Some(Self::Negative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledExample {
    pub change: MethodChange,
    pub label: Label,
}

/// Column positions of the change fields inside one concrete file.
#[derive(Debug, Clone)]
pub struct ChangeColumns {
    indices: [usize; 5],
    label: Option<usize>,
}

impl ChangeColumns {
    pub fn from_headers(
        path: &Path,
        headers: &csv::StringRecord,
        require_label: bool,
    ) -> Result<Self> {
        let position = |name: &str| headers.iter().position(|header| header.trim() == name);

        let mut missing = Vec::new();
        let mut indices = [0usize; 5];
        for (slot, name) in indices.iter_mut().zip(CHANGE_COLUMNS) {
            match position(name) {
                Some(idx) => *slot = idx,
                None => missing.push(name),
            }
        }
        let label = position(LABEL);
        if require_label && label.is_none() {
            missing.push(LABEL);
        }
        if !missing.is_empty() {
            return Err(PipelineError::input_format(
                path,
                format!("missing required columns: {}", missing.join(", ")),
            ));
        }
        Ok(Self { indices, label })
    }

    pub fn change(&self, record: &csv::StringRecord) -> Option<MethodChange> {
        let field = |idx: usize| record.get(self.indices[idx]).map(ToOwned::to_owned);
        Some(MethodChange {
            file_path: field(0)?,
            method: field(1)?,
            commit: field(2)?,
            before_text: field(3)?,
            after_text: field(4)?,
        })
    }

    pub fn label(&self, record: &csv::StringRecord) -> Option<Label> {
        record.get(self.label?).and_then(Label::parse)
    }
}

pub fn open_reader(path: &Path) -> Result<csv::Reader<File>> {
    let file = File::open(path)
        .map_err(|err| PipelineError::input_format(path, format!("cannot open: {err}")))?;
    Ok(csv::ReaderBuilder::new().has_headers(true).from_reader(file))
}

/// Reads a change file. Rows that cannot be decoded are skipped and counted
/// on `report` rather than failing the stage.
pub fn read_changes(path: &Path, report: &mut StageReport) -> Result<Vec<MethodChange>> {
    let mut reader = open_reader(path)?;
    let headers = reader
        .headers()
        .map_err(|err| PipelineError::csv(path, err))?
        .clone();
    let columns = ChangeColumns::from_headers(path, &headers, false)?;

    let mut out = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        report.total += 1;
        let decoded = record.ok().and_then(|record| columns.change(&record));
        match decoded {
            Some(change) => out.push(change),
            None => {
                log::debug!("{}: row {} is malformed", path.display(), idx + 1);
                report.skip(SkipReason::MalformedRow);
            }
        }
    }
    Ok(out)
}

/// Reads a labeled file, keeping each row's full record so that stages which
/// append columns can pass the original ones through untouched.
pub fn read_labeled(path: &Path, report: &mut StageReport) -> Result<LabeledFile> {
    let mut reader = open_reader(path)?;
    let headers = reader
        .headers()
        .map_err(|err| PipelineError::csv(path, err))?
        .clone();
    let columns = ChangeColumns::from_headers(path, &headers, true)?;

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        report.total += 1;
        let Ok(record) = record else {
            log::debug!("{}: row {} is malformed", path.display(), idx + 1);
            report.skip(SkipReason::MalformedRow);
            continue;
        };
        let Some(change) = columns.change(&record) else {
            report.skip(SkipReason::MalformedRow);
            continue;
        };
        let Some(label) = columns.label(&record) else {
            log::debug!("{}: row {} has an invalid label", path.display(), idx + 1);
            report.skip(SkipReason::InvalidLabel);
            continue;
        };
        rows.push(LabeledRow {
            example: LabeledExample { change, label },
            record,
        });
    }
    Ok(LabeledFile { headers, rows })
}

#[derive(Debug, Clone)]
pub struct LabeledRow {
    pub example: LabeledExample,
    pub record: csv::StringRecord,
}

#[derive(Debug, Clone)]
pub struct LabeledFile {
    pub headers: csv::StringRecord,
    pub rows: Vec<LabeledRow>,
}

pub fn changes_to_csv(changes: &[MethodChange]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    write_row(&mut writer, CHANGE_COLUMNS)?;
    for change in changes {
        write_row(&mut writer, change.fields())?;
    }
    finish(writer)
}

pub fn examples_to_csv(examples: &[LabeledExample]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = CHANGE_COLUMNS.to_vec();
    header.push(LABEL);
    write_row(&mut writer, header)?;
    for example in examples {
        let mut row = example.change.fields().to_vec();
        row.push(example.label.as_str());
        write_row(&mut writer, row)?;
    }
    finish(writer)
}

pub(crate) fn write_row<I, T>(writer: &mut csv::Writer<Vec<u8>>, row: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    writer
        .write_record(row)
        .map_err(|err| PipelineError::Io(std::io::Error::other(err.to_string())))
}

pub(crate) fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>> {
    writer
        .into_inner()
        .map_err(|err| PipelineError::Io(err.into_error()))
}
