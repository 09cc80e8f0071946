use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SkipReason {
    MalformedRow,
    InvalidLabel,
    ParseError,
    MissingSide,
    Unchanged,
    Ignored,
    NoMetrics,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedRow => "malformed_row",
            Self::InvalidLabel => "invalid_label",
            Self::ParseError => "parse_error",
            Self::MissingSide => "missing_side",
            Self::Unchanged => "unchanged",
            Self::Ignored => "ignored",
            Self::NoMetrics => "no_metrics",
        }
    }
}

/// Per-run accounting printed at the end of every stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: &'static str,
    pub total: usize,
    pub written: usize,
    pub skipped: BTreeMap<&'static str, usize>,
    pub warnings: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<&'static str, serde_json::Value>,
}

impl StageReport {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            total: 0,
            written: 0,
            skipped: BTreeMap::new(),
            warnings: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn skip(&mut self, reason: SkipReason) {
        *self.skipped.entry(reason.as_str()).or_insert(0) += 1;
    }

    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}: {message}", self.stage);
        self.warnings.push(message);
    }

    pub fn set(&mut self, key: &'static str, value: impl Into<serde_json::Value>) {
        self.extra.insert(key, value.into());
    }

    /// Flags an empty output. An empty file is a valid result but almost
    /// always points at an upstream misconfiguration.
    pub fn warn_if_empty(&mut self) {
        if self.written == 0 {
            self.warn(format!(
                "stage produced no rows out of {} input rows",
                self.total
            ));
        }
    }

    pub fn status(&self) -> &'static str {
        if self.skipped.is_empty() && self.warnings.is_empty() {
            "ok"
        } else {
            "partial"
        }
    }

    pub fn log_summary(&self) {
        let skipped = self
            .skipped
            .iter()
            .map(|(reason, count)| format!("{reason}={count}"))
            .collect::<Vec<_>>()
            .join(", ");
        log::info!(
            "{}: total={} written={} skipped={} [{}]",
            self.stage,
            self.total,
            self.written,
            self.skipped_total(),
            skipped
        );
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.insert("status".to_string(), self.status().into());
            obj.insert("skipped_total".to_string(), self.skipped_total().into());
        }
        value
    }
}
