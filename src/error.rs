use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Fatal errors. Anything raised here aborts the current stage before its
/// output is committed; row-level problems go through `report::SkipReason`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("input format error in {}: {detail}", path.display())]
    InputFormat { path: PathBuf, detail: String },

    #[error("external tool `{tool}` failed: {detail}")]
    ExternalTool { tool: String, detail: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config(detail.into())
    }

    pub fn input_format(path: &Path, detail: impl Into<String>) -> Self {
        Self::InputFormat {
            path: path.to_path_buf(),
            detail: detail.into(),
        }
    }

    pub fn external_tool(tool: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ExternalTool {
            tool: tool.into(),
            detail: detail.into(),
        }
    }

    pub fn csv(path: &Path, err: csv::Error) -> Self {
        Self::input_format(path, err.to_string())
    }

    /// Stable machine-readable code used in the CLI error payload.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::InputFormat { .. } => "input_format_error",
            Self::ExternalTool { .. } => "external_tool_error",
            Self::Io(_) => "io_error",
        }
    }
}
