//! Human-readable rendering of reported results.

use std::str::FromStr;

use serde_json::Value as JsonValue;

use crate::error::{Result, StoreError};

/// Formatter applied to each reported result; chosen at manager
/// construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResultFormatter {
    #[default]
    Default,
    Markdown,
}

impl ResultFormatter {
    pub fn format(
        &self,
        pipeline_name: &str,
        record_identifier: &str,
        res_id: &str,
        value: &JsonValue,
    ) -> String {
        match self {
            Self::Default => default_formatter(pipeline_name, record_identifier, res_id, value),
            Self::Markdown => markdown_formatter(pipeline_name, record_identifier, res_id, value),
        }
    }
}

impl FromStr for ResultFormatter {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Self::Default),
            "markdown" => Ok(Self::Markdown),
            other => Err(StoreError::config(format!(
                "Unknown result formatter: {other}"
            ))),
        }
    }
}

pub fn default_formatter(
    pipeline_name: &str,
    record_identifier: &str,
    res_id: &str,
    value: &JsonValue,
) -> String {
    format!(
        "Reported records for '{record_identifier}' in '{pipeline_name}' namespace:\n - {res_id}: {}",
        render_value(value)
    )
}

pub fn markdown_formatter(
    pipeline_name: &str,
    record_identifier: &str,
    res_id: &str,
    value: &JsonValue,
) -> String {
    format!(
        "Reported records for `{record_identifier}` in `{pipeline_name}` namespace:\n - `{res_id}`: `{}`",
        render_value(value)
    )
}

// Strings render bare; everything else renders as compact JSON.
fn render_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
