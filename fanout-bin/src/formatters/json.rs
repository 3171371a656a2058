use anyhow::{Context, Result};

use super::{Report, ReportFormatter};

/// A single pretty printed JSON document
pub(crate) struct Json;

impl ReportFormatter for Json {
    fn format(&self, report: &Report<'_>) -> Result<String> {
        serde_json::to_string_pretty(report).context("Cannot format report as JSON")
    }
}
