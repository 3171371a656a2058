use std::fmt::Write;

use anyhow::Result;
use fanout_lib::{Completion, TimingBreakdown};

use super::{Report, ReportFormatter, ResultView, format_elapsed};

/// Human readable output
pub(crate) struct Plain;

impl ReportFormatter for Plain {
    /// The per-request lines were streamed while the batch ran, so this is
    /// only the summary and the timings.
    fn format(&self, report: &Report<'_>) -> Result<String> {
        let mut out = String::new();
        writeln!(
            out,
            "{} Total, {} OK, {} Errors",
            report.total, report.successful, report.failed
        )?;
        if !report.unresolved.is_empty() {
            writeln!(
                out,
                "{} Unresolved: {}",
                report.unresolved.len(),
                report.unresolved.join(", ")
            )?;
        }
        if let Some(stats) = &report.stats {
            writeln!(out)?;
            writeln!(out, "Timings")?;
            for (key, breakdown) in &stats.requests {
                writeln!(out, "{key}: {}", breakdown_line(breakdown))?;
            }
            if let (Some(average), Some(median)) = (&stats.average_total, &stats.median_total) {
                writeln!(out, "Average {average}, median {median}")?;
            }
        }
        Ok(out)
    }
}

/// The line printed when a request completes, followed by its headers if
/// they were collected
pub(crate) fn completion_line(completion: &Completion) -> String {
    let view = ResultView::from(completion);
    let mut line = match (view.status, view.error) {
        (_, Some(error)) => format!("[ERR] {} | {error}", view.key),
        (Some(status), None) => format!("[{status}] {}", view.key),
        (None, None) => format!("[???] {}", view.key),
    };
    if view.error.is_none() && view.effective_url != view.url {
        line.push_str(" -> ");
        line.push_str(view.effective_url);
    }
    line.push_str(" | ");
    line.push_str(&view.elapsed);
    for (name, value) in view.headers.iter().flatten() {
        line.push_str("\n    ");
        line.push_str(name);
        line.push_str(": ");
        line.push_str(value);
    }
    line
}

fn breakdown_line(b: &TimingBreakdown) -> String {
    let phases = [
        ("dns", &b.dns),
        ("connect", &b.connect),
        ("tls", &b.tls),
        ("wait", &b.wait),
        ("transfer", &b.transfer),
        ("redirect", &b.redirect),
    ];
    let phases: Vec<String> = phases
        .iter()
        .map(|(name, phase)| {
            format!("{name} {} ({:.1}%)", format_elapsed(phase.time), phase.percent)
        })
        .collect();
    format!("{} total, {}", format_elapsed(b.total), phases.join(", "))
}
