use anyhow::Result;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::ingest::{Diagnostic, RunSummary};

/// Diagnostics report formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Csv,
}

impl ReportFormat {
    /// Pick a format from a file extension, defaulting to CSV.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .as_deref()
        {
            Some("json") => ReportFormat::Json,
            _ => ReportFormat::Csv,
        }
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    summary: &'a RunSummary,
    diagnostics: &'a [Diagnostic],
}

/// Write the run summary and diagnostics to `output_path`.
pub fn export_diagnostics(
    summary: &RunSummary,
    diagnostics: &[Diagnostic],
    output_path: &Path,
    format: ReportFormat,
) -> Result<usize> {
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    match format {
        ReportFormat::Json => export_json(summary, diagnostics, output_path)?,
        ReportFormat::Csv => export_csv(diagnostics, output_path)?,
    }

    Ok(diagnostics.len())
}

fn export_json(summary: &RunSummary, diagnostics: &[Diagnostic], output_path: &Path) -> Result<()> {
    let report = JsonReport {
        summary,
        diagnostics,
    };
    let json = serde_json::to_string_pretty(&report)?;
    let mut file = File::create(output_path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

fn export_csv(diagnostics: &[Diagnostic], output_path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(output_path)?;

    wtr.write_record([
        "seq",
        "recorded_at",
        "kind",
        "source",
        "column",
        "value",
        "cause",
    ])?;

    for d in diagnostics {
        wtr.write_record([
            d.seq.to_string().as_str(),
            d.recorded_at.to_rfc3339().as_str(),
            d.kind.as_str(),
            d.source.as_deref().unwrap_or(""),
            d.column.as_deref().unwrap_or(""),
            d.value.as_deref().unwrap_or(""),
            d.cause.as_str(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

/// One-line human summary of a run.
pub fn summary_line(summary: &RunSummary) -> String {
    let mut line = format!(
        "{} of {} records committed, {} excluded, {} dropped, {} diagnostics",
        summary.committed, summary.total, summary.excluded, summary.dropped, summary.diagnostics
    );
    if summary.retried > 0 {
        line.push_str(&format!(", {} retried", summary.retried));
    }
    if summary.cancelled {
        line.push_str(&format!(
            " (cancelled: {} processed, {} remaining)",
            summary.processed, summary.remaining
        ));
    }
    line
}
