//! Structured, non-fatal failure records and the append-only sink that
//! collects them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Record had no source-file identifier; dropped.
    MissingIdentity,
    /// A text value was rewritten by sanitization; row still stored.
    ValueSanitized,
    /// A raw key matched no taxonomy tag.
    UnmappedKey,
    /// A column value was rejected by the store on its own.
    ColumnInsert,
    /// A record was left out of the store.
    RecordExcluded,
    /// A record failed once and was retried.
    RecordRetried,
    /// The extractor returned nothing for a file; stored with empty metadata.
    ExtractionFailed,
}

impl DiagnosticKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticKind::MissingIdentity => "missing_identity",
            DiagnosticKind::ValueSanitized => "value_sanitized",
            DiagnosticKind::UnmappedKey => "unmapped_key",
            DiagnosticKind::ColumnInsert => "column_insert",
            DiagnosticKind::RecordExcluded => "record_excluded",
            DiagnosticKind::RecordRetried => "record_retried",
            DiagnosticKind::ExtractionFailed => "extraction_failed",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    /// Position in the sink, assigned on record.
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub kind: DiagnosticKind,
    /// Source-file identifier, when the record had one.
    pub source: Option<String>,
    pub column: Option<String>,
    pub value: Option<String>,
    pub cause: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, source: Option<&str>, cause: impl Into<String>) -> Self {
        Self {
            seq: 0,
            recorded_at: Utc::now(),
            kind,
            source: source.map(str::to_string),
            column: None,
            value: None,
            cause: cause.into(),
        }
    }

    pub fn with_column(mut self, column: &str) -> Self {
        self.column = Some(column.to_string());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn is_about(&self, source: &str) -> bool {
        self.source.as_deref() == Some(source)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}",
            self.kind,
            self.source.as_deref().unwrap_or("<no identifier>")
        )?;
        if let Some(column) = &self.column {
            write!(f, " column={}", column)?;
        }
        if let Some(value) = &self.value {
            write!(f, " value={:?}", value)?;
        }
        write!(f, ": {}", self.cause)
    }
}

#[derive(Debug, Default)]
struct SinkState {
    next_seq: u64,
    entries: Vec<Diagnostic>,
}

/// Append-only diagnostics collector. Recording never fails and never
/// aborts ingestion; entries keep their recording order.
#[derive(Debug, Default)]
pub struct ErrorSink {
    state: Mutex<SinkState>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, mut diagnostic: Diagnostic) {
        log_diagnostic(&diagnostic);

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        diagnostic.seq = state.next_seq;
        diagnostic.recorded_at = Utc::now();
        state.next_seq += 1;
        state.entries.push(diagnostic);
    }

    pub fn extend(&self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        for diagnostic in diagnostics {
            self.record(diagnostic);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the entries without removing them.
    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .clone()
    }

    /// Take all entries, in recording order.
    pub fn drain(&self) -> Vec<Diagnostic> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut state.entries)
    }
}

fn log_diagnostic(d: &Diagnostic) {
    let source = d.source.as_deref().unwrap_or("");
    let column = d.column.as_deref().unwrap_or("");
    match d.kind {
        DiagnosticKind::ValueSanitized | DiagnosticKind::UnmappedKey => {
            tracing::info!(kind = %d.kind, source, column, cause = %d.cause, "Ingest diagnostic")
        }
        _ => tracing::warn!(kind = %d.kind, source, column, cause = %d.cause, "Ingest diagnostic"),
    }
}
