//! Ingest runs: normalization, batched insertion and diagnostics for one
//! dataset against one store.

pub mod diagnostics;
pub mod insert;
pub mod normalize;

use rayon::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use crate::config::{IngestConfig, StoreConfig};
use crate::db::{Database, Schema, SchemaBuilder};
use crate::error::{Error, Result};
use crate::source::{RawRecord, RecordSource};
use crate::taxonomy::Taxonomy;

pub use diagnostics::{Diagnostic, DiagnosticKind, ErrorSink};
pub use insert::{BatchResult, InsertionEngine, RecordOutcome};
pub use normalize::{sanitize_value, CellValue, Normalized, NormalizedRecord, RecordNormalizer};

/// Shared flag for aborting a run between records.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub enum IngestProgress {
    Started { total_records: usize },
    Batch { processed: usize, total: usize, committed: usize, excluded: usize },
    Completed(RunSummary),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    /// Records that reached a terminal state (committed, excluded or dropped).
    pub processed: usize,
    pub committed: usize,
    /// Failed insertion and were left out.
    pub excluded: usize,
    /// Rejected during normalization (no identifier, rejected keys).
    pub dropped: usize,
    pub retried: usize,
    /// Not yet processed when the run stopped.
    pub remaining: usize,
    pub cancelled: bool,
    pub diagnostics: usize,
}

/// Explicit context for one ingest run.
pub struct IngestRun {
    schema: Schema,
    normalizer: RecordNormalizer,
    engine: InsertionEngine,
    sink: ErrorSink,
    batch_size: usize,
    pool: Option<rayon::ThreadPool>,
    parallel: bool,
    cancel: CancelFlag,
    progress_tx: Option<mpsc::Sender<IngestProgress>>,
}

impl IngestRun {
    pub fn new(taxonomy: &Taxonomy, store: &StoreConfig, ingest: &IngestConfig) -> Result<Self> {
        let schema = SchemaBuilder::new(store.table.clone())
            .strict(store.strict)
            .unique_identity(store.unique_identity)
            .build(taxonomy)?;

        let pool = if ingest.workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(ingest.workers)
                .thread_name(|idx| format!("photometa-normalize-{idx}"))
                .build()
                .map_err(|e| Error::config(format!("cannot start normalization workers: {}", e)))?;
            Some(pool)
        } else {
            None
        };

        let cancel = CancelFlag::new();
        Ok(Self {
            schema,
            normalizer: RecordNormalizer::new(taxonomy, ingest.unmapped_keys),
            engine: InsertionEngine::new()
                .retry_transient(ingest.retry_transient)
                .with_cancel(cancel.clone()),
            sink: ErrorSink::new(),
            batch_size: ingest.batch_size.max(1),
            pool,
            parallel: ingest.workers != 1,
            cancel,
            progress_tx: None,
        })
    }

    pub fn with_progress(mut self, tx: mpsc::Sender<IngestProgress>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// Handle callers can use to abort the run from another thread.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn sink(&self) -> &ErrorSink {
        &self.sink
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.sink.drain()
    }

    fn send(&self, progress: IngestProgress) {
        if let Some(ref tx) = self.progress_tx {
            let _ = tx.send(progress);
        }
    }

    pub fn run_source(&self, db: &mut Database, source: &mut dyn RecordSource) -> Result<RunSummary> {
        tracing::info!(source = %source.describe(), "Reading metadata");
        let records = source.read_records()?;
        self.run(db, records)
    }

    /// Create the table if needed, then normalize and insert `records` in
    /// batches. Partial success is a normal result.
    pub fn run(&self, db: &mut Database, records: Vec<RawRecord>) -> Result<RunSummary> {
        SchemaBuilder::ensure_table(db, &self.schema)?;

        let total = records.len();
        let mut summary = RunSummary {
            total,
            ..RunSummary::default()
        };
        self.send(IngestProgress::Started { total_records: total });

        for chunk in records.chunks(self.batch_size) {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let mut ready = Vec::with_capacity(chunk.len());
            let mut dropped = 0;
            for normalized in self.normalize_chunk(chunk) {
                let (record, diagnostics) = normalized.into_parts();
                self.sink.extend(diagnostics);
                match record {
                    Some(record) => ready.push(record),
                    None => dropped += 1,
                }
            }

            let batch = self.engine.insert_batch(db, &self.schema, ready, &self.sink)?;
            summary.dropped += dropped;
            summary.committed += batch.committed;
            summary.excluded += batch.excluded;
            summary.retried += batch.retried;
            summary.processed += dropped + batch.attempted;

            self.send(IngestProgress::Batch {
                processed: summary.processed,
                total,
                committed: summary.committed,
                excluded: summary.excluded,
            });

            if batch.cancelled {
                summary.cancelled = true;
                break;
            }
        }

        summary.remaining = total - summary.processed;
        summary.diagnostics = self.sink.len();

        if summary.cancelled {
            tracing::warn!(
                processed = summary.processed,
                remaining = summary.remaining,
                "Ingest cancelled"
            );
        } else {
            tracing::info!(
                committed = summary.committed,
                excluded = summary.excluded,
                dropped = summary.dropped,
                diagnostics = summary.diagnostics,
                "Ingest finished"
            );
        }
        self.send(IngestProgress::Completed(summary.clone()));
        Ok(summary)
    }

    /// Order of the output matches `chunk`.
    fn normalize_chunk(&self, chunk: &[RawRecord]) -> Vec<Normalized> {
        if !self.parallel {
            return chunk.iter().map(|raw| self.normalizer.normalize(raw)).collect();
        }
        let normalizer = &self.normalizer;
        let normalize = || {
            chunk
                .par_iter()
                .map(|raw| normalizer.normalize(raw))
                .collect::<Vec<Normalized>>()
        };
        match &self.pool {
            Some(pool) => pool.install(normalize),
            None => normalize(),
        }
    }
}
