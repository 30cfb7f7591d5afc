//! Transactional, fault-isolating insertion of normalized records.
//!
//! Each record first goes in as one full-row insert. When that fails the
//! row is rolled back and every column is probed on its own to find the
//! offending values; probes are always rolled back, so a record is either
//! stored whole or not at all.

use rusqlite::{params_from_iter, Transaction};

use crate::db::{Database, Schema};
use crate::error::Result;

use super::diagnostics::{Diagnostic, DiagnosticKind, ErrorSink};
use super::normalize::NormalizedRecord;
use super::CancelFlag;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Committed { identity: String, retried: bool },
    Excluded { identity: String },
}

impl RecordOutcome {
    pub fn identity(&self) -> &str {
        match self {
            RecordOutcome::Committed { identity, .. } | RecordOutcome::Excluded { identity } => {
                identity
            }
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, RecordOutcome::Committed { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    /// Records handed to the engine, whether or not they were attempted.
    pub submitted: usize,
    pub attempted: usize,
    pub committed: usize,
    pub excluded: usize,
    pub retried: usize,
    /// Set when the run was cancelled before every record was attempted.
    pub cancelled: bool,
    pub outcomes: Vec<RecordOutcome>,
}

impl BatchResult {
    pub fn remaining(&self) -> usize {
        self.submitted - self.attempted
    }
}

#[derive(Debug, Clone)]
pub struct InsertionEngine {
    retry_transient: bool,
    cancel: Option<CancelFlag>,
}

impl Default for InsertionEngine {
    fn default() -> Self {
        Self {
            retry_transient: true,
            cancel: None,
        }
    }
}

impl InsertionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry_transient(mut self, retry: bool) -> Self {
        self.retry_transient = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Insert `records` in one transaction.
    ///
    /// Only failing to open or commit the transaction is an error; record
    /// and column failures end up in `sink`. Rows that went in are
    /// committed even when others in the batch were excluded.
    pub fn insert_batch(
        &self,
        db: &mut Database,
        schema: &Schema,
        records: Vec<NormalizedRecord>,
        sink: &ErrorSink,
    ) -> Result<BatchResult> {
        let mut result = BatchResult {
            submitted: records.len(),
            ..BatchResult::default()
        };
        let mut tx = db.conn_mut().transaction()?;

        for record in &records {
            if self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
                result.cancelled = true;
                tracing::info!(remaining = result.submitted - result.attempted, "Batch cancelled");
                break;
            }

            result.attempted += 1;
            let outcome = self.insert_record(&mut tx, schema, record, sink);
            match &outcome {
                RecordOutcome::Committed { retried, .. } => {
                    result.committed += 1;
                    if *retried {
                        result.retried += 1;
                    }
                }
                RecordOutcome::Excluded { .. } => result.excluded += 1,
            }
            result.outcomes.push(outcome);
        }

        tx.commit()?;
        tracing::debug!(
            committed = result.committed,
            excluded = result.excluded,
            "Batch committed"
        );
        Ok(result)
    }

    fn insert_record(
        &self,
        tx: &mut Transaction<'_>,
        schema: &Schema,
        record: &NormalizedRecord,
        sink: &ErrorSink,
    ) -> RecordOutcome {
        let identity = record.identity().to_string();

        if record.len() != schema.len() {
            sink.record(Diagnostic::new(
                DiagnosticKind::RecordExcluded,
                Some(&identity),
                format!(
                    "record has {} values but the schema has {} columns",
                    record.len(),
                    schema.len()
                ),
            ));
            return RecordOutcome::Excluded { identity };
        }

        let fast_error = match insert_row(tx, schema, record) {
            Ok(()) => {
                return RecordOutcome::Committed {
                    identity,
                    retried: false,
                }
            }
            Err(e) => e,
        };
        tracing::debug!(source = %identity, error = %fast_error, "Full-row insert failed, probing columns");

        let column_failures = diagnose_columns(tx, schema, record);
        let rejected = column_failures.len();
        sink.extend(column_failures);

        let cause = if rejected == 0 && self.retry_transient {
            sink.record(Diagnostic::new(
                DiagnosticKind::RecordRetried,
                Some(&identity),
                format!("no column rejected on its own; retrying after: {}", fast_error),
            ));
            match insert_row(tx, schema, record) {
                Ok(()) => {
                    return RecordOutcome::Committed {
                        identity,
                        retried: true,
                    }
                }
                Err(retry_error) => format!("full-row insert failed twice: {}", retry_error),
            }
        } else if rejected == 0 {
            format!("full-row insert failed: {}", fast_error)
        } else {
            format!(
                "full-row insert failed: {}; {} column(s) rejected",
                fast_error, rejected
            )
        };

        sink.record(Diagnostic::new(
            DiagnosticKind::RecordExcluded,
            Some(&identity),
            cause,
        ));
        RecordOutcome::Excluded { identity }
    }
}

/// Full-row insert inside its own savepoint; rolled back on failure.
fn insert_row(
    tx: &mut Transaction<'_>,
    schema: &Schema,
    record: &NormalizedRecord,
) -> rusqlite::Result<()> {
    let sp = tx.savepoint()?;
    {
        let mut stmt = sp.prepare_cached(schema.insert_sql())?;
        stmt.execute(params_from_iter(record.values()))?;
    }
    sp.commit()
}

/// Probe the identity column alone, then each column paired with the
/// identity. Every probe is rolled back.
fn diagnose_columns(
    tx: &mut Transaction<'_>,
    schema: &Schema,
    record: &NormalizedRecord,
) -> Vec<Diagnostic> {
    let mut failures = Vec::new();
    let identity = record.identity();
    let values = record.values();

    match probe(tx, &schema.identity_probe_sql(), &values[..1]) {
        Ok(()) => {}
        Err(e) => {
            // Every other probe carries the identity too.
            failures.push(
                Diagnostic::new(DiagnosticKind::ColumnInsert, Some(identity), e.to_string())
                    .with_column(&schema.identity().name)
                    .with_value(identity),
            );
            return failures;
        }
    }

    for index in 1..schema.len() {
        let params = [values[0].clone(), values[index].clone()];
        if let Err(e) = probe(tx, &schema.column_probe_sql(index), &params) {
            failures.push(
                Diagnostic::new(DiagnosticKind::ColumnInsert, Some(identity), e.to_string())
                    .with_column(&schema.columns()[index].name)
                    .with_value(values[index].to_string()),
            );
        }
    }
    failures
}

fn probe(
    tx: &mut Transaction<'_>,
    sql: &str,
    params: &[super::normalize::CellValue],
) -> rusqlite::Result<()> {
    let sp = tx.savepoint()?;
    sp.execute(sql, params_from_iter(params))?;
    // Dropping the savepoint without committing rolls the probe back.
    drop(sp);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnmappedKeyPolicy;
    use crate::db::SchemaBuilder;
    use crate::ingest::normalize::RecordNormalizer;
    use crate::source::RawRecord;
    use crate::taxonomy::{Taxonomy, DEFAULT_IDENTITY_COLUMN};

    fn taxonomy() -> Taxonomy {
        Taxonomy::parse(
            r#"{"metadata_tags": {
                "cam": {"Model": ["TEXT"], "ISO": ["INTEGER"]},
                "loc": {"GPS-Lat": ["TEXT"]}
            }}"#,
            DEFAULT_IDENTITY_COLUMN,
        )
        .unwrap()
    }

    fn setup(builder: SchemaBuilder) -> (Database, Schema, RecordNormalizer) {
        let taxonomy = taxonomy();
        let db = Database::open_in_memory().unwrap();
        let schema = builder.build(&taxonomy).unwrap();
        SchemaBuilder::ensure_table(&db, &schema).unwrap();
        let normalizer = RecordNormalizer::new(&taxonomy, UnmappedKeyPolicy::Diagnose);
        (db, schema, normalizer)
    }

    fn normalize_all(normalizer: &RecordNormalizer, raws: &[RawRecord]) -> Vec<NormalizedRecord> {
        raws.iter()
            .filter_map(|raw| normalizer.normalize(raw).into_parts().0)
            .collect()
    }

    fn stored_sources(db: &Database) -> Vec<String> {
        let mut stmt = db
            .conn()
            .prepare("SELECT SourceFile FROM photo_metadata ORDER BY rowid")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_clean_record_is_committed() {
        let (mut db, schema, normalizer) = setup(SchemaBuilder::new("photo_metadata"));
        let records = normalize_all(
            &normalizer,
            &[RawRecord::new("a.jpg")
                .with_field("cam", "Model", "X100")
                .with_field("loc", "GPS-Lat", "51.5N")],
        );
        let sink = ErrorSink::new();

        let result = InsertionEngine::new()
            .insert_batch(&mut db, &schema, records, &sink)
            .unwrap();

        assert_eq!(result.committed, 1);
        let (model, lat): (String, String) = db
            .conn()
            .query_row(
                "SELECT cam_Model, loc_GPS_Lat FROM photo_metadata WHERE SourceFile = 'a.jpg'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(model, "X100");
        assert_eq!(lat, "51_5N");
    }

    #[test]
    fn test_partial_batch_durability() {
        let (mut db, schema, normalizer) =
            setup(SchemaBuilder::new("photo_metadata").unique_identity(true));
        let records = normalize_all(
            &normalizer,
            &[
                RawRecord::new("a.jpg").with_field("cam", "Model", "X100"),
                RawRecord::new("a.jpg").with_field("cam", "Model", "Q2"),
                RawRecord::new("c.jpg").with_field("cam", "Model", "M11"),
            ],
        );
        let sink = ErrorSink::new();

        let result = InsertionEngine::new()
            .insert_batch(&mut db, &schema, records, &sink)
            .unwrap();

        assert_eq!(result.committed, 2);
        assert_eq!(result.excluded, 1);
        assert!(!result.outcomes[1].is_committed());
        assert_eq!(stored_sources(&db), vec!["a.jpg", "c.jpg"]);

        let diagnostics = sink.drain();
        let column = diagnostics
            .iter()
            .find(|d| d.kind == DiagnosticKind::ColumnInsert)
            .unwrap();
        assert_eq!(column.column.as_deref(), Some("SourceFile"));
        assert!(column.cause.contains("UNIQUE"));
        assert_eq!(diagnostics.last().unwrap().kind, DiagnosticKind::RecordExcluded);
    }

    #[test]
    fn test_type_mismatch_names_column_and_value() {
        let (mut db, schema, normalizer) = setup(SchemaBuilder::new("photo_metadata").strict(true));
        let records = normalize_all(
            &normalizer,
            &[
                RawRecord::new("a.jpg")
                    .with_field("cam", "Model", "X100")
                    .with_field("cam", "ISO", 200)
                    .with_field("loc", "GPS-Lat", "N"),
                RawRecord::new("b.jpg")
                    .with_field("cam", "Model", "X100")
                    .with_field("cam", "ISO", "abc")
                    .with_field("loc", "GPS-Lat", "N"),
            ],
        );
        let sink = ErrorSink::new();

        let result = InsertionEngine::new()
            .insert_batch(&mut db, &schema, records, &sink)
            .unwrap();

        assert_eq!(result.committed, 1);
        assert_eq!(result.excluded, 1);
        assert_eq!(stored_sources(&db), vec!["a.jpg"]);

        let diagnostics = sink.drain();
        let column_failures: Vec<&Diagnostic> = diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::ColumnInsert)
            .collect();
        assert_eq!(column_failures.len(), 1);
        assert_eq!(column_failures[0].column.as_deref(), Some("cam_ISO"));
        assert_eq!(column_failures[0].value.as_deref(), Some("abc"));
        assert!(column_failures[0].is_about("b.jpg"));
    }

    #[test]
    fn test_divergent_table_reports_missing_column() {
        let taxonomy = taxonomy();
        let mut db = Database::open_in_memory().unwrap();
        db.conn()
            .execute_batch(
                "CREATE TABLE photo_metadata (SourceFile TEXT NOT NULL, cam_Model TEXT, loc_GPS_Lat TEXT)",
            )
            .unwrap();
        let schema = SchemaBuilder::new("photo_metadata").build(&taxonomy).unwrap();
        SchemaBuilder::ensure_table(&db, &schema).unwrap();
        let normalizer = RecordNormalizer::new(&taxonomy, UnmappedKeyPolicy::Diagnose);
        let records = normalize_all(&normalizer, &[RawRecord::new("a.jpg").with_field("cam", "ISO", 100)]);
        let sink = ErrorSink::new();

        let result = InsertionEngine::new()
            .insert_batch(&mut db, &schema, records, &sink)
            .unwrap();

        assert_eq!(result.excluded, 1);
        let diagnostics = sink.drain();
        let columns: Vec<&str> = diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::ColumnInsert)
            .filter_map(|d| d.column.as_deref())
            .collect();
        assert_eq!(columns, vec!["cam_ISO"]);
        assert_eq!(db.row_count("photo_metadata").unwrap(), 0);
    }

    #[test]
    fn test_combination_failure_is_retried_once_then_excluded() {
        let (mut db, schema, normalizer) = setup(SchemaBuilder::new("photo_metadata"));
        db.conn()
            .execute_batch(
                "CREATE TRIGGER reject_combo BEFORE INSERT ON photo_metadata \
                 WHEN NEW.cam_Model = 'X' AND NEW.cam_ISO = 100 \
                 BEGIN SELECT RAISE(ABORT, 'combination rejected'); END;",
            )
            .unwrap();
        let records = normalize_all(
            &normalizer,
            &[RawRecord::new("a.jpg")
                .with_field("cam", "Model", "X")
                .with_field("cam", "ISO", 100)],
        );
        let sink = ErrorSink::new();

        let result = InsertionEngine::new()
            .insert_batch(&mut db, &schema, records.clone(), &sink)
            .unwrap();
        assert_eq!(result.excluded, 1);
        let kinds: Vec<DiagnosticKind> = sink.drain().iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![DiagnosticKind::RecordRetried, DiagnosticKind::RecordExcluded]
        );

        let result = InsertionEngine::new()
            .retry_transient(false)
            .insert_batch(&mut db, &schema, records, &sink)
            .unwrap();
        assert_eq!(result.excluded, 1);
        let kinds: Vec<DiagnosticKind> = sink.drain().iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![DiagnosticKind::RecordExcluded]);
        assert_eq!(db.row_count("photo_metadata").unwrap(), 0);
    }

    #[test]
    fn test_every_failed_record_is_diagnosed() {
        let (mut db, schema, normalizer) =
            setup(SchemaBuilder::new("photo_metadata").unique_identity(true).strict(true));
        let records = normalize_all(
            &normalizer,
            &[
                RawRecord::new("a.jpg").with_field("cam", "ISO", 1),
                RawRecord::new("a.jpg").with_field("cam", "ISO", 2),
                RawRecord::new("b.jpg").with_field("cam", "ISO", "bad"),
            ],
        );
        let sink = ErrorSink::new();

        let result = InsertionEngine::new()
            .insert_batch(&mut db, &schema, records, &sink)
            .unwrap();

        let diagnostics = sink.drain();
        for outcome in result.outcomes.iter().filter(|o| !o.is_committed()) {
            assert!(diagnostics.iter().any(|d| d.is_about(outcome.identity())));
        }
    }

    #[test]
    fn test_cancelled_batch_attempts_nothing() {
        let (mut db, schema, normalizer) = setup(SchemaBuilder::new("photo_metadata"));
        let records = normalize_all(&normalizer, &[RawRecord::new("a.jpg"), RawRecord::new("b.jpg")]);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let sink = ErrorSink::new();

        let result = InsertionEngine::new()
            .with_cancel(cancel)
            .insert_batch(&mut db, &schema, records, &sink)
            .unwrap();

        assert!(result.cancelled);
        assert_eq!(result.attempted, 0);
        assert_eq!(result.remaining(), 2);
        assert_eq!(db.row_count("photo_metadata").unwrap(), 0);
    }
}
