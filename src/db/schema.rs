//! Schema value object and idempotent table creation.
//!
//! A [`Schema`] is derived once from the taxonomy and then used for both
//! `CREATE TABLE` and every `INSERT`, so column order cannot drift between
//! the two.

use crate::error::{Error, Result};
use crate::taxonomy::{sanitize_name, ColumnSpec, Taxonomy};

use super::Database;

/// Types SQLite accepts in a STRICT table.
const STRICT_TYPES: &[&str] = &["INT", "INTEGER", "REAL", "TEXT", "BLOB", "ANY"];

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Clone)]
pub struct Schema {
    table: String,
    columns: Vec<ColumnSpec>,
    strict: bool,
    unique_identity: bool,
    insert_sql: String,
}

impl Schema {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Columns in creation/insert order; index 0 is the identity column.
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn identity(&self) -> &ColumnSpec {
        &self.columns[0]
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(column))
    }

    pub fn create_table_sql(&self) -> String {
        let mut defs = Vec::with_capacity(self.columns.len());
        for (index, column) in self.columns.iter().enumerate() {
            let mut def = format!("{} {}", quote_ident(&column.name), column.declared_type);
            if index == 0 {
                def.push_str(" NOT NULL");
                if self.unique_identity {
                    def.push_str(" UNIQUE");
                }
            }
            defs.push(def);
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({}){}",
            quote_ident(&self.table),
            defs.join(", "),
            if self.strict { " STRICT" } else { "" }
        )
    }

    /// Full-row parameterized insert, parameters bound by schema position.
    pub fn insert_sql(&self) -> &str {
        &self.insert_sql
    }

    /// Insert of the identity column alone.
    pub(crate) fn identity_probe_sql(&self) -> String {
        format!(
            "INSERT INTO {} ({}) VALUES (?1)",
            quote_ident(&self.table),
            quote_ident(&self.identity().name)
        )
    }

    /// Insert of the identity column plus the column at `index`.
    pub(crate) fn column_probe_sql(&self, index: usize) -> String {
        format!(
            "INSERT INTO {} ({}, {}) VALUES (?1, ?2)",
            quote_ident(&self.table),
            quote_ident(&self.identity().name),
            quote_ident(&self.columns[index].name)
        )
    }
}

/// Derives a [`Schema`] from a taxonomy and creates its table.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    table: String,
    strict: bool,
    unique_identity: bool,
}

impl SchemaBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            strict: false,
            unique_identity: false,
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn unique_identity(mut self, unique: bool) -> Self {
        self.unique_identity = unique;
        self
    }

    pub fn build(&self, taxonomy: &Taxonomy) -> Result<Schema> {
        if self.table.is_empty() || sanitize_name(&self.table) != self.table {
            return Err(Error::config(format!(
                "table name '{}' is not a plain identifier",
                self.table
            )));
        }

        let columns = taxonomy.columns();
        if self.strict {
            for column in &columns {
                let upper = column.declared_type.to_ascii_uppercase();
                if !STRICT_TYPES.contains(&upper.as_str()) {
                    return Err(Error::config(format!(
                        "column '{}' has type '{}', which a STRICT table does not accept",
                        column.name, column.declared_type
                    )));
                }
            }
        }

        let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&self.table),
            names.join(", "),
            placeholders.join(", ")
        );

        Ok(Schema {
            table: self.table.clone(),
            columns,
            strict: self.strict,
            unique_identity: self.unique_identity,
            insert_sql,
        })
    }

    /// `CREATE TABLE IF NOT EXISTS`; never alters an existing table.
    pub fn ensure_table(db: &Database, schema: &Schema) -> Result<()> {
        let existed = db.table_exists(schema.table())?;
        db.conn.execute_batch(&schema.create_table_sql())?;
        if existed {
            tracing::debug!(table = %schema.table(), "Table already present");
        } else {
            tracing::info!(
                table = %schema.table(),
                columns = schema.len(),
                "Metadata table created"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::DEFAULT_IDENTITY_COLUMN;

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

    fn table_columns(db: &Database, table: &str) -> Vec<(String, String)> {
        let mut stmt = db
            .conn()
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(1)?, row.get(2)?)))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_create_and_insert_share_column_order() {
        let schema = SchemaBuilder::new("photo_metadata").build(&taxonomy()).unwrap();
        assert_eq!(
            schema.create_table_sql(),
            "CREATE TABLE IF NOT EXISTS \"photo_metadata\" (\"SourceFile\" TEXT NOT NULL, \
             \"cam_Model\" TEXT, \"cam_ISO\" INTEGER, \"loc_GPS_Lat\" TEXT)"
        );
        assert_eq!(
            schema.insert_sql(),
            "INSERT INTO \"photo_metadata\" (\"SourceFile\", \"cam_Model\", \"cam_ISO\", \
             \"loc_GPS_Lat\") VALUES (?1, ?2, ?3, ?4)"
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = SchemaBuilder::new("photo_metadata");
        let a = builder.build(&taxonomy()).unwrap();
        let b = builder.build(&taxonomy()).unwrap();
        assert_eq!(a.column_names(), b.column_names());
        assert_eq!(a.create_table_sql(), b.create_table_sql());
    }

    #[test]
    fn test_ensure_table_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let schema = SchemaBuilder::new("photo_metadata").build(&taxonomy()).unwrap();

        SchemaBuilder::ensure_table(&db, &schema).unwrap();
        db.conn()
            .execute(
                "INSERT INTO photo_metadata (SourceFile) VALUES ('a.jpg')",
                [],
            )
            .unwrap();
        SchemaBuilder::ensure_table(&db, &schema).unwrap();

        assert_eq!(db.row_count("photo_metadata").unwrap(), 1);
        let columns = table_columns(&db, "photo_metadata");
        assert_eq!(
            columns,
            vec![
                ("SourceFile".to_string(), "TEXT".to_string()),
                ("cam_Model".to_string(), "TEXT".to_string()),
                ("cam_ISO".to_string(), "INTEGER".to_string()),
                ("loc_GPS_Lat".to_string(), "TEXT".to_string()),
            ]
        );
    }

    #[test]
    fn test_existing_divergent_table_is_left_alone() {
        let db = Database::open_in_memory().unwrap();
        db.conn()
            .execute_batch("CREATE TABLE photo_metadata (SourceFile TEXT)")
            .unwrap();
        let schema = SchemaBuilder::new("photo_metadata").build(&taxonomy()).unwrap();

        SchemaBuilder::ensure_table(&db, &schema).unwrap();
        assert_eq!(table_columns(&db, "photo_metadata").len(), 1);
    }

    #[test]
    fn test_identity_flags() {
        let schema = SchemaBuilder::new("photos")
            .unique_identity(true)
            .strict(true)
            .build(&taxonomy())
            .unwrap();
        let sql = schema.create_table_sql();
        assert!(sql.contains("\"SourceFile\" TEXT NOT NULL UNIQUE"));
        assert!(sql.ends_with(" STRICT"));
    }

    #[test]
    fn test_strict_rejects_loose_types() {
        let taxonomy = Taxonomy::parse(
            r#"{"metadata_tags": {"cam": {"Model": ["VARCHAR(20)"]}}}"#,
            DEFAULT_IDENTITY_COLUMN,
        )
        .unwrap();
        let err = SchemaBuilder::new("photos").strict(true).build(&taxonomy).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_table_name_must_be_identifier() {
        let err = SchemaBuilder::new("photo metadata; --").build(&taxonomy()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_probe_sql() {
        let schema = SchemaBuilder::new("photo_metadata").build(&taxonomy()).unwrap();
        assert_eq!(
            schema.column_probe_sql(2),
            "INSERT INTO \"photo_metadata\" (\"SourceFile\", \"cam_ISO\") VALUES (?1, ?2)"
        );
        assert_eq!(schema.position("CAM_model"), Some(1));
    }
}
