//! Tag taxonomy: the declarative group → tag → (type, column) mapping that
//! drives both the table schema and record normalization.
//!
//! The document is JSON:
//!
//! ```json
//! {
//!   "version": 1,
//!   "metadata_tags": {
//!     "exif": { "Model": ["TEXT", "Model"], "ISO": ["INTEGER"] },
//!     "iptc": { "By-line": { "type": "TEXT", "column": "Byline" } }
//!   }
//! }
//! ```
//!
//! Document order is preserved and becomes column order. A taxonomy is
//! validated once on load and is immutable afterwards.

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;

use crate::error::{Error, Result};

/// Name of the identity column holding the source file path.
pub const DEFAULT_IDENTITY_COLUMN: &str = "SourceFile";

const SUPPORTED_VERSION: u32 = 1;

const BUILTIN_TAXONOMY: &str = include_str!("../tags.json");

/// How the normalizer treats values for a column.
///
/// Derived from the declared SQL type using SQLite's affinity rules:
/// anything with TEXT affinity is text-like, everything else is passed
/// through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Numeric,
}

impl ValueKind {
    pub fn from_declared_type(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            return ValueKind::Numeric;
        }
        if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            ValueKind::Text
        } else {
            ValueKind::Numeric
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagDefinition {
    pub group: String,
    /// Tag name as it appears in source records.
    pub tag: String,
    pub declared_type: String,
    /// Canonical, group-qualified column name.
    pub column: String,
    pub kind: ValueKind,
}

impl TagDefinition {
    /// `group:tag`, used in messages.
    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.group, self.tag)
    }
}

#[derive(Debug, Clone)]
pub struct TagGroup {
    pub name: String,
    pub tags: Vec<TagDefinition>,
}

/// One schema column as derived from the taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub declared_type: String,
    pub kind: ValueKind,
    /// `None` for the identity column.
    pub group: Option<String>,
    pub tag: Option<String>,
}

impl ColumnSpec {
    pub fn is_identity(&self) -> bool {
        self.group.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Taxonomy {
    version: u32,
    identity_column: String,
    groups: Vec<TagGroup>,
}

#[derive(Debug, Deserialize)]
struct TaxonomyDocument {
    #[serde(default = "default_version")]
    version: u32,
    metadata_tags: Entries<Entries<Value>>,
}

/// A JSON object kept in document order. Repeated keys are an error
/// instead of silently replacing the earlier value.
#[derive(Debug)]
struct Entries<V>(Vec<(String, V)>);

impl<'de, V: Deserialize<'de>> Deserialize<'de> for Entries<V> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntriesVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for EntriesVisitor<V> {
            type Value = Entries<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut seen = HashSet::new();
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(key) = map.next_key::<String>()? {
                    if !seen.insert(key.clone()) {
                        return Err(de::Error::custom(format!("duplicate key '{}'", key)));
                    }
                    let value = map.next_value()?;
                    entries.push((key, value));
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

fn default_version() -> u32 {
    SUPPORTED_VERSION
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TagEntry {
    /// `["TEXT", "Column"]` or `["TEXT"]`
    Short(Vec<String>),
    Detailed {
        #[serde(rename = "type")]
        declared_type: String,
        #[serde(default)]
        column: Option<String>,
    },
}

impl Taxonomy {
    /// Load a taxonomy document from disk.
    pub fn load(path: &Path, identity_column: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read taxonomy {}: {}", path.display(), e))
        })?;
        let taxonomy = Self::parse(&content, identity_column)?;
        tracing::info!(
            path = %path.display(),
            groups = taxonomy.groups.len(),
            tags = taxonomy.tag_count(),
            "Taxonomy loaded"
        );
        Ok(taxonomy)
    }

    /// The taxonomy shipped with the crate (exif, iptc and xmp groups).
    pub fn builtin(identity_column: &str) -> Result<Self> {
        Self::parse(BUILTIN_TAXONOMY, identity_column)
    }

    pub fn parse(content: &str, identity_column: &str) -> Result<Self> {
        let document: TaxonomyDocument = serde_json::from_str(content)
            .map_err(|e| Error::config(format!("malformed taxonomy document: {}", e)))?;

        if document.version != SUPPORTED_VERSION {
            return Err(Error::config(format!(
                "unsupported taxonomy version {} (expected {})",
                document.version, SUPPORTED_VERSION
            )));
        }

        if identity_column.is_empty() || sanitize_name(identity_column) != identity_column {
            return Err(Error::config(format!(
                "identity column '{}' is not a plain identifier",
                identity_column
            )));
        }

        if document.metadata_tags.0.is_empty() {
            return Err(Error::config("taxonomy declares no tag groups"));
        }

        let mut groups = Vec::with_capacity(document.metadata_tags.0.len());
        for (group_name, tags) in &document.metadata_tags.0 {
            groups.push(parse_group(group_name, tags)?);
        }

        let taxonomy = Self {
            version: document.version,
            identity_column: identity_column.to_string(),
            groups,
        };
        taxonomy.validate()?;
        Ok(taxonomy)
    }

    fn validate(&self) -> Result<()> {
        let mut seen_groups: HashMap<String, &str> = HashMap::new();
        for group in &self.groups {
            if let Some(previous) = seen_groups.insert(group.name.to_ascii_lowercase(), &group.name) {
                return Err(Error::config(format!(
                    "groups '{}' and '{}' differ only by case",
                    previous, group.name
                )));
            }
        }

        // SQLite compares identifiers case-insensitively.
        let mut seen_columns: HashMap<String, String> = HashMap::new();
        seen_columns.insert(
            self.identity_column.to_ascii_lowercase(),
            format!("identity column {}", self.identity_column),
        );
        for tag in self.tags() {
            let key = tag.column.to_ascii_lowercase();
            if let Some(first) = seen_columns.get(&key) {
                return Err(Error::SchemaConflict {
                    first: first.clone(),
                    second: tag.qualified_name(),
                    column: tag.column.clone(),
                });
            }
            seen_columns.insert(key, tag.qualified_name());
        }
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn identity_column(&self) -> &str {
        &self.identity_column
    }

    pub fn groups(&self) -> &[TagGroup] {
        &self.groups
    }

    /// All tag definitions in group-then-tag order.
    pub fn tags(&self) -> impl Iterator<Item = &TagDefinition> {
        self.groups.iter().flat_map(|g| g.tags.iter())
    }

    pub fn tag_count(&self) -> usize {
        self.groups.iter().map(|g| g.tags.len()).sum()
    }

    /// Ordered column list with the identity column first.
    pub fn columns(&self) -> Vec<ColumnSpec> {
        let mut columns = Vec::with_capacity(self.tag_count() + 1);
        columns.push(ColumnSpec {
            name: self.identity_column.clone(),
            declared_type: "TEXT".to_string(),
            kind: ValueKind::Text,
            group: None,
            tag: None,
        });
        columns.extend(self.tags().map(|tag| ColumnSpec {
            name: tag.column.clone(),
            declared_type: tag.declared_type.clone(),
            kind: tag.kind,
            group: Some(tag.group.clone()),
            tag: Some(tag.tag.clone()),
        }));
        columns
    }
}

fn parse_group(group_name: &str, tags: &Entries<Value>) -> Result<TagGroup> {
    if group_name.trim().is_empty() {
        return Err(Error::config("taxonomy contains a group with an empty name"));
    }
    let tags = &tags.0;
    if tags.is_empty() {
        return Err(Error::config(format!("group '{}' declares no tags", group_name)));
    }

    let prefix = sanitize_name(group_name);
    let mut definitions = Vec::with_capacity(tags.len());
    for (tag_name, entry) in tags {
        if tag_name.trim().is_empty() {
            return Err(Error::config(format!(
                "group '{}' contains a tag with an empty name",
                group_name
            )));
        }
        let entry: TagEntry = serde_json::from_value(entry.clone()).map_err(|_| {
            Error::config(format!(
                "tag '{}:{}' must be [\"TYPE\", \"column\"] or {{\"type\": ..}}",
                group_name, tag_name
            ))
        })?;
        let (declared_type, fragment) = match entry {
            TagEntry::Short(parts) => match parts.as_slice() {
                [declared] => (declared.clone(), None),
                [declared, column] => (declared.clone(), Some(column.clone())),
                _ => {
                    return Err(Error::config(format!(
                        "tag '{}:{}' must list a type and an optional column name",
                        group_name, tag_name
                    )))
                }
            },
            TagEntry::Detailed { declared_type, column } => (declared_type, column),
        };

        let declared_type = declared_type.trim().to_string();
        validate_declared_type(group_name, tag_name, &declared_type)?;

        let fragment = fragment
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| tag_name.clone());
        let column = format!("{}_{}", prefix, sanitize_name(fragment.trim()));

        definitions.push(TagDefinition {
            group: group_name.to_string(),
            tag: tag_name.clone(),
            kind: ValueKind::from_declared_type(&declared_type),
            declared_type,
            column,
        });
    }

    Ok(TagGroup {
        name: group_name.to_string(),
        tags: definitions,
    })
}

fn validate_declared_type(group: &str, tag: &str, declared: &str) -> Result<()> {
    if declared.is_empty() {
        return Err(Error::config(format!(
            "tag '{}:{}' has an empty declared type",
            group, tag
        )));
    }
    // Declared types are emitted verbatim into DDL.
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, ' ' | '(' | ')' | ',' | '_');
    if !declared.chars().all(allowed) {
        return Err(Error::config(format!(
            "tag '{}:{}' has an invalid declared type '{}'",
            group, tag, declared
        )));
    }
    Ok(())
}

/// Replace every character outside `[A-Za-z0-9_]` with `_`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Case- and punctuation-insensitive form of a key, used for lookups.
pub(crate) fn fold_key(key: &str) -> String {
    sanitize_name(key.trim()).to_ascii_lowercase()
}
