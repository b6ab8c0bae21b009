//! Schema introspection and the schema document handed to the agent.
//!
//! Metadata rows are first folded into a [`SchemaCatalog`] and only then
//! rendered, so the full and fallback paths share one renderer.

use crate::constants::SCHEMA_GUIDELINES;
use crate::database::driver::SqlPool;
use crate::database::query::{QueryExecutor, ResultRow};
use crate::database::types::SqlValue;
use crate::error::ServerError;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use tracing::{debug, info, warn};

/// Column catalog with primary-key flags and foreign-key targets, base tables only.
const FULL_COLUMNS_QUERY: &str = r#"
SELECT
    c.TABLE_SCHEMA AS schema_name,
    c.TABLE_NAME AS table_name,
    c.COLUMN_NAME AS column_name,
    c.DATA_TYPE AS data_type,
    c.CHARACTER_MAXIMUM_LENGTH AS max_length,
    c.IS_NULLABLE AS is_nullable,
    c.COLUMN_DEFAULT AS default_value,
    c.ORDINAL_POSITION AS ordinal_position,
    CASE WHEN pk.COLUMN_NAME IS NOT NULL THEN 1 ELSE 0 END AS is_primary_key,
    fk.referenced AS foreign_key
FROM INFORMATION_SCHEMA.COLUMNS c
INNER JOIN INFORMATION_SCHEMA.TABLES t
    ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME
LEFT JOIN (
    SELECT ku.TABLE_SCHEMA, ku.TABLE_NAME, ku.COLUMN_NAME
    FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
    INNER JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE ku
        ON tc.CONSTRAINT_NAME = ku.CONSTRAINT_NAME
        AND tc.CONSTRAINT_SCHEMA = ku.CONSTRAINT_SCHEMA
    WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
) pk
    ON pk.TABLE_SCHEMA = c.TABLE_SCHEMA
    AND pk.TABLE_NAME = c.TABLE_NAME
    AND pk.COLUMN_NAME = c.COLUMN_NAME
LEFT JOIN (
    SELECT
        OBJECT_SCHEMA_NAME(fkc.parent_object_id) AS TABLE_SCHEMA,
        OBJECT_NAME(fkc.parent_object_id) AS TABLE_NAME,
        COL_NAME(fkc.parent_object_id, fkc.parent_column_id) AS COLUMN_NAME,
        OBJECT_SCHEMA_NAME(fkc.referenced_object_id) + '.'
            + OBJECT_NAME(fkc.referenced_object_id) + '('
            + COL_NAME(fkc.referenced_object_id, fkc.referenced_column_id) + ')' AS referenced
    FROM sys.foreign_key_columns fkc
) fk
    ON fk.TABLE_SCHEMA = c.TABLE_SCHEMA
    AND fk.TABLE_NAME = c.TABLE_NAME
    AND fk.COLUMN_NAME = c.COLUMN_NAME
WHERE t.TABLE_TYPE = 'BASE TABLE'
ORDER BY c.TABLE_SCHEMA, c.TABLE_NAME, c.ORDINAL_POSITION, fk.referenced
"#;

/// Approximate row counts from the heap or clustered index partitions.
const ROW_COUNTS_QUERY: &str = r#"
SELECT
    s.name AS schema_name,
    t.name AS table_name,
    SUM(p.rows) AS row_count
FROM sys.tables t
INNER JOIN sys.schemas s ON t.schema_id = s.schema_id
INNER JOIN sys.partitions p ON p.object_id = t.object_id AND p.index_id IN (0, 1)
GROUP BY s.name, t.name
"#;

/// Columns only; no key joins and no `sys` views.
const FALLBACK_COLUMNS_QUERY: &str = r#"
SELECT
    c.TABLE_SCHEMA AS schema_name,
    c.TABLE_NAME AS table_name,
    c.COLUMN_NAME AS column_name,
    c.DATA_TYPE AS data_type,
    c.CHARACTER_MAXIMUM_LENGTH AS max_length,
    c.IS_NULLABLE AS is_nullable,
    c.COLUMN_DEFAULT AS default_value,
    c.ORDINAL_POSITION AS ordinal_position
FROM INFORMATION_SCHEMA.COLUMNS c
INNER JOIN INFORMATION_SCHEMA.TABLES t
    ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME
WHERE t.TABLE_TYPE = 'BASE TABLE'
ORDER BY c.TABLE_SCHEMA, c.TABLE_NAME, c.ORDINAL_POSITION
"#;

/// Which metadata the catalog was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogMode {
    /// Columns, keys and row counts.
    Full,
    /// Columns only.
    Fallback,
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    /// Character length; `-1` means MAX.
    pub max_length: Option<i64>,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
    /// Targets as `schema.table(column)`.
    pub foreign_keys: Vec<String>,
}

impl ColumnSchema {
    /// `type(length)` as shown in the schema document.
    pub fn type_display(&self) -> String {
        match self.max_length {
            Some(-1) => format!("{}(MAX)", self.data_type),
            Some(len) => format!("{}({})", self.data_type, len),
            None => self.data_type.clone(),
        }
    }
}

/// Base table metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSchema {
    pub schema: String,
    pub name: String,
    /// Approximate row count; `None` when counts were not fetched.
    pub row_count: Option<i64>,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// `schema.table`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Structured catalog of every base table, in schema/table/ordinal order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaCatalog {
    pub tables: Vec<TableSchema>,
    pub mode: CatalogMode,
}

impl SchemaCatalog {
    /// Fold ordered column rows into tables.
    ///
    /// A column repeated on consecutive rows (one per foreign key) is merged.
    /// With `row_counts`, tables missing from the map count as 0.
    pub fn from_rows(
        rows: &[ResultRow],
        row_counts: Option<&HashMap<String, i64>>,
        mode: CatalogMode,
    ) -> Self {
        let mut tables: Vec<TableSchema> = Vec::new();

        for row in rows {
            let schema = extract_string(row, "schema_name").unwrap_or_default();
            let table = extract_string(row, "table_name").unwrap_or_default();
            let column = extract_string(row, "column_name").unwrap_or_default();
            let foreign_key = extract_string(row, "foreign_key");

            let is_new_table = tables
                .last()
                .is_none_or(|t| t.schema != schema || t.name != table);
            if is_new_table {
                let row_count = row_counts.map(|counts| {
                    counts
                        .get(&format!("{}.{}", schema, table))
                        .copied()
                        .unwrap_or(0)
                });
                tables.push(TableSchema {
                    schema,
                    name: table,
                    row_count,
                    columns: Vec::new(),
                });
            }

            let Some(current) = tables.last_mut() else {
                continue;
            };

            if let Some(last) = current.columns.last_mut() {
                if last.name == column {
                    if let Some(target) = foreign_key {
                        if !last.foreign_keys.contains(&target) {
                            last.foreign_keys.push(target);
                        }
                    }
                    continue;
                }
            }

            current.columns.push(ColumnSchema {
                name: column,
                data_type: extract_string(row, "data_type").unwrap_or_default(),
                max_length: row.get("max_length").and_then(SqlValue::as_i64),
                nullable: row
                    .get("is_nullable")
                    .and_then(SqlValue::as_bool)
                    .unwrap_or(true),
                default_value: extract_string(row, "default_value"),
                primary_key: row
                    .get("is_primary_key")
                    .and_then(SqlValue::as_bool)
                    .unwrap_or(false),
                foreign_keys: foreign_key.into_iter().collect(),
            });
        }

        Self { tables, mode }
    }

    pub fn is_fallback(&self) -> bool {
        self.mode == CatalogMode::Fallback
    }
}

/// Rendered schema text, frozen for the lifetime of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDocument {
    text: String,
    table_count: usize,
    mode: CatalogMode,
}

impl SchemaDocument {
    /// Render a catalog.
    pub fn render(catalog: &SchemaCatalog) -> Self {
        let mut out = String::new();

        match catalog.mode {
            CatalogMode::Full => out.push_str("Database Schema:\n"),
            CatalogMode::Fallback => out.push_str(
                "Database Schema (fallback: key and row count metadata unavailable):\n",
            ),
        }

        for table in &catalog.tables {
            out.push('\n');
            match table.row_count {
                Some(count) => {
                    let _ = writeln!(out, "Table: {} (~{} rows)", table.qualified_name(), count);
                }
                None => {
                    let _ = writeln!(out, "Table: {}", table.qualified_name());
                }
            }

            for column in &table.columns {
                let _ = write!(
                    out,
                    "  - {}: {} {}",
                    column.name,
                    column.type_display(),
                    if column.nullable { "NULLABLE" } else { "NOT NULL" }
                );
                if let Some(default) = &column.default_value {
                    let _ = write!(out, " DEFAULT {}", default);
                }
                if column.primary_key {
                    out.push_str(" PK");
                }
                for target in &column.foreign_keys {
                    let _ = write!(out, " FK -> {}", target);
                }
                out.push('\n');
            }
        }

        let _ = writeln!(out, "\nTotal tables: {}", catalog.tables.len());
        out.push_str("\nQuery guidelines:\n");
        for line in SCHEMA_GUIDELINES {
            let _ = writeln!(out, "- {}", line);
        }

        Self {
            text: out,
            table_count: catalog.tables.len(),
            mode: catalog.mode,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn table_count(&self) -> usize {
        self.table_count
    }

    pub fn mode(&self) -> CatalogMode {
        self.mode
    }
}

impl fmt::Display for SchemaDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Builds the schema document for a freshly opened pool.
#[derive(Debug, Clone, Copy)]
pub struct SchemaIntrospector {
    executor: QueryExecutor,
}

impl SchemaIntrospector {
    pub fn new(executor: QueryExecutor) -> Self {
        Self { executor }
    }

    /// Introspect and render.
    pub async fn introspect(&self, pool: &dyn SqlPool) -> Result<SchemaDocument, ServerError> {
        let catalog = self.catalog(pool).await?;
        let document = SchemaDocument::render(&catalog);
        info!(
            "Schema introspected: {} tables ({:?})",
            document.table_count(),
            document.mode()
        );
        Ok(document)
    }

    /// Build the catalog, retrying once with the reduced query on failure.
    pub async fn catalog(&self, pool: &dyn SqlPool) -> Result<SchemaCatalog, ServerError> {
        let primary = match self.full_catalog(pool).await {
            Ok(catalog) => return Ok(catalog),
            Err(e) => e,
        };
        warn!("Full schema query failed, trying fallback: {}", primary);

        self.fallback_catalog(pool).await.map_err(|fallback| {
            ServerError::schema_introspection(primary.to_string(), fallback.to_string())
        })
    }

    async fn full_catalog(&self, pool: &dyn SqlPool) -> Result<SchemaCatalog, ServerError> {
        let columns = self.executor.run(pool, FULL_COLUMNS_QUERY).await?;
        let counts = self.executor.run(pool, ROW_COUNTS_QUERY).await?;

        let row_counts: HashMap<String, i64> = counts
            .rows
            .iter()
            .filter_map(|row| {
                let schema = extract_string(row, "schema_name")?;
                let table = extract_string(row, "table_name")?;
                let count = row.get("row_count").and_then(SqlValue::as_i64)?;
                Some((format!("{}.{}", schema, table), count))
            })
            .collect();
        debug!("Fetched row counts for {} tables", row_counts.len());

        Ok(SchemaCatalog::from_rows(
            &columns.rows,
            Some(&row_counts),
            CatalogMode::Full,
        ))
    }

    async fn fallback_catalog(&self, pool: &dyn SqlPool) -> Result<SchemaCatalog, ServerError> {
        let columns = self.executor.run(pool, FALLBACK_COLUMNS_QUERY).await?;
        Ok(SchemaCatalog::from_rows(
            &columns.rows,
            None,
            CatalogMode::Fallback,
        ))
    }
}

fn extract_string(row: &ResultRow, column: &str) -> Option<String> {
    row.get(column).and_then(SqlValue::as_str).map(str::to_string)
}
