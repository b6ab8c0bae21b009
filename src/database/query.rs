//! Query execution and result handling.

use crate::constants::LOG_SQL_MAX_LEN;
use crate::database::driver::{SqlPool, StatementOutput};
use crate::database::types::SqlValue;
use crate::error::ServerError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A single row of query results.
///
/// Columns keep the order the server returned them in and serialize as a
/// JSON object in that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRow {
    columns: Vec<(String, SqlValue)>,
}

impl ResultRow {
    /// Create a new result row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by column name.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Insert a value. A repeated column name overwrites the earlier value
    /// in place, matching how the row would read as a JSON object.
    pub fn insert(&mut self, column: impl Into<String>, value: SqlValue) {
        let column = column.into();
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((column, value)),
        }
    }

    /// Column names in server order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl Serialize for ResultRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Outcome of running one statement. Exactly one variant, never an `Err`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum QueryResult {
    Success {
        rows: Vec<ResultRow>,
        /// Rows affected as reported by the driver, if it reported any.
        rows_affected: Option<u64>,
        query: String,
    },
    Failure {
        error: String,
        query: String,
    },
}

impl QueryResult {
    /// Wrap driver output for `query`.
    pub fn success(output: StatementOutput, query: impl Into<String>) -> Self {
        Self::Success {
            rows: output.rows,
            rows_affected: output.rows_affected,
            query: query.into(),
        }
    }

    /// Record a failure for `query`.
    pub fn failure(error: impl Into<String>, query: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            query: query.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The SQL text this result answers.
    pub fn query(&self) -> &str {
        match self {
            Self::Success { query, .. } | Self::Failure { query, .. } => query,
        }
    }

    /// Returned rows; empty for failures.
    pub fn rows(&self) -> &[ResultRow] {
        match self {
            Self::Success { rows, .. } => rows,
            Self::Failure { .. } => &[],
        }
    }

    /// The failure message, if this is a failure.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => Some(error),
        }
    }

    /// Affected-row count, falling back to the number of returned rows when
    /// the driver reported nothing (or zero) for a read.
    pub fn rows_affected(&self) -> u64 {
        match self {
            Self::Success {
                rows,
                rows_affected,
                ..
            } => rows_affected
                .filter(|n| *n > 0)
                .unwrap_or(rows.len() as u64),
            Self::Failure { .. } => 0,
        }
    }
}

/// How a statement has to be sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Data or schema change that reports affected-row counts.
    Modification,
    /// Anything that may produce a result set.
    Rows,
    /// DDL that must be the first statement in its batch
    /// (CREATE VIEW, PROCEDURE, FUNCTION, TRIGGER, SCHEMA).
    BatchDdl,
}

static BATCH_DDL: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?i)^(?:CREATE|ALTER|CREATE\s+OR\s+ALTER)\s+(?:VIEW|PROC|PROCEDURE|FUNCTION|TRIGGER|SCHEMA)\b")
});

static MODIFICATION: Lazy<Regex> =
    Lazy::new(|| compile(r"(?i)^(?:INSERT|UPDATE|DELETE|MERGE|TRUNCATE|CREATE|ALTER|DROP)\b"));

static RESULT_SET: Lazy<Regex> = Lazy::new(|| compile(r"(?i)^(?:SELECT|EXEC|EXECUTE)\b"));

// An OUTPUT clause without INTO streams the changed rows back.
static OUTPUT_CLAUSE: Lazy<Regex> =
    Lazy::new(|| compile(r"(?i)\bOUTPUT\s+(?:INSERTED|DELETED|\$ACTION)\b"));

static OUTPUT_INTO: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?i)\bOUTPUT\s+(?:INSERTED|DELETED|\$ACTION)\b[^;]*?\bINTO\s+[@#\w\[]")
});

static CTE_PREFIX: Lazy<Regex> = Lazy::new(|| compile(r"(?i)^WITH\s"));

static AS_KEYWORD: Lazy<Regex> = Lazy::new(|| compile(r"(?i)^AS\b"));

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern)
        .unwrap_or_else(|e| panic!("Internal error: invalid regex pattern '{}': {}", pattern, e))
}

impl StatementKind {
    /// Classify a batch.
    ///
    /// Any statement that yields a result set makes the whole batch `Rows`;
    /// otherwise any data or schema change makes it a `Modification`.
    /// String literals, quoted identifiers and comments never count.
    pub fn classify(sql: &str) -> Self {
        let masked = mask_sql(sql);
        let body = masked.trim_start();

        if BATCH_DDL.is_match(body) {
            return StatementKind::BatchDdl;
        }

        let mut modifies = false;
        for statement in body.split(';') {
            let statement = skip_cte(statement.trim_start());
            if statement.is_empty() {
                continue;
            }
            if RESULT_SET.is_match(statement)
                || (OUTPUT_CLAUSE.is_match(statement) && !OUTPUT_INTO.is_match(statement))
            {
                return StatementKind::Rows;
            }
            modifies |= MODIFICATION.is_match(statement);
        }

        if modifies {
            StatementKind::Modification
        } else {
            StatementKind::Rows
        }
    }
}

/// Blank out comments, string literals and quoted identifiers so only real
/// keywords and statement separators remain.
fn mask_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                out.push(' ');
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                    out.push(' ');
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str("  ");
                let mut prev = '\0';
                for next in chars.by_ref() {
                    out.push(' ');
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            '\'' | '"' | '[' => {
                let close = if c == '[' { ']' } else { c };
                out.push(c);
                while let Some(next) = chars.next() {
                    if next == close {
                        // A doubled closing quote is an escape.
                        if chars.peek() == Some(&close) {
                            chars.next();
                            out.push_str("  ");
                            continue;
                        }
                        out.push(close);
                        break;
                    }
                    out.push(if next == '\n' { '\n' } else { ' ' });
                }
            }
            _ => out.push(c),
        }
    }

    out
}

/// Skip a leading `WITH name [(cols)] AS (...), ...` prefix and return the
/// statement it introduces.
fn skip_cte(statement: &str) -> &str {
    if !CTE_PREFIX.is_match(statement) {
        return statement;
    }

    let mut depth = 0usize;
    for (idx, c) in statement.char_indices() {
        match c {
            '(' => depth += 1,
            ')' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    let rest = statement[idx + 1..].trim_start();
                    if !(rest.starts_with(',') || AS_KEYWORD.is_match(rest)) {
                        return rest;
                    }
                }
            }
            _ => {}
        }
    }

    statement
}

/// Runs caller-supplied SQL under the statement timeout.
#[derive(Debug, Clone, Copy)]
pub struct QueryExecutor {
    timeout: Duration,
}

impl QueryExecutor {
    /// Create an executor with the given statement timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute `sql`, folding every error into a [`QueryResult::Failure`].
    pub async fn execute(&self, pool: &dyn SqlPool, sql: &str) -> QueryResult {
        let start = Instant::now();
        debug!("Executing query: {}", truncate_for_log(sql, LOG_SQL_MAX_LEN));

        match self.run(pool, sql).await {
            Ok(output) => {
                let result = QueryResult::success(output, sql);
                debug!(
                    "Query completed: {} rows ({} affected) in {} ms",
                    result.rows().len(),
                    result.rows_affected(),
                    start.elapsed().as_millis()
                );
                result
            }
            Err(e) => {
                warn!(
                    "Query failed after {} ms: {} ({})",
                    start.elapsed().as_millis(),
                    e,
                    truncate_for_log(sql, LOG_SQL_MAX_LEN)
                );
                QueryResult::failure(e.to_string(), sql)
            }
        }
    }

    /// Run `sql` and keep driver errors as errors.
    pub async fn run(&self, pool: &dyn SqlPool, sql: &str) -> Result<StatementOutput, ServerError> {
        match tokio::time::timeout(self.timeout, pool.run(sql)).await {
            Ok(result) => result,
            Err(_) => Err(ServerError::timeout(self.timeout.as_secs())),
        }
    }
}

/// Truncate a string for logging purposes.
pub(crate) fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
