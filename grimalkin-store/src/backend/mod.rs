//! Storage backend contract
//!
//! The core talks to a partitioned wide-column store through typed
//! [`Statement`]s instead of query strings:
//! - rows live in partitions addressed by the partition key, ordered inside
//!   the partition by the clustering key
//! - inserts and updates are upserts, deletes are idempotent
//! - counter columns only accept signed deltas
//! - conditional writes answer with a single `[applied]` row
//! - batches are either logged (regular writes) or counter-only
//!
//! Two implementations exist: [`postgres`] for a networked cluster and
//! [`memory`] for an in-process engine used by tests and the demo.

pub mod memory;
pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grimalkin_core::StorageUuid;
use thiserror::Error;

/// Column storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Boolean,
    /// Time-ordered UUID, 16-byte binary form
    TimeUuid,
    Timestamp,
    /// Delta-only 64-bit counter
    Counter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

impl Column {
    pub const fn new(name: &'static str, kind: ColumnKind) -> Self {
        Self { name, kind }
    }
}

/// Static description of one table.
#[derive(Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: &'static [Column],
    pub partition_key: &'static [&'static str],
    pub clustering_key: &'static [&'static str],
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Partition columns followed by clustering columns.
    pub fn primary_key(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.partition_key
            .iter()
            .chain(self.clustering_key.iter())
            .copied()
    }

    pub fn is_key(&self, name: &str) -> bool {
        self.primary_key().any(|k| k == name)
    }

    pub fn is_counter_table(&self) -> bool {
        self.columns.iter().any(|c| c.kind == ColumnKind::Counter)
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Value {
    Null,
    Text(String),
    Boolean(bool),
    Uuid(StorageUuid),
    Timestamp(DateTime<Utc>),
    BigInt(i64),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn uuid(id: uuid::Uuid) -> Self {
        Self::Uuid(grimalkin_core::encode(id))
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Text(_) => "text",
            Self::Boolean(_) => "boolean",
            Self::Uuid(_) => "uuid",
            Self::Timestamp(_) => "timestamp",
            Self::BigInt(_) => "bigint",
        }
    }
}

/// Column name and value.
pub type Cell = (&'static str, Value);

/// Column of the row a conditional write answers with.
pub const APPLIED: &str = "[applied]";

/// One result row, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    cells: BTreeMap<&'static str, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcome row of a conditional write.
    pub fn applied(applied: bool) -> Self {
        Self::new().with(APPLIED, Value::Boolean(applied))
    }

    pub fn with(mut self, column: &'static str, value: Value) -> Self {
        self.cells.insert(column, value);
        self
    }

    pub fn set(&mut self, column: &'static str, value: Value) {
        self.cells.insert(column, value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.cells.get(column)
    }

    pub fn cells(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.cells.iter().map(|(k, v)| (*k, v))
    }

    pub fn into_cells(self) -> impl Iterator<Item = Cell> {
        self.cells.into_iter()
    }

    pub fn text(&self, column: &'static str) -> Result<String, BackendError> {
        match self.get(column) {
            Some(Value::Text(s)) => Ok(s.clone()),
            other => Err(BackendError::decode(column, "text", other)),
        }
    }

    pub fn boolean(&self, column: &'static str) -> Result<bool, BackendError> {
        match self.get(column) {
            Some(Value::Boolean(b)) => Ok(*b),
            other => Err(BackendError::decode(column, "boolean", other)),
        }
    }

    pub fn storage_uuid(&self, column: &'static str) -> Result<&StorageUuid, BackendError> {
        match self.get(column) {
            Some(Value::Uuid(u)) => Ok(u),
            other => Err(BackendError::decode(column, "uuid", other)),
        }
    }

    pub fn timestamp(&self, column: &'static str) -> Result<DateTime<Utc>, BackendError> {
        match self.get(column) {
            Some(Value::Timestamp(t)) => Ok(*t),
            other => Err(BackendError::decode(column, "timestamp", other)),
        }
    }

    /// Counter value; a null counter reads as zero.
    pub fn counter(&self, column: &'static str) -> Result<i64, BackendError> {
        match self.get(column) {
            Some(Value::BigInt(n)) => Ok(*n),
            Some(Value::Null) | None => Ok(0),
            other => Err(BackendError::decode(column, "counter", other)),
        }
    }
}

/// Partition (and optionally clustering) read.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: &'static TableSchema,
    /// Equality on a prefix of the primary key; empty scans the table
    pub key: Vec<Cell>,
    /// Text column that must start with the given prefix
    pub prefix: Option<(&'static str, String)>,
    pub descending: bool,
    pub limit: Option<u32>,
}

impl Select {
    pub fn partition(table: &'static TableSchema, key: Vec<Cell>) -> Self {
        Self {
            table,
            key,
            prefix: None,
            descending: false,
            limit: None,
        }
    }

    pub fn newest_first(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn limit(mut self, limit: Option<u32>) -> Self {
        self.limit = limit;
        self
    }

    pub fn starting_with(mut self, column: &'static str, prefix: impl Into<String>) -> Self {
        self.prefix = Some((column, prefix.into()));
        self
    }
}

/// A unit of work against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Create the namespace tables live in, if absent
    CreateKeyspace,
    /// Create a table, if absent
    CreateTable(&'static TableSchema),
    /// Upsert a full row
    Insert {
        table: &'static TableSchema,
        row: Row,
    },
    /// Insert a full row unless one with the same key exists
    InsertIfAbsent {
        table: &'static TableSchema,
        row: Row,
    },
    /// Upsert selected regular columns of the row at `key`
    Update {
        table: &'static TableSchema,
        key: Vec<Cell>,
        set: Vec<Cell>,
    },
    /// Delete a row (full key) or a partition (partition key only)
    Delete {
        table: &'static TableSchema,
        key: Vec<Cell>,
    },
    /// Delete the row at a full key, reporting whether it was there
    DeleteIfExists {
        table: &'static TableSchema,
        key: Vec<Cell>,
    },
    /// Apply a signed delta to a counter column
    CounterAdd {
        table: &'static TableSchema,
        key: Vec<Cell>,
        column: &'static str,
        delta: i64,
    },
    Select(Select),
}

impl Statement {
    pub fn table(&self) -> Option<&'static TableSchema> {
        match self {
            Self::CreateKeyspace => None,
            Self::CreateTable(t) => Some(*t),
            Self::Insert { table, .. }
            | Self::InsertIfAbsent { table, .. }
            | Self::Update { table, .. }
            | Self::Delete { table, .. }
            | Self::DeleteIfExists { table, .. }
            | Self::CounterAdd { table, .. } => Some(*table),
            Self::Select(s) => Some(s.table),
        }
    }

    pub fn is_write(&self) -> bool {
        self.is_conditional()
            || matches!(
                self,
                Self::Insert { .. }
                    | Self::Update { .. }
                    | Self::Delete { .. }
                    | Self::CounterAdd { .. }
            )
    }

    /// Writes whose outcome depends on the current row.
    pub fn is_conditional(&self) -> bool {
        matches!(self, Self::InsertIfAbsent { .. } | Self::DeleteIfExists { .. })
    }

    /// Reject statements that do not fit their table before they are sent.
    pub fn check(&self) -> Result<(), BackendError> {
        let Some(table) = self.table() else {
            return Ok(());
        };
        let unknown = |column: &str| -> Result<(), BackendError> {
            if table.column(column).is_none() {
                return Err(BackendError::invalid(
                    table.name,
                    format!("unknown column '{column}'"),
                ));
            }
            Ok(())
        };
        let full_key = |key: &[Cell]| -> Result<(), BackendError> {
            let expected: Vec<&str> = table.primary_key().collect();
            let given: Vec<&str> = key.iter().map(|(c, _)| *c).collect();
            if expected != given {
                return Err(BackendError::invalid(
                    table.name,
                    format!("expected key {expected:?}, got {given:?}"),
                ));
            }
            Ok(())
        };
        let key_prefix = |key: &[Cell]| -> Result<(), BackendError> {
            let valid = key
                .iter()
                .zip(table.primary_key())
                .all(|((c, _), k)| *c == k);
            if !valid || key.len() > table.primary_key().count() {
                return Err(BackendError::invalid(table.name, "key is not a primary key prefix"));
            }
            Ok(())
        };

        match self {
            Self::CreateKeyspace | Self::CreateTable(_) => Ok(()),
            Self::Insert { row, .. } | Self::InsertIfAbsent { row, .. } => {
                if table.is_counter_table() {
                    return Err(BackendError::invalid(
                        table.name,
                        "counter tables only accept deltas",
                    ));
                }
                for (column, _) in row.cells() {
                    unknown(column)?;
                }
                for key in table.primary_key() {
                    if matches!(row.get(key), None | Some(Value::Null)) {
                        return Err(BackendError::invalid(
                            table.name,
                            format!("missing key column '{key}'"),
                        ));
                    }
                }
                Ok(())
            }
            Self::Update { key, set, .. } => {
                full_key(key)?;
                if table.is_counter_table() {
                    return Err(BackendError::invalid(
                        table.name,
                        "counter tables only accept deltas",
                    ));
                }
                for (column, _) in set {
                    unknown(column)?;
                    if table.is_key(column) {
                        return Err(BackendError::invalid(
                            table.name,
                            format!("cannot update key column '{column}'"),
                        ));
                    }
                }
                Ok(())
            }
            Self::DeleteIfExists { key, .. } => full_key(key),
            Self::Delete { key, .. } => {
                key_prefix(key)?;
                if key.len() < table.partition_key.len() {
                    return Err(BackendError::invalid(table.name, "delete needs the partition key"));
                }
                Ok(())
            }
            Self::CounterAdd { key, column, .. } => {
                full_key(key)?;
                match table.column(column) {
                    Some(c) if c.kind == ColumnKind::Counter => Ok(()),
                    _ => Err(BackendError::invalid(
                        table.name,
                        format!("'{column}' is not a counter column"),
                    )),
                }
            }
            Self::Select(select) => {
                key_prefix(&select.key)?;
                if let Some((column, _)) = &select.prefix {
                    match table.column(column) {
                        Some(c) if c.kind == ColumnKind::Text => {}
                        _ => {
                            return Err(BackendError::invalid(
                                table.name,
                                format!("prefix filter needs a text column, got '{column}'"),
                            ))
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

/// Batch flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    /// Regular writes; durably recorded as a unit, not atomically visible
    Logged,
    /// Counter deltas only
    Counter,
}

impl BatchKind {
    /// Validate batch membership before anything is written.
    pub fn check(self, statements: &[Statement]) -> Result<(), BackendError> {
        for statement in statements {
            statement.check()?;
            let ok = match (self, statement) {
                (Self::Counter, Statement::CounterAdd { .. }) => true,
                (Self::Logged, Statement::CounterAdd { .. }) => false,
                (Self::Logged, s) => s.is_write() && !s.is_conditional(),
                (Self::Counter, _) => false,
            };
            if !ok {
                return Err(BackendError::InvalidBatch {
                    kind: self,
                    reason: format!("statement not allowed: {statement:?}"),
                });
            }
        }
        Ok(())
    }
}

/// Raw failure from a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("unconfigured table {keyspace}.{table}")]
    UnknownTable { keyspace: String, table: &'static str },

    #[error("invalid statement for {table}: {reason}")]
    InvalidStatement { table: &'static str, reason: String },

    #[error("invalid {kind:?} batch: {reason}")]
    InvalidBatch { kind: BatchKind, reason: String },

    #[error("write to {table} rejected: {reason}")]
    Rejected { table: &'static str, reason: String },

    #[error("column '{column}': expected {expected}, found {found}")]
    Decode {
        column: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid keyspace name '{keyspace}'")]
    InvalidKeyspace { keyspace: String },

    #[error("connection refused: {reason}")]
    Refused { reason: String },

    #[error("authentication failed: {reason}")]
    Unauthorized { reason: String },
}

impl BackendError {
    pub fn invalid(table: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidStatement {
            table,
            reason: reason.into(),
        }
    }

    fn decode(column: &'static str, expected: &'static str, found: Option<&Value>) -> Self {
        Self::Decode {
            column,
            expected,
            found: found.map(Value::type_name).unwrap_or("nothing"),
        }
    }

    /// True when the connection that produced this error must not be reused.
    pub fn breaks_connection(&self) -> bool {
        match self {
            Self::Postgres(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::WorkerCrashed
            ),
            Self::Refused { .. } | Self::Unauthorized { .. } => true,
            _ => false,
        }
    }
}

/// Read the outcome of a conditional write.
pub fn was_applied(rows: &[Row]) -> Result<bool, BackendError> {
    match rows.first() {
        Some(row) => row.boolean(APPLIED),
        None => Err(BackendError::decode(APPLIED, "boolean", None)),
    }
}

/// An open session to the store.
#[async_trait]
pub trait Connection: Send {
    /// Run one statement; plain writes return no rows, conditional writes
    /// return one [`APPLIED`] row.
    async fn execute(&mut self, statement: Statement) -> Result<Vec<Row>, BackendError>;

    /// Run several writes as one batch.
    async fn execute_batch(
        &mut self,
        kind: BatchKind,
        statements: Vec<Statement>,
    ) -> Result<(), BackendError>;

    /// False once the session is unusable and should be dropped.
    fn is_reusable(&self) -> bool {
        true
    }
}

/// Dials new connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection + 'static;

    async fn connect(&self) -> Result<Self::Connection, BackendError>;

    /// Human-readable target, with credentials stripped.
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    static EDGES: TableSchema = TableSchema {
        name: "edges",
        columns: &[
            Column::new("a", ColumnKind::Text),
            Column::new("b", ColumnKind::Text),
            Column::new("note", ColumnKind::Text),
        ],
        partition_key: &["a"],
        clustering_key: &["b"],
    };

    static HITS: TableSchema = TableSchema {
        name: "hits",
        columns: &[
            Column::new("a", ColumnKind::Text),
            Column::new("hits", ColumnKind::Counter),
        ],
        partition_key: &["a"],
        clustering_key: &[],
    };

    #[test]
    fn insert_requires_key_columns() {
        let stmt = Statement::Insert {
            table: &EDGES,
            row: Row::new().with("a", Value::text("x")),
        };
        assert!(matches!(stmt.check(), Err(BackendError::InvalidStatement { .. })));

        let stmt = Statement::Insert {
            table: &EDGES,
            row: Row::new()
                .with("a", Value::text("x"))
                .with("b", Value::text("y")),
        };
        assert!(stmt.check().is_ok());
    }

    #[test]
    fn counter_tables_reject_inserts() {
        let stmt = Statement::Insert {
            table: &HITS,
            row: Row::new().with("a", Value::text("x")),
        };
        assert!(stmt.check().is_err());
    }

    #[test]
    fn delete_accepts_partition_or_row() {
        let row = Statement::Delete {
            table: &EDGES,
            key: vec![("a", Value::text("x")), ("b", Value::text("y"))],
        };
        let partition = Statement::Delete {
            table: &EDGES,
            key: vec![("a", Value::text("x"))],
        };
        let wrong = Statement::Delete {
            table: &EDGES,
            key: vec![("b", Value::text("y"))],
        };
        assert!(row.check().is_ok());
        assert!(partition.check().is_ok());
        assert!(wrong.check().is_err());
    }

    #[test]
    fn batch_kinds_do_not_mix() {
        let add = Statement::CounterAdd {
            table: &HITS,
            key: vec![("a", Value::text("x"))],
            column: "hits",
            delta: 1,
        };
        let insert = Statement::Insert {
            table: &EDGES,
            row: Row::new()
                .with("a", Value::text("x"))
                .with("b", Value::text("y")),
        };
        assert!(BatchKind::Counter.check(&[add.clone()]).is_ok());
        assert!(BatchKind::Logged.check(&[insert.clone()]).is_ok());
        assert!(BatchKind::Logged.check(&[insert.clone(), add.clone()]).is_err());
        assert!(BatchKind::Counter.check(&[add, insert]).is_err());
    }

    #[test]
    fn conditional_writes_stay_out_of_batches() {
        let claim = Statement::InsertIfAbsent {
            table: &EDGES,
            row: Row::new()
                .with("a", Value::text("x"))
                .with("b", Value::text("y")),
        };
        assert!(claim.check().is_ok());
        assert!(BatchKind::Logged.check(&[claim]).is_err());

        let partial = Statement::DeleteIfExists {
            table: &EDGES,
            key: vec![("a", Value::text("x"))],
        };
        assert!(partial.check().is_err());
    }

    #[test]
    fn applied_row_reads_back() {
        assert!(was_applied(&[Row::applied(true)]).unwrap());
        assert!(!was_applied(&[Row::applied(false)]).unwrap());
        assert!(was_applied(&[]).is_err());
    }

    #[test]
    fn row_accessors_report_type_mismatch() {
        let row = Row::new().with("a", Value::Boolean(true));
        let err = row.text("a").unwrap_err();
        assert_eq!(err.to_string(), "column 'a': expected text, found boolean");
        assert_eq!(row.counter("missing").unwrap(), 0);
    }
}
