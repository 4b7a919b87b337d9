//! In-process wide-column engine
//!
//! Same contract as the networked store: partition -> clustering ordered
//! maps, upserting writes, commutative counter deltas and the
//! "unconfigured table" rule. Conditional writes check and write under the
//! one cluster lock. A [`MemoryCluster`] is cheap to clone; every
//! clone and every connection dialed from it share one state.
//!
//! Test hooks let callers refuse dials, reject writes to a table, add
//! per-statement latency and count dials.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{
    BackendError, BatchKind, Cell, Connection, Connector, Row, Select, Statement, TableSchema,
    Value,
};

type Partition = BTreeMap<Vec<Value>, Row>;

struct TableData {
    schema: &'static TableSchema,
    partitions: BTreeMap<Vec<Value>, Partition>,
}

#[derive(Default)]
struct ClusterState {
    keyspaces: BTreeMap<String, BTreeMap<&'static str, TableData>>,
    required_token: Option<String>,
    refuse_dials: bool,
    failing_tables: BTreeSet<&'static str>,
    failing_once: BTreeSet<&'static str>,
    latency: Option<Duration>,
    dials: usize,
}

/// Shared in-memory cluster.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept dials presenting this bearer token.
    pub fn require_token(&self, token: impl Into<String>) {
        self.lock().required_token = Some(token.into());
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_dials = refuse;
    }

    /// Reject every write (single or batched) touching `table`.
    pub fn fail_writes_to(&self, table: &'static str) {
        self.lock().failing_tables.insert(table);
    }

    /// Reject only the next write (single or batched) touching `table`.
    pub fn fail_next_write_to(&self, table: &'static str) {
        self.lock().failing_once.insert(table);
    }

    pub fn heal(&self) {
        let mut state = self.lock();
        state.failing_tables.clear();
        state.failing_once.clear();
    }

    /// Delay every statement by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Connections dialed so far.
    pub fn dials(&self) -> usize {
        self.lock().dials
    }

    pub fn has_table(&self, keyspace: &str, table: &str) -> bool {
        self.lock()
            .keyspaces
            .get(keyspace)
            .is_some_and(|tables| tables.contains_key(table))
    }

    /// Every row of a table, partition by partition.
    pub fn rows(&self, keyspace: &str, table: &str) -> Vec<Row> {
        self.lock()
            .keyspaces
            .get(keyspace)
            .and_then(|tables| tables.get(table))
            .map(|data| {
                data.partitions
                    .values()
                    .flat_map(|p| p.values().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn connector(&self, keyspace: impl Into<String>, token: impl Into<String>) -> MemoryConnector {
        MemoryConnector {
            cluster: self.clone(),
            keyspace: keyspace.into(),
            token: token.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Dials [`MemoryConnection`]s into one keyspace of a cluster.
#[derive(Clone)]
pub struct MemoryConnector {
    cluster: MemoryCluster,
    keyspace: String,
    token: String,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, BackendError> {
        let mut state = self.cluster.lock();
        if state.refuse_dials {
            return Err(BackendError::Refused {
                reason: "cluster is not accepting connections".to_string(),
            });
        }
        if let Some(required) = &state.required_token {
            if *required != self.token {
                return Err(BackendError::Unauthorized {
                    reason: "bearer token rejected".to_string(),
                });
            }
        }
        state.dials += 1;
        debug!(dial = state.dials, keyspace = %self.keyspace, "Dialed memory connection");
        Ok(MemoryConnection {
            cluster: self.cluster.clone(),
            keyspace: self.keyspace.clone(),
        })
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.keyspace)
    }
}

/// Session against a [`MemoryCluster`].
pub struct MemoryConnection {
    cluster: MemoryCluster,
    keyspace: String,
}

impl MemoryConnection {
    async fn simulate_latency(&self) {
        let latency = self.cluster.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&mut self, statement: Statement) -> Result<Vec<Row>, BackendError> {
        statement.check()?;
        self.simulate_latency().await;

        let mut state = self.cluster.lock();
        if statement.is_write() {
            reject_if_failing(&mut state, &statement)?;
        }
        apply(&mut state, &self.keyspace, statement)
    }

    async fn execute_batch(
        &mut self,
        kind: BatchKind,
        statements: Vec<Statement>,
    ) -> Result<(), BackendError> {
        kind.check(&statements)?;
        self.simulate_latency().await;

        let mut state = self.cluster.lock();
        // All-or-nothing: every statement is vetted before the first write.
        for statement in &statements {
            reject_if_failing(&mut state, statement)?;
            if let Some(table) = statement.table() {
                table_mut(&mut state, &self.keyspace, table)?;
            }
        }
        for statement in statements {
            apply(&mut state, &self.keyspace, statement)?;
        }
        Ok(())
    }
}

fn reject_if_failing(state: &mut ClusterState, statement: &Statement) -> Result<(), BackendError> {
    let Some(table) = statement.table() else {
        return Ok(());
    };
    if state.failing_tables.contains(table.name) || state.failing_once.remove(table.name) {
        return Err(BackendError::Rejected {
            table: table.name,
            reason: "write failure injected".to_string(),
        });
    }
    Ok(())
}

fn table_mut<'s>(
    state: &'s mut ClusterState,
    keyspace: &str,
    table: &'static TableSchema,
) -> Result<&'s mut TableData, BackendError> {
    state
        .keyspaces
        .get_mut(keyspace)
        .and_then(|tables| tables.get_mut(table.name))
        .ok_or_else(|| BackendError::UnknownTable {
            keyspace: keyspace.to_string(),
            table: table.name,
        })
}

/// Split full or partial key cells into (partition, clustering) values.
fn split_key(table: &TableSchema, key: &[Cell]) -> (Vec<Value>, Vec<Value>) {
    let values: Vec<Value> = key.iter().map(|(_, v)| v.clone()).collect();
    let at = table.partition_key.len().min(values.len());
    let (partition, clustering) = values.split_at(at);
    (partition.to_vec(), clustering.to_vec())
}

fn key_of_row(table: &TableSchema, row: &Row) -> Vec<Cell> {
    table
        .primary_key()
        .map(|k| (k, row.get(k).cloned().unwrap_or(Value::Null)))
        .collect()
}

fn upsert<'p>(data: &'p mut TableData, key: &[Cell]) -> &'p mut Row {
    let (partition, clustering) = split_key(data.schema, key);
    data.partitions
        .entry(partition)
        .or_default()
        .entry(clustering)
        .or_insert_with(|| {
            let mut row = Row::new();
            for (column, value) in key {
                row.set(*column, value.clone());
            }
            row
        })
}

fn apply(
    state: &mut ClusterState,
    keyspace: &str,
    statement: Statement,
) -> Result<Vec<Row>, BackendError> {
    match statement {
        Statement::CreateKeyspace => {
            state.keyspaces.entry(keyspace.to_string()).or_default();
            Ok(Vec::new())
        }
        Statement::CreateTable(schema) => {
            let tables = state
                .keyspaces
                .get_mut(keyspace)
                .ok_or_else(|| BackendError::Rejected {
                    table: schema.name,
                    reason: format!("keyspace '{keyspace}' does not exist"),
                })?;
            tables.entry(schema.name).or_insert_with(|| TableData {
                schema,
                partitions: BTreeMap::new(),
            });
            Ok(Vec::new())
        }
        Statement::Insert { table, row } => {
            let data = table_mut(state, keyspace, table)?;
            let key = key_of_row(table, &row);
            let target = upsert(data, &key);
            for (column, value) in row.into_cells() {
                target.set(column, value);
            }
            Ok(Vec::new())
        }
        Statement::InsertIfAbsent { table, row } => {
            let data = table_mut(state, keyspace, table)?;
            let key = key_of_row(table, &row);
            let (partition, clustering) = split_key(table, &key);
            let exists = data
                .partitions
                .get(&partition)
                .is_some_and(|rows| rows.contains_key(&clustering));
            if !exists {
                let target = upsert(data, &key);
                for (column, value) in row.into_cells() {
                    target.set(column, value);
                }
            }
            Ok(vec![Row::applied(!exists)])
        }
        Statement::Update { table, key, set } => {
            let data = table_mut(state, keyspace, table)?;
            let target = upsert(data, &key);
            for (column, value) in set {
                target.set(column, value);
            }
            Ok(Vec::new())
        }
        Statement::Delete { table, key } => {
            let data = table_mut(state, keyspace, table)?;
            let (partition, clustering) = split_key(table, &key);
            if clustering.is_empty() && key.len() == table.partition_key.len() {
                data.partitions.remove(&partition);
            } else if let Some(rows) = data.partitions.get_mut(&partition) {
                rows.remove(&clustering);
                if rows.is_empty() {
                    data.partitions.remove(&partition);
                }
            }
            Ok(Vec::new())
        }
        Statement::DeleteIfExists { table, key } => {
            let data = table_mut(state, keyspace, table)?;
            let (partition, clustering) = split_key(table, &key);
            let mut removed = false;
            if let Some(rows) = data.partitions.get_mut(&partition) {
                removed = rows.remove(&clustering).is_some();
                if rows.is_empty() {
                    data.partitions.remove(&partition);
                }
            }
            Ok(vec![Row::applied(removed)])
        }
        Statement::CounterAdd {
            table,
            key,
            column,
            delta,
        } => {
            let data = table_mut(state, keyspace, table)?;
            let target = upsert(data, &key);
            let next = target
                .counter(column)?
                .checked_add(delta)
                .ok_or_else(|| BackendError::Rejected {
                    table: table.name,
                    reason: format!("counter '{column}' would overflow"),
                })?;
            target.set(column, Value::BigInt(next));
            Ok(Vec::new())
        }
        Statement::Select(select) => {
            let data = table_mut(state, keyspace, select.table)?;
            Ok(run_select(data, &select))
        }
    }
}

fn run_select(data: &TableData, select: &Select) -> Vec<Row> {
    let (partition, clustering) = split_key(data.schema, &select.key);
    let whole_partition = partition.len() == data.schema.partition_key.len();

    let candidates: Box<dyn Iterator<Item = &Row> + '_> = if whole_partition {
        match data.partitions.get(&partition) {
            Some(rows) => Box::new(rows.values()),
            None => Box::new(std::iter::empty()),
        }
    } else {
        Box::new(
            data.partitions
                .iter()
                .filter(|(p, _)| p.starts_with(&partition))
                .flat_map(|(_, rows)| rows.values()),
        )
    };

    let mut rows: Vec<Row> = candidates
        .filter(|row| {
            key_of_row(data.schema, row)
                .iter()
                .skip(data.schema.partition_key.len())
                .zip(clustering.iter())
                .all(|((_, have), want)| have == want)
        })
        .filter(|row| match &select.prefix {
            Some((column, prefix)) => {
                matches!(row.get(column), Some(Value::Text(s)) if s.starts_with(prefix.as_str()))
            }
            None => true,
        })
        .cloned()
        .collect();

    if select.descending {
        rows.reverse();
    }
    if let Some(limit) = select.limit {
        rows.truncate(limit as usize);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{was_applied, Column, ColumnKind};

    static TIMELINE: TableSchema = TableSchema {
        name: "timeline",
        columns: &[
            Column::new("owner", ColumnKind::Text),
            Column::new("seq", ColumnKind::Text),
            Column::new("body", ColumnKind::Text),
        ],
        partition_key: &["owner"],
        clustering_key: &["seq"],
    };

    static HITS: TableSchema = TableSchema {
        name: "hits",
        columns: &[
            Column::new("owner", ColumnKind::Text),
            Column::new("hits", ColumnKind::Counter),
        ],
        partition_key: &["owner"],
        clustering_key: &[],
    };

    async fn provisioned() -> (MemoryCluster, MemoryConnection) {
        let cluster = MemoryCluster::new();
        let mut conn = cluster.connector("ks", "t").connect().await.unwrap();
        conn.execute(Statement::CreateKeyspace).await.unwrap();
        conn.execute(Statement::CreateTable(&TIMELINE)).await.unwrap();
        conn.execute(Statement::CreateTable(&HITS)).await.unwrap();
        (cluster, conn)
    }

    fn entry(owner: &str, seq: &str, body: &str) -> Statement {
        Statement::Insert {
            table: &TIMELINE,
            row: Row::new()
                .with("owner", Value::text(owner))
                .with("seq", Value::text(seq))
                .with("body", Value::text(body)),
        }
    }

    fn hit(owner: &str, delta: i64) -> Statement {
        Statement::CounterAdd {
            table: &HITS,
            key: vec![("owner", Value::text(owner))],
            column: "hits",
            delta,
        }
    }

    #[tokio::test]
    async fn unconfigured_table_is_rejected() {
        let cluster = MemoryCluster::new();
        let mut conn = cluster.connector("ks", "t").connect().await.unwrap();
        let err = conn.execute(entry("a", "1", "x")).await.unwrap_err();
        assert!(matches!(err, BackendError::UnknownTable { .. }));
    }

    #[tokio::test]
    async fn partitions_are_ordered_by_clustering_key() {
        let (_cluster, mut conn) = provisioned().await;
        for seq in ["2", "1", "3"] {
            conn.execute(entry("a", seq, seq)).await.unwrap();
        }
        conn.execute(entry("b", "9", "other")).await.unwrap();

        let rows = conn
            .execute(Statement::Select(Select::partition(
                &TIMELINE,
                vec![("owner", Value::text("a"))],
            )))
            .await
            .unwrap();
        let seqs: Vec<String> = rows.iter().map(|r| r.text("seq").unwrap()).collect();
        assert_eq!(seqs, ["1", "2", "3"]);

        let rows = conn
            .execute(Statement::Select(
                Select::partition(&TIMELINE, vec![("owner", Value::text("a"))])
                    .newest_first()
                    .limit(Some(2)),
            ))
            .await
            .unwrap();
        let seqs: Vec<String> = rows.iter().map(|r| r.text("seq").unwrap()).collect();
        assert_eq!(seqs, ["3", "2"]);
    }

    #[tokio::test]
    async fn insert_is_an_upsert() {
        let (cluster, mut conn) = provisioned().await;
        conn.execute(entry("a", "1", "first")).await.unwrap();
        conn.execute(entry("a", "1", "second")).await.unwrap();
        let rows = cluster.rows("ks", "timeline");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text("body").unwrap(), "second");
    }

    #[tokio::test]
    async fn counters_commute_and_go_negative() {
        let (cluster, mut conn) = provisioned().await;
        conn.execute(hit("a", 0)).await.unwrap();
        conn.execute(hit("a", -1)).await.unwrap();
        conn.execute(hit("a", -1)).await.unwrap();
        let rows = cluster.rows("ks", "hits");
        assert_eq!(rows[0].counter("hits").unwrap(), -2);
    }

    #[tokio::test]
    async fn counter_overflow_is_rejected() {
        let (cluster, mut conn) = provisioned().await;
        conn.execute(hit("a", i64::MAX)).await.unwrap();
        let err = conn.execute(hit("a", 1)).await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected { table: "hits", .. }));
        assert_eq!(cluster.rows("ks", "hits")[0].counter("hits").unwrap(), i64::MAX);
    }

    #[tokio::test]
    async fn conditional_writes_report_whether_they_changed_a_row() {
        let (cluster, mut conn) = provisioned().await;
        let claim = |body: &str| match entry("a", "1", body) {
            Statement::Insert { table, row } => Statement::InsertIfAbsent { table, row },
            other => other,
        };
        let drop_row = || Statement::DeleteIfExists {
            table: &TIMELINE,
            key: vec![("owner", Value::text("a")), ("seq", Value::text("1"))],
        };

        assert!(was_applied(&conn.execute(claim("first")).await.unwrap()).unwrap());
        assert!(!was_applied(&conn.execute(claim("second")).await.unwrap()).unwrap());
        assert_eq!(cluster.rows("ks", "timeline")[0].text("body").unwrap(), "first");

        assert!(was_applied(&conn.execute(drop_row()).await.unwrap()).unwrap());
        assert!(!was_applied(&conn.execute(drop_row()).await.unwrap()).unwrap());
        assert!(cluster.rows("ks", "timeline").is_empty());
    }

    #[tokio::test]
    async fn failing_batch_writes_nothing() {
        let (cluster, mut conn) = provisioned().await;
        cluster.fail_writes_to("timeline");
        let err = conn
            .execute_batch(BatchKind::Logged, vec![entry("a", "1", "x"), entry("b", "1", "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected { table: "timeline", .. }));
        assert!(cluster.rows("ks", "timeline").is_empty());

        cluster.heal();
        conn.execute_batch(BatchKind::Logged, vec![entry("a", "1", "x"), entry("b", "1", "x")])
            .await
            .unwrap();
        assert_eq!(cluster.rows("ks", "timeline").len(), 2);
    }

    #[tokio::test]
    async fn one_shot_failure_clears_itself() {
        let (cluster, mut conn) = provisioned().await;
        cluster.fail_next_write_to("timeline");
        assert!(conn.execute(entry("a", "1", "x")).await.is_err());
        assert!(conn.execute(entry("a", "1", "x")).await.is_ok());
    }

    #[tokio::test]
    async fn dial_rules() {
        let cluster = MemoryCluster::new();
        cluster.require_token("secret");
        assert!(matches!(
            cluster.connector("ks", "wrong").connect().await,
            Err(BackendError::Unauthorized { .. })
        ));
        assert!(cluster.connector("ks", "secret").connect().await.is_ok());

        cluster.refuse_connections(true);
        assert!(matches!(
            cluster.connector("ks", "secret").connect().await,
            Err(BackendError::Refused { .. })
        ));
        assert_eq!(cluster.dials(), 1);
    }

    #[tokio::test]
    async fn delete_row_and_partition() {
        let (cluster, mut conn) = provisioned().await;
        conn.execute(entry("a", "1", "x")).await.unwrap();
        conn.execute(entry("a", "2", "x")).await.unwrap();
        conn.execute(Statement::Delete {
            table: &TIMELINE,
            key: vec![("owner", Value::text("a")), ("seq", Value::text("1"))],
        })
        .await
        .unwrap();
        assert_eq!(cluster.rows("ks", "timeline").len(), 1);

        conn.execute(Statement::Delete {
            table: &TIMELINE,
            key: vec![("owner", Value::text("a"))],
        })
        .await
        .unwrap();
        assert!(cluster.rows("ks", "timeline").is_empty());
    }
}
