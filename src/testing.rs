//! In-memory connection for tests.
//!
//! [`MockConnector`] hands out [`MockConnection`]s that share one record
//! store and one event log. Every connection implements both
//! [`AsyncConnection`] and [`SyncConnection`], so the same fixture drives the
//! async and blocking pools.
//!
//! Failures are injected through [`ConnectionControls`] (per connection) and
//! [`MockConnector::fail_next_connects`] (connection creation).
//!
//! Transactions snapshot the whole store on begin and restore it on
//! rollback, which is enough for single-writer tests but not an isolation
//! model.

use crate::db::connection::{AsyncConnection, AsyncConnector, SyncConnection, SyncConnector};
use crate::error::{DbError, DbResult};
use crate::models::{Credentials, Endpoint};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Version string returned by the liveness probe.
pub const MOCK_VERSION: &str = "surrealdb-2.0.0-mock";

/// Something a mock connection did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Connected(usize),
    Signin(usize),
    Use(usize, String, String),
    Version(usize),
    Query(usize, String),
    /// Record call: connection, method name, target.
    Call(usize, &'static str, String),
    Begin(usize),
    Commit(usize),
    Rollback(usize),
    Closed(usize),
}

/// Records shared by all connections of a connector.
#[derive(Debug, Clone, Default)]
pub struct Store {
    records: BTreeMap<String, Value>,
    next_ids: HashMap<String, u64>,
}

impl Store {
    pub fn record(&self, id: &str) -> Option<Value> {
        self.records.get(id).cloned()
    }

    /// All records of `table`, ordered by id.
    pub fn table(&self, table: &str) -> Vec<Value> {
        let prefix = format!("{table}:");
        self.records
            .iter()
            .filter(|(id, _)| id.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn generate_id(&mut self, table: &str) -> String {
        let next = self.next_ids.entry(table.to_string()).or_insert(0);
        *next += 1;
        format!("{table}:{next}")
    }
}

/// Failure switches for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionControls {
    alive: Arc<AtomicBool>,
    fail_next: Arc<AtomicUsize>,
    fail_rollback: Arc<AtomicBool>,
    fail_close: Arc<AtomicBool>,
    probe_delay_ms: Arc<AtomicU64>,
}

impl ConnectionControls {
    fn new() -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(true)),
            fail_next: Arc::new(AtomicUsize::new(0)),
            fail_rollback: Arc::new(AtomicBool::new(false)),
            fail_close: Arc::new(AtomicBool::new(false)),
            probe_delay_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A dead connection fails every call, including the liveness probe.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Fail the next `n` record and query calls. The liveness probe is not
    /// affected.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn fail_rollback(&self, fail: bool) {
        self.fail_rollback.store(fail, Ordering::SeqCst);
    }

    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Make the async liveness probe sleep before answering.
    pub fn delay_probe(&self, delay: Duration) {
        self.probe_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn probe_delay(&self) -> Duration {
        Duration::from_millis(self.probe_delay_ms.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
struct Shared {
    store: Mutex<Store>,
    events: Mutex<Vec<MockEvent>>,
    controls: Mutex<BTreeMap<usize, ConnectionControls>>,
    close_counts: Mutex<HashMap<usize, usize>>,
    query_responses: Mutex<VecDeque<Vec<Value>>>,
    next_id: AtomicUsize,
    connects: AtomicUsize,
    fail_connects: AtomicUsize,
}

impl Shared {
    fn log(&self, event: MockEvent) {
        self.events.lock().push(event);
    }
}

/// Connector producing [`MockConnection`]s over a shared store.
#[derive(Clone, Default)]
pub struct MockConnector {
    shared: Arc<Shared>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection directly, bypassing connect failures.
    pub fn open(&self) -> MockConnection {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let controls = ConnectionControls::new();
        self.shared.controls.lock().insert(id, controls.clone());
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        self.shared.log(MockEvent::Connected(id));
        MockConnection {
            id,
            shared: Arc::clone(&self.shared),
            controls,
            snapshot: None,
            closed: false,
        }
    }

    fn try_open(&self) -> DbResult<MockConnection> {
        let injected = self
            .shared
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DbError::protocol("connection refused"));
        }
        Ok(self.open())
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Connections successfully opened so far.
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn controls(&self, id: usize) -> Option<ConnectionControls> {
        self.shared.controls.lock().get(&id).cloned()
    }

    /// Ids of every connection opened so far.
    pub fn connection_ids(&self) -> Vec<usize> {
        self.shared.controls.lock().keys().copied().collect()
    }

    /// How often `close` was called on connection `id`.
    pub fn close_count(&self, id: usize) -> usize {
        self.shared.close_counts.lock().get(&id).copied().unwrap_or(0)
    }

    /// Highest close count of any connection.
    pub fn max_close_count(&self) -> usize {
        self.shared
            .close_counts
            .lock()
            .values()
            .copied()
            .max()
            .unwrap_or(0)
    }

    pub fn closed_count(&self) -> usize {
        self.shared.close_counts.lock().len()
    }

    /// Queue rows for the next `query` call on any connection.
    pub fn push_query_response(&self, rows: Vec<Value>) {
        self.shared.query_responses.lock().push_back(rows);
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.shared.events.lock().clone()
    }

    /// Statements passed to `query`, in call order.
    pub fn queries(&self) -> Vec<String> {
        self.shared
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                MockEvent::Query(_, q) => Some(q.clone()),
                _ => None,
            })
            .collect()
    }

    /// Snapshot of the shared store.
    pub fn store(&self) -> Store {
        self.shared.store.lock().clone()
    }

    /// Put a record into the store without going through a connection.
    pub fn seed(&self, id: &str, data: Value) {
        let mut record = as_object(Some(data));
        record.insert("id".into(), Value::String(id.to_string()));
        self.shared
            .store
            .lock()
            .records
            .insert(id.to_string(), Value::Object(record));
    }
}

#[async_trait]
impl AsyncConnector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self, _endpoint: &Endpoint) -> DbResult<MockConnection> {
        self.try_open()
    }
}

impl SyncConnector for MockConnector {
    type Connection = MockConnection;

    fn connect(&self, _endpoint: &Endpoint) -> DbResult<MockConnection> {
        self.try_open()
    }
}

/// One in-memory connection.
pub struct MockConnection {
    id: usize,
    shared: Arc<Shared>,
    controls: ConnectionControls,
    snapshot: Option<Store>,
    closed: bool,
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("id", &self.id)
            .field("in_transaction", &self.snapshot.is_some())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl MockConnection {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn controls(&self) -> &ConnectionControls {
        &self.controls
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    fn check_usable(&self) -> DbResult<()> {
        if self.closed {
            return Err(DbError::protocol("connection is closed"));
        }
        if !self.controls.is_alive() {
            return Err(DbError::protocol("connection is not alive"));
        }
        Ok(())
    }

    fn check_call(&self) -> DbResult<()> {
        self.check_usable()?;
        let injected = self
            .controls
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DbError::protocol("injected failure"));
        }
        Ok(())
    }

    fn call(&self, method: &'static str, target: &str) -> DbResult<()> {
        self.check_call()?;
        self.shared
            .log(MockEvent::Call(self.id, method, target.to_string()));
        Ok(())
    }

    fn do_signin(&mut self, _credentials: &Credentials) -> DbResult<Value> {
        self.check_usable()?;
        self.shared.log(MockEvent::Signin(self.id));
        Ok(json!("mock-token"))
    }

    fn do_use(&mut self, namespace: &str, database: &str) -> DbResult<()> {
        self.check_usable()?;
        self.shared.log(MockEvent::Use(
            self.id,
            namespace.to_string(),
            database.to_string(),
        ));
        Ok(())
    }

    fn do_query(&mut self, statement: &str) -> DbResult<Vec<Value>> {
        self.check_call()?;
        self.shared
            .log(MockEvent::Query(self.id, statement.to_string()));
        Ok(self
            .shared
            .query_responses
            .lock()
            .pop_front()
            .unwrap_or_default())
    }

    fn do_create(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.call("create", target)?;
        let mut store = self.shared.store.lock();
        let id = if target.contains(':') {
            if store.records.contains_key(target) {
                return Err(DbError::protocol(format!(
                    "Database record `{target}` already exists"
                )));
            }
            target.to_string()
        } else {
            store.generate_id(target)
        };
        let record = with_id(&id, as_object(data));
        store.records.insert(id, record.clone());
        Ok(record)
    }

    fn do_update(&mut self, target: &str, data: Option<Value>, merge: bool) -> DbResult<Value> {
        self.call(if merge { "merge" } else { "update" }, target)?;
        let mut store = self.shared.store.lock();
        let ids = matching_ids(&store, target);
        let mut updated = Vec::with_capacity(ids.len());
        for id in &ids {
            let fields = as_object(data.clone());
            let record = if merge {
                let mut existing = as_object(store.records.get(id).cloned());
                existing.extend(fields);
                with_id(id, existing)
            } else {
                with_id(id, fields)
            };
            store.records.insert(id.clone(), record.clone());
            updated.push(record);
        }
        Ok(shape(target, updated))
    }

    fn do_patch(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.call("patch", target)?;
        let ops = match data {
            Some(Value::Array(ops)) => ops,
            Some(_) => return Err(DbError::protocol("patch expects an array of operations")),
            None => Vec::new(),
        };
        let mut store = self.shared.store.lock();
        let ids = matching_ids(&store, target);
        let mut patched = Vec::with_capacity(ids.len());
        for id in &ids {
            let mut record = as_object(store.records.get(id).cloned());
            for op in &ops {
                let field = op["path"].as_str().unwrap_or("").trim_start_matches('/');
                match op["op"].as_str() {
                    Some("add") | Some("replace") => {
                        record.insert(field.to_string(), op["value"].clone());
                    }
                    Some("remove") => {
                        record.remove(field);
                    }
                    other => {
                        return Err(DbError::protocol(format!(
                            "Unsupported patch operation: {other:?}"
                        )));
                    }
                }
            }
            let record = with_id(id, record);
            store.records.insert(id.clone(), record.clone());
            patched.push(record);
        }
        Ok(shape(target, patched))
    }

    fn do_upsert(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.call("upsert", target)?;
        if !target.contains(':') {
            return Err(DbError::protocol("upsert requires a record id"));
        }
        let record = with_id(target, as_object(data));
        self.shared
            .store
            .lock()
            .records
            .insert(target.to_string(), record.clone());
        Ok(record)
    }

    fn do_delete(&mut self, target: &str) -> DbResult<Value> {
        self.call("delete", target)?;
        let mut store = self.shared.store.lock();
        let ids = matching_ids(&store, target);
        let removed = ids
            .iter()
            .filter_map(|id| store.records.remove(id))
            .collect();
        Ok(shape(target, removed))
    }

    fn do_select(&mut self, target: &str) -> DbResult<Value> {
        self.call("select", target)?;
        let store = self.shared.store.lock();
        let found = matching_ids(&store, target)
            .iter()
            .filter_map(|id| store.records.get(id).cloned())
            .collect();
        Ok(shape(target, found))
    }

    fn do_insert(&mut self, table: &str, data: Value) -> DbResult<Value> {
        self.call("insert", table)?;
        let items = match data {
            Value::Array(items) => items,
            other => vec![other],
        };
        let mut store = self.shared.store.lock();
        let mut inserted = Vec::with_capacity(items.len());
        for item in items {
            let fields = as_object(Some(item));
            let id = match fields.get("id").and_then(Value::as_str) {
                Some(id) if id.contains(':') => id.to_string(),
                Some(key) => format!("{table}:{key}"),
                None => store.generate_id(table),
            };
            if store.records.contains_key(&id) {
                return Err(DbError::protocol(format!(
                    "Database record `{id}` already exists"
                )));
            }
            let record = with_id(&id, fields);
            store.records.insert(id, record.clone());
            inserted.push(record);
        }
        Ok(Value::Array(inserted))
    }

    fn do_version(&mut self) -> DbResult<String> {
        self.check_usable()?;
        self.shared.log(MockEvent::Version(self.id));
        Ok(MOCK_VERSION.to_string())
    }

    fn do_close(&mut self) -> DbResult<()> {
        *self.shared.close_counts.lock().entry(self.id).or_insert(0) += 1;
        self.shared.log(MockEvent::Closed(self.id));
        self.closed = true;
        if self.controls.fail_close.load(Ordering::SeqCst) {
            return Err(DbError::protocol("close failed"));
        }
        Ok(())
    }

    fn do_begin(&mut self) -> DbResult<()> {
        self.check_usable()?;
        if self.snapshot.is_some() {
            return Err(DbError::protocol("transaction already in progress"));
        }
        self.snapshot = Some(self.shared.store.lock().clone());
        self.shared.log(MockEvent::Begin(self.id));
        Ok(())
    }

    fn do_commit(&mut self) -> DbResult<()> {
        self.check_usable()?;
        if self.snapshot.take().is_none() {
            return Err(DbError::protocol("no transaction in progress"));
        }
        self.shared.log(MockEvent::Commit(self.id));
        Ok(())
    }

    fn do_rollback(&mut self) -> DbResult<()> {
        self.check_usable()?;
        if self.controls.fail_rollback.load(Ordering::SeqCst) {
            return Err(DbError::protocol("rollback failed"));
        }
        let snapshot = self
            .snapshot
            .take()
            .ok_or_else(|| DbError::protocol("no transaction in progress"))?;
        *self.shared.store.lock() = snapshot;
        self.shared.log(MockEvent::Rollback(self.id));
        Ok(())
    }
}

fn as_object(data: Option<Value>) -> Map<String, Value> {
    match data {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn with_id(id: &str, mut fields: Map<String, Value>) -> Value {
    fields.insert("id".into(), Value::String(id.to_string()));
    Value::Object(fields)
}

/// Ids addressed by `target`: one record id, or every record of a table.
fn matching_ids(store: &Store, target: &str) -> Vec<String> {
    if target.contains(':') {
        store
            .records
            .contains_key(target)
            .then(|| target.to_string())
            .into_iter()
            .collect()
    } else {
        let prefix = format!("{target}:");
        store
            .records
            .keys()
            .filter(|id| id.starts_with(&prefix))
            .cloned()
            .collect()
    }
}

/// A record id yields one value (or null), a table yields an array.
fn shape(target: &str, mut values: Vec<Value>) -> Value {
    if target.contains(':') {
        values.pop().unwrap_or(Value::Null)
    } else {
        Value::Array(values)
    }
}

#[async_trait]
impl AsyncConnection for MockConnection {
    async fn signin(&mut self, credentials: &Credentials) -> DbResult<Value> {
        self.do_signin(credentials)
    }

    async fn use_namespace(&mut self, namespace: &str, database: &str) -> DbResult<()> {
        self.do_use(namespace, database)
    }

    async fn query(&mut self, statement: &str, _vars: Option<Value>) -> DbResult<Vec<Value>> {
        self.do_query(statement)
    }

    async fn create(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.do_create(target, data)
    }

    async fn update(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.do_update(target, data, false)
    }

    async fn merge(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.do_update(target, data, true)
    }

    async fn patch(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.do_patch(target, data)
    }

    async fn upsert(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.do_upsert(target, data)
    }

    async fn delete(&mut self, target: &str) -> DbResult<Value> {
        self.do_delete(target)
    }

    async fn select(&mut self, target: &str) -> DbResult<Value> {
        self.do_select(target)
    }

    async fn insert(&mut self, table: &str, data: Value) -> DbResult<Value> {
        self.do_insert(table, data)
    }

    async fn version(&mut self) -> DbResult<String> {
        let delay = self.controls.probe_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.do_version()
    }

    async fn close(&mut self) -> DbResult<()> {
        self.do_close()
    }

    async fn begin_transaction(&mut self) -> DbResult<()> {
        self.do_begin()
    }

    async fn commit_transaction(&mut self) -> DbResult<()> {
        self.do_commit()
    }

    async fn rollback_transaction(&mut self) -> DbResult<()> {
        self.do_rollback()
    }
}

impl SyncConnection for MockConnection {
    fn signin(&mut self, credentials: &Credentials) -> DbResult<Value> {
        self.do_signin(credentials)
    }

    fn use_namespace(&mut self, namespace: &str, database: &str) -> DbResult<()> {
        self.do_use(namespace, database)
    }

    fn query(&mut self, statement: &str, _vars: Option<Value>) -> DbResult<Vec<Value>> {
        self.do_query(statement)
    }

    fn create(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.do_create(target, data)
    }

    fn update(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.do_update(target, data, false)
    }

    fn merge(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.do_update(target, data, true)
    }

    fn patch(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.do_patch(target, data)
    }

    fn upsert(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.do_upsert(target, data)
    }

    fn delete(&mut self, target: &str) -> DbResult<Value> {
        self.do_delete(target)
    }

    fn select(&mut self, target: &str) -> DbResult<Value> {
        self.do_select(target)
    }

    fn insert(&mut self, table: &str, data: Value) -> DbResult<Value> {
        self.do_insert(table, data)
    }

    fn version(&mut self) -> DbResult<String> {
        self.do_version()
    }

    fn close(&mut self) -> DbResult<()> {
        self.do_close()
    }

    fn begin_transaction(&mut self) -> DbResult<()> {
        self.do_begin()
    }

    fn commit_transaction(&mut self) -> DbResult<()> {
        self.do_commit()
    }

    fn rollback_transaction(&mut self) -> DbResult<()> {
        self.do_rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_select_delete() {
        let connector = MockConnector::new();
        let mut conn = connector.open();

        let created = SyncConnection::create(&mut conn, "user", Some(json!({"name": "a"}))).unwrap();
        assert_eq!(created["id"], "user:1");
        let selected = SyncConnection::select(&mut conn, "user").unwrap();
        assert_eq!(selected.as_array().unwrap().len(), 1);
        let deleted = SyncConnection::delete(&mut conn, "user:1").unwrap();
        assert_eq!(deleted["name"], "a");
        assert!(connector.store().is_empty());
    }

    #[test]
    fn test_merge_keeps_fields() {
        let connector = MockConnector::new();
        connector.seed("user:1", json!({"name": "a", "age": 3}));
        let mut conn = connector.open();
        let merged = SyncConnection::merge(&mut conn, "user:1", Some(json!({"age": 4}))).unwrap();
        assert_eq!(merged["name"], "a");
        assert_eq!(merged["age"], 4);
    }

    #[test]
    fn test_dead_connection_fails_probe() {
        let connector = MockConnector::new();
        let mut conn = connector.open();
        conn.controls().set_alive(false);
        assert!(SyncConnection::version(&mut conn).is_err());
    }

    #[test]
    fn test_fail_next_skips_probe() {
        let connector = MockConnector::new();
        let mut conn = connector.open();
        conn.controls().fail_next(1);
        assert!(SyncConnection::version(&mut conn).is_ok());
        assert!(SyncConnection::select(&mut conn, "user").is_err());
        assert!(SyncConnection::select(&mut conn, "user").is_ok());
    }

    #[test]
    fn test_fail_next_connects() {
        let connector = MockConnector::new();
        connector.fail_next_connects(1);
        let endpoint = Endpoint::parse("ws://localhost").unwrap();
        assert!(SyncConnector::connect(&connector, &endpoint).is_err());
        assert!(SyncConnector::connect(&connector, &endpoint).is_ok());
        assert_eq!(connector.connect_count(), 1);
    }

    #[test]
    fn test_close_counts() {
        let connector = MockConnector::new();
        let mut conn = connector.open();
        SyncConnection::close(&mut conn).unwrap();
        assert_eq!(connector.close_count(conn.id()), 1);
        assert!(SyncConnection::version(&mut conn).is_err());
    }
}
