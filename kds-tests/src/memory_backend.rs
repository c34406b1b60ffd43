/// In-memory backend for tests
///
/// Stores entities in a sorted map, evaluates kind/ancestor/filter/order
/// queries, records every call and can be scripted to fail or to return
/// canned query pages.
use bytes::Bytes;
use kds_client::{
    Backend, BackendResult, CommitMode, CommitRequest, CommitResponse, Cursor, Direction,
    LookupResponse, MoreResults, Mutation, Operator, QueryRequest, QueryResultBatch, QuerySpec,
    ReadOptions, TransactionId, KEY_PROPERTY,
};
use kds_core::{BackendError, Entity, IdOrName, Key, PathElement, Value};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, trace};

/// First identifier handed out for partial keys
pub const FIRST_ALLOCATED_ID: i64 = 1000;

type StorageKey = (String, Option<String>, Vec<PathElement>);

/// Backend operation, used to address scripted failures and count calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    Connect,
    Start,
    BeginTransaction,
    Commit,
    Rollback,
    Lookup,
    RunQuery,
    AllocateId,
}

/// One recorded backend call
#[derive(Debug, Clone)]
pub enum BackendCall {
    Connect {
        project: String,
        namespace: Option<String>,
    },
    Start {
        project: String,
    },
    BeginTransaction {
        read_only: bool,
    },
    Commit {
        mode: CommitMode,
        mutations: Vec<Mutation>,
    },
    Rollback {
        transaction: Option<TransactionId>,
    },
    Lookup {
        keys: Vec<Key>,
        read_options: ReadOptions,
    },
    RunQuery(QueryRequest),
    AllocateId(Key),
}

impl BackendCall {
    pub fn op(&self) -> BackendOp {
        match self {
            BackendCall::Connect { .. } => BackendOp::Connect,
            BackendCall::Start { .. } => BackendOp::Start,
            BackendCall::BeginTransaction { .. } => BackendOp::BeginTransaction,
            BackendCall::Commit { .. } => BackendOp::Commit,
            BackendCall::Rollback { .. } => BackendOp::Rollback,
            BackendCall::Lookup { .. } => BackendOp::Lookup,
            BackendCall::RunQuery(_) => BackendOp::RunQuery,
            BackendCall::AllocateId(_) => BackendOp::AllocateId,
        }
    }
}

struct State {
    entities: BTreeMap<StorageKey, Entity>,
    next_id: i64,
    next_token: u64,
    calls: Vec<BackendCall>,
    failures: HashMap<BackendOp, VecDeque<BackendError>>,
    scripted_pages: VecDeque<QueryResultBatch>,
    max_page_size: Option<usize>,
}

pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entities: BTreeMap::new(),
                next_id: FIRST_ALLOCATED_ID,
                next_token: 0,
                calls: Vec::new(),
                failures: HashMap::new(),
                scripted_pages: VecDeque::new(),
                max_page_size: None,
            }),
        }
    }

    /// Make the next call of `op` fail with `error`
    pub fn fail_next(&self, op: BackendOp, error: BackendError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Return `page` from the next `run_query` instead of evaluating the query
    pub fn push_page(&self, page: QueryResultBatch) {
        self.state.lock().scripted_pages.push_back(page);
    }

    /// Cap evaluated query pages at `size` results; longer results continue
    /// on the next page
    pub fn set_max_page_size(&self, size: usize) {
        self.state.lock().max_page_size = Some(size);
    }

    /// Store an entity directly, bypassing the call log
    pub fn seed(&self, entity: Entity) {
        if let Some(key) = entity.key() {
            let storage_key = storage_key(key);
            self.state.lock().entities.insert(storage_key, entity);
        }
    }

    pub fn stored(&self, key: &Key) -> Option<Entity> {
        self.state.lock().entities.get(&storage_key(key)).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, op: BackendOp) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.op() == op)
            .count()
    }

    /// Mutation lists of every commit, in call order
    pub fn commits(&self) -> Vec<Vec<Mutation>> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::Commit { mutations, .. } => Some(mutations.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn query_requests(&self) -> Vec<QueryRequest> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::RunQuery(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn record(&self, call: BackendCall) -> BackendResult<()> {
        let mut state = self.state.lock();
        let op = call.op();
        trace!(?op, "backend call");
        state.calls.push(call);
        match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => {
                debug!(?op, %error, "scripted backend failure");
                Err(error)
            }
            None => Ok(()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn connect(&self, project: &str, namespace: Option<&str>) -> BackendResult<()> {
        self.record(BackendCall::Connect {
            project: project.to_string(),
            namespace: namespace.map(String::from),
        })
    }

    fn start(&self, project: &str) -> BackendResult<()> {
        self.record(BackendCall::Start {
            project: project.to_string(),
        })
    }

    fn begin_transaction(&self, _project: &str, read_only: bool) -> BackendResult<TransactionId> {
        self.record(BackendCall::BeginTransaction { read_only })?;
        let mut state = self.state.lock();
        state.next_token += 1;
        Ok(TransactionId::new(Bytes::from(
            state.next_token.to_be_bytes().to_vec(),
        )))
    }

    fn commit(&self, request: CommitRequest<'_>) -> BackendResult<CommitResponse> {
        self.record(BackendCall::Commit {
            mode: request.mode.clone(),
            mutations: request.mutations.to_vec(),
        })?;

        let mut state = self.state.lock();
        let mut ids = Vec::new();
        for mutation in request.mutations {
            match mutation {
                Mutation::Insert(entity) => {
                    let key = entity
                        .key()
                        .ok_or_else(|| BackendError::InvalidArgument("entity without key".into()))?;
                    let id = state.next_id;
                    state.next_id += 1;
                    let key = key
                        .completed_key(id)
                        .map_err(|e| BackendError::InvalidArgument(e.to_string()))?;
                    let mut stored = entity.clone();
                    stored.set_key(key.clone());
                    state.entities.insert(storage_key(&key), stored);
                    ids.push(IdOrName::Id(id));
                }
                Mutation::Upsert(entity) => {
                    let key = entity
                        .key()
                        .ok_or_else(|| BackendError::InvalidArgument("entity without key".into()))?;
                    state.entities.insert(storage_key(key), entity.clone());
                }
                Mutation::Delete(key) => {
                    state.entities.remove(&storage_key(key));
                }
            }
        }

        Ok(CommitResponse {
            ids,
            index_updates: request.mutations.len(),
        })
    }

    fn rollback(&self, _project: &str, transaction: Option<&TransactionId>) -> BackendResult<()> {
        self.record(BackendCall::Rollback {
            transaction: transaction.cloned(),
        })
    }

    fn lookup(
        &self,
        _project: &str,
        keys: &[Key],
        read_options: &ReadOptions,
    ) -> BackendResult<LookupResponse> {
        self.record(BackendCall::Lookup {
            keys: keys.to_vec(),
            read_options: read_options.clone(),
        })?;

        let state = self.state.lock();
        let mut response = LookupResponse::default();
        for key in keys {
            match state.entities.get(&storage_key(key)) {
                Some(entity) => response.found.push(entity.clone()),
                None => response.missing.push(Entity::with_key(key.clone())),
            }
        }
        Ok(response)
    }

    fn run_query(&self, request: &QueryRequest) -> BackendResult<QueryResultBatch> {
        self.record(BackendCall::RunQuery(request.clone()))?;

        let mut state = self.state.lock();
        if let Some(page) = state.scripted_pages.pop_front() {
            return Ok(page);
        }

        let mut matches: Vec<&Entity> = state
            .entities
            .values()
            .filter(|entity| matches_query(entity, request))
            .collect();
        sort_results(&mut matches, &request.query);

        let start = match &request.start_cursor {
            Some(cursor) => decode_position(cursor)?,
            None => 0,
        };
        let end = match &request.end_cursor {
            Some(cursor) => decode_position(cursor)?.min(matches.len()),
            None => matches.len(),
        };
        let start = start.min(end);

        let available = end.saturating_sub(start);
        let skipped = request.offset.min(available);
        let position = start + skipped;

        let mut take = end - position;
        let mut more_results = MoreResults::NoMoreResults;
        if let Some(limit) = request.limit {
            if limit < take {
                take = limit;
                more_results = MoreResults::MoreResultsAfterLimit;
            }
        }
        if let Some(max) = state.max_page_size {
            if max < take {
                take = max;
                more_results = MoreResults::NotFinished;
            }
        }
        if more_results == MoreResults::NoMoreResults && end < matches.len() {
            more_results = MoreResults::MoreResultsAfterCursor;
        }

        let keys_only = request.query.is_keys_only();
        let entities = matches[position..position + take]
            .iter()
            .map(|entity| project_entity(entity, &request.query, keys_only))
            .collect();

        Ok(QueryResultBatch {
            entities,
            end_cursor: Some(encode_position(position + take)),
            skipped_results: skipped,
            more_results,
        })
    }

    fn allocate_id(&self, incomplete_key: &Key) -> BackendResult<IdOrName> {
        self.record(BackendCall::AllocateId(incomplete_key.clone()))?;
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        Ok(IdOrName::Id(id))
    }
}

fn storage_key(key: &Key) -> StorageKey {
    (
        key.project().to_string(),
        key.namespace().map(String::from),
        key.path().to_vec(),
    )
}

fn encode_position(position: usize) -> Cursor {
    Cursor::new((position as u64).to_be_bytes().to_vec())
}

fn decode_position(cursor: &Cursor) -> BackendResult<usize> {
    let bytes: [u8; 8] = cursor
        .as_bytes()
        .try_into()
        .map_err(|_| BackendError::InvalidArgument("malformed cursor".into()))?;
    Ok(u64::from_be_bytes(bytes) as usize)
}

fn matches_query(entity: &Entity, request: &QueryRequest) -> bool {
    let Some(key) = entity.key() else {
        return false;
    };
    if key.project() != request.project || key.namespace() != request.namespace.as_deref() {
        return false;
    }

    let query = &request.query;
    if let Some(kind) = &query.kind {
        if key.kind() != kind {
            return false;
        }
    }
    if let Some(ancestor) = &query.ancestor {
        if !key.path().starts_with(ancestor.path()) {
            return false;
        }
    }

    query.filters.iter().all(|filter| {
        let actual = if filter.property == KEY_PROPERTY {
            Value::Key(key.clone())
        } else {
            match entity.get(&filter.property) {
                Some(value) => value.clone(),
                None => return false,
            }
        };
        match compare_values(&actual, &filter.value) {
            Some(ordering) => match filter.operator {
                Operator::Equal => ordering == Ordering::Equal,
                Operator::LessThan => ordering == Ordering::Less,
                Operator::LessThanOrEqual => ordering != Ordering::Greater,
                Operator::GreaterThan => ordering == Ordering::Greater,
                Operator::GreaterThanOrEqual => ordering != Ordering::Less,
            },
            None => false,
        }
    })
}

fn sort_results(results: &mut [&Entity], query: &QuerySpec) {
    if query.order.is_empty() {
        return;
    }
    results.sort_by(|a, b| {
        for order in &query.order {
            let ordering = match (a.get(&order.property), b.get(&order.property)) {
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(y)),
        (Value::Double(x), Value::Double(y)) => x.partial_cmp(y),
        (Value::Integer(x), Value::Double(y)) => (*x as f64).partial_cmp(y),
        (Value::Double(x), Value::Integer(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Timestamp(x), Value::Timestamp(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Blob(x), Value::Blob(y)) => Some(x.cmp(y)),
        (Value::Key(x), Value::Key(y)) => Some(x.path().cmp(y.path())),
        _ => None,
    }
}

fn project_entity(entity: &Entity, query: &QuerySpec, keys_only: bool) -> Entity {
    if !keys_only && query.projection.is_empty() {
        return entity.clone();
    }

    let mut projected = Entity::new();
    if let Some(key) = entity.key() {
        projected.set_key(key.clone());
    }
    if !keys_only {
        for field in &query.projection {
            if let Some(value) = entity.get(field) {
                projected.insert(field.clone(), value.clone());
            }
        }
    }
    projected
}
