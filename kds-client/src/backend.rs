/// Storage backend capability consumed by the client core
///
/// The core never talks to storage directly: every mutation, commit,
/// rollback, lookup and query page goes through one blocking call on this
/// trait. Transport, encoding and retry policy belong to the implementation.
use crate::iterator::Cursor;
use crate::query::QuerySpec;
use crate::transaction::TransactionId;
use kds_core::{BackendError, Entity, IdOrName, Key};

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// One staged write
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Entity with a partial key; the backend assigns the identifier
    Insert(Entity),
    /// Entity with a complete key, written regardless of prior existence
    Upsert(Entity),
    /// Remove the entity stored under a complete key
    Delete(Key),
}

impl Mutation {
    pub fn key(&self) -> Option<&Key> {
        match self {
            Mutation::Insert(entity) | Mutation::Upsert(entity) => entity.key(),
            Mutation::Delete(key) => Some(key),
        }
    }

    pub fn entity(&self) -> Option<&Entity> {
        match self {
            Mutation::Insert(entity) | Mutation::Upsert(entity) => Some(entity),
            Mutation::Delete(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitMode {
    NonTransactional,
    Transactional(TransactionId),
}

/// Commit request: all staged mutations, in append order
#[derive(Debug, Clone)]
pub struct CommitRequest<'a> {
    pub project: &'a str,
    pub mode: CommitMode,
    pub mutations: &'a [Mutation],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitResponse {
    /// Identifiers assigned to `Insert` mutations, in the order they were staged
    pub ids: Vec<IdOrName>,
    /// Number of index writes performed
    pub index_updates: usize,
}

/// Read consistency of a lookup or query page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReadOptions {
    /// Strongly consistent, not pinned to a transaction
    #[default]
    Default,
    Eventual,
    InTransaction(TransactionId),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookupResponse {
    pub found: Vec<Entity>,
    /// Key-only entities for keys that do not exist
    pub missing: Vec<Entity>,
    /// Keys the backend did not get to; the caller may look them up again
    pub deferred: Vec<Key>,
}

/// Why a query page ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoreResults {
    /// More pages follow; continue from the end cursor
    NotFinished,
    MoreResultsAfterLimit,
    MoreResultsAfterCursor,
    NoMoreResults,
}

/// One query page request
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub project: String,
    pub namespace: Option<String>,
    pub query: QuerySpec,
    pub limit: Option<usize>,
    pub offset: usize,
    pub start_cursor: Option<Cursor>,
    pub end_cursor: Option<Cursor>,
    pub read_options: ReadOptions,
}

/// One query page response
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResultBatch {
    pub entities: Vec<Entity>,
    /// Position after the last entity of this page
    pub end_cursor: Option<Cursor>,
    /// Results skipped to honor the request offset
    pub skipped_results: usize,
    pub more_results: MoreResults,
}

/// Backend collaborator
pub trait Backend: Send + Sync {
    /// Establish session context for a client.
    fn connect(&self, _project: &str, _namespace: Option<&str>) -> BackendResult<()> {
        Ok(())
    }

    /// Start a unit of work for a batch.
    fn start(&self, _project: &str) -> BackendResult<()> {
        Ok(())
    }

    /// Issue a transaction token.
    fn begin_transaction(&self, project: &str, read_only: bool) -> BackendResult<TransactionId>;

    /// Apply all mutations of a batch in order.
    fn commit(&self, request: CommitRequest<'_>) -> BackendResult<CommitResponse>;

    /// Discard a unit of work.
    fn rollback(&self, project: &str, transaction: Option<&TransactionId>) -> BackendResult<()>;

    /// Bulk point lookup.
    fn lookup(
        &self,
        project: &str,
        keys: &[Key],
        read_options: &ReadOptions,
    ) -> BackendResult<LookupResponse>;

    /// Execute one page of a query.
    fn run_query(&self, request: &QueryRequest) -> BackendResult<QueryResultBatch>;

    /// Allocate a single fresh identifier for `incomplete_key`.
    fn allocate_id(&self, incomplete_key: &Key) -> BackendResult<IdOrName>;
}
