//! In-crate recording backend for unit tests

use crate::backend::{
    Backend, BackendResult, CommitMode, CommitRequest, CommitResponse, LookupResponse, Mutation,
    QueryRequest, QueryResultBatch, ReadOptions,
};
use crate::transaction::TransactionId;
use kds_core::{BackendError, IdOrName, Key};
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Default)]
struct State {
    next_id: i64,
    next_token: u32,
    commits: Vec<CommitMode>,
    rollbacks: usize,
    lookups: Vec<ReadOptions>,
    queries: Vec<QueryRequest>,
    pages: VecDeque<QueryResultBatch>,
    fail_commit: bool,
    fail_begin: bool,
    fail_query: bool,
    fail_allocate: bool,
}

#[derive(Default)]
pub(crate) struct RecordingBackend {
    state: Mutex<State>,
}

impl RecordingBackend {
    pub fn fail_commit(&self) {
        self.state.lock().fail_commit = true;
    }

    pub fn fail_begin_transaction(&self) {
        self.state.lock().fail_begin = true;
    }

    pub fn fail_query(&self) {
        self.state.lock().fail_query = true;
    }

    pub fn fail_allocate(&self) {
        self.state.lock().fail_allocate = true;
    }

    pub fn push_page(&self, page: QueryResultBatch) {
        self.state.lock().pages.push_back(page);
    }

    pub fn commits(&self) -> usize {
        self.state.lock().commits.len()
    }

    pub fn last_commit_mode(&self) -> Option<CommitMode> {
        self.state.lock().commits.last().cloned()
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn lookups(&self) -> usize {
        self.state.lock().lookups.len()
    }

    pub fn last_read_options(&self) -> Option<ReadOptions> {
        self.state.lock().lookups.last().cloned()
    }

    pub fn query_requests(&self) -> Vec<QueryRequest> {
        self.state.lock().queries.clone()
    }

    fn next_id(state: &mut State) -> i64 {
        state.next_id += 1;
        state.next_id
    }
}

impl Backend for RecordingBackend {
    fn begin_transaction(&self, _project: &str, _read_only: bool) -> BackendResult<TransactionId> {
        let mut state = self.state.lock();
        if state.fail_begin {
            return Err(BackendError::Unavailable("begin".into()));
        }
        state.next_token += 1;
        Ok(TransactionId::new(state.next_token.to_be_bytes().to_vec()))
    }

    fn commit(&self, request: CommitRequest<'_>) -> BackendResult<CommitResponse> {
        let mut state = self.state.lock();
        state.commits.push(request.mode.clone());
        if state.fail_commit {
            return Err(BackendError::Aborted("commit".into()));
        }

        let mut ids = Vec::new();
        for mutation in request.mutations {
            if let Mutation::Insert(_) = mutation {
                ids.push(IdOrName::Id(Self::next_id(&mut state)));
            }
        }
        Ok(CommitResponse {
            ids,
            index_updates: request.mutations.len(),
        })
    }

    fn rollback(&self, _project: &str, _transaction: Option<&TransactionId>) -> BackendResult<()> {
        self.state.lock().rollbacks += 1;
        Ok(())
    }

    fn lookup(
        &self,
        _project: &str,
        _keys: &[Key],
        read_options: &ReadOptions,
    ) -> BackendResult<LookupResponse> {
        self.state.lock().lookups.push(read_options.clone());
        Ok(LookupResponse::default())
    }

    fn run_query(&self, request: &QueryRequest) -> BackendResult<QueryResultBatch> {
        let mut state = self.state.lock();
        state.queries.push(request.clone());
        if state.fail_query {
            return Err(BackendError::Unavailable("query".into()));
        }
        Ok(state.pages.pop_front().unwrap_or(QueryResultBatch {
            entities: Vec::new(),
            end_cursor: None,
            skipped_results: 0,
            more_results: crate::backend::MoreResults::NoMoreResults,
        }))
    }

    fn allocate_id(&self, _incomplete_key: &Key) -> BackendResult<IdOrName> {
        let mut state = self.state.lock();
        if state.fail_allocate {
            return Err(BackendError::Unimplemented("allocate".into()));
        }
        Ok(IdOrName::Id(Self::next_id(&mut state)))
    }
}
