/// Staged mutation batches
///
/// A batch collects puts and deletes and sends them to the backend in one
/// commit. Its status only moves forward:
///
/// ```text
/// Initial -> InProgress -> Finished
///                       \-> Aborted
/// ```
///
/// Transactions are batches tagged [`BatchKind::Transaction`]; the
/// transaction-specific steps live in [`crate::transaction`].
use crate::backend::{Backend, CommitMode, CommitRequest, CommitResponse, Mutation};
use crate::client::Client;
use crate::transaction::TransactionId;
use kds_core::{Entity, Error, IdOrName, Key, Result};
use std::cell::{Ref, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Batch handle as held on a client's batch stack
pub type SharedBatch = Rc<RefCell<Batch>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Initial,
    InProgress,
    Aborted,
    Finished,
}

/// Capability tag of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchKind {
    Batch,
    Transaction {
        /// Backend-issued token; None until `begin()` obtains one
        id: Option<TransactionId>,
        read_only: bool,
    },
}

impl BatchKind {
    fn label(&self) -> &'static str {
        match self {
            BatchKind::Batch => "batch",
            BatchKind::Transaction { .. } => "transaction",
        }
    }
}

/// Mutation staging state machine shared by batches and transactions
pub struct Batch {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) project: String,
    namespace: Option<String>,
    pub(crate) kind: BatchKind,
    status: BatchStatus,
    mutations: Vec<Mutation>,
    /// Indices of `Insert` mutations, in staging order
    partial_key_entities: Vec<usize>,
}

impl Batch {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        project: impl Into<String>,
        namespace: Option<String>,
        kind: BatchKind,
    ) -> Self {
        Self {
            backend,
            project: project.into(),
            namespace,
            kind,
            status: BatchStatus::Initial,
            mutations: Vec::new(),
            partial_key_entities: Vec::new(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    pub fn kind(&self) -> &BatchKind {
        &self.kind
    }

    /// Mutations staged so far, in append order
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Entities that had a partial key when staged. After a successful
    /// commit their keys carry the backend-assigned identifiers.
    pub fn partial_key_entities(&self) -> impl Iterator<Item = &Entity> + '_ {
        self.partial_key_entities
            .iter()
            .filter_map(|&index| self.mutations[index].entity())
    }

    /// Begin the batch
    ///
    /// Fails unless the batch is in its initial state. Transactions also
    /// request a token from the backend.
    pub fn begin(&mut self) -> Result<()> {
        if self.status != BatchStatus::Initial {
            return Err(Error::State(format!(
                "{} already started previously",
                self.kind.label()
            )));
        }
        self.status = BatchStatus::InProgress;
        debug!(project = %self.project, kind = self.kind.label(), "begin");

        self.backend.start(&self.project)?;
        self.acquire_token();
        Ok(())
    }

    /// Stage `entity` to be saved on commit
    ///
    /// Entities with a partial key become `Insert` mutations and are
    /// remembered for id backfill; complete keys become `Upsert`, so the
    /// write does not depend on whether the entity already exists.
    pub fn put(&mut self, entity: &Entity) -> Result<()> {
        self.ensure_writable()?;
        self.ensure_in_progress("put")?;

        let key = entity
            .key()
            .ok_or_else(|| Error::Construction("Entity must have a key".to_string()))?;
        self.ensure_project(key)?;

        if key.is_partial() {
            self.partial_key_entities.push(self.mutations.len());
            self.mutations.push(Mutation::Insert(entity.clone()));
        } else {
            self.mutations.push(Mutation::Upsert(entity.clone()));
        }
        Ok(())
    }

    /// Stage `key` to be deleted on commit
    pub fn delete(&mut self, key: &Key) -> Result<()> {
        self.ensure_in_progress("delete")?;

        if key.is_partial() {
            return Err(Error::PartialKey(format!("Key must be complete: {}", key)));
        }
        self.ensure_project(key)?;

        self.mutations.push(Mutation::Delete(key.clone()));
        Ok(())
    }

    /// Commit the batch
    ///
    /// The batch is `Finished` afterwards even when the backend call fails;
    /// the backend error is returned after the bookkeeping completes. On
    /// success, returns the completed keys of the partial-key entities in
    /// staging order.
    pub fn commit(&mut self) -> Result<Vec<Key>> {
        self.ensure_in_progress("commit")?;

        let result = self.send_commit();
        self.status = BatchStatus::Finished;
        self.clear_token();

        let response = result?;
        debug!(
            project = %self.project,
            mutations = self.mutations.len(),
            index_updates = response.index_updates,
            "committed"
        );
        self.backfill(response.ids)
    }

    /// Roll back the batch
    ///
    /// Marks the batch as aborted; it can't be used again.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_in_progress("rollback")?;

        self.status = BatchStatus::Aborted;
        let result = self.backend.rollback(&self.project, self.id());
        self.clear_token();
        debug!(project = %self.project, kind = self.kind.label(), "rolled back");

        result.map_err(Error::from)
    }

    /// Begin the batch and push it onto `client`'s batch stack
    ///
    /// The batch is only pushed once `begin()` has succeeded. The returned
    /// guard pops it again on every exit path and commits or rolls back.
    pub fn enter(mut self, client: &Client) -> Result<BatchGuard<'_>> {
        if self.project != client.project() {
            return Err(Error::ProjectMismatch {
                expected: client.project().to_string(),
                found: self.project,
            });
        }

        self.begin()?;
        let batch = Rc::new(RefCell::new(self));
        client.push_batch(Rc::clone(&batch));

        Ok(BatchGuard {
            client,
            batch,
            released: false,
        })
    }

    fn send_commit(&self) -> Result<CommitResponse> {
        let mode = match self.id() {
            Some(id) => CommitMode::Transactional(id.clone()),
            None => CommitMode::NonTransactional,
        };

        let request = CommitRequest {
            project: &self.project,
            mode,
            mutations: &self.mutations,
        };

        Ok(self.backend.commit(request)?)
    }

    /// Complete partial keys positionally: the n-th returned id belongs to
    /// the n-th partial-key entity staged.
    fn backfill(&mut self, ids: Vec<IdOrName>) -> Result<Vec<Key>> {
        if ids.len() != self.partial_key_entities.len() {
            warn!(
                expected = self.partial_key_entities.len(),
                returned = ids.len(),
                "backend returned a different number of ids than partial keys staged"
            );
        }

        let mut completed = Vec::with_capacity(ids.len());
        for (&index, id) in self.partial_key_entities.iter().zip(ids) {
            if let Mutation::Insert(entity) = &mut self.mutations[index] {
                if let Some(key) = entity.key() {
                    let key = key.completed_key(id)?;
                    entity.set_key(key.clone());
                    completed.push(key);
                }
            }
        }
        Ok(completed)
    }

    fn ensure_in_progress(&self, operation: &str) -> Result<()> {
        if self.status != BatchStatus::InProgress {
            return Err(Error::State(format!(
                "Batch must be in progress to {}(), status is {:?}",
                operation, self.status
            )));
        }
        Ok(())
    }

    fn ensure_project(&self, key: &Key) -> Result<()> {
        if key.project() != self.project {
            return Err(Error::ProjectMismatch {
                expected: self.project.clone(),
                found: key.project().to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("project", &self.project)
            .field("namespace", &self.namespace)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("mutations", &self.mutations.len())
            .finish()
    }
}

/// Scope guard for a batch entered on a client
///
/// Exactly one of commit or rollback runs when the guard is released:
/// [`BatchGuard::commit`] on the normal path, rollback when the guard is
/// dropped without committing (early return, `?`, panic).
pub struct BatchGuard<'c> {
    client: &'c Client,
    batch: SharedBatch,
    released: bool,
}

impl<'c> BatchGuard<'c> {
    /// Stage an entity in the guarded batch
    pub fn put(&self, entity: &Entity) -> Result<()> {
        self.with_batch(|batch| batch.put(entity))
    }

    /// Stage a delete in the guarded batch
    pub fn delete(&self, key: &Key) -> Result<()> {
        self.with_batch(|batch| batch.delete(key))
    }

    pub fn status(&self) -> BatchStatus {
        self.batch.borrow().status()
    }

    /// Transaction token, if this is a transaction that obtained one
    pub fn id(&self) -> Option<TransactionId> {
        self.batch.borrow().id().cloned()
    }

    /// Borrow the guarded batch for inspection
    pub fn batch(&self) -> Ref<'_, Batch> {
        self.batch.borrow()
    }

    /// Shared handle to the guarded batch; stays usable after release
    pub fn handle(&self) -> SharedBatch {
        Rc::clone(&self.batch)
    }

    /// Commit and pop the batch
    pub fn commit(mut self) -> Result<Vec<Key>> {
        self.released = true;
        let result = self.with_batch(Batch::commit);
        let popped = self.pop();
        let keys = result?;
        popped?;
        Ok(keys)
    }

    /// Roll back and pop the batch
    pub fn rollback(mut self) -> Result<()> {
        self.released = true;
        let result = self.with_batch(Batch::rollback);
        let popped = self.pop();
        result?;
        popped
    }

    fn with_batch<T>(&self, f: impl FnOnce(&mut Batch) -> Result<T>) -> Result<T> {
        let mut batch = self
            .batch
            .try_borrow_mut()
            .map_err(|_| Error::Usage("batch is already borrowed".to_string()))?;
        f(&mut *batch)
    }

    fn pop(&self) -> Result<()> {
        let popped = self.client.pop_batch()?;
        if !Rc::ptr_eq(&popped, &self.batch) {
            warn!("popped a batch other than the one being released; scopes were not nested");
        }
        Ok(())
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if std::thread::panicking() {
            debug!("rolling back batch during unwind");
        }
        if let Err(e) = self.with_batch(Batch::rollback) {
            warn!("rollback on scope exit failed: {}", e);
        }
        if let Err(e) = self.pop() {
            warn!("pop on scope exit failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingBackend;
    use kds_core::key_path;

    fn batch(backend: &Arc<RecordingBackend>) -> Batch {
        Batch::new(backend.clone(), "p", None, BatchKind::Batch)
    }

    fn entity(path: Vec<kds_core::PathArg>) -> Entity {
        Entity::with_key(Key::new("p", path).unwrap()).with_property("name", "x")
    }

    #[test]
    fn test_state_transitions() {
        let backend = Arc::new(RecordingBackend::default());
        let mut b = batch(&backend);
        assert_eq!(b.status(), BatchStatus::Initial);

        assert!(matches!(b.commit(), Err(Error::State(_))));
        assert!(matches!(b.rollback(), Err(Error::State(_))));

        b.begin().unwrap();
        assert_eq!(b.status(), BatchStatus::InProgress);
        assert!(matches!(b.begin(), Err(Error::State(_))));

        b.commit().unwrap();
        assert_eq!(b.status(), BatchStatus::Finished);
        assert!(matches!(b.begin(), Err(Error::State(_))));
        assert!(matches!(b.rollback(), Err(Error::State(_))));
    }

    #[test]
    fn test_put_requires_key_and_project() {
        let backend = Arc::new(RecordingBackend::default());
        let mut b = batch(&backend);
        b.begin().unwrap();

        assert!(matches!(b.put(&Entity::new()), Err(Error::Construction(_))));

        let foreign = Entity::with_key(Key::new("other", key_path!["A", 1]).unwrap());
        assert!(matches!(
            b.put(&foreign),
            Err(Error::ProjectMismatch { .. })
        ));
        assert!(b.mutations().is_empty());
    }

    #[test]
    fn test_insert_vs_upsert() {
        let backend = Arc::new(RecordingBackend::default());
        let mut b = batch(&backend);
        b.begin().unwrap();

        b.put(&entity(key_path!["A"])).unwrap();
        b.put(&entity(key_path!["A", 1])).unwrap();
        b.delete(&Key::new("p", key_path!["A", 2]).unwrap()).unwrap();

        assert!(matches!(b.mutations()[0], Mutation::Insert(_)));
        assert!(matches!(b.mutations()[1], Mutation::Upsert(_)));
        assert!(matches!(b.mutations()[2], Mutation::Delete(_)));
        assert_eq!(b.partial_key_entities().count(), 1);
    }

    #[test]
    fn test_delete_rejects_partial_key() {
        let backend = Arc::new(RecordingBackend::default());
        let mut b = batch(&backend);
        b.begin().unwrap();

        let partial = Key::new("p", key_path!["A"]).unwrap();
        assert!(matches!(b.delete(&partial), Err(Error::PartialKey(_))));
    }

    #[test]
    fn test_commit_backfills_in_order() {
        let backend = Arc::new(RecordingBackend::default());
        let mut b = batch(&backend);
        b.begin().unwrap();

        b.put(&entity(key_path!["A"])).unwrap();
        b.put(&entity(key_path!["B", 5])).unwrap();
        b.put(&entity(key_path!["C"])).unwrap();

        let keys = b.commit().unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].kind(), "A");
        assert_eq!(keys[1].kind(), "C");
        assert!(keys[0].id().unwrap() < keys[1].id().unwrap());
        assert!(b.partial_key_entities().all(|e| !e.key().unwrap().is_partial()));
    }

    #[test]
    fn test_commit_failure_still_finishes() {
        let backend = Arc::new(RecordingBackend::default());
        backend.fail_commit();
        let mut b = batch(&backend);
        b.begin().unwrap();
        b.put(&entity(key_path!["A"])).unwrap();

        assert!(matches!(b.commit(), Err(Error::Backend(_))));
        assert_eq!(b.status(), BatchStatus::Finished);
        assert!(b.mutations()[0].key().unwrap().is_partial());
    }

    #[test]
    fn test_rollback_aborts() {
        let backend = Arc::new(RecordingBackend::default());
        let mut b = batch(&backend);
        b.begin().unwrap();
        b.rollback().unwrap();
        assert_eq!(b.status(), BatchStatus::Aborted);
        assert!(matches!(
            b.put(&entity(key_path!["A", 1])),
            Err(Error::State(_))
        ));
        assert_eq!(backend.rollbacks(), 1);
    }
}
