/// Datastore client
///
/// A [`Client`] scopes keys, batches and queries to one project, owns the
/// stack of active batches and routes every storage call through its
/// [`Backend`]. It is meant for single-threaded use; separate clients may
/// share one backend.
use crate::backend::{Backend, LookupResponse, ReadOptions};
use crate::batch::{Batch, BatchGuard, BatchKind, SharedBatch};
use crate::config::ClientConfig;
use crate::query::{Query, QueryOptions};
use crate::transaction::TransactionId;
use kds_core::{Entity, Error, IdOrName, Key, KeyBuilder, PathArg, Result};
use rand::Rng;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Upper bound (exclusive) of the random part of a fallback id
const FALLBACK_ID_RANDOM_BOUND: i64 = 10_000_000_000_000;

/// LIFO stack of active batches
#[derive(Default)]
pub struct BatchStack {
    batches: Vec<SharedBatch>,
}

impl BatchStack {
    pub fn push(&mut self, batch: SharedBatch) {
        self.batches.push(batch);
    }

    pub fn pop(&mut self) -> Result<SharedBatch> {
        self.batches.pop().ok_or(Error::Underflow)
    }

    pub fn top(&self) -> Option<&SharedBatch> {
        self.batches.last()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Read options for [`Client::get_with`] and friends
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Read inside this transaction instead of the current one
    pub transaction: Option<TransactionId>,
    pub eventual: bool,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction(mut self, transaction: TransactionId) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn eventual(mut self, eventual: bool) -> Self {
        self.eventual = eventual;
        self
    }
}

/// Options for [`Client::key_with`]
#[derive(Debug, Clone, Default)]
pub struct KeyOptions {
    pub parent: Option<Key>,
    pub namespace: Option<String>,
    pub project: Option<String>,
}

impl KeyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parent(mut self, parent: Key) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }
}

pub struct Client {
    config: ClientConfig,
    backend: Arc<dyn Backend>,
    batches: RefCell<BatchStack>,
}

impl Client {
    /// Create a client and connect it to `backend`
    pub fn new(config: ClientConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        config.validate().map_err(Error::Construction)?;
        backend.connect(&config.project, config.namespace.as_deref())?;
        debug!(project = %config.project, namespace = ?config.namespace, "client connected");

        Ok(Self {
            config,
            backend,
            batches: RefCell::new(BatchStack::default()),
        })
    }

    pub fn project(&self) -> &str {
        &self.config.project
    }

    pub fn namespace(&self) -> Option<&str> {
        self.config.namespace.as_deref()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub(crate) fn push_batch(&self, batch: SharedBatch) {
        self.batches.borrow_mut().push(batch);
    }

    pub(crate) fn pop_batch(&self) -> Result<SharedBatch> {
        self.batches.borrow_mut().pop()
    }

    /// Number of batches currently entered
    pub fn batch_depth(&self) -> usize {
        self.batches.borrow().len()
    }

    /// Topmost active batch or transaction
    pub fn current_batch(&self) -> Option<SharedBatch> {
        self.batches.borrow().top().cloned()
    }

    /// Topmost active batch, only if it is a transaction
    pub fn current_transaction(&self) -> Option<SharedBatch> {
        self.current_batch()
            .filter(|batch| batch.borrow().is_transaction())
    }

    /// Token of the current transaction, if it obtained one
    pub fn current_transaction_id(&self) -> Option<TransactionId> {
        self.current_transaction()
            .and_then(|txn| txn.borrow().id().cloned())
    }

    /// Resolve read consistency: explicit transaction, else the current one,
    /// else eventual or default reads
    pub(crate) fn read_options(
        &self,
        transaction: Option<&TransactionId>,
        eventual: bool,
    ) -> Result<ReadOptions> {
        let transaction = transaction.cloned().or_else(|| self.current_transaction_id());
        match (transaction, eventual) {
            (Some(_), true) => Err(Error::Construction(
                "eventual must not be set when reading in a transaction".to_string(),
            )),
            (Some(id), false) => Ok(ReadOptions::InTransaction(id)),
            (None, true) => Ok(ReadOptions::Eventual),
            (None, false) => Ok(ReadOptions::Default),
        }
    }

    /// Look up one entity
    pub fn get(&self, key: &Key) -> Result<Option<Entity>> {
        self.get_with(key, GetOptions::default())
    }

    pub fn get_with(&self, key: &Key, options: GetOptions) -> Result<Option<Entity>> {
        let found = self.get_multi_with(std::slice::from_ref(key), options)?;
        Ok(found.into_iter().next())
    }

    /// Look up several entities; keys that do not exist are left out
    pub fn get_multi(&self, keys: &[Key]) -> Result<Vec<Entity>> {
        self.get_multi_with(keys, GetOptions::default())
    }

    pub fn get_multi_with(&self, keys: &[Key], options: GetOptions) -> Result<Vec<Entity>> {
        Ok(self.get_multi_detailed(keys, options)?.found)
    }

    /// Look up several entities, also reporting missing and deferred keys
    pub fn get_multi_detailed(&self, keys: &[Key], options: GetOptions) -> Result<LookupResponse> {
        if keys.is_empty() {
            return Ok(LookupResponse::default());
        }
        for key in keys {
            self.ensure_project(key)?;
        }

        let read_options = self.read_options(options.transaction.as_ref(), options.eventual)?;
        let response = self.backend.lookup(self.project(), keys, &read_options)?;
        debug!(
            keys = keys.len(),
            found = response.found.len(),
            missing = response.missing.len(),
            deferred = response.deferred.len(),
            "lookup"
        );
        Ok(response)
    }

    /// Save one entity; see [`Client::put_multi`]
    pub fn put(&self, entity: &mut Entity) -> Result<()> {
        self.put_multi(std::slice::from_mut(entity))
    }

    /// Save entities
    ///
    /// Inside an entered batch the entities are only staged as copies and
    /// `entities` is left untouched; the completed keys come back from
    /// [`BatchGuard::commit`](crate::BatchGuard::commit). Otherwise they are
    /// written in one implicit batch, and partial keys of `entities` are
    /// replaced with the completed keys. That implicit path is the only one
    /// that writes back through the `&mut` borrow.
    pub fn put_multi(&self, entities: &mut [Entity]) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }

        if let Some(batch) = self.current_batch() {
            let mut batch = borrow_active(&batch)?;
            for entity in entities.iter() {
                batch.put(entity)?;
            }
            return Ok(());
        }

        let mut batch = self.batch();
        batch.begin()?;
        for entity in entities.iter() {
            if let Err(e) = batch.put(entity) {
                rollback_implicit(&mut batch);
                return Err(e);
            }
        }
        let mut completed = batch.commit()?.into_iter();

        for entity in entities.iter_mut() {
            if entity.key().is_some_and(Key::is_partial) {
                match completed.next() {
                    Some(key) => entity.set_key(key),
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// Delete one entity; see [`Client::delete_multi`]
    pub fn delete(&self, key: &Key) -> Result<()> {
        self.delete_multi(std::slice::from_ref(key))
    }

    /// Delete entities, staged in the entered batch or in one implicit batch
    pub fn delete_multi(&self, keys: &[Key]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        if let Some(batch) = self.current_batch() {
            let mut batch = borrow_active(&batch)?;
            for key in keys {
                batch.delete(key)?;
            }
            return Ok(());
        }

        let mut batch = self.batch();
        batch.begin()?;
        for key in keys {
            if let Err(e) = batch.delete(key) {
                rollback_implicit(&mut batch);
                return Err(e);
            }
        }
        batch.commit()?;
        Ok(())
    }

    /// Allocate identifiers for a partial key
    ///
    /// Only one id per call is supported. If the backend cannot allocate,
    /// a time-and-random id is used instead; such ids are not guaranteed to
    /// be unique.
    pub fn allocate_ids(&self, incomplete_key: &Key, num_ids: usize) -> Result<Vec<Key>> {
        if !incomplete_key.is_partial() {
            return Err(Error::Construction(format!(
                "Key is not partial: {}",
                incomplete_key
            )));
        }
        if num_ids != 1 {
            return Err(Error::Construction(format!(
                "Only one id can be allocated at a time, requested {}",
                num_ids
            )));
        }

        let id = match self.backend.allocate_id(incomplete_key) {
            Ok(id) => id,
            Err(e) => {
                let id = fallback_id();
                warn!(key = %incomplete_key, id, "id allocation failed, using fallback id: {}", e);
                IdOrName::Id(id)
            }
        };

        Ok(vec![incomplete_key.completed_key(id)?])
    }

    /// Build a key in this client's project and namespace
    pub fn key(&self, path_args: Vec<PathArg>) -> Result<Key> {
        self.key_builder(path_args).build()
    }

    /// Key builder preset with this client's project and namespace
    pub fn key_builder(&self, path_args: Vec<PathArg>) -> KeyBuilder {
        let builder = Key::builder(path_args).project(self.project());
        match self.namespace() {
            Some(namespace) => builder.namespace(namespace),
            None => builder,
        }
    }

    pub fn key_with(&self, path_args: Vec<PathArg>, options: KeyOptions) -> Result<Key> {
        if let Some(project) = &options.project {
            if project != self.project() {
                return Err(Error::Construction(format!(
                    "Cannot pass project {:?} to a client of project {:?}",
                    project,
                    self.project()
                )));
            }
        }

        let mut builder = self.key_builder(path_args);
        if let Some(namespace) = options.namespace {
            builder = builder.namespace(namespace);
        }
        if let Some(parent) = options.parent {
            builder = builder.parent(parent);
        }
        builder.build()
    }

    /// New batch bound to this client's project; enter it with [`Batch::enter`]
    pub fn batch(&self) -> Batch {
        Batch::new(
            Arc::clone(&self.backend),
            self.project(),
            self.config.namespace.clone(),
            BatchKind::Batch,
        )
    }

    /// New transaction bound to this client's project
    pub fn transaction(&self, read_only: bool) -> Batch {
        Batch::new(
            Arc::clone(&self.backend),
            self.project(),
            self.config.namespace.clone(),
            BatchKind::Transaction {
                id: None,
                read_only,
            },
        )
    }

    /// Query on `kind` in this client's project and namespace
    pub fn query(&self, kind: impl Into<String>) -> Result<Query<'_>> {
        self.query_with(QueryOptions::new().kind(kind))
    }

    pub fn query_with(&self, options: QueryOptions) -> Result<Query<'_>> {
        if let Some(project) = &options.project {
            if project != self.project() {
                return Err(Error::Construction(format!(
                    "Cannot pass project {:?} to a client of project {:?}",
                    project,
                    self.project()
                )));
            }
        }

        let namespace = options
            .namespace
            .clone()
            .or_else(|| self.config.namespace.clone())
            .filter(|ns| !ns.is_empty());
        let mut query = Query::new(self, self.project().to_string(), namespace);
        query.apply(options)?;
        Ok(query)
    }

    /// Run `f` inside an entered batch; commit on `Ok`, roll back on `Err`
    pub fn run_in_batch<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&BatchGuard<'_>) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        run_guarded(self.batch().enter(self)?, f)
    }

    /// Run `f` inside an entered transaction; commit on `Ok`, roll back on `Err`
    pub fn run_in_transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&BatchGuard<'_>) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        run_guarded(self.transaction(false).enter(self)?, f)
    }

    fn ensure_project(&self, key: &Key) -> Result<()> {
        if key.project() != self.project() {
            return Err(Error::ProjectMismatch {
                expected: self.project().to_string(),
                found: key.project().to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("project", &self.config.project)
            .field("namespace", &self.config.namespace)
            .field("batch_depth", &self.batch_depth())
            .finish()
    }
}

fn run_guarded<T, E, F>(guard: BatchGuard<'_>, f: F) -> std::result::Result<T, E>
where
    F: FnOnce(&BatchGuard<'_>) -> std::result::Result<T, E>,
    E: From<Error>,
{
    match f(&guard) {
        Ok(value) => {
            guard.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = guard.rollback() {
                warn!("rollback after failed scope also failed: {}", rollback_err);
            }
            Err(e)
        }
    }
}

fn borrow_active(batch: &SharedBatch) -> Result<std::cell::RefMut<'_, Batch>> {
    batch
        .try_borrow_mut()
        .map_err(|_| Error::Usage("current batch is already borrowed".to_string()))
}

fn rollback_implicit(batch: &mut Batch) {
    if let Err(e) = batch.rollback() {
        warn!("rollback of implicit batch failed: {}", e);
    }
}

/// Best-effort id: milliseconds since the epoch XOR a random number
fn fallback_id() -> i64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let mut rng = rand::thread_rng();
    match millis ^ rng.gen_range(1..FALLBACK_ID_RANDOM_BOUND) {
        0 => rng.gen_range(1..FALLBACK_ID_RANDOM_BOUND),
        id => id,
    }
}
