//! Client core of the datastore: batches, transactions and paginated queries
//!
//! # Example
//!
//! ```ignore
//! use kds_client::{Client, ClientConfig, FetchOptions};
//! use kds_core::{key_path, Entity};
//!
//! let client = Client::new(ClientConfig::new("my-project"), backend)?;
//!
//! let mut person = Entity::with_key(client.key(key_path!["Person"])?)
//!     .with_property("age", 30);
//! client.put(&mut person)?;
//! assert!(!person.key().unwrap().is_partial());
//!
//! client.run_in_transaction(|txn| {
//!     txn.put(&person)?;
//!     Ok::<_, kds_core::Error>(())
//! })?;
//!
//! let mut query = client.query("Person")?;
//! query.add_filter("age", ">", 21)?;
//! for entity in query.fetch(FetchOptions::new()).items()? {
//!     println!("{:?}", entity?);
//! }
//! ```

pub mod backend;
pub mod batch;
pub mod client;
pub mod config;
pub mod iterator;
pub mod query;
pub mod transaction;

#[cfg(test)]
mod test_support;

pub use backend::{
    Backend, BackendResult, CommitMode, CommitRequest, CommitResponse, LookupResponse,
    MoreResults, Mutation, QueryRequest, QueryResultBatch, ReadOptions,
};
pub use batch::{Batch, BatchGuard, BatchKind, BatchStatus, SharedBatch};
pub use client::{BatchStack, Client, GetOptions, KeyOptions};
pub use config::ClientConfig;
pub use iterator::{Cursor, FetchOptions, Items, Page, Pages, QueryIterator};
pub use query::{
    Direction, FieldList, Filter, Operator, PropertyOrder, Query, QueryOptions, QuerySpec,
    KEY_PROPERTY,
};
pub use transaction::TransactionId;

pub use kds_core::{BackendError, Entity, Error, IdOrName, Key, KeyBuilder, PathArg, Result, Value};
