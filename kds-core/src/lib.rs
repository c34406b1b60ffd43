//! Key, entity and value model shared by the datastore client crates.

pub mod error;
pub mod types;
pub mod key;
pub mod entity;

pub use entity::Entity;
pub use error::{BackendError, Error, Result};
pub use key::{Key, KeyBuilder};
pub use types::*;
