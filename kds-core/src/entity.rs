use crate::{Key, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A property record optionally bound to a [`Key`].
///
/// The entity stores no kind or id of its own; both are read through the
/// key. Two entities are equal when their keys, excluded-from-index sets,
/// meanings and properties all match. An entity carrying a partial key is
/// therefore never equal to another entity.
///
/// Properties are kept sorted by name, and [`Entity::iter`] and
/// [`Entity::properties`] yield them in that order regardless of the order
/// they were inserted in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    key: Option<Key>,
    exclude_from_indexes: BTreeSet<String>,
    meanings: BTreeMap<String, i32>,
    properties: BTreeMap<String, Value>,
}

impl Entity {
    /// Create an empty entity with no key
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty entity bound to `key`
    pub fn with_key(key: Key) -> Self {
        Self {
            key: Some(key),
            ..Self::default()
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Builder-style index exclusion.
    pub fn with_exclude_from_indexes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_from_indexes = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    pub fn set_key(&mut self, key: Key) {
        self.key = Some(key);
    }

    pub fn take_key(&mut self) -> Option<Key> {
        self.key.take()
    }

    /// Kind of the bound key, if any.
    pub fn kind(&self) -> Option<&str> {
        self.key.as_ref().map(Key::kind)
    }

    /// Integer id of the bound key, if any.
    pub fn id(&self) -> Option<i64> {
        self.key.as_ref().and_then(Key::id)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.properties.get_mut(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.properties.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.properties.iter()
    }

    pub fn exclude_from_indexes(&self) -> &BTreeSet<String> {
        &self.exclude_from_indexes
    }

    pub fn exclude_from_indexes_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.exclude_from_indexes
    }

    /// Meanings side-map: property name to the backend's meaning code.
    pub fn meanings(&self) -> &BTreeMap<String, i32> {
        &self.meanings
    }

    pub fn meanings_mut(&mut self) -> &mut BTreeMap<String, i32> {
        &mut self.meanings
    }
}

impl Extend<(String, Value)> for Entity {
    fn extend<T: IntoIterator<Item = (String, Value)>>(&mut self, iter: T) {
        self.properties.extend(iter);
    }
}
