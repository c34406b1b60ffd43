//! Composite hierarchical keys.
//!
//! A key is an ordered path of `{kind, id|name}` elements scoped to a
//! project and an optional namespace. Only the final element may lack an
//! identifier; such a key is *partial* and can be completed once the
//! backend has assigned an id.

use crate::{Error, IdOrName, PathArg, PathElement, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// Immutable composite key.
///
/// Equality is not reflexive for partial keys: a partial key never compares
/// equal to anything, itself included. For that reason `Key` implements
/// `PartialEq` and `Hash` but not `Eq`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "KeyRepr", into = "KeyRepr")]
pub struct Key {
    path: Vec<PathElement>,
    flat_path: Vec<PathArg>,
    project: String,
    namespace: Option<String>,
    parent: OnceLock<Option<Box<Key>>>,
}

impl Key {
    /// Start building a key from flat `kind, identifier, ...` arguments.
    pub fn builder(path_args: Vec<PathArg>) -> KeyBuilder {
        KeyBuilder::new(path_args)
    }

    /// Build a root-level key in `project` with no namespace.
    pub fn new(project: impl Into<String>, path_args: Vec<PathArg>) -> Result<Self> {
        KeyBuilder::new(path_args).project(project).build()
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Structured path, root first.
    pub fn path(&self) -> &[PathElement] {
        &self.path
    }

    /// Flat `kind, identifier, ...` arguments, parent prefix included.
    pub fn flat_path(&self) -> &[PathArg] {
        &self.flat_path
    }

    /// Kind of the final path element.
    pub fn kind(&self) -> &str {
        &self.last().kind
    }

    pub fn id(&self) -> Option<i64> {
        self.last().id()
    }

    pub fn name(&self) -> Option<&str> {
        self.last().name()
    }

    pub fn id_or_name(&self) -> Option<&IdOrName> {
        self.last().id_or_name.as_ref()
    }

    /// True iff the final path element has neither an id nor a name.
    pub fn is_partial(&self) -> bool {
        self.last().is_partial()
    }

    /// Parent key: this path minus its final element, in the same project and
    /// namespace. `None` for root-level keys. Computed once, then cached.
    pub fn parent(&self) -> Option<&Key> {
        self.parent
            .get_or_init(|| self.make_parent().map(Box::new))
            .as_deref()
    }

    /// Return a new complete key with `id_or_name` filled into the final
    /// element. `self` is left untouched.
    pub fn completed_key(&self, id_or_name: impl Into<IdOrName>) -> Result<Key> {
        if !self.is_partial() {
            return Err(Error::PartialKey(format!(
                "only a partial key can be completed: {}",
                self
            )));
        }

        let id_or_name = id_or_name.into().validated()?;

        let mut path = self.path.clone();
        let mut flat_path = self.flat_path.clone();
        flat_path.push(PathArg::from(id_or_name.clone()));
        if let Some(last) = path.last_mut() {
            last.id_or_name = Some(id_or_name);
        }

        Ok(Key {
            path,
            flat_path,
            project: self.project.clone(),
            namespace: self.namespace.clone(),
            // Completing the final element leaves the parent unchanged.
            parent: self.parent.clone(),
        })
    }

    fn last(&self) -> &PathElement {
        // Construction rejects empty paths.
        &self.path[self.path.len() - 1]
    }

    fn make_parent(&self) -> Option<Key> {
        let dropped = if self.is_partial() { 1 } else { 2 };
        let flat_len = self.flat_path.len().saturating_sub(dropped);
        if flat_len == 0 {
            return None;
        }

        Some(Key {
            path: self.path[..self.path.len() - 1].to_vec(),
            flat_path: self.flat_path[..flat_len].to_vec(),
            project: self.project.clone(),
            namespace: self.namespace.clone(),
            parent: OnceLock::new(),
        })
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        if self.is_partial() || other.is_partial() {
            return false;
        }

        self.flat_path == other.flat_path
            && self.project == other.project
            && self.namespace == other.namespace
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.flat_path.hash(state);
        self.project.hash(state);
        self.namespace.hash(state);
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("project", &self.project)
            .field("namespace", &self.namespace)
            .field("flat_path", &self.flat_path)
            .finish()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, element) in self.path.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", element)?;
        }
        Ok(())
    }
}

/// Builder for [`Key`].
#[derive(Debug, Clone, Default)]
pub struct KeyBuilder {
    path_args: Vec<PathArg>,
    project: Option<String>,
    namespace: Option<String>,
    parent: Option<Key>,
}

impl KeyBuilder {
    pub fn new(path_args: Vec<PathArg>) -> Self {
        Self {
            path_args,
            ..Self::default()
        }
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// An empty namespace is treated as no namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.namespace = if namespace.is_empty() {
            None
        } else {
            Some(namespace)
        };
        self
    }

    pub fn parent(mut self, parent: Key) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn build(self) -> Result<Key> {
        let mut path = parse_path(&self.path_args)?;
        let mut flat_path = self.path_args;

        let Some(parent) = self.parent else {
            let project = self
                .project
                .filter(|p| !p.is_empty())
                .ok_or_else(|| Error::construction("a key requires a project"))?;
            return Ok(Key {
                path,
                flat_path,
                project,
                namespace: self.namespace,
                parent: OnceLock::new(),
            });
        };

        if parent.is_partial() {
            return Err(Error::construction(format!(
                "parent key must be complete: {}",
                parent
            )));
        }

        if let Some(namespace) = &self.namespace {
            if parent.namespace() != Some(namespace.as_str()) {
                return Err(Error::construction(format!(
                    "namespace {:?} does not match parent namespace {:?}",
                    namespace,
                    parent.namespace()
                )));
            }
        }

        if let Some(project) = &self.project {
            if project != parent.project() {
                return Err(Error::construction(format!(
                    "project {:?} does not match parent project {:?}",
                    project,
                    parent.project()
                )));
            }
        }

        let child_len = path.len();
        let mut full_path = parent.path.clone();
        full_path.append(&mut path);
        let mut full_flat_path = parent.flat_path.clone();
        full_flat_path.append(&mut flat_path);

        let project = parent.project.clone();
        let namespace = parent.namespace.clone();
        // The given parent is the derived one only for a single-element child.
        let cached_parent = if child_len == 1 {
            OnceLock::from(Some(Box::new(parent)))
        } else {
            OnceLock::new()
        };

        Ok(Key {
            path: full_path,
            flat_path: full_flat_path,
            project,
            namespace,
            parent: cached_parent,
        })
    }
}

/// Split flat arguments into path elements: even positions are kinds, odd
/// positions identifiers. An odd count leaves the final element partial.
fn parse_path(path_args: &[PathArg]) -> Result<Vec<PathElement>> {
    if path_args.is_empty() {
        return Err(Error::construction("key path must not be empty"));
    }

    path_args
        .chunks(2)
        .map(|pair| {
            let kind = match &pair[0] {
                PathArg::Str(kind) if !kind.is_empty() => kind.clone(),
                PathArg::Str(_) => return Err(Error::construction("kind must not be empty")),
                PathArg::Int(n) => {
                    return Err(Error::construction(format!(
                        "kind must be a string, got integer {}",
                        n
                    )))
                }
            };

            let id_or_name = match pair.get(1) {
                Some(arg) => Some(IdOrName::from(arg.clone()).validated()?),
                None => None,
            };

            Ok(PathElement { kind, id_or_name })
        })
        .collect()
}

/// Serialized form; deserializing re-runs the construction rules.
#[derive(Serialize, Deserialize)]
struct KeyRepr {
    project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    path: Vec<PathArg>,
}

impl TryFrom<KeyRepr> for Key {
    type Error = Error;

    fn try_from(repr: KeyRepr) -> Result<Self> {
        let mut builder = KeyBuilder::new(repr.path).project(repr.project);
        if let Some(namespace) = repr.namespace {
            builder = builder.namespace(namespace);
        }
        builder.build()
    }
}

impl From<Key> for KeyRepr {
    fn from(key: Key) -> Self {
        KeyRepr {
            project: key.project,
            namespace: key.namespace,
            path: key.flat_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_path;
    use proptest::prelude::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(key: &Key) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_partial_key() {
        let key = Key::new("p1", key_path!["Person"]).unwrap();
        assert!(key.is_partial());
        assert_eq!(key.kind(), "Person");
        assert_eq!(key.id_or_name(), None);

        let done = key.completed_key(42).unwrap();
        assert!(!done.is_partial());
        assert_eq!(done.flat_path(), &key_path!["Person", 42][..]);
        assert_eq!(done.id(), Some(42));

        // The receiver stays partial.
        assert!(key.is_partial());
    }

    #[test]
    fn test_completed_key_on_complete_key_fails() {
        let key = Key::new("p1", key_path!["Person", 1]).unwrap();
        assert!(matches!(key.completed_key(2), Err(Error::PartialKey(_))));
        assert!(matches!(
            key.completed_key("bob"),
            Err(Error::PartialKey(_))
        ));
    }

    #[test]
    fn test_completed_key_rejects_invalid_identifier() {
        let key = Key::new("p1", key_path!["Person"]).unwrap();
        assert!(matches!(key.completed_key(0), Err(Error::Construction(_))));
        assert!(matches!(key.completed_key(""), Err(Error::Construction(_))));
    }

    #[test]
    fn test_construction_errors() {
        assert!(matches!(
            Key::new("p1", vec![]),
            Err(Error::Construction(_))
        ));
        assert!(matches!(
            Key::new("p1", key_path![1, "Person"]),
            Err(Error::Construction(_))
        ));
        assert!(matches!(
            Key::new("p1", key_path!["", 1]),
            Err(Error::Construction(_))
        ));
        assert!(matches!(
            Key::builder(key_path!["Person", 1]).build(),
            Err(Error::Construction(_))
        ));
    }

    #[test]
    fn test_parent_derivation() {
        let root = Key::new("p", key_path!["Person", 1]).unwrap();
        assert!(root.parent().is_none());

        let child = Key::new("p", key_path!["A", 1, "B", 2]).unwrap();
        let expected = Key::new("p", key_path!["A", 1]).unwrap();
        assert_eq!(child.parent(), Some(&expected));

        let partial_child = Key::new("p", key_path!["A", 1, "B"]).unwrap();
        assert_eq!(partial_child.parent(), Some(&expected));

        let partial_root = Key::new("p", key_path!["A"]).unwrap();
        assert!(partial_root.parent().is_none());
    }

    #[test]
    fn test_parent_inheritance() {
        let parent = Key::builder(key_path!["Org", "acme"])
            .project("p")
            .namespace("ns")
            .build()
            .unwrap();

        let child = Key::builder(key_path!["User", 7])
            .parent(parent.clone())
            .build()
            .unwrap();

        assert_eq!(child.project(), "p");
        assert_eq!(child.namespace(), Some("ns"));
        assert_eq!(child.flat_path(), &key_path!["Org", "acme", "User", 7][..]);
        assert_eq!(child.path().len(), 2);
        assert_eq!(child.parent(), Some(&parent));
    }

    #[test]
    fn test_parent_of_multi_element_child_under_explicit_parent() {
        let org = Key::builder(key_path!["Org", "acme"])
            .project("p")
            .build()
            .unwrap();

        let child = Key::builder(key_path!["A", 1, "B", 2])
            .parent(org.clone())
            .build()
            .unwrap();
        let expected = Key::new("p", key_path!["Org", "acme", "A", 1]).unwrap();
        assert_eq!(child.parent(), Some(&expected));
        assert_eq!(child.parent().and_then(Key::parent), Some(&org));
    }

    #[test]
    fn test_parent_conflicts() {
        let parent = Key::builder(key_path!["Org", "acme"])
            .project("p")
            .namespace("ns")
            .build()
            .unwrap();

        let wrong_ns = Key::builder(key_path!["User", 7])
            .parent(parent.clone())
            .namespace("other")
            .build();
        assert!(matches!(wrong_ns, Err(Error::Construction(_))));

        let wrong_project = Key::builder(key_path!["User", 7])
            .parent(parent.clone())
            .project("q")
            .build();
        assert!(matches!(wrong_project, Err(Error::Construction(_))));

        let matching = Key::builder(key_path!["User", 7])
            .parent(parent)
            .project("p")
            .namespace("ns")
            .build();
        assert!(matching.is_ok());

        let partial_parent = Key::new("p", key_path!["Org"]).unwrap();
        let orphan = Key::builder(key_path!["User", 7])
            .parent(partial_parent)
            .build();
        assert!(matches!(orphan, Err(Error::Construction(_))));
    }

    #[test]
    fn test_partial_keys_never_equal() {
        let a = Key::new("p", key_path!["Person"]).unwrap();
        let b = a.clone();
        assert_ne!(a, b);
        #[allow(clippy::eq_op)]
        let self_equal = a == a;
        assert!(!self_equal);
    }

    #[test]
    fn test_namespace_distinguishes_keys() {
        let a = Key::new("p", key_path!["Person", 1]).unwrap();
        let b = Key::builder(key_path!["Person", 1])
            .project("p")
            .namespace("ns")
            .build()
            .unwrap();
        assert_ne!(a, b);

        let c = Key::builder(key_path!["Person", 1])
            .project("p")
            .namespace("")
            .build()
            .unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_display() {
        let key = Key::new("p", key_path!["Org", "acme", "User"]).unwrap();
        assert_eq!(key.to_string(), "Org(\"acme\")/User");
    }

    #[test]
    fn test_serde_revalidates() {
        let key = Key::builder(key_path!["Org", "acme", "User", 7])
            .project("p")
            .namespace("ns")
            .build()
            .unwrap();
        let json = serde_json::to_string(&key).unwrap();
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);

        let bad = r#"{"project":"p","path":[1,"Person"]}"#;
        assert!(serde_json::from_str::<Key>(bad).is_err());
    }

    fn complete_path() -> impl Strategy<Value = Vec<PathArg>> {
        prop::collection::vec(
            (
                prop::sample::select(vec!["A", "B", "C"]),
                prop_oneof![
                    (1i64..4).prop_map(PathArg::Int),
                    prop::sample::select(vec!["x", "y"]).prop_map(PathArg::from),
                ],
            ),
            1..3,
        )
        .prop_map(|pairs| {
            pairs
                .into_iter()
                .flat_map(|(kind, id)| [PathArg::from(kind), id])
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_complete_key_equality(
            path_a in complete_path(),
            path_b in complete_path(),
            project_a in prop::sample::select(vec!["p", "q"]),
            project_b in prop::sample::select(vec!["p", "q"]),
            ns_a in prop::option::of(prop::sample::select(vec!["n1", "n2"])),
            ns_b in prop::option::of(prop::sample::select(vec!["n1", "n2"])),
        ) {
            let mut builder_a = Key::builder(path_a.clone()).project(project_a);
            if let Some(ns) = ns_a {
                builder_a = builder_a.namespace(ns);
            }
            let mut builder_b = Key::builder(path_b.clone()).project(project_b);
            if let Some(ns) = ns_b {
                builder_b = builder_b.namespace(ns);
            }
            let a = builder_a.build().unwrap();
            let b = builder_b.build().unwrap();

            let expected = path_a == path_b && project_a == project_b && ns_a == ns_b;
            prop_assert_eq!(a == b, expected);
            if expected {
                prop_assert_eq!(hash_of(&a), hash_of(&b));
            }
        }
    }
}
