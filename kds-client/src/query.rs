/// Query description and builder
///
/// A [`Query`] is bound to the client that created it and only describes
/// what to fetch. Nothing is sent until the iterator returned by
/// [`Query::fetch`] is consumed.
use crate::client::Client;
use crate::iterator::{FetchOptions, QueryIterator};
use kds_core::{Error, Key, Result, Value};
use std::fmt;
use std::str::FromStr;

/// Reserved property name addressing an entity's key
pub const KEY_PROPERTY: &str = "__key__";

/// Comparison operator of a property filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equal,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equal => "=",
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
        }
    }
}

impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "=" => Ok(Operator::Equal),
            "<" => Ok(Operator::LessThan),
            "<=" => Ok(Operator::LessThanOrEqual),
            ">" => Ok(Operator::GreaterThan),
            ">=" => Ok(Operator::GreaterThanOrEqual),
            other => Err(Error::Construction(format!(
                "Invalid expression: \"{}\". Please use one of: =, <, <=, >, >=.",
                other
            ))),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Property filter: `property operator value`
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub property: String,
    pub operator: Operator,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// Sort order on one property; parsed from `"field"` or `"-field"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyOrder {
    pub property: String,
    pub direction: Direction,
}

impl PropertyOrder {
    fn parse(field: &str) -> Result<Self> {
        let (property, direction) = match field.strip_prefix('-') {
            Some(rest) => (rest, Direction::Descending),
            None => (field, Direction::Ascending),
        };
        Ok(Self {
            property: non_empty(property, "order field")?,
            direction,
        })
    }
}

impl fmt::Display for PropertyOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Ascending => write!(f, "{}", self.property),
            Direction::Descending => write!(f, "-{}", self.property),
        }
    }
}

/// One field name or a list of them
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldList(Vec<String>);

impl FieldList {
    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl From<&str> for FieldList {
    fn from(field: &str) -> Self {
        Self(vec![field.to_string()])
    }
}

impl From<String> for FieldList {
    fn from(field: String) -> Self {
        Self(vec![field])
    }
}

impl From<Vec<String>> for FieldList {
    fn from(fields: Vec<String>) -> Self {
        Self(fields)
    }
}

impl From<Vec<&str>> for FieldList {
    fn from(fields: Vec<&str>) -> Self {
        Self(fields.into_iter().map(String::from).collect())
    }
}

impl<const N: usize> From<[&str; N]> for FieldList {
    fn from(fields: [&str; N]) -> Self {
        Self(fields.iter().map(|f| f.to_string()).collect())
    }
}

/// Backend-facing query description
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QuerySpec {
    pub kind: Option<String>,
    pub ancestor: Option<Key>,
    pub filters: Vec<Filter>,
    pub projection: Vec<String>,
    pub order: Vec<PropertyOrder>,
    pub distinct_on: Vec<String>,
}

impl QuerySpec {
    /// Whether only keys are requested
    pub fn is_keys_only(&self) -> bool {
        self.projection.len() == 1 && self.projection[0] == KEY_PROPERTY
    }
}

/// Options for [`Client::query_with`]
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub kind: Option<String>,
    pub project: Option<String>,
    pub namespace: Option<String>,
    pub ancestor: Option<Key>,
    pub filters: Vec<(String, String, Value)>,
    pub projection: FieldList,
    pub order: FieldList,
    pub distinct_on: FieldList,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn ancestor(mut self, ancestor: Key) -> Self {
        self.ancestor = Some(ancestor);
        self
    }

    pub fn filter(
        mut self,
        property: impl Into<String>,
        operator: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.filters
            .push((property.into(), operator.into(), value.into()));
        self
    }

    pub fn projection(mut self, fields: impl Into<FieldList>) -> Self {
        self.projection = fields.into();
        self
    }

    pub fn order(mut self, fields: impl Into<FieldList>) -> Self {
        self.order = fields.into();
        self
    }

    pub fn distinct_on(mut self, fields: impl Into<FieldList>) -> Self {
        self.distinct_on = fields.into();
        self
    }
}

/// Query bound to a client
pub struct Query<'c> {
    client: &'c Client,
    project: String,
    namespace: Option<String>,
    spec: QuerySpec,
}

impl<'c> Query<'c> {
    pub(crate) fn new(client: &'c Client, project: String, namespace: Option<String>) -> Self {
        Self {
            client,
            project,
            namespace,
            spec: QuerySpec::default(),
        }
    }

    /// Apply the fields of `options` other than project and namespace
    pub(crate) fn apply(&mut self, options: QueryOptions) -> Result<()> {
        if let Some(kind) = options.kind {
            self.set_kind(kind)?;
        }
        if let Some(ancestor) = options.ancestor {
            self.set_ancestor(ancestor)?;
        }
        for (property, operator, value) in options.filters {
            self.add_filter(property, &operator, value)?;
        }
        self.set_projection(options.projection)?;
        self.set_order(options.order)?;
        self.set_distinct_on(options.distinct_on)?;
        Ok(())
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn kind(&self) -> Option<&str> {
        self.spec.kind.as_deref()
    }

    pub fn ancestor(&self) -> Option<&Key> {
        self.spec.ancestor.as_ref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.spec.filters
    }

    pub fn projection(&self) -> &[String] {
        &self.spec.projection
    }

    pub fn order(&self) -> &[PropertyOrder] {
        &self.spec.order
    }

    pub fn distinct_on(&self) -> &[String] {
        &self.spec.distinct_on
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    pub fn client(&self) -> &'c Client {
        self.client
    }

    pub fn set_namespace(&mut self, namespace: impl Into<String>) -> Result<&mut Self> {
        let namespace = namespace.into();
        self.namespace = if namespace.is_empty() {
            None
        } else {
            Some(namespace)
        };
        Ok(self)
    }

    pub fn set_kind(&mut self, kind: impl Into<String>) -> Result<&mut Self> {
        self.spec.kind = Some(non_empty(&kind.into(), "kind")?);
        Ok(self)
    }

    /// Restrict results to descendants of `ancestor`
    pub fn set_ancestor(&mut self, ancestor: Key) -> Result<&mut Self> {
        if ancestor.project() != self.project {
            return Err(Error::ProjectMismatch {
                expected: self.project.clone(),
                found: ancestor.project().to_string(),
            });
        }
        self.spec.ancestor = Some(ancestor);
        Ok(self)
    }

    pub fn clear_ancestor(&mut self) -> &mut Self {
        self.spec.ancestor = None;
        self
    }

    /// Append a filter
    ///
    /// `operator` must be one of `=`, `<`, `<=`, `>`, `>=`. Filters on
    /// [`KEY_PROPERTY`] need a key value.
    pub fn add_filter(
        &mut self,
        property: impl Into<String>,
        operator: &str,
        value: impl Into<Value>,
    ) -> Result<&mut Self> {
        let operator = operator.parse::<Operator>()?;
        let property = non_empty(&property.into(), "filter property")?;
        let value = value.into();

        if property == KEY_PROPERTY && value.as_key().is_none() {
            return Err(Error::Construction(format!(
                "Invalid key: {:?}",
                value.type_name()
            )));
        }

        self.spec.filters.push(Filter {
            property,
            operator,
            value,
        });
        Ok(self)
    }

    /// Append a filter on the entity key
    pub fn key_filter(&mut self, key: Key, operator: &str) -> Result<&mut Self> {
        self.add_filter(KEY_PROPERTY, operator, key)
    }

    pub fn set_projection(&mut self, fields: impl Into<FieldList>) -> Result<&mut Self> {
        self.spec.projection = validate_fields(fields.into(), "projection field")?;
        Ok(self)
    }

    /// Fetch keys only
    pub fn keys_only(&mut self) -> &mut Self {
        self.spec.projection = vec![KEY_PROPERTY.to_string()];
        self
    }

    /// Set sort order; `"-field"` sorts descending
    pub fn set_order(&mut self, fields: impl Into<FieldList>) -> Result<&mut Self> {
        self.spec.order = fields
            .into()
            .into_vec()
            .iter()
            .map(|field| PropertyOrder::parse(field))
            .collect::<Result<Vec<_>>>()?;
        Ok(self)
    }

    pub fn set_distinct_on(&mut self, fields: impl Into<FieldList>) -> Result<&mut Self> {
        self.spec.distinct_on = validate_fields(fields.into(), "distinct_on field")?;
        Ok(self)
    }

    /// Bind fetch parameters and return an iterator; no backend call is made
    pub fn fetch(&self, options: FetchOptions<'c>) -> QueryIterator<'c> {
        QueryIterator::new(
            options.client.unwrap_or(self.client),
            self.project.clone(),
            self.namespace.clone(),
            self.spec.clone(),
            options,
        )
    }
}

impl fmt::Debug for Query<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("project", &self.project)
            .field("namespace", &self.namespace)
            .field("spec", &self.spec)
            .finish()
    }
}

fn non_empty(value: &str, what: &str) -> Result<String> {
    if value.is_empty() {
        return Err(Error::Construction(format!("{} must not be empty", what)));
    }
    Ok(value.to_string())
}

fn validate_fields(fields: FieldList, what: &str) -> Result<Vec<String>> {
    fields
        .into_vec()
        .iter()
        .map(|field| non_empty(field, what))
        .collect()
}
