/// Paginated query results
///
/// A [`QueryIterator`] fetches one page per backend round trip. It can be
/// consumed once, either page by page ([`QueryIterator::pages`]) or entity
/// by entity ([`QueryIterator::items`]).
use crate::backend::{MoreResults, QueryRequest, QueryResultBatch};
use crate::client::Client;
use crate::query::QuerySpec;
use crate::transaction::TransactionId;
use base64::Engine;
use bytes::Bytes;
use kds_core::{Entity, Error, Result};
use std::fmt;
use tracing::debug;

/// Opaque position in a query's result stream
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Cursor(Bytes);

impl Cursor {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encode as URL-safe base64 for handing to callers
    pub fn to_urlsafe(&self) -> String {
        base64::engine::general_purpose::URL_SAFE.encode(&self.0)
    }

    pub fn from_urlsafe(encoded: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE
            .decode(encoded)
            .map_err(|e| Error::Construction(format!("Invalid cursor {:?}: {}", encoded, e)))?;
        Ok(Self(Bytes::from(bytes)))
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cursor({})", self.to_urlsafe())
    }
}

/// Parameters bound by [`crate::Query::fetch`]
#[derive(Clone, Default)]
pub struct FetchOptions<'c> {
    /// Maximum number of results over all pages
    pub limit: Option<usize>,
    /// Number of results to skip before the first one returned
    pub offset: usize,
    pub start_cursor: Option<Cursor>,
    pub end_cursor: Option<Cursor>,
    /// Client to run the query with instead of the query's own
    pub client: Option<&'c Client>,
    /// Transaction to read in instead of the client's current one
    pub transaction: Option<TransactionId>,
    pub eventual: bool,
}

impl<'c> FetchOptions<'c> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn start_cursor(mut self, cursor: Cursor) -> Self {
        self.start_cursor = Some(cursor);
        self
    }

    pub fn end_cursor(mut self, cursor: Cursor) -> Self {
        self.end_cursor = Some(cursor);
        self
    }

    pub fn client(mut self, client: &'c Client) -> Self {
        self.client = Some(client);
        self
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

/// Iterator over the results of one query execution
pub struct QueryIterator<'c> {
    client: &'c Client,
    project: String,
    namespace: Option<String>,
    spec: QuerySpec,
    limit: Option<usize>,
    offset: usize,
    end_cursor: Option<Cursor>,
    transaction: Option<TransactionId>,
    eventual: bool,

    next_page_token: Option<Cursor>,
    page_number: usize,
    num_results: usize,
    skipped_results: usize,
    more_results: bool,
    started: bool,
}

impl<'c> QueryIterator<'c> {
    pub(crate) fn new(
        client: &'c Client,
        project: String,
        namespace: Option<String>,
        spec: QuerySpec,
        options: FetchOptions<'c>,
    ) -> Self {
        Self {
            client,
            project,
            namespace,
            spec,
            limit: options.limit,
            offset: options.offset,
            end_cursor: options.end_cursor,
            transaction: options.transaction,
            eventual: options.eventual,
            next_page_token: options.start_cursor,
            page_number: 0,
            num_results: 0,
            skipped_results: 0,
            more_results: true,
            started: false,
        }
    }

    /// Number of pages fetched so far
    pub fn page_number(&self) -> usize {
        self.page_number
    }

    /// Results handed out so far
    pub fn num_results(&self) -> usize {
        self.num_results
    }

    /// Results the backend skipped to honor the offset
    pub fn skipped_results(&self) -> usize {
        self.skipped_results
    }

    /// Cursor to resume after the last fetched page
    pub fn next_page_token(&self) -> Option<&Cursor> {
        self.next_page_token.as_ref()
    }

    pub fn has_more_results(&self) -> bool {
        self.more_results
    }

    /// Iterate page by page
    pub fn pages(&mut self) -> Result<Pages<'_, 'c>> {
        self.start()?;
        Ok(Pages {
            iter: self,
            done: false,
        })
    }

    /// Iterate entity by entity across pages
    pub fn items(&mut self) -> Result<Items<'_, 'c>> {
        self.start()?;
        Ok(Items {
            iter: self,
            page: None,
            done: false,
        })
    }

    fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::Usage("Iterator has already started".to_string()));
        }
        self.started = true;
        Ok(())
    }

    /// Fetch the next page, or None once the results are exhausted
    fn next_page(&mut self) -> Result<Option<Page>> {
        if !self.more_results {
            return Ok(None);
        }

        let remaining = match self.limit {
            Some(limit) if self.num_results >= limit => {
                self.more_results = false;
                return Ok(None);
            }
            Some(limit) => Some(limit - self.num_results),
            None => None,
        };

        let page_size = self.client.config().page_size;
        let request_limit = match (remaining, page_size) {
            (Some(remaining), Some(size)) => Some(remaining.min(size)),
            (remaining, size) => remaining.or(size),
        };
        let capped = request_limit != remaining;

        let read_options = self
            .client
            .read_options(self.transaction.as_ref(), self.eventual)?;

        let request = QueryRequest {
            project: self.project.clone(),
            namespace: self.namespace.clone(),
            query: self.spec.clone(),
            limit: request_limit,
            offset: self.offset.saturating_sub(self.skipped_results),
            start_cursor: self.next_page_token.clone(),
            end_cursor: self.end_cursor.clone(),
            read_options,
        };

        let QueryResultBatch {
            entities,
            end_cursor,
            skipped_results,
            more_results,
        } = self.client.backend().run_query(&request)?;

        self.page_number += 1;
        self.skipped_results += skipped_results;
        self.next_page_token = match more_results {
            MoreResults::NoMoreResults => None,
            _ => end_cursor,
        };
        self.more_results = match more_results {
            MoreResults::NotFinished => true,
            MoreResults::MoreResultsAfterLimit => capped && self.next_page_token.is_some(),
            MoreResults::MoreResultsAfterCursor | MoreResults::NoMoreResults => false,
        };

        debug!(
            kind = ?self.spec.kind,
            page = self.page_number,
            items = entities.len(),
            more = self.more_results,
            "fetched query page"
        );

        Ok(Some(Page::new(entities)))
    }
}

impl fmt::Debug for QueryIterator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryIterator")
            .field("project", &self.project)
            .field("kind", &self.spec.kind)
            .field("page_number", &self.page_number)
            .field("num_results", &self.num_results)
            .field("more_results", &self.more_results)
            .finish()
    }
}

/// Page-by-page view of a [`QueryIterator`]
///
/// Yields each page once; after an error the sequence ends.
pub struct Pages<'i, 'c> {
    iter: &'i mut QueryIterator<'c>,
    done: bool,
}

impl Pages<'_, '_> {
    pub fn num_results(&self) -> usize {
        self.iter.num_results
    }

    pub fn page_number(&self) -> usize {
        self.iter.page_number
    }

    pub fn next_page_token(&self) -> Option<&Cursor> {
        self.iter.next_page_token.as_ref()
    }
}

impl Iterator for Pages<'_, '_> {
    type Item = Result<Page>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.iter.next_page() {
            Ok(Some(page)) => {
                self.iter.num_results += page.num_items();
                Some(Ok(page))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Entity-by-entity view of a [`QueryIterator`]
pub struct Items<'i, 'c> {
    iter: &'i mut QueryIterator<'c>,
    page: Option<Page>,
    done: bool,
}

impl Items<'_, '_> {
    pub fn num_results(&self) -> usize {
        self.iter.num_results
    }

    pub fn page_number(&self) -> usize {
        self.iter.page_number
    }

    pub fn next_page_token(&self) -> Option<&Cursor> {
        self.iter.next_page_token.as_ref()
    }
}

impl Iterator for Items<'_, '_> {
    type Item = Result<Entity>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(entity) = self.page.as_mut().and_then(Iterator::next) {
                self.iter.num_results += 1;
                return Some(Ok(entity));
            }
            match self.iter.next_page() {
                Ok(Some(page)) => self.page = Some(page),
                Ok(None) => {
                    self.done = true;
                    self.page = None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// One page of query results
#[derive(Debug)]
pub struct Page {
    entities: std::vec::IntoIter<Entity>,
    num_items: usize,
    remaining: usize,
}

impl Page {
    fn new(entities: Vec<Entity>) -> Self {
        let num_items = entities.len();
        Self {
            entities: entities.into_iter(),
            num_items,
            remaining: num_items,
        }
    }

    /// Number of entities the page was fetched with
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// Entities not yet taken from the page
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Iterator for Page {
    type Item = Entity;

    fn next(&mut self) -> Option<Entity> {
        let entity = self.entities.next()?;
        self.remaining -= 1;
        Some(entity)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Page {}

impl std::iter::FusedIterator for Page {}
