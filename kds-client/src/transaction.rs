/// Transaction-specific behavior of [`Batch`]
///
/// A transaction is a batch that asks the backend for a token on `begin()`,
/// sends that token with its commit and rollback, and drops it once either
/// has run. Read-only transactions refuse `put()`.
use crate::batch::{Batch, BatchKind};
use bytes::Bytes;
use kds_core::{Error, Result};
use std::fmt;
use tracing::{debug, warn};

/// Opaque transaction token issued by the backend
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(Bytes);

impl TransactionId {
    pub fn new(token: impl Into<Bytes>) -> Self {
        Self(token.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId(")?;
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

impl Batch {
    /// Transaction token, present between a successful `begin()` and the
    /// end of commit or rollback
    pub fn id(&self) -> Option<&TransactionId> {
        match &self.kind {
            BatchKind::Transaction { id, .. } => id.as_ref(),
            BatchKind::Batch => None,
        }
    }

    pub fn is_transaction(&self) -> bool {
        matches!(self.kind, BatchKind::Transaction { .. })
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.kind, BatchKind::Transaction { read_only: true, .. })
    }

    /// Request a token from the backend. A failed request leaves the
    /// transaction in progress without a token.
    pub(crate) fn acquire_token(&mut self) {
        let read_only = match self.kind {
            BatchKind::Transaction { read_only, .. } => read_only,
            BatchKind::Batch => return,
        };

        match self.backend.begin_transaction(&self.project, read_only) {
            Ok(token) => {
                debug!(project = %self.project, transaction = ?token, read_only, "transaction started");
                if let BatchKind::Transaction { id, .. } = &mut self.kind {
                    *id = Some(token);
                }
            }
            Err(e) => {
                warn!(project = %self.project, "begin_transaction failed, continuing without a token: {}", e);
            }
        }
    }

    pub(crate) fn clear_token(&mut self) {
        if let BatchKind::Transaction { id, .. } = &mut self.kind {
            *id = None;
        }
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::State("Transaction is read only".to_string()));
        }
        Ok(())
    }
}
