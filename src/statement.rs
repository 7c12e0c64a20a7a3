//! Prepared statement management and caching.
//!
//! This module provides:
//! - `PreparedStatement`: a server-side prepared statement shared by every
//!   submission that uses the same query text and parameter types
//! - `StatementCache`: per-connection map from `StatementKey` to statement

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lru::LruCache;
use once_cell::sync::OnceCell;
use tracing::trace;

use crate::encoder::{Signature, StatementKey};
use crate::error::PgResult;
use crate::protocol::FieldDescription;
use crate::types::Oid;

/// Shared column descriptions - wrapped in Arc to avoid cloning on every query.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

// ============================================================================
// Prepared Statement
// ============================================================================

/// A prepared statement known to one connection.
///
/// The Parse for a statement is queued once; later submissions reuse the name
/// and rely on the server processing messages in order. Columns are learned
/// from the Describe response and never change afterwards.
#[derive(Debug)]
pub struct PreparedStatement {
    /// Server-side name for this statement (e.g., "__pm_1")
    pub name: String,
    /// The SQL query text
    pub query: String,
    /// Parameter type OIDs sent with Parse
    pub param_types: Signature,
    columns: OnceCell<SharedColumns>,
    parse_sent: AtomicBool,
}

impl PreparedStatement {
    pub fn new(name: String, query: String, param_types: Signature) -> Self {
        Self {
            name,
            query,
            param_types,
            columns: OnceCell::new(),
            parse_sent: AtomicBool::new(false),
        }
    }

    /// Column descriptions, once the Describe response has arrived.
    pub fn columns(&self) -> Option<&SharedColumns> {
        self.columns.get()
    }

    /// Record the result columns. Later calls are ignored.
    pub fn set_columns(&self, columns: Vec<FieldDescription>) {
        let _ = self.columns.set(Arc::new(columns));
    }

    /// Check if this statement returns rows.
    pub fn returns_rows(&self) -> bool {
        self.columns().is_some_and(|c| !c.is_empty())
    }

    /// Whether a Parse for this statement has been queued.
    pub fn is_prepared(&self) -> bool {
        self.parse_sent.load(Ordering::Acquire)
    }

    /// Mark the Parse as queued. Returns false if it already was.
    pub fn mark_prepared(&self) -> bool {
        !self.parse_sent.swap(true, Ordering::AcqRel)
    }
}

// ============================================================================
// Statement Cache
// ============================================================================

/// Result of a cache lookup.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub key: StatementKey,
    pub statement: Arc<PreparedStatement>,
    /// True when the entry did not exist before this lookup.
    pub created: bool,
    /// Name of a statement evicted to make room, to be closed on the server.
    pub evicted: Option<String>,
}

/// Per-connection prepared statement cache.
///
/// Unbounded unless a capacity is given, in which case the least recently used
/// statement is evicted. Uses the `lru` crate for O(1) get/insert/evict.
/// Statements are handed out as `Arc<PreparedStatement>`; the same key yields
/// the same `Arc` for as long as the entry lives.
pub struct StatementCache {
    cache: LruCache<StatementKey, Arc<PreparedStatement>>,
    next_id: u32,
}

impl StatementCache {
    pub fn new(capacity: Option<usize>) -> Self {
        let cache = match capacity.and_then(NonZeroUsize::new) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self { cache, next_id: 0 }
    }

    /// Look up the statement for `(query, signature)`, creating it on a miss.
    pub fn get_entry(&mut self, query: &str, signature: &[Oid]) -> PgResult<CacheLookup> {
        let key = StatementKey::new(query, signature)?;

        if let Some(statement) = self.cache.get(&key) {
            return Ok(CacheLookup {
                statement: Arc::clone(statement),
                key,
                created: false,
                evicted: None,
            });
        }

        let name = self.next_statement_name();
        let statement = Arc::new(PreparedStatement::new(
            name,
            key.query.clone(),
            key.signature.clone(),
        ));

        let evicted = self
            .cache
            .push(key.clone(), Arc::clone(&statement))
            .map(|(_, old)| old)
            .filter(|old| old.is_prepared())
            .map(|old| old.name.clone());

        trace!(statement = %statement.name, evicted = ?evicted, "statement cached");

        Ok(CacheLookup {
            key,
            statement,
            created: true,
            evicted,
        })
    }

    /// Get a cached statement without updating LRU order.
    pub fn get(&self, key: &StatementKey) -> Option<Arc<PreparedStatement>> {
        self.cache.peek(key).map(Arc::clone)
    }

    /// Remove `key` if it still maps to the statement called `name`.
    pub fn invalidate(&mut self, key: &StatementKey, name: &str) -> bool {
        let matches = self.cache.peek(key).is_some_and(|s| s.name == name);
        if matches {
            self.cache.pop(key);
            trace!(statement = %name, "statement invalidated");
        }
        matches
    }

    fn next_statement_name(&mut self) -> String {
        self.next_id = self.next_id.wrapping_add(1);
        format!("__pm_{}", self.next_id)
    }

    /// Get the number of cached statements.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Clear all cached statements without closing them on the server.
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PgError;

    #[test]
    fn test_same_key_returns_same_entry() {
        let mut cache = StatementCache::default();
        let a = cache.get_entry("SELECT $1", &[Oid::INT4]).unwrap();
        let b = cache.get_entry("SELECT $1", &[Oid::INT4]).unwrap();

        assert!(a.created);
        assert!(!b.created);
        assert!(Arc::ptr_eq(&a.statement, &b.statement));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_keys_do_not_collide() {
        let mut cache = StatementCache::default();
        let a = cache.get_entry("SELECT $1", &[Oid::INT4]).unwrap();
        let b = cache.get_entry("SELECT $1", &[Oid::INT8]).unwrap();
        let c = cache.get_entry("SELECT $1::text", &[Oid::INT4]).unwrap();

        assert!(!Arc::ptr_eq(&a.statement, &b.statement));
        assert!(!Arc::ptr_eq(&a.statement, &c.statement));
        assert_ne!(a.statement.name, b.statement.name);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_empty_query_rejected() {
        let mut cache = StatementCache::default();
        assert!(matches!(
            cache.get_entry("", &[]),
            Err(PgError::InvalidArgument(_))
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_bounded_cache_reports_evicted_prepared_statement() {
        let mut cache = StatementCache::new(Some(2));

        let q1 = cache.get_entry("q1", &[]).unwrap();
        q1.statement.mark_prepared();
        cache.get_entry("q2", &[]).unwrap();

        // Touch q1 so q2 becomes least recently used
        cache.get_entry("q1", &[]).unwrap();

        // q2 was never prepared, nothing to close
        let q3 = cache.get_entry("q3", &[]).unwrap();
        assert_eq!(q3.evicted, None);

        q3.statement.mark_prepared();
        let q4 = cache.get_entry("q4", &[]).unwrap();
        assert_eq!(q4.evicted.as_deref(), Some(q1.statement.name.as_str()));
    }

    #[test]
    fn test_invalidate_checks_name() {
        let mut cache = StatementCache::default();
        let first = cache.get_entry("SELECT 1", &[]).unwrap();

        assert!(!cache.invalidate(&first.key, "__pm_other"));
        assert!(cache.invalidate(&first.key, &first.statement.name));
        assert!(cache.get(&first.key).is_none());

        let second = cache.get_entry("SELECT 1", &[]).unwrap();
        assert!(second.created);
        assert_ne!(second.statement.name, first.statement.name);
    }

    #[test]
    fn test_columns_set_once() {
        let stmt = PreparedStatement::new("s".into(), "q".into(), Signature::new());
        assert!(stmt.columns().is_none());
        assert!(!stmt.returns_rows());

        stmt.set_columns(vec![]);
        stmt.set_columns(vec![FieldDescription {
            name: "x".into(),
            table_oid: 0,
            column_attr: 0,
            type_oid: Oid::INT4,
            type_size: 4,
            type_modifier: -1,
            format: crate::protocol::Format::Binary,
        }]);
        assert_eq!(stmt.columns().map(|c| c.len()), Some(0));

        assert!(stmt.mark_prepared());
        assert!(!stmt.mark_prepared());
        assert!(stmt.is_prepared());
    }
}
