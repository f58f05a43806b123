//! Prepared statement table with LRU eviction.
//!
//! ## Lifecycle
//!
//! 1. First execution of a SQL text creates a [`Statement`] and runs it with
//!    `sp_prepexec`; the RETURNVALUE carrying the handle completes it
//! 2. Later executions find the completed statement and use `sp_execute`
//! 3. When the table is full the least recently used statement is evicted and
//!    its handle queued for `sp_unprepare`
//! 4. Closing the connection releases every server-side handle implicitly

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;

/// Default maximum number of prepared statements per connection.
pub const DEFAULT_MAX_STATEMENTS: usize = 256;

static NEXT_STATEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// How a statement is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Prepared on the server and executed by handle.
    Prepared,
    /// Sent as text with `sp_executesql` every time.
    Direct,
}

/// A statement with a stable identity.
///
/// A prepared statement becomes complete once the server has returned its
/// handle; until then executions must prepare it again.
#[derive(Debug)]
pub struct Statement {
    id: u64,
    sql: String,
    kind: StatementKind,
    handle: AtomicI32,
    complete: AtomicBool,
    created_at: Instant,
}

impl Statement {
    /// Create an incomplete statement.
    #[must_use]
    pub fn new(sql: impl Into<String>, kind: StatementKind) -> Self {
        Self {
            id: NEXT_STATEMENT_ID.fetch_add(1, Ordering::Relaxed),
            sql: sql.into(),
            kind,
            handle: AtomicI32::new(0),
            complete: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    /// Process-unique identity.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Execution kind.
    #[must_use]
    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    /// Whether the server acknowledged preparation.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Server handle, once complete.
    #[must_use]
    pub fn handle(&self) -> Option<i32> {
        self.is_complete()
            .then(|| self.handle.load(Ordering::Relaxed))
    }

    /// Record the server handle. Returns `false` if already complete.
    pub fn complete(&self, handle: i32) -> bool {
        if self.is_complete() {
            return false;
        }
        self.handle.store(handle, Ordering::Relaxed);
        !self.complete.swap(true, Ordering::AcqRel)
    }

    /// Age of this statement.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// LRU table from SQL text to prepared statements.
///
/// A capacity of zero disables caching: every lookup misses and nothing is
/// stored.
pub struct StatementCache {
    cache: Option<LruCache<String, Arc<Statement>>>,
    hits: u64,
    misses: u64,
}

impl StatementCache {
    /// Create a table holding up to `max_size` statements.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: NonZeroUsize::new(max_size).map(LruCache::new),
            hits: 0,
            misses: 0,
        }
    }

    /// Whether statements are cached at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Look up a statement by SQL text, updating LRU order.
    pub fn get(&mut self, sql: &str) -> Option<Arc<Statement>> {
        let found = self.cache.as_mut().and_then(|c| c.get(sql).cloned());
        match &found {
            Some(stmt) => {
                self.hits += 1;
                tracing::trace!(sql, statement_id = stmt.id(), "statement cache hit");
            }
            None => {
                self.misses += 1;
                tracing::trace!(sql, "statement cache miss");
            }
        }
        found
    }

    /// Insert a statement.
    ///
    /// Returns the statement evicted to make room, whose handle the caller
    /// releases with `sp_unprepare`.
    pub fn insert(&mut self, stmt: Arc<Statement>) -> Option<Arc<Statement>> {
        let cache = self.cache.as_mut()?;
        tracing::debug!(
            sql = stmt.sql(),
            statement_id = stmt.id(),
            "caching prepared statement"
        );
        match cache.push(stmt.sql().to_owned(), stmt) {
            // Replacing the same key returns the old value; only a different
            // key means an eviction.
            Some((key, evicted)) if cache.peek(&key).is_none() => Some(evicted),
            Some((_, replaced)) => Some(replaced),
            None => None,
        }
    }

    /// Remove a statement.
    pub fn remove(&mut self, sql: &str) -> Option<Arc<Statement>> {
        self.cache.as_mut()?.pop(sql)
    }

    /// Remove every statement, returning them for release.
    pub fn clear(&mut self) -> Vec<Arc<Statement>> {
        let mut statements = Vec::new();
        if let Some(cache) = self.cache.as_mut() {
            while let Some((_, stmt)) = cache.pop_lru() {
                statements.push(stmt);
            }
        }
        tracing::debug!(count = statements.len(), "cleared statement cache");
        statements
    }

    /// Number of cached statements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.as_ref().map_or(0, LruCache::len)
    }

    /// Check if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of lookups that found a statement.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Number of lookups that missed.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Hit ratio (0.0 to 1.0).
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STATEMENTS)
    }
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.len())
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}
