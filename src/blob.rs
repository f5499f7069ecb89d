//! Ordered key/value blob store contract and an in-memory backend.
//!
//! The engine's only persistence primitive. Implementations must provide
//! atomic single-key `get`/`put`/`delete` and byte-ordered listing; they
//! are not expected to offer multi-key transactions.

use std::collections::BTreeMap;
use std::io;
use std::ops::Bound;

use parking_lot::RwLock;

/// Lazy sequence of keys produced by [`BlobStore::list`].
pub type Keys<'a> = Box<dyn Iterator<Item = io::Result<String>> + Send + 'a>;

/// Filters and ordering for [`BlobStore::list`].
///
/// All bounds are combined: a key is listed when it starts with `prefix`
/// and lies within `[min_inclusive, max_inclusive]`.
///
/// # Examples
///
/// ```
/// use blobfold_es::ListOptions;
///
/// let opts = ListOptions::default()
///     .with_prefix("user-")
///     .with_min_inclusive("user-000000000010")
///     .reversed();
/// assert!(opts.matches("user-000000000011"));
/// assert!(!opts.matches("user-000000000009"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Only keys starting with this prefix.
    pub prefix: Option<String>,
    /// Lowest key to include.
    pub min_inclusive: Option<String>,
    /// Highest key to include.
    pub max_inclusive: Option<String>,
    /// Iterate from the highest key down.
    pub reverse: bool,
}

impl ListOptions {
    /// Restrict the listing to keys starting with `prefix`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the inclusive lower bound.
    pub fn with_min_inclusive(mut self, key: impl Into<String>) -> Self {
        self.min_inclusive = Some(key.into());
        self
    }

    /// Set the inclusive upper bound.
    pub fn with_max_inclusive(mut self, key: impl Into<String>) -> Self {
        self.max_inclusive = Some(key.into());
        self
    }

    /// List in descending order.
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Whether `key` passes the prefix and range filters.
    pub fn matches(&self, key: &str) -> bool {
        self.prefix.as_deref().is_none_or(|p| key.starts_with(p))
            && self.min_inclusive.as_deref().is_none_or(|min| key >= min)
            && self.max_inclusive.as_deref().is_none_or(|max| key <= max)
    }

    /// True when the bounds cannot match any key.
    fn is_empty_range(&self) -> bool {
        matches!(
            (&self.min_inclusive, &self.max_inclusive),
            (Some(min), Some(max)) if min > max
        )
    }
}

/// Minimal ordered key/value store.
///
/// Keys are compared as bytes. Each event-sourced stream needs its own
/// instances: one for the log, one for the time index and one per
/// composite index.
pub trait BlobStore: Send + Sync {
    /// Fetch the value stored at `key`, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` on backend failure.
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;

    /// Store `value` at `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` on backend failure.
    fn put(&self, key: &str, value: &[u8]) -> io::Result<()>;

    /// Remove `key`. Removing an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` on backend failure.
    fn delete(&self, key: &str) -> io::Result<()>;

    /// List keys matching `opts` in byte order (descending when
    /// `opts.reverse` is set).
    ///
    /// The returned iterator must be safe to drop early and must tolerate
    /// the caller writing to the store while it is being consumed.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the listing cannot be started; per-key
    /// failures are yielded by the iterator.
    fn list(&self, opts: &ListOptions) -> io::Result<Keys<'_>>;
}

/// Thread-safe in-memory [`BlobStore`] backed by a `BTreeMap`.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> io::Result<()> {
        self.entries.write().insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn list(&self, opts: &ListOptions) -> io::Result<Keys<'_>> {
        if opts.is_empty_range() {
            return Ok(Box::new(std::iter::empty()));
        }

        // Start at whichever of prefix / min bound sorts later.
        let lower = match (opts.prefix.as_deref(), opts.min_inclusive.as_deref()) {
            (Some(p), Some(m)) => Bound::Included(p.max(m)),
            (Some(p), None) => Bound::Included(p),
            (None, Some(m)) => Bound::Included(m),
            (None, None) => Bound::Unbounded,
        };
        let upper = match opts.max_inclusive.as_deref() {
            Some(m) => Bound::Included(m),
            None => Bound::Unbounded,
        };
        if let (Bound::Included(lo), Bound::Included(hi)) = (lower, upper)
            && lo > hi
        {
            return Ok(Box::new(std::iter::empty()));
        }

        // Snapshot the matching keys so the lock is not held while the
        // caller consumes the iterator.
        let entries = self.entries.read();
        let mut keys: Vec<String> = entries
            .range::<str, _>((lower, upper))
            .map(|(k, _)| k)
            .take_while(|k| opts.prefix.as_deref().is_none_or(|p| k.starts_with(p)))
            .cloned()
            .collect();
        drop(entries);

        if opts.reverse {
            keys.reverse();
        }
        Ok(Box::new(keys.into_iter().map(Ok)))
    }
}
