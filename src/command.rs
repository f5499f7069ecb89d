//! Command contract and the context threaded through decide and evolve.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::aggregate::Aggregate;
use crate::auth::Subject;

/// Metadata key under which the correlation ID is stamped on events.
pub const CORRELATION_ID_KEY: &str = "correlation_id";

/// Cooperative cancellation signal.
///
/// Cloning shares the flag. The handler never polls it; long-running
/// evolve implementations may.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Cross-cutting metadata passed alongside a command.
///
/// Carries correlation and tracing information without polluting the
/// command or event types. On [`Handler::handle`](crate::Handler::handle)
/// the metadata (plus the correlation ID under
/// [`CORRELATION_ID_KEY`]) is copied onto every stored envelope.
///
/// # Examples
///
/// ```
/// use blobfold_es::Context;
///
/// let ctx = Context::default()
///     .with_correlation_id("req-abc-123")
///     .with_metadata("source", "api");
///
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// assert_eq!(ctx.event_metadata()["correlation_id"], "req-abc-123");
/// assert_eq!(ctx.event_metadata()["source"], "api");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Correlation ID for tracing a request across aggregates.
    pub correlation_id: Option<String>,
    /// Arbitrary string metadata forwarded to stored envelopes.
    pub metadata: BTreeMap<String, String>,
    /// Cancellation signal for evolve implementations.
    pub cancellation: CancellationFlag,
}

impl Context {
    /// Set the correlation ID.
    ///
    /// # Arguments
    ///
    /// * `id` - Any value convertible to `String` used to correlate this
    ///   command with other operations across aggregates.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Share an existing cancellation flag.
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancellation = flag;
        self
    }

    /// Whether the caller asked to cancel.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Metadata to stamp on events stored under this context.
    ///
    /// The correlation ID, when set, overrides any metadata entry of the
    /// same name.
    pub fn event_metadata(&self) -> BTreeMap<String, String> {
        let mut meta = self.metadata.clone();
        if let Some(ref cid) = self.correlation_id {
            meta.insert(CORRELATION_ID_KEY.to_string(), cid.clone());
        }
        meta
    }
}

/// A request to change an aggregate.
///
/// # Contract
///
/// [`decide`](Command::decide) must be a pure decision function: it
/// validates the command against a read-only snapshot of the aggregate and
/// returns zero or more events. Returning `Ok(vec![])` is a no-op and causes
/// no storage writes.
pub trait Command<A: Aggregate> {
    /// Validate against the current state and produce events.
    ///
    /// # Errors
    ///
    /// Returns `A::Error` to reject the command.
    fn decide(&self, subject: &dyn Subject, aggregate: &A) -> Result<Vec<A::Event>, A::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_has_no_fields_set() {
        let ctx = Context::default();
        assert_eq!(ctx.correlation_id, None);
        assert!(ctx.metadata.is_empty());
        assert!(!ctx.is_cancelled());
        assert!(ctx.event_metadata().is_empty());
    }

    #[test]
    fn builder_chains_all_fields() {
        let ctx = Context::default()
            .with_correlation_id("req-abc")
            .with_metadata("source", "test")
            .with_metadata("tenant", "t1");

        assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc"));
        assert_eq!(ctx.metadata.len(), 2);
        assert_eq!(ctx.event_metadata().len(), 3);
    }

    #[test]
    fn correlation_id_overrides_metadata_entry() {
        let ctx = Context::default()
            .with_metadata(CORRELATION_ID_KEY, "stale")
            .with_correlation_id("fresh");
        assert_eq!(ctx.event_metadata()[CORRELATION_ID_KEY], "fresh");
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let flag = CancellationFlag::default();
        let ctx = Context::default().with_cancellation(flag.clone());
        let cloned = ctx.clone();

        flag.cancel();
        assert!(ctx.is_cancelled());
        assert!(cloned.is_cancelled());
    }
}
