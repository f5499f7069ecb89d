//! Crate-level error types for the event store, its indices, and the
//! decide-evolve handler.

use std::io;

use crate::auth::AccessDenied;

/// Error returned by the event store, the type registry, the key codecs and
/// the composite indices.
///
/// Variants fall into four groups: validation failures detected before any
/// I/O, registry mismatches (a deployed schema does not match the code),
/// consistency failures between the log and its derived indices, and
/// infrastructure failures from the underlying blob store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Discriminator does not match `[A-Za-z0-9._-]{1,256}`.
    #[error("invalid discriminator {0:?}")]
    InvalidDiscriminator(String),

    /// An aggregate or index key was empty.
    #[error("key must not be empty")]
    EmptyKey,

    /// Sequence numbers start at 1 and fit in twelve decimal digits.
    #[error("sequence {0} is out of range")]
    InvalidSequence(u64),

    /// A sequence key was not exactly twelve ASCII digits encoding a
    /// positive number.
    #[error("malformed sequence key {0:?}")]
    InvalidSeqKey(String),

    /// A time key was not exactly thirteen ASCII digits, or the timestamp
    /// it was built from does not fit.
    #[error("malformed time key {0:?}")]
    InvalidTimeKey(String),

    /// A composite index key could not be encoded or decoded.
    #[error("malformed index key {0:?}")]
    InvalidIndexKey(String),

    /// The payload's type has no discriminator registered.
    #[error("unregistered event type {0}")]
    UnregisteredType(&'static str),

    /// A stored event names a discriminator this process does not know.
    ///
    /// Distinct from a missing event: the record exists but cannot be
    /// read with the currently registered types.
    #[error("event {sequence} has unknown discriminator {discriminator:?}")]
    UnknownDiscriminator {
        /// Sequence of the unreadable event.
        sequence: u64,
        /// Discriminator found in the stored envelope.
        discriminator: String,
    },

    /// The discriminator is already bound to another type.
    #[error("discriminator {discriminator:?} is already bound to {existing}")]
    DiscriminatorConflict {
        /// Discriminator being registered.
        discriminator: String,
        /// Type currently bound to it.
        existing: &'static str,
    },

    /// The type is already bound to another discriminator.
    #[error("type {type_name} is already registered as {existing:?}")]
    TypeConflict {
        /// Type being registered.
        type_name: &'static str,
        /// Discriminator currently bound to it.
        existing: String,
    },

    /// The acting subject lacks a permission.
    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),

    /// Payload or envelope (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The blob store failed.
    #[error("{op} {key:?}: {source}")]
    Storage {
        /// Operation that failed (`get`, `put`, `delete`, `list`).
        op: &'static str,
        /// Key the operation targeted (or the list prefix).
        key: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The event was written to the log but a derived index could not be
    /// updated. The log and the index now disagree until repaired.
    #[error("event {sequence} stored but index update failed: {source}")]
    Index {
        /// Sequence of the durably stored event.
        sequence: u64,
        /// Failure raised by the time index or an indexer.
        #[source]
        source: Box<Error>,
    },

    /// An index references a log entry that does not exist.
    #[error("index references missing event {sequence}")]
    IndexDiverged {
        /// Sequence the index pointed at.
        sequence: u64,
    },
}

impl Error {
    /// Wrap a blob-store failure with the operation and key it concerned.
    pub(crate) fn storage(op: &'static str, key: impl Into<String>, source: io::Error) -> Self {
        Self::Storage {
            op,
            key: key.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error returned when handling a command or reading an aggregate fails.
///
/// Generic over `E`, the domain error type produced by the aggregate's
/// decide and evolve functions.
///
/// # Type Parameters
///
/// * `E` - Domain error type, must implement `Error + Send + Sync + 'static`
#[derive(Debug, thiserror::Error)]
pub enum HandleError<E: std::error::Error + Send + Sync + 'static> {
    /// The aggregate key was empty.
    #[error("aggregate key must not be empty")]
    EmptyKey,

    /// Command rejected by the decide function.
    #[error(transparent)]
    Domain(E),

    /// Applying a stored event to the cached aggregate failed.
    ///
    /// The cache entry has already been reset; the next access replays
    /// the aggregate from the log.
    #[error("evolve failed at event {sequence}: {source}")]
    Evolve {
        /// Sequence of the event that could not be applied.
        sequence: u64,
        /// Domain error raised by evolve.
        #[source]
        source: E,
    },

    /// The event store failed.
    #[error(transparent)]
    Store(#[from] Error),
}
