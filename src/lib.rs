//! Event sourcing over a pluggable ordered blob store.
//!
//! Events are appended to a log keyed by fixed-width sequence keys, indexed
//! by event time and by any number of composite `(primary, sequence)`
//! indices, and folded into aggregates by a decide-evolve [`Handler`] that
//! keeps one cached aggregate per key.

mod aggregate;
pub use aggregate::{Aggregate, fold};
mod auth;
mod blob;
mod command;
mod error;
mod event;
mod handler;
mod index;
mod keys;
mod registry;
mod storage;
mod store;

pub use auth::{AccessDenied, Permissions, Subject, SystemSubject};
pub use blob::{BlobStore, Keys, ListOptions, MemoryBlobStore};
pub use command::{CORRELATION_ID_KEY, CancellationFlag, Command, Context};
pub use error::{Error, HandleError, Result};
pub use event::{
    Envelope, EventPayload, ExportDocument, JsonEnvelope, PayloadType, StoreOptions, now_millis,
};
pub use handler::{AGGREGATE_KEY_METADATA, Handler};
pub use index::{CompositeIndex, DashCodec, Indexer, KeyCodec, PrimaryCounts, SEPARATOR};
pub use keys::{MAX_SEQUENCE, MAX_TIMESTAMP, SEQ_KEY_WIDTH, SeqKey, TIME_KEY_WIDTH, TimeKey};
pub use registry::{MAX_DISCRIMINATOR_LEN, TypeRegistry, validate_discriminator};
pub use storage::FsBlobStore;
pub use store::{EventStore, EventStoreBuilder, ReadOptions, ReplayOptions};

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}
