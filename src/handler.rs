//! Decide-evolve command handling over a per-key aggregate cache.
//!
//! A [`Handler`] serializes work per aggregate key. Each key has its own
//! cache entry behind its own mutex, held for the whole of one operation
//! (replay, decide, store, evolve); the map of entries sits behind a
//! separate lock that is only taken to find or insert an entry and is never
//! held across I/O. Different keys proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::aggregate::{Aggregate, fold};
use crate::auth::Subject;
use crate::command::{Command, Context};
use crate::error::{Error, HandleError};
use crate::event::{Envelope, ExportDocument, StoreOptions};
use crate::index::CompositeIndex;
use crate::store::{EventStore, ReplayOptions};

/// Metadata key under which the handler stamps the aggregate key on every
/// stored envelope. Build the handler's index with
/// [`CompositeIndex::by_metadata`] on this key.
pub const AGGREGATE_KEY_METADATA: &str = "aggregate_key";

/// Cached state of one aggregate.
struct CacheEntry<A> {
    /// Set after a full replay found at least one event.
    replayed: bool,
    aggregate: A,
}

impl<A: Default> Default for CacheEntry<A> {
    fn default() -> Self {
        Self {
            replayed: false,
            aggregate: A::default(),
        }
    }
}

type Result<T, E> = std::result::Result<T, HandleError<E>>;

/// Runs commands against aggregates stored in an [`EventStore`].
///
/// Aggregates are rebuilt from the log on first use through the composite
/// index and then kept in memory. Callers only ever receive clones.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use blobfold_es::{
///     AGGREGATE_KEY_METADATA, Aggregate, Command, CompositeIndex, Context, Envelope,
///     EventStoreBuilder, Handler, MemoryBlobStore, Subject, SystemSubject, event_payload,
/// };
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct Incremented { pub by: u64 }
///
/// event_payload! {
///     #[derive(Debug, Clone)]
///     pub enum CounterEvent { Incremented(Incremented) }
/// }
///
/// #[derive(Debug, Clone, Default)]
/// struct Counter { value: u64 }
///
/// impl Aggregate for Counter {
///     const AGGREGATE_TYPE: &'static str = "counter";
///     type Event = CounterEvent;
///     type Error = std::convert::Infallible;
///
///     fn evolve(&mut self, _ctx: &Context, event: &Envelope<CounterEvent>) -> Result<(), Self::Error> {
///         let CounterEvent::Incremented(e) = &event.data;
///         self.value += e.by;
///         Ok(())
///     }
/// }
///
/// struct Increment(u64);
///
/// impl Command<Counter> for Increment {
///     fn decide(&self, _: &dyn Subject, _: &Counter) -> Result<Vec<CounterEvent>, std::convert::Infallible> {
///         Ok(vec![Incremented { by: self.0 }.into()])
///     }
/// }
///
/// let index: Arc<CompositeIndex<String, CounterEvent>> = Arc::new(CompositeIndex::by_metadata(
///     Arc::new(MemoryBlobStore::new()),
///     AGGREGATE_KEY_METADATA,
/// ));
/// let store = EventStoreBuilder::<CounterEvent>::new()
///     .log(Arc::new(MemoryBlobStore::new()))
///     .time_index(Arc::new(MemoryBlobStore::new()))
///     .event::<Incremented>("counter.incremented")
///     .indexer(index.clone())
///     .build();
/// let handler = Handler::<Counter>::new(Arc::new(store), index);
///
/// let subject = SystemSubject::default();
/// let ctx = Context::default();
/// handler.handle(&subject, &ctx, "c1", &Increment(2)).unwrap();
/// handler.handle(&subject, &ctx, "c1", &Increment(3)).unwrap();
/// assert_eq!(handler.aggregate(&subject, &ctx, "c1").unwrap().unwrap().value, 5);
/// assert!(handler.aggregate(&subject, &ctx, "c2").unwrap().is_none());
/// ```
pub struct Handler<A: Aggregate> {
    store: Arc<EventStore<A::Event>>,
    index: Arc<CompositeIndex<String, A::Event>>,
    cache: Mutex<HashMap<String, Arc<Mutex<CacheEntry<A>>>>>,
}

impl<A: Aggregate> std::fmt::Debug for Handler<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

impl<A: Aggregate> Handler<A> {
    /// Create a handler over `store`.
    ///
    /// # Arguments
    ///
    /// * `store` - Event store the aggregate's events are written to.
    /// * `index` - Index keyed by [`AGGREGATE_KEY_METADATA`], registered
    ///   as an indexer of `store`.
    pub fn new(
        store: Arc<EventStore<A::Event>>,
        index: Arc<CompositeIndex<String, A::Event>>,
    ) -> Self {
        Self {
            store,
            index,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Run `command` against the aggregate at `key`.
    ///
    /// A missing aggregate is created from `A::default()`. When
    /// [`decide`](Command::decide) returns no events the call returns
    /// immediately without touching storage.
    ///
    /// # Returns
    ///
    /// The stored envelopes, in order.
    ///
    /// # Errors
    ///
    /// * [`HandleError::EmptyKey`] - `key` is empty.
    /// * [`HandleError::Store`] with [`Error::InvalidIndexKey`] - the
    ///   aggregate index cannot encode `key` (with the default codec, it
    ///   contains `-`). Nothing is read or written.
    /// * [`HandleError::Domain`] - the command was rejected.
    /// * [`HandleError::Store`] - replay or storage failed. Events stored
    ///   before the failure stay in the log.
    /// * [`HandleError::Evolve`] - a stored event could not be applied. The
    ///   events are durable; the cache entry is reset so the next access
    ///   replays from the log.
    pub fn handle<C: Command<A>>(
        &self,
        subject: &dyn Subject,
        ctx: &Context,
        key: &str,
        command: &C,
    ) -> Result<Vec<Envelope<A::Event>>, A::Error> {
        self.check_key(key)?;
        let _span =
            tracing::info_span!("handle", aggregate_type = A::AGGREGATE_TYPE, key).entered();

        let entry = self.entry(key);
        let mut entry = entry.lock();
        self.ensure_replayed(ctx, key, &mut *entry)?;

        let events = command
            .decide(subject, &entry.aggregate)
            .map_err(HandleError::Domain)?;
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut metadata = ctx.event_metadata();
        metadata.insert(AGGREGATE_KEY_METADATA.to_owned(), key.to_owned());
        let opts = StoreOptions::default()
            .with_created_by(subject.id())
            .with_metadata(metadata);

        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            match self.store.store(subject, event, opts.clone()) {
                Ok(envelope) => stored.push(envelope),
                Err(e) => {
                    // The log may now hold events the cached state lacks.
                    reset(key, &mut *entry);
                    return Err(e.into());
                }
            }
        }

        for envelope in &stored {
            if let Err(source) = entry.aggregate.evolve(ctx, envelope) {
                reset(key, &mut *entry);
                return Err(HandleError::Evolve {
                    sequence: envelope.sequence,
                    source,
                });
            }
        }
        Ok(stored)
    }

    /// A clone of the aggregate at `key`.
    ///
    /// # Returns
    ///
    /// `None` if no events exist for `key`.
    ///
    /// # Errors
    ///
    /// [`HandleError::EmptyKey`], access denial as [`HandleError::Store`],
    /// and replay failures.
    pub fn aggregate(
        &self,
        subject: &dyn Subject,
        ctx: &Context,
        key: &str,
    ) -> Result<Option<A>, A::Error> {
        self.check_key(key)?;
        subject
            .audit_resource(A::AGGREGATE_TYPE, key, &self.store.permissions().read)
            .map_err(Error::from)?;

        let entry = self.entry(key);
        let mut entry = entry.lock();
        if !self.ensure_replayed(ctx, key, &mut *entry)? {
            return Ok(None);
        }
        Ok(Some(entry.aggregate.clone()))
    }

    /// Drop the cached entry for `key`. The next access replays it.
    pub fn evict(&self, key: &str) {
        if self.cache.lock().remove(key).is_some() {
            tracing::debug!(aggregate_type = A::AGGREGATE_TYPE, key, "evicted aggregate");
        }
    }

    /// Keys with a cache entry, sorted.
    pub fn cached_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.cache.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Load `doc` into the aggregate at `key`.
    ///
    /// The document is first folded onto a fresh aggregate; nothing is
    /// written if any event fails to decode or evolve. Each event is then
    /// stored under a new sequence with its payload bytes, time, creator
    /// and metadata kept, re-keyed to `key`.
    ///
    /// # Returns
    ///
    /// The aggregate as rebuilt from the newly stored events.
    ///
    /// # Errors
    ///
    /// Validation errors as [`rebuild`](Handler::rebuild); access denial
    /// and storage failures as [`HandleError::Store`].
    pub fn import(
        &self,
        subject: &dyn Subject,
        ctx: &Context,
        key: &str,
        doc: &ExportDocument,
    ) -> Result<A, A::Error> {
        self.check_key(key)?;
        subject
            .audit_resource(A::AGGREGATE_TYPE, key, &self.store.permissions().import)
            .map_err(Error::from)?;
        self.rebuild(ctx, doc)?;

        let entry = self.entry(key);
        let mut entry = entry.lock();
        let rekey = StoreOptions::default().with_metadata(
            [(AGGREGATE_KEY_METADATA.to_owned(), key.to_owned())]
                .into_iter()
                .collect(),
        );
        let mut stored = Vec::with_capacity(doc.events.len());
        for event in &doc.events {
            match self.store.import(subject, event, rekey.clone()) {
                Ok(envelope) => stored.push(envelope),
                Err(e) => {
                    reset(key, &mut *entry);
                    return Err(e.into());
                }
            }
        }
        // Reset in place so waiters on this entry replay.
        *entry = CacheEntry::default();
        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            key,
            events = stored.len(),
            "imported aggregate"
        );
        fold(ctx, &stored)
    }

    /// Fold `doc` onto a fresh aggregate without storing anything.
    ///
    /// # Errors
    ///
    /// [`HandleError::Store`] if an event cannot be decoded,
    /// [`HandleError::Evolve`] if one cannot be applied.
    pub fn rebuild(&self, ctx: &Context, doc: &ExportDocument) -> Result<A, A::Error> {
        let events = doc
            .events
            .iter()
            .map(|json| self.store.decode_json(json))
            .collect::<std::result::Result<Vec<_>, Error>>()?;
        fold(ctx, &events)
    }

    /// The underlying event store.
    pub fn store(&self) -> &Arc<EventStore<A::Event>> {
        &self.store
    }

    /// The aggregate-key index.
    pub fn index(&self) -> &Arc<CompositeIndex<String, A::Event>> {
        &self.index
    }

    /// Reject keys the aggregate index cannot encode, before any I/O.
    fn check_key(&self, key: &str) -> Result<(), A::Error> {
        if key.is_empty() {
            return Err(HandleError::EmptyKey);
        }
        self.index.validate_primary(&key.to_owned())?;
        Ok(())
    }

    /// Find or create the entry for `key`. The map lock is released on
    /// return.
    fn entry(&self, key: &str) -> Arc<Mutex<CacheEntry<A>>> {
        self.cache
            .lock()
            .entry(key.to_owned())
            .or_default()
            .clone()
    }

    /// Replay the entry from the log unless it is already warm.
    ///
    /// Returns `false` when the aggregate has no events; the entry then
    /// stays cold. Must be called with the entry lock held.
    fn ensure_replayed(
        &self,
        ctx: &Context,
        key: &str,
        entry: &mut CacheEntry<A>,
    ) -> Result<bool, A::Error> {
        if entry.replayed {
            return Ok(true);
        }
        entry.aggregate = A::default();
        let aggregate = &mut entry.aggregate;
        let replayed = self.store.replay_indexed(
            &*self.index,
            &key.to_owned(),
            ReplayOptions::default(),
            |envelope| {
                aggregate
                    .evolve(ctx, &envelope)
                    .map_err(|source| HandleError::Evolve {
                        sequence: envelope.sequence,
                        source,
                    })
            },
        );
        match replayed {
            Ok(0) => Ok(false),
            Ok(events) => {
                entry.replayed = true;
                tracing::debug!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    key,
                    events,
                    "replayed aggregate"
                );
                Ok(true)
            }
            Err(e) => {
                reset(key, entry);
                Err(e)
            }
        }
    }
}

/// Return an entry to its cold, default state.
fn reset<A: Aggregate>(key: &str, entry: &mut CacheEntry<A>) {
    tracing::warn!(aggregate_type = A::AGGREGATE_TYPE, key, "resetting cached aggregate");
    *entry = CacheEntry::default();
}
