//! The append log: sequence assignment, the time index, and reads.
//!
//! An [`EventStore`] owns two blob stores (the log keyed by [`SeqKey`] and
//! the time index keyed by [`TimeKey`]) plus any number of
//! [`Indexer`]s. Log writes and index updates are separate single-key
//! operations; there is no transaction spanning them. A failure after the
//! log write leaves the event durable and the indices behind, reported as
//! [`Error::Index`].
//!
//! Stores are opened via [`EventStoreBuilder`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use crate::auth::{Permissions, Subject};
use crate::blob::{BlobStore, ListOptions};
use crate::error::{Error, Result};
use crate::event::{Envelope, EventPayload, ExportDocument, JsonEnvelope, StoreOptions, now_millis};
use crate::index::{CompositeIndex, Indexer};
use crate::keys::{MAX_SEQUENCE, SeqKey, TimeKey};
use crate::registry::TypeRegistry;

/// Sequence bounds and direction for [`EventStore::read_all`] and
/// [`EventStore::export`].
///
/// # Examples
///
/// ```
/// use blobfold_es::ReadOptions;
///
/// let opts = ReadOptions::default().from(10).to(20).reversed();
/// assert_eq!(opts.from_inclusive, Some(10));
/// assert!(opts.reverse);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Lowest sequence to read.
    pub from_inclusive: Option<u64>,
    /// Highest sequence to read.
    pub to_inclusive: Option<u64>,
    /// Read newest first.
    pub reverse: bool,
}

impl ReadOptions {
    /// Start at `sequence`.
    pub fn from(mut self, sequence: u64) -> Self {
        self.from_inclusive = Some(sequence);
        self
    }

    /// Stop after `sequence`.
    pub fn to(mut self, sequence: u64) -> Self {
        self.to_inclusive = Some(sequence);
        self
    }

    /// Read in descending sequence order.
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    fn contains(&self, sequence: u64) -> bool {
        self.from_inclusive.is_none_or(|from| sequence >= from)
            && self.to_inclusive.is_none_or(|to| sequence <= to)
    }
}

/// Sequence bounds for [`EventStore::replay_with_index`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Skip events below this sequence.
    pub from_inclusive: Option<u64>,
    /// Skip events above this sequence.
    pub to_inclusive: Option<u64>,
}

impl ReplayOptions {
    /// Start at `sequence`.
    pub fn from(mut self, sequence: u64) -> Self {
        self.from_inclusive = Some(sequence);
        self
    }

    /// Stop after `sequence`.
    pub fn to(mut self, sequence: u64) -> Self {
        self.to_inclusive = Some(sequence);
        self
    }
}

/// Zero-padded list bound for `sequence`, clamped to the key space.
fn seq_bound(sequence: u64) -> String {
    format!("{:012}", sequence.min(MAX_SEQUENCE))
}

/// Append-only event log over a [`BlobStore`].
///
/// Safe to share between threads. Sequence numbers are assigned from an
/// atomic counter seeded once by scanning the log for its highest key;
/// they are never reused, even after [`delete`](EventStore::delete).
pub struct EventStore<E> {
    log: Arc<dyn BlobStore>,
    times: Arc<dyn BlobStore>,
    registry: TypeRegistry<E>,
    indexers: Vec<Arc<dyn Indexer<E>>>,
    permissions: Permissions,
    last_sequence: OnceCell<AtomicU64>,
    time_lock: Mutex<()>,
}

impl<E> std::fmt::Debug for EventStore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("registry", &self.registry)
            .field("indexers", &self.indexers.len())
            .field("permissions", &self.permissions)
            .finish_non_exhaustive()
    }
}

impl<E: EventPayload> EventStore<E> {
    /// Append one event.
    ///
    /// # Arguments
    ///
    /// * `subject` - Acting subject; must hold the store permission.
    /// * `event` - Payload; its concrete type must be registered.
    /// * `opts` - Event time, creator and metadata overrides.
    ///
    /// # Returns
    ///
    /// The stored envelope, including its assigned sequence.
    ///
    /// # Errors
    ///
    /// Nothing is written when the subject is denied, the payload type is
    /// unregistered, serialization fails, or the event time is out of
    /// range. [`Error::Storage`] from the log write means the event was
    /// not stored. [`Error::Index`] means it was stored but a derived index
    /// is now behind.
    pub fn store(
        &self,
        subject: &dyn Subject,
        event: E,
        opts: StoreOptions,
    ) -> Result<Envelope<E>> {
        subject.audit(&self.permissions.store)?;
        let discriminator = self.registry.discriminator_of(&event)?;
        let raw = event.to_json()?;
        self.append(subject, discriminator, event, raw, opts)
    }

    /// Re-store an exported envelope under a fresh sequence.
    ///
    /// The discriminator, event time, creator and exact payload bytes are
    /// kept. `opts` may override the time or creator; its metadata entries
    /// are laid over the envelope's own.
    ///
    /// # Errors
    ///
    /// As [`store`](EventStore::store), checked against the import
    /// permission, plus [`Error::UnknownDiscriminator`] when the
    /// envelope's discriminator is not registered.
    pub fn import(
        &self,
        subject: &dyn Subject,
        envelope: &JsonEnvelope,
        opts: StoreOptions,
    ) -> Result<Envelope<E>> {
        subject.audit(&self.permissions.import)?;
        let decoded = self.decode_json(envelope)?;
        let mut metadata = decoded.metadata;
        metadata.extend(opts.metadata);
        let opts = StoreOptions {
            event_time: Some(opts.event_time.unwrap_or(decoded.event_time)),
            created_by: Some(opts.created_by.unwrap_or(decoded.created_by)),
            metadata,
        };
        self.append(subject, decoded.discriminator, decoded.data, decoded.raw, opts)
    }

    /// Load the event stored at `sequence`.
    ///
    /// # Returns
    ///
    /// `Ok(None)` if no event exists at that sequence.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownDiscriminator`] if the event exists but its type is
    /// not registered in this process.
    pub fn load(&self, subject: &dyn Subject, sequence: u64) -> Result<Option<Envelope<E>>> {
        subject.audit(&self.permissions.read)?;
        self.fetch(&SeqKey::new(sequence)?)
    }

    /// Physically remove the event at `sequence` from the log, the time
    /// index and every indexer.
    ///
    /// Meant for repair and compliance erasure; the sequence is not
    /// reused. Deleting an absent sequence succeeds.
    ///
    /// # Errors
    ///
    /// [`Error::Index`] if the log entry was removed but an index could
    /// not be updated.
    pub fn delete(&self, subject: &dyn Subject, sequence: u64) -> Result<()> {
        subject.audit(&self.permissions.delete)?;
        let key = SeqKey::new(sequence)?;
        let Some(envelope) = self.fetch(&key)? else {
            return Ok(());
        };
        self.log
            .delete(key.as_str())
            .map_err(|e| Error::storage("delete", key.as_str(), e))?;
        tracing::warn!(
            sequence,
            discriminator = %envelope.discriminator,
            subject = subject.id(),
            "event deleted from log"
        );

        self.unindex(&envelope).map_err(|source| {
            tracing::error!(sequence, error = %source, "index removal failed after delete");
            Error::Index {
                sequence,
                source: Box::new(source),
            }
        })
    }

    /// Iterate the log in sequence order.
    ///
    /// The iterator is lazy and may be dropped at any time. Events deleted
    /// while iterating are skipped. To resume, start a new read from the
    /// last seen sequence plus one.
    ///
    /// # Errors
    ///
    /// Fails up front if the subject is denied or the listing cannot
    /// start; later failures are yielded per item.
    pub fn read_all(
        &self,
        subject: &dyn Subject,
        opts: ReadOptions,
    ) -> Result<impl Iterator<Item = Result<Envelope<E>>> + '_> {
        subject.audit(&self.permissions.read)?;
        self.scan(opts)
    }

    /// Iterate events whose event time lies in
    /// `[from_inclusive, to_inclusive]` milliseconds, ordered by time and
    /// then by sequence.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTimeKey`] for bounds outside the time key range.
    /// An index entry pointing at a missing event is yielded as
    /// [`Error::IndexDiverged`].
    pub fn read_by_time(
        &self,
        subject: &dyn Subject,
        from_inclusive: i64,
        to_inclusive: i64,
    ) -> Result<impl Iterator<Item = Result<Envelope<E>>> + '_> {
        subject.audit(&self.permissions.read)?;
        let opts = ListOptions::default()
            .with_min_inclusive(TimeKey::new(from_inclusive)?.as_str())
            .with_max_inclusive(TimeKey::new(to_inclusive)?.as_str());
        let buckets = self
            .times
            .list(&opts)
            .map_err(|e| Error::storage("list", "", e))?;

        Ok(buckets.flat_map(move |bucket| {
            let sequences = bucket
                .map_err(|e| Error::storage("list", "", e))
                .and_then(|key| self.read_bucket(&key));
            match sequences {
                Ok(sequences) => sequences
                    .into_iter()
                    .map(|sequence| {
                        self.fetch(&SeqKey::new(sequence)?)?
                            .ok_or(Error::IndexDiverged { sequence })
                    })
                    .collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            }
        }))
    }

    /// Replay the events `index` lists under `primary`, in ascending
    /// sequence order, passing each to `apply`.
    ///
    /// # Returns
    ///
    /// The number of events applied.
    ///
    /// # Errors
    ///
    /// Errors from `apply` stop the replay and are returned as-is.
    /// [`Error::IndexDiverged`] if the index names an event missing from
    /// the log.
    pub fn replay_with_index<P, X, F>(
        &self,
        subject: &dyn Subject,
        index: &CompositeIndex<P, E>,
        primary: &P,
        opts: ReplayOptions,
        apply: F,
    ) -> Result<usize, X>
    where
        P: AsRef<str>,
        X: From<Error>,
        F: FnMut(Envelope<E>) -> Result<(), X>,
    {
        subject.audit(&self.permissions.read).map_err(Error::from)?;
        self.replay_indexed(index, primary, opts, apply)
    }

    /// [`replay_with_index`](EventStore::replay_with_index) without the
    /// permission check, for callers that audited already.
    pub(crate) fn replay_indexed<P, X, F>(
        &self,
        index: &CompositeIndex<P, E>,
        primary: &P,
        opts: ReplayOptions,
        mut apply: F,
    ) -> Result<usize, X>
    where
        P: AsRef<str>,
        X: From<Error>,
        F: FnMut(Envelope<E>) -> Result<(), X>,
    {
        let mut applied = 0;
        for key in index.group_by_primary(primary)? {
            let key = key?;
            let sequence = key.sequence();
            if opts.from_inclusive.is_some_and(|from| sequence < from) {
                continue;
            }
            if opts.to_inclusive.is_some_and(|to| sequence > to) {
                // Keys arrive in ascending order.
                break;
            }
            let Some(envelope) = self.fetch(&key)? else {
                tracing::error!(
                    sequence,
                    primary = primary.as_ref(),
                    "index references missing event"
                );
                return Err(Error::IndexDiverged { sequence }.into());
            };
            apply(envelope)?;
            applied += 1;
        }
        tracing::debug!(primary = primary.as_ref(), applied, "replayed from index");
        Ok(applied)
    }

    /// Export the log, or a sequence range of it.
    ///
    /// # Errors
    ///
    /// Fails if the subject lacks the export permission or any event in
    /// range cannot be read.
    pub fn export(&self, subject: &dyn Subject, opts: ReadOptions) -> Result<ExportDocument> {
        subject.audit(&self.permissions.export)?;
        let events = self
            .scan(opts)?
            .map(|envelope| envelope.and_then(|e| e.to_json_envelope()))
            .collect::<Result<_>>()?;
        Ok(ExportDocument { events })
    }

    /// Export the events `index` lists under `primary`.
    ///
    /// # Errors
    ///
    /// As [`export`](EventStore::export), plus [`Error::IndexDiverged`].
    pub fn export_primary<P: AsRef<str>>(
        &self,
        subject: &dyn Subject,
        index: &CompositeIndex<P, E>,
        primary: &P,
    ) -> Result<ExportDocument> {
        subject.audit(&self.permissions.export)?;
        let mut events = Vec::new();
        self.replay_indexed(index, primary, ReplayOptions::default(), |envelope| {
            events.push(envelope.to_json_envelope()?);
            Ok::<_, Error>(())
        })?;
        Ok(ExportDocument { events })
    }

    /// The type registry. Types may still be registered after the store
    /// is built.
    pub fn registry(&self) -> &TypeRegistry<E> {
        &self.registry
    }

    /// The permission names this store audits.
    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    /// Decode an exported envelope against this store's registry.
    pub(crate) fn decode_json(&self, json: &JsonEnvelope) -> Result<Envelope<E>> {
        let key = json.key.parse::<SeqKey>()?;
        let raw = json.data.get().as_bytes().to_vec();
        let data = self
            .registry
            .decode(&json.discriminator, &raw)?
            .ok_or_else(|| Error::UnknownDiscriminator {
                sequence: key.sequence(),
                discriminator: json.discriminator.clone(),
            })?;
        Ok(Envelope {
            sequence: key.sequence(),
            key,
            discriminator: json.discriminator.clone(),
            event_time: json.event_time,
            created_by: json.created_by.clone(),
            metadata: json.metadata.clone(),
            data,
            raw,
        })
    }

    fn append(
        &self,
        subject: &dyn Subject,
        discriminator: String,
        data: E,
        raw: Vec<u8>,
        opts: StoreOptions,
    ) -> Result<Envelope<E>> {
        let event_time = opts.event_time.unwrap_or_else(now_millis);
        let time_key = TimeKey::new(event_time)?;
        let sequence = self.next_sequence()?;
        let key = SeqKey::new(sequence)?;

        let envelope = Envelope {
            sequence,
            key,
            discriminator,
            event_time,
            created_by: opts.created_by.unwrap_or_else(|| subject.id().to_owned()),
            metadata: opts.metadata,
            data,
            raw,
        };
        let bytes = serde_json::to_vec(&envelope.to_json_envelope()?)?;
        self.log
            .put(envelope.key.as_str(), &bytes)
            .map_err(|e| Error::storage("put", envelope.key.as_str(), e))?;
        tracing::debug!(
            sequence,
            discriminator = %envelope.discriminator,
            created_by = %envelope.created_by,
            "event stored"
        );

        self.index(&envelope, &time_key).map_err(|source| {
            tracing::error!(sequence, error = %source, "index update failed after log write");
            Error::Index {
                sequence,
                source: Box::new(source),
            }
        })?;
        Ok(envelope)
    }

    fn index(&self, envelope: &Envelope<E>, time_key: &TimeKey) -> Result<()> {
        self.update_bucket(time_key.as_str(), |sequences| {
            if let Err(pos) = sequences.binary_search(&envelope.sequence) {
                sequences.insert(pos, envelope.sequence);
            }
        })?;
        for indexer in &self.indexers {
            indexer.insert(envelope)?;
        }
        Ok(())
    }

    fn unindex(&self, envelope: &Envelope<E>) -> Result<()> {
        let time_key = TimeKey::new(envelope.event_time)?;
        self.update_bucket(time_key.as_str(), |sequences| {
            sequences.retain(|s| *s != envelope.sequence);
        })?;
        for indexer in &self.indexers {
            indexer.remove(envelope)?;
        }
        Ok(())
    }

    /// Read-modify-write one time bucket under the time-index lock,
    /// deleting it once empty.
    fn update_bucket(&self, key: &str, update: impl FnOnce(&mut Vec<u64>)) -> Result<()> {
        let _guard = self.time_lock.lock();
        let mut sequences = self.read_bucket(key)?;
        update(&mut sequences);
        if sequences.is_empty() {
            self.times
                .delete(key)
                .map_err(|e| Error::storage("delete", key, e))
        } else {
            let bytes = serde_json::to_vec(&sequences)?;
            self.times
                .put(key, &bytes)
                .map_err(|e| Error::storage("put", key, e))
        }
    }

    fn read_bucket(&self, key: &str) -> Result<Vec<u64>> {
        let Some(bytes) = self
            .times
            .get(key)
            .map_err(|e| Error::storage("get", key, e))?
        else {
            return Ok(Vec::new());
        };
        let mut sequences: Vec<u64> = serde_json::from_slice(&bytes)?;
        sequences.sort_unstable();
        sequences.dedup();
        Ok(sequences)
    }

    fn fetch(&self, key: &SeqKey) -> Result<Option<Envelope<E>>> {
        let Some(bytes) = self
            .log
            .get(key.as_str())
            .map_err(|e| Error::storage("get", key.as_str(), e))?
        else {
            return Ok(None);
        };
        let json: JsonEnvelope = serde_json::from_slice(&bytes)?;
        let mut envelope = self.decode_json(&json)?;
        envelope.key = key.clone();
        envelope.sequence = key.sequence();
        Ok(Some(envelope))
    }

    fn scan(&self, opts: ReadOptions) -> Result<impl Iterator<Item = Result<Envelope<E>>> + '_> {
        let mut list = ListOptions::default();
        if let Some(from) = opts.from_inclusive {
            list = list.with_min_inclusive(seq_bound(from));
        }
        if let Some(to) = opts.to_inclusive {
            list = list.with_max_inclusive(seq_bound(to));
        }
        if opts.reverse {
            list = list.reversed();
        }
        let keys = self
            .log
            .list(&list)
            .map_err(|e| Error::storage("list", "", e))?;

        Ok(keys.filter_map(move |key| {
            let key = match key {
                Ok(key) => key,
                Err(e) => return Some(Err(Error::storage("list", "", e))),
            };
            let key = match key.parse::<SeqKey>() {
                Ok(key) => key,
                Err(e) => return Some(Err(e)),
            };
            if !opts.contains(key.sequence()) {
                return None;
            }
            // Absent means deleted after listing.
            self.fetch(&key).transpose()
        }))
    }

    /// Next unused sequence number.
    ///
    /// The first call scans the log for its highest key. A failed scan
    /// leaves the counter unset so the next call retries.
    fn next_sequence(&self) -> Result<u64> {
        let last = self
            .last_sequence
            .get_or_try_init(|| self.recover_sequence().map(AtomicU64::new))?;
        Ok(last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn recover_sequence(&self) -> Result<u64> {
        let keys = self
            .log
            .list(&ListOptions::default().reversed())
            .map_err(|e| Error::storage("list", "", e))?;
        for key in keys {
            let key = key.map_err(|e| Error::storage("list", "", e))?;
            match key.parse::<SeqKey>() {
                Ok(key) => {
                    tracing::info!(last_sequence = key.sequence(), "recovered log position");
                    return Ok(key.sequence());
                }
                Err(_) => tracing::warn!(key = %key, "ignoring foreign key in log"),
            }
        }
        tracing::info!(last_sequence = 0, "log is empty");
        Ok(0)
    }
}

/// Builder for configuring and opening an [`EventStore`].
///
/// Collects the log and time-index blob stores, payload registrations,
/// indexers and permission names.
///
/// # Panics
///
/// Registration conflicts and a missing blob store are programming errors
/// and panic, in [`event`](EventStoreBuilder::event) and
/// [`build`](EventStoreBuilder::build) respectively.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use blobfold_es::{EventStoreBuilder, MemoryBlobStore, StoreOptions, SystemSubject, event_payload};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct Deposited { pub amount: u64 }
///
/// event_payload! {
///     #[derive(Debug, Clone)]
///     pub enum AccountEvent { Deposited(Deposited) }
/// }
///
/// let store = EventStoreBuilder::<AccountEvent>::new()
///     .log(Arc::new(MemoryBlobStore::new()))
///     .time_index(Arc::new(MemoryBlobStore::new()))
///     .event::<Deposited>("account.deposited")
///     .build();
///
/// let subject = SystemSubject::default();
/// let stored = store
///     .store(&subject, Deposited { amount: 5 }.into(), StoreOptions::default())
///     .unwrap();
/// assert_eq!(stored.sequence, 1);
/// assert_eq!(stored.created_by, "system");
/// ```
pub struct EventStoreBuilder<E> {
    log: Option<Arc<dyn BlobStore>>,
    times: Option<Arc<dyn BlobStore>>,
    registry: TypeRegistry<E>,
    indexers: Vec<Arc<dyn Indexer<E>>>,
    permissions: Permissions,
}

impl<E: EventPayload> EventStoreBuilder<E> {
    /// Create a builder with no stores, no registrations and default
    /// permissions.
    pub fn new() -> Self {
        Self {
            log: None,
            times: None,
            registry: TypeRegistry::new(),
            indexers: Vec::new(),
            permissions: Permissions::default(),
        }
    }

    /// Set the blob store holding the log.
    pub fn log(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.log = Some(store);
        self
    }

    /// Set the blob store holding the time index.
    pub fn time_index(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.times = Some(store);
        self
    }

    /// Register payload type `P` under `discriminator`.
    ///
    /// # Panics
    ///
    /// If the discriminator is malformed or either side is already bound
    /// to something else.
    pub fn event<P>(self, discriminator: &str) -> Self
    where
        P: DeserializeOwned + Into<E> + 'static,
    {
        if let Err(e) = self.registry.register::<P>(discriminator) {
            panic!("cannot register event type {discriminator:?}: {e}");
        }
        self
    }

    /// Add an indexer. Indexers run in the order they are added.
    pub fn indexer(mut self, indexer: Arc<dyn Indexer<E>>) -> Self {
        self.indexers.push(indexer);
        self
    }

    /// Override the permission names audited by the store.
    pub fn permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    /// Build the store. No I/O happens until the first operation.
    ///
    /// # Panics
    ///
    /// If the log or the time index was not set.
    pub fn build(self) -> EventStore<E> {
        let (Some(log), Some(times)) = (self.log, self.times) else {
            panic!("EventStoreBuilder requires both a log and a time index store");
        };
        EventStore {
            log,
            times,
            registry: self.registry,
            indexers: self.indexers,
            permissions: self.permissions,
            last_sequence: OnceCell::new(),
            time_lock: Mutex::new(()),
        }
    }
}

impl<E: EventPayload> Default for EventStoreBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}
