//! Composite `(primary, sequence)` indices derived from stored events.
//!
//! An index groups events by a business key projected from each envelope
//! (typically the aggregate identifier) so one aggregate's history can be
//! replayed without scanning the whole log. Indices live in their own blob
//! store and are maintained by the event store after every log write.

use std::io;
use std::sync::Arc;

use crate::blob::{BlobStore, ListOptions};
use crate::error::{Error, Result};
use crate::event::Envelope;
use crate::keys::SeqKey;

/// Separator between primary and secondary in [`DashCodec`] keys.
pub const SEPARATOR: char = '-';

/// Derived structure kept in step with the log.
///
/// The event store calls [`insert`](Indexer::insert) after every
/// successful log write and [`remove`](Indexer::remove) after every delete,
/// in registration order.
pub trait Indexer<E>: Send + Sync {
    /// Record `envelope`.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] if the index cannot be updated.
    fn insert(&self, envelope: &Envelope<E>) -> Result<()>;

    /// Forget `envelope`.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] if the index cannot be updated.
    fn remove(&self, envelope: &Envelope<E>) -> Result<()>;
}

/// Encoding of `(primary, secondary)` pairs into single ordered keys.
pub trait KeyCodec<P>: Send + Sync {
    /// Encode one index entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIndexKey`] if `primary` cannot be encoded.
    fn encode(&self, primary: &P, secondary: &SeqKey) -> Result<String>;

    /// Decode a stored key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIndexKey`] for malformed keys.
    fn decode(&self, key: &str) -> Result<(P, SeqKey)>;

    /// Key prefix shared by every entry of `primary`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIndexKey`] if `primary` cannot be encoded.
    fn prefix(&self, primary: &P) -> Result<String>;
}

/// Default codec: `"<primary>-<seqkey>"`.
///
/// Primaries must be non-empty and must not contain the separator.
#[derive(Debug, Clone, Copy, Default)]
pub struct DashCodec;

impl DashCodec {
    fn check_primary(primary: &str) -> Result<()> {
        if primary.is_empty() || primary.contains(SEPARATOR) {
            return Err(Error::InvalidIndexKey(primary.to_owned()));
        }
        Ok(())
    }
}

impl<P> KeyCodec<P> for DashCodec
where
    P: AsRef<str> + From<String>,
{
    fn encode(&self, primary: &P, secondary: &SeqKey) -> Result<String> {
        let primary = primary.as_ref();
        Self::check_primary(primary)?;
        Ok(format!("{primary}{SEPARATOR}{secondary}"))
    }

    fn decode(&self, key: &str) -> Result<(P, SeqKey)> {
        let (primary, secondary) = key
            .split_once(SEPARATOR)
            .ok_or_else(|| Error::InvalidIndexKey(key.to_owned()))?;
        Self::check_primary(primary).map_err(|_| Error::InvalidIndexKey(key.to_owned()))?;
        let secondary = secondary
            .parse::<SeqKey>()
            .map_err(|_| Error::InvalidIndexKey(key.to_owned()))?;
        Ok((P::from(primary.to_owned()), secondary))
    }

    fn prefix(&self, primary: &P) -> Result<String> {
        let primary = primary.as_ref();
        Self::check_primary(primary)?;
        Ok(format!("{primary}{SEPARATOR}"))
    }
}

type Projection<P, E> = Box<dyn Fn(&Envelope<E>) -> Option<P> + Send + Sync>;

/// An ordered `(primary, sequence)` index over one blob store.
///
/// The projection decides which primary an event belongs to; returning
/// `None` leaves the event out of this index without error.
///
/// # Type Parameters
///
/// * `P` - Primary key type, string-like.
/// * `E` - Event supertype of the indexed log.
pub struct CompositeIndex<P, E> {
    store: Arc<dyn BlobStore>,
    projection: Projection<P, E>,
    codec: Box<dyn KeyCodec<P>>,
}

impl<P, E> std::fmt::Debug for CompositeIndex<P, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeIndex").finish_non_exhaustive()
    }
}

impl<P, E> CompositeIndex<P, E>
where
    P: AsRef<str> + From<String> + 'static,
    E: 'static,
{
    /// Index over `store` using `projection` and the [`DashCodec`].
    ///
    /// # Arguments
    ///
    /// * `store` - Blob store dedicated to this index.
    /// * `projection` - Derives the primary key of an event, or `None` to
    ///   skip it.
    pub fn new(
        store: Arc<dyn BlobStore>,
        projection: impl Fn(&Envelope<E>) -> Option<P> + Send + Sync + 'static,
    ) -> Self {
        Self {
            store,
            projection: Box::new(projection),
            codec: Box::new(DashCodec),
        }
    }

    /// Index keyed by the envelope metadata entry `name`.
    ///
    /// Events without that entry are skipped.
    pub fn by_metadata(store: Arc<dyn BlobStore>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(store, move |envelope: &Envelope<E>| {
            envelope.metadata.get(&name).cloned().map(P::from)
        })
    }
}

impl<P, E> CompositeIndex<P, E>
where
    P: AsRef<str>,
{
    /// Replace the key codec.
    pub fn with_codec(mut self, codec: impl KeyCodec<P> + 'static) -> Self {
        self.codec = Box::new(codec);
        self
    }

    /// Check that `primary` can be encoded by this index's codec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIndexKey`] if it cannot.
    pub fn validate_primary(&self, primary: &P) -> Result<()> {
        self.codec.prefix(primary).map(drop)
    }

    /// Every sequence key indexed under `primary`, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] if `primary` cannot be encoded or the listing
    /// cannot start; per-entry failures are yielded by the iterator.
    pub fn group_by_primary(
        &self,
        primary: &P,
    ) -> Result<impl Iterator<Item = Result<SeqKey>> + '_> {
        let prefix = self.codec.prefix(primary)?;
        let keys = self
            .store
            .list(&ListOptions::default().with_prefix(prefix.clone()))
            .map_err(|e| Error::storage("list", prefix.clone(), e))?;
        Ok(keys.map(move |key| {
            let key = key.map_err(|e| Error::storage("list", prefix.clone(), e))?;
            self.codec.decode(&key).map(|(_, secondary)| secondary)
        }))
    }

    /// Distinct primaries with their event counts, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the listing cannot start.
    pub fn group_by_primary_as_string(&self) -> Result<PrimaryCounts<'_>> {
        let keys = self
            .store
            .list(&ListOptions::default())
            .map_err(|e| Error::storage("list", "", e))?;
        let primaries = keys.map(move |key: io::Result<String>| {
            let key = key.map_err(|e| Error::storage("list", "", e))?;
            self.codec
                .decode(&key)
                .map(|(primary, _)| primary.as_ref().to_owned())
        });
        Ok(PrimaryCounts {
            primaries: Box::new(primaries),
            current: None,
        })
    }

    fn project(&self, envelope: &Envelope<E>) -> Result<Option<String>> {
        match (self.projection)(envelope) {
            Some(primary) => self.codec.encode(&primary, &envelope.key).map(Some),
            None => Ok(None),
        }
    }
}

impl<P, E> Indexer<E> for CompositeIndex<P, E>
where
    P: AsRef<str> + Send + Sync,
    E: Send + Sync,
{
    fn insert(&self, envelope: &Envelope<E>) -> Result<()> {
        let Some(key) = self.project(envelope)? else {
            return Ok(());
        };
        self.store
            .put(&key, &[])
            .map_err(|e| Error::storage("put", key, e))
    }

    fn remove(&self, envelope: &Envelope<E>) -> Result<()> {
        let Some(key) = self.project(envelope)? else {
            return Ok(());
        };
        self.store
            .delete(&key)
            .map_err(|e| Error::storage("delete", key, e))
    }
}

/// Lazy `(primary, count)` listing produced by
/// [`CompositeIndex::group_by_primary_as_string`].
///
/// Relies on entries of one primary being adjacent in key order.
pub struct PrimaryCounts<'a> {
    primaries: Box<dyn Iterator<Item = Result<String>> + 'a>,
    current: Option<(String, usize)>,
}

impl Iterator for PrimaryCounts<'_> {
    type Item = Result<(String, usize)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.primaries.next() {
                Some(Ok(primary)) => {
                    if let Some((current, count)) = self.current.as_mut()
                        && *current == primary
                    {
                        *count += 1;
                        continue;
                    }
                    if let Some(finished) = self.current.replace((primary, 1)) {
                        return Some(Ok(finished));
                    }
                }
                Some(Err(e)) => return Some(Err(e)),
                None => return self.current.take().map(Ok),
            }
        }
    }
}
