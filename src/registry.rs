//! Bidirectional discriminator / payload-type registry.
//!
//! Populated once at startup, then read on every store and load. The
//! registry is closed: an event supertype `E` can only be decoded from
//! discriminators whose payload types were registered against it.

use std::any::TypeId;
use std::collections::HashMap;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::event::{EventPayload, PayloadType};

/// Longest accepted discriminator.
pub const MAX_DISCRIMINATOR_LEN: usize = 256;

/// Decoder for one registered payload type, lifted into the supertype.
type DecodeFn<E> = fn(&[u8]) -> serde_json::Result<E>;

/// Deserialize `P` and convert it into the event supertype.
///
/// Used as a monomorphized function pointer, one per registration.
fn decode<P, E>(bytes: &[u8]) -> serde_json::Result<E>
where
    P: DeserializeOwned + Into<E>,
{
    serde_json::from_slice::<P>(bytes).map(Into::into)
}

/// Check a discriminator against `[A-Za-z0-9._-]{1,256}`.
///
/// # Errors
///
/// Returns [`Error::InvalidDiscriminator`] otherwise.
pub fn validate_discriminator(discriminator: &str) -> Result<()> {
    let valid = (1..=MAX_DISCRIMINATOR_LEN).contains(&discriminator.len())
        && discriminator
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidDiscriminator(discriminator.to_owned()))
    }
}

struct Binding<E> {
    payload_type: PayloadType,
    decode: DecodeFn<E>,
}

struct Maps<E> {
    by_discriminator: HashMap<String, Binding<E>>,
    by_type: HashMap<TypeId, String>,
}

/// Maps stable discriminator strings to concrete payload types of the
/// event supertype `E`, and back.
///
/// # Examples
///
/// ```
/// use blobfold_es::{TypeRegistry, event_payload};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// pub struct Renamed { pub name: String }
///
/// event_payload! {
///     #[derive(Debug, Clone, PartialEq)]
///     pub enum ItemEvent { Renamed(Renamed) }
/// }
///
/// let registry = TypeRegistry::<ItemEvent>::new();
/// registry.register::<Renamed>("item.renamed").unwrap();
/// // Re-registering the identical pair is a no-op.
/// registry.register::<Renamed>("item.renamed").unwrap();
///
/// let event: ItemEvent = Renamed { name: "x".into() }.into();
/// assert_eq!(registry.discriminator_of(&event).unwrap(), "item.renamed");
/// let decoded = registry.decode("item.renamed", br#"{"name":"x"}"#).unwrap();
/// assert_eq!(decoded, Some(event));
/// ```
pub struct TypeRegistry<E> {
    maps: RwLock<Maps<E>>,
}

impl<E> Default for TypeRegistry<E> {
    fn default() -> Self {
        Self {
            maps: RwLock::new(Maps {
                by_discriminator: HashMap::new(),
                by_type: HashMap::new(),
            }),
        }
    }
}

impl<E> std::fmt::Debug for TypeRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("discriminators", &self.discriminators())
            .finish()
    }
}

impl<E: EventPayload> TypeRegistry<E> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind payload type `P` to `discriminator`.
    ///
    /// Idempotent for an identical pair, so repeated module initialization
    /// is harmless.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidDiscriminator`] - bad discriminator format.
    /// * [`Error::DiscriminatorConflict`] - discriminator bound to another type.
    /// * [`Error::TypeConflict`] - `P` bound to another discriminator.
    pub fn register<P>(&self, discriminator: &str) -> Result<()>
    where
        P: DeserializeOwned + Into<E> + 'static,
    {
        validate_discriminator(discriminator)?;
        let payload_type = PayloadType::of::<P>();

        let mut maps = self.maps.write();
        if let Some(existing) = maps.by_discriminator.get(discriminator) {
            if existing.payload_type == payload_type {
                return Ok(());
            }
            return Err(Error::DiscriminatorConflict {
                discriminator: discriminator.to_owned(),
                existing: existing.payload_type.name,
            });
        }
        if let Some(existing) = maps.by_type.get(&payload_type.id) {
            return Err(Error::TypeConflict {
                type_name: payload_type.name,
                existing: existing.clone(),
            });
        }

        maps.by_discriminator.insert(
            discriminator.to_owned(),
            Binding {
                payload_type,
                decode: decode::<P, E>,
            },
        );
        maps.by_type.insert(payload_type.id, discriminator.to_owned());
        tracing::debug!(discriminator, type_name = payload_type.name, "event type registered");
        Ok(())
    }

    /// The discriminator registered for the payload carried by `event`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnregisteredType`] naming the payload type.
    pub fn discriminator_of(&self, event: &E) -> Result<String> {
        let payload_type = event.payload_type();
        self.maps
            .read()
            .by_type
            .get(&payload_type.id)
            .cloned()
            .ok_or(Error::UnregisteredType(payload_type.name))
    }

    /// Decode `bytes` as the payload registered under `discriminator`.
    ///
    /// Returns `Ok(None)` when the discriminator is not registered, so
    /// callers can report it with their own context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the bytes do not match the payload type.
    pub fn decode(&self, discriminator: &str, bytes: &[u8]) -> Result<Option<E>> {
        let decode = match self.maps.read().by_discriminator.get(discriminator) {
            Some(binding) => binding.decode,
            None => return Ok(None),
        };
        Ok(Some(decode(bytes)?))
    }

    /// The payload type bound to `discriminator`, if any.
    pub fn payload_type(&self, discriminator: &str) -> Option<PayloadType> {
        self.maps
            .read()
            .by_discriminator
            .get(discriminator)
            .map(|b| b.payload_type)
    }

    /// Whether `discriminator` is registered.
    pub fn contains(&self, discriminator: &str) -> bool {
        self.maps.read().by_discriminator.contains_key(discriminator)
    }
}

impl<E> TypeRegistry<E> {
    /// All registered discriminators, sorted.
    pub fn discriminators(&self) -> Vec<String> {
        let mut names: Vec<String> = self.maps.read().by_discriminator.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{
        Corrupted, FirstnameUpdated, LastnameUpdated, PersonEvent,
    };

    fn registry() -> TypeRegistry<PersonEvent> {
        let registry = TypeRegistry::new();
        registry
            .register::<FirstnameUpdated>("FirstnameUpdated")
            .expect("register should succeed");
        registry
    }

    #[test]
    fn validate_discriminator_accepts_charset() {
        for ok in ["a", "FirstnameUpdated", "person.v2_name-updated", "x".repeat(256).as_str()] {
            assert!(validate_discriminator(ok).is_ok(), "{ok:?} should be valid");
        }
    }

    #[test]
    fn validate_discriminator_rejects_bad_input() {
        for bad in ["", "has space", "slash/", "ümlaut", "x".repeat(257).as_str()] {
            assert!(
                matches!(validate_discriminator(bad), Err(Error::InvalidDiscriminator(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn register_is_idempotent() {
        let registry = registry();
        registry
            .register::<FirstnameUpdated>("FirstnameUpdated")
            .expect("identical re-registration should succeed");
        assert_eq!(registry.discriminators(), vec!["FirstnameUpdated"]);
    }

    #[test]
    fn register_rejects_discriminator_rebinding() {
        let registry = registry();
        let err = registry
            .register::<LastnameUpdated>("FirstnameUpdated")
            .expect_err("rebinding should fail");
        assert!(matches!(err, Error::DiscriminatorConflict { .. }), "got {err:?}");
    }

    #[test]
    fn register_rejects_type_rebinding() {
        let registry = registry();
        let err = registry
            .register::<FirstnameUpdated>("FirstnameChanged")
            .expect_err("second discriminator for the same type should fail");
        match err {
            Error::TypeConflict { existing, .. } => assert_eq!(existing, "FirstnameUpdated"),
            other => panic!("expected TypeConflict, got {other:?}"),
        }
    }

    #[test]
    fn discriminator_of_unregistered_names_type() {
        let registry = registry();
        let event: PersonEvent = Corrupted { reason: "x".into() }.into();
        match registry.discriminator_of(&event) {
            Err(Error::UnregisteredType(name)) => assert!(name.ends_with("Corrupted")),
            other => panic!("expected UnregisteredType, got {other:?}"),
        }
    }

    #[test]
    fn decode_roundtrip_and_unknown() {
        let registry = registry();
        let decoded = registry
            .decode("FirstnameUpdated", br#"{"firstname":"John"}"#)
            .expect("decode should succeed");
        assert_eq!(
            decoded,
            Some(PersonEvent::FirstnameUpdated(FirstnameUpdated {
                firstname: "John".into()
            }))
        );
        assert_eq!(registry.decode("Nope", b"{}").expect("unknown is not an error"), None);
        assert!(matches!(
            registry.decode("FirstnameUpdated", b"[1]"),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn payload_type_lookup() {
        let registry = registry();
        assert_eq!(
            registry.payload_type("FirstnameUpdated"),
            Some(PayloadType::of::<FirstnameUpdated>())
        );
        assert!(registry.contains("FirstnameUpdated"));
        assert!(!registry.contains("LastnameUpdated"));
    }
}
