//! Envelope, payload contract and the persisted / exported JSON shapes.
//!
//! Nothing in this module performs I/O. The event store turns payloads
//! into [`JsonEnvelope`]s on write and back into typed [`Envelope`]s on
//! read, using the [`TypeRegistry`](crate::TypeRegistry) to resolve
//! discriminators.

use std::any::TypeId;
use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::Result;
use crate::keys::SeqKey;

/// Runtime identity of a concrete payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadType {
    /// `TypeId` of the concrete type; the registry's lookup key.
    pub id: TypeId,
    /// Rust type name, used in error messages.
    pub name: &'static str,
}

impl PayloadType {
    /// The payload type of `T`.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

/// The event supertype of an aggregate.
///
/// Usually a closed enum whose variants each wrap one concrete payload
/// struct. [`payload_type`](EventPayload::payload_type) names the wrapped
/// struct so the registry can find its discriminator, and
/// [`to_json`](EventPayload::to_json) serializes only that struct. The
/// [`event_payload!`](crate::event_payload) macro generates both from the
/// enum definition.
pub trait EventPayload: Send + Sync + 'static {
    /// Identity of the concrete payload carried by this value.
    fn payload_type(&self) -> PayloadType;

    /// Serialize the concrete payload.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload cannot be serialized.
    fn to_json(&self) -> serde_json::Result<Vec<u8>>;
}

/// Declare a closed event enum and implement [`EventPayload`] for it.
///
/// Each variant wraps exactly one payload type; a `From` impl is generated
/// per variant so the payload can be registered with
/// [`TypeRegistry::register`](crate::TypeRegistry::register).
///
/// # Examples
///
/// ```
/// use blobfold_es::{EventPayload, PayloadType, event_payload};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// pub struct Opened { pub owner: String }
///
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// pub struct Closed;
///
/// event_payload! {
///     #[derive(Debug, Clone, PartialEq)]
///     pub enum AccountEvent {
///         Opened(Opened),
///         Closed(Closed),
///     }
/// }
///
/// let event: AccountEvent = Opened { owner: "ann".into() }.into();
/// assert_eq!(event.payload_type(), PayloadType::of::<Opened>());
/// assert_eq!(event.to_json().unwrap(), br#"{"owner":"ann"}"#);
/// ```
#[macro_export]
macro_rules! event_payload {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident($inner:ty)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $($variant($inner)),+
        }

        $(
            impl ::std::convert::From<$inner> for $name {
                fn from(value: $inner) -> Self {
                    $name::$variant(value)
                }
            }
        )+

        impl $crate::EventPayload for $name {
            fn payload_type(&self) -> $crate::PayloadType {
                match self {
                    $($name::$variant(_) => $crate::PayloadType::of::<$inner>()),+
                }
            }

            fn to_json(&self) -> $crate::__private::serde_json::Result<::std::vec::Vec<u8>> {
                match self {
                    $($name::$variant(inner) => $crate::__private::serde_json::to_vec(inner)),+
                }
            }
        }
    };
}

/// A stored event with its typed payload.
///
/// Immutable once written; only physical deletion removes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<E> {
    /// Position in the log; strictly increasing, never reused.
    pub sequence: u64,
    /// Blob-store key of this envelope.
    pub key: SeqKey,
    /// Registered name of the payload's concrete type.
    pub discriminator: String,
    /// Domain time in milliseconds since the Unix epoch.
    pub event_time: i64,
    /// Identifier of the actor that stored the event.
    pub created_by: String,
    /// Free-form string metadata.
    pub metadata: BTreeMap<String, String>,
    /// Decoded payload.
    pub data: E,
    /// Exact serialized payload bytes.
    pub raw: Vec<u8>,
}

impl<E> Envelope<E> {
    /// Convert into the persisted / exported JSON shape.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if `raw` is not valid JSON.
    pub fn to_json_envelope(&self) -> Result<JsonEnvelope> {
        Ok(JsonEnvelope {
            sequence: self.sequence,
            key: self.key.to_string(),
            discriminator: self.discriminator.clone(),
            event_time: self.event_time,
            created_by: self.created_by.clone(),
            metadata: self.metadata.clone(),
            data: serde_json::from_slice(&self.raw)?,
        })
    }
}

/// Persisted form of an envelope; also the element type of exports.
///
/// `data` is embedded as raw JSON so payload bytes survive a round trip
/// unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonEnvelope {
    /// Position in the log.
    pub sequence: u64,
    /// Twelve-digit sequence key.
    pub key: String,
    /// Registered name of the payload's concrete type.
    pub discriminator: String,
    /// Domain time in milliseconds since the Unix epoch.
    pub event_time: i64,
    /// Identifier of the actor that stored the event.
    pub created_by: String,
    /// Free-form string metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Payload, verbatim.
    pub data: Box<RawValue>,
}

/// Portable export of a stream: `{"events": [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportDocument {
    /// Envelopes in log order.
    pub events: Vec<JsonEnvelope>,
}

/// Per-call options for [`EventStore::store`](crate::EventStore::store).
///
/// Unset fields fall back to the current time and the acting subject.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Domain time; defaults to now.
    pub event_time: Option<i64>,
    /// Creator; defaults to the subject's id.
    pub created_by: Option<String>,
    /// Metadata stamped on the envelope.
    pub metadata: BTreeMap<String, String>,
}

impl StoreOptions {
    /// Set the domain time in milliseconds since the Unix epoch.
    pub fn with_event_time(mut self, millis: i64) -> Self {
        self.event_time = Some(millis);
        self
    }

    /// Override the creator.
    pub fn with_created_by(mut self, actor: impl Into<String>) -> Self {
        self.created_by = Some(actor.into());
        self
    }

    /// Replace the metadata map.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// A clock set before the epoch yields `0`.
pub fn now_millis() -> i64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{FirstnameUpdated, LastnameUpdated, PersonEvent};

    #[test]
    fn payload_type_names_inner_struct() {
        let event: PersonEvent = FirstnameUpdated {
            firstname: "John".into(),
        }
        .into();
        assert_eq!(event.payload_type(), PayloadType::of::<FirstnameUpdated>());
        assert_ne!(event.payload_type(), PayloadType::of::<LastnameUpdated>());
        assert!(event.payload_type().name.ends_with("FirstnameUpdated"));
    }

    #[test]
    fn to_json_serializes_inner_struct_only() {
        let event: PersonEvent = LastnameUpdated {
            lastname: "Doe".into(),
        }
        .into();
        assert_eq!(event.to_json().unwrap(), br#"{"lastname":"Doe"}"#);
    }

    #[test]
    fn json_envelope_preserves_raw_bytes() {
        let raw = br#"{"firstname":"John","extra":[1,2,3]}"#.to_vec();
        let envelope = Envelope {
            sequence: 3,
            key: SeqKey::new(3).unwrap(),
            discriminator: "FirstnameUpdated".into(),
            event_time: 1_000,
            created_by: "alice".into(),
            metadata: BTreeMap::new(),
            data: (),
            raw: raw.clone(),
        };

        let json = envelope.to_json_envelope().unwrap();
        assert_eq!(json.data.get().as_bytes(), raw.as_slice());

        let text = serde_json::to_string(&json).unwrap();
        assert!(!text.contains("metadata"), "empty metadata is omitted");
        let back: JsonEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.data.get().as_bytes(), raw.as_slice());
        assert_eq!(back.key, "000000000003");
    }

    #[test]
    fn export_document_shape() {
        let doc: ExportDocument = serde_json::from_str(r#"{"events": []}"#).unwrap();
        assert!(doc.events.is_empty());
        assert_eq!(serde_json::to_string(&doc).unwrap(), r#"{"events":[]}"#);
    }

    #[test]
    fn now_millis_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(now_millis() > 1_577_836_800_000);
    }
}
