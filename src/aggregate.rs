//! Aggregate trait and the fold helper used by replay and import.

use crate::command::Context;
use crate::error::HandleError;
use crate::event::{Envelope, EventPayload};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state. State is
/// built by applying stored envelopes through [`evolve`](Aggregate::evolve),
/// starting from `Default::default()`.
///
/// # Associated Types
///
/// - `Event`: the closed set of events this aggregate produces and applies.
/// - `Error`: command rejection and evolve failure type.
///
/// # Contract
///
/// - [`evolve`](Aggregate::evolve) mutates in place and must be
///   deterministic: replaying the same events from the default value always
///   yields an equal aggregate.
/// - `Clone` is a deep copy. A clone must not share mutable memory with the
///   original (no `Arc<Mutex<_>>` fields), because readers receive clones
///   while the cached original keeps evolving.
pub trait Aggregate: Default + Clone + Send + 'static {
    /// Identifies this aggregate type (e.g. "person"). Used as the resource
    /// name for resource-scoped audits.
    const AGGREGATE_TYPE: &'static str;

    /// The set of events this aggregate can produce and apply.
    type Event: EventPayload;

    /// Command rejection / evolve failure type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Apply one stored event.
    ///
    /// # Errors
    ///
    /// Returns `Self::Error` if the event cannot be applied. The handler
    /// then discards the cached state and replays on next access.
    fn evolve(&mut self, ctx: &Context, event: &Envelope<Self::Event>) -> Result<(), Self::Error>;
}

/// Fold `events` in order onto a fresh default aggregate.
///
/// # Errors
///
/// Returns [`HandleError::Evolve`] naming the first event that failed.
pub fn fold<'a, A, I>(ctx: &Context, events: I) -> Result<A, HandleError<A::Error>>
where
    A: Aggregate,
    I: IntoIterator<Item = &'a Envelope<A::Event>>,
{
    let mut aggregate = A::default();
    for event in events {
        aggregate
            .evolve(ctx, event)
            .map_err(|source| HandleError::Evolve {
                sequence: event.sequence,
                source,
            })?;
    }
    Ok(aggregate)
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::{FirstnameUpdated, LastnameUpdated, Person, PersonError, PersonEvent};
    use super::*;
    use crate::event::EventPayload;
    use crate::keys::SeqKey;
    use std::collections::BTreeMap;

    fn envelope(sequence: u64, data: PersonEvent) -> Envelope<PersonEvent> {
        Envelope {
            sequence,
            key: SeqKey::new(sequence).unwrap(),
            discriminator: String::new(),
            event_time: 0,
            created_by: "test".into(),
            metadata: BTreeMap::new(),
            raw: data.to_json().unwrap(),
            data,
        }
    }

    #[test]
    fn evolve_applies_in_place() {
        let mut person = Person::default();
        let event = envelope(1, FirstnameUpdated { firstname: "John".into() }.into());
        person.evolve(&Context::default(), &event).unwrap();
        assert_eq!(person.firstname, "John");
        assert_eq!(person.updates, 1);
    }

    #[test]
    fn fold_applies_in_order() {
        let events = vec![
            envelope(1, FirstnameUpdated { firstname: "John".into() }.into()),
            envelope(2, LastnameUpdated { lastname: "Doe".into() }.into()),
            envelope(3, FirstnameUpdated { firstname: "Jane".into() }.into()),
        ];
        let person: Person = fold(&Context::default(), &events).unwrap();
        assert_eq!(person.firstname, "Jane");
        assert_eq!(person.lastname, "Doe");
        assert_eq!(person.updates, 3);
    }

    #[test]
    fn fold_reports_failing_sequence() {
        let events = vec![
            envelope(1, FirstnameUpdated { firstname: "John".into() }.into()),
            envelope(2, super::test_fixtures::Corrupted { reason: "x".into() }.into()),
        ];
        let err = fold::<Person, _>(&Context::default(), &events).unwrap_err();
        assert!(
            matches!(err, HandleError::Evolve { sequence: 2, source: PersonError::Corrupted(_) }),
            "got {err:?}"
        );
    }
}
