//! Entity caches for the Chime object model.
//!
//! One [`EntityCollection`] per entity kind (rooms, conversations, calls,
//! contacts) keeps the authoritative local copy of what the service knows.
//! Records arrive from full-list refreshes and individual push updates
//! alike; every arrival goes through [`EntityCollection::upsert`], which
//! parses, merges, and emits change events. Refresh passes stamp surviving
//! entities with a generation counter so that entities the service no
//! longer lists can be swept out afterwards.

pub mod entities;

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use chime_proto::record::ParseError;

/// Behavior an entity type needs to live in an [`EntityCollection`].
pub trait CachedEntity: Sized + Send {
    /// Entity kind name used in events and logs.
    const KIND: &'static str;
    /// REST endpoint listing all entities of this kind.
    const LIST_PATH: &'static str;
    /// Member of the list response carrying the record array.
    const ARRAY_KEY: &'static str;
    /// Push event kind carrying single-record updates.
    const ITEM_EVENT: &'static str;

    /// Parses a service record into this entity.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] for missing or malformed fields.
    fn parse(record: &Value) -> Result<Self, ParseError>;

    /// Stable identifier.
    fn id(&self) -> &str;

    /// Display name, for the name index.
    fn name(&self) -> &str;

    /// Folds a newer copy of the same entity into `self`, returning the
    /// names of the fields that actually changed.
    fn merge(&mut self, newer: Self) -> Vec<&'static str>;

    /// Refresh generation this entity was last confirmed in.
    fn generation(&self) -> u64;

    /// Stamps the entity with the given refresh generation.
    fn set_generation(&mut self, generation: u64);
}

/// Change notifications emitted by an [`EntityCollection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionEvent {
    /// An entity was seen for the first time.
    Created {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: String,
    },
    /// An existing entity changed one field.
    FieldChanged {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: String,
        /// Name of the field that changed.
        field: &'static str,
    },
    /// An entity disappeared from the service listing.
    Expired {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: String,
    },
}

/// The local cache for one entity kind.
pub struct EntityCollection<E: CachedEntity> {
    by_id: HashMap<String, E>,
    by_name: HashMap<String, String>,
    generation: u64,
    events: mpsc::Sender<CollectionEvent>,
}

impl<E: CachedEntity> EntityCollection<E> {
    /// Creates an empty collection reporting changes on `events`.
    #[must_use]
    pub fn new(events: mpsc::Sender<CollectionEvent>) -> Self {
        Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            generation: 0,
            events,
        }
    }

    /// Parses and folds one record into the cache.
    ///
    /// Parsing happens before any state is touched, so a malformed record
    /// leaves the cache exactly as it was. A first sighting emits one
    /// `Created` event; an update emits one `FieldChanged` per field that
    /// actually changed. Either way the entity ends up stamped with the
    /// current generation.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] when the record is malformed.
    pub fn upsert(&mut self, record: &Value) -> Result<&E, ParseError> {
        let mut parsed = E::parse(record)?;
        parsed.set_generation(self.generation);
        let id = parsed.id().to_string();

        match self.by_id.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                let old_name = slot.get().name().to_string();
                let changed = slot.get_mut().merge(parsed);
                slot.get_mut().set_generation(self.generation);
                let new_name = slot.get().name().to_string();
                if old_name != new_name {
                    if self.by_name.get(&old_name) == Some(&id) {
                        self.by_name.remove(&old_name);
                    }
                    self.by_name.insert(new_name, id.clone());
                }
                for field in changed {
                    let _ = self.events.try_send(CollectionEvent::FieldChanged {
                        kind: E::KIND,
                        id: id.clone(),
                        field,
                    });
                }
            }
            Entry::Vacant(slot) => {
                self.by_name.insert(parsed.name().to_string(), id.clone());
                slot.insert(parsed);
                let _ = self.events.try_send(CollectionEvent::Created {
                    kind: E::KIND,
                    id: id.clone(),
                });
            }
        }

        Ok(&self.by_id[&id])
    }

    /// Starts a new refresh generation. Entities not re-confirmed before
    /// the next [`expire_outdated`](Self::expire_outdated) sweep are stale.
    pub fn bump_generation(&mut self) {
        self.generation += 1;
    }

    /// Removes every entity whose generation predates the current one and
    /// returns them, emitting one `Expired` event each.
    pub fn expire_outdated(&mut self) -> Vec<E> {
        let current = self.generation;
        let stale: Vec<String> = self
            .by_id
            .iter()
            .filter(|(_, e)| e.generation() < current)
            .map(|(id, _)| id.clone())
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(entity) = self.by_id.remove(&id) {
                if self.by_name.get(entity.name()) == Some(&id) {
                    self.by_name.remove(entity.name());
                }
                debug!(kind = E::KIND, id = %id, "expiring entity absent from refresh");
                let _ = self.events.try_send(CollectionEvent::Expired {
                    kind: E::KIND,
                    id,
                });
                expired.push(entity);
            }
        }
        expired
    }

    /// Looks up an entity by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&E> {
        self.by_id.get(id)
    }

    /// Looks up an entity by display name.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&E> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    /// Iterates over all cached entities in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.by_id.values()
    }

    /// Number of cached entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
