//! Saga persistence.
//!
//! [`SagaPersister`] is the storage contract used by saga dispatch.
//! [`InMemorySagaPersister`] is the reference implementation:
//! - entities are stored by id in a sharded concurrent map
//! - correlation properties must be non-null and unique per saga data type
//! - every read hands out a [`SagaInstance`] carrying the version it saw,
//!   and writes made with a stale copy are rejected

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::core::ContextBag;
use crate::domain::{SagaEntity, SAGA_ID_PROPERTY};

use super::metadata::SagaMetadataCollection;

/// Errors surfaced by saga storage
#[derive(Debug, Error)]
pub enum SagaPersistenceError {
    #[error("Cannot store saga with id '{saga_id}'. The saga with id '{existing_id}' already has property '{property}' with the same value")]
    DuplicateCorrelation {
        saga_id: Uuid,
        existing_id: Uuid,
        property: String,
    },

    #[error("Cannot store saga with id '{saga_id}' since the unique property '{property}' has a null value")]
    MissingCorrelationValue { saga_id: Uuid, property: String },

    #[error("Concurrency violation: saga entity '{saga_id}' was changed since it was read")]
    ConcurrencyViolation { saga_id: Uuid },

    #[error("Saga store in an inconsistent state: entity '{saga_id}' was not read before being updated")]
    InconsistentState { saga_id: Uuid },

    #[error("No saga is registered for saga data type '{entity_type}'")]
    UnknownSagaEntity { entity_type: String },
}

/// A saga entity together with the version it was read at.
///
/// Instances returned by a persister carry a read stamp; instances built by
/// hand do not, and can only be saved as new.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaInstance {
    pub entity: SagaEntity,
    read_version: Option<u64>,
}

impl SagaInstance {
    /// A new, never stored instance
    pub fn new(entity: SagaEntity) -> Self {
        Self {
            entity,
            read_version: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.entity.id
    }

    /// Version of the store this copy was read at
    pub fn read_version(&self) -> Option<u64> {
        self.read_version
    }

    pub fn into_entity(self) -> SagaEntity {
        self.entity
    }
}

/// Storage contract for saga instances.
///
/// The context bag is where real backends find ambient transactions; the
/// in-memory store ignores it.
#[async_trait]
pub trait SagaPersister: Send + Sync {
    /// Store an instance. On success the instance is stamped with the new
    /// version so it can be written again.
    async fn save(&self, saga: &mut SagaInstance, context: &ContextBag) -> Result<(), SagaPersistenceError>;

    /// Store an instance previously obtained from this persister
    async fn update(&self, saga: &mut SagaInstance, context: &ContextBag) -> Result<(), SagaPersistenceError>;

    async fn get(
        &self,
        entity_type: &str,
        saga_id: Uuid,
        context: &ContextBag,
    ) -> Result<Option<SagaInstance>, SagaPersistenceError>;

    /// First instance of `entity_type` whose `property` equals `value`.
    /// A null `value` matches instances whose property is null.
    async fn get_by_property(
        &self,
        entity_type: &str,
        property: &str,
        value: &Value,
        context: &ContextBag,
    ) -> Result<Option<SagaInstance>, SagaPersistenceError>;

    /// Remove an instance; removing an unknown id is not an error
    async fn complete(&self, saga_id: Uuid, context: &ContextBag) -> Result<(), SagaPersistenceError>;
}

#[derive(Debug, Clone)]
struct StoredSaga {
    entity: SagaEntity,
    version: u64,
}

/// Reference in-memory saga store
#[derive(Debug)]
pub struct InMemorySagaPersister {
    metadata: Arc<SagaMetadataCollection>,
    sagas: DashMap<Uuid, StoredSaga>,
    version: AtomicU64,
}

impl InMemorySagaPersister {
    pub fn new(metadata: Arc<SagaMetadataCollection>) -> Self {
        Self {
            metadata,
            sagas: DashMap::new(),
            version: AtomicU64::new(0),
        }
    }

    /// Number of stored instances
    pub fn len(&self) -> usize {
        self.sagas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sagas.is_empty()
    }

    /// Current value of the global write counter
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Correlation values must be set and must not collide with another
    /// instance of the same type. Linear in the number of stored sagas.
    fn validate_unique_properties(&self, entity: &SagaEntity) -> Result<(), SagaPersistenceError> {
        let metadata =
            self.metadata
                .find_by_entity(&entity.entity_type)
                .ok_or_else(|| SagaPersistenceError::UnknownSagaEntity {
                    entity_type: entity.entity_type.clone(),
                })?;

        for property in &metadata.correlation_properties {
            let incoming = entity.get(&property.name);
            if incoming.is_null() {
                return Err(SagaPersistenceError::MissingCorrelationValue {
                    saga_id: entity.id,
                    property: property.name.clone(),
                });
            }

            let collision = self.sagas.iter().find(|stored| {
                *stored.key() != entity.id
                    && stored.entity.entity_type == entity.entity_type
                    && stored.entity.get(&property.name) == incoming
            });

            if let Some(stored) = collision {
                return Err(SagaPersistenceError::DuplicateCorrelation {
                    saga_id: entity.id,
                    existing_id: *stored.key(),
                    property: property.name.clone(),
                });
            }
        }

        Ok(())
    }

    fn write(&self, saga: &mut SagaInstance, require_read: bool) -> Result<(), SagaPersistenceError> {
        let saga_id = saga.id();
        if require_read && saga.read_version.is_none() {
            return Err(SagaPersistenceError::InconsistentState { saga_id });
        }

        // Runs outside the entry lock: two different ids saving the same
        // correlation value at the same time can both pass.
        self.validate_unique_properties(&saga.entity)?;

        // Copy before taking the entry lock.
        let entity = saga.entity.clone();

        let version = match self.sagas.entry(saga_id) {
            Entry::Occupied(mut occupied) => {
                if let Some(read) = saga.read_version {
                    if occupied.get().version != read {
                        return Err(SagaPersistenceError::ConcurrencyViolation { saga_id });
                    }
                }
                let version = self.next_version();
                occupied.insert(StoredSaga { entity, version });
                version
            }
            Entry::Vacant(vacant) => {
                // Read earlier but completed since.
                if saga.read_version.is_some() {
                    return Err(SagaPersistenceError::ConcurrencyViolation { saga_id });
                }
                let version = self.next_version();
                vacant.insert(StoredSaga { entity, version });
                version
            }
        };

        saga.read_version = Some(version);
        debug!(%saga_id, version, "Saga stored");
        Ok(())
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl SagaPersister for InMemorySagaPersister {
    #[instrument(skip(self, saga, _context), fields(saga_id = %saga.id()))]
    async fn save(&self, saga: &mut SagaInstance, _context: &ContextBag) -> Result<(), SagaPersistenceError> {
        self.write(saga, false)
    }

    #[instrument(skip(self, saga, _context), fields(saga_id = %saga.id()))]
    async fn update(&self, saga: &mut SagaInstance, _context: &ContextBag) -> Result<(), SagaPersistenceError> {
        self.write(saga, true)
    }

    async fn get(
        &self,
        entity_type: &str,
        saga_id: Uuid,
        _context: &ContextBag,
    ) -> Result<Option<SagaInstance>, SagaPersistenceError> {
        let found = self
            .sagas
            .get(&saga_id)
            .filter(|stored| stored.entity.entity_type == entity_type)
            .map(|stored| stored.value().clone());

        Ok(found.map(|stored| SagaInstance {
            entity: stored.entity,
            read_version: Some(stored.version),
        }))
    }

    async fn get_by_property(
        &self,
        entity_type: &str,
        property: &str,
        value: &Value,
        context: &ContextBag,
    ) -> Result<Option<SagaInstance>, SagaPersistenceError> {
        if property == SAGA_ID_PROPERTY {
            return match value.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                Some(saga_id) => self.get(entity_type, saga_id, context).await,
                None => Ok(None),
            };
        }

        // Entities that never carried the property do not match, not even a null value.
        let found = self
            .sagas
            .iter()
            .find(|stored| {
                stored.entity.entity_type == entity_type && stored.entity.try_get(property).as_ref() == Some(value)
            })
            .map(|stored| stored.value().clone());

        Ok(found.map(|stored| SagaInstance {
            entity: stored.entity,
            read_version: Some(stored.version),
        }))
    }

    async fn complete(&self, saga_id: Uuid, _context: &ContextBag) -> Result<(), SagaPersistenceError> {
        if self.sagas.remove(&saga_id).is_some() {
            debug!(%saga_id, "Saga completed");
        }
        Ok(())
    }
}
