//! Saga metadata: the correlation model of a saga type.
//!
//! Built once per saga from its declarations in the [`TypeCatalog`]:
//! - the saga data type, found by closing `Saga<TSagaData>` along the base chain
//! - correlation properties, from mappings and unique members of the data
//! - one finder per correlated message, property based or custom
//! - the messages the saga handles and which of them may start it

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::domain::SAGA_ID_PROPERTY;
use crate::error::ConfigurationError;

use super::types::{Conventions, TypeCatalog, TypeExpr, TypeKey};

/// A saga data property whose value identifies an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrelationProperty {
    pub name: String,
    pub type_name: String,
}

/// A message handled by a saga
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SagaMessage {
    pub message_type: String,
    pub is_allowed_to_start_saga: bool,
}

/// How an instance is located for a given message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SagaFinderDefinition {
    /// Look the instance up by a saga data property
    Property {
        message_type: String,
        message_property: String,
        saga_property: String,
    },

    /// Delegate to a user-supplied finder
    Custom { message_type: String, finder_type: String },
}

impl SagaFinderDefinition {
    pub fn message_type(&self) -> &str {
        match self {
            Self::Property { message_type, .. } | Self::Custom { message_type, .. } => message_type,
        }
    }
}

/// Immutable correlation model of one saga type
#[derive(Debug, Clone, Serialize)]
pub struct SagaMetadata {
    pub saga_type: String,
    pub entity_type: String,
    pub correlation_properties: Vec<CorrelationProperty>,
    pub associated_messages: Vec<SagaMessage>,
    pub finders: Vec<SagaFinderDefinition>,
}

impl SagaMetadata {
    /// Analyse `saga` and validate its declarations
    pub fn create(
        catalog: &TypeCatalog,
        saga: TypeKey,
        finder_types: &[TypeKey],
        conventions: &Conventions,
    ) -> Result<Self, ConfigurationError> {
        let wk = catalog.well_known();
        let saga_name = catalog
            .get(saga)
            .map(|t| t.name.clone())
            .ok_or_else(|| ConfigurationError::UnknownType {
                name: format!("{:?}", saga),
            })?;

        let entity = match catalog.closing_type_arguments(saga, wk.saga).as_deref() {
            Some([TypeExpr::Named { key, .. }]) => *key,
            _ => return Err(ConfigurationError::NotAGenericSaga { saga: saga_name }),
        };
        let entity_name = catalog.name(entity).to_string();

        let has_identity = catalog
            .find_member(entity, SAGA_ID_PROPERTY)
            .map(|m| m.ty == TypeExpr::from(wk.guid))
            .unwrap_or(false);
        if !has_identity {
            return Err(ConfigurationError::MissingSagaIdentity {
                saga: saga_name,
                entity: entity_name,
            });
        }

        let mut finders: Vec<SagaFinderDefinition> = Vec::new();
        let mut correlation_properties: Vec<CorrelationProperty> = Vec::new();
        let mut add_correlation = |name: &str, ty: &TypeExpr| {
            if name != SAGA_ID_PROPERTY && !correlation_properties.iter().any(|p| p.name == name) {
                correlation_properties.push(CorrelationProperty {
                    name: name.to_string(),
                    type_name: catalog.display(ty),
                });
            }
        };

        for mapping in catalog.saga_mappings(saga) {
            let message_name = catalog.name(mapping.message).to_string();

            let member = catalog
                .find_member(mapping.message, &mapping.message_property)
                .ok_or_else(|| ConfigurationError::UnknownMessageMember {
                    saga: saga_name.clone(),
                    message: message_name.clone(),
                    member: mapping.message_property.clone(),
                })?;

            let property = catalog
                .find_member(entity, &mapping.saga_property)
                .ok_or_else(|| ConfigurationError::UnknownSagaProperty {
                    saga: saga_name.clone(),
                    entity: entity_name.clone(),
                    property: mapping.saga_property.clone(),
                })?;

            if mapping.saga_property == SAGA_ID_PROPERTY && member.ty != TypeExpr::from(wk.guid) {
                return Err(ConfigurationError::NonGuidSagaIdMapping {
                    message: message_name,
                    member: member.name,
                    actual: catalog.display(&member.ty),
                });
            }

            if finders.iter().any(|f| f.message_type() == message_name) {
                return Err(ConfigurationError::DuplicateMessageMapping {
                    saga: saga_name,
                    message: message_name,
                });
            }

            add_correlation(&property.name, &property.ty);
            finders.push(SagaFinderDefinition::Property {
                message_type: message_name,
                message_property: mapping.message_property.clone(),
                saga_property: mapping.saga_property.clone(),
            });
        }

        for member in catalog.members(entity).iter().filter(|m| m.unique) {
            add_correlation(&member.name, &member.ty);
        }

        for &finder in finder_types {
            let finder_name = catalog.name(finder).to_string();

            for args in catalog.interface_arguments(finder, wk.find_sagas) {
                let [TypeExpr::Named { key: data, .. }, TypeExpr::Named { key: message, .. }] = args.as_slice() else {
                    continue;
                };
                if *data != entity {
                    continue;
                }

                let message_name = catalog.name(*message).to_string();
                if !conventions.is_message_type(catalog, *message) {
                    return Err(ConfigurationError::FinderForNonMessage {
                        message: message_name,
                        finder: finder_name,
                    });
                }

                match finders.iter().find(|f| f.message_type() == message_name) {
                    Some(SagaFinderDefinition::Property { .. }) => {
                        return Err(ConfigurationError::FinderConflictsWithMapping {
                            message: message_name,
                            finder: finder_name,
                        });
                    }
                    Some(SagaFinderDefinition::Custom { finder_type, .. }) => {
                        return Err(ConfigurationError::DuplicateFinder {
                            message: message_name,
                            first: finder_type.clone(),
                            second: finder_name,
                        });
                    }
                    None => finders.push(SagaFinderDefinition::Custom {
                        message_type: message_name,
                        finder_type: finder_name.clone(),
                    }),
                }
            }
        }

        let associated_messages = associated_messages(catalog, saga);

        debug!(
            saga = %saga_name,
            entity = %entity_name,
            correlation_properties = correlation_properties.len(),
            finders = finders.len(),
            "Saga metadata created"
        );

        Ok(Self {
            saga_type: saga_name,
            entity_type: entity_name,
            correlation_properties,
            associated_messages,
            finders,
        })
    }

    /// Finder for a message type, `None` when the saga cannot correlate it
    pub fn try_get_finder(&self, message_type: &str) -> Option<&SagaFinderDefinition> {
        self.finders.iter().find(|f| f.message_type() == message_type)
    }

    pub fn is_message_allowed_to_start_the_saga(&self, message_type: &str) -> bool {
        self.associated_messages
            .iter()
            .any(|m| m.message_type == message_type && m.is_allowed_to_start_saga)
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.associated_messages.iter().any(|m| m.message_type == message_type)
    }

    pub fn correlation_property_names(&self) -> Vec<&str> {
        self.correlation_properties.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Started-by messages first, then handled messages and timeouts
fn associated_messages(catalog: &TypeCatalog, saga: TypeKey) -> Vec<SagaMessage> {
    let wk = catalog.well_known();
    let message_names = |open: TypeKey| -> Vec<String> {
        catalog
            .interface_arguments(saga, open)
            .iter()
            .filter_map(|args| args.first().and_then(TypeExpr::key))
            .map(|key| catalog.name(key).to_string())
            .collect()
    };

    let starters = message_names(wk.started_by);
    let mut seen: HashSet<String> = HashSet::new();
    let mut messages = Vec::new();

    for name in starters
        .iter()
        .chain(message_names(wk.handles).iter())
        .chain(message_names(wk.handles_timeouts).iter())
    {
        if seen.insert(name.clone()) {
            messages.push(SagaMessage {
                message_type: name.clone(),
                is_allowed_to_start_saga: starters.contains(name),
            });
        }
    }

    messages
}

/// Metadata of every saga known to an endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct SagaMetadataCollection {
    sagas: Vec<Arc<SagaMetadata>>,
}

impl SagaMetadataCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build metadata for every saga type, failing on the first invalid one
    pub fn initialize(
        catalog: &TypeCatalog,
        sagas: &[TypeKey],
        finder_types: &[TypeKey],
        conventions: &Conventions,
    ) -> Result<Self, ConfigurationError> {
        let mut collection = Self::new();
        for &saga in sagas {
            collection.add(SagaMetadata::create(catalog, saga, finder_types, conventions)?);
        }
        Ok(collection)
    }

    pub fn add(&mut self, metadata: SagaMetadata) {
        self.sagas.push(Arc::new(metadata));
    }

    /// Metadata by saga type name
    pub fn find(&self, saga_type: &str) -> Option<Arc<SagaMetadata>> {
        self.sagas.iter().find(|m| m.saga_type == saga_type).cloned()
    }

    /// Metadata by saga data type name
    pub fn find_by_entity(&self, entity_type: &str) -> Option<Arc<SagaMetadata>> {
        self.sagas.iter().find(|m| m.entity_type == entity_type).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SagaMetadata>> {
        self.sagas.iter()
    }

    pub fn len(&self) -> usize {
        self.sagas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sagas.is_empty()
    }
}
