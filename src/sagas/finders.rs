//! Locating saga instances for incoming messages.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::core::ContextBag;
use crate::domain::{LogicalMessage, SAGA_ID_PROPERTY};

use super::metadata::{SagaFinderDefinition, SagaMetadata};
use super::persister::{SagaInstance, SagaPersister};

/// User-supplied lookup for messages that cannot be correlated by a
/// single property
#[async_trait]
pub trait FindSagas: Send + Sync {
    async fn find_by(
        &self,
        persister: &dyn SagaPersister,
        message: &LogicalMessage,
        context: &ContextBag,
    ) -> Result<Option<SagaInstance>>;
}

/// Custom finder instances keyed by finder type name
#[derive(Clone, Default)]
pub struct SagaFinderRegistry {
    finders: HashMap<String, Arc<dyn FindSagas>>,
}

impl SagaFinderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, finder_type: impl Into<String>, finder: Arc<dyn FindSagas>) {
        self.finders.insert(finder_type.into(), finder);
    }

    pub fn get(&self, finder_type: &str) -> Option<Arc<dyn FindSagas>> {
        self.finders.get(finder_type).cloned()
    }
}

impl fmt::Debug for SagaFinderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.finders.keys().collect();
        names.sort();
        f.debug_struct("SagaFinderRegistry").field("finders", &names).finish()
    }
}

/// Run the finder `definition` for `message`
pub async fn find_saga(
    metadata: &SagaMetadata,
    definition: &SagaFinderDefinition,
    finders: &SagaFinderRegistry,
    persister: &dyn SagaPersister,
    message: &LogicalMessage,
    context: &ContextBag,
) -> Result<Option<SagaInstance>> {
    match definition {
        SagaFinderDefinition::Property {
            message_property,
            saga_property,
            ..
        } => {
            let value = message.property(message_property);
            if value.is_null() {
                bail!(
                    "Message {} mapped to saga {} has attempted to assign null to the correlation property {}. Correlation properties cannot be assigned null",
                    message.message_type,
                    metadata.saga_type,
                    saga_property
                );
            }

            if saga_property == SAGA_ID_PROPERTY {
                let saga_id = value
                    .as_str()
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| {
                        anyhow!(
                            "Message {} maps '{}' to the saga id but its value '{}' is not a Guid",
                            message.message_type,
                            message_property,
                            value
                        )
                    })?;
                return Ok(persister.get(&metadata.entity_type, saga_id, context).await?);
            }

            Ok(persister
                .get_by_property(&metadata.entity_type, saga_property, &value, context)
                .await?)
        }
        SagaFinderDefinition::Custom { finder_type, .. } => {
            let finder = finders
                .get(finder_type)
                .ok_or_else(|| anyhow!("Custom saga finder '{}' has not been registered", finder_type))?;
            finder.find_by(persister, message, context).await
        }
    }
}
