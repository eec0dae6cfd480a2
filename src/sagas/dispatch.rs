//! Invoking sagas from the handler stage.
//!
//! A [`SagaMessageHandler`] is registered for every message a saga handles.
//! For each message it finds or creates the instance, runs the user's
//! [`SagaHandler`] and writes the outcome back through the configured
//! [`SagaPersister`].

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::{HandlerContext, MessageHandler};
use crate::domain::{headers, LogicalMessage, SagaEntity, SAGA_ID_PROPERTY};

use super::finders::{find_saga, SagaFinderRegistry};
use super::metadata::{SagaFinderDefinition, SagaMetadata};
use super::persister::{SagaInstance, SagaPersister};

/// The saga instance a handler works on
#[derive(Debug)]
pub struct ActiveSaga {
    instance: SagaInstance,
    is_new: bool,
    completed: bool,
}

impl ActiveSaga {
    fn new(instance: SagaInstance, is_new: bool) -> Self {
        Self {
            instance,
            is_new,
            completed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.instance.id()
    }

    pub fn data(&self) -> &SagaEntity {
        &self.instance.entity
    }

    pub fn data_mut(&mut self) -> &mut SagaEntity {
        &mut self.instance.entity
    }

    /// True when the instance was created for the current message
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Finish the saga; its data is removed once the handler returns
    pub fn mark_as_complete(&mut self) {
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

/// User logic of a saga
#[async_trait]
pub trait SagaHandler: Send + Sync {
    async fn handle(
        &self,
        message: &LogicalMessage,
        saga: &mut ActiveSaga,
        context: &mut HandlerContext<'_>,
    ) -> Result<()>;
}

/// Message handler driving one saga type
pub struct SagaMessageHandler {
    metadata: Arc<SagaMetadata>,
    handler: Arc<dyn SagaHandler>,
    finders: Arc<SagaFinderRegistry>,
}

impl SagaMessageHandler {
    pub fn new(metadata: Arc<SagaMetadata>, handler: Arc<dyn SagaHandler>, finders: Arc<SagaFinderRegistry>) -> Self {
        Self {
            metadata,
            handler,
            finders,
        }
    }

    pub fn metadata(&self) -> &SagaMetadata {
        &self.metadata
    }

    /// Fresh instance for a message allowed to start the saga
    fn create_saga(
        &self,
        message: &LogicalMessage,
        finder: &SagaFinderDefinition,
        context: &HandlerContext<'_>,
    ) -> SagaInstance {
        let mut entity = SagaEntity::new(Uuid::new_v4(), self.metadata.entity_type.clone());
        entity.originator = context.header(headers::REPLY_TO_ADDRESS).map(str::to_string);
        entity.original_message_id = Some(context.message_id.to_string());

        if let SagaFinderDefinition::Property {
            message_property,
            saga_property,
            ..
        } = finder
        {
            if saga_property != SAGA_ID_PROPERTY {
                entity.set(saga_property.clone(), message.property(message_property));
            }
        }

        SagaInstance::new(entity)
    }
}

#[async_trait]
impl MessageHandler for SagaMessageHandler {
    fn name(&self) -> &str {
        &self.metadata.saga_type
    }

    async fn handle(&self, message: &LogicalMessage, context: &mut HandlerContext<'_>) -> Result<()> {
        let saga_type = &self.metadata.saga_type;
        let persister = context
            .components()
            .get::<Arc<dyn SagaPersister>>()
            .cloned()
            .ok_or_else(|| anyhow!("Saga {} requires a saga persister but none is registered", saga_type))?;

        let finder = self.metadata.try_get_finder(&message.message_type).ok_or_else(|| {
            anyhow!(
                "Message type {} is handled by saga {}, but the saga does not contain a property mapping or custom saga finder to map the message to saga data. Consider adding a mapping to the saga's how-to-find configuration",
                message.message_type,
                saga_type
            )
        })?;

        let found = find_saga(
            &self.metadata,
            finder,
            &self.finders,
            persister.as_ref(),
            message,
            &*context.extensions,
        )
        .await?;

        let mut saga = match found {
            Some(instance) => ActiveSaga::new(instance, false),
            None if self.metadata.is_message_allowed_to_start_the_saga(&message.message_type) => {
                ActiveSaga::new(self.create_saga(message, finder, context), true)
            }
            None => {
                info!(
                    saga = %saga_type,
                    message_type = %message.message_type,
                    "Could not find a saga instance for message and it is not allowed to start one, ignoring"
                );
                return Ok(());
            }
        };

        debug!(saga = %saga_type, saga_id = %saga.id(), is_new = saga.is_new, "Invoking saga");
        self.handler.handle(message, &mut saga, context).await?;

        let saga_id = saga.id();
        if saga.completed {
            if !saga.is_new {
                persister.complete(saga_id, &*context.extensions).await?;
            }
            info!(saga = %saga_type, %saga_id, "Saga completed");
        } else if saga.is_new {
            persister
                .save(&mut saga.instance, &*context.extensions)
                .await
                .with_context(|| format!("Failed to save saga {} ({})", saga_type, saga_id))?;
        } else {
            persister
                .update(&mut saga.instance, &*context.extensions)
                .await
                .with_context(|| format!("Failed to update saga {} ({})", saga_type, saga_id))?;
        }

        Ok(())
    }
}
