//! The receive pipeline.
//!
//! Stages, in order:
//! - transport-receive: entry point, connects to the physical stage and
//!   reports aborts back to the transport
//! - incoming-physical: unit of work, transport mutators, deserialization
//! - incoming-logical: message mutators, handler resolution
//! - invoke-handlers: sequential handler invocation

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::core::{
    well_known_steps, Behavior, ComponentRegistry, Connector, ContextBag, ContextKind, Feature,
    FeatureConfigurationContext, FeatureDeclaration, IncomingLogicalMessageContext, IncomingPhysicalMessageContext,
    InvokeHandlersContext, InvokeHandlersTerminator, MessageHandlerRegistry, Next, PipelineContext,
};
use crate::domain::{headers, LogicalMessage, JSON_CONTENT_TYPE};

use super::mutators::{MutateIncomingMessageBehavior, MutateIncomingTransportMessageBehavior};

/// Connector id: transport-receive to incoming-physical
pub const TRANSPORT_RECEIVE_TO_PHYSICAL: &str = "TransportReceiveToPhysicalMessageProcessingConnector";

/// Connector id: incoming-physical to incoming-logical
pub const DESERIALIZE_LOGICAL_MESSAGES: &str = "DeserializeLogicalMessagesConnector";

/// Connector id: incoming-logical to invoke-handlers
pub const LOAD_HANDLERS: &str = "LoadHandlersConnector";

/// Wraps the processing of one message
#[async_trait]
pub trait ManageUnitsOfWork: Send + Sync {
    async fn begin(&self, extensions: &ContextBag) -> Result<()>;

    /// Called for every manager whose `begin` succeeded, in reverse order,
    /// with the processing error if there was one
    async fn end(&self, error: Option<&anyhow::Error>, extensions: &ContextBag) -> Result<()>;
}

/// Registered unit of work managers, in registration order
#[derive(Default, Clone)]
pub struct UnitOfWorkManagers {
    managers: Vec<Arc<dyn ManageUnitsOfWork>>,
}

impl UnitOfWorkManagers {
    pub fn add<M: ManageUnitsOfWork + 'static>(&mut self, manager: M) -> &mut Self {
        self.managers.push(Arc::new(manager));
        self
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}

/// Begins every unit of work before the rest of the chain and ends them
/// afterwards
pub struct ExecuteUnitOfWork {
    managers: Vec<Arc<dyn ManageUnitsOfWork>>,
}

impl ExecuteUnitOfWork {
    pub fn from_components(components: &ComponentRegistry) -> Self {
        Self {
            managers: components
                .get::<UnitOfWorkManagers>()
                .map(|m| m.managers.clone())
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Behavior for ExecuteUnitOfWork {
    fn stage(&self) -> ContextKind {
        ContextKind::IncomingPhysical
    }

    async fn invoke(&self, context: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let extensions = context.extensions().clone();
        let mut started = 0;
        let mut result = Ok(());

        for manager in &self.managers {
            let begun = manager.begin(&extensions).await;
            if let Err(e) = begun {
                result = Err(e);
                break;
            }
            started += 1;
        }

        if result.is_ok() {
            result = next.run(context).await;
        }

        for manager in self.managers[..started].iter().rev() {
            let ended = manager.end(result.as_ref().err(), &extensions).await;
            match ended {
                Err(e) if result.is_ok() => result = Err(e.context("Failed to end unit of work")),
                Err(e) => warn!(error = %e, "Unit of work failed to end after a processing error"),
                Ok(()) => {}
            }
        }

        result
    }
}

/// Hands the transport message to the physical stage and propagates an
/// abort request back
pub struct TransportReceiveToPhysicalConnector;

#[async_trait]
impl Connector for TransportReceiveToPhysicalConnector {
    fn input_kind(&self) -> ContextKind {
        ContextKind::TransportReceive
    }

    fn output_kind(&self) -> ContextKind {
        ContextKind::IncomingPhysical
    }

    async fn invoke(&self, context: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let transport = context.as_transport_receive()?;
        let mut physical = PipelineContext::IncomingPhysical(IncomingPhysicalMessageContext::new(
            transport.message.clone(),
            transport.extensions.clone(),
        ));

        next.run(&mut physical).await?;

        if physical.as_incoming_physical()?.receive_operation_aborted() {
            debug!(message_id = %transport.message.message_id, "Receive operation aborted");
            transport.abort_receive_operation();
        }
        Ok(())
    }
}

/// Deserializes the JSON body into a logical message
pub struct DeserializeLogicalMessagesConnector;

#[async_trait]
impl Connector for DeserializeLogicalMessagesConnector {
    fn input_kind(&self) -> ContextKind {
        ContextKind::IncomingPhysical
    }

    fn output_kind(&self) -> ContextKind {
        ContextKind::IncomingLogical
    }

    async fn invoke(&self, context: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let physical = context.as_incoming_physical()?;
        let message = &physical.message;

        let Some(message_type) = message.enclosed_message_type() else {
            if message.body.is_empty() {
                debug!(message_id = %message.message_id, "Control message without a body, nothing to deserialize");
                return Ok(());
            }
            bail!(
                "Message {} does not declare its type in the {} header",
                message.message_id,
                headers::ENCLOSED_MESSAGE_TYPES
            );
        };

        if let Some(content_type) = message.header(headers::CONTENT_TYPE) {
            if content_type != JSON_CONTENT_TYPE {
                bail!(
                    "Message {} has content type '{}', only '{}' can be deserialized",
                    message.message_id,
                    content_type,
                    JSON_CONTENT_TYPE
                );
            }
        }

        let body = if message.body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&message.body)
                .with_context(|| format!("Failed to deserialize message {}", message.message_id))?
        };

        let mut logical = PipelineContext::IncomingLogical(IncomingLogicalMessageContext {
            message: LogicalMessage::new(message_type, body),
            message_id: message.message_id.clone(),
            headers: message.headers.clone(),
            extensions: physical.extensions.clone(),
        });

        next.run(&mut logical).await
    }
}

/// Resolves the handlers for the logical message type
pub struct LoadHandlersConnector;

#[async_trait]
impl Connector for LoadHandlersConnector {
    fn input_kind(&self) -> ContextKind {
        ContextKind::IncomingLogical
    }

    fn output_kind(&self) -> ContextKind {
        ContextKind::InvokeHandlers
    }

    async fn invoke(&self, context: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let logical = context.as_incoming_logical()?;
        let components = logical
            .extensions
            .get::<Arc<ComponentRegistry>>()
            .cloned()
            .ok_or_else(|| anyhow!("No component registry available to resolve message handlers"))?;

        let handlers = components
            .get::<MessageHandlerRegistry>()
            .map(|registry| registry.handlers_for(&logical.message.message_type))
            .unwrap_or_default();

        if handlers.is_empty() {
            bail!("No handlers could be found for message type: {}", logical.message.message_type);
        }

        let mut invoke = PipelineContext::InvokeHandlers(InvokeHandlersContext {
            message: logical.message.clone(),
            message_id: logical.message_id.clone(),
            headers: logical.headers.clone(),
            handlers,
            components,
            extensions: logical.extensions.clone(),
        });

        next.run(&mut invoke).await
    }
}

/// Receive pipeline wiring
pub struct ReceiveFeature;

impl Feature for ReceiveFeature {
    fn declare(&self, feature: &mut FeatureDeclaration) {
        feature.enable_by_default();
    }

    fn setup(&self, context: &mut FeatureConfigurationContext<'_>) -> Result<()> {
        context.components.get_or_insert_default::<MessageHandlerRegistry>();

        let pipeline = &mut *context.pipeline;
        pipeline.register_connector(
            TRANSPORT_RECEIVE_TO_PHYSICAL,
            TransportReceiveToPhysicalConnector,
            "Allows to abort processing the message",
        )?;

        pipeline.register_factory(
            well_known_steps::EXECUTE_UNIT_OF_WORK,
            ContextKind::IncomingPhysical,
            "Executes the unit of work managers around message processing",
            |components| Ok(Arc::new(ExecuteUnitOfWork::from_components(components)) as Arc<dyn Behavior>),
        )?;
        pipeline.register_factory(
            well_known_steps::MUTATE_INCOMING_TRANSPORT_MESSAGE,
            ContextKind::IncomingPhysical,
            "Executes the incoming transport message mutators",
            |components| {
                Ok(Arc::new(MutateIncomingTransportMessageBehavior::from_components(components)) as Arc<dyn Behavior>)
            },
        )?;
        pipeline.register_connector(
            DESERIALIZE_LOGICAL_MESSAGES,
            DeserializeLogicalMessagesConnector,
            "Deserializes the physical message body into a logical message",
        )?;

        pipeline.register_factory(
            well_known_steps::MUTATE_INCOMING_MESSAGES,
            ContextKind::IncomingLogical,
            "Executes the incoming logical message mutators",
            |components| Ok(Arc::new(MutateIncomingMessageBehavior::from_components(components)) as Arc<dyn Behavior>),
        )?;
        pipeline.register_connector(
            LOAD_HANDLERS,
            LoadHandlersConnector,
            "Resolves the handlers for the logical message",
        )?;

        pipeline.register(
            well_known_steps::INVOKE_HANDLERS,
            InvokeHandlersTerminator,
            "Calls the handlers for the message",
        )?;

        Ok(())
    }
}
