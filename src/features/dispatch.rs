//! The outgoing pipeline.
//!
//! outgoing-logical (mutators) → serialization connector →
//! outgoing-physical (transport mutators) → dispatch to the transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::core::{
    well_known_steps, Behavior, ComponentRegistry, Connector, ContextBag, ContextKind, Feature,
    FeatureConfigurationContext, FeatureDeclaration, Next, OutgoingPhysicalMessageContext, PipelineContext,
};
use crate::domain::{headers, OutgoingMessage, JSON_CONTENT_TYPE};

use super::mutators::{MutateOutgoingMessageBehavior, MutateOutgoingTransportMessageBehavior};

/// Connector id: outgoing-logical to outgoing-physical
pub const SERIALIZE_MESSAGE: &str = "SerializeMessageConnector";

/// Hands serialized messages to a transport
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    async fn dispatch(&self, message: OutgoingMessage, extensions: &ContextBag) -> Result<()>;
}

/// Dispatcher keeping every message in memory
#[derive(Default)]
pub struct InMemoryDispatcher {
    sent: Mutex<Vec<OutgoingMessage>>,
}

impl InMemoryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages dispatched so far
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.lock().clone()
    }

    /// Remove and return the dispatched messages
    pub fn take(&self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OutgoingMessage>> {
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MessageDispatcher for InMemoryDispatcher {
    async fn dispatch(&self, message: OutgoingMessage, _extensions: &ContextBag) -> Result<()> {
        self.lock().push(message);
        Ok(())
    }
}

/// Serializes the logical message body as JSON
pub struct SerializeMessageConnector;

#[async_trait]
impl Connector for SerializeMessageConnector {
    fn input_kind(&self) -> ContextKind {
        ContextKind::OutgoingLogical
    }

    fn output_kind(&self) -> ContextKind {
        ContextKind::OutgoingPhysical
    }

    async fn invoke(&self, context: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let logical = context.as_outgoing_logical()?;

        let body = serde_json::to_vec(&logical.message.body)
            .with_context(|| format!("Failed to serialize message of type {}", logical.message.message_type))?;

        let mut message_headers: HashMap<String, String> = logical.headers.clone();
        message_headers.insert(headers::MESSAGE_ID.to_string(), logical.message_id.clone());
        message_headers.insert(
            headers::ENCLOSED_MESSAGE_TYPES.to_string(),
            logical.message.message_type.clone(),
        );
        message_headers.insert(headers::CONTENT_TYPE.to_string(), JSON_CONTENT_TYPE.to_string());

        let mut physical = PipelineContext::OutgoingPhysical(OutgoingPhysicalMessageContext {
            message: OutgoingMessage {
                message_id: logical.message_id.clone(),
                headers: message_headers,
                body,
            },
            extensions: logical.extensions.clone(),
        });

        next.run(&mut physical).await
    }
}

/// Last step of the outgoing pipeline
pub struct DispatchToTransport {
    dispatcher: Arc<dyn MessageDispatcher>,
}

impl DispatchToTransport {
    pub fn new(dispatcher: Arc<dyn MessageDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Behavior for DispatchToTransport {
    fn stage(&self) -> ContextKind {
        ContextKind::OutgoingPhysical
    }

    async fn invoke(&self, context: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        {
            let physical = context.as_outgoing_physical()?;
            debug!(message_id = %physical.message.message_id, "Dispatching message");
            self.dispatcher
                .dispatch(physical.message.clone(), &physical.extensions)
                .await?;
        }
        next.run(context).await
    }
}

/// Outgoing pipeline wiring
pub struct DispatchFeature;

impl Feature for DispatchFeature {
    fn declare(&self, feature: &mut FeatureDeclaration) {
        feature.enable_by_default().prerequisite(
            |context| context.components.contains::<Arc<dyn MessageDispatcher>>(),
            "A message dispatcher has been registered",
        );
    }

    fn setup(&self, context: &mut FeatureConfigurationContext<'_>) -> Result<()> {
        let pipeline = &mut *context.pipeline;

        pipeline.register_factory(
            well_known_steps::MUTATE_OUTGOING_MESSAGES,
            ContextKind::OutgoingLogical,
            "Executes the outgoing logical message mutators",
            |components| Ok(Arc::new(MutateOutgoingMessageBehavior::from_components(components)) as Arc<dyn Behavior>),
        )?;
        pipeline.register_connector(
            SERIALIZE_MESSAGE,
            SerializeMessageConnector,
            "Converts a logical message into a physical message",
        )?;

        pipeline.register_factory(
            well_known_steps::MUTATE_OUTGOING_TRANSPORT_MESSAGE,
            ContextKind::OutgoingPhysical,
            "Executes the outgoing transport message mutators",
            |components| {
                Ok(Arc::new(MutateOutgoingTransportMessageBehavior::from_components(components)) as Arc<dyn Behavior>)
            },
        )?;
        pipeline.register_factory(
            well_known_steps::DISPATCH_TO_TRANSPORT,
            ContextKind::OutgoingPhysical,
            "Hands the message to the transport",
            dispatch_factory,
        )?;

        Ok(())
    }
}

fn dispatch_factory(components: &ComponentRegistry) -> Result<Arc<dyn Behavior>> {
    let dispatcher = components
        .get::<Arc<dyn MessageDispatcher>>()
        .cloned()
        .ok_or_else(|| anyhow!("No message dispatcher registered"))?;

    Ok(Arc::new(DispatchToTransport::new(dispatcher)))
}
