//! Message mutators.
//!
//! Mutators get a chance to change messages as they pass through the
//! receive and send pipelines. They are registered as components before
//! the endpoint starts and picked up when the pipelines are built.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::{Behavior, ComponentRegistry, ContextKind, Next, PipelineContext};
use crate::domain::{IncomingMessage, LogicalMessage, OutgoingMessage};

/// Changes the raw message before it is deserialized
pub trait MutateIncomingTransportMessages: Send + Sync {
    fn mutate_incoming(&self, message: &mut IncomingMessage) -> Result<()>;
}

/// Changes the logical message before handlers are resolved
pub trait MutateIncomingMessages: Send + Sync {
    fn mutate_incoming(&self, message: &mut LogicalMessage, headers: &HashMap<String, String>) -> Result<()>;
}

/// Changes the logical message or its headers before serialization
pub trait MutateOutgoingMessages: Send + Sync {
    fn mutate_outgoing(&self, message: &mut LogicalMessage, headers: &mut HashMap<String, String>) -> Result<()>;
}

/// Changes the serialized message before dispatch
pub trait MutateOutgoingTransportMessages: Send + Sync {
    fn mutate_outgoing(&self, message: &mut OutgoingMessage) -> Result<()>;
}

/// Registered mutators, in registration order
#[derive(Default, Clone)]
pub struct MessageMutators {
    incoming_transport: Vec<Arc<dyn MutateIncomingTransportMessages>>,
    incoming: Vec<Arc<dyn MutateIncomingMessages>>,
    outgoing: Vec<Arc<dyn MutateOutgoingMessages>>,
    outgoing_transport: Vec<Arc<dyn MutateOutgoingTransportMessages>>,
}

impl MessageMutators {
    pub fn add_incoming_transport<M: MutateIncomingTransportMessages + 'static>(&mut self, mutator: M) -> &mut Self {
        self.incoming_transport.push(Arc::new(mutator));
        self
    }

    pub fn add_incoming<M: MutateIncomingMessages + 'static>(&mut self, mutator: M) -> &mut Self {
        self.incoming.push(Arc::new(mutator));
        self
    }

    pub fn add_outgoing<M: MutateOutgoingMessages + 'static>(&mut self, mutator: M) -> &mut Self {
        self.outgoing.push(Arc::new(mutator));
        self
    }

    pub fn add_outgoing_transport<M: MutateOutgoingTransportMessages + 'static>(&mut self, mutator: M) -> &mut Self {
        self.outgoing_transport.push(Arc::new(mutator));
        self
    }

    pub fn len(&self) -> usize {
        self.incoming_transport.len() + self.incoming.len() + self.outgoing.len() + self.outgoing_transport.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn from_components(components: &ComponentRegistry) -> Self {
        components.get::<MessageMutators>().cloned().unwrap_or_default()
    }
}

/// Runs the incoming transport mutators
pub struct MutateIncomingTransportMessageBehavior {
    mutators: Vec<Arc<dyn MutateIncomingTransportMessages>>,
}

impl MutateIncomingTransportMessageBehavior {
    pub fn from_components(components: &ComponentRegistry) -> Self {
        Self {
            mutators: MessageMutators::from_components(components).incoming_transport,
        }
    }
}

#[async_trait]
impl Behavior for MutateIncomingTransportMessageBehavior {
    fn stage(&self) -> ContextKind {
        ContextKind::IncomingPhysical
    }

    async fn invoke(&self, context: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let physical = context.as_incoming_physical()?;
        for mutator in &self.mutators {
            mutator.mutate_incoming(&mut physical.message)?;
        }
        next.run(context).await
    }
}

/// Runs the incoming logical mutators
pub struct MutateIncomingMessageBehavior {
    mutators: Vec<Arc<dyn MutateIncomingMessages>>,
}

impl MutateIncomingMessageBehavior {
    pub fn from_components(components: &ComponentRegistry) -> Self {
        Self {
            mutators: MessageMutators::from_components(components).incoming,
        }
    }
}

#[async_trait]
impl Behavior for MutateIncomingMessageBehavior {
    fn stage(&self) -> ContextKind {
        ContextKind::IncomingLogical
    }

    async fn invoke(&self, context: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let logical = context.as_incoming_logical()?;
        for mutator in &self.mutators {
            mutator.mutate_incoming(&mut logical.message, &logical.headers)?;
        }
        next.run(context).await
    }
}

/// Runs the outgoing logical mutators
pub struct MutateOutgoingMessageBehavior {
    mutators: Vec<Arc<dyn MutateOutgoingMessages>>,
}

impl MutateOutgoingMessageBehavior {
    pub fn from_components(components: &ComponentRegistry) -> Self {
        Self {
            mutators: MessageMutators::from_components(components).outgoing,
        }
    }
}

#[async_trait]
impl Behavior for MutateOutgoingMessageBehavior {
    fn stage(&self) -> ContextKind {
        ContextKind::OutgoingLogical
    }

    async fn invoke(&self, context: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let logical = context.as_outgoing_logical()?;
        for mutator in &self.mutators {
            mutator.mutate_outgoing(&mut logical.message, &mut logical.headers)?;
        }
        next.run(context).await
    }
}

/// Runs the outgoing transport mutators
pub struct MutateOutgoingTransportMessageBehavior {
    mutators: Vec<Arc<dyn MutateOutgoingTransportMessages>>,
}

impl MutateOutgoingTransportMessageBehavior {
    pub fn from_components(components: &ComponentRegistry) -> Self {
        Self {
            mutators: MessageMutators::from_components(components).outgoing_transport,
        }
    }
}

#[async_trait]
impl Behavior for MutateOutgoingTransportMessageBehavior {
    fn stage(&self) -> ContextKind {
        ContextKind::OutgoingPhysical
    }

    async fn invoke(&self, context: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        let physical = context.as_outgoing_physical()?;
        for mutator in &self.mutators {
            mutator.mutate_outgoing(&mut physical.message)?;
        }
        next.run(context).await
    }
}
