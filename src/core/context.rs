//! Per-message pipeline contexts.
//!
//! The value flowing through a pipeline is a [`PipelineContext`], a tagged
//! union over the stage-specific contexts. Behaviors work on one variant and
//! must hand the same variant to their continuation; only connectors turn
//! one variant into another.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{IncomingMessage, LogicalMessage, OutgoingMessage};

use super::components::ComponentRegistry;
use super::executor::PipelineError;
use super::handlers::MessageHandler;

/// Type-keyed extension bag carried by every context.
///
/// Values are reference counted so connectors can hand a copy to the child
/// context; writes made downstream never leak back to the parent.
#[derive(Clone, Default)]
pub struct ContextBag {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ContextBag {
    /// Create an empty bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous value of the same type
    pub fn set<T: Any + Send + Sync>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Get a value by type
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Check whether a value of the given type is present
    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }

    /// Remove a value by type
    pub fn remove<T: Any + Send + Sync>(&mut self) -> bool {
        self.values.remove(&TypeId::of::<T>()).is_some()
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for ContextBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextBag").field("values", &self.values.len()).finish()
    }
}

/// Identifies which context variant a stage works on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// Raw message as received by the transport
    TransportReceive,

    /// Physical message being processed
    IncomingPhysical,

    /// Deserialized logical message
    IncomingLogical,

    /// Logical message with its resolved handlers
    InvokeHandlers,

    /// Logical message being sent
    OutgoingLogical,

    /// Serialized message being dispatched
    OutgoingPhysical,
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TransportReceive => "transport-receive",
            Self::IncomingPhysical => "incoming-physical",
            Self::IncomingLogical => "incoming-logical",
            Self::InvokeHandlers => "invoke-handlers",
            Self::OutgoingLogical => "outgoing-logical",
            Self::OutgoingPhysical => "outgoing-physical",
        };
        f.write_str(name)
    }
}

/// Entry context handed over by the transport
#[derive(Debug)]
pub struct TransportReceiveContext {
    pub message: IncomingMessage,
    pub extensions: ContextBag,
    receive_operation_aborted: bool,
}

impl TransportReceiveContext {
    pub fn new(message: IncomingMessage) -> Self {
        Self {
            message,
            extensions: ContextBag::new(),
            receive_operation_aborted: false,
        }
    }

    /// Tell the transport to roll back the receive operation
    pub fn abort_receive_operation(&mut self) {
        self.receive_operation_aborted = true;
    }

    pub fn receive_operation_aborted(&self) -> bool {
        self.receive_operation_aborted
    }
}

/// Physical message context
#[derive(Debug)]
pub struct IncomingPhysicalMessageContext {
    pub message: IncomingMessage,
    pub extensions: ContextBag,
    receive_operation_aborted: bool,
}

impl IncomingPhysicalMessageContext {
    pub fn new(message: IncomingMessage, extensions: ContextBag) -> Self {
        Self {
            message,
            extensions,
            receive_operation_aborted: false,
        }
    }

    /// Abort processing and ask the transport to roll back. Behaviors calling
    /// this normally also skip their continuation.
    pub fn abort_receive_operation(&mut self) {
        self.receive_operation_aborted = true;
    }

    pub fn receive_operation_aborted(&self) -> bool {
        self.receive_operation_aborted
    }
}

/// Logical message context
#[derive(Debug)]
pub struct IncomingLogicalMessageContext {
    pub message: LogicalMessage,
    pub message_id: String,
    pub headers: HashMap<String, String>,
    pub extensions: ContextBag,
}

/// Context of the handler invocation stage
pub struct InvokeHandlersContext {
    pub message: LogicalMessage,
    pub message_id: String,
    pub headers: HashMap<String, String>,
    pub handlers: Vec<Arc<dyn MessageHandler>>,
    pub components: Arc<ComponentRegistry>,
    pub extensions: ContextBag,
}

impl fmt::Debug for InvokeHandlersContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokeHandlersContext")
            .field("message", &self.message)
            .field("message_id", &self.message_id)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Outgoing logical message context
#[derive(Debug)]
pub struct OutgoingLogicalMessageContext {
    pub message: LogicalMessage,
    pub message_id: String,
    pub headers: HashMap<String, String>,
    pub extensions: ContextBag,
}

impl OutgoingLogicalMessageContext {
    pub fn new(message: LogicalMessage) -> Self {
        Self {
            message,
            message_id: uuid::Uuid::new_v4().to_string(),
            headers: HashMap::new(),
            extensions: ContextBag::new(),
        }
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }
}

/// Outgoing physical message context
#[derive(Debug)]
pub struct OutgoingPhysicalMessageContext {
    pub message: OutgoingMessage,
    pub extensions: ContextBag,
}

/// The value flowing through a pipeline
#[derive(Debug)]
pub enum PipelineContext {
    TransportReceive(TransportReceiveContext),
    IncomingPhysical(IncomingPhysicalMessageContext),
    IncomingLogical(IncomingLogicalMessageContext),
    InvokeHandlers(InvokeHandlersContext),
    OutgoingLogical(OutgoingLogicalMessageContext),
    OutgoingPhysical(OutgoingPhysicalMessageContext),
}

macro_rules! context_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        /// Borrow the context as this variant, failing on any other variant
        pub fn $name(&mut self) -> Result<&mut $ty, PipelineError> {
            match self {
                Self::$variant(context) => Ok(context),
                other => Err(PipelineError::UnexpectedContext {
                    expected: ContextKind::$variant,
                    actual: other.kind(),
                }),
            }
        }
    };
}

impl PipelineContext {
    /// The variant tag
    pub fn kind(&self) -> ContextKind {
        match self {
            Self::TransportReceive(_) => ContextKind::TransportReceive,
            Self::IncomingPhysical(_) => ContextKind::IncomingPhysical,
            Self::IncomingLogical(_) => ContextKind::IncomingLogical,
            Self::InvokeHandlers(_) => ContextKind::InvokeHandlers,
            Self::OutgoingLogical(_) => ContextKind::OutgoingLogical,
            Self::OutgoingPhysical(_) => ContextKind::OutgoingPhysical,
        }
    }

    /// Extension bag of whichever variant this is
    pub fn extensions(&mut self) -> &mut ContextBag {
        match self {
            Self::TransportReceive(c) => &mut c.extensions,
            Self::IncomingPhysical(c) => &mut c.extensions,
            Self::IncomingLogical(c) => &mut c.extensions,
            Self::InvokeHandlers(c) => &mut c.extensions,
            Self::OutgoingLogical(c) => &mut c.extensions,
            Self::OutgoingPhysical(c) => &mut c.extensions,
        }
    }

    context_accessor!(as_transport_receive, TransportReceive, TransportReceiveContext);
    context_accessor!(as_incoming_physical, IncomingPhysical, IncomingPhysicalMessageContext);
    context_accessor!(as_incoming_logical, IncomingLogical, IncomingLogicalMessageContext);
    context_accessor!(as_invoke_handlers, InvokeHandlers, InvokeHandlersContext);
    context_accessor!(as_outgoing_logical, OutgoingLogical, OutgoingLogicalMessageContext);
    context_accessor!(as_outgoing_physical, OutgoingPhysical, OutgoingPhysicalMessageContext);
}
