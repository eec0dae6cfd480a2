//! Message handlers and the handler invocation terminator.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::domain::LogicalMessage;

use super::components::ComponentRegistry;
use super::context::{ContextBag, ContextKind, PipelineContext};
use super::executor::{Behavior, Next};

/// User code reacting to a logical message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, message: &LogicalMessage, context: &mut HandlerContext<'_>) -> Result<()>;
}

/// What a handler sees of the message being processed
pub struct HandlerContext<'a> {
    pub message_id: &'a str,
    pub headers: &'a HashMap<String, String>,
    pub extensions: &'a mut ContextBag,
    components: &'a ComponentRegistry,
    stop_dispatching: bool,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        message_id: &'a str,
        headers: &'a HashMap<String, String>,
        extensions: &'a mut ContextBag,
        components: &'a ComponentRegistry,
    ) -> Self {
        Self {
            message_id,
            headers,
            extensions,
            components,
            stop_dispatching: false,
        }
    }

    /// Skip the remaining handlers for the current message
    pub fn do_not_continue_dispatching_current_message_to_handlers(&mut self) {
        self.stop_dispatching = true;
    }

    pub fn handler_invocation_aborted(&self) -> bool {
        self.stop_dispatching
    }

    /// Components registered during endpoint configuration
    pub fn components(&self) -> &ComponentRegistry {
        self.components
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Handlers keyed by message type name, in registration order
#[derive(Default, Clone)]
pub struct MessageHandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn MessageHandler>>>,
}

impl MessageHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers.entry(message_type.into()).or_default().push(handler);
    }

    pub fn handlers_for(&self, message_type: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers.get(message_type).cloned().unwrap_or_default()
    }

    /// Message types with at least one handler, sorted
    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Last step of the receive pipeline: awaits each handler in turn
pub struct InvokeHandlersTerminator;

#[async_trait]
impl Behavior for InvokeHandlersTerminator {
    fn stage(&self) -> ContextKind {
        ContextKind::InvokeHandlers
    }

    async fn invoke(&self, context: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        {
            let invoke = context.as_invoke_handlers()?;
            let handlers = invoke.handlers.clone();
            let components = invoke.components.clone();
            let mut handler_context =
                HandlerContext::new(&invoke.message_id, &invoke.headers, &mut invoke.extensions, &components);

            for handler in handlers {
                debug!(handler = %handler.name(), message_type = %invoke.message.message_type, "Invoking handler");
                handler.handle(&invoke.message, &mut handler_context).await?;

                if handler_context.handler_invocation_aborted() {
                    debug!(message_id = %invoke.message_id, "Handler requested to stop dispatching");
                    break;
                }
            }
        }

        next.run(context).await
    }
}
