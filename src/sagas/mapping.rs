//! Fluent message-to-saga mapping surface.
//!
//! ```ignore
//! mapper.configure_mapping(start_order, "OrderId").to_saga("OrderId");
//! ```

use serde::Serialize;

use super::types::TypeKey;

/// A message property correlated to a saga data property
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageMapping {
    pub message: TypeKey,
    pub message_property: String,
    pub saga_property: String,
}

/// Collects mappings while a saga describes how to find its instances
#[derive(Debug, Default)]
pub struct SagaMapper {
    mappings: Vec<MessageMapping>,
}

impl SagaMapper {
    /// Start mapping `message_property` of `message`. Nothing is recorded
    /// until [`ToSagaExpression::to_saga`] is called.
    pub fn configure_mapping(&mut self, message: TypeKey, message_property: impl Into<String>) -> ToSagaExpression<'_> {
        ToSagaExpression {
            mapper: self,
            message,
            message_property: message_property.into(),
        }
    }

    pub fn into_mappings(self) -> Vec<MessageMapping> {
        self.mappings
    }
}

/// Second half of a mapping declaration
#[must_use = "a mapping is only recorded once `to_saga` is called"]
pub struct ToSagaExpression<'a> {
    mapper: &'a mut SagaMapper,
    message: TypeKey,
    message_property: String,
}

impl ToSagaExpression<'_> {
    /// Name the saga data property the message property correlates to
    pub fn to_saga(self, saga_property: impl Into<String>) {
        self.mapper.mappings.push(MessageMapping {
            message: self.message,
            message_property: self.message_property,
            saga_property: saga_property.into(),
        });
    }
}
