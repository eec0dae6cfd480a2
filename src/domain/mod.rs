//! Domain types for messages and saga state.

pub mod message;
pub mod saga_data;

pub use message::{headers, IncomingMessage, LogicalMessage, OutgoingMessage, JSON_CONTENT_TYPE};
pub use saga_data::{SagaEntity, SAGA_ID_PROPERTY};
