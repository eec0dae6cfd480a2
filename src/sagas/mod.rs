//! Sagas: long-running, correlated conversations.
//!
//! This module contains:
//! - TypeCatalog: type descriptors sagas are declared against
//! - SagaMetadata: the correlation model derived from a saga declaration
//! - SagaPersister: storage contract and the in-memory reference store
//! - SagaMessageHandler: finds, runs and persists sagas for incoming messages
//! - SagaManifest: YAML declarations for the CLI

pub mod dispatch;
pub mod finders;
pub mod manifest;
pub mod mapping;
pub mod metadata;
pub mod persister;
pub mod registry;
pub mod types;

pub use dispatch::{ActiveSaga, SagaHandler, SagaMessageHandler};
pub use finders::{find_saga, FindSagas, SagaFinderRegistry};
pub use manifest::SagaManifest;
pub use mapping::{MessageMapping, SagaMapper, ToSagaExpression};
pub use metadata::{CorrelationProperty, SagaFinderDefinition, SagaMessage, SagaMetadata, SagaMetadataCollection};
pub use persister::{InMemorySagaPersister, SagaInstance, SagaPersistenceError, SagaPersister};
pub use registry::SagaCatalog;
pub use types::{Conventions, TypeCatalog, TypeDescriptor, TypeExpr, TypeKey, TypeKind, WellKnownTypes};
