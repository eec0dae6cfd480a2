//! Built-in features.
//!
//! This module contains:
//! - Receive: incoming pipeline (unit of work, deserialization, handler invocation)
//! - Dispatch: outgoing pipeline (serialization, dispatch to the transport)
//! - Sagas: saga metadata and saga message handlers
//! - InMemorySagaPersistence: the in-memory saga store
//! - Mutators: hooks changing messages on the way in and out

pub mod dispatch;
pub mod mutators;
pub mod receive;
pub mod sagas;

use crate::core::FeatureActivator;

pub use dispatch::{DispatchFeature, InMemoryDispatcher, MessageDispatcher};
pub use mutators::{
    MessageMutators, MutateIncomingMessages, MutateIncomingTransportMessages, MutateOutgoingMessages,
    MutateOutgoingTransportMessages,
};
pub use receive::{ManageUnitsOfWork, ReceiveFeature, UnitOfWorkManagers};
pub use sagas::{InMemorySagaPersistenceFeature, SagasFeature};

/// Register the built-in features with an activator
pub fn register_builtin_features(activator: &mut FeatureActivator) {
    activator.add(ReceiveFeature);
    activator.add(DispatchFeature);
    activator.add(SagasFeature);
    activator.add(InMemorySagaPersistenceFeature);
}
