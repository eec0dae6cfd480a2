//! Saga registrations of an endpoint.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::core::MessageHandler;
use crate::error::ConfigurationError;

use super::dispatch::{SagaHandler, SagaMessageHandler};
use super::finders::{FindSagas, SagaFinderRegistry};
use super::metadata::SagaMetadataCollection;
use super::types::{Conventions, TypeCatalog, TypeKey};

/// Saga types, their handlers and custom finders, described against a
/// [`TypeCatalog`]
#[derive(Clone)]
pub struct SagaCatalog {
    types: TypeCatalog,
    conventions: Conventions,
    sagas: Vec<(TypeKey, Arc<dyn SagaHandler>)>,
    finder_types: Vec<TypeKey>,
    finders: SagaFinderRegistry,
}

impl SagaCatalog {
    pub fn new(types: TypeCatalog) -> Self {
        let conventions = Conventions::new(types.well_known());
        Self {
            types,
            conventions,
            sagas: Vec::new(),
            finder_types: Vec::new(),
            finders: SagaFinderRegistry::new(),
        }
    }

    pub fn with_conventions(mut self, conventions: Conventions) -> Self {
        self.conventions = conventions;
        self
    }

    pub fn register_saga<H: SagaHandler + 'static>(&mut self, saga: TypeKey, handler: H) -> &mut Self {
        self.sagas.push((saga, Arc::new(handler)));
        self
    }

    pub fn register_finder<F: FindSagas + 'static>(&mut self, finder_type: TypeKey, finder: F) -> &mut Self {
        self.finder_types.push(finder_type);
        self.finders.register(self.types.name(finder_type), Arc::new(finder));
        self
    }

    pub fn types(&self) -> &TypeCatalog {
        &self.types
    }

    pub fn conventions(&self) -> &Conventions {
        &self.conventions
    }

    pub fn is_empty(&self) -> bool {
        self.sagas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sagas.len()
    }

    /// Analyse every registered saga
    pub fn build_metadata(&self) -> Result<SagaMetadataCollection, ConfigurationError> {
        let sagas: Vec<TypeKey> = self.sagas.iter().map(|(key, _)| *key).collect();
        SagaMetadataCollection::initialize(&self.types, &sagas, &self.finder_types, &self.conventions)
    }

    /// One handler per (message type, saga) pair
    pub fn message_handlers(&self, metadata: &SagaMetadataCollection) -> Vec<(String, Arc<dyn MessageHandler>)> {
        let finders = Arc::new(self.finders.clone());
        let mut handlers: Vec<(String, Arc<dyn MessageHandler>)> = Vec::new();

        for (saga, handler) in &self.sagas {
            let saga_name = self.types.name(*saga);
            let Some(saga_metadata) = metadata.find(saga_name) else {
                warn!(saga = %saga_name, "No metadata for registered saga, skipping");
                continue;
            };

            let dispatcher: Arc<dyn MessageHandler> = Arc::new(SagaMessageHandler::new(
                saga_metadata.clone(),
                handler.clone(),
                finders.clone(),
            ));

            for message in &saga_metadata.associated_messages {
                handlers.push((message.message_type.clone(), dispatcher.clone()));
            }
        }

        handlers
    }
}

impl fmt::Debug for SagaCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sagas: Vec<&str> = self.sagas.iter().map(|(k, _)| self.types.name(*k)).collect();
        f.debug_struct("SagaCatalog")
            .field("sagas", &sagas)
            .field("finders", &self.finders)
            .finish()
    }
}
