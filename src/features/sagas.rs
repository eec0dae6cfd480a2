//! Saga features.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;

use crate::core::{Feature, FeatureConfigurationContext, FeatureDeclaration, MessageHandlerRegistry};
use crate::sagas::{InMemorySagaPersister, SagaCatalog, SagaMetadataCollection, SagaPersister};

use super::receive::ReceiveFeature;

/// Analyses the registered sagas and routes their messages to them
pub struct SagasFeature;

impl Feature for SagasFeature {
    fn declare(&self, feature: &mut FeatureDeclaration) {
        feature
            .enable_by_default()
            .depends_on::<ReceiveFeature>()
            .prerequisite(
                |context| {
                    context
                        .components
                        .get::<SagaCatalog>()
                        .is_some_and(|catalog| !catalog.is_empty())
                },
                "Sagas have been registered",
            );
    }

    fn setup(&self, context: &mut FeatureConfigurationContext<'_>) -> Result<()> {
        let catalog = context
            .components
            .get::<SagaCatalog>()
            .cloned()
            .ok_or_else(|| anyhow!("No saga catalog registered"))?;

        let metadata = Arc::new(catalog.build_metadata()?);
        let handlers = catalog.message_handlers(&metadata);

        let registry = context.components.get_or_insert_default::<MessageHandlerRegistry>();
        for (message_type, handler) in handlers {
            registry.register(message_type, handler);
        }

        info!(sagas = metadata.len(), "Sagas configured");
        context.components.register(metadata);
        Ok(())
    }
}

/// Stores saga instances in memory
pub struct InMemorySagaPersistenceFeature;

impl Feature for InMemorySagaPersistenceFeature {
    fn declare(&self, feature: &mut FeatureDeclaration) {
        feature.enable_by_default().depends_on::<SagasFeature>().prerequisite(
            |context| !context.components.contains::<Arc<dyn SagaPersister>>(),
            "No other saga persister has been registered",
        );
    }

    fn setup(&self, context: &mut FeatureConfigurationContext<'_>) -> Result<()> {
        let metadata = context
            .components
            .get::<Arc<SagaMetadataCollection>>()
            .cloned()
            .ok_or_else(|| anyhow!("Saga metadata has not been built"))?;

        let persister: Arc<dyn SagaPersister> = Arc::new(InMemorySagaPersister::new(metadata));
        context.components.register(persister);
        Ok(())
    }
}
