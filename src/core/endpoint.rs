//! Endpoint host.
//!
//! [`EndpointConfiguration`] collects settings, components, handlers and
//! features. [`Endpoint::start`] activates the features, freezes the
//! component registry, builds the receive and send pipelines and runs the
//! startup tasks. The resulting [`RunningEndpoint`] processes incoming
//! messages behind a receive circuit breaker.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ResolvedConfig, ENDPOINT_NAME_SETTING};
use crate::domain::IncomingMessage;
use crate::features::{self, DispatchFeature, MessageDispatcher};
use crate::sagas::{SagaCatalog, SagaPersister};

use super::circuit_breaker::{BreakerState, CircuitBreakerSettings, RepeatedFailuresOverTimeCircuitBreaker};
use super::components::ComponentRegistry;
use super::context::{ContextKind, OutgoingLogicalMessageContext, PipelineContext, TransportReceiveContext};
use super::executor::Pipeline;
use super::features::{
    feature_name, ActivationReport, Feature, FeatureActivator, FeatureConfigurationContext, FeatureStartupTasks,
    FeatureState,
};
use super::handlers::{MessageHandler, MessageHandlerRegistry};
use super::pipeline::PipelineAssembler;
use super::settings::SettingsHolder;

const RECEIVE_BREAKER_NAME: &str = "MessageReceive";

type CriticalErrorAction = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Everything needed to start an endpoint
pub struct EndpointConfiguration {
    name: String,
    settings: SettingsHolder,
    components: ComponentRegistry,
    features: FeatureActivator,
    pipeline: PipelineAssembler,
    circuit_breaker: CircuitBreakerSettings,
    on_critical_error: Option<CriticalErrorAction>,
}

impl EndpointConfiguration {
    /// Configuration with the built-in features registered
    pub fn new(name: impl Into<String>) -> Self {
        let mut features = FeatureActivator::new();
        features::register_builtin_features(&mut features);

        Self {
            name: name.into(),
            settings: SettingsHolder::new(),
            components: ComponentRegistry::new(),
            features,
            pipeline: PipelineAssembler::new(),
            circuit_breaker: CircuitBreakerSettings::default(),
            on_critical_error: None,
        }
    }

    /// Configuration seeded from a resolved config file
    pub fn from_config(config: &ResolvedConfig) -> Result<Self> {
        let mut configuration = Self::new(config.endpoint_name.clone());
        config.apply(&mut configuration.settings)?;
        configuration.circuit_breaker = config.circuit_breaker.clone();
        Ok(configuration)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&mut self) -> &mut SettingsHolder {
        &mut self.settings
    }

    pub fn components(&mut self) -> &mut ComponentRegistry {
        &mut self.components
    }

    /// Steps registered here run alongside the ones registered by features
    pub fn pipeline(&mut self) -> &mut PipelineAssembler {
        &mut self.pipeline
    }

    /// Register a feature without changing its enablement
    pub fn add_feature<F: Feature>(&mut self, feature: F) -> &mut Self {
        self.features.add(feature);
        self
    }

    /// Register a feature and enable it explicitly
    pub fn enable_feature<F: Feature>(&mut self, feature: F) -> &mut Self {
        self.features.add(feature);
        self.settings.enable_feature(&feature_name::<F>());
        self
    }

    /// Explicitly disable a feature
    pub fn disable_feature<F: Feature>(&mut self) -> &mut Self {
        self.settings.disable_feature(&feature_name::<F>());
        self
    }

    /// Handle messages of `message_type` with `handler`, in registration order
    pub fn register_handler<H: MessageHandler + 'static>(
        &mut self,
        message_type: impl Into<String>,
        handler: H,
    ) -> &mut Self {
        self.components
            .get_or_insert_default::<MessageHandlerRegistry>()
            .register(message_type, Arc::new(handler));
        self
    }

    /// Sagas handled by this endpoint
    pub fn use_sagas(&mut self, catalog: SagaCatalog) -> &mut Self {
        self.components.register(catalog);
        self
    }

    /// Transport side of the send pipeline
    pub fn use_dispatcher(&mut self, dispatcher: Arc<dyn MessageDispatcher>) -> &mut Self {
        self.components.register(dispatcher);
        self
    }

    /// Saga store replacing the in-memory one
    pub fn use_saga_persister(&mut self, persister: Arc<dyn SagaPersister>) -> &mut Self {
        self.components.register(persister);
        self
    }

    pub fn circuit_breaker(&mut self, settings: CircuitBreakerSettings) -> &mut Self {
        self.circuit_breaker = settings;
        self
    }

    /// Called when message processing keeps failing for longer than the
    /// circuit breaker allows
    pub fn on_critical_error<F>(&mut self, action: F) -> &mut Self
    where
        F: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        self.on_critical_error = Some(Arc::new(action));
        self
    }
}

/// Entry point for starting endpoints
pub struct Endpoint;

impl Endpoint {
    /// Activate features, build the pipelines and run the startup tasks
    #[instrument(skip(configuration), fields(endpoint = %configuration.name))]
    pub async fn start(configuration: EndpointConfiguration) -> Result<RunningEndpoint> {
        let EndpointConfiguration {
            name,
            mut settings,
            mut components,
            mut features,
            mut pipeline,
            circuit_breaker,
            on_critical_error,
        } = configuration;

        settings.set_default(ENDPOINT_NAME_SETTING, &name)?;

        let report = {
            let mut context = FeatureConfigurationContext::new(&mut settings, &mut pipeline, &mut components);
            features.setup_features(&mut context)?
        };
        log_activation_report(&report);

        let components = Arc::new(components);
        let receive = pipeline
            .build(ContextKind::TransportReceive, &components)
            .context("Failed to build the receive pipeline")?;
        let send = pipeline
            .build(ContextKind::OutgoingLogical, &components)
            .context("Failed to build the send pipeline")?;
        debug!(receive = receive.steps().len(), send = send.steps().len(), "Pipelines built");

        let startup_tasks = features.startup_tasks();
        startup_tasks
            .start(&components)
            .await
            .context("Failed to start feature startup tasks")?;

        let critical = on_critical_error.unwrap_or_else(|| {
            Arc::new(|e: &anyhow::Error| error!(error = %e, "Repeated failures when processing messages"))
                as CriticalErrorAction
        });
        let breaker = RepeatedFailuresOverTimeCircuitBreaker::new(RECEIVE_BREAKER_NAME, &circuit_breaker, move |e| {
            critical(e)
        });

        info!(endpoint = %name, "Endpoint started");
        Ok(RunningEndpoint {
            name,
            settings,
            components,
            report,
            receive,
            send,
            startup_tasks,
            breaker,
        })
    }
}

fn log_activation_report(report: &ActivationReport) {
    for feature in &report.features {
        match &feature.state {
            FeatureState::Active => info!(feature = %feature.name, "Feature active"),
            state => debug!(feature = %feature.name, state = %state, "Feature not active"),
        }
    }
}

/// What the transport should do with a processed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOutcome {
    /// Processing finished, the message can be consumed
    Completed,
    /// A step asked for the receive operation to be rolled back
    Aborted,
}

/// A started endpoint
pub struct RunningEndpoint {
    name: String,
    settings: SettingsHolder,
    components: Arc<ComponentRegistry>,
    report: ActivationReport,
    receive: Pipeline,
    send: Pipeline,
    startup_tasks: FeatureStartupTasks,
    breaker: RepeatedFailuresOverTimeCircuitBreaker,
}

impl RunningEndpoint {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &SettingsHolder {
        &self.settings
    }

    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    pub fn activation_report(&self) -> &ActivationReport {
        &self.report
    }

    pub fn receive_pipeline(&self) -> &Pipeline {
        &self.receive
    }

    pub fn send_pipeline(&self) -> &Pipeline {
        &self.send
    }

    pub fn circuit_breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Run one message through the receive pipeline. Failures are recorded
    /// by the receive circuit breaker and returned to the caller.
    #[instrument(skip(self, message), fields(message_id = %message.message_id))]
    pub async fn process(&self, message: IncomingMessage) -> Result<ProcessingOutcome> {
        let mut transport = TransportReceiveContext::new(message);
        transport.extensions.set(self.components.clone());
        let mut context = PipelineContext::TransportReceive(transport);

        match self.receive.invoke(&mut context).await {
            Ok(()) => {
                self.breaker.success();
                if context.as_transport_receive()?.receive_operation_aborted() {
                    Ok(ProcessingOutcome::Aborted)
                } else {
                    Ok(ProcessingOutcome::Completed)
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to process message");
                self.breaker.failure(anyhow::anyhow!("{:#}", e)).await;
                Err(e)
            }
        }
    }

    /// Run a message through the send pipeline
    pub async fn send(&self, message: OutgoingLogicalMessageContext) -> Result<()> {
        let dispatch = feature_name::<DispatchFeature>();
        if !self.report.is_active(&dispatch) {
            bail!("Cannot send messages, the {} feature is not active", dispatch);
        }

        let mut message = message;
        message.extensions.set(self.components.clone());
        debug!(message_id = %message.message_id, message_type = %message.message.message_type, "Sending message");

        let mut context = PipelineContext::OutgoingLogical(message);
        self.send.invoke(&mut context).await
    }

    /// Stop the startup tasks in reverse order
    pub async fn stop(self) -> Result<()> {
        self.startup_tasks.stop(&self.components).await;
        info!(endpoint = %self.name, "Endpoint stopped");
        Ok(())
    }
}
