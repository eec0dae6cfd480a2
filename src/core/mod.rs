//! Core runtime.
//!
//! This module contains:
//! - Features: Feature declarations and the activation engine
//! - Settings: Layered key/value settings shared by features
//! - Components: Type-keyed registrations made during feature setup
//! - Pipeline: Step assembly (ordering, replacement, connectors)
//! - Executor: Frozen pipelines and the continuation-passing runner
//! - Endpoint: Host wiring features, pipelines and the receive breaker

pub mod circuit_breaker;
pub mod components;
pub mod context;
pub mod endpoint;
pub mod executor;
pub mod features;
pub mod handlers;
pub mod pipeline;
pub mod settings;

// Re-export commonly used types
pub use circuit_breaker::{BreakerState, CircuitBreakerSettings, RepeatedFailuresOverTimeCircuitBreaker};
pub use components::ComponentRegistry;
pub use context::{
    ContextBag, ContextKind, IncomingLogicalMessageContext, IncomingPhysicalMessageContext, InvokeHandlersContext,
    OutgoingLogicalMessageContext, OutgoingPhysicalMessageContext, PipelineContext, TransportReceiveContext,
};
pub use endpoint::{Endpoint, EndpointConfiguration, ProcessingOutcome, RunningEndpoint};
pub use executor::{Behavior, Connector, Next, Pipeline, PipelineError, PipelineStep, StepDescription};
pub use features::{
    feature_name, ActivationReport, Feature, FeatureActivator, FeatureConfigurationContext, FeatureDeclaration,
    FeatureDiagnostic, FeatureStartupTask, FeatureStartupTasks, FeatureState, ROOT_FEATURE,
};
pub use handlers::{HandlerContext, InvokeHandlersTerminator, MessageHandler, MessageHandlerRegistry};
pub use pipeline::{well_known_steps, PipelineAssembler, StepRegistration};
pub use settings::SettingsHolder;
