//! sagabus - Message-driven endpoint runtime
//!
//! A runtime for message-driven endpoints: features decide what an
//! endpoint can do, pipelines carry every message through ordered steps,
//! and sagas keep correlated state across messages.
//!
//! # Architecture
//!
//! Startup happens once:
//! - Features are resolved against their dependencies and prerequisites
//! - Active features register pipeline steps and components
//! - Pipelines are frozen and shared by every message
//!
//! # Modules
//!
//! - `core`: Feature activation, pipelines, endpoint host
//! - `features`: Built-in features (receive, dispatch, sagas)
//! - `sagas`: Saga metadata, finders and persistence
//! - `domain`: Messages and saga data
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Show which features activate
//! sagabus features
//!
//! # Show the assembled pipelines
//! sagabus pipeline
//!
//! # Analyse sagas declared in a manifest
//! sagabus sagas sagas.yaml
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod features;
pub mod sagas;

// Re-export main types at crate root for convenience
pub use crate::core::{Endpoint, EndpointConfiguration, Feature, FeatureActivator, PipelineAssembler, RunningEndpoint};
pub use domain::{IncomingMessage, LogicalMessage, OutgoingMessage, SagaEntity};
pub use error::ConfigurationError;
pub use sagas::{InMemorySagaPersister, SagaCatalog, SagaMetadata, SagaMetadataCollection, SagaPersister};
