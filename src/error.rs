//! Startup-time configuration errors.
//!
//! Everything in here is discovered while building saga metadata, resolving
//! features or assembling pipelines. These errors are always fatal to
//! startup and never retried.

use thiserror::Error;

/// Static or structural problem found while configuring an endpoint
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Type '{name}' is not registered in the type catalog")]
    UnknownType { name: String },

    #[error("Saga '{saga}' does not implement generic saga base 'Saga<TSagaData>'")]
    NotAGenericSaga { saga: String },

    #[error("Saga data '{entity}' used by saga '{saga}' must expose an 'Id' member of type Guid")]
    MissingSagaIdentity { saga: String, entity: String },

    #[error("Message '{message}' does not have a member named '{member}' used in a mapping of saga '{saga}'")]
    UnknownMessageMember {
        saga: String,
        message: String,
        member: String,
    },

    #[error("Saga data '{entity}' does not have a property named '{property}' used in a mapping of saga '{saga}'")]
    UnknownSagaProperty {
        saga: String,
        entity: String,
        property: String,
    },

    #[error("Message property '{message}.{member}' is mapped to the saga id but is of type '{actual}'. Only message properties of type Guid can be mapped to the saga id")]
    NonGuidSagaIdMapping {
        message: String,
        member: String,
        actual: String,
    },

    #[error("Message '{message}' is mapped more than once in saga '{saga}'. Each message can only be correlated by a single mapping or finder")]
    DuplicateMessageMapping { saga: String, message: String },

    #[error("A custom IFindSagas must target a valid message type as defined by the message conventions. Please change '{message}' to a valid message type or add it to the message conventions. Finder name '{finder}'")]
    FinderForNonMessage { message: String, finder: String },

    #[error("A custom IFindSagas and an existing mapping where found for message '{message}'. Please either remove the message mapping or remove the finder. Finder name '{finder}'")]
    FinderConflictsWithMapping { message: String, finder: String },

    #[error("Multiple custom finders ('{first}', '{second}') target message '{message}'")]
    DuplicateFinder {
        message: String,
        first: String,
        second: String,
    },

    #[error("Features form a dependency cycle and can never be activated: {}", .features.join(", "))]
    DependencyCycle { features: Vec<String> },

    #[error("Feature '{feature}' failed during setup: {source:#}")]
    FeatureSetup {
        feature: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Pipeline step id '{step_id}' cannot be empty or whitespace")]
    EmptyStepId { step_id: String },

    #[error("Pipeline step '{step_id}' is already registered")]
    DuplicateStep { step_id: String },

    #[error("Pipeline step '{step_id}' references step '{anchor}' which does not exist in the same stage")]
    UnknownStepAnchor { step_id: String, anchor: String },

    #[error("Cannot replace pipeline step '{step_id}' because it has not been registered")]
    UnknownReplacement { step_id: String },

    #[error("Pipeline step '{step_id}' is registered for the {expected} stage but its behavior works on the {actual} stage")]
    StepStageMismatch {
        step_id: String,
        expected: String,
        actual: String,
    },

    #[error("Pipeline steps cannot be ordered, their before/after constraints form a cycle: {}", .steps.join(", "))]
    StepOrderingCycle { steps: Vec<String> },

    #[error("Stage '{stage}' has more than one connector: '{first}' and '{second}'")]
    ConflictingConnectors {
        stage: String,
        first: String,
        second: String,
    },

    #[error("Connector '{connector}' leads back to stage '{stage}' which is already part of the pipeline")]
    ConnectorLoop { connector: String, stage: String },

    #[error("Failed to build pipeline step '{step_id}': {source:#}")]
    StepFactory {
        step_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid type manifest: {0}")]
    InvalidManifest(String),
}
