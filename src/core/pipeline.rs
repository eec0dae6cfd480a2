//! Pipeline assembly.
//!
//! Features register steps into a [`PipelineAssembler`] while they are being
//! set up. Steps are grouped by the context variant they work on; within a
//! stage they run in registration order unless `insert_before`/`insert_after`
//! anchors say otherwise. A connector closes a stage and leads to the next.
//! [`PipelineAssembler::build`] validates everything and freezes the result
//! into a [`Pipeline`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::error::ConfigurationError;

use super::components::ComponentRegistry;
use super::context::ContextKind;
use super::executor::{Behavior, Connector, Pipeline, PipelineStep, StepBehavior};

/// Ids of the steps registered by the built-in features
pub mod well_known_steps {
    pub const EXECUTE_UNIT_OF_WORK: &str = "ExecuteUnitOfWork";
    pub const MUTATE_INCOMING_TRANSPORT_MESSAGE: &str = "MutateIncomingTransportMessage";
    pub const MUTATE_INCOMING_MESSAGES: &str = "MutateIncomingMessages";
    pub const INVOKE_HANDLERS: &str = "InvokeHandlers";
    pub const MUTATE_OUTGOING_MESSAGES: &str = "MutateOutgoingMessages";
    pub const MUTATE_OUTGOING_TRANSPORT_MESSAGE: &str = "MutateOutgoingTransportMessage";
    pub const DISPATCH_TO_TRANSPORT: &str = "DispatchToTransport";
}

type StepFactory = Arc<dyn Fn(&ComponentRegistry) -> Result<Arc<dyn Behavior>> + Send + Sync>;

enum StepSource {
    Instance(Arc<dyn Behavior>),
    Factory(StepFactory),
}

/// A registered behavior step, adjustable through its anchors
pub struct StepRegistration {
    step_id: String,
    description: String,
    stage: ContextKind,
    source: StepSource,
    before: Vec<String>,
    after: Vec<String>,
}

impl fmt::Debug for StepRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistration")
            .field("step_id", &self.step_id)
            .field("stage", &self.stage)
            .field("before", &self.before)
            .field("after", &self.after)
            .finish_non_exhaustive()
    }
}

impl StepRegistration {
    /// Run this step before `step_id`
    pub fn insert_before(&mut self, step_id: impl Into<String>) -> &mut Self {
        self.before.push(step_id.into());
        self
    }

    /// Run this step after `step_id`
    pub fn insert_after(&mut self, step_id: impl Into<String>) -> &mut Self {
        self.after.push(step_id.into());
        self
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn stage(&self) -> ContextKind {
        self.stage
    }

    fn anchors(&self) -> impl Iterator<Item = &String> {
        self.before.iter().chain(self.after.iter())
    }
}

struct ConnectorRegistration {
    step_id: String,
    description: String,
    connector: Arc<dyn Connector>,
}

struct Replacement {
    step_id: String,
    description: Option<String>,
    behavior: Arc<dyn Behavior>,
}

/// Mutable step registry filled during feature activation
#[derive(Default)]
pub struct PipelineAssembler {
    steps: Vec<StepRegistration>,
    connectors: Vec<ConnectorRegistration>,
    replacements: Vec<Replacement>,
}

impl PipelineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a behavior instance
    pub fn register<B: Behavior + 'static>(
        &mut self,
        step_id: impl Into<String>,
        behavior: B,
        description: impl Into<String>,
    ) -> Result<&mut StepRegistration, ConfigurationError> {
        let stage = behavior.stage();
        self.push_step(step_id.into(), description.into(), stage, StepSource::Instance(Arc::new(behavior)))
    }

    /// Register a behavior built from the frozen component registry when the
    /// pipeline is built
    pub fn register_factory<F>(
        &mut self,
        step_id: impl Into<String>,
        stage: ContextKind,
        description: impl Into<String>,
        factory: F,
    ) -> Result<&mut StepRegistration, ConfigurationError>
    where
        F: Fn(&ComponentRegistry) -> Result<Arc<dyn Behavior>> + Send + Sync + 'static,
    {
        self.push_step(step_id.into(), description.into(), stage, StepSource::Factory(Arc::new(factory)))
    }

    /// Register a connector closing the stage it consumes
    pub fn register_connector<C: Connector + 'static>(
        &mut self,
        step_id: impl Into<String>,
        connector: C,
        description: impl Into<String>,
    ) -> Result<(), ConfigurationError> {
        let step_id = step_id.into();
        self.check_step_id(&step_id)?;
        debug!(step = %step_id, from = %connector.input_kind(), to = %connector.output_kind(), "Registered connector");

        self.connectors.push(ConnectorRegistration {
            step_id,
            description: description.into(),
            connector: Arc::new(connector),
        });
        Ok(())
    }

    /// Swap the behavior of an existing step, keeping its position. The step
    /// may be registered later; unknown ids fail at build time.
    pub fn replace<B: Behavior + 'static>(
        &mut self,
        step_id: impl Into<String>,
        behavior: B,
        description: Option<String>,
    ) {
        self.replacements.push(Replacement {
            step_id: step_id.into(),
            description,
            behavior: Arc::new(behavior),
        });
    }

    /// True when a step or connector with this id exists
    pub fn contains(&self, step_id: &str) -> bool {
        self.steps.iter().any(|s| s.step_id == step_id)
            || self.connectors.iter().any(|c| c.step_id == step_id)
    }

    /// Number of registered behaviors and connectors
    pub fn len(&self) -> usize {
        self.steps.len() + self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check anchors and replacements without instantiating anything
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for step in &self.steps {
            for anchor in step.anchors() {
                let same_stage = self
                    .steps
                    .iter()
                    .any(|other| &other.step_id == anchor && other.stage == step.stage);

                if !same_stage {
                    return Err(ConfigurationError::UnknownStepAnchor {
                        step_id: step.step_id.clone(),
                        anchor: anchor.clone(),
                    });
                }
            }
        }

        for replacement in &self.replacements {
            if !self.steps.iter().any(|s| s.step_id == replacement.step_id) {
                return Err(ConfigurationError::UnknownReplacement {
                    step_id: replacement.step_id.clone(),
                });
            }
        }

        Ok(())
    }

    /// Freeze the chain starting at `root`, following connectors from stage
    /// to stage. Stages not reachable from `root` are left out.
    pub fn build(&self, root: ContextKind, components: &ComponentRegistry) -> Result<Pipeline, ConfigurationError> {
        self.validate()?;

        // Later replacements win.
        let replacements: HashMap<&str, &Replacement> = self
            .replacements
            .iter()
            .map(|r| (r.step_id.as_str(), r))
            .collect();

        let mut frozen = Vec::new();
        let mut visited = HashSet::new();
        let mut stage = root;

        loop {
            visited.insert(stage);

            for registration in self.ordered_stage(stage)? {
                let (behavior, description) = match replacements.get(registration.step_id.as_str()) {
                    Some(replacement) => (
                        replacement.behavior.clone(),
                        replacement
                            .description
                            .clone()
                            .unwrap_or_else(|| registration.description.clone()),
                    ),
                    None => (self.instantiate(registration, components)?, registration.description.clone()),
                };

                if behavior.stage() != stage {
                    return Err(ConfigurationError::StepStageMismatch {
                        step_id: registration.step_id.clone(),
                        expected: stage.to_string(),
                        actual: behavior.stage().to_string(),
                    });
                }

                frozen.push(PipelineStep {
                    id: registration.step_id.clone(),
                    description,
                    stage,
                    behavior: StepBehavior::Behavior(behavior),
                });
            }

            let mut outgoing = self
                .connectors
                .iter()
                .filter(|c| c.connector.input_kind() == stage);

            let Some(connector) = outgoing.next() else {
                break;
            };

            if let Some(other) = outgoing.next() {
                return Err(ConfigurationError::ConflictingConnectors {
                    stage: stage.to_string(),
                    first: connector.step_id.clone(),
                    second: other.step_id.clone(),
                });
            }

            let target = connector.connector.output_kind();
            if visited.contains(&target) {
                return Err(ConfigurationError::ConnectorLoop {
                    connector: connector.step_id.clone(),
                    stage: target.to_string(),
                });
            }

            frozen.push(PipelineStep {
                id: connector.step_id.clone(),
                description: connector.description.clone(),
                stage,
                behavior: StepBehavior::Connector(connector.connector.clone()),
            });
            stage = target;
        }

        debug!(root = %root, steps = frozen.len(), "Pipeline built");
        Ok(Pipeline::new(root, frozen))
    }

    fn push_step(
        &mut self,
        step_id: String,
        description: String,
        stage: ContextKind,
        source: StepSource,
    ) -> Result<&mut StepRegistration, ConfigurationError> {
        self.check_step_id(&step_id)?;
        debug!(step = %step_id, stage = %stage, "Registered pipeline step");

        self.steps.push(StepRegistration {
            step_id,
            description,
            stage,
            source,
            before: Vec::new(),
            after: Vec::new(),
        });

        let index = self.steps.len() - 1;
        Ok(&mut self.steps[index])
    }

    fn check_step_id(&self, step_id: &str) -> Result<(), ConfigurationError> {
        if step_id.trim().is_empty() {
            return Err(ConfigurationError::EmptyStepId {
                step_id: step_id.to_string(),
            });
        }

        if self.contains(step_id) {
            return Err(ConfigurationError::DuplicateStep {
                step_id: step_id.to_string(),
            });
        }

        Ok(())
    }

    fn instantiate(
        &self,
        registration: &StepRegistration,
        components: &ComponentRegistry,
    ) -> Result<Arc<dyn Behavior>, ConfigurationError> {
        match &registration.source {
            StepSource::Instance(behavior) => Ok(behavior.clone()),
            StepSource::Factory(factory) => factory(components).map_err(|source| ConfigurationError::StepFactory {
                step_id: registration.step_id.clone(),
                source,
            }),
        }
    }

    /// Topological order of one stage; ties keep registration order
    fn ordered_stage(&self, stage: ContextKind) -> Result<Vec<&StepRegistration>, ConfigurationError> {
        let members: Vec<&StepRegistration> = self.steps.iter().filter(|s| s.stage == stage).collect();
        let position: HashMap<&str, usize> = members
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_id.as_str(), i))
            .collect();

        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); members.len()];
        let mut in_degree = vec![0usize; members.len()];

        let mut add_edge = |from: usize, to: usize| {
            successors[from].push(to);
            in_degree[to] += 1;
        };

        for (i, step) in members.iter().enumerate() {
            for anchor in &step.before {
                if let Some(&j) = position.get(anchor.as_str()) {
                    add_edge(i, j);
                }
            }
            for anchor in &step.after {
                if let Some(&j) = position.get(anchor.as_str()) {
                    add_edge(j, i);
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..members.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut ordered = Vec::with_capacity(members.len());

        while let Some(i) = ready.pop_first() {
            ordered.push(i);
            for &j in &successors[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.insert(j);
                }
            }
        }

        if ordered.len() < members.len() {
            let placed: HashSet<usize> = ordered.iter().copied().collect();
            let steps = (0..members.len())
                .filter(|i| !placed.contains(i))
                .map(|i| members[i].step_id.clone())
                .collect();
            return Err(ConfigurationError::StepOrderingCycle { steps });
        }

        Ok(ordered.into_iter().map(|i| members[i]).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::Next;
    use crate::core::context::PipelineContext;
    use async_trait::async_trait;

    struct Noop(ContextKind);

    #[async_trait]
    impl Behavior for Noop {
        fn stage(&self) -> ContextKind {
            self.0
        }

        async fn invoke(&self, context: &mut PipelineContext, next: Next<'_>) -> Result<()> {
            next.run(context).await
        }
    }

    struct Bridge(ContextKind, ContextKind);

    #[async_trait]
    impl Connector for Bridge {
        fn input_kind(&self) -> ContextKind {
            self.0
        }

        fn output_kind(&self) -> ContextKind {
            self.1
        }

        async fn invoke(&self, _context: &mut PipelineContext, _next: Next<'_>) -> Result<()> {
            Ok(())
        }
    }

    const LOGICAL: ContextKind = ContextKind::IncomingLogical;

    fn ids(pipeline: &Pipeline) -> Vec<&str> {
        pipeline.steps().iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_registration_debug_shows_anchors() {
        let mut assembler = PipelineAssembler::new();
        assembler.register("a", Noop(LOGICAL), "").unwrap();

        let registration = assembler.register("b", Noop(LOGICAL), "").unwrap().insert_after("a");
        let debug = format!("{:?}", registration);
        assert!(debug.contains("\"b\""));
        assert!(debug.contains("IncomingLogical"));
        assert!(debug.contains("after: [\"a\"]"));

        let err = assembler.register("a", Noop(LOGICAL), "").unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateStep { ref step_id } if step_id == "a"));
    }

    #[test]
    fn test_registration_order_is_default() {
        let mut assembler = PipelineAssembler::new();
        assembler.register("a", Noop(LOGICAL), "first").unwrap();
        assembler.register("b", Noop(LOGICAL), "second").unwrap();
        assembler.register("c", Noop(LOGICAL), "third").unwrap();

        let pipeline = assembler.build(LOGICAL, &ComponentRegistry::new()).unwrap();
        assert_eq!(ids(&pipeline), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_anchors_reorder_steps() {
        let mut assembler = PipelineAssembler::new();
        assembler.register("a", Noop(LOGICAL), "").unwrap();
        assembler.register("b", Noop(LOGICAL), "").unwrap();
        assembler.register("c", Noop(LOGICAL), "").unwrap().insert_before("a");
        assembler.register("d", Noop(LOGICAL), "").unwrap().insert_after("a").insert_before("b");

        let pipeline = assembler.build(LOGICAL, &ComponentRegistry::new()).unwrap();
        assert_eq!(ids(&pipeline), vec!["c", "a", "d", "b"]);
    }

    #[test]
    fn test_duplicate_and_empty_ids_rejected() {
        let mut assembler = PipelineAssembler::new();
        assembler.register("a", Noop(LOGICAL), "").unwrap();

        assert!(matches!(
            assembler.register("a", Noop(LOGICAL), ""),
            Err(ConfigurationError::DuplicateStep { .. })
        ));
        assert!(matches!(
            assembler.register("  ", Noop(LOGICAL), ""),
            Err(ConfigurationError::EmptyStepId { .. })
        ));
    }

    #[test]
    fn test_unknown_anchor_rejected() {
        let mut assembler = PipelineAssembler::new();
        assembler.register("a", Noop(LOGICAL), "").unwrap().insert_after("missing");

        let err = assembler.build(LOGICAL, &ComponentRegistry::new()).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownStepAnchor { ref anchor, .. } if anchor == "missing"));
    }

    #[test]
    fn test_anchor_cycle_rejected() {
        let mut assembler = PipelineAssembler::new();
        assembler.register("a", Noop(LOGICAL), "").unwrap().insert_after("b");
        assembler.register("b", Noop(LOGICAL), "").unwrap().insert_after("a");

        let err = assembler.build(LOGICAL, &ComponentRegistry::new()).unwrap_err();
        assert!(matches!(err, ConfigurationError::StepOrderingCycle { .. }));
    }

    #[test]
    fn test_connectors_chain_stages() {
        let mut assembler = PipelineAssembler::new();
        assembler.register("logical", Noop(LOGICAL), "").unwrap();
        assembler
            .register("physical", Noop(ContextKind::IncomingPhysical), "")
            .unwrap();
        assembler
            .register_connector("deserialize", Bridge(ContextKind::IncomingPhysical, LOGICAL), "")
            .unwrap();
        assembler
            .register("outgoing", Noop(ContextKind::OutgoingLogical), "")
            .unwrap();

        let pipeline = assembler
            .build(ContextKind::IncomingPhysical, &ComponentRegistry::new())
            .unwrap();
        assert_eq!(ids(&pipeline), vec!["physical", "deserialize", "logical"]);
        assert!(pipeline.steps()[1].is_connector());
    }

    #[test]
    fn test_conflicting_connectors_rejected() {
        let mut assembler = PipelineAssembler::new();
        assembler
            .register_connector("one", Bridge(ContextKind::IncomingPhysical, LOGICAL), "")
            .unwrap();
        assembler
            .register_connector("two", Bridge(ContextKind::IncomingPhysical, LOGICAL), "")
            .unwrap();

        let err = assembler
            .build(ContextKind::IncomingPhysical, &ComponentRegistry::new())
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::ConflictingConnectors { .. }));
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut assembler = PipelineAssembler::new();
        assembler.register("a", Noop(LOGICAL), "original").unwrap();
        assembler.register("b", Noop(LOGICAL), "").unwrap();
        assembler.replace("a", Noop(LOGICAL), Some("replaced".into()));

        let pipeline = assembler.build(LOGICAL, &ComponentRegistry::new()).unwrap();
        assert_eq!(ids(&pipeline), vec!["a", "b"]);
        assert_eq!(pipeline.steps()[0].description, "replaced");

        assembler.replace("missing", Noop(LOGICAL), None);
        assert!(matches!(
            assembler.build(LOGICAL, &ComponentRegistry::new()),
            Err(ConfigurationError::UnknownReplacement { .. })
        ));
    }

    #[test]
    fn test_factory_errors_name_the_step() {
        let mut assembler = PipelineAssembler::new();
        assembler
            .register_factory("needs-component", LOGICAL, "", |components| {
                components
                    .get::<u32>()
                    .map(|_| Arc::new(Noop(LOGICAL)) as Arc<dyn Behavior>)
                    .ok_or_else(|| anyhow::anyhow!("u32 component missing"))
            })
            .unwrap();

        let err = assembler.build(LOGICAL, &ComponentRegistry::new()).unwrap_err();
        assert!(matches!(err, ConfigurationError::StepFactory { ref step_id, .. } if step_id == "needs-component"));

        let mut components = ComponentRegistry::new();
        components.register(1u32);
        assert!(assembler.build(LOGICAL, &components).is_ok());
    }
}
