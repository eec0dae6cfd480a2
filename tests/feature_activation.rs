//! Feature Activation Integration Tests
//!
//! Tests for dependency resolution, activation order, prerequisites,
//! enablement overrides and startup tasks.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use proptest::prelude::*;
use sagabus::core::{
    ActivationReport, ComponentRegistry, Feature, FeatureActivator, FeatureConfigurationContext, FeatureDeclaration,
    FeatureStartupTask, FeatureState, PipelineAssembler, SettingsHolder,
};
use sagabus::ConfigurationError;

/// Order in which `setup` ran, recorded as a component
#[derive(Default)]
struct SetupTrace(Vec<&'static str>);

fn trace(context: &mut FeatureConfigurationContext<'_>, name: &'static str) {
    context.components.get_or_insert_default::<SetupTrace>().0.push(name);
}

fn resolve_with(
    activator: &mut FeatureActivator,
    mut settings: SettingsHolder,
) -> Result<(ActivationReport, ComponentRegistry), ConfigurationError> {
    let mut pipeline = PipelineAssembler::new();
    let mut components = ComponentRegistry::new();
    let mut context = FeatureConfigurationContext::new(&mut settings, &mut pipeline, &mut components);
    let report = activator.setup_features(&mut context)?;
    Ok((report, components))
}

fn resolve(activator: &mut FeatureActivator) -> Result<(ActivationReport, ComponentRegistry), ConfigurationError> {
    resolve_with(activator, SettingsHolder::new())
}

macro_rules! feature {
    ($name:ident, $label:literal, |$decl:ident| $declare:expr) => {
        struct $name;

        impl Feature for $name {
            fn declare(&self, $decl: &mut FeatureDeclaration) {
                $declare;
            }

            fn setup(&self, context: &mut FeatureConfigurationContext<'_>) -> Result<()> {
                trace(context, $label);
                Ok(())
            }
        }
    };
}

feature!(BaseFeature, "Base", |f| f.enable_by_default());
feature!(MidFeature, "Mid", |f| f.enable_by_default().depends_on::<BaseFeature>());
feature!(TopFeature, "Top", |f| f.enable_by_default().depends_on::<MidFeature>());

#[test]
fn test_reverse_registration_still_activates_in_dependency_order() {
    let mut activator = FeatureActivator::new();
    activator.add(TopFeature);
    activator.add(MidFeature);
    activator.add(BaseFeature);

    let (report, components) = resolve(&mut activator).unwrap();

    assert_eq!(report.activation_order, vec!["Base", "Mid", "Top"]);
    assert!(report.is_active("Base"));
    assert!(report.is_active("Mid"));
    assert!(report.is_active("Top"));
    assert_eq!(components.get::<SetupTrace>().unwrap().0, vec!["Base", "Mid", "Top"]);
}

#[test]
fn test_explicit_disable_cascades_to_dependents() {
    let mut activator = FeatureActivator::new();
    activator.add(TopFeature);
    activator.add(MidFeature);
    activator.add(BaseFeature);

    let mut settings = SettingsHolder::new();
    settings.disable_feature("Base");

    let (report, _) = resolve_with(&mut activator, settings).unwrap();

    assert!(report.activation_order.is_empty());
    assert_eq!(report.state("Base"), Some(&FeatureState::Disabled));
    assert_eq!(
        report.state("Mid"),
        Some(&FeatureState::DependenciesNotMet {
            unmet: vec!["Base".to_string()]
        })
    );
    assert_eq!(
        report.state("Top"),
        Some(&FeatureState::DependenciesNotMet {
            unmet: vec!["Mid".to_string()]
        })
    );
}

feature!(AFeature, "A", |f| f.enable_by_default());
feature!(BFeature, "B", |_f| ());
feature!(CFeature, "C", |_f| ());
feature!(AnyOfFeature, "AnyOf", |f| f
    .enable_by_default()
    .depends_on_at_least_one(["A", "B", "C"]));
feature!(AllOfFeature, "AllOf", |f| f
    .enable_by_default()
    .depends_on::<AFeature>()
    .depends_on::<BFeature>()
    .depends_on::<CFeature>());

#[test]
fn test_at_least_one_group_versus_separate_dependencies() {
    let mut activator = FeatureActivator::new();
    activator.add(AFeature);
    activator.add(BFeature);
    activator.add(CFeature);
    activator.add(AnyOfFeature);
    activator.add(AllOfFeature);

    let (report, _) = resolve(&mut activator).unwrap();

    assert!(report.is_active("A"));
    assert_eq!(report.state("B"), Some(&FeatureState::Disabled));
    assert_eq!(report.state("C"), Some(&FeatureState::Disabled));
    assert!(report.is_active("AnyOf"));
    assert_eq!(
        report.state("AllOf"),
        Some(&FeatureState::DependenciesNotMet {
            unmet: vec!["B".to_string(), "C".to_string()]
        })
    );
}

#[test]
fn test_explicit_enable_satisfies_all_dependencies() {
    let mut activator = FeatureActivator::new();
    activator.add(AllOfFeature);
    activator.add(AFeature);
    activator.add(BFeature);
    activator.add(CFeature);

    let mut settings = SettingsHolder::new();
    settings.enable_feature("B");
    settings.enable_feature("C");

    let (report, _) = resolve_with(&mut activator, settings).unwrap();

    assert!(report.is_active("AllOf"));
    assert_eq!(report.position("AllOf"), Some(3));
}

feature!(CycleLeftFeature, "CycleLeft", |f| f
    .enable_by_default()
    .depends_on::<CycleRightFeature>());
feature!(CycleRightFeature, "CycleRight", |f| f
    .enable_by_default()
    .depends_on::<CycleLeftFeature>());
feature!(SelfReferencingFeature, "SelfReferencing", |f| f
    .enable_by_default()
    .depends_on::<SelfReferencingFeature>());

#[test]
fn test_dependency_cycle_is_fatal_and_names_features() {
    let mut activator = FeatureActivator::new();
    activator.add(BaseFeature);
    activator.add(CycleLeftFeature);
    activator.add(CycleRightFeature);

    match resolve(&mut activator) {
        Err(ConfigurationError::DependencyCycle { features }) => {
            assert_eq!(features, vec!["CycleLeft", "CycleRight"]);
        }
        other => panic!("Expected DependencyCycle, got {:?}", other.map(|(r, _)| r)),
    }
}

#[test]
fn test_self_dependency_is_a_cycle() {
    let mut activator = FeatureActivator::new();
    activator.add(SelfReferencingFeature);

    let err = resolve(&mut activator).unwrap_err();
    assert!(matches!(err, ConfigurationError::DependencyCycle { ref features } if features == &vec!["SelfReferencing".to_string()]));
}

feature!(GuardedFeature, "Guarded", |f| f
    .enable_by_default()
    .prerequisite(|context| context.settings.has_setting("Guard.Open"), "The guard has been opened"));
feature!(BehindGuardFeature, "BehindGuard", |f| f
    .enable_by_default()
    .depends_on::<GuardedFeature>());

#[test]
fn test_failed_prerequisite_is_reported_with_its_description() {
    let mut activator = FeatureActivator::new();
    activator.add(BehindGuardFeature);
    activator.add(GuardedFeature);

    let (report, components) = resolve(&mut activator).unwrap();

    assert_eq!(
        report.state("Guarded"),
        Some(&FeatureState::PrerequisitesNotMet {
            reasons: vec!["The guard has been opened".to_string()]
        })
    );
    assert_eq!(
        report.state("BehindGuard"),
        Some(&FeatureState::DependenciesNotMet {
            unmet: vec!["Guarded".to_string()]
        })
    );
    assert!(components.get::<SetupTrace>().is_none());

    let text = report.to_string();
    assert!(text.contains("prerequisites not met: The guard has been opened"));
}

#[test]
fn test_passing_prerequisite_activates() {
    let mut activator = FeatureActivator::new();
    activator.add(BehindGuardFeature);
    activator.add(GuardedFeature);

    let mut settings = SettingsHolder::new();
    settings.set("Guard.Open", true).unwrap();

    let (report, _) = resolve_with(&mut activator, settings).unwrap();
    assert_eq!(report.activation_order, vec!["Guarded", "BehindGuard"]);
}

feature!(ExtraFeature, "Extra", |_f| ());
feature!(EnablerFeature, "Enabler", |f| f
    .enable_by_default()
    .defaults(|settings| {
        settings.enable_feature_by_default("Extra");
        settings.set_default("Enabler.Mode", "fast")
    }));

#[test]
fn test_defaults_may_enable_other_features() {
    let mut activator = FeatureActivator::new();
    activator.add(ExtraFeature);
    activator.add(EnablerFeature);

    let mut pipeline = PipelineAssembler::new();
    let mut components = ComponentRegistry::new();
    let mut settings = SettingsHolder::new();
    let mut context = FeatureConfigurationContext::new(&mut settings, &mut pipeline, &mut components);
    let report = activator.setup_features(&mut context).unwrap();

    assert_eq!(report.activation_order, vec!["Enabler", "Extra"]);
    assert_eq!(settings.get::<String>("Enabler.Mode").unwrap().as_deref(), Some("fast"));
}

#[test]
fn test_defaults_of_inactive_features_are_not_applied() {
    let mut activator = FeatureActivator::new();
    activator.add(ExtraFeature);
    activator.add(EnablerFeature);

    let mut pipeline = PipelineAssembler::new();
    let mut components = ComponentRegistry::new();
    let mut settings = SettingsHolder::new();
    settings.disable_feature("Enabler");
    let mut context = FeatureConfigurationContext::new(&mut settings, &mut pipeline, &mut components);
    let report = activator.setup_features(&mut context).unwrap();

    assert!(report.activation_order.is_empty());
    assert!(!settings.has_setting("Enabler.Mode"));
}

struct FailingFeature;

impl Feature for FailingFeature {
    fn declare(&self, feature: &mut FeatureDeclaration) {
        feature.enable_by_default();
    }

    fn setup(&self, _context: &mut FeatureConfigurationContext<'_>) -> Result<()> {
        bail!("storage is unreachable")
    }
}

#[test]
fn test_setup_error_aborts_activation() {
    let mut activator = FeatureActivator::new();
    activator.add(FailingFeature);
    activator.add(BaseFeature);

    match resolve(&mut activator) {
        Err(ConfigurationError::FeatureSetup { feature, source }) => {
            assert_eq!(feature, "Failing");
            assert_eq!(source.to_string(), "storage is unreachable");
        }
        other => panic!("Expected FeatureSetup, got {:?}", other.map(|(r, _)| r)),
    }
}

struct RecordingTask {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl FeatureStartupTask for RecordingTask {
    async fn on_start(&self, _components: &ComponentRegistry) -> Result<()> {
        self.log.lock().unwrap().push(format!("start {}", self.name));
        Ok(())
    }

    async fn on_stop(&self, _components: &ComponentRegistry) -> Result<()> {
        self.log.lock().unwrap().push(format!("stop {}", self.name));
        Ok(())
    }
}

struct TaskFeature {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

struct DependentTaskFeature {
    log: Arc<Mutex<Vec<String>>>,
}

impl Feature for TaskFeature {
    fn declare(&self, feature: &mut FeatureDeclaration) {
        feature.enable_by_default().register_startup_task(RecordingTask {
            name: self.name,
            log: self.log.clone(),
        });
    }

    fn setup(&self, _context: &mut FeatureConfigurationContext<'_>) -> Result<()> {
        Ok(())
    }
}

impl Feature for DependentTaskFeature {
    fn declare(&self, feature: &mut FeatureDeclaration) {
        feature
            .enable_by_default()
            .depends_on::<TaskFeature>()
            .register_startup_task(RecordingTask {
                name: "dependent",
                log: self.log.clone(),
            });
    }

    fn setup(&self, _context: &mut FeatureConfigurationContext<'_>) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_startup_tasks_follow_activation_order() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut activator = FeatureActivator::new();
    activator.add(DependentTaskFeature { log: log.clone() });
    activator.add(TaskFeature {
        name: "first",
        log: log.clone(),
    });

    let (report, components) = resolve(&mut activator).unwrap();
    assert_eq!(report.feature("DependentTask").unwrap().startup_tasks, 1);

    let tasks = activator.startup_tasks();
    assert_eq!(tasks.len(), 2);

    tasks.start(&components).await.unwrap();
    tasks.stop(&components).await;

    assert_eq!(
        *log.lock().unwrap(),
        vec!["start first", "start dependent", "stop dependent", "stop first"]
    );
}

struct RefusingTask;

#[async_trait]
impl FeatureStartupTask for RefusingTask {
    async fn on_start(&self, _components: &ComponentRegistry) -> Result<()> {
        bail!("port already in use")
    }

    async fn on_stop(&self, _components: &ComponentRegistry) -> Result<()> {
        panic!("a task that never started must not be stopped")
    }
}

struct RefusingTaskFeature;

impl Feature for RefusingTaskFeature {
    fn declare(&self, feature: &mut FeatureDeclaration) {
        feature
            .enable_by_default()
            .depends_on::<TaskFeature>()
            .register_startup_task(RefusingTask);
    }

    fn setup(&self, _context: &mut FeatureConfigurationContext<'_>) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_failed_startup_stops_started_tasks() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut activator = FeatureActivator::new();
    activator.add(RefusingTaskFeature);
    activator.add(TaskFeature {
        name: "first",
        log: log.clone(),
    });

    let (_report, components) = resolve(&mut activator).unwrap();
    let tasks = activator.startup_tasks();

    let err = tasks.start(&components).await.unwrap_err();
    assert_eq!(err.root_cause().to_string(), "port already in use");
    assert_eq!(*log.lock().unwrap(), vec!["start first", "stop first"]);
}

feature!(LeftFeature, "Left", |f| f.enable_by_default().depends_on::<BaseFeature>());
feature!(RightFeature, "Right", |f| f.enable_by_default().depends_on::<BaseFeature>());
feature!(JoinFeature, "Join", |f| f
    .enable_by_default()
    .depends_on_at_least_one(["Left", "Right"])
    .depends_on::<TopFeature>());
feature!(OptionalUserFeature, "OptionalUser", |f| f
    .enable_by_default()
    .depends_on_optionally::<JoinFeature>());

fn add_by_index(activator: &mut FeatureActivator, index: usize) {
    match index {
        0 => activator.add(BaseFeature),
        1 => activator.add(MidFeature),
        2 => activator.add(TopFeature),
        3 => activator.add(LeftFeature),
        4 => activator.add(RightFeature),
        5 => activator.add(JoinFeature),
        _ => activator.add(OptionalUserFeature),
    };
}

const EDGES: &[(&str, &str)] = &[
    ("Mid", "Base"),
    ("Top", "Mid"),
    ("Left", "Base"),
    ("Right", "Base"),
    ("Join", "Left"),
    ("Join", "Right"),
    ("Join", "Top"),
    ("OptionalUser", "Join"),
];

proptest! {
    #[test]
    fn test_activation_order_respects_dependencies_for_any_registration_order(
        order in Just((0..7).collect::<Vec<usize>>()).prop_shuffle()
    ) {
        let mut activator = FeatureActivator::new();
        for index in order {
            add_by_index(&mut activator, index);
        }

        let (report, _) = resolve(&mut activator).unwrap();
        prop_assert_eq!(report.activation_order.len(), 7);

        for (dependent, dependency) in EDGES {
            let dependent_at = report.position(dependent).unwrap();
            let dependency_at = report.position(dependency).unwrap();
            prop_assert!(
                dependency_at < dependent_at,
                "{} activated before its dependency {}",
                dependent,
                dependency
            );
        }
    }
}

#[test]
fn test_optional_dependency_does_not_require_the_feature() {
    let mut activator = FeatureActivator::new();
    activator.add(OptionalUserFeature);

    let (report, _) = resolve(&mut activator).unwrap();
    assert!(report.is_active("OptionalUser"));
    assert!(report.feature("Root").is_none());
}
