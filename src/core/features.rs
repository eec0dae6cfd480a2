//! Feature activation.
//!
//! A feature is an independently activatable unit of capability. Each one
//! declares:
//! - whether it is enabled by default
//! - dependency groups (at least one member of every group must be active)
//! - prerequisites with human-readable descriptions
//! - default settings, applied only when the feature activates
//! - startup tasks, run once the endpoint has started
//!
//! [`FeatureActivator::setup_features`] resolves the declared graph once at
//! startup and returns an [`ActivationReport`].

use std::any::TypeId;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ConfigurationError;

use super::components::ComponentRegistry;
use super::pipeline::PipelineAssembler;
use super::settings::SettingsHolder;

const FEATURE_SUFFIX: &str = "Feature";

/// Name of the synthetic feature that is always active
pub const ROOT_FEATURE: &str = "Root";

/// A unit of capability activated at endpoint startup
pub trait Feature: Send + Sync + 'static {
    /// Declare dependencies, prerequisites, defaults and startup tasks
    fn declare(&self, feature: &mut FeatureDeclaration) {
        let _ = feature;
    }

    /// Wire pipeline steps and components. Runs at most once, after every
    /// dependency has been set up.
    fn setup(&self, context: &mut FeatureConfigurationContext<'_>) -> Result<()>;
}

/// Work started after the endpoint is up and stopped when it shuts down
#[async_trait]
pub trait FeatureStartupTask: Send + Sync {
    async fn on_start(&self, components: &ComponentRegistry) -> Result<()>;

    async fn on_stop(&self, components: &ComponentRegistry) -> Result<()> {
        let _ = components;
        Ok(())
    }
}

/// What a feature gets to work with during setup
pub struct FeatureConfigurationContext<'a> {
    pub settings: &'a mut SettingsHolder,
    pub pipeline: &'a mut PipelineAssembler,
    pub components: &'a mut ComponentRegistry,
}

impl<'a> FeatureConfigurationContext<'a> {
    pub fn new(
        settings: &'a mut SettingsHolder,
        pipeline: &'a mut PipelineAssembler,
        components: &'a mut ComponentRegistry,
    ) -> Self {
        Self {
            settings,
            pipeline,
            components,
        }
    }
}

/// Feature name for a type: last path segment without generics, with a
/// trailing `Feature` stripped
pub fn feature_name<F: ?Sized + 'static>() -> String {
    let full = std::any::type_name::<F>();
    let without_generics = full.split('<').next().unwrap_or(full);
    let short = without_generics.rsplit("::").next().unwrap_or(without_generics);

    match short.strip_suffix(FEATURE_SUFFIX) {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => short.to_string(),
    }
}

type PrerequisiteCheck = Box<dyn Fn(&FeatureConfigurationContext<'_>) -> bool + Send + Sync>;
type DefaultsAction = Box<dyn Fn(&mut SettingsHolder) -> Result<()> + Send + Sync>;

struct Prerequisite {
    description: String,
    condition: PrerequisiteCheck,
}

/// Declarations collected from [`Feature::declare`]
#[derive(Default)]
pub struct FeatureDeclaration {
    enabled_by_default: bool,
    dependencies: Vec<Vec<String>>,
    prerequisites: Vec<Prerequisite>,
    defaults: Vec<DefaultsAction>,
    startup_tasks: Vec<Arc<dyn FeatureStartupTask>>,
}

impl FeatureDeclaration {
    pub fn enable_by_default(&mut self) -> &mut Self {
        self.enabled_by_default = true;
        self
    }

    /// Require feature `T` to be active
    pub fn depends_on<T: Feature>(&mut self) -> &mut Self {
        self.depends_on_name(feature_name::<T>())
    }

    /// Require the named feature to be active
    pub fn depends_on_name(&mut self, feature: impl Into<String>) -> &mut Self {
        self.dependencies.push(vec![feature.into()]);
        self
    }

    /// Require at least one of the named features to be active
    pub fn depends_on_at_least_one<I, S>(&mut self, features: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let group: Vec<String> = features.into_iter().map(Into::into).collect();
        if !group.is_empty() {
            self.dependencies.push(group);
        }
        self
    }

    /// Activate after `T` when `T` is enabled, without requiring it
    pub fn depends_on_optionally<T: Feature>(&mut self) -> &mut Self {
        self.depends_on_optionally_name(feature_name::<T>())
    }

    pub fn depends_on_optionally_name(&mut self, feature: impl Into<String>) -> &mut Self {
        self.dependencies.push(vec![ROOT_FEATURE.to_string(), feature.into()]);
        self
    }

    /// Add a condition checked right before setup
    pub fn prerequisite<F>(&mut self, condition: F, description: impl Into<String>) -> &mut Self
    where
        F: Fn(&FeatureConfigurationContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.prerequisites.push(Prerequisite {
            description: description.into(),
            condition: Box::new(condition),
        });
        self
    }

    /// Register defaults applied when the feature activates
    pub fn defaults<F>(&mut self, action: F) -> &mut Self
    where
        F: Fn(&mut SettingsHolder) -> Result<()> + Send + Sync + 'static,
    {
        self.defaults.push(Box::new(action));
        self
    }

    pub fn register_startup_task<T: FeatureStartupTask + 'static>(&mut self, task: T) -> &mut Self {
        self.startup_tasks.push(Arc::new(task));
        self
    }
}

/// Outcome of resolution for one feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FeatureState {
    Active,
    Disabled,
    PrerequisitesNotMet { reasons: Vec<String> },
    DependenciesNotMet { unmet: Vec<String> },
}

impl FeatureState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for FeatureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Disabled => write!(f, "disabled"),
            Self::PrerequisitesNotMet { reasons } => {
                write!(f, "prerequisites not met: {}", reasons.join("; "))
            }
            Self::DependenciesNotMet { unmet } => {
                write!(f, "dependencies not met: {}", unmet.join(", "))
            }
        }
    }
}

/// Per-feature line of the activation report
#[derive(Debug, Clone, Serialize)]
pub struct FeatureDiagnostic {
    pub name: String,
    pub enabled_by_default: bool,
    pub dependencies: Vec<Vec<String>>,
    pub prerequisites: Vec<String>,
    pub startup_tasks: usize,
    pub state: FeatureState,
}

/// Result of feature resolution
#[derive(Debug, Clone, Serialize)]
pub struct ActivationReport {
    /// Names of active features, in the order their setup ran
    pub activation_order: Vec<String>,

    /// One entry per registered feature, in registration order
    pub features: Vec<FeatureDiagnostic>,

    pub resolved_at: DateTime<Utc>,
}

impl ActivationReport {
    pub fn feature(&self, name: &str) -> Option<&FeatureDiagnostic> {
        self.features.iter().find(|f| f.name == name)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.feature(name).map(|f| f.state.is_active()).unwrap_or(false)
    }

    pub fn state(&self, name: &str) -> Option<&FeatureState> {
        self.feature(name).map(|f| &f.state)
    }

    /// Position in the activation order, if the feature is active
    pub fn position(&self, name: &str) -> Option<usize> {
        self.activation_order.iter().position(|n| n == name)
    }
}

impl fmt::Display for ActivationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Features ({} active of {}):", self.activation_order.len(), self.features.len())?;
        for feature in &self.features {
            writeln!(f, "  {:<32} {}", feature.name, feature.state)?;
        }
        Ok(())
    }
}

/// Startup tasks of the active features, in activation order
#[derive(Clone, Default)]
pub struct FeatureStartupTasks {
    tasks: Vec<(String, Arc<dyn FeatureStartupTask>)>,
}

impl FeatureStartupTasks {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Start every task. The first failure aborts and stops the tasks
    /// already started, in reverse order.
    pub async fn start(&self, components: &ComponentRegistry) -> Result<()> {
        for (index, (feature, task)) in self.tasks.iter().enumerate() {
            debug!(feature = %feature, "Starting feature startup task");
            if let Err(e) = task.on_start(components).await {
                warn!(feature = %feature, error = %e, "Feature startup task failed to start");
                stop_tasks(&self.tasks[..index], components).await;
                return Err(e.context(format!("Startup task of feature {} failed", feature)));
            }
        }
        Ok(())
    }

    /// Stop every task in reverse order. Failures are logged so the other
    /// tasks still get stopped.
    pub async fn stop(&self, components: &ComponentRegistry) {
        stop_tasks(&self.tasks, components).await;
    }
}

async fn stop_tasks(tasks: &[(String, Arc<dyn FeatureStartupTask>)], components: &ComponentRegistry) {
    for (feature, task) in tasks.iter().rev() {
        if let Err(e) = task.on_stop(components).await {
            warn!(feature = %feature, error = %e, "Feature startup task failed to stop");
        }
    }
}

struct RootFeature;

impl Feature for RootFeature {
    fn setup(&self, _context: &mut FeatureConfigurationContext<'_>) -> Result<()> {
        Ok(())
    }
}

struct FeatureEntry {
    name: String,
    type_id: TypeId,
    feature: Box<dyn Feature>,
    declaration: FeatureDeclaration,
    state: Option<FeatureState>,
}

impl FeatureEntry {
    fn is_root(&self) -> bool {
        self.type_id == TypeId::of::<RootFeature>()
    }
}

/// Resolves which features activate and in which order
pub struct FeatureActivator {
    features: Vec<FeatureEntry>,
    activation_order: Vec<String>,
}

impl Default for FeatureActivator {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureActivator {
    pub fn new() -> Self {
        let mut activator = Self {
            features: Vec::new(),
            activation_order: Vec::new(),
        };
        activator.add(RootFeature);
        activator
    }

    /// Register a feature. Adding the same type twice keeps the first
    /// instance and returns `false`.
    pub fn add<F: Feature>(&mut self, feature: F) -> bool {
        let type_id = TypeId::of::<F>();
        if self.features.iter().any(|f| f.type_id == type_id) {
            debug!(feature = %feature_name::<F>(), "Feature already registered, ignoring");
            return false;
        }

        let mut declaration = FeatureDeclaration::default();
        feature.declare(&mut declaration);

        self.features.push(FeatureEntry {
            name: feature_name::<F>(),
            type_id,
            feature: Box::new(feature),
            declaration,
            state: None,
        });
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.features.iter().any(|f| f.name == name)
    }

    /// Registered feature names, in registration order
    pub fn feature_names(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter(|f| !f.is_root())
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Resolve and set up features. Runs once; later calls only rebuild the
    /// report.
    pub fn setup_features(
        &mut self,
        context: &mut FeatureConfigurationContext<'_>,
    ) -> Result<ActivationReport, ConfigurationError> {
        loop {
            let mut progressed = false;

            for index in 0..self.features.len() {
                if self.features[index].state.is_some()
                    || !self.is_enabled(index, context.settings)
                    || !self.dependencies_ready(index, context.settings)
                {
                    continue;
                }

                self.activate(index, context)?;
                progressed = true;
            }

            if progressed {
                continue;
            }

            // No progress: reject features with a group that can never be met.
            let mut rejected = false;
            for index in 0..self.features.len() {
                if self.features[index].state.is_some() || !self.is_enabled(index, context.settings) {
                    continue;
                }

                let unmet = self.unsatisfiable_dependencies(index, context.settings);
                if !unmet.is_empty() {
                    debug!(feature = %self.features[index].name, unmet = ?unmet, "Feature dependencies not met");
                    self.features[index].state = Some(FeatureState::DependenciesNotMet { unmet });
                    rejected = true;
                }
            }

            if rejected {
                continue;
            }

            let stuck: Vec<String> = (0..self.features.len())
                .filter(|&i| self.is_pending(i, context.settings))
                .map(|i| self.features[i].name.clone())
                .collect();

            if stuck.is_empty() {
                break;
            }

            return Err(ConfigurationError::DependencyCycle { features: stuck });
        }

        for entry in self.features.iter_mut().filter(|f| f.state.is_none()) {
            entry.state = Some(FeatureState::Disabled);
        }

        let report = self.report();
        info!(
            active = report.activation_order.len(),
            total = report.features.len(),
            "Feature activation completed"
        );
        Ok(report)
    }

    /// Build the report for the current state
    pub fn report(&self) -> ActivationReport {
        let features = self
            .features
            .iter()
            .filter(|f| !f.is_root())
            .map(|f| FeatureDiagnostic {
                name: f.name.clone(),
                enabled_by_default: f.declaration.enabled_by_default,
                dependencies: f.declaration.dependencies.clone(),
                prerequisites: f
                    .declaration
                    .prerequisites
                    .iter()
                    .map(|p| p.description.clone())
                    .collect(),
                startup_tasks: f.declaration.startup_tasks.len(),
                state: f.state.clone().unwrap_or(FeatureState::Disabled),
            })
            .collect();

        ActivationReport {
            activation_order: self
                .activation_order
                .iter()
                .filter(|name| name.as_str() != ROOT_FEATURE)
                .cloned()
                .collect(),
            features,
            resolved_at: Utc::now(),
        }
    }

    /// Startup tasks of active features, in activation order
    pub fn startup_tasks(&self) -> FeatureStartupTasks {
        let mut tasks = Vec::new();
        for name in &self.activation_order {
            if let Some(entry) = self.features.iter().find(|f| &f.name == name) {
                for task in &entry.declaration.startup_tasks {
                    tasks.push((name.clone(), task.clone()));
                }
            }
        }
        FeatureStartupTasks { tasks }
    }

    fn activate(
        &mut self,
        index: usize,
        context: &mut FeatureConfigurationContext<'_>,
    ) -> Result<(), ConfigurationError> {
        let entry = &mut self.features[index];

        let failed: Vec<String> = entry
            .declaration
            .prerequisites
            .iter()
            .filter(|p| !(p.condition)(&*context))
            .map(|p| p.description.clone())
            .collect();

        if !failed.is_empty() {
            debug!(feature = %entry.name, reasons = ?failed, "Feature prerequisites not met");
            entry.state = Some(FeatureState::PrerequisitesNotMet { reasons: failed });
            return Ok(());
        }

        for defaults in &entry.declaration.defaults {
            defaults(&mut *context.settings).map_err(|source| ConfigurationError::FeatureSetup {
                feature: entry.name.clone(),
                source,
            })?;
        }

        entry
            .feature
            .setup(context)
            .map_err(|source| ConfigurationError::FeatureSetup {
                feature: entry.name.clone(),
                source,
            })?;

        if !entry.is_root() {
            info!(feature = %entry.name, "Feature activated");
        }
        entry.state = Some(FeatureState::Active);
        self.activation_order.push(entry.name.clone());
        Ok(())
    }

    /// Explicit override, then a settings default, then the feature's own flag
    fn is_enabled(&self, index: usize, settings: &SettingsHolder) -> bool {
        let entry = &self.features[index];
        if entry.is_root() {
            return true;
        }
        settings
            .feature_enabled(&entry.name)
            .unwrap_or(entry.declaration.enabled_by_default)
    }

    fn is_pending(&self, index: usize, settings: &SettingsHolder) -> bool {
        self.features[index].state.is_none() && self.is_enabled(index, settings)
    }

    fn is_active(&self, name: &str) -> bool {
        self.features
            .iter()
            .any(|f| f.name == name && f.state.as_ref().map(FeatureState::is_active).unwrap_or(false))
    }

    fn is_pending_by_name(&self, name: &str, settings: &SettingsHolder) -> bool {
        self.features
            .iter()
            .position(|f| f.name == name)
            .map(|i| self.is_pending(i, settings))
            .unwrap_or(false)
    }

    /// Every group has an active member and none of its members is still
    /// waiting to be decided
    fn dependencies_ready(&self, index: usize, settings: &SettingsHolder) -> bool {
        self.features[index].declaration.dependencies.iter().all(|group| {
            group.iter().any(|name| self.is_active(name))
                && !group.iter().any(|name| self.is_pending_by_name(name, settings))
        })
    }

    /// Members of groups with no active and no pending member
    fn unsatisfiable_dependencies(&self, index: usize, settings: &SettingsHolder) -> Vec<String> {
        let mut unmet = Vec::new();
        let mut seen = HashSet::new();

        for group in &self.features[index].declaration.dependencies {
            let viable = group
                .iter()
                .any(|name| self.is_active(name) || self.is_pending_by_name(name, settings));

            if !viable {
                for name in group {
                    if name != ROOT_FEATURE && seen.insert(name.clone()) {
                        unmet.push(name.clone());
                    }
                }
            }
        }

        unmet
    }
}
