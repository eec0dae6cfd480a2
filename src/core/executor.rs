//! Pipeline execution.
//!
//! A [`Pipeline`] is the frozen, ordered chain of steps produced by the
//! assembler. Each step receives the context and a [`Next`] continuation:
//! - behaviors keep the context variant and may skip `next` to stop the chain
//! - connectors build a child context of another variant and run the rest
//!   of the chain with it
//!
//! The executor holds no per-message state and performs no retries; errors
//! returned by a step travel back to the caller untouched.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::context::{ContextKind, PipelineContext};

/// Errors raised by the executor itself
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Expected a {expected} context but got a {actual} context")]
    UnexpectedContext {
        expected: ContextKind,
        actual: ContextKind,
    },
}

/// A step that works on a single context variant
#[async_trait]
pub trait Behavior: Send + Sync {
    /// The context variant this behavior works on
    fn stage(&self) -> ContextKind;

    async fn invoke(&self, context: &mut PipelineContext, next: Next<'_>) -> Result<()>;
}

/// A step that turns one context variant into another
#[async_trait]
pub trait Connector: Send + Sync {
    /// Variant consumed
    fn input_kind(&self) -> ContextKind;

    /// Variant handed to the rest of the chain
    fn output_kind(&self) -> ContextKind;

    async fn invoke(&self, context: &mut PipelineContext, next: Next<'_>) -> Result<()>;
}

/// What a frozen step executes
#[derive(Clone)]
pub enum StepBehavior {
    Behavior(Arc<dyn Behavior>),
    Connector(Arc<dyn Connector>),
}

impl StepBehavior {
    /// Variant the step expects to receive
    pub fn input_kind(&self) -> ContextKind {
        match self {
            Self::Behavior(behavior) => behavior.stage(),
            Self::Connector(connector) => connector.input_kind(),
        }
    }
}

/// A single frozen step
#[derive(Clone)]
pub struct PipelineStep {
    /// Step id
    pub id: String,

    /// Human-readable description
    pub description: String,

    /// Context variant this step receives
    pub stage: ContextKind,

    pub(crate) behavior: StepBehavior,
}

impl PipelineStep {
    pub fn is_connector(&self) -> bool {
        matches!(self.behavior, StepBehavior::Connector(_))
    }
}

impl fmt::Debug for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStep")
            .field("id", &self.id)
            .field("stage", &self.stage)
            .field("connector", &self.is_connector())
            .finish()
    }
}

/// Continuation handed to every step: the remainder of the chain
pub struct Next<'a> {
    steps: &'a [PipelineStep],
}

impl<'a> Next<'a> {
    /// Run the remainder of the chain. Reaching the end of the chain is a
    /// normal completion.
    pub fn run<'c>(self, context: &'c mut PipelineContext) -> BoxFuture<'c, Result<()>>
    where
        'a: 'c,
    {
        async move {
            let Some((step, rest)) = self.steps.split_first() else {
                return Ok(());
            };

            if context.kind() != step.stage {
                return Err(PipelineError::UnexpectedContext {
                    expected: step.stage,
                    actual: context.kind(),
                }
                .into());
            }

            debug!(step = %step.id, stage = %step.stage, "Invoking pipeline step");
            let next = Next { steps: rest };
            match &step.behavior {
                StepBehavior::Behavior(behavior) => behavior.invoke(context, next).await,
                StepBehavior::Connector(connector) => connector.invoke(context, next).await,
            }
        }
        .boxed()
    }

    /// Number of steps left in the chain
    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

/// Summary of a step for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct StepDescription {
    pub id: String,
    pub description: String,
    pub stage: ContextKind,
    pub connector: bool,
}

/// A frozen, shareable chain of steps
#[derive(Clone)]
pub struct Pipeline {
    root: ContextKind,
    steps: Arc<[PipelineStep]>,
}

impl Pipeline {
    pub(crate) fn new(root: ContextKind, steps: Vec<PipelineStep>) -> Self {
        Self {
            root,
            steps: steps.into(),
        }
    }

    /// Variant accepted by [`Pipeline::invoke`]
    pub fn root(&self) -> ContextKind {
        self.root
    }

    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    pub fn describe(&self) -> Vec<StepDescription> {
        self.steps
            .iter()
            .map(|step| StepDescription {
                id: step.id.clone(),
                description: step.description.clone(),
                stage: step.stage,
                connector: step.is_connector(),
            })
            .collect()
    }

    /// Run the whole chain for one message
    pub async fn invoke(&self, context: &mut PipelineContext) -> Result<()> {
        if context.kind() != self.root {
            return Err(PipelineError::UnexpectedContext {
                expected: self.root,
                actual: context.kind(),
            }
            .into());
        }

        Next { steps: &self.steps }.run(context).await
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("root", &self.root)
            .field("steps", &self.steps)
            .finish()
    }
}
