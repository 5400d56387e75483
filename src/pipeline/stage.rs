//! Stage trait and pipeline composition.
//!
//! A stage takes one item and returns zero or more outputs. Zero outputs
//! means "filtered out", more than one is fan-out. A [`Pipeline`] chains
//! stages so that each output of stage *k* is fed, one at a time and in
//! order, into stage *k+1*.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::StageError;

/// A single transformation step.
#[async_trait]
pub trait Stage<I, O>: Send + Sync {
    /// Stage name for logging and error reports.
    fn name(&self) -> &str;

    /// Process one item.
    async fn process(&self, item: I) -> Result<Vec<O>, StageError>;
}

// ── Closure stage ───────────────────────────────────────────────────

type StageFn<I, O> = Box<dyn Fn(I) -> BoxFuture<'static, Result<Vec<O>, StageError>> + Send + Sync>;

/// Stage built from an async closure.
pub struct FnStage<I, O> {
    name: String,
    f: StageFn<I, O>,
}

impl<I, O> FnStage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<O>, StageError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(move |item| f(item).boxed()),
        }
    }

    /// One-to-one synchronous mapping.
    pub fn map<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(I) -> O + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(name, move |item| {
            let f = Arc::clone(&f);
            async move { Ok(vec![f(item)]) }
        })
    }
}

impl<I> FnStage<I, I>
where
    I: Send + 'static,
{
    /// Keep items matching the predicate.
    pub fn filter<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&I) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        Self::new(name, move |item: I| {
            let predicate = Arc::clone(&predicate);
            async move { Ok(if predicate(&item) { vec![item] } else { Vec::new() }) }
        })
    }
}

#[async_trait]
impl<I, O> Stage<I, O> for FnStage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, item: I) -> Result<Vec<O>, StageError> {
        (self.f)(item).await
    }
}

// ── Composition ─────────────────────────────────────────────────────

/// Two stages run back to back.
struct Chain<I, M, O> {
    name: String,
    first: Box<dyn Stage<I, M>>,
    second: Box<dyn Stage<M, O>>,
}

#[async_trait]
impl<I, M, O> Stage<I, O> for Chain<I, M, O>
where
    I: Send + 'static,
    M: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, item: I) -> Result<Vec<O>, StageError> {
        let intermediate = self.first.process(item).await?;
        let mut outputs = Vec::with_capacity(intermediate.len());
        for next in intermediate {
            outputs.extend(self.second.process(next).await?);
        }
        Ok(outputs)
    }
}

/// Ordered composition of stages, from `I` to `O`.
///
/// A failure in any stage fails the whole pass for that input item; the
/// pipeline itself keeps no state between items or runs.
pub struct Pipeline<I, O> {
    head: Box<dyn Stage<I, O>>,
    stages: Vec<String>,
}

impl<I, O> Pipeline<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Single-stage pipeline.
    pub fn new(stage: impl Stage<I, O> + 'static) -> Self {
        let stages = vec![stage.name().to_string()];
        Self {
            head: Box::new(stage),
            stages,
        }
    }

    /// Append a stage.
    pub fn then<P>(self, stage: impl Stage<O, P> + 'static) -> Pipeline<I, P>
    where
        P: Send + 'static,
    {
        let mut stages = self.stages;
        stages.push(stage.name().to_string());
        Pipeline {
            head: Box::new(Chain {
                name: stages.join(" → "),
                first: self.head,
                second: Box::new(stage),
            }),
            stages,
        }
    }

    /// Append a boxed stage (for stages chosen at runtime).
    pub fn then_boxed(self, stage: Box<dyn Stage<O, O>>) -> Pipeline<I, O> {
        let mut stages = self.stages;
        stages.push(stage.name().to_string());
        Pipeline {
            head: Box::new(Chain {
                name: stages.join(" → "),
                first: self.head,
                second: stage,
            }),
            stages,
        }
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> &[String] {
        &self.stages
    }

    /// Run one item through every stage.
    pub async fn run(&self, item: I) -> Result<Vec<O>, StageError> {
        self.head.process(item).await
    }
}
