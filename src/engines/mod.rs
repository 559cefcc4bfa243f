//! Execution engines: drain a stream of items through a user work function with bounded
//! parallelism.
//!
//! Two topologies are available, both built from an [`EngineBuilder`]:
//! - [`DataflowEngine`], a staged pipeline (pre-work, work, post-work) over an input buffer;
//! - [`ChannelBlockEngine`], a fixed pool of workers reading from a buffer. In direct mode the
//!   workers read straight from a consumer's own buffer.
//!
//! The work function returns `true` on success; what to do with that (ack, nack, retry) is up
//! to the work function itself or to the post-work hook. Engines never settle messages.
//!
//! ```rust
//! use warren::engines::{EngineBuilder, WorkEngine};
//!
//! # async fn example() {
//! let engine = EngineBuilder::new(|n: u32| async move { n % 2 == 0 })
//!     .max_degree_of_parallelism(4)
//!     .ensure_ordered(true)
//!     .post_work(|n, even| async move { println!("{n}: {even}") })
//!     .build_dataflow();
//!
//! for n in 0..10 {
//!     engine.enqueue(n).await.unwrap();
//! }
//! engine.complete();
//! engine.completion().await;
//! # }
//! ```
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::error;

mod channel_block;
mod dataflow;

pub use channel_block::ChannelBlockEngine;
pub use dataflow::DataflowEngine;

use crate::buffer::BufferReader;

pub const DEFAULT_MAX_DEGREE_OF_PARALLELISM: usize = 4;
pub const DEFAULT_BOUNDED_CAPACITY: usize = 1000;

/// Engine failures.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("The engine no longer accepts items.")]
    Closed,
    #[error("The engine reads directly from its source and cannot be fed items.")]
    DirectSource,
}

/// How a drain loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineOutcome {
    /// The source was exhausted and every item went through the engine.
    Completed,
    /// The drain loop was cancelled. Items still buffered were not processed.
    Cancelled,
}

/// A pool of workers items can be handed to.
#[async_trait::async_trait]
pub trait WorkEngine<T: Send + 'static>: Send + Sync {
    /// Hand `item` over, waiting for room if the engine is at capacity.
    async fn enqueue(&self, item: T) -> Result<(), EngineError>;

    /// No more items will be enqueued: finish the ones in flight and stop.
    fn complete(&self);

    /// Stop as soon as possible, abandoning items that were not picked up yet.
    fn cancel(&self);

    /// Resolves once the engine has stopped.
    async fn completion(&self);
}

type WorkFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, bool> + Send + Sync>;
type PreWorkFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, T> + Send + Sync>;
type PostWorkFn<T> = Arc<dyn Fn(T, bool) -> BoxFuture<'static, ()> + Send + Sync>;

/// The processing pipeline shared by every worker of an engine.
pub(crate) struct Stages<T> {
    work: WorkFn<T>,
    pre: Option<PreWorkFn<T>>,
    post: Option<PostWorkFn<T>>,
}

impl<T: Clone + Send + 'static> Stages<T> {
    /// Run the pre-work and work stages. `None` if the pre-work stage panicked.
    ///
    /// A panicking work function counts as a failure.
    pub(crate) async fn execute(&self, item: T) -> Option<(T, bool)> {
        let item = match &self.pre {
            Some(pre) => contain("pre-work", pre(item)).await?,
            None => item,
        };
        let success = contain("work", (self.work)(item.clone()))
            .await
            .unwrap_or(false);
        Some((item, success))
    }

    pub(crate) async fn finish(&self, item: T, success: bool) {
        if let Some(post) = &self.post {
            contain("post-work", post(item, success)).await;
        }
    }
}

async fn contain<F: Future>(stage: &'static str, future: F) -> Option<F::Output> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(output) => Some(output),
        Err(_) => {
            error!(stage, "engine stage panicked");
            None
        }
    }
}

/// Configures and builds an engine.
pub struct EngineBuilder<T> {
    stages: Stages<T>,
    max_degree_of_parallelism: usize,
    ensure_ordered: bool,
    bounded_capacity: usize,
}

impl<T: Clone + Send + Sync + 'static> EngineBuilder<T> {
    /// `work` is called once per item and returns `true` on success.
    pub fn new<F, Fut>(work: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self {
            stages: Stages {
                work: Arc::new(move |item| work(item).boxed()),
                pre: None,
                post: None,
            },
            max_degree_of_parallelism: DEFAULT_MAX_DEGREE_OF_PARALLELISM,
            ensure_ordered: true,
            bounded_capacity: DEFAULT_BOUNDED_CAPACITY,
        }
    }

    /// How many items are worked on concurrently. At least one.
    pub fn max_degree_of_parallelism(mut self, max_degree_of_parallelism: usize) -> Self {
        self.max_degree_of_parallelism = max_degree_of_parallelism.max(1);
        self
    }

    /// When `true`, post-work hooks observe items in input order even though the work itself
    /// runs concurrently.
    pub fn ensure_ordered(mut self, ensure_ordered: bool) -> Self {
        self.ensure_ordered = ensure_ordered;
        self
    }

    /// How many items the engine buffers before `enqueue` waits.
    pub fn bounded_capacity(mut self, bounded_capacity: usize) -> Self {
        self.bounded_capacity = bounded_capacity.max(1);
        self
    }

    /// Transform each item before it reaches the work function.
    pub fn pre_work<F, Fut>(mut self, pre_work: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.stages.pre = Some(Arc::new(move |item| pre_work(item).boxed()));
        self
    }

    /// Called with each item and the result of its work function.
    pub fn post_work<F, Fut>(mut self, post_work: F) -> Self
    where
        F: Fn(T, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stages.post = Some(Arc::new(move |item, success| post_work(item, success).boxed()));
        self
    }

    pub fn build_dataflow(self) -> DataflowEngine<T> {
        DataflowEngine::start(
            Arc::new(self.stages),
            self.max_degree_of_parallelism,
            self.ensure_ordered,
            self.bounded_capacity,
        )
    }

    pub fn build_channel_block(self) -> ChannelBlockEngine<T> {
        ChannelBlockEngine::start(
            Arc::new(self.stages),
            self.max_degree_of_parallelism,
            self.ensure_ordered,
            self.bounded_capacity,
        )
    }

    /// A [`ChannelBlockEngine`] whose workers read straight from `source`.
    ///
    /// The engine completes once `source` is completed and drained; it cannot be fed through
    /// [`WorkEngine::enqueue`]. The bounded capacity is that of `source`.
    pub fn build_direct(self, source: BufferReader<T>) -> ChannelBlockEngine<T> {
        ChannelBlockEngine::direct(
            Arc::new(self.stages),
            self.max_degree_of_parallelism,
            self.ensure_ordered,
            source,
        )
    }
}
