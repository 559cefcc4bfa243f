use super::{EngineError, Stages, WorkEngine};
use crate::buffer::{self, BufferReader, BufferWriter, FullMode};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A fixed pool of `max_degree_of_parallelism` workers, each reading the next item from a
/// shared buffer and running it through every stage.
///
/// The buffer is either owned by the engine (fed through [`WorkEngine::enqueue`]) or, in direct
/// mode, the source handed to [`EngineBuilder::build_direct`](super::EngineBuilder::build_direct):
/// the engine then lives exactly as long as that source produces items.
pub struct ChannelBlockEngine<T> {
    input: Option<BufferWriter<T>>,
    cancelled: CancellationToken,
    stopped: CancellationToken,
}

/// Reads are serialized so that every item gets a sequence number in read order.
struct Dispatch<T> {
    source: BufferReader<T>,
    next_sequence: u64,
}

/// Completed items waiting for their predecessors before going through post-work.
struct Reorder<T> {
    next_sequence: u64,
    done: BTreeMap<u64, Option<(T, bool)>>,
}

impl<T: Clone + Send + Sync + 'static> ChannelBlockEngine<T> {
    pub(super) fn start(
        stages: Arc<Stages<T>>,
        max_degree_of_parallelism: usize,
        ensure_ordered: bool,
        bounded_capacity: usize,
    ) -> Self {
        let (input, source) = buffer::bounded(bounded_capacity, FullMode::Wait);
        Self::spawn(
            stages,
            max_degree_of_parallelism,
            ensure_ordered,
            source,
            Some(input),
        )
    }

    pub(super) fn direct(
        stages: Arc<Stages<T>>,
        max_degree_of_parallelism: usize,
        ensure_ordered: bool,
        source: BufferReader<T>,
    ) -> Self {
        Self::spawn(stages, max_degree_of_parallelism, ensure_ordered, source, None)
    }

    fn spawn(
        stages: Arc<Stages<T>>,
        max_degree_of_parallelism: usize,
        ensure_ordered: bool,
        source: BufferReader<T>,
        input: Option<BufferWriter<T>>,
    ) -> Self {
        let cancelled = CancellationToken::new();
        let stopped = CancellationToken::new();
        let dispatch = Arc::new(Mutex::new(Dispatch {
            source,
            next_sequence: 0,
        }));
        let reorder = ensure_ordered.then(|| {
            Arc::new(Mutex::new(Reorder {
                next_sequence: 0,
                done: BTreeMap::new(),
            }))
        });

        let workers: Vec<_> = (0..max_degree_of_parallelism)
            .map(|worker| {
                tokio::spawn(work(
                    worker,
                    Arc::clone(&stages),
                    Arc::clone(&dispatch),
                    reorder.clone(),
                    cancelled.clone(),
                ))
            })
            .collect();
        tokio::spawn({
            let stopped = stopped.clone();
            async move {
                futures_util::future::join_all(workers).await;
                trace!("channel block engine stopped");
                stopped.cancel();
            }
        });

        Self {
            input,
            cancelled,
            stopped,
        }
    }

    /// `true` if the engine reads from an external source.
    pub fn is_direct(&self) -> bool {
        self.input.is_none()
    }
}

async fn work<T: Clone + Send + Sync + 'static>(
    worker: usize,
    stages: Arc<Stages<T>>,
    dispatch: Arc<Mutex<Dispatch<T>>>,
    reorder: Option<Arc<Mutex<Reorder<T>>>>,
    cancelled: CancellationToken,
) {
    loop {
        let next = {
            let mut dispatch = dispatch.lock().await;
            let item = tokio::select! {
                biased;
                _ = cancelled.cancelled() => None,
                item = dispatch.source.read() => item,
            };
            item.map(|item| {
                let sequence = dispatch.next_sequence;
                dispatch.next_sequence += 1;
                (sequence, item)
            })
        };
        let Some((sequence, item)) = next else {
            trace!(worker, "worker exiting");
            return;
        };

        let outcome = stages.execute(item).await;
        match &reorder {
            None => {
                if let Some((item, success)) = outcome {
                    stages.finish(item, success).await;
                }
            }
            Some(reorder) => {
                let mut reorder = reorder.lock().await;
                reorder.done.insert(sequence, outcome);
                loop {
                    let next_sequence = reorder.next_sequence;
                    let Some(outcome) = reorder.done.remove(&next_sequence) else {
                        break;
                    };
                    reorder.next_sequence += 1;
                    if let Some((item, success)) = outcome {
                        stages.finish(item, success).await;
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<T: Clone + Send + Sync + 'static> WorkEngine<T> for ChannelBlockEngine<T> {
    async fn enqueue(&self, item: T) -> Result<(), EngineError> {
        let input = self.input.as_ref().ok_or(EngineError::DirectSource)?;
        if self.cancelled.is_cancelled() {
            return Err(EngineError::Closed);
        }
        input
            .write(item)
            .await
            .map(|_| ())
            .map_err(|_| EngineError::Closed)
    }

    /// In direct mode the engine completes with its source instead.
    fn complete(&self) {
        if let Some(input) = &self.input {
            input.complete();
        }
    }

    fn cancel(&self) {
        self.cancelled.cancel();
        if let Some(input) = &self.input {
            input.complete();
        }
    }

    async fn completion(&self) {
        self.stopped.cancelled().await;
    }
}
