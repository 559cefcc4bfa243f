use super::{EngineError, Stages, WorkEngine};
use crate::buffer::{self, BufferReader, BufferWriter, FullMode};
use futures_util::{stream, Stream, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

/// A staged pipeline: items enqueued into a bounded input buffer go through the pre-work and
/// work stages on up to `max_degree_of_parallelism` tasks at once, then through the post-work
/// stage.
///
/// With `ensure_ordered`, post-work runs sequentially in input order; otherwise it runs as soon
/// as each item's work is done.
pub struct DataflowEngine<T> {
    input: BufferWriter<T>,
    cancelled: CancellationToken,
    stopped: CancellationToken,
}

impl<T: Clone + Send + Sync + 'static> DataflowEngine<T> {
    pub(super) fn start(
        stages: Arc<Stages<T>>,
        max_degree_of_parallelism: usize,
        ensure_ordered: bool,
        bounded_capacity: usize,
    ) -> Self {
        let (input, output) = buffer::bounded(bounded_capacity, FullMode::Wait);
        let cancelled = CancellationToken::new();
        let stopped = CancellationToken::new();

        let driver = {
            let cancelled = cancelled.clone();
            let stopped = stopped.clone();
            async move {
                if ensure_ordered {
                    drive_ordered(stages, output, max_degree_of_parallelism, &cancelled).await;
                } else {
                    drive_unordered(stages, output, max_degree_of_parallelism, &cancelled).await;
                }
                trace!("dataflow engine stopped");
                stopped.cancel();
            }
        };
        tokio::spawn(driver);

        Self {
            input,
            cancelled,
            stopped,
        }
    }
}

fn items<T>(output: BufferReader<T>) -> impl Stream<Item = T> {
    stream::unfold(output, |output| async move {
        let item = output.read().await?;
        Some((item, output))
    })
}

async fn drive_ordered<T: Clone + Send + Sync + 'static>(
    stages: Arc<Stages<T>>,
    output: BufferReader<T>,
    max_degree_of_parallelism: usize,
    cancelled: &CancellationToken,
) {
    let work = {
        let stages = Arc::clone(&stages);
        move |item: T| {
            let stages = Arc::clone(&stages);
            tokio::spawn(async move { stages.execute(item).await })
        }
    };
    let mut results = Box::pin(items(output).map(work).buffered(max_degree_of_parallelism));
    loop {
        tokio::select! {
            biased;
            _ = cancelled.cancelled() => break,
            result = results.next() => match result {
                Some(Ok(Some((item, success)))) => stages.finish(item, success).await,
                Some(Ok(None)) => {}
                Some(Err(e)) => error!(error = %e, "dataflow worker failed"),
                None => break,
            },
        }
    }
}

async fn drive_unordered<T: Clone + Send + Sync + 'static>(
    stages: Arc<Stages<T>>,
    output: BufferReader<T>,
    max_degree_of_parallelism: usize,
    cancelled: &CancellationToken,
) {
    let work = move |item: T| {
        let stages = Arc::clone(&stages);
        tokio::spawn(async move {
            if let Some((item, success)) = stages.execute(item).await {
                stages.finish(item, success).await;
            }
        })
    };
    let mut results = Box::pin(
        items(output)
            .map(work)
            .buffer_unordered(max_degree_of_parallelism),
    );
    loop {
        tokio::select! {
            biased;
            _ = cancelled.cancelled() => break,
            result = results.next() => match result {
                Some(Ok(())) => {}
                Some(Err(e)) => error!(error = %e, "dataflow worker failed"),
                None => break,
            },
        }
    }
}

#[async_trait::async_trait]
impl<T: Clone + Send + Sync + 'static> WorkEngine<T> for DataflowEngine<T> {
    async fn enqueue(&self, item: T) -> Result<(), EngineError> {
        if self.cancelled.is_cancelled() {
            return Err(EngineError::Closed);
        }
        self.input
            .write(item)
            .await
            .map(|_| ())
            .map_err(|_| EngineError::Closed)
    }

    fn complete(&self) {
        self.input.complete();
    }

    fn cancel(&self) {
        self.cancelled.cancel();
        self.input.complete();
    }

    async fn completion(&self) {
        self.stopped.cancelled().await;
    }
}
