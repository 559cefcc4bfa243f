use crate::engines::EngineError;
use crate::transport::TransportError;

/// Consumer error.
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("No consumer named `{0}` is configured.")]
    UnknownConsumer(String),
    #[error("The consumer has not been started: it has no buffer to read from.")]
    BufferUnavailable,
    #[error("The consumer buffer is completed and drained: nothing can be read from it anymore.")]
    BufferCompleted,
    #[error("Another execution engine is already draining this consumer.")]
    EngineBusy,
    #[error("The consumer was stopped before it could start.")]
    StartAborted,
    #[error("Failed to register the consumer after {attempts} attempt(s).")]
    StartRetriesExhausted { attempts: u32 },
    #[error(transparent)]
    Pool(#[from] crate::pool::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}
