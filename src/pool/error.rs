use crate::transport::TransportError;

/// Pool error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("No healthy connection available after {attempts} recovery attempt(s).")]
    Exhausted { attempts: u32 },
    #[error("The channel pool has been shut down.")]
    ShutDown,
    #[error("Channel {channel_id} is not available.")]
    ChannelUnavailable { channel_id: u64 },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Pool(String),
}

impl From<deadpool::managed::PoolError<Error>> for Error {
    fn from(err: deadpool::managed::PoolError<Error>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => e,
            err => Self::Pool(err.to_string()),
        }
    }
}
