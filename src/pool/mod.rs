//! Connection and channel pooling with health tracking and recovery.
//!
//! This module provides two key guarantees:
//! - Broken channels are disposed of and new ones are created on demand.
//! - Connections are reused across channels to limit overhead, and recovered when all of them
//!   are found unhealthy.
//!
//! ```rust,no_run
//! use warren::options::RabbitOptions;
//! use warren::pool::ChannelPool;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let pool = ChannelPool::from_options(RabbitOptions::default()).await?;
//!
//!     // A single-use channel, with publisher confirms.
//!     let transient = pool.get_transient_channel(true).await?;
//!     // A pooled channel: it goes back to the pool when dropped.
//!     let pooled = pool.get_channel().await?;
//!     assert_ne!(transient.id(), pooled.id());
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;
#[allow(clippy::module_inception)]
mod pool;

pub use channel::{ChannelHost, ChannelManager};
pub use connection::ConnectionHost;
pub use error::Error;
pub use pool::{ChannelPool, PooledChannel};
