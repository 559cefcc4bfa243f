//! Facilities to consume messages from a RabbitMq queue. Check out [`Consumer`] as a
//! starting point.
pub use consumer::{Consumer, ConsumerState};
pub use error::ConsumerError;
pub use received_data::{Disposition, ReceivedData};

mod consumer;
mod delivery;
mod error;
mod received_data;
