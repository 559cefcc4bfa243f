//! The [`lapin`]-backed transport: connection factory, connection and channel wrappers.

pub mod configuration;
pub mod convenience;
mod factory;
mod rabbit_mq;

pub use factory::ConnectionFactory;
pub use rabbit_mq::{LapinChannel, LapinConnection};

pub use lapin::{options, types, BasicProperties};
