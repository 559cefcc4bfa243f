//! `warren` is a resilient consumer layer, built on top of [`lapin`],
//! to make it easy to drain RabbitMQ queues with controlled parallelism.
//!
//! A [`ChannelPool`](crate::pool::ChannelPool) keeps a set of broker connections healthy and
//! hands out channels. A [`Consumer`](crate::consumers::Consumer) registers on one of them and
//! buffers deliveries; an [execution engine](crate::engines) drains that buffer through your
//! work function. [`RabbitService`](crate::service::RabbitService) wires all of it from
//! [`RabbitOptions`](crate::options::RabbitOptions).

pub mod amqp;
pub mod buffer;
pub mod consumers;
pub mod engines;
pub mod options;
pub mod pool;
pub mod service;
pub mod transport;
