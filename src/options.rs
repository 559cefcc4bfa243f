//! Configuration for the pool and for named consumers.
//!
//! All options are plain [`Deserialize`] structs: load them from whatever source your
//! application uses (files, environment, a configuration service) and hand them over.
//! They are read-only once a pool or a consumer has been built from them.
use crate::amqp::configuration::RabbitMqSettings;
use crate::buffer::FullMode;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_option_number_from_string;
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: u16 = 5;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

fn enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RabbitOptions {
    #[serde(default)]
    pub factory: FactoryOptions,
    #[serde(default)]
    pub pool: PoolOptions,
    /// Shared consumer settings, referenced by name from [`ConsumerOptions::global_settings`].
    #[serde(default)]
    pub global_consumer_options: HashMap<String, GlobalConsumerOptions>,
    /// Consumer settings, keyed by consumer name.
    #[serde(default)]
    pub consumers: HashMap<String, ConsumerOptions>,
}

impl RabbitOptions {
    /// Resolve the options of the consumer named `consumer_name`.
    ///
    /// Unset fields are filled from the referenced global settings, if any.
    /// Returns `None` if no consumer with that name is configured.
    pub fn consumer_options(&self, consumer_name: &str) -> Option<ConsumerOptions> {
        let mut options = self.consumers.get(consumer_name)?.clone();
        if options.consumer_name.is_empty() {
            options.consumer_name = consumer_name.to_owned();
        }
        if let Some(global) = options
            .global_settings
            .as_ref()
            .and_then(|name| self.global_consumer_options.get(name))
        {
            options.apply_global(global);
        }
        Some(options)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FactoryOptions {
    #[serde(default)]
    pub connection: RabbitMqSettings,
    /// Reconnect dead connections when no healthy one is left.
    #[serde(default = "enabled")]
    pub enable_auto_recovery: bool,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            connection: RabbitMqSettings::default(),
            enable_auto_recovery: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PoolOptions {
    /// How many broker connections the pool opens and multiplexes channels over.
    pub max_connections: usize,
    /// Upper bound for each of the two channel pools (plain and ack).
    pub max_channels: usize,
    /// Pause between two sweeps over the connections when none of them is healthy.
    pub sleep_on_error_interval_ms: u64,
    /// Sweeps over the connections before giving up with [`Error::Exhausted`].
    ///
    /// [`Error::Exhausted`]: crate::pool::Error::Exhausted
    pub max_recovery_attempts: u32,
    /// How long to wait for a pooled channel to be returned when the pool is at capacity.
    pub acquire_timeout_seconds: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            max_channels: 25,
            sleep_on_error_interval_ms: 1000,
            max_recovery_attempts: 5,
            acquire_timeout_seconds: 30,
        }
    }
}

impl PoolOptions {
    pub fn sleep_on_error_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_on_error_interval_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

/// Consumer settings that can be shared by several consumers.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct GlobalConsumerOptions {
    pub enabled: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    pub batch_size: Option<u16>,
    pub behavior_when_full: Option<FullMode>,
    pub auto_ack: Option<bool>,
    pub use_transient_channels: Option<bool>,
    pub no_local: Option<bool>,
    pub exclusive: Option<bool>,
    pub priority: Option<i32>,
    pub retry_interval_ms: Option<u64>,
    pub max_start_attempts: Option<u32>,
}

/// Settings of one named consumer.
///
/// Accessors return the effective value: the explicit setting, otherwise the built-in default.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConsumerOptions {
    /// Defaults to the key the consumer is configured under.
    #[serde(default)]
    pub consumer_name: String,
    pub queue_name: String,
    /// Name of a [`GlobalConsumerOptions`] entry to inherit unset fields from.
    pub global_settings: Option<String>,
    pub enabled: Option<bool>,
    /// Prefetch count, and capacity of the consumer buffer.
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    pub batch_size: Option<u16>,
    pub behavior_when_full: Option<FullMode>,
    pub auto_ack: Option<bool>,
    pub use_transient_channels: Option<bool>,
    pub no_local: Option<bool>,
    pub exclusive: Option<bool>,
    /// Consumer priority. See https://www.rabbitmq.com/consumer-priority.html.
    pub priority: Option<i32>,
    /// Pause between two attempts at registering with the broker.
    pub retry_interval_ms: Option<u64>,
    /// Give up starting after this many failed registrations. Unbounded when unset.
    pub max_start_attempts: Option<u32>,
}

impl ConsumerOptions {
    pub fn new(consumer_name: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            queue_name: queue_name.into(),
            ..Self::default()
        }
    }

    /// Fill every unset field from `global`.
    pub fn apply_global(&mut self, global: &GlobalConsumerOptions) {
        self.enabled = self.enabled.or(global.enabled);
        self.batch_size = self.batch_size.or(global.batch_size);
        self.behavior_when_full = self.behavior_when_full.or(global.behavior_when_full);
        self.auto_ack = self.auto_ack.or(global.auto_ack);
        self.use_transient_channels = self.use_transient_channels.or(global.use_transient_channels);
        self.no_local = self.no_local.or(global.no_local);
        self.exclusive = self.exclusive.or(global.exclusive);
        self.priority = self.priority.or(global.priority);
        self.retry_interval_ms = self.retry_interval_ms.or(global.retry_interval_ms);
        self.max_start_attempts = self.max_start_attempts.or(global.max_start_attempts);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Never zero: a zero-sized buffer could never hand anything over.
    pub fn batch_size(&self) -> u16 {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1)
    }

    pub fn behavior_when_full(&self) -> FullMode {
        self.behavior_when_full.unwrap_or_default()
    }

    pub fn auto_ack(&self) -> bool {
        self.auto_ack.unwrap_or(false)
    }

    pub fn use_transient_channels(&self) -> bool {
        self.use_transient_channels.unwrap_or(true)
    }

    pub fn no_local(&self) -> bool {
        self.no_local.unwrap_or(false)
    }

    pub fn exclusive(&self) -> bool {
        self.exclusive.unwrap_or(false)
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RETRY_INTERVAL)
    }
}
