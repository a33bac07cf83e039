use std::time::Duration;

use serde::Deserialize;

/// Sizing of one thread pool
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// Threads started up front and kept alive
    pub size: usize,
    /// Upper bound the pool grows to under sustained demand
    pub size_max: usize,
    /// Busy thread count at which a saturation warning is logged, 0 disables
    pub size_warn: usize,
    /// Threads above `size` that stay idle this long exit
    pub idle_timeout: Duration,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            size: 1,
            size_max: 4,
            size_warn: 0,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl ThreadPoolConfig {
    pub fn new(size: usize, size_max: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            size_max: size_max.max(size),
            ..Self::default()
        }
    }
}

/// Runtime settings of a communicator
///
/// All fields have defaults, so a partial document deserializes into a full
/// configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Delays in milliseconds before each successive retry. A leading `-1`
    /// disables retries.
    pub retry_intervals: Vec<i32>,
    /// Largest frame accepted or sent, in bytes
    pub message_size_max: usize,
    pub connect_timeout: Duration,
    /// Time a closing connection waits for its peer before giving up
    pub close_timeout: Duration,
    /// Default wait for a twoway reply, overridden per endpoint or reference
    pub invocation_timeout: Option<Duration>,
    /// Connections idle this long are closed gracefully
    pub connection_idle_time: Option<Duration>,
    /// Interval at which otherwise silent connections send a heartbeat
    pub connection_heartbeat: Option<Duration>,
    pub monitor_interval: Duration,
    /// Consecutive invocation timeouts after which a connection is dead
    pub timeouts_before_close: u32,
    pub batch_auto_flush: bool,
    /// Log unexpected connection failures as warnings
    pub warn_connections: bool,
    /// Log servant failures as warnings
    pub warn_dispatch: bool,
    /// Worker threads of the runtime driving socket I/O
    pub io_threads: usize,
    pub client_pool: ThreadPoolConfig,
    pub server_pool: ThreadPoolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_intervals: vec![0],
            message_size_max: 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(10),
            invocation_timeout: None,
            connection_idle_time: None,
            connection_heartbeat: None,
            monitor_interval: Duration::from_secs(1),
            timeouts_before_close: 3,
            batch_auto_flush: true,
            warn_connections: true,
            warn_dispatch: true,
            io_threads: 1,
            client_pool: ThreadPoolConfig::default(),
            server_pool: ThreadPoolConfig::default(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Retries are disabled entirely by a leading `-1`
    pub fn retries_enabled(&self) -> bool {
        !matches!(self.retry_intervals.first(), Some(-1) | None)
    }
}

/// Builder for a [`Config`]
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry_intervals(mut self, intervals: impl Into<Vec<i32>>) -> Self {
        self.config.retry_intervals = intervals.into();
        self
    }

    pub fn message_size_max(mut self, bytes: usize) -> Self {
        self.config.message_size_max = bytes;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    pub fn invocation_timeout(mut self, timeout: Duration) -> Self {
        self.config.invocation_timeout = Some(timeout);
        self
    }

    pub fn connection_idle_time(mut self, idle: Duration) -> Self {
        self.config.connection_idle_time = Some(idle);
        self
    }

    pub fn connection_heartbeat(mut self, interval: Duration) -> Self {
        self.config.connection_heartbeat = Some(interval);
        self
    }

    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.config.monitor_interval = interval;
        self
    }

    pub fn timeouts_before_close(mut self, count: u32) -> Self {
        self.config.timeouts_before_close = count;
        self
    }

    pub fn batch_auto_flush(mut self, enabled: bool) -> Self {
        self.config.batch_auto_flush = enabled;
        self
    }

    pub fn warn_connections(mut self, enabled: bool) -> Self {
        self.config.warn_connections = enabled;
        self
    }

    pub fn warn_dispatch(mut self, enabled: bool) -> Self {
        self.config.warn_dispatch = enabled;
        self
    }

    pub fn io_threads(mut self, threads: usize) -> Self {
        self.config.io_threads = threads.max(1);
        self
    }

    pub fn client_pool(mut self, pool: ThreadPoolConfig) -> Self {
        self.config.client_pool = pool;
        self
    }

    pub fn server_pool(mut self, pool: ThreadPoolConfig) -> Self {
        self.config.server_pool = pool;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
