//! Pool configuration.
//!
//! A [`ConnectionProviderBuilder`] validates every argument as it is set and
//! freezes the result into an immutable [`PoolConfig`] when the provider is
//! built. Process-wide defaults come from a [`PoolDefaults`] value, which is
//! either passed in explicitly or read once from the environment.

use std::fmt;
use std::num::NonZeroUsize;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::error::{PoolError, Result};
use crate::lifecycle::Transport;
use crate::provider::ConnectionProvider;

/// Sentinel for [`ConnectionProviderBuilder::max_connections`] selecting an
/// elastic (unbounded) pool.
pub const MAX_CONNECTIONS_ELASTIC: i32 = -1;

/// Sentinel for [`ConnectionProviderBuilder::max_pending_acquire`] removing
/// the upper limit on the pending queue.
pub const MAX_PENDING_ACQUIRE_UNBOUNDED: i32 = -1;

/// Acquire timeout meaning "fail immediately, never wait".
pub const ACQUIRE_TIMEOUT_NEVER_WAIT: Duration = Duration::ZERO;

/// Environment variable overriding the default maximum connections.
pub const ENV_MAX_CONNECTIONS: &str = "NETPOOL_MAX_CONNECTIONS";

/// Environment variable overriding the default acquire timeout, in
/// milliseconds. `-1` means never wait.
pub const ENV_ACQUIRE_TIMEOUT_MS: &str = "NETPOOL_ACQUIRE_TIMEOUT_MS";

/// Default acquire timeout when no override is present.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(45_000);

/// An upper bound that may be disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Limit {
    /// No upper bound.
    Unbounded,
    /// A strictly positive upper bound.
    Bounded(NonZeroUsize),
}

impl Limit {
    /// Parse a raw value where `-1` means unbounded and any other value must
    /// be strictly positive.
    pub fn from_raw(value: i32, what: &str) -> Result<Self> {
        if value == -1 {
            return Ok(Self::Unbounded);
        }
        usize::try_from(value)
            .ok()
            .and_then(NonZeroUsize::new)
            .map(Self::Bounded)
            .ok_or_else(|| {
                PoolError::Configuration(format!(
                    "{what} value must be strictly positive or -1, got {value}"
                ))
            })
    }

    /// The bound, or `None` when unbounded.
    #[must_use]
    pub fn get(self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Bounded(n) => Some(n.get()),
        }
    }

    /// Check whether one more item fits when `current` are already counted.
    #[must_use]
    pub fn admits(self, current: usize) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Bounded(n) => current < n.get(),
        }
    }

    /// Check whether this limit is unbounded.
    #[must_use]
    pub fn is_unbounded(self) -> bool {
        matches!(self, Self::Unbounded)
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => f.write_str("unbounded"),
            Self::Bounded(n) => write!(f, "{n}"),
        }
    }
}

/// Process-wide defaults applied to new builders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolDefaults {
    /// Default maximum connections per destination.
    pub max_connections: Limit,
    /// Default acquire timeout.
    pub acquire_timeout: Duration,
}

static GLOBAL_DEFAULTS: Lazy<PoolDefaults> = Lazy::new(PoolDefaults::from_env);

impl Default for PoolDefaults {
    fn default() -> Self {
        Self {
            max_connections: Limit::Bounded(default_max_connections()),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl PoolDefaults {
    /// Defaults read from the process environment on first use.
    ///
    /// The environment is consulted once; later changes to the variables
    /// have no effect.
    #[must_use]
    pub fn global() -> Self {
        *GLOBAL_DEFAULTS
    }

    /// Read defaults from [`ENV_MAX_CONNECTIONS`] and [`ENV_ACQUIRE_TIMEOUT_MS`].
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read defaults through an arbitrary key lookup.
    ///
    /// Values that fail to parse are ignored with a warning and the built-in
    /// default is used instead.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut defaults = Self::default();

        if let Some(raw) = lookup(ENV_MAX_CONNECTIONS) {
            match raw
                .trim()
                .parse::<i32>()
                .map_err(|e| PoolError::Configuration(e.to_string()))
                .and_then(|v| Limit::from_raw(v, "max connections"))
            {
                Ok(limit) => defaults.max_connections = limit,
                Err(e) => tracing::warn!(
                    key = ENV_MAX_CONNECTIONS,
                    value = %raw,
                    error = %e,
                    "ignoring invalid pool default"
                ),
            }
        }

        if let Some(raw) = lookup(ENV_ACQUIRE_TIMEOUT_MS) {
            match parse_timeout_ms(&raw) {
                Ok(timeout) => defaults.acquire_timeout = timeout,
                Err(e) => tracing::warn!(
                    key = ENV_ACQUIRE_TIMEOUT_MS,
                    value = %raw,
                    error = %e,
                    "ignoring invalid pool default"
                ),
            }
        }

        defaults
    }
}

/// Milliseconds, or `-1` for [`ACQUIRE_TIMEOUT_NEVER_WAIT`].
fn parse_timeout_ms(raw: &str) -> Result<Duration> {
    match raw.trim().parse::<i64>() {
        Ok(-1) => Ok(ACQUIRE_TIMEOUT_NEVER_WAIT),
        Ok(ms) => u64::try_from(ms)
            .map(Duration::from_millis)
            .map_err(|_| PoolError::Configuration(format!("acquire timeout must be -1 or >= 0, got {ms}"))),
        Err(e) => Err(PoolError::Configuration(e.to_string())),
    }
}

/// `max(available parallelism, 8) * 2`.
fn default_max_connections() -> NonZeroUsize {
    let cpus = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
    NonZeroUsize::new(cpus.max(8) * 2).unwrap_or(NonZeroUsize::MIN)
}

/// Frozen configuration shared by every pool of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolConfig {
    name: String,
    max_connections: Limit,
    max_pending_acquire: Limit,
    acquire_timeout: Duration,
    max_idle_time: Option<Duration>,
    max_life_time: Option<Duration>,
    dispose_grace_period: Option<Duration>,
    eviction_interval: Option<Duration>,
}

impl PoolConfig {
    /// Provider name, attached to every log event.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum connections per destination.
    #[must_use]
    pub fn max_connections(&self) -> Limit {
        self.max_connections
    }

    /// Maximum queued acquisitions per destination.
    #[must_use]
    pub fn max_pending_acquire(&self) -> Limit {
        self.max_pending_acquire
    }

    /// How long a queued acquisition may wait. Zero means never wait.
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Maximum time a connection may stay idle.
    #[must_use]
    pub fn max_idle_time(&self) -> Option<Duration> {
        self.max_idle_time
    }

    /// Maximum total age of a connection.
    #[must_use]
    pub fn max_life_time(&self) -> Option<Duration> {
        self.max_life_time
    }

    /// Upper bound on how long disposal waits for in-use connections.
    #[must_use]
    pub fn dispose_grace_period(&self) -> Option<Duration> {
        self.dispose_grace_period
    }

    /// Check whether acquisitions fail instead of queueing.
    #[must_use]
    pub fn never_waits(&self) -> bool {
        self.acquire_timeout == ACQUIRE_TIMEOUT_NEVER_WAIT
    }

    /// Interval of the background eviction sweep, if eviction is enabled.
    ///
    /// Defaults to the smaller of the idle and life limits. There is no sweep
    /// when neither limit is set.
    #[must_use]
    pub fn eviction_interval(&self) -> Option<Duration> {
        let derived = match (self.max_idle_time, self.max_life_time) {
            (Some(idle), Some(life)) => Some(idle.min(life)),
            (Some(d), None) | (None, Some(d)) => Some(d),
            (None, None) => None,
        };
        derived
            .map(|d| self.eviction_interval.unwrap_or(d))
            .filter(|d| !d.is_zero())
    }
}

/// Builder for a pooled [`ConnectionProvider`].
///
/// Setters that take a raw bound validate it immediately and return an
/// error for values other than `-1` or a strictly positive integer.
///
/// # Example
///
/// ```rust,ignore
/// use std::time::Duration;
///
/// let provider = netpool::builder("upstream")
///     .max_connections(50)?
///     .max_pending_acquire(200)?
///     .acquire_timeout(Duration::from_secs(5))
///     .max_idle_time(Duration::from_secs(30))
///     .build(transport);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[must_use]
pub struct ConnectionProviderBuilder {
    config: PoolConfig,
}

impl ConnectionProviderBuilder {
    /// Create a builder seeded from the process-wide defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_defaults(name, PoolDefaults::global())
    }

    /// Create a builder seeded from explicit defaults.
    pub fn with_defaults(name: impl Into<String>, defaults: PoolDefaults) -> Self {
        let builder = Self {
            config: PoolConfig {
                name: name.into(),
                max_connections: defaults.max_connections,
                max_pending_acquire: Limit::Unbounded,
                acquire_timeout: defaults.acquire_timeout,
                max_idle_time: None,
                max_life_time: None,
                dispose_grace_period: None,
                eviction_interval: None,
            },
        };
        builder.apply_max_connections(defaults.max_connections)
    }

    /// Set the provider name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set how long a queued acquisition waits before failing.
    ///
    /// [`ACQUIRE_TIMEOUT_NEVER_WAIT`] makes acquisitions fail as soon as the
    /// pool is at capacity.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    /// Set the maximum connections per destination.
    ///
    /// [`MAX_CONNECTIONS_ELASTIC`] creates an elastic pool and also sets the
    /// acquire timeout to [`ACQUIRE_TIMEOUT_NEVER_WAIT`] and the pending queue
    /// to unbounded.
    pub fn max_connections(self, max: i32) -> Result<Self> {
        let limit = Limit::from_raw(max, "max connections")?;
        Ok(self.apply_max_connections(limit))
    }

    fn apply_max_connections(mut self, limit: Limit) -> Self {
        self.config.max_connections = limit;
        if limit.is_unbounded() {
            self.config.acquire_timeout = ACQUIRE_TIMEOUT_NEVER_WAIT;
            self.config.max_pending_acquire = Limit::Unbounded;
        }
        self
    }

    /// Set the maximum number of queued acquisitions per destination.
    ///
    /// [`MAX_PENDING_ACQUIRE_UNBOUNDED`] removes the limit.
    pub fn max_pending_acquire(mut self, max: i32) -> Result<Self> {
        self.config.max_pending_acquire = Limit::from_raw(max, "max pending acquire")?;
        Ok(self)
    }

    /// Close connections that stay idle longer than this.
    pub fn max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.config.max_idle_time = Some(max_idle_time);
        self
    }

    /// Close connections older than this, regardless of activity.
    pub fn max_life_time(mut self, max_life_time: Duration) -> Self {
        self.config.max_life_time = Some(max_life_time);
        self
    }

    /// Cap how long disposal waits for in-use connections to be released.
    ///
    /// Without a grace period, disposal completes only after every
    /// connection, including those still held by callers, has been released
    /// and closed. With one, disposal stops waiting for held connections
    /// once it elapses; they are still closed when released. Connections
    /// being opened or closed are always waited for.
    pub fn dispose_grace_period(mut self, grace: Duration) -> Self {
        self.config.dispose_grace_period = Some(grace);
        self
    }

    /// Run the eviction sweep at this interval instead of the smaller of
    /// the idle and life limits.
    ///
    /// Has no effect unless one of those limits is set.
    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.config.eviction_interval = Some(interval);
        self
    }

    /// The configuration as it would be frozen by [`build`](Self::build).
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Freeze the configuration.
    #[must_use]
    pub fn into_config(self) -> PoolConfig {
        self.config
    }

    /// Build a pooled provider using `transport` to open connections.
    pub fn build<T: Transport>(self, transport: T) -> ConnectionProvider<T> {
        ConnectionProvider::pooled(self.into_config(), transport)
    }
}
