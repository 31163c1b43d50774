use crate::error::Error;

/// Configuration for the io_uring reactor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of SQ entries. CQ will be 4x this.
    pub sq_entries: u32,
    /// Maximum number of live sockets (accepted, connected, attached).
    pub max_connections: u32,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Enable TCP_NODELAY on accepted and outbound TCP sockets.
    pub tcp_nodelay: bool,
    /// Idle timeout in seconds assigned to new sockets. When it elapses with no
    /// activity the socket's `ping` callback fires. 0 disables pings.
    /// Default: 40.
    pub default_timeout: u8,
    /// Connect timeout in seconds used when a connect request passes 0.
    /// Must be non-zero. Default: 30.
    pub connect_timeout: u8,
    /// Housekeeping tick in milliseconds. Idle timeouts are checked once per
    /// tick, so this bounds how late a `ping` can fire.
    /// Default: 1000.
    pub tick_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sq_entries: 256,
            max_connections: 4096,
            backlog: 1024,
            tcp_nodelay: true,
            default_timeout: 40,
            connect_timeout: 30,
            tick_interval_ms: 1000,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.sq_entries == 0 || !self.sq_entries.is_power_of_two() {
            return Err(Error::Config(
                "sq_entries must be > 0 and a power of two".into(),
            ));
        }
        if self.max_connections == 0 || self.max_connections >= (1 << 24) {
            return Err(Error::Config(
                "max_connections must be > 0 and < 2^24".into(),
            ));
        }
        if self.backlog <= 0 {
            return Err(Error::Config("backlog must be > 0".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be > 0".into()));
        }
        if self.connect_timeout == 0 {
            return Err(Error::Config("connect_timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use ringbridge::ConfigBuilder;
///
/// let config = ConfigBuilder::default()
///     .max_connections(1024)
///     .sq_entries(512)
///     .default_timeout(10)
///     .build()
///     .expect("invalid config");
/// assert_eq!(config.default_timeout, 10);
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Socket settings ──────────────────────────────────────────────

    /// Set the maximum number of live sockets.
    pub fn max_connections(mut self, n: u32) -> Self {
        self.config.max_connections = n;
        self
    }

    /// Set the TCP listen backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.backlog = n;
        self
    }

    /// Enable or disable TCP_NODELAY.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    // ── Timeouts ─────────────────────────────────────────────────────

    /// Set the idle timeout (seconds) for new sockets. 0 disables pings.
    pub fn default_timeout(mut self, secs: u8) -> Self {
        self.config.default_timeout = secs;
        self
    }

    /// Set the fallback connect timeout (seconds). Must be > 0.
    pub fn connect_timeout(mut self, secs: u8) -> Self {
        self.config.connect_timeout = secs;
        self
    }

    /// Set the housekeeping tick in milliseconds.
    pub fn tick_interval_ms(mut self, ms: u64) -> Self {
        self.config.tick_interval_ms = ms;
        self
    }

    // ── io_uring settings ────────────────────────────────────────────

    /// Set the number of SQ entries. Must be a power of 2.
    pub fn sq_entries(mut self, n: u32) -> Self {
        self.config.sq_entries = n;
        self
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
