use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;


/// Configuration of the relay core. Bootstrap (files, CLI) is the embedding application's
///  business, this is just the plain data.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP and UDP are bound to the same address
    pub bind_addr: SocketAddr,

    /// must match the client's `CelesteNet-TeapotVersion` header exactly
    pub teapot_version: u32,
    /// the connection features this server supports, in order of preference
    pub connection_features: Vec<String>,
    /// If `true`, clients must present a name key (`#...`) that resolves through the identity
    ///  store. Otherwise the claimed name is used for anonymous play.
    pub authenticated_only: bool,
    /// `{reason}` is replaced with the ban's reason
    pub ban_message: String,
    pub max_name_length: usize,
    /// wall-clock limit for reading the teapot request and writing the response
    pub handshake_timeout: Duration,
    /// limit for each connection feature's handshake step
    pub feature_handshake_timeout: Duration,
    /// pause after the extended handshake before the session is created, giving anti-abuse
    ///  checks a chance to gather signals
    pub extended_handshake_settle: Duration,

    /// This is the largest UDP payload the server sends, and the limit it announces to clients.
    ///  Clients may negotiate it down but never up.
    ///
    /// The container ID byte is part of this size.
    pub max_datagram_size: usize,
    /// bytes per second per connection; datagram payload in excess is dropped
    pub udp_rate_cap: f64,
    /// bytes per second per connection; the stream channel is throttled in excess
    pub tcp_rate_cap: f64,
    /// how long a blocked TCP write may take before the connection is considered dead
    pub send_timeout: Duration,

    pub keepalive_interval: Duration,
    pub tcp_timeout: Duration,
    /// the datagram channel is unbound (falling back to TCP) after this much UDP silence
    pub udp_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub string_table_cleanup_interval: Duration,

    pub poller: PollerKind,
    pub string_table: StringTableConfig,
    pub pool: PoolConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 17230)),
            teapot_version: 1,
            connection_features: vec![crate::roles::handshaker::EXTENDED_HANDSHAKE_FEATURE.to_string()],
            authenticated_only: false,
            ban_message: "You're banned: {reason}".to_string(),
            max_name_length: 30,
            handshake_timeout: Duration::from_secs(5),
            feature_handshake_timeout: Duration::from_secs(5),
            extended_handshake_settle: Duration::ZERO,
            max_datagram_size: 1200,
            udp_rate_cap: 64.0 * 1024.0,
            tcp_rate_cap: 256.0 * 1024.0,
            send_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(1),
            tcp_timeout: Duration::from_secs(10),
            udp_timeout: Duration::from_secs(3),
            heartbeat_interval: Duration::from_millis(250),
            string_table_cleanup_interval: Duration::from_secs(15),
            poller: PollerKind::default(),
            string_table: StringTableConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size < 64 {
            bail!("max datagram size {} is too small", self.max_datagram_size);
        }
        if self.max_datagram_size > 65507 {
            bail!("max datagram size {} exceeds what UDP can carry", self.max_datagram_size);
        }
        if self.max_name_length == 0 {
            bail!("max name length must be positive");
        }
        if self.udp_rate_cap <= 0.0 || self.tcp_rate_cap <= 0.0 {
            bail!("rate caps must be positive");
        }
        if self.keepalive_interval >= self.tcp_timeout {
            bail!("keep-alive interval must be shorter than the TCP timeout, otherwise idle connections time out");
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be positive");
        }
        if self.connection_features.iter().any(|f| f.is_empty() || f.contains(',')) {
            bail!("connection feature names must be non-empty and must not contain ','");
        }

        self.string_table.validate()?;
        self.pool.validate()
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollerKind {
    /// edge-triggered OS multiplexer
    #[default]
    Mio,
    /// portable readiness through a pending one byte peek per connection
    Peek,
}


#[derive(Debug, Clone, Copy)]
pub struct StringTableConfig {
    /// number of reads after which a string is promoted
    pub promotion_threshold: u32,
    /// counters below this (after decay) are evicted on cleanup
    pub cleanup_floor: u32,
    pub max_promoted: usize,
    /// shorter strings are not worth mapping
    pub min_string_len: usize,
}

impl Default for StringTableConfig {
    fn default() -> Self {
        StringTableConfig {
            promotion_threshold: 32,
            cleanup_floor: 4,
            max_promoted: 4096,
            min_string_len: 4,
        }
    }
}

impl StringTableConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.promotion_threshold == 0 {
            bail!("string promotion threshold must be positive");
        }
        if self.cleanup_floor > self.promotion_threshold {
            bail!("string cleanup floor {} is above the promotion threshold {}", self.cleanup_floor, self.promotion_threshold);
        }
        Ok(())
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRange {
    pub min: usize,
    pub max: usize,
}

impl ThreadRange {
    pub const fn new(min: usize, max: usize) -> ThreadRange {
        ThreadRange { min, max }
    }

    pub const fn fixed(n: usize) -> ThreadRange {
        ThreadRange { min: n, max: n }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Threads shared by all roles. Every role gets at least its minimum, the rest is
    ///  distributed by activity.
    pub total_threads: usize,
    pub rebalance_interval: Duration,

    pub acceptor: ThreadRange,
    pub handshaker: ThreadRange,
    pub tcp_receiver: ThreadRange,
    pub udp_receiver: ThreadRange,
    pub tcp_sender: ThreadRange,
    pub udp_sender: ThreadRange,
    pub heartbeat: ThreadRange,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            total_threads: 16,
            rebalance_interval: Duration::from_secs(1),
            acceptor: ThreadRange::new(1, 2),
            handshaker: ThreadRange::new(1, 2),
            tcp_receiver: ThreadRange::new(1, 4),
            udp_receiver: ThreadRange::new(1, 2),
            tcp_sender: ThreadRange::new(1, 4),
            udp_sender: ThreadRange::new(1, 2),
            heartbeat: ThreadRange::fixed(1),
        }
    }
}

impl PoolConfig {
    pub fn all_ranges(&self) -> [(&'static str, ThreadRange); 7] {
        [
            ("acceptor", self.acceptor),
            ("handshaker", self.handshaker),
            ("tcp-receiver", self.tcp_receiver),
            ("udp-receiver", self.udp_receiver),
            ("tcp-sender", self.tcp_sender),
            ("udp-sender", self.udp_sender),
            ("heartbeat", self.heartbeat),
        ]
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut sum_min = 0;
        for (name, range) in self.all_ranges() {
            if range.min == 0 {
                bail!("role {} needs at least one thread", name);
            }
            if range.min > range.max {
                bail!("role {}: min threads {} > max threads {}", name, range.min, range.max);
            }
            sum_min += range.min;
        }
        if self.heartbeat.max != 1 {
            bail!("heartbeat role runs on exactly one thread");
        }
        if sum_min > self.total_threads {
            bail!("total thread budget {} is below the sum of all roles' minimums ({})", self.total_threads, sum_min);
        }
        if self.rebalance_interval.is_zero() {
            bail!("rebalance interval must be positive");
        }
        Ok(())
    }
}
