//! Centralized configuration for Aircast.
//!
//! All tunable parameters live here rather than as scattered literals.
//! Environment variable overrides allow runtime customization without a
//! rebuild.

use std::time::Duration;

/// Central configuration for all Aircast components.
#[derive(Debug, Clone, Default)]
pub struct AircastConfig {
    /// Per-mount stream handling settings.
    pub mount: MountConfig,
    /// Relay behaviour settings.
    pub relay: RelayConfig,
    /// Master server settings for slave operation.
    pub master: MasterConfig,
    /// Process-wide resource limits.
    pub limits: LimitsConfig,
}

/// Per-mount stream handling settings.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// ICY insert period advertised to listeners; None derives it from
    /// the upstream or the default.
    pub meta_interval: Option<usize>,
    /// Charset incoming tags are declared in; None means ISO-8859-1.
    pub charset: Option<String>,
    /// Target size of ingest blocks, sized near one MTU so many small
    /// upstream packets do not fan out as many small listener writes.
    pub queue_block_size: usize,
    /// Trailing unparsed bytes tolerated before a stream is declared
    /// not-audio and torn down.
    pub resync_discard_limit: usize,
    /// `StreamUrl` fallback published when the source sends none.
    pub stream_url: Option<String>,
    /// Byte cap on each mount's block queue.
    pub queue_bytes: usize,
}

impl MountConfig {
    /// Default ICY insert period. Shoutcast itself uses 8192; this is
    /// the interval most clients have seen from icecast servers.
    pub const DEFAULT_ICY_INTERVAL: usize = 16_000;
    /// Default ingest block size, near one MTU.
    pub const DEFAULT_BLOCK_SIZE: usize = 1400;
    /// Default resync discard ceiling.
    pub const DEFAULT_RESYNC_DISCARD: usize = 8_000;
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            meta_interval: None,
            charset: None,
            queue_block_size: Self::DEFAULT_BLOCK_SIZE,
            resync_discard_limit: Self::DEFAULT_RESYNC_DISCARD,
            stream_url: None,
            queue_bytes: 512 * 1024,
        }
    }
}

/// Relay behaviour settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// `User-Agent` presented to upstream servers.
    pub user_agent: &'static str,
    /// Relays allowed to be mid-connect at once.
    pub connect_cap: u32,
    /// Default retry back-off for configured relays.
    pub retry_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            user_agent: "aircast/0.1.0",
            connect_cap: 3,
            retry_interval: Duration::from_secs(30),
        }
    }
}

/// Master server settings for slave operation.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Master host; None disables polling.
    pub server: Option<String>,
    /// Master port.
    pub port: u16,
    /// TLS port for the stream-list fetch, when offered.
    pub ssl_port: Option<u16>,
    /// Username for the admin endpoints.
    pub username: String,
    /// Password for the admin endpoints; None disables polling.
    pub password: Option<String>,
    /// Forward our credentials to discovered relays.
    pub send_auth: bool,
    /// Local address to bind for master requests.
    pub bind: Option<String>,
    /// Discovered relays wait for demand.
    pub on_demand: bool,
    /// Poll period for the stream list.
    pub update_interval: Duration,
    /// Announce this server as a redirect peer while polling.
    pub redirect: bool,
    /// Our hostname, announced to the master for redirects.
    pub hostname: String,
    /// Our listener port, announced to the master for redirects.
    pub local_port: u16,
    /// Server identifier used as the poll user agent.
    pub server_id: &'static str,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            server: None,
            port: 8000,
            ssl_port: None,
            username: "relay".to_string(),
            password: None,
            send_auth: false,
            bind: None,
            on_demand: false,
            update_interval: Duration::from_secs(120),
            redirect: false,
            hostname: "localhost".to_string(),
            local_port: 8000,
            server_id: "aircast/0.1.0",
        }
    }
}

/// Process-wide resource limits.
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Concurrent sources allowed.
    pub source_limit: usize,
    /// Redirect peers tracked at most.
    pub max_redirects: usize,
    /// Cooperative worker tasks.
    pub workers: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            source_limit: 128,
            max_redirects: 10,
            workers: 2,
        }
    }
}

impl AircastConfig {
    /// Creates configuration with environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(interval) = std::env::var("AIRCAST_META_INTERVAL") {
            if let Ok(bytes) = interval.parse::<usize>() {
                config.mount.meta_interval = Some(bytes);
            }
        }
        if let Ok(limit) = std::env::var("AIRCAST_SOURCE_LIMIT") {
            if let Ok(count) = limit.parse::<usize>() {
                config.limits.source_limit = count;
            }
        }
        if let Ok(workers) = std::env::var("AIRCAST_WORKERS") {
            if let Ok(count) = workers.parse::<usize>() {
                config.limits.workers = count;
            }
        }
        if let Ok(interval) = std::env::var("AIRCAST_MASTER_INTERVAL") {
            if let Ok(seconds) = interval.parse::<u64>() {
                config.master.update_interval = Duration::from_secs(seconds);
            }
        }
        if let Ok(ceiling) = std::env::var("AIRCAST_RESYNC_DISCARD") {
            if let Ok(bytes) = ceiling.parse::<usize>() {
                config.mount.resync_discard_limit = bytes;
            }
        }
        config
    }

    /// Creates a configuration suited to tests: small intervals, tight
    /// limits.
    pub fn for_testing() -> Self {
        Self {
            mount: MountConfig {
                queue_block_size: 64,
                queue_bytes: 8 * 1024,
                ..MountConfig::default()
            },
            master: MasterConfig {
                update_interval: Duration::from_millis(100),
                ..MasterConfig::default()
            },
            limits: LimitsConfig {
                source_limit: 8,
                max_redirects: 4,
                workers: 1,
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = AircastConfig::default();
        assert_eq!(config.mount.queue_block_size, 1400);
        assert_eq!(config.mount.resync_discard_limit, 8_000);
        assert_eq!(MountConfig::DEFAULT_ICY_INTERVAL, 16_000);
        assert_eq!(config.relay.connect_cap, 3);
        assert_eq!(config.master.update_interval, Duration::from_secs(120));
        assert_eq!(config.limits.source_limit, 128);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("AIRCAST_SOURCE_LIMIT", "5");
            std::env::set_var("AIRCAST_MASTER_INTERVAL", "15");
            std::env::set_var("AIRCAST_RESYNC_DISCARD", "12000");
        }

        let config = AircastConfig::from_env();
        assert_eq!(config.limits.source_limit, 5);
        assert_eq!(config.master.update_interval, Duration::from_secs(15));
        assert_eq!(config.mount.resync_discard_limit, 12_000);

        unsafe {
            std::env::remove_var("AIRCAST_SOURCE_LIMIT");
            std::env::remove_var("AIRCAST_MASTER_INTERVAL");
            std::env::remove_var("AIRCAST_RESYNC_DISCARD");
        }
    }

    #[test]
    fn test_testing_preset() {
        let config = AircastConfig::for_testing();
        assert_eq!(config.limits.workers, 1);
        assert!(config.mount.queue_block_size < MountConfig::DEFAULT_BLOCK_SIZE);
    }
}
