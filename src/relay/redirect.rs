//! Redirect peers for listener offloading.
//!
//! Peer slaves announce themselves through `rserver`/`rport`/`interval`
//! query parameters on their stream-list requests. Entries that are not
//! refreshed within their interval (plus a 10 second grace) are expired
//! inline during selection. When a mount is absent, a random live peer
//! is chosen to 302 the listener towards.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use rand::Rng;

/// Grace period beyond the announced interval before an entry expires.
const EXPIRY_GRACE: Duration = Duration::from_secs(10);

/// Smallest refresh interval a peer may announce.
const MIN_INTERVAL_SECS: u64 = 5;

#[derive(Debug)]
struct RedirectHost {
    server: String,
    port: u16,
    /// None for config-seeded entries, which never expire.
    next_update: Option<Instant>,
}

/// Registry of peer slaves eligible for listener redirects.
#[derive(Debug)]
pub struct RedirectorRegistry {
    hosts: RwLock<Vec<RedirectHost>>,
    max: usize,
}

impl RedirectorRegistry {
    /// Creates a registry holding at most `max` peers.
    pub fn new(max: usize) -> Self {
        Self {
            hosts: RwLock::new(Vec::new()),
            max,
        }
    }

    /// Adds a permanent entry from configuration.
    pub fn seed(&self, server: &str, port: u16) {
        let mut hosts = self.hosts.write().expect("redirector lock poisoned");
        if Self::find(&hosts, server, port).is_none() {
            tracing::info!("slave ({}) at {server}:{port} added", hosts.len() + 1);
            hosts.push(RedirectHost {
                server: server.to_string(),
                port,
                next_update: None,
            });
        }
    }

    /// Adds or refreshes a peer from its announced query parameters.
    /// Ignores announcements with missing or unusable values.
    pub fn touch_from_params(
        &self,
        rserver: Option<&str>,
        rport: Option<&str>,
        interval: Option<&str>,
    ) {
        let Some(server) = rserver else { return };
        let Some(port) = rport.and_then(|p| p.parse::<u16>().ok()).filter(|&p| p > 0) else {
            return;
        };
        let Some(interval) = interval
            .and_then(|i| i.parse::<u64>().ok())
            .filter(|&i| i >= MIN_INTERVAL_SECS)
        else {
            return;
        };
        self.touch(server, port, Duration::from_secs(interval));
    }

    /// Adds or refreshes a peer entry.
    pub fn touch(&self, server: &str, port: u16, interval: Duration) {
        let mut hosts = self.hosts.write().expect("redirector lock poisoned");
        match Self::find(&hosts, server, port) {
            Some(at) => {
                tracing::debug!("touch update on {server}:{port}");
                hosts[at].next_update = Some(Instant::now() + interval);
            }
            None if hosts.len() < self.max => {
                tracing::info!("slave ({}) at {server}:{port} added", hosts.len() + 1);
                hosts.push(RedirectHost {
                    server: server.to_string(),
                    port,
                    next_update: Some(Instant::now() + interval),
                });
            }
            None => {
                tracing::info!("redirect to slave limit reached ({}, {})", hosts.len(), self.max);
            }
        }
    }

    /// Extends a peer's lifetime by `interval`, seeding it first if
    /// needed. Used for the configured master when it doubles as a peer.
    pub fn touch_master(&self, server: &str, port: u16, interval: Duration) {
        {
            let mut hosts = self.hosts.write().expect("redirector lock poisoned");
            if let Some(at) = Self::find(&hosts, server, port) {
                let base = hosts[at].next_update.unwrap_or_else(Instant::now);
                hosts[at].next_update = Some(base + interval);
                return;
            }
        }
        tracing::info!("adding master {server}:{port}");
        self.seed(server, port);
    }

    /// Picks a random live peer and formats a redirect location for
    /// `mount`. Expired entries are collected on the way. Returns `None`
    /// when no peer is available.
    pub fn redirect_for(
        &self,
        mount: &str,
        query: Option<&str>,
        auth: Option<(&str, &str)>,
    ) -> Option<String> {
        let mut hosts = self.hosts.write().expect("redirector lock poisoned");
        let now = Instant::now();
        hosts.retain(|host| match host.next_update {
            Some(due) => {
                let live = due + EXPIRY_GRACE >= now;
                if !live {
                    tracing::info!("dropping redirector for {}:{}", host.server, host.port);
                }
                live
            }
            None => true,
        });
        if hosts.is_empty() {
            return None;
        }
        let which = rand::thread_rng().gen_range(0..hosts.len());
        let host = &hosts[which];
        tracing::info!(
            "redirecting listener to slave server at {}:{}",
            host.server,
            host.port
        );
        let credentials = match auth {
            Some((user, pass)) => format!("{user}:{pass}@"),
            None => String::new(),
        };
        let query = query.map(|q| format!("?{q}")).unwrap_or_default();
        Some(format!(
            "http://{credentials}{}:{}{mount}{query}",
            host.server, host.port
        ))
    }

    /// Drops every entry.
    pub fn clear_all(&self) {
        let mut hosts = self.hosts.write().expect("redirector lock poisoned");
        for host in hosts.drain(..) {
            tracing::info!("removing {}:{}", host.server, host.port);
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.hosts.read().expect("redirector lock poisoned").len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find(hosts: &[RedirectHost], server: &str, port: u16) -> Option<usize> {
        hosts
            .iter()
            .position(|h| h.server == server && h.port == port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_entries_never_expire() {
        let registry = RedirectorRegistry::new(4);
        registry.seed("peer", 8000);
        let location = registry.redirect_for("/live", None, None).unwrap();
        assert_eq!(location, "http://peer:8000/live");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn touch_params_are_validated() {
        let registry = RedirectorRegistry::new(4);
        registry.touch_from_params(None, Some("80"), Some("10"));
        registry.touch_from_params(Some("x"), None, Some("10"));
        registry.touch_from_params(Some("x"), Some("80"), Some("2")); // below minimum
        registry.touch_from_params(Some("x"), Some("0"), Some("10"));
        assert!(registry.is_empty());

        registry.touch_from_params(Some("x"), Some("80"), Some("30"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn capacity_limit_rejects_new_peers() {
        let registry = RedirectorRegistry::new(1);
        registry.touch("a", 1, Duration::from_secs(30));
        registry.touch("b", 2, Duration::from_secs(30));
        assert_eq!(registry.len(), 1);
        // refreshing the existing one still works
        registry.touch("a", 1, Duration::from_secs(60));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_entries_are_collected_during_selection() {
        let registry = RedirectorRegistry::new(4);
        registry.touch("gone", 1, Duration::from_secs(30));
        {
            let mut hosts = registry.hosts.write().unwrap();
            hosts[0].next_update = Some(Instant::now() - Duration::from_secs(60));
        }
        assert!(registry.redirect_for("/live", None, None).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn location_carries_auth_and_query() {
        let registry = RedirectorRegistry::new(4);
        registry.seed("peer", 9000);
        let location = registry
            .redirect_for("/live", Some("token=1"), Some(("user", "pw")))
            .unwrap();
        assert_eq!(location, "http://user:pw@peer:9000/live?token=1");
    }
}
