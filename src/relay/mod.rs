//! Master/slave relaying: upstream connections, lifecycle and polling.

pub mod connection;
pub mod engine;
pub mod poller;
pub mod redirect;

use std::time::Duration;

pub use connection::{OpenOutcome, OpenRequest, UpstreamSource, open_relay};
pub use engine::{RelayContext, RelayEngine, RelayStarts};
pub use poller::{MasterPoller, RelayTemplate, StreamListParser};
pub use redirect::RedirectorRegistry;

/// One candidate upstream for a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMaster {
    /// Host name or address of the upstream server.
    pub host: String,
    /// Port to connect to.
    pub port: u16,
    /// Mount requested from the upstream.
    pub mount: String,
    /// Optional local address to bind before connecting.
    pub bind: Option<String>,
    /// Connect timeout for this master.
    pub timeout: Duration,
    /// Transient per-attempt flag; skipped masters are retried only
    /// after a reset.
    pub skip: bool,
}

impl RelayMaster {
    /// Creates a master candidate with the default 4 second timeout.
    pub fn new(host: &str, port: u16, mount: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            mount: mount.to_string(),
            bind: None,
            timeout: Duration::from_secs(4),
            skip: false,
        }
    }
}

/// Configuration and lifecycle state for one relay.
#[derive(Debug, Clone)]
pub struct Relay {
    /// Local mount this relay publishes under.
    pub localmount: String,
    /// Ordered upstream candidates; never empty.
    pub masters: Vec<RelayMaster>,
    /// Credentials sent to the upstream, if any.
    pub username: Option<String>,
    /// Password half of the credentials.
    pub password: Option<String>,
    /// Ask the upstream for inline metadata.
    pub mp3metadata: bool,
    /// Only connect while demand exists.
    pub on_demand: bool,
    /// Back-off before retrying after a failure.
    pub interval: Duration,
    /// Whether the relay should be live.
    pub running: bool,
    /// Set when the relay is being torn down for good.
    pub cleanup: bool,
    /// Index into `masters` of the upstream currently in use.
    pub in_use: Option<usize>,
    /// Replacement configuration installed by a diff pass, picked up on
    /// the next scheduler visit.
    pub new_details: Option<Box<Relay>>,
}

impl Relay {
    /// Creates a relay for `localmount` with the given candidates.
    pub fn new(localmount: &str, masters: Vec<RelayMaster>) -> Self {
        Self {
            localmount: localmount.to_string(),
            masters,
            username: None,
            password: None,
            mp3metadata: true,
            on_demand: false,
            interval: Duration::from_secs(30),
            running: true,
            cleanup: false,
            in_use: None,
            new_details: None,
        }
    }

    /// Deep copy of the configuration with run-state reset, as installed
    /// by the diff pass.
    pub fn copy_config(&self) -> Self {
        Self {
            localmount: self.localmount.clone(),
            masters: self
                .masters
                .iter()
                .map(|m| RelayMaster {
                    skip: false,
                    ..m.clone()
                })
                .collect(),
            username: self.username.clone(),
            password: self.password.clone(),
            mp3metadata: self.mp3metadata,
            on_demand: self.on_demand,
            interval: self.interval,
            running: true,
            cleanup: false,
            in_use: None,
            new_details: None,
        }
    }

    /// Compares against a candidate configuration. Differences in the
    /// master list or metadata setting require a restart; `on_demand` is
    /// reconciled in place without one.
    pub fn needs_restart(&mut self, candidate: &Relay) -> bool {
        let masters_match = self.masters.len() == candidate.masters.len()
            && self
                .masters
                .iter()
                .zip(&candidate.masters)
                .all(|(old, new)| {
                    old.mount == new.mount && old.host == new.host && old.port == new.port
                });
        if !masters_match || self.mp3metadata != candidate.mp3metadata {
            return true;
        }
        if self.on_demand != candidate.on_demand {
            self.on_demand = candidate.on_demand;
        }
        false
    }

    /// Clears every master's skip flag so the next cycle retries them
    /// all.
    pub fn reset_skips(&mut self) {
        for master in &mut self.masters {
            master.skip = false;
        }
        tracing::info!("servers to be retried on {}", self.localmount);
    }
}

/// Errors raised by the relay subsystem.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// TCP connect to a master failed or timed out.
    #[error("failed to connect to {host}:{port}")]
    ConnectFailed {
        /// Master host.
        host: String,
        /// Master port.
        port: u16,
    },

    /// The upstream response could not be used.
    #[error("error from relay request on {mount}: {detail}")]
    BadResponse {
        /// Local mount of the relay.
        mount: String,
        /// What the upstream said or did.
        detail: String,
    },

    /// More than the allowed number of redirects.
    #[error("redirect limit hit for {mount}")]
    RedirectLimit {
        /// Local mount of the relay.
        mount: String,
    },

    /// A redirect pointed outside plain http.
    #[error("redirect to unsupported location {location}")]
    OffsiteRedirect {
        /// The offending `Location:` value.
        location: String,
    },

    /// Every master candidate failed this cycle.
    #[error("no usable master for {mount}")]
    MastersExhausted {
        /// Local mount of the relay.
        mount: String,
    },

    /// The stream list fetch from the master failed.
    #[error("master streamlist failed: {reason}")]
    MasterPoll {
        /// Failure description.
        reason: String,
    },

    /// Socket level failure.
    #[error("relay I/O failed")]
    Io(#[from] std::io::Error),

    /// HTTP client failure while polling the master.
    #[error("master request failed")]
    Http(#[from] reqwest::Error),

    /// A redirect location failed to parse.
    #[error("bad redirect location")]
    UrlParse(#[from] url::ParseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_with_port(port: u16) -> Relay {
        Relay::new("/a", vec![RelayMaster::new("m1", port, "/live")])
    }

    #[test]
    fn identical_config_needs_no_restart() {
        let mut current = relay_with_port(8000);
        let candidate = relay_with_port(8000);
        assert!(!current.needs_restart(&candidate));
    }

    #[test]
    fn master_change_needs_restart() {
        let mut current = relay_with_port(8000);
        assert!(current.needs_restart(&relay_with_port(8001)));

        let mut extra = relay_with_port(8000);
        let mut candidate = relay_with_port(8000);
        candidate.masters.push(RelayMaster::new("m2", 8000, "/live"));
        assert!(extra.needs_restart(&candidate));
    }

    #[test]
    fn on_demand_is_reconciled_in_place() {
        let mut current = relay_with_port(8000);
        let mut candidate = relay_with_port(8000);
        candidate.on_demand = true;
        assert!(!current.needs_restart(&candidate));
        assert!(current.on_demand);
    }

    #[test]
    fn copy_config_resets_run_state() {
        let mut relay = relay_with_port(8000);
        relay.masters[0].skip = true;
        relay.running = false;
        relay.cleanup = true;
        relay.in_use = Some(0);

        let copy = relay.copy_config();
        assert!(!copy.masters[0].skip);
        assert!(copy.running);
        assert!(!copy.cleanup);
        assert!(copy.in_use.is_none());
    }
}
