//! Periodic master stream-list polling.
//!
//! A slave asks its master for the list of available mounts and turns
//! each line into a relay candidate for the diff pass. The body is
//! parsed as it streams in, carrying partial line tails across chunks
//! with a hard cap so a misbehaving master cannot balloon memory.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;

use super::engine::RelayEngine;
use super::redirect::RedirectorRegistry;
use super::{Relay, RelayError, RelayMaster};
use crate::config::MasterConfig;

/// Longest partial line carried between body chunks.
const TAIL_CAP: usize = 200;

/// Connect timeout towards the master.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Whole-request ceiling for one stream-list fetch.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-relay settings stamped onto every mount the master lists.
#[derive(Debug, Clone)]
pub struct RelayTemplate {
    /// Master host the relays will pull from.
    pub server: String,
    /// Master port.
    pub port: u16,
    /// Optional bind address for upstream connections.
    pub bind: Option<String>,
    /// Whether discovered relays wait for demand.
    pub on_demand: bool,
    /// Retry interval for discovered relays.
    pub interval: Duration,
    /// Credentials forwarded to the master, when relay auth is on.
    pub credentials: Option<(String, String)>,
}

impl RelayTemplate {
    /// Builds the relay record for one stream-list line.
    fn relay_for_line(&self, line: &str) -> Relay {
        tracing::debug!("read from master \"{line}\"");
        let mut master = RelayMaster::new(&self.server, self.port, line);
        master.bind = self.bind.clone();

        // a listing like /admin/streams?mount=/x publishes locally as /x
        let localmount = match line.strip_prefix("/admin/streams?mount=") {
            Some(rest) if rest.starts_with('/') => rest,
            _ => line,
        };
        let mut relay = Relay::new(localmount, vec![master]);
        relay.mp3metadata = true;
        relay.on_demand = self.on_demand;
        relay.interval = self.interval;
        if let Some((user, pass)) = &self.credentials {
            relay.username = Some(user.clone());
            relay.password = Some(pass.clone());
        }
        relay
    }
}

/// Streaming parser for the line-oriented mount list.
#[derive(Debug)]
pub struct StreamListParser {
    template: RelayTemplate,
    tail: Vec<u8>,
    relays: Vec<Relay>,
}

impl StreamListParser {
    /// Creates a parser minting relays from `template`.
    pub fn new(template: RelayTemplate) -> Self {
        Self {
            template,
            tail: Vec::new(),
            relays: Vec::new(),
        }
    }

    /// Feeds one body chunk. Returns false when a line exceeded the tail
    /// cap and the response should be abandoned.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        for &byte in chunk {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.tail);
                self.accept_line(&line);
            } else {
                self.tail.push(byte);
                if self.tail.len() > TAIL_CAP {
                    tracing::warn!("long line received for append, ignoring");
                    self.tail.clear();
                    return false;
                }
            }
        }
        true
    }

    /// Completes parsing, dropping any unterminated tail.
    pub fn finish(self) -> Vec<Relay> {
        self.relays
    }

    fn accept_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');
        if line.starts_with('/') {
            self.relays.push(self.template.relay_for_line(line));
        } else if !line.is_empty() {
            tracing::debug!("skipping \"{line}\"");
        }
    }
}

/// Periodic stream-list fetcher for one configured master.
pub struct MasterPoller {
    cfg: MasterConfig,
    client: reqwest::Client,
    in_flight: AtomicBool,
}

impl MasterPoller {
    /// Creates a poller, or `None` when no master is configured.
    pub fn try_new(cfg: &MasterConfig) -> Option<Self> {
        if cfg.server.is_none() || cfg.password.is_none() || cfg.port == 0 {
            return None;
        }
        let mut builder = reqwest::Client::builder()
            .user_agent(cfg.server_id)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true);
        if let Some(bind) = cfg.bind.as_deref().and_then(|b| b.parse().ok()) {
            builder = builder.local_address(Some(bind));
        }
        Some(Self {
            cfg: cfg.clone(),
            client: builder.build().expect("HTTP client creation should not fail"),
            in_flight: AtomicBool::new(false),
        })
    }

    /// How often the master should be polled.
    pub fn update_interval(&self) -> Duration {
        self.cfg.update_interval
    }

    /// Marks a poll as started; false when one is already in flight.
    pub fn begin(&self) -> bool {
        !self.in_flight.swap(true, Ordering::SeqCst)
    }

    /// Marks the in-flight poll as finished.
    pub fn end(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }

    /// Fetches the master's stream list, falling back to the legacy
    /// text listing when the admin endpoint fails.
    ///
    /// # Errors
    /// - `RelayError::MasterPoll` - both endpoints failed or returned
    ///   non-OK responses.
    pub async fn fetch_stream_list(&self) -> Result<Vec<Relay>, RelayError> {
        tracing::debug!("checking master stream list");
        match self.fetch_listing("/admin/streams").await {
            Ok(relays) => Ok(relays),
            Err(e) => {
                tracing::info!("/admin/streams failed trying streamlist ({e})");
                self.fetch_listing("/admin/streamlist.txt").await
            }
        }
    }

    async fn fetch_listing(&self, path: &str) -> Result<Vec<Relay>, RelayError> {
        let url = self.listing_url(path);
        let mut request = self.client.get(&url);
        if let Some(pass) = self.cfg.password.as_ref() {
            request = request.basic_auth(&self.cfg.username, Some(pass));
        }
        let response = request.send().await?;
        if response.status().as_u16() != 200 {
            tracing::warn!("failed response from master \"{}\"", response.status());
            return Err(RelayError::MasterPoll {
                reason: format!("status {} from {url}", response.status()),
            });
        }

        let mut parser = StreamListParser::new(self.template());
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            if !parser.push(&chunk?) {
                return Err(RelayError::MasterPoll {
                    reason: "oversized line in stream list".to_string(),
                });
            }
        }
        Ok(parser.finish())
    }

    fn listing_url(&self, path: &str) -> String {
        let server = self.cfg.server.as_deref().unwrap_or_default();
        let (scheme, port) = match self.cfg.ssl_port {
            Some(ssl) => ("https", ssl),
            None => ("http", self.cfg.port),
        };
        let mut url = format!("{scheme}://{server}:{port}{path}");
        if self.cfg.redirect {
            // announce ourselves as a redirect peer while asking
            url.push_str(&format!(
                "?rserver={}&rport={}&interval={}",
                self.cfg.hostname,
                self.cfg.local_port,
                self.cfg.update_interval.as_secs()
            ));
        }
        url
    }

    fn template(&self) -> RelayTemplate {
        RelayTemplate {
            server: self.cfg.server.clone().unwrap_or_default(),
            port: self.cfg.port,
            bind: self.cfg.bind.clone(),
            on_demand: self.cfg.on_demand,
            interval: self.cfg.update_interval,
            credentials: if self.cfg.send_auth {
                self.cfg
                    .password
                    .as_ref()
                    .map(|p| (self.cfg.username.clone(), p.clone()))
            } else {
                None
            },
        }
    }
}

/// Kicks off one detached poll unless one is already running, feeding
/// the result into the master relay set.
pub fn spawn_update(poller: Arc<MasterPoller>, engine: Arc<RelayEngine>) {
    if !poller.begin() {
        return;
    }
    tokio::spawn(async move {
        match poller.fetch_stream_list().await {
            Ok(relays) => engine.update_master_relays(relays),
            Err(e) => tracing::warn!("stream list update failed: {e}"),
        }
        poller.end();
    });
}

/// Runs the periodic poll loop: refreshes the master's redirect entry
/// and kicks a stream-list update every interval. Abort the returned
/// handle to stop.
pub fn spawn_poll_loop(
    poller: Arc<MasterPoller>,
    engine: Arc<RelayEngine>,
    redirectors: Arc<RedirectorRegistry>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poller.update_interval());
        loop {
            ticker.tick().await;
            if poller.cfg.redirect {
                if let Some(server) = poller.cfg.server.as_deref() {
                    redirectors.touch_master(server, poller.cfg.port, poller.update_interval());
                }
            }
            spawn_update(Arc::clone(&poller), Arc::clone(&engine));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> RelayTemplate {
        RelayTemplate {
            server: "master.example".to_string(),
            port: 8000,
            bind: None,
            on_demand: true,
            interval: Duration::from_secs(120),
            credentials: Some(("relay".to_string(), "pw".to_string())),
        }
    }

    #[test]
    fn lines_become_relay_candidates() {
        let mut parser = StreamListParser::new(template());
        assert!(parser.push(b"/one\n/two\r\nnot-a-mount\n"));
        let relays = parser.finish();
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[0].localmount, "/one");
        assert_eq!(relays[1].localmount, "/two");
        assert_eq!(relays[0].masters[0].host, "master.example");
        assert_eq!(relays[0].masters[0].mount, "/one");
        assert_eq!(relays[0].masters[0].timeout, Duration::from_secs(4));
        assert!(relays[0].mp3metadata);
        assert!(relays[0].on_demand);
        assert_eq!(relays[0].username.as_deref(), Some("relay"));
    }

    #[test]
    fn partial_lines_are_carried_across_chunks() {
        let mut parser = StreamListParser::new(template());
        assert!(parser.push(b"/one\n/t"));
        assert!(parser.push(b"wo\n/three\n"));
        let mounts: Vec<String> = parser
            .finish()
            .into_iter()
            .map(|r| r.localmount)
            .collect();
        assert_eq!(mounts, ["/one", "/two", "/three"]);
    }

    #[test]
    fn admin_query_lines_map_to_plain_mounts() {
        let mut parser = StreamListParser::new(template());
        assert!(parser.push(b"/admin/streams?mount=/live\n"));
        let relays = parser.finish();
        assert_eq!(relays[0].localmount, "/live");
        // the upstream request still uses the full listing path
        assert_eq!(relays[0].masters[0].mount, "/admin/streams?mount=/live");
    }

    #[test]
    fn oversized_tail_abandons_the_response() {
        let mut parser = StreamListParser::new(template());
        assert!(parser.push(&[b'a'; TAIL_CAP]));
        assert!(!parser.push(&[b'a'; 1]));
    }

    #[test]
    fn unterminated_tail_is_dropped() {
        let mut parser = StreamListParser::new(template());
        assert!(parser.push(b"/kept\n/dropped-no-newline"));
        let relays = parser.finish();
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].localmount, "/kept");
    }

    #[test]
    fn poller_requires_full_master_config() {
        let mut cfg = MasterConfig::default();
        assert!(MasterPoller::try_new(&cfg).is_none());
        cfg.server = Some("master".to_string());
        assert!(MasterPoller::try_new(&cfg).is_none());
        cfg.password = Some("pw".to_string());
        assert!(MasterPoller::try_new(&cfg).is_some());
    }

    #[test]
    fn listing_url_uses_ssl_port_and_redirect_args() {
        let cfg = MasterConfig {
            server: Some("master".to_string()),
            password: Some("pw".to_string()),
            ssl_port: Some(8443),
            redirect: true,
            hostname: "slave.example".to_string(),
            local_port: 8100,
            ..MasterConfig::default()
        };
        let poller = MasterPoller::try_new(&cfg).unwrap();
        let url = poller.listing_url("/admin/streams");
        assert!(url.starts_with("https://master:8443/admin/streams?"));
        assert!(url.contains("rserver=slave.example"));
        assert!(url.contains("rport=8100"));
    }
}
