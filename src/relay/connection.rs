//! Upstream relay connections.
//!
//! Opens the HTTP/1.0 exchange against a master, follows plain-http 302
//! redirects up to a fixed limit, and hands back a non-blocking source
//! the ingest can read. Runs on a detached task because DNS and connect
//! block; everything after the handshake is non-blocking.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use url::Url;

use super::{RelayError, RelayMaster};
use crate::format::ingest::StreamReader;

/// Redirects followed before the attempt is abandoned.
const MAX_REDIRECTS: usize = 10;

/// Upper bound on one response header block.
const HEADER_MAX: usize = 4096;

/// Everything a detached open task needs, snapshotted from the relay.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Local mount, for logging.
    pub localmount: String,
    /// Master candidates with their current skip flags.
    pub masters: Vec<RelayMaster>,
    /// Basic-auth credentials, if configured.
    pub credentials: Option<(String, String)>,
    /// Whether to request inline metadata.
    pub mp3metadata: bool,
    /// `User-Agent` presented to the upstream.
    pub user_agent: String,
}

/// Result of one open attempt across the master list.
#[derive(Debug)]
pub struct OpenOutcome {
    /// The established upstream, if any master worked.
    pub upstream: Option<UpstreamSource>,
    /// Index of the master that produced the connection.
    pub in_use: Option<usize>,
    /// Masters that failed and should be skipped until a reset.
    pub skipped: Vec<usize>,
}

/// An established upstream stream plus the response facts the source
/// needs.
#[derive(Debug)]
pub struct UpstreamSource {
    stream: TcpStream,
    leftover: BytesMut,
    /// Inline metadata period announced by the upstream; 0 when absent.
    pub icy_metaint: usize,
    /// Content type of the stream.
    pub content_type: String,
}

impl StreamReader for UpstreamSource {
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.leftover.is_empty() {
            let n = self.leftover.len().min(buf.len());
            buf[..n].copy_from_slice(&self.leftover.split_to(n));
            return Ok(n);
        }
        match self.stream.try_read(buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed",
            )),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// Tries each non-skipped master in order until one produces a running
/// upstream. Failed masters are reported for skip-marking rather than
/// mutated here, so the caller applies them under the relay lock.
pub async fn open_relay(req: &OpenRequest) -> OpenOutcome {
    let mut outcome = OpenOutcome {
        upstream: None,
        in_use: None,
        skipped: Vec::new(),
    };
    for (at, master) in req.masters.iter().enumerate() {
        if master.skip {
            tracing::info!(
                "skipping {}:{} for {}",
                master.host,
                master.port,
                req.localmount
            );
            continue;
        }
        match open_relay_connection(req, master).await {
            Ok(upstream) => {
                outcome.upstream = Some(upstream);
                outcome.in_use = Some(at);
                return outcome;
            }
            Err(e) => {
                tracing::warn!(
                    "problem starting relay on {} ({}:{}{}): {e}",
                    req.localmount,
                    master.host,
                    master.port,
                    master.mount
                );
                outcome.skipped.push(at);
            }
        }
    }
    outcome
}

/// Opens one master, following redirects.
///
/// # Errors
/// - `RelayError::ConnectFailed` - TCP connect or DNS failed.
/// - `RelayError::RedirectLimit` - more than the allowed redirects.
/// - `RelayError::OffsiteRedirect` - a redirect left plain http.
/// - `RelayError::BadResponse` - non-OK response or unparsable headers.
pub async fn open_relay_connection(
    req: &OpenRequest,
    master: &RelayMaster,
) -> Result<UpstreamSource, RelayError> {
    let mut host = master.host.clone();
    let mut port = master.port;
    let mut mount = master.mount.clone();

    let auth_header = req.credentials.as_ref().map(|(user, pass)| {
        tracing::debug!("using username {user} for {}", req.localmount);
        format!(
            "Authorization: Basic {}\r\n",
            BASE64.encode(format!("{user}:{pass}"))
        )
    });

    for _ in 0..MAX_REDIRECTS {
        match master.bind.as_deref() {
            Some(bind) => tracing::info!(
                "connecting to {host}:{port} for {}, bound to {bind}",
                req.localmount
            ),
            None => tracing::info!("connecting to {host}:{port} for {}", req.localmount),
        }
        let mut stream = connect(&host, port, master.bind.as_deref(), master.timeout).await?;

        let request = format!(
            "GET {mount} HTTP/1.0\r\nUser-Agent: {}\r\nHost: {host}\r\n{}{}\r\n",
            req.user_agent,
            if req.mp3metadata { "Icy-MetaData: 1\r\n" } else { "" },
            auth_header.as_deref().unwrap_or(""),
        );
        tokio::io::AsyncWriteExt::write_all(&mut stream, request.as_bytes()).await?;

        let (status, headers, leftover) =
            tokio::time::timeout(master.timeout, read_response(&mut stream, &req.localmount))
                .await
                .map_err(|_| RelayError::BadResponse {
                    mount: req.localmount.clone(),
                    detail: "header read timed out".to_string(),
                })??;
        if status == 302 {
            let location =
                headers
                    .get("location")
                    .cloned()
                    .ok_or_else(|| RelayError::BadResponse {
                        mount: req.localmount.clone(),
                        detail: "302 without location".to_string(),
                    })?;
            tracing::info!("redirect received {location}");
            let target = Url::parse(&location)?;
            if target.scheme() != "http" {
                return Err(RelayError::OffsiteRedirect { location });
            }
            host = target
                .host_str()
                .ok_or_else(|| RelayError::BadResponse {
                    mount: req.localmount.clone(),
                    detail: "redirect without host".to_string(),
                })?
                .to_string();
            port = target.port().unwrap_or(80);
            mount = if target.path().is_empty() {
                "/".to_string()
            } else {
                target.path().to_string()
            };
            continue;
        }
        if status != 200 {
            return Err(RelayError::BadResponse {
                mount: req.localmount.clone(),
                detail: format!("status {status}"),
            });
        }
        let icy_metaint = headers
            .get("icy-metaint")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let content_type = headers
            .get("content-type")
            .cloned()
            // old upstreams without a content type are MP3 audio
            .unwrap_or_else(|| "audio/mpeg".to_string());
        return Ok(UpstreamSource {
            stream,
            leftover,
            icy_metaint,
            content_type,
        });
    }
    Err(RelayError::RedirectLimit {
        mount: req.localmount.clone(),
    })
}

/// Resolves and connects with a per-master timeout, optionally binding
/// a local address first.
async fn connect(
    host: &str,
    port: u16,
    bind: Option<&str>,
    timeout: Duration,
) -> Result<TcpStream, RelayError> {
    let connect_failed = || RelayError::ConnectFailed {
        host: host.to_string(),
        port,
    };
    let addr = tokio::time::timeout(timeout, lookup_host((host, port)))
        .await
        .map_err(|_| connect_failed())?
        .map_err(|_| connect_failed())?
        .next()
        .ok_or_else(connect_failed)?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|_| connect_failed())?;
    if let Some(bind) = bind {
        let local: SocketAddr = format!("{bind}:0").parse().map_err(|_| connect_failed())?;
        socket.bind(local).map_err(|_| connect_failed())?;
    }
    tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| connect_failed())?
        .map_err(|_| connect_failed())
}

/// Reads the response head, returning the status, lowercased headers and
/// any body bytes that arrived with it.
async fn read_response(
    stream: &mut TcpStream,
    mount: &str,
) -> Result<(u16, HashMap<String, String>, BytesMut), RelayError> {
    let bad = |detail: &str| RelayError::BadResponse {
        mount: mount.to_string(),
        detail: detail.to_string(),
    };
    let mut buf = BytesMut::with_capacity(1024);
    let head_end = loop {
        if let Some(at) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break at;
        }
        if buf.len() >= HEADER_MAX {
            return Err(bad("response header too large"));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(bad("connection closed reading header"));
        }
    };
    let leftover = buf.split_off(head_end + 4);
    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();

    let mut lines = head.split("\r\n");
    let status_line = lines.next().ok_or_else(|| bad("empty response"))?;
    // both "HTTP/1.x 200 OK" and "ICY 200 OK" shapes appear in the wild
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| bad("unparsable status line"))?;

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok((status, headers, leftover))
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;

    async fn one_shot_server(response: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut sink = [0u8; 1024];
            let _ = stream.read(&mut sink).await;
            stream.write_all(response).await.unwrap();
        });
        addr
    }

    fn request_for(addr: SocketAddr) -> OpenRequest {
        OpenRequest {
            localmount: "/local".to_string(),
            masters: vec![RelayMaster::new(&addr.ip().to_string(), addr.port(), "/live")],
            credentials: None,
            mp3metadata: true,
            user_agent: "aircast/0.1.0".to_string(),
        }
    }

    #[tokio::test]
    async fn ok_response_yields_an_upstream() {
        let addr = one_shot_server(
            b"HTTP/1.0 200 OK\r\nContent-Type: audio/mpeg\r\nicy-metaint: 8192\r\n\r\nPAYLOAD",
        )
        .await;
        let req = request_for(addr);
        let outcome = open_relay(&req).await;
        assert_eq!(outcome.in_use, Some(0));
        assert!(outcome.skipped.is_empty());
        let mut upstream = outcome.upstream.unwrap();
        assert_eq!(upstream.icy_metaint, 8192);
        assert_eq!(upstream.content_type, "audio/mpeg");
        // body bytes that arrived with the header are not lost
        let mut buf = [0u8; 16];
        let n = upstream.read_bytes(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"PAYLOAD");
    }

    #[tokio::test]
    async fn non_ok_marks_master_skipped() {
        let addr = one_shot_server(b"HTTP/1.0 404 Not Found\r\n\r\n").await;
        let req = request_for(addr);
        let outcome = open_relay(&req).await;
        assert!(outcome.upstream.is_none());
        assert_eq!(outcome.skipped, vec![0]);
    }

    #[tokio::test]
    async fn skip_flag_excludes_a_master() {
        let addr = one_shot_server(b"HTTP/1.0 200 OK\r\n\r\n").await;
        let mut req = request_for(addr);
        req.masters[0].skip = true;
        let outcome = open_relay(&req).await;
        assert!(outcome.upstream.is_none());
        assert!(outcome.skipped.is_empty());
    }

    #[tokio::test]
    async fn redirect_is_followed_to_the_peer() {
        let peer = one_shot_server(b"HTTP/1.0 200 OK\r\n\r\n").await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut sink = [0u8; 1024];
            let _ = stream.read(&mut sink).await;
            let response =
                format!("HTTP/1.0 302 Found\r\nLocation: http://{peer}/live\r\n\r\n");
            stream.write_all(response.as_bytes()).await.unwrap();
        });

        let req = request_for(addr);
        let outcome = open_relay(&req).await;
        assert_eq!(outcome.in_use, Some(0));
        assert!(outcome.upstream.is_some());
    }

    #[tokio::test]
    async fn https_redirect_is_refused() {
        let addr =
            one_shot_server(b"HTTP/1.0 302 Found\r\nLocation: https://x:1/live\r\n\r\n").await;
        let req = request_for(addr);
        let err = open_relay_connection(&req, &req.masters[0]).await;
        assert!(matches!(err, Err(RelayError::OffsiteRedirect { .. })));
    }

    #[tokio::test]
    async fn redirect_loop_stops_at_the_limit() {
        // a server that always redirects back to itself
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let response = format!(
                    "HTTP/1.0 302 Found\r\nLocation: http://{addr}/live\r\n\r\n"
                );
                let mut sink = [0u8; 1024];
                let _ = stream.read(&mut sink).await;
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        let req = request_for(addr);
        let err = open_relay_connection(&req, &req.masters[0]).await;
        assert!(matches!(err, Err(RelayError::RedirectLimit { .. })));
    }

    #[tokio::test]
    async fn refused_connection_fails_cleanly() {
        // bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let req = request_for(addr);
        let err = open_relay_connection(&req, &req.masters[0]).await;
        assert!(matches!(err, Err(RelayError::ConnectFailed { .. })));
    }
}
