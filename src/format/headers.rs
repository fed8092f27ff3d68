//! Listener handshake response headers.
//!
//! The HTTP request parser and status line live outside the core; this
//! module only contributes the headers the format layer needs on every
//! listener response, and decides which framing the listener gets.

use super::sender::Framing;

/// The bits of a listener request the format layer cares about.
#[derive(Debug, Default)]
pub struct ListenerRequest<'a> {
    /// `User-Agent` header, if present.
    pub user_agent: Option<&'a str>,
    /// Whether an `x-flash-version` header was present.
    pub x_flash_version: bool,
    /// Whether an `iceblocks:` header was present.
    pub iceblocks: bool,
    /// Whether `icy-metadata: 1` was sent.
    pub icy_metadata: bool,
}

/// Builds the response headers the core adds for a listener and selects
/// the wire framing. `interval` is the mount's advertised ICY period.
///
/// The returned block does not include the terminating empty line; the
/// response assembler owns that.
pub fn response_headers(req: &ListenerRequest<'_>, interval: usize) -> (String, Framing) {
    let mut headers = String::with_capacity(128);

    // flash player insists on a length, and reports itself as MSIE when
    // hosted in internet explorer
    let msie = req.user_agent.is_some_and(|ua| ua.contains("MSIE"));
    if req.x_flash_version || msie {
        headers.push_str("Content-Length: 221183499\r\n");
    }
    // keep browsers from caching the stream
    headers.push_str("Expires: Mon, 26 Jul 1997 05:00:00 GMT\r\n");
    headers.push_str("Pragma: no-cache\r\n");

    let framing = if req.iceblocks {
        headers.push_str("IceBlocks: 1.1\r\n");
        Framing::IceBlock
    } else if req.icy_metadata && interval > 0 {
        headers.push_str(&format!("icy-metaint:{interval}\r\n"));
        Framing::Icy
    } else {
        Framing::Raw
    };
    (headers, framing)
}
