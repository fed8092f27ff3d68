//! Shared fixtures for the end-to-end tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;

use aircast::format::ingest::StreamReader;
use aircast::format::sender::ClientChannel;

/// Reader serving canned chunks one `read_bytes` call at a time, then
/// reporting no data.
pub struct ChunkReader {
    chunks: VecDeque<Vec<u8>>,
}

impl ChunkReader {
    pub fn new<I: IntoIterator<Item = Vec<u8>>>(chunks: I) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
        }
    }
}

impl StreamReader for ChunkReader {
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut chunk) = self.chunks.pop_front() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.chunks.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

/// Channel accepting at most `cap` bytes per call, recording everything
/// it accepted.
pub struct RecordingChannel {
    pub sent: Vec<u8>,
    pub cap: usize,
}

impl RecordingChannel {
    pub fn new(cap: usize) -> Self {
        Self {
            sent: Vec::new(),
            cap,
        }
    }
}

impl ClientChannel for RecordingChannel {
    fn send_bufs(&mut self, bufs: &[&[u8]], skip: usize) -> io::Result<usize> {
        let mut room = self.cap;
        let mut to_skip = skip;
        let mut written = 0;
        for buf in bufs {
            if to_skip >= buf.len() {
                to_skip -= buf.len();
                continue;
            }
            let slice = &buf[to_skip..];
            to_skip = 0;
            let n = slice.len().min(room);
            self.sent.extend_from_slice(&slice[..n]);
            written += n;
            room -= n;
            if room == 0 {
                break;
            }
        }
        Ok(written)
    }
}

/// Builds one inline ICY metadata block: length byte plus the body
/// padded with zeros to a 16-byte multiple.
pub fn inline_block(body: &str) -> Vec<u8> {
    let len_byte = body.len() / 16 + 1;
    let mut block = vec![0u8; len_byte * 16 + 1];
    block[0] = len_byte as u8;
    block[1..=body.len()].copy_from_slice(body.as_bytes());
    block
}

/// Interleaves ICY metadata into `payload` every `interval` bytes: the
/// block at the boundary right after `meta_after` payload bytes carries
/// `meta`, every other boundary gets the empty marker.
pub fn icy_interleave(payload: &[u8], interval: usize, meta_after: usize, meta: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() * 2);
    let meta_boundary = next_boundary(meta_after, interval);
    let mut sent = 0;
    for chunk in payload.chunks(interval) {
        out.extend_from_slice(chunk);
        sent += chunk.len();
        if sent % interval == 0 {
            if sent == meta_boundary {
                out.extend_from_slice(meta);
            } else {
                out.push(0);
            }
        }
    }
    out
}

fn next_boundary(after: usize, interval: usize) -> usize {
    after.div_ceil(interval).max(1) * interval
}

/// Splits an ICY-framed listener stream back into payload and metadata
/// inserts, checking the byte-exact cadence as it goes.
pub fn split_icy(stream: &[u8], interval: usize) -> (Vec<u8>, Vec<Vec<u8>>) {
    let mut payload = Vec::new();
    let mut inserts = Vec::new();
    let mut at = 0;
    loop {
        let take = interval.min(stream.len() - at);
        payload.extend_from_slice(&stream[at..at + take]);
        at += take;
        if at >= stream.len() {
            break;
        }
        let len_byte = stream[at] as usize;
        let end = at + 1 + len_byte * 16;
        assert!(end <= stream.len(), "truncated metadata insert at {at}");
        inserts.push(stream[at..end].to_vec());
        at = end;
    }
    (payload, inserts)
}
