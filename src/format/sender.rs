//! Per-listener write paths.
//!
//! A listener consumes a mount's blocks at its own pace through one of
//! three framings: the raw stream, Shoutcast-style interleaved metadata,
//! or length-prefixed iceblocks. Sends are non-blocking and gathered;
//! partial writes are routine and every path keeps enough cursor state to
//! resume mid-metadata without breaking the framing.

use std::io;
use std::sync::Arc;

use tokio::net::TcpStream;

use super::mpeg::MpegSync;
use crate::buffer::{MetaUpdate, StreamBlock};

/// Largest raw burst sent to one listener per tick.
const SEND_BURST_MAX: usize = 2900;

/// Baseline delay added to every write tick, milliseconds.
const TICK_DELAY_MS: u64 = 4;
/// Extra delay after a short payload write.
const SHORT_WRITE_DELAY_MS: u64 = 50;
/// Extra delay after a short metadata write.
const META_STALL_DELAY_MS: u64 = 150;

/// Non-blocking gathered send towards one listener.
///
/// `skip` is how many bytes of the vector were already delivered by
/// earlier calls; implementations send from that point. A return of
/// `Ok(0)` means the socket would block.
pub trait ClientChannel {
    /// Sends as much of `bufs[skip..]` as the socket accepts.
    ///
    /// # Errors
    /// Any error other than `WouldBlock` drops the listener.
    fn send_bufs(&mut self, bufs: &[&[u8]], skip: usize) -> io::Result<usize>;
}

impl ClientChannel for TcpStream {
    fn send_bufs(&mut self, bufs: &[&[u8]], skip: usize) -> io::Result<usize> {
        let mut slices = Vec::with_capacity(bufs.len());
        let mut to_skip = skip;
        for buf in bufs {
            if to_skip >= buf.len() {
                to_skip -= buf.len();
                continue;
            }
            slices.push(io::IoSlice::new(&buf[to_skip..]));
            to_skip = 0;
        }
        if slices.is_empty() {
            return Ok(0);
        }
        match self.try_write_vectored(&slices) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// Wire framing selected at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Plain stream, metadata never transmitted.
    Raw,
    /// Shoutcast inline metadata every `interval` payload bytes.
    Icy,
    /// Length-prefixed blocks with in-band metadata updates.
    IceBlock,
}

/// Result of one write tick.
#[derive(Debug)]
pub struct WriteOutcome {
    /// Bytes accepted by the socket, metadata included.
    pub written: usize,
    /// Requested delay before the next tick, milliseconds.
    pub delay_ms: u64,
    /// True once the current block is fully delivered.
    pub done: bool,
}

/// Writer state for one listener.
#[derive(Debug)]
pub struct ListenerSender {
    framing: Framing,
    interval: usize,
    since_meta_block: usize,
    metadata_offset: usize,
    assoc: Option<Arc<MetaUpdate>>,
    in_metadata: bool,
    using_blank: bool,
    pos: usize,
    sync: Option<MpegSync>,
}

impl ListenerSender {
    /// Creates writer state. `interval` is only meaningful for ICY
    /// framing; pass 0 to disable inserts.
    pub fn new(framing: Framing, interval: usize) -> Self {
        let interval = if framing == Framing::Icy { interval } else { 0 };
        Self {
            framing,
            interval,
            since_meta_block: 0,
            metadata_offset: 0,
            assoc: None,
            in_metadata: false,
            using_blank: false,
            pos: 0,
            sync: None,
        }
    }

    /// Attaches per-listener frame state so joins mid-queue can be
    /// aligned; used for MPEG/AAC mounts.
    pub fn with_frame_sync(mut self, peer: &str) -> Self {
        let mut sync = MpegSync::new(peer);
        sync.require_frames(1);
        self.sync = Some(sync);
        self
    }

    /// Metadata update last delivered to this listener.
    pub fn associated(&self) -> Option<&Arc<MetaUpdate>> {
        self.assoc.as_ref()
    }

    /// Whether the listener is mid-way through a metadata block.
    pub fn in_metadata(&self) -> bool {
        self.in_metadata
    }

    /// Whether the cached update is the blank singleton.
    pub fn using_blank(&self) -> bool {
        self.using_blank
    }

    /// Picks the starting offset within the first block this listener
    /// receives: blocks flagged frame-aligned start at 0, others are
    /// scanned for the first frame header.
    pub fn attach_offset(&mut self, block: &StreamBlock) -> usize {
        if block.frame_aligned {
            return 0;
        }
        match self.sync.as_ref().and_then(|s| s.frame_offset(&block.data)) {
            Some(at) => at,
            None => block.data.len(),
        }
    }

    /// Delivers as much of `block` as the socket accepts, honouring the
    /// listener's framing. Call repeatedly with the same block until the
    /// outcome reports `done`, then move to the next block.
    ///
    /// # Errors
    /// Propagates fatal socket errors; the caller drops the listener.
    pub fn write_block(
        &mut self,
        block: &StreamBlock,
        chan: &mut dyn ClientChannel,
    ) -> io::Result<WriteOutcome> {
        match self.framing {
            Framing::IceBlock => self.write_iceblock(block, chan),
            _ => self.write_stream(block, chan),
        }
    }

    /// Raw and ICY framing share this path; ICY switches into metadata
    /// emission every `interval` payload bytes.
    fn write_stream(
        &mut self,
        block: &StreamBlock,
        chan: &mut dyn ClientChannel,
    ) -> io::Result<WriteOutcome> {
        if self.in_metadata || (self.interval > 0 && self.since_meta_block == self.interval) {
            return self.send_icy_metadata(block, chan);
        }

        let mut len = block.data.len() - self.pos;
        if self.interval > 0 {
            len = len.min(self.interval - self.since_meta_block);
        }
        len = len.min(SEND_BURST_MAX);

        let mut delay_ms = TICK_DELAY_MS;
        let mut written = 0;
        if len > 0 {
            written = chan.send_bufs(&[&block.data[self.pos..self.pos + len]], 0)?;
            if written < len {
                delay_ms += SHORT_WRITE_DELAY_MS;
            }
            self.since_meta_block += written;
            self.pos += written;
        }
        Ok(self.finish_tick(block, written, delay_ms))
    }

    /// Emits the metadata insert plus the next payload chunk as one
    /// gathered write so the interval stays byte-exact across partial
    /// sends.
    fn send_icy_metadata(
        &mut self,
        block: &StreamBlock,
        chan: &mut dyn ClientChannel,
    ) -> io::Result<WriteOutcome> {
        let sentinel = [0u8];
        let meta: &[u8] = if self.in_metadata {
            // resuming a partly sent block
            match self.assoc.as_ref() {
                Some(assoc) => &assoc.icy()[self.metadata_offset..],
                None => &sentinel[..],
            }
        } else {
            let changed = self
                .assoc
                .as_ref()
                .is_none_or(|assoc| !assoc.same_as(&block.meta));
            if changed {
                self.using_blank = block.meta.is_blank();
                self.assoc = Some(Arc::clone(&block.meta));
                self.assoc
                    .as_ref()
                    .map_or(&sentinel[..], |assoc| assoc.icy().as_ref())
            } else {
                &sentinel[..]
            }
        };
        let meta_len = meta.len();

        let audio_len = (block.data.len() - self.pos).min(self.interval.max(1));
        let bufs = [meta, &block.data[self.pos..self.pos + audio_len]];
        let written = chan.send_bufs(&bufs, 0)?;

        let mut delay_ms = TICK_DELAY_MS;
        if written >= meta_len {
            let payload = written - meta_len;
            self.since_meta_block = payload;
            self.pos += payload;
            self.in_metadata = false;
            self.metadata_offset = 0;
        } else {
            self.in_metadata = true;
            self.metadata_offset += written;
            delay_ms += META_STALL_DELAY_MS;
        }
        Ok(self.finish_tick(block, written, delay_ms))
    }

    /// Iceblock framing: every payload gets a length word; a metadata
    /// change prepends the iceblock rendition to the gather vector.
    fn write_iceblock(
        &mut self,
        block: &StreamBlock,
        chan: &mut dyn ClientChannel,
    ) -> io::Result<WriteOutcome> {
        let changed = self
            .assoc
            .as_ref()
            .is_none_or(|assoc| !assoc.same_as(&block.meta));

        let framed_len = block.data.len() + 2;
        let length_word = [((framed_len >> 8) & 0x7F) as u8, (framed_len & 0xFF) as u8];

        let mut bufs: Vec<&[u8]> = Vec::with_capacity(3);
        if changed && !block.meta.iceblock().is_empty() {
            bufs.push(block.meta.iceblock().as_ref());
        }
        bufs.push(&length_word[..]);
        bufs.push(block.data.as_ref());
        let total: usize = bufs.iter().map(|b| b.len()).sum();

        let written = chan.send_bufs(&bufs, self.metadata_offset)?;
        self.metadata_offset += written;

        let mut delay_ms = TICK_DELAY_MS;
        let done = self.metadata_offset >= total;
        if done {
            if changed {
                self.using_blank = block.meta.is_blank();
                self.assoc = Some(Arc::clone(&block.meta));
            }
            self.metadata_offset = 0;
            self.pos = 0;
        } else {
            delay_ms += SHORT_WRITE_DELAY_MS;
        }
        Ok(WriteOutcome {
            written,
            delay_ms,
            done,
        })
    }

    fn finish_tick(&mut self, block: &StreamBlock, written: usize, delay_ms: u64) -> WriteOutcome {
        let done = self.pos >= block.data.len();
        if done {
            self.pos = 0;
        }
        WriteOutcome {
            written,
            delay_ms,
            done,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::format::icy::MetaBuilder;

    /// Channel that accepts at most `cap` bytes per call and records the
    /// stream it saw.
    pub(crate) struct RecordingChannel {
        pub sent: Vec<u8>,
        pub cap: usize,
    }

    impl RecordingChannel {
        pub(crate) fn new(cap: usize) -> Self {
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

    fn update(title: &str) -> Arc<MetaUpdate> {
        MetaBuilder {
            title: Some(title),
            ..Default::default()
        }
        .build()
        .unwrap()
    }

    fn block(data: &[u8], meta: &Arc<MetaUpdate>) -> Arc<StreamBlock> {
        StreamBlock::new(Bytes::copy_from_slice(data), Arc::clone(meta), true)
    }

    fn pump(sender: &mut ListenerSender, block: &StreamBlock, chan: &mut RecordingChannel) {
        for _ in 0..1000 {
            let outcome = sender.write_block(block, chan).unwrap();
            if outcome.done {
                return;
            }
        }
        panic!("block did not complete");
    }

    #[test]
    fn raw_framing_never_transmits_metadata() {
        let meta = update("secret");
        let mut sender = ListenerSender::new(Framing::Raw, 16);
        let mut chan = RecordingChannel::new(7);
        let b = block(&[0x55; 64], &meta);
        pump(&mut sender, &b, &mut chan);
        assert_eq!(chan.sent, vec![0x55; 64]);
    }

    #[test]
    fn raw_burst_is_capped() {
        let meta = update("t");
        let mut sender = ListenerSender::new(Framing::Raw, 0);
        let mut chan = RecordingChannel::new(usize::MAX);
        let b = block(&vec![1u8; 4000], &meta);
        let outcome = sender.write_block(&b, &mut chan).unwrap();
        assert_eq!(outcome.written, SEND_BURST_MAX);
        assert!(!outcome.done);
    }

    #[test]
    fn short_write_asks_for_backoff() {
        let meta = update("t");
        let mut sender = ListenerSender::new(Framing::Raw, 0);
        let mut chan = RecordingChannel::new(3);
        let b = block(&[9u8; 10], &meta);
        let outcome = sender.write_block(&b, &mut chan).unwrap();
        assert_eq!(outcome.written, 3);
        assert_eq!(outcome.delay_ms, TICK_DELAY_MS + SHORT_WRITE_DELAY_MS);
    }

    #[test]
    fn icy_insert_lands_on_the_interval() {
        let meta = update("now playing");
        let mut sender = ListenerSender::new(Framing::Icy, 8);
        let mut chan = RecordingChannel::new(usize::MAX);
        let b = block(&[0xAA; 16], &meta);
        pump(&mut sender, &b, &mut chan);

        // 8 payload bytes, then the full metadata block, then 8 more
        assert_eq!(&chan.sent[..8], &[0xAA; 8]);
        let len_byte = chan.sent[8] as usize;
        let meta_end = 9 + len_byte * 16;
        assert_eq!(&chan.sent[9..meta_end], &meta.icy()[1..]);
        assert_eq!(&chan.sent[meta_end..meta_end + 8], &[0xAA; 8]);
        assert!(sender.associated().unwrap().same_as(&meta));
    }

    #[test]
    fn unchanged_metadata_sends_the_sentinel() {
        let meta = update("same");
        let mut sender = ListenerSender::new(Framing::Icy, 4);
        let mut chan = RecordingChannel::new(usize::MAX);
        pump(&mut sender, &block(&[1u8; 8], &meta), &mut chan);
        let first_len = chan.sent.len();
        pump(&mut sender, &block(&[2u8; 8], &meta), &mut chan);

        // second block saw two inserts, both the 1-byte sentinel
        let second = &chan.sent[first_len..];
        let inserts: Vec<usize> = second
            .iter()
            .enumerate()
            .filter(|&(_, &b)| b == 0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(second.len(), 8 + 2);
        assert_eq!(inserts.len(), 2);
    }

    #[test]
    fn partial_metadata_send_resumes_where_it_stopped() {
        let meta = update("long enough title to span writes");
        let mut sender = ListenerSender::new(Framing::Icy, 4);
        // tiny socket: at most 5 bytes per tick
        let mut chan = RecordingChannel::new(5);
        let b = block(&[0x77; 8], &meta);
        pump(&mut sender, &b, &mut chan);

        assert_eq!(&chan.sent[..4], &[0x77; 4]);
        let meta_len = meta.icy().len();
        assert_eq!(&chan.sent[4..4 + meta_len], &meta.icy()[..]);
        assert_eq!(&chan.sent[4 + meta_len..], &[0x77; 4]);
        assert!(!sender.in_metadata());
    }

    #[test]
    fn iceblock_frames_carry_length_words() {
        let meta = update("tagged");
        let mut sender = ListenerSender::new(Framing::IceBlock, 0);
        let mut chan = RecordingChannel::new(usize::MAX);
        let b = block(&[0x42; 10], &meta);
        pump(&mut sender, &b, &mut chan);

        // metadata rendition first (sentinel bit set on its length word)
        let ib = meta.iceblock();
        assert_eq!(&chan.sent[..ib.len()], &ib[..]);
        assert_ne!(chan.sent[0] & 0x80, 0);
        // then the framed payload
        let frame = &chan.sent[ib.len()..];
        let framed_len = ((frame[0] as usize) << 8) | frame[1] as usize;
        assert_eq!(frame[0] & 0x80, 0);
        assert_eq!(framed_len, 12);
        assert_eq!(&frame[2..], &[0x42; 10]);

        // next block, unchanged metadata: length word + payload only
        let before = chan.sent.len();
        pump(&mut sender, &block(&[0x43; 4], &meta), &mut chan);
        assert_eq!(chan.sent.len() - before, 6);
    }

    #[test]
    fn iceblock_partial_writes_cross_the_whole_vector() {
        let meta = update("x");
        let mut sender = ListenerSender::new(Framing::IceBlock, 0);
        let mut chan = RecordingChannel::new(3);
        let b = block(&[0x11; 9], &meta);
        pump(&mut sender, &b, &mut chan);

        let ib = meta.iceblock();
        assert_eq!(&chan.sent[..ib.len()], &ib[..]);
        let frame = &chan.sent[ib.len()..];
        assert_eq!(&frame[2..], &[0x11; 9]);
    }

    #[test]
    fn blank_metadata_is_flagged_not_released() {
        let blank = MetaUpdate::blank();
        let mut sender = ListenerSender::new(Framing::Icy, 4);
        let mut chan = RecordingChannel::new(usize::MAX);
        pump(&mut sender, &block(&[1u8; 8], &blank), &mut chan);
        assert!(sender.using_blank());
        // first insert transmitted the blank body in full
        assert_eq!(&chan.sent[4..4 + 17], &blank.icy()[..]);
    }
}
