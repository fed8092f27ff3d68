//! Stream blocks and broadcast metadata updates.
//!
//! A mount publishes audio as a sequence of [`StreamBlock`]s. Each block
//! carries a shared handle to the [`MetaUpdate`] that was current when the
//! block was packaged, so listeners joining at different points in the
//! queue observe metadata transitions in publish order. An update bundles
//! the three wire renditions (ICY, FLV script tag, iceblock) minted
//! together so senders never mix fields from different updates.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;

/// Generation numbers start above the blank singleton's 0.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

static LIVE_UPDATES: AtomicUsize = AtomicUsize::new(0);
static LIVE_BLOCKS: AtomicUsize = AtomicUsize::new(0);

static BLANK: OnceLock<Arc<MetaUpdate>> = OnceLock::new();

/// One broadcast metadata update, immutable once minted.
///
/// Identity is the `generation` number; senders detect a change by
/// comparing generations rather than contents, which keeps repeated
/// identical titles from a flapping upstream as distinct updates.
#[derive(Debug)]
pub struct MetaUpdate {
    generation: u64,
    icy: Bytes,
    flv: Bytes,
    iceblock: Bytes,
    blank: bool,
}

impl MetaUpdate {
    /// Mints a new update from the three wire renditions.
    pub fn new(icy: Bytes, flv: Bytes, iceblock: Bytes) -> Arc<Self> {
        LIVE_UPDATES.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            icy,
            flv,
            iceblock,
            blank: false,
        })
    }

    /// The process-wide blank update sent to listeners before a mount has
    /// published anything. Never dropped and excluded from leak counts.
    pub fn blank() -> Arc<Self> {
        Arc::clone(BLANK.get_or_init(|| {
            let mut icy = vec![0u8; 17];
            icy[0] = 1;
            icy[1..16].copy_from_slice(b"StreamTitle='';");
            Arc::new(Self {
                generation: 0,
                icy: Bytes::from(icy),
                flv: Bytes::new(),
                iceblock: Bytes::new(),
                blank: true,
            })
        }))
    }

    /// ICY rendition: length byte followed by the 16-byte padded body.
    pub fn icy(&self) -> &Bytes {
        &self.icy
    }

    /// FLV `onMetaData` script tag rendition.
    pub fn flv(&self) -> &Bytes {
        &self.flv
    }

    /// Iceblock rendition: sentinel length word plus key/value body.
    pub fn iceblock(&self) -> &Bytes {
        &self.iceblock
    }

    /// Identity for change detection.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this is the blank singleton.
    pub fn is_blank(&self) -> bool {
        self.blank
    }

    /// Whether two handles refer to the same update.
    pub fn same_as(&self, other: &MetaUpdate) -> bool {
        self.generation == other.generation
    }
}

impl Drop for MetaUpdate {
    fn drop(&mut self) {
        if !self.blank {
            LIVE_UPDATES.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Count of live non-singleton metadata updates.
pub fn live_updates() -> usize {
    LIVE_UPDATES.load(Ordering::Relaxed)
}

/// Count of live stream blocks.
pub fn live_blocks() -> usize {
    LIVE_BLOCKS.load(Ordering::Relaxed)
}

/// One packaged audio block on a mount's queue.
#[derive(Debug)]
pub struct StreamBlock {
    /// Payload bytes, metadata already stripped.
    pub data: Bytes,
    /// Metadata current at packaging time.
    pub meta: Arc<MetaUpdate>,
    /// Set when the block starts on an MPEG frame boundary.
    pub frame_aligned: bool,
}

impl StreamBlock {
    /// Packages payload bytes with the given metadata handle.
    pub fn new(data: Bytes, meta: Arc<MetaUpdate>, frame_aligned: bool) -> Arc<Self> {
        LIVE_BLOCKS.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            data,
            meta,
            frame_aligned,
        })
    }
}

impl Drop for StreamBlock {
    fn drop(&mut self) {
        LIVE_BLOCKS.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Ring of recent blocks for one mount.
///
/// Blocks get absolute sequence numbers so each listener can keep its own
/// cursor. Expiry drops from the front once the byte cap is exceeded, but
/// always leaves the newest block so a fresh listener has a start point.
#[derive(Debug)]
pub struct BlockQueue {
    blocks: VecDeque<Arc<StreamBlock>>,
    head_seq: u64,
    queued_bytes: usize,
    max_bytes: usize,
}

impl BlockQueue {
    /// Creates a queue bounded to roughly `max_bytes` of payload.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            blocks: VecDeque::new(),
            head_seq: 0,
            queued_bytes: 0,
            max_bytes,
        }
    }

    /// Appends a block, expiring from the front if over the cap.
    /// Returns the sequence number assigned to the block.
    pub fn push(&mut self, block: Arc<StreamBlock>) -> u64 {
        let seq = self.head_seq + self.blocks.len() as u64;
        self.queued_bytes += block.data.len();
        self.blocks.push_back(block);
        while self.queued_bytes > self.max_bytes && self.blocks.len() > 1 {
            if let Some(old) = self.blocks.pop_front() {
                self.queued_bytes -= old.data.len();
                self.head_seq += 1;
            }
        }
        seq
    }

    /// Fetches the block at `seq`, or None if it has expired or is not
    /// yet produced.
    pub fn get(&self, seq: u64) -> Option<Arc<StreamBlock>> {
        let idx = seq.checked_sub(self.head_seq)?;
        self.blocks.get(idx as usize).cloned()
    }

    /// Sequence number the next pushed block will receive.
    pub fn next_seq(&self) -> u64 {
        self.head_seq + self.blocks.len() as u64
    }

    /// Oldest sequence still held.
    pub fn oldest_seq(&self) -> u64 {
        self.head_seq
    }

    /// Number of blocks currently held.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the queue holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Drops every queued block.
    pub fn clear(&mut self) {
        self.head_seq = self.next_seq();
        self.queued_bytes = 0;
        self.blocks.clear();
    }
}
