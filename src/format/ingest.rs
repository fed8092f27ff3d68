//! Per-mount stream ingest.
//!
//! Reads upstream bytes into fixed-size blocks, strips inline Shoutcast
//! metadata, validates MPEG frame alignment and packages the result as
//! [`StreamBlock`]s carrying the current broadcast metadata. One instance
//! exists per mount and is only touched from the source's scheduler
//! client.

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::FormatError;
use super::icy::{self, MetaBuilder};
use super::mpeg::MpegSync;
use crate::buffer::{MetaUpdate, StreamBlock};
use crate::config::MountConfig;
use crate::stats::Stats;

/// Staging cap for one inline metadata block: length byte + 255 units.
const META_STAGING_MAX: usize = 4081;

/// Non-blocking byte source feeding a mount.
///
/// `Ok(0)` means nothing is available this tick (the scheduler will retry);
/// errors are fatal and tear the source down. Implementations wrap
/// non-blocking sockets or, in tests, canned chunk sequences.
pub trait StreamReader: Send {
    /// Reads available bytes into `buf`.
    ///
    /// # Errors
    /// Any I/O error other than `WouldBlock` ends the stream.
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Which kind of metadata commit is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetaPending {
    None,
    /// Tags originated in the mount charset and were transcoded on entry.
    Convert,
    /// Tags were submitted as UTF-8.
    Utf8,
}

/// Ingest state for one mount.
#[derive(Debug)]
pub struct MountIngest {
    mount: String,
    charset: String,
    metadata: Arc<MetaUpdate>,
    title: Option<String>,
    artist: Option<String>,
    inline_url: Option<String>,
    stream_url: Option<String>,
    pending: MetaPending,
    /// ICY period advertised to listeners.
    interval: usize,
    /// ICY period announced by the upstream; 0 means none inline.
    inline_interval: usize,
    /// Payload bytes seen since the last inline metadata block.
    offset: usize,
    build_meta: Vec<u8>,
    /// Total size of the inline block being staged; 0 when idle.
    build_meta_need: usize,
    read_data: Option<BytesMut>,
    read_count: usize,
    queue_block_size: usize,
    resync_discard_limit: usize,
    sync: Option<MpegSync>,
    archive_sync: MpegSync,
    stats: Arc<Stats>,
    read_bytes_total: u64,
}

impl MountIngest {
    /// Creates ingest state for `mount`.
    ///
    /// `icy_metaint` is the inline period announced by the upstream (0
    /// when the stream carries no inline metadata). Frame validation is
    /// enabled for MPEG and AAC content types only.
    pub fn new(mount: &str, content_type: &str, icy_metaint: usize, stats: Arc<Stats>) -> Self {
        let framed = matches!(content_type, "audio/mpeg" | "audio/aac" | "audio/aacp");
        if icy_metaint > 0 {
            tracing::info!("icy metadata format expected on {mount}, interval {icy_metaint}");
        }
        let mut icy = vec![0u8; 17];
        icy[0] = 1;
        icy[1..16].copy_from_slice(b"StreamTitle='';");

        Self {
            mount: mount.to_string(),
            charset: "ISO8859-1".to_string(),
            metadata: MetaUpdate::new(Bytes::from(icy), Bytes::new(), Bytes::new()),
            title: None,
            artist: None,
            inline_url: None,
            stream_url: None,
            pending: MetaPending::None,
            interval: if icy_metaint > 0 {
                icy_metaint
            } else {
                MountConfig::DEFAULT_ICY_INTERVAL
            },
            inline_interval: icy_metaint,
            offset: 0,
            build_meta: Vec::new(),
            build_meta_need: 0,
            read_data: None,
            read_count: 0,
            queue_block_size: MountConfig::DEFAULT_BLOCK_SIZE,
            resync_discard_limit: MountConfig::DEFAULT_RESYNC_DISCARD,
            sync: framed.then(|| MpegSync::new(mount)),
            archive_sync: MpegSync::new(mount),
            stats,
            read_bytes_total: 0,
        }
    }

    /// Applies per-mount overrides for interval, charset, block size and
    /// the resync discard ceiling.
    pub fn apply_settings(&mut self, cfg: &MountConfig) {
        self.interval = cfg.meta_interval.unwrap_or(if self.inline_interval > 0 {
            self.inline_interval
        } else {
            MountConfig::DEFAULT_ICY_INTERVAL
        });
        self.charset = cfg
            .charset
            .clone()
            .unwrap_or_else(|| "ISO8859-1".to_string());
        self.queue_block_size = cfg.queue_block_size;
        self.resync_discard_limit = cfg.resync_discard_limit;
        self.stream_url = cfg.stream_url.clone();
        tracing::debug!(
            "sending metadata interval {} charset {} on {}",
            self.interval,
            self.charset,
            self.mount
        );
    }

    /// Current broadcast metadata handle.
    pub fn metadata(&self) -> Arc<MetaUpdate> {
        Arc::clone(&self.metadata)
    }

    /// ICY period advertised to listeners.
    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Raw bytes read from the upstream so far.
    pub fn read_bytes_total(&self) -> u64 {
        self.read_bytes_total
    }

    /// Frame parser attached to this mount, when the content is framed.
    pub fn sync(&self) -> Option<&MpegSync> {
        self.sync.as_ref()
    }

    /// Updates one operator-set tag, or commits the batch when `tag` is
    /// `None`. Values in a non-UTF-8 charset are transcoded on entry.
    pub fn set_tag(&mut self, tag: Option<&str>, value: Option<&str>, charset: Option<&str>) {
        let charset = charset.filter(|c| {
            !c.eq_ignore_ascii_case("utf-8") && !c.eq_ignore_ascii_case("utf8")
        });
        let Some(tag) = tag else {
            self.pending = if charset.is_some() {
                MetaPending::Utf8
            } else {
                MetaPending::Convert
            };
            return;
        };
        let value = value.map(|v| match charset {
            Some(cs) => icy::to_utf8(v.as_bytes(), cs),
            None => v.to_string(),
        });
        match tag {
            "title" => self.title = value,
            "artist" => self.artist = value,
            "url" => self.inline_url = value,
            _ => {}
        }
    }

    /// Fills the in-progress input block, building any pending metadata
    /// update first. Returns true once the block is full.
    ///
    /// # Errors
    /// - `FormatError::Io` - the upstream read failed.
    pub fn complete_read(&mut self, reader: &mut dyn StreamReader) -> Result<bool, FormatError> {
        if self.read_data.is_none() {
            let mut block = BytesMut::with_capacity(self.queue_block_size);
            block.resize(self.queue_block_size, 0);
            self.read_data = Some(block);
            self.read_count = 0;
        }
        if self.pending != MetaPending::None {
            self.rebuild_metadata();
            self.pending = MetaPending::None;
        }
        let Some(block) = self.read_data.as_mut() else {
            return Ok(false);
        };
        if self.read_count < block.len() {
            match reader.read_bytes(&mut block[self.read_count..]) {
                Ok(n) => {
                    self.read_count += n;
                    self.read_bytes_total += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.read_count >= self.read_data.as_ref().map_or(0, BytesMut::len))
    }

    /// Reads and packages the next payload block, stripping inline
    /// metadata and trimming to frame boundaries. Returns `None` while a
    /// block is still being filled or when a read produced only metadata.
    ///
    /// # Errors
    /// - `FormatError::BadMetadataBlock` - inline metadata failed to parse.
    /// - `FormatError::Unsynchronised` / `FormatError::ExcessUnparsed` -
    ///   frame validation gave up; the source should be torn down.
    /// - `FormatError::Io` - the upstream read failed.
    pub fn next_block(
        &mut self,
        reader: &mut dyn StreamReader,
    ) -> Result<Option<Arc<StreamBlock>>, FormatError> {
        if !self.complete_read(reader)? {
            return Ok(None);
        }
        let Some(mut buf) = self.read_data.take() else {
            return Ok(None);
        };
        buf.truncate(self.read_count);
        self.read_count = 0;

        if self.inline_interval > 0 {
            buf = self.filter_inline(buf)?;
            if buf.is_empty() {
                // the whole read was metadata
                return Ok(None);
            }
        }
        self.validate(&mut buf)?;
        if buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(StreamBlock::new(
            buf.freeze(),
            Arc::clone(&self.metadata),
            true,
        )))
    }

    /// Trims an archive-bound block to a frame boundary with the
    /// dedicated archive parser, returning the trailing fragment to carry
    /// into the next write.
    ///
    /// # Errors
    /// - `FormatError::Unsynchronised` - the block is not parseable audio.
    pub fn align_archive_block(&mut self, buf: &mut BytesMut) -> Result<BytesMut, FormatError> {
        self.archive_sync.complete_frames(buf)
    }

    /// Splits one raw read into payload, staging and splicing out inline
    /// metadata blocks.
    fn filter_inline(&mut self, input: BytesMut) -> Result<BytesMut, FormatError> {
        let mut audio = BytesMut::with_capacity(input.len());
        let mut rest: &[u8] = &input;

        while !rest.is_empty() {
            let audio_room = self.inline_interval - self.offset;
            if audio_room > 0 {
                let take = rest.len().min(audio_room);
                audio.extend_from_slice(&rest[..take]);
                self.offset += take;
                rest = &rest[take..];
                continue;
            }

            // at the metadata boundary; start or continue staging
            if self.build_meta_need == 0 {
                self.build_meta.clear();
                self.build_meta_need = 1 + rest[0] as usize * 16;
                if self.build_meta_need > META_STAGING_MAX {
                    return Err(FormatError::BadMetadataBlock {
                        mount: self.mount.clone(),
                        reason: format!("declared size {} too large", self.build_meta_need),
                    });
                }
            }
            let remaining = self.build_meta_need - self.build_meta.len();
            let take = rest.len().min(remaining);
            self.build_meta.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.build_meta.len() == self.build_meta_need {
                if self.build_meta_need > 1 {
                    self.apply_inline_block()?;
                }
                self.offset = 0;
                self.build_meta_need = 0;
            }
        }
        Ok(audio)
    }

    /// Parses a completed inline block and schedules a broadcast update.
    fn apply_inline_block(&mut self) -> Result<(), FormatError> {
        let parsed = icy::parse_inline_block(
            &self.mount,
            &self.build_meta,
            self.metadata.icy(),
            &self.charset,
        )
        .inspect_err(|_| {
            tracing::warn!("unable to parse metadata insert for {}", self.mount);
        })?;
        if let Some(tags) = parsed {
            if tags.title.is_some() {
                self.title = tags.title;
            }
            if tags.url.is_some() {
                self.inline_url = tags.url;
            }
            self.pending = MetaPending::Convert;
        }
        Ok(())
    }

    /// Trims the block to a frame boundary and decides what happens to
    /// the trailing fragment.
    fn validate(&mut self, buf: &mut BytesMut) -> Result<(), FormatError> {
        let Some(sync) = self.sync.as_mut() else {
            return Ok(());
        };
        let tail = sync.complete_frames(buf)?;
        let unprocessed = tail.len();
        if unprocessed == 0 {
            return Ok(());
        }
        if unprocessed > self.resync_discard_limit {
            tracing::warn!("no frames detected for {}", self.mount);
            return Err(FormatError::ExcessUnparsed {
                mount: self.mount.clone(),
                count: unprocessed,
            });
        }
        if self.inline_interval > 0 {
            if self.offset >= self.inline_interval {
                // stopped on the metadata boundary, so this fragment
                // cannot be re-read; keep it for the next frame pass
                sync.insert_pending(tail);
                return Ok(());
            }
            // the fragment returns to the read buffer, rewind its share
            // of the inline accounting
            self.offset -= unprocessed;
        }
        let target = self.queue_block_size.max(unprocessed + 1000);
        let mut next = tail;
        next.resize(target, 0);
        self.read_count = unprocessed;
        self.read_data = Some(next);
        Ok(())
    }

    /// Builds and publishes the next metadata update from the current
    /// tags. Failures keep the previous update.
    fn rebuild_metadata(&mut self) {
        let builder = MetaBuilder {
            artist: self.artist.as_deref(),
            title: self.title.as_deref(),
            url: self.inline_url.as_deref().or(self.stream_url.as_deref()),
            stats: Some(&self.stats),
            sync: self.sync.as_ref(),
        };
        match builder.build() {
            Ok(update) => self.metadata = update,
            Err(e) => tracing::warn!("metadata update on {} dropped: {e}", self.mount),
        }
    }
}
