//! Shoutcast inline metadata parsing and broadcast update construction.
//!
//! Inline blocks arrive as a length byte (16-byte units) followed by a
//! null-padded `key='value';` list. Parsed tags are transcoded to UTF-8
//! at this boundary; everything downstream handles `String`s only. A
//! broadcast update mints all three wire renditions at once so they can
//! never disagree about the current track.

use std::sync::Arc;

use bytes::Bytes;

use super::FormatError;
use super::flv::FlvMetaTag;
use super::mpeg::MpegSync;
use crate::buffer::MetaUpdate;
use crate::stats::Stats;

/// Upper bound on one ICY metadata body: 255 length units of 16 bytes.
const MAX_META_LEN: usize = 255 * 16;

/// Tags extracted from one inline metadata block.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InlineTags {
    /// `StreamTitle` value, if present.
    pub title: Option<String>,
    /// `StreamUrl` value, if present.
    pub url: Option<String>,
}

/// Decodes bytes in the given charset to UTF-8.
///
/// ISO-8859-1 (the mount default) maps each byte to the code point of the
/// same value; anything else is taken as already UTF-8, lossily.
pub fn to_utf8(bytes: &[u8], charset: &str) -> String {
    if charset.eq_ignore_ascii_case("ISO8859-1") || charset.eq_ignore_ascii_case("ISO-8859-1") {
        bytes.iter().map(|&b| b as char).collect()
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Parses a complete inline metadata block.
///
/// Returns `None` when the block is empty or byte-identical to the
/// currently published ICY rendition. Unknown keys are skipped at the
/// next `;`.
///
/// # Errors
/// - `FormatError::BadMetadataBlock` - length byte does not match the
///   received size, or the size is outside `16..=4081`.
pub fn parse_inline_block(
    mount: &str,
    block: &[u8],
    current_icy: &[u8],
    charset: &str,
) -> Result<Option<InlineTags>, FormatError> {
    let meta_len = block.len();
    if meta_len <= 1 || (current_icy.len() >= meta_len && current_icy[..meta_len] == *block) {
        return Ok(None);
    }
    if !(16..=4081).contains(&meta_len) {
        return Err(FormatError::BadMetadataBlock {
            mount: mount.to_string(),
            reason: format!("block size {meta_len} out of range"),
        });
    }
    if block[0] as usize * 16 + 1 != meta_len {
        return Err(FormatError::BadMetadataBlock {
            mount: mount.to_string(),
            reason: "length byte disagrees with block size".to_string(),
        });
    }

    let mut tags = InlineTags::default();
    let mut rest = &block[1..];
    while !rest.is_empty() && rest[0] != 0 {
        if let Some(value) = take_quoted(&mut rest, b"StreamTitle='") {
            tracing::info!("incoming title for {mount} {}", String::from_utf8_lossy(value));
            tags.title = Some(to_utf8(value, charset));
        } else if let Some(value) = take_quoted(&mut rest, b"StreamUrl='") {
            tracing::info!("incoming URL for {mount} {}", String::from_utf8_lossy(value));
            tags.url = Some(to_utf8(value, charset));
        } else {
            // unknown key, skip to the next field
            match rest.iter().position(|&b| b == b';') {
                Some(at) => rest = &rest[at + 1..],
                None => break,
            }
        }
    }
    Ok(Some(tags))
}

/// If `rest` starts with `prefix`, consumes up to the closing `';` and
/// returns the enclosed value.
fn take_quoted<'a>(rest: &mut &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if !rest.starts_with(prefix) {
        return None;
    }
    let body = &rest[prefix.len()..];
    let end = body.windows(2).position(|w| w == b"';")?;
    *rest = &body[end + 2..];
    Some(&body[..end])
}

/// Stream facts folded into the FLV rendition of an update.
#[derive(Debug, Default)]
pub struct MetaBuilder<'a> {
    /// Artist tag, UTF-8.
    pub artist: Option<&'a str>,
    /// Title tag, UTF-8.
    pub title: Option<&'a str>,
    /// URL tag, UTF-8.
    pub url: Option<&'a str>,
    /// Source stats store for name/description/rate facts.
    pub stats: Option<&'a Stats>,
    /// Frame parser for codec facts; absent for non-MPEG mounts.
    pub sync: Option<&'a MpegSync>,
}

impl MetaBuilder<'_> {
    /// Mints the next broadcast update: ICY, FLV and iceblock renditions
    /// built together. Stamps `title` / `metadata_url` /
    /// `metadata_updated` into the stats store.
    ///
    /// # Errors
    /// - `FormatError::MetadataTooLong` - composed body exceeds the ICY
    ///   255-unit wire limit; the caller keeps the previous update.
    pub fn build(&self) -> Result<Arc<MetaUpdate>, FormatError> {
        let display = match (self.artist, self.title) {
            (Some(artist), Some(title)) => format!("{artist} - {title}"),
            (_, Some(title)) => title.to_string(),
            (Some(artist), None) => artist.to_string(),
            (None, None) => String::new(),
        };

        let mut body = format!("StreamTitle='{display}';");
        if let Some(url) = self.url {
            body.push_str(&format!("StreamUrl='{url}';"));
        }
        if body.len() + 1 > MAX_META_LEN {
            return Err(FormatError::MetadataTooLong { len: body.len() });
        }

        // length byte counts 16-byte units, zero padded, always leaving a
        // trailing terminator
        let len_byte = body.len() / 16 + 1;
        let mut icy = vec![0u8; len_byte * 16 + 1];
        icy[0] = len_byte as u8;
        icy[1..=body.len()].copy_from_slice(body.as_bytes());

        let flv = self.build_flv();
        let iceblock = self.build_iceblock();

        if let Some(stats) = self.stats {
            stats.set("title", &display);
            if let Some(url) = self.url {
                stats.set("metadata_url", url);
            }
            stats.set_time("metadata_updated");
        }
        tracing::debug!("icy metadata as {:.80}...", body);

        Ok(MetaUpdate::new(Bytes::from(icy), flv, iceblock))
    }

    fn build_flv(&self) -> Bytes {
        let mut tag = FlvMetaTag::new(4000);
        if let Some(sync) = self.sync {
            let stat = |key: &str| self.stats.and_then(|s| s.retrieve(key));
            if let Some(name) = stat("server_name") {
                tag.append_string("name", &name);
            }
            if let Some(desc) = stat("server_description") {
                tag.append_string("description", &desc);
            }
            let stereo = match stat("ice-channels").and_then(|v| v.parse::<u8>().ok()) {
                Some(channels) => channels == 2,
                None => sync.channels() == 2,
            };
            tag.append_bool("stereo", stereo);
            let rate = stat("ice-samplerate")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or_else(|| f64::from(sync.samplerate()));
            tag.append_number("audiosamplerate", rate);
            if let Some(bitrate) = stat("ice-bitrate").and_then(|v| v.parse::<f64>().ok()) {
                tag.append_number("audiodatarate", bitrate);
            }
            tag.append_number("audiocodecid", f64::from(sync.codec_id()));
        }
        if let Some(artist) = self.artist {
            tag.append_string("artist", artist);
        }
        if let Some(title) = self.title {
            tag.append_string("title", title);
        }
        if let Some(url) = self.url {
            tag.append_string("URL", url);
        }
        tag.finish()
    }

    fn build_iceblock(&self) -> Bytes {
        let mut body: Vec<u8> = vec![0, 0]; // length word, filled below
        body.push(0);
        body.extend_from_slice(b"mode=updinfo\n");
        if let Some(artist) = self.artist {
            body.extend_from_slice(format!("artist={artist}\n").as_bytes());
        }
        if let Some(title) = self.title {
            body.extend_from_slice(format!("title={title}\n").as_bytes());
        }
        if let Some(url) = self.url {
            body.extend_from_slice(format!("URL={url}\n").as_bytes());
        }
        body.push(0); // terminator to ease parsing
        let len = body.len();
        body[0] = (((len >> 8) & 0x7F) as u8) | 0x80;
        body[1] = (len & 0xFF) as u8;
        Bytes::from(body)
    }
}
