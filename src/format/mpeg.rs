//! MPEG audio / ADTS frame resynchroniser.
//!
//! Incoming blocks are trimmed so they end on a frame boundary before
//! being queued; the trailing fragment is handed back to the caller to be
//! carried into the next read. The parser also reports the codec
//! parameters (layer, sample rate, channels) that the metadata builder
//! folds into FLV script tags.

use bytes::BytesMut;

use super::FormatError;

/// Bytes of garbage tolerated in one pass before declaring the stream
/// unparseable.
const RESYNC_WINDOW: usize = 4096;

/// MPEG-1 Layer III bitrates, kbit/s, indexed by the header bitrate field.
const BITRATE_V1_L3: [u32; 16] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
];
const BITRATE_V1_L2: [u32; 16] = [
    0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 0,
];
const BITRATE_V1_L1: [u32; 16] = [
    0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448, 0,
];
const BITRATE_V2_L1: [u32; 16] = [
    0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256, 0,
];
/// MPEG-2/2.5 layers II and III share one table.
const BITRATE_V2_L23: [u32; 16] = [
    0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0,
];

const SAMPLERATE_V1: [u32; 3] = [44_100, 48_000, 32_000];

const AAC_SAMPLERATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

/// Codec detected on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Nothing parsed yet.
    Unknown,
    /// MPEG audio (layers I-III).
    Mpeg,
    /// AAC in ADTS framing.
    Aac,
}

#[derive(Debug, Clone, Copy)]
struct FrameInfo {
    len: usize,
    codec: Codec,
    layer: u8,
    samplerate: u32,
    channels: u8,
    bitrate_kbps: u32,
}

/// Stateful frame parser attached to one stream.
#[derive(Debug)]
pub struct MpegSync {
    label: String,
    codec: Codec,
    layer: u8,
    samplerate: u32,
    channels: u8,
    bitrate_kbps: u32,
    frames_seen: u64,
    check_frames: usize,
    pending: Option<BytesMut>,
}

impl MpegSync {
    /// Creates a parser labelled with the mount or peer it watches.
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            codec: Codec::Unknown,
            layer: 0,
            samplerate: 0,
            channels: 0,
            bitrate_kbps: 0,
            frames_seen: 0,
            check_frames: 3,
            pending: None,
        }
    }

    /// Sets how many consecutive headers must parse before the first sync
    /// point is accepted. Listeners joining mid-stream use 1.
    pub fn require_frames(&mut self, count: usize) {
        self.check_frames = count.max(1);
    }

    /// Stores a fragment to be prepended on the next
    /// [`complete_frames`](Self::complete_frames) call. Used when a frame
    /// straddles an inline metadata boundary.
    pub fn insert_pending(&mut self, tail: BytesMut) {
        match self.pending.as_mut() {
            Some(pending) => pending.extend_from_slice(&tail),
            None => self.pending = Some(tail),
        }
    }

    /// Detected codec.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// FLV codec id for the detected stream: 2 for MPEG audio, 10 for AAC.
    pub fn codec_id(&self) -> u8 {
        if self.codec == Codec::Aac { 10 } else { 2 }
    }

    /// Sample rate of the last parsed frame, 0 before sync.
    pub fn samplerate(&self) -> u32 {
        self.samplerate
    }

    /// Channel count of the last parsed frame, 0 before sync.
    pub fn channels(&self) -> u8 {
        self.channels
    }

    /// Bitrate of the last parsed frame in kbit/s, 0 before sync.
    pub fn bitrate_kbps(&self) -> u32 {
        self.bitrate_kbps
    }

    /// Total frames accepted so far.
    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Trims `buf` so it ends on a frame boundary and returns the
    /// trailing fragment. Any pending fragment from a previous call is
    /// prepended first. Garbage between frames is spliced out, up to a
    /// bounded window.
    ///
    /// # Errors
    /// - `FormatError::Unsynchronised` - no parseable frames within the
    ///   resync window; the stream is probably not MPEG/AAC audio.
    pub fn complete_frames(&mut self, buf: &mut BytesMut) -> Result<BytesMut, FormatError> {
        if let Some(mut pending) = self.pending.take() {
            pending.extend_from_slice(buf);
            *buf = pending;
        }

        let data: &[u8] = buf;
        let len = data.len();
        let mut pos = 0usize;
        let mut dropped = 0usize;
        let mut run_start: Option<usize> = None;
        let mut runs: Vec<(usize, usize)> = Vec::new();
        let mut parsed: u64 = 0;

        while pos + 4 <= len {
            match self.frame_at(data, pos) {
                Some(info) => {
                    if pos + info.len > len {
                        break; // partial trailing frame
                    }
                    if run_start.is_none() {
                        run_start = Some(pos);
                    }
                    self.note_frame(info);
                    parsed += 1;
                    pos += info.len;
                }
                None => {
                    // a sync byte near the end may be a header we cannot
                    // judge yet (ADTS needs 7 bytes); keep it as tail
                    if data[pos] == 0xFF && len - pos < 7 {
                        break;
                    }
                    if let Some(start) = run_start.take() {
                        runs.push((start, pos));
                    }
                    pos += 1;
                    dropped += 1;
                    if dropped > RESYNC_WINDOW {
                        return Err(FormatError::Unsynchronised {
                            mount: self.label.clone(),
                        });
                    }
                }
            }
        }
        if let Some(start) = run_start {
            runs.push((start, pos));
        }

        if dropped > 0 {
            tracing::debug!("discarded {dropped} bytes resyncing {}", self.label);
        }
        if parsed == 0 && dropped > 0 && len >= RESYNC_WINDOW {
            return Err(FormatError::Unsynchronised {
                mount: self.label.clone(),
            });
        }

        let tail = BytesMut::from(&data[pos..]);
        if dropped == 0 {
            buf.truncate(pos);
        } else {
            let mut clean = BytesMut::with_capacity(pos);
            for (start, end) in &runs {
                clean.extend_from_slice(&data[*start..*end]);
            }
            *buf = clean;
        }
        Ok(tail)
    }

    /// Scans for the first acceptable frame header in `data`. Used to
    /// align a listener joining mid-stream.
    pub fn frame_offset(&self, data: &[u8]) -> Option<usize> {
        (0..data.len().saturating_sub(4)).find(|&at| self.frame_at(data, at).is_some())
    }

    /// Parses the header at `pos`, insisting on `check_frames`
    /// consecutive headers before the first sync point is trusted.
    fn frame_at(&self, data: &[u8], pos: usize) -> Option<FrameInfo> {
        let info = parse_header(&data[pos..], self.codec)?;
        if self.frames_seen == 0 {
            let mut probe = pos + info.len;
            for _ in 1..self.check_frames {
                // run out of buffer: accept what we could verify
                if probe + 7 > data.len() {
                    break;
                }
                let next = parse_header(&data[probe..], info.codec)?;
                probe += next.len;
            }
        }
        Some(info)
    }

    fn note_frame(&mut self, info: FrameInfo) {
        self.codec = info.codec;
        self.layer = info.layer;
        self.samplerate = info.samplerate;
        self.channels = info.channels;
        self.bitrate_kbps = info.bitrate_kbps;
        self.frames_seen += 1;
    }
}

/// Parses one frame header, restricted to `locked` once a codec is known.
fn parse_header(data: &[u8], locked: Codec) -> Option<FrameInfo> {
    if data.len() < 4 || data[0] != 0xFF {
        return None;
    }
    // ADTS: 12 sync bits then layer 00.
    if data[1] & 0xF6 == 0xF0 {
        if locked == Codec::Mpeg {
            return None;
        }
        return parse_adts(data);
    }
    if data[1] & 0xE0 != 0xE0 || locked == Codec::Aac {
        return None;
    }
    parse_mpeg(data)
}

fn parse_mpeg(data: &[u8]) -> Option<FrameInfo> {
    let version = (data[1] >> 3) & 0x03; // 0: 2.5, 2: MPEG-2, 3: MPEG-1
    let layer_bits = (data[1] >> 1) & 0x03; // 1: III, 2: II, 3: I
    if version == 1 || layer_bits == 0 {
        return None;
    }
    let bitrate_idx = (data[2] >> 4) as usize;
    let samplerate_idx = ((data[2] >> 2) & 0x03) as usize;
    if bitrate_idx == 0 || bitrate_idx == 15 || samplerate_idx == 3 {
        return None;
    }

    let layer = 4 - layer_bits; // 1, 2 or 3
    let bitrate_kbps = match (version, layer) {
        (3, 1) => BITRATE_V1_L1[bitrate_idx],
        (3, 2) => BITRATE_V1_L2[bitrate_idx],
        (3, 3) => BITRATE_V1_L3[bitrate_idx],
        (_, 1) => BITRATE_V2_L1[bitrate_idx],
        _ => BITRATE_V2_L23[bitrate_idx],
    };
    let samplerate = match version {
        3 => SAMPLERATE_V1[samplerate_idx],
        2 => SAMPLERATE_V1[samplerate_idx] / 2,
        _ => SAMPLERATE_V1[samplerate_idx] / 4,
    };
    let padding = ((data[2] >> 1) & 0x01) as usize;
    let bitrate = bitrate_kbps as usize * 1000;

    let len = match layer {
        1 => (12 * bitrate / samplerate as usize + padding) * 4,
        2 => 144 * bitrate / samplerate as usize + padding,
        _ => {
            // Layer III frame size halves for MPEG-2/2.5.
            let per_frame = if version == 3 { 144 } else { 72 };
            per_frame * bitrate / samplerate as usize + padding
        }
    };
    if len < 4 {
        return None;
    }
    let channels = if (data[3] >> 6) == 3 { 1 } else { 2 };

    Some(FrameInfo {
        len,
        codec: Codec::Mpeg,
        layer,
        samplerate,
        channels,
        bitrate_kbps,
    })
}

fn parse_adts(data: &[u8]) -> Option<FrameInfo> {
    if data.len() < 6 {
        return None;
    }
    let samplerate_idx = ((data[2] >> 2) & 0x0F) as usize;
    if samplerate_idx >= AAC_SAMPLERATES.len() {
        return None;
    }
    let len = (((data[3] & 0x03) as usize) << 11) | ((data[4] as usize) << 3) | ((data[5] >> 5) as usize);
    if len < 7 {
        return None;
    }
    let channels = ((data[2] & 0x01) << 2) | (data[3] >> 6);

    Some(FrameInfo {
        len,
        codec: Codec::Aac,
        layer: 0,
        samplerate: AAC_SAMPLERATES[samplerate_idx],
        channels,
        bitrate_kbps: 0,
    })
}
