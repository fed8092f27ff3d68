//! FLV `onMetaData` script tag construction.
//!
//! Only the metadata tag is built here; wrapping payload blocks into FLV
//! audio tags is the repackager's job. The tag is minted once per
//! metadata update and carried on the update so FLV listeners can emit it
//! without re-encoding.

use bytes::{BufMut, Bytes, BytesMut};

const TAG_TYPE_SCRIPT: u8 = 18;
const AMF_NUMBER: u8 = 0x00;
const AMF_BOOL: u8 = 0x01;
const AMF_STRING: u8 = 0x02;
const AMF_ECMA_ARRAY: u8 = 0x08;

/// Incremental builder for one `onMetaData` script tag.
///
/// Entries that would push the tag past its capacity are dropped rather
/// than truncated mid-value.
#[derive(Debug)]
pub struct FlvMetaTag {
    buf: BytesMut,
    capacity: usize,
    count: u32,
}

impl FlvMetaTag {
    /// Starts a tag bounded to `capacity` bytes on the wire.
    pub fn new(capacity: usize) -> Self {
        let mut buf = BytesMut::with_capacity(capacity.min(512));
        buf.put_u8(TAG_TYPE_SCRIPT);
        buf.put_slice(&[0, 0, 0]); // data size, patched in finish()
        buf.put_slice(&[0, 0, 0, 0]); // timestamp + extension
        buf.put_slice(&[0, 0, 0]); // stream id
        buf.put_u8(AMF_STRING);
        buf.put_u16(10);
        buf.put_slice(b"onMetaData");
        buf.put_u8(AMF_ECMA_ARRAY);
        buf.put_u32(0); // entry count, patched in finish()
        Self {
            buf,
            capacity,
            count: 0,
        }
    }

    fn put_key(&mut self, key: &str) {
        self.buf.put_u16(key.len() as u16);
        self.buf.put_slice(key.as_bytes());
    }

    fn has_room(&self, entry_len: usize) -> bool {
        // leave space for the 3-byte end marker and the trailer
        self.buf.len() + entry_len + 7 <= self.capacity
    }

    /// Appends a string property.
    pub fn append_string(&mut self, key: &str, value: &str) {
        if key.len() > u16::MAX as usize || value.len() > u16::MAX as usize {
            return;
        }
        if !self.has_room(2 + key.len() + 3 + value.len()) {
            return;
        }
        self.put_key(key);
        self.buf.put_u8(AMF_STRING);
        self.buf.put_u16(value.len() as u16);
        self.buf.put_slice(value.as_bytes());
        self.count += 1;
    }

    /// Appends a numeric property.
    pub fn append_number(&mut self, key: &str, value: f64) {
        if !self.has_room(2 + key.len() + 9) {
            return;
        }
        self.put_key(key);
        self.buf.put_u8(AMF_NUMBER);
        self.buf.put_f64(value);
        self.count += 1;
    }

    /// Appends a boolean property.
    pub fn append_bool(&mut self, key: &str, value: bool) {
        if !self.has_room(2 + key.len() + 2) {
            return;
        }
        self.put_key(key);
        self.buf.put_u8(AMF_BOOL);
        self.buf.put_u8(u8::from(value));
        self.count += 1;
    }

    /// Closes the array, patches the sizes and appends the previous-tag
    /// trailer.
    pub fn finish(mut self) -> Bytes {
        self.buf.put_slice(&[0, 0, 0x09]); // object end marker
        let data_size = self.buf.len() - 11;
        self.buf[1] = (data_size >> 16) as u8;
        self.buf[2] = (data_size >> 8) as u8;
        self.buf[3] = data_size as u8;
        let count = self.count.to_be_bytes();
        self.buf[25..29].copy_from_slice(&count);
        let tag_len = self.buf.len() as u32;
        self.buf.put_u32(tag_len);
        self.buf.freeze()
    }
}
