//! BER-style tag-length-value codec.
//!
//! A [`Tlv`] node is either a leaf carrying raw bytes or a container carrying
//! child nodes, never both. On decode, tags registered as templates in the
//! [`TlvCodec`] are parsed recursively; every other tag is kept as an opaque
//! leaf.
//!
//! # Wire Format
//!
//! ```text
//! TAG (1+ bytes) | LENGTH (1-5 bytes) | VALUE (LENGTH bytes)
//! ```
//!
//! - A tag whose first byte has its low five bits set continues while the
//!   following bytes have bit 7 set.
//! - Lengths below 128 use one byte. Larger lengths use `0x80 | n` followed by
//!   `n` big-endian length bytes (`n` in 1..=4).
//! - `0x00` and `0xFF` bytes where a tag would start are padding and skipped.
//!
//! # Examples
//!
//! ```
//! use dal_protocol::tlv::{Tlv, TlvCodec};
//!
//! let tree = vec![Tlv::container(
//!     [0xE0],
//!     vec![Tlv::leaf([0x9F, 0x1E], b"CEEEDEADBEEF".to_vec())],
//! )];
//!
//! let codec = TlvCodec::new();
//! let bytes = codec.encode(&tree);
//! assert_eq!(codec.decode(&bytes)?, tree);
//! # Ok::<(), dal_core::Error>(())
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use dal_core::{Error, Result};

use crate::tags;

/// Deepest container nesting accepted on decode.
const MAX_NESTING_DEPTH: usize = 16;

/// Value of a TLV node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvValue {
    Data(Bytes),
    Children(Vec<Tlv>),
}

/// One tag-length-value node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    tag: Vec<u8>,
    value: TlvValue,
}

impl Tlv {
    /// Leaf node carrying raw bytes.
    pub fn leaf(tag: impl Into<Vec<u8>>, data: impl Into<Bytes>) -> Self {
        Self {
            tag: tag.into(),
            value: TlvValue::Data(data.into()),
        }
    }

    /// Container node carrying child nodes.
    pub fn container(tag: impl Into<Vec<u8>>, children: Vec<Tlv>) -> Self {
        Self {
            tag: tag.into(),
            value: TlvValue::Children(children),
        }
    }

    pub fn tag(&self) -> &[u8] {
        &self.tag
    }

    pub fn value(&self) -> &TlvValue {
        &self.value
    }

    /// Raw bytes of a leaf, `None` for containers.
    pub fn data(&self) -> Option<&Bytes> {
        match &self.value {
            TlvValue::Data(data) => Some(data),
            TlvValue::Children(_) => None,
        }
    }

    /// Children of a container, empty for leaves.
    pub fn children(&self) -> &[Tlv] {
        match &self.value {
            TlvValue::Children(children) => children,
            TlvValue::Data(_) => &[],
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self.value, TlvValue::Children(_))
    }

    /// Leaf data as text, `None` for containers or non UTF-8 data.
    pub fn as_str(&self) -> Option<&str> {
        self.data().and_then(|d| std::str::from_utf8(d).ok())
    }

    /// Depth-first search for the first node with `tag`.
    pub fn find<'a>(nodes: &'a [Tlv], tag: &[u8]) -> Option<&'a Tlv> {
        nodes.iter().find_map(|node| {
            if node.tag == tag {
                Some(node)
            } else {
                Self::find(node.children(), tag)
            }
        })
    }

    /// Leaf data of the first node with `tag`, decoded as text.
    pub fn find_str<'a>(nodes: &'a [Tlv], tag: &[u8]) -> Option<&'a str> {
        Self::find(nodes, tag).and_then(Tlv::as_str)
    }

    fn encoded_value_len(&self) -> usize {
        match &self.value {
            TlvValue::Data(data) => data.len(),
            TlvValue::Children(children) => children.iter().map(Tlv::encoded_len).sum(),
        }
    }

    fn encoded_len(&self) -> usize {
        let value_len = self.encoded_value_len();
        self.tag.len() + length_of_length(value_len) + value_len
    }
}

/// Encoder/decoder holding the set of template tags.
#[derive(Debug, Clone)]
pub struct TlvCodec {
    templates: Vec<Vec<u8>>,
}

impl Default for TlvCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl TlvCodec {
    /// Codec registering the terminal's standard templates.
    pub fn new() -> Self {
        Self::with_templates(tags::TEMPLATES.iter().map(|t| t.to_vec()))
    }

    /// Codec registering exactly the given templates.
    pub fn with_templates(templates: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            templates: templates.into_iter().collect(),
        }
    }

    pub fn is_template(&self, tag: &[u8]) -> bool {
        self.templates.iter().any(|t| t == tag)
    }

    /// Serialize nodes depth-first.
    pub fn encode(&self, nodes: &[Tlv]) -> Bytes {
        let size = nodes.iter().map(Tlv::encoded_len).sum();
        let mut buf = BytesMut::with_capacity(size);
        for node in nodes {
            encode_node(node, &mut buf);
        }
        buf.freeze()
    }

    /// Decode every top-level node in `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedTlv` when a tag or length runs past the
    /// buffer, a length form is unsupported, or nesting is too deep.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<Tlv>> {
        self.decode_range(bytes, 0, bytes.len(), None)
    }

    /// Decode `length` bytes starting at `offset`. `template` is treated as
    /// an additional template tag for this call.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedTlv` if the range lies outside `bytes` or the
    /// content is malformed.
    pub fn decode_range(
        &self,
        bytes: &[u8],
        offset: usize,
        length: usize,
        template: Option<&[u8]>,
    ) -> Result<Vec<Tlv>> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| Error::malformed_tlv(offset, "range exceeds buffer"))?;
        let mut reader = Reader {
            codec: self,
            extra_template: template,
            strict: true,
        };
        reader.parse(&bytes[..end], offset, 0)
    }

    /// Decode as much as possible, treating malformed content as absent.
    ///
    /// A malformed top-level node ends the list. A template whose content is
    /// malformed is kept with no children.
    pub fn decode_lenient(&self, bytes: &[u8]) -> Vec<Tlv> {
        let mut reader = Reader {
            codec: self,
            extra_template: None,
            strict: false,
        };
        reader.parse(bytes, 0, 0).unwrap_or_default()
    }
}

/// Encode with the default codec.
pub fn encode(nodes: &[Tlv]) -> Bytes {
    TlvCodec::new().encode(nodes)
}

/// Decode with the default codec.
///
/// # Errors
///
/// See [`TlvCodec::decode`].
pub fn decode(bytes: &[u8]) -> Result<Vec<Tlv>> {
    TlvCodec::new().decode(bytes)
}

fn length_of_length(len: usize) -> usize {
    match len {
        0..=0x7F => 1,
        0x80..=0xFF => 2,
        0x100..=0xFFFF => 3,
        0x1_0000..=0xFF_FFFF => 4,
        _ => 5,
    }
}

fn encode_length(len: usize, buf: &mut BytesMut) {
    let be = (len as u32).to_be_bytes();
    match length_of_length(len) {
        1 => buf.put_u8(len as u8),
        n => {
            let count = n - 1;
            buf.put_u8(0x80 | count as u8);
            buf.put_slice(&be[4 - count..]);
        }
    }
}

fn encode_node(node: &Tlv, buf: &mut BytesMut) {
    buf.put_slice(&node.tag);
    encode_length(node.encoded_value_len(), buf);
    match &node.value {
        TlvValue::Data(data) => buf.put_slice(data),
        TlvValue::Children(children) => {
            for child in children {
                encode_node(child, buf);
            }
        }
    }
}

struct Reader<'c> {
    codec: &'c TlvCodec,
    extra_template: Option<&'c [u8]>,
    strict: bool,
}

impl Reader<'_> {
    fn is_template(&self, tag: &[u8]) -> bool {
        self.codec.is_template(tag) || self.extra_template.is_some_and(|t| t == tag)
    }

    /// Parse `buf[pos..]` into nodes. Offsets in errors are absolute.
    fn parse(&mut self, buf: &[u8], mut pos: usize, depth: usize) -> Result<Vec<Tlv>> {
        if depth > MAX_NESTING_DEPTH {
            return Err(Error::malformed_tlv(pos, "nesting too deep"));
        }

        let mut nodes = Vec::new();
        while pos < buf.len() {
            if tags::is_padding(buf[pos]) {
                pos += 1;
                continue;
            }

            let (tag, value_start, value_end) = match read_header(buf, pos) {
                Ok(header) => header,
                Err(e) if !self.strict => {
                    warn!(offset = pos, error = %e, "Dropping malformed TLV tail");
                    break;
                }
                Err(e) => return Err(e),
            };

            let node = if self.is_template(&tag) {
                let children = match self.parse(&buf[..value_end], value_start, depth + 1) {
                    Ok(children) => children,
                    Err(e) if !self.strict => {
                        warn!(tag = %hex(&tag), error = %e, "Template content malformed");
                        Vec::new()
                    }
                    Err(e) => return Err(e),
                };
                Tlv::container(tag, children)
            } else {
                Tlv::leaf(tag, Bytes::copy_from_slice(&buf[value_start..value_end]))
            };
            nodes.push(node);
            pos = value_end;
        }
        Ok(nodes)
    }
}

/// Read tag and length at `pos`, returning the tag and the value bounds.
fn read_header(buf: &[u8], pos: usize) -> Result<(Vec<u8>, usize, usize)> {
    let mut cursor = pos;
    let first = buf[cursor];
    cursor += 1;
    if first & 0x1F == 0x1F {
        loop {
            let byte = *buf
                .get(cursor)
                .ok_or_else(|| Error::malformed_tlv(cursor, "tag runs past buffer"))?;
            cursor += 1;
            if byte & 0x80 == 0 {
                break;
            }
        }
    }
    let tag = buf[pos..cursor].to_vec();

    let len_byte = *buf
        .get(cursor)
        .ok_or_else(|| Error::malformed_tlv(cursor, "missing length"))?;
    cursor += 1;
    let length = match len_byte {
        0x00..=0x7F => len_byte as usize,
        0x81..=0x84 => {
            let count = (len_byte & 0x7F) as usize;
            let bytes = buf
                .get(cursor..cursor + count)
                .ok_or_else(|| Error::malformed_tlv(cursor, "length bytes run past buffer"))?;
            cursor += count;
            bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize)
        }
        _ => {
            return Err(Error::malformed_tlv(
                cursor - 1,
                format!("unsupported length form {len_byte:#04x}"),
            ));
        }
    };

    let end = cursor
        .checked_add(length)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| Error::malformed_tlv(cursor, "value runs past buffer"))?;
    Ok((tag, cursor, end))
}

/// Uppercase hex rendering used in logs.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}
