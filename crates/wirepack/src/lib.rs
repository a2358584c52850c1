//! # Wirepack
//!
//! A small, bounded, self-describing serialization format for RPC payloads.
//!
//! ## Philosophy
//!
//! - **Self-Describing**: Every item carries its own tag, so a receiver can rebuild a
//!   [`Value`] without knowing the sender's schema.
//! - **TLV Architecture**: `[Tag][Length?][Value]` structure enables safe skipping of unknown fields.
//! - **Bounded**: Encoders track state explicitly. Decoders are zero-copy, bounds-checked views
//!   that report truncation as [`Error::UnexpectedEnd`] and never panic.
//!
//! ## Format
//!
//! - **Scalars**: `[Tag: 1b][Data: N]`
//! - **Blobs**: `[Tag: 1b][Len: 4b][Data: Len]`
//! - **Containers**: `[Tag: 1b][Len: 4b][Body: Len]`
//!
//! All integers are Little-Endian.

mod value;


pub use value::FromValue;
pub use value::FromValueError;
pub use value::MAX_DEPTH;
pub use value::Value;
pub use value::decode_value;
pub use value::encode_value;

/// Wirepack serialization and deserialization errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Byte does not correspond to a valid `Tag`.
    #[error("invalid tag byte: {0:#04x}")]
    InvalidTag(u8),
    /// A valid tag appeared where a different one was required.
    #[error("unexpected tag: expected {expected:?}, found {found:?}")]
    UnexpectedTag { expected: Tag, found: Tag },
    /// String data is not valid UTF-8.
    #[error("string data is not valid utf-8")]
    InvalidUtf8,
    /// Closing a scope that does not match the active scope stack.
    #[error("scope mismatch: expected {expected:?}, found {actual:?}")]
    ScopeMismatch { expected: Scope, actual: Scope },
    /// Attempted to close a scope when only the Root remains.
    #[error("no open scope to close")]
    ScopeUnderflow,
    /// Attempted to finalize the buffer with open scopes.
    #[error("cannot finalize with open scopes")]
    ScopeStillOpen,
    /// Buffer exhausted while reading.
    #[error("unexpected end of input")]
    UnexpectedEnd,
    /// Blob or container length exceeds `u32::MAX`.
    #[error("blob of {0} bytes exceeds the length limit")]
    BlobTooLarge(usize),
    /// Attempted to write more than one payload into a Variant.
    #[error("too many items in scope {0:?}; expected exactly 1")]
    TooManyItems(Scope),
    /// Attempted to close a Variant without a payload.
    #[error("empty variant; expected exactly 1 payload item")]
    EmptyVariant,
    /// Attempted to write a non-Variant directly into a Map.
    #[error("maps only accept variant entries")]
    InvalidMapEntry,
    /// A value nests deeper than [`MAX_DEPTH`].
    #[error("value nesting exceeds {0} levels")]
    DepthExceeded(usize),
    /// Bytes remained after the expected item was read.
    #[error("{0} trailing bytes after item")]
    TrailingBytes(usize),
}

/// Specialized `Result` for Wirepack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifies the type of the encoded value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Null = 0x01,
    BoolTrue = 0x02,
    BoolFalse = 0x03,
    /// Signed 64-bit integer.
    Int = 0x04,
    /// 64-bit float.
    Float = 0x05,

    // Blobs (Tag + u32 Len + Bytes)
    String = 0x10,
    Bytes = 0x11,

    // Containers (Tag + u32 Len + Body)
    List = 0x20,
    Map = 0x21,
    /// Named payload: a String name followed by exactly one item.
    Variant = 0x30,
}

impl Tag {
    /// Returns the Tag for a given byte, or `None` if invalid.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Tag::Null),
            0x02 => Some(Tag::BoolTrue),
            0x03 => Some(Tag::BoolFalse),
            0x04 => Some(Tag::Int),
            0x05 => Some(Tag::Float),
            0x10 => Some(Tag::String),
            0x11 => Some(Tag::Bytes),
            0x20 => Some(Tag::List),
            0x21 => Some(Tag::Map),
            0x30 => Some(Tag::Variant),
            _ => None,
        }
    }
}

/// Internal state tracking for the `Encoder` stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The virtual root; allows any item.
    Root,
    /// Ordered sequence; allows any number of items.
    List,
    /// Key-Value container; strictly allows only `Tag::Variant` items.
    Map,
    /// Strict container; allows exactly one item (the payload) after the name.
    Variant,
}

/// An open container scope on the `Encoder` stack.
struct Frame {
    start: usize,
    scope: Scope,
    count: usize,
}

/// A state-machine driven encoder.
///
/// The Encoder keeps a stack of open scopes to enforce structural strictness
/// and back-patches length headers when a scope closes.
///
/// # Structural Invariants
///
/// 1.  **Map Scopes**: Only `Tag::Variant` items may be written.
/// 2.  **Variant Scopes**: Exactly one payload item must be written.
/// 3.  **Root Scope**: The encoder must end in the Root scope to finalize bytes.
pub struct Encoder {
    buf: Vec<u8>,
    root: Frame,
    stack: Vec<Frame>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// Creates a new encoder with default capacity.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
            root: Frame { start: 0, scope: Scope::Root, count: 0 },
            stack: Vec::with_capacity(8),
        }
    }

    /// Consumes the encoder and returns the final byte vector.
    ///
    /// # Errors
    /// Returns `Error::ScopeStillOpen` if any container is still open.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if !self.stack.is_empty() {
            return Err(Error::ScopeStillOpen);
        }
        Ok(self.buf)
    }

    fn current_frame(&mut self) -> &mut Frame {
        match self.stack.last_mut() {
            Some(frame) => frame,
            None => &mut self.root,
        }
    }

    fn check_write(&mut self, tag: Tag) -> Result<()> {
        let frame = self.current_frame();
        match frame.scope {
            Scope::Root | Scope::List => Ok(()),
            Scope::Map if tag == Tag::Variant => Ok(()),
            Scope::Map => Err(Error::InvalidMapEntry),
            Scope::Variant if frame.count >= 1 => Err(Error::TooManyItems(Scope::Variant)),
            Scope::Variant => Ok(()),
        }
    }

    fn on_item_written(&mut self) {
        self.current_frame().count += 1;
    }

    fn write_tag(&mut self, tag: Tag) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        Ok(())
    }

    fn write_blob(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| Error::BlobTooLarge(data.len()))?;
        self.write_tag(tag)?;
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(data);
        self.on_item_written();
        Ok(())
    }

    fn begin_scope(&mut self, tag: Tag, scope: Scope) -> Result<()> {
        self.check_write(tag)?;

        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&[0, 0, 0, 0]); // length placeholder

        self.stack.push(Frame {
            start: self.buf.len(),
            scope,
            count: 0,
        });
        Ok(())
    }

    fn end_scope(&mut self, expected: Scope) -> Result<()> {
        let Some(frame) = self.stack.last() else {
            return Err(Error::ScopeUnderflow);
        };
        if frame.scope != expected {
            return Err(Error::ScopeMismatch { expected, actual: frame.scope });
        }
        if frame.scope == Scope::Variant && frame.count == 0 {
            return Err(Error::EmptyVariant);
        }

        let start = frame.start;
        let body_len = self.buf.len() - start;
        let len = u32::try_from(body_len).map_err(|_| Error::BlobTooLarge(body_len))?;
        self.buf[start - 4..start].copy_from_slice(&len.to_le_bytes());

        self.stack.pop();
        self.on_item_written();
        Ok(())
    }

    /// Encodes the absence of a value.
    pub fn null(&mut self) -> Result<()> {
        self.write_tag(Tag::Null)?;
        self.on_item_written();
        Ok(())
    }

    /// Encodes a boolean value.
    pub fn bool(&mut self, v: bool) -> Result<()> {
        self.write_tag(if v { Tag::BoolTrue } else { Tag::BoolFalse })?;
        self.on_item_written();
        Ok(())
    }

    /// Encodes a signed 64-bit integer (LE).
    pub fn int(&mut self, v: i64) -> Result<()> {
        self.write_tag(Tag::Int)?;
        self.buf.extend_from_slice(&v.to_le_bytes());
        self.on_item_written();
        Ok(())
    }

    /// Encodes a 64-bit float (LE).
    pub fn float(&mut self, v: f64) -> Result<()> {
        self.write_tag(Tag::Float)?;
        self.buf.extend_from_slice(&v.to_le_bytes());
        self.on_item_written();
        Ok(())
    }

    /// Encodes a UTF-8 string blob.
    pub fn str(&mut self, v: &str) -> Result<()> {
        self.write_blob(Tag::String, v.as_bytes())
    }

    /// Encodes a raw byte blob.
    pub fn bytes(&mut self, v: &[u8]) -> Result<()> {
        self.write_blob(Tag::Bytes, v)
    }

    /// Begins a List container. Allows any number of items.
    pub fn list_begin(&mut self) -> Result<()> { self.begin_scope(Tag::List, Scope::List) }
    /// Ends a List container.
    pub fn list_end(&mut self) -> Result<()> { self.end_scope(Scope::List) }

    /// Begins a Map container.
    ///
    /// **Strict:** Only `variant_begin()` (Key/Value pair) is allowed as a direct child.
    pub fn map_begin(&mut self) -> Result<()> { self.begin_scope(Tag::Map, Scope::Map) }
    /// Ends a Map container.
    pub fn map_end(&mut self) -> Result<()> { self.end_scope(Scope::Map) }

    /// Begins a Variant (Named Payload).
    ///
    /// The name is written immediately; exactly one payload item must follow
    /// before `variant_end()`.
    pub fn variant_begin(&mut self, name: &str) -> Result<()> {
        self.begin_scope(Tag::Variant, Scope::Variant)?;
        self.str(name)?;
        // the name is metadata, not the payload
        self.current_frame().count = 0;
        Ok(())
    }
    /// Ends a Variant.
    pub fn variant_end(&mut self) -> Result<()> { self.end_scope(Scope::Variant) }
}

/// A zero-copy, bounds-checked cursor over a byte slice.
///
/// Reading advances the internal cursor. Container reads return new `Decoder`
/// instances restricted to the container's body.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over the slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Returns the remaining bytes in the view.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Fails with `TrailingBytes` unless the view is fully consumed.
    pub fn finish(&self) -> Result<()> {
        match self.buf.len() {
            0 => Ok(()),
            n => Err(Error::TrailingBytes(n)),
        }
    }

    /// Peeks the next Tag without advancing.
    pub fn peek_tag(&self) -> Result<Tag> {
        let Some(&b) = self.buf.first() else {
            return Err(Error::UnexpectedEnd);
        };
        Tag::from_u8(b).ok_or(Error::InvalidTag(b))
    }

    fn consume(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() { return Err(Error::UnexpectedEnd); }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn read_len(&mut self) -> Result<usize> {
        Ok(u32::from_le_bytes(self.read_array()?) as usize)
    }

    fn check_tag(&mut self, expected: Tag) -> Result<()> {
        let found = self.peek_tag()?;
        if found != expected {
            return Err(Error::UnexpectedTag { expected, found });
        }
        self.consume(1)
    }

    /// Skips the next item and its nested children.
    pub fn skip(&mut self) -> Result<()> {
        let tag = self.peek_tag()?;
        self.consume(1)?;

        match tag {
            Tag::Null | Tag::BoolTrue | Tag::BoolFalse => Ok(()),
            Tag::Int | Tag::Float => self.consume(8),
            Tag::String | Tag::Bytes | Tag::List | Tag::Map | Tag::Variant => {
                let len = self.read_len()?;
                self.consume(len)
            }
        }
    }

    /// Decodes a Null marker.
    pub fn null(&mut self) -> Result<()> { self.check_tag(Tag::Null) }

    /// Decodes a bool.
    pub fn bool(&mut self) -> Result<bool> {
        match self.peek_tag()? {
            Tag::BoolTrue => { self.consume(1)?; Ok(true) },
            Tag::BoolFalse => { self.consume(1)?; Ok(false) },
            found => Err(Error::UnexpectedTag { expected: Tag::BoolTrue, found }),
        }
    }

    /// Decodes a signed 64-bit integer (LE).
    pub fn int(&mut self) -> Result<i64> {
        self.check_tag(Tag::Int)?;
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    /// Decodes a 64-bit float (LE).
    pub fn float(&mut self) -> Result<f64> {
        self.check_tag(Tag::Float)?;
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Decodes a string slice (UTF-8).
    pub fn str(&mut self) -> Result<&'a str> {
        self.check_tag(Tag::String)?;
        let len = self.read_len()?;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }

    /// Decodes a byte slice.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        self.check_tag(Tag::Bytes)?;
        let len = self.read_len()?;
        self.read_bytes(len)
    }

    fn enter_container(&mut self, expected: Tag) -> Result<Decoder<'a>> {
        self.check_tag(expected)?;
        let len = self.read_len()?;
        Ok(Decoder::new(self.read_bytes(len)?))
    }

    /// Decodes a List into an iterator.
    pub fn list(&mut self) -> Result<ListIter<'a>> {
        Ok(ListIter { dec: self.enter_container(Tag::List)? })
    }

    /// Decodes a Map into an iterator.
    pub fn map(&mut self) -> Result<MapIter<'a>> {
        Ok(MapIter { dec: self.enter_container(Tag::Map)? })
    }

    /// Decodes a Variant.
    ///
    /// Returns `(Name, PayloadDecoder)`.
    pub fn variant(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut inner = self.enter_container(Tag::Variant)?;
        let name = inner.str()?;
        Ok((name, inner))
    }
}

/// Iterator for items within a List.
#[derive(Debug)]
pub struct ListIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> ListIter<'a> {
    /// Returns a Decoder bounded to the next item, or `None` at the end.
    ///
    /// A malformed item is reported as an error rather than ending the list.
    pub fn next(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        let mut probe = self.dec.clone();
        probe.skip()?;
        let len = self.dec.remaining() - probe.remaining();
        Ok(Some(Decoder::new(self.dec.read_bytes(len)?)))
    }
}

/// Iterator for Key-Value pairs (Variants) within a Map.
#[derive(Debug)]
pub struct MapIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> MapIter<'a> {
    /// Returns `(Key, ValueDecoder)` for the next entry, or `None`.
    pub fn next(&mut self) -> Result<Option<(&'a str, Decoder<'a>)>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        let (name, val) = self.dec.variant()?;
        Ok(Some((name, val)))
    }
}
