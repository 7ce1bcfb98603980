//! Structural check of untrusted Yrs v1 payloads.
//!
//! The yrs decoder trusts its input: counts read off the wire size
//! allocations before a single element is read, strings are taken as UTF-8
//! without checking, and nested `Any` values recurse without a bound. Every
//! payload coming from a peer is walked here first, with each count held
//! against the bytes that are left, so none of that is reachable.
//!
//! The walk accepts exactly the layout yrs writes:
//!
//! ```text
//! update       = var(clients) { var(blocks) var(client) var(clock) block* }  delete_set
//! block        = 0 var(len)                       GC
//!              | 10 var(len)                      skip
//!              | info [origin] [right] [parent [parent_sub]] content
//! delete_set   = var(clients) { var(client) var(ranges) { var(clock) var(len) }* }
//! state_vector = var(len) { var(client) var(clock) }*
//! ```
//!
//! Trailing bytes after the delete set are ignored, as yrs does.

/// Deepest `Any` nesting accepted.
pub const MAX_ANY_DEPTH: usize = 64;

const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;
const CONTENT_MASK: u8 = 0b0000_1111;

const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;

const CONTENT_DELETED: u8 = 1;
const CONTENT_JSON: u8 = 2;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;
const CONTENT_DOC: u8 = 9;
const CONTENT_MOVE: u8 = 11;

const TYPE_ARRAY: u8 = 0;
const TYPE_MAP: u8 = 1;
const TYPE_TEXT: u8 = 2;
const TYPE_XML_ELEMENT: u8 = 3;
const TYPE_XML_FRAGMENT: u8 = 4;
const TYPE_XML_HOOK: u8 = 5;
const TYPE_XML_TEXT: u8 = 6;
const TYPE_DOC: u8 = 9;
const TYPE_UNDEFINED: u8 = 15;

/// Why a payload was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("Payload ends early (needed {expected} bytes, have {actual})")]
    InsufficientData { expected: usize, actual: usize },
    #[error("Invalid variable-length integer at byte {0}")]
    InvalidVarInt(usize),
    #[error("Count {count} at byte {at} exceeds the {remaining} bytes left")]
    CountTooLarge { count: u64, at: usize, remaining: usize },
    #[error("String at byte {0} is not valid UTF-8")]
    InvalidUtf8(usize),
    #[error("Unknown {kind} tag {tag} at byte {at}")]
    UnknownTag { kind: &'static str, tag: u8, at: usize },
    #[error("Values nested deeper than {} levels", MAX_ANY_DEPTH)]
    TooDeep,
    #[error("Clock range overflows at byte {0}")]
    ClockOverflow(usize),
}

/// Check that `update` is a well-formed Yrs v1 update.
pub fn check_update_v1(update: &[u8]) -> Result<(), ScanError> {
    let mut cur = Cursor::new(update);

    // Each client header is at least three varints.
    let clients = cur.count_u32(3)?;
    for _ in 0..clients {
        let blocks = cur.count_u32(1)?;
        cur.var_u32()?;
        let mut clock = cur.var_u32()?;
        for _ in 0..blocks {
            let at = cur.pos;
            let len = block(&mut cur)?;
            clock = clock.checked_add(len).ok_or(ScanError::ClockOverflow(at))?;
        }
    }
    delete_set(&mut cur)
}

/// Check that `state_vector` is a well-formed Yrs v1 state vector.
pub fn check_state_vector_v1(state_vector: &[u8]) -> Result<(), ScanError> {
    let mut cur = Cursor::new(state_vector);
    let len = cur.count_u32(2)?;
    for _ in 0..len {
        cur.skip_var()?;
        cur.var_u32()?;
    }
    Ok(())
}

/// Walk one block, returning the clock length it covers.
fn block(cur: &mut Cursor<'_>) -> Result<u32, ScanError> {
    let info = cur.u8()?;
    match info {
        BLOCK_GC | BLOCK_SKIP => cur.var_u32(),
        _ => {
            if info & HAS_ORIGIN != 0 {
                cur.skip_id()?;
            }
            if info & HAS_RIGHT_ORIGIN != 0 {
                cur.skip_id()?;
            }
            if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
                // Parent: 1 is a named root type, anything else an item id.
                if cur.var_u32()? == 1 {
                    cur.string()?;
                } else {
                    cur.skip_id()?;
                }
                if info & HAS_PARENT_SUB != 0 {
                    cur.string()?;
                }
            }
            content(cur, info & CONTENT_MASK)
        }
    }
}

fn content(cur: &mut Cursor<'_>, kind: u8) -> Result<u32, ScanError> {
    let at = cur.pos;
    match kind {
        CONTENT_DELETED => cur.var_u32(),
        CONTENT_JSON => {
            // Stored as `len` followed by `len + 1` strings.
            let len = cur.count_u32(1)?;
            for _ in 0..=len {
                cur.string()?;
            }
            Ok((len as u32).saturating_add(1))
        }
        CONTENT_BINARY => {
            cur.buf()?;
            Ok(1)
        }
        CONTENT_STRING => {
            let text = cur.string()?;
            Ok(text.encode_utf16().count() as u32)
        }
        CONTENT_EMBED => {
            cur.string()?;
            Ok(1)
        }
        CONTENT_FORMAT => {
            cur.string()?;
            cur.string()?;
            Ok(1)
        }
        CONTENT_TYPE => {
            let tag_at = cur.pos;
            match cur.u8()? {
                TYPE_XML_ELEMENT => {
                    cur.string()?;
                }
                TYPE_ARRAY | TYPE_MAP | TYPE_TEXT | TYPE_XML_FRAGMENT | TYPE_XML_HOOK
                | TYPE_XML_TEXT | TYPE_DOC | TYPE_UNDEFINED => {}
                tag => {
                    return Err(ScanError::UnknownTag {
                        kind: "type",
                        tag,
                        at: tag_at,
                    })
                }
            }
            Ok(1)
        }
        CONTENT_ANY => {
            let len = cur.count_u32(1)?;
            for _ in 0..len {
                any(cur, 0)?;
            }
            Ok(len as u32)
        }
        CONTENT_DOC => {
            cur.string()?;
            any(cur, 0)?;
            Ok(1)
        }
        CONTENT_MOVE => {
            // The low bit of the flags marks a collapsed range (one id).
            let collapsed = cur.peek()? & 1 != 0;
            cur.skip_var()?;
            cur.skip_id()?;
            if !collapsed {
                cur.skip_id()?;
            }
            Ok(1)
        }
        tag => Err(ScanError::UnknownTag {
            kind: "content",
            tag,
            at,
        }),
    }
}

fn any(cur: &mut Cursor<'_>, depth: usize) -> Result<(), ScanError> {
    if depth > MAX_ANY_DEPTH {
        return Err(ScanError::TooDeep);
    }
    let at = cur.pos;
    match cur.u8()? {
        // undefined, null, false, true
        127 | 126 | 121 | 120 => {}
        125 => cur.skip_var()?,
        124 => {
            cur.take(4)?;
        }
        123 | 122 => {
            cur.take(8)?;
        }
        119 => {
            cur.string()?;
        }
        118 => {
            let len = cur.count_u64(2)?;
            for _ in 0..len {
                cur.string()?;
                any(cur, depth + 1)?;
            }
        }
        117 => {
            let len = cur.count_u64(1)?;
            for _ in 0..len {
                any(cur, depth + 1)?;
            }
        }
        116 => {
            cur.buf()?;
        }
        tag => {
            return Err(ScanError::UnknownTag {
                kind: "value",
                tag,
                at,
            })
        }
    }
    Ok(())
}

fn delete_set(cur: &mut Cursor<'_>) -> Result<(), ScanError> {
    let clients = cur.count_u32(2)?;
    for _ in 0..clients {
        cur.var_u32()?;
        let at = cur.pos;
        let ranges = match cur.var_u32()? {
            1 => 1,
            n => cur.check_count(n as u64, 2, at)?,
        };
        for _ in 0..ranges {
            let at = cur.pos;
            let clock = cur.var_u32()?;
            let len = cur.var_u32()?;
            clock.checked_add(len).ok_or(ScanError::ClockOverflow(at))?;
        }
    }
    Ok(())
}

/// Bounds-checked reader over a payload.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn peek(&self) -> Result<u8, ScanError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(ScanError::InsufficientData {
                expected: self.pos + 1,
                actual: self.buf.len(),
            })
    }

    fn u8(&mut self) -> Result<u8, ScanError> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ScanError> {
        if len > self.remaining() {
            return Err(ScanError::InsufficientData {
                expected: self.pos.saturating_add(len),
                actual: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Unsigned varint. Like the yrs reader, up to 11 bytes are accepted
    /// and the value wraps to 32 bits.
    fn var_u32(&mut self) -> Result<u32, ScanError> {
        let start = self.pos;
        let mut num = 0u32;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            num |= u32::wrapping_shl((byte & 0x7f) as u32, shift);
            shift += 7;
            if byte < 0x80 {
                return Ok(num);
            }
            if shift > 70 {
                return Err(ScanError::InvalidVarInt(start));
            }
        }
    }

    fn var_u64(&mut self) -> Result<u64, ScanError> {
        let start = self.pos;
        let mut num = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            num |= u64::wrapping_shl((byte & 0x7f) as u64, shift);
            shift += 7;
            if byte < 0x80 {
                return Ok(num);
            }
            if shift > 70 {
                return Err(ScanError::InvalidVarInt(start));
            }
        }
    }

    /// Skip a signed or unsigned varint. Both stop at the first byte
    /// without the high bit and are at most 11 bytes long.
    fn skip_var(&mut self) -> Result<(), ScanError> {
        self.var_u64().map(|_| ())
    }

    fn skip_id(&mut self) -> Result<(), ScanError> {
        self.skip_var()?;
        self.skip_var()
    }

    /// A count of elements that each take at least `min_size` bytes.
    fn count_u32(&mut self, min_size: usize) -> Result<usize, ScanError> {
        let at = self.pos;
        let count = self.var_u32()?;
        self.check_count(count as u64, min_size, at)
    }

    fn count_u64(&mut self, min_size: usize) -> Result<usize, ScanError> {
        let at = self.pos;
        let count = self.var_u64()?;
        self.check_count(count, min_size, at)
    }

    fn check_count(&self, count: u64, min_size: usize, at: usize) -> Result<usize, ScanError> {
        let remaining = self.remaining();
        let needed = count.saturating_mul(min_size as u64);
        if needed > remaining as u64 {
            return Err(ScanError::CountTooLarge {
                count,
                at,
                remaining,
            });
        }
        Ok(count as usize)
    }

    fn buf(&mut self) -> Result<&'a [u8], ScanError> {
        let len = self.var_u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<&'a str, ScanError> {
        let at = self.pos;
        let bytes = self.buf()?;
        std::str::from_utf8(bytes).map_err(|_| ScanError::InvalidUtf8(at))
    }
}
