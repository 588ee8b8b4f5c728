use super::error::{Nip77Error, Result};

/// Longest valid varint for a u64 (ceil(64 / 7)).
const MAX_VARINT_LEN: usize = 10;

/// Encode a varint (variable-length unsigned integer)
///
/// Varints are represented as base-128 digits, most significant digit first.
/// Bit 7 (high bit) is set on each byte except the last.
pub fn encode_varint(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(MAX_VARINT_LEN);
    write_varint(&mut bytes, value);
    bytes
}

/// Append the varint encoding of `value` to `out`.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    let mut digits = [0u8; MAX_VARINT_LEN];
    let mut len = 0;

    loop {
        digits[len] = (value & 0x7F) as u8;
        len += 1;
        value >>= 7;
        if value == 0 {
            break;
        }
    }

    for i in (0..len).rev() {
        if i > 0 {
            out.push(digits[i] | 0x80);
        } else {
            out.push(digits[i]);
        }
    }
}

/// Decode a varint from a byte slice
///
/// Returns (value, bytes_consumed)
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize)> {
    if data.is_empty() {
        return Err(Nip77Error::VarintDecode("empty data".to_string()));
    }

    let mut value: u64 = 0;

    for (i, &byte) in data.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(Nip77Error::VarintDecode(
                "varint too long (max 10 bytes for u64)".to_string(),
            ));
        }

        // Check for overflow before shifting
        if value > (u64::MAX >> 7) {
            return Err(Nip77Error::VarintDecode("varint overflow".to_string()));
        }

        value = (value << 7) | u64::from(byte & 0x7F);

        if (byte & 0x80) == 0 {
            return Ok((value, i + 1));
        }
    }

    Err(Nip77Error::VarintDecode("incomplete varint".to_string()))
}

/// Growable byte buffer with a read cursor.
///
/// Reads advance the cursor instead of moving the remaining bytes, so
/// consuming from the front is O(1). Appends go to the back and grow
/// geometrically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireBuffer {
    bytes: Vec<u8>,
    start: usize,
}

impl WireBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            start: 0,
        }
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.bytes.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unread bytes as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.start..]
    }

    pub fn append(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    pub fn push(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub fn push_varint(&mut self, value: u64) {
        write_varint(&mut self.bytes, value);
    }

    /// Next unread byte without consuming it.
    pub fn peek(&self) -> Option<u8> {
        self.bytes.get(self.start).copied()
    }

    /// Consume one byte.
    pub fn shift(&mut self) -> Result<u8> {
        let byte = self.peek().ok_or(Nip77Error::Truncated {
            needed: 1,
            remaining: 0,
        })?;
        self.start += 1;
        Ok(byte)
    }

    /// Consume `n` bytes and return them.
    pub fn shift_n(&mut self, n: usize) -> Result<&[u8]> {
        self.ensure(n)?;
        let begin = self.start;
        self.start += n;
        Ok(&self.bytes[begin..begin + n])
    }

    /// Consume exactly `N` bytes into an array.
    pub fn shift_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.shift_n(N)?);
        Ok(out)
    }

    /// Skip `n` bytes.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.start += n;
        Ok(())
    }

    /// Consume a varint.
    pub fn shift_varint(&mut self) -> Result<u64> {
        let (value, consumed) = decode_varint(self.as_slice())?;
        self.start += consumed;
        Ok(value)
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.start = 0;
    }

    /// Unread bytes as an owned vector.
    pub fn into_vec(mut self) -> Vec<u8> {
        if self.start > 0 {
            self.bytes.drain(..self.start);
        }
        self.bytes
    }

    fn ensure(&self, n: usize) -> Result<()> {
        let remaining = self.len();
        if n > remaining {
            return Err(Nip77Error::Truncated {
                needed: n,
                remaining,
            });
        }
        Ok(())
    }
}

impl From<Vec<u8>> for WireBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes, start: 0 }
    }
}

impl From<&[u8]> for WireBuffer {
    fn from(bytes: &[u8]) -> Self {
        Self::from(bytes.to_vec())
    }
}
