//! Frame builder and reader.
//!
//! Every message the server sends has the same shape:
//!
//! ```text
//! ┌──────────────┬─────┬──────────────────────┐
//! │ length (u16) │ tag │ payload ...          │
//! └──────────────┴─────┴──────────────────────┘
//!   big-endian     1B    fields, in order
//! ```
//!
//! `length` counts the bytes after the prefix (tag included). Field
//! encodings:
//!
//! - numerics: big-endian, fixed width
//! - strings: `u16` byte length, then UTF-8 bytes, no terminator
//! - options lists: one count byte, then that many strings
//!
//! [`Message`] is a by-value builder: each `add_*` consumes it and hands it
//! back on success. A failed append therefore drops the half-built buffer,
//! there is no way to keep writing into it.

use crate::ProtocolError;

/// Largest frame, length prefix included.
pub const MAX_MESSAGE_LEN: usize = 1300;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_LEN: usize = 2;

// ---------------------------------------------------------------------------
// Numerics
// ---------------------------------------------------------------------------

/// A fixed-width integer that can be written to and read from a frame.
pub trait WireNumeric: Copy {
    /// Encoded size in bytes.
    const WIDTH: usize;

    /// Appends the big-endian representation.
    fn write_be(self, out: &mut Vec<u8>);

    /// Reads from exactly [`WIDTH`](Self::WIDTH) big-endian bytes.
    fn read_be(bytes: &[u8]) -> Self;
}

macro_rules! impl_wire_numeric {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WireNumeric for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                fn write_be(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_be_bytes());
                }

                fn read_be(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_be_bytes(raw)
                }
            }
        )*
    };
}

impl_wire_numeric!(u8, u16, u32, u64, i8, i16, i32, i64);

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// An outgoing frame under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    buf: Vec<u8>,
}

impl Message {
    /// Starts a new frame: reserves the length prefix and writes `tag`.
    pub fn begin(tag: impl Into<u8>) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0; LENGTH_PREFIX_LEN]);
        buf.push(tag.into());
        Self { buf }
    }

    /// Fails if `extra` more bytes would not fit.
    fn ensure_room(&self, extra: usize) -> Result<(), ProtocolError> {
        let attempted = self.buf.len() + extra;
        if attempted > MAX_MESSAGE_LEN {
            return Err(ProtocolError::BufferOverflow {
                max: MAX_MESSAGE_LEN,
                attempted,
            });
        }
        Ok(())
    }

    /// Appends one raw byte.
    pub fn add_byte(mut self, byte: impl Into<u8>) -> Result<Self, ProtocolError> {
        self.ensure_room(1)?;
        self.buf.push(byte.into());
        Ok(self)
    }

    /// Appends a boolean as `0` or `1`.
    pub fn add_bool(self, value: bool) -> Result<Self, ProtocolError> {
        self.add_byte(u8::from(value))
    }

    /// Appends a big-endian fixed-width integer.
    pub fn add_numeric<T: WireNumeric>(
        mut self,
        value: T,
    ) -> Result<Self, ProtocolError> {
        self.ensure_room(T::WIDTH)?;
        value.write_be(&mut self.buf);
        Ok(self)
    }

    /// Appends a length-prefixed UTF-8 string.
    pub fn add_string(mut self, text: &str) -> Result<Self, ProtocolError> {
        self.ensure_room(LENGTH_PREFIX_LEN + text.len())?;
        // Fits in u16: the whole frame is capped well below u16::MAX.
        self.buf.extend_from_slice(&(text.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(text.as_bytes());
        Ok(self)
    }

    /// Appends a count byte followed by every option as a string.
    ///
    /// The room check covers the whole list up front, so nothing is
    /// written unless every option fits.
    pub fn add_options<S: AsRef<str>>(
        self,
        options: &[S],
    ) -> Result<Self, ProtocolError> {
        let count = u8::try_from(options.len())
            .map_err(|_| ProtocolError::TooManyOptions(options.len()))?;
        let total: usize = 1 + options
            .iter()
            .map(|o| LENGTH_PREFIX_LEN + o.as_ref().len())
            .sum::<usize>();
        self.ensure_room(total)?;

        let mut msg = self.add_byte(count)?;
        for option in options {
            msg = msg.add_string(option.as_ref())?;
        }
        Ok(msg)
    }

    /// Writes the length prefix and returns the complete frame.
    ///
    /// Safe to call repeatedly; the prefix always matches the current
    /// content.
    pub fn finalize(&mut self) -> &[u8] {
        let len = (self.buf.len() - LENGTH_PREFIX_LEN) as u16;
        self.buf[..LENGTH_PREFIX_LEN].copy_from_slice(&len.to_be_bytes());
        &self.buf
    }

    /// Finalizes and takes ownership of the frame bytes.
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.finalize();
        self.buf
    }

    /// Current size in bytes, prefix included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// A message always holds at least its header, so this is never true.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

// ---------------------------------------------------------------------------
// MessageReader
// ---------------------------------------------------------------------------

/// Sequential reader over a frame's payload.
#[derive(Debug, Clone)]
pub struct MessageReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    /// Checks a complete frame and returns its tag plus a reader positioned
    /// on the payload.
    pub fn open(frame: &'a [u8]) -> Result<(u8, Self), ProtocolError> {
        if frame.len() < LENGTH_PREFIX_LEN + 1 {
            return Err(ProtocolError::Truncated {
                needed: LENGTH_PREFIX_LEN + 1,
                remaining: frame.len(),
            });
        }
        let declared = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        let actual = frame.len() - LENGTH_PREFIX_LEN;
        if declared != actual {
            return Err(ProtocolError::LengthMismatch { declared, actual });
        }
        let tag = frame[LENGTH_PREFIX_LEN];
        Ok((
            tag,
            Self {
                bytes: frame,
                pos: LENGTH_PREFIX_LEN + 1,
            },
        ))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(ProtocolError::Truncated {
                needed: n,
                remaining,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Bytes not read yet.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Reads one byte.
    pub fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    /// Reads a boolean; any non-zero byte is `true`.
    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_byte()? != 0)
    }

    /// Reads a big-endian fixed-width integer.
    pub fn read_numeric<T: WireNumeric>(&mut self) -> Result<T, ProtocolError> {
        Ok(T::read_be(self.take(T::WIDTH)?))
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_numeric::<u16>()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Reads an options list.
    pub fn read_options(&mut self) -> Result<Vec<String>, ProtocolError> {
        let count = self.read_byte()?;
        (0..count).map(|_| self.read_string()).collect()
    }

    /// Fails unless every byte has been consumed.
    pub fn finish(self) -> Result<(), ProtocolError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(ProtocolError::InvalidMessage(format!(
                "{extra} trailing bytes"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =====================================================================
    // Building
    // =====================================================================

    #[test]
    fn test_begin_reserves_header_and_tag() {
        let mut msg = Message::begin(7u8);
        assert_eq!(msg.finalize(), &[0, 1, 7]);
    }

    #[test]
    fn test_add_numeric_big_endian() {
        let bytes = Message::begin(1u8)
            .add_numeric(0x0102u16)
            .unwrap()
            .add_numeric(-2i32)
            .unwrap()
            .into_bytes();
        assert_eq!(bytes, vec![0, 7, 1, 0x01, 0x02, 0xff, 0xff, 0xff, 0xfe]);
    }

    #[test]
    fn test_add_string_length_prefixed_without_terminator() {
        let bytes = Message::begin(2u8).add_string("abc").unwrap().into_bytes();
        assert_eq!(bytes, vec![0, 6, 2, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_add_options_count_then_strings() {
        let bytes = Message::begin(3u8)
            .add_options(&["yes", "no"])
            .unwrap()
            .into_bytes();
        assert_eq!(
            bytes,
            vec![0, 11, 3, 2, 0, 3, b'y', b'e', b's', 0, 2, b'n', b'o']
        );
    }

    #[test]
    fn test_finalize_is_idempotent_and_tracks_length() {
        let mut msg = Message::begin(1u8).add_byte(9u8).unwrap();
        let first = msg.finalize().to_vec();
        let second = msg.finalize().to_vec();
        assert_eq!(first, second);

        let mut msg = msg.add_byte(10u8).unwrap();
        assert_eq!(&msg.finalize()[..2], &[0, 3]);
    }

    #[test]
    fn test_roundtrip_through_reader() {
        let bytes = Message::begin(4u8)
            .add_byte(200u8)
            .unwrap()
            .add_bool(true)
            .unwrap()
            .add_numeric(u64::MAX - 1)
            .unwrap()
            .add_string("héllo")
            .unwrap()
            .add_options(&["a", "bb"])
            .unwrap()
            .add_numeric(-40i16)
            .unwrap()
            .into_bytes();

        let declared = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        assert_eq!(declared, bytes.len() - LENGTH_PREFIX_LEN);

        let (tag, mut reader) = MessageReader::open(&bytes).unwrap();
        assert_eq!(tag, 4);
        assert_eq!(reader.read_byte().unwrap(), 200);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_numeric::<u64>().unwrap(), u64::MAX - 1);
        assert_eq!(reader.read_string().unwrap(), "héllo");
        assert_eq!(reader.read_options().unwrap(), vec!["a", "bb"]);
        assert_eq!(reader.read_numeric::<i16>().unwrap(), -40);
        reader.finish().unwrap();
    }

    // =====================================================================
    // Overflow
    // =====================================================================

    #[test]
    fn test_add_string_past_limit_overflows() {
        let text = "x".repeat(MAX_MESSAGE_LEN);
        let err = Message::begin(1u8).add_string(&text).unwrap_err();
        assert!(matches!(err, ProtocolError::BufferOverflow { .. }));
    }

    #[test]
    fn test_fill_exactly_to_limit_then_one_more_byte_overflows() {
        // Header + tag = 3 bytes, string header = 2 bytes.
        let text = "x".repeat(MAX_MESSAGE_LEN - 5);
        let msg = Message::begin(1u8).add_string(&text).unwrap();
        assert_eq!(msg.len(), MAX_MESSAGE_LEN);

        let err = msg.add_byte(0u8).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::BufferOverflow {
                max: MAX_MESSAGE_LEN,
                attempted: MAX_MESSAGE_LEN + 1,
            }
        );
    }

    #[test]
    fn test_overflow_leaves_finalized_frame_untouched() {
        let mut msg = Message::begin(5u8).add_string("kept").unwrap();
        let frame = msg.finalize().to_vec();

        let attempt = msg.clone().add_string(&"y".repeat(2000));
        assert!(attempt.is_err());

        assert_eq!(msg.finalize(), frame.as_slice());
    }

    #[test]
    fn test_add_options_checks_whole_list_before_writing() {
        let big = "z".repeat(700);
        let err = Message::begin(1u8)
            .add_options(&[big.as_str(), big.as_str()])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::BufferOverflow { .. }));
    }

    #[test]
    fn test_add_options_more_than_255_rejected() {
        let options = vec![""; 256];
        let err = Message::begin(1u8).add_options(options.as_slice()).unwrap_err();
        assert_eq!(err, ProtocolError::TooManyOptions(256));
    }

    // =====================================================================
    // Reading
    // =====================================================================

    #[test]
    fn test_open_rejects_length_mismatch() {
        let err = MessageReader::open(&[0, 5, 1, 2]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::LengthMismatch {
                declared: 5,
                actual: 2,
            }
        );
    }

    #[test]
    fn test_read_string_truncated() {
        let (_, mut reader) = MessageReader::open(&[0, 3, 1, 0, 9]).unwrap();
        let err = reader.read_string().unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { needed: 9, .. }));
    }

    #[test]
    fn test_finish_reports_trailing_bytes() {
        let (_, reader) = MessageReader::open(&[0, 2, 1, 0]).unwrap();
        assert!(reader.finish().is_err());
    }
}
