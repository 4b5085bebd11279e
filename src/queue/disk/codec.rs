//! Frame format of the queue log.
//!
//! ```text
//! header: [MAGIC "ATDQ"][FORMAT_VERSION]
//! frame:  [FORMAT_VERSION][len: u32 LE][JSON payload][crc32(payload): u32 LE]
//! ```
//!
//! Decoding distinguishes a clean end of log, a torn frame (the log stops
//! partway through a frame, as a crash mid-append leaves it) and a corrupt
//! frame (complete, but failing its version, size or checksum check).

use std::io::{self, ErrorKind, Read, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::error::QueueError;

const FORMAT_VERSION: u8 = 1;

/// Magic bytes identifying a queue log.
pub const MAGIC: [u8; 4] = *b"ATDQ";

/// Size of the file header in bytes.
pub const HEADER_LEN: u64 = 5;

/// Version byte plus length prefix.
const PREFIX_LEN: usize = 5;
const CRC_LEN: usize = 4;

/// Largest payload accepted either way. Attribute records are small; a
/// length above this on decode is a corrupt prefix.
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Why a frame could not be produced or read back.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The log ends inside this frame.
    #[error("frame cut short by end of log")]
    Torn,

    /// The frame is complete but cannot be trusted.
    #[error("corrupt frame: {0}")]
    Corrupt(String),

    /// The entry cannot be written as a frame.
    #[error("cannot encode log entry: {0}")]
    Encode(String),

    /// Reading the log failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<FrameError> for QueueError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Torn | FrameError::Corrupt(_) => Self::Corrupted(err.to_string()),
            FrameError::Encode(message) => Self::Backend(message),
            FrameError::Io(e) => e.into(),
        }
    }
}

/// State of the log header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    /// Magic and version match.
    Valid,
    /// Fewer than [`HEADER_LEN`] bytes; the log was never initialized.
    Missing,
}

/// Serialize `value` into one checksummed frame.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(value).map_err(|e| FrameError::Encode(e.to_string()))?;
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::Encode(format!(
            "payload of {} bytes exceeds the {MAX_PAYLOAD} byte frame limit",
            payload.len()
        )));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| FrameError::Encode("payload length overflows u32".to_string()))?;

    let mut out = Vec::with_capacity(PREFIX_LEN + payload.len() + CRC_LEN);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&checksum(&payload).to_le_bytes());
    Ok(out)
}

/// Read the next frame. `Ok(None)` means the log ended on a frame boundary.
///
/// # Errors
/// - `Torn` if the log ends inside the frame
/// - `Corrupt` on an unknown version, oversized length, checksum mismatch
///   or undecodable payload
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> Result<Option<T>, FrameError> {
    let mut prefix = [0u8; PREFIX_LEN];
    match fill(reader, &mut prefix)? {
        0 => return Ok(None),
        n if n < PREFIX_LEN => return Err(FrameError::Torn),
        _ => {}
    }

    if prefix[0] != FORMAT_VERSION {
        return Err(FrameError::Corrupt(format!("unknown frame version {}", prefix[0])));
    }
    let len = u32::from_le_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]);
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    if len > MAX_PAYLOAD {
        return Err(FrameError::Corrupt(format!(
            "length {len} exceeds the {MAX_PAYLOAD} byte frame limit"
        )));
    }

    let mut body = vec![0u8; len + CRC_LEN];
    if fill(reader, &mut body)? < body.len() {
        return Err(FrameError::Torn);
    }
    let (payload, crc) = body.split_at(len);
    let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    let computed = checksum(payload);
    if stored != computed {
        return Err(FrameError::Corrupt(format!(
            "checksum mismatch: stored={stored:08x}, computed={computed:08x}"
        )));
    }

    serde_json::from_slice(payload)
        .map(Some)
        .map_err(|e| FrameError::Corrupt(format!("undecodable payload: {e}")))
}

/// Write the header of an empty log.
pub fn write_header(writer: &mut impl Write) -> io::Result<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[FORMAT_VERSION])
}

/// Check the header at the start of `reader`.
///
/// # Errors
/// - `Corrupt` if a full header is present but belongs to another format
pub fn read_header(reader: &mut impl Read) -> Result<Header, FrameError> {
    let mut header = [0u8; 5];
    if fill(reader, &mut header)? < header.len() {
        return Ok(Header::Missing);
    }
    if header[..4] != MAGIC {
        return Err(FrameError::Corrupt(format!(
            "not a queue log: magic {:?}",
            &header[..4]
        )));
    }
    if header[4] != FORMAT_VERSION {
        return Err(FrameError::Corrupt(format!(
            "unsupported log format version {} (expected {FORMAT_VERSION})",
            header[4]
        )));
    }
    Ok(Header::Valid)
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Read until `buf` is full or the reader is exhausted; returns bytes read.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame(text: &str) -> Vec<u8> {
        encode(&text.to_string()).unwrap()
    }

    #[test]
    fn consecutive_frames_then_clean_end() {
        let mut log = frame("first");
        log.extend(frame("second"));
        let mut cursor = Cursor::new(log);

        assert_eq!(decode::<String>(&mut cursor).unwrap().as_deref(), Some("first"));
        assert_eq!(decode::<String>(&mut cursor).unwrap().as_deref(), Some("second"));
        assert!(decode::<String>(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn every_cut_inside_a_frame_is_torn() {
        let whole = frame("queued attribute");
        for cut in 1..whole.len() {
            let err = decode::<String>(&mut Cursor::new(&whole[..cut])).unwrap_err();
            assert!(matches!(err, FrameError::Torn), "cut at {cut}: {err:?}");
        }
    }

    #[test]
    fn flipped_payload_byte_is_corrupt_not_torn() {
        let mut bytes = frame("queued attribute");
        bytes[PREFIX_LEN + 3] ^= 0xFF;

        let err = decode::<String>(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, FrameError::Corrupt(ref m) if m.contains("checksum")), "{err:?}");
        assert!(matches!(QueueError::from(err), QueueError::Corrupted(_)));
    }

    #[test]
    fn absurd_length_is_corrupt_without_allocating() {
        let mut bytes = vec![FORMAT_VERSION];
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());

        let err = decode::<String>(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, FrameError::Corrupt(ref m) if m.contains("frame limit")), "{err:?}");
    }

    #[test]
    fn unknown_frame_version_is_corrupt() {
        let mut bytes = frame("x");
        bytes[0] = FORMAT_VERSION + 1;
        assert!(matches!(
            decode::<String>(&mut Cursor::new(bytes)),
            Err(FrameError::Corrupt(_))
        ));
    }

    #[test]
    fn header_states() {
        let mut written = Vec::new();
        write_header(&mut written).unwrap();
        assert_eq!(written.len() as u64, HEADER_LEN);
        assert_eq!(read_header(&mut Cursor::new(&written)).unwrap(), Header::Valid);

        assert_eq!(read_header(&mut Cursor::new(b"")).unwrap(), Header::Missing);
        assert_eq!(read_header(&mut Cursor::new(b"ATD")).unwrap(), Header::Missing);

        let foreign = read_header(&mut Cursor::new(b"PK\x03\x04\x14")).unwrap_err();
        assert!(matches!(foreign, FrameError::Corrupt(ref m) if m.contains("not a queue log")));

        let newer = read_header(&mut Cursor::new(b"ATDQ\x02")).unwrap_err();
        assert!(matches!(newer, FrameError::Corrupt(ref m) if m.contains("version 2")));
    }
}
