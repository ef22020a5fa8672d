//! Wire framing for change batches.
//!
//! Every batch travels through a pipe as a single frame:
//!
//! ```text
//! [identity: u64, optional][length: i64][length bytes of UTF-8]
//! ```
//!
//! Integers use native byte order since both ends live in the same process.
//! The payload holds the changed paths joined by `'\n'`. A zero length is the
//! "no payload" sentinel and decodes to an empty batch.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, WatcherError};

/// Separator between paths inside a payload.
pub const PATH_SEPARATOR: u8 = b'\n';

/// Size of the length field.
pub const LENGTH_LEN: usize = std::mem::size_of::<i64>();

/// Size of the identity field.
pub const IDENTITY_LEN: usize = std::mem::size_of::<u64>();

/// Payloads larger than this are treated as corruption.
pub const MAX_PAYLOAD_LEN: i64 = 64 * 1024 * 1024;

static NEXT_WATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity token prefixed to frames on a shared channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(u64);

impl WatcherId {
    /// Allocate a fresh, process-unique identity.
    pub fn next() -> Self {
        Self(NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw token value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for WatcherId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watcher-{}", self.0)
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sender identity, present on shared channels only.
    pub identity: Option<WatcherId>,

    /// Changed paths in the order they were written. Empty for the sentinel.
    pub paths: Vec<String>,
}

impl Frame {
    /// Whether this is the "no payload" sentinel.
    pub fn is_signal(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Number of payload bytes needed for `paths`: the sum of their lengths plus
/// one separator between each pair.
pub fn payload_len<S: AsRef<str>>(paths: &[S]) -> usize {
    let bytes: usize = paths.iter().map(|p| p.as_ref().len()).sum();
    bytes + paths.len().saturating_sub(1)
}

/// Encode one batch. Callers must not pass empty paths or paths containing
/// `'\n'`; those cannot be told apart from separators on the way back.
pub fn encode<S: AsRef<str>>(identity: Option<WatcherId>, paths: &[S]) -> BytesMut {
    let len = payload_len(paths);
    let header = if identity.is_some() {
        IDENTITY_LEN + LENGTH_LEN
    } else {
        LENGTH_LEN
    };

    let mut buf = BytesMut::with_capacity(header + len);
    if let Some(id) = identity {
        buf.put_u64_ne(id.as_u64());
    }
    buf.put_i64_ne(len as i64);
    for (i, path) in paths.iter().enumerate() {
        let path = path.as_ref();
        debug_assert!(!path.is_empty() && !path.contains('\n'));
        if i > 0 {
            buf.put_u8(PATH_SEPARATOR);
        }
        buf.put_slice(path.as_bytes());
    }
    buf
}

/// Incremental frame decoder over a receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    with_identity: bool,
}

impl FrameDecoder {
    /// Decoder for frames without an identity prefix.
    pub fn plain() -> Self {
        Self {
            with_identity: false,
        }
    }

    /// Decoder for frames carrying an identity prefix.
    pub fn tagged() -> Self {
        Self {
            with_identity: true,
        }
    }

    fn header_len(self) -> usize {
        if self.with_identity {
            IDENTITY_LEN + LENGTH_LEN
        } else {
            LENGTH_LEN
        }
    }

    /// Total size of the frame at the front of `buf`, if its header is there.
    fn frame_len(self, buf: &[u8]) -> Result<Option<usize>> {
        let header = self.header_len();
        if buf.len() < header {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LENGTH_LEN];
        len_bytes.copy_from_slice(&buf[header - LENGTH_LEN..header]);
        let len = i64::from_ne_bytes(len_bytes);
        if !(0..=MAX_PAYLOAD_LEN).contains(&len) {
            return Err(WatcherError::Protocol(format!(
                "frame length {len} out of range"
            )));
        }
        Ok(Some(header + len as usize))
    }

    /// Whether `buf` starts with a complete frame.
    pub fn has_frame(self, buf: &[u8]) -> Result<bool> {
        Ok(self
            .frame_len(buf)?
            .is_some_and(|frame_len| buf.len() >= frame_len))
    }

    /// Take one complete frame off the front of `buf`. Leaves `buf` untouched
    /// and returns `None` when the frame is not complete yet.
    pub fn decode(self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        let Some(frame_len) = self.frame_len(buf)? else {
            return Ok(None);
        };
        if buf.len() < frame_len {
            return Ok(None);
        }

        let identity = self.with_identity.then(|| WatcherId(buf.get_u64_ne()));
        let len = buf.get_i64_ne() as usize;
        let payload = buf.split_to(len);

        let text = std::str::from_utf8(&payload)
            .map_err(|e| WatcherError::Protocol(format!("payload is not valid UTF-8: {e}")))?;
        let paths = if text.is_empty() {
            Vec::new()
        } else {
            text.split('\n').map(String::from).collect()
        };

        Ok(Some(Frame { identity, paths }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_round_trip() {
        let mut buf = encode(None, &["a", "b/c", "d"]);
        let frame = FrameDecoder::plain().decode(&mut buf).unwrap().unwrap();

        assert_eq!(frame.identity, None);
        assert_eq!(frame.paths, vec!["a", "b/c", "d"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_length_counts_separators() {
        assert_eq!(payload_len(&["a", "b/c", "d"]), 7);
        assert_eq!(payload_len::<&str>(&[]), 0);

        let buf = encode(None, &["a", "b/c", "d"]);
        assert_eq!(buf.len(), LENGTH_LEN + 7);
        assert_eq!(&buf[..LENGTH_LEN], &7i64.to_ne_bytes());
    }

    #[test]
    fn test_sentinel_decodes_to_empty_batch() {
        let mut buf = encode::<&str>(None, &[]);
        let frame = FrameDecoder::plain().decode(&mut buf).unwrap().unwrap();

        assert!(frame.is_signal());
        assert_eq!(frame.paths, Vec::<String>::new());
    }

    #[test]
    fn test_tagged_frames() {
        let id = WatcherId::from(42);
        let mut buf = encode(Some(id), &["/tmp/x"]);
        buf.extend_from_slice(&encode(Some(WatcherId::from(7)), &["/tmp/y", "/tmp/z"]));

        let decoder = FrameDecoder::tagged();
        let first = decoder.decode(&mut buf).unwrap().unwrap();
        let second = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.identity, Some(id));
        assert_eq!(first.paths, vec!["/tmp/x"]);
        assert_eq!(second.identity, Some(WatcherId::from(7)));
        assert_eq!(second.paths, vec!["/tmp/y", "/tmp/z"]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_partial_frame_is_left_in_place() {
        let full = encode(None, &["/some/dir"]);
        let mut buf = BytesMut::from(&full[..full.len() - 3]);

        assert!(!FrameDecoder::plain().has_frame(&buf).unwrap());
        assert_eq!(FrameDecoder::plain().decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), full.len() - 3);

        buf.extend_from_slice(&full[full.len() - 3..]);
        assert!(FrameDecoder::plain().has_frame(&buf).unwrap());
    }

    #[test]
    fn test_negative_length_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_i64_ne(-5);

        let result = FrameDecoder::plain().decode(&mut buf);
        assert!(matches!(result, Err(WatcherError::Protocol(_))));
    }

    #[test]
    fn test_invalid_utf8_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_i64_ne(2);
        buf.put_slice(&[0xff, 0xfe]);

        let result = FrameDecoder::plain().decode(&mut buf);
        assert!(matches!(result, Err(WatcherError::Protocol(_))));
    }

    #[test]
    fn test_watcher_ids_are_unique() {
        let a = WatcherId::next();
        let b = WatcherId::next();
        assert_ne!(a, b);
    }
}
