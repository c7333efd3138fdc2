//! Fixed-size framing envelope for [`crate::ProtoHeader`].
//!
//! Ported from the contract in `ProtoHeaderWrap` (see
//! `examples/original_source/src/proto/ProtoHeaderWrap.h`): every header is
//! wrapped in an envelope of exactly [`PROTO_HEADER_SIZE`] bytes so a reader
//! pulling raw bytes off the wire always knows how much to read for the next
//! header without first decoding it. The envelope is a 4-byte big-endian
//! length prefix followed by the protobuf-encoded `ProtoHeader`, zero-padded
//! out to the fixed size.
//!
//! This framing is exercised directly by the in-memory transport fake used
//! in `qserv-czar`'s tests (see `tests/` there) and is what
//! `AskForResponseDataCmd`-equivalent code pulls off a raw byte stream; the
//! `tonic`-based production transport frames `StreamItem`s itself and does
//! not need this module, but the envelope is still what a worker writes when
//! using `FileChannelShared`'s on-disk result files (one header envelope per
//! result message, see `qserv-worker::channel::file`).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;

use crate::ProtoHeader;

/// Size in bytes of the fixed framing envelope around one wrapped header.
pub const PROTO_HEADER_SIZE: usize = 255;

/// A single protobuf result payload must never exceed this many bytes.
/// Workers must flush/split before reaching it (spec.md section 6).
pub const PROTOBUFFER_HARD_LIMIT: usize = 100 * 1024 * 1024;

/// Recommended flush threshold, comfortably below the hard limit.
pub const PROTOBUFFER_DESIRED_LIMIT: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("header envelope truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("encoded header ({size} bytes) does not fit the {limit} byte envelope")]
    TooLarge { size: usize, limit: usize },
    #[error("malformed header envelope: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Wraps and unwraps [`ProtoHeader`] messages in the fixed-size envelope
/// described in spec.md section 6 ("Header wrapping").
pub struct ProtoHeaderWrap;

impl ProtoHeaderWrap {
    /// Encodes `header` into a new [`PROTO_HEADER_SIZE`]-byte buffer.
    pub fn wrap(header: &ProtoHeader) -> Result<Bytes, HeaderError> {
        let body_len = header.encoded_len();
        // 4-byte length prefix + body must fit in the fixed envelope.
        if body_len + 4 > PROTO_HEADER_SIZE {
            return Err(HeaderError::TooLarge {
                size: body_len,
                limit: PROTO_HEADER_SIZE - 4,
            });
        }
        let mut buf = BytesMut::with_capacity(PROTO_HEADER_SIZE);
        buf.put_u32(body_len as u32);
        header.encode(&mut buf)?;
        buf.resize(PROTO_HEADER_SIZE, 0);
        Ok(buf.freeze())
    }

    /// Decodes a header from the start of `buffer`, returning the header and
    /// the number of bytes consumed (always [`PROTO_HEADER_SIZE`] on success,
    /// so callers can advance a cursor uniformly).
    pub fn unwrap(buffer: &[u8]) -> Result<(ProtoHeader, usize), HeaderError> {
        if buffer.len() < PROTO_HEADER_SIZE {
            return Err(HeaderError::Truncated {
                need: PROTO_HEADER_SIZE,
                got: buffer.len(),
            });
        }
        let mut cursor = &buffer[..PROTO_HEADER_SIZE];
        let body_len = cursor.get_u32() as usize;
        if body_len + 4 > PROTO_HEADER_SIZE {
            return Err(HeaderError::TooLarge {
                size: body_len,
                limit: PROTO_HEADER_SIZE - 4,
            });
        }
        let header = ProtoHeader::decode(&cursor[..body_len])?;
        Ok((header, PROTO_HEADER_SIZE))
    }

    pub const fn size() -> usize {
        PROTO_HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_simple_header() {
        let header = ProtoHeader {
            payload_size: 4096,
            last: false,
            error_code: 0,
            error_msg: String::new(),
            attempt_count: 1,
        };
        let wrapped = ProtoHeaderWrap::wrap(&header).unwrap();
        assert_eq!(wrapped.len(), PROTO_HEADER_SIZE);
        let (decoded, consumed) = ProtoHeaderWrap::unwrap(&wrapped).unwrap();
        assert_eq!(consumed, PROTO_HEADER_SIZE);
        assert_eq!(decoded, header);
    }

    #[test]
    fn round_trips_a_last_header_with_error() {
        let header = ProtoHeader {
            payload_size: 0,
            last: true,
            error_code: 42,
            error_msg: "worker exploded".into(),
            attempt_count: 2,
        };
        let wrapped = ProtoHeaderWrap::wrap(&header).unwrap();
        let (decoded, _) = ProtoHeaderWrap::unwrap(&wrapped).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.last);
    }

    #[test]
    fn rejects_truncated_buffers() {
        let buf = vec![0u8; PROTO_HEADER_SIZE - 1];
        assert!(matches!(
            ProtoHeaderWrap::unwrap(&buf),
            Err(HeaderError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_oversized_headers() {
        let header = ProtoHeader {
            payload_size: 0,
            last: false,
            error_code: 0,
            error_msg: "x".repeat(PROTO_HEADER_SIZE),
            attempt_count: 0,
        };
        assert!(matches!(
            ProtoHeaderWrap::wrap(&header),
            Err(HeaderError::TooLarge { .. })
        ));
    }
}
