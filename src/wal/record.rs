//! Record framing for log segments.
//!
//! Each record is `len: u32 LE | crc32: u32 LE | payload`, the checksum
//! covering the payload only.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const RECORD_HEADER_SIZE: usize = 8;

/// Largest payload a record can frame.
pub const MAX_RECORD_PAYLOAD: usize = u32::MAX as usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record truncated at offset {offset}")]
    Truncated { offset: usize },
    #[error("record checksum mismatch at offset {offset}")]
    Checksum { offset: usize },
    #[error("record payload of {len} bytes does not fit a record")]
    TooLarge { len: usize },
}

/// Append the framed `payload` to `buf`.
pub fn encode_into(payload: &[u8], buf: &mut impl BufMut) -> Result<(), RecordError> {
    let len = u32::try_from(payload.len()).map_err(|_| RecordError::TooLarge {
        len: payload.len(),
    })?;
    buf.put_u32_le(len);
    buf.put_u32_le(crc32fast::hash(payload));
    buf.put_slice(payload);
    Ok(())
}

pub fn encode(payload: &[u8]) -> Result<Bytes, RecordError> {
    let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len());
    encode_into(payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Split a segment image back into payloads.
pub fn decode_all(mut data: &[u8]) -> Result<Vec<Bytes>, RecordError> {
    let mut offset = 0;
    let mut records = Vec::new();
    while !data.is_empty() {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(RecordError::Truncated { offset });
        }
        let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let crc = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let body = &data[RECORD_HEADER_SIZE..];
        if body.len() < len {
            return Err(RecordError::Truncated { offset });
        }
        let payload = &body[..len];
        if crc32fast::hash(payload) != crc {
            return Err(RecordError::Checksum { offset });
        }
        records.push(Bytes::copy_from_slice(payload));
        data = &body[len..];
        offset += RECORD_HEADER_SIZE + len;
    }
    Ok(records)
}
