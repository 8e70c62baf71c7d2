use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::wal::record::MAX_RECORD_PAYLOAD;

const TAG_PUT: u8 = 1;
const TAG_DELETE: u8 = 2;
/// `first_seq: u64 | len: u32` in front of every batch of a group payload.
pub(crate) const GROUP_MEMBER_HEADER: usize = 12;
/// Largest encoded batch that still fits a log record on its own.
pub const MAX_BATCH_BYTES: usize = MAX_RECORD_PAYLOAD - GROUP_MEMBER_HEADER;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Bytes, value: Bytes },
    Delete { key: Bytes },
}

impl BatchOp {
    pub fn key(&self) -> &Bytes {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

/// Ordered mutations applied atomically.
///
/// Each operation consumes one sequence number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    approx_bytes: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> &mut Self {
        let (key, value) = (key.into(), value.into());
        self.approx_bytes += key.len() + value.len();
        self.ops.push(BatchOp::Put { key, value });
        self
    }

    pub fn delete(&mut self, key: impl Into<Bytes>) -> &mut Self {
        let key = key.into();
        self.approx_bytes += key.len();
        self.ops.push(BatchOp::Delete { key });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Key and value bytes held by the batch.
    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Size of [`WriteBatch::encode`]'s output.
    pub fn encoded_len(&self) -> usize {
        4 + self
            .ops
            .iter()
            .map(|op| match op {
                BatchOp::Put { key, value } => 9 + key.len() + value.len(),
                BatchOp::Delete { key } => 5 + key.len(),
            })
            .sum::<usize>()
    }

    /// `count: u32 | (tag: u8 | key_len: u32 | key | [value_len: u32 | value])*`
    pub fn encode(&self) -> Result<Bytes, BatchTooLarge> {
        let len = self.encoded_len();
        check_batch_len(len)?;
        // Every length below is bounded by `len`, so none of them truncates.
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u32_le(self.ops.len() as u32);
        for op in &self.ops {
            match op {
                BatchOp::Put { key, value } => {
                    buf.put_u8(TAG_PUT);
                    put_slice(&mut buf, key);
                    put_slice(&mut buf, value);
                }
                BatchOp::Delete { key } => {
                    buf.put_u8(TAG_DELETE);
                    put_slice(&mut buf, key);
                }
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, BatchDecodeError> {
        let count = take_u32(&mut buf)? as usize;
        let mut batch = WriteBatch::new();
        for _ in 0..count {
            if buf.remaining() < 1 {
                return Err(BatchDecodeError::Truncated);
            }
            match buf.get_u8() {
                TAG_PUT => {
                    let key = take_slice(&mut buf)?;
                    let value = take_slice(&mut buf)?;
                    batch.put(key, value);
                }
                TAG_DELETE => {
                    let key = take_slice(&mut buf)?;
                    batch.delete(key);
                }
                tag => return Err(BatchDecodeError::UnknownTag(tag)),
            }
        }
        if buf.has_remaining() {
            return Err(BatchDecodeError::TrailingBytes(buf.remaining()));
        }
        Ok(batch)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("batch of {len} bytes exceeds the {MAX_BATCH_BYTES} byte limit")]
pub struct BatchTooLarge {
    pub len: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchDecodeError {
    #[error("batch truncated")]
    Truncated,
    #[error("unknown batch op tag {0}")]
    UnknownTag(u8),
    #[error("{0} trailing bytes after batch")]
    TrailingBytes(usize),
}

/// Log payload for one group: `(first_seq: u64 | len: u32 | batch)*` for every
/// member that writes to the log.
///
/// Group formation keeps the payload within [`MAX_RECORD_PAYLOAD`].
pub(crate) fn encode_group<'a>(members: impl IntoIterator<Item = (u64, &'a Bytes)>) -> Bytes {
    let mut buf = BytesMut::new();
    for (first_seq, batch) in members {
        buf.put_u64_le(first_seq);
        put_slice(&mut buf, batch);
    }
    buf.freeze()
}

/// Inverse of [`encode_group`].
pub fn decode_group(mut buf: Bytes) -> Result<Vec<(u64, WriteBatch)>, BatchDecodeError> {
    let mut members = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 8 {
            return Err(BatchDecodeError::Truncated);
        }
        let first_seq = buf.get_u64_le();
        let batch = take_slice(&mut buf)?;
        members.push((first_seq, WriteBatch::decode(batch)?));
    }
    Ok(members)
}

fn check_batch_len(len: usize) -> Result<(), BatchTooLarge> {
    if len > MAX_BATCH_BYTES {
        Err(BatchTooLarge { len })
    } else {
        Ok(())
    }
}

fn put_slice(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn take_u32(buf: &mut Bytes) -> Result<u32, BatchDecodeError> {
    if buf.remaining() < 4 {
        return Err(BatchDecodeError::Truncated);
    }
    Ok(buf.get_u32_le())
}

fn take_slice(buf: &mut Bytes) -> Result<Bytes, BatchDecodeError> {
    let len = take_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(BatchDecodeError::Truncated);
    }
    Ok(buf.split_to(len))
}
