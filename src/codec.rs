//! Point codec for replicated write batches
//!
//! A write batch is a contiguous run of frames. Each frame is a fixed
//! 16-byte header followed by the point's opaque payload:
//!
//! ```text
//! +-------------+----------------+---------------+------------------+
//! | series id   | payload length | timestamp     | payload          |
//! | u32 BE (4)  | u32 BE (4)     | i64 BE (8)    | payload length   |
//! +-------------+----------------+---------------+------------------+
//! ```
//!
//! A batch holds at least one frame and must be consumed exactly.

use byteorder::{BigEndian, ByteOrder};

use crate::shard::{ShardError, ShardResult};

/// Size of a point header, in bytes: series id + payload length + timestamp
pub const POINT_HEADER_SIZE: usize = 4 + 4 + 8;

/// Decoded point header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointHeader {
    pub series_id: u32,
    pub payload_len: u32,
    pub timestamp: i64,
}

/// Encode a point header
pub fn encode_point_header(series_id: u32, payload_len: u32, timestamp: i64) -> [u8; POINT_HEADER_SIZE] {
    let mut buf = [0u8; POINT_HEADER_SIZE];
    BigEndian::write_u32(&mut buf[0..4], series_id);
    BigEndian::write_u32(&mut buf[4..8], payload_len);
    BigEndian::write_i64(&mut buf[8..16], timestamp);
    buf
}

/// Decode a point header
pub fn decode_point_header(buf: &[u8; POINT_HEADER_SIZE]) -> PointHeader {
    PointHeader {
        series_id: BigEndian::read_u32(&buf[0..4]),
        payload_len: BigEndian::read_u32(&buf[4..8]),
        timestamp: BigEndian::read_i64(&buf[8..16]),
    }
}

/// Append one framed point to `buf`
pub fn encode_point(buf: &mut Vec<u8>, series_id: u32, timestamp: i64, payload: &[u8]) -> ShardResult<()> {
    let payload_len = u32::try_from(payload.len()).map_err(|_| ShardError::InvalidPointBuffer)?;
    buf.reserve(POINT_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&encode_point_header(series_id, payload_len, timestamp));
    buf.extend_from_slice(payload);
    Ok(())
}

/// One point borrowed from a write batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointFrame<'a> {
    pub series_id: u32,
    pub timestamp: i64,
    pub payload: &'a [u8],
}

/// Bounds-checked iterator over the frames of a write batch
///
/// Yields `Err(ShardError::InvalidPointBuffer)` once and then stops if a
/// header does not fit in the remaining bytes or a payload runs past the end.
/// An empty batch is malformed.
#[derive(Debug, Clone)]
pub struct BatchReader<'a> {
    remaining: &'a [u8],
    started: bool,
    done: bool,
}

impl<'a> BatchReader<'a> {
    /// Create a reader over an encoded batch
    pub fn new(batch: &'a [u8]) -> Self {
        Self {
            remaining: batch,
            started: false,
            done: false,
        }
    }

    fn fail(&mut self) -> Option<ShardResult<PointFrame<'a>>> {
        self.done = true;
        Some(Err(ShardError::InvalidPointBuffer))
    }
}

impl<'a> Iterator for BatchReader<'a> {
    type Item = ShardResult<PointFrame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.started && self.remaining.is_empty() {
            self.done = true;
            return None;
        }
        self.started = true;

        let Some((header, rest)) = self.remaining.split_first_chunk::<POINT_HEADER_SIZE>() else {
            return self.fail();
        };
        let header = decode_point_header(header);

        let payload_len = header.payload_len as usize;
        if payload_len > rest.len() {
            return self.fail();
        }
        let (payload, rest) = rest.split_at(payload_len);
        self.remaining = rest;

        Some(Ok(PointFrame {
            series_id: header.series_id,
            timestamp: header.timestamp,
            payload,
        }))
    }
}

/// Builder for encoded write batches
#[derive(Debug, Clone, Default)]
pub struct BatchWriter {
    buf: Vec<u8>,
    points: usize,
}

impl BatchWriter {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a point to the batch
    pub fn push(&mut self, series_id: u32, timestamp: i64, payload: &[u8]) -> ShardResult<&mut Self> {
        encode_point(&mut self.buf, series_id, timestamp, payload)?;
        self.points += 1;
        Ok(self)
    }

    /// Number of points in the batch
    pub fn len(&self) -> usize {
        self.points
    }

    /// Check if no point has been added
    pub fn is_empty(&self) -> bool {
        self.points == 0
    }

    /// Return the encoded batch
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
