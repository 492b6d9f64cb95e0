// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message batch payloads.
//!
//! A [`FrameKind::MessageBatch`](crate::frame::FrameKind) payload is laid out as:
//!
//! ```text
//! [4B dst fid][4B count][count x ( [8B gid][4B len][len bytes] )]
//! ```
//!
//! All integers are big-endian. Entries keep the order they were pushed in.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::frame::{Frame, FrameError, MAX_FRAME_SIZE};

/// Size of the batch header (destination fid + entry count)
pub const BATCH_HEADER_SIZE: usize = 8;

/// Per-entry overhead (global id + message length)
pub const ENTRY_HEADER_SIZE: usize = 12;

/// Incrementally builds one message batch for a destination fragment.
#[derive(Debug)]
pub struct BatchEncoder {
    dst_fid: u32,
    count: u32,
    body: BytesMut,
}

impl BatchEncoder {
    pub fn new(dst_fid: u32) -> Self {
        Self::with_capacity(dst_fid, 0)
    }

    /// Create an encoder with room for `bytes` of entry data
    pub fn with_capacity(dst_fid: u32, bytes: usize) -> Self {
        Self {
            dst_fid,
            count: 0,
            body: BytesMut::with_capacity(bytes),
        }
    }

    pub fn dst_fid(&self) -> u32 {
        self.dst_fid
    }

    /// Number of entries pushed so far
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Size the finished payload will have
    pub fn payload_len(&self) -> usize {
        BATCH_HEADER_SIZE + self.body.len()
    }

    /// Serialize `msg` and append it addressed to `gid`.
    pub fn push<M: prost::Message>(&mut self, gid: u64, msg: &M) -> Result<(), FrameError> {
        let len = msg.encoded_len();
        self.check_room(len)?;
        self.body.reserve(ENTRY_HEADER_SIZE + len);
        self.body.put_u64(gid);
        self.body.put_u32(len as u32);
        msg.encode(&mut self.body)?;
        self.count += 1;
        Ok(())
    }

    /// Append an already serialized message addressed to `gid`.
    pub fn push_raw(&mut self, gid: u64, encoded: &[u8]) -> Result<(), FrameError> {
        self.check_room(encoded.len())?;
        self.body.reserve(ENTRY_HEADER_SIZE + encoded.len());
        self.body.put_u64(gid);
        self.body.put_u32(encoded.len() as u32);
        self.body.put_slice(encoded);
        self.count += 1;
        Ok(())
    }

    fn check_room(&self, msg_len: usize) -> Result<(), FrameError> {
        let projected = self.payload_len() + ENTRY_HEADER_SIZE + msg_len;
        if projected > MAX_FRAME_SIZE || msg_len > u32::MAX as usize {
            return Err(FrameError::FrameTooLarge(projected));
        }
        if self.count == u32::MAX {
            return Err(FrameError::Malformed("batch entry count overflow".into()));
        }
        Ok(())
    }

    /// Finish the batch into a payload without the frame header
    pub fn into_payload(self) -> Bytes {
        let mut payload = BytesMut::with_capacity(self.payload_len());
        payload.put_u32(self.dst_fid);
        payload.put_u32(self.count);
        payload.put(self.body);
        payload.freeze()
    }

    /// Finish the batch into a ready-to-send frame
    pub fn finish(self) -> Result<Frame, FrameError> {
        Frame::message_batch(self.into_payload())
    }
}

/// Iterator over the entries of a received batch payload.
///
/// Yields `(gid, message bytes)` pairs; message bytes share the payload
/// buffer, no copy is made.
#[derive(Debug)]
pub struct BatchDecoder {
    dst_fid: u32,
    count: u32,
    remaining: u32,
    buf: Bytes,
}

impl BatchDecoder {
    /// Destination fragment the batch was addressed to
    pub fn dst_fid(&self) -> u32 {
        self.dst_fid
    }

    /// Entry count declared in the batch header
    pub fn count(&self) -> u32 {
        self.count
    }

    fn next_entry(&mut self) -> Result<(u64, Bytes), FrameError> {
        if self.buf.remaining() < ENTRY_HEADER_SIZE {
            return Err(FrameError::Malformed(format!(
                "truncated entry header with {} entries outstanding",
                self.remaining
            )));
        }
        let gid = self.buf.get_u64();
        let len = self.buf.get_u32() as usize;
        if self.buf.remaining() < len {
            return Err(FrameError::Malformed(format!(
                "entry for gid {} declares {} bytes, {} available",
                gid,
                len,
                self.buf.remaining()
            )));
        }
        let msg = self.buf.split_to(len);
        self.remaining -= 1;
        if self.remaining == 0 && self.buf.has_remaining() {
            return Err(FrameError::Malformed(format!(
                "{} trailing bytes after last entry",
                self.buf.remaining()
            )));
        }
        Ok((gid, msg))
    }
}

impl Iterator for BatchDecoder {
    type Item = Result<(u64, Bytes), FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let entry = self.next_entry();
        if entry.is_err() {
            // stop after the first malformed entry
            self.remaining = 0;
        }
        Some(entry)
    }
}

/// Parse the header of a batch payload.
pub fn decode_batch(mut payload: Bytes) -> Result<BatchDecoder, FrameError> {
    if payload.len() < BATCH_HEADER_SIZE {
        return Err(FrameError::Malformed(format!(
            "batch header needs {} bytes, got {}",
            BATCH_HEADER_SIZE,
            payload.len()
        )));
    }
    let dst_fid = payload.get_u32();
    let count = payload.get_u32();
    if count == 0 && payload.has_remaining() {
        return Err(FrameError::Malformed(
            "empty batch carries trailing bytes".into(),
        ));
    }
    Ok(BatchDecoder {
        dst_fid,
        count,
        remaining: count,
        buf: payload,
    })
}
