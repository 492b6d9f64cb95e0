// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound message batching.
//!
//! Compute threads append `(gid, message)` pairs per destination fragment.
//! Remote batches are encoded and handed to a [`BatchSender`] on flush, or
//! early once they reach the flush threshold. The batch addressed to the
//! owning fragment never touches the network; it is retired straight into
//! the local `next` store.

use parking_lot::Mutex;
use superstep_protocol::batch::ENTRY_HEADER_SIZE;
use superstep_protocol::frame::MAX_FRAME_SIZE;
use superstep_protocol::{BatchEncoder, Frame, FrameError};
use tracing::{debug, trace};

use crate::error::{CoreError, Phase, Result};
use crate::fragment::{Fragment, FragmentId, Gid};
use crate::message::Message;
use crate::store::{MessageStore, StoreError};

/// Hands encoded batches to the transport.
pub trait BatchSender {
    fn send_batch(&self, dst: FragmentId, frame: &Frame) -> Result<()>;
}

pub struct SendCache<M> {
    local_fid: FragmentId,
    batches: Vec<Mutex<Vec<(Gid, M)>>>,
    threshold: usize,
}

impl<M: Message> SendCache<M> {
    /// One batch per fragment of the job, `fnum` in total.
    pub fn new(local_fid: FragmentId, fnum: u32, threshold: usize) -> Self {
        Self {
            local_fid,
            batches: (0..fnum.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            threshold: threshold.max(1),
        }
    }

    pub fn local_fid(&self) -> FragmentId {
        self.local_fid
    }

    /// Append a message for `gid` owned by fragment `dst`.
    ///
    /// Returns the encoded batch frames when the remote batch for `dst`
    /// reached the flush threshold; the caller must hand them to the
    /// transport. Batches for the local fragment are never returned.
    pub fn send_message(&self, dst: FragmentId, gid: Gid, msg: M) -> Result<Vec<Frame>> {
        let slot = self.batches.get(dst as usize).ok_or_else(|| {
            CoreError::invalid_state(
                self.local_fid,
                Phase::Send,
                format!(
                    "destination fragment {} out of range ({} fragments)",
                    dst,
                    self.batches.len()
                ),
            )
        })?;

        let full = {
            let mut batch = slot.lock();
            batch.push((gid, msg));
            if dst == self.local_fid || batch.len() < self.threshold {
                return Ok(Vec::new());
            }
            std::mem::take(&mut *batch)
        };

        trace!(dst, messages = full.len(), "batch reached flush threshold");
        self.encode(dst, full)
    }

    /// Encode every pending remote batch and hand it to `sender`.
    ///
    /// Returns the number of frames sent. Does nothing when no remote
    /// message is pending.
    pub fn flush_message(&self, sender: &dyn BatchSender) -> Result<usize> {
        let mut sent = 0;
        for (dst, slot) in self.batches.iter().enumerate() {
            let dst = dst as FragmentId;
            if dst == self.local_fid {
                continue;
            }
            let pending = std::mem::take(&mut *slot.lock());
            if pending.is_empty() {
                continue;
            }
            for frame in self.encode(dst, pending)? {
                sender.send_batch(dst, &frame)?;
                sent += 1;
            }
        }
        if sent > 0 {
            debug!(worker = self.local_fid, frames = sent, "flushed send cache");
        }
        Ok(sent)
    }

    /// Deliver the batch addressed to this fragment into `store`.
    ///
    /// Returns the number of messages delivered.
    pub fn remove_message_to_self<F, S>(&self, fragment: &F, store: &S) -> Result<usize>
    where
        F: Fragment + ?Sized,
        S: MessageStore<M> + ?Sized,
    {
        let Some(slot) = self.batches.get(self.local_fid as usize) else {
            return Ok(0);
        };
        let pending = std::mem::take(&mut *slot.lock());
        let delivered = pending.len();

        for (gid, msg) in pending {
            let lid = fragment.inner_gid_to_lid(gid).ok_or_else(|| {
                CoreError::invalid_state(
                    self.local_fid,
                    Phase::Send,
                    format!("global id {} is not an inner vertex of fragment {}", gid, self.local_fid),
                )
            })?;
            store.push(lid, msg).map_err(|e| match e {
                StoreError::OutOfRange {
                    lid,
                    inner_vertex_count,
                } => CoreError::IndexOutOfBounds {
                    worker: self.local_fid,
                    lid: u64::from(lid),
                    inner_vertex_count,
                },
            })?;
        }
        Ok(delivered)
    }

    /// Drop every pending batch without sending it.
    pub fn clear(&self) {
        for slot in &self.batches {
            slot.lock().clear();
        }
    }

    /// Messages currently waiting in any batch
    pub fn pending_messages(&self) -> usize {
        self.batches.iter().map(|slot| slot.lock().len()).sum()
    }

    /// Encode `pending` for `dst`, splitting at the frame size limit.
    fn encode(&self, dst: FragmentId, pending: Vec<(Gid, M)>) -> Result<Vec<Frame>> {
        let serialization = |e: FrameError| CoreError::SerializationFailure {
            worker: self.local_fid,
            peer: Some(dst),
            phase: Phase::Send,
            details: e.to_string(),
        };

        let mut frames = Vec::new();
        let mut encoder = BatchEncoder::new(dst);
        for (gid, msg) in &pending {
            let projected = encoder.payload_len() + ENTRY_HEADER_SIZE + msg.encoded_len();
            if projected > MAX_FRAME_SIZE && !encoder.is_empty() {
                let full = std::mem::replace(&mut encoder, BatchEncoder::new(dst));
                frames.push(full.finish().map_err(serialization)?);
            }
            encoder.push(*gid, msg).map_err(serialization)?;
        }
        if !encoder.is_empty() {
            frames.push(encoder.finish().map_err(serialization)?);
        }
        Ok(frames)
    }
}
