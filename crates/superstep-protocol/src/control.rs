// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control frames: handshake and barrier request/response traffic.
//!
//! A [`FrameKind::Control`](crate::frame::FrameKind) payload is laid out as:
//!
//! ```text
//! [8B request id][1B direction][4B body len][protobuf body]
//! ```
//!
//! Requests and responses share the request id so a response can be matched
//! to the caller waiting on it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;

use crate::frame::{Frame, FrameError};

/// Control payload header size (request id + direction + body length)
pub const CONTROL_HEADER_SIZE: usize = 13;

/// First frame on every mesh connection.
#[derive(Clone, PartialEq, Message)]
pub struct Handshake {
    /// Fragment of the connecting worker
    #[prost(uint32, tag = "1")]
    pub src_fid: u32,
    /// Fragment the connecting worker expects to reach
    #[prost(uint32, tag = "2")]
    pub dst_fid: u32,
    /// Number of fragments in the job
    #[prost(uint32, tag = "3")]
    pub frag_num: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct HandshakeAck {
    #[prost(uint32, tag = "1")]
    pub fid: u32,
}

/// Sent by a worker to every peer once it has finished sending for a round.
#[derive(Clone, PartialEq, Message)]
pub struct BarrierRequest {
    #[prost(uint64, tag = "1")]
    pub round: u64,
    /// Messages the sender produced this round, local deliveries included
    #[prost(uint64, tag = "2")]
    pub messages_sent: u64,
    #[prost(bool, tag = "3")]
    pub force_continue: bool,
    /// Sender's contribution to the per-round global sum
    #[prost(sint64, tag = "4")]
    pub aggregate: i64,
    /// Batches the sender wrote on this connection since the previous barrier
    #[prost(uint64, tag = "5")]
    pub batches_sent: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct BarrierAck {
    #[prost(uint64, tag = "1")]
    pub round: u64,
    /// Batches the receiver applied from this connection since the previous barrier
    #[prost(uint64, tag = "2")]
    pub batches_received: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ControlError {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ControlRequest {
    #[prost(oneof = "control_request::Body", tags = "1, 2")]
    pub body: Option<control_request::Body>,
}

pub mod control_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        Handshake(super::Handshake),
        #[prost(message, tag = "2")]
        Barrier(super::BarrierRequest),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ControlResponse {
    #[prost(oneof = "control_response::Body", tags = "1, 2, 3")]
    pub body: Option<control_response::Body>,
}

pub mod control_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        HandshakeAck(super::HandshakeAck),
        #[prost(message, tag = "2")]
        BarrierAck(super::BarrierAck),
        #[prost(message, tag = "3")]
        Error(super::ControlError),
    }
}

impl ControlRequest {
    pub fn handshake(src_fid: u32, dst_fid: u32, frag_num: u32) -> Self {
        Self {
            body: Some(control_request::Body::Handshake(Handshake {
                src_fid,
                dst_fid,
                frag_num,
            })),
        }
    }

    pub fn barrier(barrier: BarrierRequest) -> Self {
        Self {
            body: Some(control_request::Body::Barrier(barrier)),
        }
    }
}

impl ControlResponse {
    pub fn handshake_ack(fid: u32) -> Self {
        Self {
            body: Some(control_response::Body::HandshakeAck(HandshakeAck { fid })),
        }
    }

    pub fn barrier_ack(round: u64, batches_received: u64) -> Self {
        Self {
            body: Some(control_response::Body::BarrierAck(BarrierAck {
                round,
                batches_received,
            })),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            body: Some(control_response::Body::Error(ControlError {
                code: code.into(),
                message: message.into(),
            })),
        }
    }
}

/// Whether a control frame carries a request or a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlDirection {
    Request = 0,
    Response = 1,
}

impl TryFrom<u8> for ControlDirection {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0 => Ok(ControlDirection::Request),
            1 => Ok(ControlDirection::Response),
            _ => Err(FrameError::Malformed(format!(
                "invalid control direction: {}",
                value
            ))),
        }
    }
}

/// Decoded control payload with an opaque protobuf body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub request_id: u64,
    pub direction: ControlDirection,
    pub body: Bytes,
}

impl ControlFrame {
    pub fn request(request_id: u64, request: &ControlRequest) -> Self {
        Self {
            request_id,
            direction: ControlDirection::Request,
            body: Bytes::from(request.encode_to_vec()),
        }
    }

    pub fn response(request_id: u64, response: &ControlResponse) -> Self {
        Self {
            request_id,
            direction: ControlDirection::Response,
            body: Bytes::from(response.encode_to_vec()),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONTROL_HEADER_SIZE + self.body.len());
        buf.put_u64(self.request_id);
        buf.put_u8(self.direction as u8);
        buf.put_u32(self.body.len() as u32);
        buf.put(self.body.clone());
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, FrameError> {
        if payload.len() < CONTROL_HEADER_SIZE {
            return Err(FrameError::Malformed(format!(
                "control header needs {} bytes, got {}",
                CONTROL_HEADER_SIZE,
                payload.len()
            )));
        }
        let request_id = payload.get_u64();
        let direction = ControlDirection::try_from(payload.get_u8())?;
        let len = payload.get_u32() as usize;
        if payload.len() != len {
            return Err(FrameError::Malformed(format!(
                "control body declares {} bytes, got {}",
                len,
                payload.len()
            )));
        }
        Ok(Self {
            request_id,
            direction,
            body: payload,
        })
    }

    /// Wrap into a kind-1 frame
    pub fn into_frame(self) -> Result<Frame, FrameError> {
        Frame::control(self.encode())
    }

    pub fn decode_request(&self) -> Result<ControlRequest, FrameError> {
        self.expect(ControlDirection::Request)?;
        Ok(ControlRequest::decode(self.body.clone())?)
    }

    pub fn decode_response(&self) -> Result<ControlResponse, FrameError> {
        self.expect(ControlDirection::Response)?;
        Ok(ControlResponse::decode(self.body.clone())?)
    }

    fn expect(&self, direction: ControlDirection) -> Result<(), FrameError> {
        if self.direction != direction {
            return Err(FrameError::Malformed(format!(
                "expected {:?} control frame, got {:?}",
                direction, self.direction
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;

    #[test]
    fn test_barrier_request_through_frame() {
        let request = ControlRequest::barrier(BarrierRequest {
            round: 4,
            messages_sent: 12,
            force_continue: true,
            aggregate: -3,
            batches_sent: 2,
        });
        let frame = ControlFrame::request(77, &request).into_frame().unwrap();
        assert_eq!(frame.kind, FrameKind::Control);

        let decoded = ControlFrame::decode(frame.payload).unwrap();
        assert_eq!(decoded.request_id, 77);
        assert_eq!(decoded.direction, ControlDirection::Request);
        assert_eq!(decoded.decode_request().unwrap(), request);
    }

    #[test]
    fn test_direction_mismatch_is_rejected() {
        let frame = ControlFrame::response(1, &ControlResponse::handshake_ack(2));
        assert!(frame.decode_request().is_err());
        assert!(frame.decode_response().is_ok());
    }

    #[test]
    fn test_body_length_mismatch_is_rejected() {
        let mut encoded =
            BytesMut::from(&ControlFrame::request(1, &ControlRequest::handshake(0, 1, 2)).encode()[..]);
        encoded.put_u8(0);
        assert!(matches!(
            ControlFrame::decode(encoded.freeze()),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_invalid_direction() {
        let mut buf = BytesMut::new();
        buf.put_u64(1);
        buf.put_u8(7);
        buf.put_u32(0);
        assert!(ControlFrame::decode(buf.freeze()).is_err());
    }

    #[test]
    fn test_error_response_fields() {
        let response = ControlResponse::error("INVALID_STATE", "bad gid");
        match response.body {
            Some(control_response::Body::Error(err)) => {
                assert_eq!(err.code, "INVALID_STATE");
                assert_eq!(err.message, "bad gid");
            }
            _ => panic!("expected error body"),
        }
    }
}
