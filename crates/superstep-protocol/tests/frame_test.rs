// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Frame and batch encoding tests for superstep-protocol.

use bytes::Bytes;
use superstep_protocol::batch::{BatchEncoder, decode_batch};
use superstep_protocol::control::{ControlFrame, ControlRequest, ControlResponse, control_response};
use superstep_protocol::frame::{Frame, FrameError, FrameKind, HEADER_SIZE, MAX_FRAME_SIZE};

#[test]
fn test_frame_kind_conversions() {
    assert_eq!(FrameKind::try_from(0u8).unwrap(), FrameKind::MessageBatch);
    assert_eq!(FrameKind::try_from(1u8).unwrap(), FrameKind::Control);
    assert!(FrameKind::try_from(2u8).is_err());
}

#[test]
fn test_batch_frame_reproduces_pairs_in_order() {
    let pairs: Vec<(u64, String)> = (0..257u64)
        .map(|i| ((i * 7919) % 1000, format!("msg-{}", i)))
        .collect();

    let mut encoder = BatchEncoder::new(2);
    for (gid, msg) in &pairs {
        encoder.push(*gid, msg).unwrap();
    }
    let wire = encoder.finish().unwrap().encode();

    let frame = Frame::decode_from_bytes(wire).unwrap();
    assert_eq!(frame.kind, FrameKind::MessageBatch);

    let decoder = decode_batch(frame.payload).unwrap();
    assert_eq!(decoder.dst_fid(), 2);
    let decoded: Vec<(u64, String)> = decoder
        .map(|entry| {
            let (gid, bytes) = entry.unwrap();
            (gid, <String as prost::Message>::decode(bytes).unwrap())
        })
        .collect();
    assert_eq!(decoded, pairs);
}

#[test]
fn test_frame_too_large_rejected() {
    let payload = Bytes::from(vec![0u8; MAX_FRAME_SIZE + 1]);
    match Frame::message_batch(payload) {
        Err(FrameError::FrameTooLarge(size)) => assert_eq!(size, MAX_FRAME_SIZE + 1),
        other => panic!("expected FrameTooLarge, got {:?}", other),
    }
}

#[test]
fn test_decode_incomplete_header() {
    let short = Bytes::from(vec![0u8; HEADER_SIZE - 1]);
    assert!(Frame::decode_from_bytes(short).is_err());
}

#[test]
fn test_control_response_through_frame() {
    let response = ControlResponse::barrier_ack(3, 9);
    let wire = ControlFrame::response(41, &response)
        .into_frame()
        .unwrap()
        .encode();

    let frame = Frame::decode_from_bytes(wire).unwrap();
    assert_eq!(frame.kind, FrameKind::Control);
    let control = ControlFrame::decode(frame.payload).unwrap();
    assert_eq!(control.request_id, 41);
    match control.decode_response().unwrap().body {
        Some(control_response::Body::BarrierAck(ack)) => {
            assert_eq!(ack.round, 3);
            assert_eq!(ack.batches_received, 9);
        }
        other => panic!("expected barrier ack, got {:?}", other),
    }
}

#[test]
fn test_handshake_request_fields() {
    let request = ControlRequest::handshake(1, 2, 3);
    let control = ControlFrame::request(0, &request);
    assert_eq!(control.decode_request().unwrap(), request);
}
