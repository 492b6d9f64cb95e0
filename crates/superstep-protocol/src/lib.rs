// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Superstep Protocol - QUIC worker mesh for BSP message exchange
//!
//! This crate moves vertex-addressed message batches and barrier control
//! traffic between the workers of one job. Every worker listens on one
//! socket and dials every other worker once; the resulting links live for
//! the whole job.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    superstep-protocol                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Mesh: PeerMesh (dial side) + MeshServer (listen side)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Frames: message batches (kind 0) + control (kind 1)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn)                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Ordering
//!
//! Each ordered worker pair shares exactly one stream, so batches and the
//! barrier that follows them arrive in the order they were written. A
//! barrier acknowledgement therefore means every earlier batch on that
//! link has been applied by the receiver.
//!
//! # Usage
//!
//! ```ignore
//! use superstep_protocol::{MeshServer, MeshServerConfig, PeerMesh, PeerClientConfig, WorkerDirectory};
//!
//! let server = MeshServer::start(MeshServerConfig::default(), handler).await?;
//! let mesh = PeerMesh::connect(fid, &directory, PeerClientConfig::default()).await?;
//!
//! mesh.send_batch(peer, &batch_frame)?;
//! let acks = mesh.barrier(round, vote).await?;
//! ```

pub mod batch;
pub mod client;
pub mod control;
pub mod frame;
pub mod mesh;
pub mod server;

pub use batch::{BatchDecoder, BatchEncoder, decode_batch};
pub use client::{BarrierVote, ClientError, PeerClient, PeerClientConfig, PeerLink};
pub use control::{BarrierAck, BarrierRequest, ControlError, ControlFrame, ControlRequest, ControlResponse};
pub use frame::{Frame, FrameError, FrameKind};
pub use mesh::{PeerMesh, WorkerDirectory};
pub use server::{InboundHandler, MeshServer, MeshServerConfig, ServerError};
