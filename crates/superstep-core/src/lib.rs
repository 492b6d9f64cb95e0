// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Superstep Core - BSP message passing and superstep synchronization
//!
//! This crate moves vertex messages between the fragments of a partitioned
//! graph and keeps every worker of a job in lock-step: a message sent in
//! round N is visible exactly in round N+1, and the job stops only when all
//! workers agree.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Compute driver (Worker + App)                      │
//! │                 PEval once, then IncEval until terminate                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           MessageManager                                 │
//! │   current store ◀── swap ──▶ next store        SendCache    Barrier     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           ▲ inbound batches                         │ outbound batches
//!           │                                         ▼
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │      MeshServer       │◀───── QUIC ───────▶│          PeerMesh           │
//! │  (one socket/worker)  │   one stream per   │   (one link per peer)       │
//! └───────────────────────┘   ordered pair     └─────────────────────────────┘
//!                  dedicated I/O runtime (ioThreads)
//! ```
//!
//! # Superstep contract
//!
//! | Call | State | Effect |
//! |------|-------|--------|
//! | `pre_superstep` | `Init`/`Barrier` | Enter `PEval` (round 0) or `IncEval`, release inbound data |
//! | `get_messages`, `message_available`, `any_message_received` | compute | Read the `current` store |
//! | `send_message`, `send_to_gid`, `send_message_to_all_edges` | compute | Queue into the send cache |
//! | `finish_message_sending` | compute | Flush remote batches, retire self batch into `next` |
//! | `force_continue`, `contribute_aggregate` | compute | Add to this round's vote |
//! | `post_superstep` | compute | Barrier with every peer, swap stores, return the outcome |
//! | `close` | any | Close links, server and runtime |
//!
//! # Termination
//!
//! Every worker sends its vote (messages sent, force continue, aggregate)
//! with its barrier request. All workers combine the same votes, so they all
//! see the same [`BarrierOutcome`]: the job terminates when no messages were
//! sent in the round and nobody asked to continue.
//!
//! # Configuration
//!
//! [`JobConfig`] is read from JSON (`ioThreads`, `computeThreads`,
//! `connectRetryAttempts`, ...) or from `SUPERSTEP_*` environment variables.
//! See [`config`] for the full list.

/// Barrier votes and the termination decision
pub mod barrier;
/// Job configuration
pub mod config;
/// Error types
pub mod error;
/// Vertex ids and the fragment capability
pub mod fragment;
/// Superstep state machine
pub mod manager;
/// Message payload bound
pub mod message;
/// Dedicated network runtime
pub mod runtime;
/// Outbound batching
pub mod send_cache;
/// Per-vertex message stores
pub mod store;
/// Tracing subscriber setup
pub mod telemetry;
/// Compute driver
pub mod worker;

pub use barrier::BarrierOutcome;
pub use config::{ConfigError, JobConfig};
pub use error::{CoreError, Phase, Result, RetryClass};
pub use fragment::{EdgeListFragment, Fragment, FragmentId, Gid, IdParser, Lid};
pub use manager::{MessageManager, SuperstepState};
pub use message::Message;
pub use store::{AnyMessageStore, DenseMessageStore, MessageStore, SparseMessageStore, StoreError, StoreKind};
pub use worker::{App, ComputeContext, Worker, WorkerReport};

pub use superstep_protocol::WorkerDirectory;
