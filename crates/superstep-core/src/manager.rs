// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The per-worker superstep state machine.
//!
//! ```text
//! INIT ──pre──▶ PEVAL ──post──▶ BARRIER ──pre──▶ INCEVAL ──post──▶ BARRIER ...
//!                                   │                                  │
//!                                   └──────── terminate ──▶ TERMINATED ◀┘
//! ```
//!
//! Compute reads the `current` store and sends into the send cache. Peers'
//! batches land in the `next` store owned by the inbox the mesh server
//! feeds. `post_superstep` flushes, exchanges barrier votes with every peer,
//! then swaps the two stores.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use superstep_protocol::control::ControlError;
use superstep_protocol::{
    BarrierRequest, BarrierVote, Frame, InboundHandler, MeshServer, PeerMesh, WorkerDirectory,
    decode_batch,
};
use tracing::{debug, error, info, instrument, trace};

use crate::barrier::{BarrierOutcome, BarrierTracker};
use crate::config::JobConfig;
use crate::error::{CoreError, Phase, Result};
use crate::fragment::{Fragment, FragmentId, Gid, Lid};
use crate::message::Message;
use crate::runtime::IoRuntime;
use crate::send_cache::{BatchSender, SendCache};
use crate::store::{AnyMessageStore, MessageSlice, MessageStore, StoreError};

/// Lifecycle state of a [`MessageManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperstepState {
    /// Created; transport not yet started or rounds not yet begun
    Init,
    /// Partial evaluation, round 0
    PEval,
    /// Between `post_superstep` and the next `pre_superstep`
    Barrier,
    /// Incremental evaluation, rounds 1..
    IncEval,
    /// The job agreed to stop, or the manager was closed
    Terminated,
}

/// Receiving side: everything peers deliver to this worker.
struct Inbox<F, M> {
    fragment: Arc<F>,
    next: RwLock<AnyMessageStore<M>>,
    tracker: BarrierTracker,
}

impl<F: Fragment, M: Message> Inbox<F, M> {
    fn apply_batch(&self, src: FragmentId, payload: Bytes) -> Result<usize> {
        let worker = self.fragment.fid();
        let serialization = |details: String| CoreError::SerializationFailure {
            worker,
            peer: Some(src),
            phase: Phase::Receive,
            details,
        };

        let batch = decode_batch(payload).map_err(|e| serialization(e.to_string()))?;
        if batch.dst_fid() != worker {
            return Err(CoreError::invalid_state(
                worker,
                Phase::Receive,
                format!("peer {} sent a batch for fragment {}", src, batch.dst_fid()),
            ));
        }

        let next = self.next.read();
        let mut applied = 0;
        for entry in batch {
            let (gid, bytes) = entry.map_err(|e| serialization(e.to_string()))?;
            let lid = self.fragment.inner_gid_to_lid(gid).ok_or_else(|| {
                CoreError::invalid_state(
                    worker,
                    Phase::Receive,
                    format!("peer {} sent global id {} this fragment does not own", src, gid),
                )
            })?;
            let msg = M::decode(bytes).map_err(|e| serialization(e.to_string()))?;
            next.push(lid, msg).map_err(|e| out_of_bounds(worker, e))?;
            applied += 1;
        }
        Ok(applied)
    }
}

impl<F: Fragment, M: Message> InboundHandler for Inbox<F, M> {
    fn local_fid(&self) -> u32 {
        self.fragment.fid()
    }

    fn frag_num(&self) -> u32 {
        self.fragment.fnum()
    }

    fn on_batch(&self, src_fid: u32, payload: Bytes) -> std::result::Result<(), ControlError> {
        match self.apply_batch(src_fid, payload) {
            Ok(applied) => {
                trace!(src_fid, applied, "batch applied");
                Ok(())
            }
            Err(e) => {
                error!(src_fid, error = %e, "failed to apply batch");
                let control = e.to_control_error();
                self.tracker.fail(e);
                Err(control)
            }
        }
    }

    fn on_barrier(&self, src_fid: u32, barrier: &BarrierRequest) {
        trace!(src_fid, round = barrier.round, "barrier vote received");
        self.tracker.record(src_fid, barrier);
    }

    fn on_peer_closed(&self, src_fid: u32) {
        debug!(src_fid, "peer closed its link");
        self.tracker.peer_departed(src_fid);
    }

    fn on_peer_failure(&self, src_fid: u32, reason: &str) {
        self.tracker.fail(CoreError::TransportFailure {
            worker: self.fragment.fid(),
            peer: Some(src_fid),
            phase: Phase::Receive,
            details: reason.to_string(),
        });
    }
}

impl BatchSender for PeerMesh {
    fn send_batch(&self, dst: FragmentId, frame: &Frame) -> Result<()> {
        PeerMesh::send_batch(self, dst, frame)
            .map_err(|e| CoreError::from_client(self.local_fid(), Some(dst), Phase::Send, e))
    }
}

fn out_of_bounds(worker: u32, err: StoreError) -> CoreError {
    match err {
        StoreError::OutOfRange {
            lid,
            inner_vertex_count,
        } => CoreError::IndexOutOfBounds {
            worker,
            lid: u64::from(lid),
            inner_vertex_count,
        },
    }
}

/// Owns one fragment's message stores, send cache and transport, and walks
/// the superstep state machine for the compute driver.
///
/// Compute-phase calls (`get_messages`, `send_message`, ...) take `&self`
/// and may be made from many compute threads at once. Lifecycle calls take
/// `&mut self`.
pub struct MessageManager<F: Fragment, M: Message> {
    fragment: Arc<F>,
    config: JobConfig,
    current: AnyMessageStore<M>,
    inbox: Arc<Inbox<F, M>>,
    cache: SendCache<M>,
    io: IoRuntime,
    server: Option<Arc<MeshServer>>,
    mesh: Option<Arc<PeerMesh>>,
    initialized: bool,
    closed: bool,
    state: SuperstepState,
    round: u64,
    force_continue: AtomicBool,
    messages_sent: AtomicU64,
    aggregate: AtomicI64,
    bytes_received_last_round: u64,
    last_outcome: Option<BarrierOutcome>,
}

impl<F: Fragment, M: Message> MessageManager<F, M> {
    /// Allocate both stores, the send cache and the I/O runtime.
    ///
    /// Nothing touches the network until [`bind`](Self::bind).
    pub fn new(fragment: Arc<F>, config: JobConfig) -> Result<Self> {
        let worker = fragment.fid();
        config
            .validate()
            .map_err(|e| CoreError::invalid_state(worker, Phase::Connect, e.to_string()))?;
        if worker >= fragment.fnum() {
            return Err(CoreError::invalid_state(
                worker,
                Phase::Connect,
                format!("fragment id {} out of range ({} fragments)", worker, fragment.fnum()),
            ));
        }

        let vertices = fragment.inner_vertex_count();
        let inbox = Arc::new(Inbox {
            fragment: fragment.clone(),
            next: RwLock::new(AnyMessageStore::new(config.message_store, vertices)),
            tracker: BarrierTracker::new(worker),
        });
        let io = IoRuntime::new(worker, config.io_threads)?;

        debug!(
            worker,
            fnum = fragment.fnum(),
            vertices,
            store = %config.message_store,
            "message manager created"
        );

        Ok(Self {
            current: AnyMessageStore::new(config.message_store, vertices),
            cache: SendCache::new(worker, fragment.fnum(), config.batch_flush_threshold),
            fragment,
            config,
            inbox,
            io,
            server: None,
            mesh: None,
            initialized: false,
            closed: false,
            state: SuperstepState::Init,
            round: 0,
            force_continue: AtomicBool::new(false),
            messages_sent: AtomicU64::new(0),
            aggregate: AtomicI64::new(0),
            bytes_received_last_round: 0,
            last_outcome: None,
        })
    }

    fn worker(&self) -> u32 {
        self.fragment.fid()
    }

    /// Start listening on `addr`, retrying the bind with fixed backoff.
    ///
    /// Returns the bound address (useful with port 0). Every worker of the
    /// job must be bound before any of them calls [`initialize`](Self::initialize).
    #[instrument(skip(self))]
    pub async fn bind(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        let worker = self.worker();
        if self.state != SuperstepState::Init || self.server.is_some() {
            return Err(CoreError::invalid_state(
                worker,
                Phase::Connect,
                format!("bind called in state {:?}", self.state),
            ));
        }

        let config = self.config.mesh_server_config(addr);
        let handler: Arc<dyn InboundHandler> = self.inbox.clone();
        let server = self
            .io
            .run(Phase::Connect, async move { MeshServer::start(config, handler).await })
            .await?
            .map_err(|e| CoreError::from_server(worker, e))?;

        let local_addr = server.local_addr();
        info!(worker, %local_addr, "worker listening");
        self.server = Some(Arc::new(server));
        Ok(local_addr)
    }

    /// Connect to every peer listed in `directory`, retrying each with fixed
    /// backoff. A single-fragment job needs neither a server nor peers.
    #[instrument(skip(self, directory), fields(peers = directory.len()))]
    pub async fn initialize(&mut self, directory: &WorkerDirectory) -> Result<()> {
        let worker = self.worker();
        let fnum = self.fragment.fnum();
        if self.state != SuperstepState::Init || self.initialized {
            return Err(CoreError::invalid_state(
                worker,
                Phase::Connect,
                "initialize called twice",
            ));
        }

        if fnum > 1 {
            if directory.len() != fnum as usize {
                return Err(CoreError::invalid_state(
                    worker,
                    Phase::Connect,
                    format!(
                        "worker directory lists {} workers, job has {} fragments",
                        directory.len(),
                        fnum
                    ),
                ));
            }
            if self.server.is_none() {
                return Err(CoreError::invalid_state(
                    worker,
                    Phase::Connect,
                    "bind must be called before initialize",
                ));
            }

            let directory = directory.clone();
            let client_config = self.config.peer_client_config();
            let mesh = self
                .io
                .run(Phase::Connect, async move {
                    PeerMesh::connect(worker, &directory, client_config).await
                })
                .await?
                .map_err(|e| CoreError::from_client(worker, None, Phase::Connect, e))?;
            self.mesh = Some(Arc::new(mesh));
        }

        self.initialized = true;
        info!(worker, fnum, "message manager initialized");
        Ok(())
    }

    /// Begin a round: `INIT -> PEVAL` for round 0, `BARRIER -> INCEVAL`
    /// afterwards. Releases inbound data peers already wrote for this round.
    pub fn pre_superstep(&mut self) -> Result<()> {
        let worker = self.worker();
        match self.state {
            SuperstepState::Init if self.initialized => {
                self.state = SuperstepState::PEval;
                self.round = 0;
            }
            SuperstepState::Barrier => {
                self.state = SuperstepState::IncEval;
                self.round += 1;
            }
            SuperstepState::Init => {
                return Err(CoreError::invalid_state(
                    worker,
                    Phase::Compute,
                    "pre_superstep called before initialize",
                ));
            }
            other => {
                return Err(CoreError::invalid_state(
                    worker,
                    Phase::Compute,
                    format!("pre_superstep called in state {:?}", other),
                ));
            }
        }

        if let Some(server) = &self.server {
            server.advance_round(self.round);
        }
        debug!(worker, round = self.round, state = ?self.state, "superstep started");
        Ok(())
    }

    /// Messages addressed to `lid` this round
    pub fn get_messages(&self, lid: Lid) -> Result<MessageSlice<'_, M>> {
        self.current
            .get_messages(lid)
            .map_err(|e| out_of_bounds(self.worker(), e))
    }

    pub fn message_available(&self, lid: Lid) -> Result<bool> {
        self.current
            .message_available(lid)
            .map_err(|e| out_of_bounds(self.worker(), e))
    }

    /// Whether any inner vertex received a message this round
    pub fn any_message_received(&self) -> bool {
        self.current.any_message_received()
    }

    /// Send `msg` to the vertex with original id `oid`.
    pub fn send_message(&self, oid: &F::Oid, msg: M) -> Result<()> {
        self.ensure_computing()?;
        let gid = self.fragment.oid_to_gid(oid).ok_or_else(|| {
            CoreError::invalid_state(
                self.worker(),
                Phase::Compute,
                format!("unknown destination vertex {:?}", oid),
            )
        })?;
        self.send_to_gid(gid, msg)
    }

    /// Send `msg` to the vertex with global id `gid`.
    ///
    /// Messages to this fragment's own vertices go through the cache's self
    /// batch and never reach the transport.
    ///
    /// When a remote batch reaches the flush threshold it is handed to the
    /// transport here, and the calling thread waits while that peer's link
    /// queue is full.
    pub fn send_to_gid(&self, gid: Gid, msg: M) -> Result<()> {
        self.ensure_computing()?;
        let worker = self.worker();
        let dst = self.fragment.frag_id(gid);
        if dst == worker && self.fragment.inner_gid_to_lid(gid).is_none() {
            return Err(CoreError::invalid_state(
                worker,
                Phase::Compute,
                format!("global id {} does not resolve to a local vertex", gid),
            ));
        }

        let frames = self.cache.send_message(dst, gid, msg)?;
        self.messages_sent.fetch_add(1, Ordering::Relaxed);

        if !frames.is_empty() {
            let mesh = self.mesh()?;
            for frame in &frames {
                BatchSender::send_batch(mesh, dst, frame)?;
            }
        }
        Ok(())
    }

    /// Send a copy of `msg` along every out-edge of inner vertex `lid`.
    pub fn send_message_to_all_edges(&self, lid: Lid, msg: M) -> Result<()> {
        self.ensure_computing()?;
        let inner_vertex_count = self.fragment.inner_vertex_count();
        if lid as usize >= inner_vertex_count {
            return Err(CoreError::IndexOutOfBounds {
                worker: self.worker(),
                lid: u64::from(lid),
                inner_vertex_count,
            });
        }
        for &gid in self.fragment.out_neighbors(lid) {
            self.send_to_gid(gid, msg.clone())?;
        }
        Ok(())
    }

    /// Flush remote batches to the transport and retire self-addressed
    /// messages into the `next` store. Safe to call more than once a round.
    /// Waits while a peer's link queue is full.
    pub fn finish_message_sending(&self) -> Result<()> {
        self.ensure_computing()?;
        if let Some(mesh) = &self.mesh {
            self.cache.flush_message(mesh.as_ref())?;
        }
        let next = self.inbox.next.read();
        let delivered = self
            .cache
            .remove_message_to_self(self.fragment.as_ref(), &*next)?;
        if delivered > 0 {
            trace!(worker = self.worker(), delivered, "self messages retired");
        }
        if self.cache.pending_messages() > 0 {
            return Err(CoreError::invalid_state(
                self.worker(),
                Phase::Send,
                "messages for other fragments pending without a transport",
            ));
        }
        Ok(())
    }

    /// Ask for at least one more round. Applies to the current round only.
    pub fn force_continue(&self) {
        if !self.force_continue.swap(true, Ordering::Relaxed) {
            debug!(worker = self.worker(), round = self.round, "force continue requested");
        }
    }

    /// Add `value` to this round's global sum, reported in the
    /// [`BarrierOutcome`].
    pub fn contribute_aggregate(&self, value: i64) {
        self.aggregate.fetch_add(value, Ordering::Relaxed);
    }

    /// End the round: flush, wait until every peer acknowledged this
    /// worker's batches and voted, then swap `current` and `next`.
    ///
    /// Returns the outcome every worker agrees on.
    pub async fn post_superstep(&mut self) -> Result<BarrierOutcome> {
        let worker = self.worker();
        if !matches!(self.state, SuperstepState::PEval | SuperstepState::IncEval) {
            return Err(CoreError::invalid_state(
                worker,
                Phase::Barrier,
                format!("post_superstep called in state {:?}", self.state),
            ));
        }
        self.finish_message_sending()?;
        self.state = SuperstepState::Barrier;

        let round = self.round;
        let vote = BarrierVote {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            force_continue: self.force_continue.load(Ordering::Relaxed),
            aggregate: self.aggregate.load(Ordering::Relaxed),
        };

        let peers = match &self.mesh {
            Some(mesh) => {
                let mesh = mesh.clone();
                let inbox = self.inbox.clone();
                let expected = mesh.peer_count();
                self.io
                    .run(Phase::Barrier, async move {
                        let acks = async {
                            mesh.barrier(round, vote)
                                .await
                                .map_err(|e| CoreError::from_client(worker, None, Phase::Barrier, e))
                        };
                        let (_, votes) = tokio::try_join!(acks, inbox.tracker.wait(round, expected))?;
                        Ok::<_, CoreError>(votes)
                    })
                    .await??
            }
            None => Vec::new(),
        };

        let outcome = BarrierOutcome::combine(round, vote, &peers);

        self.cache.clear();
        {
            let mut next = self.inbox.next.write();
            self.current.swap(&mut *next);
            next.clear_all();
        }
        self.force_continue.store(false, Ordering::Relaxed);
        self.messages_sent.store(0, Ordering::Relaxed);
        self.aggregate.store(0, Ordering::Relaxed);
        if let Some(server) = &self.server {
            self.bytes_received_last_round = server.reset_bytes_received();
        }

        self.state = if outcome.terminate {
            SuperstepState::Terminated
        } else {
            SuperstepState::Barrier
        };
        self.last_outcome = Some(outcome);

        debug!(
            worker,
            round,
            messages_sent = outcome.messages_sent,
            force_continue = outcome.force_continue,
            bytes_received = self.bytes_received_last_round,
            "superstep finished"
        );
        if outcome.terminate {
            info!(worker, rounds = round + 1, "job terminated");
        }
        Ok(outcome)
    }

    /// Close links, the server and the I/O runtime. Safe to call more than
    /// once, including after a failed round.
    ///
    /// Waits up to the connect timeout for peers to close their links first,
    /// so acknowledgements they still wait for are delivered.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let worker = self.worker();

        if let Some(mesh) = self.mesh.take() {
            mesh.close();
        }
        if let Some(server) = self.server.take() {
            let grace = Duration::from_millis(self.config.connect_timeout_ms);
            let shutdown = {
                let server = server.clone();
                async move { server.shutdown(grace).await }
            };
            if let Err(e) = self.io.run(Phase::Shutdown, shutdown).await {
                debug!(worker, error = %e, "server shutdown interrupted");
            }
            server.close();
        }
        self.io.shutdown();
        self.state = SuperstepState::Terminated;
        info!(worker, "message manager closed");
    }

    pub fn state(&self) -> SuperstepState {
        self.state
    }

    /// Current round; 0 is PEval
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn fragment(&self) -> &F {
        &self.fragment
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Address the mesh server is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|server| server.local_addr())
    }

    /// Bytes peers delivered during the last completed round
    pub fn bytes_received_last_round(&self) -> u64 {
        self.bytes_received_last_round
    }

    /// Bytes queued to peers so far
    pub fn bytes_sent(&self) -> u64 {
        self.mesh.as_ref().map_or(0, |mesh| mesh.bytes_sent())
    }

    pub fn last_outcome(&self) -> Option<BarrierOutcome> {
        self.last_outcome
    }

    fn ensure_computing(&self) -> Result<()> {
        match self.state {
            SuperstepState::PEval | SuperstepState::IncEval => Ok(()),
            other => Err(CoreError::invalid_state(
                self.worker(),
                Phase::Compute,
                format!("compute call in state {:?}", other),
            )),
        }
    }

    fn mesh(&self) -> Result<&PeerMesh> {
        self.mesh.as_deref().ok_or_else(|| {
            CoreError::invalid_state(self.worker(), Phase::Send, "no transport for remote messages")
        })
    }
}

impl<F: Fragment, M: Message> Drop for MessageManager<F, M> {
    fn drop(&mut self) {
        if let Some(mesh) = self.mesh.take() {
            mesh.close();
        }
        if let Some(server) = self.server.take() {
            server.close();
        }
        self.io.shutdown();
    }
}
