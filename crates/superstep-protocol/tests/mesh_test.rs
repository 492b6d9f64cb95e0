// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Loopback tests for the worker mesh: handshake, batch delivery, barriers
//! and bounded retry.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use superstep_protocol::batch::{BatchEncoder, decode_batch};
use superstep_protocol::client::{BarrierVote, ClientError, PeerClient, PeerClientConfig};
use superstep_protocol::control::{BarrierRequest, ControlError};
use superstep_protocol::mesh::{PeerMesh, WorkerDirectory};
use superstep_protocol::server::{InboundHandler, MeshServer, MeshServerConfig, ServerError};

#[derive(Default)]
struct RecordingHandler {
    fid: u32,
    frag_num: u32,
    batches: Mutex<Vec<(u32, Vec<(u64, u64)>)>>,
    barriers: Mutex<Vec<(u32, BarrierRequest)>>,
}

impl RecordingHandler {
    fn new(fid: u32, frag_num: u32) -> Arc<Self> {
        Arc::new(Self {
            fid,
            frag_num,
            ..Default::default()
        })
    }

    fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

impl InboundHandler for RecordingHandler {
    fn local_fid(&self) -> u32 {
        self.fid
    }

    fn frag_num(&self) -> u32 {
        self.frag_num
    }

    fn on_batch(&self, src_fid: u32, payload: Bytes) -> Result<(), ControlError> {
        let decoder = decode_batch(payload).map_err(|e| ControlError {
            code: "SERIALIZATION_FAILURE".into(),
            message: e.to_string(),
        })?;
        let mut entries = Vec::new();
        for entry in decoder {
            let (gid, bytes) = entry.map_err(|e| ControlError {
                code: "SERIALIZATION_FAILURE".into(),
                message: e.to_string(),
            })?;
            let value = <u64 as prost::Message>::decode(bytes).map_err(|e| ControlError {
                code: "SERIALIZATION_FAILURE".into(),
                message: e.to_string(),
            })?;
            entries.push((gid, value));
        }
        self.batches.lock().unwrap().push((src_fid, entries));
        Ok(())
    }

    fn on_barrier(&self, src_fid: u32, barrier: &BarrierRequest) {
        self.barriers.lock().unwrap().push((src_fid, barrier.clone()));
    }
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn fast_client_config() -> PeerClientConfig {
    PeerClientConfig {
        connect_timeout_ms: 2_000,
        connect_retry_attempts: 3,
        connect_retry_backoff_ms: 50,
        ..Default::default()
    }
}

async fn start_server(handler: Arc<RecordingHandler>) -> MeshServer {
    let config = MeshServerConfig {
        bind_addr: loopback(),
        ..Default::default()
    };
    match MeshServer::start(config, handler).await {
        Ok(server) => server,
        Err(e) => panic!("failed to start server: {}", e),
    }
}

fn batch(dst: u32, entries: &[(u64, u64)]) -> superstep_protocol::Frame {
    let mut encoder = BatchEncoder::new(dst);
    for (gid, value) in entries {
        encoder.push(*gid, value).unwrap();
    }
    encoder.finish().unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batches_arrive_in_order_before_barrier_ack() {
    let handler = RecordingHandler::new(1, 2);
    let server = start_server(handler.clone()).await;

    let client = PeerClient::new(fast_client_config()).unwrap();
    let link = client
        .connect_with_retry(0, 2, 1, server.local_addr())
        .await
        .unwrap();

    link.send_batch(&batch(1, &[(10, 1), (11, 2)])).unwrap();
    link.send_batch(&batch(1, &[(10, 3)])).unwrap();

    let vote = BarrierVote {
        messages_sent: 3,
        force_continue: false,
        aggregate: 5,
    };
    let ack = link.barrier(0, vote).await.unwrap();
    assert_eq!(ack.round, 0);
    assert_eq!(ack.batches_received, 2);

    // the ack is only sent after both batches were applied
    let batches = handler.batches.lock().unwrap().clone();
    assert_eq!(
        batches,
        vec![(0, vec![(10, 1), (11, 2)]), (0, vec![(10, 3)])]
    );
    let barriers = handler.barriers.lock().unwrap().clone();
    assert_eq!(barriers.len(), 1);
    assert_eq!(barriers[0].0, 0);
    assert_eq!(barriers[0].1.messages_sent, 3);
    assert_eq!(barriers[0].1.aggregate, 5);

    assert!(server.bytes_received() > 0);
    let before = server.reset_bytes_received();
    assert!(before > 0);
    assert_eq!(server.bytes_received(), 0);

    link.close();
    server.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reader_holds_next_round_until_advanced() {
    let handler = RecordingHandler::new(1, 2);
    let server = start_server(handler.clone()).await;

    let client = PeerClient::new(fast_client_config()).unwrap();
    let link = client
        .connect_with_retry(0, 2, 1, server.local_addr())
        .await
        .unwrap();

    link.send_batch(&batch(1, &[(1, 1)])).unwrap();
    link.barrier(0, BarrierVote::default()).await.unwrap();

    // round 1 data written before the receiver moved to round 1
    link.send_batch(&batch(1, &[(1, 2)])).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handler.batch_count(), 1);

    server.advance_round(1);
    wait_until(|| handler.batch_count() == 2).await;

    let ack = link.barrier(1, BarrierVote::default()).await.unwrap();
    assert_eq!(ack.batches_received, 1);

    link.close();
    server.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_link_queue_makes_senders_wait() {
    let handler = RecordingHandler::new(1, 2);
    let server = start_server(handler.clone()).await;

    let config = PeerClientConfig {
        outbound_queue_frames: 1,
        ..fast_client_config()
    };
    let client = PeerClient::new(config).unwrap();
    let link = Arc::new(
        client
            .connect_with_retry(0, 2, 1, server.local_addr())
            .await
            .unwrap(),
    );

    // the server stops reading this link until it advances to round 1
    link.barrier(0, BarrierVote::default()).await.unwrap();
    let after_barrier = link.bytes_sent();

    // about 220 KB per frame, several times the stream's flow-control window
    let entries: Vec<(u64, u64)> = (0..10_000u64).map(|i| (i, u64::MAX - i)).collect();
    let frame = batch(1, &entries);
    let frames = 24u64;
    let total = frame.wire_len() as u64 * frames;

    let sender = {
        let link = link.clone();
        tokio::task::spawn_blocking(move || {
            for _ in 0..frames {
                link.send_batch(&frame).unwrap();
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!sender.is_finished(), "sender never waited on a stalled peer");
    assert!(link.bytes_sent() - after_barrier < total);
    assert!(link.queued_frames() <= 1);
    assert_eq!(handler.batch_count(), 0);

    server.advance_round(1);
    tokio::time::timeout(Duration::from_secs(20), sender)
        .await
        .expect("sender still blocked after the peer resumed reading")
        .unwrap();
    assert_eq!(link.bytes_sent() - after_barrier, total);

    let ack = link.barrier(1, BarrierVote::default()).await.unwrap();
    assert_eq!(ack.batches_received, frames);
    assert_eq!(handler.batch_count(), frames as usize);

    link.close();
    server.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_with_wrong_fragment_is_rejected() {
    let handler = RecordingHandler::new(0, 2);
    let server = start_server(handler).await;

    let client = PeerClient::new(fast_client_config()).unwrap();
    let started = Instant::now();
    // dials the worker serving fragment 0 while expecting fragment 1
    match client.connect_with_retry(0, 2, 1, server.local_addr()).await {
        Err(ClientError::Handshake { peer, .. }) => assert_eq!(peer, 1),
        Err(e) => panic!("expected handshake error, got {}", e),
        Ok(_) => panic!("expected handshake error, got a link"),
    }
    // a rejected handshake is not retried
    assert!(started.elapsed() < Duration::from_millis(1_000));

    server.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_retry_gives_up_after_configured_attempts() {
    // reserve a port, then free it so nothing answers there
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = silent.local_addr().unwrap();
    drop(silent);

    let config = PeerClientConfig {
        connect_timeout_ms: 150,
        connect_retry_attempts: 3,
        connect_retry_backoff_ms: 50,
        ..Default::default()
    };
    let client = PeerClient::new(config).unwrap();

    let started = Instant::now();
    match client.connect_with_retry(0, 2, 1, addr).await {
        Err(ClientError::RetriesExhausted {
            peer,
            addr: failed,
            attempts,
            ..
        }) => {
            assert_eq!(peer, 1);
            assert_eq!(failed, addr);
            assert_eq!(attempts, 3);
        }
        Err(e) => panic!("expected RetriesExhausted, got {}", e),
        Ok(_) => panic!("expected RetriesExhausted, got a link"),
    }
    let elapsed = started.elapsed();
    // two backoffs between three attempts, each attempt bounded by the timeout
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bind_retry_gives_up_on_busy_port() {
    let busy = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = busy.local_addr().unwrap();

    let config = MeshServerConfig {
        bind_addr: addr,
        port_bind_retry_attempts: 2,
        port_bind_retry_backoff_ms: 10,
        ..Default::default()
    };
    match MeshServer::start(config, RecordingHandler::new(0, 1)).await {
        Err(ServerError::BindRetriesExhausted { attempts, .. }) => assert_eq!(attempts, 2),
        Err(e) => panic!("expected BindRetriesExhausted, got {}", e),
        Ok(_) => panic!("bound a port that is already in use"),
    }
    drop(busy);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_worker_mesh_barrier() {
    let handlers: Vec<_> = (0..3).map(|fid| RecordingHandler::new(fid, 3)).collect();
    let mut servers = Vec::new();
    for handler in &handlers {
        servers.push(start_server(handler.clone()).await);
    }
    let directory = WorkerDirectory::new(servers.iter().map(MeshServer::local_addr).collect());

    let mut meshes = Vec::new();
    for fid in 0..3 {
        meshes.push(
            PeerMesh::connect(fid, &directory, fast_client_config())
                .await
                .unwrap(),
        );
    }

    for mesh in &meshes {
        assert_eq!(mesh.peer_count(), 2);
        for peer in mesh.peers().collect::<Vec<_>>() {
            mesh.send_batch(peer, &batch(peer, &[(u64::from(mesh.local_fid()), 7)]))
                .unwrap();
        }
    }

    let acks = futures::future::try_join_all(meshes.iter().map(|mesh| {
        mesh.barrier(
            0,
            BarrierVote {
                messages_sent: 2,
                ..Default::default()
            },
        )
    }))
    .await
    .unwrap();
    for per_worker in acks {
        assert_eq!(per_worker.len(), 2);
        assert!(per_worker.iter().all(|ack| ack.batches_received == 1));
    }

    for handler in &handlers {
        assert_eq!(handler.batch_count(), 2);
        assert_eq!(handler.barriers.lock().unwrap().len(), 2);
    }

    for mesh in &meshes {
        mesh.close();
    }
    for server in &servers {
        server.close();
    }
}
