// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC client side of the worker mesh.
//!
//! A [`PeerClient`] owns the local client endpoint and dials peers with
//! bounded retry. Each successful dial yields a [`PeerLink`]: one persistent
//! bidirectional stream to one peer, shared by queued message
//! batches and correlated control requests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, TransportConfig};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::control::{
    BarrierAck, BarrierRequest, ControlFrame, ControlRequest, ControlResponse, control_response,
};
use crate::frame::{Frame, FrameError, FrameKind, read_frame, write_frame};

/// Errors that can occur in the mesh client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("connection timed out after {0}ms")]
    Timeout(u64),

    #[error("could not connect to peer {peer} at {addr} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        peer: u32,
        addr: SocketAddr,
        attempts: u32,
        last_error: String,
    },

    #[error("handshake with peer {peer} failed: {reason}")]
    Handshake { peer: u32, reason: String },

    #[error("link to peer {0} is closed")]
    LinkClosed(u32),

    #[error("no link to peer {0}")]
    UnknownPeer(u32),

    #[error("peer {peer} rejected request: {code}: {message}")]
    Rejected {
        peer: u32,
        code: String,
        message: String,
    },

    #[error("unexpected response from peer {peer}: {details}")]
    UnexpectedResponse { peer: u32, details: String },

    #[error("peer {peer} acknowledged {received} batches for round {round}, {sent} were sent")]
    BatchCountMismatch {
        peer: u32,
        round: u64,
        sent: u64,
        received: u64,
    },
}

impl ClientError {
    /// Peer the error concerns, when the error names one
    pub fn peer(&self) -> Option<u32> {
        match self {
            Self::RetriesExhausted { peer, .. }
            | Self::Handshake { peer, .. }
            | Self::Rejected { peer, .. }
            | Self::UnexpectedResponse { peer, .. }
            | Self::BatchCountMismatch { peer, .. } => Some(*peer),
            Self::LinkClosed(peer) | Self::UnknownPeer(peer) => Some(*peer),
            _ => None,
        }
    }
}

/// Configuration for dialing mesh peers
#[derive(Debug, Clone)]
pub struct PeerClientConfig {
    /// Server name for TLS verification
    pub server_name: String,
    /// Skip certificate verification (mesh peers present self-signed certificates)
    pub dangerous_skip_cert_verification: bool,
    /// PEM certificate(s) to trust when verification is enabled
    pub trusted_cert_pem: Vec<u8>,
    /// Keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Timeout of a single connection attempt in milliseconds
    pub connect_timeout_ms: u64,
    /// Attempts per peer before giving up (at least one is always made)
    pub connect_retry_attempts: u32,
    /// Fixed delay between attempts in milliseconds
    pub connect_retry_backoff_ms: u64,
    /// Encoded frames queued per link before senders wait for the writer
    pub outbound_queue_frames: usize,
}

impl Default for PeerClientConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            dangerous_skip_cert_verification: true,
            trusted_cert_pem: Vec::new(),
            keep_alive_interval_ms: 10_000,
            idle_timeout_ms: 600_000, // supersteps can compute for a long time between frames
            connect_timeout_ms: 5_000,
            connect_retry_attempts: 10,
            connect_retry_backoff_ms: 2_000,
            outbound_queue_frames: 64,
        }
    }
}

/// The local worker's contribution to a barrier round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarrierVote {
    pub messages_sent: u64,
    pub force_continue: bool,
    pub aggregate: i64,
}

/// Client endpoint used to dial every peer of the mesh
pub struct PeerClient {
    endpoint: Endpoint,
    config: PeerClientConfig,
}

impl PeerClient {
    /// Create a new client. Must be called inside a tokio runtime.
    pub fn new(config: PeerClientConfig) -> Result<Self, ClientError> {
        let bind: SocketAddr = SocketAddr::from(([0, 0, 0, 0], 0));
        let mut endpoint = Endpoint::client(bind)?;

        let client_config = Self::build_client_config(&config)?;
        endpoint.set_default_client_config(client_config);

        Ok(Self { endpoint, config })
    }

    pub fn config(&self) -> &PeerClientConfig {
        &self.config
    }

    fn build_client_config(config: &PeerClientConfig) -> Result<ClientConfig, ClientError> {
        let crypto = if config.dangerous_skip_cert_verification {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut config.trusted_cert_pem.as_slice()) {
                let cert = cert
                    .map_err(|e| ClientError::Tls(format!("failed to parse certificate: {}", e)))?;
                roots
                    .add(cert)
                    .map_err(|e| ClientError::Tls(e.to_string()))?;
            }
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        let mut transport = TransportConfig::default();
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }
        transport.max_idle_timeout(Some(
            Duration::from_millis(config.idle_timeout_ms)
                .try_into()
                .map_err(|e| ClientError::Tls(format!("invalid idle timeout: {}", e)))?,
        ));

        let mut client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| ClientError::Tls(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }

    /// Dial `peer`, retrying up to `connect_retry_attempts` times with a fixed
    /// backoff between attempts.
    #[instrument(skip(self))]
    pub async fn connect_with_retry(
        &self,
        local_fid: u32,
        frag_num: u32,
        peer: u32,
        addr: SocketAddr,
    ) -> Result<PeerLink, ClientError> {
        let attempts = self.config.connect_retry_attempts.max(1);
        let backoff = Duration::from_millis(self.config.connect_retry_backoff_ms);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.connect(local_fid, frag_num, peer, addr).await {
                Ok(link) => {
                    info!(peer, %addr, attempt, "connected to peer");
                    return Ok(link);
                }
                // a peer that answered but refused us will refuse again
                Err(e @ ClientError::Handshake { .. }) => return Err(e),
                Err(e) => {
                    warn!(peer, %addr, attempt, attempts, error = %e, "connection attempt failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(ClientError::RetriesExhausted {
            peer,
            addr,
            attempts,
            last_error,
        })
    }

    /// Single connection attempt: dial, open the stream and handshake.
    pub async fn connect(
        &self,
        local_fid: u32,
        frag_num: u32,
        peer: u32,
        addr: SocketAddr,
    ) -> Result<PeerLink, ClientError> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let connecting = self.endpoint.connect(addr, &self.config.server_name)?;
        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;

        let (mut send, mut recv) = connection.open_bi().await?;

        // The handshake is the first frame; the server only sees the stream
        // once data arrives on it.
        let hello = ControlFrame::request(0, &ControlRequest::handshake(local_fid, peer, frag_num))
            .into_frame()?;
        write_frame(&mut send, &hello).await?;

        let reply = tokio::time::timeout(timeout, read_frame(&mut recv))
            .await
            .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;
        if reply.kind != FrameKind::Control {
            return Err(ClientError::Handshake {
                peer,
                reason: format!("expected control frame, got {:?}", reply.kind),
            });
        }
        match ControlFrame::decode(reply.payload)?.decode_response()?.body {
            Some(control_response::Body::HandshakeAck(ack)) if ack.fid == peer => {}
            Some(control_response::Body::HandshakeAck(ack)) => {
                connection.close(1u32.into(), b"wrong peer");
                return Err(ClientError::Handshake {
                    peer,
                    reason: format!("reached fragment {} instead", ack.fid),
                });
            }
            Some(control_response::Body::Error(err)) => {
                connection.close(1u32.into(), b"handshake rejected");
                return Err(ClientError::Handshake {
                    peer,
                    reason: format!("{}: {}", err.code, err.message),
                });
            }
            other => {
                return Err(ClientError::Handshake {
                    peer,
                    reason: format!("unexpected handshake reply: {:?}", other),
                });
            }
        }

        Ok(PeerLink::spawn(
            peer,
            connection,
            send,
            recv,
            self.config.outbound_queue_frames,
        ))
    }

    /// Close the client endpoint
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"client closing");
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ControlResponse>>>>;

/// One persistent stream to one peer.
///
/// Frames are queued to a writer task; a reader task routes responses to the
/// request waiting on them. The queue holds at most `outbound_queue_frames`
/// frames, so a slow or paused peer makes senders wait instead of growing
/// memory. Batches and requests share the stream, so a request is delivered
/// after every batch queued before it.
pub struct PeerLink {
    peer: u32,
    connection: Connection,
    outbound: mpsc::Sender<Bytes>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    next_request_id: AtomicU64,
    batches_since_barrier: AtomicU64,
    bytes_sent: AtomicU64,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl PeerLink {
    fn spawn(
        peer: u32,
        connection: Connection,
        send: SendStream,
        recv: RecvStream,
        queue_frames: usize,
    ) -> Self {
        let (outbound, rx) = mpsc::channel(queue_frames.max(1));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(run_writer(
            peer,
            send,
            rx,
            pending.clone(),
            closed.clone(),
        ));
        let reader = tokio::spawn(run_reader(peer, recv, pending.clone(), closed.clone()));

        Self {
            peer,
            connection,
            outbound,
            pending,
            closed,
            next_request_id: AtomicU64::new(1),
            batches_since_barrier: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            writer,
            reader,
        }
    }

    pub fn peer(&self) -> u32 {
        self.peer
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.connection.close_reason().is_none()
    }

    /// Bytes queued on this link so far
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Frames queued and not yet handed to the stream
    pub fn queued_frames(&self) -> usize {
        self.outbound.max_capacity() - self.outbound.capacity()
    }

    /// Queue `frame`, parking the calling thread while the queue is full.
    fn enqueue_blocking(&self, frame: &Frame) -> Result<(), ClientError> {
        let encoded = frame.encode();
        let len = encoded.len() as u64;
        match self.outbound.try_send(encoded) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => return Err(ClientError::LinkClosed(self.peer)),
            Err(TrySendError::Full(encoded)) => {
                debug!(peer = self.peer, "outbound queue full, waiting for the writer");
                futures::executor::block_on(self.outbound.send(encoded))
                    .map_err(|_| ClientError::LinkClosed(self.peer))?;
            }
        }
        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    async fn enqueue(&self, frame: &Frame) -> Result<(), ClientError> {
        let encoded = frame.encode();
        let len = encoded.len() as u64;
        self.outbound
            .send(encoded)
            .await
            .map_err(|_| ClientError::LinkClosed(self.peer))?;
        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Queue a message batch frame.
    ///
    /// Returns once the frame is queued. While the link's queue is full the
    /// calling thread is parked until the writer drains a frame, so this must
    /// not be called from a thread of the runtime that drives the link.
    pub fn send_batch(&self, frame: &Frame) -> Result<(), ClientError> {
        if frame.kind != FrameKind::MessageBatch {
            return Err(ClientError::Frame(FrameError::Malformed(format!(
                "expected message batch frame, got {:?}",
                frame.kind
            ))));
        }
        self.enqueue_blocking(frame)?;
        self.batches_since_barrier.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Send a control request and wait for the correlated response.
    pub async fn request(&self, request: &ControlRequest) -> Result<ControlResponse, ClientError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        // the reader flips `closed` before draining the pending map
        if self.closed.load(Ordering::Acquire) {
            self.pending.lock().await.remove(&request_id);
            return Err(ClientError::LinkClosed(self.peer));
        }

        let frame = ControlFrame::request(request_id, request).into_frame()?;
        if let Err(e) = self.enqueue(&frame).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        let response = rx.await.map_err(|_| ClientError::LinkClosed(self.peer))?;
        if let Some(control_response::Body::Error(err)) = &response.body {
            return Err(ClientError::Rejected {
                peer: self.peer,
                code: err.code.clone(),
                message: err.message.clone(),
            });
        }
        Ok(response)
    }

    /// Send the barrier for `round` and wait for the peer's acknowledgement.
    ///
    /// The acknowledgement implies every batch queued before the barrier has
    /// been applied by the peer; the batch counts on both sides must agree.
    pub async fn barrier(&self, round: u64, vote: BarrierVote) -> Result<BarrierAck, ClientError> {
        let batches_sent = self.batches_since_barrier.swap(0, Ordering::AcqRel);
        let request = ControlRequest::barrier(BarrierRequest {
            round,
            messages_sent: vote.messages_sent,
            force_continue: vote.force_continue,
            aggregate: vote.aggregate,
            batches_sent,
        });

        let ack = match self.request(&request).await?.body {
            Some(control_response::Body::BarrierAck(ack)) => ack,
            other => {
                return Err(ClientError::UnexpectedResponse {
                    peer: self.peer,
                    details: format!("expected barrier ack, got {:?}", other),
                });
            }
        };

        if ack.round != round {
            return Err(ClientError::UnexpectedResponse {
                peer: self.peer,
                details: format!("barrier ack for round {}, expected {}", ack.round, round),
            });
        }
        if ack.batches_received != batches_sent {
            return Err(ClientError::BatchCountMismatch {
                peer: self.peer,
                round,
                sent: batches_sent,
                received: ack.batches_received,
            });
        }
        debug!(peer = self.peer, round, batches_sent, "barrier acknowledged");
        Ok(ack)
    }

    /// Close the link. Safe to call more than once.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.connection.close(0u32.into(), b"link closing");
        self.writer.abort();
        self.reader.abort();
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.close();
    }
}

async fn fail_pending(pending: &PendingMap, closed: &AtomicBool) {
    closed.store(true, Ordering::Release);
    // dropping the senders wakes every waiter with an error
    pending.lock().await.clear();
}

async fn run_writer(
    peer: u32,
    mut send: SendStream,
    mut rx: mpsc::Receiver<Bytes>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = send.write_all(&bytes).await {
            warn!(peer, error = %e, "failed to write to peer");
            fail_pending(&pending, &closed).await;
            return;
        }
    }
    let _ = send.finish();
    debug!(peer, "writer finished");
}

async fn run_reader(peer: u32, mut recv: RecvStream, pending: PendingMap, closed: Arc<AtomicBool>) {
    loop {
        let frame = match read_frame(&mut recv).await {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => {
                debug!(peer, "peer closed the stream");
                break;
            }
            Err(e) => {
                debug!(peer, error = %e, "stopped reading from peer");
                break;
            }
        };

        if frame.kind != FrameKind::Control {
            warn!(peer, kind = ?frame.kind, "ignoring unexpected frame from peer");
            continue;
        }

        let response = ControlFrame::decode(frame.payload).and_then(|control| {
            let response = control.decode_response()?;
            Ok((control.request_id, response))
        });
        match response {
            Ok((request_id, response)) => match pending.lock().await.remove(&request_id) {
                Some(waiter) => {
                    let _ = waiter.send(response);
                }
                None => warn!(peer, request_id, "response for unknown request"),
            },
            Err(e) => {
                warn!(peer, error = %e, "malformed control frame from peer");
                break;
            }
        }
    }
    fail_pending(&pending, &closed).await;
}

/// Certificate verifier that skips all verification.
///
/// Mesh peers present throwaway self-signed certificates; the handshake frame
/// is what identifies a peer.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PeerClientConfig::default();
        assert_eq!(config.server_name, "localhost");
        assert!(config.dangerous_skip_cert_verification);
        assert_eq!(config.connect_retry_attempts, 10);
        assert_eq!(config.connect_retry_backoff_ms, 2_000);
        assert_eq!(config.connect_timeout_ms, 5_000);
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = PeerClient::new(PeerClientConfig::default());
        assert!(
            client.is_ok(),
            "Failed to create client: {:?}",
            client.err()
        );
    }

    #[tokio::test]
    async fn test_connect_timeout_to_silent_address() {
        let config = PeerClientConfig {
            connect_timeout_ms: 100,
            connect_retry_attempts: 1,
            ..Default::default()
        };
        let client = PeerClient::new(config).unwrap();
        let addr: SocketAddr = "127.0.0.1:59998".parse().unwrap();

        match client.connect(0, 2, 1, addr).await {
            Err(ClientError::Timeout(100)) | Err(ClientError::Connection(_)) => {}
            other => panic!("expected timeout or connection error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_error_display() {
        let err = ClientError::RetriesExhausted {
            peer: 2,
            addr: "10.0.0.2:7000".parse().unwrap(),
            attempts: 3,
            last_error: "connection timed out after 100ms".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("peer 2"));
        assert!(msg.contains("after 3 attempts"));

        let err = ClientError::BatchCountMismatch {
            peer: 1,
            round: 5,
            sent: 4,
            received: 3,
        };
        assert!(err.to_string().contains("round 5"));
    }
}
