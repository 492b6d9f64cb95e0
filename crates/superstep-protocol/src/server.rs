// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC server side of the worker mesh.
//!
//! Every worker has exactly one listening socket. Each peer opens one
//! connection with one bidirectional stream; the server reads that stream in
//! order and hands batches straight to the [`InboundHandler`]. After
//! acknowledging a barrier the reader pauses until the local round moves past
//! it, so frames a fast peer already wrote for the following round stay in
//! the transport until the worker is ready for them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use quinn::{Endpoint, RecvStream, SendStream, ServerConfig, TransportConfig};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::control::{
    BarrierRequest, ControlError, ControlFrame, ControlResponse, Handshake, control_request,
};
use crate::frame::{Frame, FrameError, FrameKind, read_frame, write_frame};

/// Errors that can occur in the mesh server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("could not bind {addr} after {attempts} attempts: {last_error}")]
    BindRetriesExhausted {
        addr: SocketAddr,
        attempts: u32,
        last_error: String,
    },

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("batch rejected: {code}: {message}")]
    Rejected { code: String, message: String },

    #[error("server closed")]
    Closed,
}

/// Receives everything peers send to this worker.
///
/// Calls for one peer are made in the order that peer wrote its frames;
/// calls for different peers may run concurrently.
pub trait InboundHandler: Send + Sync + 'static {
    /// Fragment served by this worker
    fn local_fid(&self) -> u32;

    /// Number of fragments in the job
    fn frag_num(&self) -> u32;

    /// Apply one message batch payload from `src_fid`.
    fn on_batch(&self, src_fid: u32, payload: Bytes) -> Result<(), ControlError>;

    /// Record the barrier `src_fid` sent after its last batch of a round.
    fn on_barrier(&self, src_fid: u32, barrier: &BarrierRequest);

    /// A peer connection stopped with an error. Default: ignore.
    fn on_peer_failure(&self, _src_fid: u32, _reason: &str) {}

    /// The peer closed its link cleanly.
    fn on_peer_closed(&self, _src_fid: u32) {}
}

/// Configuration for the mesh server
#[derive(Debug, Clone)]
pub struct MeshServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// TLS certificate chain (PEM format)
    pub cert_pem: Vec<u8>,
    /// TLS private key (PEM format)
    pub key_pem: Vec<u8>,
    /// Maximum pending incoming connections (handshakes in progress)
    pub max_incoming: u32,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Server-side keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// UDP receive buffer size in bytes (0 for OS default)
    pub udp_receive_buffer_size: usize,
    /// UDP send buffer size in bytes (0 for OS default)
    pub udp_send_buffer_size: usize,
    /// Bind attempts before giving up (at least one is always made)
    pub port_bind_retry_attempts: u32,
    /// Fixed delay between bind attempts in milliseconds
    pub port_bind_retry_backoff_ms: u64,
}

impl Default for MeshServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7001)),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            max_incoming: 1_024,
            idle_timeout_ms: 600_000,
            keep_alive_interval_ms: 15_000,
            udp_receive_buffer_size: 2 * 1024 * 1024, // 2MB
            udp_send_buffer_size: 2 * 1024 * 1024,    // 2MB
            port_bind_retry_attempts: 10,
            port_bind_retry_backoff_ms: 500,
        }
    }
}

impl MeshServerConfig {
    /// Fill in a fresh self-signed certificate for `localhost`.
    pub fn with_self_signed_cert(mut self) -> Result<Self, ServerError> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        self.cert_pem = cert.cert.pem().into_bytes();
        self.key_pem = cert.key_pair.serialize_pem().into_bytes();
        Ok(self)
    }
}

/// The listening side of one worker
pub struct MeshServer {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    round: watch::Sender<u64>,
    bytes_received: Arc<AtomicU64>,
    accept_task: JoinHandle<()>,
}

impl MeshServer {
    /// Bind the listening socket (with bounded retry) and start accepting
    /// peers. Must be called inside a tokio runtime.
    #[instrument(skip(config, handler), fields(addr = %config.bind_addr))]
    pub async fn start(
        config: MeshServerConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Self, ServerError> {
        let config = if config.cert_pem.is_empty() {
            config.with_self_signed_cert()?
        } else {
            config
        };
        let server_config = Self::build_server_config(&config)?;

        let attempts = config.port_bind_retry_attempts.max(1);
        let backoff = Duration::from_millis(config.port_bind_retry_backoff_ms);
        let mut attempt = 0;
        let std_socket = loop {
            attempt += 1;
            match Self::bind_socket(&config) {
                Ok(socket) => break socket,
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "failed to bind mesh port");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(ServerError::BindRetriesExhausted {
                        addr: config.bind_addr,
                        attempts,
                        last_error: e.to_string(),
                    });
                }
            }
        };

        let runtime = quinn::default_runtime()
            .ok_or_else(|| ServerError::Bind(std::io::Error::other("no async runtime found")))?;
        let endpoint = Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config),
            runtime.wrap_udp_socket(std_socket)?,
            runtime,
        )?;
        let local_addr = endpoint.local_addr()?;

        info!(
            %local_addr,
            fid = handler.local_fid(),
            udp_recv_buffer = config.udp_receive_buffer_size,
            udp_send_buffer = config.udp_send_buffer_size,
            "mesh server bound"
        );

        let (round, round_rx) = watch::channel(0u64);
        let bytes_received = Arc::new(AtomicU64::new(0));
        let accept_task = tokio::spawn(accept_loop(
            endpoint.clone(),
            handler,
            round_rx,
            bytes_received.clone(),
        ));

        Ok(Self {
            endpoint,
            local_addr,
            round,
            bytes_received,
            accept_task,
        })
    }

    fn bind_socket(config: &MeshServerConfig) -> std::io::Result<std::net::UdpSocket> {
        use socket2::{Domain, Protocol, Socket, Type};

        let domain = if config.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if config.udp_receive_buffer_size > 0
            && let Err(e) = socket.set_recv_buffer_size(config.udp_receive_buffer_size)
        {
            warn!(
                size = config.udp_receive_buffer_size,
                error = %e,
                "Failed to set UDP receive buffer size"
            );
        }
        if config.udp_send_buffer_size > 0
            && let Err(e) = socket.set_send_buffer_size(config.udp_send_buffer_size)
        {
            warn!(
                size = config.udp_send_buffer_size,
                error = %e,
                "Failed to set UDP send buffer size"
            );
        }

        socket.bind(&config.bind_addr.into())?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    fn build_server_config(config: &MeshServerConfig) -> Result<ServerConfig, ServerError> {
        let certs = rustls_pemfile::certs(&mut config.cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::Tls(format!("failed to parse certificates: {}", e)))?;

        let key = rustls_pemfile::private_key(&mut config.key_pem.as_slice())
            .map_err(|e| ServerError::Tls(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| ServerError::Tls("no private key found".to_string()))?;

        let crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(
            Duration::from_millis(config.idle_timeout_ms)
                .try_into()
                .map_err(|e| ServerError::Tls(format!("invalid idle timeout: {}", e)))?,
        ));
        // one stream per peer connection
        transport.max_concurrent_bidi_streams(1u32.into());
        transport.max_concurrent_uni_streams(0u32.into());

        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
                .map_err(|e| ServerError::Tls(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(transport));
        server_config.max_incoming(config.max_incoming as usize);

        Ok(server_config)
    }

    /// Address the server is actually bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Let readers paused at a barrier for an earlier round continue.
    pub fn advance_round(&self, round: u64) {
        self.round.send_if_modified(|current| {
            if round > *current {
                *current = round;
                true
            } else {
                false
            }
        });
    }

    /// Bytes received since the last reset
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Reset the byte counter, returning the previous value
    pub fn reset_bytes_received(&self) -> u64 {
        self.bytes_received.swap(0, Ordering::Relaxed)
    }

    /// Stop accepting, then give peers up to `grace` to close their links
    /// before closing whatever is left.
    ///
    /// Responses already written (such as the last barrier acknowledgement)
    /// reach peers that are still waiting for them.
    pub async fn shutdown(&self, grace: Duration) {
        self.accept_task.abort();
        if tokio::time::timeout(grace, self.endpoint.wait_idle())
            .await
            .is_err()
        {
            warn!(local_addr = %self.local_addr, "peers still connected at shutdown");
        }
        self.close();
    }

    /// Stop accepting and close every inbound connection. Safe to call more
    /// than once.
    pub fn close(&self) {
        self.accept_task.abort();
        self.endpoint.close(0u32.into(), b"server closing");
    }
}

impl Drop for MeshServer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    endpoint: Endpoint,
    handler: Arc<dyn InboundHandler>,
    round: watch::Receiver<u64>,
    bytes_received: Arc<AtomicU64>,
) {
    while let Some(incoming) = endpoint.accept().await {
        let handler = handler.clone();
        let round = round.clone();
        let bytes_received = bytes_received.clone();

        tokio::spawn(async move {
            let connection = match incoming.await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("failed to accept connection: {}", e);
                    return;
                }
            };
            let remote = connection.remote_address();
            debug!(%remote, "accepted connection");

            let (send, recv) = match connection.accept_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    debug!(%remote, error = %e, "connection closed before opening a stream");
                    return;
                }
            };

            let mut reader = PeerReader {
                handler,
                connection: connection.clone(),
                round,
                bytes_received,
                send,
                recv,
                src_fid: None,
                batches: 0,
            };
            if let Err(e) = reader.run().await {
                match &e {
                    ServerError::Frame(FrameError::ConnectionClosed)
                    | ServerError::Connection(quinn::ConnectionError::ApplicationClosed(_))
                    | ServerError::Connection(quinn::ConnectionError::LocallyClosed) => {
                        debug!(%remote, src_fid = ?reader.src_fid, "peer connection closed");
                        if let Some(src) = reader.src_fid {
                            reader.handler.on_peer_closed(src);
                        }
                    }
                    _ => {
                        error!(%remote, src_fid = ?reader.src_fid, error = %e, "peer connection failed");
                        if let Some(src) = reader.src_fid {
                            reader.handler.on_peer_failure(src, &e.to_string());
                        }
                        connection.close(1u32.into(), b"protocol error");
                    }
                }
            }
        });
    }
    debug!("accept loop finished");
}

/// Reads one peer's stream in order.
struct PeerReader {
    handler: Arc<dyn InboundHandler>,
    connection: quinn::Connection,
    round: watch::Receiver<u64>,
    bytes_received: Arc<AtomicU64>,
    send: SendStream,
    recv: RecvStream,
    src_fid: Option<u32>,
    batches: u64,
}

impl PeerReader {
    async fn run(&mut self) -> Result<(), ServerError> {
        let src_fid = self.handshake().await?;
        self.src_fid = Some(src_fid);

        loop {
            let frame = self.read().await?;
            match frame.kind {
                FrameKind::MessageBatch => {
                    self.handler
                        .on_batch(src_fid, frame.payload)
                        .map_err(|e| ServerError::Rejected {
                            code: e.code,
                            message: e.message,
                        })?;
                    self.batches += 1;
                }
                FrameKind::Control => {
                    let control = ControlFrame::decode(frame.payload)?;
                    match control.decode_request()?.body {
                        Some(control_request::Body::Barrier(barrier)) => {
                            self.handler.on_barrier(src_fid, &barrier);
                            let ack = ControlResponse::barrier_ack(barrier.round, self.batches);
                            self.batches = 0;
                            self.respond(control.request_id, &ack).await?;
                            self.wait_past(barrier.round).await?;
                        }
                        other => {
                            let response = ControlResponse::error(
                                "UNEXPECTED_REQUEST",
                                format!("unexpected request after handshake: {:?}", other),
                            );
                            self.respond(control.request_id, &response).await?;
                        }
                    }
                }
            }
        }
    }

    async fn handshake(&mut self) -> Result<u32, ServerError> {
        let frame = self.read().await?;
        if frame.kind != FrameKind::Control {
            return Err(ServerError::Handshake(format!(
                "first frame must be a control frame, got {:?}",
                frame.kind
            )));
        }
        let control = ControlFrame::decode(frame.payload)?;
        let hello = match control.decode_request()?.body {
            Some(control_request::Body::Handshake(hello)) => hello,
            other => {
                return Err(ServerError::Handshake(format!(
                    "first request must be a handshake, got {:?}",
                    other
                )));
            }
        };

        if let Err(reason) = self.check_handshake(&hello) {
            let response = ControlResponse::error("HANDSHAKE_REJECTED", reason.clone());
            self.respond(control.request_id, &response).await?;
            // let the rejection reach the peer before the connection is torn down
            let _ = self.send.finish();
            let _ = tokio::time::timeout(Duration::from_secs(1), self.send.stopped()).await;
            return Err(ServerError::Handshake(reason));
        }

        let ack = ControlResponse::handshake_ack(self.handler.local_fid());
        self.respond(control.request_id, &ack).await?;
        debug!(src_fid = hello.src_fid, "peer handshake accepted");
        Ok(hello.src_fid)
    }

    fn check_handshake(&self, hello: &Handshake) -> Result<(), String> {
        let local = self.handler.local_fid();
        let frag_num = self.handler.frag_num();
        if hello.dst_fid != local {
            return Err(format!(
                "peer {} expected fragment {}, this is fragment {}",
                hello.src_fid, hello.dst_fid, local
            ));
        }
        if hello.frag_num != frag_num {
            return Err(format!(
                "peer {} runs with {} fragments, this worker with {}",
                hello.src_fid, hello.frag_num, frag_num
            ));
        }
        if hello.src_fid >= frag_num || hello.src_fid == local {
            return Err(format!("invalid source fragment {}", hello.src_fid));
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<Frame, ServerError> {
        let frame = match read_frame(&mut self.recv).await {
            Ok(frame) => frame,
            Err(FrameError::Io(e)) => {
                // a peer closing its link with code 0 is a normal departure
                if let Some(quinn::ConnectionError::ApplicationClosed(close)) =
                    self.connection.close_reason()
                    && close.error_code.into_inner() == 0
                {
                    return Err(FrameError::ConnectionClosed.into());
                }
                return Err(FrameError::Io(e).into());
            }
            Err(e) => return Err(e.into()),
        };
        self.bytes_received
            .fetch_add(frame.wire_len() as u64, Ordering::Relaxed);
        Ok(frame)
    }

    async fn respond(&mut self, request_id: u64, response: &ControlResponse) -> Result<(), ServerError> {
        let frame = ControlFrame::response(request_id, response).into_frame()?;
        write_frame(&mut self.send, &frame).await?;
        Ok(())
    }

    /// Park until the local round moves past `round`, or the peer leaves.
    async fn wait_past(&mut self, round: u64) -> Result<(), ServerError> {
        tokio::select! {
            advanced = self.round.wait_for(|current| *current > round) => {
                advanced.map_err(|_| ServerError::Closed)?;
                Ok(())
            }
            _ = self.connection.closed() => Err(FrameError::ConnectionClosed.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshServerConfig::default();
        assert_eq!(config.port_bind_retry_attempts, 10);
        assert_eq!(config.port_bind_retry_backoff_ms, 500);
        assert!(config.cert_pem.is_empty());
    }

    #[test]
    fn test_self_signed_cert() {
        let config = MeshServerConfig::default().with_self_signed_cert().unwrap();
        assert!(String::from_utf8_lossy(&config.cert_pem).contains("BEGIN CERTIFICATE"));
        assert!(String::from_utf8_lossy(&config.key_pem).contains("PRIVATE KEY"));
        assert!(MeshServer::build_server_config(&config).is_ok());
    }

    #[test]
    fn test_error_display() {
        let err = ServerError::BindRetriesExhausted {
            addr: "127.0.0.1:7001".parse().unwrap(),
            attempts: 4,
            last_error: "Address already in use".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:7001"));
        assert!(msg.contains("after 4 attempts"));
    }
}
