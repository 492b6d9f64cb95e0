// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for superstep-core.
//!
//! Every job-level failure names the worker it happened on, the peer when
//! one is involved, and the phase of the superstep it interrupted.

use std::fmt;
use std::net::SocketAddr;

use superstep_protocol::control::ControlError;
use superstep_protocol::{ClientError, ServerError};

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Where in the worker lifecycle an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Binding the listening socket or dialing peers
    Connect,
    /// Queueing or flushing outbound batches
    Send,
    /// Applying inbound batches
    Receive,
    /// Waiting for barrier acknowledgements and votes
    Barrier,
    /// Vertex compute calling into the manager
    Compute,
    /// Closing links and pools
    Shutdown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Send => "send",
            Self::Receive => "receive",
            Self::Barrier => "barrier",
            Self::Compute => "compute",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// How the caller may react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Already retried a bounded number of times before surfacing
    BoundedRetry,
    /// Aborts the job
    Fatal,
}

/// Job-level errors raised by the message manager.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// A peer could not be reached within the connect retry budget.
    ConnectionFailure {
        /// Worker that was dialing.
        worker: u32,
        /// Peer that could not be reached.
        peer: u32,
        /// Attempts made before giving up.
        attempts: u32,
        /// Error details.
        details: String,
    },

    /// The listening socket could not be bound within the retry budget.
    PortBindFailure {
        /// Worker that was binding.
        worker: u32,
        /// Requested address.
        addr: SocketAddr,
        /// Attempts made before giving up.
        attempts: u32,
        /// Error details.
        details: String,
    },

    /// A call out of order, or a destination that does not resolve.
    InvalidState {
        /// Worker the call was made on.
        worker: u32,
        /// Phase the call was made in.
        phase: Phase,
        /// Error details.
        details: String,
    },

    /// A local id outside `[0, inner_vertex_count)`.
    IndexOutOfBounds {
        /// Worker owning the fragment.
        worker: u32,
        /// Offending local id.
        lid: u64,
        /// Inner vertex count of the fragment.
        inner_vertex_count: usize,
    },

    /// A message or batch could not be encoded or decoded.
    SerializationFailure {
        /// Worker that failed.
        worker: u32,
        /// Peer on the other end, if any.
        peer: Option<u32>,
        /// Phase of the failure.
        phase: Phase,
        /// Error details.
        details: String,
    },

    /// An established link failed mid-job.
    TransportFailure {
        /// Worker that observed the failure.
        worker: u32,
        /// Peer on the other end, if known.
        peer: Option<u32>,
        /// Phase of the failure.
        phase: Phase,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Convert this error to the control error body sent to peers.
    pub fn to_control_error(&self) -> ControlError {
        ControlError {
            code: self.error_code().to_string(),
            message: self.to_string(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionFailure { .. } => "CONNECTION_FAILURE",
            Self::PortBindFailure { .. } => "PORT_BIND_FAILURE",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::IndexOutOfBounds { .. } => "INDEX_OUT_OF_BOUNDS",
            Self::SerializationFailure { .. } => "SERIALIZATION_FAILURE",
            Self::TransportFailure { .. } => "TRANSPORT_FAILURE",
        }
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::ConnectionFailure { .. } | Self::PortBindFailure { .. } => {
                RetryClass::BoundedRetry
            }
            _ => RetryClass::Fatal,
        }
    }

    /// Worker the error was raised on
    pub fn worker(&self) -> u32 {
        match self {
            Self::ConnectionFailure { worker, .. }
            | Self::PortBindFailure { worker, .. }
            | Self::InvalidState { worker, .. }
            | Self::IndexOutOfBounds { worker, .. }
            | Self::SerializationFailure { worker, .. }
            | Self::TransportFailure { worker, .. } => *worker,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::ConnectionFailure { .. } | Self::PortBindFailure { .. } => Phase::Connect,
            Self::IndexOutOfBounds { .. } => Phase::Compute,
            Self::InvalidState { phase, .. }
            | Self::SerializationFailure { phase, .. }
            | Self::TransportFailure { phase, .. } => *phase,
        }
    }

    pub(crate) fn invalid_state(worker: u32, phase: Phase, details: impl Into<String>) -> Self {
        Self::InvalidState {
            worker,
            phase,
            details: details.into(),
        }
    }

    /// Map a client error raised while talking to `peer`.
    pub(crate) fn from_client(worker: u32, peer: Option<u32>, phase: Phase, err: ClientError) -> Self {
        let peer = peer.or_else(|| err.peer());
        match err {
            ClientError::RetriesExhausted {
                peer,
                attempts,
                last_error,
                ..
            } => Self::ConnectionFailure {
                worker,
                peer,
                attempts,
                details: last_error,
            },
            ClientError::Frame(e) => Self::SerializationFailure {
                worker,
                peer,
                phase,
                details: e.to_string(),
            },
            ClientError::Rejected {
                peer,
                code,
                message,
            } if code == "SERIALIZATION_FAILURE" => Self::SerializationFailure {
                worker,
                peer: Some(peer),
                phase,
                details: message,
            },
            ClientError::Handshake { peer, reason } => Self::ConnectionFailure {
                worker,
                peer,
                attempts: 1,
                details: reason,
            },
            other => Self::TransportFailure {
                worker,
                peer,
                phase,
                details: other.to_string(),
            },
        }
    }

    pub(crate) fn from_server(worker: u32, err: ServerError) -> Self {
        match err {
            ServerError::BindRetriesExhausted {
                addr,
                attempts,
                last_error,
            } => Self::PortBindFailure {
                worker,
                addr,
                attempts,
                details: last_error,
            },
            other => Self::TransportFailure {
                worker,
                peer: None,
                phase: Phase::Connect,
                details: other.to_string(),
            },
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailure {
                worker,
                peer,
                attempts,
                details,
            } => {
                write!(
                    f,
                    "Worker {} could not connect to peer {} after {} attempts: {}",
                    worker, peer, attempts, details
                )
            }
            Self::PortBindFailure {
                worker,
                addr,
                attempts,
                details,
            } => {
                write!(
                    f,
                    "Worker {} could not bind {} after {} attempts: {}",
                    worker, addr, attempts, details
                )
            }
            Self::InvalidState {
                worker,
                phase,
                details,
            } => {
                write!(f, "Invalid state on worker {} during {}: {}", worker, phase, details)
            }
            Self::IndexOutOfBounds {
                worker,
                lid,
                inner_vertex_count,
            } => {
                write!(
                    f,
                    "Local id {} out of bounds on worker {} ({} inner vertices)",
                    lid, worker, inner_vertex_count
                )
            }
            Self::SerializationFailure {
                worker,
                peer,
                phase,
                details,
            } => match peer {
                Some(peer) => write!(
                    f,
                    "Serialization failure on worker {} with peer {} during {}: {}",
                    worker, peer, phase, details
                ),
                None => write!(
                    f,
                    "Serialization failure on worker {} during {}: {}",
                    worker, phase, details
                ),
            },
            Self::TransportFailure {
                worker,
                peer,
                phase,
                details,
            } => match peer {
                Some(peer) => write!(
                    f,
                    "Transport failure on worker {} with peer {} during {}: {}",
                    worker, peer, phase, details
                ),
                None => write!(
                    f,
                    "Transport failure on worker {} during {}: {}",
                    worker, phase, details
                ),
            },
        }
    }
}

impl std::error::Error for CoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_codes_and_retry_class() {
        let test_cases = vec![
            (
                CoreError::ConnectionFailure {
                    worker: 0,
                    peer: 1,
                    attempts: 10,
                    details: "timed out".to_string(),
                },
                "CONNECTION_FAILURE",
                RetryClass::BoundedRetry,
            ),
            (
                CoreError::PortBindFailure {
                    worker: 0,
                    addr: "0.0.0.0:7001".parse().unwrap(),
                    attempts: 10,
                    details: "in use".to_string(),
                },
                "PORT_BIND_FAILURE",
                RetryClass::BoundedRetry,
            ),
            (
                CoreError::InvalidState {
                    worker: 0,
                    phase: Phase::Compute,
                    details: "unknown vertex".to_string(),
                },
                "INVALID_STATE",
                RetryClass::Fatal,
            ),
            (
                CoreError::IndexOutOfBounds {
                    worker: 0,
                    lid: 12,
                    inner_vertex_count: 10,
                },
                "INDEX_OUT_OF_BOUNDS",
                RetryClass::Fatal,
            ),
            (
                CoreError::SerializationFailure {
                    worker: 0,
                    peer: Some(2),
                    phase: Phase::Receive,
                    details: "truncated".to_string(),
                },
                "SERIALIZATION_FAILURE",
                RetryClass::Fatal,
            ),
            (
                CoreError::TransportFailure {
                    worker: 0,
                    peer: None,
                    phase: Phase::Barrier,
                    details: "link closed".to_string(),
                },
                "TRANSPORT_FAILURE",
                RetryClass::Fatal,
            ),
        ];

        for (error, expected_code, expected_class) in test_cases {
            let control = error.to_control_error();
            assert_eq!(
                control.code, expected_code,
                "Error {:?} should have code {}",
                error, expected_code
            );
            assert!(!control.message.is_empty(), "Message should not be empty");
            assert_eq!(error.retry_class(), expected_class);
            assert_eq!(error.worker(), 0);
        }
    }

    #[test]
    fn test_core_error_display() {
        let err = CoreError::ConnectionFailure {
            worker: 2,
            peer: 0,
            attempts: 3,
            details: "connection timed out after 100ms".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Worker 2 could not connect to peer 0 after 3 attempts: connection timed out after 100ms"
        );

        let err = CoreError::IndexOutOfBounds {
            worker: 1,
            lid: 7,
            inner_vertex_count: 4,
        };
        assert_eq!(
            err.to_string(),
            "Local id 7 out of bounds on worker 1 (4 inner vertices)"
        );

        let err = CoreError::TransportFailure {
            worker: 1,
            peer: Some(2),
            phase: Phase::Barrier,
            details: "link to peer 2 is closed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Transport failure on worker 1 with peer 2 during barrier: link to peer 2 is closed"
        );
    }

    #[test]
    fn test_client_error_mapping() {
        let err = CoreError::from_client(
            0,
            Some(1),
            Phase::Connect,
            ClientError::RetriesExhausted {
                peer: 1,
                addr: "127.0.0.1:7001".parse().unwrap(),
                attempts: 3,
                last_error: "timed out".to_string(),
            },
        );
        match err {
            CoreError::ConnectionFailure { peer, attempts, .. } => {
                assert_eq!(peer, 1);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected ConnectionFailure, got {:?}", other),
        }

        let err = CoreError::from_client(0, Some(1), Phase::Barrier, ClientError::LinkClosed(1));
        assert_eq!(err.error_code(), "TRANSPORT_FAILURE");
        assert_eq!(err.phase(), Phase::Barrier);
    }
}
