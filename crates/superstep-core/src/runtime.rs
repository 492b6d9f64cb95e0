// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dedicated network runtime.
//!
//! Transport tasks run on their own small tokio runtime so a compute round
//! that keeps the caller's threads busy never stalls accepts, reads or
//! acknowledgements.

use std::future::Future;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

use crate::error::{CoreError, Phase, Result};

/// A multi-thread tokio runtime owned by one worker.
pub struct IoRuntime {
    worker: u32,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
}

impl IoRuntime {
    pub fn new(worker: u32, threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name(format!("superstep-io-{}", worker))
            .enable_all()
            .build()
            .map_err(|e| {
                CoreError::invalid_state(worker, Phase::Connect, format!("failed to start I/O runtime: {}", e))
            })?;
        let handle = runtime.handle().clone();
        debug!(worker, threads, "I/O runtime started");
        Ok(Self {
            worker,
            runtime: Mutex::new(Some(runtime)),
            handle,
        })
    }

    /// Run `fut` to completion on the I/O runtime.
    ///
    /// Tasks `fut` spawns land on the I/O runtime too. Callable from any
    /// async context, including another runtime.
    pub async fn run<F, T>(&self, phase: Phase, fut: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shut_down() {
            return Err(CoreError::invalid_state(self.worker, phase, "I/O runtime is shut down"));
        }
        self.handle
            .spawn(fut)
            .await
            .map_err(|e| CoreError::TransportFailure {
                worker: self.worker,
                peer: None,
                phase,
                details: format!("I/O task failed: {}", e),
            })
    }

    /// Handle for entering the runtime from synchronous code
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_shut_down(&self) -> bool {
        self.runtime.lock().is_none()
    }

    /// Stop the runtime without waiting for its tasks. Safe to call more than
    /// once and from inside an async context.
    pub fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            debug!(worker = self.worker, "I/O runtime shut down");
        }
    }
}

impl Drop for IoRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
