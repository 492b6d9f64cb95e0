// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for multi-worker loopback tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use superstep_core::{
    BarrierOutcome, EdgeListFragment, JobConfig, MessageManager, StoreKind, WorkerDirectory,
};

pub type RingFragment = EdgeListFragment<u64>;
pub type Manager = MessageManager<RingFragment, u64>;

/// Rounds after which [`drive`] gives up on a job that never terminates.
pub const ROUND_LIMIT: usize = 16;

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// A ring `0 -> 1 -> ... -> vertices-1 -> 0`, vertex `v` owned by `v % fnum`.
pub fn ring_fragments(fnum: u32, vertices: u64) -> Vec<Arc<RingFragment>> {
    let oids: Vec<u64> = (0..vertices).collect();
    let edges: Vec<(u64, u64)> = (0..vertices).map(|v| (v, (v + 1) % vertices)).collect();
    (0..fnum)
        .map(|fid| {
            Arc::new(EdgeListFragment::build(fid, fnum, &oids, &edges, |oid| {
                (*oid % u64::from(fnum)) as u32
            }))
        })
        .collect()
}

/// Small thread pools and short retry budgets.
pub fn test_config() -> JobConfig {
    JobConfig {
        io_threads: 1,
        compute_threads: 2,
        connect_retry_attempts: 3,
        connect_retry_backoff_ms: 50,
        connect_timeout_ms: 2_000,
        port_bind_retry_attempts: 3,
        port_bind_retry_backoff_ms: 50,
        batch_flush_threshold: 64,
        outbound_queue_frames: 64,
        message_store: StoreKind::Dense,
        max_rounds: 0,
    }
}

/// Create, bind and connect one manager per fragment.
pub async fn start_cluster(fragments: Vec<Arc<RingFragment>>, config: JobConfig) -> Vec<Manager> {
    let mut managers = Vec::with_capacity(fragments.len());
    let mut addrs = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        let mut manager = Manager::new(fragment, config.clone()).unwrap();
        addrs.push(manager.bind(loopback()).await.unwrap());
        managers.push(manager);
    }

    let directory = WorkerDirectory::new(addrs);
    for manager in &mut managers {
        manager.initialize(&directory).await.unwrap();
    }
    managers
}

/// Run every manager through rounds concurrently until the job terminates.
///
/// `step` runs between `pre_superstep` and `post_superstep` on each worker.
/// Results are indexed by fragment id.
pub async fn drive<S>(managers: Vec<Manager>, step: S) -> Vec<(Manager, Vec<BarrierOutcome>)>
where
    S: Fn(&Manager) + Send + Sync + 'static,
{
    let step = Arc::new(step);
    let tasks: Vec<_> = managers
        .into_iter()
        .map(|mut manager| {
            let step = step.clone();
            tokio::spawn(async move {
                let mut outcomes = Vec::new();
                loop {
                    manager.pre_superstep().unwrap();
                    step(&manager);
                    let outcome = manager.post_superstep().await.unwrap();
                    outcomes.push(outcome);
                    if outcome.terminate || outcomes.len() >= ROUND_LIMIT {
                        break;
                    }
                }
                (manager, outcomes)
            })
        })
        .collect();

    futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect()
}

/// Close every manager at once so no server waits on a peer that is still
/// closing.
pub async fn close_all(managers: &mut [Manager]) {
    futures::future::join_all(managers.iter_mut().map(|manager| manager.close())).await;
}
