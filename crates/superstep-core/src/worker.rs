// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute driver: runs an [`App`] through PEval and IncEval rounds.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use crate::barrier::BarrierOutcome;
use crate::error::{CoreError, Phase, Result};
use crate::fragment::{Fragment, Gid, Lid};
use crate::manager::MessageManager;
use crate::message::Message;
use crate::store::MessageSlice;

/// A vertex-centric algorithm.
///
/// `peval` runs once, in round 0. `inc_eval` runs in every later round until
/// all workers agree to stop.
pub trait App<F: Fragment, M: Message>: Send + Sync {
    fn peval(&self, ctx: &ComputeContext<'_, F, M>) -> Result<()>;

    fn inc_eval(&self, ctx: &ComputeContext<'_, F, M>) -> Result<()>;
}

/// What an [`App`] sees during one round.
pub struct ComputeContext<'a, F: Fragment, M: Message> {
    manager: &'a MessageManager<F, M>,
    pool: &'a ThreadPool,
}

impl<'a, F: Fragment, M: Message> ComputeContext<'a, F, M> {
    pub fn fragment(&self) -> &F {
        self.manager.fragment()
    }

    pub fn round(&self) -> u64 {
        self.manager.round()
    }

    pub fn get_messages(&self, lid: Lid) -> Result<MessageSlice<'a, M>> {
        self.manager.get_messages(lid)
    }

    pub fn message_available(&self, lid: Lid) -> Result<bool> {
        self.manager.message_available(lid)
    }

    pub fn any_message_received(&self) -> bool {
        self.manager.any_message_received()
    }

    pub fn send_message(&self, oid: &F::Oid, msg: M) -> Result<()> {
        self.manager.send_message(oid, msg)
    }

    pub fn send_to_gid(&self, gid: Gid, msg: M) -> Result<()> {
        self.manager.send_to_gid(gid, msg)
    }

    pub fn send_message_to_all_edges(&self, lid: Lid, msg: M) -> Result<()> {
        self.manager.send_message_to_all_edges(lid, msg)
    }

    pub fn force_continue(&self) {
        self.manager.force_continue();
    }

    pub fn contribute_aggregate(&self, value: i64) {
        self.manager.contribute_aggregate(value);
    }

    /// Run `op` for every inner vertex on the compute pool. Stops at the
    /// first error.
    pub fn for_each_inner_vertex<Op>(&self, op: Op) -> Result<()>
    where
        Op: Fn(Lid) -> Result<()> + Send + Sync,
    {
        let inner_vertex_count = self.manager.fragment().inner_vertex_count();
        let vertices = Lid::try_from(inner_vertex_count).map_err(|_| {
            CoreError::invalid_state(
                self.manager.fragment().fid(),
                Phase::Compute,
                format!("{} inner vertices do not fit a local id", inner_vertex_count),
            )
        })?;
        self.pool
            .install(|| (0..vertices).into_par_iter().try_for_each(|lid| op(lid)))
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    /// Rounds executed, PEval included
    pub rounds: u64,
    pub last_outcome: BarrierOutcome,
}

/// Drives one fragment's [`MessageManager`] through the superstep cycle.
pub struct Worker<F: Fragment, M: Message, A: App<F, M>> {
    manager: MessageManager<F, M>,
    app: A,
    pool: ThreadPool,
}

impl<F: Fragment, M: Message, A: App<F, M>> Worker<F, M, A> {
    /// Build the compute pool (`compute_threads` threads). `manager` must be
    /// bound and initialized before [`run`](Self::run).
    pub fn new(manager: MessageManager<F, M>, app: A) -> Result<Self> {
        let worker = manager.fragment().fid();
        let threads = manager.config().compute_threads;
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("superstep-compute-{}-{}", worker, i))
            .build()
            .map_err(|e| {
                CoreError::invalid_state(worker, Phase::Compute, format!("failed to build compute pool: {}", e))
            })?;
        Ok(Self { manager, app, pool })
    }

    pub fn manager(&self) -> &MessageManager<F, M> {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut MessageManager<F, M> {
        &mut self.manager
    }

    pub fn into_manager(self) -> MessageManager<F, M> {
        self.manager
    }

    /// Run rounds until every worker votes to terminate.
    ///
    /// Fails with `InvalidState` once `max_rounds` rounds ran without
    /// termination.
    pub async fn run(&mut self) -> Result<WorkerReport> {
        let worker = self.manager.fragment().fid();
        let max_rounds = self.manager.config().max_rounds;
        let mut rounds = 0u64;

        loop {
            if max_rounds > 0 && rounds >= max_rounds {
                return Err(CoreError::invalid_state(
                    worker,
                    Phase::Compute,
                    format!("no termination after {} rounds", max_rounds),
                ));
            }

            self.manager.pre_superstep()?;
            {
                let ctx = ComputeContext {
                    manager: &self.manager,
                    pool: &self.pool,
                };
                let app = &self.app;
                if ctx.round() == 0 {
                    self.pool.install(|| app.peval(&ctx))?;
                } else {
                    self.pool.install(|| app.inc_eval(&ctx))?;
                }
                self.manager.finish_message_sending()?;
            }

            let outcome = self.manager.post_superstep().await?;
            rounds += 1;
            debug!(worker, round = outcome.round, terminate = outcome.terminate, "round complete");

            if outcome.terminate {
                info!(worker, rounds, "worker finished");
                return Ok(WorkerReport {
                    rounds,
                    last_outcome: outcome,
                });
            }
        }
    }
}
