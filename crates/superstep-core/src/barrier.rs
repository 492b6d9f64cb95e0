// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Barrier votes and the global termination decision.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use superstep_protocol::{BarrierRequest, BarrierVote};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{CoreError, Phase, Result};
use crate::fragment::FragmentId;

/// Globally agreed result of one superstep.
///
/// Every worker combines the same set of votes, so every worker reaches the
/// same outcome without a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierOutcome {
    pub round: u64,
    /// Messages sent by all workers this round
    pub messages_sent: u64,
    /// Whether any worker asked for another round
    pub force_continue: bool,
    /// Sum of all aggregate contributions this round
    pub aggregate: i64,
    /// No messages are in flight and no worker asked to continue
    pub terminate: bool,
}

impl BarrierOutcome {
    /// Combine the local vote with the votes received from peers.
    pub fn combine<'a>(
        round: u64,
        local: BarrierVote,
        peers: impl IntoIterator<Item = &'a BarrierRequest>,
    ) -> Self {
        let mut messages_sent = local.messages_sent;
        let mut force_continue = local.force_continue;
        let mut aggregate = local.aggregate;
        for vote in peers {
            messages_sent += vote.messages_sent;
            force_continue |= vote.force_continue;
            aggregate = aggregate.wrapping_add(vote.aggregate);
        }
        Self {
            round,
            messages_sent,
            force_continue,
            aggregate,
            terminate: messages_sent == 0 && !force_continue,
        }
    }
}

#[derive(Default)]
struct TrackerState {
    votes: BTreeMap<u64, Vec<(FragmentId, BarrierRequest)>>,
    /// Peers that closed their link
    departed: BTreeSet<FragmentId>,
    failure: Option<CoreError>,
}

/// Collects the barrier requests peers send, keyed by round.
///
/// Written by the inbound readers, awaited by the manager at the end of
/// each superstep.
pub struct BarrierTracker {
    worker: u32,
    state: Mutex<TrackerState>,
    notify: Notify,
}

impl BarrierTracker {
    pub fn new(worker: u32) -> Self {
        Self {
            worker,
            state: Mutex::new(TrackerState::default()),
            notify: Notify::new(),
        }
    }

    pub fn record(&self, src: FragmentId, request: &BarrierRequest) {
        self.state
            .lock()
            .votes
            .entry(request.round)
            .or_default()
            .push((src, request.clone()));
        self.notify.notify_waiters();
    }

    /// Fail every current and future wait. Only the first failure is kept.
    pub fn fail(&self, error: CoreError) {
        {
            let mut state = self.state.lock();
            if state.failure.is_none() {
                state.failure = Some(error);
            }
        }
        self.notify.notify_waiters();
    }

    /// A peer closed its link. Waits for a round it has not voted in fail.
    pub fn peer_departed(&self, src: FragmentId) {
        self.state.lock().departed.insert(src);
        self.notify.notify_waiters();
    }

    pub fn failure(&self) -> Option<CoreError> {
        self.state.lock().failure.clone()
    }

    /// Wait until `expected` peers voted for `round`, then take their votes.
    pub async fn wait(&self, round: u64, expected: usize) -> Result<Vec<BarrierRequest>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking so a record() in between is not missed
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                let arrived = state.votes.get(&round).map_or(0, Vec::len);
                if arrived >= expected {
                    let votes = state.votes.remove(&round).unwrap_or_default();
                    debug!(round, peers = votes.len(), "barrier votes complete");
                    return Ok(votes.into_iter().map(|(_, vote)| vote).collect());
                }
                // a vote that made it in before the failure still counts
                if let Some(error) = &state.failure {
                    return Err(error.clone());
                }
                let voted = |peer: &FragmentId| {
                    state
                        .votes
                        .get(&round)
                        .is_some_and(|votes| votes.iter().any(|(src, _)| src == peer))
                };
                if let Some(&peer) = state.departed.iter().find(|peer| !voted(peer)) {
                    return Err(CoreError::TransportFailure {
                        worker: self.worker,
                        peer: Some(peer),
                        phase: Phase::Barrier,
                        details: format!("peer {} left before voting in round {}", peer, round),
                    });
                }
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn vote(round: u64, messages_sent: u64, force_continue: bool, aggregate: i64) -> BarrierRequest {
        BarrierRequest {
            round,
            messages_sent,
            force_continue,
            aggregate,
            batches_sent: 0,
        }
    }

    #[test]
    fn test_outcome_terminates_only_when_idle() {
        let idle = BarrierVote::default();
        let peers = [vote(3, 0, false, 2), vote(3, 0, false, -5)];
        let outcome = BarrierOutcome::combine(3, idle, &peers);
        assert!(outcome.terminate);
        assert_eq!(outcome.aggregate, -3);

        let busy = [vote(3, 4, false, 0)];
        let outcome = BarrierOutcome::combine(3, idle, &busy);
        assert!(!outcome.terminate);
        assert_eq!(outcome.messages_sent, 4);
    }

    #[test]
    fn test_force_continue_overrides_idle() {
        let local = BarrierVote {
            force_continue: true,
            ..Default::default()
        };
        let outcome = BarrierOutcome::combine(1, local, &[vote(1, 0, false, 0)]);
        assert!(outcome.force_continue);
        assert!(!outcome.terminate);

        let outcome = BarrierOutcome::combine(1, BarrierVote::default(), &[vote(1, 0, true, 0)]);
        assert!(!outcome.terminate);
    }

    #[tokio::test]
    async fn test_wait_returns_votes_of_requested_round() {
        let tracker = Arc::new(BarrierTracker::new(0));
        tracker.record(2, &vote(0, 1, false, 0));
        tracker.record(1, &vote(1, 5, false, 0));

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait(0, 2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tracker.record(1, &vote(0, 2, false, 0));
        let votes = waiter.await.unwrap().unwrap();
        assert_eq!(votes.len(), 2);
        assert_eq!(votes.iter().map(|v| v.messages_sent).sum::<u64>(), 3);

        // round 1 is untouched
        assert_eq!(tracker.wait(1, 1).await.unwrap()[0].messages_sent, 5);
    }

    #[tokio::test]
    async fn test_wait_for_no_peers_is_immediate() {
        let tracker = BarrierTracker::new(0);
        assert!(tracker.wait(7, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_wakes_waiters() {
        let tracker = Arc::new(BarrierTracker::new(0));
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait(0, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tracker.fail(CoreError::TransportFailure {
            worker: 0,
            peer: Some(1),
            phase: Phase::Receive,
            details: "peer went away".to_string(),
        });
        tracker.fail(CoreError::invalid_state(0, Phase::Barrier, "second failure"));

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), "TRANSPORT_FAILURE");
        assert_eq!(tracker.failure().unwrap().error_code(), "TRANSPORT_FAILURE");
    }

    #[tokio::test]
    async fn test_departed_peer_fails_only_rounds_it_missed() {
        let tracker = BarrierTracker::new(0);
        tracker.record(1, &vote(4, 0, false, 0));
        tracker.peer_departed(1);
        tracker.record(2, &vote(4, 0, false, 0));

        // both votes for round 4 arrived, the departure does not matter
        assert_eq!(tracker.wait(4, 2).await.unwrap().len(), 2);

        let err = tracker.wait(5, 2).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::TransportFailure {
                peer: Some(1),
                phase: Phase::Barrier,
                ..
            }
        ));
    }
}
