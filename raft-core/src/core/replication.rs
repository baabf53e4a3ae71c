//! Leader-side bookkeeping for the replication streams spawned for each follower/non-voter.

use tokio::sync::oneshot;

use crate::core::ConsensusState;
use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::State;
use crate::quorum;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationMetrics;
use crate::replication::ReplicationStream;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Spawn a new replication stream to the given target, returning the state the leader tracks
    /// for it.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_replication_stream(&self, target: NodeId) -> ReplicationState<D> {
        let replstream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: LogId::new(0, 0),
            remove_after_commit: None,
            replstream,
        }
    }

    /// Handle a single event coming from one of this leader's replication streams.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent<S::SnapshotData>) {
        match event {
            ReplicaEvent::RateUpdate { target, is_line_rate } => {
                self.handle_rate_update(target, is_line_rate).await;
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                self.handle_revert_to_follower(target, term);
            }
            ReplicaEvent::UpdateMatchIndex { target, matched } => {
                self.handle_update_match_index(target, matched).await;
            }
            ReplicaEvent::NeedsSnapshot { target, tx } => {
                self.handle_needs_snapshot(target, tx).await;
            }
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
            }
        }
    }

    /// A replication stream reports whether it is replicating at line rate (sending entries as
    /// soon as they're appended) or lagging (sending only metadata). A non-voter is only eligible
    /// to join the cluster once it is caught up enough to replicate at line rate.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_rate_update(&mut self, target: NodeId, is_line_rate: bool) {
        if !is_line_rate {
            return;
        }
        if let Some(non_voter) = self.non_voters.get_mut(&target) {
            non_voter.is_ready_to_join = true;
        }
        self.try_advance_non_voter_sync().await;
    }

    /// If every non-voter this leader is waiting on for a pending membership change is now ready
    /// to join, re-enter `change_membership` to progress the change into joint consensus.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn try_advance_non_voter_sync(&mut self) {
        let is_ready = match &self.consensus_state {
            ConsensusState::NonVoterSync { awaiting, .. } => {
                awaiting.iter().all(|id| self.non_voters.get(id).map(|n| n.is_ready_to_join).unwrap_or(false))
            }
            _ => false,
        };
        if !is_ready {
            return;
        }
        if let ConsensusState::NonVoterSync { members, tx, .. } =
            std::mem::replace(&mut self.consensus_state, ConsensusState::Uniform)
        {
            self.change_membership(members, tx).await;
        }
    }

    /// A node observed a higher term than this leader's current term while replicating; step
    /// down so that the cluster can converge on the newer term.
    #[tracing::instrument(level = "trace", skip(self))]
    fn handle_revert_to_follower(&mut self, target: NodeId, term: u64) {
        tracing::debug!(target, term, "reverting to follower due to higher term seen during replication");
        if term > self.core.current_term {
            self.core.update_current_term(term, None);
            self.core.set_target_state(State::Follower);
        }
    }

    /// Record a new match index for `target`, then recompute the commit index and apply any
    /// newly committed entries.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_update_match_index(&mut self, target: NodeId, matched: LogId) {
        let mut found = false;
        if let Some(state) = self.nodes.get_mut(&target) {
            state.matched = matched;
            found = true;
        } else if let Some(non_voter) = self.non_voters.get_mut(&target) {
            non_voter.state.matched = matched;
            found = true;
        }
        if !found {
            tracing::debug!(target, "match index update for a target with no replication state");
            return;
        }
        self.leader_metrics.replication.insert(target, ReplicationMetrics { matched });
        self.leader_report_metrics();

        self.update_commit_index().await;

        if let Some(state) = self.nodes.get(&target) {
            if let Some(remove_after) = state.remove_after_commit {
                if matched.index >= remove_after {
                    if let Some(node) = self.nodes.remove(&target) {
                        let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                        self.leader_metrics.replication.remove(&target);
                    }
                }
            }
        }
    }

    /// The match index a majority of a configuration group has reached: `members` sorted
    /// ascending, picking the value at the position a majority guarantees has been reached.
    fn majority_matched_index(&self, members: &std::collections::BTreeSet<NodeId>) -> u64 {
        if members.is_empty() {
            return self.core.last_log_id.index;
        }
        let mut matched: Vec<u64> = members
            .iter()
            .map(|id| {
                if *id == self.core.id {
                    self.core.last_log_id.index
                } else {
                    self.nodes.get(id).map(|n| n.matched.index).unwrap_or(0)
                }
            })
            .collect();
        matched.sort_unstable();
        let offset = matched.len() - quorum::majority_of(matched.len());
        matched[offset]
    }

    /// Recompute the commit index from the replication state of both configuration groups (if in
    /// joint consensus), and advance it if a majority in *every* group has reached a new index
    /// whose entry was created in this leader's current term.
    ///
    /// Per §5.4.2, a leader can only conclude an entry from a previous term is committed once an
    /// entry from its own term has been committed; applying this restriction to entries older
    /// than the new entry is what the log matching property makes safe.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn update_commit_index(&mut self) {
        let mut new_commit_index = self.majority_matched_index(&self.core.membership.members);
        if let Some(new_members) = &self.core.membership.members_after_consensus {
            new_commit_index = new_commit_index.min(self.majority_matched_index(new_members));
        }

        if new_commit_index <= self.core.commit_index {
            return;
        }

        let entries = match self.core.storage.get_log_entries(new_commit_index..=new_commit_index).await {
            Ok(entries) => entries,
            Err(err) => {
                let _ = self.core.map_fatal_storage_error(err);
                return;
            }
        };
        let is_current_term = entries.last().map(|entry| entry.log_id.term == self.core.current_term).unwrap_or(false);
        if !is_current_term {
            return;
        }

        self.core.commit_index = new_commit_index;
        self.core.report_metrics(Update::Ignore);

        let commit_index = self.core.commit_index;
        let mut still_waiting = Vec::with_capacity(self.awaiting_committed.len());
        let mut ready = Vec::new();
        for req in self.awaiting_committed.drain(..) {
            if req.entry.log_id.index <= commit_index {
                ready.push(req);
            } else {
                still_waiting.push(req);
            }
        }
        self.awaiting_committed = still_waiting;

        for req in ready {
            self.client_request_post_commit(req).await;
        }
    }

    /// A replication stream fell far enough behind that it needs a full snapshot rather than
    /// being caught up entry-by-entry; build one and hand it back over the given channel.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    async fn handle_needs_snapshot(&mut self, target: NodeId, tx: oneshot::Sender<Snapshot<S::SnapshotData>>) {
        let snapshot = match self.core.storage.do_log_compaction().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let _ = self.core.map_fatal_storage_error(err);
                return;
            }
        };
        self.core.snapshot_last_log_id = snapshot.meta.last_log_id;
        self.core.report_metrics(Update::Ignore);
        if tx.send(snapshot).is_err() {
            tracing::debug!(target, "replication stream dropped before snapshot was ready");
        }
    }
}
