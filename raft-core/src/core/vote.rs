use tokio::sync::mpsc;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Handle a RequestVote RPC from a peer campaigning to become leader (§5.2, §5.4).
    #[tracing::instrument(level = "trace", skip(self, msg))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        if msg.term < self.current_term {
            tracing::debug!({self.current_term}, "RequestVote term is less than current term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            self.save_hard_state().await?;
        }

        // A node may only vote once per term, for at most one candidate, first-come-first-served.
        if let Some(candidate_id) = self.voted_for {
            if candidate_id != msg.candidate_id {
                tracing::debug!("already voted for another candidate this term, rejecting");
                return Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                });
            }
        }

        // The candidate's log must be at least as up-to-date as ours: compare
        // (last_log_term, last_log_index) lexicographically.
        let candidate_is_up_to_date = (msg.last_log_term, msg.last_log_index)
            >= (self.last_log_id.term, self.last_log_id.index);
        if !candidate_is_up_to_date {
            tracing::debug!("rejecting vote request as candidate's log is not up-to-date");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        self.voted_for = Some(msg.candidate_id);
        self.save_hard_state().await?;
        self.set_target_state(State::Follower);
        self.update_next_election_timeout(false);
        self.report_metrics(Update::Ignore);

        tracing::debug!("vote request granted");
        Ok(VoteResponse {
            term: self.current_term,
            vote_granted: true,
        })
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    /// Send a RequestVote RPC to every voting peer in parallel, returning a channel over which
    /// each peer's response (or error) arrives tagged with its `NodeId`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&mut self) -> mpsc::UnboundedReceiver<(anyhow::Result<VoteResponse>, NodeId)> {
        let all_nodes = self.core.membership.all_nodes();
        let (tx, rx) = mpsc::unbounded_channel();

        for target in all_nodes.into_iter().filter(|node| *node != self.core.id) {
            let rpc = VoteRequest::new(
                self.core.current_term,
                self.core.id,
                self.core.last_log_id.index,
                self.core.last_log_id.term,
            );
            let network = self.core.network.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let res = network.send_vote(target, rpc).await;
                let _ = tx.send((res, target));
            });
        }

        rx
    }

    /// Apply the response of a single RequestVote RPC towards this election's quorum tallies,
    /// accounting for both halves of a joint-consensus configuration where applicable.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(super) async fn handle_vote_response(
        &mut self, res: anyhow::Result<VoteResponse>, target: NodeId,
    ) -> RaftResult<()> {
        let res = match res {
            Ok(res) => res,
            Err(err) => {
                tracing::warn!({error=%err, target}, "error while requesting vote from peer");
                return Ok(());
            }
        };

        // A peer observed a newer term: step down and let that term's leader (or another
        // candidate) take over.
        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.set_target_state(State::Follower);
            return Ok(());
        }

        if !res.vote_granted {
            return Ok(());
        }

        // Tally the vote against the old (current) member set, and the new member set if this
        // election is being run under a joint consensus configuration.
        let in_old = self.core.membership.members.contains(&target);
        let in_new = self
            .core
            .membership
            .members_after_consensus
            .as_ref()
            .map(|members| members.contains(&target))
            .unwrap_or(false);

        if in_old {
            self.votes_granted_old += 1;
        }
        if in_new {
            self.votes_granted_new += 1;
        }

        let has_old_quorum = self.votes_granted_old >= self.votes_needed_old;
        let has_new_quorum = self.votes_needed_new == 0 || self.votes_granted_new >= self.votes_needed_new;

        if has_old_quorum && has_new_quorum {
            tracing::debug!("going to leader state as the result of election");
            self.core.set_target_state(State::Leader);
        }

        Ok(())
    }
}
