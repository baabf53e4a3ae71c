use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConflictOpt;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::AppData;
use crate::AppDataResponse;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Handle an AppendEntries RPC from a peer claiming to be the cluster leader (§5.3).
    #[tracing::instrument(level = "trace", skip(self, msg))]
    pub(super) async fn handle_append_entries_request(
        &mut self, msg: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        // Reject any requests from a stale term.
        if msg.term < self.current_term {
            tracing::debug!({self.current_term}, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: None,
            });
        }

        // Update election timeout & reaffirm leader; term >= current_term is only possible from
        // a legitimate leader, so step down to follower no matter our current role.
        self.update_next_election_timeout(true);

        if self.current_term != msg.term {
            self.update_current_term(msg.term, None);
            self.save_hard_state().await?;
        }

        self.update_current_leader(UpdateCurrentLeader::OtherNode(msg.leader_id));
        if !self.target_state.is_follower() && !self.target_state.is_non_voter() {
            self.set_target_state(State::Follower);
        }

        // If this node's log is empty and the leader starts from the very beginning, there is
        // nothing to check; otherwise validate the consistency check at `prev_log_id`.
        if msg.prev_log_id.index != 0 || msg.prev_log_id.term != 0 {
            let not_matching = match self.storage.try_get_log_entry(msg.prev_log_id.index).await {
                Ok(Some(entry)) => entry.log_id.term != msg.prev_log_id.term,
                Ok(None) => true,
                Err(err) => return Err(self.map_fatal_storage_error(err)),
            };

            if not_matching {
                let conflict_opt = self.find_conflict_opt(msg.prev_log_id.index).await?;
                tracing::debug!(?conflict_opt, "consistency check failed, replying with conflict hint");
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    conflict_opt,
                });
            }
        }

        if !msg.entries.is_empty() {
            self.append_log_entries(&msg.entries).await?;
        }

        // Advance the commit index up to the highest entry this node now holds, as instructed by
        // the leader. The apply loop advances opportunistically on the next `tokio::select!` tick.
        if msg.leader_commit > self.commit_index {
            let last_index = msg.entries.last().map(|e| e.log_id.index).unwrap_or(self.last_log_id.index);
            self.commit_index = std::cmp::min(msg.leader_commit, last_index);
            self.replicate_to_state_machine_if_needed().await?;
        }

        self.report_metrics(Update::Ignore);
        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict_opt: None,
        })
    }

    /// Compute a conflict hint pointing the leader at the first index of the conflicting term, so
    /// that `next_index` back-off can skip whole conflicting terms in one round trip (§5.3).
    #[tracing::instrument(level = "trace", skip(self))]
    async fn find_conflict_opt(&mut self, requested_index: u64) -> RaftResult<Option<ConflictOpt>> {
        if requested_index > self.last_log_id.index {
            return Ok(Some(ConflictOpt {
                log_id: self.last_log_id,
            }));
        }

        let conflicting_term = match self.storage.try_get_log_entry(requested_index).await {
            Ok(Some(entry)) => Some(entry.log_id.term),
            Ok(None) => None,
            Err(err) => return Err(self.map_fatal_storage_error(err)),
        };

        let conflicting_term = match conflicting_term {
            Some(term) => term,
            None => {
                return Ok(Some(ConflictOpt {
                    log_id: self.last_log_id,
                }))
            }
        };

        // Scan backward for the first index which still carries the conflicting term.
        let mut first_index_of_term = requested_index;
        let scan_start = requested_index.saturating_sub(self.config.max_payload_entries);
        if scan_start < requested_index {
            let entries = self
                .storage
                .get_log_entries(scan_start..requested_index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            for entry in entries.iter().rev() {
                if entry.log_id.term == conflicting_term {
                    first_index_of_term = entry.log_id.index;
                } else {
                    break;
                }
            }
        }

        Ok(Some(ConflictOpt {
            log_id: crate::LogId::new(conflicting_term, first_index_of_term),
        }))
    }

    /// Reconcile the local log with the leader's `entries`: truncate any divergent tail and
    /// append what is new (§5.3 point 4).
    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_log_entries(&mut self, entries: &[Entry<D>]) -> RaftResult<()> {
        // Find the first entry which either does not yet exist locally, or whose term diverges
        // from what we already hold; everything before that point is a confirmed prefix match.
        let mut new_entries: &[Entry<D>] = &[];
        for (idx, entry) in entries.iter().enumerate() {
            let local = self
                .storage
                .try_get_log_entry(entry.log_id.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            match local {
                Some(local_entry) if local_entry.log_id.term == entry.log_id.term => continue,
                Some(_) => {
                    // Diverging entry: truncate from here downward and append the rest fresh.
                    self.storage
                        .delete_logs_from(entry.log_id.index..)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    new_entries = &entries[idx..];
                    break;
                }
                None => {
                    // No local entry at this index at all: append from here onward.
                    new_entries = &entries[idx..];
                    break;
                }
            }
        }

        if new_entries.is_empty() {
            return Ok(());
        }

        let refs: Vec<&Entry<D>> = new_entries.iter().collect();
        self.storage.append_to_log(&refs).await.map_err(|err| self.map_fatal_storage_error(err))?;

        if let Some(last) = new_entries.last() {
            self.last_log_id = last.log_id;
        }

        for entry in new_entries {
            if let EntryPayload::ConfigChange(ref change) = entry.payload {
                self.update_membership(change.membership.clone())?;
            }
        }

        Ok(())
    }
}
