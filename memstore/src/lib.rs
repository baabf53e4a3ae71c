//! An in-memory `RaftStorage` implementation, backed by `BTreeMap`s under `RwLock`s.
//!
//! This is not meant for production use: nothing here is persisted to disk. It exists so that
//! raft-core's test suite and the simulation harness have a storage backend that is cheap to
//! construct, trivial to introspect, and exercises every corner of the `RaftStorage` contract
//! (log compaction, chunked snapshot install, defensive consistency checks).

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Cursor;
use std::ops::Bound;
use std::ops::RangeBounds;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::sync::RwLockWriteGuard;

use raft_core::raft::Entry;
use raft_core::raft::EntryPayload;
use raft_core::raft::MembershipConfig;
use raft_core::storage::HardState;
use raft_core::storage::InitialState;
use raft_core::storage::RaftStorage;
use raft_core::storage::RaftStorageDebug;
use raft_core::storage::Snapshot;
use raft_core::storage::SnapshotMeta;
use raft_core::AppData;
use raft_core::AppDataResponse;
use raft_core::LogId;
use raft_core::NodeId;

/// The application data type written by clients of the test/simulation cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientRequest {
    /// The ID of the client which has sent the request.
    pub client: String,
    /// The serial number of this request, used for idempotent de-duplication.
    pub serial: u64,
    /// A string describing the status to be applied to the state machine.
    pub status: String,
}

impl AppData for ClientRequest {}

/// The application data response returned after applying a `ClientRequest` to the state machine.
///
/// Carries the status value that was previously recorded for the client's serial number, if this
/// request has already been seen (making `apply_to_state_machine` idempotent across retries).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientResponse(pub Option<String>);

impl AppDataResponse for ClientResponse {}

/// The state machine produced by applying a `ClientRequest` log to memory.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemStoreStateMachine {
    pub last_applied_log: LogId,

    /// The last response generated for each client's most recent serial number, keyed by client
    /// ID, so that a retried request is answered without being applied twice.
    pub client_serial_responses: HashMap<String, (u64, Option<String>)>,

    /// The status value most recently written for each client ID.
    pub client_status: BTreeMap<String, String>,
}

/// An in-memory snapshot: the raw bytes of an encoded `MemStoreStateMachine` plus its metadata.
#[derive(Clone, Debug)]
struct MemStoreSnapshot {
    meta: SnapshotMeta,
    data: Vec<u8>,
}

/// Error returned from `apply_to_state_machine` that tells raft-core this node's storage can no
/// longer be trusted and the Raft task should shut down.
#[derive(Clone, Debug, thiserror::Error)]
#[error("memstore state machine for node {id} is unrecoverable: {msg}")]
pub struct ShutdownError {
    pub id: NodeId,
    pub msg: String,
}

/// An in-memory `RaftStorage` implementation, suitable for tests and for the deterministic
/// simulation harness.
pub struct MemStore {
    id: NodeId,
    log: RwLock<BTreeMap<u64, Entry<ClientRequest>>>,
    sm: RwLock<MemStoreStateMachine>,
    hs: RwLock<Option<HardState>>,
    current_snapshot: RwLock<Option<MemStoreSnapshot>>,
    snapshot_idx: AtomicU64,
    defensive: AtomicBool,
}

impl MemStore {
    /// Create a new, pristine `MemStore` for the given node ID.
    pub fn new(id: NodeId) -> Self {
        let log = RwLock::new(BTreeMap::new());
        let sm = RwLock::new(MemStoreStateMachine::default());
        let hs = RwLock::new(None);
        let current_snapshot = RwLock::new(None);

        Self {
            id,
            log,
            sm,
            hs,
            current_snapshot,
            snapshot_idx: AtomicU64::new(0),
            defensive: AtomicBool::new(false),
        }
    }

    /// Get a write-locked handle to the log, for direct inspection/mutation in tests.
    pub async fn get_log(&self) -> RwLockWriteGuard<'_, BTreeMap<u64, Entry<ClientRequest>>> {
        self.log.write().await
    }

    fn id(&self) -> NodeId {
        self.id
    }
}

#[async_trait]
impl RaftStorageDebug<MemStoreStateMachine> for MemStore {
    async fn get_state_machine(&self) -> MemStoreStateMachine {
        self.sm.read().await.clone()
    }

    async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }
}

#[async_trait]
impl RaftStorage<ClientRequest, ClientResponse> for MemStore {
    type SnapshotData = Cursor<Vec<u8>>;
    type ShutdownError = ShutdownError;

    async fn defensive(&self, d: bool) -> bool {
        self.defensive.store(d, Ordering::Relaxed);
        self.defensive.load(Ordering::Relaxed)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_membership_config(&self) -> Result<MembershipConfig> {
        let log = self.log.read().await;

        for entry in log.values().rev() {
            if let EntryPayload::ConfigChange(cfg) = &entry.payload {
                return Ok(cfg.membership.clone());
            }
        }

        Ok(MembershipConfig::new_initial(self.id()))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_initial_state(&self) -> Result<InitialState> {
        let membership = self.get_membership_config().await?;
        let sm = self.sm.read().await;
        let hs = self.hs.read().await;

        match &*hs {
            Some(inner) => {
                let log = self.log.read().await;
                let last_log_id = match log.values().next_back() {
                    Some(entry) => entry.log_id,
                    None => sm.last_applied_log,
                };
                Ok(InitialState {
                    last_log_id,
                    last_applied_log: sm.last_applied_log,
                    hard_state: inner.clone(),
                    membership,
                })
            }
            None => {
                drop(hs);
                let new_hs = HardState {
                    current_term: 0,
                    voted_for: None,
                };
                self.save_hard_state(&new_hs).await?;
                Ok(InitialState::new_initial(self.id()))
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, hs))]
    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<ClientRequest>>> {
        if let (Bound::Included(start), Bound::Excluded(stop)) = (range.start_bound(), range.end_bound()) {
            if self.defensive.load(Ordering::Relaxed) && start > stop {
                return Err(anyhow!("invalid range {:?}: start > stop", range));
            }
        }

        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, entry)| entry.clone()).collect())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.get(&log_index).cloned())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_last_log_id(&self) -> Result<LogId> {
        let log = self.log.read().await;
        let sm = self.sm.read().await;

        match log.values().next_back() {
            Some(entry) => Ok(entry.log_id),
            None => Ok(sm.last_applied_log),
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<()> {
        let mut log = self.log.write().await;
        let keys = log.range(range).map(|(k, _)| *k).collect::<Vec<_>>();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_to_log(&self, entries: &[&Entry<ClientRequest>]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            if self.defensive.load(Ordering::Relaxed) {
                if let Some((last_index, _)) = log.iter().next_back() {
                    if entry.log_id.index != last_index + 1 {
                        return Err(anyhow!(
                            "non-contiguous append: last log index {}, entry index {}",
                            last_index,
                            entry.log_id.index
                        ));
                    }
                }
            }
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn apply_to_state_machine(&self, entries: &[&Entry<ClientRequest>]) -> Result<Vec<ClientResponse>> {
        let mut sm = self.sm.write().await;
        let mut replies = Vec::with_capacity(entries.len());

        for entry in entries {
            sm.last_applied_log = entry.log_id;

            match &entry.payload {
                EntryPayload::Blank => replies.push(ClientResponse(None)),
                EntryPayload::ConfigChange(_) => replies.push(ClientResponse(None)),
                EntryPayload::PurgedMarker => replies.push(ClientResponse(None)),
                EntryPayload::Normal(norm) => {
                    let req = &norm.data;

                    if let Some((serial, resp)) = sm.client_serial_responses.get(&req.client) {
                        if serial == &req.serial {
                            replies.push(ClientResponse(resp.clone()));
                            continue;
                        }
                    }

                    let previous = sm.client_status.insert(req.client.clone(), req.status.clone());
                    sm.client_serial_responses.insert(req.client.clone(), (req.serial, previous.clone()));
                    replies.push(ClientResponse(previous));
                }
            }
        }

        Ok(replies)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn do_log_compaction(&self) -> Result<Snapshot<Self::SnapshotData>> {
        let (data, last_applied_log);
        {
            let sm = self.sm.read().await;
            data = serde_json::to_vec(&*sm)?;
            last_applied_log = sm.last_applied_log;
        }

        let membership = {
            let log = self.log.read().await;
            log.values()
                .rev()
                .find_map(|entry| match &entry.payload {
                    EntryPayload::ConfigChange(cfg) => Some(cfg.membership.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| MembershipConfig::new_initial(self.id()))
        };

        let snapshot_idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = format!("{}-{}-{}", last_applied_log.term, last_applied_log.index, snapshot_idx);

        let meta = SnapshotMeta {
            last_log_id: last_applied_log,
            membership,
            snapshot_id,
        };

        {
            let mut log = self.log.write().await;
            let keep = log.split_off(&(last_applied_log.index + 1));
            *log = keep;
            log.insert(last_applied_log.index, Entry::new_purged_marker(last_applied_log));
        }

        *self.current_snapshot.write().await = Some(MemStoreSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
    ) -> Result<()> {
        let data = snapshot.into_inner();
        let new_sm: MemStoreStateMachine = serde_json::from_slice(&data)?;

        {
            let mut log = self.log.write().await;
            let keep = log.split_off(&(meta.last_log_id.index + 1));
            *log = keep;
            log.insert(meta.last_log_id.index, Entry::new_purged_marker(meta.last_log_id));
        }

        *self.sm.write().await = new_sm;
        *self.current_snapshot.write().await = Some(MemStoreSnapshot {
            meta: meta.clone(),
            data,
        });

        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => {
                let data = snapshot.data.clone();
                Ok(Some(Snapshot {
                    meta: snapshot.meta.clone(),
                    snapshot: Box::new(Cursor::new(data)),
                }))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreeset;
    use raft_core::raft::EntryNormal;

    use super::*;

    fn blank(term: u64, index: u64) -> Entry<ClientRequest> {
        Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::Blank,
        }
    }

    fn normal(term: u64, index: u64, client: &str, serial: u64, status: &str) -> Entry<ClientRequest> {
        Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::Normal(EntryNormal {
                data: ClientRequest {
                    client: client.to_string(),
                    serial,
                    status: status.to_string(),
                },
            }),
        }
    }

    #[tokio::test]
    async fn get_initial_state_without_prior_data_is_pristine() {
        let store = MemStore::new(1);
        let initial = store.get_initial_state().await.unwrap();
        assert_eq!(initial.last_log_id, LogId::new(0, 0));
        assert_eq!(initial.last_applied_log, LogId::new(0, 0));
        assert_eq!(initial.membership, MembershipConfig::new_initial(1));
    }

    #[tokio::test]
    async fn append_and_read_back_log_entries() {
        let store = MemStore::new(1);
        let e1 = blank(1, 1);
        let e2 = normal(1, 2, "alice", 0, "first");
        store.append_to_log(&[&e1, &e2]).await.unwrap();

        let entries = store.get_log_entries(1..3).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(store.get_last_log_id().await.unwrap(), LogId::new(1, 2));
    }

    #[tokio::test]
    async fn apply_is_idempotent_per_client_serial() {
        let store = MemStore::new(1);
        let e1 = normal(1, 1, "alice", 0, "first");

        let r1 = store.apply_to_state_machine(&[&e1]).await.unwrap();
        let r2 = store.apply_to_state_machine(&[&e1]).await.unwrap();

        assert_eq!(r1[0].0, None);
        assert_eq!(r2[0].0, None);

        let sm = store.get_state_machine().await;
        assert_eq!(sm.client_status.get("alice"), Some(&"first".to_string()));
    }

    #[tokio::test]
    async fn log_compaction_produces_readable_snapshot_and_purges_log() {
        let store = MemStore::new(1);
        let e1 = normal(1, 1, "alice", 0, "first");
        let e2 = normal(1, 2, "alice", 1, "second");
        store.append_to_log(&[&e1, &e2]).await.unwrap();
        store.apply_to_state_machine(&[&e1, &e2]).await.unwrap();

        let snapshot = store.do_log_compaction().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id, LogId::new(1, 2));

        let log = store.get_log().await;
        assert_eq!(log.len(), 1);
        assert!(matches!(log.get(&2).unwrap().payload, EntryPayload::PurgedMarker));
        drop(log);

        let current = store.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(current.meta.last_log_id, LogId::new(1, 2));
    }

    #[tokio::test]
    async fn finalize_snapshot_installation_replaces_state_machine_and_log() {
        let leader = MemStore::new(1);
        let e1 = normal(1, 1, "alice", 0, "first");
        leader.append_to_log(&[&e1]).await.unwrap();
        leader.apply_to_state_machine(&[&e1]).await.unwrap();
        let snapshot = leader.do_log_compaction().await.unwrap();

        let follower = MemStore::new(2);
        let mut data = Vec::new();
        let mut reader = snapshot.snapshot;
        use tokio::io::AsyncReadExt;
        reader.read_to_end(&mut data).await.unwrap();

        follower
            .finalize_snapshot_installation(&snapshot.meta, Box::new(Cursor::new(data)))
            .await
            .unwrap();

        let sm = follower.get_state_machine().await;
        assert_eq!(sm.last_applied_log, LogId::new(1, 1));
        assert_eq!(sm.client_status.get("alice"), Some(&"first".to_string()));
    }

    #[tokio::test]
    async fn defensive_mode_rejects_non_contiguous_append() {
        let store = MemStore::new(1);
        store.defensive(true).await;
        let e1 = blank(1, 1);
        let e3 = blank(1, 3);
        store.append_to_log(&[&e1]).await.unwrap();
        assert!(store.append_to_log(&[&e3]).await.is_err());
    }

    #[tokio::test]
    async fn membership_config_falls_back_to_single_node_initial() {
        let store = MemStore::new(7);
        let cfg = store.get_membership_config().await.unwrap();
        assert_eq!(cfg, MembershipConfig::new_initial(7));

        let e1 = Entry {
            log_id: LogId::new(1, 1),
            payload: EntryPayload::ConfigChange(raft_core::raft::EntryConfigChange {
                membership: MembershipConfig {
                    members: btreeset! {7, 8, 9},
                    members_after_consensus: None,
                },
            }),
        };
        store.append_to_log(&[&e1]).await.unwrap();
        let cfg = store.get_membership_config().await.unwrap();
        assert_eq!(cfg.members, btreeset! {7, 8, 9});
    }
}
