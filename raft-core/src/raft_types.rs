//! Small identifier types shared by the storage and replication modules.

use serde::Deserialize;
use serde::Serialize;

/// Identifies a single snapshot generation, so that chunked `InstallSnapshot` transfers can tell
/// a resumed transfer of the *same* snapshot apart from a newer one started from scratch.
pub type SnapshotId = String;

/// A `(snapshot_id, offset)` pair used to report a mismatch between the offset a follower expects
/// next and the offset the leader actually sent, per the chunked `InstallSnapshot` scheme.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSegmentId {
    pub id: SnapshotId,
    pub offset: u64,
}

impl std::fmt::Display for SnapshotSegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.offset)
    }
}
