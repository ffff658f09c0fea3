//! Last-Write-Wins conflict resolution.

/// Conflict resolution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Accept the remote version (remote is newer, or absent locally).
    AcceptRemote,
    /// Keep the local version (local is newer or equal).
    KeepLocal,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve an incoming record against the local copy.
    ///
    /// LWW rules:
    /// 1. No local copy: accept.
    /// 2. Strictly newer `updated_at` wins.
    /// 3. Equal timestamps keep local.
    pub fn resolve(local_updated_at: Option<i64>, remote_updated_at: i64) -> Resolution {
        match local_updated_at {
            None => Resolution::AcceptRemote,
            Some(local) if remote_updated_at > local => Resolution::AcceptRemote,
            Some(_) => Resolution::KeepLocal,
        }
    }

    /// Whether a local tombstone outranks an incoming record.
    ///
    /// A record stamped at or before the deletion stays deleted; one edited
    /// strictly afterwards resurrects the row.
    pub fn tombstone_wins(deleted_at: i64, remote_updated_at: i64) -> bool {
        deleted_at >= remote_updated_at
    }

    /// Whether an incoming tombstone should delete the local row.
    ///
    /// Mirrors [`tombstone_wins`](Self::tombstone_wins): a deletion stamped
    /// at the same instant as the local edit removes it.
    pub fn accept_tombstone(local_updated_at: i64, remote_deleted_at: i64) -> bool {
        remote_deleted_at >= local_updated_at
    }
}
