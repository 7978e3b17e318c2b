//! Conflict resolution for downloaded resources.

use std::fmt;

use serde_json::Value;

use crate::types::LocalChange;

/// A downloaded resource whose local copy has unsynced changes.
#[derive(Debug, Clone, Copy)]
pub struct Conflict<'a> {
    /// Resource type.
    pub resource_type: &'a str,
    /// Logical id.
    pub resource_id: &'a str,
    /// The current local body, or `None` if it was deleted locally.
    pub local: Option<&'a Value>,
    /// The body the server sent.
    pub remote: &'a Value,
    /// The pending changes, oldest first.
    pub pending: &'a [LocalChange],
}

/// Which side of a [`Conflict`] wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Overwrite the local body and drop the pending changes.
    AcceptRemote,
    /// Keep the local body and re-base the pending changes onto the remote
    /// version.
    AcceptLocal,
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictResolution::AcceptRemote => write!(f, "accept-remote"),
            ConflictResolution::AcceptLocal => write!(f, "accept-local"),
        }
    }
}

/// Decides download conflicts.
///
/// Called inside the transaction that applies a downloaded page, so it must
/// not block.
pub trait ConflictResolver: Send + Sync {
    /// Picks the winning side.
    fn resolve(&self, conflict: &Conflict<'_>) -> ConflictResolution;
}

/// Always keeps the server's body.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptRemote;

impl ConflictResolver for AcceptRemote {
    fn resolve(&self, _conflict: &Conflict<'_>) -> ConflictResolution {
        ConflictResolution::AcceptRemote
    }
}

/// Always keeps the local body.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptLocal;

impl ConflictResolver for AcceptLocal {
    fn resolve(&self, _conflict: &Conflict<'_>) -> ConflictResolution {
        ConflictResolution::AcceptLocal
    }
}

impl<F> ConflictResolver for F
where
    F: Fn(&Conflict<'_>) -> ConflictResolution + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict<'_>) -> ConflictResolution {
        self(conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_closure_resolver() {
        let prefer_local_deletes = |c: &Conflict<'_>| match c.local {
            None => ConflictResolution::AcceptLocal,
            Some(_) => ConflictResolution::AcceptRemote,
        };
        let remote = json!({"resourceType": "Patient", "id": "p1"});
        let conflict = Conflict {
            resource_type: "Patient",
            resource_id: "p1",
            local: None,
            remote: &remote,
            pending: &[],
        };
        assert_eq!(
            prefer_local_deletes.resolve(&conflict),
            ConflictResolution::AcceptLocal
        );
        assert_eq!(AcceptRemote.resolve(&conflict), ConflictResolution::AcceptRemote);
        assert_eq!(ConflictResolution::AcceptLocal.to_string(), "accept-local");
    }
}
