//! Replica-set membership records.
//!
//! Each user is assigned one primary and an ordered list of secondary nodes by
//! an upstream registry. Assignments arrive as events carrying the blocknumber
//! of the chain transaction that established them; only the highest observed
//! blocknumber is authoritative, stale records are ignored.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::store::UserId;

/// The set of nodes assigned to host a user's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSet {
    /// The user this assignment is for.
    pub user_id: UserId,
    /// The user's wallet.
    pub wallet: String,
    /// Endpoint of the primary node.
    pub primary: Url,
    /// Endpoints of the secondary nodes, in assignment order.
    pub secondaries: Vec<Url>,
    /// The chain event that established this assignment.
    pub blocknumber: u64,
}

impl ReplicaSet {
    /// Whether the given endpoint is the primary of this set.
    pub fn is_primary(&self, endpoint: &Url) -> bool {
        self.primary == *endpoint
    }

    /// Whether the given endpoint is one of the secondaries of this set.
    pub fn is_secondary(&self, endpoint: &Url) -> bool {
        self.secondaries.contains(endpoint)
    }

    /// Whether the given endpoint is a member of this set at all.
    pub fn is_member(&self, endpoint: &Url) -> bool {
        self.is_primary(endpoint) || self.is_secondary(endpoint)
    }

    /// Whether `update` supersedes this record.
    ///
    /// Equal blocknumbers do not supersede, so replaying the same event is a
    /// no-op.
    pub fn superseded_by(&self, update: &ReplicaSet) -> bool {
        update.blocknumber > self.blocknumber
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica_set(blocknumber: u64) -> ReplicaSet {
        ReplicaSet {
            user_id: UserId(1),
            wallet: "0xabc".to_string(),
            primary: "http://primary.example".parse().unwrap(),
            secondaries: vec![
                "http://s1.example".parse().unwrap(),
                "http://s2.example".parse().unwrap(),
            ],
            blocknumber,
        }
    }

    #[test]
    fn membership() {
        let rs = replica_set(10);
        let primary: Url = "http://primary.example".parse().unwrap();
        let secondary: Url = "http://s2.example".parse().unwrap();
        let stranger: Url = "http://other.example".parse().unwrap();
        assert!(rs.is_primary(&primary));
        assert!(!rs.is_secondary(&primary));
        assert!(rs.is_secondary(&secondary));
        assert!(rs.is_member(&secondary));
        assert!(!rs.is_member(&stranger));
    }

    #[test]
    fn highest_blocknumber_wins() {
        let current = replica_set(10);
        assert!(current.superseded_by(&replica_set(11)));
        assert!(!current.superseded_by(&replica_set(10)));
        assert!(!current.superseded_by(&replica_set(9)));
    }
}
