use std::collections::HashSet;

use parking_lot::RwLock;

/// Groups a single connection has joined. Lives and dies with the connection.
#[derive(Debug, Default)]
pub struct Membership {
    groups: RwLock<HashSet<String>>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the group was not already joined.
    pub fn join(&self, group_id: &str) -> bool {
        self.groups.write().insert(group_id.to_string())
    }

    /// Returns `true` when the group was present.
    pub fn leave(&self, group_id: &str) -> bool {
        self.groups.write().remove(group_id)
    }

    pub fn has(&self, group_id: &str) -> bool {
        self.groups.read().contains(group_id)
    }

    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }

    /// Sorted snapshot of the joined groups.
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.groups.read().iter().cloned().collect();
        groups.sort();
        groups
    }
}
