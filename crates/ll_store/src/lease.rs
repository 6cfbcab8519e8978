//! Exclusive per-database lease held for the duration of a migration.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Clone, Default)]
pub struct LeaseTable {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, database_id: &str) -> Option<Lease> {
        let mut held = self.held.lock();
        if !held.insert(database_id.to_string()) {
            return None;
        }
        Some(Lease {
            table: self.held.clone(),
            database_id: database_id.to_string(),
        })
    }

    pub fn is_held(&self, database_id: &str) -> bool {
        self.held.lock().contains(database_id)
    }
}

/// Released on drop.
pub struct Lease {
    table: Arc<Mutex<HashSet<String>>>,
    database_id: String,
}

impl Lease {
    pub fn database_id(&self) -> &str {
        &self.database_id
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.table.lock().remove(&self.database_id);
    }
}
