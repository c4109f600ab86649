//! Collection declarations and the Record trait.
//!
//! Indexed fields are declared statically per collection; the SQLite index
//! only answers queries over these.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{EventRecord, Loop, MergeRecord, SignalRecord, ToolJobRecord};

/// The five persistent collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Loops,
    Signals,
    ToolJobs,
    Events,
    Merges,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Loops,
        Collection::Signals,
        Collection::ToolJobs,
        Collection::Events,
        Collection::Merges,
    ];

    /// Log file stem (`<name>.log`).
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Loops => "loops",
            Collection::Signals => "signals",
            Collection::ToolJobs => "tool_jobs",
            Collection::Events => "events",
            Collection::Merges => "merges",
        }
    }

    /// Fields the secondary index covers for this collection.
    pub fn indexed_fields(&self) -> &'static [&'static str] {
        match self {
            Collection::Loops => &["kind", "status", "parent_id", "updated_at"],
            Collection::Signals => &["kind", "target_loop", "target_selector", "acknowledged_at", "created_at"],
            Collection::ToolJobs => &["loop_id", "tool_name", "status", "lane"],
            Collection::Events => &["event_type", "loop_id", "created_at"],
            Collection::Merges => &["loop_id", "created_at"],
        }
    }
}

/// A persistable record bound to its collection.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn record_id(&self) -> &str;
}

impl Record for Loop {
    const COLLECTION: Collection = Collection::Loops;

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for SignalRecord {
    const COLLECTION: Collection = Collection::Signals;

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for ToolJobRecord {
    const COLLECTION: Collection = Collection::ToolJobs;

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for EventRecord {
    const COLLECTION: Collection = Collection::Events;

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for MergeRecord {
    const COLLECTION: Collection = Collection::Merges;

    fn record_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_names() {
        assert_eq!(Collection::Loops.name(), "loops");
        assert_eq!(Collection::ToolJobs.name(), "tool_jobs");
        assert_eq!(Collection::Merges.name(), "merges");
    }

    #[test]
    fn test_required_indexed_fields() {
        assert!(Collection::Loops.indexed_fields().contains(&"status"));
        assert!(Collection::Loops.indexed_fields().contains(&"parent_id"));
        assert!(Collection::Signals.indexed_fields().contains(&"target_loop"));
        assert!(Collection::Signals.indexed_fields().contains(&"acknowledged_at"));
        assert!(Collection::ToolJobs.indexed_fields().contains(&"lane"));
        assert!(Collection::Events.indexed_fields().contains(&"event_type"));
    }

    #[test]
    fn test_record_binding() {
        assert_eq!(Loop::COLLECTION, Collection::Loops);
        assert_eq!(SignalRecord::COLLECTION, Collection::Signals);
        assert_eq!(ToolJobRecord::COLLECTION, Collection::ToolJobs);
        assert_eq!(EventRecord::COLLECTION, Collection::Events);
        assert_eq!(MergeRecord::COLLECTION, Collection::Merges);
    }
}
