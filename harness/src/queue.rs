//! Persistent work queue for discovered work items
//!
//! Capacity-bounded, keyed by unique id, priority-ordered. Persisted as a
//! single versioned JSON file; the worker loads it on start and rewrites
//! it whole after every mutation.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{HarnessError, HarnessResult};
use crate::session::atomic_write;

/// Queue file schema version.
const QUEUE_FILE_VERSION: u32 = 1;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Severity of a discovered work item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Rank for ordering: critical sorts first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

/// Workflow a source suggests for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuggestedWorkflow {
    BugFix,
    NewFeature,
    Refactor,
    /// Needs a human regardless of policy overrides.
    ManualReview,
}

impl std::fmt::Display for SuggestedWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BugFix => "bug-fix",
            Self::NewFeature => "new-feature",
            Self::Refactor => "refactor",
            Self::ManualReview => "manual-review",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a queued item. Terminal states are never reprocessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkItemStatus {
    Pending,
    InProgress,
    Completed,
    Escalated,
    Deferred,
}

impl WorkItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Escalated | Self::Deferred)
    }
}

/// A candidate unit of work produced by a source provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredWork {
    pub id: String,
    pub discovered_at: DateTime<Utc>,
    pub source: String,
    pub priority: Priority,
    /// Autonomy tier, 1 (fully automatic) through 4 (human-only).
    pub tier: u8,
    pub suggested_workflow: SuggestedWorkflow,
    pub summary: String,
    pub description: String,
    #[serde(default)]
    pub resource_refs: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: WorkItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost_usd: Option<f64>,
    /// Session id of the run this item produced, once executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl DiscoveredWork {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        priority: Priority,
        tier: u8,
        suggested_workflow: SuggestedWorkflow,
        summary: impl Into<String>,
    ) -> Self {
        let summary = summary.into();
        Self {
            id: id.into(),
            discovered_at: Utc::now(),
            source: source.into(),
            priority,
            tier: tier.clamp(1, 4),
            suggested_workflow,
            description: summary.clone(),
            summary,
            resource_refs: Vec::new(),
            tags: Vec::new(),
            status: WorkItemStatus::Pending,
            estimated_cost_usd: None,
            session_id: None,
            outcome: None,
            cost_usd: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_estimated_cost(mut self, usd: f64) -> Self {
        self.estimated_cost_usd = Some(usd);
        self
    }

    /// Pick order: priority rank, then tier (lower is more autonomous),
    /// then discovery time.
    fn pick_key(&self) -> (u8, u8, DateTime<Utc>) {
        (self.priority.rank(), self.tier, self.discovered_at)
    }

    /// Eviction order: lowest priority first, then highest tier, then
    /// oldest. The item that maximizes this key is the worst in the queue.
    fn eviction_key(&self) -> (u8, u8, std::cmp::Reverse<DateTime<Utc>>) {
        (
            self.priority.rank(),
            self.tier,
            std::cmp::Reverse(self.discovered_at),
        )
    }
}

/// On-disk queue file shape.
#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    updated_at: DateTime<Utc>,
    items: Vec<DiscoveredWork>,
}

/// Capacity-bounded priority queue of discovered work.
#[derive(Debug)]
pub struct WorkQueue {
    capacity: usize,
    items: Vec<DiscoveredWork>,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Vec::new(),
        }
    }

    /// Load from the queue file, or start empty when it does not exist.
    pub fn load(path: &Path, capacity: usize) -> HarnessResult<Self> {
        if !path.exists() {
            return Ok(Self::new(capacity));
        }
        let json = std::fs::read_to_string(path)?;
        let file: QueueFile = serde_json::from_str(&json)?;
        debug!(items = file.items.len(), version = file.version, "queue loaded");
        Ok(Self {
            capacity,
            items: file.items,
        })
    }

    /// Persist the queue (whole-file replace).
    pub fn save(&self, path: &Path) -> HarnessResult<()> {
        let file = QueueFile {
            version: QUEUE_FILE_VERSION,
            updated_at: Utc::now(),
            items: self.items.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        atomic_write(path, json.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[DiscoveredWork] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&DiscoveredWork> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Add an item. Duplicate ids are rejected, never merged. When the
    /// queue is full, the worst *pending* item is evicted to make room;
    /// the incoming item always lands.
    pub fn enqueue(&mut self, item: DiscoveredWork) -> HarnessResult<Option<DiscoveredWork>> {
        if self.items.iter().any(|i| i.id == item.id) {
            return Err(HarnessError::DuplicateWorkItem { id: item.id });
        }

        let evicted = if self.items.len() >= self.capacity {
            let victim = self
                .items
                .iter()
                .enumerate()
                .filter(|(_, i)| i.status == WorkItemStatus::Pending)
                .max_by_key(|(_, i)| i.eviction_key())
                .map(|(idx, _)| idx);
            match victim {
                Some(idx) => {
                    let evicted = self.items.remove(idx);
                    info!(id = %evicted.id, priority = %evicted.priority, "evicted work item");
                    Some(evicted)
                }
                None => {
                    return Err(HarnessError::QueueFull {
                        capacity: self.capacity,
                    })
                }
            }
        } else {
            None
        };

        self.items.push(item);
        Ok(evicted)
    }

    /// Take the next pending item by pick order, marking it in-progress.
    pub fn pop_next(&mut self) -> Option<DiscoveredWork> {
        let idx = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, i)| i.status == WorkItemStatus::Pending)
            .min_by_key(|(_, i)| i.pick_key())
            .map(|(idx, _)| idx)?;
        self.items[idx].status = WorkItemStatus::InProgress;
        Some(self.items[idx].clone())
    }

    /// Record the outcome of a processed item.
    pub fn record_outcome(
        &mut self,
        id: &str,
        status: WorkItemStatus,
        outcome: impl Into<String>,
        session_id: Option<String>,
        cost_usd: Option<f64>,
    ) {
        if let Some(item) = self.items.iter_mut().find(|i| i.id == id) {
            item.status = status;
            item.outcome = Some(outcome.into());
            item.session_id = session_id;
            item.cost_usd = cost_usd;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, priority: Priority, tier: u8) -> DiscoveredWork {
        DiscoveredWork::new(
            id,
            "test-source",
            priority,
            tier,
            SuggestedWorkflow::BugFix,
            format!("item {id}"),
        )
    }

    #[test]
    fn test_pick_order_priority_then_tier_then_age() {
        let mut queue = WorkQueue::new(10);
        let mut low = item("low", Priority::Low, 1);
        low.discovered_at = Utc::now() - chrono::Duration::hours(3);
        let mut crit_t2 = item("crit-t2", Priority::Critical, 2);
        crit_t2.discovered_at = Utc::now() - chrono::Duration::hours(2);
        let mut crit_t1_old = item("crit-t1-old", Priority::Critical, 1);
        crit_t1_old.discovered_at = Utc::now() - chrono::Duration::hours(2);
        let crit_t1_new = item("crit-t1-new", Priority::Critical, 1);

        queue.enqueue(low).unwrap();
        queue.enqueue(crit_t2).unwrap();
        queue.enqueue(crit_t1_old).unwrap();
        queue.enqueue(crit_t1_new).unwrap();

        assert_eq!(queue.pop_next().unwrap().id, "crit-t1-old");
        assert_eq!(queue.pop_next().unwrap().id, "crit-t1-new");
        assert_eq!(queue.pop_next().unwrap().id, "crit-t2");
        assert_eq!(queue.pop_next().unwrap().id, "low");
        assert!(queue.pop_next().is_none());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut queue = WorkQueue::new(10);
        queue.enqueue(item("same", Priority::High, 2)).unwrap();
        let err = queue.enqueue(item("same", Priority::Low, 4)).unwrap_err();
        assert!(matches!(err, HarnessError::DuplicateWorkItem { .. }));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_eviction_removes_worst_existing_item() {
        // Capacity 2, both slots filled by higher-priority items; adding a
        // lower-priority third evicts the worst existing one and still
        // enqueues the newcomer.
        let mut queue = WorkQueue::new(2);
        let mut high_t1 = item("high-t1", Priority::High, 1);
        high_t1.discovered_at = Utc::now() - chrono::Duration::hours(1);
        let high_t3 = item("high-t3", Priority::High, 3);
        queue.enqueue(high_t1).unwrap();
        queue.enqueue(high_t3).unwrap();

        let evicted = queue.enqueue(item("medium", Priority::Medium, 2)).unwrap();
        // Equal priority: the higher tier loses
        assert_eq!(evicted.unwrap().id, "high-t3");
        assert_eq!(queue.len(), 2);
        assert!(queue.get("medium").is_some());
    }

    #[test]
    fn test_eviction_prefers_lowest_priority_then_oldest() {
        let mut queue = WorkQueue::new(3);
        let mut low_old = item("low-old", Priority::Low, 2);
        low_old.discovered_at = Utc::now() - chrono::Duration::hours(5);
        let low_new = item("low-new", Priority::Low, 2);
        let crit = item("crit", Priority::Critical, 1);
        queue.enqueue(low_old).unwrap();
        queue.enqueue(low_new).unwrap();
        queue.enqueue(crit).unwrap();

        let evicted = queue.enqueue(item("high", Priority::High, 1)).unwrap();
        assert_eq!(evicted.unwrap().id, "low-old");
    }

    #[test]
    fn test_eviction_skips_in_progress_items() {
        let mut queue = WorkQueue::new(1);
        queue.enqueue(item("busy", Priority::Low, 4)).unwrap();
        let popped = queue.pop_next().unwrap();
        assert_eq!(popped.id, "busy");

        let err = queue.enqueue(item("next", Priority::Critical, 1)).unwrap_err();
        assert!(matches!(err, HarnessError::QueueFull { .. }));
    }

    #[test]
    fn test_record_outcome() {
        let mut queue = WorkQueue::new(10);
        queue.enqueue(item("a", Priority::High, 1)).unwrap();
        queue.pop_next().unwrap();
        queue.record_outcome(
            "a",
            WorkItemStatus::Completed,
            "run finished",
            Some("sess-1".into()),
            Some(0.42),
        );

        let stored = queue.get("a").unwrap();
        assert_eq!(stored.status, WorkItemStatus::Completed);
        assert!(stored.status.is_terminal());
        assert_eq!(stored.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let mut queue = WorkQueue::new(10);
        queue.enqueue(item("a", Priority::Critical, 1)).unwrap();
        queue.enqueue(item("b", Priority::Low, 3)).unwrap();
        queue.save(&path).unwrap();

        let mut loaded = WorkQueue::load(&path, 10).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.pop_next().unwrap().id, "a");
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let queue = WorkQueue::load(&dir.path().join("queue.json"), 5).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_tier_clamped() {
        let i = item("x", Priority::Low, 9);
        assert_eq!(i.tier, 4);
    }
}
