//! Work source providers: pollable adapters producing candidate work
//!
//! Each provider turns an external signal (dropped files, an event feed)
//! into `DiscoveredWork` items. Providers are polled on the worker's
//! timer; they must be cheap and never block for long.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use harness::queue::{DiscoveredWork, Priority, SuggestedWorkflow};

/// A pollable producer of candidate work items.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Source name, recorded on every item it produces.
    fn name(&self) -> &str;

    /// Pull new items since the last poll. Consumed signals must not be
    /// returned twice.
    async fn poll(&mut self) -> anyhow::Result<Vec<DiscoveredWork>>;
}

/// Wire shape of a signal file / feed entry.
#[derive(Debug, Deserialize)]
struct RawSignal {
    id: String,
    #[serde(default = "default_priority")]
    priority: Priority,
    #[serde(default = "default_tier")]
    tier: u8,
    #[serde(default = "default_workflow")]
    suggested_workflow: SuggestedWorkflow,
    summary: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    resource_refs: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    estimated_cost_usd: Option<f64>,
}

fn default_priority() -> Priority {
    Priority::Medium
}

fn default_tier() -> u8 {
    3
}

fn default_workflow() -> SuggestedWorkflow {
    SuggestedWorkflow::ManualReview
}

impl RawSignal {
    fn into_work(self, source: &str) -> DiscoveredWork {
        let mut item = DiscoveredWork::new(
            self.id,
            source,
            self.priority,
            self.tier,
            self.suggested_workflow,
            self.summary,
        );
        if let Some(description) = self.description {
            item = item.with_description(description);
        }
        if let Some(cost) = self.estimated_cost_usd {
            item = item.with_estimated_cost(cost);
        }
        item.resource_refs = self.resource_refs;
        item.tags = self.tags;
        item
    }
}

// ---------------------------------------------------------------------------
// SignalDirSource
// ---------------------------------------------------------------------------

/// Reads JSON signal files dropped into a directory, consuming each file
/// exactly once (processed files move to a `consumed/` subdirectory).
pub struct SignalDirSource {
    name: String,
    dir: PathBuf,
}

impl SignalDirSource {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            name: "signal-dir".to_string(),
            dir,
        }
    }
}

#[async_trait]
impl WorkSource for SignalDirSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&mut self) -> anyhow::Result<Vec<DiscoveredWork>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let consumed_dir = self.dir.join("consumed");
        std::fs::create_dir_all(&consumed_dir)?;

        let mut items = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|text| Ok(serde_json::from_str::<RawSignal>(&text)?))
            {
                Ok(signal) => {
                    debug!(id = %signal.id, file = %path.display(), "signal discovered");
                    items.push(signal.into_work(&self.name));
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "unreadable signal file, consuming anyway");
                }
            }

            // Move aside whether parseable or not, so a bad file cannot
            // wedge the poll loop forever.
            let dest = consumed_dir.join(entry.file_name());
            if let Err(e) = std::fs::rename(&path, &dest) {
                warn!(file = %path.display(), error = %e, "failed to archive signal file");
            }
        }
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// HttpEventSource
// ---------------------------------------------------------------------------

/// Polls an HTTP endpoint returning a JSON array of signals.
///
/// Already-seen ids are filtered locally; the queue's duplicate rejection
/// is the backstop.
pub struct HttpEventSource {
    name: String,
    url: String,
    client: reqwest::Client,
    seen: std::collections::HashSet<String>,
}

impl HttpEventSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: "http-events".to_string(),
            url: url.into(),
            client: reqwest::Client::new(),
            seen: std::collections::HashSet::new(),
        }
    }
}

#[async_trait]
impl WorkSource for HttpEventSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&mut self) -> anyhow::Result<Vec<DiscoveredWork>> {
        let signals: Vec<RawSignal> = self
            .client
            .get(&self.url)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut items = Vec::new();
        for signal in signals {
            if self.seen.insert(signal.id.clone()) {
                items.push(signal.into_work(&self.name));
            }
        }
        debug!(count = items.len(), url = %self.url, "http events polled");
        Ok(items)
    }
}
