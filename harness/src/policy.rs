//! Approval policy: route discovered work to auto-execute, confirm, or escalate
//!
//! Pure decision logic, computed on demand and never stored. Precedence:
//! manual-review suggestions always escalate; then per-source override,
//! then per-priority override, then the per-tier default. An auto-execute
//! decision whose estimated cost exceeds the ceiling is downgraded to
//! confirm.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::queue::{DiscoveredWork, Priority, SuggestedWorkflow};

/// What to do with a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    AutoExecute,
    Confirm,
    Escalate,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AutoExecute => "auto-execute",
            Self::Confirm => "confirm",
            Self::Escalate => "escalate",
        };
        f.write_str(s)
    }
}

/// The routing verdict for one item, with the reasoning that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub decision: Decision,
    pub reason: String,
    pub tier: u8,
    pub source: String,
}

/// Configurable routing rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    /// Per-source overrides, highest precedence.
    #[serde(default)]
    pub source_overrides: BTreeMap<String, Decision>,
    /// Per-priority overrides, consulted after sources.
    #[serde(default)]
    pub priority_overrides: BTreeMap<Priority, Decision>,
    /// Per-tier defaults, consulted last. Keyed 1 through 4.
    pub tier_defaults: BTreeMap<u8, Decision>,
    /// Estimated-cost ceiling above which auto-execute becomes confirm.
    pub auto_cost_ceiling_usd: f64,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        let mut tier_defaults = BTreeMap::new();
        tier_defaults.insert(1, Decision::AutoExecute);
        tier_defaults.insert(2, Decision::Confirm);
        tier_defaults.insert(3, Decision::Confirm);
        tier_defaults.insert(4, Decision::Escalate);
        Self {
            source_overrides: BTreeMap::new(),
            priority_overrides: BTreeMap::new(),
            tier_defaults,
            auto_cost_ceiling_usd: 5.0,
        }
    }
}

impl ApprovalPolicy {
    /// Route one item.
    pub fn evaluate(&self, item: &DiscoveredWork) -> ApprovalDecision {
        let verdict = |decision, reason: String| ApprovalDecision {
            decision,
            reason,
            tier: item.tier,
            source: item.source.clone(),
        };

        if item.suggested_workflow == SuggestedWorkflow::ManualReview {
            return verdict(
                Decision::Escalate,
                "item suggests manual review".to_string(),
            );
        }

        let (mut decision, mut reason) = if let Some(d) = self.source_overrides.get(&item.source) {
            (*d, format!("source override for `{}`", item.source))
        } else if let Some(d) = self.priority_overrides.get(&item.priority) {
            (*d, format!("priority override for {}", item.priority))
        } else {
            let d = self
                .tier_defaults
                .get(&item.tier)
                .copied()
                .unwrap_or(Decision::Escalate);
            (d, format!("tier {} default", item.tier))
        };

        if decision == Decision::AutoExecute {
            if let Some(cost) = item.estimated_cost_usd {
                if cost > self.auto_cost_ceiling_usd {
                    decision = Decision::Confirm;
                    reason = format!(
                        "estimated cost ${cost:.2} exceeds auto ceiling ${:.2}",
                        self.auto_cost_ceiling_usd
                    );
                }
            }
        }

        verdict(decision, reason)
    }
}
