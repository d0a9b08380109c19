//! Workflow registry: static, named phase sequences
//!
//! Each workflow type declares a fixed ordered list of phases with
//! approval and validation metadata. Phase-to-phase data flow goes through
//! the statically enumerated `PhaseInput` type rather than loosely-typed
//! transformation closures, so every (workflow, phase) pairing is spelled
//! out and checked at compile time.

use harness::types::{AgentOutput, AgentResult, AgentType, WorkflowState};
use serde::{Deserialize, Serialize};

/// The workflows the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowType {
    NewFeature,
    BugFix,
    Refactor,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewFeature => "new-feature",
            Self::BugFix => "bug-fix",
            Self::Refactor => "refactor",
        }
    }
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new-feature" => Ok(Self::NewFeature),
            "bug-fix" => Ok(Self::BugFix),
            "refactor" => Ok(Self::Refactor),
            other => Err(format!("unknown workflow type: {other}")),
        }
    }
}

/// One phase of a workflow definition.
pub struct PhaseSpec {
    pub agent: AgentType,
    pub name: &'static str,
    /// Suspend for human approval after this phase succeeds.
    pub approval_required: bool,
    /// Phase-specific result check. Runs after the agent reports success.
    pub validate: fn(&AgentResult) -> bool,
}

/// A named, ordered, statically declared sequence of phases.
pub struct WorkflowDefinition {
    pub workflow_type: WorkflowType,
    pub phases: &'static [PhaseSpec],
}

impl WorkflowDefinition {
    pub fn phase(&self, index: usize) -> Option<&PhaseSpec> {
        self.phases.get(index)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

static NEW_FEATURE: WorkflowDefinition = WorkflowDefinition {
    workflow_type: WorkflowType::NewFeature,
    phases: &[
        PhaseSpec {
            agent: AgentType::DesignReview,
            name: "design-review",
            approval_required: false,
            validate: validators::produced_output,
        },
        PhaseSpec {
            agent: AgentType::Specify,
            name: "specify",
            approval_required: true,
            validate: validators::produced_output,
        },
        PhaseSpec {
            agent: AgentType::GenerateTests,
            name: "generate-tests",
            approval_required: false,
            validate: validators::changed_files,
        },
        PhaseSpec {
            agent: AgentType::Implement,
            name: "implement",
            approval_required: false,
            validate: validators::changed_files,
        },
        PhaseSpec {
            agent: AgentType::Review,
            name: "review",
            approval_required: false,
            validate: validators::produced_output,
        },
        PhaseSpec {
            agent: AgentType::Verify,
            name: "verify",
            approval_required: false,
            validate: validators::verification_passed,
        },
    ],
};

static BUG_FIX: WorkflowDefinition = WorkflowDefinition {
    workflow_type: WorkflowType::BugFix,
    phases: &[
        // Baseline verification reproduces the defect before any change.
        // Note: verify appears twice in this workflow; the final run's
        // result overwrites the baseline under the shared agent-type key.
        PhaseSpec {
            agent: AgentType::Verify,
            name: "verify-baseline",
            approval_required: false,
            validate: validators::produced_output,
        },
        PhaseSpec {
            agent: AgentType::Implement,
            name: "implement",
            approval_required: false,
            validate: validators::changed_files,
        },
        PhaseSpec {
            agent: AgentType::Review,
            name: "review",
            approval_required: false,
            validate: validators::produced_output,
        },
        PhaseSpec {
            agent: AgentType::Verify,
            name: "verify",
            approval_required: false,
            validate: validators::verification_passed,
        },
    ],
};

static REFACTOR: WorkflowDefinition = WorkflowDefinition {
    workflow_type: WorkflowType::Refactor,
    phases: &[
        PhaseSpec {
            agent: AgentType::DesignReview,
            name: "design-review",
            approval_required: true,
            validate: validators::produced_output,
        },
        PhaseSpec {
            agent: AgentType::Implement,
            name: "implement",
            approval_required: false,
            validate: validators::changed_files,
        },
        PhaseSpec {
            agent: AgentType::Review,
            name: "review",
            approval_required: false,
            validate: validators::produced_output,
        },
        PhaseSpec {
            agent: AgentType::Verify,
            name: "verify",
            approval_required: false,
            validate: validators::verification_passed,
        },
    ],
};

/// Look up the static definition for a workflow type.
pub fn definition(workflow_type: WorkflowType) -> &'static WorkflowDefinition {
    match workflow_type {
        WorkflowType::NewFeature => &NEW_FEATURE,
        WorkflowType::BugFix => &BUG_FIX,
        WorkflowType::Refactor => &REFACTOR,
    }
}

/// Result validators. All of them must tolerate the raw-text fallback:
/// a result whose expected fields could not be parsed fails validation
/// instead of crashing anything downstream.
pub mod validators {
    use super::*;

    /// Any non-empty output counts, parsed or raw.
    pub fn produced_output(result: &AgentResult) -> bool {
        result.success && !result.output.as_text().trim().is_empty()
    }

    /// The phase must have touched the tree: files or commits.
    pub fn changed_files(result: &AgentResult) -> bool {
        result.success
            && (!result.files_created.is_empty()
                || !result.files_modified.is_empty()
                || !result.commits.is_empty())
    }

    /// Verification must report a parsed, affirmative pass signal.
    /// A raw fallback has no trustworthy pass field and fails here.
    pub fn verification_passed(result: &AgentResult) -> bool {
        if !result.success {
            return false;
        }
        match &result.output {
            AgentOutput::Parsed(_) => {
                result.output.bool_field("passed").unwrap_or(false)
                    || result
                        .output
                        .field("status")
                        .map(|s| s.eq_ignore_ascii_case("pass"))
                        .unwrap_or(false)
            }
            AgentOutput::Raw(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Phase input mapping
// ---------------------------------------------------------------------------

/// Typed input for each phase, statically enumerated per agent.
#[derive(Debug, Clone)]
pub enum PhaseInput {
    DesignReview {
        description: String,
    },
    Specify {
        description: String,
        design_notes: Option<String>,
    },
    GenerateTests {
        specification: String,
    },
    Implement {
        description: String,
        specification: Option<String>,
        test_plan: Option<String>,
        baseline: Option<String>,
        feedback: Option<String>,
    },
    Review {
        description: String,
        files_changed: Vec<String>,
    },
    Verify {
        description: String,
        baseline: bool,
    },
}

impl PhaseInput {
    /// Render the user prompt handed to the agent.
    pub fn render(&self) -> String {
        match self {
            Self::DesignReview { description } => format!(
                "Review the design implications of the following request and list \
                 the affected components, risks, and a suggested approach.\n\n\
                 Request: {description}"
            ),
            Self::Specify {
                description,
                design_notes,
            } => {
                let mut prompt = format!(
                    "Write a precise implementation specification for the following \
                     request.\n\nRequest: {description}\n"
                );
                if let Some(notes) = design_notes {
                    prompt.push_str(&format!("\nDesign notes from review:\n{notes}\n"));
                }
                prompt
            }
            Self::GenerateTests { specification } => format!(
                "Write failing tests that pin down the behavior described in this \
                 specification. Do not implement the behavior itself.\n\n\
                 Specification:\n{specification}"
            ),
            Self::Implement {
                description,
                specification,
                test_plan,
                baseline,
                feedback,
            } => {
                let mut prompt = format!("Implement the following request.\n\nRequest: {description}\n");
                if let Some(spec) = specification {
                    prompt.push_str(&format!("\nSpecification:\n{spec}\n"));
                }
                if let Some(tests) = test_plan {
                    prompt.push_str(&format!("\nTests to satisfy:\n{tests}\n"));
                }
                if let Some(baseline) = baseline {
                    prompt.push_str(&format!("\nBaseline verification findings:\n{baseline}\n"));
                }
                if let Some(feedback) = feedback {
                    prompt.push_str(&format!("\nReviewer feedback to address:\n{feedback}\n"));
                }
                prompt
            }
            Self::Review {
                description,
                files_changed,
            } => {
                let mut prompt = format!(
                    "Review the changes made for this request for correctness, \
                     style, and missed edge cases.\n\nRequest: {description}\n"
                );
                if !files_changed.is_empty() {
                    prompt.push_str("\nChanged files:\n");
                    for f in files_changed {
                        prompt.push_str(&format!("- {f}\n"));
                    }
                }
                prompt
            }
            Self::Verify { description, baseline } => {
                if *baseline {
                    format!(
                        "Reproduce and characterize the reported defect before any \
                         fix is attempted. Run the relevant build and tests and \
                         report what fails and how.\n\nReport: {description}"
                    )
                } else {
                    format!(
                        "Verify the completed work: run the build and test suite and \
                         report a JSON object with a boolean `passed` field and a \
                         `summary` string.\n\nRequest: {description}"
                    )
                }
            }
        }
    }
}

/// Build the input for `phases[phase_index]` from prior phase results.
///
/// Exhaustive over every (workflow, agent) pairing the registry declares.
/// Approval feedback, when present, rides along into the phase prompt.
pub fn build_phase_input(
    def: &WorkflowDefinition,
    state: &WorkflowState,
    phase_index: usize,
    feedback: Option<&str>,
) -> PhaseInput {
    let phase = &def.phases[phase_index];
    let description = state.description.clone();
    let text_of = |agent: AgentType| -> Option<String> {
        state
            .phase_results
            .get(&agent)
            .map(|r| r.output.as_text())
    };
    let changed_by = |agent: AgentType| -> Vec<String> {
        state
            .phase_results
            .get(&agent)
            .map(|r| {
                r.files_created
                    .iter()
                    .chain(r.files_modified.iter())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    };

    match (def.workflow_type, phase.agent) {
        (_, AgentType::DesignReview) => PhaseInput::DesignReview { description },
        (_, AgentType::Specify) => PhaseInput::Specify {
            description,
            design_notes: text_of(AgentType::DesignReview),
        },
        (_, AgentType::GenerateTests) => PhaseInput::GenerateTests {
            specification: text_of(AgentType::Specify).unwrap_or_else(|| description.clone()),
        },
        (WorkflowType::BugFix, AgentType::Implement) => PhaseInput::Implement {
            description,
            specification: None,
            test_plan: None,
            baseline: text_of(AgentType::Verify),
            feedback: feedback.map(|s| s.to_string()),
        },
        (_, AgentType::Implement) => PhaseInput::Implement {
            description,
            specification: text_of(AgentType::Specify),
            test_plan: text_of(AgentType::GenerateTests),
            baseline: None,
            feedback: feedback.map(|s| s.to_string()),
        },
        (_, AgentType::Review) => PhaseInput::Review {
            description,
            files_changed: changed_by(AgentType::Implement),
        },
        (_, AgentType::Verify) => PhaseInput::Verify {
            description,
            // The first verify phase of bug-fix is the baseline run
            baseline: def.workflow_type == WorkflowType::BugFix && phase_index == 0,
        },
    }
}

/// Per-agent system instructions for the tool loop.
pub fn system_prompt(agent: AgentType) -> String {
    let role = match agent {
        AgentType::DesignReview => {
            "You are a design reviewer. Read the relevant code before judging. \
             Do not modify any files."
        }
        AgentType::Specify => {
            "You are a specification writer. Produce a precise, testable \
             specification. Do not modify any files."
        }
        AgentType::GenerateTests => {
            "You are a test author. Add failing tests that capture the required \
             behavior, using the project's existing test conventions."
        }
        AgentType::Implement => {
            "You are an implementer. Make the smallest correct change that \
             satisfies the task. Keep the project's style."
        }
        AgentType::Review => {
            "You are a code reviewer. Inspect the changes and report concrete \
             findings. Do not modify any files."
        }
        AgentType::Verify => {
            "You are a verifier. Run builds and tests, observe actual results, \
             and report honestly."
        }
    };
    format!(
        "{role}\n\nWork inside the workspace using the provided tools. \
         When you are finished, reply with a short report that starts with a \
         ```json block containing your structured result."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness::types::WorkflowStatus;

    fn ok_result(agent: AgentType, text: &str) -> AgentResult {
        AgentResult {
            agent,
            success: true,
            output: AgentOutput::Raw(text.into()),
            files_created: vec![],
            files_modified: vec![],
            commits: vec![],
            cost_usd: 0.1,
            turns_used: 1,
            error: None,
        }
    }

    #[test]
    fn test_definitions_have_declared_order() {
        let def = definition(WorkflowType::NewFeature);
        let agents: Vec<AgentType> = def.phases.iter().map(|p| p.agent).collect();
        assert_eq!(
            agents,
            vec![
                AgentType::DesignReview,
                AgentType::Specify,
                AgentType::GenerateTests,
                AgentType::Implement,
                AgentType::Review,
                AgentType::Verify,
            ]
        );
        // Exactly one approval gate in new-feature
        assert_eq!(
            def.phases.iter().filter(|p| p.approval_required).count(),
            1
        );
    }

    #[test]
    fn test_bug_fix_runs_verify_twice() {
        let def = definition(WorkflowType::BugFix);
        let verify_count = def
            .phases
            .iter()
            .filter(|p| p.agent == AgentType::Verify)
            .count();
        assert_eq!(verify_count, 2);
        assert_eq!(def.phases[0].name, "verify-baseline");
        assert_eq!(def.phases.last().unwrap().name, "verify");
    }

    #[test]
    fn test_validator_produced_output() {
        let ok = ok_result(AgentType::Specify, "a spec");
        assert!(validators::produced_output(&ok));

        let empty = ok_result(AgentType::Specify, "   ");
        assert!(!validators::produced_output(&empty));

        let mut failed = ok_result(AgentType::Specify, "text");
        failed.success = false;
        assert!(!validators::produced_output(&failed));
    }

    #[test]
    fn test_validator_changed_files() {
        let mut result = ok_result(AgentType::Implement, "done");
        assert!(!validators::changed_files(&result));
        result.files_modified.push("src/lib.rs".into());
        assert!(validators::changed_files(&result));
    }

    #[test]
    fn test_validator_verification_handles_raw_fallback() {
        // Raw fallback: the pass field cannot be trusted, so it fails
        let raw = ok_result(AgentType::Verify, "everything passed, trust me");
        assert!(!validators::verification_passed(&raw));

        let mut parsed = ok_result(AgentType::Verify, "");
        parsed.output = AgentOutput::Parsed(serde_json::json!({"passed": true}));
        assert!(validators::verification_passed(&parsed));

        parsed.output = AgentOutput::Parsed(serde_json::json!({"passed": false}));
        assert!(!validators::verification_passed(&parsed));

        parsed.output = AgentOutput::Parsed(serde_json::json!({"status": "PASS"}));
        assert!(validators::verification_passed(&parsed));
    }

    #[test]
    fn test_input_mapping_threads_prior_outputs() {
        let def = definition(WorkflowType::NewFeature);
        let mut state = WorkflowState::new("new-feature", "add pagination");
        state.transition(WorkflowStatus::Running).unwrap();
        state.record_result(ok_result(AgentType::DesignReview, "touches the list view"));
        state.record_result(ok_result(AgentType::Specify, "the pagination spec"));

        // Specify sees design notes
        match build_phase_input(def, &state, 1, None) {
            PhaseInput::Specify { design_notes, .. } => {
                assert_eq!(design_notes.as_deref(), Some("touches the list view"));
            }
            other => panic!("wrong input: {other:?}"),
        }

        // GenerateTests sees the specification
        match build_phase_input(def, &state, 2, None) {
            PhaseInput::GenerateTests { specification } => {
                assert_eq!(specification, "the pagination spec");
            }
            other => panic!("wrong input: {other:?}"),
        }
    }

    #[test]
    fn test_bug_fix_implement_sees_baseline() {
        let def = definition(WorkflowType::BugFix);
        let mut state = WorkflowState::new("bug-fix", "fix the crash");
        state.transition(WorkflowStatus::Running).unwrap();
        state.record_result(ok_result(AgentType::Verify, "panics on empty input"));

        match build_phase_input(def, &state, 1, None) {
            PhaseInput::Implement { baseline, specification, .. } => {
                assert_eq!(baseline.as_deref(), Some("panics on empty input"));
                assert!(specification.is_none());
            }
            other => panic!("wrong input: {other:?}"),
        }
    }

    #[test]
    fn test_bug_fix_verify_inputs_differ_by_phase() {
        let def = definition(WorkflowType::BugFix);
        let state = WorkflowState::new("bug-fix", "fix the crash");

        match build_phase_input(def, &state, 0, None) {
            PhaseInput::Verify { baseline, .. } => assert!(baseline),
            other => panic!("wrong input: {other:?}"),
        }
        match build_phase_input(def, &state, 3, None) {
            PhaseInput::Verify { baseline, .. } => assert!(!baseline),
            other => panic!("wrong input: {other:?}"),
        }
    }

    #[test]
    fn test_feedback_threads_into_implement_prompt() {
        let def = definition(WorkflowType::Refactor);
        let state = WorkflowState::new("refactor", "extract module");
        let input = build_phase_input(def, &state, 1, Some("keep the public API stable"));
        let prompt = input.render();
        assert!(prompt.contains("keep the public API stable"));
    }

    #[test]
    fn test_every_phase_renders_nonempty_prompt() {
        for wt in [
            WorkflowType::NewFeature,
            WorkflowType::BugFix,
            WorkflowType::Refactor,
        ] {
            let def = definition(wt);
            let state = WorkflowState::new(wt.as_str(), "some task");
            for i in 0..def.len() {
                let prompt = build_phase_input(def, &state, i, None).render();
                assert!(!prompt.trim().is_empty(), "{wt} phase {i} renders empty");
                assert!(prompt.contains("some task"), "{wt} phase {i} drops the task");
            }
        }
    }

    #[test]
    fn test_workflow_type_parsing() {
        assert_eq!(
            "new-feature".parse::<WorkflowType>().unwrap(),
            WorkflowType::NewFeature
        );
        assert!("no-such".parse::<WorkflowType>().is_err());
    }
}
