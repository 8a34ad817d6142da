//! Run plans: a recorded sequence of batches, stories, scenarios and step
//! outcomes that can be replayed through the engine.

use crate::scope::VariableScope;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// The whole run, batches in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPlan {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub batches: Vec<BatchPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPlan {
    /// Batch id, `batch-<n>`.
    pub name: String,
    pub stories: Vec<StoryPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryPlan {
    pub title: String,
    /// Stories executed as preconditions of this one.
    #[serde(default)]
    pub given_stories: Vec<GivenStoryPlan>,
    #[serde(default)]
    pub scenarios: Vec<ScenarioPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GivenStoryPlan {
    pub title: String,
    #[serde(default)]
    pub scenarios: Vec<ScenarioPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioPlan {
    pub title: String,
    /// Filtered out by meta filters; reported as excluded, never run.
    #[serde(default)]
    pub excluded: bool,
    #[serde(default)]
    pub steps: Vec<StepPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPlan {
    pub text: String,
    #[serde(default)]
    pub outcome: Outcome,
    /// Failure message for `failed`, `known-issue` and `broken` outcomes.
    #[serde(default)]
    pub message: Option<String>,
    /// Known issue id for the `known-issue` outcome.
    #[serde(default)]
    pub known_issue: Option<String>,
    /// Variables saved by the step before its outcome is reported.
    #[serde(default)]
    pub save: Vec<SaveVariable>,
    /// Variable paths checked by the step; `null` expects an absent value.
    #[serde(default)]
    pub expect: BTreeMap<String, serde_json::Value>,
    /// Nested steps, executed inside this one.
    #[serde(default)]
    pub steps: Vec<StepPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveVariable {
    pub scopes: BTreeSet<VariableScope>,
    pub name: String,
    pub value: serde_json::Value,
}

/// Reported result of a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    #[default]
    Passed,
    Failed,
    KnownIssue,
    Broken,
    Pending,
    Ignorable,
    NotPerformed,
    Comment,
}

impl RunPlan {
    /// Load a plan from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading run plan from {}", path.display());
        let content = fs::read_to_string(path)
            .context(format!("Failed to read run plan: {}", path.display()))?;
        Self::from_yaml_str(&content)
            .context(format!("Failed to parse run plan from {}", path.display()))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let plan: RunPlan = serde_yaml::from_str(content)?;
        plan.validate()?;
        debug!(
            "Run plan '{}' has {} batch(es) and {} story(ies)",
            plan.name,
            plan.batches.len(),
            plan.story_count()
        );
        Ok(plan)
    }

    pub fn story_count(&self) -> usize {
        self.batches.iter().map(|b| b.stories.len()).sum()
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for batch in &self.batches {
            if batch.name.trim().is_empty() {
                return Err(anyhow!("Batch name must not be empty"));
            }
            if !names.insert(batch.name.as_str()) {
                return Err(anyhow!("Duplicate batch '{}'", batch.name));
            }
            for story in &batch.stories {
                let scenarios = story
                    .given_stories
                    .iter()
                    .flat_map(|g| &g.scenarios)
                    .chain(&story.scenarios);
                for scenario in scenarios {
                    for step in &scenario.steps {
                        validate_step(step).context(format!(
                            "Invalid step in scenario '{}' of story '{}'",
                            scenario.title, story.title
                        ))?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_step(step: &StepPlan) -> Result<()> {
    if step.outcome == Outcome::Comment
        && !(step.save.is_empty() && step.expect.is_empty() && step.steps.is_empty())
    {
        return Err(anyhow!(
            "Comment step '{}' cannot save, expect or nest steps",
            step.text
        ));
    }
    if step.outcome == Outcome::KnownIssue && step.known_issue.is_none() {
        return Err(anyhow!(
            "Step '{}' has outcome known-issue but no known_issue id",
            step.text
        ));
    }
    for nested in &step.steps {
        validate_step(nested)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
name: smoke
batches:
  - name: batch-1
    stories:
      - title: login
        given_stories:
          - title: open site
            scenarios:
              - title: open
                steps:
                  - text: Given I am on the main page
        scenarios:
          - title: valid user
            steps:
              - text: "!-- log in first"
                outcome: comment
              - text: When I log in
                save:
                  - scopes: [scenario, next_batches]
                    name: token
                    value: abc
              - text: Then I see the dashboard
                outcome: known-issue
                known_issue: ISSUE-1
                expect:
                  token: abc
                  missing: null
          - title: filtered
            excluded: true
"#;

    #[test]
    fn test_parse_plan() {
        let plan = RunPlan::from_yaml_str(PLAN).unwrap();
        assert_eq!(plan.name, "smoke");
        assert_eq!(plan.story_count(), 1);

        let story = &plan.batches[0].stories[0];
        assert_eq!(story.given_stories[0].scenarios[0].steps.len(), 1);
        assert_eq!(
            story.given_stories[0].scenarios[0].steps[0].outcome,
            Outcome::Passed
        );

        let steps = &story.scenarios[0].steps;
        assert_eq!(steps[0].outcome, Outcome::Comment);
        assert_eq!(
            steps[1].save[0].scopes,
            BTreeSet::from([VariableScope::Scenario, VariableScope::NextBatches])
        );
        assert_eq!(steps[2].outcome, Outcome::KnownIssue);
        assert_eq!(steps[2].expect["missing"], serde_json::Value::Null);
        assert!(story.scenarios[1].excluded);
    }

    #[test]
    fn test_all_outcomes_parse() {
        for (text, outcome) in [
            ("passed", Outcome::Passed),
            ("failed", Outcome::Failed),
            ("broken", Outcome::Broken),
            ("pending", Outcome::Pending),
            ("ignorable", Outcome::Ignorable),
            ("not-performed", Outcome::NotPerformed),
        ] {
            let parsed: Outcome = serde_yaml::from_str(text).unwrap();
            assert_eq!(parsed, outcome);
        }
    }

    #[test]
    fn test_duplicate_batches_are_rejected() {
        let yaml = "name: dup\nbatches:\n  - name: batch-1\n    stories: []\n  \
                    - name: batch-1\n    stories: []\n";
        let err = RunPlan::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate batch"));
    }

    #[test]
    fn test_invalid_steps_are_rejected() {
        let comment_with_save = r#"
name: bad
batches:
  - name: batch-1
    stories:
      - title: story
        scenarios:
          - title: scenario
            steps:
              - text: "!-- note"
                outcome: comment
                save:
                  - scopes: [step]
                    name: a
                    value: 1
"#;
        assert!(RunPlan::from_yaml_str(comment_with_save).is_err());

        let known_issue_without_id = comment_with_save
            .replace("outcome: comment", "outcome: known-issue");
        let err = RunPlan::from_yaml_str(&known_issue_without_id).unwrap_err();
        assert!(format!("{err:#}").contains("no known_issue id"));
    }

    #[test]
    fn test_unknown_scope_is_rejected() {
        let yaml = PLAN.replace("[scenario, next_batches]", "[everywhere]");
        assert!(RunPlan::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yaml");
        std::fs::write(&path, "name: [").unwrap();
        let err = RunPlan::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("plan.yaml"));
    }
}
