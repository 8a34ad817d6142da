//! Replays a [`RunPlan`] through the variable and reporting engine.

use crate::config::{batch_threads, Properties, RunConfiguration};
use crate::context::VariableContext;
use crate::factory::VariablesFactory;
use crate::model::{Failure, Stage, Statistics, Step};
use crate::plan::{BatchPlan, Outcome, RunPlan, ScenarioPlan, StepPlan, StoryPlan};
use crate::statistics::{StatisticsReporter, StoryRun};
use crate::status::{AssertionError, KnownIssue, SoftAssertionError, Status, VerificationError};
use crate::tracker::{ExitCode, RunStatusTracker};
use crate::value::VariableValue;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// Plan runner trait
#[async_trait]
pub trait PlanRunner: Send + Sync {
    /// Execute a run plan
    async fn run(&self, plan: &RunPlan) -> Result<RunSummary>;
}

/// Final status of one story.
#[derive(Debug, Clone, Serialize)]
pub struct StoryResult {
    pub batch: String,
    pub title: String,
    pub status: Option<Status>,
}

/// Result of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub name: String,
    /// Worst status of the run; `None` when no outcome was reported.
    pub status: Option<Status>,
    pub exit_code: ExitCode,
    pub statistics: Statistics,
    pub failures: Option<Vec<Failure>>,
    pub stories: Vec<StoryResult>,
    pub duration_ms: u64,
}

/// Default plan runner
#[derive(Debug)]
pub struct DefaultPlanRunner {
    properties: Properties,
    config: RunConfiguration,
}

impl DefaultPlanRunner {
    /// Create a runner configured from `properties`.
    pub fn new(properties: Properties) -> Result<Self> {
        let config = RunConfiguration::from_properties(&properties)?;
        Ok(Self { properties, config })
    }

    /// Create a runner with an explicit run configuration.
    pub fn with_configuration(properties: Properties, config: RunConfiguration) -> Self {
        Self { properties, config }
    }

    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    #[instrument(skip(self, batch, factory, reporter), fields(batch = %batch.name))]
    async fn run_batch(
        &self,
        batch: &BatchPlan,
        factory: &Arc<VariablesFactory>,
        reporter: &Arc<StatisticsReporter>,
    ) -> Result<Vec<StoryResult>> {
        let threads = batch_threads(&self.properties, &batch.name)?;
        info!(
            "Running batch {} ({} story(ies), {} thread(s))",
            batch.name,
            batch.stories.len(),
            threads
        );

        let context = Arc::new(VariableContext::new(&batch.name, factory.clone()));
        context.init_variables();
        let semaphore = Arc::new(Semaphore::new(threads));

        let mut handles = Vec::with_capacity(batch.stories.len());
        for story in &batch.stories {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("Story scheduler was closed")?;
            let story = story.clone();
            let context = context.clone();
            let reporter = reporter.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                run_story(&reporter, &context.worker(), &story)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.context(format!(
                "Story task of {} did not complete",
                batch.name
            ))?);
        }

        context.clear_batch_variables();
        Ok(results)
    }
}

#[async_trait]
impl PlanRunner for DefaultPlanRunner {
    #[instrument(skip(self, plan), fields(name = %plan.name))]
    async fn run(&self, plan: &RunPlan) -> Result<RunSummary> {
        let start_time = Instant::now();
        info!("Starting run: {}", plan.name);

        let tracker = Arc::new(RunStatusTracker::new());
        let reporter = Arc::new(StatisticsReporter::new(self.config.clone(), tracker.clone()));
        let factory = Arc::new(VariablesFactory::init(&self.properties));

        reporter.before_stories_steps(Stage::Before);
        reporter.after_stories_steps(Stage::Before);

        let mut stories = Vec::with_capacity(plan.story_count());
        for batch in &plan.batches {
            stories.extend(self.run_batch(batch, &factory, &reporter).await?);
        }

        reporter.before_stories_steps(Stage::After);
        reporter.after_stories_steps(Stage::After);
        reporter.log_summary();

        let summary = RunSummary {
            name: plan.name.clone(),
            status: tracker.status(),
            exit_code: tracker.exit_code(),
            statistics: reporter.statistics(),
            failures: reporter.failures(),
            stories,
            duration_ms: start_time.elapsed().as_millis() as u64,
        };

        info!(
            "Run finished: {} ({} ms) - Exit code: {}",
            plan.name,
            summary.duration_ms,
            summary.exit_code.code()
        );
        Ok(summary)
    }
}

fn run_story(
    reporter: &Arc<StatisticsReporter>,
    context: &VariableContext,
    story: &StoryPlan,
) -> StoryResult {
    info!("Running story: {}", story.title);
    let mut run = reporter.begin_story(context.batch(), &story.title);

    for given in &story.given_stories {
        run.before_given_story(&given.title);
        run_scenarios(&mut run, context, &given.scenarios);
        run.after_given_story();
    }
    run_scenarios(&mut run, context, &story.scenarios);
    context.clear_story_variables();

    let status = run.end().and_then(|root| root.status);
    info!(
        "Story finished: {} - {}",
        story.title,
        status.map_or_else(|| "NO STATUS".to_string(), |s| s.to_string())
    );
    StoryResult {
        batch: context.batch().to_string(),
        title: story.title.clone(),
        status,
    }
}

fn run_scenarios(run: &mut StoryRun, context: &VariableContext, scenarios: &[ScenarioPlan]) {
    for scenario in scenarios {
        if scenario.excluded {
            run.scenario_excluded(&scenario.title);
            continue;
        }
        debug!("Running scenario: {}", scenario.title);
        run.before_scenario(&scenario.title, !scenario.steps.is_empty());
        run_steps(run, context, &scenario.steps);
        run.after_scenario();
        context.clear_scenario_variables();
    }
}

/// Run steps in order. Once a step fails or is pending, the remaining ones
/// are reported as not performed. Returns the worst status reported.
fn run_steps(run: &mut StoryRun, context: &VariableContext, steps: &[StepPlan]) -> Option<Status> {
    let mut worst: Option<Status> = None;
    for step in steps {
        if step.outcome == Outcome::Comment {
            run.before_step(&Step::comment(&step.text));
            continue;
        }
        let interrupted = worst.is_some_and(halts_scenario);
        let status = if interrupted {
            run.before_step(&Step::executable(&step.text));
            run.not_performed(&step.text);
            Status::Skipped
        } else {
            run_step(run, context, step)
        };
        worst = Some(worst.map_or(status, |w| w.worst(status)));
    }
    worst
}

/// Run one step. Nested steps start only after the step itself performed;
/// a step that fails first is reported on its own.
fn run_step(run: &mut StoryRun, context: &VariableContext, step: &StepPlan) -> Status {
    run.before_step(&Step::executable(&step.text));
    context.init_step_variables();

    let status = match perform(context, step) {
        Err(e) => {
            warn!("Step '{}' failed: {:#}", step.text, e);
            failed(run, step, e)
        }
        Ok(()) if step.steps.is_empty() => report_outcome(run, step),
        Ok(()) => {
            run.declare_nested_steps();
            let nested = run_steps(run, context, &step.steps);
            let status = report_outcome(run, step);
            nested.map_or(status, |n| n.worst(status))
        }
    };
    context.clear_step_variables();
    status
}

/// Save variables, then check expectations.
fn perform(context: &VariableContext, step: &StepPlan) -> Result<()> {
    for save in &step.save {
        context
            .put_variables(&save.scopes, &save.name, VariableValue::from(save.value.clone()))
            .context(format!("Failed to save variable '{}'", save.name))?;
    }
    for (path, expected) in &step.expect {
        let actual = context
            .get_variable(path)
            .context(format!("Failed to resolve variable '{path}'"))?;
        let expected = VariableValue::from(expected.clone()).non_null();
        if actual != expected {
            return Err(anyhow::Error::new(AssertionError(format!(
                "Variable '{}': expected {} but was {}",
                path,
                describe(expected.as_ref()),
                describe(actual.as_ref())
            ))));
        }
    }
    Ok(())
}

fn describe(value: Option<&VariableValue>) -> String {
    value.map_or_else(|| "absent".to_string(), |v| format!("'{v}'"))
}

fn report_outcome(run: &mut StoryRun, step: &StepPlan) -> Status {
    let message = || {
        step.message
            .clone()
            .unwrap_or_else(|| format!("Step '{}' failed", step.text))
    };
    match step.outcome {
        Outcome::Passed | Outcome::Comment => {
            run.successful(&step.text);
            Status::Passed
        }
        Outcome::Failed => failed(run, step, anyhow::Error::new(AssertionError(message()))),
        Outcome::KnownIssue => {
            let identifier = step.known_issue.clone().unwrap_or_default();
            let error = SoftAssertionError::new(message())
                .with_known_issue(KnownIssue::new(identifier));
            run.assertion_failed(&step.text, &error);
            failed(run, step, anyhow::Error::new(VerificationError::new(vec![error])))
        }
        Outcome::Broken => failed(run, step, anyhow!(message())),
        Outcome::Pending => {
            run.pending(&step.text);
            Status::Pending
        }
        Outcome::Ignorable => {
            run.ignorable(&step.text);
            Status::Skipped
        }
        Outcome::NotPerformed => {
            run.not_performed(&step.text);
            Status::Skipped
        }
    }
}

fn failed(run: &mut StoryRun, step: &StepPlan, error: anyhow::Error) -> Status {
    run.failed(&step.text, &error);
    Status::from_failure(&error)
}

fn halts_scenario(status: Status) -> bool {
    matches!(
        status,
        Status::Broken | Status::Failed | Status::Pending | Status::KnownIssuesOnly
    )
}
