//! Status aggregation over the execution tree of each story.
//!
//! A [`StatisticsReporter`] is created once per run and shared by all
//! workers. Each running story gets its own [`StoryRun`] holding the stack
//! of open nodes, so node management needs no locking; only the counters,
//! the failure list and the run status tracker are shared.
//!
//! When a node closes, its status is finalized:
//!
//! 1. declared nested units but none ran: `SKIPPED`
//! 2. no outcome observed: `PASSED`
//! 3. the most severe child status wins if it is worse
//!
//! and the counter of its type is incremented, except for steps that only
//! wrap nested steps.

use crate::config::RunConfiguration;
use crate::model::{
    Failure, Node, NodeContext, NodeType, PoppedNode, Stage, Statistic, Statistics, Step,
};
use crate::status::{SoftAssertionError, Status};
use crate::tracker::RunStatusTracker;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const STATISTICS_FILE_NAME: &str = "statistics.json";

#[derive(Debug, Default)]
struct Stopwatch {
    started: Option<Instant>,
    elapsed: Duration,
}

impl Stopwatch {
    fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.elapsed += started.elapsed();
        }
    }

    fn elapsed(&self) -> Duration {
        self.elapsed + self.started.map_or(Duration::ZERO, |s| s.elapsed())
    }
}

/// Run-wide statistics, failures and timing.
#[derive(Debug)]
pub struct StatisticsReporter {
    config: RunConfiguration,
    tracker: Arc<RunStatusTracker>,
    statistics: [Statistic; 4],
    failures: Option<Mutex<Vec<Failure>>>,
    stopwatch: Mutex<Stopwatch>,
}

impl StatisticsReporter {
    pub fn new(config: RunConfiguration, tracker: Arc<RunStatusTracker>) -> Self {
        let failures = config.collect_failures.then(|| Mutex::new(Vec::new()));
        Self {
            config,
            tracker,
            statistics: Default::default(),
            failures,
            stopwatch: Mutex::new(Stopwatch::default()),
        }
    }

    pub fn tracker(&self) -> &Arc<RunStatusTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    /// Open the root node of a story.
    pub fn begin_story(
        self: &Arc<Self>,
        batch: impl Into<String>,
        story: impl Into<String>,
    ) -> StoryRun {
        let story = story.into();
        debug!("Starting story '{}'", story);
        StoryRun {
            reporter: Arc::clone(self),
            batch: batch.into(),
            story,
            scenario: None,
            nodes: NodeContext::new(Node::new(NodeType::Story)),
        }
    }

    /// A scenario filtered out of the run.
    pub fn scenario_excluded(&self, title: &str) {
        debug!("Scenario '{}' is excluded", title);
        self.tracker.change_status(Status::Skipped);
    }

    pub fn before_stories_steps(&self, stage: Stage) {
        if stage == Stage::After {
            self.stopwatch.lock().stop();
        }
        self.tracker.set_recording(false);
    }

    pub fn after_stories_steps(&self, stage: Stage) {
        self.tracker.set_recording(true);
        match stage {
            Stage::Before => self.stopwatch.lock().start(),
            Stage::After => {
                if let Err(e) = self.write_statistics() {
                    debug!(
                        "Unable to write {} into folder: {}: {:#}",
                        STATISTICS_FILE_NAME,
                        self.config.statistics_folder.display(),
                        e
                    );
                }
            }
        }
    }

    pub fn statistic(&self, node_type: NodeType) -> &Statistic {
        &self.statistics[node_type as usize]
    }

    /// Snapshot of all counters, one entry per node type.
    pub fn statistics(&self) -> Statistics {
        NodeType::ALL
            .into_iter()
            .map(|t| (t, self.statistic(t).snapshot()))
            .collect()
    }

    /// `None` when failure collection is disabled.
    pub fn failures(&self) -> Option<Vec<Failure>> {
        self.failures.as_ref().map(|f| f.lock().clone())
    }

    pub fn duration(&self) -> Duration {
        self.stopwatch.lock().elapsed()
    }

    /// Write the counters as pretty JSON into the statistics folder,
    /// creating it if needed.
    pub fn write_statistics(&self) -> Result<PathBuf> {
        let folder = &self.config.statistics_folder;
        fs::create_dir_all(folder).context(format!(
            "Failed to create statistics folder: {}",
            folder.display()
        ))?;
        let path = folder.join(STATISTICS_FILE_NAME);
        let json = serde_json::to_string_pretty(&self.statistics())
            .context("Failed to serialize statistics")?;
        fs::write(&path, json)
            .context(format!("Failed to write {}", path.display()))?;
        info!("Statistics written to {}", path.display());
        Ok(path)
    }

    /// Execution statistics as a text table.
    pub fn summary_table(&self) -> String {
        let statistics = self.statistics();
        let columns = [NodeType::Story, NodeType::Scenario, NodeType::Step];
        let rows = [
            ("Passed", Some(Status::Passed)),
            ("Failed", Some(Status::Failed)),
            ("Broken", Some(Status::Broken)),
            ("Known Issue", Some(Status::KnownIssuesOnly)),
            ("Pending", Some(Status::Pending)),
            ("Skipped", Some(Status::Skipped)),
            ("TOTAL", None),
        ];
        let separator = "-".repeat(46);

        let mut table = String::new();
        let _ = writeln!(table, "{separator}");
        let _ = write!(table, "{:<12}", "");
        for column in columns {
            let _ = write!(table, "{:>11}", column.to_string());
        }
        let _ = writeln!(table);
        let _ = writeln!(table, "{separator}");
        for (label, status) in rows {
            if status.is_none() {
                let _ = writeln!(table, "{separator}");
            }
            let _ = write!(table, "{label:<12}");
            for column in columns {
                let snapshot = statistics.get(&column).copied().unwrap_or_default();
                let value = status.map_or_else(|| snapshot.total(), |s| snapshot.count(s));
                let _ = write!(table, "{value:>11}");
            }
            let _ = writeln!(table);
        }
        let _ = write!(table, "{separator}");
        table
    }

    /// Log the statistics table, the collected failures and the run status.
    pub fn log_summary(&self) {
        info!("Execution statistics:\n{}", self.summary_table());
        if let Some(failures) = self.failures() {
            if !failures.is_empty() {
                warn!("Failures ({}):", failures.len());
                for failure in &failures {
                    warn!("  {}", failure);
                }
            }
        }
        let status = self
            .tracker
            .status()
            .map_or_else(|| "NO OUTCOME".to_string(), |s| s.to_string());
        info!(
            "Run finished with status {} in {:.3}s",
            status,
            self.duration().as_secs_f64()
        );
    }

    fn add_failure(&self, failure: Failure) {
        if let Some(failures) = &self.failures {
            failures.lock().push(failure);
        }
    }
}

/// Execution tree of one running story.
///
/// Outcome events update the innermost open node and close it when it is
/// a step. Comment steps open no node and expect no outcome event.
#[derive(Debug)]
pub struct StoryRun {
    reporter: Arc<StatisticsReporter>,
    batch: String,
    story: String,
    scenario: Option<String>,
    nodes: NodeContext,
}

impl StoryRun {
    pub fn story(&self) -> &str {
        &self.story
    }

    pub fn batch(&self) -> &str {
        &self.batch
    }

    /// Number of open nodes, the story root included.
    pub fn depth(&self) -> usize {
        self.nodes.depth()
    }

    pub fn before_given_story(&mut self, title: &str) {
        debug!("Starting given story '{}'", title);
        self.nodes.push(Node::new(NodeType::GivenStory));
    }

    pub fn after_given_story(&mut self) {
        self.end_node();
    }

    pub fn before_scenario(&mut self, title: &str, has_steps: bool) {
        let mut node = Node::new(NodeType::Scenario);
        node.has_children = has_steps;
        self.nodes.push(node);
        self.scenario = Some(title.to_string());
    }

    pub fn after_scenario(&mut self) {
        self.end_node();
        self.scenario = None;
    }

    pub fn scenario_excluded(&mut self, title: &str) {
        self.reporter.scenario_excluded(title);
    }

    pub fn before_step(&mut self, step: &Step) {
        if !step.is_comment() {
            self.nodes.push(Node::new(NodeType::Step));
        }
    }

    /// Mark the innermost open step as executing nested steps.
    pub fn declare_nested_steps(&mut self) {
        if let Some(node) = self.nodes.tail_mut() {
            node.has_children = true;
        }
    }

    pub fn successful(&mut self, step: &str) {
        self.outcome(step, Status::Passed);
    }

    pub fn ignorable(&mut self, step: &str) {
        self.outcome(step, Status::Skipped);
    }

    pub fn pending(&mut self, step: &str) {
        self.outcome(step, Status::Pending);
    }

    pub fn not_performed(&mut self, step: &str) {
        self.outcome(step, Status::Skipped);
    }

    /// A failed step, classified by [`Status::from_failure`]. Broken steps
    /// are recorded as failures.
    pub fn failed(&mut self, step: &str, error: &anyhow::Error) {
        let status = Status::from_failure(error);
        if status == Status::Broken {
            self.record_failure(step, format!("{error:#}"));
        }
        self.outcome(step, status);
    }

    /// A soft assertion failed inside the running step.
    pub fn assertion_failed(&mut self, step: &str, error: &SoftAssertionError) {
        self.record_failure(step, error.message.clone());
        if let Some(node) = self.nodes.tail_mut() {
            node.update_status(error.status());
        }
    }

    /// Close the story root and return the finished tree.
    pub fn end(mut self) -> Option<Node> {
        while self.nodes.depth() > 1 {
            warn!(
                "Story '{}' ended with {} open node(s)",
                self.story,
                self.nodes.depth() - 1
            );
            self.end_node();
        }
        let root = self.end_node().and_then(|popped| popped.root);
        debug!(
            "Finished story '{}' with status {:?}",
            self.story,
            root.as_ref().and_then(|n| n.status)
        );
        root
    }

    fn outcome(&mut self, step: &str, status: Status) {
        debug!("Step '{}' finished with status {}", step, status);
        if let Some(node) = self.nodes.tail_mut() {
            node.update_status(status);
            if node.node_type == NodeType::Step {
                self.end_node();
            }
        }
        self.reporter.tracker.change_status(status);
    }

    fn end_node(&mut self) -> Option<PoppedNode> {
        let node = self.nodes.tail_mut()?;
        let status = node.resolve();
        if node.is_counted() {
            self.reporter.statistic(node.node_type).increment(status);
        }
        self.nodes.pop()
    }

    fn record_failure(&self, step: &str, message: String) {
        self.reporter.add_failure(Failure {
            batch: self.batch.clone(),
            story: self.story.clone(),
            scenario: self.scenario.clone(),
            step: Some(step.to_string()),
            message,
        });
    }
}
