//! Execution tree and statistics data types.

use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Kind of a run unit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Story,
    Scenario,
    GivenStory,
    Step,
}

impl NodeType {
    pub const ALL: [NodeType; 4] = [
        NodeType::Story,
        NodeType::Scenario,
        NodeType::GivenStory,
        NodeType::Step,
    ];
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeType::Story => "Story",
            NodeType::Scenario => "Scenario",
            NodeType::GivenStory => "Given Story",
            NodeType::Step => "Step",
        })
    }
}

/// One unit of the execution tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub node_type: NodeType,
    /// `None` until an outcome is observed or the node is closed.
    pub status: Option<Status>,
    /// The unit declared nested units (a scenario with steps, a composite
    /// step) even if none of them has run yet.
    pub has_children: bool,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(node_type: NodeType) -> Self {
        Self {
            node_type,
            status: None,
            has_children: false,
            children: Vec::new(),
        }
    }

    /// Raise the status if `status` is more severe than the current one.
    pub fn update_status(&mut self, status: Status) {
        match self.status {
            Some(current) if !status.is_more_severe_than(current) => {}
            _ => self.status = Some(status),
        }
    }

    /// Finalize the status when the unit ends:
    /// a node that declared children but got none is skipped, a node
    /// without outcome passed, and the worst child wins over both.
    pub fn resolve(&mut self) -> Status {
        if self.children.is_empty() && self.has_children {
            self.status = Some(Status::Skipped);
        } else if self.status.is_none() {
            self.status = Some(Status::Passed);
        }
        let worst_child = self
            .children
            .iter()
            .filter_map(|child| child.status)
            .reduce(Status::worst);
        if let Some(worst) = worst_child {
            self.update_status(worst);
        }
        self.status.unwrap_or(Status::Passed)
    }

    /// Steps that only wrap nested steps are not counted.
    pub fn is_counted(&self) -> bool {
        self.node_type != NodeType::Step || self.children.is_empty()
    }
}

/// Stack of open nodes of one running story.
#[derive(Debug, Default)]
pub struct NodeContext {
    stack: Vec<Node>,
}

impl NodeContext {
    pub fn new(root: Node) -> Self {
        Self { stack: vec![root] }
    }

    pub fn push(&mut self, node: Node) {
        self.stack.push(node);
    }

    pub fn tail(&self) -> Option<&Node> {
        self.stack.last()
    }

    pub fn tail_mut(&mut self) -> Option<&mut Node> {
        self.stack.last_mut()
    }

    /// Pop the tail and attach it to its parent. The root is returned
    /// instead, since it has no parent.
    pub fn pop(&mut self) -> Option<PoppedNode> {
        let node = self.stack.pop()?;
        match self.stack.last_mut() {
            Some(parent) => {
                let summary = PoppedNode::from(&node);
                parent.children.push(node);
                Some(summary)
            }
            None => {
                let summary = PoppedNode::from(&node);
                Some(PoppedNode {
                    root: Some(node),
                    ..summary
                })
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

/// What is left of a node after it was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoppedNode {
    pub node_type: NodeType,
    pub status: Option<Status>,
    pub counted: bool,
    /// The whole tree, when the popped node was the root.
    pub root: Option<Node>,
}

impl From<&Node> for PoppedNode {
    fn from(node: &Node) -> Self {
        Self {
            node_type: node.node_type,
            status: node.status,
            counted: node.is_counted(),
            root: None,
        }
    }
}

/// Counters of one node type.
#[derive(Debug, Default)]
pub struct Statistic {
    passed: AtomicU64,
    failed: AtomicU64,
    broken: AtomicU64,
    pending: AtomicU64,
    known_issue: AtomicU64,
    skipped: AtomicU64,
}

impl Statistic {
    /// Count one unit finished with `status`. `NotCovered` has no counter.
    pub fn increment(&self, status: Status) {
        let counter = match status {
            Status::Passed => &self.passed,
            Status::Failed => &self.failed,
            Status::Broken => &self.broken,
            Status::Pending => &self.pending,
            Status::KnownIssuesOnly => &self.known_issue,
            Status::Skipped => &self.skipped,
            Status::NotCovered => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticSnapshot {
        StatisticSnapshot {
            passed: self.passed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            broken: self.broken.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            known_issue: self.known_issue.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a [`Statistic`], as written to `statistics.json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticSnapshot {
    pub passed: u64,
    pub failed: u64,
    pub broken: u64,
    pub pending: u64,
    pub known_issue: u64,
    pub skipped: u64,
}

impl StatisticSnapshot {
    pub fn total(&self) -> u64 {
        self.passed
            + self.failed
            + self.broken
            + self.pending
            + self.known_issue
            + self.skipped
    }

    pub fn count(&self, status: Status) -> u64 {
        match status {
            Status::Passed => self.passed,
            Status::Failed => self.failed,
            Status::Broken => self.broken,
            Status::Pending => self.pending,
            Status::KnownIssuesOnly => self.known_issue,
            Status::Skipped => self.skipped,
            Status::NotCovered => 0,
        }
    }
}

pub type Statistics = BTreeMap<NodeType, StatisticSnapshot>;

/// A recorded failure with its location in the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub batch: String,
    pub story: String,
    pub scenario: Option<String>,
    pub step: Option<String>,
    pub message: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.batch, self.story)?;
        if let Some(scenario) = &self.scenario {
            write!(f, " > {scenario}")?;
        }
        if let Some(step) = &self.step {
            write!(f, " > {step}")?;
        }
        write!(f, ": {}", self.message)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    Executable,
    Comment,
}

/// A step about to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub text: String,
    pub kind: StepKind,
}

impl Step {
    pub fn executable(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: StepKind::Executable,
        }
    }

    pub fn comment(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: StepKind::Comment,
        }
    }

    pub fn is_comment(&self) -> bool {
        self.kind == StepKind::Comment
    }
}

/// Phase of the steps wrapping all stories of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Before,
    After,
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── node rollup ─────────────────────────────────────

    #[test]
    fn test_worst_child_wins() {
        let mut story = Node::new(NodeType::Story);
        for status in [Status::Passed, Status::Failed] {
            let mut scenario = Node::new(NodeType::Scenario);
            scenario.update_status(status);
            story.children.push(scenario);
        }
        assert_eq!(story.resolve(), Status::Failed);
    }

    #[test]
    fn test_declared_children_without_children_is_skipped() {
        let mut step = Node::new(NodeType::Step);
        step.has_children = true;
        assert_eq!(step.resolve(), Status::Skipped);
    }

    #[test]
    fn test_no_outcome_is_passed() {
        assert_eq!(Node::new(NodeType::Scenario).resolve(), Status::Passed);
    }

    #[test]
    fn test_status_never_regresses() {
        let mut node = Node::new(NodeType::Step);
        node.update_status(Status::Broken);
        node.update_status(Status::Passed);
        node.update_status(Status::Failed);
        assert_eq!(node.status, Some(Status::Broken));
    }

    #[test]
    fn test_wrapping_step_is_not_counted() {
        let mut step = Node::new(NodeType::Step);
        assert!(step.is_counted());
        step.children.push(Node::new(NodeType::Step));
        assert!(!step.is_counted());
        let mut scenario = Node::new(NodeType::Scenario);
        scenario.children.push(Node::new(NodeType::Step));
        assert!(scenario.is_counted());
    }

    // ── node context ────────────────────────────────────

    #[test]
    fn test_pop_attaches_to_parent() {
        let mut context = NodeContext::new(Node::new(NodeType::Story));
        context.push(Node::new(NodeType::Scenario));
        assert_eq!(context.depth(), 2);

        let scenario = context.pop().unwrap();
        assert_eq!(scenario.node_type, NodeType::Scenario);
        assert!(scenario.root.is_none());
        assert_eq!(context.tail().unwrap().children.len(), 1);

        let story = context.pop().unwrap();
        assert_eq!(story.root.unwrap().children.len(), 1);
        assert!(context.is_empty());
        assert!(context.pop().is_none());
    }

    // ── statistics ──────────────────────────────────────

    #[test]
    fn test_statistic_counters() {
        let statistic = Statistic::default();
        for status in Status::ALL {
            statistic.increment(status);
        }
        statistic.increment(Status::Passed);

        let snapshot = statistic.snapshot();
        assert_eq!(snapshot.passed, 2);
        assert_eq!(snapshot.known_issue, 1);
        assert_eq!(snapshot.count(Status::NotCovered), 0);
        assert_eq!(snapshot.total(), 7);
    }

    #[test]
    fn test_statistics_serialized_form() {
        let mut statistics = Statistics::new();
        statistics.insert(
            NodeType::GivenStory,
            StatisticSnapshot {
                known_issue: 3,
                ..Default::default()
            },
        );
        let json = serde_json::to_value(&statistics).unwrap();
        assert_eq!(json["GIVEN_STORY"]["knownIssue"], 3);
        assert_eq!(json["GIVEN_STORY"]["passed"], 0);
    }

    #[test]
    fn test_failure_display() {
        let failure = Failure {
            batch: "batch-1".into(),
            story: "login".into(),
            scenario: Some("valid user".into()),
            step: None,
            message: "boom".into(),
        };
        assert_eq!(failure.to_string(), "[batch-1] login > valid user: boom");
    }
}
