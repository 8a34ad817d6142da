//! Scoped variable store of one running batch.
//!
//! Lookups walk the overlays narrowest first: step overlays (innermost
//! first), then story, scenario and finally the batch baseline. Names
//! missing everywhere fall back to system properties and environment
//! variables.
//!
//! The batch baseline is shared by every worker of the batch. Story,
//! scenario and step overlays belong to the worker that wrote them, so
//! concurrently running stories never see or clear each other's values.

use crate::path::{PathError, PathExpression};
use crate::properties;
use crate::scope::VariableScope;
use crate::value::VariableValue;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::trace;

pub type VariableMap = HashMap<String, VariableValue>;

#[derive(Debug, Error)]
pub enum VariableError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("Setting of {} variables is forbidden", .0.human_readable().to_uppercase())]
    ReadOnlyScope(VariableScope),
}

/// Owner of a set of story, scenario and step overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Worker used by callers that run a batch on a single thread.
    pub const MAIN: WorkerId = WorkerId(0);
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Overlays {
    story: VariableMap,
    scenario: VariableMap,
    steps: Vec<VariableMap>,
}

impl Overlays {
    /// Overlays in lookup order: innermost step first, story, scenario.
    fn in_precedence_order(&self) -> impl Iterator<Item = &VariableMap> {
        self.steps
            .iter()
            .rev()
            .chain([&self.story, &self.scenario])
    }
}

/// Variables visible to the steps of one batch.
#[derive(Debug)]
pub struct Variables {
    batch: VariableMap,
    workers: RwLock<HashMap<WorkerId, Overlays>>,
    next_worker: AtomicU64,
}

impl Default for Variables {
    fn default() -> Self {
        Self::new(VariableMap::new())
    }
}

impl Variables {
    pub fn new(batch: VariableMap) -> Self {
        Self {
            batch,
            workers: RwLock::new(HashMap::new()),
            next_worker: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a new worker. Its overlays start empty.
    pub fn register_worker(&self) -> WorkerId {
        WorkerId(self.next_worker.fetch_add(1, Ordering::Relaxed))
    }

    /// Discard every overlay of `worker`.
    pub fn release_worker(&self, worker: WorkerId) {
        self.workers.write().remove(&worker);
    }

    /// Resolve a path expression such as `users[0].name:guest` as seen by
    /// `worker`.
    pub fn get_variable(
        &self,
        worker: WorkerId,
        path: &str,
    ) -> Result<Option<VariableValue>, VariableError> {
        if path.trim().is_empty() {
            return Ok(None);
        }

        let workers = self.workers.read();
        let mut scopes: Vec<&VariableMap> = workers
            .get(&worker)
            .map(|overlays| overlays.in_precedence_order().collect())
            .unwrap_or_default();
        scopes.push(&self.batch);

        if let Some(value) = first_present(&scopes, path) {
            return Ok(Some(value));
        }

        let expr = PathExpression::parse(path)?;
        for scope in &scopes {
            if expr.default.is_some() {
                if let Some(value) = present(scope, &expr.target) {
                    return Ok(Some(value));
                }
            }
            if let Some(value) = expr.apply(scope.get(&expr.name)) {
                return Ok(Some(value));
            }
        }
        drop(workers);

        if let Some(value) = properties::external_value(&expr.target) {
            trace!("Variable '{}' resolved from system", expr.target);
            return Ok(Some(VariableValue::String(value)));
        }
        Ok(expr.default.map(VariableValue::String))
    }

    /// Flat merge of the worker's scenario, story and step overlays;
    /// narrower wins.
    pub fn get_variables(&self, worker: WorkerId) -> VariableMap {
        let workers = self.workers.read();
        let Some(overlays) = workers.get(&worker) else {
            return VariableMap::new();
        };
        let mut merged = overlays.scenario.clone();
        merged.extend(overlays.story.clone());
        for step in &overlays.steps {
            merged.extend(step.clone());
        }
        merged
    }

    /// Snapshot of a single overlay. The step scope yields the innermost
    /// step overlay; write-only and global scopes are always empty.
    pub fn scoped_variables(&self, worker: WorkerId, scope: VariableScope) -> VariableMap {
        if scope == VariableScope::Batch {
            return self.batch.clone();
        }
        let workers = self.workers.read();
        let Some(overlays) = workers.get(&worker) else {
            return VariableMap::new();
        };
        match scope {
            VariableScope::Story => overlays.story.clone(),
            VariableScope::Scenario => overlays.scenario.clone(),
            VariableScope::Step => {
                overlays.steps.last().cloned().unwrap_or_default()
            }
            VariableScope::Batch
            | VariableScope::Global
            | VariableScope::NextBatches => VariableMap::new(),
        }
    }

    pub fn put_story_variable(
        &self,
        worker: WorkerId,
        name: impl Into<String>,
        value: impl Into<VariableValue>,
    ) {
        self.workers
            .write()
            .entry(worker)
            .or_default()
            .story
            .insert(name.into(), value.into());
    }

    pub fn put_scenario_variable(
        &self,
        worker: WorkerId,
        name: impl Into<String>,
        value: impl Into<VariableValue>,
    ) {
        self.workers
            .write()
            .entry(worker)
            .or_default()
            .scenario
            .insert(name.into(), value.into());
    }

    /// Write into the innermost step overlay, opening one if none is.
    pub fn put_step_variable(
        &self,
        worker: WorkerId,
        name: impl Into<String>,
        value: impl Into<VariableValue>,
    ) {
        let mut workers = self.workers.write();
        let steps = &mut workers.entry(worker).or_default().steps;
        if steps.is_empty() {
            steps.push(VariableMap::new());
        }
        if let Some(step) = steps.last_mut() {
            step.insert(name.into(), value.into());
        }
    }

    pub fn init_step_variables(&self, worker: WorkerId) {
        self.workers
            .write()
            .entry(worker)
            .or_default()
            .steps
            .push(VariableMap::new());
    }

    /// Drop the innermost step overlay. Hooks that never opened a step
    /// may still report a failure, so an empty stack is fine.
    pub fn clear_step_variables(&self, worker: WorkerId) {
        if let Some(overlays) = self.workers.write().get_mut(&worker) {
            overlays.steps.pop();
        }
    }

    pub fn clear_scenario_variables(&self, worker: WorkerId) {
        if let Some(overlays) = self.workers.write().get_mut(&worker) {
            overlays.scenario.clear();
        }
    }

    pub fn clear_story_variables(&self, worker: WorkerId) {
        if let Some(overlays) = self.workers.write().get_mut(&worker) {
            overlays.story.clear();
        }
    }
}

fn present(scope: &VariableMap, key: &str) -> Option<VariableValue> {
    scope.get(key).cloned().and_then(VariableValue::non_null)
}

fn first_present(scopes: &[&VariableMap], key: &str) -> Option<VariableValue> {
    scopes.iter().find_map(|scope| present(scope, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::{clear_system_property, set_system_property};
    use crate::value::Record;
    use serde_json::json;
    use std::sync::Arc;

    const W: WorkerId = WorkerId::MAIN;

    const KEY: &str = "variableKey";
    const VALUE: &str = "value";

    #[derive(Debug)]
    struct Pojo;

    impl Record for Pojo {
        fn property(&self, name: &str) -> Option<VariableValue> {
            (name == "name").then(|| VariableValue::from(VALUE))
        }
    }

    fn story_variable(key: &str, value: VariableValue) -> Variables {
        let variables = Variables::default();
        variables.put_story_variable(W, key, value);
        variables
    }

    fn v(json: serde_json::Value) -> VariableValue {
        VariableValue::from(json)
    }

    // ── path resolution through the store ───────────────

    #[test]
    fn test_resolves_paths() {
        let pojo = VariableValue::record(Pojo);
        let cases: Vec<(&str, &str, VariableValue, Option<VariableValue>)> = vec![
            (KEY, KEY, v(json!([{"key": VALUE}])), Some(v(json!([{"key": VALUE}])))),
            (KEY, KEY, VariableValue::Null, None),
            ("", KEY, VariableValue::Null, None),
            ("variableKey:defaultValue", KEY, VariableValue::Null, Some(v(json!("defaultValue")))),
            (
                "variableKey:defaultValue:with:colons",
                KEY,
                VariableValue::Null,
                Some(v(json!("defaultValue:with:colons"))),
            ),
            ("variableKey[0]", KEY, v(json!([{"key": VALUE}])), Some(v(json!({"key": VALUE})))),
            ("variableKey[0].key", KEY, v(json!({"key": VALUE})), Some(v(json!(VALUE)))),
            ("variableKey[0]", KEY, VariableValue::Null, None),
            ("variableKey[0]:defaultValue", KEY, v(json!([])), Some(v(json!("defaultValue")))),
            ("variableKey[0].value", KEY, v(json!([{"value": "key"}])), Some(v(json!("key")))),
            ("variableKey.key", KEY, v(json!({"key": VALUE})), Some(v(json!(VALUE)))),
            ("variableKey.key", KEY, v(json!(VALUE)), Some(v(json!(VALUE)))),
            ("variableKey.key:defaultValue", KEY, v(json!({})), Some(v(json!("defaultValue")))),
            ("a.b:NULL", "a.b", v(json!(VALUE)), Some(v(json!(VALUE)))),
            ("a:b", "a:b", v(json!(VALUE)), Some(v(json!(VALUE)))),
            ("variableKey[7]", KEY, v(json!([{"key": VALUE}])), None),
            ("variableKey.key[0]", KEY, v(json!({"key": [VALUE]})), Some(v(json!(VALUE)))),
            ("variableKey.key", KEY, v(json!({"key": 200})), Some(v(json!(200)))),
            ("variableKey.name", KEY, pojo.clone(), Some(v(json!(VALUE)))),
            ("variableKey.notExists", KEY, pojo.clone(), Some(pojo)),
        ];

        for (path, key, stored, expected) in cases {
            let variables = story_variable(key, stored);
            assert_eq!(
                variables.get_variable(W, path).unwrap(),
                expected,
                "path '{path}'"
            );
        }
    }

    #[test]
    fn test_malformed_path_is_an_error() {
        let variables = story_variable(KEY, v(json!([1])));
        let err = variables.get_variable(W, "variableKey[x]").unwrap_err();
        assert!(matches!(err, VariableError::Path(_)));
    }

    #[test]
    fn test_exact_name_skips_path_parsing() {
        let variables = story_variable("odd[name", v(json!(VALUE)));
        assert_eq!(
            variables.get_variable(W, "odd[name").unwrap(),
            Some(v(json!(VALUE)))
        );
    }

    // ── scopes ──────────────────────────────────────────

    #[test]
    fn test_each_scope_is_visible() {
        let variables = Variables::new(HashMap::from([(
            "batch".to_string(),
            v(json!("b")),
        )]));
        variables.put_story_variable(W, "story", "s");
        variables.put_scenario_variable(W, "scenario", "c");
        variables.init_step_variables(W);
        variables.put_step_variable(W, "step", "t");

        for (key, expected) in
            [("batch", "b"), ("story", "s"), ("scenario", "c"), ("step", "t")]
        {
            assert_eq!(
                variables.get_variable(W, key).unwrap(),
                Some(v(json!(expected)))
            );
        }
    }

    #[test]
    fn test_lookup_precedence() {
        let variables = Variables::new(HashMap::from([(
            "key".to_string(),
            v(json!("batch")),
        )]));
        assert_eq!(variables.get_variable(W, "key").unwrap(), Some(v(json!("batch"))));
        variables.put_scenario_variable(W, "key", "scenario");
        assert_eq!(variables.get_variable(W, "key").unwrap(), Some(v(json!("scenario"))));
        variables.put_story_variable(W, "key", "story");
        assert_eq!(variables.get_variable(W, "key").unwrap(), Some(v(json!("story"))));
        variables.init_step_variables(W);
        variables.put_step_variable(W, "key", "step");
        assert_eq!(variables.get_variable(W, "key").unwrap(), Some(v(json!("step"))));
    }

    #[test]
    fn test_unresolved_path_falls_through_to_broader_scope() {
        let variables = Variables::new(HashMap::from([(
            "list".to_string(),
            v(json!(["a", "b", "c"])),
        )]));
        variables.put_story_variable(W, "list", v(json!(["x"])));
        assert_eq!(variables.get_variable(W, "list[2]").unwrap(), Some(v(json!("c"))));
    }

    #[test]
    fn test_merged_variables() {
        let variables = Variables::default();
        variables.init_step_variables(W);
        variables.put_scenario_variable(W, "key1", "scenario");
        variables.put_scenario_variable(W, "key2", "scenario");
        variables.put_scenario_variable(W, "key3", "scenario");
        variables.put_story_variable(W, "key2", "story");
        variables.put_story_variable(W, "key3", "story");
        variables.put_step_variable(W, "key3", "step");

        let merged = variables.get_variables(W);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged["key1"], v(json!("scenario")));
        assert_eq!(merged["key2"], v(json!("story")));
        assert_eq!(merged["key3"], v(json!("step")));
    }

    #[test]
    fn test_nested_step_overlays() {
        let variables = Variables::default();
        variables.init_step_variables(W);
        variables.put_step_variable(W, KEY, "outer");
        variables.init_step_variables(W);
        assert_eq!(variables.get_variable(W, KEY).unwrap(), Some(v(json!("outer"))));
        variables.put_step_variable(W, KEY, "inner");
        assert_eq!(variables.get_variable(W, KEY).unwrap(), Some(v(json!("inner"))));
        variables.clear_step_variables(W);
        assert_eq!(variables.get_variable(W, KEY).unwrap(), Some(v(json!("outer"))));
    }

    // ── lifecycle ───────────────────────────────────────

    #[test]
    fn test_step_round_trip() {
        let variables = Variables::default();
        variables.init_step_variables(W);
        variables.put_step_variable(W, KEY, VALUE);
        assert_eq!(variables.get_variable(W, KEY).unwrap(), Some(v(json!(VALUE))));
        variables.clear_step_variables(W);
        assert_eq!(variables.get_variable(W, KEY).unwrap(), None);
    }

    #[test]
    fn test_clear_step_variables_without_init() {
        let variables = Variables::default();
        variables.clear_step_variables(W);
        assert_eq!(variables.get_variable(W, KEY).unwrap(), None);
    }

    #[test]
    fn test_step_write_without_init_opens_overlay() {
        let variables = Variables::default();
        variables.put_step_variable(W, KEY, VALUE);
        assert_eq!(variables.scoped_variables(W, VariableScope::Step).len(), 1);
        variables.clear_step_variables(W);
        assert!(variables.scoped_variables(W, VariableScope::Step).is_empty());
    }

    #[test]
    fn test_clear_scenario_and_story() {
        let variables = Variables::default();
        variables.put_scenario_variable(W, "scenario", VALUE);
        variables.put_story_variable(W, "story", VALUE);
        variables.clear_scenario_variables(W);
        assert_eq!(variables.get_variable(W, "scenario").unwrap(), None);
        assert!(variables.get_variable(W, "story").unwrap().is_some());
        variables.clear_story_variables(W);
        assert_eq!(variables.get_variable(W, "story").unwrap(), None);
    }

    // ── workers ─────────────────────────────────────────

    #[test]
    fn test_workers_have_separate_overlays() {
        let variables = Variables::new(HashMap::from([(
            "batch".to_string(),
            v(json!("shared")),
        )]));
        let a = variables.register_worker();
        let b = variables.register_worker();
        assert_ne!(a, b);

        variables.init_step_variables(a);
        variables.put_step_variable(a, "a_local", "A");
        variables.init_step_variables(b);
        variables.clear_step_variables(a);
        variables.put_step_variable(b, "b_local", "B");

        assert_eq!(variables.get_variable(a, "a_local").unwrap(), None);
        assert_eq!(variables.get_variable(b, "b_local").unwrap(), Some(v(json!("B"))));
        assert_eq!(variables.get_variable(a, "b_local").unwrap(), None);
        variables.clear_step_variables(b);
        assert_eq!(variables.get_variable(b, "b_local").unwrap(), None);

        variables.put_scenario_variable(a, "scenario", "A");
        variables.put_story_variable(a, "story", "A");
        variables.clear_scenario_variables(b);
        variables.clear_story_variables(b);
        assert_eq!(variables.get_variable(a, "scenario").unwrap(), Some(v(json!("A"))));
        assert_eq!(variables.get_variable(a, "story").unwrap(), Some(v(json!("A"))));

        for worker in [a, b] {
            assert_eq!(
                variables.get_variable(worker, "batch").unwrap(),
                Some(v(json!("shared")))
            );
        }
    }

    #[test]
    fn test_release_worker_drops_its_overlays() {
        let variables = Variables::default();
        let worker = variables.register_worker();
        variables.put_story_variable(worker, KEY, VALUE);
        variables.put_story_variable(W, KEY, "main");
        variables.release_worker(worker);
        assert_eq!(variables.get_variable(worker, KEY).unwrap(), None);
        assert_eq!(variables.get_variable(W, KEY).unwrap(), Some(v(json!("main"))));
    }

    #[test]
    fn test_binary_payload_is_shared() {
        let variables = Variables::default();
        let bytes: Arc<[u8]> = Arc::from(b"value".as_slice());
        variables.put_scenario_variable(W, KEY, bytes.clone());
        let stored = variables.get_variable(W, KEY).unwrap().unwrap();
        assert!(Arc::ptr_eq(stored.as_bytes().unwrap(), &bytes));
    }

    // ── external fallback ───────────────────────────────

    #[test]
    fn test_system_property_fallback() {
        let key = "variables.test.system-property";
        let variables = Variables::default();
        assert_eq!(variables.get_variable(W, key).unwrap(), None);
        set_system_property(key, VALUE);
        assert_eq!(variables.get_variable(W, key).unwrap(), Some(v(json!(VALUE))));
        clear_system_property(key);
        assert_eq!(variables.get_variable(W, key).unwrap(), None);
    }

    #[test]
    fn test_environment_fallback() {
        let name = "RUNSTATE_VARIABLES_TEST_ENV";
        std::env::set_var(name, VALUE);
        let variables = Variables::default();
        assert_eq!(variables.get_variable(W, name).unwrap(), Some(v(json!(VALUE))));
        assert_eq!(
            variables.get_variable(W, "RUNSTATE_VARIABLES_TEST_MISSING:fallback").unwrap(),
            Some(v(json!("fallback")))
        );
    }

    #[test]
    fn test_overlay_wins_over_system_property() {
        let key = "variables.test.shadowed";
        set_system_property(key, "system");
        let variables = story_variable(key, v(json!("story")));
        assert_eq!(variables.get_variable(W, key).unwrap(), Some(v(json!("story"))));
        clear_system_property(key);
    }
}
