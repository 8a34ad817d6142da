//! Variable access for the steps of one running batch.
//!
//! A [`VariableContext`] is created when a batch starts. It hands out the
//! batch's [`Variables`], creating them through the [`VariablesFactory`] on
//! first use, and routes writes to the requested scopes. Workers that run
//! stories of the same batch concurrently each take their own handle with
//! [`VariableContext::worker`]: the batch variables are shared, while story,
//! scenario and step overlays stay private to the handle.

use crate::factory::VariablesFactory;
use crate::scope::VariableScope;
use crate::value::VariableValue;
use crate::variables::{VariableError, VariableMap, Variables, WorkerId};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug)]
struct BatchState {
    batch: String,
    factory: Arc<VariablesFactory>,
    variables: Mutex<Option<Arc<Variables>>>,
}

impl BatchState {
    fn variables(&self) -> Arc<Variables> {
        self.variables
            .lock()
            .get_or_insert_with(|| {
                Arc::new(self.factory.create_variables(&self.batch))
            })
            .clone()
    }

    fn existing(&self) -> Option<Arc<Variables>> {
        self.variables.lock().clone()
    }
}

#[derive(Debug)]
pub struct VariableContext {
    state: Arc<BatchState>,
    worker: WorkerId,
}

impl VariableContext {
    pub fn new(batch: impl Into<String>, factory: Arc<VariablesFactory>) -> Self {
        Self {
            state: Arc::new(BatchState {
                batch: batch.into(),
                factory,
                variables: Mutex::new(None),
            }),
            worker: WorkerId::MAIN,
        }
    }

    /// A handle for another worker of the same batch. Dropping it discards
    /// the overlays written through it.
    pub fn worker(&self) -> VariableContext {
        let worker = self.state.variables().register_worker();
        debug!("Registered {} for {}", worker, self.state.batch);
        Self {
            state: self.state.clone(),
            worker,
        }
    }

    pub fn batch(&self) -> &str {
        &self.state.batch
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// Variables of this batch, created on first access.
    pub fn variables(&self) -> Arc<Variables> {
        self.state.variables()
    }

    /// Create the batch variables eagerly.
    pub fn init_variables(&self) {
        self.variables();
    }

    pub fn get_variable(
        &self,
        path: &str,
    ) -> Result<Option<VariableValue>, VariableError> {
        self.variables().get_variable(self.worker, path)
    }

    pub fn get_variables(&self) -> VariableMap {
        self.variables().get_variables(self.worker)
    }

    pub fn scoped_variables(&self, scope: VariableScope) -> VariableMap {
        self.variables().scoped_variables(self.worker, scope)
    }

    pub fn put_variable(
        &self,
        scope: VariableScope,
        name: &str,
        value: impl Into<VariableValue>,
    ) -> Result<(), VariableError> {
        self.put_variables(&BTreeSet::from([scope]), name, value)
    }

    /// Write `value` into every scope of `scopes`. Read-only scopes are
    /// rejected before anything is written.
    pub fn put_variables(
        &self,
        scopes: &BTreeSet<VariableScope>,
        name: &str,
        value: impl Into<VariableValue>,
    ) -> Result<(), VariableError> {
        if let Some(scope) = scopes.iter().find(|s| !s.is_writable()) {
            return Err(VariableError::ReadOnlyScope(*scope));
        }

        let value = value.into();
        for scope in scopes {
            match scope {
                VariableScope::NextBatches => {
                    self.state.factory.add_next_batches_variable(
                        &self.state.batch,
                        name,
                        value.clone(),
                    );
                }
                VariableScope::Story => self.variables().put_story_variable(
                    self.worker,
                    name,
                    value.clone(),
                ),
                VariableScope::Scenario => self
                    .variables()
                    .put_scenario_variable(self.worker, name, value.clone()),
                VariableScope::Step => self.variables().put_step_variable(
                    self.worker,
                    name,
                    value.clone(),
                ),
                VariableScope::Global | VariableScope::Batch => continue,
            }
            log_saving(*scope, name, &value);
        }
        Ok(())
    }

    pub fn init_step_variables(&self) {
        self.variables().init_step_variables(self.worker);
    }

    pub fn clear_step_variables(&self) {
        if let Some(variables) = self.state.existing() {
            variables.clear_step_variables(self.worker);
        }
    }

    pub fn clear_scenario_variables(&self) {
        if let Some(variables) = self.state.existing() {
            variables.clear_scenario_variables(self.worker);
        }
    }

    pub fn clear_story_variables(&self) {
        if let Some(variables) = self.state.existing() {
            variables.clear_story_variables(self.worker);
        }
    }

    /// Drop the batch variables for every worker; the next access starts
    /// from a fresh baseline.
    pub fn clear_batch_variables(&self) {
        self.state.variables.lock().take();
    }
}

impl Drop for VariableContext {
    fn drop(&mut self) {
        if let Some(variables) = self.state.existing() {
            variables.release_worker(self.worker);
        }
    }
}

fn log_saving(scope: VariableScope, name: &str, value: &VariableValue) {
    match value {
        VariableValue::Bytes(bytes) => info!(
            "Saving {} kB of binary data into the {} variable '{}'",
            size_in_kb(bytes.len()),
            scope,
            name
        ),
        other => info!(
            "Saving a value '{}' into the {} variable '{}'",
            other, scope, name
        ),
    }
}

/// Size in kibibytes rounded to three decimals.
pub(crate) fn size_in_kb(len: usize) -> f64 {
    (len as f64 / 1024.0 * 1000.0).round() / 1000.0
}
