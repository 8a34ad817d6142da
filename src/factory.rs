//! Creates the [`Variables`] of each batch.

use crate::config::Properties;
use crate::value::VariableValue;
use crate::variables::{VariableMap, Variables};
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::{debug, info};

const GLOBAL_VARIABLES_PREFIX: &str = "variables.";

static BATCH_VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(batch-\d+)\.variables\.(.+)$")
        .expect("failed to compile batch variable regex")
});

#[derive(Debug, Clone)]
struct PublishedVariable {
    origin: String,
    value: VariableValue,
}

/// Builds batch baselines from configuration and carries values published
/// for later batches.
#[derive(Debug, Default)]
pub struct VariablesFactory {
    global_variables: VariableMap,
    batch_variables: HashMap<String, VariableMap>,
    next_batches_variables: RwLock<HashMap<String, PublishedVariable>>,
}

impl VariablesFactory {
    pub fn new(
        global_variables: VariableMap,
        batch_variables: HashMap<String, VariableMap>,
    ) -> Self {
        Self {
            global_variables,
            batch_variables,
            next_batches_variables: RwLock::new(HashMap::new()),
        }
    }

    /// Load global (`variables.<name>`) and per-batch
    /// (`batch-<n>.variables.<name>`) variables.
    pub fn init(properties: &Properties) -> Self {
        let global_variables: VariableMap = properties
            .with_prefix(GLOBAL_VARIABLES_PREFIX)
            .into_iter()
            .map(|(name, value)| (name, VariableValue::String(value)))
            .collect();

        let mut batch_variables: HashMap<String, VariableMap> = HashMap::new();
        for (key, value) in properties.iter() {
            if let Some(caps) = BATCH_VARIABLE_RE.captures(key) {
                batch_variables
                    .entry(caps[1].to_string())
                    .or_default()
                    .insert(caps[2].to_string(), VariableValue::from(value.as_str()));
            }
        }

        info!(
            "Loaded {} global variable(s) and variables for {} batch(es)",
            global_variables.len(),
            batch_variables.len()
        );
        Self::new(global_variables, batch_variables)
    }

    pub fn global_variables(&self) -> &VariableMap {
        &self.global_variables
    }

    /// Fresh variables for `batch`: global values, overridden by the
    /// batch's own, overridden by values other batches published forward.
    pub fn create_variables(&self, batch: &str) -> Variables {
        let mut baseline = self.global_variables.clone();
        match self.batch_variables.get(batch) {
            Some(own) => baseline.extend(own.clone()),
            None => debug!("No variables configured for {}", batch),
        }
        for (name, published) in self.next_batches_variables.read().iter() {
            if published.origin != batch {
                baseline.insert(name.clone(), published.value.clone());
            }
        }
        Variables::new(baseline)
    }

    /// Publish a value into the baseline of batches created from now on.
    pub fn add_next_batches_variable(
        &self,
        origin: &str,
        name: impl Into<String>,
        value: impl Into<VariableValue>,
    ) {
        self.next_batches_variables.write().insert(
            name.into(),
            PublishedVariable {
                origin: origin.to_string(),
                value: value.into(),
            },
        );
    }
}
