//! Process-wide system properties.
//!
//! Variables that are not found in any overlay fall back to a system
//! property of the same name, then to an environment variable. System
//! properties are set from configuration (`system.*`) or directly by the
//! embedding driver.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::LazyLock;

static SYSTEM_PROPERTIES: LazyLock<RwLock<HashMap<String, String>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Set a system property, returning the previous value.
pub fn set_system_property(
    name: impl Into<String>,
    value: impl Into<String>,
) -> Option<String> {
    SYSTEM_PROPERTIES.write().insert(name.into(), value.into())
}

/// Remove a system property, returning its value.
pub fn clear_system_property(name: &str) -> Option<String> {
    SYSTEM_PROPERTIES.write().remove(name)
}

pub fn system_property(name: &str) -> Option<String> {
    SYSTEM_PROPERTIES.read().get(name).cloned()
}

/// System property, then environment variable. Blank names never match.
pub(crate) fn external_value(name: &str) -> Option<String> {
    if name.trim().is_empty() {
        return None;
    }
    system_property(name).or_else(|| std::env::var(name).ok())
}
