//! Run configuration.
//!
//! Configuration is a flat set of dotted properties
//! (`variables.env=qa`, `batch-1.threads=2`) read from `.properties` or
//! YAML files. Nested YAML mappings are flattened into dotted keys.

use anyhow::{anyhow, Context, Result};
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const SYSTEM_PROPERTIES_PREFIX: &str = "system.";
const DEFAULT_STATISTICS_FOLDER: &str = "output/statistics";

/// Flat, ordered property set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Parse `key=value` lines. Blank lines and lines starting with `#`
    /// or `!` are ignored; `:` is accepted as separator too.
    pub fn from_properties_str(content: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let separator = line
                .find(['=', ':'])
                .ok_or_else(|| anyhow!("Line {}: expected key=value", idx + 1))?;
            let key = line[..separator].trim();
            if key.is_empty() {
                return Err(anyhow!("Line {}: empty property name", idx + 1));
            }
            entries.insert(
                key.to_string(),
                line[separator + 1..].trim().to_string(),
            );
        }
        Ok(Self { entries })
    }

    /// Parse a YAML document, flattening nested mappings into dotted keys
    /// and sequences into indexed keys (`list.0`).
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let root: YamlValue = serde_yaml::from_str(content)?;
        let mut entries = BTreeMap::new();
        match root {
            YamlValue::Null => {}
            YamlValue::Mapping(_) => flatten_yaml("", &root, &mut entries)?,
            _ => return Err(anyhow!("Top-level YAML value must be a mapping")),
        }
        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Properties starting with `prefix`, with the prefix stripped.
    pub fn with_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
            .filter(|(k, _)| !k.is_empty())
            .collect()
    }

    /// Later properties override earlier ones.
    pub fn merge(&mut self, other: Properties) {
        self.entries.extend(other.entries);
    }

    /// Publish `system.<name>` properties as system properties.
    pub fn apply_system_properties(&self) -> usize {
        let system = self.with_prefix(SYSTEM_PROPERTIES_PREFIX);
        for (name, value) in &system {
            debug!("Setting system property '{}'", name);
            crate::properties::set_system_property(name.clone(), value.clone());
        }
        system.len()
    }
}

fn flatten_yaml(
    prefix: &str,
    value: &YamlValue,
    entries: &mut BTreeMap<String, String>,
) -> Result<()> {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        }
    };
    match value {
        YamlValue::Mapping(map) => {
            for (key, val) in map {
                let key = scalar_to_string(key).ok_or_else(|| {
                    anyhow!("Unsupported YAML key under '{prefix}'")
                })?;
                flatten_yaml(&join(&key), val, entries)?;
            }
        }
        YamlValue::Sequence(items) => {
            for (idx, val) in items.iter().enumerate() {
                flatten_yaml(&join(&idx.to_string()), val, entries)?;
            }
        }
        YamlValue::Tagged(tagged) => flatten_yaml(prefix, &tagged.value, entries)?,
        scalar => {
            entries.insert(
                prefix.to_string(),
                scalar_to_string(scalar).unwrap_or_default(),
            );
        }
    }
    Ok(())
}

fn scalar_to_string(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Bool(b) => Some(b.to_string()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Null => Some(String::new()),
        _ => None,
    }
}

/// Loads and merges property files in order.
#[derive(Debug)]
pub struct ConfigurationLoader {
    pub paths: Vec<PathBuf>,
}

impl ConfigurationLoader {
    pub fn new() -> Self {
        Self { paths: Vec::new() }
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load a single `.properties`, `.yaml` or `.yml` file.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<Properties> {
        let path = path.as_ref();
        info!("Loading configuration from {}", path.display());

        let content = fs::read_to_string(path).context(format!(
            "Failed to read configuration file: {}",
            path.display()
        ))?;

        let properties = if is_yaml_file(path) {
            Properties::from_yaml_str(&content).context(format!(
                "Failed to parse YAML configuration from {}",
                path.display()
            ))?
        } else if is_properties_file(path) {
            Properties::from_properties_str(&content).context(format!(
                "Failed to parse properties from {}",
                path.display()
            ))?
        } else {
            return Err(anyhow!(
                "Unsupported configuration format: {}",
                path.display()
            ));
        };

        debug!(
            "Loaded {} properties from {}",
            properties.len(),
            path.display()
        );
        Ok(properties)
    }

    /// Load every configured path; files listed later win. Directories
    /// contribute their configuration files in name order.
    pub fn load_all(&self) -> Result<Properties> {
        let mut merged = Properties::new();
        for path in &self.paths {
            if path.is_dir() {
                let mut files: Vec<PathBuf> = fs::read_dir(path)
                    .context(format!(
                        "Failed to read directory: {}",
                        path.display()
                    ))?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|p| p.is_file() && is_configuration_file(p))
                    .collect();
                files.sort();
                for file in files {
                    merged.merge(self.load_file(&file)?);
                }
            } else {
                merged.merge(self.load_file(path)?);
            }
        }
        info!("Loaded {} properties in total", merged.len());
        Ok(merged)
    }
}

impl Default for ConfigurationLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

fn is_properties_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "properties")
}

fn is_configuration_file(path: &Path) -> bool {
    is_yaml_file(path) || is_properties_file(path)
}

/// Settings of the reporting side of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfiguration {
    /// Folder receiving `statistics.json`.
    pub statistics_folder: PathBuf,
    /// Keep a list of failures for the end-of-run summary.
    pub collect_failures: bool,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            statistics_folder: PathBuf::from(DEFAULT_STATISTICS_FOLDER),
            collect_failures: false,
        }
    }
}

impl RunConfiguration {
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let mut config = Self::default();
        if let Some(folder) = properties.get("statistics.folder") {
            config.statistics_folder = PathBuf::from(folder);
        }
        if let Some(flag) = properties.get("statistics.collect-failures") {
            config.collect_failures = flag.parse().context(format!(
                "Invalid boolean for statistics.collect-failures: '{flag}'"
            ))?;
        }
        Ok(config)
    }
}

/// Number of stories a batch runs concurrently (`batch-<n>.threads`).
pub fn batch_threads(properties: &Properties, batch: &str) -> Result<usize> {
    let key = format!("{batch}.threads");
    match properties.get(&key) {
        Some(raw) => {
            let threads: usize = raw
                .parse()
                .context(format!("Invalid thread count for {key}: '{raw}'"))?;
            Ok(threads.max(1))
        }
        None => Ok(1),
    }
}
