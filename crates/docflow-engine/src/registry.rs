//! Serialized builder descriptions: loading, env substitution, and the
//! tag-keyed constructor registry.
//!
//! A description is a self-describing map with a `type` tag naming a
//! registered builder constructor; nested `source`/`target` maps are store
//! descriptions resolved through a [`StoreRegistry`]. Distributed chunks
//! are attribute overrides applied to the description before rehydration.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use docflow_store::StoreRegistry;
use docflow_types::{ChunkSpec, Criteria};

use crate::builder::{Builder, DEFAULT_CHUNK_SIZE};
use crate::errors::BuildError;
use crate::map_builder::{MapBuilder, MapOptions};

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns [`BuildError::Config`] listing every referenced variable that
/// is not set.
pub fn substitute_env_vars(input: &str) -> Result<String, BuildError> {
    let mut result = input.to_string();
    let mut missing = Vec::new();

    for cap in ENV_VAR_RE.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(val) => {
                result = result.replace(&cap[0], &val);
            }
            Err(_) => missing.push(var_name.to_string()),
        }
    }

    if !missing.is_empty() {
        return Err(BuildError::Config(format!(
            "missing environment variable(s): {}",
            missing.join(", ")
        )));
    }
    Ok(result)
}

/// Parse one description file (YAML or JSON) into builder descriptions.
///
/// A file holding a list yields one description per element.
///
/// # Errors
///
/// Returns [`BuildError::Config`] when the file cannot be read, an env
/// variable is missing, or the text is not valid YAML/JSON.
pub fn load_descriptions(path: &Path) -> Result<Vec<Value>, BuildError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| BuildError::Config(format!("failed to read {}: {e}", path.display())))?;
    parse_descriptions(&text)
}

/// Parse builder descriptions from text, after env substitution.
///
/// # Errors
///
/// Returns [`BuildError::Config`] on substitution or parse failure.
pub fn parse_descriptions(text: &str) -> Result<Vec<Value>, BuildError> {
    let substituted = substitute_env_vars(text)?;
    let parsed: serde_yaml::Value = serde_yaml::from_str(&substituted)
        .map_err(|e| BuildError::Config(format!("failed to parse description: {e}")))?;
    let value = serde_json::to_value(parsed)
        .map_err(|e| BuildError::Config(format!("description is not JSON-compatible: {e}")))?;
    Ok(match value {
        Value::Array(items) => items,
        single => vec![single],
    })
}

/// Apply a chunk's attribute overrides to a builder description.
///
/// # Errors
///
/// Returns [`BuildError::Config`] when the description is not a map.
pub fn apply_chunk(description: &Value, chunk: &ChunkSpec) -> Result<Value, BuildError> {
    let mut map = description
        .as_object()
        .cloned()
        .ok_or_else(|| BuildError::Config("builder description must be a map".into()))?;
    chunk.apply_to(&mut map);
    Ok(Value::Object(map))
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CopySpec {
    name: String,
    source: Value,
    target: Value,
    #[serde(default)]
    query: Option<Criteria>,
    #[serde(default)]
    projection: Option<Vec<String>>,
    #[serde(default)]
    delete_orphans: bool,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    store_process_time: bool,
    #[serde(default)]
    retry_failed: bool,
    #[serde(default = "default_chunk_size")]
    chunk_size: usize,
}

/// Constructor for one registered builder type.
pub type BuilderCtor =
    Box<dyn Fn(&Value, &StoreRegistry) -> Result<Arc<dyn Builder>, BuildError> + Send + Sync>;

/// Registry of builder constructors keyed by stable type tags, plus the
/// store registry used to resolve nested store descriptions.
pub struct BuilderRegistry {
    ctors: HashMap<String, BuilderCtor>,
    stores: Arc<StoreRegistry>,
}

impl BuilderRegistry {
    /// A registry with the given store registry and the built-in `copy`
    /// builder registered.
    #[must_use]
    pub fn new(stores: StoreRegistry) -> Self {
        let mut registry = Self {
            ctors: HashMap::new(),
            stores: Arc::new(stores),
        };
        registry.register("copy", |args, stores| {
            let spec: CopySpec = serde_json::from_value(args.clone())
                .map_err(|e| BuildError::Config(format!("invalid copy builder: {e}")))?;
            let source = stores.from_value(&spec.source)?;
            let target = stores.from_value(&spec.target)?;
            let options = MapOptions {
                query: spec.query.unwrap_or(Criteria::All),
                projection: spec.projection,
                delete_orphans: spec.delete_orphans,
                timeout: spec.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs),
                store_process_time: spec.store_process_time,
                retry_failed: spec.retry_failed,
                chunk_size: spec.chunk_size,
            };
            Ok(Arc::new(MapBuilder::copy(spec.name, source, target, options)) as Arc<dyn Builder>)
        });
        registry
    }

    /// A registry with the reference store adapters.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(StoreRegistry::with_defaults())
    }

    /// The store registry used for nested store descriptions.
    #[must_use]
    pub fn stores(&self) -> &StoreRegistry {
        &self.stores
    }

    /// Register a constructor under `tag`, replacing any previous one.
    pub fn register<F>(&mut self, tag: impl Into<String>, ctor: F)
    where
        F: Fn(&Value, &StoreRegistry) -> Result<Arc<dyn Builder>, BuildError>
            + Send
            + Sync
            + 'static,
    {
        self.ctors.insert(tag.into(), Box::new(ctor));
    }

    /// Materialize a builder from a serialized description.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Config`] for malformed descriptions and
    /// unknown tags.
    pub fn from_value(&self, description: &Value) -> Result<Arc<dyn Builder>, BuildError> {
        let map = description
            .as_object()
            .ok_or_else(|| BuildError::Config("builder description must be a map".into()))?;
        let tag = map.get("type").and_then(Value::as_str).ok_or_else(|| {
            BuildError::Config("builder description is missing a string 'type' field".into())
        })?;
        let ctor = self
            .ctors
            .get(tag)
            .ok_or_else(|| BuildError::Config(format!("unknown builder type '{tag}'")))?;

        let mut args = map.clone();
        args.remove("type");
        ctor(&Value::Object(args), &self.stores)
    }
}
