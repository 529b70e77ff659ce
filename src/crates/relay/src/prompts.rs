//! Prompt template loading.
//!
//! Templates live as YAML files (`{ template: "..." }`) in a prompt
//! directory and are rendered with a `{key}` variable map. Flows register
//! built-in fallbacks so the service runs without a prompt directory.

use crate::error::{RelayError, Result};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
struct PromptFile {
    template: String,
}

/// YAML-backed prompt loader with in-memory defaults.
#[derive(Debug, Default)]
pub struct PromptLoader {
    dir: Option<PathBuf>,
    defaults: HashMap<String, String>,
    cache: RwLock<HashMap<String, String>>,
}

impl PromptLoader {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            defaults: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Register a fallback template used when the file is absent.
    pub fn with_default(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.defaults.insert(name.into(), template.into());
        self
    }

    fn template(&self, name: &str) -> Result<String> {
        if let Some(cached) = self.cache.read().get(name) {
            return Ok(cached.clone());
        }
        let loaded = self
            .load_file(name)
            .or_else(|| self.defaults.get(name).cloned())
            .ok_or_else(|| RelayError::Internal(format!("unknown prompt template: {name}")))?;
        self.cache.write().insert(name.to_string(), loaded.clone());
        Ok(loaded)
    }

    fn load_file(&self, name: &str) -> Option<String> {
        let path = self.dir.as_ref()?.join(format!("{name}.yaml"));
        let raw = std::fs::read_to_string(path).ok()?;
        let file: PromptFile = serde_yaml::from_str(&raw).ok()?;
        Some(file.template)
    }

    /// Render a template with `{key}` substitutions.
    pub fn render(&self, name: &str, vars: &HashMap<&str, String>) -> Result<String> {
        let mut rendered = self.template(name)?;
        for (key, value) in vars {
            rendered = rendered.replace(&format!("{{{key}}}"), value);
        }
        Ok(rendered)
    }
}
