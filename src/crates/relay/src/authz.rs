//! Per-user authorization.
//!
//! A YAML access map grants each principal (by email, or by mail domain) an
//! account plus an org -> project -> flows tree. An individual entry always
//! wins over its domain entry. Flow tags have the shape
//! `"<org>.<project>.<flow>"`.

use crate::error::{RelayError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// One grant: an account and the projects/flows it may touch.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessEntry {
    pub account: String,
    /// org -> project -> flows
    #[serde(default)]
    pub projects: HashMap<String, HashMap<String, Vec<String>>>,
}

/// The full access map as loaded from YAML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessConfig {
    #[serde(default)]
    pub users: HashMap<String, AccessEntry>,
    #[serde(default)]
    pub domains: HashMap<String, AccessEntry>,
}

/// Resolves principals to their grants and validates access.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    config: AccessConfig,
}

impl AccessPolicy {
    pub fn new(config: AccessConfig) -> Self {
        Self { config }
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: AccessConfig = serde_yaml::from_str(raw)
            .map_err(|e| RelayError::Internal(format!("invalid access config: {e}")))?;
        Ok(Self::new(config))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Internal(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&raw)
    }

    /// The grant for an email: the individual entry if present, otherwise
    /// the domain entry.
    pub fn entry_for(&self, email: &str) -> Option<&AccessEntry> {
        if let Some(entry) = self.config.users.get(email) {
            return Some(entry);
        }
        let domain = email.rsplit('@').next()?;
        self.config.domains.get(domain)
    }

    /// Validate access to an (org, project, flow) triple.
    pub fn authorize(&self, email: &str, org: &str, project: &str, flow: &str) -> Result<()> {
        let entry = self
            .entry_for(email)
            .ok_or_else(|| RelayError::AuthDenied(format!("no access entry for {email}")))?;
        let allowed = entry
            .projects
            .get(org)
            .and_then(|projects| projects.get(project))
            .is_some_and(|flows| flows.iter().any(|f| f == flow));
        if allowed {
            Ok(())
        } else {
            Err(RelayError::AuthDenied(format!(
                "{email} may not access {org}.{project}.{flow}"
            )))
        }
    }

    /// Validate access to a `"<org>.<project>.<flow>"` tag.
    pub fn authorize_flow_tag(&self, email: &str, flow_tag: &str) -> Result<()> {
        let mut parts = flow_tag.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(org), Some(project), Some(flow)) => self.authorize(email, org, project, flow),
            _ => Err(RelayError::Validation(format!(
                "malformed flow tag: {flow_tag}"
            ))),
        }
    }
}
