// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Local template engine
//!
//! Applies deployment requests to environments persisted as JSON files under
//! `<root>/<environment>.json`. An apply either fully succeeds and replaces
//! the file atomically, or fails and leaves the previous state in place.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{DeployedResource, EnvironmentState, TemplateEngine};
use crate::errors::{DeployflowError, DeployflowResult};
use crate::template::{find_ref, substitute_refs, DeploymentRequest};

/// Template engine keeping environments on the local filesystem
pub struct LocalTemplateEngine {
    root: PathBuf,
    max_resources: usize,
    apply_lock: Mutex<()>,
}

impl LocalTemplateEngine {
    /// Create an engine storing environments below `root`
    pub fn new(root: PathBuf, max_resources: usize) -> DeployflowResult<Self> {
        if !root.exists() {
            std::fs::create_dir_all(&root).map_err(|e| DeployflowError::FileWriteError {
                path: root.clone(),
                error: e.to_string(),
            })?;
        }

        Ok(Self {
            root,
            max_resources,
            apply_lock: Mutex::new(()),
        })
    }

    /// Engine under `<state_dir>/environments`
    pub fn in_state_dir(state_dir: &Path, max_resources: usize) -> DeployflowResult<Self> {
        Self::new(state_dir.join("environments"), max_resources)
    }

    fn state_path(&self, environment: &str) -> PathBuf {
        self.root.join(format!("{}.json", environment))
    }

    async fn load(path: &Path) -> DeployflowResult<EnvironmentState> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DeployflowError::FileReadError {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;
        serde_json::from_str(&content).map_err(Into::into)
    }

    /// Every environment other than `except`
    async fn others(&self, except: &str) -> DeployflowResult<Vec<EnvironmentState>> {
        let mut states = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if path.file_stem().and_then(|s| s.to_str()) == Some(except) {
                continue;
            }
            states.push(Self::load(&path).await?);
        }

        Ok(states)
    }

    /// `(type, name)` pairs of the physical names a set of resources claims
    fn physical_names<'a>(
        resources: impl Iterator<Item = (&'a str, &'a Value)>,
    ) -> Vec<(String, String)> {
        let mut names = Vec::new();
        for (resource_type, properties) in resources {
            let Some(props) = properties.as_object() else {
                continue;
            };
            for (key, value) in props {
                if let (true, Some(name)) = (key.ends_with("Name"), value.as_str()) {
                    names.push((resource_type.to_string(), name.to_string()));
                }
            }
        }
        names
    }

    fn check_conflicts(
        request: &DeploymentRequest,
        resources: &serde_json::Map<String, Value>,
        others: &[EnvironmentState],
    ) -> DeployflowResult<()> {
        let wanted = Self::physical_names(resources.values().map(|r| {
            (
                r.get("Type").and_then(Value::as_str).unwrap_or_default(),
                r.get("Properties").unwrap_or(&Value::Null),
            )
        }));

        for other in others {
            let taken = Self::physical_names(
                other
                    .resources
                    .values()
                    .map(|r| (r.resource_type.as_str(), &r.properties)),
            );
            if let Some((kind, name)) = wanted.iter().find(|w| taken.contains(w)) {
                warn!(
                    environment = %request.environment,
                    owner = %other.environment,
                    resource = %name,
                    "Physical name already in use"
                );
                return Err(DeployflowError::ResourceConflict {
                    resource: format!("{} '{}'", kind, name),
                    owner: other.environment.clone(),
                });
            }
        }

        Ok(())
    }

    fn physical_id(environment: &str, logical_id: &str) -> String {
        format!("{}/{}", environment, logical_id)
    }

    /// Create every resource, resolving references between them
    fn materialize(
        request: &DeploymentRequest,
        resources: &serde_json::Map<String, Value>,
    ) -> DeployflowResult<(BTreeMap<String, DeployedResource>, BTreeMap<String, String>)> {
        let environment = &request.environment;
        let ids: BTreeMap<&str, String> = resources
            .keys()
            .map(|id| (id.as_str(), Self::physical_id(environment, id)))
            .collect();
        let lookup = |name: &str| ids.get(name).cloned();

        let rollback = |reason: String| DeployflowError::Rollback {
            environment: environment.clone(),
            reason,
        };

        let mut deployed = BTreeMap::new();
        for (logical_id, resource) in resources {
            let resource_type = resource
                .get("Type")
                .and_then(Value::as_str)
                .ok_or_else(|| rollback(format!("resource '{}' has no Type", logical_id)))?;
            let properties = substitute_refs(
                resource.get("Properties").unwrap_or(&Value::Null),
                &lookup,
            );

            if let Some(missing) = find_ref(&properties) {
                return Err(rollback(format!(
                    "resource '{}' references unknown '{}'",
                    logical_id, missing
                )));
            }

            deployed.insert(
                logical_id.clone(),
                DeployedResource {
                    resource_type: resource_type.to_string(),
                    physical_id: Self::physical_id(environment, logical_id),
                    properties,
                },
            );
        }

        let mut outputs = BTreeMap::new();
        for (name, output) in request.outputs().into_iter().flatten() {
            let value = substitute_refs(output.get("Value").unwrap_or(&Value::Null), &lookup);
            match value {
                Value::String(s) => {
                    outputs.insert(name.clone(), s);
                }
                other => {
                    return Err(rollback(format!(
                        "output '{}' did not resolve to a string: {}",
                        name, other
                    )))
                }
            }
        }

        Ok((deployed, outputs))
    }
}

#[async_trait]
impl TemplateEngine for LocalTemplateEngine {
    async fn current(&self, environment: &str) -> DeployflowResult<Option<EnvironmentState>> {
        let path = self.state_path(environment);
        if !path.exists() {
            return Ok(None);
        }
        Self::load(&path).await.map(Some)
    }

    async fn apply(&self, request: &DeploymentRequest) -> DeployflowResult<EnvironmentState> {
        let _guard = self.apply_lock.lock().await;
        let environment = &request.environment;

        let empty = serde_json::Map::new();
        let resources = request.resources().unwrap_or(&empty);

        if resources.len() > self.max_resources {
            return Err(DeployflowError::QuotaExceeded {
                environment: environment.clone(),
                reason: format!(
                    "{} resources requested, limit is {}",
                    resources.len(),
                    self.max_resources
                ),
            });
        }

        let others = self.others(environment).await?;
        Self::check_conflicts(request, resources, &others)?;

        let previous = self.current(environment).await?;
        let (deployed, outputs) = match Self::materialize(request, resources) {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    environment = %environment,
                    kept_version = previous.as_ref().map(|p| p.version).unwrap_or(0),
                    error = %e,
                    "Apply failed, environment left at previous state"
                );
                return Err(e);
            }
        };

        let state = EnvironmentState {
            environment: environment.clone(),
            fingerprint: request.fingerprint(),
            template_version: request.template_version.clone(),
            parameters: request.parameters.clone(),
            resources: deployed,
            outputs,
            version: previous.as_ref().map(|p| p.version + 1).unwrap_or(1),
            updated_at: SystemTime::now(),
        };

        let path = self.state_path(environment);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(&state)?)
            .await
            .map_err(|e| DeployflowError::FileWriteError {
                path: tmp.clone(),
                error: e.to_string(),
            })?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(environment = %environment, path = %path.display(), "Environment state written");
        info!(
            environment = %environment,
            version = state.version,
            resources = state.resources.len(),
            "Environment updated"
        );

        Ok(state)
    }
}
