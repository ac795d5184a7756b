// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Deployment executor
//!
//! The single point where template placeholders are bound to values. A
//! deploy resolves the template first, so missing or unknown parameters are
//! reported before the engine is touched, then performs a create-or-update
//! keyed by environment name. Re-applying an unchanged request is a no-op.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::collaborators::{EnvironmentState, TemplateEngine};
use crate::errors::{DeployflowError, DeployflowResult};
use crate::template::Template;

/// Reference to a deployed environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRef {
    pub environment: String,
    /// Desired-state fingerprint of the applied request
    pub fingerprint: String,
    /// Fingerprint of the template it was resolved from
    pub template_version: String,
    pub outputs: BTreeMap<String, String>,
    /// Engine state version
    pub version: u64,
    /// Whether this deploy changed the environment
    pub changed: bool,
}

impl EnvironmentRef {
    fn from_state(state: &EnvironmentState, changed: bool) -> Self {
        Self {
            environment: state.environment.clone(),
            fingerprint: state.fingerprint.clone(),
            template_version: state.template_version.clone(),
            outputs: state.outputs.clone(),
            version: state.version,
            changed,
        }
    }
}

/// Whether `name` can name an environment (and a stack). Environment names
/// become file names, so they match `^[A-Za-z][A-Za-z0-9-]*$`.
pub fn is_valid_environment_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Binds parameters into templates and applies them through an engine
#[derive(Clone)]
pub struct DeploymentExecutor {
    engine: Arc<dyn TemplateEngine>,
    /// Held from the desired-state check until the apply finished
    deploy_lock: Arc<Mutex<()>>,
}

impl DeploymentExecutor {
    pub fn new(engine: Arc<dyn TemplateEngine>) -> Self {
        Self {
            engine,
            deploy_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Create or update `environment` from `template` with `params`
    pub async fn deploy(
        &self,
        environment: &str,
        template: &Template,
        params: &BTreeMap<String, String>,
    ) -> DeployflowResult<EnvironmentRef> {
        if !is_valid_environment_name(environment) {
            return Err(DeployflowError::InvalidEnvironmentName {
                name: environment.to_string(),
            });
        }
        let request = template.resolve(environment, params)?;
        let fingerprint = request.fingerprint();

        let _guard = self.deploy_lock.lock().await;
        if let Some(current) = self.engine.current(environment).await? {
            if current.fingerprint == fingerprint {
                info!(
                    environment,
                    version = current.version,
                    "Environment already at desired state"
                );
                return Ok(EnvironmentRef::from_state(&current, false));
            }
        }

        info!(
            environment,
            template = %request.template_version,
            parameters = ?params,
            "Applying deployment"
        );
        let state = self.engine.apply(&request).await?;
        Ok(EnvironmentRef::from_state(&state, true))
    }

    /// Current state of an environment
    pub async fn current(&self, environment: &str) -> DeployflowResult<Option<EnvironmentRef>> {
        Ok(self
            .engine
            .current(environment)
            .await?
            .map(|state| EnvironmentRef::from_state(&state, false)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::LocalTemplateEngine;
    use serde_json::json;
    use tempfile::TempDir;

    fn template() -> Template {
        Template::from_value(json!({
            "Parameters": { "ImageTag": { "Type": "String" } },
            "Resources": {
                "TaskDefinition": {
                    "Type": "Container::TaskDefinition",
                    "Properties": {
                        "Image": { "Fn::Join": [":", ["reg/user-repository", { "Ref": "ImageTag" }]] }
                    }
                }
            },
            "Outputs": {
                "ServiceImage": {
                    "Value": { "Fn::Join": [":", ["reg/user-repository", { "Ref": "ImageTag" }]] }
                }
            }
        }))
        .unwrap()
    }

    fn params(tag: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("ImageTag".to_string(), tag.to_string())])
    }

    fn executor(temp: &TempDir) -> DeploymentExecutor {
        let engine = LocalTemplateEngine::new(temp.path().to_path_buf(), 50).unwrap();
        DeploymentExecutor::new(Arc::new(engine))
    }

    #[tokio::test]
    async fn test_deploy_binds_image_tag() {
        let temp = TempDir::new().unwrap();
        let executor = executor(&temp);

        let env = executor.deploy("prod", &template(), &params("abc123")).await.unwrap();
        assert!(env.changed);
        assert_eq!(
            env.outputs.get("ServiceImage").map(String::as_str),
            Some("reg/user-repository:abc123")
        );
    }

    #[tokio::test]
    async fn test_redeploy_is_noop() {
        let temp = TempDir::new().unwrap();
        let executor = executor(&temp);

        let first = executor.deploy("prod", &template(), &params("abc123")).await.unwrap();
        let second = executor.deploy("prod", &template(), &params("abc123")).await.unwrap();

        assert!(!second.changed);
        assert_eq!(second.version, first.version);
        assert_eq!(second.fingerprint, first.fingerprint);

        let third = executor.deploy("prod", &template(), &params("def456")).await.unwrap();
        assert!(third.changed);
        assert_eq!(third.version, first.version + 1);
    }

    #[tokio::test]
    async fn test_unresolved_before_mutation() {
        let temp = TempDir::new().unwrap();
        let executor = executor(&temp);

        let result = executor.deploy("prod", &template(), &BTreeMap::new()).await;
        assert!(matches!(
            result,
            Err(DeployflowError::UnresolvedPlaceholder { .. })
        ));
        assert!(executor.current("prod").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_environment_name_before_mutation() {
        let temp = TempDir::new().unwrap();
        let executor = executor(&temp);

        for name in ["../x", "../../etc/passwd", "prod/eu", "", "-prod", "prod_eu"] {
            let err = executor
                .deploy(name, &template(), &params("abc123"))
                .await
                .unwrap_err();
            assert!(
                matches!(err, DeployflowError::InvalidEnvironmentName { .. }),
                "{name:?}: {err}"
            );
            assert!(err.preserves_environment());
        }
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_environment_names() {
        for name in ["prod", "UserEcsStack", "web-2"] {
            assert!(is_valid_environment_name(name), "{name}");
        }
        for name in ["", "2web", "web.json", "a/b", ".."] {
            assert!(!is_valid_environment_name(name), "{name}");
        }
    }

    #[tokio::test]
    async fn test_concurrent_identical_deploys_apply_once() {
        let temp = TempDir::new().unwrap();
        let executor = executor(&temp);
        let other = executor.clone();
        let template = template();
        let params_a = params("abc123");
        let params_b = params("abc123");

        let (a, b) = tokio::join!(
            executor.deploy("prod", &template, &params_a),
            other.deploy("prod", &template, &params_b),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a.changed ^ b.changed);
        assert_eq!(a.version, 1);
        assert_eq!(b.version, 1);
        assert_eq!(executor.current("prod").await.unwrap().unwrap().version, 1);
    }
}
