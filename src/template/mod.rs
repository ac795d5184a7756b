// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Deployment templates
//!
//! A template is a JSON document with `Parameters`, `Resources` and
//! `Outputs` sections. Every key of `Parameters` is a placeholder, referenced
//! inside resources as `{"Ref": "<name>"}`. Templates are immutable once
//! built; [`Template::resolve`] yields a new [`DeploymentRequest`] with every
//! placeholder substituted.

mod synth;

pub use synth::{
    synthesize, template_file_name, ContainerSpec, EnvironmentSpec, HealthCheckSpec, IngressRule,
    LoadBalancerSpec, NetworkSpec, ParameterSpec, ServiceSpec, TaskSpec,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::artifacts::hash_string;
use crate::errors::{DeployflowError, DeployflowResult};

const PARAMETERS: &str = "Parameters";
const RESOURCES: &str = "Resources";
const OUTPUTS: &str = "Outputs";

/// A synthesized, possibly unresolved, deployment template
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    body: Value,
}

impl Template {
    /// Parse a template from JSON text
    pub fn from_json(text: &str) -> DeployflowResult<Self> {
        let body: Value = serde_json::from_str(text)?;
        Self::from_value(body)
    }

    /// Build a template from a JSON value, checking its shape
    pub fn from_value(body: Value) -> DeployflowResult<Self> {
        let Some(object) = body.as_object() else {
            return Err(DeployflowError::InvalidTemplate {
                reason: "template must be a JSON object".into(),
            });
        };

        match object.get(RESOURCES) {
            Some(Value::Object(_)) => {}
            _ => {
                return Err(DeployflowError::InvalidTemplate {
                    reason: "template has no Resources object".into(),
                })
            }
        }

        for section in [PARAMETERS, OUTPUTS] {
            if let Some(value) = object.get(section) {
                if !value.is_object() {
                    return Err(DeployflowError::InvalidTemplate {
                        reason: format!("{} must be an object", section),
                    });
                }
            }
        }

        Ok(Self { body })
    }

    /// Canonical pretty JSON, keys sorted, trailing newline
    pub fn to_json(&self) -> String {
        let mut text = serde_json::to_string_pretty(&self.body).unwrap_or_default();
        text.push('\n');
        text
    }

    /// The raw document
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Placeholder names, sorted
    pub fn placeholders(&self) -> Vec<String> {
        self.section(PARAMETERS)
            .map(|params| params.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Logical resource ids, sorted
    pub fn resource_ids(&self) -> Vec<String> {
        self.section(RESOURCES)
            .map(|resources| resources.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// BLAKE3 of the canonical JSON; identifies a template version
    pub fn fingerprint(&self) -> String {
        hash_string(&self.to_json())
    }

    /// Substitute every placeholder.
    ///
    /// Fails with `UnresolvedPlaceholder` if a placeholder has no value and
    /// with `ParameterMismatch` if a value names no placeholder.
    pub fn resolve(
        &self,
        environment: &str,
        params: &BTreeMap<String, String>,
    ) -> DeployflowResult<DeploymentRequest> {
        let placeholders = self.placeholders();

        if let Some(missing) = placeholders.iter().find(|p| !params.contains_key(*p)) {
            return Err(DeployflowError::UnresolvedPlaceholder {
                name: missing.clone(),
            });
        }
        if let Some(extra) = params.keys().find(|k| !placeholders.contains(k)) {
            return Err(DeployflowError::ParameterMismatch { name: extra.clone() });
        }

        let lookup = |name: &str| params.get(name).cloned();
        let mut body = Map::new();
        if let Some(object) = self.body.as_object() {
            for (key, value) in object {
                if key != PARAMETERS {
                    body.insert(key.clone(), substitute_refs(value, &lookup));
                }
            }
        }

        Ok(DeploymentRequest {
            environment: environment.to_string(),
            template_version: self.fingerprint(),
            parameters: params.clone(),
            body: Value::Object(body),
        })
    }

    fn section(&self, name: &str) -> Option<&Map<String, Value>> {
        self.body.get(name).and_then(Value::as_object)
    }
}

/// Replace `Ref`s the lookup knows and fold joins whose parts became
/// literals. Unknown `Ref`s are kept.
pub(crate) fn substitute_refs(value: &Value, lookup: &dyn Fn(&str) -> Option<String>) -> Value {
    match value {
        Value::Object(object) => {
            if object.len() == 1 {
                if let Some(Value::String(name)) = object.get("Ref") {
                    if let Some(resolved) = lookup(name) {
                        return Value::String(resolved);
                    }
                }
                if let Some(join) = object.get("Fn::Join") {
                    let folded = substitute_refs(join, lookup);
                    if let Some(joined) = fold_join(&folded) {
                        return Value::String(joined);
                    }
                    let mut kept = Map::new();
                    kept.insert("Fn::Join".into(), folded);
                    return Value::Object(kept);
                }
            }

            Value::Object(
                object
                    .iter()
                    .map(|(k, v)| (k.clone(), substitute_refs(v, lookup)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_refs(v, lookup)).collect()),
        other => other.clone(),
    }
}

/// First `Ref` target left in a value
pub(crate) fn find_ref(value: &Value) -> Option<&str> {
    match value {
        Value::Object(object) => {
            if let (1, Some(Value::String(name))) = (object.len(), object.get("Ref")) {
                return Some(name.as_str());
            }
            object.values().find_map(find_ref)
        }
        Value::Array(items) => items.iter().find_map(find_ref),
        _ => None,
    }
}

/// `[sep, [parts..]]` with only string parts
fn fold_join(args: &Value) -> Option<String> {
    let args = args.as_array()?;
    let [separator, parts] = args.as_slice() else {
        return None;
    };
    let separator = separator.as_str()?;
    let parts: Option<Vec<&str>> = parts.as_array()?.iter().map(Value::as_str).collect();
    Some(parts?.join(separator))
}

/// A fully-resolved template bound to an environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    /// Target environment
    pub environment: String,
    /// Fingerprint of the template this was resolved from
    pub template_version: String,
    /// Values substituted for the placeholders
    pub parameters: BTreeMap<String, String>,
    /// Resources and outputs, with no placeholders left
    pub body: Value,
}

impl DeploymentRequest {
    /// Desired-state fingerprint: equal requests describe the same environment
    pub fn fingerprint(&self) -> String {
        hash_string(&serde_json::to_string(&self.body).unwrap_or_default())
    }

    /// Resources by logical id
    pub fn resources(&self) -> Option<&Map<String, Value>> {
        self.body.get(RESOURCES).and_then(Value::as_object)
    }

    /// Output declarations by name
    pub fn outputs(&self) -> Option<&Map<String, Value>> {
        self.body.get(OUTPUTS).and_then(Value::as_object)
    }
}
