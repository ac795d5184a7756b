// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Template synthesis
//!
//! Turns an environment description (`environment.yaml` in a source
//! artifact) into a [`Template`]. The output depends only on the
//! description, so identical input always yields a byte-identical template.
//! The image tag stays a placeholder; it is bound at deploy time.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use super::Template;
use crate::artifacts::ArtifactPayload;
use crate::deploy::is_valid_environment_name;
use crate::errors::{DeployflowError, DeployflowResult};

/// Description of the target environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Template description
    #[serde(default)]
    pub description: Option<String>,

    /// Placeholders bound at deploy time
    #[serde(default = "default_parameters")]
    pub parameters: Vec<ParameterSpec>,

    #[serde(default)]
    pub network: NetworkSpec,

    /// Cluster name
    #[serde(default = "default_cluster")]
    pub cluster: String,

    #[serde(default)]
    pub task: TaskSpec,

    pub container: ContainerSpec,

    #[serde(default)]
    pub service: ServiceSpec,

    #[serde(default)]
    pub load_balancer: LoadBalancerSpec,
}

/// A template placeholder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_parameters() -> Vec<ParameterSpec> {
    vec![ParameterSpec {
        name: default_tag_parameter(),
        description: Some("Tag of the container image pushed by the build".into()),
    }]
}

fn default_cluster() -> String {
    "user-cluster".into()
}

/// Network layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    #[serde(default = "default_network_name")]
    pub name: String,
    #[serde(default = "default_cidr")]
    pub cidr: String,
    #[serde(default = "default_max_azs")]
    pub max_azs: u32,
    #[serde(default = "default_nat_gateways")]
    pub nat_gateways: u32,
    /// Inbound rules; when empty only the listener port is opened
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            name: default_network_name(),
            cidr: default_cidr(),
            max_azs: default_max_azs(),
            nat_gateways: default_nat_gateways(),
            ingress: Vec::new(),
        }
    }
}

fn default_network_name() -> String {
    "user-vpc".into()
}

fn default_cidr() -> String {
    "10.0.0.0/16".into()
}

fn default_max_azs() -> u32 {
    3
}

fn default_nat_gateways() -> u32 {
    1
}

/// One inbound traffic rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub cidr: String,
    pub port: u16,
    #[serde(default)]
    pub description: Option<String>,
}

/// Task sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default = "default_memory")]
    pub memory_mib: u32,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory_mib: default_memory(),
        }
    }
}

fn default_cpu() -> u32 {
    512
}

fn default_memory() -> u32 {
    1024
}

/// The service container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    #[serde(default = "default_container_name")]
    pub name: String,

    /// Image repository name; the URI is `<registry>/<repository>`
    pub repository: String,

    /// Placeholder holding the image tag
    #[serde(default = "default_tag_parameter")]
    pub image_tag_parameter: String,

    #[serde(default = "default_container_port")]
    pub port: u16,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Environment variable → secret reference
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

fn default_container_name() -> String {
    "userServiceContainer".into()
}

fn default_tag_parameter() -> String {
    "ImageTag".into()
}

fn default_container_port() -> u16 {
    8080
}

/// Service scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default = "default_desired_count")]
    pub desired_count: u32,
    #[serde(default = "default_true")]
    pub circuit_breaker_rollback: bool,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            desired_count: default_desired_count(),
            circuit_breaker_rollback: true,
        }
    }
}

fn default_desired_count() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Load balancer in front of the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    #[serde(default = "default_lb_name")]
    pub name: String,
    #[serde(default = "default_true")]
    pub internet_facing: bool,
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    #[serde(default)]
    pub health_check: HealthCheckSpec,
}

impl Default for LoadBalancerSpec {
    fn default() -> Self {
        Self {
            name: default_lb_name(),
            internet_facing: true,
            listener_port: default_listener_port(),
            health_check: HealthCheckSpec::default(),
        }
    }
}

fn default_lb_name() -> String {
    "user-alb".into()
}

fn default_listener_port() -> u16 {
    80
}

/// Target health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Defaults to the container port
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u32,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            port: None,
            interval_secs: default_health_interval(),
        }
    }
}

fn default_health_path() -> String {
    "/actuator/health".into()
}

fn default_health_interval() -> u32 {
    60
}

const CIDR_PATTERN: &str = r"^\d{1,3}(\.\d{1,3}){3}/\d{1,2}$";

/// Logical ids of the synthesized resources. Parameters share their
/// namespace, so `Ref` stays unambiguous only if names never overlap.
const RESOURCE_IDS: [&str; 8] = [
    "Vpc",
    "SecurityGroup",
    "Cluster",
    "TaskDefinition",
    "Service",
    "LoadBalancer",
    "Listener",
    "TargetGroup",
];

impl EnvironmentSpec {
    /// Parse an environment description
    pub fn from_yaml(yaml: &str) -> DeployflowResult<Self> {
        let spec: Self = serde_yaml::from_str(yaml)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Check the description can produce a deployable template
    pub fn validate(&self) -> DeployflowResult<()> {
        let invalid = |reason: String| Err(DeployflowError::InvalidTemplate { reason });

        let mut seen = std::collections::HashSet::new();
        for param in &self.parameters {
            if param.name.is_empty() || !param.name.chars().all(|c| c.is_ascii_alphanumeric()) {
                return invalid(format!(
                    "parameter name '{}' must be non-empty and alphanumeric",
                    param.name
                ));
            }
            if RESOURCE_IDS.contains(&param.name.as_str()) {
                return invalid(format!(
                    "parameter '{}' has the same name as a resource",
                    param.name
                ));
            }
            if !seen.insert(param.name.as_str()) {
                return invalid(format!("parameter '{}' is declared twice", param.name));
            }
        }

        if !seen.contains(self.container.image_tag_parameter.as_str()) {
            return invalid(format!(
                "image tag parameter '{}' is not declared under parameters",
                self.container.image_tag_parameter
            ));
        }

        let cidr_re = Regex::new(CIDR_PATTERN).map_err(|e| DeployflowError::InvalidTemplate {
            reason: format!("Invalid CIDR pattern: {}", e),
        })?;
        let cidrs = std::iter::once(&self.network.cidr)
            .chain(self.network.ingress.iter().map(|r| &r.cidr));
        for cidr in cidrs {
            if !cidr_re.is_match(cidr) {
                return invalid(format!("'{}' is not an IPv4 CIDR block", cidr));
            }
        }

        if self.container.port == 0 || self.load_balancer.listener_port == 0 {
            return invalid("ports must be non-zero".into());
        }

        Ok(())
    }

    /// Inbound rules actually emitted
    pub fn effective_ingress(&self) -> Vec<IngressRule> {
        if !self.network.ingress.is_empty() {
            return self.network.ingress.clone();
        }

        let cidr = if self.load_balancer.internet_facing {
            "0.0.0.0/0".to_string()
        } else {
            self.network.cidr.clone()
        };
        vec![IngressRule {
            cidr,
            port: self.load_balancer.listener_port,
            description: Some("listener".into()),
        }]
    }

    /// Build the template for `stack`, with images from `registry`
    pub fn to_template(&self, stack: &str, registry: &str) -> DeployflowResult<Template> {
        self.validate()?;

        let image = json!({
            "Fn::Join": [":", [
                format!("{}/{}", registry, self.container.repository),
                { "Ref": self.container.image_tag_parameter }
            ]]
        });

        let mut parameters = Map::new();
        for param in &self.parameters {
            let mut decl = Map::new();
            decl.insert("Type".into(), json!("String"));
            if let Some(description) = &param.description {
                decl.insert("Description".into(), json!(description));
            }
            parameters.insert(param.name.clone(), Value::Object(decl));
        }

        let ingress: Vec<Value> = self
            .effective_ingress()
            .iter()
            .map(|rule| {
                json!({
                    "CidrIp": rule.cidr,
                    "Description": rule.description.clone().unwrap_or_default(),
                    "FromPort": rule.port,
                    "IpProtocol": "tcp",
                    "ToPort": rule.port,
                })
            })
            .collect();

        let environment: Vec<Value> = self
            .container
            .environment
            .iter()
            .map(|(name, value)| json!({ "Name": name, "Value": value }))
            .collect();
        let secrets: Vec<Value> = self
            .container
            .secrets
            .iter()
            .map(|(name, reference)| json!({ "Name": name, "ValueFrom": reference }))
            .collect();

        let scheme = if self.load_balancer.internet_facing {
            "internet-facing"
        } else {
            "internal"
        };
        let health = &self.load_balancer.health_check;
        let health_port = health.port.unwrap_or(self.container.port);

        let resources = json!({
            "Vpc": {
                "Type": "Network::Vpc",
                "Properties": {
                    "CidrBlock": self.network.cidr,
                    "MaxAzs": self.network.max_azs,
                    "NatGateways": self.network.nat_gateways,
                    "VpcName": self.network.name,
                }
            },
            "SecurityGroup": {
                "Type": "Network::SecurityGroup",
                "Properties": {
                    "AllowAllOutbound": true,
                    "GroupName": format!("{}-sg", stack),
                    "Ingress": ingress,
                    "VpcId": { "Ref": "Vpc" },
                }
            },
            "Cluster": {
                "Type": "Container::Cluster",
                "Properties": {
                    "ClusterName": self.cluster,
                    "VpcId": { "Ref": "Vpc" },
                }
            },
            "TaskDefinition": {
                "Type": "Container::TaskDefinition",
                "Properties": {
                    "ContainerDefinitions": [{
                        "Environment": environment,
                        "Image": image,
                        "Name": self.container.name,
                        "PortMappings": [{
                            "ContainerPort": self.container.port,
                            "HostPort": self.container.port,
                        }],
                        "Secrets": secrets,
                    }],
                    "Cpu": self.task.cpu,
                    "MemoryMiB": self.task.memory_mib,
                }
            },
            "Service": {
                "Type": "Container::Service",
                "Properties": {
                    "CircuitBreakerRollback": self.service.circuit_breaker_rollback,
                    "Cluster": { "Ref": "Cluster" },
                    "DesiredCount": self.service.desired_count,
                    "LoadBalancers": [{
                        "ContainerName": self.container.name,
                        "ContainerPort": self.container.port,
                        "TargetGroupArn": { "Ref": "TargetGroup" },
                    }],
                    "SecurityGroups": [{ "Ref": "SecurityGroup" }],
                    "TaskDefinition": { "Ref": "TaskDefinition" },
                }
            },
            "LoadBalancer": {
                "Type": "LoadBalancing::LoadBalancer",
                "Properties": {
                    "LoadBalancerName": self.load_balancer.name,
                    "Scheme": scheme,
                    "VpcId": { "Ref": "Vpc" },
                }
            },
            "Listener": {
                "Type": "LoadBalancing::Listener",
                "Properties": {
                    "DefaultActions": [{
                        "TargetGroupArn": { "Ref": "TargetGroup" },
                        "Type": "forward",
                    }],
                    "LoadBalancerArn": { "Ref": "LoadBalancer" },
                    "Port": self.load_balancer.listener_port,
                }
            },
            "TargetGroup": {
                "Type": "LoadBalancing::TargetGroup",
                "Properties": {
                    "HealthCheckIntervalSeconds": health.interval_secs,
                    "HealthCheckPath": health.path,
                    "HealthCheckPort": health_port,
                    "Port": self.load_balancer.listener_port,
                    "Protocol": "HTTP",
                    "VpcId": { "Ref": "Vpc" },
                }
            },
        });

        let outputs = json!({
            "LoadBalancerArn": { "Value": { "Ref": "LoadBalancer" } },
            "ServiceImage": { "Value": image },
            "VpcId": { "Value": { "Ref": "Vpc" } },
        });

        let mut body = Map::new();
        body.insert(
            "Description".into(),
            json!(self
                .description
                .clone()
                .unwrap_or_else(|| format!("Container service environment {}", stack))),
        );
        body.insert("Parameters".into(), Value::Object(parameters));
        body.insert("Resources".into(), resources);
        body.insert("Outputs".into(), outputs);

        Template::from_value(Value::Object(body))
    }
}

/// File name of a stack's template inside the output artifact
pub fn template_file_name(stack: &str) -> String {
    format!("{}.template.json", stack)
}

/// Synthesize the template of `stack` from the environment description at
/// `environment_file` inside a source artifact.
pub fn synthesize(
    source: &ArtifactPayload,
    source_slot: &str,
    environment_file: &str,
    stack: &str,
    registry: &str,
) -> DeployflowResult<Template> {
    if !is_valid_environment_name(stack) {
        return Err(DeployflowError::InvalidEnvironmentName {
            name: stack.to_string(),
        });
    }
    let yaml = source.require_text(source_slot, environment_file)?;
    let spec = EnvironmentSpec::from_yaml(&yaml)?;
    let template = spec.to_template(stack, registry)?;

    debug!(
        stack,
        placeholders = ?template.placeholders(),
        version = %template.fingerprint(),
        "Template synthesized"
    );
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENVIRONMENT: &str = r#"
container:
  repository: user-repository
  environment:
    dynamodbEndpoint: https://dynamodb.example.com
  secrets:
    awsAccessKey: AwsAccessKey
"#;

    fn source() -> ArtifactPayload {
        ArtifactPayload::new().with_file("environment.yaml", ENVIRONMENT.as_bytes().to_vec())
    }

    #[test]
    fn test_defaults() {
        let spec = EnvironmentSpec::from_yaml(ENVIRONMENT).unwrap();
        assert_eq!(spec.network.max_azs, 3);
        assert_eq!(spec.network.nat_gateways, 1);
        assert_eq!(spec.task.cpu, 512);
        assert_eq!(spec.task.memory_mib, 1024);
        assert_eq!(spec.container.port, 8080);
        assert_eq!(spec.load_balancer.health_check.path, "/actuator/health");
        assert!(spec.service.circuit_breaker_rollback);
    }

    #[test]
    fn test_single_image_placeholder() {
        let template = synthesize(&source(), "cdk", "environment.yaml", "Stack", "reg").unwrap();
        assert_eq!(template.placeholders(), vec!["ImageTag"]);

        let image = &template.body()["Resources"]["TaskDefinition"]["Properties"]
            ["ContainerDefinitions"][0]["Image"];
        assert_eq!(image["Fn::Join"][1][0], json!("reg/user-repository"));
        assert_eq!(image["Fn::Join"][1][1], json!({ "Ref": "ImageTag" }));
    }

    #[test]
    fn test_deterministic() {
        let a = synthesize(&source(), "cdk", "environment.yaml", "Stack", "reg").unwrap();
        let b = synthesize(&source(), "cdk", "environment.yaml", "Stack", "reg").unwrap();
        assert_eq!(a.to_json(), b.to_json());
    }

    #[test]
    fn test_default_ingress_is_listener_only() {
        let spec = EnvironmentSpec::from_yaml(ENVIRONMENT).unwrap();
        let ingress = spec.effective_ingress();
        assert_eq!(ingress.len(), 1);
        assert_eq!(ingress[0].port, 80);
        assert_eq!(ingress[0].cidr, "0.0.0.0/0");
    }

    #[test]
    fn test_explicit_ingress() {
        let yaml = format!(
            "{}network:\n  ingress:\n    - cidr: 10.1.0.0/16\n      port: 8080\n",
            ENVIRONMENT
        );
        let spec = EnvironmentSpec::from_yaml(&yaml).unwrap();
        assert_eq!(
            spec.effective_ingress(),
            vec![IngressRule {
                cidr: "10.1.0.0/16".into(),
                port: 8080,
                description: None,
            }]
        );
    }

    #[test]
    fn test_undeclared_tag_parameter() {
        let yaml = format!("{}parameters: []\n", ENVIRONMENT);
        assert!(matches!(
            EnvironmentSpec::from_yaml(&yaml),
            Err(DeployflowError::InvalidTemplate { .. })
        ));
    }

    #[test]
    fn test_parameter_named_like_resource() {
        let yaml = format!(
            "{}parameters:\n  - name: ImageTag\n  - name: Vpc\n",
            ENVIRONMENT
        );
        match EnvironmentSpec::from_yaml(&yaml) {
            Err(DeployflowError::InvalidTemplate { reason }) => assert!(reason.contains("Vpc")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_stack_name_must_be_file_safe() {
        for stack in ["../../x", "a/b", "", "1st", "web stack"] {
            let result = synthesize(&source(), "cdk", "environment.yaml", stack, "reg");
            assert!(
                matches!(result, Err(DeployflowError::InvalidEnvironmentName { .. })),
                "{stack:?} was accepted"
            );
        }
    }

    #[test]
    fn test_bad_cidr() {
        let yaml = format!("{}network:\n  cidr: everywhere\n", ENVIRONMENT);
        assert!(EnvironmentSpec::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_missing_environment_file() {
        let result = synthesize(&ArtifactPayload::new(), "cdk", "environment.yaml", "S", "r");
        assert!(matches!(
            result,
            Err(DeployflowError::ArtifactFileMissing { .. })
        ));
    }
}
