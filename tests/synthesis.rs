// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Template synthesis from the fixture environment description

use deployflow::artifacts::ArtifactPayload;
use deployflow::template::{synthesize, Template};
use serde_json::json;

const ENVIRONMENT: &str = include_str!("fixtures/user-cdk/environment.yaml");
const STACK: &str = "UserEcsStackDeployedInPipeline";

fn synth(environment: &str, registry: &str) -> Template {
    let source = ArtifactPayload::new().with_file("environment.yaml", environment);
    synthesize(&source, "cdk-source-output", "environment.yaml", STACK, registry).unwrap()
}

/// Resource ids with their types, then placeholders and outputs
fn layout(template: &Template) -> String {
    let body = template.body();
    let mut lines: Vec<String> = template
        .resource_ids()
        .iter()
        .map(|id| {
            let kind = body["Resources"][id]["Type"].as_str().unwrap_or("?");
            format!("{}: {}", id, kind)
        })
        .collect();

    lines.push(format!("placeholders: {}", template.placeholders().join(", ")));
    let outputs: Vec<&String> = body["Outputs"].as_object().unwrap().keys().collect();
    lines.push(format!(
        "outputs: {}",
        outputs.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
    ));
    lines.join("\n")
}

#[test]
fn test_resource_layout() {
    let template = synth(ENVIRONMENT, "registry.local");
    let layout = layout(&template);
    insta::assert_snapshot!("resource_layout", layout);
}

#[test]
fn test_synthesis_is_byte_identical() {
    let first = synth(ENVIRONMENT, "registry.local");
    let second = synth(ENVIRONMENT, "registry.local");

    assert_eq!(first.to_json(), second.to_json());
    assert_eq!(first.fingerprint(), second.fingerprint());
}

#[test]
fn test_registry_changes_template_version() {
    let local = synth(ENVIRONMENT, "registry.local");
    let remote = synth(ENVIRONMENT, "registry.example.com");

    assert_ne!(local.fingerprint(), remote.fingerprint());
    assert_eq!(
        remote.body()["Outputs"]["ServiceImage"]["Value"]["Fn::Join"][1][0],
        json!("registry.example.com/user-repository")
    );
}

#[test]
fn test_ingress_follows_description() {
    let template = synth(ENVIRONMENT, "registry.local");
    let ingress = &template.body()["Resources"]["SecurityGroup"]["Properties"]["Ingress"];

    assert_eq!(
        ingress,
        &json!([{
            "CidrIp": "0.0.0.0/0",
            "Description": "public http",
            "FromPort": 80,
            "IpProtocol": "tcp",
            "ToPort": 80,
        }])
    );
}

#[test]
fn test_internal_balancer_defaults_to_network_cidr() {
    let minimal = "container:\n  repository: user-repository\nload_balancer:\n  internet_facing: false\n";
    let template = synth(minimal, "registry.local");
    let properties = &template.body()["Resources"]["SecurityGroup"]["Properties"];

    assert_eq!(properties["Ingress"][0]["CidrIp"], json!("10.0.0.0/16"));
    assert_eq!(
        template.body()["Resources"]["LoadBalancer"]["Properties"]["Scheme"],
        json!("internal")
    );
}

#[test]
fn test_synthesized_template_round_trips() {
    let template = synth(ENVIRONMENT, "registry.local");
    let reparsed = Template::from_json(&template.to_json()).unwrap();

    assert_eq!(reparsed.fingerprint(), template.fingerprint());
    assert_eq!(reparsed.placeholders(), vec!["ImageTag".to_string()]);
}
