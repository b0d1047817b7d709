#![allow(clippy::expect_used)]

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;
use strata_domain::{OutputRef, PropertyValue, ResourceName};

use super::{evaluate_manifest, evaluate_many};
use crate::context::StackContext;
use crate::error::ManifestEvalError;

fn context(root: &Path) -> StackContext {
    let mut context = StackContext::new("weather", "dev", root.to_path_buf());
    context
        .config
        .set_override("containerPort=8080")
        .expect("override");
    context
}

fn write_manifest(dir: &Path, file: &str, script: &str) -> std::path::PathBuf {
    let path = dir.join(file);
    fs::write(&path, script).expect("write manifest");
    path
}

fn reference(resource: &str, property: &str) -> PropertyValue {
    PropertyValue::from(
        OutputRef::new(
            ResourceName::try_from(resource).expect("name"),
            property.to_string(),
        )
        .expect("ref"),
    )
}

fn unique_missing_env_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be monotonic")
        .as_nanos();
    format!("STRATA_MISSING_ENV_{nanos}")
}

#[test]
fn collects_resources_with_references_and_dependencies() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_manifest(
        temp.path(),
        "main.lua",
        r#"
local repo = resource("web-repo", "aws:ecr/repository", { name = "web" })
local image = resource("web-image", "registry:image", {
  repository_url = repo.url,
  context = path("../infra-web"),
})
local cluster = resource("cluster", "aws:ecs/cluster", { tags = tags({ Owner = "SREs" }) })
resource("app-service", "aws:ecs/fargate_service", {
  cluster = cluster.arn,
  containers = {
    { name = "web", image = image.image_uri, port = config_int("containerPort", 80) },
  },
}, { depends_on = { cluster, "web-repo" } })
"#,
    );

    let manifest = evaluate_manifest(&path, &context(temp.path())).expect("eval");
    assert_eq!(manifest.resources.len(), 4);

    let image = &manifest.resources[1];
    assert_eq!(image.type_tag.as_str(), "registry:image");
    assert_eq!(
        image.properties.get("repository_url"),
        Some(&reference("web-repo", "url"))
    );
    let expected_context = fs::canonicalize(temp.path())
        .expect("canonicalize")
        .parent()
        .expect("parent")
        .join("infra-web");
    assert_eq!(
        image.properties.get("context"),
        Some(&PropertyValue::literal(
            expected_context.to_string_lossy().into_owned()
        ))
    );

    let cluster = &manifest.resources[2];
    assert_eq!(
        cluster.properties.get("tags"),
        Some(&PropertyValue::literal(json!({
            "Owner": "SREs",
            "Project": "weather",
            "Stack": "dev",
        })))
    );

    let service = &manifest.resources[3];
    assert_eq!(
        service
            .depends_on
            .iter()
            .map(ResourceName::as_str)
            .collect::<Vec<_>>(),
        vec!["cluster", "web-repo"]
    );
    match service.properties.get("containers") {
        Some(PropertyValue::List(items)) => match &items[0] {
            PropertyValue::Map(container) => {
                assert_eq!(
                    container.get("image"),
                    Some(&reference("web-image", "image_uri"))
                );
                assert_eq!(container.get("port"), Some(&PropertyValue::literal(8080)));
            }
            other => unreachable!("expected container map, got {other:?}"),
        },
        other => unreachable!("expected container list, got {other:?}"),
    }
    assert!(service.source.is_some());
}

#[test]
fn ref_builds_cross_manifest_references() {
    let temp = tempfile::tempdir().expect("tempdir");
    let network = write_manifest(
        temp.path(),
        "10-network.lua",
        r#"resource("eks-vpc", "aws:ec2/vpc", { cidr_block = config_string("vpcNetworkCidr", "10.0.0.0/16") })"#,
    );
    let cluster = write_manifest(
        temp.path(),
        "20-cluster.lua",
        r#"resource("eks-cluster", "aws:eks/cluster", { vpc_id = ref("eks-vpc", "vpc_id") })"#,
    );

    let manifest =
        evaluate_many(&[network, cluster], &context(temp.path())).expect("eval");
    assert_eq!(manifest.resources.len(), 2);
    assert_eq!(
        manifest.resources[0].properties.get("cidr_block"),
        Some(&PropertyValue::literal("10.0.0.0/16"))
    );
    assert_eq!(
        manifest.resources[1].properties.get("vpc_id"),
        Some(&reference("eks-vpc", "vpc_id"))
    );
}

#[test]
fn exports_keep_templates_and_references() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_manifest(
        temp.path(),
        "main.lua",
        r#"
local lb = resource("loadbalancer", "aws:lb/application_load_balancer")
export("url", "http://{{ resources.loadbalancer.dns_name }}")
export("dns", lb.dns_name)
export("stack", stack() .. "/" .. project())
"#,
    );

    let manifest = evaluate_manifest(&path, &context(temp.path())).expect("eval");
    assert_eq!(
        manifest.exports.get("url"),
        Some(&PropertyValue::literal(
            "http://{{ resources.loadbalancer.dns_name }}"
        ))
    );
    assert_eq!(
        manifest.exports.get("dns"),
        Some(&reference("loadbalancer", "dns_name"))
    );
    assert_eq!(
        manifest.exports.get("stack"),
        Some(&PropertyValue::literal("dev/weather"))
    );
}

#[test]
fn env_values_are_marked_sensitive() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_manifest(
        temp.path(),
        "main.lua",
        r#"resource("db", "aws:rds/instance", { password = env("PATH") })"#,
    );

    let manifest = evaluate_manifest(&path, &context(temp.path())).expect("eval");
    let value = std::env::var("PATH").expect("PATH should be set");
    assert!(manifest.sensitive.contains(&value));
}

#[test]
fn missing_env_is_an_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let missing = unique_missing_env_name();
    let path = write_manifest(
        temp.path(),
        "main.lua",
        &format!(r#"resource("db", "aws:rds/instance", {{ password = env("{missing}") }})"#),
    );

    let error = evaluate_manifest(&path, &context(temp.path())).expect_err("must fail");
    assert!(matches!(error, ManifestEvalError::LuaRuntime { .. }));
    assert!(error.to_string().contains(&missing));
}

#[test]
fn invalid_names_and_types_are_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    for script in [
        r#"resource("web.repo", "aws:ecr/repository")"#,
        r#"resource("web-repo", "repository")"#,
        r#"resource("web-repo", "aws:ecr/repository", { x = function() end })"#,
    ] {
        let path = write_manifest(temp.path(), "main.lua", script);
        let error = evaluate_manifest(&path, &context(temp.path())).expect_err(script);
        assert!(matches!(error, ManifestEvalError::LuaRuntime { .. }), "{script}");
    }
}

#[test]
fn handle_used_as_value_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_manifest(
        temp.path(),
        "main.lua",
        r#"
local vpc = resource("vpc", "aws:ec2/vpc")
resource("cluster", "aws:eks/cluster", { vpc = vpc })
"#,
    );
    let error = evaluate_manifest(&path, &context(temp.path())).expect_err("must fail");
    let mut full = error.to_string();
    let mut current: &dyn std::error::Error = &error;
    while let Some(source) = current.source() {
        full.push_str(": ");
        full.push_str(&source.to_string());
        current = source;
    }
    assert!(full.contains("vpc.id"), "unexpected error chain: {full}");
}

#[test]
fn unsafe_stdlib_is_unavailable() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_manifest(temp.path(), "main.lua", r#"os.execute("true")"#);
    assert!(evaluate_manifest(&path, &context(temp.path())).is_err());
}

#[test]
fn wrong_config_type_surfaces_as_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut context = context(temp.path());
    context.config.set_override("cpu=lots").expect("override");
    let path = write_manifest(
        temp.path(),
        "main.lua",
        r#"resource("task", "aws:ecs/task", { cpu = config_int("cpu", 512) })"#,
    );
    let error = evaluate_manifest(&path, &context).expect_err("must fail");
    assert!(error.to_string().contains("cpu must be an integer"));
}
