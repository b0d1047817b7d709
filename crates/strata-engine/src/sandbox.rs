//! Offline control planes.
//!
//! They keep one JSON record per resource on disk so `describe` survives
//! between runs, hand out deterministic identifiers and echo inputs back as
//! outputs the way real providers do. Enough to plan, apply and destroy a
//! stack without any cloud account.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use strata_domain::{Outputs, ResourceName, TypeTag};
use walkdir::WalkDir;

use crate::error::ProviderError;
use crate::providers::{ControlPlane, ResourceRequest};

const SANDBOX_ACCOUNT: &str = "000000000000";
const SANDBOX_REGION: &str = "sandbox";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    #[serde(rename = "type")]
    type_tag: String,
    inputs: Outputs,
    outputs: Outputs,
}

#[derive(Debug, Clone)]
struct RecordStore {
    provider: &'static str,
    dir: PathBuf,
}

impl RecordStore {
    const fn new(provider: &'static str, dir: PathBuf) -> Self {
        Self { provider, dir }
    }

    fn path(&self, type_tag: &TypeTag, name: &ResourceName) -> PathBuf {
        let kind = type_tag.kind().replace('/', "_");
        self.dir.join(kind).join(format!("{name}.json"))
    }

    fn read(&self, type_tag: &TypeTag, name: &ResourceName) -> Result<Option<Record>, ProviderError> {
        let path = self.path(type_tag, name);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|error| {
                ProviderError::non_transient(
                    self.provider,
                    format!("corrupt record {}: {error}", path.display()),
                )
            }),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(self.io_error(&path, &error)),
        }
    }

    fn write(
        &self,
        type_tag: &TypeTag,
        name: &ResourceName,
        record: &Record,
    ) -> Result<(), ProviderError> {
        let path = self.path(type_tag, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| self.io_error(parent, &error))?;
        }
        let payload = serde_json::to_vec_pretty(record).map_err(|error| {
            ProviderError::non_transient(self.provider, format!("failed to encode record: {error}"))
        })?;
        fs::write(&path, payload).map_err(|error| self.io_error(&path, &error))
    }

    fn remove(&self, type_tag: &TypeTag, name: &ResourceName) -> Result<(), ProviderError> {
        let path = self.path(type_tag, name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(self.io_error(&path, &error)),
        }
    }

    fn io_error(&self, path: &Path, error: &io::Error) -> ProviderError {
        let message = format!("{}: {error}", path.display());
        match error.kind() {
            ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                ProviderError::transient(self.provider, message)
            }
            _ => ProviderError::non_transient(self.provider, message),
        }
    }

    /// Shared create/update/delete/describe flow; `derive` adds the
    /// provider-specific outputs on top of the echoed inputs.
    fn create(
        &self,
        request: &ResourceRequest,
        derive: impl Fn(&ResourceRequest, Option<&Outputs>) -> Result<Outputs, ProviderError>,
    ) -> Result<Outputs, ProviderError> {
        if let Some(existing) = self.read(&request.type_tag, &request.name)? {
            if existing.inputs == request.inputs {
                return Ok(existing.outputs);
            }
            return Err(ProviderError::non_transient(
                self.provider,
                format!("{} {} already exists", request.type_tag, request.name),
            ));
        }
        let outputs = derive(request, None)?;
        self.write(
            &request.type_tag,
            &request.name,
            &Record {
                type_tag: request.type_tag.to_string(),
                inputs: request.inputs.clone(),
                outputs: outputs.clone(),
            },
        )?;
        Ok(outputs)
    }

    fn update(
        &self,
        request: &ResourceRequest,
        derive: impl Fn(&ResourceRequest, Option<&Outputs>) -> Result<Outputs, ProviderError>,
    ) -> Result<Outputs, ProviderError> {
        let Some(existing) = self.read(&request.type_tag, &request.name)? else {
            return Err(ProviderError::non_transient(
                self.provider,
                format!("{} {} does not exist", request.type_tag, request.name),
            ));
        };
        let outputs = derive(request, Some(&existing.outputs))?;
        self.write(
            &request.type_tag,
            &request.name,
            &Record {
                type_tag: request.type_tag.to_string(),
                inputs: request.inputs.clone(),
                outputs: outputs.clone(),
            },
        )?;
        Ok(outputs)
    }

    fn describe(
        &self,
        name: &ResourceName,
        type_tag: &TypeTag,
    ) -> Result<Option<Outputs>, ProviderError> {
        Ok(self.read(type_tag, name)?.map(|record| record.outputs))
    }
}

fn short_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..8].to_string()
}

/// Physical id seed: changes whenever inputs change, so a replacement gets a
/// fresh identity while an in-place update keeps the old one.
fn identity_hash(request: &ResourceRequest) -> String {
    let inputs = serde_json::to_string(&request.inputs).unwrap_or_default();
    short_hash(&[request.type_tag.as_str(), request.name.as_str(), &inputs])
}

fn keep_or(current: Option<&Outputs>, key: &str, fresh: Value) -> Value {
    current
        .and_then(|outputs| outputs.get(key))
        .cloned()
        .unwrap_or(fresh)
}

fn input_str<'a>(request: &'a ResourceRequest, key: &str) -> Option<&'a str> {
    request.inputs.get(key).and_then(Value::as_str)
}

/// `aws:*` resources.
#[derive(Debug, Clone)]
pub struct SandboxCloud {
    store: RecordStore,
}

impl SandboxCloud {
    #[must_use]
    pub const fn new(dir: PathBuf) -> Self {
        Self {
            store: RecordStore::new("sandbox-aws", dir),
        }
    }

    fn derive(request: &ResourceRequest, current: Option<&Outputs>) -> Result<Outputs, ProviderError> {
        let hash = identity_hash(request);
        let kind = request.type_tag.kind();
        let (service, resource_kind) = kind.split_once('/').unwrap_or((kind, kind));
        let name = request.name.as_str();

        let mut outputs = request.inputs.clone();
        let id = keep_or(current, "id", json!(format!("{name}-{hash}")));
        outputs.insert("id".to_string(), id);
        outputs.insert(
            "arn".to_string(),
            keep_or(
                current,
                "arn",
                json!(format!(
                    "arn:aws:{service}:{SANDBOX_REGION}:{SANDBOX_ACCOUNT}:{resource_kind}/{name}-{hash}"
                )),
            ),
        );

        match kind {
            "ec2/vpc" => {
                let vpc_id = keep_or(current, "vpc_id", json!(format!("vpc-{hash}")));
                outputs.insert("vpc_id".to_string(), vpc_id);
                outputs.insert(
                    "public_subnet_ids".to_string(),
                    json!([format!("subnet-{hash}-public-a"), format!("subnet-{hash}-public-b")]),
                );
                outputs.insert(
                    "private_subnet_ids".to_string(),
                    json!([format!("subnet-{hash}-private-a"), format!("subnet-{hash}-private-b")]),
                );
            }
            "ecr/repository" => {
                let url = keep_or(
                    current,
                    "url",
                    json!(format!(
                        "{SANDBOX_ACCOUNT}.dkr.ecr.{SANDBOX_REGION}.amazonaws.com/{name}-{hash}"
                    )),
                );
                outputs.insert("url".to_string(), url);
            }
            "lb/application_load_balancer" => {
                let dns_name = keep_or(
                    current,
                    "dns_name",
                    json!(format!("{name}-{hash}.{SANDBOX_REGION}.elb.amazonaws.com")),
                );
                outputs.insert("dns_name".to_string(), dns_name);
            }
            "eks/cluster" => {
                let endpoint = format!("https://{hash}.eks.{SANDBOX_REGION}.amazonaws.com");
                outputs.insert(
                    "kubeconfig".to_string(),
                    json!({
                        "apiVersion": "v1",
                        "clusters": [{ "name": name, "cluster": { "server": endpoint } }],
                        "current-context": name,
                    }),
                );
                outputs.insert("endpoint".to_string(), json!(endpoint));
            }
            "ecs/fargate_service" => {
                if input_str(request, "cluster").is_none() {
                    return Err(ProviderError::non_transient(
                        "sandbox-aws",
                        format!("{name}: fargate service requires a cluster"),
                    ));
                }
                outputs.insert("service_name".to_string(), json!(format!("{name}-{hash}")));
            }
            _ => {}
        }

        Ok(outputs)
    }
}

impl ControlPlane for SandboxCloud {
    fn name(&self) -> &'static str {
        self.store.provider
    }

    fn handles(&self, type_tag: &TypeTag) -> bool {
        type_tag.provider() == "aws"
    }

    fn create(&self, request: &ResourceRequest) -> Result<Outputs, ProviderError> {
        self.store.create(request, Self::derive)
    }

    fn update(&self, request: &ResourceRequest, _current: &Outputs) -> Result<Outputs, ProviderError> {
        self.store.update(request, Self::derive)
    }

    fn delete(
        &self,
        name: &ResourceName,
        type_tag: &TypeTag,
        _current: &Outputs,
    ) -> Result<(), ProviderError> {
        self.store.remove(type_tag, name)
    }

    fn describe(
        &self,
        name: &ResourceName,
        type_tag: &TypeTag,
    ) -> Result<Option<Outputs>, ProviderError> {
        self.store.describe(name, type_tag)
    }

    fn requires_replacement(&self, type_tag: &TypeTag, changed: &[&str]) -> bool {
        let immutable: &[&str] = match type_tag.kind() {
            "ec2/vpc" => &["cidr_block"],
            "ecr/repository" => &["name"],
            "eks/cluster" => &["vpc_id", "public_subnet_ids", "private_subnet_ids"],
            _ => &[],
        };
        changed.iter().any(|property| immutable.contains(property))
    }
}

/// `k8s:*` resources (deployments, services, providers).
#[derive(Debug, Clone)]
pub struct SandboxCluster {
    store: RecordStore,
}

impl SandboxCluster {
    #[must_use]
    pub const fn new(dir: PathBuf) -> Self {
        Self {
            store: RecordStore::new("sandbox-k8s", dir),
        }
    }

    fn derive(request: &ResourceRequest, current: Option<&Outputs>) -> Result<Outputs, ProviderError> {
        let hash = identity_hash(request);
        let name = request.name.as_str();
        let mut outputs = request.inputs.clone();
        outputs.insert(
            "uid".to_string(),
            keep_or(current, "uid", json!(format!("{hash}-{name}"))),
        );

        if request.type_tag.kind() == "core/v1/service" {
            let is_load_balancer = request
                .inputs
                .get("spec")
                .and_then(|spec| spec.get("type"))
                .and_then(Value::as_str)
                == Some("LoadBalancer");
            if is_load_balancer {
                outputs.insert(
                    "hostname".to_string(),
                    keep_or(
                        current,
                        "hostname",
                        json!(format!("{name}-{hash}.{SANDBOX_REGION}.elb.amazonaws.com")),
                    ),
                );
            }
        }

        Ok(outputs)
    }
}

impl ControlPlane for SandboxCluster {
    fn name(&self) -> &'static str {
        self.store.provider
    }

    fn handles(&self, type_tag: &TypeTag) -> bool {
        type_tag.provider() == "k8s"
    }

    fn create(&self, request: &ResourceRequest) -> Result<Outputs, ProviderError> {
        self.store.create(request, Self::derive)
    }

    fn update(&self, request: &ResourceRequest, _current: &Outputs) -> Result<Outputs, ProviderError> {
        self.store.update(request, Self::derive)
    }

    fn delete(
        &self,
        name: &ResourceName,
        type_tag: &TypeTag,
        _current: &Outputs,
    ) -> Result<(), ProviderError> {
        self.store.remove(type_tag, name)
    }

    fn describe(
        &self,
        name: &ResourceName,
        type_tag: &TypeTag,
    ) -> Result<Option<Outputs>, ProviderError> {
        self.store.describe(name, type_tag)
    }
}

/// `registry:image`: resolves a build context to a content-addressed image
/// reference inside a repository.
#[derive(Debug, Clone)]
pub struct SandboxRegistry {
    store: RecordStore,
}

impl SandboxRegistry {
    #[must_use]
    pub const fn new(dir: PathBuf) -> Self {
        Self {
            store: RecordStore::new("sandbox-registry", dir),
        }
    }

    fn derive(request: &ResourceRequest, _current: Option<&Outputs>) -> Result<Outputs, ProviderError> {
        let provider = "sandbox-registry";
        let Some(repository_url) = input_str(request, "repository_url") else {
            return Err(ProviderError::non_transient(
                provider,
                format!("{}: repository_url is required", request.name),
            ));
        };
        let Some(context) = input_str(request, "context") else {
            return Err(ProviderError::non_transient(
                provider,
                format!("{}: context is required", request.name),
            ));
        };

        let context_path = Path::new(context);
        if !context_path.is_dir() {
            return Err(ProviderError::non_transient(
                provider,
                format!("{}: build context does not exist: {context}", request.name),
            ));
        }
        let digest = hash_directory(context_path).map_err(|error| {
            ProviderError::non_transient(
                provider,
                format!("{}: failed to hash build context {context}: {error}", request.name),
            )
        })?;

        let mut outputs = request.inputs.clone();
        outputs.insert(
            "image_uri".to_string(),
            json!(format!("{repository_url}@sha256:{digest}")),
        );
        outputs.insert("digest".to_string(), json!(format!("sha256:{digest}")));
        Ok(outputs)
    }
}

impl ControlPlane for SandboxRegistry {
    fn name(&self) -> &'static str {
        self.store.provider
    }

    fn handles(&self, type_tag: &TypeTag) -> bool {
        type_tag.as_str() == "registry:image"
    }

    fn create(&self, request: &ResourceRequest) -> Result<Outputs, ProviderError> {
        // Pushing the same context twice is not a conflict.
        let outputs = Self::derive(request, None)?;
        self.store.write(
            &request.type_tag,
            &request.name,
            &Record {
                type_tag: request.type_tag.to_string(),
                inputs: request.inputs.clone(),
                outputs: outputs.clone(),
            },
        )?;
        Ok(outputs)
    }

    fn update(&self, request: &ResourceRequest, _current: &Outputs) -> Result<Outputs, ProviderError> {
        self.store.update(request, Self::derive)
    }

    fn delete(
        &self,
        name: &ResourceName,
        type_tag: &TypeTag,
        _current: &Outputs,
    ) -> Result<(), ProviderError> {
        self.store.remove(type_tag, name)
    }

    fn describe(
        &self,
        name: &ResourceName,
        type_tag: &TypeTag,
    ) -> Result<Option<Outputs>, ProviderError> {
        self.store.describe(name, type_tag)
    }
}

/// Digest of every file below `root`: relative path and contents, visited in
/// a stable order.
pub fn hash_directory(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        hasher.update(relative.to_string_lossy().replace('\\', "/").as_bytes());
        hasher.update([0u8]);
        hasher.update(fs::read(entry.path())?);
        hasher.update([0u8]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::fs;

    use serde_json::json;
    use strata_domain::{Outputs, ResourceName, TypeTag};

    use super::{SandboxCloud, SandboxRegistry, hash_directory};
    use crate::providers::{ControlPlane, ResourceRequest};

    fn request(name: &str, tag: &str, inputs: Outputs) -> ResourceRequest {
        ResourceRequest {
            name: ResourceName::try_from(name).expect("name"),
            type_tag: TypeTag::try_from(tag).expect("tag"),
            inputs,
        }
    }

    fn inputs(pairs: &[(&str, serde_json::Value)]) -> Outputs {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn cloud_records_survive_between_instances() {
        let temp = tempfile::tempdir().expect("tempdir");
        let vpc = request(
            "eks-vpc",
            "aws:ec2/vpc",
            inputs(&[("cidr_block", json!("10.0.0.0/16"))]),
        );

        let created = SandboxCloud::new(temp.path().to_path_buf())
            .create(&vpc)
            .expect("create");
        assert!(created.contains_key("vpc_id"));
        assert_eq!(created.get("cidr_block"), Some(&json!("10.0.0.0/16")));

        let again = SandboxCloud::new(temp.path().to_path_buf());
        let described = again
            .describe(&vpc.name, &vpc.type_tag)
            .expect("describe")
            .expect("record exists");
        assert_eq!(described, created);

        again
            .delete(&vpc.name, &vpc.type_tag, &described)
            .expect("delete");
        assert!(
            again
                .describe(&vpc.name, &vpc.type_tag)
                .expect("describe")
                .is_none()
        );
    }

    #[test]
    fn cloud_update_keeps_identity() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cloud = SandboxCloud::new(temp.path().to_path_buf());
        let lb = request("loadbalancer", "aws:lb/application_load_balancer", inputs(&[]));
        let created = cloud.create(&lb).expect("create");

        let changed = request(
            "loadbalancer",
            "aws:lb/application_load_balancer",
            inputs(&[("tags", json!({ "Owner": "SREs" }))]),
        );
        let updated = cloud.update(&changed, &created).expect("update");
        assert_eq!(updated.get("arn"), created.get("arn"));
        assert_eq!(updated.get("dns_name"), created.get("dns_name"));
        assert_eq!(updated.get("tags"), Some(&json!({ "Owner": "SREs" })));
    }

    #[test]
    fn vpc_cidr_change_requires_replacement() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cloud = SandboxCloud::new(temp.path().to_path_buf());
        let vpc = TypeTag::try_from("aws:ec2/vpc").expect("tag");
        assert!(cloud.requires_replacement(&vpc, &["cidr_block"]));
        assert!(!cloud.requires_replacement(&vpc, &["tags"]));
    }

    #[test]
    fn registry_image_uri_is_content_addressed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let context = temp.path().join("infra-web");
        fs::create_dir_all(&context).expect("mkdir");
        fs::write(context.join("Dockerfile"), "FROM nginx\n").expect("write");

        let registry = SandboxRegistry::new(temp.path().join("records"));
        let image = request(
            "web-image",
            "registry:image",
            inputs(&[
                ("repository_url", json!("registry.local/web")),
                ("context", json!(context.display().to_string())),
            ]),
        );

        let first = registry.create(&image).expect("push");
        let second = registry.create(&image).expect("push again");
        assert_eq!(first, second);
        let uri = first
            .get("image_uri")
            .and_then(serde_json::Value::as_str)
            .expect("image uri");
        assert!(uri.starts_with("registry.local/web@sha256:"));

        fs::write(context.join("Dockerfile"), "FROM nginx:alpine\n").expect("write");
        let changed = hash_directory(&context).expect("hash");
        assert!(!uri.ends_with(&changed));
    }

    #[test]
    fn registry_rejects_missing_context() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = SandboxRegistry::new(temp.path().to_path_buf());
        let image = request(
            "api-image",
            "registry:image",
            inputs(&[
                ("repository_url", json!("registry.local/api")),
                ("context", json!(temp.path().join("missing").display().to_string())),
            ]),
        );
        let error = registry.create(&image).expect_err("must fail");
        assert!(!error.is_transient());
        assert!(error.to_string().contains("build context does not exist"));
    }
}
