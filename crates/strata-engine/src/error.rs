use std::io;
use std::path::PathBuf;

use strata_domain::{DomainValidationError, OutputRef, ResourceName, TypeTag};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestEvalError {
    #[error("failed to canonicalize manifest path: {path}")]
    CanonicalizePath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("manifest path has no parent: {path}")]
    MissingManifestParent { path: PathBuf },
    #[error("failed to read manifest: {path}")]
    ReadManifest {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: {source}")]
    LuaRuntime {
        path: PathBuf,
        #[source]
        source: mlua::Error,
    },
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("stack directory does not exist: {root}")]
    RootDoesNotExist { root: PathBuf },
    #[error("stack directory must be a directory: {root}")]
    RootIsNotDirectory { root: PathBuf },
    #[error("failed while walking stack directory")]
    Walk {
        #[source]
        source: walkdir::Error,
    },
    #[error("failed to canonicalize manifest path: {path}")]
    CanonicalizePath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read stack settings: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse stack settings: {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("config override must look like key=value, got: {raw:?}")]
    InvalidOverride { raw: String },
    #[error("config value {key} must be {expected}, got: {value}")]
    WrongType {
        key: String,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("resource {name} is declared more than once")]
    DuplicateName { name: ResourceName },
    #[error("dependency graph has missing nodes:\n  - {details}")]
    MissingDependency { details: String },
    #[error("dependency cycle detected: {cycle}")]
    CycleDetected { cycle: String },
}

#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("no provider handles resource type {type_tag} (resource {resource})")]
    UnknownResourceType {
        resource: ResourceName,
        type_tag: TypeTag,
    },
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("{provider}: {message}")]
    Transient { provider: String, message: String },
    #[error("{provider}: {message}")]
    NonTransient { provider: String, message: String },
    #[error("{provider} does not support resource type {type_tag}")]
    UnsupportedType { provider: String, type_tag: TypeTag },
}

impl ProviderError {
    #[must_use]
    pub fn transient(provider: &str, message: impl Into<String>) -> Self {
        Self::Transient {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn non_transient(provider: &str, message: impl Into<String>) -> Self {
        Self::NonTransient {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Whether retrying the same call may succeed (rate limiting,
    /// eventual-consistency lag).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("output {reference} is not available yet")]
    UnresolvedOutput { reference: OutputRef },
    #[error("resource {resource} has no output property {property:?}")]
    MissingOutputProperty {
        resource: ResourceName,
        property: String,
    },
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(
        "apply aborted: {failed} operation(s) failed, {skipped} skipped, {cancelled} cancelled ({errors} error(s) reported)"
    )]
    Aborted {
        failed: usize,
        skipped: usize,
        cancelled: usize,
        errors: usize,
    },
    #[error("failed to start worker pool")]
    WorkerPool {
        #[source]
        source: rayon::ThreadPoolBuildError,
    },
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state snapshot: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode state snapshot: {path}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("state snapshot {path} has schema version {found}, newest supported is {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },
    #[error("failed to encode state snapshot")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to persist state snapshot: {path}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export {name} could not be resolved")]
    Resolve {
        name: String,
        #[source]
        source: ResolveError,
    },
    #[error("failed to render export {name}")]
    Render {
        name: String,
        #[source]
        source: tera::Error,
    },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("no manifests found under {folder} (expected files ending with .lua)")]
    NoManifests { folder: PathBuf },
    #[error(transparent)]
    ManifestEval(#[from] ManifestEvalError),
    #[error(transparent)]
    Domain(#[from] DomainValidationError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Planning(#[from] PlanningError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
}
