use std::path::Path;

use strata_domain::{Outputs, ResourceName, TypeTag};

use crate::error::ProviderError;
use crate::sandbox::{SandboxCloud, SandboxCluster, SandboxRegistry};

/// A resource as handed to a control plane: every reference resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub name: ResourceName,
    pub type_tag: TypeTag,
    pub inputs: Outputs,
}

/// Narrow interface to an external control plane (cloud API, container
/// registry, cluster API). Calls must be safe to retry.
pub trait ControlPlane: Send + Sync {
    fn name(&self) -> &'static str;

    fn handles(&self, type_tag: &TypeTag) -> bool;

    /// # Errors
    ///
    /// Returns a transient or non-transient provider error.
    fn create(&self, request: &ResourceRequest) -> Result<Outputs, ProviderError>;

    /// # Errors
    ///
    /// Returns a transient or non-transient provider error.
    fn update(&self, request: &ResourceRequest, current: &Outputs)
    -> Result<Outputs, ProviderError>;

    /// # Errors
    ///
    /// Returns a transient or non-transient provider error.
    fn delete(
        &self,
        name: &ResourceName,
        type_tag: &TypeTag,
        current: &Outputs,
    ) -> Result<(), ProviderError>;

    /// Look up a resource by logical name; `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns a transient or non-transient provider error.
    fn describe(
        &self,
        name: &ResourceName,
        type_tag: &TypeTag,
    ) -> Result<Option<Outputs>, ProviderError>;

    /// Whether changing any of `changed` forces delete-then-create.
    fn requires_replacement(&self, _type_tag: &TypeTag, _changed: &[&str]) -> bool {
        false
    }
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Box<dyn ControlPlane>>,
}

impl ProviderRegistry {
    /// Offline providers that keep their physical records under `root`.
    #[must_use]
    pub fn sandbox(root: &Path) -> Self {
        Self {
            providers: vec![
                Box::new(SandboxCloud::new(root.join("aws"))),
                Box::new(SandboxRegistry::new(root.join("registry"))),
                Box::new(SandboxCluster::new(root.join("k8s"))),
            ],
        }
    }

    #[must_use]
    pub fn from_providers(providers: Vec<Box<dyn ControlPlane>>) -> Self {
        Self { providers }
    }

    #[must_use]
    pub fn supported_names(&self) -> Vec<&'static str> {
        self.providers
            .iter()
            .map(|provider| provider.name())
            .collect()
    }

    /// The first registered provider that handles `type_tag`.
    #[must_use]
    pub fn select(&self, type_tag: &TypeTag) -> Option<&dyn ControlPlane> {
        self.providers
            .iter()
            .find(|provider| provider.handles(type_tag))
            .map(std::ops::Deref::deref)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ProviderRegistry")
            .field("providers", &self.supported_names())
            .finish()
    }
}
