use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schema version written into every persisted snapshot.
pub const SNAPSHOT_VERSION: u32 = 1;

pub type Outputs = BTreeMap<String, serde_json::Value>;
pub type Properties = BTreeMap<String, PropertyValue>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainValidationError {
    #[error("resource name must not be empty")]
    EmptyResourceName,
    #[error("resource name must not contain whitespace or '.': {name:?}")]
    InvalidResourceName { name: String },
    #[error("type tag must look like provider:module/kind, got: {tag:?}")]
    InvalidTypeTag { tag: String },
    #[error("output property name must not be empty (resource {resource})")]
    EmptyOutputProperty { resource: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceName(String);

impl ResourceName {
    /// Create a logical resource name, rejecting blank names and names that
    /// would be ambiguous inside a `resource.property` reference.
    ///
    /// # Errors
    ///
    /// Returns an error when `name` is empty or contains whitespace or `.`.
    pub fn new(name: String) -> Result<Self, DomainValidationError> {
        if name.trim().is_empty() {
            return Err(DomainValidationError::EmptyResourceName);
        }
        if name.chars().any(|c| c.is_whitespace() || c == '.') {
            return Err(DomainValidationError::InvalidResourceName { name });
        }
        Ok(Self(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ResourceName {
    type Error = DomainValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ResourceName {
    type Error = DomainValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.to_string())
    }
}

impl Borrow<str> for ResourceName {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for ResourceName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for ResourceName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(formatter)
    }
}

impl From<ResourceName> for String {
    fn from(value: ResourceName) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TypeTag(String);

impl TypeTag {
    /// Create a resource type tag such as `aws:ecs/cluster`.
    ///
    /// # Errors
    ///
    /// Returns an error when the tag has no `provider:` prefix, an empty
    /// kind, or contains whitespace.
    pub fn new(tag: String) -> Result<Self, DomainValidationError> {
        let valid = match tag.split_once(':') {
            Some((provider, kind)) => {
                !provider.is_empty()
                    && !kind.is_empty()
                    && !tag.chars().any(char::is_whitespace)
            }
            None => false,
        };
        if valid {
            Ok(Self(tag))
        } else {
            Err(DomainValidationError::InvalidTypeTag { tag })
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The provider namespace, e.g. `aws` for `aws:ecs/cluster`.
    #[must_use]
    pub fn provider(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(p, _)| p)
    }

    /// Everything after the provider namespace, e.g. `ecs/cluster`.
    #[must_use]
    pub fn kind(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, kind)| kind)
    }
}

impl TryFrom<String> for TypeTag {
    type Error = DomainValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for TypeTag {
    type Error = DomainValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.to_string())
    }
}

impl Deref for TypeTag {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(formatter)
    }
}

impl From<TypeTag> for String {
    fn from(value: TypeTag) -> Self {
        value.0
    }
}

/// Placeholder for output `property` of `resource`, known only after that
/// resource has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct OutputRef {
    pub resource: ResourceName,
    pub property: String,
}

impl OutputRef {
    /// # Errors
    ///
    /// Returns an error when `property` is blank.
    pub fn new(resource: ResourceName, property: String) -> Result<Self, DomainValidationError> {
        if property.trim().is_empty() {
            return Err(DomainValidationError::EmptyOutputProperty {
                resource: resource.into(),
            });
        }
        Ok(Self { resource, property })
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}.{}", self.resource, self.property)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    Literal(serde_json::Value),
    PendingOutput(OutputRef),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    #[must_use]
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Self::Literal(value.into())
    }

    /// All output references contained in this value, depth first.
    #[must_use]
    pub fn references(&self) -> Vec<&OutputRef> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a OutputRef>) {
        match self {
            Self::Literal(_) => {}
            Self::PendingOutput(reference) => out.push(reference),
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(out);
                }
            }
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => write!(formatter, "{value}"),
            Self::PendingOutput(reference) => write!(formatter, "<{reference}>"),
            Self::List(items) => {
                formatter.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        formatter.write_str(", ")?;
                    }
                    item.fmt(formatter)?;
                }
                formatter.write_str("]")
            }
            Self::Map(entries) => {
                formatter.write_str("{")?;
                for (index, (key, value)) in entries.iter().enumerate() {
                    if index > 0 {
                        formatter.write_str(", ")?;
                    }
                    write!(formatter, "{key}: {value}")?;
                }
                formatter.write_str("}")
            }
        }
    }
}

impl From<OutputRef> for PropertyValue {
    fn from(value: OutputRef) -> Self {
        Self::PendingOutput(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: ResourceName,
    #[serde(rename = "type")]
    pub type_tag: TypeTag,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<ResourceName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

impl ResourceSpec {
    #[must_use]
    pub const fn new(name: ResourceName, type_tag: TypeTag) -> Self {
        Self {
            name,
            type_tag,
            properties: BTreeMap::new(),
            depends_on: Vec::new(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_dependency(mut self, dependency: ResourceName) -> Self {
        self.depends_on.push(dependency);
        self
    }

    /// Every output reference used anywhere in the properties.
    #[must_use]
    pub fn references(&self) -> Vec<&OutputRef> {
        self.properties
            .values()
            .flat_map(PropertyValue::references)
            .collect()
    }

    /// Compare desired state, ignoring where the spec was declared.
    #[must_use]
    pub fn same_desired_state(&self, other: &Self) -> bool {
        self.name == other.name
            && self.type_tag == other.type_tag
            && self.properties == other.properties
            && sorted_names(&self.depends_on) == sorted_names(&other.depends_on)
    }
}

fn sorted_names(names: &[ResourceName]) -> Vec<&ResourceName> {
    let mut sorted: Vec<_> = names.iter().collect();
    sorted.sort();
    sorted.dedup();
    sorted
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Create,
    Update,
    Replace,
    Delete,
    NoOp,
}

impl PlanAction {
    #[must_use]
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::NoOp)
    }
}

impl fmt::Display for PlanAction {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDiff {
    pub property: String,
    pub before: Option<PropertyValue>,
    pub after: Option<PropertyValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedOperation {
    pub id: usize,
    pub resource: ResourceName,
    #[serde(rename = "type")]
    pub type_tag: TypeTag,
    pub action: PlanAction,
    pub diff: Vec<PropertyDiff>,
    /// Ids of operations that must succeed before this one may start.
    pub depends_on: Vec<usize>,
    /// Replacements only: ids of operations that must remove their old
    /// instance before this one deletes its own.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teardown_after: Vec<usize>,
    /// Desired spec; `None` for deletes.
    pub spec: Option<ResourceSpec>,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanReport {
    pub stack: String,
    pub operations: Vec<PlannedOperation>,
    pub warnings: Vec<String>,
}

impl PlanReport {
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.operations.iter().any(|op| op.action.is_change())
    }

    #[must_use]
    pub fn operation(&self, id: usize) -> Option<&PlannedOperation> {
        self.operations.iter().find(|op| op.id == id)
    }

    #[must_use]
    pub fn actions(&self) -> Vec<(PlanAction, &str)> {
        self.operations
            .iter()
            .map(|op| (op.action, op.resource.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OperationOutcome {
    Created,
    Updated,
    Replaced,
    Deleted,
    Unchanged,
    Failed { error: String, transient: bool },
    Skipped { reason: String },
    Cancelled,
}

impl OperationOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(
            self,
            Self::Failed { .. } | Self::Skipped { .. } | Self::Cancelled
        )
    }

    #[must_use]
    pub const fn is_change(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Replaced | Self::Deleted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation_id: usize,
    pub resource: ResourceName,
    pub action: PlanAction,
    #[serde(flatten)]
    pub outcome: OperationOutcome,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub plan: PlanReport,
    pub results: Vec<OperationResult>,
    pub errors: Vec<String>,
}

impl ApplyReport {
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty() || self.results.iter().any(|r| !r.outcome.is_success())
    }

    #[must_use]
    pub fn result_for(&self, resource: &str) -> Option<&OperationResult> {
        self.results.iter().find(|r| r.resource.as_str() == resource)
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, OperationOutcome::Failed { .. }))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub spec: ResourceSpec,
    /// Property values as sent to the provider, references resolved.
    #[serde(default)]
    pub inputs: Outputs,
    #[serde(default)]
    pub outputs: Outputs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub stack: String,
    #[serde(default)]
    pub resources: BTreeMap<ResourceName, ResourceState>,
    #[serde(default)]
    pub exports: BTreeMap<String, serde_json::Value>,
}

impl StateSnapshot {
    #[must_use]
    pub fn empty(stack: impl Into<String>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            stack: stack.into(),
            resources: BTreeMap::new(),
            exports: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }

    #[must_use]
    pub fn outputs_of(&self, name: &str) -> Option<&Outputs> {
        self.get(name).map(|state| &state.outputs)
    }
}
