use std::collections::BTreeMap;

use strata_domain::{Outputs, Properties, PropertyValue, ResourceName, StateSnapshot};

use crate::error::ResolveError;

/// Source of outputs for resources whose operations have completed.
pub trait OutputLookup {
    fn outputs_of(&self, resource: &ResourceName) -> Option<&Outputs>;
}

impl OutputLookup for BTreeMap<ResourceName, Outputs> {
    fn outputs_of(&self, resource: &ResourceName) -> Option<&Outputs> {
        self.get(resource)
    }
}

impl OutputLookup for StateSnapshot {
    fn outputs_of(&self, resource: &ResourceName) -> Option<&Outputs> {
        self.resources.get(resource).map(|state| &state.outputs)
    }
}

/// Replace every pending output in `value` with its concrete value.
///
/// # Errors
///
/// Returns an error when a referenced resource has no outputs yet or lacks
/// the referenced property.
pub fn resolve_value(
    value: &PropertyValue,
    lookup: &dyn OutputLookup,
) -> Result<serde_json::Value, ResolveError> {
    match value {
        PropertyValue::Literal(literal) => Ok(literal.clone()),
        PropertyValue::PendingOutput(reference) => {
            let outputs = lookup.outputs_of(&reference.resource).ok_or_else(|| {
                ResolveError::UnresolvedOutput {
                    reference: reference.clone(),
                }
            })?;
            outputs
                .get(&reference.property)
                .cloned()
                .ok_or_else(|| ResolveError::MissingOutputProperty {
                    resource: reference.resource.clone(),
                    property: reference.property.clone(),
                })
        }
        PropertyValue::List(items) => items
            .iter()
            .map(|item| resolve_value(item, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(serde_json::Value::Array),
        PropertyValue::Map(entries) => entries
            .iter()
            .map(|(key, item)| Ok((key.clone(), resolve_value(item, lookup)?)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(serde_json::Value::Object),
    }
}

/// Resolve a whole property map into the concrete inputs sent to a provider.
///
/// # Errors
///
/// Returns the first resolution failure.
pub fn resolve_properties(
    properties: &Properties,
    lookup: &dyn OutputLookup,
) -> Result<Outputs, ResolveError> {
    properties
        .iter()
        .map(|(key, value)| Ok((key.clone(), resolve_value(value, lookup)?)))
        .collect()
}
