use std::collections::BTreeMap;

use serde_json::Value;
use strata_domain::{PropertyValue, StateSnapshot};

use crate::context::StackContext;
use crate::error::ExportError;
use crate::resolve::resolve_value;

/// Resolve stack exports against applied outputs.
///
/// References are replaced by the referenced output; string values that
/// contain template markup are rendered with tera against
/// `{ resources: { <name>: <outputs> }, project, stack }`.
///
/// # Errors
///
/// Returns an error when a referenced output is missing or a template fails
/// to render.
pub fn render_exports(
    exports: &BTreeMap<String, PropertyValue>,
    snapshot: &StateSnapshot,
    context: &StackContext,
) -> Result<BTreeMap<String, Value>, ExportError> {
    let resources: BTreeMap<&str, &strata_domain::Outputs> = snapshot
        .resources
        .iter()
        .map(|(name, state)| (name.as_str(), &state.outputs))
        .collect();

    let mut tera_context = tera::Context::new();
    tera_context.insert("resources", &resources);
    tera_context.insert("project", &context.project);
    tera_context.insert("stack", &context.stack);

    exports
        .iter()
        .map(|(name, value)| {
            let resolved = resolve_value(value, snapshot).map_err(|source| ExportError::Resolve {
                name: name.clone(),
                source,
            })?;
            let rendered = render_value(resolved, &tera_context).map_err(|source| {
                ExportError::Render {
                    name: name.clone(),
                    source,
                }
            })?;
            Ok((name.clone(), rendered))
        })
        .collect()
}

fn render_value(value: Value, context: &tera::Context) -> tera::Result<Value> {
    match value {
        Value::String(text) if is_template(&text) => {
            tera::Tera::one_off(&text, context, false).map(Value::String)
        }
        Value::Array(items) => items
            .into_iter()
            .map(|item| render_value(item, context))
            .collect::<tera::Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(entries) => entries
            .into_iter()
            .map(|(key, item)| Ok((key, render_value(item, context)?)))
            .collect::<tera::Result<serde_json::Map<_, _>>>()
            .map(Value::Object),
        other => Ok(other),
    }
}

fn is_template(text: &str) -> bool {
    text.contains("{{") || text.contains("{%")
}
