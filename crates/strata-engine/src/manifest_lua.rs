use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlua::{
    Error as LuaError, Lua, MetaMethod, MultiValue, Result as LuaResult, Table, UserData,
    UserDataMethods, Value,
};
use strata_domain::{OutputRef, PropertyValue, ResourceName, ResourceSpec, TypeTag};
use tracing::debug;

use crate::context::StackContext;
use crate::error::ManifestEvalError;
use crate::fs_util::resolve_manifest_relative;

/// Nesting limit for property tables; also stops self-referencing tables.
const MAX_PROPERTY_DEPTH: usize = 32;

/// Everything declared by one or more manifests of a stack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackManifest {
    pub resources: Vec<ResourceSpec>,
    pub exports: BTreeMap<String, PropertyValue>,
    pub warnings: Vec<String>,
    /// Values read through `env()`; redacted from rendered output.
    pub sensitive: BTreeSet<String>,
}

impl StackManifest {
    fn merge(&mut self, other: Self) {
        for (name, value) in other.exports {
            if self.exports.insert(name.clone(), value).is_some() {
                self.warnings
                    .push(format!("export {name} is declared more than once; last one wins"));
            }
        }
        self.resources.extend(other.resources);
        self.warnings.extend(other.warnings);
        self.sensitive.extend(other.sensitive);
    }
}

/// Handle returned by `resource()`; indexing it yields an output reference.
#[derive(Debug, Clone)]
struct ResourceHandle {
    name: ResourceName,
}

impl UserData for ResourceHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |_, this, property: String| {
            OutputRef::new(this.name.clone(), property)
                .map(LuaOutputRef)
                .map_err(LuaError::external)
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.name.to_string()));
    }
}

#[derive(Debug, Clone)]
struct LuaOutputRef(OutputRef);

impl UserData for LuaOutputRef {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(format!("<{}>", this.0)));
    }
}

fn runtime_error(message: impl Into<String>) -> LuaError {
    LuaError::RuntimeError(message.into())
}

fn collapse_list(items: Vec<PropertyValue>) -> PropertyValue {
    if items
        .iter()
        .all(|item| matches!(item, PropertyValue::Literal(_)))
    {
        let values = items
            .into_iter()
            .filter_map(|item| match item {
                PropertyValue::Literal(value) => Some(value),
                _ => None,
            })
            .collect();
        PropertyValue::Literal(serde_json::Value::Array(values))
    } else {
        PropertyValue::List(items)
    }
}

fn collapse_map(entries: BTreeMap<String, PropertyValue>) -> PropertyValue {
    if entries
        .values()
        .all(|value| matches!(value, PropertyValue::Literal(_)))
    {
        let values = entries
            .into_iter()
            .filter_map(|(key, value)| match value {
                PropertyValue::Literal(value) => Some((key, value)),
                _ => None,
            })
            .collect();
        PropertyValue::Literal(serde_json::Value::Object(values))
    } else {
        PropertyValue::Map(entries)
    }
}

/// Convert a Lua value into a property value. Literal-only lists and tables
/// collapse into a single JSON literal.
fn lua_to_property(value: Value, depth: usize) -> LuaResult<PropertyValue> {
    if depth > MAX_PROPERTY_DEPTH {
        return Err(runtime_error(format!(
            "property value nests deeper than {MAX_PROPERTY_DEPTH} levels"
        )));
    }

    match value {
        Value::Nil => Ok(PropertyValue::Literal(serde_json::Value::Null)),
        Value::Boolean(flag) => Ok(PropertyValue::literal(flag)),
        Value::Integer(number) => Ok(PropertyValue::literal(number)),
        Value::Number(number) => serde_json::Number::from_f64(number)
            .map(|number| PropertyValue::Literal(serde_json::Value::Number(number)))
            .ok_or_else(|| runtime_error(format!("number {number} cannot be stored"))),
        Value::String(text) => Ok(PropertyValue::literal(text.to_str()?.to_owned())),
        Value::Table(table) => table_to_property(&table, depth),
        Value::UserData(data) => {
            if let Ok(reference) = data.borrow::<LuaOutputRef>() {
                return Ok(PropertyValue::PendingOutput(reference.0.clone()));
            }
            if let Ok(handle) = data.borrow::<ResourceHandle>() {
                return Err(runtime_error(format!(
                    "resource handle {} used as a value; reference an output such as {}.id",
                    handle.name, handle.name
                )));
            }
            Err(runtime_error("unsupported userdata in property value"))
        }
        other => Err(runtime_error(format!(
            "unsupported property value of type {}",
            other.type_name()
        ))),
    }
}

fn table_to_property(table: &Table, depth: usize) -> LuaResult<PropertyValue> {
    let length = table.raw_len();
    let mut entries = Vec::new();
    for pair in table.pairs::<Value, Value>() {
        entries.push(pair?);
    }

    if length > 0 && entries.len() == length {
        let mut items = Vec::with_capacity(length);
        for value in table.sequence_values::<Value>() {
            items.push(lua_to_property(value?, depth + 1)?);
        }
        return Ok(collapse_list(items));
    }

    let mut map = BTreeMap::new();
    for (key, value) in entries {
        let key = match key {
            Value::String(text) => text.to_str()?.to_owned(),
            Value::Integer(index) => index.to_string(),
            other => {
                return Err(runtime_error(format!(
                    "table keys must be strings, got {}",
                    other.type_name()
                )));
            }
        };
        map.insert(key, lua_to_property(value, depth + 1)?);
    }
    Ok(collapse_map(map))
}

fn parse_name(raw: &str) -> LuaResult<ResourceName> {
    ResourceName::try_from(raw).map_err(LuaError::external)
}

fn parse_depends_on(opts: Option<&Table>) -> LuaResult<Vec<ResourceName>> {
    let Some(table) = opts else {
        return Ok(Vec::new());
    };

    match table.get::<Value>("depends_on")? {
        Value::Nil => Ok(Vec::new()),
        Value::Table(list) => {
            let mut names = Vec::new();
            for value in list.sequence_values::<Value>() {
                names.push(dependency_name(&value?)?);
            }
            Ok(names)
        }
        other => Ok(vec![dependency_name(&other)?]),
    }
}

fn dependency_name(value: &Value) -> LuaResult<ResourceName> {
    match value {
        Value::String(text) => parse_name(&text.to_str()?),
        Value::UserData(data) => data
            .borrow::<ResourceHandle>()
            .map(|handle| handle.name.clone())
            .map_err(|_| runtime_error("depends_on entries must be names or resource handles")),
        _ => Err(runtime_error(
            "depends_on entries must be names or resource handles",
        )),
    }
}

fn parse_string_map(value: Option<Table>, what: &str) -> LuaResult<BTreeMap<String, String>> {
    let Some(table) = value else {
        return Ok(BTreeMap::new());
    };
    let mut out = BTreeMap::new();
    for pair in table.pairs::<Value, Value>() {
        let (key, value) = pair?;
        let (Value::String(key), Value::String(value)) = (key, value) else {
            return Err(runtime_error(format!("{what} keys and values must be strings")));
        };
        out.insert(key.to_str()?.to_owned(), value.to_str()?.to_owned());
    }
    Ok(out)
}

fn create_lua() -> LuaResult<Lua> {
    let lua = Lua::new();
    let globals = lua.globals();

    // Manifests describe resources; they get no filesystem or process access.
    for key in [
        "io", "os", "package", "debug", "dofile", "loadfile", "require",
    ] {
        globals.set(key, Value::Nil)?;
    }

    Ok(lua)
}

type Collector = Rc<RefCell<StackManifest>>;

fn register_resource_functions(
    lua: &Lua,
    collector: &Collector,
    manifest_path: &Path,
) -> LuaResult<()> {
    let globals = lua.globals();

    {
        let collector = Rc::clone(collector);
        let source = manifest_path.to_path_buf();
        let function = lua.create_function(
            move |_, (name, type_tag, props, opts): (String, String, Option<Table>, Option<Table>)| {
                let name = parse_name(&name)?;
                let type_tag = TypeTag::try_from(type_tag).map_err(LuaError::external)?;
                let mut spec = ResourceSpec::new(name.clone(), type_tag);
                if let Some(props) = props {
                    for pair in props.pairs::<String, Value>() {
                        let (key, value) = pair?;
                        spec.properties.insert(key, lua_to_property(value, 1)?);
                    }
                }
                spec.depends_on = parse_depends_on(opts.as_ref())?;
                spec.source = Some(source.clone());
                collector.borrow_mut().resources.push(spec);
                Ok(ResourceHandle { name })
            },
        )?;
        globals.set("resource", function)?;
    }

    globals.set(
        "ref",
        lua.create_function(|_, (name, property): (String, String)| {
            OutputRef::new(parse_name(&name)?, property)
                .map(LuaOutputRef)
                .map_err(LuaError::external)
        })?,
    )?;

    {
        let collector = Rc::clone(collector);
        let function = lua.create_function(move |_, (name, value): (String, Value)| {
            if name.trim().is_empty() {
                return Err(runtime_error("export(name, value) requires a non-empty name"));
            }
            let value = lua_to_property(value, 1)?;
            let mut manifest = collector.borrow_mut();
            if manifest.exports.insert(name.clone(), value).is_some() {
                manifest
                    .warnings
                    .push(format!("export {name} is declared more than once; last one wins"));
            }
            Ok(())
        })?;
        globals.set("export", function)?;
    }

    Ok(())
}

fn register_context_functions(
    lua: &Lua,
    context: &Rc<StackContext>,
    manifest_dir: &Path,
) -> LuaResult<()> {
    let globals = lua.globals();

    {
        let context = Rc::clone(context);
        globals.set(
            "config_string",
            lua.create_function(move |_, (key, default): (String, String)| {
                context
                    .config
                    .get_string(&key, &default)
                    .map_err(LuaError::external)
            })?,
        )?;
    }
    {
        let context = Rc::clone(context);
        globals.set(
            "config_int",
            lua.create_function(move |_, (key, default): (String, i64)| {
                context
                    .config
                    .get_int(&key, default)
                    .map_err(LuaError::external)
            })?,
        )?;
    }
    {
        let context = Rc::clone(context);
        globals.set(
            "config_number",
            lua.create_function(move |_, (key, default): (String, f64)| {
                context
                    .config
                    .get_number(&key, default)
                    .map_err(LuaError::external)
            })?,
        )?;
    }
    {
        let context = Rc::clone(context);
        globals.set(
            "config_bool",
            lua.create_function(move |_, (key, default): (String, bool)| {
                context
                    .config
                    .get_bool(&key, default)
                    .map_err(LuaError::external)
            })?,
        )?;
    }
    {
        let context = Rc::clone(context);
        globals.set(
            "project",
            lua.create_function(move |_, ()| Ok(context.project.clone()))?,
        )?;
    }
    {
        let context = Rc::clone(context);
        globals.set(
            "stack",
            lua.create_function(move |_, ()| Ok(context.stack.clone()))?,
        )?;
    }
    {
        let context = Rc::clone(context);
        globals.set(
            "tags",
            lua.create_function(move |lua, extra: Option<Table>| {
                let extra = parse_string_map(extra, "tags")?;
                lua.create_table_from(context.default_tags(&extra))
            })?,
        )?;
    }
    {
        let manifest_dir = manifest_dir.to_path_buf();
        globals.set(
            "path",
            lua.create_function(move |_, raw: String| {
                Ok(resolve_manifest_relative(&manifest_dir, &raw)
                    .to_string_lossy()
                    .into_owned())
            })?,
        )?;
    }

    Ok(())
}

fn register_env(lua: &Lua, collector: &Collector) -> LuaResult<()> {
    let collector = Rc::clone(collector);
    let function = lua.create_function(move |_, args: MultiValue| {
        let Some(Value::String(name)) = args.front().filter(|_| args.len() == 1) else {
            return Err(runtime_error(
                "env(name) expects exactly one string argument",
            ));
        };
        let name = name.to_str()?.to_owned();
        env::var_os(&name).map_or_else(
            || {
                Err(runtime_error(format!(
                    "env(\"{name}\") is not set in the current environment"
                )))
            },
            |value| {
                let resolved = value.to_string_lossy().into_owned();
                collector.borrow_mut().sensitive.insert(resolved.clone());
                Ok(resolved)
            },
        )
    })?;
    lua.globals().set("env", function)
}

fn evaluate_manifest_with_lua(
    manifest_path: &Path,
    manifest_dir: &Path,
    script: &str,
    context: &Rc<StackContext>,
) -> LuaResult<StackManifest> {
    let collector: Collector = Rc::new(RefCell::new(StackManifest::default()));
    let lua = create_lua()?;

    register_resource_functions(&lua, &collector, manifest_path)?;
    register_context_functions(&lua, context, manifest_dir)?;
    register_env(&lua, &collector)?;

    lua.load(script)
        .set_name(manifest_path.to_string_lossy())
        .exec()?;

    let manifest = collector.borrow().clone();
    Ok(manifest)
}

/// Evaluate one manifest file against the stack context.
///
/// # Errors
///
/// Returns an error when the manifest cannot be read or its Lua code fails.
pub fn evaluate_manifest(
    path: &Path,
    context: &StackContext,
) -> Result<StackManifest, ManifestEvalError> {
    evaluate_with_shared_context(path, &Rc::new(context.clone()))
}

fn evaluate_with_shared_context(
    path: &Path,
    context: &Rc<StackContext>,
) -> Result<StackManifest, ManifestEvalError> {
    let manifest_path =
        fs::canonicalize(path).map_err(|source| ManifestEvalError::CanonicalizePath {
            path: path.to_path_buf(),
            source,
        })?;
    let manifest_dir = manifest_path.parent().map(Path::to_path_buf).ok_or_else(|| {
        ManifestEvalError::MissingManifestParent {
            path: manifest_path.clone(),
        }
    })?;
    let script =
        fs::read_to_string(&manifest_path).map_err(|source| ManifestEvalError::ReadManifest {
            path: manifest_path.clone(),
            source,
        })?;

    let manifest = evaluate_manifest_with_lua(&manifest_path, &manifest_dir, &script, context)
        .map_err(|source| ManifestEvalError::LuaRuntime {
            path: manifest_path.clone(),
            source,
        })?;
    debug!(
        path = %manifest_path.display(),
        resources = manifest.resources.len(),
        exports = manifest.exports.len(),
        "evaluated manifest"
    );
    Ok(manifest)
}

/// Evaluate several manifests in order and merge their declarations.
///
/// # Errors
///
/// Returns the first manifest evaluation error.
pub fn evaluate_many(
    paths: &[PathBuf],
    context: &StackContext,
) -> Result<StackManifest, ManifestEvalError> {
    let context = Rc::new(context.clone());
    let mut merged = StackManifest::default();
    for path in paths {
        merged.merge(evaluate_with_shared_context(path, &context)?);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests;
