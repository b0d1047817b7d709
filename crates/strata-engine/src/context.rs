use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

pub const SETTINGS_FILE: &str = "strata.toml";
pub const STATE_DIR: &str = ".strata";
pub const DEFAULT_STACK: &str = "dev";

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    project: Option<NamedSection>,
    #[serde(default)]
    stack: Option<NamedSection>,
    #[serde(default)]
    config: BTreeMap<String, toml::Value>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct NamedSection {
    name: String,
}

/// Key/value configuration of one stack. Defaults live at the call site.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackConfig {
    values: BTreeMap<String, toml::Value>,
}

impl StackConfig {
    #[must_use]
    pub const fn from_values(values: BTreeMap<String, toml::Value>) -> Self {
        Self { values }
    }

    /// Apply a `key=value` override. The value is read as a TOML scalar when
    /// possible (`cpu=1024` is an integer) and as a plain string otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error when `raw` has no `=` or an empty key.
    pub fn set_override(&mut self, raw: &str) -> Result<(), ConfigError> {
        let Some((key, value)) = raw.split_once('=') else {
            return Err(ConfigError::InvalidOverride {
                raw: raw.to_string(),
            });
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::InvalidOverride {
                raw: raw.to_string(),
            });
        }
        self.values.insert(key.to_string(), parse_scalar(value.trim()));
        Ok(())
    }

    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.values.keys().map(String::as_str).collect()
    }

    /// # Errors
    ///
    /// Returns an error when the key holds a non-string value.
    pub fn get_string(&self, key: &str, default: &str) -> Result<String, ConfigError> {
        match self.values.get(key) {
            None => Ok(default.to_string()),
            Some(toml::Value::String(value)) => Ok(value.clone()),
            Some(other) => Err(wrong_type(key, "a string", other)),
        }
    }

    /// # Errors
    ///
    /// Returns an error when the key holds a non-integer value.
    pub fn get_int(&self, key: &str, default: i64) -> Result<i64, ConfigError> {
        match self.values.get(key) {
            None => Ok(default),
            Some(toml::Value::Integer(value)) => Ok(*value),
            Some(other) => Err(wrong_type(key, "an integer", other)),
        }
    }

    /// # Errors
    ///
    /// Returns an error when the key holds a non-numeric value.
    // Cluster sizes are small; the i64 -> f64 conversion is exact for them.
    #[allow(clippy::cast_precision_loss)]
    pub fn get_number(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        match self.values.get(key) {
            None => Ok(default),
            Some(toml::Value::Integer(value)) => Ok(*value as f64),
            Some(toml::Value::Float(value)) => Ok(*value),
            Some(other) => Err(wrong_type(key, "a number", other)),
        }
    }

    /// # Errors
    ///
    /// Returns an error when the key holds a non-boolean value.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.values.get(key) {
            None => Ok(default),
            Some(toml::Value::Boolean(value)) => Ok(*value),
            Some(other) => Err(wrong_type(key, "a boolean", other)),
        }
    }
}

fn parse_scalar(raw: &str) -> toml::Value {
    let wrapped = format!("value = {raw}");
    toml::from_str::<BTreeMap<String, toml::Value>>(&wrapped)
        .ok()
        .and_then(|mut table| table.remove("value"))
        .filter(|value| !matches!(value, toml::Value::Table(_) | toml::Value::Array(_)))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

fn wrong_type(key: &str, expected: &'static str, value: &toml::Value) -> ConfigError {
    ConfigError::WrongType {
        key: key.to_string(),
        expected,
        value: value.to_string(),
    }
}

/// Identity and configuration of the stack being operated on. Passed to every
/// component that needs it instead of living in process-wide state.
#[derive(Debug, Clone, PartialEq)]
pub struct StackContext {
    pub project: String,
    pub stack: String,
    pub root: PathBuf,
    pub config: StackConfig,
    pub tags: BTreeMap<String, String>,
}

impl StackContext {
    #[must_use]
    pub fn new(project: impl Into<String>, stack: impl Into<String>, root: PathBuf) -> Self {
        Self {
            project: project.into(),
            stack: stack.into(),
            root,
            config: StackConfig::default(),
            tags: BTreeMap::new(),
        }
    }

    /// Load `strata.toml` from `root` (if present) and apply CLI overrides.
    ///
    /// The project name defaults to the directory name and the stack name to
    /// `dev`; `stack` takes precedence over the settings file.
    ///
    /// # Errors
    ///
    /// Returns an error when the settings file exists but cannot be read or
    /// parsed, or when an override is malformed.
    pub fn load(root: &Path, stack: Option<&str>, overrides: &[String]) -> Result<Self, ConfigError> {
        let settings_path = root.join(SETTINGS_FILE);
        let settings = match fs::read_to_string(&settings_path) {
            Ok(raw) => toml::from_str::<SettingsFile>(&raw).map_err(|source| ConfigError::Parse {
                path: settings_path.clone(),
                source,
            })?,
            Err(error) if error.kind() == ErrorKind::NotFound => SettingsFile::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: settings_path,
                    source,
                });
            }
        };

        let project = settings.project.map_or_else(
            || {
                root.file_name().map_or_else(
                    || "strata".to_string(),
                    |name| name.to_string_lossy().into_owned(),
                )
            },
            |section| section.name,
        );
        let stack = stack.map_or_else(
            || {
                settings
                    .stack
                    .map_or_else(|| DEFAULT_STACK.to_string(), |section| section.name)
            },
            str::to_string,
        );

        let mut config = StackConfig::from_values(settings.config);
        for raw in overrides {
            config.set_override(raw)?;
        }

        Ok(Self {
            project,
            stack,
            root: root.to_path_buf(),
            config,
            tags: settings.tags,
        })
    }

    /// Tags every resource of this stack should carry: `Project` and `Stack`
    /// plus the `[tags]` table, with `extra` taking precedence.
    #[must_use]
    pub fn default_tags(&self, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert("Project".to_string(), self.project.clone());
        tags.insert("Stack".to_string(), self.stack.clone());
        tags.extend(self.tags.clone());
        tags.extend(extra.clone());
        tags
    }

    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.state_dir().join(format!("{}.state.json", self.stack))
    }

    #[must_use]
    pub fn sandbox_dir(&self) -> PathBuf {
        self.state_dir().join("sandbox")
    }
}
