use super::PluginArgs;
use crate::error::PluginError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Permissions a plugin may declare. Anything else fails validation.
pub const KNOWN_PERMISSIONS: &[&str] = &[
    "network",
    "filesystem",
    "process",
    "net",     // synonym of network
    "fs_read", // read-only filesystem access
    "fs_write",
];

/// Parsed `plugin.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub plugin: ManifestMeta,
    pub entry: ManifestEntry,
    #[serde(default)]
    pub inputs: ManifestInputs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestMeta {
    /// Defaults to the package directory name when omitted.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Exactly one of `builtin` or `command` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(default)]
    pub builtin: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestInputs {
    #[serde(default)]
    pub schema: BTreeMap<String, FieldSpec>,
}

/// Declarative field kind interpreted by the generic argument validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

/// Compiled input schema: declarative field specs, no runtime codegen.
#[derive(Debug, Clone)]
pub struct InputSchema {
    fields: BTreeMap<String, FieldSpec>,
}

impl InputSchema {
    pub fn new(fields: BTreeMap<String, FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Structural validation of run arguments against the declared fields.
    pub fn validate(&self, args: &PluginArgs) -> std::result::Result<(), String> {
        for (field, spec) in &self.fields {
            match args.get(field) {
                None => {
                    if spec.required {
                        return Err(format!("missing required field '{field}'"));
                    }
                }
                Some(value) => {
                    if !kind_matches(spec.kind, value) {
                        return Err(format!(
                            "field '{field}' expected {:?}, got {}",
                            spec.kind,
                            json_kind(value)
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

fn kind_matches(kind: FieldKind, value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match kind {
        FieldKind::String => value.is_string(),
        FieldKind::Integer => value.is_i64() || value.is_u64(),
        FieldKind::Number => value.is_number(),
        FieldKind::Boolean => value.is_boolean(),
        FieldKind::Array => value.is_array(),
        FieldKind::Object => value.is_object(),
        FieldKind::Any => !matches!(value, Value::Null),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl PluginManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let manifest: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse manifest {}", path.display()))?;
        Ok(manifest)
    }

    /// Resolve the plugin name: manifest override, else the directory name.
    pub fn plugin_name(&self, dir_name: &str) -> String {
        self.plugin
            .name
            .clone()
            .unwrap_or_else(|| dir_name.to_string())
    }

    /// Validate the declared permission list against the fixed whitelist.
    pub fn validate_permissions(&self, name: &str) -> std::result::Result<(), PluginError> {
        let unknown: Vec<&str> = self
            .plugin
            .permissions
            .iter()
            .map(String::as_str)
            .filter(|p| !KNOWN_PERMISSIONS.contains(p))
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(PluginError::Validation {
                name: name.to_string(),
                reason: format!("unknown permissions: {}", unknown.join(", ")),
            })
        }
    }

    /// Exactly one entry kind must be declared.
    pub fn validate_entry(&self, name: &str) -> std::result::Result<(), PluginError> {
        match (&self.entry.builtin, &self.entry.command) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err(PluginError::Validation {
                name: name.to_string(),
                reason: "entry declares both builtin and command".into(),
            }),
            (None, None) => Err(PluginError::Validation {
                name: name.to_string(),
                reason: "entry declares neither builtin nor command".into(),
            }),
        }
    }

    /// Compile the declarative schema, or `None` when no fields are declared.
    pub fn compile_schema(&self) -> Option<InputSchema> {
        if self.inputs.schema.is_empty() {
            None
        } else {
            Some(InputSchema::new(self.inputs.schema.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    fn parse(toml_str: &str) -> PluginManifest {
        toml::from_str(toml_str).unwrap()
    }

    const WEATHER: &str = r#"
[plugin]
description = "Fetch a forecast"
permissions = ["network"]

[entry]
command = "./run.sh"

[inputs.schema.city]
kind = "string"
required = true

[inputs.schema.days]
kind = "integer"
"#;

    #[test]
    fn manifest_parses_and_names_default_to_dir() {
        let m = parse(WEATHER);
        assert_eq!(m.plugin_name("weather"), "weather");
        assert!(m.validate_permissions("weather").is_ok());
        assert!(m.validate_entry("weather").is_ok());
        assert_eq!(m.entry.command.as_deref(), Some("./run.sh"));
    }

    #[test]
    fn unknown_permission_is_rejected() {
        let m = parse(
            r#"
[plugin]
permissions = ["network", "root"]

[entry]
builtin = "tasks"
"#,
        );
        let err = m.validate_permissions("p").unwrap_err();
        assert!(err.to_string().contains("root"));
    }

    #[test]
    fn entry_must_be_exactly_one_kind() {
        let both = parse(
            r#"
[entry]
builtin = "tasks"
command = "./run.sh"
"#,
        );
        assert!(both.validate_entry("p").is_err());

        let neither = parse("[entry]\n");
        assert!(neither.validate_entry("p").is_err());
    }

    #[test]
    fn schema_validates_required_and_kinds() {
        let schema = parse(WEATHER).compile_schema().unwrap();

        let mut args = Map::new();
        args.insert("city".into(), json!("Lyon"));
        assert!(schema.validate(&args).is_ok());

        args.insert("days".into(), json!("three"));
        let err = schema.validate(&args).unwrap_err();
        assert!(err.contains("days"));

        let empty = Map::new();
        let err = schema.validate(&empty).unwrap_err();
        assert!(err.contains("city"));
    }

    #[test]
    fn empty_schema_compiles_to_none() {
        let m = parse("[entry]\nbuiltin = \"tasks\"\n");
        assert!(m.compile_schema().is_none());
    }
}
