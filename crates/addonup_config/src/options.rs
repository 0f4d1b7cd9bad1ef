use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use serde_json::Value;

use crate::diagnostics::Diagnostic;
use crate::diagnostics::Diagnostics;
use crate::diagnostics::Error;
use crate::diagnostics::LoadError;
use crate::diagnostics::ValidationError;

/// Render a JSON scalar as the string form used in env vars and templates.
///
/// Objects and arrays have no single string form and return None.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// True for values the scripts treat as "unset": null and the empty string.
fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Add-on configuration loaded from a JSON options file.
///
/// This is the sole runtime configuration input for every launcher. Values
/// are kept as raw JSON; launchers pull out the fields they need through a
/// [`Scope`], which collects all validation errors before failing.
#[derive(Debug, Clone)]
pub struct Options {
    path: PathBuf,
    prefix: String,
    values: serde_json::Map<String, Value>,
}

impl Options {
    /// Load options from a JSON file.
    ///
    /// A missing file is a distinct, fatal error: an add-on without its
    /// options file cannot start at all.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LoadError::Missing {
                path: path.to_path_buf(),
            });
        }

        let text = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::from_json(path, &text)
    }

    /// Parse options from a JSON string, attributing diagnostics to `path`.
    pub fn from_json(path: impl AsRef<Path>, text: &str) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let value: Value = serde_json::from_str(text).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        match value {
            Value::Object(values) => Ok(Self {
                path: path.to_path_buf(),
                prefix: String::new(),
                values,
            }),
            _ => Err(LoadError::NotAnObject {
                path: path.to_path_buf(),
            }),
        }
    }

    /// The file these options were loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Insert or replace a value, e.g. a generated secret an absent option
    /// should be backfilled with before template rendering.
    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// A nested object as its own `Options`, with field paths extended so
    /// diagnostics read `wireguard.private_key` rather than `private_key`.
    pub fn section(&self, key: &str) -> Option<Options> {
        match self.values.get(key) {
            Some(Value::Object(values)) => Some(Options {
                path: self.path.clone(),
                prefix: self.field_path(key),
                values: values.clone(),
            }),
            _ => None,
        }
    }

    /// Drop keys whose values are null or empty strings so that upstream
    /// defaults apply instead of being clobbered by empty env vars.
    pub fn prune_empty(&mut self) {
        self.values.retain(|_, v| !is_empty_value(v));
    }

    /// All scalar values as an env-style map.
    pub fn env_map(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .filter_map(|(k, v)| scalar_to_string(v).map(|s| (k.clone(), s)))
            .collect()
    }

    /// Scalar values whose keys start with `prefix`, keyed by the full
    /// option name (`CYPHT_*` selection).
    pub fn env_with_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.values
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .filter_map(|(k, v)| scalar_to_string(v).map(|s| (k.clone(), s)))
            .collect()
    }

    /// The scalar string form of an option, if it has one.
    pub fn lookup_str(&self, key: &str) -> Option<String> {
        self.values.get(key).and_then(scalar_to_string)
    }

    /// Start collecting validated lookups against these options.
    pub fn scope(&self) -> Scope<'_> {
        Scope {
            options: self,
            errors: Vec::new(),
        }
    }

    fn field_path(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.prefix, key)
        }
    }
}

/// Collects every validation error across a launcher's option lookups so
/// they can all be reported together instead of one at a time.
///
/// Lookups that fail return a recovery default; the accumulated errors
/// surface when [`Scope::finish`] is called.
pub struct Scope<'a> {
    options: &'a Options,
    errors: Vec<ValidationError>,
}

impl<'a> Scope<'a> {
    fn record(&mut self, key: &str, message: String) {
        self.errors.push(ValidationError {
            field_path: self.options.field_path(key),
            message,
            source: Some(self.options.path.to_path_buf()),
        });
    }

    /// A required string option. Records an error and returns "" when
    /// missing or not a string.
    pub fn require_str(&mut self, key: &str) -> String {
        match self.options.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                self.record(key, format!("{} must be a string", key));
                String::new()
            }
            None => {
                self.record(key, format!("{} is required", key));
                String::new()
            }
        }
    }

    /// A required integer option. Records an error and returns 0 when
    /// missing or not an integer.
    pub fn require_u64(&mut self, key: &str) -> u64 {
        match self.options.get(key) {
            Some(Value::Number(n)) if n.is_u64() => n.as_u64().unwrap_or_default(),
            Some(_) => {
                self.record(key, format!("{} must be a non-negative integer", key));
                0
            }
            None => {
                self.record(key, format!("{} is required", key));
                0
            }
        }
    }

    /// A required boolean option.
    pub fn require_bool(&mut self, key: &str) -> bool {
        match self.options.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                self.record(key, format!("{} must be a boolean", key));
                false
            }
            None => {
                self.record(key, format!("{} is required", key));
                false
            }
        }
    }

    /// A required list-of-strings option.
    pub fn require_str_list(&mut self, key: &str) -> Vec<String> {
        match self.options.get(key) {
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for (idx, item) in items.iter().enumerate() {
                    match item {
                        Value::String(s) => out.push(s.clone()),
                        _ => self.record(key, format!("{}[{}] must be a string", key, idx)),
                    }
                }
                out
            }
            Some(_) => {
                self.record(key, format!("{} must be a list of strings", key));
                Vec::new()
            }
            None => {
                self.record(key, format!("{} is required", key));
                Vec::new()
            }
        }
    }

    /// An optional string option; only a wrong type is an error.
    pub fn optional_str(&mut self, key: &str) -> Option<String> {
        match self.options.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(_) => {
                self.record(key, format!("{} must be a string", key));
                None
            }
        }
    }

    /// A string option with a default, matching `HA_options.get(key, default)`.
    pub fn str_or(&mut self, key: &str, default: &str) -> String {
        self.optional_str(key)
            .unwrap_or_else(|| default.to_string())
    }

    /// A required nested object. Records an error and returns an empty
    /// section for error recovery when missing.
    pub fn require_section(&mut self, key: &str) -> Options {
        match self.options.section(key) {
            Some(section) => section,
            None => {
                self.record(key, format!("{} must be an object", key));
                Options {
                    path: self.options.path.clone(),
                    prefix: self.options.field_path(key),
                    values: serde_json::Map::new(),
                }
            }
        }
    }

    /// Fail with every collected error, or succeed if there were none.
    pub fn finish(self) -> Result<(), Diagnostics> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Diagnostics(
                self.errors
                    .into_iter()
                    .map(|e| Diagnostic::Error(Error::Validation(e)))
                    .collect(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(json: &str) -> Options {
        Options::from_json("/data/options.json", json).unwrap()
    }

    #[test]
    fn test_scalar_to_string() {
        assert_eq!(scalar_to_string(&Value::from("x")), Some("x".to_string()));
        assert_eq!(scalar_to_string(&Value::from(4)), Some("4".to_string()));
        assert_eq!(
            scalar_to_string(&Value::from(true)),
            Some("true".to_string())
        );
        assert_eq!(scalar_to_string(&Value::Null), None);
        assert_eq!(scalar_to_string(&serde_json::json!(["a"])), None);
    }

    #[test]
    fn test_scope_collects_all_errors() {
        let opts = options(r#"{"port": "not a number"}"#);
        let mut scope = opts.scope();
        scope.require_str("missing_one");
        scope.require_u64("port");
        scope.require_bool("missing_two");
        let err = scope.finish().unwrap_err();
        assert_eq!(err.0.len(), 3);
        assert!(err.has_errors());
    }

    #[test]
    fn test_section_field_paths() {
        let opts = options(r#"{"wireguard": {"endpoint": 5}}"#);
        let section = opts.section("wireguard").unwrap();
        let mut scope = section.scope();
        scope.require_str("endpoint");
        scope.require_str("private_key");
        let err = scope.finish().unwrap_err();
        let rendered = format!("{}", err);
        assert!(rendered.contains("wireguard.endpoint"));
        assert!(rendered.contains("wireguard.private_key"));
    }

    #[test]
    fn test_prune_empty() {
        let mut opts = options(r#"{"a": "", "b": null, "c": "keep", "d": 0, "e": false}"#);
        opts.prune_empty();
        assert!(!opts.contains("a"));
        assert!(!opts.contains("b"));
        assert!(opts.contains("c"));
        // Zero and false are real values, only null/"" mean "unset"
        assert!(opts.contains("d"));
        assert!(opts.contains("e"));
    }

    #[test]
    fn test_env_with_prefix() {
        let opts = options(
            r#"{"CYPHT_DB_HOST": "db", "CYPHT_SESSION_TYPE": "DB", "unrelated": "x", "CYPHT_AUTH": true}"#,
        );
        let env = opts.env_with_prefix("CYPHT_");
        assert_eq!(env.len(), 3);
        assert_eq!(env.get("CYPHT_DB_HOST").map(String::as_str), Some("db"));
        assert_eq!(env.get("CYPHT_AUTH").map(String::as_str), Some("true"));
        assert!(!env.contains_key("unrelated"));
    }

    #[test]
    fn test_require_str_list() {
        let opts = options(r#"{"sources": ["pipe:///x", "librespot:///y"]}"#);
        let mut scope = opts.scope();
        let sources = scope.require_str_list("sources");
        scope.finish().unwrap();
        assert_eq!(sources.len(), 2);
    }

    #[test]
    fn test_str_or_default() {
        let opts = options(r#"{"snappymail_MEMORY_LIMIT": "256M"}"#);
        let mut scope = opts.scope();
        assert_eq!(scope.str_or("snappymail_MEMORY_LIMIT", "128M"), "256M");
        assert_eq!(scope.str_or("snappymail_UPLOAD_MAX_SIZE", "25M"), "25M");
        scope.finish().unwrap();
    }
}
