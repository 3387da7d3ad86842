use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Keys starting with this prefix are reserved for orchestration bookkeeping.
pub const INTERNAL_KEY_PREFIX: &str = "__";

/// Name under which generated programs see the context mapping.
pub const CONTEXT_ACCESSOR: &str = "context";

const SECRET_KEY_MARKERS: [&str; 9] = [
    "password",
    "passwd",
    "token",
    "api_key",
    "apikey",
    "secret",
    "credential",
    "private_key",
    "access_key",
];

const SHORT_STRING_MAX_CHARS: usize = 200;
const BASE64_MIN_CHARS: usize = 64;
const BASE64_LARGE_MIN_BYTES: usize = 4 * 1024;
const PREVIEW_MAX_CHARS: usize = 80;
const MAX_TAG_DEPTH: usize = 3;
const ARRAY_SAMPLE_LIMIT: usize = 50;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaBuildError {
    #[error("context must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("context keys must not be empty")]
    EmptyKey,
    #[error("context key `{0}` uses the reserved `__` prefix")]
    ReservedKey(String),
}

/// A JSON object passed into and returned from generated programs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(Map<String, Value>);

impl Context {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Accepts caller input, rejecting non-objects, empty keys and reserved keys.
    pub fn from_value(value: Value) -> Result<Self, SchemaBuildError> {
        match value {
            Value::Object(map) => Self::from_map(map),
            other => Err(SchemaBuildError::NotAnObject(json_kind(&other))),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Result<Self, SchemaBuildError> {
        for key in map.keys() {
            if key.is_empty() {
                return Err(SchemaBuildError::EmptyKey);
            }
            if is_internal_key(key) {
                return Err(SchemaBuildError::ReservedKey(key.clone()));
            }
        }
        Ok(Self(map))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Copy of the context with every reserved key dropped.
    pub fn without_internal_keys(&self) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(k, _)| !is_internal_key(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

pub fn is_internal_key(key: &str) -> bool {
    key.starts_with(INTERNAL_KEY_PREFIX)
}

pub fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SECRET_KEY_MARKERS.iter().any(|m| lower.contains(m))
}

/// Structural description of a value. Never encodes magnitude.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeTag {
    Null,
    Boolean,
    Int,
    Float,
    String,
    Text,
    Base64,
    Base64Large,
    Csv { columns: usize },
    EmptyArray,
    Array(Box<TypeTag>),
    MixedArray,
    Object(BTreeMap<String, TypeTag>),
    OpaqueObject,
}

impl TypeTag {
    pub fn of(value: &Value) -> Self {
        Self::at_depth(value, 0)
    }

    fn at_depth(value: &Value, depth: usize) -> Self {
        match value {
            Value::Null => TypeTag::Null,
            Value::Bool(_) => TypeTag::Boolean,
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    TypeTag::Int
                } else {
                    TypeTag::Float
                }
            }
            Value::String(s) => string_tag(s),
            Value::Array(items) => {
                let mut tags = items
                    .iter()
                    .take(ARRAY_SAMPLE_LIMIT)
                    .map(|item| Self::at_depth(item, depth + 1));
                let Some(first) = tags.next() else {
                    return TypeTag::EmptyArray;
                };
                if tags.all(|t| t == first) {
                    TypeTag::Array(Box::new(first))
                } else {
                    TypeTag::MixedArray
                }
            }
            Value::Object(map) => {
                if depth >= MAX_TAG_DEPTH {
                    return TypeTag::OpaqueObject;
                }
                TypeTag::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Self::at_depth(v, depth + 1)))
                        .collect(),
                )
            }
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Null => f.write_str("null"),
            TypeTag::Boolean => f.write_str("boolean"),
            TypeTag::Int => f.write_str("int"),
            TypeTag::Float => f.write_str("float"),
            TypeTag::String => f.write_str("string"),
            TypeTag::Text => f.write_str("text"),
            TypeTag::Base64 => f.write_str("base64"),
            TypeTag::Base64Large => f.write_str("base64-large"),
            TypeTag::Csv { columns } => write!(f, "csv[{columns}]"),
            TypeTag::EmptyArray => f.write_str("array"),
            TypeTag::Array(inner) => write!(f, "array[{inner}]"),
            TypeTag::MixedArray => f.write_str("array[mixed]"),
            TypeTag::OpaqueObject => f.write_str("object"),
            TypeTag::Object(fields) => {
                f.write_str("object{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{k}:{v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

fn string_tag(s: &str) -> TypeTag {
    if looks_like_base64(s) {
        if s.len() >= BASE64_LARGE_MIN_BYTES {
            return TypeTag::Base64Large;
        }
        return TypeTag::Base64;
    }
    if let Some(columns) = csv_columns(s) {
        return TypeTag::Csv { columns };
    }
    if s.chars().count() <= SHORT_STRING_MAX_CHARS {
        TypeTag::String
    } else {
        TypeTag::Text
    }
}

fn looks_like_base64(s: &str) -> bool {
    let body = match s.strip_prefix("data:") {
        Some(rest) => match rest.split_once(";base64,") {
            Some((_, payload)) => payload,
            None => return false,
        },
        None => s,
    };
    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.len() < BASE64_MIN_CHARS || compact.len() % 4 != 0 {
        return false;
    }
    let trimmed = compact.trim_end_matches('=');
    if compact.len() - trimmed.len() > 2 {
        return false;
    }
    // Plain words would pass the alphabet check; real payloads mix case and digits.
    let has_upper = trimmed.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = trimmed.chars().any(|c| c.is_ascii_lowercase());
    let has_digit = trimmed.chars().any(|c| c.is_ascii_digit());
    trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '-' | '_'))
        && has_upper
        && has_lower
        && has_digit
}

fn csv_columns(s: &str) -> Option<usize> {
    let mut lines = s.lines().map(str::trim_end).filter(|l| !l.is_empty());
    let header = lines.next()?;
    let second = lines.next()?;
    for delimiter in [',', ';', '\t'] {
        let count = header.matches(delimiter).count();
        if count > 0 && second.matches(delimiter).count() == count {
            return Some(count + 1);
        }
    }
    None
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Key to type-tag mapping for every non-secret context key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextSchema(BTreeMap<String, String>);

impl ContextSchema {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// One `key: tag` per line, sorted by key.
    pub fn render(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl FromIterator<(String, String)> for ContextSchema {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Secret-bearing keys mapped to whether a usable value is present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigFlags(BTreeMap<String, bool>);

impl ConfigFlags {
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_present(&self, key: &str) -> bool {
        self.0.get(key).copied().unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &bool)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn render(&self) -> String {
        self.0
            .iter()
            .map(|(k, present)| {
                let state = if *present { "present" } else { "missing" };
                format!("{k}: {state}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Everything derived from a context that identifies a task's shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextProfile {
    pub schema: ContextSchema,
    pub config: ConfigFlags,
    /// Short samples of small scalar values. Prompt-only; never hashed or cached.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub previews: BTreeMap<String, String>,
}

impl ContextProfile {
    pub fn from_context(context: &Context) -> Self {
        let mut schema = BTreeMap::new();
        let mut config = BTreeMap::new();
        let mut previews = BTreeMap::new();
        for (key, value) in context.iter() {
            if is_internal_key(key) {
                continue;
            }
            if is_secret_key(key) {
                config.insert(key.clone(), secret_present(value));
                continue;
            }
            let tag = TypeTag::of(value);
            if let Some(preview) = preview_for(value, &tag) {
                previews.insert(key.clone(), preview);
            }
            schema.insert(key.clone(), tag.to_string());
        }
        Self {
            schema: ContextSchema(schema),
            config: ConfigFlags(config),
            previews,
        }
    }

    /// Whether a program may read `key` from the context.
    pub fn knows_key(&self, key: &str) -> bool {
        self.schema.contains_key(key) || self.config.contains_key(key)
    }

    pub fn fingerprint(&self, task: &str) -> String {
        fingerprint(task, &self.schema, &self.config)
    }
}

fn secret_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

fn preview_for(value: &Value, tag: &TypeTag) -> Option<String> {
    let rendered = match (value, tag) {
        (Value::Bool(b), _) => b.to_string(),
        (Value::Number(n), _) => n.to_string(),
        (Value::String(s), TypeTag::String) => format!("{s:?}"),
        _ => return None,
    };
    if rendered.chars().count() > PREVIEW_MAX_CHARS {
        let cut: String = rendered.chars().take(PREVIEW_MAX_CHARS).collect();
        return Some(format!("{cut}..."));
    }
    Some(rendered)
}

/// Collapses runs of whitespace so cosmetic edits do not split cache keys.
pub fn normalize_task(task: &str) -> String {
    task.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deterministic exact-cache key over (task, schema, config).
pub fn fingerprint(task: &str, schema: &ContextSchema, config: &ConfigFlags) -> String {
    let canonical = serde_json::json!([normalize_task(task), schema, config]);
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:064x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Context {
        Context::from_value(value).expect("valid context")
    }

    #[test]
    fn rejects_non_object_and_reserved_keys() {
        assert_eq!(
            Context::from_value(json!([1, 2])),
            Err(SchemaBuildError::NotAnObject("array"))
        );
        assert_eq!(
            Context::from_value(json!({"__run": 1})),
            Err(SchemaBuildError::ReservedKey("__run".to_string()))
        );
        assert_eq!(
            Context::from_value(json!({"": 1})),
            Err(SchemaBuildError::EmptyKey)
        );
    }

    #[test]
    fn tags_scalars_and_collections() {
        assert_eq!(TypeTag::of(&json!(3)).to_string(), "int");
        assert_eq!(TypeTag::of(&json!(3.5)).to_string(), "float");
        assert_eq!(TypeTag::of(&json!("hi")).to_string(), "string");
        assert_eq!(TypeTag::of(&json!("x".repeat(500))).to_string(), "text");
        assert_eq!(TypeTag::of(&json!([1, 2, 3])).to_string(), "array[int]");
        assert_eq!(TypeTag::of(&json!([1, "a"])).to_string(), "array[mixed]");
        assert_eq!(TypeTag::of(&json!([])).to_string(), "array");
        assert_eq!(
            TypeTag::of(&json!({"b": true, "a": null})).to_string(),
            "object{a:null,b:boolean}"
        );
        assert_eq!(
            TypeTag::of(&json!("name,age\nann,31\nbob,40")).to_string(),
            "csv[2]"
        );
    }

    #[test]
    fn nested_objects_stop_at_depth_limit() {
        let tag = TypeTag::of(&json!({"a": {"b": {"c": {"d": 1}}}}));
        assert_eq!(tag.to_string(), "object{a:object{b:object{c:object}}}");
    }

    #[test]
    fn base64_tags_ignore_payload_size_within_band() {
        let small = "QUJDRGVmZ2gxMjM0".repeat(8);
        let large_a = "QUJDRGVmZ2gxMjM0".repeat(300);
        let large_b = "QUJDRGVmZ2gxMjM0".repeat(3000);
        assert_eq!(TypeTag::of(&json!(small)).to_string(), "base64");
        assert_eq!(TypeTag::of(&json!(large_a)), TypeTag::Base64Large);
        assert_eq!(TypeTag::of(&json!(large_a)), TypeTag::of(&json!(large_b)));
    }

    #[test]
    fn secrets_become_presence_flags() {
        let profile = ContextProfile::from_context(&ctx(json!({
            "smtp_password": "hunter2",
            "API_TOKEN": "",
            "recipient": "a@b.c"
        })));
        assert!(!profile.schema.contains_key("smtp_password"));
        assert!(profile.config.is_present("smtp_password"));
        assert!(!profile.config.is_present("API_TOKEN"));
        assert!(profile.knows_key("API_TOKEN"));
        assert_eq!(profile.schema.get("recipient"), Some("string"));
        assert!(!profile.previews.contains_key("smtp_password"));
        let rendered = serde_json::to_string(&profile).expect("serialize");
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn fingerprint_ignores_values_and_key_order() {
        let a = ContextProfile::from_context(&ctx(json!({"a": 10, "b": 20})));
        let b = ContextProfile::from_context(&ctx(json!({"b": 7, "a": 999999})));
        assert_eq!(a.fingerprint("add a  and b"), b.fingerprint("add a and b "));
        assert_ne!(a.fingerprint("add a and b"), a.fingerprint("multiply a and b"));
        let c = ContextProfile::from_context(&ctx(json!({"a": 1.5, "b": 20})));
        assert_ne!(a.fingerprint("add a and b"), c.fingerprint("add a and b"));
    }

    #[test]
    fn previews_skip_long_and_structured_values() {
        let profile = ContextProfile::from_context(&ctx(json!({
            "n": 4,
            "items": [1, 2],
            "note": "short"
        })));
        assert_eq!(profile.previews.get("n").map(String::as_str), Some("4"));
        assert_eq!(
            profile.previews.get("note").map(String::as_str),
            Some("\"short\"")
        );
        assert!(!profile.previews.contains_key("items"));
    }
}
