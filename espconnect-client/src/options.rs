//! Loose option bags passed through to server requests.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Case-insensitive option map.
///
/// Names are stored lowercased. Setting a name to `null` removes it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    values: Map<String, Value>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(&name.to_lowercase())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(&name.to_lowercase())
    }

    /// Typed lookup. Falls back to `default` when the option is missing or
    /// has the wrong shape.
    pub fn get_or<T: DeserializeOwned>(&self, name: &str, default: T) -> T {
        self.get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(default)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Accepts booleans, `"true"`/`"false"` and numbers.
    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true") || s == "1",
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            _ => default,
        }
    }

    /// Accepts numbers and numeric strings.
    pub fn get_i64(&self, name: &str, default: i64) -> i64 {
        match self.get(name) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let name = name.to_lowercase();
        match value.into() {
            Value::Null => {
                self.values.remove(&name);
            }
            value => {
                self.values.insert(name, value);
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(&name.to_lowercase())
    }

    /// Removes and returns an option.
    pub fn take(&mut self, name: &str) -> Option<Value> {
        self.remove(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Copies every option of `other`, overwriting existing names.
    pub fn merge(&mut self, other: &Options) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
    }
}

impl From<Map<String, Value>> for Options {
    fn from(map: Map<String, Value>) -> Self {
        let mut options = Options::new();
        for (k, v) in map {
            options.set(&k, v);
        }
        options
    }
}

impl From<Value> for Options {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => map.into(),
            _ => Options::new(),
        }
    }
}
