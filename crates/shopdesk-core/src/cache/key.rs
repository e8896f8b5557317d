use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::api::QueryError;

/// Deterministic identifier for a request: endpoint name plus canonical args.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key from an endpoint name and an already-serialized argument value.
    pub fn new(endpoint: &str, args: &Value) -> Self {
        let mut out = String::with_capacity(endpoint.len() + 16);
        out.push_str(endpoint);
        out.push('(');
        write_canonical(args, &mut out);
        out.push(')');
        Self(out)
    }

    /// Serialize `args` and build a key from them.
    pub fn from_args<A: Serialize + ?Sized>(endpoint: &str, args: &A) -> Result<Self, QueryError> {
        let value = serde_json::to_value(args)
            .map_err(|e| QueryError::Validation(format!("{}: {}", endpoint, e)))?;
        Ok(Self::new(endpoint, &value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Endpoint part of the key
    pub fn endpoint(&self) -> &str {
        self.0.split_once('(').map(|(name, _)| name).unwrap_or(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// JSON with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
