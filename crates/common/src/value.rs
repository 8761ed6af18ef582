//! Generic value tree and path reference resolution
//!
//! Every literal in a specification, every request body, and every decoded
//! response is represented as a [`Value`]. References such as
//! `login.response.token` are evaluated lazily through a [`Scope`], which
//! knows how far execution has progressed in the invoke registry.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::registry::InvokeRegistry;
use crate::syntax::{Accessor, Part, PathExpr, ValueExpr, ValueKind};

/// Decoded mapping of a message: field name to value
pub type Fields = BTreeMap<String, Value>;

/// Closed variant type for data flowing through the runner
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(Fields),
    /// A reference left unevaluated by the load-time pass
    Reference(PathExpr),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Reference(_) => "reference",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Null, empty string, empty array and empty map count as empty
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Map(fields) => fields.is_empty(),
            _ => false,
        }
    }

    /// First reference still embedded in this tree, if any
    pub fn find_reference(&self) -> Option<&PathExpr> {
        match self {
            Value::Reference(path) => Some(path),
            Value::Array(items) => items.iter().find_map(Value::find_reference),
            Value::Map(fields) => fields.values().find_map(Value::find_reference),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(fields) => Json::Object(fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
            Value::Reference(path) => Json::String(path.to_string()),
        }
    }

    pub fn from_json(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(items.into_iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Map(map.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect()),
        }
    }
}

/// Deep equality; integers and floats compare by numeric value
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Reference(a), Value::Reference(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Reference(path) => write!(f, "{path}"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Failure while evaluating a path reference
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("Invalid reference: {path}, the second segment must be \"response\" or \"data\"")]
    InvalidRoot { path: String },

    #[error("Reference not found {path}")]
    UnknownInvoke { path: String },

    #[error("Reference error {path}, invoke must be called before use!")]
    NotReady { path: String },

    #[error("Field {segment} not found while resolving {path} on invoke {invoke}")]
    MissingField { path: String, invoke: String, segment: String },

    #[error("Cannot descend into {found} at {segment} while resolving {path} on invoke {invoke}")]
    TypeMismatch {
        path: String,
        invoke: String,
        segment: String,
        found: &'static str,
    },
}

impl ResolveError {
    /// Whether the error stems from the shape of captured data rather than
    /// from the specification itself
    pub fn is_data_error(&self) -> bool {
        matches!(self, ResolveError::MissingField { .. } | ResolveError::TypeMismatch { .. })
    }
}

/// Which captured tree a reference selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceRoot {
    Response,
    Data,
}

impl ReferenceRoot {
    fn parse(part: Option<&Part>) -> Option<Self> {
        match part.map(|p| (p.ident.as_str(), p.accessors.is_empty())) {
            Some(("response", true)) => Some(ReferenceRoot::Response),
            Some(("data", true)) => Some(ReferenceRoot::Data),
            _ => None,
        }
    }
}

/// Evaluation context for values appearing in the invoke at `position`
///
/// Only invokes declared strictly before `position` may be referenced, and
/// with `allow_references` set they must already have a captured response.
pub struct Scope<'a> {
    registry: &'a InvokeRegistry,
    position: usize,
    allow_references: bool,
}

impl<'a> Scope<'a> {
    pub fn new(registry: &'a InvokeRegistry, position: usize, allow_references: bool) -> Self {
        Self { registry, position, allow_references }
    }

    /// Evaluate an expression; the flag reports whether it contains a reference
    pub fn evaluate(&self, expr: &ValueExpr) -> Result<(Value, bool), ResolveError> {
        match &expr.kind {
            ValueKind::String(s) | ValueKind::RawIdent(s) => Ok((Value::String(s.clone()), false)),
            ValueKind::Float(f) => Ok((Value::Float(*f), false)),
            ValueKind::Int(i) => Ok((Value::Int(*i), false)),
            ValueKind::Bool(b) => Ok((Value::Bool(*b), false)),
            ValueKind::Map(entries) => {
                let mut fields = Fields::new();
                let mut has_reference = false;
                for (key, value) in entries {
                    let (value, nested) = self.evaluate(value)?;
                    has_reference |= nested;
                    fields.insert(key.clone(), value);
                }
                Ok((Value::Map(fields), has_reference))
            }
            ValueKind::Array(elements) => {
                let mut items = Vec::with_capacity(elements.len());
                let mut has_reference = false;
                for element in elements {
                    let (value, nested) = self.evaluate(element)?;
                    has_reference |= nested;
                    items.push(value);
                }
                Ok((Value::Array(items), has_reference))
            }
            ValueKind::Reference(path) => {
                if self.allow_references {
                    Ok((self.resolve(path)?, true))
                } else {
                    self.check(path)?;
                    Ok((Value::Reference(path.clone()), true))
                }
            }
        }
    }

    /// Resolve a reference against captured invoke data
    pub fn resolve(&self, path: &PathExpr) -> Result<Value, ResolveError> {
        let root = self.check(path)?;
        let name = &path.parts[0].ident;
        let invoke = self
            .registry
            .get(name)
            .ok_or_else(|| ResolveError::UnknownInvoke { path: path.to_string() })?;

        let Some(response) = invoke.response.as_ref() else {
            return Err(ResolveError::NotReady { path: path.to_string() });
        };
        let tree = match root {
            ReferenceRoot::Response => response,
            ReferenceRoot::Data => &invoke.request_data,
        };
        walk(tree, &path.parts[2..], path, name)
    }

    /// Validate the reference shape and that its target precedes this scope
    fn check(&self, path: &PathExpr) -> Result<ReferenceRoot, ResolveError> {
        let root = ReferenceRoot::parse(path.parts.get(1))
            .ok_or_else(|| ResolveError::InvalidRoot { path: path.to_string() })?;
        let name = &path.parts[0].ident;
        let index = self
            .registry
            .position(name)
            .ok_or_else(|| ResolveError::UnknownInvoke { path: path.to_string() })?;
        if index >= self.position {
            return Err(ResolveError::NotReady { path: path.to_string() });
        }
        Ok(root)
    }
}

fn walk(root: &Fields, parts: &[Part], path: &PathExpr, invoke: &str) -> Result<Value, ResolveError> {
    let missing = |segment: String| ResolveError::MissingField {
        path: path.to_string(),
        invoke: invoke.to_string(),
        segment,
    };
    let mismatch = |segment: String, found: &Value| ResolveError::TypeMismatch {
        path: path.to_string(),
        invoke: invoke.to_string(),
        segment,
        found: found.kind_name(),
    };

    let mut current: Option<&Value> = None;
    for part in parts {
        let fields = match current {
            None => root,
            Some(Value::Map(fields)) => fields,
            Some(other) => return Err(mismatch(part.ident.clone(), other)),
        };
        let mut next = fields.get(&part.ident).ok_or_else(|| missing(part.ident.clone()))?;
        let mut segment = part.ident.clone();
        for accessor in &part.accessors {
            segment = format!("{segment}[{accessor}]");
            next = match (accessor, next) {
                (Accessor::Index(i), Value::Array(items)) => usize::try_from(*i)
                    .ok()
                    .and_then(|i| items.get(i))
                    .ok_or_else(|| missing(segment.clone()))?,
                (Accessor::Index(i), Value::Map(fields)) => {
                    fields.get(&i.to_string()).ok_or_else(|| missing(segment.clone()))?
                }
                (Accessor::Key(key), Value::Map(fields)) => fields.get(key).ok_or_else(|| missing(segment.clone()))?,
                (_, other) => return Err(mismatch(segment, other)),
            };
        }
        current = Some(next);
    }

    Ok(current.cloned().unwrap_or_else(|| Value::Map(root.clone())))
}
