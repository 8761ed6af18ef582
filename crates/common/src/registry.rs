//! Invoke records and the name-keyed registry preserving declaration order

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::expect::{Expectation, InvokeCondition};
use crate::invoker::CallStatus;
use crate::syntax::{InvokeDecl, Position};
use crate::value::{Fields, Scope, Value};

/// One declared call plus everything captured while executing it
#[derive(Debug, Clone)]
pub struct Invoke {
    pub decl: InvokeDecl,
    pub expectations: Vec<Expectation>,
    /// Request body after the latest resolution pass
    pub request_data: Fields,
    /// Literal headers, materialized once at load
    pub request_headers: Vec<(String, String)>,
    /// Set by the load-time pass when the body needs execution-time resolution
    pub contains_references: bool,
    /// `None` until the call returns, then never replaced
    pub response: Option<Fields>,
    pub response_json: String,
    pub status: Option<CallStatus>,
    pub conditions: Vec<InvokeCondition>,
}

impl Invoke {
    pub fn new(decl: InvokeDecl, expectations: Vec<Expectation>) -> Self {
        Self {
            decl,
            expectations,
            request_data: Fields::new(),
            request_headers: Vec::new(),
            contains_references: false,
            response: None,
            response_json: String::new(),
            status: None,
            conditions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.decl.name
    }

    pub fn pos(&self) -> &Position {
        &self.decl.pos
    }

    /// `service/method` symbol for diagnostics
    pub fn symbol(&self) -> String {
        format!("{}/{}", self.decl.service, self.decl.rpc)
    }

    /// Store the call result. Only the first capture takes effect.
    pub fn capture(&mut self, response: Fields, status: CallStatus) {
        if self.response.is_some() {
            return;
        }
        self.response_json = serde_json::to_string_pretty(&Value::Map(response.clone()).to_json())
            .unwrap_or_else(|_| "{}".to_string());
        self.response = Some(response);
        self.status = Some(status);
    }
}

/// Declared invokes in order, addressable by name
#[derive(Debug, Default)]
pub struct InvokeRegistry {
    invokes: Vec<Invoke>,
    index: HashMap<String, usize>,
}

impl InvokeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an invoke; names must be unique across the whole specification
    pub fn insert(&mut self, invoke: Invoke) -> Result<usize> {
        if let Some(&existing) = self.index.get(invoke.name()) {
            return Err(Error::DuplicateInvoke {
                name: invoke.name().to_string(),
                pos: invoke.pos().clone(),
                first: self.invokes[existing].pos().clone(),
            });
        }
        let position = self.invokes.len();
        self.index.insert(invoke.name().to_string(), position);
        self.invokes.push(invoke);
        Ok(position)
    }

    pub fn len(&self) -> usize {
        self.invokes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invokes.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&Invoke> {
        self.position(name).map(|i| &self.invokes[i])
    }

    pub fn at(&self, position: usize) -> &Invoke {
        &self.invokes[position]
    }

    pub fn at_mut(&mut self, position: usize) -> &mut Invoke {
        &mut self.invokes[position]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Invoke> {
        self.invokes.iter()
    }

    /// Resolve the request body of the invoke at `position`.
    ///
    /// The load-time pass (`allow_references == false`) also materializes the
    /// literal headers; the execution-time pass leaves them untouched.
    pub fn resolve_request(&mut self, position: usize, allow_references: bool) -> Result<()> {
        let scope = Scope::new(self, position, allow_references);
        let decl = &self.invokes[position].decl;

        let mut data = Fields::new();
        let mut contains_references = false;
        for field in &decl.data {
            let (value, has_reference) = scope
                .evaluate(&field.value)
                .map_err(|source| Error::Resolve { source, pos: field.value.pos.clone() })?;
            contains_references |= has_reference;
            data.insert(field.key.clone(), value);
        }

        let headers = (!allow_references).then(|| {
            decl.headers
                .iter()
                .map(|h| (h.key.clone(), h.value.clone()))
                .collect::<Vec<_>>()
        });

        let invoke = &mut self.invokes[position];
        invoke.request_data = data;
        if !allow_references {
            invoke.contains_references = contains_references;
        }
        if let Some(headers) = headers {
            invoke.request_headers = headers;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::syntax::{DataField, HeaderDecl, PathExpr, Part, ValueExpr, ValueKind};

    fn field(key: &str, kind: ValueKind) -> DataField {
        DataField {
            pos: Position::default(),
            key: key.to_string(),
            value: ValueExpr { pos: Position::default(), kind },
        }
    }

    #[test]
    fn test_duplicate_names_report_both_positions() {
        let mut registry = InvokeRegistry::new();
        registry.insert(Invoke::new(decl("login"), Vec::new())).unwrap();

        let mut again = decl("login");
        again.pos.line = 9;
        let err = registry.insert(Invoke::new(again, Vec::new())).unwrap_err();
        match err {
            Error::DuplicateInvoke { name, pos, first } => {
                assert_eq!(name, "login");
                assert_eq!(pos.line, 9);
                assert_eq!(first.line, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_two_pass_resolution() {
        let mut registry = InvokeRegistry::new();
        let mut login = decl("login");
        login.data.push(field("user", ValueKind::String("a".into())));
        registry.insert(Invoke::new(login, Vec::new())).unwrap();

        let mut who = decl("whoAmI");
        who.headers.push(HeaderDecl { pos: Position::default(), key: "x-id".into(), value: "1".into() });
        who.data.push(field(
            "token",
            ValueKind::Reference(PathExpr {
                parts: vec![Part::new("login"), Part::new("response"), Part::new("token")],
            }),
        ));
        registry.insert(Invoke::new(who, Vec::new())).unwrap();

        registry.resolve_request(0, false).unwrap();
        registry.resolve_request(1, false).unwrap();
        assert!(!registry.at(0).contains_references);
        assert!(registry.at(1).contains_references);
        assert_eq!(registry.at(1).request_headers, vec![("x-id".to_string(), "1".to_string())]);

        let mut response = Fields::new();
        response.insert("token".into(), Value::from("xyz"));
        registry.at_mut(0).capture(response, CallStatus::ok());

        registry.resolve_request(1, true).unwrap();
        let who = registry.at(1);
        assert_eq!(who.request_data.get("token"), Some(&Value::from("xyz")));
        assert!(who.contains_references);
        assert_eq!(who.request_headers.len(), 1);
    }

    #[test]
    fn test_capture_happens_once() {
        let mut invoke = invoke_with_response("a", Value::from_json(serde_json::json!({ "v": 1 })));
        invoke.capture(Fields::new(), CallStatus::ok());
        assert_eq!(invoke.response.as_ref().map(|r| r.len()), Some(1));
        assert!(invoke.response_json.contains("\"v\": 1"));
    }
}
