//! Expectations: compiled checks, severities, and recorded failures

use std::fmt;
use std::str::FromStr;

use tonic::Code;

use crate::error::{Error, Result};
use crate::invoker::CallStatus;
use crate::registry::InvokeRegistry;
use crate::syntax::{ExpectDecl, Part, PathExpr, Position, ValueExpr};
use crate::value::{Scope, Value};

/// How a failed expectation affects the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    /// Abort the run
    #[default]
    Panic,
    /// Continue and flag
    Warn,
    /// Continue and tally
    Ignore,
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Panic" => Ok(Severity::Panic),
            "Warn" => Ok(Severity::Warn),
            "Ignore" => Ok(Severity::Ignore),
            other => Err(format!("Invalid onFail param {other}, expected Panic, Warn or Ignore")),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Panic => "Panic",
            Severity::Warn => "Warn",
            Severity::Ignore => "Ignore",
        })
    }
}

const CODE_CHECKS: &[(&str, Code)] = &[
    ("isOk", Code::Ok),
    ("isCanceled", Code::Cancelled),
    ("isUnknown", Code::Unknown),
    ("isInvalidArgument", Code::InvalidArgument),
    ("isDeadlineExceeded", Code::DeadlineExceeded),
    ("isNotFound", Code::NotFound),
    ("isAlreadyExists", Code::AlreadyExists),
    ("isPermissionDenied", Code::PermissionDenied),
    ("isResourceExhausted", Code::ResourceExhausted),
    ("isFailedPrecondition", Code::FailedPrecondition),
    ("isAborted", Code::Aborted),
    ("isOutOfRange", Code::OutOfRange),
    ("isUnimplemented", Code::Unimplemented),
    ("isInternal", Code::Internal),
    ("isUnavailable", Code::Unavailable),
    ("isDataLoss", Code::DataLoss),
    ("isUnauthenticated", Code::Unauthenticated),
];

/// Canonical name of a status code, e.g. `NotFound`
pub fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "Canceled",
        Code::Unknown => "Unknown",
        Code::InvalidArgument => "InvalidArgument",
        Code::DeadlineExceeded => "DeadlineExceeded",
        Code::NotFound => "NotFound",
        Code::AlreadyExists => "AlreadyExists",
        Code::PermissionDenied => "PermissionDenied",
        Code::ResourceExhausted => "ResourceExhausted",
        Code::FailedPrecondition => "FailedPrecondition",
        Code::Aborted => "Aborted",
        Code::OutOfRange => "OutOfRange",
        Code::Unimplemented => "Unimplemented",
        Code::Internal => "Internal",
        Code::Unavailable => "Unavailable",
        Code::DataLoss => "DataLoss",
        Code::Unauthenticated => "Unauthenticated",
    }
}

/// Operation applied to a field below `response`
#[derive(Debug, Clone)]
pub enum FieldOp {
    HasValue,
    IsNull,
    IsEqual(ValueExpr),
    IsNotEmpty,
}

/// A check with its subject family already decided
#[derive(Debug, Clone)]
pub enum Check {
    Code(Code),
    MessageEquals(ValueExpr),
    MessageEmpty,
    MessageNotEmpty,
    ResponseEmpty,
    Field { path: Vec<Part>, op: FieldOp },
}

/// Outcome of one check
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass,
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct Expectation {
    pub pos: Position,
    pub subject: PathExpr,
    pub function: String,
    pub check: Check,
    pub severity: Severity,
}

impl Expectation {
    /// Validate subject root, check name, argument, and `onFail` tag
    pub fn compile(decl: &ExpectDecl) -> Result<Self> {
        let severity = match &decl.on_fail {
            None => Severity::Panic,
            Some((pos, tag)) => tag.parse().map_err(|msg: String| Error::syntax(pos, msg))?,
        };

        let function = &decl.function;
        let name = function.name.as_str();
        let fn_error = |family: &str| {
            Error::syntax(&function.pos, format!("Invalid function for examining {family}: \"{name}\""))
        };
        let required_arg = || {
            function
                .arg
                .clone()
                .ok_or_else(|| Error::syntax(&function.pos, format!("{name} requires an argument")))
        };

        let parts = &decl.path.parts;
        let root = &parts[0];
        if !root.accessors.is_empty() {
            return Err(Error::syntax(&decl.pos, format!("Expect subject \"{root}\" cannot be indexed")));
        }

        let check = match (root.ident.as_str(), parts.len()) {
            ("code", 1) => CODE_CHECKS
                .iter()
                .find(|(fn_name, _)| *fn_name == name)
                .map(|(_, code)| Check::Code(*code))
                .ok_or_else(|| fn_error("code"))?,
            ("message", 1) => match name {
                "isEqual" => Check::MessageEquals(required_arg()?),
                "isEmpty" => Check::MessageEmpty,
                "isNotEmpty" | "hasValue" => Check::MessageNotEmpty,
                _ => return Err(fn_error("message")),
            },
            ("response", 1) => match name {
                "isEmpty" => Check::ResponseEmpty,
                _ => return Err(fn_error("response")),
            },
            ("response", _) => {
                let op = match name {
                    "hasValue" => FieldOp::HasValue,
                    "isNull" => FieldOp::IsNull,
                    "isEqual" => FieldOp::IsEqual(required_arg()?),
                    "isNotEmpty" => FieldOp::IsNotEmpty,
                    _ => return Err(fn_error("response fields")),
                };
                Check::Field { path: parts[1..].to_vec(), op }
            }
            _ => {
                return Err(Error::syntax(&decl.pos, format!("Unknown expect code \"{}\"", decl.path)));
            }
        };

        Ok(Self {
            pos: decl.pos.clone(),
            subject: decl.path.clone(),
            function: name.to_string(),
            check,
            severity,
        })
    }

    /// Argument the check compares against, if it takes one
    pub fn argument(&self) -> Option<&ValueExpr> {
        match &self.check {
            Check::MessageEquals(expr) | Check::Field { op: FieldOp::IsEqual(expr), .. } => Some(expr),
            _ => None,
        }
    }

    /// Load-time check that references in the argument name this invoke or an earlier one
    pub fn check_references(&self, registry: &InvokeRegistry, position: usize) -> Result<()> {
        let Some(expr) = self.argument() else {
            return Ok(());
        };
        Scope::new(registry, position + 1, false)
            .evaluate(expr)
            .map(|_| ())
            .map_err(|source| Error::Resolve { source, pos: expr.pos.clone() })
    }

    /// Run the check against the captured result of the invoke at `position`.
    ///
    /// `Err` means the expectation itself cannot be evaluated; a check that
    /// simply does not hold is `Ok(Verdict::Fail)`.
    pub fn evaluate(&self, registry: &InvokeRegistry, position: usize) -> Result<Verdict> {
        let invoke = registry.at(position);
        let status = invoke.status.clone().unwrap_or_else(CallStatus::ok);
        // the invoke itself is resolvable from its own expectations
        let scope = Scope::new(registry, position + 1, true);
        let argument = |expr: &ValueExpr| {
            scope
                .evaluate(expr)
                .map(|(value, _)| value)
                .map_err(|source| Error::Resolve { source, pos: expr.pos.clone() })
        };

        let verdict = match &self.check {
            Check::Code(expected) => {
                if status.code == *expected {
                    Verdict::Pass
                } else {
                    Verdict::Fail(format!(
                        "Response code expected to be ({}) but got ({})",
                        code_name(*expected),
                        code_name(status.code)
                    ))
                }
            }
            Check::MessageEquals(expr) => {
                let expected = argument(expr)?.to_string();
                if status.message == expected {
                    Verdict::Pass
                } else {
                    Verdict::Fail(format!(
                        "Response message expected to be \"{expected}\" but got \"{}\"",
                        status.message
                    ))
                }
            }
            Check::MessageEmpty => {
                if status.message.is_empty() {
                    Verdict::Pass
                } else {
                    Verdict::Fail(format!("Response message expected to be empty but got \"{}\"", status.message))
                }
            }
            Check::MessageNotEmpty => {
                if status.message.is_empty() {
                    Verdict::Fail("Response message expected to have value but it is empty".to_string())
                } else {
                    Verdict::Pass
                }
            }
            Check::ResponseEmpty => match &invoke.response {
                Some(response) if response.is_empty() => Verdict::Pass,
                Some(_) => Verdict::Fail(format!(
                    "Response expected to be empty but it is not\nActual response:\n{}",
                    invoke.response_json
                )),
                None => Verdict::Fail("Expect check value on invocation with error response".to_string()),
            },
            Check::Field { path, op } => {
                let Some(response) = &invoke.response else {
                    return Ok(Verdict::Fail("Expect check value on invocation with error response".to_string()));
                };
                if !response.contains_key(&path[0].ident) {
                    return Ok(Verdict::Fail(format!("Field {} not found on {}", path[0].ident, invoke.decl.rpc)));
                }

                // the subject is resolved as a reference rooted at this invoke
                let mut parts = vec![Part::new(invoke.name()), Part::new("response")];
                parts.extend(path.iter().cloned());
                let reference = PathExpr { parts };
                let actual = match scope.resolve(&reference) {
                    Ok(value) => value,
                    Err(err) if err.is_data_error() => return Ok(Verdict::Fail(err.to_string())),
                    Err(source) => return Err(Error::Resolve { source, pos: self.pos.clone() }),
                };
                self.field_verdict(op, &actual, &invoke.response_json, argument)?
            }
        };
        Ok(verdict)
    }

    fn field_verdict<F>(&self, op: &FieldOp, actual: &Value, response_json: &str, argument: F) -> Result<Verdict>
    where
        F: Fn(&ValueExpr) -> Result<Value>,
    {
        let subject = &self.subject;
        let verdict = match op {
            FieldOp::HasValue => {
                if actual.is_null() {
                    Verdict::Fail(format!("{subject} expected to have a value but got null"))
                } else {
                    Verdict::Pass
                }
            }
            FieldOp::IsNull => {
                if actual.is_null() {
                    Verdict::Pass
                } else {
                    Verdict::Fail(format!(
                        "{subject} expected to be null but got ({actual}) {}\nActual response:\n{response_json}",
                        actual.kind_name()
                    ))
                }
            }
            FieldOp::IsEqual(expr) => {
                let expected = argument(expr)?;
                if *actual == expected {
                    Verdict::Pass
                } else {
                    Verdict::Fail(format!(
                        "{subject} expected to be \"{expected}\" but got \"{actual}\"\n\nActual response:\n{response_json}"
                    ))
                }
            }
            FieldOp::IsNotEmpty => match actual {
                Value::Null => Verdict::Fail(format!("{subject} expected not to be empty but got null")),
                other if other.is_empty() => {
                    Verdict::Fail(format!("{subject} expected not to be empty but got empty {}", other.kind_name()))
                }
                _ => Verdict::Pass,
            },
        };
        Ok(verdict)
    }
}

/// Record of one failed expectation, appended to its invoke
#[derive(Debug, Clone)]
pub struct InvokeCondition {
    pub severity: Severity,
    pub expectation: Expectation,
    pub message: String,
}
