//! Syntax tree of a trpc specification file

use std::fmt;

/// Location of a node in the source file (1-based line and column)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Position {
    pub filename: String,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.filename, self.line, self.column)
    }
}

/// A parsed specification file together with its source lines
#[derive(Debug, Clone)]
pub struct SpecFile {
    pub filename: String,
    pub lines: Vec<String>,
    pub entries: Vec<Entry>,
}

impl SpecFile {
    /// Source text of a 1-based line, empty when out of range
    pub fn line(&self, line: usize) -> &str {
        line.checked_sub(1)
            .and_then(|idx| self.lines.get(idx))
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// One top-level statement
#[derive(Debug, Clone)]
pub struct Entry {
    pub pos: Position,
    pub kind: EntryKind,
}

#[derive(Debug, Clone)]
pub enum EntryKind {
    Metadata(TestMeta),
    ImportPath(String),
    ImportProtoFile(String),
    ImportProtoSet(String),
    Endpoint(EndpointDecl),
    Invoke(InvokeDecl),
}

/// Run-level metadata carried by the first statement
#[derive(Debug, Clone, Default)]
pub struct TestMeta {
    pub name: String,
    pub description: String,
    pub version: String,
    /// Overall deadline for the run in seconds, 0 when unset
    pub max_time: f64,
    /// Dial timeout in seconds, 0 when unset
    pub timeout: f64,
    pub verbose: i64,
}

/// A named remote target
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointDecl {
    pub pos: Position,
    pub name: String,
    pub tls: bool,
    pub host: String,
    pub port: u16,
    /// Prefix prepended to every call path, e.g. `/api/grpc`
    pub path_prefix: Option<String>,
    /// Prefix used for reflection calls, falls back to `path_prefix`
    pub reflect_path: Option<String>,
    pub ignore_trailers: bool,
}

impl EndpointDecl {
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct InvokeDecl {
    pub pos: Position,
    pub name: String,
    pub endpoint: String,
    /// Fully-qualified service name, e.g. `auth.v1.Auth`
    pub service: String,
    pub rpc: String,
    pub goal: Option<String>,
    pub headers: Vec<HeaderDecl>,
    pub data: Vec<DataField>,
    pub expects: Vec<ExpectDecl>,
}

#[derive(Debug, Clone)]
pub struct HeaderDecl {
    pub pos: Position,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct DataField {
    pub pos: Position,
    pub key: String,
    pub value: ValueExpr,
}

/// A value as written in the specification, before evaluation
#[derive(Debug, Clone)]
pub struct ValueExpr {
    pub pos: Position,
    pub kind: ValueKind,
}

#[derive(Debug, Clone)]
pub enum ValueKind {
    String(String),
    RawIdent(String),
    Float(f64),
    Int(i64),
    Bool(bool),
    Map(Vec<(String, ValueExpr)>),
    Array(Vec<ValueExpr>),
    Reference(PathExpr),
}

/// Dotted path with optional index accessors: `login.response.items[0].id`
#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    pub parts: Vec<Part>,
}

impl PathExpr {
    pub fn root(&self) -> Option<&str> {
        self.parts.first().map(|p| p.ident.as_str())
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub ident: String,
    pub accessors: Vec<Accessor>,
}

impl Part {
    pub fn new(ident: impl Into<String>) -> Self {
        Self { ident: ident.into(), accessors: Vec::new() }
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ident)?;
        for acc in &self.accessors {
            write!(f, "[{acc}]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accessor {
    Key(String),
    Index(i64),
}

impl fmt::Display for Accessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Accessor::Key(key) => write!(f, "{key:?}"),
            Accessor::Index(idx) => write!(f, "{idx}"),
        }
    }
}

/// `<path> <function>(<arg>?) (onFail <tag>)?`
#[derive(Debug, Clone)]
pub struct ExpectDecl {
    pub pos: Position,
    pub path: PathExpr,
    pub function: FunctionCall,
    pub on_fail: Option<(Position, String)>,
}

#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub pos: Position,
    pub name: String,
    pub arg: Option<ValueExpr>,
}
