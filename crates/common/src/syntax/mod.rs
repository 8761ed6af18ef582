//! trpc specification language front end
//!
//! Turns the text of a `.trpc` file into the [`SpecFile`] entry list the
//! runner consumes. Grammar (informal):
//!
//! ```text
//! test "<name>" desc "<description>" trpc "<version>"
//!     (maxtime <float>)? (timeout <float>)? (verbose <int>)?
//! importpath "<dir>"
//! import protofile "<file>"
//! import protoset "<file>"
//! endpoint <ident> (tls)? "<host>" port <int> (path /a/b)? (reflectPath /a/b)? (ignTrailer)?
//! invoke <ident> <endpoint> <service>(.<service>)* <rpc>
//!     (goal "<text>")?
//!     (headers { "key": "value", ... })?
//!     (data { key: <value>, ... })?
//!     (expects { <path> <fn>(<arg>?) (onFail Panic|Warn|Ignore)? ... })?
//! ```
//!
//! Statements may be separated by `;` or plain whitespace.

pub mod ast;
mod lexer;
mod parser;

pub use ast::*;

use crate::error::{Error, Result};

/// Tokenizer/parser failure before positions are attached to a file
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl SyntaxError {
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self { line, column, message: message.into() }
    }
}

/// Parse the source text of one specification file
pub fn parse(filename: &str, source: &str) -> Result<SpecFile> {
    let to_error = |e: SyntaxError| Error::Syntax {
        message: e.message,
        pos: Position { filename: filename.to_string(), line: e.line, column: e.column },
    };

    let tokens = lexer::Lexer::new(source).tokenize().map_err(to_error)?;
    let entries = parser::Parser::new(filename, tokens).parse_entries().map_err(to_error)?;

    Ok(SpecFile {
        filename: filename.to_string(),
        lines: source.lines().map(str::to_string).collect(),
        entries,
    })
}

/// Read and parse a specification file from disk
pub fn parse_file(path: &std::path::Path) -> Result<SpecFile> {
    let source = std::fs::read_to_string(path)?;
    parse(&path.display().to_string(), &source)
}
