//! Recursive descent parser producing the entry list

use super::ast::*;
use super::lexer::{Spanned, Token};
use super::SyntaxError;

pub struct Parser<'a> {
    filename: &'a str,
    tokens: Vec<Spanned>,
    cursor: usize,
}

impl<'a> Parser<'a> {
    pub fn new(filename: &'a str, tokens: Vec<Spanned>) -> Self {
        Self { filename, tokens, cursor: 0 }
    }

    pub fn parse_entries(&mut self) -> Result<Vec<Entry>, SyntaxError> {
        let mut entries = Vec::new();
        loop {
            while self.eat_punct(';') {}
            if self.peek() == &Token::Eof {
                return Ok(entries);
            }
            entries.push(self.entry()?);
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn entry(&mut self) -> Result<Entry, SyntaxError> {
        let pos = self.pos();
        let keyword = self.ident("a statement keyword")?;
        let kind = match keyword.as_str() {
            "test" => EntryKind::Metadata(self.metadata()?),
            "importpath" => EntryKind::ImportPath(self.string()?),
            "import" => {
                let what = self.ident("protofile or protoset")?;
                match what.as_str() {
                    "protofile" => EntryKind::ImportProtoFile(self.string()?),
                    "protoset" => EntryKind::ImportProtoSet(self.string()?),
                    other => return Err(self.error_at(&pos, format!("expected protofile or protoset, found {other}"))),
                }
            }
            "endpoint" => EntryKind::Endpoint(self.endpoint(pos.clone())?),
            "invoke" => EntryKind::Invoke(self.invoke(pos.clone())?),
            other => {
                return Err(self.error_at(&pos, format!("unknown statement \"{other}\"")));
            }
        };
        Ok(Entry { pos, kind })
    }

    fn metadata(&mut self) -> Result<TestMeta, SyntaxError> {
        let mut meta = TestMeta { name: self.string()?, ..Default::default() };
        self.separators();
        self.keyword("desc")?;
        meta.description = self.string()?;
        self.separators();
        self.keyword("trpc")?;
        meta.version = self.string()?;

        loop {
            let save = self.cursor;
            self.separators();
            if self.eat_keyword("maxtime") {
                meta.max_time = self.number()?;
            } else if self.eat_keyword("timeout") {
                meta.timeout = self.number()?;
            } else if self.eat_keyword("verbose") {
                meta.verbose = self.int()?;
            } else {
                self.cursor = save;
                return Ok(meta);
            }
        }
    }

    fn endpoint(&mut self, pos: Position) -> Result<EndpointDecl, SyntaxError> {
        let name = self.ident("endpoint name")?;
        let tls = self.eat_keyword("tls");
        let host = self.string()?;
        self.keyword("port")?;
        let port_pos = self.pos();
        let port = self.int()?;
        let port = u16::try_from(port).map_err(|_| self.error_at(&port_pos, format!("port {port} out of range")))?;
        let path_prefix = if self.eat_keyword("path") { Some(self.url_path()?) } else { None };
        let reflect_path = if self.eat_keyword("reflectPath") { Some(self.url_path()?) } else { None };
        let ignore_trailers = self.eat_keyword("ignTrailer");
        Ok(EndpointDecl { pos, name, tls, host, port, path_prefix, reflect_path, ignore_trailers })
    }

    fn invoke(&mut self, pos: Position) -> Result<InvokeDecl, SyntaxError> {
        let name = self.ident("invoke name")?;
        let endpoint = self.ident("endpoint name")?;
        let mut service = self.ident("service name")?;
        while self.eat_punct('.') {
            service.push('.');
            service.push_str(&self.ident("service name")?);
        }
        let rpc = self.ident("rpc name")?;

        let mut decl = InvokeDecl {
            pos,
            name,
            endpoint,
            service,
            rpc,
            goal: None,
            headers: Vec::new(),
            data: Vec::new(),
            expects: Vec::new(),
        };

        if self.eat_keyword("goal") {
            decl.goal = Some(self.string()?);
        }
        if self.eat_keyword("headers") {
            self.punct('{')?;
            while !self.eat_punct('}') {
                let pos = self.pos();
                let key = self.string()?;
                self.punct(':')?;
                let value = self.string()?;
                self.eat_punct(',');
                decl.headers.push(HeaderDecl { pos, key, value });
            }
        }
        if self.eat_keyword("data") {
            self.punct('{')?;
            while !self.eat_punct('}') {
                let pos = self.pos();
                let key = self.ident("field name")?;
                self.punct(':')?;
                let value = self.value()?;
                self.eat_punct(',');
                decl.data.push(DataField { pos, key, value });
            }
        }
        if self.eat_keyword("expects") {
            self.punct('{')?;
            while !self.eat_punct('}') {
                decl.expects.push(self.expect()?);
            }
        }
        Ok(decl)
    }

    fn expect(&mut self) -> Result<ExpectDecl, SyntaxError> {
        let pos = self.pos();
        let path = self.path_expr()?;
        let fn_pos = self.pos();
        let name = self.ident("check function")?;
        self.punct('(')?;
        let arg = if self.eat_punct(')') {
            None
        } else {
            let value = self.value()?;
            self.punct(')')?;
            Some(value)
        };
        let on_fail = if self.eat_keyword("onFail") {
            let tag_pos = self.pos();
            Some((tag_pos, self.ident("Panic, Warn or Ignore")?))
        } else {
            None
        };
        self.eat_punct(',');
        self.eat_punct(';');
        Ok(ExpectDecl { pos, path, function: FunctionCall { pos: fn_pos, name, arg }, on_fail })
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    fn value(&mut self) -> Result<ValueExpr, SyntaxError> {
        let pos = self.pos();
        let kind = match self.peek().clone() {
            Token::Str(s) => {
                self.advance();
                ValueKind::String(s)
            }
            Token::Int(i) => {
                self.advance();
                ValueKind::Int(i)
            }
            Token::Float(f) => {
                self.advance();
                ValueKind::Float(f)
            }
            Token::Punct('{') => {
                self.advance();
                let mut entries = Vec::new();
                while !self.eat_punct('}') {
                    let key = self.ident("map key")?;
                    self.punct(':')?;
                    entries.push((key, self.value()?));
                    self.eat_punct(',');
                }
                ValueKind::Map(entries)
            }
            Token::Punct('[') => {
                self.advance();
                let mut elements = Vec::new();
                while !self.eat_punct(']') {
                    elements.push(self.value()?);
                    self.eat_punct(',');
                }
                ValueKind::Array(elements)
            }
            Token::Ident(ident) => {
                let next = self.peek_at(1);
                if matches!(next, Token::Punct('.') | Token::Punct('[')) {
                    ValueKind::Reference(self.path_expr()?)
                } else {
                    self.advance();
                    match ident.as_str() {
                        "true" => ValueKind::Bool(true),
                        "false" => ValueKind::Bool(false),
                        _ => ValueKind::RawIdent(ident),
                    }
                }
            }
            other => return Err(self.error_at(&pos, format!("expected a value, found {other}"))),
        };
        Ok(ValueExpr { pos, kind })
    }

    fn path_expr(&mut self) -> Result<PathExpr, SyntaxError> {
        let mut parts = vec![self.part()?];
        while self.eat_punct('.') {
            parts.push(self.part()?);
        }
        Ok(PathExpr { parts })
    }

    fn part(&mut self) -> Result<Part, SyntaxError> {
        let mut part = Part::new(self.ident("path segment")?);
        while self.eat_punct('[') {
            let pos = self.pos();
            let accessor = match self.peek().clone() {
                Token::Str(s) => Accessor::Key(s),
                Token::Int(i) => Accessor::Index(i),
                other => return Err(self.error_at(&pos, format!("expected string or integer index, found {other}"))),
            };
            self.advance();
            self.punct(']')?;
            part.accessors.push(accessor);
        }
        Ok(part)
    }

    fn url_path(&mut self) -> Result<String, SyntaxError> {
        let mut path = String::new();
        self.punct('/')?;
        path.push('/');
        path.push_str(&self.ident("path segment")?);
        while self.peek() == &Token::Punct('/') {
            self.advance();
            path.push('/');
            path.push_str(&self.ident("path segment")?);
        }
        Ok(path)
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.cursor + offset)
            .or_else(|| self.tokens.last())
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) {
        if self.cursor < self.tokens.len().saturating_sub(1) {
            self.cursor += 1;
        }
    }

    fn pos(&self) -> Position {
        let (line, column) = self
            .tokens
            .get(self.cursor)
            .map(|s| (s.line, s.column))
            .unwrap_or((0, 0));
        Position { filename: self.filename.to_string(), line, column }
    }

    fn error_at(&self, pos: &Position, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(pos.line, pos.column, message)
    }

    fn unexpected(&self, expected: &str) -> SyntaxError {
        let pos = self.pos();
        self.error_at(&pos, format!("expected {expected}, found {}", self.peek()))
    }

    fn separators(&mut self) {
        while self.eat_punct(';') {}
    }

    fn ident(&mut self, expected: &str) -> Result<String, SyntaxError> {
        match self.peek().clone() {
            Token::Ident(s) => {
                self.advance();
                Ok(s)
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    fn string(&mut self) -> Result<String, SyntaxError> {
        match self.peek().clone() {
            Token::Str(s) => {
                self.advance();
                Ok(s)
            }
            _ => Err(self.unexpected("a quoted string")),
        }
    }

    fn int(&mut self) -> Result<i64, SyntaxError> {
        match self.peek().clone() {
            Token::Int(i) => {
                self.advance();
                Ok(i)
            }
            _ => Err(self.unexpected("an integer")),
        }
    }

    fn number(&mut self) -> Result<f64, SyntaxError> {
        match self.peek().clone() {
            Token::Float(f) => {
                self.advance();
                Ok(f)
            }
            Token::Int(i) => {
                self.advance();
                Ok(i as f64)
            }
            _ => Err(self.unexpected("a number")),
        }
    }

    fn keyword(&mut self, keyword: &str) -> Result<(), SyntaxError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("\"{keyword}\"")))
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Token::Ident(s) if s == keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn punct(&mut self, c: char) -> Result<(), SyntaxError> {
        if self.eat_punct(c) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{c}'")))
        }
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.peek() == &Token::Punct(c) {
            self.advance();
            true
        } else {
            false
        }
    }
}
