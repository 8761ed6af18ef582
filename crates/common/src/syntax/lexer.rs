//! Tokenizer for trpc specification files

use std::fmt;

use super::SyntaxError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Punct(char),
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{s}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Int(i) => write!(f, "{i}"),
            Token::Float(v) => write!(f, "{v}"),
            Token::Punct(c) => write!(f, "{c}"),
            Token::Eof => f.write_str("end of file"),
        }
    }
}

/// Token with its 1-based line and column
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
    pub column: usize,
}

const PUNCTUATION: &[char] = &[';', '{', '}', '[', ']', '(', ')', ':', ',', '.', '/'];

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { chars: input.chars().peekable(), line: 1, column: 1 }
    }

    pub fn tokenize(mut self) -> Result<Vec<Spanned>, SyntaxError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let (line, column) = (self.line, self.column);
            let Some(&ch) = self.chars.peek() else {
                tokens.push(Spanned { token: Token::Eof, line, column });
                return Ok(tokens);
            };

            let token = match ch {
                '"' => {
                    self.bump();
                    Token::Str(self.quoted(line, column)?)
                }
                '`' => {
                    self.bump();
                    Token::Str(self.raw(line, column)?)
                }
                '-' | '0'..='9' => self.number(line, column)?,
                c if c.is_alphabetic() || c == '_' => {
                    let mut ident = String::new();
                    while let Some(&c) = self.chars.peek() {
                        if c.is_alphanumeric() || c == '_' {
                            ident.push(c);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    Token::Ident(ident)
                }
                c if PUNCTUATION.contains(&c) => {
                    self.bump();
                    Token::Punct(c)
                }
                other => {
                    return Err(SyntaxError::new(line, column, format!("unexpected character '{other}'")));
                }
            };
            tokens.push(Spanned { token, line, column });
        }
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn skip_trivia(&mut self) -> Result<(), SyntaxError> {
        while let Some(&ch) = self.chars.peek() {
            match ch {
                c if c.is_whitespace() => {
                    self.bump();
                }
                '#' => self.skip_line(),
                '/' => {
                    let mut ahead = self.chars.clone();
                    ahead.next();
                    match ahead.peek() {
                        Some('/') => self.skip_line(),
                        Some('*') => {
                            let (line, column) = (self.line, self.column);
                            self.bump();
                            self.bump();
                            let mut prev = '\0';
                            loop {
                                match self.bump() {
                                    Some('/') if prev == '*' => break,
                                    Some(c) => prev = c,
                                    None => {
                                        return Err(SyntaxError::new(line, column, "unterminated block comment"));
                                    }
                                }
                            }
                        }
                        _ => return Ok(()),
                    }
                }
                _ => return Ok(()),
            }
        }
        Ok(())
    }

    fn skip_line(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn quoted(&mut self, line: usize, column: usize) -> Result<String, SyntaxError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => {
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('r') => '\r',
                        Some('t') => '\t',
                        Some('0') => '\0',
                        Some('\\') => '\\',
                        Some('"') => '"',
                        Some('\'') => '\'',
                        Some('u') => {
                            let mut hex = String::new();
                            for _ in 0..4 {
                                match self.bump() {
                                    Some(c) if c.is_ascii_hexdigit() => hex.push(c),
                                    _ => {
                                        return Err(SyntaxError::new(line, column, "invalid \\u escape in string"));
                                    }
                                }
                            }
                            u32::from_str_radix(&hex, 16)
                                .ok()
                                .and_then(char::from_u32)
                                .ok_or_else(|| SyntaxError::new(line, column, "invalid \\u escape in string"))?
                        }
                        Some(other) => {
                            return Err(SyntaxError::new(line, column, format!("unknown escape '\\{other}'")));
                        }
                        None => return Err(SyntaxError::new(line, column, "unterminated string")),
                    };
                    out.push(escaped);
                }
                Some('\n') | None => return Err(SyntaxError::new(line, column, "unterminated string")),
                Some(c) => out.push(c),
            }
        }
    }

    fn raw(&mut self, line: usize, column: usize) -> Result<String, SyntaxError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('`') => return Ok(out),
                Some(c) => out.push(c),
                None => return Err(SyntaxError::new(line, column, "unterminated raw string")),
            }
        }
    }

    fn number(&mut self, line: usize, column: usize) -> Result<Token, SyntaxError> {
        let mut text = String::new();
        if self.chars.peek() == Some(&'-') {
            text.push('-');
            self.bump();
        }
        let mut is_float = false;
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else if c == '.' && !is_float {
                // `1.x` is not a float; only consume the dot when a digit follows
                let mut ahead = self.chars.clone();
                ahead.next();
                if !matches!(ahead.peek(), Some(d) if d.is_ascii_digit()) {
                    break;
                }
                is_float = true;
                text.push(c);
                self.bump();
            } else if (c == 'e' || c == 'E') && text.chars().any(|c| c.is_ascii_digit()) {
                is_float = true;
                text.push(c);
                self.bump();
                if let Some(&sign) = self.chars.peek() {
                    if sign == '+' || sign == '-' {
                        text.push(sign);
                        self.bump();
                    }
                }
            } else {
                break;
            }
        }

        if text == "-" {
            return Err(SyntaxError::new(line, column, "expected digits after '-'"));
        }
        if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .map_err(|_| SyntaxError::new(line, column, format!("invalid float literal {text}")))
        } else {
            text.parse::<i64>()
                .map(Token::Int)
                .map_err(|_| SyntaxError::new(line, column, format!("invalid integer literal {text}")))
        }
    }
}
