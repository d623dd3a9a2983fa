//! Module code decoding and admission
//!
//! Module code is stored base64-encoded and must decode to exactly one
//! function expression: `function (...) {...}`, `(...) => ...` or
//! `x => ...`, optionally `async` and optionally wrapped in parentheses.
//! The check is purely lexical. Code is never evaluated in this process.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodeError {
    #[error("Code is not valid base64: {0}")]
    InvalidEncoding(String),

    #[error("Code is not valid UTF-8")]
    InvalidUtf8,

    #[error("Code is empty")]
    Empty,

    #[error("Code is not a function expression (offset {0})")]
    NotAFunction(usize),

    #[error("Unbalanced bracket at offset {0}")]
    Unbalanced(usize),

    #[error("Unterminated {what} starting at offset {offset}")]
    Unterminated { what: &'static str, offset: usize },

    #[error("Unexpected input after function expression at offset {0}")]
    TrailingInput(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Arrow,
    Function,
}

/// Lexical shape of an admitted function literal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionShape {
    pub kind: FunctionKind,
    pub is_async: bool,
    /// Number of declared positional parameters
    pub arity: usize,
}

/// Decoded source ready for injection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCode {
    /// The function expression without trailing `;` or trivia
    pub source: String,
    pub shape: FunctionShape,
}

pub fn decode(encoded: &str) -> Result<String, CodeError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CodeError::InvalidEncoding(e.to_string()))?;
    String::from_utf8(bytes).map_err(|_| CodeError::InvalidUtf8)
}

/// Decode and check that the code is a single function literal
pub fn admit(encoded: &str) -> Result<DecodedCode, CodeError> {
    let source = decode(encoded)?;
    admit_source(&source)
}

pub fn admit_source(source: &str) -> Result<DecodedCode, CodeError> {
    let (shape, end) = parse_function_literal(source)?;
    Ok(DecodedCode {
        source: source[..end].trim().to_string(),
        shape,
    })
}

/// Parse `source` as one function expression; returns its shape and the
/// byte offset where the expression ends
pub fn parse_function_literal(source: &str) -> Result<(FunctionShape, usize), CodeError> {
    let mut scanner = Scanner::new(source.as_bytes());
    scanner.skip_trivia()?;

    if scanner.at_end() {
        return Err(CodeError::Empty);
    }

    let mut wrapping = 0usize;
    let shape = loop {
        let start = scanner.pos;

        if let Some(shape) = scanner.try_function_head()? {
            break shape;
        }

        // `( expr )` wrapping: only valid if the group is not an arrow
        // parameter list
        if scanner.peek() == Some(b'(') {
            scanner.pos = start + 1;
            wrapping += 1;
            scanner.skip_trivia()?;
            continue;
        }

        return Err(CodeError::NotAFunction(start));
    };

    for _ in 0..wrapping {
        scanner.skip_trivia()?;
        if !scanner.eat(b')') {
            return Err(CodeError::Unbalanced(scanner.pos));
        }
    }

    let end = scanner.pos;

    scanner.skip_trivia()?;
    scanner.eat(b';');
    scanner.skip_trivia()?;
    if !scanner.at_end() {
        return Err(CodeError::TrailingInput(scanner.pos));
    }

    Ok((shape, end))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Open {
    Paren,
    /// Parenthesized head of `if`, `while`, `for` or `with`
    Condition,
    Bracket,
    Brace,
    TemplateExpr,
}

impl Open {
    fn closer(self) -> u8 {
        match self {
            Open::Paren | Open::Condition => b')',
            Open::Bracket => b']',
            Open::Brace | Open::TemplateExpr => b'}',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// Consume one bracketed group starting at the opener
    Group,
    /// Consume an expression up to `;`, an unmatched closer or the end
    Expression,
}

/// Keywords whose parenthesized head is followed by a statement, not a value
const HEAD_KEYWORDS: &[&str] = &["if", "while", "for", "with"];

const REGEX_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case",
    "do", "else", "yield", "await",
];

struct Scanner<'a> {
    src: &'a [u8],
    pos: usize,
    /// Whether the previous token ends a value (a following `/` divides)
    after_value: bool,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self {
            src,
            pos: 0,
            after_value: false,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        let matches = self
            .src
            .get(self.pos..)
            .map(|rest| rest.starts_with(s.as_bytes()))
            .unwrap_or(false);
        if matches {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn skip_trivia(&mut self) -> Result<(), CodeError> {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(b), _) if b.is_ascii_whitespace() => self.pos += 1,
                (Some(b'/'), Some(b'/')) => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                (Some(b'/'), Some(b'*')) => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        match (self.peek(), self.peek_at(1)) {
                            (Some(b'*'), Some(b'/')) => {
                                self.pos += 2;
                                break;
                            }
                            (Some(_), _) => self.pos += 1,
                            (None, _) => {
                                return Err(CodeError::Unterminated {
                                    what: "comment",
                                    offset: start,
                                })
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Skip trivia and report whether it contained a line terminator
    fn skip_trivia_newline(&mut self) -> Result<bool, CodeError> {
        let start = self.pos;
        self.skip_trivia()?;
        Ok(self.src[start..self.pos].contains(&b'\n'))
    }

    /// Whether `b` at the cursor can continue an expression across a line
    /// break; anything else gets an automatic semicolon
    fn continues_expression(&self, b: u8) -> bool {
        match b {
            b'+' | b'-' => self.peek_at(1) != Some(b),
            b'.' | b'?' | b'(' | b'[' | b'`' | b'*' | b'/' | b'%' | b'=' | b'<' | b'>'
            | b'&' | b'|' | b'^' | b',' | b':' | b')' | b']' | b'}' | b';' => true,
            b if is_ident_start(b) => {
                let end = self.src[self.pos..]
                    .iter()
                    .position(|b| !is_ident_byte(*b))
                    .map_or(self.src.len(), |n| self.pos + n);
                matches!(&self.src[self.pos..end], b"in" | b"instanceof")
            }
            _ => false,
        }
    }

    fn read_word(&mut self) -> Option<&'a str> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if is_ident_byte(b) {
                self.pos += 1;
            } else {
                break;
            }
        }
        if start == self.pos {
            None
        } else {
            std::str::from_utf8(&self.src[start..self.pos]).ok()
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let start = self.pos;
        match self.read_word() {
            Some(word) if word == keyword => true,
            _ => {
                self.pos = start;
                false
            }
        }
    }

    /// Try to read a complete function expression at the cursor
    ///
    /// Returns `Ok(None)` (cursor restored) when the input does not start
    /// with a function head.
    fn try_function_head(&mut self) -> Result<Option<FunctionShape>, CodeError> {
        let start = self.pos;

        let mut is_async = self.eat_keyword("async");
        if is_async {
            self.skip_trivia()?;
            // `async => ...` names a parameter
            if self.peek() == Some(b'=') && self.peek_at(1) == Some(b'>') {
                is_async = false;
                self.pos = start;
            }
        }

        if self.eat_keyword("function") {
            self.skip_trivia()?;
            self.eat(b'*');
            self.skip_trivia()?;
            let _ = self.read_word();
            self.skip_trivia()?;

            if self.peek() != Some(b'(') {
                return Err(CodeError::NotAFunction(self.pos));
            }
            let arity = self.parameter_count()?;
            self.skip_trivia()?;

            if self.peek() != Some(b'{') {
                return Err(CodeError::NotAFunction(self.pos));
            }
            self.scan(Scan::Group)?;

            return Ok(Some(FunctionShape {
                kind: FunctionKind::Function,
                is_async,
                arity,
            }));
        }

        let arity = match self.peek() {
            Some(b'(') => self.parameter_count()?,
            Some(b) if is_ident_start(b) => match self.read_word() {
                Some(word) if !REGEX_KEYWORDS.contains(&word) => 1,
                _ => {
                    self.pos = start;
                    return Ok(None);
                }
            },
            _ => {
                self.pos = start;
                return Ok(None);
            }
        };

        self.skip_trivia()?;
        if !self.eat_str("=>") {
            self.pos = start;
            return Ok(None);
        }
        self.skip_trivia()?;
        self.after_value = false;

        let scan = match self.peek() {
            Some(b'{') => Scan::Group,
            Some(_) => Scan::Expression,
            None => return Err(CodeError::NotAFunction(self.pos)),
        };
        self.scan(scan)?;

        Ok(Some(FunctionShape {
            kind: FunctionKind::Arrow,
            is_async,
            arity,
        }))
    }

    /// Consume a parenthesized parameter list, counting top-level entries
    fn parameter_count(&mut self) -> Result<usize, CodeError> {
        let open = self.pos;
        let commas = self.scan(Scan::Group)?;

        let body = &self.src[open + 1..self.pos - 1];
        let mut inner = Scanner::new(body);
        inner.skip_trivia()?;
        if inner.at_end() {
            return Ok(0);
        }

        // A trailing comma does not add a parameter
        let trailing_comma = body
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map(|p| body[p] == b',')
            .unwrap_or(false);

        Ok(if trailing_comma { commas } else { commas + 1 })
    }

    /// Scan balanced tokens; returns the number of commas seen at depth one
    /// (group mode) or depth zero (expression mode)
    fn scan(&mut self, mode: Scan) -> Result<usize, CodeError> {
        let mut stack: Vec<(Open, usize)> = Vec::new();
        let mut commas = 0;
        let base_depth = match mode {
            Scan::Group => 1,
            Scan::Expression => 0,
        };
        let mut consumed_any = false;
        let mut after_head_keyword = false;

        loop {
            if mode == Scan::Group && consumed_any && stack.is_empty() {
                return Ok(commas);
            }

            let newline = self.skip_trivia_newline()?;
            if mode == Scan::Expression
                && stack.is_empty()
                && newline
                && self.after_value
                && self.peek().is_some_and(|b| !self.continues_expression(b))
            {
                return Ok(commas);
            }

            let head = std::mem::take(&mut after_head_keyword);
            let Some(b) = self.peek() else {
                return match stack.last().copied() {
                    Some((_, offset)) => Err(CodeError::Unbalanced(offset)),
                    None if consumed_any => Ok(commas),
                    None => Err(CodeError::NotAFunction(self.pos)),
                };
            };
            consumed_any = true;

            match b {
                b'(' | b'[' | b'{' => {
                    let open = match b {
                        b'(' if head => Open::Condition,
                        b'(' => Open::Paren,
                        b'[' => Open::Bracket,
                        _ => Open::Brace,
                    };
                    stack.push((open, self.pos));
                    self.pos += 1;
                    self.after_value = false;
                }
                b')' | b']' | b'}' => match stack.last().copied() {
                    Some((Open::TemplateExpr, _)) if b == b'}' => {
                        stack.pop();
                        self.pos += 1;
                        self.template_chunk(&mut stack)?;
                    }
                    Some((open, _)) if open.closer() == b => {
                        stack.pop();
                        self.pos += 1;
                        self.after_value = open != Open::Condition;
                    }
                    None if mode == Scan::Expression => return Ok(commas),
                    _ => return Err(CodeError::Unbalanced(self.pos)),
                },
                b';' if stack.is_empty() => return Ok(commas),
                b',' if stack.is_empty() && mode == Scan::Expression => return Ok(commas),
                b',' => {
                    if stack.len() == base_depth {
                        commas += 1;
                    }
                    self.pos += 1;
                    self.after_value = false;
                }
                b'\'' | b'"' => self.string(b)?,
                b'`' => {
                    self.pos += 1;
                    self.template_chunk(&mut stack)?;
                }
                b'/' if !self.after_value => self.regex()?,
                b'0'..=b'9' => {
                    while self.peek().map(is_ident_byte).unwrap_or(false) || self.peek() == Some(b'.') {
                        self.pos += 1;
                    }
                    self.after_value = true;
                }
                b if is_ident_start(b) => {
                    let word = self.read_word().unwrap_or_default();
                    self.after_value = !REGEX_KEYWORDS.contains(&word);
                    after_head_keyword = HEAD_KEYWORDS.contains(&word);
                }
                _ => {
                    self.pos += 1;
                    self.after_value = false;
                }
            }
        }
    }

    fn string(&mut self, quote: u8) -> Result<(), CodeError> {
        let start = self.pos;
        self.pos += 1;
        loop {
            match self.peek() {
                Some(b'\\') => self.pos += 2,
                Some(b) if b == quote => {
                    self.pos += 1;
                    self.after_value = true;
                    return Ok(());
                }
                Some(b'\n') | None => {
                    return Err(CodeError::Unterminated {
                        what: "string",
                        offset: start,
                    })
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    /// Scan template text after a backtick or a closing `}` of `${...}`
    fn template_chunk(&mut self, stack: &mut Vec<(Open, usize)>) -> Result<(), CodeError> {
        let start = self.pos;
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(b'\\'), _) => self.pos += 2,
                (Some(b'`'), _) => {
                    self.pos += 1;
                    self.after_value = true;
                    return Ok(());
                }
                (Some(b'$'), Some(b'{')) => {
                    stack.push((Open::TemplateExpr, self.pos));
                    self.pos += 2;
                    self.after_value = false;
                    return Ok(());
                }
                (Some(_), _) => self.pos += 1,
                (None, _) => {
                    return Err(CodeError::Unterminated {
                        what: "template literal",
                        offset: start,
                    })
                }
            }
        }
    }

    fn regex(&mut self) -> Result<(), CodeError> {
        let start = self.pos;
        self.pos += 1;
        let mut in_class = false;
        loop {
            match self.peek() {
                Some(b'\\') => self.pos += 2,
                Some(b'[') => {
                    in_class = true;
                    self.pos += 1;
                }
                Some(b']') => {
                    in_class = false;
                    self.pos += 1;
                }
                Some(b'/') if !in_class => {
                    self.pos += 1;
                    let _ = self.read_word();
                    self.after_value = true;
                    return Ok(());
                }
                Some(b'\n') | None => {
                    return Err(CodeError::Unterminated {
                        what: "regular expression",
                        offset: start,
                    })
                }
                Some(_) => self.pos += 1,
            }
        }
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'$' || b >= 0x80
}

fn is_ident_byte(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit()
}
