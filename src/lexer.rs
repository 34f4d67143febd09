//! Python tokenizer
//!
//! Produces the token stream the [`syntax`](crate::syntax) parser works on.
//! Every token borrows its text from the source and keeps its byte span, so
//! the stripper can rewrite the original text in place instead of
//! pretty-printing a tree. Comments and non-logical newlines are dropped, the
//! same way CPython's tokenizer hides them from the grammar.

use crate::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Name,
    Number,
    String,
    Op,
    /// End of a logical line
    Newline,
    Indent,
    Dedent,
    EndMarker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub text: &'src str,
    /// Byte offset of the first character
    pub start: usize,
    /// Byte offset one past the last character
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

impl Token<'_> {
    pub fn is_op(&self, op: &str) -> bool {
        self.kind == TokenKind::Op && self.text == op
    }

    pub fn is_name(&self, name: &str) -> bool {
        self.kind == TokenKind::Name && self.text == name
    }

    pub fn is_keyword(&self) -> bool {
        self.kind == TokenKind::Name && KEYWORDS.contains(&self.text)
    }
}

/// Hard keywords of Python 3
pub const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

const OPERATORS_3: &[&str] = &["**=", "//=", ">>=", "<<=", "..."];
const OPERATORS_2: &[&str] = &[
    "->", ":=", "==", "!=", "<=", ">=", "**", "//", "<<", ">>", "+=", "-=", "*=", "/=", "%=",
    "&=", "|=", "^=", "@=",
];
const OPERATORS_1: &str = "+-*/%@&|^~<>()[]{},:.;=!";

const STRING_PREFIXES: &[&str] = &[
    "rb", "br", "fr", "rf", "tr", "rt", "r", "b", "u", "f", "t",
];

const TAB_SIZE: usize = 8;

/// Tokenize Python source text
pub fn tokenize(source: &str) -> Result<Vec<Token<'_>>, ParseError> {
    Lexer::new(source).run()
}

struct Lexer<'src> {
    src: &'src str,
    pos: usize,
    line: usize,
    line_start: usize,
    at_line_start: bool,
    indents: Vec<usize>,
    /// Open brackets with the position they were opened at
    brackets: Vec<(char, usize, usize)>,
    tokens: Vec<Token<'src>>,
}

impl<'src> Lexer<'src> {
    fn new(src: &'src str) -> Self {
        let pos = if src.starts_with('\u{feff}') { 3 } else { 0 };
        Self {
            src,
            pos,
            line: 1,
            line_start: pos,
            at_line_start: true,
            indents: vec![0],
            brackets: Vec::new(),
            tokens: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Token<'src>>, ParseError> {
        loop {
            if self.at_line_start && self.brackets.is_empty() {
                if !self.start_line()? {
                    break;
                }
            }

            let Some(c) = self.peek() else { break };
            match c {
                ' ' | '\t' | '\x0c' => self.pos += 1,
                '\r' | '\n' => {
                    let len = self.newline_len();
                    if self.brackets.is_empty() {
                        self.push(TokenKind::Newline, self.pos, self.pos + len);
                        self.at_line_start = true;
                    }
                    self.pos += len;
                    self.next_line();
                }
                '#' => self.skip_comment(),
                '\\' => self.line_continuation()?,
                '"' | '\'' => self.string(self.pos)?,
                c if c.is_alphabetic() || c == '_' => {
                    if let Some(prefix_len) = self.string_prefix() {
                        let start = self.pos;
                        self.pos += prefix_len;
                        self.string(start)?;
                    } else {
                        self.name();
                    }
                }
                c if c.is_ascii_digit() => self.number(),
                '.' if self.peek_at(1).is_some_and(|n| n.is_ascii_digit()) => self.number(),
                _ => self.operator()?,
            }
        }
        self.finish()
    }

    /// Measures indentation of a new logical line and emits INDENT/DEDENT.
    /// Returns false at end of input.
    fn start_line(&mut self) -> Result<bool, ParseError> {
        loop {
            let mut width = 0usize;
            while let Some(c) = self.peek() {
                match c {
                    ' ' => width += 1,
                    '\t' => width = (width / TAB_SIZE + 1) * TAB_SIZE,
                    '\x0c' => width = 0,
                    _ => break,
                }
                self.pos += 1;
            }

            match self.peek() {
                None => return Ok(false),
                Some('#') => {
                    self.skip_comment();
                    continue;
                }
                Some('\r' | '\n') => {
                    self.pos += self.newline_len();
                    self.next_line();
                    continue;
                }
                Some(_) => {}
            }

            let current = self.indents.last().copied().unwrap_or(0);
            if width > current {
                self.indents.push(width);
                self.push(TokenKind::Indent, self.pos, self.pos);
            } else if width < current {
                while self.indents.last().is_some_and(|&w| w > width) {
                    self.indents.pop();
                    self.push(TokenKind::Dedent, self.pos, self.pos);
                }
                if self.indents.last().copied() != Some(width) {
                    return Err(self.error_here("unindent does not match any outer indentation level"));
                }
            }
            self.at_line_start = false;
            return Ok(true);
        }
    }

    fn finish(mut self) -> Result<Vec<Token<'src>>, ParseError> {
        if let Some(&(open, line, column)) = self.brackets.last() {
            return Err(ParseError::new(line, column, format!("'{open}' was never closed")));
        }
        let needs_newline = self
            .tokens
            .iter()
            .rev()
            .find(|t| !matches!(t.kind, TokenKind::Indent | TokenKind::Dedent))
            .is_some_and(|t| t.kind != TokenKind::Newline);
        let end = self.src.len();
        if needs_newline {
            self.push(TokenKind::Newline, end, end);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokenKind::Dedent, end, end);
        }
        self.push(TokenKind::EndMarker, end, end);
        Ok(self.tokens)
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(offset)
    }

    fn newline_len(&self) -> usize {
        if self.src[self.pos..].starts_with("\r\n") {
            2
        } else {
            1
        }
    }

    fn next_line(&mut self) {
        self.line += 1;
        self.line_start = self.pos;
    }

    fn column_of(&self, offset: usize) -> usize {
        self.src[self.line_start..offset].chars().count() + 1
    }

    fn error_here(&self, message: &str) -> ParseError {
        ParseError::new(self.line, self.column_of(self.pos), message)
    }

    fn push(&mut self, kind: TokenKind, start: usize, end: usize) {
        let column = self.column_of(start.max(self.line_start));
        self.push_at(kind, start, end, self.line, column);
    }

    fn push_at(&mut self, kind: TokenKind, start: usize, end: usize, line: usize, column: usize) {
        self.tokens.push(Token {
            kind,
            text: &self.src[start..end],
            start,
            end,
            line,
            column,
        });
    }

    fn skip_comment(&mut self) {
        let rest = &self.src[self.pos..];
        let len = rest.find(['\r', '\n']).unwrap_or(rest.len());
        self.pos += len;
    }

    fn line_continuation(&mut self) -> Result<(), ParseError> {
        self.pos += 1;
        match self.peek() {
            Some('\r' | '\n') => {
                self.pos += self.newline_len();
                self.next_line();
                Ok(())
            }
            None => Err(self.error_here("unexpected EOF while parsing")),
            Some(_) => Err(self.error_here("unexpected character after line continuation character")),
        }
    }

    fn name(&mut self) {
        let start = self.pos;
        let rest = &self.src[start..];
        let len = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        self.pos += len;
        self.push(TokenKind::Name, start, self.pos);
    }

    fn number(&mut self) {
        let start = self.pos;
        let bytes = self.src.as_bytes();
        let radix_prefixed = self.src[start..].len() > 1
            && bytes[start] == b'0'
            && matches!(bytes[start + 1], b'x' | b'X' | b'o' | b'O' | b'b' | b'B');
        while self.pos < bytes.len() {
            let b = bytes[self.pos];
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'.' {
                self.pos += 1;
                if !radix_prefixed
                    && matches!(b, b'e' | b'E')
                    && self.pos + 1 < bytes.len()
                    && matches!(bytes[self.pos], b'+' | b'-')
                    && bytes[self.pos + 1].is_ascii_digit()
                {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
        self.push(TokenKind::Number, start, self.pos);
    }

    fn operator(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        let rest = &self.src[start..];
        let len = OPERATORS_3
            .iter()
            .chain(OPERATORS_2)
            .find(|op| rest.starts_with(**op))
            .map(|op| op.len())
            .or_else(|| {
                rest.chars()
                    .next()
                    .filter(|c| OPERATORS_1.contains(*c))
                    .map(char::len_utf8)
            });
        let Some(len) = len else {
            let c = rest.chars().next().unwrap_or(' ');
            return Err(self.error_here(&format!("invalid character '{c}' (U+{:04X})", c as u32)));
        };

        let op = &rest[..len];
        match op {
            "(" | "[" | "{" => {
                let open = op.chars().next().unwrap_or('(');
                self.brackets.push((open, self.line, self.column_of(start)));
            }
            ")" | "]" | "}" => {
                let close = op.chars().next().unwrap_or(')');
                let Some((open, _, _)) = self.brackets.pop() else {
                    return Err(self.error_here(&format!("unmatched '{close}'")));
                };
                if closing_for(open) != close {
                    return Err(self.error_here(&format!(
                        "closing parenthesis '{close}' does not match opening parenthesis '{open}'"
                    )));
                }
            }
            _ => {}
        }
        self.pos += len;
        self.push(TokenKind::Op, start, self.pos);
        Ok(())
    }

    /// Length of a string prefix at the cursor, if one is followed by a quote
    fn string_prefix(&self) -> Option<usize> {
        let rest = &self.src[self.pos..];
        STRING_PREFIXES.iter().find_map(|prefix| {
            let candidate = rest.get(..prefix.len())?;
            let quoted = rest[prefix.len()..].starts_with(['"', '\'']);
            (quoted && candidate.eq_ignore_ascii_case(prefix)).then_some(prefix.len())
        })
    }

    /// Lexes a string literal whose prefix (if any) starts at `start`; the
    /// cursor sits on the opening quote.
    fn string(&mut self, start: usize) -> Result<(), ParseError> {
        let prefix = self.src[start..self.pos].to_ascii_lowercase();
        let formatted = prefix.contains('f') || prefix.contains('t');
        let (line, column) = (self.line, self.column_of(start));
        self.string_body(formatted)
            .map_err(|message| ParseError::new(line, column, message))?;
        self.push_at(TokenKind::String, start, self.pos, line, column);
        Ok(())
    }

    fn string_body(&mut self, formatted: bool) -> Result<(), String> {
        let Some(quote) = self.peek() else {
            return Err("unterminated string literal".to_string());
        };
        let triple: String = std::iter::repeat(quote).take(3).collect();
        let is_triple = self.src[self.pos..].starts_with(&triple);
        self.pos += if is_triple { 3 } else { 1 };

        loop {
            let Some(c) = self.peek() else {
                return Err(if is_triple {
                    "unterminated triple-quoted string literal".to_string()
                } else {
                    "unterminated string literal".to_string()
                });
            };
            match c {
                '\\' => {
                    self.pos += 1;
                    match self.peek() {
                        Some('\r' | '\n') => {
                            self.pos += self.newline_len();
                            self.next_line();
                        }
                        Some(escaped) => self.pos += escaped.len_utf8(),
                        None => {}
                    }
                }
                '\r' | '\n' => {
                    if !is_triple {
                        return Err("unterminated string literal".to_string());
                    }
                    self.pos += self.newline_len();
                    self.next_line();
                }
                c if c == quote => {
                    if !is_triple {
                        self.pos += 1;
                        return Ok(());
                    }
                    if self.src[self.pos..].starts_with(&triple) {
                        self.pos += 3;
                        return Ok(());
                    }
                    self.pos += 1;
                }
                '{' if formatted => {
                    if self.peek_at(1) == Some('{') {
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                        self.replacement_field()?;
                    }
                }
                c => self.pos += c.len_utf8(),
            }
        }
    }

    /// Skips an f-string replacement field up to and including its `}`
    fn replacement_field(&mut self) -> Result<(), String> {
        let mut depth = 0usize;
        loop {
            let Some(c) = self.peek() else {
                return Err("f-string: expecting '}'".to_string());
            };
            match c {
                '{' | '(' | '[' => {
                    depth += 1;
                    self.pos += 1;
                }
                ')' | ']' => {
                    depth = depth.saturating_sub(1);
                    self.pos += 1;
                }
                '}' => {
                    self.pos += 1;
                    if depth == 0 {
                        return Ok(());
                    }
                    depth -= 1;
                }
                ':' if depth == 0 => {
                    self.pos += 1;
                    return self.format_spec();
                }
                '"' | '\'' => self.string_body(false)?,
                c if c.is_alphabetic() => match self.string_prefix() {
                    Some(len) => {
                        let prefix = self.src[self.pos..self.pos + len].to_ascii_lowercase();
                        self.pos += len;
                        self.string_body(prefix.contains('f') || prefix.contains('t'))?;
                    }
                    None => self.pos += c.len_utf8(),
                },
                '\r' | '\n' => {
                    self.pos += self.newline_len();
                    self.next_line();
                }
                c => self.pos += c.len_utf8(),
            }
        }
    }

    /// Skips a format spec (`>10`, `'^{width}`) and the closing `}` of its
    /// field. The spec is literal text, so quotes in it do not open strings.
    fn format_spec(&mut self) -> Result<(), String> {
        loop {
            let Some(c) = self.peek() else {
                return Err("f-string: expecting '}'".to_string());
            };
            match c {
                '{' => {
                    self.pos += 1;
                    self.replacement_field()?;
                }
                '}' => {
                    self.pos += 1;
                    return Ok(());
                }
                '\r' | '\n' => {
                    self.pos += self.newline_len();
                    self.next_line();
                }
                c => self.pos += c.len_utf8(),
            }
        }
    }
}

fn closing_for(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}
