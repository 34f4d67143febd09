//! Statement-level Python syntax tree
//!
//! The tree only models what annotation stripping needs: statement and block
//! structure, function signatures and annotated assignments. Expressions are
//! kept as byte spans into the original source, so untouched code is
//! re-emitted byte for byte with its original positions.

use crate::expr;
use crate::lexer::{self, Token, TokenKind};
use crate::ParseError;

/// Byte range into the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn slice<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub body: Vec<Stmt>,
}

/// One logical line, plus its nested block for compound statements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stmt {
    /// Start of the physical line, including indentation
    pub line_start: usize,
    /// Tokens of the logical line (excluding NEWLINE)
    pub span: Span,
    /// End of the logical line including its line break
    pub line_end: usize,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StmtKind {
    /// `a = 1; b: int = 2`
    Simple(Vec<SmallStmt>),
    /// `def` / `async def`
    FunctionDef(FunctionDef),
    /// Any other statement that owns a suite (`class`, `if`, `for`, ...)
    Compound { keyword: String, body: Suite },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suite {
    /// Indented block on the following lines
    Block(Vec<Stmt>),
    /// Simple statements after the header colon
    Inline(Vec<SmallStmt>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmallStmt {
    pub span: Span,
    pub kind: SmallKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmallKind {
    /// `target: annotation [= value]`
    AnnAssign {
        target: Span,
        annotation: Span,
        value: Option<Span>,
    },
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDef {
    pub name: Span,
    pub is_async: bool,
    pub params: Vec<Param>,
    /// Closing parenthesis of the parameter list
    pub params_end: usize,
    /// `-> annotation`, from the arrow to the end of the annotation
    pub returns: Option<Span>,
    /// Position of the header colon
    pub colon: usize,
    pub body: Suite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// Parameter name, without `*`/`**`
    pub name: Span,
    pub annotation: Option<Span>,
    pub default: Option<Span>,
}

/// Parse Python source into a statement tree
pub fn parse(source: &str) -> Result<Module, ParseError> {
    let tokens = lexer::tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    let body = parser.statements(true)?;
    Ok(Module { body })
}

const COMPOUND_KEYWORDS: &[&str] = &[
    "if", "elif", "else", "while", "for", "try", "except", "finally", "with", "class",
];

const SOFT_COMPOUND_KEYWORDS: &[&str] = &["match", "case"];

struct Parser<'src> {
    source: &'src str,
    tokens: Vec<Token<'src>>,
    pos: usize,
}

impl<'src> Parser<'src> {
    fn current(&self) -> Token<'src> {
        // The token stream always ends with ENDMARKER
        self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn statements(&mut self, module_level: bool) -> Result<Vec<Stmt>, ParseError> {
        let mut body = Vec::new();
        loop {
            let token = self.current();
            match token.kind {
                TokenKind::EndMarker if module_level => return Ok(body),
                TokenKind::Dedent if !module_level => {
                    self.pos += 1;
                    return Ok(body);
                }
                TokenKind::Indent => return Err(error_at(&token, "unexpected indent")),
                TokenKind::EndMarker | TokenKind::Dedent => {
                    return Err(error_at(&token, "unexpected end of block"))
                }
                TokenKind::Newline => self.pos += 1,
                _ => body.push(self.statement()?),
            }
        }
    }

    fn block(&mut self, header: &Token<'src>) -> Result<Vec<Stmt>, ParseError> {
        let token = self.current();
        if token.kind != TokenKind::Indent {
            return Err(error_at(
                &token,
                &format!("expected an indented block after '{}' statement on line {}", header.text, header.line),
            ));
        }
        self.pos += 1;
        self.statements(false)
    }

    /// Parses one logical line, and the block that follows it if any
    fn statement(&mut self) -> Result<Stmt, ParseError> {
        let begin = self.pos;
        let newline = (begin..self.tokens.len())
            .find(|&i| matches!(self.tokens[i].kind, TokenKind::Newline | TokenKind::EndMarker))
            .unwrap_or(self.tokens.len() - 1);
        let line: Vec<Token<'src>> = self.tokens[begin..newline].to_vec();
        let newline_token = self.tokens[newline];
        self.pos = newline + 1;

        let first = line[0];
        let last = line[line.len() - 1];
        let line_start = self.source[..first.start].rfind('\n').map_or(0, |i| i + 1);
        let span = Span::new(first.start, last.end);

        let kind = if first.is_name("def") || (first.is_name("async") && line.get(1).is_some_and(|t| t.is_name("def"))) {
            StmtKind::FunctionDef(self.function_def(&line)?)
        } else if is_compound_header(&line) {
            let colon = header_colon(&line).ok_or_else(|| error_at(&last, "expected ':'"))?;
            expr::check_header(&line[..colon])?;
            let body = self.suite(&line, colon)?;
            let keyword = if first.is_name("async") { line[1].text } else { first.text };
            StmtKind::Compound {
                keyword: keyword.to_string(),
                body,
            }
        } else {
            StmtKind::Simple(small_statements(&line)?)
        };

        // Blocks consume their own lines, so the line end is taken from the header's NEWLINE
        Ok(Stmt {
            line_start,
            span,
            line_end: newline_token.end,
            kind,
        })
    }

    fn suite(&mut self, line: &[Token<'src>], colon: usize) -> Result<Suite, ParseError> {
        let rest = &line[colon + 1..];
        if rest.is_empty() {
            Ok(Suite::Block(self.block(&line[0])?))
        } else {
            Ok(Suite::Inline(small_statements(rest)?))
        }
    }

    fn function_def(&mut self, line: &[Token<'src>]) -> Result<FunctionDef, ParseError> {
        let is_async = line[0].is_name("async");
        let mut i = if is_async { 2 } else { 1 };

        let name = line
            .get(i)
            .filter(|t| t.kind == TokenKind::Name && !t.is_keyword())
            .ok_or_else(|| error_after(line, i, "expected function name"))?;
        let name = Span::new(name.start, name.end);
        i += 1;

        // PEP 695 type parameters
        if line.get(i).is_some_and(|t| t.is_op("[")) {
            i = matching_close(line, i).ok_or_else(|| error_after(line, i, "'[' was never closed"))? + 1;
        }

        if !line.get(i).is_some_and(|t| t.is_op("(")) {
            return Err(error_after(line, i, "expected '('"));
        }
        let close = matching_close(line, i).ok_or_else(|| error_after(line, i, "'(' was never closed"))?;
        let params = parameters(&line[i + 1..close])?;
        let params_end = line[close].end;
        i = close + 1;

        let returns = if line.get(i).is_some_and(|t| t.is_op("->")) {
            let arrow = line[i];
            let colon = header_colon(&line[i..])
                .map(|c| c + i)
                .ok_or_else(|| error_at(&line[line.len() - 1], "expected ':'"))?;
            if colon == i + 1 {
                return Err(error_at(&line[colon], "expected return annotation"));
            }
            expr::check_expression(&line[i + 1..colon])?;
            let span = Span::new(arrow.start, line[colon - 1].end);
            i = colon;
            Some(span)
        } else {
            None
        };

        if !line.get(i).is_some_and(|t| t.is_op(":")) {
            return Err(error_after(line, i, "expected ':'"));
        }
        let colon = i;
        let body = self.suite(line, colon)?;

        Ok(FunctionDef {
            name,
            is_async,
            params,
            params_end,
            returns,
            colon: line[colon].start,
            body,
        })
    }
}

pub(crate) fn error_at(token: &Token<'_>, message: &str) -> ParseError {
    ParseError::new(token.line, token.column, message)
}

pub(crate) fn error_after(line: &[Token<'_>], index: usize, message: &str) -> ParseError {
    match line.get(index).or_else(|| line.last()) {
        Some(token) => error_at(token, message),
        None => ParseError::new(1, 1, message),
    }
}

fn is_compound_header(line: &[Token<'_>]) -> bool {
    let first = line[0];
    if first.kind != TokenKind::Name {
        return false;
    }
    if COMPOUND_KEYWORDS.contains(&first.text) {
        return true;
    }
    if first.is_name("async") {
        return line.get(1).is_some_and(|t| t.is_name("for") || t.is_name("with"));
    }
    if SOFT_COMPOUND_KEYWORDS.contains(&first.text) && line.len() > 1 {
        // `match x:` opens a block, `match: int = 1` annotates a variable named match
        return match header_colon(line) {
            Some(colon) => !is_annotation_target(&line[..colon]),
            None => false,
        };
    }
    false
}

/// Index of the matching closing bracket for the opener at `open`
pub(crate) fn matching_close(tokens: &[Token<'_>], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        if token.kind != TokenKind::Op {
            continue;
        }
        match token.text {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Walks tokens at bracket depth zero, calling `f` with each index.
/// Stops early when `f` returns `Some`.
pub(crate) fn scan_top_level<T>(tokens: &[Token<'_>], mut f: impl FnMut(usize, &Token<'_>) -> Option<T>) -> Option<T> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        if token.kind == TokenKind::Op {
            match token.text {
                "(" | "[" | "{" => {
                    depth += 1;
                    continue;
                }
                ")" | "]" | "}" => {
                    depth = depth.saturating_sub(1);
                    continue;
                }
                _ => {}
            }
        }
        if depth == 0 {
            if let Some(found) = f(i, token) {
                return Some(found);
            }
        }
    }
    None
}

/// First top-level `:` that does not belong to a lambda
fn header_colon(tokens: &[Token<'_>]) -> Option<usize> {
    let mut lambdas = 0usize;
    scan_top_level(tokens, |i, token| {
        if token.is_name("lambda") {
            lambdas += 1;
        } else if token.is_op(":") {
            if lambdas == 0 {
                return Some(i);
            }
            lambdas -= 1;
        }
        None
    })
}

fn top_level_op(tokens: &[Token<'_>], op: &str) -> Option<usize> {
    scan_top_level(tokens, |i, token| token.is_op(op).then_some(i))
}

/// Indices of the top-level `separator` tokens. Separators inside a lambda's
/// parameter list (`lambda a, b=1: ...`) belong to the lambda and are skipped.
pub(crate) fn top_level_separators(tokens: &[Token<'_>], separator: &str) -> Vec<usize> {
    let mut lambdas = 0usize;
    let mut found = Vec::new();
    scan_top_level(tokens, |i, token| {
        if token.is_name("lambda") {
            lambdas += 1;
        } else if token.is_op(":") && lambdas > 0 {
            lambdas -= 1;
        } else if token.is_op(separator) && lambdas == 0 {
            found.push(i);
        }
        None::<()>
    });
    found
}

pub(crate) fn split_top_level<'t, 'src>(tokens: &'t [Token<'src>], separator: &str) -> Vec<&'t [Token<'src>]> {
    let mut parts = Vec::new();
    let mut begin = 0;
    for i in top_level_separators(tokens, separator) {
        parts.push(&tokens[begin..i]);
        begin = i + 1;
    }
    parts.push(&tokens[begin..]);
    parts
}

/// Whether `tokens` form a valid target for an annotated assignment:
/// a name, an attribute, a subscript, or one of those in parentheses
fn is_annotation_target(tokens: &[Token<'_>]) -> bool {
    let Some(first) = tokens.first() else {
        return false;
    };
    let mut i = if first.kind == TokenKind::Name && !first.is_keyword() {
        1
    } else if first.is_op("(") {
        match matching_close(tokens, 0) {
            Some(close) if is_annotation_target(&tokens[1..close]) => close + 1,
            _ => return false,
        }
    } else {
        return false;
    };

    let mut ends_with_call = false;
    while i < tokens.len() {
        let token = tokens[i];
        if token.is_op(".") {
            match tokens.get(i + 1) {
                Some(attr) if attr.kind == TokenKind::Name => i += 2,
                _ => return false,
            }
            ends_with_call = false;
        } else if token.is_op("[") || token.is_op("(") {
            match matching_close(tokens, i) {
                Some(close) => i = close + 1,
                None => return false,
            }
            ends_with_call = token.is_op("(");
        } else {
            return false;
        }
    }
    !ends_with_call
}

fn small_statements(tokens: &[Token<'_>]) -> Result<Vec<SmallStmt>, ParseError> {
    let parts = split_top_level(tokens, ";");
    let count = parts.len();
    let mut statements = Vec::with_capacity(count);
    for (index, part) in parts.into_iter().enumerate() {
        if part.is_empty() {
            // A single trailing semicolon is allowed
            if index == count - 1 && index > 0 {
                continue;
            }
            return Err(error_after(tokens, 0, "invalid syntax"));
        }
        statements.push(small_statement(part)?);
    }
    Ok(statements)
}

fn small_statement(tokens: &[Token<'_>]) -> Result<SmallStmt, ParseError> {
    let first = tokens[0];
    let last = tokens[tokens.len() - 1];
    let span = Span::new(first.start, last.end);

    if first.kind == TokenKind::Name
        && (COMPOUND_KEYWORDS.contains(&first.text) || first.text == "def")
    {
        return Err(error_at(&first, "invalid syntax"));
    }

    let colon = header_colon(tokens);
    let equals = top_level_op(tokens, "=");
    let kind = match (colon, equals) {
        (Some(colon), equals) if equals.map_or(true, |eq| colon < eq) => {
            if !is_annotation_target(&tokens[..colon]) {
                return Err(error_at(&first, "illegal target for annotation"));
            }
            let annotation_end = equals.unwrap_or(tokens.len());
            if annotation_end == colon + 1 {
                return Err(error_at(&tokens[colon], "expected annotation"));
            }
            expr::check_expression(&tokens[colon + 1..annotation_end])?;
            let value = match equals {
                Some(eq) if eq + 1 == tokens.len() => {
                    return Err(error_at(&tokens[eq], "expected value after '='"));
                }
                Some(eq) => {
                    expr::check_expression(&tokens[eq + 1..])?;
                    Some(Span::new(tokens[eq + 1].start, last.end))
                }
                None => None,
            };
            SmallKind::AnnAssign {
                target: Span::new(first.start, tokens[colon - 1].end),
                annotation: Span::new(tokens[colon + 1].start, tokens[annotation_end - 1].end),
                value,
            }
        }
        (Some(colon), _) => return Err(error_at(&tokens[colon], "invalid syntax")),
        (None, _) => {
            expr::check_simple_statement(tokens)?;
            SmallKind::Other
        }
    };
    Ok(SmallStmt { span, kind })
}

fn parameters(tokens: &[Token<'_>]) -> Result<Vec<Param>, ParseError> {
    let mut params = Vec::new();
    if tokens.is_empty() {
        return Ok(params);
    }
    let parts = split_top_level(tokens, ",");
    let count = parts.len();
    for (index, part) in parts.into_iter().enumerate() {
        if part.is_empty() {
            if index == count - 1 && index > 0 {
                continue;
            }
            return Err(error_after(tokens, 0, "invalid syntax"));
        }
        if let Some(param) = parameter(part)? {
            params.push(param);
        }
    }
    Ok(params)
}

/// Parses one parameter; bare `*` and `/` markers yield `None`
fn parameter(tokens: &[Token<'_>]) -> Result<Option<Param>, ParseError> {
    if tokens.len() == 1 && (tokens[0].is_op("*") || tokens[0].is_op("/")) {
        return Ok(None);
    }
    let name_index = usize::from(tokens[0].is_op("*") || tokens[0].is_op("**"));
    let name = tokens
        .get(name_index)
        .filter(|t| t.kind == TokenKind::Name && !t.is_keyword())
        .ok_or_else(|| error_after(tokens, name_index, "invalid parameter"))?;

    let rest = &tokens[name_index + 1..];
    let equals = top_level_op(rest, "=");
    let (annotation, default_start) = match rest.first() {
        None => (None, None),
        Some(t) if t.is_op("=") => (None, Some(1)),
        Some(t) if t.is_op(":") => {
            let end = equals.unwrap_or(rest.len());
            if end == 1 {
                return Err(error_at(t, "expected annotation"));
            }
            expr::check_expression(&rest[1..end])?;
            let annotation = Span::new(rest[1].start, rest[end - 1].end);
            (Some(annotation), equals.map(|eq| eq + 1))
        }
        Some(t) => return Err(error_at(t, "invalid syntax")),
    };

    let default = match default_start {
        Some(start) if start >= rest.len() => {
            return Err(error_after(rest, start - 1, "expected default value"));
        }
        Some(start) => {
            expr::check_expression(&rest[start..])?;
            Some(Span::new(rest[start].start, rest[rest.len() - 1].end))
        }
        None => None,
    };

    Ok(Some(Param {
        name: Span::new(name.start, name.end),
        annotation,
        default,
    }))
}
