//! Well-formedness checks for expressions and simple statements
//!
//! The syntax tree keeps expressions as spans, but they are still checked:
//! operands and operators must alternate, keywords may only appear where the
//! grammar puts them, and bracket contents are checked recursively with the
//! separators their bracket allows (`:` in subscripts and dicts, `=` and `**`
//! in calls). This is not a full Python grammar. It catches malformed code
//! that would otherwise only fail later, inside the native build.

use crate::lexer::{Token, TokenKind};
use crate::syntax::{error_at, matching_close, scan_top_level, split_top_level, top_level_separators};
use crate::ParseError;

/// What encloses a run of expression tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Context {
    /// Outside any bracket
    Statement,
    /// `( ... )` as a group, tuple or generator
    Group,
    /// `f( ... )`
    Call,
    /// `x[ ... ]`
    Subscript,
    /// `[ ... ]` display
    List,
    /// `{ ... }` dict or set display
    Brace,
}

const BINARY_OPERATORS: &[&str] = &[
    "+", "-", "*", "/", "//", "%", "@", "**", "<<", ">>", "&", "|", "^", "<", ">", "==", "!=",
    "<=", ">=", ":=",
];

const AUGMENTED_ASSIGNMENTS: &[&str] = &[
    "+=", "-=", "*=", "/=", "//=", "%=", "@=", "&=", "|=", "^=", ">>=", "<<=", "**=",
];

/// Keywords that join two operands
const KEYWORD_OPERATORS: &[&str] = &["and", "or", "in", "is", "if", "else", "for"];

fn invalid(token: &Token<'_>) -> ParseError {
    error_at(token, "invalid syntax")
}

/// Check a non-empty expression (list) outside brackets
pub(crate) fn check_expression(tokens: &[Token<'_>]) -> Result<(), ParseError> {
    check(tokens, Context::Statement, false)
}

fn check(tokens: &[Token<'_>], context: Context, allow_as: bool) -> Result<(), ParseError> {
    let mut expect_operand = true;
    // Brackets may be empty and end in a comma; a statement may not start empty
    let mut operand_optional = context != Context::Statement;
    let mut after_string = false;
    let mut i = 0;

    while i < tokens.len() {
        let token = tokens[i];
        if expect_operand {
            match token.kind {
                TokenKind::Name if token.is_name("lambda") => {
                    i = lambda_body(tokens, i)?;
                    operand_optional = false;
                }
                TokenKind::Name if token.is_name("not") || token.is_name("await") => {
                    i += 1;
                    operand_optional = false;
                }
                TokenKind::Name if token.is_name("yield") => {
                    i += 1;
                    operand_optional = !tokens.get(i).is_some_and(|t| t.is_name("from"));
                    if !operand_optional {
                        i += 1;
                    }
                }
                TokenKind::Name if token.is_keyword() && !matches!(token.text, "True" | "False" | "None") => {
                    return Err(invalid(&token));
                }
                TokenKind::Name | TokenKind::Number | TokenKind::String => {
                    after_string = token.kind == TokenKind::String;
                    expect_operand = false;
                    i += 1;
                }
                TokenKind::Op => match token.text {
                    "+" | "-" | "~" | "*" => {
                        i += 1;
                        operand_optional = false;
                    }
                    "**" if matches!(context, Context::Call | Context::Brace) => {
                        i += 1;
                        operand_optional = false;
                    }
                    "..." => {
                        after_string = false;
                        expect_operand = false;
                        i += 1;
                    }
                    "(" | "[" | "{" => {
                        let inner = match token.text {
                            "(" => Context::Group,
                            "[" => Context::List,
                            _ => Context::Brace,
                        };
                        i = bracket(tokens, i, inner, allow_as && inner == Context::Group)?;
                        after_string = false;
                        expect_operand = false;
                    }
                    ":" if context == Context::Subscript => {
                        i += 1;
                        operand_optional = true;
                    }
                    "," if context == Context::Subscript && i > 0 && tokens[i - 1].is_op(":") => {
                        i += 1;
                        operand_optional = true;
                    }
                    _ => return Err(invalid(&token)),
                },
                _ => return Err(invalid(&token)),
            }
            continue;
        }

        match token.kind {
            TokenKind::String if after_string => {
                i += 1;
                continue;
            }
            TokenKind::Name => {
                let next = tokens.get(i + 1);
                let width = match token.text {
                    t if KEYWORD_OPERATORS.contains(&t) => 1,
                    "as" if allow_as => 1,
                    "not" if next.is_some_and(|t| t.is_name("in")) => 2,
                    "async" if next.is_some_and(|t| t.is_name("for")) => 2,
                    _ => return Err(invalid(&token)),
                };
                i += width;
                expect_operand = true;
                operand_optional = false;
            }
            TokenKind::Op => match token.text {
                "." => match tokens.get(i + 1) {
                    Some(attr) if attr.kind == TokenKind::Name && !attr.is_keyword() => i += 2,
                    Some(other) => return Err(invalid(other)),
                    None => return Err(error_at(&token, "expected attribute name")),
                },
                "(" => i = bracket(tokens, i, Context::Call, false)?,
                "[" => i = bracket(tokens, i, Context::Subscript, false)?,
                "," => {
                    i += 1;
                    expect_operand = true;
                    operand_optional = true;
                }
                ":" if context == Context::Subscript => {
                    i += 1;
                    expect_operand = true;
                    operand_optional = true;
                }
                ":" if context == Context::Brace => {
                    i += 1;
                    expect_operand = true;
                    operand_optional = false;
                }
                "=" if context == Context::Call => {
                    i += 1;
                    expect_operand = true;
                    operand_optional = false;
                }
                op if BINARY_OPERATORS.contains(&op) => {
                    i += 1;
                    expect_operand = true;
                    operand_optional = false;
                }
                _ => return Err(invalid(&token)),
            },
            _ => return Err(invalid(&token)),
        }
        after_string = false;
    }

    if expect_operand && !operand_optional {
        return Err(match tokens.last() {
            Some(last) => error_at(last, "expected expression"),
            None => ParseError::new(1, 1, "expected expression"),
        });
    }
    Ok(())
}

/// Checks the contents of the bracket opened at `open`; returns the index after its close
fn bracket(tokens: &[Token<'_>], open: usize, context: Context, allow_as: bool) -> Result<usize, ParseError> {
    let close = matching_close(tokens, open).ok_or_else(|| error_at(&tokens[open], "bracket was never closed"))?;
    check(&tokens[open + 1..close], context, allow_as)?;
    Ok(close + 1)
}

/// Skips a lambda's parameters; returns the index after its `:`
fn lambda_body(tokens: &[Token<'_>], lambda: usize) -> Result<usize, ParseError> {
    let mut nested = 0usize;
    let colon = scan_top_level(&tokens[lambda + 1..], |i, token| {
        if token.is_name("lambda") {
            nested += 1;
        } else if token.is_op(":") {
            if nested == 0 {
                return Some(i);
            }
            nested -= 1;
        }
        None
    });
    match colon {
        Some(colon) => Ok(lambda + 1 + colon + 1),
        None => Err(error_at(&tokens[lambda], "expected ':'")),
    }
}

/// Check one simple statement that is not an annotated assignment
pub(crate) fn check_simple_statement(tokens: &[Token<'_>]) -> Result<(), ParseError> {
    let first = tokens[0];
    let rest = &tokens[1..];

    if first.is_op("@") {
        return required(rest, &first);
    }
    if first.kind == TokenKind::Name {
        match first.text {
            "pass" | "break" | "continue" => {
                return match rest.first() {
                    Some(extra) => Err(invalid(extra)),
                    None => Ok(()),
                };
            }
            "return" | "yield" if rest.is_empty() => return Ok(()),
            "return" | "del" | "assert" => return required(rest, &first),
            "raise" => return raise(rest),
            "global" | "nonlocal" => return names(rest, &first),
            "import" => return import(rest, &first),
            "from" => return from_import(rest, &first),
            "type" if rest.first().is_some_and(|t| t.kind == TokenKind::Name && !t.is_keyword()) => {
                return type_alias(tokens);
            }
            _ => {}
        }
    }
    assignment(tokens)
}

fn required(tokens: &[Token<'_>], keyword: &Token<'_>) -> Result<(), ParseError> {
    if tokens.is_empty() {
        return Err(error_at(keyword, "expected expression"));
    }
    check_expression(tokens)
}

fn raise(tokens: &[Token<'_>]) -> Result<(), ParseError> {
    if tokens.is_empty() {
        return Ok(());
    }
    match scan_top_level(tokens, |i, t| t.is_name("from").then_some(i)) {
        Some(from) if from == 0 || from + 1 == tokens.len() => Err(invalid(&tokens[from])),
        Some(from) => {
            check_expression(&tokens[..from])?;
            check_expression(&tokens[from + 1..])
        }
        None => check_expression(tokens),
    }
}

fn assignment(tokens: &[Token<'_>]) -> Result<(), ParseError> {
    let augmented = scan_top_level(tokens, |i, t| {
        (t.kind == TokenKind::Op && AUGMENTED_ASSIGNMENTS.contains(&t.text)).then_some(i)
    });
    if let Some(op) = augmented {
        if op == 0 || op + 1 == tokens.len() {
            return Err(invalid(&tokens[op]));
        }
        check_expression(&tokens[..op])?;
        return check_expression(&tokens[op + 1..]);
    }

    let mut begin = 0;
    for equals in top_level_separators(tokens, "=").into_iter().chain([tokens.len()]) {
        if equals == begin {
            return Err(invalid(tokens.get(equals).unwrap_or(&tokens[tokens.len() - 1])));
        }
        check_expression(&tokens[begin..equals])?;
        begin = equals + 1;
    }
    Ok(())
}

/// `type Alias[T] = value`
fn type_alias(tokens: &[Token<'_>]) -> Result<(), ParseError> {
    let mut i = 2;
    if tokens.get(i).is_some_and(|t| t.is_op("[")) {
        i = bracket(tokens, i, Context::Subscript, false)?;
    }
    match tokens.get(i) {
        Some(eq) if eq.is_op("=") => required(&tokens[i + 1..], eq),
        Some(other) => Err(invalid(other)),
        None => Err(error_at(&tokens[i - 1], "expected '='")),
    }
}

fn names(tokens: &[Token<'_>], keyword: &Token<'_>) -> Result<(), ParseError> {
    if tokens.is_empty() {
        return Err(error_at(keyword, "expected name"));
    }
    for part in split_top_level(tokens, ",") {
        match part {
            [name] if name.kind == TokenKind::Name && !name.is_keyword() => {}
            [first, ..] => return Err(invalid(first)),
            [] => return Err(error_at(keyword, "expected name")),
        }
    }
    Ok(())
}

/// `a.b.c`; returns the index after the dotted name
fn dotted_name(tokens: &[Token<'_>], mut i: usize, anchor: &Token<'_>) -> Result<usize, ParseError> {
    loop {
        match tokens.get(i) {
            Some(name) if name.kind == TokenKind::Name && !name.is_keyword() => i += 1,
            Some(other) => return Err(invalid(other)),
            None => return Err(error_at(anchor, "expected name")),
        }
        if !tokens.get(i).is_some_and(|t| t.is_op(".")) {
            return Ok(i);
        }
        i += 1;
    }
}

/// `name` or `name as alias`, with `name` dotted when `dotted` is set
fn aliased(part: &[Token<'_>], anchor: &Token<'_>, dotted: bool) -> Result<(), ParseError> {
    let end = if dotted {
        dotted_name(part, 0, anchor)?
    } else {
        match part.first() {
            Some(name) if name.kind == TokenKind::Name && !name.is_keyword() => 1,
            Some(other) => return Err(invalid(other)),
            None => return Err(error_at(anchor, "expected name")),
        }
    };
    match &part[end..] {
        [] => Ok(()),
        [as_kw, alias] if as_kw.is_name("as") && alias.kind == TokenKind::Name && !alias.is_keyword() => Ok(()),
        [other, ..] => Err(invalid(other)),
    }
}

fn import(tokens: &[Token<'_>], keyword: &Token<'_>) -> Result<(), ParseError> {
    if tokens.is_empty() {
        return Err(error_at(keyword, "expected name"));
    }
    for part in split_top_level(tokens, ",") {
        aliased(part, keyword, true)?;
    }
    Ok(())
}

fn from_import(tokens: &[Token<'_>], keyword: &Token<'_>) -> Result<(), ParseError> {
    let mut i = 0;
    while tokens.get(i).is_some_and(|t| t.is_op(".") || t.is_op("...")) {
        i += 1;
    }
    if tokens.get(i).is_some_and(|t| !t.is_name("import")) {
        i = dotted_name(tokens, i, keyword)?;
    }
    let import = match tokens.get(i) {
        Some(t) if t.is_name("import") && i > 0 => *t,
        Some(other) => return Err(invalid(other)),
        None => return Err(error_at(keyword, "expected 'import'")),
    };

    let mut names = &tokens[i + 1..];
    let parenthesized = names.first().is_some_and(|t| t.is_op("("));
    if parenthesized {
        match names.last() {
            Some(close) if close.is_op(")") && names.len() >= 2 => names = &names[1..names.len() - 1],
            _ => return Err(invalid(&names[0])),
        }
    }
    match names {
        [] => return Err(error_at(&import, "expected name")),
        [star] if star.is_op("*") && !parenthesized => return Ok(()),
        _ => {}
    }
    let parts = split_top_level(names, ",");
    let count = parts.len();
    for (index, part) in parts.into_iter().enumerate() {
        if part.is_empty() && parenthesized && index == count - 1 && index > 0 {
            continue;
        }
        aliased(part, &import, false)?;
    }
    Ok(())
}

/// Check the part of a compound statement header before its colon
pub(crate) fn check_header(header: &[Token<'_>]) -> Result<(), ParseError> {
    let offset = usize::from(header[0].is_name("async"));
    let keyword = header[offset];
    let rest = &header[offset + 1..];
    match keyword.text {
        "if" | "elif" | "while" | "match" => required(rest, &keyword),
        "for" => {
            if scan_top_level(rest, |_, t| t.is_name("in").then_some(())).is_none() {
                return Err(error_at(&keyword, "expected 'in'"));
            }
            required(rest, &keyword)
        }
        "with" => {
            if rest.is_empty() {
                return Err(error_at(&keyword, "expected expression"));
            }
            check(rest, Context::Statement, true)
        }
        "except" => {
            let rest = match rest.first() {
                Some(star) if star.is_op("*") => &rest[1..],
                _ => rest,
            };
            if rest.is_empty() {
                return Ok(());
            }
            check(rest, Context::Statement, true)
        }
        "class" => class_header(rest, &keyword),
        "else" | "try" | "finally" => match rest.first() {
            Some(extra) => Err(invalid(extra)),
            None => Ok(()),
        },
        // Patterns are not expressions; `case` headers are left unchecked
        _ => Ok(()),
    }
}

fn class_header(tokens: &[Token<'_>], keyword: &Token<'_>) -> Result<(), ParseError> {
    let mut i = match tokens.first() {
        Some(name) if name.kind == TokenKind::Name && !name.is_keyword() => 1,
        Some(other) => return Err(invalid(other)),
        None => return Err(error_at(keyword, "expected class name")),
    };
    if tokens.get(i).is_some_and(|t| t.is_op("[")) {
        i = bracket(tokens, i, Context::Subscript, false)?;
    }
    if tokens.get(i).is_some_and(|t| t.is_op("(")) {
        i = bracket(tokens, i, Context::Call, false)?;
    }
    match tokens.get(i) {
        Some(extra) => Err(invalid(extra)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    /// Tokens of the first logical line
    fn line(source: &str) -> Vec<Token<'_>> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .take_while(|t| t.kind != TokenKind::Newline)
            .collect()
    }

    fn statement(source: &str) -> Result<(), ParseError> {
        check_simple_statement(&line(source))
    }

    #[test]
    fn test_valid_statements() {
        for source in [
            "x = y = f(a, *b, key=1, **kw)[1:2, ::3].attr",
            "total += -n ** 2 if not done else ~mask",
            "items = [x async for x in aiter() if x is not None]",
            "pairs = {k: v for k, v in d.items()} | {**extra}",
            "s = 'a' 'b' f'{c}'",
            "handler = lambda a, b=lambda: 0, *c, **d: (yield a)",
            "value = yield from gen()",
            "await task",
            "*head, tail = seq",
            "t = 1,",
            "x = a not in b and c in d or e <= f < g",
            "grid[:, 0] = grid[1:][...]",
            "raise ValueError('bad') from err",
            "raise",
            "return",
            "del a[0], b.c",
            "assert x, 'message'",
            "global a, b",
            "import os.path as osp, sys",
            "from ..pkg.mod import (a as b, c,)",
            "from . import x",
            "from typing import *",
            "type Alias[T] = list[T]",
            "type = 3",
            "@app.route('/x', methods=['GET'])",
            "print((y := 10), x[lambda: 1])",
            "pass",
        ] {
            assert!(statement(source).is_ok(), "{source}: {:?}", statement(source));
        }
    }

    #[test]
    fn test_invalid_statements() {
        for source in [
            "x = = 1",
            "x = ",
            "= 1",
            "x = 1 2",
            "print 'hello'",
            "x = a +",
            "x = (a,,b)",
            "f(a b)",
            "x.class = 1",
            "x = if y",
            "y = a not b",
            "pass 1",
            "del",
            "global a.b",
            "import",
            "from import x",
            "from x import",
            "from x import a b",
            "from x import (*)",
            "x += ",
            "x = {a: }",
            "f(**)",
            "x = lambda a",
            "a = b -> c",
        ] {
            assert!(statement(source).is_err(), "{source}");
        }
    }

    #[test]
    fn test_error_position() {
        let err = statement("x = = 1").unwrap_err();
        assert_eq!((err.line, err.column, err.message.as_str()), (1, 5, "invalid syntax"));

        let err = statement("print 'hello'").unwrap_err();
        assert_eq!(err.column, 7);
    }

    #[test]
    fn test_headers() {
        let header = |source: &str| {
            let tokens = line(source);
            let colon = tokens.iter().rposition(|t| t.is_op(":")).unwrap();
            check_header(&tokens[..colon])
        };
        for source in [
            "if a and (b := c):",
            "while not done:",
            "for i, (a, b) in enumerate(pairs):",
            "async for x in stream:",
            "with open(p) as f, lock:",
            "async with (a as b, c as d):",
            "except* (OSError, ValueError) as e:",
            "except:",
            "class A(Base, metaclass=Meta):",
            "class Box[T]:",
            "match command.split():",
            "case [x, *rest] if x > 0:",
            "else:",
        ] {
            assert!(header(source).is_ok(), "{source}: {:?}", header(source));
        }
        for source in ["if :", "for x:", "while x y:", "else x:", "class 1:", "class A() B:", "with :"] {
            assert!(header(source).is_err(), "{source}");
        }
    }
}
