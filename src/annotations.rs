//! Type annotation stripping
//!
//! Cython compiles annotated code with the annotations as runtime type
//! checks, so a value whose type drifts from a stale hint raises once the
//! module is native. Before compiling, every hint is removed:
//!
//! - function return annotations and all parameter annotations are dropped
//!   (names, defaults and order are kept);
//! - `x: T` declarations without a value are deleted;
//! - `x: T = v` becomes `x = v`.
//!
//! The rewrite works on spans of the original text, so everything that is not
//! an annotation (comments, formatting, line positions of untouched code)
//! survives byte for byte. A block emptied by the deletions gets a `pass`.

use crate::syntax::{self, FunctionDef, Param, SmallKind, SmallStmt, Span, Stmt, StmtKind, Suite};
use crate::ParseError;

/// Strip all type annotations from Python source
pub fn strip(source: &str) -> Result<String, ParseError> {
    let module = syntax::parse(source)?;
    let mut edits = Vec::new();
    block_edits(source, &module.body, false, &mut edits);
    Ok(apply_edits(source, edits))
}

/// A replacement of `span` with `text`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Edit {
    span: Span,
    text: String,
}

impl Edit {
    fn replace(start: usize, end: usize, text: impl Into<String>) -> Self {
        Self {
            span: Span::new(start, end),
            text: text.into(),
        }
    }

    fn delete(start: usize, end: usize) -> Self {
        Self::replace(start, end, "")
    }
}

/// What happens to a line of simple statements
enum LineRewrite {
    Unchanged,
    /// Every statement on the line was a bare declaration
    Removed,
    Rewritten(String),
}

fn rewrite_smalls(source: &str, smalls: &[SmallStmt]) -> LineRewrite {
    let mut changed = false;
    let mut kept = Vec::with_capacity(smalls.len());
    for small in smalls {
        match small.kind {
            SmallKind::AnnAssign { value: None, .. } => changed = true,
            SmallKind::AnnAssign {
                target,
                value: Some(value),
                ..
            } => {
                changed = true;
                kept.push(format!("{} = {}", target.slice(source), value.slice(source)));
            }
            SmallKind::Other => kept.push(small.span.slice(source).to_string()),
        }
    }

    if !changed {
        LineRewrite::Unchanged
    } else if kept.is_empty() {
        LineRewrite::Removed
    } else {
        LineRewrite::Rewritten(kept.join("; "))
    }
}

fn smalls_span(smalls: &[SmallStmt]) -> Option<Span> {
    let first = smalls.first()?;
    let last = smalls.last()?;
    Some(Span::new(first.span.start, last.span.end))
}

/// Collects edits for a sequence of statements. `needs_body` is set for
/// indented blocks, which must keep at least one statement.
fn block_edits(source: &str, body: &[Stmt], needs_body: bool, edits: &mut Vec<Edit>) {
    let rewrites: Vec<Option<LineRewrite>> = body
        .iter()
        .map(|stmt| match &stmt.kind {
            StmtKind::Simple(smalls) => Some(rewrite_smalls(source, smalls)),
            _ => None,
        })
        .collect();

    let emptied = needs_body
        && rewrites
            .iter()
            .all(|r| matches!(r, Some(LineRewrite::Removed)));
    let mut placeholder_written = false;

    for (stmt, rewrite) in body.iter().zip(rewrites) {
        match (&stmt.kind, rewrite) {
            (StmtKind::Simple(smalls), Some(rewrite)) => {
                let Some(span) = smalls_span(smalls) else {
                    continue;
                };
                match rewrite {
                    LineRewrite::Unchanged => {}
                    LineRewrite::Rewritten(text) => edits.push(Edit::replace(span.start, span.end, text)),
                    LineRewrite::Removed if emptied && !placeholder_written => {
                        placeholder_written = true;
                        edits.push(Edit::replace(span.start, span.end, "pass"));
                    }
                    LineRewrite::Removed => edits.push(Edit::delete(stmt.line_start, stmt.line_end)),
                }
            }
            (StmtKind::FunctionDef(def), _) => function_edits(source, def, edits),
            (StmtKind::Compound { body, .. }, _) => suite_edits(source, body, edits),
            (StmtKind::Simple(_), None) => {}
        }
    }
}

fn suite_edits(source: &str, suite: &Suite, edits: &mut Vec<Edit>) {
    match suite {
        Suite::Block(body) => block_edits(source, body, true, edits),
        Suite::Inline(smalls) => {
            let Some(span) = smalls_span(smalls) else {
                return;
            };
            match rewrite_smalls(source, smalls) {
                LineRewrite::Unchanged => {}
                LineRewrite::Removed => edits.push(Edit::replace(span.start, span.end, "pass")),
                LineRewrite::Rewritten(text) => edits.push(Edit::replace(span.start, span.end, text)),
            }
        }
    }
}

fn function_edits(source: &str, def: &FunctionDef, edits: &mut Vec<Edit>) {
    edits.extend(def.params.iter().filter_map(param_edit));
    if let Some(returns) = def.returns {
        // Drop the whitespace between `)` and `->` along with the annotation
        edits.push(Edit::delete(def.params_end, returns.end));
    }
    suite_edits(source, &def.body, edits);
}

fn param_edit(param: &Param) -> Option<Edit> {
    let annotation = param.annotation?;
    Some(match param.default {
        // `b: str = "x"` -> `b="x"`
        Some(default) => Edit::replace(param.name.end, default.start, "="),
        None => Edit::delete(param.name.end, annotation.end),
    })
}

fn apply_edits(source: &str, mut edits: Vec<Edit>) -> String {
    if edits.is_empty() {
        return source.to_string();
    }
    edits.sort_by_key(|edit| edit.span.start);

    let mut out = String::with_capacity(source.len());
    let mut cursor = 0;
    for edit in edits {
        debug_assert!(edit.span.start >= cursor, "overlapping edits");
        out.push_str(&source[cursor..edit.span.start]);
        out.push_str(&edit.text);
        cursor = edit.span.end;
    }
    out.push_str(&source[cursor..]);
    out
}
