//! Script compilation: statement splitting, label directives, named
//! placeholder rewriting and statement classification.
//!
//! This is structural recognition only. Quoted literals and comments are
//! tracked so that a `;` inside them does not end a statement, but no SQL
//! grammar is parsed.

use crate::dialect::Dialect;
use crate::error::CompileError;

const QUERY_PREFIXES: [&str; 6] = ["SELECT", "SHOW", "DESCRIBE", "EXPLAIN", "PRAGMA", "WITH"];

/// One executable unit of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub index: usize,
    pub label: String,
    /// Body with named placeholders already rewritten for the target dialect.
    pub sql: String,
    /// Named parameters in placeholder order. Duplicates are preserved.
    pub params: Vec<String>,
    pub is_query: bool,
    pub is_exported: bool,
    /// Identifier of the script the statement belongs to.
    pub script: String,
}

/// Compiles a raw script body. All-or-nothing: on error no statement is
/// returned.
pub fn compile(script: &str, text: &str, dialect: Dialect) -> Result<Vec<Statement>, CompileError> {
    let mut statements = Vec::new();
    for fragment in split_statements(text)? {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            continue;
        }
        let (label, body) = split_label(fragment);
        if body.is_empty() {
            continue;
        }
        let index = statements.len();
        let (sql, params) = rewrite_placeholders(&body, dialect);
        statements.push(Statement {
            index,
            label: label.unwrap_or_else(|| index.to_string()),
            is_query: is_query(&sql),
            is_exported: is_exported(&sql),
            sql,
            params,
            script: script.to_string(),
        });
    }
    Ok(statements)
}

#[derive(Clone, Copy)]
enum Scan {
    Code,
    Quoted(char, usize),
    LineComment,
    BlockComment(usize),
}

/// Splits on every `;` that is outside quotes and comments.
pub fn split_statements(text: &str) -> Result<Vec<&str>, CompileError> {
    let mut parts = Vec::new();
    let mut state = Scan::Code;
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        state = match state {
            Scan::Code => match ch {
                '\'' | '"' | '`' => Scan::Quoted(ch, idx),
                '-' if matches!(chars.peek(), Some((_, '-'))) => {
                    chars.next();
                    Scan::LineComment
                }
                '/' if matches!(chars.peek(), Some((_, '*'))) => {
                    chars.next();
                    Scan::BlockComment(idx)
                }
                ';' => {
                    parts.push(&text[start..idx]);
                    start = idx + 1;
                    Scan::Code
                }
                _ => Scan::Code,
            },
            // A doubled quote closes and immediately reopens, which keeps
            // `'it''s'` inside the literal.
            Scan::Quoted(quote, _) if ch == quote => Scan::Code,
            Scan::Quoted(..) => state,
            Scan::LineComment if ch == '\n' => Scan::Code,
            Scan::LineComment => state,
            Scan::BlockComment(_) if ch == '*' && matches!(chars.peek(), Some((_, '/'))) => {
                chars.next();
                Scan::Code
            }
            Scan::BlockComment(_) => state,
        };
    }

    match state {
        Scan::Quoted(quote, offset) => Err(CompileError::UnterminatedQuote { quote, offset }),
        Scan::BlockComment(offset) => Err(CompileError::UnterminatedComment { offset }),
        Scan::Code | Scan::LineComment => {
            parts.push(&text[start..]);
            Ok(parts)
        }
    }
}

/// Separates an optional leading `-- @label: name` line from the body.
/// Blank and comment-only lines are dropped from the body.
pub fn split_label(fragment: &str) -> (Option<String>, String) {
    let trimmed = fragment.trim();
    let (first, rest) = trimmed.split_once('\n').unwrap_or((trimmed, ""));
    match parse_label_directive(first) {
        Some(label) => (Some(label), strip_comment_lines(rest)),
        None => (None, strip_comment_lines(trimmed)),
    }
}

fn parse_label_directive(line: &str) -> Option<String> {
    let rest = line.trim().strip_prefix("--")?.trim_start();
    let keyword = rest.get(..6)?;
    if !keyword.eq_ignore_ascii_case("@label") {
        return None;
    }
    let label = rest[6..].trim_start().strip_prefix(':')?.trim();
    (!label.is_empty()).then(|| label.to_string())
}

fn strip_comment_lines(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with("--")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Replaces `?name?` tokens left to right with dialect placeholders and
/// returns the rewritten text with the ordered parameter names. Quoted
/// literals are copied through untouched.
pub fn rewrite_placeholders(body: &str, dialect: Dialect) -> (String, Vec<String>) {
    let mut sql = String::with_capacity(body.len());
    let mut params = Vec::new();
    let mut quote: Option<char> = None;
    let mut rest = body;

    while let Some(ch) = rest.chars().next() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => {}
            None if matches!(ch, '\'' | '"' | '`') => quote = Some(ch),
            None if ch == '?' => {
                let after = &rest[1..];
                let end = after.find(|c| matches!(c, '?' | '\n' | '\'' | '"' | '`'));
                if let Some(end) = end.filter(|&end| end > 0 && after[end..].starts_with('?')) {
                    sql.push_str(&dialect.placeholder(params.len()));
                    params.push(after[..end].to_string());
                    rest = &after[end + 1..];
                    continue;
                }
            }
            None => {}
        }
        sql.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    (sql, params)
}

pub fn is_query(sql: &str) -> bool {
    let upper = sql.trim_start().to_ascii_uppercase();
    QUERY_PREFIXES.iter().any(|prefix| upper.starts_with(prefix))
}

/// A statement is exported when its first character is an upper-case
/// letter (`SELECT ...` is exported, `select ...` is not).
pub fn is_exported(sql: &str) -> bool {
    sql.chars()
        .next()
        .map_or(false, |first| first.is_alphabetic() && first.is_uppercase())
}

/// Structural escaping for text concatenated into SQL: doubles single
/// quotes and removes `--` comment markers. Not an injection defence for
/// arbitrary input.
pub fn sql_safe(value: &str) -> String {
    value.replace('\'', "''").replace("--", "")
}
