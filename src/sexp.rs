//! The prover's S-expression dialect.
//!
//! This is not a general Lisp reader. It recognizes exactly what `sertop`
//! emits and accepts: atoms (bare symbols, integers, and `"..."`-quoted
//! strings with `\"` and `\\` escapes) and parenthesized lists, nothing
//! else. Three entry points are exposed:
//!
//! - [`parse`] builds a full tagged tree ([`Sexp`]).
//! - [`Sexp::to_string`] (via `Display`) serializes it back out.
//! - [`split_top_level`] slices the top-level elements of a list's inner
//!   string *without* building a tree, which is the hot path the executor
//!   uses to carve `goals`/`stack`/`shelf`/`given_up` regions out of a
//!   `Goals` answer cheaply.
//!
//! ## The bracket quirk
//!
//! `sertop` occasionally emits the literal two-character payloads `(Pp_string
//! [)` and `(Pp_string ])` — the pretty-printer's way of saying "the string
//! `[`" and "the string `]`" — without quoting them. A bare `[` or `]` is not
//! valid atom syntax here (brackets are not otherwise used by this dialect),
//! so the tokenizer would desynchronize on the following `)`. [`sanitize_brackets`]
//! rewrites both forms, plus a bare trailing `[)`, into their properly quoted
//! equivalents before the real parse begins.

use std::fmt;

/// A parsed S-expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sexp {
    Atom(String),
    List(Vec<Sexp>),
}

impl Sexp {
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Sexp::Atom(s) => Some(s),
            Sexp::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Sexp]> {
        match self {
            Sexp::List(items) => Some(items),
            Sexp::Atom(_) => None,
        }
    }

    /// The head atom of a list of the shape `(Head ...)`, if this is a
    /// non-empty list whose first element is itself an atom.
    pub fn head(&self) -> Option<&str> {
        self.as_list()?.first()?.as_atom()
    }
}

impl fmt::Display for Sexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sexp::Atom(s) => {
                if atom_needs_quoting(s) {
                    write!(f, "\"")?;
                    for c in s.chars() {
                        match c {
                            '\\' => write!(f, "\\\\")?,
                            '"' => write!(f, "\\\"")?,
                            _ => write!(f, "{}", c)?,
                        }
                    }
                    write!(f, "\"")
                } else {
                    write!(f, "{}", s)
                }
            }
            Sexp::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

fn atom_needs_quoting(s: &str) -> bool {
    s.is_empty() || s.chars().any(|c| c.is_whitespace() || c == '(' || c == ')' || c == '"')
}

/// Rewrite the two known unquoted-bracket payloads, and a stray trailing
/// `[)`, into quoted form. Idempotent: running it twice is the same as
/// running it once, since the rewritten form no longer matches the patterns
/// it looks for.
pub fn sanitize_brackets(input: &str) -> String {
    input
        .replace("(Pp_string [)", "(Pp_string \"[\")")
        .replace("(Pp_string ])", "(Pp_string \"]\")")
        .replace(" [)", " \"[\")")
}

/// Parse error: the byte offset of the failure and a short reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub offset: usize,
    pub reason: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at byte {}: {}", self.offset, self.reason)
    }
}

impl std::error::Error for ParseError {}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Self {
        Cursor { bytes: s.as_bytes(), pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn err(&self, reason: impl Into<String>) -> ParseError {
        ParseError { offset: self.pos, reason: reason.into() }
    }
}

/// Parse a single S-expression, allowing trailing whitespace but no trailing
/// garbage.
pub fn parse(input: &str) -> Result<Sexp, ParseError> {
    let sanitized = sanitize_brackets(input);
    let mut c = Cursor::new(&sanitized);
    c.skip_ws();
    let value = parse_value(&mut c)?;
    c.skip_ws();
    if c.pos != c.bytes.len() {
        return Err(c.err("trailing data after top-level expression"));
    }
    Ok(value)
}

fn parse_value(c: &mut Cursor<'_>) -> Result<Sexp, ParseError> {
    c.skip_ws();
    match c.peek() {
        Some(b'(') => parse_list(c),
        Some(b'"') => parse_quoted(c).map(Sexp::Atom),
        Some(_) => parse_bare_atom(c).map(Sexp::Atom),
        None => Err(c.err("unexpected end of input")),
    }
}

fn parse_list(c: &mut Cursor<'_>) -> Result<Sexp, ParseError> {
    assert_eq!(c.bump(), Some(b'('));
    let mut items = Vec::new();
    loop {
        c.skip_ws();
        match c.peek() {
            Some(b')') => {
                c.bump();
                return Ok(Sexp::List(items));
            }
            None => return Err(c.err("unterminated list")),
            _ => items.push(parse_value(c)?),
        }
    }
}

fn parse_quoted(c: &mut Cursor<'_>) -> Result<String, ParseError> {
    assert_eq!(c.bump(), Some(b'"'));
    let mut out = String::new();
    loop {
        match c.bump() {
            None => return Err(c.err("unterminated string literal")),
            Some(b'"') => return Ok(out),
            Some(b'\\') => match c.bump() {
                Some(b'"') => out.push('"'),
                Some(b'\\') => out.push('\\'),
                Some(other) => out.push(other as char),
                None => return Err(c.err("unterminated escape in string literal")),
            },
            Some(other) => out.push(other as char),
        }
    }
}

fn parse_bare_atom(c: &mut Cursor<'_>) -> Result<String, ParseError> {
    let start = c.pos;
    while matches!(c.peek(), Some(b) if !b.is_ascii_whitespace() && b != b'(' && b != b')') {
        c.pos += 1;
    }
    if c.pos == start {
        return Err(c.err("expected an atom"));
    }
    Ok(String::from_utf8_lossy(&c.bytes[start..c.pos]).into_owned())
}

/// Split the body of a list (the text *between* its outer parens, or the
/// text of a bare list including the parens — both forms are tolerated) into
/// the strings of its top-level elements, without recursing into nested
/// structure. Quote-aware so a `"(` inside a string literal does not throw
/// off the paren count.
pub fn split_top_level(input: &str) -> Vec<String> {
    let trimmed = input.trim();
    let body = match (trimmed.strip_prefix('('), trimmed.strip_suffix(')')) {
        (Some(rest), Some(_)) if rest.len() + 1 == trimmed.len() => &trimmed[1..trimmed.len() - 1],
        _ => trimmed,
    };

    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut escape = false;
    let mut start: Option<usize> = None;
    let bytes = body.as_bytes();

    for (i, &b) in bytes.iter().enumerate() {
        if start.is_none() && !b.is_ascii_whitespace() {
            start = Some(i);
        }
        if escape {
            escape = false;
            continue;
        }
        match b {
            b'\\' if in_quote => escape = true,
            b'"' => in_quote = !in_quote,
            b'(' if !in_quote => depth += 1,
            b')' if !in_quote => depth -= 1,
            b' ' | b'\t' | b'\n' | b'\r' if !in_quote && depth == 0 => {
                if let Some(s) = start {
                    out.push(body[s..i].to_string());
                    start = None;
                }
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push(body[s..].trim_end().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_atoms_and_lists() {
        assert_eq!(parse("foo").unwrap(), Sexp::Atom("foo".into()));
        assert_eq!(parse("42").unwrap(), Sexp::Atom("42".into()));
        assert_eq!(
            parse("(Add () \"x\")").unwrap(),
            Sexp::List(vec![
                Sexp::Atom("Add".into()),
                Sexp::List(vec![]),
                Sexp::Atom("x".into()),
            ])
        );
    }

    #[test]
    fn handles_escapes_in_quoted_strings() {
        let s = parse(r#"(Pp_string "a\"b\\c")"#).unwrap();
        assert_eq!(
            s,
            Sexp::List(vec![Sexp::Atom("Pp_string".into()), Sexp::Atom("a\"b\\c".into())])
        );
    }

    #[test]
    fn sanitizes_bracket_payloads() {
        assert_eq!(sanitize_brackets("(Pp_string [)"), "(Pp_string \"[\")");
        assert_eq!(sanitize_brackets("(Pp_string ])"), "(Pp_string \"]\")");
        let parsed = parse("(Pp_string [)").unwrap();
        assert_eq!(parsed.head(), Some("Pp_string"));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_brackets("(Pp_string [)");
        let twice = sanitize_brackets(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn split_top_level_does_not_recurse() {
        let items = split_top_level("((a (b c)) (d) e)");
        assert_eq!(items, vec!["(a (b c))", "(d)", "e"]);
    }

    #[test]
    fn split_top_level_is_quote_aware() {
        let items = split_top_level(r#"("a b" c)"#);
        assert_eq!(items, vec![r#""a b""#, "c"]);
    }

    #[test]
    fn round_trips_through_display() {
        let s = parse("(Exec 3)").unwrap();
        assert_eq!(s.to_string(), "(Exec 3)");
    }
}
