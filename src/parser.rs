//! Parser (C2, part 2): command-name/argument parsing, assignment-target
//! detection, and the `IDENT ( … )` macro-definition sugar.
//!
//! Grounded on the teacher's `parser/parser.rs` + `parser/command_parser.rs`
//! (recursive-descent construction of a command AST from a token stream)
//! and `parser/types.rs` (the `ParseException` shape, reused here as
//! `ParseError`).

use indexmap::IndexMap;
use thiserror::Error;

use crate::position::SourcePosition;

#[derive(Debug, Clone, Error)]
#[error("parse error at {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: SourcePosition,
}

impl ParseError {
    fn new(message: impl Into<String>, position: SourcePosition) -> Self {
        Self { message: message.into(), position }
    }
}

/// The syntactic shape an argument token was written in, per `spec.md`
/// §3's `ParsedCommand` description ("bare, quoted string, parenthesised
/// group, identifier").
#[derive(Debug, Clone, PartialEq)]
pub enum ArgKind {
    Bare,
    QuotedString,
    ParenGroup,
    BraceGroup,
    Identifier,
    Integer(i64),
    Float(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    /// The raw textual form (unescaped string contents for quoted
    /// strings; inner text without delimiters for paren/brace groups).
    pub text: String,
    pub kind: ArgKind,
    pub position: SourcePosition,
}

/// A single command after name/argument parsing: head name, ordered
/// positional args, insertion-ordered named args.
#[derive(Debug, Clone)]
pub struct CommandCall {
    pub name: String,
    pub name_position: SourcePosition,
    pub args: Vec<Arg>,
    pub named_args: IndexMap<String, Option<Arg>>,
    pub position: SourcePosition,
}

/// One of the five legal assignment-target shapes (`spec.md` §4.2).
#[derive(Debug, Clone)]
pub enum AssignTarget {
    Name(String),
    TildeRef(String),
    Literal(String),
    Brace(String),
    Unpack(Vec<UnpackPattern>),
    /// `~ref` that itself resolves to a list at runtime (dynamic unpacking,
    /// §4.7); carried as a tilde expr, resolved by the executor.
    DynamicUnpack(String),
}

#[derive(Debug, Clone)]
pub enum UnpackPattern {
    Positional(String),
    Named { key: String, alias: Option<String> },
}

pub struct Assignment {
    pub target: AssignTarget,
    pub value_text: String,
    pub value_position: SourcePosition,
}

/// Split `text` at top level (outside quotes/parens/braces) on commas.
/// Returns `(slice, start_offset)` pairs.
fn split_top_level_commas(text: &str) -> Vec<(&str, usize)> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut depth_paren = 0i32;
    let mut depth_brace = 0i32;
    let mut quote: Option<u8> = None;
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        if let Some(q) = quote {
            if c == b'\\' && i + 1 < bytes.len() {
                i += 2;
                continue;
            }
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            b'\'' | b'"' => quote = Some(c),
            b'(' => depth_paren += 1,
            b')' => depth_paren -= 1,
            b'{' => depth_brace += 1,
            b'}' => depth_brace -= 1,
            b',' if depth_paren == 0 && depth_brace == 0 => {
                out.push((&text[start..i], start));
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    out.push((&text[start..], start));
    out
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn read_ident(s: &str) -> Option<(&str, &str)> {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, c)) if is_ident_start(c) => {}
        _ => return None,
    }
    let mut end = s.len();
    for (idx, c) in chars {
        if !is_ident_char(c) {
            end = idx;
            break;
        }
    }
    Some((&s[..end], &s[end..]))
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('\\') => out.push('\\'),
                Some('\'') => out.push('\''),
                Some('"') => out.push('"'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Find the matching close delimiter for an open delimiter at byte offset
/// 0 of `s` (which must start with `open`). Quote-aware.
fn find_matching(s: &str, open: char, close: char) -> Option<usize> {
    let bytes = s.as_bytes();
    if bytes.first().copied() != Some(open as u8) {
        return None;
    }
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        if let Some(q) = quote {
            if c == b'\\' && i + 1 < bytes.len() {
                i += 2;
                continue;
            }
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            b'\'' | b'"' => quote = Some(c),
            _ if c == open as u8 => depth += 1,
            _ if c == close as u8 => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Classify and parse one argument slot's raw text (already comma-trimmed)
/// into an `Arg`. `slot_start` is its byte offset within the owning
/// command text, used for position lookup.
fn parse_arg_value(raw: &str, slot_start: usize, pos_of: &dyn Fn(usize) -> SourcePosition) -> Result<Arg, ParseError> {
    let trimmed = raw.trim();
    let leading_ws = raw.len() - raw.trim_start().len();
    let pos = pos_of(slot_start + leading_ws);
    if trimmed.is_empty() {
        return Ok(Arg { text: String::new(), kind: ArgKind::Bare, position: pos });
    }
    let bytes = trimmed.as_bytes();
    match bytes[0] {
        b'"' | b'\'' => {
            let quote = bytes[0] as char;
            if trimmed.len() < 2 || trimmed.as_bytes()[trimmed.len() - 1] != quote as u8 {
                return Err(ParseError::new("unterminated quoted string", pos));
            }
            let inner = &trimmed[1..trimmed.len() - 1];
            Ok(Arg { text: unescape(inner), kind: ArgKind::QuotedString, position: pos })
        }
        b'(' => {
            let end = find_matching(trimmed, '(', ')').ok_or_else(|| ParseError::new("unbalanced '('", pos))?;
            Ok(Arg { text: trimmed[1..end].to_string(), kind: ArgKind::ParenGroup, position: pos })
        }
        b'{' => {
            let end = find_matching(trimmed, '{', '}').ok_or_else(|| ParseError::new("unbalanced '{'", pos))?;
            Ok(Arg { text: trimmed[1..end].to_string(), kind: ArgKind::BraceGroup, position: pos })
        }
        _ => {
            if trimmed == "true" {
                return Ok(Arg { text: trimmed.to_string(), kind: ArgKind::Bool(true), position: pos });
            }
            if trimmed == "false" {
                return Ok(Arg { text: trimmed.to_string(), kind: ArgKind::Bool(false), position: pos });
            }
            if let Some(n) = parse_numeric(trimmed) {
                return Ok(n.with_position(pos));
            }
            if read_ident(trimmed).map(|(id, rest)| rest.is_empty() && id == trimmed).unwrap_or(false) {
                return Ok(Arg { text: trimmed.to_string(), kind: ArgKind::Identifier, position: pos });
            }
            Ok(Arg { text: trimmed.to_string(), kind: ArgKind::Bare, position: pos })
        }
    }
}

impl Arg {
    fn with_position(mut self, pos: SourcePosition) -> Self {
        self.position = pos;
        self
    }
}

fn parse_numeric(s: &str) -> Option<Arg> {
    let bytes = s.as_bytes();
    let mut i = 0usize;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        i += 1;
    }
    let digit_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i == digit_start {
        return None;
    }
    let mut is_float = false;
    if i < bytes.len() && bytes[i] == b'.' {
        let frac_start = i + 1;
        let mut j = frac_start;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > frac_start {
            is_float = true;
            i = j;
        }
    }
    if i != bytes.len() {
        return None;
    }
    let synth_pos = SourcePosition::synthetic();
    if is_float {
        s.parse::<f64>().ok().map(|f| Arg { text: s.to_string(), kind: ArgKind::Float(f), position: synth_pos })
    } else {
        s.parse::<i64>().ok().map(|n| Arg { text: s.to_string(), kind: ArgKind::Integer(n), position: synth_pos })
    }
}

/// Parse one comma-separated argument slot, recognising the `name:` /
/// `name: value` named-argument form. `key` is returned only for items
/// containing an unquoted top-level colon; afterwards slots revert to
/// positional parsing for the next item (`spec.md` §4.2).
fn parse_one_slot(
    raw: &str,
    slot_start: usize,
    pos_of: &dyn Fn(usize) -> SourcePosition,
) -> Result<(Option<String>, Option<Arg>), ParseError> {
    let leading_ws = raw.len() - raw.trim_start().len();
    let trimmed = raw.trim_start();
    if let Some((ident, rest)) = read_ident(trimmed) {
        let after = rest.trim_start();
        if let Some(colon_rest) = after.strip_prefix(':') {
            // Ensure this isn't the start of a quoted/paren/brace value
            // masquerading as an identifier (read_ident already stops at
            // non-ident chars, so this is safe).
            if !colon_rest.starts_with(':') {
                let value_part = colon_rest.trim();
                if value_part.is_empty() {
                    return Ok((Some(ident.to_string()), None));
                }
                let value_offset = raw.len() - colon_rest.len() + (colon_rest.len() - colon_rest.trim_start().len());
                let arg = parse_arg_value(colon_rest, slot_start + value_offset, pos_of)?;
                return Ok((Some(ident.to_string()), Some(arg)));
            }
        }
    }
    let arg = parse_arg_value(raw, slot_start, pos_of)?;
    Ok((None, Some(arg)))
}

/// Apply the `IDENT ( … )` macro-definition sugar: if the remainder after
/// the command name is, modulo leading whitespace, `IDENT(` with a
/// balanced paren group (optionally followed by a brace group), rewrite it
/// into explicit args: a quoted identifier, a `ParenGroup`, and (if
/// present) a trailing `BraceGroup`.
fn try_apply_sugar(rest: &str, pos_of: &dyn Fn(usize) -> SourcePosition) -> Option<Result<Vec<Arg>, ParseError>> {
    let leading_ws = rest.len() - rest.trim_start().len();
    let trimmed = &rest[leading_ws..];
    let (ident, after_ident) = read_ident(trimmed)?;
    let after_ident_trimmed_ws = after_ident.len() - after_ident.trim_start().len();
    let after_ws = &after_ident[after_ident_trimmed_ws..];
    if !after_ws.starts_with('(') {
        return None;
    }
    let paren_end = match find_matching(after_ws, '(', ')') {
        Some(e) => e,
        None => return Some(Err(ParseError::new("unbalanced '(' in macro header", pos_of(0)))),
    };
    let paren_inner = after_ws[1..paren_end].to_string();
    let mut args = vec![
        Arg { text: ident.to_string(), kind: ArgKind::QuotedString, position: pos_of(leading_ws) },
        Arg { text: paren_inner, kind: ArgKind::ParenGroup, position: pos_of(0) },
    ];
    let remainder = &after_ws[paren_end + 1..];
    let remainder_trimmed = remainder.trim_start();
    if remainder_trimmed.starts_with('{') {
        match find_matching(remainder_trimmed, '{', '}') {
            Some(e) => {
                args.push(Arg {
                    text: remainder_trimmed[1..e].to_string(),
                    kind: ArgKind::BraceGroup,
                    position: pos_of(0),
                });
            }
            None => return Some(Err(ParseError::new("unbalanced '{' in macro body", pos_of(0)))),
        }
    }
    Some(Ok(args))
}

/// Recognise the macro-definition sugar on *unsubstituted* text: if the
/// remainder after the command name matches `IDENT ( … )` (optionally
/// followed by `{ … }`), return the rewritten call directly. Returns `None`
/// when the shape doesn't match, so a caller can fall back to its own
/// handling (`parse_command_call` falls back to ordinary argument parsing;
/// the executor falls back to running substitution first).
///
/// Sugar is recognised before substitution (`spec.md` §4.5 step 3) so a
/// macro's `{ body }` is captured as a deferred `BraceGroup` argument
/// instead of being eagerly evaluated as a Stage A sub-script.
pub fn try_parse_sugar_call(text: &str, base: &SourcePosition) -> Option<Result<CommandCall, ParseError>> {
    let pos_of = |_offset: usize| base.clone();
    let trimmed = text.trim();
    let (name, rest) = read_ident(trimmed)?;
    let sugar = try_apply_sugar(rest, &pos_of)?;
    Some(sugar.map(|args| CommandCall {
        name: name.to_string(),
        name_position: base.clone(),
        args,
        named_args: IndexMap::new(),
        position: base.clone(),
    }))
}

/// Parse a single command's (already separator-split, already substituted)
/// text into `name` + args + named args. `base` anchors position lookups
/// for the text's start; callers without a real source map may pass
/// `SourcePosition::synthetic` clones.
pub fn parse_command_call(text: &str, base: &SourcePosition) -> Result<CommandCall, ParseError> {
    if let Some(result) = try_parse_sugar_call(text, base) {
        return result;
    }

    let trimmed = text.trim();
    let (name, rest) = read_ident(trimmed).ok_or_else(|| {
        ParseError::new(format!("expected a command name, found '{}'", trimmed), base.clone())
    })?;

    let (args, named_args) = parse_arg_list(rest, base)?;
    Ok(CommandCall { name: name.to_string(), name_position: base.clone(), args, named_args, position: base.clone() })
}

/// Parse a macro-definition's parenthesised parameter list into declared
/// names (`spec.md` §4.2's sugar: "a name and a deferred body" — the
/// parameter names themselves are this crate's addition, bound at
/// invocation alongside the numeric `$N` forms).
pub fn parse_macro_params(text: &str) -> Result<Vec<String>, ParseError> {
    let mut out = Vec::new();
    for (slot, _start) in split_top_level_commas(text) {
        let trimmed = slot.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (ident, rest) = read_ident(trimmed)
            .ok_or_else(|| ParseError::new(format!("invalid macro parameter '{}'", trimmed), SourcePosition::synthetic()))?;
        if !rest.trim().is_empty() {
            return Err(ParseError::new(format!("invalid macro parameter '{}'", trimmed), SourcePosition::synthetic()));
        }
        out.push(ident.to_string());
    }
    Ok(out)
}

/// Parse a comma-separated argument list (no leading command name), used
/// both by `parse_command_call` and by macro/block dispatch when the
/// command head is itself an object-reference marker (`spec.md` §4.5 step
/// 6), where the remaining text is an argument list with no head token.
pub fn parse_arg_list(rest: &str, base: &SourcePosition) -> Result<(Vec<Arg>, IndexMap<String, Option<Arg>>), ParseError> {
    let pos_of = |_offset: usize| base.clone();
    let mut args = Vec::new();
    let mut named_args = IndexMap::new();
    let rest_trimmed = rest.trim_start();
    if !rest_trimmed.is_empty() {
        for (slot, slot_start) in split_top_level_commas(rest_trimmed) {
            let (key, arg) = parse_one_slot(slot, slot_start, &pos_of)?;
            match key {
                Some(k) => {
                    named_args.insert(k, arg);
                }
                None => {
                    if let Some(a) = arg {
                        args.push(a);
                    }
                }
            }
        }
    }
    Ok((args, named_args))
}

/// Parse `text` as a single argument slot (no comma splitting), used for
/// assignment right-hand sides (`spec.md` §4.7: "evaluate `value` by
/// parsing it as a single argument slot").
pub fn parse_single_value(text: &str, base: &SourcePosition) -> Result<Arg, ParseError> {
    let pos_of = |_offset: usize| base.clone();
    parse_arg_value(text, 0, &pos_of)
}

/// Find the matching `)` for a `(` at byte offset 0 of `s`. Used by the
/// executor to split a parenthetic-block body from its trailing argument
/// list without duplicating the quote/paren-depth scan.
pub fn find_matching_paren(s: &str) -> Option<usize> {
    find_matching(s, '(', ')')
}

/// Attempt to recognise `text` as an assignment (`TARGET : VALUE`) or
/// tuple-unpack (`(p1, p2, …) : VALUE`). Returns `None` if `text` does not
/// have this shape (the caller should fall back to ordinary command
/// parsing). `spec.md` §4.2/§4.7.
pub fn try_parse_assignment(text: &str, base: &SourcePosition) -> Option<Result<Assignment, ParseError>> {
    let trimmed = text.trim_start();
    let bytes = trimmed.as_bytes();
    if bytes.is_empty() {
        return None;
    }

    let (target, rest) = if bytes[0] == b'~' {
        let (ident, after) = read_ident(&trimmed[1..])?;
        (AssignTarget::TildeRef(ident.to_string()), after)
    } else if bytes[0] == b'"' || bytes[0] == b'\'' {
        let quote = bytes[0] as char;
        let close = trimmed[1..].find(quote)? + 1;
        (AssignTarget::Literal(unescape(&trimmed[1..close])), &trimmed[close + 1..])
    } else if bytes[0] == b'{' {
        let end = find_matching(trimmed, '{', '}')?;
        (AssignTarget::Brace(trimmed[1..end].to_string()), &trimmed[end + 1..])
    } else if bytes[0] == b'(' {
        let end = find_matching(trimmed, '(', ')')?;
        let inner = &trimmed[1..end];
        let after = &trimmed[end + 1..];
        // Only an assignment target if followed (mod whitespace) by ':'.
        if !after.trim_start().starts_with(':') {
            return None;
        }
        let patterns = match parse_unpack_patterns(inner) {
            Ok(p) => p,
            Err(e) => return Some(Err(e)),
        };
        (AssignTarget::Unpack(patterns), after)
    } else if let Some((ident, after)) = read_ident(trimmed) {
        (AssignTarget::Name(ident.to_string()), after)
    } else {
        return None;
    };

    let after_ws = rest.trim_start();
    let colon_rest = after_ws.strip_prefix(':')?;
    if colon_rest.starts_with(':') {
        return None;
    }
    let value_text = colon_rest.trim_start().to_string();
    Some(Ok(Assignment { target, value_text, value_position: base.clone() }))
}

fn parse_unpack_patterns(inner: &str) -> Result<Vec<UnpackPattern>, ParseError> {
    let mut out = Vec::new();
    if inner.trim().is_empty() {
        return Ok(out);
    }
    for (slot, _start) in split_top_level_commas(inner) {
        let trimmed = slot.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some((ident, after)) = read_ident(trimmed) {
            let after = after.trim_start();
            if let Some(alias_part) = after.strip_prefix(':') {
                let alias = alias_part.trim();
                if alias.is_empty() {
                    out.push(UnpackPattern::Named { key: ident.to_string(), alias: None });
                } else {
                    out.push(UnpackPattern::Named { key: ident.to_string(), alias: Some(alias.to_string()) });
                }
                continue;
            }
            if after.is_empty() {
                out.push(UnpackPattern::Positional(ident.to_string()));
                continue;
            }
        }
        return Err(ParseError::new(format!("invalid unpack pattern element '{}'", trimmed), SourcePosition::synthetic()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos() -> SourcePosition {
        SourcePosition::new("t", 1, 1, 0)
    }

    #[test]
    fn parses_simple_command() {
        let call = parse_command_call("echo \"hello\"", &pos()).unwrap();
        assert_eq!(call.name, "echo");
        assert_eq!(call.args.len(), 1);
        assert_eq!(call.args[0].text, "hello");
        assert_eq!(call.args[0].kind, ArgKind::QuotedString);
    }

    #[test]
    fn parses_positional_and_named_args() {
        let call = parse_command_call("cmd a, b, key: 1, other: \"x\"", &pos()).unwrap();
        assert_eq!(call.args.len(), 2);
        assert_eq!(call.named_args.len(), 2);
        assert_eq!(call.named_args.get_index(0).unwrap().0, "key");
    }

    #[test]
    fn macro_sugar_rewrite() {
        let call = parse_command_call("macro greet (who) { echo \"hi\", $1 }", &pos()).unwrap();
        assert_eq!(call.name, "macro");
        assert_eq!(call.args.len(), 3);
        assert_eq!(call.args[0].kind, ArgKind::QuotedString);
        assert_eq!(call.args[0].text, "greet");
        assert_eq!(call.args[1].kind, ArgKind::ParenGroup);
        assert_eq!(call.args[1].text, "who");
        assert_eq!(call.args[2].kind, ArgKind::BraceGroup);
    }

    #[test]
    fn simple_assignment_detected() {
        let a = try_parse_assignment("x: 7", &pos()).unwrap().unwrap();
        assert!(matches!(a.target, AssignTarget::Name(n) if n == "x"));
        assert_eq!(a.value_text, "7");
    }

    #[test]
    fn plain_command_is_not_an_assignment() {
        assert!(try_parse_assignment("echo hello", &pos()).is_none());
    }

    #[test]
    fn tuple_unpack_assignment() {
        let a = try_parse_assignment("(a, b): (1, 2)", &pos()).unwrap().unwrap();
        match a.target {
            AssignTarget::Unpack(pats) => {
                assert_eq!(pats.len(), 2);
                assert!(matches!(&pats[0], UnpackPattern::Positional(n) if n == "a"));
            }
            _ => panic!("expected unpack"),
        }
        assert_eq!(a.value_text, "(1, 2)");
    }

    #[test]
    fn named_unpack_with_alias() {
        let a = try_parse_assignment("(k1:, k2: alias): expr", &pos()).unwrap().unwrap();
        match a.target {
            AssignTarget::Unpack(pats) => {
                assert!(matches!(&pats[0], UnpackPattern::Named { key, alias: None } if key == "k1"));
                assert!(matches!(&pats[1], UnpackPattern::Named { key, alias: Some(a) } if key == "k2" && a == "alias"));
            }
            _ => panic!("expected unpack"),
        }
    }

    #[test]
    fn paren_without_colon_is_not_assignment() {
        assert!(try_parse_assignment("(echo hi)", &pos()).is_none());
    }
}
