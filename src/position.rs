//! Source positions & source maps (C1).
//!
//! Comment stripping runs once, before lexing, and produces a `SourceMap`
//! that lets every later component recover `(file, line, column, length)`
//! for a byte range in the *stripped* text. Nested brace evaluation
//! rebases its own source map against the position of the enclosing brace
//! so that errors inside `{ ... }` still report positions in the outermost
//! source file.

use std::fmt;
use std::sync::Arc;

/// An immutable source position: filename, line, column, length, and an
/// optional chain of macro invocations that led here (used for stack
/// traces in error messages).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePosition {
    pub file: Arc<str>,
    pub line: usize,
    pub column: usize,
    pub length: usize,
    pub macro_chain: Vec<Arc<str>>,
}

impl SourcePosition {
    pub fn new(file: impl Into<Arc<str>>, line: usize, column: usize, length: usize) -> Self {
        Self { file: file.into(), line, column, length, macro_chain: Vec::new() }
    }

    /// Synthetic position used when no real source text backs a value
    /// (e.g. a handler-constructed error).
    pub fn synthetic() -> Self {
        Self::new("<native>", 0, 0, 0)
    }

    pub fn with_macro_frame(mut self, name: impl Into<Arc<str>>) -> Self {
        self.macro_chain.push(name.into());
        self
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)?;
        for frame in self.macro_chain.iter().rev() {
            write!(f, " (in macro {})", frame)?;
        }
        Ok(())
    }
}

/// One entry in a `SourceMap`: the original position a byte offset in the
/// stripped text maps back to.
#[derive(Debug, Clone, Copy)]
struct MapEntry {
    /// Byte offset in the stripped text this entry starts at.
    stripped_offset: usize,
    orig_line: usize,
    orig_column: usize,
}

/// Maps byte offsets in comment-stripped text back to `(line, column)` in
/// the original source. Entries are sorted by `stripped_offset`; lookup is
/// a binary search for the last entry at or before the queried offset,
/// plus a same-line column adjustment.
#[derive(Debug, Clone)]
pub struct SourceMap {
    file: Arc<str>,
    entries: Vec<MapEntry>,
    /// Offset/line/column rebasing applied when this map belongs to a
    /// brace expression nested inside a parent source.
    rebase: Option<(usize, usize)>,
}

impl SourceMap {
    fn new(file: impl Into<Arc<str>>) -> Self {
        Self { file: file.into(), entries: Vec::new(), rebase: None }
    }

    /// Rebase every position this map produces by `(line_delta, col_delta)`,
    /// used when this map covers a nested brace expression's sub-script.
    pub fn rebase_for_brace(&mut self, at: &SourcePosition) {
        self.rebase = Some((at.line, at.column));
        self.file = at.file.clone();
    }

    pub fn position_at(&self, offset: usize) -> SourcePosition {
        let idx = match self.entries.binary_search_by_key(&offset, |e| e.stripped_offset) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        let (mut line, mut column) = if let Some(entry) = self.entries.get(idx) {
            let delta = offset.saturating_sub(entry.stripped_offset);
            (entry.orig_line, entry.orig_column + delta)
        } else {
            (1, offset + 1)
        };
        if let Some((rebase_line, rebase_col)) = self.rebase {
            if line == 1 {
                column += rebase_col.saturating_sub(1);
            }
            line += rebase_line.saturating_sub(1);
        }
        SourcePosition::new(self.file.clone(), line, column, 0)
    }
}

/// Strip comments from `source`, returning the cleaned text and a
/// `SourceMap` recovering original positions.
///
/// Recognised forms:
/// - line comments: `#` at line-start or preceded by whitespace, running to
///   end of line, themselves followed by whitespace or EOF;
/// - balanced block comments `#( ... )#` and `#{ ... }#`, which nest and
///   may contain double-quoted strings (skipped verbatim); single quotes
///   inside block comments are literal text, so contractions like `don't`
///   don't terminate anything.
pub fn strip_comments(source: &str, file: impl Into<Arc<str>>) -> (String, SourceMap) {
    let file = file.into();
    let mut map = SourceMap::new(file.clone());
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut i = 0usize;
    let mut line = 1usize;
    let mut column = 1usize;

    let mut last_was_ws_or_bol = true;

    while i < bytes.len() {
        let c = bytes[i] as char;

        // Block comment start: #( ... )# or #{ ... }#
        if c == '#' && (i + 1 < bytes.len()) && (bytes[i + 1] == b'(' || bytes[i + 1] == b'{') {
            let open = bytes[i + 1] as char;
            let close = if open == '(' { ')' } else { '}' };
            let start_i = i;
            let (consumed_lines, consumed_cols_on_last_line, new_i) =
                skip_block_comment(bytes, i, open, close);
            // Record no new output bytes; just advance position tracking.
            let _ = start_i;
            if consumed_lines > 0 {
                line += consumed_lines;
                column = consumed_cols_on_last_line + 1;
            } else {
                column += new_i - i;
            }
            i = new_i;
            last_was_ws_or_bol = true;
            continue;
        }

        // Line comment: '#' at BOL or preceded by whitespace, followed by
        // whitespace or EOF.
        if c == '#' && last_was_ws_or_bol {
            let next_ok = i + 1 >= bytes.len() || (bytes[i + 1] as char).is_whitespace();
            if next_ok {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                    column += 1;
                }
                continue;
            }
        }

        if c == '"' || c == '\'' {
            // Copy the quoted string verbatim (with escapes) so embedded
            // '#' never triggers comment detection inside quotes.
            let quote = c;
            let start_offset = out.len();
            map.entries.push(MapEntry { stripped_offset: start_offset, orig_line: line, orig_column: column });
            out.push(c);
            i += 1;
            column += 1;
            while i < bytes.len() {
                let ch = bytes[i] as char;
                out.push(ch);
                i += 1;
                if ch == '\\' && i < bytes.len() {
                    out.push(bytes[i] as char);
                    i += 1;
                    column += 2;
                    continue;
                }
                column += 1;
                if ch == '\n' {
                    line += 1;
                    column = 1;
                }
                if ch == quote {
                    break;
                }
            }
            last_was_ws_or_bol = false;
            continue;
        }

        let offset = out.len();
        map.entries.push(MapEntry { stripped_offset: offset, orig_line: line, orig_column: column });
        out.push(c);
        i += 1;
        if c == '\n' {
            line += 1;
            column = 1;
            last_was_ws_or_bol = true;
        } else {
            column += 1;
            last_was_ws_or_bol = c.is_whitespace();
        }
    }

    (out, map)
}

/// Skip a balanced `#( ... )#` / `#{ ... }#` block comment starting at
/// `start` (which must point at the leading `#`). Quote-aware: double
/// quotes inside the comment are skipped without their contents being
/// treated as comment delimiters; single quotes are literal text.
/// Returns `(newline_count, column_after_last_newline, new_index)`.
fn skip_block_comment(bytes: &[u8], start: usize, open: char, close: char) -> (usize, usize, usize) {
    let mut i = start + 2; // skip '#' and open
    let mut depth = 1usize;
    let mut newlines = 0usize;
    let mut col_after_last_nl = 0usize;

    while i < bytes.len() && depth > 0 {
        let c = bytes[i] as char;
        if c == '"' {
            i += 1;
            col_after_last_nl += 1;
            while i < bytes.len() {
                let ch = bytes[i] as char;
                i += 1;
                if ch == '\\' && i < bytes.len() {
                    i += 1;
                    col_after_last_nl += 2;
                    continue;
                }
                if ch == '\n' {
                    newlines += 1;
                    col_after_last_nl = 0;
                } else {
                    col_after_last_nl += 1;
                }
                if ch == '"' {
                    break;
                }
            }
            continue;
        }
        if c == '#' && i + 1 < bytes.len() && bytes[i + 1] as char == open {
            depth += 1;
            i += 2;
            col_after_last_nl += 2;
            continue;
        }
        if c == close && i + 1 < bytes.len() && bytes[i + 1] == b'#' {
            depth -= 1;
            i += 2;
            col_after_last_nl += 2;
            continue;
        }
        if c == '\n' {
            newlines += 1;
            col_after_last_nl = 0;
        } else {
            col_after_last_nl += 1;
        }
        i += 1;
    }

    (newlines, col_after_last_nl, i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_line_comment() {
        let (out, _) = strip_comments("echo hi # a comment\necho bye", "t");
        assert_eq!(out, "echo hi \necho bye");
    }

    #[test]
    fn keeps_hash_inside_quotes() {
        let (out, _) = strip_comments(r#"echo "a#b""#, "t");
        assert_eq!(out, r#"echo "a#b""#);
    }

    #[test]
    fn strips_nested_block_comment() {
        let (out, _) = strip_comments("a #( outer #( inner )# still )# b", "t");
        assert_eq!(out, "a  b");
    }

    #[test]
    fn block_comment_allows_contraction_quotes() {
        let (out, _) = strip_comments("a #( don't stop )# b", "t");
        assert_eq!(out, "a  b");
    }

    #[test]
    fn block_comment_skips_quoted_hash_paren() {
        let (out, _) = strip_comments(r#"a #( "weird )# inside" still )# b"#, "t");
        assert_eq!(out, "a  b");
    }

    #[test]
    fn position_round_trip() {
        let src = "x: 1\necho ~x";
        let (stripped, map) = strip_comments(src, "f.paw");
        let idx = stripped.find("echo").unwrap();
        let pos = map.position_at(idx);
        assert_eq!((pos.line, pos.column), (2, 1));
    }
}
