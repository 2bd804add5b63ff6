//! Lexer (C2, part 1).
//!
//! Grounded on the teacher's `parser/lexer.rs`: a single pass over the
//! (already comment-stripped) text producing a flat token stream with
//! source positions. Unlike bash, PawScript words are comma-delimited
//! inside a command rather than whitespace-delimited, so the lexer here
//! only needs to find *command* boundaries (the separators `;`, `&`, `|`,
//! and newline) while tracking quote/paren/brace depth; argument-level
//! tokenization happens in `parser.rs`, matching the teacher's own split
//! between a coarse lexer and a more detailed word parser
//! (`parser/word_parser.rs`).

use crate::position::{SourceMap, SourcePosition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    /// Start of the stream, or the separator was a newline/`;`.
    None,
    Semi,
    Amp,
    Pipe,
}

/// One raw command's worth of text, with the separator that preceded it
/// and its source position (§3 `ParsedCommand.source position`,
/// partially — the parser refines this into the full `ParsedCommand`).
#[derive(Debug, Clone)]
pub struct RawCommand {
    pub text: String,
    pub separator: Separator,
    pub position: SourcePosition,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("parse error at {position}: {message}")]
pub struct LexError {
    pub message: String,
    pub position: SourcePosition,
}

/// Split `text` into top-level commands separated by `;`, `&`, `|`, or
/// newline. Separators inside single/double quotes, parens, or braces are
/// literal. A newline with a pending non-empty command acts like `;`. A
/// command beginning with `&` or `|` at top level is a parse error (no
/// implicit left operand) — `spec.md` §4.2 / §8 P2.
pub fn split_commands(text: &str, map: &SourceMap) -> Result<Vec<RawCommand>, LexError> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0usize;
    let mut start = 0usize;
    let mut paren_depth = 0i32;
    let mut brace_depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut pending_sep = Separator::None;
    let mut at_command_start = true;

    let push_command = |out: &mut Vec<RawCommand>, raw: &str, start: usize, sep: Separator, map: &SourceMap| {
        let trimmed_start = raw.len() - raw.trim_start().len();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return;
        }
        out.push(RawCommand {
            text: trimmed.to_string(),
            separator: sep,
            position: map.position_at(start + trimmed_start),
        });
    };

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
            b'\'' | b'"' => {
                quote = Some(c);
                at_command_start = false;
                i += 1;
            }
            b'(' => {
                paren_depth += 1;
                at_command_start = false;
                i += 1;
            }
            b')' => {
                paren_depth -= 1;
                i += 1;
            }
            b'{' => {
                brace_depth += 1;
                at_command_start = false;
                i += 1;
            }
            b'}' => {
                brace_depth -= 1;
                i += 1;
            }
            b';' if paren_depth == 0 && brace_depth == 0 => {
                push_command(&mut out, &text[start..i], start, pending_sep, map);
                start = i + 1;
                pending_sep = Separator::Semi;
                at_command_start = true;
                i += 1;
            }
            b'\n' if paren_depth == 0 && brace_depth == 0 => {
                push_command(&mut out, &text[start..i], start, pending_sep, map);
                start = i + 1;
                pending_sep = Separator::Semi;
                at_command_start = true;
                i += 1;
            }
            b'&' if paren_depth == 0 && brace_depth == 0 => {
                if at_command_start {
                    return Err(LexError {
                        message: "unexpected '&' with no preceding command".to_string(),
                        position: map.position_at(i),
                    });
                }
                push_command(&mut out, &text[start..i], start, pending_sep, map);
                start = i + 1;
                pending_sep = Separator::Amp;
                at_command_start = true;
                i += 1;
            }
            b'|' if paren_depth == 0 && brace_depth == 0 => {
                if at_command_start {
                    return Err(LexError {
                        message: "unexpected '|' with no preceding command".to_string(),
                        position: map.position_at(i),
                    });
                }
                push_command(&mut out, &text[start..i], start, pending_sep, map);
                start = i + 1;
                pending_sep = Separator::Pipe;
                at_command_start = true;
                i += 1;
            }
            _ => {
                if !(c as char).is_whitespace() {
                    at_command_start = false;
                }
                i += 1;
            }
        }
    }
    push_command(&mut out, &text[start..], start, pending_sep, map);

    if quote.is_some() {
        return Err(LexError {
            message: "unterminated quoted string".to_string(),
            position: map.position_at(bytes.len()),
        });
    }
    if brace_depth != 0 {
        return Err(LexError {
            message: "unclosed brace expression at end of input".to_string(),
            position: map.position_at(bytes.len()),
        });
    }
    if paren_depth != 0 {
        return Err(LexError {
            message: "unclosed parenthesis at end of input".to_string(),
            position: map.position_at(bytes.len()),
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::strip_comments;

    fn commands(src: &str) -> Vec<RawCommand> {
        let (stripped, map) = strip_comments(src, "t");
        split_commands(&stripped, &map).unwrap()
    }

    #[test]
    fn splits_on_semicolons() {
        let cmds = commands("a: 1 ; b: 2");
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].text, "a: 1");
        assert_eq!(cmds[1].separator, Separator::Semi);
    }

    #[test]
    fn newline_acts_like_semicolon() {
        let cmds = commands("echo 1\necho 2");
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[1].separator, Separator::Semi);
    }

    #[test]
    fn leading_amp_is_parse_error() {
        let (stripped, map) = strip_comments("& echo hi", "t");
        assert!(split_commands(&stripped, &map).is_err());
    }

    #[test]
    fn separators_inside_braces_are_literal() {
        let cmds = commands("echo { a; b | c }");
        assert_eq!(cmds.len(), 1);
    }

    #[test]
    fn conditional_and_or_split_correctly() {
        let cmds = commands("false & echo should-not-run | echo ran");
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[1].separator, Separator::Amp);
        assert_eq!(cmds[2].separator, Separator::Pipe);
    }
}
