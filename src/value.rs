//! Data model: `Value`, object kinds, and the marker encoding used to
//! embed object references inside plain text (§3, §4.3).

use std::fmt;
use indexmap::IndexMap;

use crate::object_store::ObjectId;

/// The kind tag stored alongside every `StoredObject`, and the textual
/// tag used in marker encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    List,
    Bytes,
    Struct,
    Macro,
    Block,
    Channel,
    File,
}

impl ObjectKind {
    pub fn marker_tag(self) -> &'static str {
        match self {
            ObjectKind::List => "list",
            ObjectKind::Bytes => "bytes",
            ObjectKind::Struct => "struct",
            ObjectKind::Macro => "macro",
            ObjectKind::Block => "block",
            ObjectKind::Channel => "channel",
            ObjectKind::File => "file",
        }
    }

    pub fn from_marker_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "list" => ObjectKind::List,
            "bytes" => ObjectKind::Bytes,
            "struct" => ObjectKind::Struct,
            "macro" => ObjectKind::Macro,
            "block" => ObjectKind::Block,
            "channel" => ObjectKind::Channel,
            "file" => ObjectKind::File,
            _ => return None,
        })
    }
}

/// A value carried in variables, arguments, and the result slot.
///
/// Plain strings are value-copied; `Value::Object` denotes sharing through
/// the object store (C3) and is the only variant that participates in
/// refcounting.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    QuotedStr(String),
    Symbol(String),
    Object(ObjectId, ObjectKind),
    Nil,
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Nil => false,
            Value::Str(s) | Value::QuotedStr(s) | Value::Symbol(s) => !s.is_empty(),
            Value::Object(..) => true,
        }
    }

    /// Stringify for splicing into substituted command text. Object
    /// references stringify to their marker form so identity survives the
    /// round-trip through text, per `spec.md` §4.4.
    pub fn stringify(&self) -> String {
        match self {
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{:.1}", f)
                } else {
                    f.to_string()
                }
            }
            Value::Bool(b) => b.to_string(),
            Value::Str(s) | Value::QuotedStr(s) | Value::Symbol(s) => s.clone(),
            Value::Object(id, kind) => encode_marker(*kind, *id),
            Value::Nil => String::new(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stringify())
    }
}

/// An ordered list item store: positional items plus an insertion-ordered
/// named map, matching `spec.md`'s "two parallel indexes share one
/// StoredObject" description of list values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListData {
    pub items: Vec<Value>,
    pub named: IndexMap<String, Value>,
}

impl ListData {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructData {
    pub definition_id: Option<ObjectId>,
    pub bytes: Vec<u8>,
    pub array_count: Option<usize>,
}

/// The marker byte format: `NUL TYPE ':' ID NUL`, so object references
/// embedded in substituted strings can be spliced into textual command
/// streams without losing identity (`spec.md` §3 `MarkerEncoding`).
pub fn encode_marker(kind: ObjectKind, id: ObjectId) -> String {
    format!("\u{0}{}:{}\u{0}", kind.marker_tag(), id.get())
}

/// Decode a marker at the *start* of `text`, returning the kind, id, and
/// the byte length of the consumed marker. Markers are opaque: callers
/// must never parse their interior themselves (Invariant 6).
pub fn decode_marker(text: &str) -> Option<(ObjectKind, ObjectId, usize)> {
    let bytes = text.as_bytes();
    if bytes.first() != Some(&0) {
        return None;
    }
    let rest = &text[1..];
    let end = rest.find('\u{0}')?;
    let body = &rest[..end];
    let mut parts = body.splitn(2, ':');
    let tag = parts.next()?;
    let id_str = parts.next()?;
    let kind = ObjectKind::from_marker_tag(tag)?;
    let id = id_str.parse::<u64>().ok()?;
    let id = ObjectId::new(id)?;
    Some((kind, id, 1 + end + 1))
}

/// Find the first marker anywhere in `text`; returns `(start_byte, kind,
/// id, total_len)`.
pub fn find_marker(text: &str) -> Option<(usize, ObjectKind, ObjectId, usize)> {
    let start = text.find('\u{0}')?;
    let (kind, id, len) = decode_marker(&text[start..])?;
    Some((start, kind, id, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_round_trips() {
        let id = ObjectId::new(42).unwrap();
        let marker = encode_marker(ObjectKind::List, id);
        let (kind, decoded_id, len) = decode_marker(&marker).unwrap();
        assert_eq!(kind, ObjectKind::List);
        assert_eq!(decoded_id, id);
        assert_eq!(len, marker.len());
    }

    #[test]
    fn find_marker_inside_text() {
        let id = ObjectId::new(7).unwrap();
        let marker = encode_marker(ObjectKind::Macro, id);
        let text = format!("prefix {} suffix", marker);
        let (start, kind, decoded_id, len) = find_marker(&text).unwrap();
        assert_eq!(&text[start..start + len], marker);
        assert_eq!(kind, ObjectKind::Macro);
        assert_eq!(decoded_id, id);
    }

    #[test]
    fn stringify_bool_and_int() {
        assert_eq!(Value::Bool(true).stringify(), "true");
        assert_eq!(Value::Int(7).stringify(), "7");
    }
}
