//! AST for tether - values and parsed commands
//!
//! The AST represents what the parser hands to the executor:
//! - `Value` is the typed form of a single argument
//! - `ObjectRef` is the tagged handle for anything living in the object store
//! - `ParsedCommand` is one command of a sequence, still as text, plus its
//!   flow-control separator and source position
//!
//! Object references only become marker text (`\x00KIND:ID\x00`) at the
//! substitution boundary; everywhere else they travel as `Value::Ref`.

use std::fmt;

/// Kind of an object-store entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    List,
    Str,
    Block,
    Channel,
    Fiber,
    Command,
    Macro,
    Token,
}

impl ObjectKind {
    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::List => "list",
            ObjectKind::Str => "string",
            ObjectKind::Block => "block",
            ObjectKind::Channel => "channel",
            ObjectKind::Fiber => "fiber",
            ObjectKind::Command => "command",
            ObjectKind::Macro => "macro",
            ObjectKind::Token => "token",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "list" => Some(ObjectKind::List),
            "string" | "str" => Some(ObjectKind::Str),
            "block" => Some(ObjectKind::Block),
            "channel" => Some(ObjectKind::Channel),
            "fiber" => Some(ObjectKind::Fiber),
            "command" => Some(ObjectKind::Command),
            "macro" => Some(ObjectKind::Macro),
            "token" => Some(ObjectKind::Token),
            _ => None,
        }
    }

    /// Opaque handles cannot be serialized; everything else can
    pub fn is_serializable(&self) -> bool {
        !matches!(
            self,
            ObjectKind::Channel | ObjectKind::Fiber | ObjectKind::Command | ObjectKind::Macro
        )
    }
}

/// Tagged reference to an object-store entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub id: u64,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, id: u64) -> Self {
        ObjectRef { kind, id }
    }

    /// Serialize to the reserved-byte text form used inside command text
    pub fn to_marker(&self) -> String {
        format!("\x00{}:{}\x00", self.kind.name().to_ascii_uppercase(), self.id)
    }

    /// Parse a whole string as a marker. Anything else (including a marker
    /// embedded in surrounding text) is not a reference.
    pub fn parse_marker(text: &str) -> Option<ObjectRef> {
        let inner = text.strip_prefix('\x00')?.strip_suffix('\x00')?;
        if inner.contains('\x00') {
            return None;
        }
        let (kind, id) = inner.split_once(':')?;
        let kind = ObjectKind::from_name(kind)?;
        let id = id.parse().ok()?;
        Some(ObjectRef { kind, id })
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.kind.name(), self.id)
    }
}

/// A typed argument value. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Bare identifier
    Symbol(String),
    /// Quoted string, escapes already processed
    Quoted(String),
    /// Parenthesized block: deferred, unexecuted text
    Block(String),
    /// By-reference value living in the object store
    Ref(ObjectRef),
}

impl Value {
    pub fn symbol(s: impl Into<String>) -> Self {
        Value::Symbol(s.into())
    }

    pub fn quoted(s: impl Into<String>) -> Self {
        Value::Quoted(s.into())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_ref(&self) -> Option<ObjectRef> {
        match self {
            Value::Ref(r) => Some(*r),
            _ => None,
        }
    }

    /// Plain text of a scalar value. References render as `<kind id>`;
    /// use the store to render their contents.
    pub fn as_text(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(n) => format_float(*n),
            Value::Symbol(s) | Value::Quoted(s) | Value::Block(s) => s.clone(),
            Value::Ref(r) => r.to_string(),
        }
    }

    /// Numeric view used by arithmetic and comparisons
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Symbol(s) | Value::Quoted(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(n) if n.fract() == 0.0 => Some(*n as i64),
            Value::Symbol(s) | Value::Quoted(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Truthiness used by loop conditions and `not`
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::Symbol(s) => !(s.is_empty() || s == "false"),
            Value::Quoted(s) => !s.is_empty(),
            Value::Block(_) | Value::Ref(_) => true,
        }
    }

    /// Type name used for list type tracking and `arrtype`
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Symbol(_) => "symbol",
            Value::Quoted(_) => "string",
            Value::Block(_) => "block",
            Value::Ref(r) => r.kind.name(),
        }
    }
}

/// Format a float without a trailing `.0` for whole numbers
pub fn format_float(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Source position of a command (1-based line and column, byte offset)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

impl Position {
    pub fn new(line: usize, column: usize, offset: usize) -> Self {
        Position { line, column, offset }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Flow-control separator preceding a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    /// First command, `;` or newline
    None,
    /// `&` / `then`: run only if the previous status was true
    AndThen,
    /// `|` / `else`: run only if the previous status was false
    OrElse,
}

/// One parsed command of a sequence, kept as text until substitution
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    pub command: String,
    pub separator: Separator,
    pub position: Position,
}

impl ParsedCommand {
    pub fn new(command: impl Into<String>, separator: Separator, position: Position) -> Self {
        ParsedCommand {
            command: command.into(),
            separator,
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_round_trip() {
        let r = ObjectRef::new(ObjectKind::List, 42);
        assert_eq!(r.to_marker(), "\x00LIST:42\x00");
        assert_eq!(ObjectRef::parse_marker(&r.to_marker()), Some(r));
    }

    #[test]
    fn test_marker_rejects_embedded_text() {
        assert_eq!(ObjectRef::parse_marker("x\x00LIST:1\x00"), None);
        assert_eq!(ObjectRef::parse_marker("\x00LIST:1\x00 \x00LIST:2\x00"), None);
        assert_eq!(ObjectRef::parse_marker("\x00BOGUS:1\x00"), None);
        assert_eq!(ObjectRef::parse_marker("\x00LIST:x\x00"), None);
    }

    #[test]
    fn test_value_as_text() {
        assert_eq!(Value::Int(3).as_text(), "3");
        assert_eq!(Value::Float(2.0).as_text(), "2");
        assert_eq!(Value::Float(2.5).as_text(), "2.5");
        assert_eq!(Value::Nil.as_text(), "nil");
        assert_eq!(Value::quoted("hi").as_text(), "hi");
    }

    #[test]
    fn test_value_numbers() {
        assert_eq!(Value::symbol("12").as_number(), Some(12.0));
        assert_eq!(Value::Block("1".into()).as_number(), None);
        assert_eq!(Value::Float(4.0).as_int(), Some(4));
    }

    #[test]
    fn test_serializable_kinds() {
        assert!(ObjectKind::List.is_serializable());
        assert!(ObjectKind::Token.is_serializable());
        assert!(!ObjectKind::Macro.is_serializable());
        assert!(!ObjectKind::Channel.is_serializable());
    }
}
