//! Parser for tether
//!
//! Source text becomes a flat list of [`ParsedCommand`]s, each still held as
//! text: braces and macro arguments are substituted right before dispatch,
//! so typing arguments has to wait until then. [`parse_command`] does that
//! second step, turning one substituted command into a name plus typed
//! positional and named arguments.

use crate::ast::{ObjectRef, ParsedCommand, Position, Separator, Value};
use crate::lexer::{self, LexError, Lexeme, Nesting, Token};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("{position}: {source}")]
    Lex {
        source: LexError,
        position: Position,
        context: String,
    },
    #[error("{position}: {message}")]
    Syntax {
        message: String,
        position: Position,
        context: String,
    },
}

impl ParseError {
    fn at(text: &str, offset: usize, make: impl FnOnce(Position, String) -> ParseError) -> Self {
        let (line, column) = lexer::line_col(text, offset);
        let context = text.lines().nth(line - 1).unwrap_or_default().to_string();
        make(Position::new(line, column, offset), context)
    }

    pub fn position(&self) -> Position {
        match self {
            ParseError::Lex { position, .. } | ParseError::Syntax { position, .. } => *position,
        }
    }

    pub fn context(&self) -> &str {
        match self {
            ParseError::Lex { context, .. } | ParseError::Syntax { context, .. } => context,
        }
    }

    /// Message, offending line and a caret under the column
    pub fn render(&self) -> String {
        let caret = " ".repeat(self.position().column.saturating_sub(1));
        format!("{}\n  {}\n  {}^", self, self.context(), caret)
    }
}

/// How a command was joined to the previous one by a chain operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chain {
    None,
    /// `~>`: previous result becomes the first argument
    Prepend,
    /// `~~>`: previous result becomes the last argument
    Append,
    /// `=>`: previous result is assigned to the named variable
    Assign,
}

struct Pending {
    text: String,
    separator: Separator,
    chain: Chain,
    offset: usize,
}

/// Parser state over one source text
pub struct Parser<'a> {
    original: &'a str,
}

impl<'a> Parser<'a> {
    pub fn new(original: &'a str) -> Self {
        Parser { original }
    }

    /// Split the source into commands with separators and positions
    pub fn parse(&self) -> Result<Vec<ParsedCommand>, ParseError> {
        let source = lexer::strip_comments(self.original)
            .map(|stripped| lexer::normalize_keywords(&stripped))
            .and_then(|source| lexer::check_balanced(&source).map(|()| source))
            .map_err(|err| {
                ParseError::at(self.original, err.offset(), |position, context| {
                    ParseError::Lex {
                        source: err,
                        position,
                        context,
                    }
                })
            })?;

        let mut pending: Vec<Pending> = Vec::new();
        let mut current = String::new();
        let mut start: Option<usize> = None;
        let mut separator = Separator::None;
        let mut chain = Chain::None;
        let mut nesting = Nesting::default();

        let src = source.as_str();
        let mut iter = src.char_indices().peekable();

        let mut flush = |current: &mut String,
                         start: &mut Option<usize>,
                         separator: Separator,
                         chain: &mut Chain| {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                pending.push(Pending {
                    text: trimmed.to_string(),
                    separator,
                    chain: *chain,
                    offset: start.unwrap_or(0),
                });
                *chain = Chain::None;
            }
            current.clear();
            *start = None;
        };

        while let Some((i, c)) = iter.next() {
            if nesting.at_top() {
                let rest = &src[i..];
                let op = if rest.starts_with("~~>") {
                    Some((Separator::None, Some(Chain::Append), 3))
                } else if rest.starts_with("~>") {
                    Some((Separator::None, Some(Chain::Prepend), 2))
                } else if rest.starts_with("=>") {
                    Some((Separator::None, Some(Chain::Assign), 2))
                } else {
                    match c {
                        ';' => Some((Separator::None, None, 1)),
                        '&' => Some((Separator::AndThen, None, 1)),
                        '|' => Some((Separator::OrElse, None, 1)),
                        '\n' if !current.trim().is_empty() => Some((Separator::None, None, 1)),
                        _ => None,
                    }
                };
                if let Some((next_separator, next_chain, width)) = op {
                    flush(&mut current, &mut start, separator, &mut chain);
                    separator = next_separator;
                    if let Some(next_chain) = next_chain {
                        chain = next_chain;
                    }
                    for _ in 1..width {
                        iter.next();
                    }
                    continue;
                }
            }
            if start.is_none() && !c.is_whitespace() {
                start = Some(i);
            }
            nesting.feed(c);
            current.push(c);
        }
        flush(&mut current, &mut start, separator, &mut chain);

        let mut commands = Vec::with_capacity(pending.len());
        for p in pending {
            let (line, column) = lexer::line_col(self.original, p.offset);
            let position = Position::new(line, column, p.offset);
            let text = self.apply_chain(p.text, p.chain, p.offset)?;
            commands.push(ParsedCommand::new(text, p.separator, position));
        }
        debug!(target: "tether::parse", "parsed {} command(s)", commands.len());
        Ok(commands)
    }

    fn apply_chain(&self, text: String, chain: Chain, offset: usize) -> Result<String, ParseError> {
        Ok(match chain {
            Chain::None => text,
            Chain::Prepend => match lexer::split_command(&text) {
                (name, "") => format!("{} {{get_result}}", name),
                (name, args) => format!("{} {{get_result}}, {}", name, args),
            },
            Chain::Append => match lexer::split_command(&text) {
                (name, "") => format!("{} {{get_result}}", name),
                (name, args) => format!("{} {}, {{get_result}}", name, args),
            },
            Chain::Assign => {
                if !lexer::is_identifier(&text) {
                    return Err(ParseError::at(self.original, offset, |position, context| {
                        ParseError::Syntax {
                            message: format!("invalid variable name after =>: '{}'", text),
                            position,
                            context,
                        }
                    }));
                }
                format!("{}: {{get_result}}", text)
            }
        })
    }
}

/// Parse a whole source text into commands
pub fn parse_sequence(text: &str) -> Result<Vec<ParsedCommand>, ParseError> {
    Parser::new(text).parse()
}

/// A substituted command split into name and typed arguments
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandParts {
    pub name: String,
    pub args: Vec<Value>,
    pub named: BTreeMap<String, Value>,
    /// Argument text before typing, for diagnostics
    pub raw_args: Vec<String>,
}

/// Type a single bare word
pub fn type_word(word: &str) -> Value {
    match word {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "nil" => return Value::Nil,
        _ => {}
    }
    let numeric_start = word
        .trim_start_matches(['-', '+'])
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_digit() || c == '.');
    if numeric_start {
        if let Ok(n) = word.parse::<i64>() {
            return Value::Int(n);
        }
        if let Ok(n) = word.parse::<f64>() {
            if n.is_finite() {
                return Value::Float(n);
            }
        }
    }
    Value::Symbol(word.to_string())
}

fn token_value(token: &Token) -> Value {
    match token {
        Token::Word(w) => type_word(w),
        Token::DoubleQuoted(s) | Token::SingleQuoted(s) => Value::Quoted(s.clone()),
        Token::Block(s) => Value::Block(s.clone()),
        Token::Brace(s) => Value::Symbol(format!("{{{}}}", s)),
        Token::Marker(r) => Value::Ref(*r),
        Token::Comma => Value::Nil,
    }
}

fn token_text(token: &Token) -> String {
    match token {
        Token::Word(s) | Token::DoubleQuoted(s) | Token::SingleQuoted(s) => s.clone(),
        Token::Block(s) => format!("({})", s),
        Token::Brace(s) => format!("{{{}}}", s),
        Token::Marker(r) => r.to_marker(),
        Token::Comma => ",".to_string(),
    }
}

/// Adjacent units without a comma combine into one argument: bare words
/// stay a symbol, anything quoted makes the whole a string
fn combine(lexemes: &[Lexeme]) -> Value {
    match lexemes {
        [] => Value::Nil,
        [single] => token_value(&single.token),
        many => {
            let mut text = String::new();
            let mut all_words = true;
            for (i, lexeme) in many.iter().enumerate() {
                if i > 0 && lexeme.spaced {
                    text.push(' ');
                }
                all_words &= matches!(lexeme.token, Token::Word(_));
                text.push_str(&token_text(&lexeme.token));
            }
            if all_words {
                Value::Symbol(text)
            } else {
                Value::Quoted(text)
            }
        }
    }
}

/// Parse the argument text that follows a command name
pub fn parse_arguments(text: &str) -> Result<(Vec<Value>, BTreeMap<String, Value>), LexError> {
    let lexemes = lexer::lex(text)?;
    let mut args = Vec::new();
    let mut named = BTreeMap::new();

    for group in lexemes.split(|l| l.token == Token::Comma) {
        if group.is_empty() {
            continue;
        }
        let key = match &group[0].token {
            Token::Word(w) if w.len() > 1 && w.ends_with(':') && !w.ends_with("::") => {
                Some(w[..w.len() - 1].to_string())
            }
            _ => None,
        };
        match key {
            Some(key) => {
                named.insert(key, combine(&group[1..]));
            }
            None => args.push(combine(group)),
        }
    }
    Ok((args, named))
}

/// Parse one substituted command into name and typed arguments
pub fn parse_command(text: &str) -> Result<CommandParts, LexError> {
    let (name, rest) = lexer::split_command(text);
    if rest.is_empty() {
        return Ok(CommandParts {
            name: name.to_string(),
            ..CommandParts::default()
        });
    }
    let (args, named) = parse_arguments(rest)?;
    let raw_args = lexer::split_top_level(rest, ',')
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    Ok(CommandParts {
        name: name.to_string(),
        args,
        named,
        raw_args,
    })
}

/// Type a standalone value text the way an argument would be typed
pub fn parse_value(text: &str) -> Value {
    let text = text.trim();
    if let Some(r) = ObjectRef::parse_marker(text) {
        return Value::Ref(r);
    }
    match lexer::lex(text) {
        Ok(lexemes) if !lexemes.iter().any(|l| l.token == Token::Comma) => combine(&lexemes),
        _ => Value::Symbol(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands(text: &str) -> Vec<(String, Separator)> {
        parse_sequence(text)
            .unwrap()
            .into_iter()
            .map(|c| (c.command, c.separator))
            .collect()
    }

    #[test]
    fn parse_separators() {
        assert_eq!(
            commands("a; b & c | d\ne"),
            vec![
                ("a".to_string(), Separator::None),
                ("b".to_string(), Separator::None),
                ("c".to_string(), Separator::AndThen),
                ("d".to_string(), Separator::OrElse),
                ("e".to_string(), Separator::None),
            ]
        );
    }

    #[test]
    fn parse_keywords_and_comments() {
        assert_eq!(
            commands("true then echo yes else echo no # trailing"),
            vec![
                ("true".to_string(), Separator::None),
                ("echo yes".to_string(), Separator::AndThen),
                ("echo no".to_string(), Separator::OrElse),
            ]
        );
    }

    #[test]
    fn parse_keeps_nested_separators() {
        assert_eq!(
            commands("while (x; y), (a & b); echo \"p; q\""),
            vec![
                ("while (x; y), (a & b)".to_string(), Separator::None),
                ("echo \"p; q\"".to_string(), Separator::None),
            ]
        );
    }

    #[test]
    fn parse_chain_operators() {
        assert_eq!(
            commands("list 1 ~> len"),
            vec![
                ("list 1".to_string(), Separator::None),
                ("len {get_result}".to_string(), Separator::None),
            ]
        );
        assert_eq!(commands("a ~> b x")[1].0, "b {get_result}, x");
        assert_eq!(commands("a ~~> b x")[1].0, "b x, {get_result}");
        assert_eq!(commands("a => v")[1].0, "v: {get_result}");
    }

    #[test]
    fn parse_fat_arrow_needs_identifier() {
        let err = parse_sequence("a => (x)").unwrap_err();
        assert!(err.to_string().contains("invalid variable name"));
    }

    #[test]
    fn parse_positions() {
        let cmds = parse_sequence("a\n  b").unwrap();
        assert_eq!(cmds[1].position.line, 2);
        assert_eq!(cmds[1].position.column, 3);
    }

    #[test]
    fn parse_unclosed_reports_position() {
        let err = parse_sequence("echo ok\necho (oops").unwrap_err();
        assert_eq!(err.position().line, 2);
        assert_eq!(err.position().column, 6);
        assert!(err.render().contains("echo (oops"));
    }

    #[test]
    fn parse_command_types_arguments() {
        let parts = parse_command("cmd 1, 2.5, \"s\", (blk), true, nil, sym, k: 3").unwrap();
        assert_eq!(parts.name, "cmd");
        assert_eq!(
            parts.args,
            vec![
                Value::Int(1),
                Value::Float(2.5),
                Value::quoted("s"),
                Value::Block("blk".into()),
                Value::Bool(true),
                Value::Nil,
                Value::symbol("sym"),
            ]
        );
        assert_eq!(parts.named.get("k"), Some(&Value::Int(3)));
        assert_eq!(parts.raw_args.len(), 8);
    }

    #[test]
    fn parse_command_combines_adjacent_units() {
        let parts = parse_command("echo hello world, \"a\" b").unwrap();
        assert_eq!(
            parts.args,
            vec![Value::symbol("hello world"), Value::quoted("a b")]
        );
    }

    #[test]
    fn parse_command_marker_argument() {
        let r = crate::ast::ObjectRef::new(crate::ast::ObjectKind::List, 3);
        let parts = parse_command(&format!("len {}", r.to_marker())).unwrap();
        assert_eq!(parts.args, vec![Value::Ref(r)]);
    }

    #[test]
    fn type_word_numbers() {
        assert_eq!(type_word("-4"), Value::Int(-4));
        assert_eq!(type_word("inf"), Value::symbol("inf"));
        assert_eq!(type_word("1.5e2"), Value::Float(150.0));
        assert_eq!(type_word("mod::x"), Value::symbol("mod::x"));
    }
}
