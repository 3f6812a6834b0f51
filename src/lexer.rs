//! Tokenization for tether
//!
//! Two layers live here:
//! - source passes over a whole script (comment stripping, keyword
//!   normalization) that keep byte offsets stable so positions stay valid
//! - the argument lexer, which turns the text after a command name into
//!   lexemes that the parser types into values

use crate::ast::ObjectRef;
use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, take_until},
    character::complete::{anychar, char, multispace0, none_of},
    combinator::{map, map_opt, opt},
    sequence::{delimited, preceded},
    IResult,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Bare word, backslash escapes applied
    Word(String),
    /// A double-quoted string, escapes applied
    DoubleQuoted(String),
    /// A single-quoted string, escapes applied
    SingleQuoted(String),
    /// Parenthesized block contents
    Block(String),
    /// Unevaluated brace text, kept verbatim
    Brace(String),
    /// Whole object marker
    Marker(ObjectRef),
    /// Top-level argument separator
    Comma,
}

/// A token plus whether whitespace preceded it
#[derive(Debug, Clone, PartialEq)]
pub struct Lexeme {
    pub token: Token,
    pub spaced: bool,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexError {
    #[error("unclosed quote: missing closing {quote}")]
    UnterminatedString { quote: char, offset: usize },
    #[error("unclosed '{open}'")]
    UnterminatedGroup { open: char, offset: usize },
    #[error("unclosed block comment: missing closing )#")]
    UnterminatedComment { offset: usize },
    #[error("unexpected '{close}'")]
    UnexpectedClose { close: char, offset: usize },
    #[error("unexpected character: {ch:?}")]
    UnexpectedChar { ch: char, offset: usize },
}

impl LexError {
    pub fn offset(&self) -> usize {
        match self {
            LexError::UnterminatedString { offset, .. }
            | LexError::UnterminatedGroup { offset, .. }
            | LexError::UnterminatedComment { offset }
            | LexError::UnexpectedClose { offset, .. }
            | LexError::UnexpectedChar { offset, .. } => *offset,
        }
    }
}

/// Quote and group tracker shared by every top-level scanner
#[derive(Debug, Default, Clone)]
pub struct Nesting {
    quote: Option<char>,
    depth: usize,
    escaped: bool,
}

impl Nesting {
    /// Outside any quote or group, and not right after a backslash
    pub fn at_top(&self) -> bool {
        self.quote.is_none() && self.depth == 0 && !self.escaped
    }

    pub fn in_quote(&self) -> Option<char> {
        self.quote
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn feed(&mut self, c: char) {
        if self.escaped {
            self.escaped = false;
            return;
        }
        if c == '\\' {
            self.escaped = true;
            return;
        }
        if let Some(q) = self.quote {
            if c == q {
                self.quote = None;
            }
            return;
        }
        match c {
            '"' | '\'' => self.quote = Some(c),
            '(' | '{' => self.depth += 1,
            ')' | '}' => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
    }
}

/// Verify quotes and groups are closed, reporting the opening offset
pub fn check_balanced(text: &str) -> Result<(), LexError> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut quote: Option<(char, usize)> = None;
    let mut chars = text.char_indices();
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            chars.next();
            continue;
        }
        if let Some((q, _)) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some((c, i)),
            '(' | '{' => stack.push((c, i)),
            ')' | '}' => {
                let open = if c == ')' { '(' } else { '{' };
                match stack.pop() {
                    Some((o, _)) if o == open => {}
                    _ => return Err(LexError::UnexpectedClose { close: c, offset: i }),
                }
            }
            _ => {}
        }
    }
    if let Some((q, offset)) = quote {
        return Err(LexError::UnterminatedString { quote: q, offset });
    }
    if let Some((open, offset)) = stack.pop() {
        return Err(LexError::UnterminatedGroup { open, offset });
    }
    Ok(())
}

/// Blank out comments without moving any other byte.
///
/// `#` starts a line comment at the beginning of input or after whitespace
/// when followed by whitespace or end of line; `#( ... )#` is a block
/// comment. `#name` is left alone. A block comment missing its `)#` is an
/// error.
pub fn strip_comments(input: &str) -> Result<String, LexError> {
    let bytes: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut quote: Option<char> = None;
    let mut i = 0;

    let blank = |out: &mut String, c: char| {
        if c == '\n' {
            out.push('\n');
        } else {
            out.extend(std::iter::repeat(' ').take(c.len_utf8()));
        }
    };

    while i < bytes.len() {
        let c = bytes[i];
        if c == '\\' && i + 1 < bytes.len() {
            out.push(c);
            out.push(bytes[i + 1]);
            i += 2;
            continue;
        }
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            out.push(c);
            i += 1;
            continue;
        }
        if c == '"' || c == '\'' {
            quote = Some(c);
            out.push(c);
            i += 1;
            continue;
        }
        let after_space = i == 0 || bytes[i - 1].is_whitespace();
        if c == '#' && after_space {
            if bytes.get(i + 1) == Some(&'(') {
                let mut j = i + 2;
                while j < bytes.len() && !(bytes[j] == ')' && bytes.get(j + 1) == Some(&'#')) {
                    j += 1;
                }
                if j >= bytes.len() {
                    let offset = bytes[..i].iter().map(|c| c.len_utf8()).sum();
                    return Err(LexError::UnterminatedComment { offset });
                }
                let end = j + 2;
                for &skipped in &bytes[i..end] {
                    blank(&mut out, skipped);
                }
                i = end;
                continue;
            }
            let next = bytes.get(i + 1);
            if next.map_or(true, |n| n.is_whitespace()) {
                while i < bytes.len() && bytes[i] != '\n' {
                    blank(&mut out, bytes[i]);
                    i += 1;
                }
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    Ok(out)
}

/// Rewrite bare top-level `then`/`else` to `&`/`|`, padded to keep offsets
pub fn normalize_keywords(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut nesting = Nesting::default();
    let mut rest = input;
    let mut prev: Option<char> = None;

    while let Some(c) = rest.chars().next() {
        let boundary_before = prev.map_or(true, |p| p.is_whitespace());
        if nesting.at_top() && boundary_before {
            let keyword = ["then", "else"].into_iter().find(|kw| {
                rest.starts_with(kw)
                    && rest[kw.len()..]
                        .chars()
                        .next()
                        .map_or(true, |n| n.is_whitespace())
            });
            if let Some(kw) = keyword {
                out.push(if kw == "then" { '&' } else { '|' });
                out.push_str("   ");
                rest = &rest[kw.len()..];
                prev = Some(' ');
                continue;
            }
        }
        nesting.feed(c);
        out.push(c);
        prev = Some(c);
        rest = &rest[c.len_utf8()..];
    }
    out
}

/// 1-based line and column of a byte offset
pub fn line_col(text: &str, offset: usize) -> (usize, usize) {
    let before = &text[..offset.min(text.len())];
    let line = before.matches('\n').count() + 1;
    let column = before
        .rfind('\n')
        .map_or(before.chars().count(), |nl| before[nl + 1..].chars().count())
        + 1;
    (line, column)
}

/// Split at the first top-level whitespace: (name, rest)
pub fn split_command(text: &str) -> (&str, &str) {
    let text = text.trim();
    let mut nesting = Nesting::default();
    for (i, c) in text.char_indices() {
        if nesting.at_top() && c.is_whitespace() {
            return (&text[..i], text[i..].trim_start());
        }
        nesting.feed(c);
    }
    (text, "")
}

/// Split on a top-level character, keeping quotes and groups intact
pub fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut nesting = Nesting::default();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if nesting.at_top() && c == sep {
            parts.push(&text[start..i]);
            start = i + c.len_utf8();
            continue;
        }
        nesting.feed(c);
    }
    parts.push(&text[start..]);
    parts
}

fn unescape_char(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '0' => '\0',
        other => other,
    }
}

fn double_quoted(input: &str) -> IResult<&str, Token> {
    map(
        delimited(
            char('"'),
            opt(escaped_transform(
                none_of("\"\\"),
                '\\',
                map(anychar, unescape_char),
            )),
            char('"'),
        ),
        |s| Token::DoubleQuoted(s.unwrap_or_default()),
    )(input)
}

fn single_quoted(input: &str) -> IResult<&str, Token> {
    map(
        delimited(
            char('\''),
            opt(escaped_transform(
                none_of("'\\"),
                '\\',
                map(anychar, unescape_char),
            )),
            char('\''),
        ),
        |s| Token::SingleQuoted(s.unwrap_or_default()),
    )(input)
}

/// Contents of a balanced group opened by `open`
fn balanced(open: char, close: char) -> impl Fn(&str) -> IResult<&str, &str> {
    move |input: &str| {
        let (rest, _) = char(open)(input)?;
        let mut nesting = Nesting::default();
        for (i, c) in rest.char_indices() {
            if nesting.at_top() && c == close {
                return Ok((&rest[i + c.len_utf8()..], &rest[..i]));
            }
            nesting.feed(c);
        }
        Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Char,
        )))
    }
}

fn block(input: &str) -> IResult<&str, Token> {
    map(balanced('(', ')'), |s: &str| Token::Block(s.to_string()))(input)
}

fn brace(input: &str) -> IResult<&str, Token> {
    map(
        preceded(opt(char('$')), balanced('{', '}')),
        |s: &str| Token::Brace(s.to_string()),
    )(input)
}

fn marker(input: &str) -> IResult<&str, Token> {
    map_opt(
        delimited(char('\0'), take_until("\0"), char('\0')),
        |inner: &str| ObjectRef::parse_marker(&format!("\0{}\0", inner)).map(Token::Marker),
    )(input)
}

fn comma(input: &str) -> IResult<&str, Token> {
    map(char(','), |_| Token::Comma)(input)
}

/// Bare word; a backslash keeps the next character literal
fn word(input: &str) -> IResult<&str, Token> {
    let mut text = String::new();
    let mut chars = input.char_indices().peekable();
    let mut end = 0;
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some((j, escaped)) => {
                    text.push(escaped);
                    end = j + escaped.len_utf8();
                }
                None => {
                    text.push(c);
                    end = i + 1;
                }
            }
            continue;
        }
        if c.is_whitespace() || ",\"'(){}\0".contains(c) {
            break;
        }
        text.push(c);
        end = i + c.len_utf8();
    }
    if end == 0 {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::TakeWhile1,
        )));
    }
    Ok((&input[end..], Token::Word(text)))
}

fn token(input: &str) -> IResult<&str, Token> {
    alt((comma, double_quoted, single_quoted, block, brace, marker, word))(input)
}

/// Lex argument text into lexemes
pub fn lex(input: &str) -> Result<Vec<Lexeme>, LexError> {
    let mut lexemes = Vec::new();
    let mut rest = input;
    loop {
        let (after_ws, ws) = multispace0::<&str, nom::error::Error<&str>>(rest)
            .unwrap_or((rest, ""));
        if after_ws.is_empty() {
            break;
        }
        let offset = input.len() - after_ws.len();
        match token(after_ws) {
            Ok((remaining, token)) => {
                lexemes.push(Lexeme {
                    token,
                    spaced: !ws.is_empty(),
                });
                rest = remaining;
            }
            Err(_) => {
                check_balanced(after_ws).map_err(|e| shift(e, offset))?;
                let ch = after_ws.chars().next().unwrap_or(' ');
                return Err(LexError::UnexpectedChar { ch, offset });
            }
        }
    }
    Ok(lexemes)
}

fn shift(err: LexError, by: usize) -> LexError {
    match err {
        LexError::UnterminatedString { quote, offset } => LexError::UnterminatedString {
            quote,
            offset: offset + by,
        },
        LexError::UnterminatedGroup { open, offset } => LexError::UnterminatedGroup {
            open,
            offset: offset + by,
        },
        LexError::UnterminatedComment { offset } => LexError::UnterminatedComment { offset: offset + by },
        LexError::UnexpectedClose { close, offset } => LexError::UnexpectedClose {
            close,
            offset: offset + by,
        },
        LexError::UnexpectedChar { ch, offset } => LexError::UnexpectedChar {
            ch,
            offset: offset + by,
        },
    }
}

/// Leading identifier of `text` (letters, digits, `_`), if any
pub fn identifier(text: &str) -> Option<&str> {
    let end = text
        .char_indices()
        .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
        .map_or(text.len(), |(i, _)| i);
    (end > 0).then(|| &text[..end])
}

/// True when a bare name could be a variable or command name
pub fn is_identifier(text: &str) -> bool {
    identifier(text) == Some(text)
}

/// Strip a `name:` prefix used for named arguments and assignments
pub fn named_prefix(text: &str) -> Option<(&str, &str)> {
    let (key, rest) = text.split_once(':')?;
    if key.is_empty() || !(rest.is_empty() || rest.starts_with(char::is_whitespace)) {
        return None;
    }
    let valid = key
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '#' || c == '-');
    valid.then(|| (key, rest.trim_start()))
}

/// Unquoted text between matching delimiters, used by the REPL to decide
/// whether a line needs continuation
pub fn is_incomplete(text: &str) -> bool {
    let balanced = strip_comments(text).and_then(|stripped| check_balanced(&stripped));
    matches!(
        balanced,
        Err(LexError::UnterminatedString { .. })
            | Err(LexError::UnterminatedGroup { .. })
            | Err(LexError::UnterminatedComment { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ObjectKind;

    fn tokens(input: &str) -> Vec<Token> {
        lex(input).unwrap().into_iter().map(|l| l.token).collect()
    }

    #[test]
    fn tokenize_words_and_commas() {
        assert_eq!(
            tokens("a, b c"),
            vec![
                Token::Word("a".into()),
                Token::Comma,
                Token::Word("b".into()),
                Token::Word("c".into()),
            ]
        );
    }

    #[test]
    fn tokenize_quoted_strings() {
        assert_eq!(
            tokens(r#""hello\n\"x\"" 'single'"#),
            vec![
                Token::DoubleQuoted("hello\n\"x\"".into()),
                Token::SingleQuoted("single".into()),
            ]
        );
        assert_eq!(tokens(r#""""#), vec![Token::DoubleQuoted(String::new())]);
    }

    #[test]
    fn tokenize_nested_block() {
        assert_eq!(
            tokens("(echo (a, b); \")\")"),
            vec![Token::Block("echo (a, b); \")\"".into())]
        );
    }

    #[test]
    fn tokenize_marker() {
        let r = ObjectRef::new(ObjectKind::List, 7);
        assert_eq!(tokens(&r.to_marker()), vec![Token::Marker(r)]);
    }

    #[test]
    fn tokenize_escaped_word() {
        assert_eq!(tokens(r"a\,b"), vec![Token::Word("a,b".into())]);
    }

    #[test]
    fn lex_reports_unclosed_quote() {
        let err = lex("a, \"oops").unwrap_err();
        assert_eq!(err, LexError::UnterminatedString { quote: '"', offset: 3 });
    }

    #[test]
    fn strip_comments_keeps_offsets() {
        let src = "echo hi # note\necho #tag";
        let out = strip_comments(src).unwrap();
        assert_eq!(out.len(), src.len());
        assert_eq!(out, "echo hi       \necho #tag");
    }

    #[test]
    fn strip_block_comment() {
        assert_eq!(strip_comments("a #( x\ny )# b").unwrap(), "a     \n     b");
        assert_eq!(strip_comments("\"# not\" # yes").unwrap(), "\"# not\"      ");
    }

    #[test]
    fn unclosed_block_comment_is_an_error() {
        assert_eq!(
            strip_comments("echo a; #( x\necho b"),
            Err(LexError::UnterminatedComment { offset: 8 })
        );
        assert!(is_incomplete("echo a #( still open"));
    }

    #[test]
    fn normalize_then_else() {
        assert_eq!(normalize_keywords("true then echo a else echo b"), "true &    echo a |    echo b");
        assert_eq!(normalize_keywords("echo \"then\" (then)"), "echo \"then\" (then)");
        assert_eq!(normalize_keywords("athen"), "athen");
    }

    #[test]
    fn balanced_check() {
        assert!(check_balanced("(a {b} \"c)\")").is_ok());
        assert_eq!(
            check_balanced("echo (a"),
            Err(LexError::UnterminatedGroup { open: '(', offset: 5 })
        );
        assert_eq!(
            check_balanced("a)"),
            Err(LexError::UnexpectedClose { close: ')', offset: 1 })
        );
    }

    #[test]
    fn split_helpers() {
        assert_eq!(split_command("  echo  a, b "), ("echo", "a, b"));
        assert_eq!(split_command("(x y) 1"), ("(x y)", "1"));
        assert_eq!(split_top_level("a; (b; c); \"d;\"", ';'), vec!["a", " (b; c)", " \"d;\""]);
    }

    #[test]
    fn line_col_counts() {
        assert_eq!(line_col("ab\ncd", 4), (2, 2));
        assert_eq!(line_col("ab", 0), (1, 1));
    }

    #[test]
    fn named_prefix_rules() {
        assert_eq!(named_prefix("x: 5"), Some(("x", "5")));
        assert_eq!(named_prefix("mod::item"), None);
        assert_eq!(named_prefix("a b: 1"), None);
    }
}
