//! Text stages of substitution
//!
//! The executor drives substitution per command:
//! 1. protect `\$` and `\~`
//! 2. evaluate top-level brace expressions and splice their values back
//! 3. expand `$*`, `$@`, `$#`, `$N` when running under a macro frame
//! 4. restore `$`, interpolate `~name` inside double quotes, restore `~`
//!
//! Everything here is pure text work; brace evaluation itself lives in the
//! executor because it runs commands.

use crate::ast::Value;
use crate::state::MacroFrame;
use crate::store::{escape_quoted, ObjectStore, Stored};

const ESCAPED_DOLLAR: char = '\u{1}';
const ESCAPED_TILDE: char = '\u{2}';

/// One top-level brace expression found in a command
#[derive(Debug, Clone, PartialEq)]
pub struct BraceSpan {
    /// Byte offset of `{` (or of `$` for `${`)
    pub start: usize,
    /// Byte offset just past `}`
    pub end: usize,
    pub inner: String,
    /// `${...}`: splice raw text, unwrapping lists
    pub dollar: bool,
    /// Found inside a quoted region
    pub in_quote: bool,
}

pub fn protect_escapes(text: &str) -> String {
    if !text.contains('\\') {
        return text.to_string();
    }
    text.replace("\\$", &ESCAPED_DOLLAR.to_string())
        .replace("\\~", &ESCAPED_TILDE.to_string())
}

pub fn restore_dollars(text: &str) -> String {
    text.replace(ESCAPED_DOLLAR, "$")
}

pub fn restore_tildes(text: &str) -> String {
    text.replace(ESCAPED_TILDE, "~")
}

/// Find brace expressions outside parenthesized blocks. Braces inside
/// quotes count; braces nested in another brace belong to it.
pub fn find_braces(text: &str) -> Vec<BraceSpan> {
    let mut spans = Vec::new();
    let mut quote: Option<char> = None;
    let mut parens = 0usize;
    let mut escaped = false;
    let mut iter = text.char_indices();

    while let Some((i, c)) = iter.next() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' | '\'' if quote == Some(c) => quote = None,
            '"' | '\'' if quote.is_none() => quote = Some(c),
            '(' if quote.is_none() => parens += 1,
            ')' if quote.is_none() => parens = parens.saturating_sub(1),
            '{' if parens == 0 => {
                let Some(close) = matching_brace(&text[i + 1..]) else {
                    break;
                };
                let end = i + 1 + close + 1;
                let dollar = text[..i].ends_with('$') && !text[..i].ends_with("\\$");
                spans.push(BraceSpan {
                    start: if dollar { i - 1 } else { i },
                    end,
                    inner: text[i + 1..end - 1].to_string(),
                    dollar,
                    in_quote: quote.is_some(),
                });
                // Skip past the closing brace
                for (j, _) in iter.by_ref() {
                    if j + 1 >= end {
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    spans
}

/// Offset of the `}` closing a brace whose body starts `text`
fn matching_brace(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' | '\'' if quote == Some(c) => quote = None,
            '"' | '\'' if quote.is_none() => quote = Some(c),
            '{' if quote.is_none() => depth += 1,
            '}' if quote.is_none() => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// Replace spans right to left so earlier offsets stay valid
pub fn splice(text: &str, spans: &[BraceSpan], replacements: &[String]) -> String {
    let mut out = text.to_string();
    let mut order: Vec<usize> = (0..spans.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(spans[i].start));
    for i in order {
        out.replace_range(spans[i].start..spans[i].end, &replacements[i]);
    }
    out
}

/// Text a brace value is spliced back as
pub fn format_brace_value(store: &ObjectStore, value: &Value, span: &BraceSpan) -> String {
    if value.is_nil() {
        return "nil".to_string();
    }
    if span.in_quote {
        return escape_quoted(&store.display(value));
    }
    if span.dollar {
        if let Value::Ref(r) = value {
            if let Some(Stored::List(list)) = store.get(*r) {
                return list
                    .items()
                    .iter()
                    .map(|v| store.format_for_reparse(v))
                    .collect::<Vec<_>>()
                    .join(", ");
            }
        }
        return store.display(value);
    }
    store.format_for_reparse(value)
}

fn format_arg(store: &ObjectStore, value: &Value, in_quote: bool) -> String {
    if in_quote {
        escape_quoted(&store.display(value))
    } else {
        store.format_for_reparse(value)
    }
}

/// Expand `$*`, `$@`, `$#` and `$N`. `list_marker` renders the argument
/// list for `$@` and is only called when one occurs.
pub fn substitute_macro_args(
    text: &str,
    frame: &MacroFrame,
    store: &ObjectStore,
    mut list_marker: impl FnMut() -> String,
) -> String {
    if !text.contains('$') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match c {
            '"' | '\'' if quote == Some(c) => quote = None,
            '"' | '\'' if quote.is_none() => quote = Some(c),
            '$' => {
                let in_quote = quote == Some('"');
                match chars.peek().map(|&(_, n)| n) {
                    Some('*') => {
                        chars.next();
                        let joined: Vec<String> = frame
                            .args
                            .iter()
                            .map(|v| format_arg(store, v, in_quote))
                            .collect();
                        out.push_str(&joined.join(", "));
                        continue;
                    }
                    Some('@') => {
                        chars.next();
                        out.push_str(&list_marker());
                        continue;
                    }
                    Some('#') => {
                        chars.next();
                        out.push_str(&frame.args.len().to_string());
                        continue;
                    }
                    Some(d) if d.is_ascii_digit() => {
                        let digits: String = text[i + 1..]
                            .chars()
                            .take_while(|c| c.is_ascii_digit())
                            .collect();
                        for _ in 0..digits.len() {
                            chars.next();
                        }
                        let index: usize = digits.parse().unwrap_or(0);
                        if let Some(v) = index.checked_sub(1).and_then(|i| frame.args.get(i)) {
                            out.push_str(&format_arg(store, v, in_quote));
                        }
                        continue;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        out.push(c);
    }
    out
}

/// Replace `~name` inside double-quoted text with the variable's display
/// text; a `;` right after the name is consumed as a terminator. Unknown
/// names are left as written.
pub fn interpolate_tildes(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    if !text.contains('~') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut in_double = false;
    let mut in_single = false;
    let mut escaped = false;
    let mut rest = text;

    while let Some(c) = rest.chars().next() {
        let width = c.len_utf8();
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' && !in_single {
            in_double = !in_double;
        } else if c == '\'' && !in_double {
            in_single = !in_single;
        } else if c == '~' && in_double {
            let name_len = rest[1..]
                .char_indices()
                .find(|(_, n)| !(n.is_alphanumeric() || *n == '_'))
                .map_or(rest.len() - 1, |(j, _)| j);
            if name_len > 0 {
                let name = &rest[1..1 + name_len];
                if let Some(value) = lookup(name) {
                    out.push_str(&escape_quoted(&value));
                    let mut consumed = 1 + name_len;
                    if rest[consumed..].starts_with(';') {
                        consumed += 1;
                    }
                    rest = &rest[consumed..];
                    continue;
                }
            }
        }
        out.push(c);
        rest = &rest[width..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::StoredList;

    #[test]
    fn test_find_top_level_braces() {
        let spans = find_braces("echo {a {b}}, \"x {c}\", (skip {d}), ${e}");
        let inner: Vec<&str> = spans.iter().map(|s| s.inner.as_str()).collect();
        assert_eq!(inner, vec!["a {b}", "c", "e"]);
        assert!(spans[1].in_quote);
        assert!(spans[2].dollar);
        assert_eq!(&"echo {a {b}}, \"x {c}\", (skip {d}), ${e}"[spans[2].start..spans[2].end], "${e}");
    }

    #[test]
    fn test_splice_right_to_left() {
        let text = "x {a} y {bb} z";
        let spans = find_braces(text);
        let out = splice(text, &spans, &["1".into(), "22222".into()]);
        assert_eq!(out, "x 1 y 22222 z");
    }

    #[test]
    fn test_format_brace_values() {
        let store = ObjectStore::new();
        let plain = BraceSpan {
            start: 0,
            end: 0,
            inner: String::new(),
            dollar: false,
            in_quote: false,
        };
        let quoted = BraceSpan { in_quote: true, ..plain.clone() };
        let dollar = BraceSpan { dollar: true, ..plain.clone() };
        assert_eq!(format_brace_value(&store, &Value::quoted("a b"), &plain), "\"a b\"");
        assert_eq!(format_brace_value(&store, &Value::quoted("a\"b"), &quoted), "a\\\"b");
        assert_eq!(format_brace_value(&store, &Value::Nil, &quoted), "nil");

        let list = store.store_list(StoredList::new(vec![Value::Int(1), Value::quoted("s")]));
        assert_eq!(format_brace_value(&store, &Value::Ref(list), &dollar), "1, \"s\"");
        assert_eq!(format_brace_value(&store, &Value::Ref(list), &plain), list.to_marker());
    }

    #[test]
    fn test_macro_args() {
        let store = ObjectStore::new();
        let frame = MacroFrame::new(vec![Value::Int(1), Value::quoted("two")], Default::default());
        let out = substitute_macro_args("echo $1, $2, $3, \"n=$2\", $#", &frame, &store, || "L".into());
        assert_eq!(out, "echo 1, \"two\", , \"n=two\", 2");
        let out = substitute_macro_args("f $*; g $@; h $x", &frame, &store, || "L".into());
        assert_eq!(out, "f 1, \"two\"; g L; h $x");
    }

    #[test]
    fn test_protect_and_restore() {
        let protected = protect_escapes("a \\$1 \\~x");
        assert!(!protected.contains('$'));
        assert_eq!(restore_tildes(&restore_dollars(&protected)), "a $1 ~x");
    }

    #[test]
    fn test_tilde_interpolation() {
        let lookup = |name: &str| (name == "who").then(|| "w\"d".to_string());
        assert_eq!(
            interpolate_tildes("echo \"hi ~who; ~none\", ~who", lookup),
            "echo \"hi w\\\"d ~none\", ~who"
        );
    }
}
