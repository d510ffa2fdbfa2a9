//! Named-parameter rewriting.
//!
//! Query text may bind values by name with a `:` marker directly in front of
//! an identifier (`WHERE id = :id`). Before dispatch the text is rewritten to
//! the positional `$n` form PostgreSQL expects, together with the argument
//! list in position order.
//!
//! The scanner leaves alone everything that only looks like a placeholder:
//! `::` casts, string literals, quoted identifiers, dollar-quoted bodies and
//! comments.

use serde_json::Value;

use crate::error::DatabaseError;

/// Parameter values keyed by name.
pub type Params = serde_json::Map<String, Value>;

/// Positional form of a query: text with `$n` placeholders and the matching arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Rewritten {
    pub text: String,
    pub args: Vec<Value>,
}

/// Rewrites `text` into positional form using `params`.
///
/// Each distinct name is assigned one position in order of first appearance;
/// later uses of the same name reuse that position. Text without named
/// placeholders is returned unchanged with an empty argument list.
///
/// # Errors
///
/// Returns [`DatabaseError::MissingParameter`] when the text references a name
/// absent from `params` (or when `params` is `None`).
///
/// # Examples
///
/// ```
/// use rttp_db::named::rewrite;
/// use serde_json::json;
///
/// let params = json!({ "id": 7, "status": "active" });
/// let out = rewrite(
///     "SELECT * FROM users WHERE id = :id AND status = :status AND parent = :id",
///     params.as_object(),
/// ).unwrap();
///
/// assert_eq!(out.text, "SELECT * FROM users WHERE id = $1 AND status = $2 AND parent = $1");
/// assert_eq!(out.args, vec![json!(7), json!("active")]);
/// ```
pub fn rewrite(text: &str, params: Option<&Params>) -> Result<Rewritten, DatabaseError> {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut names: Vec<&str> = Vec::new();
    let mut args = Vec::new();
    // Start of the slice of `text` not yet copied to `out`.
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => i = skip_quoted(bytes, i, bytes[i]),
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_line_comment(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b'$' => i = skip_dollar_quoted(bytes, i),
            b':' if bytes.get(i + 1) == Some(&b':') => i += 2,
            b':' if bytes.get(i + 1).is_some_and(|b| is_ident_start(*b)) => {
                let start = i + 1;
                let mut end = start + 1;
                while end < bytes.len() && is_ident_continue(bytes[end]) {
                    end += 1;
                }
                let name = &text[start..end];

                let position = match names.iter().position(|n| *n == name) {
                    Some(existing) => existing + 1,
                    None => {
                        let value = params.and_then(|p| p.get(name)).ok_or_else(|| {
                            DatabaseError::MissingParameter {
                                name: name.to_owned(),
                            }
                        })?;
                        names.push(name);
                        args.push(value.clone());
                        names.len()
                    }
                };

                out.push_str(&text[copied..i]);
                out.push('$');
                out.push_str(&position.to_string());
                copied = end;
                i = end;
            }
            _ => i += 1,
        }
    }

    if names.is_empty() {
        return Ok(Rewritten {
            text: text.to_owned(),
            args,
        });
    }
    out.push_str(&text[copied..]);
    Ok(Rewritten { text: out, args })
}

/// Collapses runs of spaces, tabs and newlines to one space and trims the ends.
///
/// Used for log output and diagnostics only; the text sent to the server is
/// never normalized.
pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars() {
        if matches!(ch, ' ' | '\t' | '\n' | '\r') {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(ch);
        }
    }
    out
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

// Returns the index just past the closing quote; a doubled quote is an escape.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|b| *b == b'\n')
        .map_or(bytes.len(), |offset| start + offset + 1)
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    bytes[start + 2..]
        .windows(2)
        .position(|w| w == b"*/")
        .map_or(bytes.len(), |offset| start + 2 + offset + 2)
}

// `$tag$ ... $tag$` bodies. A `$` that does not open a tag (e.g. `$1`) is skipped alone.
fn skip_dollar_quoted(bytes: &[u8], start: usize) -> usize {
    let mut tag_end = start + 1;
    while tag_end < bytes.len() && is_ident_continue(bytes[tag_end]) {
        tag_end += 1;
    }
    let opens_tag = bytes.get(tag_end) == Some(&b'$')
        && bytes
            .get(start + 1)
            .is_none_or(|b| *b == b'$' || is_ident_start(*b));
    if !opens_tag {
        return start + 1;
    }

    let tag = &bytes[start..=tag_end];
    let body = tag_end + 1;
    bytes[body..]
        .windows(tag.len())
        .position(|w| w == tag)
        .map_or(bytes.len(), |offset| body + offset + tag.len())
}
