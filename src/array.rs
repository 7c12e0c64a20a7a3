//! Text-format array literals.
//!
//! Arrays are sent to the server as text literals such as `{1,NULL,"a b"}`
//! and may come back in the same form when a column is requested as text.

use crate::error::{PgError, PgResult};
use crate::types::PgValue;

/// Render values as an array literal. Nested `PgValue::Array` values become
/// nested braces.
pub fn format_array_literal(values: &[PgValue]) -> String {
    let mut out = String::with_capacity(2 + values.len() * 4);
    write_array(&mut out, values);
    out
}

fn write_array(out: &mut String, values: &[PgValue]) {
    out.push('{');
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match value {
            PgValue::Null => out.push_str("NULL"),
            PgValue::Array { values, .. } => write_array(out, values),
            other => write_element(out, &other.encode_text()),
        }
    }
    out.push('}');
}

fn needs_quotes(s: &str) -> bool {
    s.is_empty()
        || s.eq_ignore_ascii_case("NULL")
        || s.chars().any(|c| {
            matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_ascii_whitespace()
        })
}

fn write_element(out: &mut String, s: &str) {
    if !needs_quotes(s) {
        out.push_str(s);
        return;
    }
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

/// Parse a one-dimensional array literal into its elements.
///
/// Unquoted `NULL` becomes `None`; a quoted `"NULL"` stays a string. Empty
/// positions (`{,}`, `{a,}`) are empty strings.
pub fn parse_array_literal(input: &str) -> PgResult<Vec<Option<String>>> {
    let input = input.trim();
    let inner = input
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| PgError::Type(format!("Malformed array literal: {}", input)))?;

    if inner.is_empty() {
        return Ok(Vec::new());
    }

    let mut elements = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut was_quoted = false;
    let mut depth = 0usize;
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if depth > 0 {
                    current.push(c);
                }
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => {
                        return Err(PgError::Type(
                            "Array literal ends inside an escape".to_string(),
                        ))
                    }
                }
            }
            '"' => {
                quoted = !quoted;
                if depth > 0 {
                    // Nested groups keep their quoting for a later parse.
                    current.push(c);
                } else {
                    was_quoted = true;
                }
            }
            // Padding around elements, including after a closing quote
            c if c.is_whitespace()
                && !quoted
                && depth == 0
                && (was_quoted || current.is_empty()) => {}
            '{' if !quoted => {
                depth += 1;
                current.push(c);
            }
            '}' if !quoted && depth > 0 => {
                depth -= 1;
                current.push(c);
            }
            ',' if !quoted && depth == 0 => {
                elements.push(finish_element(&mut current, &mut was_quoted));
            }
            _ => current.push(c),
        }
    }

    if quoted {
        return Err(PgError::Type("Unterminated quote in array literal".to_string()));
    }
    elements.push(finish_element(&mut current, &mut was_quoted));
    Ok(elements)
}

fn finish_element(current: &mut String, was_quoted: &mut bool) -> Option<String> {
    let raw = std::mem::take(current);
    let quoted = std::mem::replace(was_quoted, false);
    if quoted {
        return Some(raw);
    }
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("NULL") {
        None
    } else {
        Some(trimmed.to_string())
    }
}
