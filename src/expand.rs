//! `$(VAR)` reference expansion
//!
//! Implements the Kubernetes downward-API expansion rule: literal-segment
//! plus placeholder scanning, `$$` escapes to `$`, no shell semantics and
//! no defaulting. Incomplete references (`$(foo`, trailing `$`) pass
//! through verbatim.

use crate::error::Error;

const OPERATOR: u8 = b'$';
const OPENER: u8 = b'(';
const CLOSER: u8 = b')';

/// Expand `$(VAR)` references in `input` using `mapping`.
///
/// References `mapping` cannot resolve are left in place as `$(VAR)`.
pub fn expand<F>(input: &str, mut mapping: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    expand_bytes(input, |name| {
        mapping(name).unwrap_or_else(|| format!("$({name})"))
    })
}

/// Expand `$(VAR)` references, failing on any reference `mapping` resolves
/// to nothing or to an empty string.
///
/// Used for reload-trigger expressions, where a partially-resolved
/// reference would silently produce a wrong config key.
pub fn expand_strict<F>(input: &str, mut mapping: F) -> Result<String, Error>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut failed = false;
    let out = expand_bytes(input, |name| match mapping(name) {
        Some(v) if !v.is_empty() => v,
        _ => {
            failed = true;
            String::new()
        }
    });

    if failed {
        return Err(Error::Expand {
            expr: input.to_string(),
        });
    }
    Ok(out)
}

fn expand_bytes<F>(input: &str, mut mapping: F) -> String
where
    F: FnMut(&str) -> String,
{
    let bytes = input.as_bytes();
    let mut buf: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut checkpoint = 0usize;
    let mut cursor = 0usize;

    while cursor < bytes.len() {
        if bytes[cursor] == OPERATOR && cursor + 1 < bytes.len() {
            buf.extend_from_slice(&bytes[checkpoint..cursor]);

            let (read, advance) = match bytes[cursor + 1] {
                // `$$` collapses to a literal `$`
                OPERATOR => {
                    buf.push(OPERATOR);
                    (None, 1)
                }
                OPENER => match bytes[cursor + 2..].iter().position(|&b| b == CLOSER) {
                    Some(rel) => {
                        let name = &input[cursor + 2..cursor + 2 + rel];
                        (Some(name), rel + 2)
                    }
                    None => {
                        // unclosed reference, keep `$(` and resume after it
                        buf.push(OPERATOR);
                        buf.push(OPENER);
                        (None, 1)
                    }
                },
                other => {
                    // `$x` is not a reference
                    buf.push(OPERATOR);
                    buf.push(other);
                    (None, 1)
                }
            };

            if let Some(name) = read {
                buf.extend_from_slice(mapping(name).as_bytes());
            }

            cursor += advance;
            checkpoint = cursor + 1;
        }
        cursor += 1;
    }

    buf.extend_from_slice(&bytes[checkpoint..]);
    String::from_utf8_lossy(&buf).into_owned()
}
