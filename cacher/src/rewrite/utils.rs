use std::fmt::Write;

const ESCAPE_CHAR: char = '!';

/// Escape `raw` as a query component, using `!` instead of `%` as escape character.
///
/// Unreserved characters (`A-Z a-z 0-9 - _ . ~`) are kept, spaces become `+` and every other byte becomes `!XX` (uppercase hex),
/// so the result is a single path segment safe for any object store.
pub fn escape_key(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len() * 3 / 2);

    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => escaped.push(byte as char),
            b' ' => escaped.push('+'),
            _ => {
                let _ = write!(escaped, "{ESCAPE_CHAR}{byte:02X}");
            }
        }
    }

    escaped
}

/// Strip matching surrounding quotes, returning the unquoted value and the quote found, if any.
pub fn unquote(raw: &str) -> (&str, Option<char>) {
    let raw = raw.trim();

    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return (raw[1..raw.len() - 1].trim(), Some(quote));
        }
    }

    (raw, None)
}
