//! Literal and identifier quoting, compatible with libpq.

/// Quote a string as a SQL literal.
///
/// Single quotes are doubled. If the text contains a backslash, the
/// literal uses the escape-string syntax ` E'...'` with doubled
/// backslashes, so the result is correct whatever
/// `standard_conforming_strings` is set to.
pub fn escape_literal(text: &str) -> String {
    let has_backslash = text.contains('\\');
    let mut out = String::with_capacity(text.len() + 4);
    if has_backslash {
        out.push_str(" E");
    }
    out.push('\'');
    for c in text.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Quote a string as a SQL identifier, doubling embedded double quotes.
pub fn escape_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_quotes() {
        assert_eq!(escape_literal("it's"), "'it''s'");
        assert_eq!(escape_literal(""), "''");
    }

    #[test]
    fn literal_backslash_uses_escape_syntax() {
        assert_eq!(escape_literal(r"a\b"), r" E'a\\b'");
        assert_eq!(escape_literal(r#"{"\"x\""}"#), r#" E'{"\\"x\\""}'"#);
    }

    #[test]
    fn identifier_quotes() {
        assert_eq!(escape_identifier("users"), "\"users\"");
        assert_eq!(escape_identifier("we\"ird"), "\"we\"\"ird\"");
    }
}
