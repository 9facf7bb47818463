//! SQL script text handling: statement splitting and identifier hygiene.
//!
//! Dump scripts are filtered statement-by-statement, so the splitter must
//! respect single quotes, double quotes, dollar-quoted function bodies, and
//! line comments. It does not need to be a full parser; dumps are
//! machine-generated and well-formed.

use regex::Regex;
use std::sync::OnceLock;

/// Split a SQL script into statements terminated by `;`.
///
/// Statement text is returned trimmed, without the trailing semicolon
/// delimiter stripped (the delimiter is kept so statements can be re-joined
/// verbatim). Comment-only fragments between statements are attached to the
/// following statement, which keeps dump headers with their DDL.
pub fn split_statements(script: &str) -> Vec<String> {
    #[derive(PartialEq)]
    enum Mode {
        Plain,
        SingleQuote,
        DoubleQuote,
        LineComment,
        DollarQuote(String),
    }

    let mut statements = Vec::new();
    let mut current = String::new();
    let mut mode = Mode::Plain;

    let bytes: Vec<char> = script.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        current.push(c);

        match &mode {
            Mode::Plain => match c {
                '\'' => mode = Mode::SingleQuote,
                '"' => mode = Mode::DoubleQuote,
                '-' if bytes.get(i + 1) == Some(&'-') => mode = Mode::LineComment,
                '$' => {
                    if let Some(tag) = dollar_tag(&bytes[i..]) {
                        for _ in 1..tag.len() {
                            i += 1;
                            current.push(bytes[i]);
                        }
                        mode = Mode::DollarQuote(tag);
                    }
                }
                ';' => {
                    let stmt = current.trim();
                    if !stmt.is_empty() {
                        statements.push(stmt.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Mode::SingleQuote => {
                if c == '\'' {
                    // Doubled quote is an escaped quote, stay in string.
                    if bytes.get(i + 1) == Some(&'\'') {
                        i += 1;
                        current.push('\'');
                    } else {
                        mode = Mode::Plain;
                    }
                }
            }
            Mode::DoubleQuote => {
                if c == '"' {
                    mode = Mode::Plain;
                }
            }
            Mode::LineComment => {
                if c == '\n' {
                    mode = Mode::Plain;
                }
            }
            Mode::DollarQuote(tag) => {
                if c == '$' {
                    if let Some(close) = dollar_tag(&bytes[i..]) {
                        if close == *tag {
                            for _ in 1..close.len() {
                                i += 1;
                                current.push(bytes[i]);
                            }
                            mode = Mode::Plain;
                        }
                    }
                }
            }
        }
        i += 1;
    }

    let rest = current.trim();
    if !rest.is_empty() && rest.lines().any(|l| !l.trim_start().starts_with("--") && !l.trim().is_empty()) {
        statements.push(rest.to_string());
    }

    statements
}

/// Read a `$tag$` opener/closer starting at `chars[0] == '$'`.
fn dollar_tag(chars: &[char]) -> Option<String> {
    let mut tag = String::from("$");
    for c in &chars[1..] {
        match c {
            '$' => {
                tag.push('$');
                return Some(tag);
            }
            c if c.is_alphanumeric() || *c == '_' => tag.push(*c),
            _ => return None,
        }
    }
    None
}

/// The leading keywords of a statement, uppercased, ignoring comment lines.
pub fn statement_head(stmt: &str) -> String {
    stmt.lines()
        .map(str::trim_start)
        .find(|l| !l.is_empty() && !l.starts_with("--"))
        .unwrap_or("")
        .to_ascii_uppercase()
}

static IDENT_RE: OnceLock<Regex> = OnceLock::new();

/// Whether a name is safe to interpolate into dynamic SQL.
///
/// Catalog metadata is attacker-influenced in the sense that table and column
/// names come from the migrated database itself; anything outside this
/// pattern is skipped rather than quoted.
pub fn is_safe_identifier(name: &str) -> bool {
    let re = IDENT_RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));
    !name.is_empty() && name.len() <= 63 && re.is_match(name)
}

/// Double-quote an identifier for interpolation. Callers must have validated
/// it with [`is_safe_identifier`] first.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name)
}

/// Quote a `schema.table` pair.
pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_statements() {
        let stmts = split_statements("CREATE TABLE a ();\nINSERT INTO a VALUES (1);\n");
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE"));
    }

    #[test]
    fn semicolons_inside_strings_do_not_split() {
        let stmts = split_statements("INSERT INTO t VALUES ('a;b');");
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn escaped_quote_stays_in_string() {
        let stmts = split_statements("INSERT INTO t VALUES ('it''s; fine'); SELECT 1;");
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn dollar_quoted_bodies_are_opaque() {
        let script = "CREATE FUNCTION f() RETURNS void AS $$\nBEGIN\n  SELECT 1; SELECT 2;\nEND;\n$$ LANGUAGE plpgsql;\nSELECT 3;";
        let stmts = split_statements(script);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("SELECT 2;"));
    }

    #[test]
    fn tagged_dollar_quotes() {
        let script = "CREATE FUNCTION g() RETURNS text AS $body$ SELECT '$$; huh'; $body$ LANGUAGE sql;";
        let stmts = split_statements(script);
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn line_comments_with_semicolons_ignored() {
        let stmts = split_statements("-- setup; not a statement\nSELECT 1;");
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn statement_head_skips_comments() {
        let head = statement_head("-- comment\n-- more\ncreate policy p ON t;");
        assert!(head.starts_with("CREATE POLICY"));
    }

    #[test]
    fn identifier_validation() {
        assert!(is_safe_identifier("users"));
        assert!(is_safe_identifier("_raw_meta2"));
        assert!(!is_safe_identifier("users; DROP TABLE x"));
        assert!(!is_safe_identifier("weird-name"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier(&"a".repeat(64)));
    }

    #[test]
    fn quoting() {
        assert_eq!(quote_qualified("public", "orders"), "\"public\".\"orders\"");
    }
}
