use std::sync::OnceLock;

use regex::Regex;

use crate::errors::{Result, SqlFlowError};

/// Keywords that must never appear as a bare identifier in generated SQL.
const DESTRUCTIVE_KEYWORDS: &[&str] = &[
    "drop", "delete", "truncate", "alter", "grant", "revoke", "attach", "detach",
];

fn ident_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

/// Validate a user-supplied identifier (table or column name) before it is
/// spliced into generated SQL.
///
/// Identifiers must match `^[A-Za-z_][A-Za-z0-9_]*$`. Anything containing
/// statement separators, comment markers, quote characters, backslashes, or a
/// bare destructive keyword is rejected with a `Validation` error so it never
/// reaches the engine.
pub fn validate_identifier(name: &str, what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SqlFlowError::Validation(format!("{what} must not be empty")));
    }
    for forbidden in [";", "--", "/*", "'", "\"", "`", "\\"] {
        if name.contains(forbidden) {
            return Err(SqlFlowError::Validation(format!(
                "{what} {name:?} contains forbidden sequence {forbidden:?}"
            )));
        }
    }
    if !ident_regex().is_match(name) {
        return Err(SqlFlowError::Validation(format!(
            "{what} {name:?} is not a valid identifier"
        )));
    }
    if DESTRUCTIVE_KEYWORDS.contains(&name.to_ascii_lowercase().as_str()) {
        return Err(SqlFlowError::Validation(format!(
            "{what} {name:?} is a reserved keyword"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        assert!(validate_identifier("orders", "table").is_ok());
        assert!(validate_identifier("_ts_col2", "column").is_ok());
    }

    #[test]
    fn rejects_injection_shapes() {
        assert!(validate_identifier("orders; DROP TABLE x", "table").is_err());
        assert!(validate_identifier("a--b", "table").is_err());
        assert!(validate_identifier("a\"b", "table").is_err());
        assert!(validate_identifier("a.b", "table").is_err());
        assert!(validate_identifier("", "table").is_err());
    }

    #[test]
    fn rejects_bare_destructive_keywords() {
        assert!(validate_identifier("drop", "table").is_err());
        assert!(validate_identifier("TRUNCATE", "table").is_err());
        // but names merely containing one are fine
        assert!(validate_identifier("dropped_orders", "table").is_ok());
    }
}
