//! Identifier validation for class, table, column and path segment names.

use crate::error::{ConfigError, Error, Result};
use regex::Regex;
use std::sync::OnceLock;

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

fn identifier_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(IDENTIFIER_PATTERN).ok())
        .as_ref()
}

/// Check whether `name` is a plain identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_identifier(name: &str) -> bool {
    match identifier_regex() {
        Some(re) => re.is_match(name),
        None => {
            let mut chars = name.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
    }
}

/// Validate an identifier, naming what it identifies in the error.
pub fn validate_identifier(what: &str, name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(Error::Config(ConfigError::new(format!(
            "invalid {what} name '{name}'"
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        assert!(is_identifier("thread"));
        assert!(is_identifier("_private"));
        assert!(is_identifier("sub_categories2"));
    }

    #[test]
    fn rejects_dotted_and_empty_names() {
        assert!(!is_identifier(""));
        assert!(!is_identifier("a.b"));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("drop table"));
        assert!(validate_identifier("column", "x y").is_err());
    }
}
