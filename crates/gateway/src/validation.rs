use std::sync::LazyLock;

use regex::Regex;

pub const DEFAULT_MAX_INPUT_LENGTH: usize = 1000;

/// Keywords a generated query must draw on; at least one has to appear.
const READ_KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "AND", "OR", "IN", "LIKE", "LIMIT", "ORDER", "BY", "ASC", "DESC",
    "GROUP", "HAVING", "JOIN",
];

/// Data modification, schema modification and procedural keywords.
const DENIED_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT", "DROP", "CREATE", "ALTER", "TRUNCATE",
    "RENAME", "GRANT", "REVOKE", "EXEC", "EXECUTE", "CALL", "ATTACH", "DETACH", "PRAGMA", "VACUUM",
    "COPY", "INTO", "SET", "LOCK", "UNLOCK", "SHUTDOWN",
];

static QUERY_SPAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\b(select\b.*?)(?:\n\s*returned information|\z)")
        .expect("generated query span pattern should compile")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Empty,
    TooLong { len: usize, max: usize },
    DisallowedCharacter,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Empty => write!(f, "input must not be empty"),
            ValidationError::TooLong { max, .. } => {
                write!(f, "input exceeds maximum length of {} characters", max)
            }
            ValidationError::DisallowedCharacter => {
                write!(f, "input contains disallowed characters")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryRejection {
    DeniedKeyword(String),
    StatementSeparator,
    Comment,
    NoReadKeyword,
}

impl std::fmt::Display for QueryRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryRejection::DeniedKeyword(keyword) => {
                write!(f, "query contains disallowed keyword {}", keyword)
            }
            QueryRejection::StatementSeparator => write!(f, "query contains multiple statements"),
            QueryRejection::Comment => write!(f, "query contains comments"),
            QueryRejection::NoReadKeyword => write!(f, "query contains no read-only keyword"),
        }
    }
}

impl std::error::Error for QueryRejection {}

/// Checks free text against the length and character allow-lists and returns
/// it trimmed.
pub fn sanitize_text(input: &str, max_len: usize) -> Result<String, ValidationError> {
    let len = input.chars().count();
    if len > max_len {
        return Err(ValidationError::TooLong { len, max: max_len });
    }

    if !input.chars().all(is_allowed_char) {
        return Err(ValidationError::DisallowedCharacter);
    }

    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }

    Ok(trimmed.to_string())
}

fn is_allowed_char(ch: char) -> bool {
    ch.is_alphanumeric()
        || ch.is_whitespace()
        || matches!(
            ch,
            '_' | '-'
                | '.'
                | ','
                | '?'
                | '!'
                | '@'
                | '#'
                | '$'
                | '%'
                | '^'
                | '&'
                | '*'
                | '('
                | ')'
                | '+'
                | '='
                | '['
                | ']'
                | '{'
                | '}'
                | '|'
                | '\\'
                | ':'
                | ';'
                | '"'
                | '\''
                | '<'
                | '>'
                | '/'
        )
}

/// Keyword check for queries produced by the structured-query backend.
///
/// Identifiers that are neither read keywords nor denied keywords pass. This is
/// a coarse filter, not a parser: obfuscation that avoids the denied tokens is
/// not caught here.
pub fn validate_generated_query(query: &str) -> Result<(), QueryRejection> {
    if query.contains(';') {
        return Err(QueryRejection::StatementSeparator);
    }
    if query.contains("--") || query.contains("/*") {
        return Err(QueryRejection::Comment);
    }

    let mut saw_read_keyword = false;
    for token in tokenize(query) {
        let upper = token.to_ascii_uppercase();
        if DENIED_KEYWORDS.contains(&upper.as_str()) {
            return Err(QueryRejection::DeniedKeyword(upper));
        }
        if READ_KEYWORDS.contains(&upper.as_str()) {
            saw_read_keyword = true;
        }
    }

    if !saw_read_keyword {
        return Err(QueryRejection::NoReadKeyword);
    }

    Ok(())
}

fn tokenize(query: &str) -> impl Iterator<Item = &str> {
    query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|token| !token.is_empty())
}

/// Pulls the query-shaped span out of a tool payload and returns it only when
/// it passes [`validate_generated_query`].
pub fn extract_generated_query(payload: &str) -> Option<String> {
    let captures = QUERY_SPAN.captures(payload)?;
    let query = captures.get(1)?.as_str().trim();
    if query.is_empty() {
        return None;
    }

    match validate_generated_query(query) {
        Ok(()) => Some(query.to_string()),
        Err(reason) => {
            tracing::warn!(reason = %reason, "generated query rejected");
            None
        }
    }
}
