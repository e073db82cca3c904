//! Query classification: inspect the first keyword of a
//! normalized query to decide routing and caching eligibility.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    Read,
    Write,
    Ddl,
    Txn,
}

static FIRST_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*([A-Za-z]+)").unwrap());

/// Normalizes whitespace (collapse runs, trim) for fingerprinting and
/// classification alike — keeping both on the same normalization keeps
/// "same query, different formatting" hitting the same cache entry.
pub fn normalize(query: &str) -> String {
    let collapsed: Vec<&str> = query.split_whitespace().collect();
    collapsed.join(" ")
}

pub fn classify(query: &str) -> Classification {
    let normalized = normalize(query);
    let first = FIRST_WORD
        .captures(&normalized)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_uppercase())
        .unwrap_or_default();

    match first.as_str() {
        "SELECT" | "SHOW" | "EXPLAIN" | "DESCRIBE" | "WITH" => Classification::Read,
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "MERGE" => Classification::Write,
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" => Classification::Ddl,
        "BEGIN" | "START" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" => Classification::Txn,
        // Unknown commands default to WRITE for safety
        _ => Classification::Write,
    }
}

impl Classification {
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Classification::Read)
    }

    pub fn routes_to_primary(&self) -> bool {
        matches!(self, Classification::Write | Classification::Ddl | Classification::Txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_select_as_read() {
        assert_eq!(classify("SELECT * FROM documents WHERE id = 42"), Classification::Read);
    }

    #[test]
    fn classifies_insert_as_write() {
        assert_eq!(
            classify("INSERT INTO documents(id,title) VALUES (1,'t')"),
            Classification::Write
        );
    }

    #[test]
    fn unknown_command_defaults_to_write() {
        assert_eq!(classify("VACUUM documents"), Classification::Write);
    }

    #[test]
    fn classification_is_case_and_whitespace_insensitive() {
        assert_eq!(classify("   select 1"), Classification::Read);
        assert_eq!(classify("Select 1"), Classification::Read);
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize("SELECT   *\nFROM  t"), "SELECT * FROM t");
    }
}
