//! Transaction-control classification.
//!
//! The only SQL awareness in the pooler: the leading keyword of a simple
//! query and the tag of a `CommandComplete` are matched against the
//! transaction-control verbs. Both are advisory hints for release timing;
//! the authoritative boundary is `ReadyForQuery`.

/// A transaction-control verb observed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnVerb {
    Begin,
    Commit,
    Rollback,
}

/// Classify the first keyword of a query string, case-insensitively.
pub fn query_verb(sql: &str) -> Option<TxnVerb> {
    classify(first_keyword(sql))
}

/// Classify a `CommandComplete` tag, case-insensitively.
pub fn command_tag_verb(tag: &str) -> Option<TxnVerb> {
    classify(first_keyword(tag))
}

fn first_keyword(s: &str) -> &str {
    let s = s.trim_start();
    let end = s
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    &s[..end]
}

fn classify(keyword: &str) -> Option<TxnVerb> {
    if keyword.eq_ignore_ascii_case("BEGIN") || keyword.eq_ignore_ascii_case("START") {
        Some(TxnVerb::Begin)
    } else if keyword.eq_ignore_ascii_case("COMMIT") || keyword.eq_ignore_ascii_case("END") {
        Some(TxnVerb::Commit)
    } else if keyword.eq_ignore_ascii_case("ROLLBACK") || keyword.eq_ignore_ascii_case("ABORT") {
        Some(TxnVerb::Rollback)
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn query_verbs() {
        assert_eq!(query_verb("BEGIN"), Some(TxnVerb::Begin));
        assert_eq!(query_verb("  begin;"), Some(TxnVerb::Begin));
        assert_eq!(query_verb("Start Transaction"), Some(TxnVerb::Begin));
        assert_eq!(query_verb("COMMIT"), Some(TxnVerb::Commit));
        assert_eq!(query_verb("end"), Some(TxnVerb::Commit));
        assert_eq!(query_verb("rollback to savepoint a"), Some(TxnVerb::Rollback));
        assert_eq!(query_verb("ABORT"), Some(TxnVerb::Rollback));
        assert_eq!(query_verb("SELECT 1"), None);
        assert_eq!(query_verb("beginning_of_table()"), None);
        assert_eq!(query_verb(""), None);
    }

    #[test]
    fn command_tags() {
        assert_eq!(command_tag_verb("COMMIT"), Some(TxnVerb::Commit));
        assert_eq!(command_tag_verb("ROLLBACK"), Some(TxnVerb::Rollback));
        assert_eq!(command_tag_verb("SELECT 1"), None);
        assert_eq!(command_tag_verb("INSERT 0 1"), None);
    }
}
