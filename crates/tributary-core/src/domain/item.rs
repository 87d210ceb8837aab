use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::MessageId;
use super::record::RecordKey;

/// Dot-separated routing subject, e.g. `entries.new`.
///
/// Filters may use `*` for exactly one token and a trailing `>` for one or more tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject(String);

impl Subject {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A subject items can be published under: well-formed and free of wildcards.
    pub fn is_literal(&self) -> bool {
        self.is_well_formed() && self.0.split('.').all(|token| token != "*" && token != ">")
    }

    /// A subject usable as a filter: well-formed, `>` only as the last token.
    pub fn is_valid_filter(&self) -> bool {
        self.is_well_formed() && self.0.split('.').rev().skip(1).all(|token| token != ">")
    }

    fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && !self.0.chars().any(char::is_whitespace)
            && self.0.split('.').all(|token| !token.is_empty())
    }

    /// Does this (literal) subject match `filter`?
    pub fn matches(&self, filter: &str) -> bool {
        let mut tokens = self.0.split('.');
        let mut patterns = filter.split('.').peekable();

        while let Some(pattern) = patterns.next() {
            if pattern == ">" {
                // `>` must be last and must swallow at least one token
                return patterns.peek().is_none() && tokens.next().is_some();
            }
            match tokens.next() {
                Some(token) if pattern == "*" || pattern == token => {}
                _ => return false,
            }
        }
        tokens.next().is_none()
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A unit of work flowing through the stream.
///
/// Immutable once published: the consumer only ever sees clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    id: MessageId,
    subject: Subject,
    payload: Vec<u8>,
    published_at: DateTime<Utc>,
}

impl Item {
    pub fn new(
        id: MessageId,
        subject: Subject,
        payload: impl Into<Vec<u8>>,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            subject,
            payload: payload.into(),
            published_at,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    /// Key under which the sink stores this item.
    pub fn idempotency_key(&self) -> RecordKey {
        RecordKey::from(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("entries.new", "entries.new", true)]
    #[case("entries.new", "entries.*", true)]
    #[case("entries.new", "entries.>", true)]
    #[case("entries.new.eu", "entries.>", true)]
    #[case("entries.new.eu", "entries.*", false)]
    #[case("entries", "entries.>", false)]
    #[case("entries.new", "orders.*", false)]
    #[case("entries.new", "entries.new.eu", false)]
    #[case("entries.new", ">", true)]
    fn subject_matching(#[case] subject: &str, #[case] filter: &str, #[case] expected: bool) {
        assert_eq!(Subject::new(subject).matches(filter), expected);
    }

    #[rstest]
    #[case("entries.new", true, true)]
    #[case("", false, false)]
    #[case("entries..new", false, false)]
    #[case("entries new", false, false)]
    #[case("entries.*", false, true)]
    #[case("entries.>", false, true)]
    #[case(">", false, true)]
    #[case("entries.>.new", false, false)]
    #[case("entries.*.eu", false, true)]
    #[case("entries.new*", true, true)]
    fn literal_subjects_and_filters(
        #[case] subject: &str,
        #[case] literal: bool,
        #[case] filter: bool,
    ) {
        let subject = Subject::new(subject);
        assert_eq!(subject.is_literal(), literal);
        assert_eq!(subject.is_valid_filter(), filter);
    }
}
