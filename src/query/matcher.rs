//! Tag matchers: which series of a metric a query selects.
//!
//! Filter forms follow the query surface: an exact value, the `*`
//! wildcard (tag must exist, any value), or a `v1|v2` literal
//! alternation. `explicit_tags` additionally requires the series to have
//! exactly the queried tags.

use crate::series::TimeSeries;

#[derive(Debug, Clone, PartialEq)]
pub enum TagFilter {
    Exact(String),
    Wildcard,
    OneOf(Vec<String>),
}

impl TagFilter {
    pub fn parse(value: &str) -> TagFilter {
        if value == "*" {
            TagFilter::Wildcard
        } else if value.contains('|') {
            TagFilter::OneOf(value.split('|').map(str::to_string).collect())
        } else {
            TagFilter::Exact(value.to_string())
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            TagFilter::Exact(expected) => expected == value,
            TagFilter::Wildcard => true,
            TagFilter::OneOf(options) => options.iter().any(|o| o == value),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagMatcher {
    filters: Vec<(String, TagFilter)>,
    explicit_tags: bool,
}

impl TagMatcher {
    pub fn new(filters: Vec<(String, TagFilter)>, explicit_tags: bool) -> Self {
        TagMatcher { filters, explicit_tags }
    }

    /// Builds a matcher from raw `key → value` pairs as they appear in a
    /// query body.
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
        explicit_tags: bool,
    ) -> Self {
        TagMatcher {
            filters: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), TagFilter::parse(v)))
                .collect(),
            explicit_tags,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    pub fn explicit_tags(&self) -> bool {
        self.explicit_tags
    }

    pub fn matches(&self, series: &TimeSeries) -> bool {
        if self.explicit_tags && series.tag_count() != self.filters.len() {
            return false;
        }
        self.filters.iter().all(|(key, filter)| {
            series
                .tags()
                .iter()
                .find(|tag| tag.key == *key)
                .is_some_and(|tag| filter.matches(&tag.value))
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::common::types::{Tag, TagList};

    use super::*;

    fn series(pairs: &[(&str, &str)]) -> TimeSeries {
        let tags: TagList = pairs.iter().map(|(k, v)| Tag::new(*k, *v).unwrap()).collect();
        TimeSeries::new(0, 0, tags)
    }

    #[test]
    fn test_exact_and_wildcard() {
        let ts = series(&[("host", "web1"), ("dc", "east")]);
        assert!(TagMatcher::from_pairs([("host", "web1")], false).matches(&ts));
        assert!(TagMatcher::from_pairs([("host", "*")], false).matches(&ts));
        assert!(!TagMatcher::from_pairs([("host", "web2")], false).matches(&ts));
        assert!(!TagMatcher::from_pairs([("rack", "*")], false).matches(&ts));
    }

    #[test]
    fn test_literal_or() {
        let ts = series(&[("host", "web2")]);
        assert!(TagMatcher::from_pairs([("host", "web1|web2")], false).matches(&ts));
        assert!(!TagMatcher::from_pairs([("host", "web3|web4")], false).matches(&ts));
    }

    #[test]
    fn test_explicit_tags_prunes_by_count() {
        let ts = series(&[("host", "web1"), ("dc", "east")]);
        assert!(TagMatcher::from_pairs([("host", "web1")], false).matches(&ts));
        assert!(!TagMatcher::from_pairs([("host", "web1")], true).matches(&ts));
        assert!(
            TagMatcher::from_pairs([("host", "web1"), ("dc", "*")], true).matches(&ts)
        );
    }

    #[test]
    fn test_empty_matcher_matches_everything() {
        let ts = series(&[("host", "web1")]);
        assert!(TagMatcher::default().matches(&ts));
    }
}
