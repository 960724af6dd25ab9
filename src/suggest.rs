//! Derived suggestion index
//!
//! Search queries accumulate decayed popularity together with the facet
//! fields and facet values that were filtered alongside them. Once per
//! decay pass the raw `query -> matcher` map is collapsed (redundant
//! extensions of an already-known prefix are dropped), decayed, pruned and
//! flattened into an ordered list of ranked suggestions.

use crate::decay::{DecayEvent, DecayPopularity, PRUNE_FLOOR};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Shortest prefix (in characters) that may absorb longer extensions.
const MIN_PREFIX_LEN: usize = 4;

/// Popularity of one facet field and of the values chosen within it, in
/// the context of a single query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryKeyData {
    #[serde(rename = "popularity", default)]
    pub field_pop: DecayPopularity,
    #[serde(rename = "values", default)]
    pub value_pop: HashMap<String, DecayPopularity>,
}

/// Aggregated signal for a single normalized query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryMatcher {
    #[serde(default)]
    pub popularity: DecayPopularity,
    #[serde(rename = "keyFacets", default)]
    pub key_fields: HashMap<u32, QueryKeyData>,
}

impl QueryMatcher {
    /// Record one use of facet `field` (and optionally a chosen `value`)
    /// together with this query.
    pub fn add_key_filter_event(&mut self, field: u32, value: &str, now: i64) {
        let key_data = self.key_fields.entry(field).or_default();
        key_data.field_pop.add(DecayEvent {
            timestamp: now,
            value: 100.0,
        });
        if !value.is_empty() {
            key_data.value_pop.entry(value.to_string()).or_default().add(DecayEvent {
                timestamp: now,
                value: 100.0,
            });
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FacetValueResult {
    pub value: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FacetResult {
    #[serde(rename = "id")]
    pub facet_id: u32,
    pub score: f64,
    pub values: Vec<FacetValueResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub query: String,
    pub score: f64,
    pub facets: Vec<FacetResult>,
}

/// Lowercase and trim a raw query.
pub fn normalize_query(query: &str) -> String {
    query.to_lowercase().trim().to_string()
}

fn by_score_desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Drop every query that merely extends another known query of at least
/// `MIN_PREFIX_LEN` characters.
///
/// Keys are visited longest-first so the outcome does not depend on map
/// iteration order. Removal chains are safe: if the absorbing key is itself
/// an extension of a shorter one, prefix transitivity keeps the invariant.
fn collapse_prefixes(query_events: &mut HashMap<String, QueryMatcher>) {
    let mut keys: Vec<String> = query_events.keys().cloned().collect();
    keys.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then(a.cmp(b)));

    for query in keys {
        let chars: Vec<char> = query.chars().collect();
        if chars.len() <= MIN_PREFIX_LEN {
            continue;
        }
        for j in (MIN_PREFIX_LEN..chars.len()).rev() {
            let prefix: String = chars[..j].iter().collect();
            if query_events.contains_key(&prefix) {
                query_events.remove(&query);
                break;
            }
        }
    }
}

/// Run the full suggestion decay pass: collapse prefixes, decay every
/// popularity, build the ordered result list and prune entries that fell
/// below the internal floor. Returns the new `sorted_queries`.
pub fn decay_suggestions(
    query_events: &mut HashMap<String, QueryMatcher>,
    now: i64,
) -> Vec<QueryResult> {
    collapse_prefixes(query_events);

    let mut result = Vec::with_capacity(query_events.len());

    for (query, matcher) in query_events.iter_mut() {
        matcher.popularity.decay(now);

        let mut facets = Vec::with_capacity(matcher.key_fields.len());
        for (facet_id, key_data) in matcher.key_fields.iter_mut() {
            key_data.field_pop.decay(now);

            let mut values = Vec::with_capacity(key_data.value_pop.len());
            for (value, pop) in key_data.value_pop.iter_mut() {
                pop.decay(now);
                values.push(FacetValueResult {
                    value: value.clone(),
                    score: pop.value,
                });
            }
            values.sort_by(|a, b| by_score_desc(a.score, b.score));

            facets.push(FacetResult {
                facet_id: *facet_id,
                score: key_data.field_pop.value,
                values,
            });

            key_data.value_pop.retain(|_, pop| pop.value >= PRUNE_FLOOR);
        }
        matcher
            .key_fields
            .retain(|_, key_data| key_data.field_pop.value >= PRUNE_FLOOR);

        facets.sort_by(|a, b| by_score_desc(a.score, b.score));

        result.push(QueryResult {
            query: query.clone(),
            score: matcher.popularity.value,
            facets,
        });
    }

    result.sort_by(|a, b| by_score_desc(a.score, b.score));

    query_events.retain(|_, matcher| matcher.popularity.value >= PRUNE_FLOOR);

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher_with_score(now: i64, value: f64) -> QueryMatcher {
        let mut matcher = QueryMatcher::default();
        matcher.popularity.add(DecayEvent {
            timestamp: now,
            value,
        });
        matcher
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("  PhOne  "), "phone");
        assert_eq!(normalize_query(""), "");
    }

    #[test]
    fn test_prefix_collapse_removes_extension() {
        let mut events = HashMap::new();
        events.insert("phone".to_string(), matcher_with_score(100, 40.0));
        events.insert("phones".to_string(), matcher_with_score(100, 20.0));

        let sorted = decay_suggestions(&mut events, 100);

        assert!(events.contains_key("phone"));
        assert!(!events.contains_key("phones"));
        assert_eq!(sorted[0].query, "phone");
    }

    #[test]
    fn test_prefix_collapse_skips_short_prefixes() {
        // "tv" is below the minimum prefix length; "tvs" must survive.
        let mut events = HashMap::new();
        events.insert("tv".to_string(), matcher_with_score(100, 40.0));
        events.insert("tvs".to_string(), matcher_with_score(100, 20.0));

        decay_suggestions(&mut events, 100);

        assert!(events.contains_key("tv"));
        assert!(events.contains_key("tvs"));
    }

    #[test]
    fn test_prefix_collapse_handles_chains() {
        // With "phon", "phone" and "phones" present, only the shortest
        // eligible prefix survives.
        let mut events = HashMap::new();
        events.insert("phon".to_string(), matcher_with_score(100, 10.0));
        events.insert("phone".to_string(), matcher_with_score(100, 10.0));
        events.insert("phones".to_string(), matcher_with_score(100, 10.0));

        decay_suggestions(&mut events, 100);

        let remaining: Vec<&String> = events.keys().collect();
        assert_eq!(remaining, vec![&"phon".to_string()]);
    }

    #[test]
    fn test_results_sorted_by_score_desc() {
        let mut events = HashMap::new();
        events.insert("laptop".to_string(), matcher_with_score(100, 10.0));
        events.insert("monitor".to_string(), matcher_with_score(100, 30.0));
        events.insert("keyboard".to_string(), matcher_with_score(100, 20.0));

        let sorted = decay_suggestions(&mut events, 100);

        let queries: Vec<&str> = sorted.iter().map(|r| r.query.as_str()).collect();
        assert_eq!(queries, vec!["monitor", "keyboard", "laptop"]);
        for pair in sorted.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_facets_and_values_sorted() {
        let mut matcher = matcher_with_score(100, 20.0);
        matcher.add_key_filter_event(1, "red", 100);
        matcher.add_key_filter_event(2, "large", 100);
        matcher.add_key_filter_event(2, "small", 100);

        let mut events = HashMap::new();
        events.insert("shoes".to_string(), matcher);

        let sorted = decay_suggestions(&mut events, 100);
        let facets = &sorted[0].facets;

        // Field 2 got two filter events, field 1 only one.
        assert_eq!(facets[0].facet_id, 2);
        assert_eq!(facets[1].facet_id, 1);
        for facet in facets {
            for pair in facet.values.windows(2) {
                assert!(pair[0].score >= pair[1].score);
            }
        }
    }

    #[test]
    fn test_prune_drops_faded_queries() {
        let mut events = HashMap::new();
        // A sample far beyond the max age decays to exactly zero.
        events.insert(
            "ancient".to_string(),
            matcher_with_score(0, 100.0),
        );
        events.insert(
            "fresh".to_string(),
            matcher_with_score(crate::decay::MAX_AGE + 10, 100.0),
        );

        let sorted = decay_suggestions(&mut events, crate::decay::MAX_AGE + 10);

        // The faded query still appears in this pass's output with a zero
        // score, but is gone from the live map.
        assert_eq!(sorted.len(), 2);
        assert!(!events.contains_key("ancient"));
        assert!(events.contains_key("fresh"));
    }

    #[test]
    fn test_key_filter_event_without_value() {
        let mut matcher = QueryMatcher::default();
        matcher.add_key_filter_event(5, "", 100);
        assert_eq!(matcher.key_fields[&5].value_pop.len(), 0);
        assert_eq!(matcher.key_fields[&5].field_pop.events.len(), 1);
    }
}
