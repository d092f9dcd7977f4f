use crate::config::{StringOrSeq, UrlRule};
use crate::error::{GatewayError, Result};
use crate::pattern::CompiledPattern;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use url::Url;

/// Compile the materialized pattern fields of a rule: the (single) path
/// pattern and the query predicate.
pub fn compile_rule_patterns(rule: &mut UrlRule, context: &str) -> Result<()> {
    rule.compiled_patterns = rule
        .match_patterns
        .iter()
        .map(|p| {
            CompiledPattern::compile(p)
                .map_err(|e| GatewayError::Pattern(format!("{e} (in {context})")))
        })
        .collect::<Result<Vec<_>>>()?;

    rule.query_params = BTreeMap::new();
    if let Some(match_query) = &rule.match_query {
        for (name, values) in match_query {
            let compiled = values
                .iter()
                .map(|v| {
                    CompiledPattern::compile(v).map_err(|e| {
                        GatewayError::Pattern(format!("{e} (in {context}:match_query[{name}])"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            rule.query_params.insert(name.clone(), compiled);
        }
    }
    Ok(())
}

/// Expand multi-pattern rules into single-pattern copies, compile them, and
/// sort by specificity.
///
/// Returns a new list; the input is never mutated. A pattern that fails to
/// compile is fatal so that a mistyped block rule can never be dropped
/// silently.
///
/// Sort keys, most significant first: pattern type (exact over wildcard
/// over regexp), query-predicate presence, slash count of the
/// prefix-stripped pattern descending, declaration order. The sort is
/// stable, so declaration order breaks every remaining tie.
pub fn sort_url_rules(rules: &[UrlRule], context: &str) -> Result<Vec<UrlRule>> {
    let mut expanded = Vec::with_capacity(rules.len());

    for (index, rule) in rules.iter().enumerate() {
        let patterns = rule.match_spec.to_vec();
        if patterns.is_empty() {
            return Err(GatewayError::Config(format!(
                "{context}:url_rule[{index}] has no match patterns"
            )));
        }
        for pattern in patterns {
            let mut copy = rule.clone();
            copy.match_spec = StringOrSeq::One(pattern.clone());
            copy.match_patterns = vec![pattern];
            copy.source_index = index;
            compile_rule_patterns(&mut copy, &format!("{context}:url_rule[{index}]"))?;
            expanded.push(copy);
        }
    }

    expanded.sort_by(compare_rules);
    Ok(expanded)
}

fn rule_priority(rule: &UrlRule) -> u8 {
    rule.compiled_patterns
        .first()
        .map(|p| p.kind().priority())
        .unwrap_or(0)
}

fn rule_slash_count(rule: &UrlRule) -> usize {
    rule.compiled_patterns
        .first()
        .map(|p| p.slash_count())
        .unwrap_or(0)
}

fn compare_rules(a: &UrlRule, b: &UrlRule) -> Ordering {
    rule_priority(b)
        .cmp(&rule_priority(a))
        .then_with(|| {
            let a_query = !a.query_params.is_empty();
            let b_query = !b.query_params.is_empty();
            b_query.cmp(&a_query)
        })
        .then_with(|| rule_slash_count(b).cmp(&rule_slash_count(a)))
        .then_with(|| a.source_index.cmp(&b.source_index))
}

/// Find the first rule matching a target URL, in sorted specificity order.
///
/// Only the URL path participates in pattern matching; the query string is
/// evaluated separately through the rule's query predicate, and the
/// fragment is ignored. A target that fails to parse is a miss.
pub fn find_matching_rule<'a>(rules: &'a [UrlRule], target: &str) -> Option<(&'a UrlRule, usize)> {
    let url = parse_target(target)?;
    let path = url.path();
    let query = first_value_query(&url);

    for (index, rule) in rules.iter().enumerate() {
        if !rule.compiled_patterns.iter().any(|p| p.matches(path)) {
            continue;
        }
        if rule.query_params.is_empty() || query_predicate_matches(&rule.query_params, &query) {
            return Some((rule, index));
        }
    }
    None
}

fn parse_target(target: &str) -> Option<Url> {
    match Url::parse(target) {
        Ok(url) if url.cannot_be_a_base() => None,
        Ok(url) => Some(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = Url::parse("http://gateway.invalid").ok()?;
            base.join(target).ok()
        }
        Err(_) => None,
    }
}

/// Query parameters with origin-server semantics: the first value of a
/// repeated name wins.
fn first_value_query(url: &Url) -> BTreeMap<String, String> {
    let mut query = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        query.entry(name.into_owned()).or_insert_with(|| value.into_owned());
    }
    query
}

/// AND over parameter names, OR over the listed values of one name. A lone
/// `*` requires the key to exist with a non-empty value; every other
/// pattern matches normally (a regexp `.*` does match empty).
fn query_predicate_matches(
    predicate: &BTreeMap<String, Vec<CompiledPattern>>,
    query: &BTreeMap<String, String>,
) -> bool {
    predicate.iter().all(|(name, patterns)| {
        let Some(value) = query.get(name) else {
            return false;
        };
        patterns.iter().any(|p| {
            if p.is_match_all() {
                !value.is_empty()
            } else {
                p.matches(value)
            }
        })
    })
}
