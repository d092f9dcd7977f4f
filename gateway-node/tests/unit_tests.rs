//! Unit tests for the gateway node configuration subsystem
//!
//! This module exercises the public surface of the major components:
//! - Pattern compilation and wildcard matching
//! - Bot alias expansion, composites included
//! - URL-rule sorting and dispatch
//! - Tracking-parameter compilation and redundancy detection

use gateway_node::bots::{available_aliases, expand_aliases};
use gateway_node::config::UrlRule;
use gateway_node::pattern::{match_wildcard, CompiledPattern, PatternType};
use gateway_node::rules::{find_matching_rule, sort_url_rules};
use gateway_node::tracking::{
    compile_strip_patterns, find_redundant_patterns, should_strip_param,
};
use proptest::prelude::*;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn rule_from_yaml(yaml: &str) -> UrlRule {
    serde_yaml::from_str(yaml).expect("test rule yaml")
}

/// Test alias expansion behavior against the built-in registry
#[cfg(test)]
mod alias_tests {
    use super::*;

    #[test]
    fn test_custom_patterns_survive_expansion() {
        let input = strings(&[
            "*CustomBot*",
            "$GoogleBotAds",
            "Mozilla/5.0 (custom pattern)",
        ]);
        let out = expand_aliases(&input, "unit").unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0], "*CustomBot*");
        assert_eq!(out[1], "AdsBot-Google (+http://www.google.com/adsbot.html)");
        assert_eq!(out[2], "Mozilla/5.0 (custom pattern)");
    }

    #[test]
    fn test_search_bots_composite_counts() {
        let composite = expand_aliases(&strings(&["$SearchBots"]), "unit").unwrap();
        assert_eq!(composite.len(), 16);

        let google_desktop =
            expand_aliases(&strings(&["$GooglebotSearchDesktop"]), "unit").unwrap();
        let google_mobile = expand_aliases(&strings(&["$GooglebotSearchMobile"]), "unit").unwrap();
        let bing_desktop = expand_aliases(&strings(&["$BingbotDesktop"]), "unit").unwrap();
        let bing_mobile = expand_aliases(&strings(&["$BingbotMobile"]), "unit").unwrap();
        assert_eq!(google_desktop.len(), 5);
        assert_eq!(google_mobile.len(), 4);
        assert_eq!(bing_desktop.len(), 3);
        assert_eq!(bing_mobile.len(), 4);

        let mut concatenated = google_desktop;
        concatenated.extend(google_mobile);
        concatenated.extend(bing_desktop);
        concatenated.extend(bing_mobile);
        assert_eq!(composite, concatenated);
    }

    #[test]
    fn test_every_registered_alias_expands_cleanly() {
        for name in available_aliases() {
            let out = expand_aliases(&strings(&[&format!("${name}")]), "unit").unwrap();
            assert!(!out.is_empty(), "alias {name} expanded to nothing");
            assert!(
                out.iter().all(|p| !p.starts_with('$')),
                "alias {name} left unexpanded references"
            );
        }
    }

    #[test]
    fn test_error_hint_is_sorted_and_limited() {
        let err = expand_aliases(&strings(&["$Bogus"]), "unit").unwrap_err();
        let msg = err.to_string();
        let names = available_aliases();
        let expected_hint = names[..5].join(", ");
        assert!(msg.contains(&expected_hint), "{msg}");
        assert!(
            msg.contains(&format!("… and {} more", names.len() - 5)),
            "{msg}"
        );
    }
}

/// Test the pattern compiler across all three dialects
#[cfg(test)]
mod pattern_tests {
    use super::*;

    #[test]
    fn test_dialect_dispatch() {
        assert_eq!(
            CompiledPattern::compile("/exact").unwrap().kind(),
            PatternType::Exact
        );
        assert_eq!(
            CompiledPattern::compile("/wild/*").unwrap().kind(),
            PatternType::Wildcard
        );
        assert_eq!(
            CompiledPattern::compile("~^/re").unwrap().kind(),
            PatternType::Regexp
        );
        assert_eq!(
            CompiledPattern::compile("~*^/re").unwrap().kind(),
            PatternType::Regexp
        );
    }

    #[test]
    fn test_regexp_case_flags_differ() {
        let sensitive = CompiledPattern::compile("~^/Admin").unwrap();
        let insensitive = CompiledPattern::compile("~*^/Admin").unwrap();
        assert!(!sensitive.matches("/admin/panel"));
        assert!(insensitive.matches("/admin/panel"));
    }

    proptest! {
        /// Compilation is pure: two compilations of the same literal agree
        /// on every input
        #[test]
        fn prop_compile_deterministic(
            pattern_index in 0usize..6,
            text in "[a-zA-Z0-9/_.]{0,24}",
        ) {
            let pool = [
                "/api/*", "*.pdf", "/exact/path", "~^/v[0-9]+", "~*bot", "*",
            ];
            let literal = pool[pattern_index];
            let first = CompiledPattern::compile(literal).unwrap();
            let second = CompiledPattern::compile(literal).unwrap();
            prop_assert_eq!(first.matches(&text), second.matches(&text));
            prop_assert_eq!(first.matches(&text), first.matches(&text));
        }

        /// The iterative wildcard matcher agrees with a naive recursive
        /// reference implementation
        #[test]
        fn prop_wildcard_matches_reference(
            text in "[abc/.]{0,10}",
            pattern in "[abc/.*]{0,8}",
        ) {
            let t: Vec<char> = text.chars().collect();
            let p: Vec<char> = pattern.chars().collect();
            prop_assert_eq!(
                match_wildcard(&text, &pattern),
                reference_wildcard(&t, &p)
            );
        }
    }

    fn reference_wildcard(text: &[char], pattern: &[char]) -> bool {
        match pattern.split_first() {
            None => text.is_empty(),
            Some(('*', rest)) => (0..=text.len()).any(|i| reference_wildcard(&text[i..], rest)),
            Some((c, rest)) => text
                .split_first()
                .map_or(false, |(tc, trest)| tc == c && reference_wildcard(trest, rest)),
        }
    }
}

/// Test specificity sorting and first-match dispatch
#[cfg(test)]
mod rule_tests {
    use super::*;

    fn simple_rule(pattern: &str) -> UrlRule {
        rule_from_yaml(&format!("match: \"{pattern}\"\naction: render\n"))
    }

    #[test]
    fn test_specificity_sort_scenario() {
        let rules = vec![
            simple_rule("/api/*"),
            simple_rule("/"),
            simple_rule("~/api/v[0-9]+/.*"),
            simple_rule("/api/v1/users"),
            simple_rule("*.pdf"),
        ];
        let sorted = sort_url_rules(&rules, "unit").unwrap();
        let order: Vec<&str> = sorted.iter().map(|r| r.match_patterns[0].as_str()).collect();
        assert_eq!(
            order,
            vec!["/api/v1/users", "/", "/api/*", "*.pdf", "~/api/v[0-9]+/.*"]
        );
    }

    #[test]
    fn test_matcher_picks_minimal_tuple() {
        // Every rule matches /api/v1/users; the sorted winner must be the
        // most specific
        let rules = vec![
            simple_rule("~.*"),
            simple_rule("/api/*"),
            simple_rule("/api/v1/users"),
            simple_rule("*users"),
        ];
        let sorted = sort_url_rules(&rules, "unit").unwrap();
        let (winner, index) =
            find_matching_rule(&sorted, "https://example.com/api/v1/users").unwrap();
        assert_eq!(index, 0);
        assert_eq!(winner.match_patterns[0], "/api/v1/users");
    }

    #[test]
    fn test_query_predicate_scenario() {
        let rule = rule_from_yaml(
            "match: /products\naction: render\nmatch_query:\n  category: [electronics, computers]\n  sort: \"~(price|name|rating)\"\n",
        );
        let sorted = sort_url_rules(&[rule], "unit").unwrap();

        assert!(find_matching_rule(&sorted, "/products?category=electronics&sort=price").is_some());
        assert!(find_matching_rule(&sorted, "/products?category=electronics&sort=date").is_none());
        assert!(find_matching_rule(&sorted, "/products?category=books&sort=price").is_none());
    }

    proptest! {
        /// Sorting an already-sorted list changes nothing
        #[test]
        fn prop_sort_idempotent(indices in proptest::collection::vec(0usize..7, 1..12)) {
            let pool = [
                "/", "/api/*", "/api/v1/users", "*.pdf", "~/api/v[0-9]+/.*",
                "/blog/archive", "*",
            ];
            let rules: Vec<UrlRule> =
                indices.iter().map(|i| simple_rule(pool[*i])).collect();

            let once = sort_url_rules(&rules, "prop").unwrap();
            let twice = sort_url_rules(&once, "prop").unwrap();

            let first: Vec<&str> = once.iter().map(|r| r.match_patterns[0].as_str()).collect();
            let second: Vec<&str> = twice.iter().map(|r| r.match_patterns[0].as_str()).collect();
            prop_assert_eq!(first, second);
        }

        /// Expansion is idempotent: a fully expanded list contains no
        /// further references to registered aliases
        #[test]
        fn prop_expand_idempotent(picks in proptest::collection::vec(0usize..5, 0..6)) {
            let pool = [
                "$SearchBots", "$GoogleBotAds", "*CustomBot*", "plain-ua", "$AiBots",
            ];
            let input: Vec<String> = picks.iter().map(|i| pool[*i].to_string()).collect();

            let once = expand_aliases(&input, "prop").unwrap();
            let twice = expand_aliases(&once, "prop").unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}

/// Test tracking-parameter stripping support
#[cfg(test)]
mod tracking_tests {
    use super::*;

    #[test]
    fn test_strip_decisions() {
        let compiled = compile_strip_patterns(&strings(&["utm_*", "gclid", "~^ref_"])).unwrap();
        assert!(should_strip_param("utm_source", &compiled));
        assert!(should_strip_param("GCLID", &compiled));
        assert!(should_strip_param("ref_src", &compiled));
        assert!(!should_strip_param("q", &compiled));
    }

    #[test]
    fn test_redundancy_detection_is_a_warning_shape() {
        let redundant = find_redundant_patterns(&strings(&["utm_*", "utm_source", "gclid"]));
        assert_eq!(redundant.len(), 1);
        assert_eq!(redundant[0].pattern, "utm_source");
        assert_eq!(redundant[0].covered_by, "utm_*");
    }
}
