use crate::config::{BothitRecacheConfig, Dimension};
use crate::error::{GatewayError, Result};
use crate::pattern::CompiledPattern;
use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use tracing::debug;

/// Prefix marking an alias reference in a pattern list
pub const ALIAS_PREFIX: char = '$';

/// Maximum alias nesting: a composite alias may reference base aliases, but
/// base aliases must resolve to plain literals
const MAX_ALIAS_DEPTH: usize = 1;

/// How many alias names an unknown-alias error shows before eliding
const ALIAS_HINT_LIMIT: usize = 5;

/// The bot alias table: name to pattern literals. Composite aliases contain
/// entries beginning with `$`.
pub type AliasTable = BTreeMap<&'static str, Vec<&'static str>>;

fn builtin_table() -> AliasTable {
    let mut table = AliasTable::new();

    table.insert(
        "GooglebotSearchDesktop",
        vec![
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
            "Googlebot/2.1 (+http://www.google.com/bot.html)",
            "Googlebot/2.1",
            "Mozilla/5.0 AppleWebKit/537.36 (KHTML, like Gecko; compatible; Googlebot/2.1; +http://www.google.com/bot.html) Chrome/* Safari/537.36",
            "Mozilla/5.0 AppleWebKit/537.36 (KHTML, like Gecko; compatible; Googlebot/2.1; +http://www.google.com/bot.html) Safari/537.36",
        ],
    );
    table.insert(
        "GooglebotSearchMobile",
        vec![
            "Mozilla/5.0 (Linux; Android 6.0.1; Nexus 5X Build/MMB29P) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/* Mobile Safari/537.36 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
            "Mozilla/5.0 (Linux; Android 10; Pixel 4) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/* Mobile Safari/537.36 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
            "Mozilla/5.0 (iPhone; CPU iPhone OS 8_3 like Mac OS X) AppleWebKit/600.1.4 (KHTML, like Gecko) Version/8.0 Mobile/12F70 Safari/600.1.4 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
            "Googlebot/2.1 (Mobile; +http://www.google.com/bot.html)",
        ],
    );
    table.insert(
        "BingbotDesktop",
        vec![
            "Mozilla/5.0 (compatible; bingbot/2.0; +http://www.bing.com/bingbot.htm)",
            "Mozilla/5.0 AppleWebKit/537.36 (KHTML, like Gecko; compatible; bingbot/2.0; +http://www.bing.com/bingbot.htm) Chrome/* Safari/537.36",
            "bingbot/2.0 (+http://www.bing.com/bingbot.htm)",
        ],
    );
    table.insert(
        "BingbotMobile",
        vec![
            "Mozilla/5.0 (Linux; Android 6.0.1; Nexus 5X Build/MMB29P) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/* Mobile Safari/537.36 (compatible; bingbot/2.0; +http://www.bing.com/bingbot.htm)",
            "Mozilla/5.0 (iPhone; CPU iPhone OS 7_0 like Mac OS X) AppleWebKit/537.51.1 (KHTML, like Gecko) Version/7.0 Mobile/11A465 Safari/9537.53 (compatible; bingbot/2.0; +http://www.bing.com/bingbot.htm)",
            "Mozilla/5.0 (Windows Phone 8.1; ARM; Trident/7.0; Touch; rv:11.0; IEMobile/11.0; NOKIA; Lumia 530) like Gecko (compatible; bingbot/2.0; +http://www.bing.com/bingbot.htm)",
            "bingbot/2.0 (Mobile; +http://www.bing.com/bingbot.htm)",
        ],
    );
    table.insert(
        "GoogleBotAds",
        vec!["AdsBot-Google (+http://www.google.com/adsbot.html)"],
    );
    table.insert(
        "GoogleStoreBot",
        vec![
            "Mozilla/5.0 (X11; Linux x86_64; Storebot-Google/1.0) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/* Safari/537.36",
        ],
    );
    table.insert(
        "ChatGPTUserBot",
        vec![
            "Mozilla/5.0 AppleWebKit/537.36 (KHTML, like Gecko); compatible; ChatGPT-User/1.0; +https://openai.com/bot",
        ],
    );
    table.insert(
        "GPTBot",
        vec![
            "Mozilla/5.0 AppleWebKit/537.36 (KHTML, like Gecko; compatible; GPTBot/1.0; +https://openai.com/gptbot)",
        ],
    );
    table.insert(
        "ClaudeBot",
        vec![
            "Mozilla/5.0 AppleWebKit/537.36 (KHTML, like Gecko; compatible; ClaudeBot/1.0; +claudebot@anthropic.com)",
        ],
    );
    table.insert(
        "PerplexityBot",
        vec![
            "Mozilla/5.0 AppleWebKit/537.36 (KHTML, like Gecko; compatible; PerplexityBot/1.0; +https://perplexity.ai/perplexitybot)",
        ],
    );
    table.insert(
        "FacebookBot",
        vec![
            "facebookexternalhit/1.1 (+http://www.facebook.com/externalhit_uatext.php)",
            "facebookexternalhit/1.1",
            "facebookcatalog/1.0",
        ],
    );
    table.insert("TwitterBot", vec!["Twitterbot/1.0"]);
    table.insert(
        "LinkedInBot",
        vec!["LinkedInBot/1.0 (compatible; Mozilla/5.0; Apache-HttpClient +http://www.linkedin.com)"],
    );
    table.insert(
        "SlackBot",
        vec![
            "Slackbot-LinkExpanding 1.0 (+https://api.slack.com/robots)",
            "Slack-ImgProxy (+https://api.slack.com/robots)",
        ],
    );
    table.insert("TelegramBot", vec!["TelegramBot (like TwitterBot)"]);
    table.insert("WhatsAppBot", vec!["WhatsApp/2.*"]);
    table.insert(
        "DuckDuckBot",
        vec![
            "DuckDuckBot/1.0; (+http://duckduckgo.com/duckduckbot.html)",
            "DuckDuckGo-Favicons-Bot/1.0; (+http://duckduckgo.com)",
        ],
    );
    table.insert(
        "YandexBot",
        vec!["Mozilla/5.0 (compatible; YandexBot/3.0; +http://yandex.com/bots)"],
    );
    table.insert(
        "BaiduSpider",
        vec!["Mozilla/5.0 (compatible; Baiduspider/2.0; +http://www.baidu.com/search/spider.html)"],
    );
    table.insert(
        "AppleBot",
        vec![
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko; compatible; Applebot/0.1; +http://www.apple.com/go/applebot)",
        ],
    );

    // Composite aliases: one level of nesting only
    table.insert(
        "SearchBots",
        vec![
            "$GooglebotSearchDesktop",
            "$GooglebotSearchMobile",
            "$BingbotDesktop",
            "$BingbotMobile",
        ],
    );
    table.insert(
        "AiBots",
        vec!["$GPTBot", "$ClaudeBot", "$PerplexityBot", "$ChatGPTUserBot"],
    );
    table.insert(
        "SocialBots",
        vec![
            "$FacebookBot",
            "$TwitterBot",
            "$LinkedInBot",
            "$SlackBot",
            "$TelegramBot",
            "$WhatsAppBot",
        ],
    );

    table
}

static TABLE: Lazy<ArcSwap<AliasTable>> = Lazy::new(|| ArcSwap::from_pointee(builtin_table()));

/// Look up an alias by exact, case-sensitive name (without the `$` prefix)
pub fn alias_patterns(name: &str) -> Option<Vec<String>> {
    TABLE
        .load()
        .get(name)
        .map(|patterns| patterns.iter().map(|p| p.to_string()).collect())
}

/// All registered alias names, sorted ascending
pub fn available_aliases() -> Vec<String> {
    TABLE.load().keys().map(|n| n.to_string()).collect()
}

/// Replace the alias table, returning the previous one so tests can restore
/// it. Tests that swap the table must serialize their own setup/teardown.
#[cfg(any(test, feature = "testing"))]
pub fn swap_alias_table(table: AliasTable) -> std::sync::Arc<AliasTable> {
    TABLE.swap(std::sync::Arc::new(table))
}

/// Restore a table previously returned by `swap_alias_table`
#[cfg(any(test, feature = "testing"))]
pub fn restore_alias_table(table: std::sync::Arc<AliasTable>) {
    TABLE.store(table);
}

/// Expand `$Name` alias references in a pattern list.
///
/// Non-alias entries pass through untouched; order and multiplicity are
/// preserved. Every unknown alias encountered is collected and reported in
/// one error that echoes `context` (file path, host name, rule index).
/// The alias table is loaded once per expansion, so a concurrent swap never
/// produces a mixed view.
pub fn expand_aliases(patterns: &[String], context: &str) -> Result<Vec<String>> {
    let table = TABLE.load();
    expand_aliases_in(&table, patterns, context)
}

fn expand_aliases_in(
    table: &AliasTable,
    patterns: &[String],
    context: &str,
) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(patterns.len());
    let mut unknown = Vec::new();

    expand_level(
        table,
        patterns.iter().map(String::as_str),
        0,
        context,
        &mut out,
        &mut unknown,
    )?;

    if !unknown.is_empty() {
        return Err(unknown_alias_error(table, &unknown, context));
    }
    Ok(out)
}

fn expand_level<'a, I>(
    table: &AliasTable,
    entries: I,
    depth: usize,
    context: &str,
    out: &mut Vec<String>,
    unknown: &mut Vec<String>,
) -> Result<()>
where
    I: Iterator<Item = &'a str>,
{
    for entry in entries {
        let Some(name) = entry.strip_prefix(ALIAS_PREFIX) else {
            out.push(entry.to_string());
            continue;
        };

        if depth > MAX_ALIAS_DEPTH {
            return Err(GatewayError::Reference(format!(
                "alias {entry} in {context} exceeds the maximum nesting depth of {MAX_ALIAS_DEPTH}"
            )));
        }

        match table.get(name) {
            Some(resolved) => {
                expand_level(
                    table,
                    resolved.iter().copied(),
                    depth + 1,
                    context,
                    out,
                    unknown,
                )?;
            }
            None => unknown.push(entry.to_string()),
        }
    }
    Ok(())
}

fn unknown_alias_error(table: &AliasTable, unknown: &[String], context: &str) -> GatewayError {
    let noun = if unknown.len() == 1 { "alias" } else { "aliases" };
    let mut hint = table
        .keys()
        .take(ALIAS_HINT_LIMIT)
        .copied()
        .collect::<Vec<_>>()
        .join(", ");
    if table.len() > ALIAS_HINT_LIMIT {
        hint = format!("{hint} … and {} more", table.len() - ALIAS_HINT_LIMIT);
    }
    GatewayError::Reference(format!(
        "unknown bot {noun} {} in {context}. Available aliases: {hint}",
        unknown.join(", ")
    ))
}

/// Expand and compile `match_ua` on every dimension.
///
/// Dimensions inherited from the global layer arrive already expanded and
/// compiled; callers skip them rather than calling this again.
pub fn expand_dimension_aliases(dimensions: &mut [Dimension], config_path: &str) -> Result<()> {
    for dimension in dimensions.iter_mut() {
        let context = format!("{config_path}:dimension[{}]", dimension.id);
        dimension.match_ua = expand_aliases(&dimension.match_ua, &context)?;
        dimension.compiled = compile_ua_patterns(&dimension.match_ua, &context)?;
        debug!(
            dimension = %dimension.id,
            patterns = dimension.match_ua.len(),
            "Expanded dimension user-agent patterns"
        );
    }
    Ok(())
}

/// Expand and compile `match_ua` on a bot-hit recache section, preserving
/// the absent/empty distinction
pub fn expand_bothit_aliases(config: &mut BothitRecacheConfig, context: &str) -> Result<()> {
    let Some(match_ua) = &config.match_ua else {
        return Ok(());
    };
    let expanded = expand_aliases(match_ua, context)?;
    config.compiled = compile_ua_patterns(&expanded, context)?;
    config.match_ua = Some(expanded);
    Ok(())
}

/// Compile a list of user-agent pattern literals, 1:1
pub fn compile_ua_patterns(patterns: &[String], context: &str) -> Result<Vec<CompiledPattern>> {
    patterns
        .iter()
        .map(|p| {
            CompiledPattern::compile(p).map_err(|e| {
                GatewayError::Pattern(format!("{e} (in {context})"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests that rewrite the alias table must not interleave
    static TABLE_LOCK: Mutex<()> = Mutex::new(());

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_lookup_is_case_sensitive() {
        assert!(alias_patterns("GoogleBotAds").is_some());
        assert!(alias_patterns("googlebotads").is_none());
    }

    #[test]
    fn test_available_is_sorted() {
        let names = available_aliases();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.len() > ALIAS_HINT_LIMIT);
    }

    #[test]
    fn test_expand_preserves_custom_patterns() {
        let input = strings(&[
            "*CustomBot*",
            "$GoogleBotAds",
            "Mozilla/5.0 (custom pattern)",
        ]);
        let out = expand_aliases(&input, "test").unwrap();
        assert_eq!(
            out,
            strings(&[
                "*CustomBot*",
                "AdsBot-Google (+http://www.google.com/adsbot.html)",
                "Mozilla/5.0 (custom pattern)",
            ])
        );
    }

    #[test]
    fn test_composite_alias_expands_to_sixteen() {
        let out = expand_aliases(&strings(&["$SearchBots"]), "test").unwrap();
        assert_eq!(out.len(), 16);
        assert!(out.iter().all(|p| !p.starts_with(ALIAS_PREFIX)));
    }

    #[test]
    fn test_expand_is_idempotent() {
        let input = strings(&["$SearchBots", "*Custom*"]);
        let once = expand_aliases(&input, "test").unwrap();
        let twice = expand_aliases(&once, "test").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_input_stays_empty() {
        let out = expand_aliases(&[], "test").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_unknown_alias_error_lists_all() {
        let input = strings(&["$NoSuchBot", "literal", "$AlsoMissing"]);
        let err = expand_aliases(&input, "hosts/shop.yaml:host_id=shop").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("aliases $NoSuchBot, $AlsoMissing"), "{msg}");
        assert!(msg.contains("hosts/shop.yaml:host_id=shop"), "{msg}");
        assert!(msg.contains("Available aliases:"), "{msg}");
        assert!(msg.contains("… and"), "{msg}");
    }

    #[test]
    fn test_unknown_alias_singular_wording() {
        let err = expand_aliases(&strings(&["$Nope"]), "ctx").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unknown bot alias $Nope"), "{msg}");
        assert!(!msg.contains("aliases $Nope"), "{msg}");
    }

    #[test]
    fn test_nesting_depth_two_is_refused() {
        // A private table keeps this scenario away from the process-wide one
        let mut table = AliasTable::new();
        table.insert("Deep", vec!["$Mid"]);
        table.insert("Mid", vec!["$Base"]);
        table.insert("Base", vec!["literal-ua"]);

        let err = expand_aliases_in(&table, &strings(&["$Deep"]), "test").unwrap_err();
        assert!(err.to_string().contains("nesting depth"), "{err}");

        // One level of nesting stays fine
        let out = expand_aliases_in(&table, &strings(&["$Mid"]), "test").unwrap();
        assert_eq!(out, strings(&["literal-ua"]));
    }

    #[test]
    fn test_swapped_table_is_visible_and_restorable() {
        let _guard = TABLE_LOCK.lock().unwrap();
        // Extend rather than replace so concurrent tests reading built-in
        // aliases keep working while the swap is in effect
        let mut table = builtin_table();
        table.insert("OnlyBot", vec!["only-ua"]);
        let previous = swap_alias_table(table);

        assert_eq!(alias_patterns("OnlyBot"), Some(vec!["only-ua".to_string()]));
        assert!(alias_patterns("GoogleBotAds").is_some());

        restore_alias_table(previous);
        assert!(alias_patterns("OnlyBot").is_none());
    }

    #[test]
    fn test_expand_bothit_preserves_absent_list() {
        let mut config = BothitRecacheConfig::default();
        expand_bothit_aliases(&mut config, "test").unwrap();
        assert!(config.match_ua.is_none());
        assert!(config.compiled.is_empty());
    }

    #[test]
    fn test_expand_bothit_compiles_patterns() {
        let mut config = BothitRecacheConfig {
            match_ua: Some(strings(&["$GoogleBotAds", "*Probe*"])),
            ..Default::default()
        };
        expand_bothit_aliases(&mut config, "test").unwrap();
        let expanded = config.match_ua.unwrap();
        assert_eq!(expanded.len(), 2);
        assert_eq!(config.compiled.len(), 2);
        assert!(config.compiled[1].matches("internal Probe agent"));
    }
}
