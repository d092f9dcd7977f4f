use crate::config::{
    CompressionAlgorithm, Dimension, ExpiredCacheConfig, GatewayConfig, Host, RuleAction,
    SelectionStrategy, ShardingStrategy, UrlRule, WaitEvent,
    DEFAULT_BOTHIT_RECACHE_INTERVAL_SECONDS, DEFAULT_BYPASS_TIMEOUT_SECONDS,
    DEFAULT_CACHE_STATUSES, DEFAULT_CACHE_TTL_SECONDS, DEFAULT_RENDER_TIMEOUT_SECONDS,
    DEFAULT_SAFE_RESPONSE_HEADERS, DEFAULT_UNMATCHED_DIMENSION,
};
use crate::pattern::CompiledPattern;
use crate::rules::find_matching_rule;
use crate::tracking::{compile_strip_patterns, should_strip_param, DEFAULT_TRACKING_PARAMS};
use metrics::counter;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Synthetic status response settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStatus {
    pub code: u16,
    pub reason: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Rendered-artifact cache settings, present only for render actions with
/// caching enabled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCache {
    pub ttl: Duration,
    pub statuses: Vec<u16>,
    pub expired: Option<ExpiredCacheConfig>,
}

/// Render settings after all layers are folded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRender {
    pub timeout: Duration,
    pub wait_for: WaitEvent,
    pub additional_wait: Duration,
    pub unmatched_dimension: String,
    pub strip_scripts: bool,
    pub blocked_patterns: Vec<String>,
    pub blocked_resource_types: Vec<String>,
}

/// Bypass-path cache settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBypassCache {
    pub enabled: bool,
    pub ttl: Duration,
}

/// Origin bypass settings after all layers are folded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBypass {
    pub timeout: Duration,
    pub forward_cookies: bool,
    pub follow_redirects: bool,
    pub cache: ResolvedBypassCache,
}

/// Tracking-parameter stripping, present only when stripping is active
#[derive(Debug, Clone)]
pub struct ResolvedTrackingParams {
    pub patterns: Vec<String>,
    pub compiled: Vec<CompiledPattern>,
}

impl ResolvedTrackingParams {
    /// Rewrite an absolute URL, dropping every query parameter the strip
    /// list matches. A target that does not parse, or from which nothing is
    /// stripped, comes back unchanged.
    pub fn strip_from_url(&self, target: &str) -> String {
        let Ok(mut url) = url::Url::parse(target) else {
            return target.to_string();
        };
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        let kept: Vec<(String, String)> = pairs
            .iter()
            .filter(|(name, _)| !should_strip_param(name, &self.compiled))
            .cloned()
            .collect();
        if kept.len() == pairs.len() {
            return target.to_string();
        }
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }
        url.into()
    }
}

/// Cache sharding settings after all layers are folded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSharding {
    pub enabled: bool,
    pub replication_factor: u32,
    pub strategy: ShardingStrategy,
    pub push_on_render: bool,
    pub replicate_on_pull: bool,
}

/// Bot-hit recache settings after all layers are folded
#[derive(Debug, Clone)]
pub struct ResolvedBothitRecache {
    pub enabled: bool,
    pub interval: Duration,
    pub match_ua: Vec<String>,
    pub compiled: Vec<CompiledPattern>,
}

impl ResolvedBothitRecache {
    /// True when a hit from this user-agent is eligible to trigger a
    /// re-render of the cached artifact
    pub fn matches_user_agent(&self, user_agent: &str) -> bool {
        self.enabled && self.compiled.iter().any(|p| p.matches(user_agent))
    }
}

/// The per-request decision record.
///
/// Produced once per URL by [`ConfigResolver::resolve_for_url`] and never
/// mutated afterwards; the orchestrator consumes it as-is.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub action: RuleAction,
    pub status: Option<ResolvedStatus>,
    pub cache: Option<ResolvedCache>,
    pub render: ResolvedRender,
    pub bypass: ResolvedBypass,
    pub tracking_params: Option<ResolvedTrackingParams>,
    pub sharding: ResolvedSharding,
    pub bothit_recache: ResolvedBothitRecache,
    pub safe_request_headers: Vec<String>,
    pub safe_response_headers: Vec<String>,
    pub matched_rule_id: Option<String>,
    pub matched_pattern: Option<String>,
    pub compression: CompressionAlgorithm,
}

/// Per-host configuration resolver.
///
/// Holds the global config and one prepared host from the same snapshot;
/// the host's sorted rules and compiled patterns serve as the matcher.
/// Resolution is CPU-only, reads but never mutates the shared state, and
/// is cheap enough to construct per request or cache per host.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    config: Arc<GatewayConfig>,
    host: Arc<Host>,
}

impl ConfigResolver {
    pub fn new(config: Arc<GatewayConfig>, host: Arc<Host>) -> Self {
        Self { config, host }
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Resolve the decision record for one request URL.
    ///
    /// A URL no rule matches resolves to the render action with pure
    /// layered defaults. This never fails: a malformed URL is simply a
    /// rule miss.
    pub fn resolve_for_url(&self, target: &str) -> ResolvedConfig {
        let matched = find_matching_rule(&self.host.url_rules, target);
        let rule = matched.map(|(rule, _)| rule);

        let action = rule.map(|r| r.action).unwrap_or_default();
        let (matched_rule_id, matched_pattern) = match matched {
            Some((rule, index)) => {
                counter!("gateway_url_rule_hits_total", 1);
                let pattern = rule
                    .match_patterns
                    .first()
                    .cloned()
                    .unwrap_or_default();
                let mut id = format!("rule_{index}:{pattern}");
                if !rule.query_params.is_empty() {
                    id.push_str("[?...]");
                }
                (Some(id), Some(pattern))
            }
            None => {
                counter!("gateway_url_rule_misses_total", 1);
                (None, None)
            }
        };
        counter!("gateway_config_resolutions_total", 1, "action" => action_label(action));

        ResolvedConfig {
            action,
            status: self.resolve_status(action, rule),
            cache: self.resolve_cache(action, rule),
            render: self.resolve_render(rule),
            bypass: self.resolve_bypass(rule),
            tracking_params: self.resolve_tracking_params(rule),
            sharding: self.resolve_sharding(rule),
            bothit_recache: self.resolve_bothit_recache(rule),
            safe_request_headers: self.resolve_headers(rule, HeaderKind::Request),
            safe_response_headers: self.resolve_headers(rule, HeaderKind::Response),
            matched_rule_id,
            matched_pattern,
            compression: self.config.server.compression,
        }
    }

    fn resolve_status(&self, action: RuleAction, rule: Option<&UrlRule>) -> Option<ResolvedStatus> {
        if !action.is_status_family() {
            return None;
        }
        let override_ = rule.and_then(|r| r.status.as_ref());
        // Load validation guarantees a code for the bare status action
        let code = override_
            .and_then(|s| s.code)
            .or_else(|| action.implied_status_code())
            .unwrap_or(500);
        Some(ResolvedStatus {
            code,
            reason: override_.and_then(|s| s.reason.clone()),
            headers: override_
                .and_then(|s| s.headers.clone())
                .unwrap_or_default(),
        })
    }

    fn resolve_cache(&self, action: RuleAction, rule: Option<&UrlRule>) -> Option<ResolvedCache> {
        if action != RuleAction::Render {
            return None;
        }

        let mut enabled = true;
        let mut ttl = DEFAULT_CACHE_TTL_SECONDS;
        let mut statuses: Vec<u16> = DEFAULT_CACHE_STATUSES.to_vec();
        let mut expired: Option<ExpiredCacheConfig> = None;

        let layers = [
            self.config.render.cache.as_ref(),
            self.host.render.cache.as_ref(),
            rule.and_then(|r| r.render.as_ref()).and_then(|r| r.cache.as_ref()),
        ];
        for layer in layers.into_iter().flatten() {
            if let Some(value) = layer.enabled {
                enabled = value;
            }
            if let Some(value) = layer.ttl_seconds {
                ttl = value;
            }
            if let Some(value) = &layer.statuses {
                statuses = value.clone();
            }
            // The expired sub-struct is replaced whole, never field-merged
            if let Some(value) = &layer.expired {
                expired = Some(value.clone());
            }
        }

        if !enabled {
            return None;
        }
        Some(ResolvedCache {
            ttl: Duration::from_secs(ttl),
            statuses,
            expired,
        })
    }

    fn resolve_render(&self, rule: Option<&UrlRule>) -> ResolvedRender {
        let global = &self.config.render;
        let host = &self.host.render;
        let override_ = rule.and_then(|r| r.render.as_ref());

        let mut timeout = if host.timeout_seconds > 0 {
            host.timeout_seconds
        } else if global.timeout_seconds > 0 {
            global.timeout_seconds
        } else {
            DEFAULT_RENDER_TIMEOUT_SECONDS
        };
        if let Some(value) = override_.and_then(|o| o.timeout_seconds).filter(|v| *v > 0) {
            timeout = value;
        }

        // Host events were inherited field-wise at preparation time;
        // additional wait merges on non-zero, wait_for on presence
        let wait_for = override_
            .and_then(|o| o.events.wait_for)
            .or(host.events.wait_for)
            .or(global.events.wait_for)
            .unwrap_or(WaitEvent::NetworkIdle);
        let additional_wait_ms = override_
            .and_then(|o| o.events.additional_wait_ms)
            .filter(|v| *v > 0)
            .or(host.events.additional_wait_ms.filter(|v| *v > 0))
            .or(global.events.additional_wait_ms.filter(|v| *v > 0))
            .unwrap_or(0);

        let mut unmatched_dimension = DEFAULT_UNMATCHED_DIMENSION.to_string();
        for candidate in [
            Some(global.unmatched_dimension.as_str()),
            Some(host.unmatched_dimension.as_str()),
            override_.and_then(|o| o.unmatched_dimension.as_deref()),
        ]
        .into_iter()
        .flatten()
        {
            if !candidate.is_empty() {
                unmatched_dimension = candidate.to_string();
            }
        }

        let strip_scripts = override_
            .and_then(|o| o.strip_scripts)
            .or(host.strip_scripts)
            .or(global.strip_scripts)
            .unwrap_or(true);

        // Replacement semantics: a non-empty child list supplants the
        // parent list entirely
        let mut blocked_patterns = global.blocked_patterns.clone();
        if !host.blocked_patterns.is_empty() {
            blocked_patterns = host.blocked_patterns.clone();
        }
        if let Some(value) = override_.and_then(|o| o.blocked_patterns.as_ref()) {
            if !value.is_empty() {
                blocked_patterns = value.clone();
            }
        }

        let mut blocked_resource_types = global.blocked_resource_types.clone();
        if !host.blocked_resource_types.is_empty() {
            blocked_resource_types = host.blocked_resource_types.clone();
        }
        if let Some(value) = override_.and_then(|o| o.blocked_resource_types.as_ref()) {
            if !value.is_empty() {
                blocked_resource_types = value.clone();
            }
        }

        ResolvedRender {
            timeout: Duration::from_secs(timeout),
            wait_for,
            additional_wait: Duration::from_millis(additional_wait_ms),
            unmatched_dimension,
            strip_scripts,
            blocked_patterns,
            blocked_resource_types,
        }
    }

    fn resolve_bypass(&self, rule: Option<&UrlRule>) -> ResolvedBypass {
        let layers = [
            self.config.bypass.as_ref(),
            self.host.bypass.as_ref(),
            rule.and_then(|r| r.bypass.as_ref()),
        ];

        let mut timeout = DEFAULT_BYPASS_TIMEOUT_SECONDS;
        let mut forward_cookies = false;
        let mut follow_redirects = true;
        let mut cache_enabled = false;
        let mut cache_ttl = 0;

        for layer in layers.into_iter().flatten() {
            if let Some(value) = layer.timeout_seconds {
                timeout = value;
            }
            if let Some(value) = layer.forward_cookies {
                forward_cookies = value;
            }
            if let Some(value) = layer.follow_redirects {
                follow_redirects = value;
            }
            if let Some(cache) = &layer.cache {
                if let Some(value) = cache.enabled {
                    cache_enabled = value;
                }
                if let Some(value) = cache.ttl_seconds {
                    cache_ttl = value;
                }
            }
        }

        ResolvedBypass {
            timeout: Duration::from_secs(timeout),
            forward_cookies,
            follow_redirects,
            cache: ResolvedBypassCache {
                enabled: cache_enabled,
                ttl: Duration::from_secs(cache_ttl),
            },
        }
    }

    fn resolve_tracking_params(&self, rule: Option<&UrlRule>) -> Option<ResolvedTrackingParams> {
        let mut strip = true;
        let mut params: Vec<String> = DEFAULT_TRACKING_PARAMS
            .iter()
            .map(|p| p.to_string())
            .collect();

        let layers = [
            self.config.tracking_params.as_ref(),
            self.host.tracking_params.as_ref(),
            rule.and_then(|r| r.tracking_params.as_ref()),
        ];
        for layer in layers.into_iter().flatten() {
            if let Some(value) = layer.strip {
                strip = value;
            }
            // A provided list replaces the inherited one entirely; an
            // explicitly empty list therefore disables stripping
            if let Some(value) = &layer.params {
                params = value.clone();
            }
            if let Some(extra) = &layer.params_add {
                params.extend(extra.iter().cloned());
            }
        }

        if !strip || params.iter().all(|p| p.is_empty()) {
            return None;
        }

        match compile_strip_patterns(&params) {
            Ok(compiled) => Some(ResolvedTrackingParams { patterns: params, compiled }),
            Err(e) => {
                // Load validation compiles every layer, so this is not
                // reachable from file-sourced config
                warn!(error = %e, "tracking-params pattern failed to compile; stripping disabled");
                None
            }
        }
    }

    fn resolve_sharding(&self, rule: Option<&UrlRule>) -> ResolvedSharding {
        let mut resolved = ResolvedSharding {
            enabled: false,
            replication_factor: 2,
            strategy: ShardingStrategy::HashModulo,
            push_on_render: true,
            replicate_on_pull: true,
        };

        let layers = [
            self.config.cache_sharding.as_ref(),
            self.host.cache_sharding.as_ref(),
            rule.and_then(|r| r.cache_sharding.as_ref()),
        ];
        for layer in layers.into_iter().flatten() {
            if let Some(value) = layer.enabled {
                resolved.enabled = value;
            }
            if let Some(value) = layer.replication_factor {
                resolved.replication_factor = value;
            }
            if let Some(value) = layer.strategy {
                resolved.strategy = value;
            }
            if let Some(value) = layer.push_on_render {
                resolved.push_on_render = value;
            }
            if let Some(value) = layer.replicate_on_pull {
                resolved.replicate_on_pull = value;
            }
        }
        resolved
    }

    fn resolve_bothit_recache(&self, rule: Option<&UrlRule>) -> ResolvedBothitRecache {
        let mut enabled = false;
        let mut interval = DEFAULT_BOTHIT_RECACHE_INTERVAL_SECONDS;
        let mut match_ua: Vec<String> = Vec::new();
        let mut compiled: Vec<CompiledPattern> = Vec::new();

        let layers = [
            self.config.bothit_recache.as_ref(),
            self.host.bothit_recache.as_ref(),
            rule.and_then(|r| r.bothit_recache.as_ref()),
        ];
        for layer in layers.into_iter().flatten() {
            if let Some(value) = layer.enabled {
                enabled = value;
            }
            if let Some(value) = layer.interval_seconds {
                interval = value;
            }
            // The pattern list is replaced whole by the last layer that
            // provides a non-empty one; compiled patterns follow it
            if let Some(value) = &layer.match_ua {
                if !value.is_empty() {
                    match_ua = value.clone();
                    compiled = layer.compiled.clone();
                }
            }
        }

        ResolvedBothitRecache {
            enabled,
            interval: Duration::from_secs(interval),
            match_ua,
            compiled,
        }
    }

    fn resolve_headers(&self, rule: Option<&UrlRule>, kind: HeaderKind) -> Vec<String> {
        let mut headers: Vec<String> = match kind {
            HeaderKind::Request => Vec::new(),
            HeaderKind::Response => DEFAULT_SAFE_RESPONSE_HEADERS
                .iter()
                .map(|h| h.to_string())
                .collect(),
        };

        let layers = [
            self.config.headers.as_ref(),
            self.host.headers.as_ref(),
            rule.and_then(|r| r.headers.as_ref()),
        ];
        for layer in layers.into_iter().flatten() {
            let (replace, add) = match kind {
                HeaderKind::Request => (&layer.safe_request, &layer.safe_request_add),
                HeaderKind::Response => (&layer.safe_response, &layer.safe_response_add),
            };
            if let Some(value) = replace {
                headers = value.clone();
            }
            if let Some(extra) = add {
                headers.extend(extra.iter().cloned());
            }
        }

        dedup_case_insensitive(headers)
    }
}

impl ConfigResolver {
    /// Pick the rendering dimension for a request user-agent, applying the
    /// resolved unmatched-dimension policy when nothing matches
    pub fn select_dimension<'a>(
        &'a self,
        resolved: &ResolvedConfig,
        user_agent: &str,
    ) -> DimensionDecision<'a> {
        let strategy = self
            .config
            .render
            .selection_strategy
            .unwrap_or(SelectionStrategy::FirstMatch);
        select_dimension(
            &self.host,
            strategy,
            &resolved.render.unmatched_dimension,
            user_agent,
        )
    }
}

/// Outcome of matching a request user-agent against a host's dimensions
#[derive(Debug, Clone)]
pub enum DimensionDecision<'a> {
    /// Render with this dimension
    Dimension(&'a Dimension),
    /// No dimension matched; hand the request to the origin untouched
    Bypass,
    /// No dimension matched; refuse the request
    Block,
}

/// Match `user_agent` against the host's dimensions.
///
/// `first_match` takes the first dimension with a matching pattern in
/// declaration order; `best_match` takes the dimension owning the longest
/// matching pattern literal, earlier declaration winning ties. When nothing
/// matches, the unmatched policy applies: `bypass`, `block`, or a named
/// fallback dimension (validated at load; an unknown name degrades to
/// bypass rather than failing the request path).
pub fn select_dimension<'a>(
    host: &'a Host,
    strategy: SelectionStrategy,
    unmatched_dimension: &str,
    user_agent: &str,
) -> DimensionDecision<'a> {
    let dimensions = &host.render.dimensions;

    let matched = match strategy {
        SelectionStrategy::FirstMatch => dimensions
            .iter()
            .find(|d| d.compiled.iter().any(|p| p.matches(user_agent))),
        SelectionStrategy::BestMatch => {
            let mut best: Option<(usize, &Dimension)> = None;
            for dimension in dimensions {
                for (pattern, literal) in dimension.compiled.iter().zip(&dimension.match_ua) {
                    if !pattern.matches(user_agent) {
                        continue;
                    }
                    let specificity = literal.len();
                    if best.map_or(true, |(len, _)| specificity > len) {
                        best = Some((specificity, dimension));
                    }
                }
            }
            best.map(|(_, dimension)| dimension)
        }
    };

    if let Some(dimension) = matched {
        return DimensionDecision::Dimension(dimension);
    }

    match unmatched_dimension {
        "bypass" => DimensionDecision::Bypass,
        "block" => DimensionDecision::Block,
        id => dimensions
            .iter()
            .find(|d| d.id == id)
            .map(DimensionDecision::Dimension)
            .unwrap_or(DimensionDecision::Bypass),
    }
}

#[derive(Debug, Clone, Copy)]
enum HeaderKind {
    Request,
    Response,
}

/// De-duplicate header names case-insensitively, preserving the first
/// occurrence and its spelling
fn dedup_case_insensitive(headers: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(headers.len());
    for header in headers {
        if seen.insert(header.to_lowercase()) {
            out.push(header);
        }
    }
    out
}

fn action_label(action: RuleAction) -> &'static str {
    match action {
        RuleAction::Render => "render",
        RuleAction::Bypass => "bypass",
        RuleAction::Block => "block",
        RuleAction::Status403 => "status403",
        RuleAction::Status404 => "status404",
        RuleAction::Status410 => "status410",
        RuleAction::Status => "status",
    }
}
