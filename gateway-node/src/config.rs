use crate::pattern::CompiledPattern;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default render timeout applied to the global config when unset (seconds)
pub const DEFAULT_RENDER_TIMEOUT_SECONDS: u64 = 30;
/// Default bypass timeout when no layer provides one (seconds)
pub const DEFAULT_BYPASS_TIMEOUT_SECONDS: u64 = 30;
/// Default artifact cache TTL (seconds)
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 3600;
/// Default bot-hit recache interval (seconds)
pub const DEFAULT_BOTHIT_RECACHE_INTERVAL_SECONDS: u64 = 86_400;
/// Status codes cached by default for rendered artifacts
pub const DEFAULT_CACHE_STATUSES: [u16; 6] = [200, 301, 302, 307, 308, 404];
/// Policy applied when no dimension matches the request user-agent
pub const DEFAULT_UNMATCHED_DIMENSION: &str = "bypass";
/// Response headers forwarded to clients unless a layer overrides the list
pub const DEFAULT_SAFE_RESPONSE_HEADERS: [&str; 6] = [
    "Content-Type",
    "Cache-Control",
    "Expires",
    "Last-Modified",
    "ETag",
    "Location",
];

/// Main configuration for the gateway node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Public listener configuration
    pub server: ServerConfig,
    /// Internal (operations) listener configuration
    pub internal: InternalConfig,
    /// Redis connection settings for cache coordination
    pub redis: RedisConfig,
    /// Artifact storage backend settings
    pub storage: StorageConfig,
    /// Global render defaults, inherited by hosts
    pub render: RenderConfig,
    /// Global bypass defaults
    pub bypass: Option<BypassConfig>,
    /// Global bot-hit recache defaults
    pub bothit_recache: Option<BothitRecacheConfig>,
    /// Global tracking-parameter stripping defaults
    pub tracking_params: Option<TrackingParamsConfig>,
    /// Global cache sharding defaults
    pub cache_sharding: Option<ShardingConfig>,
    /// Global safe-header defaults
    pub headers: Option<HeadersConfig>,
    /// Render worker registry settings
    pub registry: Option<RegistryConfig>,
    /// Logging configuration
    pub log: LogConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
    /// Host file discovery
    pub hosts: HostsIncludeConfig,
}

/// Public listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address (host:port)
    #[serde(default = "default_server_listen")]
    pub listen: String,
    /// Whole-request timeout in seconds; must accommodate the slowest host
    /// render plus overhead
    #[serde(default = "default_server_timeout")]
    pub timeout_seconds: u64,
    /// Response compression algorithm, global only
    #[serde(default)]
    pub compression: CompressionAlgorithm,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_server_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_server_timeout() -> u64 {
    60
}

fn default_max_connections() -> u32 {
    1024
}

/// Internal operations listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InternalConfig {
    /// Listen address for the operations endpoint
    #[serde(default = "default_internal_listen")]
    pub listen: String,
    /// Optional bearer token for operations requests
    pub auth_token: Option<String>,
}

fn default_internal_listen() -> String {
    "127.0.0.1:9902".to_string()
}

/// Redis connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// Connection URL (redis://host:port/db)
    pub url: String,
    /// Connection pool size
    #[serde(default = "default_redis_pool")]
    pub pool_size: u32,
    /// Connect timeout in milliseconds
    #[serde(default = "default_redis_timeout")]
    pub connect_timeout_ms: u64,
    /// Key prefix for all gateway entries
    pub key_prefix: Option<String>,
}

fn default_redis_pool() -> u32 {
    8
}

fn default_redis_timeout() -> u64 {
    500
}

/// Artifact storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Filesystem,
    S3,
}

/// Artifact storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Backend kind
    pub backend: StorageBackend,
    /// Root path for the filesystem backend
    pub path: Option<String>,
    /// Bucket name for the S3 backend
    pub bucket: Option<String>,
    /// Region for the S3 backend
    pub region: Option<String>,
}

/// Response compression algorithm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    Gzip,
    Brotli,
    Zstd,
    None,
}

/// Page lifecycle event the renderer waits for before capturing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitEvent {
    NetworkIdle,
    NetworkAlmostIdle,
    DomContentLoaded,
    Load,
}

/// Render completion events; fields merge layer by layer, a set field
/// overriding an unset one
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderEvents {
    /// Lifecycle event to wait for
    pub wait_for: Option<WaitEvent>,
    /// Extra settle time after the event, in milliseconds
    pub additional_wait_ms: Option<u64>,
}

/// A named rendering profile: viewport, user-agent, matching patterns
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dimension {
    /// Identifier, unique within a host
    pub id: String,
    /// Viewport width in pixels
    pub width: u32,
    /// Viewport height in pixels
    pub height: u32,
    /// User-agent string the render worker presents to the origin
    pub render_ua: String,
    /// Pattern literals matched against the request user-agent; alias
    /// references are resolved at load time
    #[serde(default)]
    pub match_ua: Vec<String>,
    /// Compiled form of `match_ua`, one entry per literal
    #[serde(skip)]
    pub compiled: Vec<CompiledPattern>,
}

/// Dimension selection strategy when several dimensions match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    FirstMatch,
    BestMatch,
}

/// Expired-artifact policy. This sub-struct is replaced as a whole when a
/// more specific layer provides it; its fields are never merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpiredCacheConfig {
    /// Serve an expired artifact while a fresh render is produced
    pub serve: bool,
    /// Queue a re-render when an expired artifact is served
    #[serde(default)]
    pub recache: bool,
}

/// Rendered-artifact cache settings; optional fields merge layer by layer,
/// except `expired` which is replaced whole
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache rendered artifacts at all
    pub enabled: Option<bool>,
    /// Artifact time-to-live in seconds
    pub ttl_seconds: Option<u64>,
    /// Response status codes eligible for caching
    pub statuses: Option<Vec<u16>>,
    /// Expired-artifact policy, replaced atomically per layer
    pub expired: Option<ExpiredCacheConfig>,
}

/// Render settings. Used for the global layer and per host; unset fields at
/// the host layer fall back to the global layer at resolve time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderConfig {
    /// Render timeout in seconds; 0 means unset at the host layer
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Rendering profiles; hosts without their own inherit the global set
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    /// Render completion events
    #[serde(default)]
    pub events: RenderEvents,
    /// Rendered-artifact cache settings
    pub cache: Option<CacheConfig>,
    /// Policy when no dimension matches the request user-agent: `bypass`,
    /// `block`, or a dimension id. Empty means unset; the global layer is
    /// defaulted to `bypass` at load.
    #[serde(default)]
    pub unmatched_dimension: String,
    /// Remove script tags from rendered HTML
    pub strip_scripts: Option<bool>,
    /// URL patterns the render workers refuse to fetch; a non-empty list
    /// replaces the parent layer's list entirely
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    /// Resource types the render workers refuse to fetch; replacement
    /// semantics as for `blocked_patterns`
    #[serde(default)]
    pub blocked_resource_types: Vec<String>,
    /// Dimension selection strategy, global layer only
    pub selection_strategy: Option<SelectionStrategy>,
}

/// Bypass-path cache settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BypassCacheConfig {
    /// Cache origin responses served on the bypass path
    pub enabled: Option<bool>,
    /// Bypass cache TTL in seconds
    pub ttl_seconds: Option<u64>,
}

/// Origin bypass settings; optional fields merge layer by layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BypassConfig {
    /// Origin request timeout in seconds
    pub timeout_seconds: Option<u64>,
    /// Forward client cookies to the origin
    pub forward_cookies: Option<bool>,
    /// Follow origin redirects instead of relaying them
    pub follow_redirects: Option<bool>,
    /// Bypass-path cache settings
    pub cache: Option<BypassCacheConfig>,
}

/// Tracking-parameter stripping settings.
///
/// `params` replaces the parent list entirely, even when explicitly empty
/// (an empty list disables stripping); `params_add` appends to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackingParamsConfig {
    /// Strip matching query parameters before cache keying and origin
    /// dispatch
    pub strip: Option<bool>,
    /// Replacement pattern list
    pub params: Option<Vec<String>>,
    /// Patterns appended to the inherited list
    pub params_add: Option<Vec<String>>,
}

/// Cache shard placement strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardingStrategy {
    HashModulo,
    Rendezvous,
}

/// Artifact cache sharding settings; optional fields merge layer by layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardingConfig {
    /// Shard artifacts across gateway peers
    pub enabled: Option<bool>,
    /// Number of replicas per artifact
    pub replication_factor: Option<u32>,
    /// Shard placement strategy
    pub strategy: Option<ShardingStrategy>,
    /// Push freshly rendered artifacts to their shard owners
    pub push_on_render: Option<bool>,
    /// Replicate artifacts fetched from a peer shard
    pub replicate_on_pull: Option<bool>,
}

/// Bot-hit driven re-cache settings.
///
/// `match_ua` is replaced as a whole by whichever layer last provides a
/// non-empty list; there is no concatenation across layers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BothitRecacheConfig {
    /// Re-render cached artifacts that bots keep hitting
    pub enabled: Option<bool>,
    /// Minimum interval between bot-driven re-renders, in seconds
    pub interval_seconds: Option<u64>,
    /// User-agent patterns identifying the bots that trigger re-caching;
    /// alias references are resolved at load time
    pub match_ua: Option<Vec<String>>,
    /// Compiled form of `match_ua`
    #[serde(skip)]
    pub compiled: Vec<CompiledPattern>,
}

/// Safe-header propagation settings.
///
/// `safe_request`/`safe_response` replace the inherited list entirely; the
/// `_add` variants append with case-insensitive de-duplication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeadersConfig {
    /// Request headers forwarded to render workers and the origin
    pub safe_request: Option<Vec<String>>,
    /// Request headers appended to the inherited list
    pub safe_request_add: Option<Vec<String>>,
    /// Response headers forwarded to clients
    pub safe_response: Option<Vec<String>>,
    /// Response headers appended to the inherited list
    pub safe_response_add: Option<Vec<String>>,
}

/// Render worker registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Registry endpoint URL
    pub endpoint: String,
    /// Worker heartbeat interval in seconds
    #[serde(default = "default_registry_heartbeat")]
    pub heartbeat_seconds: u64,
}

fn default_registry_heartbeat() -> u64 {
    15
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log output format
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Enable metrics collection
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Metrics listener address
    #[serde(default = "default_metrics_listen")]
    pub listen_addr: String,
    /// Metric name namespace
    pub namespace: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9904".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_metrics_listen(),
            namespace: None,
        }
    }
}

/// Host file discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostsIncludeConfig {
    /// Path or glob naming the host files; a directory implies `/*.yaml`.
    /// Must match at least one file.
    pub include: String,
}

/// A pattern field that accepts either a single string or a list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrSeq {
    One(String),
    Many(Vec<String>),
}

impl StringOrSeq {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrSeq::One(s) => vec![s.clone()],
            StringOrSeq::Many(v) => v.clone(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            StringOrSeq::One(s) => std::slice::from_ref(s).iter().map(String::as_str),
            StringOrSeq::Many(v) => v.as_slice().iter().map(String::as_str),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StringOrSeq::One(_) => 1,
            StringOrSeq::Many(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Action a URL rule applies to matching requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Serve a rendered artifact, rendering on miss
    #[default]
    Render,
    /// Proxy to the origin untouched
    Bypass,
    /// Refuse the request with 403
    Block,
    /// Synthetic 403 response
    Status403,
    /// Synthetic 404 response
    Status404,
    /// Synthetic 410 response
    Status410,
    /// Synthetic response with an explicit code
    Status,
}

impl RuleAction {
    /// True for actions answered synthetically without touching the render
    /// pipeline or the origin
    pub fn is_status_family(self) -> bool {
        matches!(
            self,
            RuleAction::Block
                | RuleAction::Status403
                | RuleAction::Status404
                | RuleAction::Status410
                | RuleAction::Status
        )
    }

    /// Status code implied by the action, when it has one
    pub fn implied_status_code(self) -> Option<u16> {
        match self {
            RuleAction::Block | RuleAction::Status403 => Some(403),
            RuleAction::Status404 => Some(404),
            RuleAction::Status410 => Some(410),
            _ => None,
        }
    }
}

/// Synthetic status response overrides on a rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusOverride {
    /// Explicit status code; required when the action is `status`
    pub code: Option<u16>,
    /// Reason phrase included in the synthetic body
    pub reason: Option<String>,
    /// Extra response headers
    pub headers: Option<BTreeMap<String, String>>,
}

/// Render overrides carried by a rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleRenderOverride {
    /// Render timeout in seconds
    pub timeout_seconds: Option<u64>,
    /// Render completion events
    #[serde(default)]
    pub events: RenderEvents,
    /// Rendered-artifact cache settings
    pub cache: Option<CacheConfig>,
    /// Policy when no dimension matches
    pub unmatched_dimension: Option<String>,
    /// Remove script tags from rendered HTML
    pub strip_scripts: Option<bool>,
    /// Replacement blocked-URL-pattern list
    pub blocked_patterns: Option<Vec<String>>,
    /// Replacement blocked-resource-type list
    pub blocked_resource_types: Option<Vec<String>>,
}

/// A URL-dispatch rule.
///
/// A rule with several `match` patterns is expanded into single-pattern
/// copies before sorting; the `match_patterns`, `compiled_patterns`,
/// `query_params`, and `source_index` fields are materialized during that
/// preparation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UrlRule {
    /// Path pattern(s) this rule applies to
    #[serde(rename = "match")]
    pub match_spec: StringOrSeq,
    /// Action applied on match
    #[serde(default)]
    pub action: RuleAction,
    /// Query predicate: AND over parameter names, OR over the listed values
    /// of one name
    pub match_query: Option<BTreeMap<String, StringOrSeq>>,
    /// Synthetic status overrides
    pub status: Option<StatusOverride>,
    /// Render overrides
    pub render: Option<RuleRenderOverride>,
    /// Bypass overrides
    pub bypass: Option<BypassConfig>,
    /// Tracking-parameter overrides
    pub tracking_params: Option<TrackingParamsConfig>,
    /// Cache sharding overrides
    pub cache_sharding: Option<ShardingConfig>,
    /// Bot-hit recache overrides
    pub bothit_recache: Option<BothitRecacheConfig>,
    /// Safe-header overrides
    pub headers: Option<HeadersConfig>,

    /// Pattern literals after expansion (exactly one per expanded rule)
    #[serde(skip)]
    pub match_patterns: Vec<String>,
    /// Compiled form of `match_patterns`
    #[serde(skip)]
    pub compiled_patterns: Vec<CompiledPattern>,
    /// Compiled query predicate, keyed by parameter name
    #[serde(skip)]
    pub query_params: BTreeMap<String, Vec<CompiledPattern>>,
    /// Declaration index of the rule this one was expanded from
    #[serde(skip)]
    pub source_index: usize,
}

/// A site served through the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Host {
    /// Identifier, unique across all host files
    pub id: String,
    /// Primary domain
    pub domain: Option<String>,
    /// Additional domains
    #[serde(default)]
    pub domains: Vec<String>,
    /// Key identifying render requests for this host
    #[serde(default)]
    pub render_key: String,
    /// Render settings; unset fields fall back to the global layer
    pub render: RenderConfig,
    /// Bypass overrides
    pub bypass: Option<BypassConfig>,
    /// Tracking-parameter overrides
    pub tracking_params: Option<TrackingParamsConfig>,
    /// Cache sharding overrides
    pub cache_sharding: Option<ShardingConfig>,
    /// Bot-hit recache overrides
    pub bothit_recache: Option<BothitRecacheConfig>,
    /// Safe-header overrides
    pub headers: Option<HeadersConfig>,
    /// URL dispatch rules, sorted by specificity during preparation
    #[serde(default)]
    pub url_rules: Vec<UrlRule>,

    /// True when the dimensions were inherited from the global layer and
    /// therefore arrived already expanded and compiled
    #[serde(skip)]
    pub dimensions_inherited: bool,
}

impl Host {
    /// Primary domain plus additional domains, declaration order preserved
    pub fn all_domains(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(self.domains.len() + 1);
        if let Some(primary) = &self.domain {
            out.push(primary.as_str());
        }
        out.extend(self.domains.iter().map(String::as_str));
        out
    }
}

/// One host file: a `hosts:` array
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostsFile {
    pub hosts: Vec<Host>,
}

impl GatewayConfig {
    /// Whole-request server timeout
    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_seconds)
    }

    /// Global bypass timeout, when configured
    pub fn bypass_timeout(&self) -> Option<Duration> {
        self.bypass
            .as_ref()
            .and_then(|b| b.timeout_seconds)
            .map(Duration::from_secs)
    }
}
