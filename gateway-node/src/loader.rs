use crate::bots::{expand_bothit_aliases, expand_dimension_aliases};
use crate::config::{
    BypassConfig, GatewayConfig, Host, HostsFile, RenderConfig, SelectionStrategy,
    TrackingParamsConfig, WaitEvent, DEFAULT_RENDER_TIMEOUT_SECONDS, DEFAULT_UNMATCHED_DIMENSION,
};
use crate::error::{GatewayError, Result};
use crate::hosts::{prepare_host, HostsSnapshot};
use crate::tracking::{compile_strip_patterns, find_redundant_patterns};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Headroom the server timeout must leave above the slowest host render:
/// the render itself, wait events, and response assembly
const RENDER_WAIT_FACTOR: f64 = 1.5;
/// Fixed overhead added on top of the scaled render timeout (seconds)
const SERVER_TIMEOUT_OVERHEAD_SECONDS: f64 = 5.0;

/// Everything `load_config` produces: the parsed global config and the
/// prepared, indexed hosts
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: GatewayConfig,
    pub snapshot: HostsSnapshot,
}

/// Load the main config file and every included host file, returning the
/// global config plus a hosts snapshot ready for publication.
///
/// All schema, reference, and cross-field problems abort the load; only
/// operational oddities (redundant strip patterns, zero-TTL bypass cache)
/// are logged as warnings.
pub fn load_config(path: &Path) -> Result<LoadedConfig> {
    let started = Instant::now();
    let mut config: GatewayConfig = parse_yaml_file(path)?;
    let main_context = path.display().to_string();

    if let Some(bothit) = &mut config.bothit_recache {
        expand_bothit_aliases(bothit, &format!("{main_context}:bothit_recache"))?;
    }
    expand_dimension_aliases(&mut config.render.dimensions, &format!("{main_context}:render"))?;

    // Global event defaults; hosts inherit these field-wise
    if config.render.events.wait_for.is_none() {
        config.render.events.wait_for = Some(WaitEvent::NetworkIdle);
    }
    if config.render.events.additional_wait_ms.is_none() {
        config.render.events.additional_wait_ms = Some(0);
    }

    let host_files = resolve_host_files(path, &config.hosts.include)?;
    let hosts = load_host_files(&host_files, &config.render)?;

    apply_global_defaults(&mut config);
    if config.render.unmatched_dimension.is_empty() {
        return Err(GatewayError::Config(
            "render.unmatched_dimension must not be empty after defaulting".to_string(),
        ));
    }

    validate_cross_fields(&config, &hosts)?;
    validate_tracking_patterns(&config, &hosts)?;
    validate_unmatched_dimensions(&config, &hosts)?;
    emit_operational_warnings(&config, &hosts);

    let rule_count: usize = hosts.iter().map(|h| h.url_rules.len()).sum();
    let snapshot = HostsSnapshot::build(hosts)?;

    info!(
        hosts = snapshot.len(),
        files = host_files.len(),
        rules = rule_count,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Configuration loaded"
    );

    Ok(LoadedConfig { config, snapshot })
}

/// Strict YAML parsing: syntax is checked first so the error carries the
/// file location, then the typed deserialization rejects unknown keys and
/// wrong types.
fn parse_yaml_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Io(std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))))?;

    serde_yaml::from_str::<serde_yaml::Value>(&content)
        .map_err(|e| GatewayError::Schema(format!("{}: {e}", path.display())))?;

    serde_yaml::from_str(&content)
        .map_err(|e| GatewayError::Schema(format!("{}: {e}", path.display())))
}

/// Resolve the `hosts.include` path to a sorted list of host files.
///
/// A relative include is anchored at the main config file's directory; a
/// directory include implies `/*.yaml`. Matching no files is fatal.
fn resolve_host_files(main_path: &Path, include: &str) -> Result<Vec<PathBuf>> {
    let base = main_path.parent().unwrap_or_else(|| Path::new("."));
    let mut target = PathBuf::from(include);
    if target.is_relative() {
        target = base.join(target);
    }
    if target.is_dir() {
        target = target.join("*.yaml");
    }

    let pattern = target.to_string_lossy();
    let matches = glob::glob(&pattern).map_err(|e| {
        GatewayError::Reference(format!("invalid hosts.include glob '{include}': {e}"))
    })?;

    let mut files: Vec<PathBuf> = matches.filter_map(|entry| entry.ok()).collect();
    if files.is_empty() {
        return Err(GatewayError::Reference(format!(
            "hosts.include '{include}' matched no files"
        )));
    }
    files.sort();
    debug!(files = files.len(), pattern = %pattern, "Resolved host files");
    Ok(files)
}

/// Parse every host file in order and prepare each host against the global
/// render layer. Host IDs must be unique across all files; the error names
/// the file that declared the ID first.
fn load_host_files(files: &[PathBuf], global_render: &RenderConfig) -> Result<Vec<Host>> {
    let mut hosts = Vec::new();
    let mut declared: HashMap<String, PathBuf> = HashMap::new();

    for file in files {
        let parsed: HostsFile = parse_yaml_file(file)?;
        for mut host in parsed.hosts {
            if let Some(first_file) = declared.get(&host.id) {
                return Err(GatewayError::Reference(format!(
                    "duplicate host id '{}' in {}: already declared in {}",
                    host.id,
                    file.display(),
                    first_file.display()
                )));
            }
            declared.insert(host.id.clone(), file.clone());

            let context = format!("{}:host_id={}", file.display(), host.id);
            prepare_host(&mut host, global_render, &context)?;
            hosts.push(host);
        }
    }
    Ok(hosts)
}

fn apply_global_defaults(config: &mut GatewayConfig) {
    if config.render.timeout_seconds == 0 {
        config.render.timeout_seconds = DEFAULT_RENDER_TIMEOUT_SECONDS;
    }
    if config.render.unmatched_dimension.is_empty() {
        config.render.unmatched_dimension = DEFAULT_UNMATCHED_DIMENSION.to_string();
    }
    if config.render.selection_strategy.is_none() {
        config.render.selection_strategy = Some(SelectionStrategy::FirstMatch);
    }
}

/// Timeout relationships are fatal: a server timeout shorter than the
/// slowest possible render would abort every render for that host.
fn validate_cross_fields(config: &GatewayConfig, hosts: &[Host]) -> Result<()> {
    let server_timeout = config.server.timeout_seconds;

    let max_render_timeout = hosts
        .iter()
        .map(|h| effective_render_timeout(h, config))
        .chain(std::iter::once(config.render.timeout_seconds))
        .max()
        .unwrap_or(config.render.timeout_seconds);

    let required = (max_render_timeout as f64) * RENDER_WAIT_FACTOR + SERVER_TIMEOUT_OVERHEAD_SECONDS;
    if (server_timeout as f64) < required {
        return Err(GatewayError::Config(format!(
            "server.timeout_seconds {server_timeout} cannot accommodate the slowest host render \
             timeout {max_render_timeout}s (requires at least {}s)",
            required.ceil() as u64
        )));
    }

    check_bypass_timeout(config.bypass.as_ref(), server_timeout, "global")?;
    for host in hosts {
        check_bypass_timeout(
            host.bypass.as_ref(),
            server_timeout,
            &format!("host '{}'", host.id),
        )?;
        for (index, rule) in host.url_rules.iter().enumerate() {
            check_bypass_timeout(
                rule.bypass.as_ref(),
                server_timeout,
                &format!("host '{}' url_rule[{index}]", host.id),
            )?;
        }
    }
    Ok(())
}

fn effective_render_timeout(host: &Host, config: &GatewayConfig) -> u64 {
    if host.render.timeout_seconds > 0 {
        host.render.timeout_seconds
    } else {
        config.render.timeout_seconds
    }
}

fn check_bypass_timeout(
    bypass: Option<&BypassConfig>,
    server_timeout: u64,
    context: &str,
) -> Result<()> {
    if let Some(timeout) = bypass.and_then(|b| b.timeout_seconds) {
        if timeout > server_timeout {
            return Err(GatewayError::Config(format!(
                "bypass.timeout_seconds {timeout} at {context} exceeds server.timeout_seconds \
                 {server_timeout}"
            )));
        }
    }
    Ok(())
}

/// Every tracking-params pattern in every layer must compile so that
/// resolution can never fail on the request path.
fn validate_tracking_patterns(config: &GatewayConfig, hosts: &[Host]) -> Result<()> {
    check_tracking_section(config.tracking_params.as_ref(), "global tracking_params")?;
    for host in hosts {
        check_tracking_section(
            host.tracking_params.as_ref(),
            &format!("host '{}' tracking_params", host.id),
        )?;
        for (index, rule) in host.url_rules.iter().enumerate() {
            check_tracking_section(
                rule.tracking_params.as_ref(),
                &format!("host '{}' url_rule[{index}] tracking_params", host.id),
            )?;
        }
    }
    Ok(())
}

fn check_tracking_section(section: Option<&TrackingParamsConfig>, context: &str) -> Result<()> {
    let Some(section) = section else {
        return Ok(());
    };
    for list in [&section.params, &section.params_add].into_iter().flatten() {
        compile_strip_patterns(list)
            .map_err(|e| GatewayError::Pattern(format!("{e} (in {context})")))?;
    }
    Ok(())
}

/// Every `unmatched_dimension` must name `bypass`, `block`, or a dimension
/// declared (or inherited) by the layer it applies to.
fn validate_unmatched_dimensions(config: &GatewayConfig, hosts: &[Host]) -> Result<()> {
    check_unmatched_reference(
        &config.render.unmatched_dimension,
        &config.render.dimensions,
        "global render",
    )?;
    for host in hosts {
        check_unmatched_reference(
            &host.render.unmatched_dimension,
            &host.render.dimensions,
            &format!("host '{}'", host.id),
        )?;
        for (index, rule) in host.url_rules.iter().enumerate() {
            if let Some(value) = rule
                .render
                .as_ref()
                .and_then(|r| r.unmatched_dimension.as_deref())
            {
                check_unmatched_reference(
                    value,
                    &host.render.dimensions,
                    &format!("host '{}' url_rule[{index}]", host.id),
                )?;
            }
        }
    }
    Ok(())
}

fn check_unmatched_reference(
    value: &str,
    dimensions: &[crate::config::Dimension],
    context: &str,
) -> Result<()> {
    if value.is_empty() || value == "bypass" || value == "block" {
        return Ok(());
    }
    if dimensions.iter().any(|d| d.id == value) {
        return Ok(());
    }
    Err(GatewayError::Reference(format!(
        "unmatched_dimension '{value}' at {context} is neither 'bypass', 'block', nor a declared \
         dimension id"
    )))
}

fn emit_operational_warnings(config: &GatewayConfig, hosts: &[Host]) {
    warn_bypass_cache(config.bypass.as_ref(), "global");
    warn_tracking_redundancy(config.tracking_params.as_ref(), "global");
    if config.render.dimensions.is_empty() && hosts.iter().any(|h| h.render.dimensions.is_empty())
    {
        warn!("no global dimensions configured and at least one host declares none");
    }

    for host in hosts {
        let context = format!("host '{}'", host.id);
        warn_bypass_cache(host.bypass.as_ref(), &context);
        warn_tracking_redundancy(host.tracking_params.as_ref(), &context);
        if host.render_key.is_empty() {
            warn!(host = %host.id, "host has an empty render_key");
        }
        for (index, rule) in host.url_rules.iter().enumerate() {
            let rule_context = format!("{context} url_rule[{index}]");
            warn_bypass_cache(rule.bypass.as_ref(), &rule_context);
            warn_tracking_redundancy(rule.tracking_params.as_ref(), &rule_context);
        }
    }
}

fn warn_bypass_cache(bypass: Option<&BypassConfig>, context: &str) {
    let Some(cache) = bypass.and_then(|b| b.cache.as_ref()) else {
        return;
    };
    if cache.enabled == Some(true) && cache.ttl_seconds.unwrap_or(0) == 0 {
        warn!(
            context = context,
            "bypass cache is enabled with a TTL of 0; responses will not be retained"
        );
    }
}

fn warn_tracking_redundancy(section: Option<&TrackingParamsConfig>, context: &str) {
    let Some(section) = section else {
        return;
    };
    let mut combined: Vec<String> = Vec::new();
    if let Some(params) = &section.params {
        combined.extend(params.iter().cloned());
    }
    if let Some(extra) = &section.params_add {
        combined.extend(extra.iter().cloned());
    }
    for redundant in find_redundant_patterns(&combined) {
        warn!(
            context = context,
            pattern = %redundant.pattern,
            covered_by = %redundant.covered_by,
            "redundant tracking-params pattern"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const MAIN_MINIMAL: &str = r#"
server:
  listen: 0.0.0.0:8080
  timeout_seconds: 60
internal:
  listen: 127.0.0.1:9902
redis:
  url: redis://127.0.0.1:6379/0
storage:
  backend: filesystem
  path: /var/lib/gateway/artifacts
render:
  timeout_seconds: 30
log: {}
metrics: {}
hosts:
  include: hosts
"#;

    const HOST_MINIMAL: &str = r#"
hosts:
  - id: shop
    domain: shop.example.com
    render_key: k-shop-1
    render: {}
"#;

    fn write_tree(main: &str, host_files: &[(&str, &str)]) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let hosts_dir = dir.path().join("hosts");
        std::fs::create_dir(&hosts_dir).unwrap();
        let main_path = dir.path().join("gateway.yaml");
        std::fs::File::create(&main_path)
            .unwrap()
            .write_all(main.as_bytes())
            .unwrap();
        for (name, content) in host_files {
            std::fs::File::create(hosts_dir.join(name))
                .unwrap()
                .write_all(content.as_bytes())
                .unwrap();
        }
        (dir, main_path)
    }

    #[test]
    fn test_load_minimal_tree() {
        let (_dir, main) = write_tree(MAIN_MINIMAL, &[("shop.yaml", HOST_MINIMAL)]);
        let loaded = load_config(&main).unwrap();

        assert_eq!(loaded.snapshot.len(), 1);
        assert!(loaded.snapshot.host_by_domain("shop.example.com").is_some());
        // Global defaults applied
        assert_eq!(loaded.config.render.unmatched_dimension, "bypass");
        assert_eq!(
            loaded.config.render.selection_strategy,
            Some(SelectionStrategy::FirstMatch)
        );
        assert_eq!(loaded.config.render.events.wait_for, Some(WaitEvent::NetworkIdle));
        assert_eq!(loaded.config.render.events.additional_wait_ms, Some(0));
    }

    #[test]
    fn test_load_rejects_unknown_key() {
        let main = MAIN_MINIMAL.replace("metrics: {}", "metrics: {}\nsurprise: 1");
        let (_dir, main) = write_tree(&main, &[("shop.yaml", HOST_MINIMAL)]);
        let err = load_config(&main).unwrap_err();
        assert!(matches!(err, GatewayError::Schema(_)));
        assert!(err.to_string().contains("surprise"), "{err}");
    }

    #[test]
    fn test_load_rejects_malformed_yaml_with_location() {
        let (_dir, main) = write_tree(MAIN_MINIMAL, &[("shop.yaml", "hosts:\n  - id: [unclosed")]);
        let err = load_config(&main).unwrap_err();
        assert!(matches!(err, GatewayError::Schema(_)));
        assert!(err.to_string().contains("shop.yaml"), "{err}");
    }

    #[test]
    fn test_load_requires_at_least_one_host_file() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("hosts")).unwrap();
        let main_path = dir.path().join("gateway.yaml");
        std::fs::write(&main_path, MAIN_MINIMAL).unwrap();

        let err = load_config(&main_path).unwrap_err();
        assert!(matches!(err, GatewayError::Reference(_)));
        assert!(err.to_string().contains("matched no files"), "{err}");
    }

    #[test]
    fn test_load_host_files_in_sorted_order() {
        let second = HOST_MINIMAL
            .replace("shop", "zshop")
            .replace("k-zshop-1", "k2");
        let (_dir, main) = write_tree(
            MAIN_MINIMAL,
            &[("b.yaml", &second), ("a.yaml", HOST_MINIMAL)],
        );
        let loaded = load_config(&main).unwrap();
        assert_eq!(loaded.snapshot.hosts()[0].id, "shop");
        assert_eq!(loaded.snapshot.hosts()[1].id, "zshop");
    }

    #[test]
    fn test_load_rejects_duplicate_host_ids_across_files() {
        let duplicate = HOST_MINIMAL.replace("shop.example.com", "other.example.com");
        let (_dir, main) = write_tree(
            MAIN_MINIMAL,
            &[("a.yaml", HOST_MINIMAL), ("b.yaml", &duplicate)],
        );
        let err = load_config(&main).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("duplicate host id 'shop'"), "{msg}");
        assert!(msg.contains("a.yaml"), "{msg}");
        assert!(msg.contains("b.yaml"), "{msg}");
    }

    #[test]
    fn test_load_rejects_duplicate_domains() {
        let duplicate = HOST_MINIMAL
            .replace("id: shop", "id: shop2")
            .replace("shop.example.com", "SHOP.example.com");
        let (_dir, main) = write_tree(
            MAIN_MINIMAL,
            &[("a.yaml", HOST_MINIMAL), ("b.yaml", &duplicate)],
        );
        let err = load_config(&main).unwrap_err();
        assert!(err.to_string().contains("shop.example.com"), "{err}");
    }

    #[test]
    fn test_load_rejects_short_server_timeout() {
        let main = MAIN_MINIMAL.replace("timeout_seconds: 60", "timeout_seconds: 20");
        let (_dir, main) = write_tree(&main, &[("shop.yaml", HOST_MINIMAL)]);
        let err = load_config(&main).unwrap_err();
        assert!(err.to_string().contains("cannot accommodate"), "{err}");
    }

    #[test]
    fn test_load_rejects_bypass_timeout_above_server_timeout() {
        let main = MAIN_MINIMAL.replace(
            "hosts:\n  include: hosts",
            "bypass:\n  timeout_seconds: 90\nhosts:\n  include: hosts",
        );
        let (_dir, main) = write_tree(&main, &[("shop.yaml", HOST_MINIMAL)]);
        let err = load_config(&main).unwrap_err();
        assert!(err.to_string().contains("exceeds server.timeout_seconds"), "{err}");
    }

    #[test]
    fn test_load_rejects_invalid_tracking_pattern() {
        let host = HOST_MINIMAL.to_string()
            + "    tracking_params:\n      params: [\"~[broken\"]\n";
        let (_dir, main) = write_tree(MAIN_MINIMAL, &[("shop.yaml", &host)]);
        let err = load_config(&main).unwrap_err();
        assert!(matches!(err, GatewayError::Pattern(_)));
        assert!(err.to_string().contains("host 'shop'"), "{err}");
    }

    #[test]
    fn test_load_expands_global_dimensions_once() {
        let main = MAIN_MINIMAL.replace(
            "render:\n  timeout_seconds: 30",
            "render:\n  timeout_seconds: 30\n  dimensions:\n    - id: desktop\n      width: 1920\n      height: 1080\n      render_ua: gateway-renderer/1.0\n      match_ua: [\"$SearchBots\"]",
        );
        let (_dir, main) = write_tree(&main, &[("shop.yaml", HOST_MINIMAL)]);
        let loaded = load_config(&main).unwrap();

        assert_eq!(loaded.config.render.dimensions[0].match_ua.len(), 16);
        let host = loaded.snapshot.host_by_domain("shop.example.com").unwrap();
        assert!(host.dimensions_inherited);
        assert_eq!(host.render.dimensions[0].compiled.len(), 16);
    }

    #[test]
    fn test_load_unknown_alias_names_file_and_host() {
        let host = HOST_MINIMAL.to_string()
            + "    bothit_recache:\n      match_ua: [\"$Unregistered\"]\n";
        let (_dir, main) = write_tree(MAIN_MINIMAL, &[("shop.yaml", &host)]);
        let err = load_config(&main).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("$Unregistered"), "{msg}");
        assert!(msg.contains("host_id=shop"), "{msg}");
        assert!(msg.contains("Available aliases:"), "{msg}");
    }

    #[test]
    fn test_load_rejects_dangling_unmatched_dimension() {
        let host = HOST_MINIMAL.replace(
            "render: {}",
            "render:\n      unmatched_dimension: tablet",
        );
        let (_dir, main) = write_tree(MAIN_MINIMAL, &[("shop.yaml", &host)]);
        let err = load_config(&main).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'tablet'"), "{msg}");
        assert!(msg.contains("host 'shop'"), "{msg}");
    }

    #[test]
    fn test_load_accepts_unmatched_dimension_by_id() {
        let main = MAIN_MINIMAL.replace(
            "render:\n  timeout_seconds: 30",
            "render:\n  timeout_seconds: 30\n  unmatched_dimension: desktop\n  dimensions:\n    - id: desktop\n      width: 1920\n      height: 1080\n      render_ua: gateway-renderer/1.0\n      match_ua: [\"$SearchBots\"]",
        );
        let (_dir, main) = write_tree(&main, &[("shop.yaml", HOST_MINIMAL)]);
        let loaded = load_config(&main).unwrap();
        assert_eq!(loaded.config.render.unmatched_dimension, "desktop");
    }

    #[test]
    fn test_include_glob_pattern() {
        let main = MAIN_MINIMAL.replace("include: hosts", "include: hosts/shop*.yaml");
        let ignored = HOST_MINIMAL
            .replace("id: shop", "id: other")
            .replace("shop.example.com", "other.example.com");
        let (_dir, main) = write_tree(
            &main,
            &[("shop.yaml", HOST_MINIMAL), ("zz.yaml", &ignored)],
        );
        let loaded = load_config(&main).unwrap();
        assert_eq!(loaded.snapshot.len(), 1);
        assert!(loaded.snapshot.host_by_domain("other.example.com").is_none());
    }
}
