use crate::bots::{expand_bothit_aliases, expand_dimension_aliases};
use crate::config::{Host, RenderConfig, RuleAction};
use crate::error::{GatewayError, Result};
use crate::rules::sort_url_rules;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Prepare one host for serving: inherit from the global layer, expand
/// aliases, compile patterns, sort rules.
///
/// `context` identifies the host for error messages
/// (`"{file}:host_id={id}"`). Preparation aborts on the first error.
pub fn prepare_host(host: &mut Host, global_render: &RenderConfig, context: &str) -> Result<()> {
    if host.all_domains().is_empty() {
        return Err(GatewayError::Config(format!(
            "{context} declares no domain"
        )));
    }

    // Global dimensions were expanded and compiled before any host is
    // prepared, so an inheriting host skips that work.
    if host.render.dimensions.is_empty() && !global_render.dimensions.is_empty() {
        host.render.dimensions = global_render.dimensions.clone();
        host.dimensions_inherited = true;
        debug!(
            host = %host.id,
            dimensions = host.render.dimensions.len(),
            "Host inherits global dimensions"
        );
    }

    // Field-level event inheritance
    if host.render.events.wait_for.is_none() {
        host.render.events.wait_for = global_render.events.wait_for;
    }
    if host.render.events.additional_wait_ms.is_none() {
        host.render.events.additional_wait_ms = global_render.events.additional_wait_ms;
    }

    if !host.dimensions_inherited {
        expand_dimension_aliases(&mut host.render.dimensions, context)?;
    }
    validate_dimension_ids(host, context)?;

    if let Some(bothit) = &mut host.bothit_recache {
        expand_bothit_aliases(bothit, &format!("{context}:bothit_recache"))?;
    }

    for (index, rule) in host.url_rules.iter_mut().enumerate() {
        if let Some(bothit) = &mut rule.bothit_recache {
            expand_bothit_aliases(bothit, &format!("{context}:url_rule[{index}]"))?;
        }
        if rule.action == RuleAction::Status {
            let has_code = rule.status.as_ref().and_then(|s| s.code).is_some();
            if !has_code {
                return Err(GatewayError::Config(format!(
                    "{context}:url_rule[{index}] uses action 'status' without a status.code"
                )));
            }
        }
    }

    host.url_rules = sort_url_rules(&host.url_rules, context)?;
    Ok(())
}

fn validate_dimension_ids(host: &Host, context: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for dimension in &host.render.dimensions {
        if !seen.insert(dimension.id.as_str()) {
            return Err(GatewayError::Config(format!(
                "{context} declares dimension id '{}' more than once",
                dimension.id
            )));
        }
    }
    Ok(())
}

/// Immutable set of prepared hosts with an O(1) domain index.
///
/// A snapshot is built off the request path and published whole through an
/// atomic pointer; readers treat it as read-only. Every domain key maps to
/// the same `Arc` as the corresponding `hosts` entry.
#[derive(Debug, Default)]
pub struct HostsSnapshot {
    hosts: Vec<Arc<Host>>,
    by_domain: HashMap<String, Arc<Host>>,
}

impl HostsSnapshot {
    /// Build a snapshot from prepared hosts, rejecting domains that appear
    /// on more than one host (compared lowercased).
    pub fn build(hosts: Vec<Host>) -> Result<Self> {
        let hosts: Vec<Arc<Host>> = hosts.into_iter().map(Arc::new).collect();
        let mut by_domain = HashMap::new();

        for host in &hosts {
            for domain in host.all_domains() {
                let key = domain.to_lowercase();
                if let Some(existing) = by_domain.insert(key.clone(), Arc::clone(host)) {
                    return Err(GatewayError::Reference(format!(
                        "domain '{key}' is declared by both host '{}' and host '{}'",
                        existing.id, host.id
                    )));
                }
            }
        }

        Ok(Self { hosts, by_domain })
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    /// Case-insensitive domain lookup
    pub fn host_by_domain(&self, domain: &str) -> Option<&Arc<Host>> {
        self.by_domain.get(&domain.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
