use crate::config::{GatewayConfig, Host};
use crate::error::Result;
use crate::hosts::HostsSnapshot;
use crate::loader::load_config;
use crate::resolver::ConfigResolver;
use arc_swap::{ArcSwap, ArcSwapOption};
use metrics::counter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Owns the loaded configuration and publishes it to the request path.
///
/// Readers load each atomic pointer at most once per request and treat the
/// value behind it as immutable; a reload builds a complete replacement off
/// the request path and swaps the pointers. Reloads are serialized, readers
/// never block, and a snapshot taken before a swap stays valid until its
/// last reader drops it.
pub struct ConfigManager {
    config_path: PathBuf,
    config: ArcSwap<GatewayConfig>,
    hosts: ArcSwapOption<HostsSnapshot>,
    reload_lock: Mutex<()>,
}

impl ConfigManager {
    /// Load the configuration tree and construct the manager. A load
    /// failure aborts startup; nothing is published.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let loaded = load_config(&path)?;
        Ok(Self {
            config_path: path,
            config: ArcSwap::from_pointee(loaded.config),
            hosts: ArcSwapOption::from_pointee(loaded.snapshot),
            reload_lock: Mutex::new(()),
        })
    }

    /// Reload from the same path and atomically swap both the global
    /// config and the hosts snapshot. On failure the published state is
    /// left untouched.
    pub fn reload(&self) -> Result<()> {
        let _serialized = self.reload_lock.lock().unwrap_or_else(|e| e.into_inner());
        let loaded = load_config(&self.config_path)?;

        self.config.store(Arc::new(loaded.config));
        self.hosts.store(Some(Arc::new(loaded.snapshot)));
        counter!("gateway_config_reloads_total", 1);
        info!(path = %self.config_path.display(), "Configuration swapped");
        Ok(())
    }

    /// Current global configuration
    pub fn get_config(&self) -> Arc<GatewayConfig> {
        self.config.load_full()
    }

    /// Current hosts snapshot, `None` after `set_hosts(None)`
    pub fn get_hosts(&self) -> Option<Arc<HostsSnapshot>> {
        self.hosts.load_full()
    }

    /// Case-insensitive O(1) domain lookup. Never fails: an unknown domain
    /// or a cleared snapshot yields `None`.
    pub fn get_host_by_domain(&self, domain: &str) -> Option<Arc<Host>> {
        let snapshot = self.hosts.load();
        let host = snapshot
            .as_ref()
            .and_then(|s| s.host_by_domain(domain).cloned());
        if host.is_none() {
            counter!("gateway_domain_lookup_misses_total", 1);
        }
        host
    }

    /// Atomically replace the hosts snapshot; `None` clears it
    pub fn set_hosts(&self, snapshot: Option<HostsSnapshot>) {
        self.hosts.store(snapshot.map(Arc::new));
    }

    /// Convenience facade: a resolver bound to the host serving `domain`,
    /// sharing the currently published config
    pub fn resolver_for_domain(&self, domain: &str) -> Option<ConfigResolver> {
        let host = self.get_host_by_domain(domain)?;
        Some(ConfigResolver::new(self.config.load_full(), host))
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("config_path", &self.config_path)
            .field("hosts", &self.get_hosts().map(|s| s.len()))
            .finish()
    }
}
