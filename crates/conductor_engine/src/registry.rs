//! Provider Registry
//!
//! Static provider definitions plus the dynamic state other components
//! publish about them: health from the monitor, process availability from
//! the lifecycle manager. Everything sits behind one `RwLock`, so routing
//! reads proceed in parallel while updates are serialized.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::types::{Provider, ProviderHealth};

/// Everything the router needs to know about one provider, read under a
/// single lock acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSnapshot {
    pub provider: Provider,
    pub health: ProviderHealth,
    /// `None` when the orchestrator does not manage a process for this
    /// provider; otherwise whether a handle is currently `running`.
    pub process_running: Option<bool>,
}

#[derive(Debug)]
struct Entry {
    provider: Provider,
    health: ProviderHealth,
    process_running: Option<bool>,
}

impl Entry {
    fn new(provider: Provider) -> Self {
        let process_running = provider.is_managed().then_some(false);
        Self {
            provider,
            health: ProviderHealth::default(),
            process_running,
        }
    }

    fn snapshot(&self) -> ProviderSnapshot {
        ProviderSnapshot {
            provider: self.provider.clone(),
            health: self.health.clone(),
            process_running: self.process_running,
        }
    }
}

#[derive(Debug, Default)]
pub struct ProviderRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a list, rejecting duplicate ids.
    pub fn with_providers(providers: Vec<Provider>) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for provider in providers {
            registry.register(provider)?;
        }
        Ok(registry)
    }

    pub fn register(&self, provider: Provider) -> Result<(), RegistryError> {
        let mut entries = self.entries.write();
        if entries.contains_key(&provider.id) {
            return Err(RegistryError::Duplicate(provider.id));
        }
        debug!(provider = %provider.id, kind = %provider.kind, "Provider registered");
        entries.insert(provider.id.clone(), Entry::new(provider));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Provider, RegistryError> {
        self.entries
            .read()
            .get(id)
            .map(|e| e.provider.clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Enabled providers, lowest priority number first. Ties are ordered by
    /// id so the listing is deterministic.
    pub fn list_enabled(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self
            .entries
            .read()
            .values()
            .filter(|e| e.provider.enabled)
            .map(|e| e.provider.clone())
            .collect();
        providers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        providers
    }

    /// Every provider, enabled or not, in the same order as `list_enabled`.
    pub fn list(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self
            .entries
            .read()
            .values()
            .map(|e| e.provider.clone())
            .collect();
        providers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        providers
    }

    /// Swap in a new provider set. Health and process state survive for ids
    /// present in both sets. On error the registry is left untouched.
    pub fn replace(&self, providers: Vec<Provider>) -> Result<(), RegistryError> {
        let mut fresh: HashMap<String, Entry> = HashMap::with_capacity(providers.len());
        for provider in providers {
            if fresh.contains_key(&provider.id) {
                return Err(RegistryError::Duplicate(provider.id));
            }
            fresh.insert(provider.id.clone(), Entry::new(provider));
        }

        let mut entries = self.entries.write();
        for (id, entry) in fresh.iter_mut() {
            if let Some(old) = entries.get(id) {
                entry.health = old.health.clone();
                if entry.process_running.is_some() {
                    entry.process_running = Some(old.process_running.unwrap_or(false));
                }
            }
        }
        *entries = fresh;
        info!(count = entries.len(), "Provider registry replaced");
        Ok(())
    }

    /// Operator or lifecycle toggle. Returns the previous value.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, RegistryError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let previous = std::mem::replace(&mut entry.provider.enabled, enabled);
        if previous != enabled {
            info!(provider = id, enabled, "Provider enabled flag changed");
        }
        Ok(previous)
    }

    pub fn health(&self, id: &str) -> Result<ProviderHealth, RegistryError> {
        self.entries
            .read()
            .get(id)
            .map(|e| e.health.clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Mutate a provider's health in place. Reserved for the health monitor.
    pub(crate) fn update_health<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ProviderHealth) -> R,
    ) -> Result<R, RegistryError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok(f(&mut entry.health))
    }

    /// Publish whether a managed provider currently has a running process.
    /// Ignored for providers the orchestrator does not manage.
    pub(crate) fn set_process_running(&self, id: &str, running: bool) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(id)
            && entry.process_running.is_some()
        {
            entry.process_running = Some(running);
        }
    }

    pub fn snapshot(&self, id: &str) -> Result<ProviderSnapshot, RegistryError> {
        self.entries
            .read()
            .get(id)
            .map(Entry::snapshot)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Snapshots for several providers at once. Unknown ids are skipped.
    pub fn snapshots<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> HashMap<String, ProviderSnapshot> {
        let entries = self.entries.read();
        ids.into_iter()
            .filter_map(|id| entries.get(id).map(|e| (id.to_string(), e.snapshot())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HealthStatus, ProviderKind};
    use conductor_core::config::LaunchConfig;

    fn remote(id: &str, priority: u32) -> Provider {
        Provider::new(id, "https://api.example.com", ProviderKind::RemoteApi, &["m"])
            .with_priority(priority)
    }

    fn managed(id: &str) -> Provider {
        Provider::new(id, "http://127.0.0.1:9100", ProviderKind::LocalProcess, &["m"])
            .with_launch(LaunchConfig {
                command: "server".into(),
                args: vec![],
                port: 9100,
                env: Default::default(),
                autostart: false,
            })
    }

    #[test]
    fn register_rejects_duplicates() {
        let registry = ProviderRegistry::new();
        registry.register(remote("a", 1)).unwrap();
        assert_eq!(
            registry.register(remote("a", 2)),
            Err(RegistryError::Duplicate("a".into()))
        );
        assert_eq!(registry.get("a").unwrap().priority, 1);
    }

    #[test]
    fn get_unknown_is_not_found() {
        let registry = ProviderRegistry::new();
        assert_eq!(
            registry.get("nope"),
            Err(RegistryError::NotFound("nope".into()))
        );
        assert!(registry.health("nope").is_err());
    }

    #[test]
    fn list_enabled_orders_by_priority_and_skips_disabled() {
        let registry = ProviderRegistry::with_providers(vec![
            remote("c", 3),
            remote("a", 1),
            remote("b", 2).disabled(),
            remote("d", 1),
        ])
        .unwrap();
        let ids: Vec<_> = registry.list_enabled().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, ["a", "d", "c"]);
        assert_eq!(registry.list().len(), 4);
    }

    #[test]
    fn set_enabled_toggles() {
        let registry = ProviderRegistry::with_providers(vec![remote("a", 1)]).unwrap();
        assert!(registry.set_enabled("a", false).unwrap());
        assert!(registry.list_enabled().is_empty());
        assert!(!registry.set_enabled("a", true).unwrap());
        assert!(registry.set_enabled("zzz", true).is_err());
    }

    #[test]
    fn managed_providers_start_without_running_process() {
        let registry =
            ProviderRegistry::with_providers(vec![managed("local"), remote("cloud", 1)]).unwrap();
        assert_eq!(registry.snapshot("local").unwrap().process_running, Some(false));
        assert_eq!(registry.snapshot("cloud").unwrap().process_running, None);

        registry.set_process_running("local", true);
        registry.set_process_running("cloud", true);
        assert_eq!(registry.snapshot("local").unwrap().process_running, Some(true));
        assert_eq!(registry.snapshot("cloud").unwrap().process_running, None);
    }

    #[test]
    fn replace_keeps_state_for_surviving_ids() {
        let registry =
            ProviderRegistry::with_providers(vec![managed("local"), remote("old", 1)]).unwrap();
        registry
            .update_health("local", |h| h.status = HealthStatus::Healthy)
            .unwrap();
        registry.set_process_running("local", true);

        registry
            .replace(vec![managed("local"), remote("new", 5)])
            .unwrap();

        assert!(!registry.contains("old"));
        assert!(registry.contains("new"));
        let local = registry.snapshot("local").unwrap();
        assert_eq!(local.health.status, HealthStatus::Healthy);
        assert_eq!(local.process_running, Some(true));
    }

    #[test]
    fn replace_with_duplicates_leaves_registry_untouched() {
        let registry = ProviderRegistry::with_providers(vec![remote("a", 1)]).unwrap();
        let result = registry.replace(vec![remote("x", 1), remote("x", 2)]);
        assert_eq!(result, Err(RegistryError::Duplicate("x".into())));
        assert!(registry.contains("a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshots_skip_unknown_ids() {
        let registry =
            ProviderRegistry::with_providers(vec![remote("a", 1), remote("b", 2)]).unwrap();
        let snaps = registry.snapshots(["a", "ghost", "b"]);
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps["b"].provider.priority, 2);
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let registry = std::sync::Arc::new(
            ProviderRegistry::with_providers(vec![remote("a", 1)]).unwrap(),
        );
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = std::sync::Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if i % 2 == 0 {
                            registry
                                .update_health("a", |h| h.consecutive_failures += 1)
                                .unwrap();
                        } else {
                            let _ = registry.list_enabled();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.health("a").unwrap().consecutive_failures, 800);
    }
}
