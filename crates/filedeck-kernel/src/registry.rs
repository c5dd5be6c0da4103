//! Process-scoped registries: backend kinds and mounted volumes.
//!
//! Both are plain values handed to the dispatcher at construction, so
//! independent instances (tests, multiple servers) never share state.

use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ConfigError, KernelConfig};
use crate::hash::{self, HashError};
use crate::vfs::BackendFactory;
use crate::vfs::backends::{FtpFactory, LocalFactory, MemoryFactory};
use crate::volume::{Volume, VolumeContext};

/// Backend kind selector → factory.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<&'static str, Arc<dyn BackendFactory>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("BackendRegistry").field("kinds", &kinds).finish()
    }
}

impl BackendRegistry {
    /// Registry with `local`, `ftp` and `memory`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(LocalFactory));
        registry.register(Arc::new(FtpFactory::default()));
        registry.register(Arc::new(MemoryFactory::default()));
        registry
    }

    /// Add or replace the factory for its kind.
    pub fn register(&mut self, factory: Arc<dyn BackendFactory>) {
        self.factories.insert(factory.kind(), factory);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn BackendFactory>> {
        self.factories.get(kind).cloned()
    }

    /// Factory offered to `netmount` under `protocol`.
    pub fn by_protocol(&self, protocol: &str) -> Option<Arc<dyn BackendFactory>> {
        self.factories
            .values()
            .find(|f| f.net_protocol() == Some(protocol))
            .cloned()
    }

    /// Protocols clients may net-mount, sorted.
    pub fn net_protocols(&self) -> Vec<&'static str> {
        let mut protocols: Vec<_> = self
            .factories
            .values()
            .filter_map(|f| f.net_protocol())
            .collect();
        protocols.sort_unstable();
        protocols
    }
}

/// Mounted volumes in mount order. The first one is the default volume.
#[derive(Debug, Default)]
pub struct VolumeRegistry {
    volumes: RwLock<IndexMap<String, Arc<Volume>>>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured volume.
    ///
    /// Expects a normalized config; unknown driver kinds are errors.
    pub fn from_config(
        config: &KernelConfig,
        backends: &BackendRegistry,
        ctx: &VolumeContext,
    ) -> Result<Self, ConfigError> {
        let registry = Self::new();
        for volume in &config.volumes {
            let factory = backends.get(&volume.driver).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "volume {}: unknown driver '{}'",
                    volume.id, volume.driver
                ))
            })?;
            let volume = Arc::new(Volume::new(volume.clone(), factory, ctx)?);
            if !registry.mount(volume) {
                return Err(ConfigError::Invalid("duplicate volume id".to_string()));
            }
        }
        Ok(registry)
    }

    /// Add a volume. Returns false if its id is taken.
    pub fn mount(&self, volume: Arc<Volume>) -> bool {
        let mut volumes = self.volumes.write();
        if volumes.contains_key(volume.id()) {
            return false;
        }
        volumes.insert(volume.id().to_string(), volume);
        true
    }

    /// Remove a volume, keeping the order of the rest.
    pub fn unmount(&self, id: &str) -> Option<Arc<Volume>> {
        self.volumes.write().shift_remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Volume>> {
        self.volumes.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.volumes.read().contains_key(id)
    }

    /// The default volume.
    pub fn first(&self) -> Option<Arc<Volume>> {
        self.volumes.read().first().map(|(_, v)| v.clone())
    }

    /// Snapshot of every volume in mount order.
    pub fn list(&self) -> Vec<Arc<Volume>> {
        self.volumes.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.volumes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.read().is_empty()
    }

    /// Resolve a hash token to its volume and backend id.
    pub fn unhash(&self, token: &str) -> Result<(Arc<Volume>, String), HashError> {
        let (volume_id, id) = hash::decode(token)?;
        let volume = self
            .get(volume_id)
            .ok_or_else(|| HashError::UnknownVolume(volume_id.to_string()))?;
        Ok((volume, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfig;

    fn ctx() -> VolumeContext {
        VolumeContext::rooted(&std::env::temp_dir())
    }

    fn memory_volume(id: &str) -> Arc<Volume> {
        let config = VolumeConfig {
            id: id.to_string(),
            name: id.to_string(),
            driver: "memory".to_string(),
            ..Default::default()
        };
        Arc::new(Volume::new(config, Arc::new(MemoryFactory::default()), &ctx()).unwrap())
    }

    #[test]
    fn test_mount_order_and_duplicates() {
        let registry = VolumeRegistry::new();
        assert!(registry.first().is_none());
        assert!(registry.mount(memory_volume("a_")));
        assert!(registry.mount(memory_volume("b_")));
        assert!(!registry.mount(memory_volume("a_")));
        assert_eq!(registry.first().unwrap().id(), "a_");

        registry.unmount("a_");
        assert_eq!(registry.first().unwrap().id(), "b_");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unhash() {
        let registry = VolumeRegistry::new();
        registry.mount(memory_volume("m_"));

        let token = hash::encode("m_", "/docs/a.txt");
        let (volume, id) = registry.unhash(&token).unwrap();
        assert_eq!(volume.id(), "m_");
        assert_eq!(id, "/docs/a.txt");

        let unknown = hash::encode("x_", "/");
        assert_eq!(
            registry.unhash(&unknown).unwrap_err(),
            HashError::UnknownVolume("x_".to_string())
        );
        assert!(matches!(
            registry.unhash("nosep"),
            Err(HashError::MissingSeparator(_))
        ));
    }

    #[test]
    fn test_from_config_rejects_unknown_driver() {
        let mut config = KernelConfig::default();
        config.volumes.push(VolumeConfig {
            driver: "webdav".to_string(),
            ..VolumeConfig::local("/tmp")
        });
        config.normalize().unwrap();
        let err = VolumeRegistry::from_config(&config, &BackendRegistry::with_defaults(), &ctx())
            .unwrap_err();
        assert!(err.to_string().contains("webdav"));
    }

    #[test]
    fn test_backend_protocols() {
        let backends = BackendRegistry::with_defaults();
        assert_eq!(backends.net_protocols(), ["ftp"]);
        assert_eq!(backends.by_protocol("ftp").unwrap().kind(), "ftp");
        assert!(backends.by_protocol("sftp").is_none());
        assert!(backends.get("local").is_some());
    }
}
