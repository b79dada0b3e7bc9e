use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::encoding::InstanceId;
use crate::error::Result;
use crate::svmap::SvMap;
use crate::store::KvStore;
use crate::version::{AncestryProvider, VersionId};
use crate::Uuid;

/// Process-wide table of per-instance supervoxel maps.
///
/// Constructed once at startup and passed explicitly to the services that
/// need mappings; maps are created lazily on first access, initialized from
/// their mapping logs up to the requested version, and live until the
/// registry is dropped at shutdown.
pub struct InstanceRegistry {
    config: Config,
    dag: Arc<dyn AncestryProvider>,
    store: KvStore,
    maps: Mutex<HashMap<Uuid, Arc<SvMap>>>,
    instance_ids: Mutex<HashMap<Uuid, InstanceId>>,
    next_instance: Mutex<u32>,
}

impl InstanceRegistry {
    pub fn new(config: Config, dag: Arc<dyn AncestryProvider>, store: KvStore) -> Self {
        Self {
            config,
            dag,
            store,
            maps: Mutex::new(HashMap::new()),
            instance_ids: Mutex::new(HashMap::new()),
            next_instance: Mutex::new(1),
        }
    }

    /// Stable per-process numeric id for a named instance.
    pub fn instance_id(&self, uuid: &Uuid) -> InstanceId {
        let mut ids = self.instance_ids.lock().unwrap();
        if let Some(id) = ids.get(uuid) {
            return *id;
        }
        let mut next = self.next_instance.lock().unwrap();
        let id = InstanceId(*next);
        *next += 1;
        ids.insert(uuid.clone(), id);
        id
    }

    /// Returns the instance's supervoxel map, creating it on first access
    /// and replaying its mapping logs up to the given version.
    pub fn mapping(&self, uuid: &Uuid, v: VersionId) -> Result<Arc<SvMap>> {
        let svmap = {
            let mut maps = self.maps.lock().unwrap();
            match maps.get(uuid) {
                Some(m) => Arc::clone(m),
                None => {
                    let dir = self.log_dir(uuid);
                    let svmap = if self.config.persist_mapping {
                        SvMap::open_with_store(
                            dir,
                            Arc::clone(&self.dag),
                            Arc::clone(&self.store),
                            self.instance_id(uuid),
                        )?
                    } else {
                        SvMap::open(dir, Arc::clone(&self.dag))?
                    };
                    let svmap = Arc::new(svmap);
                    maps.insert(uuid.clone(), Arc::clone(&svmap));
                    svmap
                }
            }
        };
        svmap.init_to_version(v)?;
        Ok(svmap)
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn log_dir(&self, uuid: &Uuid) -> PathBuf {
        self.config.dir.join(uuid.0.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::version::VersionDag;
    use tempfile::TempDir;

    #[test]
    fn test_lazy_create_and_reuse() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let dag = Arc::new(VersionDag::new());
        let store: KvStore = Arc::new(MemoryStore::new());
        let registry = InstanceRegistry::new(Config::new(dir.path()), dag.clone(), store);

        let uuid = Uuid::new("seg");
        let first = registry.mapping(&uuid, dag.root()).unwrap();
        let second = registry.mapping(&uuid, dag.root()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_distinct_instances_get_distinct_maps() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let dag = Arc::new(VersionDag::new());
        let store: KvStore = Arc::new(MemoryStore::new());
        let registry = InstanceRegistry::new(Config::new(dir.path()), dag.clone(), store);

        let a = registry.mapping(&Uuid::new("a"), dag.root()).unwrap();
        let b = registry.mapping(&Uuid::new("b"), dag.root()).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        assert_ne!(
            registry.instance_id(&Uuid::new("a")),
            registry.instance_id(&Uuid::new("b"))
        );
        // Ids are stable across calls.
        assert_eq!(
            registry.instance_id(&Uuid::new("a")),
            registry.instance_id(&Uuid::new("a"))
        );
    }

    #[test]
    fn test_mapping_initialized_to_version() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let dag = Arc::new(VersionDag::new());
        let store: KvStore = Arc::new(MemoryStore::new());
        let uuid = Uuid::new("seg");
        let leaf = dag.new_child(dag.root()).unwrap();

        {
            let registry =
                InstanceRegistry::new(Config::new(dir.path()), dag.clone(), Arc::clone(&store));
            let svmap = registry.mapping(&uuid, dag.root()).unwrap();
            svmap.map_supervoxel(dag.root(), 2, 20).unwrap();
        }

        // A new registry replays the instance's log on first access.
        let registry = InstanceRegistry::new(Config::new(dir.path()), dag.clone(), store);
        let svmap = registry.mapping(&uuid, leaf).unwrap();
        assert_eq!(svmap.mapped_label(leaf, 2).unwrap(), (20, true));
    }
}
