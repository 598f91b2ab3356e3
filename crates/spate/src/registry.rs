use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::{config::InstanceId, error::Error, instance::Instance};

/// Process-wide list of live instances, owned by the engine. One mutex
/// guards structure changes only; callers never hold it across blocking IO,
/// and timer callbacks never take it.
#[derive(Default)]
pub(crate) struct Registry {
    instances: Mutex<Vec<Arc<Instance>>>,
}

impl Registry {
    /// Assigns an id and registers the instance built for it, all under the
    /// lock so concurrent starts cannot collide. A requested id <= 0 means
    /// "next free": one larger than the biggest live id. A requested positive
    /// id fails when it is still live.
    pub fn insert_with<F>(&self, requested: InstanceId, build: F) -> Result<Arc<Instance>, Error>
    where
        F: FnOnce(InstanceId) -> Arc<Instance>,
    {
        let mut instances = self.instances.lock().unwrap();
        let id = if requested <= 0 {
            instances.iter().map(|inst| inst.id).max().unwrap_or(0) + 1
        } else {
            if instances.iter().any(|inst| inst.id == requested) {
                warn!(id = requested, "instance id already in use");
                return Err(Error::InstanceExhausted(requested));
            }
            requested
        };
        let instance = build(id);
        instances.push(instance.clone());
        Ok(instance)
    }

    pub fn remove(&self, id: InstanceId) {
        self.instances.lock().unwrap().retain(|inst| inst.id != id);
    }

    pub fn find(&self, id: InstanceId) -> Option<Arc<Instance>> {
        self.instances.lock().unwrap().iter().find(|inst| inst.id == id).cloned()
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Instance>),
    {
        for instance in self.instances.lock().unwrap().iter() {
            f(instance);
        }
    }

    pub fn ids(&self) -> Vec<InstanceId> {
        self.instances.lock().unwrap().iter().map(|inst| inst.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Config, Proto},
        report::StdoutSink,
    };

    fn registry_with_instance(registry: &Arc<Registry>, requested: InstanceId) -> Result<InstanceId, Error> {
        let cfg = Config::client(Proto::Udp, "127.0.0.1".parse().unwrap());
        registry
            .insert_with(requested, |id| {
                Arc::new(Instance::new(&cfg, id, Arc::new(StdoutSink), None, registry.clone()))
            })
            .map(|inst| inst.id)
    }

    #[test]
    fn auto_ids_start_at_one_and_grow() {
        let registry = Arc::new(Registry::default());
        assert_eq!(registry_with_instance(&registry, 0).unwrap(), 1);
        assert_eq!(registry_with_instance(&registry, 0).unwrap(), 2);
        assert_eq!(registry_with_instance(&registry, -5).unwrap(), 3);
        assert_eq!(registry.ids(), vec![1, 2, 3]);
    }

    #[test]
    fn requested_id_is_honored_and_guarded() {
        let registry = Arc::new(Registry::default());
        assert_eq!(registry_with_instance(&registry, 7).unwrap(), 7);
        assert!(matches!(
            registry_with_instance(&registry, 7),
            Err(Error::InstanceExhausted(7))
        ));
        // auto assignment continues past the requested id
        assert_eq!(registry_with_instance(&registry, 0).unwrap(), 8);
    }

    #[test]
    fn ids_are_reusable_after_removal() {
        let registry = Arc::new(Registry::default());
        let id = registry_with_instance(&registry, 0).unwrap();
        registry.remove(id);
        assert!(registry.find(id).is_none());
        assert_eq!(registry_with_instance(&registry, 0).unwrap(), id);
    }

    #[test]
    fn find_and_for_each_see_live_instances() {
        let registry = Arc::new(Registry::default());
        registry_with_instance(&registry, 0).unwrap();
        registry_with_instance(&registry, 0).unwrap();
        assert!(registry.find(2).is_some());
        assert!(registry.find(9).is_none());
        let mut seen = 0;
        registry.for_each(|_| seen += 1);
        assert_eq!(seen, 2);
    }
}
