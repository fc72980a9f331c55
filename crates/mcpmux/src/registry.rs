use mcpmux_proto::ServiceDescriptor;
use std::collections::HashMap;

/// In-memory service registry. No persistence: the bridge starts empty and
/// `register` is the only way in.
#[derive(Debug, Default)]
pub(crate) struct ServiceRegistry {
    services: HashMap<String, ServiceDescriptor>,
}

impl ServiceRegistry {
    /// Insert or silently replace the descriptor for `descriptor.name`.
    pub(crate) fn insert(&mut self, descriptor: ServiceDescriptor) {
        self.services.insert(descriptor.name.clone(), descriptor);
    }

    /// Remove and return the descriptor, if registered.
    pub(crate) fn remove(&mut self, name: &str) -> Option<ServiceDescriptor> {
        self.services.remove(name)
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut ServiceDescriptor> {
        self.services.get_mut(name)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.services.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpmux_proto::{RegisterParams, ServiceKind};

    fn descriptor(name: &str, command: &str) -> ServiceDescriptor {
        ServiceDescriptor::from_register(
            RegisterParams {
                name: name.to_string(),
                service_type: Some("local".to_string()),
                command: Some(command.to_string()),
                ..RegisterParams::default()
            },
            0,
        )
        .unwrap()
    }

    #[test]
    fn duplicate_register_replaces_silently() {
        let mut registry = ServiceRegistry::default();
        registry.insert(descriptor("t", "node"));
        registry.insert(descriptor("t", "python"));

        assert_eq!(registry.names().len(), 1);
        match &registry.get("t").unwrap().kind {
            ServiceKind::Local { command, .. } => assert_eq!(command, "python"),
            other => panic!("expected local, got {other:?}"),
        }
    }

    #[test]
    fn remove_is_not_idempotent() {
        let mut registry = ServiceRegistry::default();
        registry.insert(descriptor("t", "node"));

        assert!(registry.remove("t").is_some());
        assert!(registry.remove("t").is_none());
    }

    #[test]
    fn clear_empties_the_registry() {
        let mut registry = ServiceRegistry::default();
        registry.insert(descriptor("a", "node"));
        registry.insert(descriptor("b", "node"));
        registry.clear();

        assert!(registry.names().is_empty());
        assert!(!registry.contains("a"));
    }
}
