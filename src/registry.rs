//! Container registry: handle -> container actor lookup.
//!
//! A `parking_lot::Mutex<HashMap<...>>` behind one lock; no per-entry
//! locking because lookups are brief (clone a handle to an actor) and
//! all the interesting work happens inside the container actor itself.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::RegistryError;

/// A registry is generic over whatever handle a container actor is
/// represented by in the caller (e.g. an `mpsc::Sender<ActorCommand>`
/// wrapped in an `Arc`), so it doesn't need to know about container
/// internals.
pub struct Registry<T> {
    containers: Mutex<HashMap<String, Arc<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, handle: String, container: Arc<T>) -> Result<(), RegistryError> {
        let mut containers = self.containers.lock();
        if containers.contains_key(&handle) {
            return Err(RegistryError::AlreadyRegistered);
        }
        containers.insert(handle, container);
        Ok(())
    }

    pub fn unregister(&self, handle: &str) -> Result<(), RegistryError> {
        let mut containers = self.containers.lock();
        if containers.remove(handle).is_none() {
            return Err(RegistryError::NotRegistered);
        }
        Ok(())
    }

    pub fn find(&self, handle: &str) -> Option<Arc<T>> {
        self.containers.lock().get(handle).cloned()
    }

    pub fn handles(&self) -> Vec<String> {
        self.containers.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.containers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_find_round_trips() {
        let reg: Registry<u32> = Registry::new();
        reg.register("h1".to_string(), Arc::new(42)).unwrap();
        assert_eq!(*reg.find("h1").unwrap(), 42);
    }

    #[test]
    fn double_register_is_rejected() {
        let reg: Registry<u32> = Registry::new();
        reg.register("h1".to_string(), Arc::new(1)).unwrap();
        assert_eq!(
            reg.register("h1".to_string(), Arc::new(2)).unwrap_err(),
            RegistryError::AlreadyRegistered
        );
    }

    #[test]
    fn unregister_unknown_handle_is_an_error() {
        let reg: Registry<u32> = Registry::new();
        assert_eq!(
            reg.unregister("missing").unwrap_err(),
            RegistryError::NotRegistered
        );
    }

    #[test]
    fn handles_lists_all_registered_containers() {
        let reg: Registry<u32> = Registry::new();
        reg.register("a".to_string(), Arc::new(1)).unwrap();
        reg.register("b".to_string(), Arc::new(2)).unwrap();
        let mut handles = reg.handles();
        handles.sort();
        assert_eq!(handles, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn unregister_then_register_again_succeeds() {
        let reg: Registry<u32> = Registry::new();
        reg.register("h1".to_string(), Arc::new(1)).unwrap();
        reg.unregister("h1").unwrap();
        reg.register("h1".to_string(), Arc::new(2)).unwrap();
        assert_eq!(*reg.find("h1").unwrap(), 2);
    }
}
