//! Type-keyed component registry.
//!
//! Features register shared services here during setup. Once activation is
//! done the registry is frozen into an `Arc` and handed to step factories
//! and handler contexts.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

/// Opaque registration surface for shared components
#[derive(Default)]
pub struct ComponentRegistry {
    components: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    names: HashMap<TypeId, &'static str>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component, replacing a previous one of the same type
    pub fn register<T: Any + Send + Sync>(&mut self, component: T) {
        let id = TypeId::of::<T>();
        self.components.insert(id, Box::new(component));
        self.names.insert(id, std::any::type_name::<T>());
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.components
            .get(&TypeId::of::<T>())
            .and_then(|c| c.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.components
            .get_mut(&TypeId::of::<T>())
            .and_then(|c| c.downcast_mut::<T>())
    }

    /// Get a component, registering `T::default()` first when missing
    pub fn get_or_insert_default<T: Any + Send + Sync + Default>(&mut self) -> &mut T {
        let id = TypeId::of::<T>();
        self.names.entry(id).or_insert_with(std::any::type_name::<T>);
        let entry = self
            .components
            .entry(id)
            .or_insert_with(|| Box::new(T::default()));

        match entry.downcast_mut::<T>() {
            Some(component) => component,
            // Keyed by TypeId::of::<T>, so the downcast cannot fail.
            None => unreachable!("component registry entry has mismatched type"),
        }
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.components.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Type names of all registered components, sorted
    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.names.values().copied().collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.registered_types())
            .finish()
    }
}
