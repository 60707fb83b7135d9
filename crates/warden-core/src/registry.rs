//! Plugin registries.
//!
//! A registry is an ordered name-to-plugin map with subscriber hooks for
//! lifecycle events. Registries form a tree: one per provider holding the
//! resource types, and one filter plus one action registry per resource
//! type. Shared base entries (the value filter, boolean combinators, tag
//! plugins) are merged into each resource's registries when the resource is
//! registered. All registries are read-only after startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::PolicyError;

/// Lifecycle events a registry can emit to its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryEvent {
    /// A batch of plugins from one package finished registering.
    RegisterPackage,
    /// One plugin was registered; the argument is its name.
    RegisterClass,
    /// A resource type was added to a provider registry.
    ResourceAdd,
    /// Registration is complete; cross-plugin hooks may now run.
    Final,
}

type Subscriber<T> = Arc<dyn Fn(&Registry<T>, Option<&str>) + Send + Sync>;

/// Ordered name → plugin map with lifecycle subscribers.
pub struct Registry<T: ?Sized> {
    name: String,
    entries: BTreeMap<String, Arc<T>>,
    subscribers: BTreeMap<&'static str, Vec<Subscriber<T>>>,
}

impl<T: ?Sized> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RegistryEvent {
    fn key(self) -> &'static str {
        match self {
            RegistryEvent::RegisterPackage => "register-package",
            RegistryEvent::RegisterClass => "register-class",
            RegistryEvent::ResourceAdd => "resource-add",
            RegistryEvent::Final => "final",
        }
    }
}

impl<T: ?Sized> Registry<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
            subscribers: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a plugin. Re-registering the same name fails with a
    /// duplicate error unless the plugin is the identical instance, which
    /// is treated as an idempotent no-op.
    pub fn register(&mut self, name: impl Into<String>, plugin: Arc<T>) -> Result<(), PolicyError> {
        let name = name.into();
        if let Some(existing) = self.entries.get(&name) {
            if Arc::ptr_eq(existing, &plugin) {
                return Ok(());
            }
            return Err(PolicyError::invalid(format!(
                "duplicate plugin {:?} in registry {:?}",
                name, self.name
            )));
        }
        self.entries.insert(name.clone(), plugin);
        self.notify(RegistryEvent::RegisterClass, Some(&name));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn items(&self) -> impl Iterator<Item = (&str, &Arc<T>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge every entry of `other` that this registry does not already
    /// have. Used to fold base filter/action sets into a resource's own
    /// registries.
    pub fn merge_base(&mut self, other: &Registry<T>) {
        for (name, plugin) in &other.entries {
            self.entries
                .entry(name.clone())
                .or_insert_with(|| plugin.clone());
        }
    }

    /// Append a subscriber for `event`. Callbacks fire in registration
    /// order; a panicking callback propagates to the caller of `notify`.
    pub fn subscribe(
        &mut self,
        event: RegistryEvent,
        callback: impl Fn(&Registry<T>, Option<&str>) + Send + Sync + 'static,
    ) {
        self.subscribers
            .entry(event.key())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Fan `event` out to subscribers in registration order.
    pub fn notify(&self, event: RegistryEvent, arg: Option<&str>) {
        if let Some(subs) = self.subscribers.get(event.key()) {
            for sub in subs {
                sub(self, arg);
            }
        }
    }
}
