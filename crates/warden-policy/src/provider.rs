//! Providers and resource plugins.
//!
//! A provider is a named registry of resource types. Each registered type
//! carries its descriptor plus its own filter and action registries, which
//! start from the shared base sets and are extended with type-specific
//! plugins (a `delete` mapped to the type's terminate operation, a
//! specialized filter, and so on).

use std::sync::Arc;

use warden_core::error::PolicyError;
use warden_core::registry::{Registry, RegistryEvent};
use warden_core::resource::ResourceTypeDef;

use crate::actions::{ActionPlugin, ActionRegistry, base_action_registry};
use crate::filters::{FilterPlugin, FilterRegistry, base_filter_registry};

/// One registered resource type: descriptor plus its plugin registries.
pub struct ResourcePlugin {
    pub type_def: ResourceTypeDef,
    pub filters: FilterRegistry,
    pub actions: ActionRegistry,
}

impl ResourcePlugin {
    /// A plugin seeded with the base filter and action sets.
    pub fn new(type_def: ResourceTypeDef) -> Self {
        let mut filters = FilterRegistry::new(format!("{}.filters", type_def.name));
        filters.merge_base(&base_filter_registry());
        let mut actions = ActionRegistry::new(format!("{}.actions", type_def.name));
        actions.merge_base(&base_action_registry());
        Self {
            type_def,
            filters,
            actions,
        }
    }

    pub fn with_filter(
        mut self,
        name: &str,
        plugin: Arc<FilterPlugin>,
    ) -> Result<Self, PolicyError> {
        self.filters.register(name, plugin)?;
        Ok(self)
    }

    pub fn with_action(
        mut self,
        name: &str,
        plugin: Arc<ActionPlugin>,
    ) -> Result<Self, PolicyError> {
        self.actions.register(name, plugin)?;
        Ok(self)
    }
}

/// A cloud provider: a name and its resource-type registry.
pub struct Provider {
    pub name: String,
    pub resources: Registry<ResourcePlugin>,
}

impl Provider {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            resources: Registry::new(format!("{name}.resources")),
            name,
        }
    }

    /// Register a resource type under its descriptor name.
    pub fn register_resource(&mut self, plugin: ResourcePlugin) -> Result<(), PolicyError> {
        let name = plugin.type_def.name.clone();
        self.resources.register(&name, Arc::new(plugin))?;
        self.resources
            .notify(RegistryEvent::ResourceAdd, Some(&name));
        Ok(())
    }

    pub fn resource(&self, name: &str) -> Option<Arc<ResourcePlugin>> {
        self.resources.get(name)
    }

    /// Mark registration complete, firing cross-plugin hooks.
    pub fn finalize(&self) {
        self.resources.notify(RegistryEvent::Final, None);
    }
}
