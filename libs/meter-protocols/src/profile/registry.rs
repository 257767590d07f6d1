//! Model name -> profile lookup table
//!
//! Constructed by the caller and passed to whoever resolves device types;
//! there is no global registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{dds661, sdm230, DeviceProfile};
use crate::error::{MeterError, Result};

#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Arc<DeviceProfile>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every profile shipped with this crate
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(dds661());
        registry.register(sdm230());
        registry
    }

    /// Add or replace a profile under its model name
    pub fn register(&mut self, profile: DeviceProfile) {
        self.profiles
            .insert(profile.model().to_lowercase(), Arc::new(profile));
    }

    /// Case-insensitive lookup
    pub fn get(&self, model: &str) -> Result<Arc<DeviceProfile>> {
        self.profiles
            .get(&model.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| MeterError::UnknownModel(model.to_string()))
    }

    pub fn contains(&self, model: &str) -> bool {
        self.profiles.contains_key(&model.trim().to_lowercase())
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Arc<DeviceProfile>> {
        self.profiles.values()
    }
}
