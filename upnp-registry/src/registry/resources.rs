//! Generic expiring resources.

use std::sync::Arc;

use super::item::{is_relative, ResourceEntry};
use super::{Registry, Resource};
use crate::error::{RegistryError, Result};
use crate::expiration::ExpirationDetails;

impl Registry {
    /// Track `resource` for `max_age_seconds` (0 never expires). A resource
    /// with the same id is replaced.
    pub fn add_resource(&self, resource: Arc<dyn Resource>, max_age_seconds: u32) -> Result<()> {
        self.ensure_running()?;
        let id = resource.id().to_string();
        if !is_relative(&id) {
            return Err(RegistryError::ResourceNotRelative(id));
        }
        let expiration = ExpirationDetails::new(max_age_seconds, self.now_seconds());
        tracing::debug!(resource = %id, max_age_seconds, "Resource added");
        self.inner
            .resources
            .insert(id, ResourceEntry::new(resource, expiration));
        Ok(())
    }

    /// Resource with `id`. An id ending in `/` also matches the resource
    /// registered without the slash.
    pub fn get_resource(&self, id: &str) -> Option<Arc<dyn Resource>> {
        if let Some(entry) = self.inner.resources.get(id) {
            return Some(entry.value().value.clone());
        }
        let trimmed = id.strip_suffix('/')?;
        self.inner
            .resources
            .get(trimmed)
            .map(|entry| entry.value().value.clone())
    }

    pub fn remove_resource(&self, id: &str) -> bool {
        self.inner.resources.remove(id).is_some()
    }

    pub fn resources(&self) -> Vec<Arc<dyn Resource>> {
        self.inner
            .resources
            .iter()
            .map(|entry| entry.value().value.clone())
            .collect()
    }
}
